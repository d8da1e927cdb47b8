//! Satellite Channels
//!
//! Adapters of the [`SatelliteChannel`](crate::domain::ports::SatelliteChannel)
//! port that reach satellites over the network.

pub mod http;

pub use http::{HttpSatelliteChannel, SatelliteEndpoint};
