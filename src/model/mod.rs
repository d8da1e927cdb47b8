//! Cluster Model Module
//!
//! Identifiers, cluster objects and the authoritative in-memory model.

pub mod cluster;
pub mod identifiers;
pub mod objects;

pub use cluster::*;
pub use identifiers::*;
pub use objects::*;
