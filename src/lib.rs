//! DRBD Controller - Definition Mutation Pipeline
//!
//! Controller core of a DRBD-based software-defined storage cluster. Creates
//! volume definitions inside resource definitions, commits them atomically
//! and pushes the committed state to every satellite node that hosts the
//! resource.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                          REST API (axum)                              │
//! ├───────────────────────────────────────────────────────────────────────┤
//! │                    Controller (mutation pipeline)                     │
//! │  ┌──────────────┐ ┌──────────────┐ ┌──────────────┐ ┌──────────────┐  │
//! │  │    Lock      │ │ Transaction  │ │  Definition  │ │   Secret     │  │
//! │  │ Coordinator  │ │   Context    │ │   Factory    │ │   Service    │  │
//! │  └──────────────┘ └──────┬───────┘ └──────────────┘ └──────────────┘  │
//! │                          │                                            │
//! │        ┌─────────────────┴────────┐   ┌─────────────────────────────┐ │
//! │        │      Cluster Model       │   │ Satellite Update Coordinator│ │
//! │        └──────────────────────────┘   └──────────────┬──────────────┘ │
//! ├──────────────────────────────────────────────────────┼────────────────┤
//! │  Durable Store (memory / JSON file)                  │ Satellites     │
//! └──────────────────────────────────────────────────────┴────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controller`]: Mutation pipeline and its services
//! - [`model`]: Identifiers, cluster objects and the in-memory model
//! - [`store`]: Durable store adapters
//! - [`satellite`]: Satellite channel adapters
//! - [`api`]: REST API
//! - [`domain`]: Port definitions
//! - [`error`]: Error types and handling

pub mod api;
pub mod config;
pub mod controller;
pub mod domain;
pub mod error;
pub mod model;
pub mod satellite;
pub mod store;

// Re-export commonly used types
pub use api::{ApiServer, ApiServerConfig, RestRouter};

pub use config::ControllerConfig;

pub use controller::{
    AccessContext, ApiCallRc, ApiCallRcEntry, Controller, ControllerEvent, MutationResult,
    PipelineMetricsSnapshot, VolumeDefinitionRequest,
};

pub use domain::ports::{
    DurableStore, DurableStoreRef, SatelliteAck, SatelliteChannel, SatelliteChannelRef, StoreRecord,
};

pub use error::{Error, ErrorKind, Result};

pub use model::{
    ClusterModel, MinorNumber, Node, NodeName, ResourceDefinition, ResourceName, StorPoolName,
    VolumeDefinition, VolumeNumber,
};

pub use satellite::{HttpSatelliteChannel, SatelliteEndpoint};

pub use store::{JsonFileStore, MemoryStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
