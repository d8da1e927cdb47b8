//! Controller Core
//!
//! The definition-mutation pipeline and the services it is built from:
//!
//! - `locks`: read/write lock scopes over cluster-model partitions
//! - `secrets`: master key and per-volume secret encryption
//! - `transaction`: staged writes with an atomic commit boundary
//! - `factory`: validation and construction of volume definitions
//! - `satellite`: concurrent fan-out of committed changes to nodes
//! - `response`: return codes and result aggregation
//! - `pipeline`: the orchestrating [`Controller`]

pub mod access;
pub mod events;
pub mod factory;
pub mod locks;
pub mod metrics;
pub mod number_pool;
pub mod pipeline;
pub mod reporter;
pub mod response;
pub mod satellite;
pub mod secrets;
pub mod transaction;

pub use access::{AccessContext, PropsAccessPolicy, Role};
pub use events::ControllerEvent;
pub use factory::{FactoryOutput, VolumeDefinitionFactory, VolumeDefinitionRequest};
pub use locks::{LockCoordinator, LockMode, LockObj, LockRequest, LockScope, LockTarget};
pub use metrics::{PipelineMetrics, PipelineMetricsSnapshot};
pub use number_pool::MinorNumberPool;
pub use pipeline::Controller;
pub use reporter::{ErrorReport, ErrorReporter};
pub use response::{ApiCallRc, ApiCallRcEntry, MutationResult, ResponseAggregator, ResponseContext};
pub use satellite::{NodeOutcome, PropagationContext, SatelliteUpdateCoordinator};
pub use secrets::SecretService;
pub use transaction::TransactionContext;
