//! Domain Ports - Collaborator trait definitions for the controller
//!
//! These traits define the boundaries between the mutation pipeline and
//! external systems: the durable store and the satellite channel.
//! Adapters implement these traits to provide concrete functionality.

use crate::error::Result;
use crate::model::{
    Node, NodeName, Props, Resource, ResourceName, Volume, VolumeDefinition,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Store Records
// =============================================================================

/// Row of a resource definition itself (children are stored as their own rows)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDefinitionRecord {
    pub name: ResourceName,
    pub props: Props,
}

/// The cluster master key, wrapped under a key derived from the operator
/// passphrase with PBKDF2-HMAC-SHA256
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterKeyRecord {
    /// Base64 salt, generated once per cluster
    pub salt: String,
    pub rounds: u32,
    /// Base64 nonce-prefixed AES-256-GCM ciphertext of the master key
    pub wrapped_key: String,
}

/// A single persisted row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "table", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StoreRecord {
    Node(Node),
    ResourceDefinition(ResourceDefinitionRecord),
    Resource(Resource),
    VolumeDefinition(VolumeDefinition),
    Volume(Volume),
    MasterKey(MasterKeyRecord),
}

impl StoreRecord {
    /// Primary key of the row, unique across tables
    pub fn key(&self) -> String {
        match self {
            StoreRecord::Node(node) => format!("NODES/{}", node.name.canonical()),
            StoreRecord::ResourceDefinition(rd) => {
                format!("RESOURCE_DEFINITIONS/{}", rd.name.canonical())
            }
            StoreRecord::Resource(rsc) => format!(
                "RESOURCES/{}/{}",
                rsc.resource_name.canonical(),
                rsc.node_name.canonical()
            ),
            StoreRecord::VolumeDefinition(vd) => format!(
                "VOLUME_DEFINITIONS/{}/{}",
                vd.resource_name.canonical(),
                vd.volume_number
            ),
            StoreRecord::Volume(vlm) => format!(
                "VOLUMES/{}/{}/{}",
                vlm.resource_name.canonical(),
                vlm.node_name.canonical(),
                vlm.volume_number
            ),
            StoreRecord::MasterKey(_) => "CTRL_CONF/MASTER_KEY".to_string(),
        }
    }

    /// Resource definition the row belongs to, if any
    pub fn resource_name(&self) -> Option<&ResourceName> {
        match self {
            StoreRecord::Node(_) | StoreRecord::MasterKey(_) => None,
            StoreRecord::ResourceDefinition(rd) => Some(&rd.name),
            StoreRecord::Resource(rsc) => Some(&rsc.resource_name),
            StoreRecord::VolumeDefinition(vd) => Some(&vd.resource_name),
            StoreRecord::Volume(vlm) => Some(&vlm.resource_name),
        }
    }

    /// Rows of parents must be applied before their children
    pub fn apply_order(&self) -> u8 {
        match self {
            StoreRecord::Node(_) | StoreRecord::MasterKey(_) => 0,
            StoreRecord::ResourceDefinition(_) => 1,
            StoreRecord::Resource(_) => 2,
            StoreRecord::VolumeDefinition(_) => 3,
            StoreRecord::Volume(_) => 4,
        }
    }
}

/// Identifier of an open store transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub u64);

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

// =============================================================================
// Durable Store Port
// =============================================================================

/// Port for the durable backing store
///
/// Writes staged under a transaction become visible only when that
/// transaction commits, and then all at once.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Open a new transaction
    async fn begin_transaction(&self) -> Result<TransactionId>;

    /// Stage a row write in an open transaction
    async fn stage_write(&self, tx: TransactionId, record: StoreRecord) -> Result<()>;

    /// Make every staged write of the transaction durable
    async fn commit(&self, tx: TransactionId) -> Result<()>;

    /// Discard every staged write of the transaction
    async fn rollback(&self, tx: TransactionId) -> Result<()>;

    /// Load all committed rows
    async fn load_all(&self) -> Result<Vec<StoreRecord>>;

    /// Get backend name
    fn backend_name(&self) -> &str;
}

// =============================================================================
// Satellite Channel Port
// =============================================================================

/// Acknowledgement of an applied update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SatelliteAck {
    pub node: NodeName,
    /// Optional message returned by the satellite
    #[serde(default)]
    pub detail: Option<String>,
}

/// Port for notifying satellites about changed resource definitions
#[async_trait]
pub trait SatelliteChannel: Send + Sync {
    /// Tell a node to apply the current state of a resource definition
    async fn send_update(&self, node: &NodeName, resource: &ResourceName) -> Result<SatelliteAck>;

    /// Get channel name
    fn channel_name(&self) -> &str;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type DurableStoreRef = Arc<dyn DurableStore>;
pub type SatelliteChannelRef = Arc<dyn SatelliteChannel>;
