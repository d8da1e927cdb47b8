//! Cluster Objects
//!
//! Nodes, resource definitions, volume definitions, resources and the
//! per-node volume placements the controller keeps in its model.

use super::identifiers::{MinorNumber, NodeName, ResourceName, StorPoolName, VolumeNumber};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// Property Keys
// =============================================================================

/// Namespace of DRBD options
pub const NAMESPC_DRBD_OPTIONS: &str = "DrbdOptions";

/// DRBD current generation identifier (inside [`NAMESPC_DRBD_OPTIONS`])
pub const KEY_DRBD_CURRENT_GI: &str = "DrbdCurrentGi";

/// Encrypted per-volume secret, base64
pub const KEY_STOR_POOL_CRYPT_PASSWD: &str = "CryptPasswd";

/// Storage pool override for a volume definition
pub const KEY_STOR_POOL_NAME: &str = "StorPoolName";

/// Pool used when neither the volume definition nor the resource names one
pub const DEFAULT_STOR_POOL_NAME: &str = "DfltStorPool";

/// Separator between property namespaces and keys
pub const PATH_SEPARATOR: char = '/';

// =============================================================================
// Props
// =============================================================================

/// Ordered, namespaced string properties
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Props {
    map: BTreeMap<String, String>,
}

impl Props {
    pub fn new() -> Self {
        Self::default()
    }

    fn full_key(key: &str, namespace: Option<&str>) -> String {
        match namespace {
            Some(ns) if !ns.is_empty() => format!("{}{}{}", ns, PATH_SEPARATOR, key),
            _ => key.to_string(),
        }
    }

    /// Check that a property path is well-formed
    pub fn validate_key(key: &str) -> Result<()> {
        let invalid = |reason: &str| Error::InvalidProperty {
            key: key.to_string(),
            reason: reason.to_string(),
        };
        if key.is_empty() {
            return Err(invalid("key is empty"));
        }
        if key.split(PATH_SEPARATOR).any(|segment| segment.is_empty()) {
            return Err(invalid("key contains an empty path segment"));
        }
        if key.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(invalid("key contains whitespace"));
        }
        Ok(())
    }

    pub fn get_prop(&self, key: &str, namespace: Option<&str>) -> Option<&str> {
        self.map
            .get(&Self::full_key(key, namespace))
            .map(String::as_str)
    }

    /// Set a property, returning the previous value
    pub fn set_prop(
        &mut self,
        key: &str,
        value: impl Into<String>,
        namespace: Option<&str>,
    ) -> Result<Option<String>> {
        let full = Self::full_key(key, namespace);
        Self::validate_key(&full)?;
        Ok(self.map.insert(full, value.into()))
    }

    pub fn remove_prop(&mut self, key: &str, namespace: Option<&str>) -> Option<String> {
        self.map.remove(&Self::full_key(key, namespace))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.map.iter()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn map(&self) -> &BTreeMap<String, String> {
        &self.map
    }
}

// =============================================================================
// Volume Definition Flags
// =============================================================================

/// Flags a volume definition can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VolumeDefinitionFlag {
    Encrypted,
    Delete,
    Resize,
    GrossSize,
}

impl VolumeDefinitionFlag {
    pub const ALL: [VolumeDefinitionFlag; 4] = [
        VolumeDefinitionFlag::Encrypted,
        VolumeDefinitionFlag::Delete,
        VolumeDefinitionFlag::Resize,
        VolumeDefinitionFlag::GrossSize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeDefinitionFlag::Encrypted => "ENCRYPTED",
            VolumeDefinitionFlag::Delete => "DELETE",
            VolumeDefinitionFlag::Resize => "RESIZE",
            VolumeDefinitionFlag::GrossSize => "GROSS_SIZE",
        }
    }

    /// Decode the external flag list into the canonical set
    pub fn restore_flags<S: AsRef<str>>(names: &[S]) -> Result<BTreeSet<VolumeDefinitionFlag>> {
        names.iter().map(|name| name.as_ref().parse()).collect()
    }
}

impl std::str::FromStr for VolumeDefinitionFlag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_uppercase();
        Self::ALL
            .iter()
            .copied()
            .find(|flag| flag.as_str() == wanted)
            .ok_or_else(|| Error::InvalidFlag {
                flag: s.to_string(),
            })
    }
}

impl std::fmt::Display for VolumeDefinitionFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Nodes
// =============================================================================

/// A satellite node and the storage pools it offers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub name: NodeName,
    pub stor_pools: BTreeSet<StorPoolName>,
}

impl Node {
    pub fn new(name: NodeName) -> Self {
        Self {
            name,
            stor_pools: BTreeSet::new(),
        }
    }

    pub fn with_pool(mut self, pool: StorPoolName) -> Self {
        self.stor_pools.insert(pool);
        self
    }

    pub fn has_pool(&self, pool: &StorPoolName) -> bool {
        self.stor_pools.contains(pool)
    }
}

// =============================================================================
// Volume Definition
// =============================================================================

/// One numbered volume of a resource definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeDefinition {
    pub resource_name: ResourceName,
    pub volume_number: VolumeNumber,
    pub size_bytes: u64,
    pub minor_number: MinorNumber,
    pub flags: BTreeSet<VolumeDefinitionFlag>,
    pub props: Props,
}

impl VolumeDefinition {
    pub fn is_encrypted(&self) -> bool {
        self.flags.contains(&VolumeDefinitionFlag::Encrypted)
    }

    /// Short human-readable description
    pub fn describe(&self) -> String {
        format!(
            "volume definition with number '{}' of resource definition '{}'",
            self.volume_number, self.resource_name
        )
    }
}

// =============================================================================
// Resources and Volumes
// =============================================================================

/// Placement of a resource definition on one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub resource_name: ResourceName,
    pub node_name: NodeName,
    /// Pool used for new volumes unless the volume definition overrides it
    pub default_stor_pool: Option<StorPoolName>,
}

/// Placement of one volume definition on one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub resource_name: ResourceName,
    pub node_name: NodeName,
    pub volume_number: VolumeNumber,
    pub stor_pool: StorPoolName,
}

// =============================================================================
// Resource Definition
// =============================================================================

/// Cluster-wide template of a replicated resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDefinition {
    pub name: ResourceName,
    pub props: Props,
    pub volume_definitions: BTreeMap<VolumeNumber, VolumeDefinition>,
    pub resources: BTreeMap<NodeName, Resource>,
    pub volumes: BTreeMap<(NodeName, VolumeNumber), Volume>,
}

impl ResourceDefinition {
    pub fn new(name: ResourceName) -> Self {
        Self {
            name,
            props: Props::new(),
            volume_definitions: BTreeMap::new(),
            resources: BTreeMap::new(),
            volumes: BTreeMap::new(),
        }
    }

    /// Volume numbers already in use
    pub fn used_volume_numbers(&self) -> BTreeSet<VolumeNumber> {
        self.volume_definitions.keys().copied().collect()
    }

    pub fn volume_definition(&self, nr: VolumeNumber) -> Option<&VolumeDefinition> {
        self.volume_definitions.get(&nr)
    }

    /// Resources in node-name order
    pub fn iterate_resources(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values()
    }
}
