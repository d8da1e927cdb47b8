//! Controller Events
//!
//! Events emitted by the mutation pipeline for external consumers.

use serde::{Deserialize, Serialize};

/// Events emitted by the controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControllerEvent {
    /// A batch of volume definitions was committed
    VolumeDefinitionsCreated {
        resource: String,
        volume_numbers: Vec<i32>,
        nodes: Vec<String>,
    },

    /// A mutation was rejected before commit
    MutationRejected {
        resource: String,
        kind: String,
        reason: String,
    },

    /// A resource definition was created
    ResourceDefinitionCreated { resource: String },

    /// A resource was placed on a node
    ResourceCreated { resource: String, node: String },

    /// A node was registered
    NodeRegistered { node: String, stor_pools: Vec<String> },

    /// A satellite applied an update
    SatelliteUpdated { resource: String, node: String },

    /// A satellite failed to apply an update
    SatelliteUpdateFailed {
        resource: String,
        node: String,
        reason: String,
    },

    /// The master key became available
    MasterKeySet,
}

impl ControllerEvent {
    /// Resource the event is about, if any
    pub fn resource(&self) -> Option<&str> {
        match self {
            ControllerEvent::VolumeDefinitionsCreated { resource, .. }
            | ControllerEvent::MutationRejected { resource, .. }
            | ControllerEvent::ResourceDefinitionCreated { resource }
            | ControllerEvent::ResourceCreated { resource, .. }
            | ControllerEvent::SatelliteUpdated { resource, .. }
            | ControllerEvent::SatelliteUpdateFailed { resource, .. } => Some(resource),
            ControllerEvent::NodeRegistered { .. } | ControllerEvent::MasterKeySet => None,
        }
    }

    /// Node the event is about, if any
    pub fn node(&self) -> Option<&str> {
        match self {
            ControllerEvent::ResourceCreated { node, .. }
            | ControllerEvent::NodeRegistered { node, .. }
            | ControllerEvent::SatelliteUpdated { node, .. }
            | ControllerEvent::SatelliteUpdateFailed { node, .. } => Some(node),
            _ => None,
        }
    }

    /// Check if this event reports a failure
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ControllerEvent::MutationRejected { .. } | ControllerEvent::SatelliteUpdateFailed { .. }
        )
    }
}
