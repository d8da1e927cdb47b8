//! Cluster Model
//!
//! The controller's authoritative in-memory view of nodes and resource
//! definitions. Only committed store rows are ever applied to it; callers
//! hold the matching write locks from the lock coordinator while they do.

use super::identifiers::{MinorNumber, NodeName, ResourceName};
use super::objects::{Node, ResourceDefinition, VolumeDefinition};
use crate::domain::ports::{MasterKeyRecord, StoreRecord};
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Default)]
struct ClusterState {
    nodes: BTreeMap<NodeName, Node>,
    resource_definitions: BTreeMap<ResourceName, ResourceDefinition>,
    master_key: Option<MasterKeyRecord>,
}

/// Authoritative model of the cluster
#[derive(Debug, Default)]
pub struct ClusterModel {
    state: RwLock<ClusterState>,
}

impl ClusterModel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Build a model from committed rows
    pub fn from_records(records: Vec<StoreRecord>) -> Result<Arc<Self>> {
        let model = Self::new();
        model.apply(&records)?;
        Ok(model)
    }

    /// Snapshot of a resource definition
    pub fn resource_definition(&self, name: &ResourceName) -> Option<ResourceDefinition> {
        self.state.read().resource_definitions.get(name).cloned()
    }

    pub fn contains_resource_definition(&self, name: &ResourceName) -> bool {
        self.state.read().resource_definitions.contains_key(name)
    }

    pub fn resource_definition_names(&self) -> Vec<ResourceName> {
        self.state.read().resource_definitions.keys().cloned().collect()
    }

    pub fn node(&self, name: &NodeName) -> Option<Node> {
        self.state.read().nodes.get(name).cloned()
    }

    /// Snapshot of all nodes in name order
    pub fn nodes(&self) -> BTreeMap<NodeName, Node> {
        self.state.read().nodes.clone()
    }

    /// Volume definitions of a resource definition in number order
    pub fn volume_definitions(&self, name: &ResourceName) -> Option<Vec<VolumeDefinition>> {
        self.state
            .read()
            .resource_definitions
            .get(name)
            .map(|rd| rd.volume_definitions.values().cloned().collect())
    }

    /// Wrapped master key, once a passphrase was created
    pub fn master_key_record(&self) -> Option<MasterKeyRecord> {
        self.state.read().master_key.clone()
    }

    /// Minor numbers of every volume definition in the cluster
    pub fn used_minor_numbers(&self) -> BTreeSet<MinorNumber> {
        self.state
            .read()
            .resource_definitions
            .values()
            .flat_map(|rd| rd.volume_definitions.values().map(|vd| vd.minor_number))
            .collect()
    }

    /// Apply committed rows
    ///
    /// The batch is checked against the current state before anything is
    /// changed, so a batch referencing unknown parents leaves the model as is.
    pub fn apply(&self, records: &[StoreRecord]) -> Result<()> {
        let mut ordered: Vec<&StoreRecord> = records.iter().collect();
        ordered.sort_by_key(|r| r.apply_order());

        let mut state = self.state.write();

        // dry run against a copy of the affected part of the state
        let mut nodes = state.nodes.clone();
        let mut master_key = state.master_key.clone();
        let mut touched: BTreeMap<ResourceName, ResourceDefinition> = BTreeMap::new();

        for record in ordered {
            match record {
                StoreRecord::Node(node) => {
                    nodes.insert(node.name.clone(), node.clone());
                }
                StoreRecord::MasterKey(record) => {
                    master_key = Some(record.clone());
                }
                StoreRecord::ResourceDefinition(rd) => {
                    let entry = touched.entry(rd.name.clone()).or_insert_with(|| {
                        state
                            .resource_definitions
                            .get(&rd.name)
                            .cloned()
                            .unwrap_or_else(|| ResourceDefinition::new(rd.name.clone()))
                    });
                    entry.props = rd.props.clone();
                }
                other => {
                    let Some(name) = other.resource_name() else {
                        continue;
                    };
                    if !touched.contains_key(name) {
                        let existing = state.resource_definitions.get(name).cloned().ok_or_else(|| {
                            Error::Internal(format!(
                                "row {} references unknown resource definition",
                                other.key()
                            ))
                        })?;
                        touched.insert(name.clone(), existing);
                    }
                    let rd = touched
                        .get_mut(name)
                        .ok_or_else(|| Error::Internal("resource definition vanished".into()))?;
                    Self::apply_child(rd, &nodes, other)?;
                }
            }
        }

        state.nodes = nodes;
        state.master_key = master_key;
        for (name, rd) in touched {
            debug!(resource = %name, volumes = rd.volume_definitions.len(), "Applied committed rows");
            state.resource_definitions.insert(name, rd);
        }
        Ok(())
    }

    fn apply_child(
        rd: &mut ResourceDefinition,
        nodes: &BTreeMap<NodeName, Node>,
        record: &StoreRecord,
    ) -> Result<()> {
        match record {
            StoreRecord::Resource(rsc) => {
                if !nodes.contains_key(&rsc.node_name) {
                    return Err(Error::Internal(format!(
                        "resource {} references unknown node {}",
                        rsc.resource_name, rsc.node_name
                    )));
                }
                rd.resources.insert(rsc.node_name.clone(), rsc.clone());
            }
            StoreRecord::VolumeDefinition(vd) => {
                rd.volume_definitions.insert(vd.volume_number, vd.clone());
            }
            StoreRecord::Volume(vlm) => {
                if !rd.resources.contains_key(&vlm.node_name)
                    || !rd.volume_definitions.contains_key(&vlm.volume_number)
                {
                    return Err(Error::Internal(format!(
                        "volume {}/{}/{} has no parent",
                        vlm.resource_name, vlm.node_name, vlm.volume_number
                    )));
                }
                rd.volumes
                    .insert((vlm.node_name.clone(), vlm.volume_number), vlm.clone());
            }
            StoreRecord::Node(_) | StoreRecord::ResourceDefinition(_) | StoreRecord::MasterKey(_) => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::ResourceDefinitionRecord;
    use crate::model::{Props, Resource, StorPoolName, Volume, VolumeNumber};

    fn rsc_dfn_record(name: &str) -> StoreRecord {
        StoreRecord::ResourceDefinition(ResourceDefinitionRecord {
            name: ResourceName::new(name).unwrap(),
            props: Props::new(),
        })
    }

    fn vlm_dfn(name: &str, nr: i64, minor: i64) -> VolumeDefinition {
        VolumeDefinition {
            resource_name: ResourceName::new(name).unwrap(),
            volume_number: VolumeNumber::new(nr).unwrap(),
            size_bytes: 1 << 20,
            minor_number: MinorNumber::new(minor).unwrap(),
            flags: Default::default(),
            props: Props::new(),
        }
    }

    #[test]
    fn test_apply_builds_tree() {
        let node = NodeName::new("node-a").unwrap();
        let rsc = ResourceName::new("rsc1").unwrap();
        let pool = StorPoolName::new("pool1").unwrap();

        let model = ClusterModel::from_records(vec![
            // children first: apply order sorts them
            StoreRecord::Volume(Volume {
                resource_name: rsc.clone(),
                node_name: node.clone(),
                volume_number: VolumeNumber::new(0).unwrap(),
                stor_pool: pool.clone(),
            }),
            StoreRecord::VolumeDefinition(vlm_dfn("rsc1", 0, 1000)),
            StoreRecord::Resource(Resource {
                resource_name: rsc.clone(),
                node_name: node.clone(),
                default_stor_pool: Some(pool.clone()),
            }),
            rsc_dfn_record("rsc1"),
            StoreRecord::Node(Node::new(node.clone()).with_pool(pool)),
        ])
        .unwrap();

        let rd = model.resource_definition(&rsc).unwrap();
        assert_eq!(rd.volume_definitions.len(), 1);
        assert_eq!(rd.resources.len(), 1);
        assert_eq!(rd.volumes.len(), 1);
        assert!(model.used_minor_numbers().contains(&MinorNumber::new(1000).unwrap()));
    }

    #[test]
    fn test_apply_rejects_orphans_without_change() {
        let model = ClusterModel::from_records(vec![rsc_dfn_record("rsc1")]).unwrap();

        let result = model.apply(&[
            StoreRecord::VolumeDefinition(vlm_dfn("rsc1", 0, 1000)),
            StoreRecord::VolumeDefinition(vlm_dfn("missing", 0, 1001)),
        ]);
        assert!(result.is_err());

        let rd = model
            .resource_definition(&ResourceName::new("rsc1").unwrap())
            .unwrap();
        assert!(rd.volume_definitions.is_empty());
    }
}
