//! Satellite Update Coordinator
//!
//! Fans a committed change out to the affected nodes. Every node is
//! contacted concurrently and its outcome is yielded as soon as it
//! arrives. A slow or failing node never affects the others, and a
//! committed change is never rolled back because a node failed.

use super::response::{codes, ApiCallRcEntry, OBJ_REF_NODE_NAME, OBJ_REF_RSC_NAME};
use super::reporter::ErrorReporter;
use crate::domain::ports::{SatelliteAck, SatelliteChannelRef};
use crate::error::{Error, ErrorKind, Result};
use crate::model::{NodeName, ResourceName};
use futures::Stream;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Default time a satellite gets to acknowledge an update
pub const DEFAULT_SATELLITE_TIMEOUT: Duration = Duration::from_secs(30);

/// How the node outcomes of one operation are reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropagationContext {
    pub object_mask: u64,
    pub op_mask: u64,
    /// Success message; `{rsc}` and `{node}` are filled in
    pub success_template: &'static str,
}

impl PropagationContext {
    pub const fn new(object_mask: u64, op_mask: u64, success_template: &'static str) -> Self {
        Self {
            object_mask,
            op_mask,
            success_template,
        }
    }

    fn success_message(&self, resource: &ResourceName, node: &NodeName) -> String {
        self.success_template
            .replace("{rsc}", resource.as_str())
            .replace("{node}", node.as_str())
    }
}

/// Result of updating one node
#[derive(Debug)]
pub struct NodeOutcome {
    pub node: NodeName,
    pub result: Result<SatelliteAck>,
}

impl NodeOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Response entry for this outcome
    ///
    /// Internal faults while talking to a node get a diagnostic report.
    pub fn into_entry(
        self,
        resource: &ResourceName,
        ctx: &PropagationContext,
        reporter: &ErrorReporter,
    ) -> ApiCallRcEntry {
        match self.result {
            Ok(ack) => {
                let entry = ApiCallRcEntry::new(
                    ctx.object_mask | ctx.op_mask | codes::CREATED,
                    ctx.success_message(resource, &self.node),
                )
                .with_obj_ref(OBJ_REF_RSC_NAME, resource)
                .with_obj_ref(OBJ_REF_NODE_NAME, &self.node)
                .with_node(self.node.as_str());
                match ack.detail {
                    Some(detail) => entry.with_details(detail),
                    None => entry,
                }
            }
            Err(err) => {
                let mut entry = ApiCallRcEntry::new(
                    codes::MASK_ERROR | ctx.object_mask | ctx.op_mask | codes::FAIL_SATELLITE_UPDATE,
                    format!(
                        "Updating resource '{}' on node '{}' failed",
                        resource, self.node
                    ),
                )
                .with_obj_ref(OBJ_REF_RSC_NAME, resource)
                .with_obj_ref(OBJ_REF_NODE_NAME, &self.node)
                .with_node(self.node.as_str())
                .with_details(err.to_string());
                if err.kind() == ErrorKind::InternalFault {
                    let id = reporter.report(&format!("update satellite {}", self.node), &err);
                    entry = entry.with_error_id(id);
                }
                entry
            }
        }
    }
}

/// Propagates committed changes to satellites
#[derive(Clone)]
pub struct SatelliteUpdateCoordinator {
    channel: SatelliteChannelRef,
    timeout: Duration,
}

impl std::fmt::Debug for SatelliteUpdateCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SatelliteUpdateCoordinator")
            .field("channel", &self.channel.channel_name())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl SatelliteUpdateCoordinator {
    pub fn new(channel: SatelliteChannelRef, timeout: Duration) -> Self {
        Self { channel, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send the update to every node; yields one outcome per node in
    /// completion order and ends after the last one
    ///
    /// The calls run on their own tasks, so dropping the stream does not
    /// cancel updates that are already under way.
    pub fn propagate(
        &self,
        resource: &ResourceName,
        nodes: &BTreeSet<NodeName>,
    ) -> impl Stream<Item = NodeOutcome> + Send + 'static {
        let (tx, mut rx) = mpsc::channel(nodes.len().max(1));

        for node in nodes {
            let tx = tx.clone();
            let channel = self.channel.clone();
            let timeout = self.timeout;
            let node = node.clone();
            let resource = resource.clone();

            tokio::spawn(async move {
                let call = {
                    let node = node.clone();
                    tokio::spawn(async move {
                        match tokio::time::timeout(timeout, channel.send_update(&node, &resource)).await {
                            Ok(result) => result,
                            Err(_) => Err(Error::SatelliteTimeout {
                                node: node.to_string(),
                                timeout,
                            }),
                        }
                    })
                };

                let result = match call.await {
                    Ok(result) => result,
                    Err(join_err) => Err(Error::Internal(format!(
                        "satellite update task for {} failed: {}",
                        node, join_err
                    ))),
                };

                match &result {
                    Ok(_) => debug!(node = %node, "Satellite acknowledged update"),
                    Err(err) => warn!(node = %node, error = %err, "Satellite update failed"),
                }

                // receiver gone means nobody waits for the outcome any more
                let _ = tx.send(NodeOutcome { node, result }).await;
            });
        }
        drop(tx);

        futures::stream::poll_fn(move |cx| rx.poll_recv(cx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::SatelliteChannel;
    use async_trait::async_trait;
    use futures::StreamExt;
    use std::sync::Arc;

    struct ScriptedChannel {
        failing: BTreeSet<String>,
        slow: BTreeSet<String>,
        panicking: BTreeSet<String>,
    }

    #[async_trait]
    impl SatelliteChannel for ScriptedChannel {
        async fn send_update(&self, node: &NodeName, _resource: &ResourceName) -> Result<SatelliteAck> {
            if self.panicking.contains(node.as_str()) {
                panic!("channel bug");
            }
            if self.slow.contains(node.as_str()) {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            if self.failing.contains(node.as_str()) {
                return Err(Error::SatelliteUnreachable {
                    node: node.to_string(),
                    reason: "connection refused".into(),
                });
            }
            Ok(SatelliteAck {
                node: node.clone(),
                detail: None,
            })
        }

        fn channel_name(&self) -> &str {
            "scripted"
        }
    }

    fn names(values: &[&str]) -> BTreeSet<NodeName> {
        values.iter().map(|v| NodeName::new(*v).unwrap()).collect()
    }

    fn set(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[tokio::test]
    async fn test_partial_failure() {
        let channel = Arc::new(ScriptedChannel {
            failing: set(&["node-b"]),
            slow: BTreeSet::new(),
            panicking: BTreeSet::new(),
        });
        let coordinator = SatelliteUpdateCoordinator::new(channel, Duration::from_secs(1));
        let rsc = ResourceName::new("rsc1").unwrap();

        let outcomes: Vec<NodeOutcome> = coordinator
            .propagate(&rsc, &names(&["node-a", "node-b", "node-c"]))
            .collect()
            .await;

        assert_eq!(outcomes.len(), 3);
        let failed: Vec<_> = outcomes.iter().filter(|o| !o.is_success()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].node.as_str(), "node-b");
    }

    #[tokio::test]
    async fn test_timeout_and_panic_become_outcomes() {
        let channel = Arc::new(ScriptedChannel {
            failing: BTreeSet::new(),
            slow: set(&["node-slow"]),
            panicking: set(&["node-bug"]),
        });
        let coordinator = SatelliteUpdateCoordinator::new(channel, Duration::from_millis(50));
        let rsc = ResourceName::new("rsc1").unwrap();
        let reporter = ErrorReporter::default();
        let ctx = PropagationContext::new(
            codes::MASK_VLM_DFN,
            codes::MASK_CRT,
            "Created volume for resource {rsc} on {node}",
        );

        let entries: Vec<ApiCallRcEntry> = coordinator
            .propagate(&rsc, &names(&["node-ok", "node-slow", "node-bug"]))
            .map(|o| o.into_entry(&rsc, &ctx, &reporter))
            .collect()
            .await;

        assert_eq!(entries.len(), 3);
        // the timed out node comes last
        assert_eq!(entries[2].node.as_deref(), Some("node-slow"));

        let ok = entries.iter().find(|e| e.node.as_deref() == Some("node-ok")).unwrap();
        assert!(ok.is_success());
        assert_eq!(ok.message, "Created volume for resource rsc1 on node-ok");

        let bug = entries.iter().find(|e| e.node.as_deref() == Some("node-bug")).unwrap();
        assert!(bug.is_error());
        assert_eq!(bug.error_ids.len(), 1);

        let slow = entries.iter().find(|e| e.node.as_deref() == Some("node-slow")).unwrap();
        assert!(slow.is_error());
        assert_eq!(slow.detail(), codes::FAIL_SATELLITE_UPDATE);
        assert_eq!(slow.return_code & codes::MASK_OBJECT, codes::MASK_VLM_DFN);
        assert!(slow.error_ids.is_empty());
    }

    #[test]
    fn test_entry_follows_context() {
        let rsc = ResourceName::new("rsc1").unwrap();
        let node = NodeName::new("node-a").unwrap();
        let ctx = PropagationContext::new(
            codes::MASK_RSC,
            codes::MASK_CRT,
            "Deployed resource {rsc} on {node}",
        );
        let reporter = ErrorReporter::default();

        let ok = NodeOutcome {
            node: node.clone(),
            result: Ok(SatelliteAck {
                node: node.clone(),
                detail: None,
            }),
        }
        .into_entry(&rsc, &ctx, &reporter);
        assert_eq!(ok.message, "Deployed resource rsc1 on node-a");
        assert_eq!(ok.return_code, codes::MASK_RSC | codes::MASK_CRT | codes::CREATED);

        let failed = NodeOutcome {
            node: node.clone(),
            result: Err(Error::SatelliteRejected {
                node: node.to_string(),
                reason: "busy".into(),
            }),
        }
        .into_entry(&rsc, &ctx, &reporter);
        assert_eq!(failed.return_code & codes::MASK_OBJECT, codes::MASK_RSC);
        assert_eq!(failed.detail(), codes::FAIL_SATELLITE_UPDATE);
    }

    #[tokio::test]
    async fn test_no_nodes_ends_immediately() {
        let channel = Arc::new(ScriptedChannel {
            failing: BTreeSet::new(),
            slow: BTreeSet::new(),
            panicking: BTreeSet::new(),
        });
        let coordinator = SatelliteUpdateCoordinator::new(channel, DEFAULT_SATELLITE_TIMEOUT);
        let outcomes: Vec<NodeOutcome> = coordinator
            .propagate(&ResourceName::new("rsc1").unwrap(), &BTreeSet::new())
            .collect()
            .await;
        assert!(outcomes.is_empty());
    }
}
