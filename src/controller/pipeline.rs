//! Mutation Pipeline
//!
//! Composes the controller services into request handlers:
//! acquire locks → build inside a transaction → commit → fan out to
//! satellites → aggregate → release locks. Every request yields exactly
//! one ordered result list.

use super::access::{AccessContext, PropsAccessPolicy};
use super::events::ControllerEvent;
use super::factory::{VolumeDefinitionFactory, VolumeDefinitionRequest};
use super::locks::{LockCoordinator, LockObj, LockRequest, LockScope, LockTarget};
use super::metrics::PipelineMetrics;
use super::number_pool::{MinorNumberPool, MinorNumberPoolRef};
use super::reporter::ErrorReporter;
use super::response::{
    codes, ApiCallRc, MutationResult, ResponseAggregator, ResponseContext, OBJ_REF_NODE_NAME,
    OBJ_REF_RSC_NAME, OBJ_REF_VLM_NR,
};
use super::satellite::{PropagationContext, SatelliteUpdateCoordinator};
use super::secrets::SecretService;
use super::transaction::TransactionContext;
use crate::config::ControllerConfig;
use crate::domain::ports::{
    DurableStoreRef, MasterKeyRecord, ResourceDefinitionRecord, SatelliteChannelRef, StoreRecord,
};
use crate::error::{Error, Result};
use crate::model::{
    ClusterModel, Node, NodeName, Props, Resource, ResourceName, StorPoolName, VolumeDefinition,
    VolumeNumber,
};
use futures::StreamExt;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

const VLM_DFN_PROPAGATION: PropagationContext = PropagationContext::new(
    codes::MASK_VLM_DFN,
    codes::MASK_CRT,
    "Created volume for resource {rsc} on {node}",
);

const RSC_PROPAGATION: PropagationContext = PropagationContext::new(
    codes::MASK_RSC,
    codes::MASK_CRT,
    "Deployed resource {rsc} on {node}",
);

/// The controller: process-wide services wired together
pub struct Controller {
    config: ControllerConfig,
    model: Arc<ClusterModel>,
    store: DurableStoreRef,
    locks: LockCoordinator,
    minor_pool: MinorNumberPoolRef,
    secrets: Arc<SecretService>,
    factory: VolumeDefinitionFactory,
    satellites: SatelliteUpdateCoordinator,
    reporter: Arc<ErrorReporter>,
    metrics: Arc<PipelineMetrics>,
    event_sender: broadcast::Sender<ControllerEvent>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("store", &self.store.backend_name())
            .field("satellites", &self.satellites)
            .field("secrets", &self.secrets)
            .finish()
    }
}

impl Controller {
    /// Load the committed state from the store and wire all services
    pub async fn open(
        config: ControllerConfig,
        store: DurableStoreRef,
        channel: SatelliteChannelRef,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let records = store.load_all().await?;
        let row_count = records.len();
        let model = ClusterModel::from_records(records)?;

        let minor_pool = Arc::new(MinorNumberPool::with_range(
            config.minor_nr_min,
            config.minor_nr_max,
            config.minor_nr_auto_base,
        ));
        minor_pool.rebuild(model.used_minor_numbers());

        let secrets = Arc::new(SecretService::new());
        let (event_sender, _) = broadcast::channel(config.event_capacity);

        info!(
            backend = store.backend_name(),
            channel = channel.channel_name(),
            rows = row_count,
            "Controller opened"
        );

        Ok(Arc::new(Self {
            factory: VolumeDefinitionFactory::new(secrets.clone()),
            satellites: SatelliteUpdateCoordinator::new(channel, config.satellite_timeout),
            reporter: Arc::new(ErrorReporter::new(config.report_retention)),
            metrics: Arc::new(PipelineMetrics::new()),
            locks: LockCoordinator::new(),
            config,
            model,
            store,
            minor_pool,
            secrets,
            event_sender,
        }))
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn model(&self) -> &Arc<ClusterModel> {
        &self.model
    }

    pub fn secrets(&self) -> &Arc<SecretService> {
        &self.secrets
    }

    pub fn reporter(&self) -> &Arc<ErrorReporter> {
        &self.reporter
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    pub fn minor_pool(&self) -> &MinorNumberPoolRef {
        &self.minor_pool
    }

    /// Subscribe to controller events
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.event_sender.subscribe()
    }

    async fn lock(&self, request: LockRequest) -> Result<LockScope> {
        let started = Instant::now();
        let scope = self.locks.acquire_request(&request).await?;
        self.metrics
            .record_lock_wait(started.elapsed().as_micros() as u64);
        Ok(scope)
    }

    /// Locks of a mutation confined to one resource definition
    fn rsc_dfn_locks(rsc: &ResourceName) -> LockRequest {
        LockRequest::new()
            .read(LockTarget::Map(LockObj::NodesMap))
            .read(LockTarget::Map(LockObj::RscDfnMap))
            .write(LockTarget::ResourceDefinition(rsc.clone()))
    }

    /// Turn a failed request into its single result entry
    fn reject(&self, ctx: &ResponseContext, operation: &str, resource: &str, err: Error) -> ApiCallRc {
        let kind = err.kind();
        self.metrics.record_rejected(kind);

        let mut entry = ctx.error_entry(&err);
        if err.needs_report() {
            let id = self.reporter.report(operation, &err);
            entry = entry.with_error_id(id);
        } else {
            warn!(operation, resource, kind = %kind, error = %err, "Request rejected");
        }

        let _ = self.event_sender.send(ControllerEvent::MutationRejected {
            resource: resource.to_string(),
            kind: kind.to_string(),
            reason: err.to_string(),
        });
        ApiCallRc::single(entry)
    }

    fn require_privileged(access: &AccessContext, action: &str) -> Result<()> {
        if access.is_privileged() {
            return Ok(());
        }
        Err(Error::AccessDenied {
            identity: access.identity.clone(),
            action: action.to_string(),
        })
    }

    async fn abort(tx: TransactionContext, err: Error) -> Error {
        if let Err(rollback_err) = tx.rollback().await {
            warn!(error = %rollback_err, "Rollback failed");
        }
        err
    }

    // =========================================================================
    // Volume Definitions
    // =========================================================================

    /// Create volume definitions in a resource definition and propagate them
    #[instrument(skip(self, access, requests), fields(count = requests.len()))]
    pub async fn create_volume_definitions(
        &self,
        access: &AccessContext,
        rsc_name: &str,
        requests: &[VolumeDefinitionRequest],
    ) -> MutationResult {
        self.metrics.record_request();
        let ctx = ResponseContext::new(codes::MASK_VLM_DFN, codes::MASK_CRT)
            .with_obj_ref(OBJ_REF_RSC_NAME, rsc_name);

        if requests.is_empty() {
            let err = Error::EmptyVolumeList;
            let entry = ctx.error_entry(&err).with_details(err.cause().unwrap_or_default());
            return ApiCallRc::single(entry);
        }

        let rsc = match ResourceName::new(rsc_name) {
            Ok(rsc) => rsc,
            Err(err) => return self.reject(&ctx, "create volume definitions", rsc_name, err),
        };

        let mut scope = match self.lock(Self::rsc_dfn_locks(&rsc)).await {
            Ok(scope) => scope,
            Err(err) => return self.reject(&ctx, "create volume definitions", rsc_name, err),
        };

        let (created, node_names) = match self.build_volume_definitions(access, &rsc, requests).await {
            Ok(out) => out,
            Err(err) => return self.reject(&ctx, "create volume definitions", rsc_name, err),
        };

        let mut local = ApiCallRc::new();
        for vlm_dfn in &created {
            let message = format!(
                "New volume definition with number '{}' of resource definition '{}' created.",
                vlm_dfn.volume_number, rsc_name
            );
            info!("{}", message);
            local.push(
                ResponseContext::new(codes::MASK_VLM_DFN, codes::MASK_CRT)
                    .with_obj_ref(OBJ_REF_RSC_NAME, rsc_name)
                    .with_obj_ref(OBJ_REF_VLM_NR, vlm_dfn.volume_number)
                    .success_entry(codes::CREATED, message),
            );
        }
        self.metrics.record_created(created.len() as u64);
        let _ = self
            .event_sender
            .send(ControllerEvent::VolumeDefinitionsCreated {
                resource: rsc.to_string(),
                volume_numbers: created.iter().map(|v| v.volume_number.value()).collect(),
                nodes: node_names.iter().map(|n| n.to_string()).collect(),
            });

        let result = self
            .propagate(local, &rsc, &node_names, &VLM_DFN_PROPAGATION)
            .await;
        scope.release();
        result
    }

    async fn build_volume_definitions(
        &self,
        access: &AccessContext,
        rsc: &ResourceName,
        requests: &[VolumeDefinitionRequest],
    ) -> Result<(Vec<VolumeDefinition>, BTreeSet<NodeName>)> {
        let rsc_dfn = self
            .model
            .resource_definition(rsc)
            .ok_or_else(|| Error::ResourceDefinitionNotFound {
                resource: rsc.to_string(),
            })?;
        let nodes = self.model.nodes();

        let mut tx = TransactionContext::begin(self.store.clone(), self.minor_pool.clone()).await?;
        let output = match self
            .factory
            .create_volume_definitions(access, &rsc_dfn, &nodes, requests, &mut tx)
            .await
        {
            Ok(output) => output,
            Err(err) => return Err(Self::abort(tx, err).await),
        };

        tx.commit(&self.model).await?;
        self.metrics.record_commit();
        Ok((output.created, output.node_names))
    }

    /// Fan out to the nodes and append their outcomes to the local entries
    async fn propagate(
        &self,
        local: ApiCallRc,
        rsc: &ResourceName,
        node_names: &BTreeSet<NodeName>,
        propagation: &PropagationContext,
    ) -> MutationResult {
        let propagation = *propagation;
        let metrics = self.metrics.clone();
        let reporter = self.reporter.clone();
        let events = self.event_sender.clone();
        let resource = rsc.clone();

        let remote = self.satellites.propagate(rsc, node_names).map(move |outcome| {
            metrics.record_satellite_update(outcome.is_success());
            let event = match &outcome.result {
                Ok(_) => ControllerEvent::SatelliteUpdated {
                    resource: resource.to_string(),
                    node: outcome.node.to_string(),
                },
                Err(err) => ControllerEvent::SatelliteUpdateFailed {
                    resource: resource.to_string(),
                    node: outcome.node.to_string(),
                    reason: err.to_string(),
                },
            };
            let _ = events.send(event);
            outcome.into_entry(&resource, &propagation, &reporter)
        });

        ResponseAggregator::combine(local, remote).await
    }

    /// Committed volume definitions of a resource definition
    pub async fn list_volume_definitions(&self, rsc_name: &str) -> Result<Vec<VolumeDefinition>> {
        let rsc = ResourceName::new(rsc_name)?;
        let _scope = self
            .lock(
                LockRequest::new()
                    .read(LockTarget::Map(LockObj::RscDfnMap))
                    .read(LockTarget::ResourceDefinition(rsc.clone())),
            )
            .await?;
        self.model
            .volume_definitions(&rsc)
            .ok_or(Error::ResourceDefinitionNotFound {
                resource: rsc_name.to_string(),
            })
    }

    // =========================================================================
    // Administrative Operations
    // =========================================================================

    /// Create an empty resource definition
    pub async fn create_resource_definition(
        &self,
        access: &AccessContext,
        rsc_name: &str,
        props: &BTreeMap<String, String>,
    ) -> MutationResult {
        self.metrics.record_request();
        let ctx = ResponseContext::new(codes::MASK_RSC_DFN, codes::MASK_CRT)
            .with_obj_ref(OBJ_REF_RSC_NAME, rsc_name);

        match self.build_resource_definition(access, rsc_name, props).await {
            Ok(rsc) => {
                let message = format!("New resource definition '{}' created.", rsc);
                info!("{}", message);
                let _ = self
                    .event_sender
                    .send(ControllerEvent::ResourceDefinitionCreated {
                        resource: rsc.to_string(),
                    });
                ApiCallRc::single(ctx.success_entry(codes::CREATED, message))
            }
            Err(err) => self.reject(&ctx, "create resource definition", rsc_name, err),
        }
    }

    async fn build_resource_definition(
        &self,
        access: &AccessContext,
        rsc_name: &str,
        props: &BTreeMap<String, String>,
    ) -> Result<ResourceName> {
        let rsc = ResourceName::new(rsc_name)?;
        let _scope = self
            .lock(LockRequest::new().write(LockTarget::Map(LockObj::RscDfnMap)))
            .await?;

        if self.model.contains_resource_definition(&rsc) {
            return Err(Error::ResourceDefinitionExists {
                resource: rsc.to_string(),
            });
        }

        let mut record_props = Props::new();
        PropsAccessPolicy::apply(access, &mut record_props, props)?;

        let mut tx = TransactionContext::begin(self.store.clone(), self.minor_pool.clone()).await?;
        let record = StoreRecord::ResourceDefinition(ResourceDefinitionRecord {
            name: rsc.clone(),
            props: record_props,
        });
        if let Err(err) = tx.stage(record).await {
            return Err(Self::abort(tx, err).await);
        }
        tx.commit(&self.model).await?;
        self.metrics.record_commit();
        Ok(rsc)
    }

    /// Register a satellite node with its storage pools
    pub async fn register_node(
        &self,
        access: &AccessContext,
        node_name: &str,
        stor_pools: &[String],
    ) -> MutationResult {
        self.metrics.record_request();
        let ctx = ResponseContext::new(codes::MASK_NODE, codes::MASK_CRT)
            .with_obj_ref(OBJ_REF_NODE_NAME, node_name);

        let built = match Self::require_privileged(access, "register nodes") {
            Ok(()) => self.build_node(node_name, stor_pools).await,
            Err(err) => Err(err),
        };
        match built {
            Ok(node) => {
                let message = format!("New node '{}' registered.", node.name);
                info!("{}", message);
                let _ = self.event_sender.send(ControllerEvent::NodeRegistered {
                    node: node.name.to_string(),
                    stor_pools: node.stor_pools.iter().map(|p| p.to_string()).collect(),
                });
                ApiCallRc::single(ctx.success_entry(codes::CREATED, message))
            }
            Err(err) => self.reject(&ctx, "register node", node_name, err),
        }
    }

    async fn build_node(&self, node_name: &str, stor_pools: &[String]) -> Result<Node> {
        let name = NodeName::new(node_name)?;
        let node = stor_pools
            .iter()
            .map(|p| StorPoolName::new(p.as_str()))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .fold(Node::new(name.clone()), Node::with_pool);

        let _scope = self
            .lock(LockRequest::new().write(LockTarget::Map(LockObj::NodesMap)))
            .await?;
        if self.model.node(&name).is_some() {
            return Err(Error::NodeExists {
                node: name.to_string(),
            });
        }

        let mut tx = TransactionContext::begin(self.store.clone(), self.minor_pool.clone()).await?;
        if let Err(err) = tx.stage(StoreRecord::Node(node.clone())).await {
            return Err(Self::abort(tx, err).await);
        }
        tx.commit(&self.model).await?;
        self.metrics.record_commit();
        Ok(node)
    }

    /// Place a resource definition on a node
    ///
    /// Existing volume definitions are placed on the node as well, and
    /// every node of the resource definition is told about the change.
    pub async fn create_resource(
        &self,
        access: &AccessContext,
        rsc_name: &str,
        node_name: &str,
        default_stor_pool: Option<&str>,
    ) -> MutationResult {
        self.metrics.record_request();
        let ctx = ResponseContext::new(codes::MASK_RSC, codes::MASK_CRT)
            .with_obj_ref(OBJ_REF_RSC_NAME, rsc_name)
            .with_obj_ref(OBJ_REF_NODE_NAME, node_name);

        if let Err(err) = Self::require_privileged(access, "place resources") {
            return self.reject(&ctx, "create resource", rsc_name, err);
        }

        let (rsc, node) = match (ResourceName::new(rsc_name), NodeName::new(node_name)) {
            (Ok(rsc), Ok(node)) => (rsc, node),
            (Err(err), _) | (_, Err(err)) => {
                return self.reject(&ctx, "create resource", rsc_name, err)
            }
        };

        let mut scope = match self.lock(Self::rsc_dfn_locks(&rsc)).await {
            Ok(scope) => scope,
            Err(err) => return self.reject(&ctx, "create resource", rsc_name, err),
        };

        let node_names = match self.build_resource(&rsc, &node, default_stor_pool).await {
            Ok(node_names) => node_names,
            Err(err) => return self.reject(&ctx, "create resource", rsc_name, err),
        };

        let message = format!("New resource '{}' on node '{}' created.", rsc, node);
        info!("{}", message);
        let _ = self.event_sender.send(ControllerEvent::ResourceCreated {
            resource: rsc.to_string(),
            node: node.to_string(),
        });

        let local = ApiCallRc::single(ctx.success_entry(codes::CREATED, message));
        let result = self
            .propagate(local, &rsc, &node_names, &RSC_PROPAGATION)
            .await;
        scope.release();
        result
    }

    async fn build_resource(
        &self,
        rsc: &ResourceName,
        node_name: &NodeName,
        default_stor_pool: Option<&str>,
    ) -> Result<BTreeSet<NodeName>> {
        let rsc_dfn = self
            .model
            .resource_definition(rsc)
            .ok_or_else(|| Error::ResourceDefinitionNotFound {
                resource: rsc.to_string(),
            })?;
        let nodes = self.model.nodes();
        let node = nodes.get(node_name).ok_or_else(|| Error::NodeNotFound {
            node: node_name.to_string(),
        })?;
        if rsc_dfn.resources.contains_key(node_name) {
            return Err(Error::ResourceExists {
                resource: rsc.to_string(),
                node: node_name.to_string(),
            });
        }

        let default_stor_pool = default_stor_pool.map(StorPoolName::new).transpose()?;
        if let Some(pool) = &default_stor_pool {
            if !node.has_pool(pool) {
                return Err(Error::StorPoolNotFound {
                    node: node_name.to_string(),
                    pool: pool.to_string(),
                });
            }
        }
        let resource = Resource {
            resource_name: rsc.clone(),
            node_name: node_name.clone(),
            default_stor_pool,
        };

        let mut tx = TransactionContext::begin(self.store.clone(), self.minor_pool.clone()).await?;
        if let Err(err) = self.stage_resource(&mut tx, &nodes, &resource, &rsc_dfn.volume_definitions).await {
            return Err(Self::abort(tx, err).await);
        }
        tx.commit(&self.model).await?;
        self.metrics.record_commit();

        let mut node_names: BTreeSet<NodeName> = rsc_dfn.resources.keys().cloned().collect();
        node_names.insert(node_name.clone());
        debug!(resource = %rsc, nodes = node_names.len(), "Resource committed");
        Ok(node_names)
    }

    async fn stage_resource(
        &self,
        tx: &mut TransactionContext,
        nodes: &BTreeMap<NodeName, Node>,
        resource: &Resource,
        vlm_dfns: &BTreeMap<VolumeNumber, VolumeDefinition>,
    ) -> Result<()> {
        tx.stage(StoreRecord::Resource(resource.clone())).await?;
        for vlm_dfn in vlm_dfns.values() {
            let volume = VolumeDefinitionFactory::place(nodes, resource, vlm_dfn).map_err(|e| {
                e.in_volume_definition(resource.resource_name.as_str(), Some(vlm_dfn.volume_number.value()))
            })?;
            tx.stage(StoreRecord::Volume(volume)).await?;
        }
        Ok(())
    }

    // =========================================================================
    // Encryption
    // =========================================================================

    /// Unlock the master key with the operator passphrase
    ///
    /// The first passphrase ever entered creates the cluster master key.
    /// Later ones must match it; a mismatch leaves the installed key alone.
    pub async fn enter_passphrase(&self, access: &AccessContext, passphrase: &str) -> MutationResult {
        let ctx = ResponseContext::new(codes::MASK_CTRL_CONF, codes::MASK_MOD);
        match self.unlock_master_key(access, passphrase).await {
            Ok(created) => {
                let _ = self.event_sender.send(ControllerEvent::MasterKeySet);
                let message = if created {
                    "Master passphrase created."
                } else {
                    "Master passphrase accepted."
                };
                info!("{}", message);
                ApiCallRc::single(ctx.success_entry(codes::MODIFIED, message))
            }
            Err(err) => self.reject(&ctx, "enter passphrase", "", err),
        }
    }

    /// Returns whether a new master key was created
    async fn unlock_master_key(&self, access: &AccessContext, passphrase: &str) -> Result<bool> {
        Self::require_privileged(access, "enter the master passphrase")?;
        let _scope = self
            .lock(LockRequest::new().write(LockTarget::Map(LockObj::CtrlConfig)))
            .await?;

        if let Some(record) = self.model.master_key_record() {
            self.secrets.unlock(passphrase, &record)?;
            return Ok(false);
        }

        let record = self
            .secrets
            .create_master_key(passphrase, self.config.passphrase_rounds)?;
        self.persist_master_key(record.clone()).await?;
        self.secrets.unlock(passphrase, &record)?;
        Ok(true)
    }

    /// Wrap the master key under a new passphrase
    ///
    /// Requires the current passphrase. The key itself does not change, so
    /// every stored secret stays readable.
    pub async fn change_passphrase(
        &self,
        access: &AccessContext,
        old_passphrase: &str,
        new_passphrase: &str,
    ) -> MutationResult {
        let ctx = ResponseContext::new(codes::MASK_CTRL_CONF, codes::MASK_MOD);
        match self
            .rewrap_master_key(access, old_passphrase, new_passphrase)
            .await
        {
            Ok(()) => {
                let _ = self.event_sender.send(ControllerEvent::MasterKeySet);
                info!("Master passphrase changed");
                ApiCallRc::single(ctx.success_entry(codes::MODIFIED, "Master passphrase changed."))
            }
            Err(err) => self.reject(&ctx, "change passphrase", "", err),
        }
    }

    async fn rewrap_master_key(
        &self,
        access: &AccessContext,
        old_passphrase: &str,
        new_passphrase: &str,
    ) -> Result<()> {
        Self::require_privileged(access, "change the master passphrase")?;
        let _scope = self
            .lock(LockRequest::new().write(LockTarget::Map(LockObj::CtrlConfig)))
            .await?;

        let record = self
            .model
            .master_key_record()
            .ok_or_else(|| Error::InvalidPassphrase {
                reason: "no master passphrase has been created yet".into(),
            })?;
        let rewrapped = self.secrets.rewrap(
            old_passphrase,
            new_passphrase,
            &record,
            self.config.passphrase_rounds,
        )?;
        self.persist_master_key(rewrapped.clone()).await?;
        self.secrets.unlock(new_passphrase, &rewrapped)
    }

    async fn persist_master_key(&self, record: MasterKeyRecord) -> Result<()> {
        let mut tx = TransactionContext::begin(self.store.clone(), self.minor_pool.clone()).await?;
        if let Err(err) = tx.stage(StoreRecord::MasterKey(record)).await {
            return Err(Self::abort(tx, err).await);
        }
        tx.commit(&self.model).await?;
        self.metrics.record_commit();
        Ok(())
    }

    /// Check whether encrypted volume definitions can be created
    pub fn crypto_ready(&self) -> bool {
        self.secrets.has_master_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{DurableStore, SatelliteAck, SatelliteChannel};
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    struct AckAll;

    #[async_trait]
    impl SatelliteChannel for AckAll {
        async fn send_update(&self, node: &NodeName, _resource: &ResourceName) -> Result<SatelliteAck> {
            Ok(SatelliteAck {
                node: node.clone(),
                detail: None,
            })
        }

        fn channel_name(&self) -> &str {
            "ack-all"
        }
    }

    fn config() -> ControllerConfig {
        ControllerConfig {
            passphrase_rounds: 1_000,
            ..Default::default()
        }
    }

    async fn controller() -> (Arc<Controller>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let controller = Controller::open(config(), store.clone(), Arc::new(AckAll))
            .await
            .unwrap();
        (controller, store)
    }

    #[tokio::test]
    async fn test_empty_list_warns_without_change() {
        let (controller, store) = controller().await;
        let result = controller
            .create_volume_definitions(&AccessContext::system(), "rsc1", &[])
            .await;
        assert_eq!(result.len(), 1);
        assert!(result.entries()[0].is_warning());
        assert_eq!(result.entries()[0].detail(), codes::WARN_EMPTY_LIST);
        assert_eq!(store.commit_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_resource_definition() {
        let (controller, _) = controller().await;
        let result = controller
            .create_volume_definitions(
                &AccessContext::system(),
                "missing",
                &[VolumeDefinitionRequest::with_size(1024)],
            )
            .await;
        assert!(result.has_errors());
        assert_eq!(result.entries()[0].detail(), codes::FAIL_NOT_FOUND_RSC_DFN);
        assert_eq!(controller.metrics().snapshot().rejected_validation, 1);
    }

    #[tokio::test]
    async fn test_admin_ops_and_duplicates() {
        let (controller, store) = controller().await;
        let access = AccessContext::system();

        let rc = controller
            .register_node(&access, "node-a", &["DfltStorPool".to_string()])
            .await;
        assert!(!rc.has_errors());
        let rc = controller.register_node(&access, "NODE-A", &[]).await;
        assert_eq!(rc.entries()[0].detail(), codes::FAIL_EXISTS_NODE);

        let rc = controller.create_resource_definition(&access, "rsc1", &BTreeMap::new()).await;
        assert!(!rc.has_errors());
        let rc = controller.create_resource_definition(&access, "rsc1", &BTreeMap::new()).await;
        assert_eq!(rc.entries()[0].detail(), codes::FAIL_EXISTS_RSC_DFN);

        let rc = controller.create_resource(&access, "rsc1", "node-a", None).await;
        assert_eq!(rc.len(), 2);
        assert!(!rc.has_errors());
        assert_eq!(rc.entries()[1].message, "Deployed resource rsc1 on node-a");
        assert_eq!(rc.entries()[1].return_code & codes::MASK_OBJECT, codes::MASK_RSC);
        let rc = controller.create_resource(&access, "rsc1", "node-b", None).await;
        assert_eq!(rc.entries()[0].detail(), codes::FAIL_NOT_FOUND_NODE);

        let public = AccessContext::public();
        let rc = controller.register_node(&public, "node-c", &[]).await;
        assert_eq!(rc.entries()[0].detail(), codes::FAIL_ACC_DENIED_VLM_DFN);
        let rc = controller.create_resource(&public, "rsc1", "node-a", None).await;
        assert_eq!(rc.entries()[0].detail(), codes::FAIL_ACC_DENIED_VLM_DFN);

        assert_eq!(store.load_all().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_passphrase_requires_privilege() {
        let (controller, _) = controller().await;
        let mut events = controller.subscribe();

        let rc = controller
            .enter_passphrase(&AccessContext::user("alice"), "secret")
            .await;
        assert_eq!(rc.entries()[0].detail(), codes::FAIL_ACC_DENIED_VLM_DFN);
        assert!(!controller.crypto_ready());

        let rc = controller
            .enter_passphrase(&AccessContext::system(), "secret")
            .await;
        assert!(!rc.has_errors());
        assert!(controller.crypto_ready());

        // the rejection came first
        assert!(matches!(events.recv().await.unwrap(), ControllerEvent::MutationRejected { .. }));
        assert!(matches!(events.recv().await.unwrap(), ControllerEvent::MasterKeySet));
    }

    #[tokio::test]
    async fn test_second_passphrase_must_match() {
        let (controller, store) = controller().await;
        let access = AccessContext::system();

        let rc = controller.enter_passphrase(&access, "secret").await;
        assert_eq!(rc.entries()[0].message, "Master passphrase created.");
        assert!(controller.model().master_key_record().is_some());
        let commits = store.commit_count();

        let rc = controller.enter_passphrase(&access, "other").await;
        assert_eq!(rc.entries()[0].detail(), codes::FAIL_ACC_DENIED_PASSPHRASE);
        assert!(controller.crypto_ready());

        let rc = controller.enter_passphrase(&access, "secret").await;
        assert_eq!(rc.entries()[0].message, "Master passphrase accepted.");
        assert_eq!(store.commit_count(), commits);

        let rc = controller.change_passphrase(&access, "wrong", "next").await;
        assert_eq!(rc.entries()[0].detail(), codes::FAIL_ACC_DENIED_PASSPHRASE);
        let rc = controller.change_passphrase(&access, "secret", "next").await;
        assert!(!rc.has_errors(), "{:?}", rc);
        assert_eq!(store.commit_count(), commits + 1);
    }

    #[tokio::test]
    async fn test_change_needs_existing_passphrase() {
        let (controller, _) = controller().await;
        let rc = controller
            .change_passphrase(&AccessContext::system(), "a", "b")
            .await;
        assert_eq!(rc.entries()[0].detail(), codes::FAIL_INVLD_PASSPHRASE);
        assert!(!controller.crypto_ready());
    }

    #[tokio::test]
    async fn test_reopen_restores_model_and_minors() {
        let store = Arc::new(MemoryStore::new());
        {
            let controller = Controller::open(config(), store.clone(), Arc::new(AckAll))
                .await
                .unwrap();
            controller
                .create_resource_definition(&AccessContext::system(), "rsc1", &BTreeMap::new())
                .await;
            let rc = controller
                .create_volume_definitions(
                    &AccessContext::system(),
                    "rsc1",
                    &[VolumeDefinitionRequest::with_size(1024)],
                )
                .await;
            assert!(!rc.has_errors());
        }

        let controller = Controller::open(config(), store, Arc::new(AckAll))
            .await
            .unwrap();
        let vlm_dfns = controller.list_volume_definitions("rsc1").await.unwrap();
        assert_eq!(vlm_dfns.len(), 1);
        assert!(controller.minor_pool().is_reserved(vlm_dfns[0].minor_number));
    }
}
