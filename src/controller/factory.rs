//! Volume Definition Factory
//!
//! Turns a batch of volume definition requests into staged volume
//! definitions and per-node volume placements. Every failure is wrapped
//! with the volume definition it happened for; nothing is committed here.

use super::access::{AccessContext, PropsAccessPolicy};
use super::number_pool::next_free_volume_number;
use super::secrets::{SecretService, SECRET_LENGTH};
use super::transaction::TransactionContext;
use crate::domain::ports::StoreRecord;
use crate::error::{Error, Result};
use crate::model::{
    Node, NodeName, Props, Resource, ResourceDefinition, StorPoolName, Volume, VolumeDefinition,
    VolumeDefinitionFlag, VolumeNumber, DEFAULT_STOR_POOL_NAME, KEY_DRBD_CURRENT_GI,
    KEY_STOR_POOL_CRYPT_PASSWD, KEY_STOR_POOL_NAME, NAMESPC_DRBD_OPTIONS,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Caller's description of one volume definition to create
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeDefinitionRequest {
    /// Explicit volume number, allocated when absent
    #[serde(default)]
    pub volume_number: Option<i32>,
    pub size_bytes: u64,
    #[serde(default)]
    pub flags: Vec<String>,
    /// Explicit DRBD minor number, allocated when absent
    #[serde(default)]
    pub minor_number: Option<u32>,
    #[serde(default)]
    pub props: BTreeMap<String, String>,
}

impl VolumeDefinitionRequest {
    pub fn with_size(size_bytes: u64) -> Self {
        Self {
            size_bytes,
            ..Default::default()
        }
    }

    pub fn volume_number(mut self, nr: i32) -> Self {
        self.volume_number = Some(nr);
        self
    }

    pub fn minor_number(mut self, nr: u32) -> Self {
        self.minor_number = Some(nr);
        self
    }

    pub fn flag(mut self, flag: &str) -> Self {
        self.flags.push(flag.to_string());
        self
    }

    pub fn prop(mut self, key: &str, value: &str) -> Self {
        self.props.insert(key.to_string(), value.to_string());
        self
    }
}

/// Everything the factory staged
#[derive(Debug, Clone, Default)]
pub struct FactoryOutput {
    /// Volume definitions in request order
    pub created: Vec<VolumeDefinition>,
    pub placements: Vec<Volume>,
    /// Nodes that received at least one placement
    pub node_names: BTreeSet<NodeName>,
}

/// Random DRBD generation identifier, 16 upper-case hex digits
pub fn generate_gid() -> String {
    format!("{:016X}", rand::random::<u64>())
}

/// Creates volume definitions inside an open transaction
#[derive(Debug, Clone)]
pub struct VolumeDefinitionFactory {
    secrets: Arc<SecretService>,
}

impl VolumeDefinitionFactory {
    pub fn new(secrets: Arc<SecretService>) -> Self {
        Self { secrets }
    }

    /// Create all requested volume definitions, then place each on every
    /// node that already has a resource of the definition
    #[instrument(skip_all, fields(resource = %rsc_dfn.name, count = requests.len()))]
    pub async fn create_volume_definitions(
        &self,
        access: &AccessContext,
        rsc_dfn: &ResourceDefinition,
        nodes: &BTreeMap<NodeName, Node>,
        requests: &[VolumeDefinitionRequest],
        tx: &mut TransactionContext,
    ) -> Result<FactoryOutput> {
        let mut output = FactoryOutput::default();
        let mut batch_numbers = BTreeSet::new();

        for request in requests {
            let vlm_dfn = self
                .create_one(access, rsc_dfn, request, &batch_numbers, tx)
                .await?;
            batch_numbers.insert(vlm_dfn.volume_number);
            output.created.push(vlm_dfn);
        }

        // placements only after every volume definition exists
        for vlm_dfn in &output.created {
            for rsc in rsc_dfn.iterate_resources() {
                let volume = Self::place(nodes, rsc, vlm_dfn).map_err(|e| {
                    e.in_volume_definition(rsc_dfn.name.as_str(), Some(vlm_dfn.volume_number.value()))
                })?;
                tx.stage(StoreRecord::Volume(volume.clone())).await?;
                output.node_names.insert(rsc.node_name.clone());
                output.placements.push(volume);
            }
        }

        debug!(
            created = output.created.len(),
            placements = output.placements.len(),
            "Staged volume definitions"
        );
        Ok(output)
    }

    async fn create_one(
        &self,
        access: &AccessContext,
        rsc_dfn: &ResourceDefinition,
        request: &VolumeDefinitionRequest,
        batch_numbers: &BTreeSet<VolumeNumber>,
        tx: &mut TransactionContext,
    ) -> Result<VolumeDefinition> {
        let rsc_name = rsc_dfn.name.as_str();

        let volume_number = self
            .resolve_volume_number(rsc_dfn, request, batch_numbers)
            .map_err(|e| e.in_volume_definition(rsc_name, request.volume_number))?;

        self.build(access, rsc_dfn, volume_number, request, tx)
            .await
            .map_err(|e| e.in_volume_definition(rsc_name, Some(volume_number.value())))
    }

    fn resolve_volume_number(
        &self,
        rsc_dfn: &ResourceDefinition,
        request: &VolumeDefinitionRequest,
        batch_numbers: &BTreeSet<VolumeNumber>,
    ) -> Result<VolumeNumber> {
        match request.volume_number {
            Some(value) => {
                let nr = VolumeNumber::new(value as i64)?;
                if rsc_dfn.volume_definition(nr).is_some() || batch_numbers.contains(&nr) {
                    return Err(Error::VolumeDefinitionExists {
                        resource: rsc_dfn.name.to_string(),
                        volume_number: nr.value(),
                    });
                }
                Ok(nr)
            }
            None => next_free_volume_number(
                &rsc_dfn.name,
                &rsc_dfn.used_volume_numbers(),
                batch_numbers,
            ),
        }
    }

    async fn build(
        &self,
        access: &AccessContext,
        rsc_dfn: &ResourceDefinition,
        volume_number: VolumeNumber,
        request: &VolumeDefinitionRequest,
        tx: &mut TransactionContext,
    ) -> Result<VolumeDefinition> {
        if request.size_bytes == 0 {
            return Err(Error::InvalidVolumeSize {
                size: request.size_bytes,
            });
        }
        let flags = VolumeDefinitionFlag::restore_flags(&request.flags)?;

        let mut props = Props::new();
        PropsAccessPolicy::apply(access, &mut props, &request.props)?;

        if props
            .get_prop(KEY_DRBD_CURRENT_GI, Some(NAMESPC_DRBD_OPTIONS))
            .is_none()
        {
            props.set_prop(KEY_DRBD_CURRENT_GI, generate_gid(), Some(NAMESPC_DRBD_OPTIONS))?;
        }

        if flags.contains(&VolumeDefinitionFlag::Encrypted) {
            if !self.secrets.has_master_key() {
                return Err(Error::CryptoUnavailable);
            }
            let secret = self.secrets.generate_secret_string(SECRET_LENGTH);
            let encrypted = self.secrets.encrypt_secret(secret.as_bytes())?;
            props.set_prop(KEY_STOR_POOL_CRYPT_PASSWD, BASE64.encode(encrypted), None)?;
        }

        let minor_number = tx.reserve_minor(request.minor_number)?;

        let vlm_dfn = VolumeDefinition {
            resource_name: rsc_dfn.name.clone(),
            volume_number,
            size_bytes: request.size_bytes,
            minor_number,
            flags,
            props,
        };
        tx.stage(StoreRecord::VolumeDefinition(vlm_dfn.clone())).await?;
        debug!(
            volume_number = %vlm_dfn.volume_number,
            minor = %vlm_dfn.minor_number,
            encrypted = vlm_dfn.is_encrypted(),
            "Staged volume definition"
        );
        Ok(vlm_dfn)
    }

    /// Pool from the volume definition, else the resource, else the default
    fn resolve_stor_pool(rsc: &Resource, vlm_dfn: &VolumeDefinition) -> Result<StorPoolName> {
        if let Some(name) = vlm_dfn.props.get_prop(KEY_STOR_POOL_NAME, None) {
            return StorPoolName::new(name);
        }
        match &rsc.default_stor_pool {
            Some(pool) => Ok(pool.clone()),
            None => StorPoolName::new(DEFAULT_STOR_POOL_NAME),
        }
    }

    /// Volume placement of a volume definition on a resource's node
    pub fn place(
        nodes: &BTreeMap<NodeName, Node>,
        rsc: &Resource,
        vlm_dfn: &VolumeDefinition,
    ) -> Result<Volume> {
        let node = nodes.get(&rsc.node_name).ok_or_else(|| {
            Error::Internal(format!(
                "resource {} is placed on unknown node {}",
                rsc.resource_name, rsc.node_name
            ))
        })?;

        let pool = Self::resolve_stor_pool(rsc, vlm_dfn)?;
        if !node.has_pool(&pool) {
            return Err(Error::StorPoolNotFound {
                node: node.name.to_string(),
                pool: pool.to_string(),
            });
        }

        Ok(Volume {
            resource_name: vlm_dfn.resource_name.clone(),
            node_name: rsc.node_name.clone(),
            volume_number: vlm_dfn.volume_number,
            stor_pool: pool,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::number_pool::MinorNumberPool;
    use crate::error::ErrorKind;
    use crate::model::{MinorNumber, ResourceName};
    use crate::store::MemoryStore;
    use assert_matches::assert_matches;

    struct Fixture {
        factory: VolumeDefinitionFactory,
        secrets: Arc<SecretService>,
        pool: Arc<MinorNumberPool>,
        rsc_dfn: ResourceDefinition,
        nodes: BTreeMap<NodeName, Node>,
        tx: TransactionContext,
    }

    async fn fixture(node_names: &[&str]) -> Fixture {
        let secrets = Arc::new(SecretService::new());
        let pool = Arc::new(MinorNumberPool::new());
        let store = Arc::new(MemoryStore::new());
        let tx = TransactionContext::begin(store, pool.clone()).await.unwrap();

        let mut rsc_dfn = ResourceDefinition::new(ResourceName::new("rsc1").unwrap());
        let mut nodes = BTreeMap::new();
        for name in node_names {
            let node_name = NodeName::new(*name).unwrap();
            nodes.insert(
                node_name.clone(),
                Node::new(node_name.clone()).with_pool(StorPoolName::new(DEFAULT_STOR_POOL_NAME).unwrap()),
            );
            rsc_dfn.resources.insert(
                node_name.clone(),
                Resource {
                    resource_name: rsc_dfn.name.clone(),
                    node_name,
                    default_stor_pool: None,
                },
            );
        }

        Fixture {
            factory: VolumeDefinitionFactory::new(secrets.clone()),
            secrets,
            pool,
            rsc_dfn,
            nodes,
            tx,
        }
    }

    #[tokio::test]
    async fn test_creates_and_places() {
        let mut f = fixture(&["node-a", "node-b"]).await;
        let requests = vec![
            VolumeDefinitionRequest::with_size(1 << 30),
            VolumeDefinitionRequest::with_size(1 << 20),
        ];

        let out = f
            .factory
            .create_volume_definitions(&AccessContext::system(), &f.rsc_dfn, &f.nodes, &requests, &mut f.tx)
            .await
            .unwrap();

        let numbers: Vec<i32> = out.created.iter().map(|v| v.volume_number.value()).collect();
        assert_eq!(numbers, vec![0, 1]);
        assert_eq!(out.placements.len(), 4);
        assert_eq!(out.node_names.len(), 2);
        assert_eq!(f.tx.staged().len(), 6);

        let minors: BTreeSet<MinorNumber> = out.created.iter().map(|v| v.minor_number).collect();
        assert_eq!(minors.len(), 2);

        let gi = out.created[0]
            .props
            .get_prop(KEY_DRBD_CURRENT_GI, Some(NAMESPC_DRBD_OPTIONS))
            .unwrap();
        assert_eq!(gi.len(), 16);
        assert!(gi.chars().all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c)));
    }

    #[tokio::test]
    async fn test_keeps_existing_gi() {
        let mut f = fixture(&[]).await;
        let requests =
            vec![VolumeDefinitionRequest::with_size(1024).prop("DrbdOptions/DrbdCurrentGi", "0123456789ABCDEF")];
        let out = f
            .factory
            .create_volume_definitions(&AccessContext::system(), &f.rsc_dfn, &f.nodes, &requests, &mut f.tx)
            .await
            .unwrap();
        assert_eq!(
            out.created[0].props.get_prop(KEY_DRBD_CURRENT_GI, Some(NAMESPC_DRBD_OPTIONS)),
            Some("0123456789ABCDEF")
        );
        assert!(out.node_names.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_number_in_batch() {
        let mut f = fixture(&[]).await;
        let requests = vec![
            VolumeDefinitionRequest::with_size(1024).volume_number(3),
            VolumeDefinitionRequest::with_size(1024).volume_number(3),
        ];
        let err = f
            .factory
            .create_volume_definitions(&AccessContext::system(), &f.rsc_dfn, &f.nodes, &requests, &mut f.tx)
            .await
            .unwrap_err();
        assert_matches!(err.root(), Error::VolumeDefinitionExists { volume_number: 3, .. });
    }

    #[tokio::test]
    async fn test_invalid_inputs_carry_context() {
        let mut f = fixture(&[]).await;

        let err = f
            .factory
            .create_volume_definitions(
                &AccessContext::system(),
                &f.rsc_dfn,
                &f.nodes,
                &[VolumeDefinitionRequest::with_size(1024).volume_number(40000)],
                &mut f.tx,
            )
            .await
            .unwrap_err();
        assert_matches!(err.root(), Error::InvalidVolumeNumber { value: 40000, .. });
        assert!(err.to_string().contains("number '40000'"));

        let err = f
            .factory
            .create_volume_definitions(
                &AccessContext::system(),
                &f.rsc_dfn,
                &f.nodes,
                &[VolumeDefinitionRequest::with_size(0)],
                &mut f.tx,
            )
            .await
            .unwrap_err();
        assert_matches!(err.root(), Error::InvalidVolumeSize { .. });

        let err = f
            .factory
            .create_volume_definitions(
                &AccessContext::system(),
                &f.rsc_dfn,
                &f.nodes,
                &[VolumeDefinitionRequest::with_size(1024).flag("SHINY")],
                &mut f.tx,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_encrypted_needs_master_key() {
        let mut f = fixture(&[]).await;
        let requests = vec![VolumeDefinitionRequest::with_size(1024).flag("ENCRYPTED")];

        let err = f
            .factory
            .create_volume_definitions(&AccessContext::system(), &f.rsc_dfn, &f.nodes, &requests, &mut f.tx)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CryptoUnavailable);
        assert_eq!(f.pool.reserved_count(), 0);
    }

    #[tokio::test]
    async fn test_encrypted_secret_decrypts() {
        let mut f = fixture(&[]).await;
        f.secrets.set_master_key(&[9u8; 32]).unwrap();
        let requests = vec![VolumeDefinitionRequest::with_size(1024).flag("encrypted")];

        let out = f
            .factory
            .create_volume_definitions(&AccessContext::system(), &f.rsc_dfn, &f.nodes, &requests, &mut f.tx)
            .await
            .unwrap();
        let stored = out.created[0].props.get_prop(KEY_STOR_POOL_CRYPT_PASSWD, None).unwrap();
        let secret = f.secrets.decrypt_secret(&BASE64.decode(stored).unwrap()).unwrap();
        assert_eq!(secret.len(), SECRET_LENGTH);
        assert!(secret.iter().all(|b| b.is_ascii_alphanumeric()));
    }

    #[tokio::test]
    async fn test_user_cannot_set_protected_prop() {
        let mut f = fixture(&[]).await;
        let requests = vec![VolumeDefinitionRequest::with_size(1024).prop("CryptPasswd", "x")];
        let err = f
            .factory
            .create_volume_definitions(&AccessContext::user("alice"), &f.rsc_dfn, &f.nodes, &requests, &mut f.tx)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AccessDenied);
    }

    #[tokio::test]
    async fn test_crypt_passwd_is_never_caller_supplied() {
        let mut f = fixture(&[]).await;
        f.secrets.set_master_key(&[9u8; 32]).unwrap();

        for request in [
            VolumeDefinitionRequest::with_size(1024).prop("CryptPasswd", "forged"),
            VolumeDefinitionRequest::with_size(1024)
                .flag("ENCRYPTED")
                .prop("CryptPasswd", "forged"),
        ] {
            let err = f
                .factory
                .create_volume_definitions(&AccessContext::system(), &f.rsc_dfn, &f.nodes, &[request], &mut f.tx)
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::AccessDenied);
        }
        assert!(f.tx.staged().is_empty());
        assert_eq!(f.pool.reserved_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_stor_pool() {
        let mut f = fixture(&["node-a"]).await;
        let requests = vec![VolumeDefinitionRequest::with_size(1024).prop("StorPoolName", "fast")];
        let err = f
            .factory
            .create_volume_definitions(&AccessContext::system(), &f.rsc_dfn, &f.nodes, &requests, &mut f.tx)
            .await
            .unwrap_err();
        assert_matches!(err.root(), Error::StorPoolNotFound { .. });
    }
}
