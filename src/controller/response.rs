//! Responses
//!
//! Return-code entries of a mutation and the aggregator that merges the
//! local outcome with the per-node outcomes streamed back from propagation.

use crate::error::Error;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Return code bit layout
///
/// Severity lives in the two top bits, the object class in bits 40-47,
/// the operation in bits 32-35 and the detail code in the low 32 bits.
pub mod codes {
    // severity
    pub const MASK_ERROR: u64 = 0xC000_0000_0000_0000;
    pub const MASK_WARN: u64 = 0x8000_0000_0000_0000;
    pub const MASK_INFO: u64 = 0x4000_0000_0000_0000;
    pub const MASK_SEVERITY: u64 = 0xC000_0000_0000_0000;

    // object class
    pub const MASK_NODE: u64 = 0x0000_0100_0000_0000;
    pub const MASK_RSC_DFN: u64 = 0x0000_0200_0000_0000;
    pub const MASK_RSC: u64 = 0x0000_0300_0000_0000;
    pub const MASK_VLM_DFN: u64 = 0x0000_0400_0000_0000;
    pub const MASK_CTRL_CONF: u64 = 0x0000_0500_0000_0000;
    pub const MASK_OBJECT: u64 = 0x0000_FF00_0000_0000;

    // operation
    pub const MASK_CRT: u64 = 0x0000_0001_0000_0000;
    pub const MASK_MOD: u64 = 0x0000_0002_0000_0000;
    pub const MASK_DEL: u64 = 0x0000_0003_0000_0000;
    pub const MASK_LST: u64 = 0x0000_0004_0000_0000;
    pub const MASK_OPERATION: u64 = 0x0000_000F_0000_0000;

    pub const MASK_DETAIL: u64 = 0x0000_0000_FFFF_FFFF;

    // success details
    pub const CREATED: u64 = 1;
    pub const MODIFIED: u64 = 3;
    pub const LISTED: u64 = 5;

    // warnings
    pub const WARN_EMPTY_LIST: u64 = 100;

    // failures
    pub const FAIL_INVLD_NAME: u64 = 300;
    pub const FAIL_INVLD_VLM_NR: u64 = 301;
    pub const FAIL_INVLD_VLM_SIZE: u64 = 302;
    pub const FAIL_INVLD_MINOR_NR: u64 = 303;
    pub const FAIL_INVLD_FLAG: u64 = 304;
    pub const FAIL_INVLD_PROP: u64 = 305;
    pub const FAIL_INVLD_PASSPHRASE: u64 = 306;

    pub const FAIL_NOT_FOUND_NODE: u64 = 400;
    pub const FAIL_NOT_FOUND_RSC_DFN: u64 = 401;
    pub const FAIL_NOT_FOUND_STOR_POOL: u64 = 402;
    pub const FAIL_NOT_FOUND_CRYPT_KEY: u64 = 403;

    pub const FAIL_ACC_DENIED_VLM_DFN: u64 = 500;
    pub const FAIL_ACC_DENIED_PASSPHRASE: u64 = 501;

    pub const FAIL_EXISTS_NODE: u64 = 600;
    pub const FAIL_EXISTS_RSC_DFN: u64 = 601;
    pub const FAIL_EXISTS_RSC: u64 = 602;
    pub const FAIL_EXISTS_VLM_DFN: u64 = 603;

    pub const FAIL_POOL_EXHAUSTED_VLM_NR: u64 = 700;
    pub const FAIL_POOL_EXHAUSTED_MINOR_NR: u64 = 701;

    pub const FAIL_SATELLITE_UPDATE: u64 = 800;

    pub const FAIL_SQL: u64 = 900;
    pub const FAIL_IMPL_ERROR: u64 = 999;
}

/// Object reference key for the resource name
pub const OBJ_REF_RSC_NAME: &str = "resourceName";
/// Object reference key for the volume number
pub const OBJ_REF_VLM_NR: &str = "volumeNumber";
/// Object reference key for the node name
pub const OBJ_REF_NODE_NAME: &str = "nodeName";

// =============================================================================
// Entries
// =============================================================================

/// One entry of a mutation result
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiCallRcEntry {
    pub return_code: u64,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub obj_refs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correction: Option<String>,
    /// Node the entry came from, for propagation outcomes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    /// Diagnostic report ids
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_ids: Vec<String>,
}

impl ApiCallRcEntry {
    pub fn new(return_code: u64, message: impl Into<String>) -> Self {
        Self {
            return_code,
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_obj_ref(mut self, key: &str, value: impl ToString) -> Self {
        self.obj_refs.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_obj_refs(mut self, refs: &BTreeMap<String, String>) -> Self {
        self.obj_refs
            .extend(refs.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    pub fn with_error_id(mut self, id: impl Into<String>) -> Self {
        self.error_ids.push(id.into());
        self
    }

    /// Entry describing a failed mutation
    pub fn from_error(object_mask: u64, op_mask: u64, err: &Error) -> Self {
        Self {
            return_code: err.return_code(object_mask, op_mask),
            message: err.to_string(),
            cause: err.cause().map(str::to_string),
            correction: err.correction().map(str::to_string),
            ..Default::default()
        }
    }

    pub fn severity(&self) -> u64 {
        self.return_code & codes::MASK_SEVERITY
    }

    pub fn detail(&self) -> u64 {
        self.return_code & codes::MASK_DETAIL
    }

    pub fn is_error(&self) -> bool {
        self.severity() == codes::MASK_ERROR
    }

    pub fn is_warning(&self) -> bool {
        self.severity() == codes::MASK_WARN
    }

    /// Neither an error nor a warning
    pub fn is_success(&self) -> bool {
        !self.is_error() && !self.is_warning()
    }
}

/// Ordered list of entries returned for one mutation request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApiCallRc {
    entries: Vec<ApiCallRcEntry>,
}

impl ApiCallRc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(entry: ApiCallRcEntry) -> Self {
        Self {
            entries: vec![entry],
        }
    }

    pub fn push(&mut self, entry: ApiCallRcEntry) {
        self.entries.push(entry);
    }

    pub fn extend(&mut self, other: ApiCallRc) {
        self.entries.extend(other.entries);
    }

    pub fn entries(&self) -> &[ApiCallRcEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<ApiCallRcEntry> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_errors(&self) -> bool {
        self.entries.iter().any(ApiCallRcEntry::is_error)
    }

    pub fn has_warnings(&self) -> bool {
        self.entries.iter().any(ApiCallRcEntry::is_warning)
    }
}

impl IntoIterator for ApiCallRc {
    type Item = ApiCallRcEntry;
    type IntoIter = std::vec::IntoIter<ApiCallRcEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// The result of a mutation request
pub type MutationResult = ApiCallRc;

// =============================================================================
// Response Context
// =============================================================================

/// Object class, operation and object references of a request
///
/// Stamped onto every entry that describes the request as a whole.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseContext {
    pub object_mask: u64,
    pub op_mask: u64,
    pub obj_refs: BTreeMap<String, String>,
}

impl ResponseContext {
    pub fn new(object_mask: u64, op_mask: u64) -> Self {
        Self {
            object_mask,
            op_mask,
            obj_refs: BTreeMap::new(),
        }
    }

    pub fn with_obj_ref(mut self, key: &str, value: impl ToString) -> Self {
        self.obj_refs.insert(key.to_string(), value.to_string());
        self
    }

    /// Entry for a failure of the whole request
    pub fn error_entry(&self, err: &Error) -> ApiCallRcEntry {
        ApiCallRcEntry::from_error(self.object_mask, self.op_mask, err).with_obj_refs(&self.obj_refs)
    }

    /// Entry for a success detail
    pub fn success_entry(&self, detail: u64, message: impl Into<String>) -> ApiCallRcEntry {
        ApiCallRcEntry::new(self.object_mask | self.op_mask | detail, message)
            .with_obj_refs(&self.obj_refs)
    }
}

// =============================================================================
// Aggregator
// =============================================================================

/// Merges the local outcome with the remote outcomes
#[derive(Debug, Default, Clone, Copy)]
pub struct ResponseAggregator;

impl ResponseAggregator {
    /// Local entries first, then remote entries in arrival order
    ///
    /// Drains the remote stream to its end, so the result is complete once
    /// every node has answered or failed.
    pub async fn combine<S>(local: ApiCallRc, remote: S) -> MutationResult
    where
        S: Stream<Item = ApiCallRcEntry>,
    {
        let mut result = local;
        futures::pin_mut!(remote);
        while let Some(entry) = remote.next().await {
            result.push(entry);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_classes() {
        let created = ApiCallRcEntry::new(
            codes::MASK_VLM_DFN | codes::MASK_CRT | codes::CREATED,
            "created",
        );
        assert!(created.is_success());
        assert_eq!(created.detail(), codes::CREATED);

        let err = Error::CryptoUnavailable;
        let entry = ApiCallRcEntry::from_error(codes::MASK_VLM_DFN, codes::MASK_CRT, &err);
        assert!(entry.is_error());
        assert_eq!(entry.detail(), codes::FAIL_NOT_FOUND_CRYPT_KEY);
        assert_eq!(entry.return_code & codes::MASK_OBJECT, codes::MASK_VLM_DFN);
        assert!(entry.correction.is_some());

        let warn = ApiCallRcEntry::from_error(codes::MASK_VLM_DFN, codes::MASK_CRT, &Error::EmptyVolumeList);
        assert!(warn.is_warning());
        assert!(!warn.is_error());
    }

    #[test]
    fn test_context_stamps_obj_refs() {
        let ctx = ResponseContext::new(codes::MASK_VLM_DFN, codes::MASK_CRT)
            .with_obj_ref(OBJ_REF_RSC_NAME, "rsc1");
        let entry = ctx.success_entry(codes::CREATED, "ok");
        assert_eq!(entry.obj_refs.get(OBJ_REF_RSC_NAME).map(String::as_str), Some("rsc1"));
        assert_eq!(
            entry.return_code,
            codes::MASK_VLM_DFN | codes::MASK_CRT | codes::CREATED
        );
    }

    #[tokio::test]
    async fn test_combine_keeps_local_first() {
        let local = ApiCallRc::single(ApiCallRcEntry::new(codes::CREATED, "local"));
        let remote = futures::stream::iter(vec![
            ApiCallRcEntry::new(codes::CREATED, "node-b").with_node("node-b"),
            ApiCallRcEntry::new(codes::CREATED, "node-a").with_node("node-a"),
        ]);

        let result = ResponseAggregator::combine(local, remote).await;
        let messages: Vec<_> = result.entries().iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["local", "node-b", "node-a"]);
    }

    #[test]
    fn test_json_shape() {
        let entry = ApiCallRcEntry::new(codes::CREATED, "ok").with_obj_ref(OBJ_REF_VLM_NR, 0);
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["returnCode"], 1);
        assert_eq!(json["objRefs"]["volumeNumber"], "0");
        assert!(json.get("details").is_none());
    }
}
