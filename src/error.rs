//! Error types for the DRBD controller
//!
//! Provides structured error types for the definition-mutation pipeline,
//! the durable store, the secret service and the satellite channel.

use crate::controller::response::codes;
use std::time::Duration;
use thiserror::Error;

/// Unified error type for the controller
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Validation Errors
    // =========================================================================
    #[error("Volume definition list to create is empty")]
    EmptyVolumeList,

    #[error("Invalid {kind} name '{name}': {reason}")]
    InvalidName {
        kind: &'static str,
        name: String,
        reason: String,
    },

    #[error("The specified volume number '{value}' is invalid. Volume numbers have to be in range of {min} - {max}.")]
    InvalidVolumeNumber { value: i64, min: i32, max: i32 },

    #[error("Invalid volume size: {size} bytes")]
    InvalidVolumeSize { size: u64 },

    #[error("Invalid minor number '{value}': {reason}")]
    InvalidMinorNumber { value: i64, reason: String },

    #[error("Unknown volume definition flag: {flag}")]
    InvalidFlag { flag: String },

    #[error("Invalid property '{key}': {reason}")]
    InvalidProperty { key: String, reason: String },

    #[error("Volume definition {volume_number} of resource definition '{resource}' already exists")]
    VolumeDefinitionExists { resource: String, volume_number: i32 },

    #[error("Resource definition '{resource}' already exists")]
    ResourceDefinitionExists { resource: String },

    #[error("Resource '{resource}' already exists on node '{node}'")]
    ResourceExists { resource: String, node: String },

    #[error("Node '{node}' already exists")]
    NodeExists { node: String },

    #[error("Resource definition '{resource}' not found")]
    ResourceDefinitionNotFound { resource: String },

    #[error("Node '{node}' not found")]
    NodeNotFound { node: String },

    #[error("Storage pool '{pool}' not found on node '{node}'")]
    StorPoolNotFound { node: String, pool: String },

    // =========================================================================
    // Exhaustion Errors
    // =========================================================================
    #[error("No free volume number left in resource definition '{resource}'")]
    VolumeNumberPoolExhausted { resource: String },

    #[error("No free minor number left in range {min} - {max}")]
    MinorNumberPoolExhausted { min: u32, max: u32 },

    // =========================================================================
    // Access Errors
    // =========================================================================
    #[error("Access denied: '{identity}' may not {action}")]
    AccessDenied { identity: String, action: String },

    // =========================================================================
    // Crypto Errors
    // =========================================================================
    #[error("Unable to create an encrypted volume definition without having a master key")]
    CryptoUnavailable,

    #[error("Cipher operation failed: {0}")]
    Cipher(String),

    #[error("Invalid passphrase: {reason}")]
    InvalidPassphrase { reason: String },

    #[error("The passphrase does not unlock the master key")]
    PassphraseMismatch,

    // =========================================================================
    // Store Errors
    // =========================================================================
    #[error("Store error ({backend}): {reason}")]
    Store { backend: String, reason: String },

    #[error("Unknown transaction: {tx_id}")]
    UnknownTransaction { tx_id: u64 },

    // =========================================================================
    // Satellite Errors
    // =========================================================================
    #[error("Satellite '{node}' unreachable: {reason}")]
    SatelliteUnreachable { node: String, reason: String },

    #[error("Satellite '{node}' rejected the update: {reason}")]
    SatelliteRejected { node: String, reason: String },

    #[error("Satellite '{node}' did not answer within {timeout:?}")]
    SatelliteTimeout { node: String, timeout: Duration },

    // =========================================================================
    // Context
    // =========================================================================
    #[error("{}: {source}", describe_volume(.resource, .volume_number))]
    InVolumeDefinition {
        resource: String,
        volume_number: Option<i32>,
        #[source]
        source: Box<Error>,
    },

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

fn describe_volume(resource: &str, volume_number: &Option<i32>) -> String {
    match volume_number {
        Some(nr) => format!(
            "Volume definition with number '{}' of resource definition '{}'",
            nr, resource
        ),
        None => format!("Volume definition of resource definition '{}'", resource),
    }
}

/// Error classes that decide how a failure is reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed input, aborts before any mutation
    Validation,
    /// No free number left in a pool
    ResourceExhausted,
    /// Caller lacks rights
    AccessDenied,
    /// Encryption requested without a master key
    CryptoUnavailable,
    /// A single satellite failed to apply an update
    Propagation,
    /// Defect or unexpected failure, reported with a diagnostic id
    InternalFault,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Validation => write!(f, "validation"),
            ErrorKind::ResourceExhausted => write!(f, "resource_exhausted"),
            ErrorKind::AccessDenied => write!(f, "access_denied"),
            ErrorKind::CryptoUnavailable => write!(f, "crypto_unavailable"),
            ErrorKind::Propagation => write!(f, "propagation"),
            ErrorKind::InternalFault => write!(f, "internal_fault"),
        }
    }
}

impl Error {
    /// Wrap an error with the volume definition it occurred for
    pub fn in_volume_definition(self, resource: &str, volume_number: Option<i32>) -> Self {
        match self {
            // already carries the context
            ctx @ Error::InVolumeDefinition { .. } => ctx,
            other => Error::InVolumeDefinition {
                resource: resource.to_string(),
                volume_number,
                source: Box::new(other),
            },
        }
    }

    /// The error with any context wrappers removed
    pub fn root(&self) -> &Error {
        match self {
            Error::InVolumeDefinition { source, .. } => source.root(),
            other => other,
        }
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self.root() {
            Error::EmptyVolumeList
            | Error::InvalidName { .. }
            | Error::InvalidVolumeNumber { .. }
            | Error::InvalidVolumeSize { .. }
            | Error::InvalidMinorNumber { .. }
            | Error::InvalidFlag { .. }
            | Error::InvalidProperty { .. }
            | Error::InvalidPassphrase { .. }
            | Error::VolumeDefinitionExists { .. }
            | Error::ResourceDefinitionExists { .. }
            | Error::ResourceExists { .. }
            | Error::NodeExists { .. }
            | Error::ResourceDefinitionNotFound { .. }
            | Error::NodeNotFound { .. }
            | Error::StorPoolNotFound { .. } => ErrorKind::Validation,

            Error::VolumeNumberPoolExhausted { .. } | Error::MinorNumberPoolExhausted { .. } => {
                ErrorKind::ResourceExhausted
            }

            Error::AccessDenied { .. } | Error::PassphraseMismatch => ErrorKind::AccessDenied,

            Error::CryptoUnavailable => ErrorKind::CryptoUnavailable,

            Error::SatelliteUnreachable { .. }
            | Error::SatelliteRejected { .. }
            | Error::SatelliteTimeout { .. }
            | Error::Http(_) => ErrorKind::Propagation,

            _ => ErrorKind::InternalFault,
        }
    }

    /// Low-order return code detail for this error
    pub fn detail_code(&self) -> u64 {
        match self.root() {
            Error::EmptyVolumeList => codes::WARN_EMPTY_LIST,
            Error::InvalidName { .. } => codes::FAIL_INVLD_NAME,
            Error::InvalidVolumeNumber { .. } => codes::FAIL_INVLD_VLM_NR,
            Error::InvalidVolumeSize { .. } => codes::FAIL_INVLD_VLM_SIZE,
            Error::InvalidMinorNumber { .. } => codes::FAIL_INVLD_MINOR_NR,
            Error::InvalidFlag { .. } => codes::FAIL_INVLD_FLAG,
            Error::InvalidProperty { .. } => codes::FAIL_INVLD_PROP,
            Error::InvalidPassphrase { .. } => codes::FAIL_INVLD_PASSPHRASE,
            Error::VolumeDefinitionExists { .. } => codes::FAIL_EXISTS_VLM_DFN,
            Error::ResourceDefinitionExists { .. } => codes::FAIL_EXISTS_RSC_DFN,
            Error::ResourceExists { .. } => codes::FAIL_EXISTS_RSC,
            Error::NodeExists { .. } => codes::FAIL_EXISTS_NODE,
            Error::ResourceDefinitionNotFound { .. } => codes::FAIL_NOT_FOUND_RSC_DFN,
            Error::NodeNotFound { .. } => codes::FAIL_NOT_FOUND_NODE,
            Error::StorPoolNotFound { .. } => codes::FAIL_NOT_FOUND_STOR_POOL,
            Error::VolumeNumberPoolExhausted { .. } => codes::FAIL_POOL_EXHAUSTED_VLM_NR,
            Error::MinorNumberPoolExhausted { .. } => codes::FAIL_POOL_EXHAUSTED_MINOR_NR,
            Error::AccessDenied { .. } => codes::FAIL_ACC_DENIED_VLM_DFN,
            Error::PassphraseMismatch => codes::FAIL_ACC_DENIED_PASSPHRASE,
            Error::CryptoUnavailable => codes::FAIL_NOT_FOUND_CRYPT_KEY,
            Error::SatelliteUnreachable { .. }
            | Error::SatelliteRejected { .. }
            | Error::SatelliteTimeout { .. }
            | Error::Http(_) => codes::FAIL_SATELLITE_UPDATE,
            Error::Store { .. } | Error::UnknownTransaction { .. } => codes::FAIL_SQL,
            _ => codes::FAIL_IMPL_ERROR,
        }
    }

    /// Severity mask for the return code of this error
    pub fn severity_mask(&self) -> u64 {
        match self.root() {
            Error::EmptyVolumeList => codes::MASK_WARN,
            _ => codes::MASK_ERROR,
        }
    }

    /// Full return code for a failed operation on an object class
    pub fn return_code(&self, object_mask: u64, op_mask: u64) -> u64 {
        self.severity_mask() | object_mask | op_mask | self.detail_code()
    }

    /// HTTP status the transport reports for this error
    pub fn http_status(&self) -> u16 {
        match self.root() {
            Error::EmptyVolumeList => 200,
            Error::AccessDenied { .. } | Error::PassphraseMismatch => 403,
            Error::ResourceDefinitionNotFound { .. }
            | Error::NodeNotFound { .. }
            | Error::StorPoolNotFound { .. } => 404,
            Error::CryptoUnavailable
            | Error::VolumeDefinitionExists { .. }
            | Error::ResourceDefinitionExists { .. }
            | Error::ResourceExists { .. }
            | Error::NodeExists { .. } => 409,
            Error::VolumeNumberPoolExhausted { .. } | Error::MinorNumberPoolExhausted { .. } => 507,
            Error::SatelliteUnreachable { .. }
            | Error::SatelliteRejected { .. }
            | Error::SatelliteTimeout { .. }
            | Error::Http(_) => 502,
            _ => match self.kind() {
                ErrorKind::Validation => 400,
                _ => 500,
            },
        }
    }

    /// Why the operation failed, if there is more to say than the message
    pub fn cause(&self) -> Option<&'static str> {
        match self.root() {
            Error::EmptyVolumeList => {
                Some("Volume definition list that should be added to the resource is empty.")
            }
            Error::CryptoUnavailable => Some("The masterkey was not initialized yet"),
            Error::VolumeNumberPoolExhausted { .. } => {
                Some("An exception occurred during generation of a volume number.")
            }
            _ => None,
        }
    }

    /// What the operator can do about it
    pub fn correction(&self) -> Option<&'static str> {
        match self.root() {
            Error::CryptoUnavailable => Some("Create or enter the master passphrase"),
            Error::PassphraseMismatch => {
                Some("Enter the passphrase the master key was created with")
            }
            Error::ResourceDefinitionNotFound { .. } => {
                Some("Create the resource definition first")
            }
            Error::StorPoolNotFound { .. } => {
                Some("Create the storage pool on the node or select a different pool")
            }
            _ => None,
        }
    }

    /// Check if this error needs a diagnostic report
    pub fn needs_report(&self) -> bool {
        self.kind() == ErrorKind::InternalFault
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self.root(),
            Error::SatelliteUnreachable { .. }
                | Error::SatelliteTimeout { .. }
                | Error::Store { .. }
                | Error::Http(_)
        )
    }
}

/// Result type alias for the controller
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::EmptyVolumeList.kind(), ErrorKind::Validation);
        assert_eq!(
            Error::VolumeNumberPoolExhausted {
                resource: "rsc1".into()
            }
            .kind(),
            ErrorKind::ResourceExhausted
        );
        assert_eq!(Error::CryptoUnavailable.kind(), ErrorKind::CryptoUnavailable);
        assert_eq!(
            Error::Store {
                backend: "memory".into(),
                reason: "disk full".into()
            }
            .kind(),
            ErrorKind::InternalFault
        );
    }

    #[test]
    fn test_context_keeps_kind() {
        let err = Error::CryptoUnavailable.in_volume_definition("rsc1", Some(3));
        assert_eq!(err.kind(), ErrorKind::CryptoUnavailable);
        assert_eq!(err.detail_code(), codes::FAIL_NOT_FOUND_CRYPT_KEY);
        assert!(err.to_string().contains("number '3'"));
        assert!(err.to_string().contains("'rsc1'"));

        // wrapping twice keeps the inner context
        let rewrapped = err.in_volume_definition("other", None);
        assert!(rewrapped.to_string().contains("'rsc1'"));
    }

    #[test]
    fn test_error_transient() {
        let transient = Error::SatelliteTimeout {
            node: "node-1".into(),
            timeout: Duration::from_secs(5),
        };
        assert!(transient.is_transient());
        assert_eq!(transient.kind(), ErrorKind::Propagation);

        let invalid = Error::InvalidFlag {
            flag: "SHINY".into(),
        };
        assert!(!invalid.is_transient());
        assert!(!invalid.needs_report());
    }

    #[test]
    fn test_severity() {
        assert_eq!(Error::EmptyVolumeList.severity_mask(), codes::MASK_WARN);
        assert_eq!(Error::CryptoUnavailable.severity_mask(), codes::MASK_ERROR);
        assert_eq!(
            Error::CryptoUnavailable.correction(),
            Some("Create or enter the master passphrase")
        );
    }

    #[test]
    fn test_return_code_and_status() {
        let err = Error::InvalidVolumeNumber {
            value: 40000,
            min: 0,
            max: 32767,
        };
        let rc = err.return_code(codes::MASK_VLM_DFN, codes::MASK_CRT);
        assert_eq!(rc & codes::MASK_DETAIL, codes::FAIL_INVLD_VLM_NR);
        assert_eq!(rc & codes::MASK_SEVERITY, codes::MASK_ERROR);
        assert_eq!(err.http_status(), 400);

        assert_eq!(Error::CryptoUnavailable.http_status(), 409);
        assert_eq!(
            Error::AccessDenied {
                identity: "alice".into(),
                action: "set CryptPasswd".into()
            }
            .http_status(),
            403
        );
        assert_eq!(Error::Internal("bug".into()).http_status(), 500);

        assert_eq!(Error::PassphraseMismatch.kind(), ErrorKind::AccessDenied);
        assert_eq!(Error::PassphraseMismatch.http_status(), 403);
        assert_eq!(
            Error::PassphraseMismatch.detail_code(),
            codes::FAIL_ACC_DENIED_PASSPHRASE
        );
    }
}
