//! Identifiers
//!
//! Validated names and numbers for cluster objects. Names compare
//! case-insensitively but keep the spelling they were created with.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

// =============================================================================
// Constants
// =============================================================================

/// Smallest valid volume number
pub const VOLUME_NR_MIN: i32 = 0;

/// Largest valid volume number
pub const VOLUME_NR_MAX: i32 = 32767;

/// Smallest valid DRBD minor number
pub const MINOR_NR_MIN: u32 = 0;

/// Largest valid DRBD minor number
pub const MINOR_NR_MAX: u32 = 1_048_575;

/// Name length limits shared by all object names
pub const NAME_MIN_LENGTH: usize = 2;
pub const NAME_MAX_LENGTH: usize = 48;

fn check_name(kind: &'static str, name: &str) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidName {
        kind,
        name: name.to_string(),
        reason: reason.to_string(),
    };

    let len = name.chars().count();
    if len < NAME_MIN_LENGTH || len > NAME_MAX_LENGTH {
        return Err(invalid(&format!(
            "length must be between {} and {}",
            NAME_MIN_LENGTH, NAME_MAX_LENGTH
        )));
    }

    let mut chars = name.chars();
    if !chars.next().map_or(false, |c| c.is_ascii_alphabetic()) {
        return Err(invalid("first character must be a letter"));
    }
    if let Some(bad) = chars.find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-')) {
        return Err(invalid(&format!("invalid character '{}'", bad)));
    }
    Ok(())
}

// =============================================================================
// Object Names
// =============================================================================

macro_rules! object_name {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        pub struct $name {
            display: String,
            canonical: String,
        }

        impl $name {
            pub fn new(name: impl Into<String>) -> Result<Self> {
                let display = name.into();
                check_name($kind, &display)?;
                let canonical = display.to_ascii_uppercase();
                Ok(Self { display, canonical })
            }

            /// The name as it was entered
            pub fn as_str(&self) -> &str {
                &self.display
            }

            /// Upper-case form used for comparison
            pub fn canonical(&self) -> &str {
                &self.canonical
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                self.canonical == other.canonical
            }
        }

        impl Eq for $name {}

        impl Hash for $name {
            fn hash<H: Hasher>(&self, state: &mut H) {
                self.canonical.hash(state);
            }
        }

        impl PartialOrd for $name {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        impl Ord for $name {
            fn cmp(&self, other: &Self) -> Ordering {
                self.canonical.cmp(&other.canonical)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.display)
            }
        }

        impl std::str::FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Self::new(s)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.display)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                Self::new(raw).map_err(serde::de::Error::custom)
            }
        }
    };
}

object_name!(
    /// Cluster-unique name of a resource definition
    ResourceName,
    "resource"
);

object_name!(
    /// Name of a satellite node
    NodeName,
    "node"
);

object_name!(
    /// Name of a storage pool on a node
    StorPoolName,
    "storage pool"
);

// =============================================================================
// Volume Number
// =============================================================================

/// Number of a volume within its resource definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub struct VolumeNumber(i32);

impl VolumeNumber {
    pub fn new(value: i64) -> Result<Self> {
        if value < VOLUME_NR_MIN as i64 || value > VOLUME_NR_MAX as i64 {
            return Err(Error::InvalidVolumeNumber {
                value,
                min: VOLUME_NR_MIN,
                max: VOLUME_NR_MAX,
            });
        }
        Ok(Self(value as i32))
    }

    #[inline]
    pub fn value(&self) -> i32 {
        self.0
    }
}

impl TryFrom<i32> for VolumeNumber {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self> {
        Self::new(value as i64)
    }
}

impl From<VolumeNumber> for i32 {
    fn from(nr: VolumeNumber) -> Self {
        nr.0
    }
}

impl std::fmt::Display for VolumeNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Minor Number
// =============================================================================

/// DRBD device minor number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct MinorNumber(u32);

impl MinorNumber {
    pub fn new(value: i64) -> Result<Self> {
        if value < MINOR_NR_MIN as i64 || value > MINOR_NR_MAX as i64 {
            return Err(Error::InvalidMinorNumber {
                value,
                reason: format!("must be in range {} - {}", MINOR_NR_MIN, MINOR_NR_MAX),
            });
        }
        Ok(Self(value as u32))
    }

    #[inline]
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl TryFrom<u32> for MinorNumber {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        Self::new(value as i64)
    }
}

impl From<MinorNumber> for u32 {
    fn from(nr: MinorNumber) -> Self {
        nr.0
    }
}

impl std::fmt::Display for MinorNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_names_compare_case_insensitive() {
        let a = ResourceName::new("rsc1").unwrap();
        let b = ResourceName::new("RSC1").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "rsc1");
        assert_eq!(a.canonical(), "RSC1");
    }

    #[test]
    fn test_invalid_names() {
        assert_matches!(ResourceName::new("r"), Err(Error::InvalidName { .. }));
        assert_matches!(NodeName::new("1node"), Err(Error::InvalidName { .. }));
        assert_matches!(NodeName::new("node 1"), Err(Error::InvalidName { .. }));
        assert!(StorPoolName::new("DfltStorPool").is_ok());
        assert!(NodeName::new("node-1_a").is_ok());
    }

    #[test]
    fn test_volume_number_range() {
        assert!(VolumeNumber::new(0).is_ok());
        assert!(VolumeNumber::new(32767).is_ok());
        assert_matches!(
            VolumeNumber::new(32768),
            Err(Error::InvalidVolumeNumber { value: 32768, .. })
        );
        assert_matches!(VolumeNumber::new(-1), Err(Error::InvalidVolumeNumber { .. }));
    }

    #[test]
    fn test_name_deserialize_validates() {
        let ok: NodeName = serde_json::from_str("\"node-a\"").unwrap();
        assert_eq!(ok.as_str(), "node-a");
        assert!(serde_json::from_str::<NodeName>("\"-bad\"").is_err());
    }
}
