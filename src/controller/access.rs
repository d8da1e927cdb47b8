//! Access Control
//!
//! Identity of the caller and the policy that decides which volume
//! definition properties it may set.

use crate::error::{Error, Result};
use crate::model::{Props, KEY_STOR_POOL_CRYPT_PASSWD};
use serde::{Deserialize, Serialize};

/// Role of an API caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    SysAdmin,
    User,
}

/// Who is asking
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessContext {
    pub identity: String,
    pub role: Role,
}

impl AccessContext {
    /// The controller acting on its own behalf
    pub fn system() -> Self {
        Self {
            identity: "SYSTEM".to_string(),
            role: Role::SysAdmin,
        }
    }

    pub fn user(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            role: Role::User,
        }
    }

    pub fn public() -> Self {
        Self::user("PUBLIC")
    }

    pub fn is_privileged(&self) -> bool {
        self.role == Role::SysAdmin
    }
}

/// Property namespaces only privileged callers may set
pub const PROTECTED_PROP_PREFIXES: [&str; 2] = ["Internal/", "Sys/"];

/// Properties only the controller itself writes, never a caller
pub const CONTROLLER_ONLY_KEYS: [&str; 1] = [KEY_STOR_POOL_CRYPT_PASSWD];

/// Policy for caller-supplied volume definition properties
#[derive(Debug, Clone, Copy, Default)]
pub struct PropsAccessPolicy;

impl PropsAccessPolicy {
    pub fn is_protected(key: &str) -> bool {
        PROTECTED_PROP_PREFIXES
            .iter()
            .any(|prefix| key.starts_with(prefix))
    }

    pub fn is_controller_only(key: &str) -> bool {
        CONTROLLER_ONLY_KEYS.contains(&key)
    }

    /// Check one key the caller wants to set
    pub fn check_key(access: &AccessContext, key: &str) -> Result<()> {
        Props::validate_key(key)?;
        let denied = Self::is_controller_only(key) || (Self::is_protected(key) && !access.is_privileged());
        if denied {
            return Err(Error::AccessDenied {
                identity: access.identity.clone(),
                action: format!("set property '{}'", key),
            });
        }
        Ok(())
    }

    /// Copy caller-supplied properties after checking every key
    pub fn apply<'a>(
        access: &AccessContext,
        target: &mut Props,
        requested: impl IntoIterator<Item = (&'a String, &'a String)>,
    ) -> Result<()> {
        for (key, value) in requested {
            Self::check_key(access, key)?;
            target.set_prop(key, value.as_str(), None)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::collections::BTreeMap;

    #[test]
    fn test_user_cannot_set_protected() {
        let user = AccessContext::user("alice");
        assert_matches!(
            PropsAccessPolicy::check_key(&user, "CryptPasswd"),
            Err(Error::AccessDenied { .. })
        );
        assert_matches!(
            PropsAccessPolicy::check_key(&user, "Internal/Owner"),
            Err(Error::AccessDenied { .. })
        );
        assert!(PropsAccessPolicy::check_key(&user, "Aux/purpose").is_ok());
        assert!(PropsAccessPolicy::check_key(&AccessContext::system(), "Sys/x").is_ok());
    }

    #[test]
    fn test_nobody_sets_crypt_passwd() {
        assert_matches!(
            PropsAccessPolicy::check_key(&AccessContext::system(), KEY_STOR_POOL_CRYPT_PASSWD),
            Err(Error::AccessDenied { .. })
        );
        // only the exact key is reserved
        assert!(PropsAccessPolicy::check_key(&AccessContext::system(), "Aux/CryptPasswd").is_ok());
    }

    #[test]
    fn test_apply_stops_on_first_denied_key() {
        let mut requested = BTreeMap::new();
        requested.insert("Aux/a".to_string(), "1".to_string());
        requested.insert("Sys/b".to_string(), "2".to_string());

        let mut props = Props::new();
        let result = PropsAccessPolicy::apply(&AccessContext::public(), &mut props, &requested);
        assert_matches!(result, Err(Error::AccessDenied { .. }));
    }

    #[test]
    fn test_apply_validates_keys() {
        let mut requested = BTreeMap::new();
        requested.insert("Aux//a".to_string(), "1".to_string());
        let mut props = Props::new();
        assert_matches!(
            PropsAccessPolicy::apply(&AccessContext::system(), &mut props, &requested),
            Err(Error::InvalidProperty { .. })
        );
    }
}
