use serde::{Deserialize, Serialize};

use crate::core::{Result, StoreError};
use crate::provider::{AuthnLevel, ImpersonationLevel, ProxyBlanket, SecurityParams};

/// Prefix the agent puts in front of every session name.
pub const DEFAULT_SESSION_PREFIX: &str = "Citrix Xen Win32 Service : ";

/// What to do with a stale session's open transaction when the session is
/// evicted by a re-open under the same name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StaleSessionPolicy {
    /// End the stale session and let the provider drop its transaction.
    #[default]
    Discard,
    /// Issue `AbortTransaction` on the stale session before ending it.
    AbortTransaction,
}

/// Provider connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Namespace serving machine information (memory, OS, hotfixes)
    pub general_namespace: String,

    /// Namespace serving the store classes
    pub store_namespace: String,

    /// Process-wide security applied after initialization
    pub security: SecurityParams,

    /// Security applied to each namespace handle
    pub proxy_blanket: ProxyBlanket,

    /// Prefix combined with the caller's session name
    pub session_prefix: String,

    /// Handling of transactions left open by an evicted session
    pub stale_session_policy: StaleSessionPolicy,
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self {
            general_namespace: "root\\CIMV2".to_string(),
            store_namespace: "root\\WMI".to_string(),
            security: SecurityParams::default(),
            proxy_blanket: ProxyBlanket::default(),
            session_prefix: DEFAULT_SESSION_PREFIX.to_string(),
            stale_session_policy: StaleSessionPolicy::default(),
        }
    }

    /// Set the general (system information) namespace
    pub fn general_namespace(mut self, namespace: &str) -> Self {
        self.general_namespace = namespace.to_string();
        self
    }

    /// Set the store namespace
    pub fn store_namespace(mut self, namespace: &str) -> Self {
        self.store_namespace = namespace.to_string();
        self
    }

    pub fn session_prefix(mut self, prefix: &str) -> Self {
        self.session_prefix = prefix.to_string();
        self
    }

    pub fn stale_session_policy(mut self, policy: StaleSessionPolicy) -> Self {
        self.stale_session_policy = policy;
        self
    }

    pub fn authn_level(mut self, level: AuthnLevel) -> Self {
        self.proxy_blanket.authn_level = level;
        self
    }

    pub fn impersonation_level(mut self, level: ImpersonationLevel) -> Self {
        self.security.impersonation_level = level;
        self.proxy_blanket.impersonation_level = level;
        self
    }

    /// Full provider-side identifier for a session called `name`
    pub fn session_identifier(&self, name: &str) -> String {
        format!("{}{}", self.session_prefix, name)
    }

    /// Parse from JSON. Missing fields take their defaults.
    ///
    /// # Examples
    ///
    /// ```
    /// # use wmi_xenstore::{ConnectionConfig, StaleSessionPolicy};
    /// let config = ConnectionConfig::from_json(
    ///     r#"{ "stale_session_policy": "AbortTransaction" }"#
    /// ).unwrap();
    /// assert_eq!(config.stale_session_policy, StaleSessionPolicy::AbortTransaction);
    /// assert_eq!(config.store_namespace, "root\\WMI");
    /// ```
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| StoreError::Config(e.to_string()))?;
        config.validate().map_err(StoreError::Config)?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| StoreError::Config(e.to_string()))
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.general_namespace.trim().is_empty() {
            return Err("general_namespace cannot be empty".to_string());
        }

        if self.store_namespace.trim().is_empty() {
            return Err("store_namespace cannot be empty".to_string());
        }

        if self.general_namespace.eq_ignore_ascii_case(&self.store_namespace) {
            return Err("general_namespace and store_namespace must differ".to_string());
        }

        if self.proxy_blanket.impersonation_level != ImpersonationLevel::Impersonate
            && self.proxy_blanket.impersonation_level != ImpersonationLevel::Delegate
        {
            return Err("the provider must be allowed to impersonate the caller".to_string());
        }

        Ok(())
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new()
    }
}
