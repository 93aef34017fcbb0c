use std::collections::HashMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Well-known attribute keys. Attributes carry provider-specific facts; these
/// names are the cross-provider vocabulary executors rely on.
pub const ATTR_API_KEY: &str = "api_key";
pub const ATTR_BASE_URL: &str = "base_url";
pub const ATTR_API_TYPE: &str = "api_type";
pub const ATTR_ACCOUNT_ID: &str = "account_id";
pub const ATTR_ACCOUNT_TYPE: &str = "account_type";
pub const ATTR_PRIORITY: &str = "priority";
pub const ATTR_EXPIRES_AT: &str = "expires_at";

/// Attribute value marking an auth as the fallback advertisement target.
pub const PRIORITY_FALLBACK: &str = "fallback";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStatus {
    Active,
    Disabled,
    Cooldown,
}

impl Default for AuthStatus {
    fn default() -> Self {
        AuthStatus::Active
    }
}

/// One upstream identity. Registered at startup (seeded from the file store)
/// or via admin calls; token refresh mutates attributes in place. Records are
/// never shared across identity boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Auth {
    pub id: String,
    pub provider: String,
    #[serde(default)]
    pub status: AuthStatus,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    /// Per-identity outbound proxy; overrides the global proxy when set.
    #[serde(default)]
    pub proxy_url: String,
    /// Runtime-only cooldown deadline; not persisted.
    #[serde(skip)]
    pub cooldown_until: Option<SystemTime>,
}

impl Auth {
    pub fn new(id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            status: AuthStatus::Active,
            attributes: HashMap::new(),
            proxy_url: String::new(),
            cooldown_until: None,
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .get(key)
            .map(|value| value.as_str())
            .filter(|value| !value.trim().is_empty())
    }

    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key.into(), value.into());
    }

    /// Active, or cooldown whose deadline has passed.
    pub fn eligible_at(&self, now: SystemTime) -> bool {
        match self.status {
            AuthStatus::Active => true,
            AuthStatus::Disabled => false,
            AuthStatus::Cooldown => self
                .cooldown_until
                .map(|until| until <= now)
                .unwrap_or(true),
        }
    }
}
