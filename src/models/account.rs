use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::types::AuthMethod;

/// Model used for health probes when the account does not override it.
pub const DEFAULT_CHECK_MODEL: &str = "claude-haiku-4-5";

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_true() -> bool {
    true
}

/// One Kiro identity in the provider pool.
///
/// Serialized camelCase into `configs/provider_pools.json`; `uuid` is assigned
/// at creation and never mutated. Date-valued fields are RFC3339 strings on
/// disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolAccount {
    pub uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Absolute path to this account's OAuth credentials file.
    pub credentials_path: String,
    #[serde(default = "default_region")]
    pub region: String,
    pub auth_method: AuthMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_arn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Model IDs this account must never be selected for.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub not_supported_models: Vec<String>,
    #[serde(default = "default_true")]
    pub check_health: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_model_name: Option<String>,

    #[serde(default)]
    pub usage_count: u64,
    #[serde(default)]
    pub error_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_health_check_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_health_check_model: Option<String>,

    #[serde(default = "default_true")]
    pub is_healthy: bool,
    #[serde(default)]
    pub is_disabled: bool,
}

impl PoolAccount {
    pub fn new(credentials_path: String, auth_method: AuthMethod) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            name: None,
            credentials_path,
            region: default_region(),
            auth_method,
            profile_arn: None,
            client_id: None,
            client_secret: None,
            access_token: None,
            refresh_token: None,
            expires_at: None,
            not_supported_models: Vec::new(),
            check_health: true,
            check_model_name: None,
            usage_count: 0,
            error_count: 0,
            last_used: None,
            last_error_time: None,
            last_error_message: None,
            last_health_check_time: None,
            last_health_check_model: None,
            is_healthy: true,
            is_disabled: false,
        }
    }

    /// Whether this account may serve `model`. Filters selection only; has no
    /// bearing on health.
    pub fn supports_model(&self, model: &str) -> bool {
        !self.not_supported_models.iter().any(|m| m == model)
    }

    /// Healthy, enabled, and not excluded for the requested model.
    pub fn is_selectable(&self, requested_model: Option<&str>) -> bool {
        self.is_healthy
            && !self.is_disabled
            && requested_model.map_or(true, |m| self.supports_model(m))
    }

    pub fn probe_model(&self) -> &str {
        self.check_model_name.as_deref().unwrap_or(DEFAULT_CHECK_MODEL)
    }

    /// Sort key for LRU selection: never-used accounts sort first.
    pub fn lru_key(&self) -> (i64, u64) {
        (
            self.last_used.map(|t| t.timestamp_millis()).unwrap_or(0),
            self.usage_count,
        )
    }
}
