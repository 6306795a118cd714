use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// How a file-backed system prompt combines with the request's own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SystemPromptMode {
    #[default]
    Overwrite,
    Append,
}

/// Where outbound prompts are logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PromptLogMode {
    #[default]
    None,
    Console,
    File,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8045
}

fn default_pools_path() -> String {
    "configs/provider_pools.json".to_string()
}

fn default_max_error_count() -> u32 {
    3
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_near_minutes() -> i64 {
    15
}

fn default_prompt_log_base_name() -> String {
    "prompt_log".to_string()
}

/// Runtime configuration, read from `configs/config.json` and layered with
/// environment variables in `apply_env_overrides`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GatewayConfig {
    pub host: String,
    pub server_port: u16,
    pub required_api_key: String,
    pub provider_pools_file_path: String,
    /// Consecutive failures before an account is marked unhealthy.
    pub max_error_count: u32,
    pub request_max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub request_base_delay: u64,
    pub cron_refresh_token: bool,
    /// Heartbeat interval and near-expiry threshold, in minutes.
    pub cron_near_minutes: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt_file_path: Option<String>,
    pub system_prompt_mode: SystemPromptMode,
    pub prompt_log_mode: PromptLogMode,
    pub prompt_log_base_name: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            server_port: default_port(),
            required_api_key: String::new(),
            provider_pools_file_path: default_pools_path(),
            max_error_count: default_max_error_count(),
            request_max_retries: default_max_retries(),
            request_base_delay: default_base_delay(),
            cron_refresh_token: default_true(),
            cron_near_minutes: default_near_minutes(),
            system_prompt_file_path: None,
            system_prompt_mode: SystemPromptMode::default(),
            prompt_log_mode: PromptLogMode::default(),
            prompt_log_base_name: default_prompt_log_base_name(),
        }
    }
}

impl GatewayConfig {
    /// Load `configs/config.json`, falling back to defaults when absent.
    pub fn load(path: &str) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    warn!("Failed to parse {}: {}, using defaults", path, e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Environment variables win over the config file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("HOST") {
            if !host.trim().is_empty() {
                self.host = host;
            }
        }
        if let Some(port) = std::env::var("SERVER_PORT")
            .ok()
            .and_then(|p| p.parse::<u16>().ok())
        {
            info!("Using port from environment variable: {}", port);
            self.server_port = port;
        }
        if let Ok(key) = std::env::var("REQUIRED_API_KEY") {
            if !key.trim().is_empty() {
                info!("Using API key from environment variable");
                self.required_api_key = key;
            }
        }
        if let Ok(path) = std::env::var("PROVIDER_POOLS_FILE_PATH") {
            if !path.trim().is_empty() {
                self.provider_pools_file_path = path;
            }
        }
        if let Some(n) = std::env::var("MAX_ERROR_COUNT")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
        {
            self.max_error_count = n.max(1);
        }
        if let Some(n) = std::env::var("REQUEST_MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
        {
            self.request_max_retries = n;
        }
        if let Some(n) = std::env::var("REQUEST_BASE_DELAY")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            self.request_base_delay = n;
        }
        if let Ok(v) = std::env::var("CRON_REFRESH_TOKEN") {
            self.cron_refresh_token =
                matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
        if let Some(n) = std::env::var("CRON_NEAR_MINUTES")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
        {
            self.cron_near_minutes = n.max(1);
        }
        if let Ok(path) = std::env::var("SYSTEM_PROMPT_FILE_PATH") {
            if !path.trim().is_empty() {
                self.system_prompt_file_path = Some(path);
            }
        }
        if let Ok(mode) = std::env::var("SYSTEM_PROMPT_MODE") {
            match mode.to_lowercase().as_str() {
                "overwrite" => self.system_prompt_mode = SystemPromptMode::Overwrite,
                "append" => self.system_prompt_mode = SystemPromptMode::Append,
                other => warn!("Invalid SYSTEM_PROMPT_MODE: {}, ignoring", other),
            }
        }
        if let Ok(mode) = std::env::var("PROMPT_LOG_MODE") {
            match mode.to_lowercase().as_str() {
                "none" => self.prompt_log_mode = PromptLogMode::None,
                "console" => self.prompt_log_mode = PromptLogMode::Console,
                "file" => self.prompt_log_mode = PromptLogMode::File,
                other => warn!("Invalid PROMPT_LOG_MODE: {}, ignoring", other),
            }
        }
        if let Ok(name) = std::env::var("PROMPT_LOG_BASE_NAME") {
            if !name.trim().is_empty() {
                self.prompt_log_base_name = name;
            }
        }
    }
}
