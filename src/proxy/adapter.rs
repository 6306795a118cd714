//! Per-account upstream adapter: owns the HTTP client and auth manager for
//! one pool account, and exposes generate / stream / usage / token-count
//! operations with the retry policy the pool expects.

use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::auth::config::{get_codewhisperer_host, get_machine_fingerprint, get_q_host};
use crate::auth::types::{AuthError, AuthMethod};
use crate::auth::KiroAuthManager;
use crate::models::PoolAccount;
use crate::proxy::common::errors::ErrorKind;
use crate::proxy::common::model_mapping::map_model_id;
use crate::proxy::mappers::claude::ClaudeRequest;
use crate::proxy::tokenizer::estimate_request_tokens;
use crate::proxy::upstream::parsers::parse_events_from_buffer;
use crate::proxy::upstream::request_builder::build_kiro_payload;
use crate::proxy::upstream::sse::assemble_unary_response;

/// Upstream generate timeout; streams must complete within it.
const GENERATE_TIMEOUT_SECS: u64 = 300;

#[derive(Error, Debug)]
pub enum AdapterError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Upstream returned {status}: {body}")]
    UpstreamStatus { status: u16, body: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
}

impl AdapterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AdapterError::Auth(_) => ErrorKind::AuthenticationError,
            AdapterError::UpstreamStatus { status, .. } => ErrorKind::from_status(*status),
            AdapterError::Network(e) if e.is_timeout() => ErrorKind::TimeoutError,
            AdapterError::Network(_) => ErrorKind::NetworkError,
        }
    }

    pub fn message(&self) -> String {
        self.to_string()
    }
}

/// Usage summary from the Q usage-limits endpoint.
#[allow(dead_code)] // consumed by the management surface
#[derive(Debug, Clone, serde::Serialize)]
pub struct UsageInfo {
    pub used: Option<f64>,
    pub limit: Option<f64>,
    #[serde(rename = "resetsAt")]
    pub resets_at: Option<String>,
}

pub struct KiroAdapter {
    pub account_uuid: String,
    auth: Arc<KiroAuthManager>,
    auth_method: AuthMethod,
    client: reqwest::Client,
    generate_url: String,
    usage_url: String,
    fingerprint: String,
    max_retries: u32,
    base_delay_ms: u64,
}

impl KiroAdapter {
    pub fn new(account: &PoolAccount, fallback_blob: Option<&str>, max_retries: u32, base_delay_ms: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(GENERATE_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();

        Self {
            account_uuid: account.uuid.clone(),
            auth: Arc::new(KiroAuthManager::new(account, fallback_blob)),
            auth_method: account.auth_method,
            client,
            generate_url: format!(
                "{}/generateAssistantResponse",
                get_codewhisperer_host(&account.region)
            ),
            usage_url: format!("{}/getUsageLimits", get_q_host(&account.region)),
            fingerprint: get_machine_fingerprint(),
            max_retries: max_retries.max(1),
            base_delay_ms,
        }
    }

    pub fn auth_manager(&self) -> Arc<KiroAuthManager> {
        Arc::clone(&self.auth)
    }

    fn kiro_headers(&self, token: &str) -> reqwest::header::HeaderMap {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Ok(value) = format!("Bearer {}", token).parse() {
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }
        if let Ok(value) = "application/json".parse() {
            headers.insert(reqwest::header::CONTENT_TYPE, value);
        }
        if let Ok(value) = format!("KiroIDE-{}", &self.fingerprint[..16.min(self.fingerprint.len())]).parse() {
            headers.insert(reqwest::header::USER_AGENT, value);
        }
        if let Ok(value) = uuid::Uuid::new_v4().to_string().parse() {
            headers.insert("amz-sdk-invocation-id", value);
        }
        headers
    }

    /// Build the upstream payload for `request` with this account's model
    /// mapping and profile decoration.
    pub async fn build_payload(&self, request: &ClaudeRequest) -> Value {
        let model_id = map_model_id(&request.model);
        let profile_arn = match self.auth_method {
            AuthMethod::Social => self.auth.profile_arn().await,
            AuthMethod::BuilderId => None,
        };
        build_kiro_payload(request, model_id, profile_arn.as_deref())
    }

    /// POST the payload with the retry policy: one forced refresh on 401,
    /// one immediate retry on 504 or a local deadline, exponential backoff
    /// on 429/5xx and transport errors bounded by `max_retries`. A 403 is
    /// never retried; it surfaces so the pipeline can mark the account and
    /// report the permission failure as-is.
    pub async fn send_generate(&self, payload: &Value) -> Result<reqwest::Response, AdapterError> {
        let mut refreshed = false;
        let mut timeout_retried = false;

        for attempt in 0..self.max_retries {
            let token = self.auth.get_access_token().await?;

            let send_result = self
                .client
                .post(&self.generate_url)
                .headers(self.kiro_headers(&token))
                .json(payload)
                .send()
                .await;

            let response = match send_result {
                Ok(r) => r,
                Err(e) => {
                    // Local deadline: one immediate retry, then surface.
                    if e.is_timeout() {
                        if !timeout_retried {
                            timeout_retried = true;
                            warn!(
                                "Upstream request timed out (attempt {}/{}), retrying once",
                                attempt + 1,
                                self.max_retries
                            );
                            continue;
                        }
                        return Err(AdapterError::Network(e));
                    }
                    if attempt + 1 < self.max_retries {
                        let delay = self.base_delay_ms * (1 << attempt);
                        warn!(
                            "Upstream request error (attempt {}/{}): {}, retrying in {}ms",
                            attempt + 1,
                            self.max_retries,
                            e,
                            delay
                        );
                        tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                        continue;
                    }
                    return Err(AdapterError::Network(e));
                }
            };

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            let status_code = status.as_u16();

            // Stale bearer: force one refresh, then retry.
            if status_code == 401 && !refreshed {
                let body = response.text().await.unwrap_or_default();
                warn!(
                    "Upstream returned 401 ({}), forcing token refresh",
                    body
                );
                self.auth.force_refresh().await?;
                refreshed = true;
                continue;
            }

            // Upstream timeout: one immediate retry, then surface.
            if status_code == 504 {
                let body = response.text().await.unwrap_or_default();
                if timeout_retried {
                    return Err(AdapterError::UpstreamStatus {
                        status: status_code,
                        body,
                    });
                }
                timeout_retried = true;
                warn!(
                    "Upstream returned 504 (attempt {}/{}): {}, retrying once",
                    attempt + 1,
                    self.max_retries,
                    body
                );
                continue;
            }

            if (status_code == 429 || status_code >= 500) && attempt + 1 < self.max_retries {
                let body = response.text().await.unwrap_or_default();
                let delay = self.base_delay_ms * (1 << attempt);
                warn!(
                    "Upstream returned {} (attempt {}/{}): {}, retrying in {}ms",
                    status_code,
                    attempt + 1,
                    self.max_retries,
                    body,
                    delay
                );
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                continue;
            }

            // Everything else — 400, 403, exhausted budgets — surfaces with
            // its true status.
            let body = response.text().await.unwrap_or_default();
            return Err(AdapterError::UpstreamStatus {
                status: status_code,
                body,
            });
        }

        Err(AdapterError::UpstreamStatus {
            status: 502,
            body: "upstream request failed after all retries".to_string(),
        })
    }

    /// Unary generate: full round trip, parsed into a Messages response.
    pub async fn generate_content(&self, request: &ClaudeRequest) -> Result<Value, AdapterError> {
        let payload = self.build_payload(request).await;
        let response = self.send_generate(&payload).await?;
        let bytes = response.bytes().await?;
        let (events, _) = parse_events_from_buffer(&bytes);
        Ok(assemble_unary_response(
            &request.model,
            events,
            estimate_request_tokens(request),
        ))
    }

    /// Streaming generate: the caller consumes the raw byte stream.
    pub async fn generate_content_stream(
        &self,
        request: &ClaudeRequest,
    ) -> Result<reqwest::Response, AdapterError> {
        let payload = self.build_payload(request).await;
        self.send_generate(&payload).await
    }

    /// Minimal one-token request used by health probes. On failure the
    /// secondary payload shape is tried before reporting the account down.
    pub async fn probe(&self, model_name: &str) -> Result<(), AdapterError> {
        let request = ClaudeRequest {
            model: model_name.to_string(),
            messages: vec![crate::proxy::mappers::claude::Message {
                role: "user".into(),
                content: crate::proxy::mappers::claude::MessageContent::String("Hi".into()),
            }],
            system: None,
            tools: None,
            stream: false,
            max_tokens: Some(1),
            temperature: None,
            top_p: None,
        };

        match self.generate_content(&request).await {
            Ok(_) => Ok(()),
            Err(primary_err) => {
                info!(
                    "Primary probe failed for {} ({}), trying secondary payload shape",
                    self.account_uuid, primary_err
                );
                let secondary = json!({
                    "contents": [{"role": "user", "parts": [{"text": "Hi"}]}],
                    "max_tokens": 1
                });
                match self.send_generate(&secondary).await {
                    Ok(_) => Ok(()),
                    Err(_) => Err(primary_err),
                }
            }
        }
    }

    /// Refresh the token when expiry is within `threshold_minutes`.
    pub async fn refresh_if_near(&self, threshold_minutes: i64) -> Result<bool, AuthError> {
        self.auth.refresh_if_near(threshold_minutes).await
    }

    /// Query the account's usage limits.
    #[allow(dead_code)] // consumed by the management surface
    pub async fn get_usage(&self) -> Result<UsageInfo, AdapterError> {
        let token = self.auth.get_access_token().await?;
        let response = self
            .client
            .get(&self.usage_url)
            .headers(self.kiro_headers(&token))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AdapterError::UpstreamStatus {
                status: status.as_u16(),
                body,
            });
        }

        let body: Value = response.json().await?;
        Ok(UsageInfo {
            used: body
                .get("currentUsage")
                .or_else(|| body.get("used"))
                .and_then(|v| v.as_f64()),
            limit: body
                .get("usageLimit")
                .or_else(|| body.get("limit"))
                .and_then(|v| v.as_f64()),
            resets_at: body
                .get("nextReset")
                .or_else(|| body.get("resetsAt"))
                .and_then(|v| v.as_str())
                .map(String::from),
        })
    }

    /// Local token estimate. An upper-bound heuristic, not exact.
    #[allow(dead_code)]
    pub fn count_tokens(&self, request: &ClaudeRequest) -> u32 {
        estimate_request_tokens(request)
    }
}
