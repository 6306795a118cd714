//! The `/v1/messages` pipeline: validate, overlay the file-backed system
//! prompt, log, select an account (with fallback), dispatch, and mark the
//! outcome. Plus the small utility endpoints.

use std::collections::HashSet;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rand::Rng;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::models::config::{PromptLogMode, SystemPromptMode};
use crate::proxy::common::errors::{error_response, ErrorKind};
use crate::proxy::mappers::claude::{ClaudeRequest, SystemPrompt};
use crate::proxy::pool_manager::FALLBACK_CHAIN_LIMIT;
use crate::proxy::server::AppState;
use crate::proxy::tokenizer::estimate_request_tokens;

/// Mirror of the last effective system prompt, for operators.
const FETCH_SYSTEM_PROMPT_PATH: &str = "configs/fetch_system_prompt.txt";

fn new_trace_id() -> String {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(6)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

fn validate(request: &ClaudeRequest) -> Result<(), String> {
    if request.model.trim().is_empty() {
        return Err("model is required".to_string());
    }
    if request.messages.is_empty() {
        return Err("messages must not be empty".to_string());
    }
    for msg in &request.messages {
        if msg.role != "user" && msg.role != "assistant" {
            return Err(format!("invalid role: {}", msg.role));
        }
    }
    Ok(())
}

/// Apply the configured file-backed system prompt, then mirror the effective
/// prompt for observability. Both file operations are best-effort.
fn overlay_system_prompt(state: &AppState, request: &mut ClaudeRequest) {
    if let Some(ref path) = state.config.system_prompt_file_path {
        match std::fs::read_to_string(path) {
            Ok(injected) if !injected.trim().is_empty() => {
                let injected = injected.trim_end().to_string();
                match state.config.system_prompt_mode {
                    SystemPromptMode::Overwrite => {
                        request.system = Some(SystemPrompt::String(injected));
                    }
                    SystemPromptMode::Append => {
                        let existing = request
                            .system
                            .as_ref()
                            .map(|s| s.to_text())
                            .unwrap_or_default();
                        let combined = if existing.is_empty() {
                            injected
                        } else {
                            format!("{}\n\n{}", existing, injected)
                        };
                        request.system = Some(SystemPrompt::String(combined));
                    }
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to read system prompt file {}: {}", path, e),
        }
    }

    let effective = request
        .system
        .as_ref()
        .map(|s| s.to_text())
        .unwrap_or_default();
    if !effective.is_empty() {
        if let Some(parent) = std::path::Path::new(FETCH_SYSTEM_PROMPT_PATH).parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(FETCH_SYSTEM_PROMPT_PATH, &effective) {
            warn!("Failed to mirror system prompt: {}", e);
        }
    }
}

fn log_prompt(state: &AppState, trace_id: &str, request: &ClaudeRequest) {
    match state.config.prompt_log_mode {
        PromptLogMode::None => {}
        PromptLogMode::Console => {
            info!(
                "[{}] Outbound prompt: {}",
                trace_id,
                serde_json::to_string(&request.messages).unwrap_or_default()
            );
        }
        PromptLogMode::File => {
            let path = format!(
                "configs/{}_{}.log",
                state.config.prompt_log_base_name,
                chrono::Utc::now().format("%Y-%m-%d")
            );
            let line = format!(
                "{} [{}] {}\n",
                chrono::Utc::now().to_rfc3339(),
                trace_id,
                serde_json::to_string(&request.messages).unwrap_or_default()
            );
            if let Some(parent) = std::path::Path::new(&path).parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            use std::io::Write;
            let write = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .and_then(|mut f| f.write_all(line.as_bytes()));
            if let Err(e) = write {
                warn!("Failed to append prompt log {}: {}", path, e);
            }
        }
    }
}

pub async fn handle_messages(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let trace_id = new_trace_id();

    let mut request: ClaudeRequest = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                ErrorKind::InvalidRequestError,
                &format!("Invalid request body: {}", e),
            );
        }
    };

    if let Err(msg) = validate(&request) {
        return error_response(StatusCode::BAD_REQUEST, ErrorKind::InvalidRequestError, &msg);
    }

    overlay_system_prompt(&state, &mut request);
    log_prompt(&state, &trace_id, &request);

    info!(
        "[{}] Claude request | model: {} | stream: {} | messages: {} | tools: {}",
        trace_id,
        request.model,
        request.stream,
        request.messages.len(),
        request.tools.as_ref().map_or(0, |t| t.len())
    );

    // Selection with a bounded fallback chain: a failed account is excluded
    // and selection re-enters with skip_usage_count so LRU accounting
    // charges once per user request.
    let mut excluded: HashSet<String> = HashSet::new();
    let mut last_error: Option<crate::proxy::adapter::AdapterError> = None;

    for attempt in 0..=FALLBACK_CHAIN_LIMIT {
        let account = match state
            .pool
            .select_account(Some(&request.model), attempt > 0, &excluded)
            .await
        {
            Some(account) => account,
            None => break,
        };

        info!(
            "[{}] Using account {} ({}) attempt {}",
            trace_id,
            account.uuid,
            account.name.as_deref().unwrap_or("unnamed"),
            attempt + 1
        );

        match super::kiro_upstream::dispatch(&state, account.clone(), &request, &trace_id).await {
            Ok(response) => return response,
            Err(e) => {
                let kind = e.kind();
                warn!(
                    "[{}] Account {} failed ({}): {}",
                    trace_id,
                    account.uuid,
                    kind.as_str(),
                    e
                );

                // Caller errors are final: no marking, no fallback.
                if kind == ErrorKind::InvalidRequestError {
                    return error_response(kind.http_status(), kind, &e.message());
                }
                if kind.marks_unhealthy() {
                    state.pool.mark_unhealthy(&account.uuid, &e.message()).await;
                }
                // Non-retryable failures (e.g. 403) surface once marked.
                if !kind.is_retryable() {
                    return error_response(kind.http_status(), kind, &e.message());
                }
                excluded.insert(account.uuid);
                last_error = Some(e);
            }
        }
    }

    match last_error {
        Some(e) => {
            let kind = e.kind();
            error_response(kind.http_status(), kind, &e.message())
        }
        None => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::ServerError,
            "no healthy providers",
        ),
    }
}

pub async fn handle_count_tokens(
    State(_state): State<AppState>,
    Json(body): Json<Value>,
) -> Response {
    let request: ClaudeRequest = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                ErrorKind::InvalidRequestError,
                &format!("Invalid request body: {}", e),
            );
        }
    };
    Json(json!({ "input_tokens": estimate_request_tokens(&request) })).into_response()
}

pub async fn handle_health() -> Response {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "provider": "kiro"
    }))
    .into_response()
}

#[derive(serde::Deserialize)]
pub struct ProviderHealthQuery {
    #[serde(rename = "unhealthRatioThreshold")]
    pub unhealth_ratio_threshold: Option<f64>,
}

pub async fn handle_provider_health(
    State(state): State<AppState>,
    Query(query): Query<ProviderHealthQuery>,
) -> Response {
    let threshold = query.unhealth_ratio_threshold.unwrap_or(0.5);
    Json(state.pool.summary(threshold).await).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::mappers::claude::{Message, MessageContent};

    fn base_request() -> ClaudeRequest {
        ClaudeRequest {
            model: "claude-haiku-4-5".into(),
            messages: vec![Message {
                role: "user".into(),
                content: MessageContent::String("Hi".into()),
            }],
            system: None,
            tools: None,
            stream: false,
            max_tokens: None,
            temperature: None,
            top_p: None,
        }
    }

    #[test]
    fn test_validate_accepts_minimal() {
        assert!(validate(&base_request()).is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_model() {
        let mut req = base_request();
        req.model = "  ".into();
        assert!(validate(&req).is_err());
    }

    #[test]
    fn test_validate_rejects_empty_messages() {
        let mut req = base_request();
        req.messages.clear();
        assert!(validate(&req).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_role() {
        let mut req = base_request();
        req.messages[0].role = "system".into();
        let err = validate(&req).unwrap_err();
        assert!(err.contains("invalid role"));
    }

    #[test]
    fn test_trace_id_shape() {
        let id = new_trace_id();
        assert_eq!(id.len(), 6);
        assert!(id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }
}
