//! Per-account credential files: read, merge partial updates, write
//! atomically. Each account's file is written by its own auth manager only,
//! so there is no cross-account contention; atomicity guards against torn
//! reads by the Kiro IDE sharing the same file.

use std::path::Path;

use base64::Engine;
use serde_json::Value;
use tracing::debug;

use super::types::{AuthError, FileCredentials};

/// Load the credentials file at `path`.
pub fn load_credentials(path: &str) -> Result<FileCredentials, AuthError> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Decode a Base64-encoded credentials JSON blob (startup fallback when the
/// account's file does not exist yet).
pub fn decode_credentials_blob(blob: &str) -> Result<FileCredentials, AuthError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(blob.trim())
        .map_err(|e| AuthError::DeviceFlow(format!("invalid base64 credentials blob: {}", e)))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Merge `updates` into the credentials file at `path`, preserving any keys
/// the update does not mention, then write atomically (temp file + rename).
///
/// Only `Some` fields of `updates` are applied.
pub fn merge_credentials(path: &str, updates: &FileCredentials) -> Result<(), AuthError> {
    let mut existing: Value = match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or(Value::Object(Default::default())),
        Err(_) => Value::Object(Default::default()),
    };

    if let Value::Object(ref mut map) = existing {
        if let Some(ref token) = updates.access_token {
            map.insert("accessToken".to_string(), Value::String(token.clone()));
        }
        if let Some(ref token) = updates.refresh_token {
            map.insert("refreshToken".to_string(), Value::String(token.clone()));
        }
        if let Some(ref at) = updates.expires_at {
            map.insert("expiresAt".to_string(), Value::String(at.clone()));
        }
        if let Some(ref method) = updates.auth_method {
            map.insert("authMethod".to_string(), Value::String(method.clone()));
        }
        if let Some(ref id) = updates.client_id {
            map.insert("clientId".to_string(), Value::String(id.clone()));
        }
        if let Some(ref secret) = updates.client_secret {
            map.insert("clientSecret".to_string(), Value::String(secret.clone()));
        }
        if let Some(ref arn) = updates.profile_arn {
            map.insert("profileArn".to_string(), Value::String(arn.clone()));
        }
        if let Some(ref region) = updates.region {
            map.insert("region".to_string(), Value::String(region.clone()));
        }
    }

    write_atomic(path, &serde_json::to_string_pretty(&existing)?)?;
    debug!("Credentials merged into {}", path);
    Ok(())
}

/// Write a fresh credentials file (device-code flow output).
pub fn write_credentials(path: &str, creds: &FileCredentials) -> Result<(), AuthError> {
    if let Some(parent) = Path::new(path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    write_atomic(path, &serde_json::to_string_pretty(creds)?)
}

fn write_atomic(path: &str, content: &str) -> Result<(), AuthError> {
    let tmp_path = format!("{}.tmp", path);
    std::fs::write(&tmp_path, content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))?;
    }

    std::fs::rename(&tmp_path, path)?;
    Ok(())
}
