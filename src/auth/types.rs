use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Authentication mechanism of a pool account.
///
/// - `Social`: Kiro Desktop login, refreshed via
///   `https://prod.{region}.auth.desktop.kiro.dev/refreshToken`
/// - `BuilderId`: AWS Builder ID / IdC, refreshed via
///   `https://oidc.{region}.amazonaws.com/token`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthMethod {
    #[serde(rename = "social")]
    Social,
    #[serde(rename = "builder-id")]
    BuilderId,
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Social => write!(f, "social"),
            AuthMethod::BuilderId => write!(f, "builder-id"),
        }
    }
}

/// Per-account OAuth credentials file (camelCase, Kiro IDE format).
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct FileCredentials {
    #[serde(rename = "accessToken")]
    pub access_token: Option<String>,
    #[serde(rename = "refreshToken")]
    pub refresh_token: Option<String>,
    #[serde(rename = "expiresAt")]
    pub expires_at: Option<String>,
    #[serde(rename = "authMethod")]
    pub auth_method: Option<String>,
    #[serde(rename = "clientId")]
    pub client_id: Option<String>,
    #[serde(rename = "clientSecret")]
    pub client_secret: Option<String>,
    #[serde(rename = "profileArn")]
    pub profile_arn: Option<String>,
    pub region: Option<String>,
}

/// Response from the Kiro Desktop (social) refresh endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct SocialRefreshResponse {
    #[serde(rename = "accessToken")]
    pub access_token: Option<String>,
    #[serde(rename = "refreshToken")]
    pub refresh_token: Option<String>,
    #[serde(rename = "expiresIn")]
    pub expires_in: Option<i64>,
    #[serde(rename = "profileArn")]
    pub profile_arn: Option<String>,
}

/// Response from the AWS SSO OIDC token endpoint (builder-id refresh and
/// device-code exchange share the shape).
#[derive(Debug, Clone, Deserialize)]
pub struct OidcTokenResponse {
    #[serde(rename = "accessToken")]
    pub access_token: Option<String>,
    #[serde(rename = "refreshToken")]
    pub refresh_token: Option<String>,
    #[serde(rename = "expiresIn")]
    pub expires_in: Option<i64>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// Response from `POST /client/register`.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterClientResponse {
    #[serde(rename = "clientId")]
    pub client_id: String,
    #[serde(rename = "clientSecret")]
    pub client_secret: String,
}

/// Response from `POST /device_authorization`.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceAuthorizationResponse {
    #[serde(rename = "deviceCode")]
    pub device_code: String,
    #[serde(rename = "userCode")]
    pub user_code: String,
    #[serde(rename = "verificationUri")]
    pub verification_uri: Option<String>,
    #[serde(rename = "verificationUriComplete")]
    pub verification_uri_complete: Option<String>,
    #[serde(default = "default_poll_interval")]
    pub interval: u64,
    #[serde(rename = "expiresIn", default = "default_device_expiry")]
    pub expires_in: u64,
}

fn default_poll_interval() -> u64 {
    5
}

fn default_device_expiry() -> u64 {
    600
}

/// Errors from the auth module.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("No refresh token available for this account")]
    MissingRefreshToken,

    #[error("Client ID is not set (required for builder-id refresh)")]
    MissingClientId,

    #[error("Client secret is not set (required for builder-id refresh)")]
    MissingClientSecret,

    #[error("Refresh response does not contain accessToken")]
    MissingAccessToken,

    #[error("Account has no credentials loaded; add a credentials file or run --login")]
    NotInitialized,

    #[error("Token refresh rejected: {status} - {body}")]
    RefreshRejected { status: u16, body: String },

    #[error("Device authorization failed: {0}")]
    DeviceFlow(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_method_serde() {
        assert_eq!(
            serde_json::to_string(&AuthMethod::Social).unwrap(),
            "\"social\""
        );
        assert_eq!(
            serde_json::to_string(&AuthMethod::BuilderId).unwrap(),
            "\"builder-id\""
        );
        let m: AuthMethod = serde_json::from_str("\"builder-id\"").unwrap();
        assert_eq!(m, AuthMethod::BuilderId);
    }

    #[test]
    fn test_file_credentials_deserialize() {
        let json = r#"{
            "accessToken": "at_456",
            "refreshToken": "rt_123",
            "expiresAt": "2026-02-10T19:54:16Z",
            "authMethod": "social",
            "profileArn": "arn:aws:codewhisperer:us-east-1:x:profile/y",
            "region": "us-east-1"
        }"#;
        let creds: FileCredentials = serde_json::from_str(json).unwrap();
        assert_eq!(creds.access_token.as_deref(), Some("at_456"));
        assert_eq!(creds.refresh_token.as_deref(), Some("rt_123"));
        assert_eq!(creds.auth_method.as_deref(), Some("social"));
        assert!(creds.client_id.is_none());
    }

    #[test]
    fn test_device_authorization_defaults() {
        let json = r#"{"deviceCode": "dc", "userCode": "ABCD-EFGH"}"#;
        let resp: DeviceAuthorizationResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.interval, 5);
        assert_eq!(resp.expires_in, 600);
        assert!(resp.verification_uri_complete.is_none());
    }

    #[test]
    fn test_oidc_token_response_pending() {
        let json = r#"{"error": "authorization_pending"}"#;
        let resp: OidcTokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.error.as_deref(), Some("authorization_pending"));
        assert!(resp.access_token.is_none());
    }

    #[test]
    fn test_auth_error_display() {
        let err = AuthError::MissingRefreshToken;
        assert!(err.to_string().contains("refresh token"));

        let err = AuthError::RefreshRejected {
            status: 400,
            body: "invalid_grant".to_string(),
        };
        assert!(err.to_string().contains("400"));
        assert!(err.to_string().contains("invalid_grant"));
    }
}
