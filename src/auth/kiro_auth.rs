use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::config::{get_oidc_token_url, get_social_refresh_url};
use super::credentials::{decode_credentials_blob, load_credentials, merge_credentials};
use super::types::{
    AuthError, AuthMethod, FileCredentials, OidcTokenResponse, SocialRefreshResponse,
};
use crate::models::PoolAccount;

const REFRESH_TIMEOUT_SECS: u64 = 30;

struct Inner {
    credentials_path: String,
    auth_method: AuthMethod,
    region: String,
    access_token: Option<String>,
    refresh_token: Option<String>,
    profile_arn: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    refresh_url: String,
    http_client: Client,
}

/// Per-account OAuth lifecycle: load credentials, decide when expiry is
/// "near", run the refresh flow for the account's auth method, and merge
/// rotated tokens back into the credentials file.
pub struct KiroAuthManager {
    inner: Mutex<Inner>,
}

/// Read-only view of the manager's token state, used to sync the pool record
/// after a refresh.
#[derive(Debug, Clone)]
pub struct TokenSnapshot {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub profile_arn: Option<String>,
}

impl Inner {
    fn adopt_file_credentials(&mut self, creds: &FileCredentials) {
        if creds.access_token.is_some() {
            self.access_token = creds.access_token.clone();
        }
        if creds.refresh_token.is_some() {
            self.refresh_token = creds.refresh_token.clone();
        }
        if creds.profile_arn.is_some() {
            self.profile_arn = creds.profile_arn.clone();
        }
        if creds.client_id.is_some() {
            self.client_id = creds.client_id.clone();
        }
        if creds.client_secret.is_some() {
            self.client_secret = creds.client_secret.clone();
        }
        if let Some(ref region) = creds.region {
            self.region = region.clone();
            self.refresh_url = match self.auth_method {
                AuthMethod::Social => get_social_refresh_url(&self.region),
                AuthMethod::BuilderId => get_oidc_token_url(&self.region),
            };
        }
        if let Some(ref expires_str) = creds.expires_at {
            match DateTime::parse_from_rfc3339(expires_str) {
                Ok(dt) => self.expires_at = Some(dt.with_timezone(&Utc)),
                Err(e) => warn!("Failed to parse expiresAt '{}': {}", expires_str, e),
            }
        }
    }

    fn is_expiry_near(&self, threshold_minutes: i64) -> bool {
        match self.expires_at {
            None => true,
            Some(expires) => expires <= Utc::now() + Duration::minutes(threshold_minutes),
        }
    }

    async fn refresh(&mut self) -> Result<(), AuthError> {
        match self.auth_method {
            AuthMethod::Social => self.refresh_social().await,
            AuthMethod::BuilderId => self.refresh_builder_id().await,
        }
    }

    async fn refresh_social(&mut self) -> Result<(), AuthError> {
        let refresh_token = self
            .refresh_token
            .clone()
            .ok_or(AuthError::MissingRefreshToken)?;
        info!("Refreshing token via Kiro Desktop Auth ({})", self.region);

        let response = self
            .http_client
            .post(&self.refresh_url)
            .header("Content-Type", "application/json")
            .json(&serde_json::json!({ "refreshToken": refresh_token }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::RefreshRejected {
                status: status.as_u16(),
                body,
            });
        }

        let data: SocialRefreshResponse = response.json().await?;
        let access_token = data.access_token.ok_or(AuthError::MissingAccessToken)?;

        self.access_token = Some(access_token);
        if let Some(rt) = data.refresh_token {
            self.refresh_token = Some(rt);
        }
        if let Some(arn) = data.profile_arn {
            self.profile_arn = Some(arn);
        }
        // A response without expiresIn leaves the previous expiry in place.
        if let Some(expires_in) = data.expires_in {
            self.expires_at = Some(Utc::now() + Duration::seconds(expires_in));
        }

        self.persist_rotated_tokens();
        Ok(())
    }

    async fn refresh_builder_id(&mut self) -> Result<(), AuthError> {
        let refresh_token = self
            .refresh_token
            .clone()
            .ok_or(AuthError::MissingRefreshToken)?;
        let client_id = self.client_id.clone().ok_or(AuthError::MissingClientId)?;
        let client_secret = self
            .client_secret
            .clone()
            .ok_or(AuthError::MissingClientSecret)?;
        info!("Refreshing token via AWS SSO OIDC ({})", self.region);

        let response = self
            .http_client
            .post(&self.refresh_url)
            .header("Content-Type", "application/json")
            .json(&serde_json::json!({
                "clientId": client_id,
                "clientSecret": client_secret,
                "refreshToken": refresh_token,
                "grantType": "refresh_token",
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::RefreshRejected {
                status: status.as_u16(),
                body,
            });
        }

        let data: OidcTokenResponse = response.json().await?;
        let access_token = data.access_token.ok_or(AuthError::MissingAccessToken)?;

        self.access_token = Some(access_token);
        if let Some(rt) = data.refresh_token {
            self.refresh_token = Some(rt);
        }
        if let Some(expires_in) = data.expires_in {
            self.expires_at = Some(Utc::now() + Duration::seconds(expires_in));
        }

        self.persist_rotated_tokens();
        Ok(())
    }

    /// Merge rotated fields into the credentials file, preserving keys we do
    /// not own. A failed write is logged, not fatal: the in-memory token is
    /// still valid for this process.
    fn persist_rotated_tokens(&self) {
        let updates = FileCredentials {
            access_token: self.access_token.clone(),
            refresh_token: self.refresh_token.clone(),
            expires_at: self.expires_at.map(|dt| dt.to_rfc3339()),
            profile_arn: self.profile_arn.clone(),
            ..Default::default()
        };
        if let Err(e) = merge_credentials(&self.credentials_path, &updates) {
            warn!(
                "Failed to persist rotated tokens to {}: {}",
                self.credentials_path, e
            );
        } else {
            info!(
                "Token refreshed, expires: {}",
                self.expires_at.map(|d| d.to_rfc3339()).unwrap_or_default()
            );
        }
    }
}

impl KiroAuthManager {
    /// Build a manager seeded from the pool record, then overlay the
    /// credentials file. When the file is absent and a Base64 blob was
    /// supplied at startup, the blob is decoded and adopted instead.
    pub fn new(account: &PoolAccount, fallback_blob: Option<&str>) -> Self {
        let refresh_url = match account.auth_method {
            AuthMethod::Social => get_social_refresh_url(&account.region),
            AuthMethod::BuilderId => get_oidc_token_url(&account.region),
        };

        let http_client = Client::builder()
            .timeout(std::time::Duration::from_secs(REFRESH_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();

        let mut inner = Inner {
            credentials_path: account.credentials_path.clone(),
            auth_method: account.auth_method,
            region: account.region.clone(),
            access_token: account.access_token.clone(),
            refresh_token: account.refresh_token.clone(),
            profile_arn: account.profile_arn.clone(),
            client_id: account.client_id.clone(),
            client_secret: account.client_secret.clone(),
            expires_at: account.expires_at,
            refresh_url,
            http_client,
        };

        match load_credentials(&inner.credentials_path) {
            Ok(creds) => inner.adopt_file_credentials(&creds),
            Err(_) => {
                if let Some(blob) = fallback_blob {
                    match decode_credentials_blob(blob) {
                        Ok(creds) => {
                            info!(
                                "Credentials file {} absent, adopting startup blob",
                                inner.credentials_path
                            );
                            inner.adopt_file_credentials(&creds);
                        }
                        Err(e) => warn!("Failed to decode startup credentials blob: {}", e),
                    }
                } else {
                    debug!("Credentials file not found: {}", inner.credentials_path);
                }
            }
        }

        Self {
            inner: Mutex::new(inner),
        }
    }

    /// True iff `expiresAt <= now + threshold_minutes`. An unknown expiry
    /// counts as near.
    pub async fn is_expiry_near(&self, threshold_minutes: i64) -> bool {
        self.inner.lock().await.is_expiry_near(threshold_minutes)
    }

    /// Return a bearer token, refreshing first when expiry is near. Fails
    /// with `NotInitialized` when the account has neither token material.
    pub async fn get_access_token(&self) -> Result<String, AuthError> {
        let mut inner = self.inner.lock().await;

        if let Some(ref token) = inner.access_token {
            if !inner.is_expiry_near(super::config::TOKEN_REFRESH_THRESHOLD_MINUTES) {
                return Ok(token.clone());
            }
        }

        if inner.refresh_token.is_none() {
            // Last chance: the IDE may have rewritten the file since load.
            if let Ok(creds) = load_credentials(&inner.credentials_path) {
                inner.adopt_file_credentials(&creds);
            }
        }

        if inner.refresh_token.is_none() {
            return if inner.access_token.is_none() {
                Err(AuthError::NotInitialized)
            } else {
                Err(AuthError::MissingRefreshToken)
            };
        }

        inner.refresh().await?;
        inner
            .access_token
            .clone()
            .ok_or(AuthError::MissingAccessToken)
    }

    /// Force a refresh regardless of expiry (the adapter's 401 path).
    pub async fn force_refresh(&self) -> Result<String, AuthError> {
        let mut inner = self.inner.lock().await;
        inner.refresh().await?;
        inner
            .access_token
            .clone()
            .ok_or(AuthError::MissingAccessToken)
    }

    /// Refresh only when expiry is within `threshold_minutes`. Returns true
    /// when a refresh was performed.
    pub async fn refresh_if_near(&self, threshold_minutes: i64) -> Result<bool, AuthError> {
        let mut inner = self.inner.lock().await;
        if !inner.is_expiry_near(threshold_minutes) {
            return Ok(false);
        }
        inner.refresh().await?;
        Ok(true)
    }

    pub async fn snapshot(&self) -> TokenSnapshot {
        let inner = self.inner.lock().await;
        TokenSnapshot {
            access_token: inner.access_token.clone(),
            refresh_token: inner.refresh_token.clone(),
            expires_at: inner.expires_at,
            profile_arn: inner.profile_arn.clone(),
        }
    }

    pub async fn profile_arn(&self) -> Option<String> {
        self.inner.lock().await.profile_arn.clone()
    }
}
