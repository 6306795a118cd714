//! One-shot Builder-ID acquisition over the AWS SSO OIDC device-code grant:
//! register a public client, start device authorization, poll the token
//! endpoint until the user approves (or the code expires), then persist a
//! fresh credentials file and hand back a pool account.

use chrono::{Duration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::config::{
    get_oidc_device_authorization_url, get_oidc_register_url, get_oidc_token_url,
};
use super::credentials::write_credentials;
use super::types::{
    AuthError, AuthMethod, DeviceAuthorizationResponse, FileCredentials, OidcTokenResponse,
    RegisterClientResponse,
};
use crate::models::PoolAccount;

const CLIENT_NAME: &str = "kiro-gateway";
const DEVICE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";
const DEFAULT_START_URL: &str = "https://view.awsapps.com/start";

const OAUTH_SCOPES: &[&str] = &[
    "codewhisperer:completions",
    "codewhisperer:analysis",
    "codewhisperer:conversations",
    "codewhisperer:transformations",
    "codewhisperer:taskassist",
];

/// Outcome of a completed device flow: the new pool account and where its
/// credentials were written.
#[derive(Debug)]
pub struct DeviceFlowResult {
    pub account: PoolAccount,
    pub credentials_path: String,
}

/// What the user must act on while we poll.
#[derive(Debug, Clone)]
pub struct DeviceFlowPrompt {
    pub user_code: String,
    pub verification_uri: String,
    pub expires_in: u64,
}

async fn register_client(
    client: &reqwest::Client,
    region: &str,
) -> Result<RegisterClientResponse, AuthError> {
    let response = client
        .post(get_oidc_register_url(region))
        .header("Content-Type", "application/json")
        .json(&serde_json::json!({
            "clientName": CLIENT_NAME,
            "clientType": "public",
            "scopes": OAUTH_SCOPES,
            "grantTypes": [DEVICE_GRANT_TYPE, "refresh_token"],
        }))
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(AuthError::DeviceFlow(format!(
            "client registration failed: status={}, body={}",
            status.as_u16(),
            body
        )));
    }
    Ok(response.json().await?)
}

async fn start_device_authorization(
    client: &reqwest::Client,
    region: &str,
    client_id: &str,
    client_secret: &str,
    start_url: &str,
) -> Result<DeviceAuthorizationResponse, AuthError> {
    let response = client
        .post(get_oidc_device_authorization_url(region))
        .header("Content-Type", "application/json")
        .json(&serde_json::json!({
            "clientId": client_id,
            "clientSecret": client_secret,
            "startUrl": start_url,
        }))
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(AuthError::DeviceFlow(format!(
            "device authorization failed: status={}, body={}",
            status.as_u16(),
            body
        )));
    }
    Ok(response.json().await?)
}

/// One poll of the token endpoint. `Ok(None)` means keep waiting;
/// `slow_down` is surfaced through the returned interval bump.
async fn poll_token_once(
    client: &reqwest::Client,
    region: &str,
    client_id: &str,
    client_secret: &str,
    device_code: &str,
) -> Result<(Option<OidcTokenResponse>, bool), AuthError> {
    let response = client
        .post(get_oidc_token_url(region))
        .header("Content-Type", "application/json")
        .json(&serde_json::json!({
            "clientId": client_id,
            "clientSecret": client_secret,
            "grantType": DEVICE_GRANT_TYPE,
            "deviceCode": device_code,
        }))
        .send()
        .await?;

    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let parsed: OidcTokenResponse = serde_json::from_str(&body).unwrap_or(OidcTokenResponse {
        access_token: None,
        refresh_token: None,
        expires_in: None,
        error: Some(format!("status {}", status.as_u16())),
        error_description: None,
    });

    if parsed.access_token.is_some() {
        return Ok((Some(parsed), false));
    }

    match parsed.error.as_deref() {
        Some("authorization_pending") => Ok((None, false)),
        Some("slow_down") => Ok((None, true)),
        Some(other) => Err(AuthError::DeviceFlow(format!(
            "token polling failed: {}{}",
            other,
            parsed
                .error_description
                .as_deref()
                .map(|d| format!(" ({})", d))
                .unwrap_or_default()
        ))),
        None => Err(AuthError::DeviceFlow(format!(
            "token polling failed: status={}, body={}",
            status.as_u16(),
            body
        ))),
    }
}

/// Run the full device-code flow. `on_prompt` receives the verification URI
/// once authorization has started; `cancel` is checked before every sleep so
/// an externally-aborted poll stops promptly.
pub async fn run_device_flow(
    region: &str,
    start_url: Option<&str>,
    configs_dir: &str,
    cancel: CancellationToken,
    on_prompt: impl FnOnce(&DeviceFlowPrompt),
) -> Result<DeviceFlowResult, AuthError> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .unwrap_or_default();

    let registration = register_client(&client, region).await?;
    info!("Registered OIDC client for device flow");

    let start_url = start_url.unwrap_or(DEFAULT_START_URL);
    let authorization = start_device_authorization(
        &client,
        region,
        &registration.client_id,
        &registration.client_secret,
        start_url,
    )
    .await?;

    let verification_uri = authorization
        .verification_uri_complete
        .clone()
        .or(authorization.verification_uri.clone())
        .ok_or_else(|| AuthError::DeviceFlow("response missing verificationUri".into()))?;

    on_prompt(&DeviceFlowPrompt {
        user_code: authorization.user_code.clone(),
        verification_uri,
        expires_in: authorization.expires_in,
    });

    let deadline = std::time::Instant::now()
        + std::time::Duration::from_secs(authorization.expires_in);
    let mut interval = authorization.interval.max(1);

    let token = loop {
        if cancel.is_cancelled() {
            return Err(AuthError::DeviceFlow("polling cancelled".into()));
        }
        if std::time::Instant::now() >= deadline {
            return Err(AuthError::DeviceFlow("device code expired".into()));
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(AuthError::DeviceFlow("polling cancelled".into()));
            }
            _ = tokio::time::sleep(std::time::Duration::from_secs(interval)) => {}
        }

        match poll_token_once(
            &client,
            region,
            &registration.client_id,
            &registration.client_secret,
            &authorization.device_code,
        )
        .await
        {
            Ok((Some(token), _)) => break token,
            Ok((None, slow_down)) => {
                if slow_down {
                    interval += 5;
                    warn!("Token endpoint asked to slow down, interval now {}s", interval);
                }
            }
            Err(e) => return Err(e),
        }
    };

    let access_token = token.access_token.ok_or(AuthError::MissingAccessToken)?;
    let expires_at = token
        .expires_in
        .map(|s| Utc::now() + Duration::seconds(s));

    let credentials_path = format!(
        "{}/kiro/{}_{}.json",
        configs_dir.trim_end_matches('/'),
        Utc::now().format("%Y%m%d%H%M%S"),
        CLIENT_NAME
    );

    let creds = FileCredentials {
        access_token: Some(access_token.clone()),
        refresh_token: token.refresh_token.clone(),
        expires_at: expires_at.map(|dt| dt.to_rfc3339()),
        auth_method: Some("builder-id".into()),
        client_id: Some(registration.client_id.clone()),
        client_secret: Some(registration.client_secret.clone()),
        profile_arn: None,
        region: Some(region.to_string()),
    };
    write_credentials(&credentials_path, &creds)?;
    info!("Device flow complete, credentials written to {}", credentials_path);

    let mut account = PoolAccount::new(credentials_path.clone(), AuthMethod::BuilderId);
    account.region = region.to_string();
    account.client_id = Some(registration.client_id);
    account.client_secret = Some(registration.client_secret);
    account.access_token = Some(access_token);
    account.refresh_token = token.refresh_token;
    account.expires_at = expires_at;

    Ok(DeviceFlowResult {
        account,
        credentials_path,
    })
}
