/// Default near-expiry threshold in minutes: refresh tokens in advance so a
/// request never rides an expired bearer.
pub const TOKEN_REFRESH_THRESHOLD_MINUTES: i64 = 10;

/// Returns the Kiro Desktop (social) token refresh URL for the given region.
///
/// Example: `get_social_refresh_url("us-east-1")` →
/// `"https://prod.us-east-1.auth.desktop.kiro.dev/refreshToken"`
pub fn get_social_refresh_url(region: &str) -> String {
    format!("https://prod.{}.auth.desktop.kiro.dev/refreshToken", region)
}

/// Returns the CodeWhisperer API host for the given region.
///
/// Example: `get_codewhisperer_host("us-east-1")` →
/// `"https://codewhisperer.us-east-1.amazonaws.com"`
pub fn get_codewhisperer_host(region: &str) -> String {
    format!("https://codewhisperer.{}.amazonaws.com", region)
}

/// Returns the Q API host for the given region (usage-limits endpoint).
pub fn get_q_host(region: &str) -> String {
    format!("https://q.{}.amazonaws.com", region)
}

/// Returns the AWS SSO OIDC token URL for the given region (builder-id
/// refresh and device-code exchange).
pub fn get_oidc_token_url(region: &str) -> String {
    format!("https://oidc.{}.amazonaws.com/token", region)
}

/// Returns the AWS SSO OIDC client registration URL for the given region.
pub fn get_oidc_register_url(region: &str) -> String {
    format!("https://oidc.{}.amazonaws.com/client/register", region)
}

/// Returns the AWS SSO OIDC device authorization URL for the given region.
pub fn get_oidc_device_authorization_url(region: &str) -> String {
    format!("https://oidc.{}.amazonaws.com/device_authorization", region)
}

/// Generates a stable machine fingerprint for the `KiroIDE` user-agent.
///
/// Uses the `machine-uid` crate for a hardware-based identifier, hashed with
/// SHA-256 for privacy. Falls back to a fixed hash if the UID is unavailable.
pub fn get_machine_fingerprint() -> String {
    use sha2::{Digest, Sha256};

    match machine_uid::get() {
        Ok(uid) => {
            let mut hasher = Sha256::new();
            hasher.update(uid.as_bytes());
            format!("{:x}", hasher.finalize())
        }
        Err(_) => {
            let mut hasher = Sha256::new();
            hasher.update(b"default-kiro-gateway");
            format!("{:x}", hasher.finalize())
        }
    }
}
