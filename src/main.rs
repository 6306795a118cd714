mod auth;
mod models;
mod proxy;

use std::sync::Arc;

use tracing::{error, info, warn};

use models::GatewayConfig;
use proxy::server::AppState;
use proxy::PoolManager;

const CONFIG_PATH: &str = "configs/config.json";
const CONFIGS_DIR: &str = "configs";
const SHUTDOWN_DRAIN_SECS: u64 = 10;

fn init_logger() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();
}

/// One-shot device-code login: `kiro-gateway --login [region] [start-url]`.
async fn run_login(args: &[String], pool: Arc<PoolManager>) -> i32 {
    let login_pos = args.iter().position(|a| a == "--login").unwrap();
    let region = args
        .get(login_pos + 1)
        .filter(|a| !a.starts_with('-'))
        .cloned()
        .unwrap_or_else(|| "us-east-1".to_string());
    let start_url = args
        .get(login_pos + 2)
        .filter(|a| !a.starts_with('-'))
        .cloned();

    let cancel = pool.begin_device_poll("cli-login");
    let result = auth::device_flow::run_device_flow(
        &region,
        start_url.as_deref(),
        CONFIGS_DIR,
        cancel,
        |prompt| {
            println!();
            println!("  Open:  {}", prompt.verification_uri);
            println!("  Code:  {}", prompt.user_code);
            println!("  (expires in {} seconds)", prompt.expires_in);
            println!();
        },
    )
    .await;
    pool.end_device_poll("cli-login");

    match result {
        Ok(flow) => {
            info!("Login complete, credentials at {}", flow.credentials_path);
            pool.add_account(flow.account).await;
            if let Err(e) = pool.flush_to_disk().await {
                error!("Failed to persist pool after login: {}", e);
                return 1;
            }
            info!("Account added to the pool");
            0
        }
        Err(e) => {
            error!("Login failed: {}", e);
            1
        }
    }
}

#[tokio::main]
async fn main() {
    init_logger();

    let mut config = GatewayConfig::load(CONFIG_PATH);
    config.apply_env_overrides();

    let fallback_blob = std::env::var("KIRO_OAUTH_CREDS_BASE64")
        .ok()
        .filter(|b| !b.trim().is_empty());
    if fallback_blob.is_some() {
        info!("Startup credentials blob present; used when account files are missing");
    }

    let pool = match PoolManager::load(config.clone(), fallback_blob) {
        Ok(pool) => pool,
        Err(e) => {
            error!("Failed to load provider pool: {}", e);
            std::process::exit(1);
        }
    };

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--login") {
        let code = run_login(&args, pool).await;
        std::process::exit(code);
    }

    if config.required_api_key.is_empty() {
        warn!("REQUIRED_API_KEY is not set; the gateway accepts unauthenticated requests");
    }

    info!("--------------------------------------------------");
    info!("Kiro gateway starting");
    info!("Listen: {}:{}", config.host, config.server_port);
    info!("Pool file: {}", config.provider_pools_file_path);
    info!("Error budget: {}", config.max_error_count);
    info!("--------------------------------------------------");

    pool.start_background_tasks().await;

    let state = AppState {
        pool: Arc::clone(&pool),
        config: Arc::new(config),
    };

    let serve_result = proxy::server::serve(state, async {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received, draining...");
    })
    .await;

    pool.graceful_shutdown(std::time::Duration::from_secs(SHUTDOWN_DRAIN_SECS))
        .await;

    if let Err(e) = serve_result {
        error!("{}", e);
        std::process::exit(1);
    }
    info!("Shutdown complete");
}
