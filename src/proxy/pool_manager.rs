//! Provider pool: account selection, health bookkeeping, probes, and
//! debounced persistence.
//!
//! All counter state lives behind one mutex over the account sequence.
//! Network I/O (probes, refreshes) runs on cloned snapshots with the lock
//! released; writers hold the lock only for counter updates.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::{GatewayConfig, PoolAccount};
use crate::proxy::adapter::KiroAdapter;

/// Quiet interval before coalesced mutations hit disk.
pub const SAVE_DEBOUNCE_MS: u64 = 1000;
/// Periodic probe interval; also the minimum age of `lastErrorTime` before
/// an account is probed again.
pub const HEALTH_CHECK_INTERVAL_SECS: u64 = 600;
/// Bounded fallback chain length for re-selection after a failed account.
pub const FALLBACK_CHAIN_LIMIT: usize = 3;

/// Result of one probe attempt.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub success: bool,
    pub model_name: String,
    pub error_message: Option<String>,
}

/// Shape of `provider_pools.json`: a bare account array, or the legacy
/// object keyed by provider type.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PoolFileShape {
    Array,
    Keyed(String),
}

pub struct PoolManager {
    accounts: Mutex<Vec<PoolAccount>>,
    adapters: DashMap<String, Arc<KiroAdapter>>,
    device_polls: DashMap<String, CancellationToken>,
    file_path: PathBuf,
    file_shape: Mutex<PoolFileShape>,
    config: GatewayConfig,
    fallback_blob: Option<String>,
    dirty_gen: AtomicU64,
    save_notify: Notify,
    cancel_token: CancellationToken,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

fn parse_pool_file(content: &str) -> Result<(Vec<PoolAccount>, PoolFileShape), String> {
    let value: Value =
        serde_json::from_str(content).map_err(|e| format!("invalid pool file JSON: {}", e))?;

    match value {
        Value::Array(_) => {
            let accounts: Vec<PoolAccount> =
                serde_json::from_value(value).map_err(|e| format!("invalid account array: {}", e))?;
            Ok((accounts, PoolFileShape::Array))
        }
        Value::Object(map) if map.len() == 1 => {
            let (key, inner) = map.into_iter().next().unwrap();
            let accounts: Vec<PoolAccount> = serde_json::from_value(inner)
                .map_err(|e| format!("invalid account array under '{}': {}", key, e))?;
            Ok((accounts, PoolFileShape::Keyed(key)))
        }
        _ => Err("pool file must be an account array or a single-key object".to_string()),
    }
}

impl PoolManager {
    /// Load the pool from `config.provider_pools_file_path`. A missing file
    /// yields an empty pool that persists as a bare array.
    pub fn load(config: GatewayConfig, fallback_blob: Option<String>) -> Result<Arc<Self>, String> {
        let file_path = PathBuf::from(&config.provider_pools_file_path);

        let (accounts, shape) = match std::fs::read_to_string(&file_path) {
            Ok(content) => parse_pool_file(&content)?,
            Err(_) => {
                info!(
                    "Pool file {} not found, starting with an empty pool",
                    file_path.display()
                );
                (Vec::new(), PoolFileShape::Array)
            }
        };

        info!("Loaded {} account(s) from {}", accounts.len(), file_path.display());

        Ok(Arc::new(Self {
            accounts: Mutex::new(accounts),
            adapters: DashMap::new(),
            device_polls: DashMap::new(),
            file_path,
            file_shape: Mutex::new(shape),
            config,
            fallback_blob,
            dirty_gen: AtomicU64::new(0),
            save_notify: Notify::new(),
            cancel_token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    // ─── Selection ─────────────────────────────────────────────────────────

    /// LRU selection: healthy, enabled, model-compatible accounts sorted by
    /// `(lastUsed, usageCount)`; never-used accounts win. Advances `lastUsed`
    /// and charges `usageCount` unless `skip_usage_count` (fallback
    /// re-selects charge only once per user request).
    pub async fn select_account(
        &self,
        requested_model: Option<&str>,
        skip_usage_count: bool,
        exclude: &HashSet<String>,
    ) -> Option<PoolAccount> {
        let mut accounts = self.accounts.lock().await;

        let selected_idx = accounts
            .iter()
            .enumerate()
            .filter(|(_, a)| a.is_selectable(requested_model) && !exclude.contains(&a.uuid))
            .min_by_key(|(_, a)| a.lru_key())
            .map(|(idx, _)| idx)?;

        let account = &mut accounts[selected_idx];
        account.last_used = Some(Utc::now());
        if !skip_usage_count {
            account.usage_count += 1;
        }
        let snapshot = account.clone();
        drop(accounts);

        self.schedule_save();
        Some(snapshot)
    }

    // ─── Outcome marking ───────────────────────────────────────────────────

    /// Clear the error budget after a successful call. A probe resets
    /// `usageCount` and stamps the health-check fields; a request bumps
    /// `lastUsed` (usage was already charged at selection).
    pub async fn mark_healthy(&self, uuid: &str, probe: Option<&ProbeReport>) {
        let mut accounts = self.accounts.lock().await;
        if let Some(account) = accounts.iter_mut().find(|a| a.uuid == uuid) {
            account.is_healthy = true;
            account.error_count = 0;
            account.last_error_time = None;
            account.last_error_message = None;
            match probe {
                Some(report) => {
                    account.last_health_check_time = Some(Utc::now());
                    account.last_health_check_model = Some(report.model_name.clone());
                    account.usage_count = 0;
                }
                None => {
                    account.last_used = Some(Utc::now());
                }
            }
        }
        drop(accounts);
        self.schedule_save();
    }

    /// Count a failure against the budget; at `max_error_count` the account
    /// goes unhealthy. `lastUsed` is bumped so LRU does not immediately
    /// re-select the same failing account.
    pub async fn mark_unhealthy(&self, uuid: &str, error_message: &str) {
        let max_error_count = self.config.max_error_count;
        let mut accounts = self.accounts.lock().await;
        if let Some(account) = accounts.iter_mut().find(|a| a.uuid == uuid) {
            account.error_count += 1;
            account.last_error_time = Some(Utc::now());
            account.last_error_message = Some(error_message.to_string());
            account.last_used = Some(Utc::now());
            if account.error_count >= max_error_count {
                if account.is_healthy {
                    warn!(
                        "Account {} reached error budget ({}), marking unhealthy: {}",
                        uuid, account.error_count, error_message
                    );
                }
                account.is_healthy = false;
            }
        }
        drop(accounts);
        self.schedule_save();
    }

    // ─── Accounts CRUD ─────────────────────────────────────────────────────

    pub async fn add_account(&self, account: PoolAccount) {
        info!("Adding account {} to pool", account.uuid);
        self.accounts.lock().await.push(account);
        self.schedule_save();
    }

    pub async fn accounts_snapshot(&self) -> Vec<PoolAccount> {
        self.accounts.lock().await.clone()
    }

    /// Sync rotated token material from an auth manager back into the pool
    /// record.
    pub async fn sync_account_tokens(
        &self,
        uuid: &str,
        snapshot: crate::auth::kiro_auth::TokenSnapshot,
    ) {
        let mut accounts = self.accounts.lock().await;
        if let Some(account) = accounts.iter_mut().find(|a| a.uuid == uuid) {
            if snapshot.access_token.is_some() {
                account.access_token = snapshot.access_token;
            }
            if snapshot.refresh_token.is_some() {
                account.refresh_token = snapshot.refresh_token;
            }
            if snapshot.expires_at.is_some() {
                account.expires_at = snapshot.expires_at;
            }
            if snapshot.profile_arn.is_some() {
                account.profile_arn = snapshot.profile_arn;
            }
        }
        drop(accounts);
        self.schedule_save();
    }

    /// Get or create the adapter singleton for an account.
    pub fn adapter_for(&self, account: &PoolAccount) -> Arc<KiroAdapter> {
        self.adapters
            .entry(account.uuid.clone())
            .or_insert_with(|| {
                Arc::new(KiroAdapter::new(
                    account,
                    self.fallback_blob.as_deref(),
                    self.config.request_max_retries,
                    self.config.request_base_delay,
                ))
            })
            .clone()
    }

    // ─── Device-code poll registry ─────────────────────────────────────────

    /// Register a device-code poll under `task_id`; a prior poll for the
    /// same id is cancelled.
    pub fn begin_device_poll(&self, task_id: &str) -> CancellationToken {
        let token = self.cancel_token.child_token();
        if let Some(previous) = self.device_polls.insert(task_id.to_string(), token.clone()) {
            previous.cancel();
            info!("Cancelled previous device poll for {}", task_id);
        }
        token
    }

    pub fn end_device_poll(&self, task_id: &str) {
        self.device_polls.remove(task_id);
    }

    // ─── Persistence ───────────────────────────────────────────────────────

    /// Debounce-save: bump the generation and wake the flusher. Mutations
    /// landing within the quiet window coalesce into one write.
    pub fn schedule_save(&self) {
        self.dirty_gen.fetch_add(1, Ordering::SeqCst);
        self.save_notify.notify_one();
    }

    /// Serialize the pool, preserving the file shape that was read (a file
    /// created by this gateway is a bare array). Temp-file + rename.
    pub async fn flush_to_disk(&self) -> Result<(), String> {
        let accounts = self.accounts.lock().await.clone();

        // Re-read the current file so an externally rewritten shape wins.
        let remembered = self.file_shape.lock().await.clone();
        let shape = match tokio::fs::read_to_string(&self.file_path).await {
            Ok(content) => match parse_pool_file(&content) {
                Ok((_, shape)) => shape,
                Err(_) => remembered,
            },
            Err(_) => remembered,
        };

        let value = match &shape {
            PoolFileShape::Array => json!(accounts),
            PoolFileShape::Keyed(key) => {
                let mut map = serde_json::Map::new();
                map.insert(key.clone(), json!(accounts));
                Value::Object(map)
            }
        };
        *self.file_shape.lock().await = shape;

        let content = serde_json::to_string_pretty(&value)
            .map_err(|e| format!("failed to serialize pool: {}", e))?;

        if let Some(parent) = self.file_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| format!("failed to create {}: {}", parent.display(), e))?;
            }
        }

        let tmp_path = self.file_path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, content)
            .await
            .map_err(|e| format!("failed to write pool file: {}", e))?;
        tokio::fs::rename(&tmp_path, &self.file_path)
            .await
            .map_err(|e| format!("failed to rename pool file: {}", e))?;

        debug!("Pool persisted to {}", self.file_path.display());
        Ok(())
    }

    async fn flusher_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => break,
                _ = self.save_notify.notified() => {}
            }

            // Wait out the quiet window; restart it while mutations keep
            // arriving.
            loop {
                let generation = self.dirty_gen.load(Ordering::SeqCst);
                tokio::select! {
                    _ = self.cancel_token.cancelled() => {
                        if let Err(e) = self.flush_to_disk().await {
                            warn!("Final pool flush failed: {}", e);
                        }
                        return;
                    }
                    _ = tokio::time::sleep(std::time::Duration::from_millis(SAVE_DEBOUNCE_MS)) => {}
                }
                if self.dirty_gen.load(Ordering::SeqCst) == generation {
                    break;
                }
            }

            if let Err(e) = self.flush_to_disk().await {
                warn!("Pool flush failed: {}", e);
            }
        }
    }

    // ─── Health probes ─────────────────────────────────────────────────────

    /// Probe one account through its adapter and feed the outcome back into
    /// the health marks. Probes are bounded at 30 s.
    pub async fn probe_account(&self, account: &PoolAccount) -> ProbeReport {
        let model_name = account.probe_model().to_string();
        let adapter = self.adapter_for(account);

        let outcome =
            tokio::time::timeout(std::time::Duration::from_secs(30), adapter.probe(&model_name))
                .await;

        let report = match outcome {
            Ok(Ok(())) => ProbeReport {
                success: true,
                model_name,
                error_message: None,
            },
            Ok(Err(e)) => ProbeReport {
                success: false,
                model_name,
                error_message: Some(e.message()),
            },
            Err(_) => ProbeReport {
                success: false,
                model_name,
                error_message: Some("probe timed out after 30s".to_string()),
            },
        };

        if report.success {
            self.mark_healthy(&account.uuid, Some(&report)).await;
        } else {
            self.mark_unhealthy(
                &account.uuid,
                report.error_message.as_deref().unwrap_or("probe failed"),
            )
            .await;
        }
        report
    }

    async fn health_check_loop(self: Arc<Self>) {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(HEALTH_CHECK_INTERVAL_SECS));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup stays quiet.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => break,
                _ = interval.tick() => {}
            }

            let candidates: Vec<PoolAccount> = {
                let accounts = self.accounts.lock().await;
                let now = Utc::now();
                accounts
                    .iter()
                    .filter(|a| {
                        a.check_health
                            && !a.is_disabled
                            && a.last_error_time.map_or(true, |t| {
                                (now - t).num_seconds() as u64 >= HEALTH_CHECK_INTERVAL_SECS
                            })
                    })
                    .cloned()
                    .collect()
            };

            for account in candidates {
                if self.cancel_token.is_cancelled() {
                    break;
                }
                let report = self.probe_account(&account).await;
                debug!(
                    "Probe {}: success={} model={} error={:?}",
                    account.uuid, report.success, report.model_name, report.error_message
                );
            }
        }
    }

    // ─── Token heartbeat ───────────────────────────────────────────────────

    async fn heartbeat_loop(self: Arc<Self>) {
        let minutes = self.config.cron_near_minutes.max(1);
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(minutes as u64 * 60));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => break,
                _ = interval.tick() => {}
            }

            let snapshot = self.accounts_snapshot().await;
            for account in snapshot.iter().filter(|a| !a.is_disabled) {
                let adapter = self.adapter_for(account);
                match adapter.refresh_if_near(minutes).await {
                    Ok(true) => {
                        let tokens = adapter.auth_manager().snapshot().await;
                        self.sync_account_tokens(&account.uuid, tokens).await;
                        info!("Heartbeat refreshed token for {}", account.uuid);
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!("Heartbeat refresh failed for {}: {}", account.uuid, e);
                    }
                }
            }
        }
    }

    // ─── Lifecycle ─────────────────────────────────────────────────────────

    /// Spawn the flusher, probe loop, and heartbeat.
    pub async fn start_background_tasks(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(Arc::clone(self).flusher_loop()));
        tasks.push(tokio::spawn(Arc::clone(self).health_check_loop()));
        if self.config.cron_refresh_token {
            tasks.push(tokio::spawn(Arc::clone(self).heartbeat_loop()));
        }
        info!("Pool background tasks started");
    }

    /// Cancel background tasks, flush state, and wait (bounded) for them to
    /// wind down.
    pub async fn graceful_shutdown(&self, timeout: std::time::Duration) {
        info!("Shutting down pool manager...");
        self.cancel_token.cancel();

        if let Err(e) = self.flush_to_disk().await {
            warn!("Shutdown pool flush failed: {}", e);
        }

        let drain = async {
            let mut tasks = self.tasks.lock().await;
            for task in tasks.drain(..) {
                task.abort();
                match task.await {
                    Ok(()) => {}
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => warn!("Background task error during shutdown: {}", e),
                }
            }
        };
        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!("Background tasks did not wind down within {:?}", timeout);
        }
    }

    // ─── Introspection ─────────────────────────────────────────────────────

    /// Pool summary for `/provider_health`. `summaryHealth` is true while
    /// the unhealthy share stays below `unhealthy_ratio_threshold`.
    pub async fn summary(&self, unhealthy_ratio_threshold: f64) -> Value {
        let accounts = self.accounts.lock().await;
        let total = accounts.len();
        let unhealthy = accounts
            .iter()
            .filter(|a| !a.is_healthy && !a.is_disabled)
            .count();
        let ratio = if total == 0 {
            0.0
        } else {
            unhealthy as f64 / total as f64
        };

        let entries: Vec<Value> = accounts
            .iter()
            .map(|a| {
                json!({
                    "uuid": a.uuid,
                    "name": a.name,
                    "isHealthy": a.is_healthy,
                    "isDisabled": a.is_disabled,
                    "errorCount": a.error_count,
                    "usageCount": a.usage_count,
                    "lastUsed": a.last_used.map(|t| t.to_rfc3339()),
                    "lastErrorMessage": a.last_error_message,
                    "lastHealthCheckTime": a.last_health_check_time.map(|t| t.to_rfc3339()),
                })
            })
            .collect();

        json!({
            "provider": "kiro",
            "total": total,
            "unhealthy": unhealthy,
            "unhealthyRatio": ratio,
            "summaryHealth": ratio < unhealthy_ratio_threshold,
            "accounts": entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::types::AuthMethod;

    fn test_config(dir: &std::path::Path) -> GatewayConfig {
        GatewayConfig {
            provider_pools_file_path: dir
                .join("provider_pools.json")
                .to_str()
                .unwrap()
                .to_string(),
            ..Default::default()
        }
    }

    fn account(name: &str) -> PoolAccount {
        let mut acc = PoolAccount::new(format!("/tmp/{}.json", name), AuthMethod::Social);
        acc.name = Some(name.to_string());
        acc
    }

    async fn pool_with_accounts(
        dir: &std::path::Path,
        names: &[&str],
    ) -> (Arc<PoolManager>, Vec<String>) {
        let pool = PoolManager::load(test_config(dir), None).unwrap();
        let mut uuids = Vec::new();
        for name in names {
            let acc = account(name);
            uuids.push(acc.uuid.clone());
            pool.add_account(acc).await;
        }
        (pool, uuids)
    }

    #[tokio::test]
    async fn test_lru_fairness_over_many_selections() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, _) = pool_with_accounts(dir.path(), &["a", "b", "c"]).await;

        for _ in 0..10 {
            let selected = pool.select_account(None, false, &HashSet::new()).await;
            assert!(selected.is_some());
        }

        let counts: Vec<u64> = pool
            .accounts_snapshot()
            .await
            .iter()
            .map(|a| a.usage_count)
            .collect();
        let max = *counts.iter().max().unwrap();
        let min = *counts.iter().min().unwrap();
        assert!(max - min <= 1, "usage counts diverged: {:?}", counts);
        assert_eq!(counts.iter().sum::<u64>(), 10);
    }

    #[tokio::test]
    async fn test_never_used_account_selected_first() {
        let dir = tempfile::tempdir().unwrap();
        let pool = PoolManager::load(test_config(dir.path()), None).unwrap();

        let mut seasoned = account("seasoned");
        seasoned.last_used = Some(Utc::now());
        seasoned.usage_count = 50;
        let fresh = account("fresh");
        let fresh_uuid = fresh.uuid.clone();

        pool.add_account(seasoned).await;
        pool.add_account(fresh).await;

        let selected = pool
            .select_account(None, false, &HashSet::new())
            .await
            .unwrap();
        assert_eq!(selected.uuid, fresh_uuid);
    }

    #[tokio::test]
    async fn test_model_affinity_filter() {
        let dir = tempfile::tempdir().unwrap();
        let pool = PoolManager::load(test_config(dir.path()), None).unwrap();

        let mut restricted = account("restricted");
        restricted.not_supported_models = vec!["claude-opus-4-6".into()];
        let restricted_uuid = restricted.uuid.clone();
        let open = account("open");
        let open_uuid = open.uuid.clone();

        pool.add_account(restricted).await;
        pool.add_account(open).await;

        // The restricted account is never returned for the excluded model.
        for _ in 0..4 {
            let selected = pool
                .select_account(Some("claude-opus-4-6"), false, &HashSet::new())
                .await
                .unwrap();
            assert_eq!(selected.uuid, open_uuid);
        }
        // Other models may still land on it.
        let selected = pool
            .select_account(Some("claude-haiku-4-5"), false, &HashSet::new())
            .await
            .unwrap();
        assert_eq!(selected.uuid, restricted_uuid);
    }

    #[tokio::test]
    async fn test_disabled_and_unhealthy_excluded() {
        let dir = tempfile::tempdir().unwrap();
        let pool = PoolManager::load(test_config(dir.path()), None).unwrap();

        let mut disabled = account("disabled");
        disabled.is_disabled = true;
        let mut sick = account("sick");
        sick.is_healthy = false;
        pool.add_account(disabled).await;
        pool.add_account(sick).await;

        assert!(pool.select_account(None, false, &HashSet::new()).await.is_none());
    }

    #[tokio::test]
    async fn test_skip_usage_count() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, uuids) = pool_with_accounts(dir.path(), &["solo"]).await;

        pool.select_account(None, true, &HashSet::new()).await.unwrap();
        let snapshot = pool.accounts_snapshot().await;
        assert_eq!(snapshot[0].usage_count, 0);
        assert!(snapshot[0].last_used.is_some());

        pool.select_account(None, false, &HashSet::new()).await.unwrap();
        let snapshot = pool.accounts_snapshot().await;
        assert_eq!(snapshot[0].usage_count, 1);
        assert_eq!(snapshot[0].uuid, uuids[0]);
    }

    #[tokio::test]
    async fn test_error_budget_trips_at_max() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, uuids) = pool_with_accounts(dir.path(), &["a", "b"]).await;

        // Default budget: 3
        for i in 1..=3u32 {
            pool.mark_unhealthy(&uuids[0], "HTTP 500").await;
            let acc = pool
                .accounts_snapshot()
                .await
                .into_iter()
                .find(|a| a.uuid == uuids[0])
                .unwrap();
            assert_eq!(acc.error_count, i);
            assert_eq!(acc.is_healthy, i < 3, "health wrong after {} errors", i);
        }

        // The next request routes to the healthy peer.
        let selected = pool
            .select_account(None, false, &HashSet::new())
            .await
            .unwrap();
        assert_eq!(selected.uuid, uuids[1]);
    }

    #[tokio::test]
    async fn test_mark_healthy_restores_budget() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, uuids) = pool_with_accounts(dir.path(), &["a"]).await;

        for _ in 0..5 {
            pool.mark_unhealthy(&uuids[0], "boom").await;
        }
        pool.mark_healthy(&uuids[0], None).await;

        let acc = pool.accounts_snapshot().await.into_iter().next().unwrap();
        assert!(acc.is_healthy);
        assert_eq!(acc.error_count, 0);
        assert!(acc.last_error_time.is_none());
        assert!(acc.last_error_message.is_none());
    }

    #[tokio::test]
    async fn test_mark_healthy_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, uuids) = pool_with_accounts(dir.path(), &["a"]).await;

        pool.mark_healthy(&uuids[0], None).await;
        let first = pool.accounts_snapshot().await;
        pool.mark_healthy(&uuids[0], None).await;
        let second = pool.accounts_snapshot().await;

        assert_eq!(first[0].is_healthy, second[0].is_healthy);
        assert_eq!(first[0].error_count, second[0].error_count);
        assert_eq!(first[0].usage_count, second[0].usage_count);
    }

    #[tokio::test]
    async fn test_probe_mark_resets_usage() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, uuids) = pool_with_accounts(dir.path(), &["a"]).await;

        pool.select_account(None, false, &HashSet::new()).await;
        pool.select_account(None, false, &HashSet::new()).await;

        let report = ProbeReport {
            success: true,
            model_name: "claude-haiku-4-5".into(),
            error_message: None,
        };
        pool.mark_healthy(&uuids[0], Some(&report)).await;

        let acc = pool.accounts_snapshot().await.into_iter().next().unwrap();
        assert_eq!(acc.usage_count, 0);
        assert_eq!(
            acc.last_health_check_model.as_deref(),
            Some("claude-haiku-4-5")
        );
        assert!(acc.last_health_check_time.is_some());
    }

    #[tokio::test]
    async fn test_exclusion_set_for_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, uuids) = pool_with_accounts(dir.path(), &["a", "b"]).await;

        let first = pool
            .select_account(None, false, &HashSet::new())
            .await
            .unwrap();
        let mut exclude = HashSet::new();
        exclude.insert(first.uuid.clone());

        let second = pool.select_account(None, true, &exclude).await.unwrap();
        assert_ne!(first.uuid, second.uuid);
        assert!(uuids.contains(&second.uuid));

        exclude.insert(second.uuid.clone());
        assert!(pool.select_account(None, true, &exclude).await.is_none());
    }

    #[tokio::test]
    async fn test_persistence_convergence_after_debounce() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, _) = pool_with_accounts(dir.path(), &["a", "b"]).await;
        pool.start_background_tasks().await;

        // A burst of mutations...
        for _ in 0..5 {
            pool.select_account(None, false, &HashSet::new()).await;
        }

        // ...converges on disk within the debounce window of going idle.
        tokio::time::sleep(std::time::Duration::from_millis(SAVE_DEBOUNCE_MS + 700)).await;

        let on_disk = std::fs::read_to_string(dir.path().join("provider_pools.json")).unwrap();
        let (disk_accounts, shape) = parse_pool_file(&on_disk).unwrap();
        assert_eq!(shape, PoolFileShape::Array);

        let in_memory = pool.accounts_snapshot().await;
        assert_eq!(disk_accounts.len(), in_memory.len());
        for (disk, mem) in disk_accounts.iter().zip(in_memory.iter()) {
            assert_eq!(disk.uuid, mem.uuid);
            assert_eq!(disk.usage_count, mem.usage_count);
        }

        pool.graceful_shutdown(std::time::Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_legacy_keyed_file_shape_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("provider_pools.json");

        let acc = account("legacy");
        std::fs::write(
            &file_path,
            serde_json::to_string_pretty(&json!({"claude-kiro-oauth": [acc]})).unwrap(),
        )
        .unwrap();

        let pool = PoolManager::load(test_config(dir.path()), None).unwrap();
        assert_eq!(pool.accounts_snapshot().await.len(), 1);

        pool.select_account(None, false, &HashSet::new()).await;
        pool.flush_to_disk().await.unwrap();

        let flushed: Value =
            serde_json::from_str(&std::fs::read_to_string(&file_path).unwrap()).unwrap();
        let obj = flushed.as_object().expect("keyed shape preserved");
        assert_eq!(obj.len(), 1);
        assert!(obj.contains_key("claude-kiro-oauth"));
        assert_eq!(obj["claude-kiro-oauth"][0]["usageCount"], 1);
    }

    #[tokio::test]
    async fn test_summary_health_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, uuids) = pool_with_accounts(dir.path(), &["a", "b", "c", "d"]).await;

        let summary = pool.summary(0.5).await;
        assert_eq!(summary["summaryHealth"], true);
        assert_eq!(summary["total"], 4);

        for _ in 0..3 {
            pool.mark_unhealthy(&uuids[0], "x").await;
            pool.mark_unhealthy(&uuids[1], "x").await;
        }

        let summary = pool.summary(0.5).await;
        assert_eq!(summary["unhealthy"], 2);
        assert_eq!(summary["summaryHealth"], false);
    }

    #[tokio::test]
    async fn test_device_poll_registry_cancels_prior() {
        let dir = tempfile::tempdir().unwrap();
        let pool = PoolManager::load(test_config(dir.path()), None).unwrap();

        let first = pool.begin_device_poll("login-1");
        assert!(!first.is_cancelled());
        let second = pool.begin_device_poll("login-1");
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        pool.end_device_poll("login-1");
    }
}
