use eyre::{eyre, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Number of user shards; one slice is processed per iteration, so the full
/// user set is covered once per 24 iterations (hourly in production).
pub const MODULO_BASE: u64 = 24;

/// Inter-iteration delay on the production schedule.
pub const PRODUCTION_SCAN_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Inter-iteration delay with `--dev-mode`, for local fleets.
pub const DEV_SCAN_INTERVAL: Duration = Duration::from_secs(3);

/// How often a worker samples the target's clock after pushing a sync.
pub const SYNC_MONITOR_POLL_INTERVAL: Duration = Duration::from_millis(15_000);

/// Hard deadline on monitoring one sync; expiry means a successor job
/// continues the walk.
pub const SYNC_MONITOR_DEADLINE: Duration = Duration::from_millis(360_000);

/// Validated engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// This node's public base URL, trailing slash stripped.
    pub self_endpoint: String,
    /// This node's service-provider id in the registry.
    pub sp_id: u64,

    /// Metadata-only nodes never run the reconciliation engine.
    pub user_metadata_node: bool,

    pub scan_interval: Duration,

    pub manual_sync_workers: usize,
    pub recurring_sync_workers: usize,

    /// Largest clock distance one sync request can cover. A secondary further
    /// behind than this needs a follow-up job after the current one lands.
    pub max_export_clock_range: u64,

    /// Fan-out bound for health probes within one iteration.
    pub probe_concurrency: usize,

    pub http_timeout: Duration,

    pub monitor_poll_interval: Duration,
    pub monitor_deadline: Duration,

    pub lock_file: PathBuf,

    pub once: bool,
    pub dry_run: bool,
}

impl EngineConfig {
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        self_endpoint: String,
        sp_id: u64,
        user_metadata_node: bool,
        dev_mode: bool,
        manual_sync_workers: usize,
        recurring_sync_workers: usize,
        max_export_clock_range: u64,
        probe_concurrency: usize,
        http_timeout_seconds: u64,
        lock_file: PathBuf,
        once: bool,
        dry_run: bool,
    ) -> Result<Self> {
        let self_endpoint = self_endpoint.trim().trim_end_matches('/').to_string();
        if self_endpoint.is_empty() {
            return Err(eyre!(
                "no self endpoint configured. pass --endpoint or set REPLICA_KEEPER_ENDPOINT"
            ));
        }
        if !self_endpoint.starts_with("http://") && !self_endpoint.starts_with("https://") {
            return Err(eyre!(
                "self endpoint '{self_endpoint}' must be an absolute http(s) base URL"
            ));
        }

        if manual_sync_workers == 0 {
            return Err(eyre!("manual sync concurrency must be > 0"));
        }
        if recurring_sync_workers == 0 {
            return Err(eyre!("recurring sync concurrency must be > 0"));
        }
        if probe_concurrency == 0 {
            return Err(eyre!("probe concurrency must be > 0"));
        }
        if max_export_clock_range == 0 {
            return Err(eyre!("max export clock range must be > 0"));
        }

        let scan_interval = if dev_mode {
            DEV_SCAN_INTERVAL
        } else {
            PRODUCTION_SCAN_INTERVAL
        };

        if dev_mode {
            tracing::warn!(
                interval_s = scan_interval.as_secs(),
                "dev mode enabled; scanning far more often than the production schedule"
            );
        }

        Ok(Self {
            self_endpoint,
            sp_id,
            user_metadata_node,
            scan_interval,
            manual_sync_workers,
            recurring_sync_workers,
            max_export_clock_range,
            probe_concurrency,
            http_timeout: Duration::from_secs(http_timeout_seconds.max(1)),
            monitor_poll_interval: SYNC_MONITOR_POLL_INTERVAL,
            monitor_deadline: SYNC_MONITOR_DEADLINE,
            lock_file,
            once,
            dry_run,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Result<EngineConfig> {
        EngineConfig::from_parts(
            "https://cn1.example.com/".to_string(),
            1,
            false,
            true,
            2,
            4,
            10_000,
            8,
            10,
            PathBuf::from("state/keeper.lock"),
            false,
            false,
        )
    }

    #[test]
    fn trailing_slash_is_stripped() {
        let cfg = base().unwrap();
        assert_eq!(cfg.self_endpoint, "https://cn1.example.com");
    }

    #[test]
    fn dev_mode_selects_short_interval() {
        let cfg = base().unwrap();
        assert_eq!(cfg.scan_interval, DEV_SCAN_INTERVAL);
    }

    #[test]
    fn zero_worker_counts_are_rejected() {
        let err = EngineConfig::from_parts(
            "https://cn1.example.com".into(),
            1,
            false,
            true,
            0,
            4,
            10_000,
            8,
            10,
            PathBuf::from("l"),
            false,
            false,
        );
        assert!(err.is_err());
    }

    #[test]
    fn relative_endpoint_is_rejected() {
        let err = EngineConfig::from_parts(
            "cn1.example.com".into(),
            1,
            false,
            true,
            2,
            4,
            10_000,
            8,
            10,
            PathBuf::from("l"),
            false,
            false,
        );
        assert!(err.is_err());
    }
}
