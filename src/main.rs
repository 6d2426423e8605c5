use clap::Parser;
use eyre::{eyre, Result};
use fs2::FileExt;
use replica_keeper::artifact::FleetArtifact;
use replica_keeper::client::HttpNodeApi;
use replica_keeper::config::EngineConfig;
use replica_keeper::dispatch::{SyncDispatcher, WorkerContext};
use replica_keeper::engine::Engine;
use replica_keeper::planner::ReconfigPlanner;
use replica_keeper::providers::{
    HttpDiscovery, HttpRegistryRelay, SelfClockStore, ShuffleSelection, SpIdMap,
};
use replica_keeper::view::PeerSetView;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(
    name = "replica-keeper",
    version,
    about = "Replica-set reconciliation engine for a storage node"
)]
struct Args {
    /// Path to the fleet artifact JSON (collaborator URLs + provider table).
    #[arg(long, default_value = "fleet.json")]
    artifact: PathBuf,

    /// This node's public base URL. Falls back to REPLICA_KEEPER_ENDPOINT.
    #[arg(long)]
    endpoint: Option<String>,

    /// This node's service-provider id. Falls back to REPLICA_KEEPER_SP_ID.
    #[arg(long)]
    sp_id: Option<u64>,

    /// Metadata-only node: load config, log, and exit without reconciling.
    #[arg(long)]
    user_metadata_node: bool,

    /// Scan every 3 seconds instead of hourly. Local fleets only.
    #[arg(long)]
    dev_mode: bool,

    /// Worker count for the manual (reconfiguration seeding) sync queue.
    #[arg(long, default_value_t = 3)]
    max_manual_sync_concurrency: usize,

    /// Worker count for the recurring (convergence) sync queue.
    #[arg(long, default_value_t = 6)]
    max_recurring_sync_concurrency: usize,

    /// Largest clock distance one sync request can cover. A secondary
    /// further behind needs follow-up jobs to finish the walk.
    #[arg(long, default_value_t = 10_000)]
    max_export_clock_range: u64,

    /// Max concurrent health probes per scan.
    #[arg(long, default_value_t = 16)]
    probe_concurrency: usize,

    /// Per-request HTTP timeout in seconds.
    #[arg(long, default_value_t = 10)]
    http_timeout_seconds: u64,

    /// Lock file guarding against two engines reconciling the same node.
    #[arg(long, default_value = "state/keeper.lock")]
    lock_file: PathBuf,

    /// Run a single scan iteration and exit.
    #[arg(long)]
    once: bool,

    /// Don't enqueue syncs or write the registry; only log what would be done.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let artifact = FleetArtifact::load(&args.artifact)?;

    let self_endpoint = args
        .endpoint
        .or_else(|| std::env::var("REPLICA_KEEPER_ENDPOINT").ok())
        .ok_or_else(|| eyre!("no endpoint configured. pass --endpoint or set REPLICA_KEEPER_ENDPOINT"))?;

    let sp_id = match args.sp_id {
        Some(id) => id,
        None => std::env::var("REPLICA_KEEPER_SP_ID")
            .map_err(|_| eyre!("no sp id configured. pass --sp-id or set REPLICA_KEEPER_SP_ID"))?
            .parse::<u64>()
            .map_err(|e| eyre!("invalid REPLICA_KEEPER_SP_ID: {e}"))?,
    };

    let cfg = EngineConfig::from_parts(
        self_endpoint,
        sp_id,
        args.user_metadata_node,
        args.dev_mode,
        args.max_manual_sync_concurrency,
        args.max_recurring_sync_concurrency,
        args.max_export_clock_range,
        args.probe_concurrency,
        args.http_timeout_seconds,
        args.lock_file,
        args.once,
        args.dry_run,
    )?;

    if cfg.user_metadata_node {
        tracing::info!("metadata-only node; reconciliation engine stays disabled");
        return Ok(());
    }

    let sp_ids = Arc::new(SpIdMap::from_artifact(&artifact));

    // Hard safety check: the registry table must agree on who we are.
    // Reconciling under a wrong identity would push data to the wrong peers.
    match sp_ids.sp_id(&cfg.self_endpoint) {
        Some(id) if id == cfg.sp_id => {}
        Some(id) => {
            return Err(eyre!(
                "sp id mismatch: artifact maps {} to {}, but we are configured as {}. Refusing to run.",
                cfg.self_endpoint,
                id,
                cfg.sp_id
            ));
        }
        None => {
            return Err(eyre!(
                "our endpoint {} is not in the fleet artifact. Check the artifact and --endpoint.",
                cfg.self_endpoint
            ));
        }
    }

    // Ensure the lock directory exists before we create/lock the lockfile.
    if let Some(parent) = cfg.lock_file.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| eyre!("failed to create lock directory {}: {e}", parent.display()))?;
        }
    }

    // Single-instance guard: two engines reconciling the same node would
    // double-probe peers and race the registry.
    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&cfg.lock_file)
        .map_err(|e| eyre!("failed to open lock file {}: {e}", cfg.lock_file.display()))?;
    lock_file.try_lock_exclusive().map_err(|e| {
        eyre!(
            "engine already running or lock unavailable ({}): {e}",
            cfg.lock_file.display()
        )
    })?;
    // Keep file handle alive.
    let _lock_guard = lock_file;

    tracing::info!(
        endpoint = %cfg.self_endpoint,
        sp_id = cfg.sp_id,
        content_nodes = sp_ids.len(),
        dev_mode = args.dev_mode,
        once = cfg.once,
        dry_run = cfg.dry_run,
        "replica keeper starting"
    );

    let api: Arc<HttpNodeApi> = Arc::new(HttpNodeApi::new(cfg.http_timeout)?);
    let local = Arc::new(SelfClockStore::new(api.clone(), cfg.self_endpoint.clone()));

    let dispatcher = SyncDispatcher::start(
        cfg.manual_sync_workers,
        cfg.recurring_sync_workers,
        WorkerContext {
            api: api.clone(),
            local: local.clone(),
            max_export_clock_range: cfg.max_export_clock_range,
            monitor_poll_interval: cfg.monitor_poll_interval,
            monitor_deadline: cfg.monitor_deadline,
        },
    );

    let discovery = Arc::new(HttpDiscovery::new(
        artifact.discovery_provider.clone(),
        cfg.http_timeout,
    )?);
    let registry = Arc::new(HttpRegistryRelay::new(
        artifact.registry_relay.clone(),
        cfg.http_timeout,
    )?);
    let selection = Arc::new(ShuffleSelection::new(
        artifact
            .content_nodes
            .iter()
            .map(|n| n.endpoint.clone())
            .collect(),
    ));

    let view = PeerSetView::new(
        discovery,
        api.clone(),
        cfg.self_endpoint.clone(),
        cfg.probe_concurrency,
    );
    let planner = ReconfigPlanner::new(
        selection,
        registry,
        api.clone(),
        sp_ids,
        dispatcher.clone(),
        cfg.dry_run,
    );

    let engine = Engine::new(cfg, view, dispatcher, planner, local);
    engine.run().await
}
