//! End-to-end passes of the state machine against in-process collaborators.

use async_trait::async_trait;
use eyre::{eyre, Result};
use replica_keeper::artifact::{ContentNodeEntry, FleetArtifact};
use replica_keeper::client::NodeApi;
use replica_keeper::config::EngineConfig;
use replica_keeper::dispatch::{SyncDispatcher, WorkerContext};
use replica_keeper::engine::Engine;
use replica_keeper::planner::ReconfigPlanner;
use replica_keeper::providers::{
    CandidateSet, Discovery, LocalClockStore, Registry, Selection, SpIdMap,
};
use replica_keeper::types::{SyncKind, UserRecord};
use replica_keeper::view::PeerSetView;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SELF: &str = "https://self.example.com";
const S1: &str = "https://s1.example.com";
const S2: &str = "https://s2.example.com";
const P2: &str = "https://p2.example.com";
const R0: &str = "https://r0.example.com";
const R1: &str = "https://r1.example.com";
const R2: &str = "https://r2.example.com";

#[derive(Default)]
struct FakeApi {
    down: HashSet<String>,
    clocks: HashMap<(String, String), u64>,
}

impl FakeApi {
    fn clock(mut self, endpoint: &str, wallet: &str, clock: u64) -> Self {
        self.clocks
            .insert((endpoint.to_string(), wallet.to_string()), clock);
        self
    }

    fn down(mut self, endpoint: &str) -> Self {
        self.down.insert(endpoint.to_string());
        self
    }
}

#[async_trait]
impl NodeApi for FakeApi {
    async fn check_health(&self, endpoint: &str) -> Result<()> {
        if self.down.contains(endpoint) {
            return Err(eyre!("connection refused"));
        }
        Ok(())
    }

    async fn clock_status(&self, endpoint: &str, wallet: &str) -> Result<u64> {
        self.clocks
            .get(&(endpoint.to_string(), wallet.to_string()))
            .copied()
            .ok_or_else(|| eyre!("no clock for {wallet} on {endpoint}"))
    }

    async fn batch_clock_status(
        &self,
        endpoint: &str,
        wallets: &[String],
    ) -> Result<HashMap<String, u64>> {
        if self.down.contains(endpoint) {
            return Err(eyre!("connection refused"));
        }
        Ok(wallets
            .iter()
            .filter_map(|w| {
                self.clocks
                    .get(&(endpoint.to_string(), w.clone()))
                    .map(|c| (w.clone(), *c))
            })
            .collect())
    }

    async fn request_sync(
        &self,
        _target: &str,
        _wallet: &str,
        _source: &str,
        _kind: SyncKind,
        _immediate: bool,
    ) -> Result<()> {
        Ok(())
    }
}

struct FakeDiscovery {
    users: Vec<UserRecord>,
}

#[async_trait]
impl Discovery for FakeDiscovery {
    async fn users_for(&self, _endpoint: &str) -> Result<Vec<UserRecord>> {
        Ok(self.users.clone())
    }
}

struct FailingDiscovery;

#[async_trait]
impl Discovery for FailingDiscovery {
    async fn users_for(&self, _endpoint: &str) -> Result<Vec<UserRecord>> {
        Err(eyre!("discovery unreachable"))
    }
}

struct FakeSelection;

#[async_trait]
impl Selection for FakeSelection {
    async fn auto_select(&self, _blacklist: &[String]) -> Result<CandidateSet> {
        Ok(CandidateSet {
            primary: R0.to_string(),
            secondaries: vec![R1.to_string(), R2.to_string()],
        })
    }
}

#[derive(Default)]
struct FakeRegistry {
    writes: Mutex<Vec<(u64, u64, Vec<u64>)>>,
}

#[async_trait]
impl Registry for FakeRegistry {
    async fn update_replica_set(
        &self,
        user_id: u64,
        primary_sp_id: u64,
        secondary_sp_ids: &[u64],
    ) -> Result<()> {
        self.writes
            .lock()
            .unwrap()
            .push((user_id, primary_sp_id, secondary_sp_ids.to_vec()));
        Ok(())
    }
}

struct FakeLocal {
    clocks: HashMap<String, u64>,
}

#[async_trait]
impl LocalClockStore for FakeLocal {
    async fn clock_for(&self, wallet: &str) -> Result<u64> {
        Ok(self.clocks.get(wallet).copied().unwrap_or(0))
    }

    async fn clocks_for(&self, wallets: &[String]) -> Result<HashMap<String, u64>> {
        Ok(wallets
            .iter()
            .filter_map(|w| self.clocks.get(w).map(|c| (w.clone(), *c)))
            .collect())
    }
}

fn user(id: u64, wallet: &str, p: &str, s1: Option<&str>, s2: Option<&str>) -> UserRecord {
    UserRecord {
        user_id: id,
        wallet: wallet.to_string(),
        primary: p.to_string(),
        secondary1: s1.map(str::to_string),
        secondary2: s2.map(str::to_string),
    }
}

fn sp_ids() -> Arc<SpIdMap> {
    let artifact = FleetArtifact {
        discovery_provider: "https://dp.example.com".to_string(),
        registry_relay: "https://relay.example.com".to_string(),
        content_nodes: vec![
            ContentNodeEntry { sp_id: 1, endpoint: SELF.to_string() },
            ContentNodeEntry { sp_id: 2, endpoint: S1.to_string() },
            ContentNodeEntry { sp_id: 3, endpoint: S2.to_string() },
            ContentNodeEntry { sp_id: 4, endpoint: R0.to_string() },
            ContentNodeEntry { sp_id: 5, endpoint: R1.to_string() },
            ContentNodeEntry { sp_id: 6, endpoint: R2.to_string() },
            ContentNodeEntry { sp_id: 7, endpoint: P2.to_string() },
        ],
    };
    Arc::new(SpIdMap::from_artifact(&artifact))
}

fn config(dry_run: bool) -> EngineConfig {
    EngineConfig::from_parts(
        SELF.to_string(),
        1,
        false,
        true,
        1,
        1,
        100,
        4,
        2,
        PathBuf::from("state/test.lock"),
        true,
        dry_run,
    )
    .unwrap()
}

struct Fleet {
    dispatcher: Arc<SyncDispatcher>,
    registry: Arc<FakeRegistry>,
    engine: Engine,
}

/// Engine wired against fakes, with zero sync workers so pending jobs stay
/// observable in the de-duplication index.
fn fleet(
    slice: u64,
    users: Vec<UserRecord>,
    api: FakeApi,
    self_clocks: &[(&str, u64)],
    dry_run: bool,
) -> Fleet {
    let api: Arc<FakeApi> = Arc::new(api);
    let local = Arc::new(FakeLocal {
        clocks: self_clocks
            .iter()
            .map(|(w, c)| (w.to_string(), *c))
            .collect(),
    });

    let dispatcher = SyncDispatcher::start(
        0,
        0,
        WorkerContext {
            api: api.clone(),
            local: local.clone(),
            max_export_clock_range: 100,
            monitor_poll_interval: Duration::from_millis(5),
            monitor_deadline: Duration::from_millis(50),
        },
    );

    let registry = Arc::new(FakeRegistry::default());
    let planner = ReconfigPlanner::new(
        Arc::new(FakeSelection),
        registry.clone(),
        api.clone(),
        sp_ids(),
        dispatcher.clone(),
        dry_run,
    );
    let view = PeerSetView::new(
        Arc::new(FakeDiscovery { users }),
        api.clone(),
        SELF.to_string(),
        4,
    );

    let engine = Engine::new(config(dry_run), view, dispatcher.clone(), planner, local)
        .with_slice(slice);

    Fleet {
        dispatcher,
        registry,
        engine,
    }
}

#[tokio::test]
async fn healthy_slice_produces_no_work() {
    // Three users in slice 0, everything healthy and converged.
    let users = vec![
        user(0, "0xa", SELF, Some(S1), Some(S2)),
        user(24, "0xb", SELF, Some(S1), Some(S2)),
        user(48, "0xc", SELF, Some(S1), Some(S2)),
    ];
    let api = FakeApi::default()
        .clock(S1, "0xa", 10)
        .clock(S2, "0xa", 10)
        .clock(S1, "0xb", 10)
        .clock(S2, "0xb", 10)
        .clock(S1, "0xc", 10)
        .clock(S2, "0xc", 10);

    let f = fleet(0, users, api, &[("0xa", 10), ("0xb", 10), ("0xc", 10)], false);
    let report = f.engine.run_iteration().await.unwrap();

    assert_eq!(report.users_in_slice, 3);
    assert_eq!(report.syncs_issued, 0);
    assert_eq!(report.reconfigs_planned, 0);
    assert!(f.registry.writes.lock().unwrap().is_empty());
    assert_eq!(f.dispatcher.pending_len(), 0);
}

#[tokio::test]
async fn behind_secondary_gets_one_recurring_sync() {
    // s1 is behind (5 < 10), s2 is converged.
    let users = vec![user(1, "0xw", SELF, Some(S1), Some(S2))];
    let api = FakeApi::default().clock(S1, "0xw", 5).clock(S2, "0xw", 10);

    let f = fleet(1, users, api, &[("0xw", 10)], false);
    let report = f.engine.run_iteration().await.unwrap();

    assert_eq!(report.syncs_issued, 1);
    let pending = f.dispatcher.pending_jobs();
    assert_eq!(pending.len(), 1);
    let job = &pending[0].job;
    assert_eq!(job.kind, SyncKind::Recurring);
    assert_eq!(job.target, S1);
    assert_eq!(job.source, SELF);
    assert!(!job.immediate);
}

#[tokio::test]
async fn secondary_with_no_clock_record_gets_a_sync() {
    let users = vec![user(1, "0xw", SELF, Some(S1), None)];
    // No clock recorded for s1 at all.
    let api = FakeApi::default();

    let f = fleet(1, users, api, &[("0xw", 10)], false);
    let report = f.engine.run_iteration().await.unwrap();
    assert_eq!(report.syncs_issued, 1);
}

#[tokio::test]
async fn ahead_or_equal_secondary_gets_no_sync() {
    let users = vec![user(1, "0xw", SELF, Some(S1), Some(S2))];
    // Equal on s1, ahead on s2 (possible mid-reconfiguration).
    let api = FakeApi::default().clock(S1, "0xw", 10).clock(S2, "0xw", 12);

    let f = fleet(1, users, api, &[("0xw", 10)], false);
    let report = f.engine.run_iteration().await.unwrap();
    assert_eq!(report.syncs_issued, 0);
    assert_eq!(f.dispatcher.pending_len(), 0);
}

#[tokio::test]
async fn unhealthy_secondary_is_replaced_and_seeded() {
    // s1 down, s2 healthy; this node keeps the primary slot.
    let users = vec![user(2, "0xw", SELF, Some(S1), Some(S2))];
    let api = FakeApi::default()
        .down(S1)
        .clock(SELF, "0xw", 10)
        .clock(S2, "0xw", 10);

    let f = fleet(2, users, api, &[("0xw", 10)], false);
    let report = f.engine.run_iteration().await.unwrap();

    assert_eq!(report.reconfigs_planned, 1);
    assert_eq!(report.reconfigs_failed, 0);

    // One manual immediate seed to the fresh node only; the surviving
    // secondary keeps its primary and needs no reseed.
    let manual: Vec<_> = f
        .dispatcher
        .pending_jobs()
        .into_iter()
        .filter(|h| h.job.kind == SyncKind::Manual)
        .collect();
    assert_eq!(manual.len(), 1);
    assert_eq!(manual[0].job.source, SELF);
    assert_eq!(manual[0].job.target, R0);
    assert!(manual[0].job.immediate);

    let writes = f.registry.writes.lock().unwrap().clone();
    assert_eq!(writes, vec![(2, 1, vec![3, 4])]);
}

#[tokio::test]
async fn sole_surviving_primary_picks_two_fresh_secondaries() {
    // Both secondaries down; self is the only survivor.
    let users = vec![user(3, "0xw", SELF, Some(S1), Some(S2))];
    let api = FakeApi::default().down(S1).down(S2);

    let f = fleet(3, users, api, &[("0xw", 10)], false);
    let report = f.engine.run_iteration().await.unwrap();

    assert_eq!(report.reconfigs_planned, 1);

    let mut targets: Vec<String> = f
        .dispatcher
        .pending_jobs()
        .into_iter()
        .filter(|h| h.job.kind == SyncKind::Manual)
        .map(|h| h.job.target.clone())
        .collect();
    targets.sort();
    assert_eq!(targets, vec![R0.to_string(), R1.to_string()]);
    for handle in f.dispatcher.pending_jobs() {
        assert_eq!(handle.job.source, SELF);
        assert!(handle.job.immediate);
    }

    let writes = f.registry.writes.lock().unwrap().clone();
    assert_eq!(writes, vec![(3, 1, vec![4, 5])]);
}

#[tokio::test]
async fn dead_primary_hands_the_slot_to_the_higher_clock_secondary() {
    // Observed from a secondary: the primary is down, the other secondary
    // is ahead of us, so it should take over.
    let users = vec![user(4, "0xw", P2, Some(SELF), Some(S2))];
    let api = FakeApi::default()
        .down(P2)
        .clock(SELF, "0xw", 5)
        .clock(S2, "0xw", 9);

    let f = fleet(4, users, api, &[("0xw", 5)], false);
    let report = f.engine.run_iteration().await.unwrap();

    assert_eq!(report.reconfigs_planned, 1);
    assert_eq!(report.syncs_issued, 0, "secondaries never issue convergence syncs");

    // The new primary reseeds both the demoted survivor and the fresh node.
    let mut seeds: Vec<(String, String)> = f
        .dispatcher
        .pending_jobs()
        .into_iter()
        .map(|h| (h.job.source.clone(), h.job.target.clone()))
        .collect();
    seeds.sort();
    assert_eq!(
        seeds,
        vec![
            (S2.to_string(), R0.to_string()),
            (S2.to_string(), SELF.to_string()),
        ]
    );

    let writes = f.registry.writes.lock().unwrap().clone();
    assert_eq!(writes, vec![(4, 3, vec![1, 4])]);
}

#[tokio::test]
async fn out_of_slice_users_are_ignored() {
    let users = vec![user(5, "0xw", SELF, Some(S1), Some(S2))];
    let api = FakeApi::default().down(S1);

    // Slice 4 never sees user 5.
    let f = fleet(4, users, api, &[("0xw", 10)], false);
    let report = f.engine.run_iteration().await.unwrap();

    assert_eq!(report.users_in_slice, 0);
    assert_eq!(report.reconfigs_planned, 0);
    assert_eq!(f.dispatcher.pending_len(), 0);
}

#[tokio::test]
async fn discovery_failure_aborts_the_iteration() {
    let api: Arc<FakeApi> = Arc::new(FakeApi::default());
    let local = Arc::new(FakeLocal { clocks: HashMap::new() });
    let dispatcher = SyncDispatcher::start(
        0,
        0,
        WorkerContext {
            api: api.clone(),
            local: local.clone(),
            max_export_clock_range: 100,
            monitor_poll_interval: Duration::from_millis(5),
            monitor_deadline: Duration::from_millis(50),
        },
    );
    let planner = ReconfigPlanner::new(
        Arc::new(FakeSelection),
        Arc::new(FakeRegistry::default()),
        api.clone(),
        sp_ids(),
        dispatcher.clone(),
        false,
    );
    let view = PeerSetView::new(Arc::new(FailingDiscovery), api, SELF.to_string(), 4);
    let engine = Engine::new(config(false), view, dispatcher, planner, local).with_slice(0);

    assert!(engine.run_iteration().await.is_err());
}

#[tokio::test]
async fn dry_run_plans_but_mutates_nothing() {
    let users = vec![user(2, "0xw", SELF, Some(S1), Some(S2))];
    let api = FakeApi::default()
        .down(S1)
        .clock(SELF, "0xw", 10)
        .clock(S2, "0xw", 4);

    let f = fleet(2, users, api, &[("0xw", 10)], true);
    let report = f.engine.run_iteration().await.unwrap();

    // The behind secondary and the degraded replica set are both observed,
    // but nothing is enqueued or written.
    assert_eq!(report.syncs_issued, 0);
    assert_eq!(report.reconfigs_planned, 1);
    assert_eq!(f.dispatcher.pending_len(), 0);
    assert!(f.registry.writes.lock().unwrap().is_empty());
}
