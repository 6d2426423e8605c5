use crate::config::{EngineConfig, MODULO_BASE};
use crate::dispatch::SyncDispatcher;
use crate::planner::{PlanOutcome, ReconfigOp, ReconfigPlanner};
use crate::providers::LocalClockStore;
use crate::types::{Endpoint, SyncKind, UserRecord};
use crate::view::PeerSetView;
use eyre::{eyre, Result};
use rand::Rng;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

/// Work derived from one scan of the current slice.
pub(crate) struct WorkPlan {
    /// `(user, healthy secondary)` pairs that may need a convergence push.
    pub potential_syncs: Vec<(UserRecord, Endpoint)>,
    /// Every sliced user, with whatever replicas failed probing.
    pub reconfig_ops: Vec<ReconfigOp>,
}

/// Classify one slice of users against the probe results.
///
/// When this node is the primary, healthy secondaries become sync
/// candidates. When it is a secondary, it only watches for unhealthy
/// replicas. Absent secondary slots are not peers and are never unhealthy.
pub(crate) fn plan_work(
    self_endpoint: &str,
    users: &[UserRecord],
    unhealthy: &HashSet<Endpoint>,
) -> WorkPlan {
    let mut plan = WorkPlan {
        potential_syncs: Vec::new(),
        reconfig_ops: Vec::new(),
    };

    for user in users {
        let mut bad = BTreeSet::new();
        if user.primary == self_endpoint {
            for secondary in user.secondaries() {
                if unhealthy.contains(secondary) {
                    bad.insert(secondary.clone());
                } else {
                    plan.potential_syncs.push((user.clone(), secondary.clone()));
                }
            }
        } else {
            for replica in user.replicas() {
                if replica.as_str() != self_endpoint && unhealthy.contains(replica) {
                    bad.insert(replica.clone());
                }
            }
        }
        plan.reconfig_ops.push(ReconfigOp {
            user: user.clone(),
            unhealthy: bad,
        });
    }

    plan
}

pub(crate) fn advance_slice(slice: u64) -> u64 {
    (slice + 1) % MODULO_BASE
}

/// Stage-labelled audit trail for one iteration, emitted as a single
/// structured line when the pass completes.
struct IterationAudit {
    stages: Vec<String>,
}

impl IterationAudit {
    fn new() -> Self {
        Self { stages: Vec::new() }
    }

    fn note(&mut self, stage: &str, detail: impl std::fmt::Display) {
        self.stages.push(format!("{stage}={detail}"));
    }

    fn render(&self) -> String {
        self.stages.join(" ")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IterationReport {
    pub users_total: usize,
    pub users_in_slice: usize,
    pub unhealthy_peers: usize,
    pub syncs_issued: usize,
    pub reconfigs_planned: usize,
    pub reconfigs_failed: usize,
}

/// The periodic replica-set state machine. One instance per process; the
/// supervisor loop never overlaps iterations.
pub struct Engine {
    cfg: EngineConfig,
    view: PeerSetView,
    dispatcher: Arc<SyncDispatcher>,
    planner: ReconfigPlanner,
    local: Arc<dyn LocalClockStore>,
    slice: u64,
}

impl Engine {
    pub fn new(
        cfg: EngineConfig,
        view: PeerSetView,
        dispatcher: Arc<SyncDispatcher>,
        planner: ReconfigPlanner,
        local: Arc<dyn LocalClockStore>,
    ) -> Self {
        // A random starting slice spreads iteration load across the fleet
        // instead of stampeding the same shard from every node.
        let slice = rand::thread_rng().gen_range(0..MODULO_BASE);
        Self {
            cfg,
            view,
            dispatcher,
            planner,
            local,
            slice,
        }
    }

    /// Pin the starting slice. Deterministic runs only (tests, debugging).
    pub fn with_slice(mut self, slice: u64) -> Self {
        self.slice = slice % MODULO_BASE;
        self
    }

    pub fn slice(&self) -> u64 {
        self.slice
    }

    /// Supervisor loop: run one iteration, advance the slice whatever
    /// happened, sleep, repeat. Single-flight by construction.
    pub async fn run(mut self) -> Result<()> {
        tracing::info!(
            slice = self.slice,
            interval_s = self.cfg.scan_interval.as_secs(),
            dry_run = self.cfg.dry_run,
            "state machine starting"
        );

        loop {
            if let Err(err) = self.run_iteration().await {
                tracing::warn!(
                    slice = self.slice,
                    error = %err,
                    "scan iteration failed; slice still advances"
                );
            }
            self.slice = advance_slice(self.slice);

            if self.cfg.once {
                break;
            }
            tokio::time::sleep(self.cfg.scan_interval).await;
        }

        Ok(())
    }

    /// One full pass over the current slice.
    pub async fn run_iteration(&self) -> Result<IterationReport> {
        let started = Instant::now();
        let mut audit = IterationAudit::new();
        let mut report = IterationReport::default();

        let users = self.view.list_users().await?;
        report.users_total = users.len();
        audit.note("users", users.len());

        let in_slice: Vec<UserRecord> = users
            .into_iter()
            .filter(|u| u.user_id % MODULO_BASE == self.slice)
            .collect();
        report.users_in_slice = in_slice.len();
        audit.note("in_slice", in_slice.len());

        let unhealthy = self.view.unhealthy_peers(&in_slice).await;
        report.unhealthy_peers = unhealthy.len();
        audit.note("unhealthy_peers", unhealthy.len());

        let plan = plan_work(&self.cfg.self_endpoint, &in_slice, &unhealthy);
        audit.note("potential_syncs", plan.potential_syncs.len());

        let mut wallets_by_secondary: HashMap<Endpoint, Vec<String>> = HashMap::new();
        for (user, secondary) in &plan.potential_syncs {
            wallets_by_secondary
                .entry(secondary.clone())
                .or_default()
                .push(user.wallet.clone());
        }
        let clock_maps = self.view.fetch_clock_maps(&wallets_by_secondary).await?;

        let wallets: Vec<String> = plan
            .potential_syncs
            .iter()
            .map(|(u, _)| u.wallet.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let self_clocks = if wallets.is_empty() {
            HashMap::new()
        } else {
            self.local.clocks_for(&wallets).await?
        };

        let (issued, errors) =
            self.issue_convergence_syncs(&plan.potential_syncs, &clock_maps, &self_clocks);
        report.syncs_issued = issued;
        audit.note("syncs_issued", issued);
        if errors > issued {
            return Err(eyre!(
                "convergence sync issuing failed: {errors} errors against {issued} issued"
            ));
        }

        for op in &plan.reconfig_ops {
            match self.planner.process(op).await {
                Ok(PlanOutcome::AllHealthy) => {}
                Ok(PlanOutcome::Reconfigured { .. }) => report.reconfigs_planned += 1,
                Err(err) => {
                    report.reconfigs_failed += 1;
                    tracing::warn!(
                        user_id = op.user.user_id,
                        wallet = %op.user.wallet,
                        error = %err,
                        "replica set reconfiguration failed; will retry next pass"
                    );
                }
            }
        }
        audit.note("reconfigs", report.reconfigs_planned);
        audit.note("reconfig_errors", report.reconfigs_failed);

        tracing::info!(
            slice = self.slice,
            audit = %audit.render(),
            queue_depth = self.dispatcher.pending_len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "scan pass complete"
        );

        Ok(report)
    }

    /// Enqueue a recurring push for every healthy secondary whose reported
    /// clock is missing or behind this node's.
    fn issue_convergence_syncs(
        &self,
        potential_syncs: &[(UserRecord, Endpoint)],
        clock_maps: &HashMap<Endpoint, HashMap<String, u64>>,
        self_clocks: &HashMap<String, u64>,
    ) -> (usize, usize) {
        let mut issued = 0usize;
        let mut errors = 0usize;

        for (user, secondary) in potential_syncs {
            let self_clock = self_clocks.get(&user.wallet).copied().unwrap_or(0);
            let secondary_clock = clock_maps
                .get(secondary)
                .and_then(|m| m.get(&user.wallet))
                .copied();

            // A secondary with no record at all always needs a push.
            let behind = match secondary_clock {
                None => true,
                Some(sc) => self_clock > sc,
            };
            if !behind {
                continue;
            }

            if self.cfg.dry_run {
                tracing::info!(
                    wallet = %user.wallet,
                    target = %secondary,
                    self_clock,
                    secondary_clock = ?secondary_clock,
                    "DRY RUN: would enqueue recurring sync"
                );
                continue;
            }

            match self.dispatcher.enqueue(
                SyncKind::Recurring,
                &user.wallet,
                &self.cfg.self_endpoint,
                secondary,
                false,
            ) {
                Ok(_) => issued += 1,
                Err(err) => {
                    errors += 1;
                    tracing::warn!(
                        wallet = %user.wallet,
                        target = %secondary,
                        error = %err,
                        "failed to enqueue recurring sync"
                    );
                }
            }
        }

        (issued, errors)
    }
}
