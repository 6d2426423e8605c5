use crate::client::NodeApi;
use crate::dispatch::SyncDispatcher;
use crate::providers::{CandidateSet, Registry, Selection, SpIdMap};
use crate::types::{Endpoint, SyncKind, UserRecord};
use eyre::{eyre, Result};
use std::collections::BTreeSet;
use std::sync::Arc;

/// One user handed to the planner, with the replicas that failed probing
/// this iteration. Ephemeral; rebuilt on every pass.
#[derive(Debug, Clone)]
pub struct ReconfigOp {
    pub user: UserRecord,
    pub unhealthy: BTreeSet<Endpoint>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedSync {
    pub source: Endpoint,
    pub target: Endpoint,
}

/// The replacement replica set plus the manual pushes that seed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReplicaSet {
    pub primary: Endpoint,
    pub secondaries: [Endpoint; 2],
    pub seeds: Vec<SeedSync>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanOutcome {
    /// Nothing recorded unhealthy; the terminal state for a repaired user.
    AllHealthy,
    Reconfigured {
        new_primary: Endpoint,
        new_secondaries: [Endpoint; 2],
        seeds_enqueued: usize,
    },
}

/// Decides replacement replica sets and drives the registry update.
pub struct ReconfigPlanner {
    selection: Arc<dyn Selection>,
    registry: Arc<dyn Registry>,
    api: Arc<dyn NodeApi>,
    sp_ids: Arc<SpIdMap>,
    dispatcher: Arc<SyncDispatcher>,
    dry_run: bool,
}

impl ReconfigPlanner {
    pub fn new(
        selection: Arc<dyn Selection>,
        registry: Arc<dyn Registry>,
        api: Arc<dyn NodeApi>,
        sp_ids: Arc<SpIdMap>,
        dispatcher: Arc<SyncDispatcher>,
        dry_run: bool,
    ) -> Self {
        Self {
            selection,
            registry,
            api,
            sp_ids,
            dispatcher,
            dry_run,
        }
    }

    /// Plan and execute one user's reconfiguration. Errors are per-user; the
    /// caller logs them and moves on, relying on the next pass to retry.
    pub async fn process(&self, op: &ReconfigOp) -> Result<PlanOutcome> {
        if op.unhealthy.is_empty() {
            return Ok(PlanOutcome::AllHealthy);
        }

        let user = &op.user;
        let current: Vec<Endpoint> = user.replicas().cloned().collect();

        // The current members are blacklisted so the candidate set is always
        // fresh capacity; survivors are re-added below where they belong.
        let candidates = self.selection.auto_select(&current).await?;

        let healthy: Vec<Endpoint> = current
            .iter()
            .filter(|r| !op.unhealthy.contains(*r))
            .cloned()
            .collect();

        let survivor_clocks = if healthy.len() == 2 {
            self.fetch_survivor_clocks(&healthy, &user.wallet).await
        } else {
            vec![None; healthy.len()]
        };

        let plan = choose_new_set(&user.primary, &healthy, &survivor_clocks, &candidates)?;

        tracing::info!(
            user_id = user.user_id,
            wallet = %user.wallet,
            unhealthy = ?op.unhealthy,
            new_primary = %plan.primary,
            new_secondaries = ?plan.secondaries,
            seeds = plan.seeds.len(),
            "replica set reconfiguration planned"
        );

        if self.dry_run {
            tracing::info!(
                user_id = user.user_id,
                "DRY RUN: would enqueue seed syncs and write the registry"
            );
            return Ok(PlanOutcome::Reconfigured {
                new_primary: plan.primary,
                new_secondaries: plan.secondaries,
                seeds_enqueued: 0,
            });
        }

        let mut seeds_enqueued = 0usize;
        for seed in &plan.seeds {
            self.dispatcher
                .enqueue(SyncKind::Manual, &user.wallet, &seed.source, &seed.target, true)?;
            seeds_enqueued += 1;
        }

        let primary_sp_id = self
            .sp_ids
            .sp_id(&plan.primary)
            .ok_or_else(|| eyre!("no service-provider id known for {}", plan.primary))?;
        let secondary_sp_ids = [
            self.sp_ids
                .sp_id(&plan.secondaries[0])
                .ok_or_else(|| eyre!("no service-provider id known for {}", plan.secondaries[0]))?,
            self.sp_ids
                .sp_id(&plan.secondaries[1])
                .ok_or_else(|| eyre!("no service-provider id known for {}", plan.secondaries[1]))?,
        ];

        self.registry
            .update_replica_set(user.user_id, primary_sp_id, &secondary_sp_ids)
            .await?;

        Ok(PlanOutcome::Reconfigured {
            new_primary: plan.primary,
            new_secondaries: plan.secondaries,
            seeds_enqueued,
        })
    }

    /// Best-effort clock reads from the two survivors. An unreachable clock
    /// sorts below every real value, so the reachable survivor wins the
    /// primary election instead of the whole user failing.
    async fn fetch_survivor_clocks(
        &self,
        survivors: &[Endpoint],
        wallet: &str,
    ) -> Vec<Option<u64>> {
        let mut clocks = Vec::with_capacity(survivors.len());
        for endpoint in survivors {
            match self.api.clock_status(endpoint, wallet).await {
                Ok(clock) => clocks.push(Some(clock)),
                Err(err) => {
                    tracing::warn!(
                        peer = %endpoint,
                        wallet,
                        error = %err,
                        "could not read survivor clock; treating as lowest"
                    );
                    clocks.push(None);
                }
            }
        }
        clocks
    }
}

/// Pure classification of the replacement set.
///
/// `healthy` and `survivor_clocks` are parallel and ordered as the replicas
/// appear in `(primary, secondary1, secondary2)`; ties in the two-survivor
/// election therefore resolve to the earliest replica slot.
fn choose_new_set(
    old_primary: &Endpoint,
    healthy: &[Endpoint],
    survivor_clocks: &[Option<u64>],
    candidates: &CandidateSet,
) -> Result<NewReplicaSet> {
    let r0 = candidates.primary.clone();
    let [r1, r2] = match candidates.secondaries.as_slice() {
        [a, b] => [a.clone(), b.clone()],
        other => {
            return Err(eyre!(
                "selection returned {} secondaries; need exactly 2",
                other.len()
            ))
        }
    };

    match healthy {
        // Every replica is gone: start over on fresh nodes, seeding from the
        // old primary on the chance it still serves reads.
        [] => Ok(NewReplicaSet {
            primary: r0.clone(),
            secondaries: [r1.clone(), r2.clone()],
            seeds: vec![
                SeedSync { source: old_primary.clone(), target: r0 },
                SeedSync { source: old_primary.clone(), target: r1 },
                SeedSync { source: old_primary.clone(), target: r2 },
            ],
        }),

        // One survivor: the original primary keeps (or regains) the primary
        // slot and two fresh secondaries are seeded from it.
        [_single] => Ok(NewReplicaSet {
            primary: old_primary.clone(),
            secondaries: [r0.clone(), r1.clone()],
            seeds: vec![
                SeedSync { source: old_primary.clone(), target: r0 },
                SeedSync { source: old_primary.clone(), target: r1 },
            ],
        }),

        // Two survivors: the one with the higher clock holds the most data
        // and becomes primary; the other stays on as first secondary.
        [a, b] => {
            let best = if survivor_clocks.get(1).copied().flatten()
                > survivor_clocks.first().copied().flatten()
            {
                1
            } else {
                0
            };
            let (primary, other) = if best == 0 {
                (a.clone(), b.clone())
            } else {
                (b.clone(), a.clone())
            };

            let mut seeds = Vec::with_capacity(2);
            if primary != *old_primary {
                // The surviving secondary changes primaries, so it needs a
                // manual push from its new source; a survivor that keeps its
                // primary is already converged by the recurring scan.
                seeds.push(SeedSync { source: primary.clone(), target: other.clone() });
            }
            seeds.push(SeedSync { source: primary.clone(), target: r0.clone() });

            Ok(NewReplicaSet {
                primary,
                secondaries: [other, r0],
                seeds,
            })
        }

        _ => Err(eyre!(
            "{} healthy replicas with a non-empty unhealthy set; nothing to repair",
            healthy.len()
        )),
    }
}
