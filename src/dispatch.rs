use crate::client::NodeApi;
use crate::dedup::PendingIndex;
use crate::providers::LocalClockStore;
use crate::types::{Fingerprint, JobHandle, SyncJob, SyncKind};
use eyre::{eyre, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Everything a sync worker needs besides the job itself.
#[derive(Clone)]
pub struct WorkerContext {
    pub api: Arc<dyn NodeApi>,
    pub local: Arc<dyn LocalClockStore>,
    pub max_export_clock_range: u64,
    pub monitor_poll_interval: Duration,
    pub monitor_deadline: Duration,
}

/// Outcome of monitoring one sync push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncVerdict {
    CaughtUp,
    /// The target either stopped short of one export window or never caught
    /// up before the deadline; a successor job continues the walk.
    AdditionalSyncRequired,
}

/// Two FIFO sync queues (manual, recurring) with independent bounded worker
/// pools, fronted by the pending-job de-duplicator.
pub struct SyncDispatcher {
    index: PendingIndex,
    manual_tx: mpsc::UnboundedSender<JobHandle>,
    recurring_tx: mpsc::UnboundedSender<JobHandle>,
    next_id: AtomicU64,
}

impl SyncDispatcher {
    /// Spawn both worker pools and return the shared dispatcher handle.
    pub fn start(
        manual_workers: usize,
        recurring_workers: usize,
        ctx: WorkerContext,
    ) -> Arc<Self> {
        let (manual_tx, manual_rx) = mpsc::unbounded_channel();
        let (recurring_tx, recurring_rx) = mpsc::unbounded_channel();

        let dispatcher = Arc::new(Self {
            index: PendingIndex::new(),
            manual_tx,
            recurring_tx,
            next_id: AtomicU64::new(1),
        });

        spawn_pool(dispatcher.clone(), manual_rx, manual_workers, ctx.clone(), "manual");
        spawn_pool(dispatcher.clone(), recurring_rx, recurring_workers, ctx, "recurring");

        dispatcher
    }

    /// Enqueue a sync unless an identical one is already pending, in which
    /// case the existing handle is returned and no new job is created.
    pub fn enqueue(
        &self,
        kind: SyncKind,
        wallet: &str,
        source: &str,
        target: &str,
        immediate: bool,
    ) -> Result<JobHandle> {
        let fp = Fingerprint {
            kind,
            wallet: wallet.to_string(),
            target: target.to_string(),
        };

        loop {
            if let Some(existing) = self.index.lookup(&fp) {
                return Ok(existing);
            }

            let handle = JobHandle {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                job: Arc::new(SyncJob {
                    kind,
                    wallet: wallet.to_string(),
                    source: source.to_string(),
                    target: target.to_string(),
                    immediate,
                    enqueued_at: Instant::now(),
                }),
            };

            if !self.index.try_record(fp.clone(), handle.clone()) {
                // Lost an insert race; loop around and return the winner.
                continue;
            }

            let tx = match kind {
                SyncKind::Manual => &self.manual_tx,
                SyncKind::Recurring => &self.recurring_tx,
            };
            if tx.send(handle.clone()).is_err() {
                self.index.remove(&fp);
                return Err(eyre!("{kind} sync queue is closed"));
            }

            tracing::debug!(
                kind = %kind,
                wallet,
                target,
                immediate,
                job_id = handle.id,
                "sync job enqueued"
            );
            return Ok(handle);
        }
    }

    /// Depth of the pending index across both queues.
    pub fn pending_len(&self) -> usize {
        self.index.len()
    }

    /// Snapshot of pending jobs. Diagnostic use only.
    pub fn pending_jobs(&self) -> Vec<JobHandle> {
        self.index.pending_jobs()
    }

    #[cfg(test)]
    pub(crate) fn index(&self) -> &PendingIndex {
        &self.index
    }
}

fn spawn_pool(
    dispatcher: Arc<SyncDispatcher>,
    rx: mpsc::UnboundedReceiver<JobHandle>,
    workers: usize,
    ctx: WorkerContext,
    pool: &'static str,
) {
    if workers == 0 {
        // A paused pool keeps its queue open; jobs accumulate as pending
        // until a worker exists to drain them.
        tokio::spawn(async move {
            let _parked = rx;
            futures::future::pending::<()>().await
        });
        return;
    }

    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    for worker in 0..workers {
        let rx = rx.clone();
        let ctx = ctx.clone();
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            loop {
                // Workers share one receiver, so jobs leave the queue in FIFO
                // order even though they run in parallel.
                let handle = {
                    let mut guard = rx.lock().await;
                    guard.recv().await
                };
                let Some(handle) = handle else { break };

                // Pending -> active: free the fingerprint so a successor
                // pending job can be created while this one runs.
                dispatcher.index.remove(&handle.job.fingerprint());

                let job = &handle.job;
                let waited_ms = job.enqueued_at.elapsed().as_millis() as u64;
                tracing::info!(
                    pool,
                    worker,
                    job_id = handle.id,
                    wallet = %job.wallet,
                    target = %job.target,
                    waited_ms,
                    "sync job started"
                );

                match run_sync_job(&ctx, job).await {
                    Ok(SyncVerdict::CaughtUp) => {
                        tracing::info!(pool, job_id = handle.id, wallet = %job.wallet, "sync caught up");
                    }
                    Ok(SyncVerdict::AdditionalSyncRequired) => {
                        tracing::info!(
                            pool,
                            job_id = handle.id,
                            wallet = %job.wallet,
                            target = %job.target,
                            "target still behind; enqueueing follow-up sync"
                        );
                        if let Err(err) = dispatcher.enqueue(
                            job.kind,
                            &job.wallet,
                            &job.source,
                            &job.target,
                            false,
                        ) {
                            tracing::warn!(pool, error = %err, "failed to enqueue follow-up sync");
                        }
                    }
                    Err(err) => {
                        // Failed jobs are not retained; the next scan
                        // re-observes the gap and enqueues afresh.
                        tracing::warn!(
                            pool,
                            job_id = handle.id,
                            wallet = %job.wallet,
                            target = %job.target,
                            error = %err,
                            "sync job failed"
                        );
                    }
                }
            }
        });
    }
}

async fn run_sync_job(ctx: &WorkerContext, job: &SyncJob) -> Result<SyncVerdict> {
    // Capture the primary-side clock before the push; the monitor measures
    // the target against this snapshot.
    let primary_clock = ctx.local.clock_for(&job.wallet).await?;

    ctx.api
        .request_sync(&job.target, &job.wallet, &job.source, job.kind, job.immediate)
        .await?;

    Ok(monitor_target(ctx, job, primary_clock).await)
}

/// Poll the target's clock until it catches up to the pre-push primary clock
/// or the deadline expires. Transport errors are logged and polling continues.
async fn monitor_target(ctx: &WorkerContext, job: &SyncJob, primary_clock: u64) -> SyncVerdict {
    let deadline = Instant::now() + ctx.monitor_deadline;
    loop {
        let now = Instant::now();
        if now >= deadline {
            tracing::warn!(
                wallet = %job.wallet,
                target = %job.target,
                primary_clock,
                "sync monitoring deadline expired"
            );
            return SyncVerdict::AdditionalSyncRequired;
        }
        tokio::time::sleep(ctx.monitor_poll_interval.min(deadline - now)).await;

        match ctx.api.clock_status(&job.target, &job.wallet).await {
            Ok(secondary_clock) => {
                if let Some(verdict) =
                    sample_decision(primary_clock, secondary_clock, ctx.max_export_clock_range)
                {
                    return verdict;
                }
            }
            Err(err) => {
                tracing::warn!(
                    wallet = %job.wallet,
                    target = %job.target,
                    error = %err,
                    "clock poll failed; continuing to monitor"
                );
            }
        }
    }
}

/// Decision for one monitoring sample. `None` means keep polling.
fn sample_decision(primary: u64, secondary: u64, max_export_range: u64) -> Option<SyncVerdict> {
    if secondary.saturating_add(max_export_range) < primary {
        // The gap exceeds one export window; this push can never close it.
        return Some(SyncVerdict::AdditionalSyncRequired);
    }
    if secondary >= primary {
        return Some(SyncVerdict::CaughtUp);
    }
    None
}
