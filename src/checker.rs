//! The outer control loop: reconciliation cycles containing processing
//! rounds, and the worker pool that drains each round's workset.

use crate::config::Config;
use crate::exclusions::{ExclusionRegistry, OwnerDirectory};
use crate::fetcher::Probe;
use crate::metrics::Metrics;
use crate::models::{epoch_secs, VerdictEntry};
use crate::reconcile::{reconcile, RECONCILE_PAGE_SIZE};
use crate::source::IdentifierSource;
use crate::store::LinkStore;
use crate::workset::{Dispatch, Scheduler};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio::time::sleep;

/// How long the main loop naps when a round comes up with nothing to check.
const EMPTY_WORKSET_SLEEP: Duration = Duration::from_secs(60);

/// How long a worker naps when every owner is locked or cooling down.
const WAIT_SLEEP: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub struct RoundReport {
    pub checked: u64,
    pub elapsed: Duration,
    /// True when the round budget expired and the workers were stopped.
    pub timed_out: bool,
}

pub struct LinkChecker {
    config: Config,
    store: Arc<LinkStore>,
    source: Arc<dyn IdentifierSource>,
    exclusions: Arc<ExclusionRegistry>,
    directory: OwnerDirectory,
    scheduler: Arc<Scheduler>,
    probe: Arc<Probe>,
    metrics: Arc<Metrics>,
}

impl LinkChecker {
    pub fn new(
        config: Config,
        store: Arc<LinkStore>,
        source: Arc<dyn IdentifierSource>,
        exclusions: Arc<ExclusionRegistry>,
        directory: OwnerDirectory,
        metrics: Arc<Metrics>,
    ) -> Self {
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&exclusions),
            config.owner_revisit_min_interval(),
        ));
        let probe = Arc::new(Probe::from_config(&config));
        Self {
            config,
            store,
            source,
            exclusions,
            directory,
            scheduler,
            probe,
            metrics,
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Run reconcile cycles forever.
    pub async fn run(&self) {
        loop {
            self.run_cycle().await;
        }
    }

    /// One reconciliation against the identifier store followed by processing
    /// rounds until the cycle budget is spent. The first round always runs to
    /// completion so a fresh workset gets at least one full pass per cycle.
    pub async fn run_cycle(&self) {
        let cycle_start = Instant::now();
        let budget = self.config.table_update_cycle();

        self.refresh_owner_directory().await;
        self.exclusions.refresh();
        match reconcile(
            &self.store,
            self.source.as_ref(),
            &self.exclusions,
            RECONCILE_PAGE_SIZE,
        )
        .await
        {
            Ok(stats) => tracing::info!(%stats, "table reconciled"),
            Err(e) => {
                tracing::error!(error = %e, "reconcile aborted; next cycle retries")
            }
        }

        let mut first_round = true;
        loop {
            let remaining = budget.saturating_sub(cycle_start.elapsed());
            if !first_round && remaining.is_zero() {
                break;
            }

            let now = epoch_secs();
            let loaded = match self.scheduler.load(
                &self.store,
                self.config.workset_owner_max_links,
                now.saturating_sub(self.config.bad_recheck_min_interval),
                now.saturating_sub(self.config.good_recheck_min_interval),
            ) {
                Ok(n) => n,
                Err(e) => {
                    tracing::error!(error = %e, "workset load failed; ending cycle");
                    break;
                }
            };
            if loaded == 0 {
                tracing::debug!("workset empty; sleeping");
                sleep(EMPTY_WORKSET_SLEEP).await;
                first_round = false;
                continue;
            }
            tracing::info!(links = loaded, "workset loaded");

            // A capped budget on non-first rounds keeps one slow owner from
            // freezing the rest of the workset: when it expires the workers
            // are stopped and a fresh workset is loaded.
            let round_budget = if first_round {
                None
            } else {
                let cap = self.config.workset_owner_max_links as u64
                    * (1 + self.config.owner_revisit_min_interval);
                Some(remaining.min(Duration::from_secs(cap)))
            };

            let report = self.run_round(round_budget).await;
            let rate = if report.elapsed.as_secs_f64() > 0.0 {
                report.checked as f64 / report.elapsed.as_secs_f64()
            } else {
                0.0
            };
            tracing::info!(
                checked = report.checked,
                elapsed_secs = report.elapsed.as_secs(),
                rate_per_sec = rate,
                timed_out = report.timed_out,
                "round complete"
            );
            first_round = false;
        }

        tracing::info!(totals = %self.metrics.summary(), "reconcile cycle complete");
    }

    /// One pass of the worker pool over the loaded workset. With no budget
    /// the round runs until every workset is finished; with one, workers are
    /// stopped cooperatively when it expires, each exiting after its
    /// in-flight probe completes or times out.
    pub async fn run_round(&self, budget: Option<Duration>) -> RoundReport {
        let round_start = Instant::now();
        let stop = Arc::new(AtomicBool::new(false));
        let checked = Arc::new(AtomicU64::new(0));

        let mut workers = JoinSet::new();
        for worker_id in 0..self.config.num_workers.max(1) {
            workers.spawn(worker_loop(
                worker_id,
                Arc::clone(&self.scheduler),
                Arc::clone(&self.probe),
                Arc::clone(&self.store),
                Arc::clone(&self.metrics),
                Arc::clone(&stop),
                Arc::clone(&checked),
                self.config.notification_threshold,
            ));
        }

        let mut timed_out = false;
        match budget {
            None => join_all(&mut workers).await,
            Some(limit) => {
                if tokio::time::timeout(limit, join_all(&mut workers))
                    .await
                    .is_err()
                {
                    timed_out = true;
                    stop.store(true, Ordering::SeqCst);
                    tracing::warn!("round budget elapsed; stopping workers");
                    join_all(&mut workers).await;
                }
            }
        }

        RoundReport {
            checked: checked.load(Ordering::SeqCst),
            elapsed: round_start.elapsed(),
            timed_out,
        }
    }

    async fn refresh_owner_directory(&self) {
        match self.source.owner_directory().await {
            Ok(map) => *self.directory.write() = map,
            Err(e) => tracing::warn!(
                error = %e,
                "owner directory refresh failed; keeping previous mapping"
            ),
        }
    }
}

async fn join_all(workers: &mut JoinSet<()>) {
    while let Some(result) = workers.join_next().await {
        if let Err(e) = result {
            tracing::error!(error = %e, "worker terminated abnormally");
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    worker_id: usize,
    scheduler: Arc<Scheduler>,
    probe: Arc<Probe>,
    store: Arc<LinkStore>,
    metrics: Arc<Metrics>,
    stop: Arc<AtomicBool>,
    checked: Arc<AtomicU64>,
    history_capacity: usize,
) {
    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        match scheduler.next_link() {
            Dispatch::Finished => break,
            Dispatch::Wait => {
                metrics.record_wait_sleep(WAIT_SLEEP.as_secs());
                sleep(WAIT_SLEEP).await;
            }
            Dispatch::Ready { index, mut row } => {
                let outcome = probe.check(&row.target).await;
                tracing::debug!(
                    worker = worker_id,
                    identifier = %row.identifier,
                    return_code = outcome.return_code,
                    success = outcome.success,
                    "probe complete"
                );
                row.record(
                    VerdictEntry::new(epoch_secs(), outcome.return_code, outcome.detail.clone()),
                    history_capacity,
                );
                metrics.record_outcome(&outcome);
                if let Err(e) = store.put(&row) {
                    tracing::warn!(
                        identifier = %row.identifier,
                        error = %e,
                        "failed to persist verdict"
                    );
                }
                scheduler.mark_checked(index, row);
                checked.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use parking_lot::RwLock;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn checker(config: Config) -> (TempDir, LinkChecker) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LinkStore::open(dir.path()).unwrap());
        let directory: OwnerDirectory = Arc::new(RwLock::new(HashMap::new()));
        let exclusions = Arc::new(ExclusionRegistry::new(None, Arc::clone(&directory)));
        let checker = LinkChecker::new(
            config,
            store,
            Arc::new(MemorySource::new(Vec::new())),
            exclusions,
            directory,
            Arc::new(Metrics::new()),
        );
        (dir, checker)
    }

    #[tokio::test]
    async fn test_round_with_no_workset_finishes_immediately() {
        let (_dir, checker) = checker(Config {
            num_workers: 4,
            ..Config::default()
        });
        let report = checker.run_round(None).await;
        assert_eq!(report.checked, 0);
        assert!(!report.timed_out);
        assert!(report.elapsed < Duration::from_secs(5));
    }
}
