//! Claim-and-dispatch loop.
//!
//! Each round atomically claims up to `batch_size` eligible tasks and runs
//! them concurrently through the supervisor, waiting for the whole batch
//! before the next claim. The batch size is the only throttle.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::{Notify, watch};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::DispatchConfig;
use crate::error::DatabaseError;
use crate::store::TaskStore;
use crate::worker::supervisor::{Supervisor, TaskOutcome};

/// Tally of one dispatch round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundReport {
    pub claimed: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
    pub lost: usize,
    /// Tasks whose result could not be written; stale recovery picks them up.
    pub store_errors: usize,
}

impl RoundReport {
    fn record(&mut self, result: Result<TaskOutcome, DatabaseError>) {
        match result {
            Ok(TaskOutcome::Completed) => self.completed += 1,
            Ok(TaskOutcome::Retrying { .. }) => self.retried += 1,
            Ok(TaskOutcome::Failed { .. }) => self.failed += 1,
            Ok(TaskOutcome::Lost) => self.lost += 1,
            Err(e) => {
                tracing::error!("Failed to record task result: {}", e);
                self.store_errors += 1;
            }
        }
    }
}

/// Claims tasks from the store and hands them to the supervisor.
pub struct Dispatcher {
    store: Arc<dyn TaskStore>,
    supervisor: Arc<Supervisor>,
    clock: Arc<dyn Clock>,
    config: DispatchConfig,
    wake: Arc<Notify>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn TaskStore>,
        supervisor: Arc<Supervisor>,
        clock: Arc<dyn Clock>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            supervisor,
            clock,
            config,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Signal that wakes the loop before its next poll tick.
    pub fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Claim one batch and run it to completion.
    ///
    /// A store failure during the claim fails the round; no task changes
    /// state in that case.
    pub async fn run_round(&self) -> Result<RoundReport, DatabaseError> {
        let claim_id = Uuid::new_v4();
        let tasks = self
            .store
            .claim_batch(self.clock.now(), self.config.batch_size, claim_id)
            .await?;

        let mut report = RoundReport {
            claimed: tasks.len(),
            ..RoundReport::default()
        };
        if tasks.is_empty() {
            tracing::debug!("No eligible tasks");
            return Ok(report);
        }

        tracing::debug!(claim_id = %claim_id, claimed = tasks.len(), "Claimed batch");
        let results = join_all(tasks.into_iter().map(|task| self.supervisor.execute(task))).await;
        for result in results {
            report.record(result);
        }

        tracing::info!(
            claimed = report.claimed,
            completed = report.completed,
            retried = report.retried,
            failed = report.failed,
            "Dispatch round finished"
        );
        Ok(report)
    }

    /// Push claims older than `stale_after` back through the failure policy.
    pub async fn recover_abandoned(&self) -> Result<RoundReport, DatabaseError> {
        let stale_after = chrono::Duration::from_std(self.config.stale_after)
            .unwrap_or_else(|_| chrono::Duration::seconds(180));
        let cutoff = self
            .clock
            .now()
            .checked_sub_signed(stale_after)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let stale = self.store.list_stale_claims(cutoff).await?;

        let mut report = RoundReport {
            claimed: stale.len(),
            ..RoundReport::default()
        };
        for task in &stale {
            report.record(self.supervisor.recover_abandoned(task).await);
        }
        if !stale.is_empty() {
            tracing::warn!(recovered = stale.len(), "Recovered abandoned claims");
        }
        Ok(report)
    }
}

/// Spawn the dispatch loop.
///
/// Runs a round on every poll tick and on every fast-path wake, draining
/// back-to-back while batches come back full. Stops between rounds once
/// `shutdown` flips to `true`, so in-flight tasks finish first.
pub fn spawn_dispatch_loop(
    dispatcher: Arc<Dispatcher>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let wake = dispatcher.wake_handle();
        let mut ticker = tokio::time::interval(dispatcher.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            batch_size = dispatcher.config.batch_size,
            poll_interval_secs = dispatcher.config.poll_interval.as_secs(),
            "Dispatch loop started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = dispatcher.recover_abandoned().await {
                        tracing::error!("Stale claim recovery failed: {}", e);
                    }
                }
                _ = wake.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }

            loop {
                match dispatcher.run_round().await {
                    Ok(report) if report.claimed == dispatcher.config.batch_size => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    Ok(_) => break,
                    Err(e) => {
                        tracing::error!("Dispatch round failed: {}", e);
                        break;
                    }
                }
            }
        }

        tracing::info!("Dispatch loop stopped");
    })
}
