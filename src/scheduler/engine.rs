//! Main scheduler execution loop.
//!
//! Each period moves through Idle -> Polling -> Dispatching -> Idle. The
//! period comes from a fixed-rate timer, so the cadence does not drift with
//! how long executions take; a tick missed while dispatch waited on a full
//! pool is skipped, not replayed.

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::dispatch::Dispatcher;
use super::recovery;
use crate::config::SchedulerConfig;
use crate::executor::ExecutorSettings;
use crate::storage::{self, Pool};

/// Polls SQLite for due tasks and feeds them to a bounded [`Dispatcher`].
#[derive(Clone)]
pub struct Scheduler {
    pool: Pool,
    dispatcher: Dispatcher,
    poll_interval: Duration,
    shutdown_grace: Duration,
    recovery_batch_size: usize,
}

impl Scheduler {
    pub fn new(pool: Pool, cfg: &SchedulerConfig) -> Self {
        let dispatcher = Dispatcher::new(pool.clone(), cfg.max_workers, ExecutorSettings::from(cfg));
        Self {
            pool,
            dispatcher,
            poll_interval: Duration::from_secs(cfg.poll_interval_secs.max(1)),
            shutdown_grace: Duration::from_secs(cfg.shutdown_grace_secs),
            recovery_batch_size: cfg.recovery_batch_size,
        }
    }

    /// Override the polling period (sub-second periods are useful in tests).
    pub fn with_poll_interval(mut self, period: Duration) -> Self {
        self.poll_interval = period;
        self
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Run crash recovery on a blocking thread. Never fails.
    pub async fn recover(&self) -> usize {
        let batch = self.recovery_batch_size;
        match storage::run_blocking(&self.pool, move |pool| Ok(recovery::recover(pool, batch))).await {
            Ok(count) => count,
            Err(e) => {
                error!("Crash recovery did not run: {:#}", e);
                0
            }
        }
    }

    /// One Polling -> Dispatching pass. Returns how many tasks were submitted.
    pub async fn poll_once(&self, cancel: &CancellationToken) -> Result<usize> {
        let now = Utc::now();
        let due = storage::run_blocking(&self.pool, move |pool| storage::pending_tasks(pool, now)).await?;
        if due.is_empty() {
            debug!("No tasks due");
            return Ok(0);
        }

        info!(due = due.len(), in_flight = self.dispatcher.in_flight(), "Dispatching due tasks");
        Ok(self.dispatcher.dispatch(due, cancel).await)
    }

    /// Recover, then poll on every tick until `cancel` fires, then drain.
    ///
    /// The first tick of the timer completes immediately, which gives the
    /// startup pass without waiting a full period. A token that is already
    /// cancelled returns right after recovery.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            poll_interval = ?self.poll_interval,
            max_workers = self.dispatcher.max_workers(),
            "Scheduler engine started"
        );

        let recovered = self.recover().await;
        if recovered > 0 {
            warn!(recovered, "Repaired executions interrupted by a previous shutdown");
        }

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            if let Err(e) = self.poll_once(&cancel).await {
                error!("Failed to check due tasks: {:#}", e);
            }
        }

        info!("Scheduler loop stopped");
        self.shutdown().await;
    }

    async fn shutdown(&self) {
        let in_flight = self.dispatcher.in_flight();
        if self.dispatcher.drain(self.shutdown_grace).await {
            info!("All executions finished");
        } else if self.shutdown_grace.is_zero() {
            warn!(in_flight, "Exiting without waiting for running executions; they will be recovered on next start");
        } else {
            warn!(
                in_flight = self.dispatcher.in_flight(),
                grace = ?self.shutdown_grace,
                "Executions still running after shutdown grace period; they will be recovered on next start"
            );
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::scheduler::ExecutionStatus;
    use crate::storage::test_support::*;

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            poll_interval_secs: 60,
            shutdown_grace_secs: 10,
            ..SchedulerConfig::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_precancelled_run_only_recovers() {
        let (_dir, pool) = temp_pool();
        let task_id = add_task(&pool, "greet", &["echo", "hello"], 60);
        storage::claim_execution(&pool, task_id, Utc::now()).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        Scheduler::new(pool.clone(), &config()).run(cancel).await;

        let history = storage::list_executions(&pool, task_id, 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, ExecutionStatus::Failed);
        assert_eq!(
            history[0].error_message.as_deref(),
            Some(recovery::INTERRUPTED_MESSAGE)
        );
        // Nothing was dispatched, so the task has still never run.
        assert!(storage::get_task(&pool, task_id).unwrap().unwrap().last_run.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_startup_pass_runs_without_waiting_a_period() {
        let (_dir, pool) = temp_pool();
        let task_id = add_task(&pool, "greet", &["echo", "hello"], 60);

        let scheduler = Scheduler::new(pool.clone(), &config());
        let cancel = CancellationToken::new();
        let handle = {
            let scheduler = scheduler.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { scheduler.run(cancel).await })
        };

        // Well under the 60s period.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let done = storage::list_executions(&pool, task_id, 1)
                .unwrap()
                .first()
                .map_or(false, |e| e.status.is_terminal());
            if done {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "startup pass never ran");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_poll_once_with_nothing_due() {
        let (_dir, pool) = temp_pool();
        let task_id = add_task(&pool, "greet", &["echo", "hello"], 60);
        storage::update_task_last_run(&pool, task_id, Utc::now()).unwrap();

        let scheduler = Scheduler::new(pool, &config());
        assert_eq!(scheduler.poll_once(&CancellationToken::new()).await.unwrap(), 0);
    }
}
