//! Bounded fan-out of due tasks onto worker tasks.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::executor::{self, ExecutorSettings};
use crate::storage::Pool;
use crate::task::Task;

/// Hands tasks to executors, never more than `max_workers` at a time.
///
/// The permit pool lives as long as the dispatcher, so the ceiling holds
/// across ticks: a task dispatched while earlier ones still run waits for
/// one of them to finish.
#[derive(Clone)]
pub struct Dispatcher {
    pool: Pool,
    settings: Arc<ExecutorSettings>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    max_workers: usize,
}

impl Dispatcher {
    pub fn new(pool: Pool, max_workers: usize, settings: ExecutorSettings) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            pool,
            settings: Arc::new(settings),
            permits: Arc::new(Semaphore::new(max_workers)),
            tracker: TaskTracker::new(),
            max_workers,
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Executions currently holding a worker slot.
    pub fn in_flight(&self) -> usize {
        self.max_workers - self.permits.available_permits()
    }

    /// Submit one executor per task, waiting for a free slot when saturated.
    ///
    /// Returns how many tasks were submitted. Stops early, leaving the rest
    /// for the next start, once `cancel` fires.
    pub async fn dispatch(&self, tasks: Vec<Task>, cancel: &CancellationToken) -> usize {
        let total = tasks.len();
        let mut submitted = 0;

        for task in tasks {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(skipped = total - submitted, "Shutdown requested, not dispatching remaining tasks");
                    break;
                }
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    // Only happens if the semaphore is closed.
                    Err(_) => break,
                },
            };

            debug!(task_id = task.id, task = %task.name, "Dispatching task");
            let pool = self.pool.clone();
            let settings = Arc::clone(&self.settings);
            self.tracker.spawn(async move {
                let _permit = permit;
                executor::execute(&pool, &task, &settings).await;
            });
            submitted += 1;
        }

        submitted
    }

    /// Stop accepting work and wait up to `grace` for in-flight executions.
    ///
    /// Returns `true` when nothing is left running.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.tracker.close();
        if self.tracker.is_empty() {
            return true;
        }
        if grace.is_zero() {
            return false;
        }
        tokio::time::timeout(grace, self.tracker.wait()).await.is_ok()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::storage::{self, test_support::*};
    use chrono::Utc;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_ceiling_holds_across_dispatch_calls() {
        let (_dir, pool) = temp_pool();
        for i in 0..3 {
            add_task(&pool, &format!("slow-{}", i), &["sleep", "1"], 60);
        }
        let tasks = storage::pending_tasks(&pool, Utc::now()).unwrap();
        let dispatcher = Dispatcher::new(pool.clone(), 2, ExecutorSettings::default());
        let cancel = CancellationToken::new();

        // Two slots: the first call fills them and returns once the third
        // task got a slot, so at most two ever hold permits.
        let first = dispatcher.dispatch(tasks[..2].to_vec(), &cancel).await;
        assert_eq!(first, 2);
        assert_eq!(dispatcher.in_flight(), 2);

        let second = dispatcher.dispatch(tasks[2..].to_vec(), &cancel).await;
        assert_eq!(second, 1);
        assert!(dispatcher.in_flight() <= 2);

        assert!(dispatcher.drain(Duration::from_secs(10)).await);
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelled_dispatch_submits_nothing_when_saturated() {
        let (_dir, pool) = temp_pool();
        add_task(&pool, "a", &["sleep", "1"], 60);
        add_task(&pool, "b", &["sleep", "1"], 60);
        let tasks = storage::pending_tasks(&pool, Utc::now()).unwrap();
        let dispatcher = Dispatcher::new(pool.clone(), 1, ExecutorSettings::default());
        let cancel = CancellationToken::new();

        assert_eq!(dispatcher.dispatch(tasks[..1].to_vec(), &cancel).await, 1);
        cancel.cancel();
        assert_eq!(dispatcher.dispatch(tasks[1..].to_vec(), &cancel).await, 0);

        assert!(dispatcher.drain(Duration::from_secs(10)).await);
    }

    #[tokio::test]
    async fn test_drain_with_zero_grace_reports_leftovers() {
        let (_dir, pool) = temp_pool();
        add_task(&pool, "a", &["sleep", "5"], 60);
        let tasks = storage::pending_tasks(&pool, Utc::now()).unwrap();
        let dispatcher = Dispatcher::new(pool.clone(), 1, ExecutorSettings::default());

        dispatcher.dispatch(tasks, &CancellationToken::new()).await;
        assert!(!dispatcher.drain(Duration::ZERO).await);
    }
}
