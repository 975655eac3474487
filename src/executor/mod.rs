//! Task executor: claim the running slot, run the command, record the outcome.
//!
//! [`execute`] is the unit that has to be exception-safe end to end. It runs
//! inside a pooled worker nobody supervises, so every path ends in a log line
//! and, once a slot was claimed, a terminal row.

pub mod process;

use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::config::SchedulerConfig;
use crate::scheduler::{ExecutionStatus, Outcome};
use crate::storage::{self, Claim, Pool};
use crate::task::Task;

use self::process::{Exit, ProcessError, ProcessOutput};

/// Limits applied to every execution.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Used when the task has no timeout of its own.
    pub default_timeout: Duration,
    /// Cap on stored output and error text, per field.
    pub max_output_bytes: usize,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(3600),
            max_output_bytes: 1024 * 1024,
        }
    }
}

impl From<&SchedulerConfig> for ExecutorSettings {
    fn from(cfg: &SchedulerConfig) -> Self {
        Self {
            default_timeout: Duration::from_secs(cfg.task_timeout_secs),
            max_output_bytes: cfg.max_output_bytes,
        }
    }
}

impl ExecutorSettings {
    pub fn timeout_for(&self, task: &Task) -> Duration {
        task.timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout)
    }
}

/// What happened to one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    /// Another execution of the task holds the running slot.
    Skipped,
    /// The slot could not be claimed; `last_run` is untouched.
    Abandoned,
    Finished {
        execution_id: i64,
        status: ExecutionStatus,
    },
}

/// Run one due task. Never fails; the returned [`Attempt`] is informational.
pub async fn execute(pool: &Pool, task: &Task, settings: &ExecutorSettings) -> Attempt {
    let task_id = task.id;
    let started = Utc::now();

    let claim = storage::run_blocking(pool, move |pool| {
        storage::claim_execution(pool, task_id, started)
    })
    .await;

    let execution_id = match claim {
        Ok(Claim::Claimed(id)) => id,
        Ok(Claim::AlreadyRunning { execution_id }) => {
            warn!(task_id, task = %task.name, running = execution_id, "Task already running, skipping");
            return Attempt::Skipped;
        }
        Err(e) => {
            error!(task_id, task = %task.name, "Failed to claim execution slot, will retry next tick: {:#}", e);
            return Attempt::Abandoned;
        }
    };

    info!(task_id, execution_id, task = %task.name, command = %task.command, "Execution started");

    // The process is managed on its own task so that even a panic in there
    // still leaves us able to record a terminal status.
    let outcome = {
        let task = task.clone();
        let settings = settings.clone();
        match tokio::spawn(async move { run_task(&task, &settings).await }).await {
            Ok(outcome) => outcome,
            Err(join_err) => Outcome::failed(format!("executor crashed: {}", join_err), None),
        }
    };

    let status = outcome.status;
    let finished = Utc::now();

    let record = outcome.clone();
    if let Err(e) = storage::run_blocking(pool, move |pool| {
        storage::update_task_execution(pool, execution_id, &record, finished)
    })
    .await
    {
        error!(task_id, execution_id, "Failed to record execution outcome: {:#}", e);
    }

    // Failed runs also advance last_run so they wait for the next interval.
    if let Err(e) = storage::run_blocking(pool, move |pool| {
        storage::update_task_last_run(pool, task_id, finished)
    })
    .await
    {
        error!(task_id, execution_id, "Failed to update last_run: {:#}", e);
    }

    match status {
        ExecutionStatus::Success => {
            info!(task_id, execution_id, task = %task.name, "Execution succeeded")
        }
        _ => warn!(
            task_id,
            execution_id,
            task = %task.name,
            error = outcome.error_message.as_deref().unwrap_or(""),
            "Execution failed"
        ),
    }

    Attempt::Finished {
        execution_id,
        status,
    }
}

async fn run_task(task: &Task, settings: &ExecutorSettings) -> Outcome {
    let timeout = settings.timeout_for(task);
    let result = process::run(&task.command, timeout, settings.max_output_bytes).await;
    classify(result, timeout, settings.max_output_bytes)
}

/// Map a process result onto the stored outcome.
pub fn classify(
    result: Result<ProcessOutput, ProcessError>,
    timeout: Duration,
    max_bytes: usize,
) -> Outcome {
    let out = match result {
        Ok(out) => out,
        Err(e) => {
            let diagnostic = format!("{:#}", anyhow::Error::new(e));
            return Outcome::failed(truncate_utf8(diagnostic, max_bytes), None);
        }
    };

    let stdout = out.stdout.text();
    let stderr = out.stderr.text();

    match out.exit {
        Exit::Code(0) => {
            let text = with_stderr_section(stdout, &stderr);
            Outcome::success(non_empty(truncate_utf8(text, max_bytes)))
        }
        Exit::Code(code) => {
            let message = match stderr.trim() {
                "" => format!("process exited with code {}", code),
                trimmed => trimmed.to_string(),
            };
            Outcome::failed(
                truncate_utf8(message, max_bytes),
                non_empty(truncate_utf8(stdout, max_bytes)),
            )
        }
        Exit::Signal(signal) => {
            let message = match signal {
                Some(sig) => format!("process terminated by signal {}", sig),
                None => "process terminated by signal".to_string(),
            };
            Outcome::failed(message, non_empty(truncate_utf8(stdout, max_bytes)))
        }
        Exit::TimedOut => {
            let partial = with_stderr_section(stdout, &stderr);
            Outcome::failed(
                format!("Task timed out after {} seconds", timeout.as_secs_f64()),
                non_empty(truncate_utf8(partial, max_bytes)),
            )
        }
    }
}

fn with_stderr_section(mut text: String, stderr: &str) -> String {
    if stderr.is_empty() {
        return text;
    }
    if !text.is_empty() && !text.ends_with('\n') {
        text.push('\n');
    }
    text.push_str("--- stderr ---\n");
    text.push_str(stderr);
    text
}

fn non_empty(text: String) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Cut `text` to at most `max_bytes` on a char boundary, marking the cut.
fn truncate_utf8(mut text: String, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text;
    }
    let mut cut = max_bytes;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text.push_str("\n[truncated]");
    text
}

#[cfg(test)]
mod tests {
    use super::process::Captured;
    use super::*;
    use crate::storage::test_support::*;

    fn output(exit: Exit, stdout: &str, stderr: &str) -> ProcessOutput {
        ProcessOutput {
            exit,
            pid: None,
            stdout: Captured {
                bytes: stdout.as_bytes().to_vec(),
                truncated: false,
            },
            stderr: Captured {
                bytes: stderr.as_bytes().to_vec(),
                truncated: false,
            },
        }
    }

    const LIMIT: usize = 1024;
    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_success_appends_stderr_for_diagnostics() {
        let outcome = classify(Ok(output(Exit::Code(0), "hello\n", "warn\n")), HOUR, LIMIT);
        assert_eq!(outcome.status, ExecutionStatus::Success);
        assert_eq!(outcome.error_message, None);
        assert_eq!(outcome.output.as_deref(), Some("hello\n--- stderr ---\nwarn\n"));

        let quiet = classify(Ok(output(Exit::Code(0), "", "")), HOUR, LIMIT);
        assert_eq!(quiet.output, None);
    }

    #[test]
    fn test_non_zero_exit_prefers_stderr() {
        let outcome = classify(Ok(output(Exit::Code(2), "partial", "bad input\n")), HOUR, LIMIT);
        assert_eq!(outcome.status, ExecutionStatus::Failed);
        assert_eq!(outcome.error_message.as_deref(), Some("bad input"));
        assert_eq!(outcome.output.as_deref(), Some("partial"));

        let silent = classify(Ok(output(Exit::Code(3), "", "")), HOUR, LIMIT);
        assert_eq!(
            silent.error_message.as_deref(),
            Some("process exited with code 3")
        );
    }

    #[test]
    fn test_timeout_message_names_the_limit() {
        let outcome = classify(
            Ok(output(Exit::TimedOut, "so far", "")),
            Duration::from_secs(3600),
            LIMIT,
        );
        assert_eq!(outcome.status, ExecutionStatus::Failed);
        assert_eq!(
            outcome.error_message.as_deref(),
            Some("Task timed out after 3600 seconds")
        );
        assert_eq!(outcome.output.as_deref(), Some("so far"));

        let both = classify(Ok(output(Exit::TimedOut, "so far", "slow disk\n")), HOUR, LIMIT);
        assert_eq!(both.output.as_deref(), Some("so far\n--- stderr ---\nslow disk\n"));
    }

    #[test]
    fn test_signal_death_is_failure() {
        let outcome = classify(Ok(output(Exit::Signal(Some(9)), "", "")), HOUR, LIMIT);
        assert_eq!(
            outcome.error_message.as_deref(),
            Some("process terminated by signal 9")
        );
    }

    #[test]
    fn test_spawn_error_keeps_full_chain() {
        let err = ProcessError::Spawn {
            program: "nope".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        };
        let outcome = classify(Err(err), HOUR, LIMIT);
        assert_eq!(
            outcome.error_message.as_deref(),
            Some("failed to spawn 'nope': no such file")
        );
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let text = "héllo".to_string();
        assert_eq!(truncate_utf8(text.clone(), 10), "héllo");
        assert_eq!(truncate_utf8(text, 2), "h\n[truncated]");
    }

    #[test]
    fn test_task_timeout_overrides_default() {
        let settings = ExecutorSettings::default();
        let mut task = crate::task::Task {
            id: 1,
            name: "t".into(),
            command: crate::task::TaskCommand::from_argv(["true"]).unwrap(),
            interval_secs: 60,
            timeout_secs: None,
            enabled: true,
            last_run: None,
        };
        assert_eq!(settings.timeout_for(&task), Duration::from_secs(3600));
        task.timeout_secs = Some(5);
        assert_eq!(settings.timeout_for(&task), Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_execute_records_success_and_last_run() {
        let (_dir, pool) = temp_pool();
        let id = add_task(&pool, "greet", &["echo", "hello"], 60);
        let task = storage::get_task(&pool, id).unwrap().unwrap();

        let attempt = execute(&pool, &task, &ExecutorSettings::default()).await;
        let Attempt::Finished { execution_id, status } = attempt else {
            panic!("unexpected {:?}", attempt);
        };
        assert_eq!(status, ExecutionStatus::Success);

        let exec = storage::get_execution(&pool, execution_id).unwrap().unwrap();
        assert_eq!(exec.output.as_deref(), Some("hello\n"));
        let task = storage::get_task(&pool, id).unwrap().unwrap();
        assert!(task.last_run.unwrap() >= exec.start_time);
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_execute_skips_when_slot_is_taken() {
        let (_dir, pool) = temp_pool();
        let id = add_task(&pool, "greet", &["echo", "hello"], 60);
        let task = storage::get_task(&pool, id).unwrap().unwrap();
        storage::claim_execution(&pool, id, Utc::now()).unwrap();

        let attempt = execute(&pool, &task, &ExecutorSettings::default()).await;
        assert_eq!(attempt, Attempt::Skipped);
        // A skipped attempt does not count as a run.
        assert!(storage::get_task(&pool, id).unwrap().unwrap().last_run.is_none());
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_execute_records_spawn_failure() {
        let (_dir, pool) = temp_pool();
        let id = add_task(&pool, "ghost", &["/no/such/program"], 60);
        let task = storage::get_task(&pool, id).unwrap().unwrap();

        let Attempt::Finished { execution_id, status } =
            execute(&pool, &task, &ExecutorSettings::default()).await
        else {
            panic!("spawn failure should still finish the execution");
        };
        assert_eq!(status, ExecutionStatus::Failed);
        let exec = storage::get_execution(&pool, execution_id).unwrap().unwrap();
        assert!(exec
            .error_message
            .unwrap()
            .starts_with("failed to spawn '/no/such/program'"));
        assert!(storage::get_task(&pool, id).unwrap().unwrap().last_run.is_some());
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_execute_abandons_when_claim_cannot_lock() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = dir.path().join("tickwarden.db");
        let pool = storage::open_pool_with_busy_timeout(&db, Duration::from_millis(100)).unwrap();
        let id = add_task(&pool, "greet", &["echo", "hello"], 60);
        let task = storage::get_task(&pool, id).unwrap().unwrap();

        let blocker = rusqlite::Connection::open(&db).unwrap();
        blocker.execute_batch("BEGIN EXCLUSIVE").unwrap();

        let attempt = execute(&pool, &task, &ExecutorSettings::default()).await;
        blocker.execute_batch("ROLLBACK").unwrap();

        assert_eq!(attempt, Attempt::Abandoned);
        assert!(storage::list_executions(&pool, id, 10).unwrap().is_empty());
        // Still due on the next tick.
        let task = storage::get_task(&pool, id).unwrap().unwrap();
        assert!(task.last_run.is_none());
        assert!(task.is_due(Utc::now()));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_last_run_advances_when_outcome_cannot_be_recorded() {
        let (_dir, pool) = temp_pool();
        let id = add_task(&pool, "nap", &["sleep", "1"], 60);
        let task = storage::get_task(&pool, id).unwrap().unwrap();

        let handle = {
            let pool = pool.clone();
            tokio::spawn(async move { execute(&pool, &task, &ExecutorSettings::default()).await })
        };

        // Take the row away from the executor while its child is still running.
        let execution_id = loop {
            if let Some(id) = storage::running_executions(&pool, 1).unwrap().first() {
                break *id;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        };
        assert_eq!(
            storage::mark_interrupted(&pool, &[execution_id], Utc::now(), "taken over").unwrap(),
            1
        );

        let attempt = handle.await.unwrap();
        assert_eq!(
            attempt,
            Attempt::Finished {
                execution_id,
                status: ExecutionStatus::Success
            }
        );

        // The outcome write was refused, the last_run write still happened.
        let exec = storage::get_execution(&pool, execution_id).unwrap().unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.error_message.as_deref(), Some("taken over"));
        assert!(storage::get_task(&pool, id).unwrap().unwrap().last_run.is_some());
    }
}
