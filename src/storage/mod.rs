//! SQLite storage layer -- schema, queries, migrations.

pub mod executions;
pub mod lock;
pub mod schema;

pub use executions::{
    claim_execution, get_execution, list_executions, mark_interrupted, running_executions,
    update_task_execution, Claim,
};
pub use lock::DatabaseLock;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Row};

use crate::task::{Task, TaskCommand};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// How long a connection waits on another writer before giving up.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &Path) -> Result<Pool> {
    open_pool_with_busy_timeout(path, DEFAULT_BUSY_TIMEOUT)
}

pub fn open_pool_with_busy_timeout(path: &Path, busy_timeout: Duration) -> Result<Pool> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create database directory {}", parent.display()))?;
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(move |c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;",
        )?;
        c.busy_timeout(busy_timeout)
    });

    let pool = R2D2Pool::builder()
        .max_size(16)
        .build(manager)
        .with_context(|| format!("failed to open database {}", path.display()))?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Run a storage call on the blocking thread pool.
///
/// SQLite calls can sit in `busy_timeout` for seconds; async callers go
/// through here so they never stall a runtime worker.
pub async fn run_blocking<T, F>(pool: &Pool, f: F) -> Result<T>
where
    F: FnOnce(&Pool) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || f(&pool))
        .await
        .context("storage task panicked")?
}

/// Timestamps are stored as fixed-width RFC 3339 UTC so they sort lexically.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    let dt = DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("invalid timestamp '{}'", raw))?;
    Ok(dt.with_timezone(&Utc))
}

fn parse_ts_opt(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

/// Input for registering a task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub name: String,
    pub command: TaskCommand,
    pub interval_secs: u64,
    pub timeout_secs: Option<u64>,
}

const TASK_COLUMNS: &str = "id, name, command, interval_secs, timeout_secs, enabled, last_run";

struct TaskRow {
    id: i64,
    name: String,
    command: String,
    interval_secs: i64,
    timeout_secs: Option<i64>,
    enabled: bool,
    last_run: Option<String>,
}

impl TaskRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            command: row.get(2)?,
            interval_secs: row.get(3)?,
            timeout_secs: row.get(4)?,
            enabled: row.get::<_, i64>(5)? != 0,
            last_run: row.get(6)?,
        })
    }

    fn into_task(self) -> Result<Task> {
        let command = TaskCommand::from_json(&self.command)
            .with_context(|| format!("task '{}' has an invalid command", self.name))?;
        Ok(Task {
            id: self.id,
            name: self.name,
            command,
            interval_secs: u64::try_from(self.interval_secs).unwrap_or(0),
            timeout_secs: self.timeout_secs.and_then(|t| u64::try_from(t).ok()),
            enabled: self.enabled,
            last_run: parse_ts_opt(self.last_run)?,
        })
    }
}

fn to_sql_secs(secs: u64) -> Result<i64> {
    i64::try_from(secs).with_context(|| format!("{} seconds is out of range", secs))
}

/// Register a new task. Returns its id.
pub fn insert_task(pool: &Pool, task: &NewTask) -> Result<i64> {
    if task.interval_secs == 0 {
        anyhow::bail!("interval must be at least one second");
    }
    if task.timeout_secs == Some(0) {
        anyhow::bail!("timeout must be at least one second");
    }
    let timeout = task.timeout_secs.map(to_sql_secs).transpose()?;

    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO tasks (name, command, interval_secs, timeout_secs, enabled) VALUES (?1, ?2, ?3, ?4, 1)",
        params![
            task.name,
            task.command.to_json(),
            to_sql_secs(task.interval_secs)?,
            timeout
        ],
    )
    .with_context(|| format!("failed to insert task '{}'", task.name))?;

    Ok(conn.last_insert_rowid())
}

pub fn get_task(pool: &Pool, id: i64) -> Result<Option<Task>> {
    let conn = pool.get()?;
    let row = conn
        .query_row(
            &format!("SELECT {} FROM tasks WHERE id = ?1 AND removed_at IS NULL", TASK_COLUMNS),
            params![id],
            TaskRow::from_row,
        )
        .optional()?;
    row.map(TaskRow::into_task).transpose()
}

pub fn get_task_by_name(pool: &Pool, name: &str) -> Result<Option<Task>> {
    let conn = pool.get()?;
    let row = conn
        .query_row(
            &format!("SELECT {} FROM tasks WHERE name = ?1 AND removed_at IS NULL", TASK_COLUMNS),
            params![name],
            TaskRow::from_row,
        )
        .optional()?;
    row.map(TaskRow::into_task).transpose()
}

/// List all live tasks, ordered by id.
pub fn list_tasks(pool: &Pool) -> Result<Vec<Task>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM tasks WHERE removed_at IS NULL ORDER BY id",
        TASK_COLUMNS
    ))?;
    let rows = stmt.query_map([], TaskRow::from_row)?;

    let mut list = Vec::new();
    for r in rows {
        list.push(r?.into_task()?);
    }
    Ok(list)
}

/// Enabled tasks whose schedule says they are due at `now`.
///
/// A task with an undecodable command is logged and left out rather than
/// failing the whole poll.
pub fn pending_tasks(pool: &Pool, now: DateTime<Utc>) -> Result<Vec<Task>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM tasks WHERE enabled = 1 AND removed_at IS NULL ORDER BY id",
        TASK_COLUMNS
    ))?;
    let rows = stmt.query_map([], TaskRow::from_row)?;

    let mut due = Vec::new();
    for r in rows {
        let row = r?;
        let (id, name) = (row.id, row.name.clone());
        match row.into_task() {
            Ok(task) if task.is_due(now) => due.push(task),
            Ok(_) => {}
            Err(e) => tracing::error!(task_id = id, task = %name, "Skipping unreadable task: {:#}", e),
        }
    }
    Ok(due)
}

/// Record the latest attempt time for a task, whatever the outcome was.
pub fn update_task_last_run(pool: &Pool, task_id: i64, ts: DateTime<Utc>) -> Result<()> {
    let conn = pool.get()?;
    let changed = conn.execute(
        "UPDATE tasks SET last_run = ?2 WHERE id = ?1",
        params![task_id, format_ts(ts)],
    )?;
    if changed == 0 {
        anyhow::bail!("Task {} not found", task_id);
    }
    Ok(())
}

pub fn set_task_enabled(pool: &Pool, name: &str, enabled: bool) -> Result<()> {
    let conn = pool.get()?;
    let changed = conn.execute(
        "UPDATE tasks SET enabled = ?2 WHERE name = ?1 AND removed_at IS NULL",
        params![name, enabled as i64],
    )?;
    if changed == 0 {
        anyhow::bail!("Task '{}' not found", name);
    }
    Ok(())
}

/// Retire a task. It is never scheduled or listed again and its name is
/// free for reuse, but the row and its execution history stay.
///
/// Refused while an execution of the task is still running.
pub fn remove_task(pool: &Pool, name: &str) -> Result<()> {
    let mut conn = pool.get()?;
    let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

    let id: Option<i64> = tx
        .query_row(
            "SELECT id FROM tasks WHERE name = ?1 AND removed_at IS NULL",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    let Some(id) = id else {
        anyhow::bail!("Task '{}' not found", name);
    };

    let running: i64 = tx.query_row(
        "SELECT COUNT(*) FROM task_executions WHERE task_id = ?1 AND status = 'running'",
        params![id],
        |row| row.get(0),
    )?;
    if running > 0 {
        anyhow::bail!("Task '{}' is currently running", name);
    }

    tx.execute(
        "UPDATE tasks SET enabled = 0, removed_at = ?2 WHERE id = ?1",
        params![id, format_ts(Utc::now())],
    )?;
    tx.commit()?;
    Ok(())
}
