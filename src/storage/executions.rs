//! Queries over `task_executions`: claiming, finishing, recovering, listing.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};

use super::{format_ts, parse_ts, parse_ts_opt, Pool};
use crate::scheduler::{ExecutionStatus, Outcome, TaskExecution};

/// Result of trying to take the running slot for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// A new `running` row was inserted with this id.
    Claimed(i64),
    /// Another execution already holds the slot.
    AlreadyRunning { execution_id: i64 },
}

/// Atomically check for a running execution of `task_id` and, if there is
/// none, insert one.
///
/// The check and the insert share one EXCLUSIVE transaction so concurrent
/// claimants serialize on the write lock. The lock is released as soon as the
/// row is committed.
pub fn claim_execution(pool: &Pool, task_id: i64, now: DateTime<Utc>) -> Result<Claim> {
    let mut conn = pool.get()?;
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Exclusive)
        .context("failed to begin exclusive transaction")?;

    // A dispatch already in flight may still name a task removed since the poll.
    let live: Option<bool> = tx
        .query_row(
            "SELECT removed_at IS NULL FROM tasks WHERE id = ?1",
            params![task_id],
            |row| row.get(0),
        )
        .optional()?;
    if live != Some(true) {
        anyhow::bail!("Task {} no longer exists", task_id);
    }

    let running: Option<i64> = tx
        .query_row(
            "SELECT id FROM task_executions WHERE task_id = ?1 AND status = 'running' LIMIT 1",
            params![task_id],
            |row| row.get(0),
        )
        .optional()?;

    if let Some(execution_id) = running {
        tx.commit()?;
        return Ok(Claim::AlreadyRunning { execution_id });
    }

    tx.execute(
        "INSERT INTO task_executions (task_id, start_time, status) VALUES (?1, ?2, 'running')",
        params![task_id, format_ts(now)],
    )?;
    let id = tx.last_insert_rowid();
    tx.commit()?;

    Ok(Claim::Claimed(id))
}

/// Write the terminal outcome of a running execution.
pub fn update_task_execution(
    pool: &Pool,
    execution_id: i64,
    outcome: &Outcome,
    end_time: DateTime<Utc>,
) -> Result<()> {
    if !outcome.status.is_terminal() {
        anyhow::bail!("execution {} cannot be finished as running", execution_id);
    }

    let conn = pool.get()?;
    let changed = conn.execute(
        "UPDATE task_executions
         SET status = ?2, error_message = ?3, output = ?4, end_time = ?5
         WHERE id = ?1 AND status = 'running'",
        params![
            execution_id,
            outcome.status.as_str(),
            outcome.error_message,
            outcome.output,
            format_ts(end_time)
        ],
    )?;
    if changed == 0 {
        anyhow::bail!("Execution {} is not running", execution_id);
    }
    Ok(())
}

/// Ids of up to `limit` executions still marked running, oldest first.
pub fn running_executions(pool: &Pool, limit: usize) -> Result<Vec<i64>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT id FROM task_executions WHERE status = 'running' ORDER BY id LIMIT ?1",
    )?;
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let ids = stmt
        .query_map(params![limit], |row| row.get(0))?
        .collect::<Result<Vec<i64>, _>>()?;
    Ok(ids)
}

/// Force a batch of running executions to `failed`. Returns how many changed.
pub fn mark_interrupted(
    pool: &Pool,
    ids: &[i64],
    now: DateTime<Utc>,
    message: &str,
) -> Result<usize> {
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;
    let end_time = format_ts(now);

    let mut changed = 0;
    {
        let mut stmt = tx.prepare(
            "UPDATE task_executions
             SET status = 'failed', end_time = ?2, error_message = ?3
             WHERE id = ?1 AND status = 'running'",
        )?;
        for id in ids {
            changed += stmt.execute(params![id, end_time, message])?;
        }
    }

    tx.commit()?;
    Ok(changed)
}

const EXECUTION_COLUMNS: &str = "id, task_id, start_time, end_time, status, error_message, output";

struct ExecutionRow {
    id: i64,
    task_id: i64,
    start_time: String,
    end_time: Option<String>,
    status: String,
    error_message: Option<String>,
    output: Option<String>,
}

impl ExecutionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            task_id: row.get(1)?,
            start_time: row.get(2)?,
            end_time: row.get(3)?,
            status: row.get(4)?,
            error_message: row.get(5)?,
            output: row.get(6)?,
        })
    }

    fn into_execution(self) -> Result<TaskExecution> {
        Ok(TaskExecution {
            id: self.id,
            task_id: self.task_id,
            status: self.status.parse::<ExecutionStatus>()?,
            error_message: self.error_message,
            output: self.output,
            start_time: parse_ts(&self.start_time)?,
            end_time: parse_ts_opt(self.end_time)?,
        })
    }
}

pub fn get_execution(pool: &Pool, execution_id: i64) -> Result<Option<TaskExecution>> {
    let conn = pool.get()?;
    let raw = conn
        .query_row(
            &format!("SELECT {} FROM task_executions WHERE id = ?1", EXECUTION_COLUMNS),
            params![execution_id],
            ExecutionRow::from_row,
        )
        .optional()?;
    raw.map(ExecutionRow::into_execution).transpose()
}

/// Most recent executions of a task, newest first.
pub fn list_executions(pool: &Pool, task_id: i64, limit: usize) -> Result<Vec<TaskExecution>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM task_executions WHERE task_id = ?1 ORDER BY start_time DESC, id DESC LIMIT ?2",
        EXECUTION_COLUMNS
    ))?;
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let rows = stmt.query_map(params![task_id, limit], ExecutionRow::from_row)?;

    let mut list = Vec::new();
    for r in rows {
        list.push(r?.into_execution()?);
    }
    Ok(list)
}
