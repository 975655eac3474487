//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS tasks (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            command TEXT NOT NULL,
            interval_secs INTEGER NOT NULL CHECK (interval_secs > 0),
            timeout_secs INTEGER,
            enabled INTEGER NOT NULL DEFAULT 1,
            last_run TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            removed_at TEXT
        );

        -- Removed tasks keep their row for history; names are unique among live tasks.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_live_name
            ON tasks(name) WHERE removed_at IS NULL;

        CREATE TABLE IF NOT EXISTS task_executions (
            id INTEGER PRIMARY KEY,
            task_id INTEGER NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT,
            status TEXT NOT NULL CHECK (status IN ('running', 'success', 'failed')),
            error_message TEXT,
            output TEXT,
            FOREIGN KEY (task_id) REFERENCES tasks(id)
        );

        CREATE INDEX IF NOT EXISTS idx_task_executions_task ON task_executions(task_id, start_time);
        CREATE INDEX IF NOT EXISTS idx_task_executions_status ON task_executions(status);

        -- At most one running execution per task.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_task_executions_one_running
            ON task_executions(task_id) WHERE status = 'running';

        INSERT OR IGNORE INTO schema_version (version) VALUES (1);",
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM task_executions", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap(); // Should not error
    }

    #[test]
    fn test_second_running_row_is_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        conn.execute(
            "INSERT INTO tasks (name, command, interval_secs) VALUES ('t', '[\"true\"]', 60)",
            [],
        )
        .unwrap();

        let insert = "INSERT INTO task_executions (task_id, start_time, status)
                      VALUES (1, '2026-01-01T00:00:00.000000Z', ?1)";
        conn.execute(insert, ["running"]).unwrap();
        assert!(conn.execute(insert, ["running"]).is_err());
        // Terminal rows are unconstrained.
        conn.execute(insert, ["failed"]).unwrap();
        conn.execute(insert, ["success"]).unwrap();
    }

    #[test]
    fn test_removed_task_frees_its_name() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        let insert = "INSERT INTO tasks (name, command, interval_secs) VALUES ('t', '[\"true\"]', 60)";
        conn.execute(insert, []).unwrap();
        assert!(conn.execute(insert, []).is_err());

        conn.execute("UPDATE tasks SET removed_at = '2026-01-01T00:00:00.000000Z'", [])
            .unwrap();
        conn.execute(insert, []).unwrap();
    }
}
