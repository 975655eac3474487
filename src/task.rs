//! Task definitions as the scheduler sees them.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("command must contain at least a program name")]
    Empty,

    #[error("program name must not be blank")]
    BlankProgram,

    #[error("command column is not a JSON string array: {0}")]
    Malformed(String),
}

/// An external program plus its arguments. Executed directly, never through a shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl TaskCommand {
    /// Build a command from an argument vector (`argv[0]` is the program).
    pub fn from_argv<I, S>(argv: I) -> Result<Self, CommandError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut iter = argv.into_iter().map(Into::into);
        let program = iter.next().ok_or(CommandError::Empty)?;
        if program.trim().is_empty() {
            return Err(CommandError::BlankProgram);
        }
        Ok(Self {
            program,
            args: iter.collect(),
        })
    }

    /// Decode the `tasks.command` column.
    pub fn from_json(raw: &str) -> Result<Self, CommandError> {
        let argv: Vec<String> =
            serde_json::from_str(raw).map_err(|e| CommandError::Malformed(e.to_string()))?;
        Self::from_argv(argv)
    }

    /// Encode for the `tasks.command` column.
    pub fn to_json(&self) -> String {
        let argv: Vec<&str> = std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect();
        // Serializing a Vec<&str> cannot fail.
        serde_json::to_string(&argv).unwrap_or_default()
    }
}

impl std::fmt::Display for TaskCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " {:?}", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// A schedulable unit of work.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: i64,
    pub name: String,
    pub command: TaskCommand,
    pub interval_secs: u64,
    /// Overrides the global execution timeout when set.
    pub timeout_secs: Option<u64>,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
}

impl Task {
    /// Due when never run, or when at least `interval_secs` have passed since `last_run`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        match self.last_run {
            None => true,
            Some(last) => i64::try_from(self.interval_secs)
                .ok()
                .and_then(Duration::try_seconds)
                .and_then(|interval| last.checked_add_signed(interval))
                .map_or(false, |next| next <= now),
        }
    }
}
