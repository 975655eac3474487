//! Execution history tracking for scheduled runs.

use chrono::{DateTime, Utc};

/// A record of one attempt to run a task.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskExecution {
    pub id: i64,
    pub task_id: i64,
    pub status: ExecutionStatus,
    pub error_message: Option<String>,
    pub output: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ExecutionStatus::Running),
            "success" => Ok(ExecutionStatus::Success),
            "failed" => Ok(ExecutionStatus::Failed),
            other => anyhow::bail!("unknown execution status '{}'", other),
        }
    }
}

/// Terminal result of an execution, ready to be written back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub status: ExecutionStatus,
    pub error_message: Option<String>,
    pub output: Option<String>,
}

impl Outcome {
    pub fn success(output: Option<String>) -> Self {
        Self {
            status: ExecutionStatus::Success,
            error_message: None,
            output,
        }
    }

    pub fn failed(error_message: impl Into<String>, output: Option<String>) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            error_message: Some(error_message.into()),
            output,
        }
    }
}
