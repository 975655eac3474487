//! Polling scheduler: crash recovery, dispatch, and the timer loop.

pub mod dispatch;
pub mod engine;
pub mod history;
pub mod recovery;

// Re-export common types
pub use self::dispatch::Dispatcher;
pub use self::engine::Scheduler;
pub use self::history::{ExecutionStatus, Outcome, TaskExecution};
pub use self::recovery::{recover, INTERRUPTED_MESSAGE};
