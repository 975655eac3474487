//! Startup sweep for executions left `running` by an unclean shutdown.

use chrono::Utc;
use tracing::{error, info, warn};

use crate::storage::{self, Pool};

pub const INTERRUPTED_MESSAGE: &str = "Task was interrupted by system shutdown or crash";

/// Mark every `running` execution as failed. Returns how many were repaired.
///
/// Works in batches of `batch_size` until a pass finds nothing. Storage
/// errors are logged and end the sweep early; startup carries on regardless.
///
/// Every running row is assumed orphaned, so the caller must hold the
/// [`DatabaseLock`](crate::storage::DatabaseLock) for this database.
pub fn recover(pool: &Pool, batch_size: usize) -> usize {
    let batch_size = batch_size.max(1);
    let mut repaired = 0;

    loop {
        let ids = match storage::running_executions(pool, batch_size) {
            Ok(ids) => ids,
            Err(e) => {
                error!("Crash recovery could not list running executions: {:#}", e);
                break;
            }
        };
        if ids.is_empty() {
            break;
        }

        match storage::mark_interrupted(pool, &ids, Utc::now(), INTERRUPTED_MESSAGE) {
            Ok(0) => {
                // Rows vanished between the read and the write; nothing left to do here.
                break;
            }
            Ok(changed) => {
                for id in &ids {
                    warn!(execution_id = id, "Marked interrupted execution as failed");
                }
                repaired += changed;
            }
            Err(e) => {
                error!(batch = ids.len(), "Crash recovery failed to update batch: {:#}", e);
                break;
            }
        }
    }

    if repaired > 0 {
        info!(repaired, "Crash recovery complete");
    }
    repaired
}
