//! Child process wrapper -- spawn, capture stdout/stderr, enforce timeouts.

use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::task::TaskCommand;

/// How long pipe readers may keep draining after the child has exited. A
/// grandchild that inherited the pipes can otherwise hold them open forever.
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn '{program}'")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed while waiting for '{program}'")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to kill '{program}' after timeout")]
    Kill {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// How the child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Code(i32),
    /// Killed by a signal it did not choose (no exit code).
    Signal(Option<i32>),
    /// Exceeded the deadline and was killed by us.
    TimedOut,
}

/// Captured result of one child process.
#[derive(Debug)]
pub struct ProcessOutput {
    pub exit: Exit,
    pub pid: Option<u32>,
    pub stdout: Captured,
    pub stderr: Captured,
}

/// Bytes read from one pipe, capped at a byte limit.
#[derive(Debug, Default)]
pub struct Captured {
    pub bytes: Vec<u8>,
    pub truncated: bool,
}

impl Captured {
    pub fn text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.truncated {
            text.push_str("\n[truncated]");
        }
        text
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty() && !self.truncated
    }
}

/// Run `command` to completion or until `timeout` elapses.
///
/// The child is killed on timeout and also whenever this future is dropped.
/// Each pipe keeps at most `max_bytes`; anything beyond is read and discarded
/// so the child never blocks on a full pipe.
pub async fn run(
    command: &TaskCommand,
    timeout: Duration,
    max_bytes: usize,
) -> Result<ProcessOutput, ProcessError> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // Own process group, so a timeout can take down everything the task spawned.
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|source| ProcessError::Spawn {
            program: command.program.clone(),
            source,
        })?;

    let pid = child.id();
    debug!(?pid, program = %command.program, "child process started");

    let drain = CancellationToken::new();
    let stdout = tokio::spawn(capture(child.stdout.take(), max_bytes, drain.clone()));
    let stderr = tokio::spawn(capture(child.stderr.take(), max_bytes, drain.clone()));

    let exit = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => match status.code() {
            Some(code) => Exit::Code(code),
            None => Exit::Signal(signal_of(&status)),
        },
        Ok(Err(source)) => {
            drain.cancel();
            return Err(ProcessError::Wait {
                program: command.program.clone(),
                source,
            });
        }
        Err(_) => {
            warn!(?pid, program = %command.program, ?timeout, "deadline exceeded, killing child");
            kill_process_group(pid);
            // `kill` also reaps the child.
            child.kill().await.map_err(|source| ProcessError::Kill {
                program: command.program.clone(),
                source,
            })?;
            Exit::TimedOut
        }
    };

    let canceller = drain.clone();
    let deadline = tokio::spawn(async move {
        tokio::time::sleep(PIPE_DRAIN_GRACE).await;
        canceller.cancel();
    });
    let stdout = stdout.await.unwrap_or_default();
    let stderr = stderr.await.unwrap_or_default();
    deadline.abort();

    Ok(ProcessOutput {
        exit,
        pid,
        stdout,
        stderr,
    })
}

async fn capture<R>(pipe: Option<R>, max_bytes: usize, drain: CancellationToken) -> Captured
where
    R: AsyncRead + Unpin,
{
    let mut captured = Captured::default();
    let Some(mut pipe) = pipe else {
        return captured;
    };

    let mut chunk = [0u8; 8192];
    loop {
        let n = tokio::select! {
            read = pipe.read(&mut chunk) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            },
            _ = drain.cancelled() => break,
        };

        let room = max_bytes.saturating_sub(captured.bytes.len());
        if n > room {
            captured.truncated = true;
        }
        captured.bytes.extend_from_slice(&chunk[..n.min(room)]);
    }
    captured
}

/// SIGKILL every process in the child's group. The child itself is reaped by
/// the caller.
#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    let Some(pgid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        debug!(pgid, error = %std::io::Error::last_os_error(), "failed to signal process group");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

#[cfg(unix)]
fn signal_of(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn signal_of(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}
