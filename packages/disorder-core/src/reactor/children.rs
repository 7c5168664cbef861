//! Subprocess lifecycle tracking.
//!
//! A `SIGCHLD`-driven reactor traditionally maintains a table of child
//! entries reaped from a shared handler that re-scans the table and
//! invokes each callback with its `waitpid` status. Tokio already owns a
//! single global `SIGCHLD` handler and exposes completion as a future per
//! `tokio::process::Child`, so `ChildReaper` only needs to track
//! outstanding decoder/helper subprocesses for `shutdown` (so it can wait
//! for them) and to give each one a uniform exit-status future.
use std::process::ExitStatus;

use tokio::process::Child;
use tokio::task::JoinSet;

/// Tracks spawned subprocesses (decoders, scratch-clip players, the
/// rescan helper) and reaps their exit status asynchronously.
#[derive(Default)]
pub struct ChildReaper {
    tasks: parking_lot::Mutex<JoinSet<(u32, std::io::Result<ExitStatus>)>>,
}

impl ChildReaper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a spawned child; its exit will be observed by the
    /// background reaper and can also be awaited directly via
    /// `child.wait()` by the caller if it needs the result immediately
    /// (registering here is for `shutdown` accounting only).
    pub fn track(&self, pid: u32, mut child: Child) {
        self.tasks.lock().spawn(async move {
            let status = child.wait().await;
            (pid, status)
        });
    }

    /// Number of subprocesses still being tracked.
    pub fn outstanding(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Waits for every tracked subprocess to exit, logging each one.
    pub async fn drain(&self) {
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok((pid, Ok(status))) => {
                    tracing::debug!(pid, ?status, "subprocess reaped");
                }
                Ok((pid, Err(err))) => {
                    tracing::warn!(pid, %err, "error waiting for subprocess");
                }
                Err(join_err) => {
                    tracing::warn!(%join_err, "reaper task panicked");
                }
            }
        }
    }
}

/// Exit status helpers in the spirit of POSIX's `WIFEXITED`/`WTERMSIG`
/// macros, applied to the standard library's [`ExitStatus`].
pub trait ExitStatusExt {
    fn exit_code(&self) -> Option<i32>;
    fn terminating_signal(&self) -> Option<i32>;
}

impl ExitStatusExt for ExitStatus {
    fn exit_code(&self) -> Option<i32> {
        self.code()
    }

    #[cfg(unix)]
    fn terminating_signal(&self) -> Option<i32> {
        std::os::unix::process::ExitStatusExt::signal(self)
    }

    #[cfg(not(unix))]
    fn terminating_signal(&self) -> Option<i32> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tracks_and_drains_a_child() {
        let reaper = ChildReaper::new();
        let child = tokio::process::Command::new("true")
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .spawn()
            .expect("spawn true(1)");
        let pid = child.id().unwrap_or(0);
        reaper.track(pid, child);
        assert_eq!(reaper.outstanding(), 1);
        reaper.drain().await;
        assert_eq!(reaper.outstanding(), 0);
    }
}
