//! Process supervisor: keeps exactly one worker process running.
//!
//! The supervisor starts the worker command, waits for it to exit and, after
//! a fixed delay, starts a replacement. It never gives up. Nothing survives
//! a restart: every session of the dead worker is gone and clients have to
//! reconnect.

use std::ffi::OsString;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{error, info, warn};

/// How to launch a worker.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>, args: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Re-run the current executable with the given arguments.
    pub fn current_exe(args: impl IntoIterator<Item = impl Into<OsString>>) -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, args))
    }
}

/// Starts one worker and restarts it whenever it exits.
pub struct ProcessSupervisor {
    command: WorkerCommand,
    restart_delay: Duration,
}

impl ProcessSupervisor {
    pub fn new(command: WorkerCommand, restart_delay: Duration) -> Self {
        Self {
            command,
            restart_delay,
        }
    }

    /// Supervise until `shutdown` resolves, then kill the current worker.
    ///
    /// Returns how many workers were started.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> u64 {
        tokio::pin!(shutdown);
        let mut started: u64 = 0;

        loop {
            match self.spawn_worker() {
                Ok(mut child) => {
                    started += 1;
                    let pid = child.id().unwrap_or_default();
                    info!(worker = started, pid, "forked worker");

                    tokio::select! {
                        status = child.wait() => {
                            match status {
                                Ok(status) => warn!(worker = started, pid, %status, "worker died"),
                                Err(e) => warn!(worker = started, pid, error = %e, "worker lost"),
                            }
                        }
                        _ = &mut shutdown => {
                            info!(worker = started, pid, "stopping worker");
                            if let Err(e) = child.kill().await {
                                warn!(pid, error = %e, "failed to stop worker");
                            }
                            return started;
                        }
                    }
                }
                Err(e) => {
                    error!(program = %self.command.program.display(), error = %e, "failed to fork worker");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.restart_delay) => {}
                _ = &mut shutdown => return started,
            }
        }
    }

    fn spawn_worker(&self) -> std::io::Result<tokio::process::Child> {
        Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
    }
}
