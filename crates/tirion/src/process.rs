// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The monitored process: spawned and reaped by the agent, or attached to and only observed.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::ProcessError;
use crate::proc::ProcReader;

/// What the agent monitors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Spawn { program: String, args: Vec<String> },
    Attach { pid: i32 },
}

/// Ends a spawned process: SIGTERM to its process group, SIGKILL after the grace period.
///
/// Cheap to clone so limit supervisors can hold one. For an attached process every call is a
/// no-op.
#[derive(Debug, Clone)]
pub struct Terminator {
    pid: i32,
    spawned: bool,
    exited: CancellationToken,
    grace: Duration,
}

impl Terminator {
    pub async fn terminate(&self) {
        if !self.spawned {
            debug!("Not terminating attached process {}", self.pid);
            return;
        }
        if self.exited.is_cancelled() {
            debug!("Program already terminated");
            return;
        }

        info!("Program with PID {} still running, sending SIGTERM", self.pid);
        self.signal(Signal::SIGTERM);

        if tokio::time::timeout(self.grace, self.exited.cancelled())
            .await
            .is_err()
        {
            warn!(
                "Program with PID {} ignored SIGTERM for {:?}, sending SIGKILL",
                self.pid, self.grace
            );
            self.signal(Signal::SIGKILL);
            self.exited.cancelled().await;
        }
    }

    fn signal(&self, signal: Signal) {
        let pid = Pid::from_raw(self.pid);
        // the child leads its own process group, which also reaches its descendants
        match killpg(pid, signal) {
            Ok(()) => {}
            Err(Errno::ESRCH) => {
                if let Err(e) = kill(pid, signal) {
                    debug!("Cannot send {signal} to {}: {e}", self.pid);
                }
            }
            Err(e) => warn!("Cannot send {signal} to process group {}: {e}", self.pid),
        }
    }
}

#[derive(Debug)]
pub struct MonitoredProcess {
    terminator: Terminator,
    reaper: Option<JoinHandle<Option<ExitStatus>>>,
}

impl MonitoredProcess {
    /// Starts `program` in its own process group and reaps it in the background.
    pub fn spawn(program: &str, args: &[String], grace: Duration) -> Result<Self, ProcessError> {
        info!("Execute external program: {program} {}", args.join(" "));

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .process_group(0)
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                program: program.to_string(),
                source,
            })?;

        let pid = child
            .id()
            .and_then(|id| i32::try_from(id).ok())
            .ok_or_else(|| ProcessError::MissingPid(program.to_string()))?;

        let exited = CancellationToken::new();
        let reaper = tokio::spawn({
            let exited = exited.clone();
            async move {
                let status = match child.wait().await {
                    Ok(status) => {
                        debug!("Program with PID {pid} exited with {status}");
                        Some(status)
                    }
                    Err(e) => {
                        error!("Cannot wait for program with PID {pid}: {e}");
                        None
                    }
                };
                exited.cancel();
                status
            }
        });

        Ok(Self {
            terminator: Terminator {
                pid,
                spawned: true,
                exited,
                grace,
            },
            reaper: Some(reaper),
        })
    }

    /// Observes an already running process. It is never signalled.
    pub fn attach(pid: i32, reader: &ProcReader) -> Result<Self, ProcessError> {
        if pid <= 0 || !reader.exists(pid) {
            return Err(ProcessError::NotFound(pid));
        }
        debug!("Attached to program with PID {pid}");

        Ok(Self {
            terminator: Terminator {
                pid,
                spawned: false,
                exited: CancellationToken::new(),
                grace: Duration::ZERO,
            },
            reaper: None,
        })
    }

    pub fn pid(&self) -> i32 {
        self.terminator.pid
    }

    pub fn is_spawned(&self) -> bool {
        self.terminator.spawned
    }

    /// Cancelled once a spawned process was reaped. Never cancelled for an attached process.
    pub fn exited(&self) -> CancellationToken {
        self.terminator.exited.clone()
    }

    pub fn terminator(&self) -> Terminator {
        self.terminator.clone()
    }

    pub async fn terminate(&self) {
        self.terminator.terminate().await;
    }

    /// Gives a spawned process the grace period to exit on its own, then terminates it.
    /// Returns its exit status once reaped.
    pub async fn close(&mut self) -> Option<ExitStatus> {
        let reaper = self.reaper.take()?;

        if !self.terminator.exited.is_cancelled() {
            debug!("Wait for program to close");
            let grace = self.terminator.grace;
            if tokio::time::timeout(grace, self.terminator.exited.cancelled())
                .await
                .is_err()
            {
                self.terminator.terminate().await;
            }
        }

        match reaper.await {
            Ok(status) => status,
            Err(e) => {
                error!("Reaper task failed: {e}");
                None
            }
        }
    }

    /// Terminates the process once it ran for `limit`.
    pub fn supervise_time(&self, limit: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let terminator = self.terminator();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = terminator.exited.cancelled() => {}
                _ = tokio::time::sleep(limit) => {
                    info!("Limit reached. Program ran for {limit:?}");
                    terminator.terminate().await;
                }
            }
        })
    }

    /// Polls the resident memory of the process tree and terminates it above `limit_mb`.
    pub fn supervise_memory(
        &self,
        limit_mb: u64,
        interval: Duration,
        reader: ProcReader,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let terminator = self.terminator();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = terminator.exited.cancelled() => return,
                    _ = ticker.tick() => {}
                }

                let used_mb = match reader.tree_rss_kb(terminator.pid) {
                    Ok(kb) => kb / 1024.0,
                    Err(e) => {
                        if !terminator.exited.is_cancelled() {
                            warn!("Cannot fetch memory for memory limit: {e}");
                            terminator.terminate().await;
                        }
                        return;
                    }
                };
                if used_mb > limit_mb as f64 {
                    info!("Limit reached. Program has {used_mb:.1} out of {limit_mb} allowed MB of memory");
                    terminator.terminate().await;
                    return;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str) -> MonitoredProcess {
        MonitoredProcess::spawn(
            "sh",
            &["-c".to_string(), script.to_string()],
            Duration::from_millis(200),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_spawn_and_reap() {
        let mut process = sh("exit 3");
        assert!(process.is_spawned());
        assert!(process.pid() > 0);

        let status = process.close().await.unwrap();
        assert_eq!(status.code(), Some(3));
        assert!(process.exited().is_cancelled());
        // second close has nothing left to reap
        assert!(process.close().await.is_none());
    }

    #[tokio::test]
    async fn test_spawn_missing_program() {
        let result = MonitoredProcess::spawn("/nonexistent/program", &[], Duration::ZERO);
        assert!(matches!(result, Err(ProcessError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_terminate_with_sigterm() {
        let mut process = sh("sleep 30");
        process.terminate().await;
        assert!(process.exited().is_cancelled());
        let status = process.close().await.unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_sigkill() {
        let mut process = sh("trap '' TERM; while true; do sleep 0.05; done");
        // let the shell install its trap
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        process.terminate().await;
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(process.exited().is_cancelled());
        process.close().await;
    }

    #[tokio::test]
    async fn test_time_limit() {
        let mut process = sh("sleep 30");
        let supervisor = process.supervise_time(Duration::from_millis(50), CancellationToken::new());

        tokio::time::timeout(Duration::from_secs(5), process.exited().cancelled())
            .await
            .unwrap();
        supervisor.await.unwrap();
        process.close().await;
    }

    #[tokio::test]
    async fn test_memory_limit() {
        let mut process = sh("sleep 30");
        // any resident page exceeds a zero budget
        let supervisor = process.supervise_memory(
            0,
            Duration::from_millis(5),
            ProcReader::default(),
            CancellationToken::new(),
        );

        tokio::time::timeout(Duration::from_secs(5), process.exited().cancelled())
            .await
            .unwrap();
        supervisor.await.unwrap();
        process.close().await;
    }

    #[tokio::test]
    async fn test_attach_never_kills() {
        let own = std::process::id() as i32;
        let process = MonitoredProcess::attach(own, &ProcReader::default()).unwrap();
        assert!(!process.is_spawned());
        process.terminate().await;
        assert!(!process.exited().is_cancelled());
    }

    #[test]
    fn test_attach_missing_pid() {
        let dir = tempfile::tempdir().unwrap();
        let result = MonitoredProcess::attach(12345, &ProcReader::new(dir.path()));
        assert!(matches!(result, Err(ProcessError::NotFound(12345))));
        assert!(matches!(
            MonitoredProcess::attach(0, &ProcReader::default()),
            Err(ProcessError::NotFound(0))
        ));
    }
}
