// transcode/supervisor.rs

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, error, info, instrument, warn};

use crate::transcode::args::CommandSpec;

/// Lifecycle of the external child bound to one supervisor slot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Starting,
    Running,
    Exited(i32),
    Failed,
}

impl JobState {
    pub fn is_live(&self) -> bool {
        matches!(self, JobState::Starting | JobState::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Exited(_) | JobState::Failed)
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

struct ActiveJob {
    stdin: Option<ChildStdin>,
    stop_tx: Option<oneshot::Sender<()>>,
}

/// Owns at most one external transcoding process. State changes are
/// published on a watch channel; exits after a successful start are never
/// surfaced as errors anywhere else. Starting while a child is live stops
/// the old child first, so two children never write the same output.
pub struct TranscodeSupervisor {
    name: String,
    grace: Duration,
    state_tx: watch::Sender<JobState>,
    stop_requested: AtomicBool,
    job: Mutex<Option<ActiveJob>>,
}

impl TranscodeSupervisor {
    pub fn new(name: impl Into<String>, grace: Duration) -> Self {
        let (state_tx, _) = watch::channel(JobState::Idle);
        Self {
            name: name.into(),
            grace,
            state_tx,
            stop_requested: AtomicBool::new(false),
            job: Mutex::new(None),
        }
    }

    pub fn state(&self) -> JobState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<JobState> {
        self.state_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.state().is_live()
    }

    /// Whether an owner has ever requested `stop()` on this slot. The flag
    /// is sticky: once the owner wants the slot down, restart loops must not
    /// bring it back up.
    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    #[instrument(skip_all, fields(job = %self.name))]
    pub async fn start(&self, spec: CommandSpec) -> Result<(), SupervisorError> {
        if self.state().is_live() {
            warn!("job already running, stopping it before restart");
            self.stop().await;
        }

        let mut guard = self.job.lock().await;
        self.state_tx.send_replace(JobState::Starting);

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(if spec.pipe_stdin { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.current_dir {
            command.current_dir(dir);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                self.state_tx.send_replace(JobState::Idle);
                return Err(SupervisorError::Spawn {
                    program: spec.program.clone(),
                    source,
                });
            }
        };

        let stdin = child.stdin.take();

        // Child diagnostics go to debug logs only, never to users.
        if let Some(stderr) = child.stderr.take() {
            let name = self.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(job = %name, "{}", line);
                }
            });
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        *guard = Some(ActiveJob {
            stdin,
            stop_tx: Some(stop_tx),
        });
        self.state_tx.send_replace(JobState::Running);
        info!("started {}", spec.program);

        tokio::spawn(monitor(
            self.name.clone(),
            child,
            stop_rx,
            self.grace,
            self.state_tx.clone(),
        ));

        Ok(())
    }

    /// Take ownership of the child's stdin pipe. Dropping the pipe is the
    /// graceful end-of-input signal.
    pub async fn take_stdin(&self) -> Option<ChildStdin> {
        self.job.lock().await.as_mut().and_then(|job| job.stdin.take())
    }

    /// Close the child's input, give it the grace period to exit, then
    /// force-terminate. Resolves once the monitor publishes a terminal state.
    #[instrument(skip_all, fields(job = %self.name))]
    pub async fn stop(&self) {
        self.stop_requested.store(true, Ordering::Release);

        let mut rx = self.state_tx.subscribe();
        {
            let mut guard = self.job.lock().await;
            let Some(job) = guard.as_mut() else {
                return;
            };
            job.stdin.take();
            if let Some(stop_tx) = job.stop_tx.take() {
                let _ = stop_tx.send(());
            }
            *guard = None;
        }

        loop {
            if rx.borrow_and_update().is_terminal() {
                break;
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Wait until the current job reaches a terminal state.
    pub async fn wait_terminal(&self) -> JobState {
        let mut rx = self.state_tx.subscribe();
        loop {
            {
                let state = rx.borrow_and_update().clone();
                if state.is_terminal() {
                    return state;
                }
            }
            if rx.changed().await.is_err() {
                return self.state();
            }
        }
    }
}

/// Owns the child for its whole life: reaps the natural exit, or applies the
/// stop protocol (grace period, then kill).
async fn monitor(
    name: String,
    mut child: Child,
    stop_rx: oneshot::Receiver<()>,
    grace: Duration,
    state_tx: watch::Sender<JobState>,
) {
    let natural_exit = tokio::select! {
        status = child.wait() => Some(status),
        _ = stop_rx => None,
    };

    let state = match natural_exit {
        Some(status) => exit_state(&name, status),
        // Stop requested: input is already closed, give the child the grace
        // period to flush, then force-terminate.
        None => match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => exit_state(&name, status),
            Err(_) => {
                warn!(job = %name, "grace period expired, killing child");
                if let Err(e) = child.kill().await {
                    error!(job = %name, "failed to kill child: {}", e);
                }
                JobState::Failed
            }
        },
    };

    state_tx.send_replace(state);
}

fn exit_state(name: &str, status: std::io::Result<std::process::ExitStatus>) -> JobState {
    match status {
        Ok(status) => match status.code() {
            Some(code) => {
                info!(job = %name, "child exited with code {}", code);
                JobState::Exited(code)
            }
            None => {
                warn!(job = %name, "child terminated by signal");
                JobState::Failed
            }
        },
        Err(e) => {
            error!(job = %name, "failed to reap child: {}", e);
            JobState::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn supervisor() -> TranscodeSupervisor {
        TranscodeSupervisor::new("test", Duration::from_millis(200))
    }

    #[tokio::test]
    async fn spawn_failure_is_synchronous() {
        let sup = supervisor();
        let result = sup.start(CommandSpec::new("/nonexistent-transcoder-binary")).await;
        assert!(matches!(result, Err(SupervisorError::Spawn { .. })));
        assert_eq!(sup.state(), JobState::Idle);
    }

    #[tokio::test]
    async fn closing_stdin_ends_the_child_cleanly() {
        let sup = supervisor();
        sup.start(CommandSpec::new("cat").pipe_stdin()).await.unwrap();
        assert!(sup.is_running());

        let mut stdin = sup.take_stdin().await.unwrap();
        stdin.write_all(b"frame").await.unwrap();
        drop(stdin);

        assert_eq!(sup.wait_terminal().await, JobState::Exited(0));
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_on_the_watch_channel() {
        let sup = supervisor();
        sup.start(CommandSpec::new("sh").args(["-c", "exit 3"])).await.unwrap();
        assert_eq!(sup.wait_terminal().await, JobState::Exited(3));
    }

    #[tokio::test]
    async fn stop_kills_a_child_that_ignores_input_close() {
        let sup = supervisor();
        sup.start(CommandSpec::new("sleep").arg("30")).await.unwrap();
        sup.stop().await;
        assert!(sup.state().is_terminal());
        assert!(sup.stop_requested());
    }

    #[tokio::test]
    async fn second_start_stops_the_prior_child_first() {
        let sup = supervisor();
        sup.start(CommandSpec::new("cat").pipe_stdin()).await.unwrap();
        // Restart over a live child; the supervisor must tear it down first.
        sup.start(CommandSpec::new("sh").args(["-c", "exit 0"])).await.unwrap();
        assert_eq!(sup.wait_terminal().await, JobState::Exited(0));
    }
}
