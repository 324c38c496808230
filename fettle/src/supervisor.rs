use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::drain::{drain, LineSink, Stream};
use crate::metrics::PROCESS_EXITS_TOTAL;

/// Errors that stop a command from being launched at all.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("command for process {name} is empty")]
    EmptyCommand { name: String },
    #[error("failed to start process {name} ({command}): {source}")]
    Spawn {
        name: String,
        command: String,
        source: io::Error,
    },
    #[error("process {name} has no {stream} pipe")]
    MissingPipe { name: String, stream: Stream },
}

/// Why a supervised process stopped, when it did not exit cleanly.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("process exited with {0}")]
    Exited(ExitStatus),
    #[error("failed to wait for process: {0}")]
    Wait(#[source] io::Error),
}

/// Completion event of one launched command. `error` is `None` for a clean exit.
#[derive(Debug)]
pub struct SupervisedProcess {
    pub name: String,
    pub command: String,
    pub error: Option<ProcessError>,
}

impl SupervisedProcess {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Record of a launch, kept for the lifetime of the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launched {
    pub name: String,
    pub command: String,
    pub pid: Option<u32>,
}

/// Launches commands and reports each one's exit exactly once on the completion channel.
pub struct Supervisor {
    completions: mpsc::Sender<SupervisedProcess>,
    sink: Arc<dyn LineSink>,
    shutdown: CancellationToken,
    launched: Vec<Launched>,
    waiters: JoinSet<()>,
}

impl Supervisor {
    /// Build a supervisor and the receiving end of its completion channel.
    ///
    /// `capacity` should cover every process that will be launched, so a waiter never blocks
    /// on a coordinator that already stopped listening.
    pub fn new(
        sink: Arc<dyn LineSink>,
        shutdown: CancellationToken,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<SupervisedProcess>) {
        let (completions, receiver) = mpsc::channel(capacity.max(1));
        let supervisor = Self {
            completions,
            sink,
            shutdown,
            launched: Vec::new(),
            waiters: JoinSet::new(),
        };
        (supervisor, receiver)
    }

    pub fn launched(&self) -> &[Launched] {
        &self.launched
    }

    /// Start `command_line` as process `name` and return once it is running.
    ///
    /// The command line is split on whitespace, without any shell interpretation.
    pub async fn launch(&mut self, name: &str, command_line: &str) -> Result<(), SupervisorError> {
        let mut parts = command_line.split_whitespace();
        let program = parts.next().ok_or_else(|| SupervisorError::EmptyCommand {
            name: name.to_owned(),
        })?;

        let mut child = Command::new(program)
            .args(parts)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                name: name.to_owned(),
                command: command_line.to_owned(),
                source,
            })?;

        // Pipes are created by spawn, so nothing the child writes can be lost before the
        // drainers pick up the read ends.
        let stdout = child.stdout.take().ok_or_else(|| SupervisorError::MissingPipe {
            name: name.to_owned(),
            stream: Stream::Stdout,
        })?;
        let stderr = child.stderr.take().ok_or_else(|| SupervisorError::MissingPipe {
            name: name.to_owned(),
            stream: Stream::Stderr,
        })?;

        let (stdout_attached, stdout_ready) = oneshot::channel();
        let (stderr_attached, stderr_ready) = oneshot::channel();

        let stdout_drain = {
            let sink = self.sink.clone();
            let name = name.to_owned();
            tokio::spawn(async move {
                drain(stdout, &name, Stream::Stdout, sink.as_ref(), stdout_attached).await
            })
        };
        let stderr_drain = {
            let sink = self.sink.clone();
            let name = name.to_owned();
            tokio::spawn(async move {
                drain(stderr, &name, Stream::Stderr, sink.as_ref(), stderr_attached).await
            })
        };

        // A drainer that fails before attaching still lets the launch proceed; its read error
        // shows up when the waiter joins it.
        let (stdout_ready, stderr_ready) = tokio::join!(stdout_ready, stderr_ready);
        if stdout_ready.is_err() || stderr_ready.is_err() {
            warn!(process = name, "output drainer exited before attaching");
        }

        let pid = child.id();
        info!(process = name, command = command_line, pid, "started process");

        self.launched.push(Launched {
            name: name.to_owned(),
            command: command_line.to_owned(),
            pid,
        });

        let process = SupervisedProcess {
            name: name.to_owned(),
            command: command_line.to_owned(),
            error: None,
        };
        self.waiters.spawn(wait_and_report(
            child,
            process,
            Drains {
                stdout: stdout_drain,
                stderr: stderr_drain,
            },
            self.completions.clone(),
            self.shutdown.clone(),
        ));

        Ok(())
    }

    /// Wait up to `grace` for every waiter to reap its child. Call after cancelling the
    /// shutdown token, otherwise this waits for the processes to exit on their own.
    pub async fn join(&mut self, grace: Duration) -> bool {
        let all_done = async {
            while let Some(res) = self.waiters.join_next().await {
                if let Err(e) = res {
                    error!("process waiter failed: {}", e);
                }
            }
        };

        match tokio::time::timeout(grace, all_done).await {
            Ok(()) => true,
            Err(_) => {
                warn!("timed out waiting for supervised processes to stop");
                self.waiters.abort_all();
                false
            }
        }
    }
}

struct Drains {
    stdout: tokio::task::JoinHandle<io::Result<u64>>,
    stderr: tokio::task::JoinHandle<io::Result<u64>>,
}

impl Drains {
    async fn finish(self, process: String) {
        let (stdout, stderr) = tokio::join!(self.stdout, self.stderr);
        for (stream, res) in [(Stream::Stdout, stdout), (Stream::Stderr, stderr)] {
            let stream = stream.as_str();
            match res {
                Ok(Ok(lines)) => debug!(process = %process, stream, lines, "drained"),
                Ok(Err(e)) => error!(process = %process, stream, "failed to read output: {}", e),
                Err(e) => error!(process = %process, stream, "drainer failed: {}", e),
            }
        }
    }
}

async fn wait_and_report(
    mut child: Child,
    mut process: SupervisedProcess,
    drains: Drains,
    completions: mpsc::Sender<SupervisedProcess>,
    shutdown: CancellationToken,
) {
    let drained = drains.finish(process.name.clone());
    tokio::pin!(drained);

    // Output is fully drained before the exit is reported, so every line the child wrote is
    // logged ahead of the completion event.
    tokio::select! {
        _ = &mut drained => {}
        _ = shutdown.cancelled() => {
            info!(process = %process.name, "stopping process");
            if let Err(e) = child.start_kill() {
                warn!(process = %process.name, "failed to kill process: {}", e);
            }
            drained.await;
        }
    }

    process.error = match child.wait().await {
        Ok(status) if status.success() => None,
        Ok(status) => Some(ProcessError::Exited(status)),
        Err(e) => Some(ProcessError::Wait(e)),
    };

    let outcome = if process.succeeded() { "success" } else { "failure" };
    metrics::counter!(
        PROCESS_EXITS_TOTAL,
        &[("process", process.name.clone()), ("outcome", outcome.to_owned())]
    )
    .increment(1);

    if shutdown.is_cancelled() {
        debug!(process = %process.name, "process stopped during shutdown");
        return;
    }

    if let Err(e) = completions.send(process).await {
        debug!(process = %e.0.name, "completion dropped, nobody is listening");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drain::tests::CollectingSink;

    fn supervisor(sink: Arc<CollectingSink>) -> (Supervisor, mpsc::Receiver<SupervisedProcess>) {
        Supervisor::new(sink, CancellationToken::new(), 8)
    }

    #[tokio::test]
    async fn reports_clean_exit() {
        let sink = Arc::new(CollectingSink::default());
        let (mut supervisor, mut completions) = supervisor(sink.clone());

        supervisor.launch("ok", "true").await.unwrap();

        let process = completions.recv().await.unwrap();
        assert_eq!(process.name, "ok");
        assert_eq!(process.command, "true");
        assert!(process.succeeded());
        assert_eq!(supervisor.launched().len(), 1);
        assert_eq!(supervisor.launched()[0].name, "ok");
    }

    #[tokio::test]
    async fn reports_failed_exit() {
        let sink = Arc::new(CollectingSink::default());
        let (mut supervisor, mut completions) = supervisor(sink);

        supervisor.launch("bad", "false").await.unwrap();

        let process = completions.recv().await.unwrap();
        assert_eq!(process.name, "bad");
        match process.error {
            Some(ProcessError::Exited(status)) => assert_eq!(status.code(), Some(1)),
            other => panic!("unexpected completion: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_binary_fails_launch() {
        let sink = Arc::new(CollectingSink::default());
        let (mut supervisor, _completions) = supervisor(sink);

        let err = supervisor
            .launch("ghost", "/nonexistent/fettle-test-binary --flag")
            .await
            .unwrap_err();

        assert!(matches!(err, SupervisorError::Spawn { ref name, .. } if name == "ghost"));
        assert!(supervisor.launched().is_empty());
    }

    #[tokio::test]
    async fn empty_command_fails_launch() {
        let sink = Arc::new(CollectingSink::default());
        let (mut supervisor, _completions) = supervisor(sink);

        let err = supervisor.launch("blank", "   ").await.unwrap_err();

        assert!(matches!(err, SupervisorError::EmptyCommand { .. }));
    }

    #[tokio::test]
    async fn output_is_drained_before_completion() {
        let sink = Arc::new(CollectingSink::default());
        let (mut supervisor, mut completions) = supervisor(sink.clone());

        supervisor
            .launch("counter", "seq 1 500")
            .await
            .unwrap();

        let process = completions.recv().await.unwrap();
        assert!(process.succeeded());

        let lines = sink.lines_for("counter", Stream::Stdout);
        assert_eq!(lines.len(), 500);
        assert_eq!(lines.first().map(String::as_str), Some("1"));
        assert_eq!(lines.last().map(String::as_str), Some("500"));
    }

    #[tokio::test]
    async fn only_exited_process_reports() {
        let sink = Arc::new(CollectingSink::default());
        let shutdown = CancellationToken::new();
        let (mut supervisor, mut completions) = Supervisor::new(sink, shutdown.clone(), 8);

        supervisor.launch("daemon", "sleep 30").await.unwrap();
        supervisor.launch("oneshot", "true").await.unwrap();

        let process = completions.recv().await.unwrap();
        assert_eq!(process.name, "oneshot");

        let nothing_else =
            tokio::time::timeout(Duration::from_millis(300), completions.recv()).await;
        assert!(nothing_else.is_err(), "long running process must not report");

        shutdown.cancel();
        assert!(supervisor.join(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn shutdown_kills_children() {
        let sink = Arc::new(CollectingSink::default());
        let shutdown = CancellationToken::new();
        let (mut supervisor, mut completions) = Supervisor::new(sink, shutdown.clone(), 8);

        supervisor.launch("daemon", "sleep 30").await.unwrap();
        shutdown.cancel();

        assert!(supervisor.join(Duration::from_secs(5)).await);
        drop(supervisor);
        assert!(completions.recv().await.is_none());
    }
}
