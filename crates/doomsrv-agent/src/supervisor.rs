use std::{
    collections::BTreeMap,
    path::{Component, Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStderr, ChildStdin, ChildStdout, Command},
    sync::{Mutex, mpsc},
};

use doomsrv_proto::ServerConfiguration;

use crate::waiter::{ConsoleResultWaiter, HandlerSlot, ServerInitWaiter};

const READY_TIMEOUT: Duration = Duration::from_secs(60);
const CONSOLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("config path {path:?} is absolute; discarding request as invalid")]
    AbsoluteConfigPath { path: String },
    #[error("config path {path:?} escapes the work dir; discarding request as invalid")]
    EscapingConfigPath { path: String },
    #[error("timed out waiting for {waiting_for} after {after:?}")]
    Timeout {
        waiting_for: &'static str,
        after: Duration,
    },
    #[error("no server is running")]
    NoServer,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Owns one spawned game server: its stdin writer, the stdout/stderr readers
/// and the output handler slot. Spawns exactly one subprocess over its
/// lifetime; a new launch means a new supervisor.
pub struct ServerSupervisor {
    stdin_tx: mpsc::UnboundedSender<String>,
    handlers: HandlerSlot,
    child: Mutex<Child>,
}

impl std::fmt::Debug for ServerSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSupervisor").finish_non_exhaustive()
    }
}

impl ServerSupervisor {
    /// Materializes the config files, spawns the server with
    /// `cwd = work_dir`, wires the three pipe workers and blocks until the
    /// readiness handshake completes (60 s window).
    ///
    /// `console_tx` is the bounded capture queue feeding the output
    /// scheduler; the stdout reader blocks on it when full.
    pub async fn run(
        executable: &Path,
        work_dir: &Path,
        configuration: &ServerConfiguration,
        console_tx: mpsc::Sender<String>,
    ) -> Result<Self, SupervisorError> {
        Self::run_with_ready_timeout(executable, work_dir, configuration, console_tx, READY_TIMEOUT)
            .await
    }

    pub(crate) async fn run_with_ready_timeout(
        executable: &Path,
        work_dir: &Path,
        configuration: &ServerConfiguration,
        console_tx: mpsc::Sender<String>,
        ready_timeout: Duration,
    ) -> Result<Self, SupervisorError> {
        materialize_configs(work_dir, &configuration.configs).await?;

        let mut child = Command::new(executable)
            .args(&configuration.command_line)
            .current_dir(work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        tracing::info!(
            executable = %executable.display(),
            pid = child.id(),
            "server spawned"
        );

        let stdin = take_pipe(child.stdin.take(), "stdin")?;
        let stdout = take_pipe(child.stdout.take(), "stdout")?;
        let stderr = take_pipe(child.stderr.take(), "stderr")?;

        let stdin_tx = spawn_stdin_writer(stdin);
        spawn_stderr_reader(stderr);

        // Install the init waiter before the stdout router starts, so the
        // ready sentinel cannot slip past an empty slot.
        let handlers = HandlerSlot::default();
        let (waiter, done) = ServerInitWaiter::new(stdin_tx.clone());
        handlers.install(Box::new(waiter));
        spawn_stdout_router(stdout, handlers.clone(), console_tx);
        let ready = tokio::time::timeout(ready_timeout, done).await;
        handlers.detach();
        match ready {
            Ok(Ok(())) => tracing::info!("server completed the readiness handshake"),
            Ok(Err(_)) => {
                // Dropping `child` kills the subprocess (kill_on_drop).
                return Err(std::io::Error::other(
                    "readiness handler dropped before completion",
                )
                .into());
            }
            Err(_) => {
                return Err(SupervisorError::Timeout {
                    waiting_for: "server readiness",
                    after: ready_timeout,
                });
            }
        }

        Ok(Self {
            stdin_tx,
            handlers,
            child: Mutex::new(child),
        })
    }

    /// Runs a console command batch: installs the result collector, writes
    /// each line to the server's stdin in order and waits up to 30 s for the
    /// `DoomConsoleResultEnd` terminator. The caller is responsible for the
    /// batch ending in a server-side echo of the terminator, and for not
    /// overlapping calls (only one handler may be installed at a time).
    pub async fn execute_console(&self, command: &[String]) -> Result<Vec<String>, SupervisorError> {
        self.execute_console_with_timeout(command, CONSOLE_TIMEOUT)
            .await
    }

    pub(crate) async fn execute_console_with_timeout(
        &self,
        command: &[String],
        timeout: Duration,
    ) -> Result<Vec<String>, SupervisorError> {
        let (waiter, done) = ConsoleResultWaiter::new();
        // Install before writing so a fast server cannot reply into the gap.
        self.handlers.install(Box::new(waiter));

        for line in command {
            if self.stdin_tx.send(line.clone()).is_err() {
                self.handlers.detach();
                return Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "server stdin is closed",
                )
                .into());
            }
        }

        let result = tokio::time::timeout(timeout, done).await;
        self.handlers.detach();
        match result {
            Ok(Ok(lines)) => Ok(lines),
            Ok(Err(_)) => {
                Err(std::io::Error::other("console handler dropped before completion").into())
            }
            Err(_) => Err(SupervisorError::Timeout {
                waiting_for: "console result",
                after: timeout,
            }),
        }
    }

    /// Kills the subprocess and reaps it. Reader and writer tasks end on
    /// their own once the pipes close.
    pub async fn stop(&self) {
        let mut child = self.child.lock().await;
        if let Err(error) = child.start_kill() {
            tracing::debug!(%error, "server kill failed (likely already exited)");
        }
        match child.wait().await {
            Ok(status) => tracing::info!(%status, "server stopped"),
            Err(error) => tracing::warn!(%error, "failed to reap server"),
        }
    }
}

fn take_pipe<T>(pipe: Option<T>, name: &str) -> std::io::Result<T> {
    pipe.ok_or_else(|| std::io::Error::other(format!("child {name} was not piped")))
}

/// Writes config files under `work_dir`, creating parent directories as
/// needed. A rejected path aborts the whole batch; files written for earlier
/// entries stay on disk (no rollback).
async fn materialize_configs(
    work_dir: &Path,
    configs: &BTreeMap<String, Vec<String>>,
) -> Result<(), SupervisorError> {
    for (name, lines) in configs {
        let rel = checked_rel_path(name)?;
        let target = work_dir.join(rel);

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
            // canonicalize() resolves symlinks, so a symlinked subdir cannot
            // smuggle the write outside the work dir.
            let root = tokio::fs::canonicalize(work_dir).await?;
            let parent = tokio::fs::canonicalize(parent).await?;
            if !parent.starts_with(&root) {
                return Err(SupervisorError::EscapingConfigPath { path: name.clone() });
            }
        }

        tokio::fs::write(&target, lines.join("\n")).await?;
        tracing::debug!(path = %target.display(), lines = lines.len(), "config written");
    }
    Ok(())
}

/// Lexical path guard: relative, no parent traversal, no prefix components.
fn checked_rel_path(raw: &str) -> Result<PathBuf, SupervisorError> {
    let path = Path::new(raw);
    if path.is_absolute() {
        return Err(SupervisorError::AbsoluteConfigPath {
            path: raw.to_string(),
        });
    }

    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(seg) => out.push(seg),
            Component::ParentDir => {
                return Err(SupervisorError::EscapingConfigPath {
                    path: raw.to_string(),
                });
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(SupervisorError::AbsoluteConfigPath {
                    path: raw.to_string(),
                });
            }
        }
    }
    Ok(out)
}

/// The stdin writer flushes after every line. The pipe is buffered, and an
/// unflushed command would leave the server blocked on input it cannot see.
fn spawn_stdin_writer(mut stdin: ChildStdin) -> mpsc::UnboundedSender<String> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            let write = async {
                stdin.write_all(line.as_bytes()).await?;
                stdin.write_all(b"\n").await?;
                stdin.flush().await
            };
            if let Err(error) = write.await {
                tracing::warn!(%error, "server stdin write failed");
                break;
            }
        }
        // Channel closed or pipe broken: dropping stdin closes the pipe.
    });
    tx
}

fn spawn_stderr_reader(stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::warn!(line = %line, "server stderr");
        }
    });
}

/// Routes every stdout line to the installed handler (under the slot lock)
/// and then into the capture queue. The queue send blocks when the queue is
/// full; that backpressure is deliberate, lines are never dropped.
fn spawn_stdout_router(stdout: ChildStdout, handlers: HandlerSlot, console_tx: mpsc::Sender<String>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(line = %line, "server stdout");
            handlers.deliver(&line);
            let _ = console_tx.send(line).await;
        }
        tracing::info!("server stdout closed");
    });
}
