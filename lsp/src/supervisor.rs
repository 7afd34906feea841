//! Server subprocess supervision.
//!
//! Spawning hands the stdio pipes to the caller (they go to the transport)
//! and keeps two background tasks: one drains stderr into the log and a
//! bounded tail buffer, the other owns the `Child` and waits for it to exit.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch};

use crate::config::ServerConfig;
use crate::error::LspError;
use crate::registry::RequestRegistry;
use crate::session::{SessionCell, SessionState};

/// Number of stderr lines kept for diagnostics.
pub const STDERR_TAIL_LINES: usize = 200;

/// What is known about the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Exited(ExitStatus),
    /// Waiting on the child failed; it is gone but its status is unknown.
    Lost,
}

type StderrTail = Arc<Mutex<VecDeque<String>>>;

/// Handle on a running server process.
///
/// Dropping the handle kills the process.
#[derive(Debug)]
pub struct ServerProcess {
    name: String,
    program: PathBuf,
    pid: Option<u32>,
    state: watch::Receiver<ProcessState>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    stderr_tail: StderrTail,
}

/// A freshly spawned process and the pipes the transport attaches to.
pub(crate) struct Spawned {
    pub process: ServerProcess,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

impl ServerProcess {
    /// Resolve and start `config.command`.
    ///
    /// When the process exits, every pending call in `registry` fails with
    /// `SessionClosed` and `session` becomes `Terminated`.
    pub(crate) fn spawn(
        name: &str,
        config: &ServerConfig,
        registry: Arc<RequestRegistry>,
        session: SessionCell,
    ) -> Result<Spawned, LspError> {
        let spawn_error = |reason: String| LspError::Spawn {
            command: config.command.clone(),
            reason,
        };

        let program = which::which(&config.command)
            .map_err(|e| spawn_error(format!("not found in PATH: {e}")))?;
        let mut cmd = Command::new(&program);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = config
            .working_dir
            .as_ref()
            .or(config.workspace_root.as_ref())
        {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| spawn_error(e.to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_error("no stdin from child".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error("no stdout from child".to_string()))?;
        let stderr = child.stderr.take();
        let pid = child.id();
        tracing::info!(server = name, pid = ?pid, program = %program.display(), "Spawned language server");

        let stderr_tail: StderrTail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        if let Some(stderr) = stderr {
            drain_stderr(name.to_string(), stderr, Arc::clone(&stderr_tail));
        }

        let (state_tx, state_rx) = watch::channel(ProcessState::Running);
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let watcher_name = name.to_string();
        tokio::spawn(async move {
            let waited = tokio::select! {
                status = child.wait() => status,
                // An explicit kill request, or the handle was dropped.
                _ = &mut kill_rx => {
                    if let Err(e) = child.start_kill() {
                        tracing::debug!(server = %watcher_name, "Kill failed: {e}");
                    }
                    child.wait().await
                }
            };
            let (state, reason) = match waited {
                Ok(status) => (
                    ProcessState::Exited(status),
                    format!("server process exited ({status})"),
                ),
                Err(e) => (
                    ProcessState::Lost,
                    format!("waiting on server process failed: {e}"),
                ),
            };
            state_tx.send_replace(state);

            let expected = session.get() == SessionState::ShuttingDown;
            registry.close_all(&reason);
            if session.terminate() && !expected {
                tracing::warn!(server = %watcher_name, %reason, "Language server died");
            } else {
                tracing::info!(server = %watcher_name, %reason, "Language server stopped");
            }
        });

        Ok(Spawned {
            process: Self {
                name: name.to_string(),
                program,
                pid,
                state: state_rx,
                kill_tx: Mutex::new(Some(kill_tx)),
                stderr_tail,
            },
            stdin,
            stdout,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolved executable path.
    #[must_use]
    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    #[must_use]
    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == ProcessState::Running
    }

    /// The most recent stderr lines, oldest first.
    #[must_use]
    pub fn stderr_tail(&self) -> Vec<String> {
        self.stderr_tail
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Wait for the process to exit.
    pub async fn wait(&self) -> ProcessState {
        let mut state = self.state.clone();
        match state.wait_for(|s| *s != ProcessState::Running).await {
            Ok(s) => *s,
            // The watcher task is gone, so the process is too.
            Err(_) => ProcessState::Lost,
        }
    }

    /// Ask the watcher to kill the process. Does not wait.
    pub fn kill(&self) {
        let tx = self
            .kill_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
    }

    /// Give the process `grace` to exit on its own, then kill it.
    pub async fn terminate(&self, grace: Duration) -> ProcessState {
        if let Ok(state) = tokio::time::timeout(grace, self.wait()).await {
            return state;
        }
        tracing::debug!(server = %self.name, "Server didn't exit in time, killing");
        self.kill();
        self.wait().await
    }
}

fn drain_stderr(name: String, stderr: ChildStderr, tail: StderrTail) {
    tokio::spawn(async move {
        // Raw lines: servers are free to write bytes that are not UTF-8, and
        // the pipe has to stay open until they exit.
        let mut reader = BufReader::new(stderr);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(trim_line_end(&buf)).into_owned();
                    tracing::debug!(target: "tether_lsp::stderr", server = %name, "{line}");
                    let mut tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                Err(e) => {
                    tracing::debug!(server = %name, "Reading server stderr failed: {e}");
                    break;
                }
            }
        }
    });
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> ServerConfig {
        ServerConfig::new("sh", "shell").with_args(["-c", script])
    }

    async fn eventually<F: Fn() -> bool>(check: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition reached");
    }

    #[tokio::test]
    async fn test_missing_command_is_spawn_error() {
        let config = ServerConfig::new("definitely-not-a-real-lsp-binary", "x");
        let err = ServerProcess::spawn("x", &config, RequestRegistry::new(), SessionCell::new())
            .err()
            .expect("spawn fails");
        assert!(matches!(err, LspError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_stderr_is_captured() {
        let spawned = ServerProcess::spawn(
            "sh",
            &sh("echo first >&2; echo second >&2; sleep 5"),
            RequestRegistry::new(),
            SessionCell::new(),
        )
        .unwrap();
        let process = spawned.process;
        eventually(|| process.stderr_tail().len() == 2).await;
        assert_eq!(process.stderr_tail(), vec!["first", "second"]);
        assert!(process.is_running());
        let state = process.terminate(Duration::from_millis(10)).await;
        assert!(matches!(state, ProcessState::Exited(_)));
    }

    #[tokio::test]
    async fn test_stderr_survives_invalid_utf8() {
        let spawned = ServerProcess::spawn(
            "sh",
            &sh("printf 'bad \\377\\r\\n' >&2; sleep 0.3; \
                 i=0; while [ $i -lt 50 ]; do echo after$i >&2; i=$((i+1)); done; sleep 5"),
            RequestRegistry::new(),
            SessionCell::new(),
        )
        .unwrap();
        let process = spawned.process;
        eventually(|| {
            process
                .stderr_tail()
                .last()
                .is_some_and(|l| l == "after49")
        })
        .await;
        assert!(process.is_running());
        let tail = process.stderr_tail();
        assert_eq!(tail.len(), 51);
        assert_eq!(tail[0], "bad \u{fffd}");
        process.kill();
    }

    #[tokio::test]
    async fn test_stderr_tail_is_bounded() {
        let spawned = ServerProcess::spawn(
            "sh",
            &sh("i=0; while [ $i -lt 250 ]; do echo line$i >&2; i=$((i+1)); done"),
            RequestRegistry::new(),
            SessionCell::new(),
        )
        .unwrap();
        let process = spawned.process;
        process.wait().await;
        eventually(|| {
            process
                .stderr_tail()
                .last()
                .is_some_and(|l| l == "line249")
        })
        .await;
        let tail = process.stderr_tail();
        assert_eq!(tail.len(), STDERR_TAIL_LINES);
        assert_eq!(tail[0], "line50");
    }

    #[tokio::test]
    async fn test_exit_fails_pending_and_terminates_session() {
        let registry = RequestRegistry::new();
        let session = SessionCell::new();
        session.transition(SessionState::NotStarted, SessionState::Starting);
        let handle = registry.register(1, "initialize", None).unwrap();

        let spawned =
            ServerProcess::spawn("sh", &sh("exit 3"), Arc::clone(&registry), session.clone())
                .unwrap();
        let state = spawned.process.wait().await;
        match state {
            ProcessState::Exited(status) => assert_eq!(status.code(), Some(3)),
            other => panic!("unexpected state {other:?}"),
        }
        assert!(matches!(
            handle.wait().await,
            Err(LspError::SessionClosed(_))
        ));
        session.terminated().await;
    }
}
