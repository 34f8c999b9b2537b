//! Isolation backend traits and the four tier implementations.
//!
//! A backend prepares an isolated environment around a workspace and hands
//! back a [`SandboxHandle`]. The handle launches the entrypoint, stops the
//! whole execution unit on request, and releases every kernel resource it
//! acquired. Supervision (timeouts, capture, teardown ordering) lives in
//! [`crate::supervisor`], not here.

pub mod container;
pub mod namespace;
pub mod restricted;
pub mod unrestricted;

pub use container::ContainerBackend;
pub use namespace::NamespaceBackend;
pub use restricted::RestrictedBackend;
pub use unrestricted::UnrestrictedBackend;

use std::fmt;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;

use crate::error::{CleanupWarning, LaunchError};
use crate::limits::EnforceableLimits;
use crate::process::{spawn_reaper, ExitWatch, ProcessGroup};
use crate::types::{BackendKind, InterpreterKind};
use crate::workspace::IsolatedWorkspace;

/// `PATH` given to sandboxed children.
pub const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// How a child execution unit ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ProcessExit {
    pub const fn exited(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub const fn signaled(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }
}

impl From<ExitStatus> for ProcessExit {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

/// A launched execution: its standard streams and a wait-for-exit future.
pub struct LiveExecution {
    pub stdin: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub stderr: Box<dyn AsyncRead + Send + Unpin>,
    pub exit: BoxFuture<'static, io::Result<ProcessExit>>,
}

impl fmt::Debug for LiveExecution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveExecution")
            .field("stdin", &self.stdin.is_some())
            .finish_non_exhaustive()
    }
}

/// One isolation tier.
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Whether this tier can run `interpreter` at all.
    fn supports(&self, _interpreter: InterpreterKind) -> bool {
        true
    }

    /// Cheap check that the tier is usable on this host. The error text
    /// becomes the unavailability reason.
    async fn probe(&self) -> anyhow::Result<()>;

    /// Build an isolated environment around `workspace`.
    async fn prepare(
        &self,
        workspace: &IsolatedWorkspace,
        limits: &EnforceableLimits,
    ) -> Result<Box<dyn SandboxHandle>, LaunchError>;
}

/// A prepared environment. `terminate` and `dispose` are idempotent.
#[async_trait]
pub trait SandboxHandle: Send {
    /// Start `code` under `interpreter`. The entrypoint file has already
    /// been written to the workspace.
    async fn run(
        &mut self,
        code: &str,
        interpreter: InterpreterKind,
    ) -> Result<LiveExecution, LaunchError>;

    /// Stop the whole execution unit: graceful signal, `grace`, then forced.
    async fn terminate(&mut self, grace: Duration);

    /// Whether `terminate` has been called.
    fn terminated(&self) -> bool;

    /// Release every resource the handle holds.
    async fn dispose(&mut self) -> Vec<CleanupWarning>;
}

/// Environment given to every sandboxed child; the host environment is
/// cleared first.
pub fn sandbox_env(home: &str) -> [(&'static str, String); 5] {
    [
        ("PATH", SANDBOX_PATH.to_owned()),
        ("HOME", home.to_owned()),
        ("PYTHONDONTWRITEBYTECODE", "1".to_owned()),
        ("PYTHONUNBUFFERED", "1".to_owned()),
        ("LANG", "C.UTF-8".to_owned()),
    ]
}

/// A spawned child leading its own process group.
#[derive(Debug)]
pub(crate) struct SpawnedGroup {
    pub group: ProcessGroup,
    pub exit_watch: ExitWatch,
}

/// Spawn `cmd` with piped streams and hand back the live execution.
///
/// The caller configures the program, arguments, environment and process
/// group; this wires up the pipes and starts the reaper.
pub(crate) fn spawn_piped(
    mut cmd: Command,
    backend: BackendKind,
) -> Result<(LiveExecution, SpawnedGroup), LaunchError> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| LaunchError::unavailable(backend, format!("failed to spawn child: {e}")))?;

    let pid = child
        .id()
        .ok_or_else(|| LaunchError::unavailable(backend, "child exited before it was tracked"))?;
    let group = ProcessGroup::new(pid)
        .map_err(|e| LaunchError::unavailable(backend, format!("bad child pid: {e}")))?;

    let stdin = child
        .stdin
        .take()
        .map(|s| Box::new(s) as Box<dyn AsyncWrite + Send + Unpin>);
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| LaunchError::unavailable(backend, "child stdout not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| LaunchError::unavailable(backend, "child stderr not captured"))?;

    let (exit, exit_watch) = spawn_reaper(child);
    Ok((
        LiveExecution {
            stdin,
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            exit,
        },
        SpawnedGroup { group, exit_watch },
    ))
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted backends for selector and supervisor tests.

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use futures::FutureExt;

    use super::*;

    /// What a scripted backend does at each step.
    #[derive(Debug, Clone)]
    pub enum Script {
        /// `probe` fails.
        Unavailable(&'static str),
        /// `prepare` fails with `BackendUnavailable`.
        PrepareFails(&'static str),
        /// `run` fails with `BackendUnavailable`.
        RunFails(&'static str),
        /// Runs and exits with the code after writing stdout.
        Exits { code: i32, stdout: &'static str },
        /// Never exits until terminated.
        Hangs,
    }

    #[derive(Debug, Default)]
    pub struct Counters {
        pub probes: AtomicUsize,
        pub prepares: AtomicUsize,
        pub runs: AtomicUsize,
        pub terminates: AtomicUsize,
        pub disposes: AtomicUsize,
    }

    pub struct ScriptedBackend {
        pub kind: BackendKind,
        pub script: Script,
        pub counters: Arc<Counters>,
    }

    impl ScriptedBackend {
        pub fn new(kind: BackendKind, script: Script) -> Self {
            Self {
                kind,
                script,
                counters: Arc::new(Counters::default()),
            }
        }
    }

    #[async_trait]
    impl IsolationBackend for ScriptedBackend {
        fn kind(&self) -> BackendKind {
            self.kind
        }

        async fn probe(&self) -> anyhow::Result<()> {
            self.counters.probes.fetch_add(1, Ordering::SeqCst);
            match self.script {
                Script::Unavailable(reason) => anyhow::bail!(reason),
                _ => Ok(()),
            }
        }

        async fn prepare(
            &self,
            _workspace: &IsolatedWorkspace,
            _limits: &EnforceableLimits,
        ) -> Result<Box<dyn SandboxHandle>, LaunchError> {
            self.counters.prepares.fetch_add(1, Ordering::SeqCst);
            if let Script::PrepareFails(reason) = self.script {
                return Err(LaunchError::unavailable(self.kind, reason));
            }
            Ok(Box::new(ScriptedHandle {
                kind: self.kind,
                script: self.script.clone(),
                counters: Arc::clone(&self.counters),
                kill: None,
                terminated: false,
                disposed: false,
            }))
        }
    }

    pub struct ScriptedHandle {
        kind: BackendKind,
        script: Script,
        counters: Arc<Counters>,
        kill: Option<tokio::sync::oneshot::Sender<()>>,
        terminated: bool,
        disposed: bool,
    }

    #[async_trait]
    impl SandboxHandle for ScriptedHandle {
        async fn run(
            &mut self,
            _code: &str,
            _interpreter: InterpreterKind,
        ) -> Result<LiveExecution, LaunchError> {
            self.counters.runs.fetch_add(1, Ordering::SeqCst);
            match self.script.clone() {
                Script::RunFails(reason) => Err(LaunchError::unavailable(self.kind, reason)),
                Script::Exits { code, stdout } => Ok(LiveExecution {
                    stdin: None,
                    stdout: Box::new(stdout.as_bytes()),
                    stderr: Box::new(tokio::io::empty()),
                    exit: async move { Ok(ProcessExit::exited(code)) }.boxed(),
                }),
                Script::Hangs => {
                    let (tx, rx) = tokio::sync::oneshot::channel();
                    self.kill = Some(tx);
                    Ok(LiveExecution {
                        stdin: None,
                        stdout: Box::new(tokio::io::empty()),
                        stderr: Box::new(tokio::io::empty()),
                        exit: async move {
                            let _ = rx.await;
                            Ok(ProcessExit::signaled(libc::SIGKILL))
                        }
                        .boxed(),
                    })
                }
                Script::Unavailable(_) | Script::PrepareFails(_) => {
                    unreachable!("never prepared")
                }
            }
        }

        async fn terminate(&mut self, _grace: Duration) {
            if self.terminated {
                return;
            }
            self.terminated = true;
            self.counters.terminates.fetch_add(1, Ordering::SeqCst);
            if let Some(kill) = self.kill.take() {
                let _ = kill.send(());
            }
        }

        fn terminated(&self) -> bool {
            self.terminated
        }

        async fn dispose(&mut self) -> Vec<CleanupWarning> {
            if self.disposed {
                return Vec::new();
            }
            self.disposed = true;
            self.counters.disposes.fetch_add(1, Ordering::SeqCst);
            Vec::new()
        }
    }
}
