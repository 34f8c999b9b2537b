//! Restricted tier: Python on an embedded RustPython VM in a forked worker.
//!
//! Each execution forks a worker process that hosts a fresh interpreter.
//! The worker narrows the interpreter to pure computation before user code
//! runs (see [`worker`]) and writes output straight into pipes. There is no
//! kernel boundary beyond the worker's own rlimits: no filesystem or memory
//! ceiling can be enforced, and only Python is accepted.
//!
//! The worker leads its own process group, so termination is the same
//! SIGTERM, grace, SIGKILL sequence the host tiers use.

use std::time::Duration;

use async_trait::async_trait;
use tracing::instrument;

use super::{IsolationBackend, SandboxHandle};
use crate::config::RestrictedConfig;
use crate::error::LaunchError;
use crate::limits::EnforceableLimits;
use crate::types::{BackendKind, InterpreterKind};
use crate::workspace::IsolatedWorkspace;

#[cfg(feature = "restricted-python")]
mod worker;

const KIND: BackendKind = BackendKind::RestrictedInterpreter;

/// How long the self-test in `probe` may take.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Forked RustPython with a reduced builtin surface.
#[derive(Debug, Clone)]
pub struct RestrictedBackend {
    config: RestrictedConfig,
    output_cap: usize,
}

impl RestrictedBackend {
    /// `output_cap` bounds what the worker writes to each stream.
    pub const fn new(config: RestrictedConfig, output_cap: usize) -> Self {
        Self { config, output_cap }
    }
}

#[async_trait]
impl IsolationBackend for RestrictedBackend {
    fn kind(&self) -> BackendKind {
        KIND
    }

    fn supports(&self, interpreter: InterpreterKind) -> bool {
        interpreter == InterpreterKind::Python
    }

    #[instrument(skip(self), fields(backend = "restricted"))]
    async fn probe(&self) -> anyhow::Result<()> {
        if !self.config.enabled {
            anyhow::bail!("restricted interpreter disabled by configuration");
        }
        #[cfg(feature = "restricted-python")]
        {
            embedded::self_test(self.output_cap, PROBE_TIMEOUT).await
        }
        #[cfg(not(feature = "restricted-python"))]
        {
            let _ = PROBE_TIMEOUT;
            anyhow::bail!("built without the restricted-python feature")
        }
    }

    async fn prepare(
        &self,
        _workspace: &IsolatedWorkspace,
        limits: &EnforceableLimits,
    ) -> Result<Box<dyn SandboxHandle>, LaunchError> {
        #[cfg(feature = "restricted-python")]
        {
            Ok(Box::new(embedded::RestrictedHandle::new(
                self.output_cap,
                limits.cpu_seconds,
            )))
        }
        #[cfg(not(feature = "restricted-python"))]
        {
            let _ = limits;
            Err(LaunchError::unavailable(
                KIND,
                "built without the restricted-python feature",
            ))
        }
    }
}

#[cfg(feature = "restricted-python")]
mod embedded {
    use std::io;
    use std::time::Duration;

    use anyhow::Context;
    use async_trait::async_trait;
    use tokio::io::AsyncReadExt;
    use tokio::net::unix::pipe;
    use tokio::sync::oneshot;
    use tracing::debug;

    use super::worker::{fork_worker, Worker, WorkerPlan};
    use super::KIND;
    use crate::backend::{LiveExecution, ProcessExit, SandboxHandle, SpawnedGroup};
    use crate::error::{CleanupWarning, LaunchError};
    use crate::process::{spawn_pid_reaper, ProcessGroup};
    use crate::types::InterpreterKind;

    /// Native stack for the forking thread; the worker inherits it and the
    /// VM recurses on it.
    const STACK_SIZE: usize = 16 * 1024 * 1024;

    /// Fork a worker from a thread with a large stack.
    async fn start_worker(plan: WorkerPlan) -> io::Result<Worker> {
        let (tx, rx) = oneshot::channel();
        std::thread::Builder::new()
            .name("restricted-fork".into())
            .stack_size(STACK_SIZE)
            .spawn(move || {
                let _ = tx.send(fork_worker(&plan));
            })?;
        rx.await
            .map_err(|_| io::Error::other("fork thread ended without a result"))?
    }

    /// Track a forked worker: group, reaper and async pipe ends.
    fn attach(worker: Worker) -> io::Result<(LiveExecution, SpawnedGroup)> {
        let raw = u32::try_from(worker.pid.as_raw())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "negative pid"))?;
        let group = ProcessGroup::new(raw)?;
        let (exit, exit_watch) = spawn_pid_reaper(worker.pid);
        let spawned = SpawnedGroup { group, exit_watch };
        let streams = pipe::Receiver::from_owned_fd(worker.stdout)
            .and_then(|stdout| Ok((stdout, pipe::Receiver::from_owned_fd(worker.stderr)?)));
        match streams {
            Ok((stdout, stderr)) => Ok((
                LiveExecution {
                    stdin: None,
                    stdout: Box::new(stdout),
                    stderr: Box::new(stderr),
                    exit,
                },
                spawned,
            )),
            Err(e) => {
                spawned.group.reap_stragglers();
                Err(e)
            }
        }
    }

    /// Check that a trivial program round-trips through a worker.
    pub async fn self_test(output_cap: usize, limit: Duration) -> anyhow::Result<()> {
        let plan = WorkerPlan {
            code: "print(1 + 1)".to_owned(),
            output_cap,
            cpu_seconds: None,
        };
        let worker = start_worker(plan)
            .await
            .context("failed to fork interpreter worker")?;
        let (mut live, spawned) = attach(worker).context("failed to attach interpreter worker")?;

        let run = async {
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            let (out, err) = tokio::join!(
                live.stdout.read_to_end(&mut stdout),
                live.stderr.read_to_end(&mut stderr),
            );
            out?;
            err?;
            let exit = (&mut live.exit).await?;
            Ok::<_, io::Error>((stdout, stderr, exit))
        };
        let outcome = tokio::time::timeout(limit, run).await;
        if outcome.is_err() {
            spawned.group.reap_stragglers();
        }
        let (stdout, stderr, exit) = outcome
            .context("interpreter self-test timed out")?
            .context("interpreter self-test I/O failed")?;
        if stdout != b"2\n" || exit != ProcessExit::exited(0) {
            anyhow::bail!(
                "interpreter self-test failed: {}",
                String::from_utf8_lossy(&stderr).trim()
            );
        }
        Ok(())
    }

    pub struct RestrictedHandle {
        output_cap: usize,
        cpu_seconds: Option<u64>,
        spawned: Option<SpawnedGroup>,
        terminated: bool,
        disposed: bool,
    }

    impl RestrictedHandle {
        pub const fn new(output_cap: usize, cpu_seconds: Option<u64>) -> Self {
            Self {
                output_cap,
                cpu_seconds,
                spawned: None,
                terminated: false,
                disposed: false,
            }
        }
    }

    #[async_trait]
    impl SandboxHandle for RestrictedHandle {
        async fn run(
            &mut self,
            code: &str,
            interpreter: InterpreterKind,
        ) -> Result<LiveExecution, LaunchError> {
            if interpreter != InterpreterKind::Python {
                return Err(LaunchError::unavailable(
                    KIND,
                    format!("{interpreter:?} is not supported by the restricted interpreter"),
                ));
            }

            let plan = WorkerPlan {
                code: code.to_owned(),
                output_cap: self.output_cap,
                cpu_seconds: self.cpu_seconds,
            };
            let worker = start_worker(plan)
                .await
                .map_err(|e| LaunchError::unavailable(KIND, format!("failed to fork interpreter worker: {e}")))?;
            let pid = worker.pid;
            let (live, spawned) = attach(worker)
                .map_err(|e| LaunchError::unavailable(KIND, format!("failed to attach interpreter worker: {e}")))?;
            self.spawned = Some(spawned);
            debug!(%pid, "Started interpreter worker");
            Ok(live)
        }

        async fn terminate(&mut self, grace: Duration) {
            if self.terminated {
                return;
            }
            self.terminated = true;
            if let Some(spawned) = &self.spawned {
                spawned.group.terminate(grace).await;
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
            if let Some(spawned) = &mut self.spawned {
                spawned.group.reap_stragglers();
                if !spawned.exit_watch.wait(Duration::from_secs(1)).await {
                    return vec![CleanupWarning::new(
                        Some(KIND),
                        format!("interpreter worker {} not reaped after SIGKILL", spawned.group.pgid()),
                    )];
                }
            }
            Vec::new()
        }
    }

    impl Drop for RestrictedHandle {
        fn drop(&mut self) {
            if self.disposed {
                return;
            }
            if let Some(spawned) = &self.spawned {
                spawned.group.reap_stragglers();
            }
        }
    }
}
