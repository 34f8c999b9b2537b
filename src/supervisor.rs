//! Lifecycle of one execution on one backend.
//!
//! ```text
//! Created -> Preparing -> Running -> { Completed | TimedOut | Killed }
//!                \-> LaunchFailed
//! ```
//!
//! Whatever the terminal state, the backend handle is disposed and the
//! workspace torn down before `supervise` returns. Launch failures come back
//! as [`LaunchError`] so the selector can fall back; everything after a
//! successful launch is a [`CodeExecutionResult`].

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::backend::{IsolationBackend, LiveExecution, ProcessExit, SandboxHandle};
use crate::config::Config;
use crate::error::{CleanupWarning, LaunchError};
use crate::limits::{classify_breach, EnforceableLimits, LimitKind, ResourceLimiter};
use crate::output::{capture_until, CapturedStream};
use crate::types::{BackendKind, CodeExecutionRequest, CodeExecutionResult, ExecutionStatus};
use crate::workspace::IsolatedWorkspace;

/// Supervisor states. Only used for tracing transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Created,
    Preparing,
    Running,
    Completed,
    TimedOut,
    Killed,
    LaunchFailed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Preparing => "preparing",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::TimedOut => "timed_out",
            Self::Killed => "killed",
            Self::LaunchFailed => "launch_failed",
        };
        f.write_str(name)
    }
}

/// Why the running phase ended.
enum Ended {
    Exited(io::Result<ProcessExit>),
    TimedOut,
    Cancelled,
}

/// Knobs shared by every supervised execution.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Parent of per-execution workspaces.
    pub workspace_root: PathBuf,
    /// Bytes kept per output stream.
    pub output_cap: usize,
    /// Grace between graceful and forced termination.
    pub termination_grace: Duration,
    /// How long to keep reading pipes after the execution unit is gone.
    pub drain_timeout: Duration,
}

impl SupervisorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            workspace_root: config.workspace_root.clone(),
            output_cap: config.output_cap_bytes,
            termination_grace: config.termination_grace(),
            drain_timeout: config.drain_timeout(),
        }
    }
}

/// Runs a request on a given backend and always cleans up after it.
#[derive(Debug, Clone)]
pub struct ExecutionSupervisor {
    limiter: ResourceLimiter,
    settings: SupervisorSettings,
}

impl ExecutionSupervisor {
    pub const fn new(limiter: ResourceLimiter, settings: SupervisorSettings) -> Self {
        Self { limiter, settings }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.limiter(), SupervisorSettings::from_config(config))
    }

    pub const fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Execute `request` on `backend`.
    ///
    /// Returns `Err` only if the launch failed, in which case nothing ran
    /// and the caller may try another backend.
    #[instrument(skip_all, fields(execution_id = %execution_id, backend = %backend.kind()))]
    pub async fn supervise(
        &self,
        backend: &dyn IsolationBackend,
        request: &CodeExecutionRequest,
        execution_id: Uuid,
    ) -> Result<CodeExecutionResult, LaunchError> {
        let started = Instant::now();
        let kind = backend.kind();
        let mut state = State::Created;
        transition(&mut state, State::Preparing);

        let limits = self
            .limiter
            .build(&request.limits, kind)
            .inspect_err(|_| transition(&mut state, State::LaunchFailed))?;

        let mut workspace = match self.prepare_workspace(request, execution_id, kind) {
            Ok(workspace) => workspace,
            Err(e) => {
                transition(&mut state, State::LaunchFailed);
                return Err(e);
            }
        };

        let mut handle = match backend.prepare(&workspace, &limits).await {
            Ok(handle) => handle,
            Err(e) => {
                transition(&mut state, State::LaunchFailed);
                log_warnings(workspace.teardown().into_iter().collect());
                return Err(e);
            }
        };

        let live = match handle.run(&request.code, request.interpreter).await {
            Ok(live) => live,
            Err(e) => {
                transition(&mut state, State::LaunchFailed);
                let mut warnings = handle.dispose().await;
                warnings.extend(workspace.teardown());
                log_warnings(warnings);
                return Err(e);
            }
        };

        transition(&mut state, State::Running);
        let (ended, stdout, stderr) = self
            .run_to_end(handle.as_mut(), live, request, &limits)
            .await;

        let mut warnings = Vec::new();
        let status = match ended {
            Ended::Exited(Ok(exit)) => {
                match classify_breach(kind, &exit, &limits, &stderr.bytes, handle.terminated()) {
                    Some(limit) => ExecutionStatus::KilledByLimit { limit },
                    None => exit_status(exit),
                }
            }
            Ended::Exited(Err(e)) => {
                warnings.push(CleanupWarning::new(
                    Some(kind),
                    format!("failed to collect exit status: {e}"),
                ));
                ExecutionStatus::Exited { code: -1 }
            }
            Ended::TimedOut if limits.wall_clock_enforces_cpu => ExecutionStatus::KilledByLimit {
                limit: LimitKind::CpuTime,
            },
            Ended::TimedOut => ExecutionStatus::TimedOut,
            Ended::Cancelled => ExecutionStatus::Cancelled,
        };
        transition(
            &mut state,
            match &status {
                ExecutionStatus::TimedOut => State::TimedOut,
                ExecutionStatus::KilledByLimit { .. } | ExecutionStatus::Cancelled => State::Killed,
                _ => State::Completed,
            },
        );

        warnings.extend(handle.dispose().await);
        drop(handle);
        warnings.extend(workspace.teardown());
        for warning in &warnings {
            warn!(message = %warning.message, "Cleanup warning");
        }

        let duration = started.elapsed();
        info!(
            state = %state,
            exit_code = ?status_code(&status),
            duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            "Execution finished"
        );

        Ok(CodeExecutionResult {
            execution_id,
            stdout: stdout.bytes,
            stderr: stderr.bytes,
            stdout_truncated: stdout.truncated,
            stderr_truncated: stderr.truncated,
            status,
            duration,
            backend: Some(kind),
            skipped: Vec::new(),
            warnings,
        })
    }

    fn prepare_workspace(
        &self,
        request: &CodeExecutionRequest,
        execution_id: Uuid,
        kind: BackendKind,
    ) -> Result<IsolatedWorkspace, LaunchError> {
        let workspace = IsolatedWorkspace::create(&self.settings.workspace_root, execution_id)
            .map_err(|e| LaunchError::unavailable(kind, format!("workspace: {e}")))?;
        workspace
            .materialize(&request.files)
            .and_then(|()| workspace.write_entrypoint(request.interpreter, &request.code))
            .map_err(|e| LaunchError::unavailable(kind, format!("workspace: {e}")))?;
        Ok(workspace)
    }

    /// Race exit, deadline and cancellation while capturing output.
    async fn run_to_end(
        &self,
        handle: &mut dyn SandboxHandle,
        live: LiveExecution,
        request: &CodeExecutionRequest,
        limits: &EnforceableLimits,
    ) -> (Ended, CapturedStream, CapturedStream) {
        let LiveExecution {
            stdin,
            stdout,
            stderr,
            mut exit,
        } = live;

        let stop_draining = CancellationToken::new();
        let stdout_task = spawn_capture(stdout, self.settings.output_cap, &stop_draining);
        let stderr_task = spawn_capture(stderr, self.settings.output_cap, &stop_draining);

        if let Some(mut pipe) = stdin {
            let input = request.stdin.clone();
            tokio::spawn(async move {
                if let Some(input) = input {
                    if let Err(e) = pipe.write_all(&input).await {
                        debug!(error = %e, "Child stopped reading stdin");
                    }
                }
                let _ = pipe.shutdown().await;
            });
        }

        let ended = tokio::select! {
            result = &mut exit => Ended::Exited(result),
            () = tokio::time::sleep(limits.wall_timeout) => Ended::TimedOut,
            () = request.cancellation.cancelled() => Ended::Cancelled,
        };

        if !matches!(ended, Ended::Exited(_)) {
            debug!(timed_out = matches!(ended, Ended::TimedOut), "Terminating execution");
            handle.terminate(self.settings.termination_grace).await;
            let settle = self.settings.termination_grace + self.settings.drain_timeout;
            if tokio::time::timeout(settle, &mut exit).await.is_err() {
                warn!("Execution unit did not report exit after termination");
            }
        }

        // Descendants may still hold the pipes open.
        let stopper = {
            let token = stop_draining.clone();
            let limit = self.settings.drain_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                token.cancel();
            })
        };
        let (stdout, stderr) = tokio::join!(stdout_task, stderr_task);
        stopper.abort();

        (ended, stdout.unwrap_or_default(), stderr.unwrap_or_default())
    }
}

fn spawn_capture<R>(reader: R, cap: usize, stop: &CancellationToken) -> JoinHandle<CapturedStream>
where
    R: tokio::io::AsyncRead + Send + Unpin + 'static,
{
    let stop = stop.clone();
    tokio::spawn(async move { capture_until(reader, cap, async move { stop.cancelled().await }).await })
}

fn transition(state: &mut State, next: State) {
    debug!(from = %state, to = %next, "Supervisor transition");
    *state = next;
}

fn exit_status(exit: ProcessExit) -> ExecutionStatus {
    match (exit.code, exit.signal) {
        (Some(code), _) => ExecutionStatus::Exited { code },
        (None, Some(signal)) => ExecutionStatus::Signaled { signal },
        (None, None) => ExecutionStatus::Exited { code: -1 },
    }
}

const fn status_code(status: &ExecutionStatus) -> Option<i32> {
    match status {
        ExecutionStatus::Exited { code } => Some(*code),
        _ => None,
    }
}

fn log_warnings(warnings: Vec<CleanupWarning>) {
    for warning in warnings {
        warn!(message = %warning.message, "Cleanup warning after failed launch");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use super::*;
    use crate::backend::testing::{Script, ScriptedBackend};
    use crate::backend::UnrestrictedBackend;
    use crate::config::InterpretersConfig;
    use crate::limits::ResourceLimitSet;
    use crate::types::{BackendKind, InterpreterKind, TerminalState};

    fn supervisor(root: &std::path::Path) -> ExecutionSupervisor {
        ExecutionSupervisor::new(
            ResourceLimiter::new(ResourceLimitSet::default(), None),
            SupervisorSettings {
                workspace_root: root.to_path_buf(),
                output_cap: 1024,
                termination_grace: Duration::from_millis(200),
                drain_timeout: Duration::from_millis(200),
            },
        )
    }

    fn unrestricted() -> UnrestrictedBackend {
        UnrestrictedBackend::new(InterpretersConfig::default())
    }

    fn workspace_count(root: &std::path::Path) -> usize {
        std::fs::read_dir(root).map(Iterator::count).unwrap_or(0)
    }

    #[tokio::test]
    async fn completed_run_reports_output_and_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let request = CodeExecutionRequest::new(InterpreterKind::Shell, "cat input.txt; echo err >&2; exit 3")
            .with_file("input.txt", "hello\n")
            .with_timeout(Duration::from_secs(5));

        let result = supervisor(root.path())
            .supervise(&unrestricted(), &request, Uuid::new_v4())
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Exited { code: 3 });
        assert_eq!(result.stdout, b"hello\n");
        assert_eq!(result.stderr, b"err\n");
        assert_eq!(result.backend, Some(BackendKind::Unrestricted));
        assert!(result.warnings.is_empty());
        assert_eq!(workspace_count(root.path()), 0);
    }

    #[tokio::test]
    async fn sleep_past_deadline_times_out_promptly() {
        let root = tempfile::tempdir().unwrap();
        let request = CodeExecutionRequest::new(InterpreterKind::Shell, "sleep 10")
            .with_timeout(Duration::from_secs(1));

        let result = supervisor(root.path())
            .supervise(&unrestricted(), &request, Uuid::new_v4())
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::TimedOut);
        assert_eq!(result.terminal_state(), TerminalState::TimedOut);
        assert!(result.duration >= Duration::from_secs(1));
        assert!(result.duration < Duration::from_secs(2));
        assert_eq!(workspace_count(root.path()), 0);
    }

    #[tokio::test]
    async fn cancellation_kills_execution() {
        let root = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        let request = CodeExecutionRequest::new(InterpreterKind::Shell, "sleep 10")
            .with_timeout(Duration::from_secs(10))
            .with_cancellation(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            token.cancel();
        });
        let result = supervisor(root.path())
            .supervise(&unrestricted(), &request, Uuid::new_v4())
            .await
            .unwrap();
        canceller.await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Cancelled);
        assert_eq!(result.terminal_state(), TerminalState::Killed);
        assert!(result.duration < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn output_is_capped_and_flagged() {
        let root = tempfile::tempdir().unwrap();
        let request = CodeExecutionRequest::new(
            InterpreterKind::Shell,
            "i=0; while [ $i -lt 200 ]; do echo 0123456789; i=$((i+1)); done",
        )
        .with_timeout(Duration::from_secs(5));

        let result = supervisor(root.path())
            .supervise(&unrestricted(), &request, Uuid::new_v4())
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Exited { code: 0 });
        assert_eq!(result.stdout.len(), 1024);
        assert!(result.stdout_truncated);
        assert!(!result.stderr_truncated);
    }

    #[tokio::test]
    async fn stdin_is_delivered_then_closed() {
        let root = tempfile::tempdir().unwrap();
        let request = CodeExecutionRequest::new(InterpreterKind::Shell, "cat")
            .with_stdin("piped\n")
            .with_timeout(Duration::from_secs(5));

        let result = supervisor(root.path())
            .supervise(&unrestricted(), &request, Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(result.stdout_lossy(), "piped\n");
    }

    #[tokio::test]
    async fn background_children_do_not_stall_the_result() {
        let root = tempfile::tempdir().unwrap();
        let request = CodeExecutionRequest::new(InterpreterKind::Shell, "sleep 30 & echo started")
            .with_timeout(Duration::from_secs(5));

        let started = Instant::now();
        let result = supervisor(root.path())
            .supervise(&unrestricted(), &request, Uuid::new_v4())
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Exited { code: 0 });
        assert_eq!(result.stdout_lossy(), "started\n");
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn prepare_failure_is_a_launch_error_and_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let backend = ScriptedBackend::new(BackendKind::NamespaceSandbox, Script::PrepareFails("denied"));
        let request = CodeExecutionRequest::new(InterpreterKind::Shell, "true");

        let err = supervisor(root.path())
            .supervise(&backend, &request, Uuid::new_v4())
            .await
            .unwrap_err();

        assert!(matches!(err, LaunchError::BackendUnavailable { .. }));
        assert_eq!(backend.counters.runs.load(Ordering::SeqCst), 0);
        assert_eq!(workspace_count(root.path()), 0);
    }

    #[tokio::test]
    async fn run_failure_disposes_handle() {
        let root = tempfile::tempdir().unwrap();
        let backend = ScriptedBackend::new(BackendKind::Container, Script::RunFails("exec failed"));
        let counters = Arc::clone(&backend.counters);
        let request = CodeExecutionRequest::new(InterpreterKind::Shell, "true");

        let err = supervisor(root.path())
            .supervise(&backend, &request, Uuid::new_v4())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("exec failed"));
        assert_eq!(counters.disposes.load(Ordering::SeqCst), 1);
        assert_eq!(workspace_count(root.path()), 0);
    }

    #[tokio::test]
    async fn unsupported_limit_fails_before_prepare() {
        let root = tempfile::tempdir().unwrap();
        let backend = ScriptedBackend::new(BackendKind::Unrestricted, Script::Hangs);
        let request = CodeExecutionRequest::new(InterpreterKind::Shell, "true").with_limits(ResourceLimitSet {
            memory_bytes: Some(64 * 1024 * 1024),
            ..ResourceLimitSet::default()
        });

        let err = supervisor(root.path())
            .supervise(&backend, &request, Uuid::new_v4())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            LaunchError::ResourceLimitUnsupported {
                limit: LimitKind::Memory,
                ..
            }
        ));
        assert_eq!(backend.counters.prepares.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn timeout_terminates_then_disposes_once() {
        let root = tempfile::tempdir().unwrap();
        let backend = ScriptedBackend::new(BackendKind::Container, Script::Hangs);
        let request = CodeExecutionRequest::new(InterpreterKind::Shell, "loop")
            .with_timeout(Duration::from_millis(100));

        let result = supervisor(root.path())
            .supervise(&backend, &request, Uuid::new_v4())
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::TimedOut);
        assert_eq!(backend.counters.terminates.load(Ordering::SeqCst), 1);
        assert_eq!(backend.counters.disposes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cpu_ceiling_on_wall_clock_reports_limit() {
        let root = tempfile::tempdir().unwrap();
        let backend = ScriptedBackend::new(BackendKind::RestrictedInterpreter, Script::Hangs);
        let request = CodeExecutionRequest::new(InterpreterKind::Python, "while True: pass").with_limits(
            ResourceLimitSet {
                cpu_seconds: Some(1),
                wall_timeout: Some(Duration::from_secs(10)),
                ..ResourceLimitSet::default()
            },
        );

        let result = supervisor(root.path())
            .supervise(&backend, &request, Uuid::new_v4())
            .await
            .unwrap();

        assert_eq!(
            result.status,
            ExecutionStatus::KilledByLimit {
                limit: LimitKind::CpuTime
            }
        );
        assert!(result.duration < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn high_exit_code_outside_container_is_a_plain_exit() {
        let root = tempfile::tempdir().unwrap();
        let backend = ScriptedBackend::new(
            BackendKind::NamespaceSandbox,
            Script::Exits { code: 137, stdout: "" },
        );
        let request = CodeExecutionRequest::new(InterpreterKind::Shell, "exit 137").with_limits(
            ResourceLimitSet {
                memory_bytes: Some(64 * 1024 * 1024),
                ..ResourceLimitSet::default()
            },
        );

        let result = supervisor(root.path())
            .supervise(&backend, &request, Uuid::new_v4())
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Exited { code: 137 });
    }
}
