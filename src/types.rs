//! Request and result types shared by every tier.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize, Serializer};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{CleanupWarning, LaunchAttempt};
use crate::limits::{LimitKind, ResourceLimitSet};

/// Language the submitted code is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterpreterKind {
    /// POSIX shell script.
    Shell,
    /// Python 3 script.
    Python,
}

impl InterpreterKind {
    /// File extension used for the materialized entrypoint.
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Shell => "sh",
            Self::Python => "py",
        }
    }
}

impl fmt::Display for InterpreterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shell => f.write_str("shell"),
            Self::Python => f.write_str("python"),
        }
    }
}

/// Isolation tiers, declared strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// External container runtime.
    Container,
    /// Linux namespaces + chroot + rlimits.
    NamespaceSandbox,
    /// Embedded interpreter with a reduced builtin surface, in a forked worker.
    RestrictedInterpreter,
    /// Plain host child process. Last resort.
    Unrestricted,
}

impl BackendKind {
    /// Every tier in fallback order.
    pub const ALL: [Self; 4] = [
        Self::Container,
        Self::NamespaceSandbox,
        Self::RestrictedInterpreter,
        Self::Unrestricted,
    ];

    /// Isolation strength rank (lower is stronger).
    pub const fn strength_rank(self) -> u8 {
        match self {
            Self::Container => 0,
            Self::NamespaceSandbox => 1,
            Self::RestrictedInterpreter => 2,
            Self::Unrestricted => 3,
        }
    }

    /// Stable identifier used in logs and config.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::NamespaceSandbox => "namespace_sandbox",
            Self::RestrictedInterpreter => "restricted_interpreter",
            Self::Unrestricted => "unrestricted",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of code to run in isolation.
#[derive(Debug, Clone)]
pub struct CodeExecutionRequest {
    /// Source text of the script.
    pub code: String,
    /// Which interpreter runs `code`.
    pub interpreter: InterpreterKind,
    /// Files materialized into the workspace before execution, keyed by
    /// workspace-relative path.
    pub files: BTreeMap<String, Vec<u8>>,
    /// Requested ceilings. Unset fields fall back to backend defaults.
    pub limits: ResourceLimitSet,
    /// Bytes written to the child's stdin before it is closed.
    pub stdin: Option<Vec<u8>>,
    /// Caller-owned cancellation signal.
    pub cancellation: CancellationToken,
}

impl CodeExecutionRequest {
    /// Create a request with no files, no stdin and no explicit limits.
    pub fn new(interpreter: InterpreterKind, code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            interpreter,
            files: BTreeMap::new(),
            limits: ResourceLimitSet::default(),
            stdin: None,
            cancellation: CancellationToken::new(),
        }
    }

    /// Set the wall-clock timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.limits.wall_timeout = Some(timeout);
        self
    }

    /// Replace the requested ceilings.
    #[must_use]
    pub const fn with_limits(mut self, limits: ResourceLimitSet) -> Self {
        self.limits = limits;
        self
    }

    /// Add a file to materialize in the workspace.
    #[must_use]
    pub fn with_file(mut self, path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        self.files.insert(path.into(), contents.into());
        self
    }

    /// Provide stdin bytes.
    #[must_use]
    pub fn with_stdin(mut self, stdin: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    /// Attach a caller-supplied cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }
}

/// How an execution ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// The code ran to completion and exited with `code`.
    Exited { code: i32 },
    /// The code died from a signal nobody in the sandbox stack sent.
    Signaled { signal: i32 },
    /// The wall-clock timeout expired and the execution was terminated.
    TimedOut,
    /// A resource ceiling was hit.
    KilledByLimit { limit: LimitKind },
    /// The caller's cancellation token fired.
    Cancelled,
    /// Every tier was unavailable for this request.
    NoBackendAvailable,
}

/// Coarse terminal classification. Exactly one applies to every result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalState {
    Completed,
    TimedOut,
    Killed,
    NoBackendAvailable,
}

impl ExecutionStatus {
    pub const fn terminal_state(&self) -> TerminalState {
        match self {
            Self::Exited { .. } | Self::Signaled { .. } => TerminalState::Completed,
            Self::TimedOut => TerminalState::TimedOut,
            Self::KilledByLimit { .. } | Self::Cancelled => TerminalState::Killed,
            Self::NoBackendAvailable => TerminalState::NoBackendAvailable,
        }
    }
}

/// Uniform result returned by every tier.
#[derive(Debug, Clone, Serialize)]
pub struct CodeExecutionResult {
    /// Identifier used in logs and workspace names.
    pub execution_id: Uuid,
    #[serde(serialize_with = "lossy_utf8")]
    pub stdout: Vec<u8>,
    #[serde(serialize_with = "lossy_utf8")]
    pub stderr: Vec<u8>,
    /// Output past the cap was discarded.
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub status: ExecutionStatus,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
    /// Tier that ran the code. `None` only for `NoBackendAvailable`.
    pub backend: Option<BackendKind>,
    /// Stronger tiers skipped before `backend` was chosen.
    pub skipped: Vec<LaunchAttempt>,
    /// Non-fatal cleanup problems.
    pub warnings: Vec<CleanupWarning>,
}

impl CodeExecutionResult {
    /// Result for a request no tier could launch.
    pub fn no_backend_available(execution_id: Uuid, skipped: Vec<LaunchAttempt>) -> Self {
        Self {
            execution_id,
            stdout: Vec::new(),
            stderr: Vec::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            status: ExecutionStatus::NoBackendAvailable,
            duration: Duration::ZERO,
            backend: None,
            skipped,
            warnings: Vec::new(),
        }
    }

    pub const fn terminal_state(&self) -> TerminalState {
        self.status.terminal_state()
    }

    /// Exit code when the code ran to completion.
    pub const fn exit_code(&self) -> Option<i32> {
        match self.status {
            ExecutionStatus::Exited { code } => Some(code),
            _ => None,
        }
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

fn lossy_utf8<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(bytes))
}

fn as_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}
