//! Error taxonomy for launching and tearing down executions.
//!
//! Only launch-time failures are errors here. Runtime outcomes (timeouts,
//! limit kills, non-zero exits) are reported through
//! [`ExecutionStatus`](crate::types::ExecutionStatus) and never retried.

use serde::Serialize;
use thiserror::Error;

use crate::limits::LimitKind;
use crate::types::BackendKind;

/// A backend could not launch the request. Triggers fallback.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("{backend} unavailable: {reason}")]
    BackendUnavailable { backend: BackendKind, reason: String },

    #[error("{backend} cannot enforce the requested {limit} limit")]
    ResourceLimitUnsupported { backend: BackendKind, limit: LimitKind },
}

impl LaunchError {
    pub fn unavailable(backend: BackendKind, reason: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            backend,
            reason: reason.into(),
        }
    }

    /// Wrap an `anyhow` chain, keeping every cause in the reason.
    pub fn from_anyhow(backend: BackendKind, err: &anyhow::Error) -> Self {
        Self::unavailable(backend, format!("{err:#}"))
    }

    pub const fn backend(&self) -> BackendKind {
        match self {
            Self::BackendUnavailable { backend, .. }
            | Self::ResourceLimitUnsupported { backend, .. } => *backend,
        }
    }
}

/// A tier the selector skipped for one request, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchAttempt {
    pub backend: BackendKind,
    pub reason: String,
}

impl From<&LaunchError> for LaunchAttempt {
    fn from(err: &LaunchError) -> Self {
        Self {
            backend: err.backend(),
            reason: err.to_string(),
        }
    }
}

/// Non-fatal problem during teardown. Never changes the exit status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupWarning {
    pub backend: Option<BackendKind>,
    pub message: String,
}

impl CleanupWarning {
    pub fn new(backend: Option<BackendKind>, message: impl Into<String>) -> Self {
        Self {
            backend,
            message: message.into(),
        }
    }
}

/// Failures while materializing a workspace.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("workspace path '{0}' escapes the workspace root")]
    PathEscape(String),

    #[error("workspace I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
