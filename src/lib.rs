//! tiered-sandbox library
//!
//! Runs untrusted Python or shell code on the strongest isolation tier the
//! host offers, falling back tier by tier when one cannot launch:
//! - Container (docker-compatible runtime)
//! - Namespace sandbox (unshare + chroot + rlimits)
//! - Restricted embedded interpreter in a forked worker (Python only)
//! - Unrestricted host process (last resort)
//!
//! [`FallbackSelector::execute`] is the single inbound entry point.

pub mod backend;
pub mod config;
pub mod error;
pub mod limits;
pub mod mcp;
pub mod output;
pub mod probe;
pub mod process;
pub mod selector;
pub mod supervisor;
pub mod types;
pub mod workspace;

pub use error::{CleanupWarning, LaunchAttempt, LaunchError};
pub use limits::{LimitKind, ResourceLimitSet};
pub use probe::BackendCapability;
pub use selector::FallbackSelector;
pub use types::{
    BackendKind, CodeExecutionRequest, CodeExecutionResult, ExecutionStatus, InterpreterKind,
    TerminalState,
};
