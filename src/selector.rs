//! Strength-ordered fallback across isolation tiers.
//!
//! The selector walks the probed tiers strongest first. Tiers that are
//! unavailable, or cannot run the request's interpreter, are skipped and
//! recorded. A tier that fails to *launch* is recorded and the walk moves on;
//! once something launches, its result is final whatever the code did.

use std::sync::Arc;

use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::backend::{
    ContainerBackend, IsolationBackend, NamespaceBackend, RestrictedBackend, UnrestrictedBackend,
};
use crate::config::Config;
use crate::error::LaunchAttempt;
use crate::probe::{BackendCapability, CapabilityProbe};
use crate::supervisor::ExecutionSupervisor;
use crate::types::{BackendKind, CodeExecutionRequest, CodeExecutionResult};

/// Entry point for executing requests.
pub struct FallbackSelector {
    probe: CapabilityProbe,
    supervisor: ExecutionSupervisor,
}

impl FallbackSelector {
    pub const fn new(probe: CapabilityProbe, supervisor: ExecutionSupervisor) -> Self {
        Self { probe, supervisor }
    }

    /// Build every enabled tier from `config`.
    pub fn from_config(config: &Config) -> Self {
        let mut backends: Vec<Arc<dyn IsolationBackend>> = Vec::new();
        for kind in BackendKind::ALL {
            if !config.is_enabled(kind) {
                info!(backend = %kind, "Backend disabled by configuration");
                continue;
            }
            let backend: Arc<dyn IsolationBackend> = match kind {
                BackendKind::Container => Arc::new(ContainerBackend::new(config.container.clone())),
                BackendKind::NamespaceSandbox => Arc::new(NamespaceBackend::new(
                    config.namespace.clone(),
                    config.interpreters.clone(),
                )),
                BackendKind::RestrictedInterpreter => Arc::new(RestrictedBackend::new(
                    config.restricted.clone(),
                    config.output_cap_bytes,
                )),
                BackendKind::Unrestricted => {
                    Arc::new(UnrestrictedBackend::new(config.interpreters.clone()))
                }
            };
            backends.push(backend);
        }
        Self::new(
            CapabilityProbe::new(backends, config.reprobe_interval()),
            ExecutionSupervisor::from_config(config),
        )
    }

    pub const fn probe(&self) -> &CapabilityProbe {
        &self.probe
    }

    /// Cached host capabilities, strongest first.
    pub async fn capabilities(&self) -> Arc<[BackendCapability]> {
        self.probe.capabilities().await
    }

    /// Run `request` on the strongest tier that launches.
    pub async fn execute(&self, request: CodeExecutionRequest) -> CodeExecutionResult {
        self.select_and_run(&request).await
    }

    /// Walk the tiers for `request`. Never fails: when nothing launches the
    /// result carries `NoBackendAvailable` and every skip reason.
    #[instrument(skip_all, fields(interpreter = %request.interpreter))]
    pub async fn select_and_run(&self, request: &CodeExecutionRequest) -> CodeExecutionResult {
        let execution_id = Uuid::new_v4();
        let capabilities = self.probe.capabilities().await;
        let mut skipped = Vec::new();

        for (backend, capability) in self.probe.backends().iter().zip(capabilities.iter()) {
            let kind = backend.kind();
            if !backend.supports(request.interpreter) {
                skipped.push(LaunchAttempt {
                    backend: kind,
                    reason: format!("{kind} does not run {} code", request.interpreter),
                });
                continue;
            }
            if !capability.available {
                skipped.push(LaunchAttempt {
                    backend: kind,
                    reason: capability
                        .reason
                        .clone()
                        .unwrap_or_else(|| format!("{kind} unavailable")),
                });
                continue;
            }

            match self
                .supervisor
                .supervise(backend.as_ref(), request, execution_id)
                .await
            {
                Ok(mut result) => {
                    if kind == BackendKind::Unrestricted {
                        warn!(%execution_id, "Executed without isolation");
                    }
                    result.skipped = skipped;
                    return result;
                }
                Err(e) => {
                    warn!(%execution_id, backend = %kind, error = %e, "Launch failed, falling back");
                    skipped.push(LaunchAttempt::from(&e));
                }
            }
        }

        warn!(%execution_id, attempts = skipped.len(), "No backend available");
        CodeExecutionResult::no_backend_available(execution_id, skipped)
    }
}
