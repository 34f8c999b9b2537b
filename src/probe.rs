//! Host capability detection with a process-wide cache.
//!
//! Every configured backend is probed concurrently. A failing probe never
//! surfaces as an error; it marks that backend unavailable with the failure
//! text as the reason. Results are listed strongest tier first and reused
//! until invalidated or, when configured, until the re-probe interval passes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

use crate::backend::IsolationBackend;
use crate::types::BackendKind;

/// Whether one tier is usable on this host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendCapability {
    pub backend: BackendKind,
    pub available: bool,
    /// Why the tier is unusable. `None` when available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl BackendCapability {
    pub const fn available(backend: BackendKind) -> Self {
        Self {
            backend,
            available: true,
            reason: None,
        }
    }

    pub fn unavailable(backend: BackendKind, reason: impl Into<String>) -> Self {
        Self {
            backend,
            available: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug)]
struct Snapshot {
    taken: Instant,
    capabilities: Arc<[BackendCapability]>,
}

/// Probes the configured backends and caches the outcome.
pub struct CapabilityProbe {
    backends: Vec<Arc<dyn IsolationBackend>>,
    reprobe_interval: Option<Duration>,
    cache: RwLock<Option<Snapshot>>,
}

impl CapabilityProbe {
    /// `backends` may come in any order; they are kept strongest first.
    pub fn new(
        mut backends: Vec<Arc<dyn IsolationBackend>>,
        reprobe_interval: Option<Duration>,
    ) -> Self {
        backends.sort_by_key(|backend| backend.kind().strength_rank());
        Self {
            backends,
            reprobe_interval,
            cache: RwLock::new(None),
        }
    }

    /// Configured backends, strongest first.
    pub fn backends(&self) -> &[Arc<dyn IsolationBackend>] {
        &self.backends
    }

    /// Current capabilities, probing only when the cache is empty or stale.
    pub async fn capabilities(&self) -> Arc<[BackendCapability]> {
        {
            let cache = self.cache.read().await;
            if let Some(snapshot) = cache.as_ref().filter(|s| self.is_fresh(s)) {
                return Arc::clone(&snapshot.capabilities);
            }
        }

        let mut cache = self.cache.write().await;
        // Another caller may have probed while we waited for the lock.
        if let Some(snapshot) = cache.as_ref().filter(|s| self.is_fresh(s)) {
            return Arc::clone(&snapshot.capabilities);
        }
        let capabilities: Arc<[BackendCapability]> = self.probe_all().await.into();
        *cache = Some(Snapshot {
            taken: Instant::now(),
            capabilities: Arc::clone(&capabilities),
        });
        capabilities
    }

    /// Drop the cached result so the next call probes again.
    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
        debug!("Capability cache invalidated");
    }

    fn is_fresh(&self, snapshot: &Snapshot) -> bool {
        self.reprobe_interval
            .map_or(true, |interval| snapshot.taken.elapsed() < interval)
    }

    #[instrument(skip(self))]
    async fn probe_all(&self) -> Vec<BackendCapability> {
        let probes = self.backends.iter().map(|backend| async move {
            let kind = backend.kind();
            match backend.probe().await {
                Ok(()) => BackendCapability::available(kind),
                Err(e) => BackendCapability::unavailable(kind, format!("{e:#}")),
            }
        });
        let capabilities = join_all(probes).await;
        for capability in &capabilities {
            info!(
                backend = %capability.backend,
                available = capability.available,
                reason = capability.reason.as_deref().unwrap_or(""),
                "Probed backend"
            );
        }
        capabilities
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::backend::testing::{Script, ScriptedBackend};

    fn scripted(kind: BackendKind, script: Script) -> (Arc<dyn IsolationBackend>, Arc<crate::backend::testing::Counters>) {
        let backend = ScriptedBackend::new(kind, script);
        let counters = Arc::clone(&backend.counters);
        (Arc::new(backend), counters)
    }

    #[tokio::test]
    async fn orders_strongest_first_and_records_reasons() {
        let (unrestricted, _) = scripted(BackendKind::Unrestricted, Script::Hangs);
        let (container, _) = scripted(BackendKind::Container, Script::Unavailable("no daemon"));
        let (namespace, _) = scripted(BackendKind::NamespaceSandbox, Script::Hangs);

        let probe = CapabilityProbe::new(vec![unrestricted, container, namespace], None);
        let caps = probe.capabilities().await;

        let kinds: Vec<_> = caps.iter().map(|c| c.backend).collect();
        assert_eq!(
            kinds,
            [
                BackendKind::Container,
                BackendKind::NamespaceSandbox,
                BackendKind::Unrestricted
            ]
        );
        assert!(!caps[0].available);
        assert_eq!(caps[0].reason.as_deref(), Some("no daemon"));
        assert!(caps[1].available);
        assert!(caps[1].reason.is_none());
    }

    #[tokio::test]
    async fn results_are_cached_until_invalidated() {
        let (backend, counters) = scripted(BackendKind::Unrestricted, Script::Hangs);
        let probe = CapabilityProbe::new(vec![backend], None);

        probe.capabilities().await;
        probe.capabilities().await;
        assert_eq!(counters.probes.load(Ordering::SeqCst), 1);

        probe.invalidate().await;
        probe.capabilities().await;
        assert_eq!(counters.probes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stale_results_are_reprobed() {
        let (backend, counters) = scripted(BackendKind::Unrestricted, Script::Hangs);
        let probe = CapabilityProbe::new(vec![backend], Some(Duration::from_millis(20)));

        probe.capabilities().await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        probe.capabilities().await;
        assert_eq!(counters.probes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_readers_share_one_probe() {
        let (backend, counters) = scripted(BackendKind::Unrestricted, Script::Hangs);
        let probe = Arc::new(CapabilityProbe::new(vec![backend], None));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let probe = Arc::clone(&probe);
                tokio::spawn(async move { probe.capabilities().await })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap().len(), 1);
        }
        assert_eq!(counters.probes.load(Ordering::SeqCst), 1);
    }
}
