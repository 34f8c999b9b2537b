//! Last-resort tier: a plain host child process.
//!
//! There is no isolation here beyond a cleared environment, a dedicated
//! process group and the workspace as working directory. Only the wall-clock
//! deadline is enforced.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument};

use super::{sandbox_env, spawn_piped, IsolationBackend, LiveExecution, SandboxHandle, SpawnedGroup};
use crate::config::InterpretersConfig;
use crate::error::{CleanupWarning, LaunchError};
use crate::limits::EnforceableLimits;
use crate::types::{BackendKind, InterpreterKind};
use crate::workspace::{entrypoint_name, IsolatedWorkspace};

/// Runs code as an ordinary child of the host.
#[derive(Debug, Clone)]
pub struct UnrestrictedBackend {
    interpreters: InterpretersConfig,
}

impl UnrestrictedBackend {
    pub const fn new(interpreters: InterpretersConfig) -> Self {
        Self { interpreters }
    }
}

#[async_trait]
impl IsolationBackend for UnrestrictedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Unrestricted
    }

    async fn probe(&self) -> anyhow::Result<()> {
        Ok(())
    }

    #[instrument(skip_all, fields(backend = "unrestricted", execution_id = %workspace.id()))]
    async fn prepare(
        &self,
        workspace: &IsolatedWorkspace,
        _limits: &EnforceableLimits,
    ) -> Result<Box<dyn SandboxHandle>, LaunchError> {
        Ok(Box::new(UnrestrictedHandle {
            workspace: workspace.path().to_path_buf(),
            interpreters: self.interpreters.clone(),
            spawned: None,
            terminated: false,
            disposed: false,
        }))
    }
}

struct UnrestrictedHandle {
    workspace: PathBuf,
    interpreters: InterpretersConfig,
    spawned: Option<SpawnedGroup>,
    terminated: bool,
    disposed: bool,
}

#[async_trait]
impl SandboxHandle for UnrestrictedHandle {
    async fn run(
        &mut self,
        _code: &str,
        interpreter: InterpreterKind,
    ) -> Result<LiveExecution, LaunchError> {
        let program = self.interpreters.path(interpreter);
        let entry = self.workspace.join(entrypoint_name(interpreter));
        let home = self.workspace.to_string_lossy();

        let mut cmd = Command::new(program);
        cmd.arg(&entry)
            .current_dir(&self.workspace)
            .env_clear()
            .envs(sandbox_env(&home))
            .process_group(0);

        debug!(program = %program.display(), "Spawning unrestricted child");
        let (live, spawned) = spawn_piped(cmd, BackendKind::Unrestricted)?;
        self.spawned = Some(spawned);
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
        // Background jobs may outlive the entrypoint.
        if let Some(spawned) = &self.spawned {
            spawned.group.reap_stragglers();
        }
        Vec::new()
    }
}
