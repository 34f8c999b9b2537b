//! Container tier: a throwaway container driven through a docker-compatible
//! CLI.
//!
//! `prepare` creates and starts an idle container with no network, a
//! read-only root, all capabilities dropped, cgroup memory/pids limits, CPU
//! and file-size ulimits and the workspace as its only writable bind. `run`
//! execs the interpreter inside it. Stopping the container's init takes every
//! exec'd process down with it.

use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use async_trait::async_trait;
use nix::unistd::{getegid, geteuid};
use tokio::process::Command;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::{sandbox_env, spawn_piped, IsolationBackend, LiveExecution, SandboxHandle, SpawnedGroup};
use crate::config::ContainerConfig;
use crate::error::{CleanupWarning, LaunchError};
use crate::limits::EnforceableLimits;
use crate::types::{BackendKind, InterpreterKind};
use crate::workspace::{entrypoint_name, IsolatedWorkspace, GUEST_WORKSPACE};

const KIND: BackendKind = BackendKind::Container;

/// Label attached to every container this tier creates.
const LABEL: &str = "tiered-sandbox=1";

/// Throwaway containers via `docker` (or a compatible CLI).
#[derive(Debug, Clone)]
pub struct ContainerBackend {
    config: ContainerConfig,
}

impl ContainerBackend {
    pub const fn new(config: ContainerConfig) -> Self {
        Self { config }
    }

    /// Arguments for `<runtime> create`.
    fn create_args(
        &self,
        name: &str,
        workspace: &str,
        limits: &EnforceableLimits,
    ) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "create".into(),
            "--name".into(),
            name.into(),
            "--label".into(),
            LABEL.into(),
            "--network".into(),
            "none".into(),
            "--read-only".into(),
            "--cap-drop".into(),
            "ALL".into(),
            "--security-opt".into(),
            "no-new-privileges".into(),
            "--user".into(),
            format!("{}:{}", geteuid().as_raw(), getegid().as_raw()),
            "--tmpfs".into(),
            format!("/tmp:rw,nosuid,nodev,size={}m", self.config.tmpfs_mb),
            "--mount".into(),
            format!("type=bind,source={workspace},target={GUEST_WORKSPACE}"),
            "--workdir".into(),
            GUEST_WORKSPACE.into(),
        ];

        if let Some(bytes) = limits.memory_bytes {
            // Equal swap ceiling disables swap.
            args.push(format!("--memory={bytes}b"));
            args.push(format!("--memory-swap={bytes}b"));
        }
        if let Some(seconds) = limits.cpu_seconds {
            args.push("--ulimit".into());
            args.push(format!("cpu={seconds}:{}", seconds + 1));
        }
        if let Some(bytes) = limits.disk_bytes {
            args.push("--ulimit".into());
            args.push(format!("fsize={bytes}:{bytes}"));
        }
        args.push("--ulimit".into());
        args.push("core=0:0".into());
        if let Some(pids) = limits.max_processes.or(self.config.pids_limit) {
            args.push(format!("--pids-limit={pids}"));
        }
        if let Some(cpus) = self.config.cpus {
            args.push(format!("--cpus={cpus}"));
        }

        args.push(self.config.image.clone());
        args.push("sleep".into());
        args.push("infinity".into());
        args
    }

    async fn runtime(&self, args: &[&str], timeout: Duration) -> anyhow::Result<String> {
        runtime_command(&self.config.runtime, args, timeout).await
    }
}

/// Run `<runtime> <args>` and return trimmed stdout. A non-zero exit becomes
/// an error carrying stderr.
async fn runtime_command(runtime: &str, args: &[&str], timeout: Duration) -> anyhow::Result<String> {
    let mut cmd = Command::new(runtime);
    cmd.args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true);
    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .with_context(|| format!("{runtime} {} timed out", args.first().unwrap_or(&"")))?
        .with_context(|| format!("failed to run {runtime}"))?;
    if !output.status.success() {
        bail!(
            "{runtime} {} failed ({}): {}",
            args.first().unwrap_or(&""),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
}

#[async_trait]
impl IsolationBackend for ContainerBackend {
    fn kind(&self) -> BackendKind {
        KIND
    }

    #[instrument(skip(self), fields(backend = "container", runtime = %self.config.runtime))]
    async fn probe(&self) -> anyhow::Result<()> {
        let timeout = self.config.probe_timeout();
        let version = self
            .runtime(&["version", "--format", "{{.Server.Version}}"], timeout)
            .await
            .context("container runtime unreachable")?;
        self.runtime(&["image", "inspect", "--format", "{{.Id}}", &self.config.image], timeout)
            .await
            .with_context(|| format!("image {} not available locally", self.config.image))?;
        debug!(server_version = %version, image = %self.config.image, "Container runtime reachable");
        Ok(())
    }

    #[instrument(skip_all, fields(backend = "container", execution_id = %workspace.id()))]
    async fn prepare(
        &self,
        workspace: &IsolatedWorkspace,
        limits: &EnforceableLimits,
    ) -> Result<Box<dyn SandboxHandle>, LaunchError> {
        let name = format!("tiered-sandbox-{}", Uuid::new_v4().simple());
        let workspace_path = workspace.path().to_str().ok_or_else(|| {
            LaunchError::unavailable(KIND, "workspace path is not valid UTF-8")
        })?;
        let args = self.create_args(&name, workspace_path, limits);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let timeout = self.config.command_timeout();

        self.runtime(&arg_refs, timeout)
            .await
            .map_err(|e| LaunchError::from_anyhow(KIND, &e))?;

        let mut handle = ContainerHandle {
            config: self.config.clone(),
            name,
            spawned: None,
            terminated: false,
            disposed: false,
        };
        if let Err(e) = self.runtime(&["start", &handle.name], timeout).await {
            handle.dispose().await;
            return Err(LaunchError::from_anyhow(KIND, &e));
        }
        debug!(container = %handle.name, "Container started");
        Ok(Box::new(handle))
    }
}

struct ContainerHandle {
    config: ContainerConfig,
    name: String,
    spawned: Option<SpawnedGroup>,
    terminated: bool,
    disposed: bool,
}

impl ContainerHandle {
    async fn runtime(&self, args: &[&str]) -> anyhow::Result<String> {
        runtime_command(&self.config.runtime, args, self.config.command_timeout()).await
    }
}

#[async_trait]
impl SandboxHandle for ContainerHandle {
    async fn run(
        &mut self,
        _code: &str,
        interpreter: InterpreterKind,
    ) -> Result<LiveExecution, LaunchError> {
        let entry = format!("{GUEST_WORKSPACE}/{}", entrypoint_name(interpreter));
        let mut cmd = Command::new(&self.config.runtime);
        cmd.arg("exec").arg("-i").arg("--workdir").arg(GUEST_WORKSPACE);
        for (key, value) in sandbox_env(GUEST_WORKSPACE) {
            cmd.arg("--env").arg(format!("{key}={value}"));
        }
        cmd.arg(&self.name)
            .arg(self.config.interpreter(interpreter))
            .arg(entry)
            .process_group(0);

        let (live, spawned) = spawn_piped(cmd, KIND)?;
        self.spawned = Some(spawned);
        Ok(live)
    }

    async fn terminate(&mut self, grace: Duration) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        let deadline = Instant::now() + grace;

        // Signal everything except the container's init.
        if let Err(e) = runtime_command(
            &self.config.runtime,
            &["exec", &self.name, "sh", "-c", "kill -s TERM -- -1 2>/dev/null; true"],
            grace,
        )
        .await
        {
            debug!(container = %self.name, error = %e, "Graceful stop failed");
        }
        let exited = match &mut self.spawned {
            Some(spawned) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                spawned.exit_watch.wait(remaining).await
            }
            None => true,
        };
        if !exited {
            if let Err(e) = self.runtime(&["kill", &self.name]).await {
                warn!(container = %self.name, error = %e, "Failed to kill container");
            }
        }
        if let Some(spawned) = &self.spawned {
            spawned.group.reap_stragglers();
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

        let mut warnings = Vec::new();
        let first = self.runtime(&["rm", "--force", &self.name]).await;
        if let Err(first) = first {
            warn!(container = %self.name, error = %first, "Container removal failed, retrying once");
            if let Err(e) = self.runtime(&["rm", "--force", &self.name]).await {
                warnings.push(CleanupWarning::new(
                    Some(KIND),
                    format!("failed to remove container {}: {e:#}", self.name),
                ));
            }
        }
        if let Some(spawned) = &self.spawned {
            spawned.group.reap_stragglers();
        }
        warnings
    }
}

impl Drop for ContainerHandle {
    fn drop(&mut self) {
        if self.disposed {
            return;
        }
        let runtime = self.config.runtime.clone();
        let name = self.name.clone();
        std::thread::spawn(move || {
            let _ = std::process::Command::new(runtime)
                .args(["rm", "--force", &name])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
        });
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::backend::ProcessExit;

    fn limits() -> EnforceableLimits {
        EnforceableLimits {
            wall_timeout: Duration::from_secs(10),
            cpu_seconds: Some(5),
            memory_bytes: Some(64 * 1024 * 1024),
            disk_bytes: Some(1024 * 1024),
            max_processes: None,
            wall_clock_enforces_cpu: false,
        }
    }

    #[test]
    fn create_args_isolate_and_limit() {
        let backend = ContainerBackend::new(ContainerConfig::default());
        let args = backend.create_args("sbx", "/tmp/ws", &limits());
        let joined = args.join(" ");
        assert!(joined.contains("--network none"));
        assert!(joined.contains("--read-only"));
        assert!(joined.contains("--cap-drop ALL"));
        assert!(joined.contains("--memory=67108864b"));
        assert!(joined.contains("--memory-swap=67108864b"));
        assert!(joined.contains("--ulimit cpu=5:6"));
        assert!(joined.contains("--ulimit fsize=1048576:1048576"));
        assert!(joined.contains("--pids-limit=64"));
        assert!(joined.contains("type=bind,source=/tmp/ws,target=/workspace"));
        assert!(joined.ends_with("python:3.11-slim sleep infinity"));
    }

    #[test]
    fn create_args_omit_unset_limits() {
        let backend = ContainerBackend::new(ContainerConfig {
            pids_limit: None,
            ..ContainerConfig::default()
        });
        let none = EnforceableLimits {
            cpu_seconds: None,
            memory_bytes: None,
            disk_bytes: None,
            ..limits()
        };
        let joined = backend.create_args("sbx", "/tmp/ws", &none).join(" ");
        assert!(!joined.contains("--memory"));
        assert!(!joined.contains("cpu="));
        assert!(!joined.contains("fsize="));
        assert!(!joined.contains("--pids-limit"));
    }

    #[tokio::test]
    async fn probe_fails_for_missing_runtime() {
        let backend = ContainerBackend::new(ContainerConfig {
            runtime: "/nonexistent/docker".into(),
            ..ContainerConfig::default()
        });
        let err = backend.probe().await.unwrap_err();
        assert!(format!("{err:#}").contains("unreachable"));
    }

    #[tokio::test]
    async fn runs_python_in_container() {
        let backend = ContainerBackend::new(ContainerConfig::default());
        if backend.probe().await.is_err() {
            return;
        }
        let root = tempfile::tempdir().unwrap();
        let ws = IsolatedWorkspace::create(root.path(), Uuid::new_v4()).unwrap();
        let code = "print(1 + 1)";
        ws.write_entrypoint(InterpreterKind::Python, code).unwrap();

        let mut handle = backend.prepare(&ws, &limits()).await.unwrap();
        let mut live = handle.run(code, InterpreterKind::Python).await.unwrap();
        drop(live.stdin.take());
        let mut out = String::new();
        live.stdout.read_to_string(&mut out).await.unwrap();
        assert_eq!(live.exit.await.unwrap(), ProcessExit::exited(0));
        assert_eq!(out, "2\n");

        assert!(handle.dispose().await.is_empty());
        assert!(handle.dispose().await.is_empty());
    }

    /// A runtime whose `exec -i` never returns and whose plain `exec` hangs
    /// for seconds.
    fn stalling_runtime(dir: &std::path::Path) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-runtime");
        std::fs::write(
            &path,
            "#!/bin/sh\ncase \"$1\" in\n  exec) if [ \"$2\" = \"-i\" ]; then exec sleep 30; fi; exec sleep 5 ;;\n  *) exit 0 ;;\nesac\n",
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        // Another test forking while the file was open leaves it busy briefly.
        for _ in 0..20 {
            if std::process::Command::new(&path).arg("version").status().is_ok() {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        path.to_str().unwrap().to_owned()
    }

    #[tokio::test]
    async fn terminate_is_bounded_by_grace_not_command_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ContainerBackend::new(ContainerConfig {
            runtime: stalling_runtime(dir.path()),
            command_timeout_seconds: 30,
            ..ContainerConfig::default()
        });
        let root = tempfile::tempdir().unwrap();
        let ws = IsolatedWorkspace::create(root.path(), Uuid::new_v4()).unwrap();
        ws.write_entrypoint(InterpreterKind::Shell, "sleep 30").unwrap();

        let mut handle = backend.prepare(&ws, &limits()).await.unwrap();
        let live = handle.run("sleep 30", InterpreterKind::Shell).await.unwrap();

        let started = std::time::Instant::now();
        handle.terminate(Duration::from_millis(200)).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(handle.terminated());

        let exit = tokio::time::timeout(Duration::from_secs(2), live.exit)
            .await
            .expect("exec process reaped")
            .unwrap();
        assert_ne!(exit, ProcessExit::exited(0));
        assert!(handle.dispose().await.is_empty());
    }
}
