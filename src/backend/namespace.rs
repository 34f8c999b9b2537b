//! Namespace sandbox tier: unshare + chroot + rlimits, no external runtime.
//!
//! `prepare` assembles an empty root skeleton next to the workspace. The
//! spawned child fills it with read-only binds of a small host whitelist, the
//! workspace at `/workspace`, a sized tmpfs at `/tmp` and (when permitted) a
//! fresh `/proc`, then chroots into it. The network namespace is never
//! configured, so the sandbox has no interfaces to route through.
//!
//! All mounts live in the child's private mount namespace and vanish with it.
//! `dispose` still checks the host mount table for anything under the root
//! before deleting it, and refuses to delete a root that still has mounts.

mod child;

use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use nix::mount::{umount2, MntFlags};
use nix::sys::resource::Resource;
use nix::unistd::{getegid, geteuid};
use tokio::process::Command;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use self::child::{Bind, ChildPlan, IdMaps};
use super::{sandbox_env, spawn_piped, IsolationBackend, LiveExecution, SandboxHandle, SpawnedGroup};
use crate::config::{InterpretersConfig, NamespaceConfig, UserNamespaceMode};
use crate::error::{CleanupWarning, LaunchError};
use crate::limits::EnforceableLimits;
use crate::types::{BackendKind, InterpreterKind};
use crate::workspace::{entrypoint_name, IsolatedWorkspace, GUEST_WORKSPACE};

const KIND: BackendKind = BackendKind::NamespaceSandbox;

/// Linux namespaces, chroot and rlimits.
#[derive(Debug, Clone)]
pub struct NamespaceBackend {
    config: NamespaceConfig,
    interpreters: InterpretersConfig,
}

impl NamespaceBackend {
    pub const fn new(config: NamespaceConfig, interpreters: InterpretersConfig) -> Self {
        Self {
            config,
            interpreters,
        }
    }

    fn id_maps(&self) -> Option<IdMaps> {
        let wanted = match self.config.user_namespace {
            UserNamespaceMode::Always => true,
            UserNamespaceMode::Never => false,
            UserNamespaceMode::Auto => !geteuid().is_root(),
        };
        wanted.then(|| IdMaps::root_to(geteuid().as_raw(), getegid().as_raw()))
    }
}

#[async_trait]
impl IsolationBackend for NamespaceBackend {
    fn kind(&self) -> BackendKind {
        KIND
    }

    fn supports(&self, interpreter: InterpreterKind) -> bool {
        self.interpreters.path(interpreter).exists()
    }

    #[instrument(skip(self), fields(backend = "namespace_sandbox"))]
    async fn probe(&self) -> anyhow::Result<()> {
        if !cfg!(target_os = "linux") {
            bail!("namespaces require Linux");
        }
        let mut cmd = Command::new("/bin/true");
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .env_clear()
            .kill_on_drop(true);
        child::install_probe(&mut cmd, self.id_maps());

        let status = tokio::time::timeout(self.config.probe_timeout(), cmd.status())
            .await
            .context("namespace probe timed out")?
            .context("cannot create PID/mount/network namespaces or chroot")?;
        if !status.success() {
            bail!("namespace probe child exited with {status}");
        }
        debug!("Namespace creation permitted");
        Ok(())
    }

    #[instrument(skip_all, fields(backend = "namespace_sandbox", execution_id = %workspace.id()))]
    async fn prepare(
        &self,
        workspace: &IsolatedWorkspace,
        limits: &EnforceableLimits,
    ) -> Result<Box<dyn SandboxHandle>, LaunchError> {
        let parent = workspace
            .path()
            .parent()
            .ok_or_else(|| LaunchError::unavailable(KIND, "workspace has no parent directory"))?;
        let root = parent.join(format!("root-{}", Uuid::new_v4()));
        fs::create_dir(&root)
            .map_err(|e| LaunchError::unavailable(KIND, format!("cannot create chroot root: {e}")))?;

        let binds = match build_skeleton(&root, &self.config.rootfs_binds) {
            Ok(binds) => binds,
            Err(e) => {
                let _ = fs::remove_dir_all(&root);
                return Err(LaunchError::from_anyhow(KIND, &e));
            }
        };

        let plan = ChildPlan {
            id_maps: self.id_maps(),
            root: root.clone(),
            binds,
            workspace: workspace.path().to_path_buf(),
            workspace_target: guest_path(&root, GUEST_WORKSPACE),
            tmp_target: root.join("tmp"),
            tmpfs_options: format!("size={}m,mode=1777", self.config.tmpfs_mb),
            proc_target: root.join("proc"),
            guest_cwd: PathBuf::from(GUEST_WORKSPACE),
            rlimits: rlimits(limits),
        };
        debug!(binds = plan.binds.len(), root = %plan.root.display(), "Prepared chroot skeleton");

        Ok(Box::new(NamespaceHandle {
            plan,
            interpreters: self.interpreters.clone(),
            root: Some(root),
            spawned: None,
            terminated: false,
            disposed: false,
        }))
    }
}

/// Resource limits applied by the namespace init before exec.
fn rlimits(limits: &EnforceableLimits) -> Vec<(Resource, u64, u64)> {
    let mut out = vec![(Resource::RLIMIT_CORE, 0, 0)];
    if let Some(bytes) = limits.memory_bytes {
        out.push((Resource::RLIMIT_AS, bytes, bytes));
    }
    if let Some(seconds) = limits.cpu_seconds {
        // SIGXCPU at the soft limit, SIGKILL one second later.
        out.push((Resource::RLIMIT_CPU, seconds, seconds + 1));
    }
    if let Some(bytes) = limits.disk_bytes {
        out.push((Resource::RLIMIT_FSIZE, bytes, bytes));
    }
    if let Some(count) = limits.max_processes {
        out.push((Resource::RLIMIT_NPROC, count, count));
    }
    out
}

/// `root` joined with an absolute guest path.
fn guest_path(root: &Path, guest: &str) -> PathBuf {
    root.join(guest.trim_start_matches('/'))
}

/// Create mount points and symlinks under `root` for the whitelist.
///
/// Host symlinks (`/bin -> usr/bin` on merged-usr systems) are recreated as
/// symlinks rather than bound. Missing entries are skipped.
fn build_skeleton(root: &Path, whitelist: &[PathBuf]) -> anyhow::Result<Vec<Bind>> {
    for dir in [GUEST_WORKSPACE, "/tmp", "/proc", "/dev"] {
        let path = guest_path(root, dir);
        fs::create_dir_all(&path).with_context(|| format!("creating {}", path.display()))?;
    }

    let mut binds = Vec::new();
    for source in whitelist {
        let Some(guest) = source.to_str().filter(|s| s.starts_with('/')) else {
            warn!(path = %source.display(), "Skipping non-absolute bind source");
            continue;
        };
        let meta = match fs::symlink_metadata(source) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e).with_context(|| format!("inspecting {}", source.display())),
        };
        let target = guest_path(root, guest);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
        }

        if meta.file_type().is_symlink() {
            let link = fs::read_link(source)
                .with_context(|| format!("reading link {}", source.display()))?;
            symlink(&link, &target)
                .with_context(|| format!("linking {}", target.display()))?;
            continue;
        }
        let created = if meta.is_dir() {
            fs::create_dir_all(&target)
        } else {
            fs::File::create(&target).map(drop)
        };
        created.with_context(|| format!("creating mount point {}", target.display()))?;
        binds.push(Bind {
            source: source.clone(),
            target,
        });
    }
    Ok(binds)
}

struct NamespaceHandle {
    plan: ChildPlan,
    interpreters: InterpretersConfig,
    root: Option<PathBuf>,
    spawned: Option<SpawnedGroup>,
    terminated: bool,
    disposed: bool,
}

#[async_trait]
impl SandboxHandle for NamespaceHandle {
    async fn run(
        &mut self,
        _code: &str,
        interpreter: InterpreterKind,
    ) -> Result<LiveExecution, LaunchError> {
        let program = self.interpreters.path(interpreter);
        let entry = Path::new(GUEST_WORKSPACE).join(entrypoint_name(interpreter));

        let mut cmd = Command::new(program);
        cmd.arg(entry).env_clear().envs(sandbox_env(GUEST_WORKSPACE));
        child::install(&mut cmd, self.plan.clone());

        debug!(program = %program.display(), "Spawning namespace sandbox");
        let (live, spawned) = spawn_piped(cmd, KIND)?;
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

        if let Some(spawned) = &mut self.spawned {
            // Killing the intermediate takes the namespace init with it.
            spawned.group.reap_stragglers();
            spawned.exit_watch.wait(Duration::from_secs(1)).await;
        }

        self.release_root()
    }
}

impl NamespaceHandle {
    /// Unmount and delete the chroot root, once.
    fn release_root(&mut self) -> Vec<CleanupWarning> {
        let mut warnings = Vec::new();
        let Some(root) = self.root.take() else {
            return warnings;
        };
        if unmount_under(&root, &mut warnings) {
            // Deleting through a live bind would reach host files.
            warnings.push(CleanupWarning::new(
                Some(KIND),
                format!("left chroot root {} in place: mounts remain", root.display()),
            ));
            return warnings;
        }
        if let Err(e) = fs::remove_dir_all(&root) {
            warn!(path = %root.display(), error = %e, "Failed to remove chroot root");
            warnings.push(CleanupWarning::new(
                Some(KIND),
                format!("failed to remove chroot root {}: {e}", root.display()),
            ));
        }
        debug!(path = %root.display(), "Removed chroot root");
        warnings
    }
}

impl Drop for NamespaceHandle {
    fn drop(&mut self) {
        if self.disposed {
            return;
        }
        if let Some(spawned) = &self.spawned {
            spawned.group.reap_stragglers();
        }
        for warning in self.release_root() {
            warn!(message = %warning.message, "Cleanup on drop incomplete");
        }
    }
}

/// Detach every host-visible mount under `root`, deepest first, retrying
/// once. Returns whether any mount survived.
fn unmount_under(root: &Path, warnings: &mut Vec<CleanupWarning>) -> bool {
    let mounts = match mounts_under(root) {
        Ok(mounts) => mounts,
        Err(e) => {
            warnings.push(CleanupWarning::new(
                Some(KIND),
                format!("cannot read mount table: {e}"),
            ));
            return true;
        }
    };
    let mut leftover = false;
    for mount_point in mounts {
        let first = umount2(&mount_point, MntFlags::MNT_DETACH);
        if first.is_ok() {
            continue;
        }
        warn!(path = %mount_point.display(), "Unmount failed, retrying once");
        if let Err(e) = umount2(&mount_point, MntFlags::MNT_DETACH) {
            leftover = true;
            warnings.push(CleanupWarning::new(
                Some(KIND),
                format!("failed to unmount {}: {e}", mount_point.display()),
            ));
        }
    }
    leftover
}

/// Mount points under `root` in the host mount table, deepest first.
fn mounts_under(root: &Path) -> io::Result<Vec<PathBuf>> {
    let table = fs::read_to_string("/proc/self/mountinfo")?;
    let mut found: Vec<PathBuf> = parse_mount_points(&table)
        .into_iter()
        .filter(|point| point.starts_with(root) && point != root)
        .collect();
    found.sort_by_key(|point| std::cmp::Reverse(point.components().count()));
    Ok(found)
}

/// Mount point column of `/proc/self/mountinfo`, with octal escapes decoded.
fn parse_mount_points(table: &str) -> Vec<PathBuf> {
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .map(|field| PathBuf::from(unescape_octal(field)))
        .collect()
}

fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = std::str::from_utf8(&bytes[i + 1..i + 4]).unwrap_or("");
            if let Ok(value) = u8::from_str_radix(digits, 8) {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
