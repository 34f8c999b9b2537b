//! Daemon configuration.
//!
//! Configuration is JSON. It is read from the file passed with `--config`,
//! else from inline JSON in the `TIERED_SANDBOX_CONFIG` environment variable,
//! else built-in defaults apply. `SANDBOX_WORKSPACE_ROOT` and
//! `SANDBOX_DEFAULT_TIMEOUT` override the loaded values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::limits::{ResourceLimitSet, ResourceLimiter};
use crate::types::{BackendKind, InterpreterKind};

const MB: u64 = 1024 * 1024;

/// Top-level configuration for the sandbox.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Parent directory of per-execution workspaces and chroot roots.
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,

    /// Defaults applied when a request leaves a limit unset.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Maximum bytes kept per output stream.
    #[serde(default = "default_output_cap")]
    pub output_cap_bytes: usize,

    /// Time between SIGTERM and SIGKILL.
    #[serde(default = "default_termination_grace")]
    pub termination_grace_ms: u64,

    /// How long to wait for pipes to close once the child is gone.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_ms: u64,

    /// Re-probe host capabilities after this many seconds. Unset means once
    /// per process.
    #[serde(default)]
    pub reprobe_interval_seconds: Option<u64>,

    /// Tiers removed from the fallback chain.
    #[serde(default)]
    pub disabled_backends: Vec<BackendKind>,

    /// Host interpreter paths.
    #[serde(default)]
    pub interpreters: InterpretersConfig,

    #[serde(default)]
    pub container: ContainerConfig,

    #[serde(default)]
    pub namespace: NamespaceConfig,

    #[serde(default)]
    pub restricted: RestrictedConfig,
}

/// Default ceilings.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    #[serde(default = "default_cpu_seconds")]
    pub cpu_seconds: Option<u64>,

    #[serde(default = "default_memory_mb")]
    pub memory_mb: Option<u64>,

    #[serde(default = "default_disk_mb")]
    pub disk_mb: Option<u64>,

    /// Process count ceiling for tiers that support one.
    #[serde(default)]
    pub max_processes: Option<u64>,
}

/// Interpreter binaries used by host-side tiers.
#[derive(Debug, Clone, Deserialize)]
pub struct InterpretersConfig {
    #[serde(default = "default_host_python")]
    pub python: PathBuf,

    #[serde(default = "default_shell")]
    pub shell: PathBuf,
}

/// Container runtime settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ContainerConfig {
    /// Docker-compatible CLI (`docker`, `podman`).
    #[serde(default = "default_runtime")]
    pub runtime: String,

    #[serde(default = "default_image")]
    pub image: String,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_seconds: u64,

    /// Timeout for create/start/kill/rm calls.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_seconds: u64,

    #[serde(default)]
    pub cpus: Option<f64>,

    #[serde(default = "default_pids_limit")]
    pub pids_limit: Option<u64>,

    #[serde(default = "default_tmpfs_mb")]
    pub tmpfs_mb: u64,

    /// Python path inside the image.
    #[serde(default = "default_image_python")]
    pub python: String,

    /// Shell path inside the image.
    #[serde(default = "default_image_shell")]
    pub shell: String,
}

/// Whether the namespace tier creates a user namespace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserNamespaceMode {
    /// Only when not already root.
    #[default]
    Auto,
    Always,
    Never,
}

/// Namespace tier settings.
#[derive(Debug, Clone, Deserialize)]
pub struct NamespaceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub user_namespace: UserNamespaceMode,

    /// Host paths bind-mounted read-only into the chroot. Missing entries
    /// are skipped.
    #[serde(default = "default_rootfs_binds")]
    pub rootfs_binds: Vec<PathBuf>,

    #[serde(default = "default_tmpfs_mb")]
    pub tmpfs_mb: u64,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_seconds: u64,
}

/// Restricted interpreter settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RestrictedConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Config {
    /// Load configuration, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            Self::from_json(&text)
                .with_context(|| format!("Invalid config file {}", path.display()))?
        } else if let Ok(inline) = std::env::var("TIERED_SANDBOX_CONFIG") {
            Self::from_json(&inline).context("Failed to parse TIERED_SANDBOX_CONFIG")?
        } else {
            debug!("No configuration supplied, using defaults");
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(root) = std::env::var("SANDBOX_WORKSPACE_ROOT") {
            self.workspace_root = PathBuf::from(root);
        }
        if let Ok(raw) = std::env::var("SANDBOX_DEFAULT_TIMEOUT") {
            match raw.parse::<u64>() {
                Ok(seconds) => self.limits.timeout_seconds = seconds,
                Err(e) => warn!(value = %raw, error = %e, "Ignoring invalid SANDBOX_DEFAULT_TIMEOUT"),
            }
        }
    }

    /// Limiter seeded with the configured defaults.
    pub fn limiter(&self) -> ResourceLimiter {
        let limits = &self.limits;
        ResourceLimiter::new(
            ResourceLimitSet {
                cpu_seconds: limits.cpu_seconds,
                memory_bytes: limits.memory_mb.map(|mb| mb * MB),
                disk_bytes: limits.disk_mb.map(|mb| mb * MB),
                wall_timeout: Some(Duration::from_secs(limits.timeout_seconds)),
            },
            limits.max_processes,
        )
    }

    pub const fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }

    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn reprobe_interval(&self) -> Option<Duration> {
        self.reprobe_interval_seconds.map(Duration::from_secs)
    }

    pub fn is_enabled(&self, backend: BackendKind) -> bool {
        if self.disabled_backends.contains(&backend) {
            return false;
        }
        match backend {
            BackendKind::NamespaceSandbox => self.namespace.enabled,
            BackendKind::RestrictedInterpreter => self.restricted.enabled,
            BackendKind::Container | BackendKind::Unrestricted => true,
        }
    }
}

impl InterpretersConfig {
    pub fn path(&self, interpreter: InterpreterKind) -> &Path {
        match interpreter {
            InterpreterKind::Python => &self.python,
            InterpreterKind::Shell => &self.shell,
        }
    }
}

impl ContainerConfig {
    pub fn interpreter(&self, interpreter: InterpreterKind) -> &str {
        match interpreter {
            InterpreterKind::Python => &self.python,
            InterpreterKind::Shell => &self.shell,
        }
    }

    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_seconds)
    }

    pub const fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }
}

impl NamespaceConfig {
    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_seconds)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace_root: default_workspace_root(),
            limits: LimitsConfig::default(),
            output_cap_bytes: default_output_cap(),
            termination_grace_ms: default_termination_grace(),
            drain_timeout_ms: default_drain_timeout(),
            reprobe_interval_seconds: None,
            disabled_backends: Vec::new(),
            interpreters: InterpretersConfig::default(),
            container: ContainerConfig::default(),
            namespace: NamespaceConfig::default(),
            restricted: RestrictedConfig::default(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout(),
            cpu_seconds: default_cpu_seconds(),
            memory_mb: default_memory_mb(),
            disk_mb: default_disk_mb(),
            max_processes: None,
        }
    }
}

impl Default for InterpretersConfig {
    fn default() -> Self {
        Self {
            python: default_host_python(),
            shell: default_shell(),
        }
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            runtime: default_runtime(),
            image: default_image(),
            probe_timeout_seconds: default_probe_timeout(),
            command_timeout_seconds: default_command_timeout(),
            cpus: None,
            pids_limit: default_pids_limit(),
            tmpfs_mb: default_tmpfs_mb(),
            python: default_image_python(),
            shell: default_image_shell(),
        }
    }
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            user_namespace: UserNamespaceMode::Auto,
            rootfs_binds: default_rootfs_binds(),
            tmpfs_mb: default_tmpfs_mb(),
            probe_timeout_seconds: default_probe_timeout(),
        }
    }
}

impl Default for RestrictedConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn default_workspace_root() -> PathBuf {
    std::env::temp_dir().join("tiered-sandbox")
}

fn default_host_python() -> PathBuf {
    "/usr/bin/python3".into()
}

fn default_shell() -> PathBuf {
    "/bin/sh".into()
}

fn default_runtime() -> String {
    "docker".into()
}

fn default_image() -> String {
    "python:3.11-slim".into()
}

fn default_image_python() -> String {
    "python3".into()
}

fn default_image_shell() -> String {
    "/bin/sh".into()
}

fn default_rootfs_binds() -> Vec<PathBuf> {
    [
        "/bin",
        "/sbin",
        "/usr",
        "/lib",
        "/lib64",
        "/etc/alternatives",
        "/etc/ld.so.cache",
        "/dev/null",
        "/dev/zero",
        "/dev/urandom",
    ]
    .into_iter()
    .map(PathBuf::from)
    .collect()
}

const fn default_true() -> bool {
    true
}

const fn default_timeout() -> u64 {
    30
}

#[allow(clippy::unnecessary_wraps)]
const fn default_cpu_seconds() -> Option<u64> {
    Some(10)
}

#[allow(clippy::unnecessary_wraps)]
const fn default_memory_mb() -> Option<u64> {
    Some(128)
}

#[allow(clippy::unnecessary_wraps)]
const fn default_disk_mb() -> Option<u64> {
    Some(10)
}

#[allow(clippy::unnecessary_wraps)]
const fn default_pids_limit() -> Option<u64> {
    Some(64)
}

const fn default_output_cap() -> usize {
    1024 * 1024
}

const fn default_termination_grace() -> u64 {
    500
}

const fn default_drain_timeout() -> u64 {
    250
}

const fn default_probe_timeout() -> u64 {
    5
}

const fn default_command_timeout() -> u64 {
    30
}

const fn default_tmpfs_mb() -> u64 {
    64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config.limits.timeout_seconds, 30);
        assert_eq!(config.limits.cpu_seconds, Some(10));
        assert_eq!(config.limits.memory_mb, Some(128));
        assert_eq!(config.limits.disk_mb, Some(10));
        assert_eq!(config.output_cap_bytes, 1024 * 1024);
        assert_eq!(config.termination_grace(), Duration::from_millis(500));
        assert_eq!(config.container.image, "python:3.11-slim");
        assert_eq!(config.namespace.user_namespace, UserNamespaceMode::Auto);
        assert!(config
            .namespace
            .rootfs_binds
            .contains(&PathBuf::from("/usr")));
        assert!(config.reprobe_interval().is_none());
    }

    #[test]
    fn nested_fields_override_individually() {
        let json = r#"{
            "limits": { "timeout_seconds": 5, "memory_mb": null },
            "container": { "runtime": "podman" },
            "namespace": { "user_namespace": "never", "tmpfs_mb": 16 },
            "reprobe_interval_seconds": 300
        }"#;
        let config = Config::from_json(json).unwrap();
        assert_eq!(config.limits.timeout_seconds, 5);
        assert_eq!(config.limits.memory_mb, None);
        assert_eq!(config.limits.cpu_seconds, Some(10));
        assert_eq!(config.container.runtime, "podman");
        assert_eq!(config.container.image, "python:3.11-slim");
        assert_eq!(config.namespace.user_namespace, UserNamespaceMode::Never);
        assert_eq!(config.namespace.tmpfs_mb, 16);
        assert_eq!(config.reprobe_interval(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn disabled_backends_are_excluded() {
        let json = r#"{
            "disabled_backends": ["container", "unrestricted"],
            "restricted": { "enabled": false }
        }"#;
        let config = Config::from_json(json).unwrap();
        assert!(!config.is_enabled(BackendKind::Container));
        assert!(config.is_enabled(BackendKind::NamespaceSandbox));
        assert!(!config.is_enabled(BackendKind::RestrictedInterpreter));
        assert!(!config.is_enabled(BackendKind::Unrestricted));
    }

    #[test]
    fn limiter_converts_megabytes() {
        let config = Config::default();
        let limits = config
            .limiter()
            .build(&ResourceLimitSet::default(), BackendKind::NamespaceSandbox)
            .unwrap();
        assert_eq!(limits.memory_bytes, Some(128 * MB));
        assert_eq!(limits.disk_bytes, Some(10 * MB));
        assert_eq!(limits.wall_timeout, Duration::from_secs(30));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sandbox.json");
        std::fs::write(&path, r#"{"output_cap_bytes": 4096}"#).unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.output_cap_bytes, 4096);
    }

    #[test]
    fn load_rejects_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = Config::load(Some(&path)).unwrap_err();
        assert!(format!("{err:#}").contains("broken.json"));
    }

    #[test]
    fn interpreter_paths() {
        let config = Config::default();
        assert_eq!(
            config.interpreters.path(InterpreterKind::Shell),
            Path::new("/bin/sh")
        );
        assert_eq!(config.container.interpreter(InterpreterKind::Python), "python3");
    }
}
