//! Per-execution scratch directories.
//!
//! Each execution gets a fresh directory under the configured workspace root.
//! Request files and the entrypoint script are materialized into it before
//! launch, and it is removed after the backend is disposed.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{CleanupWarning, WorkspaceError};
use crate::types::InterpreterKind;

/// Mount point of the workspace inside container and namespace roots.
pub const GUEST_WORKSPACE: &str = "/workspace";

/// A scratch directory exclusively owned by one execution.
#[derive(Debug)]
pub struct IsolatedWorkspace {
    id: Uuid,
    path: PathBuf,
    dir: Option<TempDir>,
}

impl IsolatedWorkspace {
    /// Create a fresh directory under `root`, creating `root` if needed.
    pub fn create(root: &Path, id: Uuid) -> Result<Self, WorkspaceError> {
        fs::create_dir_all(root).map_err(|source| io_error(root, source))?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("ws-{id}-"))
            .tempdir_in(root)
            .map_err(|source| io_error(root, source))?;
        let path = dir.path().to_path_buf();
        // Sandboxed code may run under a different uid mapping.
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
            .map_err(|source| io_error(&path, source))?;
        debug!(execution_id = %id, path = %path.display(), "Created workspace");
        Ok(Self {
            id,
            path,
            dir: Some(dir),
        })
    }

    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Host path of the workspace.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the directory is still present.
    pub const fn is_live(&self) -> bool {
        self.dir.is_some()
    }

    /// Write request files, rejecting any path that would leave the workspace.
    pub fn materialize(&self, files: &BTreeMap<String, Vec<u8>>) -> Result<(), WorkspaceError> {
        for (name, contents) in files {
            let relative = sanitize_relative(name)?;
            let target = self.path.join(relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|source| io_error(parent, source))?;
            }
            fs::write(&target, contents).map_err(|source| io_error(&target, source))?;
        }
        Ok(())
    }

    /// Write the submitted code and return its file name.
    pub fn write_entrypoint(
        &self,
        interpreter: InterpreterKind,
        code: &str,
    ) -> Result<String, WorkspaceError> {
        let name = entrypoint_name(interpreter);
        let target = self.path.join(&name);
        fs::write(&target, code).map_err(|source| io_error(&target, source))?;
        Ok(name)
    }

    /// Remove the directory. Idempotent: later calls return `None`.
    pub fn teardown(&mut self) -> Option<CleanupWarning> {
        let dir = self.dir.take()?;
        let path = dir.path().to_path_buf();
        if dir.close().is_ok() {
            debug!(execution_id = %self.id, "Removed workspace");
            return None;
        }

        // Code may have dropped write permission on its own directories.
        make_writable(&path);
        match fs::remove_dir_all(&path) {
            Ok(()) => None,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(execution_id = %self.id, path = %path.display(), error = %e, "Failed to remove workspace");
                Some(CleanupWarning::new(
                    None,
                    format!("failed to remove workspace {}: {e}", path.display()),
                ))
            }
        }
    }
}

impl Drop for IsolatedWorkspace {
    fn drop(&mut self) {
        if self.dir.is_some() {
            let _ = self.teardown();
        }
    }
}

/// Entrypoint file name for `interpreter`.
pub fn entrypoint_name(interpreter: InterpreterKind) -> String {
    format!(".sandbox-entry.{}", interpreter.extension())
}

/// Validate a workspace-relative path.
pub fn sanitize_relative(name: &str) -> Result<PathBuf, WorkspaceError> {
    let mut clean = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(WorkspaceError::PathEscape(name.to_owned()));
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(WorkspaceError::PathEscape(name.to_owned()));
    }
    Ok(clean)
}

fn make_writable(dir: &Path) {
    let _ = fs::set_permissions(dir, fs::Permissions::from_mode(0o700));
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        match entry.file_type() {
            Ok(kind) if kind.is_dir() => make_writable(&path),
            _ => {}
        }
    }
}

fn io_error(path: &Path, source: std::io::Error) -> WorkspaceError {
    WorkspaceError::Io {
        path: path.display().to_string(),
        source,
    }
}
