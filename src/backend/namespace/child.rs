//! Code that runs between `fork` and `exec` of a namespace sandbox child.
//!
//! Process layout after spawn:
//!
//! ```text
//! daemon ── intermediate (new session, unshared namespaces, waits)
//!               └── init (PID 1 of the new PID namespace, chroots, execs)
//! ```
//!
//! The intermediate is what the daemon sees. It closes every descriptor it
//! inherited, ignores termination signals and exits with the init's exact
//! status once the init is gone. The init carries a parent-death SIGKILL, so
//! killing the intermediate takes down the whole namespace.
//!
//! Everything here is computed before spawn; the hook only issues syscalls.

#![allow(unsafe_code)]

use std::ffi::CStr;
use std::io;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::mount::{mount, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::statvfs::{statvfs, FsFlags};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{chdir, chroot, fork, sethostname, setsid, ForkResult};
use tokio::process::Command;

const SETGROUPS: &CStr = c"/proc/self/setgroups";
const UID_MAP: &CStr = c"/proc/self/uid_map";
const GID_MAP: &CStr = c"/proc/self/gid_map";

/// Identity maps written after entering a new user namespace.
#[derive(Debug, Clone)]
pub struct IdMaps {
    uid_map: Vec<u8>,
    gid_map: Vec<u8>,
}

impl IdMaps {
    /// Map root inside the namespace to the given host ids.
    pub fn root_to(uid: u32, gid: u32) -> Self {
        Self {
            uid_map: format!("0 {uid} 1\n").into_bytes(),
            gid_map: format!("0 {gid} 1\n").into_bytes(),
        }
    }
}

/// A read-only bind of a host path into the chroot.
#[derive(Debug, Clone)]
pub struct Bind {
    pub source: PathBuf,
    pub target: PathBuf,
}

/// Everything the init needs, resolved on the host beforehand.
#[derive(Debug, Clone)]
pub struct ChildPlan {
    pub id_maps: Option<IdMaps>,
    pub root: PathBuf,
    pub binds: Vec<Bind>,
    pub workspace: PathBuf,
    pub workspace_target: PathBuf,
    pub tmp_target: PathBuf,
    pub tmpfs_options: String,
    pub proc_target: PathBuf,
    pub guest_cwd: PathBuf,
    pub rlimits: Vec<(Resource, u64, u64)>,
}

fn namespace_flags(user_namespace: bool) -> CloneFlags {
    let mut flags = CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWNET
        | CloneFlags::CLONE_NEWIPC
        | CloneFlags::CLONE_NEWUTS;
    if user_namespace {
        flags |= CloneFlags::CLONE_NEWUSER;
    }
    flags
}

/// Install the full sandbox hook on `cmd`.
///
/// `cmd` must not set a working directory or process group; the hook starts
/// a new session and changes directory after the chroot.
pub fn install(cmd: &mut Command, plan: ChildPlan) {
    // SAFETY: the hook runs in the single-threaded child after fork. It only
    // performs syscalls on data prepared before spawn, plus one fork whose
    // parent branch never returns.
    unsafe {
        cmd.pre_exec(move || enter(&plan));
    }
}

/// Install a hook that enters throwaway namespaces and checks chroot.
pub fn install_probe(cmd: &mut Command, id_maps: Option<IdMaps>) {
    // SAFETY: as in `install`; no fork, no mounts outside the new namespace.
    unsafe {
        cmd.pre_exec(move || {
            unshare(namespace_flags(id_maps.is_some()))?;
            if let Some(maps) = &id_maps {
                write_id_maps(maps)?;
            }
            mount(
                None::<&str>,
                "/",
                None::<&str>,
                MsFlags::MS_REC | MsFlags::MS_PRIVATE,
                None::<&str>,
            )?;
            chroot("/")?;
            Ok(())
        });
    }
}

fn enter(plan: &ChildPlan) -> io::Result<()> {
    setsid()?;
    unshare(namespace_flags(plan.id_maps.is_some()))?;
    if let Some(maps) = &plan.id_maps {
        write_id_maps(maps)?;
    }

    // SAFETY: the child is single-threaded at this point.
    match unsafe { fork() }? {
        ForkResult::Parent { child } => supervise(child),
        ForkResult::Child => become_init(plan),
    }
}

/// Intermediate: wait for the init and exit the same way it did.
fn supervise(child: nix::unistd::Pid) -> ! {
    close_all_fds();
    // SAFETY: plain signal disposition changes in a single-threaded process.
    unsafe {
        libc::signal(libc::SIGTERM, libc::SIG_IGN);
        libc::signal(libc::SIGINT, libc::SIG_IGN);
        libc::signal(libc::SIGHUP, libc::SIG_IGN);
    }
    let _ = setrlimit(Resource::RLIMIT_CORE, 0, 0);

    let status = loop {
        match waitpid(child, None) {
            Err(Errno::EINTR) => {}
            other => break other,
        }
    };

    // SAFETY: `_exit` and `raise` are async-signal-safe and end the process.
    unsafe {
        match status {
            Ok(WaitStatus::Exited(_, code)) => libc::_exit(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                let signal = signal as libc::c_int;
                libc::signal(signal, libc::SIG_DFL);
                libc::raise(signal);
                libc::_exit(128 + signal)
            }
            _ => libc::_exit(127),
        }
    }
}

/// Init: build the chroot, apply limits and return so the child execs.
fn become_init(plan: &ChildPlan) -> io::Result<()> {
    // SAFETY: prctl with constant arguments.
    if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL, 0, 0, 0) } == -1 {
        return Err(io::Error::last_os_error());
    }

    let _ = sethostname("sandbox");

    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )?;

    for bind in &plan.binds {
        bind_mount(&bind.source, &bind.target, MsFlags::MS_RDONLY)?;
    }
    bind_mount(
        &plan.workspace,
        &plan.workspace_target,
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
    )?;

    mount(
        Some("tmpfs"),
        &plan.tmp_target,
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        Some(plan.tmpfs_options.as_str()),
    )?;

    // Not every host lets a nested PID namespace mount proc.
    let _ = mount(
        Some("proc"),
        &plan.proc_target,
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    );

    chroot(&plan.root)?;
    chdir(&plan.guest_cwd)?;

    for (resource, soft, hard) in &plan.rlimits {
        setrlimit(*resource, *soft, *hard)?;
    }
    Ok(())
}

/// Bind `source` onto `target`, then remount with `extra` flags while
/// keeping the flags the kernel locks on unprivileged mounts.
fn bind_mount(source: &Path, target: &Path, extra: MsFlags) -> io::Result<()> {
    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )?;
    let locked = statvfs(target)
        .map(|stat| locked_flags(stat.flags()))
        .unwrap_or_else(|_| MsFlags::empty());
    mount(
        None::<&str>,
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REMOUNT | extra | locked,
        None::<&str>,
    )?;
    Ok(())
}

fn locked_flags(flags: FsFlags) -> MsFlags {
    let mut out = MsFlags::empty();
    for (fs, ms) in [
        (FsFlags::ST_RDONLY, MsFlags::MS_RDONLY),
        (FsFlags::ST_NOSUID, MsFlags::MS_NOSUID),
        (FsFlags::ST_NODEV, MsFlags::MS_NODEV),
        (FsFlags::ST_NOEXEC, MsFlags::MS_NOEXEC),
        (FsFlags::ST_NOATIME, MsFlags::MS_NOATIME),
        (FsFlags::ST_NODIRATIME, MsFlags::MS_NODIRATIME),
        (FsFlags::ST_RELATIME, MsFlags::MS_RELATIME),
    ] {
        if flags.contains(fs) {
            out |= ms;
        }
    }
    out
}

fn write_id_maps(maps: &IdMaps) -> io::Result<()> {
    match write_proc(SETGROUPS, b"deny") {
        Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {}
        other => other?,
    }
    write_proc(UID_MAP, &maps.uid_map)?;
    write_proc(GID_MAP, &maps.gid_map)
}

fn write_proc(path: &CStr, contents: &[u8]) -> io::Result<()> {
    // SAFETY: `path` is NUL-terminated and `contents` outlives the call.
    unsafe {
        let fd = libc::open(path.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let written = libc::write(fd, contents.as_ptr().cast(), contents.len());
        let err = io::Error::last_os_error();
        libc::close(fd);
        if usize::try_from(written).ok() == Some(contents.len()) {
            Ok(())
        } else {
            Err(err)
        }
    }
}

fn close_all_fds() {
    // SAFETY: closing descriptors the intermediate no longer needs.
    unsafe {
        if libc::syscall(libc::SYS_close_range, 0_u32, u32::MAX, 0_u32) == 0 {
            return;
        }
        let max = match libc::sysconf(libc::_SC_OPEN_MAX) {
            n if n > 0 => libc::c_int::try_from(n).unwrap_or(4096),
            _ => 4096,
        };
        for fd in 0..max {
            libc::close(fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_maps_map_root_to_host_ids() {
        let maps = IdMaps::root_to(1000, 1001);
        assert_eq!(maps.uid_map, b"0 1000 1\n");
        assert_eq!(maps.gid_map, b"0 1001 1\n");
    }

    #[test]
    fn locked_flags_carry_over() {
        let flags = locked_flags(FsFlags::ST_NOSUID | FsFlags::ST_NODEV);
        assert!(flags.contains(MsFlags::MS_NOSUID));
        assert!(flags.contains(MsFlags::MS_NODEV));
        assert!(!flags.contains(MsFlags::MS_RDONLY));
    }

    #[test]
    fn user_namespace_flag_is_optional() {
        assert!(namespace_flags(true).contains(CloneFlags::CLONE_NEWUSER));
        assert!(!namespace_flags(false).contains(CloneFlags::CLONE_NEWUSER));
        assert!(namespace_flags(false).contains(CloneFlags::CLONE_NEWNET));
    }
}
