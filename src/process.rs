//! Process-group signalling and exit reaping for spawned children.
//!
//! Every child the sandbox spawns leads its own process group, so a timeout
//! or cancellation reaches grandchildren too. Termination is staged: SIGTERM
//! to the group, a grace period, then SIGKILL.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use tokio::process::Child;
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

use crate::backend::ProcessExit;

/// Poll interval while waiting out the grace period.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How a termination request concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Nothing was running when the request arrived.
    AlreadyExited,
    /// The group exited during the grace period.
    Graceful,
    /// SIGKILL was needed.
    Forced,
    /// An earlier call already handled it.
    Repeated,
}

/// A process group led by a spawned child.
#[derive(Debug)]
pub struct ProcessGroup {
    pgid: Pid,
    terminated: AtomicBool,
}

impl ProcessGroup {
    /// Track the group whose leader has pid `leader`.
    pub fn new(leader: u32) -> io::Result<Self> {
        let raw = i32::try_from(leader)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        Ok(Self {
            pgid: Pid::from_raw(raw),
            terminated: AtomicBool::new(false),
        })
    }

    pub const fn pgid(&self) -> Pid {
        self.pgid
    }

    /// Whether any member of the group is still alive.
    pub fn is_alive(&self) -> bool {
        match killpg(self.pgid, None) {
            Ok(()) => true,
            // The group exists but a member runs under another uid.
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    /// Whether `terminate` has been called.
    pub fn was_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Send `signal` to every member. A vanished group is not an error.
    pub fn signal(&self, signal: Signal) -> io::Result<()> {
        match killpg(self.pgid, signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(io::Error::from(errno)),
        }
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL. Only the first call acts.
    pub async fn terminate(&self, grace: Duration) -> Termination {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return Termination::Repeated;
        }
        if !self.is_alive() {
            return Termination::AlreadyExited;
        }

        if let Err(e) = self.signal(Signal::SIGTERM) {
            warn!(pgid = %self.pgid, error = %e, "SIGTERM to process group failed");
        }

        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            if !self.is_alive() {
                debug!(pgid = %self.pgid, "Process group exited after SIGTERM");
                return Termination::Graceful;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        if let Err(e) = self.signal(Signal::SIGKILL) {
            warn!(pgid = %self.pgid, error = %e, "SIGKILL to process group failed");
        }
        debug!(pgid = %self.pgid, "Process group force-killed");
        Termination::Forced
    }

    /// SIGKILL any members left behind, without marking the group terminated.
    pub fn reap_stragglers(&self) {
        if self.is_alive() {
            let _ = self.signal(Signal::SIGKILL);
        }
    }
}

/// Observes whether a reaped child has exited.
#[derive(Debug, Clone)]
pub struct ExitWatch {
    rx: watch::Receiver<bool>,
}

impl ExitWatch {
    pub fn has_exited(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait up to `limit` for the exit. Returns whether it happened.
    pub async fn wait(&mut self, limit: Duration) -> bool {
        let exited = matches!(
            tokio::time::timeout(limit, self.rx.wait_for(|done| *done)).await,
            Ok(Ok(_))
        );
        exited || self.has_exited()
    }
}

/// Reap `child` on a background task.
///
/// The task keeps polling `wait` so the child never lingers as a zombie,
/// which lets group liveness checks see the real state.
pub fn spawn_reaper(mut child: Child) -> (BoxFuture<'static, io::Result<ProcessExit>>, ExitWatch) {
    let (status_tx, status_rx) = oneshot::channel();
    let (exited_tx, exited_rx) = watch::channel(false);
    tokio::spawn(async move {
        let status = child.wait().await;
        let _ = exited_tx.send(true);
        let _ = status_tx.send(status);
    });
    let exit = async move {
        match status_rx.await {
            Ok(status) => status.map(ProcessExit::from),
            Err(_) => Err(io::Error::other("reaper task ended without a status")),
        }
    }
    .boxed();
    (exit, ExitWatch { rx: exited_rx })
}

/// Reap a forked child that tokio does not know about.
///
/// `waitpid` blocks, so it runs on the blocking pool.
pub fn spawn_pid_reaper(pid: Pid) -> (BoxFuture<'static, io::Result<ProcessExit>>, ExitWatch) {
    let (status_tx, status_rx) = oneshot::channel();
    let (exited_tx, exited_rx) = watch::channel(false);
    tokio::task::spawn_blocking(move || {
        let status = loop {
            match waitpid(pid, None) {
                Err(Errno::EINTR) => {}
                other => break other,
            }
        };
        let _ = exited_tx.send(true);
        let _ = status_tx.send(status);
    });
    let exit = async move {
        match status_rx.await {
            Ok(Ok(WaitStatus::Exited(_, code))) => Ok(ProcessExit::exited(code)),
            Ok(Ok(WaitStatus::Signaled(_, signal, _))) => Ok(ProcessExit::signaled(signal as i32)),
            Ok(Ok(other)) => Err(io::Error::other(format!("unexpected wait status {other:?}"))),
            Ok(Err(errno)) => Err(io::Error::from(errno)),
            Err(_) => Err(io::Error::other("reaper task ended without a status")),
        }
    }
    .boxed();
    (exit, ExitWatch { rx: exited_rx })
}
