//! Resource ceilings and their translation into per-backend enforceable limits.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::ProcessExit;
use crate::error::LaunchError;
use crate::types::BackendKind;

/// The kinds of ceiling a request can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    CpuTime,
    Memory,
    Disk,
    WallClock,
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::CpuTime => "cpu-time",
            Self::Memory => "memory",
            Self::Disk => "disk",
            Self::WallClock => "wall-clock",
        })
    }
}

/// Abstract ceilings. `None` means "not requested".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimitSet {
    pub cpu_seconds: Option<u64>,
    pub memory_bytes: Option<u64>,
    pub disk_bytes: Option<u64>,
    pub wall_timeout: Option<Duration>,
}

impl ResourceLimitSet {
    /// Limit kinds that carry a value.
    pub fn requested_kinds(&self) -> Vec<LimitKind> {
        let mut kinds = Vec::with_capacity(4);
        if self.cpu_seconds.is_some() {
            kinds.push(LimitKind::CpuTime);
        }
        if self.memory_bytes.is_some() {
            kinds.push(LimitKind::Memory);
        }
        if self.disk_bytes.is_some() {
            kinds.push(LimitKind::Disk);
        }
        if self.wall_timeout.is_some() {
            kinds.push(LimitKind::WallClock);
        }
        kinds
    }
}

/// Limit kinds each tier can enforce.
///
/// The restricted worker runs a single-threaded interpreter, so its CPU
/// time can never exceed wall time; a CPU ceiling is enforced by tightening
/// the deadline, backed by the worker's own RLIMIT_CPU. Unrestricted
/// children may fan out across cores, so no such bound holds there.
pub const fn supported_limits(backend: BackendKind) -> &'static [LimitKind] {
    match backend {
        BackendKind::Container | BackendKind::NamespaceSandbox => &[
            LimitKind::CpuTime,
            LimitKind::Memory,
            LimitKind::Disk,
            LimitKind::WallClock,
        ],
        BackendKind::RestrictedInterpreter => &[LimitKind::CpuTime, LimitKind::WallClock],
        BackendKind::Unrestricted => &[LimitKind::WallClock],
    }
}

/// Concrete limits a backend applies to one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnforceableLimits {
    pub wall_timeout: Duration,
    pub cpu_seconds: Option<u64>,
    pub memory_bytes: Option<u64>,
    pub disk_bytes: Option<u64>,
    pub max_processes: Option<u64>,
    /// The wall deadline was tightened to honour `cpu_seconds`.
    pub wall_clock_enforces_cpu: bool,
}

/// Builds [`EnforceableLimits`] from requested ceilings plus defaults.
#[derive(Debug, Clone)]
pub struct ResourceLimiter {
    defaults: ResourceLimitSet,
    max_processes: Option<u64>,
}

/// Deadline used when neither the request nor the defaults carry one.
pub const FALLBACK_WALL_TIMEOUT: Duration = Duration::from_secs(30);

impl ResourceLimiter {
    /// `defaults` fill unset request fields on backends that can enforce them.
    pub const fn new(defaults: ResourceLimitSet, max_processes: Option<u64>) -> Self {
        Self {
            defaults,
            max_processes,
        }
    }

    /// Translate `requested` for `backend`.
    ///
    /// Fails with [`LaunchError::ResourceLimitUnsupported`] when the backend
    /// cannot honour a requested kind. Requested values are used verbatim so
    /// the result never exceeds them.
    pub fn build(
        &self,
        requested: &ResourceLimitSet,
        backend: BackendKind,
    ) -> Result<EnforceableLimits, LaunchError> {
        let supported = supported_limits(backend);
        if let Some(limit) = requested
            .requested_kinds()
            .into_iter()
            .find(|kind| !supported.contains(kind))
        {
            return Err(LaunchError::ResourceLimitUnsupported { backend, limit });
        }

        let pick = |kind: LimitKind, asked: Option<u64>, default: Option<u64>| {
            asked.or_else(|| default.filter(|_| supported.contains(&kind)))
        };

        let cpu_seconds = pick(
            LimitKind::CpuTime,
            requested.cpu_seconds,
            self.defaults.cpu_seconds,
        );
        let memory_bytes = pick(
            LimitKind::Memory,
            requested.memory_bytes,
            self.defaults.memory_bytes,
        );
        let disk_bytes = pick(LimitKind::Disk, requested.disk_bytes, self.defaults.disk_bytes);
        let mut wall_timeout = requested
            .wall_timeout
            .or(self.defaults.wall_timeout)
            .unwrap_or(FALLBACK_WALL_TIMEOUT);

        let mut wall_clock_enforces_cpu = false;
        if backend == BackendKind::RestrictedInterpreter {
            if let Some(cpu) = cpu_seconds {
                let cpu = Duration::from_secs(cpu);
                if cpu < wall_timeout {
                    wall_timeout = cpu;
                    wall_clock_enforces_cpu = true;
                }
            }
        }

        let max_processes = match backend {
            BackendKind::Container | BackendKind::NamespaceSandbox => self.max_processes,
            _ => None,
        };

        Ok(EnforceableLimits {
            wall_timeout,
            cpu_seconds,
            memory_bytes,
            disk_bytes,
            max_processes,
            wall_clock_enforces_cpu,
        })
    }
}

const ALLOCATION_FAILURE_MARKERS: &[&str] =
    &["MemoryError", "Cannot allocate memory", "out of memory"];

/// Attribute an exit to a resource ceiling, if one plausibly caused it.
///
/// `terminated` is true when the supervisor itself signalled the execution,
/// in which case a SIGKILL is ours and says nothing about limits. Only the
/// container runtime reports a signal death as exit code `128 + signal`;
/// elsewhere such a code is whatever the program chose to exit with.
pub fn classify_breach(
    backend: BackendKind,
    exit: &ProcessExit,
    limits: &EnforceableLimits,
    stderr: &[u8],
    terminated: bool,
) -> Option<LimitKind> {
    let signal = exit.signal.or_else(|| {
        exit.code
            .filter(|code| backend == BackendKind::Container && *code > 128)
            .map(|code| code - 128)
    });

    match signal {
        Some(libc::SIGXCPU) if limits.cpu_seconds.is_some() => return Some(LimitKind::CpuTime),
        Some(libc::SIGXFSZ) if limits.disk_bytes.is_some() => return Some(LimitKind::Disk),
        Some(libc::SIGKILL) if !terminated => {
            if limits.memory_bytes.is_some() {
                return Some(LimitKind::Memory);
            }
            if limits.cpu_seconds.is_some() {
                return Some(LimitKind::CpuTime);
            }
        }
        _ => {}
    }

    let failed = exit.signal.is_some() || exit.code.is_some_and(|code| code != 0);
    if failed && limits.memory_bytes.is_some() {
        let text = String::from_utf8_lossy(stderr);
        if ALLOCATION_FAILURE_MARKERS
            .iter()
            .any(|marker| text.contains(marker))
        {
            return Some(LimitKind::Memory);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    fn limiter() -> ResourceLimiter {
        ResourceLimiter::new(
            ResourceLimitSet {
                cpu_seconds: Some(10),
                memory_bytes: Some(128 * MB),
                disk_bytes: Some(10 * MB),
                wall_timeout: Some(Duration::from_secs(30)),
            },
            Some(64),
        )
    }

    fn enforced(memory: bool, cpu: bool, disk: bool) -> EnforceableLimits {
        EnforceableLimits {
            wall_timeout: Duration::from_secs(5),
            cpu_seconds: cpu.then_some(5),
            memory_bytes: memory.then_some(64 * MB),
            disk_bytes: disk.then_some(MB),
            max_processes: None,
            wall_clock_enforces_cpu: false,
        }
    }

    fn breach(
        exit: &ProcessExit,
        limits: &EnforceableLimits,
        stderr: &[u8],
        terminated: bool,
    ) -> Option<LimitKind> {
        classify_breach(BackendKind::NamespaceSandbox, exit, limits, stderr, terminated)
    }

    #[test]
    fn namespace_gets_defaults_for_unset_limits() {
        let limits = limiter()
            .build(&ResourceLimitSet::default(), BackendKind::NamespaceSandbox)
            .unwrap();
        assert_eq!(limits.wall_timeout, Duration::from_secs(30));
        assert_eq!(limits.cpu_seconds, Some(10));
        assert_eq!(limits.memory_bytes, Some(128 * MB));
        assert_eq!(limits.disk_bytes, Some(10 * MB));
        assert_eq!(limits.max_processes, Some(64));
    }

    #[test]
    fn requested_values_are_never_exceeded() {
        let requested = ResourceLimitSet {
            cpu_seconds: Some(2),
            memory_bytes: Some(64 * MB),
            disk_bytes: Some(MB),
            wall_timeout: Some(Duration::from_secs(3)),
        };
        let limits = limiter()
            .build(&requested, BackendKind::Container)
            .unwrap();
        assert_eq!(limits.cpu_seconds, Some(2));
        assert_eq!(limits.memory_bytes, Some(64 * MB));
        assert_eq!(limits.disk_bytes, Some(MB));
        assert_eq!(limits.wall_timeout, Duration::from_secs(3));
    }

    #[test]
    fn restricted_interpreter_rejects_disk_ceiling() {
        let requested = ResourceLimitSet {
            disk_bytes: Some(MB),
            ..ResourceLimitSet::default()
        };
        let err = limiter()
            .build(&requested, BackendKind::RestrictedInterpreter)
            .unwrap_err();
        assert!(matches!(
            err,
            LaunchError::ResourceLimitUnsupported {
                backend: BackendKind::RestrictedInterpreter,
                limit: LimitKind::Disk
            }
        ));
    }

    #[test]
    fn restricted_interpreter_skips_unenforceable_defaults() {
        let limits = limiter()
            .build(&ResourceLimitSet::default(), BackendKind::RestrictedInterpreter)
            .unwrap();
        assert_eq!(limits.memory_bytes, None);
        assert_eq!(limits.disk_bytes, None);
        assert_eq!(limits.max_processes, None);
        // The default CPU ceiling tightens the deadline.
        assert_eq!(limits.wall_timeout, Duration::from_secs(10));
        assert!(limits.wall_clock_enforces_cpu);
    }

    #[test]
    fn unrestricted_only_accepts_wall_clock() {
        let ok = limiter()
            .build(
                &ResourceLimitSet {
                    wall_timeout: Some(Duration::from_secs(1)),
                    ..ResourceLimitSet::default()
                },
                BackendKind::Unrestricted,
            )
            .unwrap();
        assert_eq!(ok.wall_timeout, Duration::from_secs(1));
        assert_eq!(ok.memory_bytes, None);

        let err = limiter()
            .build(
                &ResourceLimitSet {
                    memory_bytes: Some(MB),
                    ..ResourceLimitSet::default()
                },
                BackendKind::Unrestricted,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            LaunchError::ResourceLimitUnsupported {
                limit: LimitKind::Memory,
                ..
            }
        ));
    }

    #[test]
    fn breach_from_limit_signals() {
        let xcpu = ProcessExit::signaled(libc::SIGXCPU);
        assert_eq!(
            breach(&xcpu, &enforced(false, true, false), b"", false),
            Some(LimitKind::CpuTime)
        );
        let xfsz = ProcessExit::signaled(libc::SIGXFSZ);
        assert_eq!(
            breach(&xfsz, &enforced(false, false, true), b"", false),
            Some(LimitKind::Disk)
        );
    }

    #[test]
    fn our_own_sigkill_is_not_a_breach() {
        let killed = ProcessExit::signaled(libc::SIGKILL);
        let limits = enforced(true, true, true);
        assert_eq!(breach(&killed, &limits, b"", true), None);
        assert_eq!(
            breach(&killed, &limits, b"", false),
            Some(LimitKind::Memory)
        );
    }

    #[test]
    fn allocation_failure_needs_memory_ceiling() {
        let exit = ProcessExit::exited(1);
        let stderr = b"Traceback (most recent call last):\nMemoryError\n";
        assert_eq!(
            breach(&exit, &enforced(true, false, false), stderr, false),
            Some(LimitKind::Memory)
        );
        assert_eq!(
            breach(&exit, &enforced(false, false, false), stderr, false),
            None
        );
        assert_eq!(
            breach(&ProcessExit::exited(0), &enforced(true, false, false), stderr, false),
            None
        );
    }

    #[test]
    fn container_kill_codes_count_as_signals() {
        // 137 is how the container runtime reports a SIGKILL'd exec.
        let exit = ProcessExit::exited(137);
        assert_eq!(
            classify_breach(
                BackendKind::Container,
                &exit,
                &enforced(true, false, false),
                b"",
                false
            ),
            Some(LimitKind::Memory)
        );
        assert_eq!(
            classify_breach(
                BackendKind::Container,
                &exit,
                &enforced(false, false, false),
                b"",
                false
            ),
            None
        );
        assert_eq!(
            classify_breach(
                BackendKind::Container,
                &ProcessExit::exited(128 + libc::SIGXCPU),
                &enforced(false, true, false),
                b"",
                false
            ),
            Some(LimitKind::CpuTime)
        );
    }

    #[test]
    fn high_exit_codes_are_plain_exits_outside_containers() {
        let limits = enforced(true, true, true);
        for backend in [
            BackendKind::NamespaceSandbox,
            BackendKind::RestrictedInterpreter,
            BackendKind::Unrestricted,
        ] {
            for code in [137, 152, 153] {
                assert_eq!(
                    classify_breach(backend, &ProcessExit::exited(code), &limits, b"", false),
                    None,
                    "{backend} exit {code}"
                );
            }
        }
    }
}
