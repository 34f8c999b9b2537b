//! Forked worker hosting one restricted interpreter run.
//!
//! The worker is a copy of the daemon that never execs. It leads its own
//! process group, dies with the daemon and writes straight into the pipes the
//! daemon reads. Nothing in here logs: another daemon thread may have held
//! the logging locks at fork time.
//!
//! Before user code runs the interpreter is narrowed natively: builtins are
//! cut down to pure computation, `__import__` is replaced by an allowlist
//! guard written in Rust, `sys.modules` is emptied of everything else, and
//! the attributes that lead from an object back to module globals or frames
//! are removed from their types.

#![allow(unsafe_code)]

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow};
use nix::unistd::{dup2, fork, getpid, getppid, pipe2, setpgid, ForkResult, Pid};
use rustpython_vm::builtins::{PyBaseExceptionRef, PyDict, PyInt, PyStr, PyStrRef, PyType};
use rustpython_vm::compiler::Mode;
use rustpython_vm::function::FuncArgs;
use rustpython_vm::{AsObject, Interpreter, Py, PyObjectRef, PyResult, Settings, VirtualMachine};

const SOURCE_PATH: &str = "<sandbox>";

/// Exit code when the interpreter could not be set up.
const SETUP_FAILED: i32 = 70;

/// Modules user code may import.
pub const ALLOWED_MODULES: &[&str] = &[
    "math", "cmath", "random", "string", "re", "json", "time", "datetime", "itertools",
    "functools", "operator", "collections", "heapq", "bisect", "statistics", "fractions",
    "decimal", "textwrap", "unicodedata",
];

/// Builtins kept besides exception classes.
const KEPT_BUILTINS: &[&str] = &[
    "__build_class__", "__name__", "__doc__", "abs", "all", "any", "ascii", "bin", "bool",
    "bytearray", "bytes", "callable", "chr", "classmethod", "complex", "dict", "divmod",
    "enumerate", "filter", "float", "format", "frozenset", "getattr", "hasattr", "hash", "hex",
    "id", "int", "isinstance", "issubclass", "iter", "len", "list", "map", "max", "min", "next",
    "object", "oct", "ord", "pow", "print", "property", "range", "repr", "reversed", "round",
    "set", "slice", "sorted", "staticmethod", "str", "sum", "super", "tuple", "type", "zip",
    "Ellipsis", "NotImplemented",
];

/// What the worker runs.
#[derive(Debug, Clone)]
pub struct WorkerPlan {
    pub code: String,
    /// Per-stream byte ceiling.
    pub output_cap: usize,
    pub cpu_seconds: Option<u64>,
}

/// A running worker as seen from the daemon.
#[derive(Debug)]
pub struct Worker {
    pub pid: Pid,
    pub stdout: OwnedFd,
    pub stderr: OwnedFd,
}

/// Whether `name` may be imported from user code.
pub fn import_allowed(name: &str, level: i32) -> bool {
    let top = name.split('.').next().unwrap_or(name);
    level == 0 && ALLOWED_MODULES.contains(&top)
}

/// Fork a worker for `plan`. The worker keeps the calling thread's stack,
/// so call this from a thread sized for the interpreter.
pub fn fork_worker(plan: &WorkerPlan) -> io::Result<Worker> {
    let (stdout_read, stdout_write) = pipe2(OFlag::O_CLOEXEC)?;
    let (stderr_read, stderr_write) = pipe2(OFlag::O_CLOEXEC)?;
    let daemon = getpid();

    // SAFETY: the child only runs code that owns its data, never returns and
    // ends in `_exit`.
    match unsafe { fork() }? {
        ForkResult::Parent { child } => {
            // Either side may win the race; the later call is a no-op.
            let _ = setpgid(child, child);
            drop(stdout_write);
            drop(stderr_write);
            Ok(Worker {
                pid: child,
                stdout: stdout_read,
                stderr: stderr_read,
            })
        }
        ForkResult::Child => {
            drop(stdout_read);
            drop(stderr_read);
            let code = enter(daemon, plan, stdout_write, stderr_write).unwrap_or(SETUP_FAILED);
            // SAFETY: ends the worker without running the daemon's destructors.
            unsafe { libc::_exit(code) }
        }
    }
}

fn enter(daemon: Pid, plan: &WorkerPlan, stdout: OwnedFd, stderr: OwnedFd) -> io::Result<i32> {
    setpgid(Pid::from_raw(0), Pid::from_raw(0))?;
    // SAFETY: prctl with constant arguments.
    unsafe {
        if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL, 0, 0, 0) == -1 {
            return Err(io::Error::last_os_error());
        }
        if libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    if getppid() != daemon {
        return Ok(SETUP_FAILED);
    }

    // SAFETY: plain disposition changes; the worker has one thread.
    unsafe {
        libc::signal(libc::SIGTERM, libc::SIG_DFL);
        libc::signal(libc::SIGINT, libc::SIG_DFL);
        libc::signal(libc::SIGHUP, libc::SIG_DFL);
    }
    sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)?;

    setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
    setrlimit(Resource::RLIMIT_FSIZE, 0, 0)?;
    if let Some(seconds) = plan.cpu_seconds {
        setrlimit(Resource::RLIMIT_CPU, seconds, seconds + 1)?;
    }

    install_stdio(File::open("/dev/null")?.into(), libc::STDIN_FILENO)?;
    install_stdio(stdout, libc::STDOUT_FILENO)?;
    install_stdio(stderr, libc::STDERR_FILENO)?;
    close_from(3);

    // The default hook writes through std's stderr lock.
    std::panic::set_hook(Box::new(|_| {}));
    let stderr = CappedStream::new(Target::Stderr, plan.output_cap);
    Ok(
        catch_unwind(AssertUnwindSafe(|| execute(&plan.code, plan.output_cap))).unwrap_or_else(|_| {
            stderr.write(b"restricted interpreter panicked\n");
            SETUP_FAILED
        }),
    )
}

/// Put `fd` on `target` and close the original.
fn install_stdio(fd: OwnedFd, target: RawFd) -> io::Result<()> {
    if fd.as_raw_fd() == target {
        let _ = fd.into_raw_fd();
        return Ok(());
    }
    dup2(fd.as_raw_fd(), target)?;
    Ok(())
}

fn close_from(first: u32) {
    // SAFETY: closing descriptors inherited from the daemon.
    unsafe {
        if libc::syscall(libc::SYS_close_range, first, u32::MAX, 0_u32) == 0 {
            return;
        }
        let max = match libc::sysconf(libc::_SC_OPEN_MAX) {
            n if n > 0 => libc::c_int::try_from(n).unwrap_or(4096),
            _ => 4096,
        };
        for fd in libc::c_int::try_from(first).unwrap_or(3)..max {
            libc::close(fd);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Target {
    Stdout,
    Stderr,
}

/// A standard stream that drops everything past its budget.
///
/// The budget is one byte over the cap so the reader can tell the output
/// was cut.
#[derive(Debug)]
struct CappedStream {
    target: Target,
    remaining: AtomicUsize,
}

impl CappedStream {
    fn new(target: Target, cap: usize) -> Self {
        Self {
            target,
            remaining: AtomicUsize::new(cap.saturating_add(1)),
        }
    }

    fn write(&self, data: &[u8]) {
        let allowed = self.remaining.load(Ordering::Relaxed).min(data.len());
        if allowed == 0 {
            return;
        }
        self.remaining.fetch_sub(allowed, Ordering::Relaxed);
        let mut rest = &data[..allowed];
        while !rest.is_empty() {
            let written = match self.target {
                Target::Stdout => nix::unistd::write(io::stdout(), rest),
                Target::Stderr => nix::unistd::write(io::stderr(), rest),
            };
            match written {
                Ok(0) => return,
                Ok(n) => rest = &rest[n..],
                Err(Errno::EINTR) => {}
                Err(_) => return,
            }
        }
    }
}

/// Run `code` on a fresh interpreter and return the worker's exit code.
fn execute(code: &str, output_cap: usize) -> i32 {
    let stdout = Arc::new(CappedStream::new(Target::Stdout, output_cap));
    let stderr = Arc::new(CappedStream::new(Target::Stderr, output_cap));

    let mut settings = Settings::default();
    settings.install_signal_handlers = false;
    settings.isolated = true;
    settings.ignore_environment = true;
    settings.import_site = false;
    let interpreter = Interpreter::with_init(settings, |_| {});

    interpreter.enter(|vm| {
        if let Err(exc) = narrow(vm, &stdout, &stderr) {
            let mut text = String::from("restricted interpreter setup failed: ");
            let _ = vm.write_exception(&mut text, &exc);
            stderr.write(text.as_bytes());
            return SETUP_FAILED;
        }
        match vm.compile(code, Mode::Exec, SOURCE_PATH.to_owned()) {
            Err(e) => {
                stderr.write(format!("SyntaxError: {e}\n").as_bytes());
                1
            }
            Ok(code_obj) => match vm.run_code_obj(code_obj, vm.new_scope_with_builtins()) {
                Ok(_) => 0,
                Err(exc) => exception_exit(vm, &exc, &stderr),
            },
        }
    })
}

fn narrow(vm: &VirtualMachine, stdout: &Arc<CappedStream>, stderr: &Arc<CappedStream>) -> PyResult<()> {
    let sys = &vm.sys_module;
    sys.set_attr("stdout", stream_object(vm, "stdout", Arc::clone(stdout))?, vm)?;
    sys.set_attr("stderr", stream_object(vm, "stderr", Arc::clone(stderr))?, vm)?;
    sys.set_attr("stdin", vm.ctx.none(), vm)?;

    let guard = import_guard(vm)?;
    let builtins = vm.builtins.dict();
    let dropped: Vec<PyObjectRef> = (&builtins)
        .into_iter()
        .filter(|(name, value)| !keeps_builtin(vm, name, value))
        .map(|(name, _)| name)
        .collect();
    for name in dropped {
        builtins.del_item(&*name, vm)?;
    }
    builtins.set_item("__import__", guard, vm)?;

    let modules = sys
        .get_attr("modules", vm)?
        .downcast::<PyDict>()
        .map_err(|_| vm.new_type_error("sys.modules is not a dict".to_owned()))?;
    let unlisted: Vec<PyObjectRef> = (&modules)
        .into_iter()
        .map(|(name, _)| name)
        .filter(|name| {
            !name
                .downcast_ref::<PyStr>()
                .is_some_and(|name| ALLOWED_MODULES.contains(&name.as_str()))
        })
        .collect();
    for name in unlisted {
        modules.del_item(&*name, vm)?;
    }

    hide_introspection(vm);
    Ok(())
}

fn keeps_builtin(vm: &VirtualMachine, name: &PyObjectRef, value: &PyObjectRef) -> bool {
    if name
        .downcast_ref::<PyStr>()
        .is_some_and(|name| KEPT_BUILTINS.contains(&name.as_str()))
    {
        return true;
    }
    value
        .downcast_ref::<PyType>()
        .is_some_and(|ty| ty.fast_issubclass(vm.ctx.exceptions.base_exception_type))
}

/// Native replacement for `__import__`. The original importer is captured
/// here and nowhere reachable from Python.
fn import_guard(vm: &VirtualMachine) -> PyResult<PyObjectRef> {
    let original = vm.builtins.get_attr("__import__", vm)?;
    let guard = vm.new_function(
        "__import__",
        move |args: FuncArgs, vm: &VirtualMachine| -> PyResult {
            let name: PyStrRef = args
                .args
                .first()
                .or_else(|| args.kwargs.get("name"))
                .cloned()
                .ok_or_else(|| vm.new_type_error("__import__() missing argument 'name'".to_owned()))?
                .try_into_value(vm)?;
            let level: i32 = match args.args.get(4).or_else(|| args.kwargs.get("level")) {
                Some(level) => level.clone().try_into_value(vm)?,
                None => 0,
            };
            if !import_allowed(name.as_str(), level) {
                let message = format!("import of '{}' is not allowed", name.as_str());
                return Err(vm.new_import_error(message, name));
            }
            original.call(args, vm)
        },
    );
    Ok(guard.into())
}

/// A module object with `write` and `flush`, enough for `print` and
/// `sys.stdout.write`.
fn stream_object(vm: &VirtualMachine, name: &'static str, stream: Arc<CappedStream>) -> PyResult<PyObjectRef> {
    let dict = vm.ctx.new_dict();
    let write = vm.new_function("write", move |text: PyStrRef| -> usize {
        stream.write(text.as_str().as_bytes());
        text.char_len()
    });
    dict.set_item("write", write.into(), vm)?;
    dict.set_item("flush", vm.new_function("flush", |_: FuncArgs| ()).into(), vm)?;
    Ok(vm.new_module(name, dict, None).into())
}

/// Remove the attributes that reach module globals, frames or every live
/// class.
fn hide_introspection(vm: &VirtualMachine) {
    let types = &vm.ctx.types;
    let hidden: [(&Py<PyType>, &[&str]); 7] = [
        (types.type_type, &["__subclasses__"]),
        (types.function_type, &["__globals__", "__closure__", "__builtins__"]),
        (types.frame_type, &["f_globals", "f_locals", "f_back", "f_builtins"]),
        (types.traceback_type, &["tb_frame"]),
        (types.generator_type, &["gi_frame"]),
        (types.coroutine_type, &["cr_frame"]),
        (types.async_generator, &["ag_frame"]),
    ];
    for (ty, names) in hidden {
        let mut attributes = ty.attributes.write();
        for name in names {
            attributes.shift_remove(&vm.ctx.intern_str(*name));
        }
    }
}

/// Exit code for an uncaught exception; the traceback goes to stderr.
fn exception_exit(vm: &VirtualMachine, exc: &PyBaseExceptionRef, stderr: &CappedStream) -> i32 {
    let mut text = String::new();
    let code = if exc.fast_isinstance(vm.ctx.exceptions.system_exit) {
        system_exit_code(vm, exc, &mut text)
    } else {
        let _ = vm.write_exception(&mut text, exc);
        1
    };
    stderr.write(text.as_bytes());
    code
}

fn system_exit_code(vm: &VirtualMachine, exc: &PyBaseExceptionRef, stderr: &mut String) -> i32 {
    let args = exc.args();
    let Some(arg) = args.as_slice().first() else {
        return 0;
    };
    if vm.is_none(arg) {
        return 0;
    }
    if let Some(int) = arg.payload::<PyInt>() {
        return int.try_to_primitive::<i32>(vm).unwrap_or(1);
    }
    if let Ok(text) = arg.str(vm) {
        stderr.push_str(text.as_str());
        stderr.push('\n');
    }
    1
}
