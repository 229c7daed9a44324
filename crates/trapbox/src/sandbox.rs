//! The sandbox lifecycle: policy registration, support probing, and the
//! irreversible switch to filtered mode.
//!
//! All state is process-global, mirroring the kernel resource it guards:
//! one policy, one SIGSYS handler, one filter. Setup is expected to run
//! on the main thread while the process is still single-threaded; every
//! misuse and every setup failure terminates the process, because a
//! partially sandboxed process is worse than a dead one.
//!
//! Support detection forks disposable children. Each child installs a
//! known policy over a stderr pipe and reports through its exit code;
//! the second child exercises a vsyscall-backed call to catch kernels
//! whose seccomp patches break the vsyscall page.

use std::ffi::CStr;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::sync::Mutex;

use libc::c_void;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::Pid;
use rustix::fs::{Mode, OFlags, fstat, openat};
use rustix::pipe::{PipeFlags, pipe_with};
use thiserror::Error;

use trapbox_sys::bpf::{
    BPF_MAXINSNS, SECCOMP_SET_MODE_FILTER, SeccompData, SockFilter, SockFprog,
};
use trapbox_sys::last_errno;

use crate::compiler::{self, CompileError};
use crate::decision::{Decision, PolicyFn, TrapFn};
use crate::domain;
use crate::fatal::fatal;
use crate::trap;

/// Exit code a probe child must report for the probe to count as a pass.
const EXPECTED_EXIT_CODE: i32 = 100;

/// Where the sandbox stands for this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxStatus {
    /// Support has not been determined yet.
    Unknown,
    /// The kernel cannot run the sandbox; this never changes back.
    Unsupported,
    /// Supported, but currently blocked (the process grew threads).
    Unavailable,
    /// Supported and startable right now.
    Available,
    /// The filter is installed. Terminal.
    Enabled,
}

#[derive(Clone, Copy)]
struct PolicyEntry {
    policy: PolicyFn,
    aux: *mut c_void,
}

// The aux pointer is owned by the caller for the life of the process.
unsafe impl Send for PolicyEntry {}

struct State {
    status: SandboxStatus,
    policy: Option<PolicyEntry>,
    proc_fd: Option<OwnedFd>,
}

static STATE: Mutex<State> = Mutex::new(State {
    status: SandboxStatus::Unknown,
    policy: None,
    proc_fd: None,
});

#[derive(Debug, Error)]
enum SandboxError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("failed to install the SIGSYS handler: {0}")]
    Signal(#[from] nix::Error),

    #[error("failed to set no-new-privs: {0}")]
    NoNewPrivs(rustix::io::Errno),

    #[error("kernel rejected the seccomp filter: {0}")]
    Filter(rustix::io::Errno),
}

/// Entry points for configuring and starting the seccomp sandbox.
///
/// The underlying state is process-wide; the type only namespaces the
/// operations.
pub struct Sandbox;

impl Sandbox {
    /// Determine (and cache) whether the sandbox can run here.
    ///
    /// `proc_fd` is an open directory fd for `/proc`, used to count the
    /// process's threads; without one the process is assumed to be
    /// single-threaded. A cached `Available` flips to `Unavailable` when
    /// threads have appeared, and back once they are gone.
    pub fn supports_seccomp_sandbox(proc_fd: Option<BorrowedFd<'_>>) -> SandboxStatus {
        {
            let mut state = Self::lock();
            match state.status {
                SandboxStatus::Enabled | SandboxStatus::Unsupported => return state.status,
                SandboxStatus::Available => {
                    if is_single_threaded(proc_fd) {
                        return SandboxStatus::Available;
                    }
                    state.status = SandboxStatus::Unavailable;
                    return SandboxStatus::Unavailable;
                }
                SandboxStatus::Unavailable => {
                    if !is_single_threaded(proc_fd) {
                        return SandboxStatus::Unavailable;
                    }
                    // Single-threaded again; re-run the probes below.
                    state.status = SandboxStatus::Unknown;
                }
                SandboxStatus::Unknown => {}
            }
        }

        // Probe without holding the lock: the children reset their own
        // copy of the state and must be able to take it.
        let supported = run_probe(probe_policy, probe_process)
            && run_probe(allow_all_policy, try_vsyscall_process);

        let mut state = Self::lock();
        state.status = if !supported {
            SandboxStatus::Unsupported
        } else if is_single_threaded(proc_fd) {
            SandboxStatus::Available
        } else {
            SandboxStatus::Unavailable
        };
        state.status
    }

    /// Hand the sandbox an open `/proc` fd for its own thread checks.
    /// Closed again before the filter is installed.
    pub fn set_proc_fd(proc_fd: OwnedFd) {
        Self::lock().proc_fd = Some(proc_fd);
    }

    /// Register the policy. Exactly one policy per process; a second
    /// registration, a non-pure evaluator, or one that fails to deny
    /// invalid syscall numbers is fatal.
    pub fn set_sandbox_policy(policy: PolicyFn, aux: *mut c_void) {
        // Invalid numbers share one decision (checked at compile time);
        // here we insist that decision actually denies.
        for nr in domain::invalid_representatives() {
            if !policy(nr as i32, aux).is_denied() {
                fatal!("policy fails to deny invalid syscall number {}", nr as i32);
            }
        }

        let mut state = Self::lock();
        if state.status == SandboxStatus::Enabled {
            fatal!("policy cannot change once the sandbox is enabled");
        }
        if state.policy.is_some() {
            fatal!("only one policy per process is supported");
        }
        state.policy = Some(PolicyEntry { policy, aux });
    }

    /// Compile, verify, and install the filter. Irreversible; fatal on
    /// any precondition or kernel failure.
    pub fn start_sandbox() {
        let (entry, proc_fd) = {
            let mut state = Self::lock();
            match state.status {
                SandboxStatus::Unsupported | SandboxStatus::Unavailable => {
                    fatal!("the seccomp sandbox is not supported on this system")
                }
                SandboxStatus::Enabled => fatal!("the sandbox can only be started once"),
                _ => {}
            }
            let Some(entry) = state.policy else {
                fatal!("cannot start the sandbox without a policy")
            };
            (entry, state.proc_fd.take())
        };

        if !is_single_threaded(proc_fd.as_ref().map(AsFd::as_fd)) {
            fatal!("the sandbox may only be started while the process is single-threaded");
        }
        // The fd must not outlive setup; the policy may well forbid close.
        drop(proc_fd);

        if let Err(err) = install(entry) {
            fatal!("failed to start the seccomp sandbox: {err}");
        }

        Self::lock().status = SandboxStatus::Enabled;
    }

    /// A decision that hands the syscall to `fnc` in a SIGSYS handler.
    /// The handler must be async-signal-safe.
    pub fn trap(fnc: TrapFn, aux: *mut c_void) -> Decision {
        Self::make_trap(fnc, aux, true)
    }

    /// Like [`Sandbox::trap`], but the handler may make arbitrary
    /// syscalls itself. This defeats the sandbox for anyone who can
    /// corrupt the process; only ever use it for debugging.
    pub fn unsafe_trap(fnc: TrapFn, aux: *mut c_void) -> Decision {
        Self::make_trap(fnc, aux, false)
    }

    /// A decision that kills the process, writing `msg` to stderr first.
    pub fn kill_process(msg: &'static CStr) -> Decision {
        match compiler::kill_decision(msg) {
            Ok(decision) => decision,
            Err(err) => fatal!("{err}"),
        }
    }

    /// Re-issue a trapped syscall and return the kernel-style result.
    /// Intended for trap handlers that inspect and then pass through.
    pub fn forward_syscall(data: &SeccompData) -> isize {
        trap::forward_syscall(data)
    }

    pub fn status() -> SandboxStatus {
        Self::lock().status
    }

    fn make_trap(fnc: TrapFn, aux: *mut c_void, safe: bool) -> Decision {
        if Self::status() == SandboxStatus::Enabled {
            fatal!("trap handlers cannot be registered once the filter is installed");
        }
        match trap::register(fnc, aux, safe) {
            Ok(spec) => Decision::Trap(spec),
            Err(err) => fatal!("{err}"),
        }
    }

    fn lock() -> std::sync::MutexGuard<'static, State> {
        STATE.lock().expect("sandbox state poisoned")
    }
}

/// Count threads via `/proc`: the `self/task` directory has one link per
/// thread plus `.` and `..`. Without a proc fd the check is skipped.
fn is_single_threaded(proc_fd: Option<BorrowedFd<'_>>) -> bool {
    let Some(proc_fd) = proc_fd else {
        return true;
    };
    let Ok(task) = openat(
        proc_fd,
        "self/task",
        OFlags::RDONLY | OFlags::DIRECTORY | OFlags::CLOEXEC,
        Mode::empty(),
    ) else {
        return false;
    };
    match fstat(&task) {
        Ok(st) => st.st_nlink == 3,
        Err(_) => false,
    }
}

fn install(entry: PolicyEntry) -> Result<(), SandboxError> {
    // The handler must be in place before the first trap can fire, and
    // SIGSYS must be deliverable even inside other handlers.
    let action = SigAction::new(
        SigHandler::SigAction(trap::sigsys_handler),
        SaFlags::SA_SIGINFO | SaFlags::SA_NODEFER,
        SigSet::empty(),
    );
    unsafe { signal::sigaction(Signal::SIGSYS, &action)? };
    let mut sigsys = SigSet::empty();
    sigsys.add(Signal::SIGSYS);
    signal::sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&sigsys), None)?;

    let compiled = compiler::compile(entry.policy, entry.aux)?;
    let len = compiled.program.len();
    if compiled.has_unsafe_traps {
        log::warn!("filter compiled with unsafe trap escape hatch; debugging builds only");
    }

    // Move the program onto the stack and release all heap state before
    // the filter goes live.
    let mut stack_program = [SockFilter::default(); BPF_MAXINSNS];
    stack_program[..len].copy_from_slice(&compiled.program);
    drop(compiled);
    let prog = SockFprog {
        len: len as u16,
        filter: stack_program.as_ptr(),
    };

    unsafe {
        if libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1u64, 0u64, 0u64, 0u64) != 0 {
            return Err(SandboxError::NoNewPrivs(last_errno()));
        }
        if libc::syscall(
            libc::SYS_seccomp,
            SECCOMP_SET_MODE_FILTER,
            0u32,
            &prog as *const SockFprog,
        ) != 0
        {
            return Err(SandboxError::Filter(last_errno()));
        }
    }
    crate::fatal::set_filter_active();
    log::info!("seccomp-bpf filter installed ({len} instructions)");
    Ok(())
}

/// Fork a child, sandbox it under `policy`, and run `child_fn` in it.
/// Passes when the child exits with [`EXPECTED_EXIT_CODE`]; anything the
/// child manages to write to stderr is fatal in the parent.
fn run_probe(policy: PolicyFn, child_fn: fn() -> i32) -> bool {
    // Signals stay blocked across the fork so no inherited handler runs
    // in the half-set-up child.
    let all = SigSet::all();
    let mut old = SigSet::empty();
    if signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&all), Some(&mut old)).is_err() {
        fatal!("failed to block signals around the sandbox probe");
    }
    let (read_end, write_end) = match pipe_with(PipeFlags::CLOEXEC | PipeFlags::NONBLOCK) {
        Ok(pipe) => pipe,
        Err(err) => fatal!("failed to create the probe pipe: {err}"),
    };

    let pid = unsafe { libc::fork() };
    if pid < 0 {
        fatal!("failed to fork the sandbox probe child: {}", last_errno());
    }
    if pid == 0 {
        // Expected failures (an unsupported kernel) must not spam the
        // parent's stderr, and the parent keys off the exit status.
        crate::fatal::set_quiet(true);
        crate::fatal::set_simple_exit(true);
        unsafe {
            libc::dup2(write_end.as_raw_fd(), libc::STDERR_FILENO);
        }
        drop(read_end);
        {
            let mut state = Sandbox::lock();
            state.status = SandboxStatus::Unknown;
            state.policy = None;
            state.proc_fd = None;
        }
        Sandbox::set_sandbox_policy(policy, std::ptr::null_mut());
        Sandbox::start_sandbox();
        unsafe { libc::_exit(child_fn()) }
    }

    drop(write_end);
    if signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&old), None).is_err() {
        fatal!("failed to restore the signal mask after the sandbox probe");
    }

    let status = loop {
        match waitpid(Pid::from_raw(pid), None) {
            Err(nix::errno::Errno::EINTR) => continue,
            other => break other,
        }
    };
    let passed = matches!(status, Ok(WaitStatus::Exited(_, code)) if code == EXPECTED_EXIT_CODE);

    let mut message = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match rustix::io::read(&read_end, &mut buf) {
            Ok(0) => break,
            Ok(n) => message.extend_from_slice(&buf[..n]),
            Err(rustix::io::Errno::INTR) => continue,
            Err(_) => break,
        }
    }
    if !message.is_empty() {
        fatal!(
            "sandbox probe child failed: {}",
            String::from_utf8_lossy(&message).trim_end()
        );
    }
    passed
}

/// Probe policy: one errno rule, one allow rule, deny the rest.
fn probe_policy(nr: i32, _aux: *mut c_void) -> Decision {
    match i64::from(nr) {
        n if n == libc::SYS_getpid => Decision::errno(libc::EPERM as u16),
        n if n == libc::SYS_exit_group => Decision::Allow,
        _ => Decision::errno(libc::EINVAL as u16),
    }
}

fn probe_process() -> i32 {
    // The filter must turn getpid into EPERM without touching anything
    // else this child needs to exit.
    let rc = trapbox_sys::syscall::raw_syscall(libc::SYS_getpid as isize, [0; 6]);
    if rc == -(libc::EPERM as isize) {
        EXPECTED_EXIT_CODE
    } else {
        1
    }
}

fn allow_all_policy(nr: i32, _aux: *mut c_void) -> Decision {
    if domain::is_valid_syscall_number(nr) {
        Decision::Allow
    } else {
        Decision::errno(libc::ENOSYS as u16)
    }
}

fn try_vsyscall_process() -> i32 {
    // Some distribution kernels shipped seccomp patches that crash the
    // process on vsyscall-page entry points even under an allow-all
    // filter. glibc routes time() through that page where it exists.
    let t = unsafe { libc::time(std::ptr::null_mut()) };
    if t > 0 { EXPECTED_EXIT_CODE } else { 1 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_proc_fd_assumes_single_threaded() {
        assert!(is_single_threaded(None));
    }

    #[test]
    fn proc_fd_counts_this_test_runner_as_threaded() {
        // The test harness runs tests on worker threads, so the link
        // count of /proc/self/task exceeds 3 here.
        let proc_dir = rustix::fs::open(
            "/proc",
            OFlags::RDONLY | OFlags::DIRECTORY | OFlags::CLOEXEC,
            Mode::empty(),
        )
        .unwrap();
        assert!(!is_single_threaded(Some(proc_dir.as_fd())));
    }

    #[test]
    fn probe_policies_deny_what_they_do_not_know() {
        for nr in domain::invalid_representatives() {
            assert!(probe_policy(nr as i32, std::ptr::null_mut()).is_denied());
            assert!(allow_all_policy(nr as i32, std::ptr::null_mut()).is_denied());
        }
        assert_eq!(
            probe_policy(libc::SYS_exit_group as i32, std::ptr::null_mut()),
            Decision::Allow
        );
    }
}
