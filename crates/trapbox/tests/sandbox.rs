//! End-to-end tests against a real installed filter.
//!
//! Installing a filter is irreversible for the calling process, so every
//! scenario runs in a forked child and the parent asserts on the child's
//! exit status. Children signal success by exiting 0. Fork-based tests
//! share one lock so no two of them interleave their global sandbox
//! state.

use std::sync::Mutex;

use libc::c_void;
use trapbox::{Decision, Sandbox, SandboxStatus, SeccompData, is_valid_syscall_number};
use trapbox_sys::syscall::raw_syscall;

static TEST_LOCK: Mutex<()> = Mutex::new(());

#[derive(Debug, PartialEq, Eq)]
enum ChildOutcome {
    Exited(i32),
    Signaled(i32),
}

/// Fork, run `child` in the child process, and report how it ended.
fn run_child(child: fn() -> i32) -> ChildOutcome {
    let _guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let pid = unsafe { libc::fork() };
    assert!(pid >= 0, "fork failed");
    if pid == 0 {
        unsafe { libc::_exit(child()) }
    }

    let mut status = 0;
    loop {
        let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
        if rc == pid {
            break;
        }
        assert_eq!(
            unsafe { *libc::__errno_location() },
            libc::EINTR,
            "waitpid failed"
        );
    }
    if libc::WIFEXITED(status) {
        ChildOutcome::Exited(libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        ChildOutcome::Signaled(libc::WTERMSIG(status))
    } else {
        panic!("unexpected wait status {status:#x}");
    }
}

fn sandbox_available() -> bool {
    let _guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    Sandbox::supports_seccomp_sandbox(None) == SandboxStatus::Available
}

macro_rules! require_sandbox {
    () => {
        if !sandbox_available() {
            eprintln!("seccomp sandbox not available on this kernel; skipping");
            return;
        }
    };
}

fn deny_invalid(nr: i32) -> Decision {
    if is_valid_syscall_number(nr) {
        Decision::Allow
    } else {
        Decision::errno(libc::ENOSYS as u16)
    }
}

// An errno rule really fails the syscall with that errno.

fn block_getpid_policy(nr: i32, _aux: *mut c_void) -> Decision {
    if nr == libc::SYS_getpid as i32 {
        Decision::errno(libc::EPERM as u16)
    } else {
        deny_invalid(nr)
    }
}

fn errno_child() -> i32 {
    Sandbox::set_sandbox_policy(block_getpid_policy, std::ptr::null_mut());
    Sandbox::start_sandbox();
    if raw_syscall(libc::SYS_getpid as isize, [0; 6]) != -(libc::EPERM as isize) {
        return 1;
    }
    // Everything else still works.
    if raw_syscall(libc::SYS_getppid as isize, [0; 6]) <= 0 {
        return 2;
    }
    0
}

#[test]
fn errno_rules_fail_the_syscall() {
    require_sandbox!();
    assert_eq!(run_child(errno_child), ChildOutcome::Exited(0));
}

// A safe trap handler runs in signal context and its return value becomes
// the syscall result.

fn fixed_result_handler(_data: &SeccompData, _aux: *mut c_void) -> isize {
    4242
}

fn trap_policy(nr: i32, _aux: *mut c_void) -> Decision {
    if nr == libc::SYS_getppid as i32 {
        Sandbox::trap(fixed_result_handler, std::ptr::null_mut())
    } else {
        deny_invalid(nr)
    }
}

fn trap_child() -> i32 {
    Sandbox::set_sandbox_policy(trap_policy, std::ptr::null_mut());
    Sandbox::start_sandbox();
    if raw_syscall(libc::SYS_getppid as isize, [0; 6]) == 4242 {
        0
    } else {
        1
    }
}

#[test]
fn safe_trap_result_becomes_the_syscall_result() {
    require_sandbox!();
    assert_eq!(run_child(trap_child), ChildOutcome::Exited(0));
}

// Trap handlers see the trapped syscall's arguments.

fn echo_arg_handler(data: &SeccompData, _aux: *mut c_void) -> isize {
    data.args[1] as isize
}

fn echo_policy(nr: i32, _aux: *mut c_void) -> Decision {
    if nr == libc::SYS_tgkill as i32 {
        Sandbox::trap(echo_arg_handler, std::ptr::null_mut())
    } else {
        deny_invalid(nr)
    }
}

fn echo_child() -> i32 {
    Sandbox::set_sandbox_policy(echo_policy, std::ptr::null_mut());
    Sandbox::start_sandbox();
    if raw_syscall(libc::SYS_tgkill as isize, [0, 777, 0, 0, 0, 0]) == 777 {
        0
    } else {
        1
    }
}

#[test]
fn trap_handlers_observe_syscall_arguments() {
    require_sandbox!();
    assert_eq!(run_child(echo_child), ChildOutcome::Exited(0));
}

// An unsafe trap handler may issue syscalls through the raw trampoline;
// the escape hatch lets them through untouched. The outer call goes
// through libc so it hits the filter; only the handler's call rides the
// trampoline.

fn escape_hatch_handler(_data: &SeccompData, _aux: *mut c_void) -> isize {
    raw_syscall(libc::SYS_getpid as isize, [0; 6])
}

fn unsafe_trap_policy(nr: i32, _aux: *mut c_void) -> Decision {
    if nr == libc::SYS_getppid as i32 {
        Sandbox::unsafe_trap(escape_hatch_handler, std::ptr::null_mut())
    } else {
        deny_invalid(nr)
    }
}

fn escape_hatch_child() -> i32 {
    let my_pid = unsafe { libc::getpid() } as libc::c_long;
    Sandbox::set_sandbox_policy(unsafe_trap_policy, std::ptr::null_mut());
    Sandbox::start_sandbox();
    // getppid traps; the handler answers with the pid fetched through the
    // trampoline, proving the fetch bypassed the filter.
    if unsafe { libc::syscall(libc::SYS_getppid) } == my_pid {
        0
    } else {
        1
    }
}

#[test]
fn unsafe_traps_can_syscall_through_the_trampoline() {
    require_sandbox!();
    assert_eq!(run_child(escape_hatch_child), ChildOutcome::Exited(0));
}

// A syscall an unsafe handler makes through the ordinary path traps again
// and is forwarded instead of re-dispatched.

fn nested_handler(_data: &SeccompData, _aux: *mut c_void) -> isize {
    unsafe { libc::syscall(libc::SYS_getppid) as isize }
}

fn nested_policy(nr: i32, _aux: *mut c_void) -> Decision {
    if nr == libc::SYS_getppid as i32 {
        Sandbox::unsafe_trap(nested_handler, std::ptr::null_mut())
    } else {
        deny_invalid(nr)
    }
}

fn nested_child() -> i32 {
    let real_ppid = unsafe { libc::getppid() } as libc::c_long;
    Sandbox::set_sandbox_policy(nested_policy, std::ptr::null_mut());
    Sandbox::start_sandbox();
    // The outer getppid traps; the handler's own getppid traps again and
    // is forwarded, so the real answer comes back through two dispatches.
    if unsafe { libc::syscall(libc::SYS_getppid) } == real_ppid {
        0
    } else {
        1
    }
}

#[test]
fn nested_unsafe_syscalls_are_forwarded() {
    require_sandbox!();
    assert_eq!(run_child(nested_child), ChildOutcome::Exited(0));
}

// With unsafe traps in play, errno rules still produce their errno; they
// travel through a rewritten safe trap rather than a kernel errno return.

fn mixed_policy(nr: i32, _aux: *mut c_void) -> Decision {
    if nr == libc::SYS_getppid as i32 {
        Sandbox::unsafe_trap(escape_hatch_handler, std::ptr::null_mut())
    } else if nr == libc::SYS_getpid as i32 {
        Decision::errno(libc::EPERM as u16)
    } else {
        deny_invalid(nr)
    }
}

fn mixed_child() -> i32 {
    Sandbox::set_sandbox_policy(mixed_policy, std::ptr::null_mut());
    Sandbox::start_sandbox();
    // Through libc the rewritten rule traps, the handler reports -EPERM,
    // and the wrapper turns that into errno.
    let rc = unsafe { libc::syscall(libc::SYS_getpid) };
    if rc == -1 && unsafe { *libc::__errno_location() } == libc::EPERM {
        0
    } else {
        1
    }
}

#[test]
fn errno_rules_survive_the_unsafe_trap_rewrite() {
    require_sandbox!();
    assert_eq!(run_child(mixed_child), ChildOutcome::Exited(0));
}

// Argument predicates gate a syscall on one argument value.

fn ioctl_policy(nr: i32, _aux: *mut c_void) -> Decision {
    if nr == libc::SYS_ioctl as i32 {
        Decision::arg_check(
            1,
            trapbox::CmpOp::Eq,
            libc::TIOCGWINSZ as u32,
            Decision::Allow,
            Decision::errno(libc::EPERM as u16),
        )
    } else {
        deny_invalid(nr)
    }
}

fn ioctl_child() -> i32 {
    Sandbox::set_sandbox_policy(ioctl_policy, std::ptr::null_mut());
    Sandbox::start_sandbox();
    // The blocked request never reaches the kernel.
    if raw_syscall(
        libc::SYS_ioctl as isize,
        [0, libc::TIOCSTI as isize, 0, 0, 0, 0],
    ) != -(libc::EPERM as isize)
    {
        return 1;
    }
    // The allowed request does; whatever fd 0 is, the kernel answers for
    // itself rather than with the policy's EPERM.
    let mut ws = [0u8; 8];
    let rc = raw_syscall(
        libc::SYS_ioctl as isize,
        [
            0,
            libc::TIOCGWINSZ as isize,
            ws.as_mut_ptr() as isize,
            0,
            0,
            0,
        ],
    );
    if rc == -(libc::EPERM as isize) {
        return 2;
    }
    0
}

#[test]
fn argument_predicates_gate_individual_requests() {
    require_sandbox!();
    assert_eq!(run_child(ioctl_child), ChildOutcome::Exited(0));
}

// Status transitions.

fn status_child() -> i32 {
    if Sandbox::status() != SandboxStatus::Available {
        return 1;
    }
    Sandbox::set_sandbox_policy(block_getpid_policy, std::ptr::null_mut());
    Sandbox::start_sandbox();
    if Sandbox::status() != SandboxStatus::Enabled {
        return 2;
    }
    // Enabled is terminal, whatever the probe would say now.
    if Sandbox::supports_seccomp_sandbox(None) != SandboxStatus::Enabled {
        return 3;
    }
    0
}

#[test]
fn enabling_the_sandbox_is_terminal() {
    require_sandbox!();
    assert_eq!(run_child(status_child), ChildOutcome::Exited(0));
}

// Misuse is fatal, not recoverable.

fn silence_stderr() {
    unsafe {
        let null = libc::open(c"/dev/null".as_ptr(), libc::O_WRONLY);
        if null >= 0 {
            libc::dup2(null, libc::STDERR_FILENO);
        }
    }
}

fn double_policy_child() -> i32 {
    silence_stderr();
    Sandbox::set_sandbox_policy(block_getpid_policy, std::ptr::null_mut());
    Sandbox::set_sandbox_policy(block_getpid_policy, std::ptr::null_mut());
    0
}

#[test]
fn registering_two_policies_aborts() {
    assert_eq!(
        run_child(double_policy_child),
        ChildOutcome::Signaled(libc::SIGABRT)
    );
}

fn start_without_policy_child() -> i32 {
    silence_stderr();
    Sandbox::start_sandbox();
    0
}

#[test]
fn starting_without_a_policy_aborts() {
    assert_eq!(
        run_child(start_without_policy_child),
        ChildOutcome::Signaled(libc::SIGABRT)
    );
}

fn allow_everything(_nr: i32, _aux: *mut c_void) -> Decision {
    Decision::Allow
}

fn permissive_policy_child() -> i32 {
    silence_stderr();
    // Allowing invalid syscall numbers must be rejected at registration.
    Sandbox::set_sandbox_policy(allow_everything, std::ptr::null_mut());
    0
}

#[test]
fn policies_that_allow_invalid_numbers_abort() {
    assert_eq!(
        run_child(permissive_policy_child),
        ChildOutcome::Signaled(libc::SIGABRT)
    );
}

fn double_start_child() -> i32 {
    silence_stderr();
    Sandbox::set_sandbox_policy(block_getpid_policy, std::ptr::null_mut());
    Sandbox::start_sandbox();
    Sandbox::start_sandbox();
    0
}

// Once the filter is live, fatal paths cannot rely on libc's abort (the
// policy denies getpid, which abort needs to raise SIGABRT); they leave
// through a direct exit_group instead.
#[test]
fn starting_twice_is_fatal() {
    require_sandbox!();
    assert_eq!(run_child(double_start_child), ChildOutcome::Exited(1));
}
