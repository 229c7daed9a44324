//! Process termination paths.
//!
//! A sandbox that cannot be set up exactly as requested must not run at
//! all, so every surfaced failure ends the process. Two paths exist: a
//! normal-context one that may use the logger and allocate, and an
//! async-signal-safe one for SIGSYS context that writes the message with
//! a raw `write`. Before the filter is installed both end in `abort`;
//! afterwards they exit through a direct `exit_group`, since libc's abort
//! raises SIGABRT via syscalls the policy may deny.
//!
//! Probe children flip two process-local switches: quiet mode drops the
//! diagnostic (an unsupported kernel is an expected outcome, not an
//! error worth reporting), and simple-exit mode replaces `abort` with
//! `_exit(1)` so the parent sees a plain exit status instead of a
//! signal.

use std::ffi::CStr;
use std::fmt::Arguments;
use std::sync::atomic::{AtomicBool, Ordering};

use trapbox_sys::syscall::raw_syscall;

static QUIET: AtomicBool = AtomicBool::new(false);
static SIMPLE_EXIT: AtomicBool = AtomicBool::new(false);
static FILTER_ACTIVE: AtomicBool = AtomicBool::new(false);

pub(crate) fn set_quiet(quiet: bool) {
    QUIET.store(quiet, Ordering::Relaxed);
}

pub(crate) fn set_simple_exit(simple: bool) {
    SIMPLE_EXIT.store(simple, Ordering::Relaxed);
}

/// Record that a filter is installed; termination switches to direct
/// syscalls from here on.
pub(crate) fn set_filter_active() {
    FILTER_ACTIVE.store(true, Ordering::Relaxed);
}

/// Terminate from normal (non-signal) context with a diagnostic.
pub(crate) fn fail(args: Arguments<'_>) -> ! {
    if !QUIET.load(Ordering::Relaxed) {
        log::error!("{args}");
        eprintln!("sandbox fatal error: {args}");
    }
    die()
}

macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::fatal::fail(format_args!($($arg)*))
    };
}
pub(crate) use fatal;

/// Terminate from signal context. Only raw syscalls, no allocation, no
/// formatting.
pub(crate) fn fatal_in_signal_context(msg: &'static CStr) -> ! {
    if !QUIET.load(Ordering::Relaxed) {
        let bytes = msg.to_bytes();
        unsafe {
            libc::write(libc::STDERR_FILENO, bytes.as_ptr().cast(), bytes.len());
            libc::write(libc::STDERR_FILENO, b"\n".as_ptr().cast(), 1);
        }
    }
    die()
}

fn die() -> ! {
    if SIMPLE_EXIT.load(Ordering::Relaxed) {
        unsafe { libc::_exit(1) }
    }
    if FILTER_ACTIVE.load(Ordering::Relaxed) {
        // libc's abort raises SIGABRT through getpid and tgkill, which the
        // installed policy may deny; it then falls through to a trap
        // instruction and the process dies with SIGSEGV instead. Leave
        // through a direct exit_group, which every policy must allow for
        // the process to function at all.
        raw_syscall(libc::SYS_exit_group as isize, [1, 0, 0, 0, 0, 0]);
    }
    std::process::abort()
}
