//! Trap registry and SIGSYS dispatcher.
//!
//! Trap handlers are registered before the filter is installed and looked
//! up from signal context afterwards. Registration is idempotent per
//! `(handler, aux, safe)` triple and hands out dense 16-bit ids starting
//! at 1, since the id travels in the 16-bit payload of the trap action.
//!
//! Storage is process-lifetime: entries are never freed, and every
//! registration publishes a fresh leaked snapshot of the table through a
//! pair of atomics, so the dispatcher can resolve an id without taking a
//! lock while interrupted code may be holding one.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use thiserror::Error;

use trapbox_sys::arch::UContext;
use trapbox_sys::bpf::{ERR_MAX_ERRNO, ERR_MIN_ERRNO, SYS_SECCOMP, SeccompData};
use trapbox_sys::sigsys::SigSysInfo;
use trapbox_sys::syscall::raw_syscall;

use crate::decision::{TrapFn, TrapSpec};
use crate::fatal::fatal_in_signal_context;

#[derive(Debug, Error)]
pub enum TrapError {
    #[error("too many trap handlers; ids must fit the 16-bit action payload")]
    TooManyTraps,
}

type TrapKey = (usize, usize, bool);

struct Inner {
    ids: BTreeMap<TrapKey, u16>,
    traps: Vec<TrapSpec>,
}

static INNER: Mutex<Inner> = Mutex::new(Inner {
    ids: BTreeMap::new(),
    traps: Vec::new(),
});

// Snapshot of the trap table for signal-context lookup. The length is
// published after the pointer; a reader that loads the length first can
// at worst see a newer pointer, and snapshots only ever grow with stable
// indices, so any (ptr, len) pairing it observes is valid.
static TABLE_PTR: AtomicPtr<TrapSpec> = AtomicPtr::new(std::ptr::null_mut());
static TABLE_LEN: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    // Set while an unsafe trap handler runs on this thread; syscalls it
    // makes through the filter are forwarded rather than re-dispatched.
    static IN_UNSAFE_TRAP: Cell<bool> = const { Cell::new(false) };
}

/// Register a trap handler and return its id. Registering the same
/// `(fnc, aux, safe)` triple again returns the existing id.
pub fn register(fnc: TrapFn, aux: *mut libc::c_void, safe: bool) -> Result<TrapSpec, TrapError> {
    let mut inner = INNER.lock().expect("trap registry poisoned");
    let key: TrapKey = (fnc as usize, aux as usize, safe);
    if let Some(&id) = inner.ids.get(&key) {
        return Ok(inner.traps[usize::from(id) - 1]);
    }

    let next = inner.traps.len() + 1;
    if next > usize::from(u16::MAX) {
        return Err(TrapError::TooManyTraps);
    }
    let id = next as u16;
    let spec = TrapSpec { fnc, aux, safe, id };
    inner.traps.push(spec);
    inner.ids.insert(key, id);

    // Leak a snapshot for the lock-free path. Old snapshots stay alive;
    // trap tables are tiny and bounded by the id space.
    let snapshot: &'static [TrapSpec] = Vec::leak(inner.traps.clone());
    TABLE_PTR.store(snapshot.as_ptr().cast_mut(), Ordering::Relaxed);
    TABLE_LEN.store(snapshot.len(), Ordering::Release);

    Ok(spec)
}

/// Whether any registered trap handler is unsafe.
pub fn has_unsafe_traps() -> bool {
    let inner = INNER.lock().expect("trap registry poisoned");
    inner.traps.iter().any(|t| !t.safe)
}

/// Resolve a trap id from signal context. Lock-free.
fn lookup(id: u16) -> Option<TrapSpec> {
    if id == 0 {
        return None;
    }
    let len = TABLE_LEN.load(Ordering::Acquire);
    if usize::from(id) > len {
        return None;
    }
    let ptr = TABLE_PTR.load(Ordering::Relaxed);
    // SAFETY: (ptr, len) is a published snapshot with process lifetime.
    Some(unsafe { *ptr.add(usize::from(id) - 1) })
}

/// Whether the current thread is inside an unsafe trap handler.
pub fn is_in_unsafe_trap() -> bool {
    IN_UNSAFE_TRAP.with(Cell::get)
}

/// Built-in trap handler failing the syscall with the errno smuggled in
/// its aux pointer. Safe to run with the filter active.
pub fn return_errno(_data: &SeccompData, aux: *mut libc::c_void) -> isize {
    let err = (aux as usize) as u16;
    debug_assert!((ERR_MIN_ERRNO..=ERR_MAX_ERRNO).contains(&err));
    -(err.min(ERR_MAX_ERRNO) as isize)
}

/// Built-in trap handler that kills the process; aux points to a static
/// NUL-terminated message. Runs under the installed filter, so it exits
/// through a direct exit_group rather than libc's abort, whose raise can
/// be denied by the policy.
pub fn kill_process(_data: &SeccompData, aux: *mut libc::c_void) -> isize {
    unsafe {
        let msg = aux.cast::<libc::c_char>();
        libc::write(libc::STDERR_FILENO, msg.cast(), libc::strlen(msg));
        libc::write(libc::STDERR_FILENO, b"\n".as_ptr().cast(), 1);
    }
    raw_syscall(libc::SYS_exit_group as isize, [1, 0, 0, 0, 0, 0]);
    std::process::abort()
}

/// Re-issue the syscall described by `data` and return the kernel-style
/// result. Async-signal-safe.
pub fn forward_syscall(data: &SeccompData) -> isize {
    raw_syscall(
        data.nr as isize,
        [
            data.args[0] as isize,
            data.args[1] as isize,
            data.args[2] as isize,
            data.args[3] as isize,
            data.args[4] as isize,
            data.args[5] as isize,
        ],
    )
}

/// The process-wide SIGSYS handler.
///
/// Installed with `SA_SIGINFO | SA_NODEFER` before the filter goes live.
/// Any inconsistency between the kernel-reported syscall record and the
/// saved register state is treated as an attack on the handler and kills
/// the process.
pub(crate) extern "C" fn sigsys_handler(
    signo: libc::c_int,
    info: *mut libc::siginfo_t,
    ucontext: *mut libc::c_void,
) {
    // The handler must leave errno exactly as it found it.
    let saved_errno = unsafe { *libc::__errno_location() };

    if signo != libc::SIGSYS || info.is_null() || ucontext.is_null() {
        fatal_in_signal_context(c"SIGSYS handler invoked for the wrong signal");
    }
    let (si_code, trap_id) = unsafe { ((*info).si_code, (*info).si_errno) };
    if si_code != SYS_SECCOMP {
        fatal_in_signal_context(c"SIGSYS not raised by a seccomp filter");
    }
    let Ok(trap_id) = u16::try_from(trap_id) else {
        fatal_in_signal_context(c"SIGSYS carries an out-of-range trap id");
    };
    let Some(trap) = lookup(trap_id) else {
        fatal_in_signal_context(c"SIGSYS carries an unknown trap id");
    };

    // SAFETY: info comes from an SA_SIGINFO SIGSYS delivery.
    let sigsys = unsafe { SigSysInfo::copy_from(info) };
    // SAFETY: ucontext is the third SA_SIGINFO handler argument.
    let mut ctx = unsafe { UContext::from_ptr(ucontext) };

    // The siginfo record and the saved registers describe the same
    // syscall; a disagreement means the record was forged.
    if sigsys.ip != ctx.instruction_pointer()
        || i64::from(sigsys.nr) != ctx.syscall_nr()
        || sigsys.arch != trapbox_sys::arch::AUDIT_ARCH
    {
        fatal_in_signal_context(c"SIGSYS siginfo disagrees with saved registers");
    }

    let data = SeccompData {
        nr: sigsys.nr,
        arch: sigsys.arch,
        instruction_pointer: sigsys.ip,
        args: [
            ctx.arg(1),
            ctx.arg(2),
            ctx.arg(3),
            ctx.arg(4),
            ctx.arg(5),
            ctx.arg(6),
        ],
    };

    let rc = if !trap.safe && is_in_unsafe_trap() {
        // A syscall made by an unsafe handler trapped again (the escape
        // hatch only covers calls issued through the raw trampoline).
        // Forward it verbatim; clone cannot be replayed because the child
        // would resume inside this handler.
        if i64::from(data.nr) == libc::SYS_clone {
            fatal_in_signal_context(c"refusing to forward clone from an unsafe trap handler");
        }
        forward_syscall(&data)
    } else if trap.safe {
        (trap.fnc)(&data, trap.aux)
    } else {
        IN_UNSAFE_TRAP.with(|flag| flag.set(true));
        let rc = (trap.fnc)(&data, trap.aux);
        IN_UNSAFE_TRAP.with(|flag| flag.set(false));
        rc
    };

    ctx.set_result(rc as i64);
    unsafe {
        *libc::__errno_location() = saved_errno;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trap_a(_data: &SeccompData, _aux: *mut libc::c_void) -> isize {
        0
    }

    fn trap_b(_data: &SeccompData, _aux: *mut libc::c_void) -> isize {
        1
    }

    #[test]
    fn registration_is_idempotent_per_triple() {
        let first = register(trap_a, std::ptr::null_mut(), true).unwrap();
        let again = register(trap_a, std::ptr::null_mut(), true).unwrap();
        assert_eq!(first.id, again.id);

        let other = register(trap_b, std::ptr::null_mut(), true).unwrap();
        assert_ne!(first.id, other.id);

        // A different aux pointer is a different trap.
        let other_aux = register(trap_a, 1usize as *mut libc::c_void, true).unwrap();
        assert_ne!(first.id, other_aux.id);
    }

    #[test]
    fn registered_traps_resolve_from_the_snapshot() {
        let spec = register(trap_b, 7usize as *mut libc::c_void, true).unwrap();
        let found = lookup(spec.id).expect("trap id must resolve");
        assert_eq!(found, spec);
        assert!(lookup(0).is_none());
        assert!(lookup(u16::MAX).is_none());
    }

    #[test]
    fn return_errno_reports_kernel_style() {
        let data = SeccompData::default();
        assert_eq!(
            return_errno(&data, libc::EPERM as usize as *mut libc::c_void),
            -(libc::EPERM as isize)
        );
        assert_eq!(
            return_errno(&data, libc::ENOSYS as usize as *mut libc::c_void),
            -(libc::ENOSYS as isize)
        );
    }

    #[test]
    fn forwarding_reissues_the_syscall() {
        let data = SeccompData {
            nr: libc::SYS_getpid as i32,
            ..Default::default()
        };
        assert_eq!(forward_syscall(&data), unsafe { libc::getpid() } as isize);
    }

    #[test]
    fn unsafe_flag_starts_clear() {
        assert!(!is_in_unsafe_trap());
    }
}
