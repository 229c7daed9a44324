//! The per-syscall decision model.
//!
//! A policy evaluator returns one [`Decision`] per syscall number:
//! allow, deny with an errno, trap to a userspace handler, or a small
//! decision tree gated by a predicate over one syscall argument.
//! Decisions are immutable once constructed and compare structurally,
//! which is what makes range compression possible.

use libc::c_void;
use trapbox_sys::bpf::{
    ERR_MAX_ERRNO, ERR_MIN_ERRNO, SECCOMP_RET_ACTION, SECCOMP_RET_ALLOW, SECCOMP_RET_DATA,
    SECCOMP_RET_ERRNO, SECCOMP_RET_TRAP, SeccompData,
};

/// A userspace trap handler.
///
/// Runs in signal context and must be async-signal-safe: no heap
/// allocation, no locks, no non-reentrant library calls. It follows the
/// kernel calling convention: errors are reported by returning a value in
/// `-4095..=-1`, never by setting `errno`.
pub type TrapFn = fn(&SeccompData, *mut c_void) -> isize;

/// A policy evaluator: maps a syscall number to a decision. Must be a
/// pure function of its arguments; it is re-evaluated during compilation
/// and verification and the results must agree.
pub type PolicyFn = fn(i32, *mut c_void) -> Decision;

/// A registered trap: handler, auxiliary data, safety flag, and the stable
/// id the compiled filter carries in its return payload.
#[derive(Debug, Clone, Copy)]
pub struct TrapSpec {
    pub fnc: TrapFn,
    pub aux: *mut c_void,
    pub safe: bool,
    pub id: u16,
}

// Function pointers compare unreliably across codegen units, so equality
// is keyed on the registry identity instead of the handler address.
impl PartialEq for TrapSpec {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.aux == other.aux && self.safe == other.safe
    }
}

impl Eq for TrapSpec {}

// TrapSpec crosses into process-lifetime registry storage. The aux pointer
// must stay valid for the rest of the process; see Sandbox::trap.
unsafe impl Send for TrapSpec {}
unsafe impl Sync for TrapSpec {}

/// Comparison operator for an argument predicate. The in-kernel VM can
/// compare for equality or test a bit subset, so that is all we offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    HasBits,
}

/// Predicate over the low 32 bits of one syscall argument, with a decision
/// for each outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgCheck {
    /// Argument index, 0-based.
    pub arg: u8,
    pub op: CmpOp,
    pub value: u32,
    pub passed: Decision,
    pub failed: Decision,
}

/// The action to take for a syscall.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Let the syscall through.
    Allow,
    /// Fail the syscall with this errno.
    Errno(u16),
    /// Hand the syscall to a userspace handler.
    Trap(TrapSpec),
    /// Branch on one argument.
    ArgCheck(Box<ArgCheck>),
}

impl Decision {
    /// Deny with an errno value. Values outside the range the kernel can
    /// return are clamped into the representable payload.
    pub fn errno(err: u16) -> Self {
        debug_assert!((ERR_MIN_ERRNO..=ERR_MAX_ERRNO).contains(&err));
        Decision::Errno(err.min(ERR_MAX_ERRNO))
    }

    pub fn arg_check(arg: u8, op: CmpOp, value: u32, passed: Decision, failed: Decision) -> Self {
        assert!(arg < 6, "syscall argument index out of range");
        Decision::ArgCheck(Box::new(ArgCheck {
            arg,
            op,
            value,
            passed,
            failed,
        }))
    }

    /// The seccomp action word for an unconditional decision.
    ///
    /// `ArgCheck` has no single action; it is compiled into a branch by the
    /// jump-table assembler and resolved by [`Decision::evaluate`].
    pub fn bpf_ret(&self) -> u32 {
        match self {
            Decision::Allow => SECCOMP_RET_ALLOW,
            Decision::Errno(err) => SECCOMP_RET_ERRNO | u32::from(*err),
            Decision::Trap(t) => SECCOMP_RET_TRAP | u32::from(t.id),
            Decision::ArgCheck(_) => {
                unreachable!("argument checks have no single return action")
            }
        }
    }

    /// Resolve this decision to a concrete action word for the given
    /// syscall data, walking argument predicates.
    pub fn evaluate(&self, data: &SeccompData) -> u32 {
        match self {
            Decision::ArgCheck(c) => {
                let arg = data.args[usize::from(c.arg)] as u32;
                let hit = match c.op {
                    CmpOp::Eq => arg == c.value,
                    CmpOp::HasBits => arg & c.value != 0,
                };
                if hit {
                    c.passed.evaluate(data)
                } else {
                    c.failed.evaluate(data)
                }
            }
            other => other.bpf_ret(),
        }
    }

    /// Whether this decision unconditionally denies the syscall (trap or
    /// errno). Argument checks are by definition not unconditional.
    pub fn is_denied(&self) -> bool {
        match self {
            Decision::Allow | Decision::ArgCheck(_) => false,
            Decision::Errno(err) => (ERR_MIN_ERRNO..=ERR_MAX_ERRNO).contains(err),
            Decision::Trap(_) => true,
        }
    }
}

/// Split an action word into its action tag and 16-bit payload.
pub(crate) fn split_action(action: u32) -> (u32, u16) {
    (action & SECCOMP_RET_ACTION, (action & SECCOMP_RET_DATA) as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_trap(_data: &SeccompData, _aux: *mut c_void) -> isize {
        0
    }

    #[test]
    fn encodes_actions() {
        assert_eq!(Decision::Allow.bpf_ret(), SECCOMP_RET_ALLOW);
        assert_eq!(Decision::errno(libc::EPERM as u16).bpf_ret(), SECCOMP_RET_ERRNO | 1);
        let trap = Decision::Trap(TrapSpec {
            fnc: noop_trap,
            aux: std::ptr::null_mut(),
            safe: true,
            id: 7,
        });
        assert_eq!(trap.bpf_ret(), SECCOMP_RET_TRAP | 7);
    }

    #[test]
    fn trap_equality_is_keyed_on_registry_identity() {
        fn other_trap(_data: &SeccompData, _aux: *mut c_void) -> isize {
            1
        }
        let a = TrapSpec {
            fnc: noop_trap,
            aux: std::ptr::null_mut(),
            safe: true,
            id: 3,
        };
        let b = TrapSpec { fnc: other_trap, ..a };
        assert_eq!(a, b);
        let c = TrapSpec { id: 4, ..a };
        assert_ne!(a, c);
    }

    #[test]
    fn denial_classification() {
        assert!(!Decision::Allow.is_denied());
        assert!(Decision::errno(libc::ENOSYS as u16).is_denied());
        assert!(
            Decision::Trap(TrapSpec {
                fnc: noop_trap,
                aux: std::ptr::null_mut(),
                safe: false,
                id: 1,
            })
            .is_denied()
        );
        let cond = Decision::arg_check(0, CmpOp::Eq, 1, Decision::Allow, Decision::errno(1));
        assert!(!cond.is_denied());
    }

    #[test]
    fn arg_check_resolves_per_argument() {
        let d = Decision::arg_check(
            1,
            CmpOp::HasBits,
            0x4,
            Decision::errno(libc::EINVAL as u16),
            Decision::Allow,
        );
        let mut data = SeccompData::default();
        data.args[1] = 0x6;
        assert_eq!(d.evaluate(&data), SECCOMP_RET_ERRNO | libc::EINVAL as u32);
        data.args[1] = 0x2;
        assert_eq!(d.evaluate(&data), SECCOMP_RET_ALLOW);
    }

    #[test]
    fn arg_check_reads_low_half_only() {
        let d = Decision::arg_check(0, CmpOp::Eq, 5, Decision::Allow, Decision::errno(1));
        let mut data = SeccompData::default();
        data.args[0] = 0xdead_beef_0000_0005;
        assert_eq!(d.evaluate(&data), SECCOMP_RET_ALLOW);
    }
}
