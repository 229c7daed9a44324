//! Policy compiler: decisions in, filter program out.
//!
//! Compilation proceeds in stages. The policy is evaluated over every
//! representative syscall number and compressed into maximal ranges of
//! identical decisions covering the whole unsigned 32-bit space. The
//! ranges become a balanced binary-search tree of compare-and-branch
//! nodes, prefixed by the architecture check and, on x86-64, a guard
//! against the mixed x32 syscall ABI. If any registered trap handler is
//! unsafe, errno returns are rewritten into safe traps and an escape
//! hatch is prepended that lets syscalls issued through the raw
//! trampoline bypass the filter. The flattened program is then replayed
//! by the verifier before anyone is allowed to install it.

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::CStr;

use libc::c_void;
use thiserror::Error;

use trapbox_sys::arch::AUDIT_ARCH;
use trapbox_sys::bpf::{
    BPF_JEQ, BPF_JGE, BPF_JSET, SECCOMP_DATA_ARCH, SECCOMP_DATA_IP_HI, SECCOMP_DATA_IP_LO,
    SECCOMP_DATA_NR, SECCOMP_RET_ALLOW, SECCOMP_RET_ERRNO, SECCOMP_RET_TRAP, SeccompData,
    SockFilter, seccomp_data_arg_lo,
};
use trapbox_sys::syscall::syscall_entry_point;

use crate::codegen::{CodeGen, CodegenError, NodeId};
use crate::decision::{CmpOp, Decision, PolicyFn, split_action};
use crate::domain;
use crate::trap::{self, TrapError};
use crate::verifier::{self, VerifyError};

/// Syscall numbers with this bit set belong to the x32 ABI and never to
/// the native x86-64 one.
#[cfg(target_arch = "x86_64")]
const X32_ABI_BIT: u32 = 0x4000_0000;

static BAD_ARCH_MSG: &CStr = c"seccomp filter saw a syscall from an unexpected architecture";
#[cfg(target_arch = "x86_64")]
static BAD_ABI_MSG: &CStr = c"seccomp filter saw a syscall from the x32 ABI";

#[derive(Debug, Error)]
pub enum CompileError {
    #[error(
        "policy decides invalid syscall {nr} differently from other invalid numbers; \
         invalid syscalls must share one decision"
    )]
    InconsistentInvalidDecision { nr: i32 },

    #[error("unsafe trap handlers require the policy to allow {0} unconditionally")]
    UnsafeTrapNeedsSyscall(&'static str),

    #[error(transparent)]
    Codegen(#[from] CodegenError),

    #[error(transparent)]
    Trap(#[from] TrapError),

    #[error("compiled filter failed verification: {0}")]
    Verify(#[from] VerifyError),
}

/// A maximal run of syscall numbers sharing one decision. Bounds are
/// inclusive and the list produced by [`find_ranges`] tiles all of u32.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Range {
    pub from: u32,
    pub to: u32,
    pub decision: Decision,
}

pub(crate) struct CompiledProgram {
    pub program: Vec<SockFilter>,
    pub has_unsafe_traps: bool,
}

/// A decision that kills the process with `msg` on its stderr.
pub(crate) fn kill_decision(msg: &'static CStr) -> Result<Decision, TrapError> {
    let spec = trap::register(trap::kill_process, msg.as_ptr().cast_mut().cast(), true)?;
    Ok(Decision::Trap(spec))
}

/// Evaluate `policy` over the representative numbers and compress the
/// results into decision ranges.
pub(crate) fn find_ranges(policy: PolicyFn, aux: *mut c_void) -> Result<Vec<Range>, CompileError> {
    // All invalid numbers must agree with this probe; range compression
    // over gap boundaries is only exact under that assumption.
    let invalid_decision = policy(-1, aux);

    let mut ranges: Vec<Range> = Vec::new();
    for nr in domain::representatives() {
        let decision = policy(nr as i32, aux);
        if !domain::is_valid_syscall_number(nr as i32) && decision != invalid_decision {
            return Err(CompileError::InconsistentInvalidDecision { nr: nr as i32 });
        }
        match ranges.last_mut() {
            Some(last) if last.decision == decision => last.to = nr,
            _ => {
                if let Some(last) = ranges.last_mut() {
                    last.to = nr - 1;
                }
                ranges.push(Range {
                    from: nr,
                    to: nr,
                    decision,
                });
            }
        }
    }
    // The last representative is u32::MAX, so the tiling is closed.
    ranges
        .last_mut()
        .expect("representative list is never empty")
        .to = u32::MAX;
    Ok(ranges)
}

/// Build a balanced binary search over `ranges`; the accumulator holds
/// the syscall number when the returned node runs.
pub(crate) fn assemble_jump_table(gen: &mut CodeGen, ranges: &[Range]) -> NodeId {
    if let [single] = ranges {
        return compile_decision(gen, &single.decision);
    }
    let mid = ranges.len() / 2;
    let low = assemble_jump_table(gen, &ranges[..mid]);
    let high = assemble_jump_table(gen, &ranges[mid..]);
    gen.jump(BPF_JGE, ranges[mid].from, high, low)
}

fn compile_decision(gen: &mut CodeGen, decision: &Decision) -> NodeId {
    match decision {
        Decision::ArgCheck(check) => {
            let passed = compile_decision(gen, &check.passed);
            let failed = compile_decision(gen, &check.failed);
            let op = match check.op {
                CmpOp::Eq => BPF_JEQ,
                CmpOp::HasBits => BPF_JSET,
            };
            let cmp = gen.jump(op, check.value, passed, failed);
            gen.load_abs(seccomp_data_arg_lo(check.arg), cmp)
        }
        other => gen.ret(other.bpf_ret()),
    }
}

/// Rewrite every errno return reachable from `root` into a safe trap
/// through [`trap::return_errno`]. Returns the errno-to-trap-id mapping
/// for the verification oracle.
fn redirect_errno_returns(
    gen: &mut CodeGen,
    root: NodeId,
) -> Result<BTreeMap<u16, u16>, CompileError> {
    let mut payloads = BTreeSet::new();
    gen.traverse(root, |node| {
        let (action, payload) = split_action(node.k);
        if node.jt.is_none() && node.jf.is_none() && action == SECCOMP_RET_ERRNO {
            payloads.insert(payload);
        }
    });

    let mut redirects = BTreeMap::new();
    for errno in payloads {
        let spec = trap::register(trap::return_errno, errno as usize as *mut c_void, true)?;
        redirects.insert(errno, spec.id);
    }

    gen.traverse_mut(root, |node| {
        let (action, payload) = split_action(node.k);
        if node.jt.is_none() && node.jf.is_none() && action == SECCOMP_RET_ERRNO {
            node.k = SECCOMP_RET_TRAP | u32::from(redirects[&payload]);
        }
    });
    Ok(redirects)
}

fn require_allowed(
    policy: PolicyFn,
    aux: *mut c_void,
    nr: libc::c_long,
    name: &'static str,
) -> Result<(), CompileError> {
    if policy(nr as i32, aux) != Decision::Allow {
        return Err(CompileError::UnsafeTrapNeedsSyscall(name));
    }
    Ok(())
}

/// Compile `policy` into a verified filter program.
pub(crate) fn compile(policy: PolicyFn, aux: *mut c_void) -> Result<CompiledProgram, CompileError> {
    let ranges = find_ranges(policy, aux)?;
    // Policies register their traps while being evaluated, so the
    // unsafe-trap question can only be answered after the scan above.
    let has_unsafe_traps = trap::has_unsafe_traps();
    let mut gen = CodeGen::new();
    let jump_table = assemble_jump_table(&mut gen, &ranges);

    let mut redirects = BTreeMap::new();
    if has_unsafe_traps {
        // The handler cannot return, nor the trampoline manage signal
        // masks, unless these stay callable.
        require_allowed(policy, aux, libc::SYS_rt_sigreturn, "rt_sigreturn")?;
        require_allowed(policy, aux, libc::SYS_rt_sigprocmask, "rt_sigprocmask")?;
        #[cfg(target_arch = "arm")]
        {
            require_allowed(policy, aux, libc::SYS_sigreturn, "sigreturn")?;
            require_allowed(policy, aux, libc::SYS_sigprocmask, "sigprocmask")?;
        }
        redirects = redirect_errno_returns(&mut gen, jump_table)?;
    }

    // Everything below the architecture check dispatches on the syscall
    // number, so it begins by loading it.
    #[cfg(target_arch = "x86_64")]
    let after_nr_load = {
        let bad_abi = kill_decision(BAD_ABI_MSG)?;
        let kill = gen.ret(bad_abi.bpf_ret());
        gen.jump(BPF_JSET, X32_ABI_BIT, kill, jump_table)
    };
    #[cfg(not(target_arch = "x86_64"))]
    let after_nr_load = jump_table;
    let nr_dispatch = gen.load_abs(SECCOMP_DATA_NR, after_nr_load);

    let sentinel = syscall_entry_point();
    let body = if has_unsafe_traps {
        // Syscalls issued through the raw trampoline report its return
        // address as their instruction pointer; both halves must match.
        let allow = gen.ret(SECCOMP_RET_ALLOW);
        let hi_cmp = gen.jump(BPF_JEQ, (sentinel >> 32) as u32, allow, nr_dispatch);
        let load_hi = gen.load_abs(SECCOMP_DATA_IP_HI, hi_cmp);
        let lo_cmp = gen.jump(BPF_JEQ, sentinel as u32, load_hi, nr_dispatch);
        gen.load_abs(SECCOMP_DATA_IP_LO, lo_cmp)
    } else {
        nr_dispatch
    };

    let bad_arch = kill_decision(BAD_ARCH_MSG)?;
    let bad_arch_ret = gen.ret(bad_arch.bpf_ret());
    let arch_cmp = gen.jump(BPF_JEQ, AUDIT_ARCH, body, bad_arch_ret);
    let root = gen.load_abs(SECCOMP_DATA_ARCH, arch_cmp);

    let program = gen.compile(root)?;

    if cfg!(debug_assertions) {
        verify_against_policy(&program, policy, aux, has_unsafe_traps, &redirects)?;
    }

    Ok(CompiledProgram {
        program,
        has_unsafe_traps,
    })
}

/// Replay `program` through the verifier and demand that it agrees with
/// the policy for every representative syscall number.
pub(crate) fn verify_against_policy(
    program: &[SockFilter],
    policy: PolicyFn,
    aux: *mut c_void,
    has_unsafe_traps: bool,
    redirects: &BTreeMap<u16, u16>,
) -> Result<(), CompileError> {
    let sentinel = syscall_entry_point();
    let expected = |data: &SeccompData| -> u32 {
        #[cfg(target_arch = "x86_64")]
        if data.nr as u32 & X32_ABI_BIT != 0 {
            let bad_abi = kill_decision(BAD_ABI_MSG).expect("kill trap already registered");
            return bad_abi.bpf_ret();
        }
        if has_unsafe_traps && data.instruction_pointer == sentinel {
            return SECCOMP_RET_ALLOW;
        }
        let action = policy(data.nr, aux).evaluate(data);
        if has_unsafe_traps {
            let (act, payload) = split_action(action);
            if act == SECCOMP_RET_ERRNO {
                let id = redirects
                    .get(&payload)
                    .expect("errno payload registered during rewrite");
                return SECCOMP_RET_TRAP | u32::from(*id);
            }
        }
        action
    };
    verifier::verify(program, AUDIT_ARCH, expected)?;
    Ok(())
}
