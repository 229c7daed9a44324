//! Per-architecture syscall domains and machine-context register maps.
//!
//! Two things vary per CPU architecture and both are bit-exact contracts
//! with the kernel:
//!
//! 1. The **syscall-number domain**: which numbers are valid syscalls. On
//!    x86-64 and AArch64 this is a single contiguous range; ARM EABI
//!    additionally has a small "ARM private" range and a ghost syscall
//!    range private to the kernel.
//! 2. The **register map**: which slots of the saved `ucontext_t` hold the
//!    syscall number, instruction pointer, return value, and the six
//!    arguments when a SIGSYS handler runs.
//!
//! Everything architecture-specific in the sandbox funnels through this
//! module; nothing outside it touches `uc_mcontext` directly.

/// Inclusive (low, high) valid syscall-number ranges, ascending.
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub const VALID_RANGES: &[(u32, u32)] = &[(MIN_SYSCALL, MAX_PUBLIC_SYSCALL)];

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub const MIN_SYSCALL: u32 = 0;
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub const MAX_PUBLIC_SYSCALL: u32 = 1024;
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub const MAX_SYSCALL: u32 = MAX_PUBLIC_SYSCALL;

#[cfg(target_arch = "x86_64")]
pub const AUDIT_ARCH: u32 = 0xc000_003e; // AUDIT_ARCH_X86_64
#[cfg(target_arch = "aarch64")]
pub const AUDIT_ARCH: u32 = 0xc000_00b7; // AUDIT_ARCH_AARCH64

// ARM EABI: public syscalls start at __NR_SYSCALL_BASE (0 for EABI), "ARM
// private" syscalls at __ARM_NR_BASE, and the kernel-private cmpxchg ghost
// syscall at __ARM_NR_BASE + 0xfff0.
#[cfg(target_arch = "arm")]
pub const MIN_SYSCALL: u32 = 0;
#[cfg(target_arch = "arm")]
pub const MAX_PUBLIC_SYSCALL: u32 = MIN_SYSCALL + 1024;
#[cfg(target_arch = "arm")]
pub const MIN_PRIVATE_SYSCALL: u32 = 0x0f_0000;
#[cfg(target_arch = "arm")]
pub const MAX_PRIVATE_SYSCALL: u32 = MIN_PRIVATE_SYSCALL + 16;
#[cfg(target_arch = "arm")]
pub const MIN_GHOST_SYSCALL: u32 = MIN_PRIVATE_SYSCALL + 0xfff0;
#[cfg(target_arch = "arm")]
pub const MAX_SYSCALL: u32 = MIN_GHOST_SYSCALL + 4;
#[cfg(target_arch = "arm")]
pub const VALID_RANGES: &[(u32, u32)] = &[
    (MIN_SYSCALL, MAX_PUBLIC_SYSCALL),
    (MIN_PRIVATE_SYSCALL, MAX_PRIVATE_SYSCALL),
    (MIN_GHOST_SYSCALL, MAX_SYSCALL),
];
#[cfg(target_arch = "arm")]
pub const AUDIT_ARCH: u32 = 0x4000_0028; // AUDIT_ARCH_ARM

/// Accessor over the machine context saved for a signal handler.
///
/// The mapping of registers to syscall slots follows the kernel's syscall
/// calling convention for each architecture and must not be changed.
pub struct UContext {
    ctx: *mut libc::ucontext_t,
}

impl UContext {
    /// # Safety
    ///
    /// `ptr` must be the third argument of an `SA_SIGINFO` signal handler,
    /// valid for the duration of that handler invocation.
    #[inline]
    pub unsafe fn from_ptr(ptr: *mut libc::c_void) -> Self {
        Self {
            ctx: ptr.cast::<libc::ucontext_t>(),
        }
    }

    #[cfg(target_arch = "x86_64")]
    #[inline]
    fn greg(&self, reg: libc::c_int) -> i64 {
        unsafe { (*self.ctx).uc_mcontext.gregs[reg as usize] }
    }

    #[cfg(target_arch = "x86_64")]
    pub fn syscall_nr(&self) -> i64 {
        self.greg(libc::REG_RAX)
    }

    #[cfg(target_arch = "x86_64")]
    pub fn instruction_pointer(&self) -> u64 {
        self.greg(libc::REG_RIP) as u64
    }

    /// Syscall argument `n` (1-based, matching the kernel convention).
    #[cfg(target_arch = "x86_64")]
    pub fn arg(&self, n: usize) -> u64 {
        let reg = match n {
            1 => libc::REG_RDI,
            2 => libc::REG_RSI,
            3 => libc::REG_RDX,
            4 => libc::REG_R10,
            5 => libc::REG_R8,
            6 => libc::REG_R9,
            _ => unreachable!("syscall argument index out of range"),
        };
        self.greg(reg) as u64
    }

    #[cfg(target_arch = "x86_64")]
    pub fn set_result(&mut self, rc: i64) {
        unsafe {
            (*self.ctx).uc_mcontext.gregs[libc::REG_RAX as usize] = rc;
        }
    }

    #[cfg(target_arch = "aarch64")]
    pub fn syscall_nr(&self) -> i64 {
        unsafe { (*self.ctx).uc_mcontext.regs[8] as i64 }
    }

    #[cfg(target_arch = "aarch64")]
    pub fn instruction_pointer(&self) -> u64 {
        unsafe { (*self.ctx).uc_mcontext.pc }
    }

    #[cfg(target_arch = "aarch64")]
    pub fn arg(&self, n: usize) -> u64 {
        assert!((1..=6).contains(&n), "syscall argument index out of range");
        unsafe { (*self.ctx).uc_mcontext.regs[n - 1] }
    }

    #[cfg(target_arch = "aarch64")]
    pub fn set_result(&mut self, rc: i64) {
        unsafe {
            (*self.ctx).uc_mcontext.regs[0] = rc as u64;
        }
    }

    #[cfg(target_arch = "arm")]
    pub fn syscall_nr(&self) -> i64 {
        unsafe { i64::from((*self.ctx).uc_mcontext.arm_r7) }
    }

    #[cfg(target_arch = "arm")]
    pub fn instruction_pointer(&self) -> u64 {
        unsafe { u64::from((*self.ctx).uc_mcontext.arm_pc) }
    }

    #[cfg(target_arch = "arm")]
    pub fn arg(&self, n: usize) -> u64 {
        let mc = unsafe { &(*self.ctx).uc_mcontext };
        let v = match n {
            1 => mc.arm_r0,
            2 => mc.arm_r1,
            3 => mc.arm_r2,
            4 => mc.arm_r3,
            5 => mc.arm_r4,
            6 => mc.arm_r5,
            _ => unreachable!("syscall argument index out of range"),
        };
        u64::from(v)
    }

    #[cfg(target_arch = "arm")]
    pub fn set_result(&mut self, rc: i64) {
        unsafe {
            (*self.ctx).uc_mcontext.arm_r0 = rc as libc::c_ulong;
        }
    }
}

#[cfg(all(test, target_arch = "x86_64"))]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn register_map_x86_64() {
        let mut raw: libc::ucontext_t = unsafe { mem::zeroed() };
        raw.uc_mcontext.gregs[libc::REG_RAX as usize] = 39; // getpid
        raw.uc_mcontext.gregs[libc::REG_RIP as usize] = 0x7f00_dead_beef;
        raw.uc_mcontext.gregs[libc::REG_RDI as usize] = 11;
        raw.uc_mcontext.gregs[libc::REG_RSI as usize] = 22;
        raw.uc_mcontext.gregs[libc::REG_RDX as usize] = 33;
        raw.uc_mcontext.gregs[libc::REG_R10 as usize] = 44;
        raw.uc_mcontext.gregs[libc::REG_R8 as usize] = 55;
        raw.uc_mcontext.gregs[libc::REG_R9 as usize] = 66;

        let mut ctx = unsafe { UContext::from_ptr((&mut raw as *mut libc::ucontext_t).cast()) };
        assert_eq!(ctx.syscall_nr(), 39);
        assert_eq!(ctx.instruction_pointer(), 0x7f00_dead_beef);
        assert_eq!(
            (1..=6).map(|n| ctx.arg(n)).collect::<Vec<_>>(),
            vec![11, 22, 33, 44, 55, 66]
        );

        ctx.set_result(-38);
        assert_eq!(raw.uc_mcontext.gregs[libc::REG_RAX as usize], -38);
    }

    #[test]
    fn domain_is_single_range() {
        assert_eq!(VALID_RANGES, &[(0, 1024)]);
    }
}
