//! Raw syscall trampoline with a queryable entry-point sentinel.
//!
//! [`raw_syscall`] issues a syscall without going through libc, returning
//! the kernel-convention result (negative errno on failure, no `errno`
//! side effect). This makes it safe to call from signal context and makes
//! its return value directly usable as a trap handler result.
//!
//! Called with a **negative** syscall number, the trampoline does not trap
//! into the kernel; it instead returns the address of its own
//! kernel-return point. A syscall issued through the trampoline reports
//! exactly this address as its instruction pointer, which is what the
//! escape-hatch comparison in an unsafe-trap filter matches against.

#[cfg(target_arch = "x86_64")]
core::arch::global_asm!(
    ".pushsection .text.trapbox_syscall_raw,\"ax\",@progbits",
    ".globl trapbox_syscall_raw",
    ".hidden trapbox_syscall_raw",
    ".balign 16",
    "trapbox_syscall_raw:",
    // Negative syscall number: hand back the kernel-return address.
    "test edi, edi",
    "js 2f",
    // Shuffle SysV argument registers into the syscall convention.
    "mov rax, rdi",
    "mov rdi, rsi",
    "mov rsi, rdx",
    "mov rdx, rcx",
    "mov r10, r8",
    "mov r8, r9",
    "mov r9, qword ptr [rsp + 8]",
    "syscall",
    "3:",
    "ret",
    "2:",
    "lea rax, [rip + 3b]",
    "ret",
    ".popsection",
);

#[cfg(target_arch = "aarch64")]
core::arch::global_asm!(
    ".pushsection .text.trapbox_syscall_raw,\"ax\",@progbits",
    ".globl trapbox_syscall_raw",
    ".hidden trapbox_syscall_raw",
    ".balign 16",
    "trapbox_syscall_raw:",
    "tbnz w0, #31, 2f",
    "mov x8, x0",
    "mov x0, x1",
    "mov x1, x2",
    "mov x2, x3",
    "mov x3, x4",
    "mov x4, x5",
    "mov x5, x6",
    "svc #0",
    "3:",
    "ret",
    "2:",
    "adr x0, 3b",
    "ret",
    ".popsection",
);

#[cfg(target_arch = "arm")]
core::arch::global_asm!(
    ".pushsection .text.trapbox_syscall_raw,\"ax\",%progbits",
    ".globl trapbox_syscall_raw",
    ".hidden trapbox_syscall_raw",
    ".balign 16",
    "trapbox_syscall_raw:",
    "push {{r4, r5, r6, r7, lr}}",
    "cmp r0, #0",
    "blt 2f",
    "mov r7, r0",
    "mov r0, r1",
    "mov r1, r2",
    "mov r2, r3",
    "ldr r3, [sp, #20]",
    "ldr r4, [sp, #24]",
    "ldr r5, [sp, #28]",
    "svc #0",
    "3:",
    "pop {{r4, r5, r6, r7, pc}}",
    "2:",
    "adr r0, 3b",
    "pop {{r4, r5, r6, r7, pc}}",
    ".popsection",
);

extern "C" {
    fn trapbox_syscall_raw(
        nr: isize,
        a1: isize,
        a2: isize,
        a3: isize,
        a4: isize,
        a5: isize,
        a6: isize,
    ) -> isize;
}

/// Issue `nr` with up to six arguments. Kernel result convention: a value
/// in `-4095..=-1` is a negated errno. Async-signal-safe.
#[inline]
pub fn raw_syscall(nr: isize, args: [isize; 6]) -> isize {
    // SAFETY: the trampoline only traps into the kernel; the caller is
    // responsible for the semantics of the requested syscall.
    unsafe { trapbox_syscall_raw(nr, args[0], args[1], args[2], args[3], args[4], args[5]) }
}

/// The instruction pointer the kernel records for syscalls issued through
/// [`raw_syscall`]. Stable for the lifetime of the process.
#[inline]
pub fn syscall_entry_point() -> u64 {
    unsafe { trapbox_syscall_raw(-1, 0, 0, 0, 0, 0, 0) as u64 }
}
