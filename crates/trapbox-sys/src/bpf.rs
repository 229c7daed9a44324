//! Classic-BPF instruction encoding and the seccomp kernel ABI.
//!
//! A seccomp filter is a flat vector of fixed-width [`SockFilter`]
//! instructions interpreted by the in-kernel VM for every syscall. The VM
//! reads fields out of a [`SeccompData`] record (syscall number,
//! architecture id, instruction pointer, six arguments) and ends with a
//! return instruction whose 32-bit payload selects the action; for
//! errno/trap actions the low 16 bits carry the error code or trap id.

// Seccomp syscall operation and filter mode
pub const SECCOMP_SET_MODE_FILTER: u32 = 1;
pub const SECCOMP_MODE_FILTER: i32 = 2;

// Seccomp return actions. The low 16 bits (SECCOMP_RET_DATA) carry the
// errno value or trap id for the ERRNO/TRAP actions.
pub const SECCOMP_RET_KILL: u32 = 0x0000_0000;
pub const SECCOMP_RET_TRAP: u32 = 0x0003_0000;
pub const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;
pub const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
pub const SECCOMP_RET_ACTION: u32 = 0xffff_0000;
pub const SECCOMP_RET_DATA: u32 = 0x0000_ffff;

/// Smallest and largest errno value a filter may return.
pub const ERR_MIN_ERRNO: u16 = 1;
pub const ERR_MAX_ERRNO: u16 = 4095;

/// `si_code` value for a SIGSYS raised by a seccomp filter.
pub const SYS_SECCOMP: i32 = 1;

/// Kernel limit on filter length (BPF_MAXINSNS).
pub const BPF_MAXINSNS: usize = 4096;

// BPF instruction classes
pub const BPF_LD: u16 = 0x00;
pub const BPF_JMP: u16 = 0x05;
pub const BPF_RET: u16 = 0x06;

// BPF ld fields
pub const BPF_W: u16 = 0x00;
pub const BPF_ABS: u16 = 0x20;

// BPF jmp fields
pub const BPF_JA: u16 = 0x00;
pub const BPF_JEQ: u16 = 0x10;
pub const BPF_JGT: u16 = 0x20;
pub const BPF_JGE: u16 = 0x30;
pub const BPF_JSET: u16 = 0x40;
pub const BPF_K: u16 = 0x00;

#[inline]
pub const fn bpf_class(code: u16) -> u16 {
    code & 0x07
}

#[inline]
pub const fn bpf_op(code: u16) -> u16 {
    code & 0xf0
}

/// One BPF instruction (`struct sock_filter`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SockFilter {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

impl SockFilter {
    #[inline]
    pub const fn stmt(code: u16, k: u32) -> Self {
        Self {
            code,
            jt: 0,
            jf: 0,
            k,
        }
    }

    #[inline]
    pub const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> Self {
        Self { code, jt, jf, k }
    }
}

/// Filter program header (`struct sock_fprog`) handed to the kernel.
#[repr(C)]
#[derive(Debug)]
pub struct SockFprog {
    pub len: u16,
    pub filter: *const SockFilter,
}

/// The record the in-kernel VM evaluates (`struct seccomp_data`).
///
/// This same layout is reconstructed from the saved register state by the
/// SIGSYS dispatcher and handed to trap handlers.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeccompData {
    pub nr: i32,
    pub arch: u32,
    pub instruction_pointer: u64,
    pub args: [u64; 6],
}

// Field offsets within `seccomp_data`, as used by BPF_ABS loads. The VM is
// 32-bit only, so 64-bit fields are addressed as two words. Little-endian:
// the low word sits at the field offset.
pub const SECCOMP_DATA_NR: u32 = 0;
pub const SECCOMP_DATA_ARCH: u32 = 4;
pub const SECCOMP_DATA_IP_LO: u32 = 8;
pub const SECCOMP_DATA_IP_HI: u32 = 12;

#[inline]
pub const fn seccomp_data_arg_lo(arg: u8) -> u32 {
    16 + 8 * arg as u32
}

#[inline]
pub const fn seccomp_data_arg_hi(arg: u8) -> u32 {
    seccomp_data_arg_lo(arg) + 4
}
