//! The SIGSYS-specific siginfo extension record.
//!
//! When a seccomp filter returns the trap action, the kernel delivers
//! SIGSYS with extra fields (faulting instruction pointer, syscall number,
//! audit architecture) appended to the siginfo union. Most libc versions do
//! not expose these fields, so they are read out of the raw union at its
//! fixed offset and copied by value; the dispatcher must never hold a
//! pointer into the siginfo across a possible re-entry.

/// Copy of the `_sigsys` siginfo fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigSysInfo {
    pub ip: u64,
    pub nr: i32,
    pub arch: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RawSigSys {
    call_addr: *mut libc::c_void,
    syscall: libc::c_int,
    arch: libc::c_uint,
}

// The siginfo union follows si_signo/si_errno/si_code plus alignment
// padding: offset 16 on 64-bit targets, 8 on 32-bit targets.
#[cfg(target_pointer_width = "64")]
const SIGINFO_FIELDS_OFFSET: usize = 16;
#[cfg(target_pointer_width = "32")]
const SIGINFO_FIELDS_OFFSET: usize = 8;

impl SigSysInfo {
    /// Copy the SIGSYS extension out of a raw siginfo.
    ///
    /// # Safety
    ///
    /// `info` must point to the `siginfo_t` delivered to an `SA_SIGINFO`
    /// SIGSYS handler.
    pub unsafe fn copy_from(info: *const libc::siginfo_t) -> Self {
        let raw = info
            .cast::<u8>()
            .add(SIGINFO_FIELDS_OFFSET)
            .cast::<RawSigSys>()
            .read_unaligned();
        Self {
            ip: raw.call_addr as u64,
            nr: raw.syscall,
            arch: raw.arch,
        }
    }
}
