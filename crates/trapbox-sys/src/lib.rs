//! Low-level Linux ABI pieces for seccomp-BPF sandboxing.
//!
//! This crate provides the raw kernel-facing surface that the `trapbox`
//! engine is built on. Everything here is a bit-exact wire format; nothing
//! in this crate makes policy decisions.
//!
//! ## Modules
//!
//! - **bpf** - BPF instruction encoding, seccomp action words, and the
//!   `seccomp_data` layout the in-kernel VM reads.
//! - **arch** - Per-architecture audit ids, syscall-number domains, and the
//!   register map for the saved machine context seen by a signal handler.
//! - **sigsys** - The SIGSYS-specific siginfo extension record.
//! - **syscall** - A raw syscall trampoline with a queryable entry-point
//!   sentinel, used both to forward trapped syscalls and as the
//!   escape-hatch address compiled into unsafe-trap filters.
//!
//! # Safety
//!
//! This crate contains raw syscall and register-context accessors. Casts
//! between integer types are unavoidable when interfacing with the kernel
//! ABI.

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod arch;
pub mod bpf;
pub mod sigsys;
pub mod syscall;

#[inline]
pub fn last_errno() -> rustix::io::Errno {
    // SAFETY: __errno_location always returns valid thread-local pointer.
    rustix::io::Errno::from_raw_os_error(unsafe { *libc::__errno_location() })
}
