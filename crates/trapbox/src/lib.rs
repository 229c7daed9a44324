//! User-space seccomp-BPF sandbox.
//!
//! A policy maps syscall numbers to decisions (allow, errno, trap to a
//! userspace handler, or a branch on one argument). The compiler turns
//! the policy into a classic-BPF filter program: decisions are
//! compressed into ranges over the full unsigned syscall-number space,
//! the ranges become a balanced binary search, and an independent
//! verifier replays the flattened program against the policy before
//! anything reaches the kernel. Installation is a one-way door: the
//! filter applies to the calling thread for the rest of its life, and
//! trapped syscalls are dispatched to registered handlers from a SIGSYS
//! handler.
//!
//! ```no_run
//! use trapbox::{Decision, Sandbox};
//!
//! fn policy(nr: i32, _aux: *mut libc::c_void) -> Decision {
//!     match i64::from(nr) {
//!         n if n == libc::SYS_getpid => Decision::errno(libc::EPERM as u16),
//!         _ if trapbox::is_valid_syscall_number(nr) => Decision::Allow,
//!         _ => Decision::errno(libc::ENOSYS as u16),
//!     }
//! }
//!
//! if Sandbox::supports_seccomp_sandbox(None) == trapbox::SandboxStatus::Available {
//!     Sandbox::set_sandbox_policy(policy, std::ptr::null_mut());
//!     Sandbox::start_sandbox();
//! }
//! ```

pub mod codegen;
pub mod compiler;
pub mod decision;
pub mod domain;
mod fatal;
pub mod sandbox;
pub mod trap;
pub mod verifier;

pub use decision::{ArgCheck, CmpOp, Decision, PolicyFn, TrapFn, TrapSpec};
pub use domain::is_valid_syscall_number;
pub use sandbox::{Sandbox, SandboxStatus};
pub use trapbox_sys::bpf::SeccompData;
