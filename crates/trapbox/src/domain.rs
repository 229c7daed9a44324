//! The architecture's syscall-number domain.
//!
//! BPF compares unsigned 32-bit quantities, while `seccomp_data` carries
//! the syscall number as a signed int. The compiler therefore works over
//! the whole u32 space: every valid number is enumerated individually, and
//! each invalid gap is represented by its boundary values (plus the
//! signedness boundaries), which is exact as long as the policy is
//! constant across invalid numbers, a property registration enforces.

use trapbox_sys::arch::VALID_RANGES;

/// Whether `nr` is a valid syscall number on this architecture.
pub fn is_valid_syscall_number(nr: i32) -> bool {
    let n = nr as u32;
    VALID_RANGES.iter().any(|&(lo, hi)| (lo..=hi).contains(&n))
}

/// All representative syscall numbers, ascending: every valid number plus
/// the boundaries of each invalid gap.
pub fn representatives() -> Vec<u32> {
    let mut out = Vec::new();
    let mut next = 0u32;
    for &(lo, hi) in VALID_RANGES {
        if lo > next {
            push_gap(&mut out, next, lo - 1);
        }
        out.extend(lo..=hi);
        next = hi + 1;
    }
    // VALID_RANGES never reaches u32::MAX; the rest of the space is one
    // big invalid gap covering all negative numbers as well.
    push_gap(&mut out, next, u32::MAX);
    out.dedup();
    out
}

/// Representative numbers outside the valid domain, used to sanity-check
/// that a policy denies everything it has never heard of.
pub fn invalid_representatives() -> Vec<u32> {
    representatives()
        .into_iter()
        .filter(|&n| !is_valid_syscall_number(n as i32))
        .collect()
}

fn push_gap(out: &mut Vec<u32>, lo: u32, hi: u32) {
    out.push(lo);
    // Both signs of the signed interpretation must be probed.
    for boundary in [0x7fff_ffffu32, 0x8000_0000u32] {
        if boundary > lo && boundary < hi {
            out.push(boundary);
        }
    }
    if hi > lo {
        out.push(hi);
    }
}
