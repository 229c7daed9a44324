//! Filter program verifier.
//!
//! An independent interpreter for flattened programs, run before anything
//! is handed to the kernel. [`verify`] replays the program for every
//! representative syscall number and checks that the computed action
//! matches what the policy demands. The interpreter is deliberately
//! stricter than the in-kernel VM: only the instruction forms the
//! compiler emits are accepted, and jumps only ever move forward, so
//! every program it accepts terminates.

use thiserror::Error;

use trapbox_sys::bpf::{
    BPF_ABS, BPF_JA, BPF_JEQ, BPF_JGE, BPF_JGT, BPF_JMP, BPF_JSET, BPF_K, BPF_LD, BPF_RET, BPF_W,
    SECCOMP_DATA_ARCH, SECCOMP_DATA_IP_HI, SECCOMP_DATA_IP_LO, SECCOMP_DATA_NR, SeccompData,
    SockFilter, bpf_class, bpf_op,
};

use crate::domain;

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("unsupported instruction 0x{code:04x} at index {pc}")]
    InvalidInstruction { pc: usize, code: u16 },

    #[error("load from unsupported seccomp_data offset {offset} at index {pc}")]
    InvalidLoadOffset { pc: usize, offset: u32 },

    #[error("execution fell off the end of the program")]
    FellOffProgram,

    #[error(
        "filter disagrees with policy for syscall {nr}: program returned \
         0x{actual:08x}, policy demands 0x{expected:08x}"
    )]
    Mismatch { nr: i32, actual: u32, expected: u32 },
}

/// Interpret `program` over `data` and return the action word.
pub fn evaluate(program: &[SockFilter], data: &SeccompData) -> Result<u32, VerifyError> {
    let mut acc = 0u32;
    let mut pc = 0usize;
    loop {
        let Some(insn) = program.get(pc) else {
            return Err(VerifyError::FellOffProgram);
        };
        match bpf_class(insn.code) {
            BPF_LD if insn.code == BPF_LD | BPF_W | BPF_ABS => {
                acc = load_word(data, insn.k).ok_or(VerifyError::InvalidLoadOffset {
                    pc,
                    offset: insn.k,
                })?;
                pc += 1;
            }
            BPF_JMP => {
                if insn.code == BPF_JMP | BPF_JA {
                    pc += 1 + insn.k as usize;
                } else {
                    let taken = match bpf_op(insn.code) {
                        BPF_JEQ if insn.code == BPF_JMP | BPF_JEQ | BPF_K => acc == insn.k,
                        BPF_JGT if insn.code == BPF_JMP | BPF_JGT | BPF_K => acc > insn.k,
                        BPF_JGE if insn.code == BPF_JMP | BPF_JGE | BPF_K => acc >= insn.k,
                        BPF_JSET if insn.code == BPF_JMP | BPF_JSET | BPF_K => acc & insn.k != 0,
                        _ => {
                            return Err(VerifyError::InvalidInstruction {
                                pc,
                                code: insn.code,
                            });
                        }
                    };
                    pc += 1 + usize::from(if taken { insn.jt } else { insn.jf });
                }
            }
            BPF_RET if insn.code == BPF_RET | BPF_K => return Ok(insn.k),
            _ => {
                return Err(VerifyError::InvalidInstruction {
                    pc,
                    code: insn.code,
                });
            }
        }
    }
}

/// Check `program` against `expected` for every representative syscall
/// number. The register state the kernel would hand the filter is not
/// known ahead of time, so the instruction pointer and arguments are
/// zeroed; argument-dependent decisions must agree for zero arguments and
/// are exercised further by their own evaluation paths.
pub fn verify(
    program: &[SockFilter],
    arch: u32,
    expected: impl Fn(&SeccompData) -> u32,
) -> Result<(), VerifyError> {
    for nr in domain::representatives() {
        let data = SeccompData {
            nr: nr as i32,
            arch,
            ..Default::default()
        };
        let actual = evaluate(program, &data)?;
        let want = expected(&data);
        if actual != want {
            return Err(VerifyError::Mismatch {
                nr: nr as i32,
                actual,
                expected: want,
            });
        }
    }
    Ok(())
}

fn load_word(data: &SeccompData, offset: u32) -> Option<u32> {
    match offset {
        SECCOMP_DATA_NR => Some(data.nr as u32),
        SECCOMP_DATA_ARCH => Some(data.arch),
        SECCOMP_DATA_IP_LO => Some(data.instruction_pointer as u32),
        SECCOMP_DATA_IP_HI => Some((data.instruction_pointer >> 32) as u32),
        o if o >= 16 && o < 64 && o % 4 == 0 => {
            let arg = data.args[((o - 16) / 8) as usize];
            if (o - 16) % 8 == 0 {
                Some(arg as u32)
            } else {
                Some((arg >> 32) as u32)
            }
        }
        _ => None,
    }
}
