//! Gadget classification.
//!
//! Decides a gadget's [`Effect`] from its first instruction and ranks it
//! by how many instructions ride along before the final `ret`.

use iced_x86::{Code, Instruction, OpKind, Register};

use crate::gadget::Effect;
use crate::types::X64Reg;

/// Worst quality rank kept in a catalogue.
pub const MAX_QUALITY: u8 = 7;

/// Classify a decoded instruction sequence ending in `ret`.
///
/// Returns the effect and quality rank, or `None` when the first
/// instruction is not one of the supported effects or the sequence is
/// too long to rank.
pub fn classify_insns(insns: &[Instruction]) -> Option<(Effect, u8)> {
    let (last, body) = insns.split_last()?;
    if last.code() != Code::Retnq || body.is_empty() {
        return None;
    }
    let quality = u8::try_from(body.len()).ok().filter(|&q| q <= MAX_QUALITY)?;
    let effect = classify_first(&body[0])?;
    Some((effect, quality))
}

fn classify_first(insn: &Instruction) -> Option<Effect> {
    match insn.code() {
        Code::Pop_r64 => Some(Effect::LoadReg { dst: reg(insn.op0_register())? }),
        Code::Syscall => Some(Effect::Syscall),
        Code::Inc_rm64 if insn.op0_kind() == OpKind::Register => {
            Some(Effect::IncReg { dst: reg(insn.op0_register())? })
        }
        Code::Neg_rm64 if insn.op0_kind() == OpKind::Register => {
            Some(Effect::NegReg { dst: reg(insn.op0_register())? })
        }
        Code::Mov_rm64_r64 if insn.op0_kind() == OpKind::Memory => {
            let dst = plain_base(insn)?;
            Some(Effect::WriteMem { dst, src: reg(insn.op1_register())? })
        }
        Code::Mov_r64_rm64 if insn.op1_kind() == OpKind::Memory => {
            let src = plain_base(insn)?;
            Some(Effect::LoadMem { dst: reg(insn.op0_register())?, src })
        }
        Code::Xchg_rm64_r64 | Code::Xchg_r64_RAX => {
            let (dst, src) = reg_pair(insn)?;
            Some(Effect::XchgReg { dst, src })
        }
        Code::Add_rm64_r64 | Code::Add_r64_rm64 => {
            let (dst, src) = reg_pair(insn)?;
            Some(Effect::AddReg { dst, src })
        }
        Code::Sub_rm64_r64 | Code::Sub_r64_rm64 => {
            let (dst, src) = reg_pair(insn)?;
            Some(Effect::SubReg { dst, src })
        }
        // 32-bit xor zero-extends, so `xor eax, eax` clears rax.
        Code::Xor_rm64_r64 | Code::Xor_r64_rm64 | Code::Xor_rm32_r32 | Code::Xor_r32_rm32 => {
            let (dst, src) = reg_pair(insn)?;
            Some(Effect::ClearReg { dst, src })
        }
        _ => None,
    }
}

fn reg(r: Register) -> Option<X64Reg> {
    X64Reg::from_iced(r)
}

fn reg_pair(insn: &Instruction) -> Option<(X64Reg, X64Reg)> {
    if insn.op0_kind() != OpKind::Register || insn.op1_kind() != OpKind::Register {
        return None;
    }
    Some((reg(insn.op0_register())?, reg(insn.op1_register())?))
}

/// `[reg]` with no index and no displacement.
fn plain_base(insn: &Instruction) -> Option<X64Reg> {
    if insn.memory_index() != Register::None || insn.memory_displacement64() != 0 {
        return None;
    }
    reg(insn.memory_base())
}

#[cfg(test)]
mod tests {
    use super::*;
    use iced_x86::{Decoder, DecoderOptions};

    fn classify_bytes(bytes: &[u8]) -> Option<(Effect, u8)> {
        let mut decoder = Decoder::with_ip(64, bytes, 0x1000, DecoderOptions::NONE);
        let insns: Vec<Instruction> = std::iter::from_fn(|| {
            decoder.can_decode().then(|| decoder.decode())
        })
        .collect();
        classify_insns(&insns)
    }

    #[test]
    fn classify_pop_rdi_ret() {
        assert_eq!(
            classify_bytes(&[0x5f, 0xc3]),
            Some((Effect::LoadReg { dst: X64Reg::Rdi }, 1))
        );
    }

    #[test]
    fn classify_pop_rsi_pop_r15_ret() {
        assert_eq!(
            classify_bytes(&[0x5e, 0x41, 0x5f, 0xc3]),
            Some((Effect::LoadReg { dst: X64Reg::Rsi }, 2))
        );
    }

    #[test]
    fn classify_xor_eax_eax_ret() {
        assert_eq!(
            classify_bytes(&[0x31, 0xc0, 0xc3]),
            Some((Effect::ClearReg { dst: X64Reg::Rax, src: X64Reg::Rax }, 1))
        );
    }

    #[test]
    fn classify_syscall_ret() {
        assert_eq!(classify_bytes(&[0x0f, 0x05, 0xc3]), Some((Effect::Syscall, 1)));
    }

    #[test]
    fn classify_write_mem() {
        // mov [rdi], rsi; ret
        assert_eq!(
            classify_bytes(&[0x48, 0x89, 0x37, 0xc3]),
            Some((Effect::WriteMem { dst: X64Reg::Rdi, src: X64Reg::Rsi }, 1))
        );
    }

    #[test]
    fn classify_load_mem() {
        // mov rax, [rdi]; ret
        assert_eq!(
            classify_bytes(&[0x48, 0x8b, 0x07, 0xc3]),
            Some((Effect::LoadMem { dst: X64Reg::Rax, src: X64Reg::Rdi }, 1))
        );
    }

    #[test]
    fn classify_arithmetic() {
        // sub rax, rbx; ret
        assert_eq!(
            classify_bytes(&[0x48, 0x29, 0xd8, 0xc3]),
            Some((Effect::SubReg { dst: X64Reg::Rax, src: X64Reg::Rbx }, 1))
        );
        // add rax, rbx; ret
        assert_eq!(
            classify_bytes(&[0x48, 0x01, 0xd8, 0xc3]),
            Some((Effect::AddReg { dst: X64Reg::Rax, src: X64Reg::Rbx }, 1))
        );
        // inc rax; ret
        assert_eq!(
            classify_bytes(&[0x48, 0xff, 0xc0, 0xc3]),
            Some((Effect::IncReg { dst: X64Reg::Rax }, 1))
        );
        // neg rax; ret
        assert_eq!(
            classify_bytes(&[0x48, 0xf7, 0xd8, 0xc3]),
            Some((Effect::NegReg { dst: X64Reg::Rax }, 1))
        );
    }

    #[test]
    fn classify_xchg_short_form() {
        // xchg rdi, rax; ret
        let (effect, quality) = classify_bytes(&[0x48, 0x97, 0xc3]).unwrap();
        assert_eq!(effect.category(), crate::gadget::Category::XchgReg);
        assert_eq!(quality, 1);
        let regs = [effect.dst().unwrap(), effect.src().unwrap()];
        assert!(regs.contains(&X64Reg::Rdi));
        assert!(regs.contains(&X64Reg::Rax));
    }

    #[test]
    fn reject_displacement_and_bare_ret() {
        // mov [rdi+8], rsi; ret
        assert_eq!(classify_bytes(&[0x48, 0x89, 0x77, 0x08, 0xc3]), None);
        assert_eq!(classify_bytes(&[0xc3]), None);
        // pop rdi; jmp rax
        assert_eq!(classify_bytes(&[0x5f, 0xff, 0xe0]), None);
    }

    #[test]
    fn reject_too_long() {
        // eight pops before ret
        let bytes = [0x58, 0x5b, 0x59, 0x5a, 0x5e, 0x5f, 0x5d, 0x58, 0xc3];
        assert_eq!(classify_bytes(&bytes), None);
    }
}
