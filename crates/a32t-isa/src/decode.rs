//! A32 decoder.
//!
//! Covers the data-processing core, branches, interworking branches, the
//! trap instructions, the generic-timer `MRRC` and `VMOV.F64`. Encodings
//! outside that set decode to [`InstrKind::Undefined`], which the emitter
//! hands to the runtime's exception helper.

use a32t_ir::{
    AluOp, CmpOp, Cond, GuestDReg, GuestInstr, GuestReg, InstrFlags, InstrKind, Operand,
};

use crate::error::DecodeError;

/// Fetch and decode the instruction at `address` from `bytes`, which start
/// at `base`.
///
/// # Errors
/// The address is misaligned or the image ends before the instruction does.
pub fn decode_at(bytes: &[u8], base: u32, address: u32) -> Result<GuestInstr, DecodeError> {
    if address % 4 != 0 {
        return Err(DecodeError::Misaligned(address));
    }
    let offset = address.checked_sub(base).ok_or(DecodeError::OutOfImage(address))? as usize;
    let raw = bytes
        .get(offset..offset + 4)
        .ok_or(DecodeError::OutOfImage(address))?;
    let word = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
    Ok(decode(word, address))
}

/// Decode one A32 instruction word.
#[must_use]
pub fn decode(word: u32, address: u32) -> GuestInstr {
    let Some(cond) = Cond::from_bits(word >> 28) else {
        // cond == 0b1111: unconditional space.
        return undefined(word, address);
    };
    let instr = match (word >> 25) & 0b111 {
        0b000 | 0b001 => decode_dp_space(word, address),
        0b101 => Some(decode_branch(word, address)),
        0b110 => decode_coproc_transfer(word, address),
        0b111 => decode_svc_or_vfp(word, address),
        _ => None,
    };
    match instr {
        Some(i) => i.with_cond(cond),
        None => undefined(word, address).with_cond(cond),
    }
}

fn undefined(word: u32, address: u32) -> GuestInstr {
    GuestInstr::new(address, word, "udf", InstrKind::Undefined)
        .with_flags(InstrFlags::HOST_CALL_SKIP_CONTEXT)
}

#[allow(clippy::cast_possible_truncation)]
const fn reg(word: u32, lsb: u32) -> GuestReg {
    GuestReg::new(((word >> lsb) & 0xF) as u8)
}

// ============================================================================
// Data processing and miscellaneous
// ============================================================================

fn decode_dp_space(word: u32, address: u32) -> Option<GuestInstr> {
    // Miscellaneous instructions live in the compare opcodes with S clear.
    if word & 0x0190_0000 == 0x0100_0000 && word & (1 << 25) == 0 {
        return decode_misc(word, address);
    }
    if word & 0x0FFF_FFFF == 0x0320_F000 {
        return Some(GuestInstr::new(address, word, "nop", InstrKind::Nop));
    }
    decode_data_processing(word, address)
}

fn decode_misc(word: u32, address: u32) -> Option<GuestInstr> {
    let rm = reg(word, 0);
    match word & 0x0FFF_FFF0 {
        0x012F_FF10 => Some(
            GuestInstr::new(address, word, "bx", InstrKind::BranchExchange { rm })
                .with_flags(InstrFlags::BRANCH),
        ),
        0x012F_FF30 => Some(
            GuestInstr::new(address, word, "blx", InstrKind::BranchLinkExchange { rm })
                .with_flags(InstrFlags::BRANCH | InstrFlags::CALL | InstrFlags::HOST_CALL),
        ),
        _ if word & 0x0FF0_00F0 == 0x0120_0070 => {
            #[allow(clippy::cast_possible_truncation)]
            let imm = (((word >> 4) & 0xFFF0) | (word & 0xF)) as u16;
            Some(
                GuestInstr::new(address, word, "bkpt", InstrKind::Breakpoint { imm })
                    .with_flags(InstrFlags::HOST_CALL_SKIP_CONTEXT),
            )
        }
        _ => None,
    }
}

fn decode_data_processing(word: u32, address: u32) -> Option<GuestInstr> {
    let mut rotated = false;
    let operand = if word & (1 << 25) != 0 {
        let rotate = ((word >> 8) & 0xF) * 2;
        rotated = rotate != 0;
        Operand::Imm((word & 0xFF).rotate_right(rotate))
    } else if word & 0xFF0 == 0 {
        Operand::Reg(reg(word, 0))
    } else {
        // Shifted-register operands and the multiply/extra-load space.
        return None;
    };
    let set_flags = word & (1 << 20) != 0;
    let rn = reg(word, 16);
    let rd = reg(word, 12);
    let opcode = (word >> 21) & 0xF;

    let is_compare = (0x8..=0xB).contains(&opcode);
    // Compares without S are MSR/hint encodings; `<op>S pc, ...` restores
    // CPSR from SPSR.
    if (is_compare && !set_flags) || (set_flags && rd.is_pc() && !is_compare) {
        return None;
    }

    let (name, kind) = match opcode {
        0x8..=0xB => {
            let (name, op) = match opcode {
                0x8 => ("tst", CmpOp::Tst),
                0x9 => ("teq", CmpOp::Teq),
                0xA => ("cmp", CmpOp::Cmp),
                _ => ("cmn", CmpOp::Cmn),
            };
            (name, InstrKind::Compare { op, rn, operand })
        }
        0xD => ("mov", InstrKind::Move { rd, operand, negate: false }),
        0xF => ("mvn", InstrKind::Move { rd, operand, negate: true }),
        _ => {
            let (name, op) = match opcode {
                0x0 => ("and", AluOp::And),
                0x1 => ("eor", AluOp::Eor),
                0x2 => ("sub", AluOp::Sub),
                0x3 => ("rsb", AluOp::Rsb),
                0x4 => ("add", AluOp::Add),
                0x5 => ("adc", AluOp::Adc),
                0x6 => ("sbc", AluOp::Sbc),
                0xC => ("orr", AluOp::Orr),
                0xE => ("bic", AluOp::Bic),
                // RSC
                _ => return None,
            };
            (name, InstrKind::Alu { op, rd, rn, operand })
        }
    };

    let mut instr = GuestInstr::new(address, word, name, kind);
    if set_flags {
        instr = instr.with_flags(InstrFlags::SETS_FLAGS);
    }
    if rotated {
        instr = instr.with_flags(InstrFlags::ROTATED_IMM);
    }
    if instr.writes_pc() {
        instr = instr.with_flags(InstrFlags::BRANCH);
    }
    Some(instr)
}

// ============================================================================
// Branches
// ============================================================================

fn decode_branch(word: u32, address: u32) -> GuestInstr {
    #[allow(clippy::cast_sign_loss)]
    let offset = (((word & 0x00FF_FFFF) << 8) as i32 >> 6) as u32;
    let target = address.wrapping_add(8).wrapping_add(offset);
    if word & (1 << 24) != 0 {
        GuestInstr::new(address, word, "bl", InstrKind::BranchLink { target })
            .with_flags(InstrFlags::BRANCH | InstrFlags::CALL | InstrFlags::HOST_CALL)
    } else {
        GuestInstr::new(address, word, "b", InstrKind::Branch { target }).with_flags(InstrFlags::BRANCH)
    }
}

// ============================================================================
// Coprocessor, supervisor call and VFP
// ============================================================================

/// `MRRC p15, {0,1}, Rt, Rt2, c14`: physical or virtual counter.
fn decode_coproc_transfer(word: u32, address: u32) -> Option<GuestInstr> {
    let masked = word & 0x0FF0_0FEF;
    if masked != 0x0C50_0F0E {
        return None;
    }
    let rt = reg(word, 12);
    let rt2 = reg(word, 16);
    if rt.is_pc() || rt2.is_pc() || rt == rt2 {
        return None;
    }
    Some(
        GuestInstr::new(address, word, "mrrc", InstrKind::ReadTimer { rt, rt2 })
            .with_flags(InstrFlags::HOST_CALL_SKIP_CONTEXT),
    )
}

fn decode_svc_or_vfp(word: u32, address: u32) -> Option<GuestInstr> {
    if word & (1 << 24) != 0 {
        let imm = word & 0x00FF_FFFF;
        return Some(
            GuestInstr::new(address, word, "svc", InstrKind::SupervisorCall { imm })
                .with_flags(InstrFlags::HOST_CALL_SKIP_CONTEXT),
        );
    }
    // VMOV.F64 Dd, Dm
    if word & 0x0FBF_0FD0 == 0x0EB0_0B40 {
        #[allow(clippy::cast_possible_truncation)]
        let dd = ((((word >> 22) & 1) << 4) | ((word >> 12) & 0xF)) as u8;
        #[allow(clippy::cast_possible_truncation)]
        let dm = ((((word >> 5) & 1) << 4) | (word & 0xF)) as u8;
        return Some(GuestInstr::new(
            address,
            word,
            "vmov.f64",
            InstrKind::VMove {
                dd: GuestDReg::new(dd),
                dm: GuestDReg::new(dm),
            },
        ));
    }
    None
}
