//! Data processing, compares and FP register moves.

use a32t_emit::arm64::enc;
use a32t_emit::arm64::registers::{XReg, reserved};
use a32t_emit::dispatch::write_dispatch_register;
use a32t_emit::{ContextLayout, EmitContext, FixupKind, FixupTarget, Result, absorbs_condition};
use a32t_ir::{AluOp, CmpOp, GuestDReg, GuestInstr, GuestReg, Operand};

use super::{Value, read_gpr, read_operand, write_target};

/// Set guest N and Z from `result`, keeping V. C is kept too unless the
/// operand shifter produced a carry-out. A32 logical operations define no
/// other flag; `ands` would clear C and V on the host.
fn set_logical_flags(ctx: &mut EmitContext<'_>, result: XReg, carry: Option<bool>) -> Result<()> {
    let temp = ctx.regs.allocate_gpr()?;
    let t = temp.reg();
    ctx.emit(enc::mrs_nzcv(reserved::SCRATCH));
    ctx.emit(enc::ands_w(XReg::ZR, result, result));
    ctx.emit(enc::mrs_nzcv(t));
    match carry {
        None => {
            ctx.emit(enc::lsr_w_imm(t, t, 30));
            ctx.emit(enc::bfi_w(reserved::SCRATCH, t, 30, 2));
        }
        Some(carry) => {
            // Host C is clear after `ands`.
            ctx.emit(enc::lsr_w_imm(t, t, 29));
            if carry {
                ctx.emit(enc::add_w_imm(t, t, 1));
            }
            ctx.emit(enc::bfi_w(reserved::SCRATCH, t, 29, 3));
        }
    }
    ctx.emit(enc::msr_nzcv(reserved::SCRATCH));
    Ok(())
}

/// A value computed for `pc` leaves the unit through the dispatch slot.
fn branch_to_computed(ctx: &mut EmitContext<'_>, dest: &Value) -> Result<()> {
    write_dispatch_register(ctx, dest.reg());
    ctx.push_fixup(FixupKind::IndirectBranch, FixupTarget::None)?;
    Ok(())
}

pub(super) fn emit_alu(
    ctx: &mut EmitContext<'_>,
    instr: &GuestInstr,
    op: AluOp,
    rd: GuestReg,
    rn: GuestReg,
    operand: Operand,
) -> Result<()> {
    let s = instr.sets_flags();
    if matches!(op, AluOp::Adc | AluOp::Sbc) {
        ctx.regs.mark_flags_used();
    }
    let lhs = read_gpr(ctx, rn)?;
    let rhs = read_operand(ctx, operand)?;
    let dest = write_target(ctx, rd)?;
    let (d, a, b) = (dest.reg(), lhs.reg(), rhs.reg());

    let word = match (op, s) {
        (AluOp::Add, false) => enc::add_w(d, a, b),
        (AluOp::Add, true) => enc::adds_w(d, a, b),
        (AluOp::Sub, false) => enc::sub_w(d, a, b),
        (AluOp::Sub, true) => enc::subs_w(d, a, b),
        (AluOp::Rsb, false) => enc::sub_w(d, b, a),
        (AluOp::Rsb, true) => enc::subs_w(d, b, a),
        (AluOp::Adc, false) => enc::adc_w(d, a, b),
        (AluOp::Adc, true) => enc::adcs_w(d, a, b),
        (AluOp::Sbc, false) => enc::sbc_w(d, a, b),
        (AluOp::Sbc, true) => enc::sbcs_w(d, a, b),
        (AluOp::And, _) => enc::and_w(d, a, b),
        (AluOp::Eor, _) => enc::eor_w(d, a, b),
        (AluOp::Orr, _) => enc::orr_w(d, a, b),
        (AluOp::Bic, _) => enc::bic_w(d, a, b),
    };
    ctx.emit(word);
    drop((lhs, rhs));

    if s && matches!(op, AluOp::And | AluOp::Eor | AluOp::Orr | AluOp::Bic) {
        set_logical_flags(ctx, d, instr.shifter_carry())?;
    }
    if rd.is_pc() {
        branch_to_computed(ctx, &dest)?;
    }
    Ok(())
}

pub(super) fn emit_move(
    ctx: &mut EmitContext<'_>,
    instr: &GuestInstr,
    rd: GuestReg,
    operand: Operand,
    negate: bool,
) -> Result<()> {
    // `mov pc, rm` is an indirect branch.
    if let (true, false, false, Operand::Reg(rm)) = (rd.is_pc(), negate, instr.sets_flags(), operand) {
        ctx.push_fixup(FixupKind::IndirectBranch, FixupTarget::Register(rm))?;
        return Ok(());
    }

    let cond = ctx.cond();
    if absorbs_condition(instr) && !cond.is_always() {
        if let Operand::Reg(rm) = operand {
            let src = read_gpr(ctx, rm)?;
            let d = ctx.guest_gpr(rd)?;
            ctx.emit(enc::csel_w(d, src.reg(), d, cond));
            return Ok(());
        }
    }

    let dest = write_target(ctx, rd)?;
    let d = dest.reg();
    match operand {
        Operand::Reg(rm) => {
            let src = read_gpr(ctx, rm)?;
            ctx.emit(if negate { enc::mvn_w(d, src.reg()) } else { enc::mov_w(d, src.reg()) });
        }
        Operand::Imm(value) => ctx.buf.emit_mov_imm32(d, if negate { !value } else { value }),
    }
    if instr.sets_flags() {
        set_logical_flags(ctx, d, instr.shifter_carry())?;
    }
    if rd.is_pc() {
        branch_to_computed(ctx, &dest)?;
    }
    Ok(())
}

pub(super) fn emit_compare(
    ctx: &mut EmitContext<'_>,
    instr: &GuestInstr,
    op: CmpOp,
    rn: GuestReg,
    operand: Operand,
) -> Result<()> {
    let lhs = read_gpr(ctx, rn)?;
    let rhs = read_operand(ctx, operand)?;
    let (a, b) = (lhs.reg(), rhs.reg());
    match op {
        CmpOp::Cmp => {
            ctx.emit(enc::subs_w(XReg::ZR, a, b));
        }
        CmpOp::Cmn => {
            ctx.emit(enc::adds_w(XReg::ZR, a, b));
        }
        CmpOp::Tst | CmpOp::Teq => {
            let temp = ctx.regs.allocate_gpr()?;
            let t = temp.reg();
            ctx.emit(if op == CmpOp::Tst { enc::and_w(t, a, b) } else { enc::eor_w(t, a, b) });
            drop((lhs, rhs));
            set_logical_flags(ctx, t, instr.shifter_carry())?;
        }
    }
    Ok(())
}

/// `vmov.f64`. D registers without a host home live in the context.
pub(super) fn emit_vmove(ctx: &mut EmitContext<'_>, dd: GuestDReg, dm: GuestDReg) -> Result<()> {
    let src = ctx.regs.remap_dreg(dm);
    let dst = ctx.regs.remap_dreg(dd);
    let base = reserved::CONTEXT_PTR;
    match (dst, src) {
        (Some(d), Some(m)) => {
            ctx.emit(enc::fmov_d(d, m));
        }
        (Some(d), None) => {
            ctx.emit(enc::ldr_d(d, base, ContextLayout::dreg(dm)));
        }
        (None, Some(m)) => {
            ctx.emit(enc::str_d(m, base, ContextLayout::dreg(dd)));
        }
        (None, None) => {
            let temp = ctx.regs.allocate_fpsimd()?;
            ctx.emit(enc::ldr_d(temp.reg(), base, ContextLayout::dreg(dm)));
            ctx.emit(enc::str_d(temp.reg(), base, ContextLayout::dreg(dd)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use a32t_emit::arm64::VReg;
    use a32t_emit::{EmitConfig, UnitShape};
    use a32t_ir::{Cond, InstrFlags, InstrKind};

    fn with_ctx<F: FnOnce(&mut EmitContext<'_>)>(instr: &GuestInstr, cond: Cond, f: F) -> Vec<u32> {
        let config = EmitConfig::default();
        let mut ctx = EmitContext::new(&config, None, UnitShape::default());
        ctx.begin_instr(instr, cond);
        let free = ctx.regs.free_gprs();
        f(&mut ctx);
        assert_eq!(ctx.regs.free_gprs(), free, "temporaries leaked");
        ctx.buf.into_words()
    }

    fn r(i: u8) -> GuestReg {
        GuestReg::new(i)
    }

    fn x(i: u8) -> XReg {
        XReg::new(i)
    }

    #[test]
    fn test_add_registers() {
        let operand = Operand::Reg(r(2));
        let instr = GuestInstr::new(
            0,
            0,
            "add",
            InstrKind::Alu {
                op: AluOp::Add,
                rd: r(0),
                rn: r(1),
                operand,
            },
        );
        let words = with_ctx(&instr, Cond::Al, |ctx| {
            emit_alu(ctx, &instr, AluOp::Add, r(0), r(1), operand).unwrap();
        });
        assert_eq!(words, vec![enc::add_w(x(19), x(20), x(21))]);
    }

    #[test]
    fn test_rsbs_swaps_operands() {
        let operand = Operand::Imm(0);
        let instr = GuestInstr::new(
            0,
            0,
            "rsb",
            InstrKind::Alu {
                op: AluOp::Rsb,
                rd: r(0),
                rn: r(1),
                operand,
            },
        )
        .with_flags(InstrFlags::SETS_FLAGS);
        let words = with_ctx(&instr, Cond::Al, |ctx| {
            emit_alu(ctx, &instr, AluOp::Rsb, r(0), r(1), operand).unwrap();
        });
        assert_eq!(words, vec![enc::subs_w(x(19), XReg::ZR, x(20))]);
    }

    #[test]
    fn test_logical_s_preserves_carry() {
        let operand = Operand::Reg(r(2));
        let instr = GuestInstr::new(
            0,
            0,
            "ands",
            InstrKind::Alu {
                op: AluOp::And,
                rd: r(0),
                rn: r(1),
                operand,
            },
        )
        .with_flags(InstrFlags::SETS_FLAGS);
        let words = with_ctx(&instr, Cond::Al, |ctx| {
            emit_alu(ctx, &instr, AluOp::And, r(0), r(1), operand).unwrap();
        });
        assert_eq!(words[0], enc::and_w(x(19), x(20), x(21)));
        assert_eq!(words[1], enc::mrs_nzcv(XReg::X17));
        assert_eq!(words.last(), Some(&enc::msr_nzcv(XReg::X17)));
        assert!(words.contains(&enc::bfi_w(XReg::X17, XReg::X0, 30, 2)));
    }

    #[test]
    fn test_logical_s_rotated_immediate_sets_carry() {
        // ands r0, r1, #0xFF000000
        let instr = a32t_isa::decode(0xE211_04FF, 0);
        let InstrKind::Alu { op, rd, rn, operand } = instr.kind else {
            panic!("not an ALU op: {instr}");
        };
        assert_eq!(operand, Operand::Imm(0xFF00_0000));
        let words = with_ctx(&instr, Cond::Al, |ctx| {
            emit_alu(ctx, &instr, op, rd, rn, operand).unwrap();
        });
        let tail = &words[words.len() - 4..];
        assert_eq!(
            tail,
            &[
                enc::lsr_w_imm(XReg::X0, XReg::X0, 29),
                enc::add_w_imm(XReg::X0, XReg::X0, 1),
                enc::bfi_w(XReg::X17, XReg::X0, 29, 3),
                enc::msr_nzcv(XReg::X17),
            ]
        );
    }

    #[test]
    fn test_rotated_immediate_with_clear_top_bit_clears_carry() {
        // tst r0, #0x3F0 (0x3F rotated right by 28)
        let instr = a32t_isa::decode(0xE310_0E3F, 0);
        assert_eq!(instr.shifter_carry(), Some(false));
        let InstrKind::Compare { op, rn, operand } = instr.kind else {
            panic!("not a compare: {instr}");
        };
        let words = with_ctx(&instr, Cond::Al, |ctx| {
            emit_compare(ctx, &instr, op, rn, operand).unwrap();
        });
        assert!(words.contains(&enc::bfi_w(XReg::X17, XReg::X0, 29, 3)));
        assert!(!words.iter().any(|&w| w == enc::add_w_imm(XReg::X0, XReg::X0, 1)));
    }

    #[test]
    fn test_unrotated_immediate_keeps_carry() {
        // ands r0, r1, #1
        let instr = a32t_isa::decode(0xE211_0001, 0);
        assert_eq!(instr.shifter_carry(), None);
        let InstrKind::Alu { op, rd, rn, operand } = instr.kind else {
            panic!("not an ALU op: {instr}");
        };
        let words = with_ctx(&instr, Cond::Al, |ctx| {
            emit_alu(ctx, &instr, op, rd, rn, operand).unwrap();
        });
        assert!(words.contains(&enc::bfi_w(XReg::X17, XReg::X0, 30, 2)));
    }

    #[test]
    fn test_add_to_pc_branches() {
        let operand = Operand::Imm(8);
        let instr = GuestInstr::new(
            0x100,
            0,
            "add",
            InstrKind::Alu {
                op: AluOp::Add,
                rd: GuestReg::PC,
                rn: r(3),
                operand,
            },
        );
        let config = EmitConfig::default();
        let mut ctx = EmitContext::new(&config, None, UnitShape::default());
        ctx.begin_instr(&instr, Cond::Al);
        emit_alu(&mut ctx, &instr, AluOp::Add, GuestReg::PC, r(3), operand).unwrap();
        assert_eq!(ctx.fixups.len(), 1);
        let fixup = *ctx.fixups.iter().next().unwrap();
        assert_eq!(fixup.kind, FixupKind::IndirectBranch);
        assert_eq!(fixup.target, FixupTarget::None);
        let words = ctx.buf.words();
        let store = enc::str_w(XReg::X1, XReg::X27, ContextLayout::DISPATCH_ADDRESS);
        assert_eq!(words[words.len() - 2], store);
    }

    #[test]
    fn test_conditional_move_uses_csel() {
        let operand = Operand::Reg(r(1));
        let instr = GuestInstr::new(
            0,
            0,
            "mov",
            InstrKind::Move {
                rd: r(0),
                operand,
                negate: false,
            },
        )
        .with_cond(Cond::Gt);
        let words = with_ctx(&instr, Cond::Gt, |ctx| {
            emit_move(ctx, &instr, r(0), operand, false).unwrap();
        });
        assert_eq!(words, vec![enc::csel_w(x(19), x(20), x(19), Cond::Gt)]);
    }

    #[test]
    fn test_mov_pc_is_indirect_branch() {
        let operand = Operand::Reg(GuestReg::LR);
        let instr = GuestInstr::new(
            0,
            0,
            "mov",
            InstrKind::Move {
                rd: GuestReg::PC,
                operand,
                negate: false,
            },
        );
        let config = EmitConfig::default();
        let mut ctx = EmitContext::new(&config, None, UnitShape::default());
        ctx.begin_instr(&instr, Cond::Al);
        emit_move(&mut ctx, &instr, GuestReg::PC, operand, false).unwrap();
        let fixup = *ctx.fixups.iter().next().unwrap();
        assert_eq!(fixup.kind, FixupKind::IndirectBranch);
        assert_eq!(fixup.target, FixupTarget::Register(GuestReg::LR));
        assert_eq!(ctx.buf.len(), 1);
    }

    #[test]
    fn test_mvn_immediate() {
        let operand = Operand::Imm(0);
        let instr = GuestInstr::new(
            0,
            0,
            "mvn",
            InstrKind::Move {
                rd: r(8),
                operand,
                negate: true,
            },
        );
        let words = with_ctx(&instr, Cond::Al, |ctx| {
            emit_move(ctx, &instr, r(8), operand, true).unwrap();
        });
        assert_eq!(words, vec![enc::movz_w(x(9), 0xFFFF, 0), enc::movk_w(x(9), 0xFFFF, 1)]);
    }

    #[test]
    fn test_cmp_writes_zero_register() {
        let instr = GuestInstr::new(0, 0, "cmp", InstrKind::Nop);
        let words = with_ctx(&instr, Cond::Al, |ctx| {
            emit_compare(ctx, &instr, CmpOp::Cmp, r(0), Operand::Reg(r(1))).unwrap();
        });
        assert_eq!(words, vec![enc::subs_w(XReg::ZR, x(19), x(20))]);
    }

    #[test]
    fn test_tst_releases_temporaries() {
        let instr = GuestInstr::new(0, 0, "tst", InstrKind::Nop);
        let words = with_ctx(&instr, Cond::Al, |ctx| {
            emit_compare(ctx, &instr, CmpOp::Tst, r(0), Operand::Imm(0x80)).unwrap();
        });
        assert_eq!(words[0], enc::movz_w(XReg::X0, 0x80, 0));
        assert_eq!(words[1], enc::and_w(XReg::X1, x(19), XReg::X0));
    }

    #[test]
    fn test_vmove_through_context() {
        let config = EmitConfig::default();
        let mut ctx = EmitContext::new(&config, None, UnitShape::default());
        emit_vmove(&mut ctx, GuestDReg::new(20), GuestDReg::new(21)).unwrap();
        let words = ctx.buf.words();
        assert_eq!(words.len(), 2);
        let d21 = ContextLayout::dreg(GuestDReg::new(21));
        assert_eq!(words[0], enc::ldr_d(VReg::new(0), XReg::X27, d21));
        emit_vmove(&mut ctx, GuestDReg::new(1), GuestDReg::new(0)).unwrap();
        let last = *ctx.buf.words().last().unwrap();
        assert_eq!(last, enc::fmov_d(VReg::new(17), VReg::new(16)));
    }
}
