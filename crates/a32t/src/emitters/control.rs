//! Control transfers and guest traps. Each leaves one placeholder.

use a32t_emit::dispatch::{write_dispatch_address, write_dispatch_register};
use a32t_emit::{EmitContext, FixupKind, FixupTarget, Result};
use a32t_ir::{ExceptionKind, GuestReg};

pub(super) fn emit_branch(ctx: &mut EmitContext<'_>, target: u32) -> Result<()> {
    let cond = ctx.cond();
    let kind = if cond.is_always() { FixupKind::Branch } else { FixupKind::CondBranch(cond) };
    ctx.push_fixup(kind, FixupTarget::Address(target))?;
    Ok(())
}

fn write_link(ctx: &mut EmitContext<'_>) -> Result<()> {
    let lr = ctx.guest_gpr(GuestReg::LR)?;
    let value = ctx.config().link_value(ctx.next_pc());
    ctx.buf.emit_mov_imm32(lr, value);
    Ok(())
}

pub(super) fn emit_branch_link(ctx: &mut EmitContext<'_>, target: u32) -> Result<()> {
    write_link(ctx)?;
    ctx.push_fixup(FixupKind::Call, FixupTarget::Address(target))?;
    Ok(())
}

pub(super) fn emit_branch_exchange(ctx: &mut EmitContext<'_>, rm: GuestReg) -> Result<()> {
    ctx.push_fixup(FixupKind::IndirectBranch, FixupTarget::Register(rm))?;
    Ok(())
}

/// `blx rm`: the target is captured in the dispatch slot before the link
/// register is overwritten, so `blx lr` calls the old value.
pub(super) fn emit_branch_link_exchange(ctx: &mut EmitContext<'_>, rm: GuestReg) -> Result<()> {
    if rm.is_pc() {
        let pc = ctx.pc_value();
        write_dispatch_address(ctx, pc);
    } else {
        let host = ctx.guest_gpr(rm)?;
        write_dispatch_register(ctx, host);
    }
    write_link(ctx)?;
    ctx.push_fixup(FixupKind::IndirectCall, FixupTarget::None)?;
    Ok(())
}

pub(super) fn emit_table_branch(ctx: &mut EmitContext<'_>, rn: GuestReg, rm: GuestReg, halfword: bool) -> Result<()> {
    ctx.push_fixup(FixupKind::TableBranch { halfword }, FixupTarget::Registers(rn, rm))?;
    Ok(())
}

pub(super) fn emit_supervisor_call(ctx: &mut EmitContext<'_>, imm: u32) -> Result<()> {
    ctx.push_fixup(FixupKind::SoftwareInterrupt { imm }, FixupTarget::None)?;
    Ok(())
}

pub(super) fn emit_breakpoint(ctx: &mut EmitContext<'_>, imm: u16) -> Result<()> {
    let kind = FixupKind::Exception {
        kind: ExceptionKind::Breakpoint,
        imm: u32::from(imm),
    };
    ctx.push_fixup(kind, FixupTarget::None)?;
    Ok(())
}

/// The raw encoding goes to the handler as the immediate.
pub(super) fn emit_undefined(ctx: &mut EmitContext<'_>, encoding: u32) -> Result<()> {
    let kind = FixupKind::Exception {
        kind: ExceptionKind::Undefined,
        imm: encoding,
    };
    ctx.push_fixup(kind, FixupTarget::None)?;
    Ok(())
}

pub(super) fn emit_read_timer(ctx: &mut EmitContext<'_>, rt: GuestReg, rt2: GuestReg) -> Result<()> {
    ctx.push_fixup(FixupKind::TimerRead, FixupTarget::Registers(rt, rt2))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use a32t_emit::arm64::enc;
    use a32t_emit::arm64::registers::XReg;
    use a32t_emit::{ContextLayout, EmitConfig, UnitShape};
    use a32t_ir::{Cond, GuestInstr, InstrKind};

    fn at(ctx: &mut EmitContext<'_>, pc: u32, cond: Cond) {
        ctx.begin_instr(&GuestInstr::new(pc, 0, "t", InstrKind::Nop), cond);
    }

    #[test]
    fn test_predicated_branch_is_conditional_fixup() {
        let config = EmitConfig::default();
        let mut ctx = EmitContext::new(&config, None, UnitShape::default());
        at(&mut ctx, 0x100, Cond::Lt);
        emit_branch(&mut ctx, 0x80).unwrap();
        let fixup = *ctx.fixups.iter().next().unwrap();
        assert_eq!(fixup.kind, FixupKind::CondBranch(Cond::Lt));
        assert_eq!(fixup.target, FixupTarget::Address(0x80));
        assert!(ctx.regs.uses_flags());
    }

    #[test]
    fn test_branch_link_writes_return_address() {
        let config = EmitConfig::default();
        let mut ctx = EmitContext::new(&config, None, UnitShape::default());
        at(&mut ctx, 0x100, Cond::Al);
        emit_branch_link(&mut ctx, 0x4000).unwrap();
        assert_eq!(ctx.buf.words()[0], enc::movz_w(XReg::new(15), 0x104, 0));
        assert_eq!(ctx.fixups.iter().next().unwrap().kind, FixupKind::Call);
    }

    #[test]
    fn test_thumb_link_has_low_bit() {
        let config = EmitConfig::default().with_thumb(true);
        let mut ctx = EmitContext::new(&config, None, UnitShape::default());
        at(&mut ctx, 0x100, Cond::Al);
        emit_branch_link(&mut ctx, 0x4000).unwrap();
        assert_eq!(ctx.buf.words()[0], enc::movz_w(XReg::new(15), 0x105, 0));
    }

    #[test]
    fn test_blx_lr_captures_target_first() {
        let config = EmitConfig::default();
        let mut ctx = EmitContext::new(&config, None, UnitShape::default());
        at(&mut ctx, 0x100, Cond::Al);
        emit_branch_link_exchange(&mut ctx, GuestReg::LR).unwrap();
        let words = ctx.buf.words();
        assert_eq!(words[0], enc::str_w(XReg::new(15), XReg::X27, ContextLayout::DISPATCH_ADDRESS));
        assert_eq!(words[1], enc::movz_w(XReg::new(15), 0x104, 0));
        let fixup = *ctx.fixups.iter().next().unwrap();
        assert_eq!(fixup.kind, FixupKind::IndirectCall);
        assert_eq!(fixup.next_pc, 0x104);
    }

    #[test]
    fn test_undefined_passes_encoding() {
        let config = EmitConfig::default();
        let mut ctx = EmitContext::new(&config, None, UnitShape::default());
        at(&mut ctx, 0x100, Cond::Al);
        emit_undefined(&mut ctx, 0xE7F0_00F0).unwrap();
        assert_eq!(
            ctx.fixups.iter().next().unwrap().kind,
            FixupKind::Exception {
                kind: ExceptionKind::Undefined,
                imm: 0xE7F0_00F0
            }
        );
    }
}
