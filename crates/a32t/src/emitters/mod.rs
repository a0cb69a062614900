//! Reference A32 instruction emitters.
//!
//! Data processing and FP moves are lowered inline onto the pinned host
//! registers. Control transfers and traps only leave a fixup; the resolution
//! pass materializes them.

mod alu;
mod control;

use tracing::trace;

use a32t_emit::arm64::registers::XReg;
use a32t_emit::{EmitContext, InstructionEmitter, Result, ScopedRegister};
use a32t_ir::{GuestInstr, GuestReg, InstrKind, Operand};

/// Emitter for every [`InstrKind`] the reference decoder produces.
#[derive(Clone, Copy, Debug, Default)]
pub struct A32Emitter;

impl A32Emitter {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl InstructionEmitter for A32Emitter {
    fn emit(&self, ctx: &mut EmitContext<'_>, instr: &GuestInstr) -> Result<()> {
        trace!(pc = instr.address, name = instr.name, cond = %ctx.cond(), "emit");
        match instr.kind {
            InstrKind::Alu { op, rd, rn, operand } => alu::emit_alu(ctx, instr, op, rd, rn, operand),
            InstrKind::Move { rd, operand, negate } => alu::emit_move(ctx, instr, rd, operand, negate),
            InstrKind::Compare { op, rn, operand } => alu::emit_compare(ctx, instr, op, rn, operand),
            InstrKind::VMove { dd, dm } => alu::emit_vmove(ctx, dd, dm),
            InstrKind::Branch { target } => control::emit_branch(ctx, target),
            InstrKind::BranchLink { target } => control::emit_branch_link(ctx, target),
            InstrKind::BranchExchange { rm } => control::emit_branch_exchange(ctx, rm),
            InstrKind::BranchLinkExchange { rm } => control::emit_branch_link_exchange(ctx, rm),
            InstrKind::TableBranch { rn, rm, halfword } => control::emit_table_branch(ctx, rn, rm, halfword),
            InstrKind::SupervisorCall { imm } => control::emit_supervisor_call(ctx, imm),
            InstrKind::Breakpoint { imm } => control::emit_breakpoint(ctx, imm),
            InstrKind::Undefined => control::emit_undefined(ctx, instr.encoding),
            InstrKind::ReadTimer { rt, rt2 } => control::emit_read_timer(ctx, rt, rt2),
            // IT is consumed by the orchestrator.
            InstrKind::IfThen { .. } | InstrKind::Nop => Ok(()),
        }
    }
}

/// A guest value in a host register: pinned, or materialized in a lease.
enum Value {
    Pinned(XReg),
    Temp(ScopedRegister<XReg>),
}

impl Value {
    fn reg(&self) -> XReg {
        match self {
            Self::Pinned(reg) => *reg,
            Self::Temp(lease) => lease.reg(),
        }
    }
}

fn constant(ctx: &mut EmitContext<'_>, value: u32) -> Result<Value> {
    if value == 0 {
        return Ok(Value::Pinned(XReg::ZR));
    }
    let temp = ctx.regs.allocate_gpr()?;
    ctx.buf.emit_mov_imm32(temp.reg(), value);
    Ok(Value::Temp(temp))
}

/// Read guest `reg`; `pc` reads as the instruction's pc value.
fn read_gpr(ctx: &mut EmitContext<'_>, reg: GuestReg) -> Result<Value> {
    if reg.is_pc() {
        let pc = ctx.pc_value();
        return constant(ctx, pc);
    }
    Ok(Value::Pinned(ctx.guest_gpr(reg)?))
}

fn read_operand(ctx: &mut EmitContext<'_>, operand: Operand) -> Result<Value> {
    match operand {
        Operand::Reg(reg) => read_gpr(ctx, reg),
        Operand::Imm(value) => constant(ctx, value),
    }
}

/// Destination for a write to guest `reg`; writes to `pc` land in a lease.
fn write_target(ctx: &mut EmitContext<'_>, reg: GuestReg) -> Result<Value> {
    if reg.is_pc() {
        Ok(Value::Temp(ctx.regs.allocate_gpr()?))
    } else {
        Ok(Value::Pinned(ctx.guest_gpr(reg)?))
    }
}
