//! Per-opcode emission seam.

use a32t_ir::GuestInstr;

use crate::context::EmitContext;
use crate::error::Result;

/// Translates one guest instruction into host code.
///
/// Called once per instruction with the lowering transition already applied:
/// the implementation only emits the instruction's own semantics, leasing
/// temporaries from `ctx.regs` and queuing fixups for control transfers. All
/// leases must be released before returning.
pub trait InstructionEmitter: Sync {
    /// # Errors
    /// Internal defects only; guest content never fails emission.
    fn emit(&self, ctx: &mut EmitContext<'_>, instr: &GuestInstr) -> Result<()>;
}
