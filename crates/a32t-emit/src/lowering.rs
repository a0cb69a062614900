//! Conditional-execution lowering.
//!
//! A32 predicates every instruction; AArch64 predicates almost nothing. Runs
//! of instructions sharing a predicate are wrapped in a branch-over: an
//! inverted-condition `b.cond` placeholder that is patched to skip the run
//! once the predicate changes.

use a32t_ir::{Cond, GuestInstr, InstrKind, ItState, Operand};

use crate::arm64::enc;
use crate::codebuf::CodeBuffer;
use crate::error::{EmitError, Result};

/// Whether the instruction's emitter encodes its own predicate.
///
/// Only two families qualify: direct branches (`b.cond`) and plain register
/// moves that do not set flags (`csel`). Anything that writes NZCV must stay
/// inside a branch-over, so the list is deliberately short; a missing entry
/// costs a few words, a wrong entry corrupts flag state.
#[must_use]
pub const fn absorbs_condition(instr: &GuestInstr) -> bool {
    match instr.kind {
        InstrKind::Branch { .. } => true,
        InstrKind::Move {
            rd,
            operand: Operand::Reg(rm),
            negate: false,
        } => !instr.sets_flags() && !rd.is_pc() && !rm.is_pc(),
        _ => false,
    }
}

/// Lowering state for one unit.
#[derive(Clone, Debug, Default)]
pub struct CondLowering {
    active: Cond,
    open: Option<usize>,
    it: ItState,
}

impl CondLowering {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Predicate the instruction executes under: the IT block's if one is
    /// active, otherwise its own.
    #[must_use]
    pub fn predicate(&self, instr: &GuestInstr) -> Cond {
        self.it.current().unwrap_or(instr.cond)
    }

    /// Predicate the lowering itself must enforce for `instr`.
    #[must_use]
    pub fn lowered_predicate(&self, instr: &GuestInstr) -> Cond {
        if absorbs_condition(instr) {
            Cond::Al
        } else {
            self.predicate(instr)
        }
    }

    /// Predicate of the currently open region (`Al` when none).
    #[must_use]
    pub const fn active(&self) -> Cond {
        self.active
    }

    /// Index of the open branch-over placeholder.
    #[must_use]
    pub const fn open_site(&self) -> Option<usize> {
        self.open
    }

    /// Move to predicate `cond`, closing and opening regions as needed.
    ///
    /// # Errors
    /// The region being closed is longer than a conditional branch reaches.
    pub fn transition(&mut self, buf: &mut CodeBuffer, cond: Cond) -> Result<()> {
        if cond == self.active {
            return Ok(());
        }
        self.close(buf)?;
        if !cond.is_always() {
            self.open(buf, cond)?;
        }
        Ok(())
    }

    fn open(&mut self, buf: &mut CodeBuffer, cond: Cond) -> Result<()> {
        if cond.is_always() {
            return Err(EmitError::InvalidLoweringTransition(cond));
        }
        let site = buf.emit(enc::b_cond(cond.invert(), 0));
        self.open = Some(site);
        self.active = cond;
        Ok(())
    }

    /// Close the open region so it ends at the current buffer position.
    ///
    /// An empty region drops its placeholder.
    ///
    /// # Errors
    /// The region exceeds the ±2^18-word conditional branch range.
    pub fn close(&mut self, buf: &mut CodeBuffer) -> Result<()> {
        self.active = Cond::Al;
        let Some(open) = self.open.take() else {
            return Ok(());
        };
        let disp = CodeBuffer::disp(open, buf.ip());
        if disp == 1 {
            buf.erase_last();
            return Ok(());
        }
        if !enc::fits_imm19(disp) {
            return Err(EmitError::ConditionalRegionTooLong { open, disp });
        }
        let word = buf.read(open).ok_or(EmitError::NotAPlaceholder(open))?;
        buf.write(open, enc::with_disp(word, disp));
        Ok(())
    }

    /// Enter an IT block.
    pub const fn begin_it(&mut self, firstcond: u8, mask: u8) {
        self.it = ItState::new(firstcond, mask);
    }

    /// Step the IT block past one covered instruction.
    pub const fn advance_it(&mut self) {
        if self.it.is_active() {
            self.it.advance();
        }
    }

    #[must_use]
    pub const fn in_it_block(&self) -> bool {
        self.it.is_active()
    }
}
