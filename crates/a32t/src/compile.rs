//! Compilation orchestrator.
//!
//! One call to [`Compiler::compile`] turns one [`MultiBlock`] into one
//! [`CompiledUnit`]:
//!
//! 1. reserve the prologue words,
//! 2. emit every block in order, driving conditional lowering and the
//!    per-opcode emitter,
//! 3. resolve the pending fixups,
//! 4. emit the shared trailer,
//! 5. write the prologue over the reservation.

use tracing::{debug, trace_span};

use a32t_emit::arm64::enc;
use a32t_emit::arm64::registers::reserved;
use a32t_emit::dispatch::emit_exit;
use a32t_emit::hostcall::SpillLayout;
use a32t_emit::prologue::{Frame, emit_trailer, write_prologue};
use a32t_emit::{
    ContextLayout, DispatchTable, EmitConfig, EmitContext, EmitError, FixupKind, FixupTarget, HostHelpers,
    InstructionEmitter, PROLOGUE_MAX_WORDS, UnitShape,
};
use a32t_ir::{GuestBlock, InstrKind, MultiBlock};
use a32t_isa::{CodeImage, Linearizer};

use crate::resolve::{ResolveStats, resolve_fixups};
use crate::{Error, Result};

/// Translation options.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompileOptions {
    /// Instruction limit per unit.
    pub max_instructions: usize,
    /// Guest byte limit per unit.
    pub max_bytes: u32,
    /// Guest code runs in Thumb state.
    pub thumb: bool,
    pub helpers: HostHelpers,
    pub prologue_words: usize,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            max_instructions: 1024,
            max_bytes: 16 * 1024,
            thumb: false,
            helpers: HostHelpers::default(),
            prologue_words: PROLOGUE_MAX_WORDS,
        }
    }
}

impl CompileOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_max_instructions(mut self, max: usize) -> Self {
        self.max_instructions = max;
        self
    }

    #[must_use]
    pub const fn with_max_bytes(mut self, max: u32) -> Self {
        self.max_bytes = max;
        self
    }

    #[must_use]
    pub const fn with_thumb(mut self, thumb: bool) -> Self {
        self.thumb = thumb;
        self
    }

    #[must_use]
    pub const fn with_helpers(mut self, helpers: HostHelpers) -> Self {
        self.helpers = helpers;
        self
    }

    #[must_use]
    pub const fn with_prologue_words(mut self, words: usize) -> Self {
        self.prologue_words = words;
        self
    }

    #[must_use]
    pub fn linearizer(&self) -> Linearizer {
        Linearizer::new()
            .with_max_instructions(self.max_instructions)
            .with_max_bytes(self.max_bytes)
    }

    #[must_use]
    pub fn emit_config(&self) -> EmitConfig {
        EmitConfig::new(self.helpers)
            .with_thumb(self.thumb)
            .with_prologue_words(self.prologue_words)
    }
}

/// Shape of a finished unit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UnitStats {
    pub blocks: usize,
    pub guest_instructions: usize,
    pub resolve: ResolveStats,
    /// Exits sharing the trailer.
    pub exits: usize,
    pub conditional_exits: usize,
    pub trailer: Option<usize>,
    pub prologue_words: usize,
    pub spill_bytes: u32,
    pub truncated: bool,
}

/// Host code for one guest region, ready to install.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompiledUnit {
    /// Guest address of the first instruction.
    pub start: u32,
    /// Guest bytes the unit covers.
    pub guest_bytes: u32,
    pub code: Vec<u32>,
    pub stats: UnitStats,
}

impl CompiledUnit {
    /// Code as little-endian bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.code.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[must_use]
    pub fn host_bytes(&self) -> usize {
        self.code.len() * 4
    }
}

/// Drives one emitter over whole units.
pub struct Compiler<'a, E> {
    options: CompileOptions,
    config: EmitConfig,
    emitter: E,
    dispatch: Option<&'a dyn DispatchTable>,
}

impl<'a, E: InstructionEmitter> Compiler<'a, E> {
    pub fn new(options: CompileOptions, emitter: E) -> Self {
        let config = options.emit_config();
        Self {
            options,
            config,
            emitter,
            dispatch: None,
        }
    }

    /// Resolve constant exit targets through `table`.
    #[must_use]
    pub fn with_dispatch(mut self, table: &'a dyn DispatchTable) -> Self {
        self.dispatch = Some(table);
        self
    }

    pub const fn options(&self) -> &CompileOptions {
        &self.options
    }

    /// Linearize the region at `entry` and compile it.
    ///
    /// # Errors
    /// Decode failures and internal emission defects.
    pub fn translate(&self, image: &CodeImage<'_>, entry: u32) -> Result<CompiledUnit> {
        let unit = self.options.linearizer().linearize(image, entry)?;
        self.compile(&unit)
    }

    /// Compile one unit.
    ///
    /// # Errors
    /// The unit is empty, or emission hit an internal defect.
    pub fn compile(&self, unit: &MultiBlock) -> Result<CompiledUnit> {
        let start = unit.start().ok_or(Error::EmptyUnit)?;
        let span = trace_span!("compile", start);
        let _enter = span.enter();

        let mut ctx = EmitContext::new(&self.config, self.dispatch, UnitShape::of(unit));
        ctx.reserve_prologue();
        self.emit_body(&mut ctx, unit)?;

        let mut stats = UnitStats {
            blocks: unit.blocks.len(),
            guest_instructions: unit.instruction_count(),
            truncated: unit.is_truncated,
            ..UnitStats::default()
        };
        resolve_fixups(&mut ctx, &mut stats.resolve)?;

        let spill = SpillLayout::compute(&ctx.regs, ctx.shape());
        let frame = Frame::new(&ctx.regs, &spill)?;
        let tail = std::mem::take(&mut ctx.tail);
        stats.exits = tail.len();
        stats.conditional_exits = tail.conditional_count();
        stats.trailer = tail.finalize(&mut ctx.buf, |buf| {
            emit_trailer(buf, &frame, &ctx.regs);
            Ok(())
        })?;
        stats.prologue_words = write_prologue(&mut ctx.buf, self.config.prologue_words, &frame, &ctx.regs)?;
        stats.spill_bytes = frame.spill_bytes();

        let compiled = CompiledUnit {
            start,
            guest_bytes: unit.guest_bytes(),
            code: ctx.buf.into_words(),
            stats,
        };
        debug!(
            start,
            guest_bytes = compiled.guest_bytes,
            words = compiled.code.len(),
            fixups = stats.resolve.fixups,
            exits = stats.exits,
            "compiled unit"
        );
        crate::metrics::record_unit(&compiled);
        Ok(compiled)
    }

    fn emit_body(&self, ctx: &mut EmitContext<'_>, unit: &MultiBlock) -> std::result::Result<(), EmitError> {
        let mut prev: Option<(&GuestBlock, bool)> = None;
        for block in &unit.blocks {
            if let Some((prev, ended)) = prev {
                if !ended && prev.end() != block.start {
                    emit_exit(ctx, prev.end())?;
                }
            }
            let ended = self.emit_block(ctx, block)?;
            prev = Some((block, ended));
        }
        if let Some((last, false)) = prev {
            emit_exit(ctx, last.end())?;
        }
        Ok(())
    }

    /// Emit one block. Returns whether its last instruction never falls
    /// through under its effective predicate.
    fn emit_block(&self, ctx: &mut EmitContext<'_>, block: &GuestBlock) -> std::result::Result<bool, EmitError> {
        ctx.mark_block_start(block.start);
        let count = block.len();
        let mut ended = false;
        for (i, instr) in block.instructions.iter().enumerate() {
            if let InstrKind::IfThen { firstcond, mask } = instr.kind {
                ctx.lowering.begin_it(firstcond, mask);
                ended = false;
                continue;
            }
            let pred = ctx.lowering.predicate(instr);
            ended = instr.ends_flow_under(pred);
            if !pred.is_always() {
                ctx.regs.mark_flags_used();
            }
            ctx.begin_instr(instr, pred);
            if block.is_loop_end && i + 1 == count {
                ctx.lowering.close(&mut ctx.buf)?;
                emit_sync_check(ctx)?;
            }
            let lowered = ctx.lowering.lowered_predicate(instr);
            ctx.lowering.transition(&mut ctx.buf, lowered)?;
            self.emitter.emit(ctx, instr)?;
            ctx.end_instr();
            if instr.sets_flags() {
                ctx.regs.mark_flags_used();
                ctx.lowering.close(&mut ctx.buf)?;
            }
            ctx.lowering.advance_it();
        }
        ctx.lowering.close(&mut ctx.buf)?;
        Ok(ended)
    }
}

/// Decrement the execution counter and call the sync helper when it hits
/// zero. Flag-neutral.
fn emit_sync_check(ctx: &mut EmitContext<'_>) -> std::result::Result<(), EmitError> {
    ctx.emit(enc::ldr_w(reserved::SCRATCH, reserved::CONTEXT_PTR, ContextLayout::EXEC_COUNTER));
    ctx.emit(enc::sub_w_imm(reserved::SCRATCH, reserved::SCRATCH, 1));
    ctx.emit(enc::str_w(reserved::SCRATCH, reserved::CONTEXT_PTR, ContextLayout::EXEC_COUNTER));
    ctx.emit(enc::cbnz_w(reserved::SCRATCH, 2));
    ctx.push_fixup(FixupKind::SyncPoint, FixupTarget::None)?;
    Ok(())
}
