//! Per-unit emission context.
//!
//! One `EmitContext` exists per compilation. It owns every piece of mutable
//! pipeline state and is threaded by `&mut` through the orchestrator, the
//! instruction emitters and the resolution pass.

use rustc_hash::FxHashMap;

use a32t_ir::{Cond, GuestInstr, GuestReg, MultiBlock};

use crate::arm64::enc;
use crate::arm64::registers::XReg;
use crate::codebuf::CodeBuffer;
use crate::config::EmitConfig;
use crate::dispatch::DispatchTable;
use crate::error::Result;
use crate::fixup::{FixupKind, FixupList, FixupTarget, PendingFixup};
use crate::lowering::CondLowering;
use crate::regalloc::RegisterAllocator;
use crate::tail::TailMerger;

/// Host-call tiers the unit needs; fixes the frame shape.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UnitShape {
    pub has_host_call: bool,
    pub has_host_call_skip_context: bool,
}

impl UnitShape {
    #[must_use]
    pub const fn of(unit: &MultiBlock) -> Self {
        Self {
            has_host_call: unit.has_host_call,
            has_host_call_skip_context: unit.has_host_call_skip_context,
        }
    }
}

/// Instruction currently being emitted.
#[derive(Clone, Copy, Debug)]
struct Current {
    pc: u32,
    next_pc: u32,
    pc_value: u32,
    cond: Cond,
}

pub struct EmitContext<'a> {
    pub buf: CodeBuffer,
    pub regs: RegisterAllocator,
    pub fixups: FixupList,
    pub lowering: CondLowering,
    pub tail: TailMerger,
    config: &'a EmitConfig,
    dispatch: Option<&'a dyn DispatchTable>,
    shape: UnitShape,
    /// Guest block start -> buffer index.
    targets: FxHashMap<u32, usize>,
    current: Option<Current>,
}

impl<'a> EmitContext<'a> {
    #[must_use]
    pub fn new(config: &'a EmitConfig, dispatch: Option<&'a dyn DispatchTable>, shape: UnitShape) -> Self {
        Self {
            buf: CodeBuffer::new(),
            regs: RegisterAllocator::new(),
            fixups: FixupList::new(),
            lowering: CondLowering::new(),
            tail: TailMerger::new(),
            config,
            dispatch,
            shape,
            targets: FxHashMap::default(),
            current: None,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &'a EmitConfig {
        self.config
    }

    #[must_use]
    pub const fn dispatch(&self) -> Option<&'a dyn DispatchTable> {
        self.dispatch
    }

    #[must_use]
    pub const fn shape(&self) -> UnitShape {
        self.shape
    }

    /// Fill the prologue reservation with `nop`s. Must run on an empty buffer.
    pub fn reserve_prologue(&mut self) {
        debug_assert!(self.buf.is_empty());
        for _ in 0..self.config.prologue_words {
            self.buf.emit(enc::nop());
        }
    }

    /// Record that guest `addr` starts at the current buffer position.
    /// The first recording wins.
    pub fn mark_block_start(&mut self, addr: u32) {
        let ip = self.buf.ip();
        self.targets.entry(addr).or_insert(ip);
    }

    #[must_use]
    pub fn target_index(&self, addr: u32) -> Option<usize> {
        self.targets.get(&addr).copied()
    }

    #[must_use]
    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    /// Make `instr` the current instruction, executing under `cond`.
    pub fn begin_instr(&mut self, instr: &GuestInstr, cond: Cond) {
        self.current = Some(Current {
            pc: instr.address,
            next_pc: instr.next_pc(),
            pc_value: instr.pc_read_value(),
            cond,
        });
    }

    pub fn end_instr(&mut self) {
        self.current = None;
    }

    /// Predicate of the current instruction.
    #[must_use]
    pub fn cond(&self) -> Cond {
        self.current.map_or(Cond::Al, |c| c.cond)
    }

    #[must_use]
    pub fn pc(&self) -> u32 {
        self.current.map_or(0, |c| c.pc)
    }

    #[must_use]
    pub fn next_pc(&self) -> u32 {
        self.current.map_or(0, |c| c.next_pc)
    }

    /// Value the current instruction reads for `pc`.
    #[must_use]
    pub fn pc_value(&self) -> u32 {
        self.current.map_or(0, |c| c.pc_value)
    }

    /// Host register of guest `reg`.
    ///
    /// # Errors
    /// `reg` is `pc`.
    pub fn guest_gpr(&mut self, reg: GuestReg) -> Result<XReg> {
        self.regs.remap_gpr(reg)
    }

    pub fn emit(&mut self, word: u32) -> usize {
        self.buf.emit(word)
    }

    /// Append a placeholder for a control edge and queue its fixup.
    ///
    /// Guest registers named by `target` are remapped now so the unit's
    /// register masks are complete before resolution starts.
    ///
    /// # Errors
    /// Propagates remapping failures.
    pub fn push_fixup(&mut self, kind: FixupKind, target: FixupTarget) -> Result<usize> {
        for reg in target.registers().filter(|r| !r.is_pc()) {
            self.regs.remap_gpr(reg)?;
        }
        if let FixupKind::CondBranch(_) = kind {
            self.regs.mark_flags_used();
        }
        let site = self.buf.emit(kind.placeholder());
        self.fixups.push(PendingFixup {
            kind,
            target,
            site,
            pc: self.pc(),
            next_pc: self.next_pc(),
            pc_value: self.pc_value(),
        });
        Ok(site)
    }
}
