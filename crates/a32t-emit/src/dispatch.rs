//! Tail dispatch.
//!
//! An exit leaves the guest target in the context's dispatch slot and the
//! host code pointer to continue at in `x16`, then branches to the shared
//! trailer, which ends in `br x16`.

use rustc_hash::FxHashMap;

use crate::arm64::enc;
use crate::arm64::registers::{XReg, reserved};
use crate::context::EmitContext;
use crate::error::Result;
use crate::layout::ContextLayout;
use crate::tail::ExitCondition;

/// Lookup from guest address to the host address of a dispatch-table slot.
///
/// The slot holds a pointer to translated code for that address (or to the
/// fallback dispatcher while none exists); generated code loads through it at
/// run time, so slots can be repointed after a unit is installed.
pub trait DispatchTable: Sync {
    fn slot_for(&self, guest: u32) -> Option<u64>;
}

impl DispatchTable for FxHashMap<u32, u64> {
    fn slot_for(&self, guest: u32) -> Option<u64> {
        self.get(&guest).copied()
    }
}

/// Dense table of 8-byte slots at `base`, one per registered address.
#[derive(Clone, Debug, Default)]
pub struct SlotTable {
    base: u64,
    index: FxHashMap<u32, u32>,
}

impl SlotTable {
    #[must_use]
    pub fn new(base: u64) -> Self {
        Self {
            base,
            index: FxHashMap::default(),
        }
    }

    /// Assign a slot to `guest`, returning its host address.
    pub fn insert(&mut self, guest: u32) -> u64 {
        let next = u32::try_from(self.index.len()).unwrap_or(u32::MAX);
        let slot = *self.index.entry(guest).or_insert(next);
        self.base + 8 * u64::from(slot)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

impl DispatchTable for SlotTable {
    fn slot_for(&self, guest: u32) -> Option<u64> {
        self.index.get(&guest).map(|&slot| self.base + 8 * u64::from(slot))
    }
}

/// Store a constant guest address into the dispatch slot.
pub fn write_dispatch_address(ctx: &mut EmitContext<'_>, guest: u32) {
    ctx.buf.emit_mov_imm32(reserved::SCRATCH, guest);
    ctx.buf.emit(enc::str_w(reserved::SCRATCH, reserved::CONTEXT_PTR, ContextLayout::DISPATCH_ADDRESS));
}

/// Store the low word of `reg` into the dispatch slot.
pub fn write_dispatch_register(ctx: &mut EmitContext<'_>, reg: XReg) {
    ctx.buf.emit(enc::str_w(reg, reserved::CONTEXT_PTR, ContextLayout::DISPATCH_ADDRESS));
}

/// Point `x16` at the code for `target`: its table slot when the target is
/// constant and the table knows it, the fallback dispatcher otherwise.
pub fn load_dispatch_target(ctx: &mut EmitContext<'_>, target: Option<u32>) {
    let slot = target.and_then(|t| ctx.dispatch().and_then(|table| table.slot_for(t)));
    match slot {
        Some(addr) => {
            ctx.buf.emit_mov_imm64(reserved::DISPATCH, addr);
            ctx.buf.emit(enc::ldr_x(reserved::DISPATCH, reserved::DISPATCH, 0));
        }
        None => {
            let fallback = ctx.config().helpers.fallback_dispatcher;
            ctx.buf.emit_mov_imm64(reserved::DISPATCH, fallback);
        }
    }
}

/// Exit to a constant guest address. Returns the exit's branch index.
///
/// # Errors
/// Propagates tail-merger registration errors.
pub fn emit_exit(ctx: &mut EmitContext<'_>, guest: u32) -> Result<usize> {
    write_dispatch_address(ctx, guest);
    load_dispatch_target(ctx, Some(guest));
    ctx.tail.register(&mut ctx.buf, ExitCondition::Always)
}

/// Exit to the guest address held in `reg`.
///
/// # Errors
/// Propagates tail-merger registration errors.
pub fn emit_exit_to_register(ctx: &mut EmitContext<'_>, reg: XReg) -> Result<usize> {
    write_dispatch_register(ctx, reg);
    load_dispatch_target(ctx, None);
    ctx.tail.register(&mut ctx.buf, ExitCondition::Always)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EmitConfig, HostHelpers};
    use crate::context::UnitShape;

    fn config() -> EmitConfig {
        EmitConfig::new(HostHelpers::at_stride(0x7000_0000, 0x100))
    }

    #[test]
    fn test_slot_table() {
        let mut table = SlotTable::new(0x1000);
        assert_eq!(table.insert(0x8000), 0x1000);
        assert_eq!(table.insert(0x9000), 0x1008);
        assert_eq!(table.insert(0x8000), 0x1000);
        assert_eq!(table.len(), 2);
        assert_eq!(table.slot_for(0x9000), Some(0x1008));
        assert_eq!(table.slot_for(0xA000), None);
    }

    #[test]
    fn test_exit_through_table_slot() {
        let config = config();
        let mut table = SlotTable::new(0x5000);
        table.insert(0x8000);
        let mut ctx = EmitContext::new(&config, Some(&table as &dyn DispatchTable), UnitShape::default());
        emit_exit(&mut ctx, 0x8000).unwrap();
        let words = ctx.buf.words();
        assert!(words.contains(&enc::ldr_x(XReg::X16, XReg::X16, 0)));
        assert!(words.contains(&enc::movz_x(XReg::X16, 0x5000, 0)));
        assert_eq!(ctx.tail.len(), 1);
    }

    #[test]
    fn test_exit_without_table_uses_fallback() {
        let config = config();
        let mut ctx = EmitContext::new(&config, None, UnitShape::default());
        emit_exit(&mut ctx, 0x8000).unwrap();
        let words = ctx.buf.words();
        assert!(!words.contains(&enc::ldr_x(XReg::X16, XReg::X16, 0)));
        assert!(words.contains(&enc::movz_x(XReg::X16, 0x7000, 1)));
        assert!(enc::is_b(*words.last().unwrap()));
    }

    #[test]
    fn test_register_exit_stores_register() {
        let config = config();
        let mut ctx = EmitContext::new(&config, None, UnitShape::default());
        emit_exit_to_register(&mut ctx, XReg::new(20)).unwrap();
        assert_eq!(
            ctx.buf.words()[0],
            enc::str_w(XReg::new(20), XReg::X27, ContextLayout::DISPATCH_ADDRESS)
        );
    }
}
