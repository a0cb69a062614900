//! Guest blocks and compilation units.

use crate::instr::{GuestInstr, InstrFlags};

/// Straight-line run of guest instructions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GuestBlock {
    /// Address of the first instruction.
    pub start: u32,
    /// The block ends in a backward branch.
    pub is_loop_end: bool,
    pub instructions: Vec<GuestInstr>,
}

impl GuestBlock {
    #[must_use]
    pub const fn new(start: u32) -> Self {
        Self {
            start,
            is_loop_end: false,
            instructions: Vec::new(),
        }
    }

    pub fn push(&mut self, instr: GuestInstr) {
        self.instructions.push(instr);
    }

    /// Address one past the last instruction.
    #[must_use]
    pub fn end(&self) -> u32 {
        self.instructions.last().map_or(self.start, GuestInstr::next_pc)
    }

    #[must_use]
    pub fn last(&self) -> Option<&GuestInstr> {
        self.instructions.last()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}

/// One compilation unit: the blocks discovered from a single entry point.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MultiBlock {
    pub blocks: Vec<GuestBlock>,
    /// Decoding stopped on a size or instruction limit.
    pub is_truncated: bool,
    /// Some instruction needs a full-context runtime call.
    pub has_host_call: bool,
    /// Some instruction needs a lightweight runtime call.
    pub has_host_call_skip_context: bool,
}

impl MultiBlock {
    /// Build a unit from blocks, deriving the host-call flags from the
    /// instructions.
    #[must_use]
    pub fn from_blocks(blocks: Vec<GuestBlock>) -> Self {
        let mut unit = Self {
            blocks,
            ..Self::default()
        };
        unit.refresh_host_call_flags();
        unit
    }

    /// Recompute `has_host_call*` from instruction flags. A loop-end block
    /// carries a sync-point check, which is a full-context call.
    pub fn refresh_host_call_flags(&mut self) {
        let flags = self.instructions().fold(InstrFlags::NONE, |acc, i| acc | i.flags);
        self.has_host_call =
            flags.contains(InstrFlags::HOST_CALL) || self.blocks.iter().any(|b| b.is_loop_end);
        self.has_host_call_skip_context = flags.contains(InstrFlags::HOST_CALL_SKIP_CONTEXT);
    }

    /// Entry address of the unit.
    #[must_use]
    pub fn start(&self) -> Option<u32> {
        self.blocks.first().map(|b| b.start)
    }

    /// Address after the last decoded instruction.
    #[must_use]
    pub fn end(&self) -> Option<u32> {
        self.blocks.last().map(GuestBlock::end)
    }

    /// Total guest bytes covered by the instructions.
    #[must_use]
    pub fn guest_bytes(&self) -> u32 {
        self.instructions().map(GuestInstr::size).sum()
    }

    pub fn instructions(&self) -> impl Iterator<Item = &GuestInstr> + '_ {
        self.blocks.iter().flat_map(|b| b.instructions.iter())
    }

    #[must_use]
    pub fn instruction_count(&self) -> usize {
        self.blocks.iter().map(GuestBlock::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.iter().all(GuestBlock::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instr::InstrKind;

    #[test]
    fn test_block_end() {
        let mut block = GuestBlock::new(0x1000);
        assert_eq!(block.end(), 0x1000);
        block.push(GuestInstr::new(0x1000, 0, "nop", InstrKind::Nop));
        block.push(GuestInstr::new(0x1004, 0, "nop", InstrKind::Nop));
        assert_eq!(block.end(), 0x1008);
        assert_eq!(block.len(), 2);
    }

    #[test]
    fn test_host_call_flags() {
        let mut block = GuestBlock::new(0);
        block.push(
            GuestInstr::new(0, 0, "svc", InstrKind::SupervisorCall { imm: 0 })
                .with_flags(InstrFlags::HOST_CALL_SKIP_CONTEXT),
        );
        let unit = MultiBlock::from_blocks(vec![block]);
        assert!(unit.has_host_call_skip_context);
        assert!(!unit.has_host_call);
        assert_eq!(unit.guest_bytes(), 4);
    }

    #[test]
    fn test_loop_end_needs_host_call() {
        let mut block = GuestBlock::new(0x100);
        block.push(GuestInstr::new(0x100, 0, "b", InstrKind::Branch { target: 0x100 }));
        block.is_loop_end = true;
        let unit = MultiBlock::from_blocks(vec![block]);
        assert!(unit.has_host_call);
        assert!(!unit.has_host_call_skip_context);
    }
}
