//! Multi-block discovery.
//!
//! Starting from an entry point, decode straight ahead and cut a new block
//! after every control transfer and at every forward branch target seen so
//! far. Decoding continues past an unconditional transfer only while some
//! earlier forward branch still targets code further ahead.

use rustc_hash::FxHashSet;
use tracing::{debug, trace};

use a32t_ir::{GuestBlock, GuestInstr, InstrFlags, MultiBlock};

use crate::decode::decode_at;
use crate::error::DecodeError;

/// Guest code bytes mapped at `base`.
#[derive(Clone, Copy, Debug)]
pub struct CodeImage<'a> {
    pub base: u32,
    pub bytes: &'a [u8],
}

impl<'a> CodeImage<'a> {
    #[must_use]
    pub const fn new(base: u32, bytes: &'a [u8]) -> Self {
        Self { base, bytes }
    }

    /// Address one past the image.
    #[must_use]
    pub fn end(&self) -> u64 {
        u64::from(self.base) + self.bytes.len() as u64
    }

    #[must_use]
    pub fn contains(&self, addr: u32, len: u32) -> bool {
        addr >= self.base && u64::from(addr) + u64::from(len) <= self.end()
    }
}

/// Splits guest code into compilation units.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Linearizer {
    max_instructions: usize,
    max_bytes: u32,
}

impl Default for Linearizer {
    fn default() -> Self {
        Self {
            max_instructions: 1024,
            max_bytes: 16 * 1024,
        }
    }
}

impl Linearizer {
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

    /// Decode the unit starting at `entry`.
    ///
    /// # Errors
    /// `entry` is outside the image or misaligned.
    pub fn linearize(&self, image: &CodeImage<'_>, entry: u32) -> Result<MultiBlock, DecodeError> {
        if !image.contains(entry, 4) {
            return Err(DecodeError::EntryOutsideImage(entry));
        }
        let mut targets = FxHashSet::default();
        let mut blocks = Vec::new();
        let mut block = GuestBlock::new(entry);
        let mut addr = entry;
        let mut count = 0usize;
        let mut truncated = false;

        loop {
            if count >= self.max_instructions || addr.wrapping_sub(entry) >= self.max_bytes {
                truncated = true;
                break;
            }
            if !image.contains(addr, 4) {
                truncated = true;
                break;
            }
            let instr = decode_at(image.bytes, image.base, addr)?;
            if targets.contains(&addr) && !block.is_empty() {
                blocks.push(std::mem::replace(&mut block, GuestBlock::new(addr)));
            }
            count += 1;
            addr = instr.next_pc();

            let backward = Self::note_target(&instr, &mut targets);
            let transfer = instr.flags.contains(InstrFlags::BRANCH);
            let ends_flow = instr.ends_flow();
            trace!(pc = instr.address, name = instr.name, transfer, "decoded");
            block.push(instr);

            if transfer {
                block.is_loop_end = backward;
                blocks.push(std::mem::replace(&mut block, GuestBlock::new(addr)));
                if ends_flow && !targets.iter().any(|&t| t >= addr) {
                    break;
                }
            }
        }
        if !block.is_empty() {
            blocks.push(block);
        }

        let mut unit = MultiBlock::from_blocks(blocks);
        unit.is_truncated = truncated;
        debug!(
            entry,
            blocks = unit.blocks.len(),
            instructions = unit.instruction_count(),
            truncated,
            "linearized unit"
        );
        Ok(unit)
    }

    /// Record a forward direct-branch target; report whether the branch
    /// goes backward.
    fn note_target(instr: &GuestInstr, targets: &mut FxHashSet<u32>) -> bool {
        if instr.kind.is_call() {
            return false;
        }
        match instr.kind.direct_target() {
            Some(t) if t <= instr.address => true,
            Some(t) => {
                targets.insert(t);
                false
            }
            None => false,
        }
    }
}
