//! Emission configuration.

/// Host addresses of the runtime routines generated code calls or jumps to.
///
/// All routines follow the host C ABI. The dispatcher and call targets take
/// `(ctx, page_table)` and return the next guest address; helpers take the
/// context first and return a value in `x0`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HostHelpers {
    /// Looks up the guest address in the dispatch slot and runs it.
    pub fallback_dispatcher: u64,
    /// `(ctx) -> u64`: non-zero asks the unit to exit.
    pub sync_check: u64,
    /// `(ctx, imm, next_pc) -> u32` next guest address.
    pub software_interrupt: u64,
    /// `(ctx, kind, pc, imm) -> u32` next guest address.
    pub exception: u64,
    /// `(ctx) -> u64` counter value.
    pub timer_read: u64,
    /// `(ctx, base, index, halfword, pc) -> u32` branch target.
    pub table_branch: u64,
}

impl HostHelpers {
    /// Helpers laid out at a fixed stride from `base`, in field order.
    #[must_use]
    pub const fn at_stride(base: u64, stride: u64) -> Self {
        Self {
            fallback_dispatcher: base,
            sync_check: base + stride,
            software_interrupt: base + 2 * stride,
            exception: base + 3 * stride,
            timer_read: base + 4 * stride,
            table_branch: base + 5 * stride,
        }
    }
}

/// Words reserved at the start of every unit for the prologue.
pub const PROLOGUE_MAX_WORDS: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmitConfig {
    pub helpers: HostHelpers,
    /// Guest code is Thumb: link values carry bit 0.
    pub thumb: bool,
    pub prologue_words: usize,
}

impl Default for EmitConfig {
    fn default() -> Self {
        Self {
            helpers: HostHelpers::default(),
            thumb: false,
            prologue_words: PROLOGUE_MAX_WORDS,
        }
    }
}

impl EmitConfig {
    #[must_use]
    pub fn new(helpers: HostHelpers) -> Self {
        Self {
            helpers,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_thumb(mut self, thumb: bool) -> Self {
        self.thumb = thumb;
        self
    }

    #[must_use]
    pub const fn with_prologue_words(mut self, words: usize) -> Self {
        self.prologue_words = words;
        self
    }

    /// Guest link-register value for a call returning to `next_pc`.
    #[must_use]
    pub const fn link_value(&self, next_pc: u32) -> u32 {
        if self.thumb { next_pc | 1 } else { next_pc }
    }
}
