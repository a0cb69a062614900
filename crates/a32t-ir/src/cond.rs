//! Condition codes and Thumb IT-block state.

use std::fmt;

/// ARM condition code.
///
/// The numbering is shared by A32 and A64, so a guest condition can be
/// re-encoded into a host conditional branch without translation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Cond {
    Eq = 0b0000,
    Ne = 0b0001,
    Cs = 0b0010,
    Cc = 0b0011,
    Mi = 0b0100,
    Pl = 0b0101,
    Vs = 0b0110,
    Vc = 0b0111,
    Hi = 0b1000,
    Ls = 0b1001,
    Ge = 0b1010,
    Lt = 0b1011,
    Gt = 0b1100,
    Le = 0b1101,
    #[default]
    Al = 0b1110,
}

impl Cond {
    /// Decode a 4-bit condition field.
    ///
    /// `0b1111` is the unconditional extension space in A32; it is reported as
    /// `None` so the decoder can route it separately.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Option<Self> {
        Some(match bits & 0xF {
            0b0000 => Self::Eq,
            0b0001 => Self::Ne,
            0b0010 => Self::Cs,
            0b0011 => Self::Cc,
            0b0100 => Self::Mi,
            0b0101 => Self::Pl,
            0b0110 => Self::Vs,
            0b0111 => Self::Vc,
            0b1000 => Self::Hi,
            0b1001 => Self::Ls,
            0b1010 => Self::Ge,
            0b1011 => Self::Lt,
            0b1100 => Self::Gt,
            0b1101 => Self::Le,
            0b1110 => Self::Al,
            _ => return None,
        })
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self as u32
    }

    #[must_use]
    pub const fn is_always(self) -> bool {
        matches!(self, Self::Al)
    }

    /// Logical inverse. `Al` has no inverse and maps to itself.
    #[must_use]
    pub const fn invert(self) -> Self {
        match self {
            Self::Al => Self::Al,
            // Flipping bit 0 inverts every pair.
            other => match Self::from_bits(other.bits() ^ 1) {
                Some(c) => c,
                None => Self::Al,
            },
        }
    }
}

impl fmt::Display for Cond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Cs => "cs",
            Self::Cc => "cc",
            Self::Mi => "mi",
            Self::Pl => "pl",
            Self::Vs => "vs",
            Self::Vc => "vc",
            Self::Hi => "hi",
            Self::Ls => "ls",
            Self::Ge => "ge",
            Self::Lt => "lt",
            Self::Gt => "gt",
            Self::Le => "le",
            Self::Al => "al",
        };
        f.write_str(s)
    }
}

/// Thumb IT-block state (the ITSTATE bits of the guest CPSR).
///
/// The upper nibble is the base condition; the low five bits hold the
/// remaining then/else mask. Zero means no IT block is active.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ItState(u8);

impl ItState {
    /// Start an IT block from the `firstcond` and `mask` fields of an IT
    /// instruction.
    #[must_use]
    pub const fn new(firstcond: u8, mask: u8) -> Self {
        Self(((firstcond & 0xF) << 4) | (mask & 0xF))
    }

    #[must_use]
    pub const fn is_active(self) -> bool {
        self.0 & 0xF != 0
    }

    /// Condition of the instruction currently covered by the block.
    #[must_use]
    pub const fn current(self) -> Option<Cond> {
        if self.is_active() {
            Cond::from_bits((self.0 >> 4) as u32)
        } else {
            None
        }
    }

    /// Advance past one covered instruction.
    pub const fn advance(&mut self) {
        if self.0 & 0x7 == 0 {
            self.0 = 0;
        } else {
            self.0 = (self.0 & 0xE0) | ((self.0 << 1) & 0x1F);
        }
    }
}
