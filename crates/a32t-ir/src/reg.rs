//! Guest register identifiers.

use std::fmt;

/// Number of guest general-purpose registers (r0-r15).
pub const NUM_GPRS: usize = 16;
/// Number of guest double-precision registers (d0-d31).
pub const NUM_DREGS: usize = 32;

/// A guest general-purpose register.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GuestReg(u8);

impl GuestReg {
    pub const SP: Self = Self(13);
    pub const LR: Self = Self(14);
    pub const PC: Self = Self(15);

    /// Create a register from its 4-bit field value.
    #[must_use]
    pub const fn new(index: u8) -> Self {
        Self(index & 0xF)
    }

    #[must_use]
    pub const fn index(self) -> u8 {
        self.0
    }

    #[must_use]
    pub const fn is_pc(self) -> bool {
        self.0 == 15
    }
}

impl fmt::Display for GuestReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            13 => f.write_str("sp"),
            14 => f.write_str("lr"),
            15 => f.write_str("pc"),
            n => write!(f, "r{n}"),
        }
    }
}

/// A guest VFP/NEON double register.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GuestDReg(u8);

impl GuestDReg {
    #[must_use]
    pub const fn new(index: u8) -> Self {
        Self(index & 0x1F)
    }

    #[must_use]
    pub const fn index(self) -> u8 {
        self.0
    }
}

impl fmt::Display for GuestDReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "d{}", self.0)
    }
}
