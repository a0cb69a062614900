//! AArch64 register file as seen by the translator.
//!
//! Guest registers live in fixed host registers for the whole unit:
//!
//! - x19-x26: guest r0-r7 (callee-saved)
//! - x9-x15:  guest r8-r14 (caller-saved, spilled around full-context calls)
//! - v16-v31: guest d0-d15
//!
//! Reserved:
//! - x27: `NativeContext` pointer
//! - x28: page-table pointer
//! - x16, x17: pipeline scratch (context load/store, dispatch)
//! - x7: host-call target
//! - x29 (fp), x30 (lr), sp
//!
//! Temporaries handed out by the allocator: x0-x8 and v0-v7.

use std::fmt;

use a32t_ir::{GuestDReg, GuestReg};

/// Register class the allocator can lease from.
pub trait RegisterClass: Copy + fmt::Debug {
    fn from_index(index: u8) -> Self;
    fn index(self) -> u8;

    /// Single-bit mask for this register.
    fn mask(self) -> u32 {
        1 << self.index()
    }
}

/// A host general-purpose register (64-bit view; `w` forms use the same index).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct XReg(u8);

impl XReg {
    pub const X0: Self = Self(0);
    pub const X1: Self = Self(1);
    pub const X2: Self = Self(2);
    pub const X7: Self = Self(7);
    pub const X16: Self = Self(16);
    pub const X17: Self = Self(17);
    pub const X27: Self = Self(27);
    pub const X28: Self = Self(28);
    pub const FP: Self = Self(29);
    pub const LR: Self = Self(30);
    /// Encodes as `sp` in address and add/sub-immediate positions.
    pub const SP: Self = Self(31);
    /// Encodes as the zero register in data-processing positions.
    pub const ZR: Self = Self(31);

    #[must_use]
    pub const fn new(index: u8) -> Self {
        Self(index & 0x1F)
    }

    #[must_use]
    pub const fn code(self) -> u32 {
        self.0 as u32
    }
}

impl RegisterClass for XReg {
    fn from_index(index: u8) -> Self {
        Self::new(index)
    }

    fn index(self) -> u8 {
        self.0
    }
}

impl fmt::Display for XReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            29 => f.write_str("fp"),
            30 => f.write_str("lr"),
            31 => f.write_str("sp"),
            n => write!(f, "x{n}"),
        }
    }
}

/// A host SIMD/FP register.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VReg(u8);

impl VReg {
    #[must_use]
    pub const fn new(index: u8) -> Self {
        Self(index & 0x1F)
    }

    #[must_use]
    pub const fn code(self) -> u32 {
        self.0 as u32
    }
}

impl RegisterClass for VReg {
    fn from_index(index: u8) -> Self {
        Self::new(index)
    }

    fn index(self) -> u8 {
        self.0
    }
}

impl fmt::Display for VReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Fixed-purpose host registers.
pub mod reserved {
    use super::XReg;

    /// `NativeContext` pointer (callee-saved).
    pub const CONTEXT_PTR: XReg = XReg::X27;
    /// Page-table / memory base pointer (callee-saved).
    pub const PAGE_TABLE_PTR: XReg = XReg::X28;
    /// Dispatch target register; read by the shared trailer's `br`.
    pub const DISPATCH: XReg = XReg::X16;
    /// Context load/store scratch.
    pub const SCRATCH: XReg = XReg::X17;
    /// Holds the helper address during a host call.
    pub const CALL_TARGET: XReg = XReg::X7;
}

const fn range_mask(lo: u32, hi: u32) -> u32 {
    let mut mask = 0;
    let mut i = lo;
    while i <= hi {
        mask |= 1 << i;
        i += 1;
    }
    mask
}

/// x19-x28 per AAPCS64.
pub const CALLEE_SAVED_GPRS: u32 = range_mask(19, 28);
/// v8-v15 (low 64 bits) per AAPCS64.
pub const CALLEE_SAVED_FPSIMD: u32 = range_mask(8, 15);
/// Temporary GPR pool.
pub const TEMP_GPRS: u32 = range_mask(0, 8);
/// Temporary SIMD/FP pool.
pub const TEMP_FPSIMD: u32 = range_mask(0, 7);
/// Host argument registers usable by host calls (x7 holds the callee).
pub const MAX_CALL_ARGS: usize = 7;

/// Guest r0-r14 to host GPR.
pub const GUEST_GPR_MAP: [u8; 15] = [19, 20, 21, 22, 23, 24, 25, 26, 9, 10, 11, 12, 13, 14, 15];
/// Guest d0 maps to v16; d0-d15 are register-resident.
pub const GUEST_DREG_BASE: u8 = 16;
/// Number of guest D registers kept in host registers.
pub const MAPPED_DREGS: u8 = 16;

/// Host GPR holding guest register `reg`, or `None` for `pc`.
#[must_use]
pub fn guest_gpr(reg: GuestReg) -> Option<XReg> {
    GUEST_GPR_MAP.get(reg.index() as usize).map(|&i| XReg::new(i))
}

/// Host SIMD register holding guest `reg`, or `None` if it only lives in the
/// context.
#[must_use]
pub const fn guest_dreg(reg: GuestDReg) -> Option<VReg> {
    if reg.index() < MAPPED_DREGS {
        Some(VReg::new(GUEST_DREG_BASE + reg.index()))
    } else {
        None
    }
}

/// Guest register held by a host GPR.
#[must_use]
pub fn guest_of_gpr(host: XReg) -> Option<GuestReg> {
    GUEST_GPR_MAP
        .iter()
        .position(|&i| i == host.index())
        .and_then(|g| u8::try_from(g).ok())
        .map(GuestReg::new)
}

/// Guest D register held by a host SIMD register.
#[must_use]
pub const fn guest_of_vreg(host: VReg) -> Option<GuestDReg> {
    let i = host.0;
    if i >= GUEST_DREG_BASE && i < GUEST_DREG_BASE + MAPPED_DREGS {
        Some(GuestDReg::new(i - GUEST_DREG_BASE))
    } else {
        None
    }
}

/// Host GPRs that can hold guest state.
#[must_use]
pub fn usable_gprs_mask() -> u32 {
    GUEST_GPR_MAP.iter().fold(0, |m, &i| m | (1 << i))
}

/// Host SIMD registers that can hold guest state.
#[must_use]
pub const fn usable_fpsimd_mask() -> u32 {
    range_mask(GUEST_DREG_BASE as u32, (GUEST_DREG_BASE + MAPPED_DREGS - 1) as u32)
}

/// Iterate the register indices set in `mask`, lowest first.
pub fn mask_iter(mask: u32) -> impl Iterator<Item = u8> {
    (0u8..32).filter(move |i| mask & (1 << i) != 0)
}
