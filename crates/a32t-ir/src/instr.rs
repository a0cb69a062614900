//! Decoded guest instructions.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use crate::cond::Cond;
use crate::reg::{GuestDReg, GuestReg};

/// Per-instruction attribute bits supplied by the decoder.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct InstrFlags(u16);

impl InstrFlags {
    pub const NONE: Self = Self(0);
    /// Writes guest NZCV.
    pub const SETS_FLAGS: Self = Self(1 << 0);
    /// 16-bit Thumb encoding.
    pub const THUMB16: Self = Self(1 << 1);
    /// Writes the link register and expects to be returned to.
    pub const CALL: Self = Self(1 << 2);
    /// Transfers control.
    pub const BRANCH: Self = Self(1 << 3);
    /// Needs a runtime helper that sees the full guest register file.
    pub const HOST_CALL: Self = Self(1 << 4);
    /// Needs a lightweight runtime helper (only the fixed pointers survive).
    pub const HOST_CALL_SKIP_CONTEXT: Self = Self(1 << 5);
    /// Immediate operand encoded with a non-zero rotation. Logical flag
    /// updates take C from its bit 31.
    pub const ROTATED_IMM: Self = Self(1 << 6);

    #[must_use]
    pub const fn bits(self) -> u16 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl BitOr for InstrFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitOrAssign for InstrFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = self.union(rhs);
    }
}

/// Two-operand ALU operations with a destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AluOp {
    And,
    Eor,
    Sub,
    Rsb,
    Add,
    Adc,
    Sbc,
    Orr,
    Bic,
}

/// Flag-only comparisons.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpOp {
    Tst,
    Teq,
    Cmp,
    Cmn,
}

/// Second operand of a data-processing instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operand {
    Reg(GuestReg),
    Imm(u32),
}

/// Guest exception raised by the instruction itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExceptionKind {
    Undefined,
    Breakpoint,
}

/// Structured operand fields, one variant per opcode family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstrKind {
    Alu {
        op: AluOp,
        rd: GuestReg,
        rn: GuestReg,
        operand: Operand,
    },
    Move {
        rd: GuestReg,
        operand: Operand,
        negate: bool,
    },
    Compare {
        op: CmpOp,
        rn: GuestReg,
        operand: Operand,
    },
    /// `VMOV.F64 Dd, Dm`.
    VMove {
        dd: GuestDReg,
        dm: GuestDReg,
    },
    Branch {
        target: u32,
    },
    BranchLink {
        target: u32,
    },
    BranchExchange {
        rm: GuestReg,
    },
    BranchLinkExchange {
        rm: GuestReg,
    },
    /// `TBB` / `TBH`.
    TableBranch {
        rn: GuestReg,
        rm: GuestReg,
        halfword: bool,
    },
    SupervisorCall {
        imm: u32,
    },
    Breakpoint {
        imm: u16,
    },
    Undefined,
    /// 64-bit counter read into a register pair.
    ReadTimer {
        rt: GuestReg,
        rt2: GuestReg,
    },
    /// Thumb `IT`: predicates up to four following instructions.
    IfThen {
        firstcond: u8,
        mask: u8,
    },
    Nop,
}

impl InstrKind {
    /// Direct branch target, if the instruction has one.
    #[must_use]
    pub const fn direct_target(&self) -> Option<u32> {
        match *self {
            Self::Branch { target } | Self::BranchLink { target } => Some(target),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_control_transfer(&self) -> bool {
        matches!(
            self,
            Self::Branch { .. }
                | Self::BranchLink { .. }
                | Self::BranchExchange { .. }
                | Self::BranchLinkExchange { .. }
                | Self::TableBranch { .. }
        )
    }

    #[must_use]
    pub const fn is_call(&self) -> bool {
        matches!(self, Self::BranchLink { .. } | Self::BranchLinkExchange { .. })
    }
}

/// One decoded guest instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GuestInstr {
    /// Guest virtual address.
    pub address: u32,
    /// Raw encoding (low half only for 16-bit Thumb).
    pub encoding: u32,
    /// Mnemonic tag, for logs.
    pub name: &'static str,
    pub kind: InstrKind,
    pub flags: InstrFlags,
    /// Embedded predicate (`Al` for Thumb instructions inside or outside IT).
    pub cond: Cond,
}

impl GuestInstr {
    #[must_use]
    pub const fn new(address: u32, encoding: u32, name: &'static str, kind: InstrKind) -> Self {
        Self {
            address,
            encoding,
            name,
            kind,
            flags: InstrFlags::NONE,
            cond: Cond::Al,
        }
    }

    #[must_use]
    pub const fn with_cond(mut self, cond: Cond) -> Self {
        self.cond = cond;
        self
    }

    #[must_use]
    pub const fn with_flags(mut self, flags: InstrFlags) -> Self {
        self.flags = self.flags.union(flags);
        self
    }

    /// Size in bytes.
    #[must_use]
    pub const fn size(&self) -> u32 {
        if self.flags.contains(InstrFlags::THUMB16) { 2 } else { 4 }
    }

    #[must_use]
    pub const fn next_pc(&self) -> u32 {
        self.address.wrapping_add(self.size())
    }

    /// Carry-out of the operand shifter for logical flag updates, when the
    /// encoding defines one.
    #[must_use]
    pub const fn shifter_carry(&self) -> Option<bool> {
        let imm = match self.kind {
            InstrKind::Alu { operand: Operand::Imm(imm), .. }
            | InstrKind::Move { operand: Operand::Imm(imm), .. }
            | InstrKind::Compare { operand: Operand::Imm(imm), .. } => imm,
            _ => return None,
        };
        if self.flags.contains(InstrFlags::ROTATED_IMM) {
            Some(imm & (1 << 31) != 0)
        } else {
            None
        }
    }

    #[must_use]
    pub const fn sets_flags(&self) -> bool {
        self.flags.contains(InstrFlags::SETS_FLAGS)
    }

    /// Value a guest read of `pc` observes for this instruction.
    #[must_use]
    pub const fn pc_read_value(&self) -> u32 {
        let offset = if self.flags.contains(InstrFlags::THUMB16) { 4 } else { 8 };
        self.address.wrapping_add(offset)
    }

    /// Data-processing write to `pc`.
    #[must_use]
    pub const fn writes_pc(&self) -> bool {
        match self.kind {
            InstrKind::Alu { rd, .. } | InstrKind::Move { rd, .. } => rd.is_pc(),
            _ => false,
        }
    }

    /// Whether execution never falls through to the next instruction.
    #[must_use]
    pub const fn ends_flow(&self) -> bool {
        self.ends_flow_under(self.cond)
    }

    /// Like [`Self::ends_flow`], with `pred` as the effective predicate
    /// (an enclosing IT block overrides the encoded condition).
    #[must_use]
    pub const fn ends_flow_under(&self, pred: Cond) -> bool {
        pred.is_always()
            && (self.writes_pc()
                || matches!(
                    self.kind,
                    InstrKind::Branch { .. }
                        | InstrKind::BranchExchange { .. }
                        | InstrKind::TableBranch { .. }
                ))
    }
}

impl fmt::Display for GuestInstr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}: {}", self.address, self.name)?;
        if !self.cond.is_always() {
            write!(f, "{}", self.cond)?;
        }
        Ok(())
    }
}
