//! Pending-fixup worklist.
//!
//! Every control transfer discovered during emission leaves one placeholder
//! word in the buffer and one [`PendingFixup`] here. The resolution pass
//! drains the list in emission order and rewrites each placeholder exactly
//! once.

use std::fmt;

use a32t_ir::{Cond, ExceptionKind, GuestReg};

use crate::arm64::enc;

/// What the placeholder stands for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FixupKind {
    Branch,
    CondBranch(Cond),
    Call,
    IndirectBranch,
    IndirectCall,
    TableBranch { halfword: bool },
    SyncPoint,
    SoftwareInterrupt { imm: u32 },
    Exception { kind: ExceptionKind, imm: u32 },
    TimerRead,
}

impl FixupKind {
    /// Short tag for logs and stats.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Branch => "branch",
            Self::CondBranch(_) => "cond_branch",
            Self::Call => "call",
            Self::IndirectBranch => "indirect_branch",
            Self::IndirectCall => "indirect_call",
            Self::TableBranch { .. } => "table_branch",
            Self::SyncPoint => "sync_point",
            Self::SoftwareInterrupt { .. } => "software_interrupt",
            Self::Exception { .. } => "exception",
            Self::TimerRead => "timer_read",
        }
    }

    /// Resolved by calling a runtime helper out of line.
    #[must_use]
    pub const fn is_helper(self) -> bool {
        matches!(
            self,
            Self::SyncPoint | Self::SoftwareInterrupt { .. } | Self::Exception { .. } | Self::TimerRead
        )
    }

    /// Placeholder word for this kind.
    #[must_use]
    pub const fn placeholder(self) -> u32 {
        match self {
            Self::CondBranch(cond) => enc::b_cond(cond, 0),
            _ => enc::b(0),
        }
    }
}

impl fmt::Display for FixupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CondBranch(cond) => write!(f, "cond_branch.{cond}"),
            other => f.write_str(other.name()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FixupTarget {
    None,
    Address(u32),
    Register(GuestReg),
    Registers(GuestReg, GuestReg),
}

impl FixupTarget {
    #[must_use]
    pub const fn address(self) -> Option<u32> {
        match self {
            Self::Address(addr) => Some(addr),
            _ => None,
        }
    }

    /// Guest registers the target reads or writes.
    #[must_use]
    pub fn registers(self) -> impl Iterator<Item = GuestReg> {
        let (a, b) = match self {
            Self::Register(r) => (Some(r), None),
            Self::Registers(r, s) => (Some(r), Some(s)),
            Self::None | Self::Address(_) => (None, None),
        };
        a.into_iter().chain(b)
    }
}

/// One unresolved control edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingFixup {
    pub kind: FixupKind,
    pub target: FixupTarget,
    /// Buffer index of the placeholder word.
    pub site: usize,
    /// Address of the guest instruction.
    pub pc: u32,
    /// Address of the following guest instruction; calls continue here.
    pub next_pc: u32,
    /// Value the instruction observes when it reads `pc`.
    pub pc_value: u32,
}

/// Fixups in emission order.
#[derive(Clone, Debug, Default)]
pub struct FixupList {
    pending: Vec<PendingFixup>,
}

impl FixupList {
    #[must_use]
    pub const fn new() -> Self {
        Self { pending: Vec::new() }
    }

    pub fn push(&mut self, fixup: PendingFixup) {
        self.pending.push(fixup);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingFixup> {
        self.pending.iter()
    }

    /// Hand every fixup to the resolver, leaving the list empty.
    pub fn take(&mut self) -> Vec<PendingFixup> {
        std::mem::take(&mut self.pending)
    }
}
