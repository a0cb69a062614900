//! Emission errors.
//!
//! Every variant is an internal defect: guest code content never makes
//! compilation fail. A unit that hits one of these is abandoned.

use thiserror::Error;

use a32t_ir::{Cond, GuestReg};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EmitError {
    #[error("{class} temporary pool exhausted")]
    RegisterPoolExhausted { class: &'static str },
    #[error("guest register {0} has no host mapping")]
    UnmappedGuestRegister(GuestReg),
    #[error("branch at word {site} cannot reach word {target} (displacement {disp})")]
    BranchOutOfRange { site: usize, target: usize, disp: i64 },
    #[error("conditional region opened at word {open} is {disp} words long")]
    ConditionalRegionTooLong { open: usize, disp: i64 },
    #[error("cannot open a branch-over region for condition {0}")]
    InvalidLoweringTransition(Cond),
    #[error("host call takes {0} arguments, at most 7 are supported")]
    TooManyArguments(usize),
    #[error("argument source x{source_reg} would be clobbered before it is read")]
    ArgumentClobbered { source_reg: u8 },
    #[error("{kind} fixup at word {site} has no usable target")]
    MissingFixupTarget { kind: &'static str, site: usize },
    #[error("word {0} is not a branch placeholder")]
    NotAPlaceholder(usize),
    #[error("prologue needs {needed} words but only {reserved} were reserved")]
    PrologueTooLarge { needed: usize, reserved: usize },
    #[error("spill area of {0} bytes exceeds the addressable frame")]
    SpillAreaTooLarge(u32),
}

pub type Result<T> = std::result::Result<T, EmitError>;
