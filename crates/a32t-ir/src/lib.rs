//! Guest-side representation for the A32 translator.
//!
//! This crate holds the decoded shape of guest code: conditions, registers,
//! instructions and the blocks the compiler consumes. It has no knowledge of
//! the host ISA.

mod block;
mod cond;
mod instr;
mod reg;

pub use block::*;
pub use cond::*;
pub use instr::*;
pub use reg::*;
