//! AArch64 code emission for the A32 translator.
//!
//! This crate owns the machinery shared by every compiled unit: the code
//! buffer, host register allocation, conditional-execution lowering, the
//! fixup worklist, exit merging, the host-call protocol and the prologue.
//! Per-opcode semantics plug in through [`InstructionEmitter`].

pub mod arm64;
mod codebuf;
mod config;
mod context;
pub mod dispatch;
mod emitter;
mod error;
mod fixup;
pub mod hostcall;
mod layout;
mod lowering;
pub mod prologue;
mod regalloc;
mod tail;

pub use codebuf::CodeBuffer;
pub use config::{EmitConfig, HostHelpers, PROLOGUE_MAX_WORDS};
pub use context::{EmitContext, UnitShape};
pub use dispatch::{DispatchTable, SlotTable};
pub use emitter::InstructionEmitter;
pub use error::{EmitError, Result};
pub use fixup::{FixupKind, FixupList, FixupTarget, PendingFixup};
pub use layout::{ContextLayout, NativeContext};
pub use lowering::{CondLowering, absorbs_condition};
pub use regalloc::{RegisterAllocator, ScopedRegister};
pub use tail::{ExitCondition, TailMerger};
