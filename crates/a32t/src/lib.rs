//! a32t - A32 to AArch64 dynamic binary translator
//!
//! Translates linear runs of guest 32-bit ARM code into self-contained host
//! AArch64 units for direct execution inside an emulator.
//!
//! # Example
//!
//! ```ignore
//! use a32t::{A32Emitter, CodeImage, CompileOptions, Compiler};
//!
//! let compiler = Compiler::new(CompileOptions::default(), A32Emitter::new());
//! let unit = compiler.translate(&CodeImage::new(0x8000, &bytes), 0x8000)?;
//! install(unit.start, &unit.to_bytes());
//! ```

// Re-export from sub-crates
pub use a32t_emit::{
    CodeBuffer, ContextLayout, DispatchTable, EmitConfig, EmitContext, EmitError, ExitCondition, FixupKind,
    FixupTarget, HostHelpers, InstructionEmitter, NativeContext, PROLOGUE_MAX_WORDS, PendingFixup, SlotTable,
    UnitShape,
};
pub use a32t_ir::{Cond, GuestBlock, GuestInstr, GuestReg, InstrFlags, InstrKind, MultiBlock};
pub use a32t_isa::{CodeImage, DecodeError, Linearizer, decode, decode_at};

mod compile;
pub mod emitters;
pub mod metrics;
mod resolve;

pub use compile::{CompileOptions, CompiledUnit, Compiler, UnitStats};
pub use emitters::A32Emitter;
pub use resolve::{ResolveStats, exception_code};

use thiserror::Error;

/// Translator errors.
#[derive(Error, Debug)]
pub enum Error {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("emit error: {0}")]
    Emit(#[from] EmitError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("compilation unit has no instructions")]
    EmptyUnit,
}

impl Error {
    /// Short label for metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Decode(_) => "decode",
            Self::Emit(_) => "emit",
            Self::Io(_) => "io",
            Self::EmptyUnit => "empty",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
