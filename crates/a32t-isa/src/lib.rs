//! A32 decoding for the translator.
//!
//! [`decode`] turns instruction words into [`a32t_ir::GuestInstr`]s and
//! [`Linearizer`] groups a run of them into the [`a32t_ir::MultiBlock`] the
//! compiler consumes.

mod decode;
mod error;
mod linearize;

pub use decode::{decode, decode_at};
pub use error::DecodeError;
pub use linearize::{CodeImage, Linearizer};
