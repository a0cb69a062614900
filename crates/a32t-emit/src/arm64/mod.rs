//! AArch64 host support.

pub mod enc;
pub mod registers;

pub use registers::{VReg, XReg};
