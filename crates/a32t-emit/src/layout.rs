//! `NativeContext` layout.
//!
//! The emulated register file that generated code flushes to and reloads
//! from. Generated code only ever addresses it through the byte offsets in
//! [`ContextLayout`], relative to the context pointer register.

use std::mem::offset_of;

use a32t_ir::{GuestDReg, GuestReg, NUM_DREGS, NUM_GPRS};

/// Emulated guest CPU state shared between generated code and the runtime.
#[repr(C)]
#[derive(Clone, Debug, Default)]
pub struct NativeContext {
    /// r0-r15.
    pub gprs: [u32; NUM_GPRS],
    /// d0-d31.
    pub dregs: [u64; NUM_DREGS],
    /// N, Z, C, V in bits 31-28 (CPSR layout).
    pub nzcv: u32,
    /// GE bits 19-16.
    pub ge: u32,
    /// Sticky saturation flag.
    pub q: u32,
    /// Thumb execution state.
    pub thumb: u32,
    /// Big-endian data access.
    pub endian: u32,
    /// Decremented on every loop back edge; zero triggers a sync check.
    pub exec_counter: u32,
    /// Guest address handed to runtime helpers and the dispatcher.
    pub dispatch_address: u32,
    _pad: u32,
}

/// Byte offsets into [`NativeContext`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContextLayout;

impl ContextLayout {
    pub const GPRS: u32 = offset_of!(NativeContext, gprs) as u32;
    pub const DREGS: u32 = offset_of!(NativeContext, dregs) as u32;
    pub const NZCV: u32 = offset_of!(NativeContext, nzcv) as u32;
    pub const GE: u32 = offset_of!(NativeContext, ge) as u32;
    pub const Q: u32 = offset_of!(NativeContext, q) as u32;
    pub const THUMB: u32 = offset_of!(NativeContext, thumb) as u32;
    pub const ENDIAN: u32 = offset_of!(NativeContext, endian) as u32;
    pub const EXEC_COUNTER: u32 = offset_of!(NativeContext, exec_counter) as u32;
    pub const DISPATCH_ADDRESS: u32 = offset_of!(NativeContext, dispatch_address) as u32;
    pub const SIZE: u32 = size_of::<NativeContext>() as u32;

    /// Offset of guest GPR `reg`.
    #[must_use]
    pub const fn gpr(reg: GuestReg) -> u32 {
        Self::GPRS + 4 * reg.index() as u32
    }

    /// Offset of guest D register `reg`.
    #[must_use]
    pub const fn dreg(reg: GuestDReg) -> u32 {
        Self::DREGS + 8 * reg.index() as u32
    }
}
