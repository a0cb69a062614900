//! Host-call and context protocol.
//!
//! Generated code calls into the runtime in one of two tiers:
//!
//! - **Full**: the guest register file is flushed to the `NativeContext`
//!   (`StoreToContext`), caller-saved guest registers are spilled to the
//!   frame, and both are restored after the call (`LoadFromContext` last, so
//!   anything the callee wrote to the context wins).
//! - **Skip-context**: the guest register file is still flushed and
//!   reloaded, but nothing is spilled; only the context and page-table
//!   pointers are saved to the frame around the call.
//!
//! Arguments go in `x0..x6`; the callee address is loaded into `x7` after
//! the arguments are placed.
//!
//! Flush and spill sets are derived from the allocator's cumulative masks,
//! never from what is live at the call site, so every call in a unit moves
//! the same registers. Host-call sequences are only emitted after the body,
//! when those masks are final.

use crate::arm64::enc;
use crate::arm64::registers::{
    MAX_CALL_ARGS, RegisterClass, VReg, XReg, guest_of_gpr, guest_of_vreg, mask_iter, reserved,
};
use crate::codebuf::CodeBuffer;
use crate::context::{EmitContext, UnitShape};
use crate::error::{EmitError, Result};
use crate::layout::ContextLayout;
use crate::regalloc::RegisterAllocator;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallTier {
    Full,
    SkipContext,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Callee {
    /// Absolute helper address, loaded into `x7`.
    Helper(u64),
    /// Address already held in a register outside the argument range.
    Register(XReg),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallArg {
    Reg(XReg),
    Imm(u64),
}

// ============================================================================
// Context flush
// ============================================================================

/// Flush guest registers and flags to the context.
pub fn store_to_context(buf: &mut CodeBuffer, regs: &RegisterAllocator) {
    for host in mask_iter(regs.context_gprs()).map(XReg::new) {
        if let Some(guest) = guest_of_gpr(host) {
            buf.emit(enc::str_w(host, reserved::CONTEXT_PTR, ContextLayout::gpr(guest)));
        }
    }
    for host in mask_iter(regs.context_fpsimd()).map(VReg::new) {
        if let Some(guest) = guest_of_vreg(host) {
            buf.emit(enc::str_d(host, reserved::CONTEXT_PTR, ContextLayout::dreg(guest)));
        }
    }
    if regs.uses_flags() {
        buf.emit(enc::mrs_nzcv(reserved::SCRATCH));
        buf.emit(enc::str_w(reserved::SCRATCH, reserved::CONTEXT_PTR, ContextLayout::NZCV));
    }
}

/// Reload exactly what [`store_to_context`] flushes.
pub fn load_from_context(buf: &mut CodeBuffer, regs: &RegisterAllocator) {
    for host in mask_iter(regs.context_gprs()).map(XReg::new) {
        if let Some(guest) = guest_of_gpr(host) {
            buf.emit(enc::ldr_w(host, reserved::CONTEXT_PTR, ContextLayout::gpr(guest)));
        }
    }
    for host in mask_iter(regs.context_fpsimd()).map(VReg::new) {
        if let Some(guest) = guest_of_vreg(host) {
            buf.emit(enc::ldr_d(host, reserved::CONTEXT_PTR, ContextLayout::dreg(guest)));
        }
    }
    if regs.uses_flags() {
        buf.emit(enc::ldr_w(reserved::SCRATCH, reserved::CONTEXT_PTR, ContextLayout::NZCV));
        buf.emit(enc::msr_nzcv(reserved::SCRATCH));
    }
}

// ============================================================================
// Spill area
// ============================================================================

/// Frame region below the saved registers, addressed from `sp`.
///
/// Full tier layout: 16-byte SIMD slots first, then 8-byte GPR slots, then
/// the flags word. The skip tier reuses the first 16 bytes for `x27`/`x28`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SpillLayout {
    pub gprs: u32,
    pub fpsimd: u32,
    pub flags: bool,
    /// Bytes the full tier needs.
    pub full_bytes: u32,
    /// Reserved bytes, a multiple of 16.
    pub bytes: u32,
}

impl SpillLayout {
    /// Bytes the skip tier needs.
    pub const SKIP_BYTES: u32 = 16;

    #[must_use]
    pub fn compute(regs: &RegisterAllocator, shape: UnitShape) -> Self {
        let (gprs, fpsimd, flags) = if shape.has_host_call {
            (regs.call_clobbered_gprs(), regs.context_fpsimd(), regs.uses_flags())
        } else {
            (0, 0, false)
        };
        let full_bytes = fpsimd.count_ones() * 16 + gprs.count_ones() * 8 + if flags { 8 } else { 0 };
        let skip_bytes = if shape.has_host_call_skip_context { Self::SKIP_BYTES } else { 0 };
        let bytes = full_bytes.max(skip_bytes).next_multiple_of(16);
        Self {
            gprs,
            fpsimd,
            flags,
            full_bytes,
            bytes,
        }
    }

    fn gpr_base(&self) -> u32 {
        self.fpsimd.count_ones() * 16
    }

    fn flags_offset(&self) -> u32 {
        self.gpr_base() + self.gprs.count_ones() * 8
    }

    fn slots(&self) -> (impl Iterator<Item = (VReg, u32)>, impl Iterator<Item = (XReg, u32)>) {
        let base = self.gpr_base();
        let simd = mask_iter(self.fpsimd).zip(0u32..).map(|(r, i)| (VReg::new(r), i * 16));
        let gprs = mask_iter(self.gprs).zip(0u32..).map(move |(r, i)| (XReg::new(r), base + i * 8));
        (simd, gprs)
    }

    pub fn spill(&self, buf: &mut CodeBuffer) {
        let (simd, gprs) = self.slots();
        for (reg, off) in simd {
            buf.emit(enc::str_q(reg, XReg::SP, off));
        }
        for (reg, off) in gprs {
            buf.emit(enc::str_x(reg, XReg::SP, off));
        }
        if self.flags {
            buf.emit(enc::mrs_nzcv(reserved::SCRATCH));
            buf.emit(enc::str_x(reserved::SCRATCH, XReg::SP, self.flags_offset()));
        }
    }

    pub fn refill(&self, buf: &mut CodeBuffer) {
        let (simd, gprs) = self.slots();
        for (reg, off) in simd {
            buf.emit(enc::ldr_q(reg, XReg::SP, off));
        }
        for (reg, off) in gprs {
            buf.emit(enc::ldr_x(reg, XReg::SP, off));
        }
        if self.flags {
            buf.emit(enc::ldr_x(reserved::SCRATCH, XReg::SP, self.flags_offset()));
            buf.emit(enc::msr_nzcv(reserved::SCRATCH));
        }
    }
}

// ============================================================================
// Calls
// ============================================================================

fn place_args(buf: &mut CodeBuffer, args: &[CallArg]) -> Result<()> {
    if args.len() > MAX_CALL_ARGS {
        return Err(EmitError::TooManyArguments(args.len()));
    }
    for (i, arg) in (0u8..).zip(args) {
        let dst = XReg::new(i);
        match *arg {
            CallArg::Reg(src) if src == dst => {}
            CallArg::Reg(src) => {
                // Sources below `dst` were already overwritten.
                if src.code() < u32::from(i) {
                    return Err(EmitError::ArgumentClobbered { source_reg: src.index() });
                }
                buf.emit(enc::mov_x(dst, src));
            }
            CallArg::Imm(value) => buf.emit_mov_imm64(dst, value),
        }
    }
    Ok(())
}

/// Emit a complete host call.
///
/// `after` runs right after the call instruction, before any register is
/// restored; `x0` still holds the callee's return value there.
///
/// # Errors
/// Too many arguments, an argument or callee register clobbered by argument
/// placement, or an error from `after`.
pub fn emit_host_call<F>(
    ctx: &mut EmitContext<'_>,
    tier: CallTier,
    callee: Callee,
    args: &[CallArg],
    after: F,
) -> Result<()>
where
    F: FnOnce(&mut EmitContext<'_>) -> Result<()>,
{
    if let Callee::Register(reg) = callee {
        if usize::from(reg.index()) < args.len() {
            return Err(EmitError::ArgumentClobbered { source_reg: reg.index() });
        }
    }
    let spill = SpillLayout::compute(&ctx.regs, ctx.shape());
    match tier {
        CallTier::Full => {
            store_to_context(&mut ctx.buf, &ctx.regs);
            spill.spill(&mut ctx.buf);
        }
        CallTier::SkipContext => {
            store_to_context(&mut ctx.buf, &ctx.regs);
            ctx.buf.emit(enc::stp_x(reserved::CONTEXT_PTR, reserved::PAGE_TABLE_PTR, XReg::SP, 0));
        }
    }
    place_args(&mut ctx.buf, args)?;
    match callee {
        Callee::Helper(addr) => {
            ctx.buf.emit_mov_imm64(reserved::CALL_TARGET, addr);
            ctx.buf.emit(enc::blr(reserved::CALL_TARGET));
        }
        Callee::Register(reg) => {
            ctx.buf.emit(enc::blr(reg));
        }
    }
    after(ctx)?;
    match tier {
        CallTier::Full => {
            spill.refill(&mut ctx.buf);
            load_from_context(&mut ctx.buf, &ctx.regs);
        }
        CallTier::SkipContext => {
            ctx.buf.emit(enc::ldp_x(reserved::CONTEXT_PTR, reserved::PAGE_TABLE_PTR, XReg::SP, 0));
            load_from_context(&mut ctx.buf, &ctx.regs);
        }
    }
    Ok(())
}

/// Argument pair every runtime entry point receives first.
#[must_use]
pub const fn context_args() -> [CallArg; 2] {
    [CallArg::Reg(reserved::CONTEXT_PTR), CallArg::Reg(reserved::PAGE_TABLE_PTR)]
}
