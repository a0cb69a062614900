//! Unit prologue and shared trailer.
//!
//! Frame, from high to low addresses:
//!
//! ```text
//! [x29, x30]               <- x29
//! callee-saved GPR pairs
//! callee-saved d-registers
//! spill area               <- sp
//! ```
//!
//! The prologue is written last, in place, over the `nop` reservation at
//! index 0; by then the register masks and spill size are final.

use tracing::debug;

use crate::arm64::enc;
use crate::arm64::registers::{VReg, XReg, mask_iter, reserved};
use crate::codebuf::CodeBuffer;
use crate::error::{EmitError, Result};
use crate::hostcall::{SpillLayout, load_from_context, store_to_context};
use crate::regalloc::RegisterAllocator;

/// Largest `sub sp, sp, #imm12` the prologue emits.
const MAX_SPILL_BYTES: u32 = 0xFFF & !0xF;

/// Saved-register and spill shape shared by the prologue and the trailer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    saved_gprs: Vec<XReg>,
    saved_fpsimd: Vec<VReg>,
    spill_bytes: u32,
}

impl Frame {
    /// # Errors
    /// The spill area does not fit one `sub sp` immediate.
    pub fn new(regs: &RegisterAllocator, spill: &SpillLayout) -> Result<Self> {
        if spill.bytes > MAX_SPILL_BYTES {
            return Err(EmitError::SpillAreaTooLarge(spill.bytes));
        }
        Ok(Self {
            saved_gprs: mask_iter(regs.saved_gprs()).map(XReg::new).collect(),
            saved_fpsimd: mask_iter(regs.saved_fpsimd()).map(VReg::new).collect(),
            spill_bytes: spill.bytes,
        })
    }

    #[must_use]
    pub const fn spill_bytes(&self) -> u32 {
        self.spill_bytes
    }

    #[must_use]
    pub fn saved_gprs(&self) -> &[XReg] {
        &self.saved_gprs
    }

    /// Bytes between `x29` and `sp` once the prologue has run.
    #[must_use]
    pub fn frame_bytes(&self) -> u32 {
        let pairs = self.saved_gprs.len().div_ceil(2) + self.saved_fpsimd.len();
        u32::try_from(pairs * 16).unwrap_or(u32::MAX) + self.spill_bytes
    }

    fn push(&self, buf: &mut CodeBuffer) {
        buf.emit(enc::stp_x_pre(XReg::FP, XReg::LR, XReg::SP, -16));
        buf.emit(enc::add_x_imm(XReg::FP, XReg::SP, 0));
        for pair in self.saved_gprs.chunks(2) {
            match *pair {
                [a, b] => buf.emit(enc::stp_x_pre(a, b, XReg::SP, -16)),
                [a] => buf.emit(enc::str_x_pre(a, XReg::SP, -16)),
                _ => unreachable!("chunks(2) yields one or two registers"),
            };
        }
        for &v in &self.saved_fpsimd {
            buf.emit(enc::str_d_pre(v, XReg::SP, -16));
        }
        if self.spill_bytes > 0 {
            buf.emit(enc::sub_x_imm(XReg::SP, XReg::SP, self.spill_bytes));
        }
    }

    fn pop(&self, buf: &mut CodeBuffer) {
        if self.spill_bytes > 0 {
            buf.emit(enc::add_x_imm(XReg::SP, XReg::SP, self.spill_bytes));
        }
        for &v in self.saved_fpsimd.iter().rev() {
            buf.emit(enc::ldr_d_post(v, XReg::SP, 16));
        }
        for pair in self.saved_gprs.chunks(2).rev() {
            match *pair {
                [a, b] => buf.emit(enc::ldp_x_post(a, b, XReg::SP, 16)),
                [a] => buf.emit(enc::ldr_x_post(a, XReg::SP, 16)),
                _ => unreachable!("chunks(2) yields one or two registers"),
            };
        }
        buf.emit(enc::ldp_x_post(XReg::FP, XReg::LR, XReg::SP, 16));
    }
}

/// Build the prologue: frame setup, fixed pointers from the arguments, then
/// the guest state from the context.
#[must_use]
pub fn build_prologue(frame: &Frame, regs: &RegisterAllocator) -> CodeBuffer {
    let mut buf = CodeBuffer::with_capacity(64);
    frame.push(&mut buf);
    buf.emit(enc::mov_x(reserved::CONTEXT_PTR, XReg::X0));
    buf.emit(enc::mov_x(reserved::PAGE_TABLE_PTR, XReg::X1));
    load_from_context(&mut buf, regs);
    buf
}

/// Write the prologue over the reservation at index 0 and jump over any
/// unused reserved words. Returns the prologue length in words.
///
/// # Errors
/// The prologue does not fit in `reserved` words.
pub fn write_prologue(
    buf: &mut CodeBuffer,
    reserved: usize,
    frame: &Frame,
    regs: &RegisterAllocator,
) -> Result<usize> {
    let prologue = build_prologue(frame, regs);
    let len = prologue.len();
    // A short prologue needs one more word for the jump to the body.
    let needed = if len < reserved { len + 1 } else { len };
    if needed > reserved {
        return Err(EmitError::PrologueTooLarge { needed, reserved });
    }
    for (i, &word) in prologue.words().iter().enumerate() {
        buf.write(i, word);
    }
    if len < reserved {
        buf.write(len, enc::b(CodeBuffer::disp(len, reserved)));
    }
    debug!(words = len, frame_bytes = frame.frame_bytes(), "wrote prologue");
    Ok(len)
}

/// Emit the shared trailer: flush guest state, hand the fixed pointers to
/// the dispatch target, restore the host frame and jump through `x16`.
pub fn emit_trailer(buf: &mut CodeBuffer, frame: &Frame, regs: &RegisterAllocator) {
    store_to_context(buf, regs);
    buf.emit(enc::mov_x(XReg::X0, reserved::CONTEXT_PTR));
    buf.emit(enc::mov_x(XReg::X1, reserved::PAGE_TABLE_PTR));
    frame.pop(buf);
    buf.emit(enc::br(reserved::DISPATCH));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::UnitShape;
    use a32t_ir::GuestReg;

    fn frame_for(regs: &RegisterAllocator, shape: UnitShape) -> Frame {
        Frame::new(regs, &SpillLayout::compute(regs, shape)).unwrap()
    }

    #[test]
    fn test_prologue_starts_with_frame_record() {
        let regs = RegisterAllocator::new();
        let frame = frame_for(&regs, UnitShape::default());
        let words = build_prologue(&frame, &regs).into_words();
        assert_eq!(words[0], 0xA9BF_7BFD);
        assert_eq!(words[1], 0x9100_03FD);
        // x27/x28 saved as one pair.
        assert_eq!(words[2], enc::stp_x_pre(XReg::X27, XReg::X28, XReg::SP, -16));
        assert_eq!(words[3], enc::mov_x(XReg::X27, XReg::X0));
    }

    #[test]
    fn test_trailer_mirrors_prologue() {
        let mut regs = RegisterAllocator::new();
        regs.remap_gpr(GuestReg::new(0)).unwrap(); // x19
        let shape = UnitShape {
            has_host_call: false,
            has_host_call_skip_context: true,
        };
        let frame = frame_for(&regs, shape);
        assert_eq!(frame.spill_bytes(), 16);
        assert_eq!(frame.saved_gprs(), &[XReg::new(19), XReg::X27, XReg::X28]);

        let mut trailer = CodeBuffer::new();
        emit_trailer(&mut trailer, &frame, &regs);
        let words = trailer.into_words();
        assert_eq!(words.last(), Some(&enc::br(XReg::X16)));
        assert!(words.contains(&enc::add_x_imm(XReg::SP, XReg::SP, 16)));
        assert!(words.contains(&enc::ldr_x_post(XReg::X28, XReg::SP, 16)));
        assert!(words.contains(&enc::ldp_x_post(XReg::new(19), XReg::X27, XReg::SP, 16)));
        assert_eq!(words[words.len() - 2], 0xA8C1_7BFD);
    }

    #[test]
    fn test_write_prologue_jumps_to_body() {
        let regs = RegisterAllocator::new();
        let frame = frame_for(&regs, UnitShape::default());
        let mut buf = CodeBuffer::new();
        for _ in 0..16 {
            buf.emit(enc::nop());
        }
        let len = write_prologue(&mut buf, 16, &frame, &regs).unwrap();
        let jump = buf.read(len).unwrap();
        assert!(enc::is_b(jump));
        assert_eq!(len as i64 + enc::imm26_of(jump), 16);
    }

    #[test]
    fn test_prologue_too_large() {
        let regs = RegisterAllocator::new();
        let frame = frame_for(&regs, UnitShape::default());
        let mut buf = CodeBuffer::new();
        for _ in 0..2 {
            buf.emit(enc::nop());
        }
        assert!(matches!(
            write_prologue(&mut buf, 2, &frame, &regs),
            Err(EmitError::PrologueTooLarge { .. })
        ));
    }
}
