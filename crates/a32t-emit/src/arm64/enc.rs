//! AArch64 instruction encodings.
//!
//! Each function returns one 32-bit instruction word. Only the forms the
//! translator emits are covered; immediates are expected to be pre-validated
//! by the caller (offset helpers `debug_assert!` alignment and range).

use a32t_ir::Cond;

use super::registers::{VReg, XReg};

/// Signed range of a 26-bit word displacement (`b`, `bl`).
pub const IMM26_RANGE: i64 = 1 << 25;
/// Signed range of a 19-bit word displacement (`b.cond`, `cbz`, `cbnz`).
pub const IMM19_RANGE: i64 = 1 << 18;

#[must_use]
pub const fn fits_imm26(disp: i64) -> bool {
    disp >= -IMM26_RANGE && disp < IMM26_RANGE
}

#[must_use]
pub const fn fits_imm19(disp: i64) -> bool {
    disp >= -IMM19_RANGE && disp < IMM19_RANGE
}

#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
const fn imm26(disp: i64) -> u32 {
    (disp as u32) & 0x03FF_FFFF
}

#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
const fn imm19(disp: i64) -> u32 {
    ((disp as u32) & 0x7FFFF) << 5
}

// ============================================================================
// Branches
// ============================================================================

#[must_use]
pub const fn b(disp: i64) -> u32 {
    0x1400_0000 | imm26(disp)
}

#[must_use]
pub const fn bl(disp: i64) -> u32 {
    0x9400_0000 | imm26(disp)
}

#[must_use]
pub const fn b_cond(cond: Cond, disp: i64) -> u32 {
    0x5400_0000 | imm19(disp) | cond.bits()
}

#[must_use]
pub const fn cbz_w(rt: XReg, disp: i64) -> u32 {
    0x3400_0000 | imm19(disp) | rt.code()
}

#[must_use]
pub const fn cbnz_w(rt: XReg, disp: i64) -> u32 {
    0x3500_0000 | imm19(disp) | rt.code()
}

#[must_use]
pub const fn br(rn: XReg) -> u32 {
    0xD61F_0000 | (rn.code() << 5)
}

#[must_use]
pub const fn blr(rn: XReg) -> u32 {
    0xD63F_0000 | (rn.code() << 5)
}

#[must_use]
pub const fn ret() -> u32 {
    0xD65F_03C0
}

#[must_use]
pub const fn nop() -> u32 {
    0xD503_201F
}

#[must_use]
pub const fn brk(imm16: u16) -> u32 {
    0xD420_0000 | ((imm16 as u32) << 5)
}

// ============================================================================
// Branch inspection and patching
// ============================================================================

/// `b` (not `bl`).
#[must_use]
pub const fn is_b(word: u32) -> bool {
    word & 0xFC00_0000 == 0x1400_0000
}

#[must_use]
pub const fn is_bl(word: u32) -> bool {
    word & 0xFC00_0000 == 0x9400_0000
}

#[must_use]
pub const fn is_b_cond(word: u32) -> bool {
    word & 0xFF00_0010 == 0x5400_0000
}

/// `cbz` / `cbnz`, either width.
#[must_use]
pub const fn is_cb(word: u32) -> bool {
    word & 0x7E00_0000 == 0x3400_0000
}

/// Any branch carrying an immediate displacement.
#[must_use]
pub const fn is_imm_branch(word: u32) -> bool {
    is_b(word) || is_bl(word) || is_b_cond(word) || is_cb(word)
}

/// Sign-extended word displacement of `b` / `bl`.
#[must_use]
pub const fn imm26_of(word: u32) -> i64 {
    (((word & 0x03FF_FFFF) << 6) as i32 >> 6) as i64
}

/// Sign-extended word displacement of `b.cond` / `cbz` / `cbnz`.
#[must_use]
pub const fn imm19_of(word: u32) -> i64 {
    ((((word >> 5) & 0x7FFFF) << 13) as i32 >> 13) as i64
}

/// Condition field of a `b.cond`.
#[must_use]
pub const fn cond_of(word: u32) -> Option<Cond> {
    Cond::from_bits(word & 0xF)
}

/// Displacement of any immediate branch, in words.
#[must_use]
pub const fn branch_disp(word: u32) -> Option<i64> {
    if is_b(word) || is_bl(word) {
        Some(imm26_of(word))
    } else if is_b_cond(word) || is_cb(word) {
        Some(imm19_of(word))
    } else {
        None
    }
}

/// Replace the displacement of an immediate branch, keeping opcode,
/// condition and register fields.
#[must_use]
pub const fn with_disp(word: u32, disp: i64) -> u32 {
    if is_b(word) || is_bl(word) {
        (word & 0xFC00_0000) | imm26(disp)
    } else {
        (word & !(0x7FFFF << 5)) | imm19(disp)
    }
}

/// Whether `disp` fits the displacement field of `word`.
#[must_use]
pub const fn disp_fits(word: u32, disp: i64) -> bool {
    if is_b(word) || is_bl(word) { fits_imm26(disp) } else { fits_imm19(disp) }
}

// ============================================================================
// Moves and immediates
// ============================================================================

#[must_use]
pub const fn movz_x(rd: XReg, imm16: u16, hw: u32) -> u32 {
    0xD280_0000 | ((hw & 3) << 21) | ((imm16 as u32) << 5) | rd.code()
}

#[must_use]
pub const fn movk_x(rd: XReg, imm16: u16, hw: u32) -> u32 {
    0xF280_0000 | ((hw & 3) << 21) | ((imm16 as u32) << 5) | rd.code()
}

#[must_use]
pub const fn movz_w(rd: XReg, imm16: u16, hw: u32) -> u32 {
    0x5280_0000 | ((hw & 1) << 21) | ((imm16 as u32) << 5) | rd.code()
}

#[must_use]
pub const fn movk_w(rd: XReg, imm16: u16, hw: u32) -> u32 {
    0x7280_0000 | ((hw & 1) << 21) | ((imm16 as u32) << 5) | rd.code()
}

/// `mov xd, xm`
#[must_use]
pub const fn mov_x(rd: XReg, rm: XReg) -> u32 {
    0xAA00_03E0 | (rm.code() << 16) | rd.code()
}

/// `mov wd, wm`
#[must_use]
pub const fn mov_w(rd: XReg, rm: XReg) -> u32 {
    0x2A00_03E0 | (rm.code() << 16) | rd.code()
}

/// `add xd|sp, xn|sp, #imm12`
#[must_use]
pub const fn add_x_imm(rd: XReg, rn: XReg, imm12: u32) -> u32 {
    0x9100_0000 | ((imm12 & 0xFFF) << 10) | (rn.code() << 5) | rd.code()
}

/// `sub xd|sp, xn|sp, #imm12`
#[must_use]
pub const fn sub_x_imm(rd: XReg, rn: XReg, imm12: u32) -> u32 {
    0xD100_0000 | ((imm12 & 0xFFF) << 10) | (rn.code() << 5) | rd.code()
}

/// `add wd, wn, #imm12`
#[must_use]
pub const fn add_w_imm(rd: XReg, rn: XReg, imm12: u32) -> u32 {
    0x1100_0000 | ((imm12 & 0xFFF) << 10) | (rn.code() << 5) | rd.code()
}

/// `sub wd, wn, #imm12`
#[must_use]
pub const fn sub_w_imm(rd: XReg, rn: XReg, imm12: u32) -> u32 {
    0x5100_0000 | ((imm12 & 0xFFF) << 10) | (rn.code() << 5) | rd.code()
}

// ============================================================================
// 32-bit data processing (guest ALU)
// ============================================================================

const fn rrr(base: u32, rd: XReg, rn: XReg, rm: XReg) -> u32 {
    base | (rm.code() << 16) | (rn.code() << 5) | rd.code()
}

#[must_use]
pub const fn add_w(rd: XReg, rn: XReg, rm: XReg) -> u32 {
    rrr(0x0B00_0000, rd, rn, rm)
}

#[must_use]
pub const fn adds_w(rd: XReg, rn: XReg, rm: XReg) -> u32 {
    rrr(0x2B00_0000, rd, rn, rm)
}

#[must_use]
pub const fn sub_w(rd: XReg, rn: XReg, rm: XReg) -> u32 {
    rrr(0x4B00_0000, rd, rn, rm)
}

#[must_use]
pub const fn subs_w(rd: XReg, rn: XReg, rm: XReg) -> u32 {
    rrr(0x6B00_0000, rd, rn, rm)
}

#[must_use]
pub const fn adc_w(rd: XReg, rn: XReg, rm: XReg) -> u32 {
    rrr(0x1A00_0000, rd, rn, rm)
}

#[must_use]
pub const fn adcs_w(rd: XReg, rn: XReg, rm: XReg) -> u32 {
    rrr(0x3A00_0000, rd, rn, rm)
}

#[must_use]
pub const fn sbc_w(rd: XReg, rn: XReg, rm: XReg) -> u32 {
    rrr(0x5A00_0000, rd, rn, rm)
}

#[must_use]
pub const fn sbcs_w(rd: XReg, rn: XReg, rm: XReg) -> u32 {
    rrr(0x7A00_0000, rd, rn, rm)
}

#[must_use]
pub const fn and_w(rd: XReg, rn: XReg, rm: XReg) -> u32 {
    rrr(0x0A00_0000, rd, rn, rm)
}

#[must_use]
pub const fn ands_w(rd: XReg, rn: XReg, rm: XReg) -> u32 {
    rrr(0x6A00_0000, rd, rn, rm)
}

#[must_use]
pub const fn orr_w(rd: XReg, rn: XReg, rm: XReg) -> u32 {
    rrr(0x2A00_0000, rd, rn, rm)
}

#[must_use]
pub const fn eor_w(rd: XReg, rn: XReg, rm: XReg) -> u32 {
    rrr(0x4A00_0000, rd, rn, rm)
}

#[must_use]
pub const fn bic_w(rd: XReg, rn: XReg, rm: XReg) -> u32 {
    rrr(0x0A20_0000, rd, rn, rm)
}

/// `mvn wd, wm`
#[must_use]
pub const fn mvn_w(rd: XReg, rm: XReg) -> u32 {
    rrr(0x2A20_0000, rd, XReg::ZR, rm)
}

#[must_use]
pub const fn csel_w(rd: XReg, rn: XReg, rm: XReg, cond: Cond) -> u32 {
    0x1A80_0000 | (rm.code() << 16) | (cond.bits() << 12) | (rn.code() << 5) | rd.code()
}

/// `lsr wd, wn, #shift`
#[must_use]
pub const fn lsr_w_imm(rd: XReg, rn: XReg, shift: u32) -> u32 {
    0x5300_0000 | ((shift & 31) << 16) | (31 << 10) | (rn.code() << 5) | rd.code()
}

/// `lsr xd, xn, #shift`
#[must_use]
pub const fn lsr_x_imm(rd: XReg, rn: XReg, shift: u32) -> u32 {
    0xD340_0000 | ((shift & 63) << 16) | (63 << 10) | (rn.code() << 5) | rd.code()
}

/// `bfi wd, wn, #lsb, #width`
#[must_use]
pub const fn bfi_w(rd: XReg, rn: XReg, lsb: u32, width: u32) -> u32 {
    let immr = (32 - lsb) % 32;
    let imms = width - 1;
    0x3300_0000 | (immr << 16) | (imms << 10) | (rn.code() << 5) | rd.code()
}

// ============================================================================
// Flags
// ============================================================================

/// `mrs xt, nzcv`
#[must_use]
pub const fn mrs_nzcv(rt: XReg) -> u32 {
    0xD53B_4200 | rt.code()
}

/// `msr nzcv, xt`
#[must_use]
pub const fn msr_nzcv(rt: XReg) -> u32 {
    0xD51B_4200 | rt.code()
}

// ============================================================================
// Loads and stores
// ============================================================================

const fn scaled(offset: u32, scale: u32) -> u32 {
    debug_assert!(offset % scale == 0);
    debug_assert!(offset / scale < 4096);
    (offset / scale) << 10
}

#[must_use]
pub const fn ldr_w(rt: XReg, rn: XReg, offset: u32) -> u32 {
    0xB940_0000 | scaled(offset, 4) | (rn.code() << 5) | rt.code()
}

#[must_use]
pub const fn str_w(rt: XReg, rn: XReg, offset: u32) -> u32 {
    0xB900_0000 | scaled(offset, 4) | (rn.code() << 5) | rt.code()
}

#[must_use]
pub const fn ldr_x(rt: XReg, rn: XReg, offset: u32) -> u32 {
    0xF940_0000 | scaled(offset, 8) | (rn.code() << 5) | rt.code()
}

#[must_use]
pub const fn str_x(rt: XReg, rn: XReg, offset: u32) -> u32 {
    0xF900_0000 | scaled(offset, 8) | (rn.code() << 5) | rt.code()
}

#[must_use]
pub const fn ldr_d(rt: VReg, rn: XReg, offset: u32) -> u32 {
    0xFD40_0000 | scaled(offset, 8) | (rn.code() << 5) | rt.code()
}

#[must_use]
pub const fn str_d(rt: VReg, rn: XReg, offset: u32) -> u32 {
    0xFD00_0000 | scaled(offset, 8) | (rn.code() << 5) | rt.code()
}

#[must_use]
pub const fn ldr_q(rt: VReg, rn: XReg, offset: u32) -> u32 {
    0x3DC0_0000 | scaled(offset, 16) | (rn.code() << 5) | rt.code()
}

#[must_use]
pub const fn str_q(rt: VReg, rn: XReg, offset: u32) -> u32 {
    0x3D80_0000 | scaled(offset, 16) | (rn.code() << 5) | rt.code()
}

#[allow(clippy::cast_sign_loss)]
const fn imm7(offset: i32, scale: i32) -> u32 {
    (((offset / scale) as u32) & 0x7F) << 15
}

/// `stp xt, xt2, [xn, #offset]`
#[must_use]
pub const fn stp_x(rt: XReg, rt2: XReg, rn: XReg, offset: i32) -> u32 {
    0xA900_0000 | imm7(offset, 8) | (rt2.code() << 10) | (rn.code() << 5) | rt.code()
}

/// `ldp xt, xt2, [xn, #offset]`
#[must_use]
pub const fn ldp_x(rt: XReg, rt2: XReg, rn: XReg, offset: i32) -> u32 {
    0xA940_0000 | imm7(offset, 8) | (rt2.code() << 10) | (rn.code() << 5) | rt.code()
}

/// `stp xt, xt2, [xn, #offset]!`
#[must_use]
pub const fn stp_x_pre(rt: XReg, rt2: XReg, rn: XReg, offset: i32) -> u32 {
    0xA980_0000 | imm7(offset, 8) | (rt2.code() << 10) | (rn.code() << 5) | rt.code()
}

/// `ldp xt, xt2, [xn], #offset`
#[must_use]
pub const fn ldp_x_post(rt: XReg, rt2: XReg, rn: XReg, offset: i32) -> u32 {
    0xA8C0_0000 | imm7(offset, 8) | (rt2.code() << 10) | (rn.code() << 5) | rt.code()
}

#[allow(clippy::cast_sign_loss)]
const fn imm9(offset: i32) -> u32 {
    ((offset as u32) & 0x1FF) << 12
}

/// `str xt, [xn, #offset]!`
#[must_use]
pub const fn str_x_pre(rt: XReg, rn: XReg, offset: i32) -> u32 {
    0xF800_0C00 | imm9(offset) | (rn.code() << 5) | rt.code()
}

/// `ldr xt, [xn], #offset`
#[must_use]
pub const fn ldr_x_post(rt: XReg, rn: XReg, offset: i32) -> u32 {
    0xF840_0400 | imm9(offset) | (rn.code() << 5) | rt.code()
}

/// `str dt, [xn, #offset]!`
#[must_use]
pub const fn str_d_pre(rt: VReg, rn: XReg, offset: i32) -> u32 {
    0xFC00_0C00 | imm9(offset) | (rn.code() << 5) | rt.code()
}

/// `ldr dt, [xn], #offset`
#[must_use]
pub const fn ldr_d_post(rt: VReg, rn: XReg, offset: i32) -> u32 {
    0xFC40_0400 | imm9(offset) | (rn.code() << 5) | rt.code()
}

// ============================================================================
// SIMD/FP
// ============================================================================

/// `fmov dd, dn`
#[must_use]
pub const fn fmov_d(rd: VReg, rn: VReg) -> u32 {
    0x1E60_4000 | (rn.code() << 5) | rd.code()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_encodings() {
        assert_eq!(ret(), 0xD65F_03C0);
        assert_eq!(br(XReg::X16), 0xD61F_0200);
        assert_eq!(blr(XReg::X7), 0xD63F_00E0);
        // mov x29, sp
        assert_eq!(add_x_imm(XReg::FP, XReg::SP, 0), 0x9100_03FD);
        // stp x29, x30, [sp, #-16]!
        assert_eq!(stp_x_pre(XReg::FP, XReg::LR, XReg::SP, -16), 0xA9BF_7BFD);
        // ldp x29, x30, [sp], #16
        assert_eq!(ldp_x_post(XReg::FP, XReg::LR, XReg::SP, 16), 0xA8C1_7BFD);
        // ldr w1, [x27, #8]
        assert_eq!(ldr_w(XReg::new(1), XReg::X27, 8), 0xB940_0B61);
        // mrs x17, nzcv
        assert_eq!(mrs_nzcv(XReg::X17), 0xD53B_4211);
        // lsr x0, x1, #32
        assert_eq!(lsr_x_imm(XReg::X0, XReg::X1, 32), 0xD360_FC20);
        // add w0, w1, w2
        assert_eq!(add_w(XReg::X0, XReg::X1, XReg::X2), 0x0B02_0020);
    }

    #[test]
    fn test_branch_displacement_roundtrip() {
        for disp in [-IMM26_RANGE, -1, 0, 1, 12345, IMM26_RANGE - 1] {
            assert_eq!(imm26_of(b(disp)), disp);
        }
        for disp in [-IMM19_RANGE, -7, 0, 2, IMM19_RANGE - 1] {
            let w = b_cond(Cond::Ne, disp);
            assert!(is_b_cond(w));
            assert_eq!(imm19_of(w), disp);
            assert_eq!(cond_of(w), Some(Cond::Ne));
        }
    }

    #[test]
    fn test_with_disp_preserves_fields() {
        let w = cbnz_w(XReg::X17, 0);
        let patched = with_disp(w, -5);
        assert!(is_cb(patched));
        assert_eq!(patched & 0x1F, 17);
        assert_eq!(branch_disp(patched), Some(-5));

        let c = with_disp(b_cond(Cond::Lt, 0), 300);
        assert_eq!(cond_of(c), Some(Cond::Lt));
        assert_eq!(branch_disp(c), Some(300));
    }

    #[test]
    fn test_ranges() {
        assert!(fits_imm26(IMM26_RANGE - 1));
        assert!(!fits_imm26(IMM26_RANGE));
        assert!(fits_imm19(-IMM19_RANGE));
        assert!(!fits_imm19(-IMM19_RANGE - 1));
        assert!(!disp_fits(b_cond(Cond::Eq, 0), IMM19_RANGE));
        assert!(disp_fits(b(0), IMM19_RANGE));
    }

    #[test]
    fn test_branch_classes_distinct() {
        assert!(is_b(b(3)) && !is_bl(b(3)));
        assert!(is_bl(bl(3)) && !is_b(bl(3)));
        assert!(!is_imm_branch(nop()));
        assert!(!is_imm_branch(br(XReg::X16)));
        assert!(is_cb(cbz_w(XReg::X0, 1)));
    }
}
