//! End-to-end translation scenarios.

use a32t::{
    A32Emitter, CodeImage, CompileOptions, CompiledUnit, Compiler, ContextLayout, EmitConfig, EmitContext,
    EmitError, GuestBlock, GuestInstr, GuestReg, HostHelpers, InstrFlags, InstrKind, InstructionEmitter,
    MultiBlock, PROLOGUE_MAX_WORDS, SlotTable, UnitShape, decode,
};
use a32t_emit::arm64::enc;
use a32t_emit::arm64::registers::{XReg, reserved};
use a32t_ir::{CmpOp, Cond, Operand};

const HELPERS: HostHelpers = HostHelpers::at_stride(0x7000_0000, 0x100);

const ADD_R1_1: u32 = 0xE281_1001; // add r1, r1, #1
const CMP_R0_0: u32 = 0xE350_0000; // cmp r0, #0
const BX_LR: u32 = 0xE12F_FF1E;
const SVC_42: u32 = 0xEF00_0042;

fn image(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

fn compiler() -> Compiler<'static, A32Emitter> {
    Compiler::new(CompileOptions::new().with_helpers(HELPERS), A32Emitter::new())
}

fn translate(base: u32, words: &[u32]) -> CompiledUnit {
    let bytes = image(words);
    compiler().translate(&CodeImage::new(base, &bytes), base).unwrap()
}

/// Every placeholder was rewritten.
fn assert_resolved(code: &[u32]) {
    for (i, &word) in code.iter().enumerate() {
        assert_ne!(word, enc::b(0), "unresolved branch at {i}");
        assert!(!(enc::is_b_cond(word) && enc::imm19_of(word) == 0), "unresolved b.cond at {i}");
    }
}

fn branch_target(code: &[u32], index: usize) -> usize {
    let disp = enc::branch_disp(code[index]).unwrap();
    usize::try_from(index as i64 + disp).unwrap()
}

fn count(code: &[u32], word: u32) -> usize {
    code.iter().filter(|&&w| w == word).count()
}

#[test]
fn test_straight_line_block() {
    let unit = translate(0x1000, &[ADD_R1_1, ADD_R1_1, ADD_R1_1]);
    assert_eq!(unit.stats.resolve.fixups, 0);
    assert_eq!(unit.stats.guest_instructions, 3);
    assert!(unit.stats.truncated);
    // Only the fall-through exit leaves the unit.
    assert_eq!(unit.stats.exits, 1);
    assert_eq!(unit.stats.conditional_exits, 0);
    let trailer = unit.stats.trailer.unwrap();
    let body = &unit.code[PROLOGUE_MAX_WORDS..trailer];
    assert!(body.iter().all(|&w| !enc::is_b_cond(w) && !enc::is_cb(w)));
    assert_eq!(body.iter().filter(|&&w| enc::is_b(w)).count(), 1);
    assert_eq!(count(&unit.code, enc::br(reserved::DISPATCH)), 1);
    assert_resolved(&unit.code);
}

#[test]
fn test_conditional_branch_inside_unit() {
    // cmp r0, #0; beq skip; add; add; skip: bx lr
    let unit = translate(0x1000, &[CMP_R0_0, 0x0A00_0001, ADD_R1_1, ADD_R1_1, BX_LR]);
    assert_eq!(unit.stats.resolve.trampolines, 0);
    assert_eq!(unit.stats.resolve.long_branches, 0);

    // cmp is a single host word, so the branch sits right after it.
    let site = PROLOGUE_MAX_WORDS + 1;
    let word = unit.code[site];
    assert!(enc::is_b_cond(word));
    assert_eq!(enc::cond_of(word), Some(Cond::Eq));
    assert!(enc::imm19_of(word) > 1);
    // The target is the `bx lr` placeholder, now a branch to its exit stub.
    let target = branch_target(&unit.code, site);
    assert!(enc::is_b(unit.code[target]));
    assert!(target < unit.stats.trailer.unwrap());
    assert_resolved(&unit.code);
}

#[test]
fn test_it_predicated_branch_keeps_fall_through_exit() {
    // it eq; b 0x2000 (Thumb)
    let mut block = GuestBlock::new(0x1000);
    block.push(
        GuestInstr::new(0x1000, 0xBF08, "it", InstrKind::IfThen { firstcond: 0, mask: 0b1000 })
            .with_flags(InstrFlags::THUMB16),
    );
    block.push(
        GuestInstr::new(0x1002, 0xE7FE, "b", InstrKind::Branch { target: 0x2000 })
            .with_flags(InstrFlags::THUMB16 | InstrFlags::BRANCH),
    );
    let unit = MultiBlock::from_blocks(vec![block]);
    let compiled = compiler().compile(&unit).unwrap();
    let code = &compiled.code;

    // Taken path and not-taken path each leave the unit.
    assert_eq!(compiled.stats.exits, 2);
    let site = PROLOGUE_MAX_WORDS;
    assert!(enc::is_b_cond(code[site]));
    assert_eq!(enc::cond_of(code[site]), Some(Cond::Eq));
    assert!(enc::imm19_of(code[site]) > 1);
    // Not taken: falls into the exit to the next instruction.
    assert_eq!(code[site + 1], enc::movz_w(reserved::SCRATCH, 0x1004, 0));
    // Taken: the trampoline exits to the branch target.
    let taken = branch_target(code, site);
    assert_eq!(code[taken], enc::movz_w(reserved::SCRATCH, 0x2000, 0));
    assert_resolved(code);
}

/// Emits a long run of `nop`s for instructions named `pad`.
struct Padded {
    inner: A32Emitter,
    words: usize,
}

impl InstructionEmitter for Padded {
    fn emit(&self, ctx: &mut EmitContext<'_>, instr: &GuestInstr) -> Result<(), EmitError> {
        if instr.name == "pad" {
            for _ in 0..self.words {
                ctx.emit(enc::nop());
            }
            return Ok(());
        }
        self.inner.emit(ctx, instr)
    }
}

#[test]
fn test_conditional_branch_out_of_short_range() {
    const PAD: usize = 300_000;
    let mut head = GuestBlock::new(0x1000);
    head.push(
        GuestInstr::new(
            0x1000,
            CMP_R0_0,
            "cmp",
            InstrKind::Compare {
                op: CmpOp::Cmp,
                rn: GuestReg::new(0),
                operand: Operand::Imm(0),
            },
        )
        .with_flags(InstrFlags::SETS_FLAGS),
    );
    head.push(
        GuestInstr::new(0x1004, 0, "b", InstrKind::Branch { target: 0x100C })
            .with_cond(Cond::Eq)
            .with_flags(InstrFlags::BRANCH),
    );
    let mut padding = GuestBlock::new(0x1008);
    padding.push(GuestInstr::new(0x1008, 0, "pad", InstrKind::Nop));
    let mut exit = GuestBlock::new(0x100C);
    exit.push(
        GuestInstr::new(0x100C, BX_LR, "bx", InstrKind::BranchExchange { rm: GuestReg::LR })
            .with_flags(InstrFlags::BRANCH),
    );
    let unit = MultiBlock::from_blocks(vec![head, padding, exit]);

    let emitter = Padded {
        inner: A32Emitter::new(),
        words: PAD,
    };
    let compiled = Compiler::new(CompileOptions::new().with_helpers(HELPERS), emitter)
        .compile(&unit)
        .unwrap();
    let code = &compiled.code;
    assert_eq!(compiled.stats.resolve.long_branches, 1);
    assert_eq!(compiled.stats.resolve.trampolines, 0);

    // site: b L
    let site = PROLOGUE_MAX_WORDS + 1;
    assert!(enc::is_b(code[site]));
    let stub = branch_target(code, site);
    assert!(stub > site + PAD);
    // L: b.eq taken; b site+1; taken: b target
    assert_eq!(code[stub], enc::b_cond(Cond::Eq, 2));
    assert_eq!(branch_target(code, stub + 1), site + 1);
    let target = branch_target(code, stub + 2);
    assert_eq!(target, site + 1 + PAD);
    assert!(enc::is_b(code[target]));
    assert_resolved(code);
}

#[test]
fn test_software_interrupt_uses_skip_tier() {
    let bytes = image(&[SVC_42, BX_LR]);
    let image = CodeImage::new(0x4000, &bytes);
    let linearized = CompileOptions::new().linearizer().linearize(&image, 0x4000).unwrap();
    assert!(linearized.has_host_call_skip_context);
    assert!(!linearized.has_host_call);

    let unit = compiler().compile(&linearized).unwrap();
    let code = &unit.code;
    assert_eq!(unit.stats.spill_bytes, 16);

    let save = enc::stp_x(reserved::CONTEXT_PTR, reserved::PAGE_TABLE_PTR, XReg::SP, 0);
    let restore = enc::ldp_x(reserved::CONTEXT_PTR, reserved::PAGE_TABLE_PTR, XReg::SP, 0);
    let start = code.iter().position(|&w| w == save).unwrap();
    let end = code.iter().position(|&w| w == restore).unwrap();
    assert!(start < end);
    let call = &code[start..end];
    assert_eq!(count(call, enc::blr(reserved::CALL_TARGET)), 1);

    // Only the two pointers go to the stack; the guest file is flushed to
    // the context outside the pointer save.
    let lr = XReg::new(15);
    let lr_slot = ContextLayout::gpr(GuestReg::LR);
    assert_eq!(code[start - 1], enc::str_w(lr, reserved::CONTEXT_PTR, lr_slot));
    assert_eq!(code[end + 1], enc::ldr_w(lr, reserved::CONTEXT_PTR, lr_slot));
    assert_eq!(count(call, enc::str_x(lr, XReg::SP, 0)), 0);
    assert!(call.iter().all(|&w| w != enc::mrs_nzcv(reserved::SCRATCH)));

    // Continuation check plus the `bx lr` exit.
    assert_eq!(unit.stats.exits, 2);
    assert_eq!(unit.stats.conditional_exits, 1);
    assert_resolved(code);
}

#[test]
fn test_software_interrupt_sees_and_keeps_guest_registers() {
    // mov r8, #5; svc #0x42; bx lr
    let unit = translate(0x4000, &[0xE3A0_8005, SVC_42, BX_LR]);
    let code = &unit.code;
    let trailer = unit.stats.trailer.unwrap();
    let r8 = XReg::new(9);
    let slot = ContextLayout::gpr(GuestReg::new(8));
    let store = enc::str_w(r8, reserved::CONTEXT_PTR, slot);
    let load = enc::ldr_w(r8, reserved::CONTEXT_PTR, slot);

    let save = enc::stp_x(reserved::CONTEXT_PTR, reserved::PAGE_TABLE_PTR, XReg::SP, 0);
    let restore = enc::ldp_x(reserved::CONTEXT_PTR, reserved::PAGE_TABLE_PTR, XReg::SP, 0);
    let start = code.iter().position(|&w| w == save).unwrap();
    let end = code.iter().position(|&w| w == restore).unwrap();
    let call = start + code[start..].iter().position(|&w| w == enc::blr(reserved::CALL_TARGET)).unwrap();
    assert!(call < end);

    // The helper reads r8 from the context and whatever it writes back is
    // reloaded before the guest continues.
    let flushed = code[..start].iter().rposition(|&w| w == store).unwrap();
    assert!(flushed >= PROLOGUE_MAX_WORDS);
    let reloaded = end + code[end..].iter().position(|&w| w == load).unwrap();
    assert!(reloaded < trailer);
    assert_resolved(code);
}

#[test]
fn test_two_calls_share_one_trailer() {
    // bl 0x1100; bl 0x1104; bx lr
    let unit = translate(0x1000, &[0xEB00_003E, 0xEB00_003E, BX_LR]);
    assert_eq!(unit.stats.resolve.fixups, 3);
    assert_eq!(unit.stats.conditional_exits, 2);
    assert_eq!(unit.stats.exits, 3);
    assert_eq!(count(&unit.code, enc::br(reserved::DISPATCH)), 1);
    assert_eq!(count(&unit.code, enc::blr(reserved::DISPATCH)), 2);
    assert_resolved(&unit.code);
}

#[test]
fn test_adjacent_branch_is_elided() {
    // b next; add; bx lr
    let unit = translate(0x2000, &[0xEAFF_FFFF, ADD_R1_1, BX_LR]);
    assert_eq!(unit.stats.resolve.elided, 1);
    assert_eq!(unit.code[PROLOGUE_MAX_WORDS], enc::nop());
    assert_resolved(&unit.code);
}

#[test]
fn test_backward_loop_branch() {
    // loop: add r1, r1, #1; subs r0, r0, #1; bne loop; bx lr
    let unit = translate(0x3000, &[ADD_R1_1, 0xE250_0001, 0x1AFF_FFFC, BX_LR]);
    let code = &unit.code;
    // The loop branch returns to the first body word.
    let back = code
        .iter()
        .enumerate()
        .find(|&(i, &w)| enc::is_b_cond(w) && enc::cond_of(w) == Some(Cond::Ne) && enc::imm19_of(w) < 0 && i > 0)
        .map(|(i, _)| i)
        .unwrap();
    assert_eq!(branch_target(code, back), PROLOGUE_MAX_WORDS);
    // Sync check before the branch.
    let ldr = enc::ldr_w(reserved::SCRATCH, reserved::CONTEXT_PTR, ContextLayout::EXEC_COUNTER);
    let check = code.iter().position(|&w| w == ldr).unwrap();
    assert!(check < back);
    // Sync point and the `bx lr` exit.
    assert_eq!(unit.stats.resolve.stubs, 2);
    assert_resolved(code);
}

#[test]
fn test_context_symmetry() {
    // add r1, r1, #1; add r2, r3, r4; bx lr
    let unit = translate(0x5000, &[ADD_R1_1, 0xE083_2004, BX_LR]);
    let code = &unit.code;
    let trailer = &code[unit.stats.trailer.unwrap()..];
    let prologue = &code[..unit.stats.prologue_words];
    for (guest, host) in [(1u8, 20u8), (2, 21), (3, 22), (4, 23), (14, 15)] {
        let reg = GuestReg::new(guest);
        let host = XReg::new(host);
        let offset = ContextLayout::gpr(reg);
        assert_eq!(count(prologue, enc::ldr_w(host, reserved::CONTEXT_PTR, offset)), 1, "load r{guest}");
        assert_eq!(count(trailer, enc::str_w(host, reserved::CONTEXT_PTR, offset)), 1, "store r{guest}");
    }
    // r0 is never touched.
    let r0 = ContextLayout::gpr(GuestReg::new(0));
    assert_eq!(count(code, enc::ldr_w(XReg::new(19), reserved::CONTEXT_PTR, r0)), 0);
}

#[test]
fn test_translation_is_deterministic() {
    let words = [CMP_R0_0, 0x0A00_0001, ADD_R1_1, 0xEB00_003E, SVC_42, BX_LR];
    let first = translate(0x6000, &words);
    let second = translate(0x6000, &words);
    assert_eq!(first, second);
}

#[test]
fn test_dispatch_table_slot_load() {
    let bytes = image(&[ADD_R1_1]);
    let mut slots = SlotTable::new(0x9000_0000);
    slots.insert(0x1004);
    let unit = Compiler::new(CompileOptions::new().with_helpers(HELPERS), A32Emitter::new())
        .with_dispatch(&slots)
        .translate(&CodeImage::new(0x1000, &bytes), 0x1000)
        .unwrap();
    // The exit loads through its table slot instead of jumping to the
    // fallback dispatcher.
    assert_eq!(count(&unit.code, enc::movz_x(reserved::DISPATCH, 0x9000, 1)), 1);
    assert_eq!(count(&unit.code, enc::ldr_x(reserved::DISPATCH, reserved::DISPATCH, 0)), 1);
    assert_eq!(count(&unit.code, enc::movz_x(reserved::DISPATCH, 0x7000, 1)), 0);
    assert_resolved(&unit.code);
}

#[test]
fn test_every_emitter_releases_leases() {
    let config = EmitConfig::new(HELPERS);
    let words = [
        ADD_R1_1,
        0xE083_2004, // add r2, r3, r4
        0xE28F_0008, // add r0, pc, #8
        0xE3A0_24FF, // mov r2, #0xFF000000
        0xE1A0_F00E, // mov pc, lr
        0xE211_0001, // ands r0, r1, #1
        0xE150_0005, // cmp r0, r5
        0xE310_0001, // tst r0, #1
        0xE330_0001, // teq r0, #1
        0xE28F_F004, // add pc, pc, #4
        0xEEB0_0B41, // vmov.f64 d0, d1
        0xEC51_0F0E, // mrrc p15, 0, r0, r1, c14
        SVC_42,
        0xE120_0172, // bkpt #0x12
        0xE7F0_00F0, // udf
        BX_LR,
        0xE12F_FF33, // blx r3
    ];
    let emitter = A32Emitter::new();
    let mut ctx = EmitContext::new(&config, None, UnitShape::default());
    let (gprs, fpsimd) = (ctx.regs.free_gprs(), ctx.regs.free_fpsimd());
    for (i, &word) in words.iter().enumerate() {
        let instr = decode(word, 0x1000 + 4 * i as u32);
        ctx.begin_instr(&instr, instr.cond);
        emitter.emit(&mut ctx, &instr).unwrap();
        ctx.end_instr();
        assert_eq!(ctx.regs.free_gprs(), gprs, "{}", instr.name);
        assert_eq!(ctx.regs.free_fpsimd(), fpsimd, "{}", instr.name);
    }
}

#[test]
fn test_thumb_call_links_with_low_bit() {
    let mut block = GuestBlock::new(0x8000);
    block.push(
        GuestInstr::new(0x8000, 0, "bl", InstrKind::BranchLink { target: 0x9000 })
            .with_flags(InstrFlags::BRANCH | InstrFlags::CALL | InstrFlags::HOST_CALL),
    );
    let unit = Compiler::new(
        CompileOptions::new().with_helpers(HELPERS).with_thumb(true),
        A32Emitter::new(),
    )
    .compile(&MultiBlock::from_blocks(vec![block]))
    .unwrap();
    assert_eq!(unit.code[PROLOGUE_MAX_WORDS], enc::movz_w(XReg::new(15), 0x8005, 0));
}
