//! Fixup resolution.
//!
//! Runs once, after the body is emitted, over the pending fixups in emission
//! order. Each placeholder is rewritten exactly once: patched in place,
//! elided, or pointed at an out-of-line sequence appended to the buffer.
//! Out-of-line sequences either leave through the tail merger or branch back
//! to the word after their site.

use tracing::trace;

use a32t_emit::arm64::enc;
use a32t_emit::arm64::registers::{XReg, reserved};
use a32t_emit::dispatch::{emit_exit, emit_exit_to_register, load_dispatch_target, write_dispatch_address};
use a32t_emit::hostcall::{CallArg, CallTier, Callee, context_args, emit_host_call};
use a32t_emit::{
    CodeBuffer, ContextLayout, EmitContext, EmitError, ExitCondition, FixupKind, FixupTarget, PendingFixup,
    Result,
};
use a32t_ir::{Cond, ExceptionKind, GuestReg};

/// What the resolution pass did to the unit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResolveStats {
    pub fixups: usize,
    /// Direct branches patched to an in-unit target.
    pub patched: usize,
    /// Branches to the very next word, turned into nothing.
    pub elided: usize,
    /// Exit trampolines for direct branches leaving the unit.
    pub trampolines: usize,
    /// Conditional branches rerouted through `b.cond` + `b` pairs.
    pub long_branches: usize,
    /// Call, indirect and helper sequences.
    pub stubs: usize,
}

/// Resolve every pending fixup of the unit.
///
/// # Errors
/// A placeholder was already rewritten, a fixup lacks its target, or a
/// displacement does not fit its field.
pub fn resolve_fixups(ctx: &mut EmitContext<'_>, stats: &mut ResolveStats) -> Result<()> {
    for fixup in ctx.fixups.take() {
        if ctx.buf.read(fixup.site) != Some(fixup.kind.placeholder()) {
            return Err(EmitError::NotAPlaceholder(fixup.site));
        }
        resolve(ctx, &fixup, stats)?;
        stats.fixups += 1;
        trace!(site = fixup.site, pc = fixup.pc, kind = %fixup.kind, "resolved fixup");
    }
    Ok(())
}

fn resolve(ctx: &mut EmitContext<'_>, f: &PendingFixup, stats: &mut ResolveStats) -> Result<()> {
    match f.kind {
        FixupKind::Branch => resolve_branch(ctx, f, required_address(f)?, stats),
        FixupKind::CondBranch(cond) => resolve_cond_branch(ctx, f, cond, required_address(f)?, stats),
        FixupKind::Call => {
            let target = required_address(f)?;
            out_of_line(ctx, f, stats, |ctx| call_stub(ctx, f, Some(target)))
        }
        FixupKind::IndirectCall => out_of_line(ctx, f, stats, |ctx| call_stub(ctx, f, None)),
        FixupKind::IndirectBranch => match f.target {
            FixupTarget::Register(rm) if rm.is_pc() => resolve_branch(ctx, f, f.pc_value, stats),
            FixupTarget::Register(rm) => {
                let host = ctx.guest_gpr(rm)?;
                out_of_line(ctx, f, stats, |ctx| emit_exit_to_register(ctx, host).map(drop))
            }
            FixupTarget::None => out_of_line(ctx, f, stats, |ctx| {
                load_dispatch_target(ctx, None);
                ctx.tail.register(&mut ctx.buf, ExitCondition::Always).map(drop)
            }),
            _ => Err(missing(f)),
        },
        FixupKind::TableBranch { halfword } => {
            let FixupTarget::Registers(rn, rm) = f.target else {
                return Err(missing(f));
            };
            out_of_line(ctx, f, stats, |ctx| table_branch_stub(ctx, f, rn, rm, halfword))
        }
        FixupKind::SyncPoint => out_of_line(ctx, f, stats, |ctx| sync_point_stub(ctx, f)),
        FixupKind::SoftwareInterrupt { imm } => {
            let helper = ctx.config().helpers.software_interrupt;
            let args = [
                CallArg::Reg(reserved::CONTEXT_PTR),
                CallArg::Imm(u64::from(imm)),
                CallArg::Imm(u64::from(f.next_pc)),
            ];
            out_of_line(ctx, f, stats, |ctx| trap_stub(ctx, f, helper, &args))
        }
        FixupKind::Exception { kind, imm } => {
            let helper = ctx.config().helpers.exception;
            let args = [
                CallArg::Reg(reserved::CONTEXT_PTR),
                CallArg::Imm(exception_code(kind)),
                CallArg::Imm(u64::from(f.pc)),
                CallArg::Imm(u64::from(imm)),
            ];
            out_of_line(ctx, f, stats, |ctx| trap_stub(ctx, f, helper, &args))
        }
        FixupKind::TimerRead => {
            let FixupTarget::Registers(rt, rt2) = f.target else {
                return Err(missing(f));
            };
            out_of_line(ctx, f, stats, |ctx| timer_read_stub(ctx, f, rt, rt2))
        }
    }
}

/// Exception kind as passed to the exception helper.
#[must_use]
pub const fn exception_code(kind: ExceptionKind) -> u64 {
    match kind {
        ExceptionKind::Undefined => 0,
        ExceptionKind::Breakpoint => 1,
    }
}

fn required_address(f: &PendingFixup) -> Result<u32> {
    f.target.address().ok_or_else(|| missing(f))
}

fn missing(f: &PendingFixup) -> EmitError {
    EmitError::MissingFixupTarget {
        kind: f.kind.name(),
        site: f.site,
    }
}

fn checked_b(site: usize, target: usize) -> Result<u32> {
    let disp = CodeBuffer::disp(site, target);
    if enc::fits_imm26(disp) {
        Ok(enc::b(disp))
    } else {
        Err(EmitError::BranchOutOfRange { site, target, disp })
    }
}

/// Drop a branch to the next word: erase it when it is the last word,
/// otherwise overwrite it with `nop`.
fn elide(buf: &mut CodeBuffer, site: usize) {
    if site + 1 == buf.len() {
        buf.erase_last();
    } else {
        buf.write(site, enc::nop());
    }
}

/// Append `body` at the end of the buffer and point the site at it.
fn out_of_line<F>(ctx: &mut EmitContext<'_>, f: &PendingFixup, stats: &mut ResolveStats, body: F) -> Result<()>
where
    F: FnOnce(&mut EmitContext<'_>) -> Result<()>,
{
    let start = ctx.buf.ip();
    body(ctx)?;
    let word = checked_b(f.site, start)?;
    ctx.buf.write(f.site, word);
    stats.stubs += 1;
    Ok(())
}

fn branch_back(ctx: &mut EmitContext<'_>, site: usize) -> Result<()> {
    let word = checked_b(ctx.buf.ip(), site + 1)?;
    ctx.emit(word);
    Ok(())
}

// ============================================================================
// Direct branches
// ============================================================================

fn resolve_branch(ctx: &mut EmitContext<'_>, f: &PendingFixup, target: u32, stats: &mut ResolveStats) -> Result<()> {
    if let Some(to) = ctx.target_index(target) {
        let disp = CodeBuffer::disp(f.site, to);
        if disp == 1 {
            elide(&mut ctx.buf, f.site);
            stats.elided += 1;
            return Ok(());
        }
        if enc::fits_imm26(disp) {
            ctx.buf.write(f.site, enc::b(disp));
            stats.patched += 1;
            return Ok(());
        }
    }
    let start = ctx.buf.ip();
    emit_exit(ctx, target)?;
    let word = checked_b(f.site, start)?;
    ctx.buf.write(f.site, word);
    stats.trampolines += 1;
    Ok(())
}

fn resolve_cond_branch(
    ctx: &mut EmitContext<'_>,
    f: &PendingFixup,
    cond: Cond,
    target: u32,
    stats: &mut ResolveStats,
) -> Result<()> {
    let to = ctx.target_index(target);
    if let Some(to) = to {
        let disp = CodeBuffer::disp(f.site, to);
        if disp == 1 {
            elide(&mut ctx.buf, f.site);
            stats.elided += 1;
            return Ok(());
        }
        if enc::fits_imm19(disp) {
            ctx.buf.write(f.site, enc::b_cond(cond, disp));
            stats.patched += 1;
            return Ok(());
        }
    } else {
        let start = ctx.buf.ip();
        let disp = CodeBuffer::disp(f.site, start);
        if enc::fits_imm19(disp) {
            emit_exit(ctx, target)?;
            ctx.buf.write(f.site, enc::b_cond(cond, disp));
            stats.trampolines += 1;
            return Ok(());
        }
    }
    long_cond_branch(ctx, f, cond, target, to, stats)
}

/// Conditional branch beyond `b.cond` reach:
///
/// ```text
/// site:  b L
///        ...
/// L:     b.cond L+2
///        b site+1
///        b target        (or an exit when the target is not in reach)
/// ```
fn long_cond_branch(
    ctx: &mut EmitContext<'_>,
    f: &PendingFixup,
    cond: Cond,
    target: u32,
    to: Option<usize>,
    stats: &mut ResolveStats,
) -> Result<()> {
    let start = ctx.buf.ip();
    ctx.emit(enc::b_cond(cond, 2));
    let back = checked_b(start + 1, f.site + 1)?;
    ctx.emit(back);
    match to.map(|to| CodeBuffer::disp(start + 2, to)) {
        Some(disp) if enc::fits_imm26(disp) => {
            ctx.emit(enc::b(disp));
        }
        _ => {
            emit_exit(ctx, target)?;
            stats.trampolines += 1;
        }
    }
    let word = checked_b(f.site, start)?;
    ctx.buf.write(f.site, word);
    stats.long_branches += 1;
    Ok(())
}

// ============================================================================
// Out-of-line sequences
// ============================================================================

/// Leave the unit unless the guest address in the dispatch slot is
/// `expected`. Flag-neutral.
fn exit_unless_continuation(ctx: &mut EmitContext<'_>, expected: u32) -> Result<()> {
    ctx.emit(enc::ldr_w(reserved::SCRATCH, reserved::CONTEXT_PTR, ContextLayout::DISPATCH_ADDRESS));
    ctx.buf.emit_mov_imm32(reserved::DISPATCH, expected);
    ctx.emit(enc::eor_w(reserved::SCRATCH, reserved::SCRATCH, reserved::DISPATCH));
    load_dispatch_target(ctx, None);
    ctx.tail.register(&mut ctx.buf, ExitCondition::NonZero(reserved::SCRATCH))?;
    Ok(())
}

fn store_result_to_slot(ctx: &mut EmitContext<'_>) -> Result<()> {
    ctx.emit(enc::str_w(XReg::X0, reserved::CONTEXT_PTR, ContextLayout::DISPATCH_ADDRESS));
    Ok(())
}

/// Non-tail call into translated code. The guest link register was written
/// inline; for indirect calls so was the dispatch slot.
fn call_stub(ctx: &mut EmitContext<'_>, f: &PendingFixup, target: Option<u32>) -> Result<()> {
    if let Some(target) = target {
        write_dispatch_address(ctx, target);
    }
    load_dispatch_target(ctx, target);
    emit_host_call(
        ctx,
        CallTier::Full,
        Callee::Register(reserved::DISPATCH),
        &context_args(),
        store_result_to_slot,
    )?;
    exit_unless_continuation(ctx, f.next_pc)?;
    branch_back(ctx, f.site)
}

/// Guest trap through a lightweight helper returning the next guest address.
fn trap_stub(ctx: &mut EmitContext<'_>, f: &PendingFixup, helper: u64, args: &[CallArg]) -> Result<()> {
    emit_host_call(ctx, CallTier::SkipContext, Callee::Helper(helper), args, store_result_to_slot)?;
    exit_unless_continuation(ctx, f.next_pc)?;
    branch_back(ctx, f.site)
}

/// Counter reached zero: ask the runtime whether to yield. A non-zero answer
/// leaves the unit so the instruction re-executes on re-entry.
fn sync_point_stub(ctx: &mut EmitContext<'_>, f: &PendingFixup) -> Result<()> {
    let helper = ctx.config().helpers.sync_check;
    emit_host_call(
        ctx,
        CallTier::Full,
        Callee::Helper(helper),
        &[CallArg::Reg(reserved::CONTEXT_PTR)],
        |ctx| {
            ctx.emit(enc::mov_x(reserved::DISPATCH, XReg::X0));
            Ok(())
        },
    )?;
    write_dispatch_address(ctx, f.pc);
    ctx.emit(enc::mov_w(reserved::SCRATCH, reserved::DISPATCH));
    load_dispatch_target(ctx, None);
    ctx.tail.register(&mut ctx.buf, ExitCondition::NonZero(reserved::SCRATCH))?;
    branch_back(ctx, f.site)
}

/// The 64-bit count is split into the context slots of `rt`/`rt2`, so the
/// reload after the call lands it in their host registers.
fn timer_read_stub(ctx: &mut EmitContext<'_>, f: &PendingFixup, rt: GuestReg, rt2: GuestReg) -> Result<()> {
    ctx.guest_gpr(rt)?;
    ctx.guest_gpr(rt2)?;
    let helper = ctx.config().helpers.timer_read;
    emit_host_call(
        ctx,
        CallTier::SkipContext,
        Callee::Helper(helper),
        &[CallArg::Reg(reserved::CONTEXT_PTR)],
        |ctx| {
            ctx.emit(enc::str_w(XReg::X0, reserved::CONTEXT_PTR, ContextLayout::gpr(rt)));
            ctx.emit(enc::lsr_x_imm(reserved::SCRATCH, XReg::X0, 32));
            ctx.emit(enc::str_w(reserved::SCRATCH, reserved::CONTEXT_PTR, ContextLayout::gpr(rt2)));
            Ok(())
        },
    )?;
    branch_back(ctx, f.site)
}

fn table_branch_stub(
    ctx: &mut EmitContext<'_>,
    f: &PendingFixup,
    rn: GuestReg,
    rm: GuestReg,
    halfword: bool,
) -> Result<()> {
    let base = guest_arg(ctx, rn, f.pc_value)?;
    let index = guest_arg(ctx, rm, f.pc_value)?;
    let helper = ctx.config().helpers.table_branch;
    let args = [
        CallArg::Reg(reserved::CONTEXT_PTR),
        base,
        index,
        CallArg::Imm(u64::from(halfword)),
        CallArg::Imm(u64::from(f.pc_value)),
    ];
    emit_host_call(ctx, CallTier::SkipContext, Callee::Helper(helper), &args, store_result_to_slot)?;
    load_dispatch_target(ctx, None);
    ctx.tail.register(&mut ctx.buf, ExitCondition::Always)?;
    Ok(())
}

fn guest_arg(ctx: &mut EmitContext<'_>, reg: GuestReg, pc_value: u32) -> Result<CallArg> {
    if reg.is_pc() {
        Ok(CallArg::Imm(u64::from(pc_value)))
    } else {
        Ok(CallArg::Reg(ctx.guest_gpr(reg)?))
    }
}
