//! Exit merging.
//!
//! Every way out of a unit ends in the same trailer (flush context, tear down
//! the frame, jump through the dispatch register). Exit sites register here
//! and the trailer is emitted once, after fixup resolution.
//!
//! A registered exit is always an unconditional `b` to the trailer, so it can
//! reach across the whole buffer. Conditional exits guard that `b` with a
//! short inverted skip over it.

use a32t_ir::Cond;
use tracing::trace;

use crate::arm64::enc;
use crate::arm64::registers::XReg;
use crate::codebuf::CodeBuffer;
use crate::error::{EmitError, Result};

/// When a registered exit is taken.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitCondition {
    Always,
    /// Host NZCV satisfies the condition.
    Cond(Cond),
    /// The register's low word is non-zero.
    NonZero(XReg),
    Zero(XReg),
}

impl ExitCondition {
    #[must_use]
    pub const fn is_conditional(self) -> bool {
        !matches!(self, Self::Always)
    }

    /// Branch that skips the exit when the condition does not hold.
    const fn skip(self) -> Option<u32> {
        match self {
            Self::Always => None,
            Self::Cond(cond) => Some(enc::b_cond(cond.invert(), 2)),
            Self::NonZero(reg) => Some(enc::cbz_w(reg, 2)),
            Self::Zero(reg) => Some(enc::cbnz_w(reg, 2)),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct TailMerger {
    exits: Vec<(ExitCondition, usize)>,
}

impl TailMerger {
    #[must_use]
    pub const fn new() -> Self {
        Self { exits: Vec::new() }
    }

    /// Emit an exit guarded by `cond` and record its branch word.
    ///
    /// # Errors
    /// `Cond(Al)` is not a conditional exit; use `Always`.
    pub fn register(&mut self, buf: &mut CodeBuffer, cond: ExitCondition) -> Result<usize> {
        if cond == ExitCondition::Cond(Cond::Al) {
            return Err(EmitError::InvalidLoweringTransition(Cond::Al));
        }
        if let Some(skip) = cond.skip() {
            buf.emit(skip);
        }
        let site = buf.emit(enc::b(0));
        trace!(site, ?cond, "registered exit");
        self.exits.push((cond, site));
        Ok(site)
    }

    #[must_use]
    pub fn exits(&self) -> &[(ExitCondition, usize)] {
        &self.exits
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.exits.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.exits.is_empty()
    }

    #[must_use]
    pub fn conditional_count(&self) -> usize {
        self.exits.iter().filter(|(c, _)| c.is_conditional()).count()
    }

    /// Emit the shared trailer at the end of `buf` and point every registered
    /// exit at it. Returns the trailer's index, or `None` when nothing exits.
    ///
    /// # Errors
    /// Errors from `trailer`, or an exit that cannot reach the trailer.
    pub fn finalize<F>(self, buf: &mut CodeBuffer, trailer: F) -> Result<Option<usize>>
    where
        F: FnOnce(&mut CodeBuffer) -> Result<()>,
    {
        if self.exits.is_empty() {
            return Ok(None);
        }
        let start = buf.ip();
        trailer(buf)?;
        for (_, site) in self.exits {
            let disp = CodeBuffer::disp(site, start);
            if !enc::fits_imm26(disp) {
                return Err(EmitError::BranchOutOfRange {
                    site,
                    target: start,
                    disp,
                });
            }
            buf.write(site, enc::b(disp));
        }
        Ok(Some(start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ret_trailer(buf: &mut CodeBuffer) -> Result<()> {
        buf.emit(enc::ret());
        Ok(())
    }

    #[test]
    fn test_no_exits_no_trailer() {
        let mut buf = CodeBuffer::new();
        let tail = TailMerger::new();
        assert_eq!(tail.finalize(&mut buf, ret_trailer).unwrap(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_exits_share_one_trailer() {
        let mut buf = CodeBuffer::new();
        let mut tail = TailMerger::new();
        let a = tail.register(&mut buf, ExitCondition::Always).unwrap();
        buf.emit(enc::nop());
        let b = tail.register(&mut buf, ExitCondition::NonZero(XReg::X17)).unwrap();
        let c = tail.register(&mut buf, ExitCondition::Cond(Cond::Eq)).unwrap();
        assert_eq!(tail.len(), 3);
        assert_eq!(tail.conditional_count(), 2);
        let start = tail.finalize(&mut buf, ret_trailer).unwrap().unwrap();
        assert_eq!(buf.words().iter().filter(|&&w| w == enc::ret()).count(), 1);
        for site in [a, b, c] {
            let w = buf.read(site).unwrap();
            assert!(enc::is_b(w));
            assert_eq!(site as i64 + enc::imm26_of(w), start as i64);
        }
    }

    #[test]
    fn test_conditional_exit_skips() {
        let mut buf = CodeBuffer::new();
        let mut tail = TailMerger::new();
        let site = tail.register(&mut buf, ExitCondition::NonZero(XReg::X17)).unwrap();
        let skip = buf.read(site - 1).unwrap();
        assert!(enc::is_cb(skip));
        assert_eq!(enc::imm19_of(skip), 2);

        let site = tail.register(&mut buf, ExitCondition::Cond(Cond::Ne)).unwrap();
        assert_eq!(enc::cond_of(buf.read(site - 1).unwrap()), Some(Cond::Eq));
    }

    #[test]
    fn test_always_condition_rejected() {
        let mut buf = CodeBuffer::new();
        let mut tail = TailMerger::new();
        assert!(tail.register(&mut buf, ExitCondition::Cond(Cond::Al)).is_err());
    }
}
