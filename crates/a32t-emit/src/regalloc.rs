//! Host register allocation.
//!
//! Guest registers are pinned to fixed host registers for the whole unit (see
//! [`crate::arm64::registers`]). Everything else an emitter needs comes from
//! a small pool of temporaries leased through [`ScopedRegister`] guards that
//! hand the register back when dropped.
//!
//! The `used_*` masks are cumulative: a register that was ever leased or
//! remapped stays marked, because the prologue, the shared epilogue and every
//! host call save exactly that set.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use a32t_ir::{GuestDReg, GuestReg};

use crate::arm64::registers::{
    self, CALLEE_SAVED_FPSIMD, CALLEE_SAVED_GPRS, RegisterClass, TEMP_FPSIMD, TEMP_GPRS, VReg,
    XReg, reserved,
};
use crate::error::{EmitError, Result};

/// Lease on one temporary host register.
///
/// Dropping the guard returns the register to its pool. The guard is `!Send`:
/// leases never leave the compiling thread.
pub struct ScopedRegister<R: RegisterClass> {
    reg: R,
    pool: Rc<Cell<u32>>,
}

impl<R: RegisterClass> ScopedRegister<R> {
    /// The leased register. Only valid while the guard lives.
    #[must_use]
    pub fn reg(&self) -> R {
        self.reg
    }

    /// Return the register early.
    pub fn release(self) {
        drop(self);
    }
}

impl<R: RegisterClass> Drop for ScopedRegister<R> {
    fn drop(&mut self) {
        let free = self.pool.get();
        debug_assert_eq!(free & self.reg.mask(), 0, "{:?} released twice", self.reg);
        self.pool.set(free | self.reg.mask());
    }
}

impl<R: RegisterClass> fmt::Debug for ScopedRegister<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ScopedRegister").field(&self.reg).finish()
    }
}

/// Per-unit register state.
#[derive(Debug)]
pub struct RegisterAllocator {
    used_gprs: u32,
    used_fpsimd: u32,
    uses_flags: bool,
    free_gprs: Rc<Cell<u32>>,
    free_fpsimd: Rc<Cell<u32>>,
}

impl Default for RegisterAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            // The fixed pointers are live for the whole unit.
            used_gprs: reserved::CONTEXT_PTR.mask() | reserved::PAGE_TABLE_PTR.mask(),
            used_fpsimd: 0,
            uses_flags: false,
            free_gprs: Rc::new(Cell::new(TEMP_GPRS)),
            free_fpsimd: Rc::new(Cell::new(TEMP_FPSIMD)),
        }
    }

    /// Host register for guest GPR `reg`. Deterministic for the unit.
    ///
    /// # Errors
    /// `pc` has no register home.
    pub fn remap_gpr(&mut self, reg: GuestReg) -> Result<XReg> {
        let host = registers::guest_gpr(reg).ok_or(EmitError::UnmappedGuestRegister(reg))?;
        self.used_gprs |= host.mask();
        Ok(host)
    }

    /// Host register for guest D register `reg`, if it is register-resident.
    pub fn remap_dreg(&mut self, reg: GuestDReg) -> Option<VReg> {
        let host = registers::guest_dreg(reg)?;
        self.used_fpsimd |= host.mask();
        Some(host)
    }

    /// Lease a temporary GPR.
    ///
    /// # Errors
    /// The pool is empty: an emitter holds more leases than the pool allows.
    pub fn allocate_gpr(&mut self) -> Result<ScopedRegister<XReg>> {
        let reg: ScopedRegister<XReg> = Self::take(&self.free_gprs, "gpr")?;
        self.used_gprs |= reg.reg().mask();
        Ok(reg)
    }

    /// Lease a temporary SIMD/FP register.
    ///
    /// # Errors
    /// The pool is empty.
    pub fn allocate_fpsimd(&mut self) -> Result<ScopedRegister<VReg>> {
        let reg: ScopedRegister<VReg> = Self::take(&self.free_fpsimd, "fpsimd")?;
        self.used_fpsimd |= reg.reg().mask();
        Ok(reg)
    }

    fn take<R: RegisterClass>(pool: &Rc<Cell<u32>>, class: &'static str) -> Result<ScopedRegister<R>> {
        let free = pool.get();
        if free == 0 {
            return Err(EmitError::RegisterPoolExhausted { class });
        }
        #[allow(clippy::cast_possible_truncation)]
        let index = free.trailing_zeros() as u8;
        let reg = R::from_index(index);
        pool.set(free & !reg.mask());
        Ok(ScopedRegister {
            reg,
            pool: Rc::clone(pool),
        })
    }

    /// Guest NZCV is read or written somewhere in the unit.
    pub const fn mark_flags_used(&mut self) {
        self.uses_flags = true;
    }

    #[must_use]
    pub const fn used_gprs(&self) -> u32 {
        self.used_gprs
    }

    #[must_use]
    pub const fn used_fpsimd(&self) -> u32 {
        self.used_fpsimd
    }

    #[must_use]
    pub const fn uses_flags(&self) -> bool {
        self.uses_flags
    }

    #[must_use]
    pub fn free_gprs(&self) -> u32 {
        self.free_gprs.get().count_ones()
    }

    #[must_use]
    pub fn free_fpsimd(&self) -> u32 {
        self.free_fpsimd.get().count_ones()
    }

    /// Host GPRs holding guest state that must go through the context.
    #[must_use]
    pub fn context_gprs(&self) -> u32 {
        self.used_gprs & registers::usable_gprs_mask()
    }

    /// Host SIMD registers holding guest state.
    #[must_use]
    pub const fn context_fpsimd(&self) -> u32 {
        self.used_fpsimd & registers::usable_fpsimd_mask()
    }

    /// Callee-saved GPRs the prologue must preserve.
    #[must_use]
    pub const fn saved_gprs(&self) -> u32 {
        self.used_gprs & CALLEE_SAVED_GPRS
    }

    /// Callee-saved SIMD registers the prologue must preserve.
    #[must_use]
    pub const fn saved_fpsimd(&self) -> u32 {
        self.used_fpsimd & CALLEE_SAVED_FPSIMD
    }

    /// Guest-holding GPRs a host call would clobber.
    #[must_use]
    pub fn call_clobbered_gprs(&self) -> u32 {
        self.context_gprs() & !CALLEE_SAVED_GPRS
    }
}
