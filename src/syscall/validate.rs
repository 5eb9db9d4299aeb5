//! System Call Input Validation
//!
//! Address and permission checks shared by every handler.
//!
//! # Security Principles
//! - Validate ALL inputs before use
//! - Fail-secure: deny by default
//! - Reject unknown permission bits rather than masking them off
//! - Check a whole user buffer before touching any of it

use log::warn;

use super::error::{Error, SysResult};
use crate::env::EnvId;
use crate::kernel::Kernel;
use crate::mm::{Perm, VirtAddr};

/// Validate a page address argument
///
/// # Security Checks
/// 1. Address lies below the user ceiling
/// 2. Address is page-aligned
pub fn check_user_page(va: VirtAddr) -> SysResult<VirtAddr> {
    if va.is_user_page() {
        Ok(va)
    } else {
        Err(Error::Inval)
    }
}

/// Validate a permission argument
///
/// # Security Checks
/// 1. No bit outside the syscall-settable set is present
/// 2. PRESENT and USER are both set
pub fn check_perm(raw: u32) -> SysResult<Perm> {
    let perm = Perm::from_bits(raw).ok_or(Error::Inval)?;
    if !perm.contains(Perm::REQUIRED) || !Perm::SYSCALL.contains(perm) {
        return Err(Error::Inval);
    }
    Ok(perm)
}

impl Kernel {
    /// Check a user buffer on behalf of `id`, destroying `id` if any part of
    /// it is not accessible with `perm`.
    pub(crate) fn user_mem_assert(
        &mut self,
        id: EnvId,
        va: VirtAddr,
        len: usize,
        perm: Perm,
    ) -> SysResult<()> {
        if let Err(bad) = self.user_mem_check(id, va, len, perm) {
            warn!("[{}] user_mem_check assertion failure for va {}", id, bad);
            self.env_destroy(id);
            return Err(Error::Fault);
        }
        Ok(())
    }
}
