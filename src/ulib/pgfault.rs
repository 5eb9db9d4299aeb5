//! User page-fault handler registration.

use super::{UserEnv, UserPanic};
use crate::env::EnvId;
use crate::mm::{Perm, VirtAddr, PAGE_SIZE, UTEXT, UXSTACKTOP};
use crate::trap::UTrapframe;

/// A user-level page-fault handler.
pub type PgfaultHandler = fn(&mut UserEnv<'_>, &UTrapframe) -> Result<(), UserPanic>;

/// Address of the assembly trampoline that every upcall enters.
pub const PGFAULT_UPCALL_ENTRY: VirtAddr = VirtAddr::new(UTEXT + 0x20);

impl UserEnv<'_> {
    /// Install `handler` for this environment's page faults.
    ///
    /// The first call also allocates the exception stack and registers the
    /// upcall with the kernel.
    pub fn set_pgfault_handler(&mut self, handler: PgfaultHandler) -> Result<(), UserPanic> {
        if self.local.pgfault_handler.is_none() {
            let xstack = VirtAddr::new(UXSTACKTOP - PAGE_SIZE);
            self.sys_page_alloc(EnvId::CURRENT, xstack, Perm::USER_RW)
                .map_err(|e| self.fatal("set_pgfault_handler: sys_page_alloc", e))?;
            self.sys_env_set_pgfault_upcall(EnvId::CURRENT, PGFAULT_UPCALL_ENTRY)
                .map_err(|e| self.fatal("set_pgfault_handler: sys_env_set_pgfault_upcall", e))?;
        }
        self.local.pgfault_handler = Some(handler);
        Ok(())
    }
}
