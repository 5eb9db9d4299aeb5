//! System Call Handler
//!
//! Dispatches system calls and implements the environment and memory
//! management handlers. IPC lives in `ipc.rs`.
//!
//! # Security Considerations
//! - All syscall numbers are validated against the whitelist
//! - Handles are resolved with the ownership check wherever the caller
//!   modifies another environment
//! - Checks run in a fixed order; the first failing one decides the error

use log::{debug, info};

use super::error::{Error, SysResult};
use super::numbers::*;
use super::validate::{check_perm, check_user_page};
use crate::env::{EnvId, EnvStatus};
use crate::kernel::Kernel;
use crate::mm::{Perm, VirtAddr};

impl Kernel {
    /// Dispatch a system call from `curenv`
    ///
    /// # Returns
    /// The value for x0, or `None` when the caller blocked in receive.
    ///
    /// # Security
    /// - Unknown syscall numbers are rejected with `Inval`
    /// - Each handler validates its own arguments
    pub(crate) fn dispatch(&mut self, num: u32, args: [u32; 5]) -> Option<i32> {
        let [a1, a2, a3, a4, a5] = args;
        let env = EnvId::from_raw;
        let va = |raw: u32| VirtAddr::new(raw as usize);

        let result = match num {
            SYS_CPUTS => self.sys_cputs(va(a1), a2 as usize).map(|()| 0),
            SYS_CGETC => self.sys_cgetc(),
            SYS_GETENVID => self.sys_getenvid().map(|id| id.raw() as i32),
            SYS_ENV_DESTROY => self.sys_env_destroy(env(a1)).map(|()| 0),
            SYS_PAGE_ALLOC => self.sys_page_alloc(env(a1), va(a2), a3).map(|()| 0),
            SYS_PAGE_MAP => self
                .sys_page_map(env(a1), va(a2), env(a3), va(a4), a5)
                .map(|()| 0),
            SYS_PAGE_UNMAP => self.sys_page_unmap(env(a1), va(a2)).map(|()| 0),
            SYS_EXOFORK => self.sys_exofork().map(|id| id.raw() as i32),
            SYS_ENV_SET_STATUS => self.sys_env_set_status(env(a1), a2).map(|()| 0),
            SYS_ENV_SET_PGFAULT_UPCALL => self
                .sys_env_set_pgfault_upcall(env(a1), va(a2))
                .map(|()| 0),
            SYS_YIELD => {
                self.sys_yield();
                Ok(0)
            }
            SYS_IPC_TRY_SEND => self
                .sys_ipc_try_send(env(a1), a2, va(a3), a4)
                .map(|()| 0),
            SYS_IPC_RECV => match self.sys_ipc_recv(va(a1)) {
                Ok(()) => return None,
                Err(e) => Err(e),
            },
            _ => {
                debug!("unknown syscall {}", num);
                Err(Error::Inval)
            }
        };

        Some(match result {
            Ok(ret) => ret,
            Err(e) => {
                debug!("syscall {} failed: {}", num, e);
                e.code()
            }
        })
    }

    fn current(&self) -> SysResult<EnvId> {
        self.curenv.ok_or(Error::BadEnv)
    }

    /// Print a user buffer on the console
    ///
    /// # Security
    /// The whole buffer must be user-readable; otherwise the caller is
    /// destroyed.
    pub fn sys_cputs(&mut self, buf: VirtAddr, len: usize) -> SysResult<()> {
        let cur = self.current()?;
        self.user_mem_assert(cur, buf, len, Perm::USER)?;

        let mut bytes = alloc::vec![0u8; len];
        self.copy_in(cur, buf, &mut bytes).map_err(|_| Error::Fault)?;
        self.console.write_bytes(&bytes);
        Ok(())
    }

    /// Read a console byte without blocking; 0 if none is waiting.
    pub fn sys_cgetc(&mut self) -> SysResult<i32> {
        Ok(self.console.getc().map_or(0, i32::from))
    }

    /// Handle of the calling environment.
    pub fn sys_getenvid(&self) -> SysResult<EnvId> {
        self.current()
    }

    /// Destroy the caller or one of its children
    pub fn sys_env_destroy(&mut self, envid: EnvId) -> SysResult<()> {
        let cur = self.current()?;
        let target = self.envs.resolve(envid, self.curenv, true)?;
        if target == cur {
            info!("[{}] exiting gracefully", cur);
        } else {
            info!("[{}] destroying {}", cur, target);
        }
        self.env_destroy(target);
        Ok(())
    }

    /// Give up the CPU.
    pub fn sys_yield(&mut self) {
        self.sched_yield();
    }

    /// Create a blank child environment
    ///
    /// The child gets an empty address space and a copy of the caller's
    /// registers with the return register cleared, and is left
    /// NOT_RUNNABLE.
    ///
    /// # Returns
    /// The child's handle in the parent.
    pub fn sys_exofork(&mut self) -> SysResult<EnvId> {
        let cur = self.current()?;
        let tf = self.envs.get(cur).ok_or(Error::BadEnv)?.tf;
        let child = self.envs.alloc(&mut self.frames, cur)?;

        let env = self.envs.get_mut(child).ok_or(Error::BadEnv)?;
        env.tf = tf;
        env.tf.set_return(0);
        env.status = EnvStatus::NotRunnable;
        debug!("[{}] exofork -> {}", cur, child);
        Ok(child)
    }

    /// Set the status of the caller or one of its children
    ///
    /// # Security
    /// Only RUNNABLE and NOT_RUNNABLE may be set.
    pub fn sys_env_set_status(&mut self, envid: EnvId, status: u32) -> SysResult<()> {
        let status = EnvStatus::settable(status).ok_or(Error::Inval)?;
        let target = self.envs.resolve(envid, self.curenv, true)?;
        let env = self.envs.get_mut(target).ok_or(Error::BadEnv)?;
        env.status = status;
        Ok(())
    }

    /// Register the page-fault entry point of the caller or one of its
    /// children. The address itself is not checked.
    pub fn sys_env_set_pgfault_upcall(&mut self, envid: EnvId, func: VirtAddr) -> SysResult<()> {
        let target = self.envs.resolve(envid, self.curenv, true)?;
        let env = self.envs.get_mut(target).ok_or(Error::BadEnv)?;
        env.pgfault_upcall = Some(func);
        Ok(())
    }

    /// Map a fresh zeroed page at `va` in the caller or one of its children
    ///
    /// Any existing mapping at `va` is replaced.
    ///
    /// # Security Checks
    /// 1. Target handle resolves and passes the ownership check
    /// 2. `va` is a page-aligned user address
    /// 3. `perm` carries PRESENT|USER and nothing outside the settable set
    pub fn sys_page_alloc(&mut self, envid: EnvId, va: VirtAddr, perm: u32) -> SysResult<()> {
        let target = self.envs.resolve(envid, self.curenv, true)?;
        let va = check_user_page(va)?;
        let perm = check_perm(perm)?;
        self.map_fresh_page(target, va, perm)
    }

    /// Map the frame at `srcva` in one environment at `dstva` in another
    ///
    /// # Security Checks
    /// 1. Both handles resolve and pass the ownership check
    /// 2. Both addresses are page-aligned user addresses
    /// 3. `srcva` is mapped in the source
    /// 4. `perm` carries PRESENT|USER and nothing outside the settable set
    /// 5. WRITABLE is only granted if the source mapping is writable
    pub fn sys_page_map(
        &mut self,
        srcenvid: EnvId,
        srcva: VirtAddr,
        dstenvid: EnvId,
        dstva: VirtAddr,
        perm: u32,
    ) -> SysResult<()> {
        let src = self.envs.resolve(srcenvid, self.curenv, true)?;
        let dst = self.envs.resolve(dstenvid, self.curenv, true)?;
        let srcva = check_user_page(srcva)?;
        let dstva = check_user_page(dstva)?;

        let (frame, src_perm) = self
            .envs
            .get(src)
            .and_then(|env| env.space.lookup(srcva))
            .ok_or(Error::Inval)?;
        let perm = check_perm(perm)?;
        if perm.contains(Perm::WRITABLE) && !src_perm.contains(Perm::WRITABLE) {
            return Err(Error::Inval);
        }

        let env = self.envs.get_mut(dst).ok_or(Error::BadEnv)?;
        env.space.insert(&mut self.frames, frame, dstva, perm)?;
        Ok(())
    }

    /// Remove the mapping at `va` in the caller or one of its children
    ///
    /// Unmapping an address with no mapping succeeds.
    pub fn sys_page_unmap(&mut self, envid: EnvId, va: VirtAddr) -> SysResult<()> {
        let target = self.envs.resolve(envid, self.curenv, true)?;
        let va = check_user_page(va)?;
        let env = self.envs.get_mut(target).ok_or(Error::BadEnv)?;
        env.space.remove(&mut self.frames, va);
        Ok(())
    }
}
