//! Copy-on-write fork.
//!
//! Writable pages are shared read-only between parent and child and marked
//! COW; the first write on either side takes a page fault and the handler
//! gives the writer a private copy.

use alloc::vec;

use log::debug;

use super::{ProcessLocal, UserEnv, UserPanic};
use crate::env::{EnvId, EnvStatus};
use crate::kernel::Exokernel;
use crate::mm::address::ENTRIES_PER_TABLE;
use crate::mm::mapper::USER_DIR_ENTRIES;
use crate::mm::{PageTableEntry, Perm, VirtAddr, PAGE_SIZE, PFTEMP, UXSTACKTOP};
use crate::trap::{FaultFlags, UTrapframe};

/// Parent-side result of [`UserEnv::fork`].
#[derive(Debug)]
pub struct Forked {
    /// The new child, already RUNNABLE.
    pub child: EnvId,
    image: ProcessLocal,
}

impl Forked {
    /// Continue as the child, where fork returned 0.
    pub fn resume_child<'k>(&self, sys: &'k Exokernel) -> Result<UserEnv<'k>, UserPanic> {
        let mut env = UserEnv {
            sys,
            cpu_env: self.child,
            local: self.image,
        };
        let ret = sys.lock().trapframe(self.child).map(|tf| tf.return_value());
        if ret != Some(0) {
            return Err(UserPanic {
                env: self.child,
                message: alloc::format!("child not resumable (fork returned {:?})", ret),
            });
        }
        // thisenv was copied from the parent
        let id = env.sys_getenvid().map_err(|e| env.fatal("sys_getenvid", e))?;
        env.local.thisenv = id;
        Ok(env)
    }
}

/// Page-fault handler that resolves copy-on-write faults.
pub fn cow_fault(env: &mut UserEnv<'_>, utf: &UTrapframe) -> Result<(), UserPanic> {
    let addr = utf.fault_va.align_down();
    if !utf.err.contains(FaultFlags::WRITE) {
        return Err(env.panic(alloc::format!(
            "not a write fault at {} (err {:?})",
            utf.fault_va,
            utf.err
        )));
    }
    let is_cow = env
        .sys
        .uvpt(env.cpu_env, addr)
        .map_or(false, |pte| pte.perm().contains(Perm::COW));
    if !is_cow {
        return Err(env.panic(alloc::format!("not a copy-on-write page at {}", addr)));
    }

    let scratch = VirtAddr::new(PFTEMP);
    env.sys_page_alloc(EnvId::CURRENT, scratch, Perm::USER_RW)
        .map_err(|e| env.fatal("sys_page_alloc", e))?;
    let mut page = vec![0u8; PAGE_SIZE];
    env.read(addr, &mut page)?;
    env.write(scratch, &page)?;
    env.sys_page_map(EnvId::CURRENT, scratch, EnvId::CURRENT, addr, Perm::USER_RW)
        .map_err(|e| env.fatal("sys_page_map", e))?;
    env.sys_page_unmap(EnvId::CURRENT, scratch)
        .map_err(|e| env.fatal("sys_page_unmap", e))?;
    Ok(())
}

impl UserEnv<'_> {
    /// Copy-on-write fork.
    ///
    /// Any failure is fatal to the caller. A child already created at that
    /// point is left behind, NOT_RUNNABLE.
    pub fn fork(&mut self) -> Result<Forked, UserPanic> {
        let has_upcall = self
            .thisenv()
            .map_or(false, |view| view.pgfault_upcall.is_some());
        if !has_upcall {
            self.set_pgfault_handler(cow_fault)?;
        }

        let child = self
            .sys_exofork()
            .map_err(|e| self.fatal("sys_exofork", e))?;
        let image = self.local;

        let xstack = VirtAddr::new(UXSTACKTOP - PAGE_SIZE);
        for pdx in 0..USER_DIR_ENTRIES {
            if !self.sys.uvpd(self.cpu_env, pdx) {
                continue;
            }
            for ptx in 0..ENTRIES_PER_TABLE {
                let va = VirtAddr::from_indices(pdx, ptx);
                if va == xstack {
                    continue;
                }
                if let Some(pte) = self.sys.uvpt(self.cpu_env, va) {
                    self.duppage(child, va, pte)?;
                }
            }
        }

        self.sys_page_alloc(child, xstack, Perm::USER_RW)
            .map_err(|e| self.fatal("sys_page_alloc", e))?;
        let upcall = self.thisenv().and_then(|view| view.pgfault_upcall);
        if let Some(upcall) = upcall {
            self.sys_env_set_pgfault_upcall(child, upcall)
                .map_err(|e| self.fatal("sys_env_set_pgfault_upcall", e))?;
        }
        self.sys_env_set_status(child, EnvStatus::Runnable)
            .map_err(|e| self.fatal("sys_env_set_status", e))?;

        debug!("[{}] fork -> {}", self.cpu_env, child);
        Ok(Forked { child, image })
    }

    /// Replicate the mapping at `va` into `child` according to its kind.
    fn duppage(&mut self, child: EnvId, va: VirtAddr, pte: PageTableEntry) -> Result<(), UserPanic> {
        let perm = pte.perm();
        let me = EnvId::CURRENT;
        let result = if perm.contains(Perm::SHARED) {
            self.sys_page_map(me, va, child, va, perm & Perm::SYSCALL)
        } else if perm.intersects(Perm::WRITABLE | Perm::COW) {
            // child first: once the parent is read-only its later writes fault
            self.sys_page_map(me, va, child, va, Perm::USER_COW)
                .and_then(|()| self.sys_page_map(me, va, me, va, Perm::USER_COW))
        } else {
            self.sys_page_map(me, va, child, va, perm & Perm::SYSCALL)
        };
        result.map_err(|e| self.fatal("duppage: sys_page_map", e))
    }
}
