//! User-Level Library
//!
//! Everything here runs as an ordinary environment: it reaches the kernel
//! only through the numeric system call interface and the read-only
//! environment and page table views. Process creation (copy-on-write fork),
//! page-fault handling policy and blocking IPC are all built from the
//! kernel's primitives.
//!
//! # Hosted model
//! A [`UserEnv`] is one environment's thread of control. Its
//! [`ProcessLocal`] stands in for the program's own data segment: the
//! `thisenv` pointer and the registered fault handler. Fork hands the child
//! a copy of it, exactly as the child inherits the parent's memory image.

mod fork;
mod ipc;
mod pgfault;

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use log::{debug, error};

use crate::env::{EnvId, EnvStatus, EnvView};
use crate::kernel::Exokernel;
use crate::mm::{Perm, VirtAddr};
use crate::syscall::numbers::*;
use crate::syscall::{Error, SysResult};
use crate::trap::{FaultDelivery, UTrapframe};

pub use fork::{cow_fault, Forked};
pub use ipc::IpcMessage;
pub use pgfault::{PgfaultHandler, PGFAULT_UPCALL_ENTRY};

/// A user-level fatal error.
///
/// By the time this exists the environment has already been destroyed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPanic {
    pub env: EnvId,
    pub message: String,
}

impl fmt::Display for UserPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] user panic: {}", self.env, self.message)
    }
}

/// Process-private state copied verbatim into a forked child.
#[derive(Clone, Copy)]
pub struct ProcessLocal {
    /// The environment this program believes it is.
    pub thisenv: EnvId,
    pgfault_handler: Option<PgfaultHandler>,
}

impl fmt::Debug for ProcessLocal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessLocal")
            .field("thisenv", &self.thisenv)
            .field("pgfault_handler", &self.pgfault_handler.is_some())
            .finish()
    }
}

/// Turn a raw syscall return into a result.
fn decode(ret: i32) -> SysResult<i32> {
    if ret < 0 {
        return Err(Error::from_code(ret).unwrap_or(Error::Inval));
    }
    Ok(ret)
}

/// One environment's view of the machine.
pub struct UserEnv<'k> {
    sys: &'k Exokernel,
    /// The environment the CPU is actually running.
    cpu_env: EnvId,
    local: ProcessLocal,
}

impl<'k> UserEnv<'k> {
    /// Start running as `env`, typically one made by `Kernel::env_create`.
    pub fn enter(sys: &'k Exokernel, env: EnvId) -> Self {
        Self {
            sys,
            cpu_env: env,
            local: ProcessLocal {
                thisenv: env,
                pgfault_handler: None,
            },
        }
    }

    /// The kernel this environment traps into.
    pub fn kernel(&self) -> &'k Exokernel {
        self.sys
    }

    /// Process-local `thisenv`.
    pub fn id(&self) -> EnvId {
        self.local.thisenv
    }

    /// Snapshot of `thisenv`'s public fields.
    pub fn thisenv(&self) -> Option<EnvView> {
        self.sys.env_view(self.local.thisenv)
    }

    /// Process-local state, as a forked child would inherit it.
    pub fn local(&self) -> ProcessLocal {
        self.local
    }

    fn syscall(&self, num: u32, args: [u32; 5]) -> SysResult<i32> {
        // no return means this environment is gone
        let ret = self.sys.syscall(self.cpu_env, num, args).ok_or(Error::BadEnv)?;
        decode(ret)
    }

    fn is_self(&self, envid: EnvId) -> bool {
        envid == EnvId::CURRENT || envid == self.cpu_env
    }

    pub fn sys_cputs(&self, buf: VirtAddr, len: usize) -> SysResult<()> {
        self.syscall(SYS_CPUTS, [buf.as_usize() as u32, len as u32, 0, 0, 0])
            .map(drop)
    }

    pub fn sys_cgetc(&self) -> SysResult<i32> {
        self.syscall(SYS_CGETC, [0; 5])
    }

    pub fn sys_getenvid(&self) -> SysResult<EnvId> {
        self.syscall(SYS_GETENVID, [0; 5])
            .map(|raw| EnvId::from_raw(raw as u32))
    }

    /// Destroy `envid`. Destroying the caller itself succeeds without a
    /// return value reaching it.
    pub fn sys_env_destroy(&self, envid: EnvId) -> SysResult<()> {
        let args = [envid.raw(), 0, 0, 0, 0];
        match self.sys.syscall(self.cpu_env, SYS_ENV_DESTROY, args) {
            None if self.is_self(envid) => Ok(()),
            None => Err(Error::BadEnv),
            Some(ret) => decode(ret).map(drop),
        }
    }

    /// Give up the CPU. Fails only once this environment is gone.
    pub fn sys_yield(&self) -> SysResult<()> {
        self.syscall(SYS_YIELD, [0; 5]).map(drop)
    }

    pub fn sys_exofork(&self) -> SysResult<EnvId> {
        self.syscall(SYS_EXOFORK, [0; 5])
            .map(|raw| EnvId::from_raw(raw as u32))
    }

    pub fn sys_env_set_status(&self, envid: EnvId, status: EnvStatus) -> SysResult<()> {
        self.syscall(SYS_ENV_SET_STATUS, [envid.raw(), status as u32, 0, 0, 0])
            .map(drop)
    }

    pub fn sys_env_set_pgfault_upcall(&self, envid: EnvId, func: VirtAddr) -> SysResult<()> {
        self.syscall(
            SYS_ENV_SET_PGFAULT_UPCALL,
            [envid.raw(), func.as_usize() as u32, 0, 0, 0],
        )
        .map(drop)
    }

    pub fn sys_page_alloc(&self, envid: EnvId, va: VirtAddr, perm: Perm) -> SysResult<()> {
        self.syscall(
            SYS_PAGE_ALLOC,
            [envid.raw(), va.as_usize() as u32, perm.bits(), 0, 0],
        )
        .map(drop)
    }

    pub fn sys_page_map(
        &self,
        srcenv: EnvId,
        srcva: VirtAddr,
        dstenv: EnvId,
        dstva: VirtAddr,
        perm: Perm,
    ) -> SysResult<()> {
        self.syscall(
            SYS_PAGE_MAP,
            [
                srcenv.raw(),
                srcva.as_usize() as u32,
                dstenv.raw(),
                dstva.as_usize() as u32,
                perm.bits(),
            ],
        )
        .map(drop)
    }

    pub fn sys_page_unmap(&self, envid: EnvId, va: VirtAddr) -> SysResult<()> {
        self.syscall(SYS_PAGE_UNMAP, [envid.raw(), va.as_usize() as u32, 0, 0, 0])
            .map(drop)
    }

    pub fn sys_ipc_try_send(
        &self,
        envid: EnvId,
        value: u32,
        srcva: VirtAddr,
        perm: Perm,
    ) -> SysResult<()> {
        self.syscall(
            SYS_IPC_TRY_SEND,
            [envid.raw(), value, srcva.as_usize() as u32, perm.bits(), 0],
        )
        .map(drop)
    }

    /// Enter receive. `Ok` means the environment is now blocked.
    pub fn sys_ipc_recv(&self, dstva: VirtAddr) -> SysResult<()> {
        let args = [dstva.as_usize() as u32, 0, 0, 0, 0];
        match self.sys.syscall(self.cpu_env, SYS_IPC_RECV, args) {
            None => Ok(()),
            Some(ret) => decode(ret).map(drop),
        }
    }

    /// Terminate this environment.
    pub fn exit(self) -> SysResult<()> {
        self.sys_env_destroy(EnvId::CURRENT)
    }

    /// Log `message`, destroy this environment and produce the panic value.
    pub fn panic(&self, message: impl Into<String>) -> UserPanic {
        let report = UserPanic {
            env: self.cpu_env,
            message: message.into(),
        };
        error!("{}", report);
        if let Err(e) = self.sys_env_destroy(EnvId::CURRENT) {
            debug!("[{}] already gone: {}", self.cpu_env, e);
        }
        report
    }

    fn fatal(&self, what: &str, e: Error) -> UserPanic {
        self.panic(alloc::format!("{}: {}", what, e))
    }

    /// Load `buf.len()` bytes from `va`, taking page faults as they come.
    pub fn read(&mut self, va: VirtAddr, buf: &mut [u8]) -> Result<(), UserPanic> {
        self.access(va, |sys, env| sys.user_read(env, va, buf))
    }

    /// Store `data` at `va`, taking page faults as they come.
    pub fn write(&mut self, va: VirtAddr, data: &[u8]) -> Result<(), UserPanic> {
        self.access(va, |sys, env| sys.user_write(env, va, data))
    }

    pub fn read_u32(&mut self, va: VirtAddr) -> Result<u32, UserPanic> {
        let mut raw = [0u8; 4];
        self.read(va, &mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    pub fn write_u32(&mut self, va: VirtAddr, value: u32) -> Result<(), UserPanic> {
        self.write(va, &value.to_le_bytes())
    }

    /// Run one memory access; each fault is handed to the upcall and the
    /// access retried. A page that faults again after its handler ran is
    /// fatal.
    fn access(
        &mut self,
        va: VirtAddr,
        mut op: impl FnMut(&Exokernel, EnvId) -> Result<(), FaultDelivery>,
    ) -> Result<(), UserPanic> {
        let mut handled: Vec<VirtAddr> = Vec::new();
        loop {
            match op(self.sys, self.cpu_env) {
                Ok(()) => return Ok(()),
                Err(FaultDelivery::Killed) => {
                    return Err(UserPanic {
                        env: self.cpu_env,
                        message: alloc::format!("killed by page fault near {}", va),
                    })
                }
                Err(FaultDelivery::Upcall { entry, frame }) => {
                    let page = self.run_upcall(entry, frame, &handled)?;
                    handled.push(page);
                }
            }
        }
    }

    /// The upcall trampoline: decode the record, call the handler, restore
    /// the trap-time registers.
    ///
    /// Returns the page the handler resolved. A fault on a page in
    /// `handled` is not handed to the handler again.
    fn run_upcall(
        &mut self,
        entry: VirtAddr,
        frame: VirtAddr,
        handled: &[VirtAddr],
    ) -> Result<VirtAddr, UserPanic> {
        if entry != PGFAULT_UPCALL_ENTRY {
            return Err(self.panic(alloc::format!("upcall to unknown entry {}", entry)));
        }
        let mut raw = [0u8; UTrapframe::SIZE];
        if self.sys.user_read(self.cpu_env, frame, &mut raw).is_err() {
            return Err(self.panic("exception stack unreadable"));
        }
        let Some(utf) = UTrapframe::decode(&raw) else {
            return Err(self.panic("corrupt fault record"));
        };
        let page = utf.fault_va.align_down();
        if handled.contains(&page) {
            return Err(self.panic(alloc::format!("unresolved page fault at {}", utf.fault_va)));
        }
        let Some(handler) = self.local.pgfault_handler else {
            return Err(self.panic("page fault with no handler installed"));
        };

        handler(self, &utf)?;

        let restored = self.sys.lock().upcall_return(self.cpu_env);
        restored.map_err(|e| self.fatal("upcall return", e))?;
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Kernel;
    use crate::mm::PAGE_SIZE;

    fn boot() -> (Exokernel, EnvId) {
        let mut k = Kernel::with_defaults();
        let id = k.env_create().unwrap();
        (Exokernel::new(k), id)
    }

    fn demand_zero(env: &mut UserEnv<'_>, utf: &UTrapframe) -> Result<(), UserPanic> {
        env.sys_page_alloc(EnvId::CURRENT, utf.fault_va.align_down(), Perm::USER_RW)
            .map_err(|e| env.fatal("demand_zero", e))
    }

    #[test]
    fn self_destroy_succeeds() {
        let (sys, id) = boot();
        let env = UserEnv::enter(&sys, id);
        assert_eq!(env.sys_env_destroy(EnvId::CURRENT), Ok(()));
        assert!(sys.env_view(id).is_none());
    }

    #[test]
    fn destroy_by_own_handle_succeeds() {
        let (sys, id) = boot();
        assert_eq!(UserEnv::enter(&sys, id).exit(), Ok(()));
        assert!(sys.env_view(id).is_none());
    }

    #[test]
    fn yield_after_destruction_fails() {
        let (sys, id) = boot();
        let env = UserEnv::enter(&sys, id);
        assert_eq!(env.sys_yield(), Ok(()));
        sys.lock().env_destroy(id);
        assert_eq!(env.sys_yield(), Err(Error::BadEnv));
    }

    #[test]
    fn access_straddling_two_missing_pages_faults_twice() {
        let (sys, id) = boot();
        let mut env = UserEnv::enter(&sys, id);
        env.set_pgfault_handler(demand_zero).unwrap();

        let va = VirtAddr::new(0x2000 - 4);
        env.write(va, b"ABCDEFGH").unwrap();
        assert!(sys.uvpt(id, VirtAddr::new(0x1000)).is_some());
        assert!(sys.uvpt(id, VirtAddr::new(0x2000)).is_some());
        let mut buf = [0u8; 8];
        env.read(va, &mut buf).unwrap();
        assert_eq!(&buf, b"ABCDEFGH");
    }

    #[test]
    fn page_faulting_again_after_handler_is_fatal() {
        fn ignore(_: &mut UserEnv<'_>, _: &UTrapframe) -> Result<(), UserPanic> {
            Ok(())
        }
        let (sys, id) = boot();
        let mut env = UserEnv::enter(&sys, id);
        env.set_pgfault_handler(ignore).unwrap();

        let err = env.write(VirtAddr::new(3 * PAGE_SIZE), b"x").unwrap_err();
        assert!(err.message.contains("unresolved page fault"), "{}", err);
        assert!(sys.env_view(id).is_none());
    }
}
