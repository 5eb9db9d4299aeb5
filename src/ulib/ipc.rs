//! Blocking IPC on top of the rendezvous primitives.

use super::{UserEnv, UserPanic};
use crate::env::EnvId;
use crate::mm::{Perm, VirtAddr};
use crate::syscall::{Error, SysResult};

/// A delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcMessage {
    pub from: EnvId,
    pub value: u32,
    /// Permissions of the page received, empty if none was.
    pub perm: Perm,
}

impl UserEnv<'_> {
    /// Receive one message, accepting a page at `pg` if given.
    ///
    /// Blocks until some environment sends to this one.
    pub fn ipc_recv(&mut self, pg: Option<VirtAddr>) -> SysResult<IpcMessage> {
        self.sys_ipc_recv(pg.unwrap_or(VirtAddr::CEILING))?;
        loop {
            let view = self.thisenv().ok_or(Error::BadEnv)?;
            if !view.ipc.recving {
                return Ok(IpcMessage {
                    from: view.ipc.from,
                    value: view.ipc.value,
                    perm: view.ipc.perm,
                });
            }
            core::hint::spin_loop();
        }
    }

    /// Send `value`, and the page at `pg` with `perm` if given, to `to`.
    ///
    /// Retries until the target is receiving. Any other failure is fatal.
    pub fn ipc_send(
        &mut self,
        to: EnvId,
        value: u32,
        pg: Option<VirtAddr>,
        perm: Perm,
    ) -> Result<(), UserPanic> {
        let srcva = pg.unwrap_or(VirtAddr::CEILING);
        loop {
            match self.sys_ipc_try_send(to, value, srcva, perm) {
                Ok(()) => return Ok(()),
                Err(Error::IpcNotRecv) => self
                    .sys_yield()
                    .map_err(|e| self.fatal("ipc_send: sys_yield", e))?,
                Err(e) => return Err(self.fatal("ipc_send", e)),
            }
        }
    }
}
