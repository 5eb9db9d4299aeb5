//! IPC Rendezvous
//!
//! One word of payload plus, optionally, one page mapping.
//!
//! ```text
//!   idle ──recv──▶ blocked (recving, dstva) ──try_send──▶ runnable (from, value, perm)
//! ```
//!
//! The receiver blocks; the sender never does. A send that finds the
//! target not blocked fails with `IpcNotRecv` and the sender retries.
//! Checking and clearing `recving` happens in one handler under the
//! kernel lock, so at most one sender completes a given receive.

use log::debug;

use super::error::{Error, SysResult};
use super::validate::check_perm;
use crate::env::{EnvId, EnvStatus};
use crate::kernel::Kernel;
use crate::mm::{Perm, VirtAddr};

impl Kernel {
    /// Try to deliver `value`, and the page at `srcva` if below the
    /// ceiling, to `envid`
    ///
    /// # Security Checks
    /// 1. Target handle resolves (any environment may signal any other)
    /// 2. Target is blocked in receive
    /// 3. If a page is offered: `srcva` is aligned, `perm` is valid,
    ///    `srcva` is mapped in the caller, and WRITABLE is only granted
    ///    over a writable mapping
    ///
    /// The page is transferred only if the receiver asked for one. A
    /// failed insert aborts the send without touching the receiver.
    pub fn sys_ipc_try_send(
        &mut self,
        envid: EnvId,
        value: u32,
        srcva: VirtAddr,
        perm: u32,
    ) -> SysResult<()> {
        let cur = self.curenv.ok_or(Error::BadEnv)?;
        let target = self.envs.resolve(envid, self.curenv, false)?;
        let dst = self.envs.get(target).ok_or(Error::BadEnv)?;
        if !dst.ipc.recving {
            return Err(Error::IpcNotRecv);
        }
        let dstva = dst.ipc.dstva;

        let offered = if srcva.is_user() {
            if !srcva.is_aligned() {
                return Err(Error::Inval);
            }
            let perm = check_perm(perm)?;
            let (frame, src_perm) = self
                .envs
                .get(cur)
                .and_then(|env| env.space.lookup(srcva))
                .ok_or(Error::Inval)?;
            if perm.contains(Perm::WRITABLE) && !src_perm.contains(Perm::WRITABLE) {
                return Err(Error::Inval);
            }
            Some((frame, perm))
        } else {
            None
        };

        let env = self.envs.get_mut(target).ok_or(Error::BadEnv)?;
        let transferred = match (offered, dstva) {
            (Some((frame, perm)), Some(dstva)) => {
                env.space.insert(&mut self.frames, frame, dstva, perm)?;
                perm
            }
            _ => Perm::empty(),
        };

        env.ipc.recving = false;
        env.ipc.from = cur;
        env.ipc.value = value;
        env.ipc.perm = transferred;
        env.tf.set_return(0);
        env.status = EnvStatus::Runnable;
        debug!(
            "[{}] ipc send {:#x} to {} (perm {:?})",
            cur, value, target, transferred
        );
        Ok(())
    }

    /// Block until a message arrives, accepting a page at `dstva` if it is
    /// below the ceiling
    ///
    /// Returns synchronously only on error; success resumes the caller
    /// later with x0 cleared by the sender.
    pub fn sys_ipc_recv(&mut self, dstva: VirtAddr) -> SysResult<()> {
        let cur = self.curenv.ok_or(Error::BadEnv)?;
        let dstva = if dstva.is_user() {
            if !dstva.is_aligned() {
                return Err(Error::Inval);
            }
            Some(dstva)
        } else {
            None
        };

        let env = self.envs.get_mut(cur).ok_or(Error::BadEnv)?;
        env.ipc.recving = true;
        env.ipc.dstva = dstva;
        env.status = EnvStatus::NotRunnable;
        debug!("[{}] ipc recv (dstva {:?})", cur, dstva);
        self.sched_yield();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KernelConfig;
    use crate::mm::UTOP;
    use crate::syscall::numbers::{SYS_IPC_RECV, SYS_IPC_TRY_SEND};

    fn boot() -> (Kernel, EnvId, EnvId) {
        let mut k = Kernel::with_defaults();
        let receiver = k.env_create().unwrap();
        let sender = k.env_create().unwrap();
        (k, receiver, sender)
    }

    fn mapping_count(k: &Kernel, id: EnvId) -> usize {
        k.envs.get(id).unwrap().space.mappings().count()
    }

    fn send(k: &mut Kernel, from: EnvId, to: EnvId, value: u32, srcva: usize, perm: u32) -> i32 {
        k.trap_syscall(from, SYS_IPC_TRY_SEND, [to.raw(), value, srcva as u32, perm, 0])
            .unwrap()
    }

    #[test]
    fn send_to_idle_target_changes_nothing() {
        let (mut k, receiver, sender) = boot();
        let before = k.env_view(receiver).unwrap();
        assert_eq!(
            send(&mut k, sender, receiver, 1, UTOP, 0),
            Error::IpcNotRecv.code()
        );
        assert_eq!(k.env_view(receiver).unwrap(), before);
    }

    #[test]
    fn recv_blocks_and_send_resumes() {
        let (mut k, receiver, sender) = boot();
        assert_eq!(k.trap_syscall(receiver, SYS_IPC_RECV, [UTOP as u32, 0, 0, 0, 0]), None);
        let view = k.env_view(receiver).unwrap();
        assert!(view.ipc.recving);
        assert_eq!(view.status, EnvStatus::NotRunnable);
        assert_eq!(view.ipc.dstva, None);

        assert_eq!(send(&mut k, sender, receiver, 42, UTOP, 0), 0);
        let view = k.env_view(receiver).unwrap();
        assert!(!view.ipc.recving);
        assert_eq!(view.ipc.from, sender);
        assert_eq!(view.ipc.value, 42);
        assert_eq!(view.ipc.perm, Perm::empty());
        assert_eq!(view.status, EnvStatus::Runnable);
        assert_eq!(k.trapframe(receiver).unwrap().return_value(), 0);

        // rendezvous consumed
        assert_eq!(
            send(&mut k, sender, receiver, 43, UTOP, 0),
            Error::IpcNotRecv.code()
        );
    }

    #[test]
    fn misaligned_recv_returns_immediately() {
        let (mut k, receiver, _) = boot();
        assert_eq!(
            k.trap_syscall(receiver, SYS_IPC_RECV, [0x2004, 0, 0, 0, 0]),
            Some(Error::Inval.code())
        );
        assert!(!k.env_view(receiver).unwrap().ipc.recving);
        assert_eq!(k.env_status(receiver), EnvStatus::Runnable);
    }

    #[test]
    fn page_transfer_shares_frame() {
        let (mut k, receiver, sender) = boot();
        k.curenv = Some(sender);
        k.sys_page_alloc(sender, VirtAddr::new(0x3000), 0x5).unwrap();
        let frame = k.uvpt(sender, VirtAddr::new(0x3000)).unwrap().frame();

        k.trap_syscall(receiver, SYS_IPC_RECV, [0x2000, 0, 0, 0, 0]);
        assert_eq!(send(&mut k, sender, receiver, 42, 0x3000, 0x5), 0);

        let view = k.env_view(receiver).unwrap();
        assert_eq!(view.ipc.perm, Perm::REQUIRED);
        let pte = k.uvpt(receiver, VirtAddr::new(0x2000)).unwrap();
        assert_eq!(pte.frame(), frame);
        assert_eq!(k.frame_refs(frame), 2);
    }

    #[test]
    fn no_transfer_when_receiver_declined_page() {
        let (mut k, receiver, sender) = boot();
        k.curenv = Some(sender);
        k.sys_page_alloc(sender, VirtAddr::new(0x3000), 0x7).unwrap();
        let frame = k.uvpt(sender, VirtAddr::new(0x3000)).unwrap().frame();
        let mapped_before = mapping_count(&k, receiver);

        k.trap_syscall(receiver, SYS_IPC_RECV, [UTOP as u32, 0, 0, 0, 0]);
        assert_eq!(send(&mut k, sender, receiver, 7, 0x3000, 0x7), 0);

        assert_eq!(k.env_view(receiver).unwrap().ipc.perm, Perm::empty());
        assert_eq!(k.frame_refs(frame), 1);
        assert_eq!(mapping_count(&k, receiver), mapped_before);
    }

    #[test]
    fn send_checks_source_page() {
        let (mut k, receiver, sender) = boot();
        k.curenv = Some(sender);
        k.sys_page_alloc(sender, VirtAddr::new(0x3000), 0x5).unwrap();
        k.trap_syscall(receiver, SYS_IPC_RECV, [0x2000, 0, 0, 0, 0]);

        let inval = Error::Inval.code();
        assert_eq!(send(&mut k, sender, receiver, 1, 0x3004, 0x5), inval);
        assert_eq!(send(&mut k, sender, receiver, 1, 0x3000, 0x4), inval);
        assert_eq!(send(&mut k, sender, receiver, 1, 0x4000, 0x5), inval);
        assert_eq!(send(&mut k, sender, receiver, 1, 0x3000, 0x7), inval);
        assert!(k.env_view(receiver).unwrap().ipc.recving);
    }

    #[test]
    fn send_to_stale_handle() {
        let (mut k, receiver, sender) = boot();
        k.env_free(receiver);
        assert_eq!(send(&mut k, sender, receiver, 1, UTOP, 0), Error::BadEnv.code());
    }

    #[test]
    fn out_of_memory_aborts_send_without_state_change() {
        let mut k = Kernel::new(
            KernelConfig {
                frames: 7,
                env_slots: 2,
            },
            alloc::boxed::Box::new(crate::console::NullConsole),
        )
        .unwrap();
        // three frames per environment
        let receiver = k.env_create().unwrap();
        let sender = k.env_create().unwrap();
        k.curenv = Some(sender);
        let stack = crate::mm::USTACKTOP - crate::mm::PAGE_SIZE;

        k.trap_syscall(receiver, SYS_IPC_RECV, [0x2000, 0, 0, 0, 0]);
        let frame = k.uvpt(sender, VirtAddr::new(stack)).unwrap().frame();
        assert_eq!(k.free_frames(), 1);
        // eat the last frame so the receiver's table node cannot be allocated
        k.sys_page_alloc(sender, VirtAddr::new(stack - crate::mm::PAGE_SIZE), 0x7)
            .unwrap();
        assert_eq!(k.free_frames(), 0);

        let before = k.env_view(receiver).unwrap();
        assert_eq!(
            send(&mut k, sender, receiver, 9, stack, 0x7),
            Error::NoMem.code()
        );
        assert_eq!(k.env_view(receiver).unwrap(), before);
        assert_eq!(k.frame_refs(frame), 1);
    }
}
