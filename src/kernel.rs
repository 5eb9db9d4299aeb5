//! Kernel State
//!
//! [`Kernel`] owns every piece of kernel state: the frame table, the
//! environment directory, the current environment and the console.
//! [`Exokernel`] wraps it in a single lock so that every trap runs to
//! completion before the next one starts.

use alloc::boxed::Box;
use core::fmt;

use log::{debug, info};
use spin::{Mutex, MutexGuard};

use crate::console::{Console, NullConsole};
use crate::env::{EnvId, EnvStatus, EnvTable, EnvView, NENV};
use crate::mm::{
    AllocFlags, FrameId, FrameTable, PageTableEntry, MAX_FRAMES, Perm, VirtAddr, PAGE_SIZE, USTACKTOP, UTEXT,
};
use crate::syscall::{Error, SysResult};
use crate::trap::{FaultDelivery, FaultFlags, TrapFrame};

/// Boot-time sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Physical frames under management, at most [`MAX_FRAMES`].
    pub frames: usize,
    /// Environment directory slots, clamped to [`NENV`].
    pub env_slots: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl KernelConfig {
    /// 4096 frames and a full environment directory.
    pub const DEFAULT: Self = Self {
        frames: 4096,
        env_slots: NENV,
    };

    /// Reject configurations the kernel cannot boot with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frames == 0 {
            return Err(ConfigError::NoFrames);
        }
        if self.frames > MAX_FRAMES {
            return Err(ConfigError::TooManyFrames(self.frames));
        }
        if self.env_slots == 0 {
            return Err(ConfigError::NoEnvSlots);
        }
        Ok(())
    }
}

/// Invalid [`KernelConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    NoFrames,
    /// More frames than a page table entry can address.
    TooManyFrames(usize),
    NoEnvSlots,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoFrames => write!(f, "frame pool must not be empty"),
            Self::TooManyFrames(n) => {
                write!(f, "{} frames exceed the addressable {}", n, MAX_FRAMES)
            }
            Self::NoEnvSlots => write!(f, "environment directory must not be empty"),
        }
    }
}

/// All kernel state.
pub struct Kernel {
    pub(crate) envs: EnvTable,
    pub(crate) frames: FrameTable,
    pub(crate) curenv: Option<EnvId>,
    pub(crate) console: Box<dyn Console + Send>,
}

impl Kernel {
    /// Boot a kernel with the given sizing and console.
    pub fn new(config: KernelConfig, console: Box<dyn Console + Send>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::boot(config, console))
    }

    /// Boot with the default sizing and a console that discards output.
    pub fn with_defaults() -> Self {
        Self::boot(KernelConfig::DEFAULT, Box::new(NullConsole))
    }

    /// Build the kernel from an already validated config.
    fn boot(config: KernelConfig, console: Box<dyn Console + Send>) -> Self {
        let envs = EnvTable::new(config.env_slots);
        info!(
            "kernel up: {} frames, {} env slots",
            config.frames,
            envs.capacity()
        );
        Self {
            envs,
            frames: FrameTable::new(config.frames),
            curenv: None,
            console,
        }
    }

    /// Create a parentless RUNNABLE environment with a one-page stack.
    pub fn env_create(&mut self) -> SysResult<EnvId> {
        let id = self.envs.alloc(&mut self.frames, EnvId::CURRENT)?;
        let stack = VirtAddr::new(USTACKTOP - PAGE_SIZE);

        if let Err(e) = self.map_fresh_page(id, stack, Perm::USER_RW) {
            self.envs.free(&mut self.frames, id);
            return Err(e);
        }

        if let Some(env) = self.envs.get_mut(id) {
            env.tf.pc = UTEXT as u64;
            env.tf.sp = USTACKTOP as u64;
            env.status = EnvStatus::Runnable;
        }
        info!("[{}] new env", id);
        Ok(id)
    }

    /// Map a fresh zeroed frame at `va` in `id`.
    ///
    /// On failure the frame goes back to the pool and nothing changes.
    pub(crate) fn map_fresh_page(&mut self, id: EnvId, va: VirtAddr, perm: Perm) -> SysResult<()> {
        let frame = self.frames.alloc(AllocFlags::ZERO)?;
        let Some(env) = self.envs.get_mut(id) else {
            self.frames.free_unreferenced(frame);
            return Err(Error::BadEnv);
        };
        if let Err(e) = env.space.insert(&mut self.frames, frame, va, perm) {
            self.frames.free_unreferenced(frame);
            return Err(e.into());
        }
        Ok(())
    }

    /// Destroy `id`.
    ///
    /// The environment currently in a trap is only marked DYING and is
    /// freed on the way out; any other is freed immediately.
    pub fn env_destroy(&mut self, id: EnvId) {
        if self.curenv == Some(id) {
            if let Some(env) = self.envs.get_mut(id) {
                env.status = EnvStatus::Dying;
                debug!("[{}] marked dying", id);
            }
        } else {
            self.env_free(id);
        }
    }

    /// Release `id` and everything it maps.
    pub(crate) fn env_free(&mut self, id: EnvId) {
        let parent = self.envs.get(id).map(|env| env.parent_id);
        if self.envs.free(&mut self.frames, id) {
            info!("[{}] free env (parent {})", id, parent.unwrap_or_default());
        }
        if self.curenv == Some(id) {
            self.curenv = None;
        }
    }

    /// The environment that most recently trapped or was scheduled.
    pub fn curenv(&self) -> Option<EnvId> {
        self.curenv
    }

    /// Snapshot of an environment's public fields.
    pub fn env_view(&self, id: EnvId) -> Option<EnvView> {
        self.envs.get(id).map(|env| env.view())
    }

    /// Status of `id`; destroyed or unknown handles read as FREE.
    pub fn env_status(&self, id: EnvId) -> EnvStatus {
        self.envs.status(id)
    }

    /// Saved registers of `id`.
    pub fn trapframe(&self, id: EnvId) -> Option<TrapFrame> {
        self.envs.get(id).map(|env| env.tf)
    }

    /// Read-only page table view: the entry mapping `va` in `id`.
    pub fn uvpt(&self, id: EnvId, va: VirtAddr) -> Option<PageTableEntry> {
        self.envs
            .get(id)?
            .space
            .entry(va)
            .filter(|pte| pte.is_present())
    }

    /// Read-only page directory view: whether slot `pdx` of `id` has a table.
    pub fn uvpd(&self, id: EnvId, pdx: usize) -> bool {
        self.envs
            .get(id)
            .map_or(false, |env| env.space.has_table(pdx))
    }

    /// Reference count of `frame`.
    pub fn frame_refs(&self, frame: FrameId) -> u32 {
        self.frames.refs(frame)
    }

    /// Frames currently on the free list.
    pub fn free_frames(&self) -> usize {
        self.frames.free_count()
    }

    /// Live environments.
    pub fn live_envs(&self) -> usize {
        self.envs.live()
    }

    /// Check that `[va, va + len)` is mapped in `id` with at least `perm`.
    ///
    /// Returns the first offending address on failure.
    pub(crate) fn user_mem_check(
        &self,
        id: EnvId,
        va: VirtAddr,
        len: usize,
        perm: Perm,
    ) -> Result<(), VirtAddr> {
        let Some(env) = self.envs.get(id) else {
            return Err(va);
        };
        if len == 0 {
            return Ok(());
        }
        let end = va.checked_add(len).ok_or(va)?;
        let mut page = va.align_down();
        while page.as_usize() < end.as_usize() {
            let bad = if page.as_usize() < va.as_usize() { va } else { page };
            match env.space.lookup(page) {
                Some((_, p)) if p.contains(perm) && page.is_user() => {}
                _ => return Err(bad),
            }
            page = page.checked_add(PAGE_SIZE).ok_or(bad)?;
        }
        Ok(())
    }

    /// Copy user memory of `id` into `buf`, without fault delivery.
    pub(crate) fn copy_in(&self, id: EnvId, va: VirtAddr, buf: &mut [u8]) -> Result<(), VirtAddr> {
        self.user_mem_check(id, va, buf.len(), Perm::REQUIRED)?;
        let Some(env) = self.envs.get(id) else {
            return Err(va);
        };
        let mut done = 0;
        while done < buf.len() {
            let at = VirtAddr::new(va.as_usize() + done);
            let (frame, _) = env.space.lookup(at).ok_or(at)?;
            let offset = at.page_offset();
            let n = (PAGE_SIZE - offset).min(buf.len() - done);
            buf[done..done + n].copy_from_slice(&self.frames.bytes(frame)[offset..offset + n]);
            done += n;
        }
        Ok(())
    }

    /// Copy `data` into user memory of `id`, without fault delivery.
    pub(crate) fn copy_out(&mut self, id: EnvId, va: VirtAddr, data: &[u8]) -> Result<(), VirtAddr> {
        self.user_mem_check(id, va, data.len(), Perm::USER_RW)?;
        let Some(env) = self.envs.get(id) else {
            return Err(va);
        };
        let mut done = 0;
        while done < data.len() {
            let at = VirtAddr::new(va.as_usize() + done);
            let (frame, _) = env.space.lookup(at).ok_or(at)?;
            let offset = at.page_offset();
            let n = (PAGE_SIZE - offset).min(data.len() - done);
            self.frames.bytes_mut(frame)[offset..offset + n]
                .copy_from_slice(&data[done..done + n]);
            done += n;
        }
        Ok(())
    }

    /// A user-mode load by `id`. An access violation is delivered as a
    /// page fault and the outcome returned.
    pub fn user_read(&mut self, id: EnvId, va: VirtAddr, buf: &mut [u8]) -> Result<(), FaultDelivery> {
        match self.copy_in(id, va, buf) {
            Ok(()) => Ok(()),
            Err(bad) => {
                let mut err = FaultFlags::USER;
                if self.uvpt(id, bad).is_some() {
                    err |= FaultFlags::PROTECTION;
                }
                Err(self.page_fault(id, bad, err))
            }
        }
    }

    /// A user-mode store by `id`. An access violation is delivered as a
    /// page fault and the outcome returned.
    pub fn user_write(&mut self, id: EnvId, va: VirtAddr, data: &[u8]) -> Result<(), FaultDelivery> {
        match self.copy_out(id, va, data) {
            Ok(()) => Ok(()),
            Err(bad) => {
                let mut err = FaultFlags::USER | FaultFlags::WRITE;
                if self.uvpt(id, bad).is_some() {
                    err |= FaultFlags::PROTECTION;
                }
                Err(self.page_fault(id, bad, err))
            }
        }
    }
}

/// The kernel behind its big lock.
pub struct Exokernel {
    inner: Mutex<Kernel>,
}

impl Exokernel {
    pub fn new(kernel: Kernel) -> Self {
        Self {
            inner: Mutex::new(kernel),
        }
    }

    /// Take the kernel lock.
    pub fn lock(&self) -> MutexGuard<'_, Kernel> {
        self.inner.lock()
    }

    /// Trap into the kernel with a system call from `caller`.
    pub fn syscall(&self, caller: EnvId, num: u32, args: [u32; 5]) -> Option<i32> {
        self.lock().trap_syscall(caller, num, args)
    }

    pub fn env_view(&self, id: EnvId) -> Option<EnvView> {
        self.lock().env_view(id)
    }

    pub fn uvpt(&self, id: EnvId, va: VirtAddr) -> Option<PageTableEntry> {
        self.lock().uvpt(id, va)
    }

    pub fn uvpd(&self, id: EnvId, pdx: usize) -> bool {
        self.lock().uvpd(id, pdx)
    }

    pub fn user_read(&self, id: EnvId, va: VirtAddr, buf: &mut [u8]) -> Result<(), FaultDelivery> {
        self.lock().user_read(id, va, buf)
    }

    pub fn user_write(&self, id: EnvId, va: VirtAddr, data: &[u8]) -> Result<(), FaultDelivery> {
        self.lock().user_write(id, va, data)
    }

    pub fn into_inner(self) -> Kernel {
        self.inner.into_inner()
    }
}
