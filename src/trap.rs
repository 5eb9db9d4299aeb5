//! Trap Entry and Page-Fault Upcalls
//!
//! Every entry into the kernel goes through here: system calls (`svc`) and
//! user page faults. Register state is saved in the environment's
//! [`TrapFrame`] on entry and written back on exit.
//!
//! # Register Convention
//! - x8: system call number
//! - x0-x4: arguments
//! - x0: return value
//!
//! # Page Faults
//! The kernel never resolves user faults itself. If the environment has
//! registered an upcall, a [`UTrapframe`] is pushed onto its exception
//! stack and execution resumes at the upcall. Otherwise the environment
//! is destroyed.

use bitflags::bitflags;
use log::{debug, warn};

use crate::env::{EnvId, EnvStatus};
use crate::kernel::Kernel;
use crate::mm::{VirtAddr, PAGE_SIZE, UXSTACKTOP};
use crate::syscall::{Error, SysResult};

/// Register carrying the system call number.
pub const REG_SYSNO: usize = 8;
/// Register carrying the return value.
pub const REG_RET: usize = 0;

/// Saved user register state
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrapFrame {
    /// General purpose registers x0-x30
    pub gpr: [u64; 31],
    /// Resume address
    pub pc: u64,
    /// Saved program status
    pub pstate: u64,
    /// User stack pointer
    pub sp: u64,
}

impl TrapFrame {
    /// Zeroed frame for a fresh environment.
    pub const fn user_entry() -> Self {
        Self {
            gpr: [0; 31],
            pc: 0,
            pstate: 0,
            sp: 0,
        }
    }

    /// Load a system call into the argument registers.
    pub fn load_syscall(&mut self, num: u32, args: [u32; 5]) {
        self.gpr[REG_SYSNO] = u64::from(num);
        for (reg, arg) in self.gpr.iter_mut().zip(args) {
            *reg = u64::from(arg);
        }
    }

    /// Store a system call result in x0, sign-extended.
    pub fn set_return(&mut self, ret: i32) {
        self.gpr[REG_RET] = i64::from(ret) as u64;
    }

    /// The system call result held in x0.
    pub fn return_value(&self) -> i32 {
        self.gpr[REG_RET] as i64 as i32
    }
}

bitflags! {
    /// Page fault error code.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct FaultFlags: u32 {
        /// Fault on a present page (protection violation)
        const PROTECTION = 1 << 0;
        /// Faulting access was a write
        const WRITE = 1 << 1;
        /// Fault taken from user mode
        const USER = 1 << 2;
    }
}

/// Fault record handed to the user page-fault handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UTrapframe {
    /// Faulting address
    pub fault_va: VirtAddr,
    /// Error code
    pub err: FaultFlags,
    /// Trap-time registers
    pub regs: TrapFrame,
}

impl UTrapframe {
    const WORDS: usize = 2 + 31 + 3;
    /// Bytes occupied on the exception stack.
    pub const SIZE: usize = Self::WORDS * 8;

    /// Serialize as little-endian 64-bit words.
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut words = [0u64; Self::WORDS];
        words[0] = self.fault_va.as_usize() as u64;
        words[1] = u64::from(self.err.bits());
        words[2..33].copy_from_slice(&self.regs.gpr);
        words[33] = self.regs.pc;
        words[34] = self.regs.pstate;
        words[35] = self.regs.sp;

        let mut out = [0u8; Self::SIZE];
        for (chunk, word) in out.chunks_exact_mut(8).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    /// Parse a record; `None` if `bytes` is too short.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let bytes = bytes.get(..Self::SIZE)?;
        let mut words = [0u64; Self::WORDS];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            *word = u64::from_le_bytes(raw);
        }

        let mut regs = TrapFrame::user_entry();
        regs.gpr.copy_from_slice(&words[2..33]);
        regs.pc = words[33];
        regs.pstate = words[34];
        regs.sp = words[35];
        Some(Self {
            fault_va: VirtAddr::new(words[0] as usize),
            err: FaultFlags::from_bits_truncate(words[1] as u32),
            regs,
        })
    }
}

/// Outcome of a user page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultDelivery {
    /// Execution continues at `entry` with the record at `frame`.
    Upcall { entry: VirtAddr, frame: VirtAddr },
    /// No usable handler; the environment was destroyed.
    Killed,
}

impl Kernel {
    /// System call trap from `caller`.
    ///
    /// Returns the value placed in x0, or `None` when control does not
    /// return to the caller: it blocked in receive, destroyed itself, or
    /// was already gone.
    pub fn trap_syscall(&mut self, caller: EnvId, num: u32, args: [u32; 5]) -> Option<i32> {
        let env = self.envs.get_mut(caller)?;
        if env.status == EnvStatus::Dying {
            self.env_free(caller);
            return None;
        }
        env.tf.load_syscall(num, args);
        self.curenv = Some(caller);

        let outcome = self.dispatch(num, args);
        self.trap_exit(caller, outcome)
    }

    fn trap_exit(&mut self, caller: EnvId, outcome: Option<i32>) -> Option<i32> {
        let env = self.envs.get_mut(caller)?;
        if env.status == EnvStatus::Dying {
            self.env_free(caller);
            return None;
        }
        let ret = outcome?;
        env.tf.set_return(ret);
        Some(ret)
    }

    /// Deliver a user page fault at `fault_va` in `id`.
    pub fn page_fault(&mut self, id: EnvId, fault_va: VirtAddr, err: FaultFlags) -> FaultDelivery {
        let Some(env) = self.envs.get(id) else {
            return FaultDelivery::Killed;
        };
        let Some(entry) = env.pgfault_upcall else {
            warn!(
                "[{}] user fault va {} ip {:#010x} err {:?}",
                id, fault_va, env.tf.pc, err
            );
            self.env_free(id);
            return FaultDelivery::Killed;
        };

        let sp = env.tf.sp as usize;
        let xstack = UXSTACKTOP - PAGE_SIZE;
        // A fault inside the handler stacks below the current record,
        // leaving one scratch word.
        let top = if (xstack..UXSTACKTOP).contains(&sp) {
            sp - 8
        } else {
            UXSTACKTOP
        };
        let frame = match top.checked_sub(UTrapframe::SIZE) {
            Some(frame) if frame >= xstack => VirtAddr::new(frame),
            _ => {
                warn!("[{}] exception stack overflow at {:#010x}", id, sp);
                self.env_free(id);
                return FaultDelivery::Killed;
            }
        };

        let record = UTrapframe {
            fault_va,
            err,
            regs: env.tf,
        };
        if let Err(bad) = self.copy_out(id, frame, &record.encode()) {
            warn!("[{}] exception stack not writable at {}", id, bad);
            self.env_free(id);
            return FaultDelivery::Killed;
        }

        if let Some(env) = self.envs.get_mut(id) {
            env.tf.sp = frame.as_usize() as u64;
            env.tf.pc = entry.as_usize() as u64;
        }
        debug!("[{}] page fault at {} -> upcall {}", id, fault_va, entry);
        FaultDelivery::Upcall { entry, frame }
    }

    /// Return from a page-fault upcall: restore the trap-time registers
    /// saved in the record at the current stack pointer.
    pub fn upcall_return(&mut self, id: EnvId) -> SysResult<UTrapframe> {
        let sp = self.envs.get(id).ok_or(Error::BadEnv)?.tf.sp as usize;
        let mut raw = [0u8; UTrapframe::SIZE];
        self.copy_in(id, VirtAddr::new(sp), &mut raw)
            .map_err(|_| Error::Fault)?;
        let record = UTrapframe::decode(&raw).ok_or(Error::Fault)?;

        let env = self.envs.get_mut(id).ok_or(Error::BadEnv)?;
        env.tf = record.regs;
        Ok(record)
    }
}
