//! Exokern - an exokernel system call boundary
//!
//! The kernel exports raw resources (environments, page mappings, one-word
//! messages) and leaves policy to user code. Process creation is built on
//! top of it in user space as copy-on-write fork.
//!
//! # Layers
//! - `mm`: frames, permissions, per-environment address spaces
//! - `env`: the environment directory and generation-checked handles
//! - `syscall`: validation, dispatch, IPC rendezvous
//! - `trap`: syscall entry/exit and page-fault upcalls
//! - `ulib`: user-level library (fork, page-fault handling, IPC helpers)
//!
//! # Concurrency
//! All kernel state sits behind the single lock in [`Exokernel`]. A system
//! call runs to completion while holding it, which is what makes an IPC
//! send and a fork's paired remapping indivisible.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

extern crate alloc;

pub mod console;
pub mod env;
pub mod kernel;
pub mod mm;
pub mod sched;
pub mod syscall;
pub mod trap;
pub mod ulib;

pub use console::{BufferConsole, Console, NullConsole};
pub use env::{EnvId, EnvStatus, EnvView, IpcState};
pub use kernel::{ConfigError, Exokernel, Kernel, KernelConfig};
pub use mm::{Perm, VirtAddr};
pub use syscall::{Error, SysResult};
pub use trap::{FaultDelivery, FaultFlags, TrapFrame, UTrapframe};
