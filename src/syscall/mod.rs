//! System Call Interface
//!
//! The only way an environment can affect anything outside its own
//! registers.
//!
//! # Security Model
//! - Whitelist approach: unknown numbers are rejected with `Inval`
//! - Every address and permission argument is validated before use
//! - A handler either fully succeeds or leaves no trace
//! - Handlers run under the kernel lock, so each is indivisible
//!
//! # Syscalls
//! - 0: cputs(buf, len)
//! - 1: cgetc()
//! - 2: getenvid()
//! - 3: env_destroy(envid)
//! - 4: page_alloc(envid, va, perm)
//! - 5: page_map(srcenv, srcva, dstenv, dstva, perm)
//! - 6: page_unmap(envid, va)
//! - 7: exofork()
//! - 8: env_set_status(envid, status)
//! - 9: env_set_pgfault_upcall(envid, func)
//! - 10: yield()
//! - 11: ipc_try_send(envid, value, srcva, perm)
//! - 12: ipc_recv(dstva)

mod error;
mod handler;
mod ipc;
mod validate;

pub use error::{Error, SysResult};
pub use validate::{check_perm, check_user_page};

/// System call numbers
pub mod numbers {
    pub const SYS_CPUTS: u32 = 0;
    pub const SYS_CGETC: u32 = 1;
    pub const SYS_GETENVID: u32 = 2;
    pub const SYS_ENV_DESTROY: u32 = 3;
    pub const SYS_PAGE_ALLOC: u32 = 4;
    pub const SYS_PAGE_MAP: u32 = 5;
    pub const SYS_PAGE_UNMAP: u32 = 6;
    pub const SYS_EXOFORK: u32 = 7;
    pub const SYS_ENV_SET_STATUS: u32 = 8;
    pub const SYS_ENV_SET_PGFAULT_UPCALL: u32 = 9;
    pub const SYS_YIELD: u32 = 10;
    pub const SYS_IPC_TRY_SEND: u32 = 11;
    pub const SYS_IPC_RECV: u32 = 12;
}
