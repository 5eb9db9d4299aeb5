//! Environments
//!
//! An environment is the unit of isolation: one register snapshot, one
//! address space, one set of IPC fields. Environments live in a fixed-size
//! [`EnvTable`] and are named by generation-checked [`EnvId`] handles.

mod id;
mod table;

pub use id::{EnvId, ENVGENSHIFT, LOG2NENV, NENV};
pub use table::EnvTable;

use crate::mm::{AddressSpace, Perm, VirtAddr};
use crate::trap::TrapFrame;

/// Environment status.
///
/// Numeric values are the ones accepted by `set_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EnvStatus {
    /// Slot is unused.
    Free = 0,
    /// Torn down at the end of the current trap.
    Dying = 1,
    /// Eligible to run.
    Runnable = 2,
    /// Parked: freshly forked, or blocked in receive.
    NotRunnable = 4,
}

impl EnvStatus {
    /// Decode a status accepted by `set_status`; every other value is rejected.
    pub const fn settable(raw: u32) -> Option<Self> {
        match raw {
            2 => Some(Self::Runnable),
            4 => Some(Self::NotRunnable),
            _ => None,
        }
    }
}

/// IPC rendezvous fields of one environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcState {
    /// Blocked in receive and willing to accept one send.
    pub recving: bool,
    /// Sender of the last delivered message.
    pub from: EnvId,
    /// Payload of the last delivered message.
    pub value: u32,
    /// Where a transferred page goes; `None` when no page was requested.
    pub dstva: Option<VirtAddr>,
    /// Permissions of the transferred page, empty if none was transferred.
    pub perm: Perm,
}

impl IpcState {
    const fn new() -> Self {
        Self {
            recving: false,
            from: EnvId::CURRENT,
            value: 0,
            dstva: None,
            perm: Perm::empty(),
        }
    }
}

/// An environment record.
pub struct Env {
    pub(crate) id: EnvId,
    pub(crate) parent_id: EnvId,
    pub(crate) status: EnvStatus,
    pub(crate) tf: TrapFrame,
    pub(crate) space: AddressSpace,
    pub(crate) pgfault_upcall: Option<VirtAddr>,
    pub(crate) ipc: IpcState,
}

impl Env {
    fn new(id: EnvId, parent_id: EnvId, space: AddressSpace) -> Self {
        Self {
            id,
            parent_id,
            status: EnvStatus::NotRunnable,
            tf: TrapFrame::user_entry(),
            space,
            pgfault_upcall: None,
            ipc: IpcState::new(),
        }
    }

    /// Read-only snapshot of the externally visible fields.
    pub fn view(&self) -> EnvView {
        EnvView {
            id: self.id,
            parent_id: self.parent_id,
            status: self.status,
            pgfault_upcall: self.pgfault_upcall,
            ipc: self.ipc,
        }
    }
}

/// What any environment may read about any other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvView {
    pub id: EnvId,
    pub parent_id: EnvId,
    pub status: EnvStatus,
    pub pgfault_upcall: Option<VirtAddr>,
    pub ipc: IpcState,
}
