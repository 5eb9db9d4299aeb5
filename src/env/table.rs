//! Environment Directory
//!
//! A fixed array of environment slots addressed by [`EnvId`].
//!
//! # Design
//! - Slot index comes straight from the handle; the generation must match
//! - Free slots form a LIFO list; the lowest index is handed out first
//!   on a fresh table
//! - Freeing an environment tears down its address space

use alloc::vec::Vec;

use super::{Env, EnvId, EnvStatus, NENV};
use crate::mm::{AddressSpace, FrameTable};
use crate::syscall::{Error, SysResult};

struct Slot {
    /// Handle of the most recent occupant, seeds the next generation.
    last_id: EnvId,
    env: Option<Env>,
}

/// The environment directory.
pub struct EnvTable {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

impl EnvTable {
    /// Create a directory with `capacity` slots (at most [`NENV`]).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(NENV);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || Slot {
            last_id: EnvId::CURRENT,
            env: None,
        });
        Self {
            slots,
            free: (0..capacity).rev().collect(),
        }
    }

    /// Allocate a new NOT_RUNNABLE environment with an empty address space.
    pub fn alloc(&mut self, frames: &mut FrameTable, parent_id: EnvId) -> SysResult<EnvId> {
        let index = *self.free.last().ok_or(Error::NoFreeEnv)?;
        let space = AddressSpace::new(frames)?;
        self.free.pop();

        let slot = &mut self.slots[index];
        let id = EnvId::next_generation(slot.last_id, index);
        slot.last_id = id;
        slot.env = Some(Env::new(id, parent_id, space));
        Ok(id)
    }

    /// Free an environment and everything its address space references.
    ///
    /// Returns `false` if `id` does not name a live environment.
    pub fn free(&mut self, frames: &mut FrameTable, id: EnvId) -> bool {
        let Some(slot) = self.slots.get_mut(id.index()) else {
            return false;
        };
        match slot.env.take() {
            Some(env) if env.id == id => {
                env.space.teardown(frames);
                self.free.push(id.index());
                true
            }
            other => {
                slot.env = other;
                false
            }
        }
    }

    /// Look up a live environment by exact handle.
    pub fn get(&self, id: EnvId) -> Option<&Env> {
        self.slots
            .get(id.index())?
            .env
            .as_ref()
            .filter(|env| env.id == id)
    }

    /// Mutable lookup by exact handle.
    pub fn get_mut(&mut self, id: EnvId) -> Option<&mut Env> {
        self.slots
            .get_mut(id.index())?
            .env
            .as_mut()
            .filter(|env| env.id == id)
    }

    /// Resolve a caller-supplied handle.
    ///
    /// [`EnvId::CURRENT`] names `curenv`. With `checkperm`, only `curenv`
    /// itself or one of its immediate children is accepted.
    pub fn resolve(&self, id: EnvId, curenv: Option<EnvId>, checkperm: bool) -> SysResult<EnvId> {
        let id = if id == EnvId::CURRENT {
            curenv.ok_or(Error::BadEnv)?
        } else {
            id
        };
        let env = self.get(id).ok_or(Error::BadEnv)?;
        if checkperm {
            let cur = curenv.ok_or(Error::BadEnv)?;
            if env.id != cur && env.parent_id != cur {
                return Err(Error::BadEnv);
            }
        }
        Ok(env.id)
    }

    /// Status of the slot named by `id`; stale handles read as FREE.
    pub fn status(&self, id: EnvId) -> EnvStatus {
        self.get(id).map_or(EnvStatus::Free, |env| env.status)
    }

    /// Live environments in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &Env> + '_ {
        self.slots.iter().filter_map(|slot| slot.env.as_ref())
    }

    /// Live environments starting after slot `after`, wrapping around.
    pub fn iter_from(&self, after: Option<usize>) -> impl Iterator<Item = &Env> + '_ {
        let len = self.slots.len();
        let start = after.map_or(0, |i| i + 1);
        (0..len)
            .map(move |k| (start + k) % len)
            .filter_map(move |i| self.slots[i].env.as_ref())
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of live environments.
    pub fn live(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}
