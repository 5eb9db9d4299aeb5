//! Round-Robin Scheduler
//!
//! Picks the next RUNNABLE environment after the current one in directory
//! order. The current environment is only chosen again if nothing else is
//! runnable.

use log::trace;

use crate::env::{EnvId, EnvStatus, EnvTable};
use crate::kernel::Kernel;

/// Next environment to run after `current`.
pub fn pick_next(envs: &EnvTable, current: Option<EnvId>) -> Option<EnvId> {
    envs.iter_from(current.map(EnvId::index))
        .find(|env| Some(env.id) != current && env.status == EnvStatus::Runnable)
        .map(|env| env.id)
        .or_else(|| current.filter(|&id| envs.status(id) == EnvStatus::Runnable))
}

impl Kernel {
    /// Give up the CPU.
    ///
    /// Returns the environment selected to run next, if any.
    pub fn sched_yield(&mut self) -> Option<EnvId> {
        let next = pick_next(&self.envs, self.curenv);
        trace!("sched: {:?} -> {:?}", self.curenv, next);
        self.curenv = next;
        next
    }
}
