//! Environment Handles
//!
//! An [`EnvId`] packs a directory slot index with a generation tag:
//!
//! ```text
//!  31                 12 11 10 9              0
//! ┌─────────────────────┬─────┬────────────────┐
//! │     generation      │  0  │   slot index   │
//! └─────────────────────┴─────┴────────────────┘
//! ```
//!
//! Every time a slot is reused its generation advances, so a handle to a
//! destroyed environment never resolves to the slot's next occupant.

use core::fmt;

/// Bits used by the slot index.
pub const LOG2NENV: u32 = 10;
/// Largest directory the handle encoding can address.
pub const NENV: usize = 1 << LOG2NENV;
/// First bit of the generation tag.
pub const ENVGENSHIFT: u32 = 12;

/// Generation-checked environment handle.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct EnvId(u32);

impl EnvId {
    /// Shorthand for "the calling environment".
    pub const CURRENT: Self = Self(0);

    /// Wrap a raw handle as passed through the syscall ABI.
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw handle value.
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Directory slot index.
    #[inline]
    pub const fn index(self) -> usize {
        (self.0 as usize) & (NENV - 1)
    }

    /// Generation tag.
    #[inline]
    pub const fn generation(self) -> u32 {
        self.0 >> ENVGENSHIFT
    }

    /// Handle for the next occupant of slot `index`, whose previous occupant
    /// was `prev` (or [`EnvId::CURRENT`] if the slot was never used).
    pub(crate) const fn next_generation(prev: Self, index: usize) -> Self {
        let mut generation = prev.0.wrapping_add(1 << ENVGENSHIFT) & !((NENV as u32) - 1);
        // keep handles positive when viewed as i32
        if generation as i32 <= 0 {
            generation = 1 << ENVGENSHIFT;
        }
        Self(generation | index as u32)
    }
}

impl fmt::Debug for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EnvId({:08x})", self.0)
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}
