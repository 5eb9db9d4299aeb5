//! Page Table Entries and Permissions
//!
//! Two-level page tables with 1024 entries per level.
//!
//! # Entry Layout
//! ```text
//!  31                     12 11   10    9..3  2   1   0
//! ┌─────────────────────────┬────┬──────┬─────┬───┬───┬───┐
//! │      frame number       │COW │SHARED│  -  │ U │ W │ P │
//! └─────────────────────────┴────┴──────┴─────┴───┴───┴───┘
//! ```
//!
//! # Security Properties
//! - Only `Perm::SYSCALL` bits can ever come from a caller
//! - Entries are strictly typed; raw bits never leave this module unchecked

use core::ops::{Index, IndexMut};

use bitflags::bitflags;

use super::address::{ENTRIES_PER_TABLE, PAGE_SHIFT};
use super::frame::FrameId;

bitflags! {
    /// Permission bits of a page mapping.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Perm: u32 {
        /// Mapping is present.
        const PRESENT = 0x001;
        /// Mapping is writable.
        const WRITABLE = 0x002;
        /// Mapping is accessible from user mode.
        const USER = 0x004;
        /// Mapping is intentionally shared across fork.
        const SHARED = 0x400;
        /// Mapping is copy-on-write (software-available bit).
        const COW = 0x800;
    }
}

impl Perm {
    /// Bits every caller-supplied permission must carry.
    pub const REQUIRED: Self = Self::PRESENT.union(Self::USER);

    /// Every bit a caller may supply.
    pub const SYSCALL: Self = Self::REQUIRED
        .union(Self::WRITABLE)
        .union(Self::SHARED)
        .union(Self::COW);

    /// Private writable user data.
    pub const USER_RW: Self = Self::REQUIRED.union(Self::WRITABLE);

    /// Read-only copy-on-write user data.
    pub const USER_COW: Self = Self::REQUIRED.union(Self::COW);
}

/// A single page table entry: frame number plus permission bits.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageTableEntry(u32);

impl PageTableEntry {
    /// Frame number mask (bits [31:12]).
    const ADDR_MASK: u32 = 0xFFFF_F000;

    /// Create an invalid (empty) entry.
    #[inline]
    pub const fn invalid() -> Self {
        Self(0)
    }

    /// Create an entry mapping `frame` with `perm`; PRESENT is implied.
    #[inline]
    pub const fn page(frame: FrameId, perm: Perm) -> Self {
        Self((frame.index() << PAGE_SHIFT) | perm.union(Perm::PRESENT).bits())
    }

    /// Check if the entry is present.
    #[inline]
    pub const fn is_present(self) -> bool {
        self.0 & Perm::PRESENT.bits() != 0
    }

    /// Get the frame this entry maps.
    #[inline]
    pub const fn frame(self) -> FrameId {
        FrameId::from_index((self.0 & Self::ADDR_MASK) >> PAGE_SHIFT)
    }

    /// Get the permission bits of this entry.
    #[inline]
    pub const fn perm(self) -> Perm {
        Perm::from_bits_truncate(self.0 & !Self::ADDR_MASK)
    }

    /// Get the raw value.
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Clear the entry (make invalid).
    #[inline]
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_present() {
            write!(f, "PTE(frame={:?}, perm={:?})", self.frame(), self.perm())
        } else {
            write!(f, "PTE(invalid)")
        }
    }
}

/// One level of the page table hierarchy (1024 entries).
#[derive(Clone)]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

impl PageTable {
    /// Create a new empty page table (all entries invalid).
    pub const fn new() -> Self {
        Self {
            entries: [PageTableEntry::invalid(); ENTRIES_PER_TABLE],
        }
    }

    /// Iterate over all present entries with their indices.
    pub fn iter_present(&self) -> impl Iterator<Item = (usize, PageTableEntry)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_present())
            .map(|(i, e)| (i, *e))
    }

    /// Check whether no entry is present.
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| !e.is_present())
    }
}

impl Index<usize> for PageTable {
    type Output = PageTableEntry;

    #[inline]
    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl IndexMut<usize> for PageTable {
    #[inline]
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Error type for page mapping operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingError {
    /// No frames available for the page or for page table nodes.
    OutOfMemory,
    /// The virtual address is above the ceiling or not page-aligned.
    BadAddress,
}

impl core::fmt::Display for MappingError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of memory for page or page tables"),
            Self::BadAddress => write!(f, "address not a user page"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_packs_frame_and_perm() {
        let frame = FrameId::from_index(0x1234);
        let pte = PageTableEntry::page(frame, Perm::USER | Perm::COW);
        assert!(pte.is_present());
        assert_eq!(pte.frame(), frame);
        assert_eq!(pte.perm(), Perm::USER_COW);
        assert_eq!(pte.as_u32(), 0x0123_4805);
    }

    #[test]
    fn highest_frame_survives_packing() {
        let last = FrameId::from_index((crate::mm::MAX_FRAMES - 1) as u32);
        assert_eq!(PageTableEntry::page(last, Perm::USER_RW).frame(), last);
    }

    #[test]
    fn syscall_mask_rejects_foreign_bits() {
        assert_eq!(Perm::SYSCALL.bits(), 0xC07);
        assert!(Perm::from_bits(0x200 | 0x5).is_none());
        assert!(Perm::from_bits(0x807).is_some());
    }

    #[test]
    fn table_reports_present_entries() {
        let mut table = PageTable::new();
        assert!(table.is_empty());
        table[7] = PageTableEntry::page(FrameId::from_index(3), Perm::USER_RW);
        let present: alloc::vec::Vec<_> = table.iter_present().map(|(i, _)| i).collect();
        assert_eq!(present, [7]);
        table[7].clear();
        assert!(table.is_empty());
    }
}
