//! Virtual Address Type and User Layout
//!
//! Type-safe wrapper for user virtual addresses plus the fixed layout of the
//! user half of every address space.
//!
//! # Layout (two-level, 4 KiB pages)
//! ```text
//!  UTOP/UXSTACKTOP  0xEEC0_0000  ──────── ceiling, privileged above
//!                                 exception stack page (one per env)
//!                   0xEEBF_F000  ──────── empty guard
//!  USTACKTOP        0xEEBF_E000  ──────── normal user stack grows down
//!                       ...
//!  UTEXT            0x0080_0000  ──────── program text
//!  PFTEMP           0x007F_F000  ──────── fault handler scratch page
//!  UTEMP            0x0040_0000
//! ```

use core::fmt;

/// Page size (4 KiB)
pub const PAGE_SIZE: usize = 4096;
/// Page size mask
pub const PAGE_MASK: usize = PAGE_SIZE - 1;
/// Bits to shift for page number
pub const PAGE_SHIFT: usize = 12;
/// Bits to shift for the directory index
pub const PDX_SHIFT: usize = 22;

/// Number of entries per page table and per directory
pub const ENTRIES_PER_TABLE: usize = 1024;

/// Bytes mapped by one page table
pub const PTSIZE: usize = PAGE_SIZE * ENTRIES_PER_TABLE;

/// Address ceiling: everything at or above belongs to the kernel.
pub const UTOP: usize = 0xEEC0_0000;
/// Top of the per-environment exception stack.
pub const UXSTACKTOP: usize = UTOP;
/// Top of the normal user stack (one guard page below the exception stack).
pub const USTACKTOP: usize = UTOP - 2 * PAGE_SIZE;
/// Temporary mapping area.
pub const UTEMP: usize = PTSIZE;
/// Scratch page used by the copy-on-write fault handler.
pub const PFTEMP: usize = UTEMP + PTSIZE - PAGE_SIZE;
/// Start of program text.
pub const UTEXT: usize = 2 * PTSIZE;

/// A user virtual address.
///
/// Construction never fails; whether the address is acceptable for a given
/// operation (below the ceiling, aligned) is checked by the caller.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(usize);

impl VirtAddr {
    /// The ceiling address, used as the "no page" marker in IPC.
    pub const CEILING: Self = Self(UTOP);

    /// Create a new virtual address.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Get the raw address value.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Check if the address is page-aligned.
    #[inline]
    pub const fn is_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    /// Align the address down to the nearest page boundary.
    #[inline]
    pub const fn align_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Align the address up to the nearest page boundary.
    #[inline]
    pub const fn align_up(self) -> Self {
        Self(self.0.saturating_add(PAGE_MASK) & !PAGE_MASK)
    }

    /// Get the page table indices for this address.
    ///
    /// Returns (directory, table) indices for 2-level paging.
    #[inline]
    pub const fn page_table_indices(self) -> (usize, usize) {
        let pdx = (self.0 >> PDX_SHIFT) & (ENTRIES_PER_TABLE - 1);
        let ptx = (self.0 >> PAGE_SHIFT) & (ENTRIES_PER_TABLE - 1);
        (pdx, ptx)
    }

    /// Rebuild an address from directory and table indices.
    #[inline]
    pub const fn from_indices(pdx: usize, ptx: usize) -> Self {
        Self((pdx << PDX_SHIFT) | (ptx << PAGE_SHIFT))
    }

    /// Virtual page number.
    #[inline]
    pub const fn page_number(self) -> usize {
        self.0 >> PAGE_SHIFT
    }

    /// Create from a virtual page number.
    #[inline]
    pub const fn from_page_number(pn: usize) -> Self {
        Self(pn << PAGE_SHIFT)
    }

    /// Get the page offset (lowest 12 bits).
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & PAGE_MASK
    }

    /// Add an offset to this address, `None` on overflow.
    #[inline]
    pub const fn checked_add(self, offset: usize) -> Option<Self> {
        match self.0.checked_add(offset) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }

    /// Check if this address lies below the ceiling.
    #[inline]
    pub const fn is_user(self) -> bool {
        self.0 < UTOP
    }

    /// Check if this is a page-aligned address below the ceiling.
    #[inline]
    pub const fn is_user_page(self) -> bool {
        self.is_user() && self.is_aligned()
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#010x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl From<u32> for VirtAddr {
    fn from(raw: u32) -> Self {
        Self(raw as usize)
    }
}
