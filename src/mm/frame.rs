//! Physical Frame Table
//!
//! Manages physical page frames as a reference-counted arena.
//!
//! # Design
//! - Each frame slot is either free or allocated
//! - An allocated frame carries a reference count equal to the number of
//!   page table entries that point at it
//! - A frame returns to the free list when its count drops to zero
//!
//! # Security Properties
//! - Frames handed out with `AllocFlags::ZERO` are zeroed
//! - Over-release is detected and causes a panic
//! - Frame contents are only reachable through this table

use alloc::boxed::Box;
use alloc::vec::Vec;

use bitflags::bitflags;

use super::address::{PAGE_SHIFT, PAGE_SIZE};
use super::paging::MappingError;

/// Most frames a page table entry can name.
pub const MAX_FRAMES: usize = 1 << (32 - PAGE_SHIFT);

/// Opaque handle to one physical frame.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FrameId(u32);

impl FrameId {
    #[inline]
    pub(crate) const fn from_index(index: u32) -> Self {
        Self(index)
    }

    #[inline]
    pub(crate) const fn index(self) -> u32 {
        self.0
    }
}

impl core::fmt::Debug for FrameId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "FrameId({})", self.0)
    }
}

bitflags! {
    /// Options for `FrameTable::alloc`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct AllocFlags: u8 {
        /// Fill the frame with zeroes before returning it.
        const ZERO = 1 << 0;
    }
}

/// Page-sized backing storage.
type PageBytes = Box<[u8; PAGE_SIZE]>;

/// Frame slot state.
struct Frame {
    /// Number of mappings referencing this frame.
    refs: u32,
    /// Whether the frame is off the free list.
    allocated: bool,
    /// Backing bytes, materialized on first allocation.
    data: Option<PageBytes>,
}

impl Frame {
    const fn new() -> Self {
        Self {
            refs: 0,
            allocated: false,
            data: None,
        }
    }
}

/// Reference-counted frame arena.
pub struct FrameTable {
    frames: Vec<Frame>,
    /// Free frame indices; the last element is handed out next.
    free: Vec<u32>,
}

impl FrameTable {
    /// Create a table managing `count` frames, at most [`MAX_FRAMES`].
    pub fn new(count: usize) -> Self {
        let count = count.min(MAX_FRAMES);
        let mut frames = Vec::with_capacity(count);
        frames.resize_with(count, Frame::new);
        Self {
            frames,
            free: (0..count as u32).rev().collect(),
        }
    }

    /// Allocate a frame with a reference count of zero.
    ///
    /// The caller either maps it (raising the count) or hands it back
    /// through [`FrameTable::free_unreferenced`].
    pub fn alloc(&mut self, flags: AllocFlags) -> Result<FrameId, MappingError> {
        let index = self.free.pop().ok_or(MappingError::OutOfMemory)?;
        let frame = &mut self.frames[index as usize];
        debug_assert!(!frame.allocated && frame.refs == 0);
        frame.allocated = true;

        let data = frame.data.get_or_insert_with(|| Box::new([0u8; PAGE_SIZE]));
        if flags.contains(AllocFlags::ZERO) {
            data.fill(0);
        }

        Ok(FrameId(index))
    }

    /// Return an allocated frame that no mapping references.
    ///
    /// # Panics
    /// Panics if the frame is still referenced or was never allocated.
    pub fn free_unreferenced(&mut self, id: FrameId) {
        let frame = &mut self.frames[id.0 as usize];
        if !frame.allocated || frame.refs != 0 {
            panic!("Attempted to free in-use or free frame: {:?}", id);
        }
        frame.allocated = false;
        self.free.push(id.0);
    }

    /// Add one reference.
    pub fn incref(&mut self, id: FrameId) {
        let frame = &mut self.frames[id.0 as usize];
        debug_assert!(frame.allocated);
        frame.refs += 1;
    }

    /// Drop one reference, freeing the frame when none remain.
    ///
    /// # Panics
    /// Panics on a frame with no references (double release).
    pub fn decref(&mut self, id: FrameId) {
        let frame = &mut self.frames[id.0 as usize];
        if frame.refs == 0 {
            panic!("Double release detected for frame: {:?}", id);
        }
        frame.refs -= 1;
        if frame.refs == 0 {
            frame.allocated = false;
            self.free.push(id.0);
        }
    }

    /// Reference count of a frame.
    pub fn refs(&self, id: FrameId) -> u32 {
        self.frames.get(id.0 as usize).map_or(0, |f| f.refs)
    }

    /// Read-only access to the frame bytes.
    pub fn bytes(&self, id: FrameId) -> &[u8; PAGE_SIZE] {
        match self.frames[id.0 as usize].data.as_deref() {
            Some(data) => data,
            None => panic!("Access to never-allocated frame: {:?}", id),
        }
    }

    /// Mutable access to the frame bytes.
    pub fn bytes_mut(&mut self, id: FrameId) -> &mut [u8; PAGE_SIZE] {
        match self.frames[id.0 as usize].data.as_deref_mut() {
            Some(data) => data,
            None => panic!("Access to never-allocated frame: {:?}", id),
        }
    }

    /// Number of frames on the free list.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Total frames under management.
    pub fn capacity(&self) -> usize {
        self.frames.len()
    }
}
