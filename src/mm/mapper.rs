//! Address Space Mapper
//!
//! Per-environment page tables and the only code that edits them.
//! The syscall layer reaches mappings exclusively through
//! [`AddressSpace::lookup`], [`AddressSpace::insert`] and
//! [`AddressSpace::remove`].
//!
//! # Security Properties
//! - Only page-aligned addresses below the ceiling can be mapped
//! - Every insert takes a frame reference, every removal drops one
//! - Page table nodes are charged against the same frame pool as data pages

use alloc::boxed::Box;
use alloc::vec::Vec;

use super::address::{VirtAddr, ENTRIES_PER_TABLE, UTOP};
use super::frame::{AllocFlags, FrameId, FrameTable};
use super::paging::{MappingError, PageTable, PageTableEntry, Perm};

/// Number of directory slots covering the user half.
pub const USER_DIR_ENTRIES: usize = UTOP / super::address::PTSIZE;

/// A second-level table together with the frame it occupies.
struct TableNode {
    frame: FrameId,
    table: Box<PageTable>,
}

/// One environment's address space below the ceiling.
pub struct AddressSpace {
    /// Frame backing the directory itself.
    root: FrameId,
    dir: Vec<Option<TableNode>>,
}

impl AddressSpace {
    /// Create an empty address space, charging one frame for the directory.
    pub fn new(frames: &mut FrameTable) -> Result<Self, MappingError> {
        let root = frames.alloc(AllocFlags::ZERO)?;
        frames.incref(root);

        let mut dir = Vec::with_capacity(USER_DIR_ENTRIES);
        dir.resize_with(USER_DIR_ENTRIES, || None);
        Ok(Self { root, dir })
    }

    /// Look up the mapping at `va`.
    pub fn lookup(&self, va: VirtAddr) -> Option<(FrameId, Perm)> {
        self.entry(va)
            .filter(|pte| pte.is_present())
            .map(|pte| (pte.frame(), pte.perm()))
    }

    /// Raw entry for `va`, if its table exists.
    pub fn entry(&self, va: VirtAddr) -> Option<PageTableEntry> {
        if !va.is_user() {
            return None;
        }
        let (pdx, ptx) = va.page_table_indices();
        self.dir[pdx].as_ref().map(|node| node.table[ptx])
    }

    /// Whether directory slot `pdx` has a table.
    pub fn has_table(&self, pdx: usize) -> bool {
        self.dir.get(pdx).map_or(false, Option::is_some)
    }

    /// Map `frame` at `va` with `perm`, replacing whatever was there.
    ///
    /// Remapping the frame already present at `va` only updates permissions.
    pub fn insert(
        &mut self,
        frames: &mut FrameTable,
        frame: FrameId,
        va: VirtAddr,
        perm: Perm,
    ) -> Result<(), MappingError> {
        if !va.is_user_page() {
            return Err(MappingError::BadAddress);
        }
        let (pdx, ptx) = va.page_table_indices();
        let slot = &mut self.dir[pdx];
        let node = match slot {
            Some(node) => node,
            None => {
                let node_frame = frames.alloc(AllocFlags::ZERO)?;
                frames.incref(node_frame);
                slot.insert(TableNode {
                    frame: node_frame,
                    table: Box::new(PageTable::new()),
                })
            }
        };

        // Take the new reference before dropping the old one so a same-frame
        // remap never passes through zero.
        frames.incref(frame);
        let old = node.table[ptx];
        if old.is_present() {
            frames.decref(old.frame());
        }
        node.table[ptx] = PageTableEntry::page(frame, perm);
        Ok(())
    }

    /// Unmap `va`. Absent mappings are ignored.
    pub fn remove(&mut self, frames: &mut FrameTable, va: VirtAddr) {
        if !va.is_user() {
            return;
        }
        let (pdx, ptx) = va.page_table_indices();
        if let Some(node) = self.dir[pdx].as_mut() {
            let old = node.table[ptx];
            if old.is_present() {
                frames.decref(old.frame());
                node.table[ptx].clear();
            }
        }
    }

    /// Iterate over every present mapping in ascending address order.
    pub fn mappings(&self) -> impl Iterator<Item = (VirtAddr, PageTableEntry)> + '_ {
        self.dir.iter().enumerate().flat_map(|(pdx, node)| {
            node.iter().flat_map(move |node| {
                node.table
                    .iter_present()
                    .map(move |(ptx, pte)| (VirtAddr::from_indices(pdx, ptx), pte))
            })
        })
    }

    /// Release every mapping, every table node and the directory.
    pub fn teardown(mut self, frames: &mut FrameTable) {
        for slot in self.dir.iter_mut() {
            if let Some(node) = slot.take() {
                for (_, pte) in node.table.iter_present() {
                    frames.decref(pte.frame());
                }
                frames.decref(node.frame);
            }
        }
        frames.decref(self.root);
    }
}

const _: () = assert!(USER_DIR_ENTRIES <= ENTRIES_PER_TABLE);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::address::PAGE_SIZE;

    fn space(frames: &mut FrameTable) -> AddressSpace {
        AddressSpace::new(frames).expect("directory frame")
    }

    #[test]
    fn insert_then_lookup() {
        let mut frames = FrameTable::new(8);
        let mut space = space(&mut frames);
        let frame = frames.alloc(AllocFlags::ZERO).unwrap();
        let va = VirtAddr::new(0x2000);

        space.insert(&mut frames, frame, va, Perm::USER_RW).unwrap();
        assert_eq!(space.lookup(va), Some((frame, Perm::USER_RW)));
        assert_eq!(frames.refs(frame), 1);
        assert!(space.lookup(VirtAddr::new(0x3000)).is_none());
    }

    #[test]
    fn overwrite_releases_previous_frame() {
        let mut frames = FrameTable::new(8);
        let mut space = space(&mut frames);
        let va = VirtAddr::new(0x4000);
        let first = frames.alloc(AllocFlags::ZERO).unwrap();
        let second = frames.alloc(AllocFlags::ZERO).unwrap();

        space.insert(&mut frames, first, va, Perm::USER_RW).unwrap();
        let free_before = frames.free_count();
        space.insert(&mut frames, second, va, Perm::USER_RW).unwrap();
        assert_eq!(frames.refs(first), 0);
        assert_eq!(frames.free_count(), free_before + 1);
    }

    #[test]
    fn same_frame_remap_keeps_reference() {
        let mut frames = FrameTable::new(8);
        let mut space = space(&mut frames);
        let va = VirtAddr::new(0x4000);
        let frame = frames.alloc(AllocFlags::ZERO).unwrap();

        space.insert(&mut frames, frame, va, Perm::USER_RW).unwrap();
        space.insert(&mut frames, frame, va, Perm::USER_COW).unwrap();
        assert_eq!(frames.refs(frame), 1);
        assert_eq!(space.lookup(va), Some((frame, Perm::USER_COW)));
    }

    #[test]
    fn table_node_allocation_can_fail() {
        // directory + one data frame, nothing left for the table node
        let mut frames = FrameTable::new(2);
        let mut space = space(&mut frames);
        let frame = frames.alloc(AllocFlags::ZERO).unwrap();
        let result = space.insert(&mut frames, frame, VirtAddr::new(0x1000), Perm::USER_RW);
        assert_eq!(result, Err(MappingError::OutOfMemory));
        assert_eq!(frames.refs(frame), 0);
    }

    #[test]
    fn remove_absent_is_noop() {
        let mut frames = FrameTable::new(4);
        let mut space = space(&mut frames);
        space.remove(&mut frames, VirtAddr::new(0x8000));
        space.remove(&mut frames, VirtAddr::new(UTOP));
    }

    #[test]
    fn mappings_are_ordered_and_teardown_frees_all() {
        let mut frames = FrameTable::new(16);
        let total = frames.free_count();
        let mut space = space(&mut frames);
        for va in [0x0080_0000usize, 0x1000, 0x0040_0000 + PAGE_SIZE] {
            let frame = frames.alloc(AllocFlags::ZERO).unwrap();
            space.insert(&mut frames, frame, VirtAddr::new(va), Perm::USER_RW).unwrap();
        }
        let vas: Vec<usize> = space.mappings().map(|(va, _)| va.as_usize()).collect();
        assert_eq!(vas, [0x1000, 0x0040_1000, 0x0080_0000]);

        space.teardown(&mut frames);
        assert_eq!(frames.free_count(), total);
    }
}
