//! Memory management
//!
//! Provides:
//! - Typed user virtual addresses and the fixed user layout
//! - Permission bits and packed page table entries
//! - A reference-counted physical frame table
//! - Per-environment address spaces (the mapper contract)
//!
//! # Security Principles
//! - Frames are freed only when the last mapping goes away
//! - Frame identities never leave the kernel as raw pointers

pub mod address;
pub mod frame;
pub mod mapper;
pub mod paging;

pub use address::{VirtAddr, PAGE_SIZE, PFTEMP, UTEMP, UTEXT, UTOP, USTACKTOP, UXSTACKTOP};
pub use frame::{AllocFlags, FrameId, FrameTable, MAX_FRAMES};
pub use mapper::AddressSpace;
pub use paging::{MappingError, PageTableEntry, Perm};
