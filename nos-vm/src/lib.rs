//! NOS Virtual Memory
//!
//! This crate provides demand paging for user processes: the supplemental
//! page table, the global frame table with clock eviction, swap-backed
//! anonymous pages, file-backed pages, lazy loading, stack growth and the
//! fork copy and exit teardown of an address space.
//!
//! Hardware and storage are reached through the traits in [`hal`]; the
//! [`sim`] module implements them in software for hosted use.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

pub mod addr;
pub mod config;
pub mod error;
pub mod fault;
pub mod frame;
pub mod hal;
pub mod mmap;
pub mod page;
pub mod sim;
pub mod space;
pub mod spt;
pub mod uaccess;
pub mod vm;

// Re-export commonly used types
pub use addr::{KernelAddr, PAGE_SHIFT, PAGE_SIZE, VirtAddr, page_round_down, page_round_up};
pub use config::VmConfig;
pub use error::{Result, VmError};
pub use fault::{ABNORMAL_EXIT_STATUS, FaultFlags, PageFault, PageFaultResult};
pub use frame::{FrameEntry, FrameOwner, FrameTable};
pub use hal::{Mmu, SwapDevice, UserPool, VmFile};
pub use page::file::FILESYS_LOCK;
pub use page::{
    AnonPage, FileMapping, FilePage, LazyLoad, Page, PageInit, PageKind, PageMarkers,
    SegmentLoader, SwapSlot, SwapTable, UninitPage, VmType,
};
pub use space::{AddressSpace, SpaceId};
pub use spt::SupplementalPageTable;
pub use vm::{Vm, VmStats, VmStatsSnapshot};
