//! External capabilities consumed by the virtual memory core
//!
//! The core never touches hardware, the physical page allocator, the swap
//! disk or the file system directly. Each is reached through one of the
//! traits below; [`crate::sim`] has software implementations for hosts.

use crate::addr::{KernelAddr, VirtAddr};
use crate::error::Result;

/// Per-process hardware page table handle
///
/// All methods take `&self`: the page table is shared between the owning
/// process and any thread evicting one of its frames.
pub trait Mmu: Send + Sync {
    /// Maps `va` to the frame at `kva`. Returns false if `va` is already
    /// mapped or the mapping cannot be built.
    fn install(&self, va: VirtAddr, kva: KernelAddr, writable: bool) -> bool;

    /// Removes the mapping for `va`, if any.
    fn clear(&self, va: VirtAddr);

    /// Removes the mapping for `va` and returns its dirty bit.
    ///
    /// Implementations that can do both in one step should override this so
    /// a store racing with the unmap is never lost.
    fn unmap(&self, va: VirtAddr) -> bool {
        let dirty = self.is_dirty(va);
        self.clear(va);
        dirty
    }

    /// Hardware accessed bit of the mapping for `va`
    fn is_accessed(&self, va: VirtAddr) -> bool;

    /// Sets or clears the accessed bit of the mapping for `va`
    fn set_accessed(&self, va: VirtAddr, accessed: bool);

    /// Hardware dirty bit of the mapping for `va`
    fn is_dirty(&self, va: VirtAddr) -> bool;

    /// Sets or clears the dirty bit of the mapping for `va`
    fn set_dirty(&self, va: VirtAddr, dirty: bool);

    /// Whether `va` lies in user space for this page table
    fn is_user_address(&self, va: VirtAddr) -> bool;
}

/// Physical page pool for user frames
///
/// # Safety
///
/// Implementations must ensure that:
/// - every address returned by `alloc_user_page` is the kernel mapping of
///   `PAGE_SIZE` bytes of valid memory
/// - the page stays valid and is handed to nobody else until it is passed
///   back to `free_user_page`
/// - with `zero_fill` set, the page is zeroed before it is returned
pub unsafe trait UserPool: Send + Sync {
    /// Allocates one user page, or `None` when the pool is exhausted.
    fn alloc_user_page(&self, zero_fill: bool) -> Option<KernelAddr>;

    /// Returns a page to the pool.
    ///
    /// # Safety
    ///
    /// `kva` must have come from `alloc_user_page` on this pool and must not
    /// be used afterwards.
    unsafe fn free_user_page(&self, kva: KernelAddr);
}

/// Page-granular swap disk
pub trait SwapDevice: Send + Sync {
    /// Number of page-sized slots on the device
    fn slot_count(&self) -> usize;

    /// Reads slot `slot` into `buf` (`PAGE_SIZE` bytes)
    fn read_slot(&self, slot: usize, buf: &mut [u8]) -> Result<()>;

    /// Writes `buf` (`PAGE_SIZE` bytes) to slot `slot`
    fn write_slot(&self, slot: usize, buf: &[u8]) -> Result<()>;
}

/// A file that pages can be loaded from and written back to
///
/// Callers hold [`crate::page::file::FILESYS_LOCK`] around every call; the
/// storage driver behind an implementation need not be reentrant.
pub trait VmFile: Send + Sync {
    /// File length in bytes
    fn len(&self) -> usize;

    /// Returns true if the file is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads up to `buf.len()` bytes at `offset`; returns the count read.
    fn read_at(&self, buf: &mut [u8], offset: usize) -> usize;

    /// Writes up to `buf.len()` bytes at `offset`; returns the count written.
    fn write_at(&self, buf: &[u8], offset: usize) -> usize;
}
