//! Software implementations of the external capabilities
//!
//! Used by the tests and benches to drive the paging core on a host, and
//! usable by a kernel as reference implementations while bringing up the
//! real drivers.

use alloc::alloc::{Layout, alloc, alloc_zeroed, dealloc};
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use hashbrown::HashMap;
use spin::Mutex;

use crate::addr::{KernelAddr, PAGE_SIZE, VirtAddr};
use crate::config::VmConfig;
use crate::error::{Result, VmError};
use crate::hal::{Mmu, SwapDevice, UserPool, VmFile};

const PAGE_LAYOUT: Layout = match Layout::from_size_align(PAGE_SIZE, PAGE_SIZE) {
    Ok(layout) => layout,
    Err(_) => panic!("invalid page layout"),
};

#[derive(Debug, Clone, Copy)]
struct Pte {
    kva: KernelAddr,
    writable: bool,
    accessed: bool,
    dirty: bool,
}

/// Hardware page table emulated with a hash map
///
/// [`SoftMmu::read_user`] and [`SoftMmu::write_user`] play the part of user
/// instructions: they go through the mappings, update the accessed and dirty
/// bits, and fail where real hardware would fault.
#[derive(Debug)]
pub struct SoftMmu {
    config: VmConfig,
    entries: Mutex<HashMap<VirtAddr, Pte>>,
}

impl SoftMmu {
    /// Create an empty page table for the `config` layout
    pub fn new(config: VmConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Frame mapped at the page containing `va`
    pub fn translate(&self, va: VirtAddr) -> Option<KernelAddr> {
        self.entries.lock().get(&va.page_round_down()).map(|pte| pte.kva)
    }

    /// Whether the mapping at `va` allows writes
    pub fn is_writable(&self, va: VirtAddr) -> Option<bool> {
        self.entries.lock().get(&va.page_round_down()).map(|pte| pte.writable)
    }

    /// Number of installed mappings
    pub fn mapped_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// User load of `buf.len()` bytes at `va`. Returns false on the first
    /// unmapped page.
    pub fn read_user(&self, va: VirtAddr, buf: &mut [u8]) -> bool {
        let mut entries = self.entries.lock();
        let mut done = 0;
        while done < buf.len() {
            let Some(cur) = va.checked_add(done) else { return false };
            let Some(pte) = entries.get_mut(&cur.page_round_down()) else {
                return false;
            };
            pte.accessed = true;
            let offset = cur.page_offset();
            let n = (PAGE_SIZE - offset).min(buf.len() - done);
            // SAFETY: an installed frame stays valid until the mapping is cleared.
            let page = unsafe { pte.kva.as_page() };
            buf[done..done + n].copy_from_slice(&page[offset..offset + n]);
            done += n;
        }
        true
    }

    /// User store of `data` at `va`. Returns false on the first unmapped or
    /// read-only page.
    pub fn write_user(&self, va: VirtAddr, data: &[u8]) -> bool {
        let mut entries = self.entries.lock();
        let mut done = 0;
        while done < data.len() {
            let Some(cur) = va.checked_add(done) else { return false };
            let Some(pte) = entries.get_mut(&cur.page_round_down()) else {
                return false;
            };
            if !pte.writable {
                return false;
            }
            pte.accessed = true;
            pte.dirty = true;
            let offset = cur.page_offset();
            let n = (PAGE_SIZE - offset).min(data.len() - done);
            // SAFETY: as in `read_user`.
            let page = unsafe { pte.kva.as_page_mut() };
            page[offset..offset + n].copy_from_slice(&data[done..done + n]);
            done += n;
        }
        true
    }

    fn update(&self, va: VirtAddr, f: impl FnOnce(&mut Pte)) {
        if let Some(pte) = self.entries.lock().get_mut(&va.page_round_down()) {
            f(pte);
        }
    }
}

impl Mmu for SoftMmu {
    fn install(&self, va: VirtAddr, kva: KernelAddr, writable: bool) -> bool {
        let mut entries = self.entries.lock();
        let va = va.page_round_down();
        if entries.contains_key(&va) {
            return false;
        }
        entries.insert(
            va,
            Pte {
                kva,
                writable,
                accessed: false,
                dirty: false,
            },
        );
        true
    }

    fn clear(&self, va: VirtAddr) {
        self.entries.lock().remove(&va.page_round_down());
    }

    fn unmap(&self, va: VirtAddr) -> bool {
        self.entries.lock().remove(&va.page_round_down()).is_some_and(|pte| pte.dirty)
    }

    fn is_accessed(&self, va: VirtAddr) -> bool {
        self.entries
            .lock()
            .get(&va.page_round_down())
            .is_some_and(|pte| pte.accessed)
    }

    fn set_accessed(&self, va: VirtAddr, accessed: bool) {
        self.update(va, |pte| pte.accessed = accessed);
    }

    fn is_dirty(&self, va: VirtAddr) -> bool {
        self.entries.lock().get(&va.page_round_down()).is_some_and(|pte| pte.dirty)
    }

    fn set_dirty(&self, va: VirtAddr, dirty: bool) {
        self.update(va, |pte| pte.dirty = dirty);
    }

    fn is_user_address(&self, va: VirtAddr) -> bool {
        self.config.is_user_address(va)
    }
}

/// User page pool over the global allocator, limited to `capacity` pages
#[derive(Debug)]
pub struct HeapPool {
    capacity: usize,
    pages: Mutex<Vec<KernelAddr>>,
}

impl HeapPool {
    /// Create a pool that hands out at most `capacity` pages at a time
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            pages: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    /// Pool size
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Pages currently handed out
    pub fn outstanding(&self) -> usize {
        self.pages.lock().len()
    }
}

// SAFETY: pages come from the global allocator with page size and alignment,
// are tracked until freed, and are handed out once.
unsafe impl UserPool for HeapPool {
    fn alloc_user_page(&self, zero_fill: bool) -> Option<KernelAddr> {
        let mut pages = self.pages.lock();
        if pages.len() >= self.capacity {
            return None;
        }
        // SAFETY: PAGE_LAYOUT has non-zero size.
        let ptr = unsafe {
            if zero_fill {
                alloc_zeroed(PAGE_LAYOUT)
            } else {
                alloc(PAGE_LAYOUT)
            }
        };
        if ptr.is_null() {
            return None;
        }
        let kva = KernelAddr::new(ptr as usize);
        pages.push(kva);
        Some(kva)
    }

    unsafe fn free_user_page(&self, kva: KernelAddr) {
        let mut pages = self.pages.lock();
        let Some(index) = pages.iter().position(|&page| page == kva) else {
            log::warn!("HeapPool: free of unknown page {:?}", kva);
            return;
        };
        pages.swap_remove(index);
        // SAFETY: the page was allocated above with PAGE_LAYOUT.
        unsafe { dealloc(kva.as_ptr(), PAGE_LAYOUT) };
    }
}

impl Drop for HeapPool {
    fn drop(&mut self) {
        for kva in self.pages.get_mut().drain(..) {
            // SAFETY: every tracked page was allocated with PAGE_LAYOUT.
            unsafe { dealloc(kva.as_ptr(), PAGE_LAYOUT) };
        }
    }
}

/// Swap device backed by memory
#[derive(Debug)]
pub struct MemSwapDevice {
    slots: Mutex<Vec<u8>>,
    slot_count: usize,
    failing: AtomicBool,
}

impl MemSwapDevice {
    /// Create a device with `slots` page-sized slots
    pub fn new(slots: usize) -> Self {
        Self {
            slots: Mutex::new(vec![0; slots * PAGE_SIZE]),
            slot_count: slots,
            failing: AtomicBool::new(false),
        }
    }

    /// Makes every later transfer fail, to exercise I/O error paths.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    fn check(&self, slot: usize, len: usize) -> Result<core::ops::Range<usize>> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(VmError::BackingStore("swap device I/O error"));
        }
        if slot >= self.slot_count {
            return Err(VmError::BackingStore("swap slot out of range"));
        }
        if len != PAGE_SIZE {
            return Err(VmError::InvalidArgument("swap transfers are one page"));
        }
        Ok(slot * PAGE_SIZE..(slot + 1) * PAGE_SIZE)
    }
}

impl SwapDevice for MemSwapDevice {
    fn slot_count(&self) -> usize {
        self.slot_count
    }

    fn read_slot(&self, slot: usize, buf: &mut [u8]) -> Result<()> {
        let range = self.check(slot, buf.len())?;
        buf.copy_from_slice(&self.slots.lock()[range]);
        Ok(())
    }

    fn write_slot(&self, slot: usize, buf: &[u8]) -> Result<()> {
        let range = self.check(slot, buf.len())?;
        self.slots.lock()[range].copy_from_slice(buf);
        Ok(())
    }
}

/// Fixed-length file held in memory
///
/// Writes never extend the file, like a memory-mapped file.
#[derive(Debug, Default)]
pub struct MemFile {
    data: Mutex<Vec<u8>>,
}

impl MemFile {
    /// Create a file holding `data`
    pub fn new(data: Vec<u8>) -> Self {
        Self { data: Mutex::new(data) }
    }

    /// Current contents
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl VmFile for MemFile {
    fn len(&self) -> usize {
        self.data.lock().len()
    }

    fn read_at(&self, buf: &mut [u8], offset: usize) -> usize {
        let data = self.data.lock();
        if offset >= data.len() {
            return 0;
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        n
    }

    fn write_at(&self, buf: &[u8], offset: usize) -> usize {
        let mut data = self.data.lock();
        if offset >= data.len() {
            return 0;
        }
        let n = buf.len().min(data.len() - offset);
        data[offset..offset + n].copy_from_slice(&buf[..n]);
        n
    }
}
