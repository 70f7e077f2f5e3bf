//! Demand paging core
//!
//! [`Vm`] owns the global frame table, the user page pool and the swap area,
//! and implements the page lifecycle on top of them: registration of pending
//! pages, the claim protocol, clock eviction, fork copy and teardown.
//!
//! # Locking
//!
//! Every operation that can touch frames takes the frame table lock first
//! and then the supplemental page table lock(s) it needs. Eviction runs with
//! those locks held: the tables the caller already holds are passed down as
//! `tables`, and a victim in any other space is reached through the weak
//! owner link and locked there. A space lock is never held while waiting for
//! the frame table.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use log::{debug, trace, warn};
use spin::Mutex;

use crate::addr::{KernelAddr, PAGE_SIZE, VirtAddr};
use crate::config::VmConfig;
use crate::error::{Result, VmError};
use crate::frame::{FrameOwner, FrameTable, Victim};
use crate::hal::{SwapDevice, UserPool, VmFile};
use crate::page::{
    AnonPage, LazyLoad, Page, PageCtx, PageInit, PageKind, PageMarkers, SegmentLoader, SwapTable,
    UninitPage,
};
use crate::space::AddressSpace;
use crate::spt::SupplementalPageTable;

/// Running counters of the paging core
#[derive(Debug, Default)]
pub struct VmStats {
    page_faults: AtomicU64,
    claims: AtomicU64,
    evictions: AtomicU64,
    stack_growths: AtomicU64,
    kills: AtomicU64,
}

/// Point-in-time copy of [`VmStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VmStatsSnapshot {
    /// Faults delivered to [`Vm::handle_page_fault`]
    pub page_faults: u64,
    /// Pages that received a frame
    pub claims: u64,
    /// Frames taken from a resident page
    pub evictions: u64,
    /// Stack pages created by growth
    pub stack_growths: u64,
    /// Faults that ended in process termination
    pub kills: u64,
}

impl VmStats {
    pub(crate) fn count_fault(&self) {
        self.page_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_stack_growth(&self) {
        self.stack_growths.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_kill(&self) {
        self.kills.fetch_add(1, Ordering::Relaxed);
    }

    /// Read all counters
    pub fn snapshot(&self) -> VmStatsSnapshot {
        VmStatsSnapshot {
            page_faults: self.page_faults.load(Ordering::Relaxed),
            claims: self.claims.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            stack_growths: self.stack_growths.load(Ordering::Relaxed),
            kills: self.kills.load(Ordering::Relaxed),
        }
    }
}

/// The virtual memory system of one kernel
pub struct Vm {
    pub(crate) config: VmConfig,
    pub(crate) frames: Mutex<FrameTable>,
    pool: Arc<dyn UserPool>,
    swap: SwapTable,
    pub(crate) stats: VmStats,
}

impl Vm {
    /// Creates the paging core over a user page pool and a swap device.
    pub fn new(
        config: VmConfig,
        pool: Arc<dyn UserPool>,
        swap_device: Arc<dyn SwapDevice>,
    ) -> Result<Self> {
        config.verify().map_err(VmError::InvalidArgument)?;
        let swap = SwapTable::new(swap_device);
        debug!("vm: {} swap slots, stack top {:#x}", swap.capacity(), config.user_stack_top);
        Ok(Self {
            config,
            frames: Mutex::new(FrameTable::new()),
            pool,
            swap,
            stats: VmStats::default(),
        })
    }

    /// Address space layout
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Swap area
    pub fn swap(&self) -> &SwapTable {
        &self.swap
    }

    /// Counter snapshot
    pub fn stats(&self) -> VmStatsSnapshot {
        self.stats.snapshot()
    }

    /// Number of frames currently in the frame table
    pub fn frame_count(&self) -> usize {
        self.frames.lock().len()
    }

    /// Number of frames owned by pages of `space`
    pub fn frames_of(&self, space: &AddressSpace) -> usize {
        self.frames
            .lock()
            .iter()
            .filter(|entry| entry.owner.as_ref().is_some_and(|owner| owner.id == space.id()))
            .count()
    }

    pub(crate) fn page_ctx<'a>(&'a self, space: &'a AddressSpace) -> PageCtx<'a> {
        PageCtx {
            mmu: space.mmu(),
            swap: &self.swap,
        }
    }

    /// Registers a pending page at `va` that becomes `target` on first
    /// claim, running `loader` after the target initializer.
    ///
    /// No frame is allocated. Fails with `DuplicateMapping` if `va` is taken.
    pub fn alloc_page_with_initializer(
        &self,
        space: &Arc<AddressSpace>,
        target: PageInit,
        va: VirtAddr,
        writable: bool,
        loader: Option<Arc<dyn LazyLoad>>,
    ) -> Result<()> {
        self.alloc_page_marked(space, target, va, writable, PageMarkers::empty(), loader)
    }

    /// Registers a pending zero-filled anonymous page at `va`.
    pub fn alloc_page(
        &self,
        space: &Arc<AddressSpace>,
        va: VirtAddr,
        writable: bool,
    ) -> Result<()> {
        self.alloc_page_with_initializer(space, PageInit::Anon, va, writable, None)
    }

    pub(crate) fn alloc_page_marked(
        &self,
        space: &AddressSpace,
        target: PageInit,
        va: VirtAddr,
        writable: bool,
        markers: PageMarkers,
        loader: Option<Arc<dyn LazyLoad>>,
    ) -> Result<()> {
        let va = va.page_round_down();
        if va.is_null() || !space.mmu().is_user_address(va) {
            return Err(VmError::InvalidAccess(va));
        }
        let vm_type = target.vm_type();
        space
            .spt
            .lock()
            .insert(Page::new_uninit(va, writable, markers, UninitPage::new(target, loader)))?;
        trace!("space {:?}: pending {} page at {}", space.id(), vm_type, va);
        Ok(())
    }

    /// Gives the page at `va` a frame and loads its contents.
    ///
    /// A page that is already resident is left alone. Fails with
    /// `InvalidAccess` if no page covers `va`, and with `ResourceExhausted`
    /// if no frame can be obtained even by eviction.
    pub fn claim_page(&self, space: &Arc<AddressSpace>, va: VirtAddr) -> Result<()> {
        let mut frames = self.frames.lock();
        let mut spt = space.spt.lock();
        match spt.find(va) {
            None => return Err(VmError::InvalidAccess(va)),
            Some(page) if page.is_resident() => return Ok(()),
            Some(_) => {}
        }
        self.do_claim(&mut frames, &mut [&mut *spt], 0, space, va)
    }

    /// Claim with the frame table and `tables` already locked; the page
    /// lives in `tables[target]`, which belongs to `space`.
    fn do_claim(
        &self,
        frames: &mut FrameTable,
        tables: &mut [&mut SupplementalPageTable],
        target: usize,
        space: &Arc<AddressSpace>,
        va: VirtAddr,
    ) -> Result<()> {
        let va = va.page_round_down();
        let kva = self.acquire_frame(frames, tables)?;

        let ctx = self.page_ctx(space);
        let Some(page) = tables[target].find_mut(va) else {
            self.release_frame(frames, kva);
            return Err(VmError::NotFound(va));
        };
        self.link(frames, space, page, kva)?;

        // SAFETY: the frame was just acquired and is linked to this page only.
        let contents = unsafe { kva.as_page_mut() };
        if let Err(err) = page.swap_in(&ctx, contents) {
            ctx.mmu.clear(va);
            page.frame = None;
            self.release_frame(frames, kva);
            debug!("space {:?}: claim of {} failed: {}", space.id(), va, err);
            return Err(err);
        }

        self.stats.claims.fetch_add(1, Ordering::Relaxed);
        trace!("space {:?}: {} claimed frame {:?}", space.id(), va, kva);
        Ok(())
    }

    /// Links `page` and `kva` both ways and installs the hardware mapping.
    /// On failure the frame goes back to the pool and the page is untouched.
    fn link(
        &self,
        frames: &mut FrameTable,
        space: &Arc<AddressSpace>,
        page: &mut Page,
        kva: KernelAddr,
    ) -> Result<()> {
        let va = page.va();
        page.frame = Some(kva);
        frames.assign(
            kva,
            FrameOwner {
                space: Arc::downgrade(space),
                id: space.id(),
                va,
            },
        );
        if !space.mmu().install(va, kva, page.writable()) {
            page.frame = None;
            self.release_frame(frames, kva);
            return Err(VmError::DuplicateMapping(va));
        }
        Ok(())
    }

    /// A registered, still unowned frame: fresh from the pool or evicted.
    fn acquire_frame(
        &self,
        frames: &mut FrameTable,
        tables: &mut [&mut SupplementalPageTable],
    ) -> Result<KernelAddr> {
        let kva = match self.pool.alloc_user_page(false) {
            Some(kva) => kva,
            None => self.evict_frame(frames, tables)?,
        };
        frames.insert(kva);
        Ok(kva)
    }

    /// Picks a victim with the clock and swaps its page out.
    ///
    /// The returned frame is no longer in the table.
    fn evict_frame(
        &self,
        frames: &mut FrameTable,
        tables: &mut [&mut SupplementalPageTable],
    ) -> Result<KernelAddr> {
        let victim = frames.select_victim(|owner| match owner.space.upgrade() {
            Some(space) => {
                let mmu = space.mmu();
                let accessed = mmu.is_accessed(owner.va);
                if accessed {
                    mmu.set_accessed(owner.va, false);
                }
                accessed
            }
            // a dead space's frame is the best victim there is
            None => false,
        });
        let Some(Victim { entry, examined }) = victim else {
            debug!("evict: no candidate among {} frames", frames.len());
            return Err(VmError::ResourceExhausted);
        };

        let Some(owner) = entry.owner.clone() else {
            return Ok(entry.kva);
        };
        let Some(space) = owner.space.upgrade() else {
            warn!("evict: reclaiming frame {:?} of dead space {:?}", entry.kva, owner.id);
            return Ok(entry.kva);
        };

        let ctx = self.page_ctx(&space);
        let result = match tables.iter_mut().find(|spt| spt.id() == owner.id) {
            Some(spt) => Self::swap_out_page(spt, &ctx, owner.va),
            None => Self::swap_out_page(&mut space.spt.lock(), &ctx, owner.va),
        };

        match result {
            Ok(kva) => {
                debug_assert_eq!(kva, entry.kva);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "evict: space {:?} page {} out of frame {:?} ({} examined)",
                    owner.id, owner.va, kva, examined
                );
                Ok(kva)
            }
            Err(err) => {
                warn!("evict: swap out of {} in space {:?} failed: {}", owner.va, owner.id, err);
                frames.restore(entry);
                Err(err)
            }
        }
    }

    fn swap_out_page(
        spt: &mut SupplementalPageTable,
        ctx: &PageCtx<'_>,
        va: VirtAddr,
    ) -> Result<KernelAddr> {
        spt.find_mut(va).ok_or(VmError::NotFound(va))?.swap_out(ctx)
    }

    /// Unregisters `kva` and gives it back to the pool.
    pub(crate) fn release_frame(&self, frames: &mut FrameTable, kva: KernelAddr) {
        frames.remove(kva);
        // SAFETY: `kva` came from this pool and no page links to it any more.
        unsafe { self.pool.free_user_page(kva) };
    }

    /// Destroys a page detached from its table and frees its frame.
    pub(crate) fn destroy_page(
        &self,
        frames: &mut FrameTable,
        space: &AddressSpace,
        page: &mut Page,
    ) {
        let ctx = self.page_ctx(space);
        if let Some(kva) = page.destroy(&ctx) {
            self.release_frame(frames, kva);
        }
    }

    /// Copies every page of `src` into `dst`, which is normally empty.
    ///
    /// Pending pages stay pending in the child with the same initializer and
    /// loader. Materialized pages are given their own frame holding a copy of
    /// the parent's contents, claiming the parent page first if it is not
    /// resident. A failure leaves `dst` partially populated; the caller is
    /// expected to tear it down.
    pub fn spt_copy(&self, dst: &Arc<AddressSpace>, src: &Arc<AddressSpace>) -> Result<()> {
        if Arc::ptr_eq(dst, src) {
            return Err(VmError::InvalidArgument("cannot copy an address space onto itself"));
        }
        let mut frames = self.frames.lock();
        let mut src_spt = src.spt.lock();
        let mut dst_spt = dst.spt.lock();

        for va in src_spt.addresses() {
            let mut tables = [&mut *src_spt, &mut *dst_spt];
            self.copy_page(&mut frames, &mut tables, src, dst, va)?;
        }
        debug!("fork: copied {} pages from {:?} to {:?}", src_spt.len(), src.id(), dst.id());
        Ok(())
    }

    fn copy_page(
        &self,
        frames: &mut FrameTable,
        tables: &mut [&mut SupplementalPageTable],
        src: &Arc<AddressSpace>,
        dst: &Arc<AddressSpace>,
        va: VirtAddr,
    ) -> Result<()> {
        const SRC: usize = 0;
        const DST: usize = 1;

        let (writable, markers, kind, resident) = {
            let page = tables[SRC].find(va).ok_or(VmError::NotFound(va))?;
            let kind = match page.kind() {
                PageKind::Uninit(uninit) => PageKind::Uninit(uninit.clone()),
                PageKind::Anon(_) => PageKind::Anon(AnonPage::new()),
                PageKind::File(file) => PageKind::File(file.clone()),
            };
            (page.writable(), page.markers(), kind, page.is_resident())
        };
        if let PageKind::Uninit(_) = kind {
            return tables[DST].insert(Page::with_kind(va, writable, markers, kind));
        }

        if !resident {
            self.do_claim(frames, tables, SRC, src, va)?;
        }
        let src_kva = tables[SRC].find(va).and_then(Page::frame).ok_or(VmError::NotFound(va))?;
        let dirty = src.mmu().is_dirty(va);
        tables[DST].insert(Page::with_kind(va, writable, markers, kind))?;

        // The parent frame must survive the child's allocation.
        frames.set_pinned(src_kva, true);
        let acquired = self.acquire_frame(frames, tables);
        frames.set_pinned(src_kva, false);
        let dst_kva = acquired?;

        // SAFETY: two distinct live frames, both registered under our lock.
        unsafe { dst_kva.as_page_mut().copy_from_slice(src_kva.as_page()) };

        let Some(page) = tables[DST].find_mut(va) else {
            self.release_frame(frames, dst_kva);
            return Err(VmError::NotFound(va));
        };
        self.link(frames, dst, page, dst_kva)?;
        if dirty {
            dst.mmu().set_dirty(va, true);
        }
        Ok(())
    }

    /// Removes and destroys the page at `va`, freeing its frame and backing
    /// store. File pages are written back first if dirty.
    pub fn spt_remove(&self, space: &Arc<AddressSpace>, va: VirtAddr) -> Result<()> {
        let mut frames = self.frames.lock();
        let mut spt = space.spt.lock();
        let mut page = spt.take(va).ok_or(VmError::NotFound(va.page_round_down()))?;
        self.destroy_page(&mut frames, space, &mut page);
        Ok(())
    }

    /// Destroys every page of `space`. The table is left empty and usable.
    pub fn spt_teardown(&self, space: &Arc<AddressSpace>) {
        let mut frames = self.frames.lock();
        let mut spt = space.spt.lock();
        let pages = spt.take_all();
        let count = pages.len();
        for mut page in pages {
            self.destroy_page(&mut frames, space, &mut page);
        }
        debug!("space {:?}: tore down {} pages", space.id(), count);
    }

    /// Registers an executable segment for lazy loading.
    ///
    /// `read_bytes` from `file` at `offset` followed by `zero_bytes` zeros
    /// are laid out from `upage`, one pending page per page, each loaded by
    /// its own [`SegmentLoader`].
    #[allow(clippy::too_many_arguments)]
    pub fn load_segment(
        &self,
        space: &Arc<AddressSpace>,
        file: Arc<dyn VmFile>,
        offset: usize,
        upage: VirtAddr,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> Result<()> {
        if !upage.is_page_aligned() || offset % PAGE_SIZE != 0 {
            return Err(VmError::InvalidArgument("segment must start on a page boundary"));
        }
        let size = read_bytes
            .checked_add(zero_bytes)
            .ok_or(VmError::InvalidArgument("segment size overflows"))?;
        if size % PAGE_SIZE != 0 {
            return Err(VmError::InvalidArgument("segment size must be a whole number of pages"));
        }

        let mut read_left = read_bytes;
        let mut zero_left = zero_bytes;
        let mut offset = offset;
        let mut va = upage;
        let mut added: Vec<VirtAddr> = Vec::new();
        while read_left > 0 || zero_left > 0 {
            let page_read = read_left.min(PAGE_SIZE);
            let page_zero = PAGE_SIZE - page_read;

            let loader: Arc<dyn LazyLoad> =
                Arc::new(SegmentLoader::new(file.clone(), offset, page_read));
            let registered = self.alloc_page_with_initializer(
                space,
                PageInit::Anon,
                va,
                writable,
                Some(loader),
            );
            if let Err(err) = registered {
                let mut spt = space.spt.lock();
                for va in added {
                    spt.take(va);
                }
                return Err(err);
            }
            added.push(va);

            read_left -= page_read;
            zero_left -= page_zero;
            offset += page_read;
            va = va.checked_add(PAGE_SIZE).ok_or(VmError::InvalidAccess(va))?;
        }
        trace!("space {:?}: segment at {} ({} pages)", space.id(), upage, added.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::Mmu;
    use crate::page::VmType;
    use crate::sim::{HeapPool, MemSwapDevice, SoftMmu};
    use core::sync::atomic::AtomicBool;
    use mockall::mock;

    mock! {
        pub BrokenMmu {}

        impl Mmu for BrokenMmu {
            fn install(&self, va: VirtAddr, kva: KernelAddr, writable: bool) -> bool;
            fn clear(&self, va: VirtAddr);
            fn is_accessed(&self, va: VirtAddr) -> bool;
            fn set_accessed(&self, va: VirtAddr, accessed: bool);
            fn is_dirty(&self, va: VirtAddr) -> bool;
            fn set_dirty(&self, va: VirtAddr, dirty: bool);
            fn is_user_address(&self, va: VirtAddr) -> bool;
        }
    }

    fn vm_with(frames: usize, slots: usize) -> (Vm, Arc<HeapPool>) {
        let pool = Arc::new(HeapPool::new(frames));
        let swap = Arc::new(MemSwapDevice::new(slots));
        let vm = Vm::new(VmConfig::DEFAULT, pool.clone(), swap).unwrap();
        (vm, pool)
    }

    fn soft_space() -> Arc<AddressSpace> {
        AddressSpace::new(Arc::new(SoftMmu::new(VmConfig::DEFAULT)))
    }

    #[test]
    fn test_alloc_registers_without_frame() {
        let (vm, pool) = vm_with(2, 2);
        let space = soft_space();

        vm.alloc_page(&space, VirtAddr::new(0x1234), true).unwrap();
        assert_eq!(vm.frame_count(), 0);
        assert_eq!(pool.outstanding(), 0);
        let base = VirtAddr::new(0x1000);
        space.with_spt(|spt| assert_eq!(spt.find(base).unwrap().va(), base));
    }

    #[test]
    fn test_alloc_rejects_null_and_duplicates() {
        let (vm, _pool) = vm_with(2, 2);
        let space = soft_space();

        assert_eq!(
            vm.alloc_page(&space, VirtAddr::new(0x10), true),
            Err(VmError::InvalidAccess(VirtAddr::new(0)))
        );
        vm.alloc_page(&space, VirtAddr::new(0x2000), true).unwrap();
        assert_eq!(
            vm.alloc_page(&space, VirtAddr::new(0x2800), false),
            Err(VmError::DuplicateMapping(VirtAddr::new(0x2000)))
        );
    }

    #[test]
    fn test_claim_twice_keeps_frame() {
        let (vm, pool) = vm_with(2, 2);
        let space = soft_space();
        let va = VirtAddr::new(0x4000);

        vm.alloc_page(&space, va, true).unwrap();
        vm.claim_page(&space, va).unwrap();
        let first = space.with_spt(|spt| spt.find(va).unwrap().frame());
        vm.claim_page(&space, va).unwrap();

        assert_eq!(space.with_spt(|spt| spt.find(va).unwrap().frame()), first);
        assert_eq!(pool.outstanding(), 1);
        assert_eq!(vm.stats().claims, 1);
    }

    #[test]
    fn test_claim_unknown_address() {
        let (vm, _pool) = vm_with(1, 1);
        let space = soft_space();
        assert_eq!(
            vm.claim_page(&space, VirtAddr::new(0x9000)),
            Err(VmError::InvalidAccess(VirtAddr::new(0x9000)))
        );
    }

    #[test]
    fn test_install_failure_releases_frame() {
        let (vm, pool) = vm_with(2, 2);
        let mut mmu = MockBrokenMmu::new();
        mmu.expect_is_user_address().return_const(true);
        mmu.expect_install().times(1).return_const(false);
        let space = AddressSpace::new(Arc::new(mmu));
        let va = VirtAddr::new(0x5000);

        vm.alloc_page(&space, va, true).unwrap();
        assert_eq!(vm.claim_page(&space, va), Err(VmError::DuplicateMapping(va)));

        assert_eq!(vm.frame_count(), 0);
        assert_eq!(pool.outstanding(), 0);
        assert!(!space.with_spt(|spt| spt.find(va).unwrap().is_resident()));
    }

    #[test]
    fn test_exhaustion_without_victims() {
        let (vm, _pool) = vm_with(0, 2);
        let space = soft_space();
        vm.alloc_page(&space, VirtAddr::new(0x1000), true).unwrap();

        assert_eq!(vm.claim_page(&space, VirtAddr::new(0x1000)), Err(VmError::ResourceExhausted));
    }

    #[test]
    fn test_eviction_reuses_frame() {
        let (vm, pool) = vm_with(1, 4);
        let space = soft_space();
        let (a, b) = (VirtAddr::new(0x1000), VirtAddr::new(0x2000));

        vm.alloc_page(&space, a, true).unwrap();
        vm.alloc_page(&space, b, true).unwrap();
        vm.claim_page(&space, a).unwrap();
        vm.claim_page(&space, b).unwrap();

        assert_eq!(pool.outstanding(), 1);
        assert_eq!(vm.frame_count(), 1);
        assert_eq!(vm.stats().evictions, 1);
        space.with_spt(|spt| {
            assert!(!spt.find(a).unwrap().is_resident());
            assert!(spt.find(b).unwrap().is_resident());
        });
        assert_eq!(vm.swap().used(), 1);
    }

    #[test]
    fn test_dead_space_frame_is_reclaimed() {
        let (vm, pool) = vm_with(1, 1);
        let doomed = soft_space();
        vm.alloc_page(&doomed, VirtAddr::new(0x1000), true).unwrap();
        vm.claim_page(&doomed, VirtAddr::new(0x1000)).unwrap();
        drop(doomed);

        let space = soft_space();
        vm.alloc_page(&space, VirtAddr::new(0x1000), true).unwrap();
        vm.claim_page(&space, VirtAddr::new(0x1000)).unwrap();

        assert_eq!(pool.outstanding(), 1);
        assert_eq!(vm.frame_count(), 1);
        assert_eq!(vm.swap().used(), 0);
    }

    #[test]
    fn test_remove_absent_page() {
        let (vm, _pool) = vm_with(1, 1);
        let space = soft_space();
        assert_eq!(
            vm.spt_remove(&space, VirtAddr::new(0x3000)),
            Err(VmError::NotFound(VirtAddr::new(0x3000)))
        );
    }

    #[test]
    fn test_load_segment_rejects_ragged_size() {
        let (vm, _pool) = vm_with(1, 1);
        let space = soft_space();
        let file = Arc::new(crate::sim::MemFile::new(alloc::vec![1u8; 10]));

        let err = vm
            .load_segment(&space, file, 0, VirtAddr::new(0x1000), 10, 10, false)
            .unwrap_err();
        assert!(matches!(err, VmError::InvalidArgument(_)));
        space.with_spt(|spt| assert!(spt.is_empty()));
    }

    #[test]
    fn test_load_segment_rejects_overflowing_size() {
        let (vm, _pool) = vm_with(1, 1);
        let space = soft_space();
        let file = Arc::new(crate::sim::MemFile::new(alloc::vec![1u8; 10]));

        assert_eq!(
            vm.load_segment(&space, file, 0, VirtAddr::new(0x1000), usize::MAX, PAGE_SIZE, false),
            Err(VmError::InvalidArgument("segment size overflows"))
        );
        space.with_spt(|spt| assert!(spt.is_empty()));
    }

    struct FailOnce(AtomicBool);

    impl LazyLoad for FailOnce {
        fn load(&self, _page: &Page, frame: &mut [u8]) -> Result<()> {
            if !self.0.swap(true, Ordering::SeqCst) {
                return Err(VmError::BackingStore("device busy"));
            }
            frame[0] = 0x99;
            Ok(())
        }
    }

    #[test]
    fn test_claim_retries_after_loader_failure() {
        let (vm, pool) = vm_with(1, 1);
        let mmu = Arc::new(SoftMmu::new(VmConfig::DEFAULT));
        let space = AddressSpace::new(mmu.clone());
        let va = VirtAddr::new(0x1000);
        let loader: Arc<dyn LazyLoad> = Arc::new(FailOnce(AtomicBool::new(false)));

        vm.alloc_page_with_initializer(&space, PageInit::Anon, va, true, Some(loader)).unwrap();
        assert_eq!(vm.claim_page(&space, va), Err(VmError::BackingStore("device busy")));
        assert_eq!(pool.outstanding(), 0);
        space.with_spt(|spt| {
            assert_eq!(spt.find(va).unwrap().operations_type(), VmType::Uninit);
        });

        vm.claim_page(&space, va).unwrap();
        let mut byte = [0u8; 1];
        assert!(mmu.read_user(va, &mut byte));
        assert_eq!(byte[0], 0x99);
    }
}
