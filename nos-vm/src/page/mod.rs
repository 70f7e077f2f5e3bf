//! Virtual pages and their backing variants
//!
//! Every page is born [`PageKind::Uninit`]: it records what it will become
//! and, optionally, a [`LazyLoad`] callback that fills its contents. The
//! first claim runs the uninit shim, which replaces the payload in place with
//! an [`AnonPage`] or a [`FilePage`]. The page keeps its identity (its SPT
//! key) across the transition.
//!
//! The concrete variants implement [`PageOperations`]; [`Page`] dispatches
//! to them and takes care of the frame link and the hardware mapping.

pub mod anon;
pub mod file;
pub mod uninit;

use core::fmt;

use bitflags::bitflags;

use crate::addr::{KernelAddr, VirtAddr};
use crate::error::{Result, VmError};
use crate::hal::Mmu;

pub use anon::{AnonPage, SwapSlot, SwapTable};
pub use file::{FileMapping, FilePage};
pub use uninit::{LazyLoad, PageInit, SegmentLoader, UninitPage};

/// Page variant, as reported by [`Page::vm_type`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmType {
    /// Not materialized yet
    Uninit,
    /// Swap-backed
    Anon,
    /// Backed by a mapped file
    File,
}

bitflags! {
    /// Extra facts about a page that do not change its backing
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PageMarkers: u8 {
        /// Part of the user stack
        const STACK = 1 << 0;
        /// Part of a memory-mapped file region
        const MMAP = 1 << 1;
    }
}

/// What a page operation may touch besides the page itself
pub struct PageCtx<'a> {
    /// Page table of the space that owns the page
    pub mmu: &'a dyn Mmu,
    /// Swap area for anonymous pages
    pub swap: &'a SwapTable,
}

/// Operations every materialized page variant supplies
pub trait PageOperations {
    /// Fills `frame` with the page contents from backing store.
    fn swap_in(&mut self, ctx: &PageCtx<'_>, va: VirtAddr, frame: &mut [u8]) -> Result<()>;

    /// Persists `frame` to backing store so the frame can be reused.
    ///
    /// The page is already unmapped; `dirty` is its hardware dirty bit as
    /// sampled just before. A clean page may skip the write.
    fn swap_out(
        &mut self,
        ctx: &PageCtx<'_>,
        va: VirtAddr,
        frame: &[u8],
        dirty: bool,
    ) -> Result<()>;

    /// Releases backing-store resources. `frame` is the page contents if the
    /// page is resident.
    fn destroy(&mut self, ctx: &PageCtx<'_>, va: VirtAddr, frame: Option<&[u8]>);

    /// Variant tag
    fn vm_type(&self) -> VmType;
}

/// Variant payload of a page
#[derive(Debug)]
pub enum PageKind {
    /// Pending materialization
    Uninit(UninitPage),
    /// Anonymous memory
    Anon(AnonPage),
    /// File-backed memory
    File(FilePage),
}

/// One virtual page of a process
#[derive(Debug)]
pub struct Page {
    pub(crate) va: VirtAddr,
    pub(crate) writable: bool,
    pub(crate) markers: PageMarkers,
    pub(crate) kind: PageKind,
    pub(crate) frame: Option<KernelAddr>,
}

impl Page {
    /// Creates a pending page at the page containing `va`.
    pub fn new_uninit(
        va: VirtAddr,
        writable: bool,
        markers: PageMarkers,
        uninit: UninitPage,
    ) -> Self {
        Self::with_kind(va, writable, markers, PageKind::Uninit(uninit))
    }

    /// Creates a non-resident page with an explicit payload.
    pub(crate) fn with_kind(
        va: VirtAddr,
        writable: bool,
        markers: PageMarkers,
        kind: PageKind,
    ) -> Self {
        Self {
            va: va.page_round_down(),
            writable,
            markers,
            kind,
            frame: None,
        }
    }

    /// Page-aligned virtual address
    pub fn va(&self) -> VirtAddr {
        self.va
    }

    /// Whether user code may write the page
    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Page markers
    pub fn markers(&self) -> PageMarkers {
        self.markers
    }

    /// Variant payload
    pub fn kind(&self) -> &PageKind {
        &self.kind
    }

    /// Frame currently backing the page
    pub fn frame(&self) -> Option<KernelAddr> {
        self.frame
    }

    /// Returns true if a frame backs the page
    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    /// Type the page has or will have once materialized
    pub fn vm_type(&self) -> VmType {
        match &self.kind {
            PageKind::Uninit(uninit) => uninit.target().vm_type(),
            PageKind::Anon(anon) => anon.vm_type(),
            PageKind::File(file) => file.vm_type(),
        }
    }

    /// Type of the current payload; `Uninit` until first claim
    pub fn operations_type(&self) -> VmType {
        match &self.kind {
            PageKind::Uninit(_) => VmType::Uninit,
            PageKind::Anon(anon) => anon.vm_type(),
            PageKind::File(file) => file.vm_type(),
        }
    }

    /// Start of the mmap region the page belongs to, if any
    pub fn mmap_region(&self) -> Option<VirtAddr> {
        match &self.kind {
            PageKind::File(file) => Some(file.mapping().region),
            PageKind::Uninit(uninit) => match uninit.target() {
                PageInit::File(mapping) => Some(mapping.region),
                PageInit::Anon => None,
            },
            PageKind::Anon(_) => None,
        }
    }

    /// Loads the page into `frame`, which is already linked and mapped.
    pub(crate) fn swap_in(&mut self, ctx: &PageCtx<'_>, frame: &mut [u8]) -> Result<()> {
        if matches!(self.kind, PageKind::Uninit(_)) {
            return uninit::initialize(self, ctx, frame);
        }
        let va = self.va;
        match &mut self.kind {
            PageKind::Anon(anon) => anon.swap_in(ctx, va, frame),
            PageKind::File(file) => file.swap_in(ctx, va, frame),
            PageKind::Uninit(_) => unreachable!(),
        }
    }

    /// Unmaps the page, writes it out and detaches its frame.
    ///
    /// The mapping goes first so no user store can land in the frame after
    /// it has been copied out. Returns the now unused frame. On error the
    /// mapping is put back and the page stays resident.
    pub(crate) fn swap_out(&mut self, ctx: &PageCtx<'_>) -> Result<KernelAddr> {
        let kva = self.frame.ok_or(VmError::NotFound(self.va))?;
        let va = self.va;
        if matches!(self.kind, PageKind::Uninit(_)) {
            return Err(VmError::InvalidArgument("uninit page cannot be resident"));
        }

        let dirty = ctx.mmu.unmap(va);

        // SAFETY: a linked frame is a live pool page owned by this page, and
        // nothing maps it any more.
        let contents = unsafe { kva.as_page() };
        let result = match &mut self.kind {
            PageKind::Anon(anon) => anon.swap_out(ctx, va, contents, dirty),
            PageKind::File(file) => file.swap_out(ctx, va, contents, dirty),
            PageKind::Uninit(_) => unreachable!(),
        };
        if let Err(err) = result {
            if ctx.mmu.install(va, kva, self.writable) {
                ctx.mmu.set_dirty(va, dirty);
            } else {
                log::warn!("page {}: mapping lost after failed swap out", va);
            }
            return Err(err);
        }

        self.frame = None;
        Ok(kva)
    }

    /// Releases everything the page holds. Returns the frame the caller must
    /// give back to the pool, if the page was resident.
    pub(crate) fn destroy(&mut self, ctx: &PageCtx<'_>) -> Option<KernelAddr> {
        let frame = self.frame.take();
        // SAFETY: as in `swap_out`; the frame is still linked until returned.
        let contents = frame.map(|kva| unsafe { kva.as_page() });
        let va = self.va;
        match &mut self.kind {
            PageKind::Uninit(uninit) => uninit.destroy(),
            PageKind::Anon(anon) => anon.destroy(ctx, va, contents),
            PageKind::File(file) => file.destroy(ctx, va, contents),
        }
        if frame.is_some() {
            ctx.mmu.clear(va);
        }
        frame
    }
}

impl fmt::Display for VmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmType::Uninit => write!(f, "uninit"),
            VmType::Anon => write!(f, "anon"),
            VmType::File => write!(f, "file"),
        }
    }
}
