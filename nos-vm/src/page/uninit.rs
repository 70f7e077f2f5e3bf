//! Pending pages and the lazy materialization shim

use alloc::sync::Arc;
use core::fmt;

use super::file::{FILESYS_LOCK, FileMapping, FilePage};
use super::{AnonPage, Page, PageCtx, PageKind, VmType};
use crate::addr::{PAGE_SIZE, VirtAddr};
use crate::error::{Result, VmError};
use crate::hal::VmFile;

/// Callback that fills a freshly materialized page
///
/// Registered when the page is allocated and run once, on first claim,
/// after the variant initializer has prepared the frame. Any state it needs
/// lives in the implementor.
pub trait LazyLoad: Send + Sync {
    /// Populates `frame`, the contents of `page`.
    fn load(&self, page: &Page, frame: &mut [u8]) -> Result<()>;
}

/// What an uninit page turns into
#[derive(Debug, Clone)]
pub enum PageInit {
    /// Zero-filled anonymous memory
    Anon,
    /// A page of a mapped file
    File(FileMapping),
}

impl PageInit {
    /// Variant the page becomes
    pub fn vm_type(&self) -> VmType {
        match self {
            PageInit::Anon => VmType::Anon,
            PageInit::File(_) => VmType::File,
        }
    }

    /// Prepares `frame` and builds the payload of the target variant.
    fn initialize(self, va: VirtAddr, frame: &mut [u8]) -> Result<PageKind> {
        match self {
            PageInit::Anon => {
                frame.fill(0);
                Ok(PageKind::Anon(AnonPage::new()))
            }
            PageInit::File(mapping) => {
                mapping.load(frame).map_err(|err| {
                    log::warn!("file page {} failed to load: {}", va, err);
                    err
                })?;
                Ok(PageKind::File(FilePage::new(mapping)))
            }
        }
    }
}

/// Payload of a page that has not been touched yet
#[derive(Clone)]
pub struct UninitPage {
    target: PageInit,
    loader: Option<Arc<dyn LazyLoad>>,
}

impl UninitPage {
    /// Describes a pending page.
    pub fn new(target: PageInit, loader: Option<Arc<dyn LazyLoad>>) -> Self {
        Self { target, loader }
    }

    /// Target variant
    pub fn target(&self) -> &PageInit {
        &self.target
    }

    /// Returns true if a content loader is registered
    pub fn has_loader(&self) -> bool {
        self.loader.is_some()
    }

    /// Nothing to release: an untouched page owns no backing store.
    pub(crate) fn destroy(&mut self) {}
}

impl fmt::Debug for UninitPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UninitPage")
            .field("target", &self.target)
            .field("loader", &self.loader.is_some())
            .finish()
    }
}

/// First-claim handler of an uninit page.
///
/// Runs the target initializer, which replaces the payload, then the
/// registered loader. Either failing fails the claim and leaves the page
/// uninit, so a later claim starts over.
pub(crate) fn initialize(page: &mut Page, _ctx: &PageCtx<'_>, frame: &mut [u8]) -> Result<()> {
    let PageKind::Uninit(uninit) = &page.kind else {
        return Err(VmError::InvalidArgument("page is already materialized"));
    };
    let target = uninit.target.clone();
    let loader = uninit.loader.clone();

    let kind = target.initialize(page.va, frame)?;
    let pending = core::mem::replace(&mut page.kind, kind);
    log::trace!("page {} materialized as {}", page.va, page.operations_type());

    let Some(loader) = loader else {
        return Ok(());
    };
    loader.load(page, frame).inspect_err(|_| page.kind = pending)
}

/// Loads one page of an executable segment on first touch
pub struct SegmentLoader {
    file: Arc<dyn VmFile>,
    offset: usize,
    read_bytes: usize,
}

impl SegmentLoader {
    /// Reads `read_bytes` at `offset`; the rest of the page is zeroed.
    pub fn new(file: Arc<dyn VmFile>, offset: usize, read_bytes: usize) -> Self {
        Self {
            file,
            offset,
            read_bytes: read_bytes.min(PAGE_SIZE),
        }
    }
}

impl LazyLoad for SegmentLoader {
    fn load(&self, page: &Page, frame: &mut [u8]) -> Result<()> {
        let read = {
            let _fs = FILESYS_LOCK.lock();
            self.file.read_at(&mut frame[..self.read_bytes], self.offset)
        };
        if read != self.read_bytes {
            log::warn!(
                "segment page {}: short read {} of {} at offset {:#x}",
                page.va(),
                read,
                self.read_bytes,
                self.offset
            );
            return Err(VmError::BackingStore("short read loading segment"));
        }
        frame[self.read_bytes..].fill(0);
        Ok(())
    }
}
