//! Memory-mapped files

use alloc::sync::Arc;
use alloc::vec::Vec;
use log::debug;

use crate::addr::{PAGE_SIZE, VirtAddr, page_round_down};
use crate::error::{Result, VmError};
use crate::hal::VmFile;
use crate::page::file::FILESYS_LOCK;
use crate::page::{FileMapping, PageInit, PageMarkers};
use crate::space::AddressSpace;
use crate::vm::Vm;

impl Vm {
    /// Maps `length` bytes of `file` from `offset` at `addr`.
    ///
    /// Pages are registered lazily; each one reads its share of the file on
    /// first touch and zero-fills past the end of the file. Returns `addr`,
    /// which identifies the mapping for [`Vm::munmap`].
    pub fn mmap(
        &self,
        space: &Arc<AddressSpace>,
        addr: VirtAddr,
        length: usize,
        writable: bool,
        file: Arc<dyn VmFile>,
        offset: usize,
    ) -> Result<VirtAddr> {
        if addr.is_null() || !addr.is_page_aligned() {
            return Err(VmError::InvalidArgument("mmap address must be non-null and page-aligned"));
        }
        if length == 0 {
            return Err(VmError::InvalidArgument("mmap length must be non-zero"));
        }
        if offset % PAGE_SIZE != 0 {
            return Err(VmError::InvalidArgument("mmap offset must be page-aligned"));
        }
        let file_len = {
            let _fs = FILESYS_LOCK.lock();
            file.len()
        };
        if file_len <= offset {
            return Err(VmError::InvalidArgument("mmap of an empty file range"));
        }

        let span = length
            .checked_add(PAGE_SIZE - 1)
            .map(page_round_down)
            .ok_or(VmError::InvalidArgument("mmap range overflows"))?;
        addr.checked_add(span).ok_or(VmError::InvalidArgument("mmap range overflows"))?;
        let pages = span / PAGE_SIZE;
        {
            let spt = space.spt.lock();
            for i in 0..pages {
                let va = VirtAddr::new(addr.as_usize() + i * PAGE_SIZE);
                if !space.mmu().is_user_address(va) || self.config.in_stack_window(va) {
                    return Err(VmError::InvalidArgument(
                        "mmap range outside the mappable user space",
                    ));
                }
                if spt.find(va).is_some() {
                    return Err(VmError::InvalidArgument("mmap range overlaps existing pages"));
                }
            }
        }

        let mut remaining = length.min(file_len - offset);
        for i in 0..pages {
            let va = VirtAddr::new(addr.as_usize() + i * PAGE_SIZE);
            let read_bytes = remaining.min(PAGE_SIZE);
            let mapping =
                FileMapping::new(file.clone(), offset + i * PAGE_SIZE, read_bytes, addr);
            let init = PageInit::File(mapping);
            let marked =
                self.alloc_page_marked(space, init, va, writable, PageMarkers::MMAP, None);
            if let Err(err) = marked {
                // drop the pages registered so far; none has a frame yet
                let mut spt = space.spt.lock();
                for done in 0..i {
                    spt.take(VirtAddr::new(addr.as_usize() + done * PAGE_SIZE));
                }
                return Err(err);
            }
            remaining -= read_bytes;
        }

        debug!(
            "space {:?}: mmap {} pages at {} (offset {:#x})",
            space.id(),
            pages,
            addr,
            offset
        );
        Ok(addr)
    }

    /// Removes the mapping created by `mmap` at `addr`, writing dirty
    /// resident pages back to the file.
    pub fn munmap(&self, space: &Arc<AddressSpace>, addr: VirtAddr) -> Result<()> {
        let mut frames = self.frames.lock();
        let mut spt = space.spt.lock();
        let vas: Vec<VirtAddr> = spt
            .iter()
            .filter(|page| page.mmap_region() == Some(addr))
            .map(|page| page.va())
            .collect();
        if vas.is_empty() {
            return Err(VmError::NotFound(addr));
        }

        for va in &vas {
            if let Some(mut page) = spt.take(*va) {
                self.destroy_page(&mut frames, space, &mut page);
            }
        }
        debug!("space {:?}: munmap {} pages at {}", space.id(), vas.len(), addr);
        Ok(())
    }
}
