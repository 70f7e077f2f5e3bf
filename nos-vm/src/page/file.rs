//! File-backed pages

use alloc::sync::Arc;
use core::fmt;
use spin::Mutex;

use super::{PageCtx, PageOperations, VmType};
use crate::addr::{PAGE_SIZE, VirtAddr};
use crate::error::{Result, VmError};
use crate::hal::VmFile;

/// Serializes every access to file contents
pub static FILESYS_LOCK: Mutex<()> = Mutex::new(());

/// Where one page of a mapped file comes from
#[derive(Clone)]
pub struct FileMapping {
    /// Backing file
    pub file: Arc<dyn VmFile>,
    /// File offset of the first byte of the page
    pub offset: usize,
    /// Bytes read from the file; the rest of the page is zero
    pub read_bytes: usize,
    /// Start address of the mapping this page belongs to
    pub region: VirtAddr,
}

impl FileMapping {
    /// Describes one page of a mapping.
    pub fn new(file: Arc<dyn VmFile>, offset: usize, read_bytes: usize, region: VirtAddr) -> Self {
        Self {
            file,
            offset,
            read_bytes: read_bytes.min(PAGE_SIZE),
            region,
        }
    }

    /// Bytes of the page past the end of the file data
    pub fn zero_bytes(&self) -> usize {
        PAGE_SIZE - self.read_bytes
    }

    /// Reads the page into `frame` and zeroes the tail.
    pub(crate) fn load(&self, frame: &mut [u8]) -> Result<()> {
        let read = {
            let _fs = FILESYS_LOCK.lock();
            self.file.read_at(&mut frame[..self.read_bytes], self.offset)
        };
        if read != self.read_bytes {
            return Err(VmError::BackingStore("short read from mapped file"));
        }
        frame[self.read_bytes..].fill(0);
        Ok(())
    }

    /// Writes the file part of `frame` back.
    pub(crate) fn write_back(&self, frame: &[u8]) -> Result<()> {
        let written = {
            let _fs = FILESYS_LOCK.lock();
            self.file.write_at(&frame[..self.read_bytes], self.offset)
        };
        if written != self.read_bytes {
            return Err(VmError::BackingStore("short write to mapped file"));
        }
        Ok(())
    }
}

impl fmt::Debug for FileMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileMapping")
            .field("offset", &self.offset)
            .field("read_bytes", &self.read_bytes)
            .field("region", &self.region)
            .finish()
    }
}

/// Payload of a file-backed page
#[derive(Debug, Clone)]
pub struct FilePage {
    mapping: FileMapping,
}

impl FilePage {
    /// Page backed by `mapping`
    pub fn new(mapping: FileMapping) -> Self {
        Self { mapping }
    }

    /// Backing mapping
    pub fn mapping(&self) -> &FileMapping {
        &self.mapping
    }
}

impl PageOperations for FilePage {
    fn swap_in(&mut self, _ctx: &PageCtx<'_>, _va: VirtAddr, frame: &mut [u8]) -> Result<()> {
        self.mapping.load(frame)
    }

    fn swap_out(
        &mut self,
        _ctx: &PageCtx<'_>,
        va: VirtAddr,
        frame: &[u8],
        dirty: bool,
    ) -> Result<()> {
        if dirty {
            self.mapping.write_back(frame)?;
            log::trace!("file page {} written back at offset {:#x}", va, self.mapping.offset);
        }
        Ok(())
    }

    fn destroy(&mut self, ctx: &PageCtx<'_>, va: VirtAddr, frame: Option<&[u8]>) {
        let Some(frame) = frame else { return };
        if ctx.mmu.is_dirty(va) {
            if let Err(err) = self.mapping.write_back(frame) {
                log::warn!("file page {} lost on unmap: {}", va, err);
            }
        }
    }

    fn vm_type(&self) -> VmType {
        VmType::File
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::KernelAddr;
    use crate::config::VmConfig;
    use crate::hal::Mmu;
    use crate::page::{Page, PageKind, PageMarkers, SwapTable};
    use crate::sim::{MemFile, MemSwapDevice, SoftMmu};
    use alloc::vec;
    use alloc::vec::Vec;

    fn fixture() -> (SoftMmu, SwapTable, Arc<MemFile>) {
        let data: Vec<u8> = (0..PAGE_SIZE + 100).map(|i| (i % 13) as u8).collect();
        (
            SoftMmu::new(VmConfig::DEFAULT),
            SwapTable::new(Arc::new(MemSwapDevice::new(1))),
            Arc::new(MemFile::new(data)),
        )
    }

    #[test]
    fn test_partial_page_is_zero_padded() {
        let (_, _, file) = fixture();
        let mapping = FileMapping::new(file.clone(), PAGE_SIZE, 100, VirtAddr::new(0x1000));
        let mut frame = vec![0xEEu8; PAGE_SIZE];

        mapping.load(&mut frame).unwrap();
        assert_eq!(mapping.zero_bytes(), PAGE_SIZE - 100);
        assert_eq!(&frame[..100], &file.contents()[PAGE_SIZE..]);
        assert!(frame[100..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_clean_page_skips_write_back() {
        let (mmu, swap, file) = fixture();
        let ctx = PageCtx { mmu: &mmu, swap: &swap };
        let va = VirtAddr::new(0x1000);
        let mut page = FilePage::new(FileMapping::new(file.clone(), 0, PAGE_SIZE, va));

        let frame = vec![0x55u8; PAGE_SIZE];
        page.swap_out(&ctx, va, &frame, false).unwrap();
        assert_ne!(file.contents()[0], 0x55);
    }

    #[test]
    fn test_dirty_page_written_back() {
        let (mmu, swap, file) = fixture();
        let ctx = PageCtx { mmu: &mmu, swap: &swap };
        let va = VirtAddr::new(0x1000);
        let mut page = FilePage::new(FileMapping::new(file.clone(), 0, PAGE_SIZE, va));

        let frame = vec![0x55u8; PAGE_SIZE];
        page.swap_out(&ctx, va, &frame, true).unwrap();
        assert!(file.contents()[..PAGE_SIZE].iter().all(|&b| b == 0x55));
    }

    #[test]
    fn test_evicted_dirty_page_written_back_and_unmapped() {
        let (mmu, swap, file) = fixture();
        let ctx = PageCtx { mmu: &mmu, swap: &swap };
        let va = VirtAddr::new(0x1000);
        let mut frame = vec![0x55u8; PAGE_SIZE];
        let kva = KernelAddr::new(frame.as_mut_ptr() as usize);
        let mapping = FileMapping::new(file.clone(), 0, PAGE_SIZE, va);
        let kind = PageKind::File(FilePage::new(mapping));
        let mut page = Page::with_kind(va, true, PageMarkers::MMAP, kind);
        page.frame = Some(kva);

        assert!(mmu.install(va, kva, true));
        mmu.set_dirty(va, true);
        assert_eq!(page.swap_out(&ctx), Ok(kva));

        assert!(file.contents()[..PAGE_SIZE].iter().all(|&b| b == 0x55));
        assert_eq!(mmu.translate(va), None);
        assert_eq!(page.frame(), None);
    }
}
