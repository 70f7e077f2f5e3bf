//! Supplemental page table
//!
//! Per-process index from page-aligned virtual address to [`Page`]. The
//! table owns its pages; everything else refers to a page by its key.

use alloc::vec::Vec;
use hashbrown::HashMap;

use crate::addr::VirtAddr;
use crate::error::{Result, VmError};
use crate::page::Page;
use crate::space::SpaceId;

/// Pages of one address space, keyed by page address
#[derive(Debug)]
pub struct SupplementalPageTable {
    id: SpaceId,
    pages: HashMap<VirtAddr, Page>,
}

impl SupplementalPageTable {
    /// Create an empty table for space `id`
    pub fn new(id: SpaceId) -> Self {
        Self {
            id,
            pages: HashMap::new(),
        }
    }

    /// Id of the owning space
    pub fn id(&self) -> SpaceId {
        self.id
    }

    /// Page containing `va`
    pub fn find(&self, va: VirtAddr) -> Option<&Page> {
        self.pages.get(&va.page_round_down())
    }

    /// Page containing `va`, mutably
    pub fn find_mut(&mut self, va: VirtAddr) -> Option<&mut Page> {
        self.pages.get_mut(&va.page_round_down())
    }

    /// Adds `page`. Fails, leaving the table unchanged, if its address is
    /// already taken.
    pub fn insert(&mut self, page: Page) -> Result<()> {
        let va = page.va();
        if self.pages.contains_key(&va) {
            return Err(VmError::DuplicateMapping(va));
        }
        self.pages.insert(va, page);
        Ok(())
    }

    /// Detaches the page containing `va` without destroying it.
    pub(crate) fn take(&mut self, va: VirtAddr) -> Option<Page> {
        self.pages.remove(&va.page_round_down())
    }

    /// Detaches every page.
    pub(crate) fn take_all(&mut self) -> Vec<Page> {
        self.pages.drain().map(|(_, page)| page).collect()
    }

    /// Number of pages
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Returns true if the table holds no page
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Iterate over the pages in no particular order
    pub fn iter(&self) -> impl Iterator<Item = &Page> {
        self.pages.values()
    }

    /// Page addresses in ascending order
    pub fn addresses(&self) -> Vec<VirtAddr> {
        let mut vas: Vec<VirtAddr> = self.pages.keys().copied().collect();
        vas.sort_unstable();
        vas
    }

    /// Number of pages with a frame attached
    pub fn resident_count(&self) -> usize {
        self.pages.values().filter(|page| page.is_resident()).count()
    }
}
