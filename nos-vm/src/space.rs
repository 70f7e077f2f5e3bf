//! Per-process address space

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;

use crate::hal::Mmu;
use crate::spt::SupplementalPageTable;

static NEXT_SPACE_ID: AtomicUsize = AtomicUsize::new(1);

/// Unique id of an address space
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpaceId(usize);

impl SpaceId {
    fn next() -> Self {
        Self(NEXT_SPACE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wraps a raw id
    pub const fn from_raw(id: usize) -> Self {
        Self(id)
    }

    /// Raw id value
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

/// The virtual memory state of one process: its supplemental page table
/// and its hardware page table handle.
///
/// Lock order: the global frame table lock is always taken before `spt`,
/// never after.
pub struct AddressSpace {
    id: SpaceId,
    pub(crate) spt: Mutex<SupplementalPageTable>,
    mmu: Arc<dyn Mmu>,
}

impl AddressSpace {
    /// Create an empty address space over `mmu`
    pub fn new(mmu: Arc<dyn Mmu>) -> Arc<Self> {
        let id = SpaceId::next();
        Arc::new(Self {
            id,
            spt: Mutex::new(SupplementalPageTable::new(id)),
            mmu,
        })
    }

    /// Space id
    pub fn id(&self) -> SpaceId {
        self.id
    }

    /// Hardware page table handle
    pub fn mmu(&self) -> &dyn Mmu {
        &*self.mmu
    }

    /// Runs `f` with the supplemental page table locked.
    ///
    /// The closure must not call back into [`Vm`](crate::vm::Vm): every `Vm`
    /// operation takes the frame table and then this same lock.
    pub fn with_spt<R>(&self, f: impl FnOnce(&SupplementalPageTable) -> R) -> R {
        f(&self.spt.lock())
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace").field("id", &self.id).finish()
    }
}
