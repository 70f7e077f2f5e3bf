//! Frame table and clock victim selection
//!
//! The frame table lists every frame handed to a user page, across all
//! processes. It is the eviction candidate pool: the clock hand walks it in
//! order, giving each recently accessed frame a second chance.
//!
//! The table itself only does bookkeeping. Locking, accessed-bit checks and
//! the actual eviction live in [`crate::vm`].

extern crate alloc;

use alloc::sync::Weak;
use alloc::vec::Vec;

use crate::addr::{KernelAddr, VirtAddr};
use crate::space::{AddressSpace, SpaceId};

/// Page currently occupying a frame
#[derive(Debug, Clone)]
pub struct FrameOwner {
    /// Owning address space
    pub space: Weak<AddressSpace>,
    /// Id of the owning space, valid even after the space is gone
    pub id: SpaceId,
    /// Virtual address of the page in that space
    pub va: VirtAddr,
}

/// One frame in the table
#[derive(Debug, Clone)]
pub struct FrameEntry {
    /// Kernel mapping of the frame
    pub kva: KernelAddr,
    /// Occupying page; `None` only between allocation and assignment
    pub owner: Option<FrameOwner>,
    /// Pinned frames are never chosen as victims
    pub pinned: bool,
}

/// Frame chosen by [`FrameTable::select_victim`], already removed
#[derive(Debug)]
pub struct Victim {
    /// The removed entry
    pub entry: FrameEntry,
    /// Number of entries the hand visited to find it
    pub examined: usize,
}

/// Registry of frames backing resident user pages
#[derive(Debug, Default)]
pub struct FrameTable {
    entries: Vec<FrameEntry>,
    /// Clock hand: index of the next entry to examine
    hand: usize,
}

impl FrameTable {
    /// Create an empty frame table
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            hand: 0,
        }
    }

    /// Number of frames in the table
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no frame is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current clock hand position
    pub fn hand(&self) -> usize {
        self.hand
    }

    /// Iterate over the registered frames in clock order
    pub fn iter(&self) -> impl Iterator<Item = &FrameEntry> {
        self.entries.iter()
    }

    /// Entry for `kva`
    pub fn get(&self, kva: KernelAddr) -> Option<&FrameEntry> {
        self.entries.iter().find(|entry| entry.kva == kva)
    }

    fn position(&self, kva: KernelAddr) -> Option<usize> {
        self.entries.iter().position(|entry| entry.kva == kva)
    }

    /// Registers a fresh frame with no owner yet.
    pub fn insert(&mut self, kva: KernelAddr) {
        debug_assert!(self.position(kva).is_none(), "frame {:?} registered twice", kva);
        self.entries.push(FrameEntry {
            kva,
            owner: None,
            pinned: false,
        });
    }

    /// Puts a victim back where the scan took it from; the hand points at
    /// it again.
    pub fn restore(&mut self, entry: FrameEntry) {
        debug_assert!(self.position(entry.kva).is_none(), "frame {:?} registered twice", entry.kva);
        let index = self.hand.min(self.entries.len());
        self.entries.insert(index, entry);
        self.hand = index;
    }

    /// Records the page occupying `kva`. Returns false if `kva` is unknown.
    pub fn assign(&mut self, kva: KernelAddr, owner: FrameOwner) -> bool {
        match self.entries.iter_mut().find(|entry| entry.kva == kva) {
            Some(entry) => {
                entry.owner = Some(owner);
                true
            }
            None => false,
        }
    }

    /// Pins or unpins `kva`. Returns false if `kva` is unknown.
    pub fn set_pinned(&mut self, kva: KernelAddr, pinned: bool) -> bool {
        match self.entries.iter_mut().find(|entry| entry.kva == kva) {
            Some(entry) => {
                entry.pinned = pinned;
                true
            }
            None => false,
        }
    }

    /// Unregisters `kva`, keeping the hand on the same next entry.
    pub fn remove(&mut self, kva: KernelAddr) -> Option<FrameEntry> {
        let index = self.position(kva)?;
        if index < self.hand {
            self.hand -= 1;
        }
        let entry = self.entries.remove(index);
        if self.hand >= self.entries.len() {
            self.hand = 0;
        }
        Some(entry)
    }

    /// Second-chance scan from the clock hand.
    ///
    /// `test_and_clear` returns the accessed bit of an owner's page and
    /// clears it. Entries without an owner and pinned entries are skipped.
    /// The first owned, unpinned entry found with the bit clear is removed
    /// and returned; the hand is left on the entry that followed it.
    ///
    /// At most two full turns are made, so the scan always terminates.
    /// `None` means no frame can be evicted.
    pub fn select_victim<F>(&mut self, mut test_and_clear: F) -> Option<Victim>
    where
        F: FnMut(&FrameOwner) -> bool,
    {
        let total = self.entries.len();
        let mut examined = 0;

        while examined < 2 * total {
            if self.hand >= self.entries.len() {
                self.hand = 0;
            }
            let index = self.hand;
            self.hand += 1;
            examined += 1;

            let entry = &self.entries[index];
            if entry.pinned {
                continue;
            }
            let Some(owner) = entry.owner.as_ref() else {
                continue;
            };
            if test_and_clear(owner) {
                continue;
            }

            let entry = self.entries.remove(index);
            self.hand = index;
            if self.hand >= self.entries.len() {
                self.hand = 0;
            }
            return Some(Victim { entry, examined });
        }
        None
    }
}
