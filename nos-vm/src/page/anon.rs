//! Anonymous pages and the swap area

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use super::{PageCtx, PageOperations, VmType};
use crate::addr::VirtAddr;
use crate::error::{Result, VmError};
use crate::hal::SwapDevice;

/// Index of one page-sized slot on the swap device
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(usize);

impl SwapSlot {
    /// Slot index on the device
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Slot allocator over a swap device
///
/// One bit per slot; the bitmap lock is held across device I/O so slot
/// state and device contents never disagree.
pub struct SwapTable {
    device: Arc<dyn SwapDevice>,
    /// Bitmap of used slots (1 bit per slot)
    bitmap: Mutex<Vec<u64>>,
    slots: usize,
}

impl SwapTable {
    /// Create a swap table covering every slot of `device`
    pub fn new(device: Arc<dyn SwapDevice>) -> Self {
        let slots = device.slot_count();
        let mut bitmap = Vec::with_capacity(slots.div_ceil(64));
        bitmap.resize(slots.div_ceil(64), 0);
        Self {
            device,
            bitmap: Mutex::new(bitmap),
            slots,
        }
    }

    /// Total number of slots
    pub fn capacity(&self) -> usize {
        self.slots
    }

    /// Number of slots holding a page
    pub fn used(&self) -> usize {
        self.bitmap.lock().iter().map(|word| word.count_ones() as usize).sum()
    }

    /// Writes `frame` to a free slot.
    pub fn swap_out(&self, frame: &[u8]) -> Result<SwapSlot> {
        let mut bitmap = self.bitmap.lock();
        let slot = (0..self.slots)
            .find(|&i| bitmap[i / 64] & (1 << (i % 64)) == 0)
            .ok_or(VmError::BackingStore("swap space exhausted"))?;

        self.device.write_slot(slot, frame)?;
        bitmap[slot / 64] |= 1 << (slot % 64);
        Ok(SwapSlot(slot))
    }

    /// Reads `slot` back into `frame` and frees the slot.
    pub fn swap_in(&self, slot: SwapSlot, frame: &mut [u8]) -> Result<()> {
        let mut bitmap = self.bitmap.lock();
        self.device.read_slot(slot.0, frame)?;
        bitmap[slot.0 / 64] &= !(1 << (slot.0 % 64));
        Ok(())
    }

    /// Frees `slot` without reading it.
    pub fn free(&self, slot: SwapSlot) {
        let mut bitmap = self.bitmap.lock();
        bitmap[slot.0 / 64] &= !(1 << (slot.0 % 64));
    }
}

/// Payload of a swap-backed page
#[derive(Debug, Default)]
pub struct AnonPage {
    /// Where the contents live while the page is not resident
    slot: Option<SwapSlot>,
}

impl AnonPage {
    /// A page with no swapped-out contents
    pub fn new() -> Self {
        Self { slot: None }
    }

    /// Swap slot holding the contents, if swapped out
    pub fn slot(&self) -> Option<SwapSlot> {
        self.slot
    }
}

impl PageOperations for AnonPage {
    fn swap_in(&mut self, ctx: &PageCtx<'_>, va: VirtAddr, frame: &mut [u8]) -> Result<()> {
        match self.slot.take() {
            Some(slot) => {
                log::trace!("anon {} <- swap slot {}", va, slot.index());
                ctx.swap.swap_in(slot, frame).inspect_err(|_| self.slot = Some(slot))
            }
            None => {
                frame.fill(0);
                Ok(())
            }
        }
    }

    fn swap_out(
        &mut self,
        ctx: &PageCtx<'_>,
        va: VirtAddr,
        frame: &[u8],
        _dirty: bool,
    ) -> Result<()> {
        let slot = ctx.swap.swap_out(frame)?;
        log::trace!("anon {} -> swap slot {}", va, slot.index());
        self.slot = Some(slot);
        Ok(())
    }

    fn destroy(&mut self, ctx: &PageCtx<'_>, _va: VirtAddr, _frame: Option<&[u8]>) {
        if let Some(slot) = self.slot.take() {
            ctx.swap.free(slot);
        }
    }

    fn vm_type(&self) -> VmType {
        VmType::Anon
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::PAGE_SIZE;
    use crate::config::VmConfig;
    use crate::sim::{MemSwapDevice, SoftMmu};
    use alloc::vec;

    #[test]
    fn test_swap_round_trip_frees_slot() {
        let swap = SwapTable::new(Arc::new(MemSwapDevice::new(2)));
        let mmu = SoftMmu::new(VmConfig::DEFAULT);
        let ctx = PageCtx { mmu: &mmu, swap: &swap };
        let va = VirtAddr::new(0x1000);

        let mut page = AnonPage::new();
        let mut frame: Vec<u8> = (0..PAGE_SIZE).map(|i| (i % 251) as u8).collect();
        let original = frame.clone();

        page.swap_out(&ctx, va, &frame, true).unwrap();
        assert_eq!(swap.used(), 1);
        assert!(page.slot().is_some());

        frame.fill(0);
        page.swap_in(&ctx, va, &mut frame).unwrap();
        assert_eq!(frame, original);
        assert_eq!(swap.used(), 0);
        assert!(page.slot().is_none());
    }

    #[test]
    fn test_swap_exhaustion_is_backing_store_error() {
        let swap = SwapTable::new(Arc::new(MemSwapDevice::new(1)));
        let frame = vec![1u8; PAGE_SIZE];

        swap.swap_out(&frame).unwrap();
        assert_eq!(swap.swap_out(&frame), Err(VmError::BackingStore("swap space exhausted")));
    }

    #[test]
    fn test_destroy_releases_slot() {
        let swap = SwapTable::new(Arc::new(MemSwapDevice::new(70)));
        let mmu = SoftMmu::new(VmConfig::DEFAULT);
        let ctx = PageCtx { mmu: &mmu, swap: &swap };
        let frame = vec![3u8; PAGE_SIZE];

        let mut pages: Vec<AnonPage> = (0..70).map(|_| AnonPage::new()).collect();
        for (i, page) in pages.iter_mut().enumerate() {
            let va = VirtAddr::new(0x1000 * (i + 1));
            page.swap_out(&ctx, va, &frame, false).unwrap();
        }
        assert_eq!(swap.used(), 70);

        for page in pages.iter_mut() {
            page.destroy(&ctx, VirtAddr::new(0), None);
        }
        assert_eq!(swap.used(), 0);
    }

    #[test]
    fn test_swap_in_without_slot_zero_fills() {
        let swap = SwapTable::new(Arc::new(MemSwapDevice::new(1)));
        let mmu = SoftMmu::new(VmConfig::DEFAULT);
        let ctx = PageCtx { mmu: &mmu, swap: &swap };
        let mut frame = vec![9u8; PAGE_SIZE];

        AnonPage::new().swap_in(&ctx, VirtAddr::new(0x1000), &mut frame).unwrap();
        assert!(frame.iter().all(|&b| b == 0));
    }
}
