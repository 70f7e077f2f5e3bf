//! Page fault handling and stack growth

use alloc::sync::Arc;
use bitflags::bitflags;
use log::{debug, error, warn};

use crate::addr::{PAGE_SIZE, VirtAddr};
use crate::error::{Result, VmError};
use crate::page::{PageInit, PageMarkers};
use crate::space::AddressSpace;
use crate::vm::Vm;

/// Exit status of a process killed by an invalid memory access
pub const ABNORMAL_EXIT_STATUS: i32 = -1;

bitflags! {
    /// Fault error code bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FaultFlags: u8 {
        /// The page was not present (clear: protection violation)
        const NOT_PRESENT = 1 << 0;
        /// The access was a write
        const WRITE = 1 << 1;
        /// The access came from user mode
        const USER = 1 << 2;
    }
}

/// A page fault as delivered by the trap handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    /// Faulting address
    pub addr: VirtAddr,
    /// Error code
    pub flags: FaultFlags,
    /// User stack pointer at the time of the fault
    pub rsp: VirtAddr,
}

impl PageFault {
    /// Not-present fault from user mode
    pub fn user(addr: VirtAddr, write: bool, rsp: VirtAddr) -> Self {
        let mut flags = FaultFlags::NOT_PRESENT | FaultFlags::USER;
        flags.set(FaultFlags::WRITE, write);
        Self { addr, flags, rsp }
    }

    /// Returns true if the page was not present
    pub fn not_present(&self) -> bool {
        self.flags.contains(FaultFlags::NOT_PRESENT)
    }

    /// Returns true if the access was a write
    pub fn is_write(&self) -> bool {
        self.flags.contains(FaultFlags::WRITE)
    }

    /// Returns true if the access came from user mode
    pub fn is_user(&self) -> bool {
        self.flags.contains(FaultFlags::USER)
    }
}

/// Page fault result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageFaultResult {
    /// Fault handled, resume the faulting instruction
    Handled,
    /// Invalid access, terminate the process
    Kill(VmError),
}

impl PageFaultResult {
    /// Returns true if execution may resume
    pub fn is_handled(&self) -> bool {
        matches!(self, PageFaultResult::Handled)
    }

    /// Exit status to terminate the process with, if it must die
    pub fn exit_status(&self) -> Option<i32> {
        match self {
            PageFaultResult::Handled => None,
            PageFaultResult::Kill(_) => Some(ABNORMAL_EXIT_STATUS),
        }
    }
}

impl Vm {
    /// Handle a page fault in `space`.
    ///
    /// Faults on a registered page claim it; faults just below the stack
    /// pointer inside the stack window grow the stack; everything else kills
    /// the process.
    ///
    /// # Panics
    ///
    /// Panics when no frame can be found even by eviction. The kernel cannot
    /// make progress once every frame is pinned or the table is empty.
    pub fn handle_page_fault(
        &self,
        space: &Arc<AddressSpace>,
        fault: &PageFault,
    ) -> PageFaultResult {
        self.stats.count_fault();
        match self.resolve_fault(space, fault) {
            Ok(()) => PageFaultResult::Handled,
            Err(err) if err.is_fatal() => {
                error!("page fault at {} in space {:?}: {}", fault.addr, space.id(), err);
                panic!("out of user frames handling fault at {}", fault.addr);
            }
            Err(err) => {
                self.stats.count_kill();
                warn!(
                    "page fault at {} in space {:?} (flags {:?}, rsp {}): {}",
                    fault.addr,
                    space.id(),
                    fault.flags,
                    fault.rsp,
                    err
                );
                PageFaultResult::Kill(err)
            }
        }
    }

    fn resolve_fault(&self, space: &Arc<AddressSpace>, fault: &PageFault) -> Result<()> {
        let addr = fault.addr;
        if addr.is_null() || !space.mmu().is_user_address(addr) {
            return Err(VmError::InvalidAccess(addr));
        }
        if !fault.not_present() {
            // the page is mapped, so this is a write to a read-only page
            return Err(VmError::WriteProtected(addr));
        }

        let page = space.spt.lock().find(addr).map(|page| (page.is_resident(), page.writable()));
        match page {
            Some((true, _)) => Ok(()),
            Some((false, writable)) if fault.is_write() && !writable => {
                Err(VmError::WriteProtected(addr))
            }
            Some((false, _)) => self.claim_page(space, addr),
            None if self.config.is_stack_growth(addr, fault.rsp) => self.grow_stack(space, addr),
            None => Err(VmError::InvalidAccess(addr)),
        }
    }

    /// Adds a writable anonymous stack page covering `addr` and claims it.
    pub(crate) fn grow_stack(&self, space: &Arc<AddressSpace>, addr: VirtAddr) -> Result<()> {
        let va = addr.page_round_down();
        self.alloc_page_marked(space, PageInit::Anon, va, true, PageMarkers::STACK, None)?;
        self.stats.count_stack_growth();
        debug!("space {:?}: stack grown to {}", space.id(), va);
        self.claim_page(space, va)
    }

    /// Creates the first stack page just below the stack top and claims it.
    ///
    /// Returns the initial stack pointer.
    pub fn setup_stack(&self, space: &Arc<AddressSpace>) -> Result<VirtAddr> {
        let top = VirtAddr::new(self.config.user_stack_top);
        let va = VirtAddr::new(self.config.user_stack_top - PAGE_SIZE);
        self.alloc_page_marked(space, PageInit::Anon, va, true, PageMarkers::STACK, None)?;
        self.claim_page(space, va)?;
        Ok(top)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmConfig;
    use crate::sim::{HeapPool, MemSwapDevice, SoftMmu};

    fn setup() -> (Vm, Arc<SoftMmu>, Arc<AddressSpace>) {
        let pool = Arc::new(HeapPool::new(8));
        let vm = Vm::new(VmConfig::DEFAULT, pool, Arc::new(MemSwapDevice::new(8))).unwrap();
        let mmu = Arc::new(SoftMmu::new(VmConfig::DEFAULT));
        let space = AddressSpace::new(mmu.clone());
        (vm, mmu, space)
    }

    #[test]
    fn test_exit_status() {
        assert_eq!(PageFaultResult::Handled.exit_status(), None);
        assert_eq!(
            PageFaultResult::Kill(VmError::InvalidAccess(VirtAddr::new(0))).exit_status(),
            Some(ABNORMAL_EXIT_STATUS)
        );
    }

    #[test]
    fn test_null_and_kernel_addresses_kill() {
        let (vm, _mmu, space) = setup();
        let rsp = VirtAddr::new(VmConfig::DEFAULT.user_stack_top);

        let result = vm.handle_page_fault(&space, &PageFault::user(VirtAddr::new(0), false, rsp));
        assert_eq!(result, PageFaultResult::Kill(VmError::InvalidAccess(VirtAddr::new(0))));

        let kernel = VirtAddr::new(VmConfig::DEFAULT.user_max);
        assert!(!vm.handle_page_fault(&space, &PageFault::user(kernel, false, rsp)).is_handled());
        assert_eq!(vm.stats().kills, 2);
    }

    #[test]
    fn test_write_to_readonly_page_kills() {
        let (vm, _mmu, space) = setup();
        let va = VirtAddr::new(0x40_0000);
        vm.alloc_page(&space, va, false).unwrap();

        let rsp = VirtAddr::new(VmConfig::DEFAULT.user_stack_top);
        let result = vm.handle_page_fault(&space, &PageFault::user(va, true, rsp));
        assert_eq!(result, PageFaultResult::Kill(VmError::WriteProtected(va)));

        // a read brings it in
        assert!(vm.handle_page_fault(&space, &PageFault::user(va, false, rsp)).is_handled());
    }

    #[test]
    fn test_protection_fault_kills() {
        let (vm, _mmu, space) = setup();
        let va = VirtAddr::new(0x40_0000);
        let fault = PageFault {
            addr: va,
            flags: FaultFlags::USER | FaultFlags::WRITE,
            rsp: VirtAddr::new(VmConfig::DEFAULT.user_stack_top),
        };
        assert_eq!(
            vm.handle_page_fault(&space, &fault),
            PageFaultResult::Kill(VmError::WriteProtected(va))
        );
    }

    #[test]
    fn test_push_below_rsp_grows_stack() {
        let (vm, mmu, space) = setup();
        let sp = vm.setup_stack(&space).unwrap();
        assert!(mmu.translate(VirtAddr::new(sp.as_usize() - 8)).is_some());

        let rsp = VirtAddr::new(sp.as_usize() - PAGE_SIZE);
        let addr = VirtAddr::new(rsp.as_usize() - 8);
        assert!(vm.handle_page_fault(&space, &PageFault::user(addr, true, rsp)).is_handled());

        space.with_spt(|spt| {
            let page = spt.find(addr).unwrap();
            assert!(page.markers().contains(PageMarkers::STACK));
            assert!(page.writable());
        });
        assert_eq!(vm.stats().stack_growths, 1);
    }

    #[test]
    fn test_far_below_rsp_kills() {
        let (vm, _mmu, space) = setup();
        let rsp = VirtAddr::new(VmConfig::DEFAULT.user_stack_top - PAGE_SIZE);
        let addr = VirtAddr::new(rsp.as_usize() - 64);

        let result = vm.handle_page_fault(&space, &PageFault::user(addr, true, rsp));
        assert_eq!(result, PageFaultResult::Kill(VmError::InvalidAccess(addr)));
        space.with_spt(|spt| assert!(spt.is_empty()));
    }

    #[test]
    #[should_panic(expected = "out of user frames")]
    fn test_exhaustion_is_fatal() {
        let pool = Arc::new(HeapPool::new(0));
        let vm = Vm::new(VmConfig::DEFAULT, pool, Arc::new(MemSwapDevice::new(1))).unwrap();
        let space = AddressSpace::new(Arc::new(SoftMmu::new(VmConfig::DEFAULT)));
        let va = VirtAddr::new(0x40_0000);
        vm.alloc_page(&space, va, true).unwrap();

        vm.handle_page_fault(&space, &PageFault::user(va, false, VirtAddr::new(0)));
    }
}
