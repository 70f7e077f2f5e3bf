//! Validation of user buffers passed to system calls

use alloc::sync::Arc;

use crate::addr::{PAGE_SIZE, VirtAddr};
use crate::error::{Result, VmError};
use crate::space::AddressSpace;
use crate::vm::Vm;

impl Vm {
    /// Checks that the kernel may access `[addr, addr + len)` on behalf of
    /// `space` and brings every page of it in.
    ///
    /// `write` is set when the kernel will store into the buffer. Pages that
    /// do not exist yet are accepted only as stack growth relative to `rsp`.
    pub fn check_user_buffer(
        &self,
        space: &Arc<AddressSpace>,
        addr: VirtAddr,
        len: usize,
        write: bool,
        rsp: VirtAddr,
    ) -> Result<()> {
        if addr.is_null() {
            return Err(VmError::InvalidAccess(addr));
        }
        if len == 0 {
            return Ok(());
        }
        let last = addr.checked_add(len - 1).ok_or(VmError::InvalidAccess(addr))?;

        let mut va = addr.page_round_down();
        let end = last.page_round_down();
        loop {
            let page_va = if va < addr { addr } else { va };
            if !space.mmu().is_user_address(page_va) {
                return Err(VmError::InvalidAccess(page_va));
            }

            let writable = space.spt.lock().find(va).map(|page| page.writable());
            match writable {
                Some(false) if write => return Err(VmError::WriteProtected(va)),
                Some(_) => self.claim_page(space, va)?,
                None if self.config.is_stack_growth(page_va, rsp) => {
                    self.grow_stack(space, page_va)?
                }
                None => return Err(VmError::InvalidAccess(page_va)),
            }

            if va == end {
                return Ok(());
            }
            va = VirtAddr::new(va.as_usize() + PAGE_SIZE);
        }
    }
}
