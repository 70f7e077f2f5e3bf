//! User address space layout
//!
//! The virtual memory core needs only a handful of layout facts: where user
//! space begins and ends, where the user stack starts, and how far the stack
//! may grow. They are gathered in [`VmConfig`] so a kernel can supply its own
//! layout; [`VmConfig::DEFAULT`] is the x86-64 teaching kernel layout.
//!
//! ## Stack growth
//!
//! A fault with no page behind it is still legitimate when it looks like a
//! stack push: the address lies inside the stack window
//! `[user_stack_top - stack_limit, user_stack_top)` and no more than
//! `stack_slack` bytes below the faulting thread's stack pointer. `PUSH`
//! faults 8 bytes below rsp before rsp is updated, hence the default slack.

use crate::addr::{PAGE_SIZE, VirtAddr};

/// Address space layout used by the virtual memory core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Lowest valid user address
    pub user_base: usize,

    /// Maximum user address (exclusive, kernel space starts here)
    pub user_max: usize,

    /// User stack top address (exclusive)
    pub user_stack_top: usize,

    /// Maximum size of the user stack (bytes)
    pub stack_limit: usize,

    /// How far below the stack pointer a fault still counts as a push (bytes)
    pub stack_slack: usize,
}

impl VmConfig {
    /// x86-64 teaching kernel layout: 1MB stack below 0x47480000, kernel
    /// space at 0x8004000000, null page excluded.
    pub const DEFAULT: VmConfig = VmConfig {
        user_base: PAGE_SIZE,
        user_max: 0x80_0400_0000,
        user_stack_top: 0x4748_0000,
        stack_limit: 1 << 20,
        stack_slack: 8,
    };

    /// Lowest address the stack may grow down to
    #[inline]
    pub fn stack_floor(&self) -> usize {
        self.user_stack_top.saturating_sub(self.stack_limit)
    }

    /// Check if an address is in user space
    #[inline]
    pub fn is_user_address(&self, addr: VirtAddr) -> bool {
        addr.as_usize() >= self.user_base && addr.as_usize() < self.user_max
    }

    /// Check if an address lies in the window the stack may occupy
    #[inline]
    pub fn in_stack_window(&self, addr: VirtAddr) -> bool {
        self.is_user_address(addr)
            && addr.as_usize() < self.user_stack_top
            && addr.as_usize() >= self.stack_floor()
    }

    /// Check whether a fault at `addr` with stack pointer `rsp` is stack growth
    pub fn is_stack_growth(&self, addr: VirtAddr, rsp: VirtAddr) -> bool {
        self.in_stack_window(addr)
            && addr.as_usize() >= rsp.as_usize().saturating_sub(self.stack_slack)
    }

    /// Verify layout consistency
    pub fn verify(&self) -> Result<(), &'static str> {
        if self.user_base % PAGE_SIZE != 0 || self.user_max % PAGE_SIZE != 0 {
            return Err("User space bounds must be page-aligned");
        }
        if self.user_base >= self.user_max {
            return Err("User base must be below user max");
        }
        if self.user_stack_top % PAGE_SIZE != 0 || self.stack_limit % PAGE_SIZE != 0 {
            return Err("Stack bounds must be page-aligned");
        }
        if self.user_stack_top > self.user_max || self.stack_floor() < self.user_base {
            return Err("Stack window must lie inside user space");
        }
        if self.stack_limit < PAGE_SIZE {
            return Err("Stack limit must cover at least one page");
        }
        Ok(())
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout_verification() {
        assert!(VmConfig::DEFAULT.verify().is_ok());
    }

    #[test]
    fn test_address_checks() {
        let config = VmConfig::DEFAULT;
        assert!(!config.is_user_address(VirtAddr::new(0)));
        assert!(config.is_user_address(VirtAddr::new(0x1000)));
        assert!(!config.is_user_address(VirtAddr::new(config.user_max)));
    }

    #[test]
    fn test_stack_growth_window() {
        let config = VmConfig::DEFAULT;
        let top = config.user_stack_top;
        let rsp = VirtAddr::new(top - 0x2000);

        // push below rsp
        assert!(config.is_stack_growth(VirtAddr::new(top - 0x2008), rsp));
        // too far below rsp
        assert!(!config.is_stack_growth(VirtAddr::new(top - 0x3000), rsp));
        // at or above the top
        assert!(!config.is_stack_growth(VirtAddr::new(top), VirtAddr::new(top)));

        // below the floor even when rsp is there
        let floor = config.stack_floor();
        assert!(config.is_stack_growth(VirtAddr::new(floor), VirtAddr::new(floor)));
        assert!(!config.is_stack_growth(VirtAddr::new(floor - 8), VirtAddr::new(floor - 8)));
    }

    #[test]
    fn test_invalid_layout_rejected() {
        let mut config = VmConfig::DEFAULT;
        config.stack_limit = config.user_stack_top;
        assert!(config.verify().is_err());

        let mut config = VmConfig::DEFAULT;
        config.user_base = 0x1234;
        assert!(config.verify().is_err());
    }
}
