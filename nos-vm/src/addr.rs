//! Page geometry and address types
//!
//! User pages are named by [`VirtAddr`]; the kernel reaches the physical
//! frame backing a page through its kernel mapping, a [`KernelAddr`].

use core::fmt;
use static_assertions::{const_assert, const_assert_eq};

/// Page size (4KB)
pub const PAGE_SIZE: usize = 4096;
/// Page shift (log2 of PAGE_SIZE)
pub const PAGE_SHIFT: usize = 12;

const_assert!(PAGE_SIZE.is_power_of_two());
const_assert_eq!(1 << PAGE_SHIFT, PAGE_SIZE);

/// Align address down to page boundary
#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Align address up to page boundary
#[inline]
pub const fn page_round_up(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// A user virtual address
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(pub usize);

impl VirtAddr {
    /// Creates a new virtual address from a raw usize value.
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Returns the virtual address as a raw usize value.
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns the offset within the current page.
    pub const fn page_offset(self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    /// Returns the page number for this virtual address.
    pub const fn page_number(self) -> usize {
        self.0 >> PAGE_SHIFT
    }

    /// Checks if the virtual address is page-aligned.
    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    /// Checks for the null address.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Rounds down the virtual address to the containing page boundary.
    pub const fn page_round_down(self) -> Self {
        Self(page_round_down(self.0))
    }

    /// Rounds up the virtual address to the next page boundary.
    pub const fn page_round_up(self) -> Self {
        Self(page_round_up(self.0))
    }

    /// Address `bytes` above this one, or `None` on overflow.
    pub const fn checked_add(self, bytes: usize) -> Option<Self> {
        match self.0.checked_add(bytes) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<usize> for VirtAddr {
    fn from(addr: usize) -> Self {
        Self(addr)
    }
}

impl From<VirtAddr> for usize {
    fn from(addr: VirtAddr) -> Self {
        addr.0
    }
}

/// Kernel-mapped base address of one physical frame.
///
/// Only a [`UserPool`](crate::hal::UserPool) hands these out, and the pool
/// guarantees the `PAGE_SIZE` bytes behind it stay mapped and exclusively
/// owned until the frame is freed.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct KernelAddr(usize);

impl KernelAddr {
    /// Wraps the kernel mapping of a frame.
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Returns the kernel address as a raw usize value.
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Raw pointer to the first byte of the frame.
    pub const fn as_ptr(self) -> *mut u8 {
        self.0 as *mut u8
    }

    /// Views the frame as a byte slice.
    ///
    /// # Safety
    ///
    /// The address must come from a live pool allocation and no mutable view
    /// of the same frame may exist for `'a`.
    pub unsafe fn as_page<'a>(self) -> &'a [u8] {
        unsafe { core::slice::from_raw_parts(self.as_ptr(), PAGE_SIZE) }
    }

    /// Views the frame as a mutable byte slice.
    ///
    /// # Safety
    ///
    /// The address must come from a live pool allocation and no other view
    /// of the same frame may exist for `'a`.
    pub unsafe fn as_page_mut<'a>(self) -> &'a mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.as_ptr(), PAGE_SIZE) }
    }
}

impl fmt::Debug for KernelAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KernelAddr({:#x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_rounding() {
        assert_eq!(page_round_down(0x1fff), 0x1000);
        assert_eq!(page_round_up(0x1001), 0x2000);
        assert_eq!(page_round_up(0x2000), 0x2000);

        let va = VirtAddr::new(0x1234);
        assert_eq!(va.page_round_down(), VirtAddr::new(0x1000));
        assert_eq!(va.page_offset(), 0x234);
        assert_eq!(va.page_number(), 1);
        assert!(!va.is_page_aligned());
        assert!(va.page_round_down().is_page_aligned());
    }

    #[test]
    fn test_checked_add_overflow() {
        assert_eq!(VirtAddr::new(0x1000).checked_add(0x1000), Some(VirtAddr::new(0x2000)));
        assert_eq!(VirtAddr::new(usize::MAX).checked_add(1), None);
    }
}
