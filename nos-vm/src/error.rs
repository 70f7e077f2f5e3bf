//! Virtual memory error definitions

use core::fmt;

use crate::addr::VirtAddr;

/// Virtual memory error
///
/// Every failure of an allocation, claim or fault resolution is reported
/// through this type. Only [`VmError::ResourceExhausted`] is kernel-fatal;
/// the rest fail the triggering operation and, on the fault path, terminate
/// the faulting process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    /// User pool empty and no frame could be evicted
    ResourceExhausted,
    /// Page or hardware mapping already present at this address
    DuplicateMapping(VirtAddr),
    /// Access to an address with no backing page
    InvalidAccess(VirtAddr),
    /// Write to a read-only page
    WriteProtected(VirtAddr),
    /// No page registered at this address
    NotFound(VirtAddr),
    /// Malformed request from the caller
    InvalidArgument(&'static str),
    /// Swap or file I/O failed
    BackingStore(&'static str),
}

impl VmError {
    /// Returns true if the error is a kernel invariant violation rather
    /// than a per-process failure.
    pub fn is_fatal(&self) -> bool {
        matches!(self, VmError::ResourceExhausted)
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::ResourceExhausted => {
                write!(f, "Out of frames: pool empty and nothing to evict")
            }
            VmError::DuplicateMapping(va) => write!(f, "Duplicate mapping at {}", va),
            VmError::InvalidAccess(va) => write!(f, "Invalid access at {}", va),
            VmError::WriteProtected(va) => write!(f, "Write to read-only page at {}", va),
            VmError::NotFound(va) => write!(f, "No page at {}", va),
            VmError::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            VmError::BackingStore(msg) => write!(f, "Backing store failure: {}", msg),
        }
    }
}

/// Result type for virtual memory operations
pub type Result<T> = core::result::Result<T, VmError>;

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_only_exhaustion_is_fatal() {
        assert!(VmError::ResourceExhausted.is_fatal());
        assert!(!VmError::InvalidAccess(VirtAddr::new(0)).is_fatal());
        assert!(!VmError::BackingStore("swap").is_fatal());
    }

    #[test]
    fn test_display() {
        let err = VmError::DuplicateMapping(VirtAddr::new(0x1000));
        assert_eq!(err.to_string(), "Duplicate mapping at 0x1000");
    }
}
