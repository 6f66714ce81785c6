use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Failures reported to callers of the address-space operations.
///
/// Broken internal invariants are not represented here; they panic.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PmapError {
    /// No physical page was available and the caller asked not to wait.
    #[error("resource shortage: no free page for page tables or PV entries")]
    ResourceShortage,
    /// The address lies outside the range this address space may map.
    #[error("address {0} is outside the address space")]
    OutOfRange(VirtualAddress),
    /// The address is not 4 KiB aligned.
    #[error("address {0} is not page aligned")]
    Unaligned(VirtualAddress),
    /// Nothing is mapped at the address.
    #[error("nothing is mapped at {0}")]
    NotMapped(VirtualAddress),
    /// The physical page has no descriptor.
    #[error("physical page {0} is not managed by this physical map")]
    UnknownPage(PhysicalAddress),
}

/// Failures of the PV entry allocator.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PvAllocError {
    /// Non-blocking request could not be satisfied.
    #[error("PV entries exhausted")]
    Exhausted,
    /// Blocking request: drop all locks, wait for free memory and restart.
    #[error("PV allocation must wait for free memory")]
    WaitForMemory,
}

/// Internal control flow: the current attempt has to be repeated.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Restart {
    /// The address-space lock was dropped to take physical-page locks in
    /// order; everything read before must be re-read.
    Relocked,
    /// All locks must be released and the caller must wait for free memory.
    WaitForMemory,
}

impl From<PvAllocError> for Restart {
    fn from(_: PvAllocError) -> Self {
        Self::WaitForMemory
    }
}
