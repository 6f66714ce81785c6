use crate::{PageSize, PhysicalAddress};
use core::fmt;
use core::marker::PhantomData;

/// Physical memory page base for size `S`.
///
/// A `PhysicalPage<S>` represents the **page-aligned base** of a physical page
/// of size `S` (`S::SIZE` bytes).
///
/// ### Semantics
/// - `base()` returns the page base as a [`PhysicalAddress`].
/// - `join(off)` adds an in-page offset to form a full [`PhysicalAddress`].
/// - `pfn()` is the 4 KiB frame number of the base.
///
/// ### Invariants
/// - The low `S::SHIFT` bits of the base are always zero (page aligned).
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let pa = PhysicalAddress::new(0x0000_0008_1234_5678);
/// let pp = pa.page::<Size2M>();
/// assert_eq!(pp.base().as_u64() & Size2M::MASK, 0);
/// assert_eq!(pp.join(pa.offset::<Size2M>()), pa);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage<S: PageSize>(u64, PhantomData<S>);

impl<S: PageSize> PhysicalPage<S> {
    /// Page that contains `p` (aligns down).
    #[inline]
    #[must_use]
    pub const fn from_addr(p: PhysicalAddress) -> Self {
        Self(p.0 & !S::MASK, PhantomData)
    }

    /// Page starting at 4 KiB frame `pfn`, aligned down to `S`.
    #[inline]
    #[must_use]
    pub const fn from_pfn(pfn: u64) -> Self {
        Self::from_addr(PhysicalAddress(pfn << 12))
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress(self.0)
    }

    #[inline]
    #[must_use]
    pub const fn pfn(self) -> u64 {
        self.0 >> 12
    }

    #[inline]
    #[must_use]
    pub const fn join(self, off: u64) -> PhysicalAddress {
        PhysicalAddress(self.0 + (off & S::MASK))
    }

    /// The page `n` pages further up.
    #[inline]
    #[must_use]
    pub const fn step(self, n: u64) -> Self {
        Self(self.0 + n * S::SIZE, PhantomData)
    }
}

impl<S: PageSize> fmt::Display for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018X}/{}", self.0, S::as_str())
    }
}

impl<S: PageSize> fmt::Debug for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalPage<{}>({:#018X})", S::as_str(), self.0)
    }
}
