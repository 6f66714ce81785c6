use crate::{PageSize, VirtualPage};
use core::fmt;
use core::ops::{Add, AddAssign, Sub};

/// Number of entries per paging-structure table on x86-64.
pub const ENTRIES_PER_TABLE: usize = 512;

/// Virtual memory address.
///
/// A thin wrapper around `u64` that denotes **virtual** addresses. Values are
/// expected in canonical form (bits 63..48 replicate bit 47);
/// [`VirtualAddress::canonical`] produces that form from a 48-bit value.
///
/// ### Semantics
/// - [`VirtualAddress::page`] / [`VirtualAddress::offset`] derive the page base
///   and the in-page offset for a concrete [`PageSize`].
/// - The `*_index` accessors split the address into the four 9-bit radix
///   indices used by the page-table walk.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let va = VirtualAddress::new(0xFFFF_FFFF_8000_1234);
/// assert_eq!(va.pml4_index(), 511);
/// assert_eq!(va.pdpt_index(), 510);
/// assert_eq!(va.pd_index(), 0);
/// assert_eq!(va.pt_index(), 1);
/// assert_eq!(va.offset::<Size4K>(), 0x234);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(pub(crate) u64);

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    /// Sign-extends bit 47 into the upper bits.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
    pub const fn canonical(v: u64) -> Self {
        Self((((v << 16) as i64) >> 16) as u64)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new(0)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_canonical(self) -> bool {
        Self::canonical(self.0).0 == self.0
    }

    #[inline]
    #[must_use]
    pub const fn page<S: PageSize>(self) -> VirtualPage<S> {
        VirtualPage::containing_address(self)
    }

    #[inline]
    #[must_use]
    pub const fn offset<S: PageSize>(self) -> u64 {
        self.0 & S::MASK
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned<S: PageSize>(self) -> bool {
        self.offset::<S>() == 0
    }

    /// Aligns down to a boundary of `S`.
    #[inline]
    #[must_use]
    pub const fn align_down<S: PageSize>(self) -> Self {
        Self(self.0 & !S::MASK)
    }

    /// First boundary of `S` strictly above this address, saturating at the
    /// top of the address space.
    #[inline]
    #[must_use]
    pub const fn next_boundary<S: PageSize>(self) -> Self {
        match (self.0 & !S::MASK).checked_add(S::SIZE) {
            Some(v) => Self(v),
            None => Self(u64::MAX),
        }
    }

    /// Bits 47..39.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn pml4_index(self) -> usize {
        ((self.0 >> 39) & 0x1FF) as usize
    }

    /// Bits 38..30.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn pdpt_index(self) -> usize {
        ((self.0 >> 30) & 0x1FF) as usize
    }

    /// Bits 29..21.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn pd_index(self) -> usize {
        ((self.0 >> 21) & 0x1FF) as usize
    }

    /// Bits 20..12.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn pt_index(self) -> usize {
        ((self.0 >> 12) & 0x1FF) as usize
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:016X})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl From<u64> for VirtualAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl<S: PageSize> From<VirtualPage<S>> for VirtualAddress {
    fn from(value: VirtualPage<S>) -> Self {
        value.base()
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for VirtualAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl Sub for VirtualAddress {
    type Output = u64;
    #[inline]
    fn sub(self, rhs: Self) -> u64 {
        self.0 - rhs.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Size1G, Size2M, Size4K};

    #[test]
    fn canonical_sign_extends() {
        assert_eq!(
            VirtualAddress::canonical(0x0000_8000_0000_0000).as_u64(),
            0xFFFF_8000_0000_0000
        );
        assert!(VirtualAddress::new(0x0000_7FFF_FFFF_F000).is_canonical());
        assert!(!VirtualAddress::new(0x0000_8000_0000_0000).is_canonical());
    }

    #[test]
    fn boundaries() {
        let va = VirtualAddress::new(0x20_1000);
        assert_eq!(va.align_down::<Size2M>().as_u64(), 0x20_0000);
        assert_eq!(va.next_boundary::<Size2M>().as_u64(), 0x40_0000);
        assert_eq!(va.next_boundary::<Size4K>().as_u64(), 0x20_2000);
        assert_eq!(
            VirtualAddress::new(u64::MAX - 5).next_boundary::<Size1G>().as_u64(),
            u64::MAX
        );
    }

    #[test]
    fn index_split_roundtrips() {
        let va = VirtualAddress::new(0x0000_1234_5678_9000);
        let rebuilt = ((va.pml4_index() as u64) << 39)
            | ((va.pdpt_index() as u64) << 30)
            | ((va.pd_index() as u64) << 21)
            | ((va.pt_index() as u64) << 12);
        assert_eq!(rebuilt, va.as_u64());
    }
}
