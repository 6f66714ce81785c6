use core::fmt;
use core::hash::Hash;

/// Sealed trait pattern to restrict `PageSize` impls to our markers.
mod sealed {
    pub trait Sealed {}
}

/// Marker trait for supported page sizes.
pub trait PageSize:
    sealed::Sealed + Clone + Copy + Eq + PartialEq + Ord + PartialOrd + Hash + fmt::Display + fmt::Debug
{
    /// Page size in bytes (power of two).
    const SIZE: u64;
    /// log2(SIZE), i.e., number of low bits used for the offset.
    const SHIFT: u32;
    /// Mask of the in-page offset bits.
    const MASK: u64 = Self::SIZE - 1;
    /// How many 4 KiB frames one page of this size spans.
    const FRAMES: u64 = Self::SIZE >> 12;

    fn as_str() -> &'static str;
}

macro_rules! page_size {
    ($(#[$doc:meta])* $name:ident, $shift:literal, $label:literal) => {
        $(#[$doc])*
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name;

        impl sealed::Sealed for $name {}

        impl PageSize for $name {
            const SIZE: u64 = 1 << $shift;
            const SHIFT: u32 = $shift;

            fn as_str() -> &'static str {
                $label
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(Self::as_str())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                fmt::Display::fmt(&self, f)
            }
        }
    };
}

page_size!(
    /// 4 KiB page (4096 bytes), the base mapping granularity.
    Size4K, 12, "4K"
);
page_size!(
    /// 2 MiB page (`2_097_152` bytes), one page-directory entry with PS set.
    Size2M, 21, "2M"
);
page_size!(
    /// 1 GiB (`1_073_741_824` bytes), the span of one page-directory-pointer entry.
    Size1G, 30, "1G"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_constants() {
        assert_eq!(Size4K::SIZE, 4096);
        assert_eq!(Size2M::MASK, 0x1F_FFFF);
        assert_eq!(Size2M::FRAMES, 512);
        assert_eq!(Size1G::FRAMES, 512 * 512);
        assert_eq!(format!("{:?}", Size2M), "2M");
    }
}
