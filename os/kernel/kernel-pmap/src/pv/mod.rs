//! # Reverse mappings
//!
//! Every managed mapping has exactly one PV entry recording `(address space,
//! virtual address)`, linked into the list of the physical page it maps (4 KiB
//! mappings) or of the 2 MiB region (superpage mappings). Entries live in
//! [`PV_PER_CHUNK`]-slot chunk pages owned by one address space, so the owner
//! of an entry follows from the chunk it sits in.

pub(crate) mod allocator;
pub(crate) mod chunk;
pub(crate) mod list;

use core::fmt;
use core::num::NonZeroU64;
use kernel_memory_addresses::{PhysicalPage, Size4K};

pub use allocator::AllocPolicy;
pub(crate) use allocator::{PvAllocator, PvBatch};
pub use chunk::PV_PER_CHUNK;

/// Handle of one PV entry: its chunk page and slot.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct PvRef(NonZeroU64);

impl PvRef {
    const SLOT_BITS: u32 = 8;
    const SLOT_MASK: u64 = (1 << Self::SLOT_BITS) - 1;

    pub(crate) fn new(chunk: PhysicalPage<Size4K>, slot: usize) -> Self {
        debug_assert!(slot < PV_PER_CHUNK);
        let raw = (chunk.pfn() << Self::SLOT_BITS) | (slot as u64 + 1);
        match NonZeroU64::new(raw) {
            Some(v) => Self(v),
            None => unreachable!("slot bits are never zero"),
        }
    }

    #[must_use]
    pub const fn chunk(self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_pfn(self.0.get() >> Self::SLOT_BITS)
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn slot(self) -> usize {
        ((self.0.get() & Self::SLOT_MASK) - 1) as usize
    }

    pub(crate) fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    pub(crate) fn into_raw(r: Option<Self>) -> u64 {
        r.map_or(0, |r| r.0.get())
    }
}

impl fmt::Debug for PvRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PvRef({:#x}:{})", self.chunk().base().as_u64(), self.slot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_encodes_chunk_and_slot() {
        let chunk = PhysicalPage::<Size4K>::from_pfn(0xABCDE);
        for slot in [0, 1, 127, PV_PER_CHUNK - 1] {
            let r = PvRef::new(chunk, slot);
            assert_eq!(r.chunk(), chunk);
            assert_eq!(r.slot(), slot);
            assert_eq!(PvRef::from_raw(PvRef::into_raw(Some(r))), Some(r));
        }
        assert_eq!(PvRef::from_raw(0), None);
    }
}
