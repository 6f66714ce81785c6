//! On-page layout of a PV chunk.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::address_space::PmapId;

/// Entry slots per chunk page.
pub const PV_PER_CHUNK: usize = 168;

const MAP_WORDS: usize = 3;

/// Free bitmap of an empty chunk; bit set = slot free.
pub(crate) const FREE_MAP: [u64; MAP_WORDS] = [u64::MAX, u64::MAX, (1 << (PV_PER_CHUNK - 128)) - 1];

/// One reverse-mapping record: the virtual address plus list links. The
/// owning address space is the chunk's owner.
#[derive(Debug)]
pub(crate) struct PvSlot {
    pub va: AtomicU64,
    pub next: AtomicU64,
    pub prev: AtomicU64,
}

/// One physical page holding [`PV_PER_CHUNK`] entries of a single address
/// space.
#[repr(C, align(4096))]
pub(crate) struct PvChunk {
    owner: AtomicU64,
    map: [AtomicU64; MAP_WORDS],
    pub slots: [PvSlot; PV_PER_CHUNK],
}

const _: () = assert!(size_of::<PvChunk>() == 4096);

impl PvChunk {
    /// Prepares a freshly allocated page for `owner` with every slot free.
    pub fn init(&self, owner: PmapId) {
        self.owner.store(u64::from(owner.as_u32()), Ordering::Relaxed);
        for (word, free) in self.map.iter().zip(FREE_MAP) {
            word.store(free, Ordering::Relaxed);
        }
        for slot in &self.slots {
            slot.va.store(0, Ordering::Relaxed);
            slot.next.store(0, Ordering::Relaxed);
            slot.prev.store(0, Ordering::Relaxed);
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn owner(&self) -> PmapId {
        PmapId::from_u32(self.owner.load(Ordering::Relaxed) as u32)
    }

    /// Claims the lowest free slot.
    pub fn take_free(&self) -> Option<usize> {
        for (i, word) in self.map.iter().enumerate() {
            let bits = word.load(Ordering::Relaxed);
            if bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                word.store(bits & !(1 << bit), Ordering::Relaxed);
                return Some(i * 64 + bit);
            }
        }
        None
    }

    /// Returns `slot` to the free bitmap.
    ///
    /// # Panics
    /// If the slot was already free.
    pub fn release(&self, slot: usize) {
        let (word, bit) = (slot / 64, slot % 64);
        let prev = self.map[word].fetch_or(1 << bit, Ordering::Relaxed);
        assert!(prev & (1 << bit) == 0, "PV slot {slot} freed twice");
    }

    pub fn is_free(&self, slot: usize) -> bool {
        self.map[slot / 64].load(Ordering::Relaxed) & (1 << (slot % 64)) != 0
    }

    pub fn is_full(&self) -> bool {
        self.map.iter().all(|w| w.load(Ordering::Relaxed) == 0)
    }

    pub fn is_empty(&self) -> bool {
        self.map
            .iter()
            .zip(FREE_MAP)
            .all(|(w, free)| w.load(Ordering::Relaxed) == free)
    }

    /// Slots currently handed out.
    pub fn allocated(&self) -> impl Iterator<Item = usize> + '_ {
        (0..PV_PER_CHUNK).filter(|&s| !self.is_free(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;

    fn chunk() -> Box<PvChunk> {
        // Safety: all-zero atomics are valid.
        unsafe { Box::<PvChunk>::new_zeroed().assume_init() }
    }

    #[test]
    fn bitmap_hands_out_every_slot_once() {
        let c = chunk();
        c.init(PmapId::from_u32(7));
        assert!(c.is_empty());
        assert_eq!(c.owner(), PmapId::from_u32(7));
        let taken: Vec<_> = core::iter::from_fn(|| c.take_free()).collect();
        assert_eq!(taken.len(), PV_PER_CHUNK);
        assert_eq!(taken, (0..PV_PER_CHUNK).collect::<Vec<_>>());
        assert!(c.is_full());
        c.release(130);
        assert!(!c.is_full());
        assert_eq!(c.take_free(), Some(130));
        assert_eq!(c.allocated().count(), PV_PER_CHUNK);
    }

    #[test]
    #[should_panic(expected = "freed twice")]
    fn double_release_panics() {
        let c = chunk();
        c.init(PmapId::from_u32(1));
        c.release(3);
    }
}
