//! # Page-table pages
//!
//! A [`PageTable`] is one 4 KiB frame of 512 entries, accessed only through
//! atomics: the MMU sets accessed/dirty bits concurrently with software, so
//! every read is a snapshot and every modification that must not lose a
//! hardware update is an atomic read-modify-write.

use crate::entry::PageEntryBits;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_memory_addresses::ENTRIES_PER_TABLE;

#[repr(C, align(4096))]
pub struct PageTable {
    entries: [AtomicU64; ENTRIES_PER_TABLE],
}

const _: () = assert!(size_of::<PageTable>() == 4096);

impl PageTable {
    #[inline]
    #[must_use]
    pub fn slot(&self, index: usize) -> EntrySlot<'_> {
        EntrySlot(&self.entries[index])
    }

    /// Clears all entries. Only for tables no other CPU can reach yet.
    pub fn zero(&self) {
        for e in &self.entries {
            e.store(0, Ordering::Relaxed);
        }
    }

    /// Snapshot of every entry with its index.
    pub fn entries(&self) -> impl Iterator<Item = (usize, PageEntryBits)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, e)| (i, PageEntryBits::from_raw(e.load(Ordering::Acquire))))
    }

    /// Number of present entries.
    #[must_use]
    pub fn present_count(&self) -> usize {
        self.entries().filter(|(_, e)| e.present()).count()
    }
}

/// One entry of a [`PageTable`].
///
/// Values returned from any accessor are snapshots; callers that need the
/// value twice keep the first read instead of re-reading.
#[derive(Copy, Clone)]
pub struct EntrySlot<'a>(&'a AtomicU64);

impl EntrySlot<'_> {
    #[inline]
    #[must_use]
    pub fn load(self) -> PageEntryBits {
        PageEntryBits::from_raw(self.0.load(Ordering::Acquire))
    }

    /// Plain store, published with release ordering.
    #[inline]
    pub fn store(self, e: PageEntryBits) {
        self.0.store(e.raw(), Ordering::Release);
    }

    /// Atomically replaces the entry, returning the final previous value
    /// including any accessed/dirty bits the MMU set meanwhile.
    #[inline]
    pub fn swap(self, e: PageEntryBits) -> PageEntryBits {
        PageEntryBits::from_raw(self.0.swap(e.raw(), Ordering::AcqRel))
    }

    /// Atomically clears the entry, returning the previous value.
    #[inline]
    pub fn take(self) -> PageEntryBits {
        self.swap(PageEntryBits::EMPTY)
    }

    /// # Errors
    /// The current value when it differs from `current`.
    #[inline]
    pub fn compare_exchange(
        self,
        current: PageEntryBits,
        new: PageEntryBits,
    ) -> Result<PageEntryBits, PageEntryBits> {
        self.0
            .compare_exchange(current.raw(), new.raw(), Ordering::AcqRel, Ordering::Acquire)
            .map(PageEntryBits::from_raw)
            .map_err(PageEntryBits::from_raw)
    }

    /// Atomically clears `mask`, returning the previous value.
    #[inline]
    pub fn clear_bits(self, mask: u64) -> PageEntryBits {
        PageEntryBits::from_raw(self.0.fetch_and(!mask, Ordering::AcqRel))
    }

    /// Atomically sets `mask`, returning the previous value.
    #[inline]
    pub fn set_bits(self, mask: u64) -> PageEntryBits {
        PageEntryBits::from_raw(self.0.fetch_or(mask, Ordering::AcqRel))
    }

    /// Whether both slots are the same memory word.
    #[inline]
    #[must_use]
    pub fn same_as(self, other: EntrySlot<'_>) -> bool {
        core::ptr::eq(self.0, other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::bits;

    fn fresh() -> Box<PageTable> {
        Box::new(PageTable {
            entries: [const { AtomicU64::new(0) }; ENTRIES_PER_TABLE],
        })
    }

    #[test]
    fn clear_bits_keeps_hardware_updates() {
        let t = fresh();
        let s = t.slot(3);
        s.store(PageEntryBits::from_raw(0x5000 | bits::PRESENT | bits::WRITABLE));
        // the MMU marks the entry dirty behind our back
        s.set_bits(bits::DIRTY | bits::ACCESSED);
        let old = s.clear_bits(bits::WRITABLE);
        assert!(old.is_dirty_writable());
        assert_eq!(s.load().raw(), 0x5000 | bits::PRESENT | bits::DIRTY | bits::ACCESSED);
    }

    #[test]
    fn compare_exchange_reports_current() {
        let t = fresh();
        let s = t.slot(0);
        s.store(PageEntryBits::from_raw(bits::PRESENT));
        let err = s
            .compare_exchange(PageEntryBits::EMPTY, PageEntryBits::from_raw(7))
            .unwrap_err();
        assert_eq!(err.raw(), bits::PRESENT);
        assert_eq!(t.present_count(), 1);
        assert!(t.slot(0).same_as(s));
        assert!(!t.slot(1).same_as(s));
    }
}
