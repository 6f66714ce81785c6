//! # The physical map
//!
//! [`PmapContext`] owns everything that would otherwise be global: page
//! descriptors, physical-page locks, the PV allocator, the kernel address
//! space and the registry of user address spaces, plus the three
//! collaborators it is parameterized over.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};
use kernel_info::memory::{KERNEL_PML4_INDEX, KERNEL_VA_START, SELF_MAP_PML4_INDEX, USER_END};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use kernel_sync::SpinLock;

use crate::address_space::{AddressSpace, PmapId};
use crate::config::PmapConfig;
use crate::entry::{MemAttr, PageEntryBits};
use crate::error::PmapError;
use crate::page::{PageArray, PageDescriptor, PageFlags, PageTableKind, PhysicalMemory};
use crate::pv::PvAllocator;
use crate::pv_lock::{PvLockTable, pv_lock_slot};
use crate::shootdown::{CpuSet, Pinned, TlbHardware};
use crate::stats::{PmapStats, PmapStatsSnapshot};
use crate::table::PageTable;
use crate::{FrameAlloc, PhysMapper};

/// No address space loaded on a CPU.
const NO_PMAP: u32 = u32::MAX;

pub struct PmapContext<M, F, H> {
    pub(crate) mapper: M,
    pub(crate) frames: F,
    pub(crate) hw: H,
    pub(crate) config: PmapConfig,
    pub(crate) pages: PageArray,
    pub(crate) pv_locks: PvLockTable,
    pub(crate) pv: PvAllocator,
    pub(crate) stats: PmapStats,
    kernel: Arc<AddressSpace>,
    registry: SpinLock<BTreeMap<PmapId, Arc<AddressSpace>>>,
    next_id: AtomicU32,
    current: Box<[AtomicU32]>,
}

impl<M: PhysMapper, F: FrameAlloc, H: TlbHardware> PmapContext<M, F, H> {
    /// Builds the physical map for `memory` and bootstraps the kernel
    /// address space: a root table with the recursive slot and the shared
    /// kernel page-directory-pointer table.
    ///
    /// # Errors
    /// [`PmapError::ResourceShortage`] if the two bootstrap pages cannot be
    /// allocated.
    ///
    /// # Panics
    /// If the hardware reports fewer CPUs than configured.
    pub fn new(
        mapper: M,
        frames: F,
        hw: H,
        memory: PhysicalMemory,
        config: PmapConfig,
    ) -> Result<Self, PmapError> {
        assert!(
            hw.cpu_count() >= config.cpus,
            "configured for {} CPUs, hardware has {}",
            config.cpus,
            hw.cpu_count()
        );
        let root = frames.alloc_4k().ok_or(PmapError::ResourceShortage)?;
        let Some(pdp) = frames.alloc_4k() else {
            frames.free_4k(root);
            return Err(PmapError::ResourceShortage);
        };

        let kernel = Arc::new(AddressSpace::new(
            PmapId::KERNEL,
            root,
            CpuSet::all(config.cpus),
        ));
        let ctx = Self {
            mapper,
            frames,
            hw,
            pages: PageArray::new(memory),
            pv_locks: PvLockTable::new(),
            pv: PvAllocator::new(config.pv_entry_max, config.pv_entry_high_water),
            stats: PmapStats::default(),
            kernel,
            registry: SpinLock::new(BTreeMap::new()),
            next_id: AtomicU32::new(1),
            current: (0..config.cpus)
                .map(|_| AtomicU32::new(PmapId::KERNEL.as_u32()))
                .collect(),
            config,
        };

        let root_table = ctx.table(root);
        root_table.zero();
        ctx.table(pdp).zero();
        root_table
            .slot(SELF_MAP_PML4_INDEX)
            .store(PageEntryBits::table_link(root, false).with_no_execute(config.no_execute));
        root_table
            .slot(KERNEL_PML4_INDEX)
            .store(PageEntryBits::table_link(pdp, false));
        let d = ctx.pages.descriptor(pdp.base());
        d.set_table_kind(Some(PageTableKind::DirectoryPointer(KERNEL_PML4_INDEX as u64)));
        d.set_wire_count(0);
        ctx.kernel.state.lock().resident = 1;

        log::debug!(
            "pmap: {} frames described, {} CPUs, superpages {}, erratum 383 workaround {}",
            memory.frames,
            ctx.config.cpus,
            ctx.config.superpages,
            ctx.config.erratum_383
        );
        Ok(ctx)
    }

    #[must_use]
    pub const fn config(&self) -> &PmapConfig {
        &self.config
    }

    #[must_use]
    pub const fn hardware(&self) -> &H {
        &self.hw
    }

    #[must_use]
    pub const fn frame_allocator(&self) -> &F {
        &self.frames
    }

    #[must_use]
    pub const fn kernel_pmap(&self) -> &Arc<AddressSpace> {
        &self.kernel
    }

    /// Descriptor of a managed frame.
    #[must_use]
    pub fn page(&self, pa: PhysicalAddress) -> Option<&PageDescriptor> {
        self.pages.get(pa)
    }

    pub(crate) fn table(&self, page: PhysicalPage<Size4K>) -> &PageTable {
        // Safety: only frames holding page tables reach here; they stay
        // allocated until after the last invalidation that could reference
        // them.
        unsafe { self.mapper.phys_to_ref(page.base()) }
    }

    pub(crate) fn lookup(&self, id: PmapId) -> Option<Arc<AddressSpace>> {
        if id == PmapId::KERNEL {
            return Some(self.kernel.clone());
        }
        self.registry.lock().get(&id).cloned()
    }

    /// Allocates a frame, waiting for memory as long as needed. Never called
    /// with locks held.
    pub(crate) fn alloc_frame_blocking(&self) -> PhysicalPage<Size4K> {
        loop {
            if let Some(page) = self.frames.alloc_4k() {
                return page;
            }
            log::debug!("pmap: waiting for a free page");
            self.frames.wait_for_free();
        }
    }

    /// Rejects addresses outside what `pmap` may map.
    pub(crate) fn check_range(
        &self,
        pmap: &AddressSpace,
        start: VirtualAddress,
        end: VirtualAddress,
    ) -> Result<(), PmapError> {
        if !start.is_aligned::<Size4K>() {
            return Err(PmapError::Unaligned(start));
        }
        if !end.is_aligned::<Size4K>() {
            return Err(PmapError::Unaligned(end));
        }
        let ok = if pmap.is_kernel() {
            start.as_u64() >= KERNEL_VA_START && start <= end
        } else {
            end.as_u64() <= USER_END && start <= end
        };
        if ok { Ok(()) } else { Err(PmapError::OutOfRange(start)) }
    }

    /// Like [`Self::check_range`] for the single page at `va`.
    pub(crate) fn check_page(&self, pmap: &AddressSpace, va: VirtualAddress) -> Result<(), PmapError> {
        if !va.is_aligned::<Size4K>() {
            return Err(PmapError::Unaligned(va));
        }
        let ok = if pmap.is_kernel() {
            va.as_u64() >= KERNEL_VA_START
        } else {
            va.as_u64() < USER_END
        };
        if ok { Ok(()) } else { Err(PmapError::OutOfRange(va)) }
    }

    /// Creates an empty user address space sharing the kernel mappings.
    /// May wait for a free page.
    pub fn create_address_space(&self) -> Arc<AddressSpace> {
        let root = self.alloc_frame_blocking();
        let table = self.table(root);
        table.zero();
        let kernel_root = self.table(self.kernel.root());
        table
            .slot(KERNEL_PML4_INDEX)
            .store(kernel_root.slot(KERNEL_PML4_INDEX).load());
        table
            .slot(SELF_MAP_PML4_INDEX)
            .store(PageEntryBits::table_link(root, false).with_no_execute(self.config.no_execute));

        let id = PmapId::from_u32(self.next_id.fetch_add(1, Ordering::Relaxed));
        let pmap = Arc::new(AddressSpace::new(id, root, CpuSet::EMPTY));
        self.registry.lock().insert(id, pmap.clone());
        log::trace!("{id}: created with root {root}");
        pmap
    }

    /// Destroys an address space that no longer maps anything.
    ///
    /// # Panics
    /// For the kernel address space, or if any mapping or page-table page
    /// is left.
    pub fn release(&self, pmap: Arc<AddressSpace>) {
        assert!(!pmap.is_kernel(), "the kernel address space cannot be released");
        {
            let st = pmap.state.lock();
            assert!(
                st.resident == 0,
                "{}: released with {} resident pages",
                pmap.id(),
                st.resident
            );
            assert!(st.pv_chunks.is_empty(), "{}: released with PV chunks", pmap.id());
            assert!(st.idle_ptps.is_empty(), "{}: released with idle page tables", pmap.id());
        }
        let table = self.table(pmap.root());
        table.slot(KERNEL_PML4_INDEX).take();
        table.slot(SELF_MAP_PML4_INDEX).take();
        debug_assert_eq!(table.present_count(), 0);
        self.registry.lock().remove(&pmap.id());
        for cpu in pmap.active_cpus().iter() {
            let _ = self.current[cpu].compare_exchange(
                pmap.id().as_u32(),
                NO_PMAP,
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
        }
        self.frames.free_4k(pmap.root());
        log::trace!("{}: released", pmap.id());
    }

    /// Switches the current CPU to `pmap`.
    pub fn activate(&self, pmap: &AddressSpace) {
        let pin = Pinned::new(&self.hw);
        let cpu = pin.cpu;
        let old = self.current[cpu].swap(pmap.id().as_u32(), Ordering::AcqRel);
        if old != pmap.id().as_u32() && old != PmapId::KERNEL.as_u32() && old != NO_PMAP {
            if let Some(prev) = self.lookup(PmapId::from_u32(old)) {
                prev.active().remove(cpu);
            }
        }
        if !pmap.is_kernel() {
            pmap.active().insert(cpu);
        }
        self.hw.load_root(pmap.root());
    }

    /// Whether `pmap` is loaded on the calling CPU.
    #[must_use]
    pub fn is_current(&self, pmap: &AddressSpace) -> bool {
        let pin = Pinned::new(&self.hw);
        self.current[pin.cpu].load(Ordering::Acquire) == pmap.id().as_u32()
    }

    /// Sets the cache mode used for future mappings of `pa`.
    ///
    /// # Errors
    /// [`PmapError::UnknownPage`] if `pa` has no descriptor.
    pub fn set_page_memattr(&self, pa: PhysicalAddress, attr: MemAttr) -> Result<(), PmapError> {
        let d = self.pages.get(pa).ok_or(PmapError::UnknownPage(pa))?;
        d.set_memattr(attr);
        Ok(())
    }

    /// Marks `pa` as not tracked by PV entries; later mappings of it have no
    /// reverse mapping.
    ///
    /// # Errors
    /// [`PmapError::UnknownPage`] if `pa` has no descriptor.
    ///
    /// # Panics
    /// If `pa` is currently mapped through a tracked mapping.
    pub fn set_page_unmanaged(&self, pa: PhysicalAddress) -> Result<(), PmapError> {
        let d = self.pages.get(pa).ok_or(PmapError::UnknownPage(pa))?;
        let mut locks = self.pv_locks.stack();
        locks.acquire_all(&[pv_lock_slot(pa)]);
        assert!(!self.page_is_mapped(pa), "page {pa} is still mapped");
        d.clear_flags(PageFlags::MANAGED | PageFlags::WRITEABLE);
        Ok(())
    }

    #[must_use]
    pub fn stats(&self) -> PmapStatsSnapshot {
        self.stats
            .snapshot(self.pv.live() as u64, self.pv.chunk_count() as u64)
    }
}
