//! A simulated machine for tests: RAM for page-table pages and PV chunks, a
//! frame pool with exhaustion control, and CPUs with TLBs that walk the
//! page tables like the MMU does.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use kernel_memory_addresses::{
    ENTRIES_PER_TABLE, PageSize, PhysicalAddress, PhysicalPage, Size2M, Size4K, VirtualAddress,
};

use crate::entry::{PageEntryBits, bits};
use crate::shootdown::{CpuId, CpuSet, TlbHardware, TlbRequest};
use crate::{FrameAlloc, PhysMapper, PhysicalMemory, PmapConfig, PmapContext};

/// Frames backed by host memory, handed out by [`SimFrames`].
pub const POOL_BASE: u64 = 0x20_0000;
pub const POOL_FRAMES: usize = 1024;
/// Frames only ever mapped, never dereferenced: five 2 MiB regions.
pub const DATA_BASE: u64 = 0x60_0000;
pub const DATA_END: u64 = 0x160_0000;

const _: () = assert!(POOL_BASE + POOL_FRAMES as u64 * 4096 == DATA_BASE);

#[repr(C, align(4096))]
struct Frame([AtomicU64; ENTRIES_PER_TABLE]);

pub struct SimRam {
    frames: Box<[Frame]>,
}

impl SimRam {
    fn new() -> Self {
        Self {
            frames: (0..POOL_FRAMES)
                .map(|_| Frame([const { AtomicU64::new(0) }; ENTRIES_PER_TABLE]))
                .collect(),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn frame(&self, pa: PhysicalAddress) -> &Frame {
        let index = pa
            .as_u64()
            .checked_sub(POOL_BASE)
            .map(|off| (off / Size4K::SIZE) as usize);
        match index.and_then(|i| self.frames.get(i)) {
            Some(f) => f,
            None => panic!("{pa} is not backed by simulated RAM"),
        }
    }

    fn entry(&self, table: PhysicalAddress, index: usize) -> &AtomicU64 {
        &self.frame(table).0[index]
    }
}

pub struct SimMapper(Arc<SimRam>);

impl PhysMapper for SimMapper {
    unsafe fn phys_to_ref<'a, T>(&self, pa: PhysicalAddress) -> &'a T {
        assert!(pa.is_aligned::<Size4K>());
        let frame: *const Frame = self.0.frame(pa);
        // Safety: the RAM outlives every context using it, and the types
        // placed in frames are made of atomics only.
        unsafe { &*frame.cast::<T>() }
    }
}

#[derive(Default)]
struct FrameState {
    free: Vec<PhysicalPage<Size4K>>,
    /// Allocations still allowed; `None` for no limit.
    budget: Option<usize>,
}

/// Frame pool. Waiting for memory lifts any limit, as if the page daemon
/// had freed something.
pub struct SimFrames {
    state: Mutex<FrameState>,
    waits: AtomicUsize,
}

impl SimFrames {
    fn new() -> Self {
        let free = (0..POOL_FRAMES as u64)
            .rev()
            .map(|i| PhysicalPage::from_addr(PhysicalAddress::new(POOL_BASE + i * Size4K::SIZE)))
            .collect();
        Self {
            state: Mutex::new(FrameState { free, budget: None }),
            waits: AtomicUsize::new(0),
        }
    }

    /// Lets only `n` more allocations succeed.
    pub fn limit(&self, n: usize) {
        self.state.lock().unwrap().budget = Some(n);
    }

    pub fn unlimit(&self) {
        self.state.lock().unwrap().budget = None;
    }

    pub fn free_count(&self) -> usize {
        self.state.lock().unwrap().free.len()
    }

    pub fn waits(&self) -> usize {
        self.waits.load(Ordering::Relaxed)
    }
}

impl FrameAlloc for SimFrames {
    fn alloc_4k(&self) -> Option<PhysicalPage<Size4K>> {
        let mut st = self.state.lock().unwrap();
        match st.budget {
            Some(0) => return None,
            Some(ref mut n) => *n -= 1,
            None => {}
        }
        st.free.pop()
    }

    fn free_4k(&self, page: PhysicalPage<Size4K>) {
        let mut st = self.state.lock().unwrap();
        assert!(!st.free.contains(&page), "frame {page} freed twice");
        st.free.push(page);
    }

    fn wait_for_free(&self) {
        self.waits.fetch_add(1, Ordering::Relaxed);
        self.unlimit();
    }
}

/// Why a simulated access faulted.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Fault {
    NotPresent,
    WriteProtected,
}

#[derive(Debug, Copy, Clone)]
struct TlbEntry {
    /// Frame of the 4 KiB page, also for pages inside a 2 MiB mapping.
    pa: PhysicalAddress,
    writable: bool,
    dirty: bool,
    global: bool,
    /// Base of the 2 MiB mapping this came from.
    large: Option<VirtualAddress>,
}

#[derive(Default)]
struct Cpu {
    root: Option<PhysicalPage<Size4K>>,
    tlb: HashMap<u64, TlbEntry>,
}

impl Cpu {
    fn apply(&mut self, request: TlbRequest) {
        match request {
            TlbRequest::Page(va) => {
                let page = va.align_down::<Size4K>().as_u64();
                let large = va.align_down::<Size2M>();
                self.tlb
                    .retain(|&k, e| k != page && e.large != Some(large));
            }
            TlbRequest::Range { start, end } => {
                self.tlb.retain(|&k, e| {
                    let base = e.large.map_or(k, VirtualAddress::as_u64);
                    let len = if e.large.is_some() { Size2M::SIZE } else { Size4K::SIZE };
                    base + len <= start.as_u64() || base >= end.as_u64()
                });
            }
            TlbRequest::All => self.tlb.retain(|_, e| e.global),
            TlbRequest::Global => self.tlb.clear(),
        }
    }
}

thread_local! {
    static CURRENT_CPU: Cell<CpuId> = const { Cell::new(0) };
}

/// CPUs with TLBs. The calling thread runs on CPU 0 unless moved with
/// [`SimMachine::on_cpu`].
pub struct SimMachine {
    ram: Arc<SimRam>,
    cpus: Vec<Mutex<Cpu>>,
    ipis: Vec<AtomicU64>,
    rendezvous: AtomicU64,
}

impl SimMachine {
    fn new(ram: Arc<SimRam>, cpus: usize) -> Self {
        Self {
            ram,
            cpus: (0..cpus).map(|_| Mutex::new(Cpu::default())).collect(),
            ipis: (0..cpus).map(|_| AtomicU64::new(0)).collect(),
            rendezvous: AtomicU64::new(0),
        }
    }

    /// Runs `f` as CPU `cpu` on the calling thread.
    pub fn on_cpu<R>(&self, cpu: CpuId, f: impl FnOnce() -> R) -> R {
        let prev = CURRENT_CPU.with(|c| c.replace(cpu));
        let r = f();
        CURRENT_CPU.with(|c| c.set(prev));
        r
    }

    /// Invalidation interrupts `cpu` received.
    pub fn ipis(&self, cpu: CpuId) -> u64 {
        self.ipis[cpu].load(Ordering::Relaxed)
    }

    pub fn rendezvous_count(&self) -> u64 {
        self.rendezvous.load(Ordering::Relaxed)
    }

    /// Whether `cpu` caches a translation for `va`.
    pub fn cached(&self, cpu: CpuId, va: VirtualAddress) -> Option<PhysicalAddress> {
        let key = va.align_down::<Size4K>().as_u64();
        self.cpus[cpu].lock().unwrap().tlb.get(&key).map(|e| e.pa)
    }

    /// Walks the tables rooted at `root`, setting accessed and dirty bits
    /// as the MMU would, and returns the translation to cache.
    fn walk(&self, root: PhysicalPage<Size4K>, va: VirtualAddress, write: bool) -> Result<TlbEntry, Fault> {
        let mut table = root.base();
        let indices = [va.pml4_index(), va.pdpt_index(), va.pd_index(), va.pt_index()];
        for (level, &index) in indices.iter().enumerate() {
            let word = self.ram.entry(table, index);
            let e = PageEntryBits::from_raw(word.load(Ordering::Acquire));
            if !e.present() {
                return Err(Fault::NotPresent);
            }
            let leaf = level == 3 || (level == 2 && e.large_page());
            if !leaf {
                table = e.frame();
                continue;
            }
            if write && !e.writable() {
                return Err(Fault::WriteProtected);
            }
            let set = if write { bits::ACCESSED | bits::DIRTY } else { bits::ACCESSED };
            word.fetch_or(set, Ordering::AcqRel);
            let large = level == 2;
            let pa = if large {
                e.large_frame() + (va.offset::<Size2M>() - va.offset::<Size4K>())
            } else {
                e.frame()
            };
            return Ok(TlbEntry {
                pa,
                writable: e.writable(),
                dirty: write || e.dirty(),
                global: e.global_translation(),
                large: large.then(|| va.align_down::<Size2M>()),
            });
        }
        unreachable!("walk ends at a leaf");
    }

    /// One access by `cpu` to `va`: served from the TLB when possible,
    /// otherwise through a table walk that fills it.
    pub fn touch(&self, cpu: CpuId, va: VirtualAddress, write: bool) -> Result<PhysicalAddress, Fault> {
        let key = va.align_down::<Size4K>().as_u64();
        let mut c = self.cpus[cpu].lock().unwrap();
        if let Some(e) = c.tlb.get(&key).copied() {
            if !write || (e.writable && e.dirty) {
                return Ok(e.pa);
            }
            if !e.writable {
                return Err(Fault::WriteProtected);
            }
        }
        let Some(root) = c.root else {
            return Err(Fault::NotPresent);
        };
        let e = self.walk(root, va, write)?;
        c.tlb.insert(key, e);
        Ok(e.pa)
    }
}

impl TlbHardware for SimMachine {
    fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    fn current_cpu(&self) -> CpuId {
        CURRENT_CPU.with(Cell::get)
    }

    fn pin(&self) {}

    fn unpin(&self) {}

    fn invalidate_local(&self, request: TlbRequest) {
        self.cpus[self.current_cpu()].lock().unwrap().apply(request);
    }

    fn send_invalidate(&self, targets: CpuSet, request: TlbRequest) {
        assert!(!targets.contains(self.current_cpu()), "IPI to self");
        for cpu in targets.iter() {
            self.ipis[cpu].fetch_add(1, Ordering::Relaxed);
            self.cpus[cpu].lock().unwrap().apply(request);
        }
    }

    fn rendezvous(
        &self,
        targets: CpuSet,
        action: &(dyn Fn(CpuId) + Sync),
        teardown: &(dyn Fn(CpuId) + Sync),
    ) {
        self.rendezvous.fetch_add(1, Ordering::Relaxed);
        for cpu in targets.iter() {
            self.on_cpu(cpu, || action(cpu));
        }
        for cpu in targets.iter() {
            self.on_cpu(cpu, || teardown(cpu));
        }
    }

    fn load_root(&self, root: PhysicalPage<Size4K>) {
        let mut c = self.cpus[self.current_cpu()].lock().unwrap();
        c.root = Some(root);
        c.apply(TlbRequest::All);
    }
}

pub type SimContext = PmapContext<SimMapper, SimFrames, SimMachine>;

pub struct Sim {
    pub ctx: SimContext,
}

impl Sim {
    pub fn new(cpus: usize) -> Self {
        let frames = (DATA_END - POOL_BASE) / Size4K::SIZE;
        Self::with_config(PmapConfig::for_memory(frames, 16).with_cpus(cpus))
    }

    pub fn with_config(config: PmapConfig) -> Self {
        let ram = Arc::new(SimRam::new());
        let memory = PhysicalMemory::new(
            PhysicalPage::from_addr(PhysicalAddress::new(POOL_BASE)),
            (DATA_END - POOL_BASE) / Size4K::SIZE,
        );
        let machine = SimMachine::new(ram.clone(), config.cpus);
        let ctx = PmapContext::new(SimMapper(ram), SimFrames::new(), machine, memory, config)
            .expect("bootstrap frames");
        Self { ctx }
    }

    pub fn frames(&self) -> &SimFrames {
        self.ctx.frame_allocator()
    }

    pub fn machine(&self) -> &SimMachine {
        self.ctx.hardware()
    }

    pub fn free_frames(&self) -> usize {
        self.frames().free_count()
    }

    /// The `i`th mappable 4 KiB data page.
    pub fn data_page(i: u64) -> PhysicalAddress {
        let pa = PhysicalAddress::new(DATA_BASE + i * Size4K::SIZE);
        assert!(pa.as_u64() < DATA_END);
        pa
    }

    /// Base of the `i`th 2 MiB data region.
    pub fn data_region(i: u64) -> PhysicalAddress {
        Self::data_page(i * Size2M::FRAMES)
    }
}
