//! Tunables of the physical map.

/// Shared-page estimate per process used to size the PV entry limit.
pub const SHARED_PAGES_PER_PROC: usize = 200;

/// Upper bound on CPUs; active sets are 64-bit masks.
pub const MAX_CPUS: usize = 64;

/// Configuration of a [`PmapContext`](crate::PmapContext).
///
/// ```
/// # use kernel_pmap::PmapConfig;
/// let cfg = PmapConfig::default()
///     .with_superpages(false)
///     .with_cpus(2);
/// assert!(!cfg.superpages);
/// assert_eq!(cfg.cpus, 2);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmapConfig {
    /// Attempt promotion to 2 MiB mappings.
    pub superpages: bool,
    /// Honour [`Protection::EXECUTE`](crate::Protection::EXECUTE) with the NX bit.
    pub no_execute: bool,
    /// Change PS entries inside a rendezvous (AMD erratum 383 workaround).
    pub erratum_383: bool,
    /// Number of CPUs taking part in shootdowns.
    pub cpus: usize,
    /// Ceiling for live PV entries.
    pub pv_entry_max: usize,
    /// Above this many live entries non-blocking PV allocation fails fast.
    pub pv_entry_high_water: usize,
}

impl Default for PmapConfig {
    fn default() -> Self {
        Self::for_memory(0, 1024)
    }
}

impl PmapConfig {
    /// Derives the PV limits from the number of 4 KiB frames under management
    /// and the maximum process count.
    #[must_use]
    pub const fn for_memory(frames: u64, max_proc: usize) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let max = SHARED_PAGES_PER_PROC * max_proc + frames as usize;
        Self {
            superpages: true,
            no_execute: true,
            erratum_383: false,
            cpus: 1,
            pv_entry_max: max,
            pv_entry_high_water: 9 * (max / 10),
        }
    }

    #[must_use]
    pub const fn with_superpages(mut self, enabled: bool) -> Self {
        self.superpages = enabled;
        self
    }

    #[must_use]
    pub const fn with_no_execute(mut self, enabled: bool) -> Self {
        self.no_execute = enabled;
        self
    }

    #[must_use]
    pub const fn with_erratum_383(mut self, enabled: bool) -> Self {
        self.erratum_383 = enabled;
        self
    }

    /// # Panics
    /// If `cpus` is zero or exceeds [`MAX_CPUS`].
    #[must_use]
    pub const fn with_cpus(mut self, cpus: usize) -> Self {
        assert!(cpus > 0 && cpus <= MAX_CPUS, "unsupported CPU count");
        self.cpus = cpus;
        self
    }

    /// Sets the PV entry ceiling; the high-water mark follows at 90 %.
    #[must_use]
    pub const fn with_pv_entry_max(mut self, max: usize) -> Self {
        self.pv_entry_max = max;
        self.pv_entry_high_water = 9 * (max / 10);
        self
    }
}
