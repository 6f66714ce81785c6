use bitflags::bitflags;

bitflags! {
    /// Access rights requested for a mapping.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct Protection: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;

        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        const READ_EXECUTE = Self::READ.bits() | Self::EXECUTE.bits();
        const ALL = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}

bitflags! {
    /// Modifiers for [`PmapContext::enter`](crate::PmapContext::enter).
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct EnterFlags: u8 {
        /// The mapping is wired and counted in the address space's wired count.
        const WIRED = 1 << 0;
        /// Fail with [`PmapError::ResourceShortage`](crate::PmapError::ResourceShortage)
        /// instead of waiting for free memory.
        const NOSLEEP = 1 << 1;
        /// The faulting access was a read; the entry starts out accessed.
        const ACCESS_READ = 1 << 2;
        /// The faulting access was a write; the entry starts out accessed and dirty.
        const ACCESS_WRITE = 1 << 3;
        /// The faulting access was an instruction fetch.
        const ACCESS_EXECUTE = 1 << 4;

        const ACCESS_ANY = Self::ACCESS_READ.bits()
            | Self::ACCESS_WRITE.bits()
            | Self::ACCESS_EXECUTE.bits();
    }
}
