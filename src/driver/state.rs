//! Per-instance state word.
//!
//! A single atomic word carries the instance's run state as bits: set with
//! an atomic OR, queried with a masked read, so the data-path admission
//! checks are one load and one compare.

use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

bitflags! {
    /// Instance state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StateFlags: u32 {
        /// The data path is started.
        const STARTED = 1 << 0;
        /// The instance is suspended.
        const SUSPENDED = 1 << 1;
        /// A fault degraded the instance; all traffic is refused.
        const ERROR = 1 << 2;
        /// The device reported an over-temperature condition.
        const OVERTEMP = 1 << 3;
    }
}

/// Atomic instance state word.
#[derive(Debug)]
pub struct InstanceState(AtomicU32);

impl InstanceState {
    /// A fresh, stopped instance.
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// OR the given bits into the state word.
    pub fn set(&self, flags: StateFlags) {
        self.0.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Clear the given bits from the state word.
    pub fn clear(&self, flags: StateFlags) {
        self.0.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// True when every one of `flags` is set.
    #[must_use]
    pub fn contains(&self, flags: StateFlags) -> bool {
        self.snapshot().contains(flags)
    }

    /// Read the current state bits.
    #[must_use]
    pub fn snapshot(&self) -> StateFlags {
        StateFlags::from_bits_truncate(self.0.load(Ordering::Acquire))
    }

    /// Admission check: started and not suspended, faulted, or
    /// over-temperature.
    #[must_use]
    pub fn is_operational(&self) -> bool {
        let s = self.snapshot();
        s.contains(StateFlags::STARTED)
            && !s.intersects(StateFlags::SUSPENDED | StateFlags::ERROR | StateFlags::OVERTEMP)
    }
}

impl Default for InstanceState {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
