//! Core data-path components.
//!
//! - [`config`]: configuration types and builder
//! - [`error`]: error types and result aliases
//! - [`state`]: per-instance atomic state word
//! - [`stats`]: per-queue counters
//! - [`offload`]: transmit frame parsing and context derivation
//! - [`rx`]: receive pool and ring engine
//! - [`tx`]: transmit pool and ring engine
//! - [`trqpair`]: queue-pair aggregation and lock layout
//! - [`device`]: instance lifecycle and public entry points

pub mod config;
pub mod device;
pub mod error;
pub mod offload;
pub mod rx;
pub mod state;
pub mod stats;
pub mod trqpair;
pub mod tx;

// Re-exports for convenience
pub use config::DataPathConfig;
pub use device::Device;
pub use error::{ConfigError, ConfigResult, DmaError, DmaResult, Error, OffloadError, Result};
pub use state::{InstanceState, StateFlags};
pub use trqpair::Trqpair;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, ignoring poisoning: a panic elsewhere is already a fatal
/// invariant violation and the guarded ring state stays consistent.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Advance a descriptor index by `count`, wrapping at `size`.
#[inline(always)]
pub(crate) fn next_desc(base: usize, count: usize, size: usize) -> usize {
    debug_assert!(base < size);
    debug_assert!(count > 0 && count <= size);
    let out = if base + count < size {
        base + count
    } else {
        base + count - size
    };
    debug_assert!(out < size);
    out
}

/// Step a descriptor index back by `count`, wrapping at `size`.
#[inline(always)]
pub(crate) fn prev_desc(base: usize, count: usize, size: usize) -> usize {
    debug_assert!(base < size);
    debug_assert!(count > 0 && count <= size);
    let out = if base >= count {
        base - count
    } else {
        base + size - count
    };
    debug_assert!(out < size);
    out
}

// =============================================================================
// Tests
// =============================================================================
