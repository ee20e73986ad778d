//! One transmit/receive queue pair.
//!
//! A `Trqpair` aggregates the per-queue ring state behind its lock layout:
//! the RX ring mutex guards the whole receive walk, the TX ring mutex
//! guards descriptor reservation and hardware arming, and the control-block
//! free list has its own fine-grained mutex so submissions never contend
//! with reclaim over it.

use std::sync::Mutex;

use crate::driver::lock;
use crate::driver::rx::RxRing;
use crate::driver::stats::{RxQueueStats, TxQueueStats};
use crate::driver::tx::{TcbFreeList, TxRing};

/// One transmit/receive queue pair.
pub struct Trqpair {
    pub(crate) index: usize,
    pub(crate) rx: Mutex<RxRing>,
    pub(crate) tx: Mutex<TxRing>,
    pub(crate) tcb_free: Mutex<TcbFreeList>,
    pub(crate) rx_stats: RxQueueStats,
    pub(crate) tx_stats: TxQueueStats,
}

impl Trqpair {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            rx: Mutex::new(RxRing::empty()),
            tx: Mutex::new(TxRing::empty()),
            tcb_free: Mutex::new(TcbFreeList::empty()),
            rx_stats: RxQueueStats::default(),
            tx_stats: TxQueueStats::default(),
        }
    }

    /// This queue pair's index.
    #[inline(always)]
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Receive-side counters.
    #[must_use]
    pub fn rx_stats(&self) -> &RxQueueStats {
        &self.rx_stats
    }

    /// Transmit-side counters.
    #[must_use]
    pub fn tx_stats(&self) -> &TxQueueStats {
        &self.tx_stats
    }

    /// True while the transmit ring is blocked awaiting a ring update.
    #[must_use]
    pub fn tx_blocked(&self) -> bool {
        lock(&self.tx).blocked
    }

    /// Free descriptor count on the transmit ring.
    #[must_use]
    pub fn tx_free_desc(&self) -> usize {
        lock(&self.tx).free
    }

    /// Depth of the transmit control-block free list.
    #[must_use]
    pub fn tcb_free_count(&self) -> usize {
        lock(&self.tcb_free).len()
    }
}
