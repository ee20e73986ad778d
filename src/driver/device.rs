//! Instance lifecycle and public data-path entry points.
//!
//! A [`Device`] owns the queue pairs and the seams to the host
//! environment. Ring memory is allocated when the instance starts and
//! released when it stops; a stop with frames still loaned upward defers
//! the final receive-pool teardown until the loans drain.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::constants::{DMA_ALIGNMENT, MAX_TX_BUFSZ};
use crate::driver::config::DataPathConfig;
use crate::driver::error::{ConfigError, DmaResult, Result};
use crate::driver::state::{InstanceState, StateFlags};
use crate::driver::trqpair::Trqpair;
use crate::driver::{lock, rx, tx};
use crate::frame::{RxFrame, TxFrame};
use crate::hal::dma::{DmaAllocator, DmaAttrs};
use crate::hal::regs::RegisterAccess;
use crate::hal::upstream::{FaultReporter, ServiceImpact, Upstream};

/// One instance of the data path: every queue pair plus the instance-wide
/// state shared between them.
pub struct Device {
    config: DataPathConfig,
    dma: Arc<dyn DmaAllocator>,
    regs: Arc<dyn RegisterAccess>,
    upstream: Arc<dyn Upstream>,
    fault: Arc<dyn FaultReporter>,
    state: InstanceState,
    link_up: AtomicBool,
    rx_pending: Arc<AtomicU32>,
    static_attrs: DmaAttrs,
    txbind_attrs: DmaAttrs,
    txbind_lso_attrs: DmaAttrs,
    trqpairs: Vec<Trqpair>,
}

impl Device {
    /// Create an instance over the host environment's services. The
    /// configuration is validated here, once.
    pub fn new(
        config: DataPathConfig,
        dma: Arc<dyn DmaAllocator>,
        regs: Arc<dyn RegisterAccess>,
        upstream: Arc<dyn Upstream>,
        fault: Arc<dyn FaultReporter>,
    ) -> Result<Self> {
        config.validate()?;

        // Descriptor rings and staging buffers want exactly one cookie;
        // the bind attribute sets differ only in scatter list length.
        let static_attrs = DmaAttrs {
            alignment: DMA_ALIGNMENT,
            sgl_len: 1,
            max_cookie_size: usize::MAX,
        };
        let txbind_attrs = DmaAttrs {
            alignment: DMA_ALIGNMENT,
            sgl_len: config.tx_max_cookies,
            max_cookie_size: MAX_TX_BUFSZ,
        };
        let txbind_lso_attrs = DmaAttrs {
            alignment: DMA_ALIGNMENT,
            sgl_len: config.tx_lso_max_cookies,
            max_cookie_size: MAX_TX_BUFSZ,
        };

        let trqpairs = (0..config.num_queues).map(Trqpair::new).collect();

        Ok(Self {
            config,
            dma,
            regs,
            upstream,
            fault,
            state: InstanceState::new(),
            link_up: AtomicBool::new(false),
            rx_pending: Arc::new(AtomicU32::new(0)),
            static_attrs,
            txbind_attrs,
            txbind_lso_attrs,
            trqpairs,
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// The validated configuration.
    #[inline(always)]
    #[must_use]
    pub fn config(&self) -> &DataPathConfig {
        &self.config
    }

    /// The instance state word.
    #[inline(always)]
    #[must_use]
    pub fn state(&self) -> &InstanceState {
        &self.state
    }

    /// One queue pair.
    ///
    /// # Panics
    ///
    /// Panics when `queue` is out of range.
    #[must_use]
    pub fn trqpair(&self, queue: usize) -> &Trqpair {
        &self.trqpairs[queue]
    }

    /// Record the link state reported by the outer driver layers.
    pub fn set_link_up(&self, up: bool) {
        self.link_up.store(up, Ordering::Release);
    }

    /// Current link state.
    #[must_use]
    pub fn link_up(&self) -> bool {
        self.link_up.load(Ordering::Acquire)
    }

    /// Frames currently loaned upward across all queues.
    #[must_use]
    pub fn rx_pending(&self) -> u32 {
        self.rx_pending.load(Ordering::Acquire)
    }

    pub(crate) fn allocator(&self) -> &Arc<dyn DmaAllocator> {
        &self.dma
    }

    pub(crate) fn regs(&self) -> &Arc<dyn RegisterAccess> {
        &self.regs
    }

    pub(crate) fn upstream(&self) -> &Arc<dyn Upstream> {
        &self.upstream
    }

    pub(crate) fn static_attrs(&self) -> &DmaAttrs {
        &self.static_attrs
    }

    pub(crate) fn txbind_attrs(&self) -> &DmaAttrs {
        &self.txbind_attrs
    }

    pub(crate) fn txbind_lso_attrs(&self) -> &DmaAttrs {
        &self.txbind_lso_attrs
    }

    pub(crate) fn rx_pending_counter(&self) -> &Arc<AtomicU32> {
        &self.rx_pending
    }

    /// A DMA or register handle faulted: report the impact, latch the
    /// error bit, and let the admission checks drain traffic.
    pub(crate) fn fault_degrade(&self) {
        self.fault.service_impact(ServiceImpact::Degraded);
        self.state.set(StateFlags::ERROR);
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Allocate ring memory for every queue pair, unwinding everything on
    /// failure. Hot paths never allocate after this returns.
    pub fn alloc_ring_mem(&self) -> DmaResult<()> {
        for itrq in &self.trqpairs {
            let res = {
                let mut ring = lock(&itrq.rx);
                let rxd = rx::alloc_rx_data(self, itrq.index);
                ring.data = Some(Arc::clone(&rxd));
                rx::alloc_rx_dma(self, &rxd, &mut ring)
            };
            let res = res.and_then(|()| tx::alloc_tx_dma(self, itrq));

            if let Err(e) = res {
                self.free_ring_mem(true);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Release ring memory for every queue pair. Receive pools with loans
    /// still outstanding are marked shut down and linger until the recycle
    /// path drains them; `failed_init` tolerates pools that never finished
    /// initializing.
    pub fn free_ring_mem(&self, failed_init: bool) {
        for itrq in &self.trqpairs {
            {
                let mut ring = lock(&itrq.rx);
                if let Some(rxd) = ring.data.clone() {
                    if ring.desc.is_some() {
                        rx::free_rx_dma(self, &rxd, &mut ring, failed_init);
                    }
                    // The flag must go up after the reference sweep so the
                    // recycle path and this one agree on who tears down.
                    if rx::mark_shutdown(&rxd) {
                        ring.data = None;
                    }
                }
            }
            tx::free_tx_dma(self, itrq);
        }
    }

    /// Start the data path: allocate ring memory and mark the instance
    /// started.
    pub fn start(&self) -> Result<()> {
        if self.state.contains(StateFlags::STARTED) {
            return Err(ConfigError::AlreadyStarted.into());
        }
        self.alloc_ring_mem()?;
        self.state.set(StateFlags::STARTED);
        Ok(())
    }

    /// Stop the data path: stop admissions, return outstanding transmit
    /// work, and release ring memory. Loaned receive buffers stay with the
    /// upstream stack; see [`Device::wait_rx_drain`].
    pub fn stop(&self) {
        self.state.clear(StateFlags::STARTED);
        for itrq in &self.trqpairs {
            tx::tx_cleanup_ring(self, itrq);
        }
        self.free_ring_mem(false);
    }

    /// Block until every loaned receive buffer has come back. Callers use
    /// this after [`Device::stop`] when the pool memory must be gone
    /// before the instance goes away.
    pub fn wait_rx_drain(&self) {
        for itrq in &self.trqpairs {
            let rxd = lock(&itrq.rx).data.clone();
            if let Some(rxd) = rxd {
                rx::wait_for_loans(&rxd);
                let mut ring = lock(&itrq.rx);
                if ring.desc.is_none() {
                    ring.data = None;
                }
            }
        }
    }

    // =========================================================================
    // Data path
    // =========================================================================

    /// Interrupt-context receive: walk the ring (bounded by the
    /// frames-per-interrupt limit) and deliver anything produced.
    pub fn rx_intr(&self, queue: usize) {
        let itrq = &self.trqpairs[queue];
        let frames = {
            let mut ring = lock(&itrq.rx);
            rx::ring_rx(self, itrq, &mut ring, None)
        };
        if !frames.is_empty() {
            self.upstream.rx_deliver(queue, frames);
        }
    }

    /// Polled receive: produce frames up to `poll_bytes` in total and
    /// return them to the caller.
    #[must_use]
    pub fn rx_poll(&self, queue: usize, poll_bytes: usize) -> Vec<RxFrame> {
        debug_assert!(poll_bytes > 0);
        if poll_bytes == 0 {
            return Vec::new();
        }
        let itrq = &self.trqpairs[queue];
        let mut ring = lock(&itrq.rx);
        rx::ring_rx(self, itrq, &mut ring, Some(poll_bytes))
    }

    /// Send one frame on `queue`.
    ///
    /// `None` means the frame was consumed (sent, or dropped as
    /// unrecoverable). Getting the frame back means the ring is out of
    /// resources: the blocked flag is latched and a ring-update callback
    /// will follow once space frees up.
    #[must_use]
    pub fn tx_send(&self, queue: usize, frame: TxFrame) -> Option<TxFrame> {
        tx::ring_tx(self, &self.trqpairs[queue], frame)
    }

    /// Reclaim finished transmit descriptors on `queue`, unblocking the
    /// ring when enough come free.
    pub fn tx_recycle(&self, queue: usize) {
        tx::tx_recycle_ring(self, &self.trqpairs[queue]);
    }

    /// Shutdown reclaim for `queue`; the hardware queue must already be
    /// disabled.
    pub fn tx_cleanup(&self, queue: usize) {
        tx::tx_cleanup_ring(self, &self.trqpairs[queue]);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::error::Error;
    use crate::testing::{
        MockDmaAllocator, MockFaultReporter, MockRegisters, MockUpstream, rig, small_config,
        started_rig,
    };

    #[test]
    fn start_allocates_and_stop_releases() {
        let rig = started_rig(small_config());
        assert!(rig.dev.state().contains(StateFlags::STARTED));
        assert!(rig.dma.region_count() > 0);

        rig.dev.stop();
        assert!(!rig.dev.state().contains(StateFlags::STARTED));
        assert_eq!(rig.dma.region_count(), 0);
        assert_eq!(rig.dma.handle_count(), 0);

        // A second release pass is a no-op.
        rig.dev.free_ring_mem(false);
        assert_eq!(rig.dma.region_count(), 0);

        // The instance can come back up afterwards.
        rig.dev.start().unwrap();
        assert!(rig.dev.state().is_operational());
        rig.dev.stop();
        assert_eq!(rig.dma.region_count(), 0);
    }

    #[test]
    fn double_start_is_rejected() {
        let rig = started_rig(small_config());
        assert_eq!(
            rig.dev.start(),
            Err(Error::Config(ConfigError::AlreadyStarted))
        );
    }

    #[test]
    fn failed_allocation_unwinds_cleanly() {
        let rig = rig(small_config());
        rig.dma.set_memory_budget(10);
        assert!(rig.dev.start().is_err());
        assert!(!rig.dev.state().contains(StateFlags::STARTED));
        assert_eq!(rig.dma.region_count(), 0);
        assert_eq!(rig.dma.handle_count(), 0);

        // With the budget lifted the instance starts fine.
        rig.dma.set_memory_budget(-1);
        rig.dev.start().unwrap();
        rig.dev.stop();
    }

    #[test]
    fn invalid_config_is_rejected_at_creation() {
        let result = Device::new(
            DataPathConfig::new().with_ring_size(100),
            Arc::new(MockDmaAllocator::new()),
            Arc::new(MockRegisters::new()),
            Arc::new(MockUpstream::new()),
            Arc::new(MockFaultReporter::new()),
        );
        assert!(result.is_err());
    }

    #[test]
    fn wait_rx_drain_returns_immediately_without_loans() {
        let rig = started_rig(small_config());
        rig.dev.stop();
        rig.dev.wait_rx_drain();
        assert_eq!(rig.dev.rx_pending(), 0);
    }
}
