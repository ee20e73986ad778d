//! Configuration for the data path.

use crate::constants::{
    BUF_SIZE_GRANULARITY, DEFAULT_COPY_THRESHOLD, DEFAULT_MTU, DEFAULT_RING_SIZE,
    DEFAULT_RX_LIMIT_PER_INTR, DEFAULT_TX_BLOCK_THRESH, DEFAULT_TX_LSO_MAX_COOKIES,
    DEFAULT_TX_MAX_COOKIES, ETHER_VLAN_HEADER_LEN, FCS_LEN, IPHDR_ALIGNMENT, MAX_MTU,
    MAX_RING_SIZE, MIN_MTU, MIN_RING_SIZE,
};
use crate::driver::error::{ConfigError, ConfigResult};

/// Data-path configuration.
///
/// Built with `with_*` methods and validated once when the instance is
/// created.
///
/// # Example
/// ```
/// use x710_datapath::DataPathConfig;
///
/// let config = DataPathConfig::new()
///     .with_ring_size(512)
///     .with_mtu(9000)
///     .with_tx_block_thresh(16);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataPathConfig {
    /// Number of transmit/receive queue pairs.
    pub num_queues: usize,
    /// Descriptors per ring direction; must be a power of two.
    pub ring_size: usize,
    /// Maximum transmission unit.
    pub mtu: usize,
    /// Receive frames at least this large prefer a zero-copy bind.
    pub rx_dma_min: usize,
    /// Transmit frames larger than this prefer scatter/gather binding.
    pub tx_dma_min: usize,
    /// Most frames one interrupt-context ring walk may consume.
    pub rx_limit_per_intr: usize,
    /// Minimum free descriptors below which transmit admissions are
    /// refused and the ring is marked blocked. Must cover the largest
    /// descriptor demand of a single frame.
    pub tx_block_thresh: usize,
    /// Scatter/gather limit for regular transmit binds.
    pub tx_max_cookies: usize,
    /// Scatter/gather limit for segmentation-offload binds.
    pub tx_lso_max_cookies: usize,
    /// Tag received frames with hardware checksum results.
    pub rx_hcksum_enable: bool,
    /// Honor transmit checksum and segmentation offload requests.
    pub tx_hcksum_enable: bool,
}

impl DataPathConfig {
    /// Configuration with the default sizing.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            num_queues: 1,
            ring_size: DEFAULT_RING_SIZE,
            mtu: DEFAULT_MTU,
            rx_dma_min: DEFAULT_COPY_THRESHOLD,
            tx_dma_min: DEFAULT_COPY_THRESHOLD,
            rx_limit_per_intr: DEFAULT_RX_LIMIT_PER_INTR,
            tx_block_thresh: DEFAULT_TX_BLOCK_THRESH,
            tx_max_cookies: DEFAULT_TX_MAX_COOKIES,
            tx_lso_max_cookies: DEFAULT_TX_LSO_MAX_COOKIES,
            rx_hcksum_enable: true,
            tx_hcksum_enable: true,
        }
    }

    /// Set the queue-pair count.
    #[must_use]
    pub const fn with_num_queues(mut self, num_queues: usize) -> Self {
        self.num_queues = num_queues;
        self
    }

    /// Set the per-direction ring size.
    #[must_use]
    pub const fn with_ring_size(mut self, ring_size: usize) -> Self {
        self.ring_size = ring_size;
        self
    }

    /// Set the MTU.
    #[must_use]
    pub const fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    /// Set the receive copy-vs-bind threshold.
    #[must_use]
    pub const fn with_rx_dma_min(mut self, rx_dma_min: usize) -> Self {
        self.rx_dma_min = rx_dma_min;
        self
    }

    /// Set the transmit copy-vs-bind threshold.
    #[must_use]
    pub const fn with_tx_dma_min(mut self, tx_dma_min: usize) -> Self {
        self.tx_dma_min = tx_dma_min;
        self
    }

    /// Set the interrupt-context frame bound.
    #[must_use]
    pub const fn with_rx_limit_per_intr(mut self, limit: usize) -> Self {
        self.rx_limit_per_intr = limit;
        self
    }

    /// Set the transmit block threshold.
    #[must_use]
    pub const fn with_tx_block_thresh(mut self, thresh: usize) -> Self {
        self.tx_block_thresh = thresh;
        self
    }

    /// Set the scatter/gather limits for regular and LSO binds.
    #[must_use]
    pub const fn with_tx_cookie_limits(mut self, regular: usize, lso: usize) -> Self {
        self.tx_max_cookies = regular;
        self.tx_lso_max_cookies = lso;
        self
    }

    /// Enable or disable receive checksum tagging.
    #[must_use]
    pub const fn with_rx_hcksum(mut self, enabled: bool) -> Self {
        self.rx_hcksum_enable = enabled;
        self
    }

    /// Enable or disable transmit offload handling.
    #[must_use]
    pub const fn with_tx_hcksum(mut self, enabled: bool) -> Self {
        self.tx_hcksum_enable = enabled;
        self
    }

    /// Check the configuration for consistency.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.num_queues == 0 {
            return Err(ConfigError::InvalidQueueCount);
        }
        if !self.ring_size.is_power_of_two()
            || self.ring_size < MIN_RING_SIZE
            || self.ring_size > MAX_RING_SIZE
        {
            return Err(ConfigError::InvalidRingSize);
        }
        if self.mtu < MIN_MTU || self.mtu > MAX_MTU {
            return Err(ConfigError::InvalidMtu);
        }
        if self.rx_limit_per_intr == 0 {
            return Err(ConfigError::InvalidThreshold);
        }
        if self.tx_block_thresh == 0 || self.tx_block_thresh >= self.ring_size {
            return Err(ConfigError::InvalidThreshold);
        }
        // Frames admitted to the copy path must fit the staging buffer.
        if self.tx_dma_min > self.tx_buf_size() {
            return Err(ConfigError::InvalidThreshold);
        }
        if self.rx_dma_min > self.rx_buf_size() {
            return Err(ConfigError::InvalidThreshold);
        }
        if self.tx_max_cookies == 0 || self.tx_lso_max_cookies < self.tx_max_cookies {
            return Err(ConfigError::InvalidCookieLimit);
        }
        Ok(())
    }

    /// Largest on-wire frame: MTU plus L2 overhead plus the FCS.
    #[must_use]
    pub const fn frame_max(&self) -> usize {
        self.mtu + ETHER_VLAN_HEADER_LEN + FCS_LEN
    }

    /// Receive buffer size: the maximum frame rounded up to the buffer
    /// granularity, plus the IP-alignment pad.
    #[must_use]
    pub const fn rx_buf_size(&self) -> usize {
        round_up(self.frame_max(), BUF_SIZE_GRANULARITY) + IPHDR_ALIGNMENT
    }

    /// Transmit staging buffer size: the maximum frame rounded up to the
    /// buffer granularity.
    #[must_use]
    pub const fn tx_buf_size(&self) -> usize {
        round_up(self.frame_max(), BUF_SIZE_GRANULARITY)
    }

    /// Transmit free-list size: 1.5 times the ring size.
    #[must_use]
    pub const fn tx_free_list_size(&self) -> usize {
        self.ring_size + (self.ring_size >> 1)
    }
}

impl Default for DataPathConfig {
    fn default() -> Self {
        Self::new()
    }
}

const fn round_up(value: usize, to: usize) -> usize {
    value.div_ceil(to) * to
}

// =============================================================================
// Tests
// =============================================================================
