//! TX/RX queue-pair data path for a 40 Gb/s Ethernet controller.
//!
//! This crate implements the transmit and receive data path of a controller
//! that exposes multiple transmit/receive queue pairs. Each queue pair is a
//! bidirectional descriptor ring in DMA-visible memory that the host and the
//! hardware co-own through tail registers and in-memory completion state
//! (descriptor done bits on receive, a write-back head on transmit).
//!
//! # Architecture
//!
//! The driver is organized into three layers:
//!
//! 1. **Data path** ([`driver`]): ring engines, control-block pools, frame
//!    offload parsing, lifecycle and fault state
//! 2. **Descriptor layer** ([`descriptor`]): the hardware-defined 16-byte
//!    on-ring record formats, bit for bit
//! 3. **HAL layer** ([`hal`]): seams to the host environment - DMA
//!    allocation, register access, the upstream framing stack, and fault
//!    reporting
//!
//! # Receive
//!
//! Every ring slot always has an associated receive buffer on the work list.
//! A completed frame is either copied into a fresh buffer (small frames) or
//! the DMA buffer itself is loaned upward zero-copy, in which case a
//! replacement buffer is swapped in from a free list. Dropping a loaned
//! frame recycles the buffer; the last reference also tears the buffer down
//! when the ring has been shut down in the meantime.
//!
//! # Transmit
//!
//! A frame is either copied into a slot's pre-allocated DMA buffer or its
//! fragments are bound for scatter/gather directly. Checksum and
//! segmentation offloads emit a context descriptor ahead of the data
//! descriptors. Completions are reclaimed by reading the write-back head
//! that the hardware maintains just past the descriptor ring; when the ring
//! was blocked and enough descriptors free up, the upstream stack is told to
//! resume.
//!
//! # Example
//!
//! ```ignore
//! use x710_datapath::{DataPathConfig, Device, TxFrame};
//!
//! let config = DataPathConfig::new()
//!     .with_ring_size(1024)
//!     .with_mtu(1500);
//!
//! // dma/regs/upstream/fault are the host environment's implementations of
//! // the hal traits.
//! let dev = Device::new(config, dma, regs, upstream, fault)?;
//! dev.set_link_up(true);
//! dev.start()?;
//!
//! // Interrupt handler for queue 0:
//! dev.rx_intr(0);
//! dev.tx_recycle(0);
//!
//! // Upstream submission:
//! if let Some(frame) = dev.tx_send(0, frame) {
//!     // Ring is blocked; hold the frame until the ring-update callback.
//! }
//! ```

#![deny(unsafe_op_in_unsafe_fn)]

// =============================================================================
// Modules
// =============================================================================

pub mod constants;
pub mod descriptor;
pub mod driver;
pub mod frame;
pub mod hal;

// Test utilities (only available during testing)
#[cfg(test)]
pub(crate) mod testing;

// =============================================================================
// Re-exports
// =============================================================================

pub use driver::config::DataPathConfig;
pub use driver::device::Device;
pub use driver::error::{
    ConfigError, ConfigResult, DmaError, DmaResult, Error, OffloadError, Result,
};
pub use driver::state::{InstanceState, StateFlags};
pub use driver::stats::{RxQueueStats, TxQueueStats};
pub use driver::trqpair::Trqpair;
pub use frame::{CksumFlags, RxFrame, TunnelType, TxFrame, TxOffload};
pub use hal::dma::{
    AccHandle, Binding, Cookie, DmaAllocator, DmaAttrs, DmaBuffer, DmaHandle, DmaRegion,
    FaultStatus, SyncDirection,
};
pub use hal::regs::RegisterAccess;
pub use hal::upstream::{FaultReporter, ServiceImpact, Upstream};
