//! Hardware/host abstraction seams.
//!
//! The data path core does not own the PCIe device or the operating
//! system's memory services; it consumes them through the traits in this
//! module:
//!
//! - [`dma::DmaAllocator`]: physical-memory allocation, scatter/gather
//!   binding, and cache coherence
//! - [`regs::RegisterAccess`]: memory-mapped register reads/writes plus a
//!   fault-management query
//! - [`upstream::Upstream`]: frame delivery and flow-control notification
//!   toward the host framing stack
//! - [`upstream::FaultReporter`]: service-impact reporting for fault
//!   management
//!
//! All traits are object safe and the instance holds them as `Arc<dyn _>`;
//! tests substitute mocks.

pub mod dma;
pub mod regs;
pub mod upstream;

pub use dma::{DmaAllocator, DmaAttrs, DmaBuffer, FaultStatus, SyncDirection};
pub use regs::RegisterAccess;
pub use upstream::{FaultReporter, ServiceImpact, Upstream};
