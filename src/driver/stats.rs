//! Per-queue statistics.
//!
//! Classified counters the data path bumps as it runs. Counters are plain
//! relaxed atomics; readers may race writers and see a slightly stale view.

use core::sync::atomic::{AtomicU64, Ordering};

/// Bump a counter by one.
#[inline(always)]
pub(crate) fn bump(c: &AtomicU64) {
    c.fetch_add(1, Ordering::Relaxed);
}

/// Add to a counter.
#[inline(always)]
pub(crate) fn add(c: &AtomicU64, v: u64) {
    c.fetch_add(v, Ordering::Relaxed);
}

/// Read a counter. The data path only writes counters; reading them is
/// left to the host's stat enumeration and to tests.
#[allow(dead_code)]
#[inline(always)]
#[must_use]
pub(crate) fn get(c: &AtomicU64) -> u64 {
    c.load(Ordering::Relaxed)
}

/// Receive-queue counters.
#[derive(Debug, Default)]
pub struct RxQueueStats {
    /// Bytes delivered upward.
    pub bytes: AtomicU64,
    /// Frames consumed from the ring, including discards.
    pub packets: AtomicU64,
    /// Frames discarded for fatal descriptor error bits.
    pub desc_error: AtomicU64,
    /// Ring walks cut short by the frames-per-interrupt bound.
    pub intr_limit: AtomicU64,
    /// Bind attempts that fell back to copy because the free list was empty.
    pub bind_norcb: AtomicU64,
    /// Copy attempts dropped because no memory was available.
    pub copy_nomem: AtomicU64,
    /// Frames whose packet type was unknown to the decode table.
    pub hck_unknown: AtomicU64,
    /// Frames without the L3L4P classification bit.
    pub hck_nol3l4p: AtomicU64,
    /// IPv6 frames with untrusted extension headers; checksums discarded.
    pub hck_v6skip: AtomicU64,
    /// Inner (or only) IPv4 header checksum errors.
    pub hck_iperr: AtomicU64,
    /// Outer IPv4 header checksum errors.
    pub hck_eiperr: AtomicU64,
    /// L4 checksum errors.
    pub hck_l4err: AtomicU64,
    /// IPv4 header checksums verified good.
    pub hck_v4hdrok: AtomicU64,
    /// L4 checksums verified good.
    pub hck_l4hdrok: AtomicU64,
    /// Frames delivered with at least one checksum result.
    pub hck_set: AtomicU64,
    /// Frames delivered with no checksum result.
    pub hck_miss: AtomicU64,
}

/// Transmit-queue counters.
#[derive(Debug, Default)]
pub struct TxQueueStats {
    /// Bytes handed to hardware.
    pub bytes: AtomicU64,
    /// Frames handed to hardware.
    pub packets: AtomicU64,
    /// Descriptors consumed.
    pub descriptors: AtomicU64,
    /// Descriptors reclaimed from the write-back head.
    pub recycled: AtomicU64,
    /// Times a blocked ring was unblocked.
    pub num_unblocked: AtomicU64,
    /// Admissions refused because no control block was free.
    pub err_notcb: AtomicU64,
    /// Admissions refused because free descriptors were below the block
    /// threshold.
    pub err_nodescs: AtomicU64,
    /// Frames dropped because offload context derivation failed.
    pub err_context: AtomicU64,
    /// Frame chains the offload parser could not walk.
    pub hck_meoifail: AtomicU64,
    /// Offload requests lacking L2 information.
    pub hck_nol2info: AtomicU64,
    /// Offload requests lacking L3 information.
    pub hck_nol3info: AtomicU64,
    /// Offload requests lacking L4 information.
    pub hck_nol4info: AtomicU64,
    /// Offload requests with an unsupported L3 protocol.
    pub hck_badl3: AtomicU64,
    /// Offload requests with an unsupported L4 protocol.
    pub hck_badl4: AtomicU64,
    /// Inner offload requests on an unsupported tunnel type.
    pub hck_badtuntype: AtomicU64,
    /// Tunneled frames whose inner headers could not be resolved.
    pub hck_notuninfo: AtomicU64,
    /// Outer L4 checksum requests the hardware cannot honor.
    pub hck_badol4: AtomicU64,
}

// =============================================================================
// Tests
// =============================================================================
