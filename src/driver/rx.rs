//! Receive pool and ring engine.
//!
//! Every ring slot always has an associated control block on the work
//! list. Completed frames are either copied out (reusing the DMA buffer in
//! place) or loaned upward zero-copy with a replacement swapped in from the
//! free list. Dropping a loaned frame recycles the buffer; after shutdown
//! the last reference also frees its DMA resources and, once the pending
//! count drains, wakes the teardown waiter.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, Ordering, fence};
use std::sync::{Arc, Condvar, Mutex};

use log::error;

use crate::constants::IPHDR_ALIGNMENT;
use crate::descriptor::bits::rxd;
use crate::descriptor::ptype::{self, InnerProt, IpVersion, TunnelKind};
use crate::descriptor::rx_desc;
use crate::driver::device::Device;
use crate::driver::error::DmaResult;
use crate::driver::stats::{RxQueueStats, add, bump};
use crate::driver::trqpair::Trqpair;
use crate::driver::{lock, next_desc, prev_desc};
use crate::frame::RxFrame;
use crate::hal::dma::{DmaAllocator, DmaBuffer, SyncDirection};
use crate::hal::regs::qrx_tail;

/// Debug override for the copy-vs-bind decision. Meant to be flipped from
/// a debugger; nothing in the driver writes it.
#[cfg(debug_assertions)]
#[allow(dead_code)]
pub(crate) mod debug_rx {
    use core::sync::atomic::AtomicU8;

    /// Follow the configured copy threshold.
    pub const DEFAULT: u8 = 0;
    /// Always copy.
    pub const BCOPY: u8 = 1;
    /// Always bind.
    pub const DMABIND: u8 = 2;

    /// Process-wide override, debug builds only.
    pub static MODE: AtomicU8 = AtomicU8::new(DEFAULT);
}

// =============================================================================
// Control blocks
// =============================================================================

/// One receive buffer and its reference count.
///
/// While the ring is started each block holds one reference attributable
/// to the driver; every outstanding loan adds one. The block's DMA buffer
/// is released by whoever drops the count to zero.
pub(crate) struct RxControlBlock {
    dma: UnsafeCell<DmaBuffer>,
    refcnt: AtomicU32,
}

// Safety: the DMA buffer behind the cell is mutated only at two points of
// the protocol - pool construction before the block is shared, and the
// final reference drop, which is exclusive by counting.
unsafe impl Send for RxControlBlock {}
unsafe impl Sync for RxControlBlock {}

impl RxControlBlock {
    fn new(alloc: Arc<dyn DmaAllocator>) -> Self {
        Self {
            dma: UnsafeCell::new(DmaBuffer::unallocated(alloc)),
            refcnt: AtomicU32::new(0),
        }
    }

    /// Shared view of the buffer. Callers must hold a live reference (ring
    /// lock over a Working slot, or a loan).
    #[inline(always)]
    pub(crate) fn buffer(&self) -> &DmaBuffer {
        // Safety: readers hold a reference per the protocol above, so no
        // final-drop mutation can run concurrently.
        unsafe { &*self.dma.get() }
    }

    /// Reference count, for invariant checks.
    pub(crate) fn refs(&self) -> u32 {
        self.refcnt.load(Ordering::Acquire)
    }

    /// Release the buffer's DMA resources.
    ///
    /// # Safety
    ///
    /// Only the thread that dropped the reference count to zero may call
    /// this, and only once per zero transition.
    unsafe fn free_buffer(&self) {
        // Safety: exclusivity per the caller contract.
        unsafe { (*self.dma.get()).free() };
    }

    /// Install the freshly allocated buffer during pool construction.
    ///
    /// # Safety
    ///
    /// Only valid before the pool is shared outside the allocating thread.
    unsafe fn install_buffer(&self, buf: DmaBuffer) {
        // Safety: exclusive access per the caller contract.
        unsafe { *self.dma.get() = buf };
    }
}

struct RcbFreeList {
    list: Vec<u32>,
    size: usize,
}

struct RxPendingState {
    pending: u32,
    shutdown: bool,
}

/// Receive-side state of one queue pair that must outlive the ring: the
/// control-block pool, its free list, and the loan accounting used to
/// coordinate shutdown. Loaned frames hold this alive through an `Arc`.
pub(crate) struct RxData {
    pub(crate) queue: usize,
    pub(crate) ring_size: usize,
    pub(crate) free_list_size: usize,
    rcbs: Box<[RxControlBlock]>,
    free: Mutex<RcbFreeList>,
    pending: Mutex<RxPendingState>,
    pending_cv: Condvar,
    instance_pending: Arc<AtomicU32>,
}

impl RxData {
    /// Current free-list depth, for tests and invariant checks.
    pub(crate) fn free_count(&self) -> usize {
        lock(&self.free).list.len()
    }

    /// The control block at `index`.
    pub(crate) fn rcb(&self, index: u32) -> &RxControlBlock {
        &self.rcbs[index as usize]
    }
}

/// Ring-walk state of one receive queue, guarded by the queue's RX lock:
/// the descriptor area, the software head, and the work list mapping each
/// slot to its Working control block.
pub(crate) struct RxRing {
    pub(crate) data: Option<Arc<RxData>>,
    pub(crate) desc: Option<DmaBuffer>,
    pub(crate) desc_next: usize,
    pub(crate) work_list: Vec<u32>,
}

impl RxRing {
    pub(crate) const fn empty() -> Self {
        Self {
            data: None,
            desc: None,
            desc_next: 0,
            work_list: Vec::new(),
        }
    }
}

// =============================================================================
// Loaned frames
// =============================================================================

/// A zero-copy view of a Working buffer loaned to the upstream stack.
/// Dropping it is the recycle callback.
pub struct LoanedBuf {
    rxd: Arc<RxData>,
    index: u32,
    len: usize,
}

impl LoanedBuf {
    /// The loaned payload.
    #[must_use]
    pub(crate) fn bytes(&self) -> &[u8] {
        let rcb = self.rxd.rcb(self.index);
        // Safety: the loan holds a reference on the block, and the buffer
        // was synced for CPU access before the loan was created.
        unsafe { rcb.buffer().bytes(self.len) }
    }
}

impl core::fmt::Debug for LoanedBuf {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LoanedBuf")
            .field("queue", &self.rxd.queue)
            .field("index", &self.index)
            .field("len", &self.len)
            .finish()
    }
}

impl Drop for LoanedBuf {
    fn drop(&mut self) {
        rx_recycle(&self.rxd, self.index);
    }
}

// =============================================================================
// Pool primitives
// =============================================================================

fn rcb_free(rxd: &RxData, index: u32) {
    let mut free = lock(&rxd.free);
    assert!(free.list.len() < free.size);
    free.list.push(index);
}

fn rcb_alloc(rxd: &RxData) -> Option<u32> {
    lock(&rxd.free).list.pop()
}

/// Recycle a loaned buffer: return it to the free list and drop the loan's
/// reference. The final reference also frees the DMA resources and, when
/// the ring is shutting down, wakes the teardown waiter once nothing is
/// pending.
pub(crate) fn rx_recycle(rxd: &Arc<RxData>, index: u32) {
    let rcb = rxd.rcb(index);

    rcb_free(rxd, index);

    let prev = rcb.refcnt.fetch_sub(1, Ordering::Release);
    debug_assert!(prev > 0);
    if prev == 1 {
        fence(Ordering::Acquire);
        // Safety: we took the count to zero, so this drop is exclusive.
        unsafe { rcb.free_buffer() };

        let mut p = lock(&rxd.pending);
        p.pending -= 1;
        rxd.instance_pending.fetch_sub(1, Ordering::Relaxed);
        if p.shutdown && p.pending == 0 {
            rxd.pending_cv.notify_all();
        }
    }
}

/// Block until every outstanding loan against `rxd` has been recycled.
pub(crate) fn wait_for_loans(rxd: &Arc<RxData>) {
    let mut p = lock(&rxd.pending);
    while p.pending > 0 {
        p = rxd
            .pending_cv
            .wait(p)
            .unwrap_or_else(std::sync::PoisonError::into_inner);
    }
}

// =============================================================================
// Pool lifecycle
// =============================================================================

/// Build the control-block pool and lists for one queue. Buffers are
/// attached separately by [`alloc_rx_dma`].
pub(crate) fn alloc_rx_data(dev: &Device, queue: usize) -> Arc<RxData> {
    let ring_size = dev.config().ring_size;
    let free_list_size = ring_size;
    let total = ring_size + free_list_size;

    let rcbs: Vec<RxControlBlock> = (0..total)
        .map(|_| RxControlBlock::new(Arc::clone(dev.allocator())))
        .collect();

    Arc::new(RxData {
        queue,
        ring_size,
        free_list_size,
        rcbs: rcbs.into_boxed_slice(),
        free: Mutex::new(RcbFreeList {
            list: Vec::with_capacity(free_list_size),
            size: free_list_size,
        }),
        pending: Mutex::new(RxPendingState {
            pending: 0,
            shutdown: false,
        }),
        pending_cv: Condvar::new(),
        instance_pending: Arc::clone(dev.rx_pending_counter()),
    })
}

/// Allocate the descriptor ring and every control block's DMA buffer, and
/// arm all ring slots with their Working buffers.
pub(crate) fn alloc_rx_dma(dev: &Device, rxd: &Arc<RxData>, ring: &mut RxRing) -> DmaResult<()> {
    let cfg = dev.config();

    let desc_size = core::mem::size_of::<crate::descriptor::RxDescriptor>() * rxd.ring_size;
    let desc = match DmaBuffer::alloc(dev.allocator(), dev.static_attrs(), false, true, desc_size) {
        Ok(d) => d,
        Err(e) => {
            error!("failed to allocate DMA resources for rx descriptor ring");
            return Err(e);
        }
    };

    // Install the area before the fallible buffer loop so a failed
    // initialization unwinds through the normal teardown path.
    ring.desc = Some(desc);
    ring.desc_next = 0;
    ring.work_list.clear();

    debug_assert_eq!(rxd.rcbs.len(), rxd.ring_size + rxd.free_list_size);
    let buf_size = cfg.rx_buf_size();
    for (i, rcb) in rxd.rcbs.iter().enumerate() {
        let mut buf =
            match DmaBuffer::alloc(dev.allocator(), dev.static_attrs(), true, false, buf_size) {
                Ok(b) => b,
                Err(e) => {
                    error!("failed to allocate rx dma buffer for ring {}", rxd.queue);
                    return Err(e);
                }
            };
        // Offset the window so the IP header lands 4-byte aligned.
        buf.reserve_front(IPHDR_ALIGNMENT);

        // Safety: the pool is still private to this thread.
        unsafe { rcb.install_buffer(buf) };
        rcb.refcnt.store(1, Ordering::Release);

        if i < rxd.ring_size {
            ring.work_list.push(i as u32);
        } else {
            rcb_free(rxd, i as u32);
        }
    }

    // Arm every slot with its Working buffer before the ring goes live.
    if let Some(desc) = ring.desc.as_ref() {
        let base = desc.vaddr();
        for slot in 0..rxd.ring_size {
            let rcb = rxd.rcb(ring.work_list[slot]);
            // Safety: the descriptor area spans ring_size entries.
            unsafe { rx_desc(base, slot) }.arm(rcb.buffer().bus_addr(), 0);
        }
        desc.sync(SyncDirection::ForDevice);
    }

    Ok(())
}

/// Release the descriptor ring and take the driver's reference off every
/// control block. Blocks still referenced by outstanding loans are counted
/// as pending; the recycle path finishes them.
pub(crate) fn free_rx_dma(dev: &Device, rxd: &Arc<RxData>, ring: &mut RxRing, failed_init: bool) {
    if let Some(mut desc) = ring.desc.take() {
        desc.free();
    }
    ring.work_list.clear();
    ring.desc_next = 0;

    let mut p = lock(&rxd.pending);
    for rcb in &rxd.rcbs {
        // A failed initialization can leave blocks that never got a
        // buffer; their count is still zero and nothing references them.
        if failed_init && rcb.refs() == 0 {
            continue;
        }

        let prev = rcb.refcnt.fetch_sub(1, Ordering::Release);
        debug_assert!(prev > 0);
        if prev == 1 {
            fence(Ordering::Acquire);
            // Safety: we took the count to zero.
            unsafe { rcb.free_buffer() };
        } else {
            p.pending += 1;
            dev.rx_pending_counter().fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Mark the ring shut down. Returns true when no loans remain and the
/// pool can be dropped immediately.
pub(crate) fn mark_shutdown(rxd: &Arc<RxData>) -> bool {
    let mut p = lock(&rxd.pending);
    p.shutdown = true;
    p.pending == 0
}

// =============================================================================
// Frame production
// =============================================================================

/// Loan the Working buffer at `index` upward and install a replacement
/// from the free list. Falls back to `None` (caller copies) when the free
/// list is empty or the buffer's handle has faulted.
fn rx_bind(
    dev: &Device,
    stats: &RxQueueStats,
    rxd: &Arc<RxData>,
    work_list: &mut [u32],
    index: usize,
    plen: usize,
) -> Option<RxFrame> {
    let Some(rep) = rcb_alloc(rxd) else {
        bump(&stats.bind_norcb);
        return None;
    };

    let cur = work_list[index];
    let rcb = rxd.rcb(cur);

    rcb.buffer().sync(SyncDirection::ForCpu);
    if rcb.buffer().check().is_faulted() {
        dev.fault_degrade();
        rcb_free(rxd, rep);
        return None;
    }

    rcb.refcnt.fetch_add(1, Ordering::AcqRel);
    work_list[index] = rep;

    Some(RxFrame::from_loan(LoanedBuf {
        rxd: Arc::clone(rxd),
        index: cur,
        len: plen,
    }))
}

/// Copy the frame at `index` into a fresh buffer, leaving the DMA buffer
/// in place for immediate reuse.
fn rx_copy(
    dev: &Device,
    stats: &RxQueueStats,
    rxd: &Arc<RxData>,
    work_list: &[u32],
    index: usize,
    plen: usize,
) -> Option<RxFrame> {
    let rcb = rxd.rcb(work_list[index]);

    rcb.buffer().sync(SyncDirection::ForCpu);
    if rcb.buffer().check().is_faulted() {
        dev.fault_degrade();
        return None;
    }

    let mut buf = Vec::new();
    if buf.try_reserve_exact(plen + IPHDR_ALIGNMENT).is_err() {
        bump(&stats.copy_nomem);
        return None;
    }
    buf.resize(IPHDR_ALIGNMENT, 0);
    // Safety: the ring lock keeps the Working buffer alive and plen came
    // from the descriptor the hardware wrote for this buffer.
    buf.extend_from_slice(unsafe { rcb.buffer().bytes(plen) });

    Some(RxFrame::from_copy(buf.into_boxed_slice()))
}

/// Decode the packet type and checksum-relevant status/error bits and tag
/// the frame with any results the hardware stands behind.
fn rx_hcksum(stats: &RxQueueStats, frame: &mut RxFrame, status: u64, err: u32, pt: u8) {
    use crate::frame::CksumFlags;

    let pinfo = ptype::decode(pt);
    let mut cksum = CksumFlags::empty();

    if !pinfo.known {
        bump(&stats.hck_unknown);
        return;
    }

    if status & rxd::STATUS_L3L4P == 0 {
        bump(&stats.hck_nol3l4p);
        return;
    }

    // IPv6 checksums under a routing or destination-options extension
    // header cannot be trusted.
    if pinfo.outer_ip
        && pinfo.outer_ip_ver == IpVersion::V6
        && status & rxd::STATUS_IPV6EXADD != 0
    {
        bump(&stats.hck_v6skip);
        return;
    }

    // IPE covers the only IP header of a plain frame; EIPE covers the
    // outer header of a tunneled one.
    if pinfo.outer_ip && pinfo.outer_ip_ver == IpVersion::V4 {
        if pinfo.tunnel == TunnelKind::None {
            if err & rxd::ERR_IPE != 0 {
                bump(&stats.hck_iperr);
            } else {
                bump(&stats.hck_v4hdrok);
                cksum |= CksumFlags::IPV4_HDRCKSUM_OK;
            }
        } else if err & rxd::ERR_EIPE != 0 {
            bump(&stats.hck_eiperr);
        } else {
            bump(&stats.hck_v4hdrok);
            cksum |= CksumFlags::IPV4_HDRCKSUM_OK;
        }
    }

    // Fragments report IP-level results only.
    if !pinfo.outer_frag {
        if pinfo.tunnel != TunnelKind::None && pinfo.tunnel_end_ver == IpVersion::V4 {
            if err & rxd::ERR_IPE != 0 {
                bump(&stats.hck_iperr);
            } else {
                bump(&stats.hck_v4hdrok);
                cksum |= CksumFlags::INNER_IPV4_HDRCKSUM_OK;
            }
        }

        let l4 = matches!(
            pinfo.inner_prot,
            InnerProt::Udp | InnerProt::Tcp | InnerProt::Sctp
        );

        // Outer L4 of an untunneled frame.
        if pinfo.outer_ip && pinfo.tunnel == TunnelKind::None && l4 {
            if err & rxd::ERR_L4E != 0 {
                bump(&stats.hck_l4err);
            } else {
                bump(&stats.hck_l4hdrok);
                cksum |= CksumFlags::FULLCKSUM_OK;
            }
        }

        // Inner L4 of a tunneled frame with resolved inner headers.
        if pinfo.outer_ip
            && matches!(pinfo.tunnel, TunnelKind::GrenatMac | TunnelKind::GrenatMacVlan)
            && !pinfo.tunnel_end_frag
            && pinfo.tunnel_end_ver != IpVersion::None
            && l4
        {
            if err & rxd::ERR_L4E != 0 {
                bump(&stats.hck_l4err);
            } else {
                bump(&stats.hck_l4hdrok);
                cksum |= CksumFlags::INNER_FULLCKSUM_OK;
            }
        }
    }

    if cksum.is_empty() {
        bump(&stats.hck_miss);
    } else {
        bump(&stats.hck_set);
        frame.set_cksum(cksum);
    }
}

// =============================================================================
// Ring walk
// =============================================================================

/// Copy-vs-bind decision for one frame, honoring the debug override.
fn rx_prefers_bind(dev: &Device, plen: usize) -> bool {
    #[cfg(debug_assertions)]
    {
        match debug_rx::MODE.load(Ordering::Relaxed) {
            debug_rx::BCOPY => return false,
            debug_rx::DMABIND => return true,
            _ => {}
        }
    }
    plen >= dev.config().rx_dma_min
}

/// Walk hardware-completed descriptors and produce frames.
///
/// `poll_bytes` of `None` means interrupt context: the walk is bounded by
/// the configured frames-per-interrupt limit. With a byte quota the walk
/// stops before a frame would push the total past it. Must be called with
/// the queue's RX lock held (the `&mut RxRing` is the guard's contents).
pub(crate) fn ring_rx(
    dev: &Device,
    itrq: &Trqpair,
    ring: &mut RxRing,
    poll_bytes: Option<usize>,
) -> Vec<RxFrame> {
    let stats = &itrq.rx_stats;

    if !dev.state().is_operational() {
        return Vec::new();
    }
    let Some(rxd) = ring.data.clone() else {
        return Vec::new();
    };

    // Sync the descriptor area and make sure the hardware's view of it is
    // trustworthy before reading anything.
    let base = {
        let Some(desc) = ring.desc.as_ref() else {
            return Vec::new();
        };
        desc.sync(SyncDirection::ForCpu);
        if desc.check().is_faulted() {
            dev.fault_degrade();
            return Vec::new();
        }
        desc.vaddr()
    };

    let mut rx_bytes: u64 = 0;
    let mut rx_frames: u64 = 0;
    let mut frames = Vec::new();
    let mut cur_head = ring.desc_next;

    // Invariant of the loop: cur_head always names the descriptor being
    // examined; on exit it names one that has NOT been consumed.
    loop {
        // Safety: cur_head < ring_size and the area is ring_size entries.
        let desc = unsafe { rx_desc(base, cur_head) };
        let stword = desc.status_error_len();

        if stword & rxd::STATUS_DD == 0 {
            break;
        }

        // Error bits are only valid alongside EOP. Nothing should produce
        // a multi-descriptor frame in this configuration; that would mean
        // the ring itself is not what we programmed.
        assert!(
            stword & rxd::STATUS_EOF != 0,
            "rx descriptor completed without EOP"
        );

        let err = ((stword & rxd::QW1_ERROR_MASK) >> rxd::QW1_ERROR_SHIFT) as u32;
        if err & rxd::ERR_FATAL != 0 {
            bump(&stats.desc_error);
        } else {
            let plen = ((stword & rxd::QW1_LENGTH_MASK) >> rxd::QW1_LENGTH_SHIFT) as usize;
            let pt = ((stword & rxd::QW1_PTYPE_MASK) >> rxd::QW1_PTYPE_SHIFT) as u8;

            // Stop before this frame would exceed the polling quota.
            if let Some(quota) = poll_bytes {
                if rx_bytes + plen as u64 > quota as u64 {
                    break;
                }
            }
            rx_bytes += plen as u64;

            let mut frame = if rx_prefers_bind(dev, plen) {
                rx_bind(dev, stats, &rxd, &mut ring.work_list, cur_head, plen)
            } else {
                None
            };
            if frame.is_none() {
                frame = rx_copy(dev, stats, &rxd, &ring.work_list, cur_head, plen);
            }

            if let Some(mut f) = frame {
                if dev.config().rx_hcksum_enable {
                    rx_hcksum(stats, &mut f, stword, err, pt);
                }
                frames.push(f);
            }
        }

        // Re-arm the descriptor with the (possibly fresh) Working buffer.
        let rcb = rxd.rcb(ring.work_list[cur_head]);
        desc.arm(rcb.buffer().bus_addr(), 0);

        cur_head = next_desc(cur_head, 1, rxd.ring_size);

        // Liveness bound; an interrupt is not dissimilar from a polling
        // request here.
        rx_frames += 1;
        if rx_frames >= dev.config().rx_limit_per_intr as u64 {
            bump(&stats.intr_limit);
            break;
        }
    }

    // Push the re-armed descriptors out and hand the slots back to
    // hardware with a single tail write.
    {
        let Some(desc) = ring.desc.as_ref() else {
            return frames;
        };
        desc.sync(SyncDirection::ForDevice);
        if desc.check().is_faulted() {
            dev.fault_degrade();
        }
    }

    if rx_frames != 0 {
        ring.desc_next = cur_head;
        let tail = prev_desc(cur_head, 1, rxd.ring_size);

        dev.regs().write32(qrx_tail(itrq.index as u32), tail as u32);
        if dev.regs().check().is_faulted() {
            dev.fault_degrade();
        }

        add(&stats.bytes, rx_bytes);
        add(&stats.packets, rx_frames);
    }

    frames
}

// =============================================================================
// Tests
// =============================================================================
