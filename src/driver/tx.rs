//! Transmit pool and ring engine.
//!
//! A frame takes one of two shapes on the ring: small frames are copied
//! into a control block's pre-allocated staging buffer behind a single
//! data descriptor; large or segmentation-offload frames have each
//! fragment DMA-bound, with one data descriptor per scatter/gather cookie.
//! Checksum and segmentation offloads prepend a context descriptor.
//!
//! Completions do not come back through the descriptors: the hardware
//! writes the index of the last finished descriptor to a 4-byte write-back
//! head just past the ring. Reclaim walks the work list up to that index,
//! returns the control blocks, and unblocks the upstream stack when a
//! blocked ring crosses the free threshold again.

use std::sync::{Arc, Mutex};

use log::{error, warn};

use crate::descriptor::bits::{ctx, txd};
use crate::descriptor::{TxDescriptor, tx_ctx_desc, tx_desc, tx_wb_head};
use crate::driver::device::Device;
use crate::driver::error::DmaResult;
use crate::driver::offload::{TxContext, tx_context};
use crate::driver::stats::{add, bump};
use crate::driver::trqpair::Trqpair;
use crate::driver::{lock, next_desc};
use crate::frame::TxFrame;
use crate::hal::dma::{Cookie, DmaAllocator, DmaBuffer, DmaHandle, SyncDirection};
use crate::hal::regs::qtx_tail;

// =============================================================================
// Control blocks
// =============================================================================

/// What a Working transmit control block currently carries.
#[derive(Debug)]
pub(crate) enum TcbKind {
    /// On the free list; carrying nothing.
    None,
    /// The frame was copied into the staging buffer.
    Copy,
    /// The frame's fragment is DMA-bound; one descriptor per cookie.
    Dma {
        /// The scatter/gather list of the binding.
        cookies: Vec<Cookie>,
        /// The binding went through the segmentation-offload handle.
        used_lso: bool,
    },
    /// Owns a context descriptor slot; no data attached.
    Desc,
}

/// One transmit control block: a staging buffer for the copy path, two
/// pre-allocated bind handles (regular and segmentation scatter lengths),
/// and the upstream frame when this block heads a frame.
pub(crate) struct TxControlBlock {
    kind: TcbKind,
    dma: DmaBuffer,
    bind_handle: DmaHandle,
    lso_bind_handle: DmaHandle,
    frame: Option<TxFrame>,
}

impl TxControlBlock {
    /// Descriptor slots this block's occupancy consumed.
    fn desc_slots(&self) -> usize {
        match &self.kind {
            TcbKind::Dma { cookies, .. } => cookies.len(),
            _ => 1,
        }
    }

    fn cookie(&self, i: usize) -> Cookie {
        match &self.kind {
            TcbKind::Dma { cookies, .. } => cookies[i],
            _ => panic!("cookie access on a non-bound tx control block"),
        }
    }
}

/// The transmit control-block free list: a counter-tracked stack.
pub(crate) struct TcbFreeList {
    list: Vec<TxControlBlock>,
    size: usize,
}

impl TcbFreeList {
    pub(crate) const fn empty() -> Self {
        Self {
            list: Vec::new(),
            size: 0,
        }
    }

    /// Current depth, for tests and invariant checks.
    pub(crate) fn len(&self) -> usize {
        self.list.len()
    }
}

/// Transmit ring state, guarded by the queue's TX lock.
pub(crate) struct TxRing {
    pub(crate) desc: Option<DmaBuffer>,
    pub(crate) ring_size: usize,
    pub(crate) head: usize,
    pub(crate) tail: usize,
    pub(crate) free: usize,
    pub(crate) work_list: Vec<Option<TxControlBlock>>,
    pub(crate) blocked: bool,
}

impl TxRing {
    pub(crate) const fn empty() -> Self {
        Self {
            desc: None,
            ring_size: 0,
            head: 0,
            tail: 0,
            free: 0,
            work_list: Vec::new(),
            blocked: false,
        }
    }
}

// =============================================================================
// Pool primitives
// =============================================================================

fn tcb_free(free_list: &Mutex<TcbFreeList>, tcb: TxControlBlock) {
    let mut fl = lock(free_list);
    assert!(fl.list.len() < fl.size);
    fl.list.push(tcb);
}

fn tcb_alloc(free_list: &Mutex<TcbFreeList>) -> Option<TxControlBlock> {
    lock(free_list).list.pop()
}

/// Return a Working control block to its resting state: undo any binding,
/// release the upstream frame, and clear the occupancy tag.
///
/// # Panics
///
/// Panics when the block carries no occupancy; resetting a free block
/// means the work list and free list disagree.
fn tcb_reset(alloc: &Arc<dyn DmaAllocator>, tcb: &mut TxControlBlock) {
    match core::mem::replace(&mut tcb.kind, TcbKind::None) {
        TcbKind::Copy => tcb.dma.set_len(0),
        TcbKind::Dma { cookies, used_lso } => {
            let handle = if used_lso {
                tcb.lso_bind_handle
            } else {
                tcb.bind_handle
            };
            alloc.unbind(handle);
            drop(cookies);
        }
        TcbKind::Desc => {}
        TcbKind::None => panic!("resetting tx control block with no occupancy"),
    }
    tcb.frame = None;
}

fn destroy_tcb(alloc: &Arc<dyn DmaAllocator>, mut tcb: TxControlBlock) {
    if !matches!(tcb.kind, TcbKind::None) {
        tcb_reset(alloc, &mut tcb);
    }
    alloc.free_handle(tcb.bind_handle);
    alloc.free_handle(tcb.lso_bind_handle);
    // The staging buffer frees itself on drop.
}

// =============================================================================
// Pool lifecycle
// =============================================================================

fn alloc_tcb(dev: &Device, buf_size: usize) -> DmaResult<TxControlBlock> {
    let alloc = dev.allocator();

    let bind_handle = match alloc.alloc_handle(dev.txbind_attrs()) {
        Ok(h) => h,
        Err(e) => {
            error!("failed to allocate DMA handle for tx data binding");
            return Err(e);
        }
    };
    let lso_bind_handle = match alloc.alloc_handle(dev.txbind_lso_attrs()) {
        Ok(h) => h,
        Err(e) => {
            error!("failed to allocate DMA handle for tx LSO data binding");
            alloc.free_handle(bind_handle);
            return Err(e);
        }
    };
    let dma = match DmaBuffer::alloc(alloc, dev.static_attrs(), true, false, buf_size) {
        Ok(d) => d,
        Err(e) => {
            error!("failed to allocate {buf_size} bytes of DMA for tx data binding");
            alloc.free_handle(lso_bind_handle);
            alloc.free_handle(bind_handle);
            return Err(e);
        }
    };

    Ok(TxControlBlock {
        kind: TcbKind::None,
        dma,
        bind_handle,
        lso_bind_handle,
        frame: None,
    })
}

/// Allocate the descriptor ring (with its trailing write-back head) and
/// the control-block pool for one queue.
pub(crate) fn alloc_tx_dma(dev: &Device, itrq: &Trqpair) -> DmaResult<()> {
    let cfg = dev.config();
    let ring_size = cfg.ring_size;
    let free_list_size = cfg.tx_free_list_size();

    // One extra descriptor's worth of space holds the write-back head.
    let desc_size = TxDescriptor::SIZE * ring_size + TxDescriptor::SIZE;
    let desc = match DmaBuffer::alloc(dev.allocator(), dev.static_attrs(), false, true, desc_size) {
        Ok(d) => d,
        Err(e) => {
            error!("failed to allocate DMA resources for tx descriptor ring");
            return Err(e);
        }
    };

    {
        let mut tx = lock(&itrq.tx);
        tx.desc = Some(desc);
        tx.ring_size = ring_size;
        tx.head = 0;
        tx.tail = 0;
        tx.free = ring_size;
        tx.work_list = (0..ring_size).map(|_| None).collect();
        tx.blocked = false;
    }
    lock(&itrq.tcb_free).size = free_list_size;

    let buf_size = cfg.tx_buf_size();
    for _ in 0..free_list_size {
        match alloc_tcb(dev, buf_size) {
            Ok(tcb) => tcb_free(&itrq.tcb_free, tcb),
            Err(e) => {
                free_tx_dma(dev, itrq);
                return Err(e);
            }
        }
    }

    Ok(())
}

/// Release the descriptor ring and the whole control-block pool.
pub(crate) fn free_tx_dma(dev: &Device, itrq: &Trqpair) {
    let mut drained: Vec<TxControlBlock> = Vec::new();

    {
        let mut tx = lock(&itrq.tx);
        if let Some(mut d) = tx.desc.take() {
            d.free();
        }
        drained.extend(tx.work_list.iter_mut().filter_map(Option::take));
        tx.work_list = Vec::new();
        tx.head = 0;
        tx.tail = 0;
        tx.free = 0;
        tx.ring_size = 0;
        tx.blocked = false;
    }
    {
        let mut fl = lock(&itrq.tcb_free);
        drained.extend(fl.list.drain(..));
        fl.size = 0;
    }

    for tcb in drained {
        destroy_tcb(dev.allocator(), tcb);
    }
}

// =============================================================================
// Send
// =============================================================================

fn tx_bind_fragment(dev: &Device, itrq: &Trqpair, seg: &[u8], use_lso: bool) -> Option<TxControlBlock> {
    let Some(mut tcb) = tcb_alloc(&itrq.tcb_free) else {
        bump(&itrq.tx_stats.err_notcb);
        return None;
    };

    let handle = if use_lso {
        tcb.lso_bind_handle
    } else {
        tcb.bind_handle
    };

    let binding = match dev.allocator().bind(handle, seg.as_ptr(), seg.len(), true) {
        Ok(b) => b,
        Err(e) => {
            warn!("tx dma bind failed: {e}");
            // Nothing was recorded on the block yet; straight back it goes.
            tcb_free(&itrq.tcb_free, tcb);
            return None;
        }
    };
    assert!(binding.cookie_count > 0, "successful bind produced no cookies");

    let mut cookies = Vec::with_capacity(binding.cookie_count);
    cookies.push(binding.first);
    for _ in 1..binding.cookie_count {
        cookies.push(dev.allocator().next_cookie(handle));
    }

    tcb.kind = TcbKind::Dma {
        cookies,
        used_lso: use_lso,
    };
    Some(tcb)
}

/// Emit one data descriptor at the tail for `cookie`.
fn tx_set_data_desc(tx: &mut TxRing, base: *mut u8, tctx: &TxContext, cookie: Cookie, last: bool) {
    tx.free -= 1;
    let slot = tx.tail;
    tx.tail = next_desc(slot, 1, tx.ring_size);

    let mut cmd = txd::CMD_ICRC | tctx.data_cmdflags;
    // The last data descriptor tells the hardware the frame is ready.
    if last {
        cmd |= txd::CMD_EOP | txd::CMD_RS;
    }

    let qw1 = txd::DTYPE_DATA
        | (u64::from(tctx.data_offsets) << txd::QW1_OFFSET_SHIFT)
        | (cmd << txd::QW1_CMD_SHIFT)
        | ((cookie.len as u64) << txd::QW1_BUF_SZ_SHIFT);
    // Safety: slot < ring_size under the TX lock.
    unsafe { tx_desc(base, slot) }.program(cookie.bus_addr, qw1);
}

/// Tear down a failed admission: return every allocated control block and
/// hand the frame back with the blocked flag latched, guaranteeing an
/// eventual ring-update notification.
fn txfail(
    dev: &Device,
    itrq: &Trqpair,
    tcb_ctx: Option<TxControlBlock>,
    tcbs: Vec<TxControlBlock>,
    frame: TxFrame,
) -> Option<TxFrame> {
    if let Some(mut tcb) = tcb_ctx {
        tcb_reset(dev.allocator(), &mut tcb);
        tcb_free(&itrq.tcb_free, tcb);
    }
    for mut tcb in tcbs {
        tcb_reset(dev.allocator(), &mut tcb);
        tcb_free(&itrq.tcb_free, tcb);
    }

    let mut tx = lock(&itrq.tx);
    tx.blocked = true;
    drop(tx);

    Some(frame)
}

/// Send one frame.
///
/// Returns `None` when the frame was accepted or dropped; returns the same
/// frame back when the ring is out of resources, with the blocked flag
/// latched so the upstream stack can park until the ring-update callback.
pub(crate) fn ring_tx(dev: &Device, itrq: &Trqpair, frame: TxFrame) -> Option<TxFrame> {
    let cfg = dev.config();
    let stats = &itrq.tx_stats;

    if !dev.state().is_operational() || !dev.link_up() {
        return None;
    }

    // Work out checksum/LSO/tunnel context before touching the ring.
    let tctx = match tx_context(cfg, stats, &frame) {
        Ok(t) => t,
        Err(_) => {
            bump(&stats.err_context);
            return None;
        }
    };
    let use_lso = tctx.uses_lso();
    let mpsize = frame.total_len();

    let mut needed: usize = 0;

    // A context descriptor needs a control block of its own; it behaves
    // like a NOP on the reclaim side.
    let mut tcb_ctx: Option<TxControlBlock> = None;
    if tctx.needs_ctx_desc() {
        let Some(mut tcb) = tcb_alloc(&itrq.tcb_free) else {
            bump(&stats.err_notcb);
            return txfail(dev, itrq, None, Vec::new(), frame);
        };
        tcb.kind = TcbKind::Desc;
        needed += 1;
        tcb_ctx = Some(tcb);
    }

    // Above the copy threshold (or for LSO, always) each fragment is
    // bound; below it the whole chain is copied into one staging buffer.
    let do_bind = use_lso || mpsize > cfg.tx_dma_min;
    let mut tcbs: Vec<TxControlBlock> = Vec::new();

    if do_bind {
        for seg in frame.segs() {
            if seg.is_empty() {
                continue;
            }
            match tx_bind_fragment(dev, itrq, seg, use_lso) {
                Some(tcb) => {
                    needed += tcb.desc_slots();
                    tcbs.push(tcb);
                }
                None => return txfail(dev, itrq, tcb_ctx, tcbs, frame),
            }
        }
        if tcbs.is_empty() {
            // An all-empty chain has nothing to put on the wire.
            if let Some(mut tcb) = tcb_ctx.take() {
                tcb_reset(dev.allocator(), &mut tcb);
                tcb_free(&itrq.tcb_free, tcb);
            }
            return None;
        }
    } else {
        let Some(mut tcb) = tcb_alloc(&itrq.tcb_free) else {
            bump(&stats.err_notcb);
            return txfail(dev, itrq, tcb_ctx, tcbs, frame);
        };
        tcb.kind = TcbKind::Copy;

        debug_assert!(tcb.dma.is_empty());
        debug_assert!(tcb.dma.size() >= mpsize);
        let mut off = 0;
        for seg in frame.segs() {
            if seg.is_empty() {
                continue;
            }
            tcb.dma.write_at(off, seg);
            off += seg.len();
        }
        debug_assert_eq!(off, mpsize);
        tcb.dma.set_len(mpsize);
        tcb.dma.sync(SyncDirection::ForDevice);

        needed += 1;
        tcbs.push(tcb);
    }

    // Admission gate: reserve descriptors or hand the frame back.
    let mut tx = lock(&itrq.tx);
    let base = match tx.desc.as_ref() {
        Some(d) if tx.free >= cfg.tx_block_thresh => d.vaddr(),
        _ => {
            bump(&stats.err_nodescs);
            drop(tx);
            return txfail(dev, itrq, tcb_ctx, tcbs, frame);
        }
    };
    debug_assert!(tx.free >= needed);

    // The frame rides on the first data control block until reclaim.
    tcbs[0].frame = Some(frame);

    // The context descriptor must precede the data descriptors.
    if let Some(ctx_tcb) = tcb_ctx.take() {
        tx.free -= 1;
        let slot = tx.tail;
        tx.tail = next_desc(slot, 1, tx.ring_size);
        tx.work_list[slot] = Some(ctx_tcb);

        let tunneling = if tctx.tunneled { tctx.tunnel_fld } else { 0 };
        let mut qw1 = txd::DTYPE_CONTEXT;
        if use_lso {
            qw1 |= (tctx.ctx_cmdflags << ctx::QW1_CMD_SHIFT)
                | (u64::from(tctx.tsolen) << ctx::QW1_TSO_LEN_SHIFT)
                | (u64::from(tctx.mss) << ctx::QW1_MSS_SHIFT);
        }
        // Safety: slot < ring_size under the TX lock.
        unsafe { tx_ctx_desc(base, slot) }.program(tunneling, qw1);
    }

    if do_bind {
        let n = tcbs.len();
        for (i, tcb) in tcbs.into_iter().enumerate() {
            // The block sits in the work list at its first descriptor;
            // reclaim skips the rest via the cookie count.
            let slot = tx.tail;
            let count = tcb.desc_slots();
            for c in 0..count {
                let last = i == n - 1 && c == count - 1;
                tx_set_data_desc(&mut tx, base, &tctx, tcb.cookie(c), last);
            }
            tx.work_list[slot] = Some(tcb);
        }
    } else {
        let tcb = tcbs.pop().expect("copy path produced a control block");
        tx.free -= 1;
        let slot = tx.tail;
        tx.tail = next_desc(slot, 1, tx.ring_size);

        let cmd = txd::CMD_EOP | txd::CMD_RS | txd::CMD_ICRC | tctx.data_cmdflags;
        let qw1 = txd::DTYPE_DATA
            | (u64::from(tctx.data_offsets) << txd::QW1_OFFSET_SHIFT)
            | (cmd << txd::QW1_CMD_SHIFT)
            | ((tcb.dma.len() as u64) << txd::QW1_BUF_SZ_SHIFT);
        // Safety: slot < ring_size under the TX lock.
        unsafe { tx_desc(base, slot) }.program(tcb.dma.bus_addr(), qw1);
        tx.work_list[slot] = Some(tcb);
    }

    // The device must not observe a stale ring: sync the descriptors
    // before the tail write makes them visible.
    if let Some(d) = tx.desc.as_ref() {
        d.sync(SyncDirection::ForDevice);
    }
    dev.regs().write32(qtx_tail(itrq.index as u32), tx.tail as u32);
    if dev.regs().check().is_faulted() {
        // The memory is already with the device; there is nothing to
        // unwind. Count it as sent and degrade.
        dev.fault_degrade();
    }

    add(&stats.bytes, mpsize as u64);
    bump(&stats.packets);
    add(&stats.descriptors, needed as u64);

    drop(tx);
    None
}

// =============================================================================
// Reclaim
// =============================================================================

/// Reclaim descriptors the hardware has finished, per the write-back head.
/// Unblocks the ring when enough descriptors come free.
pub(crate) fn tx_recycle_ring(dev: &Device, itrq: &Trqpair) {
    let stats = &itrq.tx_stats;

    let mut tx = lock(&itrq.tx);
    if tx.desc.is_none() {
        return;
    }

    debug_assert!(tx.free <= tx.ring_size);
    if tx.free == tx.ring_size {
        if tx.blocked {
            tx.blocked = false;
            dev.upstream().tx_ring_update(itrq.index);
            bump(&stats.num_unblocked);
        }
        return;
    }

    // The hardware writes the head location with strict ordering; sync
    // just that word and make sure the area is still trustworthy.
    let ring_size = tx.ring_size;
    let (base, faulted) = {
        let Some(desc) = tx.desc.as_ref() else {
            return;
        };
        desc.sync_range(
            ring_size * TxDescriptor::SIZE,
            core::mem::size_of::<u32>(),
            SyncDirection::ForCpu,
        );
        (desc.vaddr(), desc.check().is_faulted())
    };
    if faulted {
        drop(tx);
        dev.fault_degrade();
        return;
    }

    // Safety: the area carries the write-back word past the ring.
    let wbhead = unsafe { tx_wb_head(base, ring_size) } as usize;
    assert!(wbhead < ring_size, "write-back head {wbhead} out of range");

    let mut toclean = tx.head;
    let mut count: usize = 0;
    let mut reclaim: Vec<TxControlBlock> = Vec::new();

    while toclean != wbhead {
        let tcb = tx.work_list[toclean]
            .take()
            .expect("tx work list slot empty during recycle");

        // A bound block may cover several descriptors; the cookie count
        // says how many slots to walk past.
        let slots = tcb.desc_slots();
        for _ in 0..slots {
            // Safety: toclean < ring_size under the TX lock.
            unsafe { tx_desc(base, toclean) }.clear();
            toclean = next_desc(toclean, 1, ring_size);
            count += 1;
        }
        reclaim.push(tcb);
    }

    tx.head = wbhead;
    tx.free += count;
    add(&stats.recycled, count as u64);
    debug_assert!(tx.free <= tx.ring_size);

    if tx.blocked && tx.free > dev.config().tx_block_thresh {
        tx.blocked = false;
        dev.upstream().tx_ring_update(itrq.index);
        bump(&stats.num_unblocked);
    }

    drop(tx);

    // Bindings are undone outside the ring lock.
    for mut tcb in reclaim {
        tcb_reset(dev.allocator(), &mut tcb);
        tcb_free(&itrq.tcb_free, tcb);
    }
}

/// Shutdown reclaim: return every outstanding control block and zero the
/// descriptors between head and tail. The queue must already be disabled
/// in hardware.
pub(crate) fn tx_cleanup_ring(dev: &Device, itrq: &Trqpair) {
    let mut tx = lock(&itrq.tx);
    let Some(base) = tx.desc.as_ref().map(DmaBuffer::vaddr) else {
        return;
    };
    debug_assert!(tx.free <= tx.ring_size);

    #[cfg(debug_assertions)]
    {
        use crate::hal::regs::{QTX_ENA_QENA_REQ, QTX_ENA_QENA_STAT, qtx_ena};

        let ena = dev.regs().read32(qtx_ena(itrq.index as u32));
        assert_eq!(
            ena & (QTX_ENA_QENA_REQ | QTX_ENA_QENA_STAT),
            0,
            "tx ring cleanup with the queue still enabled"
        );
    }

    let ring_size = tx.ring_size;
    let mut index = tx.head;
    let mut drained: Vec<TxControlBlock> = Vec::new();

    while tx.free < ring_size {
        // Slots covered by a multi-cookie binding carry no block of their
        // own; the descriptor is still zeroed.
        if let Some(tcb) = tx.work_list[index].take() {
            drained.push(tcb);
        }
        // Safety: index < ring_size under the TX lock.
        unsafe { tx_desc(base, index) }.clear();
        index = next_desc(index, 1, ring_size);
        tx.free += 1;
    }

    debug_assert_eq!(index, tx.tail);
    tx.head = tx.tail;
    drop(tx);

    for mut tcb in drained {
        tcb_reset(dev.allocator(), &mut tcb);
        tcb_free(&itrq.tcb_free, tcb);
    }
}

// =============================================================================
// Tests
// =============================================================================
