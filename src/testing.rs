//! Testing utilities and mock implementations.
//!
//! Mock implementations of the host-environment seams so the data path can
//! run on the host without hardware: an allocator backed by ordinary
//! aligned heap memory, a register file with a write log, and upstream /
//! fault-management recorders. The ring-poking helpers stand in for the
//! device, completing receive descriptors and advancing the transmit
//! write-back head.

#![allow(missing_docs)]

use std::alloc::Layout;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::descriptor::bits::rxd;
use crate::descriptor::{rx_desc, set_tx_wb_head, tx_ctx_desc, tx_desc};
use crate::driver::config::DataPathConfig;
use crate::driver::device::Device;
use crate::driver::error::{DmaError, DmaResult};
use crate::driver::lock;
use crate::frame::RxFrame;
use crate::hal::dma::{
    AccHandle, Binding, Cookie, DmaAllocator, DmaAttrs, DmaHandle, DmaRegion, FaultStatus,
    SyncDirection,
};
use crate::hal::regs::RegisterAccess;
use crate::hal::upstream::{FaultReporter, ServiceImpact, Upstream};

/// Mock bus addresses are host addresses shifted into a distinct window.
pub const MOCK_BUS_OFFSET: u64 = 0x8_0000_0000;

// =============================================================================
// Mock DMA allocator
// =============================================================================

struct MockBinding {
    cookies: Vec<Cookie>,
    cursor: usize,
}

struct MockHandle {
    attrs: DmaAttrs,
    binding: Option<MockBinding>,
}

struct MockRegion {
    ptr: usize,
    layout: Layout,
}

#[derive(Default)]
struct MockDmaState {
    next_id: u64,
    handles: HashMap<u64, MockHandle>,
    regions: HashMap<u64, MockRegion>,
}

/// Host-memory-backed [`DmaAllocator`] with scripted failures and
/// configurable cookie splitting.
pub struct MockDmaAllocator {
    state: Mutex<MockDmaState>,
    fail_handle: AtomicUsize,
    fail_memory: AtomicUsize,
    fail_bind: AtomicUsize,
    memory_budget: AtomicIsize,
    bind_split: AtomicUsize,
    faulted: AtomicBool,
}

impl MockDmaAllocator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockDmaState::default()),
            fail_handle: AtomicUsize::new(0),
            fail_memory: AtomicUsize::new(0),
            fail_bind: AtomicUsize::new(0),
            memory_budget: AtomicIsize::new(-1),
            bind_split: AtomicUsize::new(usize::MAX),
            faulted: AtomicBool::new(false),
        }
    }

    /// Fail the next `n` handle allocations.
    pub fn fail_handle_allocs(&self, n: usize) {
        self.fail_handle.store(n, Ordering::Relaxed);
    }

    /// Fail the next `n` memory allocations.
    pub fn fail_memory_allocs(&self, n: usize) {
        self.fail_memory.store(n, Ordering::Relaxed);
    }

    /// Fail the next `n` binds.
    pub fn fail_binds(&self, n: usize) {
        self.fail_bind.store(n, Ordering::Relaxed);
    }

    /// Allow `n` more memory allocations, then fail all subsequent ones.
    pub fn set_memory_budget(&self, n: isize) {
        self.memory_budget.store(n, Ordering::Relaxed);
    }

    /// Split binds into cookies of at most `bytes`.
    pub fn set_bind_split(&self, bytes: usize) {
        self.bind_split.store(bytes, Ordering::Relaxed);
    }

    /// Make every fault-management query report a fault.
    pub fn set_faulted(&self, faulted: bool) {
        self.faulted.store(faulted, Ordering::Relaxed);
    }

    /// Outstanding allocated regions.
    pub fn region_count(&self) -> usize {
        lock(&self.state).regions.len()
    }

    /// Outstanding mapping handles.
    pub fn handle_count(&self) -> usize {
        lock(&self.state).handles.len()
    }

    /// Handles with a live binding.
    pub fn bound_count(&self) -> usize {
        lock(&self.state)
            .handles
            .values()
            .filter(|h| h.binding.is_some())
            .count()
    }

    fn take_fail(counter: &AtomicUsize) -> bool {
        let v = counter.load(Ordering::Relaxed);
        if v > 0 {
            counter.store(v - 1, Ordering::Relaxed);
            return true;
        }
        false
    }
}

impl Default for MockDmaAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MockDmaAllocator {
    fn drop(&mut self) {
        let state = lock(&self.state);
        for region in state.regions.values() {
            // Safety: the pointer and layout came from std::alloc::alloc.
            unsafe { std::alloc::dealloc(region.ptr as *mut u8, region.layout) };
        }
    }
}

impl DmaAllocator for MockDmaAllocator {
    fn alloc_handle(&self, attrs: &DmaAttrs) -> DmaResult<DmaHandle> {
        if Self::take_fail(&self.fail_handle) {
            return Err(DmaError::ResourceExhausted);
        }
        let mut state = lock(&self.state);
        state.next_id += 1;
        let id = state.next_id;
        state.handles.insert(
            id,
            MockHandle {
                attrs: *attrs,
                binding: None,
            },
        );
        Ok(DmaHandle(id))
    }

    fn free_handle(&self, handle: DmaHandle) {
        lock(&self.state).handles.remove(&handle.0);
    }

    fn alloc_memory(&self, handle: DmaHandle, size: usize, _streaming: bool) -> DmaResult<DmaRegion> {
        if Self::take_fail(&self.fail_memory) {
            return Err(DmaError::ResourceExhausted);
        }
        let budget = self.memory_budget.load(Ordering::Relaxed);
        if budget >= 0 {
            if budget == 0 {
                return Err(DmaError::ResourceExhausted);
            }
            self.memory_budget.store(budget - 1, Ordering::Relaxed);
        }

        let mut state = lock(&self.state);
        let align = state
            .handles
            .get(&handle.0)
            .map_or(4096, |h| h.attrs.alignment.max(1));
        let layout = Layout::from_size_align(size.max(1), align).map_err(|_| DmaError::ResourceExhausted)?;
        // Safety: layout has nonzero size.
        let ptr = unsafe { std::alloc::alloc(layout) };
        if ptr.is_null() {
            return Err(DmaError::ResourceExhausted);
        }

        state.next_id += 1;
        let acc = state.next_id;
        state.regions.insert(
            acc,
            MockRegion {
                ptr: ptr as usize,
                layout,
            },
        );
        Ok(DmaRegion {
            vaddr: ptr,
            len: size,
            acc: AccHandle(acc),
        })
    }

    fn free_memory(&self, acc: AccHandle) {
        if let Some(region) = lock(&self.state).regions.remove(&acc.0) {
            // Safety: the pointer and layout came from std::alloc::alloc.
            unsafe { std::alloc::dealloc(region.ptr as *mut u8, region.layout) };
        }
    }

    fn bind(
        &self,
        handle: DmaHandle,
        vaddr: *const u8,
        len: usize,
        _streaming: bool,
    ) -> DmaResult<Binding> {
        if Self::take_fail(&self.fail_bind) {
            return Err(DmaError::BindFailed);
        }

        let split = self.bind_split.load(Ordering::Relaxed);
        let mut state = lock(&self.state);
        let Some(h) = state.handles.get_mut(&handle.0) else {
            return Err(DmaError::BindFailed);
        };

        let max_cookie = split.min(h.attrs.max_cookie_size).max(1);
        let mut cookies = Vec::new();
        let mut off = 0usize;
        while off < len {
            let clen = (len - off).min(max_cookie);
            cookies.push(Cookie {
                bus_addr: vaddr as u64 + off as u64 + MOCK_BUS_OFFSET,
                len: clen,
            });
            off += clen;
        }
        if cookies.is_empty() {
            cookies.push(Cookie {
                bus_addr: vaddr as u64 + MOCK_BUS_OFFSET,
                len: 0,
            });
        }
        if cookies.len() > h.attrs.sgl_len {
            return Err(DmaError::TooManyCookies);
        }

        let first = cookies[0];
        let count = cookies.len();
        h.binding = Some(MockBinding { cookies, cursor: 0 });
        Ok(Binding {
            first,
            cookie_count: count,
        })
    }

    fn next_cookie(&self, handle: DmaHandle) -> Cookie {
        let mut state = lock(&self.state);
        let binding = state
            .handles
            .get_mut(&handle.0)
            .and_then(|h| h.binding.as_mut())
            .expect("next_cookie on unbound mock handle");
        binding.cursor += 1;
        binding.cookies[binding.cursor]
    }

    fn unbind(&self, handle: DmaHandle) {
        if let Some(h) = lock(&self.state).handles.get_mut(&handle.0) {
            h.binding = None;
        }
    }

    fn sync(&self, _handle: DmaHandle, _offset: usize, _len: usize, _dir: SyncDirection) {}

    fn check(&self, _handle: DmaHandle) -> FaultStatus {
        if self.faulted.load(Ordering::Relaxed) {
            FaultStatus::Faulted
        } else {
            FaultStatus::Ok
        }
    }
}

// =============================================================================
// Mock registers
// =============================================================================

/// Register file with scripted values and a write log.
#[derive(Default)]
pub struct MockRegisters {
    values: Mutex<HashMap<u32, u32>>,
    writes: Mutex<Vec<(u32, u32)>>,
    faulted: AtomicBool,
}

impl MockRegisters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a value for subsequent reads of `offset`.
    pub fn set_value(&self, offset: u32, value: u32) {
        lock(&self.values).insert(offset, value);
    }

    /// The most recent write to `offset`, if any.
    pub fn last_write_to(&self, offset: u32) -> Option<u32> {
        lock(&self.writes)
            .iter()
            .rev()
            .find(|(o, _)| *o == offset)
            .map(|(_, v)| *v)
    }

    /// Writes issued to `offset`.
    pub fn writes_to(&self, offset: u32) -> Vec<u32> {
        lock(&self.writes)
            .iter()
            .filter(|(o, _)| *o == offset)
            .map(|(_, v)| *v)
            .collect()
    }

    pub fn set_faulted(&self, faulted: bool) {
        self.faulted.store(faulted, Ordering::Relaxed);
    }
}

impl RegisterAccess for MockRegisters {
    fn read32(&self, offset: u32) -> u32 {
        lock(&self.values).get(&offset).copied().unwrap_or(0)
    }

    fn write32(&self, offset: u32, value: u32) {
        lock(&self.values).insert(offset, value);
        lock(&self.writes).push((offset, value));
    }

    fn check(&self) -> FaultStatus {
        if self.faulted.load(Ordering::Relaxed) {
            FaultStatus::Faulted
        } else {
            FaultStatus::Ok
        }
    }
}

// =============================================================================
// Mock upstream and fault reporter
// =============================================================================

/// Upstream recorder: captured deliveries and ring-update notifications.
#[derive(Default)]
pub struct MockUpstream {
    deliveries: Mutex<Vec<(usize, Vec<RxFrame>)>>,
    ring_updates: Mutex<Vec<usize>>,
}

impl MockUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain every delivered frame, in order.
    pub fn take_frames(&self) -> Vec<RxFrame> {
        lock(&self.deliveries)
            .drain(..)
            .flat_map(|(_, frames)| frames)
            .collect()
    }

    pub fn delivery_count(&self) -> usize {
        lock(&self.deliveries).len()
    }

    pub fn ring_update_count(&self) -> usize {
        lock(&self.ring_updates).len()
    }
}

impl Upstream for MockUpstream {
    fn rx_deliver(&self, queue: usize, frames: Vec<RxFrame>) {
        lock(&self.deliveries).push((queue, frames));
    }

    fn tx_ring_update(&self, queue: usize) {
        lock(&self.ring_updates).push(queue);
    }
}

/// Fault-management recorder.
#[derive(Default)]
pub struct MockFaultReporter {
    impacts: Mutex<Vec<ServiceImpact>>,
}

impl MockFaultReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn impact_count(&self) -> usize {
        lock(&self.impacts).len()
    }
}

impl FaultReporter for MockFaultReporter {
    fn service_impact(&self, impact: ServiceImpact) {
        lock(&self.impacts).push(impact);
    }
}

// =============================================================================
// Test rig
// =============================================================================

/// A device wired to all four mocks.
pub struct TestRig {
    pub dev: Device,
    pub dma: Arc<MockDmaAllocator>,
    pub regs: Arc<MockRegisters>,
    pub upstream: Arc<MockUpstream>,
    pub fault: Arc<MockFaultReporter>,
}

/// A ring size small enough to exercise wraparound but within the
/// supported range.
pub fn small_config() -> DataPathConfig {
    DataPathConfig::new().with_ring_size(64)
}

/// Build a device over fresh mocks.
pub fn rig(config: DataPathConfig) -> TestRig {
    let dma = Arc::new(MockDmaAllocator::new());
    let regs = Arc::new(MockRegisters::new());
    let upstream = Arc::new(MockUpstream::new());
    let fault = Arc::new(MockFaultReporter::new());
    let dev = Device::new(
        config,
        dma.clone(),
        regs.clone(),
        upstream.clone(),
        fault.clone(),
    )
    .expect("test config must validate");
    TestRig {
        dev,
        dma,
        regs,
        upstream,
        fault,
    }
}

/// Build, link up, and start a device.
pub fn started_rig(config: DataPathConfig) -> TestRig {
    let rig = rig(config);
    rig.dev.set_link_up(true);
    rig.dev.start().expect("start must succeed on fresh mocks");
    rig
}

// =============================================================================
// Ring-poking helpers (standing in for the device)
// =============================================================================

/// Write a raw write-back qword into the receive descriptor at `idx`.
pub fn rx_complete_status(rig: &TestRig, queue: usize, idx: usize, qword1: u64) {
    let itrq = rig.dev.trqpair(queue);
    let ring = lock(&itrq.rx);
    let base = ring.desc.as_ref().expect("rx ring allocated").vaddr();
    // Safety: idx is a valid ring slot in these tests.
    unsafe { rx_desc(base, idx) }.set_status_error_len(qword1);
}

/// Complete the receive descriptor at `idx` as Done/EOP with the given
/// length, packet type, error field, and extra status bits.
pub fn rx_complete(
    rig: &TestRig,
    queue: usize,
    idx: usize,
    len: usize,
    ptype: u8,
    err: u32,
    extra_status: u64,
) {
    let qw1 = rxd::STATUS_DD
        | rxd::STATUS_EOF
        | extra_status
        | (u64::from(err) << rxd::QW1_ERROR_SHIFT)
        | (u64::from(ptype) << rxd::QW1_PTYPE_SHIFT)
        | ((len as u64) << rxd::QW1_LENGTH_SHIFT);
    rx_complete_status(rig, queue, idx, qw1);
}

/// Write payload bytes into the Working buffer of ring slot `idx`.
pub fn rx_fill(rig: &TestRig, queue: usize, idx: usize, data: &[u8]) {
    let itrq = rig.dev.trqpair(queue);
    let ring = lock(&itrq.rx);
    let rxd = ring.data.as_ref().expect("rx data allocated");
    let rcb = rxd.rcb(ring.work_list[idx]);
    assert!(data.len() <= rcb.buffer().size());
    // Safety: the buffer is live and nothing else writes it in tests.
    unsafe {
        core::ptr::copy_nonoverlapping(data.as_ptr(), rcb.buffer().vaddr(), data.len());
    }
}

/// Bus address of the Working buffer at ring slot `idx`.
pub fn rx_slot_bus_addr(rig: &TestRig, queue: usize, idx: usize) -> u64 {
    let itrq = rig.dev.trqpair(queue);
    let ring = lock(&itrq.rx);
    let rxd = ring.data.as_ref().expect("rx data allocated");
    rxd.rcb(ring.work_list[idx]).buffer().bus_addr()
}

/// Programmed packet address of the receive descriptor at `idx`.
pub fn rx_desc_pkt_addr(rig: &TestRig, queue: usize, idx: usize) -> u64 {
    let itrq = rig.dev.trqpair(queue);
    let ring = lock(&itrq.rx);
    let base = ring.desc.as_ref().expect("rx ring allocated").vaddr();
    // Safety: idx is a valid ring slot in these tests.
    unsafe { rx_desc(base, idx) }.pkt_addr()
}

/// Free-list depth of the receive pool.
pub fn rx_free_count(rig: &TestRig, queue: usize) -> usize {
    let itrq = rig.dev.trqpair(queue);
    let ring = lock(&itrq.rx);
    ring.data.as_ref().expect("rx data allocated").free_count()
}

/// Raw (buffer address, qword1) of the transmit descriptor at `idx`.
pub fn tx_desc_raw(rig: &TestRig, queue: usize, idx: usize) -> (u64, u64) {
    let itrq = rig.dev.trqpair(queue);
    let tx = lock(&itrq.tx);
    let base = tx.desc.as_ref().expect("tx ring allocated").vaddr();
    // Safety: idx is a valid ring slot in these tests.
    let d = unsafe { tx_desc(base, idx) };
    (d.raw_buffer_addr(), d.raw_qword1())
}

/// Raw (tunneling params, qword1) of the context descriptor at `idx`.
pub fn tx_ctx_raw(rig: &TestRig, queue: usize, idx: usize) -> (u32, u64) {
    let itrq = rig.dev.trqpair(queue);
    let tx = lock(&itrq.tx);
    let base = tx.desc.as_ref().expect("tx ring allocated").vaddr();
    // Safety: idx is a valid ring slot in these tests.
    let d = unsafe { tx_ctx_desc(base, idx) };
    (d.raw_tunneling_params(), d.raw_qword1())
}

/// Advance the transmit write-back head, as the device would.
pub fn tx_write_wbhead(rig: &TestRig, queue: usize, head: u32) {
    let itrq = rig.dev.trqpair(queue);
    let tx = lock(&itrq.tx);
    let desc = tx.desc.as_ref().expect("tx ring allocated");
    // Safety: the area carries the write-back word past the ring.
    unsafe { set_tx_wb_head(desc.vaddr(), tx.ring_size, head) };
}

// =============================================================================
// Frame builders
// =============================================================================

/// Canned transmit frames with real header bytes.
pub mod frames {
    use crate::constants::{
        ETHERTYPE_IP, ETHERTYPE_IPV6, ETHERTYPE_VLAN, IPPROTO_SCTP, IPPROTO_TCP, IPPROTO_UDP,
    };
    use crate::frame::TxFrame;

    fn push_u16(buf: &mut Vec<u8>, v: u16) {
        buf.extend_from_slice(&v.to_be_bytes());
    }

    fn ether_header(buf: &mut Vec<u8>, ethertype: u16, vlan: bool) {
        buf.extend_from_slice(&[0x02, 0, 0, 0, 0, 1]);
        buf.extend_from_slice(&[0x02, 0, 0, 0, 0, 2]);
        if vlan {
            push_u16(buf, ETHERTYPE_VLAN);
            push_u16(buf, 0x0064);
        }
        push_u16(buf, ethertype);
    }

    fn ipv4_header(buf: &mut Vec<u8>, proto: u8, payload_len: usize) {
        let total = 20 + payload_len;
        buf.push(0x45);
        buf.push(0);
        push_u16(buf, total as u16);
        buf.extend_from_slice(&[0, 0, 0, 0]);
        buf.push(64);
        buf.push(proto);
        push_u16(buf, 0);
        buf.extend_from_slice(&[10, 0, 0, 1]);
        buf.extend_from_slice(&[10, 0, 0, 2]);
    }

    fn ipv6_header(buf: &mut Vec<u8>, next: u8, payload_len: usize) {
        buf.push(0x60);
        buf.extend_from_slice(&[0, 0, 0]);
        push_u16(buf, payload_len as u16);
        buf.push(next);
        buf.push(64);
        buf.extend_from_slice(&[0; 16]);
        buf.extend_from_slice(&[0; 16]);
    }

    fn tcp_header(buf: &mut Vec<u8>) {
        push_u16(buf, 12345);
        push_u16(buf, 80);
        buf.extend_from_slice(&[0, 0, 0, 0]);
        buf.extend_from_slice(&[0, 0, 0, 0]);
        buf.push(0x50);
        buf.push(0x18);
        push_u16(buf, 0xFFFF);
        push_u16(buf, 0);
        push_u16(buf, 0);
    }

    fn udp_header(buf: &mut Vec<u8>, payload_len: usize) {
        push_u16(buf, 12345);
        push_u16(buf, 4789);
        push_u16(buf, (8 + payload_len) as u16);
        push_u16(buf, 0);
    }

    fn sctp_header(buf: &mut Vec<u8>) {
        push_u16(buf, 12345);
        push_u16(buf, 80);
        buf.extend_from_slice(&[0, 0, 0, 0]);
        buf.extend_from_slice(&[0, 0, 0, 0]);
    }

    fn payload(buf: &mut Vec<u8>, len: usize) {
        buf.extend((0..len).map(|i| (i & 0xFF) as u8));
    }

    /// Ethernet/IPv4/TCP frame with `payload_len` payload bytes.
    pub fn ipv4_tcp_frame(payload_len: usize, vlan: bool) -> TxFrame {
        let mut buf = Vec::new();
        ether_header(&mut buf, ETHERTYPE_IP, vlan);
        ipv4_header(&mut buf, IPPROTO_TCP, 20 + payload_len);
        tcp_header(&mut buf);
        payload(&mut buf, payload_len);
        TxFrame::single(&buf)
    }

    /// Ethernet/802.1Q/IPv4/UDP frame.
    pub fn vlan_ipv4_udp_frame(payload_len: usize) -> TxFrame {
        let mut buf = Vec::new();
        ether_header(&mut buf, ETHERTYPE_IP, true);
        ipv4_header(&mut buf, IPPROTO_UDP, 8 + payload_len);
        udp_header(&mut buf, payload_len);
        payload(&mut buf, payload_len);
        TxFrame::single(&buf)
    }

    /// Ethernet/IPv6/SCTP frame.
    pub fn ipv6_sctp_frame(payload_len: usize) -> TxFrame {
        let mut buf = Vec::new();
        ether_header(&mut buf, ETHERTYPE_IPV6, false);
        ipv6_header(&mut buf, IPPROTO_SCTP, 12 + payload_len);
        sctp_header(&mut buf);
        payload(&mut buf, payload_len);
        TxFrame::single(&buf)
    }

    /// VXLAN-encapsulated Ethernet/IPv4/TCP inside Ethernet/IPv4/UDP.
    pub fn vxlan_ipv4_tcp_frame(payload_len: usize) -> TxFrame {
        let inner_len = 14 + 20 + 20 + payload_len;
        let mut buf = Vec::new();
        ether_header(&mut buf, ETHERTYPE_IP, false);
        ipv4_header(&mut buf, IPPROTO_UDP, 8 + 8 + inner_len);
        udp_header(&mut buf, 8 + inner_len);
        // VXLAN header: flags + reserved + VNI.
        buf.extend_from_slice(&[0x08, 0, 0, 0, 0, 0, 0x64, 0]);
        ether_header(&mut buf, ETHERTYPE_IP, false);
        ipv4_header(&mut buf, IPPROTO_TCP, 20 + payload_len);
        tcp_header(&mut buf);
        payload(&mut buf, payload_len);
        TxFrame::single(&buf)
    }

    /// Ethernet frame with an arbitrary ethertype and opaque payload.
    pub fn raw_ether_frame(ethertype: u16, payload_len: usize) -> TxFrame {
        let mut buf = Vec::new();
        ether_header(&mut buf, ethertype, false);
        payload(&mut buf, payload_len);
        TxFrame::single(&buf)
    }

    /// Opaque data frame of `len` bytes, no meaningful headers.
    pub fn data_frame(len: usize) -> TxFrame {
        let mut buf = Vec::new();
        payload(&mut buf, len);
        TxFrame::single(&buf)
    }

    /// Split a single-fragment frame into chained fragments at `cuts`.
    pub fn split(frame: TxFrame, cuts: &[usize]) -> TxFrame {
        let offload = *frame.offload();
        let flat: Vec<u8> = frame
            .segs()
            .iter()
            .flat_map(|s| s.iter().copied())
            .collect();
        let mut segs = Vec::new();
        let mut start = 0;
        for &cut in cuts {
            segs.push(flat[start..cut].to_vec().into_boxed_slice());
            start = cut;
        }
        segs.push(flat[start..].to_vec().into_boxed_slice());
        TxFrame::new(segs).with_offload(offload)
    }
}
