//! DMA allocator seam and the buffer abstraction built on it.
//!
//! [`DmaAllocator`] is the host environment's memory service: it mints
//! opaque mapping handles, allocates DMA-reachable memory, binds virtual
//! ranges into scatter/gather cookie lists, and provides cache-coherence
//! sync plus fault-management queries. [`DmaBuffer`] layers the driver's
//! single-cookie buffer lifecycle on top of it.

use std::sync::Arc;

use log::error;

use crate::driver::error::{DmaError, DmaResult};

/// Cache-coherence sync direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    /// Make device writes visible to the CPU before reading.
    ForCpu,
    /// Make CPU writes visible to the device before arming it.
    ForDevice,
}

/// Result of a fault-management query against a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultStatus {
    /// The handle has seen no faults.
    Ok,
    /// The handle has recorded a DMA or access fault.
    Faulted,
}

impl FaultStatus {
    /// True when the handle has recorded a fault.
    #[inline(always)]
    #[must_use]
    pub fn is_faulted(self) -> bool {
        self == FaultStatus::Faulted
    }
}

/// Opaque mapping handle minted by the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DmaHandle(pub u64);

/// Opaque access/coherence handle paired with an allocated region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccHandle(pub u64);

/// One contiguous (bus address, length) scatter/gather element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cookie {
    /// Bus-visible address of the element.
    pub bus_addr: u64,
    /// Length of the element in bytes.
    pub len: usize,
}

/// Allocation and binding constraints attached to a mapping handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaAttrs {
    /// Required alignment of allocated memory.
    pub alignment: usize,
    /// Largest scatter/gather list a bind on this handle may produce.
    pub sgl_len: usize,
    /// Largest single cookie a bind on this handle may produce.
    pub max_cookie_size: usize,
}

/// Memory returned by [`DmaAllocator::alloc_memory`].
#[derive(Debug)]
pub struct DmaRegion {
    /// Host-virtual base of the region.
    pub vaddr: *mut u8,
    /// Usable length; may exceed the requested size due to rounding.
    pub len: usize,
    /// Access handle used to free the region and checked for faults.
    pub acc: AccHandle,
}

/// First cookie plus total count returned by [`DmaAllocator::bind`].
#[derive(Debug, Clone, Copy)]
pub struct Binding {
    /// The first cookie of the scatter/gather list.
    pub first: Cookie,
    /// Total number of cookies in the list.
    pub cookie_count: usize,
}

/// Host DMA services consumed by the data path.
///
/// All methods are fail-fast: the data path calls them from interrupt and
/// submission context and implementations must not sleep.
pub trait DmaAllocator: Send + Sync {
    /// Mint a mapping handle constrained by `attrs`.
    fn alloc_handle(&self, attrs: &DmaAttrs) -> DmaResult<DmaHandle>;

    /// Release a mapping handle. Any binding must already be undone.
    fn free_handle(&self, handle: DmaHandle);

    /// Allocate `size` bytes of DMA-reachable memory for `handle`.
    /// `streaming` selects streaming (explicitly synced) rather than
    /// consistent mappings.
    fn alloc_memory(&self, handle: DmaHandle, size: usize, streaming: bool) -> DmaResult<DmaRegion>;

    /// Free memory previously returned by [`Self::alloc_memory`].
    fn free_memory(&self, acc: AccHandle);

    /// Bind `len` bytes at `vaddr` for device access, producing a
    /// scatter/gather list.
    fn bind(&self, handle: DmaHandle, vaddr: *const u8, len: usize, streaming: bool)
    -> DmaResult<Binding>;

    /// Advance to and return the next cookie of the current binding. Only
    /// valid after [`Self::bind`] reported more than one cookie, and at most
    /// `cookie_count - 1` times.
    fn next_cookie(&self, handle: DmaHandle) -> Cookie;

    /// Undo the current binding on `handle`.
    fn unbind(&self, handle: DmaHandle);

    /// Synchronize caches for `len` bytes at `offset` into the binding.
    fn sync(&self, handle: DmaHandle, offset: usize, len: usize, dir: SyncDirection);

    /// Fault-management query for the handle.
    fn check(&self, handle: DmaHandle) -> FaultStatus;
}

// =============================================================================
// DmaBuffer
// =============================================================================

/// One contiguous host-mapped DMA region.
///
/// Carries the host-virtual base, the bus-visible base, the allocated size,
/// the current in-use length, and the two opaque platform handles. Once
/// bound, the bus address and size are immutable; only the length is
/// rewritten by writers.
pub struct DmaBuffer {
    alloc: Arc<dyn DmaAllocator>,
    dma_handle: Option<DmaHandle>,
    acc_handle: Option<AccHandle>,
    bound: bool,
    vaddr: *mut u8,
    bus_addr: u64,
    size: usize,
    len: usize,
}

// Safety: the raw base pointer refers to allocator-owned memory. Mutable
// access goes through the ring-lock and reference-count protocols of the
// owning structures; the buffer itself carries no aliasing.
unsafe impl Send for DmaBuffer {}
unsafe impl Sync for DmaBuffer {}

impl core::fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("vaddr", &self.vaddr)
            .field("bus_addr", &self.bus_addr)
            .field("size", &self.size)
            .field("len", &self.len)
            .field("bound", &self.bound)
            .finish()
    }
}

impl DmaBuffer {
    /// Create an empty, unallocated buffer. `free` on it is a no-op.
    pub fn unallocated(alloc: Arc<dyn DmaAllocator>) -> Self {
        Self {
            alloc,
            dma_handle: None,
            acc_handle: None,
            bound: false,
            vaddr: core::ptr::null_mut(),
            bus_addr: 0,
            size: 0,
            len: 0,
        }
    }

    /// Allocate `size` bytes of single-cookie DMA memory.
    ///
    /// Proceeds in four steps - handle, memory, optional zero, bind - and
    /// rolls back fully on failure.
    ///
    /// # Panics
    ///
    /// Panics if the bind reports more than one cookie; the attributes
    /// request a single-cookie list, so that indicates a broken allocator.
    pub fn alloc(
        alloc: &Arc<dyn DmaAllocator>,
        attrs: &DmaAttrs,
        streaming: bool,
        zero: bool,
        size: usize,
    ) -> DmaResult<DmaBuffer> {
        debug_assert!(size > 0);

        // Step one: allocate the mapping handle.
        let handle = match alloc.alloc_handle(attrs) {
            Ok(h) => h,
            Err(e) => {
                error!("failed to allocate dma handle for I/O buffers: {e}");
                return Err(e);
            }
        };

        // Step two: allocate the memory.
        let region = match alloc.alloc_memory(handle, size, streaming) {
            Ok(r) => r,
            Err(e) => {
                error!("failed to allocate {size} bytes of DMA for I/O buffers");
                alloc.free_handle(handle);
                return Err(e);
            }
        };

        // Step three: optionally zero.
        if zero {
            // Safety: the region was just allocated with at least `len`
            // bytes and nothing else references it yet.
            unsafe { core::ptr::write_bytes(region.vaddr, 0, region.len) };
        }

        // Step four: bind the memory.
        let binding = match alloc.bind(handle, region.vaddr, region.len, streaming) {
            Ok(b) => b,
            Err(e) => {
                error!("failed to bind {size} bytes of DMA for I/O buffers");
                alloc.free_memory(region.acc);
                alloc.free_handle(handle);
                return Err(e);
            }
        };
        assert_eq!(
            binding.cookie_count, 1,
            "single-cookie DMA allocation produced {} cookies",
            binding.cookie_count
        );

        Ok(DmaBuffer {
            alloc: Arc::clone(alloc),
            dma_handle: Some(handle),
            acc_handle: Some(region.acc),
            bound: true,
            vaddr: region.vaddr,
            bus_addr: binding.first.bus_addr,
            size: region.len,
            len: 0,
        })
    }

    /// Release everything this buffer holds. Idempotent, and safe to call
    /// on a buffer in any partial-initialization state.
    pub fn free(&mut self) {
        if self.bound {
            if let Some(h) = self.dma_handle {
                self.alloc.unbind(h);
            }
            self.bound = false;
            self.bus_addr = 0;
            self.size = 0;
        }
        if let Some(acc) = self.acc_handle.take() {
            self.alloc.free_memory(acc);
            self.vaddr = core::ptr::null_mut();
        }
        if let Some(h) = self.dma_handle.take() {
            self.alloc.free_handle(h);
        }
        self.len = 0;
    }

    /// Synchronize the whole buffer in the given direction.
    pub fn sync(&self, dir: SyncDirection) {
        if let Some(h) = self.dma_handle {
            self.alloc.sync(h, 0, self.size, dir);
        }
    }

    /// Synchronize `len` bytes at `offset` in the given direction.
    pub fn sync_range(&self, offset: usize, len: usize, dir: SyncDirection) {
        if let Some(h) = self.dma_handle {
            self.alloc.sync(h, offset, len, dir);
        }
    }

    /// Fault-management query for this buffer's mapping handle.
    pub fn check(&self) -> FaultStatus {
        self.dma_handle
            .map_or(FaultStatus::Ok, |h| self.alloc.check(h))
    }

    /// Host-virtual base address.
    #[inline(always)]
    #[must_use]
    pub fn vaddr(&self) -> *mut u8 {
        self.vaddr
    }

    /// Bus-visible base address.
    #[inline(always)]
    #[must_use]
    pub fn bus_addr(&self) -> u64 {
        self.bus_addr
    }

    /// Allocated (usable) size in bytes.
    #[inline(always)]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Current in-use length in bytes.
    #[inline(always)]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no bytes are in use.
    #[inline(always)]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set the in-use length.
    #[inline(always)]
    pub fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.size);
        self.len = len;
    }

    /// The allocator this buffer came from.
    pub(crate) fn allocator(&self) -> &Arc<dyn DmaAllocator> {
        &self.alloc
    }

    /// Shift the usable window `pad` bytes forward. Used on receive buffers
    /// so the post-Ethernet-header IP payload is 4-byte aligned.
    pub(crate) fn reserve_front(&mut self, pad: usize) {
        debug_assert!(pad < self.size);
        self.size -= pad;
        // Safety: pad < size, so the adjusted base stays inside the region.
        self.vaddr = unsafe { self.vaddr.add(pad) };
        self.bus_addr += pad as u64;
    }

    /// View the first `len` bytes of the buffer.
    ///
    /// # Safety
    ///
    /// The caller must hold the ownership protocol for this buffer (ring
    /// lock or a live loan reference) and the device must not be writing
    /// the range concurrently without a prior `sync`.
    pub(crate) unsafe fn bytes(&self, len: usize) -> &[u8] {
        debug_assert!(len <= self.size);
        // Safety: per the caller contract above.
        unsafe { core::slice::from_raw_parts(self.vaddr, len) }
    }

    /// Copy `src` into the buffer at `offset`.
    pub(crate) fn write_at(&mut self, offset: usize, src: &[u8]) {
        assert!(offset + src.len() <= self.size);
        // Safety: bounds asserted above; `&mut self` gives exclusive access.
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), self.vaddr.add(offset), src.len());
        }
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        self.free();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDmaAllocator;

    fn attrs() -> DmaAttrs {
        DmaAttrs {
            alignment: crate::constants::DMA_ALIGNMENT,
            sgl_len: 1,
            max_cookie_size: usize::MAX,
        }
    }

    fn allocator() -> Arc<dyn DmaAllocator> {
        Arc::new(MockDmaAllocator::new())
    }

    #[test]
    fn alloc_fills_in_buffer_state() {
        let alloc = allocator();
        let buf = DmaBuffer::alloc(&alloc, &attrs(), false, true, 2048).unwrap();
        assert!(!buf.vaddr().is_null());
        assert_ne!(buf.bus_addr(), 0);
        assert!(buf.size() >= 2048);
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn alloc_zeroes_when_asked() {
        let alloc = allocator();
        let buf = DmaBuffer::alloc(&alloc, &attrs(), false, true, 128).unwrap();
        let bytes = unsafe { buf.bytes(128) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn free_is_idempotent() {
        let alloc = allocator();
        let mut buf = DmaBuffer::alloc(&alloc, &attrs(), false, false, 512).unwrap();
        buf.free();
        assert_eq!(buf.size(), 0);
        assert_eq!(buf.bus_addr(), 0);
        assert!(buf.vaddr().is_null());
        // Second free on a zeroed handle must be a no-op.
        buf.free();
        assert_eq!(buf.size(), 0);
    }

    #[test]
    fn free_on_unallocated_is_noop() {
        let alloc = allocator();
        let mut buf = DmaBuffer::unallocated(Arc::clone(&alloc));
        buf.free();
        buf.free();
    }

    #[test]
    fn drop_releases_resources() {
        let mock = Arc::new(MockDmaAllocator::new());
        let alloc: Arc<dyn DmaAllocator> = mock.clone();
        {
            let _buf = DmaBuffer::alloc(&alloc, &attrs(), true, false, 1024).unwrap();
            assert_eq!(mock.region_count(), 1);
        }
        assert_eq!(mock.region_count(), 0);
        assert_eq!(mock.handle_count(), 0);
    }

    #[test]
    fn alloc_fails_cleanly_when_no_handle_available() {
        let mock = Arc::new(MockDmaAllocator::new());
        mock.fail_handle_allocs(1);
        let alloc: Arc<dyn DmaAllocator> = mock.clone();
        assert!(DmaBuffer::alloc(&alloc, &attrs(), false, false, 1024).is_err());
        assert_eq!(mock.handle_count(), 0);
    }

    #[test]
    fn alloc_rolls_back_when_memory_step_fails() {
        let mock = Arc::new(MockDmaAllocator::new());
        mock.fail_memory_allocs(1);
        let alloc: Arc<dyn DmaAllocator> = mock.clone();
        let res = DmaBuffer::alloc(&alloc, &attrs(), false, false, 1024);
        assert!(res.is_err());
        assert_eq!(mock.handle_count(), 0);
        assert_eq!(mock.region_count(), 0);
    }

    #[test]
    fn alloc_rolls_back_when_bind_step_fails() {
        let mock = Arc::new(MockDmaAllocator::new());
        mock.fail_binds(1);
        let alloc: Arc<dyn DmaAllocator> = mock.clone();
        let res = DmaBuffer::alloc(&alloc, &attrs(), false, false, 1024);
        assert!(res.is_err());
        assert_eq!(mock.handle_count(), 0);
        assert_eq!(mock.region_count(), 0);
    }

    #[test]
    fn reserve_front_shifts_window() {
        let alloc = allocator();
        let mut buf = DmaBuffer::alloc(&alloc, &attrs(), true, false, 2050).unwrap();
        let base = buf.vaddr() as usize;
        let bus = buf.bus_addr();
        let size = buf.size();
        buf.reserve_front(2);
        assert_eq!(buf.vaddr() as usize, base + 2);
        assert_eq!(buf.bus_addr(), bus + 2);
        assert_eq!(buf.size(), size - 2);
    }

    #[test]
    fn write_at_places_bytes() {
        let alloc = allocator();
        let mut buf = DmaBuffer::alloc(&alloc, &attrs(), true, true, 64).unwrap();
        buf.write_at(3, &[0xAA, 0xBB]);
        let bytes = unsafe { buf.bytes(8) };
        assert_eq!(&bytes[3..5], &[0xAA, 0xBB]);
    }
}
