//! Frame model shared with the upstream framing stack.
//!
//! Transmit frames arrive as a chain of payload fragments plus an offload
//! request; the parser walks the chain without pulling it up. Receive
//! frames go upward either as freshly copied buffers or as zero-copy loans
//! of ring buffers. Dropping a loaned frame is the recycle callback: the
//! buffer returns to its pool, or is torn down entirely if it held the last
//! reference after shutdown.

use bitflags::bitflags;

use crate::constants::IPHDR_ALIGNMENT;
use crate::driver::rx::LoanedBuf;

bitflags! {
    /// Checksum request and result flags carried on frames.
    ///
    /// The `*_NEEDED`/request flags travel on transmit frames; the `*_OK`
    /// result flags are set on receive frames by the ring engine.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CksumFlags: u32 {
        /// Transmit request: compute the (outer) IPv4 header checksum.
        const IPV4_HDRCKSUM = 1 << 0;
        /// Transmit request: compute the L4 checksum.
        const PARTIALCKSUM = 1 << 1;
        /// Transmit request: compute the inner IPv4 header checksum of a
        /// tunneled frame.
        const INNER_IPV4_HDRCKSUM_NEEDED = 1 << 2;
        /// Transmit request: compute the inner L4 checksum of a tunneled
        /// frame.
        const INNER_PSEUDO_NEEDED = 1 << 3;

        /// Receive result: the (outer) IPv4 header checksum verified.
        const IPV4_HDRCKSUM_OK = 1 << 8;
        /// Receive result: the L4 checksum verified.
        const FULLCKSUM_OK = 1 << 9;
        /// Receive result: the inner IPv4 header checksum verified.
        const INNER_IPV4_HDRCKSUM_OK = 1 << 10;
        /// Receive result: the inner L4 checksum verified.
        const INNER_FULLCKSUM_OK = 1 << 11;
    }
}

/// Tunnel encapsulation of a transmit frame, as declared by upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TunnelType {
    /// Not tunneled.
    #[default]
    None,
    /// VXLAN over UDP; inner offloads are supported.
    Vxlan,
    /// Geneve over UDP; not supported by this hardware revision.
    Geneve,
}

/// Offload request attached to a transmit frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxOffload {
    /// Requested checksum offloads.
    pub cksum: CksumFlags,
    /// Large send offload requested.
    pub lso: bool,
    /// Maximum segment size for LSO.
    pub mss: u32,
    /// Tunnel encapsulation of the frame.
    pub tunnel: TunnelType,
}

// =============================================================================
// Transmit frames
// =============================================================================

/// One outgoing frame: a chain of payload fragments and its offload
/// request. Fragments may be empty; empty links are skipped on the wire but
/// preserved for offset arithmetic while parsing.
#[derive(Debug, Default)]
pub struct TxFrame {
    segs: Vec<Box<[u8]>>,
    offload: TxOffload,
}

impl TxFrame {
    /// Build a frame from its fragment chain.
    #[must_use]
    pub fn new(segs: Vec<Box<[u8]>>) -> Self {
        Self {
            segs,
            offload: TxOffload::default(),
        }
    }

    /// Build a single-fragment frame.
    #[must_use]
    pub fn single(data: &[u8]) -> Self {
        Self::new(vec![data.to_vec().into_boxed_slice()])
    }

    /// Attach an offload request.
    #[must_use]
    pub fn with_offload(mut self, offload: TxOffload) -> Self {
        self.offload = offload;
        self
    }

    /// The frame's offload request.
    #[inline(always)]
    #[must_use]
    pub fn offload(&self) -> &TxOffload {
        &self.offload
    }

    /// Total payload length across all fragments.
    #[must_use]
    pub fn total_len(&self) -> usize {
        self.segs.iter().map(|s| s.len()).sum()
    }

    /// The fragment chain.
    #[inline(always)]
    #[must_use]
    pub fn segs(&self) -> &[Box<[u8]>] {
        &self.segs
    }
}

// =============================================================================
// Receive frames
// =============================================================================

#[derive(Debug)]
pub(crate) enum RxPayload {
    /// Payload copied out of the ring buffer; the data starts past the
    /// IP-alignment pad.
    Copied { buf: Box<[u8]> },
    /// Zero-copy loan of a ring buffer.
    Loaned(LoanedBuf),
}

/// One received frame, delivered whole (end-of-packet) with any checksum
/// results the hardware produced.
#[derive(Debug)]
pub struct RxFrame {
    payload: RxPayload,
    cksum: CksumFlags,
}

impl RxFrame {
    pub(crate) fn from_copy(buf: Box<[u8]>) -> Self {
        debug_assert!(buf.len() >= IPHDR_ALIGNMENT);
        Self {
            payload: RxPayload::Copied { buf },
            cksum: CksumFlags::empty(),
        }
    }

    pub(crate) fn from_loan(loan: LoanedBuf) -> Self {
        Self {
            payload: RxPayload::Loaned(loan),
            cksum: CksumFlags::empty(),
        }
    }

    pub(crate) fn set_cksum(&mut self, flags: CksumFlags) {
        self.cksum = flags;
    }

    /// The frame payload.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        match &self.payload {
            RxPayload::Copied { buf } => &buf[IPHDR_ALIGNMENT..],
            RxPayload::Loaned(loan) => loan.bytes(),
        }
    }

    /// Payload length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    /// True for a zero-length frame.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checksum results the hardware verified for this frame.
    #[inline(always)]
    #[must_use]
    pub fn cksum(&self) -> CksumFlags {
        self.cksum
    }

    /// True when the frame is a zero-copy loan of a ring buffer.
    #[must_use]
    pub fn is_loaned(&self) -> bool {
        matches!(self.payload, RxPayload::Loaned(_))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_frame_total_len_spans_fragments() {
        let frame = TxFrame::new(vec![
            vec![0u8; 10].into_boxed_slice(),
            Vec::new().into_boxed_slice(),
            vec![0u8; 22].into_boxed_slice(),
        ]);
        assert_eq!(frame.total_len(), 32);
        assert_eq!(frame.segs().len(), 3);
    }

    #[test]
    fn tx_frame_offload_roundtrip() {
        let off = TxOffload {
            cksum: CksumFlags::IPV4_HDRCKSUM | CksumFlags::PARTIALCKSUM,
            lso: true,
            mss: 1460,
            tunnel: TunnelType::None,
        };
        let frame = TxFrame::single(&[0u8; 8]).with_offload(off);
        assert_eq!(*frame.offload(), off);
    }

    #[test]
    fn copied_frame_skips_alignment_pad() {
        let mut buf = vec![0u8; IPHDR_ALIGNMENT + 4];
        buf[IPHDR_ALIGNMENT..].copy_from_slice(&[1, 2, 3, 4]);
        let frame = RxFrame::from_copy(buf.into_boxed_slice());
        assert_eq!(frame.bytes(), &[1, 2, 3, 4]);
        assert_eq!(frame.len(), 4);
        assert!(!frame.is_loaned());
    }

    #[test]
    fn cksum_flags_default_empty() {
        let frame = RxFrame::from_copy(vec![0u8; IPHDR_ALIGNMENT].into_boxed_slice());
        assert!(frame.cksum().is_empty());
        assert!(frame.is_empty());
    }
}
