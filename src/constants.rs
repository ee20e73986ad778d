//! Shared driver constants.
//!
//! Sizing and protocol constants used across the data path. Ring and buffer
//! sizing defaults are overridable through
//! [`DataPathConfig`](crate::DataPathConfig).

/// Ethernet header length without a VLAN tag.
pub const ETHER_HEADER_LEN: usize = 14;

/// Ethernet header length with an 802.1Q VLAN tag.
pub const ETHER_VLAN_HEADER_LEN: usize = 18;

/// Frame check sequence length.
pub const FCS_LEN: usize = 4;

/// Extra bytes reserved at the front of every receive buffer so the IP
/// header lands 4-byte aligned after a 14- or 18-byte MAC header.
pub const IPHDR_ALIGNMENT: usize = 2;

/// VXLAN header length used when walking tunneled frames.
pub const VXLAN_HDR_LEN: usize = 8;

/// DMA alignment request, the smallest supported page size.
pub const DMA_ALIGNMENT: usize = 4096;

/// Receive buffers are sized in chunks of this granularity.
pub const BUF_SIZE_GRANULARITY: usize = 1024;

/// Default descriptor count per ring direction.
pub const DEFAULT_RING_SIZE: usize = 1024;

/// Smallest supported ring size.
pub const MIN_RING_SIZE: usize = 64;

/// Largest supported ring size.
pub const MAX_RING_SIZE: usize = 4096;

/// Default MTU.
pub const DEFAULT_MTU: usize = 1500;

/// Smallest supported MTU.
pub const MIN_MTU: usize = 68;

/// Largest supported MTU.
pub const MAX_MTU: usize = 9706;

/// Default copy-vs-bind threshold for both directions, in bytes.
pub const DEFAULT_COPY_THRESHOLD: usize = 256;

/// Default bound on frames consumed by one interrupt-context ring walk.
pub const DEFAULT_RX_LIMIT_PER_INTR: usize = 256;

/// Default minimum free descriptor count below which transmit admissions
/// are refused and the ring is marked blocked.
pub const DEFAULT_TX_BLOCK_THRESH: usize = 8;

/// Largest scatter/gather list the hardware accepts for one regular frame.
pub const DEFAULT_TX_MAX_COOKIES: usize = 8;

/// Largest scatter/gather list accepted for a segmentation-offload frame.
pub const DEFAULT_TX_LSO_MAX_COOKIES: usize = 128;

/// Largest single transmit buffer a data descriptor can describe; the
/// descriptor length field is 14 bits wide.
pub const MAX_TX_BUFSZ: usize = (1 << 14) - 1;

/// Ethertype: IPv4.
pub const ETHERTYPE_IP: u16 = 0x0800;

/// Ethertype: IPv6.
pub const ETHERTYPE_IPV6: u16 = 0x86DD;

/// Ethertype: 802.1Q VLAN tag.
pub const ETHERTYPE_VLAN: u16 = 0x8100;

/// IP protocol number: TCP.
pub const IPPROTO_TCP: u8 = 6;

/// IP protocol number: UDP.
pub const IPPROTO_UDP: u8 = 17;

/// IP protocol number: SCTP.
pub const IPPROTO_SCTP: u8 = 132;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_size_bounds_are_powers_of_two() {
        assert!(MIN_RING_SIZE.is_power_of_two());
        assert!(MAX_RING_SIZE.is_power_of_two());
        assert!(DEFAULT_RING_SIZE.is_power_of_two());
        assert!(MIN_RING_SIZE <= DEFAULT_RING_SIZE);
        assert!(DEFAULT_RING_SIZE <= MAX_RING_SIZE);
    }

    #[test]
    fn frame_overheads() {
        assert_eq!(ETHER_VLAN_HEADER_LEN, ETHER_HEADER_LEN + 4);
        assert_eq!(IPHDR_ALIGNMENT, 2);
    }

    #[test]
    fn max_tx_bufsz_fits_descriptor_field() {
        assert_eq!(MAX_TX_BUFSZ, 16383);
    }
}
