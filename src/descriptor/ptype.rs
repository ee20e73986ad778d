//! Receive packet-type decode.
//!
//! The write-back descriptor carries an 8-bit packet type that indexes the
//! controller's classification table. The table is regular: entries 1-21
//! are plain L2 types, 22-87 describe IPv4-outer packets, and 88-153 mirror
//! them for IPv6 outers. Within an outer block the layout repeats a 7-entry
//! payload group (fragment, none, UDP, reserved, TCP, SCTP, ICMP) for the
//! untunneled case and for each tunnel shape.

/// IP version of an outer or tunnel-end header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    /// No header at this layer.
    None,
    /// IPv4.
    V4,
    /// IPv6.
    V6,
}

/// Tunnel shape between the outer IP header and the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelKind {
    /// Not tunneled.
    None,
    /// IP-in-IP.
    IpIp,
    /// GRE/NAT tunnel without an inner MAC header.
    Grenat,
    /// GRE/NAT tunnel with an inner MAC header.
    GrenatMac,
    /// GRE/NAT tunnel with an inner MAC header and VLAN tag.
    GrenatMacVlan,
}

/// Innermost payload protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InnerProt {
    /// No L4 payload recognized.
    None,
    /// UDP.
    Udp,
    /// TCP.
    Tcp,
    /// SCTP.
    Sctp,
    /// ICMP.
    Icmp,
    /// Opaque payload (plain L2 or IP with no recognized L4).
    Pay,
}

/// Decoded packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtypeInfo {
    /// The table recognizes this packet type.
    pub known: bool,
    /// The packet carries an outer IP header.
    pub outer_ip: bool,
    /// Outer IP version.
    pub outer_ip_ver: IpVersion,
    /// The outer IP header is a fragment.
    pub outer_frag: bool,
    /// Tunnel shape.
    pub tunnel: TunnelKind,
    /// IP version at the tunnel end.
    pub tunnel_end_ver: IpVersion,
    /// The tunnel-end IP header is a fragment.
    pub tunnel_end_frag: bool,
    /// Innermost payload protocol.
    pub inner_prot: InnerProt,
}

const UNKNOWN: PtypeInfo = PtypeInfo {
    known: false,
    outer_ip: false,
    outer_ip_ver: IpVersion::None,
    outer_frag: false,
    tunnel: TunnelKind::None,
    tunnel_end_ver: IpVersion::None,
    tunnel_end_frag: false,
    inner_prot: InnerProt::None,
};

const L2: PtypeInfo = PtypeInfo {
    known: true,
    outer_ip: false,
    outer_ip_ver: IpVersion::None,
    outer_frag: false,
    tunnel: TunnelKind::None,
    tunnel_end_ver: IpVersion::None,
    tunnel_end_frag: false,
    inner_prot: InnerProt::Pay,
};

/// The 7-entry payload group. Slot 3 is reserved in every group.
const fn payload_slot(slot: u8) -> Option<(bool, InnerProt)> {
    match slot {
        0 => Some((true, InnerProt::Pay)),
        1 => Some((false, InnerProt::Pay)),
        2 => Some((false, InnerProt::Udp)),
        4 => Some((false, InnerProt::Tcp)),
        5 => Some((false, InnerProt::Sctp)),
        6 => Some((false, InnerProt::Icmp)),
        _ => None,
    }
}

/// Decode one entry of an outer-IP block. `offset` is the index within the
/// 66-entry block.
fn ip_block(outer_ver: IpVersion, offset: u8) -> PtypeInfo {
    let base = PtypeInfo {
        known: true,
        outer_ip: true,
        outer_ip_ver: outer_ver,
        ..UNKNOWN
    };

    // (tunnel, tunnel end version, group start) for each region of the
    // block; a `None` start marks the bare-tunnel PAY3 singleton entries.
    let (tunnel, end_ver, group): (TunnelKind, IpVersion, Option<u8>) = match offset {
        0..=6 => (TunnelKind::None, IpVersion::None, Some(0)),
        7..=13 => (TunnelKind::IpIp, IpVersion::V4, Some(7)),
        14..=20 => (TunnelKind::IpIp, IpVersion::V6, Some(14)),
        21 => (TunnelKind::Grenat, IpVersion::None, None),
        22..=28 => (TunnelKind::Grenat, IpVersion::V4, Some(22)),
        29..=35 => (TunnelKind::Grenat, IpVersion::V6, Some(29)),
        36 => (TunnelKind::GrenatMac, IpVersion::None, None),
        37..=43 => (TunnelKind::GrenatMac, IpVersion::V4, Some(37)),
        44..=50 => (TunnelKind::GrenatMac, IpVersion::V6, Some(44)),
        51 => (TunnelKind::GrenatMacVlan, IpVersion::None, None),
        52..=58 => (TunnelKind::GrenatMacVlan, IpVersion::V4, Some(52)),
        59..=65 => (TunnelKind::GrenatMacVlan, IpVersion::V6, Some(59)),
        _ => return UNKNOWN,
    };

    let Some(group) = group else {
        // Bare tunnel header with an opaque payload.
        return PtypeInfo {
            tunnel,
            inner_prot: InnerProt::Pay,
            ..base
        };
    };

    let Some((frag, prot)) = payload_slot(offset - group) else {
        return UNKNOWN;
    };

    if matches!(tunnel, TunnelKind::None) {
        PtypeInfo {
            outer_frag: frag,
            inner_prot: prot,
            ..base
        }
    } else {
        PtypeInfo {
            tunnel,
            tunnel_end_ver: end_ver,
            tunnel_end_frag: frag,
            inner_prot: prot,
            ..base
        }
    }
}

/// Decode a write-back packet type.
#[must_use]
pub fn decode(ptype: u8) -> PtypeInfo {
    match ptype {
        0 => UNKNOWN,
        1..=21 => L2,
        22..=87 => ip_block(IpVersion::V4, ptype - 22),
        88..=153 => ip_block(IpVersion::V6, ptype - 88),
        _ => UNKNOWN,
    }
}

// =============================================================================
// Tests
// =============================================================================
