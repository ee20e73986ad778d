//! Transmit frame parsing and offload context derivation.
//!
//! Before a frame is admitted, its headers are parsed to find the L2, L3
//! and L4 lengths and protocols - through a VXLAN tunnel when the frame is
//! encapsulated - and the result is folded into the command flags, offset
//! triple, and context-descriptor fields the hardware expects.
//!
//! The parser walks the fragment chain in place, reading multi-byte fields
//! one byte at a time across fragment boundaries; it never pulls the chain
//! up into a contiguous buffer.

use bitflags::bitflags;

use crate::constants::{
    ETHERTYPE_IP, ETHERTYPE_IPV6, ETHERTYPE_VLAN, ETHER_HEADER_LEN, ETHER_VLAN_HEADER_LEN,
    IPPROTO_SCTP, IPPROTO_TCP, IPPROTO_UDP, VXLAN_HDR_LEN,
};
use crate::descriptor::bits::{ctx, txd};
use crate::driver::config::DataPathConfig;
use crate::driver::error::OffloadError;
use crate::driver::stats::{TxQueueStats, bump};
use crate::frame::{CksumFlags, TunnelType, TxFrame};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct MeoiFlags: u32 {
        const L2INFO_SET = 1 << 0;
        const VLAN_TAGGED = 1 << 1;
        const L3INFO_SET = 1 << 2;
        const L4INFO_SET = 1 << 3;
        const TUNNEL_INFO_SET = 1 << 4;
    }
}

impl MeoiFlags {
    const L2_L3_L4: MeoiFlags = MeoiFlags::L2INFO_SET
        .union(MeoiFlags::L3INFO_SET)
        .union(MeoiFlags::L4INFO_SET);
}

/// Header geometry of one frame, outer and (for VXLAN) inner.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub(crate) struct EtherOffloadInfo {
    pub flags: MeoiFlags,
    pub l2hlen: u8,
    pub l3proto: u16,
    pub l3hlen: u8,
    pub l4proto: u8,
    pub l4hlen: u8,
    pub tun_protlen: u8,
    pub tun_l2hlen: u8,
    pub tun_l3proto: u16,
    pub tun_l3hlen: u8,
    pub tun_l4proto: u8,
    pub tun_l4hlen: u8,
}

// =============================================================================
// Chain byte readers
// =============================================================================

/// Read one byte at `off` through the fragment chain.
///
/// The overflow check is sized for the widest field read, so the final
/// byte of the chain is not readable through this helper.
fn get_u8(segs: &[Box<[u8]>], total: usize, off: usize) -> Result<u8, OffloadError> {
    if off + 2 > total {
        return Err(OffloadError::ParseFailed);
    }

    let mut off = off;
    for seg in segs {
        if off < seg.len() {
            return Ok(seg[off]);
        }
        off -= seg.len();
    }
    Err(OffloadError::ParseFailed)
}

/// Read a big-endian 16-bit field at `off` through the fragment chain.
/// The second byte may start the next fragment.
fn get_u16(segs: &[Box<[u8]>], total: usize, off: usize) -> Result<u16, OffloadError> {
    if off + 2 > total {
        return Err(OffloadError::ParseFailed);
    }

    let mut off = off;
    let mut i = 0;
    while i < segs.len() && off >= segs[i].len() {
        off -= segs[i].len();
        i += 1;
    }
    if i >= segs.len() {
        return Err(OffloadError::ParseFailed);
    }

    let hi = segs[i][off];
    let lo = if off + 1 < segs[i].len() {
        segs[i][off + 1]
    } else {
        let mut j = i + 1;
        while j < segs.len() && segs[j].is_empty() {
            j += 1;
        }
        if j >= segs.len() {
            return Err(OffloadError::ParseFailed);
        }
        segs[j][0]
    };
    Ok(u16::from(hi) << 8 | u16::from(lo))
}

// =============================================================================
// Header walk
// =============================================================================

/// Walk the frame's headers starting at `starting_off` and fill in the
/// offload geometry. An unrecognized ethertype or L4 protocol is not an
/// error; the result simply carries fewer `*_SET` flags.
pub(crate) fn ether_offload_info(
    frame: &TxFrame,
    ttype: TunnelType,
    starting_off: usize,
) -> Result<EtherOffloadInfo, OffloadError> {
    let segs = frame.segs();
    let total = frame.total_len();
    let mut meoi = EtherOffloadInfo::default();

    if !matches!(ttype, TunnelType::None | TunnelType::Vxlan) {
        return Err(OffloadError::UnsupportedTunnel);
    }

    // Ethertype, then again past the VLAN tag if one is present.
    let mut ether = get_u16(segs, total, 12 + starting_off)?;
    let maclen;
    if ether == ETHERTYPE_VLAN {
        ether = get_u16(segs, total, 16 + starting_off)?;
        meoi.flags |= MeoiFlags::VLAN_TAGGED;
        maclen = ETHER_VLAN_HEADER_LEN;
    } else {
        maclen = ETHER_HEADER_LEN;
    }
    meoi.flags |= MeoiFlags::L2INFO_SET;
    meoi.l2hlen = maclen as u8;
    meoi.l3proto = ether;

    let (iplen, ipproto) = match ether {
        ETHERTYPE_IP => {
            // The IPv4 header length is variable.
            let ihl = get_u8(segs, total, maclen + starting_off)? & 0x0f;
            if !(5..=15).contains(&ihl) {
                return Err(OffloadError::ParseFailed);
            }
            let proto = get_u8(segs, total, maclen + 9 + starting_off)?;
            (usize::from(ihl) * 4, proto)
        }
        ETHERTYPE_IPV6 => (40, get_u8(segs, total, maclen + 6 + starting_off)?),
        _ => return Ok(meoi),
    };
    meoi.l3hlen = iplen as u8;
    meoi.l4proto = ipproto;
    meoi.flags |= MeoiFlags::L3INFO_SET;

    let l4len = match ipproto {
        IPPROTO_TCP => {
            let doff = (get_u8(segs, total, maclen + iplen + 12 + starting_off)? & 0xf0) >> 4;
            if !(5..=15).contains(&doff) {
                return Err(OffloadError::ParseFailed);
            }
            usize::from(doff) * 4
        }
        IPPROTO_UDP => 8,
        IPPROTO_SCTP => 12,
        _ => return Ok(meoi),
    };
    meoi.l4hlen = l4len as u8;
    meoi.flags |= MeoiFlags::L4INFO_SET;

    if ttype == TunnelType::Vxlan {
        // Walk the tunneled headers with the offset of the inner frame.
        // Only tunneling within UDP is supported.
        if ipproto != IPPROTO_UDP {
            return Err(OffloadError::UnsupportedTunnel);
        }
        debug_assert_eq!(starting_off, 0);

        let off = maclen + iplen + l4len + VXLAN_HDR_LEN;
        let inner = ether_offload_info(frame, TunnelType::None, off)?;
        if !inner.flags.contains(MeoiFlags::L2_L3_L4) {
            return Err(OffloadError::MissingTunnelInfo);
        }

        meoi.tun_protlen = VXLAN_HDR_LEN as u8;
        meoi.tun_l2hlen = inner.l2hlen;
        meoi.tun_l3proto = inner.l3proto;
        meoi.tun_l3hlen = inner.l3hlen;
        meoi.tun_l4proto = inner.l4proto;
        meoi.tun_l4hlen = inner.l4hlen;
        meoi.flags |= MeoiFlags::TUNNEL_INFO_SET;
    }

    Ok(meoi)
}

// =============================================================================
// Context derivation
// =============================================================================

/// Everything needed to program the data descriptors and, when present,
/// the context descriptor of one frame.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub(crate) struct TxContext {
    /// Command flags ORed into every data descriptor.
    pub data_cmdflags: u64,
    /// MAC/IP/L4 offset triple for the data descriptors.
    pub data_offsets: u32,
    /// The frame needs tunneling parameters in a context descriptor.
    pub tunneled: bool,
    /// Tunneling parameter word for the context descriptor.
    pub tunnel_fld: u32,
    /// Command flags for the context descriptor.
    pub ctx_cmdflags: u64,
    /// Total segmentation payload length.
    pub tsolen: u32,
    /// Maximum segment size for segmentation offload.
    pub mss: u32,
}

impl TxContext {
    /// The frame requested segmentation offload.
    #[inline(always)]
    pub fn uses_lso(&self) -> bool {
        self.ctx_cmdflags & ctx::CMD_TSO != 0
    }

    /// The frame needs a context descriptor ahead of its data descriptors.
    #[inline(always)]
    pub fn needs_ctx_desc(&self) -> bool {
        self.uses_lso() || self.tunneled
    }
}

fn l4t_cmdflag(l4proto: u8) -> Option<u64> {
    match l4proto {
        IPPROTO_TCP => Some(txd::CMD_L4T_EOFT_TCP),
        IPPROTO_UDP => Some(txd::CMD_L4T_EOFT_UDP),
        IPPROTO_SCTP => Some(txd::CMD_L4T_EOFT_SCTP),
        _ => None,
    }
}

/// Derive the descriptor contents for one frame's offload request.
///
/// Returns an empty context when offloads are disabled or none were
/// requested. A failure drops the frame; the specific cause has already
/// been counted against `txs`.
pub(crate) fn tx_context(
    cfg: &DataPathConfig,
    txs: &TxQueueStats,
    frame: &TxFrame,
) -> Result<TxContext, OffloadError> {
    let mut tctx = TxContext::default();

    if !cfg.tx_hcksum_enable {
        return Ok(tctx);
    }

    let offload = frame.offload();
    let chkflags = offload.cksum;
    if chkflags.is_empty() && !offload.lso {
        return Ok(tctx);
    }

    // An inner checksum request implies a tunneled frame.
    let tunneled = chkflags
        .intersects(CksumFlags::INNER_IPV4_HDRCKSUM_NEEDED | CksumFlags::INNER_PSEUDO_NEEDED);
    if tunneled && offload.tunnel != TunnelType::Vxlan {
        bump(&txs.hck_badtuntype);
        return Err(OffloadError::UnsupportedTunnel);
    }
    tctx.tunneled = tunneled;

    let meo = match ether_offload_info(frame, offload.tunnel, 0) {
        Ok(m) => m,
        Err(e) => {
            bump(&txs.hck_meoifail);
            return Err(e);
        }
    };

    if tunneled {
        // Outer MAC | outer IP | UDP | VXLAN | inner MAC | inner IP | L4.
        // The context descriptor carries the outer IP type and length and
        // the full tunnel length; the data descriptors carry the inner
        // offsets.
        if !meo.flags.contains(MeoiFlags::L2INFO_SET) {
            bump(&txs.hck_nol2info);
            return Err(OffloadError::MissingL2Info);
        }
        if !meo.flags.contains(MeoiFlags::L3INFO_SET) {
            bump(&txs.hck_nol3info);
            return Err(OffloadError::MissingL3Info);
        }
        if !meo.flags.contains(MeoiFlags::L4INFO_SET) || meo.l4proto != IPPROTO_UDP {
            bump(&txs.hck_badl4);
            return Err(OffloadError::BadL4Proto);
        }
        if !meo.flags.contains(MeoiFlags::TUNNEL_INFO_SET) {
            bump(&txs.hck_notuninfo);
            return Err(OffloadError::MissingTunnelInfo);
        }
        if chkflags.contains(CksumFlags::PARTIALCKSUM) {
            // Only the outer IPv4 header checksum can be offloaded on the
            // outer header set.
            bump(&txs.hck_badol4);
            return Err(OffloadError::UnsupportedOuterCksum);
        }

        let l4tunlen = u32::from(meo.l4hlen) + u32::from(meo.tun_l2hlen) + u32::from(meo.tun_protlen);

        // Outer IP type.
        let eipt = if chkflags.contains(CksumFlags::IPV4_HDRCKSUM) {
            if meo.l3proto == ETHERTYPE_IP {
                ctx::TNL_EIPT_IPV4_CSUM
            } else {
                bump(&txs.hck_badl3);
                return Err(OffloadError::BadL3Proto);
            }
        } else if meo.l3proto == ETHERTYPE_IP {
            ctx::TNL_EIPT_IPV4
        } else if meo.l3proto == ETHERTYPE_IPV6 {
            ctx::TNL_EIPT_IPV6
        } else {
            bump(&txs.hck_badl3);
            return Err(OffloadError::BadL3Proto);
        };

        tctx.tunnel_fld = eipt
            | (u32::from(meo.l3hlen) >> 2) << ctx::TNL_EIPLEN_SHIFT
            | ctx::TNL_L4TUNT_UDP << ctx::TNL_L4TUNT_SHIFT
            | (l4tunlen >> 1) << ctx::TNL_L4TUNLEN_SHIFT;

        // The MAC length is the outer header's, tunneled or not.
        tctx.data_offsets |= (u32::from(meo.l2hlen) >> 1) << txd::OFF_MACLEN_SHIFT;

        // Inner IP type; when tunneled, IIPT applies to the inner header.
        if chkflags.contains(CksumFlags::INNER_IPV4_HDRCKSUM_NEEDED) {
            if meo.tun_l3proto != ETHERTYPE_IP {
                bump(&txs.hck_badl3);
                return Err(OffloadError::BadL3Proto);
            }
            tctx.data_cmdflags |= txd::CMD_IIPT_IPV4_CSUM;
        } else if meo.l3proto == ETHERTYPE_IP {
            tctx.data_cmdflags |= txd::CMD_IIPT_IPV4;
        } else if meo.l3proto == ETHERTYPE_IPV6 {
            tctx.data_cmdflags |= txd::CMD_IIPT_IPV6;
        } else {
            bump(&txs.hck_badl3);
            return Err(OffloadError::BadL3Proto);
        }

        tctx.data_offsets |= (u32::from(meo.tun_l3hlen) >> 2) << txd::OFF_IPLEN_SHIFT;

        if chkflags.contains(CksumFlags::INNER_PSEUDO_NEEDED) {
            let Some(l4t) = l4t_cmdflag(meo.tun_l4proto) else {
                bump(&txs.hck_badl4);
                return Err(OffloadError::BadL4Proto);
            };
            tctx.data_cmdflags |= l4t;
            // A nonzero L4 length initiates the inner L4 checksum.
            tctx.data_offsets |= (u32::from(meo.tun_l4hlen) >> 2) << txd::OFF_L4LEN_SHIFT;
        }
    } else {
        if chkflags.contains(CksumFlags::IPV4_HDRCKSUM) {
            if !meo.flags.contains(MeoiFlags::L2INFO_SET) {
                bump(&txs.hck_nol2info);
                return Err(OffloadError::MissingL2Info);
            }
            if !meo.flags.contains(MeoiFlags::L3INFO_SET) {
                bump(&txs.hck_nol3info);
                return Err(OffloadError::MissingL3Info);
            }
            if meo.l3proto != ETHERTYPE_IP {
                bump(&txs.hck_badl3);
                return Err(OffloadError::BadL3Proto);
            }
            tctx.data_cmdflags |= txd::CMD_IIPT_IPV4_CSUM;
            tctx.data_offsets |= (u32::from(meo.l2hlen) >> 1) << txd::OFF_MACLEN_SHIFT;
            tctx.data_offsets |= (u32::from(meo.l3hlen) >> 2) << txd::OFF_IPLEN_SHIFT;
        }

        if chkflags.contains(CksumFlags::PARTIALCKSUM) {
            if !meo.flags.contains(MeoiFlags::L4INFO_SET) {
                bump(&txs.hck_nol4info);
                return Err(OffloadError::MissingL4Info);
            }

            if !chkflags.contains(CksumFlags::IPV4_HDRCKSUM) {
                if !meo.flags.contains(MeoiFlags::L2INFO_SET) {
                    bump(&txs.hck_nol2info);
                    return Err(OffloadError::MissingL2Info);
                }
                if !meo.flags.contains(MeoiFlags::L3INFO_SET) {
                    bump(&txs.hck_nol3info);
                    return Err(OffloadError::MissingL3Info);
                }
                if meo.l3proto == ETHERTYPE_IP {
                    tctx.data_cmdflags |= txd::CMD_IIPT_IPV4;
                } else if meo.l3proto == ETHERTYPE_IPV6 {
                    tctx.data_cmdflags |= txd::CMD_IIPT_IPV6;
                } else {
                    bump(&txs.hck_badl3);
                    return Err(OffloadError::BadL3Proto);
                }
                tctx.data_offsets |= (u32::from(meo.l2hlen) >> 1) << txd::OFF_MACLEN_SHIFT;
                tctx.data_offsets |= (u32::from(meo.l3hlen) >> 2) << txd::OFF_IPLEN_SHIFT;
            }

            let Some(l4t) = l4t_cmdflag(meo.l4proto) else {
                bump(&txs.hck_badl4);
                return Err(OffloadError::BadL4Proto);
            };
            tctx.data_cmdflags |= l4t;
            tctx.data_offsets |= (u32::from(meo.l4hlen) >> 2) << txd::OFF_L4LEN_SHIFT;
        }
    }

    if offload.lso {
        // Segmentation requires both checksum offloads.
        if !(chkflags.contains(CksumFlags::IPV4_HDRCKSUM)
            && chkflags.contains(CksumFlags::PARTIALCKSUM))
        {
            return Err(OffloadError::LsoMissingCksum);
        }
        tctx.ctx_cmdflags |= ctx::CMD_TSO;
        tctx.mss = offload.mss;
        tctx.tsolen = (frame.total_len()
            - (usize::from(meo.l2hlen) + usize::from(meo.l3hlen) + usize::from(meo.l4hlen)))
            as u32;
    }

    Ok(tctx)
}

// =============================================================================
// Tests
// =============================================================================
