//! Frame classification, the receive preamble, and header helpers.

use smoltcp::wire::{EthernetAddress, EthernetFrame, EthernetProtocol, Ipv4Packet};
use tracing::warn;

use crate::pool::{PacketBuf, PoolError, Preamble};

/// Ethernet header without VLAN tag
pub const ETHERNET_HDR_SIZE: usize = 14;

/// Largest untagged frame (without FCS)
pub const ETHERNET_MAX_FRAME: usize = 1514;

/// Where a frame should go, by destination MAC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Unicast(EthernetAddress),
    Broadcast,
    Multicast(EthernetAddress),
    /// Shorter than an Ethernet header
    Malformed,
}

pub fn classify(frame: &[u8]) -> Destination {
    let Ok(eth) = EthernetFrame::new_checked(frame) else {
        return Destination::Malformed;
    };
    let dst = eth.dst_addr();
    if dst.is_broadcast() {
        Destination::Broadcast
    } else if dst.is_unicast() {
        Destination::Unicast(dst)
    } else {
        Destination::Multicast(dst)
    }
}

/// Checksum handling the runtime has to do for a received packet
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumStatus {
    /// Runtime must verify the checksum itself
    Needed = 0,
    /// NIC already verified it
    Unnecessary = 1,
}

/// Metadata written immediately in front of every delivered frame.
///
/// Runtimes find it at the buffer reference they receive; the frame starts
/// right after it.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxNetHdr {
    /// Frame length, excluding this header
    pub payload_length: u32,
    /// Receive-side scaling hash, always zero
    pub rss_hash: u32,
    pub checksum_status: u8,
    _reserved: u8,
    pub checksum_value: u16,
}

// SAFETY: repr(C) integers only, no padding
unsafe impl Preamble for RxNetHdr {}

/// Size of [`RxNetHdr`] on the wire
pub const RX_NET_HDR_SIZE: usize = std::mem::size_of::<RxNetHdr>();

impl RxNetHdr {
    pub fn set_checksum_status(&mut self, status: ChecksumStatus) {
        self.checksum_status = status as u8;
    }

    pub fn checksum_status(&self) -> Option<ChecksumStatus> {
        match self.checksum_status {
            0 => Some(ChecksumStatus::Needed),
            1 => Some(ChecksumStatus::Unnecessary),
            _ => None,
        }
    }

    /// Read a header from the start of `bytes` (native byte order).
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let b = bytes.get(..RX_NET_HDR_SIZE)?;
        Some(Self {
            payload_length: u32::from_ne_bytes([b[0], b[1], b[2], b[3]]),
            rss_hash: u32::from_ne_bytes([b[4], b[5], b[6], b[7]]),
            checksum_status: b[8],
            _reserved: b[9],
            checksum_value: u16::from_ne_bytes([b[10], b[11]]),
        })
    }
}

/// Write the receive preamble in front of the frame held by `buf`.
pub fn prepend_rx_preamble(buf: &mut PacketBuf) -> Result<(), PoolError> {
    let payload_length = buf.len() as u32;
    let status = if buf.checksum_good() {
        ChecksumStatus::Unnecessary
    } else {
        ChecksumStatus::Needed
    };
    let hdr = buf.prepend_header::<RxNetHdr>()?;
    hdr.payload_length = payload_length;
    hdr.rss_hash = 0;
    hdr.set_checksum_status(status);
    hdr.checksum_value = 0;
    Ok(())
}

/// Swap source and destination MAC in place. Returns `false` for runt frames.
pub fn swap_ether_src_dest(frame: &mut [u8]) -> bool {
    let Ok(mut eth) = EthernetFrame::new_checked(frame) else {
        return false;
    };
    let (src, dst) = (eth.src_addr(), eth.dst_addr());
    eth.set_src_addr(dst);
    eth.set_dst_addr(src);
    true
}

/// Swap source and destination IPv4 address in place.
///
/// Only IPv4 is handled; other ether types are logged and left untouched.
/// The header checksum stays valid because the address words only move.
pub fn swap_ipv4_src_dest(frame: &mut [u8]) -> bool {
    let Ok(mut eth) = EthernetFrame::new_checked(frame) else {
        return false;
    };
    let ethertype = eth.ethertype();
    if ethertype != EthernetProtocol::Ipv4 {
        warn!(ethertype = %ethertype, "Unhandled ether type, not swapping IP addresses");
        return false;
    }
    let Ok(mut ip) = Ipv4Packet::new_checked(eth.payload_mut()) else {
        return false;
    };
    let (src, dst) = (ip.src_addr(), ip.dst_addr());
    ip.set_src_addr(dst);
    ip.set_dst_addr(src);
    true
}
