//! Ethernet frame builders for tests
//!
//! Uses smoltcp for construction, matching the dispatcher's parsing.

use smoltcp::wire::{
    EthernetAddress, EthernetFrame, EthernetProtocol, EthernetRepr, IpProtocol, Ipv4Address,
    Ipv4Packet, Ipv4Repr, UdpPacket, UdpRepr,
};

use crate::packet::ETHERNET_HDR_SIZE;

/// IP header size (without options)
pub const IP_HDR_SIZE: usize = 20;

/// UDP header size
pub const UDP_HDR_SIZE: usize = 8;

pub const MAC_A: EthernetAddress = EthernetAddress([0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa]);
pub const MAC_B: EthernetAddress = EthernetAddress([0x02, 0xbb, 0xbb, 0xbb, 0xbb, 0xbb]);

/// Odd first octet: the group bit is set, so this is not a station address
pub const GROUP_MAC: EthernetAddress = EthernetAddress([0xbb, 0xbb, 0xbb, 0xbb, 0xbb, 0xbb]);

/// Source MAC used for frames "arriving from the wire"
pub const WIRE_MAC: EthernetAddress = EthernetAddress([0x02, 0x00, 0x00, 0x00, 0x00, 0xfe]);

/// Build an Ethernet frame carrying `payload` verbatim.
pub fn build_frame(
    dst: EthernetAddress,
    src: EthernetAddress,
    ethertype: EthernetProtocol,
    payload: &[u8],
) -> Vec<u8> {
    let mut packet = vec![0u8; ETHERNET_HDR_SIZE + payload.len()];
    let eth_repr = EthernetRepr {
        src_addr: src,
        dst_addr: dst,
        ethertype,
    };
    let mut eth_frame = EthernetFrame::new_unchecked(&mut packet[..]);
    eth_repr.emit(&mut eth_frame);
    eth_frame.payload_mut().copy_from_slice(payload);
    packet
}

/// Build an Ethernet/IPv4/UDP frame with valid checksums.
pub fn build_ipv4_frame(
    dst: EthernetAddress,
    src: EthernetAddress,
    src_ip: Ipv4Address,
    dst_ip: Ipv4Address,
    data: &[u8],
) -> Vec<u8> {
    let udp_repr = UdpRepr {
        src_port: 9000,
        dst_port: 9001,
    };
    let udp_len = UDP_HDR_SIZE + data.len();
    let mut packet = vec![0u8; ETHERNET_HDR_SIZE + IP_HDR_SIZE + udp_len];

    let eth_repr = EthernetRepr {
        src_addr: src,
        dst_addr: dst,
        ethertype: EthernetProtocol::Ipv4,
    };
    let mut eth_frame = EthernetFrame::new_unchecked(&mut packet[..]);
    eth_repr.emit(&mut eth_frame);

    let ip_repr = Ipv4Repr {
        src_addr: src_ip,
        dst_addr: dst_ip,
        next_header: IpProtocol::Udp,
        payload_len: udp_len,
        hop_limit: 64,
    };
    let mut ip_packet = Ipv4Packet::new_unchecked(eth_frame.payload_mut());
    ip_repr.emit(
        &mut ip_packet,
        &smoltcp::phy::ChecksumCapabilities::default(),
    );

    let mut udp_packet = UdpPacket::new_unchecked(ip_packet.payload_mut());
    udp_repr.emit(
        &mut udp_packet,
        &src_ip.into(),
        &dst_ip.into(),
        data.len(),
        |buf| buf.copy_from_slice(data),
        &smoltcp::phy::ChecksumCapabilities::default(),
    );

    packet
}

/// A unicast frame from the wire to `dst` with a recognisable payload.
pub fn unicast_to(dst: EthernetAddress, tag: u8) -> Vec<u8> {
    build_frame(dst, WIRE_MAC, EthernetProtocol::Ipv4, &[tag; 46])
}

/// A broadcast ARP-sized frame from the wire.
pub fn broadcast(tag: u8) -> Vec<u8> {
    build_frame(EthernetAddress::BROADCAST, WIRE_MAC, EthernetProtocol::Arp, &[tag; 46])
}
