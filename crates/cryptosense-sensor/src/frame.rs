//! Link/network/transport decoding of captured frames.

use std::net::IpAddr;

use etherparse::{NetSlice, SlicedPacket, TransportSlice};

/// Link-layer framing of a capture handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Ethernet,
    /// Raw IPv4/IPv6 without a link header (tunnels, some VPNs).
    RawIp,
    /// Linux "cooked" capture, used by the `any` pseudo-interface.
    LinuxSll,
}

/// A raw frame as read from an interface.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub interface: String,
    pub link: LinkKind,
    pub data: Vec<u8>,
}

/// The parts of a TCP/IP frame the fingerprint engine looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSegment {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: Vec<u8>,
    /// Size of the whole captured frame.
    pub frame_len: usize,
}

/// Decode a frame down to its TCP segment. Anything that is not TCP over
/// IPv4/IPv6 yields `None`.
pub fn decode(link: LinkKind, data: &[u8]) -> Option<TcpSegment> {
    let sliced = match link {
        LinkKind::Ethernet => SlicedPacket::from_ethernet(data)
            .ok()
            .or_else(|| SlicedPacket::from_ip(data).ok())?,
        LinkKind::RawIp => SlicedPacket::from_ip(data).ok()?,
        LinkKind::LinuxSll => SlicedPacket::from_linux_sll(data).ok()?,
    };

    let (src_ip, dst_ip) = match &sliced.net {
        Some(NetSlice::Ipv4(ipv4)) => (
            IpAddr::V4(ipv4.header().source_addr()),
            IpAddr::V4(ipv4.header().destination_addr()),
        ),
        Some(NetSlice::Ipv6(ipv6)) => (
            IpAddr::V6(ipv6.header().source_addr()),
            IpAddr::V6(ipv6.header().destination_addr()),
        ),
        _ => return None,
    };

    match &sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => Some(TcpSegment {
            src_ip,
            dst_ip,
            src_port: tcp.source_port(),
            dst_port: tcp.destination_port(),
            payload: tcp.payload().to_vec(),
            frame_len: data.len(),
        }),
        _ => None,
    }
}
