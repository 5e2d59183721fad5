//! Frame decoding down to TCP segments

use chrono::{DateTime, Utc};
use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use pcap_file::DataLink;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// One direction of a TCP connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Flow {
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

impl Flow {
    pub fn reversed(&self) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
        }
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

/// The parts of a TCP segment reassembly needs
#[derive(Debug, Clone, Copy)]
pub struct TcpSegment<'a> {
    pub flow: Flow,
    pub seq: u32,
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
    pub payload: &'a [u8],
}

/// Decode a captured frame. Returns `None` for anything that is not TCP
/// over IPv4/IPv6 or cannot be sliced.
pub fn decode_frame(datalink: DataLink, data: &[u8]) -> Option<TcpSegment<'_>> {
    let sliced = match datalink {
        DataLink::ETHERNET => SlicedPacket::from_ethernet(data).ok()?,
        DataLink::RAW | DataLink::IPV4 | DataLink::IPV6 => SlicedPacket::from_ip(data).ok()?,
        DataLink::LINUX_SLL => SlicedPacket::from_linux_sll(data).ok()?,
        // 4-byte address family header
        DataLink::NULL | DataLink::LOOP => SlicedPacket::from_ip(data.get(4..)?).ok()?,
        _ => return None,
    };

    let (src_ip, dst_ip) = match &sliced.net {
        Some(NetSlice::Ipv4(v4)) => (
            IpAddr::V4(v4.header().source_addr()),
            IpAddr::V4(v4.header().destination_addr()),
        ),
        Some(NetSlice::Ipv6(v6)) => (
            IpAddr::V6(v6.header().source_addr()),
            IpAddr::V6(v6.header().destination_addr()),
        ),
        _ => return None,
    };

    match sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => Some(TcpSegment {
            flow: Flow {
                src: SocketAddr::new(src_ip, tcp.source_port()),
                dst: SocketAddr::new(dst_ip, tcp.destination_port()),
            },
            seq: tcp.sequence_number(),
            syn: tcp.syn(),
            fin: tcp.fin(),
            rst: tcp.rst(),
            payload: tcp.payload(),
        }),
        _ => None,
    }
}

/// Capture timestamp as UTC time
pub fn capture_time(ts: Duration) -> DateTime<Utc> {
    let secs = i64::try_from(ts.as_secs()).unwrap_or(i64::MAX);
    DateTime::from_timestamp(secs, ts.subsec_nanos()).unwrap_or_default()
}
