//! Packet decode and synthetic reply construction
//!
//! Decoding goes through smoltcp wire types so every header access is
//! bounds-checked; nothing here trusts caller-supplied lengths. Encoding
//! builds the raw IPv4 reply bytes (SYN-ACK, ACK, FIN-ACK, RST, data
//! segments, UDP datagrams) with correct internet checksums. The codec never
//! touches the session table.

use crate::error::{EngineError, Result};
use smoltcp::wire::{IpProtocol, IpVersion, Ipv4Packet, Ipv6Packet, TcpPacket, UdpPacket};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

pub const DEFAULT_MTU: usize = 1500;
pub const DEFAULT_MSS_V4: u16 = 1360;

/// TCP flag set as seen on the wire
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
}

impl TcpFlags {
    pub fn syn_ack() -> Self {
        Self { syn: true, ack: true, ..Default::default() }
    }
    pub fn ack_only() -> Self {
        Self { ack: true, ..Default::default() }
    }
    pub fn fin_ack() -> Self {
        Self { fin: true, ack: true, ..Default::default() }
    }
    pub fn rst_only() -> Self {
        Self { rst: true, ..Default::default() }
    }
    pub fn rst_ack() -> Self {
        Self { rst: true, ack: true, ..Default::default() }
    }
    pub fn psh_ack() -> Self {
        Self { psh: true, ack: true, ..Default::default() }
    }

    pub fn to_byte(self) -> u8 {
        let mut flags = 0u8;
        if self.fin { flags |= 0x01; }
        if self.syn { flags |= 0x02; }
        if self.rst { flags |= 0x04; }
        if self.psh { flags |= 0x08; }
        if self.ack { flags |= 0x10; }
        flags
    }
}

/// TCP options carried on synthetic segments
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpOptions {
    /// Maximum segment size (SYN-ACK only)
    pub mss: Option<u16>,
    /// Window scale shift (SYN-ACK only)
    pub window_scale: Option<u8>,
    /// (TSval, TSecr) echo pair
    pub timestamp: Option<(u32, u32)>,
}

impl TcpOptions {
    pub fn none() -> Self {
        Self::default()
    }

    fn encode(&self) -> Vec<u8> {
        let mut opts = Vec::new();
        if let Some(mss) = self.mss {
            opts.extend_from_slice(&[2, 4]);
            opts.extend_from_slice(&mss.to_be_bytes());
        }
        if let Some(shift) = self.window_scale {
            opts.extend_from_slice(&[1, 3, 3, shift]);
        }
        if let Some((tsval, tsecr)) = self.timestamp {
            opts.extend_from_slice(&[1, 1, 8, 10]);
            opts.extend_from_slice(&tsval.to_be_bytes());
            opts.extend_from_slice(&tsecr.to_be_bytes());
        }
        while opts.len() % 4 != 0 {
            opts.push(1);
        }
        opts
    }
}

/// Decoded TCP header fields
#[derive(Debug, Clone)]
pub struct TcpInfo {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub mss: Option<u16>,
    pub window_scale: Option<u8>,
    pub tsval: Option<u32>,
    pub tsecr: Option<u32>,
    pub payload_len: usize,
}

/// Decoded UDP header fields
#[derive(Debug, Clone)]
pub struct UdpInfo {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload_len: usize,
}

#[derive(Debug, Clone)]
pub enum TransportInfo {
    Tcp(TcpInfo),
    Udp(UdpInfo),
}

/// Decoded view over one tunnel datagram
///
/// Valid only for the lifetime of the backing buffer; payload that must
/// outlive it is copied into the owning session's buffer.
#[derive(Debug, Clone)]
pub struct ParsedPacket {
    pub version: IpVersion,
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub protocol: IpProtocol,
    /// Absolute offset of the transport payload in the original buffer
    payload_start: usize,
    payload_end: usize,
    pub transport: TransportInfo,
}

impl ParsedPacket {
    pub fn src_socket(&self) -> SocketAddr {
        match &self.transport {
            TransportInfo::Tcp(t) => SocketAddr::new(self.src_addr, t.src_port),
            TransportInfo::Udp(u) => SocketAddr::new(self.src_addr, u.src_port),
        }
    }

    pub fn dst_socket(&self) -> SocketAddr {
        match &self.transport {
            TransportInfo::Tcp(t) => SocketAddr::new(self.dst_addr, t.dst_port),
            TransportInfo::Udp(u) => SocketAddr::new(self.dst_addr, u.dst_port),
        }
    }

    /// Transport payload view into the original buffer
    pub fn payload<'a>(&self, raw: &'a [u8]) -> &'a [u8] {
        let end = self.payload_end.min(raw.len());
        if self.payload_start >= end {
            &[]
        } else {
            &raw[self.payload_start..end]
        }
    }
}

/// Parse one raw IP packet from the tunnel.
pub fn parse_packet(data: &[u8]) -> Result<ParsedPacket> {
    if data.is_empty() {
        return Err(EngineError::PacketTooShort { expected: 1, actual: 0 });
    }

    let version = (data[0] >> 4) & 0x0F;
    match version {
        4 => parse_ipv4(data),
        6 => parse_ipv6(data),
        _ => Err(EngineError::InvalidIpVersion(version)),
    }
}

fn parse_ipv4(data: &[u8]) -> Result<ParsedPacket> {
    let pkt = Ipv4Packet::new_checked(data)
        .map_err(|e| EngineError::InvalidPacket(format!("IPv4: {}", e)))?;

    let ihl = ((data[0] & 0x0F) as usize) * 4;
    let payload = pkt.payload();
    let protocol = pkt.next_header();
    let src = pkt.src_addr();
    let dst = pkt.dst_addr();

    let (transport, header_len) = parse_transport(protocol, payload)?;

    Ok(ParsedPacket {
        version: IpVersion::Ipv4,
        src_addr: IpAddr::V4(src),
        dst_addr: IpAddr::V4(dst),
        protocol,
        payload_start: ihl + header_len,
        payload_end: ihl + payload.len(),
        transport,
    })
}

/// IPv6 is decoded far enough to classify the flow; extension headers are
/// not walked and the engine does not relay IPv6 traffic.
fn parse_ipv6(data: &[u8]) -> Result<ParsedPacket> {
    let pkt = Ipv6Packet::new_checked(data)
        .map_err(|e| EngineError::InvalidPacket(format!("IPv6: {}", e)))?;

    let payload = pkt.payload();
    let protocol = pkt.next_header();
    let src = pkt.src_addr();
    let dst = pkt.dst_addr();

    let (transport, header_len) = parse_transport(protocol, payload)?;

    Ok(ParsedPacket {
        version: IpVersion::Ipv6,
        src_addr: IpAddr::V6(src),
        dst_addr: IpAddr::V6(dst),
        protocol,
        payload_start: 40 + header_len,
        payload_end: 40 + payload.len(),
        transport,
    })
}

fn parse_transport(protocol: IpProtocol, payload: &[u8]) -> Result<(TransportInfo, usize)> {
    match protocol {
        IpProtocol::Tcp => parse_tcp(payload),
        IpProtocol::Udp => parse_udp(payload),
        other => Err(EngineError::UnsupportedProtocol(other.into())),
    }
}

fn parse_tcp(data: &[u8]) -> Result<(TransportInfo, usize)> {
    let pkt = TcpPacket::new_checked(data)
        .map_err(|e| EngineError::InvalidPacket(format!("TCP: {}", e)))?;

    let header_len = pkt.header_len() as usize;
    let mut mss = None;
    let mut window_scale = None;
    let mut tsval = None;
    let mut tsecr = None;

    // Option walk: MSS, window scale and timestamps; everything else skipped
    if header_len > 20 && data.len() >= header_len {
        let opts = &data[20..header_len];
        let mut i = 0;
        while i < opts.len() {
            match opts[i] {
                0 => break,
                1 => i += 1,
                2 if i + 4 <= opts.len() => {
                    mss = Some(u16::from_be_bytes([opts[i + 2], opts[i + 3]]));
                    i += 4;
                }
                3 if i + 3 <= opts.len() => {
                    window_scale = Some(opts[i + 2]);
                    i += 3;
                }
                8 if i + 10 <= opts.len() => {
                    tsval = Some(u32::from_be_bytes([
                        opts[i + 2], opts[i + 3], opts[i + 4], opts[i + 5],
                    ]));
                    tsecr = Some(u32::from_be_bytes([
                        opts[i + 6], opts[i + 7], opts[i + 8], opts[i + 9],
                    ]));
                    i += 10;
                }
                _ => {
                    if i + 1 < opts.len() && opts[i + 1] > 1 {
                        i += opts[i + 1] as usize;
                    } else {
                        break;
                    }
                }
            }
        }
    }

    let info = TcpInfo {
        src_port: pkt.src_port(),
        dst_port: pkt.dst_port(),
        seq: pkt.seq_number().0 as u32,
        ack: pkt.ack_number().0 as u32,
        flags: TcpFlags {
            fin: pkt.fin(),
            syn: pkt.syn(),
            rst: pkt.rst(),
            psh: pkt.psh(),
            ack: pkt.ack(),
        },
        window: pkt.window_len(),
        mss,
        window_scale,
        tsval,
        tsecr,
        payload_len: data.len().saturating_sub(header_len),
    };
    Ok((TransportInfo::Tcp(info), header_len))
}

fn parse_udp(data: &[u8]) -> Result<(TransportInfo, usize)> {
    let pkt = UdpPacket::new_checked(data)
        .map_err(|e| EngineError::InvalidPacket(format!("UDP: {}", e)))?;

    let info = UdpInfo {
        src_port: pkt.src_port(),
        dst_port: pkt.dst_port(),
        payload_len: pkt.payload().len(),
    };
    Ok((TransportInfo::Udp(info), 8))
}

/// Build a raw IPv4 TCP segment.
#[allow(clippy::too_many_arguments)]
pub fn build_ipv4_tcp(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    window: u16,
    payload: &[u8],
    options: &TcpOptions,
) -> Vec<u8> {
    use std::sync::atomic::{AtomicU16, Ordering};
    static IP_ID: AtomicU16 = AtomicU16::new(1);

    let opts = options.encode();
    let tcp_hdr_len = 20 + opts.len();
    let total_len = 20 + tcp_hdr_len + payload.len();

    let mut pkt = vec![0u8; total_len];

    // IPv4 header
    pkt[0] = 0x45;
    pkt[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    let ip_id = IP_ID.fetch_add(1, Ordering::Relaxed);
    pkt[4..6].copy_from_slice(&ip_id.to_be_bytes());
    pkt[6..8].copy_from_slice(&0x4000u16.to_be_bytes());
    pkt[8] = 64;
    pkt[9] = 6;
    pkt[12..16].copy_from_slice(&src_ip.octets());
    pkt[16..20].copy_from_slice(&dst_ip.octets());

    let ip_cksum = checksum(&pkt[..20]);
    pkt[10..12].copy_from_slice(&ip_cksum.to_be_bytes());

    // TCP header
    let tcp = 20;
    pkt[tcp..tcp + 2].copy_from_slice(&src_port.to_be_bytes());
    pkt[tcp + 2..tcp + 4].copy_from_slice(&dst_port.to_be_bytes());
    pkt[tcp + 4..tcp + 8].copy_from_slice(&seq.to_be_bytes());
    pkt[tcp + 8..tcp + 12].copy_from_slice(&ack.to_be_bytes());
    pkt[tcp + 12] = ((tcp_hdr_len / 4) as u8) << 4;
    pkt[tcp + 13] = flags.to_byte();
    pkt[tcp + 14..tcp + 16].copy_from_slice(&window.to_be_bytes());
    pkt[tcp + 20..tcp + 20 + opts.len()].copy_from_slice(&opts);

    let payload_start = tcp + tcp_hdr_len;
    if !payload.is_empty() {
        pkt[payload_start..payload_start + payload.len()].copy_from_slice(payload);
    }

    let tcp_cksum = transport_checksum(&src_ip.octets(), &dst_ip.octets(), 6, &pkt[tcp..]);
    pkt[tcp + 16..tcp + 18].copy_from_slice(&tcp_cksum.to_be_bytes());

    pkt
}

/// Build a raw IPv4 UDP datagram.
pub fn build_ipv4_udp(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let total_len = 20 + 8 + payload.len();
    let mut pkt = vec![0u8; total_len];

    pkt[0] = 0x45;
    pkt[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    pkt[6..8].copy_from_slice(&0x4000u16.to_be_bytes());
    pkt[8] = 64;
    pkt[9] = 17;
    pkt[12..16].copy_from_slice(&src_ip.octets());
    pkt[16..20].copy_from_slice(&dst_ip.octets());

    let ip_cksum = checksum(&pkt[..20]);
    pkt[10..12].copy_from_slice(&ip_cksum.to_be_bytes());

    let udp_len = (8 + payload.len()) as u16;
    pkt[20..22].copy_from_slice(&src_port.to_be_bytes());
    pkt[22..24].copy_from_slice(&dst_port.to_be_bytes());
    pkt[24..26].copy_from_slice(&udp_len.to_be_bytes());

    if !payload.is_empty() {
        pkt[28..].copy_from_slice(payload);
    }

    let udp_cksum = {
        let c = transport_checksum(&src_ip.octets(), &dst_ip.octets(), 17, &pkt[20..]);
        if c == 0 { 0xFFFF } else { c }
    };
    pkt[26..28].copy_from_slice(&udp_cksum.to_be_bytes());

    pkt
}

fn checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    for i in (0..data.len()).step_by(2) {
        let word = if i + 1 < data.len() {
            ((data[i] as u32) << 8) | (data[i + 1] as u32)
        } else {
            (data[i] as u32) << 8
        };
        sum = sum.wrapping_add(word);
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !sum as u16
}

fn transport_checksum(src: &[u8; 4], dst: &[u8; 4], proto: u8, data: &[u8]) -> u16 {
    let mut sum = 0u32;
    sum = sum.wrapping_add(((src[0] as u32) << 8) | src[1] as u32);
    sum = sum.wrapping_add(((src[2] as u32) << 8) | src[3] as u32);
    sum = sum.wrapping_add(((dst[0] as u32) << 8) | dst[1] as u32);
    sum = sum.wrapping_add(((dst[2] as u32) << 8) | dst[3] as u32);
    sum = sum.wrapping_add(proto as u32);
    sum = sum.wrapping_add(data.len() as u32);
    for i in (0..data.len()).step_by(2) {
        let word = if i + 1 < data.len() {
            ((data[i] as u32) << 8) | (data[i + 1] as u32)
        } else {
            (data[i] as u32) << 8
        };
        sum = sum.wrapping_add(word);
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !sum as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(a: u8, b: u8, c: u8, d: u8) -> Ipv4Addr {
        Ipv4Addr::new(a, b, c, d)
    }

    #[test]
    fn tcp_round_trip_preserves_header_fields() {
        let payload = b"hello tunnel";
        let raw = build_ipv4_tcp(
            addr(10, 0, 0, 2),
            addr(93, 184, 216, 34),
            5000,
            443,
            0x1122_3344,
            0x5566_7788,
            TcpFlags::psh_ack(),
            8192,
            payload,
            &TcpOptions::none(),
        );

        let parsed = parse_packet(&raw).unwrap();
        assert_eq!(parsed.src_addr, IpAddr::V4(addr(10, 0, 0, 2)));
        assert_eq!(parsed.dst_addr, IpAddr::V4(addr(93, 184, 216, 34)));
        let TransportInfo::Tcp(tcp) = &parsed.transport else {
            panic!("expected TCP");
        };
        assert_eq!(tcp.src_port, 5000);
        assert_eq!(tcp.dst_port, 443);
        assert_eq!(tcp.seq, 0x1122_3344);
        assert_eq!(tcp.ack, 0x5566_7788);
        assert_eq!(tcp.flags, TcpFlags::psh_ack());
        assert_eq!(tcp.window, 8192);
        assert_eq!(parsed.payload(&raw), payload);
    }

    #[test]
    fn syn_ack_options_round_trip() {
        let options = TcpOptions {
            mss: Some(1360),
            window_scale: Some(7),
            timestamp: Some((123456, 654321)),
        };
        let raw = build_ipv4_tcp(
            addr(93, 184, 216, 34),
            addr(10, 0, 0, 2),
            443,
            5000,
            1000,
            101,
            TcpFlags::syn_ack(),
            65535,
            &[],
            &options,
        );

        let parsed = parse_packet(&raw).unwrap();
        let TransportInfo::Tcp(tcp) = &parsed.transport else {
            panic!("expected TCP");
        };
        assert_eq!(tcp.mss, Some(1360));
        assert_eq!(tcp.window_scale, Some(7));
        assert_eq!(tcp.tsval, Some(123456));
        assert_eq!(tcp.tsecr, Some(654321));
        assert!(tcp.flags.syn && tcp.flags.ack);
        assert_eq!(tcp.payload_len, 0);
    }

    #[test]
    fn udp_round_trip() {
        let raw = build_ipv4_udp(addr(10, 0, 0, 2), addr(8, 8, 8, 8), 5353, 53, b"query");
        let parsed = parse_packet(&raw).unwrap();
        let TransportInfo::Udp(udp) = &parsed.transport else {
            panic!("expected UDP");
        };
        assert_eq!(udp.src_port, 5353);
        assert_eq!(udp.dst_port, 53);
        assert_eq!(parsed.payload(&raw), b"query");
    }

    #[test]
    fn checksums_verify() {
        let raw = build_ipv4_tcp(
            addr(1, 2, 3, 4),
            addr(5, 6, 7, 8),
            1234,
            80,
            42,
            7,
            TcpFlags::ack_only(),
            1024,
            b"data",
            &TcpOptions::none(),
        );
        // A correct checksum folds the covered region to zero
        assert_eq!(checksum(&raw[..20]), 0);
        assert_eq!(
            transport_checksum(&[1, 2, 3, 4], &[5, 6, 7, 8], 6, &raw[20..]),
            0
        );
    }

    #[test]
    fn unsupported_protocol_is_reported() {
        let mut raw = build_ipv4_udp(addr(1, 1, 1, 1), addr(2, 2, 2, 2), 1, 2, b"x");
        raw[9] = 1; // ICMP
        match parse_packet(&raw) {
            Err(EngineError::UnsupportedProtocol(1)) => {}
            other => panic!("expected UnsupportedProtocol, got {:?}", other),
        }
    }

    #[test]
    fn invalid_version_is_reported() {
        let raw = [0x00u8; 40];
        assert!(matches!(
            parse_packet(&raw),
            Err(EngineError::InvalidIpVersion(0))
        ));
    }

    #[test]
    fn truncated_packet_is_rejected() {
        let raw = build_ipv4_tcp(
            addr(1, 2, 3, 4),
            addr(5, 6, 7, 8),
            1234,
            80,
            0,
            0,
            TcpFlags::ack_only(),
            0,
            &[],
            &TcpOptions::none(),
        );
        assert!(parse_packet(&raw[..18]).is_err());
        assert!(parse_packet(&[]).is_err());
    }
}
