//! Connection and protocol extraction from an Ethernet frame.

use crate::skb::{ETH_HLEN, SkBuff};
use crate::wire::{IPPROTO_DSTOPTS, IPPROTO_TCP, IPV4_MIN_HLEN, IPV6_HLEN};
use crate::{ConnectionInfo, ipv4_mapped};

pub const ETH_P_IP: u16 = 0x0800;
pub const ETH_P_IPV6: u16 = 0x86DD;

const ETH_PROTO_OFFSET: usize = 12;

const IPV4_TOT_LEN_OFFSET: usize = 2;
const IPV4_PROTO_OFFSET: usize = 9;
pub const IPV4_CHECK_OFFSET: usize = 10;
const IPV4_SRC_OFFSET: usize = 12;
const IPV4_DST_OFFSET: usize = 16;

const IPV6_PAYLOAD_LEN_OFFSET: usize = 4;
pub const IPV6_NEXT_HDR_OFFSET: usize = 6;
const IPV6_SRC_OFFSET: usize = 8;
const IPV6_DST_OFFSET: usize = 24;

pub const TCP_MIN_HLEN: usize = 20;

/// Per-packet facts the parser and injector work from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProtocolInfo {
    /// Ethertype.
    pub h_proto: u16,
    /// Protocol field of the fixed IP header; for IPv6 the first next-header.
    pub l4_proto: u8,
    /// Frame offset of the first byte past the IP header stack.
    pub ip_len: usize,
    /// IPv4 total length, or IPv6 payload length.
    pub tot_len: u16,
    pub seq: u32,
    pub ack: u32,
}

impl ProtocolInfo {
    pub fn is_ipv4(&self) -> bool {
        self.h_proto == ETH_P_IP
    }

    pub fn is_ipv6(&self) -> bool {
        self.h_proto == ETH_P_IPV6
    }
}

/// Reads the connection tuple and protocol descriptor of a TCP frame.
///
/// Returns `None` for truncated frames, non-IP ethertypes, and anything that
/// isn't TCP. The tuple is returned as seen on the wire, not canonicalized.
pub fn read_frame<P: SkBuff>(skb: &P) -> Option<(ConnectionInfo, ProtocolInfo)> {
    let h_proto = skb.load_u16(ETH_PROTO_OFFSET).ok()?;
    let (mut conn, mut proto) = match h_proto {
        ETH_P_IP => read_ipv4(skb)?,
        ETH_P_IPV6 => read_ipv6(skb)?,
        _ => return None,
    };
    proto.h_proto = h_proto;

    if proto.ip_len + TCP_MIN_HLEN > skb.len() {
        return None;
    }
    let mut tcp = [0u8; 12];
    skb.load_bytes(proto.ip_len, &mut tcp).ok()?;
    conn.s_port = u16::from_be_bytes([tcp[0], tcp[1]]);
    conn.d_port = u16::from_be_bytes([tcp[2], tcp[3]]);
    proto.seq = u32::from_be_bytes([tcp[4], tcp[5], tcp[6], tcp[7]]);
    proto.ack = u32::from_be_bytes([tcp[8], tcp[9], tcp[10], tcp[11]]);

    Some((conn, proto))
}

fn read_ipv4<P: SkBuff>(skb: &P) -> Option<(ConnectionInfo, ProtocolInfo)> {
    let mut hdr = [0u8; IPV4_MIN_HLEN];
    skb.load_bytes(ETH_HLEN, &mut hdr).ok()?;

    if hdr[0] >> 4 != 4 {
        return None;
    }
    let ihl = ((hdr[0] & 0x0f) as usize) * 4;
    if ihl < IPV4_MIN_HLEN || ETH_HLEN + ihl > skb.len() {
        return None;
    }
    if hdr[IPV4_PROTO_OFFSET] != IPPROTO_TCP {
        return None;
    }

    let mut src = [0u8; 4];
    let mut dst = [0u8; 4];
    src.copy_from_slice(&hdr[IPV4_SRC_OFFSET..IPV4_SRC_OFFSET + 4]);
    dst.copy_from_slice(&hdr[IPV4_DST_OFFSET..IPV4_DST_OFFSET + 4]);

    let conn = ConnectionInfo {
        s_addr: ipv4_mapped(src),
        d_addr: ipv4_mapped(dst),
        ..Default::default()
    };
    let proto = ProtocolInfo {
        l4_proto: IPPROTO_TCP,
        ip_len: ETH_HLEN + ihl,
        tot_len: u16::from_be_bytes([
            hdr[IPV4_TOT_LEN_OFFSET],
            hdr[IPV4_TOT_LEN_OFFSET + 1],
        ]),
        ..Default::default()
    };
    Some((conn, proto))
}

fn read_ipv6<P: SkBuff>(skb: &P) -> Option<(ConnectionInfo, ProtocolInfo)> {
    let mut hdr = [0u8; IPV6_HLEN];
    skb.load_bytes(ETH_HLEN, &mut hdr).ok()?;

    if hdr[0] >> 4 != 6 {
        return None;
    }

    let next_hdr = hdr[IPV6_NEXT_HDR_OFFSET];
    let mut ip_len = ETH_HLEN + IPV6_HLEN;
    match next_hdr {
        IPPROTO_TCP => {}
        // A single destination-options header is followed, which is all we
        // ever insert ourselves.
        IPPROTO_DSTOPTS => {
            let mut ext = [0u8; 2];
            skb.load_bytes(ip_len, &mut ext).ok()?;
            if ext[0] != IPPROTO_TCP {
                return None;
            }
            ip_len += (ext[1] as usize + 1) * 8;
        }
        _ => return None,
    }

    let mut conn = ConnectionInfo::default();
    conn.s_addr
        .copy_from_slice(&hdr[IPV6_SRC_OFFSET..IPV6_SRC_OFFSET + 16]);
    conn.d_addr
        .copy_from_slice(&hdr[IPV6_DST_OFFSET..IPV6_DST_OFFSET + 16]);

    let proto = ProtocolInfo {
        l4_proto: next_hdr,
        ip_len,
        tot_len: u16::from_be_bytes([
            hdr[IPV6_PAYLOAD_LEN_OFFSET],
            hdr[IPV6_PAYLOAD_LEN_OFFSET + 1],
        ]),
        ..Default::default()
    };
    Some((conn, proto))
}

/// True when the stored IPv4 header checksum matches the header contents.
pub fn ipv4_checksum_ok<P: SkBuff>(skb: &P, proto: &ProtocolInfo) -> bool {
    let mut header = [0u8; 60];
    let len = proto.ip_len - ETH_HLEN;
    if !proto.is_ipv4() || len > header.len() {
        return false;
    }
    if skb.load_bytes(ETH_HLEN, &mut header[..len]).is_err() {
        return false;
    }
    let stored = u16::from_be_bytes([header[IPV4_CHECK_OFFSET], header[IPV4_CHECK_OFFSET + 1]]);
    crate::csum::ipv4_header_checksum(&header[..len]) == stored
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{FrameBuf, frames};

    #[test]
    fn reads_ipv4_tcp_frame() {
        let frame = FrameBuf::new(frames::ipv4_tcp([10, 0, 0, 1], 40000, [10, 0, 0, 2], 80, 100, 200));
        let (conn, proto) = read_frame(&frame).expect("tcp frame");

        assert_eq!(conn.s_addr, ipv4_mapped([10, 0, 0, 1]));
        assert_eq!(conn.d_addr, ipv4_mapped([10, 0, 0, 2]));
        assert_eq!((conn.s_port, conn.d_port), (40000, 80));
        assert_eq!(proto.h_proto, ETH_P_IP);
        assert_eq!(proto.l4_proto, IPPROTO_TCP);
        assert_eq!(proto.ip_len, ETH_HLEN + 20);
        assert_eq!(proto.tot_len, 40);
        assert_eq!((proto.seq, proto.ack), (100, 200));
    }

    #[test]
    fn reads_ipv6_tcp_frame() {
        let src = [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];
        let dst = [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2];
        let frame = FrameBuf::new(frames::ipv6_tcp(src, 50000, dst, 443, 7, 9));
        let (conn, proto) = read_frame(&frame).expect("tcp frame");

        assert_eq!(conn.s_addr, src);
        assert_eq!(conn.d_addr, dst);
        assert_eq!(proto.h_proto, ETH_P_IPV6);
        assert_eq!(proto.ip_len, ETH_HLEN + IPV6_HLEN);
        assert_eq!(proto.tot_len, 20);
        assert_eq!((proto.seq, proto.ack), (7, 9));
    }

    #[test]
    fn built_frames_carry_valid_checksum() {
        let frame = FrameBuf::new(frames::ipv4_tcp([10, 0, 0, 1], 1, [10, 0, 0, 2], 2, 0, 0));
        let (_, proto) = read_frame(&frame).expect("tcp frame");
        assert!(ipv4_checksum_ok(&frame, &proto));

        let mut bytes = frame.into_inner();
        bytes[ETH_HLEN + 8] = 1; // ttl
        let frame = FrameBuf::new(bytes);
        assert!(!ipv4_checksum_ok(&frame, &proto));
    }

    #[test]
    fn rejects_udp() {
        let mut bytes = frames::ipv4_tcp([10, 0, 0, 1], 1, [10, 0, 0, 2], 2, 0, 0);
        bytes[ETH_HLEN + IPV4_PROTO_OFFSET] = 17;
        assert!(read_frame(&FrameBuf::new(bytes)).is_none());
    }

    #[test]
    fn rejects_non_ip_ethertype() {
        let mut bytes = frames::ipv4_tcp([10, 0, 0, 1], 1, [10, 0, 0, 2], 2, 0, 0);
        bytes[12..14].copy_from_slice(&0x0806u16.to_be_bytes());
        assert!(read_frame(&FrameBuf::new(bytes)).is_none());
    }

    #[test]
    fn rejects_truncated_frames() {
        let bytes = frames::ipv4_tcp([10, 0, 0, 1], 1, [10, 0, 0, 2], 2, 0, 0);
        for cut in [0, 10, ETH_HLEN + 10, ETH_HLEN + 20, ETH_HLEN + 30] {
            assert!(
                read_frame(&FrameBuf::new(bytes[..cut].to_vec())).is_none(),
                "cut at {cut} parsed"
            );
        }
    }

    #[test]
    fn rejects_ihl_below_minimum() {
        let mut bytes = frames::ipv4_tcp([10, 0, 0, 1], 1, [10, 0, 0, 2], 2, 0, 0);
        bytes[ETH_HLEN] = 0x44;
        assert!(read_frame(&FrameBuf::new(bytes)).is_none());
    }
}
