//! Discovery of a trace context carried in an inbound packet's IP header.

use crate::conn::ProtocolInfo;
use crate::maps::{ContextMap, InsertMode, TraceMaps};
use crate::skb::{ETH_HLEN, SkBuff};
use crate::wire::{
    IP_OPTION_LEN, IPPROTO_DSTOPTS, IPV4_MIN_HLEN, IPV6_DEST_OPTS_LEN, IPV6_HLEN,
    MAX_IP_OPTION_SCAN, OptionStep, TraceId, classify_ipv4_option, decode_ipv6_dest_opts,
};
use crate::{ConnectionInfo, ContextState, TraceParent, TracePidInfo};

/// Bytes of the IPv4 option that must be readable: type, length, trace id.
const IPV4_OPTION_PAYLOAD: usize = 2 + 16;

/// Result of walking the IPv4 option area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionScan {
    /// Frame offset of the trace option, if one was found.
    pub found: Option<usize>,
    /// Number of options inspected.
    pub steps: usize,
}

/// Walks IPv4 options between the fixed header and `ip_len`, inspecting at
/// most [`MAX_IP_OPTION_SCAN`] of them.
pub fn scan_ipv4_options<P: SkBuff>(skb: &P, ip_len: usize) -> OptionScan {
    let mut offset = ETH_HLEN + IPV4_MIN_HLEN;
    let mut steps = 0;

    for _ in 0..MAX_IP_OPTION_SCAN {
        if offset + 2 > ip_len {
            break;
        }
        let Ok(header) = skb.load_u16(offset) else {
            break;
        };
        steps += 1;
        match classify_ipv4_option(header) {
            OptionStep::Found => {
                return OptionScan {
                    found: Some(offset),
                    steps,
                };
            }
            OptionStep::End => break,
            OptionStep::Skip(len) => offset += len,
        }
    }

    OptionScan { found: None, steps }
}

/// Looks for a trace option and records it for `conn` (canonical) when this
/// connection has no incoming context yet. Returns true whenever the packet
/// carries the option, so a carrying packet is never injected into.
pub fn parse_ip_options<P, M>(skb: &P, conn: &ConnectionInfo, proto: &ProtocolInfo, maps: &M) -> bool
where
    P: SkBuff,
    M: TraceMaps,
{
    let trace_id = if proto.is_ipv4() && proto.ip_len >= ETH_HLEN + IPV4_MIN_HLEN + IP_OPTION_LEN {
        read_ipv4_trace_id(skb, proto.ip_len)
    } else if proto.is_ipv6()
        && proto.l4_proto == IPPROTO_DSTOPTS
        && proto.ip_len == ETH_HLEN + IPV6_HLEN + IPV6_DEST_OPTS_LEN
    {
        read_ipv6_trace_id(skb)
    } else {
        None
    };
    let Some(trace_id) = trace_id else {
        return false;
    };

    // The first context seen on a connection sticks.
    if maps.incoming().contains(conn) {
        return true;
    }

    let entry = TracePidInfo {
        tp: TraceParent {
            trace_id,
            span_id: TraceParent::span_from_tcp(proto.seq, proto.ack),
        },
        pid: 0,
        valid: ContextState::SpanAssigned as u8,
        written: 0,
        _pad: [0; 2],
    };
    // Losing the insert race to another CPU leaves that CPU's entry in place.
    let _ = maps.incoming().insert(conn, &entry, InsertMode::NoExist);
    true
}

fn read_ipv4_trace_id<P: SkBuff>(skb: &P, ip_len: usize) -> Option<TraceId> {
    let offset = scan_ipv4_options(skb, ip_len).found?;
    if offset + IPV4_OPTION_PAYLOAD > ip_len {
        return None;
    }
    let mut trace_id = [0u8; 16];
    skb.load_bytes(offset + 2, &mut trace_id).ok()?;
    Some(trace_id)
}

fn read_ipv6_trace_id<P: SkBuff>(skb: &P) -> Option<TraceId> {
    let mut block = [0u8; IPV6_DEST_OPTS_LEN];
    skb.load_bytes(ETH_HLEN + IPV6_HLEN, &mut block).ok()?;
    decode_ipv6_dest_opts(&block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::read_frame;
    use crate::host::{FrameBuf, HostMaps, frames};
    use crate::wire::{IPOPT_NOOP, encode_ipv4_option, encode_ipv6_dest_opts, IPPROTO_TCP};

    const CLIENT: [u8; 4] = [10, 0, 0, 1];
    const SERVER: [u8; 4] = [10, 0, 0, 2];

    fn id(first: u8, last: u8) -> TraceId {
        let mut id = [0x11u8; 16];
        id[0] = first;
        id[15] = last;
        id
    }

    fn with_option(trace_id: TraceId, nops: usize, seq: u32, ack: u32) -> FrameBuf {
        let mut options = vec![IPOPT_NOOP; nops];
        options.extend_from_slice(&encode_ipv4_option(&trace_id));
        FrameBuf::new(frames::ipv4_tcp_with_options(
            SERVER, 80, CLIENT, 40000, seq, ack, &options,
        ))
    }

    fn parse(frame: &FrameBuf, maps: &HostMaps) -> (bool, ConnectionInfo) {
        let (conn, proto) = read_frame(frame).expect("tcp frame");
        let conn = conn.canonical();
        (parse_ip_options(frame, &conn, &proto, maps), conn)
    }

    #[test]
    fn records_inbound_option_once() {
        let maps = HostMaps::default();
        let first = with_option(id(0xaa, 0xbb), 0, 100, 200);
        let (recorded, conn) = parse(&first, &maps);
        assert!(recorded);

        let entry = maps.incoming.get(&conn).expect("incoming entry");
        assert_eq!(entry.tp.trace_id, id(0xaa, 0xbb));
        assert_eq!(entry.tp.span_id, [0, 0, 0, 100, 0, 0, 0, 200]);
        assert_eq!(entry.pid, 0);
        assert_eq!(entry.state(), ContextState::SpanAssigned);

        let later = with_option(id(0xcc, 0xdd), 0, 300, 400);
        let (carried, _) = parse(&later, &maps);
        assert!(carried);
        let entry = maps.incoming.get(&conn).expect("incoming entry");
        assert_eq!(entry.tp.trace_id, id(0xaa, 0xbb));
        assert_eq!(entry.tp.span_id, [0, 0, 0, 100, 0, 0, 0, 200]);
    }

    #[test]
    fn option_after_nine_nops_is_found() {
        let frame = with_option(id(1, 2), 9, 1, 1);
        let (_, proto) = read_frame(&frame).expect("tcp frame");
        let scan = scan_ipv4_options(&frame, proto.ip_len);
        assert_eq!(scan.found, Some(ETH_HLEN + IPV4_MIN_HLEN + 9));
        assert_eq!(scan.steps, MAX_IP_OPTION_SCAN);
    }

    #[test]
    fn scan_gives_up_after_ten_options() {
        for nops in [10, 11] {
            let frame = with_option(id(1, 2), nops, 1, 1);
            let (_, proto) = read_frame(&frame).expect("tcp frame");
            let scan = scan_ipv4_options(&frame, proto.ip_len);
            assert_eq!(scan.found, None, "{nops} nops");
            assert!(scan.steps <= MAX_IP_OPTION_SCAN);

            let maps = HostMaps::default();
            assert!(!parse(&frame, &maps).0);
            assert!(maps.incoming.is_empty());
        }
    }

    #[test]
    fn end_of_options_stops_the_scan() {
        let mut options = vec![0u8; 4];
        options.extend_from_slice(&encode_ipv4_option(&id(1, 2)));
        let frame = FrameBuf::new(frames::ipv4_tcp_with_options(
            SERVER, 80, CLIENT, 40000, 1, 1, &options,
        ));
        let (_, proto) = read_frame(&frame).expect("tcp frame");
        let scan = scan_ipv4_options(&frame, proto.ip_len);
        assert_eq!(scan, OptionScan { found: None, steps: 1 });
    }

    #[test]
    fn plain_header_is_ignored() {
        let maps = HostMaps::default();
        let frame = FrameBuf::new(frames::ipv4_tcp(SERVER, 80, CLIENT, 40000, 1, 1));
        assert!(!parse(&frame, &maps).0);
    }

    #[test]
    fn foreign_options_are_not_mistaken_for_context() {
        // Record route with room for four addresses, then padding.
        let mut options = vec![0x07, 19, 4];
        options.extend_from_slice(&[0u8; 16]);
        options.push(IPOPT_NOOP);
        let frame = FrameBuf::new(frames::ipv4_tcp_with_options(
            SERVER, 80, CLIENT, 40000, 1, 1, &options,
        ));
        let maps = HostMaps::default();
        assert!(!parse(&frame, &maps).0);
    }

    #[test]
    fn records_ipv6_destination_option() {
        let src = [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2];
        let dst = [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];
        let mut bytes = frames::ipv6_tcp(src, 443, dst, 50000, 5, 6);
        let at = ETH_HLEN + IPV6_HLEN;
        let block = encode_ipv6_dest_opts(IPPROTO_TCP, &id(0xaa, 0xbb));
        bytes.splice(at..at, block);
        bytes[ETH_HLEN + 6] = IPPROTO_DSTOPTS;
        bytes[ETH_HLEN + 4..ETH_HLEN + 6].copy_from_slice(&44u16.to_be_bytes());

        let frame = FrameBuf::new(bytes);
        let maps = HostMaps::default();
        let (recorded, conn) = parse(&frame, &maps);
        assert!(recorded);
        let entry = maps.incoming.get(&conn).expect("incoming entry");
        assert_eq!(entry.tp.trace_id, id(0xaa, 0xbb));
        assert_eq!(entry.tp.span_id, [0, 0, 0, 5, 0, 0, 0, 6]);
    }
}
