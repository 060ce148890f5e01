//! Embedding a pending outgoing trace context into an outbound packet.

use crate::conn::{IPV4_CHECK_OFFSET, IPV6_NEXT_HDR_OFFSET, ProtocolInfo};
use crate::csum::{replace16, replace32};
use crate::maps::{ContextMap, TraceMaps};
use crate::skb::{ETH_HLEN, SkBuff, SkbError};
use crate::wire::{
    IP_OPTION_HEADER, IP_OPTION_LEN, IPPROTO_DSTOPTS, IPPROTO_TCP, IPV4_MIN_HLEN,
    IPV6_DEST_OPTS_LEN, IPV6_HLEN, TraceId, encode_ipv4_option, encode_ipv6_dest_opts,
};
use crate::{ConnectionInfo, ContextState, EgressKey, PidConnectionInfo, TraceParent};

const IPV4_TOT_LEN_OFFSET: usize = 2;
const IPV6_PAYLOAD_LEN_OFFSET: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Injection {
    /// No outgoing context for this port pair.
    NoContext,
    /// The request instrumentation already propagated the context; entry dropped.
    WrittenByL7,
    /// The context was already put on the wire.
    Consumed,
    /// The packet already carries IP options or extension headers.
    NotInjectable,
    Injected,
    /// Injection was attempted and failed; the context is consumed regardless.
    Failed(SkbError),
}

enum Carrier {
    Ipv4,
    Ipv6,
}

/// Injects the outgoing context registered for `conn` (canonical) into `skb`,
/// at most once per context.
pub fn inject_ip_options<P, M>(
    skb: &mut P,
    conn: &ConnectionInfo,
    proto: &ProtocolInfo,
    maps: &M,
) -> Injection
where
    P: SkBuff,
    M: TraceMaps,
{
    let e_key = conn.egress_key();
    let Some(entry) = maps.outgoing().get(&e_key) else {
        return Injection::NoContext;
    };
    if entry.written_by_l7() {
        let _ = maps.outgoing().remove(&e_key);
        return Injection::WrittenByL7;
    }

    let mut assigned = false;
    let Some(entry) = maps.outgoing().update(&e_key, |e| {
        if e.state() == ContextState::Pending {
            e.tp.set_span_from_tcp(proto.seq, proto.ack);
            assigned = e.advance(ContextState::SpanAssigned);
        }
    }) else {
        return Injection::NoContext;
    };
    if assigned {
        update_request_span_id(maps, conn, entry.pid, &e_key, &entry.tp.span_id);
    }

    if !entry.state().is_active() {
        return Injection::Consumed;
    }
    let Some(carrier) = carrier_for(proto) else {
        return Injection::NotInjectable;
    };

    // Claim the context before touching the packet so that concurrent
    // invocations can't both inject it.
    let mut claimed = false;
    maps.outgoing()
        .update(&e_key, |e| claimed = e.advance(ContextState::Consumed));
    if !claimed {
        return Injection::Consumed;
    }

    let trace_id = entry.tp.trace_id;
    let res = match carrier {
        Carrier::Ipv4 => inject_ipv4(skb, proto, &trace_id),
        Carrier::Ipv6 => inject_ipv6(skb, proto, &trace_id),
    };
    match res {
        Ok(()) => Injection::Injected,
        Err(err) => Injection::Failed(err),
    }
}

/// Only packets without options or extension headers get a carrier.
fn carrier_for(proto: &ProtocolInfo) -> Option<Carrier> {
    if proto.is_ipv4()
        && proto.ip_len == ETH_HLEN + IPV4_MIN_HLEN
        && usize::from(proto.tot_len) + IP_OPTION_LEN <= usize::from(u16::MAX)
    {
        return Some(Carrier::Ipv4);
    }
    if proto.is_ipv6()
        && proto.l4_proto == IPPROTO_TCP
        && proto.ip_len == ETH_HLEN + IPV6_HLEN
        && usize::from(proto.tot_len) + IPV6_DEST_OPTS_LEN <= usize::from(u16::MAX)
    {
        return Some(Carrier::Ipv6);
    }
    None
}

/// Points the request records of the instrumentation layer at the span id
/// that goes on the wire. Records are only rewritten, never created.
fn update_request_span_id<M: TraceMaps>(
    maps: &M,
    conn: &ConnectionInfo,
    pid: u32,
    e_key: &EgressKey,
    span_id: &[u8; 8],
) {
    let p_conn = PidConnectionInfo { conn: *conn, pid };
    maps.ongoing()
        .update(&p_conn, |tp: &mut TraceParent| tp.span_id = *span_id);
    maps.egress_requests()
        .update(e_key, |tp: &mut TraceParent| tp.span_id = *span_id);
}

fn inject_ipv4<P: SkBuff>(skb: &mut P, proto: &ProtocolInfo, trace_id: &TraceId) -> Result<(), SkbError> {
    // Header fields before the insertion point don't move when growing.
    let ver_ihl_tos = skb.load_u16(ETH_HLEN)?;
    let check = skb.load_u16(ETH_HLEN + IPV4_CHECK_OFFSET)?;

    // A store failing past this point leaves the frame grown but only partly rewritten.
    skb.grow_net(IP_OPTION_LEN as u32)?;
    skb.store_bytes(ETH_HLEN + IPV4_MIN_HLEN, &encode_ipv4_option(trace_id))?;

    let tot_len = proto.tot_len + IP_OPTION_LEN as u16;
    skb.store_u16(ETH_HLEN + IPV4_TOT_LEN_OFFSET, tot_len)?;

    let [ver_ihl, tos] = ver_ihl_tos.to_be_bytes();
    let ihl = (ver_ihl & 0x0f) + (IP_OPTION_LEN / 4) as u8;
    let new_ver_ihl_tos = u16::from_be_bytes([(ver_ihl & 0xf0) | ihl, tos]);
    skb.store_u16(ETH_HLEN, new_ver_ihl_tos)?;

    let mut check = replace16(check, proto.tot_len, tot_len);
    check = replace16(check, ver_ihl_tos, new_ver_ihl_tos);
    check = replace16(check, 0, IP_OPTION_HEADER);
    for word in trace_id.chunks_exact(4) {
        check = replace32(check, 0, u32::from_be_bytes([word[0], word[1], word[2], word[3]]));
    }
    skb.store_u16(ETH_HLEN + IPV4_CHECK_OFFSET, check)
}

fn inject_ipv6<P: SkBuff>(skb: &mut P, proto: &ProtocolInfo, trace_id: &TraceId) -> Result<(), SkbError> {
    skb.grow_net(IPV6_DEST_OPTS_LEN as u32)?;
    skb.store_bytes(
        ETH_HLEN + IPV6_HLEN,
        &encode_ipv6_dest_opts(proto.l4_proto, trace_id),
    )?;
    skb.store_u8(ETH_HLEN + IPV6_NEXT_HDR_OFFSET, IPPROTO_DSTOPTS)?;
    skb.store_u16(
        ETH_HLEN + IPV6_PAYLOAD_LEN_OFFSET,
        proto.tot_len + IPV6_DEST_OPTS_LEN as u16,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::{ipv4_checksum_ok, read_frame};
    use crate::host::{FrameBuf, HostMaps, frames};
    use crate::maps::InsertMode;
    use crate::TracePidInfo;

    const CLIENT: [u8; 4] = [10, 0, 0, 1];
    const SERVER: [u8; 4] = [10, 0, 0, 2];
    const TRACE_ID: TraceId = [
        0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f,
        0x10,
    ];
    const KEY: EgressKey = EgressKey {
        s_port: 40000,
        d_port: 80,
    };

    fn seed(maps: &HostMaps, entry: TracePidInfo) {
        maps.outgoing
            .insert(&KEY, &entry, InsertMode::Any)
            .expect("seed outgoing entry");
    }

    fn inject(frame: &mut FrameBuf, maps: &HostMaps) -> Injection {
        let (conn, proto) = read_frame(frame).expect("tcp frame");
        inject_ip_options(frame, &conn.canonical(), &proto, maps)
    }

    fn client_frame(seq: u32, ack: u32) -> FrameBuf {
        FrameBuf::new(frames::ipv4_tcp(CLIENT, 40000, SERVER, 80, seq, ack))
    }

    #[test]
    fn injects_option_into_plain_ipv4_packet() {
        let maps = HostMaps::default();
        seed(&maps, TracePidInfo::pending(TRACE_ID, 1234));
        let original = client_frame(100, 200);
        let mut frame = original.clone();

        assert_eq!(inject(&mut frame, &maps), Injection::Injected);

        let bytes = frame.as_bytes();
        let at = ETH_HLEN + IPV4_MIN_HLEN;
        assert_eq!(bytes.len(), original.as_bytes().len() + IP_OPTION_LEN);
        assert_eq!(&bytes[at..at + 2], &[0x88, 0x14]);
        assert_eq!(&bytes[at + 2..at + 18], &TRACE_ID);
        assert_eq!(&bytes[at + 18..at + 20], &[0x00, 0x00]);
        assert_eq!(bytes[ETH_HLEN], 0x4a);
        assert_eq!(u16::from_be_bytes([bytes[ETH_HLEN + 2], bytes[ETH_HLEN + 3]]), 60);
        // TCP header follows the option untouched.
        assert_eq!(&bytes[at + IP_OPTION_LEN..], &original.as_bytes()[at..]);

        let entry = maps.outgoing.get(&KEY).expect("entry kept");
        assert_eq!(entry.state(), ContextState::Consumed);
        assert_eq!(entry.tp.span_id, [0, 0, 0, 100, 0, 0, 0, 200]);
    }

    #[test]
    fn incremental_checksum_matches_recomputation() {
        let maps = HostMaps::default();
        seed(&maps, TracePidInfo::pending([0xff; 16], 1));
        let mut frame = client_frame(0xdead_beef, 0x0bad_f00d);
        inject(&mut frame, &maps);

        let (_, proto) = read_frame(&frame).expect("tcp frame");
        assert_eq!(proto.ip_len, ETH_HLEN + IPV4_MIN_HLEN + IP_OPTION_LEN);
        assert!(ipv4_checksum_ok(&frame, &proto));
    }

    #[test]
    fn context_is_injected_only_once() {
        let maps = HostMaps::default();
        seed(&maps, TracePidInfo::pending(TRACE_ID, 1));
        let mut first = client_frame(100, 200);
        assert_eq!(inject(&mut first, &maps), Injection::Injected);

        let original = client_frame(120, 200);
        let mut second = original.clone();
        assert_eq!(inject(&mut second, &maps), Injection::Consumed);
        assert_eq!(second, original);
        assert_eq!(
            maps.outgoing.get(&KEY).expect("entry").tp.span_id,
            [0, 0, 0, 100, 0, 0, 0, 200]
        );
    }

    #[test]
    fn concurrent_packets_inject_the_context_once() {
        use crate::dispatch::{Dispatcher, Outcome};
        use crate::host::StaticSockets;

        const PACKETS: u32 = 8;
        let maps = HostMaps::default();
        seed(&maps, TracePidInfo::pending(TRACE_ID, 1));
        let sockets = StaticSockets::new();

        let outcomes: Vec<Outcome> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..PACKETS)
                .map(|i| {
                    let (maps, sockets) = (&maps, &sockets);
                    scope.spawn(move || {
                        let mut frame = client_frame(100 + i, 200);
                        Dispatcher::new(maps, sockets).process(&mut frame)
                    })
                })
                .collect();
            workers
                .into_iter()
                .map(|w| w.join().expect("worker panicked"))
                .collect()
        });

        let injected = outcomes
            .iter()
            .filter(|o| **o == Outcome::Injection(Injection::Injected))
            .count();
        let consumed = outcomes
            .iter()
            .filter(|o| **o == Outcome::Injection(Injection::Consumed))
            .count();
        assert_eq!(injected, 1, "{outcomes:?}");
        assert_eq!(consumed, PACKETS as usize - 1, "{outcomes:?}");
        assert_eq!(
            maps.outgoing.get(&KEY).expect("entry").state(),
            ContextState::Consumed
        );
    }

    #[test]
    fn failed_growth_still_consumes_context() {
        let maps = HostMaps::default();
        seed(&maps, TracePidInfo::pending(TRACE_ID, 1));
        let bytes = frames::ipv4_tcp(CLIENT, 40000, SERVER, 80, 100, 200);
        let mut frame = FrameBuf::refusing_growth(bytes.clone());

        assert_eq!(
            inject(&mut frame, &maps),
            Injection::Failed(SkbError::NoRoom)
        );
        assert_eq!(frame.as_bytes(), bytes.as_slice());
        assert_eq!(
            maps.outgoing.get(&KEY).expect("entry").state(),
            ContextState::Consumed
        );
    }

    #[test]
    fn entry_written_by_l7_is_dropped() {
        let maps = HostMaps::default();
        let mut entry = TracePidInfo::pending(TRACE_ID, 1);
        entry.written = 1;
        seed(&maps, entry);
        let original = client_frame(100, 200);
        let mut frame = original.clone();

        assert_eq!(inject(&mut frame, &maps), Injection::WrittenByL7);
        assert_eq!(frame, original);
        assert!(maps.outgoing.get(&KEY).is_none());
    }

    #[test]
    fn unknown_port_pair_is_left_alone() {
        let maps = HostMaps::default();
        let original = client_frame(100, 200);
        let mut frame = original.clone();
        assert_eq!(inject(&mut frame, &maps), Injection::NoContext);
        assert_eq!(frame, original);
    }

    #[test]
    fn packet_with_options_is_not_touched() {
        let maps = HostMaps::default();
        seed(&maps, TracePidInfo::pending(TRACE_ID, 1));
        let original = FrameBuf::new(frames::ipv4_tcp_with_options(
            CLIENT,
            40000,
            SERVER,
            80,
            100,
            200,
            &[0x01, 0x01, 0x01, 0x00],
        ));
        let mut frame = original.clone();

        assert_eq!(inject(&mut frame, &maps), Injection::NotInjectable);
        assert_eq!(frame, original);
        let entry = maps.outgoing.get(&KEY).expect("entry");
        assert_eq!(entry.state(), ContextState::SpanAssigned);
    }

    #[test]
    fn first_packet_rewrites_request_span_ids() {
        let maps = HostMaps::default();
        seed(&maps, TracePidInfo::pending(TRACE_ID, 77));
        let conn = read_frame(&client_frame(0, 0)).expect("tcp frame").0.canonical();

        let stale = TraceParent {
            trace_id: TRACE_ID,
            span_id: [9; 8],
        };
        let p_conn = PidConnectionInfo { conn, pid: 77 };
        maps.ongoing
            .insert(&p_conn, &stale, InsertMode::Any)
            .expect("ongoing");
        maps.egress_requests
            .insert(&KEY, &stale, InsertMode::Any)
            .expect("egress request");

        let mut frame = client_frame(100, 200);
        inject(&mut frame, &maps);

        let wire_span = [0, 0, 0, 100, 0, 0, 0, 200];
        assert_eq!(maps.ongoing.get(&p_conn).expect("ongoing").span_id, wire_span);
        assert_eq!(
            maps.egress_requests.get(&KEY).expect("egress request").span_id,
            wire_span
        );
    }

    #[test]
    fn span_notification_never_creates_records() {
        let maps = HostMaps::default();
        seed(&maps, TracePidInfo::pending(TRACE_ID, 77));
        let mut frame = client_frame(100, 200);
        inject(&mut frame, &maps);
        assert!(maps.ongoing.is_empty());
        assert!(maps.egress_requests.is_empty());
    }

    fn v6(last: u8) -> [u8; 16] {
        [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, last]
    }

    #[test]
    fn injects_destination_options_into_ipv6_packet() {
        let maps = HostMaps::default();
        seed(&maps, TracePidInfo::pending(TRACE_ID, 1));
        let original = FrameBuf::new(frames::ipv6_tcp(v6(1), 40000, v6(2), 80, 100, 200));
        let mut frame = original.clone();

        assert_eq!(inject(&mut frame, &maps), Injection::Injected);

        let bytes = frame.as_bytes();
        let at = ETH_HLEN + IPV6_HLEN;
        assert_eq!(bytes[ETH_HLEN + IPV6_NEXT_HDR_OFFSET], IPPROTO_DSTOPTS);
        assert_eq!(u16::from_be_bytes([bytes[ETH_HLEN + 4], bytes[ETH_HLEN + 5]]), 44);
        assert_eq!(&bytes[at..at + 4], &[IPPROTO_TCP, 0x02, 0x09, 0x14]);
        assert_eq!(&bytes[at + 4..at + 20], &TRACE_ID);
        assert_eq!(&bytes[at + 20..at + IPV6_DEST_OPTS_LEN], &[0u8; 4]);
        assert_eq!(&bytes[at + IPV6_DEST_OPTS_LEN..], &original.as_bytes()[at..]);

        let (_, proto) = read_frame(&frame).expect("tcp frame");
        assert_eq!(proto.ip_len, at + IPV6_DEST_OPTS_LEN);
    }

    #[test]
    fn ipv6_with_extension_is_never_injected() {
        let maps = HostMaps::default();
        seed(&maps, TracePidInfo::pending(TRACE_ID, 1));
        let mut bytes = frames::ipv6_tcp(v6(1), 40000, v6(2), 80, 100, 200);
        let at = ETH_HLEN + IPV6_HLEN;
        bytes.splice(at..at, encode_ipv6_dest_opts(IPPROTO_TCP, &[0xee; 16]));
        bytes[ETH_HLEN + IPV6_NEXT_HDR_OFFSET] = IPPROTO_DSTOPTS;
        let original = FrameBuf::new(bytes);

        for state in [ContextState::Pending, ContextState::SpanAssigned] {
            let mut entry = TracePidInfo::pending(TRACE_ID, 1);
            entry.valid = state as u8;
            seed(&maps, entry);

            let mut frame = original.clone();
            assert_eq!(inject(&mut frame, &maps), Injection::NotInjectable);
            assert_eq!(frame, original);
        }
    }
}
