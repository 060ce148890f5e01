//! Records which kernel socket owns a connection, once per connection.

use crate::conn::{ETH_P_IP, ProtocolInfo};
use crate::maps::{ContextMap, InsertMode, MapError, SockTuple, SocketLookup, TraceMaps};
use crate::skb::{ETH_HLEN, SkBuff};
use crate::ConnectionInfo;

const IPV4_ADDRS_OFFSET: usize = 12;
const IPV6_ADDRS_OFFSET: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockTrack {
    AlreadyTracked,
    Recorded,
    /// Another invocation recorded the same connection first.
    LostRace,
    NotFound,
    Unreadable,
}

/// Resolves and records the socket behind `conn` unless the directory already
/// has it. `conn` is the tuple as read from the wire; the directory is keyed by
/// its canonical form.
pub fn track_sock<P, M, L>(
    skb: &P,
    conn: &ConnectionInfo,
    proto: &ProtocolInfo,
    maps: &M,
    sockets: &L,
) -> SockTrack
where
    P: SkBuff,
    M: TraceMaps,
    L: SocketLookup,
{
    let key = conn.canonical();
    if maps.sockets().contains(&key) {
        return SockTrack::AlreadyTracked;
    }

    let Some(tuple) = sock_tuple(skb, conn, proto) else {
        return SockTrack::Unreadable;
    };
    let Some(handle) = sockets.lookup_tcp(&tuple) else {
        return SockTrack::NotFound;
    };

    match maps.sockets().insert(&key, &handle, InsertMode::NoExist) {
        Ok(()) => SockTrack::Recorded,
        Err(MapError::KeyExists) => SockTrack::LostRace,
        Err(_) => SockTrack::NotFound,
    }
}

/// Builds the lookup tuple straight from the IP header, so IPv4 flows get a
/// v4 tuple rather than the mapped form stored in `ConnectionInfo`.
fn sock_tuple<P: SkBuff>(skb: &P, conn: &ConnectionInfo, proto: &ProtocolInfo) -> Option<SockTuple> {
    if proto.h_proto == ETH_P_IP {
        let mut addrs = [0u8; 8];
        skb.load_bytes(ETH_HLEN + IPV4_ADDRS_OFFSET, &mut addrs).ok()?;
        let mut saddr = [0u8; 4];
        let mut daddr = [0u8; 4];
        saddr.copy_from_slice(&addrs[..4]);
        daddr.copy_from_slice(&addrs[4..]);
        Some(SockTuple::V4 {
            saddr,
            daddr,
            sport: conn.s_port,
            dport: conn.d_port,
        })
    } else {
        let mut addrs = [0u8; 32];
        skb.load_bytes(ETH_HLEN + IPV6_ADDRS_OFFSET, &mut addrs).ok()?;
        let mut saddr = [0u8; 16];
        let mut daddr = [0u8; 16];
        saddr.copy_from_slice(&addrs[..16]);
        daddr.copy_from_slice(&addrs[16..]);
        Some(SockTuple::V6 {
            saddr,
            daddr,
            sport: conn.s_port,
            dport: conn.d_port,
        })
    }
}
