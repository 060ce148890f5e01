//! Per-packet pipeline shared by the ingress and egress classifiers.

use crate::conn::read_frame;
use crate::inject::{Injection, inject_ip_options};
use crate::maps::{SocketLookup, TraceMaps};
use crate::parse::parse_ip_options;
use crate::skb::SkBuff;
use crate::sock::{SockTrack, track_sock};

/// What the pipeline did with one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Not a TCP frame we can read.
    Skipped,
    /// The packet carries a trace context. It is recorded unless the
    /// connection already has one.
    Recorded,
    Injection(Injection),
}

pub struct Dispatcher<'a, M, L> {
    maps: &'a M,
    sockets: &'a L,
}

impl<'a, M: TraceMaps, L: SocketLookup> Dispatcher<'a, M, L> {
    pub const fn new(maps: &'a M, sockets: &'a L) -> Self {
        Self { maps, sockets }
    }

    /// Runs extract, socket tracking, parse and inject on `skb`. The caller
    /// always answers the hook with [`crate::TC_ACT_UNSPEC`].
    pub fn process<P: SkBuff>(&self, skb: &mut P) -> Outcome {
        self.process_tracked(skb).0
    }

    /// Same as [`Dispatcher::process`], also reporting the socket tracker result.
    pub fn process_tracked<P: SkBuff>(&self, skb: &mut P) -> (Outcome, Option<SockTrack>) {
        let Some((conn, proto)) = read_frame(skb) else {
            return (Outcome::Skipped, None);
        };

        let tracked = track_sock(skb, &conn, &proto, self.maps, self.sockets);

        let conn = conn.canonical();
        if parse_ip_options(skb, &conn, &proto, self.maps) {
            return (Outcome::Recorded, Some(tracked));
        }

        let injection = inject_ip_options(skb, &conn, &proto, self.maps);
        (Outcome::Injection(injection), Some(tracked))
    }
}
