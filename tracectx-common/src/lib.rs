#![cfg_attr(not(any(test, feature = "user")), no_std)]

// Types and packet logic shared between the tc classifiers and userspace.
// Everything outside `host` must stay `no_std`; the eBPF program links it.
// The `host` backends (feature `user`) drive the same pipeline from tests and
// from the agent's `decode` command.

pub mod conn;
pub mod csum;
pub mod dispatch;
pub mod inject;
pub mod maps;
pub mod parse;
pub mod skb;
pub mod sock;
pub mod wire;

#[cfg(any(test, feature = "user"))]
pub mod host;

pub use dispatch::{Dispatcher, Outcome};
pub use inject::Injection;
pub use maps::{ContextMap, InsertMode, MapError, SocketLookup, TraceMaps};
pub use skb::{SkBuff, SkbError};

/// Neutral tc verdict: let the rest of the qdisc decide what happens to the packet.
pub const TC_ACT_UNSPEC: i32 = -1;

pub const OUTGOING_TRACE_MAP: &str = "outgoing_trace_map";
pub const INCOMING_TRACE_MAP: &str = "incoming_trace_map";
pub const SOCK_DIR_MAP: &str = "sock_dir";
pub const ONGOING_REQUESTS_MAP: &str = "ongoing_requests";
pub const EGRESS_REQUESTS_MAP: &str = "egress_requests";

pub const OUTGOING_TRACE_MAP_ENTRIES: u32 = 10_000;
pub const INCOMING_TRACE_MAP_ENTRIES: u32 = 10_000;
pub const SOCK_DIR_ENTRIES: u32 = 10_000;
pub const ONGOING_REQUESTS_ENTRIES: u32 = 10_000;

/// Lowest port the kernel hands out for outbound connections by default.
pub const EPHEMERAL_PORT_MIN: u16 = 32768;

/// Canonical 4-tuple of a TCP flow. IPv4 addresses are stored IPv4-mapped.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct ConnectionInfo {
    pub s_addr: [u8; 16],
    pub d_addr: [u8; 16],
    pub s_port: u16,
    pub d_port: u16,
}

impl ConnectionInfo {
    pub fn swap(&mut self) {
        core::mem::swap(&mut self.s_addr, &mut self.d_addr);
        core::mem::swap(&mut self.s_port, &mut self.d_port);
    }

    /// Orders the endpoints so that both directions of a flow produce the same key.
    ///
    /// The likely client (ephemeral port) ends up in the source slot. When that
    /// heuristic can't decide, the higher port wins the source slot, and equal
    /// ports fall back to comparing the address bytes.
    pub fn canonicalize(&mut self) {
        let s_eph = is_ephemeral_port(self.s_port);
        let d_eph = is_ephemeral_port(self.d_port);

        if s_eph && !d_eph {
            return;
        }
        if d_eph && !s_eph {
            self.swap();
            return;
        }
        if self.s_port < self.d_port
            || (self.s_port == self.d_port && self.s_addr < self.d_addr)
        {
            self.swap();
        }
    }

    pub fn canonical(mut self) -> Self {
        self.canonicalize();
        self
    }

    pub fn egress_key(&self) -> EgressKey {
        EgressKey {
            s_port: self.s_port,
            d_port: self.d_port,
        }
    }
}

pub fn is_ephemeral_port(port: u16) -> bool {
    port >= EPHEMERAL_PORT_MIN
}

/// Returns the IPv4-mapped IPv6 form (`::ffff:a.b.c.d`) of an IPv4 address.
pub fn ipv4_mapped(addr: [u8; 4]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[10] = 0xff;
    out[11] = 0xff;
    out[12..].copy_from_slice(&addr);
    out
}

/// Port pair used to correlate outbound flows with the request that started them.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct EgressKey {
    pub s_port: u16,
    pub d_port: u16,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct PidConnectionInfo {
    pub conn: ConnectionInfo,
    pub pid: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct TraceParent {
    pub trace_id: [u8; 16],
    pub span_id: [u8; 8],
}

impl TraceParent {
    /// Derives the span id from the TCP sequence and ack numbers, both big-endian.
    /// Either peer can recompute it from the stream without extra state.
    pub fn span_from_tcp(seq: u32, ack: u32) -> [u8; 8] {
        let mut span = [0u8; 8];
        span[..4].copy_from_slice(&seq.to_be_bytes());
        span[4..].copy_from_slice(&ack.to_be_bytes());
        span
    }

    pub fn set_span_from_tcp(&mut self, seq: u32, ack: u32) {
        self.span_id = Self::span_from_tcp(seq, ack);
    }
}

/// Lifecycle of a context entry. Only ever moves towards `Consumed`.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ContextState {
    Consumed = 0,
    Pending = 1,
    SpanAssigned = 2,
}

impl ContextState {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            1 => ContextState::Pending,
            2 => ContextState::SpanAssigned,
            _ => ContextState::Consumed,
        }
    }

    pub fn is_active(self) -> bool {
        self != ContextState::Consumed
    }
}

/// Trace context entry shared with the higher-level instrumentation.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct TracePidInfo {
    pub tp: TraceParent,
    pub pid: u32,
    /// Raw [`ContextState`].
    pub valid: u8,
    /// Set by the higher layer once it propagated the context on its own.
    pub written: u8,
    pub _pad: [u8; 2],
}

impl TracePidInfo {
    pub fn pending(trace_id: [u8; 16], pid: u32) -> Self {
        Self {
            tp: TraceParent {
                trace_id,
                span_id: [0; 8],
            },
            pid,
            valid: ContextState::Pending as u8,
            written: 0,
            _pad: [0; 2],
        }
    }

    pub fn state(&self) -> ContextState {
        ContextState::from_raw(self.valid)
    }

    /// Moves the entry to `next` unless that would step backwards.
    pub fn advance(&mut self, next: ContextState) -> bool {
        let current = self.state();
        let allowed = match (current, next) {
            (ContextState::Pending, ContextState::SpanAssigned) => true,
            (ContextState::Pending | ContextState::SpanAssigned, ContextState::Consumed) => true,
            _ => false,
        };
        if allowed {
            self.valid = next as u8;
        }
        allowed
    }

    pub fn written_by_l7(&self) -> bool {
        self.written != 0
    }
}

/// Snapshot of the kernel socket that owns a connection.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct SockHandle {
    pub family: u32,
    pub protocol: u32,
    pub state: u32,
    /// Local and remote port, both in host byte order.
    pub src_port: u32,
    pub dst_port: u32,
}

// Compile-time size assertions to catch layout mismatches early.
const _: () = assert!(core::mem::size_of::<ConnectionInfo>() == 36);
const _: () = assert!(core::mem::size_of::<EgressKey>() == 4);
const _: () = assert!(core::mem::size_of::<PidConnectionInfo>() == 40);
const _: () = assert!(core::mem::size_of::<TraceParent>() == 24);
const _: () = assert!(core::mem::size_of::<TracePidInfo>() == 32);
const _: () = assert!(core::mem::size_of::<SockHandle>() == 20);

#[cfg(feature = "user")]
mod user_impls {
    use super::{
        ConnectionInfo, EgressKey, PidConnectionInfo, SockHandle, TraceParent, TracePidInfo,
    };
    use aya::Pod;

    unsafe impl Pod for ConnectionInfo {}
    unsafe impl Pod for EgressKey {}
    unsafe impl Pod for PidConnectionInfo {}
    unsafe impl Pod for TraceParent {}
    unsafe impl Pod for TracePidInfo {}
    unsafe impl Pod for SockHandle {}
}

#[cfg(any(test, feature = "user"))]
mod display {
    use std::fmt;
    use std::net::{IpAddr, Ipv6Addr};

    use super::ConnectionInfo;

    pub fn ip_from_mapped(raw: [u8; 16]) -> IpAddr {
        let v6 = Ipv6Addr::from(raw);
        match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        }
    }

    impl fmt::Display for ConnectionInfo {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(
                f,
                "{}:{} -> {}:{}",
                ip_from_mapped(self.s_addr),
                self.s_port,
                ip_from_mapped(self.d_addr),
                self.d_port
            )
        }
    }
}

#[cfg(any(test, feature = "user"))]
pub use display::ip_from_mapped;
