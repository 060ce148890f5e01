//! Shared key/value stores used to correlate independently triggered events.
//!
//! In the kernel these are BPF hash maps; on the host they are sharded tables.
//! Implementations must make `insert` with [`InsertMode::NoExist`] and `update`
//! atomic per key. Nothing here needs cross-key transactions.

use thiserror::Error;

use crate::{
    ConnectionInfo, EgressKey, PidConnectionInfo, SockHandle, TraceParent, TracePidInfo,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertMode {
    /// Create or overwrite (`BPF_ANY`).
    Any,
    /// Create only; fail with [`MapError::KeyExists`] otherwise (`BPF_NOEXIST`).
    NoExist,
}

impl InsertMode {
    pub fn bpf_flags(self) -> u64 {
        match self {
            InsertMode::Any => 0,
            InsertMode::NoExist => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MapError {
    #[error("key already present")]
    KeyExists,
    #[error("key not found")]
    NotFound,
    #[error("map operation failed with code {0}")]
    Backend(i64),
}

pub trait ContextMap<K, V: Copy> {
    fn get(&self, key: &K) -> Option<V>;

    fn insert(&self, key: &K, value: &V, mode: InsertMode) -> Result<(), MapError>;

    fn remove(&self, key: &K) -> Result<(), MapError>;

    /// Applies `f` to the entry for `key` as one read-modify-write step and
    /// returns the stored result, or `None` when the key is absent.
    fn update<F: FnOnce(&mut V)>(&self, key: &K, f: F) -> Option<V>;

    fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }
}

/// The set of maps the dispatcher works against.
pub trait TraceMaps {
    type Outgoing: ContextMap<EgressKey, TracePidInfo>;
    type Incoming: ContextMap<ConnectionInfo, TracePidInfo>;
    type Sockets: ContextMap<ConnectionInfo, SockHandle>;
    type Ongoing: ContextMap<PidConnectionInfo, TraceParent>;
    type EgressRequests: ContextMap<EgressKey, TraceParent>;

    /// Contexts created by the request instrumentation, waiting to go out.
    fn outgoing(&self) -> &Self::Outgoing;
    /// Contexts found on the wire, for the request instrumentation to pick up.
    fn incoming(&self) -> &Self::Incoming;
    fn sockets(&self) -> &Self::Sockets;
    /// Request records keyed by connection and pid, owned by the request instrumentation.
    fn ongoing(&self) -> &Self::Ongoing;
    /// Request records keyed by port pair, owned by the request instrumentation.
    fn egress_requests(&self) -> &Self::EgressRequests;
}

/// Lookup tuple for the host socket table, addresses and ports as on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SockTuple {
    V4 {
        saddr: [u8; 4],
        daddr: [u8; 4],
        sport: u16,
        dport: u16,
    },
    V6 {
        saddr: [u8; 16],
        daddr: [u8; 16],
        sport: u16,
        dport: u16,
    },
}

pub trait SocketLookup {
    fn lookup_tcp(&self, tuple: &SockTuple) -> Option<SockHandle>;
}
