// Host-side backends for the pipeline: an owned frame buffer, sharded tables
// standing in for the BPF hash maps, and a static socket table. The agent uses
// them to decode captured frames offline; tests use them to drive the whole
// dispatcher without a kernel.

use std::{
    collections::{HashMap, hash_map::DefaultHasher},
    hash::{Hash, Hasher},
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
};

use crate::{
    ConnectionInfo, EgressKey, PidConnectionInfo, SockHandle, TraceParent, TracePidInfo,
    conn::{ETH_P_IP, ETH_P_IPV6},
    maps::{ContextMap, InsertMode, MapError, SockTuple, SocketLookup, TraceMaps},
    skb::{ETH_HLEN, SkBuff, SkbError},
    wire::{IPV4_MIN_HLEN, IPV6_HLEN},
};

pub const MAP_SHARDS: usize = 16;
const E2BIG: i64 = -7;

/// Owned Ethernet frame with the growth semantics of `bpf_skb_adjust_room`
/// in `BPF_ADJ_ROOM_NET` mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBuf {
    data: Vec<u8>,
    growable: bool,
}

impl FrameBuf {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            growable: true,
        }
    }

    /// A frame whose headroom is exhausted; every grow request fails.
    pub fn refusing_growth(data: Vec<u8>) -> Self {
        Self {
            data,
            growable: false,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), SkbError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.data.len() => Ok(()),
            _ => Err(SkbError::OutOfBounds { offset, len }),
        }
    }
}

impl SkBuff for FrameBuf {
    fn len(&self) -> usize {
        self.data.len()
    }

    fn load_bytes(&self, offset: usize, dst: &mut [u8]) -> Result<(), SkbError> {
        self.check(offset, dst.len())?;
        dst.copy_from_slice(&self.data[offset..offset + dst.len()]);
        Ok(())
    }

    fn store_bytes(&mut self, offset: usize, src: &[u8]) -> Result<(), SkbError> {
        self.check(offset, src.len())?;
        self.data[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn grow_net(&mut self, len: u32) -> Result<(), SkbError> {
        if !self.growable {
            return Err(SkbError::NoRoom);
        }
        let base = match self.load_u16(12)? {
            ETH_P_IP => IPV4_MIN_HLEN,
            ETH_P_IPV6 => IPV6_HLEN,
            _ => return Err(SkbError::NoRoom),
        };
        let at = ETH_HLEN + base;
        self.check(at, 0)?;
        self.data
            .splice(at..at, std::iter::repeat_n(0u8, len as usize));
        Ok(())
    }
}

/// Concurrent table split into independently locked shards. Per-key
/// operations hold one shard lock for their whole duration.
pub struct ShardedMap<K, V> {
    shards: Vec<Mutex<HashMap<K, V>>>,
    max_entries: usize,
    len: AtomicUsize,
}

impl<K: Hash + Eq + Copy, V: Copy> ShardedMap<K, V> {
    pub fn with_max_entries(max_entries: usize) -> Self {
        let mut shards = Vec::with_capacity(MAP_SHARDS);
        for _ in 0..MAP_SHARDS {
            shards.push(Mutex::new(HashMap::new()));
        }
        Self {
            shards,
            max_entries,
            len: AtomicUsize::new(0),
        }
    }

    fn shard(&self, key: &K) -> MutexGuard<'_, HashMap<K, V>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len().max(1);
        self.shards[idx]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<(K, V)> {
        let mut out = Vec::with_capacity(self.len());
        for shard in &self.shards {
            let guard = shard.lock().unwrap_or_else(PoisonError::into_inner);
            out.extend(guard.iter().map(|(k, v)| (*k, *v)));
        }
        out
    }
}

impl<K: Hash + Eq + Copy, V: Copy> ContextMap<K, V> for ShardedMap<K, V> {
    fn get(&self, key: &K) -> Option<V> {
        self.shard(key).get(key).copied()
    }

    fn insert(&self, key: &K, value: &V, mode: InsertMode) -> Result<(), MapError> {
        let mut guard = self.shard(key);
        if let Some(existing) = guard.get_mut(key) {
            return match mode {
                InsertMode::NoExist => Err(MapError::KeyExists),
                InsertMode::Any => {
                    *existing = *value;
                    Ok(())
                }
            };
        }
        // Reserve a slot before inserting so concurrent inserts on other
        // shards can't push the table past its limit.
        let reserved = self
            .len
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_entries).then_some(n + 1)
            });
        if reserved.is_err() {
            return Err(MapError::Backend(E2BIG));
        }
        guard.insert(*key, *value);
        Ok(())
    }

    fn remove(&self, key: &K) -> Result<(), MapError> {
        match self.shard(key).remove(key) {
            Some(_) => {
                self.len.fetch_sub(1, Ordering::AcqRel);
                Ok(())
            }
            None => Err(MapError::NotFound),
        }
    }

    fn update<F: FnOnce(&mut V)>(&self, key: &K, f: F) -> Option<V> {
        let mut guard = self.shard(key);
        let entry = guard.get_mut(key)?;
        f(entry);
        Some(*entry)
    }
}

/// All correlation maps, backed by [`ShardedMap`].
pub struct HostMaps {
    pub outgoing: ShardedMap<EgressKey, TracePidInfo>,
    pub incoming: ShardedMap<ConnectionInfo, TracePidInfo>,
    pub sockets: ShardedMap<ConnectionInfo, SockHandle>,
    pub ongoing: ShardedMap<PidConnectionInfo, TraceParent>,
    pub egress_requests: ShardedMap<EgressKey, TraceParent>,
}

impl HostMaps {
    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            outgoing: ShardedMap::with_max_entries(max_entries),
            incoming: ShardedMap::with_max_entries(max_entries),
            sockets: ShardedMap::with_max_entries(max_entries),
            ongoing: ShardedMap::with_max_entries(max_entries),
            egress_requests: ShardedMap::with_max_entries(max_entries),
        }
    }
}

impl Default for HostMaps {
    fn default() -> Self {
        Self::with_max_entries(crate::OUTGOING_TRACE_MAP_ENTRIES as usize)
    }
}

impl TraceMaps for HostMaps {
    type Outgoing = ShardedMap<EgressKey, TracePidInfo>;
    type Incoming = ShardedMap<ConnectionInfo, TracePidInfo>;
    type Sockets = ShardedMap<ConnectionInfo, SockHandle>;
    type Ongoing = ShardedMap<PidConnectionInfo, TraceParent>;
    type EgressRequests = ShardedMap<EgressKey, TraceParent>;

    fn outgoing(&self) -> &Self::Outgoing {
        &self.outgoing
    }

    fn incoming(&self) -> &Self::Incoming {
        &self.incoming
    }

    fn sockets(&self) -> &Self::Sockets {
        &self.sockets
    }

    fn ongoing(&self) -> &Self::Ongoing {
        &self.ongoing
    }

    fn egress_requests(&self) -> &Self::EgressRequests {
        &self.egress_requests
    }
}

/// Fixed socket table; counts lookups so callers can tell cache hits apart.
#[derive(Default)]
pub struct StaticSockets {
    table: HashMap<SockTuple, SockHandle>,
    lookups: AtomicUsize,
}

impl StaticSockets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_socket(mut self, tuple: SockTuple, handle: SockHandle) -> Self {
        self.table.insert(tuple, handle);
        self
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::Relaxed)
    }
}

impl SocketLookup for StaticSockets {
    fn lookup_tcp(&self, tuple: &SockTuple) -> Option<SockHandle> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        self.table.get(tuple).copied()
    }
}

/// Builders for well-formed test frames.
pub mod frames {
    use crate::csum::ipv4_header_checksum;
    use crate::skb::ETH_HLEN;

    const SRC_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
    const DST_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x02];

    fn ethernet(ethertype: u16) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        out.extend_from_slice(&DST_MAC);
        out.extend_from_slice(&SRC_MAC);
        out.extend_from_slice(&ethertype.to_be_bytes());
        out
    }

    fn tcp(sport: u16, dport: u16, seq: u32, ack: u32) -> [u8; 20] {
        let mut out = [0u8; 20];
        out[0..2].copy_from_slice(&sport.to_be_bytes());
        out[2..4].copy_from_slice(&dport.to_be_bytes());
        out[4..8].copy_from_slice(&seq.to_be_bytes());
        out[8..12].copy_from_slice(&ack.to_be_bytes());
        out[12] = 0x50;
        out[13] = 0x18; // PSH|ACK
        out[14..16].copy_from_slice(&64240u16.to_be_bytes());
        out
    }

    /// IPv4/TCP frame without payload; `options` is padded with zeros to a
    /// multiple of four bytes.
    pub fn ipv4_tcp_with_options(
        src: [u8; 4],
        sport: u16,
        dst: [u8; 4],
        dport: u16,
        seq: u32,
        ack: u32,
        options: &[u8],
    ) -> Vec<u8> {
        let opt_len = options.len().div_ceil(4) * 4;
        let ihl = 20 + opt_len;
        let tot_len = (ihl + 20) as u16;

        let mut ip = vec![0u8; ihl];
        ip[0] = 0x40 | (ihl / 4) as u8;
        ip[2..4].copy_from_slice(&tot_len.to_be_bytes());
        ip[4..6].copy_from_slice(&0x1c46u16.to_be_bytes());
        ip[6] = 0x40;
        ip[8] = 64;
        ip[9] = 6;
        ip[12..16].copy_from_slice(&src);
        ip[16..20].copy_from_slice(&dst);
        ip[20..20 + options.len()].copy_from_slice(options);
        let check = ipv4_header_checksum(&ip);
        ip[10..12].copy_from_slice(&check.to_be_bytes());

        let mut out = ethernet(0x0800);
        out.extend_from_slice(&ip);
        out.extend_from_slice(&tcp(sport, dport, seq, ack));
        debug_assert_eq!(out.len(), ETH_HLEN + ihl + 20);
        out
    }

    pub fn ipv4_tcp(
        src: [u8; 4],
        sport: u16,
        dst: [u8; 4],
        dport: u16,
        seq: u32,
        ack: u32,
    ) -> Vec<u8> {
        ipv4_tcp_with_options(src, sport, dst, dport, seq, ack, &[])
    }

    pub fn ipv6_tcp(
        src: [u8; 16],
        sport: u16,
        dst: [u8; 16],
        dport: u16,
        seq: u32,
        ack: u32,
    ) -> Vec<u8> {
        let mut ip = [0u8; 40];
        ip[0] = 0x60;
        ip[4..6].copy_from_slice(&20u16.to_be_bytes());
        ip[6] = 6;
        ip[7] = 64;
        ip[8..24].copy_from_slice(&src);
        ip[24..40].copy_from_slice(&dst);

        let mut out = ethernet(0x86DD);
        out.extend_from_slice(&ip);
        out.extend_from_slice(&tcp(sport, dport, seq, ack));
        out
    }
}
