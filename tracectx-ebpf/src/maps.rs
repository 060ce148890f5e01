// Correlation maps shared with the request instrumentation and the agent.
//
// Keys and values are the `repr(C)` types from tracectx-common; the agent pins
// every map under the same name so collaborators can open them.

use aya_ebpf::macros::map;
use aya_ebpf::maps::HashMap;
use tracectx_common::{
    ConnectionInfo, ContextMap, EgressKey, INCOMING_TRACE_MAP_ENTRIES, InsertMode, MapError,
    ONGOING_REQUESTS_ENTRIES, OUTGOING_TRACE_MAP_ENTRIES, PidConnectionInfo, SOCK_DIR_ENTRIES,
    SockHandle, TraceMaps, TraceParent, TracePidInfo,
};

const EEXIST: i64 = 17;
const ENOENT: i64 = 2;

#[map(name = "outgoing_trace_map")]
static OUTGOING_TRACE_MAP: HashMap<EgressKey, TracePidInfo> =
    HashMap::<EgressKey, TracePidInfo>::with_max_entries(OUTGOING_TRACE_MAP_ENTRIES, 0);

#[map(name = "incoming_trace_map")]
static INCOMING_TRACE_MAP: HashMap<ConnectionInfo, TracePidInfo> =
    HashMap::<ConnectionInfo, TracePidInfo>::with_max_entries(INCOMING_TRACE_MAP_ENTRIES, 0);

#[map(name = "sock_dir")]
static SOCK_DIR: HashMap<ConnectionInfo, SockHandle> =
    HashMap::<ConnectionInfo, SockHandle>::with_max_entries(SOCK_DIR_ENTRIES, 0);

#[map(name = "ongoing_requests")]
static ONGOING_REQUESTS: HashMap<PidConnectionInfo, TraceParent> =
    HashMap::<PidConnectionInfo, TraceParent>::with_max_entries(ONGOING_REQUESTS_ENTRIES, 0);

#[map(name = "egress_requests")]
static EGRESS_REQUESTS: HashMap<EgressKey, TraceParent> =
    HashMap::<EgressKey, TraceParent>::with_max_entries(ONGOING_REQUESTS_ENTRIES, 0);

/// A BPF hash map seen through [`ContextMap`].
pub struct BpfMap<K: 'static, V: 'static>(&'static HashMap<K, V>);

impl<K, V: Copy> ContextMap<K, V> for BpfMap<K, V> {
    fn get(&self, key: &K) -> Option<V> {
        let ptr = self.0.get_ptr(key)?;
        Some(unsafe { *ptr })
    }

    fn insert(&self, key: &K, value: &V, mode: InsertMode) -> Result<(), MapError> {
        self.0
            .insert(key, value, mode.bpf_flags())
            .map_err(|code| map_error(code as i64))
    }

    fn remove(&self, key: &K) -> Result<(), MapError> {
        self.0.remove(key).map_err(|code| map_error(code as i64))
    }

    // The update happens in place on the map value; a concurrent writer on
    // another CPU may interleave, which the monotonic state tolerates.
    fn update<F: FnOnce(&mut V)>(&self, key: &K, f: F) -> Option<V> {
        let ptr = self.0.get_ptr_mut(key)?;
        unsafe {
            f(&mut *ptr);
            Some(*ptr)
        }
    }
}

fn map_error(code: i64) -> MapError {
    match -code {
        EEXIST => MapError::KeyExists,
        ENOENT => MapError::NotFound,
        _ => MapError::Backend(code),
    }
}

static OUTGOING: BpfMap<EgressKey, TracePidInfo> = BpfMap(&OUTGOING_TRACE_MAP);
static INCOMING: BpfMap<ConnectionInfo, TracePidInfo> = BpfMap(&INCOMING_TRACE_MAP);
static SOCKETS: BpfMap<ConnectionInfo, SockHandle> = BpfMap(&SOCK_DIR);
static ONGOING: BpfMap<PidConnectionInfo, TraceParent> = BpfMap(&ONGOING_REQUESTS);
static EGRESS: BpfMap<EgressKey, TraceParent> = BpfMap(&EGRESS_REQUESTS);

/// The program's map set.
pub struct KernelMaps;

impl TraceMaps for KernelMaps {
    type Outgoing = BpfMap<EgressKey, TracePidInfo>;
    type Incoming = BpfMap<ConnectionInfo, TracePidInfo>;
    type Sockets = BpfMap<ConnectionInfo, SockHandle>;
    type Ongoing = BpfMap<PidConnectionInfo, TraceParent>;
    type EgressRequests = BpfMap<EgressKey, TraceParent>;

    fn outgoing(&self) -> &Self::Outgoing {
        &OUTGOING
    }

    fn incoming(&self) -> &Self::Incoming {
        &INCOMING
    }

    fn sockets(&self) -> &Self::Sockets {
        &SOCKETS
    }

    fn ongoing(&self) -> &Self::Ongoing {
        &ONGOING
    }

    fn egress_requests(&self) -> &Self::EgressRequests {
        &EGRESS
    }
}
