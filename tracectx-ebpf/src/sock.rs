use aya_ebpf::bindings::{bpf_sock, bpf_sock_tuple};
use aya_ebpf::cty::c_void;
use aya_ebpf::helpers::{bpf_sk_lookup_tcp, bpf_sk_release};
use tracectx_common::maps::SockTuple;
use tracectx_common::{SockHandle, SocketLookup};

// Search the netns the packet belongs to.
const BPF_F_CURRENT_NETNS: u64 = -1i64 as u64;

// Layouts of the two `bpf_sock_tuple` variants, ports in network byte order.
#[repr(C)]
struct Ipv4Tuple {
    saddr: [u8; 4],
    daddr: [u8; 4],
    sport: u16,
    dport: u16,
}

#[repr(C)]
struct Ipv6Tuple {
    saddr: [u8; 16],
    daddr: [u8; 16],
    sport: u16,
    dport: u16,
}

/// Socket lookup through `bpf_sk_lookup_tcp` on the current skb.
pub struct KernelSockets {
    skb: *mut c_void,
}

impl KernelSockets {
    pub fn new(skb: *mut c_void) -> Self {
        Self { skb }
    }

    #[inline(always)]
    fn lookup<T>(&self, tuple: &mut T) -> Option<SockHandle> {
        let sk = unsafe {
            bpf_sk_lookup_tcp(
                self.skb,
                tuple as *mut T as *mut bpf_sock_tuple,
                core::mem::size_of::<T>() as u32,
                BPF_F_CURRENT_NETNS,
                0,
            )
        };
        if sk.is_null() {
            return None;
        }
        let handle = unsafe { snapshot(&*sk) };
        unsafe { bpf_sk_release(sk as *mut c_void) };
        Some(handle)
    }
}

fn snapshot(sk: &bpf_sock) -> SockHandle {
    SockHandle {
        family: sk.family,
        protocol: sk.protocol,
        state: sk.state,
        src_port: sk.src_port,
        dst_port: u32::from(u16::from_be(sk.dst_port)),
    }
}

impl SocketLookup for KernelSockets {
    fn lookup_tcp(&self, tuple: &SockTuple) -> Option<SockHandle> {
        match *tuple {
            SockTuple::V4 {
                saddr,
                daddr,
                sport,
                dport,
            } => self.lookup(&mut Ipv4Tuple {
                saddr,
                daddr,
                sport: sport.to_be(),
                dport: dport.to_be(),
            }),
            SockTuple::V6 {
                saddr,
                daddr,
                sport,
                dport,
            } => self.lookup(&mut Ipv6Tuple {
                saddr,
                daddr,
                sport: sport.to_be(),
                dport: dport.to_be(),
            }),
        }
    }
}
