//! Layout of the trace-context carrier on the wire.
//!
//! IPv4 (inserted right after the fixed 20-byte header):
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  type = 0x88  |  len = 0x14   |          trace_id ...         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! /                    trace_id (16 bytes total)                  /
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |      ... trace_id         |           padding (0)             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! IPv6 (destination options, inserted right after the fixed 40-byte header):
//!
//! ```text
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  next header  | hdr_ext_len=2 |  type = 0x09  |  len = 0x14   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! /                     trace_id (16 bytes)                       /
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                          padding (0)                          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

pub const IPV4_MIN_HLEN: usize = 20;
pub const IPV6_HLEN: usize = 40;

/// Size of the IPv4 option block: 2-byte header, 16-byte trace id, 2 bytes padding.
pub const IP_OPTION_LEN: usize = 20;
/// Option type `0x88` and option length `0x14` read as one big-endian word.
pub const IP_OPTION_HEADER: u16 = 0x8814;

/// Size of the injected destination-options header, a multiple of 8.
pub const IPV6_DEST_OPTS_LEN: usize = 24;
pub const IPV6_OPTION_TYPE: u8 = 0x09;
pub const IPV6_OPTION_LEN: u8 = 0x14;

pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_DSTOPTS: u8 = 60;

pub const IPOPT_END: u8 = 0x00;
pub const IPOPT_NOOP: u8 = 0x01;

/// Upper bound on IPv4 options inspected per packet.
pub const MAX_IP_OPTION_SCAN: usize = 10;

pub type TraceId = [u8; 16];

pub fn encode_ipv4_option(trace_id: &TraceId) -> [u8; IP_OPTION_LEN] {
    let mut out = [0u8; IP_OPTION_LEN];
    out[..2].copy_from_slice(&IP_OPTION_HEADER.to_be_bytes());
    out[2..18].copy_from_slice(trace_id);
    out
}

pub fn decode_ipv4_option(block: &[u8; IP_OPTION_LEN]) -> Option<TraceId> {
    if u16::from_be_bytes([block[0], block[1]]) != IP_OPTION_HEADER {
        return None;
    }
    let mut trace_id = [0u8; 16];
    trace_id.copy_from_slice(&block[2..18]);
    Some(trace_id)
}

/// `hdr_ext_len` counts 8-byte units beyond the first 8.
pub const fn ipv6_hdr_ext_len(total: usize) -> u8 {
    ((total - 8) / 8) as u8
}

pub fn encode_ipv6_dest_opts(next_hdr: u8, trace_id: &TraceId) -> [u8; IPV6_DEST_OPTS_LEN] {
    let mut out = [0u8; IPV6_DEST_OPTS_LEN];
    out[0] = next_hdr;
    out[1] = ipv6_hdr_ext_len(IPV6_DEST_OPTS_LEN);
    out[2] = IPV6_OPTION_TYPE;
    out[3] = IPV6_OPTION_LEN;
    out[4..20].copy_from_slice(trace_id);
    out
}

/// Reads the trace id from a destination-options header we injected.
/// Only the fixed layout above is recognized; no option walk is done.
pub fn decode_ipv6_dest_opts(block: &[u8; IPV6_DEST_OPTS_LEN]) -> Option<TraceId> {
    if block[1] != ipv6_hdr_ext_len(IPV6_DEST_OPTS_LEN)
        || block[2] != IPV6_OPTION_TYPE
        || block[3] != IPV6_OPTION_LEN
    {
        return None;
    }
    let mut trace_id = [0u8; 16];
    trace_id.copy_from_slice(&block[4..20]);
    Some(trace_id)
}

/// What the option scanner should do with the two bytes at the current offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionStep {
    Found,
    End,
    Skip(usize),
}

pub fn classify_ipv4_option(header: u16) -> OptionStep {
    if header == IP_OPTION_HEADER {
        return OptionStep::Found;
    }
    let [opt_type, opt_len] = header.to_be_bytes();
    match opt_type {
        IPOPT_END => OptionStep::End,
        IPOPT_NOOP => OptionStep::Skip(1),
        _ if opt_len >= 2 => OptionStep::Skip(opt_len as usize),
        // A bogus length must not stall the scan.
        _ => OptionStep::Skip(1),
    }
}
