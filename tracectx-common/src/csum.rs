//! Internet checksum arithmetic for the IPv4 header.
//!
//! Values are 16-bit words as they read on the wire (big-endian). Incremental
//! updates follow RFC 1624 eqn. 3: `HC' = ~(~HC + ~m + m')`.

/// Folds a 32-bit one's-complement accumulator down to 16 bits.
///
/// Two folds are enough for every sum produced in this module (at most 30
/// words for a full header), which keeps the loop-free shape the verifier wants.
fn fold(sum: u32) -> u16 {
    let sum = (sum & 0xffff) + (sum >> 16);
    let sum = (sum & 0xffff) + (sum >> 16);
    sum as u16
}

/// Updates `check` for a 16-bit field that changed from `old` to `new`.
pub fn replace16(check: u16, old: u16, new: u16) -> u16 {
    let sum = u32::from(!check) + u32::from(!old) + u32::from(new);
    !fold(sum)
}

/// Updates `check` for a 32-bit field that changed from `old` to `new`.
pub fn replace32(check: u16, old: u32, new: u32) -> u16 {
    let check = replace16(check, (old >> 16) as u16, (new >> 16) as u16);
    replace16(check, old as u16, new as u16)
}

/// Computes the header checksum from scratch; the checksum field itself
/// (bytes 10..12) is treated as zero.
pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for (i, word) in header.chunks(2).enumerate() {
        if i == 5 {
            continue;
        }
        let hi = word[0];
        let lo = word.get(1).copied().unwrap_or(0);
        sum += u32::from(u16::from_be_bytes([hi, lo]));
    }
    !fold(sum)
}
