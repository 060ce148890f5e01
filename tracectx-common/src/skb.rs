//! Byte-level access to a frame, as provided by the tc hook.
//!
//! All multi-byte accessors are big-endian; nothing in this crate overlays
//! structures on packet memory.

use thiserror::Error;

pub const ETH_HLEN: usize = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SkbError {
    #[error("access of {len} bytes at offset {offset} is out of bounds")]
    OutOfBounds { offset: usize, len: usize },
    #[error("no room could be made in the frame")]
    NoRoom,
    #[error("helper failed with code {0}")]
    Helper(i64),
}

/// A mutable frame starting at the Ethernet header.
pub trait SkBuff {
    /// Length of the frame in bytes.
    fn len(&self) -> usize;

    fn load_bytes(&self, offset: usize, dst: &mut [u8]) -> Result<(), SkbError>;

    fn store_bytes(&mut self, offset: usize, src: &[u8]) -> Result<(), SkbError>;

    /// Inserts `len` zeroed bytes right after the fixed network header
    /// (20 bytes for IPv4, 40 for IPv6), shifting everything behind it.
    fn grow_net(&mut self, len: u32) -> Result<(), SkbError>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn load_u8(&self, offset: usize) -> Result<u8, SkbError> {
        let mut buf = [0u8; 1];
        self.load_bytes(offset, &mut buf)?;
        Ok(buf[0])
    }

    fn load_u16(&self, offset: usize) -> Result<u16, SkbError> {
        let mut buf = [0u8; 2];
        self.load_bytes(offset, &mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    fn load_u32(&self, offset: usize) -> Result<u32, SkbError> {
        let mut buf = [0u8; 4];
        self.load_bytes(offset, &mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    fn store_u8(&mut self, offset: usize, value: u8) -> Result<(), SkbError> {
        self.store_bytes(offset, &[value])
    }

    fn store_u16(&mut self, offset: usize, value: u16) -> Result<(), SkbError> {
        self.store_bytes(offset, &value.to_be_bytes())
    }
}
