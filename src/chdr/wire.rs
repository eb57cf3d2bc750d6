//! Byte-order strategy for the packet codec.
//!
//! Endianness is negotiated once per transport and fixed for its lifetime.
//! Flow-control state holds a resolved `&'static dyn WireFormat`, so the
//! per-packet path pays a vtable call instead of a branch.

use serde::{Deserialize, Serialize};

use super::{pack_host, unpack_host, PacketHeader};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endianness {
    Big,
    Little,
}

/// Pack/unpack plus single-word conversion for one wire byte order.
pub trait WireFormat: Send + Sync {
    fn endianness(&self) -> Endianness;

    /// Convert one wire word to host order.
    fn to_host(&self, v: u32) -> u32;

    /// Convert one host word to wire order.
    fn from_host(&self, v: u32) -> u32;

    /// Write `header` into `words` in wire order; returns the number of
    /// header words written. Never touches the payload.
    fn pack(&self, words: &mut [u32], header: &PacketHeader) -> Result<usize> {
        let n = pack_host(words, header)?;
        for w in words[..n].iter_mut() {
            *w = self.from_host(*w);
        }
        Ok(n)
    }

    /// Decode a header from wire-order `words`.
    fn unpack(&self, words: &[u32]) -> Result<PacketHeader> {
        // Headers are at most three words; convert into a scratch array
        // rather than mutating the caller's buffer.
        let n = words.len().min(super::MAX_HEADER_WORDS);
        let mut host = [0u32; super::MAX_HEADER_WORDS];
        for (h, w) in host[..n].iter_mut().zip(words) {
            *h = self.to_host(*w);
        }
        let header = unpack_host(&host[..n])?;
        if words.len() < header.num_packet_words() {
            return Err(crate::error::Error::Protocol(format!(
                "truncated packet: {} words, header declares {}",
                words.len(),
                header.num_packet_words()
            )));
        }
        Ok(header)
    }
}

struct BigEndianFormat;
struct LittleEndianFormat;

impl WireFormat for BigEndianFormat {
    fn endianness(&self) -> Endianness {
        Endianness::Big
    }
    fn to_host(&self, v: u32) -> u32 {
        u32::from_be(v)
    }
    fn from_host(&self, v: u32) -> u32 {
        v.to_be()
    }
}

impl WireFormat for LittleEndianFormat {
    fn endianness(&self) -> Endianness {
        Endianness::Little
    }
    fn to_host(&self, v: u32) -> u32 {
        u32::from_le(v)
    }
    fn from_host(&self, v: u32) -> u32 {
        v.to_le()
    }
}

static BIG: BigEndianFormat = BigEndianFormat;
static LITTLE: LittleEndianFormat = LittleEndianFormat;

/// Resolve the byte-order strategy for a negotiated endianness.
pub fn wire_format(endianness: Endianness) -> &'static dyn WireFormat {
    match endianness {
        Endianness::Big => &BIG,
        Endianness::Little => &LITTLE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_conversion_is_inverse() {
        for endianness in [Endianness::Big, Endianness::Little] {
            let wire = wire_format(endianness);
            for v in [0u32, 1, 0x01020304, u32::MAX] {
                assert_eq!(wire.to_host(wire.from_host(v)), v);
            }
        }
    }

    #[test]
    fn test_big_endian_layout() {
        let wire = wire_format(Endianness::Big);
        let w = wire.from_host(0x01020304);
        assert_eq!(w.to_ne_bytes(), 0x01020304u32.to_be_bytes());
    }

    #[test]
    fn test_resolved_format_reports_endianness() {
        assert_eq!(wire_format(Endianness::Big).endianness(), Endianness::Big);
        assert_eq!(
            wire_format(Endianness::Little).endianness(),
            Endianness::Little
        );
    }
}
