//! Condensed-header packet codec.
//!
//! Serializes and deserializes the wire header to/from a word-addressed
//! buffer, for both big- and little-endian transports. Pure functions over
//! `u32` word slices; no state. The byte-order strategy is resolved once
//! per transport (see [`wire::wire_format`]) so the per-packet path never
//! branches on endianness.
//!
//! Wire layout (u32 words):
//!
//! ```text
//! word0: [31:30] packet type   [29] has stream id  [28] start of burst
//!        [27] end of burst     [26] error          [25] fc ack
//!        [24:16] reserved (must be zero)
//!        [15:0] payload length in words
//! word1: sequence number
//! word2: stream id (present iff has stream id)
//! ```

pub mod wire;

pub use wire::{wire_format, Endianness, WireFormat};

use crate::error::{Error, Result};

/// Size of one wire word in bytes.
pub const WORD_SIZE: usize = 4;

/// Wire line size in bytes. TX byte accounting is rounded up to this
/// boundary after every packet; the device counts whole lines.
pub const BYTES_PER_LINE: u32 = 8;

/// Header length without the optional stream id word.
pub const MIN_HEADER_WORDS: usize = 2;

/// Header length with the stream id word. Streamers size payload capacity
/// against this to avoid fragmentation when the full header is used.
pub const MAX_HEADER_WORDS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Data = 0,
    FlowControl = 1,
    FlowControlAck = 2,
}

impl PacketType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Data),
            1 => Some(Self::FlowControl),
            2 => Some(Self::FlowControlAck),
            _ => None,
        }
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HeaderFlags: u32 {
        const HAS_STREAM_ID  = 1 << 29;
        const START_OF_BURST = 1 << 28;
        const END_OF_BURST   = 1 << 27;
        const ERROR          = 1 << 26;
        const FC_ACK         = 1 << 25;
    }
}

/// Reserved bits that must read back zero; anything else indicates a
/// foreign protocol version.
const RESERVED_MASK: u32 = 0x01FF_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_type: PacketType,
    pub flags: HeaderFlags,
    /// Destination component of the stream address. Written iff present.
    pub stream_id: Option<u32>,
    /// Monotonic per direction, wraps at 2^32.
    pub sequence_number: u32,
    pub num_payload_words: u16,
}

impl PacketHeader {
    pub fn new(packet_type: PacketType) -> Self {
        Self {
            packet_type,
            flags: HeaderFlags::empty(),
            stream_id: None,
            sequence_number: 0,
            num_payload_words: 0,
        }
    }

    pub fn num_header_words(&self) -> usize {
        if self.stream_id.is_some() {
            MAX_HEADER_WORDS
        } else {
            MIN_HEADER_WORDS
        }
    }

    pub fn num_packet_words(&self) -> usize {
        self.num_header_words() + self.num_payload_words as usize
    }

    pub fn payload_bytes(&self) -> u32 {
        self.num_payload_words as u32 * WORD_SIZE as u32
    }

    pub fn is_error(&self) -> bool {
        self.flags.contains(HeaderFlags::ERROR)
    }

    pub fn end_of_burst(&self) -> bool {
        self.flags.contains(HeaderFlags::END_OF_BURST)
    }
}

/// Encode `header` into `words` in host order. The caller applies byte-order
/// conversion through a [`WireFormat`]; see [`wire`].
fn pack_host(words: &mut [u32], header: &PacketHeader) -> Result<usize> {
    let n = header.num_header_words();
    if words.len() < n {
        return Err(Error::Protocol(format!(
            "pack buffer too small: {} words, header needs {}",
            words.len(),
            n
        )));
    }

    let mut word0 = (header.packet_type as u32) << 30;
    word0 |= (header.flags & !HeaderFlags::HAS_STREAM_ID).bits();
    if header.stream_id.is_some() {
        word0 |= HeaderFlags::HAS_STREAM_ID.bits();
    }
    word0 |= header.num_payload_words as u32;

    words[0] = word0;
    words[1] = header.sequence_number;
    if let Some(sid) = header.stream_id {
        words[2] = sid;
    }
    Ok(n)
}

/// Decode a header from host-order `words`.
fn unpack_host(words: &[u32]) -> Result<PacketHeader> {
    if words.len() < MIN_HEADER_WORDS {
        return Err(Error::Protocol(format!(
            "packet shorter than minimum header: {} words",
            words.len()
        )));
    }
    let word0 = words[0];

    if word0 & RESERVED_MASK != 0 {
        return Err(Error::Protocol(format!(
            "reserved header bits set (0x{:08x}), foreign protocol version?",
            word0
        )));
    }

    let packet_type = PacketType::from_u8((word0 >> 30) as u8)
        .ok_or_else(|| Error::Protocol(format!("unknown packet type in 0x{word0:08x}")))?;
    let flags = HeaderFlags::from_bits_truncate(word0);
    let num_payload_words = (word0 & 0xFFFF) as u16;

    let stream_id = if flags.contains(HeaderFlags::HAS_STREAM_ID) {
        if words.len() < MAX_HEADER_WORDS {
            return Err(Error::Protocol(
                "header declares stream id but packet is too short".into(),
            ));
        }
        Some(words[2])
    } else {
        None
    };

    // Total-length validation happens in `WireFormat::unpack`, which sees
    // the full packet rather than this header-sized view.
    Ok(PacketHeader {
        packet_type,
        flags: flags & !HeaderFlags::HAS_STREAM_ID,
        stream_id,
        sequence_number: words[1],
        num_payload_words,
    })
}
