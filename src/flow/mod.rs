//! Credit-based flow control.
//!
//! One flow-control state exists per physical data transport: [`RxFlowState`]
//! paces the consume path and reports credit upstream, [`TxFlowState`] gates
//! the send path on credit returned by the downstream block. Both use
//! wrapping 32-bit byte/packet counters compared with wrapping arithmetic,
//! so the protocol survives counter wraparound.
//!
//! The flow-control payload is two wire words, `[packet_count, byte_count]`,
//! endian-converted per the negotiated transport byte order.

pub mod rx;
pub mod tx;
pub mod window;

pub use rx::RxFlowState;
pub use tx::TxFlowState;

use std::time::Duration;

use crate::addr::StreamAddress;
use crate::chdr::{PacketHeader, PacketType, WireFormat, WORD_SIZE};
use crate::error::{Error, Result};
use crate::link::DataLink;

/// Words in a flow-control payload: packet count, byte count.
pub const FC_PAYLOAD_WORDS: usize = 2;

/// Build and commit a flow-control (or flow-control-ack) packet.
///
/// Uses a zero-timeout send acquire: flow-control emission must never block
/// the data path. Failure to get a buffer means the return-path transport is
/// broken and is fatal for the stream.
///
/// Returns the committed packet size in bytes.
pub(crate) fn emit_fc_packet(
    link: &dyn DataLink,
    wire: &'static dyn WireFormat,
    packet_type: PacketType,
    sequence_number: u32,
    addr: StreamAddress,
    packet_count: u32,
    byte_count: u32,
) -> Result<u32> {
    let Some(mut buffer) = link.acquire_send(Duration::ZERO) else {
        return Err(Error::FlowControlTimeout(format!(
            "no send buffer for {packet_type:?} packet to {addr}"
        )));
    };

    let mut header = PacketHeader::new(packet_type);
    header.stream_id = Some(addr.stream_id());
    header.sequence_number = sequence_number;
    header.num_payload_words = FC_PAYLOAD_WORDS as u16;

    let words = buffer.words_mut();
    let n = wire.pack(words, &header)?;
    words[n] = wire.from_host(packet_count);
    words[n + 1] = wire.from_host(byte_count);

    let total_words = n + FC_PAYLOAD_WORDS;
    buffer.commit(total_words);
    Ok((total_words * WORD_SIZE) as u32)
}

/// Decode a flow-control payload into `(packet_count, byte_count)`.
pub(crate) fn decode_fc_payload(
    wire: &'static dyn WireFormat,
    payload: &[u32],
) -> Result<(u32, u32)> {
    if payload.len() < FC_PAYLOAD_WORDS {
        return Err(Error::Protocol(format!(
            "flow control payload too short: {} words",
            payload.len()
        )));
    }
    Ok((wire.to_host(payload[0]), wire.to_host(payload[1])))
}
