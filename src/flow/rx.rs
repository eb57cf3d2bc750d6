//! Receive-side flow control: consumption accounting and upstream credit.
//!
//! The upstream producer stops sending once the configured window of
//! unacknowledged bytes is in flight. [`RxFlowState`] counts every consumed
//! packet and, every `interval_bytes` of consumption, sends a flow-control
//! packet back so the producer can advance its window. The device may also
//! probe with a flow-control-ack; the reply to that is handled by the
//! streamer, which feeds the authoritative counts back through
//! [`RxFlowState::on_ack`].

use tracing::{debug, warn};

use super::{decode_fc_payload, emit_fc_packet};
use crate::addr::StreamAddress;
use crate::chdr::{PacketHeader, PacketType, WireFormat};
use crate::error::Result;
use crate::link::DataLink;

pub struct RxFlowState {
    /// Consumed bytes between two upstream credit reports.
    interval_bytes: u32,
    /// Byte count as of the last report. Wrapping.
    last_byte_count: u32,
    total_bytes_consumed: u32,
    total_packets_consumed: u32,
    /// Sequence counter for outgoing flow-control packets.
    seq_num: u32,
    /// Return-path address: the data stream's address reversed.
    fc_addr: StreamAddress,
    wire: &'static dyn WireFormat,
}

impl RxFlowState {
    /// `data_addr` is the downstream data stream's address; credit travels
    /// the other way.
    pub fn new(
        data_addr: StreamAddress,
        interval_bytes: u32,
        wire: &'static dyn WireFormat,
    ) -> Self {
        Self {
            interval_bytes,
            last_byte_count: 0,
            total_bytes_consumed: 0,
            total_packets_consumed: 0,
            seq_num: 0,
            fc_addr: data_addr.reversed(),
            wire,
        }
    }

    /// Account one consumed packet and report credit upstream if due.
    ///
    /// `buffer` is the full received frame, or `None` to re-run only the
    /// report check. Undecodable frames are logged and skipped; they were
    /// consumed off the link either way, but cannot be attributed.
    ///
    /// Returns `Ok(true)` as long as the stream should continue; the error
    /// case is a dead return path.
    pub fn on_receive(&mut self, link: &dyn DataLink, buffer: Option<&[u32]>) -> Result<bool> {
        if let Some(words) = buffer {
            match self.wire.unpack(words) {
                Ok(header) => self.account(&header),
                Err(e) => warn!("unaccountable frame on rx flow path: {e}"),
            }
        }
        self.maybe_send_fc(link)
    }

    /// Like [`on_receive`](Self::on_receive) for a frame the caller already
    /// decoded.
    pub fn on_packet(&mut self, link: &dyn DataLink, header: &PacketHeader) -> Result<bool> {
        self.account(header);
        self.maybe_send_fc(link)
    }

    /// Fold in a flow-control-ack payload from the device.
    ///
    /// The device's view of what we consumed is authoritative; local
    /// counters are overwritten, then the report check re-runs immediately
    /// so a window opened by the correction is reported without waiting for
    /// the next data packet.
    pub fn on_ack(&mut self, link: &dyn DataLink, payload: &[u32]) -> Result<()> {
        let (packet_count, byte_count) = decode_fc_payload(self.wire, payload)?;
        if byte_count != self.total_bytes_consumed {
            debug!(
                local = self.total_bytes_consumed,
                remote = byte_count,
                "rx byte count adjusted from flow control ack"
            );
        }
        self.total_packets_consumed = packet_count;
        self.total_bytes_consumed = byte_count;
        self.maybe_send_fc(link)?;
        Ok(())
    }

    fn account(&mut self, header: &PacketHeader) {
        // Error-flagged packets carry no stream data and are not credited.
        if header.is_error() {
            return;
        }
        self.total_bytes_consumed = self
            .total_bytes_consumed
            .wrapping_add(header.payload_bytes());
        self.total_packets_consumed = self.total_packets_consumed.wrapping_add(1);
    }

    fn maybe_send_fc(&mut self, link: &dyn DataLink) -> Result<bool> {
        if self
            .total_bytes_consumed
            .wrapping_sub(self.last_byte_count)
            < self.interval_bytes
        {
            return Ok(true);
        }
        let seq = self.seq_num;
        self.seq_num = self.seq_num.wrapping_add(1);
        emit_fc_packet(
            link,
            self.wire,
            PacketType::FlowControl,
            seq,
            self.fc_addr,
            self.total_packets_consumed,
            self.total_bytes_consumed,
        )?;
        self.last_byte_count = self.total_bytes_consumed;
        Ok(true)
    }

    pub fn total_bytes_consumed(&self) -> u32 {
        self.total_bytes_consumed
    }

    pub fn total_packets_consumed(&self) -> u32 {
        self.total_packets_consumed
    }
}
