//! Transmit-side flow control: credit-gated sends.
//!
//! The downstream block advertises a window of buffering; the host may have
//! at most that many unacknowledged bytes in flight. Credit returns as
//! flow-control packets carrying the block's consumed counts. [`reserve`]
//! blocks until the window admits a packet, polling the credit return path
//! in 0.1 s slices so a stalled consumer surfaces as a timeout rather than
//! a hang.
//!
//! All byte accounting is rounded up to [`BYTES_PER_LINE`] after every
//! packet, matching how the device hardware counts lines. Skipping the
//! rounding makes both sides drift until the stream deadlocks.
//!
//! [`reserve`]: TxFlowState::reserve

use std::time::{Duration, Instant};

use tracing::warn;

use super::{decode_fc_payload, emit_fc_packet};
use crate::addr::StreamAddress;
use crate::chdr::{PacketType, WireFormat, BYTES_PER_LINE};
use crate::error::{Error, Result};
use crate::link::DataLink;

/// Credit poll granularity inside [`TxFlowState::reserve`].
pub const FC_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Round a byte count up to the next wire line boundary.
pub fn round_up_to_line(bytes: u32) -> u32 {
    let rem = bytes % BYTES_PER_LINE;
    if rem == 0 {
        bytes
    } else {
        bytes.wrapping_add(BYTES_PER_LINE - rem)
    }
}

pub struct TxFlowState {
    window_bytes: u32,
    /// Bytes sent, line-rounded per packet. Wrapping.
    byte_count: u32,
    packet_count: u32,
    /// Last counts acknowledged by the consumer. Wrapping.
    last_ack_byte_count: u32,
    last_ack_packet_count: u32,
    /// Sequence number of the credit packet behind `last_ack_*`.
    last_ack_seq: u32,
    /// Sequence counter for outgoing flow-control acks.
    ack_seq: u32,
    /// Set when credit arrived since the last ack we sent; an ack is only
    /// due in response to fresh credit.
    fc_received: bool,
    wire: &'static dyn WireFormat,
}

impl TxFlowState {
    pub fn new(window_bytes: u32, wire: &'static dyn WireFormat) -> Self {
        Self {
            window_bytes,
            byte_count: 0,
            packet_count: 0,
            last_ack_byte_count: 0,
            last_ack_packet_count: 0,
            last_ack_seq: 0,
            ack_seq: 0,
            fc_received: false,
            wire,
        }
    }

    /// Unacknowledged bytes currently in flight.
    pub fn in_flight_bytes(&self) -> u32 {
        self.byte_count.wrapping_sub(self.last_ack_byte_count)
    }

    /// Claim credit for one packet of `packet_bytes` if the window admits
    /// it. Pure; never blocks.
    pub fn try_reserve(&mut self, packet_bytes: u32) -> bool {
        let available = self.window_bytes.saturating_sub(self.in_flight_bytes());
        if available < packet_bytes {
            return false;
        }
        self.byte_count = round_up_to_line(self.byte_count.wrapping_add(packet_bytes));
        self.packet_count = self.packet_count.wrapping_add(1);
        true
    }

    /// Fold in one frame from the credit return path. Returns whether the
    /// frame carried usable credit; frames that are not flow-control
    /// packets are logged and ignored.
    pub fn on_credit_packet(&mut self, words: &[u32]) -> Result<bool> {
        let header = self.wire.unpack(words)?;
        if header.packet_type != PacketType::FlowControl {
            warn!(
                "unexpected {:?} packet on credit return path",
                header.packet_type
            );
            return Ok(false);
        }
        let payload = &words[header.num_header_words()..];
        let (packet_count, byte_count) = decode_fc_payload(self.wire, payload)?;
        self.last_ack_packet_count = packet_count;
        self.last_ack_byte_count = byte_count;
        self.last_ack_seq = header.sequence_number;
        self.fc_received = true;
        Ok(true)
    }

    /// Block until the window admits a `packet_bytes` packet, draining
    /// credit from `credit_link` while waiting.
    pub fn reserve(
        &mut self,
        credit_link: &dyn DataLink,
        packet_bytes: u32,
        timeout: Duration,
    ) -> Result<()> {
        self.reserve_with_poll(credit_link, packet_bytes, timeout, FC_POLL_INTERVAL)
    }

    pub fn reserve_with_poll(
        &mut self,
        credit_link: &dyn DataLink,
        packet_bytes: u32,
        timeout: Duration,
        poll: Duration,
    ) -> Result<()> {
        if packet_bytes > self.window_bytes {
            return Err(Error::Value(format!(
                "packet of {} bytes can never fit a {} byte window",
                packet_bytes, self.window_bytes
            )));
        }
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_reserve(packet_bytes) {
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout);
            }
            if let Some(buffer) = credit_link.acquire_recv(remaining.min(poll)) {
                if let Err(e) = self.on_credit_packet(buffer.words()) {
                    warn!("discarding bad credit packet: {e}");
                }
            }
        }
    }

    /// Answer the most recent credit packet with a flow-control ack echoing
    /// our send-side counts. No-op unless credit arrived since the last
    /// ack; the ack itself consumes window and is accounted like any other
    /// packet.
    pub fn send_ack(&mut self, link: &dyn DataLink, addr: StreamAddress) -> Result<()> {
        if !self.fc_received {
            return Ok(());
        }
        let seq = self.ack_seq;
        self.ack_seq = self.ack_seq.wrapping_add(1);
        let sent_bytes = emit_fc_packet(
            link,
            self.wire,
            PacketType::FlowControlAck,
            seq,
            addr,
            self.packet_count,
            self.byte_count,
        )?;
        self.byte_count = round_up_to_line(self.byte_count.wrapping_add(sent_bytes));
        self.packet_count = self.packet_count.wrapping_add(1);
        self.fc_received = false;
        Ok(())
    }

    pub fn window_bytes(&self) -> u32 {
        self.window_bytes
    }

    pub fn byte_count(&self) -> u32 {
        self.byte_count
    }

    pub fn packet_count(&self) -> u32 {
        self.packet_count
    }

    pub fn last_ack_seq(&self) -> u32 {
        self.last_ack_seq
    }
}
