//! Receive streamer: the application-facing handle for host-bound data.
//!
//! Each channel owns its data link, flow-control state, and sequence
//! tracking behind its own mutex; the application thread drives everything
//! synchronously through [`RxStreamer::recv_packet`]. Per-packet protocol
//! errors are logged and absorbed so a long-running receive loop never
//! unwinds over one bad packet.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{trace, warn};

use crate::block::StreamCmd;
use crate::chdr::{PacketHeader, PacketType, WireFormat};
use crate::convert::Converter;
use crate::error::{Error, Result};
use crate::flow::RxFlowState;
use crate::link::{DataLink, RecvBuffer};
use crate::stream::terminator::StreamTerminator;

pub type OverflowHandler = Box<dyn Fn(usize) + Send + Sync>;

/// One decoded data packet, still backed by its link frame.
pub struct RxPacket {
    pub buffer: Box<dyn RecvBuffer>,
    pub header: PacketHeader,
    /// Set when this packet's sequence number broke the expected run.
    /// Data is still delivered; the application decides what to drop.
    pub sequence_error: bool,
}

impl std::fmt::Debug for RxPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RxPacket")
            .field("header", &self.header)
            .field("sequence_error", &self.sequence_error)
            .finish_non_exhaustive()
    }
}

impl RxPacket {
    /// Payload words in wire order.
    pub fn payload(&self) -> &[u32] {
        let start = self.header.num_header_words();
        &self.buffer.words()[start..start + self.header.num_payload_words as usize]
    }
}

pub(crate) struct RxChannel {
    pub(crate) link: Arc<dyn DataLink>,
    pub(crate) fc: RxFlowState,
    /// Next expected sequence number; `None` until the first packet.
    pub(crate) next_seq: Option<u32>,
}

pub struct RxStreamer {
    terminator: Arc<StreamTerminator>,
    channels: Vec<Mutex<RxChannel>>,
    converter: Arc<dyn Converter>,
    wire: &'static dyn WireFormat,
    samples_per_packet: usize,
    overflow_handler: Mutex<Option<OverflowHandler>>,
    sample_rate: Mutex<f64>,
    started: AtomicBool,
}

impl RxStreamer {
    pub(crate) fn new(
        terminator: Arc<StreamTerminator>,
        channels: Vec<RxChannel>,
        converter: Arc<dyn Converter>,
        wire: &'static dyn WireFormat,
        samples_per_packet: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            terminator,
            channels: channels.into_iter().map(Mutex::new).collect(),
            converter,
            wire,
            samples_per_packet,
            overflow_handler: Mutex::new(None),
            sample_rate: Mutex::new(1.0),
            started: AtomicBool::new(false),
        })
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn samples_per_packet(&self) -> usize {
        self.samples_per_packet
    }

    pub fn terminator_id(&self) -> &str {
        self.terminator.id()
    }

    pub fn scale_factor(&self) -> f64 {
        self.converter.scale_factor()
    }

    pub fn sample_rate(&self) -> f64 {
        *self.sample_rate.lock().expect("sample rate poisoned")
    }

    /// Pushed by the device facade on rate changes.
    pub fn set_sample_rate(&self, rate: f64) {
        *self.sample_rate.lock().expect("sample rate poisoned") = rate;
    }

    /// Called on codec failures and sequence gaps; typically restarts the
    /// channel through the terminator.
    pub fn set_overflow_handler(&self, handler: OverflowHandler) {
        *self
            .overflow_handler
            .lock()
            .expect("overflow handler poisoned") = Some(handler);
    }

    fn notify_overflow(&self, channel: usize) {
        let handler = self
            .overflow_handler
            .lock()
            .expect("overflow handler poisoned");
        if let Some(handler) = handler.as_ref() {
            handler(channel);
        }
    }

    /// Broadcast to every bound block. Continuous start/stop also flips
    /// the streaming notification.
    pub fn issue_stream_cmd(&self, cmd: StreamCmd) -> Result<()> {
        self.terminator.issue_stream_cmd(cmd)?;
        match cmd {
            StreamCmd::StartContinuous => self.terminator.set_streaming(true),
            StreamCmd::StopContinuous => self.terminator.set_streaming(false),
            StreamCmd::NumSampsAndDone(_) => {}
        }
        Ok(())
    }

    /// Pull the next data packet for `channel`, servicing flow control
    /// along the way.
    ///
    /// Flow-control acks are folded into the channel's state and the wait
    /// continues; undecodable frames trigger the overflow handler and the
    /// wait continues. Only the deadline ends the call without data.
    pub fn recv_packet(&self, channel: usize, timeout: Duration) -> Result<RxPacket> {
        let slot = self
            .channels
            .get(channel)
            .ok_or_else(|| Error::Value(format!("no rx channel {channel}")))?;
        if !self.started.swap(true, Ordering::SeqCst) {
            self.terminator.set_streaming(true);
        }

        let mut guard = slot.lock().expect("rx channel poisoned");
        let ch = &mut *guard;
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(buffer) = ch.link.acquire_recv(remaining) else {
                return Err(Error::Timeout);
            };

            let header = match self.wire.unpack(buffer.words()) {
                Ok(header) => header,
                Err(e) => {
                    warn!(channel, "dropping undecodable packet: {e}");
                    self.notify_overflow(channel);
                    continue;
                }
            };

            match header.packet_type {
                PacketType::FlowControlAck => {
                    let payload = &buffer.words()[header.num_header_words()..];
                    if let Err(e) = ch.fc.on_ack(&*ch.link, payload) {
                        if !e.is_recoverable() {
                            return Err(e);
                        }
                        warn!(channel, "dropping malformed flow control ack: {e}");
                    }
                    continue;
                }
                PacketType::FlowControl => {
                    warn!(channel, "unexpected flow control packet on rx data path");
                    continue;
                }
                PacketType::Data => {}
            }

            let sequence_error = match ch.next_seq {
                Some(expected) if expected != header.sequence_number => {
                    warn!(
                        channel,
                        expected,
                        got = header.sequence_number,
                        "rx sequence gap"
                    );
                    self.notify_overflow(channel);
                    true
                }
                _ => false,
            };
            ch.next_seq = Some(header.sequence_number.wrapping_add(1));

            ch.fc.on_packet(&*ch.link, &header)?;
            trace!(
                channel,
                seq = header.sequence_number,
                words = header.num_payload_words,
                "rx packet"
            );
            return Ok(RxPacket {
                buffer,
                header,
                sequence_error,
            });
        }
    }
}

impl Drop for RxStreamer {
    fn drop(&mut self) {
        self.terminator.teardown();
    }
}
