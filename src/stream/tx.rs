//! Transmit streamer: the application-facing handle for device-bound data.
//!
//! Sending is a two-step handshake: [`TxStreamer::get_send_buffer`] blocks
//! until the credit window admits the packet and a link frame is free,
//! then [`TxStreamer::commit`] packs the header, puts the frame on the
//! wire, and answers any pending credit with a flow-control ack.
//!
//! One background thread per streamer drains the async-message transport.
//! It must be stopped and joined before the links go away; drop order is
//! stop flag, join, terminator teardown, links.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::addr::StreamAddress;
use crate::block::StreamCmd;
use crate::chdr::{HeaderFlags, PacketHeader, PacketType, WireFormat, MAX_HEADER_WORDS, WORD_SIZE};
use crate::convert::Converter;
use crate::error::{Error, Result};
use crate::flow::TxFlowState;
use crate::link::{DataLink, SendBuffer};
use crate::stream::async_msg::{AsyncMsg, AsyncMsgQueue};
use crate::stream::terminator::StreamTerminator;

/// Poll slice for the drain thread's receive wait; bounds shutdown latency.
const DRAIN_POLL: Duration = Duration::from_millis(100);

pub(crate) struct TxChannel {
    pub(crate) link: Arc<dyn DataLink>,
    pub(crate) fc: TxFlowState,
    pub(crate) seq: u32,
    /// Host-to-device data address; stamped into every data header.
    pub(crate) addr: StreamAddress,
}

/// A credit-backed writable frame. Credit was already claimed; dropping
/// the handle without committing wastes that credit until the next ack.
pub struct TxSendHandle {
    buffer: Box<dyn SendBuffer>,
    channel: usize,
    payload_words: usize,
}

impl std::fmt::Debug for TxSendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxSendHandle")
            .field("channel", &self.channel)
            .field("payload_words", &self.payload_words)
            .finish_non_exhaustive()
    }
}

impl TxSendHandle {
    /// The payload region, after the header words.
    pub fn payload_mut(&mut self) -> &mut [u32] {
        &mut self.buffer.words_mut()[MAX_HEADER_WORDS..MAX_HEADER_WORDS + self.payload_words]
    }

    pub fn channel(&self) -> usize {
        self.channel
    }
}

pub struct TxStreamer {
    terminator: Arc<StreamTerminator>,
    channels: Vec<Mutex<TxChannel>>,
    converter: Arc<dyn Converter>,
    wire: &'static dyn WireFormat,
    samples_per_packet: usize,
    sample_rate: Mutex<f64>,
    async_queue: Arc<AsyncMsgQueue>,
    drain_stop: Arc<AtomicBool>,
    drain_thread: Mutex<Option<JoinHandle<()>>>,
}

impl TxStreamer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        terminator: Arc<StreamTerminator>,
        channels: Vec<TxChannel>,
        converter: Arc<dyn Converter>,
        wire: &'static dyn WireFormat,
        samples_per_packet: usize,
        msg_link: Arc<dyn DataLink>,
        legacy_queue: Arc<AsyncMsgQueue>,
    ) -> Arc<Self> {
        // The drain thread maps incoming stream ids back to channels.
        let channel_by_sid: HashMap<u32, usize> = channels
            .iter()
            .enumerate()
            .map(|(i, ch)| (ch.addr.reversed().stream_id(), i))
            .collect();

        let async_queue = Arc::new(AsyncMsgQueue::default());
        let drain_stop = Arc::new(AtomicBool::new(false));

        let thread = {
            let stop = Arc::clone(&drain_stop);
            let own_queue = Arc::clone(&async_queue);
            let legacy = Arc::clone(&legacy_queue);
            std::thread::Builder::new()
                .name("tx-async-drain".into())
                .spawn(move || {
                    drain_loop(&*msg_link, wire, &channel_by_sid, &stop, &own_queue, &legacy)
                })
                .expect("spawn tx async drain thread")
        };

        Arc::new(Self {
            terminator,
            channels: channels.into_iter().map(Mutex::new).collect(),
            converter,
            wire,
            samples_per_packet,
            sample_rate: Mutex::new(1.0),
            async_queue,
            drain_stop,
            drain_thread: Mutex::new(Some(thread)),
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

    pub fn set_sample_rate(&self, rate: f64) {
        *self.sample_rate.lock().expect("sample rate poisoned") = rate;
    }

    pub fn issue_stream_cmd(&self, cmd: StreamCmd) -> Result<()> {
        self.terminator.issue_stream_cmd(cmd)
    }

    /// Status messages for this streamer, oldest first.
    pub fn recv_async_msg(&self, timeout: Duration) -> Option<AsyncMsg> {
        self.async_queue.pop(timeout)
    }

    /// Claim credit and a link frame for a packet of `payload_words`.
    ///
    /// Blocks until the downstream window admits the packet; a stalled
    /// consumer surfaces as [`Error::Timeout`] once `timeout` elapses.
    pub fn get_send_buffer(
        &self,
        channel: usize,
        payload_words: usize,
        timeout: Duration,
    ) -> Result<TxSendHandle> {
        let slot = self
            .channels
            .get(channel)
            .ok_or_else(|| Error::Value(format!("no tx channel {channel}")))?;
        let mut guard = slot.lock().expect("tx channel poisoned");
        let ch = &mut *guard;

        if MAX_HEADER_WORDS + payload_words > ch.link.send_frame_words() {
            return Err(Error::Value(format!(
                "payload of {payload_words} words exceeds frame capacity"
            )));
        }

        let deadline = Instant::now() + timeout;
        let packet_bytes = ((MAX_HEADER_WORDS + payload_words) * WORD_SIZE) as u32;
        ch.fc.reserve(&*ch.link, packet_bytes, timeout)?;

        let remaining = deadline.saturating_duration_since(Instant::now());
        let Some(buffer) = ch.link.acquire_send(remaining) else {
            return Err(Error::Timeout);
        };
        Ok(TxSendHandle {
            buffer,
            channel,
            payload_words,
        })
    }

    /// Pack the data header around the written payload and put the packet
    /// on the wire, then answer any pending credit.
    pub fn commit(
        &self,
        mut handle: TxSendHandle,
        start_of_burst: bool,
        end_of_burst: bool,
    ) -> Result<()> {
        let slot = self
            .channels
            .get(handle.channel)
            .ok_or_else(|| Error::Value(format!("no tx channel {}", handle.channel)))?;
        let mut guard = slot.lock().expect("tx channel poisoned");
        let ch = &mut *guard;

        let mut header = PacketHeader::new(PacketType::Data);
        header.stream_id = Some(ch.addr.stream_id());
        header.sequence_number = ch.seq;
        header.num_payload_words = handle.payload_words as u16;
        if start_of_burst {
            header.flags |= HeaderFlags::START_OF_BURST;
        }
        if end_of_burst {
            header.flags |= HeaderFlags::END_OF_BURST;
        }
        ch.seq = ch.seq.wrapping_add(1);

        let n = self.wire.pack(handle.buffer.words_mut(), &header)?;
        debug_assert_eq!(n, MAX_HEADER_WORDS);
        let total = n + handle.payload_words;
        handle.buffer.commit(total);
        trace!(
            channel = handle.channel,
            seq = header.sequence_number,
            words = handle.payload_words,
            "tx packet"
        );

        let addr = ch.addr;
        ch.fc.send_ack(&*ch.link, addr)
    }
}

fn drain_loop(
    msg_link: &dyn DataLink,
    wire: &'static dyn WireFormat,
    channel_by_sid: &HashMap<u32, usize>,
    stop: &AtomicBool,
    own_queue: &AsyncMsgQueue,
    legacy_queue: &AsyncMsgQueue,
) {
    while !stop.load(Ordering::SeqCst) {
        let Some(buffer) = msg_link.acquire_recv(DRAIN_POLL) else {
            continue;
        };
        let header = match wire.unpack(buffer.words()) {
            Ok(header) => header,
            Err(e) => {
                warn!("dropping undecodable async message: {e}");
                continue;
            }
        };
        match header.packet_type {
            // Credit is consumed inline by the send path, not here.
            PacketType::FlowControl | PacketType::FlowControlAck => {
                trace!("ignoring flow control packet on async message path");
            }
            PacketType::Data => {
                let channel = header
                    .stream_id
                    .and_then(|sid| channel_by_sid.get(&sid).copied())
                    .unwrap_or(0);
                let start = header.num_header_words();
                let payload: Vec<u32> = buffer.words()[start..]
                    .iter()
                    .map(|w| wire.to_host(*w))
                    .collect();
                let msg = AsyncMsg {
                    channel,
                    sequence_number: header.sequence_number,
                    payload,
                };
                legacy_queue.push(msg.clone());
                own_queue.push(msg);
            }
        }
    }
    debug!("tx async drain thread stopped");
}

impl Drop for TxStreamer {
    fn drop(&mut self) {
        self.drain_stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self
            .drain_thread
            .lock()
            .expect("drain thread handle poisoned")
            .take()
        {
            let _ = thread.join();
        }
        self.terminator.teardown();
    }
}
