//! Stream-id demultiplexer for shared physical links.
//!
//! Some transports (DMA rings, shared-memory channels) carry several
//! logical streams over one physical link, distinguished only by the
//! stream id embedded in each packet header. [`StreamDemux`] wraps such a
//! link and hands out per-id sub-links; flow-control state always sees a
//! dedicated [`DataLink`] and never learns about the sharing.
//!
//! The receive path is pumped cooperatively: whichever sub-link is waiting
//! pulls frames off the physical link and routes them. Frames for unknown
//! ids are logged and dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::warn;

use super::{DataLink, RecvBuffer, SendBuffer};
use crate::chdr::WireFormat;

/// Per-id queue depth. A sub-link that is not being drained stalls at this
/// depth and starts shedding its own frames, not its neighbors'.
const SUB_QUEUE_DEPTH: usize = 32;

/// Pump granularity while a sub-link waits for its own traffic.
const PUMP_SLICE: Duration = Duration::from_millis(10);

struct DemuxInner {
    routes: HashMap<u32, Sender<Box<dyn RecvBuffer>>>,
}

pub struct StreamDemux {
    link: Arc<dyn DataLink>,
    wire: &'static dyn WireFormat,
    inner: Mutex<DemuxInner>,
    /// Serializes access to the physical receive side.
    pump_lock: Mutex<()>,
}

impl StreamDemux {
    pub fn new(link: Arc<dyn DataLink>, wire: &'static dyn WireFormat) -> Arc<Self> {
        Arc::new(Self {
            link,
            wire,
            inner: Mutex::new(DemuxInner {
                routes: HashMap::new(),
            }),
            pump_lock: Mutex::new(()),
        })
    }

    /// Create the sub-link receiving packets whose header stream id equals
    /// `stream_id`. The send side shares the physical pool directly.
    pub fn sub_link(self: &Arc<Self>, stream_id: u32) -> Arc<SubLink> {
        let (tx, rx) = bounded(SUB_QUEUE_DEPTH);
        self.inner
            .lock()
            .expect("demux routes poisoned")
            .routes
            .insert(stream_id, tx);
        Arc::new(SubLink {
            demux: Arc::clone(self),
            stream_id,
            queue: rx,
        })
    }

    /// Pull one frame off the physical link and route it. Returns false on
    /// timeout.
    fn pump_one(&self, timeout: Duration) -> bool {
        let _guard = self.pump_lock.lock().expect("demux pump poisoned");
        let Some(buffer) = self.link.acquire_recv(timeout) else {
            return false;
        };
        let stream_id = match self.wire.unpack(buffer.words()) {
            Ok(header) => header.stream_id,
            Err(e) => {
                warn!("demux dropping undecodable frame: {e}");
                return true;
            }
        };
        let Some(stream_id) = stream_id else {
            warn!("demux dropping frame without stream id");
            return true;
        };
        let inner = self.inner.lock().expect("demux routes poisoned");
        match inner.routes.get(&stream_id) {
            Some(route) => {
                // Full sub-queue: shed this stream's own frame.
                if route.try_send(buffer).is_err() {
                    warn!("demux queue full for stream id 0x{stream_id:08x}, dropping frame");
                }
            }
            None => {
                warn!("demux dropping frame for unknown stream id 0x{stream_id:08x}");
            }
        }
        true
    }
}

/// One logical stream of a demultiplexed link.
pub struct SubLink {
    demux: Arc<StreamDemux>,
    stream_id: u32,
    queue: Receiver<Box<dyn RecvBuffer>>,
}

impl SubLink {
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }
}

impl DataLink for SubLink {
    fn acquire_send(&self, timeout: Duration) -> Option<Box<dyn SendBuffer>> {
        self.demux.link.acquire_send(timeout)
    }

    fn acquire_recv(&self, timeout: Duration) -> Option<Box<dyn RecvBuffer>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(buffer) = self.queue.try_recv() {
                return Some(buffer);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() && !timeout.is_zero() {
                return None;
            }
            self.demux.pump_one(remaining.min(PUMP_SLICE));
            if timeout.is_zero() {
                // One non-blocking pump, then a last look at the queue.
                return self.queue.try_recv().ok();
            }
        }
    }

    fn send_frame_words(&self) -> usize {
        self.demux.link.send_frame_words()
    }

    fn recv_frame_words(&self) -> usize {
        self.demux.link.recv_frame_words()
    }

    fn num_send_frames(&self) -> usize {
        self.demux.link.num_send_frames()
    }

    fn num_recv_frames(&self) -> usize {
        self.demux.link.num_recv_frames()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chdr::{wire_format, Endianness, PacketHeader, PacketType};
    use crate::link::{ChannelLink, LinkConfig};

    fn push_packet(link: &ChannelLink, stream_id: Option<u32>, seq: u32) {
        let wire = wire_format(Endianness::Big);
        let mut buf = link.acquire_send(Duration::ZERO).unwrap();
        let mut header = PacketHeader::new(PacketType::Data);
        header.stream_id = stream_id;
        header.sequence_number = seq;
        let n = wire.pack(buf.words_mut(), &header).unwrap();
        buf.commit(n);
    }

    #[test]
    fn test_routes_by_stream_id() {
        let (host, device) = ChannelLink::pair(LinkConfig::default());
        let demux = StreamDemux::new(Arc::new(host), wire_format(Endianness::Big));
        let sub_a = demux.sub_link(0xA);
        let sub_b = demux.sub_link(0xB);

        push_packet(&device, Some(0xB), 1);
        push_packet(&device, Some(0xA), 2);

        let wire = wire_format(Endianness::Big);
        let got_a = sub_a.acquire_recv(Duration::from_millis(100)).unwrap();
        assert_eq!(wire.unpack(got_a.words()).unwrap().sequence_number, 2);
        let got_b = sub_b.acquire_recv(Duration::from_millis(100)).unwrap();
        assert_eq!(wire.unpack(got_b.words()).unwrap().sequence_number, 1);
    }

    #[test]
    fn test_unknown_id_dropped_without_disturbing_others() {
        let (host, device) = ChannelLink::pair(LinkConfig::default());
        let demux = StreamDemux::new(Arc::new(host), wire_format(Endianness::Big));
        let sub = demux.sub_link(0x1);

        push_packet(&device, Some(0x99), 1); // no such route
        push_packet(&device, None, 2); // no stream id at all
        push_packet(&device, Some(0x1), 3);

        let wire = wire_format(Endianness::Big);
        let got = sub.acquire_recv(Duration::from_millis(100)).unwrap();
        assert_eq!(wire.unpack(got.words()).unwrap().sequence_number, 3);
        assert!(sub.acquire_recv(Duration::ZERO).is_none());
    }

    #[test]
    fn test_sub_link_timeout() {
        let (host, _device) = ChannelLink::pair(LinkConfig::default());
        let demux = StreamDemux::new(Arc::new(host), wire_format(Endianness::Big));
        let sub = demux.sub_link(0x1);
        assert!(sub.acquire_recv(Duration::from_millis(20)).is_none());
    }
}
