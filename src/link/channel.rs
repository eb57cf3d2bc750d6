//! In-memory bidirectional link built on bounded channels.
//!
//! Each endpoint owns a prefilled pool of send frames; committed frames
//! travel over a FIFO wire queue to the peer and return to the sender's
//! pool on release. This is the link used by the loopback transport
//! provider and by the test suite; it models the zero-copy frame-pool
//! semantics of real UDP/DMA links, including pool exhaustion.

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};

use super::{DataLink, RecvBuffer, SendBuffer};

/// Frame storage: a fixed-capacity word vector recycled through the pool.
#[derive(Debug)]
struct Frame {
    words: Vec<u32>,
    /// Committed length; only meaningful on the wire.
    len_words: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkConfig {
    pub send_frame_words: usize,
    pub recv_frame_words: usize,
    pub num_send_frames: usize,
    pub num_recv_frames: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        // 8 KiB frames, 32 deep, both directions.
        Self {
            send_frame_words: 2048,
            recv_frame_words: 2048,
            num_send_frames: 32,
            num_recv_frames: 32,
        }
    }
}

/// One endpoint of an in-memory link pair.
pub struct ChannelLink {
    pool_rx: Receiver<Frame>,
    pool_tx: Sender<Frame>,
    wire_tx: Sender<Frame>,
    wire_rx: Receiver<Frame>,
    /// Returns consumed receive frames to the peer's pool.
    peer_pool_tx: Sender<Frame>,
    config: LinkConfig,
}

impl ChannelLink {
    /// Create a connected pair of endpoints. Frames committed on one side
    /// come out of `acquire_recv` on the other, FIFO per direction.
    pub fn pair(config: LinkConfig) -> (ChannelLink, ChannelLink) {
        let (a_pool_tx, a_pool_rx) = bounded(config.num_send_frames);
        let (b_pool_tx, b_pool_rx) = bounded(config.num_send_frames);
        // Wire queues are as deep as the sending pool so a commit never
        // blocks: every in-flight frame came out of the finite pool.
        let (a_wire_tx, a_wire_rx) = bounded(config.num_send_frames);
        let (b_wire_tx, b_wire_rx) = bounded(config.num_send_frames);

        for _ in 0..config.num_send_frames {
            let frame = Frame {
                words: vec![0; config.send_frame_words],
                len_words: 0,
            };
            a_pool_tx.send(frame).expect("prefill send pool");
            let frame = Frame {
                words: vec![0; config.send_frame_words],
                len_words: 0,
            };
            b_pool_tx.send(frame).expect("prefill send pool");
        }

        let a = ChannelLink {
            pool_rx: a_pool_rx,
            pool_tx: a_pool_tx.clone(),
            wire_tx: a_wire_tx,
            wire_rx: b_wire_rx,
            peer_pool_tx: b_pool_tx.clone(),
            config,
        };
        let b = ChannelLink {
            pool_rx: b_pool_rx,
            pool_tx: b_pool_tx,
            wire_tx: b_wire_tx,
            wire_rx: a_wire_rx,
            peer_pool_tx: a_pool_tx,
            config,
        };
        (a, b)
    }
}

fn recv_with_timeout<T>(rx: &Receiver<T>, timeout: Duration) -> Option<T> {
    if timeout.is_zero() {
        rx.try_recv().ok()
    } else {
        rx.recv_timeout(timeout).ok()
    }
}

impl DataLink for ChannelLink {
    fn acquire_send(&self, timeout: Duration) -> Option<Box<dyn SendBuffer>> {
        let frame = recv_with_timeout(&self.pool_rx, timeout)?;
        Some(Box::new(ChannelSendBuffer {
            frame: Some(frame),
            wire_tx: self.wire_tx.clone(),
            pool_tx: self.pool_tx.clone(),
        }))
    }

    fn acquire_recv(&self, timeout: Duration) -> Option<Box<dyn RecvBuffer>> {
        let frame = recv_with_timeout(&self.wire_rx, timeout)?;
        Some(Box::new(ChannelRecvBuffer {
            frame: Some(frame),
            pool_tx: self.peer_pool_tx.clone(),
        }))
    }

    fn send_frame_words(&self) -> usize {
        self.config.send_frame_words
    }

    fn recv_frame_words(&self) -> usize {
        self.config.recv_frame_words
    }

    fn num_send_frames(&self) -> usize {
        self.config.num_send_frames
    }

    fn num_recv_frames(&self) -> usize {
        self.config.num_recv_frames
    }
}

struct ChannelSendBuffer {
    frame: Option<Frame>,
    wire_tx: Sender<Frame>,
    pool_tx: Sender<Frame>,
}

impl SendBuffer for ChannelSendBuffer {
    fn capacity_words(&self) -> usize {
        self.frame.as_ref().map_or(0, |f| f.words.len())
    }

    fn words_mut(&mut self) -> &mut [u32] {
        self.frame
            .as_mut()
            .map(|f| f.words.as_mut_slice())
            .unwrap_or(&mut [])
    }

    fn commit(mut self: Box<Self>, len_words: usize) {
        if let Some(mut frame) = self.frame.take() {
            frame.len_words = len_words.min(frame.words.len());
            // Queue depth equals pool depth; this cannot block.
            let _ = self.wire_tx.send(frame);
        }
    }
}

impl Drop for ChannelSendBuffer {
    fn drop(&mut self) {
        // Released without commit: hand the frame straight back.
        if let Some(frame) = self.frame.take() {
            let _ = self.pool_tx.send(frame);
        }
    }
}

struct ChannelRecvBuffer {
    frame: Option<Frame>,
    pool_tx: Sender<Frame>,
}

impl RecvBuffer for ChannelRecvBuffer {
    fn words(&self) -> &[u32] {
        self.frame
            .as_ref()
            .map(|f| &f.words[..f.len_words])
            .unwrap_or(&[])
    }
}

impl Drop for ChannelRecvBuffer {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            let _ = self.pool_tx.send(frame);
        }
    }
}
