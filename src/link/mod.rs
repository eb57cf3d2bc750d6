//! Link abstraction: a bidirectional pair of buffer pools with
//! blocking-with-timeout acquire semantics.
//!
//! Physical link setup (UDP sockets, DMA rings) lives with the transport
//! provider; the streaming core only consumes [`DataLink`]. Buffer handles
//! are RAII: dropping an unconsumed handle returns its frame to the pool,
//! `commit` puts a send frame on the wire.

pub mod channel;
pub mod mux;

pub use channel::{ChannelLink, LinkConfig};
pub use mux::StreamDemux;

use std::time::Duration;

/// A writable frame acquired from the send pool.
pub trait SendBuffer: Send {
    /// Frame capacity in wire words.
    fn capacity_words(&self) -> usize;

    /// The whole frame, writable. Only the first `len_words` passed to
    /// `commit` go on the wire.
    fn words_mut(&mut self) -> &mut [u32];

    /// Queue the first `len_words` words for transmission. Consumes the
    /// handle; the frame returns to the pool once the remote side (or the
    /// link itself) is done with it.
    fn commit(self: Box<Self>, len_words: usize);
}

/// A received frame. Dropping the handle releases the frame back to the
/// remote side's send pool.
pub trait RecvBuffer: Send {
    /// The committed words of this frame.
    fn words(&self) -> &[u32];
}

/// One direction pair of an established transport.
///
/// Implementations must be safe to share across threads; the streaming core
/// drives the data path from the application thread and (TX only) a
/// background drain thread, each on disjoint links.
pub trait DataLink: Send + Sync {
    /// Block up to `timeout` for a free send frame. `Duration::ZERO` must
    /// not block.
    fn acquire_send(&self, timeout: Duration) -> Option<Box<dyn SendBuffer>>;

    /// Block up to `timeout` for the next received frame.
    fn acquire_recv(&self, timeout: Duration) -> Option<Box<dyn RecvBuffer>>;

    /// Send frame capacity in words (declared MTU).
    fn send_frame_words(&self) -> usize;

    /// Receive frame capacity in words.
    fn recv_frame_words(&self) -> usize;

    /// Depth of the send pool.
    fn num_send_frames(&self) -> usize;

    /// Depth of the receive pool.
    fn num_recv_frames(&self) -> usize;

    /// Total send-side buffering in bytes. Bounds the TX flow-control
    /// window (a credit window larger than the physical buffering cannot
    /// be serviced).
    fn send_buff_bytes(&self) -> usize {
        self.num_send_frames() * self.send_frame_words() * crate::chdr::WORD_SIZE
    }

    /// Total receive-side buffering in bytes. Input to the RX window
    /// sizing policy.
    fn recv_buff_bytes(&self) -> usize {
        self.num_recv_frames() * self.recv_frame_words() * crate::chdr::WORD_SIZE
    }
}
