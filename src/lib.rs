//! Host-side streaming transport and flow-control engine for a
//! software-defined-radio driver stack.
//!
//! A device exposes processing blocks on a packet-switched crossbar; this
//! crate opens flow-controlled packet transports to those blocks and
//! streams sample data with credit-based pacing. Layers, leaves first:
//!
//! - [`chdr`]: the condensed-header packet codec, endianness-parameterized.
//! - [`link`]: the buffer-pool link abstraction drivers plug into, an
//!   in-memory loopback link, and a stream-id demultiplexer.
//! - [`flow`]: the RX and TX credit state machines and window sizing.
//! - [`stream`]: terminators, streamers, and async status plumbing.
//! - [`device`]: transport factory and the stream-construction facade.
//!
//! Drivers implement [`block::BlockPort`] for their block controllers and
//! [`device::TransportProvider`] for their physical links; applications
//! talk to [`device::StreamDevice`] and the streamers it hands out.

pub mod addr;
pub mod block;
pub mod chdr;
pub mod convert;
pub mod device;
pub mod error;
pub mod flow;
pub mod link;
pub mod stream;

pub use addr::{EndpointId, StreamAddress};
pub use block::{BlockPort, StreamCmd, StreamSignature};
pub use chdr::Endianness;
pub use device::{ChannelSpec, LoopbackProvider, StreamArgs, StreamDevice};
pub use error::{Error, Result};
pub use stream::{AsyncMsg, RxPacket, RxStreamer, TxSendHandle, TxStreamer};
