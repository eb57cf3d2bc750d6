//! Stream endpoints: terminators, streamers, and async status plumbing.

pub mod async_msg;
pub mod rx;
pub mod terminator;
pub mod tx;

pub use async_msg::{AsyncMsg, AsyncMsgQueue, DEFAULT_ASYNC_QUEUE_DEPTH};
pub use rx::{OverflowHandler, RxPacket, RxStreamer};
pub use terminator::{Direction, StreamTerminator, TerminatorState};
pub use tx::{TxSendHandle, TxStreamer};
