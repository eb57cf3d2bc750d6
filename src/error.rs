//! Error taxonomy for the streaming core.
//!
//! Per-packet failures (`Protocol`) are logged and the offending packet is
//! discarded; the data path keeps running. Construction-time failures
//! (`IncompatibleStreamSignature`, `AddressResolution`, `ResourceExhausted`,
//! `Value`) abort the stream-creation call. `FlowControlTimeout` means the
//! return path for flow-control packets is broken and the stream should be
//! torn down by the caller.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or foreign packet: shorter than the header, unknown packet
    /// type, or non-zero reserved bits. Never fatal for the stream.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Could not acquire a send buffer to emit a mandatory flow-control
    /// packet. Fatal for the stream.
    #[error("flow control timed out: {0}")]
    FlowControlTimeout(String),

    /// A buffer acquire ran past the caller's deadline.
    #[error("timed out waiting for a buffer")]
    Timeout,

    /// Conflicting on-the-wire item type or packet size across channels
    /// sharing a terminator.
    #[error("incompatible stream signature: {0}")]
    IncompatibleStreamSignature(String),

    /// The destination endpoint cannot be reached over the crossbar.
    #[error("address resolution failed: {0}")]
    AddressResolution(String),

    /// Transport-specific resources (DMA channels, host ports) exhausted.
    /// Fatal for this call; the device remains usable for other streams.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Invalid argument or configuration value.
    #[error("invalid value: {0}")]
    Value(String),
}

impl Error {
    /// True for errors that steady-state streaming handles locally by
    /// dropping the packet instead of unwinding the read/write loop.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Protocol(_))
    }
}
