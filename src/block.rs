//! Block controller capability surface.
//!
//! Processing blocks live on the device crossbar and are driven by the
//! device driver proper; the streaming core only needs the small surface
//! below to wire a stream: addressing, signature negotiation, flow-control
//! programming, and stream commands. Drivers implement [`BlockPort`] on
//! their block controllers.

use crate::addr::EndpointId;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCmd {
    StartContinuous,
    StopContinuous,
    /// Stream exactly this many samples, then stop.
    NumSampsAndDone(u64),
}

/// What a block port puts on (or expects from) the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSignature {
    /// Item format, e.g. `"sc16"`.
    pub item_type: String,
    /// Fixed packet payload size in bytes, if the block mandates one.
    pub packet_size: Option<usize>,
}

pub trait BlockPort: Send + Sync {
    /// Human-readable block identity, used in error messages and logs.
    fn block_id(&self) -> String;

    /// Index of the device (mainboard) hosting this block.
    fn device_index(&self) -> usize;

    /// Crossbar endpoint of the given port.
    fn address(&self, port: usize) -> Result<EndpointId>;

    fn stream_signature(&self, port: usize) -> StreamSignature;

    /// Downstream buffering available behind this port, in bytes. Bounds
    /// the transmit credit window.
    fn fifo_bytes(&self, port: usize) -> usize;

    /// Program the block to emit upstream credit for host-bound data.
    fn configure_flow_control_out(
        &self,
        enable: bool,
        window_pkts: usize,
        pkt_limit: usize,
        port: usize,
    ) -> Result<()>;

    /// Program the block's credit reporting for host-originated data.
    fn configure_flow_control_in(&self, interval_pkts: usize, port: usize) -> Result<()>;

    fn issue_stream_cmd(&self, cmd: StreamCmd, port: usize) -> Result<()>;

    /// Streamer attach/detach notification.
    fn set_active_streamer(&self, active: bool, port: usize);

    /// Current packetization, for blocks that packetize (radios). Others
    /// return `None` and are skipped during negotiation.
    fn samples_per_packet(&self) -> Option<usize> {
        None
    }

    fn set_samples_per_packet(&self, _spp: usize) -> Result<()> {
        Ok(())
    }
}
