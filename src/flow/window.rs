//! Window sizing policy.
//!
//! Pure arithmetic shared by the stream factory: how much of the software
//! receive buffer a producer may fill, how often the consumer reports
//! credit, and how large a transmit window the downstream FIFO supports.

use crate::chdr::BYTES_PER_LINE;
use crate::error::{Error, Result};

/// Fraction of the receive buffer the producer may fill. Leaves headroom
/// for frames in flight while credit is on the wire.
pub const DEFAULT_RX_BUFF_FULLNESS: f64 = 0.90;

/// Credit reports per receive window.
pub const DEFAULT_RX_FC_REQUEST_FREQ: u32 = 32;

/// Flow-control-ack probes per transmit window.
pub const DEFAULT_TX_FC_RESPONSE_FREQ: u32 = 8;

/// Size the receive window in packets.
///
/// `fullness` must lie in `[0.01, 1.0]`; `max_window_pkts` caps the result
/// for devices with a bounded credit counter.
pub fn rx_window_packets(
    packet_bytes: usize,
    recv_buff_bytes: usize,
    fullness: Option<f64>,
    max_window_pkts: Option<usize>,
) -> Result<usize> {
    let fullness = fullness.unwrap_or(DEFAULT_RX_BUFF_FULLNESS);
    if !(0.01..=1.0).contains(&fullness) {
        return Err(Error::Value(format!(
            "recv_buff_fullness must be in [0.01, 1.0], got {fullness}"
        )));
    }
    if packet_bytes == 0 {
        return Err(Error::Value("packet size must be larger than zero".into()));
    }
    let mut window = (recv_buff_bytes as f64 * fullness) as usize / packet_bytes;
    if let Some(cap) = max_window_pkts {
        window = window.min(cap);
    }
    if window == 0 {
        return Err(Error::Value(format!(
            "recv buffer of {recv_buff_bytes} bytes cannot hold even one {packet_bytes} byte packet"
        )));
    }
    Ok(window)
}

/// How many consumed bytes between two upstream credit reports.
///
/// One report per `request_freq`-th of the window, measured from a full
/// window minus one packet so the producer never fully drains before the
/// first report can arrive. Never below one wire line.
pub fn rx_fc_interval_bytes(window_bytes: u32, packet_bytes: u32, request_freq: u32) -> u32 {
    let usable = window_bytes.saturating_sub(packet_bytes);
    (usable / request_freq.max(1)).max(BYTES_PER_LINE)
}

/// Size the transmit window in bytes.
///
/// Bounded by the downstream FIFO, by the physical link's own send
/// buffering, and by an optional user hint. A window larger than any of
/// these would just deadlock later.
pub fn tx_window_bytes(
    fifo_bytes: usize,
    link_send_buff_bytes: usize,
    hint_bytes: Option<usize>,
) -> Result<usize> {
    let mut window = fifo_bytes.min(link_send_buff_bytes);
    if let Some(hint) = hint_bytes {
        window = window.min(hint);
    }
    if window == 0 {
        return Err(Error::Value(
            "send window must be larger than zero".into(),
        ));
    }
    Ok(window)
}

/// How many sent bytes between two flow-control-ack probes from the device.
pub fn tx_fc_interval_bytes(window_bytes: u32, response_freq: u32) -> u32 {
    (window_bytes / response_freq.max(1)).max(BYTES_PER_LINE)
}
