//! Device-level glue: transport context, factory, and the stream facade.

pub mod context;
pub mod facade;
pub mod factory;

pub use context::DeviceTransportContext;
pub use facade::StreamDevice;
pub use factory::{LoopbackProvider, Transport, TransportKind, TransportProvider};

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One streamer channel: which registered block, which port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSpec {
    pub block: usize,
    #[serde(default)]
    pub port: usize,
}

/// Stream construction request.
///
/// `args` carries free-form tuning hints: `recv_buff_fullness`,
/// `max_recv_window`, `send_buff_size`, `rx_fc_request_freq`. Unknown keys
/// are ignored; malformed values fail construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamArgs {
    pub cpu_format: String,
    pub otw_format: String,
    pub channels: Vec<ChannelSpec>,
    /// Requested samples per packet; negotiation may lower it.
    pub spp: Option<usize>,
    #[serde(default)]
    pub args: HashMap<String, String>,
}

impl StreamArgs {
    pub fn new(cpu_format: &str, otw_format: &str, channels: Vec<ChannelSpec>) -> Self {
        Self {
            cpu_format: cpu_format.to_string(),
            otw_format: otw_format.to_string(),
            channels,
            spp: None,
            args: HashMap::new(),
        }
    }

    pub(crate) fn hint_f64(&self, key: &str) -> Result<Option<f64>> {
        self.args
            .get(key)
            .map(|v| {
                v.parse()
                    .map_err(|_| Error::Value(format!("bad value for {key}: {v:?}")))
            })
            .transpose()
    }

    pub(crate) fn hint_usize(&self, key: &str) -> Result<Option<usize>> {
        self.args
            .get(key)
            .map(|v| {
                v.parse()
                    .map_err(|_| Error::Value(format!("bad value for {key}: {v:?}")))
            })
            .transpose()
    }

    pub(crate) fn hint_u32(&self, key: &str) -> Result<Option<u32>> {
        self.args
            .get(key)
            .map(|v| {
                v.parse()
                    .map_err(|_| Error::Value(format!("bad value for {key}: {v:?}")))
            })
            .transpose()
    }
}
