//! Transport creation.
//!
//! A transport provider turns an allocated crossbar route into a live
//! bidirectional link. Real drivers implement [`TransportProvider`] over
//! UDP sockets or DMA rings; the in-tree [`LoopbackProvider`] builds
//! in-memory link pairs and keeps the device-side ends reachable, which is
//! what the integration tests and self-contained use run on.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::addr::StreamAddress;
use crate::chdr::Endianness;
use crate::error::{Error, Result};
use crate::link::{ChannelLink, DataLink, LinkConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    RxData,
    TxData,
    AsyncMsg,
}

/// A live transport: the host-side link plus its negotiated parameters.
pub struct Transport {
    pub link: Arc<dyn DataLink>,
    /// Host-to-device direction.
    pub send_addr: StreamAddress,
    /// Device-to-host direction.
    pub recv_addr: StreamAddress,
    pub endianness: Endianness,
    pub send_buff_bytes: usize,
    pub recv_buff_bytes: usize,
}

pub trait TransportProvider: Send + Sync {
    fn make_transport(&self, route: StreamAddress, kind: TransportKind) -> Result<Transport>;
}

/// In-memory provider with a finite transport budget.
pub struct LoopbackProvider {
    config: LinkConfig,
    endianness: Endianness,
    budget: Mutex<usize>,
    /// Device-side link ends, keyed by the route's stream id.
    device_ends: Mutex<HashMap<u32, Arc<ChannelLink>>>,
}

impl LoopbackProvider {
    pub fn new(config: LinkConfig, endianness: Endianness, budget: usize) -> Self {
        Self {
            config,
            endianness,
            budget: Mutex::new(budget),
            device_ends: Mutex::new(HashMap::new()),
        }
    }

    /// The device-side end of a previously created transport. Tests drive
    /// the simulated device through this.
    pub fn device_end(&self, route: StreamAddress) -> Option<Arc<ChannelLink>> {
        self.device_ends
            .lock()
            .expect("loopback ends poisoned")
            .get(&route.stream_id())
            .cloned()
    }
}

impl TransportProvider for LoopbackProvider {
    fn make_transport(&self, route: StreamAddress, kind: TransportKind) -> Result<Transport> {
        {
            let mut budget = self.budget.lock().expect("loopback budget poisoned");
            if *budget == 0 {
                return Err(Error::ResourceExhausted(
                    "loopback transport budget exhausted".into(),
                ));
            }
            *budget -= 1;
        }
        let (host, device) = ChannelLink::pair(self.config);
        let send_buff_bytes = host.send_buff_bytes();
        let recv_buff_bytes = host.recv_buff_bytes();
        self.device_ends
            .lock()
            .expect("loopback ends poisoned")
            .insert(route.stream_id(), Arc::new(device));
        debug!(%route, ?kind, "loopback transport created");
        Ok(Transport {
            link: Arc::new(host),
            send_addr: route,
            recv_addr: route.reversed(),
            endianness: self.endianness,
            send_buff_bytes,
            recv_buff_bytes,
        })
    }
}
