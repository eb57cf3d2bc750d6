//! Per-device transport bookkeeping.
//!
//! Crossbar route allocation is shared state touched by every stream
//! construction; it lives behind one explicit context object with its own
//! lock rather than a process-wide singleton. Construction is not a hot
//! path, the lock is never held on the data path.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use crate::addr::{EndpointId, StreamAddress};
use crate::error::{Error, Result};

/// Crossbar ports are 4 bits wide.
const MAX_HOST_PORTS: u8 = 16;

struct ContextInner {
    /// Next free host-side crossbar port, per device index.
    next_host_port: HashMap<u8, u8>,
    routes: Vec<StreamAddress>,
}

pub struct DeviceTransportContext {
    num_devices: usize,
    inner: Mutex<ContextInner>,
}

impl DeviceTransportContext {
    pub fn new(num_devices: usize) -> Self {
        Self {
            num_devices,
            inner: Mutex::new(ContextInner {
                next_host_port: HashMap::new(),
                routes: Vec::new(),
            }),
        }
    }

    /// Allocate a host-side endpoint and route to `device_endpoint`.
    ///
    /// Fails with `AddressResolution` for device indices this context does
    /// not manage, and `ResourceExhausted` once the device's host-facing
    /// crossbar ports are all taken.
    pub fn allocate_route(&self, device_endpoint: EndpointId) -> Result<StreamAddress> {
        if device_endpoint.device as usize >= self.num_devices {
            return Err(Error::AddressResolution(format!(
                "no device {} in this context ({} devices)",
                device_endpoint.device, self.num_devices
            )));
        }
        let mut inner = self.inner.lock().expect("transport context poisoned");
        let port = inner
            .next_host_port
            .entry(device_endpoint.device)
            .or_insert(0);
        if *port >= MAX_HOST_PORTS {
            return Err(Error::ResourceExhausted(format!(
                "all {MAX_HOST_PORTS} host crossbar ports on device {} in use",
                device_endpoint.device
            )));
        }
        let host = EndpointId::new(device_endpoint.device, *port, 0);
        *port += 1;
        let route = StreamAddress::new(host, device_endpoint);
        inner.routes.push(route);
        debug!(%route, "allocated crossbar route");
        Ok(route)
    }

    pub fn num_routes(&self) -> usize {
        self.inner
            .lock()
            .expect("transport context poisoned")
            .routes
            .len()
    }
}
