//! Crossbar stream addressing.
//!
//! Every endpoint on the device crossbar is identified by a
//! (device, crossbar port, block port) triple packed into 16 bits. A
//! `StreamAddress` pairs a source and destination endpoint and packs into
//! the 32-bit stream id carried in packet headers. Addresses are immutable
//! once a transport is built; `reversed()` forms the return path used by
//! flow-control and ack packets.

use std::fmt;

/// One endpoint on the crossbar: 8 bits of device index, 4 bits of
/// crossbar port, 4 bits of block port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId {
    pub device: u8,
    pub crossbar_port: u8,
    pub block_port: u8,
}

impl EndpointId {
    pub fn new(device: u8, crossbar_port: u8, block_port: u8) -> Self {
        Self {
            device,
            crossbar_port: crossbar_port & 0x0F,
            block_port: block_port & 0x0F,
        }
    }

    /// Pack to the 16-bit wire representation.
    pub fn to_u16(self) -> u16 {
        (self.device as u16) << 8
            | (self.crossbar_port as u16 & 0x0F) << 4
            | (self.block_port as u16 & 0x0F)
    }

    pub fn from_u16(v: u16) -> Self {
        Self {
            device: (v >> 8) as u8,
            crossbar_port: ((v >> 4) & 0x0F) as u8,
            block_port: (v & 0x0F) as u8,
        }
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}.{}", self.device, self.crossbar_port, self.block_port)
    }
}

/// A directed route across the crossbar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamAddress {
    pub src: EndpointId,
    pub dst: EndpointId,
}

impl StreamAddress {
    pub fn new(src: EndpointId, dst: EndpointId) -> Self {
        Self { src, dst }
    }

    /// The return path: destination becomes source and vice versa.
    pub fn reversed(self) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
        }
    }

    /// Pack to the 32-bit stream id (source in the high half).
    pub fn stream_id(self) -> u32 {
        (self.src.to_u16() as u32) << 16 | self.dst.to_u16() as u32
    }

    pub fn from_stream_id(sid: u32) -> Self {
        Self {
            src: EndpointId::from_u16((sid >> 16) as u16),
            dst: EndpointId::from_u16(sid as u16),
        }
    }
}

impl fmt::Display for StreamAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}>{}", self.src, self.dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_roundtrip() {
        let ep = EndpointId::new(2, 7, 1);
        assert_eq!(EndpointId::from_u16(ep.to_u16()), ep);
        assert_eq!(ep.to_string(), "2:7.1");
    }

    #[test]
    fn test_stream_id_roundtrip() {
        let addr = StreamAddress::new(EndpointId::new(0, 0, 2), EndpointId::new(1, 3, 0));
        assert_eq!(StreamAddress::from_stream_id(addr.stream_id()), addr);
    }

    #[test]
    fn test_reversed_swaps_endpoints() {
        let addr = StreamAddress::new(EndpointId::new(0, 1, 0), EndpointId::new(1, 2, 3));
        let rev = addr.reversed();
        assert_eq!(rev.src, addr.dst);
        assert_eq!(rev.dst, addr.src);
        assert_eq!(rev.reversed(), addr);
    }

    #[test]
    fn test_port_fields_masked_to_four_bits() {
        let ep = EndpointId::new(1, 0x1F, 0x22);
        assert_eq!(ep.crossbar_port, 0x0F);
        assert_eq!(ep.block_port, 0x02);
    }
}
