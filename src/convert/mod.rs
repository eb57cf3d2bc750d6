//! Sample-format converter registry.
//!
//! A converter is chosen by `(otw_format, cpu_format, endianness)` exactly
//! once per streamer and reused for every buffer; the data path never
//! re-resolves. Numeric conversion itself lives with the application or a
//! SIMD crate; this registry carries the item-size and scale metadata the
//! streaming core needs for packet sizing and credit accounting.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::chdr::Endianness;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConverterId {
    /// On-the-wire item format, e.g. `"sc16"`.
    pub otw_format: String,
    /// Application-side item format, e.g. `"fc32"`.
    pub cpu_format: String,
    pub endianness: Endianness,
}

impl ConverterId {
    pub fn new(otw_format: &str, cpu_format: &str, endianness: Endianness) -> Self {
        Self {
            otw_format: otw_format.to_string(),
            cpu_format: cpu_format.to_string(),
            endianness,
        }
    }
}

impl std::fmt::Display for ConverterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}->{} ({:?}-endian wire)",
            self.otw_format, self.cpu_format, self.endianness
        )
    }
}

pub trait Converter: Send + Sync {
    /// Bytes per item on the wire.
    fn otw_bytes_per_item(&self) -> usize;

    /// Bytes per item on the application side.
    fn cpu_bytes_per_item(&self) -> usize;

    /// Full-scale factor between wire and application representation.
    fn scale_factor(&self) -> f64;
}

impl std::fmt::Debug for dyn Converter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Converter")
            .field("otw_bytes_per_item", &self.otw_bytes_per_item())
            .field("cpu_bytes_per_item", &self.cpu_bytes_per_item())
            .field("scale_factor", &self.scale_factor())
            .finish()
    }
}

/// Converter defined entirely by its size/scale descriptor.
struct DescribedConverter {
    otw_bytes: usize,
    cpu_bytes: usize,
    scale: f64,
}

impl Converter for DescribedConverter {
    fn otw_bytes_per_item(&self) -> usize {
        self.otw_bytes
    }
    fn cpu_bytes_per_item(&self) -> usize {
        self.cpu_bytes
    }
    fn scale_factor(&self) -> f64 {
        self.scale
    }
}

pub struct ConverterRegistry {
    entries: RwLock<HashMap<ConverterId, Arc<dyn Converter>>>,
}

impl Default for ConverterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConverterRegistry {
    /// Registry preloaded with the stock sc16-wire entries.
    pub fn new() -> Self {
        let mut entries: HashMap<ConverterId, Arc<dyn Converter>> = HashMap::new();
        // Complex int16 on the wire; i16 full scale.
        let stock: [(&str, usize, f64); 3] = [
            ("sc16", 4, 1.0),
            ("fc32", 8, 1.0 / 32767.0),
            ("fc64", 16, 1.0 / 32767.0),
        ];
        for endianness in [Endianness::Big, Endianness::Little] {
            for (cpu_format, cpu_bytes, scale) in stock {
                entries.insert(
                    ConverterId::new("sc16", cpu_format, endianness),
                    Arc::new(DescribedConverter {
                        otw_bytes: 4,
                        cpu_bytes,
                        scale,
                    }),
                );
            }
        }
        Self {
            entries: RwLock::new(entries),
        }
    }

    pub fn register(&self, id: ConverterId, converter: Arc<dyn Converter>) {
        self.entries
            .write()
            .expect("converter registry poisoned")
            .insert(id, converter);
    }

    pub fn resolve(&self, id: &ConverterId) -> Result<Arc<dyn Converter>> {
        self.entries
            .read()
            .expect("converter registry poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| {
                Error::IncompatibleStreamSignature(format!("no converter for {id}"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stock_converters_resolve() {
        let registry = ConverterRegistry::new();
        let c = registry
            .resolve(&ConverterId::new("sc16", "fc32", Endianness::Big))
            .unwrap();
        assert_eq!(c.otw_bytes_per_item(), 4);
        assert_eq!(c.cpu_bytes_per_item(), 8);
    }

    #[test]
    fn test_unknown_pair_is_signature_error() {
        let registry = ConverterRegistry::new();
        let err = registry
            .resolve(&ConverterId::new("sc8", "fc32", Endianness::Big))
            .unwrap_err();
        assert!(matches!(err, Error::IncompatibleStreamSignature(_)));
    }

    #[test]
    fn test_custom_registration() {
        let registry = ConverterRegistry::new();
        let id = ConverterId::new("sc8", "fc32", Endianness::Little);
        registry.register(
            id.clone(),
            Arc::new(DescribedConverter {
                otw_bytes: 2,
                cpu_bytes: 8,
                scale: 1.0 / 127.0,
            }),
        );
        assert_eq!(registry.resolve(&id).unwrap().otw_bytes_per_item(), 2);
    }
}
