//! Vector quantization at the build boundary.
//!
//! A quantizer rewrites full-precision vectors into a compact encoding
//! before they are staged for the native library. The build pipeline is
//! agnostic to the scheme; it only consults the [`QuantizationState`] for
//! output geometry and the optional trained template.

use crate::engine::VectorDataType;
use crate::error::{KnnError, KnnResult};

/// Output geometry of a quantization scheme, plus its trained artifacts.
#[derive(Debug, Clone)]
pub struct QuantizationState {
    /// Dimensionality of the encoded vectors (bits for binary encodings).
    pub dimensions: usize,
    /// Bytes per encoded vector.
    pub bytes_per_vector: usize,
    /// Element type of the encoded vectors.
    pub data_type: VectorDataType,
    /// Trained model blob to build the index from, if the scheme needs one.
    pub template: Option<Vec<u8>>,
}

/// Encodes full-precision vectors into the compact form described by
/// [`Quantizer::state`].
pub trait Quantizer: Send + Sync {
    fn state(&self) -> &QuantizationState;

    /// Encode one packed vector into `encoded`, replacing its contents.
    ///
    /// # Errors
    ///
    /// Returns [`KnnError::Quantization`] when the input cannot be encoded.
    fn quantize(&self, raw: &[u8], encoded: &mut Vec<u8>) -> KnnResult<()>;
}

/// One-bit scalar quantizer: each float maps to a single sign bit.
///
/// Mostly useful in tests and as the reference implementation of the
/// [`Quantizer`] contract.
pub struct BinaryQuantizer {
    state: QuantizationState,
}

impl BinaryQuantizer {
    /// # Errors
    ///
    /// Returns [`KnnError::InvalidConfig`] unless `dimensions` is a
    /// positive multiple of 8.
    pub fn new(dimensions: usize) -> KnnResult<Self> {
        if dimensions == 0 || dimensions % 8 != 0 {
            return Err(KnnError::InvalidConfig(format!(
                "binary quantization requires a positive multiple of 8 dimensions, got {dimensions}"
            )));
        }
        Ok(Self {
            state: QuantizationState {
                dimensions,
                bytes_per_vector: dimensions / 8,
                data_type: VectorDataType::Binary,
                template: None,
            },
        })
    }
}

impl Quantizer for BinaryQuantizer {
    fn state(&self) -> &QuantizationState {
        &self.state
    }

    fn quantize(&self, raw: &[u8], encoded: &mut Vec<u8>) -> KnnResult<()> {
        if raw.len() != self.state.dimensions * 4 {
            return Err(KnnError::Quantization(format!(
                "expected {} float bytes, got {}",
                self.state.dimensions * 4,
                raw.len()
            )));
        }
        encoded.clear();
        encoded.resize(self.state.bytes_per_vector, 0);
        for (i, chunk) in raw.chunks_exact(4).enumerate() {
            let value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            if value > 0.0 {
                encoded[i / 8] |= 1 << (7 - i % 8);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pack_floats(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn sign_bits_packed_msb_first() {
        let quantizer = BinaryQuantizer::new(8).unwrap();
        let mut encoded = Vec::new();
        quantizer
            .quantize(
                &pack_floats(&[1.0, -1.0, 0.5, 0.0, -2.0, 3.0, -0.1, 9.0]),
                &mut encoded,
            )
            .unwrap();
        assert_eq!(encoded, vec![0b1010_0101]);
    }

    #[test]
    fn rejects_non_multiple_of_eight() {
        assert!(BinaryQuantizer::new(12).is_err());
        assert!(BinaryQuantizer::new(0).is_err());
    }

    #[test]
    fn rejects_wrong_input_length() {
        let quantizer = BinaryQuantizer::new(8).unwrap();
        let mut encoded = Vec::new();
        assert!(matches!(
            quantizer.quantize(&[0u8; 4], &mut encoded),
            Err(KnnError::Quantization(_))
        ));
    }
}
