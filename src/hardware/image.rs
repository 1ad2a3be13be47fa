//! Raw image arrays produced by a capture.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Portable element type tag.
///
/// The string forms follow the numpy dtype names so that a client in any
/// language can map them onto its own array type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    /// `uint8`
    Uint8,
    /// `uint16`
    Uint16,
    /// `int32`
    Int32,
    /// `float32`
    Float32,
}

impl DType {
    /// Size of one element in bytes.
    #[must_use]
    pub fn size_of(self) -> usize {
        match self {
            DType::Uint8 => 1,
            DType::Uint16 => 2,
            DType::Int32 | DType::Float32 => 4,
        }
    }

    /// Portable tag, e.g. `uint16`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            DType::Uint8 => "uint8",
            DType::Uint16 => "uint16",
            DType::Int32 => "int32",
            DType::Float32 => "float32",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owned pixel storage, one variant per element type.
#[derive(Debug, Clone, PartialEq)]
pub enum PixelBuffer {
    /// 8-bit unsigned pixels.
    Uint8(Vec<u8>),
    /// 16-bit unsigned pixels.
    Uint16(Vec<u16>),
    /// 32-bit signed pixels.
    Int32(Vec<i32>),
    /// 32-bit float pixels.
    Float32(Vec<f32>),
}

impl PixelBuffer {
    /// Element type of the buffer.
    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            PixelBuffer::Uint8(_) => DType::Uint8,
            PixelBuffer::Uint16(_) => DType::Uint16,
            PixelBuffer::Int32(_) => DType::Int32,
            PixelBuffer::Float32(_) => DType::Float32,
        }
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            PixelBuffer::Uint8(v) => v.len(),
            PixelBuffer::Uint16(v) => v.len(),
            PixelBuffer::Int32(v) => v.len(),
            PixelBuffer::Float32(v) => v.len(),
        }
    }

    /// Whether the buffer has no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Little-endian bytes of every element, in storage order.
    #[must_use]
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len() * self.dtype().size_of());
        match self {
            PixelBuffer::Uint8(v) => out.extend_from_slice(v),
            PixelBuffer::Uint16(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            PixelBuffer::Int32(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            PixelBuffer::Float32(v) => {
                v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes()))
            }
        }
        out
    }

    /// Rebuild a buffer from little-endian bytes.
    ///
    /// Fails if the byte count is not a whole number of elements.
    pub fn from_le_bytes(dtype: DType, bytes: &[u8]) -> Result<Self, String> {
        let size = dtype.size_of();
        if bytes.len() % size != 0 {
            return Err(format!(
                "{} bytes is not a multiple of the {dtype} element size ({size})",
                bytes.len()
            ));
        }
        let buffer = match dtype {
            DType::Uint8 => PixelBuffer::Uint8(bytes.to_vec()),
            DType::Uint16 => PixelBuffer::Uint16(
                bytes
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]))
                    .collect(),
            ),
            DType::Int32 => PixelBuffer::Int32(
                bytes
                    .chunks_exact(4)
                    .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            DType::Float32 => PixelBuffer::Float32(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
        };
        Ok(buffer)
    }
}

/// One freshly captured image: row-major pixels plus their shape.
///
/// Produced per acquisition and moved straight into the encoder.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquiredImage {
    pixels: PixelBuffer,
    shape: Vec<usize>,
}

impl AcquiredImage {
    /// Wrap a buffer with its shape (rows, cols, [channels]).
    ///
    /// Fails if the element count does not match the shape.
    pub fn new(pixels: PixelBuffer, shape: Vec<usize>) -> Result<Self, String> {
        if shape.is_empty() || shape.contains(&0) {
            return Err(format!("invalid image shape {shape:?}"));
        }
        let expected = shape
            .iter()
            .try_fold(1_usize, |acc, &dim| acc.checked_mul(dim))
            .ok_or_else(|| format!("image shape {shape:?} overflows"))?;
        if pixels.len() != expected {
            return Err(format!(
                "buffer holds {} elements but shape {shape:?} needs {expected}",
                pixels.len()
            ));
        }
        Ok(Self { pixels, shape })
    }

    /// Row-major shape.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Element type of the pixels.
    #[must_use]
    pub fn dtype(&self) -> DType {
        self.pixels.dtype()
    }

    /// Pixel storage.
    #[must_use]
    pub fn pixels(&self) -> &PixelBuffer {
        &self.pixels
    }

    /// Split into pixels and shape.
    #[must_use]
    pub fn into_parts(self) -> (PixelBuffer, Vec<usize>) {
        (self.pixels, self.shape)
    }
}
