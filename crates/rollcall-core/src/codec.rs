//! Fixed, versioned binary layout for stored embeddings.
//!
//! ```text
//! offset  size  field
//! 0       3     magic "RCE"
//! 3       1     layout version (1)
//! 4       1     element width in bytes (4 = f32, 8 = f64)
//! 5       4     dimension, u32 little-endian
//! 9       n·w   values, little-endian
//! ```
//!
//! Enrollment pipelines that produce double-precision vectors can store them
//! with width 8; they are narrowed to `f32` on decode.

use thiserror::Error;

use crate::types::Embedding;

pub const MAGIC: [u8; 3] = *b"RCE";
pub const VERSION: u8 = 1;
pub const HEADER_LEN: usize = 9;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("embedding blob too short: {0} bytes")]
    Truncated(usize),
    #[error("embedding blob has wrong magic")]
    BadMagic,
    #[error("unsupported embedding layout version {0}")]
    UnsupportedVersion(u8),
    #[error("unsupported element width {0}")]
    UnsupportedWidth(u8),
    #[error("embedding payload length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("embedding has zero dimensions")]
    Empty,
    #[error("embedding dimension {0} does not fit the u32 header field")]
    TooLarge(usize),
    #[error("invalid embedding value (NaN/Inf)")]
    NonFinite,
}

fn header(width: u8, dim: usize) -> Result<Vec<u8>, CodecError> {
    if dim == 0 {
        return Err(CodecError::Empty);
    }
    let dim = u32::try_from(dim).map_err(|_| CodecError::TooLarge(dim))?;
    let mut out = Vec::with_capacity(HEADER_LEN + dim as usize * width as usize);
    out.extend_from_slice(&MAGIC);
    out.push(VERSION);
    out.push(width);
    out.extend_from_slice(&dim.to_le_bytes());
    Ok(out)
}

/// Encode as single-precision values.
pub fn encode(embedding: &Embedding) -> Result<Vec<u8>, CodecError> {
    if !embedding.is_finite() {
        return Err(CodecError::NonFinite);
    }
    let mut out = header(4, embedding.dim())?;
    for v in &embedding.values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    Ok(out)
}

/// Encode double-precision values without narrowing them first.
pub fn encode_f64(values: &[f64]) -> Result<Vec<u8>, CodecError> {
    if values.iter().any(|v| !v.is_finite()) {
        return Err(CodecError::NonFinite);
    }
    let mut out = header(8, values.len())?;
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    Ok(out)
}

pub fn decode(blob: &[u8]) -> Result<Embedding, CodecError> {
    if blob.len() < HEADER_LEN {
        return Err(CodecError::Truncated(blob.len()));
    }
    if blob[..3] != MAGIC {
        return Err(CodecError::BadMagic);
    }
    if blob[3] != VERSION {
        return Err(CodecError::UnsupportedVersion(blob[3]));
    }
    let width = blob[4];
    if width != 4 && width != 8 {
        return Err(CodecError::UnsupportedWidth(width));
    }
    let dim = u32::from_le_bytes([blob[5], blob[6], blob[7], blob[8]]) as usize;
    if dim == 0 {
        return Err(CodecError::Empty);
    }

    let payload = &blob[HEADER_LEN..];
    let expected = dim * width as usize;
    if payload.len() != expected {
        return Err(CodecError::LengthMismatch {
            expected,
            actual: payload.len(),
        });
    }

    let mut values = Vec::with_capacity(dim);
    if width == 4 {
        for chunk in payload.chunks_exact(4) {
            values.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }
    } else {
        for chunk in payload.chunks_exact(8) {
            let mut arr = [0u8; 8];
            arr.copy_from_slice(chunk);
            values.push(f64::from_le_bytes(arr) as f32);
        }
    }

    let embedding = Embedding::new(values);
    if !embedding.is_finite() {
        return Err(CodecError::NonFinite);
    }
    Ok(embedding)
}
