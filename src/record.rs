//! Vector records and input validation

use crate::error::{Result, VexError};
use serde::{Deserialize, Serialize};

/// A stored vector together with its opaque payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: u64,
    pub vector: Vec<f32>,
    #[serde(default)]
    pub payload: Vec<u8>,
}

impl VectorRecord {
    pub fn new(id: u64, vector: Vec<f32>) -> Self {
        Self {
            id,
            vector,
            payload: Vec::new(),
        }
    }

    pub fn with_payload(id: u64, vector: Vec<f32>, payload: Vec<u8>) -> Self {
        Self {
            id,
            vector,
            payload,
        }
    }

    /// Approximate in-memory footprint, used for flush accounting.
    pub fn encoded_len(&self) -> usize {
        8 + self.vector.len() * 4 + 4 + self.payload.len()
    }
}

/// A ranked search result. `score` is a similarity for dot/cosine and a
/// distance for L2.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: u64,
    pub score: f32,
}

impl SearchHit {
    pub fn new(id: u64, score: f32) -> Self {
        Self { id, score }
    }
}

/// Reject vectors with the wrong dimension or non-finite components.
pub fn validate_vector(vector: &[f32], dimension: usize) -> Result<()> {
    if vector.len() != dimension {
        return Err(VexError::DimensionMismatch {
            expected: dimension,
            actual: vector.len(),
        });
    }
    if let Some(pos) = vector.iter().position(|x| !x.is_finite()) {
        return Err(VexError::InvalidVector {
            reason: format!("component {} is not finite", pos),
        });
    }
    Ok(())
}

/// Parse a vector from a comma-separated string, optionally wrapped in brackets.
pub fn parse_vector(s: &str) -> Result<Vec<f32>> {
    s.trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split(',')
        .map(str::trim)
        .filter(|x| !x.is_empty())
        .map(|x| {
            x.parse::<f32>().map_err(|_| VexError::InvalidVector {
                reason: format!("Invalid float: {}", x),
            })
        })
        .collect()
}
