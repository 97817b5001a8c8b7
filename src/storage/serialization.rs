//! Serialization utilities: bincode for binary bodies, JSON for metadata/config.

use crate::error::{Result, VexError};
use serde::{Deserialize, Serialize};

/// Encode data to bincode bytes.
pub fn to_bincode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| VexError::Serialization(e.to_string()))
}

/// Decode data from bincode bytes.
pub fn from_bincode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| VexError::Serialization(e.to_string()))
}

/// Encode data to pretty JSON bytes.
pub fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(value).map_err(|e| VexError::Serialization(e.to_string()))
}

/// Decode data from JSON bytes.
pub fn from_json<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| VexError::Serialization(e.to_string()))
}

/// Checksum used by every on-disk frame and file.
pub fn checksum(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        id: u64,
        data: Vec<f32>,
        name: String,
    }

    #[test]
    fn test_bincode_roundtrip() {
        let s = Sample {
            id: 42,
            data: vec![1.0, 2.0, 3.0],
            name: "test".to_string(),
        };
        let bytes = to_bincode(&s).unwrap();
        let decoded: Sample = from_bincode(&bytes).unwrap();
        assert_eq!(decoded, s);
    }

    #[test]
    fn test_json_is_readable() {
        let s = Sample {
            id: 1,
            data: vec![0.5],
            name: "hello".to_string(),
        };
        let bytes = to_json(&s).unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains("\"name\": \"hello\""));
        let decoded: Sample = from_json(&bytes).unwrap();
        assert_eq!(decoded.id, 1);
    }

    #[test]
    fn test_garbage_is_a_serialization_error() {
        let err = from_json::<Sample>(b"{not json").unwrap_err();
        assert!(matches!(err, VexError::Serialization(_)));
        assert!(from_bincode::<Sample>(&[1, 2]).is_err());
    }
}
