//! Pluggable key and value serialization
//!
//! The map stores only bytes. Callers supply a key descriptor (deterministic
//! byte form, so equal keys always serialize identically) and a value
//! externalizer. Stock impls for raw bytes and UTF-8 strings cover the common
//! cases and the test suite.

use crate::error::{StoreError, StoreResult};

/// Deterministic serialization for keys. Two equal keys must produce
/// identical bytes; the byte form is the key's identity inside the map.
pub trait KeyDescriptor: Send + Sync {
    type Key;

    fn save(&self, key: &Self::Key) -> StoreResult<Vec<u8>>;
    fn read(&self, bytes: &[u8]) -> StoreResult<Self::Key>;
}

/// Serialization for values.
pub trait ValueExternalizer: Send + Sync {
    type Value;

    fn save(&self, out: &mut Vec<u8>, value: &Self::Value) -> StoreResult<()>;
    fn read(&self, bytes: &[u8]) -> StoreResult<Self::Value>;
}

/// Identity codec for `Vec<u8>` keys or values.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawBytesCodec;

impl KeyDescriptor for RawBytesCodec {
    type Key = Vec<u8>;

    fn save(&self, key: &Vec<u8>) -> StoreResult<Vec<u8>> {
        Ok(key.clone())
    }

    fn read(&self, bytes: &[u8]) -> StoreResult<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

impl ValueExternalizer for RawBytesCodec {
    type Value = Vec<u8>;

    fn save(&self, out: &mut Vec<u8>, value: &Vec<u8>) -> StoreResult<()> {
        out.extend_from_slice(value);
        Ok(())
    }

    fn read(&self, bytes: &[u8]) -> StoreResult<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

/// UTF-8 codec for `String` keys or values.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8Codec;

impl KeyDescriptor for Utf8Codec {
    type Key = String;

    fn save(&self, key: &String) -> StoreResult<Vec<u8>> {
        Ok(key.as_bytes().to_vec())
    }

    fn read(&self, bytes: &[u8]) -> StoreResult<String> {
        String::from_utf8(bytes.to_vec()).map_err(|e| StoreError::Io {
            path: None,
            kind: std::io::ErrorKind::InvalidData,
            message: format!("stored key is not valid UTF-8: {}", e),
        })
    }
}

impl ValueExternalizer for Utf8Codec {
    type Value = String;

    fn save(&self, out: &mut Vec<u8>, value: &String) -> StoreResult<()> {
        out.extend_from_slice(value.as_bytes());
        Ok(())
    }

    fn read(&self, bytes: &[u8]) -> StoreResult<String> {
        String::from_utf8(bytes.to_vec()).map_err(|e| StoreError::Io {
            path: None,
            kind: std::io::ErrorKind::InvalidData,
            message: format!("stored value is not valid UTF-8: {}", e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_bytes_roundtrip() {
        let codec = RawBytesCodec;
        let key = vec![0u8, 1, 254, 255];
        let bytes = KeyDescriptor::save(&codec, &key).unwrap();
        assert_eq!(KeyDescriptor::read(&codec, &bytes).unwrap(), key);
    }

    #[test]
    fn test_utf8_roundtrip() {
        let codec = Utf8Codec;
        let mut out = Vec::new();
        ValueExternalizer::save(&codec, &mut out, &"grüße".to_string()).unwrap();
        assert_eq!(ValueExternalizer::read(&codec, &out).unwrap(), "grüße");
    }

    #[test]
    fn test_utf8_rejects_invalid_bytes() {
        let codec = Utf8Codec;
        let result: StoreResult<String> = ValueExternalizer::read(&codec, &[0xFF, 0xFE]);
        assert!(result.is_err());
    }
}
