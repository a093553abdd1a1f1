//! Canonical codec between JSON scalars and typed byte strings.
//!
//! Every encrypted value carries a one-byte type marker so the original JSON
//! type can be reconstructed on decrypt:
//!
//! | JSON type | Marker | Encoding |
//! |-----------|--------|----------|
//! | boolean   | 2      | 1 byte, `0x00`/`0x01` |
//! | float     | 3      | IEEE-754 binary64, little-endian |
//! | integer   | 4      | i64 two's-complement, little-endian |
//! | string    | 5      | UTF-8, no length prefix or terminator |
//!
//! Marker `1` is reserved for null and never emitted; the processor skips
//! null values instead of passing them here. Arrays and objects never reach
//! the codec either — the processor descends into them.

use common::EncryptionError;
use serde_json::Value;

/// Reserved marker for null. Never emitted.
pub const MARKER_NULL: u8 = 1;

/// One-byte tag for the original JSON type of an encrypted scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TypeMarker {
    Boolean = 2,
    Double = 3,
    Long = 4,
    String = 5,
}

impl TypeMarker {
    /// Parse a marker byte read back from a ciphertext payload.
    ///
    /// # Errors
    ///
    /// Returns [`EncryptionError::CryptoIntegrity`] for any byte outside
    /// `{2, 3, 4, 5}` — including the reserved null marker.
    pub fn from_byte(byte: u8) -> Result<Self, EncryptionError> {
        match byte {
            2 => Ok(TypeMarker::Boolean),
            3 => Ok(TypeMarker::Double),
            4 => Ok(TypeMarker::Long),
            5 => Ok(TypeMarker::String),
            other => Err(EncryptionError::crypto_integrity(format!(
                "invalid type marker byte: {other}"
            ))),
        }
    }
}

/// Serialize a JSON scalar to its marker and canonical byte encoding.
///
/// # Errors
///
/// Returns [`EncryptionError::UnsupportedValue`] for non-scalar values, for
/// integers outside the i64 range, and for numbers representable neither as
/// i64 nor f64.
pub fn serialize(value: &Value) -> Result<(TypeMarker, Vec<u8>), EncryptionError> {
    match value {
        Value::Bool(b) => Ok((TypeMarker::Boolean, vec![u8::from(*b)])),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok((TypeMarker::Long, i.to_le_bytes().to_vec()))
            } else if n.as_u64().is_some() {
                Err(EncryptionError::unsupported_value(format!(
                    "integer {n} is outside the int64 range"
                )))
            } else if let Some(f) = n.as_f64() {
                Ok((TypeMarker::Double, f.to_le_bytes().to_vec()))
            } else {
                Err(EncryptionError::unsupported_value(format!(
                    "number {n} has no canonical encoding"
                )))
            }
        }
        Value::String(s) => Ok((TypeMarker::String, s.as_bytes().to_vec())),
        other => Err(EncryptionError::unsupported_value(format!(
            "cannot serialize a JSON {} as a scalar",
            json_type_name(other)
        ))),
    }
}

/// Reconstruct a JSON scalar from its marker and canonical bytes.
///
/// # Errors
///
/// Returns [`EncryptionError::CryptoIntegrity`] when the byte payload does
/// not match the marker's fixed shape (a decrypted payload of the wrong
/// length means the writer and reader disagree on the contract).
pub fn deserialize(marker: TypeMarker, bytes: &[u8]) -> Result<Value, EncryptionError> {
    match marker {
        TypeMarker::Boolean => match bytes {
            [0x00] => Ok(Value::Bool(false)),
            [0x01] => Ok(Value::Bool(true)),
            _ => Err(EncryptionError::crypto_integrity(
                "boolean payload must be a single 0x00/0x01 byte",
            )),
        },
        TypeMarker::Long => {
            let arr: [u8; 8] = bytes.try_into().map_err(|_| {
                EncryptionError::crypto_integrity("int64 payload must be exactly 8 bytes")
            })?;
            Ok(Value::from(i64::from_le_bytes(arr)))
        }
        TypeMarker::Double => {
            let arr: [u8; 8] = bytes.try_into().map_err(|_| {
                EncryptionError::crypto_integrity("float payload must be exactly 8 bytes")
            })?;
            let f = f64::from_le_bytes(arr);
            serde_json::Number::from_f64(f)
                .map(Value::Number)
                .ok_or_else(|| {
                    EncryptionError::crypto_integrity("float payload decodes to a non-finite value")
                })
        }
        TypeMarker::String => {
            let s = std::str::from_utf8(bytes).map_err(|_| {
                EncryptionError::crypto_integrity("string payload is not valid UTF-8")
            })?;
            Ok(Value::String(s.to_owned()))
        }
    }
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
