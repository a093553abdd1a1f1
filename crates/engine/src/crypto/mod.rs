//! AEAD primitive, key schedule, and canonical value codec.
//!
//! This module is intentionally free of database and HTTP dependencies.
//! It provides the low-level operations the settings cache and processor
//! compose per covered property.

pub mod aead;
pub mod key;
pub mod serializer;

pub use aead::{AeadAes256CbcHmacSha256, IvStrategy};
pub use key::{DataEncryptionKey, ProtectedDataEncryptionKey, KEY_LEN};
pub use serializer::TypeMarker;
