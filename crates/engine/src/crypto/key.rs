//! Data-encryption-key material and the local key schedule.
//!
//! A [`DataEncryptionKey`] holds the 32-byte root key exactly as unwrapped by
//! the master-key store. Before any field is encrypted, the root key passes
//! through the key schedule to produce a [`ProtectedDataEncryptionKey`]: three
//! sub-keys (encryption, MAC, IV derivation) obtained by keying HMAC-SHA-256
//! with the root key over distinct domain-separation labels.
//!
//! # Security invariants
//!
//! - Key bytes are zeroized on drop and never appear in `Debug` output.
//! - The root key is dropped as soon as the schedule has run; only the
//!   derived sub-keys live in the settings cache.

use common::EncryptionError;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Byte length of the root data-encryption key (AES-256).
pub const KEY_LEN: usize = 32;

/// Domain-separation labels for the key schedule. Each sub-key is
/// `HMAC-SHA-256(root_key, label)`.
const ENCRYPTION_KEY_LABEL: &[u8] =
    b"field encryption key|AEAD_AES_256_CBC_HMAC_SHA_256|key length:256";
const MAC_KEY_LABEL: &[u8] = b"field MAC key|AEAD_AES_256_CBC_HMAC_SHA_256|key length:256";
const IV_KEY_LABEL: &[u8] = b"field IV derivation key|AEAD_AES_256_CBC_HMAC_SHA_256|key length:256";

/// Fixed-size key buffer, overwritten with zeroes on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct KeyBytes([u8; KEY_LEN]);

/// The plaintext root key, as unwrapped from the master-key store.
pub struct DataEncryptionKey {
    bytes: KeyBytes,
}

impl std::fmt::Debug for DataEncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.write_str("DataEncryptionKey([REDACTED])")
    }
}

impl DataEncryptionKey {
    /// Wrap unwrapped key bytes, validating the length.
    ///
    /// # Errors
    ///
    /// Returns [`EncryptionError::KeyUnwrapFailed`] if the slice is not
    /// exactly [`KEY_LEN`] bytes.
    pub fn from_bytes(key_bytes: &[u8]) -> Result<Self, EncryptionError> {
        if key_bytes.len() != KEY_LEN {
            return Err(EncryptionError::KeyUnwrapFailed(format!(
                "unwrapped key has invalid length: expected {KEY_LEN} bytes, got {}",
                key_bytes.len()
            )));
        }
        let mut buf = [0u8; KEY_LEN];
        buf.copy_from_slice(key_bytes);
        Ok(Self {
            bytes: KeyBytes(buf),
        })
    }
}

/// The derived sub-keys used by the AEAD primitive.
///
/// Shared read-only across all documents using the same data-encryption key;
/// the settings cache hands out `Arc` references to one instance per entry.
#[derive(Clone)]
pub struct ProtectedDataEncryptionKey {
    enc_key: KeyBytes,
    mac_key: KeyBytes,
    iv_key: KeyBytes,
}

impl std::fmt::Debug for ProtectedDataEncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ProtectedDataEncryptionKey([REDACTED])")
    }
}

impl ProtectedDataEncryptionKey {
    /// Run the key schedule over a root key.
    pub fn derive(root: &DataEncryptionKey) -> Self {
        Self {
            enc_key: derive_sub_key(&root.bytes.0, ENCRYPTION_KEY_LABEL),
            mac_key: derive_sub_key(&root.bytes.0, MAC_KEY_LABEL),
            iv_key: derive_sub_key(&root.bytes.0, IV_KEY_LABEL),
        }
    }

    pub(crate) fn encryption_key(&self) -> &[u8; KEY_LEN] {
        &self.enc_key.0
    }

    pub(crate) fn mac_key(&self) -> &[u8; KEY_LEN] {
        &self.mac_key.0
    }

    pub(crate) fn iv_key(&self) -> &[u8; KEY_LEN] {
        &self.iv_key.0
    }
}

fn derive_sub_key(root: &[u8; KEY_LEN], label: &[u8]) -> KeyBytes {
    // HMAC accepts keys of any length; KEY_LEN is always valid.
    let mut mac = Hmac::<Sha256>::new_from_slice(root).expect("HMAC accepts 32-byte keys");
    mac.update(label);
    let digest = mac.finalize().into_bytes();
    let mut out = [0u8; KEY_LEN];
    out.copy_from_slice(&digest);
    KeyBytes(out)
}
