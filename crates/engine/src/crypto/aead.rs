//! AEAD_AES_256_CBC_HMAC_SHA_256 encryption and decryption of field values.
//!
//! The construction is AES-256-CBC composed with HMAC-SHA-256 under an
//! encrypt-then-MAC discipline. The two IV strategies share the key schedule:
//!
//! - **Deterministic**: the IV is an HMAC over the plaintext, so identical
//!   plaintexts under the same key yield identical ciphertexts. Required for
//!   equality predicates over encrypted properties.
//! - **Randomized**: the IV comes from the OS CSPRNG; every call produces a
//!   fresh ciphertext.
//!
//! # Ciphertext layout
//!
//! ```text
//! ┌─────────┬─────────┬──────────────────────┬─────────┐
//! │ Version │   IV    │  AES-256-CBC output  │   Tag   │
//! │ 1 byte  │ 16 bytes│  PKCS#7, N blocks    │ 32 bytes│
//! └─────────┴─────────┴──────────────────────┴─────────┘
//! ```
//!
//! The tag is HMAC-SHA-256 over `version || iv || cbc_output` and is compared
//! in constant time on decrypt. This layer has no awareness of JSON or type
//! markers.

use aes::Aes256;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use common::EncryptionError;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::sync::Arc;
use subtle::ConstantTimeEq;

use super::key::ProtectedDataEncryptionKey;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Current algorithm version byte, first byte of every ciphertext.
pub const ALGORITHM_VERSION: u8 = 0x01;

/// Byte length of the CBC initialization vector.
pub const IV_LEN: usize = 16;

/// Byte length of the HMAC-SHA-256 authentication tag.
pub const TAG_LEN: usize = 32;

/// Smallest valid ciphertext: version + IV + one cipher block + tag.
pub const MIN_CIPHERTEXT_LEN: usize = 1 + IV_LEN + 16 + TAG_LEN;

/// How the initialization vector is produced for each encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IvStrategy {
    /// `iv = HMAC-SHA-256(iv_key, plaintext)` truncated to [`IV_LEN`].
    DeterministicFromMac,
    /// [`IV_LEN`] bytes from the OS CSPRNG.
    Random,
}

/// A keyed AEAD instance bound to one data-encryption key and one IV strategy.
#[derive(Clone)]
pub struct AeadAes256CbcHmacSha256 {
    keys: Arc<ProtectedDataEncryptionKey>,
    iv_strategy: IvStrategy,
}

impl std::fmt::Debug for AeadAes256CbcHmacSha256 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AeadAes256CbcHmacSha256")
            .field("iv_strategy", &self.iv_strategy)
            .finish_non_exhaustive()
    }
}

impl AeadAes256CbcHmacSha256 {
    /// Bind a derived key schedule to an IV strategy.
    pub fn new(keys: Arc<ProtectedDataEncryptionKey>, iv_strategy: IvStrategy) -> Self {
        Self { keys, iv_strategy }
    }

    /// Encrypt `plaintext`, producing the full versioned ciphertext.
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let iv = match self.iv_strategy {
            IvStrategy::DeterministicFromMac => self.derive_iv(plaintext),
            IvStrategy::Random => {
                let mut iv = [0u8; IV_LEN];
                rand::rngs::OsRng.fill_bytes(&mut iv);
                iv
            }
        };

        let cipher = Aes256CbcEnc::new(self.keys.encryption_key().into(), (&iv).into());
        let encrypted = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut out = Vec::with_capacity(1 + IV_LEN + encrypted.len() + TAG_LEN);
        out.push(ALGORITHM_VERSION);
        out.extend_from_slice(&iv);
        out.extend_from_slice(&encrypted);
        let tag = self.compute_tag(&out);
        out.extend_from_slice(&tag);
        out
    }

    /// Decrypt a ciphertext produced by [`Self::encrypt`].
    ///
    /// # Errors
    ///
    /// Returns [`EncryptionError::CryptoIntegrity`] on truncation, an unknown
    /// version byte, tag mismatch, or invalid padding. The tag is verified
    /// before any decryption is attempted.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        if ciphertext.len() < MIN_CIPHERTEXT_LEN {
            return Err(EncryptionError::crypto_integrity(
                "ciphertext shorter than minimum envelope",
            ));
        }
        if ciphertext[0] != ALGORITHM_VERSION {
            return Err(EncryptionError::crypto_integrity(
                "unknown algorithm version byte",
            ));
        }

        let (authenticated, tag) = ciphertext.split_at(ciphertext.len() - TAG_LEN);
        let expected = self.compute_tag(authenticated);
        if !bool::from(expected.ct_eq(tag)) {
            return Err(EncryptionError::crypto_integrity(
                "authentication tag mismatch",
            ));
        }

        let iv: [u8; IV_LEN] = authenticated[1..1 + IV_LEN]
            .try_into()
            .expect("length checked above");
        let encrypted = &authenticated[1 + IV_LEN..];

        let cipher = Aes256CbcDec::new(self.keys.encryption_key().into(), (&iv).into());
        cipher
            .decrypt_padded_vec_mut::<Pkcs7>(encrypted)
            .map_err(|_| EncryptionError::crypto_integrity("invalid block padding"))
    }

    /// Deterministic IV: HMAC over the plaintext, truncated to [`IV_LEN`].
    fn derive_iv(&self, plaintext: &[u8]) -> [u8; IV_LEN] {
        let mut mac =
            HmacSha256::new_from_slice(self.keys.iv_key()).expect("HMAC accepts 32-byte keys");
        mac.update(plaintext);
        let digest = mac.finalize().into_bytes();
        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&digest[..IV_LEN]);
        iv
    }

    fn compute_tag(&self, authenticated: &[u8]) -> [u8; TAG_LEN] {
        let mut mac =
            HmacSha256::new_from_slice(self.keys.mac_key()).expect("HMAC accepts 32-byte keys");
        mac.update(authenticated);
        let digest = mac.finalize().into_bytes();
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&digest);
        tag
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::key::{DataEncryptionKey, KEY_LEN};

    fn aead(strategy: IvStrategy) -> AeadAes256CbcHmacSha256 {
        let root = DataEncryptionKey::from_bytes(&[0x42u8; KEY_LEN]).unwrap();
        AeadAes256CbcHmacSha256::new(
            Arc::new(ProtectedDataEncryptionKey::derive(&root)),
            strategy,
        )
    }

    #[test]
    fn round_trip_deterministic() {
        let aead = aead(IvStrategy::DeterministicFromMac);
        let plaintext = b"123-45-6789";
        let ciphertext = aead.encrypt(plaintext);
        assert_eq!(aead.decrypt(&ciphertext).unwrap(), plaintext);
    }

    #[test]
    fn round_trip_randomized() {
        let aead = aead(IvStrategy::Random);
        let plaintext = b"hello, world";
        let ciphertext = aead.encrypt(plaintext);
        assert_eq!(aead.decrypt(&ciphertext).unwrap(), plaintext);
    }

    #[test]
    fn round_trip_empty_plaintext() {
        let aead = aead(IvStrategy::Random);
        let ciphertext = aead.encrypt(b"");
        assert_eq!(ciphertext.len(), MIN_CIPHERTEXT_LEN);
        assert_eq!(aead.decrypt(&ciphertext).unwrap(), b"");
    }

    #[test]
    fn deterministic_mode_repeats_ciphertext() {
        let aead = aead(IvStrategy::DeterministicFromMac);
        assert_eq!(aead.encrypt(b"same input"), aead.encrypt(b"same input"));
    }

    #[test]
    fn randomized_mode_differs_per_call() {
        let aead = aead(IvStrategy::Random);
        assert_ne!(aead.encrypt(b"same input"), aead.encrypt(b"same input"));
    }

    #[test]
    fn ciphertext_layout() {
        let aead = aead(IvStrategy::DeterministicFromMac);
        let ciphertext = aead.encrypt(b"x");
        assert_eq!(ciphertext[0], ALGORITHM_VERSION);
        // 1-byte plaintext pads to exactly one block.
        assert_eq!(ciphertext.len(), 1 + IV_LEN + 16 + TAG_LEN);
    }

    #[test]
    fn tampered_ciphertext_fails_auth() {
        let aead = aead(IvStrategy::Random);
        let mut ciphertext = aead.encrypt(b"tamper me");
        let mid = 1 + IV_LEN + 2;
        ciphertext[mid] ^= 0xFF;
        let err = aead.decrypt(&ciphertext).unwrap_err();
        assert!(matches!(err, EncryptionError::CryptoIntegrity(_)));
    }

    #[test]
    fn tampered_tag_fails_auth() {
        let aead = aead(IvStrategy::Random);
        let mut ciphertext = aead.encrypt(b"secret");
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0x01;
        assert!(aead.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn truncated_ciphertext_rejected() {
        let aead = aead(IvStrategy::Random);
        let ciphertext = aead.encrypt(b"secret");
        assert!(aead.decrypt(&ciphertext[..MIN_CIPHERTEXT_LEN - 1]).is_err());
    }

    #[test]
    fn wrong_version_byte_rejected() {
        let aead = aead(IvStrategy::Random);
        let mut ciphertext = aead.encrypt(b"secret");
        ciphertext[0] = 0x02;
        let err = aead.decrypt(&ciphertext).unwrap_err();
        assert!(err.to_string().contains("version"));
    }

    #[test]
    fn wrong_key_fails_decryption() {
        let aead1 = aead(IvStrategy::Random);
        let root2 = DataEncryptionKey::from_bytes(&[0x43u8; KEY_LEN]).unwrap();
        let aead2 = AeadAes256CbcHmacSha256::new(
            Arc::new(ProtectedDataEncryptionKey::derive(&root2)),
            IvStrategy::Random,
        );
        let ciphertext = aead1.encrypt(b"secret");
        assert!(aead2.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn modes_share_the_envelope_layout() {
        let det = aead(IvStrategy::DeterministicFromMac);
        let rnd = aead(IvStrategy::Random);
        // A deterministic ciphertext decrypts under a randomized instance of
        // the same key: only IV derivation differs.
        let ciphertext = det.encrypt(b"cross-mode");
        assert_eq!(rnd.decrypt(&ciphertext).unwrap(), b"cross-mode");
    }
}
