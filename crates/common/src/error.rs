//! Error kinds shared across the engine, settings cache, and key-vault client.

use thiserror::Error;

/// Transport-agnostic error type for every encryption-engine operation.
///
/// Variants carry a human-readable description safe to surface to callers;
/// they never contain key material or plaintext fragments.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncryptionError {
    /// An included path in the client encryption policy is malformed or
    /// references the document id property.
    #[error("invalid encryption policy: {0}")]
    PolicyInvalid(String),

    /// A value covered by the policy is not an encryptable scalar
    /// (bool, int64, f64, string) or an integer is out of int64 range.
    #[error("unsupported value: {0}")]
    UnsupportedValue(String),

    /// The key vault has no key at the configured key-encryption-key URI.
    #[error("key not found in key vault: {0}")]
    KeyNotFound(String),

    /// The key vault refused the operation (HTTP 403). The settings cache
    /// treats this as a rewrap signal and retries once with refreshed key
    /// properties before surfacing it.
    #[error("key vault authentication failure: {0}")]
    AuthenticationFailure(String),

    /// Unwrapping the data-encryption key failed even after a forced
    /// refresh of the key properties.
    #[error("failed to unwrap data encryption key: {0}")]
    KeyUnwrapFailed(String),

    /// The AAD authority rejected the token request or stayed unreachable
    /// through the configured retries.
    #[error("AAD token acquisition failed: {0}")]
    AadUnavailable(String),

    /// The key vault stayed unreachable at the transport level through the
    /// configured retries.
    #[error("key vault unavailable: {0}")]
    KeyVaultServiceUnavailable(String),

    /// The key vault rejected the wrap/unwrap request as malformed (HTTP 400).
    #[error("key vault wrap/unwrap failure: {0}")]
    WrapUnwrapFailure(String),

    /// The key vault returned an unexpected status code.
    #[error("key vault internal error: {0}")]
    InternalServerError(String),

    /// Ciphertext failed authentication: tag mismatch, truncation, an
    /// unknown algorithm version byte, or an invalid type marker.
    #[error("ciphertext integrity check failed: {0}")]
    CryptoIntegrity(String),

    /// The operation was cancelled before completion. Observed by
    /// single-flight waiters whose initializing leader was dropped.
    #[error("operation cancelled")]
    Cancelled,

    /// The database metadata source failed to supply a policy or key
    /// properties.
    #[error("metadata source unavailable: {0}")]
    MetadataUnavailable(String),

    /// The input byte stream is not a JSON document of the expected shape.
    #[error("malformed document: {0}")]
    MalformedDocument(String),
}

impl EncryptionError {
    /// Construct an [`EncryptionError::PolicyInvalid`].
    pub fn policy_invalid(msg: impl Into<String>) -> Self {
        Self::PolicyInvalid(msg.into())
    }

    /// Construct an [`EncryptionError::UnsupportedValue`].
    pub fn unsupported_value(msg: impl Into<String>) -> Self {
        Self::UnsupportedValue(msg.into())
    }

    /// Construct an [`EncryptionError::CryptoIntegrity`].
    pub fn crypto_integrity(msg: impl Into<String>) -> Self {
        Self::CryptoIntegrity(msg.into())
    }

    /// Construct an [`EncryptionError::MalformedDocument`].
    pub fn malformed_document(msg: impl Into<String>) -> Self {
        Self::MalformedDocument(msg.into())
    }

    /// Whether this error signals that the wrapped data-encryption key may
    /// have been rewrapped under a rotated master key.
    ///
    /// The settings cache reacts by refetching the key properties with
    /// `force_refresh` and retrying the unwrap exactly once.
    pub fn triggers_rewrap(&self) -> bool {
        matches!(self, EncryptionError::AuthenticationFailure(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_message() {
        let e = EncryptionError::policy_invalid("path must start with '/'");
        assert!(e.to_string().contains("path must start with '/'"));
    }

    #[test]
    fn only_authentication_failure_triggers_rewrap() {
        assert!(EncryptionError::AuthenticationFailure("403".into()).triggers_rewrap());
        assert!(!EncryptionError::KeyNotFound("k1".into()).triggers_rewrap());
        assert!(!EncryptionError::Cancelled.triggers_rewrap());
    }

    #[test]
    fn errors_compare_by_kind_and_message() {
        assert_eq!(
            EncryptionError::crypto_integrity("tag mismatch"),
            EncryptionError::CryptoIntegrity("tag mismatch".into())
        );
    }
}
