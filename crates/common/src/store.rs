//! Injected collaborator traits: database metadata source and master-key store.
//!
//! The engine never talks to a database or a key vault directly; it is handed
//! one implementation of each trait at construction. The default master-key
//! store deployment is the `keyvault` crate's access client; tests and local
//! HSM deployments provide their own.

use async_trait::async_trait;

use crate::error::EncryptionError;
use crate::policy::{ClientEncryptionKeyProperties, ClientEncryptionPolicy, KeyWrapMetadata};

/// Supplies encryption policies and wrapped data-encryption keys from the
/// embedding document database.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Fetch the client encryption policy bound to `container_id`.
    ///
    /// Returns `None` when the container carries no policy, in which case
    /// encryption and decryption are identity transforms.
    async fn client_encryption_policy(
        &self,
        container_id: &str,
        force_refresh: bool,
    ) -> Result<Option<ClientEncryptionPolicy>, EncryptionError>;

    /// Fetch the properties of one client encryption key.
    ///
    /// `force_refresh` bypasses any metadata-layer cache; the settings cache
    /// sets it after a rewrap signal from the master-key store.
    async fn client_encryption_key_properties(
        &self,
        container_id: &str,
        key_id: &str,
        force_refresh: bool,
    ) -> Result<ClientEncryptionKeyProperties, EncryptionError>;
}

/// Wraps and unwraps raw data-encryption-key bytes under a master key.
#[async_trait]
pub trait MasterKeyStore: Send + Sync {
    /// Wrap `plaintext_key` under the master key located by `metadata`.
    async fn wrap(
        &self,
        metadata: &KeyWrapMetadata,
        plaintext_key: &[u8],
    ) -> Result<Vec<u8>, EncryptionError>;

    /// Unwrap `wrapped_key` under the master key located by `metadata`.
    ///
    /// # Errors
    ///
    /// [`EncryptionError::AuthenticationFailure`] signals the caller that the
    /// key may have been rewrapped and a forced metadata refresh is in order.
    async fn unwrap(
        &self,
        metadata: &KeyWrapMetadata,
        wrapped_key: &[u8],
    ) -> Result<Vec<u8>, EncryptionError>;
}
