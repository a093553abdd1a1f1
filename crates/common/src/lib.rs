//! Shared data model, error kinds, and collaborator traits for the `docseal` crates.

pub mod error;
pub mod policy;
pub mod store;

pub use error::EncryptionError;
pub use policy::{
    ClientEncryptionIncludedPath, ClientEncryptionKeyProperties, ClientEncryptionPolicy,
    EncryptionType, KeyWrapMetadata, AEAD_AES_256_CBC_HMAC_SHA_256,
};
pub use store::{MasterKeyStore, MetadataStore};
