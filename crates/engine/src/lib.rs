//! Client-side field-level encryption engine for JSON documents.
//!
//! Given a per-container encryption policy naming which top-level properties
//! to protect and under which key and mode, the engine encrypts each covered
//! value before a document is written and reverses the transform when it is
//! read back. It is independent of any database transport: byte streams or
//! parsed JSON trees in, the same out. The only way it reaches outside is
//! through two injected collaborators defined in the `common` crate — a
//! database metadata source ([`common::MetadataStore`]) and a master-key
//! store ([`common::MasterKeyStore`], fulfilled by the `keyvault` crate in
//! the default deployment).
//!
//! ```text
//! document ──► EncryptionProcessor ──► EncryptionSettings ──► MasterKeyStore
//!                  │  JSON walk            │  DEK cache           (unwrap)
//!                  ▼                       ▼
//!            codec + AEAD        ProtectedDataEncryptionKey
//! ```

pub mod config;
pub mod crypto;
pub mod processor;
pub mod settings;

pub use config::EngineConfig;
pub use crypto::{AeadAes256CbcHmacSha256, IvStrategy, TypeMarker};
pub use processor::EncryptionProcessor;
pub use settings::{EncryptionSetting, EncryptionSettings};
