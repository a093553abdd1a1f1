//! Key-vault access for the `docseal` engine.
//!
//! The default deployment of the engine's master-key store: wrap and unwrap
//! of data-encryption-key bytes against a remote key vault, authenticated by
//! AAD bearer tokens acquired through the certificate client-credentials
//! flow. The vault's AAD authority is discovered per key URI through an
//! unauthenticated challenge probe.

pub mod backoff;
pub mod client;
pub mod token;

pub use client::{KeyVaultAccessClient, KeyVaultClientOptions};
pub use token::{AadTokenProvider, ClientCertificateCredential};
