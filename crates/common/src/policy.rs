//! Client encryption policy and key metadata exchanged with the database layer.
//!
//! These types are serialised as JSON both in container metadata and in the
//! key-properties documents fetched per data-encryption-key id.

use serde::{Deserialize, Serialize};

use crate::error::EncryptionError;

/// Property name that must never be covered by an encryption policy.
pub const ID_PROPERTY_PATH: &str = "/id";

/// Wire name of the only data-encryption algorithm the engine composes.
pub const AEAD_AES_256_CBC_HMAC_SHA_256: &str = "AEAD_AES_256_CBC_HMAC_SHA_256";

// ---------------------------------------------------------------------------
// Encryption type
// ---------------------------------------------------------------------------

/// How a covered property's initialization vector is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum EncryptionType {
    /// IV derived from the plaintext: equal plaintexts yield equal
    /// ciphertexts, enabling equality predicates over encrypted values.
    Deterministic,
    /// IV drawn from a CSPRNG: semantically secure, no equality support.
    Randomized,
}

// ---------------------------------------------------------------------------
// Client encryption policy
// ---------------------------------------------------------------------------

/// A single covered path within a [`ClientEncryptionPolicy`].
///
/// Paths use the restricted form `/<top-level-property>`: a leading slash
/// followed by the property name, with no further slashes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEncryptionIncludedPath {
    /// Covered path, e.g. `"/email"`.
    pub path: String,
    /// Identifier of the client encryption key protecting this property.
    pub client_encryption_key_id: String,
    /// IV derivation mode for this property.
    pub encryption_type: EncryptionType,
    /// Wire name of the data-encryption algorithm. Informational; the engine
    /// only composes [`AEAD_AES_256_CBC_HMAC_SHA_256`].
    pub encryption_algorithm: String,
}

impl ClientEncryptionIncludedPath {
    /// The top-level property name this path covers (the path without its
    /// leading slash). Only meaningful after [`Self::validate`] passed.
    pub fn property_name(&self) -> &str {
        self.path.strip_prefix('/').unwrap_or(&self.path)
    }

    /// Validate the path shape.
    ///
    /// # Errors
    ///
    /// Returns [`EncryptionError::PolicyInvalid`] if the path is empty, does
    /// not begin with `/`, contains more than one `/`, or names the document
    /// id property.
    pub fn validate(&self) -> Result<(), EncryptionError> {
        if self.path.is_empty() {
            return Err(EncryptionError::policy_invalid("included path is empty"));
        }
        if !self.path.starts_with('/') {
            return Err(EncryptionError::policy_invalid(format!(
                "included path {:?} must begin with '/'",
                self.path
            )));
        }
        if self.path.matches('/').count() != 1 || self.path.len() == 1 {
            return Err(EncryptionError::policy_invalid(format!(
                "included path {:?} must name exactly one top-level property",
                self.path
            )));
        }
        if self.path == ID_PROPERTY_PATH {
            return Err(EncryptionError::policy_invalid(
                "the document id property cannot be encrypted",
            ));
        }
        Ok(())
    }
}

/// Per-container declaration of which top-level properties are encrypted,
/// under which key, in which mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEncryptionPolicy {
    /// Ordered list of covered paths. Multiple paths may share a key id.
    pub included_paths: Vec<ClientEncryptionIncludedPath>,
}

impl ClientEncryptionPolicy {
    /// Validate every included path, including uniqueness: a property
    /// covered twice would be encrypted twice.
    ///
    /// # Errors
    ///
    /// Returns the first [`EncryptionError::PolicyInvalid`] encountered.
    pub fn validate(&self) -> Result<(), EncryptionError> {
        let mut seen: Vec<&str> = Vec::new();
        for path in &self.included_paths {
            path.validate()?;
            if seen.contains(&path.path.as_str()) {
                return Err(EncryptionError::policy_invalid(format!(
                    "included path {:?} appears more than once",
                    path.path
                )));
            }
            seen.push(&path.path);
        }
        Ok(())
    }

    /// Distinct key ids across all included paths, in first-seen order.
    pub fn distinct_key_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = Vec::new();
        for path in &self.included_paths {
            let id = path.client_encryption_key_id.as_str();
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids
    }
}

// ---------------------------------------------------------------------------
// Key properties
// ---------------------------------------------------------------------------

/// Location of the master key that wraps a data-encryption key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyWrapMetadata {
    /// Friendly name of the master key.
    pub name: String,
    /// Key URI in the master-key store, e.g.
    /// `https://contoso.vault.azure.net/keys/cmk/1`.
    pub value: String,
    /// Provider tag identifying which master-key store fulfils this key.
    pub provider: String,
}

/// Metadata for one client encryption key, fetched from the database layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEncryptionKeyProperties {
    /// Key identifier referenced by policy included paths.
    pub id: String,
    /// Name of the master-key wrapping algorithm (e.g. `"RSA-OAEP"`).
    pub encryption_algorithm: String,
    /// The data-encryption key, wrapped under the master key.
    pub wrapped_data_encryption_key: Vec<u8>,
    /// Where the wrapping master key lives.
    pub key_wrap_metadata: KeyWrapMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(p: &str) -> ClientEncryptionIncludedPath {
        ClientEncryptionIncludedPath {
            path: p.into(),
            client_encryption_key_id: "key1".into(),
            encryption_type: EncryptionType::Deterministic,
            encryption_algorithm: AEAD_AES_256_CBC_HMAC_SHA_256.into(),
        }
    }

    #[test]
    fn valid_path_accepted() {
        assert!(path("/email").validate().is_ok());
        assert_eq!(path("/email").property_name(), "email");
    }

    #[test]
    fn empty_path_rejected() {
        assert!(matches!(
            path("").validate(),
            Err(EncryptionError::PolicyInvalid(_))
        ));
    }

    #[test]
    fn missing_leading_slash_rejected() {
        assert!(path("email").validate().is_err());
    }

    #[test]
    fn nested_path_rejected() {
        assert!(path("/address/zip").validate().is_err());
    }

    #[test]
    fn bare_slash_rejected() {
        assert!(path("/").validate().is_err());
    }

    #[test]
    fn id_path_rejected() {
        let err = path("/id").validate().unwrap_err();
        assert!(err.to_string().contains("id property"));
    }

    #[test]
    fn duplicate_paths_rejected() {
        let policy = ClientEncryptionPolicy {
            included_paths: vec![path("/email"), path("/email")],
        };
        let err = policy.validate().unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn distinct_key_ids_preserve_first_seen_order() {
        let mut second = path("/ssn");
        second.client_encryption_key_id = "key2".into();
        let policy = ClientEncryptionPolicy {
            included_paths: vec![path("/email"), second, path("/name")],
        };
        assert_eq!(policy.distinct_key_ids(), vec!["key1", "key2"]);
    }

    #[test]
    fn policy_round_trips_through_json() {
        let policy = ClientEncryptionPolicy {
            included_paths: vec![path("/email")],
        };
        let json = serde_json::to_string(&policy).unwrap();
        let decoded: ClientEncryptionPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.included_paths[0].path, "/email");
        assert_eq!(
            decoded.included_paths[0].encryption_type,
            EncryptionType::Deterministic
        );
    }

    #[test]
    fn key_properties_round_trip() {
        let props = ClientEncryptionKeyProperties {
            id: "key1".into(),
            encryption_algorithm: "RSA-OAEP".into(),
            wrapped_data_encryption_key: vec![1, 2, 3],
            key_wrap_metadata: KeyWrapMetadata {
                name: "cmk".into(),
                value: "https://contoso.vault.azure.net/keys/cmk/1".into(),
                provider: "AZURE_KEY_VAULT".into(),
            },
        };
        let json = serde_json::to_string(&props).unwrap();
        let decoded: ClientEncryptionKeyProperties = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.wrapped_data_encryption_key, vec![1, 2, 3]);
        assert_eq!(decoded.key_wrap_metadata.provider, "AZURE_KEY_VAULT");
    }
}
