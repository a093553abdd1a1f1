//! Policy-driven JSON document rewriter.
//!
//! The processor walks a document according to its container's client
//! encryption policy and applies the canonical codec + AEAD per covered
//! property. Covered values are replaced in place with base64 strings of
//! `marker(1) || aead_ciphertext(N)`; decryption reverses the transform.
//!
//! # Initialization
//!
//! Lazy and idempotent. The first operation fetches the policy; a container
//! without a policy makes both operations identity transforms. A present
//! policy is validated in full before any property is touched — one invalid
//! included path fails the whole call with `PolicyInvalid`.
//!
//! # Walk rules
//!
//! For each included path, the property is looked up by name on the root
//! object and skipped when absent or null (no key is fetched for a skipped
//! property). Scalars are rewritten in place; objects and arrays are
//! descended and every scalar leaf below is rewritten. Array elements are
//! classified one by one, so arrays mixing objects and scalars round-trip.

use std::io::Cursor;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use common::{EncryptionError, MasterKeyStore, MetadataStore};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::config::EngineConfig;
use crate::crypto::aead::AeadAes256CbcHmacSha256;
use crate::crypto::serializer::{self, json_type_name, TypeMarker};
use crate::settings::EncryptionSettings;

/// Lazily resolved per-container state.
enum ProcessorState {
    /// The container carries no encryption policy.
    Passthrough,
    Active(EncryptionSettings),
}

#[derive(Clone, Copy)]
enum Direction {
    Encrypt,
    Decrypt,
}

/// Field-level encryption processor bound to one container.
pub struct EncryptionProcessor {
    container_id: String,
    metadata: Arc<dyn MetadataStore>,
    master_keys: Arc<dyn MasterKeyStore>,
    config: EngineConfig,
    state: OnceCell<ProcessorState>,
}

impl std::fmt::Debug for EncryptionProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionProcessor")
            .field("container_id", &self.container_id)
            .field("initialized", &self.state.initialized())
            .finish_non_exhaustive()
    }
}

impl EncryptionProcessor {
    /// Create a processor for `container_id` over the injected collaborators.
    pub fn new(
        container_id: impl Into<String>,
        metadata: Arc<dyn MetadataStore>,
        master_keys: Arc<dyn MasterKeyStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            container_id: container_id.into(),
            metadata,
            master_keys,
            config,
            state: OnceCell::new(),
        }
    }

    /// Fetch and validate the policy, then materialize every referenced
    /// data-encryption key before any per-property setting is used.
    ///
    /// Optional: the encrypt/decrypt operations initialize on demand.
    /// Callers that want key-vault failures surfaced at install time rather
    /// than on the first document invoke this once up front.
    pub async fn initialize_encryption_settings(&self) -> Result<(), EncryptionError> {
        match self.state().await? {
            ProcessorState::Passthrough => Ok(()),
            ProcessorState::Active(settings) => settings.bootstrap().await,
        }
    }

    /// Evict the cached entry for one data-encryption key; the next document
    /// referencing it reinitializes through the master-key store.
    pub fn invalidate_key(&self, key_id: &str) {
        if let Some(ProcessorState::Active(settings)) = self.state.get() {
            settings.invalidate(key_id);
        }
    }

    /// Encrypt a JSON document read from `input`.
    ///
    /// The input is consumed in full. Without a policy the returned stream is
    /// byte-equal to the input; otherwise the document is parsed, rewritten,
    /// and re-serialized with property order preserved. The returned cursor
    /// is positioned at the start.
    ///
    /// # Errors
    ///
    /// Any per-property failure fails the whole call; no partial document is
    /// produced.
    pub async fn encrypt<R>(&self, input: R) -> Result<Cursor<Vec<u8>>, EncryptionError>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.transform_stream(input, Direction::Encrypt).await
    }

    /// Decrypt a JSON document read from `input`. Mirror of [`Self::encrypt`].
    pub async fn decrypt<R>(&self, input: R) -> Result<Cursor<Vec<u8>>, EncryptionError>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.transform_stream(input, Direction::Decrypt).await
    }

    /// Encrypt an already-parsed document tree.
    pub async fn encrypt_document(&self, document: Value) -> Result<Value, EncryptionError> {
        self.transform_document(document, Direction::Encrypt).await
    }

    /// Decrypt an already-parsed document tree.
    pub async fn decrypt_document(&self, document: Value) -> Result<Value, EncryptionError> {
        self.transform_document(document, Direction::Decrypt).await
    }

    async fn transform_stream<R>(
        &self,
        mut input: R,
        direction: Direction,
    ) -> Result<Cursor<Vec<u8>>, EncryptionError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut buf = Vec::new();
        input
            .read_to_end(&mut buf)
            .await
            .map_err(|e| EncryptionError::malformed_document(format!("failed to read document stream: {e}")))?;
        drop(input);

        if matches!(self.state().await?, ProcessorState::Passthrough) {
            // No policy: the output is byte-equal to the input.
            return Ok(Cursor::new(buf));
        }

        let document: Value = serde_json::from_slice(&buf)
            .map_err(|e| EncryptionError::malformed_document(format!("input is not valid JSON: {e}")))?;
        let transformed = self.transform_document(document, direction).await?;
        let bytes = serde_json::to_vec(&transformed)
            .map_err(|e| EncryptionError::malformed_document(format!("failed to serialize document: {e}")))?;
        Ok(Cursor::new(bytes))
    }

    async fn transform_document(
        &self,
        mut document: Value,
        direction: Direction,
    ) -> Result<Value, EncryptionError> {
        let ProcessorState::Active(settings) = self.state().await? else {
            return Ok(document);
        };

        let root = document.as_object_mut().ok_or_else(|| {
            EncryptionError::malformed_document("document root must be a JSON object")
        })?;

        for name in settings.covered_properties() {
            // Absent and null properties are skipped without touching a key.
            match root.get(name) {
                None | Some(Value::Null) => continue,
                Some(_) => {}
            }
            let Some(setting) = settings.setting_for_property(name).await? else {
                continue;
            };
            let aead = setting.aead();
            if let Some(value) = root.get_mut(name) {
                match direction {
                    Direction::Encrypt => encrypt_node(value, &aead)?,
                    Direction::Decrypt => decrypt_node(value, &aead)?,
                }
            }
        }

        Ok(document)
    }

    async fn state(&self) -> Result<&ProcessorState, EncryptionError> {
        self.state
            .get_or_try_init(|| async {
                let policy = self
                    .metadata
                    .client_encryption_policy(&self.container_id, false)
                    .await?;
                match policy {
                    None => {
                        debug!(container = %self.container_id, "container has no encryption policy");
                        Ok(ProcessorState::Passthrough)
                    }
                    Some(policy) => {
                        policy.validate()?;
                        debug!(
                            container = %self.container_id,
                            paths = policy.included_paths.len(),
                            "encryption policy installed"
                        );
                        Ok(ProcessorState::Active(EncryptionSettings::new(
                            self.container_id.clone(),
                            Arc::clone(&self.metadata),
                            Arc::clone(&self.master_keys),
                            self.config.settings_ttl(),
                            &policy,
                        )))
                    }
                }
            })
            .await
    }
}

/// Recursively rewrite every scalar leaf under `value` with its ciphertext.
/// Nulls are left in place; objects and arrays are descended element by
/// element, preserving property names and ordering.
fn encrypt_node(
    value: &mut Value,
    aead: &AeadAes256CbcHmacSha256,
) -> Result<(), EncryptionError> {
    match value {
        Value::Null => Ok(()),
        Value::Bool(_) | Value::Number(_) | Value::String(_) => {
            let (marker, plaintext) = serializer::serialize(value)?;
            let ciphertext = aead.encrypt(&plaintext);
            let mut payload = Vec::with_capacity(1 + ciphertext.len());
            payload.push(marker as u8);
            payload.extend_from_slice(&ciphertext);
            *value = Value::String(BASE64.encode(&payload));
            Ok(())
        }
        Value::Object(map) => {
            for (_, child) in map.iter_mut() {
                encrypt_node(child, aead)?;
            }
            Ok(())
        }
        Value::Array(items) => {
            for child in items.iter_mut() {
                encrypt_node(child, aead)?;
            }
            Ok(())
        }
    }
}

/// Mirror of [`encrypt_node`]: every scalar leaf is a base64 payload whose
/// first byte is the type marker.
fn decrypt_node(
    value: &mut Value,
    aead: &AeadAes256CbcHmacSha256,
) -> Result<(), EncryptionError> {
    match value {
        Value::Null => Ok(()),
        Value::String(encoded) => {
            let payload = BASE64
                .decode(encoded.as_bytes())
                .map_err(|_| EncryptionError::crypto_integrity("encrypted value is not valid base64"))?;
            let (marker_byte, ciphertext) = payload
                .split_first()
                .ok_or_else(|| EncryptionError::crypto_integrity("encrypted value is empty"))?;
            let marker = TypeMarker::from_byte(*marker_byte)?;
            let plaintext = aead.decrypt(ciphertext)?;
            *value = serializer::deserialize(marker, &plaintext)?;
            Ok(())
        }
        Value::Object(map) => {
            for (_, child) in map.iter_mut() {
                decrypt_node(child, aead)?;
            }
            Ok(())
        }
        Value::Array(items) => {
            for child in items.iter_mut() {
                decrypt_node(child, aead)?;
            }
            Ok(())
        }
        other => Err(EncryptionError::crypto_integrity(format!(
            "encrypted leaf has JSON type {}, expected a base64 string",
            json_type_name(other)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::key::{DataEncryptionKey, ProtectedDataEncryptionKey, KEY_LEN};
    use crate::crypto::IvStrategy;
    use serde_json::json;

    fn test_aead(strategy: IvStrategy) -> AeadAes256CbcHmacSha256 {
        let root = DataEncryptionKey::from_bytes(&[7u8; KEY_LEN]).unwrap();
        AeadAes256CbcHmacSha256::new(
            Arc::new(ProtectedDataEncryptionKey::derive(&root)),
            strategy,
        )
    }

    #[test]
    fn scalar_leaf_round_trips_in_place() {
        let aead = test_aead(IvStrategy::DeterministicFromMac);
        let mut value = json!("a@x.y");
        encrypt_node(&mut value, &aead).unwrap();
        assert!(value.is_string());
        assert_ne!(value, json!("a@x.y"));
        decrypt_node(&mut value, &aead).unwrap();
        assert_eq!(value, json!("a@x.y"));
    }

    #[test]
    fn nested_object_leaves_rewritten_shape_preserved() {
        let aead = test_aead(IvStrategy::DeterministicFromMac);
        let mut value = json!({"city": "sf", "zip": 94107, "geo": {"lat": 37.77}});
        encrypt_node(&mut value, &aead).unwrap();
        assert!(value["city"].is_string());
        assert!(value["zip"].is_string());
        assert!(value["geo"]["lat"].is_string());
        decrypt_node(&mut value, &aead).unwrap();
        assert_eq!(value, json!({"city": "sf", "zip": 94107, "geo": {"lat": 37.77}}));
    }

    #[test]
    fn heterogeneous_array_classified_per_element() {
        let aead = test_aead(IvStrategy::DeterministicFromMac);
        let mut value = json!([{"a": 1}, "plain", 3]);
        encrypt_node(&mut value, &aead).unwrap();
        assert!(value[0]["a"].is_string());
        assert!(value[1].is_string());
        assert!(value[2].is_string());
        decrypt_node(&mut value, &aead).unwrap();
        assert_eq!(value, json!([{"a": 1}, "plain", 3]));
    }

    #[test]
    fn empty_array_left_untouched() {
        let aead = test_aead(IvStrategy::Random);
        let mut value = json!([]);
        encrypt_node(&mut value, &aead).unwrap();
        assert_eq!(value, json!([]));
    }

    #[test]
    fn nested_null_left_in_place() {
        let aead = test_aead(IvStrategy::Random);
        let mut value = json!({"present": "x", "missing": null});
        encrypt_node(&mut value, &aead).unwrap();
        assert!(value["missing"].is_null());
        decrypt_node(&mut value, &aead).unwrap();
        assert_eq!(value["missing"], Value::Null);
        assert_eq!(value["present"], json!("x"));
    }

    #[test]
    fn ciphertext_leaf_starts_with_valid_marker() {
        let aead = test_aead(IvStrategy::DeterministicFromMac);
        for (input, expected) in [
            (json!(true), 2u8),
            (json!(1.5), 3u8),
            (json!(42), 4u8),
            (json!("s"), 5u8),
        ] {
            let mut value = input;
            encrypt_node(&mut value, &aead).unwrap();
            let payload = BASE64.decode(value.as_str().unwrap()).unwrap();
            assert_eq!(payload[0], expected);
        }
    }

    #[test]
    fn decrypting_non_string_leaf_fails() {
        let aead = test_aead(IvStrategy::Random);
        let mut value = json!(42);
        let err = decrypt_node(&mut value, &aead).unwrap_err();
        assert!(matches!(err, EncryptionError::CryptoIntegrity(_)));
    }

    #[test]
    fn decrypting_garbage_base64_fails() {
        let aead = test_aead(IvStrategy::Random);
        let mut value = json!("!!! not base64 !!!");
        assert!(decrypt_node(&mut value, &aead).is_err());
    }
}
