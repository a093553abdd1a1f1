//! Per-container encryption settings: the property map and the TTL-bounded,
//! single-flight cache of unwrapped data-encryption keys.
//!
//! # Lifecycle
//!
//! 1. The processor builds one [`EncryptionSettings`] per container from the
//!    container's policy. Building is pure — no key is touched.
//! 2. On first use of a covered property, [`EncryptionSettings::ensure_entry`]
//!    fetches the key properties, asks the master-key store to unwrap the
//!    data-encryption key, runs the key schedule, and publishes the entry
//!    with an absolute expiry (`now + ttl`).
//! 3. Expired entries are reinitialized on next use. The cache never
//!    refreshes proactively.
//!
//! # Single-flight discipline
//!
//! At most one initialization per key id is in flight. Concurrent callers
//! for the same key await the leader and observe its result — success or the
//! same failure. A leader dropped mid-initialization removes its pending
//! latch (waiters observe [`EncryptionError::Cancelled`]) and never publishes
//! a half-built entry.
//!
//! # Rewrap handling
//!
//! `AuthenticationFailure` from the master-key store signals the wrapped key
//! may have been rewrapped under a rotated master key: the cache refetches
//! the key properties with `force_refresh` and retries the unwrap exactly
//! once; a second failure surfaces as `KeyUnwrapFailed`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{
    ClientEncryptionPolicy, EncryptionError, EncryptionType, MasterKeyStore, MetadataStore,
};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use zeroize::Zeroize;

use crate::crypto::{
    AeadAes256CbcHmacSha256, DataEncryptionKey, IvStrategy, ProtectedDataEncryptionKey,
};

type InitResult = Result<Arc<DekEntry>, EncryptionError>;
type EntryMap = Arc<Mutex<HashMap<String, EntryState>>>;

/// A ready data-encryption-key cache entry.
///
/// Holds only the derived key schedule; the plaintext root key is dropped
/// (and zeroized) as soon as derivation finishes.
pub struct DekEntry {
    key_id: String,
    protected: Arc<ProtectedDataEncryptionKey>,
    expires_at: Instant,
}

impl std::fmt::Debug for DekEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DekEntry")
            .field("key_id", &self.key_id)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

impl DekEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// State of one cache slot: either an in-flight initialization with its
/// waiters, or a published entry.
enum EntryState {
    Initializing(Vec<oneshot::Sender<InitResult>>),
    Ready(Arc<DekEntry>),
}

/// The runtime binding of one covered property, ready for encrypt/decrypt.
#[derive(Debug)]
pub struct EncryptionSetting {
    encryption_type: EncryptionType,
    entry: Arc<DekEntry>,
}

impl EncryptionSetting {
    /// Build the keyed AEAD instance for this property.
    pub fn aead(&self) -> AeadAes256CbcHmacSha256 {
        let strategy = match self.encryption_type {
            EncryptionType::Deterministic => IvStrategy::DeterministicFromMac,
            EncryptionType::Randomized => IvStrategy::Random,
        };
        AeadAes256CbcHmacSha256::new(Arc::clone(&self.entry.protected), strategy)
    }
}

/// Policy-derived binding of one property name to a key id and mode.
#[derive(Debug, Clone)]
struct PropertySetting {
    key_id: String,
    encryption_type: EncryptionType,
}

/// Per-container settings: property map plus the DEK entry cache.
pub struct EncryptionSettings {
    container_id: String,
    metadata: Arc<dyn MetadataStore>,
    master_keys: Arc<dyn MasterKeyStore>,
    ttl: Duration,
    /// Property name → key binding, in policy included-path order.
    properties: Vec<(String, PropertySetting)>,
    entries: EntryMap,
}

impl std::fmt::Debug for EncryptionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionSettings")
            .field("container_id", &self.container_id)
            .field("properties", &self.properties.len())
            .finish_non_exhaustive()
    }
}

impl EncryptionSettings {
    /// Build the settings for a validated policy. Touches no keys.
    pub fn new(
        container_id: impl Into<String>,
        metadata: Arc<dyn MetadataStore>,
        master_keys: Arc<dyn MasterKeyStore>,
        ttl: Duration,
        policy: &ClientEncryptionPolicy,
    ) -> Self {
        let properties = policy
            .included_paths
            .iter()
            .map(|p| {
                (
                    p.property_name().to_owned(),
                    PropertySetting {
                        key_id: p.client_encryption_key_id.clone(),
                        encryption_type: p.encryption_type,
                    },
                )
            })
            .collect();
        Self {
            container_id: container_id.into(),
            metadata,
            master_keys,
            ttl,
            properties,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Covered property names in policy included-path order.
    pub fn covered_properties(&self) -> impl Iterator<Item = &str> {
        self.properties.iter().map(|(name, _)| name.as_str())
    }

    /// Materialize every distinct key id referenced by the policy, in
    /// first-seen order, before any per-property setting is used.
    ///
    /// After this returns, every covered property has at least one unexpired
    /// initialization behind it.
    pub async fn bootstrap(&self) -> Result<(), EncryptionError> {
        let mut seen: Vec<&str> = Vec::new();
        for (_, setting) in &self.properties {
            if !seen.contains(&setting.key_id.as_str()) {
                seen.push(&setting.key_id);
            }
        }
        for key_id in seen {
            self.ensure_entry(key_id).await?;
        }
        Ok(())
    }

    /// Resolve the ready-to-use setting for a property, or `None` when the
    /// policy does not cover it.
    pub async fn setting_for_property(
        &self,
        name: &str,
    ) -> Result<Option<EncryptionSetting>, EncryptionError> {
        let Some(setting) = self
            .properties
            .iter()
            .find(|(prop, _)| prop == name)
            .map(|(_, s)| s)
        else {
            return Ok(None);
        };
        let entry = self.ensure_entry(&setting.key_id).await?;
        Ok(Some(EncryptionSetting {
            encryption_type: setting.encryption_type,
            entry,
        }))
    }

    /// Return the cached entry for `key_id`, initializing it under the
    /// single-flight discipline when absent or expired.
    pub async fn ensure_entry(&self, key_id: &str) -> Result<Arc<DekEntry>, EncryptionError> {
        enum Plan {
            Lead,
            Wait(oneshot::Receiver<InitResult>),
        }

        let plan = {
            let mut entries = self.entries.lock();
            match entries.get_mut(key_id) {
                Some(EntryState::Ready(entry)) if !entry.is_expired() => {
                    return Ok(Arc::clone(entry));
                }
                Some(EntryState::Initializing(waiters)) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Plan::Wait(rx)
                }
                // Absent or expired: become the leader.
                _ => {
                    entries.insert(key_id.to_owned(), EntryState::Initializing(Vec::new()));
                    Plan::Lead
                }
            }
        };

        match plan {
            Plan::Wait(rx) => match rx.await {
                Ok(result) => result,
                // The leader was dropped mid-initialization.
                Err(_) => Err(EncryptionError::Cancelled),
            },
            Plan::Lead => {
                let guard = InitGuard::new(key_id, Arc::clone(&self.entries));
                let result = self.initialize_entry(key_id).await;
                guard.finish(&result);
                result
            }
        }
    }

    /// Evict a published entry. The next use reinitializes from scratch.
    pub fn invalidate(&self, key_id: &str) {
        let mut entries = self.entries.lock();
        if matches!(entries.get(key_id), Some(EntryState::Ready(_))) {
            entries.remove(key_id);
            debug!(key_id, "evicted data-encryption-key entry");
        }
    }

    async fn initialize_entry(&self, key_id: &str) -> InitResult {
        let props = self
            .metadata
            .client_encryption_key_properties(&self.container_id, key_id, false)
            .await?;

        let mut unwrapped = match self
            .master_keys
            .unwrap(&props.key_wrap_metadata, &props.wrapped_data_encryption_key)
            .await
        {
            Ok(bytes) => bytes,
            Err(err) if err.triggers_rewrap() => {
                warn!(key_id, "master-key store refused unwrap; refetching key properties");
                let refreshed = self
                    .metadata
                    .client_encryption_key_properties(&self.container_id, key_id, true)
                    .await?;
                self.master_keys
                    .unwrap(
                        &refreshed.key_wrap_metadata,
                        &refreshed.wrapped_data_encryption_key,
                    )
                    .await
                    .map_err(|e| {
                        EncryptionError::KeyUnwrapFailed(format!(
                            "unwrap failed after forced key-properties refresh: {e}"
                        ))
                    })?
            }
            Err(err) => return Err(err),
        };

        let root = DataEncryptionKey::from_bytes(&unwrapped);
        unwrapped.zeroize();
        let root = root?;
        let protected = ProtectedDataEncryptionKey::derive(&root);

        debug!(key_id, ttl_secs = self.ttl.as_secs(), "data-encryption-key entry initialized");
        Ok(Arc::new(DekEntry {
            key_id: key_id.to_owned(),
            protected: Arc::new(protected),
            expires_at: Instant::now() + self.ttl,
        }))
    }
}

/// Removes the in-flight latch if the leader is dropped before finishing, so
/// waiters observe closure instead of hanging and the next caller retries
/// from scratch.
struct InitGuard {
    key_id: String,
    entries: EntryMap,
    finished: bool,
}

impl InitGuard {
    fn new(key_id: &str, entries: EntryMap) -> Self {
        Self {
            key_id: key_id.to_owned(),
            entries,
            finished: false,
        }
    }

    /// Publish the result: notify waiters, then either install the ready
    /// entry or clear the slot so the next caller retries.
    fn finish(mut self, result: &InitResult) {
        let mut entries = self.entries.lock();
        let waiters = match entries.remove(&self.key_id) {
            Some(EntryState::Initializing(waiters)) => waiters,
            _ => Vec::new(),
        };
        if let Ok(entry) = result {
            entries.insert(self.key_id.clone(), EntryState::Ready(Arc::clone(entry)));
        }
        drop(entries);
        for tx in waiters {
            let _ = tx.send(result.clone());
        }
        self.finished = true;
    }
}

impl Drop for InitGuard {
    fn drop(&mut self) {
        if !self.finished {
            // Initialization was abandoned; clear the latch so waiters see
            // closure and later callers reinitialize.
            self.entries.lock().remove(&self.key_id);
        }
    }
}
