//! Key-vault access client: wrap and unwrap of raw key bytes over REST.
//!
//! # Request shape
//!
//! `POST <key_uri>/{wrapkey|unwrapkey}?api-version=<ver>` with JSON body
//! `{"alg": "RSA-OAEP", "value": <base64url>}`, a bearer token from the
//! per-URI AAD token provider, and a fresh `x-ms-client-request-id` header
//! on every request.
//!
//! # Authority discovery
//!
//! The first operation against a key URI probes it with an unauthenticated
//! `GET`. A compliant vault answers `401 Unauthorized` with a
//! `WWW-Authenticate: Bearer authorization="…", resource="…"` challenge; the
//! two quoted values parameterise that URI's token provider. Providers are
//! held in an async single-flight cache so concurrent first-callers share
//! one discovery round-trip.
//!
//! # Retry
//!
//! The probe and the wrap/unwrap calls retry transport-level failures under
//! jittered exponential backoff, bounded in attempts. Received HTTP status
//! codes are never retried; 4xx maps straight to its error kind.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use common::{EncryptionError, KeyWrapMetadata, MasterKeyStore};
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backoff::ExponentialBackoff;
use crate::token::{AadTokenProvider, ClientCertificateCredential};

/// Correlation-id header attached to every vault request.
const CLIENT_REQUEST_ID_HEADER: &str = "x-ms-client-request-id";

/// Master-key wrapping algorithm sent in every wrap/unwrap body.
const KEY_WRAP_ALGORITHM: &str = "RSA-OAEP";

type ProviderResult = Result<Arc<AadTokenProvider>, EncryptionError>;
type ProviderMap = Arc<Mutex<HashMap<String, ProviderState>>>;

enum ProviderState {
    Initializing(Vec<oneshot::Sender<ProviderResult>>),
    Ready(Arc<AadTokenProvider>),
}

#[derive(Clone, Copy)]
enum KeyOperation {
    Wrap,
    Unwrap,
}

impl KeyOperation {
    fn path_segment(self) -> &'static str {
        match self {
            KeyOperation::Wrap => "wrapkey",
            KeyOperation::Unwrap => "unwrapkey",
        }
    }
}

#[derive(Serialize)]
struct KeyOperationRequest<'a> {
    alg: &'a str,
    value: String,
}

#[derive(Deserialize)]
struct KeyOperationResult {
    kid: String,
    value: String,
}

/// Tuning for the access client.
#[derive(Debug, Clone)]
pub struct KeyVaultClientOptions {
    /// Key-vault REST API version query parameter.
    pub api_version: String,
    /// Base backoff and attempt bound shared by the discovery probe, the
    /// wrap/unwrap calls, and AAD token acquisition.
    pub retry_interval: Duration,
    pub retry_count: u32,
}

impl Default for KeyVaultClientOptions {
    fn default() -> Self {
        Self {
            api_version: "7.4".into(),
            retry_interval: Duration::from_secs(1),
            retry_count: 3,
        }
    }
}

/// Authenticated HTTPS client for key-vault wrap/unwrap operations.
///
/// Owns its HTTP client and the token-provider-by-URI cache. Cheap to share
/// behind an `Arc`; all interior state is synchronised.
pub struct KeyVaultAccessClient {
    credential: Arc<ClientCertificateCredential>,
    http: reqwest::Client,
    options: KeyVaultClientOptions,
    providers: ProviderMap,
}

impl std::fmt::Debug for KeyVaultAccessClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyVaultAccessClient")
            .field("api_version", &self.options.api_version)
            .field("providers", &self.providers.lock().len())
            .finish_non_exhaustive()
    }
}

impl KeyVaultAccessClient {
    /// Build a client over an injected HTTP client. The HTTP client should
    /// carry the deployment's request timeout.
    pub fn new(
        credential: ClientCertificateCredential,
        http: reqwest::Client,
        options: KeyVaultClientOptions,
    ) -> Self {
        Self {
            credential: Arc::new(credential),
            http,
            options,
            providers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Wrap `value_b64` (standard base64) under the key at `key_uri`.
    ///
    /// Returns the wrapped bytes as standard base64 together with the
    /// canonical key URI reported by the vault.
    pub async fn wrap_key(
        &self,
        key_uri: &str,
        value_b64: &str,
    ) -> Result<(String, String), EncryptionError> {
        self.key_operation(key_uri, value_b64, KeyOperation::Wrap)
            .await
    }

    /// Unwrap `value_b64` (standard base64) under the key at `key_uri`.
    /// Mirror of [`Self::wrap_key`].
    pub async fn unwrap_key(
        &self,
        key_uri: &str,
        value_b64: &str,
    ) -> Result<(String, String), EncryptionError> {
        self.key_operation(key_uri, value_b64, KeyOperation::Unwrap)
            .await
    }

    async fn key_operation(
        &self,
        key_uri: &str,
        value_b64: &str,
        operation: KeyOperation,
    ) -> Result<(String, String), EncryptionError> {
        validate_key_uri(key_uri)?;
        validate_base64(value_b64)?;

        let provider = self.token_provider(key_uri).await?;
        let token = provider.get_access_token().await?;

        let url = format!(
            "{}/{}",
            key_uri.trim_end_matches('/'),
            operation.path_segment()
        );
        let body = KeyOperationRequest {
            alg: KEY_WRAP_ALGORITHM,
            value: base64_to_base64url(value_b64),
        };

        let response = self
            .send_with_retry(|| {
                self.http
                    .post(&url)
                    .query(&[("api-version", self.options.api_version.as_str())])
                    .bearer_auth(&token)
                    .header(CLIENT_REQUEST_ID_HEADER, Uuid::new_v4().to_string())
                    .json(&body)
            })
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(map_vault_status(status, operation.path_segment()));
        }

        let result: KeyOperationResult = response.json().await.map_err(|e| {
            EncryptionError::InternalServerError(format!(
                "key vault returned an unreadable {} response: {e}",
                operation.path_segment()
            ))
        })?;
        debug!(kid = %result.kid, op = operation.path_segment(), "key vault operation completed");
        Ok((base64url_to_base64(&result.value), result.kid))
    }

    /// The token provider for `key_uri`, discovering the authority on first
    /// use. Concurrent first-callers share one discovery; the result is
    /// cached until [`Self::invalidate_provider`].
    async fn token_provider(&self, key_uri: &str) -> ProviderResult {
        enum Plan {
            Lead,
            Wait(oneshot::Receiver<ProviderResult>),
        }

        let plan = {
            let mut providers = self.providers.lock();
            match providers.get_mut(key_uri) {
                Some(ProviderState::Ready(provider)) => return Ok(Arc::clone(provider)),
                Some(ProviderState::Initializing(waiters)) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Plan::Wait(rx)
                }
                None => {
                    providers.insert(key_uri.to_owned(), ProviderState::Initializing(Vec::new()));
                    Plan::Lead
                }
            }
        };

        match plan {
            Plan::Wait(rx) => match rx.await {
                Ok(result) => result,
                Err(_) => Err(EncryptionError::Cancelled),
            },
            Plan::Lead => {
                let guard = DiscoveryGuard::new(key_uri, Arc::clone(&self.providers));
                let result = self.build_provider(key_uri).await;
                guard.finish(&result);
                result
            }
        }
    }

    /// Drop the cached token provider for a key URI; the next operation
    /// rediscovers the authority.
    pub fn invalidate_provider(&self, key_uri: &str) {
        let mut providers = self.providers.lock();
        if matches!(providers.get(key_uri), Some(ProviderState::Ready(_))) {
            providers.remove(key_uri);
        }
    }

    async fn build_provider(&self, key_uri: &str) -> ProviderResult {
        let (authority, resource) = self.discover_authority(key_uri).await?;
        debug!(key_uri, authority = %authority, "key vault authority discovered");
        Ok(Arc::new(AadTokenProvider::new(
            authority,
            resource,
            Arc::clone(&self.credential),
            self.http.clone(),
            self.options.retry_interval,
            self.options.retry_count,
        )))
    }

    /// Unauthenticated probe expecting a 401 bearer challenge.
    async fn discover_authority(
        &self,
        key_uri: &str,
    ) -> Result<(String, String), EncryptionError> {
        let response = self
            .send_with_retry(|| {
                self.http
                    .get(key_uri)
                    .query(&[("api-version", self.options.api_version.as_str())])
                    .header(CLIENT_REQUEST_ID_HEADER, Uuid::new_v4().to_string())
            })
            .await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Err(EncryptionError::AadUnavailable(format!(
                "authority discovery probe returned HTTP {} (expected 401)",
                response.status()
            )));
        }

        let challenge = response
            .headers()
            .get(reqwest::header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                EncryptionError::AadUnavailable(
                    "authority discovery response carried no WWW-Authenticate header".into(),
                )
            })?;

        parse_bearer_challenge(challenge)
    }

    /// Send a request, retrying transport-level failures only. Any received
    /// HTTP response — whatever its status — is returned to the caller.
    async fn send_with_retry<F>(&self, mut build: F) -> Result<reqwest::Response, EncryptionError>
    where
        F: FnMut() -> reqwest::RequestBuilder,
    {
        let mut backoff = ExponentialBackoff::for_transport(self.options.retry_interval);
        let mut attempt: u32 = 0;
        loop {
            match build().send().await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    if attempt >= self.options.retry_count {
                        return Err(EncryptionError::KeyVaultServiceUnavailable(format!(
                            "transport failure after {} attempts: {e}",
                            attempt + 1
                        )));
                    }
                    attempt += 1;
                    let delay = backoff.next_delay();
                    warn!(
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "key vault request failed at transport level, will retry"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[async_trait]
impl MasterKeyStore for KeyVaultAccessClient {
    async fn wrap(
        &self,
        metadata: &KeyWrapMetadata,
        plaintext_key: &[u8],
    ) -> Result<Vec<u8>, EncryptionError> {
        let (wrapped_b64, _kid) = self
            .wrap_key(&metadata.value, &BASE64.encode(plaintext_key))
            .await?;
        BASE64.decode(wrapped_b64).map_err(|_| {
            EncryptionError::InternalServerError("key vault returned invalid base64".into())
        })
    }

    async fn unwrap(
        &self,
        metadata: &KeyWrapMetadata,
        wrapped_key: &[u8],
    ) -> Result<Vec<u8>, EncryptionError> {
        let (unwrapped_b64, _kid) = self
            .unwrap_key(&metadata.value, &BASE64.encode(wrapped_key))
            .await?;
        BASE64.decode(unwrapped_b64).map_err(|_| {
            EncryptionError::InternalServerError("key vault returned invalid base64".into())
        })
    }
}

/// Removes a pending discovery latch if its leader is dropped, so waiters
/// observe closure and later callers rediscover.
struct DiscoveryGuard {
    key_uri: String,
    providers: ProviderMap,
    finished: bool,
}

impl DiscoveryGuard {
    fn new(key_uri: &str, providers: ProviderMap) -> Self {
        Self {
            key_uri: key_uri.to_owned(),
            providers,
            finished: false,
        }
    }

    fn finish(mut self, result: &ProviderResult) {
        let mut providers = self.providers.lock();
        let waiters = match providers.remove(&self.key_uri) {
            Some(ProviderState::Initializing(waiters)) => waiters,
            _ => Vec::new(),
        };
        if let Ok(provider) = result {
            providers.insert(self.key_uri.clone(), ProviderState::Ready(Arc::clone(provider)));
        }
        drop(providers);
        for tx in waiters {
            let _ = tx.send(result.clone());
        }
        self.finished = true;
    }
}

impl Drop for DiscoveryGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.providers.lock().remove(&self.key_uri);
        }
    }
}

// ---------------------------------------------------------------------------
// Validation and encoding helpers
// ---------------------------------------------------------------------------

/// Validate the key-URI shape: HTTPS, 3 or 4 path segments, second segment
/// `keys` (case-insensitive), non-empty key name and version.
pub fn validate_key_uri(key_uri: &str) -> Result<(), EncryptionError> {
    let url = reqwest::Url::parse(key_uri).map_err(|e| {
        EncryptionError::WrapUnwrapFailure(format!("invalid key vault key URI {key_uri:?}: {e}"))
    })?;
    if url.scheme() != "https" {
        return Err(EncryptionError::WrapUnwrapFailure(format!(
            "key vault key URI {key_uri:?} must use https"
        )));
    }
    let parts: Vec<&str> = url.path().split('/').collect();
    let shape_ok = (parts.len() == 3 || parts.len() == 4)
        && parts[1].eq_ignore_ascii_case("keys")
        && !parts[2].is_empty()
        && parts.get(3).map_or(true, |version| !version.is_empty());
    if !shape_ok {
        return Err(EncryptionError::WrapUnwrapFailure(format!(
            "key vault key URI {key_uri:?} must have the form https://<vault>/keys/<name>[/<version>]"
        )));
    }
    Ok(())
}

/// Validate a standard-base64 payload: length a multiple of 4 and decodable.
pub fn validate_base64(value: &str) -> Result<(), EncryptionError> {
    if value.is_empty() || value.len() % 4 != 0 || BASE64.decode(value).is_err() {
        return Err(EncryptionError::WrapUnwrapFailure(
            "value is not valid base64".into(),
        ));
    }
    Ok(())
}

/// Parse `authorization="…"` and `resource="…"` out of a bearer challenge.
fn parse_bearer_challenge(challenge: &str) -> Result<(String, String), EncryptionError> {
    let authorization = quoted_param(challenge, "authorization")?;
    let resource = quoted_param(challenge, "resource")?;
    Ok((authorization, resource))
}

fn quoted_param(challenge: &str, name: &str) -> Result<String, EncryptionError> {
    let needle = format!("{name}=\"");
    let start = challenge.find(&needle).ok_or_else(|| {
        EncryptionError::AadUnavailable(format!(
            "WWW-Authenticate challenge is missing the {name} parameter"
        ))
    })? + needle.len();
    let rest = &challenge[start..];
    let end = rest.find('"').ok_or_else(|| {
        EncryptionError::AadUnavailable(format!(
            "WWW-Authenticate challenge has an unterminated {name} parameter"
        ))
    })?;
    Ok(rest[..end].to_owned())
}

/// Map vault base64url (`-`, `_`, unpadded) to standard base64.
fn base64url_to_base64(value: &str) -> String {
    let mut out = value.replace('-', "+").replace('_', "/");
    while out.len() % 4 != 0 {
        out.push('=');
    }
    out
}

/// Map standard base64 to vault base64url.
fn base64_to_base64url(value: &str) -> String {
    value.trim_end_matches('=').replace('+', "-").replace('/', "_")
}

fn map_vault_status(status: StatusCode, context: &str) -> EncryptionError {
    match status.as_u16() {
        400 => EncryptionError::WrapUnwrapFailure(format!(
            "{context}: key vault rejected the request (HTTP 400)"
        )),
        403 => EncryptionError::AuthenticationFailure(format!(
            "{context}: access denied by key vault (HTTP 403)"
        )),
        404 => EncryptionError::KeyNotFound(format!("{context}: key vault returned HTTP 404")),
        other => EncryptionError::InternalServerError(format!(
            "{context}: unexpected key vault status HTTP {other}"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_uri_with_version_accepted() {
        assert!(validate_key_uri("https://contoso.vault.azure.net/keys/cmk/abc123").is_ok());
    }

    #[test]
    fn key_uri_without_version_accepted() {
        assert!(validate_key_uri("https://contoso.vault.azure.net/keys/cmk").is_ok());
    }

    #[test]
    fn key_uri_segment_keys_is_case_insensitive() {
        assert!(validate_key_uri("https://contoso.vault.azure.net/KEYS/cmk").is_ok());
    }

    #[test]
    fn key_uri_wrong_collection_rejected() {
        assert!(validate_key_uri("https://contoso.vault.azure.net/secrets/cmk").is_err());
    }

    #[test]
    fn key_uri_extra_segments_rejected() {
        assert!(validate_key_uri("https://contoso.vault.azure.net/keys/cmk/v1/extra").is_err());
    }

    #[test]
    fn key_uri_missing_name_rejected() {
        assert!(validate_key_uri("https://contoso.vault.azure.net/keys").is_err());
        assert!(validate_key_uri("https://contoso.vault.azure.net/keys//v1").is_err());
    }

    #[test]
    fn key_uri_http_scheme_rejected() {
        assert!(validate_key_uri("http://contoso.vault.azure.net/keys/cmk").is_err());
    }

    #[test]
    fn key_uri_garbage_rejected() {
        assert!(validate_key_uri("not a uri").is_err());
    }

    #[test]
    fn base64_validation() {
        assert!(validate_base64("AAAA").is_ok());
        assert!(validate_base64("AAECAwQ=").is_ok());
        // Wrong length (not a multiple of 4).
        assert!(validate_base64("AAA").is_err());
        assert!(validate_base64("").is_err());
        assert!(validate_base64("!!!!").is_err());
    }

    #[test]
    fn base64url_round_trip() {
        // 0xFB 0xEF 0xFF encodes with both '+' and '/' in standard base64.
        let standard = BASE64.encode([0xFBu8, 0xEF, 0xFF, 0x01]);
        let url = base64_to_base64url(&standard);
        assert!(!url.contains('+') && !url.contains('/') && !url.contains('='));
        assert_eq!(base64url_to_base64(&url), standard);
    }

    #[test]
    fn base64url_padding_restored() {
        assert_eq!(base64url_to_base64("QQ"), "QQ==");
        assert_eq!(base64url_to_base64("QUJD"), "QUJD");
        assert_eq!(base64url_to_base64("-_8"), "+/8=");
    }

    #[test]
    fn bearer_challenge_parsed() {
        let header = r#"Bearer authorization="https://login.example.net/tenant-id", resource="https://vault.example.net""#;
        let (authorization, resource) = parse_bearer_challenge(header).unwrap();
        assert_eq!(authorization, "https://login.example.net/tenant-id");
        assert_eq!(resource, "https://vault.example.net");
    }

    #[test]
    fn bearer_challenge_missing_resource_rejected() {
        let header = r#"Bearer authorization="https://login.example.net/tenant-id""#;
        assert!(parse_bearer_challenge(header).is_err());
    }

    #[test]
    fn bearer_challenge_unterminated_quote_rejected() {
        let header = r#"Bearer authorization="https://login.example.net"#;
        assert!(parse_bearer_challenge(header).is_err());
    }

    #[test]
    fn vault_status_mapping() {
        assert!(matches!(
            map_vault_status(StatusCode::BAD_REQUEST, "wrapkey"),
            EncryptionError::WrapUnwrapFailure(_)
        ));
        assert!(matches!(
            map_vault_status(StatusCode::FORBIDDEN, "unwrapkey"),
            EncryptionError::AuthenticationFailure(_)
        ));
        assert!(matches!(
            map_vault_status(StatusCode::NOT_FOUND, "unwrapkey"),
            EncryptionError::KeyNotFound(_)
        ));
        assert!(matches!(
            map_vault_status(StatusCode::INTERNAL_SERVER_ERROR, "wrapkey"),
            EncryptionError::InternalServerError(_)
        ));
        assert!(matches!(
            map_vault_status(StatusCode::BAD_GATEWAY, "wrapkey"),
            EncryptionError::InternalServerError(_)
        ));
    }

    #[test]
    fn forbidden_mapping_triggers_rewrap() {
        assert!(map_vault_status(StatusCode::FORBIDDEN, "unwrapkey").triggers_rewrap());
    }
}
