//! AAD bearer-token acquisition via the certificate client-credentials flow.
//!
//! One [`AadTokenProvider`] serves one `(authority, resource)` pair — the
//! key-vault access client keeps a provider per key URI, built from the
//! vault's discovery challenge. Tokens are cached in memory and refreshed
//! only when their remaining lifetime drops below the refresh margin, so
//! repeat calls within the token lifetime never hit the authority.
//!
//! # Grant shape
//!
//! `POST {authority}/oauth2/v2.0/token` with form fields
//! `grant_type=client_credentials`, `client_id`, `scope={resource}/.default`,
//! `client_assertion_type=urn:ietf:params:oauth:client-assertion-type:jwt-bearer`,
//! and `client_assertion` — an RS256 JWT signed with the client certificate's
//! private key, carrying the certificate thumbprint in the `x5t` header.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwapOption;
use common::EncryptionError;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backoff::ExponentialBackoff;

/// Tokens are refreshed once their remaining lifetime drops below this.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(300);

/// Validity window of a signed client assertion.
const ASSERTION_LIFETIME: Duration = Duration::from_secs(600);

const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Certificate-based client credential for the AAD client-credentials grant.
pub struct ClientCertificateCredential {
    client_id: String,
    /// Base64url SHA-1 certificate thumbprint, sent as the JWT `x5t` header.
    thumbprint: String,
    signing_key: EncodingKey,
}

impl std::fmt::Debug for ClientCertificateCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCertificateCredential")
            .field("client_id", &self.client_id)
            .field("thumbprint", &self.thumbprint)
            .field("signing_key", &"[REDACTED]")
            .finish()
    }
}

impl ClientCertificateCredential {
    /// Build a credential from an RSA private key in PEM form.
    ///
    /// # Errors
    ///
    /// Returns [`EncryptionError::AadUnavailable`] if the PEM cannot be
    /// parsed as an RSA private key.
    pub fn from_rsa_pem(
        client_id: impl Into<String>,
        thumbprint: impl Into<String>,
        private_key_pem: &[u8],
    ) -> Result<Self, EncryptionError> {
        let signing_key = EncodingKey::from_rsa_pem(private_key_pem).map_err(|e| {
            EncryptionError::AadUnavailable(format!("invalid client certificate key: {e}"))
        })?;
        Ok(Self {
            client_id: client_id.into(),
            thumbprint: thumbprint.into(),
            signing_key,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Sign a fresh client assertion addressed to `audience`.
    fn sign_assertion(&self, audience: &str) -> Result<String, EncryptionError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| {
                EncryptionError::AadUnavailable("system clock is before the UNIX epoch".into())
            })?
            .as_secs();

        let mut header = Header::new(Algorithm::RS256);
        header.x5t = Some(self.thumbprint.clone());

        let claims = AssertionClaims {
            aud: audience.to_owned(),
            iss: self.client_id.clone(),
            sub: self.client_id.clone(),
            jti: Uuid::new_v4().to_string(),
            nbf: now,
            exp: now + ASSERTION_LIFETIME.as_secs(),
        };

        jsonwebtoken::encode(&header, &claims, &self.signing_key).map_err(|e| {
            EncryptionError::AadUnavailable(format!("failed to sign client assertion: {e}"))
        })
    }
}

#[derive(Serialize)]
struct AssertionClaims {
    aud: String,
    iss: String,
    sub: String,
    jti: String,
    nbf: u64,
    exp: u64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Acquires and caches AAD bearer tokens for one `(authority, resource)` pair.
pub struct AadTokenProvider {
    authority: String,
    resource: String,
    credential: Arc<ClientCertificateCredential>,
    http: reqwest::Client,
    retry_interval: Duration,
    retry_count: u32,
    /// Lock-free read path; refreshes swap in a new token atomically.
    cached: ArcSwapOption<CachedToken>,
    /// Serialises refreshes so one expiry triggers one authority round-trip.
    refresh: Mutex<()>,
}

impl std::fmt::Debug for AadTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AadTokenProvider")
            .field("authority", &self.authority)
            .field("resource", &self.resource)
            .finish_non_exhaustive()
    }
}

impl AadTokenProvider {
    pub fn new(
        authority: impl Into<String>,
        resource: impl Into<String>,
        credential: Arc<ClientCertificateCredential>,
        http: reqwest::Client,
        retry_interval: Duration,
        retry_count: u32,
    ) -> Self {
        Self {
            authority: authority.into(),
            resource: resource.into(),
            credential,
            http,
            retry_interval,
            retry_count,
            cached: ArcSwapOption::empty(),
            refresh: Mutex::new(()),
        }
    }

    /// Return a bearer token, from cache when still comfortably valid.
    ///
    /// # Errors
    ///
    /// Returns [`EncryptionError::AadUnavailable`] after the configured
    /// retries are exhausted or on a terminal authority rejection.
    pub async fn get_access_token(&self) -> Result<String, EncryptionError> {
        if let Some(cached) = self.cached.load_full() {
            if cached.expires_at > Instant::now() {
                return Ok(cached.token.clone());
            }
        }

        let _guard = self.refresh.lock().await;
        // Another caller may have refreshed while we waited for the lock.
        if let Some(cached) = self.cached.load_full() {
            if cached.expires_at > Instant::now() {
                return Ok(cached.token.clone());
            }
        }

        let (token, expires_in) = self.request_token().await?;
        let lifetime = Duration::from_secs(expires_in).saturating_sub(TOKEN_REFRESH_MARGIN);
        self.cached.store(Some(Arc::new(CachedToken {
            token: token.clone(),
            expires_at: Instant::now() + lifetime,
        })));
        debug!(authority = %self.authority, expires_in, "AAD token refreshed");
        Ok(token)
    }

    async fn request_token(&self) -> Result<(String, u64), EncryptionError> {
        let endpoint = format!(
            "{}/oauth2/v2.0/token",
            self.authority.trim_end_matches('/')
        );
        let scope = format!("{}/.default", self.resource.trim_end_matches('/'));
        let mut backoff = ExponentialBackoff::for_transport(self.retry_interval);
        let mut attempt: u32 = 0;

        loop {
            let assertion = self.credential.sign_assertion(&endpoint)?;
            let result = self
                .http
                .post(&endpoint)
                .form(&[
                    ("grant_type", "client_credentials"),
                    ("client_id", self.credential.client_id()),
                    ("scope", scope.as_str()),
                    ("client_assertion_type", CLIENT_ASSERTION_TYPE),
                    ("client_assertion", assertion.as_str()),
                ])
                .send()
                .await;

            let failure = match result {
                Ok(resp) if resp.status().is_success() => {
                    let body: TokenResponse = resp.json().await.map_err(|e| {
                        EncryptionError::AadUnavailable(format!(
                            "authority returned an unreadable token response: {e}"
                        ))
                    })?;
                    return Ok((body.access_token, body.expires_in));
                }
                Ok(resp) if resp.status().is_client_error() => {
                    // 4xx is terminal: retrying cannot help a rejected grant.
                    return Err(EncryptionError::AadUnavailable(format!(
                        "authority rejected the token request: HTTP {}",
                        resp.status()
                    )));
                }
                Ok(resp) => format!("authority returned HTTP {}", resp.status()),
                Err(e) => format!("transport failure: {e}"),
            };

            if attempt >= self.retry_count {
                return Err(EncryptionError::AadUnavailable(format!(
                    "{failure} (after {} attempts)",
                    attempt + 1
                )));
            }
            attempt += 1;
            let delay = backoff.next_delay();
            warn!(
                authority = %self.authority,
                error = %failure,
                retry_in_ms = delay.as_millis() as u64,
                "AAD token request failed, will retry"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // PKCS#8 RSA-2048 test key, generated for these tests only.
    const TEST_RSA_PEM: &[u8] = include_bytes!("testdata/test_rsa_key.pem");

    fn credential() -> ClientCertificateCredential {
        ClientCertificateCredential::from_rsa_pem(
            "11111111-2222-3333-4444-555555555555",
            "n4bQgYhMfWWaL-qgxVrQFaO_TxsrC4Is0V1sFbDwCgg",
            TEST_RSA_PEM,
        )
        .unwrap()
    }

    #[test]
    fn rejects_garbage_pem() {
        let err = ClientCertificateCredential::from_rsa_pem("c", "t", b"not a pem").unwrap_err();
        assert!(matches!(err, EncryptionError::AadUnavailable(_)));
    }

    #[test]
    fn signing_key_redacted_in_debug() {
        let cred = credential();
        let debug = format!("{cred:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(debug.contains("11111111-2222-3333-4444-555555555555"));
    }

    #[test]
    fn assertion_is_a_three_part_jwt() {
        let cred = credential();
        let assertion = cred
            .sign_assertion("https://login.example.net/tenant/oauth2/v2.0/token")
            .unwrap();
        assert_eq!(assertion.split('.').count(), 3);
    }

    #[test]
    fn assertion_header_carries_thumbprint() {
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        use base64::Engine as _;

        let cred = credential();
        let assertion = cred.sign_assertion("https://aud.example").unwrap();
        let header_b64 = assertion.split('.').next().unwrap();
        let header = String::from_utf8(URL_SAFE_NO_PAD.decode(header_b64).unwrap()).unwrap();
        assert!(header.contains("x5t"));
        assert!(header.contains("RS256"));
    }
}
