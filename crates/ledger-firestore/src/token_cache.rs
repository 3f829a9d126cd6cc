//! Access token management for Firestore authentication.
//!
//! Mints bearer tokens from a service account by signing an RS256 JWT
//! assertion and exchanging it at the OAuth2 token endpoint, then caches
//! them with:
//! - A 300 second refresh skew so tokens never expire mid-request
//! - Single-flight refresh (double-checked write lock) to prevent a
//!   thundering herd on the token endpoint
//! - An optional on-disk cache file written with mode 0600
//!
//! Refresh failures are returned as `AuthError`; a stale token is never
//! used as a fallback.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::credentials::ServiceAccountCredential;
use crate::error::{FirestoreError, FirestoreResult};
use crate::metrics::record_token_refresh;

// =============================================================================
// Constants
// =============================================================================

/// A cached token is reused only while `now < expiry - TOKEN_REFRESH_SKEW_SECS`.
pub const TOKEN_REFRESH_SKEW_SECS: i64 = 300;

/// Lifetime requested for signed assertions (the maximum Google accepts).
const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// Token lifetime assumed when the endpoint omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// OAuth scope for Firestore/Datastore access.
/// Uses datastore scope which provides necessary permissions for Firestore REST API.
pub const FIRESTORE_SCOPE: &str = "https://www.googleapis.com/auth/datastore";

/// Grant type for the signed-JWT bearer exchange.
pub const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

// =============================================================================
// Token Source
// =============================================================================

/// Anything that can hand out bearer tokens for Firestore requests.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Return a usable bearer token, minting a new one if needed.
    async fn access_token(&self, force_refresh: bool) -> FirestoreResult<String>;

    /// Drop any cached token so the next call mints a fresh one.
    async fn invalidate(&self);
}

/// Fixed token, used for the Firestore emulator (which accepts `owner`).
#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Token accepted by the Firestore emulator with full privileges.
    pub fn emulator() -> Self {
        Self::new("owner")
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn access_token(&self, _force_refresh: bool) -> FirestoreResult<String> {
        Ok(self.0.clone())
    }

    async fn invalidate(&self) {}
}

// =============================================================================
// Access Token
// =============================================================================

/// Bearer token with its absolute expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessToken {
    pub token: String,
    #[serde(rename = "expiry")]
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    /// True if the token may still be used at `now`.
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at - Duration::seconds(TOKEN_REFRESH_SKEW_SECS)
    }
}

/// Claims of the signed assertion sent to the token endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct AssertionClaims {
    pub iss: String,
    pub scope: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<i64>,
}

// =============================================================================
// Token Manager
// =============================================================================

/// Service-account token manager with single-flight refresh.
pub struct TokenManager {
    credential: ServiceAccountCredential,
    http: Client,
    scope: String,
    cache_file: Option<PathBuf>,
    cache: RwLock<Option<AccessToken>>,
}

impl TokenManager {
    /// Create a token manager for `credential`, using `http` for the exchange.
    pub fn new(credential: ServiceAccountCredential, http: Client) -> Self {
        Self {
            credential,
            http,
            scope: FIRESTORE_SCOPE.to_string(),
            cache_file: None,
            cache: RwLock::new(None),
        }
    }

    /// Also persist tokens to `path` (created with mode 0600).
    pub fn with_cache_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_file = Some(path.into());
        self
    }

    /// Request a different OAuth scope.
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    pub fn credential(&self) -> &ServiceAccountCredential {
        &self.credential
    }

    /// Get a valid access token, refreshing if necessary.
    ///
    /// - Fast path: return the cached token under a read lock
    /// - Slow path: take the write lock, double-check, then refresh
    ///
    /// With `force_refresh`, the token the caller last saw is replaced; if
    /// another task already replaced it while we waited, that token is reused.
    pub async fn get_access_token(&self, force_refresh: bool) -> FirestoreResult<String> {
        let seen = {
            let cache = self.cache.read().await;
            match cache.as_ref() {
                Some(cached) if !force_refresh && cached.is_fresh_at(Utc::now()) => {
                    return Ok(cached.token.clone());
                }
                Some(cached) => Some(cached.token.clone()),
                None => None,
            }
        };

        let mut cache = self.cache.write().await;

        // Double-check: another task may have refreshed while we waited
        if let Some(cached) = cache.as_ref() {
            let replaced = seen.as_deref() != Some(cached.token.as_str());
            if cached.is_fresh_at(Utc::now()) && (!force_refresh || replaced) {
                return Ok(cached.token.clone());
            }
        }

        if !force_refresh {
            if let Some(persisted) = self.load_cache_file().await {
                if persisted.is_fresh_at(Utc::now()) {
                    debug!("Using access token from cache file");
                    let token = persisted.token.clone();
                    *cache = Some(persisted);
                    return Ok(token);
                }
            }
        }

        let fresh = match self.refresh().await {
            Ok(token) => {
                record_token_refresh("success");
                token
            }
            Err(e) => {
                record_token_refresh("failure");
                return Err(e);
            }
        };
        self.store_cache_file(&fresh).await;

        let token = fresh.token.clone();
        *cache = Some(fresh);
        Ok(token)
    }

    /// Invalidate the cached token, in memory and on disk.
    pub async fn invalidate(&self) {
        let mut cache = self.cache.write().await;
        *cache = None;
        if let Some(path) = &self.cache_file {
            match tokio::fs::remove_file(path).await {
                Ok(()) => debug!(path = %path.display(), "Removed token cache file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), "Failed to remove token cache file: {}", e),
            }
        }
    }

    /// Sign a JWT assertion for the token endpoint.
    pub(crate) fn sign_assertion(&self, now: DateTime<Utc>) -> FirestoreResult<String> {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.credential.private_key_id().map(str::to_string);

        let claims = AssertionClaims {
            iss: self.credential.client_email().to_string(),
            scope: self.scope.clone(),
            aud: self.credential.token_uri().to_string(),
            iat: now.timestamp(),
            exp: (now + Duration::seconds(ASSERTION_LIFETIME_SECS)).timestamp(),
        };

        let key = EncodingKey::from_rsa_pem(self.credential.private_key_pem().as_bytes())
            .map_err(|e| FirestoreError::auth_error(format!("Invalid service account key: {}", e)))?;

        jsonwebtoken::encode(&header, &claims, &key)
            .map_err(|e| FirestoreError::auth_error(format!("Failed to sign JWT assertion: {}", e)))
    }

    /// Mint a new token via the jwt-bearer exchange.
    async fn refresh(&self) -> FirestoreResult<AccessToken> {
        let now = Utc::now();
        let assertion = self.sign_assertion(now)?;
        let token_uri = self.credential.token_uri();

        let response = self
            .http
            .post(token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|e| FirestoreError::auth_error(format!("Token endpoint unreachable: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "Token exchange rejected");
            return Err(FirestoreError::auth_error(format!(
                "Token endpoint returned {}: {}",
                status.as_u16(),
                body
            )));
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| FirestoreError::auth_error(format!("Malformed token response: {}", e)))?;

        if parsed.access_token.is_empty() {
            return Err(FirestoreError::auth_error("Token endpoint returned an empty access_token"));
        }

        let expires_in = parsed.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        info!(
            client_email = %self.credential.client_email(),
            expires_in,
            "Refreshed Firestore access token"
        );

        Ok(AccessToken {
            token: parsed.access_token,
            expires_at: now + Duration::seconds(expires_in),
        })
    }

    async fn load_cache_file(&self) -> Option<AccessToken> {
        let path = self.cache_file.as_ref()?;
        let contents = tokio::fs::read(path).await.ok()?;
        match serde_json::from_slice(&contents) {
            Ok(token) => Some(token),
            Err(e) => {
                warn!(path = %path.display(), "Ignoring unreadable token cache file: {}", e);
                None
            }
        }
    }

    async fn store_cache_file(&self, token: &AccessToken) {
        let Some(path) = self.cache_file.as_ref() else {
            return;
        };

        let payload = match serde_json::to_vec(token) {
            Ok(p) => p,
            Err(e) => {
                warn!("Failed to serialize access token for cache file: {}", e);
                return;
            }
        };

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);

        let result: std::io::Result<()> = async {
            let mut file = options.open(path).await?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
            }
            file.write_all(&payload).await?;
            file.flush().await
        }
        .await;

        if let Err(e) = result {
            warn!(path = %path.display(), "Failed to write token cache file: {}", e);
        }
    }
}

#[async_trait]
impl TokenSource for TokenManager {
    async fn access_token(&self, force_refresh: bool) -> FirestoreResult<String> {
        self.get_access_token(force_refresh).await
    }

    async fn invalidate(&self) {
        TokenManager::invalidate(self).await;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use jsonwebtoken::{DecodingKey, Validation};
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::testing::{test_credential, TEST_PUBLIC_KEY_PEM};

    fn manager(server: &MockServer) -> TokenManager {
        TokenManager::new(test_credential(&format!("{}/token", server.uri())), Client::new())
    }

    fn token_response(token: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": token,
            "expires_in": 3600,
            "token_type": "Bearer"
        }))
    }

    #[test]
    fn test_refresh_boundary() {
        let now = Utc::now();
        let reusable = AccessToken {
            token: "a".into(),
            expires_at: now + Duration::seconds(301),
        };
        let stale = AccessToken {
            token: "b".into(),
            expires_at: now + Duration::seconds(299),
        };
        assert!(reusable.is_fresh_at(now));
        assert!(!stale.is_fresh_at(now));
    }

    #[test]
    fn test_assertion_is_valid_rs256_jwt() {
        let manager = TokenManager::new(
            test_credential("https://oauth2.example.test/token"),
            Client::new(),
        );
        let now = Utc::now();
        let jwt = manager.sign_assertion(now).unwrap();

        let header = jsonwebtoken::decode_header(&jwt).unwrap();
        assert_eq!(header.alg, Algorithm::RS256);
        assert_eq!(header.typ.as_deref(), Some("JWT"));
        assert_eq!(header.kid.as_deref(), Some("test-key-id"));

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&["https://oauth2.example.test/token"]);
        let key = DecodingKey::from_rsa_pem(TEST_PUBLIC_KEY_PEM.as_bytes()).unwrap();
        let claims = jsonwebtoken::decode::<AssertionClaims>(&jwt, &key, &validation)
            .unwrap()
            .claims;

        assert_eq!(claims.iss, "ledger-test@test-project.iam.gserviceaccount.com");
        assert_eq!(claims.scope, FIRESTORE_SCOPE);
        assert_eq!(claims.iat, now.timestamp());
        assert_eq!(claims.exp - claims.iat, 3600);
    }

    #[tokio::test]
    async fn test_token_is_cached() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant-type%3Ajwt-bearer"))
            .and(body_string_contains("assertion="))
            .respond_with(token_response("ya29.first"))
            .expect(1)
            .mount(&server)
            .await;

        let manager = manager(&server);
        assert_eq!(manager.get_access_token(false).await.unwrap(), "ya29.first");
        assert_eq!(manager.get_access_token(false).await.unwrap(), "ya29.first");
    }

    #[tokio::test]
    async fn test_force_refresh_and_invalidate_mint_new_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(token_response("ya29.token"))
            .expect(3)
            .mount(&server)
            .await;

        let manager = manager(&server);
        manager.get_access_token(false).await.unwrap();
        manager.get_access_token(true).await.unwrap();
        manager.invalidate().await;
        manager.get_access_token(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_non_2xx_is_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_string(r#"{"error":"invalid_grant"}"#))
            .mount(&server)
            .await;

        let err = manager(&server).get_access_token(false).await.unwrap_err();
        match err {
            FirestoreError::AuthError(msg) => assert!(msg.contains("invalid_grant")),
            other => panic!("expected AuthError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(token_response("ya29.shared").set_delay(std::time::Duration::from_millis(100)))
            .expect(1)
            .mount(&server)
            .await;

        let manager = Arc::new(manager(&server));
        let handles: Vec<_> = (0..20)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.get_access_token(false).await })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "ya29.shared");
        }
    }

    async fn write_cache_file(path: &std::path::Path, expires_in_secs: i64) {
        let token = AccessToken {
            token: "ya29.persisted".into(),
            expires_at: Utc::now() + Duration::seconds(expires_in_secs),
        };
        tokio::fs::write(path, serde_json::to_vec(&token).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cached_token_with_301s_left_is_reused() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(token_response("ya29.new"))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("token.json");
        write_cache_file(&cache_path, 301).await;

        let manager = manager(&server).with_cache_file(&cache_path);
        assert_eq!(manager.get_access_token(false).await.unwrap(), "ya29.persisted");
    }

    #[tokio::test]
    async fn test_cached_token_with_299s_left_is_refreshed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(token_response("ya29.new"))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("token.json");
        write_cache_file(&cache_path, 299).await;

        let manager = manager(&server).with_cache_file(&cache_path);
        assert_eq!(manager.get_access_token(false).await.unwrap(), "ya29.new");

        let persisted: AccessToken =
            serde_json::from_slice(&tokio::fs::read(&cache_path).await.unwrap()).unwrap();
        assert_eq!(persisted.token, "ya29.new");
    }

    #[tokio::test]
    async fn test_invalidate_skips_cache_file() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(token_response("ya29.minted"))
            .expect(2)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("token.json");
        let manager = manager(&server).with_cache_file(&cache_path);

        manager.get_access_token(false).await.unwrap();
        assert!(cache_path.exists());

        manager.invalidate().await;
        assert!(!cache_path.exists());
        manager.get_access_token(false).await.unwrap();

        // Invalidating with no file on disk is fine
        tokio::fs::remove_file(&cache_path).await.unwrap();
        manager.invalidate().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cache_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(token_response("ya29.private"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("token.json");
        let manager = manager(&server).with_cache_file(&cache_path);
        manager.get_access_token(false).await.unwrap();

        let mode = std::fs::metadata(&cache_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_static_token() {
        let source = StaticToken::emulator();
        assert_eq!(source.access_token(true).await.unwrap(), "owner");
    }
}
