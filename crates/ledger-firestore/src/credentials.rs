//! Service account credential loading.

use std::fmt;
use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use crate::error::{FirestoreError, FirestoreResult};

/// Default Google OAuth2 token endpoint.
pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Raw shape of a service account JSON key file.
#[derive(Deserialize)]
struct ServiceAccountFile {
    client_email: Option<String>,
    private_key: Option<String>,
    private_key_id: Option<String>,
    project_id: Option<String>,
    token_uri: Option<String>,
}

/// Service account key loaded into memory.
///
/// Immutable after loading; the private key is never printed.
#[derive(Clone)]
pub struct ServiceAccountCredential {
    client_email: String,
    private_key: String,
    private_key_id: Option<String>,
    project_id: Option<String>,
    token_uri: String,
}

impl ServiceAccountCredential {
    /// Load a credential from a JSON key file.
    pub async fn from_file(path: impl AsRef<Path>) -> FirestoreResult<Self> {
        let path = path.as_ref();
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            FirestoreError::Config(format!(
                "Failed to read service account file {}: {}",
                path.display(),
                e
            ))
        })?;
        let credential = Self::from_json(&contents)?;
        debug!(
            client_email = %credential.client_email,
            path = %path.display(),
            "Loaded service account credential"
        );
        Ok(credential)
    }

    /// Load the file named by `GOOGLE_APPLICATION_CREDENTIALS`.
    pub async fn from_env() -> FirestoreResult<Self> {
        let path = std::env::var("GOOGLE_APPLICATION_CREDENTIALS").map_err(|_| {
            FirestoreError::Config(
                "GOOGLE_APPLICATION_CREDENTIALS not set. \
                 Set it to the path of your service account JSON file."
                    .to_string(),
            )
        })?;
        Self::from_file(path).await
    }

    /// Parse a credential from JSON key file contents.
    pub fn from_json(json: &str) -> FirestoreResult<Self> {
        let raw: ServiceAccountFile = serde_json::from_str(json)
            .map_err(|e| FirestoreError::Config(format!("Invalid service account JSON: {}", e)))?;

        let client_email = raw
            .client_email
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| FirestoreError::Config("Service account is missing client_email".into()))?;
        let private_key = raw
            .private_key
            .filter(|s| s.contains("PRIVATE KEY"))
            .ok_or_else(|| {
                FirestoreError::Config("Service account is missing a PEM private_key".into())
            })?;

        Ok(Self {
            client_email,
            private_key,
            private_key_id: raw.private_key_id.filter(|s| !s.is_empty()),
            project_id: raw.project_id.filter(|s| !s.is_empty()),
            token_uri: raw
                .token_uri
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string()),
        })
    }

    pub fn client_email(&self) -> &str {
        &self.client_email
    }

    /// PEM-encoded RSA private key.
    pub fn private_key_pem(&self) -> &str {
        &self.private_key
    }

    pub fn private_key_id(&self) -> Option<&str> {
        self.private_key_id.as_deref()
    }

    pub fn project_id(&self) -> Option<&str> {
        self.project_id.as_deref()
    }

    /// OAuth2 token endpoint this credential exchanges assertions with.
    pub fn token_uri(&self) -> &str {
        &self.token_uri
    }
}

impl fmt::Debug for ServiceAccountCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountCredential")
            .field("client_email", &self.client_email)
            .field("private_key", &"<redacted>")
            .field("private_key_id", &self.private_key_id)
            .field("project_id", &self.project_id)
            .field("token_uri", &self.token_uri)
            .finish()
    }
}
