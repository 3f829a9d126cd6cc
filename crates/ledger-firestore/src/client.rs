//! Firestore REST API client.
//!
//! Production-grade client with:
//! - Pluggable token source (service-account JWT exchange or static emulator token)
//! - HTTP client tuning (pooling, timeouts)
//! - Read retries with exponential backoff and jitter
//! - Observability (tracing spans, metrics)

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tracing::{debug, info_span, Instrument};

use crate::codec::{decode_fields, encode, encode_fields};
use crate::credentials::ServiceAccountCredential;
use crate::error::{FirestoreError, FirestoreResult};
use crate::field_path::{check_collection, check_document_id, nest_updates, FieldPath};
use crate::metrics::record_request;
use crate::retry::{with_retry, RetryConfig};
use crate::store::{CommitResult, DocumentQuery, DocumentStore, FieldUpdate, StoredDocument, WriteOp};
use crate::token_cache::{StaticToken, TokenManager, TokenSource};
use crate::types::{
    CollectionSelector, CommitRequest, CommitResponse, CompositeFilter, Document, DocumentMask,
    DocumentTransform, FieldFilter, FieldReference, FieldTransformWire, Filter, Order,
    Precondition, RunQueryRequest, RunQueryResponse, StructuredQuery, Write,
};
use crate::value::Fields;

/// Production REST root.
pub const DEFAULT_API_ROOT: &str = "https://firestore.googleapis.com/v1";

// =============================================================================
// Configuration
// =============================================================================

/// Firestore client configuration.
#[derive(Debug, Clone)]
pub struct FirestoreConfig {
    /// GCP project ID; empty means "take it from the credential"
    pub project_id: String,
    /// Database ID (usually "(default)")
    pub database_id: String,
    /// REST root, e.g. `https://firestore.googleapis.com/v1`
    pub api_root: String,
    /// `host:port` of a local emulator, if any
    pub emulator_host: Option<String>,
    /// Request timeout
    pub timeout: Duration,
    /// Connect timeout
    pub connect_timeout: Duration,
    /// Retry configuration for reads
    pub retry: RetryConfig,
    /// Optional on-disk access token cache
    pub token_cache_path: Option<PathBuf>,
}

impl FirestoreConfig {
    /// Config for a project with default settings.
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            database_id: "(default)".to_string(),
            api_root: DEFAULT_API_ROOT.to_string(),
            emulator_host: None,
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            retry: RetryConfig::default(),
            token_cache_path: None,
        }
    }

    /// Create config from environment variables.
    pub fn from_env() -> FirestoreResult<Self> {
        let project_id = std::env::var("GCP_PROJECT_ID")
            .or_else(|_| std::env::var("FIREBASE_PROJECT_ID"))
            .unwrap_or_default();

        let timeout_secs: u64 = std::env::var("FIRESTORE_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        let connect_timeout_secs: u64 = std::env::var("FIRESTORE_CONNECT_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5);

        let emulator_host = std::env::var("FIRESTORE_EMULATOR_HOST")
            .ok()
            .filter(|h| !h.trim().is_empty());

        let api_root = match &emulator_host {
            Some(host) => format!("http://{}/v1", host.trim()),
            None => DEFAULT_API_ROOT.to_string(),
        };

        if timeout_secs == 0 {
            return Err(FirestoreError::Config(
                "FIRESTORE_TIMEOUT_SECS must be greater than zero".into(),
            ));
        }

        Ok(Self {
            project_id,
            database_id: std::env::var("FIRESTORE_DATABASE_ID")
                .unwrap_or_else(|_| "(default)".to_string()),
            api_root,
            emulator_host,
            timeout: Duration::from_secs(timeout_secs),
            connect_timeout: Duration::from_secs(connect_timeout_secs),
            retry: RetryConfig::from_env(),
            token_cache_path: std::env::var("FIRESTORE_TOKEN_CACHE_PATH")
                .ok()
                .filter(|p| !p.is_empty())
                .map(PathBuf::from),
        })
    }

    /// Point the client at a different REST root.
    pub fn with_api_root(mut self, api_root: impl Into<String>) -> Self {
        self.api_root = api_root.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// `projects/{p}/databases/{d}/documents`
    fn database_root(&self) -> String {
        format!(
            "projects/{}/databases/{}/documents",
            self.project_id, self.database_id
        )
    }
}

// =============================================================================
// Client
// =============================================================================

/// Firestore REST API client.
#[derive(Clone)]
pub struct FirestoreClient {
    http: Client,
    config: FirestoreConfig,
    base_url: String,
    tokens: Arc<dyn TokenSource>,
}

impl FirestoreClient {
    /// Create a new Firestore client.
    pub fn new(config: FirestoreConfig, tokens: Arc<dyn TokenSource>) -> FirestoreResult<Self> {
        if config.project_id.trim().is_empty() {
            return Err(FirestoreError::Config(
                "GCP_PROJECT_ID or FIREBASE_PROJECT_ID must be set to access Firestore".into(),
            ));
        }

        let http = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .user_agent(concat!("ledger-firestore/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let base_url = format!("{}/{}", config.api_root, config.database_root());

        Ok(Self {
            http,
            config,
            base_url,
            tokens,
        })
    }

    /// Create from environment variables.
    ///
    /// With `FIRESTORE_EMULATOR_HOST` set, a static `owner` token is used and
    /// no credential is loaded.
    pub async fn from_env() -> FirestoreResult<Self> {
        let mut config = FirestoreConfig::from_env()?;

        if config.emulator_host.is_some() {
            debug!(api_root = %config.api_root, "Using Firestore emulator");
            return Self::new(config, Arc::new(StaticToken::emulator()));
        }

        let credential = ServiceAccountCredential::from_env().await?;
        if config.project_id.is_empty() {
            config.project_id = credential.project_id().unwrap_or_default().to_string();
        }

        let token_http = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .build()?;
        let mut manager = TokenManager::new(credential, token_http);
        if let Some(path) = &config.token_cache_path {
            manager = manager.with_cache_file(path.clone());
        }

        Self::new(config, Arc::new(manager))
    }

    pub fn config(&self) -> &FirestoreConfig {
        &self.config
    }

    fn is_access_token_expired(body: &str) -> bool {
        body.contains("ACCESS_TOKEN_EXPIRED") || body.contains("\"UNAUTHENTICATED\"")
    }

    /// URL of a collection, with each segment percent-encoded.
    fn collection_url(&self, collection: &str) -> String {
        format!("{}/{}", self.base_url, encode_path(collection))
    }

    fn document_url(&self, collection: &str, doc_id: &str) -> String {
        format!(
            "{}/{}",
            self.collection_url(collection),
            urlencoding::encode(doc_id)
        )
    }

    /// Resource name used inside commit writes.
    fn document_name(&self, collection: &str, doc_id: &str) -> String {
        format!("{}/{}/{}", self.config.database_root(), collection, doc_id)
    }

    /// Send a request with a bearer token.
    ///
    /// A 401 caused by an expired token is retried once with a fresh token.
    async fn send<F>(&self, build: F) -> FirestoreResult<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let token = self.tokens.access_token(false).await?;
        let response = build(&self.http).bearer_auth(&token).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        if !Self::is_access_token_expired(&body) {
            return Err(FirestoreError::from_http_status(401, body));
        }

        debug!("Access token rejected, refreshing and retrying once");
        let token = self.tokens.access_token(true).await?;
        Ok(build(&self.http).bearer_auth(&token).send().await?)
    }

    // =========================================================================
    // CRUD Operations
    // =========================================================================

    async fn get_once(&self, collection: &str, doc_id: &str) -> FirestoreResult<Option<StoredDocument>> {
        let url = self.document_url(collection, doc_id);

        self.execute_request("get_document", collection, Some(doc_id), async {
            let response = self.send(|http| http.get(&url)).await?;
            match response.status() {
                StatusCode::OK => {
                    let doc: Document = response.json().await?;
                    Ok(Some(to_stored(doc, collection, doc_id)?))
                }
                StatusCode::NOT_FOUND => Ok(None),
                status => Err(Self::handle_error_response(status, &url, response).await),
            }
        })
        .await
    }

    async fn patch(
        &self,
        operation: &str,
        collection: &str,
        doc_id: &str,
        fields: &Fields,
        params: Vec<String>,
    ) -> FirestoreResult<StoredDocument> {
        let mut url = self.document_url(collection, doc_id);
        if !params.is_empty() {
            url = format!("{}?{}", url, params.join("&"));
        }
        let body = Document::new(encode_fields(fields));

        self.execute_request(operation, collection, Some(doc_id), async {
            let response = self.send(|http| http.patch(&url).json(&body)).await?;
            match response.status() {
                StatusCode::OK => {
                    let doc: Document = response.json().await?;
                    to_stored(doc, collection, doc_id)
                }
                StatusCode::NOT_FOUND => {
                    Err(FirestoreError::not_found(format!("{}/{}", collection, doc_id)))
                }
                StatusCode::PRECONDITION_FAILED | StatusCode::CONFLICT => {
                    let body_text = response.text().await.unwrap_or_default();
                    Err(FirestoreError::PreconditionFailed(format!(
                        "{}/{}: {}",
                        collection, doc_id, body_text
                    )))
                }
                status => Err(Self::handle_error_response(status, &url, response).await),
            }
        })
        .await
    }

    async fn run_query_once(
        &self,
        url: &str,
        collection: &str,
        request: &RunQueryRequest,
    ) -> FirestoreResult<Vec<StoredDocument>> {
        self.execute_request("run_query", collection, None, async {
            let response = self.send(|http| http.post(url).json(request)).await?;
            match response.status() {
                StatusCode::OK => {
                    let body = response.text().await.unwrap_or_default();
                    // runQuery returns a JSON array of RunQueryResponse objects
                    let responses: Vec<RunQueryResponse> =
                        serde_json::from_str(&body).map_err(|e| {
                            FirestoreError::InvalidResponse(format!(
                                "Failed to parse runQuery response: {} (body prefix: {})",
                                e,
                                body.chars().take(200).collect::<String>()
                            ))
                        })?;

                    responses
                        .into_iter()
                        .filter_map(|r| r.document)
                        .map(|doc| {
                            let id = doc.id().unwrap_or_default().to_string();
                            to_stored(doc, collection, &id)
                        })
                        .collect()
                }
                status => Err(Self::handle_error_response(status, url, response).await),
            }
        })
        .await
    }

    fn to_write(&self, op: &WriteOp) -> FirestoreResult<Write> {
        check_collection(op.collection())?;
        check_document_id(op.id())?;
        let name = self.document_name(op.collection(), op.id());

        Ok(match op {
            WriteOp::Create { fields, .. } => Write {
                update: Some(Document::named(name, encode_fields(fields))),
                current_document: Some(Precondition::exists(false)),
                ..Default::default()
            },
            WriteOp::Set { fields, .. } => Write {
                update: Some(Document::named(name, encode_fields(fields))),
                ..Default::default()
            },
            WriteOp::Update {
                updates,
                if_update_time,
                ..
            } => {
                let (fields, mask) = nest_updates(updates.iter().map(|u| (u.path.as_str(), &u.value)))?;
                Write {
                    update: Some(Document::named(name, encode_fields(&fields))),
                    update_mask: Some(DocumentMask { field_paths: mask }),
                    current_document: Some(match if_update_time {
                        Some(ts) => Precondition::update_time(ts.clone()),
                        None => Precondition::exists(true),
                    }),
                    ..Default::default()
                }
            }
            WriteOp::Transform { transforms, .. } => {
                if transforms.is_empty() {
                    return Err(FirestoreError::validation("transform write has no fields"));
                }
                let field_transforms = transforms
                    .iter()
                    .map(|t| {
                        Ok(FieldTransformWire {
                            field_path: FieldPath::parse(&t.field_path)?.to_mask(),
                            increment: Some(encode(&t.delta.to_field_value())),
                        })
                    })
                    .collect::<FirestoreResult<Vec<_>>>()?;
                Write {
                    transform: Some(DocumentTransform {
                        document: name,
                        field_transforms,
                    }),
                    current_document: Some(Precondition::exists(true)),
                    ..Default::default()
                }
            }
            WriteOp::Delete { .. } => Write {
                delete: Some(name),
                ..Default::default()
            },
        })
    }

    // =========================================================================
    // Internal Helpers
    // =========================================================================

    /// Execute a request with tracing and metrics.
    async fn execute_request<T, F>(
        &self,
        operation: &str,
        collection: &str,
        doc_id: Option<&str>,
        fut: F,
    ) -> FirestoreResult<T>
    where
        F: std::future::Future<Output = FirestoreResult<T>>,
    {
        let span = if let Some(id) = doc_id {
            info_span!("firestore_request", operation = %operation, collection = %collection, doc_id = %id)
        } else {
            info_span!("firestore_request", operation = %operation, collection = %collection)
        };

        let start = Instant::now();
        let result = fut.instrument(span).await;
        let latency_ms = start.elapsed().as_millis() as f64;

        let status = match &result {
            Ok(_) => 200,
            Err(e) => e.http_status().unwrap_or(500),
        };
        record_request(operation, status, latency_ms);

        result
    }

    async fn handle_error_response(status: StatusCode, url: &str, response: Response) -> FirestoreError {
        let body = response.text().await.unwrap_or_default();
        FirestoreError::from_http_status(status.as_u16(), format!("{} failed: {}", url, body))
    }
}

#[async_trait]
impl DocumentStore for FirestoreClient {
    async fn get_document(
        &self,
        collection: &str,
        doc_id: &str,
    ) -> FirestoreResult<Option<StoredDocument>> {
        check_collection(collection)?;
        check_document_id(doc_id)?;
        with_retry(&self.config.retry, "get_document", || self.get_once(collection, doc_id)).await
    }

    async fn write_document(
        &self,
        collection: &str,
        fields: &Fields,
        doc_id: Option<&str>,
    ) -> FirestoreResult<StoredDocument> {
        check_collection(collection)?;
        if let Some(id) = doc_id {
            check_document_id(id)?;
            // PATCH without a mask replaces the whole document, creating it if needed
            return self.patch("write_document", collection, id, fields, Vec::new()).await;
        }

        let url = self.collection_url(collection);
        let body = Document::new(encode_fields(fields));

        self.execute_request("write_document", collection, None, async {
            let response = self.send(|http| http.post(&url).json(&body)).await?;
            match response.status() {
                StatusCode::OK | StatusCode::CREATED => {
                    let doc: Document = response.json().await?;
                    let id = doc
                        .id()
                        .map(str::to_string)
                        .ok_or_else(|| FirestoreError::InvalidResponse("created document has no name".into()))?;
                    to_stored(doc, collection, &id)
                }
                status => Err(Self::handle_error_response(status, &url, response).await),
            }
        })
        .await
    }

    async fn create_document(
        &self,
        collection: &str,
        doc_id: &str,
        fields: &Fields,
    ) -> FirestoreResult<StoredDocument> {
        check_collection(collection)?;
        check_document_id(doc_id)?;
        let url = format!(
            "{}?documentId={}",
            self.collection_url(collection),
            urlencoding::encode(doc_id)
        );
        let body = Document::new(encode_fields(fields));

        self.execute_request("create_document", collection, Some(doc_id), async {
            let response = self.send(|http| http.post(&url).json(&body)).await?;
            match response.status() {
                StatusCode::OK | StatusCode::CREATED => {
                    let doc: Document = response.json().await?;
                    to_stored(doc, collection, doc_id)
                }
                StatusCode::CONFLICT => Err(FirestoreError::AlreadyExists(format!(
                    "{}/{}",
                    collection, doc_id
                ))),
                status => Err(Self::handle_error_response(status, &url, response).await),
            }
        })
        .await
    }

    async fn update_document(
        &self,
        collection: &str,
        doc_id: &str,
        updates: &[FieldUpdate],
    ) -> FirestoreResult<StoredDocument> {
        check_collection(collection)?;
        check_document_id(doc_id)?;
        let (fields, mask) = nest_updates(updates.iter().map(|u| (u.path.as_str(), &u.value)))?;

        let mut params = mask_params(&mask);
        params.push("currentDocument.exists=true".to_string());
        self.patch("update_document", collection, doc_id, &fields, params).await
    }

    async fn update_document_if_unchanged(
        &self,
        collection: &str,
        doc_id: &str,
        updates: &[FieldUpdate],
        update_time: &str,
    ) -> FirestoreResult<StoredDocument> {
        check_collection(collection)?;
        check_document_id(doc_id)?;
        let (fields, mask) = nest_updates(updates.iter().map(|u| (u.path.as_str(), &u.value)))?;

        let mut params = mask_params(&mask);
        params.push(format!(
            "currentDocument.updateTime={}",
            urlencoding::encode(update_time)
        ));
        self.patch("update_document_precondition", collection, doc_id, &fields, params)
            .await
    }

    async fn delete_document(&self, collection: &str, doc_id: &str) -> FirestoreResult<()> {
        check_collection(collection)?;
        check_document_id(doc_id)?;
        let url = self.document_url(collection, doc_id);

        self.execute_request("delete_document", collection, Some(doc_id), async {
            let response = self.send(|http| http.delete(&url)).await?;
            match response.status() {
                StatusCode::OK | StatusCode::NO_CONTENT => Ok(()),
                StatusCode::NOT_FOUND => {
                    debug!("Document {}/{} already deleted (idempotent)", collection, doc_id);
                    Ok(())
                }
                status => Err(Self::handle_error_response(status, &url, response).await),
            }
        })
        .await
    }

    /// Run a structured query on a collection.
    ///
    /// Nested collections (`orders/o1/guards`) are queried through their
    /// parent document: `POST .../orders/o1:runQuery` with `from: guards`.
    async fn query_documents(
        &self,
        collection: &str,
        query: &DocumentQuery,
    ) -> FirestoreResult<Vec<StoredDocument>> {
        check_collection(collection)?;
        let (parent, collection_id) = match collection.rsplit_once('/') {
            Some((parent, id)) => (Some(parent), id),
            None => (None, collection),
        };

        let url = match parent {
            Some(parent) => format!("{}/{}:runQuery", self.base_url, encode_path(parent)),
            None => format!("{}:runQuery", self.base_url),
        };
        let request = RunQueryRequest {
            structured_query: build_structured_query(collection_id, query)?,
        };

        with_retry(&self.config.retry, "run_query", || {
            self.run_query_once(&url, collection, &request)
        })
        .await
    }

    async fn commit(&self, writes: &[WriteOp]) -> FirestoreResult<CommitResult> {
        if writes.is_empty() {
            return Ok(CommitResult::default());
        }

        let request = CommitRequest {
            writes: writes
                .iter()
                .map(|op| self.to_write(op))
                .collect::<FirestoreResult<Vec<_>>>()?,
        };
        let url = format!("{}:commit", self.base_url);
        let first = writes[0].collection();

        self.execute_request("commit", first, None, async {
            let response = self.send(|http| http.post(&url).json(&request)).await?;
            match response.status() {
                StatusCode::OK => {
                    let committed: CommitResponse = response.json().await?;
                    Ok(CommitResult {
                        commit_time: committed.commit_time,
                        update_times: committed
                            .write_results
                            .unwrap_or_default()
                            .into_iter()
                            .map(|r| r.update_time)
                            .collect(),
                    })
                }
                status => Err(Self::handle_error_response(status, &url, response).await),
            }
        })
        .await
    }
}

/// Percent-encode each segment of a slash-separated path.
fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|s| urlencoding::encode(s).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn mask_params(mask: &[String]) -> Vec<String> {
    mask.iter()
        .map(|f| format!("updateMask.fieldPaths={}", urlencoding::encode(f)))
        .collect()
}

fn build_structured_query(collection_id: &str, query: &DocumentQuery) -> FirestoreResult<StructuredQuery> {
    let mut filters = query
        .filters
        .iter()
        .map(|f| {
            Ok(Filter::FieldFilter(FieldFilter {
                field: FieldReference {
                    field_path: FieldPath::parse(&f.field)?.to_mask(),
                },
                op: f.op,
                value: encode(&f.value),
            }))
        })
        .collect::<FirestoreResult<Vec<_>>>()?;

    let where_ = match filters.len() {
        0 => None,
        1 => filters.pop(),
        _ => Some(Filter::CompositeFilter(CompositeFilter {
            op: "AND".to_string(),
            filters,
        })),
    };

    let order_by = match &query.order_by {
        Some(field) => vec![Order {
            field: FieldReference {
                field_path: FieldPath::parse(field)?.to_mask(),
            },
            direction: query.direction,
        }],
        None => Vec::new(),
    };

    Ok(StructuredQuery {
        from: vec![CollectionSelector {
            collection_id: collection_id.to_string(),
        }],
        where_,
        order_by,
        limit: query.limit,
    })
}

/// Convert a wire document to a stored document.
///
/// The collection path and id come from the resource name when present.
fn to_stored(doc: Document, collection: &str, doc_id: &str) -> FirestoreResult<StoredDocument> {
    let (collection, id) = doc
        .name
        .as_deref()
        .and_then(|name| name.split_once("/documents/"))
        .and_then(|(_, path)| path.rsplit_once('/'))
        .map(|(c, i)| (c.to_string(), i.to_string()))
        .unwrap_or_else(|| (collection.to_string(), doc_id.to_string()));

    let fields = match &doc.fields {
        Some(fields) => decode_fields(fields)?,
        None => Fields::new(),
    };

    Ok(StoredDocument {
        collection,
        id,
        fields,
        create_time: doc.create_time,
        update_time: doc.update_time,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use serde_json::json;
    use serial_test::serial;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::store::{Delta, Direction, FieldTransform};
    use crate::value::FieldValue;

    const DOCS: &str = "/v1/projects/test-project/databases/(default)/documents";

    fn client(server: &MockServer) -> FirestoreClient {
        let config = FirestoreConfig::new("test-project")
            .with_api_root(format!("{}/v1", server.uri()))
            .with_retry(RetryConfig {
                max_retries: 1,
                base_delay_ms: 1,
                max_delay_ms: 5,
            });
        FirestoreClient::new(config, Arc::new(StaticToken::new("test-token"))).unwrap()
    }

    fn coupon_doc(usage: &str) -> serde_json::Value {
        json!({
            "name": "projects/test-project/databases/(default)/documents/coupons/SAVE10",
            "fields": {
                "code": {"stringValue": "SAVE10"},
                "usageCount": {"integerValue": usage}
            },
            "createTime": "2024-05-01T00:00:00.000001Z",
            "updateTime": "2024-05-01T00:00:00.000002Z"
        })
    }

    #[test]
    #[serial]
    fn test_config_from_env_defaults() {
        std::env::set_var("GCP_PROJECT_ID", "test-project");
        std::env::remove_var("FIRESTORE_CONNECT_TIMEOUT_SECS");
        std::env::remove_var("FIRESTORE_TIMEOUT_SECS");
        std::env::remove_var("FIRESTORE_EMULATOR_HOST");
        let config = FirestoreConfig::from_env().unwrap();
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.api_root, DEFAULT_API_ROOT);
        std::env::remove_var("GCP_PROJECT_ID");
    }

    #[test]
    #[serial]
    fn test_config_from_env_emulator() {
        std::env::set_var("FIRESTORE_EMULATOR_HOST", "localhost:8080");
        let config = FirestoreConfig::from_env().unwrap();
        assert_eq!(config.api_root, "http://localhost:8080/v1");
        std::env::remove_var("FIRESTORE_EMULATOR_HOST");
    }

    #[test]
    fn test_new_requires_project_id() {
        let result = FirestoreClient::new(FirestoreConfig::new(""), Arc::new(StaticToken::emulator()));
        assert!(matches!(result, Err(FirestoreError::Config(_))));
    }

    #[tokio::test]
    async fn test_get_document_decodes_fields() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{}/coupons/SAVE10", DOCS)))
            .and(header("authorization", "Bearer test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(coupon_doc("5")))
            .mount(&server)
            .await;

        let doc = client(&server)
            .get_document("coupons", "SAVE10")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(doc.id, "SAVE10");
        assert_eq!(doc.collection, "coupons");
        assert_eq!(doc.fields["usageCount"], FieldValue::Int(5));
        assert_eq!(doc.update_time.as_deref(), Some("2024-05-01T00:00:00.000002Z"));
    }

    #[tokio::test]
    async fn test_get_missing_document_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": {"code": 404, "status": "NOT_FOUND"}
            })))
            .mount(&server)
            .await;

        let doc = client(&server).get_document("coupons", "NOPE").await.unwrap();
        assert!(doc.is_none());
    }

    #[tokio::test]
    async fn test_get_retries_transient_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(2)
            .mount(&server)
            .await;

        let result = client(&server).get_document("coupons", "SAVE10").await;
        assert!(matches!(result, Err(FirestoreError::ServerError(503, _))));
    }

    #[tokio::test]
    async fn test_expired_token_retried_with_fresh_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": {"code": 401, "status": "UNAUTHENTICATED"}
            })))
            .expect(2)
            .mount(&server)
            .await;

        // A static token cannot be refreshed, so the second 401 surfaces as an auth error
        let result = client(&server).get_document("coupons", "SAVE10").await;
        assert!(matches!(result, Err(FirestoreError::AuthError(_))));
    }

    #[tokio::test]
    async fn test_malformed_body_is_invalid_response_and_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{not json"))
            .expect(1)
            .mount(&server)
            .await;

        let result = client(&server).get_document("coupons", "SAVE10").await;
        match result {
            Err(err @ FirestoreError::InvalidResponse(_)) => assert!(!err.is_transient()),
            other => panic!("expected invalid response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_permission_denied_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&server)
            .await;

        let result = client(&server).get_document("coupons", "SAVE10").await;
        assert!(matches!(result, Err(FirestoreError::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn test_create_document_conflict() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("{}/coupons", DOCS)))
            .and(query_param("documentId", "SAVE10"))
            .respond_with(ResponseTemplate::new(409))
            .mount(&server)
            .await;

        let result = client(&server)
            .create_document("coupons", "SAVE10", &Fields::new())
            .await;
        assert!(matches!(result, Err(FirestoreError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_update_document_sends_mask_and_exists_precondition() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path(format!("{}/coupons/SAVE10", DOCS)))
            .and(query_param("updateMask.fieldPaths", "stats.`2024-05`"))
            .and(query_param("currentDocument.exists", "true"))
            .and(body_json(json!({
                "fields": {"stats": {"mapValue": {"fields": {"2024-05": {"integerValue": "3"}}}}}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(coupon_doc("5")))
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .update_document("coupons", "SAVE10", &[FieldUpdate::new("stats.2024-05", 3i64)])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_update_if_unchanged_maps_failed_precondition() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(query_param("currentDocument.updateTime", "2024-05-01T00:00:00.000002Z"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {"code": 400, "status": "FAILED_PRECONDITION"}
            })))
            .mount(&server)
            .await;

        let result = client(&server)
            .update_document_if_unchanged(
                "coupons",
                "SAVE10",
                &[FieldUpdate::new("usageCount", 6i64)],
                "2024-05-01T00:00:00.000002Z",
            )
            .await;
        assert!(matches!(result, Err(FirestoreError::PreconditionFailed(_))));
    }

    #[tokio::test]
    async fn test_delete_absent_document_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        client(&server).delete_document("coupons", "GONE").await.unwrap();
    }

    #[tokio::test]
    async fn test_commit_transform_wire_format() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("{}:commit", DOCS)))
            .and(body_json(json!({
                "writes": [
                    {
                        "transform": {
                            "document": "projects/test-project/databases/(default)/documents/coupons/SAVE10",
                            "fieldTransforms": [
                                {"fieldPath": "usageCount", "increment": {"integerValue": "1"}},
                                {"fieldPath": "payoutUsage", "increment": {"doubleValue": 12.5}}
                            ]
                        },
                        "currentDocument": {"exists": true}
                    },
                    {
                        "update": {
                            "name": "projects/test-project/databases/(default)/documents/orders/o1/guards/g1",
                            "fields": {"scope": {"stringValue": "orders/o1"}}
                        },
                        "currentDocument": {"exists": false}
                    }
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "writeResults": [
                    {"updateTime": "2024-05-01T00:00:01Z", "transformResults": [{"integerValue": "6"}, {"doubleValue": 13.5}]},
                    {"updateTime": "2024-05-01T00:00:01Z"}
                ],
                "commitTime": "2024-05-01T00:00:01Z"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut guard = Fields::new();
        guard.insert("scope".into(), FieldValue::from("orders/o1"));

        let result = client(&server)
            .commit(&[
                WriteOp::transform(
                    "coupons",
                    "SAVE10",
                    vec![
                        FieldTransform::increment("usageCount", 1i64),
                        FieldTransform::increment("payoutUsage", Delta::Double(12.5)),
                    ],
                ),
                WriteOp::create("orders/o1/guards", "g1", guard),
            ])
            .await
            .unwrap();

        assert_eq!(result.update_times.len(), 2);
        assert_eq!(result.commit_time.as_deref(), Some("2024-05-01T00:00:01Z"));
    }

    #[tokio::test]
    async fn test_commit_already_exists() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({
                "error": {"code": 409, "status": "ALREADY_EXISTS"}
            })))
            .mount(&server)
            .await;

        let result = client(&server)
            .commit(&[WriteOp::create("coupons", "SAVE10", Fields::new())])
            .await;
        assert!(matches!(result, Err(FirestoreError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_commit_server_error_is_transient_and_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server)
            .commit(&[WriteOp::delete("coupons", "SAVE10")])
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_nested_collection_query_targets_parent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("{}/orders/o1:runQuery", DOCS)))
            .and(body_json(json!({
                "structuredQuery": {
                    "from": [{"collectionId": "guards"}],
                    "where": {"compositeFilter": {
                        "op": "AND",
                        "filters": [
                            {"fieldFilter": {"field": {"fieldPath": "subjectId"}, "op": "EQUAL", "value": {"stringValue": "SAVE10"}}},
                            {"fieldFilter": {"field": {"fieldPath": "attempts"}, "op": "GREATER_THAN", "value": {"integerValue": "0"}}}
                        ]
                    }},
                    "orderBy": [{"field": {"fieldPath": "appliedAt"}, "direction": "DESCENDING"}],
                    "limit": 5
                }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {
                    "document": {
                        "name": "projects/test-project/databases/(default)/documents/orders/o1/guards/g1",
                        "fields": {"subjectId": {"stringValue": "SAVE10"}},
                        "updateTime": "2024-05-01T00:00:01Z"
                    },
                    "readTime": "2024-05-01T00:00:02Z"
                },
                {"readTime": "2024-05-01T00:00:02Z"}
            ])))
            .mount(&server)
            .await;

        let query = DocumentQuery::new()
            .eq("subjectId", "SAVE10")
            .filter("attempts", crate::store::FilterOp::GreaterThan, 0i64)
            .order_by("appliedAt", Direction::Descending)
            .limit(5);

        let docs = client(&server)
            .query_documents("orders/o1/guards", &query)
            .await
            .unwrap();

        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].collection, "orders/o1/guards");
        assert_eq!(docs[0].id, "g1");
    }

    #[tokio::test]
    async fn test_write_document_without_id_uses_generated_name() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("{}/affiliateUsage", DOCS)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "projects/test-project/databases/(default)/documents/affiliateUsage/autoId123",
                "fields": {}
            })))
            .mount(&server)
            .await;

        let doc = client(&server)
            .write_document("affiliateUsage", &Fields::new(), None)
            .await
            .unwrap();
        assert_eq!(doc.id, "autoId123");
    }

    #[tokio::test]
    async fn test_invalid_ids_rejected_before_request() {
        let server = MockServer::start().await;
        let client = client(&server);
        assert!(matches!(
            client.get_document("coupons", "").await,
            Err(FirestoreError::Validation(_))
        ));
        assert!(matches!(
            client.update_document("coupons", "X", &[FieldUpdate::new("a..b", 1i64)]).await,
            Err(FirestoreError::Validation(_))
        ));
    }
}
