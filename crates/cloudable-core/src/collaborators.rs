//! External collaborators: indexing/vector search, LLM inference, the object store (presigned
//! uploads and summary reads) and the tracing sink. Each is a narrow async trait with a `reqwest` implementation; tests swap in
//! in-process fakes.

use crate::error::{ApiError, ApiResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Await `fut` for at most `limit`. Expiry abandons the future and yields `UpstreamTimeout`.
pub async fn with_timeout<T, F>(limit: Duration, label: &str, fut: F) -> ApiResult<T>
where
    F: Future<Output = ApiResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => {
            tracing::warn!(target: "cloudable::collaborators", collaborator = label, timeout_ms = limit.as_millis() as u64, "collaborator call timed out");
            Err(ApiError::UpstreamTimeout(format!(
                "{} did not respond within {} ms",
                label,
                limit.as_millis()
            )))
        }
    }
}

/// Acknowledgement of an ingestion job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionAck {
    pub ingestion_id: String,
}

/// One similarity hit. Only the document reference, score and a text excerpt; never vectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexHit {
    pub doc_id: String,
    pub score: f32,
    #[serde(default)]
    pub excerpt: String,
}

#[async_trait]
pub trait IndexingService: Send + Sync {
    /// Ask the indexer to (re-)ingest one document into the tenant namespace.
    async fn start_ingestion(&self, namespace: &str, doc_id: &str, s3_uri: &str)
        -> ApiResult<IngestionAck>;

    /// Similarity search restricted to one namespace.
    async fn search(&self, namespace: &str, text: &str, max_results: usize)
        -> ApiResult<Vec<IndexHit>>;
}

/// Context passage handed to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextPassage {
    pub doc_id: String,
    pub title: String,
    pub excerpt: String,
}

#[derive(Debug, Clone)]
pub struct ChatPrompt {
    pub system: String,
    pub context: Vec<ContextPassage>,
    pub user_message: String,
}

#[async_trait]
pub trait InferenceService: Send + Sync {
    async fn complete(&self, prompt: ChatPrompt) -> ApiResult<String>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresignedUpload {
    pub upload_url: String,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn presign_put(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        expires_secs: u64,
    ) -> ApiResult<PresignedUpload>;

    /// Object body, or `None` when the key does not exist.
    async fn fetch_object(&self, bucket: &str, key: &str) -> ApiResult<Option<Vec<u8>>>;
}

/// One record per dispatched request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub trace_id: String,
    pub route: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    pub latency_ms: u64,
}

/// Sink failures are swallowed (logged) and never fail the request.
#[async_trait]
pub trait TraceSink: Send + Sync {
    async fn record(&self, event: TraceEvent);
}

/// Default sink: trace events go to the log only.
#[derive(Debug, Default, Clone)]
pub struct LogTraceSink;

#[async_trait]
impl TraceSink for LogTraceSink {
    async fn record(&self, event: TraceEvent) {
        tracing::info!(
            target: "cloudable::trace",
            trace_id = %event.trace_id,
            route = %event.route,
            tenant_id = event.tenant_id.as_deref().unwrap_or("-"),
            subject = event.subject.as_deref().unwrap_or("-"),
            status = event.status,
            error_kind = event.error_kind.as_deref().unwrap_or("-"),
            latency_ms = event.latency_ms,
            "request traced"
        );
    }
}

/// Posts each event as JSON to a collector endpoint, bounded by the upstream timeout.
pub struct HttpTraceSink {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpTraceSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl TraceSink for HttpTraceSink {
    async fn record(&self, event: TraceEvent) {
        let send = async {
            let res = self.client.post(&self.url).json(&event).send().await?;
            check_status(res, "trace collector").await?;
            Ok::<(), ApiError>(())
        };
        if let Err(e) = with_timeout(self.timeout, "trace collector", send).await {
            tracing::warn!(target: "cloudable::trace", trace_id = %event.trace_id, error = %e, "trace sink failed");
        }
    }
}

/// Stand-in used when a collaborator endpoint is not configured.
#[derive(Debug, Clone)]
pub struct Unconfigured {
    pub name: &'static str,
}

impl Unconfigured {
    fn error(&self) -> ApiError {
        ApiError::UpstreamError(format!("{} is not configured", self.name))
    }
}

#[async_trait]
impl IndexingService for Unconfigured {
    async fn start_ingestion(&self, _: &str, _: &str, _: &str) -> ApiResult<IngestionAck> {
        Err(self.error())
    }

    async fn search(&self, _: &str, _: &str, _: usize) -> ApiResult<Vec<IndexHit>> {
        Err(self.error())
    }
}

#[async_trait]
impl InferenceService for Unconfigured {
    async fn complete(&self, _: ChatPrompt) -> ApiResult<String> {
        Err(self.error())
    }
}

#[async_trait]
impl ObjectStore for Unconfigured {
    async fn presign_put(&self, _: &str, _: &str, _: &str, _: u64) -> ApiResult<PresignedUpload> {
        Err(self.error())
    }

    async fn fetch_object(&self, _: &str, _: &str) -> ApiResult<Option<Vec<u8>>> {
        Err(self.error())
    }
}

async fn check_status(res: reqwest::Response, label: &str) -> ApiResult<reqwest::Response> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    let snippet: String = body.chars().take(200).collect();
    Err(ApiError::UpstreamError(format!(
        "{} returned {}: {}",
        label,
        status.as_u16(),
        snippet
    )))
}

#[derive(Serialize)]
struct IngestRequest<'a> {
    namespace: &'a str,
    doc_id: &'a str,
    s3_uri: &'a str,
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    namespace: &'a str,
    text: &'a str,
    max_results: usize,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    hits: Vec<IndexHit>,
}

/// Indexing service reached over HTTP: `POST {base}/ingest` and `POST {base}/search`.
pub struct HttpIndexingService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpIndexingService {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl IndexingService for HttpIndexingService {
    async fn start_ingestion(
        &self,
        namespace: &str,
        doc_id: &str,
        s3_uri: &str,
    ) -> ApiResult<IngestionAck> {
        let res = self
            .client
            .post(format!("{}/ingest", self.base_url))
            .json(&IngestRequest {
                namespace,
                doc_id,
                s3_uri,
            })
            .send()
            .await?;
        let res = check_status(res, "indexing service").await?;
        res.json::<IngestionAck>()
            .await
            .map_err(|e| ApiError::UpstreamError(format!("indexing service response: {}", e)))
    }

    async fn search(
        &self,
        namespace: &str,
        text: &str,
        max_results: usize,
    ) -> ApiResult<Vec<IndexHit>> {
        let res = self
            .client
            .post(format!("{}/search", self.base_url))
            .json(&SearchRequest {
                namespace,
                text,
                max_results,
            })
            .send()
            .await?;
        let res = check_status(res, "indexing service").await?;
        let parsed: SearchResponse = res
            .json()
            .await
            .map_err(|e| ApiError::UpstreamError(format!("indexing service response: {}", e)))?;
        Ok(parsed.hits)
    }
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct CompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Option<Vec<CompletionChoice>>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: Option<CompletionMessage>,
}

#[derive(Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

/// OpenAI-compatible `/chat/completions` client.
pub struct HttpInferenceService {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpInferenceService {
    pub fn new(url: impl Into<String>, model: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            model: model.into(),
            api_key,
        }
    }
}

fn render_context(context: &[ContextPassage]) -> String {
    context
        .iter()
        .enumerate()
        .map(|(i, p)| format!("[{}] {} ({})\n{}", i + 1, p.title, p.doc_id, p.excerpt))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[async_trait]
impl InferenceService for HttpInferenceService {
    async fn complete(&self, prompt: ChatPrompt) -> ApiResult<String> {
        let system = if prompt.context.is_empty() {
            prompt.system
        } else {
            format!("{}\n\nContext:\n{}", prompt.system, render_context(&prompt.context))
        };
        let body = CompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: prompt.user_message,
                },
            ],
            stream: false,
        };

        let mut req = self.client.post(&self.url).json(&body);
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.is_empty()) {
            req = req.bearer_auth(key);
        }
        let res = check_status(req.send().await?, "inference service").await?;
        let parsed: CompletionResponse = res
            .json()
            .await
            .map_err(|e| ApiError::UpstreamError(format!("inference response: {}", e)))?;

        parsed
            .choices
            .and_then(|c| c.into_iter().next())
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .ok_or_else(|| ApiError::UpstreamError("inference service returned no choices".into()))
    }
}

#[derive(Serialize)]
struct PresignRequest<'a> {
    bucket: &'a str,
    key: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content_type: Option<&'a str>,
    expires_in: u64,
    method: &'static str,
}

#[derive(Deserialize)]
struct PresignedDownload {
    download_url: String,
}

/// Reads go through a short-lived GET URL.
const DOWNLOAD_URL_EXPIRES_SECS: u64 = 60;

/// Presign broker in front of the object store: `POST {url}` with `method: "PUT"` returns
/// `{upload_url}`, with `method: "GET"` returns `{download_url}`.
pub struct HttpObjectStore {
    client: reqwest::Client,
    url: String,
}

impl HttpObjectStore {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn presign_put(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        expires_secs: u64,
    ) -> ApiResult<PresignedUpload> {
        let res = self
            .client
            .post(&self.url)
            .json(&PresignRequest {
                bucket,
                key,
                content_type: Some(content_type),
                expires_in: expires_secs,
                method: "PUT",
            })
            .send()
            .await?;
        let res = check_status(res, "presign broker").await?;
        res.json::<PresignedUpload>()
            .await
            .map_err(|e| ApiError::UpstreamError(format!("presign response: {}", e)))
    }

    async fn fetch_object(&self, bucket: &str, key: &str) -> ApiResult<Option<Vec<u8>>> {
        let res = self
            .client
            .post(&self.url)
            .json(&PresignRequest {
                bucket,
                key,
                content_type: None,
                expires_in: DOWNLOAD_URL_EXPIRES_SECS,
                method: "GET",
            })
            .send()
            .await?;
        let presigned: PresignedDownload = check_status(res, "presign broker")
            .await?
            .json()
            .await
            .map_err(|e| ApiError::UpstreamError(format!("presign response: {}", e)))?;

        let res = self.client.get(&presigned.download_url).send().await?;
        if res.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let res = check_status(res, "object store").await?;
        Ok(Some(res.bytes().await?.to_vec()))
    }
}
