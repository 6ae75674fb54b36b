//! Knowledge-base sync orchestrator.
//!
//! Turns a document reference into a catalog row plus an indexing request, answers similarity
//! queries with catalog metadata joined in, hands out presigned upload targets and reads back
//! per-document summaries. Every document reference is checked against the caller's tenant
//! before anything else happens.

use crate::collaborators::{with_timeout, IndexHit, IndexingService, ObjectStore};
use crate::config::{CoreConfig, TenantResourceMap};
use crate::error::{ApiError, ApiResult};
use crate::rbac::TenantScope;
use crate::store::{DataGateway, KbItem};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub const MAX_DOCUMENT_KEY_LEN: usize = 256;
pub const MAX_QUERY_CHARS: usize = 2000;
pub const MAX_FILENAME_LEN: usize = 100;
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Knobs taken from [`CoreConfig`].
#[derive(Debug, Clone)]
pub struct KbSettings {
    pub upstream_timeout: Duration,
    pub sync_retry_attempts: u32,
    pub query_default_results: usize,
    pub query_max_results: usize,
    pub upload_url_expires_secs: u64,
}

impl KbSettings {
    pub fn from_config(cfg: &CoreConfig) -> Self {
        Self {
            upstream_timeout: cfg.upstream_timeout(),
            sync_retry_attempts: cfg.sync_retry_attempts,
            query_default_results: cfg.query_default_results,
            query_max_results: cfg.query_max_results,
            upload_url_expires_secs: cfg.upload_url_expires_secs,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncRequest {
    pub document_key: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncResponse {
    pub doc_id: String,
    pub s3_uri: String,
    pub status: &'static str,
    pub ingestion_id: String,
    pub last_synced: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    #[serde(alias = "query")]
    pub text: String,
    #[serde(default)]
    pub max_results: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub doc_id: String,
    pub score: f32,
    pub excerpt: String,
    pub title: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub results: Vec<QueryResult>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadUrlRequest {
    pub filename: String,
    #[serde(default)]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadUrlResponse {
    pub upload_url: String,
    pub document_key: String,
    pub bucket: String,
    pub expires_in: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SummaryRequest {
    #[serde(alias = "doc_id")]
    pub document_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SummaryResponse {
    pub document_id: String,
    /// Stored summary JSON, or `{"summary": <text>}` when the object is plain text.
    pub data: Value,
}

/// A document reference resolved inside the caller's bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRef {
    pub doc_id: String,
    pub s3_uri: String,
}

impl DocumentRef {
    /// File stem of the last path segment.
    pub fn default_title(&self) -> String {
        let name = self.doc_id.rsplit('/').next().unwrap_or(&self.doc_id);
        match name.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem.to_string(),
            _ => name.to_string(),
        }
    }
}

fn validate_key_path(path: &str) -> ApiResult<()> {
    if path.is_empty() || path.len() > MAX_DOCUMENT_KEY_LEN {
        return Err(ApiError::InvalidRequest(format!(
            "document_key must be 1..={} characters",
            MAX_DOCUMENT_KEY_LEN
        )));
    }
    if path.starts_with('/') {
        return Err(ApiError::InvalidRequest("document_key must not start with '/'".into()));
    }
    if !path
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-'))
    {
        return Err(ApiError::InvalidRequest(
            "document_key may only contain [A-Za-z0-9._/-]".into(),
        ));
    }
    if path.split('/').any(|seg| seg == "..") {
        return Err(ApiError::InvalidRequest("document_key must not contain '..'".into()));
    }
    Ok(())
}

/// Resolve `document_key` (a bucket-relative path or `s3://bucket/path`) for one tenant.
pub fn resolve_document(tenant_id: &str, bucket: &str, document_key: &str) -> ApiResult<DocumentRef> {
    let key = document_key.trim();
    let path = match key.strip_prefix("s3://") {
        Some(rest) => {
            let (named_bucket, path) = rest.split_once('/').ok_or_else(|| {
                ApiError::InvalidRequest("s3 document_key must include an object path".into())
            })?;
            if named_bucket != bucket {
                tracing::warn!(target: "cloudable::kb_sync", tenant_id = %tenant_id, named_bucket = %named_bucket, "document key names another bucket");
                return Err(ApiError::CrossTenantViolation(
                    "document_key is outside the caller's bucket".into(),
                ));
            }
            path
        }
        None => key,
    };
    validate_key_path(path)?;

    if let Some(rest) = path.strip_prefix("tenants/") {
        let owner = rest.split('/').next().unwrap_or_default();
        if owner != tenant_id {
            tracing::warn!(target: "cloudable::kb_sync", tenant_id = %tenant_id, owner = %owner, "document key names another tenant");
            return Err(ApiError::CrossTenantViolation(
                "document_key belongs to another tenant".into(),
            ));
        }
    }

    Ok(DocumentRef {
        doc_id: path.to_string(),
        s3_uri: format!("s3://{}/{}", bucket, path),
    })
}

/// Keep `[A-Za-z0-9._-]`, replace the rest with `_`, cap at 100 chars.
pub fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_FILENAME_LEN)
        .collect()
}

/// `documents/<YYYYmmdd_HHMMSS>_<8 hex>_<safe filename>`.
pub fn upload_key(filename: &str, now: DateTime<Utc>) -> String {
    let short = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "documents/{}_{}_{}",
        now.format("%Y%m%d_%H%M%S"),
        &short[..8],
        sanitize_filename(filename)
    )
}

pub struct KbSyncOrchestrator {
    store: DataGateway,
    indexer: Arc<dyn IndexingService>,
    objects: Arc<dyn ObjectStore>,
    resources: TenantResourceMap,
    settings: KbSettings,
}

impl KbSyncOrchestrator {
    pub fn new(
        store: DataGateway,
        indexer: Arc<dyn IndexingService>,
        objects: Arc<dyn ObjectStore>,
        resources: TenantResourceMap,
        settings: KbSettings,
    ) -> Self {
        Self {
            store,
            indexer,
            objects,
            resources,
            settings,
        }
    }

    /// Upsert the catalog row, then (re-)trigger indexing. Safe to repeat.
    pub async fn request_sync(&self, scope: &TenantScope, req: SyncRequest) -> ApiResult<SyncResponse> {
        let tenant_id = scope.tenant_id();
        let bucket = self.resources.bucket(tenant_id)?;
        let doc = resolve_document(tenant_id, &bucket, &req.document_key)?;
        let tags = req.tags.map(normalize_tags).transpose()?;
        let title = req
            .title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        let item = {
            let doc = doc.clone();
            self.store
                .atomic(scope, move |tx| {
                    let existing = tx.get_kb_item(&doc.doc_id)?;
                    let title = title
                        .or_else(|| existing.as_ref().map(|e| e.title.clone()))
                        .unwrap_or_else(|| doc.default_title());
                    let tags = tags
                        .or_else(|| existing.map(|e| e.tags))
                        .unwrap_or_default();
                    tx.upsert_kb_item(&doc.doc_id, &doc.s3_uri, &title, &tags)
                })
                .await?
        };

        let namespace = self.resources.index_namespace(tenant_id);
        let ack = self
            .retrying("indexing service", || {
                self.indexer
                    .start_ingestion(&namespace, &item.doc_id, &item.s3_uri)
            })
            .await
            .map_err(|e| {
                tracing::warn!(target: "cloudable::kb_sync", tenant_id = %tenant_id, doc_id = %item.doc_id, error = %e, "indexing request failed; catalog row left stale");
                e
            })?;

        let last_synced = self.store.mark_kb_synced(scope, &item.doc_id).await?;
        tracing::info!(
            target: "cloudable::kb_sync",
            tenant_id = %tenant_id,
            doc_id = %item.doc_id,
            ingestion_id = %ack.ingestion_id,
            "document synced"
        );

        Ok(SyncResponse {
            doc_id: item.doc_id,
            s3_uri: item.s3_uri,
            status: "synced",
            ingestion_id: ack.ingestion_id,
            last_synced,
        })
    }

    /// Similarity search in the tenant namespace, annotated from the tenant catalog.
    pub async fn query(&self, scope: &TenantScope, req: QueryRequest) -> ApiResult<QueryResponse> {
        let text = req.text.trim().to_string();
        if text.is_empty() || text.chars().count() > MAX_QUERY_CHARS {
            return Err(ApiError::InvalidRequest(format!(
                "text must be 1..={} characters",
                MAX_QUERY_CHARS
            )));
        }
        let max_results = req.max_results.unwrap_or(self.settings.query_default_results);
        if max_results == 0 || max_results > self.settings.query_max_results {
            return Err(ApiError::InvalidRequest(format!(
                "max_results must be between 1 and {}",
                self.settings.query_max_results
            )));
        }

        let tenant_id = scope.tenant_id();
        let namespace = self.resources.index_namespace(tenant_id);
        let hits = self
            .retrying("indexing service", || {
                self.indexer.search(&namespace, &text, max_results)
            })
            .await?;

        let results = self.annotate(scope, hits, max_results).await?;
        tracing::debug!(target: "cloudable::kb_sync", tenant_id = %tenant_id, results = results.len(), "query answered");
        Ok(QueryResponse { results })
    }

    async fn annotate(
        &self,
        scope: &TenantScope,
        hits: Vec<IndexHit>,
        max_results: usize,
    ) -> ApiResult<Vec<QueryResult>> {
        if hits.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = hits.iter().map(|h| h.doc_id.clone()).collect();
        let catalog: HashMap<String, KbItem> = self
            .store
            .list_kb_items(scope, Some(ids))
            .await?
            .into_iter()
            .map(|item| (item.doc_id.clone(), item))
            .collect();

        let mut results: Vec<QueryResult> = hits
            .into_iter()
            .filter_map(|hit| match catalog.get(&hit.doc_id) {
                Some(item) => Some(QueryResult {
                    doc_id: hit.doc_id,
                    score: hit.score,
                    excerpt: hit.excerpt,
                    title: item.title.clone(),
                    tags: item.tags.clone(),
                }),
                None => {
                    tracing::warn!(target: "cloudable::kb_sync", tenant_id = %scope.tenant_id(), doc_id = %hit.doc_id, "dropping hit without catalog row");
                    None
                }
            })
            .collect();
        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.doc_id.cmp(&b.doc_id))
        });
        results.truncate(max_results);
        Ok(results)
    }

    /// Presigned PUT target under the tenant's bucket.
    pub async fn upload_url(&self, scope: &TenantScope, req: UploadUrlRequest) -> ApiResult<UploadUrlResponse> {
        if req.filename.trim().is_empty() {
            return Err(ApiError::InvalidRequest("missing required parameter: filename".into()));
        }
        let bucket = self.resources.bucket(scope.tenant_id())?;
        let key = upload_key(req.filename.trim(), Utc::now());
        let content_type = req
            .content_type
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
        let expires = self.settings.upload_url_expires_secs;

        let presigned = with_timeout(
            self.settings.upstream_timeout,
            "object store",
            self.objects.presign_put(&bucket, &key, &content_type, expires),
        )
        .await?;
        tracing::info!(target: "cloudable::kb_sync", tenant_id = %scope.tenant_id(), document_key = %key, "upload url issued");

        Ok(UploadUrlResponse {
            upload_url: presigned.upload_url,
            document_key: key,
            bucket,
            expires_in: expires,
        })
    }

    /// Summary stored as `<document_id>.json` in the tenant's summary bucket.
    pub async fn summary(&self, scope: &TenantScope, req: SummaryRequest) -> ApiResult<SummaryResponse> {
        let tenant_id = scope.tenant_id();
        let summary_bucket = self.resources.summary_bucket(tenant_id)?;
        let document_id = req.document_id.trim();
        // Full references name the document bucket; bare ids are plain keys.
        let doc = if document_id.starts_with("s3://") {
            resolve_document(tenant_id, &self.resources.bucket(tenant_id)?, document_id)?
        } else {
            resolve_document(tenant_id, &summary_bucket, document_id)?
        };
        let key = format!("{}.json", doc.doc_id);

        let body = self
            .retrying("object store", || self.objects.fetch_object(&summary_bucket, &key))
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("summary not found: {}", doc.doc_id)))?;
        let data = serde_json::from_slice::<Value>(&body)
            .unwrap_or_else(|_| json!({ "summary": String::from_utf8_lossy(&body) }));
        tracing::debug!(target: "cloudable::kb_sync", tenant_id = %tenant_id, document_id = %doc.doc_id, bytes = body.len(), "summary read");

        Ok(SummaryResponse {
            document_id: doc.doc_id,
            data,
        })
    }

    /// Idempotent collaborator call: each attempt under the upstream timeout, retried on
    /// retryable failures.
    async fn retrying<T, F, Fut>(&self, label: &str, mut call: F) -> ApiResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = ApiResult<T>>,
    {
        let attempts = self.settings.sync_retry_attempts.saturating_add(1);
        let mut attempt = 1;
        loop {
            match with_timeout(self.settings.upstream_timeout, label, call()).await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    tracing::debug!(target: "cloudable::kb_sync", collaborator = label, attempt, error = %e, "retrying");
                    tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn normalize_tags(tags: Vec<String>) -> ApiResult<Vec<String>> {
    let mut out: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        let tag = tag.trim().to_string();
        if tag.is_empty() || tag.chars().count() > 64 {
            return Err(ApiError::InvalidRequest("tags must be 1..=64 characters".into()));
        }
        if !out.contains(&tag) {
            out.push(tag);
        }
    }
    Ok(out)
}
