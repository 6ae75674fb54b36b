//! Shared harness: a router over a temp SQLite file with in-process fake collaborators.

#![allow(dead_code)]

use async_trait::async_trait;
use cloudable_core::collaborators::ContextPassage;
use cloudable_core::{
    token_digest, ApiError, ApiResult, ChatPrompt, Collaborators, CoreConfig, IndexHit,
    IndexingService, InferenceService, IngestionAck, ObjectStore, PresignedUpload, RequestEnvelope,
    RequestRouter, ResponseEnvelope, TenantScope, TraceEvent, TraceSink,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const ADMIN_T001: &str = "tok-admin-t001";
pub const USER_ACME: &str = "tok-user-acme-001";
pub const SVC_T001: &str = "tok-svc-t001";
pub const ADMIN_T002: &str = "tok-admin-t002";
pub const USER_GLOBEX: &str = "tok-user-globex-001";

#[derive(Default)]
pub struct FakeIndexer {
    pub ingestions: Mutex<Vec<(String, String, String)>>,
    pub searches: Mutex<Vec<(String, String, usize)>>,
    pub hits: Mutex<Vec<IndexHit>>,
    pub fail_next: AtomicUsize,
    pub delay: Mutex<Option<Duration>>,
}

impl FakeIndexer {
    pub fn ingestion_count(&self) -> usize {
        self.ingestions.lock().unwrap().len()
    }

    pub fn search_count(&self) -> usize {
        self.searches.lock().unwrap().len()
    }

    pub fn set_hits(&self, hits: Vec<(&str, f32, &str)>) {
        *self.hits.lock().unwrap() = hits
            .into_iter()
            .map(|(doc_id, score, excerpt)| IndexHit {
                doc_id: doc_id.to_string(),
                score,
                excerpt: excerpt.to_string(),
            })
            .collect();
    }

    async fn maybe_stall_or_fail(&self) -> ApiResult<()> {
        let delay = *self.delay.lock().unwrap();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        let pending = self.fail_next.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_next.store(pending - 1, Ordering::SeqCst);
            return Err(ApiError::UpstreamError("indexer unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl IndexingService for FakeIndexer {
    async fn start_ingestion(&self, namespace: &str, doc_id: &str, s3_uri: &str) -> ApiResult<IngestionAck> {
        self.maybe_stall_or_fail().await?;
        let mut calls = self.ingestions.lock().unwrap();
        calls.push((namespace.to_string(), doc_id.to_string(), s3_uri.to_string()));
        Ok(IngestionAck {
            ingestion_id: format!("ing-{}", calls.len()),
        })
    }

    async fn search(&self, namespace: &str, text: &str, max_results: usize) -> ApiResult<Vec<IndexHit>> {
        self.maybe_stall_or_fail().await?;
        self.searches
            .lock()
            .unwrap()
            .push((namespace.to_string(), text.to_string(), max_results));
        Ok(self.hits.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct FakeInference {
    pub prompts: Mutex<Vec<(String, Vec<ContextPassage>, String)>>,
}

#[async_trait]
impl InferenceService for FakeInference {
    async fn complete(&self, prompt: ChatPrompt) -> ApiResult<String> {
        let reply = format!("answer with {} passages", prompt.context.len());
        self.prompts
            .lock()
            .unwrap()
            .push((prompt.system, prompt.context, prompt.user_message));
        Ok(reply)
    }
}

#[derive(Default)]
pub struct FakeObjects {
    pub presigned: Mutex<Vec<(String, String, u64)>>,
    pub stored: Mutex<HashMap<(String, String), Vec<u8>>>,
    pub fetches: Mutex<Vec<(String, String)>>,
}

impl FakeObjects {
    pub fn put(&self, bucket: &str, key: &str, body: &[u8]) {
        self.stored
            .lock()
            .unwrap()
            .insert((bucket.to_string(), key.to_string()), body.to_vec());
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.lock().unwrap().len()
    }
}

#[async_trait]
impl ObjectStore for FakeObjects {
    async fn presign_put(&self, bucket: &str, key: &str, _content_type: &str, expires_secs: u64) -> ApiResult<PresignedUpload> {
        self.presigned
            .lock()
            .unwrap()
            .push((bucket.to_string(), key.to_string(), expires_secs));
        Ok(PresignedUpload {
            upload_url: format!("https://{}.objects.test/{}?sig=fake", bucket, key),
        })
    }

    async fn fetch_object(&self, bucket: &str, key: &str) -> ApiResult<Option<Vec<u8>>> {
        let at = (bucket.to_string(), key.to_string());
        self.fetches.lock().unwrap().push(at.clone());
        Ok(self.stored.lock().unwrap().get(&at).cloned())
    }
}

#[derive(Default)]
pub struct RecordingTrace {
    pub events: Mutex<Vec<TraceEvent>>,
}

#[async_trait]
impl TraceSink for RecordingTrace {
    async fn record(&self, event: TraceEvent) {
        self.events.lock().unwrap().push(event);
    }
}

pub struct Harness {
    pub router: RequestRouter,
    pub indexer: Arc<FakeIndexer>,
    pub inference: Arc<FakeInference>,
    pub objects: Arc<FakeObjects>,
    pub trace: Arc<RecordingTrace>,
    _dir: tempfile::TempDir,
}

fn config_toml(db_path: &str, deadline_ms: u64) -> String {
    format!(
        r#"
        database_path = "{db}"
        request_deadline_ms = {deadline}
        upstream_timeout_ms = 2000
        sync_retry_attempts = 2

        [[identities]]
        token_sha256 = "{admin1}"
        subject = "admin@t001"
        tenant_id = "t001"
        role = "tenant_admin"

        [[identities]]
        token_sha256 = "{user1}"
        subject = "user@acme"
        tenant_id = "t001"
        customer_id = "acme-001"
        role = "customer_user"

        [[identities]]
        token_sha256 = "{svc1}"
        subject = "sync-bot@t001"
        tenant_id = "t001"
        role = "service_account"

        [[identities]]
        token_sha256 = "{admin2}"
        subject = "admin@t002"
        tenant_id = "t002"
        role = "tenant_admin"

        [[identities]]
        token_sha256 = "{user2}"
        subject = "user@globex"
        tenant_id = "t002"
        customer_id = "globex-001"
        role = "customer_user"

        [tenants.t001]
        bucket = "cloudable-kb-t001"
        summary_bucket = "cloudable-summaries-t001"

        [tenants.t002]
        bucket = "cloudable-kb-t002"
        summary_bucket = "cloudable-summaries-t002"
        "#,
        db = db_path,
        deadline = deadline_ms,
        admin1 = token_digest(ADMIN_T001),
        user1 = token_digest(USER_ACME),
        svc1 = token_digest(SVC_T001),
        admin2 = token_digest(ADMIN_T002),
        user2 = token_digest(USER_GLOBEX),
    )
}

pub async fn harness() -> Harness {
    harness_with_deadline(5_000).await
}

pub async fn harness_with_deadline(deadline_ms: u64) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("cloudable.db");
    let cfg = CoreConfig::from_toml_str(&config_toml(&db.to_string_lossy(), deadline_ms)).unwrap();

    let indexer = Arc::new(FakeIndexer::default());
    let inference = Arc::new(FakeInference::default());
    let objects = Arc::new(FakeObjects::default());
    let trace = Arc::new(RecordingTrace::default());
    let router = RequestRouter::build(
        &cfg,
        Collaborators {
            indexer: indexer.clone(),
            inference: inference.clone(),
            objects: objects.clone(),
            trace: trace.clone(),
        },
    )
    .unwrap();

    let store = router.store().clone();
    for (tenant, name) in [("t001", "Acme Holdings"), ("t002", "Globex")] {
        store
            .provision_tenant(&TenantScope::provisioning(tenant).unwrap(), name)
            .await
            .unwrap();
    }
    let t001 = TenantScope::provisioning("t001").unwrap();
    let t002 = TenantScope::provisioning("t002").unwrap();
    store
        .provision_customer(&t001, "acme-001", "Acme Corp", Some("ops@acme.test"))
        .await
        .unwrap();
    store
        .provision_customer(&t001, "beta-002", "Beta LLC", None)
        .await
        .unwrap();
    store
        .provision_customer(&t002, "globex-001", "Globex Inc", None)
        .await
        .unwrap();

    Harness {
        router,
        indexer,
        inference,
        objects,
        trace,
        _dir: dir,
    }
}

impl Harness {
    pub async fn call(&self, method: &str, path: &str, token: Option<&str>, body: Value) -> ResponseEnvelope {
        let mut req = RequestEnvelope::new(method, path).json(&body);
        if let Some(t) = token {
            req = req.header("Authorization", format!("Bearer {}", t));
        }
        self.router.dispatch(req).await
    }

    pub async fn post(&self, path: &str, token: &str, body: Value) -> ResponseEnvelope {
        self.call("POST", path, Some(token), body).await
    }

    pub fn scope(&self, tenant: &str) -> TenantScope {
        TenantScope::provisioning(tenant).unwrap()
    }
}
