//! Integration test: knowledge-base sync, query, upload URLs and chat.
//!
//! Verifies that:
//! 1. Syncing the same document twice yields one catalog row whose `last_synced` advances.
//! 2. An indexer failure leaves the row present but stale and is reported as retryable.
//! 3. Queries join catalog metadata, drop unknown documents and order by score.
//! 4. Upload URLs are scoped to the tenant bucket; chat cites the retrieved documents.
//! 5. Slow collaborators surface as `DeadlineExceeded`; every dispatch is traced.
//! 6. Summaries are read from the tenant summary bucket; plain-text bodies are wrapped.

mod common;

use chrono::{DateTime, Utc};
use common::*;
use serde_json::json;
use std::sync::atomic::Ordering;
use std::time::Duration;

fn ts(v: &serde_json::Value) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(v.as_str().unwrap())
        .unwrap()
        .with_timezone(&Utc)
}

#[tokio::test]
async fn repeated_sync_is_idempotent() {
    let h = harness().await;
    let first = h
        .post("/api/kb/sync", SVC_T001, json!({ "document_key": "deploy_guide_v1" }))
        .await;
    assert_eq!(first.status, 200, "{}", first.body);
    assert_eq!(first.body["doc_id"], "deploy_guide_v1");
    assert_eq!(first.body["s3_uri"], "s3://cloudable-kb-t001/deploy_guide_v1");
    assert_eq!(first.body["status"], "synced");
    assert_eq!(first.body["tenant_id"], "t001");

    let second = h
        .post("/api/kb/sync", SVC_T001, json!({ "document_key": "deploy_guide_v1" }))
        .await;
    assert_eq!(second.status, 200);
    assert!(ts(&second.body["last_synced"]) > ts(&first.body["last_synced"]));

    let items = h
        .router
        .store()
        .list_kb_items(&h.scope("t001"), None)
        .await
        .unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].doc_id, "deploy_guide_v1");
    assert_eq!(items[0].title, "deploy_guide_v1");
    assert_eq!(items[0].last_synced, Some(ts(&second.body["last_synced"])));
    assert_eq!(h.indexer.ingestion_count(), 2);
    assert_eq!(h.indexer.ingestions.lock().unwrap()[0].0, "kb-t001");
}

#[tokio::test]
async fn sync_metadata_is_kept_unless_overwritten() {
    let h = harness().await;
    h.post(
        "/api/kb/sync",
        ADMIN_T001,
        json!({ "document_key": "documents/runbook.pdf", "title": "Runbook", "tags": ["ops"] }),
    )
    .await;
    h.post("/api/kb/sync", ADMIN_T001, json!({ "document_key": "documents/runbook.pdf" }))
        .await;
    let item = h
        .router
        .store()
        .get_kb_item(&h.scope("t001"), "documents/runbook.pdf")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(item.title, "Runbook");
    assert_eq!(item.tags, vec!["ops".to_string()]);
}

#[tokio::test]
async fn indexer_failure_leaves_stale_row() {
    let h = harness().await;
    h.indexer.fail_next.store(10, Ordering::SeqCst);
    let res = h
        .post("/api/kb/sync", SVC_T001, json!({ "document_key": "deploy_guide_v1" }))
        .await;
    assert_eq!(res.status, 502);
    assert_eq!(res.body["error"], "UpstreamError");
    assert_eq!(res.body["retryable"], true);

    let item = h
        .router
        .store()
        .get_kb_item(&h.scope("t001"), "deploy_guide_v1")
        .await
        .unwrap()
        .unwrap();
    assert!(item.last_synced.is_none());
    // One attempt plus two retries.
    assert_eq!(h.indexer.fail_next.load(Ordering::SeqCst), 7);
}

#[tokio::test]
async fn transient_indexer_failure_is_retried() {
    let h = harness().await;
    h.indexer.fail_next.store(1, Ordering::SeqCst);
    let res = h
        .post("/api/kb/sync", SVC_T001, json!({ "document_key": "deploy_guide_v1" }))
        .await;
    assert_eq!(res.status, 200, "{}", res.body);
    assert_eq!(h.indexer.ingestion_count(), 1);
}

#[tokio::test]
async fn customer_user_cannot_sync() {
    let h = harness().await;
    let res = h
        .post("/api/kb/sync", USER_ACME, json!({ "document_key": "deploy_guide_v1" }))
        .await;
    assert_eq!(res.status, 403);
    assert_eq!(res.body["error"], "Unauthorized");
    assert_eq!(h.indexer.ingestion_count(), 0);
}

#[tokio::test]
async fn query_joins_catalog_metadata() {
    let h = harness().await;
    h.post(
        "/api/kb/sync",
        ADMIN_T001,
        json!({ "document_key": "deploy_guide_v1", "title": "Deploy Guide", "tags": ["deploy"] }),
    )
    .await;
    h.post("/api/kb/sync", ADMIN_T001, json!({ "document_key": "faq.md" }))
        .await;
    h.indexer.set_hits(vec![
        ("faq.md", 0.42, "Q: ..."),
        ("unknown_doc", 0.99, "orphan"),
        ("deploy_guide_v1", 0.87, "Step 1: provision"),
    ]);

    let res = h
        .post("/api/kb/query", USER_ACME, json!({ "text": "how to deploy", "max_results": 5 }))
        .await;
    assert_eq!(res.status, 200, "{}", res.body);
    let results = res.body["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["doc_id"], "deploy_guide_v1");
    assert_eq!(results[0]["title"], "Deploy Guide");
    assert_eq!(results[0]["tags"], json!(["deploy"]));
    assert_eq!(results[1]["doc_id"], "faq.md");
    assert_eq!(results[1]["title"], "faq");
    assert!(results[0].get("vector").is_none());

    let searches = h.indexer.searches.lock().unwrap().clone();
    assert_eq!(searches[0], ("kb-t001".to_string(), "how to deploy".to_string(), 5));
}

#[tokio::test]
async fn query_bounds_are_enforced() {
    let h = harness().await;
    for body in [
        json!({ "text": "" }),
        json!({ "text": "x", "max_results": 0 }),
        json!({ "text": "x", "max_results": 26 }),
        json!({ "text": "x".repeat(2001) }),
    ] {
        let res = h.post("/api/kb/query", USER_ACME, body).await;
        assert_eq!(res.status, 400, "{}", res.body);
    }
    assert_eq!(h.indexer.search_count(), 0);

    h.post("/api/kb/query", USER_ACME, json!({ "query": "default size" }))
        .await;
    assert_eq!(h.indexer.searches.lock().unwrap()[0].2, 3);
}

#[tokio::test]
async fn upload_url_is_scoped_to_tenant_bucket() {
    let h = harness().await;
    let res = h
        .post(
            "/api/upload-url",
            USER_ACME,
            json!({ "filename": "Q3 plan (final).pdf", "content_type": "application/pdf" }),
        )
        .await;
    assert_eq!(res.status, 200, "{}", res.body);
    assert_eq!(res.body["bucket"], "cloudable-kb-t001");
    assert_eq!(res.body["expires_in"], 3600);
    let key = res.body["document_key"].as_str().unwrap();
    assert!(key.starts_with("documents/"));
    assert!(key.ends_with("_Q3_plan__final_.pdf"));
    assert!(res.body["upload_url"]
        .as_str()
        .unwrap()
        .starts_with("https://cloudable-kb-t001."));

    let res = h.post("/api/upload-url", USER_ACME, json!({})).await;
    assert_eq!(res.status, 400);
}

#[tokio::test]
async fn chat_cites_retrieved_documents() {
    let h = harness().await;
    h.post(
        "/api/kb/sync",
        ADMIN_T001,
        json!({ "document_key": "deploy_guide_v1", "title": "Deploy Guide" }),
    )
    .await;
    h.indexer.set_hits(vec![("deploy_guide_v1", 0.8, "Step 1: provision")]);

    let res = h
        .post("/api/chat", USER_ACME, json!({ "message": "How do I deploy?" }))
        .await;
    assert_eq!(res.status, 200, "{}", res.body);
    assert_eq!(res.body["response"], "answer with 1 passages");
    assert_eq!(res.body["source_documents"][0]["doc_id"], "deploy_guide_v1");
    assert_eq!(res.body["source_documents"][0]["title"], "Deploy Guide");

    let res = h
        .post("/api/chat", USER_ACME, json!({ "message": "Hello", "use_kb": false }))
        .await;
    assert_eq!(res.status, 200);
    assert_eq!(res.body["source_documents"], json!([]));
    assert_eq!(h.indexer.search_count(), 1);
}

#[tokio::test]
async fn service_account_cannot_chat() {
    let h = harness().await;
    let res = h.post("/api/chat", SVC_T001, json!({ "message": "hi" })).await;
    assert_eq!(res.status, 403);
    assert!(h.inference.prompts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn slow_collaborator_hits_request_deadline() {
    let h = harness_with_deadline(100).await;
    *h.indexer.delay.lock().unwrap() = Some(Duration::from_secs(3));
    let res = h
        .post("/api/kb/query", USER_ACME, json!({ "text": "anything" }))
        .await;
    assert_eq!(res.status, 504);
    assert_eq!(res.body["error"], "DeadlineExceeded");
    assert!(res.body.get("retryable").is_none());
}

#[tokio::test]
async fn every_dispatch_is_traced() {
    let h = harness().await;
    let ok = h.call("GET", "/api/health", None, json!({})).await;
    let missing = h.call("GET", "/api/nope", None, json!({})).await;
    let bad = h.post("/api/kb/query", USER_ACME, json!({ "text": "" })).await;
    assert_eq!(missing.status, 404);
    assert_eq!(missing.body["error"], "NotFound");

    let events = h.trace.events.lock().unwrap().clone();
    assert_eq!(events.len(), 3);
    assert_eq!(events[0].trace_id, ok.trace_id);
    assert_eq!(events[0].route, "health");
    assert_eq!(events[0].status, 200);
    assert!(events[0].subject.is_none());
    assert_eq!(events[1].route, "unmatched");
    assert_eq!(events[2].tenant_id.as_deref(), Some("t001"));
    assert_eq!(events[2].subject.as_deref(), Some("user@acme"));
    assert_eq!(events[2].error_kind.as_deref(), Some("InvalidRequest"));
    assert_eq!(events[2].trace_id, bad.trace_id);
}

#[tokio::test]
async fn malformed_json_is_rejected_before_handlers() {
    let h = harness().await;
    let mut req = cloudable_core::RequestEnvelope::new("POST", "/api/kb/sync")
        .header("x-api-key", SVC_T001);
    req.body = b"{\"document_key\": ".to_vec();
    let res = h.router.dispatch(req).await;
    assert_eq!(res.status, 400);
    assert_eq!(res.body["error"], "InvalidRequest");
    assert_eq!(h.indexer.ingestion_count(), 0);
}

#[tokio::test]
async fn summary_is_read_from_tenant_summary_bucket() {
    let h = harness().await;
    h.objects.put(
        "cloudable-summaries-t001",
        "deploy_guide_v1.json",
        br#"{"summary":"Provision, deploy, verify.","key_points":["rollback in 5 min"]}"#,
    );
    h.objects.put("cloudable-summaries-t001", "notes.json", b"plain text summary");

    let res = h
        .post("/api/kb/summary", USER_ACME, json!({ "document_id": "deploy_guide_v1" }))
        .await;
    assert_eq!(res.status, 200, "{}", res.body);
    assert_eq!(res.body["document_id"], "deploy_guide_v1");
    assert_eq!(res.body["data"]["summary"], "Provision, deploy, verify.");
    assert_eq!(res.body["tenant_id"], "t001");

    let res = h
        .post("/api/kb/summary", USER_ACME, json!({ "document_id": "s3://cloudable-kb-t001/notes" }))
        .await;
    assert_eq!(res.status, 200, "{}", res.body);
    assert_eq!(res.body["data"], json!({ "summary": "plain text summary" }));

    let res = h
        .post("/api/kb/summary", USER_ACME, json!({ "document_id": "never_summarized" }))
        .await;
    assert_eq!(res.status, 404);
    assert_eq!(res.body["error"], "NotFound");

    let res = h.post("/api/kb/summary", USER_ACME, json!({ "document_id": "a/../b" })).await;
    assert_eq!(res.status, 400);
    assert_eq!(h.objects.fetch_count(), 3);
}

#[tokio::test]
async fn usage_summary_counts_traced_calls_for_admins_only() {
    let h = harness().await;
    h.post("/api/upload-url", USER_ACME, json!({ "filename": "a.pdf" })).await;
    h.post("/api/kb/query", USER_ACME, json!({ "text": "" })).await;
    h.post("/api/kb/sync", ADMIN_T002, json!({ "document_key": "globex_doc" })).await;

    let res = h.post("/api/usage", USER_ACME, json!({})).await;
    assert_eq!(res.status, 403);

    let res = h.post("/api/usage", ADMIN_T001, json!({})).await;
    assert_eq!(res.status, 200, "{}", res.body);
    assert_eq!(res.body["tenant_id"], "t001");
    // upload, rejected query, forbidden usage read
    assert_eq!(res.body["api_calls"], 3);
    assert_eq!(res.body["document_uploads"], 1);
    assert_eq!(res.body["kb_queries"], 0);
    assert_eq!(res.body["errors"], 2);
    assert_eq!(res.body["unique_users"], 1);
    assert!(res.body["first_activity"].is_string());
}
