//! Integration test: tenant isolation at the router boundary.
//!
//! Verifies that:
//! 1. A tenant named in the body that differs from the caller's is a `CrossTenantViolation`
//!    and no collaborator is contacted.
//! 2. A mismatched `x-tenant-id` claim is rejected before any handler runs.
//! 3. Another tenant's customers and documents are invisible.
//! 4. Unauthenticated calls are rejected on every route except health and change nothing.

mod common;

use cloudable_core::RequestEnvelope;
use common::*;
use serde_json::json;

#[tokio::test]
async fn body_naming_another_tenant_is_rejected_without_query() {
    let h = harness().await;
    let res = h
        .post(
            "/api/kb/query",
            ADMIN_T002,
            json!({ "tenant": "t001", "text": "how do I deploy?" }),
        )
        .await;

    assert_eq!(res.status, 403);
    assert_eq!(res.body["error"], "CrossTenantViolation");
    assert_eq!(res.body["tenant_id"], "t002");
    assert!(res.body.get("retryable").is_none());
    assert_eq!(h.indexer.search_count(), 0, "indexer must not be queried");
}

#[tokio::test]
async fn tenant_id_spelling_is_checked_too() {
    let h = harness().await;
    let res = h
        .post(
            "/api/kb/sync",
            ADMIN_T002,
            json!({ "tenant_id": "t001", "document_key": "deploy_guide_v1" }),
        )
        .await;
    assert_eq!(res.status, 403);
    assert_eq!(h.indexer.ingestion_count(), 0);
    assert!(h
        .router
        .store()
        .list_kb_items(&h.scope("t001"), None)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn mismatched_tenant_claim_header_is_rejected() {
    let h = harness().await;
    let req = RequestEnvelope::new("POST", "/api/kb/query")
        .header("Authorization", format!("Bearer {}", ADMIN_T001))
        .header("X-Tenant-Id", "t002")
        .json(&json!({ "text": "anything" }));
    let res = h.router.dispatch(req).await;
    assert_eq!(res.status, 403);
    assert_eq!(res.body["error"], "CrossTenantViolation");
    assert_eq!(h.indexer.search_count(), 0);
}

#[tokio::test]
async fn other_tenants_customers_are_not_found() {
    let h = harness().await;
    let res = h
        .post("/api/customer-status", ADMIN_T002, json!({ "customer_id": "acme-001" }))
        .await;
    assert_eq!(res.status, 404);
    assert_eq!(res.body["error"], "NotFound");

    let res = h
        .post("/api/customer-status/task", ADMIN_T002, json!({ "customer_id": "acme-001" }))
        .await;
    assert_eq!(res.status, 404);
    assert!(h
        .router
        .store()
        .get_journey(&h.scope("t001"), "acme-001")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn customer_user_cannot_name_another_customer() {
    let h = harness().await;
    let res = h
        .post("/api/customer-status", USER_ACME, json!({ "customer_id": "beta-002" }))
        .await;
    assert_eq!(res.status, 403);
    assert_eq!(res.body["error"], "CrossTenantViolation");

    let res = h.post("/api/customer-status", USER_ACME, json!({})).await;
    assert_eq!(res.status, 200);
    assert_eq!(res.body["customer_id"], "acme-001");
    assert_eq!(res.body["tenant_id"], "t001");
    assert!(res.body["journey"].is_null());
}

#[tokio::test]
async fn foreign_bucket_document_key_is_cross_tenant() {
    let h = harness().await;
    let res = h
        .post(
            "/api/kb/sync",
            ADMIN_T002,
            json!({ "document_key": "s3://cloudable-kb-t001/deploy_guide_v1" }),
        )
        .await;
    assert_eq!(res.status, 403);
    assert_eq!(h.indexer.ingestion_count(), 0);
}

#[tokio::test]
async fn foreign_summary_reference_is_cross_tenant() {
    let h = harness().await;
    h.objects.put("cloudable-summaries-t001", "deploy_guide_v1.json", br#"{"summary":"secret"}"#);
    for document_id in [
        "s3://cloudable-kb-t001/deploy_guide_v1",
        "s3://cloudable-summaries-t001/deploy_guide_v1",
        "tenants/t001/deploy_guide_v1",
    ] {
        let res = h
            .post("/api/kb/summary", ADMIN_T002, json!({ "document_id": document_id }))
            .await;
        assert_eq!(res.status, 403, "{document_id}");
        assert_eq!(res.body["error"], "CrossTenantViolation");
    }
    assert_eq!(h.objects.fetch_count(), 0);

    // A bare id only ever resolves inside the caller's own summary bucket.
    let res = h
        .post("/api/kb/summary", ADMIN_T002, json!({ "document_id": "deploy_guide_v1" }))
        .await;
    assert_eq!(res.status, 404);
    let fetches = h.objects.fetches.lock().unwrap().clone();
    assert_eq!(fetches, vec![("cloudable-summaries-t002".to_string(), "deploy_guide_v1.json".to_string())]);
}

#[tokio::test]
async fn query_results_never_leak_foreign_catalog_rows() {
    let h = harness().await;
    let res = h
        .post("/api/kb/sync", ADMIN_T001, json!({ "document_key": "deploy_guide_v1" }))
        .await;
    assert_eq!(res.status, 200);

    // The indexer claims a t001 document for a t002 query; the t002 catalog has no such row.
    h.indexer.set_hits(vec![("deploy_guide_v1", 0.9, "Step 1: ...")]);
    let res = h
        .post("/api/kb/query", ADMIN_T002, json!({ "text": "deploy" }))
        .await;
    assert_eq!(res.status, 200);
    assert_eq!(res.body["results"].as_array().unwrap().len(), 0);
    let searches = h.indexer.searches.lock().unwrap().clone();
    assert_eq!(searches.last().unwrap().0, "kb-t002");
}

#[tokio::test]
async fn unauthenticated_calls_are_rejected_and_mutate_nothing() {
    let h = harness().await;
    let routes = [
        "/api/upload-url",
        "/api/kb/sync",
        "/api/kb/query",
        "/api/kb/summary",
        "/api/chat",
        "/api/customer-status",
        "/api/customer-status/task",
        "/api/customer-status/assessment",
        "/api/customer-status/stage",
        "/api/usage",
    ];
    for path in routes {
        let res = h
            .call(
                "POST",
                path,
                None,
                json!({ "customer_id": "acme-001", "document_key": "doc", "text": "q", "message": "m",
                        "filename": "a.pdf", "stage": "Scale", "document_id": "doc",
                        "answers": [{ "question": "q", "answer": "yes" }] }),
            )
            .await;
        assert_eq!(res.status, 401, "{path}");
        assert_eq!(res.body["error"], "Unauthenticated");
        assert!(res.body.get("tenant_id").is_none());
    }

    let res = h.call("POST", "/api/kb/sync", Some("not-a-real-token"), json!({ "document_key": "doc" })).await;
    assert_eq!(res.status, 401);

    let store = h.router.store();
    let t001 = h.scope("t001");
    assert!(store.get_journey(&t001, "acme-001").await.unwrap().is_none());
    assert!(store.latest_assessment(&t001, "acme-001").await.unwrap().is_none());
    assert!(store.list_kb_items(&t001, None).await.unwrap().is_empty());
    assert_eq!(h.indexer.ingestion_count(), 0);
    assert_eq!(h.indexer.search_count(), 0);
    assert!(h.objects.presigned.lock().unwrap().is_empty());
    assert!(h.inference.prompts.lock().unwrap().is_empty());

    let res = h.call("GET", "/api/health", None, json!({})).await;
    assert_eq!(res.status, 200);
    assert_eq!(res.body["status"], "healthy");
}
