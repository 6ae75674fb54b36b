//! Per-tenant usage, derived from the trace stream.
//!
//! [`UsageTraceSink`] stores every trace event that carries a tenant in `usage_events` and then
//! hands it to the configured sink. [`usage_summary`] aggregates one tenant's rows.

use crate::collaborators::{TraceEvent, TraceSink};
use crate::error::{ApiError, ApiResult};
use crate::rbac::TenantScope;
use crate::store::{format_ts, parse_ts, DataGateway, ScopedTx};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageSummary {
    pub api_calls: u64,
    pub document_uploads: u64,
    pub kb_syncs: u64,
    pub kb_queries: u64,
    pub chat_sessions: u64,
    pub errors: u64,
    pub unique_users: u64,
    pub first_activity: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub generated_at: DateTime<Utc>,
}

/// Store one event. A repeated trace id is ignored.
pub fn record_event(tx: &ScopedTx<'_>, event: &TraceEvent, now: DateTime<Utc>) -> ApiResult<()> {
    let latency_ms = i64::try_from(event.latency_ms).unwrap_or(i64::MAX);
    tx.execute(
        "INSERT INTO usage_events (tenant_id, trace_id, route, subject, status, latency_ms, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(tenant_id, trace_id) DO NOTHING",
        &[
            &event.trace_id,
            &event.route,
            &event.subject,
            &event.status,
            &latency_ms,
            &format_ts(now),
        ],
    )?;
    Ok(())
}

/// Uploads, syncs, queries and chats count successful calls only; `errors` counts every
/// non-2xx outcome.
pub fn summarize(tx: &ScopedTx<'_>, now: DateTime<Utc>) -> ApiResult<UsageSummary> {
    tx.query_opt(
        "SELECT COUNT(*),
                COALESCE(SUM(CASE WHEN route = 'upload-url' AND status = 200 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN route = 'kb/sync' AND status = 200 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN route = 'kb/query' AND status = 200 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN route = 'chat' AND status = 200 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status >= 300 THEN 1 ELSE 0 END), 0),
                COUNT(DISTINCT subject),
                MIN(recorded_at),
                MAX(recorded_at)
         FROM usage_events WHERE tenant_id = ?1",
        &[],
        |row| {
            let count = |idx: usize| row.get::<_, i64>(idx).map(|n| n.max(0) as u64);
            let first: Option<String> = row.get(7)?;
            let last: Option<String> = row.get(8)?;
            Ok(UsageSummary {
                api_calls: count(0)?,
                document_uploads: count(1)?,
                kb_syncs: count(2)?,
                kb_queries: count(3)?,
                chat_sessions: count(4)?,
                errors: count(5)?,
                unique_users: count(6)?,
                first_activity: first.as_deref().map(|s| parse_ts(7, s)).transpose()?,
                last_activity: last.as_deref().map(|s| parse_ts(8, s)).transpose()?,
                generated_at: now,
            })
        },
    )?
    .ok_or_else(|| ApiError::UpstreamError("usage aggregate returned no row".into()))
}

pub async fn usage_summary(store: &DataGateway, scope: &TenantScope) -> ApiResult<UsageSummary> {
    let summary = store
        .read(scope, |tx| summarize(tx, crate::store::now()))
        .await?;
    tracing::debug!(target: "cloudable::usage", tenant_id = %scope.tenant_id(), api_calls = summary.api_calls, "usage summarized");
    Ok(summary)
}

/// Persists tenant-attributed trace events, then forwards every event to `inner`.
/// Store failures are logged and never reach the request.
pub struct UsageTraceSink {
    store: DataGateway,
    inner: Arc<dyn TraceSink>,
}

impl UsageTraceSink {
    pub fn new(store: DataGateway, inner: Arc<dyn TraceSink>) -> Self {
        Self { store, inner }
    }

    async fn persist(&self, tenant_id: &str, event: &TraceEvent) -> ApiResult<()> {
        let scope = TenantScope::provisioning(tenant_id)?;
        let event = event.clone();
        self.store
            .atomic(&scope, move |tx| record_event(tx, &event, crate::store::now()))
            .await
    }
}

#[async_trait]
impl TraceSink for UsageTraceSink {
    async fn record(&self, event: TraceEvent) {
        if let Some(tenant_id) = event.tenant_id.as_deref() {
            if let Err(e) = self.persist(tenant_id, &event).await {
                tracing::warn!(target: "cloudable::usage", tenant_id = %tenant_id, trace_id = %event.trace_id, error = %e, "usage event not stored");
            }
        }
        self.inner.record(event).await;
    }
}
