//! Tenant-scoped data gateway over SQLite.
//!
//! The only component that talks to the relational store. Every statement goes through
//! [`ScopedTx`], which binds the caller's tenant as `?1` and refuses any SQL that does not carry
//! a top-level `WHERE tenant_id = ?1` predicate left unwidened by a later `OR` (or, for inserts,
//! a leading `tenant_id` column bound to `?1`).
//! Every call runs inside one transaction; multi-entity writes use [`DataGateway::atomic`],
//! which opens it with `BEGIN IMMEDIATE` so concurrent writers serialize. A unit that outlives
//! the store timeout, or whose caller is dropped, is interrupted and rolled back; it never
//! commits after the caller has been told it failed.

use crate::error::{ApiError, ApiResult};
use crate::journey::Stage;
use crate::rbac::TenantScope;
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::types::{ToSql, Type};
use rusqlite::{
    Connection, ErrorCode, InterruptHandle, OpenFlags, OptionalExtension, Row, TransactionBehavior,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

static TENANT_PREDICATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\bWHERE\s+TENANT_ID\s*=\s*\?1\b").expect("static tenant predicate pattern")
});
static INSERT_COLUMNS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^INSERT\s+INTO\s+\w+\s*\(\s*TENANT_ID\s*,").expect("static insert column pattern")
});
static INSERT_VALUES_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\bVALUES\s*\(\s*\?1\s*,").expect("static insert values pattern")
});

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tenants (
    tenant_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS customers (
    tenant_id TEXT NOT NULL,
    customer_id TEXT NOT NULL,
    name TEXT NOT NULL,
    primary_contact TEXT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (tenant_id, customer_id)
);

CREATE TABLE IF NOT EXISTS journeys (
    tenant_id TEXT NOT NULL,
    customer_id TEXT NOT NULL,
    stage TEXT NOT NULL,
    tasks_completed INTEGER NOT NULL DEFAULT 0,
    last_update TEXT NOT NULL,
    PRIMARY KEY (tenant_id, customer_id)
);

CREATE TABLE IF NOT EXISTS assessments (
    tenant_id TEXT NOT NULL,
    customer_id TEXT NOT NULL,
    assessed_at TEXT NOT NULL,
    q1 TEXT NULL,
    q2 TEXT NULL,
    q3 TEXT NULL,
    q4 TEXT NULL,
    q5 TEXT NULL,
    answers_json TEXT NOT NULL,
    PRIMARY KEY (tenant_id, customer_id, assessed_at)
);

CREATE TABLE IF NOT EXISTS kb_items (
    tenant_id TEXT NOT NULL,
    doc_id TEXT NOT NULL,
    s3_uri TEXT NOT NULL,
    title TEXT NOT NULL,
    tags TEXT NOT NULL DEFAULT '[]',
    last_synced TEXT NULL,
    PRIMARY KEY (tenant_id, doc_id)
);

CREATE TABLE IF NOT EXISTS usage_events (
    tenant_id TEXT NOT NULL,
    trace_id TEXT NOT NULL,
    route TEXT NOT NULL,
    subject TEXT NULL,
    status INTEGER NOT NULL,
    latency_ms INTEGER NOT NULL,
    recorded_at TEXT NOT NULL,
    PRIMARY KEY (tenant_id, trace_id)
);
"#;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub tenant_id: String,
    pub customer_id: String,
    pub name: String,
    pub primary_contact: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Journey {
    pub tenant_id: String,
    pub customer_id: String,
    pub stage: Stage,
    pub tasks_completed: u32,
    pub last_update: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerPair {
    pub question: String,
    pub answer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    pub tenant_id: String,
    pub customer_id: String,
    pub assessed_at: DateTime<Utc>,
    pub answers: Vec<AnswerPair>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KbItem {
    pub tenant_id: String,
    pub doc_id: String,
    pub s3_uri: String,
    pub title: String,
    pub tags: Vec<String>,
    pub last_synced: Option<DateTime<Utc>>,
}

/// Fixed-width RFC 3339 (microseconds, `Z`), so text order matches time order.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Smallest timestamp that is both `>= now` and strictly after `previous`.
fn strictly_after(previous: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    match previous {
        Some(prev) if now <= prev => prev + ChronoDuration::microseconds(1),
        _ => now,
    }
}

/// Truncate to the stored precision so values read back compare equal.
fn now_micros() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now)
}

/// Words outside quotes at parenthesis depth 0, with their byte offsets.
/// `None` when the parentheses do not balance.
fn top_level_words(sql: &str) -> Option<Vec<(usize, &str)>> {
    let mut words = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut start: Option<usize> = None;
    for (i, c) in sql.char_indices() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }
        let is_word = c.is_ascii_alphanumeric() || c == '_';
        match (start, is_word) {
            (None, true) => start = Some(i),
            (Some(s), false) => {
                if depth == 0 {
                    words.push((s, &sql[s..i]));
                }
                start = None;
            }
            _ => {}
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return None;
                }
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        if depth == 0 {
            words.push((s, &sql[s..]));
        }
    }
    (depth == 0 && quote.is_none()).then_some(words)
}

/// A transaction bound to one tenant. Every statement is checked and gets the tenant as `?1`.
pub struct ScopedTx<'c> {
    conn: &'c Connection,
    tenant_id: String,
}

impl<'c> ScopedTx<'c> {
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    fn guard(&self, sql: &str) -> ApiResult<()> {
        if self.tenant_id.trim().is_empty() {
            return Err(self.violation(sql, "empty tenant scope"));
        }
        let upper = sql.trim().to_uppercase();
        if upper.starts_with("INSERT") {
            if INSERT_COLUMNS_RE.is_match(&upper) && INSERT_VALUES_RE.is_match(&upper) {
                return Ok(());
            }
            return Err(self.violation(sql, "insert does not bind tenant_id to ?1"));
        }

        let words = top_level_words(&upper)
            .ok_or_else(|| self.violation(sql, "unbalanced parentheses"))?;
        let predicate = TENANT_PREDICATE_RE
            .find_iter(&upper)
            .find(|m| words.iter().any(|(at, w)| *at == m.start() && *w == "WHERE"))
            .ok_or_else(|| self.violation(sql, "statement lacks tenant predicate"))?;
        if words.iter().any(|(at, w)| *at >= predicate.end() && *w == "OR") {
            return Err(self.violation(sql, "tenant predicate is widened by OR"));
        }
        Ok(())
    }

    fn violation(&self, sql: &str, reason: &str) -> ApiError {
        tracing::error!(target: "cloudable::store", tenant_id = %self.tenant_id, sql = %sql, reason, "scope violation");
        ApiError::ScopeViolation(format!("{}: {}", reason, sql))
    }

    fn bind<'p>(&'p self, params: &[&'p dyn ToSql]) -> Vec<&'p dyn ToSql> {
        let mut all: Vec<&dyn ToSql> = Vec::with_capacity(params.len() + 1);
        all.push(&self.tenant_id);
        all.extend_from_slice(params);
        all
    }

    /// Execute a tenant-scoped statement; `params` bind from `?2`.
    pub fn execute(&self, sql: &str, params: &[&dyn ToSql]) -> ApiResult<usize> {
        self.guard(sql)?;
        Ok(self.conn.execute(sql, self.bind(params).as_slice())?)
    }

    pub fn query_opt<T, F>(&self, sql: &str, params: &[&dyn ToSql], map: F) -> ApiResult<Option<T>>
    where
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.guard(sql)?;
        Ok(self
            .conn
            .query_row(sql, self.bind(params).as_slice(), map)
            .optional()?)
    }

    pub fn query_all<T, F>(&self, sql: &str, params: &[&dyn ToSql], map: F) -> ApiResult<Vec<T>>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.guard(sql)?;
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(self.bind(params).as_slice(), map)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn get_customer(&self, customer_id: &str) -> ApiResult<Option<Customer>> {
        self.query_opt(
            "SELECT tenant_id, customer_id, name, primary_contact, created_at
             FROM customers WHERE tenant_id = ?1 AND customer_id = ?2",
            &[&customer_id],
            |row| {
                let created: String = row.get(4)?;
                Ok(Customer {
                    tenant_id: row.get(0)?,
                    customer_id: row.get(1)?,
                    name: row.get(2)?,
                    primary_contact: row.get(3)?,
                    created_at: parse_ts(4, &created)?,
                })
            },
        )
    }

    pub fn get_journey(&self, customer_id: &str) -> ApiResult<Option<Journey>> {
        self.query_opt(
            "SELECT tenant_id, customer_id, stage, tasks_completed, last_update
             FROM journeys WHERE tenant_id = ?1 AND customer_id = ?2",
            &[&customer_id],
            |row| {
                let stage: String = row.get(2)?;
                let updated: String = row.get(4)?;
                Ok(Journey {
                    tenant_id: row.get(0)?,
                    customer_id: row.get(1)?,
                    stage: stage.parse().map_err(|e: ApiError| {
                        rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e))
                    })?,
                    tasks_completed: row.get(3)?,
                    last_update: parse_ts(4, &updated)?,
                })
            },
        )
    }

    pub fn upsert_journey(&self, journey: &Journey) -> ApiResult<()> {
        if journey.tenant_id != self.tenant_id {
            return Err(self.violation("upsert_journey", "row tenant differs from scope"));
        }
        self.execute(
            "INSERT INTO journeys (tenant_id, customer_id, stage, tasks_completed, last_update)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(tenant_id, customer_id) DO UPDATE SET
                stage = excluded.stage,
                tasks_completed = excluded.tasks_completed,
                last_update = excluded.last_update",
            &[
                &journey.customer_id,
                &journey.stage.as_str(),
                &journey.tasks_completed,
                &format_ts(journey.last_update),
            ],
        )?;
        Ok(())
    }

    /// Append an immutable assessment. `assessed_at` is bumped past the customer's latest one.
    pub fn append_assessment(
        &self,
        customer_id: &str,
        answers: &[AnswerPair],
        now: DateTime<Utc>,
    ) -> ApiResult<Assessment> {
        let previous = self.latest_assessment(customer_id)?.map(|a| a.assessed_at);
        let assessed_at = strictly_after(previous, now);

        let q: Vec<Option<&str>> = (0..5)
            .map(|i| answers.get(i).map(|a| a.answer.as_str()))
            .collect();
        let answers_json = serde_json::to_string(answers)
            .map_err(|e| ApiError::UpstreamError(format!("encode answers: {}", e)))?;

        self.execute(
            "INSERT INTO assessments (tenant_id, customer_id, assessed_at, q1, q2, q3, q4, q5, answers_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            &[
                &customer_id,
                &format_ts(assessed_at),
                &q[0],
                &q[1],
                &q[2],
                &q[3],
                &q[4],
                &answers_json,
            ],
        )?;

        Ok(Assessment {
            tenant_id: self.tenant_id.clone(),
            customer_id: customer_id.to_string(),
            assessed_at,
            answers: answers.to_vec(),
        })
    }

    pub fn latest_assessment(&self, customer_id: &str) -> ApiResult<Option<Assessment>> {
        self.query_opt(
            "SELECT tenant_id, customer_id, assessed_at, answers_json
             FROM assessments WHERE tenant_id = ?1 AND customer_id = ?2
             ORDER BY assessed_at DESC LIMIT 1",
            &[&customer_id],
            |row| {
                let assessed: String = row.get(2)?;
                let raw: String = row.get(3)?;
                Ok(Assessment {
                    tenant_id: row.get(0)?,
                    customer_id: row.get(1)?,
                    assessed_at: parse_ts(2, &assessed)?,
                    answers: serde_json::from_str(&raw).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e))
                    })?,
                })
            },
        )
    }

    pub fn count_assessments(&self, customer_id: &str) -> ApiResult<u64> {
        Ok(self
            .query_opt(
                "SELECT COUNT(*) FROM assessments WHERE tenant_id = ?1 AND customer_id = ?2",
                &[&customer_id],
                |row| row.get::<_, i64>(0),
            )?
            .unwrap_or(0) as u64)
    }

    /// Insert or refresh catalog metadata. `last_synced` is left untouched.
    pub fn upsert_kb_item(
        &self,
        doc_id: &str,
        s3_uri: &str,
        title: &str,
        tags: &[String],
    ) -> ApiResult<KbItem> {
        let tags_json = serde_json::to_string(tags)
            .map_err(|e| ApiError::UpstreamError(format!("encode tags: {}", e)))?;
        self.execute(
            "INSERT INTO kb_items (tenant_id, doc_id, s3_uri, title, tags, last_synced)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL)
             ON CONFLICT(tenant_id, doc_id) DO UPDATE SET
                s3_uri = excluded.s3_uri,
                title = excluded.title,
                tags = excluded.tags",
            &[&doc_id, &s3_uri, &title, &tags_json],
        )?;
        self.get_kb_item(doc_id)?
            .ok_or_else(|| ApiError::UpstreamError(format!("catalog row vanished: {}", doc_id)))
    }

    pub fn get_kb_item(&self, doc_id: &str) -> ApiResult<Option<KbItem>> {
        self.query_opt(
            "SELECT tenant_id, doc_id, s3_uri, title, tags, last_synced
             FROM kb_items WHERE tenant_id = ?1 AND doc_id = ?2",
            &[&doc_id],
            map_kb_item,
        )
    }

    /// All catalog rows of the tenant, or only the given doc ids.
    pub fn list_kb_items(&self, doc_ids: Option<&[String]>) -> ApiResult<Vec<KbItem>> {
        match doc_ids {
            None => self.query_all(
                "SELECT tenant_id, doc_id, s3_uri, title, tags, last_synced
                 FROM kb_items WHERE tenant_id = ?1 ORDER BY doc_id",
                &[],
                map_kb_item,
            ),
            Some(ids) => {
                let mut items = Vec::with_capacity(ids.len());
                for id in ids {
                    if let Some(item) = self.get_kb_item(id)? {
                        items.push(item);
                    }
                }
                Ok(items)
            }
        }
    }

    /// Stamp a successful indexing acknowledgement; strictly after any previous stamp.
    pub fn mark_kb_synced(&self, doc_id: &str, now: DateTime<Utc>) -> ApiResult<DateTime<Utc>> {
        let item = self
            .get_kb_item(doc_id)?
            .ok_or_else(|| ApiError::NotFound(format!("document not found: {}", doc_id)))?;
        let stamp = strictly_after(item.last_synced, now);
        self.execute(
            "UPDATE kb_items SET last_synced = ?3 WHERE tenant_id = ?1 AND doc_id = ?2",
            &[&doc_id, &format_ts(stamp)],
        )?;
        Ok(stamp)
    }

    pub fn provision_tenant(&self, name: &str, now: DateTime<Utc>) -> ApiResult<()> {
        self.execute(
            "INSERT INTO tenants (tenant_id, name, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(tenant_id) DO UPDATE SET name = excluded.name",
            &[&name, &format_ts(now)],
        )?;
        Ok(())
    }

    pub fn provision_customer(
        &self,
        customer_id: &str,
        name: &str,
        primary_contact: Option<&str>,
        now: DateTime<Utc>,
    ) -> ApiResult<()> {
        self.execute(
            "INSERT INTO customers (tenant_id, customer_id, name, primary_contact, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(tenant_id, customer_id) DO UPDATE SET
                name = excluded.name,
                primary_contact = excluded.primary_contact",
            &[&customer_id, &name, &primary_contact, &format_ts(now)],
        )?;
        Ok(())
    }
}

fn map_kb_item(row: &Row<'_>) -> rusqlite::Result<KbItem> {
    let tags: String = row.get(4)?;
    let synced: Option<String> = row.get(5)?;
    Ok(KbItem {
        tenant_id: row.get(0)?,
        doc_id: row.get(1)?,
        s3_uri: row.get(2)?,
        title: row.get(3)?,
        tags: serde_json::from_str(&tags)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?,
        last_synced: synced.as_deref().map(|s| parse_ts(5, s)).transpose()?,
    })
}

const UNIT_PENDING: u8 = 0;
const UNIT_COMMITTING: u8 = 1;
const UNIT_ABANDONED: u8 = 2;

/// Shared by a blocking unit of work and the caller awaiting it. The first state change wins:
/// either the unit starts its commit or the caller abandons it and the unit rolls back.
#[derive(Default)]
struct UnitControl {
    state: AtomicU8,
    interrupt: Mutex<Option<InterruptHandle>>,
}

impl UnitControl {
    fn register(&self, handle: InterruptHandle) {
        if let Ok(mut slot) = self.interrupt.lock() {
            *slot = Some(handle);
        }
    }

    fn is_abandoned(&self) -> bool {
        self.state.load(Ordering::Acquire) == UNIT_ABANDONED
    }

    fn try_commit(&self) -> bool {
        self.state
            .compare_exchange(UNIT_PENDING, UNIT_COMMITTING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// `false` when the commit already started.
    fn abandon(&self) -> bool {
        let won = self
            .state
            .compare_exchange(UNIT_PENDING, UNIT_ABANDONED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            if let Ok(slot) = self.interrupt.lock() {
                if let Some(handle) = slot.as_ref() {
                    handle.interrupt();
                }
            }
        }
        won
    }
}

/// Abandons the unit when the awaiting future is dropped (e.g. by the request deadline).
struct AbandonOnDrop(Option<Arc<UnitControl>>);

impl AbandonOnDrop {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        if let Some(control) = self.0.take() {
            if control.abandon() {
                tracing::warn!(target: "cloudable::store", "caller went away; store unit abandoned");
            }
        }
    }
}

fn store_timeout(timeout: Duration) -> ApiError {
    ApiError::UpstreamTimeout(format!(
        "relational store did not respond within {} ms",
        timeout.as_millis()
    ))
}

/// Lock waits that outlast the busy timeout are store timeouts, not store failures.
fn lock_wait_error(err: rusqlite::Error, timeout: Duration) -> ApiError {
    match err.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => store_timeout(timeout),
        _ => ApiError::from(err),
    }
}

fn rollback_quietly(tx: rusqlite::Transaction<'_>) {
    // An interrupted statement may already have rolled the transaction back.
    if let Err(e) = tx.rollback() {
        tracing::debug!(target: "cloudable::store", error = %e, "rollback after failed unit");
    }
}

/// Handle to the relational store. Cheap to clone; each call opens its own connection.
#[derive(Clone)]
pub struct DataGateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    db_path: PathBuf,
    timeout: Duration,
}

impl DataGateway {
    /// Open or create the database and ensure the schema exists.
    pub fn open(db_path: impl AsRef<Path>, timeout: Duration) -> ApiResult<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    ApiError::UpstreamError(format!("create {}: {}", parent.display(), e))
                })?;
            }
        }
        let gateway = Self {
            inner: Arc::new(GatewayInner { db_path, timeout }),
        };
        let conn = Self::connect_at(&gateway.inner.db_path, timeout)?;
        conn.execute_batch(SCHEMA)?;
        tracing::info!(target: "cloudable::store", path = %gateway.inner.db_path.display(), "relational store ready");
        Ok(gateway)
    }

    /// Lock waits are bounded by the store timeout.
    fn connect_at(path: &Path, busy: Duration) -> ApiResult<Connection> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        conn.busy_timeout(busy)?;
        Ok(conn)
    }

    /// Run `unit` as one atomic write: `BEGIN IMMEDIATE`, commit on `Ok`, roll back on `Err`.
    pub async fn atomic<T, F>(&self, scope: &TenantScope, unit: F) -> ApiResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&ScopedTx<'_>) -> ApiResult<T> + Send + 'static,
    {
        self.run(scope, TransactionBehavior::Immediate, unit).await
    }

    /// Point-in-time consistent read.
    pub async fn read<T, F>(&self, scope: &TenantScope, unit: F) -> ApiResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&ScopedTx<'_>) -> ApiResult<T> + Send + 'static,
    {
        self.run(scope, TransactionBehavior::Deferred, unit).await
    }

    /// A unit that misses the store timeout, or whose caller goes away, never commits.
    async fn run<T, F>(
        &self,
        scope: &TenantScope,
        behavior: TransactionBehavior,
        unit: F,
    ) -> ApiResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&ScopedTx<'_>) -> ApiResult<T> + Send + 'static,
    {
        let path = self.inner.db_path.clone();
        let timeout = self.inner.timeout;
        let tenant_id = scope.tenant_id().to_string();
        let control = Arc::new(UnitControl::default());
        let mut on_drop = AbandonOnDrop(Some(Arc::clone(&control)));

        let worker = Arc::clone(&control);
        let mut task = tokio::task::spawn_blocking(move || -> ApiResult<T> {
            let mut conn = Self::connect_at(&path, timeout)?;
            worker.register(conn.get_interrupt_handle());
            if worker.is_abandoned() {
                return Err(store_timeout(timeout));
            }
            let tx = conn
                .transaction_with_behavior(behavior)
                .map_err(|e| lock_wait_error(e, timeout))?;
            let result = {
                let scoped = ScopedTx {
                    conn: &tx,
                    tenant_id,
                };
                unit(&scoped)
            };
            match result {
                Ok(value) if worker.try_commit() => {
                    tx.commit().map_err(|e| lock_wait_error(e, timeout))?;
                    Ok(value)
                }
                Ok(_) => {
                    rollback_quietly(tx);
                    Err(store_timeout(timeout))
                }
                Err(e) => {
                    rollback_quietly(tx);
                    Err(e)
                }
            }
        });

        let waited = tokio::time::timeout(timeout, &mut task).await;
        let joined = match waited {
            Ok(joined) => joined,
            Err(_) if control.abandon() => {
                on_drop.disarm();
                tracing::warn!(target: "cloudable::store", timeout_ms = timeout.as_millis() as u64, "relational store timed out; unit abandoned");
                return Err(store_timeout(timeout));
            }
            // The commit is already under way; its outcome is the call's outcome.
            Err(_) => task.await,
        };
        on_drop.disarm();
        joined.unwrap_or_else(|e| Err(ApiError::UpstreamError(format!("store task failed: {}", e))))
    }

    pub async fn get_customer(&self, scope: &TenantScope, customer_id: &str) -> ApiResult<Option<Customer>> {
        let id = customer_id.to_string();
        self.read(scope, move |tx| tx.get_customer(&id)).await
    }

    pub async fn get_journey(&self, scope: &TenantScope, customer_id: &str) -> ApiResult<Option<Journey>> {
        let id = customer_id.to_string();
        self.read(scope, move |tx| tx.get_journey(&id)).await
    }

    pub async fn upsert_journey(&self, scope: &TenantScope, journey: Journey) -> ApiResult<()> {
        self.atomic(scope, move |tx| tx.upsert_journey(&journey)).await
    }

    pub async fn append_assessment(
        &self,
        scope: &TenantScope,
        customer_id: &str,
        answers: Vec<AnswerPair>,
    ) -> ApiResult<Assessment> {
        let id = customer_id.to_string();
        self.atomic(scope, move |tx| tx.append_assessment(&id, &answers, now_micros()))
            .await
    }

    pub async fn latest_assessment(
        &self,
        scope: &TenantScope,
        customer_id: &str,
    ) -> ApiResult<Option<Assessment>> {
        let id = customer_id.to_string();
        self.read(scope, move |tx| tx.latest_assessment(&id)).await
    }

    pub async fn upsert_kb_item(
        &self,
        scope: &TenantScope,
        doc_id: &str,
        s3_uri: &str,
        title: &str,
        tags: Vec<String>,
    ) -> ApiResult<KbItem> {
        let (doc_id, s3_uri, title) = (doc_id.to_string(), s3_uri.to_string(), title.to_string());
        self.atomic(scope, move |tx| tx.upsert_kb_item(&doc_id, &s3_uri, &title, &tags))
            .await
    }

    pub async fn get_kb_item(&self, scope: &TenantScope, doc_id: &str) -> ApiResult<Option<KbItem>> {
        let id = doc_id.to_string();
        self.read(scope, move |tx| tx.get_kb_item(&id)).await
    }

    pub async fn list_kb_items(
        &self,
        scope: &TenantScope,
        doc_ids: Option<Vec<String>>,
    ) -> ApiResult<Vec<KbItem>> {
        self.read(scope, move |tx| tx.list_kb_items(doc_ids.as_deref()))
            .await
    }

    pub async fn mark_kb_synced(&self, scope: &TenantScope, doc_id: &str) -> ApiResult<DateTime<Utc>> {
        let id = doc_id.to_string();
        self.atomic(scope, move |tx| tx.mark_kb_synced(&id, now_micros()))
            .await
    }

    pub async fn provision_tenant(&self, scope: &TenantScope, name: &str) -> ApiResult<()> {
        let name = name.to_string();
        self.atomic(scope, move |tx| tx.provision_tenant(&name, now_micros()))
            .await
    }

    pub async fn provision_customer(
        &self,
        scope: &TenantScope,
        customer_id: &str,
        name: &str,
        primary_contact: Option<&str>,
    ) -> ApiResult<()> {
        crate::rbac::validate_identifier("customer ID", customer_id)?;
        let (id, name) = (customer_id.to_string(), name.to_string());
        let contact = primary_contact.map(str::to_string);
        self.atomic(scope, move |tx| {
            tx.provision_customer(&id, &name, contact.as_deref(), now_micros())
        })
        .await
    }
}

/// Current time at stored precision.
pub(crate) fn now() -> DateTime<Utc> {
    now_micros()
}
