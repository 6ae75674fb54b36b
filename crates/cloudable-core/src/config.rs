//! Core configuration loaded from file and environment.
//!
//! Precedence: built-in defaults < TOML file (`CLOUDABLE_CONFIG`, default `config/cloudable.toml`)
//! < environment variables with prefix `CLOUDABLE` and separator `__`
//! (e.g. `CLOUDABLE__REQUEST_DEADLINE_MS=10000`).
//!
//! | Key | Default | Description |
//! |-----|---------|-------------|
//! | bind_addr | 127.0.0.1:8080 | Gateway listen address. |
//! | database_path | ./data/cloudable.db | SQLite file backing the data gateway. |
//! | request_deadline_ms | 25000 | Whole-request deadline (`DeadlineExceeded`). |
//! | upstream_timeout_ms | 8000 | Per-call timeout for indexing/inference/object store. |
//! | store_timeout_ms | 3000 | Per-call timeout for the relational store. |
//! | sync_retry_attempts | 2 | Attempts for the idempotent sync trigger. |
//! | query_default_results / query_max_results | 3 / 25 | KB query result bounds. |
//! | upload_url_expires_secs | 3600 | Presigned upload lifetime. |
//!
//! Per-tenant resources (`bucket`, `summary_bucket`, `index_namespace`) live under
//! `[tenants.<tenant_id>]` so onboarding a tenant is a config change, never a code change.

use crate::error::{ApiError, ApiResult};
use crate::rbac::Role;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// One entry of the identity directory. Only the SHA-256 digest of the token is stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityEntry {
    /// Lowercase hex SHA-256 of the bearer token / API key.
    pub token_sha256: String,
    /// Human-readable subject (user id, service name) for logs.
    pub subject: String,
    pub tenant_id: String,
    #[serde(default)]
    pub customer_id: Option<String>,
    pub role: Role,
}

/// External resource handles owned by one tenant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TenantResources {
    /// Object-store bucket receiving the tenant's documents.
    #[serde(default)]
    pub bucket: Option<String>,
    /// Bucket holding `<document_id>.json` summaries produced for the tenant's documents.
    #[serde(default)]
    pub summary_bucket: Option<String>,
    /// Index namespace in the external vector index. Defaults to `kb-<tenant_id>`.
    #[serde(default)]
    pub index_namespace: Option<String>,
}

/// Data-driven `tenant_id -> resources` mapping, resolved per request.
#[derive(Debug, Clone, Default)]
pub struct TenantResourceMap {
    entries: HashMap<String, TenantResources>,
}

impl TenantResourceMap {
    pub fn new(entries: HashMap<String, TenantResources>) -> Self {
        Self { entries }
    }

    pub fn bucket(&self, tenant_id: &str) -> ApiResult<String> {
        self.entries
            .get(tenant_id)
            .and_then(|r| r.bucket.clone())
            .filter(|b| !b.trim().is_empty())
            .ok_or_else(|| {
                ApiError::NotFound(format!("tenant bucket not configured for {}", tenant_id))
            })
    }

    pub fn summary_bucket(&self, tenant_id: &str) -> ApiResult<String> {
        self.entries
            .get(tenant_id)
            .and_then(|r| r.summary_bucket.clone())
            .filter(|b| !b.trim().is_empty())
            .ok_or_else(|| {
                ApiError::NotFound(format!("summary bucket not configured for {}", tenant_id))
            })
    }

    pub fn index_namespace(&self, tenant_id: &str) -> String {
        self.entries
            .get(tenant_id)
            .and_then(|r| r.index_namespace.clone())
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("kb-{}", tenant_id))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    pub bind_addr: String,
    pub database_path: String,
    pub request_deadline_ms: u64,
    pub upstream_timeout_ms: u64,
    pub store_timeout_ms: u64,
    pub sync_retry_attempts: u32,
    pub query_default_results: usize,
    pub query_max_results: usize,
    pub upload_url_expires_secs: u64,

    /// Base URL of the external indexing / vector search service.
    #[serde(default)]
    pub indexer_url: Option<String>,
    /// OpenAI-compatible chat completions endpoint.
    #[serde(default)]
    pub inference_url: Option<String>,
    #[serde(default)]
    pub inference_model: Option<String>,
    #[serde(default)]
    pub inference_api_key: Option<String>,
    /// Presign broker in front of the object store.
    #[serde(default)]
    pub presign_url: Option<String>,
    /// Tracing collector. When unset, trace events only go to the log.
    #[serde(default)]
    pub trace_url: Option<String>,

    #[serde(default)]
    pub identities: Vec<IdentityEntry>,
    #[serde(default)]
    pub tenants: HashMap<String, TenantResources>,
}

impl CoreConfig {
    /// Load config from file and environment. Path from `CLOUDABLE_CONFIG` or `config/cloudable`.
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("CLOUDABLE_CONFIG").unwrap_or_else(|_| "config/cloudable.toml".to_string());
        let builder = Self::defaults()?;

        let path = Path::new(&config_path);
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        builder
            .add_source(config::Environment::with_prefix("CLOUDABLE").separator("__"))
            .build()?
            .try_deserialize()
    }

    /// Load from an inline TOML document on top of the defaults (no environment layer).
    pub fn from_toml_str(toml: &str) -> Result<Self, config::ConfigError> {
        Self::defaults()?
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    fn defaults() -> Result<config::ConfigBuilder<config::builder::DefaultState>, config::ConfigError> {
        config::Config::builder()
            .set_default("bind_addr", "127.0.0.1:8080")?
            .set_default("database_path", "./data/cloudable.db")?
            .set_default("request_deadline_ms", 25_000_i64)?
            .set_default("upstream_timeout_ms", 8_000_i64)?
            .set_default("store_timeout_ms", 3_000_i64)?
            .set_default("sync_retry_attempts", 2_i64)?
            .set_default("query_default_results", 3_i64)?
            .set_default("query_max_results", 25_i64)?
            .set_default("upload_url_expires_secs", 3_600_i64)
    }

    pub fn request_deadline(&self) -> Duration {
        Duration::from_millis(self.request_deadline_ms)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn tenant_resources(&self) -> TenantResourceMap {
        TenantResourceMap::new(self.tenants.clone())
    }
}
