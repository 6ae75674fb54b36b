//! Request router: the single entry point of the core.
//!
//! Takes a transport-neutral [`RequestEnvelope`], runs the fixed check order
//! (route → identity → permission → body parse → scope cross-check → handler under the request
//! deadline) and always returns a [`ResponseEnvelope`]. Errors become the uniform
//! `{error, message}` body; successful bodies echo the caller's `tenant_id`.

use crate::chat::{ChatFacade, ChatRequest};
use crate::collaborators::{
    HttpIndexingService, HttpInferenceService, HttpObjectStore, HttpTraceSink, IndexingService,
    InferenceService, LogTraceSink, ObjectStore, TraceEvent, TraceSink, Unconfigured,
};
use crate::config::CoreConfig;
use crate::error::{ApiError, ApiResult};
use crate::journey::{JourneyMachine, Stage};
use crate::kb_sync::{
    KbSettings, KbSyncOrchestrator, QueryRequest, SummaryRequest, SyncRequest, UploadUrlRequest,
};
use crate::rbac::{Operation, Principal, RbacResolver, StaticIdentityDirectory};
use crate::store::{AnswerPair, DataGateway};
use crate::usage::{usage_summary, UsageTraceSink};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Transport-neutral inbound request. Header names are matched case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct RequestEnvelope {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl RequestEnvelope {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn json(mut self, body: &Value) -> Self {
        self.body = body.to_string().into_bytes();
        self
    }

    fn normalized_headers(&self) -> HashMap<String, String> {
        self.headers
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseEnvelope {
    pub status: u16,
    pub body: Value,
    pub trace_id: String,
}

/// Strip the query string and any trailing slash.
fn normalize_path(path: &str) -> &str {
    let path = path.split('?').next().unwrap_or_default();
    if path.len() > 1 {
        path.trim_end_matches('/')
    } else {
        path
    }
}

/// The unauthenticated liveness check; it never reaches identity resolution.
fn is_health(method: &str, path: &str) -> bool {
    method.eq_ignore_ascii_case("GET") && normalize_path(path) == "/api/health"
}

/// Authenticated routes. Each one maps to exactly one permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    UploadUrl,
    KbSync,
    KbQuery,
    KbSummary,
    Chat,
    CustomerStatus,
    RecordTask,
    SubmitAssessment,
    ForceStage,
    Usage,
}

impl Route {
    pub fn resolve(method: &str, path: &str) -> Option<Route> {
        let method = method.to_ascii_uppercase();
        match (method.as_str(), normalize_path(path)) {
            ("POST", "/api/upload-url") => Some(Route::UploadUrl),
            ("POST", "/api/kb/sync") => Some(Route::KbSync),
            ("POST", "/api/kb/query") => Some(Route::KbQuery),
            ("POST", "/api/kb/summary") => Some(Route::KbSummary),
            ("POST", "/api/chat") => Some(Route::Chat),
            ("POST", "/api/customer-status") => Some(Route::CustomerStatus),
            ("POST", "/api/customer-status/task") => Some(Route::RecordTask),
            ("POST", "/api/customer-status/assessment") => Some(Route::SubmitAssessment),
            ("POST", "/api/customer-status/stage") => Some(Route::ForceStage),
            ("POST", "/api/usage") => Some(Route::Usage),
            _ => None,
        }
    }

    pub fn permission(&self) -> Operation {
        match self {
            Route::UploadUrl => Operation::Upload,
            Route::KbSync => Operation::Sync,
            Route::KbQuery | Route::KbSummary => Operation::Query,
            Route::Chat => Operation::Chat,
            Route::CustomerStatus => Operation::StatusRead,
            Route::RecordTask | Route::SubmitAssessment => Operation::StatusWrite,
            Route::ForceStage => Operation::StatusAdminWrite,
            Route::Usage => Operation::UsageRead,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Route::UploadUrl => "upload-url",
            Route::KbSync => "kb/sync",
            Route::KbQuery => "kb/query",
            Route::KbSummary => "kb/summary",
            Route::Chat => "chat",
            Route::CustomerStatus => "customer-status",
            Route::RecordTask => "customer-status/task",
            Route::SubmitAssessment => "customer-status/assessment",
            Route::ForceStage => "customer-status/stage",
            Route::Usage => "usage",
        }
    }
}

#[derive(Debug, Deserialize)]
struct CustomerRef {
    #[serde(default)]
    customer_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AssessmentBody {
    #[serde(default)]
    customer_id: Option<String>,
    answers: Vec<AnswerPair>,
}

#[derive(Debug, Deserialize)]
struct StageBody {
    #[serde(default)]
    customer_id: Option<String>,
    stage: String,
}

/// External collaborators the router wires into its handlers.
pub struct Collaborators {
    pub indexer: Arc<dyn IndexingService>,
    pub inference: Arc<dyn InferenceService>,
    pub objects: Arc<dyn ObjectStore>,
    pub trace: Arc<dyn TraceSink>,
}

impl Collaborators {
    /// HTTP clients for every configured endpoint; unconfigured ones fail with `UpstreamError`.
    pub fn from_config(cfg: &CoreConfig) -> Self {
        let indexer: Arc<dyn IndexingService> = match cfg.indexer_url.as_deref() {
            Some(url) if !url.trim().is_empty() => Arc::new(HttpIndexingService::new(url)),
            _ => Arc::new(Unconfigured {
                name: "indexing service",
            }),
        };
        let inference: Arc<dyn InferenceService> = match cfg.inference_url.as_deref() {
            Some(url) if !url.trim().is_empty() => Arc::new(HttpInferenceService::new(
                url,
                cfg.inference_model.clone().unwrap_or_else(|| "gpt-4o-mini".to_string()),
                cfg.inference_api_key.clone(),
            )),
            _ => Arc::new(Unconfigured {
                name: "inference service",
            }),
        };
        let objects: Arc<dyn ObjectStore> = match cfg.presign_url.as_deref() {
            Some(url) if !url.trim().is_empty() => Arc::new(HttpObjectStore::new(url)),
            _ => Arc::new(Unconfigured {
                name: "object store",
            }),
        };
        let trace: Arc<dyn TraceSink> = match cfg.trace_url.as_deref() {
            Some(url) if !url.trim().is_empty() => {
                Arc::new(HttpTraceSink::new(url, cfg.upstream_timeout()))
            }
            _ => Arc::new(LogTraceSink),
        };
        Self {
            indexer,
            inference,
            objects,
            trace,
        }
    }
}

pub struct RequestRouter {
    rbac: RbacResolver,
    store: DataGateway,
    journeys: JourneyMachine,
    kb: Arc<KbSyncOrchestrator>,
    chat: ChatFacade,
    trace: Arc<dyn TraceSink>,
    deadline: Duration,
}

impl RequestRouter {
    /// Open the store and wire every component from configuration.
    pub fn build(cfg: &CoreConfig, collaborators: Collaborators) -> ApiResult<Self> {
        let store = DataGateway::open(&cfg.database_path, cfg.store_timeout())?;
        let directory = StaticIdentityDirectory::new(cfg.identities.clone());
        tracing::info!(target: "cloudable::router", identities = directory.len(), tenants = cfg.tenants.len(), "router configured");

        let kb = Arc::new(KbSyncOrchestrator::new(
            store.clone(),
            collaborators.indexer,
            collaborators.objects,
            cfg.tenant_resources(),
            KbSettings::from_config(cfg),
        ));
        Ok(Self {
            rbac: RbacResolver::new(Box::new(directory)),
            journeys: JourneyMachine::with_rubric(store.clone()),
            chat: ChatFacade::new(collaborators.inference, Arc::clone(&kb), cfg.upstream_timeout()),
            kb,
            trace: Arc::new(UsageTraceSink::new(store.clone(), collaborators.trace)),
            store,
            deadline: cfg.request_deadline(),
        })
    }

    /// Data gateway handle, for provisioning tools.
    pub fn store(&self) -> &DataGateway {
        &self.store
    }

    pub async fn dispatch(&self, req: RequestEnvelope) -> ResponseEnvelope {
        let started = Instant::now();
        let trace_id = uuid::Uuid::new_v4().to_string();
        let mut caller: Option<Principal> = None;
        let (route_name, outcome) = if is_health(&req.method, &req.path) {
            (
                "health",
                Ok(json!({
                    "status": "healthy",
                    "timestamp": chrono::Utc::now().to_rfc3339(),
                })),
            )
        } else {
            match Route::resolve(&req.method, &req.path) {
                Some(route) => (route.name(), self.handle(route, &req, &mut caller).await),
                None => (
                    "unmatched",
                    Err(ApiError::NotFound(format!(
                        "no route for {} {}",
                        req.method, req.path
                    ))),
                ),
            }
        };
        let tenant_id = caller.as_ref().map(|p| p.tenant_id.clone());

        let (status, body, error_kind) = match outcome {
            Ok(mut body) => {
                if let (Some(t), Value::Object(map)) = (&tenant_id, &mut body) {
                    map.insert("tenant_id".into(), Value::String(t.clone()));
                }
                (200, body, None)
            }
            Err(err) => {
                let kind = err.kind();
                if matches!(err, ApiError::ScopeViolation(_)) {
                    tracing::error!(target: "cloudable::router", trace_id = %trace_id, route = route_name, error = %err, "isolation invariant breached");
                } else {
                    tracing::info!(target: "cloudable::router", trace_id = %trace_id, route = route_name, kind = kind.as_str(), error = %err, "request rejected");
                }
                let mut body = json!({
                    "error": kind.as_str(),
                    "message": err.public_message(),
                });
                if let Some(t) = &tenant_id {
                    body["tenant_id"] = json!(t);
                }
                if err.is_retryable() {
                    body["retryable"] = json!(true);
                }
                (kind.status(), body, Some(kind.as_str().to_string()))
            }
        };

        self.trace
            .record(TraceEvent {
                trace_id: trace_id.clone(),
                route: route_name.to_string(),
                tenant_id,
                subject: caller.map(|p| p.subject),
                status,
                error_kind,
                latency_ms: started.elapsed().as_millis() as u64,
            })
            .await;

        ResponseEnvelope {
            status,
            body,
            trace_id,
        }
    }

    async fn handle(
        &self,
        route: Route,
        req: &RequestEnvelope,
        caller: &mut Option<Principal>,
    ) -> ApiResult<Value> {
        let principal = self.rbac.resolve(&req.normalized_headers())?;
        *caller = Some(principal.clone());
        self.rbac.authorize(&principal, route.permission())?;

        let body = parse_body(&req.body)?;
        self.rbac.check_body_scope(&principal, &body)?;

        tracing::debug!(target: "cloudable::router", route = route.name(), tenant_id = %principal.tenant_id, subject = %principal.subject, "dispatching");
        match tokio::time::timeout(self.deadline, self.run(route, &principal, body)).await {
            Ok(res) => res,
            Err(_) => Err(ApiError::DeadlineExceeded(format!(
                "request exceeded {} ms",
                self.deadline.as_millis()
            ))),
        }
    }

    async fn run(&self, route: Route, principal: &Principal, body: Value) -> ApiResult<Value> {
        let scope = principal.scope();
        match route {
            Route::UploadUrl => {
                let req: UploadUrlRequest = from_body(body)?;
                to_body(self.kb.upload_url(&scope, req).await?)
            }
            Route::KbSync => {
                let req: SyncRequest = from_body(body)?;
                to_body(self.kb.request_sync(&scope, req).await?)
            }
            Route::KbQuery => {
                let req: QueryRequest = from_body(body)?;
                to_body(self.kb.query(&scope, req).await?)
            }
            Route::KbSummary => {
                let req: SummaryRequest = from_body(body)?;
                to_body(self.kb.summary(&scope, req).await?)
            }
            Route::Chat => {
                let req: ChatRequest = from_body(body)?;
                to_body(self.chat.chat(&scope, req).await?)
            }
            Route::CustomerStatus => {
                let req: CustomerRef = from_body(body)?;
                let customer_id = principal.target_customer(req.customer_id.as_deref())?;
                let status = self.journeys.status(&scope, &customer_id).await?;
                let mut out = to_body(status)?;
                out["customer_id"] = json!(customer_id);
                Ok(out)
            }
            Route::RecordTask => {
                let req: CustomerRef = from_body(body)?;
                let customer_id = principal.target_customer(req.customer_id.as_deref())?;
                let journey = self.journeys.record_task(&scope, &customer_id).await?;
                Ok(json!({ "customer_id": customer_id, "journey": journey }))
            }
            Route::SubmitAssessment => {
                let req: AssessmentBody = from_body(body)?;
                let customer_id = principal.target_customer(req.customer_id.as_deref())?;
                let outcome = self
                    .journeys
                    .submit_assessment(&scope, &customer_id, req.answers)
                    .await?;
                let mut out = to_body(outcome)?;
                out["customer_id"] = json!(customer_id);
                Ok(out)
            }
            Route::ForceStage => {
                let req: StageBody = from_body(body)?;
                let customer_id = principal.target_customer(req.customer_id.as_deref())?;
                let stage: Stage = req.stage.parse()?;
                let journey = self
                    .journeys
                    .force_stage(&scope, &customer_id, stage, principal.role)
                    .await?;
                Ok(json!({ "customer_id": customer_id, "journey": journey }))
            }
            Route::Usage => to_body(usage_summary(&self.store, &scope).await?),
        }
    }
}

/// Empty body is `{}`; anything else must be a JSON object.
fn parse_body(raw: &[u8]) -> ApiResult<Value> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Object(Map::new()));
    }
    let value: Value = serde_json::from_slice(raw)?;
    if !value.is_object() {
        return Err(ApiError::InvalidRequest("request body must be a JSON object".into()));
    }
    Ok(value)
}

fn from_body<T: DeserializeOwned>(body: Value) -> ApiResult<T> {
    serde_json::from_value(body)
        .map_err(|e| ApiError::InvalidRequest(format!("invalid request body: {}", e)))
}

fn to_body<T: Serialize>(value: T) -> ApiResult<Value> {
    serde_json::to_value(value)
        .map_err(|e| ApiError::UpstreamError(format!("encode response: {}", e)))
}
