//! Cloudable gateway: axum front for the core request router.
//! Every request is converted into a `RequestEnvelope`; routing, auth and errors live in the core.

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderName, HeaderValue, Method, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json, Router,
};
use cloudable_core::{Collaborators, CoreConfig, RequestEnvelope, RequestRouter};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Upper bound on request bodies read into an envelope.
const MAX_BODY_BYTES: usize = 1024 * 1024;
const TRACE_HEADER: &str = "x-trace-id";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = CoreConfig::load()?;
    let router = RequestRouter::build(&cfg, Collaborators::from_config(&cfg))?;
    let app = app(Arc::new(router));

    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
    tracing::info!(target: "cloudable::gateway", addr = %cfg.bind_addr, version = cloudable_core::version(), "gateway listening");
    axum::serve(listener, app).await?;
    Ok(())
}

/// All paths go to the core router; CORS preflight is answered here.
fn app(router: Arc<RequestRouter>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static("x-api-key"),
            HeaderName::from_static("x-tenant-id"),
        ])
        .expose_headers([HeaderName::from_static(TRACE_HEADER)]);

    Router::new()
        .fallback(dispatch)
        .with_state(router)
        .layer(axum::middleware::from_fn(log_requests))
        .layer(cors)
}

async fn log_requests(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let response = next.run(request).await;
    tracing::info!(target: "cloudable::gateway", %method, %path, status = response.status().as_u16(), "request served");
    response
}

async fn dispatch(State(router): State<Arc<RequestRouter>>, request: Request<Body>) -> Response {
    let (parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(_) => {
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(json!({ "error": "InvalidRequest", "message": "request body too large" })),
            )
                .into_response()
        }
    };

    let headers = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect();
    let envelope = RequestEnvelope {
        method: parts.method.as_str().to_string(),
        path: parts.uri.path().to_string(),
        headers,
        body: bytes.to_vec(),
    };

    let out = router.dispatch(envelope).await;
    let status = StatusCode::from_u16(out.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, Json(out.body)).into_response();
    if let Ok(v) = HeaderValue::from_str(&out.trace_id) {
        response.headers_mut().insert(TRACE_HEADER, v);
    }
    response
}
