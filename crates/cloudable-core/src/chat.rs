//! Chat façade: optional KB retrieval in the caller's tenant, then one inference call.

use crate::collaborators::{with_timeout, ChatPrompt, ContextPassage, InferenceService};
use crate::error::{ApiError, ApiResult};
use crate::kb_sync::{KbSyncOrchestrator, QueryRequest};
use crate::rbac::TenantScope;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub const MAX_MESSAGE_CHARS: usize = 4000;

const SYSTEM_INSTRUCTION: &str = "You are a helpful assistant for this organization's knowledge base. \
Answer using only the provided context. If the context does not contain the answer, say so plainly. \
Be concise and cite the document titles you used.";

const NO_CONTEXT_INSTRUCTION: &str = "You are a helpful assistant for this organization. \
Be concise and say so plainly when you do not know the answer.";

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub use_kb: Option<bool>,
    #[serde(default)]
    pub max_context: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceDocument {
    pub doc_id: String,
    pub title: String,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub response: String,
    pub source_documents: Vec<SourceDocument>,
}

pub struct ChatFacade {
    inference: Arc<dyn InferenceService>,
    kb: Arc<KbSyncOrchestrator>,
    timeout: Duration,
}

impl ChatFacade {
    pub fn new(inference: Arc<dyn InferenceService>, kb: Arc<KbSyncOrchestrator>, timeout: Duration) -> Self {
        Self {
            inference,
            kb,
            timeout,
        }
    }

    pub async fn chat(&self, scope: &TenantScope, req: ChatRequest) -> ApiResult<ChatResponse> {
        let message = req.message.trim().to_string();
        if message.is_empty() || message.chars().count() > MAX_MESSAGE_CHARS {
            return Err(ApiError::InvalidRequest(format!(
                "message must be 1..={} characters",
                MAX_MESSAGE_CHARS
            )));
        }

        let mut context = Vec::new();
        let mut sources = Vec::new();
        if req.use_kb.unwrap_or(true) {
            let hits = self
                .kb
                .query(
                    scope,
                    QueryRequest {
                        text: message.clone(),
                        max_results: req.max_context,
                    },
                )
                .await?;
            for r in hits.results {
                context.push(ContextPassage {
                    doc_id: r.doc_id.clone(),
                    title: r.title.clone(),
                    excerpt: r.excerpt,
                });
                sources.push(SourceDocument {
                    doc_id: r.doc_id,
                    title: r.title,
                    score: r.score,
                });
            }
        }

        let system = if context.is_empty() && !req.use_kb.unwrap_or(true) {
            NO_CONTEXT_INSTRUCTION
        } else {
            SYSTEM_INSTRUCTION
        };
        let prompt = ChatPrompt {
            system: system.to_string(),
            context,
            user_message: message,
        };
        let response = with_timeout(self.timeout, "inference service", self.inference.complete(prompt)).await?;

        tracing::info!(
            target: "cloudable::chat",
            tenant_id = %scope.tenant_id(),
            sources = sources.len(),
            "chat answered"
        );
        Ok(ChatResponse {
            response,
            source_documents: sources,
        })
    }
}
