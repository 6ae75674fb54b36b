//! Cloudable core: tenant isolation, RBAC, customer journeys and knowledge-base orchestration.
//! Transport-neutral; the gateway binary feeds it [`RequestEnvelope`]s.

pub mod chat;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod journey;
pub mod kb_sync;
pub mod rbac;
pub mod router;
pub mod store;
pub mod usage;

pub use chat::{ChatFacade, ChatRequest, ChatResponse};
pub use collaborators::{
    with_timeout, ChatPrompt, IndexHit, IndexingService, InferenceService, IngestionAck, LogTraceSink,
    ObjectStore, PresignedUpload, TraceEvent, TraceSink,
};
pub use config::{CoreConfig, IdentityEntry, TenantResourceMap, TenantResources};
pub use error::{ApiError, ApiResult, ErrorKind};
pub use journey::{AssessmentScorer, JourneyMachine, Recommendation, RubricScorer, Stage};
pub use kb_sync::{KbSettings, KbSyncOrchestrator, SummaryRequest, SummaryResponse};
pub use rbac::{token_digest, Operation, Principal, RbacResolver, Role, TenantScope};
pub use router::{Collaborators, RequestEnvelope, RequestRouter, ResponseEnvelope, Route};
pub use store::{AnswerPair, Assessment, Customer, DataGateway, Journey, KbItem};
pub use usage::{UsageSummary, UsageTraceSink};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
