//! Customer journey state machine.
//!
//! Stages move Discovery → Assessment → Enablement → Launch → Scale. Assessments can only move a
//! customer forward one step; `force_stage` is the administrative override that can skip or
//! regress. Every transition runs inside one data-gateway atomic unit, so a stored assessment is
//! never visible without the journey update it caused.

use crate::error::{ApiError, ApiResult};
use crate::rbac::{Role, TenantScope};
use crate::store::{format_ts, AnswerPair, Assessment, Customer, DataGateway, Journey, ScopedTx};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

pub const MAX_ANSWERS: usize = 50;
pub const MAX_ANSWER_CHARS: usize = 4000;
/// Strict majority of positive answers.
pub const ADVANCE_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Stage {
    Discovery,
    Assessment,
    Enablement,
    Launch,
    Scale,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Discovery,
        Stage::Assessment,
        Stage::Enablement,
        Stage::Launch,
        Stage::Scale,
    ];

    /// Next stage in the linear order; `None` at the terminal stage.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Discovery => Some(Stage::Assessment),
            Stage::Assessment => Some(Stage::Enablement),
            Stage::Enablement => Some(Stage::Launch),
            Stage::Launch => Some(Stage::Scale),
            Stage::Scale => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.next().is_none()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Discovery => "Discovery",
            Stage::Assessment => "Assessment",
            Stage::Enablement => "Enablement",
            Stage::Launch => "Launch",
            Stage::Scale => "Scale",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| ApiError::InvalidRequest(format!("unknown stage: {}", wanted)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    Positive,
    Negative,
    Neutral,
}

/// Scorer output. `advance` is the scorer's opinion; the machine still refuses to leave Scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub score: f64,
    pub positive: usize,
    pub negative: usize,
    pub neutral: usize,
    pub advance: bool,
}

/// Swappable heuristic turning free-text answers into a stage recommendation.
pub trait AssessmentScorer: Send + Sync {
    fn score(&self, stage: Stage, answers: &[AnswerPair]) -> Recommendation;
}

const NEGATIVE_PHRASES: &[&str] = &["not ready", "not yet", "no plan", "not sure", "in progress"];
const NEGATIVE_WORDS: &[&str] = &[
    "no", "not", "never", "none", "dont", "cant", "cannot", "unsure", "unclear", "unknown",
    "blocked", "lacking", "lack", "missing", "pending", "struggling",
];
const POSITIVE_PHRASES: &[&str] = &["in place", "up and running", "on track"];
const POSITIVE_WORDS: &[&str] = &[
    "yes", "ready", "done", "complete", "completed", "implemented", "established", "deployed",
    "confident", "automated", "documented", "defined", "approved", "finished",
];

fn stage_markers(stage: Stage) -> &'static [&'static str] {
    match stage {
        Stage::Discovery => &["identified", "inventoried", "goals", "stakeholders", "scoped"],
        Stage::Assessment => &["assessed", "evaluated", "baseline", "benchmarked", "prioritized"],
        Stage::Enablement => &["trained", "enabled", "onboarded", "configured", "integrated"],
        Stage::Launch => &["launched", "live", "production", "released", "adopted"],
        Stage::Scale => &["scaled", "optimized", "expanded", "growing", "repeatable"],
    }
}

fn has_any(words: &[String], set: &[&str]) -> bool {
    words.iter().any(|w| set.iter().any(|s| w.as_str() == *s))
}

/// Keyword rubric: negative markers win, then generic and stage-specific positive markers.
#[derive(Debug, Default, Clone)]
pub struct RubricScorer;

impl RubricScorer {
    pub fn classify(&self, stage: Stage, answer: &str) -> Signal {
        let lower = answer.to_lowercase();
        let words: Vec<String> = lower
            .split(|c: char| !(c.is_alphanumeric() || c == '\''))
            .filter(|w| !w.is_empty())
            .map(|w| w.replace('\'', ""))
            .collect();

        if NEGATIVE_PHRASES.iter().any(|p| lower.contains(p)) || has_any(&words, NEGATIVE_WORDS) {
            return Signal::Negative;
        }
        if POSITIVE_PHRASES.iter().any(|p| lower.contains(p))
            || has_any(&words, POSITIVE_WORDS)
            || has_any(&words, stage_markers(stage))
        {
            return Signal::Positive;
        }
        Signal::Neutral
    }
}

impl AssessmentScorer for RubricScorer {
    fn score(&self, stage: Stage, answers: &[AnswerPair]) -> Recommendation {
        let mut rec = Recommendation {
            score: 0.0,
            positive: 0,
            negative: 0,
            neutral: 0,
            advance: false,
        };
        for pair in answers {
            match self.classify(stage, &pair.answer) {
                Signal::Positive => rec.positive += 1,
                Signal::Negative => rec.negative += 1,
                Signal::Neutral => rec.neutral += 1,
            }
        }
        if !answers.is_empty() {
            rec.score = rec.positive as f64 / answers.len() as f64;
        }
        rec.advance = rec.score > ADVANCE_THRESHOLD;
        rec
    }
}

/// Result of one assessment submission.
#[derive(Debug, Clone, Serialize)]
pub struct AssessmentOutcome {
    pub assessment: Assessment,
    pub recommendation: Recommendation,
    pub previous_stage: Stage,
    pub advanced: bool,
    pub journey: Journey,
}

/// Summary of the most recent assessment, as shown by the status route.
#[derive(Debug, Clone, Serialize)]
pub struct AssessmentSummary {
    pub assessed_at: DateTime<Utc>,
    pub answer_count: usize,
    pub summary: String,
}

impl AssessmentSummary {
    pub fn from_assessment(a: &Assessment) -> Self {
        let firsts: Vec<&str> = a
            .answers
            .iter()
            .take(5)
            .map(|p| p.answer.as_str())
            .filter(|s| !s.is_empty())
            .collect();
        Self {
            assessed_at: a.assessed_at,
            answer_count: a.answers.len(),
            summary: format!("Assessment at {}: {}", format_ts(a.assessed_at), firsts.join("; ")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CustomerStatus {
    pub customer: Customer,
    pub journey: Option<Journey>,
    pub latest_assessment: Option<AssessmentSummary>,
}

pub fn validate_answers(answers: &[AnswerPair]) -> ApiResult<()> {
    if answers.is_empty() || answers.len() > MAX_ANSWERS {
        return Err(ApiError::InvalidRequest(format!(
            "answers must contain between 1 and {} entries",
            MAX_ANSWERS
        )));
    }
    for (i, pair) in answers.iter().enumerate() {
        if pair.question.trim().is_empty() || pair.answer.trim().is_empty() {
            return Err(ApiError::InvalidRequest(format!(
                "answer {} must have a non-empty question and answer",
                i + 1
            )));
        }
        if pair.question.chars().count() > MAX_ANSWER_CHARS
            || pair.answer.chars().count() > MAX_ANSWER_CHARS
        {
            return Err(ApiError::InvalidRequest(format!(
                "answer {} exceeds {} characters",
                i + 1,
                MAX_ANSWER_CHARS
            )));
        }
    }
    Ok(())
}

fn require_customer(tx: &ScopedTx<'_>, customer_id: &str) -> ApiResult<Customer> {
    tx.get_customer(customer_id)?
        .ok_or_else(|| ApiError::NotFound(format!("customer not found: {}", customer_id)))
}

/// Existing journey, or a fresh Discovery journey (not yet written).
fn journey_or_initial(tx: &ScopedTx<'_>, customer_id: &str, now: DateTime<Utc>) -> ApiResult<(Journey, bool)> {
    match tx.get_journey(customer_id)? {
        Some(j) => Ok((j, false)),
        None => Ok((
            Journey {
                tenant_id: tx.tenant_id().to_string(),
                customer_id: customer_id.to_string(),
                stage: Stage::Discovery,
                tasks_completed: 0,
                last_update: now,
            },
            true,
        )),
    }
}

pub struct JourneyMachine {
    store: DataGateway,
    scorer: Arc<dyn AssessmentScorer>,
}

impl JourneyMachine {
    pub fn new(store: DataGateway, scorer: Arc<dyn AssessmentScorer>) -> Self {
        Self { store, scorer }
    }

    pub fn with_rubric(store: DataGateway) -> Self {
        Self::new(store, Arc::new(RubricScorer))
    }

    /// Count one completed task. Creates the journey at Discovery on first contact.
    pub async fn record_task(&self, scope: &TenantScope, customer_id: &str) -> ApiResult<Journey> {
        let id = customer_id.to_string();
        let journey = self
            .store
            .atomic(scope, move |tx| {
                require_customer(tx, &id)?;
                let now = crate::store::now();
                let (mut journey, _) = journey_or_initial(tx, &id, now)?;
                journey.tasks_completed = journey.tasks_completed.saturating_add(1);
                journey.last_update = now;
                tx.upsert_journey(&journey)?;
                Ok(journey)
            })
            .await?;
        tracing::info!(
            target: "cloudable::journey",
            tenant_id = %scope.tenant_id(),
            customer_id = %customer_id,
            stage = %journey.stage,
            tasks_completed = journey.tasks_completed,
            "task recorded"
        );
        Ok(journey)
    }

    /// Store an assessment and apply its recommendation in the same atomic unit.
    pub async fn submit_assessment(
        &self,
        scope: &TenantScope,
        customer_id: &str,
        answers: Vec<AnswerPair>,
    ) -> ApiResult<AssessmentOutcome> {
        validate_answers(&answers)?;
        let id = customer_id.to_string();
        let scorer = Arc::clone(&self.scorer);

        let outcome = self
            .store
            .atomic(scope, move |tx| {
                require_customer(tx, &id)?;
                let now = crate::store::now();
                let (mut journey, created) = journey_or_initial(tx, &id, now)?;
                let previous_stage = journey.stage;

                let assessment = tx.append_assessment(&id, &answers, now)?;
                let recommendation = scorer.score(previous_stage, &answers);

                let next = if recommendation.advance {
                    previous_stage.next()
                } else {
                    None
                };
                if let Some(next) = next {
                    journey.stage = next;
                    journey.tasks_completed = 0;
                    journey.last_update = now;
                    tx.upsert_journey(&journey)?;
                } else if created {
                    tx.upsert_journey(&journey)?;
                }

                Ok(AssessmentOutcome {
                    assessment,
                    recommendation,
                    previous_stage,
                    advanced: next.is_some(),
                    journey,
                })
            })
            .await?;

        tracing::info!(
            target: "cloudable::journey",
            tenant_id = %scope.tenant_id(),
            customer_id = %customer_id,
            score = outcome.recommendation.score,
            from = %outcome.previous_stage,
            to = %outcome.journey.stage,
            advanced = outcome.advanced,
            "assessment submitted"
        );
        Ok(outcome)
    }

    /// Administrative override; any direction. Resets the task counter when the stage changes.
    pub async fn force_stage(
        &self,
        scope: &TenantScope,
        customer_id: &str,
        target: Stage,
        actor_role: Role,
    ) -> ApiResult<Journey> {
        if !actor_role.is_admin_capable() {
            return Err(ApiError::Unauthorized(format!(
                "role {} cannot override journey stage",
                actor_role.as_str()
            )));
        }
        let id = customer_id.to_string();
        let (journey, from) = self
            .store
            .atomic(scope, move |tx| {
                require_customer(tx, &id)?;
                let now = crate::store::now();
                let (mut journey, _) = journey_or_initial(tx, &id, now)?;
                let from = journey.stage;
                if journey.stage != target {
                    journey.stage = target;
                    journey.tasks_completed = 0;
                }
                journey.last_update = now;
                tx.upsert_journey(&journey)?;
                Ok((journey, from))
            })
            .await?;
        tracing::warn!(
            target: "cloudable::journey",
            tenant_id = %scope.tenant_id(),
            customer_id = %customer_id,
            from = %from,
            to = %journey.stage,
            "journey stage forced"
        );
        Ok(journey)
    }

    /// Read-only; never creates a journey.
    pub async fn get_journey(&self, scope: &TenantScope, customer_id: &str) -> ApiResult<Option<Journey>> {
        self.store.get_journey(scope, customer_id).await
    }

    /// Customer, journey and latest assessment summary from one consistent read.
    pub async fn status(&self, scope: &TenantScope, customer_id: &str) -> ApiResult<CustomerStatus> {
        let id = customer_id.to_string();
        self.store
            .read(scope, move |tx| {
                let customer = require_customer(tx, &id)?;
                let journey = tx.get_journey(&id)?;
                let latest = tx.latest_assessment(&id)?;
                Ok(CustomerStatus {
                    customer,
                    journey,
                    latest_assessment: latest.as_ref().map(AssessmentSummary::from_assessment),
                })
            })
            .await
    }
}
