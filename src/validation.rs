//! Contract validity verdicts, element detection, composite confidence,
//! and feedback-driven confidence adjustment with an audit trail.
//!
//! # Composite confidence
//!
//! | Factor | Weight | Source |
//! |--------|--------|--------|
//! | `llm_confidence` | 0.40 | confidence reported with the verdict |
//! | `element_completeness` | 0.30 | share of the six required elements detected |
//! | `contract_structure` | 0.20 | `max(0, 1 - 0.1 * missing)` |
//! | `content_quality` | 0.10 | element-detection confidence, else 0.70 |
//!
//! The score is the weighted mean, clamped to `[0, 1]`.
//!
//! # Feedback
//!
//! The mean of all `accuracy` ratings `r` shifts the verdict confidence by
//! `(r - 3) * 0.1` from its baseline (the model's original value). Each
//! change appends a new [`ValidationRecord`] version and a
//! `confidence_updated` audit entry. Because the shift is always taken from
//! the baseline, re-running with no new feedback changes nothing.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::elements::REQUIRED_ELEMENTS;
use crate::error::{InputProblem, PipelineError, PipelineResult, Stage};
use crate::llm::ChatRequest;
use crate::models::{
    clamp_unit, AuditAction, AuditEntry, ConfidenceFactors, ContractElementsResult,
    ElementsPayload, FeedbackEntry, FeedbackType, ValidationPayload, ValidationRecord,
    ValidationResult,
};
use crate::prompts;
use crate::store::{guarded, AuditStore, ContractStore, FeedbackStore, Stores, ValidationRecordStore};
use crate::structured::StructuredClient;

pub const WEIGHT_LLM: f64 = 0.40;
pub const WEIGHT_COMPLETENESS: f64 = 0.30;
pub const WEIGHT_STRUCTURE: f64 = 0.20;
pub const WEIGHT_QUALITY: f64 = 0.10;

/// `content_quality` when no element detection ran.
pub const DEFAULT_CONTENT_QUALITY: f64 = 0.70;

/// Confidence shift per rating point away from the neutral rating of 3.
const FEEDBACK_STEP: f64 = 0.1;

const EPSILON: f64 = 1e-9;

pub fn confidence_factors(
    result: &ValidationResult,
    elements: Option<&ContractElementsResult>,
) -> ConfidenceFactors {
    let required_present = REQUIRED_ELEMENTS
        .iter()
        .filter(|e| result.detected_elements.contains(*e))
        .count();
    let completeness = required_present as f64 / REQUIRED_ELEMENTS.len() as f64;
    let structure = (1.0 - 0.1 * result.missing_elements.len() as f64).max(0.0);
    let quality = elements
        .map(|e| e.confidence)
        .unwrap_or(DEFAULT_CONTENT_QUALITY);

    let mut factors = ConfidenceFactors::new();
    factors.insert("llm_confidence", clamp_unit(result.confidence));
    factors.insert("element_completeness", clamp_unit(completeness));
    factors.insert("contract_structure", clamp_unit(structure));
    factors.insert("content_quality", clamp_unit(quality));
    factors
}

fn weight_of(factor: &str) -> f64 {
    match factor {
        "llm_confidence" => WEIGHT_LLM,
        "element_completeness" => WEIGHT_COMPLETENESS,
        "contract_structure" => WEIGHT_STRUCTURE,
        "content_quality" => WEIGHT_QUALITY,
        _ => 0.0,
    }
}

pub fn confidence_score(
    result: &ValidationResult,
    elements: Option<&ContractElementsResult>,
) -> f64 {
    let factors = confidence_factors(result, elements);
    let (weighted, total) = factors
        .iter()
        .fold((0.0, 0.0), |(sum, weights), (name, value)| {
            let w = weight_of(name);
            (sum + w * value, weights + w)
        });
    if total <= 0.0 {
        return 0.0;
    }
    clamp_unit(weighted / total)
}

/// Confidence after applying the mean accuracy rating to `baseline`.
pub fn adjusted_confidence(baseline: f64, accuracy_ratings: &[u8]) -> f64 {
    if accuracy_ratings.is_empty() {
        return clamp_unit(baseline);
    }
    let mean = accuracy_ratings.iter().map(|r| f64::from(*r)).sum::<f64>()
        / accuracy_ratings.len() as f64;
    clamp_unit(baseline + (mean - 3.0) * FEEDBACK_STEP)
}

#[derive(Clone)]
pub struct ValidationEngine {
    llm: StructuredClient,
    model: String,
    contracts: Arc<dyn ContractStore>,
    validations: Arc<dyn ValidationRecordStore>,
    audit: Arc<dyn AuditStore>,
    feedback: Arc<dyn FeedbackStore>,
}

impl ValidationEngine {
    pub fn new(llm: StructuredClient, model: &str, stores: &Stores) -> Self {
        Self {
            llm,
            model: model.to_string(),
            contracts: stores.contracts.clone(),
            validations: stores.validations.clone(),
            audit: stores.audit.clone(),
            feedback: stores.feedback.clone(),
        }
    }

    pub async fn validate(
        &self,
        cancel: &CancellationToken,
        text: &str,
    ) -> PipelineResult<ValidationResult> {
        let request = ChatRequest::json(&self.model, prompts::validation(text));
        let payload: ValidationPayload = self
            .llm
            .request(cancel, request, Stage::Validation)
            .await?;
        let result = payload.into_result();
        tracing::info!(
            valid = result.is_valid_contract,
            confidence = result.confidence,
            detected = result.detected_elements.len(),
            "validation verdict"
        );
        Ok(result)
    }

    pub async fn detect_elements(
        &self,
        cancel: &CancellationToken,
        text: &str,
    ) -> PipelineResult<ContractElementsResult> {
        let request = ChatRequest::json(&self.model, prompts::element_detection(text));
        let payload: ElementsPayload = self.llm.request(cancel, request, Stage::Elements).await?;
        Ok(payload.into_result())
    }

    /// Writes version 1 of a new validation plus its `created` audit entry.
    pub async fn store(
        &self,
        cancel: &CancellationToken,
        contract_id: &str,
        owner_id: &str,
        result: ValidationResult,
        elements: Option<ContractElementsResult>,
    ) -> PipelineResult<ValidationRecord> {
        let now = Utc::now();
        let record = ValidationRecord {
            id: Uuid::new_v4().to_string(),
            contract_id: contract_id.to_string(),
            owner_id: owner_id.to_string(),
            confidence_score: confidence_score(&result, elements.as_ref()),
            baseline_confidence: result.confidence,
            result,
            elements,
            created_at: now,
            updated_at: now,
            version: 1,
        };
        guarded(
            cancel,
            Stage::Store,
            self.validations.append_validation(&record),
        )
        .await?;

        self.write_audit(
            cancel,
            AuditEntry {
                id: Uuid::new_v4().to_string(),
                validation_id: record.id.clone(),
                actor_id: owner_id.to_string(),
                action: AuditAction::Created,
                previous_version: 0,
                current_version: 1,
                changes: json!({
                    "is_valid_contract": record.result.is_valid_contract,
                    "confidence_score": record.confidence_score,
                }),
                reason: None,
                created_at: now,
            },
        )
        .await;

        tracing::debug!(
            contract_id,
            validation_id = %record.id,
            score = record.confidence_score,
            "stored validation"
        );
        Ok(record)
    }

    pub async fn add_feedback(
        &self,
        cancel: &CancellationToken,
        validation_id: &str,
        actor_id: &str,
        feedback_type: FeedbackType,
        rating: u8,
        comment: &str,
    ) -> PipelineResult<()> {
        if !(1..=5).contains(&rating) {
            return Err(PipelineError::input(
                InputProblem::Invalid,
                format!("rating must be between 1 and 5, got {}", rating),
            ));
        }
        let current = self.latest(cancel, validation_id, Stage::Feedback).await?;

        let entry = FeedbackEntry {
            id: Uuid::new_v4().to_string(),
            validation_id: validation_id.to_string(),
            actor_id: actor_id.to_string(),
            feedback_type,
            rating,
            comment: comment.to_string(),
            created_at: Utc::now(),
        };
        guarded(cancel, Stage::Feedback, self.feedback.add_feedback(&entry)).await?;

        self.write_audit(
            cancel,
            AuditEntry {
                id: Uuid::new_v4().to_string(),
                validation_id: validation_id.to_string(),
                actor_id: actor_id.to_string(),
                action: AuditAction::FeedbackAdded,
                previous_version: current.version,
                current_version: current.version,
                changes: json!({
                    "feedback_type": feedback_type.as_str(),
                    "rating": rating,
                }),
                reason: Some(comment.to_string()).filter(|c| !c.trim().is_empty()),
                created_at: entry.created_at,
            },
        )
        .await;
        Ok(())
    }

    /// Re-derives the verdict confidence from all accuracy feedback. Returns
    /// the new version when the confidence changed, `None` otherwise.
    pub async fn update_confidence_from_feedback(
        &self,
        cancel: &CancellationToken,
        validation_id: &str,
        actor_id: &str,
    ) -> PipelineResult<Option<ValidationRecord>> {
        let current = self.latest(cancel, validation_id, Stage::Feedback).await?;
        let ratings: Vec<u8> = guarded(
            cancel,
            Stage::Feedback,
            self.feedback.feedback_for(validation_id),
        )
        .await?
        .into_iter()
        .filter(|f| f.feedback_type == FeedbackType::Accuracy)
        .map(|f| f.rating)
        .collect();

        let before = current.result.confidence;
        let after = adjusted_confidence(current.baseline_confidence, &ratings);
        if (after - before).abs() < EPSILON {
            tracing::debug!(validation_id, confidence = before, "confidence unchanged");
            return Ok(None);
        }

        let mut result = current.result.clone();
        result.confidence = after;
        let next = ValidationRecord {
            confidence_score: confidence_score(&result, current.elements.as_ref()),
            result,
            updated_at: Utc::now(),
            version: current.version + 1,
            ..current.clone()
        };
        guarded(cancel, Stage::Feedback, self.validations.append_validation(&next)).await?;

        self.write_audit(
            cancel,
            AuditEntry {
                id: Uuid::new_v4().to_string(),
                validation_id: validation_id.to_string(),
                actor_id: actor_id.to_string(),
                action: AuditAction::ConfidenceUpdated,
                previous_version: current.version,
                current_version: next.version,
                changes: json!({ "before": before, "after": after, "n": ratings.len() }),
                reason: Some("accuracy feedback".to_string()),
                created_at: next.updated_at,
            },
        )
        .await;

        self.sync_contract(cancel, &next).await;
        tracing::info!(
            validation_id,
            before,
            after,
            version = next.version,
            "confidence updated from feedback"
        );
        Ok(Some(next))
    }

    pub async fn audit_trail(
        &self,
        cancel: &CancellationToken,
        validation_id: &str,
    ) -> PipelineResult<Vec<AuditEntry>> {
        guarded(cancel, Stage::Lookup, self.audit.audit_for(validation_id)).await
    }

    pub async fn latest_for_contract(
        &self,
        cancel: &CancellationToken,
        contract_id: &str,
    ) -> PipelineResult<Option<ValidationRecord>> {
        guarded(
            cancel,
            Stage::Lookup,
            self.validations.latest_for_contract(contract_id),
        )
        .await
    }

    async fn latest(
        &self,
        cancel: &CancellationToken,
        validation_id: &str,
        stage: Stage,
    ) -> PipelineResult<ValidationRecord> {
        guarded(cancel, stage, self.validations.latest_validation(validation_id))
            .await?
            .ok_or_else(|| {
                PipelineError::not_found(stage, format!("validation {} not found", validation_id))
            })
    }

    async fn write_audit(&self, cancel: &CancellationToken, entry: AuditEntry) {
        if let Err(e) = guarded(cancel, Stage::Store, self.audit.append_audit(&entry)).await {
            tracing::warn!(
                validation_id = %entry.validation_id,
                action = entry.action.as_str(),
                error = %e,
                "audit write failed"
            );
        }
    }

    /// Mirrors the new verdict into the contract's embedded validation.
    async fn sync_contract(&self, cancel: &CancellationToken, record: &ValidationRecord) {
        let contract = match guarded(
            cancel,
            Stage::Store,
            self.contracts.get_contract(&record.contract_id),
        )
        .await
        {
            Ok(Some(contract)) => contract,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(contract_id = %record.contract_id, error = %e, "cannot load contract");
                return;
            }
        };
        let mut contract = contract;
        contract.validation = Some(record.result.clone());
        if let Err(e) = guarded(cancel, Stage::Store, self.contracts.update_contract(&contract)).await
        {
            tracing::warn!(contract_id = %record.contract_id, error = %e, "cannot update contract");
        }
    }
}
