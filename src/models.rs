//! Core data models.
//!
//! Records that come back from the model (`Analysis`, `Milestone`,
//! `RiskFactor`, the `*Payload` types) deserialize leniently: camelCase
//! aliases are accepted and numbers may arrive as strings. Records that
//! only ever round-trip through our own storage use plain serde.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::elements::{parse_elements, ContractElement};
use crate::parse::lenient;

// ============ Contract record ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractStatus {
    Uploaded,
    Validated,
    Analyzed,
    Failed,
}

impl ContractStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContractStatus::Uploaded => "uploaded",
            ContractStatus::Validated => "validated",
            ContractStatus::Analyzed => "analyzed",
            ContractStatus::Failed => "failed",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            ContractStatus::Uploaded => 0,
            ContractStatus::Validated => 1,
            ContractStatus::Analyzed => 2,
            ContractStatus::Failed => 3,
        }
    }

    /// Forward-only along `uploaded → validated → analyzed`; `failed` is
    /// reachable from any non-failed state and is terminal.
    pub fn can_advance_to(&self, next: ContractStatus) -> bool {
        match (self, next) {
            (ContractStatus::Failed, _) => false,
            (_, ContractStatus::Failed) => true,
            (current, next) => next.rank() > current.rank(),
        }
    }
}

impl fmt::Display for ContractStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContractStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploaded" => Ok(ContractStatus::Uploaded),
            "validated" => Ok(ContractStatus::Validated),
            "analyzed" => Ok(ContractStatus::Analyzed),
            "failed" => Ok(ContractStatus::Failed),
            other => Err(format!("unknown contract status: {}", other)),
        }
    }
}

/// A stored contract and everything the pipeline learned about it.
///
/// The contract summary lives inside [`Analysis::summary`]; a `failed`
/// record keeps whatever analysis and validation it had before failing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractRecord {
    pub id: String,
    pub owner_id: String,
    pub original_filename: String,
    pub mime_type: String,
    pub blob_path: String,
    pub created_at: DateTime<Utc>,
    pub retention_days: u32,
    pub status: ContractStatus,
    pub analysis: Option<Analysis>,
    pub validation: Option<ValidationResult>,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

impl ContractRecord {
    pub fn new(
        owner_id: &str,
        original_filename: &str,
        mime_type: &str,
        blob_path: &str,
        retention_days: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            original_filename: original_filename.to_string(),
            mime_type: mime_type.to_string(),
            blob_path: blob_path.to_string(),
            created_at: Utc::now(),
            retention_days,
            status: ContractStatus::Uploaded,
            analysis: None,
            validation: None,
            failure_reason: None,
        }
    }

    /// Moves to `next` if the state machine allows it. Returns whether the
    /// status changed.
    pub fn advance(&mut self, next: ContractStatus) -> bool {
        if self.status.can_advance_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        if self.advance(ContractStatus::Failed) {
            self.failure_reason = Some(reason.into());
        }
    }

    pub fn summary(&self) -> Option<&ContractSummary> {
        self.analysis.as_ref().map(|a| &a.summary)
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.created_at + Duration::days(i64::from(self.retention_days))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at() <= now
    }
}

/// A file handed to the pipeline.
#[derive(Debug, Clone)]
pub struct ContractUpload {
    pub bytes: Vec<u8>,
    pub filename: String,
    pub mime: String,
    pub size: u64,
}

impl ContractUpload {
    pub fn new(bytes: Vec<u8>, filename: &str, mime: &str) -> Self {
        Self {
            size: bytes.len() as u64,
            bytes,
            filename: filename.to_string(),
            mime: mime.to_string(),
        }
    }
}

// ============ Analysis ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoodsNature {
    Physical,
    Digital,
    Services,
}

impl FromStr for GoodsNature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "physical" | "goods" | "physical goods" => Ok(GoodsNature::Physical),
            "digital" | "software" | "digital goods" => Ok(GoodsNature::Digital),
            "services" | "service" => Ok(GoodsNature::Services),
            other => Err(format!("unknown goods nature: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContractSummary {
    #[serde(default, alias = "buyerName")]
    pub buyer_name: Option<String>,
    #[serde(default, alias = "buyerAddress")]
    pub buyer_address: Option<String>,
    #[serde(default, alias = "buyerCountry")]
    pub buyer_country: Option<String>,
    #[serde(default, alias = "sellerName")]
    pub seller_name: Option<String>,
    #[serde(default, alias = "sellerAddress")]
    pub seller_address: Option<String>,
    #[serde(default, alias = "sellerCountry")]
    pub seller_country: Option<String>,
    #[serde(
        default,
        alias = "goodsNature",
        deserialize_with = "lenient::opt_from_str"
    )]
    pub goods_nature: Option<GoodsNature>,
    #[serde(default, alias = "totalValue", deserialize_with = "lenient::opt_decimal")]
    pub total_value: Option<Decimal>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub jurisdiction: Option<String>,
}

impl ContractSummary {
    pub fn parties(&self) -> Vec<String> {
        [&self.buyer_name, &self.seller_name]
            .into_iter()
            .flatten()
            .filter(|n| !n.trim().is_empty())
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Milestone {
    #[serde(default, alias = "desc")]
    pub description: String,
    #[serde(default, deserialize_with = "lenient::opt_decimal")]
    pub amount: Option<Decimal>,
    #[serde(default, alias = "pct", deserialize_with = "lenient::opt_f64")]
    pub percentage: Option<f64>,
    #[serde(default, alias = "triggerCondition", alias = "trigger")]
    pub trigger_condition: Option<String>,
    /// Position assigned by the milestone sequencer, when it ran.
    #[serde(default)]
    pub sequence: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" | "moderate" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" | "severe" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskParty {
    Buyer,
    Seller,
    #[default]
    Both,
}

impl FromStr for RiskParty {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buyer" => Ok(RiskParty::Buyer),
            "seller" => Ok(RiskParty::Seller),
            "both" | "all" | "mutual" => Ok(RiskParty::Both),
            other => Err(format!("unknown party: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskFactor {
    #[serde(default, rename = "type", alias = "risk_type", alias = "riskType")]
    pub risk_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, deserialize_with = "lenient::from_str_or_default")]
    pub severity: Severity,
    #[serde(default, deserialize_with = "lenient::from_str_or_default")]
    pub party: RiskParty,
    #[serde(default)]
    pub recommendation: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComplianceResult {
    #[serde(default, deserialize_with = "lenient::bool_from_any")]
    pub compliant: bool,
    #[serde(default, deserialize_with = "lenient::string_list")]
    pub issues: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Structured analysis of one contract. `summary` is required in model
/// output; everything else may be absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    #[serde(default, alias = "contractName")]
    pub contract_name: Option<String>,
    pub summary: ContractSummary,
    #[serde(default, alias = "paymentMilestones", alias = "payment_milestones")]
    pub milestones: Vec<Milestone>,
    #[serde(default, alias = "riskFactors", alias = "risk_factors")]
    pub risks: Vec<RiskFactor>,
    #[serde(default, alias = "effectiveDate")]
    pub effective_date: Option<String>,
    #[serde(default, alias = "terminationDate")]
    pub termination_date: Option<String>,
    #[serde(default)]
    pub industries: Vec<String>,
    #[serde(default)]
    pub compliance: Option<ComplianceResult>,
}

// ============ Validation ============

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid_contract: bool,
    #[serde(default)]
    pub reason: Option<String>,
    /// Confidence reported by the model, clamped to `[0, 1]`.
    pub confidence: f64,
    #[serde(default)]
    pub contract_type: Option<String>,
    #[serde(default)]
    pub detected_elements: BTreeSet<ContractElement>,
    #[serde(default)]
    pub missing_elements: BTreeSet<ContractElement>,
}

/// Validation verdict as the model returns it.
#[derive(Debug, Clone, Deserialize)]
pub struct ValidationPayload {
    #[serde(
        alias = "isValidContract",
        alias = "is_valid",
        alias = "isValid",
        deserialize_with = "lenient::bool_from_any"
    )]
    pub is_valid_contract: bool,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default, deserialize_with = "lenient::f64_or_zero")]
    pub confidence: f64,
    #[serde(default, alias = "contractType")]
    pub contract_type: Option<String>,
    #[serde(
        default,
        alias = "detectedElements",
        deserialize_with = "lenient::string_list"
    )]
    pub detected_elements: Vec<String>,
    #[serde(
        default,
        alias = "missingElements",
        deserialize_with = "lenient::string_list"
    )]
    pub missing_elements: Vec<String>,
}

impl ValidationPayload {
    pub fn into_result(self) -> ValidationResult {
        let detected = parse_elements(&self.detected_elements);
        let mut missing = parse_elements(&self.missing_elements);
        missing.retain(|e| !detected.contains(e));
        ValidationResult {
            is_valid_contract: self.is_valid_contract,
            reason: self.reason.filter(|r| !r.trim().is_empty()),
            confidence: clamp_unit(self.confidence),
            contract_type: self.contract_type,
            detected_elements: detected,
            missing_elements: missing,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedElement {
    pub element: ContractElement,
    pub present: bool,
    #[serde(default)]
    pub excerpt: Option<String>,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractElementsResult {
    pub elements: Vec<DetectedElement>,
    /// Overall detection confidence; feeds the `content_quality` factor.
    pub confidence: f64,
}

impl ContractElementsResult {
    pub fn present(&self) -> BTreeSet<ContractElement> {
        self.elements
            .iter()
            .filter(|e| e.present)
            .map(|e| e.element)
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ElementsPayload {
    #[serde(default)]
    pub elements: Vec<ElementPayload>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ElementPayload {
    #[serde(alias = "name", alias = "type")]
    pub element: String,
    #[serde(default = "default_true", deserialize_with = "lenient::bool_from_any")]
    pub present: bool,
    #[serde(default, alias = "text", alias = "evidence")]
    pub excerpt: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub confidence: Option<f64>,
}

fn default_true() -> bool {
    true
}

impl ElementsPayload {
    /// Drops unknown tags; overall confidence defaults to the mean of the
    /// per-element confidences.
    pub fn into_result(self) -> ContractElementsResult {
        let mut seen = BTreeSet::new();
        let mut elements = Vec::new();
        for raw in self.elements {
            let Ok(element) = raw.element.parse::<ContractElement>() else {
                tracing::warn!(tag = %raw.element, "dropping element outside the vocabulary");
                continue;
            };
            if !seen.insert(element) {
                continue;
            }
            elements.push(DetectedElement {
                element,
                present: raw.present,
                excerpt: raw.excerpt,
                confidence: clamp_unit(raw.confidence.unwrap_or(0.5)),
            });
        }
        let confidence = match self.confidence {
            Some(c) => clamp_unit(c),
            None if elements.is_empty() => 0.0,
            None => elements.iter().map(|e| e.confidence).sum::<f64>() / elements.len() as f64,
        };
        ContractElementsResult {
            elements,
            confidence,
        }
    }
}

/// Append-only snapshot of a validation; a new row per version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRecord {
    pub id: String,
    pub contract_id: String,
    pub owner_id: String,
    pub result: ValidationResult,
    pub elements: Option<ContractElementsResult>,
    /// Composite confidence computed from `result` and `elements`.
    pub confidence_score: f64,
    /// Model confidence before any feedback adjustment.
    pub baseline_confidence: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Created,
    FeedbackAdded,
    ConfidenceUpdated,
    Reviewed,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Created => "created",
            AuditAction::FeedbackAdded => "feedback_added",
            AuditAction::ConfidenceUpdated => "confidence_updated",
            AuditAction::Reviewed => "reviewed",
        }
    }
}

impl FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(AuditAction::Created),
            "feedback_added" => Ok(AuditAction::FeedbackAdded),
            "confidence_updated" => Ok(AuditAction::ConfidenceUpdated),
            "reviewed" => Ok(AuditAction::Reviewed),
            other => Err(format!("unknown audit action: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub validation_id: String,
    pub actor_id: String,
    pub action: AuditAction,
    pub previous_version: u32,
    pub current_version: u32,
    pub changes: serde_json::Value,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackType {
    Accuracy,
    Completeness,
    Suggestion,
}

impl FeedbackType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackType::Accuracy => "accuracy",
            FeedbackType::Completeness => "completeness",
            FeedbackType::Suggestion => "suggestion",
        }
    }
}

impl FromStr for FeedbackType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accuracy" => Ok(FeedbackType::Accuracy),
            "completeness" => Ok(FeedbackType::Completeness),
            "suggestion" => Ok(FeedbackType::Suggestion),
            other => Err(format!("unknown feedback type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackEntry {
    pub id: String,
    pub validation_id: String,
    pub actor_id: String,
    pub feedback_type: FeedbackType,
    pub rating: u8,
    pub comment: String,
    pub created_at: DateTime<Utc>,
}

// ============ Knowledge ============

/// One version of a knowledge-base entry. `entry_id` names the logical
/// entry; `id` names this version row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub id: String,
    pub entry_id: String,
    pub title: String,
    pub content: String,
    pub category: String,
    pub tags: BTreeSet<String>,
    pub source: String,
    pub version: u32,
    pub parent_version_id: Option<String>,
    pub is_latest: bool,
    pub created_at: DateTime<Utc>,
}

/// Fields supplied when creating or revising a knowledge entry. A `None`
/// `entry_id` creates a new logical entry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KnowledgeInput {
    #[serde(default)]
    pub entry_id: Option<String>,
    pub title: String,
    pub content: String,
    pub category: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub source: String,
}

impl KnowledgeEntry {
    /// Builds the row that follows `previous` (or the first row when there
    /// is none). The caller is responsible for clearing `is_latest` on
    /// `previous`.
    pub fn next_version(previous: Option<&KnowledgeEntry>, input: KnowledgeInput) -> Self {
        let entry_id = previous
            .map(|p| p.entry_id.clone())
            .or(input.entry_id)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        KnowledgeEntry {
            id: Uuid::new_v4().to_string(),
            entry_id,
            title: input.title,
            content: input.content,
            category: input.category.trim().to_ascii_lowercase(),
            tags: input
                .tags
                .into_iter()
                .map(|t| t.trim().to_ascii_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
            source: input.source,
            version: previous.map(|p| p.version + 1).unwrap_or(1),
            parent_version_id: previous.map(|p| p.id.clone()),
            is_latest: true,
            created_at: Utc::now(),
        }
    }

    /// Number of query terms (3+ chars, case-insensitive) found in the
    /// title, content, category, or tags.
    pub fn match_score(&self, query: &str) -> usize {
        let haystack = format!(
            "{} {} {} {}",
            self.title,
            self.content,
            self.category,
            self.tags.iter().cloned().collect::<Vec<_>>().join(" ")
        )
        .to_lowercase();
        query
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .filter(|t| t.len() >= 3)
            .filter(|t| haystack.contains(t.as_str()))
            .count()
    }
}

// ============ OCR ============

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrResult {
    pub text: String,
    pub confidence: f64,
}

/// Named confidence factors, as returned by
/// [`confidence_factors`](crate::validation::confidence_factors).
pub type ConfidenceFactors = BTreeMap<&'static str, f64>;

pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
