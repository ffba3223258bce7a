//! The analysis pipeline.
//!
//! `analyze` runs an upload through these steps:
//!
//! 1. **Input gate.** Size and MIME checks, before anything external runs.
//! 2. **Persist.** Blob saved, contract record inserted as `uploaded`.
//! 3. **Extract.** PDFs try direct text first. Scans are rasterized and
//!    sent as one multimodal request; if that fails the pages are OCR'd
//!    (bounded fan-out, joined in page order, through the OCR cache).
//!    Images go straight to OCR. DOCX and plain text are decoded. When
//!    nothing yields text, the head of the file is used as a probe.
//! 4. **Validate.** A negative verdict stops here with status `validated`.
//! 5. **Analyze.** Structured analysis, milestone normalization, then the
//!    advisory steps (industry, risk, compliance, sequencing), none of
//!    which can fail the run.
//! 6. **Store.** Validation record written, contract marked `analyzed`.
//!
//! Hard failures after step 2 mark the record `failed`. Cancellation
//! aborts at the next suspension point and leaves the record untouched.

use futures::future::join_all;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::blob::BlobStore;
use crate::config::Config;
use crate::error::{ErrorKind, InputProblem, PipelineError, PipelineResult, Stage};
use crate::extract::{self, DocumentKind, MIME_JPEG};
use crate::knowledge::KnowledgeLookup;
use crate::llm::ChatRequest;
use crate::metrics::Metrics;
use crate::models::{
    Analysis, ComplianceResult, ContractElementsResult, ContractRecord, ContractStatus,
    ContractUpload, Milestone, RiskFactor, ValidationPayload, ValidationResult,
};
use crate::ocr::{data_url, OcrEngine, OcrError};
use crate::ocr_cache::OcrCache;
use crate::parse::lenient;
use crate::pdf_text::PdfTextExtractor;
use crate::prompts;
use crate::rasterize::Rasterizer;
use crate::store::{guarded, ContractStore, Stores};
use crate::structured::StructuredClient;
use crate::validation::ValidationEngine;

/// Verdict confidence assumed when a multimodal answer omits its
/// validation block.
const UNREPORTED_VALIDATION_CONFIDENCE: f64 = 0.5;

/// Percentage sums within this distance of 100 are left alone.
const PERCENT_TOLERANCE: f64 = 1.0;

const INDUSTRY_FALLBACK: &str = "general";

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub max_file_size: u64,
    pub max_pages: u32,
    pub ocr_concurrency: usize,
    pub text_probe_bytes: usize,
    pub sequence_milestones: bool,
    pub analysis_model: String,
    pub vision_model: String,
    pub retention_days: u32,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_file_size: config.pipeline.max_file_size,
            max_pages: config.pipeline.max_pages,
            ocr_concurrency: config.pipeline.ocr_concurrency.max(1),
            text_probe_bytes: config.pipeline.text_probe_bytes,
            sequence_milestones: config.pipeline.sequence_milestones,
            analysis_model: config.analysis_model(),
            vision_model: config.vision_model(),
            retention_days: config.storage.retention_days,
        }
    }
}

/// Everything the orchestrator talks to.
pub struct PipelineParts {
    pub blobs: Arc<dyn BlobStore>,
    pub stores: Stores,
    pub llm: StructuredClient,
    pub ocr: OcrEngine,
    pub ocr_cache: OcrCache,
    pub rasterizer: Rasterizer,
    pub pdf_text: PdfTextExtractor,
    pub knowledge: KnowledgeLookup,
    pub metrics: Arc<Metrics>,
}

/// Result of running the pipeline without persisting anything.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub validation: ValidationResult,
    pub confidence_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elements: Option<ContractElementsResult>,
    /// Absent when the document is not a contract.
    pub analysis: Option<Analysis>,
}

/// What extraction produced.
enum Content {
    Text(String),
    /// The multimodal request already answered both validation and
    /// analysis. `text` is the model's transcript of the pages, or the
    /// analysis itself when no transcript came back.
    Multimodal {
        validation: ValidationResult,
        analysis: Analysis,
        text: String,
    },
}

struct Evaluation {
    validation: ValidationResult,
    elements: Option<ContractElementsResult>,
    analysis: Option<Analysis>,
}

#[derive(Deserialize)]
struct MultimodalPayload {
    #[serde(flatten)]
    analysis: Analysis,
    #[serde(default)]
    transcript: Option<String>,
    #[serde(default)]
    validation: Option<ValidationPayload>,
}

#[derive(Deserialize)]
struct RiskPayload {
    #[serde(default, alias = "riskFactors", alias = "risk_factors")]
    risks: Vec<RiskFactor>,
}

#[derive(Deserialize)]
struct IndustryPayload {
    #[serde(default, deserialize_with = "lenient::string_list")]
    industries: Vec<String>,
}

#[derive(Deserialize)]
struct SequencePayload {
    #[serde(default)]
    order: Vec<usize>,
}

pub struct AnalysisOrchestrator {
    settings: PipelineSettings,
    blobs: Arc<dyn BlobStore>,
    contracts: Arc<dyn ContractStore>,
    llm: StructuredClient,
    ocr: OcrEngine,
    ocr_cache: OcrCache,
    rasterizer: Rasterizer,
    pdf_text: PdfTextExtractor,
    knowledge: KnowledgeLookup,
    validation: ValidationEngine,
    metrics: Arc<Metrics>,
}

impl AnalysisOrchestrator {
    pub fn new(settings: PipelineSettings, parts: PipelineParts) -> Self {
        let validation =
            ValidationEngine::new(parts.llm.clone(), &settings.analysis_model, &parts.stores);
        Self {
            settings,
            blobs: parts.blobs,
            contracts: parts.stores.contracts,
            llm: parts.llm,
            ocr: parts.ocr,
            ocr_cache: parts.ocr_cache,
            rasterizer: parts.rasterizer,
            pdf_text: parts.pdf_text,
            knowledge: parts.knowledge,
            validation,
            metrics: parts.metrics,
        }
    }

    pub fn validation(&self) -> &ValidationEngine {
        &self.validation
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Size, emptiness and type gate. Returns the kind and the effective
    /// MIME type (guessed from the filename for generic uploads).
    pub fn check_input(&self, upload: &ContractUpload) -> PipelineResult<(DocumentKind, String)> {
        if upload.size > self.settings.max_file_size {
            return Err(PipelineError::input(
                InputProblem::TooLarge,
                format!(
                    "file is {} bytes, limit is {}",
                    upload.size, self.settings.max_file_size
                ),
            ));
        }
        if upload.bytes.is_empty() {
            return Err(PipelineError::input(InputProblem::Empty, "file is empty"));
        }
        let mime = match DocumentKind::from_mime(&upload.mime) {
            Some(_) => upload.mime.clone(),
            None if is_generic_mime(&upload.mime) => extract::mime_from_filename(&upload.filename)
                .map(str::to_string)
                .unwrap_or_else(|| upload.mime.clone()),
            None => upload.mime.clone(),
        };
        match DocumentKind::from_mime(&mime) {
            Some(kind) => Ok((kind, mime)),
            None => Err(PipelineError::input(
                InputProblem::UnsupportedType,
                format!("unsupported file type: {}", upload.mime),
            )),
        }
    }

    /// Stores the upload without analyzing it.
    pub async fn upload(
        &self,
        cancel: &CancellationToken,
        owner_id: &str,
        upload: &ContractUpload,
    ) -> PipelineResult<ContractRecord> {
        let (_, mime) = self.check_input(upload).inspect_err(|_| self.count("rejected"))?;
        self.persist(cancel, owner_id, upload, &mime).await
    }

    pub async fn analyze(
        &self,
        cancel: &CancellationToken,
        owner_id: &str,
        upload: &ContractUpload,
    ) -> PipelineResult<ContractRecord> {
        let (kind, mime) = self.check_input(upload).inspect_err(|_| self.count("rejected"))?;
        let mut record = self.persist(cancel, owner_id, upload, &mime).await?;
        tracing::info!(
            contract_id = %record.id,
            filename = %upload.filename,
            mime = %mime,
            size = upload.size,
            "analyzing contract"
        );

        let evaluated = match self.extract(cancel, kind, &mime, &upload.bytes).await {
            Ok(content) => self.evaluate(cancel, content).await,
            Err(e) => Err(e),
        };
        let evaluation = match evaluated {
            Ok(evaluation) => evaluation,
            Err(e) => return Err(self.fail(cancel, &mut record, e).await),
        };

        match self.finish(cancel, &mut record, evaluation).await {
            Ok(()) => Ok(record),
            Err(e) => Err(self.fail(cancel, &mut record, e).await),
        }
    }

    /// Runs the pipeline on an upload without storing anything.
    pub async fn analyze_ephemeral(
        &self,
        cancel: &CancellationToken,
        upload: &ContractUpload,
    ) -> PipelineResult<AnalysisReport> {
        let (kind, mime) = self.check_input(upload).inspect_err(|_| self.count("rejected"))?;
        let result = match self.extract(cancel, kind, &mime, &upload.bytes).await {
            Ok(content) => self.evaluate(cancel, content).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(evaluation) => {
                self.count(if evaluation.analysis.is_some() {
                    "analyzed"
                } else {
                    "not_contract"
                });
                Ok(AnalysisReport {
                    confidence_score: crate::validation::confidence_score(
                        &evaluation.validation,
                        evaluation.elements.as_ref(),
                    ),
                    validation: evaluation.validation,
                    elements: evaluation.elements,
                    analysis: evaluation.analysis,
                })
            }
            Err(e) => {
                self.count(if e.is_canceled() { "canceled" } else { "failed" });
                Err(e)
            }
        }
    }

    /// Structured analysis of already-extracted text. No validation step,
    /// nothing persisted.
    pub async fn analyze_text(
        &self,
        cancel: &CancellationToken,
        text: &str,
    ) -> PipelineResult<Analysis> {
        if text.trim().is_empty() {
            return Err(PipelineError::input(InputProblem::Empty, "text is empty"));
        }
        let mut analysis = self.analysis_for(cancel, text).await?;
        self.enrich(cancel, &mut analysis, text).await?;
        Ok(analysis)
    }

    pub async fn contract(
        &self,
        cancel: &CancellationToken,
        id: &str,
    ) -> PipelineResult<ContractRecord> {
        guarded(cancel, Stage::Lookup, self.contracts.get_contract(id))
            .await?
            .ok_or_else(|| PipelineError::not_found(Stage::Lookup, format!("contract {} not found", id)))
    }

    /// Deletes the record, then its blob. A blob that cannot be removed is
    /// logged; the record is already gone.
    pub async fn delete(&self, cancel: &CancellationToken, record: &ContractRecord) -> PipelineResult<()> {
        let removed = guarded(cancel, Stage::Store, self.contracts.delete_contract(&record.id)).await?;
        if !removed {
            return Err(PipelineError::not_found(
                Stage::Store,
                format!("contract {} not found", record.id),
            ));
        }
        if let Err(e) = self.blobs.delete(&record.blob_path).await {
            tracing::warn!(contract_id = %record.id, error = %e, "blob delete failed");
        }
        tracing::info!(contract_id = %record.id, "contract deleted");
        Ok(())
    }

    async fn persist(
        &self,
        cancel: &CancellationToken,
        owner_id: &str,
        upload: &ContractUpload,
        mime: &str,
    ) -> PipelineResult<ContractRecord> {
        if cancel.is_cancelled() {
            return Err(PipelineError::canceled(Stage::Persist));
        }
        let blob_path = self
            .blobs
            .save(owner_id, &upload.filename, &upload.bytes)
            .await
            .map_err(|e| PipelineError::storage(Stage::Persist, e))?;
        let record = ContractRecord::new(
            owner_id,
            &upload.filename,
            mime,
            &blob_path,
            self.settings.retention_days,
        );
        guarded(cancel, Stage::Persist, self.contracts.insert_contract(&record)).await?;
        Ok(record)
    }

    async fn extract(
        &self,
        cancel: &CancellationToken,
        kind: DocumentKind,
        mime: &str,
        bytes: &[u8],
    ) -> PipelineResult<Content> {
        let text = match kind {
            DocumentKind::Text => extract::decode_text(bytes),
            DocumentKind::Docx => match extract::extract_docx(bytes) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(error = %e, "DOCX extraction failed, using text probe");
                    String::new()
                }
            },
            DocumentKind::Image => {
                let pages = [bytes.to_vec()];
                self.ocr_pages(cancel, &pages, mime).await?
            }
            DocumentKind::Pdf => {
                let direct = self.pdf_text.try_extract_bytes(bytes.to_vec()).await;
                if direct.usable {
                    tracing::debug!(chars = direct.text.len(), "using embedded PDF text");
                    direct.text
                } else {
                    match self.scanned_pdf(cancel, bytes).await? {
                        Some(content @ Content::Multimodal { .. }) => return Ok(content),
                        Some(Content::Text(text)) => text,
                        None => String::new(),
                    }
                }
            }
        };
        if cancel.is_cancelled() {
            return Err(PipelineError::canceled(Stage::Extract));
        }

        if !text.trim().is_empty() {
            return Ok(Content::Text(text));
        }
        let probe = extract::text_probe(bytes, self.settings.text_probe_bytes);
        if probe.trim().is_empty() {
            return Err(PipelineError::new(
                Stage::Extract,
                ErrorKind::Input(InputProblem::Empty),
                "no text could be extracted from the document",
            ));
        }
        tracing::warn!(chars = probe.len(), "no extracted text, falling back to text probe");
        Ok(Content::Text(probe))
    }

    /// Rasterizes a scanned PDF, then tries multimodal analysis and falls
    /// back to per-page OCR. `None` when no page images could be produced.
    async fn scanned_pdf(
        &self,
        cancel: &CancellationToken,
        bytes: &[u8],
    ) -> PipelineResult<Option<Content>> {
        let pdf = tempfile::Builder::new()
            .prefix("clens-upload-")
            .suffix(".pdf")
            .tempfile()
            .map_err(|e| PipelineError::storage(Stage::Extract, e.into()))?;
        tokio::fs::write(pdf.path(), bytes)
            .await
            .map_err(|e| PipelineError::storage(Stage::Extract, e.into()))?;

        let rasterized = match self
            .rasterizer
            .rasterize(cancel, pdf.path(), self.settings.max_pages)
            .await
        {
            Ok(pages) => pages,
            Err(crate::rasterize::RasterError::Canceled) => {
                return Err(PipelineError::canceled(Stage::Extract))
            }
            Err(e) => {
                tracing::warn!(error = %e, "rasterization failed");
                return Ok(None);
            }
        };

        let mut pages = Vec::with_capacity(rasterized.len());
        for path in &rasterized.pages {
            match tokio::fs::read(path).await {
                Ok(page) => pages.push(page),
                Err(e) => tracing::warn!(page = %path.display(), error = %e, "unreadable page image"),
            }
        }
        // Page images are no longer needed on disk.
        drop(rasterized);
        if pages.is_empty() {
            return Ok(None);
        }

        match self.multimodal(cancel, &pages).await {
            Ok(content) => return Ok(Some(content)),
            Err(e) if e.is_canceled() => return Err(e),
            Err(e) => tracing::warn!(error = %e, "multimodal analysis failed, falling back to OCR"),
        }

        let text = self.ocr_pages(cancel, &pages, MIME_JPEG).await?;
        Ok(Some(Content::Text(text)))
    }

    async fn multimodal(
        &self,
        cancel: &CancellationToken,
        pages: &[Vec<u8>],
    ) -> PipelineResult<Content> {
        let images = pages.iter().map(|p| data_url(p, MIME_JPEG)).collect();
        let request = ChatRequest::multimodal(
            &self.settings.vision_model,
            prompts::multimodal_contract_analysis(),
            images,
        );
        let payload: MultimodalPayload = self.llm.request(cancel, request, Stage::Analysis).await?;
        let validation = match payload.validation {
            Some(v) => v.into_result(),
            None => ValidationResult {
                is_valid_contract: true,
                reason: Some("no validation returned with multimodal analysis".to_string()),
                confidence: UNREPORTED_VALIDATION_CONFIDENCE,
                contract_type: None,
                detected_elements: Default::default(),
                missing_elements: Default::default(),
            },
        };
        let text = match payload.transcript.filter(|t| !t.trim().is_empty()) {
            Some(transcript) => transcript,
            None => {
                tracing::debug!("no transcript in multimodal answer, using the analysis as text");
                serde_json::to_string_pretty(&payload.analysis).unwrap_or_default()
            }
        };
        tracing::info!(pages = pages.len(), "multimodal analysis succeeded");
        Ok(Content::Multimodal {
            validation,
            analysis: payload.analysis,
            text,
        })
    }

    /// OCRs page images with bounded concurrency. Results are joined in
    /// page order; failed pages are skipped. Empty when no page succeeds.
    async fn ocr_pages(
        &self,
        cancel: &CancellationToken,
        pages: &[Vec<u8>],
        mime: &str,
    ) -> PipelineResult<String> {
        let semaphore = Semaphore::new(self.settings.ocr_concurrency);
        let semaphore = &semaphore;
        let tasks = pages.iter().enumerate().map(|(idx, page)| async move {
            let _permit = semaphore.acquire().await;
            let result = self
                .ocr_cache
                .extract_cached(cancel, &self.ocr, page, mime)
                .await;
            (idx, result)
        });

        let mut texts = Vec::new();
        for (idx, result) in join_all(tasks).await {
            match result {
                Ok(ocr) => texts.push(ocr.text),
                Err(OcrError::Canceled) => return Err(PipelineError::canceled(Stage::Ocr)),
                Err(e) => tracing::warn!(page = idx + 1, error = %e, "page OCR failed"),
            }
        }
        tracing::debug!(pages = pages.len(), succeeded = texts.len(), "OCR complete");
        Ok(texts.join("\n\n"))
    }

    /// Validation, element detection and analysis for extracted content.
    async fn evaluate(
        &self,
        cancel: &CancellationToken,
        content: Content,
    ) -> PipelineResult<Evaluation> {
        match content {
            Content::Multimodal {
                validation,
                mut analysis,
                text,
            } => {
                if !validation.is_valid_contract {
                    return Ok(Evaluation {
                        validation,
                        elements: None,
                        analysis: None,
                    });
                }
                let elements = self.detect_elements(cancel, &text).await?;
                normalize_milestones(&mut analysis);
                self.enrich(cancel, &mut analysis, &text).await?;
                Ok(Evaluation {
                    validation,
                    elements,
                    analysis: Some(analysis),
                })
            }
            Content::Text(text) => {
                let validation = self.validation.validate(cancel, &text).await?;
                if !validation.is_valid_contract {
                    return Ok(Evaluation {
                        validation,
                        elements: None,
                        analysis: None,
                    });
                }
                let elements = self.detect_elements(cancel, &text).await?;
                let mut analysis = self.analysis_for(cancel, &text).await?;
                self.enrich(cancel, &mut analysis, &text).await?;
                Ok(Evaluation {
                    validation,
                    elements,
                    analysis: Some(analysis),
                })
            }
        }
    }

    /// Advisory: a failed detection leaves the record without elements.
    async fn detect_elements(
        &self,
        cancel: &CancellationToken,
        text: &str,
    ) -> PipelineResult<Option<ContractElementsResult>> {
        match self.validation.detect_elements(cancel, text).await {
            Ok(elements) => Ok(Some(elements)),
            Err(e) if e.is_canceled() => Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "element detection failed");
                Ok(None)
            }
        }
    }

    async fn analysis_for(&self, cancel: &CancellationToken, text: &str) -> PipelineResult<Analysis> {
        let request = ChatRequest::json(&self.settings.analysis_model, prompts::contract_analysis(text));
        let mut analysis: Analysis = self.llm.request(cancel, request, Stage::Analysis).await?;
        normalize_milestones(&mut analysis);
        Ok(analysis)
    }

    /// Advisory steps. Only cancellation escapes; every other failure is
    /// logged and leaves the analysis as it was.
    async fn enrich(
        &self,
        cancel: &CancellationToken,
        analysis: &mut Analysis,
        text: &str,
    ) -> PipelineResult<()> {
        let model = self.settings.analysis_model.as_str();

        if analysis.industries.is_empty() {
            let request = ChatRequest::json(model, prompts::industry_classification(text));
            analysis.industries = match self
                .llm
                .request::<IndustryPayload>(cancel, request, Stage::Risk)
                .await
            {
                Ok(payload) => payload.industries,
                Err(e) if e.is_canceled() => return Err(e),
                Err(e) => {
                    tracing::warn!(error = %e, "industry classification failed");
                    Vec::new()
                }
            };
        }
        analysis.industries = clean_industries(std::mem::take(&mut analysis.industries));

        let standards = self.knowledge.standards_for(cancel, &analysis.industries).await;
        let request = ChatRequest::json(model, prompts::risk_assessment(text, &standards));
        match self
            .llm
            .request::<RiskPayload>(cancel, request, Stage::Risk)
            .await
        {
            Ok(payload) => analysis.risks = payload.risks,
            Err(e) if e.is_canceled() => return Err(e),
            Err(e) => tracing::warn!(error = %e, "risk assessment failed"),
        }

        if let Some(jurisdiction) = analysis
            .summary
            .jurisdiction
            .clone()
            .filter(|j| !j.trim().is_empty())
        {
            let request = ChatRequest::json(model, prompts::compliance(text, &jurisdiction));
            analysis.compliance = match self
                .llm
                .request::<ComplianceResult>(cancel, request, Stage::Risk)
                .await
            {
                Ok(result) => Some(result),
                Err(e) if e.is_canceled() => return Err(e),
                Err(e) => {
                    tracing::warn!(error = %e, %jurisdiction, "compliance check failed");
                    None
                }
            };
        }

        if self.settings.sequence_milestones && analysis.milestones.len() > 1 {
            let request =
                ChatRequest::json(model, prompts::milestone_sequencing(&analysis.milestones));
            match self
                .llm
                .request::<SequencePayload>(cancel, request, Stage::Analysis)
                .await
            {
                Ok(payload) => {
                    if !apply_sequence(&mut analysis.milestones, &payload.order) {
                        tracing::warn!(order = ?payload.order, "ignoring invalid milestone order");
                    }
                }
                Err(e) if e.is_canceled() => return Err(e),
                Err(e) => tracing::warn!(error = %e, "milestone sequencing failed"),
            }
        }
        Ok(())
    }

    async fn finish(
        &self,
        cancel: &CancellationToken,
        record: &mut ContractRecord,
        evaluation: Evaluation,
    ) -> PipelineResult<()> {
        let stored = self
            .validation
            .store(
                cancel,
                &record.id,
                &record.owner_id,
                evaluation.validation.clone(),
                evaluation.elements,
            )
            .await?;

        record.validation = Some(evaluation.validation);
        record.advance(ContractStatus::Validated);
        let outcome = match evaluation.analysis {
            Some(analysis) => {
                record.analysis = Some(analysis);
                record.advance(ContractStatus::Analyzed);
                "analyzed"
            }
            None => "not_contract",
        };
        guarded(cancel, Stage::Store, self.contracts.update_contract(record)).await?;

        self.count(outcome);
        tracing::info!(
            contract_id = %record.id,
            validation_id = %stored.id,
            status = %record.status,
            confidence = stored.confidence_score,
            "pipeline finished"
        );
        Ok(())
    }

    /// Records a hard failure on the contract (unless canceled) and hands
    /// the error back.
    async fn fail(
        &self,
        cancel: &CancellationToken,
        record: &mut ContractRecord,
        err: PipelineError,
    ) -> PipelineError {
        if err.is_canceled() {
            self.count("canceled");
            tracing::info!(contract_id = %record.id, stage = %err.stage, "pipeline canceled");
            return err;
        }
        self.count("failed");
        tracing::error!(contract_id = %record.id, error = %err, "pipeline failed");
        record.mark_failed(err.to_string());
        if let Err(e) = guarded(cancel, Stage::Store, self.contracts.update_contract(record)).await {
            tracing::warn!(contract_id = %record.id, error = %e, "cannot record failure");
        }
        err
    }

    fn count(&self, outcome: &str) {
        self.metrics
            .incr("pipeline_runs_total", &[("outcome", outcome)]);
    }
}

fn is_generic_mime(mime: &str) -> bool {
    let essence = mime.split(';').next().unwrap_or_default().trim();
    essence.is_empty() || essence.eq_ignore_ascii_case("application/octet-stream")
}

fn clean_industries(industries: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for tag in industries {
        let tag = tag.trim().to_ascii_lowercase();
        if !tag.is_empty() && !out.contains(&tag) {
            out.push(tag);
        }
    }
    if out.is_empty() {
        out.push(INDUSTRY_FALLBACK.to_string());
    }
    out
}

/// Reorders milestones by `order` (indices into the current list) and
/// numbers them from 1. Leaves everything untouched and returns `false`
/// unless `order` is a permutation of the current indices.
pub fn apply_sequence(milestones: &mut Vec<Milestone>, order: &[usize]) -> bool {
    let n = milestones.len();
    let mut seen = vec![false; n];
    if order.len() != n {
        return false;
    }
    for &idx in order {
        if idx >= n || seen[idx] {
            return false;
        }
        seen[idx] = true;
    }
    let mut slots: Vec<Option<Milestone>> = milestones.drain(..).map(Some).collect();
    for (position, &idx) in order.iter().enumerate() {
        if let Some(mut milestone) = slots[idx].take() {
            milestone.sequence = Some(position as u32 + 1);
            milestones.push(milestone);
        }
    }
    true
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Makes milestone amounts and percentages consistent with the total.
///
/// Missing amounts are derived from percentages and missing percentages
/// from amounts. When every milestone carries a percentage and they do not
/// sum to 100 ± 1, they are rescaled proportionally. With a positive total,
/// amounts are then recomputed from the percentages so that each amount is
/// within 1% of the total of `total * percentage / 100`.
pub fn normalize_milestones(analysis: &mut Analysis) {
    let total = analysis
        .summary
        .total_value
        .filter(|t| *t > Decimal::ZERO);
    let milestones = &mut analysis.milestones;
    if milestones.is_empty() {
        return;
    }

    if let Some(total) = total {
        for m in milestones.iter_mut() {
            let pct = m.percentage.filter(|p| *p > 0.0);
            let amount = m.amount.filter(|a| *a > Decimal::ZERO);
            if pct.is_none() {
                if let Some(amount) = amount {
                    m.percentage = (amount / total * Decimal::ONE_HUNDRED)
                        .to_f64()
                        .map(round2);
                }
            }
        }
    }

    let all_have_pct = milestones.iter().all(|m| m.percentage.is_some());
    let sum: f64 = milestones.iter().filter_map(|m| m.percentage).sum();
    if all_have_pct && sum > 0.0 && (sum - 100.0).abs() > PERCENT_TOLERANCE {
        tracing::debug!(sum, "rescaling milestone percentages");
        for m in milestones.iter_mut() {
            m.percentage = m.percentage.map(|p| round2(p * 100.0 / sum));
        }
    }

    if let Some(total) = total {
        let tolerance = total / Decimal::ONE_HUNDRED;
        for m in milestones.iter_mut() {
            let Some(pct) = m.percentage.filter(|p| *p > 0.0) else {
                continue;
            };
            let Some(pct) = Decimal::from_f64(pct) else {
                continue;
            };
            let expected = (total * pct / Decimal::ONE_HUNDRED).round_dp(2);
            let coherent = m
                .amount
                .is_some_and(|a| (a - expected).abs() <= tolerance);
            if !coherent {
                m.amount = Some(expected);
            }
        }
    }
}
