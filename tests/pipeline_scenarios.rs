//! End-to-end pipeline runs against scripted model replies.

mod common;

use common::*;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use contract_lens::elements::ContractElement;
use contract_lens::error::{ErrorKind, InputProblem};
use contract_lens::models::{
    AuditAction, ContractStatus, ContractUpload, FeedbackType, KnowledgeInput, OcrResult,
};
use contract_lens::ocr_cache::OcrCache;
use contract_lens::prompts;
use contract_lens::metrics::Metrics;

fn text_upload() -> ContractUpload {
    ContractUpload::new(contract_text().into_bytes(), "supply.txt", "text/plain")
}

#[tokio::test]
async fn valid_text_contract_is_analyzed() {
    let h = harness(
        ScriptedProvider::new("openrouter")
            .on("validation", VALID_VERDICT)
            .on("contract_analysis", ANALYSIS),
    );
    let cancel = CancellationToken::new();

    let record = h
        .app
        .orchestrator
        .analyze(&cancel, "user-1", &text_upload())
        .await
        .unwrap();

    assert_eq!(record.status, ContractStatus::Analyzed);
    let analysis = record.analysis.as_ref().unwrap();
    let amounts: Vec<Decimal> = analysis.milestones.iter().filter_map(|m| m.amount).collect();
    assert_eq!(
        amounts,
        vec![Decimal::from(30000), Decimal::from(50000), Decimal::from(20000)]
    );
    assert_eq!(analysis.summary.parties(), vec!["Acme Corp", "Widget GmbH"]);

    let engine = h.app.orchestrator.validation();
    let stored = engine
        .latest_for_contract(&cancel, &record.id)
        .await
        .unwrap()
        .unwrap();
    assert!(stored.confidence_score >= 0.85, "score {}", stored.confidence_score);
    assert_eq!(stored.version, 1);

    let trail = engine.audit_trail(&cancel, &stored.id).await.unwrap();
    assert_eq!(trail.len(), 1);
    assert_eq!(trail[0].action, AuditAction::Created);

    assert_eq!(h.blob_count(), 1);
    assert_eq!(h.llm.calls("ocr"), 0);
    assert_eq!(
        h.app
            .metrics
            .counter("pipeline_runs_total", &[("outcome", "analyzed")]),
        1
    );
}

#[tokio::test]
async fn negative_verdict_skips_analysis() {
    let h = harness(
        ScriptedProvider::new("openrouter")
            .on("validation", INVALID_VERDICT)
            .on("contract_analysis", ANALYSIS),
    );
    let record = h
        .app
        .orchestrator
        .analyze(&CancellationToken::new(), "user-1", &text_upload())
        .await
        .unwrap();

    assert_eq!(record.status, ContractStatus::Validated);
    assert!(record.analysis.is_none());
    assert!(!record.validation.as_ref().unwrap().is_valid_contract);
    assert_eq!(h.llm.calls("contract_analysis"), 0);
    assert_eq!(h.llm.calls("element_detection"), 0);
}

#[cfg(unix)]
#[tokio::test]
async fn scanned_pdf_uses_multimodal_analysis() {
    let h = harness(
        ScriptedProvider::new("openrouter")
            .on("multimodal_contract_analysis", multimodal_answer())
            .on("element_detection", ELEMENTS)
            .on("risk_assessment", RISKS),
    );
    h.app
        .stores
        .knowledge
        .upsert_knowledge(KnowledgeInput {
            title: "Manufacturing payment norms".into(),
            content: "Deposits above 25% are usually escrowed.".into(),
            category: "manufacturing".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    let upload = ContractUpload::new(scanned_pdf(), "scan.pdf", "application/pdf");
    let cancel = CancellationToken::new();

    let record = h
        .app
        .orchestrator
        .analyze(&cancel, "user-2", &upload)
        .await
        .unwrap();

    assert_eq!(record.status, ContractStatus::Analyzed);
    assert_eq!(h.llm.calls("ocr"), 0);
    assert_eq!(h.llm.calls("validation"), 0);
    assert_eq!(h.llm.calls("contract_analysis"), 0);
    let log = h.llm.call_log();
    let multimodal: Vec<_> = log
        .iter()
        .filter(|c| c.task == "multimodal_contract_analysis")
        .collect();
    assert_eq!(multimodal.len(), 1);
    assert_eq!(multimodal[0].images, 2);

    // Advisory steps run on the transcript, with the industry standards.
    assert_eq!(h.llm.calls("element_detection"), 1);
    let risk: Vec<_> = log.iter().filter(|c| c.task == "risk_assessment").collect();
    assert_eq!(risk.len(), 1);
    assert!(risk[0].prompt.contains("30% deposit, 50% on delivery"));
    assert!(risk[0].prompt.contains("Deposits above 25% are usually escrowed."));

    let analysis = record.analysis.as_ref().unwrap();
    assert_eq!(analysis.risks.len(), 1);
    assert_eq!(analysis.risks[0].recommendation, "Escrow the deposit");

    let stored = h
        .app
        .orchestrator
        .validation()
        .latest_for_contract(&cancel, &record.id)
        .await
        .unwrap()
        .unwrap();
    let elements = stored.elements.expect("elements detected from the transcript");
    assert!(elements.present().contains(&ContractElement::PaymentTerms));

    let raster = std::fs::read_to_string(&h.raster_log).unwrap();
    let prefix = std::path::PathBuf::from(raster.lines().next().unwrap());
    assert!(!prefix.parent().unwrap().exists(), "raster dir left behind");
}

#[cfg(unix)]
#[tokio::test]
async fn multimodal_answer_without_transcript_still_gets_risk_review() {
    let mut answer: serde_json::Value = serde_json::from_str(&multimodal_answer()).unwrap();
    answer.as_object_mut().unwrap().remove("transcript");
    let h = harness(
        ScriptedProvider::new("openrouter")
            .on("multimodal_contract_analysis", answer.to_string())
            .on("element_detection", ELEMENTS)
            .on("risk_assessment", RISKS),
    );
    let upload = ContractUpload::new(scanned_pdf(), "scan.pdf", "application/pdf");

    let record = h
        .app
        .orchestrator
        .analyze(&CancellationToken::new(), "user-2", &upload)
        .await
        .unwrap();

    assert_eq!(record.status, ContractStatus::Analyzed);
    assert_eq!(h.llm.calls("element_detection"), 1);
    let risk: Vec<_> = h
        .llm
        .call_log()
        .into_iter()
        .filter(|c| c.task == "risk_assessment")
        .collect();
    assert_eq!(risk.len(), 1);
    assert!(risk[0].prompt.contains("Widget GmbH"));
    assert_eq!(record.analysis.unwrap().risks.len(), 1);
}

#[cfg(unix)]
#[tokio::test]
async fn failed_multimodal_falls_back_to_cached_page_ocr() {
    let h = harness(
        ScriptedProvider::new("openrouter")
            .on("multimodal_contract_analysis", "this is not json")
            .on(
                "ocr",
                r#"{"text": "SUPPLY AGREEMENT between Acme Corp and Widget GmbH", "confidence": 0.9}"#,
            )
            .on("validation", VALID_VERDICT)
            .on("contract_analysis", ANALYSIS),
    );

    // Page two was seen before.
    let seed = OcrCache::new(h.cache.clone(), Duration::from_secs(600), Arc::new(Metrics::new()));
    seed.store(
        &OcrCache::key_for(PAGE_TWO.as_bytes()),
        &OcrResult {
            text: "Payment terms: 30% deposit, 50% on delivery, 20% final.".into(),
            confidence: 0.95,
        },
        Duration::from_secs(600),
    )
    .await;

    let upload = ContractUpload::new(scanned_pdf(), "scan.pdf", "application/pdf");
    let record = h
        .app
        .orchestrator
        .analyze(&CancellationToken::new(), "user-3", &upload)
        .await
        .unwrap();

    assert_eq!(record.status, ContractStatus::Analyzed);
    // Initial attempt plus the JSON-only retry.
    assert_eq!(h.llm.calls("multimodal_contract_analysis"), 2);
    assert_eq!(h.llm.calls("ocr"), 1);
    assert_eq!(h.app.metrics.counter("ocr_cache_hits_total", &[]), 1);
    assert_eq!(h.app.metrics.counter("ocr_cache_misses_total", &[]), 1);
    assert_eq!(h.llm.calls("contract_analysis"), 1);
}

#[tokio::test]
async fn unsupported_type_rejected_before_any_side_effect() {
    let h = harness(ScriptedProvider::new("openrouter"));
    let upload = ContractUpload::new(b"MZ\x90\x00binary".to_vec(), "test.exe", "application/x-msdownload");

    let err = h
        .app
        .orchestrator
        .analyze(&CancellationToken::new(), "user-4", &upload)
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::Input(InputProblem::UnsupportedType));
    assert_eq!(h.llm.total_calls(), 0);
    assert_eq!(h.blob_count(), 0);
}

#[tokio::test]
async fn oversize_upload_rejected_before_any_side_effect() {
    let h = harness(ScriptedProvider::new("openrouter"));
    let mut bytes = b"%PDF-1.4\n".to_vec();
    bytes.resize(12 * 1024 * 1024, b' ');
    let upload = ContractUpload::new(bytes, "big.pdf", "application/pdf");

    let err = h
        .app
        .orchestrator
        .upload(&CancellationToken::new(), "user-5", &upload)
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::Input(InputProblem::TooLarge));
    assert_eq!(h.llm.total_calls(), 0);
    assert_eq!(h.blob_count(), 0);
}

#[tokio::test]
async fn generic_mime_resolved_from_filename() {
    let h = harness(ScriptedProvider::new("openrouter"));
    let upload = ContractUpload::new(
        contract_text().into_bytes(),
        "contract.txt",
        "application/octet-stream",
    );
    let record = h
        .app
        .orchestrator
        .upload(&CancellationToken::new(), "user-6", &upload)
        .await
        .unwrap();
    assert_eq!(record.mime_type, "text/plain");
    assert_eq!(record.status, ContractStatus::Uploaded);
}

#[tokio::test]
async fn analysis_failure_marks_record_failed() {
    let h = harness(
        ScriptedProvider::new("openrouter")
            .on("validation", VALID_VERDICT)
            .fail("contract_analysis"),
    );
    let cancel = CancellationToken::new();
    let err = h
        .app
        .orchestrator
        .analyze(&cancel, "user-7", &text_upload())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::UpstreamUnavailable);

    assert_eq!(
        h.app
            .metrics
            .counter("pipeline_runs_total", &[("outcome", "failed")]),
        1
    );
    assert!(h.app.metrics.render().contains("pipeline_runs_total{outcome=\"failed\"} 1"));
}

#[tokio::test]
async fn canceled_run_reports_canceled() {
    let h = harness(
        ScriptedProvider::new("openrouter")
            .on("validation", VALID_VERDICT)
            .on("contract_analysis", ANALYSIS),
    );
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = h
        .app
        .orchestrator
        .analyze(&cancel, "user-8", &text_upload())
        .await
        .unwrap_err();
    assert!(err.is_canceled());
    assert_eq!(h.llm.total_calls(), 0);
}

#[tokio::test]
async fn sequencing_reorders_milestones() {
    let h = harness_with(
        ScriptedProvider::new("openrouter")
            .on("validation", VALID_VERDICT)
            .on("contract_analysis", ANALYSIS)
            .on("milestone_sequencing", r#"{"order": [2, 0, 1]}"#),
        |c| c.pipeline.sequence_milestones = true,
    );
    let record = h
        .app
        .orchestrator
        .analyze(&CancellationToken::new(), "user-9", &text_upload())
        .await
        .unwrap();
    let names: Vec<String> = record
        .analysis
        .unwrap()
        .milestones
        .into_iter()
        .map(|m| m.description)
        .collect();
    assert_eq!(names, vec!["Final", "Deposit", "Delivery"]);
}

#[tokio::test]
async fn accuracy_feedback_adjusts_confidence_once() {
    let verdict = VALID_VERDICT.replace("0.9", "0.8");
    let h = harness(
        ScriptedProvider::new("openrouter")
            .on("validation", verdict)
            .on("contract_analysis", ANALYSIS),
    );
    let cancel = CancellationToken::new();
    let record = h
        .app
        .orchestrator
        .analyze(&cancel, "owner", &text_upload())
        .await
        .unwrap();
    let engine = h.app.orchestrator.validation();
    let v1 = engine
        .latest_for_contract(&cancel, &record.id)
        .await
        .unwrap()
        .unwrap();

    for rating in [5, 4] {
        engine
            .add_feedback(&cancel, &v1.id, "reviewer", FeedbackType::Accuracy, rating, "")
            .await
            .unwrap();
    }
    let v2 = engine
        .update_confidence_from_feedback(&cancel, &v1.id, "reviewer")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(v2.version, 2);
    assert!((v2.result.confidence - 0.95).abs() < 1e-9);

    let trail_len = engine.audit_trail(&cancel, &v1.id).await.unwrap().len();
    assert!(engine
        .update_confidence_from_feedback(&cancel, &v1.id, "reviewer")
        .await
        .unwrap()
        .is_none());
    assert_eq!(engine.audit_trail(&cancel, &v1.id).await.unwrap().len(), trail_len);

    let contract = h.app.orchestrator.contract(&cancel, &record.id).await.unwrap();
    assert!((contract.validation.unwrap().confidence - 0.95).abs() < 1e-9);
}

#[tokio::test]
async fn unparseable_analysis_is_retried_with_json_only_instruction() {
    let h = harness(
        ScriptedProvider::new("openrouter")
            .on("validation", VALID_VERDICT)
            .once("contract_analysis", "Sure! Here is the analysis you asked for.")
            .on("contract_analysis", ANALYSIS),
    );
    let record = h
        .app
        .orchestrator
        .analyze(&CancellationToken::new(), "user-10", &text_upload())
        .await
        .unwrap();

    assert_eq!(record.status, ContractStatus::Analyzed);
    let attempts: Vec<_> = h
        .llm
        .call_log()
        .into_iter()
        .filter(|c| c.task == "contract_analysis")
        .collect();
    assert_eq!(attempts.len(), 2);
    assert!(!attempts[0].prompt.contains(prompts::JSON_ONLY_SYSTEM));
    assert!(attempts[1].prompt.starts_with(prompts::JSON_ONLY_SYSTEM));
}

#[tokio::test]
async fn analysis_unparseable_twice_fails_the_record() {
    let h = harness(
        ScriptedProvider::new("openrouter")
            .on("validation", VALID_VERDICT)
            .on("contract_analysis", "not json, not even close"),
    );
    let cancel = CancellationToken::new();
    let err = h
        .app
        .orchestrator
        .analyze(&cancel, "user-11", &text_upload())
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::Parse);
    assert_eq!(h.llm.calls("contract_analysis"), 2);

    // Every record is past retention this far out.
    let later = chrono::Utc::now() + chrono::Duration::days(10_000);
    let records = h.app.stores.contracts.list_expired(later).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, ContractStatus::Failed);
    assert!(records[0].analysis.is_none());
}
