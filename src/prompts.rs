//! Prompt templates, one builder per analysis task.
//!
//! Every prompt opens with a `Task: <name>` line. Outputs are deterministic
//! for a given input; any wording change must bump [`PROMPT_VERSION`].

use std::fmt::Write as _;

use crate::elements::{vocabulary_list, REQUIRED_ELEMENTS};
use crate::models::Milestone;

pub const PROMPT_VERSION: &str = "2024-06.3";

/// Upper bound on contract text embedded in a prompt.
pub const MAX_PROMPT_TEXT_CHARS: usize = 24_000;

pub const JSON_ONLY_SYSTEM: &str = "You are a JSON API. Respond with a single valid JSON object \
and nothing else: no Markdown, no code fences, no commentary.";

const SUMMARY_SCHEMA: &str = r#""summary": {
    "buyer_name": string|null,
    "buyer_address": string|null,
    "buyer_country": string|null,
    "seller_name": string|null,
    "seller_address": string|null,
    "seller_country": string|null,
    "goods_nature": "physical"|"digital"|"services"|null,
    "total_value": number|null,
    "currency": ISO 4217 code|null,
    "jurisdiction": string|null
  }"#;

const MILESTONES_SCHEMA: &str = r#""milestones": [
    {"description": string, "amount": number|null, "percentage": number|null, "trigger_condition": string|null}
  ]"#;

const RISK_SCHEMA: &str = r#"{"type": string, "description": string, "severity": "low"|"medium"|"high"|"critical", "party": "buyer"|"seller"|"both", "recommendation": string}"#;

pub fn task_marker(task: &str) -> String {
    format!("Task: {}", task)
}

/// Truncates on a char boundary.
fn clip(text: &str) -> &str {
    match text.char_indices().nth(MAX_PROMPT_TEXT_CHARS) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn analysis_schema() -> String {
    format!(
        r#"{{
  "contract_name": string|null,
  {SUMMARY_SCHEMA},
  {MILESTONES_SCHEMA},
  "risks": [{RISK_SCHEMA}],
  "effective_date": "YYYY-MM-DD"|null,
  "termination_date": "YYYY-MM-DD"|null,
  "industries": [string]
}}"#
    )
}

pub fn contract_analysis(text: &str) -> String {
    format!(
        "{marker}\n\
         You are a contract analyst. Extract the commercial terms of the contract below.\n\
         Rules:\n\
         - Use null for anything the contract does not state. Do not invent parties or amounts.\n\
         - total_value is the total contract price as a plain number without separators.\n\
         - Milestone percentages are of the total value and should sum to 100.\n\
         - Keep milestones in the order they appear in the contract.\n\
         - industries: one to three lowercase industry tags (e.g. \"construction\", \"software\").\n\
         Respond with JSON only, matching:\n{schema}\n\n\
         Contract text:\n\"\"\"\n{text}\n\"\"\"",
        marker = task_marker("contract_analysis"),
        schema = analysis_schema(),
        text = clip(text),
    )
}

/// Instructions only; the caller attaches the page images.
pub fn multimodal_contract_analysis() -> String {
    format!(
        "{marker}\n\
         The attached images are consecutive pages of one document. Read them in order.\n\
         First decide whether the document is a legally binding contract, then extract its \
         commercial terms. Use null for anything not stated. Element tags must come from: {vocab}.\n\
         Also transcribe the full document text, page by page.\n\
         Respond with JSON only, matching:\n{schema_head},\n  \"transcript\": string,\n  \"validation\": {validation}\n}}",
        marker = task_marker("multimodal_contract_analysis"),
        vocab = vocabulary_list(),
        schema_head = analysis_schema().trim_end_matches('}').trim_end(),
        validation = validation_schema(),
    )
}

fn validation_schema() -> &'static str {
    r#"{"is_valid_contract": boolean, "reason": string|null, "confidence": number between 0 and 1, "contract_type": string|null, "detected_elements": [tag], "missing_elements": [tag]}"#
}

pub fn validation(text: &str) -> String {
    let required: Vec<&str> = REQUIRED_ELEMENTS.iter().map(|e| e.as_str()).collect();
    format!(
        "{marker}\n\
         Decide whether the document below is a legally binding contract.\n\
         A valid contract normally shows: {required}.\n\
         Report which elements are present and which required ones are missing, using only these \
         tags: {vocab}.\n\
         confidence is your certainty in the verdict, between 0 and 1.\n\
         Respond with JSON only, matching:\n{schema}\n\n\
         Document:\n\"\"\"\n{text}\n\"\"\"",
        marker = task_marker("validation"),
        required = required.join(", "),
        vocab = vocabulary_list(),
        schema = validation_schema(),
        text = clip(text),
    )
}

pub fn element_detection(text: &str) -> String {
    format!(
        "{marker}\n\
         For each of these contract elements decide whether the contract below contains it: {vocab}.\n\
         Quote a short excerpt as evidence when present.\n\
         Respond with JSON only, matching:\n\
         {{\"elements\": [{{\"element\": tag, \"present\": boolean, \"excerpt\": string|null, \
         \"confidence\": number}}], \"confidence\": number}}\n\n\
         Contract text:\n\"\"\"\n{text}\n\"\"\"",
        marker = task_marker("element_detection"),
        vocab = vocabulary_list(),
        text = clip(text),
    )
}

pub fn milestone_sequencing(milestones: &[Milestone]) -> String {
    let mut listing = String::new();
    for (idx, m) in milestones.iter().enumerate() {
        let _ = write!(listing, "{}. {}", idx, m.description);
        if let Some(trigger) = m.trigger_condition.as_deref() {
            let _ = write!(listing, " (trigger: {})", trigger);
        }
        listing.push('\n');
    }
    format!(
        "{marker}\n\
         Order these payment milestones chronologically by when they fall due. Milestones are \
         numbered from 0.\n\
         {listing}\n\
         Respond with JSON only, matching: {{\"order\": [milestone numbers, earliest first]}}",
        marker = task_marker("milestone_sequencing"),
    )
}

pub fn risk_assessment(text: &str, industry_standards: &str) -> String {
    let standards = if industry_standards.trim().is_empty() {
        "(no reference standards available)"
    } else {
        industry_standards
    };
    format!(
        "{marker}\n\
         Identify the commercial and legal risks in the contract below for each party. Compare \
         against the industry standards where relevant.\n\
         Industry standards:\n{standards}\n\n\
         Respond with JSON only, matching: {{\"risks\": [{risk}]}}\n\n\
         Contract text:\n\"\"\"\n{text}\n\"\"\"",
        marker = task_marker("risk_assessment"),
        risk = RISK_SCHEMA,
        text = clip(text),
    )
}

pub fn compliance(text: &str, jurisdiction: &str) -> String {
    format!(
        "{marker}\n\
         Review the contract below for compliance with the laws of {jurisdiction}. List concrete \
         issues only.\n\
         Respond with JSON only, matching: \
         {{\"compliant\": boolean, \"issues\": [string], \"notes\": string|null}}\n\n\
         Contract text:\n\"\"\"\n{text}\n\"\"\"",
        marker = task_marker("compliance"),
        text = clip(text),
    )
}

pub fn industry_classification(text: &str) -> String {
    format!(
        "{marker}\n\
         Classify the industry of the contract below with one to three lowercase tags such as \
         \"construction\", \"software\", \"manufacturing\", \"logistics\", \"healthcare\".\n\
         Respond with JSON only, matching: {{\"industries\": [string]}}\n\n\
         Contract text:\n\"\"\"\n{text}\n\"\"\"",
        marker = task_marker("industry_classification"),
        text = clip(text),
    )
}

pub fn ocr_instruction() -> String {
    format!(
        "{marker}\n\
         Transcribe all text in the image exactly as written, preserving reading order and line \
         breaks. Do not summarise or translate.\n\
         Respond with JSON only, matching: \
         {{\"text\": string, \"confidence\": number between 0 and 1}}",
        marker = task_marker("ocr"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompts_are_deterministic_and_marked() {
        assert_eq!(contract_analysis("x"), contract_analysis("x"));
        assert!(contract_analysis("x").starts_with("Task: contract_analysis\n"));
        assert!(validation("x").starts_with("Task: validation\n"));
        assert!(element_detection("x").starts_with("Task: element_detection\n"));
        assert!(risk_assessment("x", "").starts_with("Task: risk_assessment\n"));
        assert!(compliance("x", "Kenya").starts_with("Task: compliance\n"));
        assert!(industry_classification("x").starts_with("Task: industry_classification\n"));
        assert!(ocr_instruction().starts_with("Task: ocr\n"));
        assert!(multimodal_contract_analysis().starts_with("Task: multimodal_contract_analysis\n"));
    }

    #[test]
    fn validation_lists_vocabulary() {
        let p = validation("some contract");
        assert!(p.contains("parties_identification"));
        assert!(p.contains("force_majeure"));
        assert!(p.contains("some contract"));
    }

    #[test]
    fn multimodal_schema_has_validation_block() {
        let p = multimodal_contract_analysis();
        assert!(p.contains("\"validation\": {\"is_valid_contract\""));
        assert!(p.contains("\"industries\": [string],"));
        assert!(p.contains("\"transcript\": string,"));
    }

    #[test]
    fn long_text_is_clipped_on_char_boundary() {
        let text = "é".repeat(MAX_PROMPT_TEXT_CHARS + 50);
        let p = contract_analysis(&text);
        assert_eq!(p.matches('é').count(), MAX_PROMPT_TEXT_CHARS);
    }

    #[test]
    fn sequencing_numbers_milestones() {
        let ms = vec![
            Milestone {
                description: "Final".into(),
                ..Default::default()
            },
            Milestone {
                description: "Deposit".into(),
                trigger_condition: Some("signing".into()),
                ..Default::default()
            },
        ];
        let p = milestone_sequencing(&ms);
        assert!(p.contains("0. Final\n"));
        assert!(p.contains("1. Deposit (trigger: signing)\n"));
    }

    #[test]
    fn empty_standards_placeholder() {
        assert!(risk_assessment("x", "  ").contains("(no reference standards available)"));
    }
}
