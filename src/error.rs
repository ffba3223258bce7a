//! Pipeline error taxonomy.
//!
//! Component errors ([`CallError`](crate::resilience::CallError),
//! [`LlmError`](crate::llm::LlmError), [`OcrError`](crate::ocr::OcrError),
//! [`ParseError`](crate::parse::ParseError), ...) stay local to their
//! modules. Whatever escapes the orchestrator or the validation engine is a
//! [`PipelineError`]: an [`ErrorKind`] that decides the HTTP status, plus the
//! [`Stage`] it happened in.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Why an input was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InputProblem {
    TooLarge,
    UnsupportedType,
    Empty,
    MissingField,
    Invalid,
}

impl InputProblem {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputProblem::TooLarge => "too_large",
            InputProblem::UnsupportedType => "unsupported_type",
            InputProblem::Empty => "empty",
            InputProblem::MissingField => "missing_field",
            InputProblem::Invalid => "invalid",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Input(InputProblem),
    Unauthenticated,
    Forbidden,
    NotFound,
    /// Transient upstream failure that outlived the retry budget.
    UpstreamUnavailable,
    /// Upstream rejected the request (4xx other than 429).
    Upstream,
    Parse,
    Storage,
    Canceled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Input(p) => write!(f, "input:{}", p.as_str()),
            ErrorKind::Unauthenticated => f.write_str("unauthenticated"),
            ErrorKind::Forbidden => f.write_str("forbidden"),
            ErrorKind::NotFound => f.write_str("not_found"),
            ErrorKind::UpstreamUnavailable => f.write_str("upstream_unavailable"),
            ErrorKind::Upstream => f.write_str("upstream"),
            ErrorKind::Parse => f.write_str("parse"),
            ErrorKind::Storage => f.write_str("storage"),
            ErrorKind::Canceled => f.write_str("canceled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Input,
    Persist,
    Extract,
    Ocr,
    Validation,
    Elements,
    Analysis,
    Risk,
    Store,
    Feedback,
    Lookup,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Input => "input",
            Stage::Persist => "persist",
            Stage::Extract => "extract",
            Stage::Ocr => "ocr",
            Stage::Validation => "validation",
            Stage::Elements => "elements",
            Stage::Analysis => "analysis",
            Stage::Risk => "risk",
            Stage::Store => "store",
            Stage::Feedback => "feedback",
            Stage::Lookup => "lookup",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
#[error("{stage} failed ({kind}): {message}")]
pub struct PipelineError {
    pub stage: Stage,
    pub kind: ErrorKind,
    pub message: String,
}

impl PipelineError {
    pub fn new(stage: Stage, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            message: message.into(),
        }
    }

    pub fn input(problem: InputProblem, message: impl Into<String>) -> Self {
        Self::new(Stage::Input, ErrorKind::Input(problem), message)
    }

    pub fn not_found(stage: Stage, message: impl Into<String>) -> Self {
        Self::new(stage, ErrorKind::NotFound, message)
    }

    pub fn storage(stage: Stage, err: anyhow::Error) -> Self {
        Self::new(stage, ErrorKind::Storage, format!("{:#}", err))
    }

    pub fn canceled(stage: Stage) -> Self {
        Self::new(stage, ErrorKind::Canceled, "request canceled")
    }

    pub fn is_canceled(&self) -> bool {
        self.kind == ErrorKind::Canceled
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
