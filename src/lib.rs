//! # Contract Lens
//!
//! Contract document ingestion and LLM-backed analysis.
//!
//! Uploaded contracts (PDF, scanned PDF, DOCX, plain text, images) are
//! stored, their text is extracted (directly, by multimodal analysis of
//! rasterized pages, or by per-page OCR), and an external chat-completions
//! model produces a validity verdict and a structured analysis: parties,
//! total value, payment milestones, risk factors, compliance notes.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌──────────────┐   ┌──────────┐
//! │  Upload  │──▶│  Extraction  │──▶│  Validation  │──▶│ Analysis │
//! │ (gate)   │   │ PDF/OCR/DOCX │   │  + elements  │   │ + risk   │
//! └──────────┘   └──────┬───────┘   └──────┬───────┘   └────┬─────┘
//!                       │                  │                │
//!                ┌──────▼──────┐     ┌─────▼─────┐    ┌─────▼─────┐
//!                │  OCR cache  │     │  Stores   │    │ Knowledge │
//!                └─────────────┘     └───────────┘    └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! clens init                         # create database
//! clens analyze ./contract.pdf       # one-off analysis to stdout
//! clens knowledge add --title "Retainage" --category construction --content "..."
//! clens serve                        # start HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`resilience`] | Retrying, breaker-gated HTTP calls |
//! | [`llm`] | Chat-completions providers and gateway |
//! | [`structured`] | JSON-typed LLM requests |
//! | [`ocr`] / [`ocr_cache`] | Page OCR with model fallback and caching |
//! | [`pipeline`] | The analysis orchestrator |
//! | [`validation`] | Verdicts, confidence scoring, feedback |
//! | [`knowledge`] | Industry standards for risk prompts |
//! | [`store`] | Persistence traits and backends |
//! | [`server`] | HTTP API |

pub mod app;
pub mod blob;
pub mod cache;
pub mod config;
pub mod db;
pub mod elements;
pub mod error;
pub mod extract;
pub mod knowledge;
pub mod llm;
pub mod metrics;
pub mod migrate;
pub mod models;
pub mod ocr;
pub mod ocr_cache;
pub mod parse;
pub mod pdf_text;
pub mod pipeline;
pub mod prompts;
pub mod rasterize;
pub mod resilience;
pub mod retention;
pub mod server;
pub mod store;
pub mod structured;
pub mod validation;
