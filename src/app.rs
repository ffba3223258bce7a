//! Composition root: turns a [`Config`] into a wired [`App`].

use anyhow::{bail, Result};
use std::sync::Arc;
use std::time::Duration;

use crate::blob::{BlobStore, FsBlobStore};
use crate::cache::{self, Cache};
use crate::config::{Config, ProviderConfig};
use crate::knowledge::KnowledgeLookup;
use crate::llm::{ChatCompletionsProvider, LlmGateway};
use crate::metrics::Metrics;
use crate::ocr::OcrEngine;
use crate::ocr_cache::OcrCache;
use crate::pdf_text::PdfTextExtractor;
use crate::pipeline::{AnalysisOrchestrator, PipelineParts, PipelineSettings};
use crate::rasterize::Rasterizer;
use crate::resilience::{BreakerPolicy, HttpTransport, ReqwestTransport, ResilientCaller, RetryPolicy};
use crate::retention::RetentionSweeper;
use crate::store::sqlite::SqliteStore;
use crate::store::Stores;
use crate::structured::StructuredClient;

pub const OPENROUTER: &str = "openrouter";
pub const QWEN: &str = "qwen";

/// Everything a request handler or CLI command needs.
#[derive(Clone)]
pub struct App {
    pub config: Arc<Config>,
    pub stores: Stores,
    pub cache: Arc<dyn Cache>,
    pub gateway: LlmGateway,
    pub blobs: Arc<dyn BlobStore>,
    pub metrics: Arc<Metrics>,
    pub knowledge: KnowledgeLookup,
    pub orchestrator: Arc<AnalysisOrchestrator>,
    pub sweeper: RetentionSweeper,
}

impl App {
    /// Opens the configured database (running migrations), cache and LLM
    /// providers.
    pub async fn from_config(config: Config) -> Result<Self> {
        let metrics = Arc::new(Metrics::new());
        let stores = match config.database.dialect.as_str() {
            "memory" => Stores::memory(),
            "sqlite" => {
                let pool = crate::db::connect(&config).await?;
                crate::migrate::migrate_pool(&pool).await?;
                Stores::from_backend(Arc::new(SqliteStore::new(pool)))
            }
            other => bail!("unsupported database dialect: {}", other),
        };
        let cache = cache::from_config(&config)?;
        let transport: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport::new()?);
        let gateway = gateway_from_config(&config, transport, metrics.clone());
        let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(&config.storage.blob_dir));
        Ok(Self::assemble(config, stores, cache, gateway, blobs, metrics))
    }

    /// Wires already-built collaborators together.
    pub fn assemble(
        config: Config,
        stores: Stores,
        cache: Arc<dyn Cache>,
        gateway: LlmGateway,
        blobs: Arc<dyn BlobStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let settings = PipelineSettings::from_config(&config);
        let llm = StructuredClient::new(gateway.clone(), &config.pipeline.analysis_provider);
        let ocr = OcrEngine::new(
            gateway.clone(),
            &config.ocr.provider,
            &config.ocr.model,
            config.ocr.fallback_models.clone(),
            config.ocr.min_confidence,
            metrics.clone(),
        );
        let ocr_cache = OcrCache::new(
            cache.clone(),
            Duration::from_secs(config.ocr.cache_ttl_secs),
            metrics.clone(),
        );
        let knowledge = KnowledgeLookup::new(stores.knowledge.clone(), cache.clone(), &config.knowledge);
        let parts = PipelineParts {
            blobs: blobs.clone(),
            stores: stores.clone(),
            llm,
            ocr,
            ocr_cache,
            rasterizer: Rasterizer::new(config.pipeline.rasterizer_bin.clone()),
            pdf_text: PdfTextExtractor::new(
                config.pipeline.max_pages as usize,
                config.pipeline.min_text_chars,
            ),
            knowledge: knowledge.clone(),
            metrics: metrics.clone(),
        };
        let orchestrator = Arc::new(AnalysisOrchestrator::new(settings, parts));
        let sweeper = RetentionSweeper::new(stores.contracts.clone(), blobs.clone(), metrics.clone());

        Self {
            config: Arc::new(config),
            stores,
            cache,
            gateway,
            blobs,
            metrics,
            knowledge,
            orchestrator,
            sweeper,
        }
    }
}

/// Registers `openrouter` always and `qwen` when it is configured or when
/// OCR is routed to it.
pub fn gateway_from_config(
    config: &Config,
    transport: Arc<dyn HttpTransport>,
    metrics: Arc<Metrics>,
) -> LlmGateway {
    let mut builder = LlmGateway::builder().provider(Arc::new(provider(
        OPENROUTER,
        &config.llm.openrouter,
        transport.clone(),
        metrics.clone(),
    )));

    let qwen = match &config.llm.qwen {
        Some(qwen) => Some(qwen.clone()),
        None if config.ocr.provider == QWEN => {
            let mut qwen = ProviderConfig::qwen_default();
            qwen.api_key = config.ocr.api_key.clone();
            qwen.timeout = config.ocr.timeout;
            Some(qwen)
        }
        None => None,
    };
    if let Some(qwen) = qwen {
        builder = builder.provider(Arc::new(provider(QWEN, &qwen, transport, metrics)));
    }
    builder.build()
}

fn provider(
    id: &str,
    config: &ProviderConfig,
    transport: Arc<dyn HttpTransport>,
    metrics: Arc<Metrics>,
) -> ChatCompletionsProvider {
    let mut caller = ResilientCaller::new(
        id,
        transport,
        RetryPolicy::from_provider(config),
        BreakerPolicy::from_provider(config),
        metrics,
    );
    if let Some(site) = config.site_url.as_deref() {
        caller = caller.with_default_header("HTTP-Referer", site);
    }
    if let Some(name) = config.app_name.as_deref() {
        caller = caller.with_default_header("X-Title", name);
    }
    ChatCompletionsProvider::new(id, &config.base_url, config.api_key.clone(), caller)
}
