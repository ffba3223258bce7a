//! TOML configuration for the contract analysis service.
//!
//! Every section is optional; a missing section falls back to the defaults
//! below. API keys may be supplied through the environment, which takes
//! precedence over the file:
//!
//! | Variable | Overrides |
//! |----------|-----------|
//! | `OPENROUTER_API_KEY` | `llm.openrouter.api_key` |
//! | `QWEN_API_KEY` | `ocr.api_key`, `llm.qwen.api_key` |

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_OPENROUTER_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_QWEN_URL: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub redis: Option<RedisConfig>,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub ocr: OcrConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub knowledge: KnowledgeConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn default_port() -> u16 {
    8080
}
fn default_bind() -> String {
    "0.0.0.0".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// `sqlite` or `memory`.
    #[serde(default = "default_dialect")]
    pub dialect: String,
    #[serde(default = "default_dsn")]
    pub dsn: PathBuf,
    #[serde(default, rename = "logMode", alias = "log_mode")]
    pub log_mode: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dialect: default_dialect(),
            dsn: default_dsn(),
            log_mode: false,
        }
    }
}

fn default_dialect() -> String {
    "sqlite".to_string()
}
fn default_dsn() -> PathBuf {
    PathBuf::from("./data/contracts.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    pub address: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub db: i64,
}

impl RedisConfig {
    /// Connection URL in the `redis://[:password@]host:port/db` form.
    pub fn url(&self) -> String {
        let address = self
            .address
            .trim_start_matches("redis://")
            .trim_end_matches('/');
        match self.password.as_deref().filter(|p| !p.is_empty()) {
            Some(pw) => format!("redis://:{}@{}/{}", pw, address, self.db),
            None => format!("redis://{}/{}", address, self.db),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LlmConfig {
    #[serde(default)]
    pub openrouter: ProviderConfig,
    #[serde(default)]
    pub qwen: Option<ProviderConfig>,
}

/// Connection settings for one chat-completions provider.
#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    #[serde(default = "default_openrouter_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_analysis_model")]
    pub model: String,
    /// Per-call timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout: u64,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    /// Initial backoff interval in seconds.
    #[serde(default = "default_retry_wait")]
    pub retry_wait_time: u64,
    /// Backoff ceiling in seconds.
    #[serde(default = "default_retry_max_interval")]
    pub retry_max_interval: u64,
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,
    #[serde(default = "default_breaker_open_secs")]
    pub breaker_open_secs: u64,
    /// Sent as `HTTP-Referer` (OpenRouter attribution).
    #[serde(default)]
    pub site_url: Option<String>,
    /// Sent as `X-Title` (OpenRouter attribution).
    #[serde(default)]
    pub app_name: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_openrouter_url(),
            api_key: None,
            model: default_analysis_model(),
            timeout: default_timeout_secs(),
            retry_count: default_retry_count(),
            retry_wait_time: default_retry_wait(),
            retry_max_interval: default_retry_max_interval(),
            breaker_threshold: default_breaker_threshold(),
            breaker_open_secs: default_breaker_open_secs(),
            site_url: None,
            app_name: None,
        }
    }
}

impl ProviderConfig {
    pub fn qwen_default() -> Self {
        Self {
            base_url: DEFAULT_QWEN_URL.to_string(),
            model: default_ocr_model(),
            ..Self::default()
        }
    }
}

fn default_openrouter_url() -> String {
    DEFAULT_OPENROUTER_URL.to_string()
}
fn default_analysis_model() -> String {
    "openai/gpt-4o-mini".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_retry_count() -> u32 {
    3
}
fn default_retry_wait() -> u64 {
    1
}
fn default_retry_max_interval() -> u64 {
    10
}
fn default_breaker_threshold() -> u32 {
    5
}
fn default_breaker_open_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct OcrConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    /// Provider id the OCR requests are routed through.
    #[serde(default = "default_ocr_provider")]
    pub provider: String,
    #[serde(default = "default_ocr_model")]
    pub model: String,
    #[serde(default)]
    pub fallback_models: Vec<String>,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_timeout_secs")]
    pub timeout: u64,
    #[serde(default = "default_ocr_cache_ttl")]
    pub cache_ttl_secs: u64,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            provider: default_ocr_provider(),
            model: default_ocr_model(),
            fallback_models: Vec::new(),
            min_confidence: default_min_confidence(),
            timeout: default_timeout_secs(),
            cache_ttl_secs: default_ocr_cache_ttl(),
        }
    }
}

fn default_ocr_provider() -> String {
    "openrouter".to_string()
}
fn default_ocr_model() -> String {
    "qwen/qwen2.5-vl-72b-instruct".to_string()
}
fn default_min_confidence() -> f64 {
    0.1
}
fn default_ocr_cache_ttl() -> u64 {
    7 * 24 * 3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default = "default_ocr_concurrency")]
    pub ocr_concurrency: usize,
    #[serde(default = "default_rasterizer_bin")]
    pub rasterizer_bin: String,
    #[serde(default = "default_text_probe_bytes")]
    pub text_probe_bytes: usize,
    #[serde(default = "default_min_text_chars")]
    pub min_text_chars: usize,
    #[serde(default)]
    pub sequence_milestones: bool,
    #[serde(default = "default_analysis_provider")]
    pub analysis_provider: String,
    /// Defaults to `llm.openrouter.model`.
    #[serde(default)]
    pub analysis_model: Option<String>,
    /// Model used for one-step multimodal analysis. Defaults to `ocr.model`.
    #[serde(default)]
    pub vision_model: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            max_pages: default_max_pages(),
            ocr_concurrency: default_ocr_concurrency(),
            rasterizer_bin: default_rasterizer_bin(),
            text_probe_bytes: default_text_probe_bytes(),
            min_text_chars: default_min_text_chars(),
            sequence_milestones: false,
            analysis_provider: default_analysis_provider(),
            analysis_model: None,
            vision_model: None,
        }
    }
}

fn default_max_file_size() -> u64 {
    10 * 1024 * 1024
}
fn default_max_pages() -> u32 {
    10
}
fn default_ocr_concurrency() -> usize {
    4
}
fn default_rasterizer_bin() -> String {
    "pdftoppm".to_string()
}
fn default_text_probe_bytes() -> usize {
    512
}
fn default_min_text_chars() -> usize {
    100
}
fn default_analysis_provider() -> String {
    "openrouter".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_blob_dir")]
    pub blob_dir: PathBuf,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            blob_dir: default_blob_dir(),
            retention_days: default_retention_days(),
        }
    }
}

fn default_blob_dir() -> PathBuf {
    PathBuf::from("./data/blobs")
}
fn default_retention_days() -> u32 {
    365
}

#[derive(Debug, Deserialize, Clone)]
pub struct KnowledgeConfig {
    #[serde(default = "default_knowledge_ttl")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_knowledge_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_entries_per_industry")]
    pub entries_per_industry: usize,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_knowledge_ttl(),
            max_chars: default_knowledge_max_chars(),
            entries_per_industry: default_entries_per_industry(),
        }
    }
}

fn default_knowledge_ttl() -> u64 {
    24 * 3600
}
fn default_knowledge_max_chars() -> usize {
    8 * 1024
}
fn default_entries_per_industry() -> usize {
    2
}

impl Config {
    /// Applies environment-variable overrides. `lookup` abstracts over
    /// `std::env::var` so tests can supply their own environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("OPENROUTER_API_KEY").filter(|k| !k.is_empty()) {
            self.llm.openrouter.api_key = Some(key);
        }
        if let Some(key) = lookup("QWEN_API_KEY").filter(|k| !k.is_empty()) {
            self.ocr.api_key = Some(key.clone());
            if let Some(qwen) = self.llm.qwen.as_mut() {
                qwen.api_key = Some(key);
            }
        }
    }

    pub fn analysis_model(&self) -> String {
        self.pipeline
            .analysis_model
            .clone()
            .unwrap_or_else(|| self.llm.openrouter.model.clone())
    }

    pub fn vision_model(&self) -> String {
        self.pipeline
            .vision_model
            .clone()
            .unwrap_or_else(|| self.ocr.model.clone())
    }

    pub fn ocr_timeout(&self) -> Duration {
        Duration::from_secs(self.ocr.timeout)
    }

    pub fn validate(&self) -> Result<()> {
        match self.database.dialect.as_str() {
            "sqlite" | "memory" => {}
            other => bail!(
                "Unknown database dialect: '{}'. Must be sqlite or memory.",
                other
            ),
        }

        if self.pipeline.max_file_size == 0 {
            bail!("pipeline.max_file_size must be > 0");
        }
        if self.pipeline.max_pages == 0 {
            bail!("pipeline.max_pages must be >= 1");
        }
        if self.pipeline.ocr_concurrency == 0 {
            bail!("pipeline.ocr_concurrency must be >= 1");
        }
        if !(0.0..=1.0).contains(&self.ocr.min_confidence) {
            bail!("ocr.min_confidence must be in [0.0, 1.0]");
        }
        if self.llm.openrouter.timeout == 0 || self.ocr.timeout == 0 {
            bail!("timeouts must be > 0 seconds");
        }
        if self.llm.openrouter.retry_wait_time > self.llm.openrouter.retry_max_interval {
            bail!("llm.openrouter.retry_wait_time must not exceed retry_max_interval");
        }
        if self.knowledge.entries_per_industry == 0 {
            bail!("knowledge.entries_per_industry must be >= 1");
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.apply_env_overrides(|name| std::env::var(name).ok());
    config.validate()?;

    Ok(config)
}
