//! Shared fixtures: a scripted LLM provider keyed on the prompt's task
//! marker, a fake rasterizer, and an `App` wired to in-memory backends.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use contract_lens::app::App;
use contract_lens::blob::{BlobStore, FsBlobStore};
use contract_lens::cache::MemoryCache;
use contract_lens::config::Config;
use contract_lens::llm::{ChatRequest, LlmError, LlmGateway, LlmProvider, LlmResponse};
use contract_lens::metrics::Metrics;
use contract_lens::resilience::CallError;
use contract_lens::store::Stores;

#[derive(Debug, Clone)]
enum Reply {
    Content(String),
    Unavailable,
}

#[derive(Debug, Clone)]
pub struct Call {
    pub task: String,
    pub model: String,
    pub images: usize,
    /// Every text block of the request, system messages included.
    pub prompt: String,
}

/// Answers each request according to the `Task: <name>` line of its
/// prompt. Queued replies are used first, then the standing reply; a task
/// with neither fails as unavailable.
pub struct ScriptedProvider {
    id: String,
    standing: Mutex<HashMap<String, Reply>>,
    queued: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedProvider {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            standing: Mutex::new(HashMap::new()),
            queued: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn on(self, task: &str, content: impl Into<String>) -> Self {
        self.standing
            .lock()
            .unwrap()
            .insert(task.to_string(), Reply::Content(content.into()));
        self
    }

    pub fn once(self, task: &str, content: impl Into<String>) -> Self {
        self.queued
            .lock()
            .unwrap()
            .entry(task.to_string())
            .or_default()
            .push_back(Reply::Content(content.into()));
        self
    }

    pub fn fail(self, task: &str) -> Self {
        self.standing
            .lock()
            .unwrap()
            .insert(task.to_string(), Reply::Unavailable);
        self
    }

    pub fn calls(&self, task: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.task == task)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn call_log(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

fn task_of(request: &ChatRequest) -> String {
    request
        .text()
        .lines()
        .find_map(|l| l.trim().strip_prefix("Task: ").map(|t| t.trim().to_string()))
        .unwrap_or_default()
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(
        &self,
        _cancel: &CancellationToken,
        request: &ChatRequest,
    ) -> Result<LlmResponse, LlmError> {
        let task = task_of(request);
        self.calls.lock().unwrap().push(Call {
            task: task.clone(),
            model: request.model.clone(),
            images: request.image_count(),
            prompt: request.text(),
        });

        let queued = self
            .queued
            .lock()
            .unwrap()
            .get_mut(&task)
            .and_then(|q| q.pop_front());
        let reply = queued.or_else(|| self.standing.lock().unwrap().get(&task).cloned());
        match reply {
            Some(Reply::Content(content)) => Ok(LlmResponse {
                status: 200,
                body: json!({"choices": [{"message": {"content": content}}]}).to_string(),
            }),
            _ => Err(LlmError::Unavailable(CallError::Network(format!(
                "no scripted reply for task {:?}",
                task
            )))),
        }
    }
}

pub struct Harness {
    pub app: App,
    pub llm: Arc<ScriptedProvider>,
    pub cache: Arc<MemoryCache>,
    pub blob_dir: TempDir,
    pub work: TempDir,
    /// Every output prefix the fake rasterizer was invoked with, one per line.
    pub raster_log: PathBuf,
}

impl Harness {
    pub fn blob_count(&self) -> usize {
        walk(self.blob_dir.path())
    }
}

fn walk(dir: &std::path::Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .map(|e| {
            let path = e.path();
            if path.is_dir() {
                walk(&path)
            } else {
                1
            }
        })
        .sum()
}

/// Writes a stand-in for `pdftoppm` that emits one JPEG per entry of
/// `pages` (`$7` is the output prefix) and logs the prefix.
#[cfg(unix)]
pub fn fake_rasterizer(dir: &std::path::Path, pages: &[&str], log: &std::path::Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let mut script = String::from("#!/bin/sh\n");
    script.push_str(&format!("echo \"$7\" >> '{}'\n", log.display()));
    for (i, content) in pages.iter().enumerate() {
        script.push_str(&format!("printf '%s' '{}' > \"$7-{}.jpg\"\n", content, i + 1));
    }
    let path = dir.join("fake-pdftoppm");
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

pub const PAGE_ONE: &str = "scanned-page-one";
pub const PAGE_TWO: &str = "scanned-page-two";

pub fn harness(llm: ScriptedProvider) -> Harness {
    harness_with(llm, |_| {})
}

pub fn harness_with(llm: ScriptedProvider, tweak: impl FnOnce(&mut Config)) -> Harness {
    let blob_dir = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let raster_log = work.path().join("raster.log");

    let mut config = Config::default();
    config.database.dialect = "memory".to_string();
    config.storage.blob_dir = blob_dir.path().to_path_buf();
    #[cfg(unix)]
    {
        config.pipeline.rasterizer_bin = fake_rasterizer(work.path(), &[PAGE_ONE, PAGE_TWO], &raster_log)
            .to_string_lossy()
            .into_owned();
    }
    tweak(&mut config);

    let llm = Arc::new(llm);
    let gateway = LlmGateway::builder().provider(llm.clone()).build();
    let cache = Arc::new(MemoryCache::new(1024));
    let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(blob_dir.path()));
    let app = App::assemble(
        config,
        Stores::memory(),
        cache.clone(),
        gateway,
        blobs,
        Arc::new(Metrics::new()),
    );

    Harness {
        app,
        llm,
        cache,
        blob_dir,
        work,
        raster_log,
    }
}

/// Bytes that look like a PDF to the upload gate but carry no extractable
/// text, so they take the scanned-document path.
pub fn scanned_pdf() -> Vec<u8> {
    b"%PDF-1.4\n% scanned contract, image-only\n%%EOF\n".to_vec()
}

pub fn contract_text() -> String {
    let mut text = String::from(
        "SUPPLY AGREEMENT\n\nThis Supply Agreement is entered into by Acme Corp, 1 Main St, \
         Springfield, USA (\"Buyer\") and Widget GmbH, Hauptstrasse 5, Berlin, Germany \
         (\"Seller\").\n\n",
    );
    while text.len() < 1200 {
        text.push_str(
            "The Seller shall deliver the goods described in Schedule A and the Buyer shall pay \
             the price in the installments set out below. ",
        );
    }
    text
}

pub const VALID_VERDICT: &str = r#"{
  "isValidContract": true,
  "confidence": 0.9,
  "contractType": "supply",
  "detectedElements": ["parties_identification", "offer_and_acceptance", "consideration",
                       "legal_capacity", "mutual_consent", "lawful_purpose"],
  "missingElements": []
}"#;

pub const INVALID_VERDICT: &str = r#"{
  "isValidContract": false,
  "reason": "This is a restaurant menu.",
  "confidence": 0.95,
  "detectedElements": [],
  "missingElements": ["consideration"]
}"#;

pub const ANALYSIS: &str = r#"{
  "contractName": "Supply Agreement",
  "summary": {
    "buyerName": "Acme Corp",
    "sellerName": "Widget GmbH",
    "totalValue": 100000,
    "currency": "USD"
  },
  "paymentMilestones": [
    {"desc": "Deposit", "pct": 30},
    {"desc": "Delivery", "pct": 50},
    {"desc": "Final", "pct": 20}
  ],
  "riskFactors": [],
  "effectiveDate": "2024-01-01",
  "industries": ["manufacturing"]
}"#;

pub const TRANSCRIPT: &str = "SUPPLY AGREEMENT between Acme Corp and Widget GmbH. \
Payment: 30% deposit, 50% on delivery, 20% on final acceptance.";

pub const RISKS: &str = r#"{"risks": [{"type": "payment", "description": "Large deposit before delivery", "severity": "medium", "party": "buyer", "recommendation": "Escrow the deposit"}]}"#;

pub const ELEMENTS: &str = r#"{"elements": [{"element": "payment_terms", "present": true, "confidence": 0.9}], "confidence": 0.85}"#;

pub fn multimodal_answer() -> String {
    let mut value: serde_json::Value = serde_json::from_str(ANALYSIS).unwrap();
    value["transcript"] = serde_json::Value::String(TRANSCRIPT.to_string());
    value["validation"] = serde_json::from_str(VALID_VERDICT).unwrap();
    value.to_string()
}
