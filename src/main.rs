//! # Contract Lens CLI (`clens`)
//!
//! ## Usage
//!
//! ```bash
//! clens --config ./config/contracts.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `clens init` | Create the SQLite database and run schema migrations |
//! | `clens serve` | Start the HTTP server |
//! | `clens analyze <file>` | Analyze one file and print the report as JSON |
//! | `clens knowledge add` | Create or version a knowledge entry |
//! | `clens knowledge list` | List or search knowledge entries |
//! | `clens sweep` | Delete contracts past their retention period |

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use contract_lens::app::App;
use contract_lens::config::{self, Config};
use contract_lens::extract;
use contract_lens::migrate;
use contract_lens::models::{ContractUpload, KnowledgeInput};
use contract_lens::server;

/// Contract Lens: contract ingestion and LLM-backed analysis.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. Missing sections fall back to defaults.
#[derive(Parser)]
#[command(name = "clens", version, about = "Contract ingestion and analysis service")]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/contracts.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Start the HTTP server.
    Serve,

    /// Analyze a single file without storing it.
    Analyze {
        /// Contract file (PDF, DOCX, text or image).
        file: PathBuf,

        /// Override the MIME type guessed from the file extension.
        #[arg(long)]
        mime: Option<String>,
    },

    /// Manage the industry knowledge corpus.
    Knowledge {
        #[command(subcommand)]
        action: KnowledgeAction,
    },

    /// Delete contracts whose retention period has elapsed.
    Sweep,
}

#[derive(Subcommand)]
enum KnowledgeAction {
    /// Create an entry, or a new version of `--entry-id`.
    Add {
        #[arg(long)]
        title: String,
        #[arg(long)]
        category: String,
        /// Entry body; use `--file` to read it from disk instead.
        #[arg(long, conflicts_with = "file")]
        content: Option<String>,
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long, default_value = "cli")]
        source: String,
        #[arg(long)]
        entry_id: Option<String>,
    },
    /// List the latest entries, optionally filtered or searched.
    List {
        #[arg(long)]
        category: Option<String>,
        /// Search terms matched against title, content and tags.
        #[arg(long)]
        query: Option<String>,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

fn load(path: &Path) -> anyhow::Result<Config> {
    if path.exists() {
        config::load_config(path)
    } else {
        tracing::warn!(config = %path.display(), "config file not found, using defaults");
        let mut cfg = Config::default();
        cfg.apply_env_overrides(|name| std::env::var(name).ok());
        cfg.validate()?;
        Ok(cfg)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = load(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            let app = App::from_config(cfg).await?;
            server::run_server(app).await?;
        }
        Commands::Analyze { file, mime } => {
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let filename = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "upload".to_string());
            let mime = mime
                .or_else(|| extract::mime_from_filename(&filename).map(str::to_string))
                .unwrap_or_default();

            let app = App::from_config(cfg).await?;
            let cancel = CancellationToken::new();
            let ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    ctrl_c.cancel();
                }
            });

            let upload = ContractUpload::new(bytes, &filename, &mime);
            let report = app.orchestrator.analyze_ephemeral(&cancel, &upload).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Knowledge { action } => {
            let app = App::from_config(cfg).await?;
            let store = app.stores.knowledge.clone();
            match action {
                KnowledgeAction::Add {
                    title,
                    category,
                    content,
                    file,
                    tags,
                    source,
                    entry_id,
                } => {
                    let content = match (content, file) {
                        (Some(c), _) => c,
                        (None, Some(path)) => std::fs::read_to_string(&path)
                            .with_context(|| format!("Failed to read {}", path.display()))?,
                        (None, None) => anyhow::bail!("either --content or --file is required"),
                    };
                    let entry = store
                        .upsert_knowledge(KnowledgeInput {
                            entry_id,
                            title,
                            content,
                            category,
                            tags: tags.into_iter().collect::<BTreeSet<_>>(),
                            source,
                        })
                        .await?;
                    app.knowledge.invalidate(&entry.category).await;
                    println!(
                        "Saved {} (entry {}, version {})",
                        entry.title, entry.entry_id, entry.version
                    );
                }
                KnowledgeAction::List {
                    category,
                    query,
                    limit,
                } => {
                    let entries = match query {
                        Some(q) => store.search_knowledge(&q, category.as_deref(), limit).await?,
                        None => store.list_knowledge(category.as_deref(), limit).await?,
                    };
                    if entries.is_empty() {
                        println!("No knowledge entries.");
                    }
                    for e in entries {
                        println!(
                            "{}  v{}  [{}]  {}",
                            e.entry_id, e.version, e.category, e.title
                        );
                    }
                }
            }
        }
        Commands::Sweep => {
            let app = App::from_config(cfg).await?;
            let report = app.sweeper.sweep(chrono::Utc::now()).await?;
            println!(
                "Expired: {}  deleted: {}  blob failures: {}",
                report.expired, report.deleted, report.blob_failures
            );
        }
    }

    Ok(())
}
