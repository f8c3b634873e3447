//! # Retail RAG CLI (`rrag`)
//!
//! The `rrag` binary drives the sales question-answering backend: database
//! initialization, spreadsheet ingestion, one-shot questions, and the HTTP
//! server.
//!
//! ## Usage
//!
//! ```bash
//! rrag --config ./config/rrag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rrag init` | Create the chat database and run schema migrations |
//! | `rrag ingest` | Load the spreadsheet and build (or load) the vector index |
//! | `rrag ask "<question>"` | Answer one question from the command line |
//! | `rrag serve` | Start the HTTP API server |

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use retail_rag::config::{self, Config};
use retail_rag::dataset::load_dataset;
use retail_rag::documents::build_documents;
use retail_rag::embedding;
use retail_rag::generate::{Generator, OllamaGenerator};
use retail_rag::pipeline;
use retail_rag::{db, migrate, server};

/// Retail RAG CLI — retrieval-augmented answers over a sales spreadsheet.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/rrag.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "rrag",
    about = "Retail RAG — retrieval-augmented question answering over a sales spreadsheet",
    version,
    long_about = "Retail RAG loads a multi-sheet sales spreadsheet, joins and normalizes its \
    tables, embeds one text document per row into a persistent vector index, and answers \
    natural-language questions with a locally hosted LLM constrained to the retrieved context."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/rrag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the chat database schema.
    ///
    /// Creates the SQLite database file and the chat session tables.
    /// This command is idempotent — running it multiple times is safe.
    Init,

    /// Load the spreadsheet and build or load the vector index.
    ///
    /// Reads the configured `.xlsx` file, normalizes and joins the tables,
    /// renders documents, and embeds them unless a valid persisted index
    /// already exists.
    Ingest {
        /// Discard any persisted index and re-embed everything.
        #[arg(long)]
        rebuild: bool,

        /// Show table and document counts without embedding or writing.
        #[arg(long)]
        dry_run: bool,
    },

    /// Answer a single question from the command line.
    ///
    /// Builds or loads the index, retrieves the closest documents, and
    /// prints the generated answer with its sources.
    Ask {
        /// The question to answer.
        question: String,

        /// Override the number of documents to retrieve.
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Start the HTTP API server.
    ///
    /// Ingests the spreadsheet, then binds to `[server].bind` and serves
    /// the chat and index endpoints.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg.db).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { rebuild, dry_run } => {
            run_ingest(&cfg, rebuild, dry_run).await?;
        }
        Commands::Ask { question, top_k } => {
            run_ask(&cfg, &question, top_k).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}

async fn run_ingest(config: &Config, rebuild: bool, dry_run: bool) -> Result<()> {
    if dry_run {
        let dataset = load_dataset(&config.data.spreadsheet, &config.columns)?;
        let documents = build_documents(&dataset);
        println!(
            "Dry run: {} products, {} customers, {} sales rows ({} joined)",
            dataset.products.rows.len(),
            dataset.customers.rows.len(),
            dataset.sales.rows.len(),
            dataset.joined.rows.len(),
        );
        println!("Would index {} documents.", documents.len());
        return Ok(());
    }

    let embedder = embedding::create_provider(&config.embedding)?;
    let generator: Arc<dyn Generator> = Arc::new(OllamaGenerator::new(&config.generation)?);

    let engine = pipeline::build_engine(config, embedder, generator, rebuild).await?;
    println!(
        "Ingest complete: {} documents indexed under {}.",
        engine.document_count(),
        config.index.dir.display(),
    );
    Ok(())
}

async fn run_ask(config: &Config, question: &str, top_k: Option<usize>) -> Result<()> {
    let mut config = config.clone();
    if let Some(k) = top_k {
        config.index.top_k = k;
    }

    let embedder = embedding::create_provider(&config.embedding)?;
    let generator: Arc<dyn Generator> = Arc::new(OllamaGenerator::new(&config.generation)?);

    let engine = pipeline::build_engine(&config, embedder, generator, false).await?;
    let answer = engine.answer(question, &[]).await?;

    println!("{}", answer.answer);
    if !answer.sources.is_empty() {
        println!();
        println!("Sources:");
        for source in &answer.sources {
            println!("  [{}] {}", source.kind.as_str(), source.id);
        }
    }
    Ok(())
}
