//! sibyl: ask questions against your own documents.
//!
//! | Command            | Description                                      |
//! |--------------------|--------------------------------------------------|
//! | `init`             | Create the vector index for the configured model |
//! | `add <path>`       | Ingest a local text file                         |
//! | `add-url <url>`    | Fetch a URL and ingest its text                  |
//! | `search <query>`   | Show the top matching passages                   |
//! | `ask <question>`   | Run the reasoning agent, streaming its steps     |
//! | `scan`             | Dump every index entry                           |

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use sibyl::agent::ReasoningAgent;
use sibyl::config::{load_config, Config};
use sibyl::embedding::OpenAiEmbedder;
use sibyl::generation::OpenAiGenerator;
use sibyl::index::VectorIndex;
use sibyl::knowledge::KnowledgeBase;
use sibyl::models::{ReasoningStep, ToolInvocation, ToolOutcome};
use sibyl::sources;

#[derive(Parser)]
#[command(name = "sibyl", about = "Retrieval-augmented reasoning over your own documents")]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, global = true, default_value = "sibyl.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create (or validate) the vector index
    Init,
    /// Ingest a local text file
    Add {
        path: PathBuf,
        /// Stable label for the source; defaults to the file name
        #[arg(long)]
        label: Option<String>,
    },
    /// Fetch a URL and ingest its text
    AddUrl { url: String },
    /// Show the passages most similar to a query
    Search {
        query: String,
        /// Number of passages to return
        #[arg(short, long)]
        k: Option<usize>,
    },
    /// Answer a question with step-by-step reasoning and citations
    Ask { question: String },
    /// Dump every index entry
    Scan,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;

    match cli.command {
        Command::Init => {
            let index = open_index(&config).await?;
            println!(
                "index '{}' ready at {} (model {}, {} dims)",
                index.name(),
                config.index.path.display(),
                index.model(),
                index.dims()
            );
        }
        Command::Add { path, label } => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let label = label.unwrap_or_else(|| {
                path.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string())
            });
            let doc = sources::document_from_text(&label, text);
            let kb = open_kb(&config).await?;
            let chunks = kb.ingest(&doc).await?;
            println!("ingested '{label}' as {} ({chunks} chunks)", doc.id);
        }
        Command::AddUrl { url } => {
            let doc = sources::document_from_url(&config.fetch, &url).await?;
            let kb = open_kb(&config).await?;
            let chunks = kb.ingest(&doc).await?;
            println!("ingested {url} as {} ({chunks} chunks)", doc.id);
        }
        Command::Search { query, k } => {
            let kb = open_kb(&config).await?;
            let k = k.unwrap_or(config.retrieval.top_k);
            let passages = kb.retrieve(&query, k).await?;
            if passages.is_empty() {
                println!("no matches");
            }
            for (i, p) in passages.iter().enumerate() {
                println!("{}. [{:.3}] {} ({})", i + 1, p.score, p.source.origin, p.chunk_id);
                println!("   {}", p.text.trim().replace('\n', "\n   "));
            }
        }
        Command::Ask { question } => {
            let kb = Arc::new(open_kb(&config).await?);
            let generator = Arc::new(OpenAiGenerator::new(&config.generation)?);
            let agent = ReasoningAgent::new(kb, generator, config.agent);

            let (tx, mut rx) = mpsc::channel::<ReasoningStep>(16);
            let printer = tokio::spawn(async move {
                while let Some(step) = rx.recv().await {
                    render_step(&step);
                }
            });

            let answer = agent.ask_streaming(&question, tx).await?;
            printer.await.ok();

            println!("\n{}", answer.text.trim());
            if answer.budget_exhausted {
                println!("\n(step budget exhausted before the model chose to answer)");
            }
            if !answer.citations.is_empty() {
                println!("\nSources:");
                for (i, source) in answer.citations.iter().enumerate() {
                    println!("  [{}] {}", i + 1, source.origin);
                }
            }
        }
        Command::Scan => {
            let index = open_index(&config).await?;
            let entries = index.scan().await?;
            println!("{} entries in index '{}'", entries.len(), index.name());
            for entry in entries {
                println!(
                    "{}  doc={} pos={} chars={}",
                    entry.chunk_id,
                    entry.document_id,
                    entry.position,
                    entry.text.chars().count()
                );
            }
        }
    }

    Ok(())
}

async fn open_index(config: &Config) -> Result<VectorIndex> {
    Ok(VectorIndex::open(
        &config.index.path,
        &config.index.name,
        &config.embedding.model,
        config.embedding.dims,
    )
    .await?)
}

async fn open_kb(config: &Config) -> Result<KnowledgeBase> {
    let index = Arc::new(open_index(config).await?);
    let embedder = Arc::new(OpenAiEmbedder::new(&config.embedding)?);
    Ok(KnowledgeBase::new(index, embedder, config.chunking))
}

fn render_step(step: &ReasoningStep) {
    println!("step {}: {}", step.step_index + 1, step.thought.trim());
    if let Some(ToolInvocation::Retrieve { query }) = &step.tool {
        println!("  search: {query}");
    }
    match &step.tool_result {
        Some(ToolOutcome::Passages(passages)) => {
            for p in passages {
                println!("  [{:.3}] {}", p.score, p.source.origin);
            }
        }
        Some(ToolOutcome::Failed(reason)) => println!("  search failed: {reason}"),
        None => {}
    }
}
