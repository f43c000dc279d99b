use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures_util::{StreamExt, pin_mut};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use storyloom::config::EngineConfig;
use storyloom::embedding::{InMemoryVectorStore, KnowledgeDocument, OpenAiEmbedding, chunk_text};
use storyloom::llm::{ChatBackendFactory, HttpChatFactory};
use storyloom::{EngineRequest, PipelineOrchestrator, UserTier};

/// `Storyloom` - retrieval-augmented creative writing engine.
#[derive(Parser, Debug)]
#[command(name = "storyloom")]
#[command(version)]
#[command(about = "Generate prose grounded in a knowledge base.", long_about = None)]
pub struct Cli {
    /// Path to config.toml (default: ~/.storyloom/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Subscription tier (free, regular, vip)
    #[arg(long, global = true, default_value = "free")]
    pub tier: UserTier,

    /// Directory of .md/.txt files indexed before the command runs
    #[arg(long, global = true)]
    pub knowledge: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate one passage and print the full response as JSON
    Generate {
        query: String,

        /// JSON file with request context (characters, setting, history, ...)
        #[arg(long)]
        context: Option<PathBuf>,
    },

    /// Generate one passage, printing text as it arrives
    Stream {
        query: String,

        #[arg(long)]
        context: Option<PathBuf>,
    },

    /// Run a JSON array of requests and print the responses in order
    Batch { file: PathBuf },

    /// Probe embedding and every configured model
    Health,

    /// Split a file into embedding chunks and print them
    Chunk {
        file: PathBuf,

        /// Max characters per chunk (default: engine.chunk_size)
        #[arg(long)]
        max: Option<usize>,
    },
}

pub async fn run(cli: Cli) -> Result<()> {
    let config = EngineConfig::load_or_default(cli.config.as_deref())?;

    let knowledge = cli.knowledge.as_deref();

    match cli.command {
        Commands::Generate { query, context } => {
            let orchestrator = build_orchestrator(&config, knowledge).await?;
            let request = build_request(query, context.as_deref()).await?;
            let response = orchestrator.generate(&request, cli.tier).await;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Stream { query, context } => {
            let orchestrator = build_orchestrator(&config, knowledge).await?;
            let request = build_request(query, context.as_deref()).await?;
            let chunks = orchestrator.generate_stream(request, cli.tier);
            pin_mut!(chunks);
            let mut stdout = std::io::stdout();
            while let Some(chunk) = chunks.next().await {
                if let Some(error) = chunk.error {
                    eprintln!("\n{error}");
                    break;
                }
                write!(stdout, "{}", chunk.content)?;
                stdout.flush()?;
            }
            writeln!(stdout)?;
        }
        Commands::Batch { file } => {
            let orchestrator = build_orchestrator(&config, knowledge).await?;
            let raw = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let requests: Vec<EngineRequest> =
                serde_json::from_str(&raw).context("batch file must be a JSON array of requests")?;
            let responses = orchestrator.generate_batch(&requests, cli.tier).await;
            println!("{}", serde_json::to_string_pretty(&responses)?);
        }
        Commands::Health => {
            let orchestrator = build_orchestrator(&config, knowledge).await?;
            let report = orchestrator.get_health_status().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Chunk { file, max } => {
            let content = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let max = max.unwrap_or(config.engine.chunk_size);
            for (index, chunk) in chunk_text(&content, max).iter().enumerate() {
                println!("--- chunk {index} ({} chars)", chunk.chars().count());
                println!("{chunk}");
            }
        }
    }
    Ok(())
}

async fn build_request(query: String, context: Option<&Path>) -> Result<EngineRequest> {
    let request = EngineRequest::new(query);
    let Some(path) = context else {
        return Ok(request);
    };
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let context = serde_json::from_str(&raw).context("invalid request context JSON")?;
    Ok(request.with_context(context))
}

/// HTTP chat and embedding adapters over an in-process vector store.
async fn build_orchestrator(
    config: &EngineConfig,
    knowledge: Option<&Path>,
) -> Result<PipelineOrchestrator> {
    let factory = HttpChatFactory {
        max_retries: config.chat.max_retries,
        backoff_ms: config.chat.backoff_ms,
    };
    let default_chat = factory
        .create("default", &config.chat.as_model_config())
        .context("chat.api_key is not set (config file or STORYLOOM_API_KEY)")?;

    let embedding_key = config
        .embedding
        .api_key
        .as_deref()
        .or(config.chat.api_key.as_deref())
        .context("embedding.api_key is not set")?;
    let embedding = Arc::new(OpenAiEmbedding::new(
        &config.embedding.base_url,
        embedding_key,
        &config.embedding.model,
        config.embedding.dimensions,
    ));

    let store = Arc::new(InMemoryVectorStore::new());
    let orchestrator = PipelineOrchestrator::builder(default_chat, embedding, store.clone())
        .config(config)
        .keyword_search(store)
        .build()?;

    if let Some(dir) = knowledge {
        index_directory(&orchestrator, dir, config.engine.chunk_size).await?;
    }
    Ok(orchestrator)
}

async fn index_directory(
    orchestrator: &PipelineOrchestrator,
    dir: &Path,
    chunk_size: usize,
) -> Result<()> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("failed to read {}", dir.display()))?;
    let mut indexed = 0usize;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_text = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| matches!(e, "md" | "txt"));
        if !is_text {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let content = tokio::fs::read_to_string(&path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let doc = KnowledgeDocument::new(stem, content)
            .with_meta("source_type", "knowledge")
            .with_meta("source_name", file_name);

        match orchestrator.embeddings().index_document(&doc, chunk_size).await {
            Ok(chunks) => indexed += chunks,
            Err(e) => tracing::warn!(path = %path.display(), "skipping knowledge file: {e}"),
        }
    }

    tracing::info!(chunks = indexed, dir = %dir.display(), "knowledge indexed");
    Ok(())
}
