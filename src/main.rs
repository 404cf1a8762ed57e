use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use futures::StreamExt;
use log::{error, info};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::Arc;

use local_rag::config::RagConfig;
use local_rag::coordinator::{build_store, ComponentLoader, Coordinator, IndexSettings, OllamaLoader};
use local_rag::rag::{PipelineSettings, RagPipeline};
use local_rag::server::{self, AppState};

/// Answer questions about a local document collection with a locally hosted model
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(flatten)]
    config: RagConfig,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server
    Serve {
        /// Address to listen on
        #[arg(long, env = "RAG_BIND", default_value = "127.0.0.1:3000")]
        bind: SocketAddr,

        /// Start initializing models and index immediately instead of on first request
        #[arg(long)]
        warm_up: bool,
    },
    /// Answer a single question, streaming the answer to stdout
    Ask {
        query: String,

        /// Number of chunks to retrieve (defaults to the configured top-k)
        #[arg(long = "top-k")]
        top_k: Option<usize>,
    },
    /// Ask questions interactively
    Chat,
    /// Rebuild the index from the knowledge base and save it
    Index,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize environment
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    args.config.validate().context("Invalid configuration")?;

    let config = args.config;
    let loader: Arc<dyn ComponentLoader> = Arc::new(OllamaLoader::new(config.clone()));
    let coordinator = Arc::new(Coordinator::new(loader.clone(), IndexSettings::from(&config)));
    let settings = PipelineSettings::from(&config);

    match args.command {
        Command::Serve { bind, warm_up } => {
            if warm_up {
                let coordinator = coordinator.clone();
                tokio::spawn(async move {
                    if let Err(e) = coordinator.ensure_ready().await {
                        error!("Warm-up failed: {}", e);
                    }
                });
            }

            server::serve(
                bind,
                AppState {
                    coordinator,
                    settings,
                },
            )
            .await
        }
        Command::Ask { query, top_k } => {
            let pipeline = ready_pipeline(&coordinator, settings).await?;
            stream_answer(&pipeline, &query, top_k).await
        }
        Command::Chat => {
            let pipeline = ready_pipeline(&coordinator, settings).await?;
            run_query_loop(&pipeline).await
        }
        Command::Index => reindex(loader.as_ref(), &config).await,
    }
}

async fn ready_pipeline(coordinator: &Coordinator, settings: PipelineSettings) -> Result<RagPipeline> {
    let components = coordinator.ensure_ready().await?;
    Ok(RagPipeline::new(components, settings))
}

/// Print tokens as they arrive
async fn stream_answer(pipeline: &RagPipeline, query: &str, top_k: Option<usize>) -> Result<()> {
    let mut tokens = pipeline.answer_stream(query, top_k).await?;
    let mut stdout = io::stdout();

    while let Some(token) = tokens.next().await {
        write!(stdout, "{}", token?)?;
        stdout.flush()?;
    }
    writeln!(stdout)?;
    Ok(())
}

/// Run the interactive question loop
async fn run_query_loop(pipeline: &RagPipeline) -> Result<()> {
    info!("Ready to answer questions. Type 'exit' to quit.");

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut buffer = String::new();

    loop {
        print!("\nYour question: ");
        stdout.flush()?;

        buffer.clear();
        if stdin.read_line(&mut buffer)? == 0 {
            break;
        }

        let question = buffer.trim();
        if question.eq_ignore_ascii_case("exit") {
            info!("Goodbye!");
            break;
        }
        if question.is_empty() {
            continue;
        }

        if let Err(e) = stream_answer(pipeline, question, None).await {
            error!("{:#}", e);
        }
    }

    Ok(())
}

/// Administrative re-index; run it while no server is answering queries
async fn reindex(loader: &dyn ComponentLoader, config: &RagConfig) -> Result<()> {
    let embedder = loader.load_embedder().await?;
    let documents = loader.load_documents().await?;

    let store = build_store(&documents, embedder.as_ref(), config.chunking()).await?;
    store
        .persist(&config.index_path)
        .with_context(|| format!("Failed to save index to {}", config.index_path.display()))?;

    info!(
        "Indexed {} chunks from {} documents into {}",
        store.len(),
        documents.len(),
        config.index_path.display()
    );
    Ok(())
}
