use anyhow::{ensure, Result};
use clap::Args;
use std::path::PathBuf;

use crate::chunking::ChunkingConfig;
use crate::llm::GenerationOptions;

pub const DEFAULT_LLM_URL: &str = "http://localhost:11434";
pub const DEFAULT_MODEL: &str = "llama3.2";
pub const DEFAULT_EMBEDDING_MODEL: &str = "nomic-embed-text";
pub const DEFAULT_KNOWLEDGE_BASE: &str = "knowledge_base";
pub const DEFAULT_INDEX_PATH: &str = "data/index.json";
pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;
pub const DEFAULT_TOP_K: usize = 3;
pub const DEFAULT_MAX_TOKENS: u32 = 512;
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_TOP_P: f32 = 0.9;
pub const DEFAULT_SAMPLING_TOP_K: u32 = 40;

/// Settings shared by every subcommand
#[derive(Args, Debug, Clone)]
pub struct RagConfig {
    /// Base URL of the local inference server
    #[arg(long, env = "RAG_LLM_URL", default_value = DEFAULT_LLM_URL)]
    pub llm_url: String,

    /// Generation model served by the inference server
    #[arg(long, env = "RAG_MODEL", default_value = DEFAULT_MODEL)]
    pub model: String,

    /// Embedding model identifier
    #[arg(long, env = "RAG_EMBEDDING_MODEL", default_value = DEFAULT_EMBEDDING_MODEL)]
    pub embedding_model: String,

    /// Directory holding the documents to index (text and PDF)
    #[arg(long, env = "RAG_KNOWLEDGE_BASE", default_value = DEFAULT_KNOWLEDGE_BASE)]
    pub knowledge_base: PathBuf,

    /// Where the chunk index is persisted
    #[arg(long, env = "RAG_INDEX_PATH", default_value = DEFAULT_INDEX_PATH)]
    pub index_path: PathBuf,

    /// Chunk size in characters
    #[arg(long, env = "RAG_CHUNK_SIZE", default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,

    /// Characters shared between consecutive chunks
    #[arg(long, env = "RAG_CHUNK_OVERLAP", default_value_t = DEFAULT_CHUNK_OVERLAP)]
    pub chunk_overlap: usize,

    /// Number of chunks retrieved when a request does not say
    #[arg(long, env = "RAG_TOP_K", default_value_t = DEFAULT_TOP_K)]
    pub top_k: usize,

    /// Upper bound on generated tokens per answer
    #[arg(long, env = "RAG_MAX_TOKENS", default_value_t = DEFAULT_MAX_TOKENS)]
    pub max_tokens: u32,

    #[arg(long, env = "RAG_TEMPERATURE", default_value_t = DEFAULT_TEMPERATURE)]
    pub temperature: f32,

    #[arg(long, env = "RAG_TOP_P", default_value_t = DEFAULT_TOP_P)]
    pub top_p: f32,

    #[arg(long, env = "RAG_SAMPLING_TOP_K", default_value_t = DEFAULT_SAMPLING_TOP_K)]
    pub sampling_top_k: u32,

    /// How many generations may run against the inference server at once
    #[arg(long, env = "RAG_MAX_CONCURRENT_GENERATIONS", default_value_t = 1)]
    pub max_concurrent_generations: usize,

    /// Rebuild the index instead of failing when the persisted one is unreadable
    #[arg(long, env = "RAG_REBUILD_CORRUPT_INDEX")]
    pub rebuild_corrupt_index: bool,
}

impl Default for RagConfig {
    fn default() -> Self {
        RagConfig {
            llm_url: DEFAULT_LLM_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            knowledge_base: PathBuf::from(DEFAULT_KNOWLEDGE_BASE),
            index_path: PathBuf::from(DEFAULT_INDEX_PATH),
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            top_k: DEFAULT_TOP_K,
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            sampling_top_k: DEFAULT_SAMPLING_TOP_K,
            max_concurrent_generations: 1,
            rebuild_corrupt_index: false,
        }
    }
}

impl RagConfig {
    /// Reject settings the pipeline cannot honour
    pub fn validate(&self) -> Result<()> {
        ensure!(self.chunk_size > 0, "chunk size must be positive");
        ensure!(
            self.chunk_overlap < self.chunk_size,
            "chunk overlap ({}) must be smaller than chunk size ({})",
            self.chunk_overlap,
            self.chunk_size
        );
        ensure!(self.top_k >= 1, "top-k must be at least 1");
        ensure!(
            self.max_concurrent_generations >= 1,
            "max concurrent generations must be at least 1"
        );
        Ok(())
    }

    pub fn chunking(&self) -> ChunkingConfig {
        ChunkingConfig {
            chunk_size: self.chunk_size,
            chunk_overlap: self.chunk_overlap,
        }
    }

    pub fn generation(&self) -> GenerationOptions {
        GenerationOptions {
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: self.sampling_top_k,
        }
    }
}
