use anyhow::{bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::Path;
use thiserror::Error;

const INDEX_FORMAT_VERSION: u32 = 1;

/// A span of source text and its embedding. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub text: String,
    pub source_id: String,
    pub vector: Vec<f32>,
}

/// A chunk returned by [`ChunkStore::query`] with its cosine similarity
#[derive(Debug, Clone, Copy)]
pub struct ScoredChunk<'a> {
    pub chunk: &'a Chunk,
    pub score: f32,
}

/// Why a persisted index could not be loaded
#[derive(Debug, Error)]
pub enum LoadError {
    /// Nothing has been persisted at this location yet
    #[error("no index found at {0}")]
    Absent(String),

    /// A file exists but does not hold a valid index
    #[error("index at {path} is corrupt: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("failed to read index at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    dimension: Option<usize>,
    chunks: Vec<Chunk>,
}

/// In-memory chunk index searched by cosine similarity.
///
/// All chunks share one dimension, fixed by the first chunk added. Vector norms
/// are cached beside the chunks and re-derived whenever chunks are added.
#[derive(Debug, Default)]
pub struct ChunkStore {
    dimension: Option<usize>,
    chunks: Vec<Chunk>,
    norms: Vec<f32>,
}

impl ChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Embedding dimension, `None` while the store is empty
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Append chunks. Fails without modifying the store if any vector does not
    /// match the store dimension.
    pub fn add(&mut self, chunks: Vec<Chunk>) -> Result<()> {
        let mut dimension = self.dimension;
        for chunk in &chunks {
            ensure!(!chunk.vector.is_empty(), "chunk from {} has an empty vector", chunk.source_id);
            ensure!(
                is_finite(&chunk.vector),
                "chunk from {} has a non-finite vector component",
                chunk.source_id
            );
            match dimension {
                Some(d) => ensure!(
                    chunk.vector.len() == d,
                    "chunk from {} has dimension {}, store has {}",
                    chunk.source_id,
                    chunk.vector.len(),
                    d
                ),
                None => dimension = Some(chunk.vector.len()),
            }
        }

        self.dimension = dimension;
        self.chunks.extend(chunks);
        self.norms = self.chunks.iter().map(|c| norm(&c.vector)).collect();
        Ok(())
    }

    /// Top-`k` chunks by descending similarity, ties kept in insertion order
    pub fn query(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredChunk<'_>>> {
        if k == 0 || self.chunks.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(d) = self.dimension {
            ensure!(
                vector.len() == d,
                "query vector has dimension {}, store has {}",
                vector.len(),
                d
            );
        }

        ensure!(is_finite(vector), "query vector has a non-finite component");

        let query_norm = norm(vector);
        let mut scored: Vec<ScoredChunk<'_>> = self
            .chunks
            .iter()
            .zip(&self.norms)
            .map(|(chunk, &chunk_norm)| ScoredChunk {
                chunk,
                score: cosine(vector, query_norm, &chunk.vector, chunk_norm),
            })
            .collect();

        // Stable sort keeps insertion order among equal scores
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(k);
        Ok(scored)
    }

    /// Write the store to `path`, replacing any previous index atomically
    pub fn persist<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create index directory {}", parent.display()))?;
        }

        let tmp_path = path.with_extension("tmp");
        let file = fs::File::create(&tmp_path)
            .with_context(|| format!("Failed to create {}", tmp_path.display()))?;
        let mut writer = BufWriter::new(file);
        let index = IndexFile {
            version: INDEX_FORMAT_VERSION,
            dimension: self.dimension,
            chunks: self.chunks.clone(),
        };
        serde_json::to_writer(&mut writer, &index)
            .with_context(|| format!("Failed to serialize index to {}", tmp_path.display()))?;
        writer
            .flush()
            .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
        drop(writer);

        fs::rename(&tmp_path, path)
            .with_context(|| format!("Failed to move index into place at {}", path.display()))?;
        Ok(())
    }

    /// Read a store persisted by [`ChunkStore::persist`]
    pub fn load<P: AsRef<Path>>(path: P) -> std::result::Result<Self, LoadError> {
        let path = path.as_ref();
        let display = path.display().to_string();

        let file = match fs::File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(LoadError::Absent(display)),
            Err(source) => return Err(LoadError::Io { path: display, source }),
        };

        let index: IndexFile = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            if e.is_io() {
                LoadError::Io {
                    path: display.clone(),
                    source: e.into(),
                }
            } else {
                LoadError::Corrupt {
                    path: display.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        Self::from_index(index).map_err(|e| LoadError::Corrupt {
            path: display,
            reason: format!("{:#}", e),
        })
    }

    fn from_index(index: IndexFile) -> Result<Self> {
        if index.version != INDEX_FORMAT_VERSION {
            bail!("unsupported index version {}", index.version);
        }

        let mut store = ChunkStore::new();
        store.add(index.chunks)?;
        if let (Some(declared), Some(actual)) = (index.dimension, store.dimension) {
            ensure!(
                declared == actual,
                "declared dimension {} does not match chunk dimension {}",
                declared,
                actual
            );
        }
        Ok(store)
    }
}

fn is_finite(vector: &[f32]) -> bool {
    vector.iter().all(|v| v.is_finite())
}

fn norm(vector: &[f32]) -> f32 {
    vector.iter().map(|v| v * v).sum::<f32>().sqrt()
}

fn cosine(a: &[f32], a_norm: f32, b: &[f32], b_norm: f32) -> f32 {
    if a_norm == 0.0 || b_norm == 0.0 {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    dot / (a_norm * b_norm)
}
