use anyhow::{ensure, Context};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use log::{debug, info, warn};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Semaphore;

use crate::chunking::{split_into_chunks, ChunkingConfig};
use crate::config::RagConfig;
use crate::document::{load_knowledge_base, Document};
use crate::embeddings::{Embedder, OllamaEmbedder};
use crate::error::RagError;
use crate::llm::{Generator, OllamaGenerator};
use crate::store::{Chunk, ChunkStore, LoadError};

/// The heavyweight handles a ready system shares between requests
pub struct Components {
    pub generator: Arc<dyn Generator>,
    pub embedder: Arc<dyn Embedder>,
    pub store: ChunkStore,
    /// Gates concurrent calls into the generator
    pub generation_slots: Arc<Semaphore>,
}

impl fmt::Debug for Components {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Components")
            .field("embedding_dimension", &self.embedder.dimension())
            .field("chunks", &self.store.len())
            .field("generation_slots", &self.generation_slots.available_permits())
            .finish_non_exhaustive()
    }
}

/// Loads the external collaborators during initialization
#[async_trait]
pub trait ComponentLoader: Send + Sync {
    async fn load_generator(&self) -> anyhow::Result<Arc<dyn Generator>>;

    async fn load_embedder(&self) -> anyhow::Result<Arc<dyn Embedder>>;

    /// Raw documents, read only when no persisted index can be used
    async fn load_documents(&self) -> anyhow::Result<Vec<Document>>;
}

/// Loads models from a local Ollama-compatible server and documents from disk
pub struct OllamaLoader {
    config: RagConfig,
}

impl OllamaLoader {
    pub fn new(config: RagConfig) -> Self {
        OllamaLoader { config }
    }
}

#[async_trait]
impl ComponentLoader for OllamaLoader {
    async fn load_generator(&self) -> anyhow::Result<Arc<dyn Generator>> {
        let generator = OllamaGenerator::connect(&self.config.llm_url, &self.config.model).await?;
        Ok(Arc::new(generator))
    }

    async fn load_embedder(&self) -> anyhow::Result<Arc<dyn Embedder>> {
        let embedder =
            OllamaEmbedder::connect(&self.config.llm_url, &self.config.embedding_model).await?;
        Ok(Arc::new(embedder))
    }

    async fn load_documents(&self) -> anyhow::Result<Vec<Document>> {
        let dir = self.config.knowledge_base.clone();
        tokio::task::spawn_blocking(move || load_knowledge_base(dir))
            .await
            .context("Document loading task failed")?
    }
}

/// How the chunk index is located, built, and shared
#[derive(Debug, Clone)]
pub struct IndexSettings {
    pub index_path: PathBuf,
    pub chunking: ChunkingConfig,
    pub rebuild_corrupt_index: bool,
    pub max_concurrent_generations: usize,
}

impl From<&RagConfig> for IndexSettings {
    fn from(config: &RagConfig) -> Self {
        IndexSettings {
            index_path: config.index_path.clone(),
            chunking: config.chunking(),
            rebuild_corrupt_index: config.rebuild_corrupt_index,
            max_concurrent_generations: config.max_concurrent_generations,
        }
    }
}

/// Snapshot reported by health checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Readiness {
    /// An initialization attempt is running or has succeeded
    pub initialized: bool,
    /// Components are loaded and requests can be served
    pub ready: bool,
}

type InitOutcome = Shared<BoxFuture<'static, Result<Arc<Components>, RagError>>>;

enum Phase {
    Uninitialized,
    Initializing { attempt: u64, outcome: InitOutcome },
    Ready(Arc<Components>),
}

/// Owns the process-wide component lifecycle.
///
/// `Uninitialized -> Initializing -> Ready`, falling back to `Uninitialized`
/// when an attempt fails so that the next caller starts over. At most one
/// attempt runs at a time and every caller that arrives while it runs shares
/// its outcome.
pub struct Coordinator {
    loader: Arc<dyn ComponentLoader>,
    settings: Arc<IndexSettings>,
    phase: Arc<Mutex<Phase>>,
    attempts: AtomicU64,
}

impl Coordinator {
    pub fn new(loader: Arc<dyn ComponentLoader>, settings: IndexSettings) -> Self {
        Coordinator {
            loader,
            settings: Arc::new(settings),
            phase: Arc::new(Mutex::new(Phase::Uninitialized)),
            attempts: AtomicU64::new(0),
        }
    }

    /// Resolve once the components are ready, initializing them if needed
    pub async fn ensure_ready(&self) -> Result<Arc<Components>, RagError> {
        let outcome = {
            let mut phase = lock(&self.phase);
            match &*phase {
                Phase::Ready(components) => return Ok(components.clone()),
                Phase::Initializing { outcome, .. } => outcome.clone(),
                Phase::Uninitialized => {
                    let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    let outcome = self.launch(attempt);
                    *phase = Phase::Initializing {
                        attempt,
                        outcome: outcome.clone(),
                    };
                    outcome
                }
            }
        };

        outcome.await
    }

    /// Start attempt number `attempt` on the runtime. Must be called with the
    /// phase lock held so the attempt is registered before it can finish.
    fn launch(&self, attempt: u64) -> InitOutcome {
        info!("Starting initialization attempt {}", attempt);

        let loader = self.loader.clone();
        let settings = self.settings.clone();
        let phase = self.phase.clone();
        let task = tokio::spawn(async move {
            let result = initialize(loader.as_ref(), &settings).await.map(Arc::new);
            finish_attempt(&phase, attempt, &result);
            result
        });

        let phase = self.phase.clone();
        async move {
            match task.await {
                Ok(result) => result,
                Err(join_error) => {
                    let result = Err(RagError::Initialization(format!(
                        "initialization task stopped: {}",
                        join_error
                    )));
                    finish_attempt(&phase, attempt, &result);
                    result
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Non-blocking check for the `Ready` phase
    pub fn is_ready(&self) -> bool {
        matches!(&*lock(&self.phase), Phase::Ready(_))
    }

    pub fn readiness(&self) -> Readiness {
        match &*lock(&self.phase) {
            Phase::Uninitialized => Readiness {
                initialized: false,
                ready: false,
            },
            Phase::Initializing { .. } => Readiness {
                initialized: true,
                ready: false,
            },
            Phase::Ready(_) => Readiness {
                initialized: true,
                ready: true,
            },
        }
    }

    /// Components if already ready, without waiting
    pub fn components(&self) -> Option<Arc<Components>> {
        match &*lock(&self.phase) {
            Phase::Ready(components) => Some(components.clone()),
            _ => None,
        }
    }
}

fn lock(phase: &Mutex<Phase>) -> MutexGuard<'_, Phase> {
    // Transitions are single assignments, so a poisoned lock still holds a valid phase
    phase.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Move out of `Initializing`, but only if `attempt` still owns that phase
fn finish_attempt(phase: &Mutex<Phase>, attempt: u64, result: &Result<Arc<Components>, RagError>) {
    let mut phase = lock(phase);
    if !matches!(&*phase, Phase::Initializing { attempt: current, .. } if *current == attempt) {
        return;
    }

    *phase = match result {
        Ok(components) => {
            info!("Initialization attempt {} succeeded", attempt);
            Phase::Ready(components.clone())
        }
        Err(e) => {
            warn!("Initialization attempt {} failed: {}", attempt, e);
            Phase::Uninitialized
        }
    };
}

async fn initialize(
    loader: &dyn ComponentLoader,
    settings: &IndexSettings,
) -> Result<Components, RagError> {
    info!("Loading generation model");
    let generator = loader
        .load_generator()
        .await
        .map_err(RagError::initialization)?;

    info!("Loading embedding model");
    let embedder = loader
        .load_embedder()
        .await
        .map_err(RagError::initialization)?;

    let store = load_or_build_store(loader, embedder.as_ref(), settings).await?;

    if let Some(dimension) = store.dimension() {
        if dimension != embedder.dimension() {
            return Err(RagError::Initialization(format!(
                "index at {} has dimension {} but the embedding model produces {}; rebuild the index",
                settings.index_path.display(),
                dimension,
                embedder.dimension()
            )));
        }
    }

    Ok(Components {
        generator,
        embedder,
        store,
        generation_slots: Arc::new(Semaphore::new(settings.max_concurrent_generations.max(1))),
    })
}

async fn load_or_build_store(
    loader: &dyn ComponentLoader,
    embedder: &dyn Embedder,
    settings: &IndexSettings,
) -> Result<ChunkStore, RagError> {
    match ChunkStore::load(&settings.index_path) {
        Ok(store) => {
            info!(
                "Loaded index with {} chunks from {}",
                store.len(),
                settings.index_path.display()
            );
            return Ok(store);
        }
        Err(LoadError::Absent(path)) => {
            info!("No index at {}, building one from the knowledge base", path);
        }
        Err(err @ LoadError::Corrupt { .. }) if settings.rebuild_corrupt_index => {
            warn!("{}; rebuilding from the knowledge base", err);
        }
        Err(err) => return Err(RagError::Persistence(err.to_string())),
    }

    let documents = loader
        .load_documents()
        .await
        .map_err(RagError::initialization)?;
    let store = build_store(&documents, embedder, settings.chunking)
        .await
        .map_err(RagError::initialization)?;

    if store.is_empty() {
        // Leave nothing on disk so documents added later are picked up
        warn!("Knowledge base is empty, answers will rely on general knowledge");
    } else {
        store
            .persist(&settings.index_path)
            .map_err(RagError::persistence)?;
        info!("Saved index to {}", settings.index_path.display());
    }

    Ok(store)
}

/// Chunk and embed `documents` into a fresh store
pub async fn build_store(
    documents: &[Document],
    embedder: &dyn Embedder,
    chunking: ChunkingConfig,
) -> anyhow::Result<ChunkStore> {
    let mut store = ChunkStore::new();

    for document in documents {
        let pieces = split_into_chunks(&document.content, &document.document_id, chunking);
        if pieces.is_empty() {
            continue;
        }

        let texts: Vec<String> = pieces.iter().map(|piece| piece.text.clone()).collect();
        let vectors = embedder
            .embed_batch(&texts)
            .await
            .with_context(|| format!("Failed to embed {}", document.document_id))?;
        ensure!(
            vectors.len() == pieces.len(),
            "embedder returned {} vectors for {} chunks of {}",
            vectors.len(),
            pieces.len(),
            document.document_id
        );

        debug!("Embedded {} chunks from {}", pieces.len(), document.document_id);
        store.add(
            pieces
                .into_iter()
                .zip(vectors)
                .map(|(piece, vector)| Chunk {
                    text: piece.text,
                    source_id: piece.document_id,
                    vector,
                })
                .collect(),
        )?;
    }

    info!(
        "Built index with {} chunks from {} documents",
        store.len(),
        documents.len()
    );
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{StubLoader, KEYWORD_DIMENSION};
    use futures::future::join_all;
    use std::fs;
    use std::sync::atomic::Ordering;

    fn settings(dir: &tempfile::TempDir) -> IndexSettings {
        IndexSettings {
            index_path: dir.path().join("index.json"),
            chunking: ChunkingConfig {
                chunk_size: 200,
                chunk_overlap: 20,
            },
            rebuild_corrupt_index: false,
            max_concurrent_generations: 1,
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_initialization() {
        let dir = tempfile::tempdir().unwrap();
        let loader = Arc::new(StubLoader::with_documents(&[(
            "paris.txt",
            "Paris is the capital of France.",
        )]));
        let coordinator = Coordinator::new(loader.clone(), settings(&dir));

        let results = join_all((0..5).map(|_| coordinator.ensure_ready())).await;

        assert_eq!(loader.generator_loads.load(Ordering::SeqCst), 1);
        assert_eq!(loader.embedder_loads.load(Ordering::SeqCst), 1);
        assert_eq!(loader.document_loads.load(Ordering::SeqCst), 1);

        let first = results[0].as_ref().unwrap();
        for result in &results {
            assert!(Arc::ptr_eq(first, result.as_ref().unwrap()));
        }
        assert_eq!(first.store.len(), 1);
    }

    #[tokio::test]
    async fn test_failure_reaches_every_waiter_and_resets() {
        let dir = tempfile::tempdir().unwrap();
        let loader = Arc::new(StubLoader::with_documents(&[]));
        loader.fail_embedder_once();
        let coordinator = Coordinator::new(loader.clone(), settings(&dir));

        let results = join_all((0..3).map(|_| coordinator.ensure_ready())).await;

        let errors: Vec<RagError> = results.into_iter().map(|r| r.err().unwrap()).collect();
        assert!(matches!(errors[0], RagError::Initialization(_)));
        assert!(errors.iter().all(|e| *e == errors[0]));
        assert_eq!(loader.generator_loads.load(Ordering::SeqCst), 1);
        assert!(!coordinator.is_ready());
        assert_eq!(
            coordinator.readiness(),
            Readiness {
                initialized: false,
                ready: false
            }
        );

        // A later call starts a brand-new attempt
        coordinator.ensure_ready().await.unwrap();
        assert_eq!(loader.generator_loads.load(Ordering::SeqCst), 2);
        assert!(coordinator.is_ready());
    }

    #[tokio::test]
    async fn test_readiness_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = Coordinator::new(Arc::new(StubLoader::with_documents(&[])), settings(&dir));

        assert_eq!(
            coordinator.readiness(),
            Readiness {
                initialized: false,
                ready: false
            }
        );
        assert!(coordinator.components().is_none());

        coordinator.ensure_ready().await.unwrap();

        assert_eq!(
            coordinator.readiness(),
            Readiness {
                initialized: true,
                ready: true
            }
        );
        assert!(coordinator.components().is_some());
    }

    #[tokio::test]
    async fn test_ready_returns_without_reloading() {
        let dir = tempfile::tempdir().unwrap();
        let loader = Arc::new(StubLoader::with_documents(&[]));
        let coordinator = Coordinator::new(loader.clone(), settings(&dir));

        let first = coordinator.ensure_ready().await.unwrap();
        let second = coordinator.ensure_ready().await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(loader.generator_loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_built_index_is_persisted_and_reused() {
        let dir = tempfile::tempdir().unwrap();
        let documents = [("paris.txt", "Paris is the capital of France.")];

        let loader = Arc::new(StubLoader::with_documents(&documents));
        Coordinator::new(loader.clone(), settings(&dir))
            .ensure_ready()
            .await
            .unwrap();
        assert!(dir.path().join("index.json").exists());

        let reloaded = Arc::new(StubLoader::with_documents(&documents));
        let components = Coordinator::new(reloaded.clone(), settings(&dir))
            .ensure_ready()
            .await
            .unwrap();

        assert_eq!(reloaded.document_loads.load(Ordering::SeqCst), 0);
        assert_eq!(components.store.len(), 1);
        assert_eq!(components.store.dimension(), Some(KEYWORD_DIMENSION));
    }

    #[tokio::test]
    async fn test_corrupt_index_is_fatal_by_default() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.json"), "garbage").unwrap();
        let loader = Arc::new(StubLoader::with_documents(&[("a.txt", "alpha")]));
        let coordinator = Coordinator::new(loader.clone(), settings(&dir));

        let err = coordinator.ensure_ready().await.unwrap_err();

        assert!(matches!(err, RagError::Persistence(_)));
        assert_eq!(loader.document_loads.load(Ordering::SeqCst), 0);
        assert!(!coordinator.is_ready());
    }

    #[tokio::test]
    async fn test_corrupt_index_rebuilt_when_allowed() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.json"), "garbage").unwrap();
        let loader = Arc::new(StubLoader::with_documents(&[("a.txt", "alpha")]));
        let coordinator = Coordinator::new(
            loader.clone(),
            IndexSettings {
                rebuild_corrupt_index: true,
                ..settings(&dir)
            },
        );

        let components = coordinator.ensure_ready().await.unwrap();

        assert_eq!(components.store.len(), 1);
        assert!(ChunkStore::load(dir.path().join("index.json")).is_ok());
    }

    #[tokio::test]
    async fn test_index_dimension_must_match_embedder() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ChunkStore::new();
        store
            .add(vec![Chunk {
                text: "old".into(),
                source_id: "old.txt".into(),
                vector: vec![1.0, 0.0, 0.0],
            }])
            .unwrap();
        store.persist(dir.path().join("index.json")).unwrap();

        let coordinator = Coordinator::new(Arc::new(StubLoader::with_documents(&[])), settings(&dir));
        let err = coordinator.ensure_ready().await.unwrap_err();

        assert!(matches!(err, RagError::Initialization(ref m) if m.contains("dimension")));
    }

    #[tokio::test]
    async fn test_components_debug_summary() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = Coordinator::new(
            Arc::new(StubLoader::with_documents(&[("a.txt", "alpha")])),
            settings(&dir),
        );

        let components = coordinator.ensure_ready().await.unwrap();
        let summary = format!("{:?}", components);

        assert!(summary.contains("embedding_dimension: 32"));
        assert!(summary.contains("chunks: 1"));
    }

    #[tokio::test]
    async fn test_empty_knowledge_base_is_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = Coordinator::new(Arc::new(StubLoader::with_documents(&[])), settings(&dir));

        let components = coordinator.ensure_ready().await.unwrap();

        assert!(components.store.is_empty());
        assert!(!dir.path().join("index.json").exists());
    }
}
