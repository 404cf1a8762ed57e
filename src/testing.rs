//! Deterministic collaborators for unit tests.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::coordinator::ComponentLoader;
use crate::document::Document;
use crate::embeddings::Embedder;
use crate::llm::{GenerationOptions, Generator};

pub const KEYWORD_DIMENSION: usize = 32;

/// Bag-of-words vectors: each lowercase word bumps one hashed bucket
pub struct KeywordEmbedder {
    pub calls: AtomicUsize,
}

impl KeywordEmbedder {
    pub fn new() -> Self {
        KeywordEmbedder {
            calls: AtomicUsize::new(0),
        }
    }
}

fn bucket(word: &str) -> usize {
    // FNV-1a
    let hash = word
        .bytes()
        .fold(0xcbf29ce484222325u64, |h, b| (h ^ b as u64).wrapping_mul(0x100000001b3));
    (hash % KEYWORD_DIMENSION as u64) as usize
}

#[async_trait]
impl Embedder for KeywordEmbedder {
    fn dimension(&self) -> usize {
        KEYWORD_DIMENSION
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut vector = vec![0.0; KEYWORD_DIMENSION];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            vector[bucket(&word.to_lowercase())] += 1.0;
        }
        Ok(vector)
    }
}

/// Replays a fixed list of tokens
pub struct ScriptedGenerator {
    tokens: Vec<String>,
    failure: Option<String>,
    pub calls: AtomicUsize,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn new(tokens: &[&str]) -> Self {
        ScriptedGenerator {
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            failure: None,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Emit every token, then fail with `message`
    pub fn failing(tokens: &[&str], message: &str) -> Self {
        ScriptedGenerator {
            failure: Some(message.to_string()),
            ..ScriptedGenerator::new(tokens)
        }
    }

    fn record(&self, prompt: &str) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.prompts.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, prompt: &str, _options: &GenerationOptions) -> Result<String> {
        self.record(prompt);
        if let Some(message) = &self.failure {
            bail!("{}", message);
        }
        Ok(self.tokens.concat())
    }

    async fn generate_streaming(
        &self,
        prompt: &str,
        _options: &GenerationOptions,
        on_token: &mut (dyn FnMut(String) + Send),
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.record(prompt);
        for token in &self.tokens {
            if cancel.is_cancelled() {
                return Ok(());
            }
            on_token(token.clone());
            tokio::task::yield_now().await;
        }
        if let Some(message) = &self.failure {
            bail!("{}", message);
        }
        Ok(())
    }
}

/// Counts every load and can be told to fail once
pub struct StubLoader {
    documents: Vec<Document>,
    pub generator: Arc<ScriptedGenerator>,
    pub generator_loads: AtomicUsize,
    pub embedder_loads: AtomicUsize,
    pub document_loads: AtomicUsize,
    fail_embedder: AtomicBool,
}

impl StubLoader {
    pub fn with_documents(documents: &[(&str, &str)]) -> Self {
        StubLoader {
            documents: documents
                .iter()
                .map(|(id, content)| Document {
                    content: content.to_string(),
                    document_id: id.to_string(),
                    mime_type: "text/plain".to_string(),
                })
                .collect(),
            generator: Arc::new(ScriptedGenerator::new(&["ok"])),
            generator_loads: AtomicUsize::new(0),
            embedder_loads: AtomicUsize::new(0),
            document_loads: AtomicUsize::new(0),
            fail_embedder: AtomicBool::new(false),
        }
    }

    pub fn fail_embedder_once(&self) {
        self.fail_embedder.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ComponentLoader for StubLoader {
    async fn load_generator(&self) -> Result<Arc<dyn Generator>> {
        self.generator_loads.fetch_add(1, Ordering::SeqCst);
        // Long enough for concurrent callers to pile up behind the attempt
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(self.generator.clone())
    }

    async fn load_embedder(&self) -> Result<Arc<dyn Embedder>> {
        self.embedder_loads.fetch_add(1, Ordering::SeqCst);
        if self.fail_embedder.swap(false, Ordering::SeqCst) {
            bail!("embedding model file missing");
        }
        Ok(Arc::new(KeywordEmbedder::new()))
    }

    async fn load_documents(&self) -> Result<Vec<Document>> {
        self.document_loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.documents.clone())
    }
}
