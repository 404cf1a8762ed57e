use log::debug;
use std::sync::Arc;

use crate::config::RagConfig;
use crate::coordinator::Components;
use crate::error::RagError;
use crate::llm::GenerationOptions;
use crate::prompt::Prompt;
use crate::stream::TokenStream;

/// Per-request defaults applied by the pipeline
#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub default_top_k: usize,
    pub generation: GenerationOptions,
}

impl From<&RagConfig> for PipelineSettings {
    fn from(config: &RagConfig) -> Self {
        PipelineSettings {
            default_top_k: config.top_k,
            generation: config.generation(),
        }
    }
}

impl PipelineSettings {
    /// The requested chunk count, or the configured default
    pub fn resolve_top_k(&self, requested: Option<usize>) -> Result<usize, RagError> {
        match requested {
            Some(0) => Err(RagError::InvalidInput("topK must be at least 1".to_string())),
            Some(k) => Ok(k),
            None => Ok(self.default_top_k),
        }
    }
}

/// Trim a query, rejecting one that is empty or only whitespace
pub fn validate_query(query: &str) -> Result<&str, RagError> {
    let query = query.trim();
    if query.is_empty() {
        return Err(RagError::InvalidInput("query must not be empty".to_string()));
    }
    Ok(query)
}

/// RAG (Retrieval-Augmented Generation) pipeline over ready components
pub struct RagPipeline {
    components: Arc<Components>,
    settings: PipelineSettings,
}

impl RagPipeline {
    pub fn new(components: Arc<Components>, settings: PipelineSettings) -> Self {
        RagPipeline {
            components,
            settings,
        }
    }

    /// Validate the request, retrieve the top chunks, and assemble the prompt
    pub async fn prepare(&self, query: &str, top_k: Option<usize>) -> Result<Prompt, RagError> {
        let query = validate_query(query)?;
        let k = self.settings.resolve_top_k(top_k)?;

        let vector = self
            .components
            .embedder
            .embed(query)
            .await
            .map_err(RagError::retrieval)?;
        let retrieved = self
            .components
            .store
            .query(&vector, k)
            .map_err(RagError::retrieval)?;
        debug!("Retrieved {} of {} requested chunks", retrieved.len(), k);

        Ok(Prompt::assemble(query, &retrieved))
    }

    /// Answer `query` in one piece
    pub async fn answer(&self, query: &str, top_k: Option<usize>) -> Result<String, RagError> {
        let prompt = self.prepare(query, top_k).await?.render();

        let _slot = self
            .components
            .generation_slots
            .acquire()
            .await
            .map_err(|e| RagError::Generation(e.to_string()))?;
        self.components
            .generator
            .generate(&prompt, &self.settings.generation)
            .await
            .map_err(RagError::generation)
    }

    /// Answer `query` as a stream of tokens whose concatenation is the answer.
    ///
    /// Retrieval happens before this returns; generation runs in the
    /// background and is cancelled when the stream is dropped.
    pub async fn answer_stream(
        &self,
        query: &str,
        top_k: Option<usize>,
    ) -> Result<TokenStream, RagError> {
        let prompt = self.prepare(query, top_k).await?.render();
        let generator = self.components.generator.clone();
        let slots = self.components.generation_slots.clone();
        let options = self.settings.generation;

        Ok(TokenStream::spawn(move |sink| async move {
            let _slot = slots
                .acquire_owned()
                .await
                .map_err(|e| RagError::Generation(e.to_string()))?;

            let cancel = sink.cancellation().clone();
            let mut on_token = |token: String| sink.push(token);
            generator
                .generate_streaming(&prompt, &options, &mut on_token, &cancel)
                .await
                .map_err(RagError::generation)
        }))
    }
}
