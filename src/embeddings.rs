use anyhow::{anyhow, ensure, Context, Result};
use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};

/// Turns text into fixed-dimension vectors
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Length of every vector this embedder produces
    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed several texts, preserving order
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed(text).await?);
        }
        Ok(vectors)
    }
}

/// Embedding client for a local Ollama-compatible server
#[derive(Clone)]
pub struct OllamaEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dimension: usize,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize, Debug)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl OllamaEmbedder {
    /// Connect to the server and learn the model's dimension from a probe
    pub async fn connect(base_url: &str, model: &str) -> Result<Self> {
        let mut embedder = OllamaEmbedder {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            dimension: 0,
        };

        let probe = embedder
            .request(&["dimension probe".to_string()])
            .await
            .with_context(|| format!("Failed to load embedding model {}", model))?;
        let dimension = probe
            .first()
            .map(Vec::len)
            .ok_or_else(|| anyhow!("embedding model {} returned no vectors", model))?;
        ensure!(dimension > 0, "embedding model {} returned an empty vector", model);

        info!("Embedding model {} ready (dimension {})", model, dimension);
        embedder.dimension = dimension;
        Ok(embedder)
    }

    async fn request(&self, input: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/api/embed", self.base_url);
        let request = EmbedRequest {
            model: &self.model,
            input,
        };

        let response = self.client.post(&url).json(&request).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow!("Embedding request failed: {} {}", status, error_text));
        }

        let response_data: EmbedResponse = response.json().await?;
        ensure!(
            response_data.embeddings.len() == input.len(),
            "expected {} embeddings, got {}",
            input.len(),
            response_data.embeddings.len()
        );
        Ok(response_data.embeddings)
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        ensure!(
            self.dimension == 0 || vector.len() == self.dimension,
            "embedding model {} returned dimension {}, expected {}",
            self.model,
            vector.len(),
            self.dimension
        );
        Ok(())
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let vector = self
            .request(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| anyhow!("No embedding returned"))?;
        self.check_dimension(&vector)?;
        Ok(vector)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = self.request(texts).await?;
        for vector in &vectors {
            self.check_dimension(vector)?;
        }
        Ok(vectors)
    }
}
