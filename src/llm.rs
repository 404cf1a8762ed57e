use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Sampling settings for one generation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationOptions {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
}

/// Produces answer text for a fully assembled prompt
#[async_trait]
pub trait Generator: Send + Sync {
    /// Generate the whole response at once
    async fn generate(&self, prompt: &str, options: &GenerationOptions) -> Result<String>;

    /// Generate the response as ordered fragments handed to `on_token`.
    ///
    /// Resolves once generation is complete; `on_token` is never called after
    /// that. Implementations should stop early when `cancel` is raised.
    async fn generate_streaming(
        &self,
        prompt: &str,
        options: &GenerationOptions,
        on_token: &mut (dyn FnMut(String) + Send),
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// Client for a locally hosted Ollama-compatible inference server
#[derive(Clone)]
pub struct OllamaGenerator {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: ModelOptions,
}

#[derive(Serialize)]
struct ModelOptions {
    num_predict: u32,
    temperature: f32,
    top_p: f32,
    top_k: u32,
}

impl From<&GenerationOptions> for ModelOptions {
    fn from(options: &GenerationOptions) -> Self {
        ModelOptions {
            num_predict: options.max_tokens,
            temperature: options.temperature,
            top_p: options.top_p,
            top_k: options.top_k,
        }
    }
}

#[derive(Deserialize, Debug, Default)]
struct GenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize, Debug)]
struct TagsResponse {
    models: Vec<ModelTag>,
}

#[derive(Deserialize, Debug)]
struct ModelTag {
    name: String,
}

impl OllamaGenerator {
    /// Connect to the server and make sure `model` is installed there
    pub async fn connect(base_url: &str, model: &str) -> Result<Self> {
        let generator = OllamaGenerator {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        };

        let url = format!("{}/api/tags", generator.base_url);
        let response = generator
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Inference server unreachable at {}", generator.base_url))?;
        let tags: TagsResponse = response
            .error_for_status()?
            .json()
            .await
            .context("Failed to list installed models")?;

        if !tags.models.iter().any(|tag| model_matches(&tag.name, model)) {
            bail!(
                "model {} is not installed on {}; pull it first (ollama pull {})",
                model,
                generator.base_url,
                model
            );
        }

        info!("Generation model {} ready", model);
        Ok(generator)
    }

    async fn send(&self, prompt: &str, options: &GenerationOptions, stream: bool) -> Result<reqwest::Response> {
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream,
            options: options.into(),
        };

        let url = format!("{}/api/generate", self.base_url);
        let response = self.client.post(&url).json(&request).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow!("Generation request failed: {} {}", status, error_text));
        }

        Ok(response)
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    async fn generate(&self, prompt: &str, options: &GenerationOptions) -> Result<String> {
        let response = self.send(prompt, options, false).await?;
        let response_data: GenerateChunk = response.json().await?;

        if let Some(error) = response_data.error {
            bail!("inference server error: {}", error);
        }
        Ok(response_data.response)
    }

    async fn generate_streaming(
        &self,
        prompt: &str,
        options: &GenerationOptions,
        on_token: &mut (dyn FnMut(String) + Send),
        cancel: &CancellationToken,
    ) -> Result<()> {
        let response = self.send(prompt, options, true).await?;
        let mut body = Box::pin(response.bytes_stream());
        let mut lines = LineBuffer::default();

        loop {
            // Dropping the response closes the connection, which stops the server
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Generation cancelled by consumer");
                    return Ok(());
                }
                next = body.next() => next,
            };

            let Some(bytes) = next else { break };
            let bytes = bytes.context("Failed to read generation stream")?;

            for line in lines.push(&bytes) {
                if let Some(chunk) = parse_stream_line(&line)? {
                    if !chunk.response.is_empty() {
                        on_token(chunk.response);
                    }
                    if chunk.done {
                        return Ok(());
                    }
                }
            }
        }

        // A final object may arrive without its trailing newline
        if let Some(line) = lines.finish() {
            if let Some(chunk) = parse_stream_line(&line)? {
                if !chunk.response.is_empty() {
                    on_token(chunk.response);
                }
                if chunk.done {
                    return Ok(());
                }
            }
        }

        bail!("generation stream ended before the model finished")
    }
}

fn model_matches(installed: &str, wanted: &str) -> bool {
    installed == wanted
        || installed
            .strip_prefix(wanted)
            .is_some_and(|tag| tag.starts_with(':') && !wanted.contains(':'))
}

/// Splits a byte stream into newline-terminated lines
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line[..pos]).into_owned());
        }
        lines
    }

    fn finish(self) -> Option<String> {
        if self.pending.iter().all(u8::is_ascii_whitespace) {
            None
        } else {
            Some(String::from_utf8_lossy(&self.pending).into_owned())
        }
    }
}

fn parse_stream_line(line: &str) -> Result<Option<GenerateChunk>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let chunk: GenerateChunk = serde_json::from_str(line)
        .with_context(|| format!("Malformed generation stream line: {}", line))?;
    if let Some(error) = &chunk.error {
        bail!("inference server error: {}", error);
    }
    Ok(Some(chunk))
}
