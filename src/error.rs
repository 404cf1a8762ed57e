use thiserror::Error;

/// Failures surfaced by the coordinator and the RAG pipeline.
///
/// Collaborators report `anyhow` errors, flattened here into the variant
/// message with their full context chain. The error is `Clone`: one failed
/// initialization attempt is delivered to every caller waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RagError {
    /// Empty or malformed request
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Model, embedding, or index setup failed
    #[error("initialization failed: {0}")]
    Initialization(String),

    /// Embedding the query or searching the index failed
    #[error("retrieval failed: {0}")]
    Retrieval(String),

    /// The generator failed while producing the answer
    #[error("generation failed: {0}")]
    Generation(String),

    /// The persisted index could not be read or written
    #[error("index persistence failed: {0}")]
    Persistence(String),
}

impl RagError {
    pub fn initialization(err: anyhow::Error) -> Self {
        RagError::Initialization(format!("{:#}", err))
    }

    pub fn retrieval(err: anyhow::Error) -> Self {
        RagError::Retrieval(format!("{:#}", err))
    }

    pub fn generation(err: anyhow::Error) -> Self {
        RagError::Generation(format!("{:#}", err))
    }

    pub fn persistence(err: anyhow::Error) -> Self {
        RagError::Persistence(format!("{:#}", err))
    }
}
