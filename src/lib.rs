pub mod chunking;
pub mod config;
pub mod coordinator;
pub mod document;
pub mod embeddings;
pub mod error;
pub mod llm;
pub mod prompt;
pub mod rag;
pub mod server;
pub mod store;
pub mod stream;

#[cfg(test)]
mod testing;
