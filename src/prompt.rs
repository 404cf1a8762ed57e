use std::fmt::Write;

use crate::store::ScoredChunk;

/// Instructions placed ahead of every prompt
pub const SYSTEM_PREAMBLE: &str = "You are a helpful assistant that answers questions using a local knowledge base.\n\
Use the numbered context passages below when they are relevant to the question.\n\
If the context is empty or does not contain the answer, answer from your general knowledge and say that the knowledge base did not cover it.\n\
Be concise and do not invent sources.";

/// One turn of a conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    System(String),
    User(String),
    Assistant(String),
}

impl Message {
    pub fn role(&self) -> &'static str {
        match self {
            Message::System(_) => "System",
            Message::User(_) => "User",
            Message::Assistant(_) => "Assistant",
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Message::System(text) | Message::User(text) | Message::Assistant(text) => text,
        }
    }
}

/// Render messages as `### Role` sections, leaving the assistant turn open
pub fn render_messages(messages: &[Message]) -> String {
    let mut rendered = messages.iter().fold(String::new(), |mut out, message| {
        let _ = write!(out, "### {}\n{}\n\n", message.role(), message.content().trim_end());
        out
    });
    rendered.push_str("### Assistant\n");
    rendered
}

/// Everything handed to the generator for one request. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system_preamble: String,
    pub context_block: String,
    pub user_query: String,
}

impl Prompt {
    /// Combine the preamble, retrieved chunks (best first), and the query
    pub fn assemble(query: &str, retrieved: &[ScoredChunk<'_>]) -> Self {
        Prompt {
            system_preamble: SYSTEM_PREAMBLE.to_string(),
            context_block: build_context_block(retrieved),
            user_query: query.to_string(),
        }
    }

    pub fn messages(&self) -> Vec<Message> {
        let system = if self.context_block.is_empty() {
            format!("{}\n\nContext:\n(no relevant passages found)", self.system_preamble)
        } else {
            format!("{}\n\nContext:\n{}", self.system_preamble, self.context_block)
        };

        vec![Message::System(system), Message::User(self.user_query.clone())]
    }

    pub fn render(&self) -> String {
        render_messages(&self.messages())
    }
}

/// Number each chunk from 1 in the order given
pub fn build_context_block(retrieved: &[ScoredChunk<'_>]) -> String {
    retrieved
        .iter()
        .enumerate()
        .map(|(idx, scored)| {
            format!(
                "[{}] (source: {})\n{}",
                idx + 1,
                scored.chunk.source_id,
                scored.chunk.text.trim()
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
