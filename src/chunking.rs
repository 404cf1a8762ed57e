/// Chunk size and overlap, both measured in characters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

/// Represents a text chunk with metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    /// The actual text content of this chunk
    pub text: String,
    /// Identifier of the document this chunk belongs to
    pub document_id: String,
}

/// Split text into overlapping chunks of at most `chunk_size` characters.
///
/// Paragraphs are packed together while they fit. A paragraph that is larger
/// than a chunk is broken into sentences, and a sentence that is still too
/// large is cut at character boundaries. Every new chunk starts with the last
/// `chunk_overlap` characters of the previous one, trimmed forward to a word
/// boundary.
pub fn split_into_chunks(text: &str, document_id: &str, config: ChunkingConfig) -> Vec<TextChunk> {
    let chunk_size = config.chunk_size.max(1);
    let overlap = config.chunk_overlap.min(chunk_size - 1);

    let mut pieces = Vec::new();
    for paragraph in text.split("\n\n") {
        let paragraph = paragraph.trim();
        if paragraph.is_empty() {
            continue;
        }

        if char_len(paragraph) <= chunk_size {
            pieces.push(paragraph.to_string());
            continue;
        }

        for sentence in split_sentences(paragraph) {
            if char_len(sentence) <= chunk_size {
                pieces.push(sentence.to_string());
            } else {
                pieces.extend(hard_split(sentence, chunk_size));
            }
        }
    }

    let mut chunks = Vec::new();
    let mut current = String::new();

    for piece in pieces {
        let separator = if current.is_empty() { 0 } else { 1 };
        if char_len(&current) + separator + char_len(&piece) > chunk_size && !current.is_empty() {
            let text = std::mem::take(&mut current);
            let tail = overlap_tail(&text, overlap);

            // Drop the overlap when it cannot fit alongside the next piece
            if !tail.is_empty() && char_len(tail) + 1 + char_len(&piece) <= chunk_size {
                current.push_str(tail);
            }
            chunks.push(TextChunk {
                text,
                document_id: document_id.to_string(),
            });
        }

        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(&piece);
    }

    if !current.trim().is_empty() {
        chunks.push(TextChunk {
            text: current,
            document_id: document_id.to_string(),
        });
    }

    chunks
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Sentences keep their terminating punctuation
fn split_sentences(paragraph: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;

    for (idx, c) in paragraph.char_indices() {
        if matches!(c, '.' | '!' | '?' | '\n') {
            let end = idx + c.len_utf8();
            let sentence = paragraph[start..end].trim();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            start = end;
        }
    }

    let rest = paragraph[start..].trim();
    if !rest.is_empty() {
        sentences.push(rest);
    }

    sentences
}

fn hard_split(text: &str, chunk_size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(chunk_size)
        .map(|window| window.iter().collect::<String>().trim().to_string())
        .filter(|piece| !piece.is_empty())
        .collect()
}

/// The last `overlap` characters of `text`, starting at a word boundary
fn overlap_tail(text: &str, overlap: usize) -> &str {
    if overlap == 0 {
        return "";
    }

    let total = char_len(text);
    if total <= overlap {
        return text.trim();
    }

    let start = text
        .char_indices()
        .nth(total - overlap)
        .map(|(i, _)| i)
        .unwrap_or(0);
    let tail = &text[start..];

    // Skip the partial word the cut landed in, unless the tail is one word
    match tail.find(char::is_whitespace) {
        Some(space) if start > 0 && !text[..start].ends_with(char::is_whitespace) => {
            tail[space..].trim()
        }
        _ => tail.trim(),
    }
}
