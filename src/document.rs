use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

/// A knowledge-base file with its extracted text
#[derive(Debug, Clone)]
pub struct Document {
    /// Extracted text
    pub content: String,
    /// Path relative to the knowledge base (used as document ID)
    pub document_id: String,
    pub mime_type: String,
}

/// File formats text can be extracted from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Pdf,
    Text,
}

impl Format {
    /// Classify a MIME type, `None` when unsupported
    pub fn from_mime(mime_type: &str) -> Option<Self> {
        if mime_type.starts_with("application/pdf") {
            Some(Format::Pdf)
        } else if mime_type.starts_with("text/") {
            Some(Format::Text)
        } else {
            None
        }
    }
}

impl Document {
    /// Read the file at `file_path`, identified by `document_id`
    pub fn from_file<P: AsRef<Path>>(file_path: P, document_id: String) -> Result<Self> {
        let path = file_path.as_ref();

        let mime_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .to_string();
        debug!("Detected MIME type {} for {}", mime_type, path.display());

        let Some(format) = Format::from_mime(&mime_type) else {
            bail!("unsupported document format {} (only text and PDF are read)", mime_type);
        };
        let content = extract_text(path, format)?;

        Ok(Document {
            content,
            document_id,
            mime_type,
        })
    }
}

/// Read every supported document below `dir`.
///
/// Files that cannot be read are logged and skipped. A missing directory is an
/// empty knowledge base.
pub fn load_knowledge_base<P: AsRef<Path>>(dir: P) -> Result<Vec<Document>> {
    let dir = dir.as_ref();

    if !dir.exists() {
        warn!(
            "Knowledge base directory {} does not exist, starting with no documents",
            dir.display()
        );
        return Ok(Vec::new());
    }

    let mut documents = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry in {}: {}", dir.display(), e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let document_id = path
            .strip_prefix(dir)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");

        match Document::from_file(path, document_id) {
            Ok(document) if document.content.trim().is_empty() => {
                warn!("Skipping empty document {}", path.display());
            }
            Ok(document) => documents.push(document),
            Err(e) => warn!("Skipping {}: {:#}", path.display(), e),
        }
    }

    info!(
        "Loaded {} documents from {}",
        documents.len(),
        dir.display()
    );
    Ok(documents)
}

/// Extract the text of `path` according to `format`
pub fn extract_text(path: &Path, format: Format) -> Result<String> {
    match format {
        Format::Pdf => {
            info!("Extracting text from PDF {}", path.display());
            let raw = pdf_extract::extract_text(path)
                .with_context(|| format!("Failed to extract text from PDF: {}", path.display()))?;
            Ok(normalize_whitespace(&raw))
        }
        Format::Text => fs::read_to_string(path)
            .with_context(|| format!("Failed to read text file: {}", path.display())),
    }
}

/// Collapse space runs within lines and blank-line runs into one paragraph break
fn normalize_whitespace(text: &str) -> String {
    let mut paragraphs: Vec<String> = Vec::new();
    let mut current: Vec<String> = Vec::new();

    for line in text.lines() {
        let line = line.split(' ').filter(|w| !w.is_empty()).collect::<Vec<_>>().join(" ");
        if line.is_empty() {
            if !current.is_empty() {
                paragraphs.push(current.join("\n"));
                current.clear();
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        paragraphs.push(current.join("\n"));
    }

    paragraphs.join("\n\n")
}
