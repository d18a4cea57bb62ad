//! Loading support documents from disk.
//!
//! Text formats (`.md`, `.txt`, `.json`, `.html`, `.htm`) are read as
//! UTF-8. PDFs go through `pdf-extract`; `.docx` files are opened as ZIP
//! archives and the `<w:t>` runs of `word/document.xml` are concatenated.
//! A file that cannot be read or extracted is skipped with a warning.

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::io::Read;
use std::path::Path;
use walkdir::WalkDir;

use caseforge_core::models::Document;

use crate::config::IngestConfig;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

/// Zip-bomb guard for `word/document.xml`.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("unsupported file type: {0}")]
    Unsupported(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("DOCX extraction failed: {0}")]
    Docx(String),
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Content type for a path, by extension.
pub fn content_type_for(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "md" => Some("text/markdown"),
        "txt" => Some("text/plain"),
        "json" => Some("application/json"),
        "html" | "htm" => Some("text/html"),
        "pdf" => Some(MIME_PDF),
        "docx" => Some(MIME_DOCX),
        _ => None,
    }
}

/// Load one file as a [`Document`] under the given source id.
pub fn load_file(path: &Path, source_id: &str) -> Result<Document, ExtractError> {
    let content_type = content_type_for(path)
        .ok_or_else(|| ExtractError::Unsupported(path.display().to_string()))?;

    let body = match content_type {
        MIME_PDF => extract_pdf(&std::fs::read(path)?)?,
        MIME_DOCX => extract_docx(&std::fs::read(path)?)?,
        _ => std::fs::read_to_string(path)?,
    };

    let title = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    Ok(Document::new(source_id, body)
        .with_title(title)
        .with_content_type(content_type))
}

/// Load a file, or every matching file under a directory.
///
/// A file given directly is loaded regardless of the include globs and its
/// source id is its file name. Files found by walking a directory use
/// their path relative to that directory, and come back sorted by it.
pub fn load_path(path: &Path, config: &IngestConfig) -> Result<Vec<Document>> {
    if !path.exists() {
        bail!("Path does not exist: {}", path.display());
    }

    if path.is_file() {
        let source_id = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        return Ok(match load_file(path, &source_id) {
            Ok(doc) => vec![doc],
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping file");
                Vec::new()
            }
        });
    }

    let include_set = build_globset(&config.include_globs)?;
    let mut excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    excludes.extend(config.exclude_globs.clone());
    let exclude_set = build_globset(&excludes)?;

    let mut docs = Vec::new();
    for entry in WalkDir::new(path).follow_links(config.follow_symlinks) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let file = entry.path();
        let relative = file.strip_prefix(path).unwrap_or(file);
        let rel_str = relative.to_string_lossy().to_string();

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }

        match load_file(file, &rel_str) {
            Ok(doc) => docs.push(doc),
            Err(e) => tracing::warn!(path = %file.display(), error = %e, "skipping file"),
        }
    }

    docs.sort_by(|a, b| a.source_id.cmp(&b.source_id));
    Ok(docs)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Docx(e.to_string()))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|_| ExtractError::Docx("word/document.xml not found".to_string()))?;

    let mut xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut xml)
        .map_err(|e| ExtractError::Docx(e.to_string()))?;
    if xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Docx(
            "word/document.xml exceeds size limit".to_string(),
        ));
    }

    docx_text(&xml)
}

/// Text of every `<w:t>` run; each `</w:p>` ends a line.
fn docx_text(xml: &[u8]) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Text(te)) if in_text => {
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Docx(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim_end().to_string())
}
