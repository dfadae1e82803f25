//! Folder merge: many source documents in, one text document out.
//!
//! Used when `scan.merge = true`. Each input contributes a section headed by
//! its file name; sections are separated by a form feed so the remote side
//! sees page breaks. Text is pulled out of:
//!
//! - plain text (`txt`, `md`, `csv`), read as lossy UTF-8
//! - `docx`, from the `w:t` runs of `word/document.xml`
//! - `pdf`, via `pdf-extract`
//!
//! Anything else (legacy `.doc` included) and empty inputs are skipped with a
//! warning rather than failing the folder.

use anyhow::{Context, Result};
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Upper bound on a decompressed `word/document.xml` (zip-bomb guard).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

const SECTION_BREAK: &str = "\n\u{000C}\n";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported file type: {0}")]
    Unsupported(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("DOCX extraction failed: {0}")]
    Docx(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Combines a folder's files into one uploadable document.
pub trait DocumentMerger: Send + Sync {
    /// Writes the merged document to `output` and returns its path.
    fn merge(&self, files: &[PathBuf], output: &Path) -> Result<PathBuf>;
}

/// Default merger producing a UTF-8 text file.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextMerger;

impl DocumentMerger for TextMerger {
    fn merge(&self, files: &[PathBuf], output: &Path) -> Result<PathBuf> {
        let mut sections = Vec::with_capacity(files.len());
        for file in files {
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            match extract_file(file) {
                Ok(text) if text.trim().is_empty() => {
                    tracing::warn!(file = %file.display(), "skipping empty file");
                }
                Ok(text) => {
                    tracing::info!(file = %file.display(), chars = text.len(), "merged file");
                    sections.push(format!("{}\n\n{}", name, text.trim_end()));
                }
                Err(e) => {
                    tracing::warn!(file = %file.display(), error = %e, "skipping file");
                }
            }
        }

        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(output, sections.join(SECTION_BREAK))
            .with_context(|| format!("Failed to write merged file {}", output.display()))?;
        Ok(output.to_path_buf())
    }
}

/// Extracts plain text from one file, dispatching on its extension.
pub fn extract_file(path: &Path) -> Result<String, ExtractError> {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "txt" | "md" | "csv" => {
            let bytes = std::fs::read(path)?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }
        "docx" => extract_docx(&std::fs::read(path)?),
        "pdf" => pdf_extract::extract_text_from_mem(&std::fs::read(path)?)
            .map_err(|e| ExtractError::Pdf(e.to_string())),
        other => Err(ExtractError::Unsupported(other.to_string())),
    }
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Docx(e.to_string()))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|e| ExtractError::Docx(e.to_string()))?;
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
    docx_paragraphs(&xml)
}

/// Text of `w:t` runs, one line per `w:p` paragraph.
fn docx_paragraphs(xml: &[u8]) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::Text(te)) if in_text => {
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Docx(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}
