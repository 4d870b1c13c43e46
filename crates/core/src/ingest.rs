use crate::extractor::PageReader;
use crate::{DocumentPage, IngestError};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Every file under `folder` the reader can handle, sorted for a stable
/// ingestion order.
pub fn discover_source_files(folder: &Path, reader: &dyn PageReader) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        if reader.supports(entry.path()) {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

pub fn digest_file(path: &Path) -> Result<String, IngestError> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

pub fn source_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// Numbers pages in document order from zero.
pub fn assign_page_indices(source_path: &str, texts: Vec<String>) -> Vec<DocumentPage> {
    texts
        .into_iter()
        .enumerate()
        .map(|(ordinal, text)| DocumentPage {
            source_path: source_path.to_string(),
            page_index: ordinal as u32,
            text,
        })
        .collect()
}

/// A source file read into pages, ready to be chunked and embedded.
#[derive(Debug, Clone)]
pub struct LoadedSource {
    pub source_path: String,
    pub checksum: String,
    pub pages: Vec<DocumentPage>,
}

pub fn load_source(path: &Path, reader: &dyn PageReader) -> Result<LoadedSource, IngestError> {
    if path.file_name().is_none() {
        return Err(IngestError::MissingFileName(path.display().to_string()));
    }

    let checksum = digest_file(path)?;
    let texts = reader.read_pages(path)?;
    let source_path = source_key(path);
    let pages = assign_page_indices(&source_path, texts);

    Ok(LoadedSource {
        source_path,
        checksum,
        pages,
    })
}

#[derive(Debug, Clone)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct IngestionReport {
    pub indexed_files: usize,
    pub indexed_pages: usize,
    pub passages: usize,
    pub skipped_files: Vec<SkippedFile>,
}
