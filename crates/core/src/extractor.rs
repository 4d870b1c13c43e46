use crate::error::{IngestError, Result};
use lopdf::Document;
use std::path::Path;
use tracing::debug;

const FORM_FEED: char = '\u{000c}';

/// Reads the text of every page of a source document, in document order.
///
/// Blank pages are kept as empty strings so that the position of each entry
/// is the page's index within the source.
pub trait PageReader: Send + Sync {
    fn read_pages(&self, path: &Path) -> Result<Vec<String>>;

    fn supports(&self, path: &Path) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Pdf,
    PlainText,
}

impl SourceKind {
    pub fn from_path(path: &Path) -> Option<Self> {
        let extension = path.extension()?.to_str()?.to_ascii_lowercase();
        match extension.as_str() {
            "pdf" => Some(SourceKind::Pdf),
            "txt" | "md" => Some(SourceKind::PlainText),
            _ => None,
        }
    }
}

/// PDFs through lopdf, one entry per page; text files split on form feeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileReader;

impl PageReader for FileReader {
    fn read_pages(&self, path: &Path) -> Result<Vec<String>> {
        match SourceKind::from_path(path) {
            Some(SourceKind::Pdf) => read_pdf_pages(path),
            Some(SourceKind::PlainText) => read_text_pages(path),
            None => Err(IngestError::Unsupported(path.display().to_string())),
        }
    }

    fn supports(&self, path: &Path) -> bool {
        SourceKind::from_path(path).is_some()
    }
}

fn read_pdf_pages(path: &Path) -> Result<Vec<String>> {
    let document =
        Document::load(path).map_err(|error| IngestError::PdfParse(error.to_string()))?;

    let pages = document.get_pages();
    if pages.is_empty() {
        return Err(IngestError::PdfParse(format!(
            "pdf has no pages: {}",
            path.display()
        )));
    }

    let mut texts = Vec::with_capacity(pages.len());
    for page_no in pages.keys() {
        let text = match document.extract_text(&[*page_no]) {
            Ok(text) => text,
            Err(error) => {
                debug!(path = %path.display(), page = page_no, %error, "page text not decodable");
                String::new()
            }
        };
        texts.push(text);
    }

    Ok(texts)
}

fn read_text_pages(path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(split_text_pages(&raw))
}

pub fn split_text_pages(raw: &str) -> Vec<String> {
    raw.split(FORM_FEED).map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::{split_text_pages, FileReader, PageReader, SourceKind};
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    #[test]
    fn source_kind_is_case_insensitive() {
        assert_eq!(SourceKind::from_path(Path::new("a/B.PDF")), Some(SourceKind::Pdf));
        assert_eq!(SourceKind::from_path(Path::new("notes.md")), Some(SourceKind::PlainText));
        assert_eq!(SourceKind::from_path(Path::new("image.png")), None);
        assert_eq!(SourceKind::from_path(Path::new("README")), None);
    }

    #[test]
    fn form_feed_separates_pages_and_keeps_blank_ones() {
        let pages = split_text_pages("first\u{000C}\u{000C}third");
        assert_eq!(pages, vec!["first", "", "third"]);
    }

    #[test]
    fn unsupported_files_are_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("sheet.xlsx");
        fs::write(&path, b"not really")?;

        let reader = FileReader;
        assert!(!reader.supports(&path));
        assert!(reader.read_pages(&path).is_err());
        Ok(())
    }

    #[test]
    fn broken_pdf_is_a_parse_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("broken.pdf");
        fs::write(&path, b"%PDF-1.4\n%broken")?;

        let result = FileReader.read_pages(&path);
        assert!(matches!(result, Err(crate::IngestError::PdfParse(_))));
        Ok(())
    }
}
