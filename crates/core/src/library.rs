use crate::LibraryError;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Source documents on disk, grouped one directory per category.
#[derive(Debug, Clone)]
pub struct DocumentLibrary {
    root: PathBuf,
}

impl DocumentLibrary {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Writes an uploaded file to `<root>/<category>/<file_name>`, replacing
    /// any file of the same name.
    pub fn save_upload(
        &self,
        category: &str,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<PathBuf, LibraryError> {
        validate_name(category)?;
        validate_name(file_name)?;

        let folder = self.root.join(category);
        fs::create_dir_all(&folder)?;
        let path = folder.join(file_name);
        fs::write(&path, bytes)?;

        info!(path = %path.display(), bytes = bytes.len(), "saved upload");
        Ok(path)
    }

    /// Category name to sorted file names. Files directly under the root are
    /// not listed.
    pub fn categories(&self) -> Result<BTreeMap<String, Vec<String>>, LibraryError> {
        let mut structure = BTreeMap::new();
        if !self.root.exists() {
            return Ok(structure);
        }

        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }

            let mut files = Vec::new();
            for file in fs::read_dir(entry.path())? {
                let file = file?;
                if file.file_type()?.is_file() {
                    files.push(file.file_name().to_string_lossy().to_string());
                }
            }
            files.sort();
            structure.insert(entry.file_name().to_string_lossy().to_string(), files);
        }

        Ok(structure)
    }

    pub fn resolve(&self, category: &str, file_name: &str) -> Result<PathBuf, LibraryError> {
        validate_name(category)?;
        validate_name(file_name)?;

        let path = self.root.join(category).join(file_name);
        if !path.is_file() {
            return Err(LibraryError::NotFound(format!("{category}/{file_name}")));
        }
        Ok(path)
    }
}

/// A single path component: no separators, no parent references.
pub fn validate_name(name: &str) -> Result<(), LibraryError> {
    let trimmed = name.trim();
    if trimmed.is_empty()
        || trimmed == "."
        || trimmed == ".."
        || trimmed.contains('/')
        || trimmed.contains('\\')
        || trimmed.contains('\0')
    {
        return Err(LibraryError::InvalidName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{validate_name, DocumentLibrary};
    use crate::LibraryError;
    use tempfile::tempdir;

    #[test]
    fn uploads_are_grouped_by_category() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let library = DocumentLibrary::new(dir.path().join("data"));

        library.save_upload("manuals", "pump.pdf", b"%PDF")?;
        library.save_upload("manuals", "valve.pdf", b"%PDF")?;
        library.save_upload("notes", "todo.txt", b"x")?;

        let structure = library.categories()?;
        assert_eq!(structure["manuals"], vec!["pump.pdf", "valve.pdf"]);
        assert_eq!(structure["notes"], vec!["todo.txt"]);
        Ok(())
    }

    #[test]
    fn missing_root_has_no_categories() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let library = DocumentLibrary::new(dir.path().join("nothing"));
        assert!(library.categories()?.is_empty());
        Ok(())
    }

    #[test]
    fn names_reject_path_traversal() {
        for name in ["", "..", ".", "a/b", "..\\secrets", "x\0y"] {
            assert!(matches!(validate_name(name), Err(LibraryError::InvalidName(_))));
        }
        assert!(validate_name("report v2.pdf").is_ok());
    }

    #[test]
    fn resolve_reports_missing_files() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let library = DocumentLibrary::new(dir.path());
        library.save_upload("manuals", "pump.pdf", b"%PDF")?;

        assert!(library.resolve("manuals", "pump.pdf")?.ends_with("manuals/pump.pdf"));
        assert!(matches!(
            library.resolve("manuals", "other.pdf"),
            Err(LibraryError::NotFound(_))
        ));
        assert!(library.resolve("..", "pump.pdf").is_err());
        Ok(())
    }
}
