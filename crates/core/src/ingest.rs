use crate::error::{IngestError, Result};
use crate::models::RawDocument;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

const TEXT_EXTENSIONS: &[&str] = &["md", "markdown", "txt"];

/// Collection-level flags applied to every loaded document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentOptions {
    pub source: String,
    pub public: bool,
    pub source_of_truth: bool,
}

impl Default for DocumentOptions {
    fn default() -> Self {
        Self {
            source: "docs".to_string(),
            public: false,
            source_of_truth: false,
        }
    }
}

pub fn discover_text_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let is_text = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                TEXT_EXTENSIONS
                    .iter()
                    .any(|known| ext.eq_ignore_ascii_case(known))
            });

        if is_text {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

fn document_id(path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Splits text into sections at markdown headings. Heading lines stay with
/// the section they open.
pub fn split_sections(text: &str) -> Vec<String> {
    let mut sections = Vec::new();
    let mut current = String::new();
    for line in text.lines() {
        if line.trim_start().starts_with('#') && !current.trim().is_empty() {
            sections.push(std::mem::take(&mut current));
        }
        current.push_str(line);
        current.push('\n');
    }
    if !current.trim().is_empty() {
        sections.push(current);
    }
    sections
        .into_iter()
        .map(|section| section.trim().to_string())
        .collect()
}

pub fn load_document(path: &Path, options: &DocumentOptions) -> Result<RawDocument> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            IngestError::MissingFileName(format!("path missing filename: {}", path.display()))
        })?;
    let text = fs::read_to_string(path)?;
    let sections = split_sections(&text);
    if sections.is_empty() {
        return Err(IngestError::InvalidArgument(format!(
            "no text in {}",
            path.display()
        )));
    }

    Ok(RawDocument {
        id: document_id(path),
        source: options.source.clone(),
        filename: Some(name.to_string()),
        public: options.public,
        source_of_truth: options.source_of_truth,
        sections,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentLoadReport {
    pub documents: Vec<RawDocument>,
    pub skipped_files: Vec<SkippedFile>,
}

pub fn load_documents_best_effort(
    folder: &Path,
    options: &DocumentOptions,
) -> Result<DocumentLoadReport> {
    let files = discover_text_files(folder);

    if files.is_empty() {
        return Err(IngestError::InvalidArgument(format!(
            "no text files found in {}",
            folder.display()
        )));
    }

    let mut documents = Vec::new();
    let mut skipped_files = Vec::new();

    for path in files {
        match load_document(&path, options) {
            Ok(document) => documents.push(document),
            Err(error) => {
                warn!(path = %path.display(), %error, "skipping file");
                skipped_files.push(SkippedFile {
                    path,
                    reason: error.to_string(),
                });
            }
        }
    }

    Ok(DocumentLoadReport {
        documents,
        skipped_files,
    })
}

#[cfg(test)]
mod tests {
    use super::{discover_text_files, load_documents_best_effort, split_sections, DocumentOptions};
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn discover_text_files_is_recursive() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let base = dir.path();
        let nested = base.join("nested");
        fs::create_dir(&nested)?;

        fs::write(base.join("a.md"), "# Keys\nRotate them.")?;
        fs::write(nested.join("b.TXT"), "plain notes")?;
        fs::write(base.join("c.pdf"), b"%PDF-1.4")?;

        let files = discover_text_files(base);
        assert_eq!(files.len(), 2);
        Ok(())
    }

    #[test]
    fn sections_break_at_headings() {
        let sections = split_sections("intro line\n\n# Setup\nstep one\n## Details\nmore\n");
        assert_eq!(
            sections,
            vec!["intro line", "# Setup\nstep one", "## Details\nmore"]
        );
        assert!(split_sections("  \n\n").is_empty());
    }

    #[test]
    fn loading_fails_without_text_files() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let result = load_documents_best_effort(dir.path(), &DocumentOptions::default());
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn best_effort_skips_empty_and_unreadable_files() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        fs::write(dir.path().join("guide.md"), "# Keys\nRotate keys from the admin console.")?;
        fs::write(dir.path().join("empty.txt"), "   \n")?;
        fs::write(dir.path().join("binary.txt"), [0xff, 0xfe, 0x00, 0x9f])?;

        let options = DocumentOptions {
            source: "handbook".to_string(),
            public: true,
            source_of_truth: true,
        };
        let report = load_documents_best_effort(dir.path(), &options)?;

        assert_eq!(report.documents.len(), 1);
        let guide = &report.documents[0];
        assert_eq!(guide.filename.as_deref(), Some("guide.md"));
        assert_eq!(guide.source, "handbook");
        assert!(guide.public && guide.source_of_truth);
        assert_eq!(guide.id.len(), 64);

        let mut skipped = report
            .skipped_files
            .iter()
            .filter_map(|file| file.path.file_name().and_then(|name| name.to_str()))
            .collect::<Vec<_>>();
        skipped.sort_unstable();
        assert_eq!(skipped, vec!["binary.txt", "empty.txt"]);
        Ok(())
    }
}
