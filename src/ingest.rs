//! Ingestion: raw files to hashed [`RawDocument`]s.
//!
//! Every file is read once, identified by the SHA-256 of its bytes, and run
//! through the extractor for its type. A failing file is recorded in
//! [`IngestReport::failures`] and the batch continues.

use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::extract;
use crate::models::{DocumentMetadata, RawDocument};

#[derive(Debug, Clone, PartialEq)]
pub struct IngestFailure {
    pub path: PathBuf,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct IngestReport {
    pub documents: Vec<RawDocument>,
    pub failures: Vec<IngestFailure>,
}

/// File types the ingester understands, keyed by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileKind {
    Text,
    Delimited(char),
    Pdf,
}

fn file_kind(path: &Path) -> Option<(FileKind, String)> {
    let ext = path.extension()?.to_string_lossy().to_ascii_lowercase();
    let kind = match ext.as_str() {
        "txt" | "md" => FileKind::Text,
        "csv" => FileKind::Delimited(','),
        "tsv" => FileKind::Delimited('\t'),
        "pdf" => FileKind::Pdf,
        _ => return None,
    };
    Some((kind, ext))
}

/// Read and extract every path, skipping (and recording) the ones that fail.
///
/// Two files with identical bytes share an id; only the first is kept.
pub fn ingest(paths: &[PathBuf], doc_type: &str) -> IngestReport {
    let mut report = IngestReport::default();
    let mut seen = HashSet::new();

    for path in paths {
        match ingest_file(path, doc_type) {
            Ok(doc) => {
                if !seen.insert(doc.id.clone()) {
                    tracing::info!(
                        path = %path.display(),
                        id = %doc.id,
                        "ingest: duplicate content skipped"
                    );
                    continue;
                }
                for warning in &doc.metadata.warnings {
                    tracing::warn!(path = %path.display(), "ingest: {}", warning);
                }
                report.documents.push(doc);
            }
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "ingest: file skipped");
                report.failures.push(IngestFailure {
                    path: path.clone(),
                    error,
                });
            }
        }
    }

    tracing::info!(
        documents = report.documents.len(),
        failures = report.failures.len(),
        doc_type,
        "ingest complete"
    );
    report
}

fn ingest_file(path: &Path, doc_type: &str) -> Result<RawDocument, String> {
    let (kind, ext) = file_kind(path).ok_or_else(|| {
        extract::ExtractError::UnsupportedFileType(path.display().to_string()).to_string()
    })?;
    let bytes = std::fs::read(path).map_err(|e| format!("read failed: {}", e))?;

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let id = format!("{:x}", hasher.finalize());

    let mut metadata = DocumentMetadata {
        original_filename: path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        file_type: ext,
        ..Default::default()
    };

    let text_content = match kind {
        FileKind::Text => decode_text(&bytes, &mut metadata),
        FileKind::Delimited(delimiter) => {
            let text = decode_text(&bytes, &mut metadata);
            let (rendered, info) =
                extract::extract_table(&text, delimiter).map_err(|e| e.to_string())?;
            metadata.table = Some(info);
            rendered
        }
        FileKind::Pdf => {
            let pdf = extract::extract_pdf(&bytes).map_err(|e| e.to_string())?;
            metadata.page_count = pdf.page_count;
            pdf.text
        }
    };

    if text_content.trim().is_empty() {
        metadata.warnings.push("no text content extracted".to_string());
    }

    Ok(RawDocument {
        id,
        text_content,
        doc_type: doc_type.to_string(),
        metadata,
    })
}

fn decode_text(bytes: &[u8], metadata: &mut DocumentMetadata) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.trim_start_matches('\u{feff}').to_string(),
        Err(e) => {
            metadata
                .warnings
                .push(format!("invalid UTF-8 at byte {}, decoded lossily", e.valid_up_to()));
            String::from_utf8_lossy(bytes).into_owned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_ingest_hashes_and_records_failures() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a.md");
        let b = tmp.path().join("b.txt");
        let bad = tmp.path().join("c.docx");
        let missing = tmp.path().join("gone.txt");
        fs::write(&a, "Passwords rotate every 90 days.").unwrap();
        fs::write(&b, "Backups run nightly.").unwrap();
        fs::write(&bad, "binary").unwrap();

        let report = ingest(&[a.clone(), bad.clone(), missing.clone(), b], "procedure");
        assert_eq!(report.documents.len(), 2);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[0].path, bad);
        assert!(report.failures[0].error.contains("unsupported"));
        assert_eq!(report.failures[1].path, missing);

        let doc = &report.documents[0];
        assert_eq!(doc.metadata.original_filename, "a.md");
        assert_eq!(doc.metadata.file_type, "md");
        assert_eq!(doc.doc_type, "procedure");
        assert_eq!(doc.id.len(), 64);
    }

    #[test]
    fn test_identical_content_deduplicated() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a.txt");
        let b = tmp.path().join("copy.txt");
        fs::write(&a, "same").unwrap();
        fs::write(&b, "same").unwrap();
        let report = ingest(&[a, b], "procedure");
        assert_eq!(report.documents.len(), 1);
        assert_eq!(report.documents[0].metadata.original_filename, "a.txt");
    }

    #[test]
    fn test_invalid_utf8_is_a_warning() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("latin1.txt");
        fs::write(&a, b"caf\xe9 policy").unwrap();
        let report = ingest(&[a], "procedure");
        let doc = &report.documents[0];
        assert!(doc.text_content.starts_with("caf"));
        assert_eq!(doc.metadata.warnings.len(), 1);
    }

    #[test]
    fn test_csv_metadata() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("controls.csv");
        fs::write(&a, "control,owner\nBackups,IT\nRotation,Security\n").unwrap();
        let report = ingest(&[a], "procedure");
        let table = report.documents[0].metadata.table.as_ref().unwrap();
        assert_eq!(table.rows, 2);
        assert_eq!(table.columns, 2);
    }
}
