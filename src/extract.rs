//! Text extraction for paginated documents (PDF) and delimited tables.
//!
//! Ingestion supplies bytes and a file type; this module returns plain UTF-8
//! text plus whatever structural facts it could recover. Extraction never
//! panics: malformed input is an [`ExtractError`] and the caller records it.

use crate::models::TableInfo;

/// Form feed, emitted by the PDF text extractor between pages.
const PAGE_BREAK: char = '\u{c}';

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("unsupported file type: {0}")]
    UnsupportedFileType(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("table parsing failed: {0}")]
    Table(String),
}

/// Extracted PDF text and its page count, when page breaks were visible.
#[derive(Debug)]
pub struct PdfText {
    pub text: String,
    pub page_count: Option<usize>,
}

pub fn extract_pdf(bytes: &[u8]) -> Result<PdfText, ExtractError> {
    let raw =
        pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))?;
    let pages: Vec<&str> = raw.split(PAGE_BREAK).collect();
    let page_count = if raw.contains(PAGE_BREAK) {
        Some(pages.iter().filter(|p| !p.trim().is_empty()).count())
    } else {
        None
    };
    let text = pages
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");
    Ok(PdfText { text, page_count })
}

/// Render a delimited table as `header: value` lines, one blank line per row.
pub fn extract_table(text: &str, delimiter: char) -> Result<(String, TableInfo), ExtractError> {
    let mut records = parse_delimited(text, delimiter)?
        .into_iter()
        .filter(|r| r.iter().any(|f| !f.trim().is_empty()));

    let headers: Vec<String> = match records.next() {
        Some(h) => h.into_iter().map(|f| f.trim().to_string()).collect(),
        None => return Err(ExtractError::Table("table has no header row".to_string())),
    };

    let mut out = Vec::new();
    let mut rows = 0;
    for record in records {
        rows += 1;
        let line = record
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.trim().is_empty())
            .map(|(i, v)| match headers.get(i) {
                Some(h) if !h.is_empty() => format!("{}: {}", h, v.trim()),
                _ => v.trim().to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n");
        out.push(line);
    }

    let info = TableInfo {
        rows,
        columns: headers.len(),
        headers,
    };
    Ok((out.join("\n\n"), info))
}

/// Split delimited text into records, honoring double-quoted fields.
fn parse_delimited(text: &str, delimiter: char) -> Result<Vec<Vec<String>>, ExtractError> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    field.push('"');
                    chars.next();
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' if field.is_empty() => in_quotes = true,
            '\r' => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
            }
            c if c == delimiter => record.push(std::mem::take(&mut field)),
            _ => field.push(c),
        }
    }

    if in_quotes {
        return Err(ExtractError::Table("unterminated quoted field".to_string()));
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }
    Ok(records)
}
