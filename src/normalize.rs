//! Deterministic, idempotent text cleaning.
//!
//! Canonicalizes Unicode (NFC), collapses horizontal whitespace, trims lines,
//! strips boilerplate section numbering and titles, records headings, and
//! collapses blank-line runs. Applying [`normalize`] to its own output
//! (via [`NormalizedDocument::as_raw`]) yields the same text.

use regex::Regex;
use std::sync::LazyLock;
use unicode_normalization::UnicodeNormalization;

use crate::models::{NormalizedDocument, RawDocument};

static HORIZONTAL_WS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t\u{a0}]+").expect("valid regex"));

/// Leading numbering: `1.2.3`, `1.`, `2)`, `(a)`, `a)`, `A.1`, `(iv)`.
static NUMBERING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:\(?\d+(?:\.\d+)+\.?\)?|\(?\d+[.)]|\([A-Za-z0-9]{1,4}\)|[A-Za-z][.)]|[A-Za-z]\.\d+(?:\.\d+)*\.?)(?:\s+|$)",
    )
    .expect("valid regex")
});

/// `Chapter 3:`, `Section 4.1 -`, `Article 12`, `Part II`.
static BOILERPLATE_TITLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?:chapter|section|part|article)\s+[0-9IVXLCDMivxlcdm]+(?:\.[0-9]+)*\s*[:.\-\u{2013}]?(?:\s+|$)",
    )
    .expect("valid regex")
});

pub fn normalize(raw: &RawDocument) -> NormalizedDocument {
    let canonical: String = raw.text_content.nfc().collect();
    let canonical = canonical.replace("\r\n", "\n").replace('\r', "\n");

    let mut lines: Vec<String> = Vec::new();
    let mut sections: Vec<String> = Vec::new();

    for line in canonical.lines() {
        let collapsed = HORIZONTAL_WS.replace_all(line, " ");
        let trimmed = collapsed.trim();
        if trimmed.is_empty() {
            lines.push(String::new());
            continue;
        }

        let stripped = strip_heading_prefix(trimmed);
        if stripped.is_empty() {
            sections.push(trimmed.to_string());
            lines.push(String::new());
            continue;
        }
        if is_all_caps_heading(stripped) {
            sections.push(stripped.to_string());
        }
        lines.push(stripped.to_string());
    }

    NormalizedDocument {
        id: format!("norm_{}", raw.id),
        text_content: collapse_blank_lines(&lines),
        sections,
        doc_type: raw.doc_type.clone(),
        metadata: raw.metadata.clone(),
    }
}

/// Strip numbering and titles until the line stops changing.
fn strip_heading_prefix(line: &str) -> &str {
    let mut current = line;
    loop {
        let next = if let Some(m) = NUMBERING.find(current) {
            current[m.end()..].trim_start()
        } else if let Some(m) = BOILERPLATE_TITLE.find(current) {
            current[m.end()..].trim_start()
        } else {
            current
        };
        if next.len() == current.len() {
            return current;
        }
        current = next;
    }
}

fn is_all_caps_heading(line: &str) -> bool {
    let len = line.chars().count();
    if !(4..150).contains(&len) {
        return false;
    }
    let mut letters = line.chars().filter(|c| c.is_alphabetic()).peekable();
    letters.peek().is_some() && letters.all(|c| c.is_uppercase())
}

fn collapse_blank_lines(lines: &[String]) -> String {
    let mut out: Vec<&str> = Vec::with_capacity(lines.len());
    for line in lines {
        if line.is_empty() && out.last().map_or(true, |prev| prev.is_empty()) {
            continue;
        }
        out.push(line);
    }
    while out.last().is_some_and(|l| l.is_empty()) {
        out.pop();
    }
    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentMetadata;

    fn raw(text: &str) -> RawDocument {
        RawDocument {
            id: "abc".to_string(),
            text_content: text.to_string(),
            doc_type: "procedure".to_string(),
            metadata: DocumentMetadata::default(),
        }
    }

    #[test]
    fn test_whitespace_and_blank_lines() {
        let doc = normalize(&raw("  alpha \t  beta  \n\n\n\n gamma\t\n\n"));
        assert_eq!(doc.text_content, "alpha beta\n\ngamma");
        assert_eq!(doc.id, "norm_abc");
    }

    #[test]
    fn test_strips_numbering_and_titles() {
        let text = "Section 4.1: Access Control\n4.1.2 Users must authenticate.\n(a) Passwords rotate.\nb) Accounts lock.\nArticle 12\nBody text.";
        let doc = normalize(&raw(text));
        assert_eq!(
            doc.text_content,
            "Access Control\nUsers must authenticate.\nPasswords rotate.\nAccounts lock.\n\nBody text."
        );
        assert_eq!(doc.sections, vec!["Article 12"]);
    }

    #[test]
    fn test_all_caps_lines_are_sections() {
        let doc = normalize(&raw("1. PASSWORD MANAGEMENT\nRotate every 90 days.\nOK"));
        assert_eq!(doc.sections, vec!["PASSWORD MANAGEMENT"]);
        assert!(doc.text_content.starts_with("PASSWORD MANAGEMENT\n"));
    }

    #[test]
    fn test_unicode_canonicalized() {
        // "e" + combining acute accent composes to a single code point.
        let doc = normalize(&raw("caf\u{65}\u{301}"));
        assert_eq!(doc.text_content, "caf\u{e9}");
    }

    #[test]
    fn test_idempotent() {
        let text = "Chapter 2 - Scope\n\n\n1.1  1.2 Nested   numbering\r\nSECTION 3\n (ii) item\n\nA.1 Annex  line\n";
        let once = normalize(&raw(text));
        let twice = normalize(&once.as_raw());
        assert_eq!(once.text_content, twice.text_content);
        assert_eq!(twice.id, once.id);
    }

    #[test]
    fn test_deterministic() {
        let text = "3) Backups\n\nDaily backups are verified.";
        assert_eq!(normalize(&raw(text)), normalize(&raw(text)));
    }
}
