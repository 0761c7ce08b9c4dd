//! Core data models used throughout Regulens.
//!
//! These types cover the regulation side (clauses, audit tasks, evidence,
//! judgments and the persisted [`RunState`]) and the corpus side (raw and
//! normalized documents, embedded chunks) of the audit pipeline.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A determination that may not have been made yet.
///
/// Persisted as `null | true | false`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<bool>", into = "Option<bool>")]
pub enum TriState {
    #[default]
    Unknown,
    True,
    False,
}

impl TriState {
    pub fn is_unknown(&self) -> bool {
        matches!(self, TriState::Unknown)
    }

    pub fn as_bool(&self) -> Option<bool> {
        (*self).into()
    }
}

impl From<Option<bool>> for TriState {
    fn from(value: Option<bool>) -> Self {
        match value {
            None => TriState::Unknown,
            Some(true) => TriState::True,
            Some(false) => TriState::False,
        }
    }
}

impl From<TriState> for Option<bool> {
    fn from(value: TriState) -> Self {
        match value {
            TriState::Unknown => None,
            TriState::True => Some(true),
            TriState::False => Some(false),
        }
    }
}

impl From<bool> for TriState {
    fn from(value: bool) -> Self {
        Some(value).into()
    }
}

/// Clause-level compliance verdict produced by the Judge stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Judgment {
    pub compliant: bool,
    #[serde(default)]
    pub compliance_description: String,
    #[serde(default)]
    pub improvement_suggestions: String,
}

/// One retrieved procedure excerpt supporting an audit task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceMatch {
    pub excerpt: String,
    #[serde(rename = "source")]
    pub source_document_name: String,
    #[serde(default)]
    pub locator: Option<String>,
    /// `1 / (1 + squared L2 distance)`, in `(0, 1]`.
    pub score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClauseMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judgment: Option<Judgment>,
    /// Keys this version does not interpret; kept so they survive a save.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compliance_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub improvement_suggestions: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A generated search query targeting one sub-requirement of a clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditTask {
    pub id: String,
    pub sentence: String,
    #[serde(default)]
    pub top_k: Vec<EvidenceMatch>,
    #[serde(default)]
    pub compliant: TriState,
    #[serde(default)]
    pub metadata: TaskMetadata,
}

impl AuditTask {
    pub fn new(id: impl Into<String>, sentence: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            sentence: sentence.into(),
            top_k: Vec::new(),
            compliant: TriState::Unknown,
            metadata: TaskMetadata::default(),
        }
    }
}

/// One addressable unit of the regulation being audited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clause {
    pub id: String,
    pub title: String,
    pub text: String,
    #[serde(default)]
    pub need_procedure: TriState,
    #[serde(default)]
    pub tasks: Vec<AuditTask>,
    #[serde(default)]
    pub metadata: ClauseMetadata,
}

impl Clause {
    pub fn new(id: impl Into<String>, title: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            text: text.into(),
            need_procedure: TriState::Unknown,
            tasks: Vec::new(),
            metadata: ClauseMetadata::default(),
        }
    }

    pub fn judgment(&self) -> Option<&Judgment> {
        self.metadata.judgment.as_ref()
    }

    /// Store the verdict on the clause and mirror it onto every task.
    pub fn apply_judgment(&mut self, judgment: Judgment) {
        for task in &mut self.tasks {
            task.compliant = judgment.compliant.into();
            task.metadata.compliance_description = Some(judgment.compliance_description.clone());
            task.metadata.improvement_suggestions =
                Some(judgment.improvement_suggestions.clone());
        }
        self.metadata.judgment = Some(judgment);
    }

    /// Drop the verdict from the clause and its tasks so it is judged again.
    pub fn clear_judgment(&mut self) {
        for task in &mut self.tasks {
            task.compliant = TriState::Unknown;
            task.metadata.compliance_description = None;
            task.metadata.improvement_suggestions = None;
        }
        self.metadata.judgment = None;
    }
}

/// Durable, resumable record of pipeline progress for one project.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub project_name: String,
    #[serde(default)]
    pub clauses: Vec<Clause>,
}

impl RunState {
    pub fn clause(&self, id: &str) -> Option<&Clause> {
        self.clauses.iter().find(|c| c.id == id)
    }
}

/// Shape of a delimited table, recorded at ingest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    pub rows: usize,
    pub columns: usize,
    pub headers: Vec<String>,
}

/// Provenance and extraction diagnostics for a document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub original_filename: String,
    pub file_type: String,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<TableInfo>,
}

/// Extracted file content before cleaning. `id` is the SHA-256 of the file bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDocument {
    pub id: String,
    pub text_content: String,
    pub doc_type: String,
    pub metadata: DocumentMetadata,
}

/// Cleaned text ready for chunking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedDocument {
    pub id: String,
    pub text_content: String,
    pub sections: Vec<String>,
    pub doc_type: String,
    pub metadata: DocumentMetadata,
}

impl NormalizedDocument {
    /// Re-wrap the cleaned text so it can be normalized again.
    pub fn as_raw(&self) -> RawDocument {
        RawDocument {
            id: self
                .id
                .strip_prefix("norm_")
                .unwrap_or(&self.id)
                .to_string(),
            text_content: self.text_content.clone(),
            doc_type: self.doc_type.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

/// A token-bounded piece of a normalized document with its embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingChunk {
    pub id: String,
    pub parent_document_id: String,
    pub chunk_text: String,
    pub vector: Vec<f32>,
    pub chunk_index: usize,
    pub total_chunks: usize,
    /// `line N` of the chunk start within the normalized text.
    #[serde(default)]
    pub locator: Option<String>,
    #[serde(default)]
    pub source_document_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tristate_serializes_as_nullable_bool() {
        let json = serde_json::to_string(&vec![TriState::Unknown, TriState::True, TriState::False])
            .unwrap();
        assert_eq!(json, "[null,true,false]");
        let back: Vec<TriState> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, vec![TriState::Unknown, TriState::True, TriState::False]);
    }

    #[test]
    fn test_run_state_shape() {
        let mut clause = Clause::new("C001", "Passwords", "passwords must be rotated every 90 days");
        clause.need_procedure = TriState::True;
        let mut task = AuditTask::new("task_001", "evidence of 90-day password rotation policy");
        task.top_k.push(EvidenceMatch {
            excerpt: "Passwords rotate every 90 days.".into(),
            source_document_name: "security.md".into(),
            locator: Some("line 3".into()),
            score: 0.93,
        });
        clause.tasks.push(task);
        let state = RunState {
            project_name: "acme".into(),
            clauses: vec![clause],
        };

        let value = serde_json::to_value(&state).unwrap();
        let c = &value["clauses"][0];
        assert_eq!(c["need_procedure"], Value::Bool(true));
        assert_eq!(c["tasks"][0]["compliant"], Value::Null);
        assert_eq!(c["tasks"][0]["top_k"][0]["source"], "security.md");
        assert_eq!(c["tasks"][0]["top_k"][0]["locator"], "line 3");
        assert!(c["metadata"].as_object().unwrap().is_empty());

        let back: RunState = serde_json::from_value(value).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_unknown_metadata_keys_survive() {
        let json = r#"{"id":"C1","title":"t","text":"x","need_procedure":null,"tasks":[],
            "metadata":{"reviewer":"jane","judgment":{"compliant":false}}}"#;
        let clause: Clause = serde_json::from_str(json).unwrap();
        assert_eq!(clause.metadata.extra["reviewer"], "jane");
        assert!(!clause.judgment().unwrap().compliant);
        let value = serde_json::to_value(&clause).unwrap();
        assert_eq!(value["metadata"]["reviewer"], "jane");
    }

    #[test]
    fn test_clear_judgment_resets_clause_and_tasks() {
        let mut clause = Clause::new("C1", "t", "x");
        clause.tasks.push(AuditTask::new("task_001", "check rotation"));
        clause.apply_judgment(Judgment {
            compliant: false,
            compliance_description: "missing".into(),
            improvement_suggestions: "write it down".into(),
        });
        clause.clear_judgment();
        assert!(clause.judgment().is_none());
        assert_eq!(clause.tasks[0].compliant, TriState::Unknown);
        assert_eq!(clause.tasks[0].metadata, TaskMetadata::default());
    }

    #[test]
    fn test_apply_judgment_mirrors_onto_tasks() {
        let mut clause = Clause::new("C1", "t", "x");
        clause.tasks.push(AuditTask::new("a", "one"));
        clause.tasks.push(AuditTask::new("b", "two"));
        clause.apply_judgment(Judgment {
            compliant: true,
            compliance_description: "covered".into(),
            improvement_suggestions: "none".into(),
        });
        for task in &clause.tasks {
            assert_eq!(task.compliant, TriState::True);
            assert_eq!(task.metadata.compliance_description.as_deref(), Some("covered"));
            assert_eq!(task.metadata.improvement_suggestions.as_deref(), Some("none"));
        }
    }
}
