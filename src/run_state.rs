//! Regulation source parsing and durable run state.
//!
//! The clause list is parsed fresh from the regulation file on every run and
//! merged with the persisted [`RunState`] by clause id: the source decides
//! which clauses exist and what they say; the persisted state contributes the
//! pipeline-derived fields (`need_procedure`, `tasks`, `metadata`).
//!
//! [`RunStateStore::save`] writes `run.json` atomically (temp file + rename)
//! and propagates failures, since a lost checkpoint means lost work.

use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::cache::write_atomic;
use crate::error::PipelineError;
use crate::models::{Clause, RunState};

/// Reserved key holding the regulation set's label.
const NAME_KEY: &str = "name";

#[derive(Debug, Clone, PartialEq)]
pub struct Regulation {
    pub name: Option<String>,
    pub clauses: Vec<Clause>,
}

/// Parse a `clause_id -> "Title\nBody"` JSON map, preserving file order.
pub fn parse_regulation(path: &Path) -> Result<Regulation, PipelineError> {
    let content = std::fs::read_to_string(path).map_err(|e| PipelineError::Regulation {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    parse_regulation_str(&content).map_err(|message| PipelineError::Regulation {
        path: path.to_path_buf(),
        message,
    })
}

pub fn parse_regulation_str(content: &str) -> Result<Regulation, String> {
    let value: Value = serde_json::from_str(content).map_err(|e| e.to_string())?;
    let Value::Object(map) = value else {
        return Err("expected a JSON object of clause id to clause text".to_string());
    };

    let mut name = None;
    let mut clauses = Vec::new();
    for (key, value) in map {
        if key == NAME_KEY {
            name = value.as_str().map(str::to_string);
            continue;
        }
        let Value::String(raw) = value else {
            tracing::warn!(clause = %key, "regulation: clause value is not a string, skipped");
            continue;
        };
        let id = key.trim().to_string();
        if id.is_empty() {
            tracing::warn!("regulation: empty clause id, skipped");
            continue;
        }
        let (title, text) = split_title(&raw);
        clauses.push(Clause::new(id, title, text));
    }

    Ok(Regulation { name, clauses })
}

/// First non-empty line is the title; the rest is the body. A clause with no
/// body uses its single line for both.
fn split_title(raw: &str) -> (String, String) {
    let trimmed = raw.trim();
    match trimmed.split_once('\n') {
        Some((title, body)) if !body.trim().is_empty() => {
            (title.trim().to_string(), body.trim().to_string())
        }
        _ => (trimmed.to_string(), trimmed.to_string()),
    }
}

/// Combine freshly parsed source clauses with persisted progress.
pub fn merge(project_name: &str, source: Vec<Clause>, persisted: Option<RunState>) -> RunState {
    let mut previous: HashMap<String, Clause> = persisted
        .map(|state| {
            state
                .clauses
                .into_iter()
                .map(|c| (c.id.clone(), c))
                .collect()
        })
        .unwrap_or_default();

    let clauses = source
        .into_iter()
        .map(|mut clause| {
            if let Some(prev) = previous.remove(&clause.id) {
                clause.need_procedure = prev.need_procedure;
                clause.tasks = prev.tasks;
                clause.metadata = prev.metadata;
            }
            clause
        })
        .collect();

    let mut dropped: Vec<&String> = previous.keys().collect();
    dropped.sort();
    for id in dropped {
        tracing::warn!(clause = %id, "run state: clause no longer in regulation source, dropped");
    }

    RunState {
        project_name: project_name.to_string(),
        clauses,
    }
}

pub struct RunStateStore {
    path: PathBuf,
}

impl RunStateStore {
    pub fn new(project_dir: &Path) -> Self {
        Self {
            path: project_dir.join("run.json"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted state, if any.
    ///
    /// An unparseable file is moved aside to `run.json.corrupt-<timestamp>`
    /// and treated as absent.
    pub fn load(&self) -> std::io::Result<Option<RunState>> {
        let Some(bytes) = self.read_bytes()? else {
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                let mut aside = self.path.as_os_str().to_owned();
                aside.push(format!(".corrupt-{}", Utc::now().format("%Y%m%dT%H%M%S")));
                let aside = PathBuf::from(aside);
                tracing::warn!(
                    path = %self.path.display(),
                    moved_to = %aside.display(),
                    error = %e,
                    "run state unreadable, starting fresh"
                );
                std::fs::rename(&self.path, &aside)?;
                Ok(None)
            }
        }
    }

    /// Load the persisted state without touching the file. An unparseable
    /// file is an `InvalidData` error and stays where it is.
    pub fn load_readonly(&self) -> std::io::Result<Option<RunState>> {
        let Some(bytes) = self.read_bytes()? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    fn read_bytes(&self) -> std::io::Result<Option<Vec<u8>>> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn save(&self, state: &RunState) -> Result<(), PipelineError> {
        let checkpoint_err = |source: std::io::Error| PipelineError::Checkpoint {
            path: self.path.clone(),
            source,
        };
        let bytes = serde_json::to_vec_pretty(state).map_err(|e| checkpoint_err(e.into()))?;
        write_atomic(&self.path, &bytes).map_err(checkpoint_err)
    }
}
