//! The four-stage audit pipeline.
//!
//! ```text
//! Init -> Need-Check -> Audit-Plan -> Search -> Judge -> Done
//! ```
//!
//! Every stage walks its units (clauses or tasks) in order and skips any unit
//! whose output is already determined, so a run interrupted at any point can
//! simply be started again. The [`RunState`] is checkpointed after every unit.
//!
//! Per-unit language-model failures leave the unit undetermined and the run
//! continues. Authentication failures abort the whole run.

use std::collections::{HashMap, HashSet};

use serde_json::{Map, Value};

use crate::cache::ContentCache;
use crate::config::Config;
use crate::connector_fs::discover;
use crate::embedding::Embedder;
use crate::error::PipelineError;
use crate::index::{IndexManager, VectorIndex};
use crate::ingest::ingest;
use crate::llm::{ExpectedShape, Gateway, LanguageModel, LlmOutput};
use crate::models::{AuditTask, Clause, EmbeddingChunk, Judgment, RunState, TriState};
use crate::normalize::normalize;
use crate::progress::{AuditPlanEvent, PlannedTask, ProgressPayload, ProgressReporter};
use crate::retrieve::retrieve;
use crate::run_state::{merge, parse_regulation, RunStateStore};

pub const CANCELLED_MESSAGE: &str = "Pipeline cancelled.";

const NEED_CHECK_KEY: &str = "requires_procedure";
const AUDIT_TASKS_KEY: &str = "audit_tasks";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    NeedCheck,
    AuditPlan,
    Search,
    Judge,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::NeedCheck, Stage::AuditPlan, Stage::Search, Stage::Judge];

    pub fn label(&self) -> &'static str {
        match self {
            Stage::NeedCheck => "Need-Check",
            Stage::AuditPlan => "Audit-Plan",
            Stage::Search => "Search",
            Stage::Judge => "Judge",
        }
    }

    /// Share of overall progress owned by the stage.
    fn span(&self) -> (f64, f64) {
        match self {
            Stage::NeedCheck => (0.1, 0.3),
            Stage::AuditPlan => (0.3, 0.6),
            Stage::Search => (0.6, 0.8),
            Stage::Judge => (0.8, 1.0),
        }
    }

    fn fraction(&self, done: usize, total: usize) -> f64 {
        let (start, end) = self.span();
        if total == 0 {
            return end;
        }
        start + (end - start) * done as f64 / total as f64
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Pause after this stage; the next run resumes where it left off.
    pub stop_after: Option<Stage>,
    pub force_rebuild_index: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Cancelled,
    Stopped(Stage),
}

enum Step {
    Continue,
    Cancelled,
}

/// Procedure corpus prepared for the Search stage.
struct Corpus {
    index: VectorIndex,
    lookup: HashMap<String, EmbeddingChunk>,
}

enum Prepared {
    Ready(Corpus),
    Missing,
    Cancelled,
}

pub struct Pipeline<'a> {
    config: &'a Config,
    backend: &'a dyn LanguageModel,
    progress: &'a dyn ProgressReporter,
    cancel: &'a dyn Fn() -> bool,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        config: &'a Config,
        backend: &'a dyn LanguageModel,
        progress: &'a dyn ProgressReporter,
        cancel: &'a dyn Fn() -> bool,
    ) -> Self {
        Self {
            config,
            backend,
            progress,
            cancel,
        }
    }

    pub async fn run(&self, opts: &RunOptions) -> Result<RunOutcome, PipelineError> {
        let regulation_path = &self.config.project.regulation;
        let regulation = parse_regulation(regulation_path)?;
        if regulation.clauses.is_empty() {
            return Err(PipelineError::NoClauses(regulation_path.clone()));
        }

        let store = RunStateStore::new(&self.config.project_dir());
        let persisted = store.load().map_err(|source| PipelineError::Checkpoint {
            path: store.path().to_path_buf(),
            source,
        })?;
        let mut state = merge(&self.config.project.name, regulation.clauses, persisted);
        store.save(&state)?;
        tracing::info!(
            project = %state.project_name,
            regulation = regulation.name.as_deref().unwrap_or("-"),
            clauses = state.clauses.len(),
            "pipeline: run state ready"
        );
        self.message(
            0.0,
            format!(
                "Loaded {} clauses for project '{}'.",
                state.clauses.len(),
                state.project_name
            ),
        );

        let cache = ContentCache::new(&self.config.paths.data_dir, &self.config.project.name);

        for stage in Stage::ALL {
            tracing::info!(stage = stage.label(), "pipeline: stage start");
            let step = match stage {
                Stage::NeedCheck => self.need_check(&mut state, &store).await?,
                Stage::AuditPlan => self.audit_plan(&mut state, &store, &cache).await?,
                Stage::Search => self.search(&mut state, &store, &cache, opts).await?,
                Stage::Judge => self.judge(&mut state, &store).await?,
            };
            if let Step::Cancelled = step {
                tracing::info!(stage = stage.label(), "pipeline: cancelled");
                return Ok(RunOutcome::Cancelled);
            }
            if opts.stop_after == Some(stage) {
                let (_, end) = stage.span();
                self.message(end, format!("Stopped after {}.", stage.label()));
                return Ok(RunOutcome::Stopped(stage));
            }
        }

        self.message(1.0, "Pipeline complete.".to_string());
        Ok(RunOutcome::Completed)
    }

    fn message(&self, fraction: f64, text: String) {
        self.progress.report(fraction, ProgressPayload::Message(text));
    }

    /// Polls the cancellation predicate, reporting the cancellation if set.
    fn cancelled(&self, fraction: f64) -> bool {
        if (self.cancel)() {
            self.message(fraction, CANCELLED_MESSAGE.to_string());
            return true;
        }
        false
    }

    async fn need_check(
        &self,
        state: &mut RunState,
        store: &RunStateStore,
    ) -> Result<Step, PipelineError> {
        let stage = Stage::NeedCheck;
        let gateway = Gateway::new(self.backend);
        let model = self.config.llm.need_check_model.as_str();
        let total = state.clauses.len();

        for i in 0..total {
            if self.cancelled(stage.fraction(i, total)) {
                return Ok(Step::Cancelled);
            }
            let done = stage.fraction(i + 1, total);
            let clause = &mut state.clauses[i];
            let id = clause.id.clone();
            if !clause.need_procedure.is_unknown() {
                self.message(done, format!("Need-Check: Clause {} (skipped)", id));
                continue;
            }

            let answer = gateway
                .call(
                    &need_check_prompt(clause),
                    model,
                    ExpectedShape::BooleanFlag {
                        key: NEED_CHECK_KEY,
                    },
                )
                .await?
                .and_then(LlmOutput::into_flag);
            let outcome = match answer {
                Some(flag) => {
                    clause.need_procedure = flag.into();
                    tracing::info!(clause = %id, need_procedure = flag, "need-check done");
                    flag.to_string()
                }
                None => {
                    tracing::warn!(clause = %id, "need-check undetermined, will retry next run");
                    "undetermined".to_string()
                }
            };
            store.save(state)?;
            self.message(done, format!("Need-Check: Clause {} -> {}", id, outcome));
        }
        Ok(Step::Continue)
    }

    async fn audit_plan(
        &self,
        state: &mut RunState,
        store: &RunStateStore,
        cache: &ContentCache,
    ) -> Result<Step, PipelineError> {
        let stage = Stage::AuditPlan;
        let gateway = Gateway::new(self.backend);
        let model = self.config.llm.audit_plan_model.as_str();
        let total = state.clauses.len();

        for i in 0..total {
            if self.cancelled(stage.fraction(i, total)) {
                return Ok(Step::Cancelled);
            }
            let done = stage.fraction(i + 1, total);
            let clause = &mut state.clauses[i];
            let mut event = AuditPlanEvent {
                clause_id: Some(clause.id.clone()),
                clause_title: Some(clause.title.clone()),
                ..Default::default()
            };

            match clause.need_procedure {
                TriState::False => {
                    event.no_audit_needed = true;
                    self.progress.report(done, ProgressPayload::AuditPlan(event));
                    continue;
                }
                TriState::Unknown => {
                    self.message(
                        done,
                        format!("Audit-Plan: Clause {} (skipped, need undetermined)", clause.id),
                    );
                    continue;
                }
                TriState::True => {}
            }

            if clause.tasks.is_empty() {
                let key = ContentCache::key(&["audit-plan", model, &clause.text]);
                let plan = match cache.get_record::<Vec<PlannedTask>>(&key) {
                    Some(plan) => Some(plan),
                    None => {
                        let reply = gateway
                            .call(
                                &audit_plan_prompt(clause),
                                model,
                                ExpectedShape::ObjectList {
                                    key: AUDIT_TASKS_KEY,
                                },
                            )
                            .await?
                            .and_then(LlmOutput::into_list);
                        reply.map(|items| {
                            let plan = plan_tasks(items);
                            cache.put_record(&key, &plan);
                            plan
                        })
                    }
                };
                match plan {
                    Some(plan) => {
                        tracing::info!(clause = %clause.id, tasks = plan.len(), "audit plan ready");
                        clause.tasks = plan
                            .into_iter()
                            .map(|t| AuditTask::new(t.id, t.sentence))
                            .collect();
                    }
                    None => {
                        tracing::warn!(clause = %clause.id, "audit plan undetermined, will retry next run");
                    }
                }
                event.tasks = planned(clause);
                store.save(state)?;
            } else {
                event.tasks = planned(clause);
            }
            self.progress.report(done, ProgressPayload::AuditPlan(event));
        }

        let (_, end) = stage.span();
        self.progress.report(
            end,
            ProgressPayload::AuditPlan(AuditPlanEvent {
                plan_generation_complete: true,
                ..Default::default()
            }),
        );
        Ok(Step::Continue)
    }

    async fn search(
        &self,
        state: &mut RunState,
        store: &RunStateStore,
        cache: &ContentCache,
        opts: &RunOptions,
    ) -> Result<Step, PipelineError> {
        let stage = Stage::Search;
        let (start, end) = stage.span();

        let pending: Vec<(usize, usize)> = state
            .clauses
            .iter()
            .enumerate()
            .filter(|(_, c)| c.need_procedure == TriState::True)
            .flat_map(|(ci, c)| {
                c.tasks
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| t.top_k.is_empty())
                    .map(move |(ti, _)| (ci, ti))
            })
            .collect();
        if pending.is_empty() {
            self.message(end, "Search: No pending tasks.".to_string());
            return Ok(Step::Continue);
        }

        let corpus = match self.prepare_corpus(cache, opts.force_rebuild_index, start).await? {
            Prepared::Ready(corpus) => corpus,
            Prepared::Missing => return Ok(Step::Continue),
            Prepared::Cancelled => return Ok(Step::Cancelled),
        };

        let embedder = Embedder::new(self.backend, cache, self.config.embedding.batch_size);
        let model = self.config.embedding.model.as_str();
        let total = pending.len();
        for (n, (ci, ti)) in pending.into_iter().enumerate() {
            if self.cancelled(stage.fraction(n, total)) {
                return Ok(Step::Cancelled);
            }
            let done = stage.fraction(n + 1, total);
            let clause = &mut state.clauses[ci];
            let task = &mut clause.tasks[ti];
            let task_id = task.id.clone();

            let Some(query) = embedder.embed_query(&task.sentence, model).await? else {
                tracing::warn!(task = %task_id, "search: no query vector, will retry next run");
                self.message(done, format!("Search: Task {} (query not embedded)", task_id));
                continue;
            };
            task.top_k = retrieve(
                &query,
                &corpus.index,
                &corpus.lookup,
                self.config.retrieval.top_k,
            );
            let found = task.top_k.len();
            tracing::info!(task = %task_id, matches = found, "search done");
            if found > 0 && clause.judgment().is_some() {
                // Judged without this evidence; Judge picks the clause up again.
                tracing::info!(clause = %clause.id, "search: new evidence, judgment cleared");
                clause.clear_judgment();
            }
            store.save(state)?;
            self.message(done, format!("Search: Task {} -> {} matches", task_id, found));
        }
        Ok(Step::Continue)
    }

    /// discover -> ingest -> normalize -> embed -> build_or_load.
    async fn prepare_corpus(
        &self,
        cache: &ContentCache,
        force_rebuild: bool,
        fraction: f64,
    ) -> Result<Prepared, PipelineError> {
        let procedures = &self.config.procedures;
        let files = match discover(procedures) {
            Ok(files) => files,
            Err(e) => {
                tracing::warn!(root = %procedures.root.display(), error = %e, "search: discovery failed");
                Vec::new()
            }
        };
        if files.is_empty() {
            self.message(fraction, "Search: No procedure documents to process.".to_string());
            return Ok(Prepared::Missing);
        }

        let report = ingest(&files, &procedures.doc_type);
        for failure in &report.failures {
            tracing::warn!(path = %failure.path.display(), error = %failure.error, "search: document skipped");
        }

        let embedder = Embedder::new(self.backend, cache, self.config.embedding.batch_size);
        let mut chunks = Vec::new();
        for raw in &report.documents {
            if self.cancelled(fraction) {
                return Ok(Prepared::Cancelled);
            }
            let doc = normalize(raw);
            let embedded = embedder
                .embed(&doc, &self.config.embedding.model, self.config.embedding.max_tokens)
                .await?;
            chunks.extend(embedded);
        }
        if chunks.is_empty() {
            self.message(fraction, "Search: No procedure chunks were embedded.".to_string());
            return Ok(Prepared::Missing);
        }

        let index = IndexManager::new(&self.config.project_dir())
            .build_or_load(
                &chunks,
                &procedures.doc_type,
                &self.config.embedding.model,
                force_rebuild,
            )
            .map_err(|e| PipelineError::Index(e.to_string()))?;
        let Some(index) = index else {
            self.message(fraction, "Search: No procedure vectors to index.".to_string());
            return Ok(Prepared::Missing);
        };
        self.message(
            fraction,
            format!(
                "Search: {} documents, {} chunks indexed.",
                report.documents.len(),
                index.len()
            ),
        );

        let lookup = chunks.into_iter().map(|c| (c.id.clone(), c)).collect();
        Ok(Prepared::Ready(Corpus { index, lookup }))
    }

    async fn judge(
        &self,
        state: &mut RunState,
        store: &RunStateStore,
    ) -> Result<Step, PipelineError> {
        let stage = Stage::Judge;
        let gateway = Gateway::new(self.backend);
        let model = self.config.llm.judge_model.as_str();

        let pending: Vec<usize> = state
            .clauses
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.tasks.is_empty() && c.judgment().is_none())
            .map(|(i, _)| i)
            .collect();
        let total = pending.len();

        for (n, i) in pending.into_iter().enumerate() {
            if self.cancelled(stage.fraction(n, total)) {
                return Ok(Step::Cancelled);
            }
            let done = stage.fraction(n + 1, total);
            let clause = &mut state.clauses[i];
            let id = clause.id.clone();

            let reply = gateway
                .call(&judge_prompt(clause), model, ExpectedShape::GenericObject)
                .await?
                .and_then(LlmOutput::into_object);
            let Some(judgment) = reply.and_then(parse_judgment) else {
                tracing::warn!(clause = %id, "judge: no usable verdict, will retry next run");
                self.message(done, format!("Judge: Clause {} -> undetermined", id));
                continue;
            };
            let compliant = judgment.compliant;
            clause.apply_judgment(judgment);
            tracing::info!(clause = %id, compliant, "judgment stored");
            store.save(state)?;
            self.message(done, format!("Judge: Clause {} -> Compliant={}", id, compliant));
        }
        if total == 0 {
            let (_, end) = stage.span();
            self.message(end, "Judge: No clauses awaiting judgment.".to_string());
        }
        Ok(Step::Continue)
    }
}

fn planned(clause: &Clause) -> Vec<PlannedTask> {
    clause
        .tasks
        .iter()
        .map(|t| PlannedTask {
            id: t.id.clone(),
            sentence: t.sentence.clone(),
        })
        .collect()
}

fn need_check_prompt(clause: &Clause) -> String {
    format!(
        "Determine whether the following control clause requires a documented \
         procedure whose implementation can be verified by an audit.\n\
         Respond with a JSON object containing a single key '{}' with a boolean \
         value (true or false).\n\n\
         Control clause ({}): \"{}\"",
        NEED_CHECK_KEY, clause.title, clause.text
    )
}

fn audit_plan_prompt(clause: &Clause) -> String {
    format!(
        "Generate a list of concise, precise audit tasks that verify the \
         implementation of the following control clause. Each task is a single \
         sentence suitable as a search query against a library of procedure \
         documents.\n\
         Respond with a JSON object containing a single key '{}': a list of \
         objects, each with an 'id' (a unique string such as 'task_001') and a \
         'sentence'.\n\n\
         Control clause ({}): \"{}\"",
        AUDIT_TASKS_KEY, clause.title, clause.text
    )
}

fn judge_prompt(clause: &Clause) -> String {
    let tasks = clause
        .tasks
        .iter()
        .map(|t| format!("- {}: {}", t.id, t.sentence))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Assess whether the following control clause is effectively implemented, \
         based only on the audit tasks and the evidence excerpts below.\n\n\
         Control clause ({}): \"{}\"\n\n\
         Audit tasks:\n{}\n\n\
         Evidence:\n{}\n\n\
         Respond with a JSON object with the keys 'compliant' (boolean), \
         'compliance_description' (string) and 'improvement_suggestions' (string).",
        clause.title,
        clause.text,
        tasks,
        format_evidence(clause)
    )
}

/// Numbered evidence blocks across all tasks of a clause.
pub fn format_evidence(clause: &Clause) -> String {
    let blocks: Vec<String> = clause
        .tasks
        .iter()
        .flat_map(|t| t.top_k.iter())
        .enumerate()
        .map(|(i, ev)| {
            format!(
                "Evidence {} (Source: {}, Locator: {}, Score: {:.3}):\n{}",
                i + 1,
                ev.source_document_name,
                ev.locator.as_deref().unwrap_or("N/A"),
                ev.score,
                ev.excerpt
            )
        })
        .collect();
    if blocks.is_empty() {
        "No evidence found.".to_string()
    } else {
        blocks.join("\n\n")
    }
}

/// Turn a validated task list into tasks with trimmed, unique ids.
///
/// Items without a sentence are dropped. Missing ids become `task_NNN` by
/// position; a repeated id gets a `_2`, `_3`, ... suffix.
pub fn plan_tasks(items: Vec<Map<String, Value>>) -> Vec<PlannedTask> {
    let mut seen = HashSet::new();
    let mut tasks = Vec::new();
    for item in items {
        let sentence = item
            .get("sentence")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        if sentence.is_empty() {
            tracing::warn!(?item, "audit plan: task without sentence dropped");
            continue;
        }
        let raw_id = match item.get("id") {
            Some(Value::String(s)) => s.trim().to_string(),
            Some(Value::Number(n)) => n.to_string(),
            _ => String::new(),
        };
        let base = if raw_id.is_empty() {
            format!("task_{:03}", tasks.len() + 1)
        } else {
            raw_id
        };
        let mut id = base.clone();
        let mut suffix = 2;
        while !seen.insert(id.clone()) {
            id = format!("{}_{}", base, suffix);
            suffix += 1;
        }
        tasks.push(PlannedTask {
            id,
            sentence: sentence.to_string(),
        });
    }
    tasks
}

fn parse_judgment(obj: Map<String, Value>) -> Option<Judgment> {
    let Some(compliant) = obj.get("compliant").and_then(Value::as_bool) else {
        tracing::warn!("judge: reply has no boolean 'compliant'");
        return None;
    };
    let text = |key: &str| {
        obj.get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string()
    };
    Some(Judgment {
        compliant,
        compliance_description: text("compliance_description"),
        improvement_suggestions: text("improvement_suggestions"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EvidenceMatch;
    use serde_json::json;

    fn items(value: Value) -> Vec<Map<String, Value>> {
        value
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_object().unwrap().clone())
            .collect()
    }

    #[test]
    fn test_plan_tasks_ids() {
        let tasks = plan_tasks(items(json!([
            {"id": " a ", "sentence": "first"},
            {"sentence": "second"},
            {"id": "a", "sentence": "third"},
            {"id": "x", "sentence": "   "},
            {"id": 7, "sentence": "fourth"}
        ])));
        let ids: Vec<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "task_002", "a_2", "7"]);
        assert_eq!(tasks[1].sentence, "second");
    }

    #[test]
    fn test_format_evidence() {
        let mut clause = Clause::new("C1", "t", "x");
        assert_eq!(format_evidence(&clause), "No evidence found.");

        let mut task = AuditTask::new("task_001", "s");
        task.top_k.push(EvidenceMatch {
            excerpt: "Passwords rotate every 90 days.".into(),
            source_document_name: "security.md".into(),
            locator: Some("line 3".into()),
            score: 0.9123,
        });
        task.top_k.push(EvidenceMatch {
            excerpt: "Other".into(),
            source_document_name: "misc.txt".into(),
            locator: None,
            score: 0.5,
        });
        clause.tasks.push(task);
        assert_eq!(
            format_evidence(&clause),
            "Evidence 1 (Source: security.md, Locator: line 3, Score: 0.912):\n\
             Passwords rotate every 90 days.\n\n\
             Evidence 2 (Source: misc.txt, Locator: N/A, Score: 0.500):\nOther"
        );
    }

    #[test]
    fn test_parse_judgment() {
        let obj = json!({"compliant": true, "compliance_description": " ok "});
        let judgment = parse_judgment(obj.as_object().unwrap().clone()).unwrap();
        assert!(judgment.compliant);
        assert_eq!(judgment.compliance_description, "ok");
        assert_eq!(judgment.improvement_suggestions, "");

        let bad = json!({"compliant": "yes"});
        assert!(parse_judgment(bad.as_object().unwrap().clone()).is_none());
    }

    #[test]
    fn test_stage_fractions() {
        assert_eq!(Stage::NeedCheck.fraction(0, 4), 0.1);
        assert!((Stage::AuditPlan.fraction(2, 4) - 0.45).abs() < 1e-9);
        assert_eq!(Stage::Judge.fraction(0, 0), 1.0);
    }
}
