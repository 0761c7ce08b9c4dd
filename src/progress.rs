//! Pipeline progress reporting.
//!
//! The orchestrator calls [`ProgressReporter::report`] synchronously at every
//! checkpoint with the overall fraction complete and a payload: a plain
//! message, or during Audit-Plan a structured [`AuditPlanEvent`] that lets a
//! front end render the generated plan as it grows.
//!
//! Progress is emitted on **stderr** so stdout stays parseable for scripts.
//! Any `Fn(f64, ProgressPayload)` closure is also a reporter.

use serde::{Deserialize, Serialize};
use std::io::Write;

/// One generated task, as shown in a plan event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlannedTask {
    pub id: String,
    pub sentence: String,
}

/// Live update from the Audit-Plan stage.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct AuditPlanEvent {
    pub clause_id: Option<String>,
    pub clause_title: Option<String>,
    pub tasks: Vec<PlannedTask>,
    pub no_audit_needed: bool,
    /// Set on the final event of the stage; the plan may now be reviewed.
    pub plan_generation_complete: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ProgressPayload {
    Message(String),
    AuditPlan(AuditPlanEvent),
}

pub trait ProgressReporter: Send + Sync {
    /// `fraction` is in `[0, 1]`.
    fn report(&self, fraction: f64, payload: ProgressPayload);
}

impl<F> ProgressReporter for F
where
    F: Fn(f64, ProgressPayload) + Send + Sync,
{
    fn report(&self, fraction: f64, payload: ProgressPayload) {
        self(fraction, payload)
    }
}

/// Human-friendly progress on stderr: `[ 45%] Audit-Plan: C001 Passwords (2 tasks)`.
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, fraction: f64, payload: ProgressPayload) {
        let pct = format_percent(fraction);
        let out = match &payload {
            ProgressPayload::Message(msg) => format!("[{}] {}\n", pct, msg),
            ProgressPayload::AuditPlan(event) if event.plan_generation_complete => {
                format!("[{}] Audit-Plan: plan generation complete\n", pct)
            }
            ProgressPayload::AuditPlan(event) => {
                let label = match (&event.clause_id, &event.clause_title) {
                    (Some(id), Some(title)) if !title.is_empty() => format!("{} {}", id, title),
                    (Some(id), _) => id.clone(),
                    (None, _) => "?".to_string(),
                };
                if event.no_audit_needed {
                    format!("[{}] Audit-Plan: {} (no audit needed)\n", pct, label)
                } else {
                    let mut s = format!(
                        "[{}] Audit-Plan: {} ({} task{})\n",
                        pct,
                        label,
                        event.tasks.len(),
                        if event.tasks.len() == 1 { "" } else { "s" }
                    );
                    for task in &event.tasks {
                        s.push_str(&format!("        - {}: {}\n", task.id, task.sentence));
                    }
                    s
                }
            }
        };
        let _ = std::io::stderr().lock().write_all(out.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, fraction: f64, payload: ProgressPayload) {
        let obj = match &payload {
            ProgressPayload::Message(msg) => serde_json::json!({
                "event": "progress",
                "fraction": fraction,
                "message": msg,
            }),
            ProgressPayload::AuditPlan(event) => serde_json::json!({
                "event": "audit_plan",
                "fraction": fraction,
                "plan": event,
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _fraction: f64, _payload: ProgressPayload) {}
}

fn format_percent(fraction: f64) -> String {
    let pct = (fraction.clamp(0.0, 1.0) * 100.0).round() as u32;
    format!("{:>3}%", pct)
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
