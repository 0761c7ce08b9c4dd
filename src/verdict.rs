//! Assessment aggregation over a [`RunState`].
//!
//! Aggregation uses one total order, most severe first:
//! `Fail > Partial > Inconclusive > Pass`. A set of assessments is `Pass`
//! only when every member passed; an empty set is `Inconclusive`.

use serde::Serialize;
use std::fmt;

use crate::models::{Clause, RunState, TriState};

/// Ordered by severity: the maximum of a set is its aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssessmentStatus {
    Pass,
    Inconclusive,
    Partial,
    Fail,
}

pub fn aggregate(statuses: &[AssessmentStatus]) -> AssessmentStatus {
    statuses
        .iter()
        .copied()
        .max()
        .unwrap_or(AssessmentStatus::Inconclusive)
}

/// Where a single clause stands after the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClauseStatus {
    /// Need-Check decided no documented procedure is required.
    NotRequired,
    /// Need-Check has not produced an answer yet.
    Undetermined,
    Pass,
    Partial,
    Fail,
    Inconclusive,
}

impl ClauseStatus {
    pub fn assessment(&self) -> Option<AssessmentStatus> {
        match self {
            ClauseStatus::NotRequired => None,
            ClauseStatus::Undetermined | ClauseStatus::Inconclusive => {
                Some(AssessmentStatus::Inconclusive)
            }
            ClauseStatus::Pass => Some(AssessmentStatus::Pass),
            ClauseStatus::Partial => Some(AssessmentStatus::Partial),
            ClauseStatus::Fail => Some(AssessmentStatus::Fail),
        }
    }
}

impl fmt::Display for ClauseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClauseStatus::NotRequired => "not required",
            ClauseStatus::Undetermined => "undetermined",
            ClauseStatus::Pass => "pass",
            ClauseStatus::Partial => "partial",
            ClauseStatus::Fail => "fail",
            ClauseStatus::Inconclusive => "inconclusive",
        };
        f.pad(s)
    }
}

impl fmt::Display for AssessmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AssessmentStatus::Pass => "pass",
            AssessmentStatus::Inconclusive => "inconclusive",
            AssessmentStatus::Partial => "partial",
            AssessmentStatus::Fail => "fail",
        };
        f.pad(s)
    }
}

/// A compliant verdict counts as `Pass` only when every task found evidence.
pub fn clause_status(clause: &Clause) -> ClauseStatus {
    match clause.need_procedure {
        TriState::False => return ClauseStatus::NotRequired,
        TriState::Unknown => return ClauseStatus::Undetermined,
        TriState::True => {}
    }
    match clause.judgment() {
        None => ClauseStatus::Inconclusive,
        Some(j) if !j.compliant => ClauseStatus::Fail,
        Some(_) if clause.tasks.iter().all(|t| !t.top_k.is_empty()) => ClauseStatus::Pass,
        Some(_) => ClauseStatus::Partial,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClauseSummary {
    pub id: String,
    pub title: String,
    pub status: ClauseStatus,
    pub tasks: usize,
    pub tasks_with_evidence: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compliance_description: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub project_name: String,
    pub overall: AssessmentStatus,
    pub clauses: Vec<ClauseSummary>,
}

impl RunSummary {
    pub fn from_run_state(state: &RunState) -> Self {
        let clauses: Vec<ClauseSummary> = state
            .clauses
            .iter()
            .map(|c| ClauseSummary {
                id: c.id.clone(),
                title: c.title.clone(),
                status: clause_status(c),
                tasks: c.tasks.len(),
                tasks_with_evidence: c.tasks.iter().filter(|t| !t.top_k.is_empty()).count(),
                compliance_description: c.judgment().map(|j| j.compliance_description.clone()),
            })
            .collect();
        let assessed: Vec<AssessmentStatus> =
            clauses.iter().filter_map(|c| c.status.assessment()).collect();
        Self {
            project_name: state.project_name.clone(),
            overall: aggregate(&assessed),
            clauses,
        }
    }

    pub fn count(&self, status: ClauseStatus) -> usize {
        self.clauses.iter().filter(|c| c.status == status).count()
    }
}
