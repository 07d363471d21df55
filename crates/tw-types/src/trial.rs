//! Trial records, runner outcomes, and the reporting seam between runners and
//! the study.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::errors::{TwError, TwResult};
use crate::params::Hyperparameters;

/// Monotonically increasing trial index within a study. Also the trial's seed.
pub type TrialNumber = u64;

/// Whether we are maximizing or minimizing the objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveDirection {
    Maximize,
    Minimize,
}

impl Default for ObjectiveDirection {
    fn default() -> Self {
        Self::Maximize
    }
}

impl ObjectiveDirection {
    /// True when `candidate` is strictly better than `incumbent`.
    pub fn improves(self, candidate: f64, incumbent: f64) -> bool {
        match self {
            ObjectiveDirection::Maximize => candidate > incumbent,
            ObjectiveDirection::Minimize => candidate < incumbent,
        }
    }
}

/// What a runner or coordinator hands to a study-side consumer: the trial's
/// identity within its study.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialHandle {
    pub study: String,
    pub number: TrialNumber,
}

impl TrialHandle {
    pub fn new(study: impl Into<String>, number: TrialNumber) -> Self {
        Self {
            study: study.into(),
            number,
        }
    }
}

impl std::fmt::Display for TrialHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.study, self.number)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    Running,
    Completed,
    Pruned,
    Failed,
}

impl TrialStatus {
    pub fn is_finished(self) -> bool {
        !matches!(self, TrialStatus::Running)
    }
}

/// Terminal resolution recorded by the study for a trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TrialResolution {
    Completed { value: f64 },
    Pruned,
    Failed { error: String },
}

/// A single trial as persisted by the study.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub id: Uuid,
    pub number: TrialNumber,
    pub params: Hyperparameters,
    /// Intermediate values keyed by step (cumulative training frames).
    pub intermediate_values: BTreeMap<u64, f64>,
    pub status: TrialStatus,
    pub value: Option<f64>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TrialRecord {
    pub fn new(number: TrialNumber) -> Self {
        Self {
            id: Uuid::new_v4(),
            number,
            params: Hyperparameters::new(),
            intermediate_values: BTreeMap::new(),
            status: TrialStatus::Running,
            value: None,
            error: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Record an intermediate value. The first report for a step wins;
    /// returns false when the step was already reported.
    pub fn report(&mut self, step: u64, value: f64) -> bool {
        if self.intermediate_values.contains_key(&step) {
            return false;
        }
        self.intermediate_values.insert(step, value);
        true
    }

    /// Most recent (highest-step) intermediate report.
    pub fn last_intermediate(&self) -> Option<(u64, f64)> {
        self.intermediate_values
            .iter()
            .next_back()
            .map(|(step, value)| (*step, *value))
    }

    pub fn resolve(&mut self, resolution: TrialResolution) {
        self.finished_at = Some(Utc::now());
        match resolution {
            TrialResolution::Completed { value } => {
                self.status = TrialStatus::Completed;
                self.value = Some(value);
            }
            TrialResolution::Pruned => {
                self.status = TrialStatus::Pruned;
                self.value = self.last_intermediate().map(|(_, v)| v);
            }
            TrialResolution::Failed { error } => {
                self.status = TrialStatus::Failed;
                self.error = Some(error);
            }
        }
    }
}

/// Tri-state result of a runner, a worker task, or a whole trial.
///
/// `Pruned` is a controlled early stop and never an error; callers must keep
/// it apart from `Failed`.
#[derive(Debug)]
pub enum TrialOutcome<T> {
    Completed(T),
    Pruned { step: u64, value: f64 },
    Failed(TwError),
}

impl<T> TrialOutcome<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, TrialOutcome::Completed(_))
    }

    pub fn is_pruned(&self) -> bool {
        matches!(self, TrialOutcome::Pruned { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, TrialOutcome::Failed(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> TrialOutcome<U> {
        match self {
            TrialOutcome::Completed(value) => TrialOutcome::Completed(f(value)),
            TrialOutcome::Pruned { step, value } => TrialOutcome::Pruned { step, value },
            TrialOutcome::Failed(error) => TrialOutcome::Failed(error),
        }
    }
}

impl<T> From<TwResult<T>> for TrialOutcome<T> {
    fn from(result: TwResult<T>) -> Self {
        match result {
            Ok(value) => TrialOutcome::Completed(value),
            Err(error) => TrialOutcome::Failed(error),
        }
    }
}

/// The pruning controller as seen from inside a runner.
///
/// Implemented by the study; runners on worker threads hold it behind an
/// `Arc` and call it at every evaluation boundary.
pub trait TrialReporter: Send + Sync {
    /// Attach the sampled assignment to the trial.
    fn record_params(&self, trial: &TrialHandle, params: &Hyperparameters) -> TwResult<()>;

    /// Report an intermediate objective value at `step`.
    fn report(&self, trial: &TrialHandle, step: u64, value: f64) -> TwResult<()>;

    /// Whether the trial's intermediate history says it should stop now.
    fn should_prune(&self, trial: &TrialHandle) -> TwResult<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PreconditionError;

    #[test]
    fn trial_lifecycle() {
        let mut trial = TrialRecord::new(3);
        assert_eq!(trial.status, TrialStatus::Running);
        assert!(!trial.status.is_finished());

        assert!(trial.report(100, 0.2));
        assert!(trial.report(200, 0.4));
        assert_eq!(trial.last_intermediate(), Some((200, 0.4)));

        trial.resolve(TrialResolution::Completed { value: 0.4 });
        assert_eq!(trial.status, TrialStatus::Completed);
        assert_eq!(trial.value, Some(0.4));
        assert!(trial.finished_at.is_some());
    }

    #[test]
    fn duplicate_step_keeps_first_report() {
        let mut trial = TrialRecord::new(0);
        assert!(trial.report(500, 0.1));
        assert!(!trial.report(500, 0.9));
        assert_eq!(trial.intermediate_values.get(&500), Some(&0.1));
    }

    #[test]
    fn pruned_trial_keeps_last_intermediate_value() {
        let mut trial = TrialRecord::new(1);
        trial.report(100, 0.3);
        trial.report(200, 0.1);
        trial.resolve(TrialResolution::Pruned);
        assert_eq!(trial.status, TrialStatus::Pruned);
        assert_eq!(trial.value, Some(0.1));
    }

    #[test]
    fn trial_failure() {
        let mut trial = TrialRecord::new(0);
        trial.resolve(TrialResolution::Failed {
            error: "runner panicked".into(),
        });
        assert_eq!(trial.status, TrialStatus::Failed);
        assert_eq!(trial.error.as_deref(), Some("runner panicked"));
    }

    #[test]
    fn direction_improves() {
        assert!(ObjectiveDirection::Maximize.improves(2.0, 1.0));
        assert!(!ObjectiveDirection::Maximize.improves(1.0, 1.0));
        assert!(ObjectiveDirection::Minimize.improves(0.5, 1.0));
    }

    #[test]
    fn outcome_from_result_and_map() {
        let ok: TrialOutcome<f64> = TwResult::Ok(1.5).into();
        assert!(ok.is_completed());
        assert!(matches!(ok.map(|v| v * 2.0), TrialOutcome::Completed(v) if v == 3.0));

        let err: TrialOutcome<f64> = TwResult::Err(
            PreconditionError::EvaluationShape {
                message: "two series".into(),
            }
            .into(),
        )
        .into();
        assert!(err.is_failed());

        let pruned: TrialOutcome<f64> = TrialOutcome::Pruned {
            step: 100,
            value: -0.2,
        };
        assert!(pruned.is_pruned());
        assert!(!pruned.is_failed());
    }

    #[test]
    fn resolution_serializes_with_status_tag() {
        let json = serde_json::to_value(TrialResolution::Completed { value: 0.5 }).unwrap();
        assert_eq!(json, serde_json::json!({"status": "completed", "value": 0.5}));
    }
}
