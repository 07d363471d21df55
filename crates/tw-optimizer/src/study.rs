//! The study: trial proposal, intermediate reports, pruning decisions and
//! terminal results over a pluggable storage.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use tw_types::{
    config_error, Hyperparameters, ObjectiveDirection, TrialHandle, TrialRecord, TrialReporter,
    TrialResolution, TrialStatus, TwResult,
};

use crate::pruner::{Pruner, PrunerConfig};
use crate::storage::{InMemoryStorage, JournalFileStorage, StudyStorage};

/// A named search over one objective.
#[derive(Clone)]
pub struct Study {
    name: String,
    direction: ObjectiveDirection,
    storage: Arc<dyn StudyStorage>,
    pruner: Arc<dyn Pruner>,
}

impl std::fmt::Debug for Study {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Study")
            .field("name", &self.name)
            .field("direction", &self.direction)
            .field("pruner", &self.pruner.name())
            .finish()
    }
}

impl Study {
    /// Create a study, or with `load_if_exists` attach to an existing one.
    pub fn create(
        name: impl Into<String>,
        direction: ObjectiveDirection,
        storage: Arc<dyn StudyStorage>,
        pruner: Arc<dyn Pruner>,
        load_if_exists: bool,
    ) -> TwResult<Self> {
        let name = name.into();
        let stored = storage.create_study(&name, direction, load_if_exists)?;
        if stored != direction {
            warn!(study = %name, requested = ?direction, stored = ?stored, "using stored objective direction");
        }
        Ok(Self {
            name,
            direction: stored,
            storage,
            pruner,
        })
    }

    /// Attach to an existing study.
    pub fn load(
        name: impl Into<String>,
        storage: Arc<dyn StudyStorage>,
        pruner: Arc<dyn Pruner>,
    ) -> TwResult<Self> {
        let name = name.into();
        let direction = storage.load_study(&name)?;
        Ok(Self {
            name,
            direction,
            storage,
            pruner,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> ObjectiveDirection {
        self.direction
    }

    /// Register a new running trial and hand out its identity.
    pub fn propose_trial(&self) -> TwResult<TrialHandle> {
        let trial = self.storage.create_trial(&self.name)?;
        debug!(study = %self.name, trial = trial.number, "proposed trial");
        Ok(TrialHandle::new(self.name.clone(), trial.number))
    }

    pub fn record_result(&self, trial: &TrialHandle, resolution: TrialResolution) -> TwResult<()> {
        match &resolution {
            TrialResolution::Completed { value } => {
                info!(trial = trial.number, value, "trial completed")
            }
            TrialResolution::Pruned => info!(trial = trial.number, "trial pruned"),
            TrialResolution::Failed { error } => {
                warn!(trial = trial.number, error = %error, "trial failed")
            }
        }
        self.storage.finish_trial(&self.name, trial.number, resolution)
    }

    pub fn trials(&self) -> TwResult<Vec<TrialRecord>> {
        self.storage.trials(&self.name)
    }

    pub fn trial(&self, number: u64) -> TwResult<TrialRecord> {
        self.storage.trial(&self.name, number)
    }

    /// Best completed trial under the study's direction.
    pub fn best_trial(&self) -> TwResult<Option<TrialRecord>> {
        Ok(best_of(self.trials()?, self.direction))
    }

    pub fn summary(&self) -> TwResult<StudySummary> {
        let trials = self.trials()?;
        let count = |status: TrialStatus| trials.iter().filter(|t| t.status == status).count();

        Ok(StudySummary {
            name: self.name.clone(),
            direction: self.direction,
            trials_total: trials.len(),
            trials_running: count(TrialStatus::Running),
            trials_completed: count(TrialStatus::Completed),
            trials_pruned: count(TrialStatus::Pruned),
            trials_failed: count(TrialStatus::Failed),
            best_trial: best_of(trials, self.direction),
        })
    }
}

fn best_of(trials: Vec<TrialRecord>, direction: ObjectiveDirection) -> Option<TrialRecord> {
    let mut best: Option<TrialRecord> = None;
    for trial in trials {
        if trial.status != TrialStatus::Completed {
            continue;
        }
        let Some(value) = trial.value else { continue };
        let dominated = match best.as_ref().and_then(|b| b.value) {
            None => true,
            Some(incumbent) => direction.improves(value, incumbent),
        };
        if dominated {
            best = Some(trial);
        }
    }
    best
}

impl TrialReporter for Study {
    fn record_params(&self, trial: &TrialHandle, params: &Hyperparameters) -> TwResult<()> {
        self.storage.set_params(&trial.study, trial.number, params)
    }

    fn report(&self, trial: &TrialHandle, step: u64, value: f64) -> TwResult<()> {
        if !self.storage.report(&trial.study, trial.number, step, value)? {
            debug!(trial = trial.number, step, value, "step already reported, keeping first value");
        }
        Ok(())
    }

    fn should_prune(&self, trial: &TrialHandle) -> TwResult<bool> {
        let history = self.storage.trials(&trial.study)?;
        let current = history
            .iter()
            .find(|t| t.number == trial.number)
            .cloned()
            .ok_or_else(|| tw_types::PreconditionError::TrialNotFound {
                study: trial.study.clone(),
                number: trial.number,
            })?;
        let prune = self.pruner.prune(&current, &history, self.direction);
        if prune {
            debug!(
                trial = trial.number,
                pruner = self.pruner.name(),
                last = ?current.last_intermediate(),
                "pruner says stop"
            );
        }
        Ok(prune)
    }
}

/// Aggregate status of a study.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudySummary {
    pub name: String,
    pub direction: ObjectiveDirection,
    pub trials_total: usize,
    pub trials_running: usize,
    pub trials_completed: usize,
    pub trials_pruned: usize,
    pub trials_failed: usize,
    pub best_trial: Option<TrialRecord>,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Where the trial history lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum StudyMode {
    /// In-process only; the history dies with the process.
    Local,
    /// Journal in a directory shared between search processes.
    Shared {
        root: PathBuf,
        /// Create the study if missing; otherwise it must already exist.
        #[serde(default = "default_true")]
        create: bool,
    },
}

fn default_true() -> bool {
    true
}

impl Default for StudyMode {
    fn default() -> Self {
        StudyMode::Local
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StudyConfig {
    /// Study name. Required in shared mode; local studies get a fresh name.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub storage: StudyMode,
    #[serde(default)]
    pub direction: ObjectiveDirection,
    #[serde(default)]
    pub pruner: PrunerConfig,
}

impl StudyConfig {
    pub fn shared(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: Some(name.into()),
            storage: StudyMode::Shared {
                root: root.into(),
                create: true,
            },
            ..Self::default()
        }
    }

    pub fn with_pruner(mut self, pruner: PrunerConfig) -> Self {
        self.pruner = pruner;
        self
    }

    pub fn with_direction(mut self, direction: ObjectiveDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn open_study(&self) -> TwResult<Study> {
        let pruner = self.pruner.build()?;
        match &self.storage {
            StudyMode::Local => {
                let name = self
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("study-{}", Uuid::new_v4()));
                Study::create(
                    name,
                    self.direction,
                    Arc::new(InMemoryStorage::new()),
                    pruner,
                    false,
                )
            }
            StudyMode::Shared { root, create } => {
                let name = self
                    .name
                    .clone()
                    .ok_or_else(|| config_error!("shared studies need a name"))?;
                let storage: Arc<dyn StudyStorage> = Arc::new(JournalFileStorage::new(root)?);
                info!(study = %name, root = %root.display(), create, "opening shared study");
                if *create {
                    Study::create(name, self.direction, storage, pruner, true)
                } else {
                    Study::load(name, storage, pruner)
                }
            }
        }
    }
}
