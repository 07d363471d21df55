// Search driver
// Proposes trials until the study-wide budget is spent, evaluates each through
// the coordinator, records the outcome and finally exports the best trial.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tw_data::{BaselineTable, CheckpointStore, ScoreNormalizer};
use tw_optimizer::{RandomSampler, Study, StudySummary};
use tw_types::{config_error, Hyperparameters, TrialOutcome, TrialRecord, TrialResolution, TwResult};

use crate::config::{RetryConfig, SearchConfig};
use crate::coordinator::{TrialCoordinator, TrialObjective};
use crate::experiment::TrainerFactory;
use crate::pool::{PoolConfig, WorkerPool};

/// Contents of `best_params_<envs>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestTrialArtifact {
    pub study: String,
    pub envs: Vec<String>,
    pub number: u64,
    pub value: f64,
    pub params: Hyperparameters,
}

#[derive(Debug, Clone)]
pub struct DriverReport {
    pub summary: StudySummary,
    /// Trials evaluated by this driver, as opposed to the whole study.
    pub trials_run: u64,
    pub artifact: Option<PathBuf>,
}

pub struct SearchDriver {
    study: Arc<Study>,
    coordinator: TrialCoordinator,
    max_trials: u64,
    retry: RetryConfig,
    artifact_dir: PathBuf,
}

impl SearchDriver {
    pub fn new(
        study: Arc<Study>,
        coordinator: TrialCoordinator,
        max_trials: u64,
        retry: RetryConfig,
        artifact_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            study,
            coordinator,
            max_trials,
            retry,
            artifact_dir: artifact_dir.into(),
        }
    }

    /// Wire study, pool, checkpoint store and coordinator from a config.
    pub fn from_config(
        config: &SearchConfig,
        baselines: BaselineTable,
        factory: Arc<dyn TrainerFactory>,
    ) -> TwResult<Self> {
        config.validate()?;
        if factory.kind() != config.trainer {
            return Err(config_error!(
                "trainer factory builds {} but the search is configured for {}",
                factory.kind(),
                config.trainer
            ));
        }
        baselines.require_all(&config.envs)?;

        let space = config.search_space();
        space.validate()?;

        let study = Arc::new(config.study.open_study()?);
        let runner_resources = config.runner_resources();
        let n_envs = config.envs.len();
        let pool = WorkerPool::new(PoolConfig::new(
            n_envs,
            runner_resources.num_cpus * n_envs as f64,
            f64::from(config.num_gpus),
        ))?;
        let checkpoints = CheckpointStore::new(&config.checkpoint_root)?;

        let coordinator = TrialCoordinator::new(
            config.envs.clone(),
            config.runner_settings(),
            runner_resources,
            Arc::new(RandomSampler::with_seed(space, config.sampler_seed)),
            factory,
            study.clone(),
            Arc::new(ScoreNormalizer::new(baselines)),
            checkpoints,
            Arc::new(pool),
        )
        .with_prune_siblings(config.prune_siblings);

        Ok(Self::new(
            study,
            coordinator,
            config.max_trials,
            config.retry.clone(),
            &config.artifact_dir,
        ))
    }

    pub fn study(&self) -> &Study {
        &self.study
    }

    pub async fn run(&self) -> TwResult<DriverReport> {
        info!(
            study = self.study.name(),
            envs = ?self.coordinator.envs(),
            max_trials = self.max_trials,
            "search started"
        );

        let mut trials_run = 0;
        loop {
            let total = retry_transient(&self.retry, "count trials", || {
                self.study.trials().map(|trials| trials.len() as u64)
            })
            .await?;
            if total >= self.max_trials {
                break;
            }

            let trial = retry_transient(&self.retry, "propose trial", || self.study.propose_trial()).await?;
            let outcome = self.coordinator.evaluate(&trial).await;
            let resolution = resolution_of(&outcome);
            retry_transient(&self.retry, "record result", || {
                self.study.record_result(&trial, resolution.clone())
            })
            .await?;
            trials_run += 1;
        }

        let summary = retry_transient(&self.retry, "summarize study", || self.study.summary()).await?;
        if trials_run == 0 {
            warn!(study = %summary.name, trials = summary.trials_total, "trial budget already spent");
        }
        let artifact = match &summary.best_trial {
            Some(best) => Some(self.write_artifact(best)?),
            None => {
                warn!(study = %summary.name, "no completed trial, skipping best-trial export");
                None
            }
        };

        info!(
            study = %summary.name,
            trials_run,
            completed = summary.trials_completed,
            pruned = summary.trials_pruned,
            failed = summary.trials_failed,
            best = ?summary.best_trial.as_ref().and_then(|t| t.value),
            "search finished"
        );
        Ok(DriverReport {
            summary,
            trials_run,
            artifact,
        })
    }

    fn write_artifact(&self, best: &TrialRecord) -> TwResult<PathBuf> {
        let value = best
            .value
            .ok_or_else(|| tw_types::internal_error!("completed trial {} has no value", best.number))?;
        let envs = self.coordinator.envs().to_vec();
        let artifact = BestTrialArtifact {
            study: self.study.name().to_string(),
            number: best.number,
            value,
            params: best.params.clone(),
            envs,
        };

        std::fs::create_dir_all(&self.artifact_dir)?;
        let path = artifact_path(&self.artifact_dir, &artifact.envs);
        std::fs::write(&path, serde_json::to_string_pretty(&artifact)?)?;
        info!(path = %path.display(), trial = best.number, value, "wrote best trial");
        Ok(path)
    }
}

/// `<dir>/best_params_<env,env,...>.json`
pub fn artifact_path(dir: &Path, envs: &[String]) -> PathBuf {
    dir.join(format!("best_params_{}.json", envs.join(",")))
}

fn resolution_of(outcome: &TrialOutcome<TrialObjective>) -> TrialResolution {
    match outcome {
        TrialOutcome::Completed(objective) => TrialResolution::Completed {
            value: objective.value,
        },
        TrialOutcome::Pruned { .. } => TrialResolution::Pruned,
        TrialOutcome::Failed(e) => TrialResolution::Failed { error: e.to_string() },
    }
}

/// Run `op`, retrying transient store errors with capped exponential backoff.
pub async fn retry_transient<T, F>(retry: &RetryConfig, operation: &str, mut op: F) -> TwResult<T>
where
    F: FnMut() -> TwResult<T>,
{
    let mut backoff = retry.initial_backoff();
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < retry.max_attempts => {
                warn!(
                    operation,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "study store unavailable, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(retry.max_backoff());
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
