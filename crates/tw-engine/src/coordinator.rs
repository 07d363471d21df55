// Trial objective coordinator
// Turns one proposed trial into one runner per environment on the worker pool
// and folds their outcomes into the trial's objective.

use serde::{Deserialize, Serialize};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{info, warn};
use tw_data::{CheckpointStore, ScoreNormalizer};
use tw_optimizer::Sampler;
use tw_types::{Hyperparameters, TrialHandle, TrialOutcome, TrialReporter, TwResult};

use crate::experiment::TrainerFactory;
use crate::pool::{join_all, Reservation, TaskHandle, WorkerPool, WorkerResources};
use crate::runner::{RunnerReport, RunnerSettings, TrialRunner};
use crate::seed::TrialSeed;

/// Objective of a fully completed trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialObjective {
    /// Mean of the per-environment scores.
    pub value: f64,
    pub hyperparameters: Hyperparameters,
    pub runs: Vec<RunnerReport>,
}

pub struct TrialCoordinator {
    envs: Vec<String>,
    settings: RunnerSettings,
    runner_resources: WorkerResources,
    prune_siblings: bool,
    sampler: Arc<dyn Sampler>,
    factory: Arc<dyn TrainerFactory>,
    reporter: Arc<dyn TrialReporter>,
    normalizer: Arc<ScoreNormalizer>,
    checkpoints: CheckpointStore,
    pool: Arc<WorkerPool>,
}

impl TrialCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        envs: Vec<String>,
        settings: RunnerSettings,
        runner_resources: WorkerResources,
        sampler: Arc<dyn Sampler>,
        factory: Arc<dyn TrainerFactory>,
        reporter: Arc<dyn TrialReporter>,
        normalizer: Arc<ScoreNormalizer>,
        checkpoints: CheckpointStore,
        pool: Arc<WorkerPool>,
    ) -> Self {
        Self {
            envs,
            settings,
            runner_resources,
            prune_siblings: false,
            sampler,
            factory,
            reporter,
            normalizer,
            checkpoints,
            pool,
        }
    }

    pub fn with_prune_siblings(mut self, prune_siblings: bool) -> Self {
        self.prune_siblings = prune_siblings;
        self
    }

    pub fn envs(&self) -> &[String] {
        &self.envs
    }

    /// Run every environment of `trial` and aggregate.
    pub async fn evaluate(&self, trial: &TrialHandle) -> TrialOutcome<TrialObjective> {
        let (hyperparameters, reservations) = match self.prepare(trial) {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(trial = trial.number, error = %e, "trial dispatch failed");
                return TrialOutcome::Failed(e);
            }
        };

        let siblings = self.prune_siblings.then(|| Arc::new(AtomicBool::new(false)));
        let max_calls = self.envs.len();
        let runners = self.envs.iter().zip(reservations);
        let dispatched = run_all(runners, |(env_id, reservation)| {
            let mut runner = TrialRunner::new(
                trial.clone(),
                env_id,
                hyperparameters.clone(),
                self.settings.clone(),
                self.factory.clone(),
                self.reporter.clone(),
                self.normalizer.clone(),
                self.checkpoints.clone(),
            );
            if let Some(flag) = &siblings {
                runner = runner.with_sibling_flag(flag.clone());
            }
            self.pool.dispatch(reservation, max_calls, move || runner.run())
        })
        .await;
        let outcomes = match dispatched {
            Ok(outcomes) => outcomes,
            Err(e) => {
                warn!(trial = trial.number, error = %e, "trial dispatch failed");
                return TrialOutcome::Failed(e);
            }
        };

        let outcome = aggregate(outcomes);
        if let TrialOutcome::Completed((_, runs)) = &outcome {
            let scores: Vec<f64> = runs.iter().map(|r| r.score).collect();
            info!(trial = trial.number, params = %hyperparameters, scores = ?scores, "trial runners finished");
        }
        outcome.map(|(value, runs)| TrialObjective {
            value,
            hyperparameters,
            runs,
        })
    }

    /// Sample and record the assignment, then reserve one share per environment.
    fn prepare(&self, trial: &TrialHandle) -> TwResult<(Hyperparameters, Vec<Reservation>)> {
        let hyperparameters = self.sampler.sample(trial)?;
        self.reporter.record_params(trial, &hyperparameters)?;

        let seed = TrialSeed::from_trial(trial.number);
        let requests = vec![self.runner_resources; self.envs.len()];
        let reservations = self.pool.reserve_all(&requests)?;
        info!(
            trial = trial.number,
            seed = %seed,
            envs = self.envs.len(),
            gpus_per_runner = self.runner_resources.num_gpus,
            sampler = self.sampler.name(),
            "dispatching trial"
        );
        Ok((hyperparameters, reservations))
    }
}

/// Dispatch one task per item and await them all in order.
///
/// If an item cannot be dispatched, the tasks already queued are awaited
/// before the error is returned, so none of them outlives the call. Items not
/// yet dispatched are dropped, which releases their reservations.
pub async fn run_all<I, T, F>(items: I, mut dispatch: F) -> TwResult<Vec<TrialOutcome<T>>>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> TwResult<TaskHandle<T>>,
{
    let mut handles = Vec::new();
    for item in items {
        match dispatch(item) {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                if !handles.is_empty() {
                    warn!(queued = handles.len(), error = %e, "dispatch failed, waiting for queued tasks");
                }
                join_all(handles).await;
                return Err(e);
            }
        }
    }
    Ok(join_all(handles).await)
}

/// Fold per-environment outcomes into the trial outcome.
///
/// Any failure fails the trial; otherwise any pruned runner prunes it;
/// otherwise the objective is the mean score. The first failure or pruning in
/// input order is the one reported.
pub fn aggregate(outcomes: Vec<TrialOutcome<RunnerReport>>) -> TrialOutcome<(f64, Vec<RunnerReport>)> {
    let mut runs = Vec::with_capacity(outcomes.len());
    let mut pruned = None;
    for outcome in outcomes {
        match outcome {
            TrialOutcome::Failed(e) => return TrialOutcome::Failed(e),
            TrialOutcome::Pruned { step, value } => {
                pruned.get_or_insert((step, value));
            }
            TrialOutcome::Completed(report) => runs.push(report),
        }
    }
    if let Some((step, value)) = pruned {
        return TrialOutcome::Pruned { step, value };
    }
    if runs.is_empty() {
        return TrialOutcome::Failed(tw_types::internal_error!("trial had no environments to run"));
    }
    let value = runs.iter().map(|r| r.score).sum::<f64>() / runs.len() as f64;
    TrialOutcome::Completed((value, runs))
}
