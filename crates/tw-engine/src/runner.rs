// Per-environment trial runner
// One training job for one environment of one trial: resume, train, checkpoint,
// evaluate, normalize, report, and stop early when told to.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tw_data::{CheckpointScope, CheckpointStore, ScoreNormalizer};
use tw_types::{
    Hyperparameters, PreconditionError, TrialHandle, TrialOutcome, TrialReporter, TwResult,
};

use crate::cadence::{EpochSegments, StepBatched, TrainingCadence, TrainingProgress};
use crate::experiment::{BuildRequest, Device, Experiment, TrainerFactory};
use crate::seed::TrialSeed;

/// Settings shared by every runner of a search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerSettings {
    /// Training target in cumulative frames.
    pub frames: u64,
    /// Frames between evaluation boundaries.
    pub save_interval: u64,
    pub eval_episodes: usize,
    /// Continue from the latest checkpoint of the scope if one exists.
    pub resume: bool,
    pub device: Device,
}

/// One evaluation boundary as seen by the runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub frame: u64,
    pub raw_mean: f64,
    pub normalized: f64,
    pub running_mean: f64,
}

/// What a runner hands back on completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerReport {
    pub env_id: String,
    /// Mean of the normalized evaluation scores.
    pub score: f64,
    pub frame_start: u64,
    pub frame_end: u64,
    pub episodes: u64,
    pub evaluations: Vec<EvaluationRecord>,
}

pub struct TrialRunner {
    trial: TrialHandle,
    env_id: String,
    seed: TrialSeed,
    hyperparameters: Hyperparameters,
    settings: RunnerSettings,
    factory: Arc<dyn TrainerFactory>,
    reporter: Arc<dyn TrialReporter>,
    normalizer: Arc<ScoreNormalizer>,
    checkpoints: CheckpointStore,
    siblings_pruned: Option<Arc<AtomicBool>>,
}

impl TrialRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        trial: TrialHandle,
        env_id: impl Into<String>,
        hyperparameters: Hyperparameters,
        settings: RunnerSettings,
        factory: Arc<dyn TrainerFactory>,
        reporter: Arc<dyn TrialReporter>,
        normalizer: Arc<ScoreNormalizer>,
        checkpoints: CheckpointStore,
    ) -> Self {
        let seed = TrialSeed::from_trial(trial.number);
        Self {
            trial,
            env_id: env_id.into(),
            seed,
            hyperparameters,
            settings,
            factory,
            reporter,
            normalizer,
            checkpoints,
            siblings_pruned: None,
        }
    }

    /// Share a trial-wide flag: raised when this runner is pruned, and
    /// observed at every evaluation boundary.
    pub fn with_sibling_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.siblings_pruned = Some(flag);
        self
    }

    pub fn scope(&self) -> CheckpointScope {
        CheckpointScope {
            trainer_kind: self.factory.kind().to_string(),
            env_id: self.env_id.clone(),
            buffer_size: self.hyperparameters.replay_buffer_size(),
            frame_budget: self.settings.frames,
            seed: self.seed.value(),
        }
    }

    pub fn run(self) -> TrialOutcome<RunnerReport> {
        match self.execute() {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(trial = self.trial.number, env = %self.env_id, error = %e, "runner failed");
                TrialOutcome::Failed(e)
            }
        }
    }

    fn execute(&self) -> TwResult<TrialOutcome<RunnerReport>> {
        // INIT
        let scope = self.scope();
        let resume_from = if self.settings.resume {
            self.checkpoints.latest(&scope)?
        } else {
            None
        };
        let frame_start = resume_from.unwrap_or(0);

        let built = self.factory.build(&BuildRequest {
            env_id: &self.env_id,
            device: self.settings.device,
            buffer_size: scope.buffer_size,
            seed: self.seed,
            frame_budget: self.settings.frames,
            hyperparameters: &self.hyperparameters,
        })?;
        let mut preset = built.preset;

        if let Some(frame) = resume_from {
            let state = self.checkpoints.load(&scope, frame)?;
            preset.restore(&state)?;
            info!(trial = self.trial.number, env = %self.env_id, frame, "resuming from checkpoint");
        }

        let (mut cadence, instances) = match built.experiment {
            Experiment::Vectorized(agent) => {
                let instances = agent.num_envs();
                let cadence = StepBatched::new(&self.env_id, agent, self.settings.save_interval);
                (Box::new(cadence) as Box<dyn TrainingCadence>, instances)
            }
            Experiment::Epoch(mut agent) => {
                agent.seed_env(self.seed.value());
                let cadence = EpochSegments::new(agent, self.settings.save_interval);
                (Box::new(cadence) as Box<dyn TrainingCadence>, 0)
            }
        };
        let mut progress = TrainingProgress::new(frame_start, instances);
        let mut evaluations = Vec::new();

        info!(
            trial = self.trial.number,
            env = %self.env_id,
            scope = %scope,
            frame_start,
            target = self.settings.frames,
            "runner started"
        );

        // Already trained to target: one evaluation, no checkpoint, no pruning.
        if frame_start >= self.settings.frames {
            let record = self.evaluate_boundary(cadence.as_mut(), &mut progress)?;
            evaluations.push(record);
            return Ok(TrialOutcome::Completed(self.finish(frame_start, progress, evaluations)?));
        }

        // TRAINING / EVALUATING
        while progress.frame < self.settings.frames {
            cadence.advance(&mut progress)?;
            if !cadence.at_boundary(&progress) {
                continue;
            }

            self.checkpoints
                .save(&scope, progress.frame, &preset.snapshot()?)?;
            let record = self.evaluate_boundary(cadence.as_mut(), &mut progress)?;
            let (step, value) = (record.frame, record.running_mean);
            evaluations.push(record);

            if self.sibling_pruned() {
                info!(trial = self.trial.number, env = %self.env_id, step, "sibling runner pruned, stopping");
                return Ok(TrialOutcome::Pruned { step, value });
            }
            if self.reporter.should_prune(&self.trial)? {
                info!(trial = self.trial.number, env = %self.env_id, step, value, "runner pruned");
                self.raise_sibling_flag();
                return Ok(TrialOutcome::Pruned { step, value });
            }
        }

        Ok(TrialOutcome::Completed(self.finish(frame_start, progress, evaluations)?))
    }

    /// Evaluate, normalize, record and report at the current frame.
    fn evaluate_boundary(
        &self,
        cadence: &mut dyn TrainingCadence,
        progress: &mut TrainingProgress,
    ) -> TwResult<EvaluationRecord> {
        let returns = cadence.evaluate(self.settings.eval_episodes)?;
        cadence.after_evaluation()?;

        let raw_mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let normalized = self.normalizer.normalize(raw_mean, &self.env_id)?;
        progress.scores.push(normalized);
        let running_mean = progress.running_mean().unwrap_or(normalized);

        self.reporter
            .report(&self.trial, progress.frame, running_mean)?;
        debug!(
            trial = self.trial.number,
            env = %self.env_id,
            frame = progress.frame,
            raw_mean,
            normalized,
            running_mean,
            "evaluation"
        );

        Ok(EvaluationRecord {
            frame: progress.frame,
            raw_mean,
            normalized,
            running_mean,
        })
    }

    fn finish(
        &self,
        frame_start: u64,
        progress: TrainingProgress,
        evaluations: Vec<EvaluationRecord>,
    ) -> TwResult<RunnerReport> {
        let score = progress.running_mean().ok_or_else(|| PreconditionError::EvaluationShape {
            message: format!(
                "training from {frame_start} to {} never reached an evaluation boundary",
                progress.frame
            ),
        })?;
        info!(trial = self.trial.number, env = %self.env_id, score, frame = progress.frame, "runner done");
        Ok(RunnerReport {
            env_id: self.env_id.clone(),
            score,
            frame_start,
            frame_end: progress.frame,
            episodes: progress.episodes,
            evaluations,
        })
    }

    fn sibling_pruned(&self) -> bool {
        self.siblings_pruned
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    fn raise_sibling_flag(&self) {
        if let Some(flag) = &self.siblings_pruned {
            flag.store(true, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrainerKind;
    use crate::experiment::{BuiltExperiment, EpochAgent, Preset};
    use crate::synthetic::{SyntheticMode, SyntheticTrainer};
    use parking_lot::Mutex;
    use std::collections::BTreeMap;
    use tw_data::BaselineTable;
    use tw_optimizer::{InMemoryStorage, NopPruner, Pruner, Study, ThresholdPruner};
    use tw_types::{ObjectiveDirection, TrialStatus, TwError};

    fn baselines() -> BaselineTable {
        BaselineTable::new()
            .with_baseline("boxing_v1", 10.0, 0.0)
            .with_baseline("pong_v2", 5.0, -5.0)
    }

    fn study(pruner: Arc<dyn Pruner>) -> Arc<Study> {
        Arc::new(
            Study::create(
                "runner",
                ObjectiveDirection::Maximize,
                Arc::new(InMemoryStorage::new()),
                pruner,
                false,
            )
            .unwrap(),
        )
    }

    fn settings(frames: u64, save_interval: u64, resume: bool) -> RunnerSettings {
        RunnerSettings {
            frames,
            save_interval,
            eval_episodes: 4,
            resume,
            device: Device::Cpu,
        }
    }

    fn runner(
        study: &Arc<Study>,
        trial: &TrialHandle,
        factory: Arc<dyn TrainerFactory>,
        settings: RunnerSettings,
        checkpoints: &CheckpointStore,
    ) -> TrialRunner {
        TrialRunner::new(
            trial.clone(),
            "pong_v2",
            Hyperparameters::new(),
            settings,
            factory,
            study.clone(),
            Arc::new(ScoreNormalizer::new(baselines())),
            checkpoints.clone(),
        )
    }

    fn synthetic(mode: SyntheticMode) -> Arc<dyn TrainerFactory> {
        Arc::new(SyntheticTrainer::new(TrainerKind::NfspRainbow, baselines()).with_mode(mode))
    }

    /// Epoch agent replaying a fixed list of evaluation returns, one per call.
    struct Replay {
        returns: Arc<Mutex<Vec<f64>>>,
    }

    impl EpochAgent for Replay {
        fn seed_env(&mut self, _seed: u64) {}

        fn train(&mut self, _until_frame: u64) -> TwResult<()> {
            Ok(())
        }

        fn test(&mut self, episodes: usize) -> TwResult<BTreeMap<String, Vec<f64>>> {
            let value = self.returns.lock().remove(0);
            Ok(BTreeMap::from([("first_0".to_string(), vec![value; episodes])]))
        }

        fn save_model(&mut self) -> TwResult<()> {
            Ok(())
        }
    }

    struct NullPreset;

    impl Preset for NullPreset {
        fn snapshot(&self) -> TwResult<Vec<u8>> {
            Ok(vec![0])
        }

        fn restore(&mut self, _state: &[u8]) -> TwResult<()> {
            Ok(())
        }
    }

    struct ReplayFactory {
        returns: Vec<f64>,
    }

    impl TrainerFactory for ReplayFactory {
        fn kind(&self) -> TrainerKind {
            TrainerKind::NfspRainbow
        }

        fn build(&self, _request: &BuildRequest<'_>) -> TwResult<BuiltExperiment> {
            Ok(BuiltExperiment {
                experiment: Experiment::Epoch(Box::new(Replay {
                    returns: Arc::new(Mutex::new(self.returns.clone())),
                })),
                preset: Box::new(NullPreset),
            })
        }
    }

    #[test]
    fn epoch_run_checkpoints_and_reports_every_segment() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = CheckpointStore::new(dir.path()).unwrap();
        let study = study(Arc::new(NopPruner));
        let trial = study.propose_trial().unwrap();

        let runner = runner(&study, &trial, synthetic(SyntheticMode::Epoch), settings(1_000, 250, false), &checkpoints);
        let scope = runner.scope();
        let report = match runner.run() {
            TrialOutcome::Completed(report) => report,
            other => panic!("expected completion, got {other:?}"),
        };

        assert_eq!(report.evaluations.len(), 4);
        assert_eq!(report.frame_end, 1_000);
        assert_eq!(checkpoints.frames(&scope).unwrap(), vec![250, 500, 750, 1_000]);

        let record = study.trial(trial.number).unwrap();
        let steps: Vec<u64> = record.intermediate_values.keys().copied().collect();
        assert_eq!(steps, vec![250, 500, 750, 1_000]);
        assert_eq!(record.intermediate_values[&1_000], report.score);
    }

    #[test]
    fn vectorized_run_evaluates_at_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = CheckpointStore::new(dir.path()).unwrap();
        let study = study(Arc::new(NopPruner));
        let trial = study.propose_trial().unwrap();

        let factory = synthetic(SyntheticMode::Vectorized { num_envs: 4 });
        let runner = runner(&study, &trial, factory, settings(100, 10, false), &checkpoints);
        let scope = runner.scope();
        let report = match runner.run() {
            TrialOutcome::Completed(report) => report,
            other => panic!("expected completion, got {other:?}"),
        };

        // 4-frame steps hit the 10-frame boundary test at 12, 20, 32, 40, ...
        let frames: Vec<u64> = report.evaluations.iter().map(|e| e.frame).collect();
        assert_eq!(frames, vec![12, 20, 32, 40, 52, 60, 72, 80, 92, 100]);
        assert_eq!(checkpoints.frames(&scope).unwrap(), frames);
        assert!(report.episodes > 0);
    }

    #[test]
    fn resume_reproduces_uninterrupted_scores() {
        let full_dir = tempfile::tempdir().unwrap();
        let full_store = CheckpointStore::new(full_dir.path()).unwrap();
        let study = study(Arc::new(NopPruner));

        let trial = study.propose_trial().unwrap();
        let factory = synthetic(SyntheticMode::Epoch);
        let full = match runner(&study, &trial, factory.clone(), settings(1_000, 100, false), &full_store).run() {
            TrialOutcome::Completed(report) => report,
            other => panic!("expected completion, got {other:?}"),
        };

        // Seed a second store with the uninterrupted run's checkpoint at 400.
        let resumed_dir = tempfile::tempdir().unwrap();
        let resumed_store = CheckpointStore::new(resumed_dir.path()).unwrap();
        let pending = runner(&study, &trial, factory.clone(), settings(1_000, 100, true), &resumed_store);
        let scope = pending.scope();
        let state = full_store.load(&scope, 400).unwrap();
        resumed_store.save(&scope, 400, &state).unwrap();

        let resumed = match pending.run() {
            TrialOutcome::Completed(report) => report,
            other => panic!("expected completion, got {other:?}"),
        };
        assert_eq!(resumed.frame_start, 400);

        let after: Vec<(u64, f64)> = full
            .evaluations
            .iter()
            .filter(|e| e.frame > 400)
            .map(|e| (e.frame, e.normalized))
            .collect();
        let replayed: Vec<(u64, f64)> = resumed
            .evaluations
            .iter()
            .map(|e| (e.frame, e.normalized))
            .collect();
        assert_eq!(after, replayed);
    }

    #[test]
    fn step_batched_resume_reproduces_uninterrupted_scores() {
        let full_dir = tempfile::tempdir().unwrap();
        let full_store = CheckpointStore::new(full_dir.path()).unwrap();
        let study = study(Arc::new(NopPruner));

        let trial = study.propose_trial().unwrap();
        let factory = synthetic(SyntheticMode::Vectorized { num_envs: 4 });
        let full = match runner(&study, &trial, factory.clone(), settings(100, 10, false), &full_store).run() {
            TrialOutcome::Completed(report) => report,
            other => panic!("expected completion, got {other:?}"),
        };

        // 32 is a boundary of the 4-frame step grid, so training resumes on it.
        let resumed_dir = tempfile::tempdir().unwrap();
        let resumed_store = CheckpointStore::new(resumed_dir.path()).unwrap();
        let pending = runner(&study, &trial, factory.clone(), settings(100, 10, true), &resumed_store);
        let scope = pending.scope();
        let state = full_store.load(&scope, 32).unwrap();
        resumed_store.save(&scope, 32, &state).unwrap();

        let resumed = match pending.run() {
            TrialOutcome::Completed(report) => report,
            other => panic!("expected completion, got {other:?}"),
        };
        assert_eq!(resumed.frame_start, 32);
        assert_eq!(resumed.frame_end, 100);

        let after: Vec<(u64, f64, f64)> = full
            .evaluations
            .iter()
            .filter(|e| e.frame > 32)
            .map(|e| (e.frame, e.raw_mean, e.normalized))
            .collect();
        let replayed: Vec<(u64, f64, f64)> = resumed
            .evaluations
            .iter()
            .map(|e| (e.frame, e.raw_mean, e.normalized))
            .collect();
        assert_eq!(after.len(), 7);
        assert_eq!(after, replayed);
        assert_eq!(
            resumed_store.frames(&scope).unwrap(),
            vec![32, 40, 52, 60, 72, 80, 92, 100]
        );
    }

    #[test]
    fn start_at_target_evaluates_once_without_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = CheckpointStore::new(dir.path()).unwrap();
        let study = study(Arc::new(ThresholdPruner::lower(100.0)));
        let trial = study.propose_trial().unwrap();

        let factory = synthetic(SyntheticMode::Epoch);
        let pending = runner(&study, &trial, factory.clone(), settings(1_000, 250, true), &checkpoints);
        let scope = pending.scope();
        checkpoints.save(&scope, 1_000, &[0u8; 16]).unwrap();

        let report = match pending.run() {
            TrialOutcome::Completed(report) => report,
            other => panic!("expected completion, got {other:?}"),
        };
        assert_eq!(report.evaluations.len(), 1);
        assert_eq!(report.evaluations[0].frame, 1_000);
        assert_eq!(checkpoints.frames(&scope).unwrap(), vec![1_000]);

        let record = study.trial(trial.number).unwrap();
        assert_eq!(record.intermediate_values.len(), 1);
        assert!(record.intermediate_values.contains_key(&1_000));
    }

    #[test]
    fn decreasing_trend_is_pruned_not_failed() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = CheckpointStore::new(dir.path()).unwrap();
        let study = study(Arc::new(ThresholdPruner::lower(0.0)));
        let trial = study.propose_trial().unwrap();

        // pong_v2: reference 5, random -5. Raw 0 is 0.5, raw 15 is -1.0.
        let factory = Arc::new(ReplayFactory {
            returns: vec![0.0, 15.0, 15.0, 15.0],
        });
        let outcome = runner(&study, &trial, factory, settings(1_000, 250, false), &checkpoints).run();

        match outcome {
            TrialOutcome::Pruned { step, value } => {
                assert_eq!(step, 500);
                assert_eq!(value, -0.25);
            }
            other => panic!("expected pruned, got {other:?}"),
        }
        let record = study.trial(trial.number).unwrap();
        assert_eq!(record.status, TrialStatus::Running);
        assert_eq!(record.intermediate_values.len(), 2);
    }

    #[test]
    fn sibling_flag_stops_runner_and_is_raised_on_prune() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = CheckpointStore::new(dir.path()).unwrap();
        let study = study(Arc::new(NopPruner));
        let trial = study.propose_trial().unwrap();

        let flag = Arc::new(AtomicBool::new(true));
        let outcome = runner(&study, &trial, synthetic(SyntheticMode::Epoch), settings(1_000, 250, false), &checkpoints)
            .with_sibling_flag(flag)
            .run();
        assert!(matches!(outcome, TrialOutcome::Pruned { step: 250, .. }));

        let pruning = self::study(Arc::new(ThresholdPruner::lower(10.0)));
        let trial = pruning.propose_trial().unwrap();
        let flag = Arc::new(AtomicBool::new(false));
        let dir = tempfile::tempdir().unwrap();
        let outcome = runner(
            &pruning,
            &trial,
            synthetic(SyntheticMode::Epoch),
            settings(1_000, 250, false),
            &CheckpointStore::new(dir.path()).unwrap(),
        )
        .with_sibling_flag(flag.clone())
        .run();
        assert!(outcome.is_pruned());
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn missing_baseline_fails_runner() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = CheckpointStore::new(dir.path()).unwrap();
        let study = study(Arc::new(NopPruner));
        let trial = study.propose_trial().unwrap();

        let outcome = TrialRunner::new(
            trial,
            "tennis_v2",
            Hyperparameters::new(),
            settings(1_000, 250, false),
            synthetic(SyntheticMode::Epoch),
            study.clone(),
            Arc::new(ScoreNormalizer::new(baselines())),
            checkpoints,
        )
        .run();
        assert!(matches!(
            outcome,
            TrialOutcome::Failed(TwError::Precondition(PreconditionError::MissingBaseline { .. }))
        ));
    }

    #[test]
    fn existing_checkpoint_without_resume_fails() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = CheckpointStore::new(dir.path()).unwrap();
        let study = study(Arc::new(NopPruner));
        let trial = study.propose_trial().unwrap();

        let pending = runner(&study, &trial, synthetic(SyntheticMode::Epoch), settings(1_000, 250, false), &checkpoints);
        checkpoints.save(&pending.scope(), 250, b"stale").unwrap();
        assert!(matches!(
            pending.run(),
            TrialOutcome::Failed(TwError::Precondition(PreconditionError::CheckpointExists { frame: 250, .. }))
        ));
    }
}
