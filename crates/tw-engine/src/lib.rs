// Tunewell search engine
// Runs hyperparameter trials for multi-environment RL training: one runner per
// environment on a resource-bounded worker pool, normalized evaluation scores
// reported to the study, pruned or completed trials folded into one objective.

pub mod cadence;
pub mod config;
pub mod coordinator;
pub mod driver;
pub mod experiment;
pub mod pool;
pub mod runner;
pub mod seed;
pub mod synthetic;

pub use cadence::{EpochSegments, StepBatched, TrainingCadence, TrainingProgress};
pub use config::{RetryConfig, SearchConfig, TrainerKind, CONFIG_ENV, DEFAULT_CONFIG_PATH};
pub use coordinator::{aggregate, run_all, TrialCoordinator, TrialObjective};
pub use driver::{artifact_path, retry_transient, BestTrialArtifact, DriverReport, SearchDriver};
pub use experiment::{
    BuildRequest, BuiltExperiment, Device, EpochAgent, Experiment, Preset, StepBatch, TrainerFactory,
    VectorizedAgent,
};
pub use pool::{join_all, PoolConfig, Reservation, TaskHandle, WorkerPool, WorkerResources};
pub use runner::{EvaluationRecord, RunnerReport, RunnerSettings, TrialRunner};
pub use seed::TrialSeed;
pub use synthetic::{SyntheticMode, SyntheticTrainer};
