// Search configuration
// Loaded from a JSON file named by TUNEWELL_CONFIG; every field has a default
// except the environment list.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;
use tw_optimizer::{SearchSpace, StudyConfig};
use tw_types::{config_error, TwResult};

use crate::experiment::Device;
use crate::pool::WorkerResources;
use crate::runner::RunnerSettings;

/// Environment variable holding the configuration file path.
pub const CONFIG_ENV: &str = "TUNEWELL_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "tunewell.json";

/// Training algorithm family under search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainerKind {
    SharedRainbow,
    ParallelRainbow,
    NfspRainbow,
    ParallelRainbowNfsp,
    SharedPpo,
    NfspPpo,
}

impl TrainerKind {
    pub const ALL: [TrainerKind; 6] = [
        TrainerKind::SharedRainbow,
        TrainerKind::ParallelRainbow,
        TrainerKind::NfspRainbow,
        TrainerKind::ParallelRainbowNfsp,
        TrainerKind::SharedPpo,
        TrainerKind::NfspPpo,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TrainerKind::SharedRainbow => "shared_rainbow",
            TrainerKind::ParallelRainbow => "parallel_rainbow",
            TrainerKind::NfspRainbow => "nfsp_rainbow",
            TrainerKind::ParallelRainbowNfsp => "parallel_rainbow_nfsp",
            TrainerKind::SharedPpo => "shared_ppo",
            TrainerKind::NfspPpo => "nfsp_ppo",
        }
    }

    /// Default search space for the family.
    pub fn search_space(self) -> SearchSpace {
        match self {
            TrainerKind::SharedRainbow | TrainerKind::ParallelRainbow => SearchSpace::rainbow(),
            TrainerKind::NfspRainbow | TrainerKind::ParallelRainbowNfsp => SearchSpace::nfsp_rainbow(),
            TrainerKind::SharedPpo => SearchSpace::ppo(),
            TrainerKind::NfspPpo => SearchSpace::nfsp_ppo(),
        }
    }
}

impl std::fmt::Display for TrainerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrainerKind {
    type Err = tw_types::TwError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TrainerKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| config_error!("unknown trainer kind: {s}"))
    }
}

/// Back-off for transient study-store failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Environments every trial trains on, one runner each.
    pub envs: Vec<String>,
    pub trainer: TrainerKind,
    /// Training frames per runner.
    pub frames: u64,
    /// Frames between checkpoint/evaluation boundaries; defaults to 1% of
    /// `frames`.
    pub frames_per_save: Option<u64>,
    pub eval_episodes: usize,
    /// GPUs available to this search process, split evenly across runners.
    pub num_gpus: u32,
    pub cpus_per_runner: f64,
    /// Study-wide trial budget.
    pub max_trials: u64,
    pub resume: bool,
    /// Stop the remaining runners of a trial once one is pruned.
    pub prune_siblings: bool,
    pub sampler_seed: u64,
    /// Overrides the trainer family's default space.
    pub search_space: Option<SearchSpace>,
    pub checkpoint_root: PathBuf,
    pub builtin_rewards: PathBuf,
    pub random_rewards: PathBuf,
    pub artifact_dir: PathBuf,
    pub study: StudyConfig,
    pub retry: RetryConfig,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            envs: Vec::new(),
            trainer: TrainerKind::NfspRainbow,
            frames: 50_000_000,
            frames_per_save: None,
            eval_episodes: 20,
            num_gpus: 1,
            cpus_per_runner: 1.0,
            max_trials: 100,
            resume: false,
            prune_siblings: false,
            sampler_seed: 0,
            search_space: None,
            checkpoint_root: PathBuf::from("checkpoint"),
            builtin_rewards: PathBuf::from("plot_data/builtin_env_rewards.json"),
            random_rewards: PathBuf::from("plot_data/rand_rewards.json"),
            artifact_dir: PathBuf::from("."),
            study: StudyConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl SearchConfig {
    pub fn new<S: Into<String>>(envs: impl IntoIterator<Item = S>) -> Self {
        Self {
            envs: envs.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> TwResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        info!(path = %path.as_ref().display(), envs = ?config.envs, trainer = %config.trainer, "loaded search config");
        Ok(config)
    }

    /// Load from the file named by `TUNEWELL_CONFIG`, or `tunewell.json`.
    pub fn from_env() -> TwResult<Self> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::from_file(path)
    }

    pub fn with_trainer(mut self, trainer: TrainerKind) -> Self {
        self.trainer = trainer;
        self
    }

    pub fn with_frames(mut self, frames: u64, frames_per_save: Option<u64>) -> Self {
        self.frames = frames;
        self.frames_per_save = frames_per_save;
        self
    }

    pub fn with_eval_episodes(mut self, episodes: usize) -> Self {
        self.eval_episodes = episodes;
        self
    }

    pub fn with_gpus(mut self, num_gpus: u32) -> Self {
        self.num_gpus = num_gpus;
        self
    }

    pub fn with_max_trials(mut self, max_trials: u64) -> Self {
        self.max_trials = max_trials;
        self
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn with_prune_siblings(mut self, prune_siblings: bool) -> Self {
        self.prune_siblings = prune_siblings;
        self
    }

    pub fn with_study(mut self, study: StudyConfig) -> Self {
        self.study = study;
        self
    }

    pub fn with_paths(mut self, checkpoint_root: impl Into<PathBuf>, artifact_dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_root = checkpoint_root.into();
        self.artifact_dir = artifact_dir.into();
        self
    }

    pub fn save_interval(&self) -> u64 {
        self.frames_per_save.unwrap_or((self.frames / 100).max(1))
    }

    pub fn device(&self) -> Device {
        Device::for_gpus(self.num_gpus)
    }

    pub fn search_space(&self) -> SearchSpace {
        self.search_space
            .clone()
            .unwrap_or_else(|| self.trainer.search_space())
    }

    pub fn runner_settings(&self) -> RunnerSettings {
        RunnerSettings {
            frames: self.frames,
            save_interval: self.save_interval(),
            eval_episodes: self.eval_episodes,
            resume: self.resume,
            device: self.device(),
        }
    }

    /// Resource share of one runner: the GPU budget split across environments.
    pub fn runner_resources(&self) -> WorkerResources {
        WorkerResources {
            num_cpus: self.cpus_per_runner,
            num_gpus: f64::from(self.num_gpus) / self.envs.len().max(1) as f64,
        }
    }

    /// Label used for the best-trial artifact, e.g. `boxing_v1,pong_v2`.
    pub fn env_label(&self) -> String {
        self.envs.join(",")
    }

    pub fn validate(&self) -> TwResult<()> {
        if self.envs.is_empty() {
            return Err(config_error!("at least one environment is required"));
        }
        let mut seen = std::collections::HashSet::new();
        for env in &self.envs {
            if env.is_empty() || env.contains(',') || env.contains(char::is_whitespace) {
                return Err(config_error!("invalid environment id: {env:?}"));
            }
            if !seen.insert(env) {
                return Err(config_error!("duplicate environment id: {env}"));
            }
        }
        if self.frames == 0 {
            return Err(config_error!("frames must be positive"));
        }
        if self.frames_per_save == Some(0) {
            return Err(config_error!("frames_per_save must be positive"));
        }
        if self.eval_episodes == 0 {
            return Err(config_error!("eval_episodes must be positive"));
        }
        if self.max_trials == 0 {
            return Err(config_error!("max_trials must be positive"));
        }
        if !(self.cpus_per_runner >= 0.0) {
            return Err(config_error!("cpus_per_runner must be non-negative"));
        }
        if self.retry.max_attempts == 0 {
            return Err(config_error!("retry.max_attempts must be at least 1"));
        }
        self.search_space().validate()?;
        Ok(())
    }
}
