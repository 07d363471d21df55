// Synthetic trainer
// A deterministic stand-in for a real RL algorithm: skill grows toward a
// ceiling set by the sampled hyperparameters, and evaluation returns are
// drawn around the skill-weighted baseline scores. Used for smoke runs of the
// search loop and in tests.

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;
use tw_data::{BaselineTable, EnvironmentBaseline};
use tw_types::{Hyperparameters, TrainingError, TwResult};

use crate::config::TrainerKind;
use crate::experiment::{
    BuildRequest, BuiltExperiment, EpochAgent, Experiment, Preset, StepBatch, TrainerFactory,
    VectorizedAgent,
};

/// Learning speed relative to the frame budget.
const LEARNING_RATE_SCALE: f64 = 5.0;
/// Evaluation noise as a fraction of the baseline span.
const NOISE_SCALE: f64 = 0.05;
/// Largest fraction of the ceiling a trial's initialization can cost it.
const INIT_JITTER: f64 = 0.02;
const STATE_BYTES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyntheticMode {
    /// Step-batched agent over `num_envs` lockstep instances.
    Vectorized { num_envs: usize },
    /// Segment-trained agent with per-agent evaluation.
    Epoch,
}

impl SyntheticMode {
    /// Parallel trainers step vectorized environments; the rest train in
    /// segments.
    pub fn for_kind(kind: TrainerKind) -> Self {
        match kind {
            TrainerKind::ParallelRainbow | TrainerKind::ParallelRainbowNfsp | TrainerKind::SharedPpo => {
                SyntheticMode::Vectorized { num_envs: 4 }
            }
            TrainerKind::SharedRainbow | TrainerKind::NfspRainbow | TrainerKind::NfspPpo => {
                SyntheticMode::Epoch
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyntheticTrainer {
    kind: TrainerKind,
    mode: SyntheticMode,
    baselines: BaselineTable,
    episode_length: u64,
}

impl SyntheticTrainer {
    pub fn new(kind: TrainerKind, baselines: BaselineTable) -> Self {
        Self {
            kind,
            mode: SyntheticMode::for_kind(kind),
            baselines,
            episode_length: 8,
        }
    }

    pub fn with_mode(mut self, mode: SyntheticMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_episode_length(mut self, steps: u64) -> Self {
        self.episode_length = steps.max(1);
        self
    }
}

/// How well a hyperparameter assignment can ever do, in `(0, 1]`.
///
/// Peaks at a learning rate of 1e-4 and degrades with each decade away.
fn skill_ceiling(params: &Hyperparameters) -> f64 {
    match params.get_f64("lr") {
        Some(lr) if lr > 0.0 => 1.0 / (1.0 + (lr.log10() + 4.0).abs()),
        _ => 0.5,
    }
}

/// Model state shared between an agent and its preset.
#[derive(Debug, Clone, Copy, PartialEq)]
struct SyntheticModel {
    frame: u64,
    skill: f64,
}

impl SyntheticModel {
    fn to_bytes(self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(STATE_BYTES);
        bytes.extend_from_slice(&self.frame.to_le_bytes());
        bytes.extend_from_slice(&self.skill.to_bits().to_le_bytes());
        bytes
    }

    fn from_bytes(state: &[u8]) -> TwResult<Self> {
        let malformed = || TrainingError::State {
            message: format!("expected {STATE_BYTES} bytes of synthetic state, got {}", state.len()),
        };
        if state.len() != STATE_BYTES {
            return Err(malformed().into());
        }
        let (frame, skill) = state.split_at(8);
        let frame: [u8; 8] = frame.try_into().map_err(|_| malformed())?;
        let skill: [u8; 8] = skill.try_into().map_err(|_| malformed())?;
        Ok(Self {
            frame: u64::from_le_bytes(frame),
            skill: f64::from_bits(u64::from_le_bytes(skill)),
        })
    }
}

/// Deterministic simulation shared by both agent shapes.
#[derive(Debug)]
struct Simulation {
    model: Arc<Mutex<SyntheticModel>>,
    baseline: EnvironmentBaseline,
    ceiling: f64,
    frame_budget: u64,
    /// Root of the per-frame evaluation streams, drawn from the trial's
    /// environment stream.
    eval_key: u64,
}

impl Simulation {
    /// Skill depends only on the cumulative frame, however training is split.
    fn train_frames(&self, frames: u64) {
        let mut model = self.model.lock();
        model.frame += frames;
        let progress = model.frame as f64 / self.frame_budget.max(1) as f64;
        model.skill = self.ceiling * (1.0 - (-LEARNING_RATE_SCALE * progress).exp());
    }

    fn expected_return(&self, skill: f64) -> f64 {
        self.baseline.reference + skill * (self.baseline.random_best - self.baseline.reference)
    }

    /// Evaluation returns at the current frame; a pure function of seed,
    /// frame and skill.
    fn evaluate(&self, episodes: usize) -> Vec<f64> {
        let model = *self.model.lock();
        let mut rng = ChaCha8Rng::seed_from_u64(self.eval_key);
        rng.set_stream(model.frame);
        let span = (self.baseline.random_best - self.baseline.reference).abs();
        let mean = self.expected_return(model.skill);
        (0..episodes)
            .map(|_| mean + rng.gen_range(-1.0..=1.0) * NOISE_SCALE * span)
            .collect()
    }
}

struct SyntheticVectorized {
    sim: Simulation,
    num_envs: usize,
    episode_length: u64,
}

impl VectorizedAgent for SyntheticVectorized {
    fn num_envs(&self) -> usize {
        self.num_envs
    }

    fn step(&mut self) -> TwResult<StepBatch> {
        self.sim.train_frames(self.num_envs as u64);
        let model = *self.sim.model.lock();
        let step_index = model.frame / self.num_envs.max(1) as u64;
        let done = step_index % self.episode_length == 0;
        let reward = self.sim.expected_return(model.skill) / self.episode_length as f64;
        Ok(StepBatch {
            rewards: vec![reward; self.num_envs],
            dones: vec![done; self.num_envs],
        })
    }

    /// Interleaves the trained agent with a mirrored opponent.
    fn test(&mut self, episodes: usize) -> TwResult<Vec<f64>> {
        let own = self.sim.evaluate(episodes.div_ceil(2));
        Ok(own
            .into_iter()
            .flat_map(|r| [r, -r])
            .take(episodes)
            .collect())
    }
}

struct SyntheticEpoch {
    sim: Simulation,
    env_seed: Option<u64>,
    saves: u64,
}

impl EpochAgent for SyntheticEpoch {
    fn seed_env(&mut self, seed: u64) {
        self.env_seed = Some(seed);
    }

    fn train(&mut self, until_frame: u64) -> TwResult<()> {
        let current = self.sim.model.lock().frame;
        if until_frame < current {
            return Err(TrainingError::StepFailed {
                message: format!("asked to train back to frame {until_frame} from {current}"),
            }
            .into());
        }
        self.sim.train_frames(until_frame - current);
        Ok(())
    }

    fn test(&mut self, episodes: usize) -> TwResult<BTreeMap<String, Vec<f64>>> {
        Ok(BTreeMap::from([("first_0".to_string(), self.sim.evaluate(episodes))]))
    }

    fn save_model(&mut self) -> TwResult<()> {
        self.saves += 1;
        debug!(saves = self.saves, env_seed = ?self.env_seed, "synthetic model saved");
        Ok(())
    }
}

struct SyntheticPreset {
    model: Arc<Mutex<SyntheticModel>>,
}

impl Preset for SyntheticPreset {
    fn snapshot(&self) -> TwResult<Vec<u8>> {
        Ok(self.model.lock().to_bytes())
    }

    fn restore(&mut self, state: &[u8]) -> TwResult<()> {
        *self.model.lock() = SyntheticModel::from_bytes(state)?;
        Ok(())
    }
}

impl TrainerFactory for SyntheticTrainer {
    fn kind(&self) -> TrainerKind {
        self.kind
    }

    fn build(&self, request: &BuildRequest<'_>) -> TwResult<BuiltExperiment> {
        let baseline = self.baselines.get(request.env_id)?;
        let model = Arc::new(Mutex::new(SyntheticModel {
            frame: 0,
            skill: 0.0,
        }));
        let init_cost = INIT_JITTER * request.seed.algorithm_rng().gen::<f64>();
        let sim = Simulation {
            model: model.clone(),
            baseline,
            ceiling: skill_ceiling(request.hyperparameters) * (1.0 - init_cost),
            frame_budget: request.frame_budget,
            eval_key: request.seed.environment_rng().gen(),
        };
        debug!(
            env = request.env_id,
            device = %request.device,
            seed = %request.seed,
            ceiling = sim.ceiling,
            "built synthetic experiment"
        );

        let experiment = match self.mode {
            SyntheticMode::Vectorized { num_envs } => Experiment::Vectorized(Box::new(SyntheticVectorized {
                sim,
                num_envs: num_envs.max(1),
                episode_length: self.episode_length,
            })),
            SyntheticMode::Epoch => Experiment::Epoch(Box::new(SyntheticEpoch {
                sim,
                env_seed: None,
                saves: 0,
            })),
        };
        Ok(BuiltExperiment {
            experiment,
            preset: Box::new(SyntheticPreset { model }),
        })
    }
}
