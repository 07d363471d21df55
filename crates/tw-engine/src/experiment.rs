// Training algorithm seam
// The search never looks inside an algorithm. A factory builds one per
// (trial, environment) and hands back an agent in one of two shapes plus the
// preset whose state is checkpointed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tw_types::{Hyperparameters, TwResult};

use crate::config::TrainerKind;
use crate::seed::TrialSeed;

/// Accelerator the algorithm should place its networks on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    Cuda,
    Cpu,
}

impl Device {
    pub fn for_gpus(num_gpus: u32) -> Self {
        if num_gpus > 0 {
            Device::Cuda
        } else {
            Device::Cpu
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Cuda => write!(f, "cuda"),
            Device::Cpu => write!(f, "cpu"),
        }
    }
}

/// Result of one synchronized step across all vectorized instances.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepBatch {
    pub rewards: Vec<f64>,
    pub dones: Vec<bool>,
}

impl StepBatch {
    pub fn completed_episodes(&self) -> usize {
        self.dones.iter().filter(|done| **done).count()
    }
}

/// An agent stepping several environment instances in lockstep.
///
/// The environment handle lives inside the agent; `step` acts on the current
/// observations and advances every instance once.
pub trait VectorizedAgent: Send {
    fn num_envs(&self) -> usize;

    fn step(&mut self) -> TwResult<StepBatch>;

    /// Run `episodes` evaluation episodes. When several agents share the
    /// environment their returns come back interleaved, one per agent in turn.
    fn test(&mut self, episodes: usize) -> TwResult<Vec<f64>>;

    /// Number of agents whose returns `test` interleaves.
    fn interleaved_agents(&self) -> usize {
        2
    }
}

/// An agent that trains in whole segments and evaluates per agent id.
pub trait EpochAgent: Send {
    fn seed_env(&mut self, seed: u64);

    /// Train until the cumulative frame count reaches `until_frame`.
    fn train(&mut self, until_frame: u64) -> TwResult<()>;

    fn test(&mut self, episodes: usize) -> TwResult<BTreeMap<String, Vec<f64>>>;

    /// The agent's own model export, run after each evaluation.
    fn save_model(&mut self) -> TwResult<()>;
}

/// Checkpointable algorithm state.
pub trait Preset: Send {
    fn snapshot(&self) -> TwResult<Vec<u8>>;

    fn restore(&mut self, state: &[u8]) -> TwResult<()>;
}

pub enum Experiment {
    Vectorized(Box<dyn VectorizedAgent>),
    Epoch(Box<dyn EpochAgent>),
}

impl std::fmt::Debug for Experiment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Experiment::Vectorized(agent) => f
                .debug_struct("Vectorized")
                .field("num_envs", &agent.num_envs())
                .finish(),
            Experiment::Epoch(_) => f.write_str("Epoch"),
        }
    }
}

pub struct BuiltExperiment {
    pub experiment: Experiment,
    pub preset: Box<dyn Preset>,
}

/// Everything a factory needs to build one runner's algorithm.
#[derive(Debug, Clone)]
pub struct BuildRequest<'a> {
    pub env_id: &'a str,
    pub device: Device,
    pub buffer_size: Option<u64>,
    pub seed: TrialSeed,
    pub frame_budget: u64,
    pub hyperparameters: &'a Hyperparameters,
}

pub trait TrainerFactory: Send + Sync {
    fn kind(&self) -> TrainerKind;

    fn build(&self, request: &BuildRequest<'_>) -> TwResult<BuiltExperiment>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_follows_gpu_count() {
        assert_eq!(Device::for_gpus(0), Device::Cpu);
        assert_eq!(Device::for_gpus(2), Device::Cuda);
        assert_eq!(Device::Cuda.to_string(), "cuda");
    }

    #[test]
    fn step_batch_counts_completions() {
        let batch = StepBatch {
            rewards: vec![1.0, 0.0, -1.0],
            dones: vec![true, false, true],
        };
        assert_eq!(batch.completed_episodes(), 2);
    }
}
