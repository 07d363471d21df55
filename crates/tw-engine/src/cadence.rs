// Training cadences
// How a runner advances training and where its evaluation boundaries fall.
// Chosen once per runner from the shape of the built experiment.

use std::time::Instant;
use tracing::debug;
use tw_types::{PreconditionError, TwResult};

use crate::experiment::{EpochAgent, VectorizedAgent};

/// Mutable state of one runner invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingProgress {
    /// Cumulative training frames.
    pub frame: u64,
    pub episodes: u64,
    /// Per-instance return accumulators; empty for epoch training.
    pub returns: Vec<f64>,
    /// Normalized evaluation scores so far, in boundary order.
    pub scores: Vec<f64>,
}

impl TrainingProgress {
    pub fn new(frame: u64, instances: usize) -> Self {
        Self {
            frame,
            episodes: 0,
            returns: vec![0.0; instances],
            scores: Vec::new(),
        }
    }

    pub fn running_mean(&self) -> Option<f64> {
        if self.scores.is_empty() {
            return None;
        }
        Some(self.scores.iter().sum::<f64>() / self.scores.len() as f64)
    }
}

pub trait TrainingCadence: Send {
    /// Frames added per `advance`.
    fn step_width(&self) -> u64;

    fn advance(&mut self, progress: &mut TrainingProgress) -> TwResult<()>;

    fn at_boundary(&self, progress: &TrainingProgress) -> bool;

    /// Raw evaluation returns of the agent under search.
    fn evaluate(&mut self, episodes: usize) -> TwResult<Vec<f64>>;

    /// Runs after every evaluation.
    fn after_evaluation(&mut self) -> TwResult<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Step-batched
// ---------------------------------------------------------------------------

/// One synchronized step of all vectorized instances per `advance`.
pub struct StepBatched {
    env_id: String,
    agent: Box<dyn VectorizedAgent>,
    save_interval: u64,
    tick: Instant,
    frames_since_tick: u64,
}

impl StepBatched {
    pub fn new(env_id: impl Into<String>, agent: Box<dyn VectorizedAgent>, save_interval: u64) -> Self {
        Self {
            env_id: env_id.into(),
            agent,
            save_interval,
            tick: Instant::now(),
            frames_since_tick: 0,
        }
    }
}

impl TrainingCadence for StepBatched {
    fn step_width(&self) -> u64 {
        self.agent.num_envs() as u64
    }

    fn advance(&mut self, progress: &mut TrainingProgress) -> TwResult<()> {
        let width = self.step_width();
        let batch = self.agent.step()?;
        if batch.rewards.len() != progress.returns.len() || batch.dones.len() != progress.returns.len() {
            return Err(PreconditionError::EvaluationShape {
                message: format!(
                    "step returned {} rewards and {} dones for {} instances",
                    batch.rewards.len(),
                    batch.dones.len(),
                    progress.returns.len()
                ),
            }
            .into());
        }

        progress.frame += width;
        self.frames_since_tick += width;
        for (acc, reward) in progress.returns.iter_mut().zip(&batch.rewards) {
            *acc += reward;
        }

        let completed = batch.completed_episodes();
        if completed > 0 {
            let elapsed = self.tick.elapsed().as_secs_f64();
            let fps = if elapsed > 0.0 {
                self.frames_since_tick as f64 / elapsed
            } else {
                0.0
            };
            self.tick = Instant::now();
            self.frames_since_tick = 0;

            for (instance, done) in batch.dones.iter().enumerate() {
                if *done {
                    debug!(
                        env = %self.env_id,
                        frame = progress.frame,
                        instance,
                        episode_return = progress.returns[instance],
                        fps,
                        "training episode"
                    );
                    progress.returns[instance] = 0.0;
                }
            }
            progress.episodes += completed as u64;
        }
        Ok(())
    }

    fn at_boundary(&self, progress: &TrainingProgress) -> bool {
        progress.frame % self.save_interval < self.step_width()
    }

    fn evaluate(&mut self, episodes: usize) -> TwResult<Vec<f64>> {
        let agents = self.agent.interleaved_agents().max(1);
        let returns = self.agent.test(episodes * agents)?;
        let own: Vec<f64> = returns.into_iter().step_by(agents).collect();
        if own.is_empty() {
            return Err(PreconditionError::EvaluationShape {
                message: "evaluation produced no episode returns".to_string(),
            }
            .into());
        }
        Ok(own)
    }
}

// ---------------------------------------------------------------------------
// Epoch segments
// ---------------------------------------------------------------------------

/// A whole save interval of training per `advance`; every segment end is a
/// boundary.
pub struct EpochSegments {
    agent: Box<dyn EpochAgent>,
    save_interval: u64,
}

impl EpochSegments {
    pub fn new(agent: Box<dyn EpochAgent>, save_interval: u64) -> Self {
        Self {
            agent,
            save_interval,
        }
    }
}

impl TrainingCadence for EpochSegments {
    fn step_width(&self) -> u64 {
        self.save_interval
    }

    fn advance(&mut self, progress: &mut TrainingProgress) -> TwResult<()> {
        let until = progress.frame + self.save_interval;
        self.agent.train(until)?;
        progress.frame = until;
        Ok(())
    }

    fn at_boundary(&self, _progress: &TrainingProgress) -> bool {
        true
    }

    fn evaluate(&mut self, episodes: usize) -> TwResult<Vec<f64>> {
        let results = self.agent.test(episodes)?;
        if results.len() != 1 {
            return Err(PreconditionError::EvaluationShape {
                message: format!(
                    "expected one evaluation series, got {} ({:?})",
                    results.len(),
                    results.keys().collect::<Vec<_>>()
                ),
            }
            .into());
        }
        let returns = results.into_values().next().unwrap_or_default();
        if returns.is_empty() {
            return Err(PreconditionError::EvaluationShape {
                message: "evaluation produced no episode returns".to_string(),
            }
            .into());
        }
        Ok(returns)
    }

    fn after_evaluation(&mut self) -> TwResult<()> {
        self.agent.save_model()
    }
}
