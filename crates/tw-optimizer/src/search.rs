//! Search space definitions and the trial-seeded random sampler.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tw_types::{config_error, Hyperparameters, ParameterValue, TrialHandle, TwResult};

/// A single parameter dimension in the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    /// Parameter name as the training factory reads it (e.g. "lr").
    pub name: String,
    /// The kind of search range.
    pub kind: ParameterKind,
}

/// Describes how a parameter is sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParameterKind {
    /// Continuous uniform range [low, high].
    FloatRange { low: f64, high: f64 },
    /// Integer range [low, high] inclusive.
    IntRange { low: i64, high: i64 },
    /// Log-uniform range (sampled in log-space then exponentiated).
    LogUniform { low: f64, high: f64 },
    /// Categorical choices.
    Choice { values: Vec<serde_json::Value> },
}

/// The full search space: an ordered list of parameter definitions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    pub parameters: Vec<ParameterDef>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self {
            parameters: Vec::new(),
        }
    }

    pub fn add_float(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::FloatRange { low, high },
        });
        self
    }

    pub fn add_int(mut self, name: impl Into<String>, low: i64, high: i64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::IntRange { low, high },
        });
        self
    }

    pub fn add_log_uniform(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::LogUniform { low, high },
        });
        self
    }

    pub fn add_choice(mut self, name: impl Into<String>, values: Vec<serde_json::Value>) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::Choice { values },
        });
        self
    }

    /// Reject empty or inverted ranges before any trial is sampled.
    pub fn validate(&self) -> TwResult<()> {
        for param in &self.parameters {
            let valid = match &param.kind {
                ParameterKind::FloatRange { low, high } => low <= high,
                ParameterKind::IntRange { low, high } => low <= high,
                ParameterKind::LogUniform { low, high } => *low > 0.0 && low <= high,
                ParameterKind::Choice { values } => !values.is_empty(),
            };
            if !valid {
                return Err(config_error!(
                    "invalid search range for parameter {}: {:?}",
                    param.name,
                    param.kind
                ));
            }
        }
        Ok(())
    }

    // ---- default spaces per trainer family ----

    /// Single-policy Rainbow DQN.
    pub fn rainbow() -> Self {
        Self::new()
            .add_log_uniform("lr", 1e-5, 1e-3)
            .add_choice("batch_size", vec![json!(32), json!(64), json!(128)])
            .add_choice(
                "replay_buffer_size",
                vec![json!(100_000), json!(300_000), json!(1_000_000)],
            )
            .add_choice("discount_factor", vec![json!(0.98), json!(0.99), json!(0.995)])
            .add_int("update_frequency", 1, 8)
            .add_int("n_steps", 1, 5)
            .add_choice("atoms", vec![json!(21), json!(51)])
            .add_float("sigma", 0.1, 0.7)
    }

    /// Rainbow with neural fictitious self-play on top.
    pub fn nfsp_rainbow() -> Self {
        Self::rainbow()
            .add_choice(
                "reservoir_buffer_size",
                vec![json!(100_000), json!(1_000_000)],
            )
            .add_float("anticipatory", 0.05, 0.3)
    }

    pub fn ppo() -> Self {
        Self::new()
            .add_log_uniform("lr", 1e-5, 1e-3)
            .add_float("clip_initial", 0.1, 0.3)
            .add_log_uniform("entropy_loss_scaling", 1e-4, 1e-1)
            .add_int("epochs", 2, 8)
            .add_choice("minibatches", vec![json!(2), json!(4), json!(8)])
            .add_float("lam", 0.9, 0.99)
            .add_choice("discount_factor", vec![json!(0.98), json!(0.99), json!(0.995)])
    }

    pub fn nfsp_ppo() -> Self {
        Self::ppo()
            .add_choice(
                "reservoir_buffer_size",
                vec![json!(100_000), json!(1_000_000)],
            )
            .add_float("anticipatory", 0.05, 0.3)
    }
}

// ---------------------------------------------------------------------------
// Samplers
// ---------------------------------------------------------------------------

/// Maps a trial to a hyperparameter assignment.
pub trait Sampler: Send + Sync {
    fn sample(&self, trial: &TrialHandle) -> TwResult<Hyperparameters>;

    /// Human-readable sampler name.
    fn name(&self) -> &str;
}

/// Independent random sampling across the search space.
///
/// The draw is a pure function of `(seed, trial number)`, so re-running a trial
/// reproduces its assignment.
#[derive(Debug, Clone)]
pub struct RandomSampler {
    space: SearchSpace,
    seed: u64,
}

impl RandomSampler {
    pub fn new(space: SearchSpace) -> Self {
        Self::with_seed(space, 0)
    }

    pub fn with_seed(space: SearchSpace, seed: u64) -> Self {
        Self { space, seed }
    }

    fn rng_for(&self, trial: &TrialHandle) -> ChaCha8Rng {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        rng.set_stream(trial.number);
        rng
    }

    fn sample_one(&self, rng: &mut ChaCha8Rng) -> Hyperparameters {
        let mut params = Hyperparameters::new();

        for param in &self.space.parameters {
            let value = match &param.kind {
                ParameterKind::FloatRange { low, high } => {
                    ParameterValue::Float(rng.gen_range(*low..=*high))
                }
                ParameterKind::IntRange { low, high } => {
                    ParameterValue::Int(rng.gen_range(*low..=*high))
                }
                ParameterKind::LogUniform { low, high } => {
                    let log_low = low.ln();
                    let log_high = high.ln();
                    let log_val: f64 = rng.gen_range(log_low..=log_high);
                    ParameterValue::Float(log_val.exp().clamp(*low, *high))
                }
                ParameterKind::Choice { values } => {
                    let idx = rng.gen_range(0..values.len());
                    ParameterValue::from_json(values[idx].clone())
                }
            };
            params.insert(param.name.clone(), value);
        }

        params
    }
}

impl Sampler for RandomSampler {
    fn sample(&self, trial: &TrialHandle) -> TwResult<Hyperparameters> {
        self.space.validate()?;
        let mut rng = self.rng_for(trial);
        Ok(self.sample_one(&mut rng))
    }

    fn name(&self) -> &str {
        "random"
    }
}
