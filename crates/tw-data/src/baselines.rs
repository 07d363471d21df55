//! Per-environment reward baselines and score normalization.

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{debug, info};
use tw_types::{PreconditionError, TwResult};

/// Table entry as stored on disk: named reward statistics for one environment.
#[derive(Debug, Clone, Deserialize)]
struct RewardStats {
    mean_rewards: BTreeMap<String, f64>,
}

/// Variant of the builtin table holding the reference policy's score.
const REFERENCE_VARIANT: &str = "first";

/// Reference and random scores for one environment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnvironmentBaseline {
    /// Mean reward of the builtin reference policy.
    pub reference: f64,
    /// Best mean reward among the recorded random-policy variants.
    pub random_best: f64,
}

/// Immutable baseline lookup, loaded once at process start.
///
/// Either side may be missing for an environment; that only becomes an error
/// when the environment is normalized or explicitly required.
#[derive(Debug, Clone, Default)]
pub struct BaselineTable {
    reference: HashMap<String, f64>,
    random_best: HashMap<String, f64>,
}

impl BaselineTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the builtin (reference) and random reward tables from JSON files.
    pub fn load<P: AsRef<Path>, Q: AsRef<Path>>(builtin_path: P, random_path: Q) -> TwResult<Self> {
        let builtin = std::fs::read_to_string(builtin_path.as_ref())?;
        let random = std::fs::read_to_string(random_path.as_ref())?;
        let table = Self::from_json(&builtin, &random)?;
        info!(
            builtin = %builtin_path.as_ref().display(),
            random = %random_path.as_ref().display(),
            environments = table.reference.len(),
            "loaded baseline tables"
        );
        Ok(table)
    }

    /// Parse both tables from their JSON text.
    pub fn from_json(builtin: &str, random: &str) -> TwResult<Self> {
        let builtin: HashMap<String, RewardStats> = serde_json::from_str(builtin)?;
        let random: HashMap<String, RewardStats> = serde_json::from_str(random)?;

        let mut table = Self::new();
        for (env_id, stats) in builtin {
            match stats.mean_rewards.get(REFERENCE_VARIANT) {
                Some(score) => {
                    table.reference.insert(env_id, *score);
                }
                None => debug!(env = %env_id, "builtin entry has no reference variant"),
            }
        }
        for (env_id, stats) in random {
            let best = stats.mean_rewards.values().copied().reduce(f64::max);
            match best {
                Some(score) => {
                    table.random_best.insert(env_id, score);
                }
                None => debug!(env = %env_id, "random entry has no variants"),
            }
        }
        Ok(table)
    }

    /// Register a baseline pair directly.
    pub fn with_baseline(mut self, env_id: impl Into<String>, reference: f64, random_best: f64) -> Self {
        let env_id = env_id.into();
        self.reference.insert(env_id.clone(), reference);
        self.random_best.insert(env_id, random_best);
        self
    }

    pub fn get(&self, env_id: &str) -> TwResult<EnvironmentBaseline> {
        let reference = self.reference.get(env_id).copied().ok_or_else(|| {
            PreconditionError::MissingBaseline {
                env_id: env_id.to_string(),
                table: "builtin".to_string(),
            }
        })?;
        let random_best = self.random_best.get(env_id).copied().ok_or_else(|| {
            PreconditionError::MissingBaseline {
                env_id: env_id.to_string(),
                table: "random".to_string(),
            }
        })?;
        Ok(EnvironmentBaseline {
            reference,
            random_best,
        })
    }

    /// Fail unless every environment has both baselines and they differ.
    pub fn require_all<S: AsRef<str>>(&self, env_ids: &[S]) -> TwResult<()> {
        for env_id in env_ids {
            let baseline = self.get(env_id.as_ref())?;
            if baseline.reference == baseline.random_best {
                return Err(PreconditionError::DegenerateBaseline {
                    env_id: env_id.as_ref().to_string(),
                    score: baseline.reference,
                }
                .into());
            }
        }
        Ok(())
    }
}

/// Converts raw mean returns into scores comparable across environments.
#[derive(Debug, Clone)]
pub struct ScoreNormalizer {
    baselines: BaselineTable,
}

impl ScoreNormalizer {
    pub fn new(baselines: BaselineTable) -> Self {
        Self { baselines }
    }

    /// `(raw - reference) / (random_best - reference)`, unclamped.
    ///
    /// 0 means reference-policy performance and 1 means the best random
    /// variant; trained agents may land outside `[0, 1]`.
    pub fn normalize(&self, raw_mean: f64, env_id: &str) -> TwResult<f64> {
        let baseline = self.baselines.get(env_id)?;
        let span = baseline.random_best - baseline.reference;
        if span == 0.0 {
            return Err(PreconditionError::DegenerateBaseline {
                env_id: env_id.to_string(),
                score: baseline.reference,
            }
            .into());
        }
        Ok((raw_mean - baseline.reference) / span)
    }

    pub fn baselines(&self) -> &BaselineTable {
        &self.baselines
    }
}
