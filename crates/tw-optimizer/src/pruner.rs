//! Pruning rules: decide from a trial's intermediate history whether it should
//! stop early.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tw_types::{config_error, ObjectiveDirection, TrialRecord, TrialStatus, TwResult};

/// Decides whether a running trial should be stopped.
pub trait Pruner: Send + Sync {
    /// `trial` is the running trial with its reports so far; `history` holds
    /// every other trial of the study in any state.
    fn prune(&self, trial: &TrialRecord, history: &[TrialRecord], direction: ObjectiveDirection) -> bool;

    /// Human-readable pruner name.
    fn name(&self) -> &str;
}

/// Never prunes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NopPruner;

impl Pruner for NopPruner {
    fn prune(&self, _trial: &TrialRecord, _history: &[TrialRecord], _direction: ObjectiveDirection) -> bool {
        false
    }

    fn name(&self) -> &str {
        "nop"
    }
}

/// Prunes when the trial's best intermediate value so far falls on the wrong
/// side of a percentile of completed trials' values at the same step.
#[derive(Debug, Clone)]
pub struct PercentilePruner {
    percentile: f64,
    n_startup_trials: usize,
    n_warmup_steps: u64,
    interval_steps: u64,
}

impl PercentilePruner {
    pub fn new(percentile: f64) -> Self {
        Self {
            percentile,
            n_startup_trials: 5,
            n_warmup_steps: 0,
            interval_steps: 1,
        }
    }

    /// The 50th-percentile pruner.
    pub fn median() -> Self {
        Self::new(50.0)
    }

    /// Completed trials required before any pruning happens.
    pub fn n_startup_trials(mut self, n: usize) -> Self {
        self.n_startup_trials = n;
        self
    }

    /// Steps (training frames) a trial may run before it can be pruned.
    pub fn n_warmup_steps(mut self, n: u64) -> Self {
        self.n_warmup_steps = n;
        self
    }

    pub fn interval_steps(mut self, n: u64) -> Self {
        self.interval_steps = n.max(1);
        self
    }

    fn best_intermediate(trial: &TrialRecord, direction: ObjectiveDirection) -> Option<f64> {
        let values = trial.intermediate_values.values().copied();
        match direction {
            ObjectiveDirection::Maximize => values.reduce(f64::max),
            ObjectiveDirection::Minimize => values.reduce(f64::min),
        }
    }
}

impl Pruner for PercentilePruner {
    fn prune(&self, trial: &TrialRecord, history: &[TrialRecord], direction: ObjectiveDirection) -> bool {
        let Some((step, _)) = trial.last_intermediate() else {
            return false;
        };

        let completed: Vec<&TrialRecord> = history
            .iter()
            .filter(|t| t.status == TrialStatus::Completed && t.number != trial.number)
            .collect();
        if completed.len() < self.n_startup_trials {
            return false;
        }
        if step < self.n_warmup_steps || (step - self.n_warmup_steps) % self.interval_steps != 0 {
            return false;
        }

        let Some(best) = Self::best_intermediate(trial, direction) else {
            return false;
        };
        if best.is_nan() {
            return true;
        }

        let mut at_step: Vec<f64> = completed
            .iter()
            .filter_map(|t| t.intermediate_values.get(&step).copied())
            .filter(|v| !v.is_nan())
            .collect();
        if at_step.is_empty() {
            return false;
        }

        let q = match direction {
            ObjectiveDirection::Maximize => 100.0 - self.percentile,
            ObjectiveDirection::Minimize => self.percentile,
        };
        let threshold = percentile(&mut at_step, q);
        match direction {
            ObjectiveDirection::Maximize => best < threshold,
            ObjectiveDirection::Minimize => best > threshold,
        }
    }

    fn name(&self) -> &str {
        "percentile"
    }
}

/// Linear-interpolated percentile, `q` in `[0, 100]`.
fn percentile(values: &mut [f64], q: f64) -> f64 {
    values.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = (q.clamp(0.0, 100.0) / 100.0) * (values.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;
    values[lower] + (values[upper] - values[lower]) * weight
}

/// Prunes as soon as the latest report leaves `[lower, upper]`.
#[derive(Debug, Clone)]
pub struct ThresholdPruner {
    lower: Option<f64>,
    upper: Option<f64>,
    n_warmup_steps: u64,
}

impl ThresholdPruner {
    pub fn new(lower: Option<f64>, upper: Option<f64>) -> Self {
        Self {
            lower,
            upper,
            n_warmup_steps: 0,
        }
    }

    pub fn lower(bound: f64) -> Self {
        Self::new(Some(bound), None)
    }

    pub fn n_warmup_steps(mut self, n: u64) -> Self {
        self.n_warmup_steps = n;
        self
    }
}

impl Pruner for ThresholdPruner {
    fn prune(&self, trial: &TrialRecord, _history: &[TrialRecord], _direction: ObjectiveDirection) -> bool {
        let Some((step, value)) = trial.last_intermediate() else {
            return false;
        };
        if step < self.n_warmup_steps {
            return false;
        }
        if value.is_nan() {
            return true;
        }
        self.lower.is_some_and(|lower| value < lower) || self.upper.is_some_and(|upper| value > upper)
    }

    fn name(&self) -> &str {
        "threshold"
    }
}

/// Serializable pruner selection for the search configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PrunerConfig {
    None,
    Median {
        #[serde(default = "default_startup_trials")]
        n_startup_trials: usize,
        #[serde(default)]
        n_warmup_steps: u64,
        #[serde(default = "default_interval_steps")]
        interval_steps: u64,
    },
    Percentile {
        percentile: f64,
        #[serde(default = "default_startup_trials")]
        n_startup_trials: usize,
        #[serde(default)]
        n_warmup_steps: u64,
        #[serde(default = "default_interval_steps")]
        interval_steps: u64,
    },
    Threshold {
        lower: Option<f64>,
        upper: Option<f64>,
        #[serde(default)]
        n_warmup_steps: u64,
    },
}

fn default_startup_trials() -> usize {
    5
}

fn default_interval_steps() -> u64 {
    1
}

impl Default for PrunerConfig {
    fn default() -> Self {
        PrunerConfig::Median {
            n_startup_trials: default_startup_trials(),
            n_warmup_steps: 0,
            interval_steps: default_interval_steps(),
        }
    }
}

impl PrunerConfig {
    pub fn build(&self) -> TwResult<Arc<dyn Pruner>> {
        let pruner: Arc<dyn Pruner> = match self {
            PrunerConfig::None => Arc::new(NopPruner),
            PrunerConfig::Median {
                n_startup_trials,
                n_warmup_steps,
                interval_steps,
            } => Arc::new(
                PercentilePruner::median()
                    .n_startup_trials(*n_startup_trials)
                    .n_warmup_steps(*n_warmup_steps)
                    .interval_steps(*interval_steps),
            ),
            PrunerConfig::Percentile {
                percentile,
                n_startup_trials,
                n_warmup_steps,
                interval_steps,
            } => {
                if !(0.0..=100.0).contains(percentile) {
                    return Err(config_error!("percentile must be within [0, 100], got {percentile}"));
                }
                Arc::new(
                    PercentilePruner::new(*percentile)
                        .n_startup_trials(*n_startup_trials)
                        .n_warmup_steps(*n_warmup_steps)
                        .interval_steps(*interval_steps),
                )
            }
            PrunerConfig::Threshold {
                lower,
                upper,
                n_warmup_steps,
            } => {
                if lower.is_none() && upper.is_none() {
                    return Err(config_error!("threshold pruner needs a lower or an upper bound"));
                }
                Arc::new(ThresholdPruner::new(*lower, *upper).n_warmup_steps(*n_warmup_steps))
            }
        };
        Ok(pruner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tw_types::TrialResolution;

    fn completed(number: u64, reports: &[(u64, f64)]) -> TrialRecord {
        let mut trial = TrialRecord::new(number);
        for (step, value) in reports {
            trial.report(*step, *value);
        }
        let last = reports.last().map(|(_, v)| *v).unwrap_or(0.0);
        trial.resolve(TrialResolution::Completed { value: last });
        trial
    }

    fn running(number: u64, reports: &[(u64, f64)]) -> TrialRecord {
        let mut trial = TrialRecord::new(number);
        for (step, value) in reports {
            trial.report(*step, *value);
        }
        trial
    }

    #[test]
    fn percentile_interpolates() {
        assert_eq!(percentile(&mut [1.0, 2.0, 3.0, 4.0], 50.0), 2.5);
        assert_eq!(percentile(&mut [5.0], 50.0), 5.0);
        assert_eq!(percentile(&mut [3.0, 1.0, 2.0], 0.0), 1.0);
    }

    #[test]
    fn median_waits_for_startup_trials() {
        let pruner = PercentilePruner::median().n_startup_trials(2);
        let history = vec![completed(0, &[(100, 0.9)])];
        let trial = running(1, &[(100, -5.0)]);
        assert!(!pruner.prune(&trial, &history, ObjectiveDirection::Maximize));
    }

    #[test]
    fn median_prunes_below_median_when_maximizing() {
        let pruner = PercentilePruner::median().n_startup_trials(2);
        let history = vec![
            completed(0, &[(100, 0.4), (200, 0.6)]),
            completed(1, &[(100, 0.6), (200, 0.8)]),
        ];
        let weak = running(2, &[(100, 0.1)]);
        assert!(pruner.prune(&weak, &history, ObjectiveDirection::Maximize));

        let strong = running(3, &[(100, 0.7)]);
        assert!(!pruner.prune(&strong, &history, ObjectiveDirection::Maximize));
    }

    #[test]
    fn median_uses_best_value_so_far() {
        let pruner = PercentilePruner::median().n_startup_trials(1);
        let history = vec![completed(0, &[(100, 0.5), (200, 0.5)])];
        // Dipped at step 200 but already beat the median at step 100.
        let trial = running(1, &[(100, 0.9), (200, 0.2)]);
        assert!(!pruner.prune(&trial, &history, ObjectiveDirection::Maximize));
    }

    #[test]
    fn median_minimize_prunes_above_median() {
        let pruner = PercentilePruner::median().n_startup_trials(1);
        let history = vec![completed(0, &[(100, 1.0)])];
        let trial = running(1, &[(100, 3.0)]);
        assert!(pruner.prune(&trial, &history, ObjectiveDirection::Minimize));
    }

    #[test]
    fn median_ignores_unmatched_steps_and_warmup() {
        let history = vec![completed(0, &[(100, 0.9)])];
        let trial = running(1, &[(104, 0.0)]);
        let pruner = PercentilePruner::median().n_startup_trials(1);
        assert!(!pruner.prune(&trial, &history, ObjectiveDirection::Maximize));

        let warm = PercentilePruner::median()
            .n_startup_trials(1)
            .n_warmup_steps(500);
        let early = running(2, &[(100, -1.0)]);
        assert!(!warm.prune(&early, &history, ObjectiveDirection::Maximize));
    }

    #[test]
    fn pruned_and_failed_trials_do_not_count_as_startup() {
        let mut pruned = running(0, &[(100, 0.9)]);
        pruned.resolve(TrialResolution::Pruned);
        let mut failed = running(1, &[(100, 0.9)]);
        failed.resolve(TrialResolution::Failed { error: "boom".into() });

        let pruner = PercentilePruner::median().n_startup_trials(1);
        let trial = running(2, &[(100, -1.0)]);
        assert!(!pruner.prune(&trial, &[pruned, failed], ObjectiveDirection::Maximize));
    }

    #[test]
    fn threshold_prunes_below_lower_bound() {
        let pruner = ThresholdPruner::lower(0.0);
        assert!(!pruner.prune(&running(0, &[(100, 0.2)]), &[], ObjectiveDirection::Maximize));
        assert!(pruner.prune(&running(0, &[(100, 0.2), (200, -0.1)]), &[], ObjectiveDirection::Maximize));
        assert!(pruner.prune(&running(0, &[(100, f64::NAN)]), &[], ObjectiveDirection::Maximize));
    }

    #[test]
    fn threshold_respects_warmup_and_upper() {
        let pruner = ThresholdPruner::new(None, Some(1.0)).n_warmup_steps(200);
        assert!(!pruner.prune(&running(0, &[(100, 5.0)]), &[], ObjectiveDirection::Minimize));
        assert!(pruner.prune(&running(0, &[(300, 5.0)]), &[], ObjectiveDirection::Minimize));
    }

    #[test]
    fn nop_never_prunes() {
        assert!(!NopPruner.prune(&running(0, &[(1, f64::NAN)]), &[], ObjectiveDirection::Maximize));
    }

    #[test]
    fn config_builds_pruners() {
        assert_eq!(PrunerConfig::default().build().unwrap().name(), "percentile");
        assert_eq!(PrunerConfig::None.build().unwrap().name(), "nop");

        let parsed: PrunerConfig =
            serde_json::from_str(r#"{"type": "threshold", "lower": -0.5}"#).unwrap();
        assert_eq!(parsed.build().unwrap().name(), "threshold");

        let unbounded = PrunerConfig::Threshold {
            lower: None,
            upper: None,
            n_warmup_steps: 0,
        };
        assert!(unbounded.build().is_err());

        let out_of_range = PrunerConfig::Percentile {
            percentile: 120.0,
            n_startup_trials: 0,
            n_warmup_steps: 0,
            interval_steps: 1,
        };
        assert!(out_of_range.build().is_err());
    }
}
