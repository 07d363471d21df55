//! Hyperparameter values as produced by a sampler.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A concrete parameter value produced by a sampler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Int(i64),
    Float(f64),
    Json(serde_json::Value),
}

impl ParameterValue {
    /// Wrap a JSON choice, keeping numbers as `Int`/`Float` so the value reads
    /// back identically from its serialized form.
    pub fn from_json(value: serde_json::Value) -> Self {
        if let Some(v) = value.as_i64() {
            Self::Int(v)
        } else if let Some(v) = value.as_f64() {
            Self::Float(v)
        } else {
            Self::Json(value)
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            Self::Json(v) => v.as_f64(),
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Int(v) => u64::try_from(*v).ok(),
            Self::Json(v) => v.as_u64(),
            Self::Float(_) => None,
        }
    }
}

impl std::fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

/// A full hyperparameter assignment for one trial.
///
/// Ordered so that logs and the best-trial artifact list keys stably.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hyperparameters(BTreeMap<String, ParameterValue>);

impl Hyperparameters {
    /// Parameter name the training factory reads the replay buffer size from.
    pub const REPLAY_BUFFER_SIZE: &'static str = "replay_buffer_size";

    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, name: impl Into<String>, value: ParameterValue) {
        self.0.insert(name.into(), value);
    }

    pub fn with(mut self, name: impl Into<String>, value: ParameterValue) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.0.get(name)
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(ParameterValue::as_f64)
    }

    /// Replay buffer size, if the trainer family samples one.
    pub fn replay_buffer_size(&self) -> Option<u64> {
        self.get(Self::REPLAY_BUFFER_SIZE)
            .and_then(ParameterValue::as_u64)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParameterValue)> {
        self.0.iter()
    }
}

impl FromIterator<(String, ParameterValue)> for Hyperparameters {
    fn from_iter<I: IntoIterator<Item = (String, ParameterValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl std::fmt::Display for Hyperparameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (name, value) in &self.0 {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{name}={value}")?;
            first = false;
        }
        Ok(())
    }
}
