// Trial-derived randomness
// Every random source a trial touches is derived from its number, so two runs
// of the same trial see the same streams without any process-global RNG.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tw_types::TrialNumber;

const NUMERIC_STREAM: u64 = 0;
const ALGORITHM_STREAM: u64 = 1;
const ENVIRONMENT_STREAM: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrialSeed(u64);

impl TrialSeed {
    pub fn from_trial(number: TrialNumber) -> Self {
        Self(number)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    /// General numeric randomness (sampling noise, shuffles).
    pub fn numeric_rng(self) -> ChaCha8Rng {
        self.stream(NUMERIC_STREAM)
    }

    /// Randomness owned by the training algorithm (initialization, exploration).
    pub fn algorithm_rng(self) -> ChaCha8Rng {
        self.stream(ALGORITHM_STREAM)
    }

    /// Environment resets and evaluation episodes.
    pub fn environment_rng(self) -> ChaCha8Rng {
        self.stream(ENVIRONMENT_STREAM)
    }

    fn stream(self, stream: u64) -> ChaCha8Rng {
        let mut rng = ChaCha8Rng::seed_from_u64(self.0);
        rng.set_stream(stream);
        rng
    }
}

impl std::fmt::Display for TrialSeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
