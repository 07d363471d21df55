use thiserror::Error;

/// Main error type for the Tunewell system
#[derive(Error, Debug)]
pub enum TwError {
    #[error("Precondition violated: {0}")]
    Precondition(#[from] PreconditionError),

    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error("Study store error: {0}")]
    Store(#[from] StoreError),

    #[error("Training error: {0}")]
    Training(#[from] TrainingError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TwError {
    /// Whether retrying the failed operation later may succeed.
    ///
    /// Only shared-store connectivity problems qualify; precondition and
    /// resource failures are deterministic for a given trial.
    pub fn is_transient(&self) -> bool {
        matches!(self, TwError::Store(StoreError::Unavailable { .. }))
    }
}

/// Violated contracts that abort a runner without retry
#[derive(Error, Debug)]
pub enum PreconditionError {
    #[error("No {table} baseline recorded for environment {env_id}")]
    MissingBaseline { env_id: String, table: String },

    #[error("Degenerate baseline for environment {env_id}: reference and random scores are both {score}")]
    DegenerateBaseline { env_id: String, score: f64 },

    #[error("Checkpoint {frame} not found in {scope}")]
    CheckpointNotFound { scope: String, frame: u64 },

    #[error("Checkpoint {frame} already exists in {scope}")]
    CheckpointExists { scope: String, frame: u64 },

    #[error("Unexpected entry {entry} in checkpoint directory {scope}")]
    MalformedCheckpointDir { scope: String, entry: String },

    #[error("Unexpected evaluation result shape: {message}")]
    EvaluationShape { message: String },

    #[error("Trial {number} not found in study {study}")]
    TrialNotFound { study: String, number: u64 },
}

/// Accelerator / worker allocation failures at dispatch time
#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("Resource exhausted: requested {requested_gpus} GPUs and {requested_cpus} CPUs, available {available_gpus} GPUs and {available_cpus} CPUs")]
    Exhausted {
        requested_gpus: f64,
        requested_cpus: f64,
        available_gpus: f64,
        available_cpus: f64,
    },

    #[error("Worker pool is shut down")]
    PoolClosed,

    #[error("Worker spawn failed: {message}")]
    SpawnFailed { message: String },
}

/// Study storage errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Study store unavailable: {message}")]
    Unavailable { message: String },

    #[error("Study not found: {name}")]
    StudyNotFound { name: String },

    #[error("Study already exists: {name}")]
    StudyExists { name: String },

    #[error("Study journal corrupted at line {line}: {message}")]
    Corrupt { line: usize, message: String },

    #[error("Trial {number} is already finished")]
    TrialFinished { number: u64 },
}

/// Errors raised by training algorithm implementations
#[derive(Error, Debug)]
pub enum TrainingError {
    #[error("Experiment construction failed: {message}")]
    BuildFailed { message: String },

    #[error("Training step failed: {message}")]
    StepFailed { message: String },

    #[error("Evaluation failed: {message}")]
    EvaluationFailed { message: String },

    #[error("Model state error: {message}")]
    State { message: String },
}

/// Result type alias for Tunewell operations
pub type TwResult<T> = Result<T, TwError>;

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::TwError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::TwError::Config(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = PreconditionError::MissingBaseline {
            env_id: "pong_v2".to_string(),
            table: "random".to_string(),
        };

        assert!(error.to_string().contains("pong_v2"));
        assert!(error.to_string().contains("random"));
    }

    #[test]
    fn test_error_conversion() {
        let precondition = PreconditionError::CheckpointNotFound {
            scope: "nfsp_rainbow_pong_v2_none_1000_0".to_string(),
            frame: 500,
        };
        let tw_error: TwError = precondition.into();

        match tw_error {
            TwError::Precondition(_) => (),
            _ => panic!("Expected Precondition error"),
        }
    }

    #[test]
    fn test_transient_classification() {
        let unavailable: TwError = StoreError::Unavailable {
            message: "lock timeout".to_string(),
        }
        .into();
        assert!(unavailable.is_transient());

        let corrupt: TwError = StoreError::Corrupt {
            line: 3,
            message: "bad op".to_string(),
        }
        .into();
        assert!(!corrupt.is_transient());

        let exhausted: TwError = ResourceError::PoolClosed.into();
        assert!(!exhausted.is_transient());
    }

    #[test]
    fn test_macros() {
        let config_err = config_error!("Missing required field: {}", "envs");
        assert!(matches!(config_err, TwError::Config(_)));
        let internal_err = internal_error!("Something went wrong");
        assert!(matches!(internal_err, TwError::Internal(_)));
    }
}
