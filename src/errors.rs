//! Crate-wide error types.

use thiserror::Error;

/// Errors that can surface while loading or validating a scenario, or while
/// running a trial.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("log serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Malformed or impossible scenario parameters. Fail fast, before any trial
/// starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file does not exist: '{0}'")]
    FileDoesNotExist(String),

    #[error("unsupported configuration format for '{0}'")]
    UnsupportedFormat(String),

    #[error("could not parse configuration: {0}")]
    Parse(String),

    #[error("group_size ({group_size}) must not exceed peers ({peers})")]
    GroupSizeExceedsPeers { group_size: usize, peers: usize },

    #[error("fault_tolerance must be in [0, 1/3), got {0}")]
    FaultToleranceOutOfRange(f64),

    #[error("peers must be at least 1, got {0}")]
    TooFewPeers(usize),

    #[error("min_delay must be <= max_delay, got min={min} max={max}")]
    DelayRangeInverted { min: u32, max: u32 },

    #[error("unknown delay model: '{0}'")]
    UnknownDelayModel(String),

    #[error("unknown protocol: '{0}'")]
    UnknownProtocol(String),

    #[error("sharded protocol requires a `committee` section")]
    MissingCommitteeSection,

    #[error("unknown infection: '{0}'")]
    UnknownInfection(String),

    #[error("byzantine count ({0}) must not exceed peers ({1})")]
    TooManyByzantines(usize, usize),
}
