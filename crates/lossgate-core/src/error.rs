//! Error taxonomy for scenario runs.

use serde::{Deserialize, Serialize};

use crate::policy::ThresholdViolation;

/// A line claimed a metric field but the field did not match its grammar.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("could not extract loss value from line: {line:?}")]
    MalformedLoss { line: String },

    #[error("could not extract iteration index from line: {line:?}")]
    MalformedIteration { line: String },

    #[error("iteration {iteration} is checked but no loss was reported for it (line: {line:?})")]
    MissingLoss { iteration: u64, line: String },
}

impl ParseError {
    /// The raw line that triggered the error.
    pub fn line(&self) -> &str {
        match self {
            ParseError::MalformedLoss { line }
            | ParseError::MalformedIteration { line }
            | ParseError::MissingLoss { line, .. } => line,
        }
    }
}

/// Fatal conditions that fail a scenario.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("threshold violated: {0}")]
    Threshold(#[from] ThresholdViolation),

    #[error("job exited with code {code:?} (signal {signal:?}), expected {expected}")]
    AbnormalExit {
        code: Option<i32>,
        signal: Option<i32>,
        expected: i32,
    },

    #[error("scenario exceeded its deadline of {limit_ms}ms")]
    Timeout { limit_ms: u64 },

    #[error("config generation `{command}` failed: {reason}")]
    ConfigGeneration { command: String, reason: String },

    #[error("failed to launch `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid scenario configuration: {0}")]
    InvalidConfig(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarnessError {
    /// Reporting category for this error.
    pub fn kind(&self) -> FailureKind {
        match self {
            HarnessError::Parse(_) => FailureKind::Parse,
            HarnessError::Threshold(_) => FailureKind::ThresholdViolation,
            HarnessError::AbnormalExit { .. } => FailureKind::AbnormalExit,
            HarnessError::Timeout { .. } => FailureKind::Timeout,
            HarnessError::ConfigGeneration { .. } => FailureKind::ConfigGeneration,
            HarnessError::Launch { .. } => FailureKind::Launch,
            HarnessError::InvalidConfig(_) => FailureKind::InvalidConfig,
            HarnessError::Io(_) => FailureKind::Io,
        }
    }
}

/// Serialisable failure category carried in scenario outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Parse,
    ThresholdViolation,
    AbnormalExit,
    Timeout,
    ConfigGeneration,
    Launch,
    InvalidConfig,
    Io,
}

/// Result type for harness operations.
pub type HarnessResult<T> = std::result::Result<T, HarnessError>;
