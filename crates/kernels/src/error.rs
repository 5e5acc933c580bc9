//! Errors raised before any device work happens.

use crate::perf_config::{ConfigViolation, ParseConfigError};
use thiserror::Error;

/// Why the 3x3 WrW solver cannot handle a problem.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProblemError {
    #[error("assembler is not available on {device}")]
    NoAssembler { device: String },
    #[error("device {device} is not a gfx8/gfx9 part")]
    UnsupportedDevice { device: String },
    #[error("unsupported convolution shape: {0}")]
    UnsupportedShape(&'static str),
    #[error("{quantity} = {value} must be below {limit}")]
    LimitExceeded {
        quantity: &'static str,
        value: u64,
        limit: u64,
    },
}

/// A supplied perf-values string that cannot be used for the problem.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OverrideError {
    #[error("bad format {value:?}: {source}")]
    Malformed {
        value: String,
        source: ParseConfigError,
    },
    #[error("{value:?} is out of range or invalid for the problem: {source}")]
    Invalid {
        value: String,
        source: ConfigViolation,
    },
}
