//! Errors surfaced by the tuner.

use convtune_kernels::{OverrideError, ProblemError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TuneError {
    #[error("problem is not applicable: {0}")]
    Inapplicable(#[from] ProblemError),
    #[error("perf-values override rejected: {0}")]
    Override(#[from] OverrideError),
    #[error("backend failure: {0:#}")]
    Backend(anyhow::Error),
}
