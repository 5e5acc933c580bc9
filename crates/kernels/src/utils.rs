//! Shared helpers for kernel implementations.

use crate::config::ConvProblem;
use anyhow::{bail, Result};
use ndarray::ArrayView4;

pub fn validate_wrw_buffers(
    problem: &ConvProblem,
    image: &ArrayView4<'_, f32>,
    grad_output: &ArrayView4<'_, f32>,
) -> Result<()> {
    if image.shape() != problem.image_shape() {
        bail!(
            "image shape {:?} does not match problem {:?}",
            image.shape(),
            problem.image_shape()
        );
    }
    if grad_output.shape() != problem.grad_output_shape() {
        bail!(
            "output gradient shape {:?} does not match problem {:?}",
            grad_output.shape(),
            problem.grad_output_shape()
        );
    }
    Ok(())
}

/// Clamp `[start, start + len)` to `[0, limit)`.
pub fn clamped_span(start: usize, len: usize, limit: usize) -> std::ops::Range<usize> {
    start.min(limit)..(start + len).min(limit)
}
