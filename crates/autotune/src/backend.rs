//! Collaborators the search drives: a kernel builder and a profiling launcher.

use anyhow::Result;
use convtune_kernels::{ConvProblem, KernelArgs, KernelSolution, LaunchGeometry};

/// A device able to build and time 3x3 WrW candidates.
///
/// Calls are strictly sequential: the tuner waits for each launch to finish
/// before compiling the next candidate so timings are not skewed.
pub trait TuningBackend {
    /// Device-side input, weight-gradient and output-gradient buffers.
    type Buffers;
    /// A compiled, launchable candidate.
    type Kernel;

    fn name(&self) -> &str;

    /// Toggle kernel timing for the duration of a search.
    fn enable_profiling(&mut self, enabled: bool);

    /// Allocate buffers sized for `problem`, inputs filled from `seed`.
    fn allocate(&mut self, problem: &ConvProblem, seed: u64) -> Result<Self::Buffers>;

    fn compile(&mut self, problem: &ConvProblem, solution: &KernelSolution) -> Result<Self::Kernel>;

    /// Run `kernel` once and return the elapsed device time in milliseconds.
    fn launch(
        &mut self,
        kernel: &Self::Kernel,
        buffers: &mut Self::Buffers,
        args: &KernelArgs,
        geometry: &LaunchGeometry,
    ) -> Result<f64>;
}
