//! Performance-config search for the 3x3 backward-weights convolution kernel.
//!
//! The workspace is split the same way the search is: problem and config
//! types in [`kernels`], enumeration and measurement in [`autotune`], a host
//! backend in [`backend_cpu`] and sessions plus the CLI in [`driver`].

pub use convtune_autotune as autotune;
pub use convtune_backend_cpu as backend_cpu;
pub use convtune_driver as driver;
pub use convtune_kernels as kernels;

pub use convtune_autotune::{Autotuner, ConfigSpace, SearchOutcome, TuneError, TuningBackend};
pub use convtune_kernels::{ConvAsmBwdWrW3x3, ConvProblem, PerformanceConfig};
