//! Host backend for tuning the 3x3 WrW kernel: buffer allocation, candidate
//! "compilation" and timed launches of the reference implementation.

pub mod device;
pub mod planner;
pub mod runtime;

pub use device::*;
pub use planner::*;
pub use runtime::*;
