//! Problem description, tunable parameters and host reference for the
//! 3x3 backward-weights convolution kernel.

pub mod config;
pub mod error;
pub mod limits;
pub mod perf_config;
pub mod reference;
pub mod resource;
pub mod solver;
pub mod utils;

pub use config::*;
pub use error::*;
pub use limits::*;
pub use perf_config::*;
pub use resource::*;
pub use solver::*;
