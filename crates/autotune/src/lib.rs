//! Search driver for the 3x3 backward-weights kernel: legal-space
//! enumeration, empirical timing through a pluggable backend, progress
//! telemetry and a persisted result cache.

pub mod backend;
pub mod cache;
pub mod error;
pub mod heartbeat;
pub mod space;
pub mod tuner;

pub use backend::*;
pub use cache::*;
pub use error::*;
pub use heartbeat::*;
pub use space::*;
pub use tuner::*;
