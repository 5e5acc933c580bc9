//! Tuning sessions, evaluation suite and command-line front end.

#[cfg(feature = "cli")]
pub mod cli;
pub mod eval;
pub mod session;

#[cfg(feature = "cli")]
pub use cli::*;
pub use eval::*;
pub use session::*;
