/// Launch logging config module.
pub mod launch;
/// Simulation config module.
pub mod simulation;

mod base;
mod logger;

pub use base::*;
pub use logger::{LogCrateLevel, LogLevel, Logger, LoggerConfig};
