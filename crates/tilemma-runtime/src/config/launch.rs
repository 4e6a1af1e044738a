use super::logger::{LogLevel, LoggerConfig};

/// Configuration for kernel launch logging.
#[derive(Default, Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct LaunchConfig {
    /// Logger configuration for launches and block completions.
    #[serde(default)]
    pub logger: LoggerConfig<LaunchLogLevel>,
}

/// Verbosity of the launch logger.
#[derive(Clone, Copy, Debug, Default, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub enum LaunchLogLevel {
    /// Nothing is logged.
    #[default]
    #[serde(rename = "disabled")]
    Disabled,

    /// Kernel name and geometry on every launch.
    #[serde(rename = "basic")]
    Basic,

    /// Launches plus block completion with elapsed time and outcome.
    #[serde(rename = "full")]
    Full,
}

impl LogLevel for LaunchLogLevel {}
