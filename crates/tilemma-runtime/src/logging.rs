use crate::{
    config::{GlobalConfig, Logger, launch::LaunchLogLevel},
    kernel::CubeDim,
    server::ExecutionFault,
};
use core::time::Duration;
use std::sync::Arc;

/// Server logger.
#[derive(Debug)]
pub struct ServerLogger {
    kind: DebugLoggerKind,
}

/// Debugging logger.
#[derive(Debug)]
enum DebugLoggerKind {
    /// Activated logger.
    Activated(Logger, LaunchLogLevel),
    /// Don't log information.
    None,
}

impl Default for ServerLogger {
    fn default() -> Self {
        Self::new(&GlobalConfig::get())
    }
}

impl ServerLogger {
    /// Create a server logger from the given configuration.
    pub fn new(config: &Arc<GlobalConfig>) -> Self {
        let logger = Logger::from_config(config);

        let kind = match logger.log_level_launch() {
            LaunchLogLevel::Disabled => DebugLoggerKind::None,
            level => DebugLoggerKind::Activated(logger, level),
        };

        Self { kind }
    }

    /// Log a kernel launch.
    pub fn log_launch(&mut self, name: &str, cube_dim: CubeDim, shared_memory: usize) {
        log::debug!("Launching {name} with cube dim {cube_dim} and {shared_memory} bytes of shared memory");

        if let DebugLoggerKind::Activated(logger, _) = &mut self.kind {
            logger.log_launch(&format!(
                "[launch] {name} cube_dim={cube_dim} shared_memory={shared_memory}"
            ));
        }
    }

    /// Log the completion of a block.
    pub fn log_completion(
        &mut self,
        name: &str,
        elapsed: Duration,
        result: &Result<(), ExecutionFault>,
    ) {
        log::debug!("Block of {name} completed in {elapsed:?}");

        if let DebugLoggerKind::Activated(logger, LaunchLogLevel::Full) = &mut self.kind {
            let outcome = match result {
                Ok(()) => "ok".to_string(),
                Err(fault) => format!("fault: {fault}"),
            };
            logger.log_launch(&format!(
                "[complete] {name} elapsed={elapsed:?} outcome={outcome}"
            ));
        }
    }

    /// Whether any launch output is configured.
    pub fn is_activated(&self) -> bool {
        matches!(self.kind, DebugLoggerKind::Activated(..))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_by_default() {
        let logger = ServerLogger::new(&Arc::new(GlobalConfig::default()));
        assert!(!logger.is_activated());
    }

    #[test]
    fn full_level_writes_launch_and_completion_to_file() {
        let path = std::env::temp_dir().join(format!("tilemma-log-{}.log", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let mut config = GlobalConfig::default();
        config.launch.logger.level = LaunchLogLevel::Full;
        config.launch.logger.file = Some(path.clone());

        let mut logger = ServerLogger::new(&Arc::new(config));
        logger.log_launch("copy", CubeDim::new_1d(128), 64);
        logger.log_completion("copy", Duration::from_millis(1), &Err(ExecutionFault::Aborted));
        drop(logger);

        let content = std::fs::read_to_string(&path).unwrap();
        let _ = std::fs::remove_file(&path);

        assert!(content.contains("[launch] copy cube_dim=(128, 1, 1) shared_memory=64"));
        assert!(content.contains("[complete] copy"));
        assert!(content.contains("block aborted"));
    }
}
