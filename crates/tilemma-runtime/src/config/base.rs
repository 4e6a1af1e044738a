use super::{launch::LaunchConfig, simulation::SimulationConfig};
use std::sync::Arc;

/// Static mutex holding the global configuration, initialized as `None`.
static TILEMMA_GLOBAL_CONFIG: spin::Mutex<Option<Arc<GlobalConfig>>> = spin::Mutex::new(None);

const CONFIG_FILE_NAMES: [&str; 2] = ["tilemma.toml", "Tilemma.toml"];

/// Represents the global configuration, combining the simulated device parameters and
/// launch logging.
#[derive(Default, Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct GlobalConfig {
    /// Parameters of the simulated accelerator.
    #[serde(default)]
    pub simulation: SimulationConfig,

    /// Configuration for launch logging.
    #[serde(default)]
    pub launch: LaunchConfig,
}

impl GlobalConfig {
    /// Retrieves the current global configuration, loading it if not set.
    ///
    /// If no configuration is set, it attempts to load one from `tilemma.toml` or
    /// `Tilemma.toml` in the current directory or its parents, then from the user
    /// configuration directory. If no file is found, a default configuration is used.
    /// Environment overrides are applied last.
    pub fn get() -> Arc<Self> {
        let mut state = TILEMMA_GLOBAL_CONFIG.lock();

        match state.as_ref() {
            Some(config) => config.clone(),
            None => {
                let config = Arc::new(Self::from_current_dir().override_from_env());
                *state = Some(config.clone());
                config
            }
        }
    }

    /// Save the current configuration to the provided file path.
    pub fn save_default<P: AsRef<std::path::Path>>(path: P) -> std::io::Result<()> {
        use std::io::Write;

        let config = Self::get();
        let content = toml::to_string_pretty(config.as_ref())
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        let mut file = std::fs::File::create(path)?;
        file.write_all(content.as_bytes())?;

        Ok(())
    }

    /// Sets the global configuration to the provided value.
    ///
    /// # Panics
    /// Panics if the configuration has already been set or read, as it cannot be overridden.
    ///
    /// # Warning
    /// This method must be called at the start of the program, before any calls to `get`.
    pub fn set(config: Self) {
        let mut state = TILEMMA_GLOBAL_CONFIG.lock();
        if state.is_some() {
            panic!("Cannot set the global configuration multiple times.");
        }
        *state = Some(Arc::new(config));
    }

    /// Overrides configuration fields based on environment variables.
    pub fn override_from_env(mut self) -> Self {
        use super::launch::LaunchLogLevel;

        if let Ok(val) = std::env::var("TILEMMA_DEBUG_LOG") {
            self.launch.logger.level = LaunchLogLevel::Full;

            match val.as_str() {
                "stdout" => self.launch.logger.stdout = true,
                "stderr" => self.launch.logger.stderr = true,
                "1" | "true" => {
                    self.launch.logger.file = Some(std::env::temp_dir().join("tilemma.log"));
                }
                "0" | "false" => self.launch.logger.level = LaunchLogLevel::Disabled,
                file_path => self.launch.logger.file = Some(file_path.into()),
            }
        }

        if let Some(val) = env_u64("TILEMMA_COPY_LATENCY_US") {
            self.simulation.copy_latency_us = val;
        }

        if let Some(val) = env_u64("TILEMMA_TENSOR_CORE_LATENCY_US") {
            self.simulation.tensor_core_latency_us = val;
        }

        if let Some(val) = env_u64("TILEMMA_DEADLOCK_TIMEOUT_MS") {
            self.simulation.deadlock_timeout_ms = val;
        }

        self
    }

    /// Parses a configuration from its toml representation.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    // Traverses up the directory tree until a valid configuration file is found or the root
    // is reached, then falls back to the user configuration directory.
    fn from_current_dir() -> Self {
        if let Ok(mut dir) = std::env::current_dir() {
            loop {
                for name in CONFIG_FILE_NAMES {
                    if let Some(config) = Self::from_file_path(dir.join(name)) {
                        return config;
                    }
                }

                if !dir.pop() {
                    break;
                }
            }
        }

        dirs::config_dir()
            .and_then(|dir| Self::from_file_path(dir.join("tilemma").join(CONFIG_FILE_NAMES[0])))
            .unwrap_or_default()
    }

    fn from_file_path<P: AsRef<std::path::Path>>(path: P) -> Option<Self> {
        let content = std::fs::read_to_string(path.as_ref()).ok()?;

        match Self::from_toml(&content) {
            Ok(config) => Some(config),
            Err(err) => {
                log::warn!(
                    "Ignoring {:?}, it doesn't have the right format => {err}",
                    path.as_ref()
                );
                None
            }
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    let val = std::env::var(name).ok()?;

    match val.parse() {
        Ok(val) => Some(val),
        Err(_) => {
            log::warn!("Ignoring {name}={val}, expected an unsigned integer");
            None
        }
    }
}
