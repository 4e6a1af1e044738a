use core::time::Duration;

/// Parameters of the simulated accelerator.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct SimulationConfig {
    /// Delay, in microseconds, the copy engine waits before completing each transfer.
    ///
    /// Used to widen the window in which a waiter could observe an incomplete phase.
    #[serde(default)]
    pub copy_latency_us: u64,

    /// Delay, in microseconds, the tensor core waits before retiring each batch.
    #[serde(default)]
    pub tensor_core_latency_us: u64,

    /// Time a unit may stay blocked before the block is declared deadlocked.
    #[serde(default = "deadlock_timeout_default")]
    pub deadlock_timeout_ms: u64,

    /// Shared memory available to one cube, in bytes.
    #[serde(default = "max_shared_memory_default")]
    pub max_shared_memory: usize,

    /// Maximum number of units in one cube.
    #[serde(default = "max_units_default")]
    pub max_units_per_cube: u32,
}

impl SimulationConfig {
    /// Copy engine latency as a [Duration].
    pub fn copy_latency(&self) -> Duration {
        Duration::from_micros(self.copy_latency_us)
    }

    /// Tensor core latency as a [Duration].
    pub fn tensor_core_latency(&self) -> Duration {
        Duration::from_micros(self.tensor_core_latency_us)
    }

    /// Deadlock watchdog as a [Duration].
    pub fn deadlock_timeout(&self) -> Duration {
        Duration::from_millis(self.deadlock_timeout_ms)
    }

    /// Returns the same config with the given copy latency.
    pub fn with_copy_latency(mut self, latency: Duration) -> Self {
        self.copy_latency_us = latency.as_micros() as u64;
        self
    }

    /// Returns the same config with the given deadlock watchdog.
    pub fn with_deadlock_timeout(mut self, timeout: Duration) -> Self {
        self.deadlock_timeout_ms = timeout.as_millis() as u64;
        self
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            copy_latency_us: 0,
            tensor_core_latency_us: 0,
            deadlock_timeout_ms: deadlock_timeout_default(),
            max_shared_memory: max_shared_memory_default(),
            max_units_per_cube: max_units_default(),
        }
    }
}

fn deadlock_timeout_default() -> u64 {
    10_000
}

// 227 KiB of dynamic shared memory per block.
fn max_shared_memory_default() -> usize {
    232_448
}

fn max_units_default() -> u32 {
    1024
}
