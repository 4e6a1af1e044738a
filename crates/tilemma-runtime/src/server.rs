use crate::{
    config::{GlobalConfig, simulation::SimulationConfig},
    kernel::{CubeCount, KernelResources, KernelTask},
    logging::ServerLogger,
    storage::{Binding, BytesStorage, Handle},
    tma::{TensorMap, TensorMapBinding, TensorMapError},
};
use std::sync::Arc;
use thiserror::Error;
use tilemma_common::backtrace::BackTrace;

/// Memory space addressed by a faulting access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemorySpace {
    /// Device global memory.
    Global,
    /// Block-local scratch (shared) memory.
    Shared,
}

impl core::fmt::Display for MemorySpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MemorySpace::Global => f.write_str("global"),
            MemorySpace::Shared => f.write_str("shared"),
        }
    }
}

/// A fault raised while a block executes.
///
/// Faults never reach the host directly: the block is aborted and the fault is recorded by
/// the server, to be returned by the next synchronizing call as a [ServerError].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionFault {
    /// Access outside of an allocation.
    #[error("illegal {space} memory access: {size} bytes at offset {offset}, bound is {bound}")]
    IllegalAddress {
        /// Memory space of the access.
        space: MemorySpace,
        /// Byte offset of the access.
        offset: u64,
        /// Size of the access in bytes.
        size: u64,
        /// Size of the addressed allocation.
        bound: u64,
    },

    /// Address that doesn't satisfy the alignment an operation requires.
    #[error("misaligned {what}: address {address} requires {alignment}-byte alignment")]
    MisalignedAddress {
        /// What was being addressed.
        what: &'static str,
        /// The faulting address.
        address: u64,
        /// The required alignment.
        alignment: u64,
    },

    /// Arrival barrier used outside of its contract.
    #[error("barrier misuse: {reason}")]
    BarrierMisuse {
        /// Details of the misuse.
        reason: String,
    },

    /// An ordering rule of the copy or compute pipeline was broken.
    #[error("pipeline protocol violation: {reason}")]
    ProtocolViolation {
        /// Details of the violation.
        reason: String,
    },

    /// Units of a warpgroup issued different instructions at the same point.
    #[error("warpgroup diverged at instruction {sequence} of batch {batch}")]
    DivergentWarpgroup {
        /// Index of the batch.
        batch: u64,
        /// Index of the instruction inside the batch.
        sequence: usize,
    },

    /// A unit stayed blocked longer than the configured watchdog.
    #[error("block deadlocked while waiting on {waiting_on} for more than {timeout_ms} ms")]
    Deadlock {
        /// The primitive being waited on.
        waiting_on: &'static str,
        /// The watchdog value.
        timeout_ms: u64,
    },

    /// A unit hit a trap (a panic inside the kernel body).
    #[error("unit trapped: {reason}")]
    Trap {
        /// Panic payload, when printable.
        reason: String,
    },

    /// The block was aborted because another unit faulted.
    #[error("block aborted after a fault in another unit")]
    Aborted,
}

impl ExecutionFault {
    /// Shorthand for a [protocol violation](ExecutionFault::ProtocolViolation).
    pub fn protocol<S: Into<String>>(reason: S) -> Self {
        Self::ProtocolViolation {
            reason: reason.into(),
        }
    }

    /// Shorthand for a [barrier misuse](ExecutionFault::BarrierMisuse).
    pub fn barrier<S: Into<String>>(reason: S) -> Self {
        Self::BarrierMisuse {
            reason: reason.into(),
        }
    }
}

/// Kernel Launch Errors, reported synchronously by [launch](crate::client::ComputeClient::launch).
#[derive(Error, Clone)]
pub enum LaunchError {
    /// Too many resources were requested
    #[error("Too many resources were requested during launch\n{0}")]
    TooManyResources(#[from] ResourceLimitError),

    /// A binding doesn't refer to a live allocation.
    #[error("Binding {index} doesn't refer to a live allocation\nBacktrace\n{backtrace}")]
    InvalidBinding {
        /// Position of the binding.
        index: usize,
        /// The backtrace for this error.
        backtrace: BackTrace,
    },

    /// A tensor map is inconsistent with its backing allocation.
    #[error("Tensor map {index} is invalid\nCaused by:\n  {source}")]
    InvalidTensorMap {
        /// Position of the tensor map binding.
        index: usize,
        /// The validation failure.
        source: TensorMapError,
    },

    /// Unknown launch error.
    #[error(
        "An unknown error happened during launch\nCaused by:\n  {reason}\nBacktrace\n{backtrace}"
    )]
    Unknown {
        /// The caused of the unknown error.
        reason: String,
        /// The backtrace for this error.
        backtrace: BackTrace,
    },
}

/// Resource limit errors.
#[derive(Error, Clone)]
pub enum ResourceLimitError {
    /// Shared memory exceeds maximum
    #[error(
        "Too much shared memory requested.\nRequested {requested} bytes, maximum {max} bytes available.\nBacktrace\n{backtrace}"
    )]
    SharedMemory {
        /// Value requested
        requested: usize,
        /// Maximum value
        max: usize,
        /// The backtrace for this error.
        backtrace: BackTrace,
    },
    /// Total units exceeds maximum
    #[error(
        "Total unit count exceeds maximum.\nRequested {requested} units, max units is {max}.\nBacktrace\n{backtrace}"
    )]
    Units {
        /// Requested value
        requested: u32,
        /// Maximum value
        max: u32,
        /// The backtrace for this error.
        backtrace: BackTrace,
    },
    /// Only a single cube per launch is simulated.
    #[error(
        "Cube count exceeds maximum bounds.\nRequested {requested:?}, max is {max:?}.\nBacktrace\n{backtrace}"
    )]
    CubeCount {
        /// Requested value
        requested: (u32, u32, u32),
        /// Maximum value
        max: (u32, u32, u32),
        /// The backtrace for this error.
        backtrace: BackTrace,
    },
}

impl core::fmt::Debug for LaunchError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_fmt(format_args!("{self}"))
    }
}

impl core::fmt::Debug for ResourceLimitError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_fmt(format_args!("{self}"))
    }
}

/// Error that can happen asynchronously while executing registered kernels.
#[derive(Error, Debug, Clone)]
pub enum ServerError {
    /// A kernel faulted during execution.
    #[error("An execution fault happened in kernel {kernel}\nCaused by:\n  {fault}")]
    Execution {
        /// Name of the faulting kernel.
        kernel: String,
        /// The recorded fault.
        fault: ExecutionFault,
    },

    /// Handle wasn't found in storage.
    #[error("couldn't find resource for that handle\n{backtrace}")]
    InvalidHandle {
        /// The backtrace.
        backtrace: BackTrace,
    },

    /// The server is an invalid state.
    #[error("The server is in an invalid state\nCaused by:\n  {reason}")]
    ServerUnhealthy {
        /// The details of the failure.
        reason: String,
        /// The backtrace for this error.
        backtrace: BackTrace,
    },
}

impl ServerError {
    /// The execution fault carried by this error, if any.
    pub fn fault(&self) -> Option<&ExecutionFault> {
        match self {
            ServerError::Execution { fault, .. } => Some(fault),
            _ => None,
        }
    }
}

/// Static properties of the simulated device.
#[derive(new, Clone, Debug, PartialEq, Eq)]
pub struct DeviceProperties {
    /// Shared memory available to one cube, in bytes.
    pub max_shared_memory: usize,
    /// Maximum units in one cube.
    pub max_units_per_cube: u32,
}

impl From<&SimulationConfig> for DeviceProperties {
    fn from(config: &SimulationConfig) -> Self {
        Self::new(config.max_shared_memory, config.max_units_per_cube)
    }
}

/// Buffers and tensor maps handed to a kernel launch.
#[derive(Default, Debug, Clone)]
pub struct Bindings {
    /// Plain global memory buffers.
    pub buffers: Vec<Binding>,
    /// Tile descriptors, passed by value.
    pub tensor_maps: Vec<TensorMapBinding>,
}

impl Bindings {
    /// Create an empty bindings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add buffers to the bindings.
    pub fn with_buffers(mut self, buffers: Vec<Binding>) -> Self {
        self.buffers.extend(buffers);
        self
    }

    /// Add a buffer to the bindings.
    pub fn with_buffer(mut self, buffer: Binding) -> Self {
        self.buffers.push(buffer);
        self
    }

    /// Add tensor maps to the bindings.
    pub fn with_tensor_maps(mut self, maps: Vec<TensorMapBinding>) -> Self {
        self.tensor_maps.extend(maps);
        self
    }
}

/// The compute server owns global memory and executes kernels in submission order.
///
/// Everything in the server is mutable, therefore it should be solely accessed through the
/// [`ComputeClient`](crate::client::ComputeClient) for thread safety.
#[derive(Debug)]
pub struct ComputeServer {
    storage: BytesStorage,
    errors: Vec<ServerError>,
    logger: ServerLogger,
    config: SimulationConfig,
}

impl ComputeServer {
    /// Create a server for the given configuration.
    pub fn new(config: Arc<GlobalConfig>) -> Self {
        Self {
            storage: BytesStorage::default(),
            errors: Vec::new(),
            logger: ServerLogger::new(&config),
            config: config.simulation.clone(),
        }
    }

    /// Properties of the simulated device.
    pub fn properties(&self) -> DeviceProperties {
        DeviceProperties::from(&self.config)
    }

    /// Allocate a buffer initialized with `data`.
    pub fn create(&mut self, data: &[u8]) -> Handle {
        self.storage.create(data)
    }

    /// Allocate a zeroed buffer of `size` bytes.
    pub fn empty(&mut self, size: usize) -> Handle {
        self.storage.alloc(size)
    }

    /// Read buffers back to the host.
    ///
    /// Reading is a synchronizing operation: a fault recorded by a previous kernel is
    /// returned instead of the data.
    pub fn read(&mut self, bindings: Vec<Binding>) -> Result<Vec<Vec<u8>>, ServerError> {
        self.sync()?;

        bindings
            .iter()
            .map(|binding| {
                self.storage
                    .get(binding)
                    .map(|resource| resource.to_vec())
                    .ok_or_else(|| ServerError::InvalidHandle {
                        backtrace: BackTrace::capture(),
                    })
            })
            .collect()
    }

    /// Validate a launch and resolve its bindings into kernel resources.
    pub fn prepare(
        &mut self,
        task: &dyn KernelTask,
        count: CubeCount,
        bindings: Bindings,
    ) -> Result<KernelResources, LaunchError> {
        if !count.is_single() {
            return Err(ResourceLimitError::CubeCount {
                requested: count.as_tuple(),
                max: (1, 1, 1),
                backtrace: BackTrace::capture(),
            }
            .into());
        }

        let units = task.cube_dim().num_elems();
        if units == 0 || units > self.config.max_units_per_cube {
            return Err(ResourceLimitError::Units {
                requested: units,
                max: self.config.max_units_per_cube,
                backtrace: BackTrace::capture(),
            }
            .into());
        }

        let shared_memory = task.shared_memory_size();
        if shared_memory > self.config.max_shared_memory {
            return Err(ResourceLimitError::SharedMemory {
                requested: shared_memory,
                max: self.config.max_shared_memory,
                backtrace: BackTrace::capture(),
            }
            .into());
        }

        let mut resources = KernelResources::default();

        for (index, binding) in bindings.buffers.iter().enumerate() {
            let resource = self
                .storage
                .get(binding)
                .ok_or_else(|| LaunchError::InvalidBinding {
                    index,
                    backtrace: BackTrace::capture(),
                })?;
            resources.buffers.push(resource);
        }

        for (index, map) in bindings.tensor_maps.into_iter().enumerate() {
            let resource =
                self.storage
                    .get(&map.binding)
                    .ok_or_else(|| LaunchError::InvalidBinding {
                        index: resources.buffers.len() + index,
                        backtrace: BackTrace::capture(),
                    })?;
            let map = TensorMap::new(map.map, resource)
                .map_err(|source| LaunchError::InvalidTensorMap { index, source })?;
            resources.tensor_maps.push(map);
        }

        Ok(resources)
    }

    /// Execute a validated launch, recording any fault for the next synchronizing call.
    pub fn execute(&mut self, task: Box<dyn KernelTask>, resources: KernelResources) {
        let name = task.name().to_string();
        self.logger.log_launch(&name, task.cube_dim(), task.shared_memory_size());

        let start = std::time::Instant::now();
        let result = task.execute(&self.config, resources);
        self.logger.log_completion(&name, start.elapsed(), &result);

        if let Err(fault) = result {
            log::warn!("Kernel {name} faulted: {fault}");
            self.errors.push(ServerError::Execution { kernel: name, fault });
        }
    }

    /// Wait for all submitted work, returning the first recorded fault if any.
    ///
    /// Kernels execute in submission order on the server thread, so reaching this point
    /// means everything before it has retired. Recorded faults are drained.
    pub fn sync(&mut self) -> Result<(), ServerError> {
        let mut errors = core::mem::take(&mut self.errors).into_iter();

        match errors.next() {
            Some(err) => {
                let dropped = errors.count();
                if dropped > 0 {
                    log::debug!("{dropped} more execution faults were dropped");
                }
                Err(err)
            }
            None => Ok(()),
        }
    }
}
