use crate::{
    channel::MpscComputeChannel,
    config::{GlobalConfig, simulation::SimulationConfig},
    kernel::{CubeCount, CubeKernel},
    server::{Bindings, ComputeServer, DeviceProperties, LaunchError, ServerError},
    storage::{Binding, Handle},
};
use bytemuck::Pod;
use std::sync::Arc;

/// The ComputeClient is the entry point to require tasks from the ComputeServer.
///
/// Every operation is ordered on the server thread. Kernel launches return as soon as they
/// are validated; faults are reported by the next [sync](Self::sync) or read.
#[derive(Debug, Clone)]
pub struct ComputeClient {
    channel: MpscComputeChannel,
    properties: Arc<DeviceProperties>,
}

impl Default for ComputeClient {
    fn default() -> Self {
        Self::new(GlobalConfig::get())
    }
}

impl ComputeClient {
    /// Create a new client with a new server.
    pub fn new(config: Arc<GlobalConfig>) -> Self {
        let channel = MpscComputeChannel::new(ComputeServer::new(config));
        let properties = Arc::new(channel.properties());

        Self {
            channel,
            properties,
        }
    }

    /// Create a client with explicit device parameters, keeping the global launch logging.
    pub fn simulated(simulation: SimulationConfig) -> Self {
        let mut config = GlobalConfig::get().as_ref().clone();
        config.simulation = simulation;
        Self::new(Arc::new(config))
    }

    /// Properties of the simulated device.
    pub fn properties(&self) -> &DeviceProperties {
        &self.properties
    }

    /// Given a resource handle, returns the storage data as bytes.
    pub fn read_one(&self, binding: Binding) -> Result<Vec<u8>, ServerError> {
        let mut data = self.channel.read(vec![binding])?;
        Ok(data.remove(0))
    }

    /// Given bindings, returns the owned resources as bytes.
    pub fn read(&self, bindings: Vec<Binding>) -> Result<Vec<Vec<u8>>, ServerError> {
        self.channel.read(bindings)
    }

    /// Given a resource, stores it and returns the resource handle.
    pub fn create(&self, data: &[u8]) -> Handle {
        self.channel.create(data)
    }

    /// Stores a typed slice and returns the resource handle.
    pub fn create_from_slice<T: Pod>(&self, data: &[T]) -> Handle {
        self.channel.create(bytemuck::cast_slice(data))
    }

    /// Reserves `size` bytes in the storage, and returns a handle over them.
    pub fn empty(&self, size: usize) -> Handle {
        self.channel.empty(size)
    }

    /// Validates and queues `kernel` for execution.
    ///
    /// Resource limits, the cube count and every binding are checked before this returns.
    pub fn launch<K: CubeKernel>(
        &self,
        kernel: K,
        count: CubeCount,
        bindings: Bindings,
    ) -> Result<(), LaunchError> {
        self.channel.launch(Box::new(kernel), count, bindings)
    }

    /// Wait for the completion of every task, returning the first fault recorded since the
    /// last synchronization.
    pub fn sync(&self) -> Result<(), ServerError> {
        self.channel.sync()
    }
}
