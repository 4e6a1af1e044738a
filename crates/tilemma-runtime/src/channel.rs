use crate::{
    kernel::{CubeCount, KernelTask},
    server::{Bindings, ComputeServer, DeviceProperties, LaunchError, ServerError},
    storage::{Binding, Handle},
};
use std::sync::Arc;
use tilemma_common::backtrace::BackTrace;

/// Create a channel using a multi-producer, single-consumer channel to communicate with
/// the compute server spawned on its own thread.
#[derive(Debug)]
pub struct MpscComputeChannel {
    state: Arc<MpscComputeChannelState>,
}

#[derive(Debug)]
struct MpscComputeChannelState {
    sender: async_channel::Sender<Message>,
}

type Callback<Response> = async_channel::Sender<Response>;

enum Message {
    Read(Vec<Binding>, Callback<Result<Vec<Vec<u8>>, ServerError>>),
    Create(Vec<u8>, Callback<Handle>),
    Empty(usize, Callback<Handle>),
    Launch(
        Box<dyn KernelTask>,
        CubeCount,
        Bindings,
        Callback<Result<(), LaunchError>>,
    ),
    Sync(Callback<Result<(), ServerError>>),
    Properties(Callback<DeviceProperties>),
}

impl MpscComputeChannel {
    /// Create a new mpsc compute channel.
    pub fn new(mut server: ComputeServer) -> Self {
        let (sender, receiver) = async_channel::unbounded::<Message>();

        let spawned = std::thread::Builder::new()
            .name("tilemma-server".to_string())
            .spawn(move || {
                while let Ok(message) = receiver.recv_blocking() {
                    // A dropped callback means the client gave up on the answer.
                    let _ = match message {
                        Message::Read(bindings, callback) => {
                            callback.send_blocking(server.read(bindings)).map_err(drop)
                        }
                        Message::Create(data, callback) => {
                            callback.send_blocking(server.create(&data)).map_err(drop)
                        }
                        Message::Empty(size, callback) => {
                            callback.send_blocking(server.empty(size)).map_err(drop)
                        }
                        Message::Launch(task, count, bindings, callback) => {
                            match server.prepare(task.as_ref(), count, bindings) {
                                Ok(resources) => {
                                    let _ = callback.send_blocking(Ok(()));
                                    server.execute(task, resources);
                                    Ok(())
                                }
                                Err(err) => callback.send_blocking(Err(err)).map_err(drop),
                            }
                        }
                        Message::Sync(callback) => {
                            callback.send_blocking(server.sync()).map_err(drop)
                        }
                        Message::Properties(callback) => {
                            callback.send_blocking(server.properties()).map_err(drop)
                        }
                    };
                }

                log::debug!("Compute server stopped, every client was dropped");
            });

        if let Err(err) = spawned {
            log::error!("Unable to spawn the compute server: {err}");
        }

        Self {
            state: Arc::new(MpscComputeChannelState { sender }),
        }
    }

    /// Read buffers back to the host, synchronizing with previously launched kernels.
    pub fn read(&self, bindings: Vec<Binding>) -> Result<Vec<Vec<u8>>, ServerError> {
        let (callback, response) = async_channel::unbounded();
        self.send(Message::Read(bindings, callback))?;
        self.receive(response)?
    }

    /// Allocate a buffer initialized with `data`.
    pub fn create(&self, data: &[u8]) -> Handle {
        let (callback, response) = async_channel::unbounded();

        handle_response(self.state.sender.send_blocking(Message::Create(data.to_vec(), callback)));

        handle_response(response.recv_blocking())
    }

    /// Allocate a zeroed buffer.
    pub fn empty(&self, size: usize) -> Handle {
        let (callback, response) = async_channel::unbounded();

        handle_response(self.state.sender.send_blocking(Message::Empty(size, callback)));

        handle_response(response.recv_blocking())
    }

    /// Validate and queue a kernel.
    pub fn launch(
        &self,
        task: Box<dyn KernelTask>,
        count: CubeCount,
        bindings: Bindings,
    ) -> Result<(), LaunchError> {
        let (callback, response) = async_channel::unbounded();

        self.state
            .sender
            .send_blocking(Message::Launch(task, count, bindings, callback))
            .map_err(|err| LaunchError::Unknown {
                reason: format!("compute server is gone: {err}"),
                backtrace: BackTrace::capture(),
            })?;

        response
            .recv_blocking()
            .map_err(|err| LaunchError::Unknown {
                reason: format!("compute server dropped the launch: {err}"),
                backtrace: BackTrace::capture(),
            })?
    }

    /// Wait for every queued kernel, returning the first recorded fault.
    pub fn sync(&self) -> Result<(), ServerError> {
        let (callback, response) = async_channel::unbounded();
        self.send(Message::Sync(callback))?;
        self.receive(response)?
    }

    /// Properties of the simulated device.
    pub fn properties(&self) -> DeviceProperties {
        let (callback, response) = async_channel::unbounded();

        handle_response(self.state.sender.send_blocking(Message::Properties(callback)));

        handle_response(response.recv_blocking())
    }

    fn send(&self, message: Message) -> Result<(), ServerError> {
        self.state
            .sender
            .send_blocking(message)
            .map_err(|_| ServerError::ServerUnhealthy {
                reason: "compute server is gone".to_string(),
                backtrace: BackTrace::capture(),
            })
    }

    fn receive<T>(&self, response: async_channel::Receiver<T>) -> Result<T, ServerError> {
        response
            .recv_blocking()
            .map_err(|err| ServerError::ServerUnhealthy {
                reason: format!("compute server didn't answer: {err}"),
                backtrace: BackTrace::capture(),
            })
    }
}

impl Clone for MpscComputeChannel {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

fn handle_response<Response, Err: core::fmt::Debug>(response: Result<Response, Err>) -> Response {
    match response {
        Ok(val) => val,
        Err(err) => panic!("Can't connect to the server correctly {err:?}"),
    }
}
