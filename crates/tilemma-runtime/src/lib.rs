#![warn(missing_docs)]

//! Host runtime of the tilemma accelerator simulator.
//!
//! The runtime owns global memory, validates and queues kernel launches, executes each
//! launched block with one OS thread per unit and reports faults the way a device driver
//! would: launch errors synchronously, execution faults on the next synchronizing call.

#[macro_use]
extern crate derive_new;

mod id;

/// Compute channel module.
pub mod channel;
/// Compute client module.
pub mod client;
/// Runtime configuration.
pub mod config;
/// Kernel trait, launch geometry and block execution.
pub mod kernel;
/// Launch logging.
pub mod logging;
/// Compute server and error taxonomy.
pub mod server;
/// Global memory storage.
pub mod storage;
/// Block-level synchronization shared by every unit of a cube.
pub mod sync;
/// TMA-related runtime types
pub mod tma;

pub use id::StorageId;
