//! Block-level synchronization shared by every unit of a running cube.

use crate::server::ExecutionFault;
use core::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use std::{
    sync::{Condvar, Mutex, MutexGuard},
    time::Instant,
};

// Waiters re-check the abort flag at least this often.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Lock a mutex, recovering the data if a trapped unit poisoned it.
///
/// A poisoned lock only means a unit panicked while holding it; the block is aborted in
/// that case and the data is never trusted again.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|err| err.into_inner())
}

/// Abort flag and deadlock watchdog of a running block.
#[derive(Debug)]
pub struct BlockSignal {
    aborted: AtomicBool,
    fault: Mutex<Option<ExecutionFault>>,
    timeout: Duration,
}

impl BlockSignal {
    /// Create a signal with the given deadlock watchdog.
    pub fn new(timeout: Duration) -> Self {
        Self {
            aborted: AtomicBool::new(false),
            fault: Mutex::new(None),
            timeout,
        }
    }

    /// Abort the block, releasing every waiter with [ExecutionFault::Aborted].
    pub fn abort(&self) {
        if !self.aborted.swap(true, Ordering::AcqRel) {
            log::warn!("Block aborted");
        }
    }

    /// Record `fault` as the cause of the abort, unless an earlier fault was recorded.
    pub fn fail(&self, fault: ExecutionFault) {
        {
            let mut first = lock(&self.fault);
            if first.is_none() && fault != ExecutionFault::Aborted {
                log::debug!("Recording block fault: {fault}");
                *first = Some(fault);
            }
        }
        self.abort();
    }

    /// The first recorded fault.
    pub fn fault(&self) -> Option<ExecutionFault> {
        lock(&self.fault).clone()
    }

    /// Whether the block was aborted.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Fail with [ExecutionFault::Aborted] when the block was aborted.
    pub fn check(&self) -> Result<(), ExecutionFault> {
        match self.is_aborted() {
            true => Err(ExecutionFault::Aborted),
            false => Ok(()),
        }
    }

    /// The deadlock watchdog.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Block on `cvar` while `condition` holds.
    ///
    /// Returns [ExecutionFault::Aborted] as soon as the block is aborted, and aborts the block
    /// with [ExecutionFault::Deadlock] once the watchdog expires.
    pub fn wait_while<'a, T>(
        &self,
        cvar: &Condvar,
        mut guard: MutexGuard<'a, T>,
        waiting_on: &'static str,
        mut condition: impl FnMut(&mut T) -> bool,
    ) -> Result<MutexGuard<'a, T>, ExecutionFault> {
        let deadline = Instant::now() + self.timeout;

        while condition(&mut guard) {
            self.check()?;

            let now = Instant::now();
            if now >= deadline {
                let fault = ExecutionFault::Deadlock {
                    waiting_on,
                    timeout_ms: self.timeout.as_millis() as u64,
                };
                self.fail(fault.clone());
                return Err(fault);
            }

            let slice = (deadline - now).min(POLL_INTERVAL);
            guard = match cvar.wait_timeout(guard, slice) {
                Ok((guard, _)) => guard,
                Err(err) => err.into_inner().0,
            };
        }

        Ok(guard)
    }
}

/// Block-wide execution barrier, the `sync_units` of a cube.
#[derive(Debug)]
pub struct CubeBarrier {
    units: usize,
    state: Mutex<CubeBarrierState>,
    cvar: Condvar,
}

#[derive(Debug, Default)]
struct CubeBarrierState {
    arrived: usize,
    generation: u64,
}

impl CubeBarrier {
    /// Create a barrier for `units` participants.
    pub fn new(units: usize) -> Self {
        Self {
            units,
            state: Mutex::new(CubeBarrierState::default()),
            cvar: Condvar::new(),
        }
    }

    /// Wait until every unit of the cube reached the barrier.
    pub fn wait(&self, signal: &BlockSignal) -> Result<(), ExecutionFault> {
        signal.check()?;

        let mut state = lock(&self.state);
        let generation = state.generation;
        state.arrived += 1;

        if state.arrived == self.units {
            state.arrived = 0;
            state.generation += 1;
            self.cvar.notify_all();
            return Ok(());
        }

        signal.wait_while(&self.cvar, state, "sync_units", |state| {
            state.generation == generation
        })?;

        Ok(())
    }
}
