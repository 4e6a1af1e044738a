use crate::{ExecutionFault, Role};
use std::sync::{Arc, Condvar, Mutex};
use tilemma_runtime::sync::{BlockSignal, lock};

/// A mechanism for awaiting on asynchronous data transfers.
///
/// Each phase completes once every expected unit arrived and every expected transaction byte
/// was credited by the copy engine. Completing a phase releases its waiters and starts the
/// next one with the same expected arrival count.
#[derive(Debug)]
pub struct Barrier {
    state: Mutex<BarrierState>,
    cvar: Condvar,
    signal: Arc<BlockSignal>,
}

#[derive(Debug, Default)]
struct BarrierState {
    initialized: bool,
    phase: u64,
    expected: u32,
    pending: u32,
    // Bytes still expected. Goes negative when a transfer lands before its expectation.
    transactions: i64,
}

/// Token returned by an arrival, bound to the phase it arrived on.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a barrier token should be waited on"]
pub struct BarrierToken {
    phase: u64,
}

impl BarrierToken {
    /// Phase the arrival was counted in.
    pub fn phase(&self) -> u64 {
        self.phase
    }
}

impl Barrier {
    /// An uninitialized barrier.
    pub fn new(signal: Arc<BlockSignal>) -> Self {
        Self {
            state: Mutex::new(BarrierState::default()),
            cvar: Condvar::new(),
            signal,
        }
    }

    /// Set the number of arrivals completing each phase.
    ///
    /// Only the leader initializes, once, and the initialization must be ordered before any
    /// arrival with a block synchronization.
    pub fn init(&self, role: Role, arrival_count: u32) -> Result<(), ExecutionFault> {
        if !role.is_leader() {
            return Err(ExecutionFault::barrier("init called by a follower unit"));
        }
        if arrival_count == 0 {
            return Err(ExecutionFault::barrier("arrival count must be positive"));
        }

        let mut state = lock(&self.state);
        if state.initialized {
            return Err(ExecutionFault::barrier("barrier initialized twice"));
        }

        state.initialized = true;
        state.expected = arrival_count;
        state.pending = arrival_count;
        log::trace!("Barrier initialized for {arrival_count} arrivals");

        Ok(())
    }

    /// Arrive at the barrier, decrementing the arrival count of the current phase.
    pub fn arrive(&self) -> Result<BarrierToken, ExecutionFault> {
        self.arrive_tx(0)
    }

    /// Arrive at the barrier and declare `bytes` of transactions the copy engine will credit
    /// to the current phase.
    pub fn arrive_with_transaction(&self, bytes: u32) -> Result<BarrierToken, ExecutionFault> {
        self.arrive_tx(bytes)
    }

    /// Increment the expected transaction bytes of the current phase without arriving.
    pub fn expect_tx(&self, bytes: u32) -> Result<(), ExecutionFault> {
        let mut state = self.initialized_state("expect_tx")?;
        state.transactions += bytes as i64;
        Ok(())
    }

    /// Credit `bytes` of completed transactions to the current phase.
    pub fn complete_tx(&self, bytes: u32) -> Result<(), ExecutionFault> {
        let mut state = self.initialized_state("complete_tx")?;
        state.transactions -= bytes as i64;
        self.try_complete(&mut state);
        Ok(())
    }

    /// Block until the phase bound to `token` completed.
    ///
    /// A token from a phase that already completed returns immediately.
    pub fn wait(&self, token: BarrierToken) -> Result<(), ExecutionFault> {
        let state = lock(&self.state);
        self.signal
            .wait_while(&self.cvar, state, "arrival barrier", |state| {
                state.phase == token.phase
            })?;
        Ok(())
    }

    /// Arrive, then wait for the current phase.
    pub fn arrive_and_wait(&self) -> Result<(), ExecutionFault> {
        let token = self.arrive()?;
        self.wait(token)
    }

    /// Current phase.
    pub fn phase(&self) -> u64 {
        lock(&self.state).phase
    }

    fn arrive_tx(&self, bytes: u32) -> Result<BarrierToken, ExecutionFault> {
        let mut state = self.initialized_state("arrive")?;
        let token = BarrierToken { phase: state.phase };

        state.transactions += bytes as i64;
        state.pending -= 1;
        self.try_complete(&mut state);

        Ok(token)
    }

    fn initialized_state(
        &self,
        operation: &str,
    ) -> Result<std::sync::MutexGuard<'_, BarrierState>, ExecutionFault> {
        let state = lock(&self.state);
        match state.initialized {
            true => Ok(state),
            false => Err(ExecutionFault::barrier(format!(
                "{operation} on an uninitialized barrier"
            ))),
        }
    }

    fn try_complete(&self, state: &mut BarrierState) {
        if state.pending == 0 && state.transactions == 0 {
            log::trace!("Barrier phase {} completed", state.phase);
            state.phase += 1;
            state.pending = state.expected;
            self.cvar.notify_all();
        }
    }
}
