use crate::ExecutionFault;
use std::sync::{Arc, Mutex};
use tilemma_runtime::sync::lock;

/// Accumulator registers of one unit.
///
/// The tensor core updates them asynchronously. They can only be read once no batch touching
/// them is in flight and the unit fenced after waiting.
#[derive(Clone, Debug)]
pub struct Accumulator {
    state: Arc<Mutex<AccumulatorState>>,
}

#[derive(Debug)]
struct AccumulatorState {
    registers: Vec<u32>,
    in_flight: u32,
    fenced: bool,
}

impl Accumulator {
    /// Zero initialized accumulator of `registers` 32-bit registers.
    pub fn zeroed(registers: usize) -> Self {
        Self::from_registers(vec![0; registers])
    }

    /// Accumulator holding `registers`.
    pub fn from_registers(registers: Vec<u32>) -> Self {
        Self {
            state: Arc::new(Mutex::new(AccumulatorState {
                registers,
                in_flight: 0,
                fenced: true,
            })),
        }
    }

    /// Number of registers.
    pub fn len(&self) -> usize {
        lock(&self.state).registers.len()
    }

    /// Whether the accumulator has no register.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read the registers.
    pub fn read(&self) -> Result<Vec<u32>, ExecutionFault> {
        let state = lock(&self.state);

        if state.in_flight > 0 {
            return Err(ExecutionFault::protocol(format!(
                "accumulator read while {} MMA(s) writing it are in flight",
                state.in_flight
            )));
        }
        if !state.fenced {
            return Err(ExecutionFault::protocol(
                "accumulator read before the warpgroup fence following wait_batch",
            ));
        }

        Ok(state.registers.clone())
    }

    pub(crate) fn issue(&self) {
        let mut state = lock(&self.state);
        state.in_flight += 1;
        state.fenced = false;
    }

    pub(crate) fn registers(&self) -> Vec<u32> {
        lock(&self.state).registers.clone()
    }

    pub(crate) fn retire(&self, registers: Vec<u32>) {
        let mut state = lock(&self.state);
        state.registers = registers;
        state.in_flight = state.in_flight.saturating_sub(1);
    }

    /// Fence the accumulator, returning whether it is now readable.
    pub(crate) fn fence(&self) -> bool {
        let mut state = lock(&self.state);
        if state.in_flight == 0 {
            state.fenced = true;
        }
        state.fenced
    }

    pub(crate) fn same(&self, other: &Accumulator) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}
