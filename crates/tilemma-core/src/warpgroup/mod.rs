//! Warpgroup matrix multiply-accumulate.
//!
//! A compute sequence is `group_arrive`, one or more MMA issues, `commit_batch`,
//! `wait_batch`, then `fence` before the accumulators are read. Each of the 128 units of the
//! warpgroup runs the sequence on its own [WarpgroupUnit]; the batch executes on the tensor
//! core once every unit committed it.

mod accumulator;
mod instruction;
/// Execution of MMAs against shared memory.
pub mod tensor_core;

pub use accumulator::Accumulator;
pub use instruction::{Mma, MmaKind, MmaShape};

use crate::{
    ExecutionFault, UnitPos, WARPGROUP_SIZE, fragment::registers_per_unit,
    shared_memory::SharedMemory,
};
use core::time::Duration;
use hashbrown::{HashMap, HashSet};
use std::{
    sync::{Arc, Condvar, Mutex},
    thread::JoinHandle,
};
use tilemma_runtime::{
    kernel::BlockContext,
    sync::{BlockSignal, lock},
};

/// Tensor core pipeline shared by the units of a warpgroup.
#[derive(Debug)]
pub struct Warpgroup {
    pipeline: Arc<Pipeline>,
    sender: async_channel::Sender<Batch>,
    worker: Mutex<Option<JoinHandle<()>>>,
    signal: Arc<BlockSignal>,
}

#[derive(Debug, Default)]
struct Pipeline {
    state: Mutex<PipelineState>,
    cvar: Condvar,
}

#[derive(Debug, Default)]
struct PipelineState {
    open: HashMap<u64, OpenBatch>,
    dispatched: u64,
    completed: u64,
    // Units whose accumulators were written since their last effective fence.
    unfenced: HashSet<u32>,
}

#[derive(Debug, Default)]
struct OpenBatch {
    instructions: Vec<IssuedMma>,
    committed: u32,
}

#[derive(Debug)]
struct IssuedMma {
    mma: Mma,
    accumulators: Vec<Option<Accumulator>>,
    metadata: Vec<u32>,
}

#[derive(Debug)]
struct Batch {
    index: u64,
    instructions: Vec<(Mma, Vec<Accumulator>, Vec<u32>)>,
}

impl Warpgroup {
    /// Start the tensor core of the block owning `ctx`.
    pub fn start(ctx: &BlockContext, smem: Arc<SharedMemory>) -> Result<Self, ExecutionFault> {
        let (sender, receiver) = async_channel::unbounded::<Batch>();
        let pipeline = Arc::new(Pipeline::default());
        let worker = TensorCoreWorker {
            smem,
            pipeline: pipeline.clone(),
            signal: ctx.signal().clone(),
            latency: ctx.config().tensor_core_latency(),
        };

        let handle = std::thread::Builder::new()
            .name("tilemma-tensor-core".to_string())
            .spawn(move || {
                while let Ok(batch) = receiver.recv_blocking() {
                    worker.execute(batch);
                }
            })
            .map_err(|err| ExecutionFault::Trap {
                reason: format!("unable to start the tensor core: {err}"),
            })?;

        Ok(Self {
            pipeline,
            sender,
            worker: Mutex::new(Some(handle)),
            signal: ctx.signal().clone(),
        })
    }

    /// Handle used by `unit` to take part in the warpgroup.
    pub fn unit(&self, unit: UnitPos) -> Result<WarpgroupUnit<'_>, ExecutionFault> {
        if unit.unit >= WARPGROUP_SIZE {
            return Err(ExecutionFault::Trap {
                reason: format!("unit {} is outside the warpgroup", unit.unit),
            });
        }

        Ok(WarpgroupUnit {
            warpgroup: self,
            unit,
            arrived: false,
            batch: 0,
            sequence: 0,
            touched: Vec::new(),
        })
    }

    /// Drain the tensor core and check that every batch was committed, executed and fenced.
    pub fn finish(&self) -> Result<(), ExecutionFault> {
        self.stop();

        let state = lock(&self.pipeline.state);
        if !state.open.is_empty() {
            return Err(ExecutionFault::protocol(format!(
                "{} MMA batch(es) never committed by the whole warpgroup",
                state.open.len()
            )));
        }
        if state.completed < state.dispatched {
            return Err(ExecutionFault::protocol(format!(
                "{} MMA batch(es) never executed",
                state.dispatched - state.completed
            )));
        }
        if !state.unfenced.is_empty() {
            return Err(ExecutionFault::protocol(format!(
                "{} unit(s) exited without fencing their accumulators",
                state.unfenced.len()
            )));
        }

        Ok(())
    }

    fn stop(&self) {
        self.sender.close();
        if let Some(handle) = lock(&self.worker).take() {
            if handle.join().is_err() {
                self.signal.fail(ExecutionFault::Trap {
                    reason: "tensor core panicked".to_string(),
                });
            }
        }
    }
}

impl Drop for Warpgroup {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Warpgroup MMA state of one unit.
#[derive(Debug)]
pub struct WarpgroupUnit<'a> {
    warpgroup: &'a Warpgroup,
    unit: UnitPos,
    arrived: bool,
    batch: u64,
    sequence: usize,
    touched: Vec<Accumulator>,
}

impl WarpgroupUnit<'_> {
    /// Mark the start of a batch. Required before the first MMA of every batch.
    pub fn group_arrive(&mut self) {
        self.arrived = true;
    }

    /// Issue a dense MMA into `acc`.
    pub fn mma(&mut self, acc: &Accumulator, mma: Mma) -> Result<(), ExecutionFault> {
        match mma.kind {
            MmaKind::Dense => self.issue(acc, mma, 0),
            MmaKind::Sparse { .. } => Err(ExecutionFault::protocol(
                "sparse MMA issued without its sparsity metadata",
            )),
        }
    }

    /// Issue a sparse MMA into `acc` with this unit's sparsity metadata register.
    pub fn mma_sparse(
        &mut self,
        acc: &Accumulator,
        mma: Mma,
        metadata: u32,
    ) -> Result<(), ExecutionFault> {
        match mma.kind {
            MmaKind::Sparse { .. } => self.issue(acc, mma, metadata),
            MmaKind::Dense => Err(ExecutionFault::protocol(
                "dense MMA issued with sparsity metadata",
            )),
        }
    }

    /// Close the batch of MMAs issued since the last commit.
    pub fn commit_batch(&mut self) -> Result<(), ExecutionFault> {
        let pipeline = &self.warpgroup.pipeline;
        let mut state = lock(&pipeline.state);

        let open = state.open.entry(self.batch).or_default();
        open.committed += 1;

        if open.committed == WARPGROUP_SIZE {
            let open = state.open.remove(&self.batch).unwrap_or_default();
            let batch = self.seal(open)?;

            state.dispatched += 1;
            log::trace!(
                "Dispatching MMA batch {} of {} instruction(s)",
                batch.index,
                batch.instructions.len()
            );
            // Sent under the lock so batches reach the tensor core in commit order.
            self.warpgroup.sender.try_send(batch).map_err(|_| {
                ExecutionFault::protocol("batch committed after the tensor core stopped")
            })?;
        }

        self.batch += 1;
        self.sequence = 0;
        self.arrived = false;

        Ok(())
    }

    /// Wait until at most `pending` batches committed by this unit are still executing.
    pub fn wait_batch(&mut self, pending: u64) -> Result<(), ExecutionFault> {
        let target = self.batch.saturating_sub(pending);
        let pipeline = &self.warpgroup.pipeline;
        let state = lock(&pipeline.state);

        self.warpgroup.signal.wait_while(
            &pipeline.cvar,
            state,
            "warpgroup batch",
            |state| state.completed < target,
        )?;

        Ok(())
    }

    /// Order the accumulator writes of retired batches before the following reads.
    ///
    /// Accumulators still written by an executing batch stay unreadable.
    pub fn fence(&mut self) {
        let fenced = self.touched.iter().all(Accumulator::fence);

        if fenced {
            self.touched.clear();
            lock(&self.warpgroup.pipeline.state)
                .unfenced
                .remove(&self.unit.unit);
        }
    }

    fn issue(&mut self, acc: &Accumulator, mma: Mma, metadata: u32) -> Result<(), ExecutionFault> {
        if !self.arrived {
            return Err(ExecutionFault::protocol(
                "MMA issued without group_arrive in the current batch",
            ));
        }
        mma.validate()?;

        let expected = registers_per_unit(mma.shape.n);
        if acc.len() != expected {
            return Err(ExecutionFault::protocol(format!(
                "accumulator of {} registers used by an n{} MMA, expected {expected}",
                acc.len(),
                mma.shape.n
            )));
        }

        let mut state = lock(&self.warpgroup.pipeline.state);
        let open = state.open.entry(self.batch).or_default();

        if self.sequence == open.instructions.len() {
            open.instructions.push(IssuedMma {
                mma,
                accumulators: vec![None; WARPGROUP_SIZE as usize],
                metadata: vec![0; WARPGROUP_SIZE as usize],
            });
        }

        let issued = &mut open.instructions[self.sequence];
        if issued.mma != mma {
            return Err(self.divergent());
        }
        issued.accumulators[self.unit.unit as usize] = Some(acc.clone());
        issued.metadata[self.unit.unit as usize] = metadata;

        state.unfenced.insert(self.unit.unit);
        drop(state);

        acc.issue();
        if !self.touched.iter().any(|touched| touched.same(acc)) {
            self.touched.push(acc.clone());
        }
        self.sequence += 1;

        Ok(())
    }

    // Check that every unit issued every instruction of the batch.
    fn seal(&self, open: OpenBatch) -> Result<Batch, ExecutionFault> {
        let mut instructions = Vec::with_capacity(open.instructions.len());

        for (sequence, issued) in open.instructions.into_iter().enumerate() {
            let accumulators = issued
                .accumulators
                .into_iter()
                .collect::<Option<Vec<_>>>()
                .ok_or(ExecutionFault::DivergentWarpgroup {
                    batch: self.batch,
                    sequence,
                })?;
            instructions.push((issued.mma, accumulators, issued.metadata));
        }

        Ok(Batch {
            index: self.batch,
            instructions,
        })
    }

    fn divergent(&self) -> ExecutionFault {
        ExecutionFault::DivergentWarpgroup {
            batch: self.batch,
            sequence: self.sequence,
        }
    }
}

struct TensorCoreWorker {
    smem: Arc<SharedMemory>,
    pipeline: Arc<Pipeline>,
    signal: Arc<BlockSignal>,
    latency: Duration,
}

impl TensorCoreWorker {
    fn execute(&self, batch: Batch) {
        if self.signal.is_aborted() {
            return;
        }
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }

        let result = batch
            .instructions
            .iter()
            .try_for_each(|(mma, accumulators, metadata)| {
                tensor_core::execute_for_warpgroup(&self.smem, mma, accumulators, metadata)
            });

        match result {
            Ok(()) => {
                let mut state = lock(&self.pipeline.state);
                state.completed += 1;
                log::trace!("MMA batch {} retired", batch.index);
                self.pipeline.cvar.notify_all();
            }
            Err(fault) => {
                log::debug!("Tensor core fault in batch {}: {fault}", batch.index);
                self.signal.fail(fault);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{descriptor::MatrixDescriptor, fragment::unpack_halves, swizzle::SwizzleMode};
    use half::f16;
    use tilemma_runtime::{config::simulation::SimulationConfig, kernel::CubeDim};

    fn context(timeout: Duration) -> BlockContext {
        BlockContext::new(
            CubeDim::new_1d(WARPGROUP_SIZE),
            SimulationConfig::default().with_deadlock_timeout(timeout),
        )
    }

    // A and B of ones, n16.
    fn ones() -> Arc<SharedMemory> {
        let smem = SharedMemory::new(2560);
        let one = f16::ONE.to_le_bytes();
        for address in (0..2560).step_by(2) {
            smem.write_async(address, &one).unwrap();
        }
        Arc::new(smem)
    }

    fn mma() -> Mma {
        Mma::dense(
            MmaShape::dense(16),
            MatrixDescriptor::build(0, 0, 256, SwizzleMode::B32),
            MatrixDescriptor::build(2048, 0, 256, SwizzleMode::B32),
        )
        .transpose_b()
    }

    fn run_units(
        warpgroup: &Warpgroup,
        body: impl Fn(&mut WarpgroupUnit<'_>) -> Result<(), ExecutionFault> + Sync,
    ) -> Vec<Result<(), ExecutionFault>> {
        std::thread::scope(|scope| {
            let handles = (0..WARPGROUP_SIZE)
                .map(|unit| {
                    let body = &body;
                    scope.spawn(move || {
                        let mut unit = warpgroup.unit(UnitPos::new(unit))?;
                        let result = body(&mut unit);
                        if let Err(fault) = &result {
                            warpgroup.signal.fail(fault.clone());
                        }
                        result
                    })
                })
                .collect::<Vec<_>>();

            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect()
        })
    }

    #[test_log::test]
    fn full_sequence_accumulates_every_batch() {
        let ctx = context(Duration::from_secs(10));
        let warpgroup = Warpgroup::start(&ctx, ones()).unwrap();

        let results = run_units(&warpgroup, |unit| {
            let acc = Accumulator::zeroed(4);
            for _ in 0..2 {
                unit.group_arrive();
                unit.mma(&acc, mma())?;
                unit.commit_batch()?;
            }
            unit.wait_batch(0)?;
            unit.fence();

            for register in acc.read()? {
                assert_eq!(unpack_halves(register), (f16::from_f32(32.0), f16::from_f32(32.0)));
            }
            Ok(())
        });

        assert!(results.iter().all(Result::is_ok), "{results:?}");
        warpgroup.finish().unwrap();
    }

    #[test]
    fn reading_before_the_fence_is_a_violation() {
        let ctx = context(Duration::from_secs(10));
        let warpgroup = Warpgroup::start(&ctx, ones()).unwrap();

        let results = run_units(&warpgroup, |unit| {
            let acc = Accumulator::zeroed(4);
            unit.group_arrive();
            unit.mma(&acc, mma())?;
            unit.commit_batch()?;
            unit.wait_batch(0)?;
            acc.read().map(drop)
        });

        assert!(results.iter().any(|result| matches!(
            result,
            Err(ExecutionFault::ProtocolViolation { .. })
        )));
    }

    #[test]
    fn issue_without_group_arrive_is_a_violation() {
        let ctx = context(Duration::from_secs(1));
        let warpgroup = Warpgroup::start(&ctx, ones()).unwrap();
        let mut unit = warpgroup.unit(UnitPos::new(0)).unwrap();
        let acc = Accumulator::zeroed(4);

        assert_eq!(
            unit.mma(&acc, mma()),
            Err(ExecutionFault::protocol(
                "MMA issued without group_arrive in the current batch"
            ))
        );

        unit.group_arrive();
        unit.mma(&acc, mma()).unwrap();
        unit.commit_batch().unwrap();
        assert!(unit.mma(&acc, mma()).is_err());
    }

    #[test]
    fn wrong_accumulator_size_is_a_violation() {
        let ctx = context(Duration::from_secs(1));
        let warpgroup = Warpgroup::start(&ctx, ones()).unwrap();
        let mut unit = warpgroup.unit(UnitPos::new(0)).unwrap();

        unit.group_arrive();
        assert!(matches!(
            unit.mma(&Accumulator::zeroed(2), mma()),
            Err(ExecutionFault::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn units_issuing_different_instructions_diverge() {
        let ctx = context(Duration::from_secs(10));
        let warpgroup = Warpgroup::start(&ctx, ones()).unwrap();

        let results = run_units(&warpgroup, |unit| {
            let acc = Accumulator::zeroed(4);
            let mma = match unit.unit.unit {
                77 => mma().negate_a(),
                _ => mma(),
            };
            // Unit 77 waits so the other instruction is registered first.
            if unit.unit.unit == 77 {
                std::thread::sleep(Duration::from_millis(50));
            }
            unit.group_arrive();
            unit.mma(&acc, mma)?;
            unit.commit_batch()?;
            unit.wait_batch(0)
        });

        assert_eq!(
            results[77],
            Err(ExecutionFault::DivergentWarpgroup {
                batch: 0,
                sequence: 0
            })
        );
        assert!(results.iter().all(|result| result.is_err()));
    }

    #[test]
    fn unit_skipping_an_instruction_diverges_at_commit() {
        let ctx = context(Duration::from_secs(10));
        let warpgroup = Warpgroup::start(&ctx, ones()).unwrap();

        let results = run_units(&warpgroup, |unit| {
            let acc = Accumulator::zeroed(4);
            unit.group_arrive();
            if unit.unit.unit != 5 {
                unit.mma(&acc, mma())?;
            }
            unit.commit_batch()?;
            unit.wait_batch(0)
        });

        assert!(results.iter().any(|result| matches!(
            result,
            Err(ExecutionFault::DivergentWarpgroup {
                batch: 0,
                sequence: 0
            })
        )));
        assert!(results.iter().all(|result| result.is_err()));
    }

    #[test]
    fn unfenced_exit_is_reported() {
        let ctx = context(Duration::from_secs(10));
        let warpgroup = Warpgroup::start(&ctx, ones()).unwrap();

        let results = run_units(&warpgroup, |unit| {
            let acc = Accumulator::zeroed(4);
            unit.group_arrive();
            unit.mma(&acc, mma())?;
            unit.commit_batch()?;
            unit.wait_batch(0)
        });

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(
            warpgroup.finish(),
            Err(ExecutionFault::protocol(
                "128 unit(s) exited without fencing their accumulators"
            ))
        );
    }

    #[test]
    fn uncommitted_batch_is_reported() {
        let ctx = context(Duration::from_secs(1));
        let warpgroup = Warpgroup::start(&ctx, ones()).unwrap();
        let mut unit = warpgroup.unit(UnitPos::new(3)).unwrap();

        unit.group_arrive();
        unit.mma(&Accumulator::zeroed(4), mma()).unwrap();

        assert!(matches!(
            warpgroup.finish(),
            Err(ExecutionFault::ProtocolViolation { .. })
        ));
    }
}
