use crate::{
    ExecutionFault, Role, UnitPos,
    barrier::Barrier,
    shared_memory::{ScratchRegion, SharedMemory},
    swizzle::SwizzleMode,
};
use core::time::Duration;
use hashbrown::{HashMap, HashSet};
use std::{
    sync::{Arc, Condvar, Mutex},
    thread::JoinHandle,
};
use tilemma_runtime::{
    kernel::BlockContext,
    server::MemorySpace,
    sync::{BlockSignal, lock},
    tma::TensorMap,
};

/// Bulk copy engine of a block.
///
/// Copies are issued by the leader unit and executed in order by a dedicated worker,
/// concurrently with the units. Loads credit their bytes to an arrival barrier, stores are
/// grouped with [commit_group](CopyEngine::commit_group) and awaited with
/// [wait_group_read](CopyEngine::wait_group_read).
#[derive(Debug)]
pub struct CopyEngine {
    sender: async_channel::Sender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
    groups: Arc<GroupTracker>,
    smem: Arc<SharedMemory>,
    signal: Arc<BlockSignal>,
}

enum Command {
    Load {
        map: TensorMap,
        coords: Vec<i64>,
        region: ScratchRegion,
        barrier: Arc<Barrier>,
    },
    Store {
        map: TensorMap,
        coords: Vec<i64>,
        region: ScratchRegion,
        group: u64,
    },
}

impl core::fmt::Debug for Command {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Command::Load { coords, region, .. } => write!(f, "Load({coords:?} -> {region:?})"),
            Command::Store { coords, region, .. } => write!(f, "Store({region:?} -> {coords:?})"),
        }
    }
}

#[derive(Debug, Default)]
struct GroupTracker {
    state: Mutex<GroupState>,
    cvar: Condvar,
}

#[derive(Debug, Default)]
struct GroupState {
    // Index of the group collecting new stores.
    open: u64,
    // Stores issued into the open group.
    open_stores: u32,
    // Stores not yet executed, per group.
    in_flight: HashMap<u64, u32>,
    // Committed groups holding stores that no wait covered yet.
    unawaited: HashSet<u64>,
}

impl GroupState {
    fn committed_in_flight(&self) -> usize {
        self.in_flight
            .iter()
            .filter(|(group, count)| **group < self.open && **count > 0)
            .count()
    }
}

impl CopyEngine {
    /// Start the copy engine of the block owning `ctx`.
    pub fn start(ctx: &BlockContext, smem: Arc<SharedMemory>) -> Result<Self, ExecutionFault> {
        let (sender, receiver) = async_channel::unbounded::<Command>();
        let groups = Arc::new(GroupTracker::default());
        let worker = Worker {
            smem: smem.clone(),
            signal: ctx.signal().clone(),
            groups: groups.clone(),
            latency: ctx.config().copy_latency(),
        };

        let handle = std::thread::Builder::new()
            .name("tilemma-copy-engine".to_string())
            .spawn(move || {
                while let Ok(command) = receiver.recv_blocking() {
                    worker.execute(command);
                }
            })
            .map_err(|err| ExecutionFault::Trap {
                reason: format!("unable to start the copy engine: {err}"),
            })?;

        Ok(Self {
            sender,
            worker: Mutex::new(Some(handle)),
            groups,
            smem,
            signal: ctx.signal().clone(),
        })
    }

    /// Load the box at `coords` of `map` into `region` and credit its bytes to `barrier`.
    ///
    /// Returns as soon as the copy is queued. The expected bytes are declared separately,
    /// with [arrive_with_transaction](Barrier::arrive_with_transaction) or
    /// [expect_tx](Barrier::expect_tx).
    pub fn copy_in(
        &self,
        role: Role,
        map: &TensorMap,
        coords: &[i64],
        region: &ScratchRegion,
        barrier: &Arc<Barrier>,
    ) -> Result<(), ExecutionFault> {
        self.check_issue(role, "copy_in", map, coords, region)?;

        self.send(Command::Load {
            map: map.clone(),
            coords: coords.to_vec(),
            region: *region,
            barrier: barrier.clone(),
        })
    }

    /// Store `region` into the box at `coords` of `map`.
    ///
    /// Every generic write to shared memory must be fenced with
    /// [fence_proxy_async](CopyEngine::fence_proxy_async) first. The store joins the open
    /// bulk group.
    pub fn copy_out(
        &self,
        role: Role,
        map: &TensorMap,
        coords: &[i64],
        region: &ScratchRegion,
    ) -> Result<(), ExecutionFault> {
        self.check_issue(role, "copy_out", map, coords, region)?;

        if self.smem.has_unfenced_writes() {
            return Err(ExecutionFault::protocol(
                "copy_out issued before fence_proxy_async ordered the generic shared memory writes",
            ));
        }

        let group = {
            let mut state = lock(&self.groups.state);
            let group = state.open;
            state.open_stores += 1;
            *state.in_flight.entry(group).or_insert(0) += 1;
            group
        };

        self.send(Command::Store {
            map: map.clone(),
            coords: coords.to_vec(),
            region: *region,
            group,
        })
    }

    /// Make the generic shared memory writes of `unit` visible to bulk stores.
    pub fn fence_proxy_async(&self, unit: UnitPos) {
        self.smem.fence_proxy_async(unit);
    }

    /// Close the open bulk group.
    pub fn commit_group(&self, role: Role) -> Result<(), ExecutionFault> {
        leader_only(role, "commit_group")?;

        let mut state = lock(&self.groups.state);
        let group = state.open;
        if state.open_stores > 0 {
            state.unawaited.insert(group);
        }
        state.open += 1;
        state.open_stores = 0;
        log::trace!("Bulk group {group} committed");

        Ok(())
    }

    /// Wait until at most `pending` committed bulk groups still read shared memory.
    pub fn wait_group_read(&self, role: Role, pending: usize) -> Result<(), ExecutionFault> {
        leader_only(role, "wait_group_read")?;

        let state = lock(&self.groups.state);
        let mut state = self.signal.wait_while(
            &self.groups.cvar,
            state,
            "bulk group",
            |state| state.committed_in_flight() > pending,
        )?;

        let awaited = state.open.saturating_sub(pending as u64);
        state.unawaited.retain(|group| *group >= awaited);

        Ok(())
    }

    /// Drain the queue and check that no bulk store outlives the block.
    pub fn finish(&self) -> Result<(), ExecutionFault> {
        self.stop();

        let state = lock(&self.groups.state);
        if state.open_stores > 0 {
            return Err(ExecutionFault::protocol(
                "bulk store issued but its group was never committed",
            ));
        }
        if !state.unawaited.is_empty() {
            return Err(ExecutionFault::protocol(format!(
                "{} bulk group(s) committed but never awaited",
                state.unawaited.len()
            )));
        }

        Ok(())
    }

    fn check_issue(
        &self,
        role: Role,
        operation: &str,
        map: &TensorMap,
        coords: &[i64],
        region: &ScratchRegion,
    ) -> Result<(), ExecutionFault> {
        leader_only(role, operation)?;

        let meta = map.meta();
        if coords.len() != meta.rank() {
            return Err(ExecutionFault::protocol(format!(
                "{operation} with {} coordinates on a rank {} tensor map",
                coords.len(),
                meta.rank()
            )));
        }

        let alignment = SwizzleMode::from(meta.swizzle).alignment();
        if region.address() % alignment != 0 {
            return Err(ExecutionFault::MisalignedAddress {
                what: "bulk copy shared memory address",
                address: region.address() as u64,
                alignment: alignment as u64,
            });
        }

        let box_bytes = meta.box_bytes();
        if box_bytes > region.size() || region.address() + box_bytes > self.smem.len() {
            return Err(ExecutionFault::IllegalAddress {
                space: MemorySpace::Shared,
                offset: region.address() as u64,
                size: box_bytes as u64,
                bound: (region.address() + region.size()).min(self.smem.len()) as u64,
            });
        }

        Ok(())
    }

    fn send(&self, command: Command) -> Result<(), ExecutionFault> {
        log::trace!("Queueing {command:?}");
        self.sender
            .send_blocking(command)
            .map_err(|_| ExecutionFault::protocol("copy issued after the copy engine stopped"))
    }

    fn stop(&self) {
        self.sender.close();
        if let Some(handle) = lock(&self.worker).take() {
            if handle.join().is_err() {
                self.signal.fail(ExecutionFault::Trap {
                    reason: "copy engine panicked".to_string(),
                });
            }
        }
    }
}

impl Drop for CopyEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn leader_only(role: Role, operation: &str) -> Result<(), ExecutionFault> {
    match role {
        Role::Leader => Ok(()),
        Role::Follower => Err(ExecutionFault::protocol(format!(
            "{operation} issued by a follower unit"
        ))),
    }
}

struct Worker {
    smem: Arc<SharedMemory>,
    signal: Arc<BlockSignal>,
    groups: Arc<GroupTracker>,
    latency: Duration,
}

impl Worker {
    fn execute(&self, command: Command) {
        if self.signal.is_aborted() {
            return;
        }
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }

        let result = match command {
            Command::Load {
                map,
                coords,
                region,
                barrier,
            } => self.load(&map, &coords, &region, &barrier),
            Command::Store {
                map,
                coords,
                region,
                group,
            } => {
                let result = self.store(&map, &coords, &region);
                let mut state = lock(&self.groups.state);
                if let Some(count) = state.in_flight.get_mut(&group) {
                    *count -= 1;
                    if *count == 0 {
                        state.in_flight.remove(&group);
                    }
                }
                self.groups.cvar.notify_all();
                result
            }
        };

        if let Err(fault) = result {
            log::debug!("Copy engine fault: {fault}");
            self.signal.fail(fault);
        }
    }

    fn load(
        &self,
        map: &TensorMap,
        coords: &[i64],
        region: &ScratchRegion,
        barrier: &Barrier,
    ) -> Result<(), ExecutionFault> {
        let elem_size = map.meta().elem.size();
        let swizzle = SwizzleMode::from(map.meta().swizzle);
        let fill = map.fill_bytes();
        let mut value = vec![0; elem_size];

        for (linear, position) in map.box_positions(coords).iter().enumerate() {
            let address = swizzle.apply(region.address() + linear * elem_size);
            match map.global_offset(position) {
                Some(offset) => {
                    map.resource().read(offset, &mut value)?;
                    self.smem.write_async(address, &value)?;
                }
                None => self.smem.write_async(address, &fill)?,
            }
        }

        let bytes = map.meta().box_bytes();
        log::trace!("Loaded {bytes} bytes at {coords:?} into {region:?}");
        barrier.complete_tx(bytes as u32)
    }

    fn store(
        &self,
        map: &TensorMap,
        coords: &[i64],
        region: &ScratchRegion,
    ) -> Result<(), ExecutionFault> {
        let elem_size = map.meta().elem.size();
        let swizzle = SwizzleMode::from(map.meta().swizzle);
        let mut value = vec![0; elem_size];

        for (linear, position) in map.box_positions(coords).iter().enumerate() {
            // Elements outside the tensor are clipped.
            if let Some(offset) = map.global_offset(position) {
                let address = swizzle.apply(region.address() + linear * elem_size);
                self.smem.read_async(address, &mut value)?;
                map.resource().write(offset, &value)?;
            }
        }

        log::trace!("Stored {region:?} into the box at {coords:?}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared_memory::SharedMemoryLayout;
    use pretty_assertions::assert_eq;
    use tilemma_runtime::{
        config::simulation::SimulationConfig,
        kernel::CubeDim,
        storage::BytesResource,
        tma::{TensorMapElem, TensorMapMeta, TensorMapSwizzle},
    };

    fn context() -> BlockContext {
        let config = SimulationConfig::default().with_deadlock_timeout(Duration::from_secs(5));
        BlockContext::new(CubeDim::new_1d(1), config)
    }

    fn vector(values: &[f32], tile: u32) -> TensorMap {
        let meta = TensorMapMeta::tiled_contiguous(vec![values.len()], vec![tile], TensorMapElem::F32);
        TensorMap::new(meta, BytesResource::new(bytemuck::cast_slice(values).to_vec())).unwrap()
    }

    fn read_f32(smem: &SharedMemory, region: &ScratchRegion, count: usize) -> Vec<f32> {
        (0..count)
            .map(|index| smem.read_value::<f32>(region, index).unwrap())
            .collect()
    }

    #[test_log::test]
    fn load_credits_the_barrier() {
        let ctx = context();
        let mut layout = SharedMemoryLayout::default();
        let region = layout.region(64, 128);
        let smem = Arc::new(SharedMemory::new(layout.size()));
        let engine = CopyEngine::start(&ctx, smem.clone()).unwrap();
        let barrier = Arc::new(Barrier::new(ctx.signal().clone()));
        let values = (0..32).map(|v| v as f32).collect::<Vec<_>>();
        let map = vector(&values, 16);

        barrier.init(Role::Leader, 1).unwrap();
        engine
            .copy_in(Role::Leader, &map, &[8], &region, &barrier)
            .unwrap();
        let token = barrier.arrive_with_transaction(64).unwrap();
        barrier.wait(token).unwrap();

        assert_eq!(read_f32(&smem, &region, 16), values[8..24].to_vec());
        engine.finish().unwrap();
    }

    #[test_log::test]
    fn out_of_bounds_elements_are_zero_filled() {
        let ctx = context();
        let mut layout = SharedMemoryLayout::default();
        let region = layout.region(64, 128);
        let smem = Arc::new(SharedMemory::new(layout.size()));
        let engine = CopyEngine::start(&ctx, smem.clone()).unwrap();
        let barrier = Arc::new(Barrier::new(ctx.signal().clone()));
        let map = vector(&[1.0; 20], 16);

        barrier.init(Role::Leader, 1).unwrap();
        engine
            .copy_in(Role::Leader, &map, &[8], &region, &barrier)
            .unwrap();
        barrier
            .wait(barrier.arrive_with_transaction(64).unwrap())
            .unwrap();

        let loaded = read_f32(&smem, &region, 16);
        assert_eq!(loaded[..12], [1.0; 12]);
        assert_eq!(loaded[12..], [0.0; 4]);
        engine.finish().unwrap();
    }

    #[test]
    fn swizzled_load_permutes_16_byte_chunks() {
        let ctx = context();
        let mut layout = SharedMemoryLayout::default();
        let region = layout.region(512, 128);
        let smem = Arc::new(SharedMemory::new(layout.size()));
        let engine = CopyEngine::start(&ctx, smem.clone()).unwrap();
        let barrier = Arc::new(Barrier::new(ctx.signal().clone()));
        // 16 rows of 32 bytes.
        let values = (0..128).map(|v| v as f32).collect::<Vec<_>>();
        let meta = TensorMapMeta::tiled_contiguous(vec![16, 8], vec![16, 8], TensorMapElem::F32)
            .with_swizzle(TensorMapSwizzle::B32);
        let map = TensorMap::new(
            meta,
            BytesResource::new(bytemuck::cast_slice(&values).to_vec()),
        )
        .unwrap();

        barrier.init(Role::Leader, 1).unwrap();
        engine
            .copy_in(Role::Leader, &map, &[0, 0], &region, &barrier)
            .unwrap();
        barrier
            .wait(barrier.arrive_with_transaction(512).unwrap())
            .unwrap();

        let raw = read_f32(&smem, &region, 128);
        for (linear, value) in values.iter().enumerate() {
            let address = SwizzleMode::B32.apply(linear * 4);
            assert_eq!(raw[address / 4], *value);
        }
        // Rows 4..8 swap their two 16-byte chunks.
        assert_eq!(raw[4 * 8], 36.0);
        engine.finish().unwrap();
    }

    #[test]
    fn misaligned_or_oversized_destinations_fault_at_issue() {
        let ctx = context();
        let mut layout = SharedMemoryLayout::default();
        let small = layout.region(32, 16);
        let unaligned = layout.region(64, 16);
        let smem = Arc::new(SharedMemory::new(layout.size()));
        let engine = CopyEngine::start(&ctx, smem).unwrap();
        let barrier = Arc::new(Barrier::new(ctx.signal().clone()));
        let map = vector(&[0.0; 32], 16);

        assert!(matches!(
            engine.copy_in(Role::Leader, &map, &[0], &small, &barrier),
            Err(ExecutionFault::IllegalAddress {
                space: MemorySpace::Shared,
                ..
            })
        ));

        let swizzled = TensorMap::new(
            TensorMapMeta::tiled_contiguous(vec![64], vec![8], TensorMapElem::F32)
                .with_swizzle(TensorMapSwizzle::B32),
            BytesResource::new(vec![0; 256]),
        )
        .unwrap();
        assert!(matches!(
            engine.copy_in(Role::Leader, &swizzled, &[0], &unaligned, &barrier),
            Err(ExecutionFault::MisalignedAddress { alignment: 128, .. })
        ));
        assert!(matches!(
            engine.copy_in(Role::Follower, &map, &[0], &small, &barrier),
            Err(ExecutionFault::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn store_requires_a_fence_after_generic_writes() {
        let ctx = context();
        let mut layout = SharedMemoryLayout::default();
        let region = layout.region(64, 128);
        let smem = Arc::new(SharedMemory::new(layout.size()));
        let engine = CopyEngine::start(&ctx, smem.clone()).unwrap();
        let map = vector(&[0.0; 32], 16);
        let unit = UnitPos::new(0);

        smem.write_value(unit, &region, 0, 3.0f32).unwrap();
        assert!(matches!(
            engine.copy_out(Role::Leader, &map, &[16], &region),
            Err(ExecutionFault::ProtocolViolation { .. })
        ));

        engine.fence_proxy_async(unit);
        engine.copy_out(Role::Leader, &map, &[16], &region).unwrap();
        engine.commit_group(Role::Leader).unwrap();
        engine.wait_group_read(Role::Leader, 0).unwrap();
        engine.finish().unwrap();

        let stored: Vec<f32> = bytemuck::cast_slice(&map.resource().to_vec()).to_vec();
        assert_eq!(stored[16], 3.0);
        assert_eq!(stored[17..], [0.0; 15]);
    }

    #[test]
    fn stores_outside_the_tensor_are_clipped() {
        let ctx = context();
        let mut layout = SharedMemoryLayout::default();
        let region = layout.region(64, 128);
        let smem = Arc::new(SharedMemory::new(layout.size()));
        let engine = CopyEngine::start(&ctx, smem.clone()).unwrap();
        let map = vector(&[0.0; 20], 16);
        let unit = UnitPos::new(0);

        for index in 0..16 {
            smem.write_value(unit, &region, index, 7.0f32).unwrap();
        }
        engine.fence_proxy_async(unit);
        engine.copy_out(Role::Leader, &map, &[8], &region).unwrap();
        engine.commit_group(Role::Leader).unwrap();
        engine.wait_group_read(Role::Leader, 0).unwrap();
        engine.finish().unwrap();

        let stored: Vec<f32> = bytemuck::cast_slice(&map.resource().to_vec()).to_vec();
        assert_eq!(stored.len(), 20);
        assert_eq!(stored[..8], [0.0; 8]);
        assert_eq!(stored[8..], [7.0; 12]);
    }

    #[test]
    fn uncommitted_or_unawaited_stores_fault_at_exit() {
        let ctx = context();
        let mut layout = SharedMemoryLayout::default();
        let region = layout.region(64, 128);
        let map = vector(&[0.0; 16], 16);

        let smem = Arc::new(SharedMemory::new(layout.size()));
        let engine = CopyEngine::start(&ctx, smem.clone()).unwrap();
        engine.copy_out(Role::Leader, &map, &[0], &region).unwrap();
        assert!(matches!(
            engine.finish(),
            Err(ExecutionFault::ProtocolViolation { .. })
        ));

        let engine = CopyEngine::start(&ctx, smem).unwrap();
        engine.copy_out(Role::Leader, &map, &[0], &region).unwrap();
        engine.commit_group(Role::Leader).unwrap();
        assert_eq!(
            engine.finish(),
            Err(ExecutionFault::protocol(
                "1 bulk group(s) committed but never awaited"
            ))
        );
    }

    #[test]
    fn waiting_with_pending_groups_leaves_the_newest_unawaited() {
        let ctx = context();
        let mut layout = SharedMemoryLayout::default();
        let region = layout.region(64, 128);
        let smem = Arc::new(SharedMemory::new(layout.size()));
        let engine = CopyEngine::start(&ctx, smem).unwrap();
        let map = vector(&[0.0; 32], 16);

        engine.copy_out(Role::Leader, &map, &[0], &region).unwrap();
        engine.commit_group(Role::Leader).unwrap();
        engine.copy_out(Role::Leader, &map, &[16], &region).unwrap();
        engine.commit_group(Role::Leader).unwrap();

        engine.wait_group_read(Role::Leader, 1).unwrap();
        assert!(engine.finish().is_err());
    }
}
