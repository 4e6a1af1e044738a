use crate::{ExecutionFault, UnitPos};
use bytemuck::Pod;
use hashbrown::HashSet;
use std::sync::Mutex;
use tilemma_runtime::{server::MemorySpace, sync::lock};

/// A statically placed region of shared memory holding one tile.
#[derive(new, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScratchRegion {
    offset: usize,
    size: usize,
}

impl ScratchRegion {
    /// Byte address of the region in shared memory.
    pub fn address(&self) -> usize {
        self.offset
    }

    /// Size of the region in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Sub-region starting `offset` bytes into this one.
    pub fn slice(&self, offset: usize, size: usize) -> Result<ScratchRegion, ExecutionFault> {
        match offset.checked_add(size) {
            Some(end) if end <= self.size => Ok(ScratchRegion::new(self.offset + offset, size)),
            _ => Err(illegal(self.offset + offset, size, self.offset + self.size)),
        }
    }
}

/// Static shared memory layout of a kernel.
///
/// Regions are placed in declaration order, each aligned to its own requirement.
#[derive(Default, Debug, Clone)]
pub struct SharedMemoryLayout {
    size: usize,
}

impl SharedMemoryLayout {
    /// Place a region of `size` bytes aligned to `alignment`.
    pub fn region(&mut self, size: usize, alignment: usize) -> ScratchRegion {
        let offset = self.size.next_multiple_of(alignment);
        self.size = offset + size;
        ScratchRegion::new(offset, size)
    }

    /// Total shared memory used by the layout.
    pub fn size(&self) -> usize {
        self.size
    }
}

/// Shared memory of a running block.
///
/// Generic accesses come from units, asynchronous accesses from the copy engine and the
/// tensor core. Generic writes must be made visible to the asynchronous proxy with
/// [fence_proxy_async](SharedMemory::fence_proxy_async) before a bulk store reads them.
#[derive(Debug)]
pub struct SharedMemory {
    bytes: Mutex<Vec<u8>>,
    unfenced: Mutex<HashSet<u32>>,
}

impl SharedMemory {
    /// Zero initialized shared memory of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0; size]),
            unfenced: Mutex::new(HashSet::new()),
        }
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        lock(&self.bytes).len()
    }

    /// Whether the shared memory is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Generic read of the element at `index` of `region`.
    pub fn read_value<T: Pod>(
        &self,
        region: &ScratchRegion,
        index: usize,
    ) -> Result<T, ExecutionFault> {
        let size = size_of::<T>();
        let offset = region_offset(region, index * size, size)?;
        let mut value = T::zeroed();
        self.read_async(offset, bytemuck::bytes_of_mut(&mut value))?;
        Ok(value)
    }

    /// Generic write of the element at `index` of `region` by `unit`.
    pub fn write_value<T: Pod>(
        &self,
        unit: UnitPos,
        region: &ScratchRegion,
        index: usize,
        value: T,
    ) -> Result<(), ExecutionFault> {
        let size = size_of::<T>();
        let offset = region_offset(region, index * size, size)?;
        self.write_async(offset, bytemuck::bytes_of(&value))?;
        lock(&self.unfenced).insert(unit.unit);
        Ok(())
    }

    /// Make the generic writes of `unit` visible to the asynchronous proxy.
    pub fn fence_proxy_async(&self, unit: UnitPos) {
        lock(&self.unfenced).remove(&unit.unit);
    }

    /// Whether some unit wrote through the generic proxy since its last fence.
    pub fn has_unfenced_writes(&self) -> bool {
        !lock(&self.unfenced).is_empty()
    }

    /// Asynchronous proxy read of raw bytes.
    pub fn read_async(&self, address: usize, out: &mut [u8]) -> Result<(), ExecutionFault> {
        let bytes = lock(&self.bytes);
        let range = checked(address, out.len(), bytes.len())?;
        out.copy_from_slice(&bytes[range]);
        Ok(())
    }

    /// Asynchronous proxy write of raw bytes.
    pub fn write_async(&self, address: usize, data: &[u8]) -> Result<(), ExecutionFault> {
        let mut bytes = lock(&self.bytes);
        let range = checked(address, data.len(), bytes.len())?;
        bytes[range].copy_from_slice(data);
        Ok(())
    }
}

fn region_offset(
    region: &ScratchRegion,
    offset: usize,
    size: usize,
) -> Result<usize, ExecutionFault> {
    region.slice(offset, size).map(|slice| slice.address())
}

fn checked(
    address: usize,
    size: usize,
    bound: usize,
) -> Result<core::ops::Range<usize>, ExecutionFault> {
    match address.checked_add(size) {
        Some(end) if end <= bound => Ok(address..end),
        _ => Err(illegal(address, size, bound)),
    }
}

fn illegal(offset: usize, size: usize, bound: usize) -> ExecutionFault {
    ExecutionFault::IllegalAddress {
        space: MemorySpace::Shared,
        offset: offset as u64,
        size: size as u64,
        bound: bound as u64,
    }
}
