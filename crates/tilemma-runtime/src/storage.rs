use crate::{
    StorageId,
    server::{ExecutionFault, MemorySpace},
    sync::lock,
};
use bytemuck::Pod;
use hashbrown::HashMap;
use std::sync::{Arc, Mutex};

/// Host side reference to a global memory allocation.
#[derive(new, Clone, Debug, PartialEq, Eq)]
pub struct Handle {
    /// Storage the handle points to.
    pub id: StorageId,
    /// Size of the allocation in bytes.
    pub size: usize,
}

/// Reference to an allocation passed to a kernel.
#[derive(new, Clone, Debug, PartialEq, Eq)]
pub struct Binding {
    /// Storage the binding points to.
    pub id: StorageId,
    /// Size of the allocation in bytes.
    pub size: usize,
}

impl Handle {
    /// Convert the handle into a [binding](Binding).
    pub fn binding(self) -> Binding {
        Binding::new(self.id, self.size)
    }

    /// Size of the allocation in elements of `T`.
    pub fn len_of<T>(&self) -> usize {
        self.size / size_of::<T>()
    }
}

/// A global memory allocation, shared between the server and the units of a running block.
#[derive(Clone, Debug)]
pub struct BytesResource {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl BytesResource {
    /// Wrap `bytes` as a standalone allocation.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(bytes)),
        }
    }

    /// Size of the allocation in bytes.
    pub fn len(&self) -> usize {
        lock(&self.bytes).len()
    }

    /// Whether the allocation is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy the whole allocation.
    pub fn to_vec(&self) -> Vec<u8> {
        lock(&self.bytes).clone()
    }

    /// Read `out.len()` bytes at `offset`.
    pub fn read(&self, offset: usize, out: &mut [u8]) -> Result<(), ExecutionFault> {
        let bytes = lock(&self.bytes);
        let range = checked_range(offset, out.len(), bytes.len())?;
        out.copy_from_slice(&bytes[range]);
        Ok(())
    }

    /// Write `data` at `offset`.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<(), ExecutionFault> {
        let mut bytes = lock(&self.bytes);
        let range = checked_range(offset, data.len(), bytes.len())?;
        bytes[range].copy_from_slice(data);
        Ok(())
    }

    /// Read the element at `index`, in units of `T`.
    pub fn read_value<T: Pod>(&self, index: usize) -> Result<T, ExecutionFault> {
        let size = size_of::<T>();
        let bytes = lock(&self.bytes);
        let range = checked_range(index * size, size, bytes.len())?;
        Ok(bytemuck::pod_read_unaligned(&bytes[range]))
    }

    /// Write the element at `index`, in units of `T`.
    pub fn write_value<T: Pod>(&self, index: usize, value: T) -> Result<(), ExecutionFault> {
        self.write(index * size_of::<T>(), bytemuck::bytes_of(&value))
    }

    /// Run `func` with exclusive access to the raw bytes.
    pub fn with_bytes_mut<R>(&self, func: impl FnOnce(&mut [u8]) -> R) -> R {
        func(&mut lock(&self.bytes))
    }
}

fn checked_range(
    offset: usize,
    size: usize,
    bound: usize,
) -> Result<core::ops::Range<usize>, ExecutionFault> {
    match offset.checked_add(size) {
        Some(end) if end <= bound => Ok(offset..end),
        _ => Err(ExecutionFault::IllegalAddress {
            space: MemorySpace::Global,
            offset: offset as u64,
            size: size as u64,
            bound: bound as u64,
        }),
    }
}

/// Global memory of the simulated device.
#[derive(Default, Debug)]
pub struct BytesStorage {
    memory: HashMap<StorageId, BytesResource>,
}

impl BytesStorage {
    /// Allocate a buffer holding a copy of `data`.
    pub fn create(&mut self, data: &[u8]) -> Handle {
        let id = StorageId::new();
        self.memory.insert(id, BytesResource::new(data.to_vec()));
        Handle::new(id, data.len())
    }

    /// Allocate a zeroed buffer.
    pub fn alloc(&mut self, size: usize) -> Handle {
        let id = StorageId::new();
        self.memory.insert(id, BytesResource::new(vec![0; size]));
        Handle::new(id, size)
    }

    /// Get the resource behind a binding.
    pub fn get(&self, binding: &Binding) -> Option<BytesResource> {
        self.memory.get(&binding.id).cloned()
    }

    /// Release an allocation.
    pub fn dealloc(&mut self, id: StorageId) {
        self.memory.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_bounds_access_faults() {
        let mut storage = BytesStorage::default();
        let handle = storage.alloc(16);
        let resource = storage.get(&handle.binding()).unwrap();

        resource.write_value(3, 7u32).unwrap();
        assert_eq!(resource.read_value::<u32>(3).unwrap(), 7);

        let fault = resource.write_value(4, 1u32).unwrap_err();
        assert_eq!(
            fault,
            ExecutionFault::IllegalAddress {
                space: MemorySpace::Global,
                offset: 16,
                size: 4,
                bound: 16,
            }
        );
    }

    #[test]
    fn dealloc_invalidates_bindings() {
        let mut storage = BytesStorage::default();
        let handle = storage.create(&[1, 2, 3]);
        let binding = handle.clone().binding();

        assert_eq!(storage.get(&binding).unwrap().to_vec(), vec![1, 2, 3]);
        storage.dealloc(handle.id);
        assert!(storage.get(&binding).is_none());
    }
}
