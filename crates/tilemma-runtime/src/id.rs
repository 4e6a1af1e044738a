use core::sync::atomic::{AtomicU64, Ordering};

static STORAGE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Identifier of a global memory allocation.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct StorageId {
    value: u64,
}

impl StorageId {
    /// Create a new, process-unique storage id.
    pub fn new() -> Self {
        Self {
            value: STORAGE_COUNTER.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl Default for StorageId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for StorageId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "storage#{}", self.value)
    }
}
