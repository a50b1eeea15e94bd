//! Pool of reusable vector buffers, keyed by capacity class.
//!
//! Blocks of a series are created and retired continuously as data is
//! appended and evicted. Renting vector buffers from a pool avoids a heap
//! allocation per block once the pool is warm.
//!
//! A buffer is returned to the pool by the `Drop` of its last handle, so a
//! buffer can never be recycled while a block (and therefore a cursor pinned
//! on that block) still references it.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::vector::{zeroed_slots, Element, RawVector, SlotBuffer, Vector};

/// Default number of idle buffers kept per capacity class.
pub const DEFAULT_MAX_BUFFERS_PER_CLASS: usize = 64;

/// Configuration for a [`BlockPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of idle buffers retained per capacity class.
    ///
    /// Buffers returned beyond this limit are freed. Default: 64.
    pub max_buffers_per_class: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_buffers_per_class: DEFAULT_MAX_BUFFERS_PER_CLASS,
        }
    }
}

impl PoolConfig {
    /// Creates a new configuration with a custom per-class limit.
    pub fn with_max_buffers_per_class(mut self, max: usize) -> Self {
        self.max_buffers_per_class = max;
        self
    }
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers allocated because no idle buffer of the class was available.
    pub allocated: u64,
    /// Rent requests served from idle buffers.
    pub reused: u64,
    /// Buffers handed back and retained for reuse.
    pub returned: u64,
    /// Buffers handed back but freed because the class was full.
    pub discarded: u64,
}

#[derive(Debug, Default)]
struct PoolCounters {
    allocated: AtomicU64,
    reused: AtomicU64,
    returned: AtomicU64,
    discarded: AtomicU64,
}

pub(crate) struct PoolShared {
    classes: Mutex<HashMap<usize, Vec<Box<[AtomicU64]>>>>,
    max_buffers_per_class: usize,
    counters: PoolCounters,
}

impl PoolShared {
    fn take(&self, len: usize) -> Box<[AtomicU64]> {
        let idle = self.classes.lock().get_mut(&len).and_then(Vec::pop);
        match idle {
            Some(slots) => {
                self.counters.reused.fetch_add(1, Ordering::Relaxed);
                slots
            }
            None => {
                self.counters.allocated.fetch_add(1, Ordering::Relaxed);
                zeroed_slots(len)
            }
        }
    }

    pub(crate) fn give_back(&self, slots: Box<[AtomicU64]>) {
        if slots.is_empty() {
            return;
        }
        let mut classes = self.classes.lock();
        let class = classes.entry(slots.len()).or_default();
        if class.len() < self.max_buffers_per_class {
            class.push(slots);
            self.counters.returned.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Shared pool of vector buffers.
///
/// Cloning the pool is cheap; all clones share the same idle buffers.
#[derive(Clone)]
pub struct BlockPool {
    shared: Arc<PoolShared>,
}

impl BlockPool {
    /// Creates an empty pool.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                classes: Mutex::new(HashMap::new()),
                max_buffers_per_class: config.max_buffers_per_class,
                counters: PoolCounters::default(),
            }),
        }
    }

    /// Rents a vector of exactly `len` slots.
    ///
    /// The contents of a reused buffer are unspecified; callers overwrite
    /// every slot they publish.
    pub fn rent<T: Element>(&self, len: usize) -> Vector<T> {
        Vector::wrap(self.rent_raw(T::ELEMENT_TYPE, len))
    }

    /// Rents an untyped vector of exactly `len` slots.
    pub fn rent_raw(&self, element_type: super::ElementType, len: usize) -> RawVector {
        let slots = self.shared.take(len);
        RawVector::from_buffer(
            element_type,
            SlotBuffer::pooled(slots, Arc::downgrade(&self.shared)),
        )
    }

    /// Rents a vector and fills it with `values`.
    pub fn vector_from_slice<T: Element>(&self, values: &[T]) -> Vector<T> {
        let vector = self.rent::<T>(values.len());
        for (i, &value) in values.iter().enumerate() {
            vector.set(i, value);
        }
        vector
    }

    /// Returns the number of idle buffers of capacity class `len`.
    pub fn available(&self, len: usize) -> usize {
        self.shared.classes.lock().get(&len).map_or(0, Vec::len)
    }

    /// Returns a snapshot of the pool counters.
    pub fn stats(&self) -> PoolStats {
        let counters = &self.shared.counters;
        PoolStats {
            allocated: counters.allocated.load(Ordering::Relaxed),
            reused: counters.reused.load(Ordering::Relaxed),
            returned: counters.returned.load(Ordering::Relaxed),
            discarded: counters.discarded.load(Ordering::Relaxed),
        }
    }
}

impl Default for BlockPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl std::fmt::Debug for BlockPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockPool")
            .field("max_buffers_per_class", &self.shared.max_buffers_per_class)
            .field("stats", &self.stats())
            .finish()
    }
}
