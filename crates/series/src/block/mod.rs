//! Physical block storage for series data.
//!
//! A [`DataBlock`] is the unit of physical storage of a series: a row-key
//! [`Vector`], an optional value vector and optional extra columns, all of the
//! same fixed capacity. Rows occupy a logical ring inside the vectors that
//! starts at `head`, so evicting the oldest row and appending a new one never
//! shifts data.
//!
//! # Lifetime
//!
//! Blocks are shared as `Arc<DataBlock>`. On top of the `Arc`, every block
//! carries an explicit reference count that tracks *logical* ownership:
//!
//! - the owning chain holds one reference while the block is linked;
//! - every cursor positioned on the block holds one reference (a pin).
//!
//! When the count drops to zero the block is disposed: its row count becomes
//! [`DISPOSED_ROW_COUNT`], the reference count becomes [`DISPOSED_REF_COUNT`]
//! and it can no longer be pinned. Its vectors are handed back to the
//! [`BlockPool`] once the last `Arc` handle drops.
//!
//! # Layout
//!
//! ```text
//! capacity = 8, head = 6, row_count = 4
//!
//! physical: [ r2 | r3 | .. | .. | .. | .. | r0 | r1 ]
//!                                         ^ head
//! index_to_offset(i) = (head + i) % capacity
//! ```

mod pool;
mod vector;

pub use pool::{BlockPool, PoolConfig, PoolStats, DEFAULT_MAX_BUFFERS_PER_CLASS};
pub use vector::{Element, ElementType, RawKey, RawVector, Vector};

use crate::error::{Result, SeriesError};
use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicU64, AtomicUsize, Ordering};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

/// Row count of a disposed block.
pub const DISPOSED_ROW_COUNT: isize = -1;

/// Reference count of a disposed block.
pub const DISPOSED_REF_COUNT: isize = -1;

/// Direction of a key lookup relative to the searched key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lookup {
    /// Exactly the key.
    Eq,
    /// The greatest key strictly less than the key.
    Lt,
    /// The greatest key less than or equal to the key.
    Le,
    /// The smallest key strictly greater than the key.
    Gt,
    /// The smallest key greater than or equal to the key.
    Ge,
}

impl Lookup {
    /// Resolves a binary-search result over `len` rows into a row index.
    ///
    /// `found` is `Ok(i)` when the key is at row `i` and `Err(i)` with the
    /// insertion point otherwise, as returned by [`DataBlock::search_key`].
    pub fn resolve(self, found: std::result::Result<usize, usize>, len: usize) -> Option<usize> {
        match (self, found) {
            (Lookup::Eq, Ok(i)) | (Lookup::Le, Ok(i)) | (Lookup::Ge, Ok(i)) => Some(i),
            (Lookup::Eq, Err(_)) => None,
            (Lookup::Lt, Ok(i)) | (Lookup::Lt, Err(i)) | (Lookup::Le, Err(i)) => i.checked_sub(1),
            (Lookup::Gt, Ok(i)) => (i + 1 < len).then_some(i + 1),
            (Lookup::Gt, Err(i)) | (Lookup::Ge, Err(i)) => (i < len).then_some(i),
        }
    }

    /// Returns true for lookups that resolve towards greater keys.
    pub fn is_forward(self) -> bool {
        matches!(self, Lookup::Gt | Lookup::Ge)
    }
}

/// Physical storage unit of a series.
pub struct DataBlock<K: Element, V: Element> {
    row_count: AtomicIsize,
    row_capacity: usize,
    head: AtomicUsize,
    ref_count: AtomicIsize,
    linked: AtomicBool,
    sentinel: bool,
    /// Key the block is registered under in its chain's index.
    index_key: AtomicU64,
    row_keys: Vector<K>,
    values: Option<Vector<V>>,
    columns: Vec<RawVector>,
    /// Neighbour links; `None` until first linked and again after disposal.
    next: Mutex<Option<Weak<DataBlock<K, V>>>>,
    previous: Mutex<Option<Weak<DataBlock<K, V>>>>,
}

impl<K: Element, V: Element> DataBlock<K, V> {
    /// Creates a live block over the supplied vectors.
    ///
    /// The block takes ownership of the vectors. Its capacity is the vector
    /// length; `row_length` is the number of occupied rows and defaults to the
    /// full capacity.
    ///
    /// # Errors
    ///
    /// - `SeriesError::VectorLengthMismatch` if a value or column vector does
    ///   not have the length of `row_keys`.
    /// - `SeriesError::RowLengthExceedsCapacity` if `row_length` is larger
    ///   than the vector length.
    pub fn create(
        row_keys: Vector<K>,
        values: Option<Vector<V>>,
        columns: Vec<RawVector>,
        row_length: Option<usize>,
    ) -> Result<Arc<Self>> {
        let capacity = row_keys.len();
        let lengths = values
            .iter()
            .map(Vector::len)
            .chain(columns.iter().map(RawVector::len));
        for len in lengths {
            if len != capacity {
                return Err(SeriesError::VectorLengthMismatch {
                    expected: capacity,
                    actual: len,
                });
            }
        }

        let row_length = row_length.unwrap_or(capacity);
        if row_length > capacity {
            return Err(SeriesError::RowLengthExceedsCapacity {
                row_length,
                capacity,
            });
        }

        let index_key = if row_length > 0 {
            row_keys.get(0).to_bits()
        } else {
            0
        };

        Ok(Arc::new(Self {
            row_count: AtomicIsize::new(row_length as isize),
            row_capacity: capacity,
            head: AtomicUsize::new(0),
            ref_count: AtomicIsize::new(0),
            linked: AtomicBool::new(false),
            sentinel: false,
            index_key: AtomicU64::new(index_key),
            row_keys,
            values,
            columns,
            next: Mutex::new(None),
            previous: Mutex::new(None),
        }))
    }

    /// Creates an empty sentinel block.
    ///
    /// The sentinel has no rows and no capacity. It is never linked, never
    /// disposed, and ignores reference counting.
    pub fn empty() -> Arc<Self> {
        Arc::new(Self {
            row_count: AtomicIsize::new(0),
            row_capacity: 0,
            head: AtomicUsize::new(0),
            ref_count: AtomicIsize::new(0),
            linked: AtomicBool::new(false),
            sentinel: true,
            index_key: AtomicU64::new(0),
            row_keys: Vector::new(0),
            values: None,
            columns: Vec::new(),
            next: Mutex::new(None),
            previous: Mutex::new(None),
        })
    }

    /// Returns the number of occupied rows (0 for a disposed block).
    #[inline]
    pub fn row_count(&self) -> usize {
        self.row_count.load(Ordering::Acquire).max(0) as usize
    }

    /// Returns the capacity of the block's vectors.
    #[inline]
    pub fn row_capacity(&self) -> usize {
        self.row_capacity
    }

    /// Returns the physical offset of logical row 0.
    #[inline]
    pub fn head(&self) -> usize {
        self.head.load(Ordering::Acquire)
    }

    /// Returns true when every slot is occupied.
    pub fn is_full(&self) -> bool {
        self.row_count.load(Ordering::Acquire) == self.row_capacity as isize
    }

    /// Returns true when the block holds no rows.
    pub fn is_empty(&self) -> bool {
        self.row_count.load(Ordering::Acquire) <= 0
    }

    /// Returns true once the block has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.row_count.load(Ordering::Acquire) == DISPOSED_ROW_COUNT
    }

    /// Returns true for the empty sentinel block.
    pub fn is_sentinel(&self) -> bool {
        self.sentinel
    }

    /// Returns true while the block is a member of a chain.
    pub fn is_linked(&self) -> bool {
        self.linked.load(Ordering::Acquire)
    }

    /// Returns the current reference count.
    pub fn ref_count(&self) -> isize {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Maps a logical row index to its physical vector offset.
    #[inline]
    pub fn index_to_offset(&self, index: usize) -> usize {
        debug_assert!(self.row_capacity > 0, "offset into a zero-capacity block");
        let offset = self.head() + index;
        if offset >= self.row_capacity {
            offset - self.row_capacity
        } else {
            offset
        }
    }

    /// Returns the key of logical row `index`.
    #[inline]
    pub fn row_key(&self, index: usize) -> K {
        debug_assert!(index < self.row_capacity, "row {index} out of range");
        self.row_keys.get(self.index_to_offset(index))
    }

    /// Returns the value of logical row `index`, or the default value for
    /// blocks without a value vector.
    #[inline]
    pub fn row_value(&self, index: usize) -> V {
        debug_assert!(index < self.row_capacity, "row {index} out of range");
        match &self.values {
            Some(values) => values.get(self.index_to_offset(index)),
            None => V::default(),
        }
    }

    /// Returns the key and value of logical row `index`.
    #[inline]
    pub fn row(&self, index: usize) -> (K, V) {
        (self.row_key(index), self.row_value(index))
    }

    /// Returns the first key, if any.
    pub fn first_key(&self) -> Option<K> {
        (!self.is_empty()).then(|| self.row_key(0))
    }

    /// Returns the last key, if any.
    pub fn last_key(&self) -> Option<K> {
        match self.row_count() {
            0 => None,
            n => Some(self.row_key(n - 1)),
        }
    }

    /// Raw row-key vector, in physical order.
    pub fn row_keys(&self) -> &Vector<K> {
        &self.row_keys
    }

    /// Raw value vector, in physical order.
    pub fn values(&self) -> Option<&Vector<V>> {
        self.values.as_ref()
    }

    /// Raw extra columns, in physical order.
    pub fn columns(&self) -> &[RawVector] {
        &self.columns
    }

    /// Returns a typed view of extra column `column`, or `None` if the column
    /// does not exist or stores another element type.
    pub fn column<T: Element>(&self, column: usize) -> Option<Vector<T>> {
        let raw = self.columns.get(column)?;
        Vector::try_from_raw(raw.clone()).ok()
    }

    /// Returns the value of extra column `column` at logical row `index`.
    pub fn column_value<T: Element>(&self, column: usize, index: usize) -> Option<T> {
        let raw = self.columns.get(column)?;
        if raw.element_type() != T::ELEMENT_TYPE || index >= self.row_count() {
            return None;
        }
        Some(T::from_bits(raw.load_bits(self.index_to_offset(index))))
    }

    /// Searches the row keys with a custom comparator.
    ///
    /// Returns `Ok(i)` if row `i` compares equal and `Err(i)` with the logical
    /// insertion point otherwise. `cmp(row_key, key)` must be consistent with
    /// the order the rows were written in.
    pub fn search_key_by<F>(&self, key: &K, mut cmp: F) -> std::result::Result<usize, usize>
    where
        F: FnMut(&K, &K) -> CmpOrdering,
    {
        let row_count = self.row_count();
        if row_count == 0 {
            return Err(0);
        }
        let head = self.head();
        let capacity = self.row_capacity;

        if head + row_count <= capacity {
            // Contiguous: search physical slots directly.
            binary_search(head, head + row_count, |offset| {
                cmp(&self.row_keys.get(offset), key)
            })
            .map(|offset| offset - head)
            .map_err(|offset| offset - head)
        } else {
            binary_search(0, row_count, |index| {
                let offset = head + index;
                let offset = if offset >= capacity {
                    offset - capacity
                } else {
                    offset
                };
                cmp(&self.row_keys.get(offset), key)
            })
        }
    }

    /// Resolves `key` under `lookup` to a logical row index with a custom
    /// comparator.
    pub fn lookup_key_by<F>(&self, key: &K, lookup: Lookup, cmp: F) -> Option<usize>
    where
        F: FnMut(&K, &K) -> CmpOrdering,
    {
        let row_count = self.row_count();
        lookup.resolve(self.search_key_by(key, cmp), row_count)
    }

    /// Increments the reference count.
    ///
    /// No-op on the sentinel. Used by the owning chain when linking; cursors
    /// use [`DataBlock::try_increment`].
    pub fn increment(&self) {
        if self.sentinel {
            return;
        }
        let previous = self.ref_count.fetch_add(1, Ordering::AcqRel);
        debug_assert!(previous >= 0, "increment on a disposed block");
    }

    /// Increments the reference count if the block is currently owned.
    ///
    /// Fails for blocks whose count is zero (released by their chain) or
    /// disposed, so a pin can never resurrect a retired block. Always succeeds
    /// on the sentinel.
    pub fn try_increment(&self) -> bool {
        if self.sentinel {
            return true;
        }
        let mut current = self.ref_count.load(Ordering::Acquire);
        loop {
            if current <= 0 {
                return false;
            }
            match self.ref_count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Decrements the reference count and returns the new count.
    pub fn decrement(&self) -> isize {
        if self.sentinel {
            return 0;
        }
        let previous = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "reference count underflow");
        previous - 1
    }

    /// Drops one reference and disposes the block when none remain.
    ///
    /// Returns true if this call disposed the block.
    pub fn release(&self) -> bool {
        if self.sentinel || self.decrement() != 0 {
            return false;
        }
        match self.dispose() {
            Ok(()) => true,
            Err(err) => {
                trace!("Block release did not dispose: {}", err);
                false
            }
        }
    }

    /// Disposes the block.
    ///
    /// # Errors
    ///
    /// - `SeriesError::SentinelDispose` for the sentinel.
    /// - `SeriesError::AlreadyDisposed` if the block was disposed before.
    /// - `SeriesError::BlockInUse` if the reference count is positive.
    pub fn dispose(&self) -> Result<()> {
        if self.sentinel {
            return Err(SeriesError::SentinelDispose);
        }
        match self.ref_count.compare_exchange(
            0,
            DISPOSED_REF_COUNT,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(DISPOSED_REF_COUNT) => return Err(SeriesError::AlreadyDisposed),
            Err(ref_count) => return Err(SeriesError::BlockInUse { ref_count }),
        }

        self.debug_assert_reciprocal_links();
        self.next.lock().take();
        self.previous.lock().take();
        self.linked.store(false, Ordering::Release);
        self.row_count.store(DISPOSED_ROW_COUNT, Ordering::Release);
        debug!(
            "Disposed block: capacity={}, columns={}",
            self.row_capacity,
            self.columns.len()
        );
        Ok(())
    }

    /// Returns the next block this block was linked to, if it is still alive.
    pub fn next_link(&self) -> Option<Arc<Self>> {
        self.next.lock().as_ref().and_then(Weak::upgrade)
    }

    /// Returns the previous block this block was linked to, if it is still
    /// alive.
    pub fn previous_link(&self) -> Option<Arc<Self>> {
        self.previous.lock().as_ref().and_then(Weak::upgrade)
    }

    /// Returns true if the block holds a next link, live or stale.
    pub fn has_next_link(&self) -> bool {
        self.next.lock().is_some()
    }

    pub(crate) fn index_key(&self) -> K {
        K::from_bits(self.index_key.load(Ordering::Acquire))
    }

    pub(crate) fn set_index_key(&self, key: K) {
        self.index_key.store(key.to_bits(), Ordering::Release);
    }

    pub(crate) fn set_linked(&self, linked: bool) {
        self.linked.store(linked, Ordering::Release);
    }

    /// Records `previous -> self` in both blocks' links.
    ///
    /// A link that is already set is left untouched until the block is
    /// disposed; traversal falls back to the chain index whenever a link is
    /// stale.
    pub(crate) fn link_after(self: &Arc<Self>, previous: &Arc<Self>) {
        previous.next.lock().get_or_insert_with(|| Arc::downgrade(self));
        self.previous.lock().get_or_insert_with(|| Arc::downgrade(previous));
    }

    /// Appends a row. Single writer only.
    pub(crate) fn push_row(&self, key: K, value: V) {
        let row_count = self.row_count();
        debug_assert!(row_count < self.row_capacity, "push into a full block");
        let offset = self.index_to_offset(row_count);
        self.row_keys.set(offset, key);
        if let Some(values) = &self.values {
            values.set(offset, value);
        }
        if row_count == 0 {
            self.set_index_key(key);
        }
        self.row_count.store(row_count as isize + 1, Ordering::Release);
    }

    /// Evicts the oldest row by advancing the ring head. Single writer only.
    pub(crate) fn pop_front_row(&self) -> Option<(K, V)> {
        let row_count = self.row_count();
        if row_count == 0 {
            return None;
        }
        let row = self.row(0);
        let head = self.head();
        let next_head = if head + 1 == self.row_capacity {
            0
        } else {
            head + 1
        };
        self.head.store(next_head, Ordering::Release);
        self.row_count.store(row_count as isize - 1, Ordering::Release);
        Some(row)
    }

    fn debug_assert_reciprocal_links(&self) {
        if !cfg!(debug_assertions) {
            return;
        }
        if let Some(back) = self.next_link().and_then(|next| next.previous_link()) {
            debug_assert!(
                std::ptr::eq(Arc::as_ptr(&back), self) || !back.is_linked(),
                "next block links back to another live block"
            );
        }
        if let Some(forward) = self.previous_link().and_then(|previous| previous.next_link()) {
            debug_assert!(
                std::ptr::eq(Arc::as_ptr(&forward), self) || !forward.is_linked(),
                "previous block links forward to another live block"
            );
        }
    }
}

impl<K: Element + Ord, V: Element> DataBlock<K, V> {
    /// Searches the row keys using the key type's order.
    pub fn search_key(&self, key: &K) -> std::result::Result<usize, usize> {
        self.search_key_by(key, K::cmp)
    }

    /// Resolves `key` under `lookup` to a logical row index.
    pub fn lookup_key(&self, key: &K, lookup: Lookup) -> Option<usize> {
        self.lookup_key_by(key, lookup, K::cmp)
    }
}

impl<K: Element, V: Element> fmt::Debug for DataBlock<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataBlock")
            .field("row_count", &self.row_count.load(Ordering::Acquire))
            .field("row_capacity", &self.row_capacity)
            .field("head", &self.head())
            .field("ref_count", &self.ref_count())
            .field("linked", &self.is_linked())
            .field("sentinel", &self.sentinel)
            .finish()
    }
}

/// Binary search over `[lo, hi)` where `probe(i)` compares element `i` with
/// the searched key.
fn binary_search<F>(mut lo: usize, mut hi: usize, mut probe: F) -> std::result::Result<usize, usize>
where
    F: FnMut(usize) -> CmpOrdering,
{
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        match probe(mid) {
            CmpOrdering::Less => lo = mid + 1,
            CmpOrdering::Greater => hi = mid,
            CmpOrdering::Equal => return Ok(mid),
        }
    }
    Err(lo)
}
