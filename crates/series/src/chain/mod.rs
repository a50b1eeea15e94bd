//! Block chain: the container of one logical series.
//!
//! A [`BlockChain`] owns the [`DataBlock`]s of a series, keeps them in a
//! lock-free ordered index and publishes the order version that cursors use
//! for optimistic concurrency control.
//!
//! # Concurrency Model
//!
//! One writer, many readers. Writers are serialized by an internal mutex that
//! readers never touch. Readers (cursors and the lookup methods on this type)
//! work on a lock-free snapshot and validate it afterwards:
//!
//! ```text
//! snapshot = chain.order_version()
//! ... search the index, walk links, read rows ...
//! chain.validate(snapshot)   // false if a structural change started meanwhile
//! ```
//!
//! Pure appends never advance the order version: they only publish rows past
//! the end that no reader has observed yet. Inserting in the middle, removing
//! rows and evicting the oldest row are structural and advance it.
//!
//! # Index
//!
//! Blocks are registered in a [`SkipMap`] keyed by their first row key. Each
//! block also carries set-once weak links to its neighbours, which give O(1)
//! traversal while they are current and fall back to the index when stale.

mod mutation;

use crate::block::{BlockPool, DataBlock, Element, Lookup, PoolConfig};
use crate::cursor::{BlockCursor, KeyOnlyReader, KeyValueReader};
use crate::error::{Result, SeriesError};
use crossbeam_skiplist::SkipMap;
use parking_lot::Mutex;
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::atomic::{fence, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Default number of rows per block.
pub const DEFAULT_BLOCK_CAPACITY: usize = 1024;

/// Default number of attempts a seek makes under concurrent mutation.
pub const DEFAULT_MAX_SEEK_RETRIES: usize = 64;

/// Key types a series can be ordered by.
pub trait Key: Element + Ord {}

impl<T: Element + Ord> Key for T {}

/// Key/value series.
pub type Series<K, V> = BlockChain<K, V>;

/// Pure-key series (keys without values).
pub type KeySeries<K> = BlockChain<K, ()>;

/// Mutation policy of a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChainMode {
    /// Appends and structural mutations are allowed.
    #[default]
    Mutable,
    /// Only appends are allowed. Cursors skip order-version validation.
    AppendOnly,
}

/// Configuration for a block chain.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    /// Capacity of blocks created by the chain.
    ///
    /// Default: 1024 rows.
    pub block_capacity: usize,

    /// Mutation policy. Default: [`ChainMode::Mutable`].
    pub mode: ChainMode,

    /// Attempts a cursor seek makes before giving up with
    /// `SeriesError::SeekContention`. Default: 64.
    pub max_seek_retries: usize,

    /// Configuration of the chain's own buffer pool.
    pub pool: PoolConfig,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            block_capacity: DEFAULT_BLOCK_CAPACITY,
            mode: ChainMode::default(),
            max_seek_retries: DEFAULT_MAX_SEEK_RETRIES,
            pool: PoolConfig::default(),
        }
    }
}

impl ChainConfig {
    /// Creates a new configuration with a custom block capacity.
    pub fn with_block_capacity(mut self, capacity: usize) -> Self {
        self.block_capacity = capacity.max(1);
        self
    }

    /// Creates a new configuration with a custom mutation policy.
    pub fn with_mode(mut self, mode: ChainMode) -> Self {
        self.mode = mode;
        self
    }

    /// Creates a new configuration with a custom seek retry budget.
    pub fn with_max_seek_retries(mut self, retries: usize) -> Self {
        self.max_seek_retries = retries.max(1);
        self
    }

    /// Creates a new configuration with a custom pool configuration.
    pub fn with_pool_config(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }
}

/// Ordered chain of blocks forming one series.
pub struct BlockChain<K: Key, V: Element> {
    index: SkipMap<K, Arc<DataBlock<K, V>>>,
    sentinel: Arc<DataBlock<K, V>>,
    order_version: AtomicU64,
    next_order_version: AtomicU64,
    row_count: AtomicUsize,
    config: ChainConfig,
    pool: BlockPool,
    writer: Mutex<()>,
}

impl<K: Key, V: Element> BlockChain<K, V> {
    /// Creates an empty chain with its own buffer pool.
    pub fn new(config: ChainConfig) -> Self {
        let pool = BlockPool::new(config.pool.clone());
        Self::with_pool(config, pool)
    }

    /// Creates an empty chain that rents buffers from a shared pool.
    pub fn with_pool(config: ChainConfig, pool: BlockPool) -> Self {
        Self {
            index: SkipMap::new(),
            sentinel: DataBlock::empty(),
            order_version: AtomicU64::new(0),
            next_order_version: AtomicU64::new(0),
            row_count: AtomicUsize::new(0),
            config,
            pool,
            writer: Mutex::new(()),
        }
    }

    /// Builds a chain from prebuilt blocks.
    ///
    /// Empty blocks are skipped. The chain takes one reference on every block
    /// it links.
    ///
    /// # Errors
    ///
    /// Returns `SeriesError::BlockOrderViolation` if a block's keys are not
    /// strictly increasing, a block's first key is not greater than the
    /// previous block's last key, or a block is disposed or the sentinel.
    pub fn from_blocks(config: ChainConfig, blocks: Vec<Arc<DataBlock<K, V>>>) -> Result<Self> {
        let mut previous: Option<&Arc<DataBlock<K, V>>> = None;
        for (position, block) in blocks.iter().enumerate() {
            if block.is_sentinel() || block.is_disposed() || block.is_linked() {
                return Err(SeriesError::BlockOrderViolation { position });
            }
            let Some(first) = block.first_key() else {
                continue;
            };
            if (1..block.row_count()).any(|i| block.row_key(i - 1) >= block.row_key(i)) {
                return Err(SeriesError::BlockOrderViolation { position });
            }
            if let Some(last) = previous.and_then(|p| p.last_key()) {
                if first <= last {
                    return Err(SeriesError::BlockOrderViolation { position });
                }
            }
            previous = Some(block);
        }

        let chain = Self::new(config);
        let mut last: Option<Arc<DataBlock<K, V>>> = None;
        let mut rows = 0;
        for block in blocks.into_iter().filter(|b| !b.is_empty()) {
            rows += block.row_count();
            chain.link_last(last.as_ref(), &block);
            last = Some(block);
        }
        chain.row_count.store(rows, Ordering::Release);
        debug!(
            "Built chain from blocks: blocks={}, rows={}",
            chain.block_count(),
            rows
        );
        Ok(chain)
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    /// Returns the buffer pool blocks are rented from.
    pub fn pool(&self) -> &BlockPool {
        &self.pool
    }

    /// Returns the chain's empty sentinel block.
    pub fn sentinel(&self) -> &Arc<DataBlock<K, V>> {
        &self.sentinel
    }

    /// Returns true if structural mutations are rejected.
    pub fn is_append_only(&self) -> bool {
        self.config.mode == ChainMode::AppendOnly
    }

    /// Returns the version of the last completed structural mutation.
    pub fn order_version(&self) -> u64 {
        self.order_version.load(Ordering::Acquire)
    }

    /// Returns the version the chain will have once the in-flight structural
    /// mutation (if any) completes.
    pub fn next_order_version(&self) -> u64 {
        self.next_order_version.load(Ordering::Acquire)
    }

    /// Returns true if no structural mutation started since `snapshot` was
    /// taken with [`BlockChain::order_version`].
    ///
    /// Reads performed before this call are ordered before the version check.
    pub fn validate(&self, snapshot: u64) -> bool {
        fence(Ordering::Acquire);
        self.next_order_version() == snapshot
    }

    /// Returns the total number of rows.
    pub fn len(&self) -> usize {
        self.row_count.load(Ordering::Acquire)
    }

    /// Returns true if the chain holds no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of linked blocks.
    pub fn block_count(&self) -> usize {
        self.index.len()
    }

    /// Returns the first linked block.
    pub fn first_block(&self) -> Option<Arc<DataBlock<K, V>>> {
        self.index.front().map(|entry| Arc::clone(entry.value()))
    }

    /// Returns the last linked block.
    pub fn last_block(&self) -> Option<Arc<DataBlock<K, V>>> {
        self.index.back().map(|entry| Arc::clone(entry.value()))
    }

    /// Returns the only block of the chain if it holds exactly one.
    pub fn single_block(&self) -> Option<Arc<DataBlock<K, V>>> {
        let first = self.first_block()?;
        let last = self.last_block()?;
        Arc::ptr_eq(&first, &last).then_some(first)
    }

    /// Returns a snapshot of the linked blocks in key order.
    pub fn blocks(&self) -> Vec<Arc<DataBlock<K, V>>> {
        self.index
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Returns the block after `block`, or `None` at the end of the chain.
    ///
    /// Uses the block's forward link when it points to a linked block, and
    /// the index otherwise.
    pub fn try_get_next_block(&self, block: &DataBlock<K, V>) -> Option<Arc<DataBlock<K, V>>> {
        if block.is_sentinel() {
            return None;
        }
        if let Some(next) = block.next_link() {
            if next.is_linked() {
                return Some(next);
            }
        }
        self.index
            .range((Excluded(block.index_key()), Unbounded))
            .next()
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Returns the block before `block`, or `None` at the start of the chain.
    pub fn try_get_previous_block(
        &self,
        block: &DataBlock<K, V>,
    ) -> Option<Arc<DataBlock<K, V>>> {
        if block.is_sentinel() {
            return None;
        }
        if let Some(previous) = block.previous_link() {
            if previous.is_linked() {
                return Some(previous);
            }
        }
        self.index
            .range(..block.index_key())
            .next_back()
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Resolves the block and in-block row that satisfy `lookup` for `key`.
    ///
    /// Safe to call concurrently with the writer; callers validate the
    /// result against an order-version snapshot taken before the call.
    pub fn try_find_block_at(
        &self,
        key: K,
        lookup: Lookup,
    ) -> Option<(Arc<DataBlock<K, V>>, usize)> {
        let candidate = self
            .index
            .range(..=key)
            .next_back()
            .map(|entry| Arc::clone(entry.value()));

        let block = match candidate {
            Some(block) => block,
            // Key precedes every block.
            None if lookup.is_forward() => return self.first_row(),
            None => return None,
        };

        if let Some(index) = block.lookup_key(&key, lookup) {
            return Some((block, index));
        }

        match lookup {
            Lookup::Eq => None,
            Lookup::Lt | Lookup::Le => self.last_row_before(&block),
            Lookup::Gt | Lookup::Ge => self.first_row_after(&block),
        }
    }

    /// Returns the first row of the chain.
    pub(crate) fn first_row(&self) -> Option<(Arc<DataBlock<K, V>>, usize)> {
        let block = self.first_block()?;
        if !block.is_empty() {
            return Some((block, 0));
        }
        self.first_row_after(&block)
    }

    /// Returns the last row of the chain.
    pub(crate) fn last_row(&self) -> Option<(Arc<DataBlock<K, V>>, usize)> {
        let block = self.last_block()?;
        match block.row_count() {
            0 => self.last_row_before(&block),
            rows => Some((block, rows - 1)),
        }
    }

    fn first_row_after(&self, block: &DataBlock<K, V>) -> Option<(Arc<DataBlock<K, V>>, usize)> {
        let mut current = self.try_get_next_block(block)?;
        while current.is_empty() {
            current = self.try_get_next_block(&current)?;
        }
        Some((current, 0))
    }

    fn last_row_before(&self, block: &DataBlock<K, V>) -> Option<(Arc<DataBlock<K, V>>, usize)> {
        let mut current = self.try_get_previous_block(block)?;
        loop {
            match current.row_count() {
                0 => current = self.try_get_previous_block(&current)?,
                rows => return Some((current, rows - 1)),
            }
        }
    }

    /// Creates an initialized key/value cursor over this chain.
    pub fn cursor(self: &Arc<Self>) -> BlockCursor<K, V, KeyValueReader> {
        let mut cursor = BlockCursor::new(Arc::clone(self));
        cursor.initialize();
        cursor
    }
}

impl<K: Key> BlockChain<K, ()> {
    /// Creates an initialized cursor that reads keys only.
    pub fn key_cursor(self: &Arc<Self>) -> BlockCursor<K, (), KeyOnlyReader> {
        let mut cursor = BlockCursor::new(Arc::clone(self));
        cursor.initialize();
        cursor
    }
}

impl<K: Key, V: Element> Default for BlockChain<K, V> {
    fn default() -> Self {
        Self::new(ChainConfig::default())
    }
}

impl<K: Key, V: Element> Drop for BlockChain<K, V> {
    fn drop(&mut self) {
        for entry in self.index.iter() {
            let block = entry.value();
            block.set_linked(false);
            block.release();
        }
    }
}

impl<K: Key, V: Element> std::fmt::Debug for BlockChain<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockChain")
            .field("rows", &self.len())
            .field("blocks", &self.block_count())
            .field("order_version", &self.order_version())
            .field("mode", &self.config.mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Vector;

    fn block(keys: &[i64]) -> Arc<DataBlock<i64, f64>> {
        let values: Vec<f64> = keys.iter().map(|&k| k as f64).collect();
        DataBlock::create(
            Vector::from_slice(keys),
            Some(Vector::from_slice(&values)),
            Vec::new(),
            None,
        )
        .unwrap()
    }

    fn two_block_chain() -> BlockChain<i64, f64> {
        BlockChain::from_blocks(
            ChainConfig::default(),
            vec![block(&[1, 2, 3]), block(&[4, 5, 6])],
        )
        .unwrap()
    }

    #[test]
    fn test_from_blocks_links_and_counts() {
        let chain = two_block_chain();
        assert_eq!(chain.len(), 6);
        assert_eq!(chain.block_count(), 2);

        let first = chain.first_block().unwrap();
        let last = chain.last_block().unwrap();
        assert_eq!(first.ref_count(), 1);
        assert!(first.is_linked());
        assert!(Arc::ptr_eq(&chain.try_get_next_block(&first).unwrap(), &last));
        assert!(Arc::ptr_eq(&chain.try_get_previous_block(&last).unwrap(), &first));
        assert!(chain.try_get_next_block(&last).is_none());
        assert!(chain.try_get_previous_block(&first).is_none());
        assert!(chain.single_block().is_none());
    }

    #[test]
    fn test_from_blocks_rejects_overlap() {
        let err = BlockChain::from_blocks(
            ChainConfig::default(),
            vec![block(&[1, 2, 3]), block(&[3, 4])],
        )
        .unwrap_err();
        assert!(matches!(err, SeriesError::BlockOrderViolation { position: 1 }));
    }

    #[test]
    fn test_sentinel_has_no_neighbours() {
        let chain = two_block_chain();
        assert!(chain.try_get_next_block(chain.sentinel()).is_none());
        assert!(chain.try_get_previous_block(chain.sentinel()).is_none());
    }

    #[test]
    fn test_find_block_at_all_directions() {
        let chain = two_block_chain();
        let key_at = |key, lookup| {
            chain
                .try_find_block_at(key, lookup)
                .map(|(block, index)| block.row_key(index))
        };

        assert_eq!(key_at(5, Lookup::Eq), Some(5));
        assert_eq!(key_at(7, Lookup::Eq), None);

        assert_eq!(key_at(4, Lookup::Lt), Some(3));
        assert_eq!(key_at(1, Lookup::Lt), None);
        assert_eq!(key_at(100, Lookup::Le), Some(6));
        assert_eq!(key_at(0, Lookup::Le), None);

        assert_eq!(key_at(3, Lookup::Gt), Some(4));
        assert_eq!(key_at(6, Lookup::Gt), None);
        assert_eq!(key_at(-5, Lookup::Gt), Some(1));
        assert_eq!(key_at(0, Lookup::Ge), Some(1));
        assert_eq!(key_at(4, Lookup::Ge), Some(4));
    }

    #[test]
    fn test_drop_releases_blocks() {
        let chain = two_block_chain();
        let blocks = chain.blocks();
        drop(chain);
        assert!(blocks.iter().all(|b| b.is_disposed()));
    }

    #[test]
    fn test_validate_tracks_next_version() {
        let chain: BlockChain<i64, f64> = BlockChain::default();
        let snapshot = chain.order_version();
        assert!(chain.validate(snapshot));
        chain.next_order_version.fetch_add(1, Ordering::SeqCst);
        assert!(!chain.validate(snapshot));
    }

    #[test]
    fn test_config_builders() {
        let config = ChainConfig::default()
            .with_block_capacity(0)
            .with_mode(ChainMode::AppendOnly)
            .with_max_seek_retries(3);
        assert_eq!(config.block_capacity, 1);
        assert_eq!(config.mode, ChainMode::AppendOnly);
        assert_eq!(config.max_seek_retries, 3);
    }
}
