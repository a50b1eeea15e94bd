//! Navigation over a block chain.
//!
//! A [`BlockCursor`] is a positioned reader over one [`BlockChain`]. It pins
//! the block it is positioned on, so the block's vectors stay valid while the
//! writer keeps mutating the chain.
//!
//! # States
//!
//! ```text
//! None ──initialize──▶ Initialized ──successful move──▶ Moving
//!  ▲                        ▲                              │
//!  └──────dispose───────────┴──────────reset───────────────┘
//! ```
//!
//! # Consistency
//!
//! Every move records the chain's order version before reading and validates
//! it afterwards. Seeks (`move_first`, `move_last`, `move_at`) retry on a
//! failed validation. Directional moves (`move_next`, `move_previous`,
//! `move_by`) cannot be retried because the relative position they started
//! from may no longer exist, so they fail with `SeriesError::OutOfOrder`
//! and leave the cursor on its last valid row. Cursors over append-only
//! chains skip validation.

mod reader;

pub use reader::{KeyOnlyReader, KeyValueReader, RowReader};

use crate::block::{DataBlock, Element, Lookup, RawKey};
use crate::chain::{BlockChain, Key};
use crate::error::{Result, SeriesError};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{trace, warn};

/// Lifecycle state of a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CursorState {
    /// Not usable: never initialized, or disposed.
    #[default]
    None,
    /// Attached to a chain but not positioned on a row.
    Initialized,
    /// Positioned on a row.
    Moving,
}

/// Cursor over the rows of a [`BlockChain`].
///
/// `R` selects how rows are extracted, see [`RowReader`].
pub struct BlockCursor<K: Key, V: Element, R: RowReader<K, V> = KeyValueReader> {
    source: Arc<BlockChain<K, V>>,
    block: Arc<DataBlock<K, V>>,
    block_index: isize,
    current_key: K,
    current_value: V,
    order_version: u64,
    state: CursorState,
    _reader: PhantomData<R>,
}

impl<K: Key, V: Element, R: RowReader<K, V>> BlockCursor<K, V, R> {
    /// Creates a cursor over `source` in state [`CursorState::None`].
    pub fn new(source: Arc<BlockChain<K, V>>) -> Self {
        let block = Arc::clone(source.sentinel());
        Self {
            source,
            block,
            block_index: -1,
            current_key: K::default(),
            current_value: V::default(),
            order_version: 0,
            state: CursorState::None,
            _reader: PhantomData,
        }
    }

    /// Attaches the cursor to its chain without positioning it.
    ///
    /// A chain with a single block is pinned right away.
    pub fn initialize(&mut self) {
        self.order_version = self.source.order_version();
        let block = self
            .source
            .single_block()
            .filter(|block| block.try_increment())
            .unwrap_or_else(|| Arc::clone(self.source.sentinel()));
        let previous = std::mem::replace(&mut self.block, block);
        previous.release();
        self.clear_position();
        self.state = CursorState::Initialized;
    }

    /// Returns the cursor to the unpositioned state.
    pub fn reset(&mut self) {
        self.initialize();
    }

    /// Releases the pinned block and returns to [`CursorState::None`].
    pub fn dispose(&mut self) {
        let sentinel = Arc::clone(self.source.sentinel());
        let previous = std::mem::replace(&mut self.block, sentinel);
        previous.release();
        self.clear_position();
        self.state = CursorState::None;
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> CursorState {
        self.state
    }

    /// Returns true if the cursor is positioned on a row.
    pub fn is_positioned(&self) -> bool {
        self.state == CursorState::Moving
    }

    /// Returns the current key, or the default key when not positioned.
    pub fn current_key(&self) -> K {
        self.current_key
    }

    /// Returns the current value, or the default value when not positioned.
    pub fn current_value(&self) -> V {
        self.current_value
    }

    /// Returns the current key/value pair.
    pub fn current(&self) -> (K, V) {
        (self.current_key, self.current_value)
    }

    /// Returns the logical row index inside the current block, or -1.
    pub fn block_index(&self) -> isize {
        self.block_index
    }

    /// Returns the block the cursor is pinned on (the sentinel if none).
    pub fn current_block(&self) -> &Arc<DataBlock<K, V>> {
        &self.block
    }

    /// Returns the chain this cursor reads.
    pub fn source(&self) -> &Arc<BlockChain<K, V>> {
        &self.source
    }

    /// Returns the order version the current position was validated at.
    pub fn order_version(&self) -> u64 {
        self.order_version
    }

    /// Moves to the first row. Returns false if the chain is empty.
    ///
    /// # Errors
    ///
    /// - `SeriesError::NotInitialized` in state [`CursorState::None`].
    /// - `SeriesError::SeekContention` if concurrent mutation outlasts the
    ///   retry budget.
    pub fn move_first(&mut self) -> Result<bool> {
        self.ensure_initialized()?;
        self.seek(|chain| chain.first_row())
    }

    /// Moves to the last row of the last block. Returns false if the chain
    /// is empty.
    ///
    /// # Errors
    ///
    /// Same as [`BlockCursor::move_first`].
    pub fn move_last(&mut self) -> Result<bool> {
        self.ensure_initialized()?;
        self.seek(|chain| chain.last_row())
    }

    /// Moves to the row selected by `key` and `lookup`.
    ///
    /// Returns false and leaves the cursor unchanged if no row qualifies.
    ///
    /// # Errors
    ///
    /// Same as [`BlockCursor::move_first`].
    pub fn move_at(&mut self, key: K, lookup: Lookup) -> Result<bool> {
        self.ensure_initialized()?;
        self.seek(|chain| chain.try_find_block_at(key, lookup))
    }

    /// Moves to the next row. An unpositioned cursor moves to the first row.
    ///
    /// # Errors
    ///
    /// - `SeriesError::NotInitialized` in state [`CursorState::None`].
    /// - `SeriesError::OutOfOrder` if the chain changed structurally since
    ///   the cursor was positioned.
    pub fn move_next(&mut self) -> Result<bool> {
        match self.state {
            CursorState::None => Err(SeriesError::NotInitialized),
            CursorState::Initialized => self.move_first(),
            CursorState::Moving => Ok(self.move_by(1, false)? == 1),
        }
    }

    /// Moves to the previous row. An unpositioned cursor moves to the last
    /// row.
    ///
    /// # Errors
    ///
    /// Same as [`BlockCursor::move_next`].
    pub fn move_previous(&mut self) -> Result<bool> {
        match self.state {
            CursorState::None => Err(SeriesError::NotInitialized),
            CursorState::Initialized => self.move_last(),
            CursorState::Moving => Ok(self.move_by(-1, false)? == -1),
        }
    }

    /// Moves `stride` rows forward (positive) or backward (negative).
    ///
    /// Returns the signed number of rows moved. If the chain ends before
    /// `stride` rows, the cursor stops on the last reachable row when
    /// `allow_partial` is set, and otherwise stays put and returns 0.
    ///
    /// An unpositioned cursor starts just before the first row (forward) or
    /// just after the last row (backward).
    ///
    /// # Errors
    ///
    /// Same as [`BlockCursor::move_next`].
    pub fn move_by(&mut self, stride: i64, allow_partial: bool) -> Result<i64> {
        self.ensure_initialized()?;
        if stride == 0 {
            return Ok(0);
        }
        if self.state == CursorState::Initialized {
            return self.move_from_start(stride, allow_partial);
        }

        let version = self.order_version;
        let target = (self.block_index as i64)
            .checked_add(stride)
            .filter(|&target| target >= 0 && target < self.block.row_count() as i64);
        if let Some(target) = target {
            let index = target as usize;
            let (key, value) = R::read(&*self.block, index);
            if !self.validate(version) {
                return Err(self.out_of_order());
            }
            self.block_index = index as isize;
            self.current_key = key;
            self.current_value = value;
            return Ok(stride);
        }

        self.move_across(stride, allow_partial, version)
    }

    fn move_across(&mut self, stride: i64, allow_partial: bool, version: u64) -> Result<i64> {
        let forward = stride > 0;
        let step = stride.signum();
        // Unsigned so that i64::MIN has a magnitude.
        let mut remaining = stride.unsigned_abs();
        let mut moved = 0u64;
        let mut block = Arc::clone(&self.block);
        let mut index = self.block_index as i64;
        let mut landing: Option<(Arc<DataBlock<K, V>>, i64)> = None;

        loop {
            let rows = block.row_count() as i64;
            let available = (if forward { rows - 1 - index } else { index }).max(0) as u64;
            if available >= remaining {
                index += step * remaining as i64;
                moved += remaining;
                remaining = 0;
                landing = Some((block, index));
                break;
            }
            if available > 0 {
                index += step * available as i64;
                moved += available;
                remaining -= available;
                landing = Some((Arc::clone(&block), index));
            }

            let neighbour = if forward {
                // A partial block without a successor link is the tail.
                if !block.is_full() && !block.has_next_link() {
                    None
                } else {
                    self.source.try_get_next_block(&block)
                }
            } else {
                self.source.try_get_previous_block(&block)
            };
            let Some(neighbour) = neighbour else {
                break;
            };
            index = if forward {
                -1
            } else {
                neighbour.row_count() as i64
            };
            block = neighbour;
        }

        let landing = match landing {
            Some(landing) if remaining == 0 || allow_partial => landing,
            _ => {
                if !self.validate(version) {
                    return Err(self.out_of_order());
                }
                return Ok(0);
            }
        };

        let (block, index) = landing;
        if !self.pin(&block) {
            return Err(self.out_of_order());
        }
        let (key, value) = R::read(&*block, index as usize);
        if !self.validate(version) {
            self.unpin(&block);
            return Err(self.out_of_order());
        }
        debug_assert!(
            index >= 0 && (index as usize) < block.row_count(),
            "cross-block move landed outside the block"
        );
        self.commit(block, index as usize, key, value, version);
        Ok(moved as i64 * step)
    }

    fn move_from_start(&mut self, stride: i64, allow_partial: bool) -> Result<i64> {
        let step = stride.signum();
        let entered = if step > 0 {
            self.move_first()?
        } else {
            self.move_last()?
        };
        if !entered {
            return Ok(0);
        }
        let rest = stride - step;
        if rest == 0 {
            return Ok(stride);
        }
        match self.move_by(rest, allow_partial) {
            Ok(moved) if moved == rest => Ok(stride),
            Ok(moved) if allow_partial => Ok(moved + step),
            Ok(_) => {
                self.initialize();
                Ok(0)
            }
            Err(err) => {
                self.initialize();
                Err(err)
            }
        }
    }

    /// Runs a retrying seek. `locate` is re-run against a fresh version
    /// snapshot after every failed validation.
    fn seek<F>(&mut self, mut locate: F) -> Result<bool>
    where
        F: FnMut(&BlockChain<K, V>) -> Option<(Arc<DataBlock<K, V>>, usize)>,
    {
        let attempts = self.source.config().max_seek_retries;
        for attempt in 0..attempts {
            let version = self.source.order_version();
            match locate(&*self.source) {
                None => {
                    if self.validate(version) {
                        return Ok(false);
                    }
                }
                Some((block, index)) => {
                    if self.pin(&block) {
                        let (key, value) = R::read(&*block, index);
                        if self.validate(version) {
                            self.commit(block, index, key, value, version);
                            return Ok(true);
                        }
                        self.unpin(&block);
                    }
                }
            }
            trace!("Seek retry: attempt={}, version={}", attempt + 1, version);
            std::hint::spin_loop();
        }
        warn!(
            "Cursor seek gave up under concurrent mutation: attempts={}",
            attempts
        );
        Err(SeriesError::SeekContention { attempts })
    }

    fn validate(&self, version: u64) -> bool {
        self.source.is_append_only() || self.source.validate(version)
    }

    /// Pins `block` unless it is already the cursor's block.
    fn pin(&self, block: &Arc<DataBlock<K, V>>) -> bool {
        Arc::ptr_eq(&self.block, block) || block.try_increment()
    }

    /// Undoes a [`Self::pin`] that was not committed.
    fn unpin(&self, block: &Arc<DataBlock<K, V>>) {
        if !Arc::ptr_eq(&self.block, block) {
            block.release();
        }
    }

    fn commit(&mut self, block: Arc<DataBlock<K, V>>, index: usize, key: K, value: V, version: u64) {
        if !Arc::ptr_eq(&self.block, &block) {
            let previous = std::mem::replace(&mut self.block, block);
            previous.release();
        }
        self.block_index = index as isize;
        self.current_key = key;
        self.current_value = value;
        self.order_version = version;
        self.state = CursorState::Moving;
    }

    fn clear_position(&mut self) {
        self.block_index = -1;
        self.current_key = K::default();
        self.current_value = V::default();
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.state == CursorState::None {
            return Err(SeriesError::NotInitialized);
        }
        Ok(())
    }

    fn out_of_order(&self) -> SeriesError {
        SeriesError::OutOfOrder {
            last_key: RawKey::new(self.current_key),
        }
    }
}

impl<K: Key, V: Element, R: RowReader<K, V>> Clone for BlockCursor<K, V, R> {
    /// Clones the cursor with its position; the clone holds its own pin.
    fn clone(&self) -> Self {
        self.block.increment();
        Self {
            source: Arc::clone(&self.source),
            block: Arc::clone(&self.block),
            block_index: self.block_index,
            current_key: self.current_key,
            current_value: self.current_value,
            order_version: self.order_version,
            state: self.state,
            _reader: PhantomData,
        }
    }
}

impl<K: Key, V: Element, R: RowReader<K, V>> Drop for BlockCursor<K, V, R> {
    fn drop(&mut self) {
        self.block.release();
    }
}

impl<K: Key, V: Element, R: RowReader<K, V>> fmt::Debug for BlockCursor<K, V, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockCursor")
            .field("state", &self.state)
            .field("block_index", &self.block_index)
            .field("current_key", &self.current_key)
            .field("current_value", &self.current_value)
            .field("order_version", &self.order_version)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainConfig;

    fn series(capacity: usize, keys: impl IntoIterator<Item = i64>) -> Arc<BlockChain<i64, f64>> {
        let chain = BlockChain::new(ChainConfig::default().with_block_capacity(capacity));
        for key in keys {
            chain.append(key, key as f64 * 10.0).unwrap();
        }
        Arc::new(chain)
    }

    #[test]
    fn test_new_cursor_is_not_initialized() {
        let chain = series(4, 0..3);
        let mut cursor: BlockCursor<i64, f64> = BlockCursor::new(chain);
        assert_eq!(cursor.state(), CursorState::None);
        assert!(matches!(cursor.move_next(), Err(SeriesError::NotInitialized)));
        assert!(matches!(cursor.move_by(1, true), Err(SeriesError::NotInitialized)));
        assert!(matches!(
            cursor.move_at(1, Lookup::Eq),
            Err(SeriesError::NotInitialized)
        ));
    }

    #[test]
    fn test_initialize_pins_single_block() {
        let chain = series(8, 0..3);
        let block = chain.first_block().unwrap();
        let cursor = chain.cursor();
        assert_eq!(cursor.state(), CursorState::Initialized);
        assert!(Arc::ptr_eq(cursor.current_block(), &block));
        assert_eq!(block.ref_count(), 2);
        drop(cursor);
        assert_eq!(block.ref_count(), 1);
    }

    #[test]
    fn test_forward_and_backward_walk() {
        let chain = series(3, 0..7);
        let mut cursor = chain.cursor();

        let mut keys = Vec::new();
        while cursor.move_next().unwrap() {
            keys.push(cursor.current_key());
        }
        assert_eq!(keys, (0..7).collect::<Vec<_>>());
        // Failed move leaves the cursor on the last row.
        assert_eq!(cursor.current(), (6, 60.0));

        let mut back = Vec::new();
        cursor.reset();
        while cursor.move_previous().unwrap() {
            back.push(cursor.current_key());
        }
        assert_eq!(back, (0..7).rev().collect::<Vec<_>>());
    }

    #[test]
    fn test_move_by_exact_and_partial() {
        let chain = series(4, 0..10);
        let mut cursor = chain.cursor();
        assert!(cursor.move_first().unwrap());

        assert_eq!(cursor.move_by(5, false).unwrap(), 5);
        assert_eq!(cursor.current_key(), 5);

        assert_eq!(cursor.move_by(10, false).unwrap(), 0);
        assert_eq!(cursor.current_key(), 5);

        assert_eq!(cursor.move_by(10, true).unwrap(), 4);
        assert_eq!(cursor.current_key(), 9);

        assert_eq!(cursor.move_by(-20, true).unwrap(), -9);
        assert_eq!(cursor.current_key(), 0);
    }

    #[test]
    fn test_move_by_extreme_strides() {
        let chain = series(4, 0..10);
        let mut cursor = chain.cursor();
        assert!(cursor.move_at(1, Lookup::Eq).unwrap());

        assert_eq!(cursor.move_by(i64::MAX, false).unwrap(), 0);
        assert_eq!(cursor.current_key(), 1);
        assert_eq!(cursor.move_by(i64::MAX, true).unwrap(), 8);
        assert_eq!(cursor.current_key(), 9);

        assert_eq!(cursor.move_by(i64::MIN, false).unwrap(), 0);
        assert_eq!(cursor.current_key(), 9);
        assert_eq!(cursor.move_by(i64::MIN, true).unwrap(), -9);
        assert_eq!(cursor.current_key(), 0);

        cursor.reset();
        assert_eq!(cursor.move_by(i64::MAX, false).unwrap(), 0);
        assert_eq!(cursor.state(), CursorState::Initialized);
        assert_eq!(cursor.move_by(i64::MIN, true).unwrap(), -10);
        assert_eq!(cursor.current_key(), 0);
    }

    #[test]
    fn test_move_by_from_unpositioned() {
        let chain = series(4, 0..10);
        let mut cursor = chain.cursor();
        assert_eq!(cursor.move_by(3, false).unwrap(), 3);
        assert_eq!(cursor.current_key(), 2);

        cursor.reset();
        assert_eq!(cursor.move_by(-2, false).unwrap(), -2);
        assert_eq!(cursor.current_key(), 8);

        cursor.reset();
        assert_eq!(cursor.move_by(11, false).unwrap(), 0);
        assert_eq!(cursor.state(), CursorState::Initialized);
        assert_eq!(cursor.move_by(11, true).unwrap(), 10);
        assert_eq!(cursor.current_key(), 9);
    }

    #[test]
    fn test_move_at_lookups() {
        let chain = series(3, (0..10).map(|k| k * 2));
        let mut cursor = chain.cursor();

        assert!(cursor.move_at(6, Lookup::Eq).unwrap());
        assert_eq!(cursor.current(), (6, 60.0));

        assert!(!cursor.move_at(7, Lookup::Eq).unwrap());
        assert_eq!(cursor.current_key(), 6);

        assert!(cursor.move_at(7, Lookup::Lt).unwrap());
        assert_eq!(cursor.current_key(), 6);
        assert!(cursor.move_at(7, Lookup::Gt).unwrap());
        assert_eq!(cursor.current_key(), 8);
        assert!(cursor.move_at(6, Lookup::Le).unwrap());
        assert_eq!(cursor.current_key(), 6);
        assert!(cursor.move_at(6, Lookup::Ge).unwrap());
        assert_eq!(cursor.current_key(), 6);

        assert!(!cursor.move_at(18, Lookup::Gt).unwrap());
        assert!(!cursor.move_at(0, Lookup::Lt).unwrap());
        assert_eq!(cursor.current_key(), 6);
    }

    #[test]
    fn test_structural_change_fails_directional_move() {
        let chain = series(4, 0..8);
        let mut cursor = chain.cursor();
        cursor.move_at(2, Lookup::Eq).unwrap();

        chain.remove(5).unwrap();

        match cursor.move_next() {
            Err(SeriesError::OutOfOrder { last_key }) => assert_eq!(last_key.get::<i64>(), Some(2)),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(cursor.current_key(), 2);

        // A seek revalidates against the new version.
        assert!(cursor.move_at(2, Lookup::Eq).unwrap());
        assert!(cursor.move_next().unwrap());
        assert_eq!(cursor.current_key(), 3);
    }

    #[test]
    fn test_seek_gives_up_during_structural_change() {
        let chain: Arc<BlockChain<i64, f64>> = Arc::new(BlockChain::new(
            ChainConfig::default()
                .with_block_capacity(4)
                .with_max_seek_retries(3),
        ));
        for key in 0..8i64 {
            chain.append(key, 0.0).unwrap();
        }
        let mut cursor = chain.cursor();
        cursor.move_at(5, Lookup::Eq).unwrap();

        let (seek, step) = chain.structural(|| (cursor.move_first(), cursor.move_next()));

        assert!(matches!(seek, Err(SeriesError::SeekContention { attempts: 3 })));
        assert!(matches!(step, Err(SeriesError::OutOfOrder { .. })));
        assert_eq!(cursor.current_key(), 5);
        assert!(cursor.move_first().unwrap());
        assert_eq!(cursor.current_key(), 0);
    }

    #[test]
    fn test_append_does_not_invalidate() {
        let chain = series(4, 0..3);
        let mut cursor = chain.cursor();
        assert!(cursor.move_last().unwrap());
        assert!(!cursor.move_next().unwrap());

        chain.append(3, 30.0).unwrap();
        chain.append(4, 40.0).unwrap();

        assert!(cursor.move_next().unwrap());
        assert_eq!(cursor.current_key(), 3);
        assert!(cursor.move_next().unwrap());
        assert_eq!(cursor.current_key(), 4);
    }

    #[test]
    fn test_pins_follow_cursor() {
        let chain = series(2, 0..4);
        let blocks = chain.blocks();
        let mut cursor = chain.cursor();

        cursor.move_first().unwrap();
        assert_eq!(blocks[0].ref_count(), 2);
        cursor.move_by(2, false).unwrap();
        assert_eq!(blocks[0].ref_count(), 1);
        assert_eq!(blocks[1].ref_count(), 2);

        let copy = cursor.clone();
        assert_eq!(blocks[1].ref_count(), 3);
        assert_eq!(copy.current_key(), 2);

        cursor.dispose();
        assert_eq!(cursor.state(), CursorState::None);
        assert_eq!(cursor.current_key(), 0);
        assert_eq!(cursor.block_index(), -1);
        drop(copy);
        assert_eq!(blocks[1].ref_count(), 1);
    }

    #[test]
    fn test_pinned_block_outlives_removal() {
        let chain = series(4, 0..4);
        let mut cursor = chain.cursor();
        cursor.move_at(1, Lookup::Eq).unwrap();
        let block = Arc::clone(cursor.current_block());

        chain.remove(3).unwrap();
        assert!(!block.is_linked());
        assert!(!block.is_disposed());
        assert_eq!(block.row_key(1), 1);

        cursor.dispose();
        assert!(block.is_disposed());
    }

    #[test]
    fn test_key_only_cursor() {
        let chain: Arc<BlockChain<u64, ()>> = Arc::new(BlockChain::default());
        for key in [3, 5, 8] {
            chain.append(key, ()).unwrap();
        }
        let mut cursor = chain.key_cursor();
        assert!(cursor.move_at(4, Lookup::Ge).unwrap());
        assert_eq!(cursor.current(), (5, ()));
    }

    #[test]
    fn test_key_only_reader_over_values() {
        let chain = series(4, 0..3);
        let mut cursor: BlockCursor<i64, f64, KeyOnlyReader> = BlockCursor::new(chain);
        cursor.initialize();
        assert!(cursor.move_last().unwrap());
        assert_eq!(cursor.current(), (2, 0.0));
    }
}
