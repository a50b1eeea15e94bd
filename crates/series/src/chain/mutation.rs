//! Writer-side operations of a block chain.
//!
//! All mutations take the chain's writer lock. Structural mutations follow
//! the order-version protocol:
//!
//! 1. advance `next_order_version` (readers validating against an older
//!    snapshot now fail)
//! 2. mutate blocks, links and the index
//! 3. publish `order_version = next_order_version`
//!
//! Middle-of-chain changes never touch a block a reader may be scanning:
//! the affected block is rebuilt into fresh blocks and swapped in. Eviction
//! of the oldest row is done in place by advancing the block's ring head.

use super::{BlockChain, Key};
use crate::block::{DataBlock, Element, ElementType, Lookup, RawKey};
use crate::error::{Result, SeriesError};
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;
use tracing::debug;

impl<K: Key, V: Element> BlockChain<K, V> {
    /// Appends a row after the last row of the series.
    ///
    /// Appends are visible to cursors without advancing the order version.
    ///
    /// # Errors
    ///
    /// Returns `SeriesError::OutOfOrderAppend` if `key` is not greater than
    /// the current last key.
    pub fn append(&self, key: K, value: V) -> Result<()> {
        let _writer = self.writer.lock();
        self.append_locked(key, value)
    }

    /// Inserts a row at its key position.
    ///
    /// Keys after the last row are appended. Any other position rebuilds the
    /// block that receives the row, splitting it if it overflows.
    ///
    /// # Errors
    ///
    /// - `SeriesError::DuplicateKey` if the key already exists.
    /// - `SeriesError::AppendOnly` if the insert is not an append and the
    ///   chain is append-only.
    pub fn insert(&self, key: K, value: V) -> Result<()> {
        let _writer = self.writer.lock();

        let last_key = self.last_row().map(|(block, index)| block.row_key(index));
        match last_key {
            None => return self.append_locked(key, value),
            Some(last) if key > last => return self.append_locked(key, value),
            Some(_) => {}
        }
        self.ensure_mutable()?;

        let candidate = self
            .index
            .range(..=key)
            .next_back()
            .map(|entry| Arc::clone(entry.value()))
            .or_else(|| self.first_row().map(|(block, _)| block));
        let Some(block) = candidate else {
            return self.append_locked(key, value);
        };

        let position = match block.search_key(&key) {
            Ok(_) => return Err(SeriesError::DuplicateKey(RawKey::new(key))),
            Err(position) => position,
        };
        let mut rows = collect_rows(&block);
        rows.insert(position, (key, value));

        self.structural(|| self.replace_block(&block, &rows))?;
        self.row_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Removes the row with `key`. Returns false if there is no such row.
    ///
    /// # Errors
    ///
    /// Returns `SeriesError::AppendOnly` if the chain is append-only.
    pub fn remove(&self, key: K) -> Result<bool> {
        let _writer = self.writer.lock();
        self.ensure_mutable()?;

        let Some((block, index)) = self.try_find_block_at(key, Lookup::Eq) else {
            return Ok(false);
        };
        let mut rows = collect_rows(&block);
        rows.remove(index);

        self.structural(|| self.replace_block(&block, &rows))?;
        self.row_count.fetch_sub(1, Ordering::AcqRel);
        Ok(true)
    }

    /// Evicts and returns the oldest row.
    ///
    /// The first block is modified in place. A block emptied this way is
    /// unlinked unless it is the only block, which stays for reuse by later
    /// appends.
    ///
    /// # Errors
    ///
    /// Returns `SeriesError::AppendOnly` if the chain is append-only.
    pub fn remove_first(&self) -> Result<Option<(K, V)>> {
        let _writer = self.writer.lock();
        self.ensure_mutable()?;

        let Some((block, _)) = self.first_row() else {
            return Ok(None);
        };
        let row = self.structural(|| {
            let old_key = block.index_key();
            let row = block.pop_front_row();
            match block.first_key() {
                Some(new_key) => {
                    self.index.insert(new_key, Arc::clone(&block));
                    self.index.remove(&old_key);
                    block.set_index_key(new_key);
                }
                None if self.block_count() > 1 => self.unlink(&block),
                None => {}
            }
            row
        });
        if row.is_some() {
            self.row_count.fetch_sub(1, Ordering::AcqRel);
        }
        Ok(row)
    }

    fn append_locked(&self, key: K, value: V) -> Result<()> {
        let last = self.last_block();
        if let Some(last_key) = last.as_ref().and_then(|block| block.last_key()) {
            if key <= last_key {
                return Err(SeriesError::OutOfOrderAppend {
                    key: RawKey::new(key),
                    last: RawKey::new(last_key),
                });
            }
        }

        match last {
            Some(block) if !block.is_full() => {
                if block.is_empty() {
                    // Only a lone block is kept empty; register it under its new first key.
                    let old_key = block.index_key();
                    self.index.insert(key, Arc::clone(&block));
                    if old_key != key {
                        self.index.remove(&old_key);
                    }
                }
                block.push_row(key, value);
            }
            last => {
                let block = self.rent_block(self.config.block_capacity)?;
                block.push_row(key, value);
                self.link_last(last.as_ref(), &block);
            }
        }
        self.row_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Links `block` after `last` as the new tail and takes the chain's
    /// reference on it.
    pub(super) fn link_last(&self, last: Option<&Arc<DataBlock<K, V>>>, block: &Arc<DataBlock<K, V>>) {
        block.increment();
        block.set_linked(true);
        self.index.insert(block.index_key(), Arc::clone(block));
        if let Some(last) = last {
            block.link_after(last);
        }
        debug!(
            "Linked block: capacity={}, rows={}, blocks={}",
            block.row_capacity(),
            block.row_count(),
            self.index.len()
        );
    }

    /// Replaces `old` with fresh blocks holding `rows`.
    ///
    /// The fresh blocks are fully built before the chain is touched.
    fn replace_block(&self, old: &Arc<DataBlock<K, V>>, rows: &[(K, V)]) -> Result<()> {
        let previous = self.try_get_previous_block(old);
        let next = self.try_get_next_block(old);
        let old_rows = old.row_count();

        let capacity = self.config.block_capacity.max(old.row_capacity());
        let mut fresh = Vec::new();
        if !rows.is_empty() {
            let pieces = (rows.len() + capacity - 1) / capacity;
            let piece_len = (rows.len() + pieces - 1) / pieces;
            for piece in rows.chunks(piece_len) {
                let block = self.rent_block(capacity)?;
                for &(key, value) in piece {
                    block.push_row(key, value);
                }
                fresh.push(block);
            }
        }

        for block in &fresh {
            block.increment();
            block.set_linked(true);
        }
        let old_key = old.index_key();
        if fresh.first().map_or(true, |block| block.index_key() != old_key) {
            self.index.remove(&old_key);
        }
        for block in &fresh {
            self.index.insert(block.index_key(), Arc::clone(block));
        }

        let mut left = previous;
        for block in &fresh {
            if let Some(left) = &left {
                block.link_after(left);
            }
            left = Some(Arc::clone(block));
        }
        if let (Some(left), Some(next)) = (left, next) {
            next.link_after(&left);
        }

        old.set_linked(false);
        old.release();
        debug!(
            "Replaced block: old_rows={}, new_rows={}, new_blocks={}",
            old_rows,
            rows.len(),
            fresh.len()
        );
        Ok(())
    }

    fn unlink(&self, block: &Arc<DataBlock<K, V>>) {
        self.index.remove(&block.index_key());
        block.set_linked(false);
        block.release();
        debug!("Unlinked empty block: blocks={}", self.index.len());
    }

    fn rent_block(&self, capacity: usize) -> Result<Arc<DataBlock<K, V>>> {
        let row_keys = self.pool.rent::<K>(capacity);
        let values =
            (V::ELEMENT_TYPE != ElementType::Unit).then(|| self.pool.rent::<V>(capacity));
        DataBlock::create(row_keys, values, Vec::new(), Some(0))
    }

    fn ensure_mutable(&self) -> Result<()> {
        if self.is_append_only() {
            return Err(SeriesError::AppendOnly);
        }
        Ok(())
    }

    /// Runs a structural mutation between the two order-version steps.
    pub(crate) fn structural<T>(&self, mutate: impl FnOnce() -> T) -> T {
        let version = self.next_order_version.fetch_add(1, Ordering::SeqCst) + 1;
        fence(Ordering::Release);
        let result = mutate();
        self.order_version.store(version, Ordering::Release);
        result
    }
}

fn collect_rows<K: Element, V: Element>(block: &DataBlock<K, V>) -> Vec<(K, V)> {
    (0..block.row_count()).map(|index| block.row(index)).collect()
}
