//! Row extraction strategies.
//!
//! A cursor is generic over a [`RowReader`], so the choice between reading
//! key/value pairs and reading keys only is resolved at compile time.

use crate::block::{DataBlock, Element};

/// Extracts the row at a logical index of a block.
pub trait RowReader<K: Element, V: Element>: Send + Sync + 'static {
    /// Reads the key and value of row `index`.
    fn read(block: &DataBlock<K, V>, index: usize) -> (K, V);
}

/// Reads keys and values.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyValueReader;

impl<K: Element, V: Element> RowReader<K, V> for KeyValueReader {
    #[inline]
    fn read(block: &DataBlock<K, V>, index: usize) -> (K, V) {
        block.row(index)
    }
}

/// Reads keys only; the value is always `V::default()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyOnlyReader;

impl<K: Element, V: Element> RowReader<K, V> for KeyOnlyReader {
    #[inline]
    fn read(block: &DataBlock<K, V>, index: usize) -> (K, V) {
        (block.row_key(index), V::default())
    }
}
