//! Series - Alopex Columnar Block Storage Core
//!
//! This crate provides the in-memory storage and navigation primitives for
//! ordered key/value series: fixed-capacity columnar blocks, the block chain
//! that owns them, and cursors that read the chain while a single writer
//! keeps mutating it.
//!
//! # Components
//!
//! - [`Vector`] / [`BlockPool`]: shared, pooled element storage
//! - [`DataBlock`]: columnar ring-buffer block with a reference-counted lifetime
//! - [`BlockChain`]: ordered container of blocks with an order version
//! - [`BlockCursor`]: state machine for seeks and directional moves
//!
//! # Example
//!
//! ```rust
//! use alopex_series::{BlockChain, ChainConfig, Lookup};
//! use std::sync::Arc;
//!
//! let series: Arc<BlockChain<i64, f64>> = Arc::new(BlockChain::new(ChainConfig::default()));
//! for ts in 0..10 {
//!     series.append(ts, ts as f64 * 0.5)?;
//! }
//!
//! let mut cursor = series.cursor();
//! assert!(cursor.move_at(4, Lookup::Ge)?);
//! assert_eq!(cursor.current(), (4, 2.0));
//! assert!(cursor.move_next()?);
//! assert_eq!(cursor.current_key(), 5);
//! # Ok::<(), alopex_series::SeriesError>(())
//! ```

#![deny(missing_docs)]

pub mod block;
pub mod chain;
pub mod cursor;
pub mod error;

pub use block::{
    BlockPool, DataBlock, Element, ElementType, Lookup, PoolConfig, RawKey, RawVector, Vector,
};
pub use chain::{BlockChain, ChainConfig, ChainMode, Key, KeySeries, Series};
pub use cursor::{BlockCursor, CursorState, KeyOnlyReader, KeyValueReader, RowReader};
pub use error::{Result, SeriesError};
