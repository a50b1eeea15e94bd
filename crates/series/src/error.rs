//! Error and Result types for series block and cursor operations.

use crate::block::{ElementType, RawKey};
use thiserror::Error;

/// A convenience `Result` type for series operations.
pub type Result<T> = std::result::Result<T, SeriesError>;

/// The error type for block, chain and cursor operations.
#[derive(Debug, Error)]
pub enum SeriesError {
    /// The cursor was never initialized or has already been disposed.
    #[error("Cursor is not initialized")]
    NotInitialized,

    /// The block was already disposed.
    #[error("Block is already disposed")]
    AlreadyDisposed,

    /// The shared empty sentinel block cannot be disposed.
    #[error("Cannot dispose the empty sentinel block")]
    SentinelDispose,

    /// The block is still referenced and cannot be disposed.
    #[error("Block is still in use: reference count {ref_count}")]
    BlockInUse {
        /// Reference count observed at the dispose attempt.
        ref_count: isize,
    },

    /// Vectors attached to one block have different lengths.
    #[error("Vector length mismatch: expected {expected}, got {actual}")]
    VectorLengthMismatch {
        /// Length of the row-key vector.
        expected: usize,
        /// Length of the offending vector.
        actual: usize,
    },

    /// Requested row length does not fit into the attached vectors.
    #[error("Row length {row_length} exceeds block capacity {capacity}")]
    RowLengthExceedsCapacity {
        /// Requested number of occupied rows.
        row_length: usize,
        /// Capacity of the attached vectors.
        capacity: usize,
    },

    /// A raw vector was viewed as the wrong element type.
    #[error("Element type mismatch: expected {expected}, got {actual}")]
    ElementTypeMismatch {
        /// Element type requested by the caller.
        expected: ElementType,
        /// Element type stored in the vector.
        actual: ElementType,
    },

    /// The series order changed under a directional cursor move.
    #[error("Series order changed under the cursor; last valid key {last_key}")]
    OutOfOrder {
        /// Last key the cursor was validly positioned on.
        last_key: RawKey,
    },

    /// A seek kept observing concurrent structural mutation.
    #[error("Seek gave up after {attempts} attempts under concurrent mutation")]
    SeekContention {
        /// Number of search attempts made.
        attempts: usize,
    },

    /// Appended key is not greater than the last key of the series.
    #[error("Out of order append: key {key} is not after the last key {last}")]
    OutOfOrderAppend {
        /// Rejected key.
        key: RawKey,
        /// Current last key of the series.
        last: RawKey,
    },

    /// Inserted key already exists in the series.
    #[error("Duplicate key: {0}")]
    DuplicateKey(RawKey),

    /// Structural mutation requested on an append-only series.
    #[error("Series is append-only")]
    AppendOnly,

    /// Blocks handed to a chain are not globally sorted.
    #[error("Block order violation at block {position}")]
    BlockOrderViolation {
        /// Position of the first block that breaks the ordering.
        position: usize,
    },
}

impl SeriesError {
    /// Returns true for errors a caller can recover from by re-seeking.
    pub fn is_concurrency_error(&self) -> bool {
        matches!(
            self,
            SeriesError::OutOfOrder { .. } | SeriesError::SeekContention { .. }
        )
    }
}
