//! Typed, fixed-length, reference-counted slot vectors.
//!
//! A [`Vector`] is the leaf storage of a [`DataBlock`](super::DataBlock): one
//! column of row keys, row values or an extra column. Every element occupies a
//! single 64-bit slot stored as an [`AtomicU64`], which lets the single writer
//! of a series publish new rows while readers load existing ones without any
//! lock and without data races.
//!
//! The backing allocation is shared through an [`Arc`]. Cloning a vector is
//! cheap and shares the allocation; when the last handle drops, the buffer is
//! handed back to the [`BlockPool`](super::BlockPool) it was rented from.

use crate::error::{Result, SeriesError};
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use super::pool::PoolShared;

/// Runtime type tag of the elements stored in a vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ElementType {
    /// Zero-sized element, used by pure-key series.
    Unit = 0,
    /// Boolean.
    Bool = 1,
    /// Signed 32-bit integer.
    I32 = 2,
    /// Unsigned 32-bit integer.
    U32 = 3,
    /// Signed 64-bit integer (timestamps).
    I64 = 4,
    /// Unsigned 64-bit integer.
    U64 = 5,
    /// 32-bit float.
    F32 = 6,
    /// 64-bit float.
    F64 = 7,
}

impl ElementType {
    /// Returns the lowercase type name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Unit => "unit",
            Self::Bool => "bool",
            Self::I32 => "i32",
            Self::U32 => "u32",
            Self::I64 => "i64",
            Self::U64 => "u64",
            Self::F32 => "f32",
            Self::F64 => "f64",
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A scalar that fits into one 64-bit vector slot.
pub trait Element: Copy + Default + Send + Sync + fmt::Debug + 'static {
    /// Type tag stored alongside vectors of this element.
    const ELEMENT_TYPE: ElementType;

    /// Encodes the value into slot bits.
    fn to_bits(self) -> u64;

    /// Decodes a value previously encoded with [`Element::to_bits`].
    fn from_bits(bits: u64) -> Self;
}

impl Element for () {
    const ELEMENT_TYPE: ElementType = ElementType::Unit;

    fn to_bits(self) -> u64 {
        0
    }

    fn from_bits(_bits: u64) -> Self {}
}

impl Element for bool {
    const ELEMENT_TYPE: ElementType = ElementType::Bool;

    fn to_bits(self) -> u64 {
        self as u64
    }

    fn from_bits(bits: u64) -> Self {
        bits != 0
    }
}

impl Element for i32 {
    const ELEMENT_TYPE: ElementType = ElementType::I32;

    fn to_bits(self) -> u64 {
        self as u32 as u64
    }

    fn from_bits(bits: u64) -> Self {
        bits as u32 as i32
    }
}

impl Element for u32 {
    const ELEMENT_TYPE: ElementType = ElementType::U32;

    fn to_bits(self) -> u64 {
        self as u64
    }

    fn from_bits(bits: u64) -> Self {
        bits as u32
    }
}

impl Element for i64 {
    const ELEMENT_TYPE: ElementType = ElementType::I64;

    fn to_bits(self) -> u64 {
        self as u64
    }

    fn from_bits(bits: u64) -> Self {
        bits as i64
    }
}

impl Element for u64 {
    const ELEMENT_TYPE: ElementType = ElementType::U64;

    fn to_bits(self) -> u64 {
        self
    }

    fn from_bits(bits: u64) -> Self {
        bits
    }
}

impl Element for f32 {
    const ELEMENT_TYPE: ElementType = ElementType::F32;

    fn to_bits(self) -> u64 {
        f32::to_bits(self) as u64
    }

    fn from_bits(bits: u64) -> Self {
        f32::from_bits(bits as u32)
    }
}

impl Element for f64 {
    const ELEMENT_TYPE: ElementType = ElementType::F64;

    fn to_bits(self) -> u64 {
        f64::to_bits(self)
    }

    fn from_bits(bits: u64) -> Self {
        f64::from_bits(bits)
    }
}

/// A single element detached from its vector, tagged with its type.
///
/// Errors carry keys in this form so that [`SeriesError`] does not need to be
/// generic over the key type. Use [`RawKey::get`] to recover the typed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawKey {
    element_type: ElementType,
    bits: u64,
}

impl RawKey {
    /// Captures a typed element.
    pub fn new<T: Element>(value: T) -> Self {
        Self {
            element_type: T::ELEMENT_TYPE,
            bits: value.to_bits(),
        }
    }

    /// Returns the element type of the captured value.
    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    /// Returns the typed value, or `None` if `T` is not the captured type.
    pub fn get<T: Element>(&self) -> Option<T> {
        (T::ELEMENT_TYPE == self.element_type).then(|| T::from_bits(self.bits))
    }
}

impl fmt::Display for RawKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.element_type {
            ElementType::Unit => write!(f, "()"),
            ElementType::Bool => write!(f, "{}", bool::from_bits(self.bits)),
            ElementType::I32 => write!(f, "{}", i32::from_bits(self.bits)),
            ElementType::U32 => write!(f, "{}", u32::from_bits(self.bits)),
            ElementType::I64 => write!(f, "{}", i64::from_bits(self.bits)),
            ElementType::U64 => write!(f, "{}", self.bits),
            ElementType::F32 => write!(f, "{}", <f32 as Element>::from_bits(self.bits)),
            ElementType::F64 => write!(f, "{}", <f64 as Element>::from_bits(self.bits)),
        }
    }
}

/// Backing allocation of a vector.
pub(crate) struct SlotBuffer {
    slots: Box<[AtomicU64]>,
    pool: Option<Weak<PoolShared>>,
}

impl SlotBuffer {
    pub(crate) fn unpooled(len: usize) -> Self {
        Self {
            slots: zeroed_slots(len),
            pool: None,
        }
    }

    pub(crate) fn pooled(slots: Box<[AtomicU64]>, pool: Weak<PoolShared>) -> Self {
        Self {
            slots,
            pool: Some(pool),
        }
    }
}

impl Drop for SlotBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take().and_then(|pool| pool.upgrade()) {
            pool.give_back(mem::take(&mut self.slots));
        }
    }
}

pub(crate) fn zeroed_slots(len: usize) -> Box<[AtomicU64]> {
    (0..len).map(|_| AtomicU64::new(0)).collect()
}

/// Untyped vector: a slot buffer plus its element type tag.
#[derive(Clone)]
pub struct RawVector {
    element_type: ElementType,
    buffer: Arc<SlotBuffer>,
}

impl RawVector {
    /// Creates an unpooled, zero-filled vector.
    pub fn new(element_type: ElementType, len: usize) -> Self {
        Self::from_buffer(element_type, SlotBuffer::unpooled(len))
    }

    pub(crate) fn from_buffer(element_type: ElementType, buffer: SlotBuffer) -> Self {
        Self {
            element_type,
            buffer: Arc::new(buffer),
        }
    }

    /// Returns the element type tag.
    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    /// Returns the fixed number of slots.
    pub fn len(&self) -> usize {
        self.buffer.slots.len()
    }

    /// Returns true if the vector has no slots.
    pub fn is_empty(&self) -> bool {
        self.buffer.slots.is_empty()
    }

    /// Returns the number of handles sharing the backing allocation.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.buffer)
    }

    /// Returns true if both vectors share one backing allocation.
    pub fn shares_allocation(&self, other: &RawVector) -> bool {
        Arc::ptr_eq(&self.buffer, &other.buffer)
    }

    /// Loads the raw bits of slot `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= len()`.
    #[inline]
    pub fn load_bits(&self, index: usize) -> u64 {
        self.buffer.slots[index].load(Ordering::Relaxed)
    }

    /// Stores raw bits into slot `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= len()`.
    #[inline]
    pub fn store_bits(&self, index: usize, bits: u64) {
        self.buffer.slots[index].store(bits, Ordering::Relaxed);
    }
}

impl fmt::Debug for RawVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawVector")
            .field("element_type", &self.element_type)
            .field("len", &self.len())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

/// Typed view over a [`RawVector`].
pub struct Vector<T: Element> {
    raw: RawVector,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Element> Vector<T> {
    /// Creates an unpooled vector of `len` default-valued elements.
    pub fn new(len: usize) -> Self {
        let vector = Self::wrap(RawVector::new(T::ELEMENT_TYPE, len));
        if T::default().to_bits() != 0 {
            for i in 0..len {
                vector.set(i, T::default());
            }
        }
        vector
    }

    /// Creates an unpooled vector holding a copy of `values`.
    pub fn from_slice(values: &[T]) -> Self {
        let vector = Self::wrap(RawVector::new(T::ELEMENT_TYPE, values.len()));
        for (i, &value) in values.iter().enumerate() {
            vector.set(i, value);
        }
        vector
    }

    /// Views a raw vector as `Vector<T>`.
    ///
    /// # Errors
    ///
    /// Returns `SeriesError::ElementTypeMismatch` if the raw vector stores a
    /// different element type.
    pub fn try_from_raw(raw: RawVector) -> Result<Self> {
        if raw.element_type() != T::ELEMENT_TYPE {
            return Err(SeriesError::ElementTypeMismatch {
                expected: T::ELEMENT_TYPE,
                actual: raw.element_type(),
            });
        }
        Ok(Self::wrap(raw))
    }

    pub(crate) fn wrap(raw: RawVector) -> Self {
        debug_assert_eq!(raw.element_type(), T::ELEMENT_TYPE);
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    /// Returns the untyped vector.
    pub fn as_raw(&self) -> &RawVector {
        &self.raw
    }

    /// Consumes the view and returns the untyped vector.
    pub fn into_raw(self) -> RawVector {
        self.raw
    }

    /// Returns the element type tag.
    pub fn element_type(&self) -> ElementType {
        self.raw.element_type()
    }

    /// Returns the fixed number of elements.
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// Returns true if the vector has no elements.
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Returns the number of handles sharing the backing allocation.
    pub fn ref_count(&self) -> usize {
        self.raw.ref_count()
    }

    /// Reads the element at physical index `index`.
    #[inline]
    pub fn get(&self, index: usize) -> T {
        T::from_bits(self.raw.load_bits(index))
    }

    /// Writes the element at physical index `index`.
    #[inline]
    pub fn set(&self, index: usize, value: T) {
        self.raw.store_bits(index, value.to_bits());
    }

    /// Appends `len` elements starting at physical index `start` to `out`.
    ///
    /// Used by bulk encoders that serialize whole vectors.
    pub fn copy_range(&self, start: usize, len: usize, out: &mut Vec<T>) {
        out.reserve(len);
        out.extend((start..start + len).map(|i| self.get(i)));
    }

    /// Copies every element into a new `Vec`.
    pub fn to_vec(&self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len());
        self.copy_range(0, self.len(), &mut out);
        out
    }
}

impl<T: Element> Clone for Vector<T> {
    fn clone(&self) -> Self {
        Self::wrap(self.raw.clone())
    }
}

impl<T: Element> fmt::Debug for Vector<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vector")
            .field("element_type", &self.element_type())
            .field("len", &self.len())
            .finish()
    }
}
