//! Object model shared by the collector and its embedders.
//!
//! Defines the header word layout, object references, out-of-heap reference
//! slots and class descriptors. Byte-level access to the heap lives in the
//! `heap` crate.

mod class;
mod header;
mod value;

pub use class::{
    ARRAY_DATA_INDEX, ARRAY_LENGTH_INDEX, ClassBuilder, ClassDescriptor, ClassId, ClassTable,
    FILLER_SIZE_INDEX, MIN_OBJECT_WORDS, ObjectCategory, ReferenceKind, ReferenceLayout,
    ReferenceState, ScanType,
};
pub use header::{HeaderFlags, HeaderTag, HeaderWord};
pub use value::{ObjectRef, Slot, WORD_SIZE};
