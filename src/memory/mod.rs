//! Memory ownership and access layer
//!
//! This module provides the scope (arena) and segment model:
//! - Scope lifecycle and confinement rules (scope.rs)
//! - Bounded, checked segment views (segment.rs)
//! - The error conditions both raise (error.rs)

pub mod error;
pub mod scope;
pub mod segment;

pub use error::MemoryError;
pub use scope::{Scope, ScopeKind};
pub use segment::MemorySegment;

/// A capability for allocating scratch segments, supplied by callers when
/// an operation (such as a group-returning downcall) needs storage in a
/// scope the caller controls.
pub trait SegmentAllocator {
    fn allocate_bytes(&self, size: u64, align: u64) -> Result<MemorySegment, MemoryError>;
}

impl SegmentAllocator for Scope {
    fn allocate_bytes(&self, size: u64, align: u64) -> Result<MemorySegment, MemoryError> {
        Scope::allocate_bytes(self, size, align)
    }
}
