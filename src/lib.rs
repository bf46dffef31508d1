//! foreignmem: a foreign memory and native call layer
//!
//! Lets a program describe the byte layout of native data, obtain typed,
//! bounds- and lifetime-checked accessors into raw memory, and invoke (or
//! be invoked by) native functions per the platform calling convention,
//! with no native-glue compilation step. The pieces:
//!
//! - `layout` - structural layouts with deterministic size/alignment
//!   algebra and path addressing into nested shapes
//! - `memory` - scopes (arenas) owning native memory, and checked
//!   segment views over native or heap bytes
//! - `access` - composable typed accessors (plain, ordered, atomic)
//!   derived from layouts
//! - `linker` - ABI classification plus Cranelift-compiled downcall
//!   trampolines and upcall stubs

pub mod access;
pub mod layout;
pub mod linker;
pub mod memory;

pub use access::{AccessError, AccessMode, Value, ValueType, VarHandle};
pub use layout::canonical::CanonicalTable;
pub use layout::{ByteOrder, Carrier, Layout, LayoutError, OffsetHandle, PathElement};
pub use linker::{
    DowncallHandle, FunctionDescriptor, Linker, LinkerError, LinkerOption, SymbolLookup, UpcallFn,
};
pub use memory::{MemoryError, MemorySegment, Scope, ScopeKind, SegmentAllocator};

#[cfg(test)]
mod tests;
