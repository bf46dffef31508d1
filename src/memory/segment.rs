//! Memory segments: bounded, checked views over contiguous memory
//!
//! A segment couples an address range with the scope that owns it. Every
//! access verifies, in order: scope liveness and thread confinement, write
//! permission, and bounds. Bounds arithmetic is checked 64-bit; nothing
//! wraps through narrower intermediates.
//!
//! Two backings exist: native (an off-heap address) and heap (owned bytes
//! with a virtualized base address of zero, so no raw heap address leaks
//! through the public surface). Derived views (slices, read-only
//! projections, reinterpretations) are non-owning and track the liveness
//! of the scope they are bound to.

use std::cell::UnsafeCell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use super::error::MemoryError;
use super::scope::Scope;

pub(crate) struct HeapStorage {
    bytes: UnsafeCell<Box<[u8]>>,
}

// Byte-level races on a shared segment are the caller's contract, exactly
// as for raw native memory. Liveness and confinement stay race-free in the
// scope layer.
unsafe impl Send for HeapStorage {}
unsafe impl Sync for HeapStorage {}

impl HeapStorage {
    fn ptr(&self) -> *mut u8 {
        unsafe { (*self.bytes.get()).as_mut_ptr() }
    }
}

#[derive(Clone)]
enum Backing {
    Native { addr: u64 },
    Heap { storage: Arc<HeapStorage> },
}

/// A bounded view over a contiguous block of memory, bound to a scope.
#[derive(Clone)]
pub struct MemorySegment {
    backing: Backing,
    offset: u64,
    len: u64,
    read_only: bool,
    scope: Scope,
}

impl MemorySegment {
    pub(crate) fn from_native(addr: u64, len: u64, scope: Scope) -> MemorySegment {
        MemorySegment {
            backing: Backing::Native { addr },
            offset: 0,
            len,
            read_only: false,
            scope,
        }
    }

    /// A heap-backed segment owning `bytes`, attached to the global scope.
    /// Its base address is virtualized to zero.
    pub fn of_bytes(bytes: Vec<u8>) -> MemorySegment {
        let len = bytes.len() as u64;
        MemorySegment {
            backing: Backing::Heap {
                storage: Arc::new(HeapStorage {
                    bytes: UnsafeCell::new(bytes.into_boxed_slice()),
                }),
            },
            offset: 0,
            len,
            read_only: false,
            scope: Scope::global(),
        }
    }

    /// The zero-length segment at address zero.
    pub fn null() -> MemorySegment {
        MemorySegment::of_address(0)
    }

    /// A zero-length native view of a raw address. Reading through it
    /// requires a `reinterpret` to a non-zero size first.
    pub fn of_address(addr: u64) -> MemorySegment {
        MemorySegment::from_native(addr, 0, Scope::global())
    }

    /// The segment's address: the native address, or the virtualized
    /// (zero-based) offset for heap-backed segments.
    pub fn address(&self) -> u64 {
        match &self.backing {
            Backing::Native { addr } => addr.wrapping_add(self.offset),
            Backing::Heap { .. } => self.offset,
        }
    }

    pub fn byte_size(&self) -> u64 {
        self.len
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_native(&self) -> bool {
        matches!(self.backing, Backing::Native { .. })
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// The physical address backing this segment, including for heap
    /// segments. Internal: used for runtime alignment checks and for
    /// passing heap segments to critical downcalls.
    pub(crate) fn physical_address(&self) -> u64 {
        match &self.backing {
            Backing::Native { addr } => addr.wrapping_add(self.offset),
            Backing::Heap { storage } => storage.ptr() as u64 + self.offset,
        }
    }

    fn check_range(&self, offset: u64, length: u64, write: bool) -> Result<(), MemoryError> {
        if write && self.read_only {
            return Err(MemoryError::ReadOnly);
        }
        let end = offset
            .checked_add(length)
            .ok_or_else(|| MemoryError::ArithmeticOverflow {
                message: format!("access at offset {} with length {}", offset, length),
            })?;
        if end > self.len {
            return Err(MemoryError::OutOfBounds {
                offset,
                length,
                segment_size: self.len,
            });
        }
        Ok(())
    }

    /// Run `f` with a raw pointer to `[offset, offset+length)`, holding the
    /// scope open for the duration. All checked access funnels through
    /// here.
    pub(crate) fn with_window<R>(
        &self,
        offset: u64,
        length: u64,
        write: bool,
        f: impl FnOnce(*mut u8) -> R,
    ) -> Result<R, MemoryError> {
        let _guard = self.scope.acquire("access")?;
        self.check_range(offset, length, write)?;
        let base = match &self.backing {
            Backing::Native { addr } => (addr + self.offset) as usize as *mut u8,
            Backing::Heap { storage } => unsafe { storage.ptr().add(self.offset as usize) },
        };
        Ok(f(unsafe { base.add(offset as usize) }))
    }

    // ---------------------------------------------------------------------
    // Plain typed access (native byte order, no alignment requirement)
    // ---------------------------------------------------------------------

    pub fn get_u8(&self, offset: u64) -> Result<u8, MemoryError> {
        self.with_window(offset, 1, false, |p| unsafe { p.read() })
    }

    pub fn set_u8(&self, offset: u64, value: u8) -> Result<(), MemoryError> {
        self.with_window(offset, 1, true, |p| unsafe { p.write(value) })
    }

    pub fn get_i32(&self, offset: u64) -> Result<i32, MemoryError> {
        self.with_window(offset, 4, false, |p| unsafe {
            p.cast::<i32>().read_unaligned()
        })
    }

    pub fn set_i32(&self, offset: u64, value: i32) -> Result<(), MemoryError> {
        self.with_window(offset, 4, true, |p| unsafe {
            p.cast::<i32>().write_unaligned(value)
        })
    }

    pub fn get_i64(&self, offset: u64) -> Result<i64, MemoryError> {
        self.with_window(offset, 8, false, |p| unsafe {
            p.cast::<i64>().read_unaligned()
        })
    }

    pub fn set_i64(&self, offset: u64, value: i64) -> Result<(), MemoryError> {
        self.with_window(offset, 8, true, |p| unsafe {
            p.cast::<i64>().write_unaligned(value)
        })
    }

    pub fn get_f64(&self, offset: u64) -> Result<f64, MemoryError> {
        self.with_window(offset, 8, false, |p| unsafe {
            p.cast::<f64>().read_unaligned()
        })
    }

    pub fn set_f64(&self, offset: u64, value: f64) -> Result<(), MemoryError> {
        self.with_window(offset, 8, true, |p| unsafe {
            p.cast::<f64>().write_unaligned(value)
        })
    }

    pub fn get_address(&self, offset: u64) -> Result<u64, MemoryError> {
        self.with_window(offset, std::mem::size_of::<usize>() as u64, false, |p| unsafe {
            p.cast::<usize>().read_unaligned() as u64
        })
    }

    pub fn set_address(&self, offset: u64, value: u64) -> Result<(), MemoryError> {
        self.with_window(offset, std::mem::size_of::<usize>() as u64, true, |p| unsafe {
            p.cast::<usize>().write_unaligned(value as usize)
        })
    }

    // ---------------------------------------------------------------------
    // Bulk operations
    // ---------------------------------------------------------------------

    /// Write `value` to every byte of the segment. Concurrent fills on a
    /// shared segment interleave to an unspecified but safe byte pattern;
    /// no internal lock serializes them.
    pub fn fill(&self, value: u8) -> Result<(), MemoryError> {
        self.with_window(0, self.len, true, |p| unsafe {
            std::ptr::write_bytes(p, value, self.len as usize)
        })
    }

    /// Copy every byte of `src` into the front of this segment.
    /// Overlap-safe.
    pub fn copy_from(&self, src: &MemorySegment) -> Result<(), MemoryError> {
        let len = src.len;
        src.with_window(0, len, false, |s| {
            self.with_window(0, len, true, |d| unsafe {
                std::ptr::copy(s, d, len as usize)
            })
        })?
    }

    /// Copy the segment's bytes out. Used for marshalling and tests.
    pub fn to_vec(&self) -> Result<Vec<u8>, MemoryError> {
        self.with_window(0, self.len, false, |p| unsafe {
            std::slice::from_raw_parts(p, self.len as usize).to_vec()
        })
    }

    // ---------------------------------------------------------------------
    // Derived views
    // ---------------------------------------------------------------------

    /// A view of `[offset, offset+new_len)` sharing this segment's scope.
    pub fn as_slice(&self, offset: u64, new_len: u64) -> Result<MemorySegment, MemoryError> {
        let end = offset
            .checked_add(new_len)
            .ok_or_else(|| MemoryError::ArithmeticOverflow {
                message: format!("slice at offset {} with length {}", offset, new_len),
            })?;
        if end > self.len {
            return Err(MemoryError::OutOfBounds {
                offset,
                length: new_len,
                segment_size: self.len,
            });
        }
        let mut out = self.clone();
        out.offset += offset;
        out.len = new_len;
        Ok(out)
    }

    /// The suffix view starting at `offset`.
    pub fn as_slice_from(&self, offset: u64) -> Result<MemorySegment, MemoryError> {
        let remaining = self.len.checked_sub(offset).ok_or(MemoryError::OutOfBounds {
            offset,
            length: 0,
            segment_size: self.len,
        })?;
        self.as_slice(offset, remaining)
    }

    /// A read-only projection over the same range and scope.
    pub fn as_read_only(&self) -> MemorySegment {
        let mut out = self.clone();
        out.read_only = true;
        out
    }

    /// A view of the same native address under a different declared size,
    /// still bound to this segment's scope.
    pub fn reinterpret(&self, new_len: u64) -> Result<MemorySegment, MemoryError> {
        self.reinterpret_with_scope(new_len, self.scope.clone())
    }

    /// Like `reinterpret`, but binds the view to `scope` and registers
    /// `cleanup` to run when that scope closes. Each view's validity
    /// tracks only its own scope.
    pub fn reinterpret_in(
        &self,
        new_len: u64,
        scope: &Scope,
        cleanup: impl FnOnce() + Send + 'static,
    ) -> Result<MemorySegment, MemoryError> {
        scope.register_cleanup(cleanup)?;
        self.reinterpret_with_scope(new_len, scope.clone())
    }

    fn reinterpret_with_scope(
        &self,
        new_len: u64,
        scope: Scope,
    ) -> Result<MemorySegment, MemoryError> {
        let addr = match &self.backing {
            Backing::Native { addr } => addr + self.offset,
            Backing::Heap { .. } => {
                return Err(MemoryError::UnsupportedOperation {
                    message: "reinterpret requires a native segment".into(),
                });
            }
        };
        let mut out = MemorySegment::from_native(addr, new_len, scope);
        out.read_only = self.read_only;
        Ok(out)
    }
}

/// Equality covers the backing identity, the (virtualized) address, and
/// the byte size; read-only and slicing status do not participate, so a
/// segment equals its read-only projection and its full-range slice.
impl PartialEq for MemorySegment {
    fn eq(&self, other: &Self) -> bool {
        if self.len != other.len {
            return false;
        }
        match (&self.backing, &other.backing) {
            (Backing::Native { addr: a }, Backing::Native { addr: b }) => {
                a.wrapping_add(self.offset) == b.wrapping_add(other.offset)
            }
            (Backing::Heap { storage: a }, Backing::Heap { storage: b }) => {
                Arc::ptr_eq(a, b) && self.offset == other.offset
            }
            _ => false,
        }
    }
}

impl Eq for MemorySegment {}

impl Hash for MemorySegment {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match &self.backing {
            Backing::Native { addr } => {
                0u8.hash(state);
                addr.wrapping_add(self.offset).hash(state);
            }
            Backing::Heap { storage } => {
                1u8.hash(state);
                (Arc::as_ptr(storage) as usize).hash(state);
                self.offset.hash(state);
            }
        }
        self.len.hash(state);
    }
}

impl fmt::Debug for MemorySegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySegment")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("byte_size", &self.len)
            .field("read_only", &self.read_only)
            .field("native", &self.is_native())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(seg: &MemorySegment) -> u64 {
        let mut h = DefaultHasher::new();
        seg.hash(&mut h);
        h.finish()
    }

    #[test]
    fn test_roundtrip_reads_and_writes() {
        let scope = Scope::confined();
        let seg = scope.allocate_bytes(16, 8).unwrap();
        seg.set_i32(0, 0x1234_5678).unwrap();
        seg.set_i64(8, -42).unwrap();
        assert_eq!(seg.get_i32(0).unwrap(), 0x1234_5678);
        assert_eq!(seg.get_i64(8).unwrap(), -42);
        scope.close().unwrap();
    }

    #[test]
    fn test_bounds_are_checked_per_element_size() {
        let scope = Scope::confined();
        let seg = scope.allocate_bytes(10, 8).unwrap();
        assert!(seg.get_i64(2).is_ok());
        let err = seg.get_i64(3).unwrap_err();
        assert!(matches!(err, MemoryError::OutOfBounds { .. }));
        assert!(matches!(
            seg.get_u8(u64::MAX).unwrap_err(),
            MemoryError::ArithmeticOverflow { .. } | MemoryError::OutOfBounds { .. }
        ));
        scope.close().unwrap();
    }

    #[test]
    fn test_access_after_close_fails() {
        let scope = Scope::confined();
        let seg = scope.allocate_bytes(8, 8).unwrap();
        scope.close().unwrap();
        assert_eq!(seg.get_i32(0).unwrap_err(), MemoryError::NotAlive);
    }

    #[test]
    fn test_confined_access_from_spawned_thread_fails() {
        let scope = Scope::confined();
        let seg = scope.allocate_bytes(10, 1).unwrap();
        let moved = seg.clone();
        let result = std::thread::spawn(move || moved.get_u8(0)).join().unwrap();
        assert_eq!(
            result.unwrap_err(),
            MemoryError::WrongThread { operation: "access" }
        );
        // The owner can still access, and the failure above was
        // distinguishable from a liveness failure.
        assert_eq!(seg.get_u8(0).unwrap(), 0);
        scope.close().unwrap();
    }

    #[test]
    fn test_read_only_rejects_writes_not_reads() {
        let scope = Scope::confined();
        let seg = scope.allocate_bytes(8, 8).unwrap();
        seg.set_i32(0, 7).unwrap();
        let ro = seg.as_read_only();
        assert_eq!(ro.get_i32(0).unwrap(), 7);
        assert_eq!(ro.set_i32(0, 9).unwrap_err(), MemoryError::ReadOnly);
        assert_eq!(ro.fill(0).unwrap_err(), MemoryError::ReadOnly);
        scope.close().unwrap();
    }

    #[test]
    fn test_fill_writes_every_byte() {
        let scope = Scope::confined();
        let seg = scope.allocate_bytes(13, 1).unwrap();
        seg.fill(0xAB).unwrap();
        for i in 0..13 {
            assert_eq!(seg.get_u8(i).unwrap(), 0xAB);
        }
        scope.close().unwrap();
    }

    #[test]
    fn test_copy_from() {
        let scope = Scope::confined();
        let a = scope.allocate_bytes(8, 1).unwrap();
        let b = scope.allocate_bytes(8, 1).unwrap();
        a.fill(0x11).unwrap();
        b.copy_from(&a).unwrap();
        assert_eq!(b.get_u8(7).unwrap(), 0x11);
        // Larger source does not fit.
        let big = scope.allocate_bytes(9, 1).unwrap();
        assert!(matches!(
            b.copy_from(&big).unwrap_err(),
            MemoryError::OutOfBounds { .. }
        ));
        scope.close().unwrap();
    }

    #[test]
    fn test_equality_of_projections_and_slices() {
        let scope = Scope::confined();
        let seg = scope.allocate_bytes(16, 8).unwrap();
        let ro = seg.as_read_only();
        let full = seg.as_slice(0, 16).unwrap();
        assert_eq!(seg, ro);
        assert_eq!(seg, full);
        assert_eq!(hash_of(&seg), hash_of(&ro));
        assert_eq!(hash_of(&seg), hash_of(&full));

        let sub = seg.as_slice(0, 8).unwrap();
        assert_ne!(seg, sub);
        let tail = seg.as_slice(8, 8).unwrap();
        assert_ne!(seg, tail);
        scope.close().unwrap();
    }

    #[test]
    fn test_heap_segment_virtualizes_base_address() {
        let seg = MemorySegment::of_bytes(vec![1, 2, 3, 4]);
        assert_eq!(seg.address(), 0);
        assert_eq!(seg.as_slice(2, 2).unwrap().address(), 2);
        assert_eq!(seg.get_u8(3).unwrap(), 4);
        assert!(!seg.is_native());
    }

    #[test]
    fn test_distinct_heap_segments_are_not_equal() {
        let a = MemorySegment::of_bytes(vec![0; 4]);
        let b = MemorySegment::of_bytes(vec![0; 4]);
        assert_ne!(a, b);
        assert_eq!(a, a.as_read_only());
    }

    #[test]
    fn test_zero_length_slice_of_zero_length_segment() {
        let scope = Scope::confined();
        let seg = scope.allocate_bytes(0, 8).unwrap();
        let sliced = seg.as_slice(0, 0).unwrap();
        assert_eq!(seg, sliced);
        assert!(seg.as_slice(1, 0).is_err());
        scope.close().unwrap();
    }

    #[test]
    fn test_reinterpret_tracks_its_own_scope() {
        let scope = Scope::confined();
        let seg = scope.allocate_bytes(16, 8).unwrap();

        let other = Scope::confined();
        let viewed = seg.reinterpret_in(8, &other, || {}).unwrap();
        assert_eq!(viewed.byte_size(), 8);
        assert_eq!(viewed.address(), seg.address());

        other.close().unwrap();
        assert_eq!(viewed.get_i32(0).unwrap_err(), MemoryError::NotAlive);
        // The original view is still valid.
        assert!(seg.get_i32(0).is_ok());
        scope.close().unwrap();
    }

    #[test]
    fn test_reinterpret_runs_cleanup_at_scope_close() {
        use std::sync::atomic::{AtomicBool, Ordering};
        let flag = Arc::new(AtomicBool::new(false));
        let scope = Scope::confined();
        let seg = scope.allocate_bytes(4, 4).unwrap();
        let other = Scope::confined();
        let witness = flag.clone();
        let _view = seg
            .reinterpret_in(4, &other, move || witness.store(true, Ordering::SeqCst))
            .unwrap();
        assert!(!flag.load(Ordering::SeqCst));
        other.close().unwrap();
        assert!(flag.load(Ordering::SeqCst));
        scope.close().unwrap();
    }

    #[test]
    fn test_of_address_is_zero_length() {
        let seg = MemorySegment::of_address(0x1000);
        assert_eq!(seg.address(), 0x1000);
        assert_eq!(seg.byte_size(), 0);
        assert!(matches!(
            seg.get_u8(0).unwrap_err(),
            MemoryError::OutOfBounds { .. }
        ));
    }

    #[test]
    fn test_heap_reinterpret_is_unsupported() {
        let seg = MemorySegment::of_bytes(vec![0; 8]);
        assert!(matches!(
            seg.reinterpret(4).unwrap_err(),
            MemoryError::UnsupportedOperation { .. }
        ));
    }
}
