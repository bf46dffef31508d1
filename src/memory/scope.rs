//! Scopes: lifetime and ownership tokens for native memory
//!
//! A scope governs when memory belonging to it becomes invalid:
//! - `Confined` scopes are owned by a single thread; only that thread may
//!   allocate, access, or close.
//! - `Shared` scopes allow concurrent access from any thread; closing
//!   blocks until every in-flight access has drained, so an access either
//!   completes against live memory or fails up front.
//! - `Auto` scopes tear down when the last handle drops.
//! - The `Global` scope is never closed.
//!
//! Liveness is tracked with an atomic phase word plus an in-flight access
//! counter; no global lock is involved. Cleanup actions run in reverse
//! registration order at close.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking::{Parker, Unparker};

use super::error::MemoryError;
use super::segment::MemorySegment;
use crate::layout::Layout;

const PHASE_OPEN: u8 = 0;
const PHASE_CLOSING: u8 = 1;
const PHASE_CLOSED: u8 = 2;

/// The ownership/lifetime policy of a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Confined(ThreadId),
    Shared,
    Auto,
    Global,
}

type Cleanup = Box<dyn FnOnce() + Send>;

pub(crate) struct ScopeInner {
    kind: ScopeKind,
    phase: AtomicU8,
    accesses: AtomicU64,
    closer: Mutex<Option<Unparker>>,
    cleanups: Mutex<Vec<Cleanup>>,
}

/// A lifetime token. Cloning yields another handle to the same scope
/// state; for `Auto` scopes, reachability of any handle (or of a segment
/// allocated from it) keeps the memory alive.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

impl Scope {
    fn with_kind(kind: ScopeKind) -> Scope {
        Scope {
            inner: Arc::new(ScopeInner {
                kind,
                phase: AtomicU8::new(PHASE_OPEN),
                accesses: AtomicU64::new(0),
                closer: Mutex::new(None),
                cleanups: Mutex::new(Vec::new()),
            }),
        }
    }

    /// A scope confined to the calling thread.
    pub fn confined() -> Scope {
        Scope::with_kind(ScopeKind::Confined(thread::current().id()))
    }

    /// A scope whose memory any thread may access.
    pub fn shared() -> Scope {
        Scope::with_kind(ScopeKind::Shared)
    }

    /// A scope that tears down when its last handle drops. Auto segments
    /// are not thread-confined; any thread may access them while a handle
    /// keeps the scope reachable.
    pub fn auto_managed() -> Scope {
        Scope::with_kind(ScopeKind::Auto)
    }

    /// The process-lifetime scope. Never closed.
    pub fn global() -> Scope {
        static GLOBAL: OnceLock<Scope> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Scope::with_kind(ScopeKind::Global))
            .clone()
    }

    pub fn kind(&self) -> ScopeKind {
        self.inner.kind
    }

    pub fn is_alive(&self) -> bool {
        self.inner.phase.load(Ordering::SeqCst) == PHASE_OPEN
    }

    /// True when both handles refer to the same scope state.
    pub fn same_scope(&self, other: &Scope) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Begin an access: verifies liveness and thread confinement, and for
    /// shared scopes pins the scope open until the guard drops.
    pub(crate) fn acquire(&self, operation: &'static str) -> Result<AccessGuard<'_>, MemoryError> {
        let inner = &*self.inner;
        match inner.kind {
            ScopeKind::Confined(owner) => {
                if thread::current().id() != owner {
                    return Err(MemoryError::WrongThread { operation });
                }
                if inner.phase.load(Ordering::SeqCst) != PHASE_OPEN {
                    return Err(MemoryError::NotAlive);
                }
                Ok(AccessGuard {
                    inner,
                    counted: false,
                })
            }
            ScopeKind::Shared => {
                if inner.phase.load(Ordering::SeqCst) != PHASE_OPEN {
                    return Err(MemoryError::NotAlive);
                }
                inner.accesses.fetch_add(1, Ordering::SeqCst);
                // Re-check: a closer may have moved to CLOSING between the
                // phase load and the increment.
                if inner.phase.load(Ordering::SeqCst) != PHASE_OPEN {
                    release_access(inner);
                    return Err(MemoryError::NotAlive);
                }
                Ok(AccessGuard {
                    inner,
                    counted: true,
                })
            }
            ScopeKind::Auto | ScopeKind::Global => {
                if inner.phase.load(Ordering::SeqCst) != PHASE_OPEN {
                    return Err(MemoryError::NotAlive);
                }
                Ok(AccessGuard {
                    inner,
                    counted: false,
                })
            }
        }
    }

    /// Register an action to run at close, after (in reverse order of)
    /// every action registered before it.
    pub fn register_cleanup(
        &self,
        action: impl FnOnce() + Send + 'static,
    ) -> Result<(), MemoryError> {
        let _guard = self.acquire("cleanup registration")?;
        self.inner.cleanups.lock().unwrap().push(Box::new(action));
        Ok(())
    }

    /// Close the scope, invalidating every segment allocated from it and
    /// running registered cleanups in reverse registration order.
    pub fn close(&self) -> Result<(), MemoryError> {
        let inner = &*self.inner;
        match inner.kind {
            ScopeKind::Global => Err(MemoryError::UnsupportedOperation {
                message: "Global scope cannot be closed".into(),
            }),
            ScopeKind::Auto => Err(MemoryError::UnsupportedOperation {
                message: "Auto-managed scope cannot be closed explicitly".into(),
            }),
            ScopeKind::Confined(owner) => {
                if thread::current().id() != owner {
                    return Err(MemoryError::WrongThread { operation: "close" });
                }
                if inner
                    .phase
                    .compare_exchange(PHASE_OPEN, PHASE_CLOSED, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    return Err(MemoryError::NotAlive);
                }
                tracing::debug!(kind = "confined", "scope closed");
                run_cleanups(inner)
            }
            ScopeKind::Shared => {
                if inner
                    .phase
                    .compare_exchange(PHASE_OPEN, PHASE_CLOSING, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    return Err(MemoryError::NotAlive);
                }
                // Wait for in-flight accesses to drain before tearing down.
                let parker = Parker::new();
                *inner.closer.lock().unwrap() = Some(parker.unparker());
                while inner.accesses.load(Ordering::SeqCst) != 0 {
                    parker.park_timeout(Duration::from_millis(1));
                }
                *inner.closer.lock().unwrap() = None;
                inner.phase.store(PHASE_CLOSED, Ordering::SeqCst);
                tracing::debug!(kind = "shared", "scope closed");
                run_cleanups(inner)
            }
        }
    }

    /// Allocate `size` zero-initialized bytes aligned to `align`.
    ///
    /// Native allocations are always zero-filled; that is a guarantee, not
    /// an implementation detail. Zero-length allocations are valid and
    /// return a distinct, aligned address each call. The memory is freed
    /// when the scope closes (or, for `Auto`, when the last handle drops).
    pub fn allocate_bytes(&self, size: u64, align: u64) -> Result<MemorySegment, MemoryError> {
        if align == 0 || !align.is_power_of_two() {
            return Err(MemoryError::UnsupportedOperation {
                message: format!("Invalid alignment constraint: {}", align),
            });
        }
        let usable = usize::try_from(size).map_err(|_| MemoryError::ArithmeticOverflow {
            message: format!("allocation size {}", size),
        })?;
        let _guard = self.acquire("allocation")?;

        let alloc_layout =
            std::alloc::Layout::from_size_align(usable.max(1), align as usize).map_err(|_| {
                MemoryError::ArithmeticOverflow {
                    message: format!("allocation of {} bytes aligned to {}", size, align),
                }
            })?;
        let ptr = unsafe { std::alloc::alloc_zeroed(alloc_layout) };
        if ptr.is_null() {
            std::alloc::handle_alloc_error(alloc_layout);
        }
        tracing::trace!(size, align, addr = ptr as usize, "native allocation");

        let addr = ptr as usize;
        self.inner.cleanups.lock().unwrap().push(Box::new(move || {
            unsafe { std::alloc::dealloc(addr as *mut u8, alloc_layout) };
        }));
        Ok(MemorySegment::from_native(addr as u64, size, self.clone()))
    }

    /// Allocate zeroed memory shaped like `layout`.
    pub fn allocate(&self, layout: &Layout) -> Result<MemorySegment, MemoryError> {
        self.allocate_bytes(layout.byte_size(), layout.byte_alignment())
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("kind", &self.inner.kind)
            .field("alive", &self.is_alive())
            .finish()
    }
}

fn release_access(inner: &ScopeInner) {
    if inner.accesses.fetch_sub(1, Ordering::SeqCst) == 1
        && inner.phase.load(Ordering::SeqCst) == PHASE_CLOSING
    {
        if let Some(unparker) = inner.closer.lock().unwrap().as_ref() {
            unparker.unpark();
        }
    }
}

fn run_cleanups(inner: &ScopeInner) -> Result<(), MemoryError> {
    let mut actions = {
        let mut guard = inner.cleanups.lock().unwrap();
        std::mem::take(&mut *guard)
    };
    let mut failures: Vec<String> = Vec::new();
    while let Some(action) = actions.pop() {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(action)) {
            failures.push(panic_message(payload));
        }
    }
    match failures.len() {
        0 => Ok(()),
        _ => {
            let primary = failures.remove(0);
            Err(MemoryError::CleanupFailed {
                primary,
                suppressed: failures,
            })
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "cleanup panicked".to_string()
    }
}

impl Drop for ScopeInner {
    fn drop(&mut self) {
        // Auto teardown, and a safety net for scopes dropped without an
        // explicit close. No other handle can exist here, so the phase
        // store cannot race an access.
        if self.phase.load(Ordering::SeqCst) != PHASE_CLOSED {
            self.phase.store(PHASE_CLOSED, Ordering::SeqCst);
            if let Err(err) = run_cleanups(self) {
                tracing::debug!(error = %err, "cleanup failure during scope teardown");
            }
        }
    }
}

/// Guard pinning a scope open for the duration of one access.
pub(crate) struct AccessGuard<'a> {
    inner: &'a ScopeInner,
    counted: bool,
}

impl Drop for AccessGuard<'_> {
    fn drop(&mut self) {
        if self.counted {
            release_access(self.inner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_confined_close_is_owner_only() {
        let scope = Scope::confined();
        let moved = scope.clone();
        let result = thread::spawn(move || moved.close()).join().unwrap();
        assert_eq!(
            result.unwrap_err(),
            MemoryError::WrongThread { operation: "close" }
        );
        assert!(scope.is_alive());
        scope.close().unwrap();
        assert!(!scope.is_alive());
    }

    #[test]
    fn test_second_close_fails_without_rerunning_cleanups() {
        let runs = Arc::new(AtomicUsize::new(0));
        let scope = Scope::confined();
        let counter = runs.clone();
        scope
            .register_cleanup(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        scope.close().unwrap();
        assert_eq!(scope.close().unwrap_err(), MemoryError::NotAlive);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cleanups_run_in_reverse_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let scope = Scope::confined();
        for i in 0..3 {
            let order = order.clone();
            scope
                .register_cleanup(move || order.lock().unwrap().push(i))
                .unwrap();
        }
        scope.close().unwrap();
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn test_cleanup_failures_become_primary_plus_suppressed() {
        let scope = Scope::confined();
        scope.register_cleanup(|| panic!("first registered")).unwrap();
        scope.register_cleanup(|| panic!("second registered")).unwrap();
        let err = scope.close().unwrap_err();
        match err {
            MemoryError::CleanupFailed {
                primary,
                suppressed,
            } => {
                // Reverse registration order: the later one runs (and fails)
                // first.
                assert_eq!(primary, "second registered");
                assert_eq!(suppressed, vec!["first registered".to_string()]);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_global_and_auto_refuse_close() {
        assert!(matches!(
            Scope::global().close().unwrap_err(),
            MemoryError::UnsupportedOperation { .. }
        ));
        assert!(matches!(
            Scope::auto_managed().close().unwrap_err(),
            MemoryError::UnsupportedOperation { .. }
        ));
    }

    #[test]
    fn test_auto_teardown_runs_cleanups_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        {
            let scope = Scope::auto_managed();
            let counter = runs.clone();
            scope
                .register_cleanup(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            let clone = scope.clone();
            drop(scope);
            assert_eq!(runs.load(Ordering::SeqCst), 0, "still reachable");
            drop(clone);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shared_close_blocks_until_access_drains() {
        let scope = Scope::shared();
        let guard = scope.acquire("access").unwrap();

        let closer = {
            let scope = scope.clone();
            thread::spawn(move || scope.close())
        };
        // Give the closer time to reach the drain loop.
        thread::sleep(Duration::from_millis(20));
        assert!(!closer.is_finished(), "close must wait for the in-flight access");
        drop(guard);
        closer.join().unwrap().unwrap();
        assert!(!scope.is_alive());
        assert!(scope.acquire("access").is_err());
    }

    #[test]
    fn test_confined_allocation_from_foreign_thread_fails() {
        let scope = Scope::confined();
        let moved = scope.clone();
        let result = thread::spawn(move || moved.allocate_bytes(16, 8)).join().unwrap();
        assert_eq!(
            result.unwrap_err(),
            MemoryError::WrongThread {
                operation: "allocation"
            }
        );
    }

    #[test]
    fn test_allocation_is_zeroed_and_aligned() {
        let scope = Scope::confined();
        let seg = scope.allocate_bytes(64, 16).unwrap();
        assert_eq!(seg.address() % 16, 0);
        for i in 0..64 {
            assert_eq!(seg.get_u8(i).unwrap(), 0);
        }
        scope.close().unwrap();
    }

    #[test]
    fn test_zero_length_allocations_are_distinct_and_aligned() {
        let scope = Scope::confined();
        let a = scope.allocate_bytes(0, 8).unwrap();
        let b = scope.allocate_bytes(0, 8).unwrap();
        assert_eq!(a.address() % 8, 0);
        assert_eq!(b.address() % 8, 0);
        assert_ne!(a.address(), b.address());
        assert_ne!(a, b);
        scope.close().unwrap();
    }
}
