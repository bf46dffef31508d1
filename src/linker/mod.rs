//! Linker: translating function descriptors into native call plans
//!
//! The linker validates descriptor layouts against the platform ABI,
//! classifies them into machine call slots, and compiles trampolines:
//! - downcalls (managed -> native) through `downcall.rs`
//! - upcalls (native -> managed) through `upcall.rs`
//!
//! Classification rules live in `classify.rs`, parameterized by a
//! per-platform table selected from the host triple.

pub mod classify;
pub mod downcall;
pub mod upcall;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

use crate::access::{AccessError, Value};
use crate::layout::{Carrier, Layout, LayoutError};
use crate::memory::{MemoryError, MemorySegment, Scope};

pub use classify::PlatformAbi;
pub use downcall::DowncallHandle;

use downcall::CompiledTrampoline;
use upcall::UpcallTarget;

// =========================================================================
// Errors
// =========================================================================

/// Errors raised while validating, classifying, linking, or calling.
#[derive(Debug, Clone)]
pub enum LinkerError {
    /// The platform ABI cannot lower this layout.
    UnsupportedLayout { layout: String },

    /// A group's declared size disagrees with its computed size plus
    /// required trailing padding.
    UnexpectedSize {
        layout: String,
        actual: u64,
        expected: u64,
    },

    /// A padding member sits where none (or a different amount) is
    /// required.
    UnexpectedOffset {
        layout: String,
        offset: u64,
        expected: u64,
    },

    /// Two adjacent padding members; they must be merged by the caller.
    AdjacentPadding { size: u64, offset: u64 },

    /// A bad, duplicate, or unknown linker option, or an option applied
    /// where it cannot go.
    InvalidOption { message: String },

    /// A bad runtime argument (null target, wrong arity, wrong value).
    IllegalArgument { message: String },

    /// Trampoline compilation failed.
    Codegen { message: String },

    Memory(MemoryError),
    Access(AccessError),
    Layout(LayoutError),
}

impl fmt::Display for LinkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkerError::UnsupportedLayout { layout } => {
                write!(f, "Unsupported layout: {}", layout)
            }
            LinkerError::UnexpectedSize {
                layout,
                actual,
                expected,
            } => write!(
                f,
                "Layout {} has unexpected size: {}, expected {}",
                layout, actual, expected
            ),
            LinkerError::UnexpectedOffset {
                layout,
                offset,
                expected,
            } => write!(
                f,
                "Layout {} has unexpected offset: {}, expected {}",
                layout, offset, expected
            ),
            LinkerError::AdjacentPadding { size, offset } => write!(
                f,
                "adjacent padding layouts ({} bytes at offset {}) must be merged into one",
                size, offset
            ),
            LinkerError::InvalidOption { message } => write!(f, "{}", message),
            LinkerError::IllegalArgument { message } => write!(f, "{}", message),
            LinkerError::Codegen { message } => write!(f, "trampoline compilation failed: {}", message),
            LinkerError::Memory(e) => write!(f, "{}", e),
            LinkerError::Access(e) => write!(f, "{}", e),
            LinkerError::Layout(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for LinkerError {}

impl From<MemoryError> for LinkerError {
    fn from(e: MemoryError) -> Self {
        LinkerError::Memory(e)
    }
}

impl From<AccessError> for LinkerError {
    fn from(e: AccessError) -> Self {
        LinkerError::Access(e)
    }
}

impl From<LayoutError> for LinkerError {
    fn from(e: LayoutError) -> Self {
        LinkerError::Layout(e)
    }
}

// =========================================================================
// Function descriptors
// =========================================================================

/// Ordered argument layouts plus an optional return layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionDescriptor {
    args: Vec<Layout>,
    ret: Option<Layout>,
}

impl FunctionDescriptor {
    pub fn of(ret: Layout, args: Vec<Layout>) -> FunctionDescriptor {
        FunctionDescriptor {
            args,
            ret: Some(ret),
        }
    }

    pub fn of_void(args: Vec<Layout>) -> FunctionDescriptor {
        FunctionDescriptor { args, ret: None }
    }

    pub fn argument_layouts(&self) -> &[Layout] {
        &self.args
    }

    pub fn return_layout(&self) -> Option<&Layout> {
        self.ret.as_ref()
    }

    /// Copy with `layouts` appended to the argument list.
    pub fn with_appended_arguments(&self, layouts: Vec<Layout>) -> FunctionDescriptor {
        let mut out = self.clone();
        out.args.extend(layouts);
        out
    }

    /// Copy without a return layout.
    pub fn with_void_return(&self) -> FunctionDescriptor {
        FunctionDescriptor {
            args: self.args.clone(),
            ret: None,
        }
    }

    /// The call-plan identity of this descriptor: structural, with names
    /// erased. Two descriptors with equal canonical forms (and equal
    /// options) may share a compiled call plan.
    pub fn canonical_form(&self) -> String {
        let mut out = String::from("(");
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&classify::canonical(arg));
        }
        out.push(')');
        match &self.ret {
            Some(ret) => out.push_str(&classify::canonical(ret)),
            None => out.push('v'),
        }
        out
    }
}

// =========================================================================
// Linker options
// =========================================================================

/// Downcall-only options adjusting how a call plan is built.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LinkerOption {
    /// Arguments at or beyond this index are variadic slots.
    FirstVariadicArg(usize),
    /// Capture platform call state (e.g. the OS error code) into a
    /// caller-supplied segment passed as the leading call argument.
    CaptureCallState(Vec<String>),
    /// Mark the downcall as safepoint-avoiding. Heap-backed segments may
    /// only be passed by address when `allow_heap_access` is set. This
    /// implementation enforces the heap rule; it has no safepoint
    /// machinery to suspend.
    Critical { allow_heap_access: bool },
}

impl LinkerOption {
    pub fn first_variadic_arg(index: usize) -> LinkerOption {
        LinkerOption::FirstVariadicArg(index)
    }

    /// Validated eagerly: every name must be a platform state slot, and
    /// duplicates collapse so equal sets construct equal options.
    pub fn capture_call_state<I, S>(names: I) -> Result<LinkerOption, LinkerError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let slots = PlatformAbi::host().capture_slots;
        let mut accepted: Vec<String> = Vec::new();
        for name in names {
            let name = name.into();
            if !slots.contains(&name.as_str()) {
                return Err(LinkerError::InvalidOption {
                    message: format!("Unknown name: {}", name),
                });
            }
            if !accepted.contains(&name) {
                accepted.push(name);
            }
        }
        accepted.sort();
        Ok(LinkerOption::CaptureCallState(accepted))
    }

    pub fn critical(allow_heap_access: bool) -> LinkerOption {
        LinkerOption::Critical { allow_heap_access }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            LinkerOption::FirstVariadicArg(_) => "firstVariadicArg",
            LinkerOption::CaptureCallState(_) => "captureCallState",
            LinkerOption::Critical { .. } => "critical",
        }
    }
}

/// Parsed view over a validated option list.
#[derive(Debug, Clone, Default)]
pub(crate) struct OptionSet {
    pub variadic_index: Option<usize>,
    pub capture: Option<Vec<String>>,
    pub critical: Option<bool>,
}

pub(crate) fn parse_options(
    options: &[LinkerOption],
    argument_count: usize,
) -> Result<OptionSet, LinkerError> {
    let mut set = OptionSet::default();
    let mut seen: Vec<&'static str> = Vec::new();
    for option in options {
        let kind = option.kind_name();
        if seen.contains(&kind) {
            return Err(LinkerError::InvalidOption {
                message: format!("Duplicate option: {}", kind),
            });
        }
        seen.push(kind);
        match option {
            LinkerOption::FirstVariadicArg(index) => {
                if *index > argument_count {
                    return Err(LinkerError::InvalidOption {
                        message: format!(
                            "first variadic argument index {} out of range [0, {}]",
                            index, argument_count
                        ),
                    });
                }
                set.variadic_index = Some(*index);
            }
            LinkerOption::CaptureCallState(names) => {
                set.capture = Some(names.clone());
            }
            LinkerOption::Critical { allow_heap_access } => {
                set.critical = Some(*allow_heap_access);
            }
        }
    }
    Ok(set)
}

// =========================================================================
// Symbol lookup (external collaborator)
// =========================================================================

/// Opaque symbol resolution: the core only needs a validated address.
pub trait SymbolLookup {
    fn lookup(&self, name: &str) -> Option<u64>;
}

// =========================================================================
// Linker
// =========================================================================

/// The function a native upcall stub dispatches into.
pub type UpcallFn = Arc<dyn Fn(&[Value]) -> Result<Option<Value>, String> + Send + Sync>;

/// The host linker: validates, classifies, compiles, and memoizes.
pub struct Linker {
    abi: &'static PlatformAbi,
    plan_cache: Mutex<HashMap<String, Arc<CompiledTrampoline>>>,
}

impl Linker {
    pub fn host() -> &'static Linker {
        static LINKER: OnceLock<Linker> = OnceLock::new();
        LINKER.get_or_init(|| Linker {
            abi: PlatformAbi::host(),
            plan_cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn abi_name(&self) -> &'static str {
        self.abi.name
    }

    /// The layout of the call-state capture area: one named field per
    /// platform state slot. Callers pass a scratch segment of exactly
    /// this shape as the leading argument of a capturing downcall.
    pub fn capture_state_layout(&self) -> Layout {
        let members = self
            .abi
            .capture_slots
            .iter()
            .map(|slot| Layout::value(Carrier::I32).with_name(*slot))
            .collect();
        Layout::struct_of(members).expect("capture slots form a valid struct")
    }

    /// Build a callable for a native function at `target`.
    pub fn downcall_handle(
        &self,
        target: u64,
        descriptor: &FunctionDescriptor,
        options: &[LinkerOption],
    ) -> Result<DowncallHandle, LinkerError> {
        if target == 0 {
            return Err(LinkerError::IllegalArgument {
                message: "Invalid target address: 0x0".into(),
            });
        }
        let option_set = parse_options(options, descriptor.argument_layouts().len())?;
        let plan = self.abi.classify(descriptor, &option_set)?;

        // Memoized compilation: identity is the canonical (name-free)
        // descriptor plus the full option set. Differing options never
        // share a plan.
        let key = downcall::plan_cache_key(descriptor, options);
        let compiled = {
            let mut cache = self.plan_cache.lock().unwrap();
            match cache.get(&key) {
                Some(code) => Arc::clone(code),
                None => {
                    let code = Arc::new(downcall::compile_trampoline(&plan)?);
                    cache.insert(key, Arc::clone(&code));
                    code
                }
            }
        };
        Ok(DowncallHandle::new(target, plan, compiled))
    }

    /// Resolve `name` through `lookup` and build a callable for it.
    pub fn downcall<L: SymbolLookup + ?Sized>(
        &self,
        lookup: &L,
        name: &str,
        descriptor: &FunctionDescriptor,
        options: &[LinkerOption],
    ) -> Result<DowncallHandle, LinkerError> {
        let target = lookup.lookup(name).ok_or_else(|| LinkerError::IllegalArgument {
            message: format!("unresolved symbol: {}", name),
        })?;
        self.downcall_handle(target, descriptor, options)
    }

    /// Build a native-callable stub that dispatches into `func`. The
    /// returned zero-length segment holds the stub's address and is bound
    /// to `scope`; the stub dies when the scope does.
    pub fn upcall_stub(
        &self,
        func: UpcallFn,
        descriptor: &FunctionDescriptor,
        scope: &Scope,
        options: &[LinkerOption],
    ) -> Result<MemorySegment, LinkerError> {
        // Options are downcall-only; reject before any stub generation.
        if let Some(option) = options.first() {
            return Err(LinkerError::InvalidOption {
                message: format!("Not supported for upcall: {}", option.kind_name()),
            });
        }
        let option_set = OptionSet::default();
        let plan = self.abi.classify(descriptor, &option_set)?;
        let target = UpcallTarget::new(func, plan);
        upcall::compile_stub(target, scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Carrier;

    fn int32() -> Layout {
        Layout::value(Carrier::I32)
    }

    #[test]
    fn test_canonical_form_ignores_names() {
        let a = FunctionDescriptor::of(int32(), vec![int32().with_name("x")]);
        let b = FunctionDescriptor::of(int32().with_name("r"), vec![int32()]);
        assert_eq!(a.canonical_form(), b.canonical_form());
        let c = FunctionDescriptor::of_void(vec![int32()]);
        assert_ne!(a.canonical_form(), c.canonical_form());
    }

    #[test]
    fn test_descriptor_copy_on_write_editing() {
        let base = FunctionDescriptor::of(int32(), vec![int32()]);
        let extended = base.with_appended_arguments(vec![int32(), int32()]);
        assert_eq!(extended.argument_layouts().len(), 3);
        assert_eq!(base.argument_layouts().len(), 1);
        let voided = base.with_void_return();
        assert!(voided.return_layout().is_none());
        assert!(base.return_layout().is_some());
    }

    #[test]
    fn test_symbol_lookup_drives_downcall_linking() {
        struct Empty;
        impl SymbolLookup for Empty {
            fn lookup(&self, _name: &str) -> Option<u64> {
                None
            }
        }
        let desc = FunctionDescriptor::of_void(vec![]);
        let err = Linker::host()
            .downcall(&Empty, "missing_symbol", &desc, &[])
            .unwrap_err();
        assert!(err.to_string().contains("unresolved symbol: missing_symbol"));
    }

    #[test]
    fn test_capture_call_state_dedups_and_normalizes() {
        let a = LinkerOption::capture_call_state(["errno", "errno"]).unwrap();
        let b = LinkerOption::capture_call_state(["errno"]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_capture_call_state_rejects_unknown_names() {
        let err = LinkerOption::capture_call_state(["GetLastError"]).unwrap_err();
        assert!(err.to_string().contains("Unknown name: GetLastError"));
    }

    #[test]
    fn test_variadic_index_range() {
        let desc = FunctionDescriptor::of_void(vec![int32(), int32()]);
        assert!(parse_options(
            &[LinkerOption::first_variadic_arg(2)],
            desc.argument_layouts().len()
        )
        .is_ok());
        let err = parse_options(
            &[LinkerOption::first_variadic_arg(3)],
            desc.argument_layouts().len(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn test_duplicate_options_rejected() {
        let err = parse_options(
            &[
                LinkerOption::first_variadic_arg(0),
                LinkerOption::first_variadic_arg(1),
            ],
            2,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Duplicate option"));
    }

    #[test]
    fn test_capture_state_layout_has_field_per_slot() {
        let layout = Linker::host().capture_state_layout();
        let group = layout.as_group().unwrap();
        assert_eq!(
            group.member_layouts().len(),
            PlatformAbi::host().capture_slots.len()
        );
        for (member, slot) in group
            .member_layouts()
            .iter()
            .zip(PlatformAbi::host().capture_slots)
        {
            assert_eq!(member.name(), Some(*slot));
        }
    }

    #[test]
    fn test_null_target_rejected() {
        let desc = FunctionDescriptor::of_void(vec![]);
        let err = Linker::host()
            .downcall_handle(0, &desc, &[])
            .unwrap_err();
        assert!(err.to_string().contains("Invalid target address: 0x0"));
    }

    #[test]
    fn test_upcall_rejects_downcall_only_options() {
        let desc = FunctionDescriptor::of_void(vec![]);
        let scope = Scope::confined();
        let noop: UpcallFn = Arc::new(|_| Ok(None));
        for option in [
            LinkerOption::first_variadic_arg(0),
            LinkerOption::capture_call_state(["errno"]).unwrap(),
            LinkerOption::critical(false),
        ] {
            let err = Linker::host()
                .upcall_stub(noop.clone(), &desc, &scope, &[option])
                .unwrap_err();
            assert!(err.to_string().contains("Not supported for upcall"));
        }
        scope.close().unwrap();
    }
}
