//! Typed accessors over layouts and segments
//!
//! A `VarHandle` couples a value layout with a coordinate list (segment,
//! base offset, free indices) and performs checked reads, writes, and
//! atomic updates through it. Handles are immutable descriptors; the
//! combinators in `adapt` wrap a handle in a new descriptor without
//! mutating shared state.
//!
//! Access-mode families are gated by the layout's alignment relative to
//! its size: plain get/set is always available, everything else requires
//! `alignment >= size` so the hardware can honor the ordering.

pub mod adapt;

use std::fmt;
use std::sync::atomic::{
    AtomicI8, AtomicI16, AtomicI32, AtomicI64, AtomicU8, AtomicU16, AtomicU32, AtomicU64,
    AtomicUsize, Ordering,
};

use crate::layout::error::LayoutError;
use crate::layout::path::{self, PathElement, Step};
use crate::layout::{ByteOrder, Carrier, Layout, ValueLayout};
use crate::memory::{MemoryError, MemorySegment, Scope};

use adapt::{Combiner, CoordFilter, ValueFilter};

// =========================================================================
// Values
// =========================================================================

/// A dynamically typed value flowing through accessors and native calls.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    I8(i8),
    I16(i16),
    U16(u16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Address(u64),
    Str(String),
    Segment(MemorySegment),
}

/// The type tag of a `Value`, used for construction-time checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Bool,
    I8,
    I16,
    U16,
    I32,
    I64,
    F32,
    F64,
    Address,
    Str,
    Segment,
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Bool(_) => ValueType::Bool,
            Value::I8(_) => ValueType::I8,
            Value::I16(_) => ValueType::I16,
            Value::U16(_) => ValueType::U16,
            Value::I32(_) => ValueType::I32,
            Value::I64(_) => ValueType::I64,
            Value::F32(_) => ValueType::F32,
            Value::F64(_) => ValueType::F64,
            Value::Address(_) => ValueType::Address,
            Value::Str(_) => ValueType::Str,
            Value::Segment(_) => ValueType::Segment,
        }
    }
}

pub(crate) fn carrier_value_type(carrier: Carrier) -> ValueType {
    match carrier {
        Carrier::Bool => ValueType::Bool,
        Carrier::I8 => ValueType::I8,
        Carrier::I16 => ValueType::I16,
        Carrier::U16 => ValueType::U16,
        Carrier::I32 => ValueType::I32,
        Carrier::I64 => ValueType::I64,
        Carrier::F32 => ValueType::F32,
        Carrier::F64 => ValueType::F64,
        Carrier::Address => ValueType::Address,
    }
}

// =========================================================================
// Errors
// =========================================================================

/// Errors raised when building or invoking an accessor.
#[derive(Debug, Clone)]
pub enum AccessError {
    /// The access mode is not available for this layout/alignment.
    UnsupportedMode { mode: AccessMode, layout: String },

    /// The runtime target address violates the layout's alignment.
    Misaligned {
        offset: u64,
        align: u64,
        layout: String,
    },

    /// Coordinate or argument list does not match the handle's signature.
    CoordinateMismatch { message: String },

    /// A value or coordinate conversion failed during an access.
    FilterFailed { message: String },

    Memory(MemoryError),
    Layout(LayoutError),
}

impl fmt::Display for AccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessError::UnsupportedMode { mode, layout } => {
                write!(f, "Access mode {:?} is not supported for layout {}", mode, layout)
            }
            AccessError::Misaligned {
                offset,
                align,
                layout,
            } => write!(
                f,
                "Target offset {} is incompatible with alignment constraint {} (of {})",
                offset, align, layout
            ),
            AccessError::CoordinateMismatch { message } => write!(f, "{}", message),
            AccessError::FilterFailed { message } => {
                write!(f, "value conversion failed: {}", message)
            }
            AccessError::Memory(e) => write!(f, "{}", e),
            AccessError::Layout(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for AccessError {}

impl From<MemoryError> for AccessError {
    fn from(e: MemoryError) -> Self {
        AccessError::Memory(e)
    }
}

impl From<LayoutError> for AccessError {
    fn from(e: LayoutError) -> Self {
        AccessError::Layout(e)
    }
}

// =========================================================================
// Access modes
// =========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    Get,
    Set,
    GetVolatile,
    SetVolatile,
    GetAcquire,
    SetRelease,
    GetOpaque,
    SetOpaque,
    CompareAndSet,
    CompareAndExchange,
    GetAndSet,
    GetAndAdd,
    GetAndBitwiseOr,
    GetAndBitwiseAnd,
    GetAndBitwiseXor,
}

/// The gating families: plain, ordered read/write, atomic update, atomic
/// numeric update, atomic bitwise update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeFamily {
    Plain,
    ReadWrite,
    AtomicUpdate,
    AtomicNumericUpdate,
    AtomicBitwiseUpdate,
}

impl AccessMode {
    pub fn family(self) -> ModeFamily {
        match self {
            AccessMode::Get | AccessMode::Set => ModeFamily::Plain,
            AccessMode::GetVolatile
            | AccessMode::SetVolatile
            | AccessMode::GetAcquire
            | AccessMode::SetRelease
            | AccessMode::GetOpaque
            | AccessMode::SetOpaque => ModeFamily::ReadWrite,
            AccessMode::CompareAndSet | AccessMode::CompareAndExchange | AccessMode::GetAndSet => {
                ModeFamily::AtomicUpdate
            }
            AccessMode::GetAndAdd => ModeFamily::AtomicNumericUpdate,
            AccessMode::GetAndBitwiseOr
            | AccessMode::GetAndBitwiseAnd
            | AccessMode::GetAndBitwiseXor => ModeFamily::AtomicBitwiseUpdate,
        }
    }

    /// Number of value arguments beyond the coordinates.
    fn arity(self) -> usize {
        match self {
            AccessMode::Get
            | AccessMode::GetVolatile
            | AccessMode::GetAcquire
            | AccessMode::GetOpaque => 0,
            AccessMode::CompareAndSet | AccessMode::CompareAndExchange => 2,
            _ => 1,
        }
    }

    /// Whether the mode stores into the target.
    fn writes(self) -> bool {
        !matches!(
            self,
            AccessMode::Get
                | AccessMode::GetVolatile
                | AccessMode::GetAcquire
                | AccessMode::GetOpaque
        )
    }

    /// Whether the mode's result has the handle's value type (as opposed
    /// to no result, or the boolean result of compare-and-set).
    fn returns_value(self) -> bool {
        matches!(
            self,
            AccessMode::Get
                | AccessMode::GetVolatile
                | AccessMode::GetAcquire
                | AccessMode::GetOpaque
                | AccessMode::CompareAndExchange
                | AccessMode::GetAndSet
                | AccessMode::GetAndAdd
                | AccessMode::GetAndBitwiseOr
                | AccessMode::GetAndBitwiseAnd
                | AccessMode::GetAndBitwiseXor
        )
    }

    pub fn all() -> &'static [AccessMode] {
        &[
            AccessMode::Get,
            AccessMode::Set,
            AccessMode::GetVolatile,
            AccessMode::SetVolatile,
            AccessMode::GetAcquire,
            AccessMode::SetRelease,
            AccessMode::GetOpaque,
            AccessMode::SetOpaque,
            AccessMode::CompareAndSet,
            AccessMode::CompareAndExchange,
            AccessMode::GetAndSet,
            AccessMode::GetAndAdd,
            AccessMode::GetAndBitwiseOr,
            AccessMode::GetAndBitwiseAnd,
            AccessMode::GetAndBitwiseXor,
        ]
    }
}

/// Whether `mode` is available for a given value layout.
pub(crate) fn mode_supported(mode: AccessMode, layout: &ValueLayout) -> bool {
    let carrier = layout.carrier();
    let aligned = layout.byte_alignment() >= layout.byte_size();
    let native_order = layout.order().is_native();
    match mode.family() {
        ModeFamily::Plain => true,
        ModeFamily::ReadWrite | ModeFamily::AtomicUpdate => aligned && native_order,
        ModeFamily::AtomicNumericUpdate => {
            aligned && native_order && carrier != Carrier::Bool
        }
        ModeFamily::AtomicBitwiseUpdate => aligned && native_order && !carrier.is_float(),
    }
}

// =========================================================================
// VarHandle
// =========================================================================

#[derive(Clone)]
pub(crate) enum Form {
    Base {
        layout: ValueLayout,
        steps: Vec<Step>,
    },
    FilterValue {
        target: Box<VarHandle>,
        unbox: ValueFilter,
        rebox: ValueFilter,
    },
    FilterCoordinates {
        target: Box<VarHandle>,
        pos: usize,
        filters: Vec<CoordFilter>,
    },
    InsertCoordinates {
        target: Box<VarHandle>,
        pos: usize,
        values: Vec<Value>,
    },
    PermuteCoordinates {
        target: Box<VarHandle>,
        reorder: Vec<usize>,
    },
    CollectCoordinates {
        target: Box<VarHandle>,
        pos: usize,
        combiner: Combiner,
    },
    DropCoordinates {
        target: Box<VarHandle>,
        pos: usize,
        count: usize,
    },
}

/// A composable read/write/atomic accessor bound to a layout and a
/// coordinate list. Immutable; combinators produce new handles.
#[derive(Clone)]
pub struct VarHandle {
    pub(crate) form: Form,
    pub(crate) coord_types: Vec<ValueType>,
    pub(crate) value_type: ValueType,
}

impl fmt::Debug for VarHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VarHandle")
            .field("coordinates", &self.coord_types)
            .field("value_type", &self.value_type)
            .finish()
    }
}

impl Layout {
    /// An accessor for the value layout a path selects. Coordinates are
    /// `(segment, base offset)` plus one index per unbound path element.
    pub fn var_handle(&self, path: &[PathElement]) -> Result<VarHandle, LayoutError> {
        let resolved = path::resolve(self, path)?;
        let leaf = match &resolved.leaf {
            Layout::Value(v) => v.clone(),
            other => {
                return Err(LayoutError::path(format!(
                    "path does not select a value layout: {}",
                    other
                )));
            }
        };
        let mut coord_types = vec![ValueType::Segment, ValueType::I64];
        coord_types.extend(std::iter::repeat_n(
            ValueType::I64,
            resolved.free_index_count(),
        ));
        Ok(VarHandle {
            value_type: carrier_value_type(leaf.carrier()),
            form: Form::Base {
                layout: leaf,
                steps: resolved.steps,
            },
            coord_types,
        })
    }
}

impl VarHandle {
    pub fn coordinate_types(&self) -> &[ValueType] {
        &self.coord_types
    }

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    /// Whether `mode` is available. Combinator wrapping never shrinks the
    /// supported mode set, so this always reflects the base layout.
    pub fn supports(&self, mode: AccessMode) -> bool {
        match &self.form {
            Form::Base { layout, .. } => mode_supported(mode, layout),
            Form::FilterValue { target, .. }
            | Form::FilterCoordinates { target, .. }
            | Form::InsertCoordinates { target, .. }
            | Form::PermuteCoordinates { target, .. }
            | Form::CollectCoordinates { target, .. }
            | Form::DropCoordinates { target, .. } => target.supports(mode),
        }
    }

    pub fn get(&self, coords: &[Value]) -> Result<Value, AccessError> {
        Ok(self.access(AccessMode::Get, coords, &[])?.unwrap())
    }

    pub fn set(&self, coords: &[Value], value: Value) -> Result<(), AccessError> {
        self.access(AccessMode::Set, coords, &[value]).map(|_| ())
    }

    pub fn compare_and_set(
        &self,
        coords: &[Value],
        expected: Value,
        desired: Value,
    ) -> Result<bool, AccessError> {
        match self.access(AccessMode::CompareAndSet, coords, &[expected, desired])? {
            Some(Value::Bool(b)) => Ok(b),
            other => Err(AccessError::CoordinateMismatch {
                message: format!("compare-and-set produced {:?}", other),
            }),
        }
    }

    pub fn get_and_add(&self, coords: &[Value], delta: Value) -> Result<Value, AccessError> {
        Ok(self
            .access(AccessMode::GetAndAdd, coords, &[delta])?
            .unwrap())
    }

    /// Invoke an arbitrary access mode. `args` carries the extra value
    /// arguments the mode expects (none for gets, one for sets and
    /// read-modify-writes, two for compare operations).
    pub fn access(
        &self,
        mode: AccessMode,
        coords: &[Value],
        args: &[Value],
    ) -> Result<Option<Value>, AccessError> {
        if coords.len() != self.coord_types.len() {
            return Err(AccessError::CoordinateMismatch {
                message: format!(
                    "expected {} coordinates, got {}",
                    self.coord_types.len(),
                    coords.len()
                ),
            });
        }
        for (i, (coord, expected)) in coords.iter().zip(&self.coord_types).enumerate() {
            if coord.value_type() != *expected {
                return Err(AccessError::CoordinateMismatch {
                    message: format!(
                        "coordinate {} has type {:?}, expected {:?}",
                        i,
                        coord.value_type(),
                        expected
                    ),
                });
            }
        }
        if args.len() != mode.arity() {
            return Err(AccessError::CoordinateMismatch {
                message: format!(
                    "access mode {:?} expects {} arguments, got {}",
                    mode,
                    mode.arity(),
                    args.len()
                ),
            });
        }
        self.dispatch(mode, coords, args)
    }

    fn dispatch(
        &self,
        mode: AccessMode,
        coords: &[Value],
        args: &[Value],
    ) -> Result<Option<Value>, AccessError> {
        match &self.form {
            Form::Base { layout, steps } => base_access(layout, steps, mode, coords, args),
            Form::FilterValue {
                target,
                unbox,
                rebox,
            } => {
                let mut inner_args = Vec::with_capacity(args.len());
                for arg in args {
                    inner_args.push(unbox.apply(arg.clone())?);
                }
                let result = target.dispatch(mode, coords, &inner_args)?;
                match result {
                    Some(v) if mode.returns_value() => Ok(Some(rebox.apply(v)?)),
                    other => Ok(other),
                }
            }
            Form::FilterCoordinates {
                target,
                pos,
                filters,
            } => {
                let mut inner = coords.to_vec();
                for (k, filter) in filters.iter().enumerate() {
                    inner[pos + k] = filter.apply(coords[pos + k].clone())?;
                }
                target.dispatch(mode, &inner, args)
            }
            Form::InsertCoordinates {
                target,
                pos,
                values,
            } => {
                let mut inner = Vec::with_capacity(coords.len() + values.len());
                inner.extend_from_slice(&coords[..*pos]);
                inner.extend(values.iter().cloned());
                inner.extend_from_slice(&coords[*pos..]);
                target.dispatch(mode, &inner, args)
            }
            Form::PermuteCoordinates { target, reorder } => {
                let inner: Vec<Value> =
                    reorder.iter().map(|&i| coords[i].clone()).collect();
                target.dispatch(mode, &inner, args)
            }
            Form::CollectCoordinates {
                target,
                pos,
                combiner,
            } => {
                let n = combiner.input_types().len();
                let folded = combiner.apply(&coords[*pos..*pos + n])?;
                let mut inner = Vec::with_capacity(coords.len() + 1 - n);
                inner.extend_from_slice(&coords[..*pos]);
                if let Some(v) = folded {
                    inner.push(v);
                }
                inner.extend_from_slice(&coords[*pos + n..]);
                target.dispatch(mode, &inner, args)
            }
            Form::DropCoordinates { target, pos, count } => {
                let mut inner = Vec::with_capacity(coords.len() - count);
                inner.extend_from_slice(&coords[..*pos]);
                inner.extend_from_slice(&coords[*pos + count..]);
                target.dispatch(mode, &inner, args)
            }
        }
    }
}

// =========================================================================
// Base access implementation
// =========================================================================

fn base_access(
    layout: &ValueLayout,
    steps: &[Step],
    mode: AccessMode,
    coords: &[Value],
    args: &[Value],
) -> Result<Option<Value>, AccessError> {
    if !mode_supported(mode, layout) {
        return Err(AccessError::UnsupportedMode {
            mode,
            layout: Layout::Value(layout.clone()).to_string(),
        });
    }

    let mut segment = match &coords[0] {
        Value::Segment(s) => s.clone(),
        other => {
            return Err(AccessError::CoordinateMismatch {
                message: format!("first coordinate must be a segment, got {:?}", other),
            });
        }
    };
    let base = match &coords[1] {
        Value::I64(n) => *n,
        other => {
            return Err(AccessError::CoordinateMismatch {
                message: format!("second coordinate must be a long offset, got {:?}", other),
            });
        }
    };

    let mut offset: i64 = base;
    let mut next_index = 2usize;
    for step in steps {
        match step {
            Step::Fixed(n) => {
                let n = i64::try_from(*n).map_err(|_| overflow("path offset"))?;
                offset = offset.checked_add(n).ok_or_else(|| overflow("path offset"))?;
            }
            Step::Index {
                stride,
                count,
                start,
                step,
            } => {
                let k = match &coords[next_index] {
                    Value::I64(k) => *k,
                    other => {
                        return Err(AccessError::CoordinateMismatch {
                            message: format!("index coordinate must be a long, got {:?}", other),
                        });
                    }
                };
                next_index += 1;
                let logical = (*start as i128) + (*step as i128) * (k as i128);
                if k < 0 || logical < 0 || logical >= *count as i128 {
                    return Err(AccessError::Layout(LayoutError::IndexOutOfBounds {
                        index: k,
                        count: *count,
                    }));
                }
                let scaled = i64::try_from(logical * *stride as i128)
                    .map_err(|_| overflow("scaled index"))?;
                offset = offset
                    .checked_add(scaled)
                    .ok_or_else(|| overflow("accumulated offset"))?;
            }
            Step::Deref { target_size } => {
                let addr = read_address(&segment, offset)?;
                segment = MemorySegment::of_address(addr).reinterpret(*target_size)?;
                offset = 0;
            }
        }
    }

    if offset < 0 {
        return Err(AccessError::Memory(MemoryError::OutOfBounds {
            offset: offset as u64,
            length: layout.byte_size(),
            segment_size: segment.byte_size(),
        }));
    }
    let offset = offset as u64;

    let align = layout.byte_alignment();
    if segment
        .physical_address()
        .wrapping_add(offset)
        % align
        != 0
    {
        return Err(AccessError::Misaligned {
            offset,
            align,
            layout: Layout::Value(layout.clone()).to_string(),
        });
    }

    raw_access(layout, &segment, offset, mode, args)
}

fn overflow(what: &str) -> AccessError {
    AccessError::Memory(MemoryError::ArithmeticOverflow {
        message: what.to_string(),
    })
}

fn read_address(segment: &MemorySegment, offset: i64) -> Result<u64, AccessError> {
    if offset < 0 {
        return Err(AccessError::Memory(MemoryError::OutOfBounds {
            offset: offset as u64,
            length: std::mem::size_of::<usize>() as u64,
            segment_size: segment.byte_size(),
        }));
    }
    Ok(segment.get_address(offset as u64)?)
}

fn expect_arg(args: &[Value], index: usize, expected: ValueType) -> Result<&Value, AccessError> {
    let arg = &args[index];
    if arg.value_type() != expected {
        return Err(AccessError::CoordinateMismatch {
            message: format!(
                "argument {} has type {:?}, expected {:?}",
                index,
                arg.value_type(),
                expected
            ),
        });
    }
    Ok(arg)
}

/// Plain (possibly byte-swapped, possibly unaligned) reads and writes.
fn plain_access(
    layout: &ValueLayout,
    segment: &MemorySegment,
    offset: u64,
    mode: AccessMode,
    args: &[Value],
) -> Result<Option<Value>, AccessError> {
    let size = layout.byte_size() as usize;
    let order = layout.order();
    let carrier = layout.carrier();
    match mode {
        AccessMode::Get => {
            let mut bytes = [0u8; 8];
            segment.with_window(offset, size as u64, false, |p| unsafe {
                std::ptr::copy_nonoverlapping(p, bytes.as_mut_ptr(), size)
            })?;
            Ok(Some(decode(carrier, order, &bytes[..size])))
        }
        AccessMode::Set => {
            let value = expect_arg(args, 0, carrier_value_type(carrier))?;
            let bytes = encode(value, order);
            segment.with_window(offset, size as u64, true, |p| unsafe {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), p, size)
            })?;
            Ok(None)
        }
        _ => unreachable!("plain_access only handles Get/Set"),
    }
}

fn decode(carrier: Carrier, order: ByteOrder, bytes: &[u8]) -> Value {
    macro_rules! de {
        ($ty:ty, $variant:ident) => {{
            let mut buf = [0u8; std::mem::size_of::<$ty>()];
            buf.copy_from_slice(bytes);
            let v = match order {
                ByteOrder::Little => <$ty>::from_le_bytes(buf),
                ByteOrder::Big => <$ty>::from_be_bytes(buf),
            };
            Value::$variant(v)
        }};
    }
    match carrier {
        Carrier::Bool => Value::Bool(bytes[0] != 0),
        Carrier::I8 => Value::I8(bytes[0] as i8),
        Carrier::I16 => de!(i16, I16),
        Carrier::U16 => de!(u16, U16),
        Carrier::I32 => de!(i32, I32),
        Carrier::I64 => de!(i64, I64),
        Carrier::F32 => de!(f32, F32),
        Carrier::F64 => de!(f64, F64),
        Carrier::Address => {
            let mut buf = [0u8; std::mem::size_of::<usize>()];
            buf.copy_from_slice(bytes);
            let v = match order {
                ByteOrder::Little => usize::from_le_bytes(buf),
                ByteOrder::Big => usize::from_be_bytes(buf),
            };
            Value::Address(v as u64)
        }
    }
}

fn encode(value: &Value, order: ByteOrder) -> Vec<u8> {
    macro_rules! en {
        ($v:expr) => {
            match order {
                ByteOrder::Little => $v.to_le_bytes().to_vec(),
                ByteOrder::Big => $v.to_be_bytes().to_vec(),
            }
        };
    }
    match value {
        Value::Bool(b) => vec![*b as u8],
        Value::I8(v) => vec![*v as u8],
        Value::I16(v) => en!(v),
        Value::U16(v) => en!(v),
        Value::I32(v) => en!(v),
        Value::I64(v) => en!(v),
        Value::F32(v) => en!(v),
        Value::F64(v) => en!(v),
        Value::Address(v) => en!((*v as usize)),
        Value::Str(_) | Value::Segment(_) => unreachable!("checked by expect_arg"),
    }
}

/// Ordered and atomic access, dispatched per carrier. The target is
/// alignment-checked before this runs, so the atomic casts are sound.
fn raw_access(
    layout: &ValueLayout,
    segment: &MemorySegment,
    offset: u64,
    mode: AccessMode,
    args: &[Value],
) -> Result<Option<Value>, AccessError> {
    if mode.family() == ModeFamily::Plain {
        return plain_access(layout, segment, offset, mode, args);
    }
    let carrier = layout.carrier();
    let size = layout.byte_size();

    macro_rules! integer_arm {
        ($atomic:ty, $prim:ty, $variant:ident, $get:expr) => {{
            let get: fn(&Value) -> Option<$prim> = $get;
            let arg = |i: usize| -> Result<$prim, AccessError> {
                expect_arg(args, i, carrier_value_type(carrier)).map(|v| get(v).unwrap())
            };
            segment.with_window(offset, size, mode.writes(), |p| {
                let cell = unsafe { &*(p as *const $atomic) };
                Ok(match mode {
                    AccessMode::GetVolatile => Some(Value::$variant(cell.load(Ordering::SeqCst))),
                    AccessMode::GetAcquire => Some(Value::$variant(cell.load(Ordering::Acquire))),
                    AccessMode::GetOpaque => Some(Value::$variant(cell.load(Ordering::Relaxed))),
                    AccessMode::SetVolatile => {
                        cell.store(arg(0)?, Ordering::SeqCst);
                        None
                    }
                    AccessMode::SetRelease => {
                        cell.store(arg(0)?, Ordering::Release);
                        None
                    }
                    AccessMode::SetOpaque => {
                        cell.store(arg(0)?, Ordering::Relaxed);
                        None
                    }
                    AccessMode::CompareAndSet => Some(Value::Bool(
                        cell.compare_exchange(arg(0)?, arg(1)?, Ordering::SeqCst, Ordering::SeqCst)
                            .is_ok(),
                    )),
                    AccessMode::CompareAndExchange => Some(Value::$variant(
                        match cell.compare_exchange(
                            arg(0)?,
                            arg(1)?,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        ) {
                            Ok(v) | Err(v) => v,
                        },
                    )),
                    AccessMode::GetAndSet => {
                        Some(Value::$variant(cell.swap(arg(0)?, Ordering::SeqCst)))
                    }
                    AccessMode::GetAndAdd => {
                        Some(Value::$variant(cell.fetch_add(arg(0)?, Ordering::SeqCst)))
                    }
                    AccessMode::GetAndBitwiseOr => {
                        Some(Value::$variant(cell.fetch_or(arg(0)?, Ordering::SeqCst)))
                    }
                    AccessMode::GetAndBitwiseAnd => {
                        Some(Value::$variant(cell.fetch_and(arg(0)?, Ordering::SeqCst)))
                    }
                    AccessMode::GetAndBitwiseXor => {
                        Some(Value::$variant(cell.fetch_xor(arg(0)?, Ordering::SeqCst)))
                    }
                    AccessMode::Get | AccessMode::Set => unreachable!(),
                })
            })?
        }};
    }

    macro_rules! float_arm {
        ($atomic:ty, $prim:ty, $variant:ident, $get:expr) => {{
            let get: fn(&Value) -> Option<$prim> = $get;
            let arg = |i: usize| -> Result<$prim, AccessError> {
                expect_arg(args, i, carrier_value_type(carrier)).map(|v| get(v).unwrap())
            };
            segment.with_window(offset, size, mode.writes(), |p| {
                let cell = unsafe { &*(p as *const $atomic) };
                Ok(match mode {
                    AccessMode::GetVolatile => {
                        Some(Value::$variant(<$prim>::from_bits(cell.load(Ordering::SeqCst))))
                    }
                    AccessMode::GetAcquire => {
                        Some(Value::$variant(<$prim>::from_bits(cell.load(Ordering::Acquire))))
                    }
                    AccessMode::GetOpaque => {
                        Some(Value::$variant(<$prim>::from_bits(cell.load(Ordering::Relaxed))))
                    }
                    AccessMode::SetVolatile => {
                        cell.store(arg(0)?.to_bits(), Ordering::SeqCst);
                        None
                    }
                    AccessMode::SetRelease => {
                        cell.store(arg(0)?.to_bits(), Ordering::Release);
                        None
                    }
                    AccessMode::SetOpaque => {
                        cell.store(arg(0)?.to_bits(), Ordering::Relaxed);
                        None
                    }
                    AccessMode::CompareAndSet => Some(Value::Bool(
                        cell.compare_exchange(
                            arg(0)?.to_bits(),
                            arg(1)?.to_bits(),
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_ok(),
                    )),
                    AccessMode::CompareAndExchange => Some(Value::$variant(<$prim>::from_bits(
                        match cell.compare_exchange(
                            arg(0)?.to_bits(),
                            arg(1)?.to_bits(),
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        ) {
                            Ok(v) | Err(v) => v,
                        },
                    ))),
                    AccessMode::GetAndSet => Some(Value::$variant(<$prim>::from_bits(
                        cell.swap(arg(0)?.to_bits(), Ordering::SeqCst),
                    ))),
                    AccessMode::GetAndAdd => {
                        let delta = arg(0)?;
                        let mut current = cell.load(Ordering::SeqCst);
                        loop {
                            let updated = (<$prim>::from_bits(current) + delta).to_bits();
                            match cell.compare_exchange_weak(
                                current,
                                updated,
                                Ordering::SeqCst,
                                Ordering::SeqCst,
                            ) {
                                Ok(_) => break Some(Value::$variant(<$prim>::from_bits(current))),
                                Err(observed) => current = observed,
                            }
                        }
                    }
                    _ => unreachable!("gated by mode_supported"),
                })
            })?
        }};
    }

    match carrier {
        Carrier::I8 => integer_arm!(AtomicI8, i8, I8, |v| match v {
            Value::I8(x) => Some(*x),
            _ => None,
        }),
        Carrier::I16 => integer_arm!(AtomicI16, i16, I16, |v| match v {
            Value::I16(x) => Some(*x),
            _ => None,
        }),
        Carrier::U16 => integer_arm!(AtomicU16, u16, U16, |v| match v {
            Value::U16(x) => Some(*x),
            _ => None,
        }),
        Carrier::I32 => integer_arm!(AtomicI32, i32, I32, |v| match v {
            Value::I32(x) => Some(*x),
            _ => None,
        }),
        Carrier::I64 => integer_arm!(AtomicI64, i64, I64, |v| match v {
            Value::I64(x) => Some(*x),
            _ => None,
        }),
        Carrier::Bool => {
            // Booleans ride on a byte atomic; numeric update is gated off.
            let arg = |i: usize| -> Result<u8, AccessError> {
                expect_arg(args, i, ValueType::Bool).map(|v| match v {
                    Value::Bool(b) => *b as u8,
                    _ => unreachable!(),
                })
            };
            segment.with_window(offset, size, mode.writes(), |p| {
                let cell = unsafe { &*(p as *const AtomicU8) };
                Ok(match mode {
                    AccessMode::GetVolatile => Some(Value::Bool(cell.load(Ordering::SeqCst) != 0)),
                    AccessMode::GetAcquire => Some(Value::Bool(cell.load(Ordering::Acquire) != 0)),
                    AccessMode::GetOpaque => Some(Value::Bool(cell.load(Ordering::Relaxed) != 0)),
                    AccessMode::SetVolatile => {
                        cell.store(arg(0)?, Ordering::SeqCst);
                        None
                    }
                    AccessMode::SetRelease => {
                        cell.store(arg(0)?, Ordering::Release);
                        None
                    }
                    AccessMode::SetOpaque => {
                        cell.store(arg(0)?, Ordering::Relaxed);
                        None
                    }
                    AccessMode::CompareAndSet => Some(Value::Bool(
                        cell.compare_exchange(arg(0)?, arg(1)?, Ordering::SeqCst, Ordering::SeqCst)
                            .is_ok(),
                    )),
                    AccessMode::CompareAndExchange => Some(Value::Bool(
                        match cell.compare_exchange(
                            arg(0)?,
                            arg(1)?,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        ) {
                            Ok(v) | Err(v) => v,
                        } != 0,
                    )),
                    AccessMode::GetAndSet => {
                        Some(Value::Bool(cell.swap(arg(0)?, Ordering::SeqCst) != 0))
                    }
                    AccessMode::GetAndBitwiseOr => {
                        Some(Value::Bool(cell.fetch_or(arg(0)?, Ordering::SeqCst) != 0))
                    }
                    AccessMode::GetAndBitwiseAnd => {
                        Some(Value::Bool(cell.fetch_and(arg(0)?, Ordering::SeqCst) != 0))
                    }
                    AccessMode::GetAndBitwiseXor => {
                        Some(Value::Bool(cell.fetch_xor(arg(0)?, Ordering::SeqCst) != 0))
                    }
                    _ => unreachable!("gated by mode_supported"),
                })
            })?
        }
        Carrier::Address => {
            let arg = |i: usize| -> Result<usize, AccessError> {
                expect_arg(args, i, ValueType::Address).map(|v| match v {
                    Value::Address(a) => *a as usize,
                    _ => unreachable!(),
                })
            };
            segment.with_window(offset, size, mode.writes(), |p| {
                let cell = unsafe { &*(p as *const AtomicUsize) };
                Ok(match mode {
                    AccessMode::GetVolatile => {
                        Some(Value::Address(cell.load(Ordering::SeqCst) as u64))
                    }
                    AccessMode::GetAcquire => {
                        Some(Value::Address(cell.load(Ordering::Acquire) as u64))
                    }
                    AccessMode::GetOpaque => {
                        Some(Value::Address(cell.load(Ordering::Relaxed) as u64))
                    }
                    AccessMode::SetVolatile => {
                        cell.store(arg(0)?, Ordering::SeqCst);
                        None
                    }
                    AccessMode::SetRelease => {
                        cell.store(arg(0)?, Ordering::Release);
                        None
                    }
                    AccessMode::SetOpaque => {
                        cell.store(arg(0)?, Ordering::Relaxed);
                        None
                    }
                    AccessMode::CompareAndSet => Some(Value::Bool(
                        cell.compare_exchange(arg(0)?, arg(1)?, Ordering::SeqCst, Ordering::SeqCst)
                            .is_ok(),
                    )),
                    AccessMode::CompareAndExchange => Some(Value::Address(
                        match cell.compare_exchange(
                            arg(0)?,
                            arg(1)?,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        ) {
                            Ok(v) | Err(v) => v,
                        } as u64,
                    )),
                    AccessMode::GetAndSet => {
                        Some(Value::Address(cell.swap(arg(0)?, Ordering::SeqCst) as u64))
                    }
                    AccessMode::GetAndAdd => {
                        Some(Value::Address(cell.fetch_add(arg(0)?, Ordering::SeqCst) as u64))
                    }
                    AccessMode::GetAndBitwiseOr => {
                        Some(Value::Address(cell.fetch_or(arg(0)?, Ordering::SeqCst) as u64))
                    }
                    AccessMode::GetAndBitwiseAnd => {
                        Some(Value::Address(cell.fetch_and(arg(0)?, Ordering::SeqCst) as u64))
                    }
                    AccessMode::GetAndBitwiseXor => {
                        Some(Value::Address(cell.fetch_xor(arg(0)?, Ordering::SeqCst) as u64))
                    }
                    _ => unreachable!(),
                })
            })?
        }
        Carrier::F32 => float_arm!(AtomicU32, f32, F32, |v| match v {
            Value::F32(x) => Some(*x),
            _ => None,
        }),
        Carrier::F64 => float_arm!(AtomicU64, f64, F64, |v| match v {
            Value::F64(x) => Some(*x),
            _ => None,
        }),
    }
}

/// Allocate memory shaped like `layout` and write `value` into it.
pub fn allocate_value(
    scope: &Scope,
    layout: &Layout,
    value: Value,
) -> Result<MemorySegment, AccessError> {
    let segment = scope.allocate(layout)?;
    let handle = layout.var_handle(&[])?;
    handle.set(
        &[Value::Segment(segment.clone()), Value::I64(0)],
        value,
    )?;
    Ok(segment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::PathElement;

    fn int32() -> Layout {
        Layout::value(Carrier::I32)
    }

    fn seg_coords(seg: &MemorySegment) -> Vec<Value> {
        vec![Value::Segment(seg.clone()), Value::I64(0)]
    }

    #[test]
    fn test_plain_get_set_roundtrip() {
        let scope = Scope::confined();
        let seg = scope.allocate(&int32()).unwrap();
        let h = int32().var_handle(&[]).unwrap();
        h.set(&seg_coords(&seg), Value::I32(1234)).unwrap();
        assert_eq!(h.get(&seg_coords(&seg)).unwrap(), Value::I32(1234));
        scope.close().unwrap();
    }

    #[test]
    fn test_handle_through_struct_path() {
        let point = Layout::struct_of(vec![
            int32().with_name("x"),
            int32().with_name("y"),
        ])
        .unwrap();
        let scope = Scope::confined();
        let seg = scope.allocate(&point).unwrap();
        let hy = point.var_handle(&[PathElement::group_name("y")]).unwrap();
        hy.set(&seg_coords(&seg), Value::I32(7)).unwrap();
        assert_eq!(seg.get_i32(4).unwrap(), 7);
        scope.close().unwrap();
    }

    #[test]
    fn test_sequence_handle_takes_index_coordinate() {
        let seq = Layout::sequence(4, int32()).unwrap();
        let scope = Scope::confined();
        let seg = scope.allocate(&seq).unwrap();
        let h = seq.var_handle(&[PathElement::sequence()]).unwrap();
        assert_eq!(
            h.coordinate_types(),
            &[ValueType::Segment, ValueType::I64, ValueType::I64]
        );
        for i in 0..4 {
            let coords = vec![Value::Segment(seg.clone()), Value::I64(0), Value::I64(i)];
            h.set(&coords, Value::I32(i as i32 * 10)).unwrap();
        }
        assert_eq!(seg.get_i32(8).unwrap(), 20);

        let bad = vec![Value::Segment(seg.clone()), Value::I64(0), Value::I64(4)];
        assert!(matches!(
            h.get(&bad).unwrap_err(),
            AccessError::Layout(LayoutError::IndexOutOfBounds { index: 4, count: 4 })
        ));
        scope.close().unwrap();
    }

    #[test]
    fn test_atomic_ops_on_int() {
        let scope = Scope::confined();
        let seg = scope.allocate(&int32()).unwrap();
        let h = int32().var_handle(&[]).unwrap();
        let coords = seg_coords(&seg);

        h.set(&coords, Value::I32(1)).unwrap();
        assert!(h
            .compare_and_set(&coords, Value::I32(1), Value::I32(5))
            .unwrap());
        assert!(!h
            .compare_and_set(&coords, Value::I32(1), Value::I32(9))
            .unwrap());
        assert_eq!(
            h.get_and_add(&coords, Value::I32(3)).unwrap(),
            Value::I32(5)
        );
        assert_eq!(h.get(&coords).unwrap(), Value::I32(8));
        assert_eq!(
            h.access(AccessMode::GetAndBitwiseOr, &coords, &[Value::I32(0x10)])
                .unwrap(),
            Some(Value::I32(8))
        );
        assert_eq!(h.get(&coords).unwrap(), Value::I32(0x18));
        scope.close().unwrap();
    }

    #[test]
    fn test_float_get_and_add() {
        let scope = Scope::confined();
        let layout = Layout::value(Carrier::F64);
        let seg = scope.allocate(&layout).unwrap();
        let h = layout.var_handle(&[]).unwrap();
        let coords = seg_coords(&seg);
        h.set(&coords, Value::F64(1.5)).unwrap();
        assert_eq!(
            h.get_and_add(&coords, Value::F64(2.0)).unwrap(),
            Value::F64(1.5)
        );
        assert_eq!(h.get(&coords).unwrap(), Value::F64(3.5));
        scope.close().unwrap();
    }

    #[test]
    fn test_unaligned_layout_supports_plain_only() {
        let unaligned = int32().with_byte_alignment(1).unwrap();
        let h = unaligned.var_handle(&[]).unwrap();
        assert!(h.supports(AccessMode::Get));
        assert!(h.supports(AccessMode::Set));
        assert!(!h.supports(AccessMode::GetVolatile));
        assert!(!h.supports(AccessMode::CompareAndSet));
        assert!(!h.supports(AccessMode::GetAndAdd));

        let scope = Scope::confined();
        let seg = scope.allocate(&int32()).unwrap();
        let err = h
            .access(AccessMode::GetVolatile, &seg_coords(&seg), &[])
            .unwrap_err();
        assert!(matches!(err, AccessError::UnsupportedMode { .. }));
        scope.close().unwrap();
    }

    #[test]
    fn test_bitwise_rejected_for_floats_numeric_for_bool() {
        let f = Layout::value(Carrier::F64).var_handle(&[]).unwrap();
        assert!(f.supports(AccessMode::GetAndAdd));
        assert!(!f.supports(AccessMode::GetAndBitwiseXor));

        let b = Layout::value(Carrier::Bool).var_handle(&[]).unwrap();
        assert!(!b.supports(AccessMode::GetAndAdd));
        assert!(b.supports(AccessMode::GetAndBitwiseOr));
        assert!(b.supports(AccessMode::CompareAndSet));
    }

    #[test]
    fn test_misaligned_runtime_target_is_alignment_error() {
        let scope = Scope::confined();
        let seg = scope.allocate_bytes(16, 8).unwrap();
        let h = int32().var_handle(&[]).unwrap();
        let coords = vec![Value::Segment(seg.clone()), Value::I64(2)];
        let err = h
            .access(AccessMode::GetVolatile, &coords, &[])
            .unwrap_err();
        match err {
            AccessError::Misaligned { offset, align, .. } => {
                assert_eq!(offset, 2);
                assert_eq!(align, 4);
            }
            other => panic!("expected alignment error, got {:?}", other),
        }
        scope.close().unwrap();
    }

    #[test]
    fn test_wrong_coordinate_types_fail() {
        let h = int32().var_handle(&[]).unwrap();
        let err = h.get(&[Value::I64(0), Value::I64(0)]).unwrap_err();
        assert!(matches!(err, AccessError::CoordinateMismatch { .. }));
        let err = h.get(&[]).unwrap_err();
        assert!(matches!(err, AccessError::CoordinateMismatch { .. }));
    }

    #[test]
    fn test_wrong_value_type_fails() {
        let scope = Scope::confined();
        let seg = scope.allocate(&int32()).unwrap();
        let h = int32().var_handle(&[]).unwrap();
        let err = h.set(&seg_coords(&seg), Value::I64(1)).unwrap_err();
        assert!(matches!(err, AccessError::CoordinateMismatch { .. }));
        scope.close().unwrap();
    }

    #[test]
    fn test_byte_swapped_plain_access() {
        let foreign = if ByteOrder::native() == ByteOrder::Little {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        };
        let layout = int32().with_order(foreign).unwrap();
        let scope = Scope::confined();
        let seg = scope.allocate(&layout).unwrap();
        let h = layout.var_handle(&[]).unwrap();
        h.set(&seg_coords(&seg), Value::I32(0x0102_0304)).unwrap();
        assert_eq!(h.get(&seg_coords(&seg)).unwrap(), Value::I32(0x0102_0304));
        // Raw native read observes the swapped representation.
        assert_eq!(seg.get_i32(0).unwrap(), 0x0403_0201);
        // Non-native order keeps only plain access.
        assert!(!h.supports(AccessMode::GetVolatile));
        scope.close().unwrap();
    }

    #[test]
    fn test_dereference_path_reads_through_pointer() {
        let scope = Scope::confined();
        let target = scope.allocate(&int32()).unwrap();
        target.set_i32(0, 99).unwrap();

        let ptr_layout = Layout::value(Carrier::Address);
        let holder = scope.allocate(&ptr_layout).unwrap();
        holder.set_address(0, target.physical_address()).unwrap();

        let h = ptr_layout
            .var_handle(&[PathElement::dereference(int32())])
            .unwrap();
        assert_eq!(h.get(&seg_coords(&holder)).unwrap(), Value::I32(99));
        scope.close().unwrap();
    }

    #[test]
    fn test_allocate_value() {
        let scope = Scope::confined();
        let seg = allocate_value(&scope, &int32(), Value::I32(17)).unwrap();
        assert_eq!(seg.get_i32(0).unwrap(), 17);
        scope.close().unwrap();
    }

    #[test]
    fn test_var_handle_requires_value_leaf() {
        let group = Layout::struct_of(vec![int32()]).unwrap();
        let err = group.var_handle(&[]).unwrap_err();
        assert!(err.to_string().contains("does not select a value layout"));
    }
}
