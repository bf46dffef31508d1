//! Structural layout model for native data
//!
//! This module describes the byte shape of native data independently of any
//! concrete memory:
//! - Value layouts for primitive scalars and addresses
//! - Padding layouts that occupy space without storing anything
//! - Sequence layouts for repeated elements
//! - Group layouts for structs and unions
//!
//! All size, alignment, and offset arithmetic is overflow-checked; layouts
//! are immutable once built and every `with_*` operation copies.

pub mod canonical;
pub mod error;
pub mod path;

pub use error::LayoutError;
pub use path::{OffsetHandle, PathElement};

use std::fmt;
use std::sync::Arc;

/// Scalar carrier kinds a value layout can describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Carrier {
    Bool,
    I8,
    I16,
    U16,
    I32,
    I64,
    F32,
    F64,
    Address,
}

impl Carrier {
    /// Natural byte size of the carrier on the host.
    pub fn byte_size(self) -> u64 {
        match self {
            Carrier::Bool | Carrier::I8 => 1,
            Carrier::I16 | Carrier::U16 => 2,
            Carrier::I32 | Carrier::F32 => 4,
            Carrier::I64 | Carrier::F64 => 8,
            Carrier::Address => std::mem::size_of::<usize>() as u64,
        }
    }

    /// Natural alignment equals natural size for every carrier.
    pub fn byte_alignment(self) -> u64 {
        self.byte_size()
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            Carrier::Bool | Carrier::I8 | Carrier::I16 | Carrier::U16 | Carrier::I32 | Carrier::I64
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, Carrier::F32 | Carrier::F64)
    }

    /// One-letter tag used by the compact diagnostic rendering.
    fn letter(self) -> char {
        match self {
            Carrier::Bool => 'z',
            Carrier::I8 => 'b',
            Carrier::I16 => 's',
            Carrier::U16 => 'c',
            Carrier::I32 => 'i',
            Carrier::I64 => 'j',
            Carrier::F32 => 'f',
            Carrier::F64 => 'd',
            Carrier::Address => 'a',
        }
    }
}

/// Byte order of a value layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    /// The host byte order.
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }

    pub fn is_native(self) -> bool {
        self == Self::native()
    }
}

/// Struct vs union member placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupKind {
    Struct,
    Union,
}

/// A primitive scalar or address layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ValueLayout {
    carrier: Carrier,
    order: ByteOrder,
    byte_align: u64,
    name: Option<String>,
}

impl ValueLayout {
    pub fn new(carrier: Carrier) -> Self {
        Self {
            carrier,
            order: ByteOrder::native(),
            byte_align: carrier.byte_alignment(),
            name: None,
        }
    }

    pub fn carrier(&self) -> Carrier {
        self.carrier
    }

    pub fn order(&self) -> ByteOrder {
        self.order
    }

    pub fn byte_size(&self) -> u64 {
        self.carrier.byte_size()
    }

    pub fn byte_alignment(&self) -> u64 {
        self.byte_align
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn with_order(&self, order: ByteOrder) -> Self {
        let mut out = self.clone();
        out.order = order;
        out
    }
}

/// A layout that contributes size but no storage location.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PaddingLayout {
    byte_size: u64,
    byte_align: u64,
    name: Option<String>,
}

impl PaddingLayout {
    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }
}

/// A repetition of one element layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SequenceLayout {
    element: Arc<Layout>,
    element_count: u64,
    byte_size: u64,
    byte_align: u64,
    name: Option<String>,
}

impl SequenceLayout {
    pub fn element_layout(&self) -> &Layout {
        &self.element
    }

    pub fn element_count(&self) -> u64 {
        self.element_count
    }
}

/// An ordered collection of member layouts, placed as a struct or a union.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupLayout {
    kind: GroupKind,
    members: Vec<Layout>,
    byte_size: u64,
    byte_align: u64,
    name: Option<String>,
}

impl GroupLayout {
    pub fn kind(&self) -> GroupKind {
        self.kind
    }

    pub fn member_layouts(&self) -> &[Layout] {
        &self.members
    }

    /// Byte offset of the member at `index`, per this group's placement rule.
    pub fn member_offset(&self, index: usize) -> Option<u64> {
        if index >= self.members.len() {
            return None;
        }
        match self.kind {
            GroupKind::Union => Some(0),
            GroupKind::Struct => {
                let mut offset = 0u64;
                for member in &self.members[..index] {
                    offset += member.byte_size();
                }
                Some(offset)
            }
        }
    }
}

/// A description of native data shape: size, alignment, structure.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Layout {
    Value(ValueLayout),
    Padding(PaddingLayout),
    Sequence(SequenceLayout),
    Group(GroupLayout),
}

/// Align `value` up to `align` (a power of two), overflow-checked.
pub fn align_up(value: u64, align: u64) -> Result<u64, LayoutError> {
    debug_assert!(align.is_power_of_two());
    value
        .checked_add(align - 1)
        .map(|v| v & !(align - 1))
        .ok_or_else(|| LayoutError::overflow(format!("aligning {} up to {}", value, align)))
}

impl Layout {
    /// A value layout with the carrier's natural size, alignment, and the
    /// host byte order.
    pub fn value(carrier: Carrier) -> Layout {
        Layout::Value(ValueLayout::new(carrier))
    }

    /// A padding layout of `byte_size` bytes. Size must be at least 1.
    pub fn padding(byte_size: u64) -> Result<Layout, LayoutError> {
        if byte_size == 0 {
            return Err(LayoutError::construction(
                "padding layout byte size must be >= 1",
            ));
        }
        Ok(Layout::Padding(PaddingLayout {
            byte_size,
            byte_align: 1,
            name: None,
        }))
    }

    /// A sequence of `element_count` repetitions of `element`.
    ///
    /// The element stride must be alignment-clean so array indexing stays
    /// well-defined, and the total size must be representable.
    pub fn sequence(element_count: u64, element: Layout) -> Result<Layout, LayoutError> {
        let elem_size = element.byte_size();
        let elem_align = element.byte_alignment();
        if elem_size % elem_align != 0 {
            return Err(LayoutError::construction(format!(
                "element layout size {} is not a multiple of its alignment {}: {}",
                elem_size, elem_align, element
            )));
        }
        let byte_size = element_count.checked_mul(elem_size).ok_or_else(|| {
            LayoutError::overflow(format!(
                "sequence of {} elements of size {}",
                element_count, elem_size
            ))
        })?;
        Ok(Layout::Sequence(SequenceLayout {
            element: Arc::new(element),
            element_count,
            byte_size,
            byte_align: elem_align,
            name: None,
        }))
    }

    /// A struct layout. Members are placed consecutively; any padding must
    /// be spelled out as an explicit member, both between members and at
    /// the tail.
    pub fn struct_of(members: Vec<Layout>) -> Result<Layout, LayoutError> {
        let mut offset = 0u64;
        let mut align = 1u64;
        for member in &members {
            let member_align = member.byte_alignment();
            if offset % member_align != 0 {
                return Err(LayoutError::construction(format!(
                    "member {} would be placed at offset {} which is not a multiple of its alignment {}; padding must be explicit",
                    member, offset, member_align
                )));
            }
            align = align.max(member_align);
            offset = offset.checked_add(member.byte_size()).ok_or_else(|| {
                LayoutError::overflow(format!("struct size while adding member {}", member))
            })?;
        }
        if offset % align != 0 {
            return Err(LayoutError::construction(format!(
                "struct size {} is not a multiple of alignment {}; trailing padding must be explicit",
                offset, align
            )));
        }
        Ok(Layout::Group(GroupLayout {
            kind: GroupKind::Struct,
            members,
            byte_size: offset,
            byte_align: align,
            name: None,
        }))
    }

    /// A union layout. Size is the largest member size and must be a
    /// multiple of the union alignment.
    pub fn union_of(members: Vec<Layout>) -> Result<Layout, LayoutError> {
        let mut size = 0u64;
        let mut align = 1u64;
        for member in &members {
            size = size.max(member.byte_size());
            align = align.max(member.byte_alignment());
        }
        if size % align != 0 {
            return Err(LayoutError::construction(format!(
                "union size {} is not a multiple of alignment {}; padding must be explicit",
                size, align
            )));
        }
        Ok(Layout::Group(GroupLayout {
            kind: GroupKind::Union,
            members,
            byte_size: size,
            byte_align: align,
            name: None,
        }))
    }

    pub fn byte_size(&self) -> u64 {
        match self {
            Layout::Value(v) => v.byte_size(),
            Layout::Padding(p) => p.byte_size,
            Layout::Sequence(s) => s.byte_size,
            Layout::Group(g) => g.byte_size,
        }
    }

    pub fn byte_alignment(&self) -> u64 {
        match self {
            Layout::Value(v) => v.byte_align,
            Layout::Padding(p) => p.byte_align,
            Layout::Sequence(s) => s.byte_align,
            Layout::Group(g) => g.byte_align,
        }
    }

    /// The alignment this layout would carry had it never been realigned.
    pub fn natural_alignment(&self) -> u64 {
        match self {
            Layout::Value(v) => v.carrier.byte_alignment(),
            Layout::Padding(_) => 1,
            Layout::Sequence(s) => s.element.byte_alignment(),
            Layout::Group(g) => g
                .members
                .iter()
                .map(|m| m.byte_alignment())
                .max()
                .unwrap_or(1),
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Layout::Value(v) => v.name.as_deref(),
            Layout::Padding(p) => p.name.as_deref(),
            Layout::Sequence(s) => s.name.as_deref(),
            Layout::Group(g) => g.name.as_deref(),
        }
    }

    pub fn as_value(&self) -> Option<&ValueLayout> {
        match self {
            Layout::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_group(&self) -> Option<&GroupLayout> {
        match self {
            Layout::Group(g) => Some(g),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&SequenceLayout> {
        match self {
            Layout::Sequence(s) => Some(s),
            _ => None,
        }
    }

    /// Copy of this layout carrying `name`. The name participates in
    /// structural equality and in group member lookup.
    pub fn with_name(&self, name: impl Into<String>) -> Layout {
        let mut out = self.clone();
        let slot = match &mut out {
            Layout::Value(v) => &mut v.name,
            Layout::Padding(p) => &mut p.name,
            Layout::Sequence(s) => &mut s.name,
            Layout::Group(g) => &mut g.name,
        };
        *slot = Some(name.into());
        out
    }

    /// Copy of this layout with no name.
    pub fn without_name(&self) -> Layout {
        let mut out = self.clone();
        let slot = match &mut out {
            Layout::Value(v) => &mut v.name,
            Layout::Padding(p) => &mut p.name,
            Layout::Sequence(s) => &mut s.name,
            Layout::Group(g) => &mut g.name,
        };
        *slot = None;
        out
    }

    /// Copy of this layout with an explicit byte alignment.
    ///
    /// The alignment must be a power of two. Value layouts accept any such
    /// alignment (widening enables the extended access-mode families,
    /// narrowing restricts the layout to plain access); composite layouts
    /// additionally require their size to remain a multiple of the
    /// alignment.
    pub fn with_byte_alignment(&self, byte_align: u64) -> Result<Layout, LayoutError> {
        if !byte_align.is_power_of_two() {
            return Err(LayoutError::construction(format!(
                "Invalid alignment: {} is not a power of two",
                byte_align
            )));
        }
        if !matches!(self, Layout::Value(_)) && self.byte_size() % byte_align != 0 {
            return Err(LayoutError::construction(format!(
                "Invalid alignment: size {} of {} is not a multiple of {}",
                self.byte_size(),
                self,
                byte_align
            )));
        }
        let mut out = self.clone();
        let slot = match &mut out {
            Layout::Value(v) => &mut v.byte_align,
            Layout::Padding(p) => &mut p.byte_align,
            Layout::Sequence(s) => &mut s.byte_align,
            Layout::Group(g) => &mut g.byte_align,
        };
        *slot = byte_align;
        Ok(out)
    }

    /// Copy of a value layout with the given byte order.
    pub fn with_order(&self, order: ByteOrder) -> Result<Layout, LayoutError> {
        match self {
            Layout::Value(v) => Ok(Layout::Value(v.with_order(order))),
            other => Err(LayoutError::construction(format!(
                "byte order applies only to value layouts, not {}",
                other
            ))),
        }
    }

    /// `offset + index * byte_size`, rejecting negative inputs and overflow.
    pub fn scale(&self, offset: i64, index: i64) -> Result<i64, LayoutError> {
        if offset < 0 {
            return Err(LayoutError::construction("offset is negative"));
        }
        if index < 0 {
            return Err(LayoutError::construction("index is negative"));
        }
        let size = i64::try_from(self.byte_size())
            .map_err(|_| LayoutError::overflow(format!("byte size of {}", self)))?;
        index
            .checked_mul(size)
            .and_then(|scaled| offset.checked_add(scaled))
            .ok_or_else(|| {
                LayoutError::overflow(format!("scaling offset {} by index {}", offset, index))
            })
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layout::Value(v) => {
                let letter = if v.order.is_native() {
                    v.carrier.letter()
                } else {
                    v.carrier.letter().to_ascii_uppercase()
                };
                write!(f, "{}{}", letter, v.byte_size())?;
            }
            Layout::Padding(p) => write!(f, "x{}", p.byte_size)?,
            Layout::Sequence(s) => write!(f, "[{}:{}]", s.element_count, s.element)?,
            Layout::Group(g) => {
                write!(f, "[")?;
                for (i, member) in g.members.iter().enumerate() {
                    if i > 0 && g.kind == GroupKind::Union {
                        write!(f, "|")?;
                    }
                    write!(f, "{}", member)?;
                }
                write!(f, "]{}", g.byte_size)?;
            }
        }
        if self.byte_alignment() != self.natural_alignment() {
            write!(f, "%{}", self.byte_alignment())?;
        }
        if let Some(name) = self.name() {
            write!(f, "({})", name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int32() -> Layout {
        Layout::value(Carrier::I32)
    }

    fn int64() -> Layout {
        Layout::value(Carrier::I64)
    }

    #[test]
    fn test_value_layout_natural_shape() {
        let l = int32();
        assert_eq!(l.byte_size(), 4);
        assert_eq!(l.byte_alignment(), 4);
        assert_eq!(Layout::value(Carrier::Address).byte_size(), 8);
    }

    #[test]
    fn test_padding_requires_nonzero_size() {
        assert!(Layout::padding(0).is_err());
        assert_eq!(Layout::padding(3).unwrap().byte_size(), 3);
    }

    #[test]
    fn test_struct_size_and_alignment() {
        let s = Layout::struct_of(vec![
            int32().with_name("x"),
            int32().with_name("y"),
        ])
        .unwrap();
        assert_eq!(s.byte_size(), 8);
        assert_eq!(s.byte_alignment(), 4);
        assert_eq!(s.byte_size() % s.byte_alignment(), 0);
    }

    #[test]
    fn test_struct_rejects_implicit_gaps() {
        // short at offset 0, then int at offset 2: misaligned without padding
        let err = Layout::struct_of(vec![Layout::value(Carrier::I16), int32()]).unwrap_err();
        assert!(err.to_string().contains("padding must be explicit"));

        // Explicit padding makes it legal.
        let ok = Layout::struct_of(vec![
            Layout::value(Carrier::I16),
            Layout::padding(2).unwrap(),
            int32(),
        ])
        .unwrap();
        assert_eq!(ok.byte_size(), 8);
    }

    #[test]
    fn test_struct_rejects_missing_trailing_padding() {
        let err = Layout::struct_of(vec![int64(), int32()]).unwrap_err();
        assert!(err.to_string().contains("trailing padding must be explicit"));
    }

    #[test]
    fn test_union_size_is_max_member_size() {
        let u = Layout::union_of(vec![int64(), int32()]).unwrap();
        assert_eq!(u.byte_size(), 8);
        assert_eq!(u.byte_alignment(), 8);
    }

    #[test]
    fn test_union_rejects_unpadded_size() {
        // max size 3, alignment 2
        let seq = Layout::sequence(3, Layout::value(Carrier::I8)).unwrap();
        let err = Layout::union_of(vec![seq, Layout::value(Carrier::I16)]).unwrap_err();
        assert!(err.to_string().contains("is not a multiple of alignment"));
    }

    #[test]
    fn test_sequence_stride_must_be_alignment_clean() {
        // size 6, alignment 4: indexing would break alignment after element 0
        let elem = Layout::struct_of(vec![int32(), Layout::value(Carrier::I16)]);
        assert!(elem.is_err()); // cannot even build the unpadded struct

        let elem = int32().with_byte_alignment(8).unwrap();
        let err = Layout::sequence(2, elem).unwrap_err();
        assert!(err.to_string().contains("not a multiple of its alignment"));
    }

    #[test]
    fn test_sequence_overflow_fails() {
        let err = Layout::sequence(u64::MAX / 2, int32()).unwrap_err();
        assert!(matches!(err, LayoutError::ArithmeticOverflow { .. }));
    }

    #[test]
    fn test_zero_length_sequence() {
        let s = Layout::sequence(0, int32()).unwrap();
        assert_eq!(s.byte_size(), 0);
        assert_eq!(s.byte_alignment(), 4);
    }

    #[test]
    fn test_alignment_must_be_power_of_two() {
        for bad in [0u64, 3, 6, 12] {
            assert!(int32().with_byte_alignment(bad).is_err(), "align {}", bad);
        }
        assert_eq!(int32().with_byte_alignment(8).unwrap().byte_alignment(), 8);
        assert_eq!(int32().with_byte_alignment(1).unwrap().byte_alignment(), 1);
    }

    #[test]
    fn test_composite_realignment_keeps_size_invariant() {
        let s = Layout::struct_of(vec![int32(), int32()]).unwrap();
        assert!(s.with_byte_alignment(8).is_ok());
        assert!(s.with_byte_alignment(16).is_err()); // 8 % 16 != 0
    }

    #[test]
    fn test_name_participates_in_equality() {
        let a = int32();
        let b = int32().with_name("x");
        assert_ne!(a, b);
        assert_eq!(b, int32().with_name("x"));
    }

    #[test]
    fn test_compact_display() {
        assert_eq!(int32().to_string(), "i4");
        assert_eq!(int32().with_byte_alignment(2).unwrap().to_string(), "i4%2");
        assert_eq!(
            Layout::sequence(2, int32()).unwrap().to_string(),
            "[2:i4]"
        );
        let s = Layout::struct_of(vec![int32(), Layout::value(Carrier::I16).with_name("x"), Layout::padding(2).unwrap()])
            .unwrap();
        assert_eq!(s.to_string(), "[i4s2(x)x2]8");
        let u = Layout::union_of(vec![int32(), int64()]).unwrap();
        assert_eq!(u.to_string(), "[i4|j8]8");
        let non_native = int32()
            .with_order(if ByteOrder::native() == ByteOrder::Little {
                ByteOrder::Big
            } else {
                ByteOrder::Little
            })
            .unwrap();
        assert_eq!(non_native.to_string(), "I4");
    }

    #[test]
    fn test_scale() {
        let l = int32();
        assert_eq!(l.scale(8, 2).unwrap(), 16);
        assert!(l.scale(-1, 0).unwrap_err().to_string().contains("offset is negative"));
        assert!(l.scale(0, -1).unwrap_err().to_string().contains("index is negative"));
        assert!(matches!(
            l.scale(i64::MAX, i64::MAX / 4),
            Err(LayoutError::ArithmeticOverflow { .. })
        ));
    }
}
