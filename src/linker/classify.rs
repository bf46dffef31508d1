//! Structural layout validation and ABI classification
//!
//! Validation is universal: byte order, natural alignment, and padding
//! placement rules hold on every platform. Classification is table-driven:
//! the host table lowers each layout into machine call slots (eightbyte
//! classes on SysV x86-64, HFA detection on AArch64 AAPCS).

use target_lexicon::{Architecture, Triple};

use super::{FunctionDescriptor, LinkerError, OptionSet};
use crate::layout::{align_up, Carrier, GroupKind, Layout};

/// Machine slot types a classified value occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotKind {
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
}

impl SlotKind {
    /// Width of the slot's in-memory representation when packing or
    /// unpacking group contents.
    pub(crate) fn byte_width(self) -> u64 {
        match self {
            SlotKind::I8 => 1,
            SlotKind::I16 => 2,
            SlotKind::I32 | SlotKind::F32 => 4,
            SlotKind::I64 | SlotKind::F64 => 8,
        }
    }
}

/// Integer extension applied to narrow scalar parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Ext {
    None,
    Sext,
    Uext,
}

/// How one argument is lowered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ArgClass {
    /// A scalar in one machine slot.
    Scalar(SlotKind, Ext),
    /// A group decomposed into register slots; the trampoline loads the
    /// slots through a pointer to a copy of the group's bytes.
    SmallGroup(Vec<SlotKind>),
    /// A group passed as a pointer to a caller-owned copy (AAPCS large
    /// aggregates).
    IndirectGroup,
    /// A group copied onto the stack by value (SysV memory class); the
    /// trampoline passes a pointer and the ABI performs the copy.
    MemoryGroup { size: u64 },
}

/// How the return value is lowered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RetClass {
    Void,
    Scalar(SlotKind),
    /// Returned in registers; stored back slot by slot.
    SmallGroup(Vec<SlotKind>),
    /// Returned through a struct-return pointer supplied by the caller.
    IndirectSret,
}

/// A fully classified call: everything the trampoline compiler and the
/// call-time marshaller need.
#[derive(Debug, Clone)]
pub(crate) struct CallPlan {
    pub args: Vec<(Layout, ArgClass)>,
    pub ret_layout: Option<Layout>,
    pub ret: RetClass,
    pub variadic_index: Option<usize>,
    pub capture: Option<Vec<String>>,
    pub critical: Option<bool>,
}

// Frame layout shared by downcall trampolines and upcall stubs:
// [0..8)   target address (downcall) / unused (upcall)
// [8..16)  capture buffer address, 0 when unused
// [16..48) return storage, one 8-byte slot per return register (up to
//          four for homogeneous float aggregates), or the struct-return
//          pointer at [16..24)
// [48..)   one 8-byte slot per argument
pub(crate) const FRAME_TARGET: i32 = 0;
pub(crate) const FRAME_CAPTURE: i32 = 8;
pub(crate) const FRAME_RET: i32 = 16;
pub(crate) const FRAME_ARGS: i32 = 48;

pub(crate) fn frame_size(argument_count: usize) -> usize {
    FRAME_ARGS as usize + 8 * argument_count
}

/// The machine slot and extension for a scalar carrier.
pub(crate) fn scalar_slot(carrier: Carrier) -> (SlotKind, Ext) {
    match carrier {
        Carrier::Bool => (SlotKind::I8, Ext::Uext),
        Carrier::I8 => (SlotKind::I8, Ext::Sext),
        Carrier::I16 => (SlotKind::I16, Ext::Sext),
        Carrier::U16 => (SlotKind::I16, Ext::Uext),
        Carrier::I32 => (SlotKind::I32, Ext::Sext),
        Carrier::I64 => (SlotKind::I64, Ext::None),
        Carrier::F32 => (SlotKind::F32, Ext::None),
        Carrier::F64 => (SlotKind::F64, Ext::None),
        Carrier::Address => (SlotKind::I64, Ext::None),
    }
}

/// Name-free structural rendering of a layout, used for diagnostics and
/// call-plan identity.
pub(crate) fn canonical(layout: &Layout) -> String {
    let stripped = strip_names(layout);
    stripped.to_string()
}

fn strip_names(layout: &Layout) -> Layout {
    match layout {
        Layout::Value(_) | Layout::Padding(_) => layout.without_name(),
        Layout::Sequence(s) => {
            let element = strip_names(s.element_layout());
            Layout::sequence(s.element_count(), element)
                .and_then(|l| l.with_byte_alignment(layout.byte_alignment()))
                .expect("existing sequence restripes cleanly")
        }
        Layout::Group(g) => {
            let members = g.member_layouts().iter().map(strip_names).collect();
            match g.kind() {
                GroupKind::Struct => Layout::struct_of(members),
                GroupKind::Union => Layout::union_of(members),
            }
            .and_then(|l| l.with_byte_alignment(layout.byte_alignment()))
            .expect("existing group restripes cleanly")
        }
    }
}

/// Platform-specific classification rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Arch {
    X86_64SysV,
    Aarch64Aapcs,
}

/// The pluggable per-platform table: classification strategy plus the
/// recognized call-state slots.
pub struct PlatformAbi {
    pub name: &'static str,
    pub(crate) arch: Arch,
    pub capture_slots: &'static [&'static str],
}

static SYSV: PlatformAbi = PlatformAbi {
    name: "sysv-x86_64",
    arch: Arch::X86_64SysV,
    capture_slots: &["errno"],
};

static AAPCS: PlatformAbi = PlatformAbi {
    name: "aapcs-aarch64",
    arch: Arch::Aarch64Aapcs,
    capture_slots: &["errno"],
};

impl PlatformAbi {
    pub fn host() -> &'static PlatformAbi {
        match Triple::host().architecture {
            Architecture::Aarch64(_) => &AAPCS,
            _ => &SYSV,
        }
    }

    /// Validate then classify a full descriptor under the given options.
    pub(crate) fn classify(
        &self,
        descriptor: &FunctionDescriptor,
        options: &OptionSet,
    ) -> Result<CallPlan, LinkerError> {
        for layout in descriptor.argument_layouts() {
            check_parameter(layout)?;
        }
        if let Some(ret) = descriptor.return_layout() {
            check_parameter(ret)?;
        }
        if let Some(index) = options.variadic_index {
            for layout in &descriptor.argument_layouts()[index..] {
                check_variadic(layout)?;
            }
        }

        let mut args = Vec::with_capacity(descriptor.argument_layouts().len());
        for layout in descriptor.argument_layouts() {
            args.push((layout.clone(), self.classify_arg(layout)));
        }
        let (ret_layout, ret) = match descriptor.return_layout() {
            None => (None, RetClass::Void),
            Some(layout) => (Some(layout.clone()), self.classify_ret(layout)),
        };
        Ok(CallPlan {
            args,
            ret_layout,
            ret,
            variadic_index: options.variadic_index,
            capture: options.capture.clone(),
            critical: options.critical,
        })
    }

    fn classify_arg(&self, layout: &Layout) -> ArgClass {
        match layout {
            Layout::Value(v) => {
                let (slot, ext) = scalar_slot(v.carrier());
                ArgClass::Scalar(slot, ext)
            }
            Layout::Group(_) => match self.arch {
                Arch::X86_64SysV => {
                    let size = layout.byte_size();
                    if size > 16 {
                        ArgClass::MemoryGroup {
                            size: align_up(size, 8).unwrap_or(size),
                        }
                    } else {
                        ArgClass::SmallGroup(sysv_eightbytes(layout))
                    }
                }
                Arch::Aarch64Aapcs => match aapcs_slots(layout) {
                    Some(slots) => ArgClass::SmallGroup(slots),
                    None => ArgClass::IndirectGroup,
                },
            },
            Layout::Sequence(_) | Layout::Padding(_) => {
                unreachable!("rejected by check_parameter")
            }
        }
    }

    fn classify_ret(&self, layout: &Layout) -> RetClass {
        match layout {
            Layout::Value(v) => RetClass::Scalar(scalar_slot(v.carrier()).0),
            Layout::Group(_) => match self.arch {
                Arch::X86_64SysV => {
                    if layout.byte_size() > 16 {
                        RetClass::IndirectSret
                    } else {
                        RetClass::SmallGroup(sysv_eightbytes(layout))
                    }
                }
                Arch::Aarch64Aapcs => match aapcs_slots(layout) {
                    Some(slots) => RetClass::SmallGroup(slots),
                    None => RetClass::IndirectSret,
                },
            },
            Layout::Sequence(_) | Layout::Padding(_) => {
                unreachable!("rejected by check_parameter")
            }
        }
    }
}

// =========================================================================
// Structural validation
// =========================================================================

fn unsupported(layout: &Layout) -> LinkerError {
    LinkerError::UnsupportedLayout {
        layout: canonical(layout),
    }
}

/// A parameter or return layout must be a value or a group.
fn check_parameter(layout: &Layout) -> Result<(), LinkerError> {
    match layout {
        Layout::Value(_) => check_inner(layout),
        Layout::Group(_) => check_inner(layout),
        Layout::Sequence(_) | Layout::Padding(_) => Err(unsupported(layout)),
    }
}

fn check_inner(layout: &Layout) -> Result<(), LinkerError> {
    match layout {
        Layout::Value(v) => {
            if !v.order().is_native() {
                return Err(unsupported(layout));
            }
            if v.byte_alignment() != v.carrier().byte_alignment() {
                return Err(unsupported(layout));
            }
            Ok(())
        }
        Layout::Padding(_) => Err(unsupported(layout)),
        Layout::Sequence(s) => {
            if matches!(s.element_layout(), Layout::Padding(_)) {
                return Err(unsupported(layout));
            }
            check_inner(s.element_layout())
        }
        Layout::Group(_) => check_group(layout),
    }
}

fn check_group(layout: &Layout) -> Result<(), LinkerError> {
    let group = layout.as_group().unwrap();
    if layout.byte_alignment() != layout.natural_alignment() {
        return Err(unsupported(layout));
    }
    let members = group.member_layouts();
    if members.is_empty() || layout.byte_size() == 0 {
        return Err(unsupported(layout));
    }
    if members.iter().all(|m| matches!(m, Layout::Padding(_))) {
        return Err(unsupported(layout));
    }
    match group.kind() {
        GroupKind::Struct => check_struct_members(layout, members),
        GroupKind::Union => check_union_members(layout, members),
    }
}

fn check_struct_members(layout: &Layout, members: &[Layout]) -> Result<(), LinkerError> {
    let group_align = layout.byte_alignment();
    let mut offset = 0u64;
    let mut index = 0usize;
    while index < members.len() {
        let member = &members[index];
        if let Layout::Padding(p) = member {
            if matches!(members.get(index + 1), Some(Layout::Padding(_))) {
                return Err(LinkerError::AdjacentPadding {
                    size: p.byte_size(),
                    offset,
                });
            }
            // Padding is legal only where the next member (or the group
            // tail) actually needs it, and only in the exact amount.
            let next = members[index + 1..]
                .iter()
                .find(|m| !matches!(m, Layout::Padding(_)));
            match next {
                Some(next_member) => {
                    let expected =
                        align_up(offset, next_member.byte_alignment()).unwrap_or(offset) - offset;
                    if p.byte_size() != expected {
                        return Err(LinkerError::UnexpectedOffset {
                            layout: canonical(layout),
                            offset: offset + p.byte_size(),
                            expected: offset + expected,
                        });
                    }
                }
                None => {
                    let expected = align_up(offset, group_align).unwrap_or(offset) - offset;
                    if p.byte_size() != expected {
                        return Err(LinkerError::UnexpectedSize {
                            layout: canonical(layout),
                            actual: layout.byte_size(),
                            expected: offset + expected,
                        });
                    }
                }
            }
            offset += p.byte_size();
        } else {
            check_inner(member)?;
            offset += member.byte_size();
        }
        index += 1;
    }
    if offset != layout.byte_size() {
        return Err(LinkerError::UnexpectedSize {
            layout: canonical(layout),
            actual: layout.byte_size(),
            expected: offset,
        });
    }
    Ok(())
}

fn check_union_members(layout: &Layout, members: &[Layout]) -> Result<(), LinkerError> {
    let mut padding: Option<u64> = None;
    let mut max_storage = 0u64;
    for member in members {
        if let Layout::Padding(p) = member {
            if padding.is_some() {
                return Err(LinkerError::AdjacentPadding {
                    size: p.byte_size(),
                    offset: 0,
                });
            }
            padding = Some(p.byte_size());
        } else {
            check_inner(member)?;
            max_storage = max_storage.max(member.byte_size());
        }
    }
    if let Some(pad) = padding {
        // Union padding may only widen the union beyond its largest
        // member; anything else is superfluous.
        if pad <= max_storage || pad != layout.byte_size() {
            return Err(LinkerError::UnexpectedSize {
                layout: canonical(layout),
                actual: pad,
                expected: layout.byte_size().max(max_storage),
            });
        }
    }
    Ok(())
}

fn check_variadic(layout: &Layout) -> Result<(), LinkerError> {
    let legal = match layout {
        Layout::Value(v) => matches!(
            v.carrier(),
            Carrier::I32 | Carrier::I64 | Carrier::F64 | Carrier::Address
        ),
        Layout::Group(_) => true,
        _ => false,
    };
    if legal {
        Ok(())
    } else {
        Err(LinkerError::InvalidOption {
            message: format!("Invalid variadic argument layout: {}", canonical(layout)),
        })
    }
}

// =========================================================================
// Slot decomposition
// =========================================================================

fn collect_value_leaves(layout: &Layout, base: u64, out: &mut Vec<(u64, Carrier)>) {
    match layout {
        Layout::Value(v) => out.push((base, v.carrier())),
        Layout::Padding(_) => {}
        Layout::Sequence(s) => {
            let stride = s.element_layout().byte_size();
            for i in 0..s.element_count() {
                collect_value_leaves(s.element_layout(), base + i * stride, out);
            }
        }
        Layout::Group(g) => match g.kind() {
            GroupKind::Struct => {
                let mut offset = base;
                for member in g.member_layouts() {
                    collect_value_leaves(member, offset, out);
                    offset += member.byte_size();
                }
            }
            GroupKind::Union => {
                for member in g.member_layouts() {
                    collect_value_leaves(member, base, out);
                }
            }
        },
    }
}

/// SysV x86-64 eightbyte classification for groups of at most 16 bytes:
/// a chunk is SSE when every value leaf overlapping it is floating-point,
/// INTEGER otherwise.
fn sysv_eightbytes(layout: &Layout) -> Vec<SlotKind> {
    let size = layout.byte_size();
    let chunks = size.div_ceil(8).max(1);
    let mut leaves = Vec::new();
    collect_value_leaves(layout, 0, &mut leaves);

    let mut slots = Vec::with_capacity(chunks as usize);
    for k in 0..chunks {
        let lo = k * 8;
        let hi = lo + 8;
        let mut all_float = true;
        for (offset, carrier) in &leaves {
            let end = offset + carrier.byte_size();
            if *offset < hi && end > lo && !carrier.is_float() {
                all_float = false;
                break;
            }
        }
        slots.push(if all_float { SlotKind::F64 } else { SlotKind::I64 });
    }
    slots
}

/// AAPCS64 slot decomposition: homogeneous floating-point aggregates of
/// up to four members pass in vector registers; other aggregates of at
/// most 16 bytes pass as one or two doublewords; larger ones go indirect.
fn aapcs_slots(layout: &Layout) -> Option<Vec<SlotKind>> {
    let size = layout.byte_size();
    let mut leaves = Vec::new();
    collect_value_leaves(layout, 0, &mut leaves);

    if !leaves.is_empty() && leaves.len() <= 4 {
        let f32_hfa = leaves.iter().all(|(_, c)| *c == Carrier::F32)
            && size == 4 * leaves.len() as u64;
        if f32_hfa {
            return Some(vec![SlotKind::F32; leaves.len()]);
        }
        let f64_hfa = leaves.iter().all(|(_, c)| *c == Carrier::F64)
            && size == 8 * leaves.len() as u64;
        if f64_hfa {
            return Some(vec![SlotKind::F64; leaves.len()]);
        }
    }
    if size <= 16 {
        return Some(vec![SlotKind::I64; size.div_ceil(8).max(1) as usize]);
    }
    None
}
