//! Path addressing into nested layouts
//!
//! A path is an ordered list of elements resolved against a root layout.
//! Resolution produces the selected sub-layout and the cumulative byte
//! offset, either as a constant (`byte_offset`) or as a function of the
//! runtime indices supplied for unbound elements (`byte_offset_handle`).
//!
//! Offsets accumulate through checked arithmetic only; an offset that
//! leaves the representable range raises the arithmetic-overflow condition
//! instead of wrapping.

use super::error::LayoutError;
use super::{Carrier, Layout};

/// One step of a layout path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathElement {
    /// Select a named group member.
    GroupByName(String),
    /// Select a group member by position.
    GroupByIndex(u64),
    /// Select a sequence element whose index is supplied at invocation.
    SequenceAny,
    /// Select the sequence element at a fixed index.
    SequenceAt(i64),
    /// Select sequence elements `start + step * k` for a runtime `k`.
    SequenceRange { start: i64, step: i64 },
    /// Follow an address stored at the current location into a fresh
    /// region described by the target layout.
    Dereference(Box<Layout>),
}

impl PathElement {
    pub fn group_name(name: impl Into<String>) -> Self {
        PathElement::GroupByName(name.into())
    }

    pub fn group_index(index: u64) -> Self {
        PathElement::GroupByIndex(index)
    }

    pub fn sequence() -> Self {
        PathElement::SequenceAny
    }

    pub fn sequence_at(index: i64) -> Self {
        PathElement::SequenceAt(index)
    }

    pub fn sequence_range(start: i64, step: i64) -> Self {
        PathElement::SequenceRange { start, step }
    }

    pub fn dereference(target: Layout) -> Self {
        PathElement::Dereference(Box::new(target))
    }
}

/// One resolved step: either a constant offset contribution, a scaled
/// runtime index, or a pointer hop.
#[derive(Debug, Clone)]
pub(crate) enum Step {
    Fixed(u64),
    Index {
        stride: u64,
        count: u64,
        start: u64,
        step: i64,
    },
    Deref { target_size: u64 },
}

/// Outcome of resolving a full path against a root layout.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedPath {
    pub leaf: Layout,
    pub steps: Vec<Step>,
}

impl ResolvedPath {
    pub fn free_index_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s, Step::Index { .. }))
            .count()
    }

    pub fn has_deref(&self) -> bool {
        self.steps.iter().any(|s| matches!(s, Step::Deref { .. }))
    }

    /// Constant part of the offset, valid only when no free index or
    /// dereference precedes it.
    pub fn constant_offset(&self) -> Result<u64, LayoutError> {
        let mut offset = 0u64;
        for step in &self.steps {
            match step {
                Step::Fixed(n) => {
                    offset = offset
                        .checked_add(*n)
                        .ok_or_else(|| LayoutError::overflow("path offset"))?;
                }
                Step::Index { .. } => {
                    return Err(LayoutError::path(
                        "path contains an unbound sequence element; \
                         supply indices through byte_offset_handle",
                    ));
                }
                Step::Deref { .. } => {
                    return Err(LayoutError::path(
                        "offset computation cannot cross a dereference element",
                    ));
                }
            }
        }
        Ok(offset)
    }
}

fn wrong_kind(wanted: &str, found: &Layout, enclosing: &[Layout]) -> LayoutError {
    let mut message = format!(
        "attempting to select a {} element from a non-{} layout: {}",
        wanted, wanted, found
    );
    for encl in enclosing.iter().rev() {
        message.push_str(&format!(", selected from: {}", encl));
    }
    LayoutError::path(message)
}

/// Resolve `path` against `root`, producing the leaf layout and the step
/// list all consumers (offsets, offset handles, accessors) share.
pub(crate) fn resolve(root: &Layout, path: &[PathElement]) -> Result<ResolvedPath, LayoutError> {
    let mut current = root.clone();
    let mut enclosing: Vec<Layout> = Vec::new();
    let mut steps = Vec::new();

    for element in path {
        match element {
            PathElement::GroupByName(name) => {
                let group = match current.as_group() {
                    Some(g) => g,
                    None => return Err(wrong_kind("group", &current, &enclosing)),
                };
                let position = group
                    .member_layouts()
                    .iter()
                    .position(|m| m.name() == Some(name.as_str()))
                    .ok_or_else(|| {
                        LayoutError::path(format!(
                            "cannot resolve '{}' in layout {}",
                            name, current
                        ))
                    })?;
                let offset = group.member_offset(position).unwrap_or(0);
                let selected = group.member_layouts()[position].clone();
                steps.push(Step::Fixed(offset));
                enclosing.push(std::mem::replace(&mut current, selected));
            }
            PathElement::GroupByIndex(index) => {
                let group = match current.as_group() {
                    Some(g) => g,
                    None => return Err(wrong_kind("group", &current, &enclosing)),
                };
                let position = usize::try_from(*index).ok();
                let member = position.and_then(|p| group.member_layouts().get(p));
                let member = match member {
                    Some(m) => m.clone(),
                    None => {
                        return Err(LayoutError::path(format!(
                            "cannot resolve member index {} in layout {} with {} members",
                            index,
                            current,
                            group.member_layouts().len()
                        )));
                    }
                };
                let offset = group.member_offset(position.unwrap()).unwrap_or(0);
                steps.push(Step::Fixed(offset));
                enclosing.push(std::mem::replace(&mut current, member));
            }
            PathElement::SequenceAny => {
                let seq = match current.as_sequence() {
                    Some(s) => s,
                    None => return Err(wrong_kind("sequence", &current, &enclosing)),
                };
                steps.push(Step::Index {
                    stride: seq.element_layout().byte_size(),
                    count: seq.element_count(),
                    start: 0,
                    step: 1,
                });
                let element = seq.element_layout().clone();
                enclosing.push(std::mem::replace(&mut current, element));
            }
            PathElement::SequenceAt(index) => {
                let seq = match current.as_sequence() {
                    Some(s) => s,
                    None => return Err(wrong_kind("sequence", &current, &enclosing)),
                };
                let count = seq.element_count();
                if *index < 0 || *index as u64 >= count {
                    return Err(LayoutError::path(format!(
                        "sequence index {} is out of bounds for layout {}",
                        index, current
                    )));
                }
                let offset = (*index as u64)
                    .checked_mul(seq.element_layout().byte_size())
                    .ok_or_else(|| LayoutError::overflow("sequence element offset"))?;
                steps.push(Step::Fixed(offset));
                let element = seq.element_layout().clone();
                enclosing.push(std::mem::replace(&mut current, element));
            }
            PathElement::SequenceRange { start, step } => {
                let seq = match current.as_sequence() {
                    Some(s) => s,
                    None => return Err(wrong_kind("sequence", &current, &enclosing)),
                };
                if *step == 0 {
                    return Err(LayoutError::path(format!(
                        "zero step in strided sequence element over layout {}",
                        current
                    )));
                }
                let count = seq.element_count();
                if *start < 0 || *start as u64 >= count {
                    return Err(LayoutError::path(format!(
                        "strided sequence start {} is out of bounds for layout {}",
                        start, current
                    )));
                }
                steps.push(Step::Index {
                    stride: seq.element_layout().byte_size(),
                    count,
                    start: *start as u64,
                    step: *step,
                });
                let element = seq.element_layout().clone();
                enclosing.push(std::mem::replace(&mut current, element));
            }
            PathElement::Dereference(target) => {
                let is_address = current
                    .as_value()
                    .map(|v| v.carrier() == Carrier::Address)
                    .unwrap_or(false);
                if !is_address {
                    return Err(LayoutError::path(format!(
                        "attempting to dereference a non-address layout: {}",
                        current
                    )));
                }
                steps.push(Step::Deref {
                    target_size: target.byte_size(),
                });
                enclosing.push(std::mem::replace(&mut current, (**target).clone()));
            }
        }
    }

    Ok(ResolvedPath {
        leaf: current,
        steps,
    })
}

/// A computed-offset function over a resolved path: one `i64` index per
/// unbound path element, supplied left to right.
#[derive(Debug, Clone)]
pub struct OffsetHandle {
    steps: Vec<Step>,
    free_indices: usize,
}

impl OffsetHandle {
    pub(crate) fn new(resolved: &ResolvedPath) -> Result<Self, LayoutError> {
        if resolved.has_deref() {
            return Err(LayoutError::path(
                "offset computation cannot cross a dereference element",
            ));
        }
        Ok(Self {
            free_indices: resolved.free_index_count(),
            steps: resolved.steps.clone(),
        })
    }

    /// Number of runtime indices `offset` expects.
    pub fn free_index_count(&self) -> usize {
        self.free_indices
    }

    /// Compute the byte offset for the supplied indices.
    pub fn offset(&self, indices: &[i64]) -> Result<u64, LayoutError> {
        if indices.len() != self.free_indices {
            return Err(LayoutError::path(format!(
                "expected {} indices, got {}",
                self.free_indices,
                indices.len()
            )));
        }
        let mut next = 0usize;
        let mut offset = 0u64;
        for step in &self.steps {
            let contribution = match step {
                Step::Fixed(n) => *n,
                Step::Index {
                    stride,
                    count,
                    start,
                    step,
                } => {
                    let k = indices[next];
                    next += 1;
                    let logical = (*start as i128) + (*step as i128) * (k as i128);
                    if k < 0 || logical < 0 || logical >= *count as i128 {
                        return Err(LayoutError::IndexOutOfBounds {
                            index: k,
                            count: *count,
                        });
                    }
                    u64::try_from(logical)
                        .ok()
                        .and_then(|l| l.checked_mul(*stride))
                        .ok_or_else(|| LayoutError::overflow("scaled sequence offset"))?
                }
                Step::Deref { .. } => unreachable!("rejected at construction"),
            };
            offset = offset
                .checked_add(contribution)
                .ok_or_else(|| LayoutError::overflow("accumulated path offset"))?;
        }
        Ok(offset)
    }
}

impl Layout {
    /// The sub-layout a path selects. Only group elements and the unbound
    /// sequence element describe a selection; bound, strided, and
    /// dereference elements are rejected here.
    pub fn select(&self, path: &[PathElement]) -> Result<Layout, LayoutError> {
        for element in path {
            match element {
                PathElement::GroupByName(_)
                | PathElement::GroupByIndex(_)
                | PathElement::SequenceAny => {}
                other => {
                    return Err(LayoutError::path(format!(
                        "selection does not accept bound, strided, or dereference elements: {:?}",
                        other
                    )));
                }
            }
        }
        resolve(self, path).map(|r| r.leaf)
    }

    /// Constant byte offset of a fully bound path.
    pub fn byte_offset(&self, path: &[PathElement]) -> Result<u64, LayoutError> {
        resolve(self, path)?.constant_offset()
    }

    /// Offset function over a path that may contain unbound elements.
    pub fn byte_offset_handle(&self, path: &[PathElement]) -> Result<OffsetHandle, LayoutError> {
        OffsetHandle::new(&resolve(self, path)?)
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
    fn test_struct_member_offsets() {
        let point = Layout::struct_of(vec![
            int32().with_name("x"),
            int32().with_name("y"),
        ])
        .unwrap();
        assert_eq!(point.byte_offset(&[PathElement::group_name("x")]).unwrap(), 0);
        assert_eq!(point.byte_offset(&[PathElement::group_name("y")]).unwrap(), 4);
        assert_eq!(point.byte_offset(&[PathElement::group_index(1)]).unwrap(), 4);
    }

    #[test]
    fn test_sequence_offsets_scale_by_element_size() {
        let seq = Layout::sequence(5, int32()).unwrap();
        for i in 0..5 {
            assert_eq!(
                seq.byte_offset(&[PathElement::sequence_at(i)]).unwrap(),
                i as u64 * 4
            );
        }
    }

    #[test]
    fn test_static_out_of_bounds_fails_at_resolution() {
        let seq = Layout::sequence(5, int32()).unwrap();
        assert!(seq.byte_offset(&[PathElement::sequence_at(5)]).is_err());
        assert!(seq.byte_offset(&[PathElement::sequence_at(-2)]).is_err());
    }

    #[test]
    fn test_unknown_member_fails() {
        let g = Layout::struct_of(vec![int32().with_name("x")]).unwrap();
        let err = g.byte_offset(&[PathElement::group_name("foo")]).unwrap_err();
        assert!(err.to_string().contains("cannot resolve 'foo'"));
        assert!(g.byte_offset(&[PathElement::group_index(1)]).is_err());
    }

    #[test]
    fn test_sequence_element_on_group_fails_with_chain() {
        let g = Layout::struct_of(vec![int32(), int32()]).unwrap();
        let err = g.select(&[PathElement::sequence()]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Bad layout path: attempting to select a sequence element \
             from a non-sequence layout: [i4i4]8"
        );
    }

    #[test]
    fn test_nested_chain_in_error_message() {
        let inner = Layout::struct_of(vec![
            int32().with_name("3a"),
            int32().with_name("3b"),
        ])
        .unwrap()
        .with_name("2");
        let seq = Layout::sequence(2, inner).unwrap().with_name("1");
        let root = Layout::struct_of(vec![seq]).unwrap().with_name("0");

        let err = root
            .select(&[
                PathElement::group_name("1"),
                PathElement::sequence(),
                PathElement::sequence(),
            ])
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("non-sequence layout: [i4(3a)i4(3b)]8(2)"));
        assert!(message.contains("selected from: [2:[i4(3a)i4(3b)]8(2)](1)"));
        assert!(message.contains("selected from: [[2:[i4(3a)i4(3b)]8(2)](1)]16(0)"));
    }

    #[test]
    fn test_byte_offset_rejects_unbound_elements() {
        let seq = Layout::sequence(10, int32()).unwrap();
        assert!(seq.byte_offset(&[PathElement::sequence()]).is_err());
        assert!(seq.byte_offset(&[PathElement::sequence_range(0, 2)]).is_err());
    }

    #[test]
    fn test_select_rejects_bound_elements() {
        let seq = Layout::sequence(10, int32()).unwrap();
        assert!(seq.select(&[PathElement::sequence_at(0)]).is_err());
        assert!(seq.select(&[PathElement::sequence_range(0, 2)]).is_err());
        assert_eq!(seq.select(&[PathElement::sequence()]).unwrap(), int32());
    }

    #[test]
    fn test_offset_handle_unbound_index() {
        let seq = Layout::sequence(4, int32()).unwrap();
        let handle = seq.byte_offset_handle(&[PathElement::sequence()]).unwrap();
        assert_eq!(handle.free_index_count(), 1);
        assert_eq!(handle.offset(&[0]).unwrap(), 0);
        assert_eq!(handle.offset(&[3]).unwrap(), 12);
        assert!(matches!(
            handle.offset(&[4]),
            Err(LayoutError::IndexOutOfBounds { index: 4, count: 4 })
        ));
        assert!(handle.offset(&[-1]).is_err());
    }

    #[test]
    fn test_offset_handle_strided_range() {
        let seq = Layout::sequence(10, int32()).unwrap();
        let handle = seq
            .byte_offset_handle(&[PathElement::sequence_range(1, 2)])
            .unwrap();
        // k -> element 1 + 2k
        assert_eq!(handle.offset(&[0]).unwrap(), 4);
        assert_eq!(handle.offset(&[3]).unwrap(), 28);
        assert!(handle.offset(&[5]).is_err()); // element 11 out of 10
    }

    #[test]
    fn test_strided_range_validation() {
        let seq = Layout::sequence(5, int32()).unwrap();
        assert!(seq
            .byte_offset_handle(&[PathElement::sequence_range(5, 1)])
            .is_err());
        assert!(seq
            .byte_offset_handle(&[PathElement::sequence_range(-2, 2)])
            .is_err());
        let err = seq
            .byte_offset_handle(&[PathElement::sequence_range(0, 0)])
            .unwrap_err();
        assert!(err.to_string().contains("zero step"));
    }

    #[test]
    fn test_descending_through_value_layout_fails() {
        let seq = Layout::sequence(2, int32()).unwrap();
        let err = seq
            .select(&[PathElement::sequence(), PathElement::sequence()])
            .unwrap_err();
        assert!(err.to_string().contains("non-sequence layout: i4"));
    }

    #[test]
    fn test_deref_rejected_in_offsets() {
        let ptr = Layout::value(Carrier::Address);
        let handle = ptr.byte_offset_handle(&[PathElement::dereference(int32())]);
        assert!(handle.is_err());
        let err = ptr
            .byte_offset(&[PathElement::dereference(int32())])
            .unwrap_err();
        assert!(err.to_string().contains("dereference"));
    }

    #[test]
    fn test_deref_requires_address_layout() {
        let err = int32()
            .byte_offset(&[PathElement::dereference(int32())])
            .unwrap_err();
        assert!(err.to_string().contains("non-address layout"));
    }

    #[test]
    fn test_nested_handle_mixes_fixed_and_free() {
        let row = Layout::sequence(3, int32()).unwrap();
        let grid = Layout::sequence(4, row).unwrap();
        let handle = grid
            .byte_offset_handle(&[PathElement::sequence(), PathElement::sequence_at(2)])
            .unwrap();
        assert_eq!(handle.offset(&[1]).unwrap(), 12 + 8);
    }
}
