//! Accessor combinators
//!
//! Pure transformations over an existing `VarHandle`. Each combinator
//! returns a new immutable handle wrapping the previous one; coordinate
//! and value signatures are adjusted at construction and every signature
//! rule is checked eagerly there. The wrapped handle's full access-mode
//! set is preserved.

use std::sync::Arc;

use super::{AccessError, Form, Value, ValueType, VarHandle};

/// A total value conversion with declared input and output types.
///
/// Conversions declare their types so signature rules can be checked when
/// a combinator is built; a conversion that fails at runtime surfaces as
/// an access-time failure, never silently.
#[derive(Clone)]
pub struct ValueFilter {
    input: ValueType,
    output: ValueType,
    func: Arc<dyn Fn(Value) -> Result<Value, String> + Send + Sync>,
}

impl ValueFilter {
    pub fn new(
        input: ValueType,
        output: ValueType,
        func: impl Fn(Value) -> Result<Value, String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            input,
            output,
            func: Arc::new(func),
        }
    }

    pub fn input_type(&self) -> ValueType {
        self.input
    }

    pub fn output_type(&self) -> ValueType {
        self.output
    }

    pub(crate) fn apply(&self, value: Value) -> Result<Value, AccessError> {
        if value.value_type() != self.input {
            return Err(AccessError::CoordinateMismatch {
                message: format!(
                    "conversion expects {:?}, got {:?}",
                    self.input,
                    value.value_type()
                ),
            });
        }
        let out = (self.func)(value).map_err(|message| AccessError::FilterFailed { message })?;
        if out.value_type() != self.output {
            return Err(AccessError::FilterFailed {
                message: format!(
                    "conversion declared {:?} but produced {:?}",
                    self.output,
                    out.value_type()
                ),
            });
        }
        Ok(out)
    }
}

/// A coordinate conversion; same declaration discipline as `ValueFilter`.
pub type CoordFilter = ValueFilter;

/// Folds several coordinates into one (or, for a void combiner, into
/// nothing: the coordinates are consumed purely for validation/effects).
#[derive(Clone)]
pub struct Combiner {
    inputs: Vec<ValueType>,
    output: Option<ValueType>,
    func: Arc<dyn Fn(&[Value]) -> Result<Option<Value>, String> + Send + Sync>,
}

impl Combiner {
    pub fn new(
        inputs: Vec<ValueType>,
        output: Option<ValueType>,
        func: impl Fn(&[Value]) -> Result<Option<Value>, String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            inputs,
            output,
            func: Arc::new(func),
        }
    }

    pub fn input_types(&self) -> &[ValueType] {
        &self.inputs
    }

    pub fn output_type(&self) -> Option<ValueType> {
        self.output
    }

    pub(crate) fn apply(&self, coords: &[Value]) -> Result<Option<Value>, AccessError> {
        for (i, (coord, expected)) in coords.iter().zip(&self.inputs).enumerate() {
            if coord.value_type() != *expected {
                return Err(AccessError::CoordinateMismatch {
                    message: format!(
                        "combiner input {} has type {:?}, expected {:?}",
                        i,
                        coord.value_type(),
                        expected
                    ),
                });
            }
        }
        let out = (self.func)(coords).map_err(|message| AccessError::FilterFailed { message })?;
        match (&out, self.output) {
            (Some(v), Some(expected)) if v.value_type() == expected => Ok(out),
            (None, None) => Ok(None),
            _ => Err(AccessError::FilterFailed {
                message: format!(
                    "combiner declared {:?} but produced {:?}",
                    self.output,
                    out.map(|v| v.value_type())
                ),
            }),
        }
    }
}

fn mismatch(message: String) -> AccessError {
    AccessError::CoordinateMismatch { message }
}

/// Wrap `target`'s value through a conversion pair: `to_carrier` maps the
/// new (outer) value type into the target's value type on the way in, and
/// `from_carrier` maps it back on the way out. The two directions must
/// agree with each other and with the target's value type.
pub fn filter_value(
    target: &VarHandle,
    to_carrier: ValueFilter,
    from_carrier: ValueFilter,
) -> Result<VarHandle, AccessError> {
    if to_carrier.output_type() != target.value_type() {
        return Err(mismatch(format!(
            "inbound conversion produces {:?}, target stores {:?}",
            to_carrier.output_type(),
            target.value_type()
        )));
    }
    if from_carrier.input_type() != target.value_type() {
        return Err(mismatch(format!(
            "outbound conversion consumes {:?}, target stores {:?}",
            from_carrier.input_type(),
            target.value_type()
        )));
    }
    if to_carrier.input_type() != from_carrier.output_type() {
        return Err(mismatch(format!(
            "conversion pair disagrees on the adapted type: {:?} vs {:?}",
            to_carrier.input_type(),
            from_carrier.output_type()
        )));
    }
    Ok(VarHandle {
        coord_types: target.coord_types.clone(),
        value_type: to_carrier.input_type(),
        form: Form::FilterValue {
            target: Box::new(target.clone()),
            unbox: to_carrier,
            rebox: from_carrier,
        },
    })
}

/// Replace the coordinates starting at `pos`: filter `k` maps the new
/// coordinate at `pos + k` into the target's coordinate there.
pub fn filter_coordinates(
    target: &VarHandle,
    pos: usize,
    filters: Vec<CoordFilter>,
) -> Result<VarHandle, AccessError> {
    let coords = target.coordinate_types();
    if pos + filters.len() > coords.len() {
        return Err(mismatch(format!(
            "filter position {} with {} filters exceeds {} coordinates",
            pos,
            filters.len(),
            coords.len()
        )));
    }
    let mut coord_types = coords.to_vec();
    for (k, filter) in filters.iter().enumerate() {
        if filter.output_type() != coords[pos + k] {
            return Err(mismatch(format!(
                "filter {} produces {:?}, coordinate {} has type {:?}",
                k,
                filter.output_type(),
                pos + k,
                coords[pos + k]
            )));
        }
        coord_types[pos + k] = filter.input_type();
    }
    Ok(VarHandle {
        coord_types,
        value_type: target.value_type,
        form: Form::FilterCoordinates {
            target: Box::new(target.clone()),
            pos,
            filters,
        },
    })
}

/// Bind fixed values into the coordinates starting at `pos`; the new
/// handle no longer exposes those positions.
pub fn insert_coordinates(
    target: &VarHandle,
    pos: usize,
    values: Vec<Value>,
) -> Result<VarHandle, AccessError> {
    let coords = target.coordinate_types();
    if pos > coords.len() {
        return Err(mismatch(format!(
            "insert position {} exceeds {} coordinates",
            pos,
            coords.len()
        )));
    }
    if values.len() > coords.len() - pos {
        return Err(mismatch(format!(
            "too many values: {} supplied, only {} coordinates from position {}",
            values.len(),
            coords.len() - pos,
            pos
        )));
    }
    for (i, value) in values.iter().enumerate() {
        if value.value_type() != coords[pos + i] {
            return Err(mismatch(format!(
                "bound value {} has type {:?}, coordinate {} has type {:?}",
                i,
                value.value_type(),
                pos + i,
                coords[pos + i]
            )));
        }
    }
    let mut coord_types = coords.to_vec();
    coord_types.drain(pos..pos + values.len());
    Ok(VarHandle {
        coord_types,
        value_type: target.value_type,
        form: Form::InsertCoordinates {
            target: Box::new(target.clone()),
            pos,
            values,
        },
    })
}

/// Reindex coordinates: the new handle exposes `new_coord_types`, and the
/// target's coordinate `i` is fed from new position `reorder[i]`.
pub fn permute_coordinates(
    target: &VarHandle,
    new_coord_types: Vec<ValueType>,
    reorder: Vec<usize>,
) -> Result<VarHandle, AccessError> {
    let coords = target.coordinate_types();
    if reorder.len() != coords.len() {
        return Err(mismatch(format!(
            "reorder list has {} entries for {} target coordinates",
            reorder.len(),
            coords.len()
        )));
    }
    for (i, &from) in reorder.iter().enumerate() {
        let Some(&new_ty) = new_coord_types.get(from) else {
            return Err(mismatch(format!(
                "reorder index {} is outside the {} new coordinates",
                from,
                new_coord_types.len()
            )));
        };
        if new_ty != coords[i] {
            return Err(mismatch(format!(
                "new coordinate {} has type {:?}, target coordinate {} expects {:?}",
                from, new_ty, i, coords[i]
            )));
        }
    }
    Ok(VarHandle {
        coord_types: new_coord_types,
        value_type: target.value_type,
        form: Form::PermuteCoordinates {
            target: Box::new(target.clone()),
            reorder,
        },
    })
}

/// Fold the combiner's inputs (new trailing coordinates at `pos`) into the
/// single coordinate the target expects at `pos`. A void combiner
/// contracts the coordinate away entirely: its inputs are validated and
/// dropped.
pub fn collect_coordinates(
    target: &VarHandle,
    pos: usize,
    combiner: Combiner,
) -> Result<VarHandle, AccessError> {
    let coords = target.coordinate_types();
    let mut coord_types = coords.to_vec();
    match combiner.output_type() {
        Some(output) => {
            let Some(&expected) = coords.get(pos) else {
                return Err(mismatch(format!(
                    "collect position {} exceeds {} coordinates",
                    pos,
                    coords.len()
                )));
            };
            if output != expected {
                return Err(mismatch(format!(
                    "combiner produces {:?}, coordinate {} has type {:?}",
                    output, pos, expected
                )));
            }
            coord_types.splice(pos..pos + 1, combiner.input_types().iter().copied());
        }
        None => {
            if pos > coords.len() {
                return Err(mismatch(format!(
                    "collect position {} exceeds {} coordinates",
                    pos,
                    coords.len()
                )));
            }
            coord_types.splice(pos..pos, combiner.input_types().iter().copied());
        }
    }
    Ok(VarHandle {
        coord_types,
        value_type: target.value_type,
        form: Form::CollectCoordinates {
            target: Box::new(target.clone()),
            pos,
            combiner,
        },
    })
}

/// Accept (and ignore) extra coordinates of the given types at `pos`.
pub fn drop_coordinates(
    target: &VarHandle,
    pos: usize,
    dropped: Vec<ValueType>,
) -> Result<VarHandle, AccessError> {
    let coords = target.coordinate_types();
    if pos > coords.len() {
        return Err(mismatch(format!(
            "drop position {} exceeds {} coordinates",
            pos,
            coords.len()
        )));
    }
    let mut coord_types = coords.to_vec();
    coord_types.splice(pos..pos, dropped.iter().copied());
    Ok(VarHandle {
        coord_types,
        value_type: target.value_type,
        form: Form::DropCoordinates {
            target: Box::new(target.clone()),
            pos,
            count: dropped.len(),
        },
    })
}
