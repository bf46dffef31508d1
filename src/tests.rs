//! Cross-module scenario tests
//!
//! End-to-end flows cutting across the layout, memory, access, and linker
//! layers: the pieces the unit tests exercise in isolation, wired the way
//! a caller would actually use them.

use std::sync::Arc;
use std::thread;

use crate::access::adapt::{self, ValueFilter};
use crate::access::{allocate_value, Value, ValueType};
use crate::layout::canonical::CanonicalTable;
use crate::layout::{Carrier, Layout, PathElement};
use crate::linker::{FunctionDescriptor, Linker, LinkerError, LinkerOption};
use crate::memory::{MemoryError, MemorySegment, Scope};

fn int32() -> Layout {
    Layout::value(Carrier::I32)
}

fn int64() -> Layout {
    Layout::value(Carrier::I64)
}

#[test]
fn test_struct_offsets_match_c_layout() {
    let point = Layout::struct_of(vec![int32().with_name("x"), int32().with_name("y")]).unwrap();
    assert_eq!(point.byte_size(), 8);
    assert_eq!(point.byte_alignment(), 4);
    assert_eq!(
        point.byte_offset(&[PathElement::group_name("y")]).unwrap(),
        4
    );
}

#[test]
fn test_confined_segment_rejected_from_spawned_thread() {
    let scope = Scope::confined();
    let segment = scope.allocate_bytes(10, 1).unwrap();
    let moved = segment.clone();
    let from_thread = thread::spawn(move || moved.get_u8(0)).join().unwrap();
    assert_eq!(
        from_thread.unwrap_err(),
        MemoryError::WrongThread { operation: "access" }
    );
    scope.close().unwrap();
}

#[test]
fn test_string_filtered_atomic_accessor() {
    let parse = ValueFilter::new(ValueType::Str, ValueType::I32, |v| match v {
        Value::Str(s) => s.parse::<i32>().map(Value::I32).map_err(|e| e.to_string()),
        _ => unreachable!(),
    });
    let format = ValueFilter::new(ValueType::I32, ValueType::Str, |v| match v {
        Value::I32(n) => Ok(Value::Str(n.to_string())),
        _ => unreachable!(),
    });
    let handle = adapt::filter_value(&int32().var_handle(&[]).unwrap(), parse, format).unwrap();

    let scope = Scope::confined();
    let segment = scope.allocate(&int32()).unwrap();
    let coords = [Value::Segment(segment.clone()), Value::I64(0)];

    handle.set(&coords, Value::Str("1".into())).unwrap();
    let previous = handle
        .get_and_add(&coords, Value::Str("42".into()))
        .unwrap();
    assert_eq!(previous, Value::Str("1".into()));
    assert_eq!(handle.get(&coords).unwrap(), Value::Str("43".into()));
    scope.close().unwrap();
}

#[test]
fn test_classification_rejects_unexpected_group_size() {
    // Trailing padding beyond what the alignment rule requires.
    let padded = Layout::struct_of(vec![int64(), int64(), Layout::padding(8).unwrap()]).unwrap();
    let err = Linker::host()
        .downcall_handle(1, &FunctionDescriptor::of_void(vec![padded]), &[])
        .unwrap_err();
    assert!(err.to_string().contains("has unexpected size"));
}

#[test]
fn test_variadic_float_single_rejected() {
    let desc = FunctionDescriptor::of_void(vec![int32(), Layout::value(Carrier::F32)]);
    let err = Linker::host()
        .downcall_handle(1, &desc, &[LinkerOption::first_variadic_arg(1)])
        .unwrap_err();
    match &err {
        LinkerError::InvalidOption { message } => {
            assert!(message.contains("Invalid variadic argument layout"));
        }
        other => panic!("expected InvalidOption, got {:?}", other),
    }
}

#[test]
fn test_path_offset_lands_inside_allocation() {
    let grid = Layout::struct_of(vec![
        int64().with_name("header"),
        Layout::sequence(3, int32()).unwrap().with_name("cells"),
        Layout::padding(4).unwrap(),
    ])
    .unwrap();

    let scope = Scope::confined();
    let segment = scope.allocate(&grid).unwrap();
    let handle = grid
        .byte_offset_handle(&[PathElement::group_name("cells"), PathElement::sequence()])
        .unwrap();
    for i in 0..3 {
        let offset = handle.offset(&[i]).unwrap();
        assert!(offset + 4 <= grid.byte_size());
        assert_eq!(
            segment.address() + offset,
            segment.as_slice(offset, 4).unwrap().address()
        );
    }
    scope.close().unwrap();
}

#[test]
fn test_zero_length_allocations_do_not_repeat_addresses() {
    let scope = Scope::confined();
    let mut seen = std::collections::HashSet::new();
    for _ in 0..16 {
        let segment = scope.allocate_bytes(0, 16).unwrap();
        assert_eq!(segment.address() % 16, 0);
        assert!(seen.insert(segment.address()), "address reused");
        assert_eq!(segment.as_slice(0, 0).unwrap().byte_size(), 0);
    }
    scope.close().unwrap();
}

#[test]
fn test_projection_equality_and_subslice_inequality() {
    let scope = Scope::confined();
    let segment = scope.allocate_bytes(32, 8).unwrap();
    let read_only = segment.as_read_only();
    let full = segment.as_slice(0, 32).unwrap();
    assert_eq!(segment, read_only);
    assert_eq!(segment, full);
    assert_ne!(segment, segment.as_slice(8, 16).unwrap());
    scope.close().unwrap();
}

#[test]
fn test_second_close_is_an_error_not_a_rerun() {
    let scope = Scope::confined();
    scope.close().unwrap();
    assert_eq!(scope.close().unwrap_err(), MemoryError::NotAlive);
}

#[test]
fn test_shared_scope_concurrent_readers_then_close() {
    let scope = Scope::shared();
    let segment = scope.allocate_bytes(64, 8).unwrap();
    segment.fill(0x5A).unwrap();

    let mut readers = Vec::new();
    for _ in 0..4 {
        let segment = segment.clone();
        readers.push(thread::spawn(move || {
            for i in 0..64 {
                if segment.get_u8(i) != Ok(0x5A) {
                    return false;
                }
            }
            true
        }));
    }
    for reader in readers {
        assert!(reader.join().unwrap());
    }
    scope.close().unwrap();
    assert_eq!(segment.get_u8(0).unwrap_err(), MemoryError::NotAlive);
}

#[test]
fn test_concurrent_fills_interleave_safely() {
    let scope = Scope::shared();
    let segment = scope.allocate_bytes(4096, 8).unwrap();

    let writers: Vec<_> = [0x11u8, 0xEE]
        .into_iter()
        .map(|byte| {
            let segment = segment.clone();
            thread::spawn(move || {
                for _ in 0..50 {
                    segment.fill(byte).unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }
    // Interleavings are unspecified, but every byte is one of the two
    // written patterns: no corruption, no crash.
    for byte in segment.to_vec().unwrap() {
        assert!(byte == 0x11 || byte == 0xEE, "unexpected byte {:#x}", byte);
    }
    scope.close().unwrap();
}

#[test]
fn test_suffix_slice_sees_parent_liveness() {
    let scope = Scope::confined();
    let segment = scope.allocate_bytes(16, 8).unwrap();
    let tail = segment.as_slice_from(12).unwrap();
    assert_eq!(tail.byte_size(), 4);
    assert_eq!(tail.address(), segment.address() + 12);
    scope.close().unwrap();
    assert_eq!(tail.get_u8(0).unwrap_err(), MemoryError::NotAlive);
}

#[test]
fn test_auto_scope_is_freely_shared_across_threads() {
    let scope = Scope::auto_managed();
    let segment = scope.allocate_bytes(8, 8).unwrap();
    segment.set_i64(0, 77).unwrap();
    let moved = segment.clone();
    let read = thread::spawn(move || moved.get_i64(0)).join().unwrap();
    assert_eq!(read.unwrap(), 77);
}

#[test]
fn test_randomized_fill_and_copy_round_trip() {
    let scope = Scope::confined();
    let source = scope.allocate_bytes(256, 1).unwrap();
    for i in 0..256 {
        source.set_u8(i, fastrand::u8(..)).unwrap();
    }
    let destination = scope.allocate_bytes(256, 1).unwrap();
    destination.copy_from(&source).unwrap();
    assert_eq!(source.to_vec().unwrap(), destination.to_vec().unwrap());
    assert_ne!(source, destination);
    scope.close().unwrap();
}

#[test]
fn test_canonical_layouts_drive_a_real_downcall() {
    // int abs(int) from the C runtime, described via the canonical table
    // and called through the linker.
    let int = CanonicalTable::host().get("int").unwrap().clone();
    let descriptor = FunctionDescriptor::of(int.clone(), vec![int]);
    let handle = Linker::host()
        .downcall_handle(libc::abs as usize as u64, &descriptor, &[])
        .unwrap();
    let out = handle.call(&[Value::I32(-42)]).unwrap();
    assert_eq!(out, Some(Value::I32(42)));
}

#[test]
fn test_allocate_value_through_reinterpret_view() {
    let scope = Scope::confined();
    let segment = allocate_value(&scope, &int64(), Value::I64(0x0102_0304_0506_0708)).unwrap();
    let view = segment.reinterpret(4).unwrap();
    assert_eq!(view.byte_size(), 4);
    assert_eq!(view.get_i32(0).unwrap(), segment.get_i32(0).unwrap());
    scope.close().unwrap();
}

#[test]
fn test_upcall_stub_dies_with_its_scope() {
    let scope = Scope::shared();
    let descriptor = FunctionDescriptor::of(int32(), vec![]);
    let func: crate::linker::UpcallFn = Arc::new(|_| Ok(Some(Value::I32(7))));
    let stub = Linker::host()
        .upcall_stub(func, &descriptor, &scope, &[])
        .unwrap();

    let native: extern "C" fn() -> i32 = unsafe { std::mem::transmute(stub.address() as usize) };
    assert_eq!(native(), 7);

    scope.close().unwrap();
    assert!(!stub.scope().is_alive());
}

#[test]
fn test_downcall_reads_from_heap_segment_under_critical() {
    extern "C" fn first_byte(p: *const u8) -> i32 {
        unsafe { *p as i32 }
    }
    let descriptor = FunctionDescriptor::of(int32(), vec![Layout::value(Carrier::Address)]);
    let handle = Linker::host()
        .downcall_handle(
            first_byte as usize as u64,
            &descriptor,
            &[LinkerOption::critical(true)],
        )
        .unwrap();
    let heap = MemorySegment::of_bytes(vec![99, 1, 2]);
    assert_eq!(
        handle.call(&[Value::Segment(heap)]).unwrap(),
        Some(Value::I32(99))
    );
}
