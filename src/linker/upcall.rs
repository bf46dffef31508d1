//! Upcall stubs
//!
//! An upcall stub is a JIT-compiled function carrying the foreign
//! signature the descriptor classifies to. The stub packs its incoming
//! machine arguments into the shared frame shape, dispatches into the
//! managed closure through an `extern "C"` shim, and unpacks the return.
//! The stub's executable memory and the boxed closure context are owned
//! by the scope the caller supplies; both are torn down by that scope's
//! cleanup, so the stub address must not outlive the scope.

use std::panic::{self, AssertUnwindSafe};

use cranelift::prelude::*;
use cranelift_module::{Linkage, Module};

use super::classify::{
    frame_size, ArgClass, CallPlan, RetClass, FRAME_ARGS, FRAME_RET,
};
use super::downcall::{native_signature, new_jit_module, slot_type, ModuleHolder};
use super::{LinkerError, UpcallFn};
use crate::access::Value;
use crate::layout::{Carrier, Layout};
use crate::memory::{MemorySegment, Scope};

/// The managed side of an upcall: the closure plus its classified plan.
pub(crate) struct UpcallTarget {
    func: UpcallFn,
    plan: CallPlan,
}

impl UpcallTarget {
    pub(crate) fn new(func: UpcallFn, plan: CallPlan) -> Self {
        Self { func, plan }
    }
}

extern "C" fn fm_upcall_dispatch(ctx: *const UpcallTarget, frame: *mut u8) {
    let target = unsafe { &*ctx };
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| dispatch(target, frame)));
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(message)) => {
            tracing::error!(error = %message, "upcall target failed; returning zeroes");
            zero_return(frame);
        }
        Err(_) => {
            tracing::error!("upcall target panicked; returning zeroes");
            zero_return(frame);
        }
    }
}

fn zero_return(frame: *mut u8) {
    unsafe { std::ptr::write_bytes(frame.add(FRAME_RET as usize), 0, 32) };
}

fn dispatch(target: &UpcallTarget, frame: *mut u8) -> Result<(), String> {
    let plan = &target.plan;
    let mut args = Vec::with_capacity(plan.args.len());
    for (i, (layout, class)) in plan.args.iter().enumerate() {
        let slot = unsafe { frame.add(FRAME_ARGS as usize + 8 * i) };
        let value = match class {
            ArgClass::Scalar(_, _) => {
                let carrier = layout.as_value().unwrap().carrier();
                let bytes = unsafe { std::slice::from_raw_parts(slot, 8) };
                decode_scalar(carrier, bytes)
            }
            ArgClass::SmallGroup(_)
            | ArgClass::IndirectGroup
            | ArgClass::MemoryGroup { .. } => {
                let ptr = unsafe { slot.cast::<u64>().read_unaligned() } as usize as *const u8;
                let size = layout.byte_size() as usize;
                let bytes = unsafe { std::slice::from_raw_parts(ptr, size) }.to_vec();
                Value::Segment(MemorySegment::of_bytes(bytes))
            }
        };
        args.push(value);
    }

    let result = (target.func)(&args)?;

    match (&plan.ret, &plan.ret_layout) {
        (RetClass::Void, _) => Ok(()),
        (RetClass::Scalar(_), Some(layout)) => {
            let carrier = layout.as_value().unwrap().carrier();
            let value = result.ok_or("upcall target returned nothing for a value layout")?;
            let encoded = encode_scalar(carrier, &value)?;
            unsafe {
                std::ptr::copy_nonoverlapping(
                    encoded.as_ptr(),
                    frame.add(FRAME_RET as usize),
                    8,
                )
            };
            Ok(())
        }
        (RetClass::SmallGroup(slots), Some(layout)) => {
            let bytes = expect_group_result(result, layout)?;
            let mut src = 0usize;
            for (j, slot) in slots.iter().enumerate() {
                let width = (slot.byte_width() as usize).min(bytes.len() - src);
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        bytes[src..].as_ptr(),
                        frame.add(FRAME_RET as usize + 8 * j),
                        width,
                    )
                };
                src += width;
            }
            Ok(())
        }
        (RetClass::IndirectSret, Some(layout)) => {
            let bytes = expect_group_result(result, layout)?;
            let out =
                unsafe { frame.add(FRAME_RET as usize).cast::<u64>().read_unaligned() } as usize
                    as *mut u8;
            unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), out, bytes.len()) };
            Ok(())
        }
        _ => Err("return plan disagrees with descriptor".into()),
    }
}

fn expect_group_result(result: Option<Value>, layout: &Layout) -> Result<Vec<u8>, String> {
    match result {
        Some(Value::Segment(segment)) => {
            if segment.byte_size() != layout.byte_size() {
                return Err(format!(
                    "upcall target returned {} bytes for layout {}",
                    segment.byte_size(),
                    layout
                ));
            }
            segment.to_vec().map_err(|e| e.to_string())
        }
        other => Err(format!(
            "upcall target must return a segment shaped like {}, got {:?}",
            layout, other
        )),
    }
}

fn decode_scalar(carrier: Carrier, bytes: &[u8]) -> Value {
    macro_rules! de {
        ($ty:ty, $variant:ident, $n:expr) => {{
            let mut buf = [0u8; $n];
            buf.copy_from_slice(&bytes[..$n]);
            Value::$variant(<$ty>::from_ne_bytes(buf))
        }};
    }
    match carrier {
        Carrier::Bool => Value::Bool(bytes[0] != 0),
        Carrier::I8 => Value::I8(bytes[0] as i8),
        Carrier::I16 => de!(i16, I16, 2),
        Carrier::U16 => de!(u16, U16, 2),
        Carrier::I32 => de!(i32, I32, 4),
        Carrier::I64 => de!(i64, I64, 8),
        Carrier::F32 => de!(f32, F32, 4),
        Carrier::F64 => de!(f64, F64, 8),
        Carrier::Address => de!(u64, Address, 8),
    }
}

fn encode_scalar(carrier: Carrier, value: &Value) -> Result<[u8; 8], String> {
    let mut slot = [0u8; 8];
    match (carrier, value) {
        (Carrier::Bool, Value::Bool(b)) => slot[0] = *b as u8,
        (Carrier::I8, Value::I8(v)) => slot[0] = *v as u8,
        (Carrier::I16, Value::I16(v)) => slot[..2].copy_from_slice(&v.to_ne_bytes()),
        (Carrier::U16, Value::U16(v)) => slot[..2].copy_from_slice(&v.to_ne_bytes()),
        (Carrier::I32, Value::I32(v)) => slot[..4].copy_from_slice(&v.to_ne_bytes()),
        (Carrier::I64, Value::I64(v)) => slot.copy_from_slice(&v.to_ne_bytes()),
        (Carrier::F32, Value::F32(v)) => slot[..4].copy_from_slice(&v.to_ne_bytes()),
        (Carrier::F64, Value::F64(v)) => slot.copy_from_slice(&v.to_ne_bytes()),
        (Carrier::Address, Value::Address(v)) => slot.copy_from_slice(&v.to_ne_bytes()),
        (carrier, value) => {
            return Err(format!(
                "upcall target returned {:?}, layout carrier is {:?}",
                value.value_type(),
                carrier
            ));
        }
    }
    Ok(slot)
}

/// Compile the native-callable stub for `target` and bind its lifetime to
/// `scope`. Returns a zero-length segment holding the stub address.
pub(crate) fn compile_stub(
    target: UpcallTarget,
    scope: &Scope,
) -> Result<MemorySegment, LinkerError> {
    let codegen_err = |message: String| LinkerError::Codegen { message };

    let mut module = new_jit_module(&[(
        "fm_upcall_dispatch",
        fm_upcall_dispatch as *const u8,
    )])?;
    let mut ctx = module.make_context();
    let mut builder_ctx = FunctionBuilderContext::new();

    let plan = target.plan.clone();
    let stub_sig = native_signature(&module, &plan);

    let mut dispatch_sig = module.make_signature();
    dispatch_sig.params.push(AbiParam::new(types::I64));
    dispatch_sig.params.push(AbiParam::new(types::I64));
    let dispatch_id = module
        .declare_function("fm_upcall_dispatch", Linkage::Import, &dispatch_sig)
        .map_err(|e| codegen_err(format!("failed to declare dispatcher: {}", e)))?;

    let func_id = module
        .declare_function("upcall_stub", Linkage::Export, &stub_sig)
        .map_err(|e| codegen_err(format!("failed to declare stub: {}", e)))?;

    // Scratch space after the frame for reassembling decomposed group
    // arguments in memory form.
    let base_size = frame_size(plan.args.len());
    let mut scratch_offsets = Vec::with_capacity(plan.args.len());
    let mut scratch_total = base_size;
    for (layout, class) in &plan.args {
        if matches!(class, ArgClass::SmallGroup(_)) {
            scratch_offsets.push(Some(scratch_total));
            scratch_total += (layout.byte_size() as usize).div_ceil(8) * 8;
        } else {
            scratch_offsets.push(None);
        }
    }

    let target = Box::into_raw(Box::new(target));
    let target_addr = target as usize;

    ctx.func.signature = stub_sig;
    {
        let mut fb = FunctionBuilder::new(&mut ctx.func, &mut builder_ctx);
        let block = fb.create_block();
        fb.append_block_params_for_function_params(block);
        fb.switch_to_block(block);

        let slot = fb.create_sized_stack_slot(StackSlotData::new(
            StackSlotKind::ExplicitSlot,
            scratch_total as u32,
            3,
        ));
        let frame = fb.ins().stack_addr(types::I64, slot, 0);

        let params = fb.block_params(block).to_vec();
        let mut next_param = 0usize;
        if plan.ret == RetClass::IndirectSret {
            let sret = params[next_param];
            next_param += 1;
            fb.ins().store(MemFlags::new(), sret, frame, FRAME_RET);
        }
        for (i, (_, class)) in plan.args.iter().enumerate() {
            let slot_off = FRAME_ARGS + 8 * i as i32;
            match class {
                ArgClass::Scalar(_, _) => {
                    fb.ins()
                        .store(MemFlags::new(), params[next_param], frame, slot_off);
                    next_param += 1;
                }
                ArgClass::SmallGroup(slots) => {
                    let scratch = scratch_offsets[i].unwrap() as i32;
                    let mut mem_off = 0i32;
                    for _ in slots {
                        let value = params[next_param];
                        next_param += 1;
                        let width = fb.func.dfg.value_type(value).bytes() as i32;
                        fb.ins()
                            .store(MemFlags::new(), value, frame, scratch + mem_off);
                        mem_off += width;
                    }
                    let content = fb.ins().stack_addr(types::I64, slot, scratch);
                    fb.ins().store(MemFlags::new(), content, frame, slot_off);
                }
                ArgClass::IndirectGroup | ArgClass::MemoryGroup { .. } => {
                    fb.ins()
                        .store(MemFlags::new(), params[next_param], frame, slot_off);
                    next_param += 1;
                }
            }
        }

        let dispatch_ref = module.declare_func_in_func(dispatch_id, fb.func);
        let ctx_val = fb.ins().iconst(types::I64, target_addr as i64);
        fb.ins().call(dispatch_ref, &[ctx_val, frame]);

        match &plan.ret {
            RetClass::Void => {
                fb.ins().return_(&[]);
            }
            RetClass::Scalar(kind) => {
                let value = fb
                    .ins()
                    .load(slot_type(*kind), MemFlags::new(), frame, FRAME_RET);
                fb.ins().return_(&[value]);
            }
            RetClass::SmallGroup(slots) => {
                let mut values = Vec::with_capacity(slots.len());
                for (j, kind) in slots.iter().enumerate() {
                    values.push(fb.ins().load(
                        slot_type(*kind),
                        MemFlags::new(),
                        frame,
                        FRAME_RET + 8 * j as i32,
                    ));
                }
                fb.ins().return_(&values);
            }
            RetClass::IndirectSret => {
                let sret = fb.ins().load(types::I64, MemFlags::new(), frame, FRAME_RET);
                fb.ins().return_(&[sret]);
            }
        }

        fb.seal_all_blocks();
        fb.finalize();
    }

    let compiled: Result<*const u8, LinkerError> = (|| {
        module
            .define_function(func_id, &mut ctx)
            .map_err(|e| codegen_err(format!("failed to compile stub: {}", e)))?;
        module.clear_context(&mut ctx);
        module
            .finalize_definitions()
            .map_err(|e| codegen_err(format!("failed to finalize stub: {}", e)))?;
        Ok(module.get_finalized_function(func_id))
    })();
    let entry = match compiled {
        Ok(entry) => entry,
        Err(err) => {
            unsafe { drop(Box::from_raw(target_addr as *mut UpcallTarget)) };
            return Err(err);
        }
    };
    tracing::debug!(addr = entry as usize, "compiled upcall stub");

    let holder = ModuleHolder::new(module);
    let registered = scope.register_cleanup(move || {
        drop(holder);
        unsafe { drop(Box::from_raw(target_addr as *mut UpcallTarget)) };
    });
    if let Err(err) = registered {
        unsafe { drop(Box::from_raw(target_addr as *mut UpcallTarget)) };
        return Err(err.into());
    }
    Ok(MemorySegment::from_native(entry as u64, 0, scope.clone()))
}
