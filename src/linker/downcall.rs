//! Downcall trampolines
//!
//! Every downcall plan compiles to one native trampoline with the uniform
//! entry `extern "C" fn(frame: *mut u8)`. The frame packs the target
//! address, the capture-buffer address, return storage, and one 8-byte
//! slot per argument (scalars inline, groups as pointers to copies); the
//! trampoline unpacks it, performs the classified indirect call, captures
//! the OS error slot if requested, and stores the results back.
//!
//! Compiled trampolines are memoized: the cache key is the canonical
//! (name-free) descriptor form plus the full option set, hashed.

use std::sync::Arc;

use cranelift::prelude::*;
use cranelift_codegen::ir::ArgumentPurpose;
use cranelift_codegen::settings;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId, Linkage, Module};
use sha2::{Digest, Sha256};

use super::classify::{
    frame_size, ArgClass, CallPlan, Ext, RetClass, SlotKind, FRAME_ARGS, FRAME_CAPTURE,
    FRAME_RET, FRAME_TARGET,
};
use super::{FunctionDescriptor, LinkerError, LinkerOption};
use crate::access::Value;
use crate::layout::{Carrier, Layout};
use crate::memory::{MemoryError, MemorySegment, SegmentAllocator};

/// Owns the JIT module backing a compiled trampoline; executable memory
/// is released when the last handle drops.
pub(crate) struct ModuleHolder(Option<JITModule>);

// The module is only mutated during compilation; afterwards it is an
// immutable code region shared across threads.
unsafe impl Send for ModuleHolder {}
unsafe impl Sync for ModuleHolder {}

impl ModuleHolder {
    pub(crate) fn new(module: JITModule) -> Self {
        ModuleHolder(Some(module))
    }
}

impl Drop for ModuleHolder {
    fn drop(&mut self) {
        if let Some(module) = self.0.take() {
            unsafe { module.free_memory() };
        }
    }
}

pub(crate) struct CompiledTrampoline {
    entry: *const u8,
    _module: ModuleHolder,
}

unsafe impl Send for CompiledTrampoline {}
unsafe impl Sync for CompiledTrampoline {}

/// Memoization key: canonical descriptor plus the exact option set.
pub(crate) fn plan_cache_key(descriptor: &FunctionDescriptor, options: &[LinkerOption]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(descriptor.canonical_form().as_bytes());
    hasher.update(b"|");
    hasher.update(format!("{:?}", options).as_bytes());
    hex::encode(hasher.finalize())
}

pub(crate) fn slot_type(kind: SlotKind) -> Type {
    match kind {
        SlotKind::I8 => types::I8,
        SlotKind::I16 => types::I16,
        SlotKind::I32 => types::I32,
        SlotKind::I64 => types::I64,
        SlotKind::F32 => types::F32,
        SlotKind::F64 => types::F64,
    }
}

fn codegen_err(message: impl Into<String>) -> LinkerError {
    LinkerError::Codegen {
        message: message.into(),
    }
}

extern "C" fn fm_errno_location() -> *mut i32 {
    #[cfg(target_os = "macos")]
    unsafe {
        libc::__error()
    }
    #[cfg(not(target_os = "macos"))]
    unsafe {
        libc::__errno_location()
    }
}

pub(crate) fn new_jit_module(symbols: &[(&str, *const u8)]) -> Result<JITModule, LinkerError> {
    let mut flag_builder = settings::builder();
    // PLT is not supported in cranelift-jit on aarch64.
    flag_builder.set("use_colocated_libcalls", "true").unwrap();
    flag_builder.set("is_pic", "false").unwrap();

    let isa_builder = cranelift_native::builder()
        .map_err(|e| codegen_err(format!("failed to create ISA builder: {}", e)))?;
    let isa = isa_builder
        .finish(settings::Flags::new(flag_builder))
        .map_err(|e| codegen_err(format!("failed to create ISA: {}", e)))?;

    let mut builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
    for (name, address) in symbols {
        builder.symbol(*name, *address);
    }
    Ok(JITModule::new(builder))
}

/// The native signature a classified call uses, shared by downcall
/// trampolines (as the callee signature) and upcall stubs (as their own).
pub(crate) fn native_signature(module: &JITModule, plan: &CallPlan) -> Signature {
    let mut sig = module.make_signature();
    match &plan.ret {
        RetClass::Void => {}
        RetClass::Scalar(kind) => sig.returns.push(AbiParam::new(slot_type(*kind))),
        RetClass::SmallGroup(slots) => {
            for slot in slots {
                sig.returns.push(AbiParam::new(slot_type(*slot)));
            }
        }
        RetClass::IndirectSret => {
            sig.params
                .push(AbiParam::special(types::I64, ArgumentPurpose::StructReturn));
            sig.returns
                .push(AbiParam::special(types::I64, ArgumentPurpose::StructReturn));
        }
    }
    for (_, class) in &plan.args {
        match class {
            ArgClass::Scalar(kind, ext) => {
                let param = AbiParam::new(slot_type(*kind));
                let param = match ext {
                    Ext::None => param,
                    Ext::Sext => param.sext(),
                    Ext::Uext => param.uext(),
                };
                sig.params.push(param);
            }
            ArgClass::SmallGroup(slots) => {
                for slot in slots {
                    sig.params.push(AbiParam::new(slot_type(*slot)));
                }
            }
            ArgClass::IndirectGroup => sig.params.push(AbiParam::new(types::I64)),
            ArgClass::MemoryGroup { size } => sig.params.push(AbiParam::special(
                types::I64,
                ArgumentPurpose::StructArgument(*size as u32),
            )),
        }
    }
    sig
}

pub(crate) fn compile_trampoline(plan: &CallPlan) -> Result<CompiledTrampoline, LinkerError> {
    let mut module = new_jit_module(&[("fm_errno_location", fm_errno_location as *const u8)])?;
    let mut ctx = module.make_context();
    let mut builder_ctx = FunctionBuilderContext::new();

    let mut tramp_sig = module.make_signature();
    tramp_sig.params.push(AbiParam::new(types::I64));
    let func_id = module
        .declare_function("downcall_trampoline", Linkage::Export, &tramp_sig)
        .map_err(|e| codegen_err(format!("failed to declare trampoline: {}", e)))?;

    let errno_id: Option<FuncId> = if plan.capture.is_some() {
        let mut sig = module.make_signature();
        sig.returns.push(AbiParam::new(types::I64));
        Some(
            module
                .declare_function("fm_errno_location", Linkage::Import, &sig)
                .map_err(|e| codegen_err(format!("failed to declare errno import: {}", e)))?,
        )
    } else {
        None
    };

    let callee_sig = native_signature(&module, plan);

    ctx.func.signature = tramp_sig;
    {
        let mut fb = FunctionBuilder::new(&mut ctx.func, &mut builder_ctx);
        let block = fb.create_block();
        fb.append_block_params_for_function_params(block);
        fb.switch_to_block(block);
        let frame = fb.block_params(block)[0];

        let sig_ref = fb.import_signature(callee_sig);
        let target = fb
            .ins()
            .load(types::I64, MemFlags::new(), frame, FRAME_TARGET);

        let mut call_args: Vec<cranelift_codegen::ir::Value> = Vec::new();
        if plan.ret == RetClass::IndirectSret {
            let ret_ptr = fb.ins().load(types::I64, MemFlags::new(), frame, FRAME_RET);
            call_args.push(ret_ptr);
        }
        for (i, (_, class)) in plan.args.iter().enumerate() {
            let slot_off = FRAME_ARGS + 8 * i as i32;
            match class {
                ArgClass::Scalar(kind, _) => {
                    call_args.push(fb.ins().load(
                        slot_type(*kind),
                        MemFlags::new(),
                        frame,
                        slot_off,
                    ));
                }
                ArgClass::SmallGroup(slots) => {
                    let ptr = fb.ins().load(types::I64, MemFlags::new(), frame, slot_off);
                    let mut mem_off = 0i32;
                    for slot in slots {
                        call_args.push(fb.ins().load(
                            slot_type(*slot),
                            MemFlags::new(),
                            ptr,
                            mem_off,
                        ));
                        mem_off += slot.byte_width() as i32;
                    }
                }
                ArgClass::IndirectGroup | ArgClass::MemoryGroup { .. } => {
                    call_args.push(fb.ins().load(types::I64, MemFlags::new(), frame, slot_off));
                }
            }
        }

        let call = fb.ins().call_indirect(sig_ref, target, &call_args);
        let results = fb.inst_results(call).to_vec();
        match &plan.ret {
            RetClass::Void | RetClass::IndirectSret => {}
            RetClass::Scalar(_) => {
                fb.ins().store(MemFlags::new(), results[0], frame, FRAME_RET);
            }
            RetClass::SmallGroup(slots) => {
                for (j, _) in slots.iter().enumerate() {
                    fb.ins().store(
                        MemFlags::new(),
                        results[j],
                        frame,
                        FRAME_RET + 8 * j as i32,
                    );
                }
            }
        }

        // Read errno immediately after the call, before anything else can
        // clobber it.
        if let Some(errno_id) = errno_id {
            let errno_ref = module.declare_func_in_func(errno_id, fb.func);
            let loc_call = fb.ins().call(errno_ref, &[]);
            let loc = fb.inst_results(loc_call)[0];
            let errno_val = fb.ins().load(types::I32, MemFlags::new(), loc, 0);
            let capture_ptr = fb
                .ins()
                .load(types::I64, MemFlags::new(), frame, FRAME_CAPTURE);
            fb.ins().store(MemFlags::new(), errno_val, capture_ptr, 0);
        }

        fb.ins().return_(&[]);
        fb.seal_all_blocks();
        fb.finalize();
    }

    module
        .define_function(func_id, &mut ctx)
        .map_err(|e| codegen_err(format!("failed to compile trampoline: {}", e)))?;
    module.clear_context(&mut ctx);
    module
        .finalize_definitions()
        .map_err(|e| codegen_err(format!("failed to finalize trampoline: {}", e)))?;
    let entry = module.get_finalized_function(func_id);
    tracing::debug!(args = plan.args.len(), "compiled downcall trampoline");

    Ok(CompiledTrampoline {
        entry,
        _module: ModuleHolder(Some(module)),
    })
}

// =========================================================================
// Call-time marshalling
// =========================================================================

/// A callable downcall: target address plus a compiled, cached call plan.
#[derive(Clone)]
pub struct DowncallHandle {
    target: u64,
    plan: Arc<CallPlan>,
    code: Arc<CompiledTrampoline>,
}

impl std::fmt::Debug for DowncallHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DowncallHandle")
            .field("target", &self.target)
            .field("plan", &self.plan)
            .finish_non_exhaustive()
    }
}

impl DowncallHandle {
    pub(crate) fn new(target: u64, plan: CallPlan, code: Arc<CompiledTrampoline>) -> Self {
        Self {
            target,
            plan: Arc::new(plan),
            code,
        }
    }

    /// Invoke the native function. When the descriptor captures call
    /// state, the first element of `args` must be the capture segment.
    /// Fails at call time when the return layout is a group: group
    /// returns need scratch memory, supplied through `call_in`.
    pub fn call(&self, args: &[Value]) -> Result<Option<Value>, LinkerError> {
        if matches!(
            self.plan.ret,
            RetClass::SmallGroup(_) | RetClass::IndirectSret
        ) {
            return Err(LinkerError::IllegalArgument {
                message: "group return layout requires an allocator; use call_in".into(),
            });
        }
        self.invoke(None, args)
    }

    /// Invoke with an allocator supplying the return storage for a
    /// group-returning call.
    pub fn call_in(
        &self,
        allocator: &dyn SegmentAllocator,
        args: &[Value],
    ) -> Result<Option<Value>, LinkerError> {
        self.invoke(Some(allocator), args)
    }

    fn invoke(
        &self,
        allocator: Option<&dyn SegmentAllocator>,
        args: &[Value],
    ) -> Result<Option<Value>, LinkerError> {
        let plan = &*self.plan;

        let (capture_segment, args) = match &plan.capture {
            Some(names) => {
                let Some((first, rest)) = args.split_first() else {
                    return Err(LinkerError::IllegalArgument {
                        message: "capture-state call is missing its leading capture segment"
                            .into(),
                    });
                };
                let Value::Segment(segment) = first else {
                    return Err(LinkerError::IllegalArgument {
                        message: "capture-state call must lead with a segment".into(),
                    });
                };
                check_capture_segment(segment, names.len() as u64)?;
                (Some(segment.clone()), rest)
            }
            None => (None, args),
        };

        if args.len() != plan.args.len() {
            return Err(LinkerError::IllegalArgument {
                message: format!(
                    "expected {} arguments, got {}",
                    plan.args.len(),
                    args.len()
                ),
            });
        }

        let mut frame = vec![0u8; frame_size(plan.args.len())];
        frame[0..8].copy_from_slice(&self.target.to_ne_bytes());
        if let Some(segment) = &capture_segment {
            frame[8..16].copy_from_slice(&segment.physical_address().to_ne_bytes());
        }

        // Keeps group copies alive across the native call.
        let mut copies: Vec<Box<[u8]>> = Vec::new();
        for (i, ((layout, class), value)) in plan.args.iter().zip(args).enumerate() {
            let slot = FRAME_ARGS as usize + 8 * i;
            match class {
                ArgClass::Scalar(_, _) => {
                    let carrier = layout.as_value().unwrap().carrier();
                    let encoded = self.encode_scalar(carrier, value, i)?;
                    frame[slot..slot + 8].copy_from_slice(&encoded);
                }
                ArgClass::SmallGroup(_)
                | ArgClass::IndirectGroup
                | ArgClass::MemoryGroup { .. } => {
                    let Value::Segment(segment) = value else {
                        return Err(LinkerError::IllegalArgument {
                            message: format!(
                                "argument {} must be a segment shaped like {}",
                                i, layout
                            ),
                        });
                    };
                    if segment.byte_size() != layout.byte_size() {
                        return Err(LinkerError::IllegalArgument {
                            message: format!(
                                "argument {} segment has {} bytes, layout {} needs {}",
                                i,
                                segment.byte_size(),
                                layout,
                                layout.byte_size()
                            ),
                        });
                    }
                    let bytes = segment.to_vec()?;
                    let rounded = (bytes.len().max(1)).div_ceil(8) * 8;
                    let mut copy = vec![0u8; rounded];
                    copy[..bytes.len()].copy_from_slice(&bytes);
                    let boxed = copy.into_boxed_slice();
                    let address = boxed.as_ptr() as u64;
                    copies.push(boxed);
                    frame[slot..slot + 8].copy_from_slice(&address.to_ne_bytes());
                }
            }
        }

        // Group returns get their storage up front so the struct-return
        // pointer can ride in the frame.
        let ret_segment = match (&plan.ret, &plan.ret_layout) {
            (RetClass::SmallGroup(_) | RetClass::IndirectSret, Some(layout)) => {
                let allocator = allocator.ok_or_else(|| LinkerError::IllegalArgument {
                    message: format!(
                        "return layout {} requires a caller-supplied allocator",
                        layout
                    ),
                })?;
                let segment =
                    allocator.allocate_bytes(layout.byte_size(), layout.byte_alignment())?;
                if plan.ret == RetClass::IndirectSret {
                    frame[16..24].copy_from_slice(&segment.physical_address().to_ne_bytes());
                }
                Some(segment)
            }
            _ => None,
        };

        let entry: extern "C" fn(*mut u8) = unsafe { std::mem::transmute(self.code.entry) };
        entry(frame.as_mut_ptr());
        drop(copies);

        match &plan.ret {
            RetClass::Void => Ok(None),
            RetClass::Scalar(_) => {
                let carrier = plan
                    .ret_layout
                    .as_ref()
                    .and_then(|l| l.as_value())
                    .unwrap()
                    .carrier();
                Ok(Some(decode_scalar(carrier, &frame[16..24])))
            }
            RetClass::SmallGroup(slots) => {
                let segment = ret_segment.unwrap();
                let size = segment.byte_size() as usize;
                let mut bytes = vec![0u8; size];
                let mut dst = 0usize;
                for (j, slot) in slots.iter().enumerate() {
                    let width = slot.byte_width() as usize;
                    let src = 16 + 8 * j;
                    let take = width.min(size - dst);
                    bytes[dst..dst + take].copy_from_slice(&frame[src..src + take]);
                    dst += take;
                }
                segment.with_window(0, size as u64, true, |p| unsafe {
                    std::ptr::copy_nonoverlapping(bytes.as_ptr(), p, size)
                })?;
                Ok(Some(Value::Segment(segment)))
            }
            RetClass::IndirectSret => Ok(Some(Value::Segment(ret_segment.unwrap()))),
        }
    }

    fn encode_scalar(
        &self,
        carrier: Carrier,
        value: &Value,
        index: usize,
    ) -> Result<[u8; 8], LinkerError> {
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
            (Carrier::Address, Value::Segment(segment)) => {
                if !segment.scope().is_alive() {
                    return Err(LinkerError::Memory(MemoryError::NotAlive));
                }
                let address = if segment.is_native() {
                    segment.address()
                } else if self.plan.critical == Some(true) {
                    segment.physical_address()
                } else {
                    return Err(LinkerError::IllegalArgument {
                        message: "Heap segment not allowed as an address argument".into(),
                    });
                };
                slot.copy_from_slice(&address.to_ne_bytes());
            }
            (carrier, value) => {
                return Err(LinkerError::IllegalArgument {
                    message: format!(
                        "argument {} has type {:?}, layout carrier is {:?}",
                        index,
                        value.value_type(),
                        carrier
                    ),
                });
            }
        }
        Ok(slot)
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
        Carrier::Address => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[..8]);
            Value::Address(u64::from_ne_bytes(buf))
        }
    }
}

fn check_capture_segment(segment: &MemorySegment, slots: u64) -> Result<(), LinkerError> {
    let expected = slots * 4;
    if !segment.is_native() {
        return Err(LinkerError::IllegalArgument {
            message: "capture segment must be native".into(),
        });
    }
    if segment.is_read_only() {
        return Err(LinkerError::Memory(MemoryError::ReadOnly));
    }
    if segment.byte_size() != expected {
        return Err(LinkerError::IllegalArgument {
            message: format!(
                "capture segment has {} bytes, capture layout needs exactly {}",
                segment.byte_size(),
                expected
            ),
        });
    }
    if segment.physical_address() % 4 != 0 {
        return Err(LinkerError::IllegalArgument {
            message: format!(
                "capture segment address {:#x} violates the capture layout alignment 4",
                segment.physical_address()
            ),
        });
    }
    Ok(())
}
