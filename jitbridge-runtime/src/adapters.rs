//! Adapters between the interpreter's calling convention (every argument in
//! an 8-byte stack element) and the compiled one (registers first, see
//! `java_calling_convention`).
//!
//! One blob holds three entries:
//!
//! * i2c: interpreted caller, compiled callee
//! * c2i: compiled caller, interpreted callee
//! * c2i unverified: like c2i but checks the inline cache first

use std::collections::HashMap;
use std::sync::Arc;

use jitbridge_asm::x64::{
    Address, Condition, Immediate, R10, R11, R13, RAX, RBX, RCX, RDI, RSI, RSP,
};
use parking_lot::Mutex;

use crate::basic_type::BasicType;
use crate::calling_convention::java_calling_convention;
use crate::code::{CodeBlob, CodeError};
use crate::config::BridgeConfig;
use crate::cpu::{REG_METHOD, REG_SENDER_SP, REG_THREAD};
use crate::frame::INTERPRETER_RETURN_SENTINEL;
use crate::masm::{Label, MacroAssembler};
use crate::oops::{CompiledIcHolder, Method};
use crate::thread::JavaThread;
use crate::vmreg::VMRegPair;
use crate::{STACK_ALIGNMENT, STACK_SLOT_SIZE, WORD_SIZE, round_up};

/// Size of one interpreter expression stack element.
pub const STACK_ELEMENT_SIZE: i32 = WORD_SIZE;

const ADAPTER_ENTRY_ALIGNMENT: usize = 8;

/// Offsets of the three entries inside an adapter blob.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct AdapterOffsets {
    pub i2c: u32,
    pub c2i_unverified: u32,
    pub c2i: u32,
}

/// Emits i2c, c2i-unverified and c2i for `sig`, whose compiled locations
/// are `regs`.
pub fn generate_i2c2i_adapters(
    masm: &mut MacroAssembler,
    sig: &[BasicType],
    comp_args_on_stack: i32,
    regs: &[VMRegPair],
) -> AdapterOffsets {
    let i2c = masm.pos();
    gen_i2c_adapter(masm, sig, comp_args_on_stack, regs);

    masm.align(ADAPTER_ENTRY_ALIGNMENT);
    let c2i_unverified = masm.pos();
    let skip_fixup = masm.create_label();
    gen_c2i_unverified_check(masm, skip_fixup);

    masm.align(ADAPTER_ENTRY_ALIGNMENT);
    let c2i = masm.pos();
    gen_c2i_adapter(masm, sig, regs, skip_fixup);

    AdapterOffsets {
        i2c,
        c2i_unverified,
        c2i,
    }
}

fn gen_i2c_adapter(
    masm: &mut MacroAssembler,
    sig: &[BasicType],
    comp_args_on_stack: i32,
    regs: &[VMRegPair],
) {
    let flags = &masm.config().flags;
    let entries = &masm.config().entries;
    let total_args_passed = sig.len() as i32;

    masm.movq_ra(RAX, Address::reg(RSP));

    // Without SSE2 the interpreter has to clean up the FPU stack when
    // compiled code returns to it: return to the call stub's compiled entry,
    // or to the entry the interpreter stored next to its return address.
    if flags.use_sse < 2 || flags.verify_fpu {
        let skip = masm.create_label();
        let chk_int = masm.create_label();

        masm.load_external(R10, entries.call_stub_return_address);
        masm.cmpq_rr(RAX, R10);
        masm.jcc(Condition::NotEqual, chk_int);
        masm.load_external(RAX, entries.call_stub_compiled_return);
        masm.jmp(skip);

        masm.bind_label(chk_int);
        masm.movq_ra(RAX, Address::offset(RAX, INTERPRETER_RETURN_SENTINEL));
        masm.bind_label(skip);
    }

    // Arguments are read relative to the original sp, compiled code needs
    // an aligned one.
    masm.movq_rr(R11, RSP);

    if comp_args_on_stack > 0 {
        let comp_words_on_stack =
            round_up(comp_args_on_stack * STACK_SLOT_SIZE, WORD_SIZE) / WORD_SIZE;
        let comp_words_on_stack = round_up(comp_words_on_stack, 2);
        masm.subq_ri(RSP, Immediate((comp_words_on_stack * WORD_SIZE) as i64));
    }

    masm.andq_ri(RSP, Immediate(-(STACK_ALIGNMENT as i64)));

    // as if compiled code had called the callee
    masm.pushq_r(RAX);

    let saved_sp = RAX;
    masm.movq_rr(saved_sp, R11);

    masm.movq_ra(
        R11,
        Address::offset(REG_METHOD, Method::from_compiled_entry_offset()),
    );

    for (i, &ty) in sig.iter().enumerate() {
        if ty == BasicType::Void {
            assert!(
                i > 0 && sig[i - 1].is_two_word(),
                "missing half"
            );
            continue;
        }

        let ld_off = (total_args_passed - i as i32) * STACK_ELEMENT_SIZE;
        // 64-bit values live in the lower-addressed element of their pair
        let next_off = ld_off - STACK_ELEMENT_SIZE;
        let value_off = if ty.is_two_word() { next_off } else { ld_off };

        let r_1 = regs[i].first();
        let r_2 = regs[i].second();

        if !r_1.is_valid() {
            assert!(!r_2.is_valid());
            continue;
        }

        if r_1.is_stack() {
            // skip the return address
            let st_off = r_1.reg2stack() * STACK_SLOT_SIZE + WORD_SIZE;

            // r13 is free: compiled code does not expect the sender sp
            if !r_2.is_valid() {
                masm.movl_ra(R13, Address::offset(saved_sp, ld_off));
                masm.movl_ar(Address::offset(RSP, st_off), R13);
            } else {
                masm.movq_ra(R13, Address::offset(saved_sp, value_off));
                masm.movq_ar(Address::offset(RSP, st_off), R13);
            }
        } else if let Some(reg) = r_1.as_register() {
            assert!(reg != RAX, "must be different");

            if r_2.is_valid() {
                masm.movq_ra(reg, Address::offset(saved_sp, value_off));
            } else {
                masm.movl_ra(reg, Address::offset(saved_sp, ld_off));
            }
        } else if let Some(xmm) = r_1.as_xmm() {
            if r_2.is_valid() {
                masm.movsd_ra(xmm, Address::offset(saved_sp, next_off));
            } else {
                masm.movss_ra(xmm, Address::offset(saved_sp, ld_off));
            }
        } else {
            panic!("unexpected location {:?}", r_1);
        }
    }

    // The callee may be deoptimized while we get here; the runtime finds
    // the intended target in the thread rather than in the half-converted
    // frame.
    masm.movq_ar(
        Address::offset(REG_THREAD, JavaThread::callee_target_offset()),
        REG_METHOD,
    );

    // c2i expects the method in rax as well
    masm.movq_rr(RAX, REG_METHOD);
    masm.jmp_r(R11);
}

/// Checks the inline cache for a c2i entered through an unverified call
/// site: `rax` holds the `CompiledIcHolder`, `rcx` the receiver.
fn gen_c2i_unverified_check(masm: &mut MacroAssembler, skip_fixup: Label) {
    let ic_miss = masm.config().entries.ic_miss_stub;
    let holder = RAX;
    let receiver = RCX;
    let temp = RBX;
    let ok = masm.create_label();

    masm.load_klass(temp, receiver);
    masm.cmpq_ra(
        temp,
        Address::offset(holder, CompiledIcHolder::holder_klass_offset()),
    );
    masm.movq_ra(
        REG_METHOD,
        Address::offset(holder, CompiledIcHolder::holder_method_offset()),
    );
    masm.jcc(Condition::Equal, ok);
    masm.jump_runtime(ic_miss);

    // Method got compiled since the call site was set to interpreted: treat
    // as a miss so that the call site gets fixed.
    masm.bind_label(ok);
    masm.cmpq_ai(
        Address::offset(REG_METHOD, Method::code_offset()),
        Immediate(0),
    );
    masm.jcc(Condition::Equal, skip_fixup);
    masm.jump_runtime(ic_miss);
}

/// Calls the runtime to patch the compiled caller's call site when the
/// callee has compiled code by now.
fn patch_callers_callsite(masm: &mut MacroAssembler) {
    let fixup = masm.config().entries.fixup_callers_callsite;
    let done = masm.create_label();

    masm.cmpq_ai(
        Address::offset(REG_METHOD, Method::code_offset()),
        Immediate(0),
    );
    masm.jcc(Condition::Equal, done);

    masm.movq_rr(R13, RSP);
    masm.movq_ra(RAX, Address::reg(RSP));

    // push_cpu_state needs an aligned stack for fxsave
    masm.andq_ri(RSP, Immediate(-(STACK_ALIGNMENT as i64)));
    masm.push_cpu_state();

    masm.movq_rr(RDI, REG_METHOD);
    masm.movq_rr(RSI, RAX);
    masm.call_runtime(fixup);

    masm.pop_cpu_state();
    masm.movq_rr(RSP, R13);
    masm.bind_label(done);
}

fn gen_c2i_adapter(
    masm: &mut MacroAssembler,
    sig: &[BasicType],
    regs: &[VMRegPair],
    skip_fixup: Label,
) {
    patch_callers_callsite(masm);
    masm.bind_label(skip_fixup);

    let total_args_passed = sig.len() as i32;

    // all arguments plus the return address, stored first
    let extraspace = round_up(
        total_args_passed * STACK_ELEMENT_SIZE + WORD_SIZE,
        STACK_ALIGNMENT,
    );

    masm.popq_r(RAX);
    masm.movq_rr(REG_SENDER_SP, RSP);
    masm.subq_ri(RSP, Immediate(extraspace as i64));
    masm.movq_ar(Address::reg(RSP), RAX);

    for (i, &ty) in sig.iter().enumerate() {
        if ty == BasicType::Void {
            assert!(
                i > 0 && sig[i - 1].is_two_word(),
                "missing half"
            );
            continue;
        }

        let st_off = (total_args_passed - i as i32) * STACK_ELEMENT_SIZE;
        let next_off = st_off - STACK_ELEMENT_SIZE;
        let value_off = if ty.is_two_word() { next_off } else { st_off };

        let r_1 = regs[i].first();
        let r_2 = regs[i].second();

        if !r_1.is_valid() {
            assert!(!r_2.is_valid());
            continue;
        }

        if r_1.is_stack() {
            let ld_off = r_1.reg2stack() * STACK_SLOT_SIZE + extraspace;

            if !r_2.is_valid() {
                masm.movl_ra(RAX, Address::offset(RSP, ld_off));
                masm.movq_ar(Address::offset(RSP, st_off), RAX);
            } else {
                masm.movq_ra(RAX, Address::offset(RSP, ld_off));
                masm.movq_ar(Address::offset(RSP, value_off), RAX);
            }
        } else if let Some(reg) = r_1.as_register() {
            if r_2.is_valid() {
                masm.movq_ar(Address::offset(RSP, value_off), reg);
            } else {
                masm.movl_ar(Address::offset(RSP, st_off), reg);
            }
        } else if let Some(xmm) = r_1.as_xmm() {
            if r_2.is_valid() {
                masm.movsd_ar(Address::offset(RSP, next_off), xmm);
            } else {
                masm.movss_ar(Address::offset(RSP, st_off), xmm);
            }
        } else {
            panic!("unexpected location {:?}", r_1);
        }
    }

    masm.movq_ra(
        RCX,
        Address::offset(REG_METHOD, Method::interpreter_entry_offset()),
    );
    masm.jmp_r(RCX);
}

/// Signature shape an adapter depends on. Int-like types share the `int`
/// locations and arrays are objects, so methods differing only in those
/// share one adapter.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct AdapterFingerPrint(Vec<BasicType>);

impl AdapterFingerPrint {
    pub fn new(sig: &[BasicType]) -> AdapterFingerPrint {
        AdapterFingerPrint(sig.iter().map(|&ty| adapter_encoding(ty)).collect())
    }

    pub fn types(&self) -> &[BasicType] {
        &self.0
    }
}

fn adapter_encoding(ty: BasicType) -> BasicType {
    match ty {
        BasicType::Boolean
        | BasicType::Byte
        | BasicType::Short
        | BasicType::Char
        | BasicType::Int => BasicType::Int,
        BasicType::Object | BasicType::Array => BasicType::Object,
        BasicType::Long
        | BasicType::Float
        | BasicType::Double
        | BasicType::Void
        | BasicType::Address => ty,
        _ => panic!("unexpected type {:?} in adapter signature", ty),
    }
}

pub struct AdapterHandlerEntry {
    fingerprint: AdapterFingerPrint,
    blob: CodeBlob,
    offsets: AdapterOffsets,
}

impl AdapterHandlerEntry {
    pub fn fingerprint(&self) -> &AdapterFingerPrint {
        &self.fingerprint
    }

    pub fn blob(&self) -> &CodeBlob {
        &self.blob
    }

    pub fn i2c_entry(&self) -> u64 {
        self.blob.address_of(self.offsets.i2c)
    }

    pub fn c2i_entry(&self) -> u64 {
        self.blob.address_of(self.offsets.c2i)
    }

    pub fn c2i_unverified_entry(&self) -> u64 {
        self.blob.address_of(self.offsets.c2i_unverified)
    }
}

/// Adapters shared by all methods of the same shape.
pub struct AdapterHandlerLibrary {
    config: BridgeConfig,
    adapters: Mutex<HashMap<AdapterFingerPrint, Arc<AdapterHandlerEntry>>>,
}

impl AdapterHandlerLibrary {
    pub fn new(config: BridgeConfig) -> AdapterHandlerLibrary {
        AdapterHandlerLibrary {
            config,
            adapters: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the adapter for the expanded signature `sig`, generating it
    /// on first use.
    pub fn get_adapter(&self, sig: &[BasicType]) -> Result<Arc<AdapterHandlerEntry>, CodeError> {
        let fingerprint = AdapterFingerPrint::new(sig);
        let mut adapters = self.adapters.lock();

        if let Some(entry) = adapters.get(&fingerprint) {
            return Ok(entry.clone());
        }

        let entry = Arc::new(self.create_adapter(fingerprint.clone())?);
        adapters.insert(fingerprint, entry.clone());
        Ok(entry)
    }

    fn create_adapter(&self, fingerprint: AdapterFingerPrint) -> Result<AdapterHandlerEntry, CodeError> {
        let sig = fingerprint.types();
        let mut regs = vec![VMRegPair::new(); sig.len()];
        let comp_args_on_stack =
            java_calling_convention(sig, &mut regs, false, self.config.flags.use_sse);

        let mut masm = MacroAssembler::new(&self.config);
        let offsets = generate_i2c2i_adapters(&mut masm, sig, comp_args_on_stack, &regs);
        let (code, oop_maps) = masm.finalize();

        log::debug!(
            "i2c2i adapter for {:?}: {} bytes, {} stack slots",
            sig,
            code.size(),
            comp_args_on_stack
        );

        let blob = CodeBlob::install(
            "i2c2i adapter",
            code,
            oop_maps,
            0,
            None,
            self.config.flags.emit_stubs,
        )?;

        Ok(AdapterHandlerEntry {
            fingerprint,
            blob,
            offsets,
        })
    }

    pub fn len(&self) -> usize {
        self.adapters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.lock().is_empty()
    }
}
