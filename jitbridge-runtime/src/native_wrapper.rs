//! Wrapper that lets compiled code call a native method.
//!
//! The wrapper receives its arguments in the compiled convention and
//! passes them on the stack to the native function, preceded by the
//! `JNIEnv*` and, for static methods, a handle to the class mirror. Objects
//! are passed as handles: the address of a frame slot holding the oop, or
//! null for a null reference. Frame layout from `rsp` upwards:
//!
//! ```text
//!   outgoing native arguments
//!   oop handle area (one word per register argument)
//!   class mirror slot (static methods)
//!   lock box (synchronized methods)
//!   result save slot          <- rbp - 8
//!   saved rbp                 <- rbp
//!   return address
//! ```

use jitbridge_asm::x64::{
    Address, Condition, Immediate, R10, R12, R13, R14, RAX, RBP, RBX, RCX, RDI, RDX, RSI, RSP,
    Register, XMM0,
};

use crate::basic_type::BasicType;
use crate::calling_convention::{c_calling_convention, java_calling_convention};
use crate::code::{CodeBlob, CodeError};
use crate::config::BridgeConfig;
use crate::cpu::REG_THREAD;
use crate::masm::MacroAssembler;
use crate::monitor::{self, SlowPath};
use crate::oopmap::{OopMap, OopMapSet};
use crate::oops::{Klass, Method};
use crate::thread::{JavaThread, JniHandleBlock, StackGuardState, ThreadState};
use crate::vmreg::{VMReg, VMRegPair};
use crate::{SLOTS_PER_WORD, STACK_ALIGNMENT_IN_SLOTS, STACK_SLOT_SIZE, WORD_SIZE, round_up};

/// Registers of the compiled convention that can hold an oop, in the order
/// of their handle slots.
const JAVA_OOP_ARG_REGS: [Register; 2] = [RCX, RDX];

const OOP_HANDLE_REG: Register = R14;
const LOCK_REG: Register = R13;
const OBJ_REG: Register = RBX;

/// Shape of the method a wrapper is generated for. `params` are the
/// declared parameter types, without receiver.
#[derive(Clone, Debug)]
pub struct NativeSignature<'a> {
    pub params: &'a [BasicType],
    pub ret: BasicType,
    pub is_static: bool,
    pub is_synchronized: bool,
}

/// Frame slot assignment of a wrapper, in 4-byte slots from `rsp`.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct FrameLayout {
    pub stack_slots: i32,
    pub oop_handle_offset: i32,
    pub klass_slot_offset: Option<i32>,
    pub lock_slot_offset: Option<i32>,
}

impl FrameLayout {
    pub fn compute(out_arg_slots: i32, is_static: bool, is_synchronized: bool) -> FrameLayout {
        let mut stack_slots = out_arg_slots;

        let oop_handle_offset = stack_slots;
        stack_slots += JAVA_OOP_ARG_REGS.len() as i32 * SLOTS_PER_WORD;

        let klass_slot_offset = if is_static {
            let offset = stack_slots;
            stack_slots += SLOTS_PER_WORD;
            Some(offset)
        } else {
            None
        };

        let lock_slot_offset = if is_synchronized {
            let offset = stack_slots;
            stack_slots += SLOTS_PER_WORD;
            Some(offset)
        } else {
            None
        };

        // result save slot, saved rbp and return address
        stack_slots += 3 * SLOTS_PER_WORD;
        let stack_slots = round_up(stack_slots, STACK_ALIGNMENT_IN_SLOTS);

        FrameLayout {
            stack_slots,
            oop_handle_offset,
            klass_slot_offset,
            lock_slot_offset,
        }
    }

    pub fn stack_size(&self) -> i32 {
        self.stack_slots * STACK_SLOT_SIZE
    }
}

pub struct NativeWrapper {
    blob: CodeBlob,
    verified_entry: u32,
    frame_complete: u32,
    layout: FrameLayout,
    receiver_offset: Option<i32>,
}

impl NativeWrapper {
    pub fn blob(&self) -> &CodeBlob {
        &self.blob
    }

    /// Entry for calls through an inline cache; `rax` holds the expected
    /// klass.
    pub fn entry(&self) -> u64 {
        self.blob.start()
    }

    pub fn verified_entry(&self) -> u64 {
        self.blob.address_of(self.verified_entry)
    }

    pub fn verified_entry_offset(&self) -> u32 {
        self.verified_entry
    }

    pub fn frame_complete_offset(&self) -> u32 {
        self.frame_complete
    }

    pub fn layout(&self) -> FrameLayout {
        self.layout
    }

    /// Frame size in words, return address included.
    pub fn frame_size(&self) -> i32 {
        self.layout.stack_size() / WORD_SIZE
    }

    /// Byte offset from `rsp` of the slot holding the receiver, or the
    /// class mirror for static methods.
    pub fn receiver_offset(&self) -> Option<i32> {
        self.receiver_offset
    }

    /// Byte offset from `rsp` of the lock box of a synchronized method.
    pub fn lock_offset(&self) -> Option<i32> {
        self.layout
            .lock_slot_offset
            .map(|slot| slot * STACK_SLOT_SIZE)
    }

    pub fn oop_maps(&self) -> &OopMapSet {
        self.blob.oop_maps()
    }
}

fn reg2offset_in(reg: VMReg) -> i32 {
    // saved rbp and return address sit between rbp and the arguments
    reg.reg2stack() * STACK_SLOT_SIZE + 2 * WORD_SIZE
}

fn reg2offset_out(reg: VMReg) -> i32 {
    reg.reg2stack() * STACK_SLOT_SIZE
}

fn out_address(dst: VMRegPair) -> Address {
    let dst = dst.first();
    assert!(dst.is_stack(), "native arguments are passed on the stack");
    Address::offset(RSP, reg2offset_out(dst))
}

fn simple_move32(masm: &mut MacroAssembler, src: VMRegPair, dst: VMRegPair) {
    let dst = out_address(dst);

    if src.first().is_stack() {
        masm.movl_ra(RAX, Address::offset(RBP, reg2offset_in(src.first())));
        masm.movl_ar(dst, RAX);
    } else if let Some(reg) = src.first().as_register() {
        masm.movl_ar(dst, reg);
    } else {
        panic!("bad int argument {:?}", src.first());
    }
}

fn float_move(masm: &mut MacroAssembler, src: VMRegPair, dst: VMRegPair) {
    let dst = out_address(dst);

    if src.first().is_stack() {
        masm.movl_ra(RAX, Address::offset(RBP, reg2offset_in(src.first())));
        masm.movl_ar(dst, RAX);
    } else if let Some(xmm) = src.first().as_xmm() {
        masm.movss_ar(dst, xmm);
    } else {
        panic!("bad float argument {:?}", src.first());
    }
}

fn long_move(masm: &mut MacroAssembler, src: VMRegPair, dst: VMRegPair) {
    let dst = out_address(dst);

    if src.first().is_stack() {
        masm.movq_ra(RAX, Address::offset(RBP, reg2offset_in(src.first())));
        masm.movq_ar(dst, RAX);
    } else if let Some(reg) = src.first().as_register() {
        masm.movq_ar(dst, reg);
    } else {
        panic!("bad long argument {:?}", src.first());
    }
}

fn double_move(masm: &mut MacroAssembler, src: VMRegPair, dst: VMRegPair) {
    let dst = out_address(dst);

    if src.first().is_stack() {
        masm.movq_ra(RAX, Address::offset(RBP, reg2offset_in(src.first())));
        masm.movq_ar(dst, RAX);
    } else if let Some(xmm) = src.first().as_xmm() {
        masm.movsd_ar(dst, xmm);
    } else {
        panic!("bad double argument {:?}", src.first());
    }
}

/// Passes an oop as handle. Oops arriving in registers are first stored
/// into the oop handle area; stack oops already live in the caller's frame.
/// Returns the handle slot's byte offset from `rsp`.
fn object_move(
    masm: &mut MacroAssembler,
    map: &mut OopMap,
    layout: &FrameLayout,
    src: VMRegPair,
    dst: VMRegPair,
) -> i32 {
    let handle = RAX;

    let offset = if src.first().is_stack() {
        let slot_in_older_frame = src.first().reg2stack() + layout.stack_slots;
        map.set_oop(VMReg::stack(slot_in_older_frame));

        let src_addr = Address::offset(RBP, reg2offset_in(src.first()));
        masm.cmpq_ai(src_addr, Immediate(0));
        masm.lea(handle, src_addr);
        masm.cmovq_ra(Condition::Equal, handle, src_addr);

        slot_in_older_frame * STACK_SLOT_SIZE
    } else {
        let oop = src
            .first()
            .as_register()
            .unwrap_or_else(|| panic!("bad oop argument {:?}", src.first()));
        let idx = JAVA_OOP_ARG_REGS
            .iter()
            .position(|&reg| reg == oop)
            .unwrap_or_else(|| panic!("{:?} is no oop argument register", oop));

        let oop_slot = idx as i32 * SLOTS_PER_WORD + layout.oop_handle_offset;
        let offset = oop_slot * STACK_SLOT_SIZE;
        map.set_oop(VMReg::stack(oop_slot));

        let slot_addr = Address::offset(RSP, offset);
        masm.movq_ar(slot_addr, oop);
        masm.cmpq_ri(oop, Immediate(0));
        masm.lea(handle, slot_addr);
        // null reference, null handle
        masm.cmovq_ra(Condition::Equal, handle, slot_addr);

        offset
    };

    masm.movq_ar(out_address(dst), handle);
    offset
}

fn result_slot() -> Address {
    Address::offset(RBP, -WORD_SIZE)
}

fn save_native_result(masm: &mut MacroAssembler, ret: BasicType) {
    match ret {
        BasicType::Float => masm.movss_ar(result_slot(), XMM0),
        BasicType::Double => masm.movsd_ar(result_slot(), XMM0),
        BasicType::Void => {}
        _ => masm.movq_ar(result_slot(), RAX),
    }
}

fn restore_native_result(masm: &mut MacroAssembler, ret: BasicType) {
    match ret {
        BasicType::Float => masm.movss_ra(XMM0, result_slot()),
        BasicType::Double => masm.movsd_ra(XMM0, result_slot()),
        BasicType::Void => {}
        _ => masm.movq_ra(RAX, result_slot()),
    }
}

fn is_fp_result(ret: BasicType) -> bool {
    matches!(ret, BasicType::Float | BasicType::Double)
}

fn set_thread_state(masm: &mut MacroAssembler, state: ThreadState) {
    masm.movl_ai(
        Address::offset(REG_THREAD, JavaThread::thread_state_offset()),
        Immediate(u32::from(state) as i64),
    );
}

/// Generates and installs the wrapper for `method`, whose native function
/// must already be bound.
pub fn generate_native_wrapper(
    config: &BridgeConfig,
    method: &Method,
    sig: &NativeSignature,
) -> Result<NativeWrapper, CodeError> {
    let native_function = method.native_function() as u64;
    assert!(native_function != 0, "native method is not bound");

    let flags = &config.flags;
    let entries = &config.entries;

    let in_sig = BasicType::expand_signature(sig.params, sig.is_static);
    let mut in_regs = vec![VMRegPair::new(); in_sig.len()];
    java_calling_convention(&in_sig, &mut in_regs, false, flags.use_sse);

    let mut out_sig = Vec::with_capacity(in_sig.len() + 2);
    out_sig.push(BasicType::Address);
    if sig.is_static {
        out_sig.push(BasicType::Object);
    }
    out_sig.extend_from_slice(&in_sig);
    let mut out_regs = vec![VMRegPair::new(); out_sig.len()];
    let out_arg_slots = c_calling_convention(&out_sig, &mut out_regs);

    let layout = FrameLayout::compute(out_arg_slots, sig.is_static, sig.is_synchronized);
    let stack_size = layout.stack_size();

    let mut masm = MacroAssembler::new(config);

    // inline cache check: rax holds the klass the call site expects
    let hit = masm.create_label();
    {
        let receiver_klass = masm.get_scratch();
        masm.load_klass(*receiver_klass, JAVA_OOP_ARG_REGS[0]);
        masm.cmpq_rr(RAX, *receiver_klass);
    }
    masm.jcc(Condition::Equal, hit);
    masm.jump_runtime(entries.ic_miss_stub);

    // The first instruction of the verified entry gets patched when the
    // wrapper is made not entrant.
    masm.align(8);
    masm.bind_label(hit);
    let verified_entry = masm.pos();

    if flags.use_stack_banging {
        masm.bang_stack_with_offset(flags.stack_shadow_size());
    } else {
        masm.fat_nop();
    }

    masm.enter();
    masm.subq_ri(RSP, Immediate((stack_size - 2 * WORD_SIZE) as i64));
    let frame_complete = masm.pos();

    let mut map = OopMap::new(layout.stack_slots, 0);
    let mut receiver_offset = None;
    let c_arg_shift = if sig.is_static { 2 } else { 1 };

    for i in (0..in_sig.len()).rev() {
        let c_arg = i + c_arg_shift;

        match in_sig[i] {
            BasicType::Object | BasicType::Array => {
                let offset = object_move(&mut masm, &mut map, &layout, in_regs[i], out_regs[c_arg]);

                if i == 0 && !sig.is_static {
                    receiver_offset = Some(offset);
                }
            }
            BasicType::Void => {}
            BasicType::Float => float_move(&mut masm, in_regs[i], out_regs[c_arg]),
            BasicType::Double => {
                assert!(
                    in_sig.get(i + 1) == Some(&BasicType::Void)
                        && out_sig.get(c_arg + 1) == Some(&BasicType::Void),
                    "bad arg list"
                );
                double_move(&mut masm, in_regs[i], out_regs[c_arg]);
            }
            BasicType::Long => long_move(&mut masm, in_regs[i], out_regs[c_arg]),
            BasicType::Address => panic!("found address in java args"),
            _ => simple_move32(&mut masm, in_regs[i], out_regs[c_arg]),
        }
    }

    if let Some(klass_slot) = layout.klass_slot_offset {
        let klass_offset = klass_slot * STACK_SLOT_SIZE;

        masm.load_external(OOP_HANDLE_REG, method.method_holder() as u64);
        masm.movq_ra(
            OOP_HANDLE_REG,
            Address::offset(OOP_HANDLE_REG, Klass::java_mirror_offset()),
        );
        masm.movq_ar(Address::offset(RSP, klass_offset), OOP_HANDLE_REG);
        map.set_oop(VMReg::stack(klass_slot));

        // the mirror is never null
        masm.lea(OOP_HANDLE_REG, Address::offset(RSP, klass_offset));
        masm.movq_ar(out_address(out_regs[1]), OOP_HANDLE_REG);

        receiver_offset = Some(klass_offset);
    }

    // All calls out of this frame use this pc and map.
    let the_pc = masm.pos();
    masm.add_gc_map_at(the_pc, map);
    masm.set_last_java_frame(None, None, Some(the_pc));

    let lock_box = layout
        .lock_slot_offset
        .map(|slot| Address::offset(RSP, slot * STACK_SLOT_SIZE));
    let mut slow_lock: Option<SlowPath> = None;

    if let Some(lock_box) = lock_box {
        // receiver or mirror handle, second native argument
        masm.movq_ra(OOP_HANDLE_REG, out_address(out_regs[1]));
        masm.lea(LOCK_REG, lock_box);
        masm.movq_ra(OBJ_REG, Address::reg(OOP_HANDLE_REG));

        slow_lock = Some(monitor::lock_object(&mut masm, OBJ_REG, LOCK_REG, R10));
    }

    masm.lea(
        RDX,
        Address::offset(REG_THREAD, JavaThread::jni_environment_offset()),
    );
    masm.movq_ar(out_address(out_regs[0]), RDX);

    set_thread_state(&mut masm, ThreadState::InNative);
    masm.call_runtime(native_function);
    masm.restore_cpu_control_state_after_jni();

    // native code only defines the low bits of small results
    match sig.ret {
        BasicType::Boolean => masm.c2bool(RAX),
        BasicType::Char => masm.movzxw_rr(RAX, RAX),
        BasicType::Byte => masm.movsxbl_rr(RAX, RAX),
        BasicType::Short => masm.movsxwl_rr(RAX, RAX),
        _ => {}
    }

    // The VM thread must observe in-native-trans before we read the
    // safepoint state, or it could start a safepoint without waiting for
    // us.
    set_thread_state(&mut masm, ThreadState::InNativeTrans);
    masm.thread_state_barrier(RCX);

    let safepoint_slow = masm.create_label();
    let safepoint_done = masm.create_label();
    masm.safepoint_poll(safepoint_slow);
    masm.bind_label(safepoint_done);

    set_thread_state(&mut masm, ThreadState::InJava);

    let reguard = masm.create_label();
    let reguard_done = masm.create_label();
    masm.cmpl_ai(
        Address::offset(REG_THREAD, JavaThread::stack_guard_state_offset()),
        Immediate(u32::from(StackGuardState::YellowDisabled) as i64),
    );
    masm.jcc(Condition::Equal, reguard);
    masm.bind_label(reguard_done);

    let mut slow_unlock: Option<SlowPath> = None;

    if let Some(lock_box) = lock_box {
        let done = masm.create_label();
        masm.movq_ra(OBJ_REG, Address::reg(OOP_HANDLE_REG));
        monitor::unlock_object_prologue(&mut masm, OBJ_REG, lock_box, LOCK_REG, done);

        // cmpxchg needs rax
        let save_int = !is_fp_result(sig.ret);
        if save_int {
            save_native_result(&mut masm, sig.ret);
        }

        slow_unlock = Some(monitor::unlock_object(&mut masm, OBJ_REG, lock_box, LOCK_REG));

        if save_int {
            restore_native_result(&mut masm, sig.ret);
        }
        masm.bind_label(done);
    }

    masm.reset_last_java_frame(false);

    if sig.ret.is_reference() {
        let null_result = masm.create_label();
        masm.testq_rr(RAX, RAX);
        masm.jcc(Condition::Zero, null_result);
        masm.movq_ra(RAX, Address::reg(RAX));
        masm.bind_label(null_result);
    }

    // release the local handles the native code created
    masm.movq_ra(
        RCX,
        Address::offset(REG_THREAD, JavaThread::active_handles_offset()),
    );
    masm.movl_ai(
        Address::offset(RCX, JniHandleBlock::top_offset()),
        Immediate(0),
    );

    masm.leave();

    let exception_pending = masm.create_label();
    masm.cmpq_ai(
        Address::offset(REG_THREAD, JavaThread::pending_exception_offset()),
        Immediate(0),
    );
    masm.jcc(Condition::NotEqual, exception_pending);
    masm.retq();

    // out of line paths

    masm.bind_label(exception_pending);
    masm.jump_runtime(entries.forward_exception);

    if let Some(slow) = slow_lock {
        masm.bind_label(slow.entry);
        masm.movq_rr(RDI, OBJ_REG);
        masm.movq_rr(RSI, LOCK_REG);
        masm.movq_rr(RDX, REG_THREAD);
        masm.call_runtime(entries.complete_monitor_locking);
        masm.jmp(slow.resume);
    }

    if let (Some(slow), Some(lock_box)) = (slow_unlock, lock_box) {
        masm.bind_label(slow.entry);

        if is_fp_result(sig.ret) {
            save_native_result(&mut masm, sig.ret);
        }

        masm.lea(RSI, lock_box);
        masm.movq_rr(RDI, OBJ_REG);
        masm.movq_rr(R12, RSP);
        masm.andq_ri(RSP, Immediate(-16));

        // the runtime must not see the exception the native code threw
        let pending = Address::offset(REG_THREAD, JavaThread::pending_exception_offset());
        masm.movq_ra(OBJ_REG, pending);
        masm.movq_ai(pending, Immediate(0));
        masm.call_runtime(entries.complete_monitor_unlocking);
        masm.movq_rr(RSP, R12);
        masm.movq_ar(pending, OBJ_REG);

        if is_fp_result(sig.ret) {
            restore_native_result(&mut masm, sig.ret);
        }
        masm.jmp(slow.resume);
    }

    masm.bind_label(safepoint_slow);
    save_native_result(&mut masm, sig.ret);
    masm.movq_rr(RDI, REG_THREAD);
    masm.call_runtime_aligned(entries.check_special_condition_for_native_trans);
    restore_native_result(&mut masm, sig.ret);
    masm.jmp(safepoint_done);

    masm.bind_label(reguard);
    save_native_result(&mut masm, sig.ret);
    masm.call_runtime_aligned(entries.reguard_yellow_pages);
    restore_native_result(&mut masm, sig.ret);
    masm.jmp(reguard_done);

    let (code, oop_maps) = masm.finalize();

    log::debug!(
        "native wrapper {:?} -> {:?}: {} bytes, frame {} bytes",
        sig.params,
        sig.ret,
        code.size(),
        stack_size
    );

    let blob = CodeBlob::install(
        "native wrapper",
        code,
        oop_maps,
        stack_size / WORD_SIZE,
        Some(frame_complete),
        flags.emit_stubs,
    )?;

    Ok(NativeWrapper {
        blob,
        verified_entry,
        frame_complete,
        layout,
        receiver_offset,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

    use iced_x86::{Decoder, DecoderOptions};
    use jitbridge_asm::x64::*;
    use jitbridge_sim::{HostAction, Machine, SimEnv};

    use super::*;
    use crate::config::{RuntimeEntries, RuntimeFlags, VmGlobals};
    use crate::oops::{BIASED_LOCK_PATTERN, MONITOR_VALUE, ObjectHeader, UNLOCKED_VALUE};

    #[derive(Default)]
    struct Counters {
        ic_miss: AtomicUsize,
        forward_exception: AtomicUsize,
        locking: AtomicUsize,
        unlocking: AtomicUsize,
        special: AtomicUsize,
        reguard: AtomicUsize,
    }

    /// Runtime routines and VM globals the wrappers reference.
    struct Vm {
        env: SimEnv,
        counters: Arc<Counters>,
        safepoint_state: Box<AtomicU32>,
        _serialize_page: Box<[AtomicU32; 1024]>,
        _mxcsr: Box<u32>,
        entries: RuntimeEntries,
        globals: VmGlobals,
    }

    fn aligned(m: &Machine) -> bool {
        (m.reg(RSP) + 8) % 16 == 0
    }

    impl Vm {
        fn new() -> Vm {
            let env = SimEnv::new();
            let counters = Arc::new(Counters::default());

            let c = counters.clone();
            let ic_miss = env.register_host(move |_| {
                c.ic_miss.fetch_add(1, Ordering::SeqCst);
                HostAction::Halt
            });

            let c = counters.clone();
            let forward_exception = env.register_host(move |_| {
                c.forward_exception.fetch_add(1, Ordering::SeqCst);
                HostAction::Halt
            });

            let c = counters.clone();
            let complete_monitor_locking = env.register_host(move |m| {
                assert!(aligned(m));
                let obj = unsafe { &*(m.reg(RDI) as *const ObjectHeader) };
                let lock = m.reg(RSI);
                assert_eq!(m.reg(RDX), m.reg(R15));

                loop {
                    let mark = obj.mark();
                    if mark & 3 == UNLOCKED_VALUE {
                        m.write_u64(lock, mark as u64).unwrap();
                        if obj.cas_mark(mark, lock as usize).is_ok() {
                            break;
                        }
                    }
                    std::thread::yield_now();
                }

                c.locking.fetch_add(1, Ordering::SeqCst);
                HostAction::Return
            });

            let c = counters.clone();
            let complete_monitor_unlocking = env.register_host(move |m| {
                assert!(aligned(m));
                let pending = m
                    .read_u64(m.reg(R15) + JavaThread::pending_exception_offset() as u64)
                    .unwrap();
                assert_eq!(pending, 0, "pending exception visible to the runtime");
                let obj = unsafe { &*(m.reg(RDI) as *const ObjectHeader) };
                let displaced = m.read_u64(m.reg(RSI)).unwrap();
                obj.set_mark(displaced as usize);
                c.unlocking.fetch_add(1, Ordering::SeqCst);
                HostAction::Return
            });

            let c = counters.clone();
            let special = env.register_host(move |m| {
                assert!(aligned(m));
                assert_eq!(m.reg(RDI), m.reg(R15));
                let state = m
                    .read_u32(m.reg(RDI) + JavaThread::thread_state_offset() as u64)
                    .unwrap();
                assert_eq!(state, u32::from(ThreadState::InNativeTrans));
                m.set_reg(RAX, 0xbad);
                m.set_xmm(XMM0, 0xbad);
                c.special.fetch_add(1, Ordering::SeqCst);
                HostAction::Return
            });

            let c = counters.clone();
            let reguard = env.register_host(move |m| {
                assert!(aligned(m));
                m.write_u32(
                    m.reg(R15) + JavaThread::stack_guard_state_offset() as u64,
                    u32::from(StackGuardState::Enabled),
                )
                .unwrap();
                m.set_reg(RAX, 0xbad);
                m.set_xmm(XMM0, 0xbad);
                c.reguard.fetch_add(1, Ordering::SeqCst);
                HostAction::Return
            });

            let safepoint_state = Box::new(AtomicU32::new(0));
            let serialize_page: Box<[AtomicU32; 1024]> =
                Box::new(std::array::from_fn(|_| AtomicU32::new(0)));
            let mxcsr = Box::new(0x1F80u32);

            let globals = VmGlobals {
                safepoint_state: &*safepoint_state as *const AtomicU32 as u64,
                serialize_page: serialize_page.as_ptr() as u64,
                mxcsr_std: &*mxcsr as *const u32 as u64,
            };

            let entries = RuntimeEntries {
                ic_miss_stub: ic_miss,
                forward_exception,
                complete_monitor_locking,
                complete_monitor_unlocking,
                check_special_condition_for_native_trans: special,
                reguard_yellow_pages: reguard,
                ..RuntimeEntries::default()
            };

            Vm {
                env,
                counters,
                safepoint_state,
                _serialize_page: serialize_page,
                _mxcsr: mxcsr,
                entries,
                globals,
            }
        }

        fn config(&self, flags: RuntimeFlags) -> BridgeConfig {
            BridgeConfig::new(
                flags,
                CpuFeatureSet::sse2(),
                self.entries.clone(),
                self.globals.clone(),
            )
        }

        fn wrapper(&self, flags: RuntimeFlags, method: &Method, sig: &NativeSignature) -> NativeWrapper {
            let config = self.config(flags);
            let wrapper = generate_native_wrapper(&config, method, sig).unwrap();
            self.env
                .map_code(wrapper.blob().start(), wrapper.blob().size());
            wrapper
        }
    }

    struct JavaThreadWithHandles {
        thread: Box<JavaThread>,
        handles: Arc<JniHandleBlock>,
    }

    fn java_thread() -> JavaThreadWithHandles {
        let thread = JavaThread::new();
        let handles = Arc::new(JniHandleBlock::new());
        thread.set_active_handles(&handles);
        JavaThreadWithHandles { thread, handles }
    }

    /// Calls `entry` from a compiled caller whose outgoing stack arguments
    /// are `stack_slots`.
    fn invoke(
        vm: &Vm,
        entry: u64,
        thread: &JavaThread,
        stack_slots: &[u32],
        setup: impl FnOnce(&mut Machine),
    ) -> Machine {
        let mut machine = Machine::new(&vm.env);
        invoke_on(&mut machine, entry, thread, stack_slots, setup);
        machine
    }

    fn invoke_on(
        machine: &mut Machine,
        entry: u64,
        thread: &JavaThread,
        stack_slots: &[u32],
        setup: impl FnOnce(&mut Machine),
    ) {
        let sp = machine.stack().top() - round_up(stack_slots.len() as i32 * 4, 16) as u64 - 64;
        for (idx, &value) in stack_slots.iter().enumerate() {
            machine.write_u32(sp + idx as u64 * 4, value).unwrap();
        }
        machine.set_reg(RSP, sp);
        machine.set_reg(R15, thread.address() as u64);
        setup(machine);
        machine.call(entry).unwrap();
    }

    /// Native argument slot `slot` as seen by the native function.
    fn c_slot(m: &Machine, slot: u64) -> u64 {
        m.read_u64(m.reg(RSP) + 8 + slot * 4).unwrap()
    }

    fn c_slot32(m: &Machine, slot: u64) -> u32 {
        m.read_u32(m.reg(RSP) + 8 + slot * 4).unwrap()
    }

    fn bound_method(vm: &Vm, klass: &Klass, native: impl Fn(&mut Machine) -> HostAction + Send + Sync + 'static) -> Box<Method> {
        let method = Box::new(Method::new());
        method.set_native_function(vm.env.register_host(native) as usize);
        method.set_method_holder(klass);
        method
    }

    #[test]
    fn test_frame_layout() {
        let layout = FrameLayout::compute(12, true, true);
        assert_eq!(layout.oop_handle_offset, 12);
        assert_eq!(layout.klass_slot_offset, Some(16));
        assert_eq!(layout.lock_slot_offset, Some(18));
        assert_eq!(layout.stack_slots, 28);
        assert_eq!(layout.stack_size() % 16, 0);

        let layout = FrameLayout::compute(5, false, false);
        assert_eq!(layout.klass_slot_offset, None);
        assert_eq!(layout.stack_slots, 16);
    }

    #[test]
    fn test_static_call_marshals_arguments() {
        use BasicType::*;
        let vm = Vm::new();
        let mirror = Box::new(0u64);
        let mirror_addr = &*mirror as *const u64 as u64;
        let klass = Klass::new(UNLOCKED_VALUE);
        klass.set_java_mirror(mirror_addr as usize);
        let payload = Box::new(0u64);
        let obj_addr = &*payload as *const u64 as u64;
        let jt = java_thread();
        let env_addr = jt.thread.jni_environment() as u64;
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_native = seen.clone();

        let method = bound_method(&vm, &klass, move |m| {
            assert!(aligned(m));
            let thread = m.reg(R15);
            assert_eq!(
                m.read_u32(thread + JavaThread::thread_state_offset() as u64).unwrap(),
                u32::from(ThreadState::InNative)
            );
            assert_eq!(
                m.read_u64(thread + JavaThread::last_java_sp_offset() as u64).unwrap(),
                m.reg(RSP) + 8
            );
            assert_ne!(
                m.read_u64(thread + JavaThread::last_java_pc_offset() as u64).unwrap(),
                0
            );

            assert_eq!(c_slot(m, 0), env_addr);
            let mirror_handle = c_slot(m, 2);
            assert_eq!(m.read_u64(mirror_handle).unwrap(), mirror_addr);
            assert_eq!(c_slot32(m, 4), 0xfeed_0001);
            assert_eq!(c_slot(m, 5), 0x1122_3344_5566_7788);
            assert_eq!(c_slot32(m, 7), 1.5f32.to_bits());
            assert_eq!(c_slot(m, 8), (-2.25f64).to_bits());
            let obj_handle = c_slot(m, 10);
            assert_ne!(obj_handle, 0);
            assert_eq!(m.read_u64(obj_handle).unwrap(), obj_addr);

            seen_native.fetch_add(1, Ordering::SeqCst);
            m.set_reg(RAX, 0x0102_0304_0506_0708);
            HostAction::Return
        });

        let sig = NativeSignature {
            params: &[Int, Long, Float, Double, Object],
            ret: Long,
            is_static: true,
            is_synchronized: false,
        };
        let wrapper = vm.wrapper(RuntimeFlags::default(), &method, &sig);
        assert!(wrapper.receiver_offset().is_some());

        let long = 0x1122_3344_5566_7788u64;
        let machine = invoke(
            &vm,
            wrapper.verified_entry(),
            &jt.thread,
            &[long as u32, (long >> 32) as u32],
            |m| {
                m.set_reg(RCX, 0xfeed_0001);
                m.set_reg(RDX, obj_addr);
                m.set_xmm(XMM0, (-2.25f64).to_bits() as u128);
                m.set_xmm(XMM1, 1.5f32.to_bits() as u128);
            },
        );

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(machine.reg(RAX), 0x0102_0304_0506_0708);
        assert_eq!(jt.thread.state(), Some(ThreadState::InJava));
        assert_eq!(jt.thread.last_java_sp(), 0);
        assert_eq!(jt.thread.last_java_pc(), 0);
        assert_eq!(vm.counters.forward_exception.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_null_object_passes_null_handle() {
        use BasicType::*;
        let vm = Vm::new();
        let klass = Klass::new(UNLOCKED_VALUE);
        let jt = java_thread();
        let handles = Arc::new(AtomicU64::new(u64::MAX));
        let seen = handles.clone();

        // (Object, Object, Object): receiver in rcx, rdx, last one on the stack
        let method = bound_method(&vm, &klass, move |m| {
            assert_ne!(c_slot(m, 2), 0);
            assert_eq!(c_slot(m, 4), 0);
            assert_eq!(c_slot(m, 6), 0);
            seen.store(c_slot(m, 2), Ordering::SeqCst);
            HostAction::Return
        });

        let sig = NativeSignature {
            params: &[Object, Object],
            ret: Void,
            is_static: false,
            is_synchronized: false,
        };
        let wrapper = vm.wrapper(RuntimeFlags::default(), &method, &sig);
        let receiver = Box::new(0u64);

        invoke(&vm, wrapper.verified_entry(), &jt.thread, &[0, 0], |m| {
            m.set_reg(RCX, &*receiver as *const u64 as u64);
            m.set_reg(RDX, 0);
        });

        assert_ne!(handles.load(Ordering::SeqCst), u64::MAX);

        // handles of register oops live in the handle area, the stack oop in
        // the caller's frame
        let layout = wrapper.layout();
        let (_, map) = wrapper.oop_maps().iter().next().unwrap();
        let oops: Vec<VMReg> = map.oops().collect();
        assert_eq!(
            oops,
            vec![
                VMReg::stack(layout.oop_handle_offset),
                VMReg::stack(layout.oop_handle_offset + 2),
                VMReg::stack(layout.stack_slots),
            ]
        );
        assert_eq!(
            wrapper.receiver_offset(),
            Some(layout.oop_handle_offset * STACK_SLOT_SIZE)
        );
    }

    #[test]
    fn test_verified_entry() {
        use BasicType::*;
        let vm = Vm::new();
        let klass = Klass::new(UNLOCKED_VALUE);
        let method = bound_method(&vm, &klass, |_| HostAction::Return);
        let sig = NativeSignature {
            params: &[Int],
            ret: Void,
            is_static: true,
            is_synchronized: false,
        };

        for (banging, shadow_pages, page_size) in
            [(true, 6, 4096), (false, 6, 4096), (true, 1, 64), (true, 2, 16)]
        {
            let mut flags = RuntimeFlags::default();
            flags.use_stack_banging = banging;
            flags.stack_shadow_pages = shadow_pages;
            flags.page_size = page_size;
            let wrapper = vm.wrapper(flags, &method, &sig);

            assert_eq!(wrapper.verified_entry() % 8, 0);
            let offset = wrapper.verified_entry_offset() as usize;
            let code = &wrapper.blob().code()[offset..];
            let instr = Decoder::with_ip(64, code, 0, DecoderOptions::NONE).decode();
            assert!(instr.len() >= 5);
            assert!(wrapper.frame_complete_offset() > wrapper.verified_entry_offset());
        }
    }

    #[test]
    fn test_inline_cache_check() {
        use BasicType::*;
        let vm = Vm::new();
        let klass = Klass::new(UNLOCKED_VALUE);
        let other = Klass::new(UNLOCKED_VALUE);
        let called = Arc::new(AtomicUsize::new(0));
        let seen = called.clone();
        let method = bound_method(&vm, &klass, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            HostAction::Return
        });
        let sig = NativeSignature {
            params: &[],
            ret: Void,
            is_static: false,
            is_synchronized: false,
        };
        let wrapper = vm.wrapper(RuntimeFlags::default(), &method, &sig);
        let jt = java_thread();
        let receiver = ObjectHeader::new(&klass);
        let receiver_addr = &receiver as *const ObjectHeader as u64;

        invoke(&vm, wrapper.entry(), &jt.thread, &[], |m| {
            m.set_reg(RAX, &other as *const Klass as u64);
            m.set_reg(RCX, receiver_addr);
        });
        assert_eq!(vm.counters.ic_miss.load(Ordering::SeqCst), 1);
        assert_eq!(called.load(Ordering::SeqCst), 0);

        invoke(&vm, wrapper.entry(), &jt.thread, &[], |m| {
            m.set_reg(RAX, &klass as *const Klass as u64);
            m.set_reg(RCX, receiver_addr);
        });
        assert_eq!(vm.counters.ic_miss.load(Ordering::SeqCst), 1);
        assert_eq!(called.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_result_normalization() {
        use BasicType::*;
        let vm = Vm::new();
        let klass = Klass::new(UNLOCKED_VALUE);
        let jt = java_thread();

        let cases: [(BasicType, u64, u64); 7] = [
            (Boolean, 0xff00, 0),
            (Boolean, 0x1_0002, 1),
            (Char, 0xdead_1234_5678, 0x5678),
            (Byte, 0x80, 0xffff_ff80),
            (Byte, 0x17f, 0x7f),
            (Short, 0x8001, 0xffff_8001),
            (Int, 0x1234_5678, 0x1234_5678),
        ];

        for (ret, raw, expected) in cases {
            let method = bound_method(&vm, &klass, move |m| {
                m.set_reg(RAX, raw);
                HostAction::Return
            });
            let sig = NativeSignature {
                params: &[],
                ret,
                is_static: true,
                is_synchronized: false,
            };
            let wrapper = vm.wrapper(RuntimeFlags::default(), &method, &sig);
            let machine = invoke(&vm, wrapper.verified_entry(), &jt.thread, &[], |_| {});
            assert_eq!(machine.reg(RAX), expected, "{:?} from {:#x}", ret, raw);
        }
    }

    #[test]
    fn test_object_result_is_unhandlized() {
        use BasicType::*;
        let vm = Vm::new();
        let klass = Klass::new(UNLOCKED_VALUE);
        let jt = java_thread();

        for oop in [0x4242_0000u64, 0] {
            let handles = jt.handles.clone();
            let method = bound_method(&vm, &klass, move |m| {
                let handle = if oop == 0 {
                    0
                } else {
                    handles.make_local(oop as usize).unwrap() as u64
                };
                m.set_reg(RAX, handle);
                HostAction::Return
            });
            let sig = NativeSignature {
                params: &[],
                ret: Object,
                is_static: true,
                is_synchronized: false,
            };
            let wrapper = vm.wrapper(RuntimeFlags::default(), &method, &sig);
            let machine = invoke(&vm, wrapper.verified_entry(), &jt.thread, &[], |_| {});

            assert_eq!(machine.reg(RAX), oop);
            assert_eq!(jt.handles.top(), 0);
        }
    }

    #[test]
    fn test_pending_exception_is_forwarded() {
        use BasicType::*;
        let vm = Vm::new();
        let klass = Klass::new(UNLOCKED_VALUE);
        let jt = java_thread();
        let method = bound_method(&vm, &klass, |m| {
            m.write_u64(
                m.reg(R15) + JavaThread::pending_exception_offset() as u64,
                0xe0e0,
            )
            .unwrap();
            HostAction::Return
        });
        let sig = NativeSignature {
            params: &[],
            ret: Void,
            is_static: true,
            is_synchronized: false,
        };
        let wrapper = vm.wrapper(RuntimeFlags::default(), &method, &sig);

        let mut caller_sp = 0;
        let machine = invoke(&vm, wrapper.verified_entry(), &jt.thread, &[], |m| {
            caller_sp = m.reg(RSP);
        });

        assert_eq!(vm.counters.forward_exception.load(Ordering::SeqCst), 1);
        // frame popped, return address on top
        assert_eq!(machine.reg(RSP), caller_sp - 8);
        assert_eq!(
            machine.read_u64(machine.reg(RSP)).unwrap(),
            vm.env.halt_address()
        );
        assert_eq!(jt.thread.pending_exception(), 0xe0e0);
    }

    #[test]
    fn test_safepoint_slow_path_preserves_result() {
        use BasicType::*;
        let vm = Vm::new();
        let klass = Klass::new(UNLOCKED_VALUE);
        let jt = java_thread();
        let method = bound_method(&vm, &klass, |m| {
            m.set_xmm(XMM0, 6.5f64.to_bits() as u128);
            HostAction::Return
        });
        let sig = NativeSignature {
            params: &[],
            ret: Double,
            is_static: true,
            is_synchronized: false,
        };

        vm.safepoint_state.store(1, Ordering::SeqCst);

        for use_membar in [true, false] {
            let mut flags = RuntimeFlags::default();
            flags.use_membar = use_membar;
            let wrapper = vm.wrapper(flags, &method, &sig);
            let machine = invoke(&vm, wrapper.verified_entry(), &jt.thread, &[], |_| {});
            assert_eq!(machine.xmm_f64(XMM0), 6.5);
        }

        assert_eq!(vm.counters.special.load(Ordering::SeqCst), 2);

        // a suspend request alone also takes the slow path
        vm.safepoint_state.store(0, Ordering::SeqCst);
        jt.thread.set_suspend_flags(1);
        let wrapper = vm.wrapper(RuntimeFlags::default(), &method, &sig);
        invoke(&vm, wrapper.verified_entry(), &jt.thread, &[], |_| {});
        assert_eq!(vm.counters.special.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_reguard_preserves_result() {
        use BasicType::*;
        let vm = Vm::new();
        let klass = Klass::new(UNLOCKED_VALUE);
        let jt = java_thread();
        let method = bound_method(&vm, &klass, |m| {
            m.set_reg(RAX, 77);
            HostAction::Return
        });
        let sig = NativeSignature {
            params: &[],
            ret: Int,
            is_static: true,
            is_synchronized: false,
        };
        let wrapper = vm.wrapper(RuntimeFlags::default(), &method, &sig);

        jt.thread.set_stack_guard_state(StackGuardState::YellowDisabled);
        let machine = invoke(&vm, wrapper.verified_entry(), &jt.thread, &[], |_| {});

        assert_eq!(machine.reg(RAX), 77);
        assert_eq!(vm.counters.reguard.load(Ordering::SeqCst), 1);
        assert_eq!(jt.thread.stack_guard_state(), Some(StackGuardState::Enabled));
    }

    fn synchronized_sig() -> NativeSignature<'static> {
        NativeSignature {
            params: &[BasicType::Int],
            ret: BasicType::Int,
            is_static: false,
            is_synchronized: true,
        }
    }

    #[test]
    fn test_synchronized_stack_lock() {
        let vm = Vm::new();
        let klass = Klass::new(UNLOCKED_VALUE);
        let obj = ObjectHeader::new(&klass);
        let jt = java_thread();
        let wrapper_lock = Arc::new(AtomicU64::new(0));
        let seen = wrapper_lock.clone();

        let method = bound_method(&vm, &klass, move |m| {
            let receiver = m.read_u64(c_slot(m, 2)).unwrap();
            let mark = m.read_u64(receiver).unwrap();
            let lock_box = m.reg(RSP) + 8 + seen.load(Ordering::SeqCst);
            assert_eq!(mark, lock_box, "receiver not stack locked");
            assert_eq!(m.read_u64(lock_box).unwrap(), UNLOCKED_VALUE as u64);
            m.set_reg(RAX, c_slot32(m, 4) as u64 + 1);
            HostAction::Return
        });

        let mut flags = RuntimeFlags::default();
        flags.use_biased_locking = false;
        let wrapper = vm.wrapper(flags, &method, &synchronized_sig());
        wrapper_lock.store(wrapper.lock_offset().unwrap() as u64, Ordering::SeqCst);

        let machine = invoke(&vm, wrapper.verified_entry(), &jt.thread, &[], |m| {
            m.set_reg(RCX, &obj as *const ObjectHeader as u64);
            m.set_reg(RDX, 41);
        });

        assert_eq!(machine.reg(RAX), 42);
        assert_eq!(obj.mark(), UNLOCKED_VALUE);
        assert_eq!(vm.counters.locking.load(Ordering::SeqCst), 0);
        assert_eq!(vm.counters.unlocking.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_synchronized_biased_lock() {
        let vm = Vm::new();
        let klass = Klass::new(BIASED_LOCK_PATTERN);
        let obj = ObjectHeader::new(&klass);
        let jt = java_thread();
        let thread_addr = jt.thread.address() as u64;

        let method = bound_method(&vm, &klass, move |m| {
            let receiver = m.read_u64(c_slot(m, 2)).unwrap();
            let mark = m.read_u64(receiver).unwrap();
            assert_eq!(mark, thread_addr | BIASED_LOCK_PATTERN as u64);
            m.set_reg(RAX, 1);
            HostAction::Return
        });

        let wrapper = vm.wrapper(RuntimeFlags::default(), &method, &synchronized_sig());

        for _ in 0..2 {
            let machine = invoke(&vm, wrapper.verified_entry(), &jt.thread, &[], |m| {
                m.set_reg(RCX, &obj as *const ObjectHeader as u64);
                m.set_reg(RDX, 0);
            });
            assert_eq!(machine.reg(RAX), 1);
        }

        // the bias survives the unlock
        assert_eq!(obj.mark(), jt.thread.address() | BIASED_LOCK_PATTERN);
    }

    #[test]
    fn test_slow_unlock_keeps_pending_exception() {
        let vm = Vm::new();
        let klass = Klass::new(UNLOCKED_VALUE);
        let obj = ObjectHeader::new(&klass);
        let jt = java_thread();

        let method = bound_method(&vm, &klass, move |m| {
            // inflate the lock behind the wrapper's back and throw
            let receiver = m.read_u64(c_slot(m, 2)).unwrap();
            m.write_u64(receiver, 0x5000 | MONITOR_VALUE as u64).unwrap();
            m.write_u64(
                m.reg(R15) + JavaThread::pending_exception_offset() as u64,
                0xe0e0,
            )
            .unwrap();
            m.set_reg(RAX, 3);
            HostAction::Return
        });

        let mut flags = RuntimeFlags::default();
        flags.use_biased_locking = false;
        let wrapper = vm.wrapper(flags, &method, &synchronized_sig());

        invoke(&vm, wrapper.verified_entry(), &jt.thread, &[], |m| {
            m.set_reg(RCX, &obj as *const ObjectHeader as u64);
            m.set_reg(RDX, 0);
        });

        assert_eq!(vm.counters.unlocking.load(Ordering::SeqCst), 1);
        assert_eq!(vm.counters.forward_exception.load(Ordering::SeqCst), 1);
        assert_eq!(jt.thread.pending_exception(), 0xe0e0);
        assert_eq!(obj.mark(), UNLOCKED_VALUE);
    }

    #[repr(C)]
    struct CountedObject {
        header: ObjectHeader,
        count: AtomicU64,
    }

    #[test]
    fn test_concurrent_synchronized_calls() {
        const THREADS: u32 = 8;
        const CALLS: u64 = 1250;

        let vm = Vm::new();
        let klass = Klass::new(UNLOCKED_VALUE);
        let obj = CountedObject {
            header: ObjectHeader::new(&klass),
            count: AtomicU64::new(0),
        };

        // unsynchronized read-modify-write: only the monitor keeps it exact
        let method = bound_method(&vm, &klass, |m| {
            let receiver = m.read_u64(c_slot(m, 2)).unwrap() as *const CountedObject;
            let count = unsafe { &(*receiver).count };
            let value = count.load(Ordering::Relaxed);
            std::thread::yield_now();
            count.store(value + 1, Ordering::Relaxed);
            HostAction::Return
        });

        let mut flags = RuntimeFlags::default();
        flags.use_biased_locking = false;
        let wrapper = vm.wrapper(flags, &method, &synchronized_sig());
        let obj_addr = &obj as *const CountedObject as u64;

        let mut pool = scoped_threadpool::Pool::new(THREADS);
        pool.scoped(|scope| {
            for _ in 0..THREADS {
                let vm = &vm;
                let wrapper = &wrapper;
                scope.execute(move || {
                    let jt = java_thread();
                    let mut machine = Machine::new(&vm.env);
                    machine.set_step_limit(u64::MAX);
                    for _ in 0..CALLS {
                        invoke_on(&mut machine, wrapper.verified_entry(), &jt.thread, &[], |m| {
                            m.set_reg(RCX, obj_addr);
                            m.set_reg(RDX, 0);
                        });
                    }
                });
            }
        });

        assert_eq!(obj.count.load(Ordering::SeqCst), THREADS as u64 * CALLS);
        assert_eq!(obj.header.mark(), UNLOCKED_VALUE);
    }
}
