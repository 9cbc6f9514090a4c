//! Deoptimization and uncommon-trap blobs.
//!
//! Both blobs replace the compiled frame they are entered from by the
//! skeletal interpreter frames an `UnrollBlock` describes, then let the
//! runtime fill those frames in through `unpack_frames` and return into the
//! youngest of them.

use std::marker::PhantomData;
use std::mem::offset_of;

use jitbridge_asm::x64::{
    Address, Condition, Immediate, R8, R9, R14, RAX, RBP, RBX, RCX, RDI, RDX, RSI, RSP, XMM0,
};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::basic_type::BasicType;
use crate::code::{CodeBlob, CodeError};
use crate::config::BridgeConfig;
use crate::cpu::REG_THREAD;
use crate::frame::{self, SimpleRuntimeFrame};
use crate::masm::MacroAssembler;
use crate::oopmap::OopMap;
use crate::register_saver::RegisterSaver;
use crate::thread::JavaThread;
use crate::{STACK_ALIGNMENT, STACK_SLOT_SIZE, WORD_SIZE};

/// How `unpack_frames` treats the frames it fills in. Passed to the
/// runtime as an integer.
#[derive(Copy, Clone, PartialEq, Eq, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum UnpackMode {
    /// Returning to a deoptimized frame; continue after the call.
    Deopt = 0,
    /// An exception is pending in the deoptimized frame.
    Exception = 1,
    UncommonTrap = 2,
    /// Re-execute the bytecode at the deoptimization point.
    Reexecute = 3,
}

/// Description of the interpreter frames replacing a deoptimized frame, as
/// returned by `fetch_unroll_info` and `uncommon_trap`.
///
/// `frame_sizes` lists the size of every frame in bytes, oldest first, return
/// address and saved `rbp` included. `frame_pcs` has one more entry: the
/// return address of every frame followed by the pc the youngest frame
/// resumes at.
#[repr(C)]
pub struct UnrollBlock<'a> {
    size_of_deoptimized_frame: i32,
    caller_adjustment: i32,
    number_of_frames: i32,
    total_frame_sizes: i32,
    frame_sizes: *const usize,
    frame_pcs: *const usize,
    initial_info: usize,
    return_type: i32,
    _frames: PhantomData<&'a [usize]>,
}

impl<'a> UnrollBlock<'a> {
    pub fn new(
        size_of_deoptimized_frame: i32,
        caller_adjustment: i32,
        frame_sizes: &'a [usize],
        frame_pcs: &'a [usize],
        initial_fp: usize,
        return_type: BasicType,
    ) -> UnrollBlock<'a> {
        assert!(!frame_sizes.is_empty(), "nothing to unpack");
        assert_eq!(frame_pcs.len(), frame_sizes.len() + 1);
        assert!(
            frame_sizes
                .iter()
                .all(|&size| size >= 2 * WORD_SIZE as usize && size % STACK_ALIGNMENT as usize == 0),
            "bad frame size in {:?}",
            frame_sizes
        );
        assert!(caller_adjustment >= 0 && size_of_deoptimized_frame >= 0);

        UnrollBlock {
            size_of_deoptimized_frame,
            caller_adjustment,
            number_of_frames: frame_sizes.len() as i32,
            total_frame_sizes: frame_sizes.iter().sum::<usize>() as i32,
            frame_sizes: frame_sizes.as_ptr(),
            frame_pcs: frame_pcs.as_ptr(),
            initial_info: initial_fp,
            return_type: u8::from(return_type) as i32,
            _frames: PhantomData,
        }
    }

    pub fn address(&self) -> usize {
        self as *const UnrollBlock as usize
    }

    pub fn number_of_frames(&self) -> i32 {
        self.number_of_frames
    }

    pub fn total_frame_sizes(&self) -> i32 {
        self.total_frame_sizes
    }

    pub fn return_type(&self) -> Option<BasicType> {
        BasicType::try_from(self.return_type as u8).ok()
    }

    pub fn size_of_deoptimized_frame_offset() -> i32 {
        offset_of!(UnrollBlock, size_of_deoptimized_frame) as i32
    }

    pub fn caller_adjustment_offset() -> i32 {
        offset_of!(UnrollBlock, caller_adjustment) as i32
    }

    pub fn number_of_frames_offset() -> i32 {
        offset_of!(UnrollBlock, number_of_frames) as i32
    }

    pub fn total_frame_sizes_offset() -> i32 {
        offset_of!(UnrollBlock, total_frame_sizes) as i32
    }

    pub fn frame_sizes_offset() -> i32 {
        offset_of!(UnrollBlock, frame_sizes) as i32
    }

    pub fn frame_pcs_offset() -> i32 {
        offset_of!(UnrollBlock, frame_pcs) as i32
    }

    pub fn initial_info_offset() -> i32 {
        offset_of!(UnrollBlock, initial_info) as i32
    }
}

pub struct DeoptimizationBlob {
    blob: CodeBlob,
    reexecute: u32,
    exception: u32,
    exception_in_tls: u32,
}

impl DeoptimizationBlob {
    pub fn blob(&self) -> &CodeBlob {
        &self.blob
    }

    /// Return address patched into a deoptimized frame; result registers
    /// are live.
    pub fn unpack(&self) -> u64 {
        self.blob.start()
    }

    pub fn unpack_with_reexecution(&self) -> u64 {
        self.blob.address_of(self.reexecute)
    }

    /// Entered with the exception oop in `rax` and the throwing pc in
    /// `rdx`.
    pub fn unpack_with_exception(&self) -> u64 {
        self.blob.address_of(self.exception)
    }

    /// Entered with exception oop and pc already stored in the thread and
    /// no return address on the stack.
    pub fn unpack_with_exception_in_tls(&self) -> u64 {
        self.blob.address_of(self.exception_in_tls)
    }
}

pub struct UncommonTrapBlob {
    blob: CodeBlob,
}

impl UncommonTrapBlob {
    pub fn blob(&self) -> &CodeBlob {
        &self.blob
    }

    /// Jumped to by compiled code with the trap request in `rcx`.
    pub fn entry(&self) -> u64 {
        self.blob.start()
    }
}

/// Pops the deoptimized frame and pushes the skeletal interpreter frames.
/// Expects the `UnrollBlock` in `rdi` and `rsp` at the return address into
/// the deoptimized frame; leaves the return address of the youngest frame
/// pushed. Clobbers `rbx`, `rcx`, `rsi`, `r8` and `r9`.
fn push_skeletal_frames(masm: &mut MacroAssembler) {
    let sender_sp = R8;
    let counter = R9;

    // pop the deoptimized frame; rsp then points at the return address
    // into its caller
    masm.movl_ra(
        RCX,
        Address::offset(RDI, UnrollBlock::size_of_deoptimized_frame_offset()),
    );
    masm.addq_rr(RSP, RCX);

    // rbp before the bang: a stack overflow has to see the caller's frame
    masm.movq_ra(RBP, Address::offset(RDI, UnrollBlock::initial_info_offset()));

    if masm.config().flags.use_stack_banging {
        masm.movl_ra(RBX, Address::offset(RDI, UnrollBlock::total_frame_sizes_offset()));
        masm.bang_stack_size(RBX, RCX);
    }

    masm.movq_ra(RCX, Address::offset(RDI, UnrollBlock::frame_pcs_offset()));

    // trash the old pc
    masm.addq_ri(RSP, Immediate(WORD_SIZE as i64));

    masm.movq_ra(RSI, Address::offset(RDI, UnrollBlock::frame_sizes_offset()));
    masm.movl_ra(counter, Address::offset(RDI, UnrollBlock::number_of_frames_offset()));

    // Make room for the extra locals but keep the unextended sp for the
    // oldest skeletal frame.
    masm.movq_rr(sender_sp, RSP);
    masm.movl_ra(RBX, Address::offset(RDI, UnrollBlock::caller_adjustment_offset()));
    masm.subq_rr(RSP, RBX);

    let lbl_loop = masm.create_and_bind_label();
    masm.movq_ra(RBX, Address::reg(RSI));
    // return address and rbp are pushed by hand
    masm.subq_ri(RBX, Immediate(2 * WORD_SIZE as i64));
    masm.pushq_a(Address::reg(RCX));
    masm.enter();
    masm.subq_rr(RSP, RBX);
    masm.movq_ai(
        Address::offset(RBP, frame::interpreter_frame_last_sp()),
        Immediate(0),
    );
    masm.movq_ar(
        Address::offset(RBP, frame::interpreter_frame_sender_sp()),
        sender_sp,
    );
    masm.movq_rr(sender_sp, RSP);
    masm.addq_ri(RSI, Immediate(WORD_SIZE as i64));
    masm.addq_ri(RCX, Immediate(WORD_SIZE as i64));
    masm.decl_r(counter);
    masm.jcc(Condition::NotZero, lbl_loop);

    masm.pushq_a(Address::reg(RCX));
}

/// Calls `unpack_frames(thread, mode)` from a frame whose `rbp` is set up,
/// with `rsp` aligned for the call and restored afterwards. `the_pc` is
/// the pc published as last Java pc.
fn call_unpack_frames(masm: &mut MacroAssembler, the_pc: u32, mode: Option<UnpackMode>) {
    let unpack_frames = masm.config().entries.unpack_frames;

    masm.set_last_java_frame(None, Some(RBP), Some(the_pc));
    masm.andq_ri(RSP, Immediate(-(STACK_ALIGNMENT as i64)));
    match mode {
        Some(mode) => masm.movl_ri(RSI, Immediate(i32::from(mode) as i64)),
        None => masm.movl_rr(RSI, R14),
    }
    masm.movq_rr(RDI, REG_THREAD);
    masm.call_runtime(unpack_frames);

    // sp relative addressing follows
    masm.movq_ra(
        RSP,
        Address::offset(REG_THREAD, JavaThread::last_java_sp_offset()),
    );
    masm.reset_last_java_frame(true);
}

pub fn generate_deopt_blob(config: &BridgeConfig) -> Result<DeoptimizationBlob, CodeError> {
    let entries = &config.entries;
    let mut masm = MacroAssembler::new(config);
    let cont = masm.create_label();

    // The unpack mode lives in r14 (callee saved) until unpack_frames.

    // Normal deoptimization: returning into the deoptimized frame, result
    // registers are live.
    let (map, frame_size_in_words) = RegisterSaver::save_live_registers(&mut masm, 0);
    masm.movl_ri(R14, Immediate(i32::from(UnpackMode::Deopt) as i64));
    masm.jmp(cont);

    // The return address describes the bytecode to re-execute.
    let reexecute = masm.pos();
    RegisterSaver::save_live_registers(&mut masm, 0);
    masm.movl_ri(R14, Immediate(i32::from(UnpackMode::Reexecute) as i64));
    masm.jmp(cont);

    // Only rax (exception oop) and rdx (throwing pc) are live; hand them to
    // the thread and continue like the exception-in-thread case.
    let exception = masm.pos();
    masm.movq_ar(
        Address::offset(REG_THREAD, JavaThread::exception_pc_offset()),
        RDX,
    );
    masm.movq_ar(
        Address::offset(REG_THREAD, JavaThread::exception_oop_offset()),
        RAX,
    );

    let exception_in_tls = masm.pos();
    // Return address slot, patched with the throwing pc once all registers
    // are saved.
    masm.pushq_i(Immediate(0));
    RegisterSaver::save_live_registers(&mut masm, 0);
    masm.movl_ri(R14, Immediate(i32::from(UnpackMode::Exception) as i64));

    masm.movq_ra(
        RDX,
        Address::offset(REG_THREAD, JavaThread::exception_pc_offset()),
    );
    masm.movq_ar(Address::offset(RBP, WORD_SIZE), RDX);
    masm.movq_ai(
        Address::offset(REG_THREAD, JavaThread::exception_pc_offset()),
        Immediate(0),
    );

    masm.bind_label(cont);

    // fetch_unroll_info(thread) must not block
    masm.set_last_java_frame(None, None, None);
    masm.movq_rr(RDI, REG_THREAD);
    masm.call_runtime(entries.fetch_unroll_info);
    masm.add_gc_map(map);
    masm.reset_last_java_frame(false);

    masm.movq_rr(RDI, RAX);

    let no_exception = masm.create_label();
    masm.cmpl_ri(R14, Immediate(i32::from(UnpackMode::Exception) as i64));
    masm.jcc(Condition::NotEqual, no_exception);
    masm.movq_ra(
        RAX,
        Address::offset(REG_THREAD, JavaThread::exception_oop_offset()),
    );
    masm.movq_ra(
        RDX,
        Address::offset(REG_THREAD, JavaThread::exception_pc_offset()),
    );
    masm.movq_ai(
        Address::offset(REG_THREAD, JavaThread::exception_oop_offset()),
        Immediate(0),
    );
    masm.movq_ai(
        Address::offset(REG_THREAD, JavaThread::exception_pc_offset()),
        Immediate(0),
    );
    // the exception becomes the result
    masm.movq_ar(
        Address::offset(RSP, RegisterSaver::rax_offset_in_bytes()),
        RAX,
    );
    masm.movq_ar(
        Address::offset(RSP, RegisterSaver::rdx_offset_in_bytes()),
        RDX,
    );
    masm.bind_label(no_exception);

    // Everything but the result registers is dead or captured by the
    // runtime.
    RegisterSaver::restore_result_registers(&mut masm);

    push_skeletal_frames(&mut masm);

    // Re-push the self frame at full size; return address and rbp are
    // already in place.
    masm.enter();
    masm.subq_ri(RSP, Immediate(((frame_size_in_words - 2) * WORD_SIZE) as i64));
    masm.movsd_ar(
        Address::offset(RSP, RegisterSaver::xmm0_offset_in_bytes()),
        XMM0,
    );
    masm.movq_ar(
        Address::offset(RSP, RegisterSaver::rax_offset_in_bytes()),
        RAX,
    );
    masm.movq_ar(
        Address::offset(RSP, RegisterSaver::rdx_offset_in_bytes()),
        RDX,
    );

    let the_pc = masm.pos();
    call_unpack_frames(&mut masm, the_pc, None);
    masm.add_gc_map_at(
        the_pc,
        OopMap::new(frame_size_in_words * WORD_SIZE / STACK_SLOT_SIZE, 0),
    );

    // unpack_frames returns the BasicType of the result
    let not_float = masm.create_label();
    let not_double = masm.create_label();
    let done = masm.create_label();

    masm.cmpl_ri(RAX, Immediate(u8::from(BasicType::Float) as i64));
    masm.jcc(Condition::NotEqual, not_float);
    masm.movss_ra(
        XMM0,
        Address::offset(RSP, RegisterSaver::xmm0_offset_in_bytes()),
    );
    masm.jmp(done);

    masm.bind_label(not_float);
    masm.cmpl_ri(RAX, Immediate(u8::from(BasicType::Double) as i64));
    masm.jcc(Condition::NotEqual, not_double);
    masm.movsd_ra(
        XMM0,
        Address::offset(RSP, RegisterSaver::xmm0_offset_in_bytes()),
    );
    masm.jmp(done);

    masm.bind_label(not_double);
    masm.movq_ra(
        RAX,
        Address::offset(RSP, RegisterSaver::rax_offset_in_bytes()),
    );
    masm.movq_ra(
        RDX,
        Address::offset(RSP, RegisterSaver::rdx_offset_in_bytes()),
    );

    masm.bind_label(done);
    masm.leave();
    masm.retq();

    let (code, oop_maps) = masm.finalize();

    log::debug!(
        "deopt blob: {} bytes, frame {} words",
        code.size(),
        frame_size_in_words
    );

    let blob = CodeBlob::install(
        "deopt blob",
        code,
        oop_maps,
        frame_size_in_words,
        None,
        config.flags.emit_stubs,
    )?;

    Ok(DeoptimizationBlob {
        blob,
        reexecute,
        exception,
        exception_in_tls,
    })
}

pub fn generate_uncommon_trap_blob(config: &BridgeConfig) -> Result<UncommonTrapBlob, CodeError> {
    let entries = &config.entries;
    let mut masm = MacroAssembler::new(config);
    let frame_size = SimpleRuntimeFrame::FRAMESIZE;

    // The return address is already pushed, so only rbp is left to store.
    masm.subq_ri(
        RSP,
        Immediate((SimpleRuntimeFrame::RETURN_OFF * STACK_SLOT_SIZE) as i64),
    );
    masm.movq_ar(
        Address::offset(RSP, SimpleRuntimeFrame::RBP_OFF * STACK_SLOT_SIZE),
        RBP,
    );

    // trap request arrives in the first Java argument register
    masm.movl_rr(RSI, RCX);
    masm.set_last_java_frame(None, None, None);
    masm.movq_rr(RDI, REG_THREAD);
    masm.call_runtime(entries.uncommon_trap);
    masm.add_gc_map(OopMap::new(frame_size, 0));
    masm.reset_last_java_frame(false);

    masm.movq_rr(RDI, RAX);

    // pop the self frame down to the return address
    masm.addq_ri(
        RSP,
        Immediate(((frame_size - 2) * STACK_SLOT_SIZE) as i64),
    );

    push_skeletal_frames(&mut masm);

    masm.enter();
    let rest = (frame_size - 4) * STACK_SLOT_SIZE;
    if rest > 0 {
        masm.subq_ri(RSP, Immediate(rest as i64));
    }

    let the_pc = masm.pos();
    call_unpack_frames(&mut masm, the_pc, Some(UnpackMode::UncommonTrap));
    masm.add_gc_map_at(the_pc, OopMap::new(frame_size, 0));

    masm.leave();
    masm.retq();

    let (code, oop_maps) = masm.finalize();

    log::debug!(
        "uncommon trap blob: {} bytes, frame {} words",
        code.size(),
        frame_size / 2
    );

    let blob = CodeBlob::install(
        "uncommon trap blob",
        code,
        oop_maps,
        frame_size / 2,
        None,
        config.flags.emit_stubs,
    )?;

    Ok(UncommonTrapBlob { blob })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

    use jitbridge_asm::x64::*;
    use jitbridge_sim::{HostAction, Machine, SimEnv};

    use super::*;
    use crate::config::{RuntimeEntries, RuntimeFlags, VmGlobals};

    const PC_A: usize = 0xA000;
    const PC_B: usize = 0xB000;
    const INITIAL_FP: usize = 0xF00D_0000;
    const DEOPTIMIZED_FRAME: i32 = 48;
    const CALLER_ADJUSTMENT: i32 = 16;

    /// Runtime side of deoptimization: hands out one UnrollBlock and
    /// records what the blobs pass in.
    struct Runtime {
        env: SimEnv,
        entries: RuntimeEntries,
        unroll: Arc<AtomicU64>,
        result_type: Arc<AtomicU32>,
        mode: Arc<AtomicI32>,
        trap_request: Arc<AtomicI32>,
        continuation: u64,
    }

    fn aligned(m: &Machine) -> bool {
        (m.reg(RSP) + 8) % 16 == 0
    }

    impl Runtime {
        fn new() -> Runtime {
            let env = SimEnv::new();
            let unroll = Arc::new(AtomicU64::new(0));
            let result_type = Arc::new(AtomicU32::new(u8::from(BasicType::Void) as u32));
            let mode = Arc::new(AtomicI32::new(-1));
            let trap_request = Arc::new(AtomicI32::new(0));

            let block = unroll.clone();
            let fetch_unroll_info = env.register_host(move |m| {
                assert!(aligned(m));
                assert_eq!(m.reg(RDI), m.reg(R15));
                let last_sp = m
                    .read_u64(m.reg(R15) + JavaThread::last_java_sp_offset() as u64)
                    .unwrap();
                assert_eq!(last_sp, m.reg(RSP) + 8);
                m.set_reg(RAX, block.load(Ordering::SeqCst));
                HostAction::Return
            });

            let block = unroll.clone();
            let request = trap_request.clone();
            let uncommon_trap = env.register_host(move |m| {
                assert!(aligned(m));
                assert_eq!(m.reg(RDI), m.reg(R15));
                request.store(m.reg(RSI) as u32 as i32, Ordering::SeqCst);
                m.set_reg(RAX, block.load(Ordering::SeqCst));
                HostAction::Return
            });

            let seen_mode = mode.clone();
            let ty = result_type.clone();
            let unpack_frames = env.register_host(move |m| {
                assert!(aligned(m));
                assert_eq!(m.reg(RDI), m.reg(R15));
                let last_fp = m
                    .read_u64(m.reg(R15) + JavaThread::last_java_fp_offset() as u64)
                    .unwrap();
                assert_eq!(last_fp, m.reg(RBP));
                seen_mode.store(m.reg(RSI) as u32 as i32, Ordering::SeqCst);
                // garbage in the result registers
                m.set_reg(RDX, 0xbad);
                m.set_xmm(XMM0, 0xbad);
                m.set_reg(RAX, ty.load(Ordering::SeqCst) as u64);
                HostAction::Return
            });

            let continuation = env.register_host(|_| HostAction::Halt);

            let entries = RuntimeEntries {
                fetch_unroll_info,
                uncommon_trap,
                unpack_frames,
                ..RuntimeEntries::default()
            };

            Runtime {
                env,
                entries,
                unroll,
                result_type,
                mode,
                trap_request,
                continuation,
            }
        }

        fn config(&self) -> BridgeConfig {
            BridgeConfig::new(
                RuntimeFlags::default(),
                CpuFeatureSet::sse2(),
                self.entries.clone(),
                VmGlobals::default(),
            )
        }
    }

    struct Scenario {
        sizes: Vec<usize>,
        pcs: Vec<usize>,
    }

    impl Scenario {
        fn new(rt: &Runtime) -> Scenario {
            Scenario {
                sizes: vec![64, 96],
                pcs: vec![PC_A, PC_B, rt.continuation as usize],
            }
        }

        fn block(&self, return_type: BasicType) -> UnrollBlock<'_> {
            UnrollBlock::new(
                DEOPTIMIZED_FRAME,
                CALLER_ADJUSTMENT,
                &self.sizes,
                &self.pcs,
                INITIAL_FP,
                return_type,
            )
        }
    }

    /// Stack pointer of the caller of the deoptimized frame.
    fn caller_sp(machine: &Machine) -> u64 {
        machine.stack().top() - 1024
    }

    /// Sets up a deoptimized frame below `caller_sp` and returns the stack
    /// pointer at the moment its callee returned, i.e. `rsp` pointing at
    /// the return address into the deoptimized frame.
    fn deoptimized_frame(machine: &mut Machine) -> u64 {
        let caller_sp = caller_sp(machine);
        machine.write_u64(caller_sp - 8, 0xdead).unwrap();
        let sp = caller_sp - 8 - DEOPTIMIZED_FRAME as u64;
        machine.write_u64(sp, 0x1234).unwrap();
        sp
    }

    /// Walks the skeletal frames from the youngest one and checks links,
    /// return addresses, sizes and sender sps.
    fn check_frames(machine: &Machine, scenario: &Scenario) {
        let caller_sp = caller_sp(machine);
        let n = scenario.sizes.len();

        let mut rbp = machine.reg(RBP);
        let youngest_size = scenario.sizes[n - 1] as u64;
        assert_eq!(machine.reg(RSP), rbp - (youngest_size - 16));

        let mut frames = Vec::new();
        for _ in 0..n {
            frames.push(rbp);
            rbp = machine.read_u64(rbp).unwrap();
        }
        assert_eq!(rbp, INITIAL_FP as u64);
        frames.reverse();

        for (idx, &fp) in frames.iter().enumerate() {
            assert_eq!(machine.read_u64(fp + 8).unwrap(), scenario.pcs[idx] as u64);
            assert_eq!(machine.read_u64(fp - 16).unwrap(), 0, "last sp");

            let sender_sp = machine.read_u64(fp - 8).unwrap();
            if idx == 0 {
                assert_eq!(sender_sp, caller_sp);
                assert_eq!(fp + 16, caller_sp - CALLER_ADJUSTMENT as u64);
            } else {
                let older = frames[idx - 1];
                assert_eq!(older - fp, scenario.sizes[idx - 1] as u64);
                assert_eq!(sender_sp, fp + 16);
            }
        }
    }

    #[test]
    fn test_unroll_block_layout() {
        let sizes = [64, 96];
        let pcs = [1, 2, 3];
        let block = UnrollBlock::new(48, 0, &sizes, &pcs, 0, BasicType::Int);
        assert_eq!(block.number_of_frames(), 2);
        assert_eq!(block.total_frame_sizes(), 160);
        assert_eq!(block.return_type(), Some(BasicType::Int));
        assert_eq!(UnrollBlock::size_of_deoptimized_frame_offset(), 0);
        assert_eq!(UnrollBlock::frame_sizes_offset(), 16);
        assert_eq!(UnrollBlock::frame_pcs_offset(), 24);
        assert_eq!(UnrollBlock::initial_info_offset(), 32);
        assert_eq!(i32::from(UnpackMode::UncommonTrap), 2);
    }

    #[test]
    #[should_panic]
    fn test_unroll_block_needs_continuation_pc() {
        let sizes = [64];
        let pcs = [1];
        UnrollBlock::new(48, 0, &sizes, &pcs, 0, BasicType::Int);
    }

    #[test]
    fn test_deopt_unpacks_frames() {
        let rt = Runtime::new();
        let config = rt.config();
        let deopt = generate_deopt_blob(&config).unwrap();
        rt.env.map_code(deopt.blob().start(), deopt.blob().size());
        let scenario = Scenario::new(&rt);

        let results = [
            (BasicType::Double, 2.5f64.to_bits() as u128),
            (BasicType::Float, 1.25f32.to_bits() as u128),
            (BasicType::Long, 0),
        ];

        for (ty, xmm) in results {
            let block = scenario.block(ty);
            rt.unroll.store(block.address() as u64, Ordering::SeqCst);
            rt.result_type.store(u8::from(ty) as u32, Ordering::SeqCst);

            let thread = JavaThread::new();
            let mut machine = Machine::new(&rt.env);
            let sp = deoptimized_frame(&mut machine);
            machine.set_reg(RSP, sp);
            machine.set_reg(R15, thread.address() as u64);
            machine.set_reg(RAX, 0x1111);
            machine.set_reg(RDX, 0x2222);
            machine.set_xmm(XMM0, xmm);
            machine.run(deopt.unpack()).unwrap();

            assert_eq!(rt.mode.load(Ordering::SeqCst), i32::from(UnpackMode::Deopt));
            check_frames(&machine, &scenario);

            match ty {
                BasicType::Double => assert_eq!(machine.xmm_f64(XMM0), 2.5),
                BasicType::Float => assert_eq!(machine.xmm_f32(XMM0), 1.25),
                _ => {
                    assert_eq!(machine.reg(RAX), 0x1111);
                    assert_eq!(machine.reg(RDX), 0x2222);
                }
            }

            assert_eq!(thread.last_java_sp(), 0);
            assert_eq!(thread.last_java_fp(), 0);
        }
    }

    #[test]
    fn test_deopt_reexecute_mode() {
        let rt = Runtime::new();
        let config = rt.config();
        let deopt = generate_deopt_blob(&config).unwrap();
        rt.env.map_code(deopt.blob().start(), deopt.blob().size());
        let scenario = Scenario::new(&rt);
        let block = scenario.block(BasicType::Void);
        rt.unroll.store(block.address() as u64, Ordering::SeqCst);

        let thread = JavaThread::new();
        let mut machine = Machine::new(&rt.env);
        let sp = deoptimized_frame(&mut machine);
        machine.set_reg(RSP, sp);
        machine.set_reg(R15, thread.address() as u64);
        machine.run(deopt.unpack_with_reexecution()).unwrap();

        assert_eq!(
            rt.mode.load(Ordering::SeqCst),
            i32::from(UnpackMode::Reexecute)
        );
        check_frames(&machine, &scenario);
    }

    #[test]
    fn test_deopt_with_exception() {
        let rt = Runtime::new();
        let config = rt.config();
        let deopt = generate_deopt_blob(&config).unwrap();
        rt.env.map_code(deopt.blob().start(), deopt.blob().size());
        let scenario = Scenario::new(&rt);
        let block = scenario.block(BasicType::Object);
        rt.unroll.store(block.address() as u64, Ordering::SeqCst);
        rt.result_type
            .store(u8::from(BasicType::Object) as u32, Ordering::SeqCst);

        for in_tls in [false, true] {
            let thread = JavaThread::new();
            let mut machine = Machine::new(&rt.env);
            // no return address: the blob makes room for the throwing pc
            let sp = deoptimized_frame(&mut machine) + 8;
            machine.set_reg(RSP, sp);
            machine.set_reg(R15, thread.address() as u64);

            let entry = if in_tls {
                thread.set_exception_oop(0xE0E0);
                thread.set_exception_pc(0x7777);
                deopt.unpack_with_exception_in_tls()
            } else {
                machine.set_reg(RAX, 0xE0E0);
                machine.set_reg(RDX, 0x7777);
                deopt.unpack_with_exception()
            };

            machine.run(entry).unwrap();

            assert_eq!(
                rt.mode.load(Ordering::SeqCst),
                i32::from(UnpackMode::Exception)
            );
            // the throwing pc replaced the dummy return slot
            assert_eq!(machine.read_u64(sp - 8).unwrap(), 0x7777);
            check_frames(&machine, &scenario);
            assert_eq!(machine.reg(RAX), 0xE0E0);
            assert_eq!(thread.exception_oop(), 0);
            assert_eq!(thread.exception_pc(), 0);
        }
    }

    #[test]
    fn test_uncommon_trap() {
        let rt = Runtime::new();
        let config = rt.config();
        let blob = generate_uncommon_trap_blob(&config).unwrap();
        rt.env.map_code(blob.blob().start(), blob.blob().size());
        let scenario = Scenario::new(&rt);
        let block = scenario.block(BasicType::Void);
        rt.unroll.store(block.address() as u64, Ordering::SeqCst);

        let thread = JavaThread::new();
        let mut machine = Machine::new(&rt.env);
        let sp = deoptimized_frame(&mut machine);
        machine.set_reg(RSP, sp);
        machine.set_reg(R15, thread.address() as u64);
        machine.set_reg(RCX, (-11i32) as u32 as u64);
        machine.run(blob.entry()).unwrap();

        assert_eq!(rt.trap_request.load(Ordering::SeqCst), -11);
        assert_eq!(
            rt.mode.load(Ordering::SeqCst),
            i32::from(UnpackMode::UncommonTrap)
        );
        check_frames(&machine, &scenario);
        assert_eq!(thread.last_java_sp(), 0);
        assert_eq!(blob.blob().oop_maps().len(), 2);
    }

    #[test]
    fn test_deopt_blob_oop_maps() {
        let rt = Runtime::new();
        let config = rt.config();
        let deopt = generate_deopt_blob(&config).unwrap();

        // one map for fetch_unroll_info, one for unpack_frames
        assert_eq!(deopt.blob().oop_maps().len(), 2);
        let (_, save_map) = deopt.blob().oop_maps().iter().next().unwrap();
        assert_eq!(save_map.frame_size(), 168);
        assert!(save_map.oops().next().is_none());
        assert_eq!(deopt.blob().frame_size(), 84);
    }
}
