use jitbridge_asm::x64::{
    Address, AddressLiteral, Condition, Immediate, R8, R9, R10, R11, R12, R13, R14, R15, RAX, RBP,
    RBX, RCX, RDI, RDX, RSI, RSP, Register, ScaleFactor,
};

use crate::WORD_SIZE;
use crate::cpu::REG_THREAD;
use crate::masm::{Label, MacroAssembler};
use crate::oops::{
    AGE_MASK_IN_PLACE, BIASED_LOCK_MASK_IN_PLACE, BIASED_LOCK_PATTERN, EPOCH_MASK_IN_PLACE,
    Klass, ObjectHeader,
};
use crate::thread::JavaThread;

/// Size of the `fxsave` image: x87 state, MXCSR and XMM0-15.
pub const FPU_STATE_SIZE_IN_BYTES: i32 = 512;

/// Layout of `pusha`: general purpose registers by word index from `rsp`.
/// The `rsp` slot holds a copy that `popa` ignores.
pub const PUSHA_ORDER: [Register; 16] = [
    R15, R14, R13, R12, R11, R10, R9, R8, RDI, RSI, RBP, RSP, RBX, RDX, RCX, RAX,
];

const SERIALIZE_PAGE_SHIFT_COUNT: i64 = 3;

impl<'a> MacroAssembler<'a> {
    pub fn enter(&mut self) {
        self.asm.pushq_r(RBP);
        self.asm.movq_rr(RBP, RSP);
    }

    pub fn call_runtime(&mut self, target: u64) {
        let tmp = self.get_scratch();
        self.asm
            .movabs_literal(*tmp, AddressLiteral::runtime_call(target));
        self.asm.call_r(*tmp);
    }

    pub fn jump_runtime(&mut self, target: u64) {
        let tmp = self.get_scratch();
        self.asm
            .movabs_literal(*tmp, AddressLiteral::runtime_call(target));
        self.asm.jmp_r(*tmp);
    }

    /// Loads the address of the code at `pos` (an offset in this blob).
    pub fn lea_pc(&mut self, dest: Register, pos: u32) {
        self.asm.lea(dest, Address::rip(0));
        let end = self.asm.position();
        let disp = pos as i64 - end as i64;

        self.asm.set_position(end - 4);
        self.asm.emit_u32(disp as i32 as u32);
        self.asm.set_position_end();
    }

    pub fn load_external(&mut self, dest: Register, target: u64) {
        self.asm.movabs_literal(dest, AddressLiteral::external(target));
    }

    /// Publishes the frame anchor the runtime walks from. `rsp` is used when
    /// no stack pointer register is given; the pc is optional since the
    /// runtime can read it from just below the stack pointer.
    pub fn set_last_java_frame(
        &mut self,
        last_java_sp: Option<Register>,
        last_java_fp: Option<Register>,
        last_java_pc: Option<u32>,
    ) {
        let last_java_sp = last_java_sp.unwrap_or(RSP);

        if let Some(fp) = last_java_fp {
            self.asm.movq_ar(
                Address::offset(REG_THREAD, JavaThread::last_java_fp_offset()),
                fp,
            );
        }

        if let Some(pc) = last_java_pc {
            let tmp = self.get_scratch();
            self.lea_pc(*tmp, pc);
            self.asm.movq_ar(
                Address::offset(REG_THREAD, JavaThread::last_java_pc_offset()),
                *tmp,
            );
        }

        self.asm.movq_ar(
            Address::offset(REG_THREAD, JavaThread::last_java_sp_offset()),
            last_java_sp,
        );
    }

    pub fn reset_last_java_frame(&mut self, clear_fp: bool) {
        self.asm.movq_ai(
            Address::offset(REG_THREAD, JavaThread::last_java_sp_offset()),
            Immediate(0),
        );

        if clear_fp {
            self.asm.movq_ai(
                Address::offset(REG_THREAD, JavaThread::last_java_fp_offset()),
                Immediate(0),
            );
        }

        self.asm.movq_ai(
            Address::offset(REG_THREAD, JavaThread::last_java_pc_offset()),
            Immediate(0),
        );
    }

    /// Touches the stack `offset` bytes below `rsp`. Always 7 bytes long.
    pub fn bang_stack_with_offset(&mut self, offset: i32) {
        assert!(offset > 0, "must bang with positive offset");
        self.asm
            .movl_ar(Address::offset(RSP, -offset).with_disp32(), RAX);
    }

    /// Touches every page of a `size`-byte area below `rsp` plus the shadow
    /// pages. Clobbers `size` and `tmp`.
    pub fn bang_stack_size(&mut self, size: Register, tmp: Register) {
        let page_size = self.config().flags.page_size as i32;
        let shadow_pages = self.config().flags.stack_shadow_pages as i32;

        self.asm.movq_rr(tmp, RSP);
        let lbl_loop = self.asm.create_and_bind_label();
        self.asm.movl_ar(Address::offset(tmp, -page_size), size);
        self.asm.subq_ri(tmp, Immediate(page_size as i64));
        self.asm.subl_ri(size, Immediate(page_size as i64));
        self.asm.jcc(Condition::Greater, lbl_loop);

        for i in 0..shadow_pages - 1 {
            self.asm
                .movq_ar(Address::offset(tmp, -i * page_size), size);
        }
    }

    /// A single 5-byte instruction that can be patched atomically.
    pub fn fat_nop(&mut self) {
        self.asm.nop_n(5);
    }

    pub fn membar(&mut self) {
        self.asm.mfence();
    }

    /// Writes to this thread's word in the serialize page. The VM protects
    /// the page to force the store to become visible before it reads
    /// thread states.
    pub fn serialize_memory(&mut self, thread: Register, tmp: Register) {
        let page_size = self.config().flags.page_size as i64;
        let page = self.config().globals.serialize_page;

        self.asm.movl_rr(tmp, thread);
        self.asm
            .shrl_ri(tmp, Immediate(SERIALIZE_PAGE_SHIFT_COUNT));
        self.asm.andl_ri(tmp, Immediate(page_size - 4));

        let base = self.get_scratch();
        assert!(*base != tmp);
        self.load_external(*base, page);
        self.asm.movl_ar(
            Address::array(*base, tmp, ScaleFactor::One, 0),
            tmp,
        );
    }

    /// Makes a preceding thread state store visible to a VM thread that
    /// starts a safepoint. Nothing to do on a uniprocessor.
    pub fn thread_state_barrier(&mut self, tmp: Register) {
        let flags = &self.config().flags;

        if !flags.is_mp {
            return;
        }

        if flags.use_membar {
            self.membar();
        } else {
            self.serialize_memory(REG_THREAD, tmp);
        }
    }

    /// Branches to `lbl_slow` when a safepoint is in progress or this
    /// thread has a pending suspend request.
    pub fn safepoint_poll(&mut self, lbl_slow: Label) {
        let state = self.config().globals.safepoint_state;

        let tmp = self.get_scratch();
        self.load_external(*tmp, state);
        self.asm.cmpl_ai(
            Address::reg(*tmp),
            Immediate(crate::config::SAFEPOINT_NOT_SYNCHRONIZED as i64),
        );
        self.asm.jcc(Condition::NotEqual, lbl_slow);

        self.asm.cmpl_ai(
            Address::offset(REG_THREAD, JavaThread::suspend_flags_offset()),
            Immediate(0),
        );
        self.asm.jcc(Condition::NotEqual, lbl_slow);
    }

    pub fn restore_cpu_control_state_after_jni(&mut self) {
        if !self.config().flags.restore_mxcsr_on_jni_calls {
            return;
        }

        let mxcsr = self.config().globals.mxcsr_std;
        let tmp = self.get_scratch();
        self.load_external(*tmp, mxcsr);
        self.asm.ldmxcsr_a(Address::reg(*tmp));
    }

    /// `x = (x & 0xff) != 0`, for C booleans that only define the low
    /// byte.
    pub fn c2bool(&mut self, x: Register) {
        self.asm.andl_ri(x, Immediate(0xFF));
        self.asm.setcc_r(Condition::NotZero, x);
    }

    pub fn load_klass(&mut self, dest: Register, obj: Register) {
        self.asm
            .movq_ra(dest, Address::offset(obj, ObjectHeader::klass_offset()));
    }

    pub fn load_prototype_header(&mut self, dest: Register, obj: Register) {
        self.load_klass(dest, obj);
        self.asm.movq_ra(
            dest,
            Address::offset(dest, Klass::prototype_header_offset()),
        );
    }

    pub fn pusha(&mut self) {
        self.asm.subq_ri(RSP, Immediate(16 * WORD_SIZE as i64));

        for (idx, &reg) in PUSHA_ORDER.iter().enumerate() {
            self.asm
                .movq_ar(Address::offset(RSP, idx as i32 * WORD_SIZE), reg);
        }
    }

    pub fn popa(&mut self) {
        for (idx, &reg) in PUSHA_ORDER.iter().enumerate() {
            if reg == RSP {
                continue;
            }

            self.asm
                .movq_ra(reg, Address::offset(RSP, idx as i32 * WORD_SIZE));
        }

        self.asm.addq_ri(RSP, Immediate(16 * WORD_SIZE as i64));
    }

    /// Flags, an alignment word, all GPRs and the `fxsave` image; 16-byte
    /// aligned `rsp` in, 16-byte aligned `rsp` out.
    pub fn push_cpu_state(&mut self) {
        self.asm.pushfq();
        self.asm.subq_ri(RSP, Immediate(WORD_SIZE as i64));
        self.pusha();
        self.asm
            .subq_ri(RSP, Immediate(FPU_STATE_SIZE_IN_BYTES as i64));
        self.asm.fxsave64_a(Address::reg(RSP));
    }

    pub fn pop_cpu_state(&mut self) {
        self.asm.fxrstor64_a(Address::reg(RSP));
        self.asm
            .addq_ri(RSP, Immediate(FPU_STATE_SIZE_IN_BYTES as i64));
        self.popa();
        self.asm.addq_ri(RSP, Immediate(WORD_SIZE as i64));
        self.asm.popfq();
    }

    /// Fast paths of biased locking. Jumps to `done` when the object is (or
    /// becomes) biased toward the current thread, to `slow_case` when
    /// another thread won the bias, and falls through when the object is
    /// not biasable so that the caller can stack-lock it. `swap_reg` must
    /// be `rax`.
    pub fn biased_locking_enter(
        &mut self,
        lock_reg: Register,
        obj_reg: Register,
        swap_reg: Register,
        tmp_reg: Register,
        swap_reg_contains_mark: bool,
        done: Label,
        slow_case: Option<Label>,
    ) {
        assert_eq!(swap_reg, RAX, "swap_reg must be rax for cmpxchgq");
        assert!(
            lock_reg != obj_reg
                && lock_reg != swap_reg
                && lock_reg != tmp_reg
                && obj_reg != swap_reg
                && obj_reg != tmp_reg
                && swap_reg != tmp_reg,
            "registers must be different"
        );

        let mark_addr = Address::offset(obj_reg, ObjectHeader::mark_offset());
        let is_mp = self.config().flags.is_mp;
        let cas_label = self.asm.create_label();

        if !swap_reg_contains_mark {
            self.asm.movq_ra(swap_reg, mark_addr);
        }
        self.asm.movq_rr(tmp_reg, swap_reg);
        self.asm
            .andq_ri(tmp_reg, Immediate(BIASED_LOCK_MASK_IN_PLACE as i64));
        self.asm
            .cmpq_ri(tmp_reg, Immediate(BIASED_LOCK_PATTERN as i64));
        self.asm.jcc(Condition::NotEqual, cas_label);

        // biased: owner and epoch current?
        self.load_prototype_header(tmp_reg, obj_reg);
        self.asm.orq_rr(tmp_reg, REG_THREAD);
        self.asm.xorq_rr(tmp_reg, swap_reg);
        self.asm
            .andq_ri(tmp_reg, Immediate(!(AGE_MASK_IN_PLACE as i64)));
        self.asm.jcc(Condition::Equal, done);

        let try_revoke_bias = self.asm.create_label();
        let try_rebias = self.asm.create_label();

        self.asm
            .testq_ri(tmp_reg, Immediate(BIASED_LOCK_MASK_IN_PLACE as i64));
        self.asm.jcc(Condition::NotZero, try_revoke_bias);

        self.asm
            .testq_ri(tmp_reg, Immediate(EPOCH_MASK_IN_PLACE as i64));
        self.asm.jcc(Condition::NotZero, try_rebias);

        // anonymously biased: try to bias toward us
        self.asm.andq_ri(
            swap_reg,
            Immediate((BIASED_LOCK_MASK_IN_PLACE | AGE_MASK_IN_PLACE | EPOCH_MASK_IN_PLACE) as i64),
        );
        self.asm.movq_rr(tmp_reg, swap_reg);
        self.asm.orq_rr(tmp_reg, REG_THREAD);
        self.cmpxchgq(tmp_reg, mark_addr, is_mp);
        if let Some(slow_case) = slow_case {
            self.asm.jcc(Condition::NotZero, slow_case);
        }
        self.asm.jmp(done);

        // epoch expired: bias may be transferred directly
        self.asm.bind_label(try_rebias);
        self.load_prototype_header(tmp_reg, obj_reg);
        self.asm.orq_rr(tmp_reg, REG_THREAD);
        self.cmpxchgq(tmp_reg, mark_addr, is_mp);
        if let Some(slow_case) = slow_case {
            self.asm.jcc(Condition::NotZero, slow_case);
        }
        self.asm.jmp(done);

        // klass no longer biasable: reset the mark to the prototype and
        // stack-lock regardless of who wins this race
        self.asm.bind_label(try_revoke_bias);
        self.load_prototype_header(tmp_reg, obj_reg);
        self.cmpxchgq(tmp_reg, mark_addr, is_mp);

        self.asm.bind_label(cas_label);
    }

    /// Unlocking a biased object is a no-op.
    pub fn biased_locking_exit(&mut self, obj_reg: Register, tmp_reg: Register, done: Label) {
        self.asm.movq_ra(
            tmp_reg,
            Address::offset(obj_reg, ObjectHeader::mark_offset()),
        );
        self.asm
            .andq_ri(tmp_reg, Immediate(BIASED_LOCK_MASK_IN_PLACE as i64));
        self.asm
            .cmpq_ri(tmp_reg, Immediate(BIASED_LOCK_PATTERN as i64));
        self.asm.jcc(Condition::Equal, done);
    }

    pub fn cmpxchgq(&mut self, src: Register, dest: Address, is_mp: bool) {
        if is_mp {
            self.asm.lock_cmpxchgq_ar(dest, src);
        } else {
            self.asm.cmpxchgq_ar(dest, src);
        }
    }

    /// Moves a native call's first two integer arguments into place.
    pub fn pass_arguments(&mut self, arg0: Register, arg1: Option<Register>) {
        if let Some(arg1) = arg1 {
            assert!(arg1 != RDI, "second argument would be clobbered");
            if arg1 != RSI {
                self.asm.movq_rr(RSI, arg1);
            }
        }

        if arg0 != RDI {
            self.asm.movq_rr(RDI, arg0);
        }
    }

    /// `rsp` 16-byte aligned around a call, with the old value kept in the
    /// callee-saved `r12`.
    pub fn call_runtime_aligned(&mut self, target: u64) {
        self.asm.movq_rr(R12, RSP);
        self.asm.andq_ri(RSP, Immediate(-16));
        self.call_runtime(target);
        self.asm.movq_rr(RSP, R12);
    }
}
