//! Inline fast paths of object locking. The helpers emit the fast path and
//! hand back the label pair of the out-of-line slow path; the caller emits
//! the runtime call at `entry` and jumps back to `resume`.

use jitbridge_asm::x64::{Address, Condition, Immediate, RAX, RSP, Register, ScaleFactor};

use crate::masm::{Label, MacroAssembler};
use crate::oops::{BasicLock, ObjectHeader, UNLOCKED_VALUE};

#[derive(Copy, Clone, Debug)]
pub struct SlowPath {
    pub entry: Label,
    pub resume: Label,
}

/// Locks the object in `obj_reg` using the `BasicLock` at `lock_reg`.
/// Clobbers `rax` and `tmp_reg`; the object is locked at `resume`.
pub fn lock_object(
    masm: &mut MacroAssembler,
    obj_reg: Register,
    lock_reg: Register,
    tmp_reg: Register,
) -> SlowPath {
    let slow = masm.create_label();
    let done = masm.create_label();
    let flags = masm.config().flags.clone();

    if flags.use_heavy_monitors {
        masm.jmp(slow);
        masm.bind_label(done);
        return SlowPath {
            entry: slow,
            resume: done,
        };
    }

    if flags.use_biased_locking {
        masm.biased_locking_enter(lock_reg, obj_reg, RAX, tmp_reg, false, done, Some(slow));
    }

    let mark = Address::offset(obj_reg, ObjectHeader::mark_offset());
    let displaced = Address::offset(lock_reg, BasicLock::displaced_header_offset());

    // displaced header is the unlocked mark
    masm.movl_ri(RAX, Immediate(UNLOCKED_VALUE as i64));
    masm.orq_ra(RAX, mark);
    masm.movq_ar(displaced, RAX);
    masm.cmpxchgq(lock_reg, mark, flags.is_mp);
    masm.jcc(Condition::Equal, done);

    // Recursive stack lock: the mark points into our own stack within a
    // page of rsp. Store zero as displaced header in that case.
    masm.subq_rr(RAX, RSP);
    masm.andq_ri(RAX, Immediate(3 - flags.page_size as i64));
    masm.movq_ar(displaced, RAX);
    masm.jcc(Condition::NotEqual, slow);

    masm.bind_label(done);

    SlowPath {
        entry: slow,
        resume: done,
    }
}

/// First half of unlocking: objects that are biased or were locked
/// recursively need no work, jump to `done` for them. `lock_box` is the
/// `BasicLock` used for locking.
pub fn unlock_object_prologue(
    masm: &mut MacroAssembler,
    obj_reg: Register,
    lock_box: Address,
    tmp_reg: Register,
    done: Label,
) {
    let flags = &masm.config().flags;

    if flags.use_heavy_monitors {
        return;
    }

    if flags.use_biased_locking {
        masm.biased_locking_exit(obj_reg, tmp_reg, done);
    }

    masm.cmpq_ai(
        lock_box.plus_disp(BasicLock::displaced_header_offset(), ScaleFactor::One),
        Immediate(0),
    );
    masm.jcc(Condition::Equal, done);
}

/// Puts the displaced header back into the object. The returned `resume`
/// is bound directly behind the fast path. Clobbers `rax` and `old_hdr`.
pub fn unlock_object(
    masm: &mut MacroAssembler,
    obj_reg: Register,
    lock_box: Address,
    old_hdr: Register,
) -> SlowPath {
    let slow = masm.create_label();
    let resume = masm.create_label();
    let is_mp = masm.config().flags.is_mp;

    if masm.config().flags.use_heavy_monitors {
        masm.jmp(slow);
    } else {
        masm.lea(RAX, lock_box);
        masm.movq_ra(
            old_hdr,
            Address::offset(RAX, BasicLock::displaced_header_offset()),
        );
        masm.cmpxchgq(
            old_hdr,
            Address::offset(obj_reg, ObjectHeader::mark_offset()),
            is_mp,
        );
        masm.jcc(Condition::NotEqual, slow);
    }

    masm.bind_label(resume);

    SlowPath {
        entry: slow,
        resume,
    }
}
