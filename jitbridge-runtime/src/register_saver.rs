//! Full register save area used by the blobs that call into the runtime
//! from an arbitrary point in compiled code.
//!
//! Layout from `rsp` upwards after `save_live_registers`:
//!
//! ```text
//!   additional words (optional, rounded to 16 bytes)
//!   fxsave image           512 bytes, st_i at 32 + 16 * i, xmm_i at 160 + 16 * i
//!   general registers      16 words, pusha order
//!   alignment filler
//!   rflags
//!   saved rbp              <- rbp
//!   return address
//! ```

use jitbridge_asm::x64::{
    Address, FloatRegister, Immediate, RAX, RBP, RBX, RDX, RSP, Register, XMM0, XmmRegister,
};

use crate::masm::MacroAssembler;
use crate::masm::x64::{FPU_STATE_SIZE_IN_BYTES, PUSHA_ORDER};
use crate::oopmap::OopMap;
use crate::vmreg::VMReg;
use crate::{STACK_ALIGNMENT, STACK_SLOT_SIZE, WORD_SIZE, round_up};

const FPR_SAVE_COUNT: u8 = 8;
const FXSAVE_FPR_OFFSET: i32 = 32;
const FPR_SAVE_SIZE: i32 = 16;
const XMM_SAVE_COUNT: u8 = 16;
const FXSAVE_XMM_OFFSET: i32 = 160;
const XMM_SAVE_SIZE: i32 = 16;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SaveSlot {
    Fpr(u8),
    Xmm(u8),
    Gpr(Register),
    AlignFiller,
    Flags,
    Rbp,
    Return,
}

impl SaveSlot {
    /// Every slot of the save area, lowest address first.
    pub fn all() -> Vec<SaveSlot> {
        let mut slots = Vec::new();
        slots.extend((0..FPR_SAVE_COUNT).map(SaveSlot::Fpr));
        slots.extend((0..XMM_SAVE_COUNT).map(SaveSlot::Xmm));
        slots.extend(PUSHA_ORDER.iter().map(|&reg| SaveSlot::Gpr(reg)));
        slots.push(SaveSlot::AlignFiller);
        slots.push(SaveSlot::Flags);
        slots.push(SaveSlot::Rbp);
        slots.push(SaveSlot::Return);
        slots
    }

    /// Byte offset from `rsp` of a save area without additional words.
    pub fn offset(self) -> i32 {
        let gpr_base = FPU_STATE_SIZE_IN_BYTES;
        let gpr_end = gpr_base + PUSHA_ORDER.len() as i32 * WORD_SIZE;

        match self {
            SaveSlot::Fpr(idx) => {
                assert!(idx < FPR_SAVE_COUNT);
                FXSAVE_FPR_OFFSET + idx as i32 * FPR_SAVE_SIZE
            }
            SaveSlot::Xmm(idx) => {
                assert!(idx < XMM_SAVE_COUNT);
                FXSAVE_XMM_OFFSET + idx as i32 * XMM_SAVE_SIZE
            }
            SaveSlot::Gpr(reg) => {
                let idx = PUSHA_ORDER
                    .iter()
                    .position(|&r| r == reg)
                    .unwrap_or_else(|| panic!("{:?} not saved", reg));
                gpr_base + idx as i32 * WORD_SIZE
            }
            SaveSlot::AlignFiller => gpr_end,
            SaveSlot::Flags => gpr_end + WORD_SIZE,
            SaveSlot::Rbp => gpr_end + 2 * WORD_SIZE,
            SaveSlot::Return => gpr_end + 3 * WORD_SIZE,
        }
    }

    /// The machine register whose value the slot holds, if the frame walker
    /// needs to know about it. `rsp` and `rbp` are found through the frame
    /// itself.
    fn saved_location(self) -> Option<VMReg> {
        match self {
            SaveSlot::Fpr(idx) => Some(VMReg::from_float_register(FloatRegister::new(idx))),
            SaveSlot::Xmm(idx) => Some(VMReg::from_xmm(XmmRegister::new(idx))),
            SaveSlot::Gpr(reg) if reg != RSP && reg != RBP => Some(VMReg::from_register(reg)),
            _ => None,
        }
    }
}

pub struct RegisterSaver;

impl RegisterSaver {
    /// Bytes between `rsp` and the return address.
    pub fn return_offset_in_bytes() -> i32 {
        SaveSlot::Return.offset()
    }

    pub fn rax_offset_in_bytes() -> i32 {
        SaveSlot::Gpr(RAX).offset()
    }

    pub fn rdx_offset_in_bytes() -> i32 {
        SaveSlot::Gpr(RDX).offset()
    }

    pub fn rbx_offset_in_bytes() -> i32 {
        SaveSlot::Gpr(RBX).offset()
    }

    pub fn xmm0_offset_in_bytes() -> i32 {
        SaveSlot::Xmm(0).offset()
    }

    fn additional_bytes(additional_frame_words: i32) -> i32 {
        round_up(additional_frame_words * WORD_SIZE, STACK_ALIGNMENT)
    }

    /// Total frame size in bytes, return address included.
    pub fn frame_size_in_bytes(additional_frame_words: i32) -> i32 {
        RegisterSaver::additional_bytes(additional_frame_words)
            + RegisterSaver::return_offset_in_bytes()
            + WORD_SIZE
    }

    /// Saves every register and returns the OopMap describing the area plus
    /// the frame size in words. Entered with `rsp` as at a call target.
    pub fn save_live_registers(
        masm: &mut MacroAssembler,
        additional_frame_words: i32,
    ) -> (OopMap, i32) {
        assert!(additional_frame_words >= 0);
        let additional_bytes = RegisterSaver::additional_bytes(additional_frame_words);
        let frame_size_in_bytes = RegisterSaver::frame_size_in_bytes(additional_frame_words);

        masm.enter();
        masm.push_cpu_state();

        if additional_bytes > 0 {
            masm.subq_ri(RSP, Immediate(additional_bytes as i64));
        }

        let frame_size_in_slots = frame_size_in_bytes / STACK_SLOT_SIZE;
        let mut map = OopMap::new(frame_size_in_slots, 0);

        for slot in SaveSlot::all() {
            if let Some(reg) = slot.saved_location() {
                let stack_slot = (slot.offset() + additional_bytes) / STACK_SLOT_SIZE;
                map.set_callee_saved(VMReg::stack(stack_slot), reg);
                map.set_callee_saved(VMReg::stack(stack_slot + 1), reg.next());
            }
        }

        (map, frame_size_in_bytes / WORD_SIZE)
    }

    /// Inverse of `save_live_registers`; leaves `rsp` at the return
    /// address.
    pub fn restore_live_registers(masm: &mut MacroAssembler, additional_frame_words: i32) {
        let additional_bytes = RegisterSaver::additional_bytes(additional_frame_words);

        if additional_bytes > 0 {
            masm.addq_ri(RSP, Immediate(additional_bytes as i64));
        }

        masm.pop_cpu_state();
        masm.popq_r(RBP);
    }

    /// Restores only the result registers and pops the whole save area,
    /// saved `rbp` included. The caller must rebuild `rbp` itself.
    pub fn restore_result_registers(masm: &mut MacroAssembler) {
        masm.movsd_ra(
            XMM0,
            Address::offset(RSP, RegisterSaver::xmm0_offset_in_bytes()),
        );
        masm.movq_ra(RAX, Address::offset(RSP, RegisterSaver::rax_offset_in_bytes()));
        masm.movq_ra(RDX, Address::offset(RSP, RegisterSaver::rdx_offset_in_bytes()));

        masm.addq_ri(
            RSP,
            Immediate(RegisterSaver::return_offset_in_bytes() as i64),
        );
    }
}
