//! Calling-convention bridge between an interpreter and JIT-compiled code:
//! argument location tables, i2c/c2i adapters, native wrappers and the
//! deoptimization, uncommon-trap, safepoint and resolve blobs.

pub mod adapters;
pub mod basic_type;
pub mod calling_convention;
pub mod code;
pub mod config;
pub mod cpu;
pub mod deopt;
pub mod disassembler;
pub mod frame;
pub mod masm;
pub mod monitor;
pub mod native_wrapper;
pub mod oopmap;
pub mod oops;
pub mod register_saver;
pub mod stubs;
pub mod thread;
pub mod vmreg;

pub use crate::basic_type::BasicType;
pub use crate::config::{BridgeConfig, RuntimeEntries, RuntimeFlags, VmGlobals};
pub use crate::vmreg::{VMReg, VMRegPair};

pub const WORD_SIZE: i32 = 8;
pub const STACK_SLOT_SIZE: i32 = 4;
pub const SLOTS_PER_WORD: i32 = WORD_SIZE / STACK_SLOT_SIZE;
pub const STACK_ALIGNMENT: i32 = 16;
pub const STACK_ALIGNMENT_IN_SLOTS: i32 = STACK_ALIGNMENT / STACK_SLOT_SIZE;

pub fn round_up(value: i32, alignment: i32) -> i32 {
    debug_assert!(alignment > 0 && (alignment & (alignment - 1)) == 0);
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(0, 2), 0);
        assert_eq!(round_up(3, 2), 4);
        assert_eq!(round_up(17, 16), 32);
        assert_eq!(round_up(16, 16), 16);
    }
}
