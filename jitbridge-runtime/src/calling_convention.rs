//! Argument location tables for compiled Java code and for native calls.
//!
//! Both functions fill a caller-provided `regs` slice (one entry per
//! signature element) and return the number of 4-byte stack slots used.

use jitbridge_asm::x64::{RCX, RDX, XMM0, XMM1};

use crate::basic_type::BasicType;
use crate::vmreg::{VMReg, VMRegPair};

const INT_ARG_REGS: usize = 2;
const FP_ARG_REGS: usize = 2;

fn is_int_arg(ty: BasicType) -> bool {
    ty.is_int_like() || is_pointer_arg(ty)
}

fn is_pointer_arg(ty: BasicType) -> bool {
    matches!(
        ty,
        BasicType::Object | BasicType::Array | BasicType::Address
    )
}

fn assert_half(sig: &[BasicType], idx: usize) {
    assert!(
        sig.get(idx + 1) == Some(&BasicType::Void),
        "missing half after {:?}",
        sig[idx]
    );
}

/// Locations for compiled Java code.
///
/// The first two integer or pointer arguments go to `rcx`/`rdx`, the first
/// two floating point arguments to `xmm0`/`xmm1` with doubles claiming the
/// registers before floats. Longs and every other 64-bit value without a
/// register are placed from slot 0 upwards, two slots each; single-slot
/// values follow after all of them, so 64-bit stack values stay 8-byte
/// aligned. `use_sse` 0 passes no floating point value in registers, 1
/// only floats.
pub fn java_calling_convention(
    sig: &[BasicType],
    regs: &mut [VMRegPair],
    _is_outgoing: bool,
    use_sse: u32,
) -> i32 {
    assert!(regs.len() >= sig.len());

    let fp_regs = [XMM0, XMM1];
    let int_regs = [RCX, RDX];

    let floats_in_regs = use_sse >= 1;
    let doubles_in_regs = use_sse >= 2;

    // First pass: doubles pick their registers and every 64-bit value that
    // ends up on the stack is counted.
    let mut double_regs: [Option<usize>; FP_ARG_REGS] = [None; FP_ARG_REGS];
    let mut double_reg_count = 0;
    let mut int_reg_count = 0;
    let mut stack = 0;

    for (idx, &ty) in sig.iter().enumerate() {
        match ty {
            BasicType::Double => {
                if doubles_in_regs && double_reg_count < FP_ARG_REGS {
                    double_regs[double_reg_count] = Some(idx);
                    double_reg_count += 1;
                } else {
                    stack += 2;
                }
            }

            BasicType::Long => stack += 2,

            ty if is_int_arg(ty) => {
                if int_reg_count < INT_ARG_REGS {
                    int_reg_count += 1;
                } else if is_pointer_arg(ty) {
                    stack += 2;
                }
            }

            _ => {}
        }
    }

    let mut dstack = 0;
    let mut int_reg_count = 0;
    let mut fp_reg_used = [false; FP_ARG_REGS];

    for (used, assigned) in fp_reg_used.iter_mut().zip(double_regs.iter()) {
        *used = assigned.is_some();
    }

    for (idx, &ty) in sig.iter().enumerate() {
        let pair = &mut regs[idx];

        match ty {
            BasicType::Boolean
            | BasicType::Char
            | BasicType::Byte
            | BasicType::Short
            | BasicType::Int => {
                if int_reg_count < INT_ARG_REGS {
                    pair.set1(VMReg::from_register(int_regs[int_reg_count]));
                    int_reg_count += 1;
                } else {
                    pair.set1(VMReg::stack(stack));
                    stack += 1;
                }
            }

            BasicType::Object | BasicType::Array | BasicType::Address => {
                if int_reg_count < INT_ARG_REGS {
                    pair.set2(VMReg::from_register(int_regs[int_reg_count]));
                    int_reg_count += 1;
                } else {
                    pair.set2(VMReg::stack(dstack));
                    dstack += 2;
                }
            }

            BasicType::Float => {
                let free = if floats_in_regs {
                    fp_reg_used.iter().position(|used| !used)
                } else {
                    None
                };

                if let Some(reg) = free {
                    fp_reg_used[reg] = true;
                    pair.set1(VMReg::from_xmm(fp_regs[reg]));
                } else {
                    pair.set1(VMReg::stack(stack));
                    stack += 1;
                }
            }

            BasicType::Long => {
                assert_half(sig, idx);
                pair.set2(VMReg::stack(dstack));
                dstack += 2;
            }

            BasicType::Double => {
                assert_half(sig, idx);

                if let Some(reg) = double_regs.iter().position(|&d| d == Some(idx)) {
                    pair.set2(VMReg::from_xmm(fp_regs[reg]));
                } else {
                    pair.set2(VMReg::stack(dstack));
                    dstack += 2;
                }
            }

            BasicType::Void => pair.set_bad(),

            _ => panic!("should not reach here: {:?} in java signature", ty),
        }
    }

    crate::round_up(stack, 2)
}

/// Locations for a native call: everything is passed on the stack in
/// argument order, 64-bit values and pointers taking two slots.
pub fn c_calling_convention(sig: &[BasicType], regs: &mut [VMRegPair]) -> i32 {
    assert!(regs.len() >= sig.len());

    let mut stack = 0;

    for (idx, &ty) in sig.iter().enumerate() {
        let pair = &mut regs[idx];

        match ty {
            BasicType::Boolean
            | BasicType::Char
            | BasicType::Byte
            | BasicType::Short
            | BasicType::Int
            | BasicType::Float => {
                pair.set1(VMReg::stack(stack));
                stack += 1;
            }

            BasicType::Long
            | BasicType::Double
            | BasicType::Object
            | BasicType::Array
            | BasicType::Address => {
                pair.set2(VMReg::stack(stack));
                stack += 2;
            }

            BasicType::Void => pair.set_bad(),

            _ => panic!("should not reach here: {:?} in native signature", ty),
        }
    }

    stack
}
