use std::fmt;

use jitbridge_asm::x64::{FloatRegister, Register, XmmRegister};

const GPR_COUNT: i32 = 16;
const FPR_COUNT: i32 = 8;
const XMM_COUNT: i32 = 16;

const SLOTS_PER_GPR: i32 = 2;
const SLOTS_PER_FPR: i32 = 2;
const SLOTS_PER_XMM: i32 = 2;

const FIRST_GPR: i32 = 0;
const FIRST_FPR: i32 = FIRST_GPR + GPR_COUNT * SLOTS_PER_GPR;
const FIRST_XMM: i32 = FIRST_FPR + FPR_COUNT * SLOTS_PER_FPR;
const FIRST_STACK: i32 = FIRST_XMM + XMM_COUNT * SLOTS_PER_XMM;

/// A 32-bit location: one half of a machine register or one 4-byte stack
/// slot. 64-bit values occupy two consecutive locations.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VMReg(i32);

impl VMReg {
    pub const BAD: VMReg = VMReg(-1);

    pub fn from_register(reg: Register) -> VMReg {
        assert!(reg.is_valid());
        VMReg(FIRST_GPR + reg.encoding() as i32 * SLOTS_PER_GPR)
    }

    pub fn from_float_register(reg: FloatRegister) -> VMReg {
        VMReg(FIRST_FPR + reg.encoding() as i32 * SLOTS_PER_FPR)
    }

    pub fn from_xmm(reg: XmmRegister) -> VMReg {
        assert!(
            (reg.encoding() as i32) < XMM_COUNT,
            "xmm{} has no location",
            reg.encoding()
        );
        VMReg(FIRST_XMM + reg.encoding() as i32 * SLOTS_PER_XMM)
    }

    pub fn stack(slot: i32) -> VMReg {
        assert!(slot >= 0);
        VMReg(FIRST_STACK + slot)
    }

    pub fn value(self) -> i32 {
        self.0
    }

    pub fn next(self) -> VMReg {
        assert!(self.is_valid());
        VMReg(self.0 + 1)
    }

    pub fn next_n(self, n: i32) -> VMReg {
        assert!(self.is_valid());
        VMReg(self.0 + n)
    }

    pub fn is_valid(self) -> bool {
        self != VMReg::BAD
    }

    pub fn is_stack(self) -> bool {
        self.0 >= FIRST_STACK
    }

    pub fn is_register(self) -> bool {
        self.is_valid() && !self.is_stack()
    }

    pub fn is_gpr(self) -> bool {
        self.0 >= FIRST_GPR && self.0 < FIRST_FPR
    }

    pub fn is_float_register(self) -> bool {
        self.0 >= FIRST_FPR && self.0 < FIRST_XMM
    }

    pub fn is_xmm(self) -> bool {
        self.0 >= FIRST_XMM && self.0 < FIRST_STACK
    }

    /// Whether this is the first half of a register (or any stack slot).
    pub fn is_concrete(self) -> bool {
        if self.is_stack() {
            return true;
        }

        self.is_register() && (self.0 % 2) == 0
    }

    /// Stack slot index of a stack location.
    pub fn reg2stack(self) -> i32 {
        assert!(self.is_stack(), "{:?} is not a stack slot", self);
        self.0 - FIRST_STACK
    }

    pub fn as_register(self) -> Option<Register> {
        if self.is_gpr() {
            Some(Register::new(((self.0 - FIRST_GPR) / SLOTS_PER_GPR) as u8))
        } else {
            None
        }
    }

    pub fn as_float_register(self) -> Option<FloatRegister> {
        if self.is_float_register() {
            Some(FloatRegister::new(((self.0 - FIRST_FPR) / SLOTS_PER_FPR) as u8))
        } else {
            None
        }
    }

    pub fn as_xmm(self) -> Option<XmmRegister> {
        if self.is_xmm() {
            Some(XmmRegister::new(((self.0 - FIRST_XMM) / SLOTS_PER_XMM) as u8))
        } else {
            None
        }
    }
}

const GPR_NAMES: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15",
];

impl fmt::Debug for VMReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let half = if self.0 % 2 == 1 { ".H" } else { "" };

        if !self.is_valid() {
            write!(f, "BAD")
        } else if let Some(reg) = self.as_register() {
            write!(f, "{}{}", GPR_NAMES[reg.encoding() as usize], half)
        } else if let Some(reg) = self.as_float_register() {
            write!(f, "st{}{}", reg.encoding(), half)
        } else if let Some(reg) = self.as_xmm() {
            write!(f, "xmm{}{}", reg.encoding(), half)
        } else {
            write!(f, "[{}]", self.reg2stack() * crate::STACK_SLOT_SIZE)
        }
    }
}

/// Location of one argument: a single 32-bit location, or two for 64-bit
/// values (`second` is the upper half).
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct VMRegPair {
    first: VMReg,
    second: VMReg,
}

impl VMRegPair {
    pub fn new() -> VMRegPair {
        VMRegPair {
            first: VMReg::BAD,
            second: VMReg::BAD,
        }
    }

    pub fn first(&self) -> VMReg {
        self.first
    }

    pub fn second(&self) -> VMReg {
        self.second
    }

    pub fn set1(&mut self, first: VMReg) {
        self.first = first;
        self.second = VMReg::BAD;
    }

    /// Claims `first` and the location right after it.
    pub fn set2(&mut self, first: VMReg) {
        self.first = first;
        self.second = first.next();
    }

    pub fn set_pair(&mut self, second: VMReg, first: VMReg) {
        self.first = first;
        self.second = second;
    }

    pub fn set_bad(&mut self) {
        self.first = VMReg::BAD;
        self.second = VMReg::BAD;
    }

    pub fn is_bad(&self) -> bool {
        !self.first.is_valid()
    }

    pub fn is_single(&self) -> bool {
        self.first.is_valid() && !self.second.is_valid()
    }

    pub fn is_adjacent_aligned_pair(&self) -> bool {
        self.second.is_valid() && self.second == self.first.next() && self.first.value() % 2 == 0
    }
}

impl Default for VMRegPair {
    fn default() -> VMRegPair {
        VMRegPair::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jitbridge_asm::x64::{RAX, RDX, R15, XMM0, XMM15};

    #[test]
    fn test_numbering() {
        assert_eq!(VMReg::from_register(RAX).value(), 0);
        assert_eq!(VMReg::from_register(RDX).value(), 4);
        assert_eq!(VMReg::from_register(R15).next().value(), 31);
        assert_eq!(VMReg::from_xmm(XMM0).value(), 48);
        assert_eq!(VMReg::from_xmm(XMM15).next().value(), 79);
        assert_eq!(VMReg::stack(0).value(), 80);
    }

    #[test]
    fn test_checked_conversions() {
        let rdx = VMReg::from_register(RDX);
        assert_eq!(rdx.as_register(), Some(RDX));
        assert_eq!(rdx.next().as_register(), Some(RDX));
        assert_eq!(rdx.as_xmm(), None);

        let xmm = VMReg::from_xmm(XMM15);
        assert_eq!(xmm.as_xmm(), Some(XMM15));
        assert_eq!(xmm.as_register(), None);

        let slot = VMReg::stack(7);
        assert!(slot.is_stack());
        assert_eq!(slot.reg2stack(), 7);
        assert_eq!(slot.as_register(), None);
        assert_eq!(VMReg::BAD.as_register(), None);
    }

    #[test]
    fn test_pair() {
        let mut pair = VMRegPair::new();
        assert!(pair.is_bad());

        pair.set2(VMReg::stack(2));
        assert_eq!(pair.second(), VMReg::stack(3));
        assert!(pair.is_adjacent_aligned_pair());

        pair.set1(VMReg::from_register(RAX));
        assert!(pair.is_single());

        pair.set_bad();
        assert!(pair.is_bad());
    }

    #[test]
    fn test_debug_names() {
        assert_eq!(format!("{:?}", VMReg::from_register(RDX).next()), "rdx.H");
        assert_eq!(format!("{:?}", VMReg::stack(3)), "[12]");
        assert_eq!(format!("{:?}", VMReg::BAD), "BAD");
    }

    #[test]
    #[should_panic(expected = "is not a stack slot")]
    fn test_reg2stack_on_register() {
        VMReg::from_register(RAX).reg2stack();
    }
}
