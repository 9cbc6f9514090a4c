use crate::RelocKind;
use crate::x64::{NOREG, RBP, RSP, Register};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ScaleFactor {
    NoScale,
    One,
    Two,
    Four,
    Eight,
}

impl ScaleFactor {
    pub fn from_bytes(bytes: u32) -> ScaleFactor {
        match bytes {
            1 => ScaleFactor::One,
            2 => ScaleFactor::Two,
            4 => ScaleFactor::Four,
            8 => ScaleFactor::Eight,
            _ => panic!("illegal scale factor {}", bytes),
        }
    }

    pub(crate) fn value(self) -> u8 {
        match self {
            ScaleFactor::NoScale | ScaleFactor::One => 0,
            ScaleFactor::Two => 1,
            ScaleFactor::Four => 2,
            ScaleFactor::Eight => 3,
        }
    }

    pub fn log2(self) -> u32 {
        self.value() as u32
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum RegisterOrConstant {
    Register(Register),
    Constant(i32),
}

impl From<Register> for RegisterOrConstant {
    fn from(reg: Register) -> RegisterOrConstant {
        RegisterOrConstant::Register(reg)
    }
}

impl From<i32> for RegisterOrConstant {
    fn from(value: i32) -> RegisterOrConstant {
        RegisterOrConstant::Constant(value)
    }
}

/// A memory operand. The ModRM/SIB/displacement bytes are chosen when the
/// operand is emitted, so the same value can be used by legacy, VEX and
/// EVEX encodings.
#[derive(Copy, Clone, Debug)]
pub struct Address {
    base: Register,
    index: Register,
    scale: ScaleFactor,
    disp: i32,
    rip_relative: bool,
    force_disp32: bool,
    reloc: RelocKind,
}

impl Address {
    pub fn new(
        base: Option<Register>,
        index: Option<Register>,
        scale: ScaleFactor,
        disp: i32,
    ) -> Address {
        let index = index.unwrap_or(NOREG);
        assert_eq!(
            index.is_valid(),
            scale != ScaleFactor::NoScale,
            "index and scale must be given together"
        );
        assert_ne!(index, RSP, "rsp cannot be an index register");

        Address {
            base: base.unwrap_or(NOREG),
            index,
            scale,
            disp,
            rip_relative: false,
            force_disp32: false,
            reloc: RelocKind::None,
        }
    }

    pub fn reg(base: Register) -> Address {
        Address::offset(base, 0)
    }

    pub fn offset(base: Register, disp: i32) -> Address {
        Address::new(Some(base), None, ScaleFactor::NoScale, disp)
    }

    pub fn array(base: Register, index: Register, scale: ScaleFactor, disp: i32) -> Address {
        assert_ne!(scale, ScaleFactor::NoScale);
        Address::new(Some(base), Some(index), scale, disp)
    }

    pub fn index(index: Register, scale: ScaleFactor, disp: i32) -> Address {
        assert_ne!(scale, ScaleFactor::NoScale);
        Address::new(None, Some(index), scale, disp)
    }

    /// `[disp32]`, encoded through a SIB byte without base and index.
    pub fn absolute(disp: i32) -> Address {
        Address::new(None, None, ScaleFactor::NoScale, disp)
    }

    pub fn rip(disp: i32) -> Address {
        let mut address = Address::absolute(disp);
        address.rip_relative = true;
        address
    }

    pub fn with_reloc(mut self, reloc: RelocKind) -> Address {
        self.reloc = reloc;
        self
    }

    /// Always encode the displacement in 32 bits, for instructions that
    /// must have a fixed length.
    pub fn with_disp32(mut self) -> Address {
        self.force_disp32 = true;
        self
    }

    /// Returns a new address whose displacement grows by `offset`; a register
    /// offset becomes the index.
    pub fn plus_disp(&self, offset: impl Into<RegisterOrConstant>, scale: ScaleFactor) -> Address {
        let mut address = *self;
        match offset.into() {
            RegisterOrConstant::Constant(value) => {
                address.disp = value
                    .checked_mul(1 << scale.log2())
                    .and_then(|scaled| address.disp.checked_add(scaled))
                    .unwrap_or_else(|| {
                        panic!("displacement {} + {} overflows", address.disp, value)
                    });
            }

            RegisterOrConstant::Register(reg) => {
                assert!(!address.index.is_valid(), "competing indexes");
                assert!(!address.rip_relative);
                assert_ne!(scale, ScaleFactor::NoScale);
                assert_ne!(reg, RSP, "rsp cannot be an index register");
                address.index = reg;
                address.scale = scale;
            }
        }
        address
    }

    pub fn base(&self) -> Option<Register> {
        if self.base.is_valid() {
            Some(self.base)
        } else {
            None
        }
    }

    pub fn index_reg(&self) -> Option<Register> {
        if self.index.is_valid() {
            Some(self.index)
        } else {
            None
        }
    }

    pub fn scale(&self) -> ScaleFactor {
        self.scale
    }

    pub fn disp(&self) -> i32 {
        self.disp
    }

    pub fn reloc(&self) -> RelocKind {
        self.reloc
    }

    pub fn is_rip_relative(&self) -> bool {
        self.rip_relative
    }

    pub fn uses(&self, reg: Register) -> bool {
        self.base == reg || self.index == reg
    }

    pub(crate) fn rex_x(&self) -> bool {
        self.index.is_valid() && self.index.needs_rex()
    }

    pub(crate) fn rex_b(&self) -> bool {
        self.base.is_valid() && self.base.needs_rex()
    }

    pub(crate) fn has_reloc(&self) -> bool {
        self.reloc != RelocKind::None
    }

    /// Encodes ModRM (with `reg_or_opcode` in the reg field), SIB and the
    /// displacement. A displacement is stored in 8 bits when it is a multiple
    /// of `disp8_scale` and the scaled value fits; EVEX passes its
    /// compression factor here, everything else passes 1.
    pub(crate) fn encode(&self, reg_or_opcode: u8, disp8_scale: i32) -> EncodedAddress {
        let reg = reg_or_opcode & 0b111;
        let mut enc = EncodedAddress::new();

        if self.rip_relative {
            enc.push(modrm(0b00, reg, 0b101));
            enc.push_disp32(self.disp);
            return enc;
        }

        if !self.base.is_valid() {
            enc.push(modrm(0b00, reg, 0b100));
            if self.index.is_valid() {
                enc.push(sib(self.scale.value(), self.index.low_bits(), 0b101));
            } else {
                enc.push(sib(0, 0b100, 0b101));
            }
            enc.push_disp32(self.disp);
            return enc;
        }

        let compressed = if disp8_scale > 1 && self.disp % disp8_scale == 0 {
            self.disp / disp8_scale
        } else if disp8_scale > 1 {
            i32::MAX
        } else {
            self.disp
        };

        let mode = if self.has_reloc() || self.force_disp32 {
            0b10
        } else if self.disp == 0 && self.base.low_bits() != RBP.low_bits() {
            0b00
        } else if (-128..128).contains(&compressed) {
            0b01
        } else {
            0b10
        };

        if self.index.is_valid() {
            enc.push(modrm(mode, reg, 0b100));
            enc.push(sib(
                self.scale.value(),
                self.index.low_bits(),
                self.base.low_bits(),
            ));
        } else if self.base.low_bits() == RSP.low_bits() {
            enc.push(modrm(mode, reg, 0b100));
            enc.push(sib(0, 0b100, self.base.low_bits()));
        } else {
            enc.push(modrm(mode, reg, self.base.low_bits()));
        }

        match mode {
            0b00 => {}
            0b01 => enc.push(compressed as i8 as u8),
            _ => enc.push_disp32(self.disp),
        }

        enc
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Address) -> bool {
        self.base == other.base
            && self.index == other.index
            && self.scale == other.scale
            && self.disp == other.disp
            && self.rip_relative == other.rip_relative
    }
}

impl Eq for Address {}

fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
    mode << 6 | reg << 3 | rm
}

fn sib(scale: u8, index: u8, base: u8) -> u8 {
    scale << 6 | index << 3 | base
}

pub(crate) struct EncodedAddress {
    bytes: [u8; 6],
    length: u8,
    disp32_at: Option<u8>,
}

impl EncodedAddress {
    fn new() -> EncodedAddress {
        EncodedAddress {
            bytes: [0; 6],
            length: 0,
            disp32_at: None,
        }
    }

    fn push(&mut self, byte: u8) {
        self.bytes[self.length as usize] = byte;
        self.length += 1;
    }

    fn push_disp32(&mut self, disp: i32) {
        self.disp32_at = Some(self.length);
        for byte in disp.to_le_bytes() {
            self.push(byte);
        }
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.bytes[..self.length as usize]
    }

    /// Offset of the 32-bit displacement inside `bytes`, if there is one.
    pub(crate) fn disp32_offset(&self) -> Option<usize> {
        self.disp32_at.map(|at| at as usize)
    }
}

/// An absolute target with the relocation it needs when materialized.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct AddressLiteral {
    target: u64,
    reloc: RelocKind,
    is_lval: bool,
}

impl AddressLiteral {
    pub fn new(target: u64, reloc: RelocKind) -> AddressLiteral {
        AddressLiteral {
            target,
            reloc,
            is_lval: false,
        }
    }

    pub fn runtime_call(target: u64) -> AddressLiteral {
        AddressLiteral::new(target, RelocKind::RuntimeCall)
    }

    pub fn external(target: u64) -> AddressLiteral {
        AddressLiteral::new(target, RelocKind::External)
    }

    /// Marks the literal as the address itself rather than the memory it
    /// points to.
    pub fn addr(mut self) -> AddressLiteral {
        self.is_lval = true;
        self
    }

    pub fn target(&self) -> u64 {
        self.target
    }

    pub fn reloc(&self) -> RelocKind {
        self.reloc
    }

    pub fn is_lval(&self) -> bool {
        self.is_lval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x64::{R12, R13, RAX, RBX, RCX};

    #[test]
    fn test_same_address_ignores_reloc() {
        let plain = Address::offset(RBX, 16);
        let relocated = Address::offset(RBX, 16).with_reloc(RelocKind::External);
        assert_eq!(plain, relocated);
        assert_ne!(plain, Address::offset(RBX, 24));
    }

    #[test]
    fn test_plus_disp() {
        let address = Address::offset(RAX, 8);
        assert_eq!(address.plus_disp(3, ScaleFactor::Eight).disp(), 32);
        assert_eq!(address.plus_disp(4, ScaleFactor::NoScale).disp(), 12);

        let indexed = address.plus_disp(RCX, ScaleFactor::Four);
        assert_eq!(indexed.index_reg(), Some(RCX));
        assert_eq!(indexed.scale(), ScaleFactor::Four);
        assert_eq!(indexed.disp(), 8);
    }

    #[test]
    #[should_panic(expected = "competing indexes")]
    fn test_plus_disp_competing_indexes() {
        let address = Address::array(RAX, RBX, ScaleFactor::Two, 0);
        address.plus_disp(RCX, ScaleFactor::One);
    }

    #[test]
    #[should_panic(expected = "index and scale must be given together")]
    fn test_index_without_scale() {
        Address::new(Some(RAX), Some(RBX), ScaleFactor::NoScale, 0);
    }

    #[test]
    #[should_panic(expected = "index and scale must be given together")]
    fn test_scale_without_index() {
        Address::new(Some(RAX), None, ScaleFactor::Four, 0);
    }

    #[test]
    fn test_encode_forms() {
        assert_eq!(Address::reg(RAX).encode(0, 1).bytes(), &[0x00]);
        assert_eq!(Address::reg(RSP).encode(0, 1).bytes(), &[0x04, 0x24]);
        assert_eq!(Address::reg(R12).encode(0, 1).bytes(), &[0x04, 0x24]);
        assert_eq!(Address::reg(R13).encode(0, 1).bytes(), &[0x45, 0x00]);
        assert_eq!(Address::offset(RBX, -8).encode(2, 1).bytes(), &[0x53, 0xF8]);
        assert_eq!(
            Address::offset(RBX, 0x100).encode(0, 1).bytes(),
            &[0x83, 0x00, 0x01, 0x00, 0x00]
        );
        assert_eq!(
            Address::absolute(0x1000).encode(0, 1).bytes(),
            &[0x04, 0x25, 0x00, 0x10, 0x00, 0x00]
        );
    }

    #[test]
    fn test_reloc_forces_disp32() {
        let enc = Address::offset(RBX, 8)
            .with_reloc(RelocKind::External)
            .encode(0, 1);
        assert_eq!(enc.bytes(), &[0x83, 0x08, 0x00, 0x00, 0x00]);
        assert_eq!(enc.disp32_offset(), Some(1));
    }

    #[test]
    fn test_forced_disp32() {
        let enc = Address::offset(RSP, -8).with_disp32().encode(0, 1);
        assert_eq!(enc.bytes(), &[0x84, 0x24, 0xf8, 0xff, 0xff, 0xff]);

        let enc = Address::reg(RAX).with_disp32().encode(0, 1);
        assert_eq!(enc.bytes(), &[0x80, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(Address::reg(RAX).with_disp32(), Address::reg(RAX));
    }

    #[test]
    #[should_panic(expected = "overflows")]
    fn test_plus_disp_overflow() {
        Address::offset(RAX, i32::MAX - 4).plus_disp(1, ScaleFactor::Eight);
    }

    #[test]
    #[should_panic(expected = "overflows")]
    fn test_plus_disp_scaled_overflow() {
        Address::offset(RAX, 0).plus_disp(i32::MAX / 2, ScaleFactor::Four);
    }

    #[test]
    fn test_compressed_disp8() {
        assert_eq!(Address::offset(RAX, 64).encode(0, 64).bytes(), &[0x40, 0x01]);
        assert_eq!(
            Address::offset(RAX, 8).encode(0, 64).bytes(),
            &[0x80, 0x08, 0x00, 0x00, 0x00]
        );
    }
}
