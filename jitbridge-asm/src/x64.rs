use crate::{AssemblerBuffer, Label, MachineCode, RelocKind, Relocation};

mod address;
mod simd;

pub use self::address::{Address, AddressLiteral, RegisterOrConstant, ScaleFactor};
pub use self::simd::{
    CpuFeatureSet, CpuFeatures, EncodingProfile, InstructionAttributes, LegacyClass,
    VectorLength,
};

#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub struct Register(u8);

impl Register {
    pub fn new(value: u8) -> Register {
        assert!(value < 16);
        Register(value)
    }

    pub fn is_valid(self) -> bool {
        self.0 < 16
    }

    pub fn encoding(self) -> u8 {
        assert!(self.is_valid(), "invalid register");
        self.0
    }

    pub(crate) fn low_bits(self) -> u8 {
        self.encoding() & 0b111
    }

    pub fn needs_rex(self) -> bool {
        self.encoding() > 7
    }

    /// spl, bpl, sil and dil are only addressable with a REX prefix.
    fn byte_needs_rex(self) -> bool {
        self.encoding() > 3
    }
}

pub const NOREG: Register = Register(0xFF);

pub const RAX: Register = Register(0);
pub const RCX: Register = Register(1);
pub const RDX: Register = Register(2);
pub const RBX: Register = Register(3);
pub const RSP: Register = Register(4);
pub const RBP: Register = Register(5);
pub const RSI: Register = Register(6);
pub const RDI: Register = Register(7);

pub const R8: Register = Register(8);
pub const R9: Register = Register(9);
pub const R10: Register = Register(10);
pub const R11: Register = Register(11);
pub const R12: Register = Register(12);
pub const R13: Register = Register(13);
pub const R14: Register = Register(14);
pub const R15: Register = Register(15);

#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub struct XmmRegister(u8);

impl XmmRegister {
    pub fn new(value: u8) -> XmmRegister {
        assert!(value < 32);
        XmmRegister(value)
    }

    pub fn encoding(self) -> u8 {
        self.0
    }

    pub(crate) fn low_bits(self) -> u8 {
        self.0 & 0b111
    }

    pub fn needs_rex(self) -> bool {
        self.0 & 0b1000 != 0
    }

    /// xmm16..xmm31 only exist in EVEX encodings.
    pub fn needs_evex(self) -> bool {
        self.0 > 15
    }
}

pub const XMM0: XmmRegister = XmmRegister(0);
pub const XMM1: XmmRegister = XmmRegister(1);
pub const XMM2: XmmRegister = XmmRegister(2);
pub const XMM3: XmmRegister = XmmRegister(3);
pub const XMM4: XmmRegister = XmmRegister(4);
pub const XMM5: XmmRegister = XmmRegister(5);
pub const XMM6: XmmRegister = XmmRegister(6);
pub const XMM7: XmmRegister = XmmRegister(7);

pub const XMM8: XmmRegister = XmmRegister(8);
pub const XMM9: XmmRegister = XmmRegister(9);
pub const XMM10: XmmRegister = XmmRegister(10);
pub const XMM11: XmmRegister = XmmRegister(11);
pub const XMM12: XmmRegister = XmmRegister(12);
pub const XMM13: XmmRegister = XmmRegister(13);
pub const XMM14: XmmRegister = XmmRegister(14);
pub const XMM15: XmmRegister = XmmRegister(15);

pub const XMM16: XmmRegister = XmmRegister(16);
pub const XMM17: XmmRegister = XmmRegister(17);
pub const XMM18: XmmRegister = XmmRegister(18);
pub const XMM31: XmmRegister = XmmRegister(31);

/// x87 stack register `st(i)`.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct FloatRegister(u8);

impl FloatRegister {
    pub fn new(value: u8) -> FloatRegister {
        assert!(value < 8);
        FloatRegister(value)
    }

    pub fn encoding(self) -> u8 {
        self.0
    }
}

pub const ST0: FloatRegister = FloatRegister(0);
pub const ST1: FloatRegister = FloatRegister(1);

/// AVX-512 opmask register. `k0` means "no mask" when used as a write mask.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct KRegister(u8);

impl KRegister {
    pub fn new(value: u8) -> KRegister {
        assert!(value < 8);
        KRegister(value)
    }

    pub fn encoding(self) -> u8 {
        self.0
    }
}

pub const K0: KRegister = KRegister(0);
pub const K1: KRegister = KRegister(1);
pub const K2: KRegister = KRegister(2);
pub const K7: KRegister = KRegister(7);

impl From<Register> for XmmRegister {
    fn from(reg: Register) -> XmmRegister {
        XmmRegister::new(reg.encoding())
    }
}

impl TryFrom<XmmRegister> for Register {
    type Error = XmmRegister;

    fn try_from(reg: XmmRegister) -> Result<Register, XmmRegister> {
        if reg.0 < 16 {
            Ok(Register(reg.0))
        } else {
            Err(reg)
        }
    }
}

impl TryFrom<XmmRegister> for FloatRegister {
    type Error = XmmRegister;

    fn try_from(reg: XmmRegister) -> Result<FloatRegister, XmmRegister> {
        if reg.0 < 8 {
            Ok(FloatRegister(reg.0))
        } else {
            Err(reg)
        }
    }
}

impl TryFrom<Register> for KRegister {
    type Error = Register;

    fn try_from(reg: Register) -> Result<KRegister, Register> {
        if reg.is_valid() && reg.0 < 8 {
            Ok(KRegister(reg.0))
        } else {
            Err(reg)
        }
    }
}

struct JumpFixup {
    offset: u32,
    label: Label,
    distance: JumpDistance,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum JumpDistance {
    Near,
    Far,
}

pub struct AssemblerX64 {
    unresolved_jumps: Vec<JumpFixup>,
    relocations: Vec<Relocation>,
    buffer: AssemblerBuffer,
    profile: EncodingProfile,
}

impl AssemblerX64 {
    pub fn new() -> AssemblerX64 {
        AssemblerX64::with_profile(EncodingProfile::default())
    }

    pub fn with_profile(profile: EncodingProfile) -> AssemblerX64 {
        AssemblerX64 {
            unresolved_jumps: Vec::new(),
            relocations: Vec::new(),
            buffer: AssemblerBuffer::new(),
            profile,
        }
    }

    pub fn profile(&self) -> &EncodingProfile {
        &self.profile
    }

    pub fn create_label(&mut self) -> Label {
        self.buffer.create_label()
    }

    pub fn create_and_bind_label(&mut self) -> Label {
        self.buffer.create_and_bind_label()
    }

    /// Binds `lbl` to the current position and patches every jump that
    /// referenced it so far.
    pub fn bind_label(&mut self, lbl: Label) {
        let target = self.buffer.bind_label(lbl);

        let jumps = std::mem::take(&mut self.unresolved_jumps);
        let (resolved, pending): (Vec<_>, Vec<_>) =
            jumps.into_iter().partition(|jump| jump.label == lbl);
        self.unresolved_jumps = pending;

        for jump in resolved {
            match jump.distance {
                JumpDistance::Near => {
                    let distance = target as i64 - (jump.offset as i64 + 1);
                    assert!(
                        (-128..128).contains(&distance),
                        "short jump exceeds 8-bit displacement"
                    );
                    self.buffer.patch_u8(jump.offset as usize, distance as i8 as u8);
                }

                JumpDistance::Far => {
                    let distance = target as i64 - (jump.offset as i64 + 4);
                    self.buffer
                        .patch_u32(jump.offset as usize, distance as i32 as u32);
                }
            }
        }
    }

    pub fn offset(&self, lbl: Label) -> Option<u32> {
        self.buffer.offset(lbl)
    }

    pub fn finalize(self) -> MachineCode {
        assert!(self.unresolved_jumps.is_empty(), "unbound label");
        self.buffer.into_machine_code(self.relocations)
    }

    pub fn position(&self) -> usize {
        self.buffer.position()
    }

    pub fn set_position(&mut self, pos: usize) {
        self.buffer.set_position(pos);
    }

    pub fn set_position_end(&mut self) {
        self.buffer.set_position_end();
    }

    pub fn emit_u8(&mut self, value: u8) {
        self.buffer.emit_u8(value);
    }

    pub fn emit_u16(&mut self, value: u16) {
        self.buffer.emit_u16(value);
    }

    pub fn emit_u32(&mut self, value: u32) {
        self.buffer.emit_u32(value);
    }

    pub fn emit_u64(&mut self, value: u64) {
        self.buffer.emit_u64(value);
    }

    fn record_relocation(&mut self, offset: usize, kind: RelocKind, width: u8) {
        assert!(width >= 4);
        if kind == RelocKind::None {
            return;
        }
        self.relocations.push(Relocation {
            offset: offset as u32,
            kind,
            width,
        });
    }

    pub fn relocations(&self) -> &[Relocation] {
        &self.relocations
    }

    /// Pads with multi-byte nops until the position is a multiple of
    /// `alignment`.
    pub fn align(&mut self, alignment: usize) {
        assert!(alignment.is_power_of_two());
        let padding = (alignment - self.position() % alignment) % alignment;
        self.nop_n(padding);
    }
}

impl Default for AssemblerX64 {
    fn default() -> AssemblerX64 {
        AssemblerX64::new()
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum AluOp {
    Add = 0,
    Or = 1,
    And = 4,
    Sub = 5,
    Xor = 6,
    Cmp = 7,
}

impl AluOp {
    fn opcode_mr(self) -> u8 {
        (self as u8) << 3 | 0x01
    }

    fn opcode_rm(self) -> u8 {
        (self as u8) << 3 | 0x03
    }

    fn opcode_rax_imm(self) -> u8 {
        (self as u8) << 3 | 0x05
    }

    fn modrm_reg(self) -> u8 {
        self as u8
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum ShiftOp {
    Shl = 4,
    Shr = 5,
    Sar = 7,
}

impl AssemblerX64 {
    pub fn pushq_r(&mut self, reg: Register) {
        self.emit_rex_optional(false, false, false, reg.needs_rex());
        self.emit_u8(0x50 + reg.low_bits());
    }

    pub fn popq_r(&mut self, reg: Register) {
        self.emit_rex_optional(false, false, false, reg.needs_rex());
        self.emit_u8(0x58 + reg.low_bits());
    }

    pub fn pushq_i(&mut self, imm: Immediate) {
        if imm.is_int8() {
            self.emit_u8(0x6A);
            self.emit_u8(imm.int8() as u8);
        } else {
            assert!(imm.is_int32());
            self.emit_u8(0x68);
            self.emit_u32(imm.int32() as u32);
        }
    }

    pub fn pushq_a(&mut self, src: Address) {
        self.emit_rex_address_optional(false, 0, &src);
        self.emit_u8(0xFF);
        self.emit_address(0b110, &src);
    }

    pub fn popq_a(&mut self, dest: Address) {
        self.emit_rex_address_optional(false, 0, &dest);
        self.emit_u8(0x8F);
        self.emit_address(0b000, &dest);
    }

    pub fn pushfq(&mut self) {
        self.emit_u8(0x9C);
    }

    pub fn popfq(&mut self) {
        self.emit_u8(0x9D);
    }

    pub fn int3(&mut self) {
        self.emit_u8(0xCC);
    }

    pub fn hlt(&mut self) {
        self.emit_u8(0xF4);
    }

    pub fn retq(&mut self) {
        self.emit_u8(0xC3);
    }

    pub fn retq_i(&mut self, bytes: u16) {
        if bytes == 0 {
            self.retq();
        } else {
            self.emit_u8(0xC2);
            self.emit_u16(bytes);
        }
    }

    pub fn leave(&mut self) {
        self.emit_u8(0xC9);
    }

    pub fn nop(&mut self) {
        self.emit_u8(0x90);
    }

    /// Emits `bytes` bytes of padding using the recommended multi-byte nops.
    pub fn nop_n(&mut self, mut bytes: usize) {
        const NOPS: [&[u8]; 9] = [
            &[0x90],
            &[0x66, 0x90],
            &[0x0F, 0x1F, 0x00],
            &[0x0F, 0x1F, 0x40, 0x00],
            &[0x0F, 0x1F, 0x44, 0x00, 0x00],
            &[0x66, 0x0F, 0x1F, 0x44, 0x00, 0x00],
            &[0x0F, 0x1F, 0x80, 0x00, 0x00, 0x00, 0x00],
            &[0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
            &[0x66, 0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
        ];

        while bytes > 0 {
            let chunk = bytes.min(NOPS.len());
            for &byte in NOPS[chunk - 1] {
                self.emit_u8(byte);
            }
            bytes -= chunk;
        }
    }

    pub fn pause(&mut self) {
        self.emit_u8(0xF3);
        self.emit_u8(0x90);
    }

    pub fn mfence(&mut self) {
        self.emit_u8(0x0F);
        self.emit_u8(0xAE);
        self.emit_u8(0xF0);
    }

    pub fn lfence(&mut self) {
        self.emit_u8(0x0F);
        self.emit_u8(0xAE);
        self.emit_u8(0xE8);
    }

    pub fn sfence(&mut self) {
        self.emit_u8(0x0F);
        self.emit_u8(0xAE);
        self.emit_u8(0xF8);
    }

    pub fn setcc_r(&mut self, condition: Condition, dest: Register) {
        if dest.byte_needs_rex() {
            self.emit_rex(false, false, false, dest.needs_rex());
        }

        self.emit_u8(0x0F);
        self.emit_u8(0x90 + condition.int());
        self.emit_modrm_opcode(0, dest);
    }

    pub fn cmovl(&mut self, condition: Condition, dest: Register, src: Register) {
        self.emit_rex_optional(false, dest.needs_rex(), false, src.needs_rex());
        self.emit_u8(0x0F);
        self.emit_u8(0x40 + condition.int());
        self.emit_modrm_registers(dest, src);
    }

    pub fn cmovq(&mut self, condition: Condition, dest: Register, src: Register) {
        self.emit_rex(true, dest.needs_rex(), false, src.needs_rex());
        self.emit_u8(0x0F);
        self.emit_u8(0x40 + condition.int());
        self.emit_modrm_registers(dest, src);
    }

    pub fn cmovq_ra(&mut self, condition: Condition, dest: Register, src: Address) {
        self.emit_rex_address(true, dest.encoding(), &src);
        self.emit_u8(0x0F);
        self.emit_u8(0x40 + condition.int());
        self.emit_address(dest.low_bits(), &src);
    }

    pub fn lea(&mut self, dest: Register, src: Address) {
        self.emit_rex_address(true, dest.encoding(), &src);
        self.emit_u8(0x8D);
        self.emit_address(dest.low_bits(), &src);
    }

    pub fn movq_rr(&mut self, dest: Register, src: Register) {
        self.emit_rex(true, src.needs_rex(), false, dest.needs_rex());
        self.emit_u8(0x89);
        self.emit_modrm_registers(src, dest);
    }

    pub fn movq_ri(&mut self, dest: Register, imm: Immediate) {
        self.emit_rex(true, false, false, dest.needs_rex());
        if imm.is_int32() {
            self.emit_u8(0xC7);
            self.emit_modrm_opcode(0, dest);
            self.emit_u32(imm.int32() as u32);
        } else {
            self.emit_u8(0xB8 + dest.low_bits());
            self.emit_u64(imm.int64() as u64);
        }
    }

    /// Always the 10-byte `mov r64, imm64` form.
    pub fn movabs_ri(&mut self, dest: Register, value: u64) {
        self.emit_rex(true, false, false, dest.needs_rex());
        self.emit_u8(0xB8 + dest.low_bits());
        self.emit_u64(value);
    }

    /// Loads the literal's target as an immediate and records its relocation
    /// on the 8-byte immediate.
    pub fn movabs_literal(&mut self, dest: Register, literal: AddressLiteral) {
        self.emit_rex(true, false, false, dest.needs_rex());
        self.emit_u8(0xB8 + dest.low_bits());
        let offset = self.position();
        self.record_relocation(offset, literal.reloc(), 8);
        self.emit_u64(literal.target());
    }

    pub fn movq_ra(&mut self, dest: Register, src: Address) {
        self.emit_rex_address(true, dest.encoding(), &src);
        self.emit_u8(0x8B);
        self.emit_address(dest.low_bits(), &src);
    }

    pub fn movq_ar(&mut self, dest: Address, src: Register) {
        self.emit_rex_address(true, src.encoding(), &dest);
        self.emit_u8(0x89);
        self.emit_address(src.low_bits(), &dest);
    }

    pub fn movq_ai(&mut self, dest: Address, imm: Immediate) {
        assert!(imm.is_int32());
        self.emit_rex_address(true, 0, &dest);
        self.emit_u8(0xC7);
        self.emit_address(0b000, &dest);
        self.emit_u32(imm.int32() as u32);
    }

    pub fn movl_rr(&mut self, dest: Register, src: Register) {
        self.emit_rex_optional(false, src.needs_rex(), false, dest.needs_rex());
        self.emit_u8(0x89);
        self.emit_modrm_registers(src, dest);
    }

    pub fn movl_ri(&mut self, dest: Register, imm: Immediate) {
        assert!(imm.is_int32() || imm.is_uint32());
        self.emit_rex_optional(false, false, false, dest.needs_rex());
        self.emit_u8(0xB8 + dest.low_bits());
        self.emit_u32(imm.uint32());
    }

    pub fn movl_ra(&mut self, dest: Register, src: Address) {
        self.emit_rex_address_optional(false, dest.encoding(), &src);
        self.emit_u8(0x8B);
        self.emit_address(dest.low_bits(), &src);
    }

    pub fn movl_ar(&mut self, dest: Address, src: Register) {
        self.emit_rex_address_optional(false, src.encoding(), &dest);
        self.emit_u8(0x89);
        self.emit_address(src.low_bits(), &dest);
    }

    pub fn movl_ai(&mut self, dest: Address, imm: Immediate) {
        assert!(imm.is_int32() || imm.is_uint32());
        self.emit_rex_address_optional(false, 0, &dest);
        self.emit_u8(0xC7);
        self.emit_address(0b000, &dest);
        self.emit_u32(imm.uint32());
    }

    pub fn movw_ar(&mut self, dest: Address, src: Register) {
        self.emit_u8(0x66);
        self.emit_rex_address_optional(false, src.encoding(), &dest);
        self.emit_u8(0x89);
        self.emit_address(src.low_bits(), &dest);
    }

    pub fn movw_ai(&mut self, dest: Address, imm: Immediate) {
        assert!(imm.is_int16() || imm.is_uint16());
        self.emit_u8(0x66);
        self.emit_rex_address_optional(false, 0, &dest);
        self.emit_u8(0xC7);
        self.emit_address(0b000, &dest);
        self.emit_u16(imm.0 as u16);
    }

    pub fn movb_ar(&mut self, dest: Address, src: Register) {
        self.emit_rex_byte_address(src, &dest);
        self.emit_u8(0x88);
        self.emit_address(src.low_bits(), &dest);
    }

    pub fn movb_ra(&mut self, dest: Register, src: Address) {
        self.emit_rex_byte_address(dest, &src);
        self.emit_u8(0x8A);
        self.emit_address(dest.low_bits(), &src);
    }

    pub fn movb_ai(&mut self, dest: Address, imm: Immediate) {
        assert!(imm.is_int8() || imm.is_uint8());
        self.emit_rex_address_optional(false, 0, &dest);
        self.emit_u8(0xC6);
        self.emit_address(0b000, &dest);
        self.emit_u8(imm.uint8());
    }

    pub fn movzxb_rr(&mut self, dest: Register, src: Register) {
        self.emit_rex_byte_rm(false, dest, src);
        self.emit_u8(0x0F);
        self.emit_u8(0xB6);
        self.emit_modrm_registers(dest, src);
    }

    pub fn movzxb_ra(&mut self, dest: Register, src: Address) {
        self.emit_rex_address_optional(false, dest.encoding(), &src);
        self.emit_u8(0x0F);
        self.emit_u8(0xB6);
        self.emit_address(dest.low_bits(), &src);
    }

    pub fn movzxw_rr(&mut self, dest: Register, src: Register) {
        self.emit_rex_optional(false, dest.needs_rex(), false, src.needs_rex());
        self.emit_u8(0x0F);
        self.emit_u8(0xB7);
        self.emit_modrm_registers(dest, src);
    }

    pub fn movzxw_ra(&mut self, dest: Register, src: Address) {
        self.emit_rex_address_optional(false, dest.encoding(), &src);
        self.emit_u8(0x0F);
        self.emit_u8(0xB7);
        self.emit_address(dest.low_bits(), &src);
    }

    pub fn movsxbl_rr(&mut self, dest: Register, src: Register) {
        self.emit_rex_byte_rm(false, dest, src);
        self.emit_u8(0x0F);
        self.emit_u8(0xBE);
        self.emit_modrm_registers(dest, src);
    }

    pub fn movsxbl_ra(&mut self, dest: Register, src: Address) {
        self.emit_rex_address_optional(false, dest.encoding(), &src);
        self.emit_u8(0x0F);
        self.emit_u8(0xBE);
        self.emit_address(dest.low_bits(), &src);
    }

    pub fn movsxbq_rr(&mut self, dest: Register, src: Register) {
        self.emit_rex(true, dest.needs_rex(), false, src.needs_rex());
        self.emit_u8(0x0F);
        self.emit_u8(0xBE);
        self.emit_modrm_registers(dest, src);
    }

    pub fn movsxwl_rr(&mut self, dest: Register, src: Register) {
        self.emit_rex_optional(false, dest.needs_rex(), false, src.needs_rex());
        self.emit_u8(0x0F);
        self.emit_u8(0xBF);
        self.emit_modrm_registers(dest, src);
    }

    pub fn movsxwl_ra(&mut self, dest: Register, src: Address) {
        self.emit_rex_address_optional(false, dest.encoding(), &src);
        self.emit_u8(0x0F);
        self.emit_u8(0xBF);
        self.emit_address(dest.low_bits(), &src);
    }

    pub fn movsxwq_rr(&mut self, dest: Register, src: Register) {
        self.emit_rex(true, dest.needs_rex(), false, src.needs_rex());
        self.emit_u8(0x0F);
        self.emit_u8(0xBF);
        self.emit_modrm_registers(dest, src);
    }

    pub fn movsxlq_rr(&mut self, dest: Register, src: Register) {
        self.emit_rex(true, dest.needs_rex(), false, src.needs_rex());
        self.emit_u8(0x63);
        self.emit_modrm_registers(dest, src);
    }

    pub fn movsxlq_ra(&mut self, dest: Register, src: Address) {
        self.emit_rex_address(true, dest.encoding(), &src);
        self.emit_u8(0x63);
        self.emit_address(dest.low_bits(), &src);
    }

    pub fn addq_rr(&mut self, dest: Register, src: Register) {
        self.emit_alu_rr(true, AluOp::Add, dest, src);
    }

    pub fn addq_ri(&mut self, dest: Register, imm: Immediate) {
        self.emit_alu_ri(true, AluOp::Add, dest, imm);
    }

    pub fn addq_ra(&mut self, dest: Register, src: Address) {
        self.emit_alu_ra(true, AluOp::Add, dest, src);
    }

    pub fn addq_ar(&mut self, dest: Address, src: Register) {
        self.emit_alu_ar(true, AluOp::Add, dest, src);
    }

    pub fn addq_ai(&mut self, dest: Address, imm: Immediate) {
        self.emit_alu_ai(true, AluOp::Add, dest, imm);
    }

    pub fn addl_rr(&mut self, dest: Register, src: Register) {
        self.emit_alu_rr(false, AluOp::Add, dest, src);
    }

    pub fn addl_ri(&mut self, dest: Register, imm: Immediate) {
        self.emit_alu_ri(false, AluOp::Add, dest, imm);
    }

    pub fn addl_ra(&mut self, dest: Register, src: Address) {
        self.emit_alu_ra(false, AluOp::Add, dest, src);
    }

    pub fn addl_ar(&mut self, dest: Address, src: Register) {
        self.emit_alu_ar(false, AluOp::Add, dest, src);
    }

    pub fn addl_ai(&mut self, dest: Address, imm: Immediate) {
        self.emit_alu_ai(false, AluOp::Add, dest, imm);
    }

    pub fn subq_rr(&mut self, dest: Register, src: Register) {
        self.emit_alu_rr(true, AluOp::Sub, dest, src);
    }

    pub fn subq_ri(&mut self, dest: Register, imm: Immediate) {
        self.emit_alu_ri(true, AluOp::Sub, dest, imm);
    }

    pub fn subq_ra(&mut self, dest: Register, src: Address) {
        self.emit_alu_ra(true, AluOp::Sub, dest, src);
    }

    pub fn subq_ar(&mut self, dest: Address, src: Register) {
        self.emit_alu_ar(true, AluOp::Sub, dest, src);
    }

    pub fn subq_ai(&mut self, dest: Address, imm: Immediate) {
        self.emit_alu_ai(true, AluOp::Sub, dest, imm);
    }

    pub fn subl_rr(&mut self, dest: Register, src: Register) {
        self.emit_alu_rr(false, AluOp::Sub, dest, src);
    }

    pub fn subl_ri(&mut self, dest: Register, imm: Immediate) {
        self.emit_alu_ri(false, AluOp::Sub, dest, imm);
    }

    pub fn subl_ra(&mut self, dest: Register, src: Address) {
        self.emit_alu_ra(false, AluOp::Sub, dest, src);
    }

    pub fn subl_ar(&mut self, dest: Address, src: Register) {
        self.emit_alu_ar(false, AluOp::Sub, dest, src);
    }

    pub fn subl_ai(&mut self, dest: Address, imm: Immediate) {
        self.emit_alu_ai(false, AluOp::Sub, dest, imm);
    }

    pub fn andq_rr(&mut self, dest: Register, src: Register) {
        self.emit_alu_rr(true, AluOp::And, dest, src);
    }

    pub fn andq_ri(&mut self, dest: Register, imm: Immediate) {
        self.emit_alu_ri(true, AluOp::And, dest, imm);
    }

    pub fn andq_ra(&mut self, dest: Register, src: Address) {
        self.emit_alu_ra(true, AluOp::And, dest, src);
    }

    pub fn andq_ar(&mut self, dest: Address, src: Register) {
        self.emit_alu_ar(true, AluOp::And, dest, src);
    }

    pub fn andq_ai(&mut self, dest: Address, imm: Immediate) {
        self.emit_alu_ai(true, AluOp::And, dest, imm);
    }

    pub fn andl_rr(&mut self, dest: Register, src: Register) {
        self.emit_alu_rr(false, AluOp::And, dest, src);
    }

    pub fn andl_ri(&mut self, dest: Register, imm: Immediate) {
        self.emit_alu_ri(false, AluOp::And, dest, imm);
    }

    pub fn andl_ra(&mut self, dest: Register, src: Address) {
        self.emit_alu_ra(false, AluOp::And, dest, src);
    }

    pub fn andl_ar(&mut self, dest: Address, src: Register) {
        self.emit_alu_ar(false, AluOp::And, dest, src);
    }

    pub fn andl_ai(&mut self, dest: Address, imm: Immediate) {
        self.emit_alu_ai(false, AluOp::And, dest, imm);
    }

    pub fn orq_rr(&mut self, dest: Register, src: Register) {
        self.emit_alu_rr(true, AluOp::Or, dest, src);
    }

    pub fn orq_ri(&mut self, dest: Register, imm: Immediate) {
        self.emit_alu_ri(true, AluOp::Or, dest, imm);
    }

    pub fn orq_ra(&mut self, dest: Register, src: Address) {
        self.emit_alu_ra(true, AluOp::Or, dest, src);
    }

    pub fn orq_ar(&mut self, dest: Address, src: Register) {
        self.emit_alu_ar(true, AluOp::Or, dest, src);
    }

    pub fn orq_ai(&mut self, dest: Address, imm: Immediate) {
        self.emit_alu_ai(true, AluOp::Or, dest, imm);
    }

    pub fn orl_rr(&mut self, dest: Register, src: Register) {
        self.emit_alu_rr(false, AluOp::Or, dest, src);
    }

    pub fn orl_ri(&mut self, dest: Register, imm: Immediate) {
        self.emit_alu_ri(false, AluOp::Or, dest, imm);
    }

    pub fn orl_ra(&mut self, dest: Register, src: Address) {
        self.emit_alu_ra(false, AluOp::Or, dest, src);
    }

    pub fn orl_ar(&mut self, dest: Address, src: Register) {
        self.emit_alu_ar(false, AluOp::Or, dest, src);
    }

    pub fn orl_ai(&mut self, dest: Address, imm: Immediate) {
        self.emit_alu_ai(false, AluOp::Or, dest, imm);
    }

    pub fn xorq_rr(&mut self, dest: Register, src: Register) {
        self.emit_alu_rr(true, AluOp::Xor, dest, src);
    }

    pub fn xorq_ri(&mut self, dest: Register, imm: Immediate) {
        self.emit_alu_ri(true, AluOp::Xor, dest, imm);
    }

    pub fn xorq_ra(&mut self, dest: Register, src: Address) {
        self.emit_alu_ra(true, AluOp::Xor, dest, src);
    }

    pub fn xorq_ar(&mut self, dest: Address, src: Register) {
        self.emit_alu_ar(true, AluOp::Xor, dest, src);
    }

    pub fn xorq_ai(&mut self, dest: Address, imm: Immediate) {
        self.emit_alu_ai(true, AluOp::Xor, dest, imm);
    }

    pub fn xorl_rr(&mut self, dest: Register, src: Register) {
        self.emit_alu_rr(false, AluOp::Xor, dest, src);
    }

    pub fn xorl_ri(&mut self, dest: Register, imm: Immediate) {
        self.emit_alu_ri(false, AluOp::Xor, dest, imm);
    }

    pub fn xorl_ra(&mut self, dest: Register, src: Address) {
        self.emit_alu_ra(false, AluOp::Xor, dest, src);
    }

    pub fn xorl_ar(&mut self, dest: Address, src: Register) {
        self.emit_alu_ar(false, AluOp::Xor, dest, src);
    }

    pub fn xorl_ai(&mut self, dest: Address, imm: Immediate) {
        self.emit_alu_ai(false, AluOp::Xor, dest, imm);
    }

    pub fn cmpq_rr(&mut self, lhs: Register, rhs: Register) {
        self.emit_alu_rr(true, AluOp::Cmp, lhs, rhs);
    }

    pub fn cmpq_ri(&mut self, lhs: Register, imm: Immediate) {
        self.emit_alu_ri(true, AluOp::Cmp, lhs, imm);
    }

    pub fn cmpq_ra(&mut self, lhs: Register, rhs: Address) {
        self.emit_alu_ra(true, AluOp::Cmp, lhs, rhs);
    }

    pub fn cmpq_ar(&mut self, lhs: Address, rhs: Register) {
        self.emit_alu_ar(true, AluOp::Cmp, lhs, rhs);
    }

    pub fn cmpq_ai(&mut self, lhs: Address, imm: Immediate) {
        self.emit_alu_ai(true, AluOp::Cmp, lhs, imm);
    }

    pub fn cmpl_rr(&mut self, lhs: Register, rhs: Register) {
        self.emit_alu_rr(false, AluOp::Cmp, lhs, rhs);
    }

    pub fn cmpl_ri(&mut self, lhs: Register, imm: Immediate) {
        self.emit_alu_ri(false, AluOp::Cmp, lhs, imm);
    }

    pub fn cmpl_ra(&mut self, lhs: Register, rhs: Address) {
        self.emit_alu_ra(false, AluOp::Cmp, lhs, rhs);
    }

    pub fn cmpl_ar(&mut self, lhs: Address, rhs: Register) {
        self.emit_alu_ar(false, AluOp::Cmp, lhs, rhs);
    }

    pub fn cmpl_ai(&mut self, lhs: Address, imm: Immediate) {
        self.emit_alu_ai(false, AluOp::Cmp, lhs, imm);
    }

    pub fn cmpb_ai(&mut self, lhs: Address, imm: Immediate) {
        assert!(imm.is_int8() || imm.is_uint8());
        self.emit_rex_address_optional(false, 0, &lhs);
        self.emit_u8(0x80);
        self.emit_address(0b111, &lhs);
        self.emit_u8(imm.uint8());
    }

    pub fn testl_rr(&mut self, lhs: Register, rhs: Register) {
        self.emit_rex_optional(false, rhs.needs_rex(), false, lhs.needs_rex());
        self.emit_u8(0x85);
        self.emit_modrm_registers(rhs, lhs);
    }

    pub fn testl_ri(&mut self, lhs: Register, imm: Immediate) {
        assert!(imm.is_int32() || imm.is_uint32());
        if lhs == RAX {
            self.emit_u8(0xA9);
        } else {
            self.emit_rex_optional(false, false, false, lhs.needs_rex());
            self.emit_u8(0xF7);
            self.emit_modrm_opcode(0b000, lhs);
        }
        self.emit_u32(imm.uint32());
    }

    pub fn testl_ar(&mut self, lhs: Address, rhs: Register) {
        self.emit_rex_address_optional(false, rhs.encoding(), &lhs);
        self.emit_u8(0x85);
        self.emit_address(rhs.low_bits(), &lhs);
    }

    pub fn testl_ai(&mut self, lhs: Address, imm: Immediate) {
        assert!(imm.is_int32() || imm.is_uint32());
        self.emit_rex_address_optional(false, 0, &lhs);
        self.emit_u8(0xF7);
        self.emit_address(0b000, &lhs);
        self.emit_u32(imm.uint32());
    }

    pub fn testq_rr(&mut self, lhs: Register, rhs: Register) {
        self.emit_rex(true, rhs.needs_rex(), false, lhs.needs_rex());
        self.emit_u8(0x85);
        self.emit_modrm_registers(rhs, lhs);
    }

    pub fn testq_ri(&mut self, lhs: Register, imm: Immediate) {
        assert!(imm.is_int32());
        self.emit_rex(true, false, false, lhs.needs_rex());
        if lhs == RAX {
            self.emit_u8(0xA9);
        } else {
            self.emit_u8(0xF7);
            self.emit_modrm_opcode(0b000, lhs);
        }
        self.emit_u32(imm.int32() as u32);
    }

    pub fn testq_ar(&mut self, lhs: Address, rhs: Register) {
        self.emit_rex_address(true, rhs.encoding(), &lhs);
        self.emit_u8(0x85);
        self.emit_address(rhs.low_bits(), &lhs);
    }

    pub fn testb_ai(&mut self, lhs: Address, imm: Immediate) {
        assert!(imm.is_int8() || imm.is_uint8());
        self.emit_rex_address_optional(false, 0, &lhs);
        self.emit_u8(0xF6);
        self.emit_address(0b000, &lhs);
        self.emit_u8(imm.uint8());
    }

    pub fn incl_r(&mut self, reg: Register) {
        self.emit_rex_optional(false, false, false, reg.needs_rex());
        self.emit_u8(0xFF);
        self.emit_modrm_opcode(0b000, reg);
    }

    pub fn incq_r(&mut self, reg: Register) {
        self.emit_rex(true, false, false, reg.needs_rex());
        self.emit_u8(0xFF);
        self.emit_modrm_opcode(0b000, reg);
    }

    pub fn incl_a(&mut self, dest: Address) {
        self.emit_rex_address_optional(false, 0, &dest);
        self.emit_u8(0xFF);
        self.emit_address(0b000, &dest);
    }

    pub fn incq_a(&mut self, dest: Address) {
        self.emit_rex_address(true, 0, &dest);
        self.emit_u8(0xFF);
        self.emit_address(0b000, &dest);
    }

    pub fn decl_r(&mut self, reg: Register) {
        self.emit_rex_optional(false, false, false, reg.needs_rex());
        self.emit_u8(0xFF);
        self.emit_modrm_opcode(0b001, reg);
    }

    pub fn decq_r(&mut self, reg: Register) {
        self.emit_rex(true, false, false, reg.needs_rex());
        self.emit_u8(0xFF);
        self.emit_modrm_opcode(0b001, reg);
    }

    pub fn decl_a(&mut self, dest: Address) {
        self.emit_rex_address_optional(false, 0, &dest);
        self.emit_u8(0xFF);
        self.emit_address(0b001, &dest);
    }

    pub fn negl(&mut self, reg: Register) {
        self.emit_rex_optional(false, false, false, reg.needs_rex());
        self.emit_u8(0xF7);
        self.emit_modrm_opcode(0b011, reg);
    }

    pub fn negq(&mut self, reg: Register) {
        self.emit_rex(true, false, false, reg.needs_rex());
        self.emit_u8(0xF7);
        self.emit_modrm_opcode(0b011, reg);
    }

    pub fn notl(&mut self, reg: Register) {
        self.emit_rex_optional(false, false, false, reg.needs_rex());
        self.emit_u8(0xF7);
        self.emit_modrm_opcode(0b010, reg);
    }

    pub fn notq(&mut self, reg: Register) {
        self.emit_rex(true, false, false, reg.needs_rex());
        self.emit_u8(0xF7);
        self.emit_modrm_opcode(0b010, reg);
    }

    pub fn imull_rr(&mut self, dest: Register, src: Register) {
        self.emit_rex_optional(false, dest.needs_rex(), false, src.needs_rex());
        self.emit_u8(0x0F);
        self.emit_u8(0xAF);
        self.emit_modrm_registers(dest, src);
    }

    pub fn imulq_rr(&mut self, dest: Register, src: Register) {
        self.emit_rex(true, dest.needs_rex(), false, src.needs_rex());
        self.emit_u8(0x0F);
        self.emit_u8(0xAF);
        self.emit_modrm_registers(dest, src);
    }

    pub fn idivl_r(&mut self, src: Register) {
        self.emit_rex_optional(false, false, false, src.needs_rex());
        self.emit_u8(0xF7);
        self.emit_modrm_opcode(0b111, src);
    }

    pub fn idivq_r(&mut self, src: Register) {
        self.emit_rex(true, false, false, src.needs_rex());
        self.emit_u8(0xF7);
        self.emit_modrm_opcode(0b111, src);
    }

    pub fn cdq(&mut self) {
        self.emit_u8(0x99);
    }

    pub fn cqo(&mut self) {
        self.emit_rex(true, false, false, false);
        self.emit_u8(0x99);
    }

    pub fn shll_ri(&mut self, dest: Register, imm: Immediate) {
        self.emit_shift_ri(false, ShiftOp::Shl, dest, imm);
    }

    pub fn shlq_ri(&mut self, dest: Register, imm: Immediate) {
        self.emit_shift_ri(true, ShiftOp::Shl, dest, imm);
    }

    pub fn shrl_ri(&mut self, dest: Register, imm: Immediate) {
        self.emit_shift_ri(false, ShiftOp::Shr, dest, imm);
    }

    pub fn shrq_ri(&mut self, dest: Register, imm: Immediate) {
        self.emit_shift_ri(true, ShiftOp::Shr, dest, imm);
    }

    pub fn sarl_ri(&mut self, dest: Register, imm: Immediate) {
        self.emit_shift_ri(false, ShiftOp::Sar, dest, imm);
    }

    pub fn sarq_ri(&mut self, dest: Register, imm: Immediate) {
        self.emit_shift_ri(true, ShiftOp::Sar, dest, imm);
    }

    pub fn shlq_r(&mut self, dest: Register) {
        self.emit_shift_r(true, ShiftOp::Shl, dest);
    }

    pub fn shrq_r(&mut self, dest: Register) {
        self.emit_shift_r(true, ShiftOp::Shr, dest);
    }

    pub fn sarq_r(&mut self, dest: Register) {
        self.emit_shift_r(true, ShiftOp::Sar, dest);
    }

    pub fn xchgq_rr(&mut self, lhs: Register, rhs: Register) {
        self.emit_rex(true, rhs.needs_rex(), false, lhs.needs_rex());
        self.emit_u8(0x87);
        self.emit_modrm_registers(rhs, lhs);
    }

    pub fn xchgq_ar(&mut self, dest: Address, src: Register) {
        self.emit_rex_address(true, src.encoding(), &dest);
        self.emit_u8(0x87);
        self.emit_address(src.low_bits(), &dest);
    }

    pub fn xchgl_ar(&mut self, dest: Address, src: Register) {
        self.emit_rex_address_optional(false, src.encoding(), &dest);
        self.emit_u8(0x87);
        self.emit_address(src.low_bits(), &dest);
    }

    pub fn cmpxchgq_ar(&mut self, dest: Address, src: Register) {
        self.emit_rex_address(true, src.encoding(), &dest);
        self.emit_u8(0x0F);
        self.emit_u8(0xB1);
        self.emit_address(src.low_bits(), &dest);
    }

    pub fn cmpxchgl_ar(&mut self, dest: Address, src: Register) {
        self.emit_rex_address_optional(false, src.encoding(), &dest);
        self.emit_u8(0x0F);
        self.emit_u8(0xB1);
        self.emit_address(src.low_bits(), &dest);
    }

    pub fn lock_cmpxchgq_ar(&mut self, dest: Address, src: Register) {
        self.emit_lock_prefix();
        self.cmpxchgq_ar(dest, src);
    }

    pub fn lock_cmpxchgl_ar(&mut self, dest: Address, src: Register) {
        self.emit_lock_prefix();
        self.cmpxchgl_ar(dest, src);
    }

    pub fn xaddq_ar(&mut self, dest: Address, src: Register) {
        self.emit_rex_address(true, src.encoding(), &dest);
        self.emit_u8(0x0F);
        self.emit_u8(0xC1);
        self.emit_address(src.low_bits(), &dest);
    }

    pub fn xaddl_ar(&mut self, dest: Address, src: Register) {
        self.emit_rex_address_optional(false, src.encoding(), &dest);
        self.emit_u8(0x0F);
        self.emit_u8(0xC1);
        self.emit_address(src.low_bits(), &dest);
    }

    pub fn lock_xaddq_ar(&mut self, dest: Address, src: Register) {
        self.emit_lock_prefix();
        self.xaddq_ar(dest, src);
    }

    pub fn lock_xaddl_ar(&mut self, dest: Address, src: Register) {
        self.emit_lock_prefix();
        self.xaddl_ar(dest, src);
    }

    pub fn call_r(&mut self, reg: Register) {
        self.emit_rex_optional(false, false, false, reg.needs_rex());
        self.emit_u8(0xFF);
        self.emit_modrm_opcode(0b010, reg);
    }

    pub fn call_a(&mut self, target: Address) {
        self.emit_rex_address_optional(false, 0, &target);
        self.emit_u8(0xFF);
        self.emit_address(0b010, &target);
    }

    pub fn call(&mut self, target: Label) {
        self.emit_u8(0xE8);
        self.emit_label_rel32(target);
    }

    pub fn jmp_r(&mut self, reg: Register) {
        self.emit_rex_optional(false, false, false, reg.needs_rex());
        self.emit_u8(0xFF);
        self.emit_modrm_opcode(0b100, reg);
    }

    pub fn jmp_a(&mut self, target: Address) {
        self.emit_rex_address_optional(false, 0, &target);
        self.emit_u8(0xFF);
        self.emit_address(0b100, &target);
    }

    pub fn jmp(&mut self, target: Label) {
        self.emit_u8(0xE9);
        self.emit_label_rel32(target);
    }

    pub fn jcc(&mut self, condition: Condition, target: Label) {
        self.emit_u8(0x0F);
        self.emit_u8(0x80 + condition.int());
        self.emit_label_rel32(target);
    }

    /// 2-byte jump; the caller guarantees the target is within 8-bit range.
    pub fn jmp_short(&mut self, target: Label) {
        self.emit_u8(0xEB);
        self.emit_label_rel8(target);
    }

    pub fn jcc_short(&mut self, condition: Condition, target: Label) {
        self.emit_u8(0x70 + condition.int());
        self.emit_label_rel8(target);
    }

    fn emit_label_rel32(&mut self, target: Label) {
        let offset = self.buffer.position_u32();
        if let Some(target_offset) = self.offset(target) {
            let distance = target_offset as i64 - (offset as i64 + 4);
            self.emit_u32(distance as i32 as u32);
        } else {
            self.unresolved_jumps.push(JumpFixup {
                offset,
                label: target,
                distance: JumpDistance::Far,
            });
            self.emit_u32(0);
        }
    }

    fn emit_label_rel8(&mut self, target: Label) {
        let offset = self.buffer.position_u32();
        if let Some(target_offset) = self.offset(target) {
            let distance = target_offset as i64 - (offset as i64 + 1);
            assert!(
                (-128..128).contains(&distance),
                "short jump exceeds 8-bit displacement"
            );
            self.emit_u8(distance as i8 as u8);
        } else {
            self.unresolved_jumps.push(JumpFixup {
                offset,
                label: target,
                distance: JumpDistance::Near,
            });
            self.emit_u8(0);
        }
    }

    fn emit_lock_prefix(&mut self) {
        self.emit_u8(0xF0);
    }

    fn emit_rex(&mut self, w: bool, r: bool, x: bool, b: bool) {
        // w - 64-bit width
        // r - extension of modrm-reg field
        // x - extension of sib index field
        // b - extension of modrm-rm/sib base/opcode reg field
        let opcode = 0x40 | (w as u8) << 3 | (r as u8) << 2 | (x as u8) << 1 | b as u8;
        self.emit_u8(opcode);
    }

    fn emit_rex_optional(&mut self, w: bool, r: bool, x: bool, b: bool) {
        if w || r || x || b {
            self.emit_rex(w, r, x, b);
        }
    }

    /// `rm` is accessed as a byte register.
    fn emit_rex_byte_rm(&mut self, w: bool, reg: Register, rm: Register) {
        if w || reg.needs_rex() || rm.byte_needs_rex() {
            self.emit_rex(w, reg.needs_rex(), false, rm.needs_rex());
        }
    }

    fn emit_rex_byte_address(&mut self, reg: Register, address: &Address) {
        if reg.byte_needs_rex() || address.rex_x() || address.rex_b() {
            self.emit_rex(false, reg.needs_rex(), address.rex_x(), address.rex_b());
        }
    }

    /// `reg` is the full encoding of whatever lands in the ModRM reg field.
    fn emit_rex_address(&mut self, w: bool, reg: u8, address: &Address) {
        self.emit_rex(w, reg & 0b1000 != 0, address.rex_x(), address.rex_b());
    }

    fn emit_rex_address_optional(&mut self, w: bool, reg: u8, address: &Address) {
        self.emit_rex_optional(w, reg & 0b1000 != 0, address.rex_x(), address.rex_b());
    }

    fn emit_modrm_registers(&mut self, reg: Register, rm: Register) {
        self.emit_modrm(0b11, reg.low_bits(), rm.low_bits());
    }

    fn emit_modrm_opcode(&mut self, opcode: u8, reg: Register) {
        self.emit_modrm(0b11, opcode, reg.low_bits());
    }

    fn emit_modrm(&mut self, mode: u8, reg: u8, rm: u8) {
        assert!(mode < 4);
        assert!(reg < 8);
        assert!(rm < 8);
        self.emit_u8(mode << 6 | reg << 3 | rm);
    }

    fn emit_address(&mut self, reg_or_opcode: u8, address: &Address) {
        self.emit_address_scaled(reg_or_opcode, address, 1);
    }

    fn emit_address_scaled(&mut self, reg_or_opcode: u8, address: &Address, disp8_scale: i32) {
        assert!(reg_or_opcode < 8);

        let encoded = address.encode(reg_or_opcode, disp8_scale);
        let start = self.position();

        for &byte in encoded.bytes() {
            self.emit_u8(byte);
        }

        if address.has_reloc() {
            if let Some(disp_offset) = encoded.disp32_offset() {
                self.record_relocation(start + disp_offset, address.reloc(), 4);
            }
        }
    }

    fn emit_alu_rr(&mut self, w: bool, op: AluOp, dest: Register, src: Register) {
        self.emit_rex_optional(w, src.needs_rex(), false, dest.needs_rex());
        self.emit_u8(op.opcode_mr());
        self.emit_modrm_registers(src, dest);
    }

    fn emit_alu_ri(&mut self, w: bool, op: AluOp, dest: Register, imm: Immediate) {
        if w {
            assert!(imm.is_int32());
        } else {
            assert!(imm.is_int32() || imm.is_uint32());
        }
        self.emit_rex_optional(w, false, false, dest.needs_rex());

        if imm.is_int8() {
            self.emit_u8(0x83);
            self.emit_modrm_opcode(op.modrm_reg(), dest);
            self.emit_u8(imm.int8() as u8);
        } else if dest == RAX {
            self.emit_u8(op.opcode_rax_imm());
            self.emit_u32(imm.uint32());
        } else {
            self.emit_u8(0x81);
            self.emit_modrm_opcode(op.modrm_reg(), dest);
            self.emit_u32(imm.uint32());
        }
    }

    fn emit_alu_ra(&mut self, w: bool, op: AluOp, dest: Register, src: Address) {
        self.emit_rex_address_optional(w, dest.encoding(), &src);
        self.emit_u8(op.opcode_rm());
        self.emit_address(dest.low_bits(), &src);
    }

    fn emit_alu_ar(&mut self, w: bool, op: AluOp, dest: Address, src: Register) {
        self.emit_rex_address_optional(w, src.encoding(), &dest);
        self.emit_u8(op.opcode_mr());
        self.emit_address(src.low_bits(), &dest);
    }

    fn emit_alu_ai(&mut self, w: bool, op: AluOp, dest: Address, imm: Immediate) {
        if w {
            assert!(imm.is_int32());
        } else {
            assert!(imm.is_int32() || imm.is_uint32());
        }
        self.emit_rex_address_optional(w, 0, &dest);

        if imm.is_int8() {
            self.emit_u8(0x83);
            self.emit_address(op.modrm_reg(), &dest);
            self.emit_u8(imm.int8() as u8);
        } else {
            self.emit_u8(0x81);
            self.emit_address(op.modrm_reg(), &dest);
            self.emit_u32(imm.uint32());
        }
    }

    fn emit_shift_ri(&mut self, w: bool, op: ShiftOp, dest: Register, imm: Immediate) {
        let limit = if w { 64 } else { 32 };
        assert!(0 <= imm.0 && imm.0 < limit);
        self.emit_rex_optional(w, false, false, dest.needs_rex());

        if imm.0 == 1 {
            self.emit_u8(0xD1);
            self.emit_modrm_opcode(op as u8, dest);
        } else {
            self.emit_u8(0xC1);
            self.emit_modrm_opcode(op as u8, dest);
            self.emit_u8(imm.uint8());
        }
    }

    fn emit_shift_r(&mut self, w: bool, op: ShiftOp, dest: Register) {
        self.emit_rex_optional(w, false, false, dest.needs_rex());
        self.emit_u8(0xD3);
        self.emit_modrm_opcode(op as u8, dest);
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Condition {
    Overflow,
    NoOverflow,
    Below,
    NeitherAboveNorEqual,
    NotBelow,
    AboveOrEqual,
    Equal,
    Zero,
    NotEqual,
    NotZero,
    BelowOrEqual,
    NotAbove,
    NeitherBelowNorEqual,
    Above,
    Sign,
    NoSign,
    Parity,
    ParityEven,
    NoParity,
    ParityOdd,
    Less,
    NeitherGreaterNorEqual,
    NotLess,
    GreaterOrEqual,
    LessOrEqual,
    NotGreater,
    NeitherLessNorEqual,
    Greater,
}

impl Condition {
    pub fn int(self) -> u8 {
        match self {
            Condition::Overflow => 0b0000,
            Condition::NoOverflow => 0b0001,
            Condition::Below | Condition::NeitherAboveNorEqual => 0b0010,
            Condition::NotBelow | Condition::AboveOrEqual => 0b0011,
            Condition::Equal | Condition::Zero => 0b0100,
            Condition::NotEqual | Condition::NotZero => 0b0101,
            Condition::BelowOrEqual | Condition::NotAbove => 0b0110,
            Condition::NeitherBelowNorEqual | Condition::Above => 0b0111,
            Condition::Sign => 0b1000,
            Condition::NoSign => 0b1001,
            Condition::Parity | Condition::ParityEven => 0b1010,
            Condition::NoParity | Condition::ParityOdd => 0b1011,
            Condition::Less | Condition::NeitherGreaterNorEqual => 0b1100,
            Condition::NotLess | Condition::GreaterOrEqual => 0b1101,
            Condition::LessOrEqual | Condition::NotGreater => 0b1110,
            Condition::NeitherLessNorEqual | Condition::Greater => 0b1111,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Immediate(pub i64);

impl Immediate {
    pub fn is_int8(&self) -> bool {
        let limit = 1i64 << 7;
        -limit <= self.0 && self.0 < limit
    }

    pub fn is_int16(&self) -> bool {
        let limit = 1i64 << 15;
        -limit <= self.0 && self.0 < limit
    }

    pub fn is_int32(&self) -> bool {
        let limit = 1i64 << 31;
        -limit <= self.0 && self.0 < limit
    }

    pub fn is_uint8(&self) -> bool {
        0 <= self.0 && self.0 < 256
    }

    pub fn is_uint16(&self) -> bool {
        0 <= self.0 && self.0 < 1 << 16
    }

    pub fn is_uint32(&self) -> bool {
        let limit = 1i64 << 32;
        0 <= self.0 && self.0 < limit
    }

    pub fn uint8(&self) -> u8 {
        self.0 as u8
    }

    pub fn int8(&self) -> i8 {
        self.0 as i8
    }

    pub fn int32(&self) -> i32 {
        self.0 as i32
    }

    pub fn uint32(&self) -> u32 {
        self.0 as u32
    }

    pub fn int64(&self) -> i64 {
        self.0
    }
}
