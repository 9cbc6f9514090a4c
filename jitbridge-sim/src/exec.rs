use std::sync::atomic::{Ordering, fence};

use iced_x86::{Instruction, MemorySize, Mnemonic, OpKind, Register as IcedRegister};

use crate::machine::{
    FLAG_CF, FLAG_OF, FLAG_PF, FLAG_SF, FLAG_ZF, FLAGS_ARITH, FLAGS_FIXED, Machine,
};
use crate::memory::{self, mask, sign_extend};
use crate::SimError;

const RAX: usize = 0;
const RCX: usize = 1;
const RDX: usize = 2;
const RSP: usize = 4;
const RBP: usize = 5;

const FXSAVE_MXCSR: u64 = 24;
const FXSAVE_MXCSR_MASK: u64 = 28;
const FXSAVE_XMM: u64 = 160;
const FXSAVE_SIZE: u64 = 512;

fn gpr_slot(reg: IcedRegister) -> Option<(usize, usize)> {
    if !reg.is_gpr() {
        return None;
    }

    if matches!(
        reg,
        IcedRegister::AH | IcedRegister::CH | IcedRegister::DH | IcedRegister::BH
    ) {
        return None;
    }

    Some((reg.full_register().number(), reg.size()))
}

fn xmm_slot(reg: IcedRegister) -> Option<usize> {
    if reg.is_xmm() && reg.number() < 16 {
        Some(reg.number())
    } else {
        None
    }
}

fn memory_operand_size(instr: &Instruction) -> Option<usize> {
    match instr.memory_size() {
        MemorySize::UInt8 | MemorySize::Int8 => Some(1),
        MemorySize::UInt16 | MemorySize::Int16 => Some(2),
        MemorySize::UInt32 | MemorySize::Int32 | MemorySize::Float32 => Some(4),
        MemorySize::UInt64 | MemorySize::Int64 | MemorySize::Float64 => Some(8),
        _ => None,
    }
}

fn is_immediate(kind: OpKind) -> bool {
    matches!(
        kind,
        OpKind::Immediate8
            | OpKind::Immediate16
            | OpKind::Immediate32
            | OpKind::Immediate64
            | OpKind::Immediate8to16
            | OpKind::Immediate8to32
            | OpKind::Immediate8to64
            | OpKind::Immediate32to64
    )
}

fn parity(value: u64) -> bool {
    (value as u8).count_ones() % 2 == 0
}

/// Condition code (the low nibble of `jcc`) tested by a conditional
/// mnemonic.
fn condition_code(mnemonic: Mnemonic) -> Option<u8> {
    use Mnemonic::*;

    let cc = match mnemonic {
        Jo | Seto | Cmovo => 0,
        Jno | Setno | Cmovno => 1,
        Jb | Setb | Cmovb => 2,
        Jae | Setae | Cmovae => 3,
        Je | Sete | Cmove => 4,
        Jne | Setne | Cmovne => 5,
        Jbe | Setbe | Cmovbe => 6,
        Ja | Seta | Cmova => 7,
        Js | Sets | Cmovs => 8,
        Jns | Setns | Cmovns => 9,
        Jp | Setp | Cmovp => 10,
        Jnp | Setnp | Cmovnp => 11,
        Jl | Setl | Cmovl => 12,
        Jge | Setge | Cmovge => 13,
        Jle | Setle | Cmovle => 14,
        Jg | Setg | Cmovg => 15,
        _ => return None,
    };

    Some(cc)
}

fn is_jcc(mnemonic: Mnemonic) -> bool {
    use Mnemonic::*;
    matches!(
        mnemonic,
        Jo | Jno | Jb | Jae | Je | Jne | Jbe | Ja | Js | Jns | Jp | Jnp | Jl | Jge | Jle | Jg
    )
}

fn is_setcc(mnemonic: Mnemonic) -> bool {
    use Mnemonic::*;
    matches!(
        mnemonic,
        Seto | Setno
            | Setb
            | Setae
            | Sete
            | Setne
            | Setbe
            | Seta
            | Sets
            | Setns
            | Setp
            | Setnp
            | Setl
            | Setge
            | Setle
            | Setg
    )
}

impl Machine {
    fn unsupported(&self, instr: &Instruction) -> SimError {
        SimError::Unsupported {
            rip: self.current,
            text: format!("{}", instr),
        }
    }

    fn flag(&self, bit: u64) -> bool {
        self.rflags & bit != 0
    }

    fn set_flag(&mut self, bit: u64, value: bool) {
        if value {
            self.rflags |= bit;
        } else {
            self.rflags &= !bit;
        }
    }

    fn set_result_flags(&mut self, result: u64, size: usize) {
        let sign = 1u64 << (size * 8 - 1);
        self.set_flag(FLAG_ZF, result & mask(size) == 0);
        self.set_flag(FLAG_SF, result & sign != 0);
        self.set_flag(FLAG_PF, parity(result));
    }

    fn flags_add(&mut self, a: u64, b: u64, result: u64, size: usize) {
        let sign = 1u64 << (size * 8 - 1);
        let carry = (a as u128 + b as u128) > mask(size) as u128;
        self.set_flag(FLAG_CF, carry);
        self.set_flag(FLAG_OF, (a ^ result) & (b ^ result) & sign != 0);
        self.set_result_flags(result, size);
    }

    fn flags_sub(&mut self, a: u64, b: u64, result: u64, size: usize) {
        let sign = 1u64 << (size * 8 - 1);
        self.set_flag(FLAG_CF, a < b);
        self.set_flag(FLAG_OF, (a ^ b) & (a ^ result) & sign != 0);
        self.set_result_flags(result, size);
    }

    fn flags_logic(&mut self, result: u64, size: usize) {
        self.set_flag(FLAG_CF, false);
        self.set_flag(FLAG_OF, false);
        self.set_result_flags(result, size);
    }

    fn test_condition(&self, cc: u8) -> bool {
        let cf = self.flag(FLAG_CF);
        let zf = self.flag(FLAG_ZF);
        let sf = self.flag(FLAG_SF);
        let of = self.flag(FLAG_OF);
        let pf = self.flag(FLAG_PF);

        let result = match cc >> 1 {
            0 => of,
            1 => cf,
            2 => zf,
            3 => cf || zf,
            4 => sf,
            5 => pf,
            6 => sf != of,
            _ => zf || sf != of,
        };

        if cc & 1 == 0 { result } else { !result }
    }

    fn read_gpr(&self, instr: &Instruction, reg: IcedRegister) -> Result<u64, SimError> {
        let (idx, size) = gpr_slot(reg).ok_or_else(|| self.unsupported(instr))?;
        Ok(self.gpr[idx] & mask(size))
    }

    fn write_gpr(
        &mut self,
        instr: &Instruction,
        reg: IcedRegister,
        value: u64,
    ) -> Result<(), SimError> {
        let (idx, size) = gpr_slot(reg).ok_or_else(|| self.unsupported(instr))?;

        self.gpr[idx] = match size {
            8 => value,
            4 => value & 0xffff_ffff,
            _ => (self.gpr[idx] & !mask(size)) | (value & mask(size)),
        };

        Ok(())
    }

    fn xmm_operand(&self, instr: &Instruction, op: u32) -> Result<usize, SimError> {
        if instr.op_kind(op) != OpKind::Register {
            return Err(self.unsupported(instr));
        }

        xmm_slot(instr.op_register(op)).ok_or_else(|| self.unsupported(instr))
    }

    fn is_xmm_operand(instr: &Instruction, op: u32) -> bool {
        instr.op_kind(op) == OpKind::Register && instr.op_register(op).is_xmm()
    }

    fn effective_address(&self, instr: &Instruction) -> Result<u64, SimError> {
        let base = instr.memory_base();

        if base == IcedRegister::RIP {
            return Ok(instr.memory_displacement64());
        }

        let mut addr = instr.memory_displacement64();

        if base != IcedRegister::None {
            addr = addr.wrapping_add(self.read_gpr(instr, base)?);
        }

        let index = instr.memory_index();

        if index != IcedRegister::None {
            let scaled = self
                .read_gpr(instr, index)?
                .wrapping_mul(instr.memory_index_scale() as u64);
            addr = addr.wrapping_add(scaled);
        }

        Ok(addr)
    }

    fn dest_size(&self, instr: &Instruction) -> Result<usize, SimError> {
        match instr.op_kind(0) {
            OpKind::Register => Ok(instr.op_register(0).size()),
            OpKind::Memory => memory_operand_size(instr).ok_or_else(|| self.unsupported(instr)),
            _ => Err(self.unsupported(instr)),
        }
    }

    fn source_size(&self, instr: &Instruction, op: u32) -> Result<usize, SimError> {
        match instr.op_kind(op) {
            OpKind::Register => Ok(instr.op_register(op).size()),
            OpKind::Memory => memory_operand_size(instr).ok_or_else(|| self.unsupported(instr)),
            _ => Err(self.unsupported(instr)),
        }
    }

    fn read_operand(&self, instr: &Instruction, op: u32, size: usize) -> Result<u64, SimError> {
        match instr.op_kind(op) {
            OpKind::Register => self.read_gpr(instr, instr.op_register(op)),
            OpKind::Memory => memory::load(self.effective_address(instr)?, size),
            kind if is_immediate(kind) => Ok(instr.immediate(op) & mask(size)),
            _ => Err(self.unsupported(instr)),
        }
    }

    fn write_operand(
        &mut self,
        instr: &Instruction,
        op: u32,
        size: usize,
        value: u64,
    ) -> Result<(), SimError> {
        match instr.op_kind(op) {
            OpKind::Register => self.write_gpr(instr, instr.op_register(op), value),
            OpKind::Memory => memory::store(self.effective_address(instr)?, size, value),
            _ => Err(self.unsupported(instr)),
        }
    }

    fn push_value(&mut self, value: u64) -> Result<(), SimError> {
        let sp = self.gpr[RSP].wrapping_sub(8);
        memory::store(sp, 8, value)?;
        self.gpr[RSP] = sp;
        Ok(())
    }

    fn pop_value(&mut self) -> Result<u64, SimError> {
        let sp = self.gpr[RSP];
        let value = memory::load(sp, 8)?;
        self.gpr[RSP] = sp.wrapping_add(8);
        Ok(value)
    }

    fn branch_target(&self, instr: &Instruction) -> Result<u64, SimError> {
        match instr.op_kind(0) {
            OpKind::NearBranch64 => Ok(instr.near_branch_target()),
            OpKind::Register => self.read_gpr(instr, instr.op_register(0)),
            OpKind::Memory => memory::load(self.effective_address(instr)?, 8),
            _ => Err(self.unsupported(instr)),
        }
    }

    /// Executes one decoded instruction; `rip` already points past it.
    /// Returns the new `rip` when control is transferred.
    pub(crate) fn execute(&mut self, instr: &Instruction) -> Result<Option<u64>, SimError> {
        let mnemonic = instr.mnemonic();

        if is_jcc(mnemonic) {
            let cc = condition_code(mnemonic).ok_or_else(|| self.unsupported(instr))?;
            return if self.test_condition(cc) {
                Ok(Some(instr.near_branch_target()))
            } else {
                Ok(None)
            };
        }

        if is_setcc(mnemonic) {
            let cc = condition_code(mnemonic).ok_or_else(|| self.unsupported(instr))?;
            let value = self.test_condition(cc) as u64;
            self.write_operand(instr, 0, 1, value)?;
            return Ok(None);
        }

        if let Some(cc) = condition_code(mnemonic) {
            // cmovcc
            let size = self.dest_size(instr)?;
            let current = self.read_operand(instr, 0, size)?;
            let value = if self.test_condition(cc) {
                self.read_operand(instr, 1, size)?
            } else {
                current
            };
            self.write_operand(instr, 0, size, value)?;
            return Ok(None);
        }

        match mnemonic {
            Mnemonic::Nop
            | Mnemonic::Pause
            | Mnemonic::Lfence
            | Mnemonic::Sfence
            | Mnemonic::Vzeroupper => {}

            Mnemonic::Mfence => fence(Ordering::SeqCst),

            Mnemonic::Int3 | Mnemonic::Hlt | Mnemonic::Ud2 => {
                return Err(SimError::Trap(self.current));
            }

            Mnemonic::Push => {
                let value = self.read_operand(instr, 0, 8)?;
                self.push_value(value)?;
            }

            Mnemonic::Pop => {
                let value = self.pop_value()?;
                self.write_operand(instr, 0, 8, value)?;
            }

            Mnemonic::Pushfq => {
                let flags = (self.rflags & FLAGS_ARITH) | FLAGS_FIXED;
                self.push_value(flags)?;
            }

            Mnemonic::Popfq => {
                let flags = self.pop_value()?;
                self.rflags = (flags & FLAGS_ARITH) | FLAGS_FIXED;
            }

            Mnemonic::Call => {
                let target = self.branch_target(instr)?;
                let ret = self.rip;
                self.push_value(ret)?;
                return Ok(Some(target));
            }

            Mnemonic::Jmp => {
                return self.branch_target(instr).map(Some);
            }

            Mnemonic::Ret => {
                let target = self.pop_value()?;
                if instr.op_count() == 1 {
                    self.gpr[RSP] = self.gpr[RSP].wrapping_add(instr.immediate(0));
                }
                return Ok(Some(target));
            }

            Mnemonic::Leave => {
                self.gpr[RSP] = self.gpr[RBP];
                self.gpr[RBP] = self.pop_value()?;
            }

            Mnemonic::Mov => {
                let size = self.dest_size(instr)?;
                let value = self.read_operand(instr, 1, size)?;
                self.write_operand(instr, 0, size, value)?;
            }

            Mnemonic::Movzx => {
                let size = self.dest_size(instr)?;
                let src_size = self.source_size(instr, 1)?;
                let value = self.read_operand(instr, 1, src_size)?;
                self.write_operand(instr, 0, size, value)?;
            }

            Mnemonic::Movsx | Mnemonic::Movsxd => {
                let size = self.dest_size(instr)?;
                let src_size = self.source_size(instr, 1)?;
                let value = sign_extend(self.read_operand(instr, 1, src_size)?, src_size);
                self.write_operand(instr, 0, size, value & mask(size))?;
            }

            Mnemonic::Lea => {
                let addr = self.effective_address(instr)?;
                self.write_gpr(instr, instr.op_register(0), addr)?;
            }

            Mnemonic::Add | Mnemonic::Sub | Mnemonic::Cmp => {
                let size = self.dest_size(instr)?;
                let a = self.read_operand(instr, 0, size)?;
                let b = self.read_operand(instr, 1, size)?;

                if mnemonic == Mnemonic::Add {
                    let result = a.wrapping_add(b) & mask(size);
                    self.flags_add(a, b, result, size);
                    self.write_operand(instr, 0, size, result)?;
                } else {
                    let result = a.wrapping_sub(b) & mask(size);
                    self.flags_sub(a, b, result, size);
                    if mnemonic == Mnemonic::Sub {
                        self.write_operand(instr, 0, size, result)?;
                    }
                }
            }

            Mnemonic::And | Mnemonic::Or | Mnemonic::Xor | Mnemonic::Test => {
                let size = self.dest_size(instr)?;
                let a = self.read_operand(instr, 0, size)?;
                let b = self.read_operand(instr, 1, size)?;

                let result = match mnemonic {
                    Mnemonic::Or => a | b,
                    Mnemonic::Xor => a ^ b,
                    _ => a & b,
                };

                self.flags_logic(result, size);

                if mnemonic != Mnemonic::Test {
                    self.write_operand(instr, 0, size, result)?;
                }
            }

            Mnemonic::Inc | Mnemonic::Dec => {
                let size = self.dest_size(instr)?;
                let a = self.read_operand(instr, 0, size)?;
                let carry = self.flag(FLAG_CF);

                let result = if mnemonic == Mnemonic::Inc {
                    let result = a.wrapping_add(1) & mask(size);
                    self.flags_add(a, 1, result, size);
                    result
                } else {
                    let result = a.wrapping_sub(1) & mask(size);
                    self.flags_sub(a, 1, result, size);
                    result
                };

                self.set_flag(FLAG_CF, carry);
                self.write_operand(instr, 0, size, result)?;
            }

            Mnemonic::Neg => {
                let size = self.dest_size(instr)?;
                let a = self.read_operand(instr, 0, size)?;
                let result = 0u64.wrapping_sub(a) & mask(size);
                self.flags_sub(0, a, result, size);
                self.set_flag(FLAG_CF, a != 0);
                self.write_operand(instr, 0, size, result)?;
            }

            Mnemonic::Not => {
                let size = self.dest_size(instr)?;
                let a = self.read_operand(instr, 0, size)?;
                self.write_operand(instr, 0, size, !a & mask(size))?;
            }

            Mnemonic::Imul if instr.op_count() >= 2 => {
                let size = self.dest_size(instr)?;
                let (lhs, rhs) = if instr.op_count() == 3 {
                    (
                        self.read_operand(instr, 1, size)?,
                        self.read_operand(instr, 2, size)?,
                    )
                } else {
                    (
                        self.read_operand(instr, 0, size)?,
                        self.read_operand(instr, 1, size)?,
                    )
                };

                let lhs = sign_extend(lhs, size) as i64 as i128;
                let rhs = sign_extend(rhs, size) as i64 as i128;
                let full = lhs * rhs;
                let result = full as u64 & mask(size);
                let overflow = sign_extend(result, size) as i64 as i128 != full;

                self.set_flag(FLAG_CF, overflow);
                self.set_flag(FLAG_OF, overflow);
                self.set_result_flags(result, size);
                self.write_operand(instr, 0, size, result)?;
            }

            Mnemonic::Cdq => {
                let value = sign_extend(self.gpr[RAX] & 0xffff_ffff, 4);
                self.gpr[RDX] = value >> 32;
            }

            Mnemonic::Cqo => {
                self.gpr[RDX] = if (self.gpr[RAX] as i64) < 0 { u64::MAX } else { 0 };
            }

            Mnemonic::Shl | Mnemonic::Shr | Mnemonic::Sar => {
                let size = self.dest_size(instr)?;
                let bits = size as u32 * 8;
                let a = self.read_operand(instr, 0, size)?;
                let count = match instr.op_kind(1) {
                    OpKind::Register => self.gpr[RCX] & 0xff,
                    _ => instr.immediate(1),
                };
                let count = (count & if size == 8 { 63 } else { 31 }) as u32;

                if count == 0 {
                    return Ok(None);
                }

                let sign = 1u64 << (bits - 1);

                let (result, carry, overflow) = match mnemonic {
                    Mnemonic::Shl => {
                        let result = if count >= bits { 0 } else { (a << count) & mask(size) };
                        let carry = count <= bits && (a >> (bits - count)) & 1 != 0;
                        (result, carry, ((result & sign != 0) != carry) && count == 1)
                    }
                    Mnemonic::Shr => {
                        let result = if count >= bits { 0 } else { a >> count };
                        let carry = (a >> (count - 1).min(63)) & 1 != 0;
                        (result, carry, count == 1 && a & sign != 0)
                    }
                    _ => {
                        let signed = sign_extend(a, size) as i64;
                        let result = (signed >> count.min(63)) as u64 & mask(size);
                        let carry = (signed >> (count - 1).min(63)) & 1 != 0;
                        (result, carry, false)
                    }
                };

                self.set_flag(FLAG_CF, carry);
                self.set_flag(FLAG_OF, overflow);
                self.set_result_flags(result, size);
                self.write_operand(instr, 0, size, result)?;
            }

            Mnemonic::Xchg => {
                let size = self.dest_size(instr)?;
                let src = self.read_operand(instr, 1, size)?;

                let old = if instr.op_kind(0) == OpKind::Memory {
                    memory::swap(self.effective_address(instr)?, size, src)?
                } else {
                    let old = self.read_operand(instr, 0, size)?;
                    self.write_operand(instr, 0, size, src)?;
                    old
                };

                self.write_operand(instr, 1, size, old)?;
            }

            Mnemonic::Cmpxchg => {
                let size = self.dest_size(instr)?;
                let expected = self.gpr[RAX] & mask(size);
                let new = self.read_operand(instr, 1, size)?;

                let outcome = if instr.op_kind(0) == OpKind::Memory {
                    let addr = self.effective_address(instr)?;
                    if instr.has_lock_prefix() {
                        memory::compare_exchange(addr, size, expected, new)?
                    } else {
                        let current = memory::load(addr, size)?;
                        if current == expected {
                            memory::store(addr, size, new)?;
                            Ok(current)
                        } else {
                            Err(current)
                        }
                    }
                } else {
                    let current = self.read_operand(instr, 0, size)?;
                    if current == expected {
                        self.write_operand(instr, 0, size, new)?;
                        Ok(current)
                    } else {
                        Err(current)
                    }
                };

                let current = match outcome {
                    Ok(current) => current,
                    Err(current) => {
                        self.gpr[RAX] = current & mask(size);
                        current
                    }
                };

                let result = expected.wrapping_sub(current) & mask(size);
                self.flags_sub(expected, current, result, size);
            }

            Mnemonic::Xadd => {
                let size = self.dest_size(instr)?;
                let src = self.read_operand(instr, 1, size)?;

                let old = if instr.op_kind(0) == OpKind::Memory {
                    memory::fetch_add(self.effective_address(instr)?, size, src)?
                } else {
                    let old = self.read_operand(instr, 0, size)?;
                    self.write_operand(instr, 0, size, old.wrapping_add(src) & mask(size))?;
                    old
                };

                let result = old.wrapping_add(src) & mask(size);
                self.flags_add(old, src, result, size);
                self.write_operand(instr, 1, size, old)?;
            }

            Mnemonic::Movss | Mnemonic::Movsd if instr.op_count() == 2 => {
                let (size, lane) = if mnemonic == Mnemonic::Movss {
                    (4, 0xffff_ffffu128)
                } else {
                    (8, 0xffff_ffff_ffff_ffffu128)
                };
                self.scalar_move(instr, size, lane)?;
            }

            Mnemonic::Movd | Mnemonic::Movq => {
                let size = if mnemonic == Mnemonic::Movd { 4 } else { 8 };
                self.vector_gpr_move(instr, size)?;
            }

            Mnemonic::Movdqu
            | Mnemonic::Movdqa
            | Mnemonic::Movaps
            | Mnemonic::Movups
            | Mnemonic::Movapd
            | Mnemonic::Movupd => {
                let value = self.read_vector(instr, 1)?;
                self.write_vector(instr, 0, value)?;
            }

            Mnemonic::Xorps | Mnemonic::Xorpd | Mnemonic::Pxor => {
                let dest = self.xmm_operand(instr, 0)?;
                let value = self.read_vector(instr, 1)?;
                self.xmm[dest] ^= value;
            }

            Mnemonic::Ldmxcsr => {
                self.mxcsr = memory::load(self.effective_address(instr)?, 4)? as u32;
            }

            Mnemonic::Stmxcsr => {
                memory::store(self.effective_address(instr)?, 4, self.mxcsr as u64)?;
            }

            Mnemonic::Fxsave64 => {
                let area = self.fxsave_area(instr)?;
                let mut offset = 0;
                while offset < FXSAVE_SIZE {
                    memory::store(area + offset, 8, 0)?;
                    offset += 8;
                }
                // default x87 control word
                memory::store(area, 2, 0x037f)?;
                memory::store(area + FXSAVE_MXCSR, 4, self.mxcsr as u64)?;
                memory::store(area + FXSAVE_MXCSR_MASK, 4, 0xffff)?;
                for (idx, value) in self.xmm.iter().enumerate() {
                    memory::store128(area + FXSAVE_XMM + 16 * idx as u64, *value)?;
                }
            }

            Mnemonic::Fxrstor64 => {
                let area = self.fxsave_area(instr)?;
                self.mxcsr = memory::load(area + FXSAVE_MXCSR, 4)? as u32;
                for idx in 0..self.xmm.len() {
                    self.xmm[idx] = memory::load128(area + FXSAVE_XMM + 16 * idx as u64)?;
                }
            }

            _ => return Err(self.unsupported(instr)),
        }

        Ok(None)
    }

    fn fxsave_area(&self, instr: &Instruction) -> Result<u64, SimError> {
        let area = self.effective_address(instr)?;

        if area % 16 != 0 {
            return Err(SimError::Misaligned {
                addr: area,
                align: 16,
            });
        }

        Ok(area)
    }

    fn scalar_move(&mut self, instr: &Instruction, size: usize, lane: u128) -> Result<(), SimError> {
        match (instr.op_kind(0), instr.op_kind(1)) {
            (OpKind::Register, OpKind::Register) => {
                let dest = self.xmm_operand(instr, 0)?;
                let src = self.xmm_operand(instr, 1)?;
                self.xmm[dest] = (self.xmm[dest] & !lane) | (self.xmm[src] & lane);
            }

            (OpKind::Register, OpKind::Memory) => {
                let dest = self.xmm_operand(instr, 0)?;
                let value = memory::load(self.effective_address(instr)?, size)?;
                self.xmm[dest] = value as u128;
            }

            (OpKind::Memory, OpKind::Register) => {
                let src = self.xmm_operand(instr, 1)?;
                let value = (self.xmm[src] & lane) as u64;
                memory::store(self.effective_address(instr)?, size, value)?;
            }

            _ => return Err(self.unsupported(instr)),
        }

        Ok(())
    }

    fn vector_gpr_move(&mut self, instr: &Instruction, size: usize) -> Result<(), SimError> {
        if Machine::is_xmm_operand(instr, 0) {
            let dest = self.xmm_operand(instr, 0)?;
            let value = if Machine::is_xmm_operand(instr, 1) {
                self.xmm[self.xmm_operand(instr, 1)?] as u64 & mask(size)
            } else {
                self.read_operand(instr, 1, size)?
            };
            self.xmm[dest] = value as u128;
        } else {
            let src = self.xmm_operand(instr, 1)?;
            let value = self.xmm[src] as u64 & mask(size);
            self.write_operand(instr, 0, size, value)?;
        }

        Ok(())
    }

    fn read_vector(&self, instr: &Instruction, op: u32) -> Result<u128, SimError> {
        match instr.op_kind(op) {
            OpKind::Register => Ok(self.xmm[self.xmm_operand(instr, op)?]),
            OpKind::Memory => memory::load128(self.effective_address(instr)?),
            _ => Err(self.unsupported(instr)),
        }
    }

    fn write_vector(&mut self, instr: &Instruction, op: u32, value: u128) -> Result<(), SimError> {
        match instr.op_kind(op) {
            OpKind::Register => {
                let dest = self.xmm_operand(instr, op)?;
                self.xmm[dest] = value;
                Ok(())
            }
            OpKind::Memory => memory::store128(self.effective_address(instr)?, value),
            _ => Err(self.unsupported(instr)),
        }
    }
}
