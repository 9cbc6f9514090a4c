use std::cell::Cell;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;

use jitbridge_asm::MachineCode;
pub use jitbridge_asm::Label;
use jitbridge_asm::x64::{AssemblerX64, R10, R11, Register};

use crate::config::BridgeConfig;
use crate::oopmap::{OopMap, OopMapSet};

pub mod x64;

/// Registers generated code may clobber between two instructions without
/// telling anybody. Neither carries arguments in any convention used here.
pub static SCRATCH: [Register; 2] = [R10, R11];

/// Assembler plus the blob-level state the generators collect while
/// emitting: OopMaps keyed by code offset, and the configuration that
/// decides which instruction sequences to emit.
pub struct MacroAssembler<'a> {
    asm: AssemblerX64,
    config: &'a BridgeConfig,
    oop_maps: OopMapSet,
    scratch_registers: ScratchRegisters,
}

impl<'a> MacroAssembler<'a> {
    pub fn new(config: &'a BridgeConfig) -> MacroAssembler<'a> {
        MacroAssembler {
            asm: AssemblerX64::with_profile(config.profile()),
            config,
            oop_maps: OopMapSet::new(),
            scratch_registers: ScratchRegisters::new(),
        }
    }

    pub fn config(&self) -> &'a BridgeConfig {
        self.config
    }

    pub fn pos(&self) -> u32 {
        self.asm.position() as u32
    }

    /// Records `map` for the current position, i.e. the return address of
    /// the call just emitted.
    pub fn add_gc_map(&mut self, map: OopMap) {
        let pos = self.pos();
        self.oop_maps.add_gc_map(pos, map);
    }

    pub fn add_gc_map_at(&mut self, pos: u32, map: OopMap) {
        self.oop_maps.add_gc_map(pos, map);
    }

    pub fn get_scratch(&self) -> ScratchReg {
        self.scratch_registers.get()
    }

    pub fn finalize(self) -> (MachineCode, OopMapSet) {
        (self.asm.finalize(), self.oop_maps)
    }
}

impl<'a> Deref for MacroAssembler<'a> {
    type Target = AssemblerX64;

    fn deref(&self) -> &AssemblerX64 {
        &self.asm
    }
}

impl<'a> DerefMut for MacroAssembler<'a> {
    fn deref_mut(&mut self) -> &mut AssemblerX64 {
        &mut self.asm
    }
}

#[derive(Clone)]
pub struct ScratchRegisters {
    regs: &'static [Register],
    value: Rc<Cell<u32>>,
}

impl ScratchRegisters {
    pub fn new() -> ScratchRegisters {
        ScratchRegisters {
            regs: &SCRATCH,
            value: Rc::new(Cell::new(0)),
        }
    }

    #[cfg(test)]
    pub fn with_regs(regs: &'static [Register]) -> ScratchRegisters {
        ScratchRegisters {
            regs,
            value: Rc::new(Cell::new(0)),
        }
    }

    pub fn get(&self) -> ScratchReg {
        let value = self.value.get();

        for (ind, &reg) in self.regs.iter().enumerate() {
            if (value >> ind) & 1 == 0 {
                let bitmask = 1 << ind;
                self.value.set(value | bitmask);

                return ScratchReg {
                    ind: ind as u32,
                    reg,
                    scratch: self.clone(),
                };
            }
        }

        panic!("all scratch registers used");
    }

    fn free(&self, reg: &ScratchReg) {
        let value = self.value.get();
        let bitmask = !(1 << reg.ind);

        self.value.set(value & bitmask);
    }
}

pub struct ScratchReg {
    ind: u32,
    reg: Register,
    scratch: ScratchRegisters,
}

impl ScratchReg {
    pub fn reg(&self) -> Register {
        self.reg
    }
}

impl Drop for ScratchReg {
    fn drop(&mut self) {
        self.scratch.free(self);
    }
}

impl Deref for ScratchReg {
    type Target = Register;

    fn deref(&self) -> &Register {
        &self.reg
    }
}
