use std::collections::HashMap;
use std::sync::Arc;

use iced_x86::{Decoder, DecoderOptions, Instruction};
use jitbridge_asm::x64::{RSP, Register, XmmRegister};
use parking_lot::RwLock;

use crate::SimError;
use crate::memory::{self, HOST_BASE};

const HOST_STRIDE: u64 = 16;
const DEFAULT_STEP_LIMIT: u64 = 2_000_000;
const DEFAULT_STACK_SIZE: usize = 1 << 20;

pub const FLAG_CF: u64 = 1 << 0;
pub const FLAG_PF: u64 = 1 << 2;
pub const FLAG_ZF: u64 = 1 << 6;
pub const FLAG_SF: u64 = 1 << 7;
pub const FLAG_OF: u64 = 1 << 11;
pub(crate) const FLAGS_ARITH: u64 = FLAG_CF | FLAG_PF | FLAG_ZF | FLAG_SF | FLAG_OF;
pub(crate) const FLAGS_FIXED: u64 = 1 << 1;

pub const MXCSR_DEFAULT: u32 = 0x1F80;

/// What the interpreter does after a host function returns.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum HostAction {
    /// Pop the return address like `ret`.
    Return,
    /// Stop `run` successfully.
    Halt,
    /// Continue at the given address without touching the stack.
    Jump(u64),
}

pub type HostFn = Arc<dyn Fn(&mut Machine) -> HostAction + Send + Sync>;

struct EnvInner {
    hosts: Vec<HostFn>,
    regions: Vec<(u64, u64)>,
}

/// Executable regions and host functions, shared by every `Machine`
/// created from it.
#[derive(Clone)]
pub struct SimEnv {
    inner: Arc<RwLock<EnvInner>>,
    halt: u64,
}

impl SimEnv {
    pub fn new() -> SimEnv {
        let halt: HostFn = Arc::new(|_: &mut Machine| HostAction::Halt);
        SimEnv {
            inner: Arc::new(RwLock::new(EnvInner {
                hosts: vec![halt],
                regions: Vec::new(),
            })),
            halt: HOST_BASE,
        }
    }

    /// Allows instructions to be fetched from `[start, start + len)`.
    pub fn map_code(&self, start: u64, len: usize) {
        self.inner.write().regions.push((start, start + len as u64));
    }

    /// Registers `f` and returns the address that calls it.
    pub fn register_host<F>(&self, f: F) -> u64
    where
        F: Fn(&mut Machine) -> HostAction + Send + Sync + 'static,
    {
        let mut inner = self.inner.write();
        inner.hosts.push(Arc::new(f));
        HOST_BASE + (inner.hosts.len() as u64 - 1) * HOST_STRIDE
    }

    /// Address that stops execution when reached.
    pub fn halt_address(&self) -> u64 {
        self.halt
    }

    fn host(&self, addr: u64) -> Option<HostFn> {
        if addr < HOST_BASE || (addr - HOST_BASE) % HOST_STRIDE != 0 {
            return None;
        }

        let idx = ((addr - HOST_BASE) / HOST_STRIDE) as usize;
        self.inner.read().hosts.get(idx).cloned()
    }

    fn code_end(&self, addr: u64) -> Option<u64> {
        self.inner
            .read()
            .regions
            .iter()
            .find(|&&(start, end)| start <= addr && addr < end)
            .map(|&(_, end)| end)
    }
}

impl Default for SimEnv {
    fn default() -> SimEnv {
        SimEnv::new()
    }
}

/// Owned stack memory for one simulated thread.
pub struct SimStack {
    memory: Vec<u64>,
}

impl SimStack {
    pub fn new(size: usize) -> SimStack {
        SimStack {
            memory: vec![0; size / 8],
        }
    }

    /// 16-byte aligned address one past the usable stack, leaving a small
    /// pad so stub code may read just above its entry frame.
    pub fn top(&self) -> u64 {
        let end = self.memory.as_ptr() as u64 + (self.memory.len() * 8) as u64;
        (end - 256) & !15
    }

    pub fn bottom(&self) -> u64 {
        self.memory.as_ptr() as u64
    }
}

/// Architectural state of one simulated x86-64 thread.
pub struct Machine {
    env: SimEnv,
    pub(crate) gpr: [u64; 16],
    pub(crate) xmm: [u128; 16],
    pub(crate) rflags: u64,
    pub(crate) mxcsr: u32,
    pub(crate) rip: u64,
    pub(crate) current: u64,
    steps: u64,
    step_limit: u64,
    icache: HashMap<u64, Instruction>,
    stack: SimStack,
}

impl Machine {
    pub fn new(env: &SimEnv) -> Machine {
        let stack = SimStack::new(DEFAULT_STACK_SIZE);
        let mut machine = Machine {
            env: env.clone(),
            gpr: [0; 16],
            xmm: [0; 16],
            rflags: FLAGS_FIXED,
            mxcsr: MXCSR_DEFAULT,
            rip: 0,
            current: 0,
            steps: 0,
            step_limit: DEFAULT_STEP_LIMIT,
            icache: HashMap::new(),
            stack,
        };
        machine.gpr[RSP.encoding() as usize] = machine.stack.top();
        machine
    }

    pub fn env(&self) -> &SimEnv {
        &self.env
    }

    pub fn stack(&self) -> &SimStack {
        &self.stack
    }

    pub fn reg(&self, reg: Register) -> u64 {
        self.gpr[reg.encoding() as usize]
    }

    pub fn set_reg(&mut self, reg: Register, value: u64) {
        self.gpr[reg.encoding() as usize] = value;
    }

    pub fn xmm(&self, reg: XmmRegister) -> u128 {
        self.xmm[reg.encoding() as usize]
    }

    pub fn set_xmm(&mut self, reg: XmmRegister, value: u128) {
        self.xmm[reg.encoding() as usize] = value;
    }

    pub fn xmm_f64(&self, reg: XmmRegister) -> f64 {
        f64::from_bits(self.xmm(reg) as u64)
    }

    pub fn xmm_f32(&self, reg: XmmRegister) -> f32 {
        f32::from_bits(self.xmm(reg) as u32)
    }

    pub fn rflags(&self) -> u64 {
        self.rflags
    }

    pub fn set_rflags(&mut self, value: u64) {
        self.rflags = (value & FLAGS_ARITH) | FLAGS_FIXED;
    }

    pub fn mxcsr(&self) -> u32 {
        self.mxcsr
    }

    pub fn set_mxcsr(&mut self, value: u32) {
        self.mxcsr = value;
    }

    pub fn rip(&self) -> u64 {
        self.rip
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn set_step_limit(&mut self, limit: u64) {
        self.step_limit = limit;
    }

    pub fn read_u8(&self, addr: u64) -> Result<u8, SimError> {
        memory::load(addr, 1).map(|v| v as u8)
    }

    pub fn read_u32(&self, addr: u64) -> Result<u32, SimError> {
        memory::load(addr, 4).map(|v| v as u32)
    }

    pub fn read_u64(&self, addr: u64) -> Result<u64, SimError> {
        memory::load(addr, 8)
    }

    pub fn write_u32(&mut self, addr: u64, value: u32) -> Result<(), SimError> {
        memory::store(addr, 4, value as u64)
    }

    pub fn write_u64(&mut self, addr: u64, value: u64) -> Result<(), SimError> {
        memory::store(addr, 8, value)
    }

    pub fn push(&mut self, value: u64) -> Result<(), SimError> {
        let sp = self.reg(RSP) - 8;
        memory::store(sp, 8, value)?;
        self.set_reg(RSP, sp);
        Ok(())
    }

    pub fn pop(&mut self) -> Result<u64, SimError> {
        let sp = self.reg(RSP);
        let value = memory::load(sp, 8)?;
        self.set_reg(RSP, sp + 8);
        Ok(value)
    }

    /// Reads the `idx`th stack word above the return address of a host
    /// function, i.e. its `idx`th stack-passed argument.
    pub fn stack_arg(&self, idx: usize) -> Result<u64, SimError> {
        memory::load(self.reg(RSP) + 8 + 8 * idx as u64, 8)
    }

    /// Calls `entry` like a function: pushes the halt address as return
    /// address and runs until it is reached.
    pub fn call(&mut self, entry: u64) -> Result<(), SimError> {
        let halt = self.env.halt_address();
        self.push(halt)?;
        self.run(entry)
    }

    /// Executes from `entry` until a host function halts.
    pub fn run(&mut self, entry: u64) -> Result<(), SimError> {
        self.rip = entry;

        loop {
            if self.steps >= self.step_limit {
                return Err(SimError::StepLimit(self.step_limit));
            }

            if let Some(host) = self.env.host(self.rip) {
                self.steps += 1;
                match host(self) {
                    HostAction::Return => {
                        self.rip = self.pop()?;
                    }
                    HostAction::Jump(target) => self.rip = target,
                    HostAction::Halt => return Ok(()),
                }
                continue;
            }

            let instr = self.fetch(self.rip)?;
            self.steps += 1;
            self.current = self.rip;
            self.rip = instr.next_ip();

            if let Some(target) = self.execute(&instr)? {
                self.rip = target;
            }
        }
    }

    fn fetch(&mut self, rip: u64) -> Result<Instruction, SimError> {
        if let Some(instr) = self.icache.get(&rip) {
            return Ok(*instr);
        }

        let end = self.env.code_end(rip).ok_or(SimError::NotExecutable(rip))?;
        let len = ((end - rip) as usize).min(15);
        let bytes = unsafe { std::slice::from_raw_parts(rip as *const u8, len) };

        let mut decoder = Decoder::with_ip(64, bytes, rip, DecoderOptions::NONE);
        let instr = decoder.decode();

        if instr.is_invalid() {
            return Err(SimError::InvalidInstruction(rip));
        }

        log::trace!("{:#x}: {}", rip, instr);
        self.icache.insert(rip, instr);
        Ok(instr)
    }
}
