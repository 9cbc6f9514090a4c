//! A small x86-64 interpreter that runs generated stubs against real host
//! memory. Instructions are decoded with `iced-x86` straight out of mapped
//! code regions; calls into registered host functions are dispatched to
//! Rust closures.

mod error;
mod exec;
mod machine;
pub mod memory;

pub use error::SimError;
pub use machine::{
    FLAG_CF, FLAG_OF, FLAG_PF, FLAG_SF, FLAG_ZF, HostAction, HostFn, MXCSR_DEFAULT, Machine,
    SimEnv, SimStack,
};
