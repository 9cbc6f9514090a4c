use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SimError {
    #[error("no code mapped at {0:#x}")]
    NotExecutable(u64),

    #[error("cannot decode instruction at {0:#x}")]
    InvalidInstruction(u64),

    #[error("unsupported instruction `{text}` at {rip:#x}")]
    Unsupported { rip: u64, text: String },

    #[error("invalid memory access at {0:#x}")]
    InvalidAccess(u64),

    #[error("misaligned access at {addr:#x} (needs {align}-byte alignment)")]
    Misaligned { addr: u64, align: usize },

    #[error("trap instruction at {0:#x}")]
    Trap(u64),

    #[error("step limit of {0} instructions exceeded")]
    StepLimit(u64),
}
