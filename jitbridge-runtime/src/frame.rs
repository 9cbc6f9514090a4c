//! Frame shapes shared between generated code and the runtime.

use crate::WORD_SIZE;

// Interpreter frame, word offsets from rbp.
pub const INTERPRETER_FRAME_LAST_SP_OFFSET: i32 = -2;
pub const INTERPRETER_FRAME_SENDER_SP_OFFSET: i32 = -1;
pub const LINK_OFFSET: i32 = 0;
pub const RETURN_ADDR_OFFSET: i32 = 1;
pub const SENDER_SP_OFFSET: i32 = 2;

/// The interpreter keeps the compiled-code return entry for a call site one
/// word before the return address it pushed.
pub const INTERPRETER_RETURN_SENTINEL: i32 = -(WORD_SIZE);

pub fn interpreter_frame_last_sp() -> i32 {
    INTERPRETER_FRAME_LAST_SP_OFFSET * WORD_SIZE
}

pub fn interpreter_frame_sender_sp() -> i32 {
    INTERPRETER_FRAME_SENDER_SP_OFFSET * WORD_SIZE
}

/// Minimal frame of blobs that only call into the runtime: saved rbp and
/// the return address, in 4-byte slots.
pub struct SimpleRuntimeFrame;

impl SimpleRuntimeFrame {
    pub const RBP_OFF: i32 = 0;
    pub const RBP_OFF2: i32 = 1;
    pub const RETURN_OFF: i32 = 2;
    pub const RETURN_OFF2: i32 = 3;
    pub const FRAMESIZE: i32 = 4;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_frame_is_aligned() {
        assert_eq!(
            SimpleRuntimeFrame::FRAMESIZE % crate::STACK_ALIGNMENT_IN_SLOTS,
            0
        );
        assert_eq!(interpreter_frame_last_sp(), -16);
        assert_eq!(interpreter_frame_sender_sp(), -8);
    }
}
