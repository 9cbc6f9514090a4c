use crate::code::CodeBlob;

pub fn supported() -> bool {
    false
}

pub fn disassemble(_blob: &CodeBlob) {
    unreachable!();
}
