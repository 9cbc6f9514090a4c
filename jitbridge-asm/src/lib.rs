use byteorder::{ByteOrder, LittleEndian};

pub mod x64;

#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub struct Label(usize);

/// What a patched field in the finished code refers to.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum RelocKind {
    None,
    Internal,
    External,
    RuntimeCall,
    NarrowOop,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Relocation {
    pub offset: u32,
    pub kind: RelocKind,
    pub width: u8,
}

/// Finished output of an assembler: bytes, bound label offsets and the
/// relocations recorded while encoding.
pub struct MachineCode {
    code: Vec<u8>,
    labels: Vec<Option<u32>>,
    relocations: Vec<Relocation>,
}

impl MachineCode {
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn into_code(self) -> Vec<u8> {
        self.code
    }

    pub fn size(&self) -> usize {
        self.code.len()
    }

    pub fn offset(&self, lbl: Label) -> Option<u32> {
        let Label(idx) = lbl;
        self.labels[idx]
    }

    pub fn relocations(&self) -> &[Relocation] {
        &self.relocations
    }
}

struct AssemblerBuffer {
    code: Vec<u8>,
    position: usize,
    labels: Vec<Option<u32>>,
}

impl AssemblerBuffer {
    fn new() -> AssemblerBuffer {
        AssemblerBuffer {
            code: Vec::new(),
            position: 0,
            labels: Vec::new(),
        }
    }

    fn create_label(&mut self) -> Label {
        self.labels.push(None);

        Label(self.labels.len() - 1)
    }

    fn create_and_bind_label(&mut self) -> Label {
        let offset = self.position_u32();
        self.labels.push(Some(offset));
        Label(self.labels.len() - 1)
    }

    fn bind_label(&mut self, lbl: Label) -> u32 {
        let Label(idx) = lbl;
        assert!(self.labels[idx].is_none(), "label bound twice");
        let offset = self.position_u32();
        self.labels[idx] = Some(offset);
        offset
    }

    fn offset(&self, lbl: Label) -> Option<u32> {
        let Label(idx) = lbl;
        self.labels[idx]
    }

    fn position(&self) -> usize {
        self.position
    }

    fn position_u32(&self) -> u32 {
        assert!(self.position <= u32::MAX as usize, "code buffer too large");
        self.position as u32
    }

    fn set_position(&mut self, pos: usize) {
        assert!(pos <= self.code.len());
        self.position = pos;
    }

    fn set_position_end(&mut self) {
        self.position = self.code.len();
    }

    fn reserve(&mut self, bytes: usize) -> usize {
        let start = self.position;
        let end = start + bytes;
        if end > self.code.len() {
            self.code.resize(end, 0);
        }
        self.position = end;
        start
    }

    fn emit_u8(&mut self, value: u8) {
        let start = self.reserve(1);
        self.code[start] = value;
    }

    fn emit_u16(&mut self, value: u16) {
        let start = self.reserve(2);
        LittleEndian::write_u16(&mut self.code[start..start + 2], value);
    }

    fn emit_u32(&mut self, value: u32) {
        let start = self.reserve(4);
        LittleEndian::write_u32(&mut self.code[start..start + 4], value);
    }

    fn emit_u64(&mut self, value: u64) {
        let start = self.reserve(8);
        LittleEndian::write_u64(&mut self.code[start..start + 8], value);
    }

    fn patch_u8(&mut self, offset: usize, value: u8) {
        self.code[offset] = value;
    }

    fn patch_u32(&mut self, offset: usize, value: u32) {
        LittleEndian::write_u32(&mut self.code[offset..offset + 4], value);
    }

    fn into_machine_code(self, relocations: Vec<Relocation>) -> MachineCode {
        MachineCode {
            code: self.code,
            labels: self.labels,
            relocations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_overwrite() {
        let mut buf = AssemblerBuffer::new();
        buf.emit_u32(0x11223344);
        buf.emit_u8(0x55);
        buf.set_position(1);
        buf.emit_u16(0xAABB);
        buf.set_position_end();
        buf.emit_u8(0x66);
        assert_eq!(buf.code, vec![0x44, 0xBB, 0xAA, 0x11, 0x55, 0x66]);
    }

    #[test]
    fn test_labels() {
        let mut buf = AssemblerBuffer::new();
        let first = buf.create_label();
        buf.emit_u64(0);
        assert_eq!(buf.bind_label(first), 8);
        let second = buf.create_and_bind_label();
        assert_eq!(buf.offset(second), Some(8));

        let code = buf.into_machine_code(Vec::new());
        assert_eq!(code.offset(first), Some(8));
        assert_eq!(code.size(), 8);
    }

    #[test]
    #[should_panic(expected = "label bound twice")]
    fn test_bind_label_twice() {
        let mut buf = AssemblerBuffer::new();
        let lbl = buf.create_label();
        buf.bind_label(lbl);
        buf.bind_label(lbl);
    }
}
