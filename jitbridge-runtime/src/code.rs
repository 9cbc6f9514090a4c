use std::io;
use std::ptr;

use jitbridge_asm::{MachineCode, Relocation};
use thiserror::Error;

use crate::cpu::flush_icache;
use crate::disassembler;
use crate::oopmap::OopMapSet;

#[derive(Debug, Error)]
pub enum CodeError {
    #[error("blob {0} has no code")]
    Empty(String),
    #[error("mapping {size} bytes for code failed: {source}")]
    Mmap { size: usize, source: io::Error },
    #[error("protecting code failed: {0}")]
    Protect(io::Error),
}

fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    if size <= 0 { 4096 } else { size as usize }
}

/// Private mapping holding the instructions of one blob; read/execute
/// once installed.
struct CodeMemory {
    start: usize,
    size: usize,
}

impl CodeMemory {
    fn new(code: &[u8]) -> Result<CodeMemory, CodeError> {
        let page_size = page_size();
        let size = (code.len() + page_size - 1) & !(page_size - 1);

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(CodeError::Mmap {
                size,
                source: io::Error::last_os_error(),
            });
        }

        let memory = CodeMemory {
            start: ptr as usize,
            size,
        };

        unsafe {
            ptr::copy_nonoverlapping(code.as_ptr(), ptr as *mut u8, code.len());
        }

        let res = unsafe { libc::mprotect(ptr, size, libc::PROT_READ | libc::PROT_EXEC) };

        if res != 0 {
            return Err(CodeError::Protect(io::Error::last_os_error()));
        }

        flush_icache(ptr as *const u8, code.len());
        Ok(memory)
    }
}

impl Drop for CodeMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.start as *mut libc::c_void, self.size);
        }
    }
}

/// Installed generated code together with the metadata the runtime needs
/// to walk its frames.
pub struct CodeBlob {
    name: String,
    memory: CodeMemory,
    code_size: usize,
    frame_size: i32,
    frame_complete: Option<u32>,
    oop_maps: OopMapSet,
    relocations: Vec<Relocation>,
}

impl CodeBlob {
    /// `frame_size` is in words.
    pub fn install(
        name: &str,
        code: MachineCode,
        oop_maps: OopMapSet,
        frame_size: i32,
        frame_complete: Option<u32>,
        emit_stubs: bool,
    ) -> Result<CodeBlob, CodeError> {
        if code.size() == 0 {
            return Err(CodeError::Empty(name.into()));
        }

        let memory = CodeMemory::new(code.code())?;

        let blob = CodeBlob {
            name: name.into(),
            memory,
            code_size: code.size(),
            frame_size,
            frame_complete,
            oop_maps,
            relocations: code.relocations().to_vec(),
        };

        log::debug!(
            "installed {} at {:#x}: {} bytes, frame {} words",
            blob.name,
            blob.start(),
            blob.code_size,
            blob.frame_size
        );

        if emit_stubs && disassembler::supported() {
            disassembler::disassemble(&blob);
        }

        Ok(blob)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start(&self) -> u64 {
        self.memory.start as u64
    }

    pub fn end(&self) -> u64 {
        self.start() + self.code_size as u64
    }

    pub fn size(&self) -> usize {
        self.code_size
    }

    pub fn address_of(&self, offset: u32) -> u64 {
        assert!((offset as usize) < self.code_size, "offset outside of blob");
        self.start() + offset as u64
    }

    pub fn contains(&self, pc: u64) -> bool {
        self.start() <= pc && pc < self.end()
    }

    pub fn code(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.memory.start as *const u8, self.code_size) }
    }

    pub fn frame_size(&self) -> i32 {
        self.frame_size
    }

    pub fn frame_complete(&self) -> Option<u32> {
        self.frame_complete
    }

    pub fn oop_maps(&self) -> &OopMapSet {
        &self.oop_maps
    }

    pub fn relocations(&self) -> &[Relocation] {
        &self.relocations
    }
}
