use std::io::{self, Write};

use capstone::prelude::*;

use crate::code::CodeBlob;

pub fn supported() -> bool {
    true
}

/// Prints the blob's instructions to stdout, marking every pc that has an
/// OopMap.
pub fn disassemble(blob: &CodeBlob) {
    let engine = match get_engine() {
        Ok(engine) => engine,
        Err(err) => {
            log::warn!("cannot create capstone engine: {}", err);
            return;
        }
    };

    let start_addr = blob.start();
    let instrs = match engine.disasm_all(blob.code(), start_addr) {
        Ok(instrs) => instrs,
        Err(err) => {
            log::warn!("could not disassemble {}: {}", blob.name(), err);
            return;
        }
    };

    let stdout = io::stdout();
    let mut w = stdout.lock();

    let _ = writeln!(
        &mut w,
        "blob {} {:#x} {:#x} frame={}",
        blob.name(),
        start_addr,
        blob.end(),
        blob.frame_size()
    );

    for instr in instrs.iter() {
        let offset = (instr.address() - start_addr) as u32;

        if let Some(map) = blob.oop_maps().find_map_at_offset(offset) {
            let _ = writeln!(
                &mut w,
                "\t\t  ; oop map: frame {} slots, {} entries",
                map.frame_size(),
                map.len()
            );
        }

        if Some(offset) == blob.frame_complete() {
            let _ = writeln!(&mut w, "\t\t  ; frame complete");
        }

        let _ = writeln!(
            &mut w,
            "  {:#06x}: {}\t\t{}",
            instr.address(),
            instr.mnemonic().unwrap_or("?"),
            instr.op_str().unwrap_or(""),
        );
    }

    let _ = writeln!(&mut w);
}

fn get_engine() -> CsResult<Capstone> {
    Capstone::new()
        .x86()
        .mode(arch::x86::ArchMode::Mode64)
        .syntax(arch::x86::ArchSyntax::Intel)
        .build()
}
