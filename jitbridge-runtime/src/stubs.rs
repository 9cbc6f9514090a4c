//! Blobs shared by all compiled code: safepoint poll handlers, call
//! resolution stubs and the deoptimization blobs.

use jitbridge_asm::x64::{Address, Condition, Immediate, RAX, RBP, RBX, RDI, RSP};

use crate::code::{CodeBlob, CodeError};
use crate::config::BridgeConfig;
use crate::cpu::REG_THREAD;
use crate::deopt::{self, DeoptimizationBlob, UncommonTrapBlob};
use crate::masm::MacroAssembler;
use crate::register_saver::RegisterSaver;
use crate::thread::JavaThread;
use crate::WORD_SIZE;

/// Where the safepoint poll that enters a handler blob sits.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum PollType {
    /// Poll inside a method body; the interrupted pc is in
    /// `JavaThread::saved_exception_pc`.
    AtLoop,
    /// Poll at a return, after the frame was popped; the return address is
    /// on the stack.
    AtReturn,
}

/// Blob with a single entry that runs in its own register-saving frame.
pub struct RuntimeStub {
    blob: CodeBlob,
}

impl RuntimeStub {
    pub fn entry(&self) -> u64 {
        self.blob.start()
    }

    pub fn blob(&self) -> &CodeBlob {
        &self.blob
    }
}

/// Safepoint poll handler: blocks the thread in the runtime with every
/// register described by an OopMap, then resumes where the poll happened.
pub fn generate_handler_blob(
    config: &BridgeConfig,
    call_ptr: u64,
    poll_type: PollType,
) -> Result<RuntimeStub, CodeError> {
    let cause_return = poll_type == PollType::AtReturn;
    let mut masm = MacroAssembler::new(config);

    // room for the return address, patched below
    if !cause_return {
        masm.pushq_r(RBX);
    }

    let (map, frame_size_in_words) = RegisterSaver::save_live_registers(&mut masm, 0);

    masm.set_last_java_frame(None, None, None);

    // a frame walk must see the interrupted pc as return address
    if !cause_return {
        masm.movq_ra(
            RDI,
            Address::offset(REG_THREAD, JavaThread::saved_exception_pc_offset()),
        );
        masm.movq_ar(Address::offset(RBP, WORD_SIZE), RDI);
    }

    masm.pass_arguments(REG_THREAD, None);
    masm.call_runtime(call_ptr);
    // every saved register is visible to GC and deoptimization here
    masm.add_gc_map(map);

    masm.reset_last_java_frame(false);

    let no_exception = masm.create_label();
    masm.cmpq_ai(
        Address::offset(REG_THREAD, JavaThread::pending_exception_offset()),
        Immediate(0),
    );
    masm.jcc(Condition::Equal, no_exception);

    RegisterSaver::restore_live_registers(&mut masm, 0);
    masm.jump_runtime(config.entries.forward_exception);

    masm.bind_label(no_exception);
    RegisterSaver::restore_live_registers(&mut masm, 0);
    masm.retq();

    let (code, oop_maps) = masm.finalize();
    let name = if cause_return {
        "polling page return handler"
    } else {
        "polling page safepoint handler"
    };

    log::debug!(
        "{}: {} bytes, frame {} words",
        name,
        code.size(),
        frame_size_in_words
    );

    let blob = CodeBlob::install(
        name,
        code,
        oop_maps,
        frame_size_in_words,
        None,
        config.flags.emit_stubs,
    )?;

    Ok(RuntimeStub { blob })
}

/// Stub calling a resolver that returns the call target in `rax` and the
/// resolved method in `JavaThread::vm_result`. Jumps to the target with all
/// argument registers intact and the method in `rbx`.
pub fn generate_resolve_blob(
    config: &BridgeConfig,
    destination: u64,
    name: &str,
) -> Result<RuntimeStub, CodeError> {
    let mut masm = MacroAssembler::new(config);

    let (map, frame_size_in_words) = RegisterSaver::save_live_registers(&mut masm, 0);
    let frame_complete = masm.pos();

    masm.set_last_java_frame(None, None, None);
    masm.pass_arguments(REG_THREAD, None);
    masm.call_runtime(destination);
    // argument registers may hold oops across the call
    masm.add_gc_map(map);

    masm.reset_last_java_frame(false);

    let pending = masm.create_label();
    masm.cmpq_ai(
        Address::offset(REG_THREAD, JavaThread::pending_exception_offset()),
        Immediate(0),
    );
    masm.jcc(Condition::NotEqual, pending);

    let vm_result = Address::offset(REG_THREAD, JavaThread::vm_result_offset());
    masm.movq_ra(RBX, vm_result);
    masm.movq_ai(vm_result, Immediate(0));
    masm.movq_ar(
        Address::offset(RSP, RegisterSaver::rbx_offset_in_bytes()),
        RBX,
    );
    masm.movq_ar(
        Address::offset(RSP, RegisterSaver::rax_offset_in_bytes()),
        RAX,
    );
    RegisterSaver::restore_live_registers(&mut masm, 0);
    masm.jmp_r(RAX);

    masm.bind_label(pending);
    RegisterSaver::restore_live_registers(&mut masm, 0);
    // remove the activation and forward
    masm.movq_ai(vm_result, Immediate(0));
    masm.movq_ra(
        RAX,
        Address::offset(REG_THREAD, JavaThread::pending_exception_offset()),
    );
    masm.jump_runtime(config.entries.forward_exception);

    let (code, oop_maps) = masm.finalize();

    log::debug!(
        "{}: {} bytes, frame {} words",
        name,
        code.size(),
        frame_size_in_words
    );

    let blob = CodeBlob::install(
        name,
        code,
        oop_maps,
        frame_size_in_words,
        Some(frame_complete),
        config.flags.emit_stubs,
    )?;

    Ok(RuntimeStub { blob })
}

/// Every blob compiled code may be routed through, generated once per VM.
pub struct SharedStubs {
    pub deopt_blob: DeoptimizationBlob,
    pub uncommon_trap_blob: UncommonTrapBlob,
    pub polling_page_safepoint_handler: RuntimeStub,
    pub polling_page_return_handler: RuntimeStub,
    pub wrong_method: RuntimeStub,
    pub ic_miss: RuntimeStub,
    pub resolve_opt_virtual_call: RuntimeStub,
    pub resolve_virtual_call: RuntimeStub,
    pub resolve_static_call: RuntimeStub,
}

impl SharedStubs {
    pub fn generate(config: &BridgeConfig) -> Result<SharedStubs, CodeError> {
        let entries = &config.entries;

        let stubs = SharedStubs {
            deopt_blob: deopt::generate_deopt_blob(config)?,
            uncommon_trap_blob: deopt::generate_uncommon_trap_blob(config)?,
            polling_page_safepoint_handler: generate_handler_blob(
                config,
                entries.safepoint_handler,
                PollType::AtLoop,
            )?,
            polling_page_return_handler: generate_handler_blob(
                config,
                entries.safepoint_handler,
                PollType::AtReturn,
            )?,
            wrong_method: generate_resolve_blob(
                config,
                entries.resolve_wrong_method,
                "wrong_method_stub",
            )?,
            ic_miss: generate_resolve_blob(config, entries.resolve_ic_miss, "ic_miss_stub")?,
            resolve_opt_virtual_call: generate_resolve_blob(
                config,
                entries.resolve_opt_virtual,
                "resolve_opt_virtual_call",
            )?,
            resolve_virtual_call: generate_resolve_blob(
                config,
                entries.resolve_virtual,
                "resolve_virtual_call",
            )?,
            resolve_static_call: generate_resolve_blob(
                config,
                entries.resolve_static,
                "resolve_static_call",
            )?,
        };

        log::debug!("generated {} shared blobs", stubs.blobs().len());

        Ok(stubs)
    }

    pub fn blobs(&self) -> Vec<&CodeBlob> {
        vec![
            self.deopt_blob.blob(),
            self.uncommon_trap_blob.blob(),
            self.polling_page_safepoint_handler.blob(),
            self.polling_page_return_handler.blob(),
            self.wrong_method.blob(),
            self.ic_miss.blob(),
            self.resolve_opt_virtual_call.blob(),
            self.resolve_virtual_call.blob(),
            self.resolve_static_call.blob(),
        ]
    }

    /// The blob containing `pc`, for frame walks.
    pub fn find_blob(&self, pc: u64) -> Option<&CodeBlob> {
        self.blobs().into_iter().find(|blob| blob.contains(pc))
    }
}
