use std::mem::offset_of;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering};

use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Copy, Clone, PartialEq, Eq, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum ThreadState {
    New = 2,
    InNative = 4,
    InNativeTrans = 5,
    InVm = 6,
    InVmTrans = 7,
    InJava = 8,
    InJavaTrans = 9,
    Blocked = 10,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum StackGuardState {
    Unused = 0,
    YellowDisabled = 1,
    Enabled = 2,
}

const JNI_HANDLE_BLOCK_SIZE: usize = 32;

/// Local references created by native code; generated code only resets
/// `top` after a native call returns.
#[repr(C)]
pub struct JniHandleBlock {
    top: AtomicI32,
    handles: [AtomicUsize; JNI_HANDLE_BLOCK_SIZE],
}

impl JniHandleBlock {
    pub fn new() -> JniHandleBlock {
        JniHandleBlock {
            top: AtomicI32::new(0),
            handles: std::array::from_fn(|_| AtomicUsize::new(0)),
        }
    }

    /// Stores `obj` in the next free handle and returns the handle's
    /// address, or `None` when the block is full.
    pub fn make_local(&self, obj: usize) -> Option<usize> {
        let top = self.top.load(Ordering::Relaxed) as usize;
        let handle = self.handles.get(top)?;
        handle.store(obj, Ordering::Relaxed);
        self.top.store(top as i32 + 1, Ordering::Relaxed);
        Some(handle as *const AtomicUsize as usize)
    }

    pub fn top(&self) -> i32 {
        self.top.load(Ordering::Relaxed)
    }

    pub fn top_offset() -> i32 {
        offset_of!(JniHandleBlock, top) as i32
    }
}

/// Per-thread state read and written by generated code through `r15`.
///
/// Aligned to 512 bytes so a thread pointer leaves the low mark word bits
/// (lock, biased, age and epoch) free when an object is biased toward it.
#[repr(C, align(512))]
pub struct JavaThread {
    thread_state: AtomicU32,
    suspend_flags: AtomicU32,
    stack_guard_state: AtomicU32,
    _padding: u32,
    last_java_sp: AtomicUsize,
    last_java_fp: AtomicUsize,
    last_java_pc: AtomicUsize,
    pending_exception: AtomicUsize,
    vm_result: AtomicUsize,
    callee_target: AtomicUsize,
    exception_oop: AtomicUsize,
    exception_pc: AtomicUsize,
    saved_exception_pc: AtomicUsize,
    active_handles: AtomicUsize,
    jni_environment: usize,
}

macro_rules! word_accessors {
    ($($field:ident, $setter:ident, $offset:ident;)*) => {
        $(
            pub fn $field(&self) -> usize {
                self.$field.load(Ordering::SeqCst)
            }

            pub fn $setter(&self, value: usize) {
                self.$field.store(value, Ordering::SeqCst);
            }

            pub fn $offset() -> i32 {
                offset_of!(JavaThread, $field) as i32
            }
        )*
    };
}

impl JavaThread {
    pub fn new() -> Box<JavaThread> {
        Box::new(JavaThread {
            thread_state: AtomicU32::new(ThreadState::InJava.into()),
            suspend_flags: AtomicU32::new(0),
            stack_guard_state: AtomicU32::new(StackGuardState::Enabled.into()),
            _padding: 0,
            last_java_sp: AtomicUsize::new(0),
            last_java_fp: AtomicUsize::new(0),
            last_java_pc: AtomicUsize::new(0),
            pending_exception: AtomicUsize::new(0),
            vm_result: AtomicUsize::new(0),
            callee_target: AtomicUsize::new(0),
            exception_oop: AtomicUsize::new(0),
            exception_pc: AtomicUsize::new(0),
            saved_exception_pc: AtomicUsize::new(0),
            active_handles: AtomicUsize::new(0),
            jni_environment: 0,
        })
    }

    pub fn address(&self) -> usize {
        self as *const JavaThread as usize
    }

    /// `JNIEnv*` handed to native methods: the address of the embedded
    /// environment.
    pub fn jni_environment(&self) -> usize {
        self.address() + JavaThread::jni_environment_offset() as usize
    }

    pub fn state(&self) -> Option<ThreadState> {
        ThreadState::try_from(self.thread_state.load(Ordering::SeqCst)).ok()
    }

    pub fn set_state(&self, state: ThreadState) {
        self.thread_state.store(state.into(), Ordering::SeqCst);
    }

    pub fn suspend_flags(&self) -> u32 {
        self.suspend_flags.load(Ordering::SeqCst)
    }

    pub fn set_suspend_flags(&self, flags: u32) {
        self.suspend_flags.store(flags, Ordering::SeqCst);
    }

    pub fn stack_guard_state(&self) -> Option<StackGuardState> {
        StackGuardState::try_from(self.stack_guard_state.load(Ordering::SeqCst)).ok()
    }

    pub fn set_stack_guard_state(&self, state: StackGuardState) {
        self.stack_guard_state.store(state.into(), Ordering::SeqCst);
    }

    pub fn set_active_handles(&self, block: &JniHandleBlock) {
        self.active_handles
            .store(block as *const JniHandleBlock as usize, Ordering::SeqCst);
    }

    word_accessors! {
        last_java_sp, set_last_java_sp, last_java_sp_offset;
        last_java_fp, set_last_java_fp, last_java_fp_offset;
        last_java_pc, set_last_java_pc, last_java_pc_offset;
        pending_exception, set_pending_exception, pending_exception_offset;
        vm_result, set_vm_result, vm_result_offset;
        callee_target, set_callee_target, callee_target_offset;
        exception_oop, set_exception_oop, exception_oop_offset;
        exception_pc, set_exception_pc, exception_pc_offset;
        saved_exception_pc, set_saved_exception_pc, saved_exception_pc_offset;
    }

    pub fn thread_state_offset() -> i32 {
        offset_of!(JavaThread, thread_state) as i32
    }

    pub fn suspend_flags_offset() -> i32 {
        offset_of!(JavaThread, suspend_flags) as i32
    }

    pub fn stack_guard_state_offset() -> i32 {
        offset_of!(JavaThread, stack_guard_state) as i32
    }

    pub fn active_handles_offset() -> i32 {
        offset_of!(JavaThread, active_handles) as i32
    }

    pub fn jni_environment_offset() -> i32 {
        offset_of!(JavaThread, jni_environment) as i32
    }
}
