//! Object, class and method layouts as seen by generated code.

use std::mem::offset_of;
use std::sync::atomic::{AtomicUsize, Ordering};

// Low bits of the mark word.
pub const LOCK_MASK_IN_PLACE: usize = 0x3;
pub const UNLOCKED_VALUE: usize = 0x1;
pub const MONITOR_VALUE: usize = 0x2;
pub const BIASED_LOCK_MASK_IN_PLACE: usize = 0x7;
pub const BIASED_LOCK_PATTERN: usize = 0x5;
pub const AGE_MASK_IN_PLACE: usize = 0x78;
pub const EPOCH_MASK_IN_PLACE: usize = 0x180;

#[repr(C)]
pub struct ObjectHeader {
    mark: AtomicUsize,
    klass: AtomicUsize,
}

impl ObjectHeader {
    pub fn new(klass: &Klass) -> ObjectHeader {
        ObjectHeader {
            mark: AtomicUsize::new(klass.prototype_header()),
            klass: AtomicUsize::new(klass as *const Klass as usize),
        }
    }

    pub fn mark(&self) -> usize {
        self.mark.load(Ordering::SeqCst)
    }

    pub fn set_mark(&self, mark: usize) {
        self.mark.store(mark, Ordering::SeqCst);
    }

    pub fn cas_mark(&self, expected: usize, new: usize) -> Result<usize, usize> {
        self.mark
            .compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst)
    }

    pub fn klass(&self) -> usize {
        self.klass.load(Ordering::Relaxed)
    }

    pub fn mark_offset() -> i32 {
        offset_of!(ObjectHeader, mark) as i32
    }

    pub fn klass_offset() -> i32 {
        offset_of!(ObjectHeader, klass) as i32
    }
}

#[repr(C)]
pub struct Klass {
    prototype_header: AtomicUsize,
    java_mirror: AtomicUsize,
}

impl Klass {
    pub fn new(prototype_header: usize) -> Klass {
        Klass {
            prototype_header: AtomicUsize::new(prototype_header),
            java_mirror: AtomicUsize::new(0),
        }
    }

    pub fn prototype_header(&self) -> usize {
        self.prototype_header.load(Ordering::Relaxed)
    }

    pub fn set_java_mirror(&self, mirror: usize) {
        self.java_mirror.store(mirror, Ordering::Relaxed);
    }

    pub fn java_mirror(&self) -> usize {
        self.java_mirror.load(Ordering::Relaxed)
    }

    pub fn prototype_header_offset() -> i32 {
        offset_of!(Klass, prototype_header) as i32
    }

    pub fn java_mirror_offset() -> i32 {
        offset_of!(Klass, java_mirror) as i32
    }
}

/// The parts of a method the bridge reads: its entry points, compiled code
/// and holder class.
#[repr(C)]
pub struct Method {
    code: AtomicUsize,
    from_compiled_entry: AtomicUsize,
    from_interpreted_entry: AtomicUsize,
    interpreter_entry: AtomicUsize,
    native_function: AtomicUsize,
    method_holder: AtomicUsize,
}

impl Method {
    pub fn new() -> Method {
        Method {
            code: AtomicUsize::new(0),
            from_compiled_entry: AtomicUsize::new(0),
            from_interpreted_entry: AtomicUsize::new(0),
            interpreter_entry: AtomicUsize::new(0),
            native_function: AtomicUsize::new(0),
            method_holder: AtomicUsize::new(0),
        }
    }

    pub fn code(&self) -> usize {
        self.code.load(Ordering::Acquire)
    }

    pub fn set_code(&self, code: usize) {
        self.code.store(code, Ordering::Release);
    }

    pub fn from_compiled_entry(&self) -> usize {
        self.from_compiled_entry.load(Ordering::Acquire)
    }

    pub fn set_from_compiled_entry(&self, entry: usize) {
        self.from_compiled_entry.store(entry, Ordering::Release);
    }

    pub fn from_interpreted_entry(&self) -> usize {
        self.from_interpreted_entry.load(Ordering::Acquire)
    }

    pub fn set_from_interpreted_entry(&self, entry: usize) {
        self.from_interpreted_entry.store(entry, Ordering::Release);
    }

    pub fn interpreter_entry(&self) -> usize {
        self.interpreter_entry.load(Ordering::Acquire)
    }

    pub fn set_interpreter_entry(&self, entry: usize) {
        self.interpreter_entry.store(entry, Ordering::Release);
    }

    pub fn native_function(&self) -> usize {
        self.native_function.load(Ordering::Acquire)
    }

    pub fn set_native_function(&self, function: usize) {
        self.native_function.store(function, Ordering::Release);
    }

    pub fn method_holder(&self) -> usize {
        self.method_holder.load(Ordering::Relaxed)
    }

    pub fn set_method_holder(&self, klass: &Klass) {
        self.method_holder
            .store(klass as *const Klass as usize, Ordering::Relaxed);
    }

    pub fn code_offset() -> i32 {
        offset_of!(Method, code) as i32
    }

    pub fn from_compiled_entry_offset() -> i32 {
        offset_of!(Method, from_compiled_entry) as i32
    }

    pub fn from_interpreted_entry_offset() -> i32 {
        offset_of!(Method, from_interpreted_entry) as i32
    }

    pub fn interpreter_entry_offset() -> i32 {
        offset_of!(Method, interpreter_entry) as i32
    }

    pub fn native_function_offset() -> i32 {
        offset_of!(Method, native_function) as i32
    }

    pub fn method_holder_offset() -> i32 {
        offset_of!(Method, method_holder) as i32
    }
}

/// Passed in `rax` to an unverified entry: the method an inline cache was
/// resolved to and the receiver klass it expects.
#[repr(C)]
pub struct CompiledIcHolder {
    holder_method: usize,
    holder_klass: usize,
}

impl CompiledIcHolder {
    pub fn new(method: &Method, klass: &Klass) -> CompiledIcHolder {
        CompiledIcHolder {
            holder_method: method as *const Method as usize,
            holder_klass: klass as *const Klass as usize,
        }
    }

    pub fn holder_method_offset() -> i32 {
        offset_of!(CompiledIcHolder, holder_method) as i32
    }

    pub fn holder_klass_offset() -> i32 {
        offset_of!(CompiledIcHolder, holder_klass) as i32
    }
}

/// Stack-allocated lock record; holds the object's mark word while the
/// object is stack-locked.
#[repr(C)]
pub struct BasicLock {
    displaced_header: AtomicUsize,
}

impl BasicLock {
    pub fn new() -> BasicLock {
        BasicLock {
            displaced_header: AtomicUsize::new(0),
        }
    }

    pub fn displaced_header(&self) -> usize {
        self.displaced_header.load(Ordering::SeqCst)
    }

    pub fn set_displaced_header(&self, mark: usize) {
        self.displaced_header.store(mark, Ordering::SeqCst);
    }

    pub fn displaced_header_offset() -> i32 {
        offset_of!(BasicLock, displaced_header) as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        assert_eq!(ObjectHeader::mark_offset(), 0);
        assert_eq!(ObjectHeader::klass_offset(), 8);
        assert_eq!(BasicLock::displaced_header_offset(), 0);
        assert_eq!(Method::from_compiled_entry_offset(), 8);
        assert_eq!(std::mem::size_of::<Method>(), 48);
    }

    #[test]
    fn test_new_object_uses_prototype() {
        let klass = Klass::new(BIASED_LOCK_PATTERN);
        let obj = ObjectHeader::new(&klass);
        assert_eq!(obj.mark(), BIASED_LOCK_PATTERN);
        assert_eq!(obj.klass(), &klass as *const Klass as usize);

        assert_eq!(obj.cas_mark(UNLOCKED_VALUE, 0), Err(BIASED_LOCK_PATTERN));
        assert_eq!(obj.cas_mark(BIASED_LOCK_PATTERN, 0x1000), Ok(BIASED_LOCK_PATTERN));
        assert_eq!(obj.mark() & LOCK_MASK_IN_PLACE, 0);
    }
}
