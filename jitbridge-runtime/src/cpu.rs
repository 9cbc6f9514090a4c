use lazy_static::lazy_static;
use std::sync::atomic::{Ordering, compiler_fence};

use jitbridge_asm::x64::{CpuFeatureSet, R13, R15, RBX, Register};

/// Current `JavaThread*` while running generated code.
pub const REG_THREAD: Register = R15;
/// `Method*` of the callee at adapter and wrapper entries.
pub const REG_METHOD: Register = RBX;
/// Interpreter's sender SP, passed from i2c and c2i transitions.
pub const REG_SENDER_SP: Register = R13;

/// Stack pointer alignment at call sites.
pub const STACK_FRAME_ALIGNMENT: usize = 16;

/// Boolean view of the host's x86 capabilities.
pub struct HostCpuFeatures;

impl HostCpuFeatures {
    pub fn detect() -> CpuFeatureSet {
        *HOST_FEATURES
    }
}

lazy_static! {
    static ref HOST_FEATURES: CpuFeatureSet = detect_features();
}

#[cfg(target_arch = "x86_64")]
fn detect_features() -> CpuFeatureSet {
    CpuFeatureSet {
        sse2: is_x86_feature_detected!("sse2"),
        ssse3: is_x86_feature_detected!("ssse3"),
        avx: is_x86_feature_detected!("avx"),
        avx2: is_x86_feature_detected!("avx2"),
        avx512f: is_x86_feature_detected!("avx512f"),
        avx512bw: is_x86_feature_detected!("avx512bw"),
        avx512dq: is_x86_feature_detected!("avx512dq"),
        avx512vl: is_x86_feature_detected!("avx512vl"),
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn detect_features() -> CpuFeatureSet {
    CpuFeatureSet::sse2()
}

pub fn flush_icache(_: *const u8, _: usize) {
    // no flushing needed on x86_64, but emit compiler barrier
    compiler_fence(Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(target_arch = "x86_64")]
    fn test_detect_baseline() {
        let features = HostCpuFeatures::detect();
        assert!(features.sse2);
        assert_eq!(features, HostCpuFeatures::detect());
        if features.avx2 {
            assert!(features.avx);
        }
    }
}
