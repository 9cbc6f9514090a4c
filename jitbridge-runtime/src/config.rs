use jitbridge_asm::x64::{CpuFeatureSet, EncodingProfile};

use crate::cpu::HostCpuFeatures;

/// Value of the safepoint state word while no safepoint is in progress.
pub const SAFEPOINT_NOT_SYNCHRONIZED: u32 = 0;

/// Switches read by the generators while emitting code.
#[derive(Clone, Debug)]
pub struct RuntimeFlags {
    /// 0: no SSE registers for Java arguments, 1: floats only, 2+: floats
    /// and doubles.
    pub use_sse: u32,
    pub use_stack_banging: bool,
    pub stack_shadow_pages: u32,
    pub page_size: u32,
    pub use_biased_locking: bool,
    /// Always take the monitor slow paths.
    pub use_heavy_monitors: bool,
    /// Use `mfence` instead of the serialize page after a native call.
    pub use_membar: bool,
    pub is_mp: bool,
    pub restore_mxcsr_on_jni_calls: bool,
    pub verify_fpu: bool,
    /// Print every installed blob through the disassembler.
    pub emit_stubs: bool,
}

impl Default for RuntimeFlags {
    fn default() -> RuntimeFlags {
        RuntimeFlags {
            use_sse: 2,
            use_stack_banging: true,
            stack_shadow_pages: 6,
            page_size: 4096,
            use_biased_locking: true,
            use_heavy_monitors: false,
            use_membar: false,
            is_mp: true,
            restore_mxcsr_on_jni_calls: false,
            verify_fpu: false,
            emit_stubs: false,
        }
    }
}

impl RuntimeFlags {
    /// Bytes below `rsp` that compiled code may touch without a check;
    /// `None` when the size does not fit in a displacement.
    pub fn checked_stack_shadow_size(&self) -> Option<i32> {
        self.stack_shadow_pages
            .checked_mul(self.page_size)
            .and_then(|size| i32::try_from(size).ok())
    }

    pub fn stack_shadow_size(&self) -> i32 {
        self.checked_stack_shadow_size()
            .unwrap_or_else(|| panic!("stack shadow size overflows"))
    }

    fn verify(&self) {
        assert!(
            self.page_size > 0 && self.page_size.is_power_of_two(),
            "page size {} is not a power of two",
            self.page_size
        );
        assert!(
            self.stack_shadow_pages > 0,
            "at least one stack shadow page is needed"
        );
        assert!(
            self.checked_stack_shadow_size().is_some(),
            "{} shadow pages of {} bytes overflow",
            self.stack_shadow_pages,
            self.page_size
        );
    }
}

/// Addresses of the runtime routines generated code calls or jumps to.
/// Zero means "not provided"; generators only reference the entries the
/// blob they build needs.
#[derive(Clone, Debug, Default)]
pub struct RuntimeEntries {
    pub ic_miss_stub: u64,
    pub fixup_callers_callsite: u64,
    pub complete_monitor_locking: u64,
    pub complete_monitor_unlocking: u64,
    pub check_special_condition_for_native_trans: u64,
    pub reguard_yellow_pages: u64,
    pub forward_exception: u64,
    pub fetch_unroll_info: u64,
    pub unpack_frames: u64,
    pub uncommon_trap: u64,
    pub safepoint_handler: u64,
    pub resolve_wrong_method: u64,
    pub resolve_ic_miss: u64,
    pub resolve_opt_virtual: u64,
    pub resolve_virtual: u64,
    pub resolve_static: u64,
    /// Return address inside the call stub, seen by i2c when the
    /// interpreter was entered from native code.
    pub call_stub_return_address: u64,
    pub call_stub_compiled_return: u64,
}

/// Addresses of VM-wide words polled by generated code.
#[derive(Clone, Debug, Default)]
pub struct VmGlobals {
    pub safepoint_state: u64,
    pub serialize_page: u64,
    pub mxcsr_std: u64,
}

/// Everything a generator needs to know about the VM it emits code for.
/// Built once and shared immutably.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub flags: RuntimeFlags,
    pub features: CpuFeatureSet,
    pub entries: RuntimeEntries,
    pub globals: VmGlobals,
    profile: EncodingProfile,
}

impl BridgeConfig {
    pub fn new(
        flags: RuntimeFlags,
        features: CpuFeatureSet,
        entries: RuntimeEntries,
        globals: VmGlobals,
    ) -> BridgeConfig {
        flags.verify();
        let profile = EncodingProfile::new(&features);

        BridgeConfig {
            flags,
            features,
            entries,
            globals,
            profile,
        }
    }

    /// Configuration for the machine we are running on.
    pub fn host(flags: RuntimeFlags, entries: RuntimeEntries, globals: VmGlobals) -> BridgeConfig {
        BridgeConfig::new(flags, HostCpuFeatures::detect(), entries, globals)
    }

    pub fn profile(&self) -> EncodingProfile {
        self.profile
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_sync<T: Send + Sync>() {}

    #[test]
    fn test_defaults() {
        let flags = RuntimeFlags::default();
        assert_eq!(flags.use_sse, 2);
        assert_eq!(flags.stack_shadow_size(), 6 * 4096);
        assert!(!flags.use_membar);
        assert_sync::<BridgeConfig>();
    }

    fn features() -> CpuFeatureSet {
        CpuFeatureSet::sse2()
    }

    #[test]
    fn test_stack_shadow_size_overflow() {
        let flags = RuntimeFlags {
            stack_shadow_pages: u32::MAX,
            ..RuntimeFlags::default()
        };
        assert_eq!(flags.checked_stack_shadow_size(), None);

        let flags = RuntimeFlags {
            stack_shadow_pages: 1 << 19,
            ..RuntimeFlags::default()
        };
        assert_eq!(flags.checked_stack_shadow_size(), None);
    }

    #[test]
    #[should_panic(expected = "overflow")]
    fn test_rejects_oversized_shadow() {
        let flags = RuntimeFlags {
            stack_shadow_pages: 1 << 20,
            ..RuntimeFlags::default()
        };
        BridgeConfig::new(flags, features(), RuntimeEntries::default(), VmGlobals::default());
    }

    #[test]
    #[should_panic(expected = "stack shadow page")]
    fn test_rejects_zero_shadow_pages() {
        let flags = RuntimeFlags {
            stack_shadow_pages: 0,
            ..RuntimeFlags::default()
        };
        BridgeConfig::new(flags, features(), RuntimeEntries::default(), VmGlobals::default());
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn test_rejects_odd_page_size() {
        let flags = RuntimeFlags {
            page_size: 3000,
            ..RuntimeFlags::default()
        };
        BridgeConfig::new(flags, features(), RuntimeEntries::default(), VmGlobals::default());
    }

    #[test]
    fn test_profile_from_features() {
        let config = BridgeConfig::new(
            RuntimeFlags::default(),
            CpuFeatureSet::sse2(),
            RuntimeEntries::default(),
            VmGlobals::default(),
        );
        assert!(!config.profile().supports_evex());
        assert_eq!(config.profile().use_avx(), 0);
    }
}
