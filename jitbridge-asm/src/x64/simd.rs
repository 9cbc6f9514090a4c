use crate::x64::{Address, AssemblerX64, FloatRegister, K0, KRegister, Register, XmmRegister};

/// Capability query used to pick instruction encodings.
pub trait CpuFeatures {
    fn supports_sse2(&self) -> bool;
    fn supports_ssse3(&self) -> bool;
    fn supports_avx(&self) -> bool;
    fn supports_avx2(&self) -> bool;
    fn supports_avx512f(&self) -> bool;
    fn supports_avx512bw(&self) -> bool;
    fn supports_avx512dq(&self) -> bool;
    fn supports_avx512vl(&self) -> bool;
}

#[derive(Copy, Clone, Default, Debug, PartialEq, Eq)]
pub struct CpuFeatureSet {
    pub sse2: bool,
    pub ssse3: bool,
    pub avx: bool,
    pub avx2: bool,
    pub avx512f: bool,
    pub avx512bw: bool,
    pub avx512dq: bool,
    pub avx512vl: bool,
}

impl CpuFeatureSet {
    pub fn sse2() -> CpuFeatureSet {
        CpuFeatureSet {
            sse2: true,
            ssse3: true,
            ..CpuFeatureSet::default()
        }
    }

    pub fn avx2() -> CpuFeatureSet {
        CpuFeatureSet {
            avx: true,
            avx2: true,
            ..CpuFeatureSet::sse2()
        }
    }

    pub fn avx512() -> CpuFeatureSet {
        CpuFeatureSet {
            avx512f: true,
            avx512bw: true,
            avx512dq: true,
            avx512vl: true,
            ..CpuFeatureSet::avx2()
        }
    }
}

impl CpuFeatures for CpuFeatureSet {
    fn supports_sse2(&self) -> bool {
        self.sse2
    }

    fn supports_ssse3(&self) -> bool {
        self.ssse3
    }

    fn supports_avx(&self) -> bool {
        self.avx
    }

    fn supports_avx2(&self) -> bool {
        self.avx2
    }

    fn supports_avx512f(&self) -> bool {
        self.avx512f
    }

    fn supports_avx512bw(&self) -> bool {
        self.avx512bw
    }

    fn supports_avx512dq(&self) -> bool {
        self.avx512dq
    }

    fn supports_avx512vl(&self) -> bool {
        self.avx512vl
    }
}

/// Encoding decisions derived once from the CPU features: the AVX level
/// and which AVX-512 instruction classes must fall back to VEX.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EncodingProfile {
    use_avx: u8,
    legacy_mode_bw: bool,
    legacy_mode_dq: bool,
    legacy_mode_vl: bool,
    legacy_mode_vlbw: bool,
}

impl EncodingProfile {
    pub fn new(features: &dyn CpuFeatures) -> EncodingProfile {
        let use_avx = if features.supports_avx512f() {
            3
        } else if features.supports_avx2() {
            2
        } else if features.supports_avx() {
            1
        } else {
            0
        };

        EncodingProfile {
            use_avx,
            legacy_mode_bw: !features.supports_avx512bw(),
            legacy_mode_dq: !features.supports_avx512dq(),
            legacy_mode_vl: !features.supports_avx512vl(),
            legacy_mode_vlbw: !(features.supports_avx512bw() && features.supports_avx512vl()),
        }
    }

    /// Caps the AVX level, like running with a lower `UseAVX`.
    pub fn limit_avx(mut self, max: u8) -> EncodingProfile {
        self.use_avx = self.use_avx.min(max);
        self
    }

    pub fn use_avx(&self) -> u8 {
        self.use_avx
    }

    pub fn supports_evex(&self) -> bool {
        self.use_avx > 2
    }

    pub fn legacy_mode_bw(&self) -> bool {
        self.legacy_mode_bw
    }

    pub fn legacy_mode_dq(&self) -> bool {
        self.legacy_mode_dq
    }

    pub fn legacy_mode_vl(&self) -> bool {
        self.legacy_mode_vl
    }

    pub fn legacy_mode_vlbw(&self) -> bool {
        self.legacy_mode_vlbw
    }

    /// Whether an instruction with these attributes has to be emitted in its
    /// VEX form even though EVEX is available.
    pub fn is_legacy(&self, attributes: &InstructionAttributes) -> bool {
        if !self.supports_evex() {
            return true;
        }

        let short_vector = attributes.vector_len != VectorLength::L512;

        match attributes.class {
            LegacyClass::Vex => true,
            LegacyClass::Foundation => {
                attributes.uses_vl && short_vector && self.legacy_mode_vl
            }
            LegacyClass::Bw => {
                self.legacy_mode_bw || (attributes.uses_vl && short_vector && self.legacy_mode_vlbw)
            }
            LegacyClass::Dq => {
                self.legacy_mode_dq || (attributes.uses_vl && short_vector && self.legacy_mode_vl)
            }
        }
    }
}

impl Default for EncodingProfile {
    fn default() -> EncodingProfile {
        EncodingProfile::new(&CpuFeatureSet::sse2())
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum VectorLength {
    L128,
    L256,
    L512,
}

impl VectorLength {
    fn bits(self) -> u8 {
        match self {
            VectorLength::L128 => 0,
            VectorLength::L256 => 1,
            VectorLength::L512 => 2,
        }
    }

    pub fn bytes(self) -> i32 {
        16 << self.bits()
    }
}

/// AVX-512 extension an instruction belongs to; decides when it falls back
/// to VEX. `Vex` instructions never use EVEX.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum LegacyClass {
    Foundation,
    Bw,
    Dq,
    Vex,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct InstructionAttributes {
    pub vector_len: VectorLength,
    pub vex_w: bool,
    pub evex_w: bool,
    pub class: LegacyClass,
    pub uses_vl: bool,
    pub mask: KRegister,
    pub zeroing: bool,
}

impl InstructionAttributes {
    pub fn new(vector_len: VectorLength, class: LegacyClass) -> InstructionAttributes {
        InstructionAttributes {
            vector_len,
            vex_w: false,
            evex_w: false,
            class,
            uses_vl: true,
            mask: K0,
            zeroing: false,
        }
    }

    /// Scalar instructions ignore the vector length extension.
    pub fn scalar(class: LegacyClass) -> InstructionAttributes {
        InstructionAttributes {
            uses_vl: false,
            ..InstructionAttributes::new(VectorLength::L128, class)
        }
    }

    pub fn evex_w(mut self, w: bool) -> InstructionAttributes {
        self.evex_w = w;
        self
    }

    pub fn vex_w(mut self, w: bool) -> InstructionAttributes {
        self.vex_w = w;
        self
    }

    pub fn masked(mut self, mask: KRegister, zeroing: bool) -> InstructionAttributes {
        self.mask = mask;
        self.zeroing = zeroing;
        self
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum SimdPrefix {
    None = 0,
    P66 = 1,
    PF3 = 2,
    PF2 = 3,
}

impl SimdPrefix {
    fn legacy_byte(self) -> Option<u8> {
        match self {
            SimdPrefix::None => None,
            SimdPrefix::P66 => Some(0x66),
            SimdPrefix::PF3 => Some(0xF3),
            SimdPrefix::PF2 => Some(0xF2),
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum OpcodeMap {
    M0F = 1,
    M0F38 = 2,
    M0F3A = 3,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum SimdEncoding {
    Legacy,
    Vex,
    Evex,
}

struct SimdOp {
    prefix: SimdPrefix,
    map: OpcodeMap,
    opcode: u8,
}

fn op(prefix: SimdPrefix, map: OpcodeMap, opcode: u8) -> SimdOp {
    SimdOp {
        prefix,
        map,
        opcode,
    }
}

impl AssemblerX64 {
    pub fn movss_rr(&mut self, dest: XmmRegister, src: XmmRegister) {
        self.emit_sse_rr(Some(0xF3), false, 0x10, dest.encoding(), src.encoding());
    }

    pub fn movss_ra(&mut self, dest: XmmRegister, src: Address) {
        self.emit_sse_ra(Some(0xF3), false, 0x10, dest.encoding(), &src);
    }

    pub fn movss_ar(&mut self, dest: Address, src: XmmRegister) {
        self.emit_sse_ra(Some(0xF3), false, 0x11, src.encoding(), &dest);
    }

    pub fn movsd_rr(&mut self, dest: XmmRegister, src: XmmRegister) {
        self.emit_sse_rr(Some(0xF2), false, 0x10, dest.encoding(), src.encoding());
    }

    pub fn movsd_ra(&mut self, dest: XmmRegister, src: Address) {
        self.emit_sse_ra(Some(0xF2), false, 0x10, dest.encoding(), &src);
    }

    pub fn movsd_ar(&mut self, dest: Address, src: XmmRegister) {
        self.emit_sse_ra(Some(0xF2), false, 0x11, src.encoding(), &dest);
    }

    pub fn movd_xr(&mut self, dest: XmmRegister, src: Register) {
        self.emit_sse_rr(Some(0x66), false, 0x6E, dest.encoding(), src.encoding());
    }

    pub fn movd_rx(&mut self, dest: Register, src: XmmRegister) {
        self.emit_sse_rr(Some(0x66), false, 0x7E, src.encoding(), dest.encoding());
    }

    pub fn movq_xr(&mut self, dest: XmmRegister, src: Register) {
        self.emit_sse_rr(Some(0x66), true, 0x6E, dest.encoding(), src.encoding());
    }

    pub fn movq_rx(&mut self, dest: Register, src: XmmRegister) {
        self.emit_sse_rr(Some(0x66), true, 0x7E, src.encoding(), dest.encoding());
    }

    pub fn movq_xa(&mut self, dest: XmmRegister, src: Address) {
        self.emit_sse_ra(Some(0xF3), false, 0x7E, dest.encoding(), &src);
    }

    pub fn movq_ax(&mut self, dest: Address, src: XmmRegister) {
        self.emit_sse_ra(Some(0x66), false, 0xD6, src.encoding(), &dest);
    }

    pub fn movdqu_ra(&mut self, dest: XmmRegister, src: Address) {
        self.emit_sse_ra(Some(0xF3), false, 0x6F, dest.encoding(), &src);
    }

    pub fn movdqu_ar(&mut self, dest: Address, src: XmmRegister) {
        self.emit_sse_ra(Some(0xF3), false, 0x7F, src.encoding(), &dest);
    }

    pub fn movdqa_ra(&mut self, dest: XmmRegister, src: Address) {
        self.emit_sse_ra(Some(0x66), false, 0x6F, dest.encoding(), &src);
    }

    pub fn movdqa_ar(&mut self, dest: Address, src: XmmRegister) {
        self.emit_sse_ra(Some(0x66), false, 0x7F, src.encoding(), &dest);
    }

    pub fn movaps_rr(&mut self, dest: XmmRegister, src: XmmRegister) {
        self.emit_sse_rr(None, false, 0x28, dest.encoding(), src.encoding());
    }

    pub fn addss_rr(&mut self, dest: XmmRegister, src: XmmRegister) {
        self.emit_sse_rr(Some(0xF3), false, 0x58, dest.encoding(), src.encoding());
    }

    pub fn addsd_rr(&mut self, dest: XmmRegister, src: XmmRegister) {
        self.emit_sse_rr(Some(0xF2), false, 0x58, dest.encoding(), src.encoding());
    }

    pub fn subss_rr(&mut self, dest: XmmRegister, src: XmmRegister) {
        self.emit_sse_rr(Some(0xF3), false, 0x5C, dest.encoding(), src.encoding());
    }

    pub fn subsd_rr(&mut self, dest: XmmRegister, src: XmmRegister) {
        self.emit_sse_rr(Some(0xF2), false, 0x5C, dest.encoding(), src.encoding());
    }

    pub fn mulss_rr(&mut self, dest: XmmRegister, src: XmmRegister) {
        self.emit_sse_rr(Some(0xF3), false, 0x59, dest.encoding(), src.encoding());
    }

    pub fn mulsd_rr(&mut self, dest: XmmRegister, src: XmmRegister) {
        self.emit_sse_rr(Some(0xF2), false, 0x59, dest.encoding(), src.encoding());
    }

    pub fn divss_rr(&mut self, dest: XmmRegister, src: XmmRegister) {
        self.emit_sse_rr(Some(0xF3), false, 0x5E, dest.encoding(), src.encoding());
    }

    pub fn divsd_rr(&mut self, dest: XmmRegister, src: XmmRegister) {
        self.emit_sse_rr(Some(0xF2), false, 0x5E, dest.encoding(), src.encoding());
    }

    pub fn sqrtss_rr(&mut self, dest: XmmRegister, src: XmmRegister) {
        self.emit_sse_rr(Some(0xF3), false, 0x51, dest.encoding(), src.encoding());
    }

    pub fn sqrtsd_rr(&mut self, dest: XmmRegister, src: XmmRegister) {
        self.emit_sse_rr(Some(0xF2), false, 0x51, dest.encoding(), src.encoding());
    }

    pub fn ucomiss_rr(&mut self, lhs: XmmRegister, rhs: XmmRegister) {
        self.emit_sse_rr(None, false, 0x2E, lhs.encoding(), rhs.encoding());
    }

    pub fn ucomisd_rr(&mut self, lhs: XmmRegister, rhs: XmmRegister) {
        self.emit_sse_rr(Some(0x66), false, 0x2E, lhs.encoding(), rhs.encoding());
    }

    pub fn xorps_rr(&mut self, dest: XmmRegister, src: XmmRegister) {
        self.emit_sse_rr(None, false, 0x57, dest.encoding(), src.encoding());
    }

    pub fn xorps_ra(&mut self, dest: XmmRegister, src: Address) {
        self.emit_sse_ra(None, false, 0x57, dest.encoding(), &src);
    }

    pub fn xorpd_rr(&mut self, dest: XmmRegister, src: XmmRegister) {
        self.emit_sse_rr(Some(0x66), false, 0x57, dest.encoding(), src.encoding());
    }

    pub fn xorpd_ra(&mut self, dest: XmmRegister, src: Address) {
        self.emit_sse_ra(Some(0x66), false, 0x57, dest.encoding(), &src);
    }

    pub fn pxor_rr(&mut self, dest: XmmRegister, src: XmmRegister) {
        self.emit_sse_rr(Some(0x66), false, 0xEF, dest.encoding(), src.encoding());
    }

    pub fn cvtsd2ss_rr(&mut self, dest: XmmRegister, src: XmmRegister) {
        self.emit_sse_rr(Some(0xF2), false, 0x5A, dest.encoding(), src.encoding());
    }

    pub fn cvtss2sd_rr(&mut self, dest: XmmRegister, src: XmmRegister) {
        self.emit_sse_rr(Some(0xF3), false, 0x5A, dest.encoding(), src.encoding());
    }

    pub fn cvtsi2ssd_rr(&mut self, dest: XmmRegister, src: Register) {
        self.emit_sse_rr(Some(0xF3), false, 0x2A, dest.encoding(), src.encoding());
    }

    pub fn cvtsi2ssq_rr(&mut self, dest: XmmRegister, src: Register) {
        self.emit_sse_rr(Some(0xF3), true, 0x2A, dest.encoding(), src.encoding());
    }

    pub fn cvtsi2sdd_rr(&mut self, dest: XmmRegister, src: Register) {
        self.emit_sse_rr(Some(0xF2), false, 0x2A, dest.encoding(), src.encoding());
    }

    pub fn cvtsi2sdq_rr(&mut self, dest: XmmRegister, src: Register) {
        self.emit_sse_rr(Some(0xF2), true, 0x2A, dest.encoding(), src.encoding());
    }

    pub fn cvttss2sid_rr(&mut self, dest: Register, src: XmmRegister) {
        self.emit_sse_rr(Some(0xF3), false, 0x2C, dest.encoding(), src.encoding());
    }

    pub fn cvttss2siq_rr(&mut self, dest: Register, src: XmmRegister) {
        self.emit_sse_rr(Some(0xF3), true, 0x2C, dest.encoding(), src.encoding());
    }

    pub fn cvttsd2sid_rr(&mut self, dest: Register, src: XmmRegister) {
        self.emit_sse_rr(Some(0xF2), false, 0x2C, dest.encoding(), src.encoding());
    }

    pub fn cvttsd2siq_rr(&mut self, dest: Register, src: XmmRegister) {
        self.emit_sse_rr(Some(0xF2), true, 0x2C, dest.encoding(), src.encoding());
    }

    pub fn ldmxcsr_a(&mut self, src: Address) {
        self.emit_rex_address_optional(false, 0, &src);
        self.emit_u8(0x0F);
        self.emit_u8(0xAE);
        self.emit_address(0b010, &src);
    }

    pub fn stmxcsr_a(&mut self, dest: Address) {
        self.emit_rex_address_optional(false, 0, &dest);
        self.emit_u8(0x0F);
        self.emit_u8(0xAE);
        self.emit_address(0b011, &dest);
    }

    /// Saves x87, MXCSR and xmm0-15 into a 16-byte aligned 512-byte area.
    pub fn fxsave64_a(&mut self, dest: Address) {
        self.emit_rex_address(true, 0, &dest);
        self.emit_u8(0x0F);
        self.emit_u8(0xAE);
        self.emit_address(0b000, &dest);
    }

    pub fn fxrstor64_a(&mut self, src: Address) {
        self.emit_rex_address(true, 0, &src);
        self.emit_u8(0x0F);
        self.emit_u8(0xAE);
        self.emit_address(0b001, &src);
    }

    pub fn fld_s(&mut self, src: FloatRegister) {
        self.emit_u8(0xD9);
        self.emit_u8(0xC0 + src.encoding());
    }

    pub fn fld_m32(&mut self, src: Address) {
        self.emit_rex_address_optional(false, 0, &src);
        self.emit_u8(0xD9);
        self.emit_address(0b000, &src);
    }

    pub fn fld_m64(&mut self, src: Address) {
        self.emit_rex_address_optional(false, 0, &src);
        self.emit_u8(0xDD);
        self.emit_address(0b000, &src);
    }

    pub fn fstp_s(&mut self, dest: FloatRegister) {
        self.emit_u8(0xDD);
        self.emit_u8(0xD8 + dest.encoding());
    }

    pub fn fstp_m32(&mut self, dest: Address) {
        self.emit_rex_address_optional(false, 0, &dest);
        self.emit_u8(0xD9);
        self.emit_address(0b011, &dest);
    }

    pub fn fstp_m64(&mut self, dest: Address) {
        self.emit_rex_address_optional(false, 0, &dest);
        self.emit_u8(0xDD);
        self.emit_address(0b011, &dest);
    }

    pub fn ffree(&mut self, reg: FloatRegister) {
        self.emit_u8(0xDD);
        self.emit_u8(0xC0 + reg.encoding());
    }

    pub fn fxch(&mut self, reg: FloatRegister) {
        self.emit_u8(0xD9);
        self.emit_u8(0xC8 + reg.encoding());
    }

    pub fn vmovdqu_rr(&mut self, dest: XmmRegister, src: XmmRegister, len: VectorLength) {
        let attributes = InstructionAttributes::new(len, LegacyClass::Vex);
        self.emit_simd_rr(
            op(SimdPrefix::PF3, OpcodeMap::M0F, 0x6F),
            dest.encoding(),
            None,
            src.encoding(),
            attributes,
        );
    }

    pub fn vmovdqu_ra(&mut self, dest: XmmRegister, src: Address, len: VectorLength) {
        let attributes = InstructionAttributes::new(len, LegacyClass::Vex);
        self.emit_simd_ra(
            op(SimdPrefix::PF3, OpcodeMap::M0F, 0x6F),
            dest.encoding(),
            None,
            &src,
            attributes,
        );
    }

    pub fn vmovdqu_ar(&mut self, dest: Address, src: XmmRegister, len: VectorLength) {
        let attributes = InstructionAttributes::new(len, LegacyClass::Vex);
        self.emit_simd_ra(
            op(SimdPrefix::PF3, OpcodeMap::M0F, 0x7F),
            src.encoding(),
            None,
            &dest,
            attributes,
        );
    }

    pub fn vaddss(&mut self, dest: XmmRegister, nds: XmmRegister, src: XmmRegister) {
        let attributes = InstructionAttributes::scalar(LegacyClass::Foundation);
        self.emit_simd_rrr(op(SimdPrefix::PF3, OpcodeMap::M0F, 0x58), dest, nds, src, attributes);
    }

    pub fn vaddsd(&mut self, dest: XmmRegister, nds: XmmRegister, src: XmmRegister) {
        let attributes = InstructionAttributes::scalar(LegacyClass::Foundation).evex_w(true);
        self.emit_simd_rrr(op(SimdPrefix::PF2, OpcodeMap::M0F, 0x58), dest, nds, src, attributes);
    }

    pub fn vaddps(
        &mut self,
        dest: XmmRegister,
        nds: XmmRegister,
        src: XmmRegister,
        len: VectorLength,
    ) {
        let attributes = InstructionAttributes::new(len, LegacyClass::Foundation);
        self.emit_simd_rrr(op(SimdPrefix::None, OpcodeMap::M0F, 0x58), dest, nds, src, attributes);
    }

    pub fn vaddpd(
        &mut self,
        dest: XmmRegister,
        nds: XmmRegister,
        src: XmmRegister,
        len: VectorLength,
    ) {
        let attributes = InstructionAttributes::new(len, LegacyClass::Foundation).evex_w(true);
        self.emit_simd_rrr(op(SimdPrefix::P66, OpcodeMap::M0F, 0x58), dest, nds, src, attributes);
    }

    pub fn vxorps(
        &mut self,
        dest: XmmRegister,
        nds: XmmRegister,
        src: XmmRegister,
        len: VectorLength,
    ) {
        let attributes = InstructionAttributes::new(len, LegacyClass::Dq);
        self.emit_simd_rrr(op(SimdPrefix::None, OpcodeMap::M0F, 0x57), dest, nds, src, attributes);
    }

    pub fn vxorpd(
        &mut self,
        dest: XmmRegister,
        nds: XmmRegister,
        src: XmmRegister,
        len: VectorLength,
    ) {
        let attributes = InstructionAttributes::new(len, LegacyClass::Dq).evex_w(true);
        self.emit_simd_rrr(op(SimdPrefix::P66, OpcodeMap::M0F, 0x57), dest, nds, src, attributes);
    }

    pub fn vpxor(
        &mut self,
        dest: XmmRegister,
        nds: XmmRegister,
        src: XmmRegister,
        len: VectorLength,
    ) {
        let attributes = InstructionAttributes::new(len, LegacyClass::Foundation);
        self.emit_simd_rrr(op(SimdPrefix::P66, OpcodeMap::M0F, 0xEF), dest, nds, src, attributes);
    }

    pub fn vpaddb(
        &mut self,
        dest: XmmRegister,
        nds: XmmRegister,
        src: XmmRegister,
        len: VectorLength,
    ) {
        let attributes = InstructionAttributes::new(len, LegacyClass::Bw);
        self.emit_simd_rrr(op(SimdPrefix::P66, OpcodeMap::M0F, 0xFC), dest, nds, src, attributes);
    }

    pub fn vpaddw(
        &mut self,
        dest: XmmRegister,
        nds: XmmRegister,
        src: XmmRegister,
        len: VectorLength,
    ) {
        let attributes = InstructionAttributes::new(len, LegacyClass::Bw);
        self.emit_simd_rrr(op(SimdPrefix::P66, OpcodeMap::M0F, 0xFD), dest, nds, src, attributes);
    }

    pub fn vpaddd(
        &mut self,
        dest: XmmRegister,
        nds: XmmRegister,
        src: XmmRegister,
        len: VectorLength,
    ) {
        let attributes = InstructionAttributes::new(len, LegacyClass::Foundation);
        self.emit_simd_rrr(op(SimdPrefix::P66, OpcodeMap::M0F, 0xFE), dest, nds, src, attributes);
    }

    pub fn vpaddd_ra(
        &mut self,
        dest: XmmRegister,
        nds: XmmRegister,
        src: Address,
        len: VectorLength,
    ) {
        let attributes = InstructionAttributes::new(len, LegacyClass::Foundation);
        self.emit_simd_ra(
            op(SimdPrefix::P66, OpcodeMap::M0F, 0xFE),
            dest.encoding(),
            Some(nds.encoding()),
            &src,
            attributes,
        );
    }

    pub fn vpaddq(
        &mut self,
        dest: XmmRegister,
        nds: XmmRegister,
        src: XmmRegister,
        len: VectorLength,
    ) {
        let attributes = InstructionAttributes::new(len, LegacyClass::Foundation).evex_w(true);
        self.emit_simd_rrr(op(SimdPrefix::P66, OpcodeMap::M0F, 0xD4), dest, nds, src, attributes);
    }

    /// Masked `vpaddd`; `merge` keeps unselected lanes, otherwise they are
    /// zeroed.
    pub fn evpaddd(
        &mut self,
        dest: XmmRegister,
        mask: KRegister,
        nds: XmmRegister,
        src: XmmRegister,
        merge: bool,
        len: VectorLength,
    ) {
        let attributes =
            InstructionAttributes::new(len, LegacyClass::Foundation).masked(mask, !merge);
        self.emit_simd_rrr(op(SimdPrefix::P66, OpcodeMap::M0F, 0xFE), dest, nds, src, attributes);
    }

    pub fn vpshufb(
        &mut self,
        dest: XmmRegister,
        nds: XmmRegister,
        src: XmmRegister,
        len: VectorLength,
    ) {
        let attributes = InstructionAttributes::new(len, LegacyClass::Bw);
        self.emit_simd_rrr(op(SimdPrefix::P66, OpcodeMap::M0F38, 0x00), dest, nds, src, attributes);
    }

    pub fn vbroadcastss(&mut self, dest: XmmRegister, src: XmmRegister, len: VectorLength) {
        // only the memory-source form exists on AVX1
        assert!(
            self.profile().use_avx() >= 2,
            "vbroadcastss from a register requires AVX2"
        );
        let attributes = InstructionAttributes::new(len, LegacyClass::Foundation);
        self.emit_simd_rr(
            op(SimdPrefix::P66, OpcodeMap::M0F38, 0x18),
            dest.encoding(),
            None,
            src.encoding(),
            attributes,
        );
    }

    pub fn vzeroupper(&mut self) {
        if self.profile().use_avx() > 0 {
            self.emit_u8(0xC5);
            self.emit_u8(0xF8);
            self.emit_u8(0x77);
        }
    }

    pub fn evmovdqub_ra(&mut self, dest: XmmRegister, src: Address, len: VectorLength) {
        self.emit_evmovdqu_load(SimdPrefix::PF2, false, LegacyClass::Bw, dest, src, len);
    }

    pub fn evmovdquw_ra(&mut self, dest: XmmRegister, src: Address, len: VectorLength) {
        self.emit_evmovdqu_load(SimdPrefix::PF2, true, LegacyClass::Bw, dest, src, len);
    }

    pub fn evmovdqul_ra(&mut self, dest: XmmRegister, src: Address, len: VectorLength) {
        self.emit_evmovdqu_load(SimdPrefix::PF3, false, LegacyClass::Foundation, dest, src, len);
    }

    pub fn evmovdquq_ra(&mut self, dest: XmmRegister, src: Address, len: VectorLength) {
        self.emit_evmovdqu_load(SimdPrefix::PF3, true, LegacyClass::Foundation, dest, src, len);
    }

    pub fn evmovdqub_ar(&mut self, dest: Address, src: XmmRegister, len: VectorLength) {
        self.emit_evmovdqu_store(SimdPrefix::PF2, false, LegacyClass::Bw, dest, src, len);
    }

    pub fn evmovdquw_ar(&mut self, dest: Address, src: XmmRegister, len: VectorLength) {
        self.emit_evmovdqu_store(SimdPrefix::PF2, true, LegacyClass::Bw, dest, src, len);
    }

    pub fn evmovdqul_ar(&mut self, dest: Address, src: XmmRegister, len: VectorLength) {
        self.emit_evmovdqu_store(SimdPrefix::PF3, false, LegacyClass::Foundation, dest, src, len);
    }

    pub fn evmovdquq_ar(&mut self, dest: Address, src: XmmRegister, len: VectorLength) {
        self.emit_evmovdqu_store(SimdPrefix::PF3, true, LegacyClass::Foundation, dest, src, len);
    }

    /// Byte compare into an opmask; only exists as EVEX.
    pub fn evpcmpeqb(
        &mut self,
        dest: KRegister,
        nds: XmmRegister,
        src: XmmRegister,
        len: VectorLength,
    ) {
        let attributes = InstructionAttributes::new(len, LegacyClass::Bw);
        assert!(
            !self.profile().is_legacy(&attributes),
            "evpcmpeqb requires AVX-512BW"
        );
        self.emit_simd_rr(
            op(SimdPrefix::P66, OpcodeMap::M0F, 0x74),
            dest.encoding(),
            Some(nds.encoding()),
            src.encoding(),
            attributes,
        );
    }

    pub fn kmovw_kr(&mut self, dest: KRegister, src: Register) {
        self.emit_kmov(SimdPrefix::None, false, 0x92, dest.encoding(), src.encoding());
    }

    pub fn kmovw_rk(&mut self, dest: Register, src: KRegister) {
        self.emit_kmov(SimdPrefix::None, false, 0x93, dest.encoding(), src.encoding());
    }

    pub fn kmovq_kr(&mut self, dest: KRegister, src: Register) {
        assert!(!self.profile().legacy_mode_bw(), "kmovq requires AVX-512BW");
        self.emit_kmov(SimdPrefix::PF2, true, 0x92, dest.encoding(), src.encoding());
    }

    pub fn kmovq_rk(&mut self, dest: Register, src: KRegister) {
        assert!(!self.profile().legacy_mode_bw(), "kmovq requires AVX-512BW");
        self.emit_kmov(SimdPrefix::PF2, true, 0x93, dest.encoding(), src.encoding());
    }

    pub fn kortestw(&mut self, lhs: KRegister, rhs: KRegister) {
        self.emit_kmov(SimdPrefix::None, false, 0x98, lhs.encoding(), rhs.encoding());
    }

    fn emit_kmov(&mut self, prefix: SimdPrefix, w: bool, opcode: u8, reg: u8, rm: u8) {
        assert!(self.profile().supports_evex(), "opmask instructions require AVX-512");
        self.emit_vex_prefix(
            reg & 0b1000 != 0,
            false,
            rm & 0b1000 != 0,
            w,
            0,
            VectorLength::L128,
            prefix,
            OpcodeMap::M0F,
        );
        self.emit_u8(opcode);
        self.emit_modrm(0b11, reg & 0b111, rm & 0b111);
    }

    fn emit_evmovdqu_load(
        &mut self,
        prefix: SimdPrefix,
        w: bool,
        class: LegacyClass,
        dest: XmmRegister,
        src: Address,
        len: VectorLength,
    ) {
        let attributes = InstructionAttributes::new(len, class).evex_w(w);
        if self.select_simd_encoding(&attributes, &[dest.encoding()]) == SimdEncoding::Evex {
            self.emit_simd_ra(
                op(prefix, OpcodeMap::M0F, 0x6F),
                dest.encoding(),
                None,
                &src,
                attributes,
            );
        } else {
            self.vmovdqu_ra(dest, src, len);
        }
    }

    fn emit_evmovdqu_store(
        &mut self,
        prefix: SimdPrefix,
        w: bool,
        class: LegacyClass,
        dest: Address,
        src: XmmRegister,
        len: VectorLength,
    ) {
        let attributes = InstructionAttributes::new(len, class).evex_w(w);
        if self.select_simd_encoding(&attributes, &[src.encoding()]) == SimdEncoding::Evex {
            self.emit_simd_ra(
                op(prefix, OpcodeMap::M0F, 0x7F),
                src.encoding(),
                None,
                &dest,
                attributes,
            );
        } else {
            self.vmovdqu_ar(dest, src, len);
        }
    }

    fn select_simd_encoding(
        &self,
        attributes: &InstructionAttributes,
        registers: &[u8],
    ) -> SimdEncoding {
        if self.profile().use_avx() == 0 {
            assert_eq!(
                attributes.vector_len,
                VectorLength::L128,
                "wide vectors require AVX"
            );
            assert!(registers.iter().all(|&reg| reg < 16), "xmm16-31 require EVEX");
            assert_eq!(attributes.mask, K0, "masking requires EVEX");
            return SimdEncoding::Legacy;
        }

        if !self.profile().is_legacy(attributes) {
            return SimdEncoding::Evex;
        }

        assert_ne!(
            attributes.vector_len,
            VectorLength::L512,
            "512-bit vectors require EVEX"
        );
        assert!(registers.iter().all(|&reg| reg < 16), "xmm16-31 require EVEX");
        assert_eq!(attributes.mask, K0, "masking requires EVEX");
        SimdEncoding::Vex
    }

    fn emit_simd_rrr(
        &mut self,
        op: SimdOp,
        dest: XmmRegister,
        nds: XmmRegister,
        src: XmmRegister,
        attributes: InstructionAttributes,
    ) {
        self.emit_simd_rr(op, dest.encoding(), Some(nds.encoding()), src.encoding(), attributes);
    }

    fn emit_simd_rr(
        &mut self,
        op: SimdOp,
        reg: u8,
        nds: Option<u8>,
        rm: u8,
        attributes: InstructionAttributes,
    ) {
        let nds_enc = nds.unwrap_or(0);

        match self.select_simd_encoding(&attributes, &[reg, nds_enc, rm]) {
            SimdEncoding::Legacy => {
                if let Some(nds) = nds {
                    assert_eq!(nds, reg, "SSE encoding requires dest == nds");
                }
                self.emit_legacy_simd_opcode(&op, reg & 0b1000 != 0, false, rm & 0b1000 != 0);
            }

            SimdEncoding::Vex => {
                self.emit_vex_prefix(
                    reg & 0b1000 != 0,
                    false,
                    rm & 0b1000 != 0,
                    attributes.vex_w,
                    nds_enc,
                    attributes.vector_len,
                    op.prefix,
                    op.map,
                );
                self.emit_u8(op.opcode);
            }

            SimdEncoding::Evex => {
                // register-direct rm: B extends bit 3, X extends bit 4
                self.emit_evex_prefix(
                    reg,
                    rm & 0b10000 != 0,
                    rm & 0b1000 != 0,
                    nds_enc,
                    &attributes,
                    op.prefix,
                    op.map,
                );
                self.emit_u8(op.opcode);
            }
        }

        self.emit_modrm(0b11, reg & 0b111, rm & 0b111);
    }

    fn emit_simd_ra(
        &mut self,
        op: SimdOp,
        reg: u8,
        nds: Option<u8>,
        address: &Address,
        attributes: InstructionAttributes,
    ) {
        let nds_enc = nds.unwrap_or(0);

        match self.select_simd_encoding(&attributes, &[reg, nds_enc]) {
            SimdEncoding::Legacy => {
                if let Some(nds) = nds {
                    assert_eq!(nds, reg, "SSE encoding requires dest == nds");
                }
                self.emit_legacy_simd_opcode(
                    &op,
                    reg & 0b1000 != 0,
                    address.rex_x(),
                    address.rex_b(),
                );
                self.emit_address(reg & 0b111, address);
            }

            SimdEncoding::Vex => {
                self.emit_vex_prefix(
                    reg & 0b1000 != 0,
                    address.rex_x(),
                    address.rex_b(),
                    attributes.vex_w,
                    nds_enc,
                    attributes.vector_len,
                    op.prefix,
                    op.map,
                );
                self.emit_u8(op.opcode);
                self.emit_address(reg & 0b111, address);
            }

            SimdEncoding::Evex => {
                self.emit_evex_prefix(
                    reg,
                    address.rex_x(),
                    address.rex_b(),
                    nds_enc,
                    &attributes,
                    op.prefix,
                    op.map,
                );
                self.emit_u8(op.opcode);
                self.emit_address_scaled(reg & 0b111, address, attributes.vector_len.bytes());
            }
        }
    }

    fn emit_legacy_simd_opcode(&mut self, op: &SimdOp, r: bool, x: bool, b: bool) {
        if let Some(byte) = op.prefix.legacy_byte() {
            self.emit_u8(byte);
        }
        self.emit_rex_optional(false, r, x, b);
        self.emit_u8(0x0F);
        match op.map {
            OpcodeMap::M0F => {}
            OpcodeMap::M0F38 => self.emit_u8(0x38),
            OpcodeMap::M0F3A => self.emit_u8(0x3A),
        }
        self.emit_u8(op.opcode);
    }

    fn emit_vex_prefix(
        &mut self,
        r: bool,
        x: bool,
        b: bool,
        w: bool,
        nds: u8,
        len: VectorLength,
        prefix: SimdPrefix,
        map: OpcodeMap,
    ) {
        let vvvv = (!nds & 0b1111) << 3;
        let tail = vvvv | len.bits() << 2 | prefix as u8;

        if !x && !b && !w && map == OpcodeMap::M0F {
            self.emit_u8(0xC5);
            self.emit_u8(((!r) as u8) << 7 | tail);
        } else {
            self.emit_u8(0xC4);
            self.emit_u8(((!r) as u8) << 7 | ((!x) as u8) << 6 | ((!b) as u8) << 5 | map as u8);
            self.emit_u8((w as u8) << 7 | tail);
        }
    }

    /// `reg` and `nds` are full 5-bit register encodings.
    fn emit_evex_prefix(
        &mut self,
        reg: u8,
        x: bool,
        b: bool,
        nds: u8,
        attributes: &InstructionAttributes,
        prefix: SimdPrefix,
        map: OpcodeMap,
    ) {
        let r = reg & 0b1000 != 0;
        let r_hi = reg & 0b10000 != 0;
        let v_hi = nds & 0b10000 != 0;

        let p0 = ((!r) as u8) << 7
            | ((!x) as u8) << 6
            | ((!b) as u8) << 5
            | ((!r_hi) as u8) << 4
            | map as u8;
        let p1 = (attributes.evex_w as u8) << 7 | (!nds & 0b1111) << 3 | 0b100 | prefix as u8;
        let p2 = (attributes.zeroing as u8) << 7
            | attributes.vector_len.bits() << 5
            | ((!v_hi) as u8) << 3
            | attributes.mask.encoding();

        self.emit_u8(0x62);
        self.emit_u8(p0);
        self.emit_u8(p1);
        self.emit_u8(p2);
    }

    fn emit_sse_rr(&mut self, prefix: Option<u8>, w: bool, opcode: u8, reg: u8, rm: u8) {
        assert!(reg < 16 && rm < 16, "xmm16-31 require EVEX");
        if let Some(prefix) = prefix {
            self.emit_u8(prefix);
        }
        self.emit_rex_optional(w, reg & 0b1000 != 0, false, rm & 0b1000 != 0);
        self.emit_u8(0x0F);
        self.emit_u8(opcode);
        self.emit_modrm(0b11, reg & 0b111, rm & 0b111);
    }

    fn emit_sse_ra(&mut self, prefix: Option<u8>, w: bool, opcode: u8, reg: u8, address: &Address) {
        assert!(reg < 16, "xmm16-31 require EVEX");
        if let Some(prefix) = prefix {
            self.emit_u8(prefix);
        }
        self.emit_rex_address_optional(w, reg, address);
        self.emit_u8(0x0F);
        self.emit_u8(opcode);
        self.emit_address(reg & 0b111, address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x64::tests::{compare_emitted, decode_one};
    use crate::x64::*;
    use iced_x86::Mnemonic;

    fn sse() -> EncodingProfile {
        EncodingProfile::default()
    }

    fn avx2() -> EncodingProfile {
        EncodingProfile::new(&CpuFeatureSet::avx2())
    }

    fn avx512() -> EncodingProfile {
        EncodingProfile::new(&CpuFeatureSet::avx512())
    }

    fn avx512_without_bw() -> EncodingProfile {
        EncodingProfile::new(&CpuFeatureSet {
            avx512bw: false,
            ..CpuFeatureSet::avx512()
        })
    }

    fn emit(profile: EncodingProfile, f: impl FnOnce(&mut AssemblerX64)) -> Vec<u8> {
        let mut asm = AssemblerX64::with_profile(profile);
        f(&mut asm);
        asm.finalize().into_code()
    }

    fn check(profile: EncodingProfile, expected: &[u8], f: impl FnOnce(&mut AssemblerX64)) {
        compare_emitted(expected, &emit(profile, f));
    }

    #[test]
    fn test_profile_from_features() {
        let profile = sse();
        assert_eq!(profile.use_avx(), 0);
        assert!(!profile.supports_evex());

        assert_eq!(avx2().use_avx(), 2);

        let profile = avx512_without_bw();
        assert_eq!(profile.use_avx(), 3);
        assert!(profile.legacy_mode_bw());
        assert!(profile.legacy_mode_vlbw());
        assert!(!profile.legacy_mode_dq());
        assert!(!profile.legacy_mode_vl());

        assert_eq!(avx512().limit_avx(2).use_avx(), 2);
    }

    #[test]
    fn test_legacy_sse() {
        check(sse(), &[0xf2, 0x0f, 0x10, 0x44, 0x24, 0x08], |a| {
            a.movsd_ra(XMM0, Address::offset(RSP, 8))
        });
        check(sse(), &[0xf3, 0x45, 0x0f, 0x11, 0x08], |a| {
            a.movss_ar(Address::reg(R8), XMM9)
        });
        check(sse(), &[0x66, 0x48, 0x0f, 0x6e, 0xc0], |a| a.movq_xr(XMM0, RAX));
        check(sse(), &[0x66, 0x48, 0x0f, 0x7e, 0xc8], |a| a.movq_rx(RAX, XMM1));
        check(sse(), &[0x66, 0x0f, 0x6e, 0xc9], |a| a.movd_xr(XMM1, RCX));
        check(sse(), &[0xf2, 0x0f, 0x58, 0xc1], |a| a.addsd_rr(XMM0, XMM1));
        check(sse(), &[0x66, 0x0f, 0x2e, 0xc1], |a| a.ucomisd_rr(XMM0, XMM1));
        check(sse(), &[0xf2, 0x48, 0x0f, 0x2a, 0xc0], |a| a.cvtsi2sdq_rr(XMM0, RAX));
        check(sse(), &[0xf2, 0x48, 0x0f, 0x2c, 0xc0], |a| a.cvttsd2siq_rr(RAX, XMM0));
        check(sse(), &[0x0f, 0x57, 0xc0], |a| a.xorps_rr(XMM0, XMM0));
        check(sse(), &[0x66, 0x45, 0x0f, 0xef, 0xc0], |a| a.pxor_rr(XMM8, XMM8));
        check(sse(), &[0xf3, 0x0f, 0x6f, 0x00], |a| a.movdqu_ra(XMM0, Address::reg(RAX)));
        check(sse(), &[0x0f, 0x28, 0xc8], |a| a.movaps_rr(XMM1, XMM0));
    }

    #[test]
    fn test_mxcsr_fxsave() {
        check(sse(), &[0x41, 0x0f, 0xae, 0x57, 0x08], |a| {
            a.ldmxcsr_a(Address::offset(R15, 8))
        });
        check(sse(), &[0x0f, 0xae, 0x1c, 0x24], |a| a.stmxcsr_a(Address::reg(RSP)));
        check(sse(), &[0x48, 0x0f, 0xae, 0x04, 0x24], |a| a.fxsave64_a(Address::reg(RSP)));
        check(sse(), &[0x48, 0x0f, 0xae, 0x0c, 0x24], |a| a.fxrstor64_a(Address::reg(RSP)));
    }

    #[test]
    fn test_x87() {
        check(sse(), &[0xdd, 0x04, 0x24], |a| a.fld_m64(Address::reg(RSP)));
        check(sse(), &[0xd9, 0x1c, 0x24], |a| a.fstp_m32(Address::reg(RSP)));
        check(sse(), &[0xdd, 0xc1], |a| a.ffree(ST1));
        check(sse(), &[0xdd, 0xd8], |a| a.fstp_s(ST0));
        check(sse(), &[0xd9, 0xc1], |a| a.fld_s(ST1));
    }

    #[test]
    fn test_legacy_tier_for_avx_forms() {
        check(sse(), &[0xf2, 0x0f, 0x58, 0xc1], |a| a.vaddsd(XMM0, XMM0, XMM1));
        check(sse(), &[0x66, 0x0f, 0xfe, 0xc1], |a| {
            a.vpaddd(XMM0, XMM0, XMM1, VectorLength::L128)
        });
        check(sse(), &[], |a| a.vzeroupper());
    }

    #[test]
    #[should_panic(expected = "SSE encoding requires dest == nds")]
    fn test_legacy_tier_needs_two_operand_form() {
        emit(sse(), |a| a.vaddsd(XMM0, XMM1, XMM2));
    }

    #[test]
    fn test_vex() {
        check(avx2(), &[0xc5, 0xf3, 0x58, 0xc2], |a| a.vaddsd(XMM0, XMM1, XMM2));
        check(avx2(), &[0xc5, 0xf4, 0x58, 0xc2], |a| {
            a.vaddps(XMM0, XMM1, XMM2, VectorLength::L256)
        });
        check(avx2(), &[0xc4, 0x41, 0x31, 0xef, 0xc2], |a| {
            a.vpxor(XMM8, XMM9, XMM10, VectorLength::L128)
        });
        check(avx2(), &[0xc5, 0xfe, 0x6f, 0x08], |a| {
            a.vmovdqu_ra(XMM1, Address::reg(RAX), VectorLength::L256)
        });
        check(avx2(), &[0xc4, 0xe2, 0x71, 0x00, 0xc2], |a| {
            a.vpshufb(XMM0, XMM1, XMM2, VectorLength::L128)
        });
        check(avx2(), &[0xc4, 0xe2, 0x7d, 0x18, 0xc1], |a| {
            a.vbroadcastss(XMM0, XMM1, VectorLength::L256)
        });
        check(avx2(), &[0xc5, 0xf8, 0x77], |a| a.vzeroupper());
    }

    #[test]
    #[should_panic(expected = "requires AVX2")]
    fn test_vbroadcastss_register_needs_avx2() {
        emit(avx2().limit_avx(1), |a| {
            a.vbroadcastss(XMM0, XMM1, VectorLength::L128)
        });
    }

    #[test]
    #[should_panic(expected = "512-bit vectors require EVEX")]
    fn test_vex_rejects_512() {
        emit(avx2(), |a| a.vpaddd(XMM0, XMM1, XMM2, VectorLength::L512));
    }

    #[test]
    #[should_panic(expected = "xmm16-31 require EVEX")]
    fn test_vex_rejects_high_registers() {
        emit(avx2(), |a| a.vpaddd(XMM16, XMM1, XMM2, VectorLength::L256));
    }

    #[test]
    fn test_evex() {
        check(avx512(), &[0x62, 0xf1, 0x75, 0x48, 0xfe, 0xc2], |a| {
            a.vpaddd(XMM0, XMM1, XMM2, VectorLength::L512)
        });
        check(avx512(), &[0x62, 0xa1, 0x75, 0x40, 0xfe, 0xc2], |a| {
            a.vpaddd(XMM16, XMM17, XMM18, VectorLength::L512)
        });
        check(avx512(), &[0x62, 0xf1, 0x75, 0xc9, 0xfe, 0xc2], |a| {
            a.evpaddd(XMM0, K1, XMM1, XMM2, false, VectorLength::L512)
        });
        check(avx512(), &[0x62, 0xf1, 0xf5, 0x48, 0xd4, 0xc2], |a| {
            a.vpaddq(XMM0, XMM1, XMM2, VectorLength::L512)
        });
        check(avx512(), &[0x62, 0xf1, 0x7e, 0x48, 0x6f, 0x40, 0x01], |a| {
            a.evmovdqul_ra(XMM0, Address::offset(RAX, 64), VectorLength::L512)
        });
        check(avx512(), &[0x62, 0xf1, 0x7f, 0x48, 0x6f, 0x00], |a| {
            a.evmovdqub_ra(XMM0, Address::reg(RAX), VectorLength::L512)
        });
        check(avx512(), &[0x62, 0xf1, 0x7d, 0x48, 0x74, 0xc9], |a| {
            a.evpcmpeqb(K1, XMM0, XMM1, VectorLength::L512)
        });
    }

    #[test]
    fn test_opmask() {
        check(avx512(), &[0xc5, 0xf8, 0x92, 0xc8], |a| a.kmovw_kr(K1, RAX));
        check(avx512(), &[0xc5, 0xf8, 0x93, 0xc1], |a| a.kmovw_rk(RAX, K1));
        check(avx512(), &[0xc4, 0xe1, 0xfb, 0x92, 0xc8], |a| a.kmovq_kr(K1, RAX));
        check(avx512(), &[0xc5, 0xf8, 0x98, 0xca], |a| a.kortestw(K1, K2));
    }

    #[test]
    fn test_legacy_mode_fallback() {
        // BW instructions fall back to VEX when AVX-512BW is missing
        check(avx512_without_bw(), &[0xc5, 0xf5, 0xfc, 0xc2], |a| {
            a.vpaddb(XMM0, XMM1, XMM2, VectorLength::L256)
        });
        check(avx512_without_bw(), &[0xc5, 0xfe, 0x6f, 0x00], |a| {
            a.evmovdqub_ra(XMM0, Address::reg(RAX), VectorLength::L256)
        });

        // DQ instructions without AVX-512DQ
        let no_dq = EncodingProfile::new(&CpuFeatureSet {
            avx512dq: false,
            ..CpuFeatureSet::avx512()
        });
        check(no_dq, &[0xc5, 0xf4, 0x57, 0xc2], |a| {
            a.vxorps(XMM0, XMM1, XMM2, VectorLength::L256)
        });

        // foundation instructions still use EVEX
        check(avx512_without_bw(), &[0x62, 0xf1, 0x75, 0x48, 0xfe, 0xc2], |a| {
            a.vpaddd(XMM0, XMM1, XMM2, VectorLength::L512)
        });
    }

    #[test]
    #[should_panic(expected = "512-bit vectors require EVEX")]
    fn test_legacy_mode_fallback_rejects_512() {
        emit(avx512_without_bw(), |a| {
            a.evmovdqub_ra(XMM0, Address::reg(RAX), VectorLength::L512)
        });
    }

    #[test]
    #[should_panic(expected = "evpcmpeqb requires AVX-512BW")]
    fn test_evex_only_without_extension() {
        emit(avx512_without_bw(), |a| {
            a.evpcmpeqb(K1, XMM0, XMM1, VectorLength::L512)
        });
    }

    #[test]
    fn test_evex_round_trip() {
        let lens = [VectorLength::L128, VectorLength::L256, VectorLength::L512];

        for reg in [0u8, 7, 8, 15, 16, 23, 24, 31] {
            for nds in [0u8, 9, 17, 31] {
                for rm in [1u8, 8, 16, 25] {
                    for len in lens {
                        let code = emit(avx512(), |a| {
                            a.vpaddd(
                                XmmRegister::new(reg),
                                XmmRegister::new(nds),
                                XmmRegister::new(rm),
                                len,
                            )
                        });
                        let instruction = decode_one(&code);
                        assert_eq!(instruction.mnemonic(), Mnemonic::Vpaddd);
                        assert_eq!(instruction.op0_register().number(), reg as usize);
                        assert_eq!(instruction.op1_register().number(), nds as usize);
                        assert_eq!(instruction.op2_register().number(), rm as usize);

                        let size = instruction.op0_register().size();
                        assert_eq!(size as i32, len.bytes());
                    }
                }
            }
        }
    }

    #[test]
    fn test_evex_memory_round_trip() {
        for disp in [0, 64, 128, -64, 8, 4096, 64 * 127, 64 * 128] {
            for base in [RAX, RSP, RBP, R12, R13] {
                let code = emit(avx512(), |a| {
                    a.vpaddd_ra(XmmRegister::new(20), XMM3, Address::offset(base, disp), VectorLength::L512)
                });
                let instruction = decode_one(&code);
                assert_eq!(instruction.mnemonic(), Mnemonic::Vpaddd);
                assert_eq!(instruction.op0_register(), iced_x86::Register::ZMM20);
                assert_eq!(instruction.op1_register(), iced_x86::Register::ZMM3);
                assert_eq!(
                    instruction.memory_base(),
                    crate::x64::tests::iced_register(base)
                );
                assert_eq!(instruction.memory_displacement64() as i64, disp as i64);
            }
        }
    }

    #[test]
    fn test_vex_round_trip() {
        for reg in 0..16u8 {
            for rm in 0..16u8 {
                let code = emit(avx2(), |a| {
                    a.vxorpd(
                        XmmRegister::new(reg),
                        XmmRegister::new(15 - reg),
                        XmmRegister::new(rm),
                        VectorLength::L256,
                    )
                });
                let instruction = decode_one(&code);
                assert_eq!(instruction.mnemonic(), Mnemonic::Vxorpd);
                assert!(instruction.op0_register().is_ymm());
                assert_eq!(instruction.op0_register().number(), reg as usize);
                assert_eq!(instruction.op1_register().number(), 15 - reg as usize);
                assert_eq!(instruction.op2_register().number(), rm as usize);
            }
        }
    }

    #[test]
    fn test_masked_round_trip() {
        let code = emit(avx512(), |a| {
            a.evpaddd(XMM31, K7, XMM16, XMM1, true, VectorLength::L256)
        });
        let instruction = decode_one(&code);
        assert_eq!(instruction.op_mask(), iced_x86::Register::K7);
        assert!(!instruction.zeroing_masking());
        assert_eq!(instruction.op0_register(), iced_x86::Register::YMM31);
    }
}
