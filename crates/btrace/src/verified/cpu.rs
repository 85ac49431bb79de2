//! Pure, verifiable CPUID decoding.
//!
//! The effectful half (executing `cpuid`) lives in [`crate::cpu`]; these
//! functions only take register values in and return fields out.

use crate::cpu::CpuVendor;

/// "GenuineIntel" as returned in EBX/EDX/ECX of CPUID leaf 0.
pub(crate) const INTEL_EBX: u32 = 0x756e_6547;
pub(crate) const INTEL_EDX: u32 = 0x4965_6e69;
pub(crate) const INTEL_ECX: u32 = 0x6c65_746e;

/// "AuthenticAMD" as returned in EBX/EDX/ECX of CPUID leaf 0.
pub(crate) const AMD_EBX: u32 = 0x6874_7541;
pub(crate) const AMD_EDX: u32 = 0x6974_6e65;
pub(crate) const AMD_ECX: u32 = 0x444d_4163;

/// Bits \[3:0\] of CPUID 0x1 EAX: stepping.
const EAX_STEPPING_MASK: u32 = 0xF;
/// Bits \[7:4\] of CPUID 0x1 EAX: model.
const EAX_MODEL_SHIFT: u32 = 4;
/// Bits \[11:8\] of CPUID 0x1 EAX: family.
const EAX_FAMILY_SHIFT: u32 = 8;
/// Bits \[19:16\] of CPUID 0x1 EAX: extended model, pre-shifted to sit
/// above the base model nibble.
const EAX_EXT_MODEL_SHIFT: u32 = 12;
/// Bits \[27:20\] of CPUID 0x1 EAX: extended family.
const EAX_EXT_FAMILY_SHIFT: u32 = 20;

/// Identify the vendor from the leaf 0 signature registers.
pub(crate) fn decode_vendor(ebx: u32, ecx: u32, edx: u32) -> CpuVendor {
    match (ebx, ecx, edx) {
        (INTEL_EBX, INTEL_ECX, INTEL_EDX) => CpuVendor::Intel,
        (AMD_EBX, AMD_ECX, AMD_EDX) => CpuVendor::Amd,
        _ => CpuVendor::Unknown,
    }
}

/// Decode `(family, model, stepping)` from CPUID leaf 1 EAX.
///
/// The extended family is added only for base family 0xf.  The extended
/// model is added for family 6 and for families whose low nibble is 0xf.
pub(crate) fn decode_signature(eax: u32) -> (u16, u8, u8) {
    let mut family = ((eax >> EAX_FAMILY_SHIFT) & 0xf) as u16;
    if family == 0xf {
        family += ((eax >> EAX_EXT_FAMILY_SHIFT) & 0xff) as u16;
    }

    let mut model = ((eax >> EAX_MODEL_SHIFT) & 0xf) as u8;
    if family == 0x6 || (family & 0xf) == 0xf {
        model += ((eax >> EAX_EXT_MODEL_SHIFT) & 0xf0) as u8;
    }

    let stepping = (eax & EAX_STEPPING_MASK) as u8;

    debug_assert!(family <= 0xf + 0xff);
    (family, model, stepping)
}
