// Verus specification for CPUID decoding.
//
// These specs document the verification properties of the pure functions
// in `src/verified/cpu.rs`.  They are NOT compiled by `cargo`; they are
// consumed by the Verus verifier:
//
//     verus verus/cpu_spec.rs
//
// Reference: https://verus-lang.github.io/verus/guide/

verus! {

// ═══════════════════════════════════════════════════════════════════════
// decode_vendor
// ═══════════════════════════════════════════════════════════════════════

pub const INTEL_EBX: u32 = 0x756e_6547u32;
pub const INTEL_EDX: u32 = 0x4965_6e69u32;
pub const INTEL_ECX: u32 = 0x6c65_746eu32;

pub const AMD_EBX: u32 = 0x6874_7541u32;
pub const AMD_EDX: u32 = 0x6974_6e65u32;
pub const AMD_ECX: u32 = 0x444d_4163u32;

/// Vendors modelled as 0 = unknown, 1 = Intel, 2 = AMD.
pub fn decode_vendor(ebx: u32, ecx: u32, edx: u32) -> (result: u8)
    ensures
        result == 1u8 <==> (ebx == INTEL_EBX && ecx == INTEL_ECX && edx == INTEL_EDX),
        result == 2u8 <==> (ebx == AMD_EBX && ecx == AMD_ECX && edx == AMD_EDX),
        result <= 2u8,
{
    if ebx == INTEL_EBX && ecx == INTEL_ECX && edx == INTEL_EDX {
        1u8
    } else if ebx == AMD_EBX && ecx == AMD_ECX && edx == AMD_EDX {
        2u8
    } else {
        0u8
    }
}

// ═══════════════════════════════════════════════════════════════════════
// decode_signature
// ═══════════════════════════════════════════════════════════════════════

pub open spec fn base_family(eax: u32) -> u32 { (eax >> 8u32) & 0xfu32 }
pub open spec fn base_model(eax: u32) -> u32 { (eax >> 4u32) & 0xfu32 }

pub fn decode_signature(eax: u32) -> (result: (u16, u8, u8))
    ensures
        // 1. Families never exceed base plus extended family.
        result.0 <= 0xf + 0xff,
        // 2. The extended family only applies to family 0xf.
        base_family(eax) != 0xf ==> result.0 == base_family(eax),
        // 3. Stepping is the low nibble.
        result.2 == (eax & 0xfu32),
        result.2 <= 0xf,
{
    let mut family: u16 = ((eax >> 8u32) & 0xfu32) as u16;
    if family == 0xf {
        family = family + (((eax >> 20u32) & 0xffu32) as u16);
    }
    let mut model: u8 = ((eax >> 4u32) & 0xfu32) as u8;
    if family == 0x6 || (family & 0xf) == 0xf {
        model = model + (((eax >> 12u32) & 0xf0u32) as u8);
    }
    let stepping: u8 = (eax & 0xfu32) as u8;
    (family, model, stepping)
}

/// Family 6 models combine both model nibbles (e.g. Skylake 0x4e).
proof fn family6_uses_extended_model()
    ensures
        decode_signature(0x000406e3u32) == (6u16, 0x4eu8, 3u8),
{ }

}
