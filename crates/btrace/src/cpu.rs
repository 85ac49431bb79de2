//! Host CPU identification and branch-trace CPU quirks.
//!
//! [`TraceCpu::host`] executes CPUID once and caches the result.  The
//! decoded identity decides whether the branch-pair format can be trusted
//! on this machine (see [`TraceCpu::supports_bts`]) and travels alongside
//! packet-stream data so the external decoder can apply its own errata.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// CPU vendor as reported by CPUID leaf 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CpuVendor {
    #[default]
    Unknown,
    Intel,
    Amd,
}

impl fmt::Display for CpuVendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Intel => write!(f, "GenuineIntel"),
            Self::Amd => write!(f, "AuthenticAMD"),
        }
    }
}

/// A `(family, model)` pair identifying a CPU generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CpuModel {
    pub family: u16,
    pub model: u8,
}

impl CpuModel {
    pub const fn new(family: u16, model: u8) -> Self {
        Self { family, model }
    }
}

/// Intel models affected by erratum AAJ122: LBR, BTM or BTS records may
/// carry an incorrect "from" address after an EIST transition, T-states,
/// C1E or Adaptive Thermal Throttling.
pub const BTS_BROKEN_INTEL_MODELS: &[CpuModel] = &[
    // Nehalem
    CpuModel::new(0x6, 0x1a),
    CpuModel::new(0x6, 0x1e),
    CpuModel::new(0x6, 0x1f),
    CpuModel::new(0x6, 0x2e),
    // Westmere
    CpuModel::new(0x6, 0x25),
    CpuModel::new(0x6, 0x2c),
    CpuModel::new(0x6, 0x2f),
    // Sandy Bridge
    CpuModel::new(0x6, 0x2a),
    CpuModel::new(0x6, 0x2d),
    // Ivy Bridge
    CpuModel::new(0x6, 0x3a),
];

/// Identity of the CPU the trace was recorded on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TraceCpu {
    pub vendor: CpuVendor,
    pub family: u16,
    pub model: u8,
    pub stepping: u8,
}

impl TraceCpu {
    /// Identity of the host CPU, computed on first use.
    pub fn host() -> Self {
        static HOST: OnceLock<TraceCpu> = OnceLock::new();
        *HOST.get_or_init(identify)
    }

    /// Build an identity from raw CPUID leaf 0 and leaf 1 registers.
    ///
    /// `leaf1_eax` is ignored when `max_leaf` says leaf 1 is unavailable.
    pub fn from_cpuid(max_leaf: u32, ebx: u32, ecx: u32, edx: u32, leaf1_eax: u32) -> Self {
        let vendor = crate::verified::cpu::decode_vendor(ebx, ecx, edx);
        if max_leaf < 1 {
            return Self {
                vendor,
                ..Self::default()
            };
        }
        let (family, model, stepping) = crate::verified::cpu::decode_signature(leaf1_eax);
        Self {
            vendor,
            family,
            model,
            stepping,
        }
    }

    pub fn cpu_model(&self) -> CpuModel {
        CpuModel::new(self.family, self.model)
    }

    /// Whether branch-pair (BTS) traces from this CPU can be trusted.
    ///
    /// Intel CPUs on `denylist` are declined.  AMD CPUs have no BTS.
    /// Unknown vendors are assumed to work.
    pub fn supports_bts(&self, denylist: &[CpuModel]) -> bool {
        match self.vendor {
            CpuVendor::Unknown => true,
            CpuVendor::Intel => !denylist.contains(&self.cpu_model()),
            CpuVendor::Amd => false,
        }
    }
}

impl fmt::Display for TraceCpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} family {:#x} model {:#x} stepping {}",
            self.vendor, self.family, self.model, self.stepping
        )
    }
}

#[cfg(target_arch = "x86_64")]
#[allow(unused_unsafe)]
fn identify() -> TraceCpu {
    use std::arch::x86_64::__cpuid;

    // SAFETY: CPUID is available on every x86_64 processor.
    let leaf0 = unsafe { __cpuid(0) };
    let leaf1_eax = if leaf0.eax >= 1 {
        // SAFETY: leaf 1 is supported per the maximum leaf reported above.
        unsafe { __cpuid(1) }.eax
    } else {
        0
    };
    TraceCpu::from_cpuid(leaf0.eax, leaf0.ebx, leaf0.ecx, leaf0.edx, leaf1_eax)
}

#[cfg(not(target_arch = "x86_64"))]
fn identify() -> TraceCpu {
    TraceCpu::default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verified::cpu::{AMD_EBX, AMD_ECX, AMD_EDX, INTEL_EBX, INTEL_ECX, INTEL_EDX};

    fn intel(eax: u32) -> TraceCpu {
        TraceCpu::from_cpuid(0x16, INTEL_EBX, INTEL_ECX, INTEL_EDX, eax)
    }

    #[test]
    fn sandy_bridge_is_declined() {
        let cpu = intel(0x0002_06a7);
        assert_eq!(cpu.cpu_model(), CpuModel::new(6, 0x2a));
        assert!(!cpu.supports_bts(BTS_BROKEN_INTEL_MODELS));
    }

    #[test]
    fn skylake_is_accepted() {
        let cpu = intel(0x0005_06e3);
        assert!(cpu.supports_bts(BTS_BROKEN_INTEL_MODELS));
    }

    #[test]
    fn empty_denylist_accepts_every_intel_model() {
        let cpu = intel(0x0002_06a7);
        assert!(cpu.supports_bts(&[]));
    }

    #[test]
    fn amd_is_declined_and_unknown_is_accepted() {
        let amd = TraceCpu::from_cpuid(0x10, AMD_EBX, AMD_ECX, AMD_EDX, 0x0083_0f10);
        assert_eq!(amd.vendor, CpuVendor::Amd);
        assert!(!amd.supports_bts(BTS_BROKEN_INTEL_MODELS));

        let other = TraceCpu::from_cpuid(1, 0, 0, 0, 0x0002_06a7);
        assert!(other.supports_bts(BTS_BROKEN_INTEL_MODELS));
    }

    #[test]
    fn missing_leaf_one_leaves_signature_zero() {
        let cpu = TraceCpu::from_cpuid(0, INTEL_EBX, INTEL_ECX, INTEL_EDX, 0x0005_06e3);
        assert_eq!(cpu.vendor, CpuVendor::Intel);
        assert_eq!((cpu.family, cpu.model, cpu.stepping), (0, 0, 0));
    }

    #[test]
    fn host_is_cached() {
        assert_eq!(TraceCpu::host(), TraceCpu::host());
    }
}
