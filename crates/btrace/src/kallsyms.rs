//! Kernel address detection.
//!
//! The hardware may report branches from kernel into user space even with
//! `exclude_kernel` set.  [`KernelRange`] decides which "from" addresses to
//! drop.  It prefers the kernel's `_text` address from `/proc/kallsyms` and
//! falls back to testing the most significant address bit, which holds at
//! least for 64-bit kernels.

use log::debug;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::sync::OnceLock;

const KALLSYMS: &str = "/proc/kallsyms";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KernelRange {
    start: Option<u64>,
}

impl KernelRange {
    /// Kernel range of the running kernel, looked up once per process.
    pub fn host() -> Self {
        static HOST: OnceLock<KernelRange> = OnceLock::new();
        *HOST.get_or_init(|| {
            let start = File::open(KALLSYMS)
                .ok()
                .and_then(|file| parse_kernel_start(BufReader::new(file)));
            match start {
                Some(addr) => debug!("kernel text starts at {addr:#x}"),
                None => debug!("kernel start unknown, using the address MSB"),
            }
            KernelRange { start }
        })
    }

    /// Kernel starting at `start`; zero means unknown.
    pub fn starting_at(start: u64) -> Self {
        Self {
            start: (start != 0).then_some(start),
        }
    }

    /// Kernel start unknown; only the MSB test applies.
    pub const fn unknown() -> Self {
        Self { start: None }
    }

    pub fn start(&self) -> Option<u64> {
        self.start
    }

    pub fn contains(&self, addr: u64) -> bool {
        match self.start {
            Some(start) => addr >= start,
            None => addr & (1 << 63) != 0,
        }
    }
}

/// Find the `_text` symbol (type `t` or `T`) in kallsyms-formatted input.
///
/// Returns `None` if the symbol is missing or its address reads as zero,
/// which is what unprivileged readers see with `kptr_restrict` set.
pub fn parse_kernel_start(reader: impl BufRead) -> Option<u64> {
    for line in reader.lines() {
        let Ok(line) = line else { break };
        let mut fields = line.split_whitespace();
        let (Some(addr), Some(kind), Some(name)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if !matches!(kind, "t" | "T") || name != "_text" {
            continue;
        }
        return u64::from_str_radix(addr, 16).ok().filter(|&a| a != 0);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
0000000000000000 A fixed_percpu_data
ffffffff81000000 T startup_64
ffffffff81000000 T _text
ffffffff81000040 T secondary_startup_64
ffffffffc0a00000 t foo_init\t[foo]
";

    #[test]
    fn finds_text_symbol() {
        assert_eq!(
            parse_kernel_start(SAMPLE.as_bytes()),
            Some(0xffff_ffff_8100_0000)
        );
    }

    #[test]
    fn ignores_data_symbols_named_text() {
        let input = "ffffffff82000000 D _text\nffffffff81000000 t _text\n";
        assert_eq!(parse_kernel_start(input.as_bytes()), Some(0xffff_ffff_8100_0000));
    }

    #[test]
    fn restricted_pointers_mean_unknown() {
        let input = "0000000000000000 T _text\n";
        assert_eq!(parse_kernel_start(input.as_bytes()), None);
        assert_eq!(parse_kernel_start("".as_bytes()), None);
        assert_eq!(parse_kernel_start("garbage\n\n".as_bytes()), None);
    }

    #[test]
    fn known_start_is_a_threshold() {
        let kernel = KernelRange::starting_at(0xffff_ffff_8100_0000);
        assert!(kernel.contains(0xffff_ffff_8100_0000));
        assert!(kernel.contains(0xffff_ffff_9000_0000));
        // Below _text but with the MSB set still counts as user space.
        assert!(!kernel.contains(0xffff_8000_0000_0000));
        assert!(!kernel.contains(0x0040_1000));
    }

    #[test]
    fn unknown_start_falls_back_to_msb() {
        let kernel = KernelRange::unknown();
        assert!(kernel.contains(0x8000_0000_0000_0000));
        assert!(!kernel.contains(0x7fff_ffff_ffff));
        assert_eq!(KernelRange::starting_at(0), kernel);
    }
}
