//! Kernel executable probing.
//!
//! The boot partition names per-architecture initrds after the machine the
//! kernel inside them was built for, so every initrd is searched for an ELF64
//! or PE32+ executable and classified by its machine field.
//!
//! # Usage
//!
//! ```rust,ignore
//! use bootimg_builder::kernel::{locate, probe};
//!
//! let info = probe(&std::fs::read("sys/core")?)?;
//! println!("{} {}", info.format, info.arch);
//!
//! let (offset, info) = locate(&initrd).expect("no kernel in initrd");
//! ```

use anyhow::{bail, Result};
use std::fmt;

const EM_X86_64: u16 = 62;
const EM_AARCH64: u16 = 183;
const EM_RISCV: u16 = 243;

const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;
const IMAGE_FILE_MACHINE_ARM64: u16 = 0xAA64;
const IMAGE_FILE_MACHINE_RISCV64: u16 = 0x5064;

const PE_OPT_MAGIC_PE32PLUS: u16 = 0x20B;

/// Default kernel path inside an initrd when the boot config names none.
pub const DEFAULT_KERNEL: &str = "sys/core";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Arch {
    Aarch64,
    X86_64,
    Riscv64,
}

impl Arch {
    /// File name of this architecture's initrd on the boot partition.
    pub fn esp_name(self) -> &'static str {
        match self {
            Self::Aarch64 => "AARCH64",
            Self::X86_64 => "X86_64",
            Self::Riscv64 => "RISCV64",
        }
    }

    fn from_elf(machine: u16) -> Option<Self> {
        match machine {
            EM_X86_64 => Some(Self::X86_64),
            EM_AARCH64 => Some(Self::Aarch64),
            EM_RISCV => Some(Self::Riscv64),
            _ => None,
        }
    }

    fn from_pe(machine: u16) -> Option<Self> {
        match machine {
            IMAGE_FILE_MACHINE_AMD64 => Some(Self::X86_64),
            IMAGE_FILE_MACHINE_ARM64 => Some(Self::Aarch64),
            IMAGE_FILE_MACHINE_RISCV64 => Some(Self::Riscv64),
            _ => None,
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Aarch64 => "AArch64",
            Self::X86_64 => "x86_64",
            Self::Riscv64 => "riscv64",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelFormat {
    Elf64,
    Pe32Plus,
}

impl fmt::Display for KernelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Elf64 => "ELF64",
            Self::Pe32Plus => "PE32+",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelInfo {
    pub format: KernelFormat,
    pub arch: Arch,
    pub entry: u64,
}

fn u16_at(data: &[u8], offset: usize) -> Option<u16> {
    data.get(offset..offset + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
}

fn u32_at(data: &[u8], offset: usize) -> Option<u32> {
    data.get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn u64_at(data: &[u8], offset: usize) -> Option<u64> {
    Some(u64::from(u32_at(data, offset)?) | (u64::from(u32_at(data, offset + 4)?) << 32))
}

fn is_elf64(data: &[u8]) -> bool {
    let Some(ident) = data.get(0..6) else {
        return false;
    };
    (ident[..4] == *b"\x7fELF" || ident[..4] == *b"OS/Z") && ident[4] == 2 && ident[5] == 1
}

/// Offset of the PE header when `data` starts with an MZ stub of a PE32+.
fn pe32plus_header(data: &[u8]) -> Option<usize> {
    if data.get(0..2)? != b"MZ" {
        return None;
    }
    let peaddr = u32_at(data, 60)? as usize;
    if peaddr >= 65536 || data.get(peaddr..peaddr + 4)? != b"PE\0\0" {
        return None;
    }
    (u16_at(data, peaddr + 24)? == PE_OPT_MAGIC_PE32PLUS).then_some(peaddr)
}

/// Whether `data` starts with a kernel executable of any supported kind.
pub fn is_executable(data: &[u8]) -> bool {
    is_elf64(data) || pe32plus_header(data).is_some()
}

/// Classify a kernel executable.
pub fn probe(data: &[u8]) -> Result<KernelInfo> {
    if is_elf64(data) {
        let machine = u16_at(data, 18).unwrap_or(0);
        let Some(arch) = Arch::from_elf(machine) else {
            bail!(
                "Unsupported kernel architecture (e_machine {}). Accepted values: e_machine 62, 183, 243",
                machine
            );
        };
        return Ok(KernelInfo {
            format: KernelFormat::Elf64,
            arch,
            entry: u64_at(data, 24).unwrap_or(0),
        });
    }
    if let Some(pe) = pe32plus_header(data) {
        let machine = u16_at(data, pe + 4).unwrap_or(0);
        let Some(arch) = Arch::from_pe(machine) else {
            bail!(
                "Unsupported kernel architecture (machine {:#x}). Accepted values: pe_hdr.machine 0x8664, 0xAA64, 0x5064",
                machine
            );
        };
        return Ok(KernelInfo {
            format: KernelFormat::Pe32Plus,
            arch,
            entry: u64::from(u32_at(data, pe + 40).unwrap_or(0)),
        });
    }
    bail!("Not an ELF64 or PE32+ executable")
}

/// Find the first kernel executable inside an initrd image.
///
/// Only offsets with at least one sector left behind them are tried, which
/// skips stray magic bytes at the very end of the image.
pub fn locate(initrd: &[u8]) -> Option<(usize, KernelInfo)> {
    let end = initrd.len().saturating_sub(512);
    (0..end).find_map(|offset| {
        let data = &initrd[offset..];
        if !is_executable(data) {
            return None;
        }
        probe(data).ok().map(|info| (offset, info))
    })
}

/// Kernel path from a BOOTBOOT environment config.
///
/// Reads the `kernel=` key, skipping `#` and `//` line comments and
/// `/* */` block comments. Falls back to [`DEFAULT_KERNEL`].
pub fn kernel_path(config: &str) -> String {
    let mut rest = config;
    while !rest.is_empty() {
        let trimmed = rest.trim_start();
        if let Some(body) = trimmed.strip_prefix("/*") {
            rest = body.find("*/").map_or("", |end| &body[end + 2..]);
            continue;
        }
        let (line, next) = trimmed.split_once('\n').unwrap_or((trimmed, ""));
        rest = next;
        if line.starts_with('#') || line.starts_with("//") {
            continue;
        }
        if let Some(value) = line.strip_prefix("kernel=") {
            let value: String = value
                .chars()
                .take_while(|c| !c.is_whitespace())
                .collect();
            if !value.is_empty() {
                return value;
            }
        }
    }
    DEFAULT_KERNEL.to_string()
}

#[cfg(test)]
pub(crate) mod testutil {
    /// Smallest ELF64 header the probe accepts.
    pub fn elf64(machine: u16, len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len.max(64)];
        data[..4].copy_from_slice(b"\x7fELF");
        data[4] = 2;
        data[5] = 1;
        data[18..20].copy_from_slice(&machine.to_le_bytes());
        data[24..32].copy_from_slice(&0xFFFF_FFFF_FFE0_2000u64.to_le_bytes());
        data
    }
}
