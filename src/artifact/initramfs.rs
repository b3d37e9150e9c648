//! Initrd preparation.
//!
//! An initrd is either built from a directory with one of the registry's
//! initrd-capable formats or loaded from a prebuilt file. Either way the
//! kernel inside it is probed for its architecture, which decides the
//! initrd's name on the boot partition.
//!
//! # Example
//!
//! ```rust,ignore
//! use bootimg_builder::artifact::initramfs::{prepare, InitrdOptions, InitrdSource};
//!
//! let options = InitrdOptions { fs_type: Some("cpio"), kernel: "sys/core", gzip: true };
//! let initrds = prepare(&[InitrdSource::Directory("initrd/".into())], &options)?;
//! ```

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use super::filesystem::add_tree;
use crate::kernel::{self, Arch};
use crate::registry;

/// Up to one initrd per architecture.
pub const MAX_INITRDS: usize = 3;

const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitrdSource {
    File(PathBuf),
    Directory(PathBuf),
}

/// Options for preparing initrds.
#[derive(Debug, Clone)]
pub struct InitrdOptions<'a> {
    /// Registry format for directory sources.
    pub fs_type: Option<&'a str>,

    /// Kernel path inside a directory source.
    pub kernel: &'a str,

    /// Gzip the result.
    ///
    /// Default: true
    pub gzip: bool,
}

impl Default for InitrdOptions<'_> {
    fn default() -> Self {
        Self {
            fs_type: None,
            kernel: kernel::DEFAULT_KERNEL,
            gzip: true,
        }
    }
}

/// A finished initrd and the architecture of its kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Initrd {
    pub arch: Arch,
    pub data: Vec<u8>,
}

pub fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(data).context("Failed to compress initrd")?;
    encoder.finish().context("Failed to compress initrd")
}

pub fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .context("Failed to uncompress initrd")?;
    Ok(out)
}

fn is_fat_image(data: &[u8]) -> bool {
    data.get(54..58) == Some(&b"FAT1"[..]) || data.get(82..86) == Some(&b"FAT3"[..])
}

/// Build an initrd from a directory tree.
pub fn build_from_dir(dir: &Path, options: &InitrdOptions) -> Result<Initrd> {
    let Some(fs_type) = options.fs_type else {
        bail!("Initrd type is required for directory {}", dir.display());
    };
    let driver = registry::find_initrd(fs_type)?;

    let kernel_file = dir.join(options.kernel);
    let kernel = fs::read(&kernel_file)
        .with_context(|| format!("Failed to read kernel {}", kernel_file.display()))?;
    if kernel.len() < 16 {
        bail!("Kernel too short: {}", kernel_file.display());
    }
    if is_fat_image(&kernel) {
        bail!("Kernel {} is a FAT image", kernel_file.display());
    }
    let info = kernel::probe(&kernel)
        .with_context(|| format!("Invalid kernel {}", kernel_file.display()))?;

    let mut builder = (driver.open)(None)?;
    let count = add_tree(builder.as_mut(), dir)?;
    let image = builder.close()?;
    log::info!("initrd {}: {} entries, {} bytes ({})", dir.display(), count, image.len(), driver.name);

    let data = if options.gzip {
        gzip(image.as_slice())?
    } else {
        image.into_vec()
    };
    Ok(Initrd {
        arch: info.arch,
        data,
    })
}

/// Load a prebuilt initrd. `index` only shows up in error messages.
pub fn load_file(path: &Path, index: usize, options: &InitrdOptions) -> Result<Initrd> {
    let mut data =
        fs::read(path).with_context(|| format!("Failed to read initrd {}", path.display()))?;
    if data.starts_with(&GZIP_MAGIC) {
        data = gunzip(&data).with_context(|| format!("Corrupt initrd {}", path.display()))?;
    }
    let Some((offset, info)) = kernel::locate(&data) else {
        bail!("Unable to locate kernel in initrd #{}", index + 1);
    };
    log::debug!("initrd #{}: {} kernel at offset {}", index + 1, info.arch, offset);
    if options.gzip {
        data = gzip(&data)?;
    }
    Ok(Initrd {
        arch: info.arch,
        data,
    })
}

/// Prepare every configured initrd, keeping only the first one per
/// architecture.
pub fn prepare(sources: &[InitrdSource], options: &InitrdOptions) -> Result<Vec<Initrd>> {
    if sources.is_empty() {
        bail!("No initrd configured");
    }
    if sources.len() > MAX_INITRDS {
        bail!("At most {} initrds can be configured", MAX_INITRDS);
    }
    let mut initrds: Vec<Initrd> = Vec::new();
    for (index, source) in sources.iter().enumerate() {
        let initrd = match source {
            InitrdSource::Directory(dir) => build_from_dir(dir, options)?,
            InitrdSource::File(path) => load_file(path, index, options)?,
        };
        if initrds.iter().any(|i| i.arch == initrd.arch) {
            log::warn!("initrd #{} duplicates the {} initrd, dropped", index + 1, initrd.arch);
            continue;
        }
        initrds.push(initrd);
    }
    Ok(initrds)
}

/// Wrap an initrd into a BIOS option ROM.
///
/// Header: 0x55AA, size in 512-byte blocks, `xor ax,ax; retf`, a checksum
/// byte making the whole ROM sum to zero, "INITRD" at 8 and the data size
/// at 16. Data starts at 32.
pub fn make_rom(initrd: &[u8]) -> Result<Vec<u8>> {
    let Ok(len) = u32::try_from(initrd.len()) else {
        bail!("Initrd too big for an option ROM");
    };
    let size = (initrd.len() + 32).div_ceil(512) * 512;
    let Ok(blocks) = u8::try_from(size / 512) else {
        bail!("Initrd too big for an option ROM ({} bytes)", initrd.len());
    };
    let mut rom = vec![0u8; size];
    rom[0] = 0x55;
    rom[1] = 0xAA;
    rom[2] = blocks;
    rom[3..6].copy_from_slice(&[0x31, 0xC0, 0xCB]);
    rom[8..14].copy_from_slice(b"INITRD");
    rom[16..20].copy_from_slice(&len.to_le_bytes());
    rom[32..32 + initrd.len()].copy_from_slice(initrd);
    let sum = rom.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    rom[6] = 0u8.wrapping_sub(sum);
    Ok(rom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::testutil::elf64;
    use tempfile::TempDir;

    fn tree_with_kernel(machine: u16) -> TempDir {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("sys")).unwrap();
        fs::write(temp.path().join("sys/core"), elf64(machine, 2048)).unwrap();
        fs::write(temp.path().join("readme"), b"hello").unwrap();
        temp
    }

    #[test]
    fn test_build_from_dir() {
        let temp = tree_with_kernel(62);
        let options = InitrdOptions {
            fs_type: Some("cpio"),
            gzip: false,
            ..Default::default()
        };
        let initrd = build_from_dir(temp.path(), &options).unwrap();
        assert_eq!(initrd.arch, Arch::X86_64);
        assert_eq!(&initrd.data[..6], b"070707");

        let zipped = build_from_dir(
            temp.path(),
            &InitrdOptions {
                fs_type: Some("cpio"),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(&zipped.data[..2], &GZIP_MAGIC);
        assert_eq!(gunzip(&zipped.data).unwrap(), initrd.data);
    }

    #[test]
    fn test_directory_needs_initrd_format() {
        let temp = tree_with_kernel(62);
        assert!(build_from_dir(temp.path(), &InitrdOptions::default()).is_err());
        let fat = InitrdOptions {
            fs_type: Some("fat32"),
            ..Default::default()
        };
        let err = format!("{:#}", build_from_dir(temp.path(), &fat).unwrap_err());
        assert!(err.contains("accepted values: cpio, tar, jamesm, echfs, fsz"));
    }

    #[test]
    fn test_load_file_finds_kernel() {
        let temp = TempDir::new().unwrap();
        let mut raw = vec![0u8; 8192];
        raw[4096..4096 + 64].copy_from_slice(&elf64(243, 64));
        let path = temp.path().join("initrd.gz");
        fs::write(&path, gzip(&raw).unwrap()).unwrap();

        let options = InitrdOptions {
            gzip: false,
            ..Default::default()
        };
        let initrd = load_file(&path, 0, &options).unwrap();
        assert_eq!(initrd.arch, Arch::Riscv64);
        assert_eq!(initrd.data, raw);

        fs::write(&path, vec![0u8; 8192]).unwrap();
        let err = load_file(&path, 1, &options).unwrap_err().to_string();
        assert_eq!(err, "Unable to locate kernel in initrd #2");
    }

    #[test]
    fn test_prepare_drops_duplicate_arch() {
        let a = tree_with_kernel(62);
        let b = tree_with_kernel(62);
        let c = tree_with_kernel(183);
        let options = InitrdOptions {
            fs_type: Some("tar"),
            gzip: false,
            ..Default::default()
        };
        let sources = [
            InitrdSource::Directory(a.path().to_path_buf()),
            InitrdSource::Directory(b.path().to_path_buf()),
            InitrdSource::Directory(c.path().to_path_buf()),
        ];
        let initrds = prepare(&sources, &options).unwrap();
        let arches: Vec<_> = initrds.iter().map(|i| i.arch).collect();
        assert_eq!(arches, vec![Arch::X86_64, Arch::Aarch64]);
        assert!(prepare(&[], &options).is_err());
    }

    #[test]
    fn test_make_rom() {
        let rom = make_rom(&[0xAB; 600]).unwrap();
        assert_eq!(rom.len(), 1024);
        assert_eq!(&rom[..3], &[0x55, 0xAA, 2]);
        assert_eq!(&rom[3..6], &[0x31, 0xC0, 0xCB]);
        assert_eq!(&rom[8..14], b"INITRD");
        assert_eq!(u32::from_le_bytes(rom[16..20].try_into().unwrap()), 600);
        assert_eq!(rom[32], 0xAB);
        assert_eq!(rom.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)), 0);
    }
}
