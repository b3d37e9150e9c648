//! Build pipeline: config in, image out.
//!
//! The output file name picks what gets written:
//!
//! | Output | Content |
//! |--------|---------|
//! | `initrd.rom` | first initrd wrapped as a BIOS option ROM |
//! | `initrd.bin` | first initrd as is |
//! | `bootpart.bin` | the boot partition only |
//! | anything else | the full hybrid disk image |

pub mod config;

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::artifact::disk::{self, DiskGeometry, DiskImageOptions, EspOptions, Loaders};
use crate::artifact::initramfs::{self, Initrd, InitrdOptions};
use crate::kernel::{self, KernelInfo};

pub use config::{load_config, ImageConfig};

/// What a build produces, decided by the output file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    InitrdRom,
    InitrdBin,
    BootPartition,
    DiskImage,
}

impl OutputKind {
    pub fn from_path(path: &Path) -> Self {
        match path.file_name().and_then(|n| n.to_str()) {
            Some("initrd.rom") => Self::InitrdRom,
            Some("initrd.bin") => Self::InitrdBin,
            Some("bootpart.bin") => Self::BootPartition,
            _ => Self::DiskImage,
        }
    }
}

/// Probe a kernel file and print what it is.
pub fn check_kernel(path: &Path) -> Result<KernelInfo> {
    let data = fs::read(path).with_context(|| format!("Failed to read kernel {}", path.display()))?;
    let info = kernel::probe(&data).with_context(|| format!("Invalid kernel {}", path.display()))?;
    println!("File format:  {}", info.format);
    println!("Architecture: {}", info.arch);
    println!("Entry point:  {:#018x}", info.entry);
    Ok(info)
}

fn read_loaders(config: &ImageConfig) -> Result<Loaders> {
    let paths = &config.loaders;
    let boot_sector = config::read_loader(paths.boot_sector.as_deref(), "boot sector")?;
    if let Some(code) = &boot_sector {
        if code.len() != 512 {
            bail!("boot sector must be 512 bytes, got {}", code.len());
        }
    }
    let mut rpi = Vec::with_capacity(paths.rpi.len());
    for path in &paths.rpi {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("invalid Raspberry Pi file name {}", path.display()))?;
        let data = fs::read(path).with_context(|| format!("reading '{}'", path.display()))?;
        rpi.push((name.to_string(), data));
    }
    Ok(Loaders {
        boot_sector,
        bios: config::read_loader(paths.bios.as_deref(), "BIOS loader")?,
        efi: config::read_loader(paths.efi.as_deref(), "UEFI loader")?,
        rpi,
        riscv: config::read_loader(paths.riscv.as_deref(), "RISC-V payload")?,
    })
}

fn prepare_initrds(config: &ImageConfig) -> Result<Vec<Initrd>> {
    let kernel = kernel::kernel_path(&String::from_utf8_lossy(&config.boot_config));
    let options = InitrdOptions {
        fs_type: config.initrd_type.as_deref(),
        kernel: &kernel,
        gzip: config.gzip,
    };
    initramfs::prepare(&config.initrds, &options)
}

fn esp_options(config: &ImageConfig, timestamp: i64) -> Result<EspOptions> {
    Ok(EspOptions {
        size_mib: config.esp_size_mib,
        fat32: config.esp_fat32,
        iso9660: config.iso9660,
        config: config.boot_config.clone(),
        loaders: read_loaders(config)?,
        timestamp,
    })
}

/// Run a build from the config at `config_path`.
///
/// Returns the paths written: the output and, when requested, its
/// checksum file.
pub fn run_build(config_path: &Path, output: &Path, sha256: bool, timestamp: i64) -> Result<Vec<PathBuf>> {
    let config = load_config(config_path, timestamp)?;
    let kind = OutputKind::from_path(output);
    log::info!("building {:?} from {}", kind, config.path.display());

    match kind {
        OutputKind::InitrdRom | OutputKind::InitrdBin => {
            let initrds = prepare_initrds(&config)?;
            let first = &initrds[0];
            let data = if kind == OutputKind::InitrdRom {
                initramfs::make_rom(&first.data)?
            } else {
                first.data.clone()
            };
            fs::write(output, data).with_context(|| format!("Failed to write {}", output.display()))?;
        }
        OutputKind::BootPartition => {
            let initrds = prepare_initrds(&config)?;
            disk::build_boot_partition(&initrds, &esp_options(&config, timestamp)?, output)?;
        }
        OutputKind::DiskImage => {
            let initrds = prepare_initrds(&config)?;
            let options = DiskImageOptions {
                geometry: DiskGeometry {
                    disk_guid: config.disk_guid,
                    disk_size_mib: config.disk_size_mib,
                    align_kib: config.align_kib,
                },
                esp: esp_options(&config, timestamp)?,
                partitions: config.partitions.clone(),
            };
            disk::build_disk_image(&initrds, &options, output)?;
        }
    }
    println!("bootimg-builder: {} saved.", output.display());

    let mut written = vec![output.to_path_buf()];
    if sha256 {
        written.push(disk::write_checksum(output)?);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::testutil::elf64;
    use tempfile::TempDir;

    fn project() -> TempDir {
        let temp = TempDir::new().unwrap();
        let initrd = temp.path().join("initrd");
        fs::create_dir_all(initrd.join("sys")).unwrap();
        fs::write(initrd.join("sys/core"), elf64(62, 4096)).unwrap();
        fs::write(temp.path().join("bootboot.cfg"), "kernel=sys/core\n").unwrap();
        fs::write(
            temp.path().join("image.json"),
            r#"{
                "diskguid": "11111111-2222-3333-4444-555555555555",
                "config": "bootboot.cfg",
                "initrd": { "directory": "initrd", "type": "cpio", "gzip": false },
                "partitions": [ { "type": "fat16", "size": 8 } ]
            }"#,
        )
        .unwrap();
        temp
    }

    #[test]
    fn test_output_kind() {
        assert_eq!(OutputKind::from_path(Path::new("out/initrd.rom")), OutputKind::InitrdRom);
        assert_eq!(OutputKind::from_path(Path::new("initrd.bin")), OutputKind::InitrdBin);
        assert_eq!(OutputKind::from_path(Path::new("bootpart.bin")), OutputKind::BootPartition);
        assert_eq!(OutputKind::from_path(Path::new("disk.img")), OutputKind::DiskImage);
    }

    #[test]
    fn test_initrd_outputs() {
        let temp = project();
        let config = temp.path().join("image.json");

        let bin = temp.path().join("initrd.bin");
        run_build(&config, &bin, false, 0).unwrap();
        let raw = fs::read(&bin).unwrap();
        assert_eq!(&raw[..6], b"070707");

        let rom = temp.path().join("initrd.rom");
        run_build(&config, &rom, false, 0).unwrap();
        let rom = fs::read(&rom).unwrap();
        assert_eq!(&rom[..2], &[0x55, 0xAA]);
        assert_eq!(&rom[32..38], b"070707");
    }

    #[test]
    fn test_boot_partition_and_disk() {
        let temp = project();
        let config = temp.path().join("image.json");

        let part = temp.path().join("bootpart.bin");
        run_build(&config, &part, false, 0).unwrap();
        assert_eq!(fs::metadata(&part).unwrap().len(), 8 * 1024 * 1024);

        let disk = temp.path().join("disk.img");
        let written = run_build(&config, &disk, true, 0).unwrap();
        assert_eq!(written, vec![disk.clone(), temp.path().join("disk.img.sha256")]);
        let image = fs::read(&disk).unwrap();
        assert_eq!(&image[512..520], b"EFI PART");
    }

    #[test]
    fn test_check_kernel() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("core");
        fs::write(&path, elf64(243, 128)).unwrap();
        assert_eq!(check_kernel(&path).unwrap().arch, kernel::Arch::Riscv64);
        fs::write(&path, b"not a kernel at all").unwrap();
        assert!(check_kernel(&path).is_err());
    }
}
