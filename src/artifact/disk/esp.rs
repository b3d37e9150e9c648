//! EFI System Partition builder.
//!
//! The ESP is the first partition of every image. It is a FAT volume with
//! 8.3 names only, holding the BOOTBOOT config, the initrds and whatever
//! loaders the kernels' architectures need.

use anyhow::{bail, Context, Result};

use crate::artifact::initramfs::Initrd;
use crate::fs::fat::{DosStamp, FatGeometry, FatVolume, NameStyle};
use crate::image::ImageBuffer;
use crate::kernel::Arch;

const MIB: u64 = 1024 * 1024;
const MIN_SIZE_MIB: u64 = 8;
const FAT32_FROM_MIB: u64 = 128;
const FAT32_MIN_MIB: u64 = 33;
const FAT32_ISO_MIN_MIB: u64 = 128;

pub const SERIAL: u32 = 0x07B0_07B0;
pub const LABEL: &[u8; 11] = b"EFI System ";

/// Offset of the stage 2 loader's sector inside the boot sector.
pub const STAGE2_LBA_OFFSET: usize = 0x1B0;

/// Loader binaries placed on the ESP.
#[derive(Debug, Clone, Default)]
pub struct Loaders {
    /// Volume boot record code, 512 bytes.
    pub boot_sector: Option<Vec<u8>>,
    /// BIOS stage 2, `BOOTBOOT.BIN`.
    pub bios: Option<Vec<u8>>,
    /// `EFI/BOOT/BOOTX64.EFI`.
    pub efi: Option<Vec<u8>>,
    /// Raspberry Pi firmware files by their ESP name.
    pub rpi: Vec<(String, Vec<u8>)>,
    /// RISC-V `PAYLOAD.BIN`.
    pub riscv: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct EspOptions {
    pub size_mib: u64,
    pub fat32: bool,
    pub iso9660: bool,
    /// BOOTBOOT environment config.
    pub config: Vec<u8>,
    pub loaders: Loaders,
    pub timestamp: i64,
}

/// A finished ESP plus the sectors the partition table has to know about.
#[derive(Debug)]
pub struct Esp {
    pub image: ImageBuffer,
    pub fat32: bool,
    /// ESP-relative sector of `BOOTBOOT.BIN`.
    pub stage2_sector: Option<u32>,
    /// ESP-relative first and last sector of `PAYLOAD.BIN`.
    pub payload_sectors: Option<(u32, u32)>,
}

impl Esp {
    pub fn len(&self) -> usize {
        self.image.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image.is_empty()
    }
}

/// Final ESP size in MiB and FAT width.
pub fn size_and_width(options: &EspOptions, initrds: &[Initrd]) -> (u64, bool) {
    let slots = initrds.len().max(2) as u64;
    let initrd_bytes: u64 = initrds.iter().map(|i| i.data.len() as u64).sum::<u64>() + slots * 2047;
    let needed = (initrd_bytes + MIB - 1) / MIB + 3;
    let mut size = options.size_mib.max(needed).max(MIN_SIZE_MIB);
    let mut fat32 = options.fat32;
    if !fat32 && size >= FAT32_FROM_MIB {
        fat32 = true;
    }
    let fat32_min = if options.iso9660 {
        FAT32_ISO_MIN_MIB
    } else {
        FAT32_MIN_MIB
    };
    if fat32 && size < fat32_min {
        size = fat32_min;
    }
    (size, fat32)
}

fn sectors_per_cluster(fat32: bool, iso9660: bool, size_mib: u64) -> u8 {
    if !fat32 || iso9660 || size_mib >= FAT32_FROM_MIB {
        4
    } else {
        1
    }
}

struct Populated {
    vol: FatVolume,
    size_mib: u64,
    fat32: bool,
    stage2_sector: Option<u32>,
    payload_sectors: Option<(u32, u32)>,
}

/// Build the ESP for the given initrds.
pub fn build_esp(initrds: &[Initrd], options: &EspOptions) -> Result<Esp> {
    let done = populate(initrds, options)?;
    log::info!(
        "esp: {} MiB FAT{}, {} initrd(s)",
        done.size_mib,
        if done.fat32 { 32 } else { 16 },
        initrds.len()
    );
    Ok(Esp {
        image: done.vol.finish()?,
        fat32: done.fat32,
        stage2_sector: done.stage2_sector,
        payload_sectors: done.payload_sectors,
    })
}

fn populate(initrds: &[Initrd], options: &EspOptions) -> Result<Populated> {
    if initrds.is_empty() {
        bail!("No initrd to put on the boot partition");
    }
    let (size_mib, fat32) = size_and_width(options, initrds);
    let geom = FatGeometry {
        total_sectors: (size_mib * MIB / 512) as u32,
        sectors_per_cluster: sectors_per_cluster(fat32, options.iso9660, size_mib),
        fat32,
        hidden_sectors: 0,
        serial: SERIAL,
        label: *LABEL,
        boot_code: options.loaders.boot_sector.clone(),
    };
    let mut vol = FatVolume::format(&geom).context("Failed to format boot partition")?;
    let stamp = DosStamp::from_unix(options.timestamp);
    let root = vol.root();
    vol.add_volume_label(LABEL, stamp)?;

    let bootboot = vol.mkdir(root, "BOOTBOOT", NameStyle::Short, stamp, "BOOTBOOT")?;
    vol.write_file(bootboot, "CONFIG", NameStyle::Short, &options.config, stamp, "BOOTBOOT/CONFIG")?;
    if initrds.len() == 1 {
        vol.write_file(bootboot, "INITRD", NameStyle::Short, &initrds[0].data, stamp, "BOOTBOOT/INITRD")?;
    } else {
        for initrd in initrds {
            let name = initrd.arch.esp_name();
            vol.write_file(bootboot, name, NameStyle::Short, &initrd.data, stamp, name)?;
        }
    }

    let has = |arch: Arch| initrds.iter().any(|i| i.arch == arch);
    let loaders = &options.loaders;

    let mut payload_sectors = None;
    if has(Arch::Riscv64) {
        match &loaders.riscv {
            Some(payload) => {
                let start = vol.next_free_sector();
                vol.write_file(root, "PAYLOAD.BIN", NameStyle::Short, payload, stamp, "PAYLOAD.BIN")?;
                payload_sectors = Some((start, vol.next_free_sector() - 1));
            }
            None => log::warn!("esp: no RISC-V payload configured, PAYLOAD.BIN skipped"),
        }
    }

    let mut stage2_sector = None;
    if has(Arch::X86_64) {
        match &loaders.bios {
            Some(stage2) => {
                let sector = vol.next_free_sector();
                vol.image_mut().put_u32(STAGE2_LBA_OFFSET, sector)?;
                vol.write_file(root, "BOOTBOOT.BIN", NameStyle::Short, stage2, stamp, "BOOTBOOT.BIN")?;
                stage2_sector = Some(sector);
            }
            None => log::warn!("esp: no BIOS loader configured, BOOTBOOT.BIN skipped"),
        }
        match &loaders.efi {
            Some(efi) => {
                let efi_dir = vol.mkdir(root, "EFI", NameStyle::Short, stamp, "EFI")?;
                let boot = vol.mkdir(efi_dir, "BOOT", NameStyle::Short, stamp, "EFI/BOOT")?;
                vol.write_file(boot, "BOOTX64.EFI", NameStyle::Short, efi, stamp, "EFI/BOOT/BOOTX64.EFI")?;
            }
            None => log::warn!("esp: no UEFI loader configured, BOOTX64.EFI skipped"),
        }
    }

    if has(Arch::Aarch64) {
        if loaders.rpi.is_empty() {
            log::warn!("esp: no Raspberry Pi firmware configured");
        }
        for (name, data) in &loaders.rpi {
            vol.write_file(root, name, NameStyle::Short, data, stamp, name)?;
        }
    }

    Ok(Populated {
        vol,
        size_mib,
        fat32,
        stage2_sector,
        payload_sectors,
    })
}
