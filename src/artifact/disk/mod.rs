//! Hybrid GPT disk image builder.
//!
//! Everything is laid out in memory and written with plain file I/O, so no
//! host tools or privileges are needed. The image boots from BIOS, UEFI,
//! Raspberry Pi firmware and, with ISO9660 enabled, from a CD.
//!
//! ```text
//! LBA 0        PMBR
//! LBA 1        GPT header
//! LBA 2..63    partition array
//! ...          ISO9660 descriptors (optional)
//! esp_start    ESP (FAT16/FAT32)
//! ...          user partitions, aligned
//! total-63     backup array + header
//! ```

pub mod assembly;
pub mod esp;
pub mod gpt;
pub mod helpers;
pub mod iso9660;
pub mod partitions;

pub use esp::{build_esp, Esp, EspOptions, Loaders};
pub use helpers::Guid;
pub use partitions::{DiskGeometry, DiskLayout, PartitionRequest, PartitionSource};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use crate::artifact::initramfs::Initrd;

/// Everything needed to lay out a full disk.
#[derive(Debug, Clone)]
pub struct DiskImageOptions {
    pub geometry: DiskGeometry,
    pub esp: EspOptions,
    pub partitions: Vec<PartitionRequest>,
}

/// Build a complete disk image at `output`.
pub fn build_disk_image(
    initrds: &[Initrd],
    options: &DiskImageOptions,
    output: &Path,
) -> Result<DiskLayout> {
    println!("=== Building Disk Image ===\n");
    println!("Disk GUID: {}", options.geometry.disk_guid);

    // Step 1: Boot partition
    println!("\nCreating boot partition...");
    let mut esp = build_esp(initrds, &options.esp).context("Failed to build boot partition")?;
    println!(
        "  FAT{}, {} MB",
        if esp.fat32 { 32 } else { 16 },
        esp.len() / 1024 / 1024
    );

    // Step 2: Layout
    let layout = partitions::plan(
        &options.geometry,
        esp.len() as u64,
        esp.payload_sectors,
        &options.partitions,
    )?;
    for part in layout.entries() {
        println!(
            "  {:<24} LBA {:>10}..={:<10} {}",
            part.name, part.start_lba, part.end_lba, part.part_guid
        );
    }

    // Step 3: Partition tables
    println!("\nWriting partition tables...");
    let tables = gpt::build(&layout, &mut esp, options.esp.iso9660, options.esp.timestamp)?;

    // Step 4: Assemble
    println!("\nAssembling disk image...");
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    assembly::write_image(output, &layout, &tables, &esp)?;

    println!("\n=== Disk Image Built ===");
    println!("  Output: {}", output.display());
    println!("  Size: {} MB (sparse)", layout.total_bytes() / 1024 / 1024);
    Ok(layout)
}

/// Write only the boot partition, for use as a raw FAT image.
pub fn build_boot_partition(initrds: &[Initrd], options: &EspOptions, output: &Path) -> Result<()> {
    let esp = build_esp(initrds, options).context("Failed to build boot partition")?;
    fs::write(output, esp.image.as_slice())
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!("  Boot partition: {} ({} MB)", output.display(), esp.len() / 1024 / 1024);
    Ok(())
}

/// SHA256 of a file, hex encoded.
pub fn sha256_file(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut reader = BufReader::with_capacity(1024 * 1024, file);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Write `<image>.sha256` in `sha256sum` format next to the image.
pub fn write_checksum(path: &Path) -> Result<PathBuf> {
    let hash = sha256_file(path)?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let sum_path = path.with_file_name(format!("{}.sha256", name));
    fs::write(&sum_path, format!("{}  {}\n", hash, name))
        .with_context(|| format!("Failed to write {}", sum_path.display()))?;
    println!("  SHA256: {}", hash);
    Ok(sum_path)
}
