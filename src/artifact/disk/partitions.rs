//! Disk layout: where the ESP and every user partition land.

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

use super::helpers::{Guid, BIOS_BOOT_TYPE, EFI_SYSTEM_TYPE};
use crate::fs::PartitionDescriptor;

/// Sector size in bytes.
pub const SECTOR_SIZE: u64 = 512;

/// Minimum gap in sectors before the ESP; also holds the primary GPT.
pub const MIN_ESP_START: u64 = 128;

/// Sectors occupied by the backup partition array plus the backup header.
pub const BACKUP_SECTORS: u64 = 63;

const MIB: u64 = 1024 * 1024;

/// Where a user partition's content comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionSource {
    /// Left zeroed.
    Empty,
    /// Raw image copied verbatim.
    File(PathBuf),
    /// Built from a directory with the named registry format.
    Directory { path: PathBuf, driver: String },
}

/// A user partition as configured.
#[derive(Debug, Clone)]
pub struct PartitionRequest {
    pub type_guid: Guid,
    pub name: String,
    pub size_mib: u64,
    pub source: PartitionSource,
}

/// A placed user partition.
#[derive(Debug, Clone)]
pub struct PlacedPartition {
    /// Position in the config; 0 is the ESP.
    pub index: usize,
    pub descriptor: PartitionDescriptor,
    pub source: PartitionSource,
}

impl PlacedPartition {
    pub fn bytes(&self) -> u64 {
        self.descriptor.size_bytes()
    }
}

/// Complete disk geometry.
#[derive(Debug, Clone)]
pub struct DiskLayout {
    pub disk_guid: Guid,
    /// Partition alignment in bytes.
    pub align: u64,
    /// First sector of the ESP.
    pub esp_start: u64,
    /// ESP length in sectors, aligned.
    pub esp_sectors: u64,
    pub total_sectors: u64,
    pub esp: PartitionDescriptor,
    pub bios_boot: Option<PartitionDescriptor>,
    pub partitions: Vec<PlacedPartition>,
}

impl DiskLayout {
    pub fn total_bytes(&self) -> u64 {
        self.total_sectors * SECTOR_SIZE
    }

    /// First sector of the backup partition array.
    pub fn backup_start(&self) -> u64 {
        self.total_sectors - BACKUP_SECTORS
    }

    /// Every GPT entry in table order.
    pub fn entries(&self) -> impl Iterator<Item = &PartitionDescriptor> {
        std::iter::once(&self.esp)
            .chain(self.bios_boot.as_ref())
            .chain(self.partitions.iter().map(|p| &p.descriptor))
    }
}

/// Disk-wide settings.
#[derive(Debug, Clone, Copy)]
pub struct DiskGeometry {
    pub disk_guid: Guid,
    /// Requested disk size in MiB; grown to fit.
    pub disk_size_mib: u64,
    /// Partition alignment in KiB; 0 means sector alignment.
    pub align_kib: u64,
}

fn align_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

/// Place the ESP, the optional RISC-V payload partition and every user
/// partition.
///
/// `payload_sectors` is the ESP-relative sector range of `PAYLOAD.BIN`.
/// Partition GUIDs are the disk GUID with `data1` counting up from one.
pub fn plan(
    geometry: &DiskGeometry,
    esp_len: u64,
    payload_sectors: Option<(u32, u32)>,
    requests: &[PartitionRequest],
) -> Result<DiskLayout> {
    let align = if geometry.align_kib >= 1 {
        geometry.align_kib * 1024
    } else {
        SECTOR_SIZE
    };
    let esp_start = (align / SECTOR_SIZE).max(MIN_ESP_START);
    let esp_sectors = align_up(esp_len, align) / SECTOR_SIZE;
    let disk = geometry.disk_guid;
    let mut minted = 1;

    let esp = PartitionDescriptor {
        type_guid: EFI_SYSTEM_TYPE,
        part_guid: disk.nth(minted),
        start_lba: esp_start,
        end_lba: esp_start + esp_sectors - 1,
        name: "EFI System Partition".to_string(),
    };
    minted += 1;

    let bios_boot = match payload_sectors {
        Some((start, end)) if start <= end => {
            let descriptor = PartitionDescriptor {
                type_guid: BIOS_BOOT_TYPE,
                part_guid: disk.nth(minted),
                start_lba: esp_start + u64::from(start),
                end_lba: esp_start + u64::from(end),
                name: "BOOTBOOT RISC-V".to_string(),
            };
            minted += 1;
            Some(descriptor)
        }
        _ => None,
    };

    let mut next = esp_start + esp_sectors;
    let mut partitions = Vec::with_capacity(requests.len());
    for (i, request) in requests.iter().enumerate() {
        let index = i + 1;
        let file_len = match &request.source {
            PartitionSource::File(path) => fs::metadata(path)
                .with_context(|| {
                    format!("partition #{} image {}", index + 1, path.display())
                })?
                .len(),
            _ => 0,
        };
        // Never zero sectors, so the next partition starts past this one.
        let bytes = align_up((request.size_mib * MIB).max(file_len).max(1), align);
        let sectors = bytes / SECTOR_SIZE;
        let descriptor = PartitionDescriptor {
            type_guid: request.type_guid,
            part_guid: disk.nth(minted),
            start_lba: next,
            end_lba: next + sectors - 1,
            name: request.name.clone(),
        };
        minted += 1;
        log::debug!(
            "partition #{} '{}': LBA {}..={}",
            index + 1,
            request.name,
            descriptor.start_lba,
            descriptor.end_lba
        );
        next += sectors;
        partitions.push(PlacedPartition {
            index,
            descriptor,
            source: request.source.clone(),
        });
    }

    let used = next + esp_start;
    let requested = geometry.disk_size_mib * MIB / SECTOR_SIZE;
    let total_sectors = requested.max(used);

    Ok(DiskLayout {
        disk_guid: disk,
        align,
        esp_start,
        esp_sectors,
        total_sectors,
        esp,
        bios_boot,
        partitions,
    })
}
