//! Protective MBR, GUID partition table and its backup.
//!
//! The primary area covers every sector before the ESP: the PMBR in
//! sector 0, the header in sector 1 and a 248-entry array from sector 2.
//! With ISO9660 enabled the CD descriptors share the same gap.

use anyhow::{bail, Result};

use super::esp::{Esp, STAGE2_LBA_OFFSET};
use super::helpers::utf16_name;
use super::iso9660;
use super::partitions::{DiskLayout, BACKUP_SECTORS, SECTOR_SIZE};
use crate::image::crc::crc32;
use crate::image::ImageBuffer;

const SECTOR: usize = SECTOR_SIZE as usize;
const HEADER_SIZE: usize = 92;
const REVISION: u32 = 0x0001_0000;
const ENTRY_SIZE: usize = 128;
pub const MAX_ENTRIES: usize = 248;
const ENTRY_NAME_UNITS: usize = 35;
const TABLE_OFFSET: usize = 2 * SECTOR;
const TABLE_BYTES: usize = MAX_ENTRIES * ENTRY_SIZE;
const FIRST_USABLE: u64 = 64;

const MBR_FAT16_LBA: u8 = 0x0E;
const MBR_FAT32_LBA: u8 = 0x0C;
const MBR_PROTECTIVE: u8 = 0xEE;

/// Everything the image writer puts around the partitions.
#[derive(Debug)]
pub struct GptImage {
    /// Sectors `0..esp_start`.
    pub primary: ImageBuffer,
    /// The last 63 sectors of the disk.
    pub backup: ImageBuffer,
}

/// Point the loaders at the absolute sector of the BIOS stage 2.
fn patch_stage2(esp: &mut Esp, esp_start: u64, iso9660: bool) -> Result<()> {
    let Some(sector) = esp.stage2_sector else {
        return Ok(());
    };
    let bbs = u64::from(sector) + esp_start;
    if iso9660 && bbs % 4 != 0 {
        bail!(
            "BOOTBOOT.BIN at sector {} is not aligned to a 2048-byte CD sector",
            bbs
        );
    }
    let Ok(bbs) = u32::try_from(bbs) else {
        bail!("BOOTBOOT.BIN sector {} out of range", bbs);
    };
    esp.image.put_u32(STAGE2_LBA_OFFSET, bbs)?;
    if esp.fat32 {
        esp.image.put_u32(6 * SECTOR + STAGE2_LBA_OFFSET, bbs)?;
    }
    Ok(())
}

fn write_pmbr(mbr: &mut ImageBuffer, layout: &DiskLayout, esp: &Esp) -> Result<()> {
    if esp.image.len() >= SECTOR {
        mbr.put_bytes(0, esp.image.bytes(0, 3)?)?;
        mbr.put_bytes(0x78, esp.image.bytes(0x78, 0x1B8 - 0x78)?)?;
    }
    mbr.put_u32(0x1B8, layout.disk_guid.data1)?;

    let es = layout.esp_start as u32;
    let esiz = layout.esp.sectors() as u32;
    mbr.put_u8(0x1BE, 0x80)?;
    mbr.put_u32(0x1C0, es + 1)?;
    mbr.put_u8(0x1C2, if esp.fat32 { MBR_FAT32_LBA } else { MBR_FAT16_LBA })?;
    mbr.put_u32(0x1C4, esiz + es)?;
    mbr.put_u32(0x1C6, es)?;
    mbr.put_u32(0x1CA, esiz)?;

    mbr.put_u32(0x1D0, 1)?;
    mbr.put_u8(0x1D2, MBR_PROTECTIVE)?;
    mbr.put_u32(0x1D4, FIRST_USABLE as u32)?;
    mbr.put_u32(0x1D6, 1)?;
    mbr.put_u32(0x1DA, FIRST_USABLE as u32 - 1)?;

    mbr.put_bytes(0x1FE, &[0x55, 0xAA])?;
    Ok(())
}

fn header_crc(img: &mut ImageBuffer, at: usize) -> Result<()> {
    img.put_u32(at + 16, 0)?;
    let crc = crc32(img.bytes(at, HEADER_SIZE)?);
    img.put_u32(at + 16, crc)?;
    Ok(())
}

/// Lay out the partition table for `layout`, patching the ESP's loader
/// pointers on the way.
pub fn build(layout: &DiskLayout, esp: &mut Esp, iso9660: bool, timestamp: i64) -> Result<GptImage> {
    let count = layout.entries().count();
    if count > MAX_ENTRIES {
        bail!("too many partitions ({}), at most {} fit the table", count, MAX_ENTRIES);
    }
    patch_stage2(esp, layout.esp_start, iso9660)?;

    let mut primary = ImageBuffer::zeroed(layout.esp_start as usize * SECTOR);
    write_pmbr(&mut primary, layout, esp)?;

    for (i, part) in layout.entries().enumerate() {
        let at = TABLE_OFFSET + i * ENTRY_SIZE;
        primary.put_bytes(at, &part.type_guid.to_bytes())?;
        primary.put_bytes(at + 16, &part.part_guid.to_bytes())?;
        primary.put_u64(at + 32, part.start_lba)?;
        primary.put_u64(at + 40, part.end_lba)?;
        primary.put_bytes(at + 56, &utf16_name(&part.name, ENTRY_NAME_UNITS))?;
    }
    let table_crc = crc32(primary.bytes(TABLE_OFFSET, TABLE_BYTES)?);

    let hdr = SECTOR;
    primary.put_bytes(hdr, b"EFI PART")?;
    primary.put_u32(hdr + 8, REVISION)?;
    primary.put_u32(hdr + 12, HEADER_SIZE as u32)?;
    primary.put_u64(hdr + 24, 1)?;
    primary.put_u64(hdr + 32, layout.total_sectors - 1)?;
    primary.put_u64(hdr + 40, FIRST_USABLE)?;
    primary.put_u64(hdr + 48, layout.backup_start() - 1)?;
    primary.put_bytes(hdr + 56, &layout.disk_guid.to_bytes())?;
    primary.put_u64(hdr + 72, 2)?;
    primary.put_u32(hdr + 80, MAX_ENTRIES as u32)?;
    primary.put_u32(hdr + 84, ENTRY_SIZE as u32)?;
    primary.put_u32(hdr + 88, table_crc)?;
    header_crc(&mut primary, hdr)?;

    let mut backup = ImageBuffer::zeroed(BACKUP_SECTORS as usize * SECTOR);
    backup.put_bytes(0, primary.bytes(TABLE_OFFSET, TABLE_BYTES)?)?;
    let bhdr = TABLE_BYTES;
    backup.put_bytes(bhdr, primary.bytes(hdr, HEADER_SIZE)?)?;
    backup.put_u64(bhdr + 24, layout.total_sectors - 1)?;
    backup.put_u64(bhdr + 32, 1)?;
    backup.put_u64(bhdr + 72, layout.backup_start())?;
    header_crc(&mut backup, bhdr)?;

    if iso9660 {
        iso9660::write_descriptors(&mut primary, layout.esp_start, esp.len() as u64, timestamp)?;
    }
    log::debug!(
        "gpt: {} entries, {} sectors, backup at LBA {}",
        count,
        layout.total_sectors,
        layout.backup_start()
    );
    Ok(GptImage { primary, backup })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::disk::helpers::{Guid, EFI_SYSTEM_TYPE};
    use crate::artifact::disk::partitions::{plan, DiskGeometry, PartitionRequest, PartitionSource};

    fn esp(len: usize, fat32: bool, stage2_sector: Option<u32>) -> Esp {
        let mut image = ImageBuffer::zeroed(len);
        image.put_bytes(0, &[0xEB, 0x58, 0x90]).unwrap();
        image.fill(0x78, 0x1B8 - 0x78, 0xCC).unwrap();
        Esp {
            image,
            fat32,
            stage2_sector,
            payload_sectors: None,
        }
    }

    fn layout(requests: &[PartitionRequest]) -> DiskLayout {
        let geometry = DiskGeometry {
            disk_guid: "11111111-2222-3333-4444-555555555555".parse().unwrap(),
            disk_size_mib: 0,
            align_kib: 0,
        };
        plan(&geometry, 8 * 1024 * 1024, None, requests).unwrap()
    }

    #[test]
    fn test_protective_mbr() {
        let layout = layout(&[]);
        let mut esp = esp(8 * 1024 * 1024, false, Some(40));
        let gpt = build(&layout, &mut esp, false, 0).unwrap();
        let mbr = &gpt.primary;
        assert_eq!(mbr.len(), 128 * 512);
        assert_eq!(mbr.bytes(0, 3).unwrap(), &[0xEB, 0x58, 0x90]);
        assert_eq!(mbr.u32_at(0x1B0).unwrap(), 128 + 40);
        assert_eq!(esp.image.u32_at(0x1B0).unwrap(), 128 + 40);
        assert_eq!(mbr.u32_at(0x1B8).unwrap(), 0x1111_1111);
        assert_eq!(mbr.u8_at(0x1BE).unwrap(), 0x80);
        assert_eq!(mbr.u8_at(0x1C2).unwrap(), 0x0E);
        assert_eq!(mbr.u32_at(0x1C6).unwrap(), 128);
        assert_eq!(mbr.u32_at(0x1CA).unwrap(), 16384);
        assert_eq!(mbr.u8_at(0x1D2).unwrap(), 0xEE);
        assert_eq!(mbr.bytes(0x1FE, 2).unwrap(), &[0x55, 0xAA]);
    }

    #[test]
    fn test_header_and_entries() {
        let requests = [PartitionRequest {
            type_guid: crate::registry::LINUX_DATA,
            name: "root".to_string(),
            size_mib: 1,
            source: PartitionSource::Empty,
        }];
        let layout = layout(&requests);
        let gpt = build(&layout, &mut esp(8 * 1024 * 1024, true, None), false, 0).unwrap();
        let img = &gpt.primary;
        assert_eq!(img.bytes(512, 8).unwrap(), b"EFI PART");
        assert_eq!(img.u64_at(512 + 32).unwrap(), layout.total_sectors - 1);
        assert_eq!(img.u64_at(512 + 48).unwrap(), layout.total_sectors - 64);
        assert_eq!(img.u32_at(512 + 80).unwrap(), 248);

        let mut header = img.bytes(512, 92).unwrap().to_vec();
        let stored = u32::from_le_bytes(header[16..20].try_into().unwrap());
        header[16..20].fill(0);
        assert_eq!(crc32(&header), stored);
        assert_eq!(
            img.u32_at(512 + 88).unwrap(),
            crc32(img.bytes(1024, 248 * 128).unwrap())
        );

        let raw: [u8; 16] = img.bytes(1024, 16).unwrap().try_into().unwrap();
        assert_eq!(Guid::from_bytes(&raw), EFI_SYSTEM_TYPE);
        assert_eq!(img.u64_at(1024 + 32).unwrap(), 128);
        assert_eq!(img.bytes(1024 + 56, 6).unwrap(), b"E\0F\0I\0");
        assert_eq!(img.bytes(1024 + 128 + 56, 8).unwrap(), b"r\0o\0o\0t\0");
        assert_eq!(img.u8_at(0x1C2).unwrap(), 0x0C);
    }

    #[test]
    fn test_backup_header() {
        let layout = layout(&[]);
        let gpt = build(&layout, &mut esp(8 * 1024 * 1024, false, None), false, 0).unwrap();
        let backup = &gpt.backup;
        assert_eq!(backup.len(), 63 * 512);
        assert_eq!(backup.bytes(0, 128).unwrap(), gpt.primary.bytes(1024, 128).unwrap());
        let hdr = 62 * 512;
        assert_eq!(backup.bytes(hdr, 8).unwrap(), b"EFI PART");
        assert_eq!(backup.u64_at(hdr + 24).unwrap(), layout.total_sectors - 1);
        assert_eq!(backup.u64_at(hdr + 32).unwrap(), 1);
        assert_eq!(backup.u64_at(hdr + 72).unwrap(), layout.total_sectors - 63);
        let mut header = backup.bytes(hdr, 92).unwrap().to_vec();
        let stored = u32::from_le_bytes(header[16..20].try_into().unwrap());
        header[16..20].fill(0);
        assert_eq!(crc32(&header), stored);
    }

    #[test]
    fn test_iso_requires_aligned_stage2() {
        let layout = layout(&[]);
        let err = build(&layout, &mut esp(8 * 1024 * 1024, false, Some(41)), true, 0).unwrap_err();
        assert!(err.to_string().contains("2048-byte"));

        let gpt = build(&layout, &mut esp(8 * 1024 * 1024, false, Some(40)), true, 0).unwrap();
        assert_eq!(gpt.primary.bytes(16 * 2048 + 1, 5).unwrap(), b"CD001");
    }
}
