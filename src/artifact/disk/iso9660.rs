//! ISO9660 / El Torito overlay for hybrid images.
//!
//! The descriptors sit in the gap between the primary GPT and the ESP, so
//! the same image boots from a CD drive. UEFI finds the ESP through the
//! EFI section of the boot catalog; the BIOS entry points at the same
//! sectors.
//!
//! | CD sector | Content |
//! |-----------|---------|
//! | 16 | Primary Volume Descriptor |
//! | 17 | El Torito boot record |
//! | 18 | Descriptor set terminator |
//! | 19 | Boot catalog |
//! | 20 | Root directory |
//! | 21 | `BOOTBOOT.TXT` |

use time::OffsetDateTime;

use crate::fs::FsResult;
use crate::image::ImageBuffer;

pub const CD_SECTOR: usize = 2048;

const PVD_LBA: usize = 16;
const CATALOG_LBA: u32 = 19;
const ROOT_LBA: u32 = 20;
const README_LBA: u32 = 21;

const README: &[u8] = b"BOOTBOOT hybrid GPT / CDROM Image\r\n\r\nBootable as\r\n - CDROM (El Torito, UEFI)\r\n - USB stick (BIOS, UEFI)\r\n - SD card (Raspberry Pi 3+)";

/// Both-endian 32-bit field: little-endian then big-endian.
fn put_both32(img: &mut ImageBuffer, at: usize, value: u32) -> FsResult<()> {
    img.put_u32(at, value)?;
    img.put_bytes(at + 4, &value.to_be_bytes())
}

fn put_both16(img: &mut ImageBuffer, at: usize, value: u16) -> FsResult<()> {
    img.put_u16(at, value)?;
    img.put_bytes(at + 2, &value.to_be_bytes())
}

/// Seven-byte directory record date.
fn record_date(dt: &OffsetDateTime) -> [u8; 7] {
    [
        (dt.year() - 1900).clamp(0, 255) as u8,
        u8::from(dt.month()),
        dt.day(),
        dt.hour(),
        dt.minute(),
        dt.second(),
        0,
    ]
}

/// Seventeen-byte volume descriptor date, UTC.
fn volume_date(dt: &OffsetDateTime) -> [u8; 17] {
    let text = format!(
        "{:04}{:02}{:02}{:02}{:02}{:02}00",
        dt.year(),
        u8::from(dt.month()),
        dt.day(),
        dt.hour(),
        dt.minute(),
        dt.second()
    );
    let mut out = [0u8; 17];
    out[..16].copy_from_slice(&text.as_bytes()[..16]);
    out
}

fn dir_record(
    img: &mut ImageBuffer,
    at: usize,
    lba: u32,
    size: u32,
    date: &[u8; 7],
    directory: bool,
    name: &[u8],
) -> FsResult<usize> {
    let len = 33 + name.len() + (name.len() + 1) % 2;
    img.put_u8(at, len as u8)?;
    put_both32(img, at + 2, lba)?;
    put_both32(img, at + 10, size)?;
    img.put_bytes(at + 18, date)?;
    img.put_u8(at + 25, if directory { 2 } else { 0 })?;
    put_both16(img, at + 28, 1)?;
    img.put_u8(at + 32, name.len() as u8)?;
    img.put_bytes(at + 33, name)?;
    Ok(at + len)
}

fn fill_spaces(img: &mut ImageBuffer, at: usize, len: usize) -> FsResult<()> {
    img.fill(at, len, b' ')
}

/// Write the CD descriptors into `area`, the image region before the ESP.
///
/// `esp_start` is the ESP's first 512-byte sector; the boot catalog
/// addresses it in 2048-byte units.
pub fn write_descriptors(
    area: &mut ImageBuffer,
    esp_start: u64,
    esp_len: u64,
    timestamp: i64,
) -> FsResult<()> {
    let dt = OffsetDateTime::from_unix_timestamp(timestamp).unwrap_or(OffsetDateTime::UNIX_EPOCH);
    let date = record_date(&dt);
    let vdate = volume_date(&dt);
    let base = PVD_LBA * CD_SECTOR;
    area.grow_to(base + 6 * CD_SECTOR);

    // Primary Volume Descriptor
    let pvd = base;
    area.put_u8(pvd, 1)?;
    area.put_bytes(pvd + 1, b"CD001")?;
    area.put_u8(pvd + 6, 1)?;
    fill_spaces(area, pvd + 8, 64)?;
    area.put_bytes(pvd + 40, b"BOOTBOOT_CD")?;
    let head = esp_start * 512;
    let blocks = (head + esp_len).div_ceil(CD_SECTOR as u64) as u32;
    put_both32(area, pvd + 80, blocks)?;
    put_both16(area, pvd + 120, 1)?; // volume set size
    put_both16(area, pvd + 124, 1)?; // volume sequence number
    put_both16(area, pvd + 128, CD_SECTOR as u16)?;
    dir_record(area, pvd + 156, ROOT_LBA, CD_SECTOR as u32, &date, true, &[0])?;
    fill_spaces(area, pvd + 190, 623)?;
    area.put_bytes(pvd + 318, b"BOOTBOOT <HTTPS://GITLAB.COM/BZTSRC/BOOTBOOT>")?;
    area.put_bytes(pvd + 446, b"MKBOOTIMG")?;
    area.put_bytes(pvd + 574, b"BOOTABLE OS")?;
    area.put_bytes(pvd + 813, &vdate)?; // creation
    area.put_bytes(pvd + 830, &vdate)?; // modification
    area.fill(pvd + 847, 16, b'0')?; // expiration
    area.fill(pvd + 864, 16, b'0')?; // effective
    area.put_u8(pvd + 881, 1)?; // file structure version
    fill_spaces(area, pvd + 883, 512)?;

    // El Torito boot record
    let brd = base + CD_SECTOR;
    area.put_u8(brd, 0)?;
    area.put_bytes(brd + 1, b"CD001")?;
    area.put_u8(brd + 6, 1)?;
    area.put_bytes(brd + 7, b"EL TORITO SPECIFICATION")?;
    area.put_u32(brd + 71, CATALOG_LBA)?;

    // Terminator
    let term = base + 2 * CD_SECTOR;
    area.put_u8(term, 0xFF)?;
    area.put_bytes(term + 1, b"CD001")?;
    area.put_u8(term + 6, 1)?;

    // Boot catalog
    let esp_cd_lba = (esp_start / 4) as u32;
    let cat = base + 3 * CD_SECTOR;
    area.put_u8(cat, 1)?; // validation entry, platform 80x86
    area.put_bytes(cat + 28, &[0xAA, 0x55, 0x55, 0xAA])?;
    area.put_u8(cat + 32, 0x88)?; // bootable, no emulation
    area.put_u16(cat + 38, 4)?; // sector count
    area.put_u32(cat + 40, esp_cd_lba)?;
    area.put_u8(cat + 64, 0x91)?; // final section header
    area.put_u8(cat + 65, 0xEF)?; // platform EFI
    area.put_u16(cat + 66, 1)?;
    area.put_u8(cat + 96, 0x88)?;
    area.put_u32(cat + 104, esp_cd_lba)?;

    // Root directory
    let root = base + 4 * CD_SECTOR;
    let mut at = dir_record(area, root, ROOT_LBA, CD_SECTOR as u32, &date, true, &[0])?;
    at = dir_record(area, at, ROOT_LBA, CD_SECTOR as u32, &date, true, &[1])?;
    dir_record(area, at, README_LBA, README.len() as u32, &date, false, b"BOOTBOOT.TXT;1")?;

    area.put_bytes(base + 5 * CD_SECTOR, README)?;
    Ok(())
}
