//! FAT16/FAT32 image builder with VFAT long names.
//!
//! [`FatVolume`] owns the on-disk mechanics (boot sector, both FAT copies,
//! cluster chains, directory slots) and is shared with the EFI System
//! Partition builder, which only differs in geometry, label and naming.
//! [`FatBuilder`] is the generic partition driver: one sector per cluster,
//! FAT32 from 65525 sectors up, every name stored as a long name with a
//! `~<counter>LFN` alias.

use super::{Entry, FileKind, FsBuilder, FsError, FsResult, PartitionDescriptor};
use crate::image::ImageBuffer;
use time::OffsetDateTime;

const FORMAT: &str = "fat";

const SECTOR: usize = 512;
const DIR_ENTRY_SIZE: usize = 32;
const ROOT_ENTRIES_FAT16: usize = 512;
const MIN_CLUSTERS: u32 = 4085;
const FAT32_MIN_SECTORS: u64 = 65525;

const ATTR_VOLUME_ID: u8 = 0x08;
const ATTR_DIRECTORY: u8 = 0x10;
const ATTR_LONG_NAME: u8 = 0x0F;
const LFN_LAST: u8 = 0x40;
const LFN_UNITS: usize = 13;
const MAX_LFN_UNITS: usize = 255;
const DELETED: u8 = 0xE5;

const FAT16_EOC: u32 = 0xFFFF;
const FAT32_EOC: u32 = 0x0FFF_FFFF;
const FAT32_MEDIA: u32 = 0x0FFF_FFF8;

const FSINFO_FREE: usize = 0x3E8;
const FSINFO_NEXT: usize = 0x3EC;
const BACKUP_BOOT_SECTOR: usize = 6;

/// Parameters that distinguish one FAT volume layout from another.
#[derive(Debug, Clone)]
pub struct FatGeometry {
    pub total_sectors: u32,
    pub sectors_per_cluster: u8,
    pub fat32: bool,
    /// LBA of the volume on disk, stored in the BPB.
    pub hidden_sectors: u32,
    pub serial: u32,
    /// 11 characters, space padded.
    pub label: [u8; 11],
    /// Boot code copied into sector 0 before the BPB is written.
    pub boot_code: Option<Vec<u8>>,
}

/// How names are written into directory slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameStyle {
    /// Long name records plus a generated 8.3 alias.
    Long,
    /// Upper-cased 8.3 only, the extension starting at the first dot.
    Short,
}

/// A directory inside a [`FatVolume`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirRef {
    /// The fixed FAT16 root region.
    FixedRoot,
    Cluster(u32),
}

impl DirRef {
    fn cluster(self) -> u32 {
        match self {
            Self::FixedRoot => 0,
            Self::Cluster(c) => c,
        }
    }
}

/// A decoded directory slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirSlot {
    pub name: String,
    pub attr: u8,
    pub cluster: u32,
    pub size: u32,
    /// Byte offset of the short record inside the image.
    pub offset: usize,
}

impl DirSlot {
    pub fn is_dir(&self) -> bool {
        self.attr & ATTR_DIRECTORY != 0
    }
}

/// DOS packed date and time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DosStamp {
    pub time: u16,
    pub date: u16,
}

impl DosStamp {
    pub fn from_unix(seconds: i64) -> Self {
        let dt = OffsetDateTime::from_unix_timestamp(seconds)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH);
        if dt.year() < 1980 {
            return Self {
                time: 0,
                date: (1 << 5) | 1,
            };
        }
        let year = (dt.year() - 1980).min(127) as u16;
        Self {
            time: (dt.hour() as u16) << 11 | (dt.minute() as u16) << 5 | dt.second() as u16 / 2,
            date: year << 9 | (u8::from(dt.month()) as u16) << 5 | dt.day() as u16,
        }
    }
}

/// A formatted FAT volume being populated.
pub struct FatVolume {
    img: ImageBuffer,
    fat32: bool,
    bytes_per_cluster: usize,
    sectors_per_fat: usize,
    fat_offset: usize,
    root_offset: usize,
    /// Cluster `c` lives at `data_base + c * bytes_per_cluster`.
    data_base: usize,
    next_cluster: u32,
    /// One past the last usable cluster.
    cluster_limit: u32,
    alias_counter: u32,
}

impl FatVolume {
    /// Lay down the boot sector, both FATs and an empty root.
    pub fn format(geom: &FatGeometry) -> FsResult<Self> {
        let len = geom.total_sectors as usize * SECTOR;
        let spc = geom.sectors_per_cluster.max(1) as usize;
        let bytes_per_cluster = spc * SECTOR;
        let clusters = geom.total_sectors as usize / spc;
        let reserved = if geom.fat32 { 8 } else { 4 };
        let sectors_per_fat = if geom.fat32 {
            (clusters * 4 / SECTOR).saturating_sub(8)
        } else {
            (clusters * 2).div_ceil(SECTOR)
        };
        let fat_offset = reserved * SECTOR;
        let root_offset = (reserved + 2 * sectors_per_fat) * SECTOR;
        let data_base = if geom.fat32 {
            root_offset.checked_sub(2 * bytes_per_cluster)
        } else {
            (root_offset + ROOT_ENTRIES_FAT16 * DIR_ENTRY_SIZE).checked_sub(2 * bytes_per_cluster)
        }
        .ok_or(FsError::TooSmall { format: FORMAT })?;
        if data_base + 3 * bytes_per_cluster > len {
            return Err(FsError::TooSmall { format: FORMAT });
        }
        let fat_entries = sectors_per_fat * SECTOR / if geom.fat32 { 4 } else { 2 };
        let eoc_floor = if geom.fat32 { 0x0FFF_FFF7 } else { 0xFFF7 };
        let cluster_limit = ((len - data_base) / bytes_per_cluster)
            .min(fat_entries)
            .min(eoc_floor) as u32;

        let mut img = ImageBuffer::zeroed(len);
        if let Some(code) = &geom.boot_code {
            let n = code.len().min(SECTOR);
            img.put_bytes(0, &code[..n])?;
        } else if geom.fat32 {
            img.put_bytes(0, &[0xEB, 0x58, 0x90])?;
        } else {
            img.put_bytes(0, &[0xEB, 0x3C, 0x90])?;
        }
        img.put_bytes(3, b"MSWIN4.1")?;
        img.put_u16(0x0B, SECTOR as u16)?;
        img.put_u8(0x0D, spc as u8)?;
        img.put_u16(0x0E, reserved as u16)?;
        img.put_u8(0x10, 2)?; // FAT copies
        img.put_u8(0x15, 0xF8)?; // media: fixed disk
        img.put_u16(0x18, 0x20)?; // sectors per track
        img.put_u16(0x1A, 0x40)?; // heads
        img.put_u32(0x1C, geom.hidden_sectors)?;
        if geom.total_sectors > 0xFFFF {
            img.put_u32(0x20, geom.total_sectors)?;
        } else {
            img.put_u16(0x13, geom.total_sectors as u16)?;
        }
        let mut fstype = [b' '; 19];
        fstype[..11].copy_from_slice(&geom.label);
        if geom.fat32 {
            fstype[11..16].copy_from_slice(b"FAT32");
            img.put_u32(0x24, sectors_per_fat as u32)?;
            img.put_u32(0x2C, 2)?; // root cluster
            img.put_u16(0x30, 1)?; // FSInfo sector
            img.put_u16(0x32, BACKUP_BOOT_SECTOR as u16)?;
            img.put_u8(0x40, 0x80)?;
            img.put_u8(0x42, 0x29)?;
            img.put_u32(0x43, geom.serial)?;
            img.put_bytes(0x47, &fstype)?;
            img.put_bytes(0x200, b"RRaA")?;
            img.put_bytes(0x3E4, b"rrAa")?;
            img.put_u32(FSINFO_FREE, u32::MAX)?;
            img.put_u32(FSINFO_NEXT, u32::MAX)?;
            img.put_bytes(0x3FE, &[0x55, 0xAA])?;
        } else {
            fstype[11..16].copy_from_slice(b"FAT16");
            img.put_u16(0x11, ROOT_ENTRIES_FAT16 as u16)?;
            img.put_u16(0x16, sectors_per_fat as u16)?;
            img.put_u8(0x24, 0x80)?;
            img.put_u8(0x26, 0x29)?;
            img.put_u32(0x27, geom.serial)?;
            img.put_bytes(0x2B, &fstype)?;
        }
        img.put_bytes(0x1FE, &[0x55, 0xAA])?;

        let mut vol = Self {
            img,
            fat32: geom.fat32,
            bytes_per_cluster,
            sectors_per_fat,
            fat_offset,
            root_offset,
            data_base,
            next_cluster: if geom.fat32 { 3 } else { 2 },
            cluster_limit,
            alias_counter: 1,
        };
        if geom.fat32 {
            vol.set_fat(0, FAT32_MEDIA)?;
            vol.set_fat(1, FAT32_EOC)?;
            vol.set_fat(2, FAT32_EOC)?;
        } else {
            vol.set_fat(0, 0xFFF8)?;
            vol.set_fat(1, FAT16_EOC)?;
        }
        log::debug!(
            "fat: {} sectors, FAT{}, {} sectors per FAT, {} clusters",
            geom.total_sectors,
            if geom.fat32 { 32 } else { 16 },
            sectors_per_fat,
            cluster_limit
        );
        Ok(vol)
    }

    pub fn is_fat32(&self) -> bool {
        self.fat32
    }

    pub fn root(&self) -> DirRef {
        if self.fat32 {
            DirRef::Cluster(2)
        } else {
            DirRef::FixedRoot
        }
    }

    pub fn bytes_per_cluster(&self) -> usize {
        self.bytes_per_cluster
    }

    /// Sector, relative to the volume start, the next allocated cluster
    /// will occupy.
    pub fn next_free_sector(&self) -> u32 {
        ((self.data_base + self.next_cluster as usize * self.bytes_per_cluster) / SECTOR) as u32
    }

    pub fn image(&self) -> &ImageBuffer {
        &self.img
    }

    pub fn image_mut(&mut self) -> &mut ImageBuffer {
        &mut self.img
    }

    fn eoc(&self) -> u32 {
        if self.fat32 {
            FAT32_EOC
        } else {
            FAT16_EOC
        }
    }

    fn is_eoc(&self, value: u32) -> bool {
        if self.fat32 {
            value >= 0x0FFF_FFF8
        } else {
            value >= 0xFFF8
        }
    }

    pub fn fat_entry(&self, cluster: u32) -> FsResult<u32> {
        if self.fat32 {
            Ok(self.img.u32_at(self.fat_offset + cluster as usize * 4)? & 0x0FFF_FFFF)
        } else {
            Ok(self.img.u16_at(self.fat_offset + cluster as usize * 2)? as u32)
        }
    }

    /// Write `value` into both FAT copies.
    fn set_fat(&mut self, cluster: u32, value: u32) -> FsResult<()> {
        let second = self.sectors_per_fat * SECTOR;
        if self.fat32 {
            let at = self.fat_offset + cluster as usize * 4;
            self.img.put_u32(at, value)?;
            self.img.put_u32(at + second, value)
        } else {
            let at = self.fat_offset + cluster as usize * 2;
            self.img.put_u16(at, value as u16)?;
            self.img.put_u16(at + second, value as u16)
        }
    }

    pub fn cluster_offset(&self, cluster: u32) -> usize {
        self.data_base + cluster as usize * self.bytes_per_cluster
    }

    /// Allocate `count` contiguous clusters chained together.
    fn alloc_chain(&mut self, count: u32) -> FsResult<u32> {
        if count == 0 {
            return Ok(0);
        }
        let first = self.next_cluster;
        if first as u64 + count as u64 > self.cluster_limit as u64 {
            return Err(FsError::NoSpace {
                format: FORMAT,
                what: "clusters",
            });
        }
        for c in first..first + count - 1 {
            self.set_fat(c, c + 1)?;
        }
        let eoc = self.eoc();
        self.set_fat(first + count - 1, eoc)?;
        self.next_cluster += count;
        Ok(first)
    }

    /// Clusters of the chain starting at `first`.
    pub fn chain(&self, first: u32) -> FsResult<Vec<u32>> {
        let mut out = Vec::new();
        let mut cluster = first;
        while cluster >= 2 && !self.is_eoc(cluster) && out.len() <= self.cluster_limit as usize {
            out.push(cluster);
            cluster = self.fat_entry(cluster)?;
        }
        Ok(out)
    }

    fn dir_slots(&self, dir: DirRef) -> FsResult<Vec<usize>> {
        match dir {
            DirRef::FixedRoot => Ok((0..ROOT_ENTRIES_FAT16)
                .map(|i| self.root_offset + i * DIR_ENTRY_SIZE)
                .collect()),
            DirRef::Cluster(first) => {
                let per_cluster = self.bytes_per_cluster / DIR_ENTRY_SIZE;
                let mut slots = Vec::new();
                for cluster in self.chain(first)? {
                    let base = self.cluster_offset(cluster);
                    slots.extend((0..per_cluster).map(|i| base + i * DIR_ENTRY_SIZE));
                }
                Ok(slots)
            }
        }
    }

    /// Decode every live record of `dir`, joining long names to their
    /// short records. Volume labels are skipped.
    pub fn read_dir(&self, dir: DirRef) -> FsResult<Vec<DirSlot>> {
        let mut out = Vec::new();
        let mut lfn: Vec<u16> = Vec::new();
        for at in self.dir_slots(dir)? {
            let first = self.img.u8_at(at)?;
            if first == 0 {
                break;
            }
            if first == DELETED {
                lfn.clear();
                continue;
            }
            let attr = self.img.u8_at(at + 11)?;
            if attr == ATTR_LONG_NAME {
                let seq = (first & 0x3F) as usize;
                if seq == 0 {
                    continue;
                }
                if lfn.len() < seq * LFN_UNITS {
                    lfn.resize(seq * LFN_UNITS, 0);
                }
                let units = &mut lfn[(seq - 1) * LFN_UNITS..seq * LFN_UNITS];
                for (i, unit) in units.iter_mut().enumerate() {
                    let off = match i {
                        0..=4 => 1 + i * 2,
                        5..=10 => 14 + (i - 5) * 2,
                        _ => 28 + (i - 11) * 2,
                    };
                    *unit = self.img.u16_at(at + off)?;
                }
                continue;
            }
            if attr & ATTR_VOLUME_ID != 0 {
                lfn.clear();
                continue;
            }
            let name = if lfn.is_empty() {
                short_name_string(self.img.bytes(at, 11)?)
            } else {
                let end = lfn
                    .iter()
                    .position(|&u| u == 0 || u == 0xFFFF)
                    .unwrap_or(lfn.len());
                String::from_utf16_lossy(&lfn[..end])
            };
            lfn.clear();
            let cluster =
                (self.img.u16_at(at + 0x14)? as u32) << 16 | self.img.u16_at(at + 0x1A)? as u32;
            out.push(DirSlot {
                name,
                attr,
                cluster,
                size: self.img.u32_at(at + 0x1C)?,
                offset: at,
            });
        }
        Ok(out)
    }

    pub fn lookup(&self, dir: DirRef, name: &str) -> FsResult<Option<DirSlot>> {
        Ok(self
            .read_dir(dir)?
            .into_iter()
            .find(|slot| {
                slot.name == name
                    || (is_short_alias(&slot.name) && slot.name.eq_ignore_ascii_case(name))
            }))
    }

    /// Reserve `count` consecutive free slots at the end of `dir`, growing
    /// the cluster chain when needed.
    fn reserve_slots(&mut self, dir: DirRef, count: usize, path: &str) -> FsResult<Vec<usize>> {
        let mut slots = self.dir_slots(dir)?;
        let mut used = 0;
        while used < slots.len() && self.img.u8_at(slots[used])? != 0 {
            used += 1;
        }
        while slots.len() < used + count {
            let DirRef::Cluster(first) = dir else {
                return Err(FsError::DirFull {
                    format: FORMAT,
                    path: path.to_string(),
                });
            };
            let last = self.chain(first)?.last().copied().unwrap_or(first);
            let fresh = self.alloc_chain(1)?;
            self.set_fat(last, fresh)?;
            let base = self.cluster_offset(fresh);
            slots.extend(
                (0..self.bytes_per_cluster / DIR_ENTRY_SIZE).map(|i| base + i * DIR_ENTRY_SIZE),
            );
        }
        Ok(slots[used..used + count].to_vec())
    }

    fn write_short(&mut self, at: usize, name: &[u8; 11], attr: u8, cluster: u32, size: u32, stamp: DosStamp) -> FsResult<()> {
        self.img.put_bytes(at, name)?;
        self.img.put_u8(at + 0x0B, attr)?;
        self.img.put_u16(at + 0x0E, stamp.time)?;
        self.img.put_u16(at + 0x10, stamp.date)?;
        self.img.put_u16(at + 0x12, stamp.date)?;
        self.img.put_u16(at + 0x14, (cluster >> 16) as u16)?;
        self.img.put_u16(at + 0x16, stamp.time)?;
        self.img.put_u16(at + 0x18, stamp.date)?;
        self.img.put_u16(at + 0x1A, cluster as u16)?;
        self.img.put_u32(at + 0x1C, size)
    }

    /// Write one directory record (long or short) pointing at `cluster`.
    #[allow(clippy::too_many_arguments)]
    pub fn add_record(
        &mut self,
        dir: DirRef,
        name: &str,
        style: NameStyle,
        attr: u8,
        cluster: u32,
        size: u32,
        stamp: DosStamp,
        path: &str,
    ) -> FsResult<usize> {
        match style {
            NameStyle::Short => {
                let short = short_name(name);
                let at = self.reserve_slots(dir, 1, path)?[0];
                self.write_short(at, &short, attr, cluster, size, stamp)?;
                Ok(at)
            }
            NameStyle::Long => {
                let units: Vec<u16> = name.encode_utf16().collect();
                if units.len() > MAX_LFN_UNITS {
                    return Err(FsError::NameTooLong {
                        format: FORMAT,
                        path: path.to_string(),
                    });
                }
                let alias = self.next_alias();
                let sum = lfn_checksum(&alias);
                let records = units.len().div_ceil(LFN_UNITS);
                let slots = self.reserve_slots(dir, records + 1, path)?;
                for (k, &at) in slots[..records].iter().enumerate() {
                    let seq = records - k;
                    let mut piece = [0xFFFFu16; LFN_UNITS];
                    for (i, unit) in piece.iter_mut().enumerate() {
                        let idx = (seq - 1) * LFN_UNITS + i;
                        if idx < units.len() {
                            *unit = units[idx];
                        } else if idx == units.len() {
                            *unit = 0;
                        }
                    }
                    let mut first = seq as u8;
                    if k == 0 {
                        first |= LFN_LAST;
                    }
                    self.img.put_u8(at, first)?;
                    self.img.put_u8(at + 11, ATTR_LONG_NAME)?;
                    self.img.put_u8(at + 13, sum)?;
                    for (i, unit) in piece.iter().enumerate() {
                        let off = match i {
                            0..=4 => 1 + i * 2,
                            5..=10 => 14 + (i - 5) * 2,
                            _ => 28 + (i - 11) * 2,
                        };
                        self.img.put_u16(at + off, *unit)?;
                    }
                }
                let at = slots[records];
                self.write_short(at, &alias, attr, cluster, size, stamp)?;
                Ok(at)
            }
        }
    }

    fn next_alias(&mut self) -> [u8; 11] {
        let text = format!("~{:07x}LFN", self.alias_counter & 0x0FFF_FFFF);
        self.alias_counter += 1;
        let mut alias = [b' '; 11];
        alias.copy_from_slice(&text.as_bytes()[..11]);
        alias
    }

    /// Create a directory seeded with "." and "..".
    pub fn mkdir(&mut self, parent: DirRef, name: &str, style: NameStyle, stamp: DosStamp, path: &str) -> FsResult<DirRef> {
        let cluster = self.alloc_chain(1)?;
        self.add_record(parent, name, style, ATTR_DIRECTORY, cluster, 0, stamp, path)?;
        let base = self.cluster_offset(cluster);
        self.write_short(base, b".          ", ATTR_DIRECTORY, cluster, 0, stamp)?;
        let up = match parent {
            DirRef::Cluster(2) if self.fat32 => 0,
            other => other.cluster(),
        };
        self.write_short(base + DIR_ENTRY_SIZE, b"..         ", ATTR_DIRECTORY, up, 0, stamp)?;
        Ok(DirRef::Cluster(cluster))
    }

    /// Store `data` in fresh contiguous clusters and link it into `parent`.
    pub fn write_file(&mut self, parent: DirRef, name: &str, style: NameStyle, data: &[u8], stamp: DosStamp, path: &str) -> FsResult<u32> {
        let size = u32::try_from(data.len()).map_err(|_| FsError::TooBig {
            format: FORMAT,
            path: path.to_string(),
        })?;
        let count = data.len().div_ceil(self.bytes_per_cluster) as u32;
        let first = self.alloc_chain(count)?;
        if first != 0 {
            let at = self.cluster_offset(first);
            self.img.put_bytes(at, data)?;
        }
        self.add_record(parent, name, style, 0x20, first, size, stamp, path)?;
        Ok(first)
    }

    /// Volume label record in the root directory.
    pub fn add_volume_label(&mut self, label: &[u8; 11], stamp: DosStamp) -> FsResult<()> {
        let root = self.root();
        let at = self.reserve_slots(root, 1, "/")?[0];
        self.write_short(at, label, ATTR_VOLUME_ID, 0, 0, stamp)
    }

    /// Walk `components` from the root, requiring each to be a directory.
    pub fn resolve_dir(&self, components: &[&str], path: &str) -> FsResult<DirRef> {
        let mut dir = self.root();
        for name in components {
            match self.lookup(dir, name)? {
                Some(slot) if slot.is_dir() => dir = DirRef::Cluster(slot.cluster),
                _ => {
                    return Err(FsError::NotFound {
                        format: FORMAT,
                        path: path.to_string(),
                    })
                }
            }
        }
        Ok(dir)
    }

    /// Finish FSInfo and the FAT32 backup boot sectors.
    pub fn finish(mut self) -> FsResult<ImageBuffer> {
        if self.fat32 {
            let free = self.cluster_limit.saturating_sub(self.next_cluster);
            self.img.put_u32(FSINFO_FREE, free)?;
            self.img.put_u32(FSINFO_NEXT, self.next_cluster)?;
            self.img
                .copy_within(0, BACKUP_BOOT_SECTOR * SECTOR, 2 * SECTOR)?;
        }
        Ok(self.img)
    }
}

/// 8.3 name, upper-cased, extension starting after the first dot.
pub fn short_name(name: &str) -> [u8; 11] {
    let mut out = [b' '; 11];
    if name == "." || name == ".." {
        out[..name.len()].copy_from_slice(name.as_bytes());
        return out;
    }
    let (base, ext) = match name.find('.') {
        Some(dot) => (&name[..dot], &name[dot + 1..]),
        None => (name, ""),
    };
    for (slot, b) in out[..8].iter_mut().zip(base.bytes()) {
        *slot = b.to_ascii_uppercase();
    }
    for (slot, b) in out[8..].iter_mut().zip(ext.bytes()) {
        *slot = b.to_ascii_uppercase();
    }
    out
}

fn short_name_string(raw: &[u8]) -> String {
    let base = String::from_utf8_lossy(&raw[..8]).trim_end().to_string();
    let ext = String::from_utf8_lossy(&raw[8..11]).trim_end().to_string();
    if ext.is_empty() {
        base
    } else {
        format!("{base}.{ext}")
    }
}

fn is_short_alias(name: &str) -> bool {
    name.len() <= 12 && !name.bytes().any(|b| b.is_ascii_lowercase())
}

/// Checksum of an 8.3 alias stored in each of its long name records.
pub fn lfn_checksum(alias: &[u8; 11]) -> u8 {
    alias
        .iter()
        .fold(0u8, |c, &b| ((c & 1) << 7 | (c & 0xFE) >> 1).wrapping_add(b))
}

/// Generic FAT16/32 partition driver.
pub struct FatBuilder {
    vol: FatVolume,
}

impl FsBuilder for FatBuilder {
    fn open(part: Option<&PartitionDescriptor>) -> FsResult<Self> {
        let part = part.ok_or(FsError::Unsupported {
            format: FORMAT,
            reason: "FAT cannot be used as an initrd",
        })?;
        let sectors = part.sectors();
        if sectors < MIN_CLUSTERS as u64 {
            return Err(FsError::TooSmall { format: FORMAT });
        }
        let total_sectors = u32::try_from(sectors).map_err(|_| FsError::Unsupported {
            format: FORMAT,
            reason: "partition exceeds 2^32 sectors",
        })?;
        let serial_bytes = part.part_guid.to_bytes();
        let geom = FatGeometry {
            total_sectors,
            sectors_per_cluster: 1,
            fat32: sectors >= FAT32_MIN_SECTORS,
            hidden_sectors: part.start_lba as u32,
            serial: u32::from_le_bytes([
                serial_bytes[0],
                serial_bytes[1],
                serial_bytes[2],
                serial_bytes[3],
            ]),
            label: *b"NO NAME    ",
            boot_code: None,
        };
        let vol = FatVolume::format(&geom)?;
        // A FAT16 volume under 4085 data clusters would be read as FAT12.
        if !geom.fat32 && vol.cluster_limit.saturating_sub(2) < MIN_CLUSTERS {
            return Err(FsError::TooSmall { format: FORMAT });
        }
        log::info!(
            "fat: formatted {} sectors as FAT{}",
            total_sectors,
            if geom.fat32 { 32 } else { 16 }
        );
        Ok(Self { vol })
    }

    fn add(&mut self, entry: &Entry) -> FsResult<()> {
        if entry.is_skipped(false) {
            return Ok(());
        }
        if entry.kind() == FileKind::Symlink {
            log::warn!("fat: skipping symlink {}", entry.path);
            return Ok(());
        }
        let (parents, leaf) = entry.split();
        let parent = self.vol.resolve_dir(&parents, &entry.path)?;
        let stamp = DosStamp::from_unix(entry.meta.mtime);
        match entry.kind() {
            FileKind::Directory => {
                self.vol
                    .mkdir(parent, leaf, NameStyle::Long, stamp, &entry.path)?;
            }
            _ => {
                let first = self.vol.write_file(
                    parent,
                    leaf,
                    NameStyle::Long,
                    &entry.content,
                    stamp,
                    &entry.path,
                )?;
                log::debug!("fat: {} at cluster {}", entry.path, first);
            }
        }
        Ok(())
    }

    fn close(self: Box<Self>) -> FsResult<ImageBuffer> {
        self.vol.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::testutil::partition;

    fn open(sectors: u64) -> FatBuilder {
        FatBuilder::open(Some(&partition(sectors))).unwrap()
    }

    #[test]
    fn test_long_name_records() {
        let mut fs = open(8192);
        let name = "a".repeat(60) + ".bin";
        assert_eq!(name.len(), 64);
        fs.add(&Entry::file(name.clone(), b"payload".to_vec(), 0o644))
            .unwrap();
        let root = fs.vol.root_offset;
        let img = &fs.vol.img;
        for k in 0..5 {
            assert_eq!(img.u8_at(root + k * 32 + 11).unwrap(), ATTR_LONG_NAME);
        }
        assert_eq!(img.u8_at(root).unwrap(), LFN_LAST | 5);
        assert_eq!(img.u8_at(root + 4 * 32).unwrap(), 1);
        let short = root + 5 * 32;
        assert_ne!(img.u8_at(short + 11).unwrap(), ATTR_LONG_NAME);
        let mut alias = [0u8; 11];
        alias.copy_from_slice(img.bytes(short, 11).unwrap());
        assert_eq!(&alias, b"~0000001LFN");
        assert_eq!(img.u8_at(root + 13).unwrap(), lfn_checksum(&alias));
        assert_eq!(img.u8_at(short + 32).unwrap(), 0);

        let slot = fs.vol.lookup(DirRef::FixedRoot, &name).unwrap().unwrap();
        assert_eq!(slot.size, 7);
        assert_eq!(
            fs.vol.image().bytes(fs.vol.cluster_offset(slot.cluster), 7).unwrap(),
            b"payload"
        );
    }

    #[test]
    fn test_fat16_boot_sector() {
        let fs = open(8192);
        let img = Box::new(fs).close().unwrap();
        assert_eq!(img.bytes(3, 8).unwrap(), b"MSWIN4.1");
        assert_eq!(img.u16_at(0x13).unwrap(), 8192);
        assert_eq!(img.u32_at(0x1C).unwrap(), 2048);
        assert_eq!(img.u16_at(0x16).unwrap(), 32);
        assert_eq!(img.bytes(0x2B, 19).unwrap(), b"NO NAME    FAT16   ");
        assert_eq!(img.u32_at(0x27).unwrap(), 0x1234_5678);
        assert_eq!(img.bytes(0x1FE, 2).unwrap(), &[0x55, 0xAA]);
        assert_eq!(img.u16_at(4 * 512).unwrap(), 0xFFF8);
    }

    #[test]
    fn test_fat32_fsinfo_and_backup() {
        let mut fs = open(70000);
        assert!(fs.vol.is_fat32());
        fs.add(&Entry::dir("EFI", 0o755)).unwrap();
        fs.add(&Entry::file("EFI/a.txt", vec![7u8; 1500], 0o644)).unwrap();
        let img = Box::new(fs).close().unwrap();
        assert_eq!(img.bytes(0x200, 4).unwrap(), b"RRaA");
        assert_eq!(img.bytes(0x3E4, 4).unwrap(), b"rrAa");
        // root, EFI, three data clusters
        assert_eq!(img.u32_at(FSINFO_NEXT).unwrap(), 7);
        assert_eq!(img.bytes(0, 1024).unwrap(), img.bytes(6 * 512, 1024).unwrap());
        assert_eq!(img.u32_at(0x20).unwrap(), 70000);
    }

    #[test]
    fn test_fat32_free_count_matches_fat() {
        for sectors in [70000, 140000] {
            let mut fs = open(sectors);
            fs.add(&Entry::dir("EFI", 0o755)).unwrap();
            fs.add(&Entry::file("EFI/a.txt", vec![7u8; 5000], 0o644)).unwrap();
            let limit = fs.vol.cluster_limit;
            let zero = (2..limit)
                .filter(|&c| fs.vol.fat_entry(c).unwrap() == 0)
                .count() as u32;
            let img = Box::new(fs).close().unwrap();
            assert_eq!(img.u32_at(FSINFO_FREE).unwrap(), zero);
            assert!(zero > 0 && zero < limit - 2);
        }
    }

    #[test]
    fn test_nested_directories_and_dot_entries() {
        let mut fs = open(8192);
        fs.add(&Entry::dir("boot", 0o755)).unwrap();
        fs.add(&Entry::dir("boot/grub", 0o755)).unwrap();
        fs.add(&Entry::file("boot/grub/cfg", b"x".to_vec(), 0o644)).unwrap();
        let boot = fs.vol.resolve_dir(&["boot"], "boot").unwrap();
        let grub = fs.vol.resolve_dir(&["boot", "grub"], "boot/grub").unwrap();
        let entries = fs.vol.read_dir(grub).unwrap();
        assert_eq!(entries[0].name, ".");
        assert_eq!(DirRef::Cluster(entries[0].cluster), grub);
        assert_eq!(entries[1].name, "..");
        assert_eq!(DirRef::Cluster(entries[1].cluster), boot);
        assert_eq!(entries[2].name, "cfg");
        let boot_entries = fs.vol.read_dir(boot).unwrap();
        assert_eq!(boot_entries[1].cluster, 0);
    }

    #[test]
    fn test_directory_grows_into_new_cluster() {
        let mut fs = open(8192);
        fs.add(&Entry::dir("d", 0o755)).unwrap();
        // 16 slots per cluster; each short-named file takes 2
        for i in 0..12 {
            fs.add(&Entry::file(format!("d/f{i}"), Vec::new(), 0o644)).unwrap();
        }
        let d = fs.vol.resolve_dir(&["d"], "d").unwrap();
        let DirRef::Cluster(first) = d else { panic!() };
        assert_eq!(fs.vol.chain(first).unwrap().len(), 2);
        let names: Vec<String> = fs.vol.read_dir(d).unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(names.len(), 14);
        assert_eq!(names[13], "f11");
    }

    #[test]
    fn test_errors() {
        assert_eq!(
            FatBuilder::open(Some(&partition(4000))).err(),
            Some(FsError::TooSmall { format: "fat" })
        );
        let mut fs = open(8192);
        assert_eq!(
            fs.add(&Entry::file("missing/x", Vec::new(), 0o644)),
            Err(FsError::NotFound {
                format: "fat",
                path: "missing/x".into()
            })
        );
        let long = "n".repeat(300);
        assert!(matches!(
            fs.add(&Entry::file(long, Vec::new(), 0o644)),
            Err(FsError::NameTooLong { .. })
        ));
    }

    #[test]
    fn test_short_names_and_stamps() {
        assert_eq!(&short_name("config"), b"CONFIG     ");
        assert_eq!(&short_name("BOOTX64.EFI"), b"BOOTX64 EFI");
        assert_eq!(&short_name(".."), b"..         ");
        let stamp = DosStamp::from_unix(1_700_000_000); // 2023-11-14 22:13:20
        assert_eq!(stamp.date, (43 << 9) | (11 << 5) | 14);
        assert_eq!(stamp.time, (22 << 11) | (13 << 5) | 10);
    }
}
