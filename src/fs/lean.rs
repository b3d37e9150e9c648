//! LeanFS image builder.
//!
//! 512-byte sectors grouped in bands of 4096. Sectors 0..31 are left for a
//! loader, the superblock sits at sector 32 and band 0's bitmap right after
//! it; every later band keeps its bitmap in its own first sector. Inodes
//! occupy one sector with inline extended attributes, so file and directory
//! data start at the sector after the inode, which is also why the first
//! extent of every inode begins at the inode itself.

use super::{build_time, Entry, FileKind, FsBuilder, FsError, FsResult, PartitionDescriptor};
use crate::image::ImageBuffer;

const FORMAT: &str = "lean";

const SECTOR: usize = 512;
const SUPER_MAGIC: &[u8; 4] = b"LEAN";
const SUPER_VERSION: u16 = 0x0007;
const INODE_MAGIC: &[u8; 4] = b"NODE";
const EXTENT_COUNT: usize = 6;
const PREALLOC: u8 = 7;
const LOG_BAND_SIZE: u8 = 12;
const BAND_SECTORS: u64 = 1 << LOG_BAND_SIZE;
const BITMAP_SECTORS: u64 = 1;
const INODE_SIZE: usize = 176;
const PRIMARY_SUPER: u64 = 32;
const MIN_SECTORS: u64 = 43;

const FT_REG: u8 = 1;
const FT_DIR: u8 = 2;
const FT_LNK: u8 = 3;
const ATTR_PREALLOC: u32 = 1 << 18;
const ATTR_INLINEXTATTR: u32 = 1 << 19;

// Superblock field offsets, relative to the superblock sector
const SB_CHECKSUM: usize = 0;
const SB_FREE: usize = 104;
const SB_ROOT: usize = 136;

// Inode field offsets
const I_CHECKSUM: usize = 0;
const I_EXTENT_COUNT: usize = 8;
const I_LINKS: usize = 16;
const I_UID: usize = 20;
const I_GID: usize = 24;
const I_ATTRIBUTES: usize = 28;
const I_FILE_SIZE: usize = 32;
const I_SECTOR_COUNT: usize = 40;
const I_TIMES: usize = 48;
const I_EXTENT_START: usize = 104;
const I_EXTENT_SIZE: usize = 152;

/// Rotate-and-add checksum over `words` 32-bit words, skipping the first
/// (which holds the checksum itself).
fn checksum(data: &[u8], words: usize) -> u32 {
    data.chunks_exact(4)
        .take(words)
        .skip(1)
        .fold(0u32, |acc, w| {
            acc.rotate_right(1)
                .wrapping_add(u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        })
}

pub struct LeanBuilder {
    img: ImageBuffer,
    sectors: u64,
    bitmap_start: u64,
    backup_super: u64,
    next: u64,
    root: u64,
}

impl LeanBuilder {
    fn sb(&self) -> usize {
        PRIMARY_SUPER as usize * SECTOR
    }

    fn bitmap_sector(&self, band: u64) -> u64 {
        if band == 0 {
            self.bitmap_start
        } else {
            band * BAND_SECTORS
        }
    }

    fn is_used(&self, sector: u64) -> FsResult<bool> {
        let bitmap = self.bitmap_sector(sector / BAND_SECTORS) as usize * SECTOR;
        self.img.bit(bitmap, (sector % BAND_SECTORS) as usize)
    }

    fn mark_used(&mut self, sector: u64) -> FsResult<()> {
        let bitmap = self.bitmap_sector(sector / BAND_SECTORS) as usize * SECTOR;
        self.img.set_bit(bitmap, (sector % BAND_SECTORS) as usize)
    }

    fn alloc_sector(&mut self) -> FsResult<u64> {
        while self.next < self.sectors && self.is_used(self.next)? {
            self.next += 1;
        }
        let free = self.img.u64_at(self.sb() + SB_FREE)?;
        if self.next >= self.sectors || free == 0 {
            return Err(FsError::NoSpace {
                format: FORMAT,
                what: "sectors",
            });
        }
        let sector = self.next;
        self.mark_used(sector)?;
        self.img.put_u64(self.sb() + SB_FREE, free - 1)?;
        self.next += 1;
        Ok(sector)
    }

    fn inode(ino: u64) -> usize {
        ino as usize * SECTOR
    }

    fn seal(&mut self, ino: u64) -> FsResult<()> {
        let at = Self::inode(ino);
        let sum = checksum(self.img.bytes(at, INODE_SIZE)?, INODE_SIZE / 4);
        self.img.put_u32(at + I_CHECKSUM, sum)
    }

    fn extents(&self, ino: u64) -> FsResult<Vec<(u64, u32)>> {
        let at = Self::inode(ino);
        let count = self.img.u8_at(at + I_EXTENT_COUNT)? as usize;
        (0..count.min(EXTENT_COUNT))
            .map(|i| {
                Ok((
                    self.img.u64_at(at + I_EXTENT_START + i * 8)?,
                    self.img.u32_at(at + I_EXTENT_SIZE + i * 4)?,
                ))
            })
            .collect()
    }

    /// Append `sector` to the inode, extending the last extent when
    /// contiguous.
    fn add_to_inode(&mut self, ino: u64, sector: u64, path: &str) -> FsResult<()> {
        let at = Self::inode(ino);
        let count = self.img.u8_at(at + I_EXTENT_COUNT)? as usize;
        let last = count - 1;
        let start = self.img.u64_at(at + I_EXTENT_START + last * 8)?;
        let size = self.img.u32_at(at + I_EXTENT_SIZE + last * 4)?;
        if start + size as u64 == sector {
            self.img.put_u32(at + I_EXTENT_SIZE + last * 4, size + 1)?;
        } else if count < EXTENT_COUNT {
            self.img.put_u8(at + I_EXTENT_COUNT, count as u8 + 1)?;
            self.img.put_u64(at + I_EXTENT_START + count * 8, sector)?;
            self.img.put_u32(at + I_EXTENT_SIZE + count * 4, 1)?;
        } else {
            return Err(FsError::TooBig {
                format: FORMAT,
                path: path.to_string(),
            });
        }
        let sectors = self.img.u64_at(at + I_SECTOR_COUNT)?;
        self.img.put_u64(at + I_SECTOR_COUNT, sectors + 1)?;
        self.seal(ino)
    }

    fn alloc_inode(&mut self, mode: u32, kind: u8, size: u64, uid: u32, gid: u32, seconds: i64) -> FsResult<u64> {
        let ino = self.alloc_sector()?;
        let at = Self::inode(ino);
        self.img.put_bytes(at + 4, INODE_MAGIC)?;
        let mut attributes = (mode & 0xFFF) | (kind as u32) << 29 | ATTR_INLINEXTATTR;
        if kind == FT_DIR {
            attributes |= ATTR_PREALLOC;
        }
        self.img.put_u32(at + I_ATTRIBUTES, attributes)?;
        self.img.put_u32(at + I_UID, uid)?;
        self.img.put_u32(at + I_GID, gid)?;
        let micros = (seconds.max(0) as u64).saturating_mul(1_000_000);
        for k in 0..4 {
            self.img.put_u64(at + I_TIMES + k * 8, micros)?;
        }
        self.img.put_u8(at + I_EXTENT_COUNT, 1)?;
        self.img.put_u64(at + I_EXTENT_START, ino)?;
        self.img.put_u32(at + I_EXTENT_SIZE, 1)?;
        self.img.put_u64(at + I_SECTOR_COUNT, 1)?;
        if kind == FT_DIR {
            for _ in 0..PREALLOC {
                let sector = self.alloc_sector()?;
                self.add_to_inode(ino, sector, "")?;
            }
        } else {
            self.img.put_u64(at + I_FILE_SIZE, size)?;
        }
        self.seal(ino)?;
        Ok(ino)
    }

    /// Image offset of byte `pos` of an inode's data, which begins one
    /// sector into the first extent.
    fn data_offset(&self, ino: u64, pos: u64) -> FsResult<Option<usize>> {
        let mut skip = pos + SECTOR as u64;
        for (start, size) in self.extents(ino)? {
            let bytes = size as u64 * SECTOR as u64;
            if skip < bytes {
                return Ok(Some((start * SECTOR as u64 + skip) as usize));
            }
            skip -= bytes;
        }
        Ok(None)
    }

    fn read_data(&self, ino: u64, pos: u64, len: usize) -> FsResult<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        for i in 0..len as u64 {
            let at = self.data_offset(ino, pos + i)?.ok_or(FsError::OutOfBounds {
                offset: (pos + i) as usize,
                len: 1,
                size: 0,
            })?;
            out.push(self.img.u8_at(at)?);
        }
        Ok(out)
    }

    fn write_data(&mut self, ino: u64, pos: u64, bytes: &[u8]) -> FsResult<()> {
        for (i, &b) in bytes.iter().enumerate() {
            let at = self.data_offset(ino, pos + i as u64)?.ok_or(FsError::OutOfBounds {
                offset: pos as usize + i,
                len: 1,
                size: 0,
            })?;
            self.img.put_u8(at, b)?;
        }
        Ok(())
    }

    fn add_dirent(&mut self, dir: u64, ino: u64, kind: u8, name: &str, path: &str) -> FsResult<()> {
        if name.len() > u16::MAX as usize {
            return Err(FsError::NameTooLong {
                format: FORMAT,
                path: path.to_string(),
            });
        }
        let rec_len = 16 + if name.len() < 4 { 0 } else { (name.len() + 11) & !15 };
        if rec_len / 16 > u8::MAX as usize {
            return Err(FsError::NameTooLong {
                format: FORMAT,
                path: path.to_string(),
            });
        }
        let at = Self::inode(dir);
        let used = self.img.u64_at(at + I_FILE_SIZE)?;
        loop {
            let capacity = (self.img.u64_at(at + I_SECTOR_COUNT)? - 1) * SECTOR as u64;
            if used + rec_len as u64 <= capacity {
                break;
            }
            let sector = self.alloc_sector()?;
            self.add_to_inode(dir, sector, path)
                .map_err(|_| FsError::DirFull {
                    format: FORMAT,
                    path: path.to_string(),
                })?;
        }
        let mut record = vec![0u8; rec_len];
        record[..8].copy_from_slice(&ino.to_le_bytes());
        record[8] = kind;
        record[9] = (rec_len / 16) as u8;
        record[10..12].copy_from_slice(&(name.len() as u16).to_le_bytes());
        record[12..12 + name.len()].copy_from_slice(name.as_bytes());
        self.write_data(dir, used, &record)?;
        self.img.put_u64(at + I_FILE_SIZE, used + rec_len as u64)?;
        self.seal(dir)?;

        let target = Self::inode(ino);
        let links = self.img.u32_at(target + I_LINKS)?;
        self.img.put_u32(target + I_LINKS, links + 1)?;
        self.seal(ino)
    }

    fn lookup(&self, dir: u64, name: &str) -> FsResult<Option<u64>> {
        let size = self.img.u64_at(Self::inode(dir) + I_FILE_SIZE)?;
        let mut pos = 0;
        while pos < size {
            let header = self.read_data(dir, pos, 12)?;
            let ino = u64::from_le_bytes([
                header[0], header[1], header[2], header[3], header[4], header[5], header[6],
                header[7],
            ]);
            let rec_len = header[9] as u64 * 16;
            let name_len = u16::from_le_bytes([header[10], header[11]]) as usize;
            if rec_len == 0 {
                break;
            }
            if ino != 0 && name_len == name.len() && self.read_data(dir, pos + 12, name_len)? == name.as_bytes() {
                return Ok(Some(ino));
            }
            pos += rec_len;
        }
        Ok(None)
    }
}

impl FsBuilder for LeanBuilder {
    fn open(part: Option<&PartitionDescriptor>) -> FsResult<Self> {
        let part = part.ok_or(FsError::Unsupported {
            format: FORMAT,
            reason: "LeanFS images are built for partitions only",
        })?;
        let sectors = part.sectors();
        if sectors < MIN_SECTORS {
            return Err(FsError::TooSmall { format: FORMAT });
        }
        let bands = sectors.div_ceil(BAND_SECTORS);
        let bitmap_start = PRIMARY_SUPER + 1;
        let backup_super = sectors.min(BAND_SECTORS) - 1;

        let mut img = ImageBuffer::zeroed(sectors as usize * SECTOR);
        let sb = PRIMARY_SUPER as usize * SECTOR;
        img.put_bytes(sb + 4, SUPER_MAGIC)?;
        img.put_u16(sb + 8, SUPER_VERSION)?;
        img.put_u8(sb + 10, PREALLOC)?;
        img.put_u8(sb + 11, LOG_BAND_SIZE)?;
        img.put_u32(sb + 12, 1)?; // state: clean
        img.put_bytes(sb + 16, &part.part_guid.to_bytes())?;
        img.put_bytes(sb + 32, b"NO NAME")?;
        img.put_u64(sb + 96, sectors)?;
        img.put_u64(sb + SB_FREE, sectors - 34 - bands * BITMAP_SECTORS)?;
        img.put_u64(sb + 112, PRIMARY_SUPER)?;
        img.put_u64(sb + 120, backup_super)?;
        img.put_u64(sb + 128, bitmap_start)?;
        img.put_u8(sb + 160, 9)?; // log2 block size

        let mut fs = Self {
            img,
            sectors,
            bitmap_start,
            backup_super,
            next: bitmap_start + BITMAP_SECTORS,
            root: 0,
        };
        for sector in 0..bitmap_start + BITMAP_SECTORS {
            fs.mark_used(sector)?;
        }
        for band in 1..bands {
            fs.mark_used(band * BAND_SECTORS)?;
        }
        fs.mark_used(backup_super)?;
        // bits past the end of a partial last band
        for sector in sectors..bands * BAND_SECTORS {
            fs.mark_used(sector)?;
        }

        let root = fs.alloc_inode(0o755, FT_DIR, 0, 0, 0, build_time())?;
        fs.root = root;
        fs.img.put_u64(sb + SB_ROOT, root)?;
        fs.add_dirent(root, root, FT_DIR, ".", ".")?;
        fs.add_dirent(root, root, FT_DIR, "..", "..")?;
        log::debug!("lean: {} sectors in {} bands, root inode {}", sectors, bands, root);
        Ok(fs)
    }

    fn add(&mut self, entry: &Entry) -> FsResult<()> {
        if entry.is_skipped(false) {
            return Ok(());
        }
        let kind = match entry.kind() {
            FileKind::Directory => FT_DIR,
            FileKind::Symlink => FT_LNK,
            FileKind::Regular => FT_REG,
            _ => return Ok(()),
        };
        let (parents, leaf) = entry.split();
        let mut parent = self.root;
        for component in parents {
            parent = self
                .lookup(parent, component)?
                .ok_or_else(|| FsError::NotFound {
                    format: FORMAT,
                    path: entry.path.clone(),
                })?;
        }
        let meta = &entry.meta;
        let ino = self.alloc_inode(
            meta.mode,
            kind,
            entry.content.len() as u64,
            meta.uid,
            meta.gid,
            meta.mtime,
        )?;
        self.add_dirent(parent, ino, kind, leaf, &entry.path)?;
        if kind == FT_DIR {
            self.add_dirent(ino, ino, FT_DIR, ".", &entry.path)?;
            self.add_dirent(ino, parent, FT_DIR, "..", &entry.path)?;
        } else {
            for chunk in entry.content.chunks(SECTOR) {
                let sector = self.alloc_sector()?;
                self.img.put_bytes(sector as usize * SECTOR, chunk)?;
                self.add_to_inode(ino, sector, &entry.path)?;
            }
        }
        Ok(())
    }

    fn close(self: Box<Self>) -> FsResult<ImageBuffer> {
        let mut img = self.img;
        let sb = PRIMARY_SUPER as usize * SECTOR;
        let sum = checksum(img.bytes(sb, SECTOR)?, SECTOR / 4);
        img.put_u32(sb + SB_CHECKSUM, sum)?;
        img.copy_within(sb, self.backup_super as usize * SECTOR, SECTOR)?;
        Ok(img)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::testutil::partition;

    fn open(sectors: u64) -> LeanBuilder {
        LeanBuilder::open(Some(&partition(sectors))).unwrap()
    }

    #[test]
    fn test_superblock_checksum_and_backup() {
        let fs = open(128);
        let img = Box::new(fs).close().unwrap();
        let sb = 32 * 512;
        assert_eq!(img.bytes(sb + 4, 4).unwrap(), b"LEAN");
        assert_eq!(img.u16_at(sb + 8).unwrap(), 7);
        let stored = img.u32_at(sb).unwrap();
        assert_eq!(stored, checksum(img.bytes(sb, 512).unwrap(), 128));
        assert_eq!(img.bytes(sb, 512).unwrap(), img.bytes(127 * 512, 512).unwrap());
    }

    #[test]
    fn test_root_and_nested_directories() {
        let mut fs = open(256);
        fs.add(&Entry::dir("sys", 0o755)).unwrap();
        fs.add(&Entry::dir("sys/drv", 0o755)).unwrap();
        let sys = fs.lookup(fs.root, "sys").unwrap().unwrap();
        let drv = fs.lookup(sys, "drv").unwrap().unwrap();
        assert_eq!(fs.lookup(drv, "..").unwrap(), Some(sys));
        assert_eq!(fs.lookup(drv, ".").unwrap(), Some(drv));
        assert_eq!(fs.lookup(fs.root, "..").unwrap(), Some(fs.root));
        let at = LeanBuilder::inode(sys);
        assert_eq!(fs.img.bytes(at + 4, 4).unwrap(), b"NODE");
        assert_eq!(fs.img.u32_at(at + I_LINKS).unwrap(), 3);
        let sum = checksum(fs.img.bytes(at, INODE_SIZE).unwrap(), INODE_SIZE / 4);
        assert_eq!(fs.img.u32_at(at).unwrap(), sum);
    }

    #[test]
    fn test_file_is_one_coalesced_extent() {
        let mut fs = open(256);
        let data = vec![0xA5u8; 3 * 512 + 10];
        fs.add(&Entry::file("kernel.bin", data.clone(), 0o644)).unwrap();
        let ino = fs.lookup(fs.root, "kernel.bin").unwrap().unwrap();
        assert_eq!(fs.extents(ino).unwrap(), vec![(ino, 5)]);
        assert_eq!(fs.read_data(ino, 0, data.len()).unwrap(), data);
        assert_eq!(fs.img.u64_at(LeanBuilder::inode(ino) + I_FILE_SIZE).unwrap(), 1546);
    }

    #[test]
    fn test_bitmap_matches_free_count() {
        let mut fs = open(300);
        fs.add(&Entry::file("a", vec![1u8; 2000], 0o644)).unwrap();
        fs.add(&Entry::symlink("b", "a")).unwrap();
        let used = fs.img.count_bits(33 * 512, 300).unwrap() as u64;
        let free = fs.img.u64_at(32 * 512 + SB_FREE).unwrap();
        assert_eq!(300 - used, free);
    }

    #[test]
    fn test_directory_grows_past_preallocation() {
        let mut fs = open(512);
        fs.add(&Entry::dir("d", 0o755)).unwrap();
        fs.add(&Entry::file("spacer", vec![0u8; 512], 0o644)).unwrap();
        // 7 preallocated sectors hold 224 short records, two used by dots
        for i in 0..230 {
            fs.add(&Entry::file(format!("d/{i}"), Vec::new(), 0o644)).unwrap();
        }
        let d = fs.lookup(fs.root, "d").unwrap().unwrap();
        assert_eq!(fs.extents(d).unwrap().len(), 2);
        assert!(fs.lookup(d, "229").unwrap().is_some());
        assert!(fs.lookup(d, "0").unwrap().is_some());
    }

    #[test]
    fn test_allocation_skips_band_bitmap() {
        let mut fs = open(8192);
        fs.add(&Entry::file("big", vec![3u8; 4100 * 512], 0o644)).unwrap();
        let ino = fs.lookup(fs.root, "big").unwrap().unwrap();
        let extents = fs.extents(ino).unwrap();
        assert_eq!(extents.len(), 2);
        // backup superblock at 4095 and band 1 bitmap at 4096 stay out
        assert_eq!(extents[0].0 + extents[0].1 as u64, 4095);
        assert_eq!(extents[1].0, 4097);
    }

    #[test]
    fn test_rejects_small_and_missing_parent() {
        assert_eq!(
            LeanBuilder::open(Some(&partition(40))).err(),
            Some(FsError::TooSmall { format: "lean" })
        );
        let mut fs = open(128);
        assert!(matches!(
            fs.add(&Entry::file("x/y", Vec::new(), 0o644)),
            Err(FsError::NotFound { .. })
        ));
    }
}
