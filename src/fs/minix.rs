//! Minix3 image builder.
//!
//! 4 KiB blocks, one block per zone:
//!   Block 0: boot block, superblock at byte 1024
//!   Block 2..: inode bitmap, zone bitmap, inode table, data zones
//!
//! Zone bitmap bit `n` covers zone `first_data_zone - 1 + n`; bit 0 and inode
//! bit 0 are always set. Lookup walks the seven direct zones of a directory
//! only, entries placed in its indirect zone are stored but not found again.

use super::{build_time, Entry, FileKind, FsBuilder, FsError, FsResult, PartitionDescriptor};
use crate::image::ImageBuffer;

const FORMAT: &str = "minix";

const BLOCK_SIZE: usize = 4096;
const BITS_PER_BLOCK: u32 = (BLOCK_SIZE * 8) as u32;
const SUPERBLOCK_OFFSET: usize = 1024;
const SUPER_V3: u16 = 0x4D5A;
const INODE_SIZE: usize = 64;
const INODES_PER_BLOCK: u32 = (BLOCK_SIZE / INODE_SIZE) as u32;
const DIRENT_SIZE: usize = 64;
const DIRSIZ: usize = 60;
const DIRENTS_PER_ZONE: usize = BLOCK_SIZE / DIRENT_SIZE;
const NR_DZONES: usize = 7;
const INDIRECTS: usize = BLOCK_SIZE / 4;
const MIN_BLOCKS: u32 = 8;
const IMAP_BLOCK: u32 = 2;

// Inode field offsets
const I_MODE: usize = 0;
const I_NLINKS: usize = 2;
const I_UID: usize = 4;
const I_GID: usize = 6;
const I_SIZE: usize = 8;
const I_ATIME: usize = 12;
const I_MTIME: usize = 16;
const I_CTIME: usize = 20;
const I_ZONE: usize = 24;

pub struct MinixBuilder {
    img: ImageBuffer,
    blocks: u32,
    inodes: u32,
    inode_table: u32,
    zone_map: u32,
    zone_base: u32,
    next_zone: u32,
    next_inode: u32,
    root: u32,
}

impl MinixBuilder {
    fn inode_offset(&self, ino: u32) -> usize {
        self.inode_table as usize * BLOCK_SIZE + (ino as usize - 1) * INODE_SIZE
    }

    fn zone_offset(zone: u32) -> usize {
        zone as usize * BLOCK_SIZE
    }

    fn alloc_zone(&mut self) -> FsResult<u32> {
        if self.next_zone >= self.blocks {
            return Err(FsError::NoSpace {
                format: FORMAT,
                what: "zones",
            });
        }
        let zone = self.next_zone;
        self.next_zone += 1;
        let bitmap = Self::zone_offset(self.zone_map);
        self.img.set_bit(bitmap, (zone - self.zone_base) as usize)?;
        Ok(zone)
    }

    fn alloc_inode(&mut self, mode: u32, uid: u32, gid: u32, time: u32) -> FsResult<u32> {
        let ino = self.next_inode;
        if ino > self.inodes {
            return Err(FsError::NoSpace {
                format: FORMAT,
                what: "inodes",
            });
        }
        self.next_inode += 1;
        self.img
            .set_bit(Self::zone_offset(IMAP_BLOCK), ino as usize)?;
        let at = self.inode_offset(ino);
        self.img.put_u16(at + I_MODE, mode as u16)?;
        self.img.put_u16(at + I_UID, uid as u16)?;
        self.img.put_u16(at + I_GID, gid as u16)?;
        self.img.put_u32(at + I_ATIME, time)?;
        self.img.put_u32(at + I_MTIME, time)?;
        self.img.put_u32(at + I_CTIME, time)?;
        Ok(ino)
    }

    fn bump_u16(&mut self, offset: usize) -> FsResult<()> {
        let value = self.img.u16_at(offset)?;
        self.img.put_u16(offset, value + 1)
    }

    fn incr_link(&mut self, ino: u32) -> FsResult<()> {
        self.bump_u16(self.inode_offset(ino) + I_NLINKS)
    }

    fn grow(&mut self, ino: u32, bytes: usize) -> FsResult<()> {
        let at = self.inode_offset(ino) + I_SIZE;
        let size = self.img.u32_at(at)?;
        self.img.put_u32(at, size + bytes as u32)
    }

    fn zone_slot(&mut self, slot: usize) -> FsResult<u32> {
        let existing = self.img.u32_at(slot)?;
        if existing != 0 {
            return Ok(existing);
        }
        let zone = self.alloc_zone()?;
        self.img.put_u32(slot, zone)?;
        Ok(zone)
    }

    /// Attach `zone` as logical zone `index` of `ino`.
    fn add_zone(&mut self, ino: u32, index: usize, zone: u32, path: &str) -> FsResult<()> {
        let base = self.inode_offset(ino) + I_ZONE;
        let slot = if index < NR_DZONES {
            base + index * 4
        } else if index < NR_DZONES + INDIRECTS {
            let ind = self.zone_slot(base + NR_DZONES * 4)?;
            Self::zone_offset(ind) + (index - NR_DZONES) * 4
        } else if index < NR_DZONES + INDIRECTS + INDIRECTS * INDIRECTS {
            let rel = index - NR_DZONES - INDIRECTS;
            let dind = self.zone_slot(base + (NR_DZONES + 1) * 4)?;
            let ind = self.zone_slot(Self::zone_offset(dind) + (rel / INDIRECTS) * 4)?;
            Self::zone_offset(ind) + (rel % INDIRECTS) * 4
        } else {
            return Err(FsError::TooBig {
                format: FORMAT,
                path: path.to_string(),
            });
        };
        self.img.put_u32(slot, zone)
    }

    fn try_enter(&mut self, zone: u32, child: u32, name: &[u8]) -> FsResult<bool> {
        let base = Self::zone_offset(zone);
        for i in 0..DIRENTS_PER_ZONE {
            let at = base + i * DIRENT_SIZE;
            if self.img.u32_at(at)? == 0 {
                self.img.put_u32(at, child)?;
                self.img.put_bytes(at + 4, name)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Place `name -> child` in the first free record of `parent`, using the
    /// direct zones first and then the single indirect zone.
    fn enter_dir(&mut self, parent: u32, name: &str, child: u32, path: &str) -> FsResult<()> {
        if name.len() > DIRSIZ {
            return Err(FsError::NameTooLong {
                format: FORMAT,
                path: path.to_string(),
            });
        }
        let zones = self.inode_offset(parent) + I_ZONE;
        for k in 0..NR_DZONES {
            let zone = self.zone_slot(zones + k * 4)?;
            if self.try_enter(zone, child, name.as_bytes())? {
                return Ok(());
            }
        }
        let ind = self.zone_slot(zones + NR_DZONES * 4)?;
        for k in 0..INDIRECTS {
            let zone = self.zone_slot(Self::zone_offset(ind) + k * 4)?;
            if self.try_enter(zone, child, name.as_bytes())? {
                return Ok(());
            }
        }
        Err(FsError::DirFull {
            format: FORMAT,
            path: path.to_string(),
        })
    }

    fn lookup(&self, dir: u32, name: &str) -> FsResult<Option<u32>> {
        let at = self.inode_offset(dir);
        let size = self.img.u32_at(at + I_SIZE)? as usize;
        let records = size / DIRENT_SIZE;
        for k in 0..NR_DZONES {
            let zone = self.img.u32_at(at + I_ZONE + k * 4)?;
            if zone == 0 {
                break;
            }
            for i in 0..DIRENTS_PER_ZONE {
                if k * DIRENTS_PER_ZONE + i >= records {
                    return Ok(None);
                }
                let rec = Self::zone_offset(zone) + i * DIRENT_SIZE;
                let ino = self.img.u32_at(rec)?;
                let raw = self.img.bytes(rec + 4, DIRSIZ)?;
                let len = raw.iter().position(|&b| b == 0).unwrap_or(DIRSIZ);
                if ino != 0 && &raw[..len] == name.as_bytes() {
                    return Ok(Some(ino));
                }
            }
        }
        Ok(None)
    }

    fn make_dir(&mut self, dir: u32, parent: u32, path: &str) -> FsResult<()> {
        let zone = self.alloc_zone()?;
        self.add_zone(dir, 0, zone, path)?;
        self.grow(dir, 2 * DIRENT_SIZE)?;
        self.enter_dir(dir, ".", dir, path)?;
        self.enter_dir(dir, "..", parent, path)?;
        self.incr_link(dir)?;
        self.incr_link(parent)
    }
}

impl FsBuilder for MinixBuilder {
    fn open(part: Option<&PartitionDescriptor>) -> FsResult<Self> {
        let part = part.ok_or(FsError::Unsupported {
            format: FORMAT,
            reason: "minix images are built for partitions only",
        })?;
        let blocks = (part.size_bytes() / BLOCK_SIZE as u64).min(u32::MAX as u64) as u32;
        if blocks < MIN_BLOCKS {
            return Err(FsError::TooSmall { format: FORMAT });
        }
        let kb = blocks as u64 * (BLOCK_SIZE as u64 / 1024);
        let divisor = match kb {
            0..=99_999 => 2,
            100_000..=999_999 => 4,
            1_000_000..=9_999_999 => 6,
            10_000_000..=99_999_999 => 8,
            100_000_000..=999_999_999 => 10,
            _ => 12,
        };
        let inodes = ((kb / divisor) as u32).div_ceil(INODES_PER_BLOCK) * INODES_PER_BLOCK;
        let imap_blocks = (1 + inodes).div_ceil(BITS_PER_BLOCK);
        let zmap_blocks = blocks.div_ceil(BITS_PER_BLOCK);
        let inode_table = IMAP_BLOCK + imap_blocks + zmap_blocks;
        let first_data_zone = inode_table + inodes.div_ceil(INODES_PER_BLOCK);
        if first_data_zone >= blocks {
            return Err(FsError::TooSmall { format: FORMAT });
        }

        let mut img = ImageBuffer::zeroed(blocks as usize * BLOCK_SIZE);
        let sb = SUPERBLOCK_OFFSET;
        img.put_u32(sb, inodes)?;
        img.put_u16(sb + 6, imap_blocks as u16)?;
        img.put_u16(sb + 8, zmap_blocks as u16)?;
        img.put_u16(sb + 10, first_data_zone.min(u16::MAX as u32) as u16)?;
        img.put_u32(sb + 16, i32::MAX as u32)?; // max file size
        img.put_u32(sb + 20, blocks)?;
        img.put_u16(sb + 24, SUPER_V3)?;
        img.put_u16(sb + 28, BLOCK_SIZE as u16)?;

        let mut fs = Self {
            img,
            blocks,
            inodes,
            inode_table,
            zone_map: IMAP_BLOCK + imap_blocks,
            zone_base: first_data_zone - 1,
            next_zone: first_data_zone,
            next_inode: 1,
            root: 0,
        };
        fs.img.set_bit(Self::zone_offset(fs.zone_map), 0)?;
        fs.img.set_bit(Self::zone_offset(IMAP_BLOCK), 0)?;
        let now = build_time() as u32;
        let root = fs.alloc_inode(super::S_IFDIR | 0o755, 0, 0, now)?;
        fs.root = root;
        let zone = fs.alloc_zone()?;
        fs.add_zone(root, 0, zone, "/")?;
        fs.grow(root, 2 * DIRENT_SIZE)?;
        fs.enter_dir(root, ".", root, "/")?;
        fs.enter_dir(root, "..", root, "/")?;
        fs.incr_link(root)?;
        fs.incr_link(root)?;
        log::debug!(
            "minix: {} blocks, {} inodes, first data zone {}",
            blocks,
            inodes,
            first_data_zone
        );
        Ok(fs)
    }

    fn add(&mut self, entry: &Entry) -> FsResult<()> {
        if entry.is_skipped(true) {
            return Ok(());
        }
        if entry.kind() == FileKind::Symlink && entry.content.len() >= BLOCK_SIZE {
            return Err(FsError::TargetTooLong {
                format: FORMAT,
                path: entry.path.clone(),
            });
        }
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
        let mtime = entry.meta.mtime as u32;
        let ino = self.alloc_inode(entry.meta.mode, entry.meta.uid, entry.meta.gid, mtime)?;
        self.enter_dir(parent, leaf, ino, &entry.path)?;
        self.grow(parent, DIRENT_SIZE)?;
        self.incr_link(ino)?;

        match entry.kind() {
            FileKind::Directory => self.make_dir(ino, parent, &entry.path)?,
            FileKind::CharDevice | FileKind::BlockDevice => {
                let at = self.inode_offset(ino) + I_ZONE;
                self.img.put_u32(at, entry.meta.rdev as u32)?;
            }
            FileKind::Regular | FileKind::Symlink => {
                if entry.content.len() > u32::MAX as usize {
                    return Err(FsError::TooBig {
                        format: FORMAT,
                        path: entry.path.clone(),
                    });
                }
                for (index, chunk) in entry.content.chunks(BLOCK_SIZE).enumerate() {
                    let zone = self.alloc_zone()?;
                    self.img.put_bytes(Self::zone_offset(zone), chunk)?;
                    self.add_zone(ino, index, zone, &entry.path)?;
                }
                self.grow(ino, entry.content.len())?;
            }
            FileKind::Other => {}
        }
        Ok(())
    }

    fn close(self: Box<Self>) -> FsResult<ImageBuffer> {
        log::debug!(
            "minix: {} inodes and {} zones used",
            self.next_inode - 1,
            self.next_zone - self.zone_base - 1
        );
        Ok(self.img)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::testutil::partition;

    fn open(blocks: u64) -> MinixBuilder {
        MinixBuilder::open(Some(&partition(blocks * 8))).unwrap()
    }

    fn zones(fs: &MinixBuilder, ino: u32) -> Vec<u32> {
        let at = fs.inode_offset(ino) + I_ZONE;
        (0..10).map(|k| fs.img.u32_at(at + k * 4).unwrap()).collect()
    }

    #[test]
    fn test_superblock_and_root() {
        let fs = open(8);
        assert_eq!(fs.img.u16_at(SUPERBLOCK_OFFSET + 24).unwrap(), SUPER_V3);
        assert_eq!(fs.img.u16_at(SUPERBLOCK_OFFSET + 28).unwrap(), 4096);
        assert_eq!(fs.inodes, 64);
        assert_eq!(fs.lookup(fs.root, ".").unwrap(), Some(1));
        assert_eq!(fs.lookup(fs.root, "..").unwrap(), Some(1));
        let at = fs.inode_offset(1);
        assert_eq!(fs.img.u16_at(at + I_NLINKS).unwrap(), 2);
        assert_eq!(fs.img.u32_at(at + I_SIZE).unwrap(), 128);
        assert!(MinixBuilder::open(Some(&partition(7 * 8))).is_err());
    }

    #[test]
    fn test_directory_spills_into_second_zone() {
        let mut fs = open(64);
        fs.add(&Entry::dir("d", 0o755)).unwrap();
        for i in 0..70 {
            fs.add(&Entry::file(format!("d/f{i:02}"), Vec::new(), 0o644))
                .unwrap();
        }
        let d = fs.lookup(fs.root, "d").unwrap().unwrap();
        let z = zones(&fs, d);
        assert_ne!(z[0], 0);
        assert_ne!(z[1], 0);
        // 2 dot entries + 62 files fill the first zone
        let first = MinixBuilder::zone_offset(z[0]);
        assert_eq!(fs.img.bytes(first + 2 * 64 + 4, 3).unwrap(), b"f00");
        assert_eq!(fs.img.bytes(first + 63 * 64 + 4, 3).unwrap(), b"f61");
        let second = MinixBuilder::zone_offset(z[1]);
        assert_eq!(fs.img.bytes(second + 4, 3).unwrap(), b"f62");
        assert!(fs.lookup(d, "f69").unwrap().is_some());
        assert_eq!(
            fs.img.u32_at(fs.inode_offset(d) + I_SIZE).unwrap() as usize,
            72 * 64
        );
    }

    #[test]
    fn test_nested_dot_entries_and_links() {
        let mut fs = open(32);
        fs.add(&Entry::dir("usr", 0o755)).unwrap();
        fs.add(&Entry::dir("usr/lib", 0o755)).unwrap();
        let usr = fs.lookup(fs.root, "usr").unwrap().unwrap();
        let lib = fs.lookup(usr, "lib").unwrap().unwrap();
        assert_eq!(fs.lookup(lib, "..").unwrap(), Some(usr));
        assert_eq!(fs.lookup(lib, ".").unwrap(), Some(lib));
        assert_eq!(fs.img.u16_at(fs.inode_offset(usr) + I_NLINKS).unwrap(), 3);
        assert_eq!(fs.img.u16_at(fs.inode_offset(1) + I_NLINKS).unwrap(), 3);
    }

    #[test]
    fn test_file_data_and_zone_bitmap() {
        let mut fs = open(64);
        let data: Vec<u8> = (0..(9 * BLOCK_SIZE as u32)).map(|i| (i % 251) as u8).collect();
        fs.add(&Entry::file("blob", data.clone(), 0o644)).unwrap();
        fs.add(&Entry::device("tty", FileKind::CharDevice, 0x0400, 0o620))
            .unwrap();
        let blob = fs.lookup(fs.root, "blob").unwrap().unwrap();
        let z = zones(&fs, blob);
        assert_ne!(z[NR_DZONES], 0);
        let eighth = fs.img.u32_at(MinixBuilder::zone_offset(z[NR_DZONES])).unwrap();
        assert_eq!(
            fs.img.bytes(MinixBuilder::zone_offset(eighth), BLOCK_SIZE).unwrap(),
            &data[7 * BLOCK_SIZE..8 * BLOCK_SIZE]
        );
        let tty = fs.lookup(fs.root, "tty").unwrap().unwrap();
        assert_eq!(zones(&fs, tty)[0], 0x0400);

        let used = fs.next_zone - fs.zone_base;
        let bitmap = MinixBuilder::zone_offset(fs.zone_map);
        assert_eq!(fs.img.count_bits(bitmap, 64).unwrap() as u32, used);
        let inode_bits = fs.img.count_bits(MinixBuilder::zone_offset(IMAP_BLOCK), 64).unwrap();
        assert_eq!(inode_bits as u32, fs.next_inode);
    }

    #[test]
    fn test_long_name_and_missing_parent() {
        let mut fs = open(16);
        assert!(matches!(
            fs.add(&Entry::file("x".repeat(61), Vec::new(), 0o644)),
            Err(FsError::NameTooLong { .. })
        ));
        assert!(matches!(
            fs.add(&Entry::file("a/b", Vec::new(), 0o644)),
            Err(FsError::NotFound { .. })
        ));
    }
}
