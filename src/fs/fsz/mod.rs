//! FS/Z image builder.
//!
//! 4 KiB logical sectors. Sector 0 holds the superblock (at byte 512), sector
//! 1 the root directory inode. Every inode takes a whole sector: a 1 KiB
//! header followed by 3 KiB of inline data. Directories live entirely in that
//! inline area, so each holds at most 23 entries, kept sorted by name.
//!
//! File data is mapped by size:
//!   inline     - up to 3 KiB, inside the inode
//!   direct     - up to one sector, `sec` points at it
//!   SD0        - the sector directory (16-byte entries) inlined in the inode
//!   SD1        - `sec` points at one external sector directory
//!
//! Inode, directory and superblock checksums are CRC32C and are recomputed
//! whenever the structure changes.

pub mod mime;

use super::{build_time, Entry, FileKind, FsBuilder, FsError, FsResult, PartitionDescriptor};
use crate::artifact::disk::helpers::Guid;
use crate::image::{crc::crc32c, ImageBuffer};

const FORMAT: &str = "fsz";

pub const SECTOR_SIZE: usize = 4096;
const INODE_HEADER: usize = 1024;
const INLINE_MAX: usize = SECTOR_SIZE - INODE_HEADER;
/// Sector directory entries per sector.
const FANOUT: usize = SECTOR_SIZE / SD_ENTRY;
const SD_ENTRY: usize = 16;
const DIR_HEADER: usize = 128;
const DIRENT_SIZE: usize = 128;
const DIRENT_NAME: usize = 112;
const MAX_DIRENTS: usize = (INLINE_MAX - DIR_HEADER) / DIRENT_SIZE;

// Superblock, relative to sector 0
const SB_MAGIC: usize = 512;
const SB_VERSION_MAJOR: usize = 516;
const SB_VERSION_MINOR: usize = 517;
const SB_LOGSEC: usize = 518;
const SB_MAXMOUNTS: usize = 524;
const SB_NUMSEC: usize = 528;
const SB_FREESEC: usize = 544;
const SB_ROOTDIRFID: usize = 560;
const SB_CREATEDATE: usize = 712;
const SB_LASTMOUNTDATE: usize = 720;
const SB_LASTUMOUNTDATE: usize = 728;
const SB_UUID: usize = 744;
const SB_MAGIC2: usize = 1016;
const SB_CHECKSUM: usize = 1020;

// Inode, relative to its sector
const IN_CHECKSUM: usize = 4;
const IN_FILETYPE: usize = 8;
const IN_MIMETYPE: usize = 12;
const MIMETYPE_LEN: usize = 60;
const IN_CREATEDATE: usize = 72;
const IN_CHANGEDATE: usize = 80;
const IN_NUMBLOCKS: usize = 96;
const IN_NUMLINKS: usize = 104;
const IN_SEC: usize = 448;
const IN_SIZE: usize = 464;
const IN_MODIFYDATE: usize = 480;
const IN_FLAGS: usize = 488;
const IN_OWNER: usize = 496;
const IN_ACCESS: usize = 511;

// Directory header, relative to the inline area
const DH_CHECKSUM: usize = 4;
const DH_NUMENTRIES: usize = 16;
const DH_FID: usize = 32;

const FLAG_INLINE: u64 = 0xFF;
const FLAG_DIRECT: u64 = 0;
const FLAG_SD0: u64 = 0x7F;
const FLAG_SD1: u64 = 1;

const ACCESS_READ: u8 = 1 << 0;
const ACCESS_WRITE: u8 = 1 << 1;
const ACCESS_EXEC: u8 = 1 << 2;
const ACCESS_DELETE: u8 = 1 << 4;

const FILETYPE_DIR: &[u8; 4] = b"dir:";
const FILETYPE_SYMLINK: &[u8; 4] = b"lnk:";
const MIMETYPE_ROOT: &str = "fs-root";

pub struct FszBuilder {
    img: ImageBuffer,
    /// Partition capacity in bytes, `None` for an initrd.
    limit: Option<usize>,
    root: u64,
    /// Microseconds since the epoch.
    now: u64,
}

fn micros(seconds: i64) -> u64 {
    seconds.max(0) as u64 * 1_000_000
}

impl FszBuilder {
    fn offset(sec: u64) -> usize {
        sec as usize * SECTOR_SIZE
    }

    /// Append `count` zeroed sectors and return the first one.
    fn reserve(&mut self, count: usize) -> FsResult<u64> {
        let first = (self.img.len() / SECTOR_SIZE) as u64;
        let len = self.img.len() + count * SECTOR_SIZE;
        if self.limit.is_some_and(|limit| len > limit) {
            return Err(FsError::NoSpace {
                format: FORMAT,
                what: "sectors",
            });
        }
        self.img.grow_to(len);
        Ok(first)
    }

    fn seal_inode(&mut self, ino: u64) -> FsResult<()> {
        let at = Self::offset(ino);
        let sum = crc32c(self.img.bytes(at + IN_FILETYPE, INODE_HEADER - IN_FILETYPE)?);
        self.img.put_u32(at + IN_CHECKSUM, sum)
    }

    /// Recompute the directory header checksum, then the inode's.
    fn seal_dir(&mut self, dir: u64) -> FsResult<()> {
        let at = Self::offset(dir);
        let size = self.img.u64_at(at + IN_SIZE)? as usize;
        let hdr = at + INODE_HEADER;
        let sum = crc32c(self.img.bytes(hdr + 16, size - 16)?);
        self.img.put_u32(hdr + DH_CHECKSUM, sum)?;
        self.seal_inode(dir)
    }

    fn add_inode(&mut self, filetype: &[u8; 4], mimetype: &str, access: u8) -> FsResult<u64> {
        let ino = self.reserve(1)?;
        let at = Self::offset(ino);
        self.img.put_bytes(at, b"FSIN")?;
        self.img.put_bytes(at + IN_FILETYPE, filetype)?;
        let mime = mimetype.as_bytes();
        self.img
            .put_bytes(at + IN_MIMETYPE, &mime[..mime.len().min(MIMETYPE_LEN)])?;
        self.img.put_u64(at + IN_CREATEDATE, self.now)?;
        self.img.put_u64(at + IN_CHANGEDATE, self.now)?;
        self.img.put_u64(at + IN_MODIFYDATE, self.now)?;
        self.img.put_bytes(at + IN_OWNER, b"root")?;
        self.img.put_u8(at + IN_ACCESS, access)?;
        if filetype == FILETYPE_DIR {
            let hdr = at + INODE_HEADER;
            self.img.put_u64(at + IN_SEC, ino)?;
            self.img.put_u64(at + IN_FLAGS, FLAG_INLINE)?;
            self.img.put_u64(at + IN_SIZE, DIR_HEADER as u64)?;
            self.img.put_bytes(hdr, b"FSDR")?;
            self.img.put_u64(hdr + DH_FID, ino)?;
            self.seal_dir(ino)?;
        } else {
            self.seal_inode(ino)?;
        }
        Ok(ino)
    }

    fn dirents(&self, dir: u64) -> FsResult<Vec<[u8; DIRENT_SIZE]>> {
        let hdr = Self::offset(dir) + INODE_HEADER;
        let count = self.img.u64_at(hdr + DH_NUMENTRIES)? as usize;
        (0..count)
            .map(|i| {
                let mut raw = [0u8; DIRENT_SIZE];
                raw.copy_from_slice(self.img.bytes(hdr + DIR_HEADER + i * DIRENT_SIZE, DIRENT_SIZE)?);
                Ok(raw)
            })
            .collect()
    }

    /// Find `name` in `dir`; directory entries carry a trailing slash.
    fn lookup(&self, dir: u64, name: &[u8]) -> FsResult<Option<u64>> {
        for raw in self.dirents(dir)? {
            let stored = &raw[16..];
            let len = stored.iter().position(|&b| b == 0).unwrap_or(DIRENT_NAME);
            if &stored[..len] == name {
                return Ok(Some(u64::from_le_bytes(raw[..8].try_into().unwrap_or_default())));
            }
        }
        Ok(None)
    }

    /// Add `ino` to `dir` under `name`, keeping the entries sorted.
    fn link(&mut self, dir: u64, ino: u64, name: &[u8], path: &str) -> FsResult<()> {
        if name.len() >= DIRENT_NAME {
            return Err(FsError::NameTooLong {
                format: FORMAT,
                path: path.to_string(),
            });
        }
        let mut entries = self.dirents(dir)?;
        if entries.len() >= MAX_DIRENTS {
            return Err(FsError::DirFull {
                format: FORMAT,
                path: path.to_string(),
            });
        }
        let mut raw = [0u8; DIRENT_SIZE];
        raw[..8].copy_from_slice(&ino.to_le_bytes());
        raw[16..16 + name.len()].copy_from_slice(name);
        entries.push(raw);
        entries.sort_by(|a, b| a[16..].cmp(&b[16..]));

        let at = Self::offset(dir);
        let hdr = at + INODE_HEADER;
        for (i, raw) in entries.iter().enumerate() {
            self.img
                .put_bytes(hdr + DIR_HEADER + i * DIRENT_SIZE, raw)?;
        }
        self.img.put_u64(hdr + DH_NUMENTRIES, entries.len() as u64)?;
        self.img
            .put_u64(at + IN_SIZE, (DIR_HEADER + entries.len() * DIRENT_SIZE) as u64)?;
        self.img.put_u64(at + IN_MODIFYDATE, self.now)?;
        self.seal_dir(dir)?;

        let links = Self::offset(ino) + IN_NUMLINKS;
        let count = self.img.u64_at(links)?;
        self.img.put_u64(links, count + 1)?;
        self.seal_inode(ino)
    }

    fn resolve_parent(&self, components: &[&str], path: &str) -> FsResult<u64> {
        let mut dir = self.root;
        for component in components {
            let name = format!("{component}/");
            dir = self.lookup(dir, name.as_bytes())?.ok_or_else(|| FsError::NotFound {
                format: FORMAT,
                path: path.to_string(),
            })?;
        }
        Ok(dir)
    }

    /// Map `data` into `ino` and record its size and block count.
    fn write_data(&mut self, ino: u64, data: &[u8], path: &str) -> FsResult<()> {
        let at = Self::offset(ino);
        self.img.put_u64(at + IN_SIZE, data.len() as u64)?;
        if data.len() <= INLINE_MAX {
            self.img.put_u64(at + IN_SEC, ino)?;
            self.img.put_u64(at + IN_FLAGS, FLAG_INLINE)?;
            return self.img.put_bytes(at + INODE_HEADER, data);
        }
        if data.len() <= SECTOR_SIZE {
            self.img.put_u64(at + IN_FLAGS, FLAG_DIRECT)?;
            if data.iter().all(|&b| b == 0) {
                return Ok(());
            }
            let sec = self.reserve(1)?;
            self.img.put_bytes(Self::offset(sec), data)?;
            self.img.put_u64(at + IN_SEC, sec)?;
            return self.img.put_u64(at + IN_NUMBLOCKS, 1);
        }

        let count = data.len().div_ceil(SECTOR_SIZE);
        if count > FANOUT {
            return Err(FsError::TooBig {
                format: FORMAT,
                path: path.to_string(),
            });
        }
        let mut numblocks = 0u64;
        let table = if count * SD_ENTRY <= INLINE_MAX {
            self.img.put_u64(at + IN_SEC, ino)?;
            self.img.put_u64(at + IN_FLAGS, FLAG_SD0)?;
            at + INODE_HEADER
        } else {
            let sd = self.reserve(1)?;
            numblocks += 1;
            self.img.put_u64(at + IN_SEC, sd)?;
            self.img.put_u64(at + IN_FLAGS, FLAG_SD1)?;
            Self::offset(sd)
        };
        for (i, chunk) in data.chunks(SECTOR_SIZE).enumerate() {
            // holes are only allowed on partitions, initrds keep zero sectors
            if self.limit.is_some() && chunk.iter().all(|&b| b == 0) {
                continue;
            }
            let sec = self.reserve(1)?;
            self.img.put_bytes(Self::offset(sec), chunk)?;
            self.img.put_u64(table + i * SD_ENTRY, sec)?;
            numblocks += 1;
        }
        self.img.put_u64(at + IN_NUMBLOCKS, numblocks)
    }
}

impl FsBuilder for FszBuilder {
    fn open(part: Option<&PartitionDescriptor>) -> FsResult<Self> {
        let now = build_time();
        let mut img = ImageBuffer::zeroed(SECTOR_SIZE);
        let (limit, uuid) = match part {
            Some(part) => {
                let limit = part.size_bytes() as usize;
                if limit < 3 * SECTOR_SIZE {
                    return Err(FsError::TooSmall { format: FORMAT });
                }
                img.put_u64(SB_NUMSEC, (limit / SECTOR_SIZE) as u64)?;
                (Some(limit), part.part_guid.to_bytes())
            }
            None => (None, Guid::from_timestamp(now).to_bytes()),
        };
        img.put_bytes(SB_MAGIC, b"FS/Z")?;
        img.put_u8(SB_VERSION_MAJOR, 1)?;
        img.put_u8(SB_VERSION_MINOR, 0)?;
        // 0 = 2048, 1 = 4096
        img.put_u8(SB_LOGSEC, 1)?;
        img.put_u16(SB_MAXMOUNTS, 255)?;
        for field in [SB_CREATEDATE, SB_LASTMOUNTDATE, SB_LASTUMOUNTDATE] {
            img.put_u64(field, micros(now))?;
        }
        img.put_bytes(SB_UUID, &uuid)?;
        img.put_bytes(SB_MAGIC2, b"FS/Z")?;

        let mut fs = Self {
            img,
            limit,
            root: 0,
            now: micros(now),
        };
        let access = ACCESS_READ | ACCESS_WRITE | ACCESS_DELETE | ACCESS_EXEC;
        fs.root = fs.add_inode(FILETYPE_DIR, MIMETYPE_ROOT, access)?;
        fs.img.put_u64(SB_ROOTDIRFID, fs.root)?;
        // the root is its own parent
        let links = Self::offset(fs.root) + IN_NUMLINKS;
        fs.img.put_u64(links, 1)?;
        fs.seal_inode(fs.root)?;
        Ok(fs)
    }

    fn add(&mut self, entry: &Entry) -> FsResult<()> {
        if entry.is_skipped(false) {
            return Ok(());
        }
        let (parents, leaf) = entry.split();
        let dir = self.resolve_parent(&parents, &entry.path)?;
        let access = ACCESS_READ | ACCESS_WRITE | ACCESS_DELETE;
        match entry.kind() {
            FileKind::Directory => {
                let ino = self.add_inode(FILETYPE_DIR, "", access | ACCESS_EXEC)?;
                self.link(dir, ino, format!("{leaf}/").as_bytes(), &entry.path)
            }
            FileKind::Regular => {
                let mime = mime::classify(&entry.path, &entry.content);
                let access = if mime.executable { access | ACCESS_EXEC } else { access };
                let ino = self.add_inode(mime.filetype, mime.subtype, access)?;
                self.write_data(ino, &entry.content, &entry.path)?;
                if entry.meta.mtime > 0 {
                    self.img
                        .put_u64(Self::offset(ino) + IN_MODIFYDATE, micros(entry.meta.mtime))?;
                }
                self.seal_inode(ino)?;
                self.link(dir, ino, leaf.as_bytes(), &entry.path)
            }
            FileKind::Symlink => {
                if entry.content.len() > INLINE_MAX {
                    return Err(FsError::TargetTooLong {
                        format: FORMAT,
                        path: entry.path.clone(),
                    });
                }
                let ino = self.add_inode(FILETYPE_SYMLINK, "", access)?;
                self.write_data(ino, &entry.content, &entry.path)?;
                self.seal_inode(ino)?;
                self.link(dir, ino, leaf.as_bytes(), &entry.path)
            }
            // devices and other kinds were filtered by is_skipped
            _ => Ok(()),
        }
    }

    fn close(mut self: Box<Self>) -> FsResult<ImageBuffer> {
        let used = (self.img.len() / SECTOR_SIZE) as u64;
        if self.limit.is_none() {
            self.img.put_u64(SB_NUMSEC, used)?;
        }
        self.img.put_u64(SB_FREESEC, used)?;
        let sum = crc32c(self.img.bytes(SB_MAGIC, SB_CHECKSUM - SB_MAGIC)?);
        self.img.put_u32(SB_CHECKSUM, sum)?;
        log::debug!("fsz: {} sectors used", used);
        Ok(self.img)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::testutil::partition;

    fn inode_ok(img: &ImageBuffer, ino: u64) -> bool {
        let at = ino as usize * SECTOR_SIZE;
        img.u32_at(at + 4).unwrap() == crc32c(img.bytes(at + 8, 1016).unwrap())
    }

    fn dir_names(img: &ImageBuffer, dir: u64) -> Vec<String> {
        let hdr = dir as usize * SECTOR_SIZE + 1024;
        let count = img.u64_at(hdr + 16).unwrap() as usize;
        (0..count)
            .map(|i| {
                let name = img.bytes(hdr + 128 + i * 128 + 16, 112).unwrap();
                let len = name.iter().position(|&b| b == 0).unwrap();
                String::from_utf8(name[..len].to_vec()).unwrap()
            })
            .collect()
    }

    fn dir_ok(img: &ImageBuffer, dir: u64) -> bool {
        let at = dir as usize * SECTOR_SIZE;
        let size = img.u64_at(at + 464).unwrap() as usize;
        let sum = crc32c(img.bytes(at + 1024 + 16, size - 16).unwrap());
        img.u32_at(at + 1028).unwrap() == sum && inode_ok(img, dir)
    }

    #[test]
    fn test_superblock_and_root() {
        let fs = FszBuilder::open(None).unwrap();
        let img = Box::new(fs).close().unwrap();
        assert_eq!(img.bytes(512, 4).unwrap(), b"FS/Z");
        assert_eq!(img.bytes(1016, 4).unwrap(), b"FS/Z");
        assert_eq!(img.u8_at(518).unwrap(), 1);
        assert_eq!(img.u64_at(560).unwrap(), 1);
        assert_eq!(img.u64_at(528).unwrap(), 2);
        assert_eq!(
            img.u32_at(1020).unwrap(),
            crc32c(img.bytes(512, 508).unwrap())
        );
        let root = SECTOR_SIZE;
        assert_eq!(img.bytes(root, 4).unwrap(), b"FSIN");
        assert_eq!(img.bytes(root + 8, 4).unwrap(), b"dir:");
        assert_eq!(img.bytes(root + 12, 7).unwrap(), b"fs-root");
        assert_eq!(img.bytes(root + 1024, 4).unwrap(), b"FSDR");
        assert_eq!(img.u64_at(root + 104).unwrap(), 1);
        assert!(dir_ok(&img, 1));
    }

    #[test]
    fn test_entries_stay_sorted() {
        let mut fs = FszBuilder::open(None).unwrap();
        fs.add(&Entry::file("c.txt", b"3".to_vec(), 0o644)).unwrap();
        assert_eq!(dir_names(&fs.img, 1), vec!["c.txt"]);
        fs.add(&Entry::file("a.txt", b"1".to_vec(), 0o644)).unwrap();
        assert_eq!(dir_names(&fs.img, 1), vec!["a.txt", "c.txt"]);
        assert!(dir_ok(&fs.img, 1));
        fs.add(&Entry::file("b.txt", b"2".to_vec(), 0o644)).unwrap();
        assert_eq!(dir_names(&fs.img, 1), vec!["a.txt", "b.txt", "c.txt"]);
        assert!(dir_ok(&fs.img, 1));
        fs.add(&Entry::dir("b", 0o755)).unwrap();
        assert_eq!(dir_names(&fs.img, 1), vec!["a.txt", "b.txt", "b/", "c.txt"]);
        assert_eq!(fs.img.u64_at(SECTOR_SIZE + 464).unwrap(), 128 + 4 * 128);
        assert!(dir_ok(&fs.img, 1));
    }

    #[test]
    fn test_nested_lookup_and_links() {
        let mut fs = FszBuilder::open(None).unwrap();
        fs.add(&Entry::dir("sys", 0o755)).unwrap();
        fs.add(&Entry::file("sys/config", b"screen=800x600\n".to_vec(), 0o644))
            .unwrap();
        fs.add(&Entry::symlink("cfg", "sys/config")).unwrap();
        let sys = fs.lookup(1, b"sys/").unwrap().unwrap();
        let config = fs.lookup(sys, b"config").unwrap().unwrap();
        assert!(fs.lookup(1, b"sys").unwrap().is_none());
        let at = config as usize * SECTOR_SIZE;
        assert_eq!(fs.img.bytes(at + 8, 4).unwrap(), b"text");
        assert_eq!(fs.img.u64_at(at + 104).unwrap(), 1);
        assert_eq!(fs.img.u64_at(at + 488).unwrap(), FLAG_INLINE);
        assert_eq!(fs.img.bytes(at + 1024, 6).unwrap(), b"screen");
        let cfg = fs.lookup(1, b"cfg").unwrap().unwrap();
        let at = cfg as usize * SECTOR_SIZE;
        assert_eq!(fs.img.bytes(at + 8, 4).unwrap(), b"lnk:");
        assert_eq!(fs.img.bytes(at + 1024, 10).unwrap(), b"sys/config");
        assert!(inode_ok(&fs.img, cfg));
        assert!(matches!(
            fs.add(&Entry::file("nope/x", Vec::new(), 0o644)),
            Err(FsError::NotFound { .. })
        ));
    }

    #[test]
    fn test_data_modes() {
        let mut fs = FszBuilder::open(None).unwrap();
        fs.add(&Entry::file("direct", vec![1u8; 4000], 0o644)).unwrap();
        fs.add(&Entry::file("sd0", vec![2u8; 10 * SECTOR_SIZE], 0o644))
            .unwrap();
        fs.add(&Entry::file("sd1", vec![3u8; 200 * SECTOR_SIZE], 0o644))
            .unwrap();
        assert!(matches!(
            fs.add(&Entry::file("huge", vec![4u8; 257 * SECTOR_SIZE], 0o644)),
            Err(FsError::TooBig { .. })
        ));

        let direct = fs.lookup(1, b"direct").unwrap().unwrap() as usize * SECTOR_SIZE;
        assert_eq!(fs.img.u64_at(direct + 488).unwrap(), FLAG_DIRECT);
        assert_eq!(fs.img.u64_at(direct + 96).unwrap(), 1);
        let sec = fs.img.u64_at(direct + 448).unwrap() as usize;
        assert_eq!(fs.img.u8_at(sec * SECTOR_SIZE + 3999).unwrap(), 1);

        let ino = fs.lookup(1, b"sd0").unwrap().unwrap();
        let sd0 = ino as usize * SECTOR_SIZE;
        assert_eq!(fs.img.u64_at(sd0 + 488).unwrap(), FLAG_SD0);
        assert_eq!(fs.img.u64_at(sd0 + 448).unwrap(), ino);
        assert_eq!(fs.img.u64_at(sd0 + 96).unwrap(), 10);
        let first = fs.img.u64_at(sd0 + 1024).unwrap() as usize;
        assert_eq!(fs.img.u8_at(first * SECTOR_SIZE).unwrap(), 2);

        let sd1 = fs.lookup(1, b"sd1").unwrap().unwrap() as usize * SECTOR_SIZE;
        assert_eq!(fs.img.u64_at(sd1 + 488).unwrap(), FLAG_SD1);
        assert_eq!(fs.img.u64_at(sd1 + 96).unwrap(), 201);
        assert_eq!(fs.img.u64_at(sd1 + 464).unwrap(), 200 * SECTOR_SIZE as u64);
        let table = fs.img.u64_at(sd1 + 448).unwrap() as usize * SECTOR_SIZE;
        let last = fs.img.u64_at(table + 199 * 16).unwrap() as usize;
        assert_eq!(fs.img.u8_at(last * SECTOR_SIZE).unwrap(), 3);
    }

    #[test]
    fn test_partition_holes_and_limits() {
        assert_eq!(
            FszBuilder::open(Some(&partition(16))).err(),
            Some(FsError::TooSmall { format: "fsz" })
        );
        let mut fs = FszBuilder::open(Some(&partition(2048))).unwrap();
        let mut data = vec![0u8; 3 * SECTOR_SIZE];
        data[SECTOR_SIZE] = 7;
        fs.add(&Entry::file("sparse", data, 0o644)).unwrap();
        let at = fs.lookup(1, b"sparse").unwrap().unwrap() as usize * SECTOR_SIZE;
        assert_eq!(fs.img.u64_at(at + 96).unwrap(), 1);
        assert_eq!(fs.img.u64_at(at + 1024).unwrap(), 0);
        assert_ne!(fs.img.u64_at(at + 1024 + 16).unwrap(), 0);
        assert!(matches!(
            fs.add(&Entry::file("big", vec![1u8; 256 * SECTOR_SIZE], 0o644)),
            Err(FsError::NoSpace { .. })
        ));
        let img = Box::new(fs).close().unwrap();
        assert_eq!(img.u64_at(528).unwrap(), 256);
    }

    #[test]
    fn test_directory_capacity_and_names() {
        let mut fs = FszBuilder::open(None).unwrap();
        for i in 0..MAX_DIRENTS {
            fs.add(&Entry::file(format!("f{i:02}"), Vec::new(), 0o644))
                .unwrap();
        }
        assert!(matches!(
            fs.add(&Entry::file("overflow", Vec::new(), 0o644)),
            Err(FsError::DirFull { .. })
        ));
        let mut fs = FszBuilder::open(None).unwrap();
        assert!(matches!(
            fs.add(&Entry::file("n".repeat(112), Vec::new(), 0o644)),
            Err(FsError::NameTooLong { .. })
        ));
        fs.add(&Entry::file("n".repeat(111), Vec::new(), 0o644))
            .unwrap();
    }
}
