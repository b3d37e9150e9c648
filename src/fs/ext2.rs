//! ext2 (revision 1) image builder.
//!
//! Layout, 4 KiB blocks, every group carrying a full superblock mirror:
//!   Block 0: boot record + superblock (at byte offset 1024)
//!   Block 1: block group descriptor table
//!   Block 2: block bitmap
//!   Block 3: inode bitmap
//!   Blocks 4..: inode table, then data
//!
//! Groups after the first repeat the same layout at `group * 32768`. Data
//! blocks are handed out linearly and the per-group overhead is skipped when
//! the cursor crosses a group boundary.
//!
//! Directory lookup only walks the twelve direct blocks of a directory, so a
//! single directory holds at most twelve blocks of entries.

use super::{build_time, Entry, FileKind, FsBuilder, FsError, FsResult, PartitionDescriptor};
use crate::image::ImageBuffer;

const FORMAT: &str = "ext2";

const BLOCK_SIZE: usize = 4096;
const INODE_SIZE: usize = 128;
const SUPERBLOCK_OFFSET: usize = 1024;
const GDT_OFFSET: usize = BLOCK_SIZE;
const GROUP_DESC_SIZE: usize = 32;
const BLOCKS_PER_GROUP: u32 = 32768;
const MAX_GROUPS: u32 = (BLOCK_SIZE / GROUP_DESC_SIZE) as u32 - 1;
const MIN_BLOCKS: u32 = 8;
const LOST_FOUND_BLOCKS: usize = 4;
const EXT2_SUPER_MAGIC: u16 = 0xEF53;
const INCOMPAT_FILETYPE: u32 = 0x0002;

const ROOT_INO: u32 = 2;
const FIRST_FREE_INO: u32 = 11;
const LOST_FOUND_INO: u32 = 11;

const EXT2_FT_REG_FILE: u8 = 1;
const EXT2_FT_DIR: u8 = 2;
const EXT2_FT_CHRDEV: u8 = 3;
const EXT2_FT_BLKDEV: u8 = 4;
const EXT2_FT_SYMLINK: u8 = 7;

const DIRECT_BLOCKS: usize = 12;
const INDIRECT_SLOT: usize = 12;
const DOUBLE_INDIRECT_SLOT: usize = 13;
const POINTERS_PER_BLOCK: usize = BLOCK_SIZE / 4;

// Inode field offsets
const I_MODE: usize = 0;
const I_UID: usize = 2;
const I_SIZE: usize = 4;
const I_ATIME: usize = 8;
const I_CTIME: usize = 12;
const I_MTIME: usize = 16;
const I_GID: usize = 24;
const I_LINKS: usize = 26;
const I_BLOCKS: usize = 28;
const I_BLOCK: usize = 40;

// Group descriptor field offsets
const BG_BLOCK_BITMAP: usize = 0;
const BG_INODE_BITMAP: usize = 4;
const BG_INODE_TABLE: usize = 8;
const BG_FREE_BLOCKS: usize = 12;
const BG_FREE_INODES: usize = 14;
const BG_USED_DIRS: usize = 16;

// Superblock field offsets, relative to SUPERBLOCK_OFFSET
const S_FREE_BLOCKS: usize = 12;
const S_FREE_INODES: usize = 16;
const S_BLOCK_GROUP_NR: usize = 90;

/// ext2 builder state. All bookkeeping lives in the image itself.
pub struct Ext2Builder {
    img: ImageBuffer,
    blocks: u32,
    groups: u32,
    inodes_per_group: u32,
    inodes: u32,
    /// Inodes handed out so far; the next inode number is this plus one.
    used_inodes: u32,
    next_block: u32,
    /// Blocks of per-group overhead (mirrors, bitmaps, inode table).
    overhead: u32,
    now: u32,
}

struct InodeInit {
    mode: u32,
    size: u32,
    uid: u32,
    gid: u32,
    time: u32,
}

impl Ext2Builder {
    fn inode_offset(&self, ino: u32) -> usize {
        let index = ino - 1;
        let group = index / self.inodes_per_group;
        let slot = index % self.inodes_per_group;
        (group * BLOCKS_PER_GROUP + 4) as usize * BLOCK_SIZE + slot as usize * INODE_SIZE
    }

    fn group_desc(group: u32) -> usize {
        GDT_OFFSET + group as usize * GROUP_DESC_SIZE
    }

    fn block_offset(block: u32) -> usize {
        block as usize * BLOCK_SIZE
    }

    fn dec_u16(&mut self, offset: usize) -> FsResult<()> {
        let value = self.img.u16_at(offset)?;
        self.img.put_u16(offset, value.saturating_sub(1))
    }

    fn dec_u32(&mut self, offset: usize) -> FsResult<()> {
        let value = self.img.u32_at(offset)?;
        self.img.put_u32(offset, value.saturating_sub(1))
    }

    fn alloc_block(&mut self) -> FsResult<u32> {
        if self.next_block >= self.blocks
            || self.img.u32_at(SUPERBLOCK_OFFSET + S_FREE_BLOCKS)? == 0
        {
            return Err(FsError::NoSpace {
                format: FORMAT,
                what: "blocks",
            });
        }
        let block = self.next_block;
        let group = block / BLOCKS_PER_GROUP;
        let bitmap = Self::block_offset(group * BLOCKS_PER_GROUP + 2);
        self.img
            .set_bit(bitmap, (block % BLOCKS_PER_GROUP) as usize)?;
        self.dec_u16(Self::group_desc(group) + BG_FREE_BLOCKS)?;
        self.dec_u32(SUPERBLOCK_OFFSET + S_FREE_BLOCKS)?;
        self.next_block += 1;
        if self.next_block % BLOCKS_PER_GROUP == 0 {
            self.next_block += self.overhead;
        }
        Ok(block)
    }

    fn alloc_inode(&mut self, init: InodeInit) -> FsResult<u32> {
        if self.used_inodes >= self.inodes {
            return Err(FsError::NoSpace {
                format: FORMAT,
                what: "inodes",
            });
        }
        let index = self.used_inodes;
        let group = index / self.inodes_per_group;
        let bitmap = Self::block_offset(group * BLOCKS_PER_GROUP + 3);
        self.img
            .set_bit(bitmap, (index % self.inodes_per_group) as usize)?;
        let desc = Self::group_desc(group);
        self.dec_u16(desc + BG_FREE_INODES)?;
        self.dec_u32(SUPERBLOCK_OFFSET + S_FREE_INODES)?;
        if init.mode & super::S_IFMT == super::S_IFDIR {
            let dirs = self.img.u16_at(desc + BG_USED_DIRS)?;
            self.img.put_u16(desc + BG_USED_DIRS, dirs + 1)?;
        }
        self.used_inodes += 1;
        let ino = self.used_inodes;

        let mut mode = init.mode;
        if mode & 0o7777 == 0 {
            mode |= 0o755;
        }
        let at = self.inode_offset(ino);
        self.img.put_u16(at + I_MODE, mode as u16)?;
        self.img.put_u16(at + I_UID, init.uid as u16)?;
        self.img.put_u32(at + I_SIZE, init.size)?;
        self.img.put_u32(at + I_ATIME, init.time)?;
        self.img.put_u32(at + I_CTIME, init.time)?;
        self.img.put_u32(at + I_MTIME, init.time)?;
        self.img.put_u16(at + I_GID, init.gid as u16)?;
        Ok(ino)
    }

    fn charge_block(&mut self, ino: u32) -> FsResult<()> {
        let at = self.inode_offset(ino) + I_BLOCKS;
        let sectors = self.img.u32_at(at)?;
        self.img.put_u32(at, sectors + (BLOCK_SIZE / 512) as u32)
    }

    /// Allocate an indirection block if `slot` is empty and return it.
    fn pointer_block(&mut self, ino: u32, slot: usize) -> FsResult<u32> {
        let existing = self.img.u32_at(slot)?;
        if existing != 0 {
            return Ok(existing);
        }
        let block = self.alloc_block()?;
        self.charge_block(ino)?;
        self.img.put_u32(slot, block)?;
        Ok(block)
    }

    /// Allocate the data block for logical block `index` of `ino`.
    fn add_block(&mut self, ino: u32, index: usize, path: &str) -> FsResult<u32> {
        let base = self.inode_offset(ino) + I_BLOCK;
        let slot = if index < DIRECT_BLOCKS {
            base + index * 4
        } else if index < DIRECT_BLOCKS + POINTERS_PER_BLOCK {
            let ind = self.pointer_block(ino, base + INDIRECT_SLOT * 4)?;
            Self::block_offset(ind) + (index - DIRECT_BLOCKS) * 4
        } else if index < DIRECT_BLOCKS + POINTERS_PER_BLOCK + POINTERS_PER_BLOCK * POINTERS_PER_BLOCK
        {
            let rel = index - DIRECT_BLOCKS - POINTERS_PER_BLOCK;
            let dind = self.pointer_block(ino, base + DOUBLE_INDIRECT_SLOT * 4)?;
            let ind = self.pointer_block(
                ino,
                Self::block_offset(dind) + (rel / POINTERS_PER_BLOCK) * 4,
            )?;
            Self::block_offset(ind) + (rel % POINTERS_PER_BLOCK) * 4
        } else {
            return Err(FsError::TooBig {
                format: FORMAT,
                path: path.to_string(),
            });
        };
        let block = self.alloc_block()?;
        self.charge_block(ino)?;
        self.img.put_u32(slot, block)?;
        Ok(block)
    }

    fn direct_blocks(&self, ino: u32) -> FsResult<Vec<u32>> {
        let base = self.inode_offset(ino) + I_BLOCK;
        let mut blocks = Vec::new();
        for k in 0..DIRECT_BLOCKS {
            let block = self.img.u32_at(base + k * 4)?;
            if block == 0 {
                break;
            }
            blocks.push(block);
        }
        Ok(blocks)
    }

    fn lookup(&self, dir: u32, name: &str) -> FsResult<Option<u32>> {
        for block in self.direct_blocks(dir)? {
            let start = Self::block_offset(block);
            let mut pos = 0;
            while pos + 8 <= BLOCK_SIZE {
                let at = start + pos;
                let ino = self.img.u32_at(at)?;
                let rec_len = self.img.u16_at(at + 4)? as usize;
                let name_len = self.img.u8_at(at + 6)? as usize;
                if ino != 0 && self.img.bytes(at + 8, name_len)? == name.as_bytes() {
                    return Ok(Some(ino));
                }
                if rec_len == 0 {
                    break;
                }
                pos += rec_len;
            }
        }
        Ok(None)
    }

    fn write_dirent(&mut self, at: usize, ino: u32, rec_len: usize, kind: u8, name: &[u8]) -> FsResult<()> {
        self.img.put_u32(at, ino)?;
        self.img.put_u16(at + 4, rec_len as u16)?;
        self.img.put_u8(at + 6, name.len() as u8)?;
        self.img.put_u8(at + 7, kind)?;
        self.img.put_bytes(at + 8, name)?;
        let links = self.inode_offset(ino) + I_LINKS;
        let count = self.img.u16_at(links)?;
        self.img.put_u16(links, count + 1)
    }

    /// Append a record to `dir`, growing it by one block when the last block
    /// cannot hold the record.
    fn add_dirent(&mut self, dir: u32, ino: u32, kind: u8, name: &str, path: &str) -> FsResult<()> {
        if name.len() > 255 {
            return Err(FsError::NameTooLong {
                format: FORMAT,
                path: path.to_string(),
            });
        }
        let needed = 8 + name.len().div_ceil(4) * 4;
        let blocks = self.direct_blocks(dir)?;
        if let Some(&last_block) = blocks.last() {
            let start = Self::block_offset(last_block);
            let mut pos = 0;
            loop {
                let rec_len = self.img.u16_at(start + pos + 4)? as usize;
                if rec_len == 0 || pos + rec_len >= BLOCK_SIZE {
                    break;
                }
                pos += rec_len;
            }
            let last_len = self.img.u8_at(start + pos + 6)? as usize;
            let used = 8 + last_len.div_ceil(4) * 4;
            let free_at = pos + used;
            if free_at + needed <= BLOCK_SIZE {
                self.img.put_u16(start + pos + 4, used as u16)?;
                return self.write_dirent(
                    start + free_at,
                    ino,
                    BLOCK_SIZE - free_at,
                    kind,
                    name.as_bytes(),
                );
            }
        }
        if blocks.len() >= DIRECT_BLOCKS {
            return Err(FsError::DirFull {
                format: FORMAT,
                path: path.to_string(),
            });
        }
        let block = self.add_block(dir, blocks.len(), path)?;
        let size = self.inode_offset(dir) + I_SIZE;
        self.img
            .put_u32(size, ((blocks.len() + 1) * BLOCK_SIZE) as u32)?;
        self.write_dirent(Self::block_offset(block), ino, BLOCK_SIZE, kind, name.as_bytes())
    }

    fn make_dir_links(&mut self, dir: u32, parent: u32) -> FsResult<()> {
        self.add_dirent(dir, dir, EXT2_FT_DIR, ".", ".")?;
        self.add_dirent(dir, parent, EXT2_FT_DIR, "..", "..")
    }

    /// Grow `dir` to `count` blocks, each extra block holding one empty record.
    fn preallocate_dir(&mut self, dir: u32, count: usize) -> FsResult<()> {
        for index in self.direct_blocks(dir)?.len()..count {
            let block = self.add_block(dir, index, "lost+found")?;
            self.img.put_u16(Self::block_offset(block) + 4, BLOCK_SIZE as u16)?;
        }
        let size = self.inode_offset(dir) + I_SIZE;
        self.img.put_u32(size, (count * BLOCK_SIZE) as u32)
    }

    fn resolve_parent(&self, entry: &Entry) -> FsResult<u32> {
        let (parents, _) = entry.split();
        let mut dir = ROOT_INO;
        for component in parents {
            dir = self.lookup(dir, component)?.ok_or_else(|| FsError::NotFound {
                format: FORMAT,
                path: entry.path.clone(),
            })?;
        }
        Ok(dir)
    }

    fn write_data(&mut self, ino: u32, data: &[u8], path: &str) -> FsResult<()> {
        for (index, chunk) in data.chunks(BLOCK_SIZE).enumerate() {
            let block = self.add_block(ino, index, path)?;
            self.img.put_bytes(Self::block_offset(block), chunk)?;
        }
        Ok(())
    }
}

impl FsBuilder for Ext2Builder {
    fn open(part: Option<&PartitionDescriptor>) -> FsResult<Self> {
        let part = part.ok_or(FsError::Unsupported {
            format: FORMAT,
            reason: "ext2 images are built for partitions only",
        })?;
        let mut blocks = (part.size_bytes() / BLOCK_SIZE as u64).min(u32::MAX as u64) as u32;
        if blocks < MIN_BLOCKS {
            return Err(FsError::TooSmall { format: FORMAT });
        }

        // One inode per block, rounded to whole bitmap words.
        let mut groups = blocks.div_ceil(BLOCKS_PER_GROUP);
        let inodes_per_group = (blocks.div_ceil(groups).div_ceil(32) * 32).clamp(32, BLOCKS_PER_GROUP);
        let table_blocks = (inodes_per_group as usize * INODE_SIZE).div_ceil(BLOCK_SIZE) as u32;
        let overhead = 4 + table_blocks;
        let tail = blocks % BLOCKS_PER_GROUP;
        if groups > 1 && tail != 0 && tail <= overhead {
            groups -= 1;
            blocks = groups * BLOCKS_PER_GROUP;
        }
        if groups > MAX_GROUPS {
            return Err(FsError::Unsupported {
                format: FORMAT,
                reason: "partition needs more block groups than one descriptor block holds",
            });
        }
        if overhead + 2 > blocks {
            return Err(FsError::TooSmall { format: FORMAT });
        }
        let inodes = inodes_per_group * groups;
        let now = build_time() as u32;

        let mut img = ImageBuffer::zeroed(blocks as usize * BLOCK_SIZE);
        let sb = SUPERBLOCK_OFFSET;
        img.put_u32(sb, inodes)?;
        img.put_u32(sb + 4, blocks)?;
        img.put_u32(sb + 8, blocks / 20)?; // r_blocks_count
        img.put_u32(sb + 20, 0)?; // first_data_block
        img.put_u32(sb + 24, 2)?; // log_block_size: 1024 << 2
        img.put_u32(sb + 28, 2)?; // log_frag_size
        img.put_u32(sb + 32, BLOCKS_PER_GROUP)?;
        img.put_u32(sb + 36, BLOCKS_PER_GROUP)?;
        img.put_u32(sb + 40, inodes_per_group)?;
        img.put_u32(sb + 48, now)?; // wtime
        img.put_u16(sb + 54, 0xFFFF)?; // max_mnt_count
        img.put_u16(sb + 56, EXT2_SUPER_MAGIC)?;
        img.put_u16(sb + 58, 1)?; // state: clean
        img.put_u16(sb + 60, 1)?; // errors: continue
        img.put_u32(sb + 64, now)?; // lastcheck
        img.put_u32(sb + 76, 1)?; // rev_level: dynamic
        img.put_u32(sb + 84, FIRST_FREE_INO)?;
        img.put_u16(sb + 88, INODE_SIZE as u16)?;
        img.put_u32(sb + 96, INCOMPAT_FILETYPE)?;
        img.put_bytes(sb + 104, &part.part_guid.to_bytes())?;

        let mut free_blocks = 0;
        for group in 0..groups {
            let base = group * BLOCKS_PER_GROUP;
            let in_group = (blocks - base).min(BLOCKS_PER_GROUP);
            let desc = Self::group_desc(group);
            img.put_u32(desc + BG_BLOCK_BITMAP, base + 2)?;
            img.put_u32(desc + BG_INODE_BITMAP, base + 3)?;
            img.put_u32(desc + BG_INODE_TABLE, base + 4)?;
            img.put_u16(desc + BG_FREE_BLOCKS, (in_group - overhead) as u16)?;
            img.put_u16(desc + BG_FREE_INODES, inodes_per_group as u16)?;

            let block_bitmap = Self::block_offset(base + 2);
            for bit in (0..overhead).chain(in_group..BLOCKS_PER_GROUP) {
                img.set_bit(block_bitmap, bit as usize)?;
            }
            let inode_bitmap = Self::block_offset(base + 3);
            for bit in inodes_per_group as usize..BLOCK_SIZE * 8 {
                img.set_bit(inode_bitmap, bit)?;
            }
            free_blocks += in_group - overhead;
        }
        img.put_u32(sb + S_FREE_BLOCKS, free_blocks)?;
        img.put_u32(sb + S_FREE_INODES, inodes)?;

        let mut fs = Self {
            img,
            blocks,
            groups,
            inodes_per_group,
            inodes,
            used_inodes: 0,
            next_block: overhead,
            overhead,
            now,
        };

        for _ in 1..ROOT_INO {
            fs.alloc_inode(fs.reserved())?;
        }
        let root = fs.alloc_inode(InodeInit {
            mode: super::S_IFDIR | 0o755,
            ..fs.reserved()
        })?;
        for _ in ROOT_INO + 1..LOST_FOUND_INO {
            fs.alloc_inode(fs.reserved())?;
        }
        let lost_found = fs.alloc_inode(InodeInit {
            mode: super::S_IFDIR | 0o700,
            ..fs.reserved()
        })?;
        fs.make_dir_links(root, root)?;
        fs.add_dirent(root, lost_found, EXT2_FT_DIR, "lost+found", "lost+found")?;
        fs.make_dir_links(lost_found, root)?;
        // lost+found shrinks to one block on partitions too small to spare four
        if overhead + 1 + LOST_FOUND_BLOCKS as u32 <= blocks {
            fs.preallocate_dir(lost_found, LOST_FOUND_BLOCKS)?;
        }
        log::debug!(
            "ext2: {} blocks, {} groups, {} inodes per group",
            blocks,
            groups,
            inodes_per_group
        );
        Ok(fs)
    }

    fn add(&mut self, entry: &Entry) -> FsResult<()> {
        if entry.is_skipped(true) {
            return Ok(());
        }
        let kind = match entry.kind() {
            FileKind::Regular => EXT2_FT_REG_FILE,
            FileKind::Directory => EXT2_FT_DIR,
            FileKind::Symlink => EXT2_FT_SYMLINK,
            FileKind::CharDevice => EXT2_FT_CHRDEV,
            FileKind::BlockDevice => EXT2_FT_BLKDEV,
            FileKind::Other => return Ok(()),
        };
        if entry.kind() == FileKind::Symlink && entry.content.len() >= BLOCK_SIZE {
            return Err(FsError::TargetTooLong {
                format: FORMAT,
                path: entry.path.clone(),
            });
        }
        let size = match entry.kind() {
            FileKind::Regular | FileKind::Symlink => entry.content.len(),
            _ => 0,
        };
        if size > u32::MAX as usize {
            return Err(FsError::TooBig {
                format: FORMAT,
                path: entry.path.clone(),
            });
        }
        let parent = self.resolve_parent(entry)?;
        let ino = self.alloc_inode(InodeInit {
            mode: entry.meta.mode,
            size: size as u32,
            uid: entry.meta.uid,
            gid: entry.meta.gid,
            time: entry.meta.mtime as u32,
        })?;
        self.add_dirent(parent, ino, kind, entry.name(), &entry.path)?;

        match entry.kind() {
            FileKind::Directory => self.make_dir_links(ino, parent)?,
            FileKind::CharDevice | FileKind::BlockDevice => {
                let slot = self.inode_offset(ino) + I_BLOCK;
                self.img.put_u32(slot, entry.meta.rdev as u32)?;
            }
            FileKind::Regular | FileKind::Symlink => {
                self.write_data(ino, &entry.content, &entry.path)?;
            }
            FileKind::Other => {}
        }
        Ok(())
    }

    fn close(self: Box<Self>) -> FsResult<ImageBuffer> {
        let mut img = self.img;
        for group in 1..self.groups {
            let base = Self::block_offset(group * BLOCKS_PER_GROUP);
            img.copy_within(0, base, 2 * BLOCK_SIZE)?;
            img.put_u16(base + SUPERBLOCK_OFFSET + S_BLOCK_GROUP_NR, group as u16)?;
        }
        Ok(img)
    }
}

impl Ext2Builder {
    fn reserved(&self) -> InodeInit {
        InodeInit {
            mode: super::S_IFREG,
            size: 0,
            uid: 0,
            gid: 0,
            time: self.now,
        }
    }
}
