//! echfs image builder.
//!
//! Entries and file data are collected during `add`; the image is laid out
//! in one pass at `close`:
//!   Block 0: identity table ("_ECH_FS_", block count, directory size, UUID)
//!   Block 16: allocation table, one u64 per block
//!   Then the directory (256-byte entries) and file data
//!
//! Directories get the id `index + 1`; files point at their first data block
//! and chain through the allocation table.

use super::{Entry, FileKind, FsBuilder, FsError, FsResult, PartitionDescriptor};
use crate::image::ImageBuffer;

const FORMAT: &str = "echfs";

const BLOCK: usize = 512;
const ENTRY_SIZE: usize = 256;
const NAME_MAX: usize = 200;
const RESERVED_BLOCKS: u64 = 16;
const ROOT_ID: u64 = u64::MAX;
const END_OF_CHAIN: u64 = u64::MAX;
const RESERVED: u64 = 0xFFFF_FFFF_FFFF_FFF0;

#[derive(Debug, Clone)]
struct EchEntry {
    parent: u64,
    directory: bool,
    name: String,
    atime: u64,
    mtime: u64,
    ctime: u64,
    perms: u16,
    owner: u16,
    group: u16,
    /// Directory id, or the first data block relative to the data area.
    payload: u64,
    size: u64,
}

impl EchEntry {
    fn encode(&self, payload: u64) -> [u8; ENTRY_SIZE] {
        let mut raw = [0u8; ENTRY_SIZE];
        raw[0..8].copy_from_slice(&self.parent.to_le_bytes());
        raw[8] = u8::from(self.directory);
        raw[9..9 + self.name.len()].copy_from_slice(self.name.as_bytes());
        raw[210..218].copy_from_slice(&self.atime.to_le_bytes());
        raw[218..226].copy_from_slice(&self.mtime.to_le_bytes());
        raw[226..228].copy_from_slice(&self.perms.to_le_bytes());
        raw[228..230].copy_from_slice(&self.owner.to_le_bytes());
        raw[230..232].copy_from_slice(&self.group.to_le_bytes());
        raw[232..240].copy_from_slice(&self.ctime.to_le_bytes());
        raw[240..248].copy_from_slice(&payload.to_le_bytes());
        raw[248..256].copy_from_slice(&self.size.to_le_bytes());
        raw
    }
}

pub struct EchfsBuilder {
    uuid: [u8; 16],
    /// Fixed geometry when building for a partition.
    blocks: Option<u64>,
    max_entries: usize,
    entries: Vec<EchEntry>,
    data: ImageBuffer,
}

impl EchfsBuilder {
    fn lookup(&self, parent: u64, name: &str) -> Option<&EchEntry> {
        self.entries
            .iter()
            .find(|e| e.parent == parent && e.name == name)
    }

    fn table_blocks(blocks: u64) -> u64 {
        (blocks * 8).div_ceil(BLOCK as u64)
    }

    fn dir_blocks(entries: usize) -> u64 {
        (entries * ENTRY_SIZE).div_ceil(BLOCK) as u64
    }
}

impl FsBuilder for EchfsBuilder {
    fn open(part: Option<&PartitionDescriptor>) -> FsResult<Self> {
        let (uuid, blocks, max_entries) = match part {
            Some(part) => {
                let blocks = part.sectors();
                let max_entries = (blocks * 5 / 100) as usize * BLOCK / ENTRY_SIZE;
                if max_entries == 0
                    || RESERVED_BLOCKS + Self::table_blocks(blocks) + Self::dir_blocks(max_entries)
                        >= blocks
                {
                    return Err(FsError::TooSmall { format: FORMAT });
                }
                (part.part_guid.to_bytes(), Some(blocks), max_entries)
            }
            None => {
                let mut uuid = [0u8; 16];
                uuid[..6].copy_from_slice(b"INITRD");
                (uuid, None, usize::MAX)
            }
        };
        Ok(Self {
            uuid,
            blocks,
            max_entries,
            entries: Vec::new(),
            data: ImageBuffer::new(),
        })
    }

    fn add(&mut self, entry: &Entry) -> FsResult<()> {
        if entry.is_skipped(false) {
            return Ok(());
        }
        if !matches!(entry.kind(), FileKind::Regular | FileKind::Directory) {
            log::warn!("echfs: skipping {} ({:?})", entry.path, entry.kind());
            return Ok(());
        }
        let (parents, leaf) = entry.split();
        if leaf.len() > NAME_MAX {
            return Err(FsError::NameTooLong {
                format: FORMAT,
                path: entry.path.clone(),
            });
        }
        let mut parent = ROOT_ID;
        for component in parents {
            parent = match self.lookup(parent, component) {
                Some(dir) if dir.directory => dir.payload,
                _ => {
                    return Err(FsError::NotFound {
                        format: FORMAT,
                        path: entry.path.clone(),
                    })
                }
            };
        }
        if self.entries.len() + 1 > self.max_entries {
            return Err(FsError::NoSpace {
                format: FORMAT,
                what: "directory entries",
            });
        }
        let directory = entry.kind() == FileKind::Directory;
        let (payload, size) = if directory {
            (self.entries.len() as u64 + 1, 0)
        } else {
            let first = (self.data.len() / BLOCK) as u64;
            if let Some(blocks) = self.blocks {
                let needed = (self.data.len() + entry.content.len()).div_ceil(BLOCK) as u64;
                let overhead = RESERVED_BLOCKS
                    + Self::table_blocks(blocks)
                    + Self::dir_blocks(self.max_entries);
                if overhead + needed > blocks {
                    return Err(FsError::NoSpace {
                        format: FORMAT,
                        what: "blocks",
                    });
                }
            }
            self.data.append(&entry.content);
            self.data.pad_to(BLOCK);
            (first, entry.content.len() as u64)
        };
        let meta = &entry.meta;
        self.entries.push(EchEntry {
            parent,
            directory,
            name: leaf.to_string(),
            atime: meta.atime.max(0) as u64,
            mtime: meta.mtime.max(0) as u64,
            ctime: meta.ctime.max(0) as u64,
            perms: (meta.mode & 0xFFF) as u16,
            owner: meta.uid as u16,
            group: meta.gid as u16,
            payload,
            size,
        });
        Ok(())
    }

    fn close(self: Box<Self>) -> FsResult<ImageBuffer> {
        let max_entries = if self.blocks.is_some() {
            self.max_entries
        } else {
            self.entries.len()
        };
        let dir_blocks = Self::dir_blocks(max_entries);
        let data_blocks = (self.data.len() / BLOCK) as u64;
        let blocks = match self.blocks {
            Some(blocks) => blocks,
            None => {
                // the table must also describe its own blocks
                let mut blocks = RESERVED_BLOCKS + dir_blocks + data_blocks;
                while RESERVED_BLOCKS + Self::table_blocks(blocks) + dir_blocks + data_blocks > blocks
                {
                    blocks = RESERVED_BLOCKS + Self::table_blocks(blocks) + dir_blocks + data_blocks;
                }
                blocks
            }
        };
        let table_blocks = Self::table_blocks(blocks);
        let data_start = RESERVED_BLOCKS + table_blocks + dir_blocks;

        let mut img = ImageBuffer::zeroed(blocks as usize * BLOCK);
        img.put_bytes(4, b"_ECH_FS_")?;
        img.put_u64(12, blocks)?;
        img.put_u64(20, dir_blocks)?;
        img.put_u64(28, BLOCK as u64)?;
        img.put_bytes(40, &self.uuid)?;

        let table = RESERVED_BLOCKS as usize * BLOCK;
        for block in 0..data_start {
            img.put_u64(table + block as usize * 8, RESERVED)?;
        }
        let dir = (RESERVED_BLOCKS + table_blocks) as usize * BLOCK;
        for (i, ent) in self.entries.iter().enumerate() {
            let payload = if ent.directory {
                ent.payload
            } else if ent.size == 0 {
                END_OF_CHAIN
            } else {
                let first = data_start + ent.payload;
                let count = ent.size.div_ceil(BLOCK as u64);
                for k in 0..count {
                    let next = if k + 1 == count { END_OF_CHAIN } else { first + k + 1 };
                    img.put_u64(table + (first + k) as usize * 8, next)?;
                }
                first
            };
            img.put_bytes(dir + i * ENTRY_SIZE, &ent.encode(payload))?;
        }
        img.put_bytes(data_start as usize * BLOCK, self.data.as_slice())?;
        log::debug!(
            "echfs: {} entries, {} data blocks, {} blocks total",
            self.entries.len(),
            data_blocks,
            blocks
        );
        Ok(img)
    }
}
