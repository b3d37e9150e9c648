//! Filesystem image builders.
//!
//! Every format implements [`FsBuilder`]: `open` sizes the image for a
//! partition (or for a bare initrd when no partition is given), `add` is
//! called once per entry of a pre-order tree walk, and `close` finalizes
//! checksums and mirrors and hands out the finished [`ImageBuffer`].
//!
//! `open` is the only constructor and `close` consumes the builder, so adding
//! to an unopened or already closed image cannot be expressed.
//!
//! - [`ext2`] - block groups, bitmaps, indirect block chains
//! - [`fat`] - FAT16/32 with VFAT long names
//! - [`lean`] - LeanFS bands and extents
//! - [`echfs`] - flat entry table and allocation chain
//! - [`fsz`] - FS/Z with sorted directories and mime detection
//! - [`minix`] - Minix3 zones
//!
//! The linear archive formats (cpio, ustar, jamesm) live in
//! [`crate::artifact`] and implement the same trait.
//!
//! # Example
//!
//! ```rust,ignore
//! use bootimg_builder::fs::{ext2::Ext2Builder, Entry, FsBuilder};
//!
//! let mut fs = Ext2Builder::open(Some(&partition))?;
//! fs.add(&Entry::dir("boot", 0o755))?;
//! fs.add(&Entry::file("boot/kernel", kernel_bytes, 0o644))?;
//! let image = Box::new(fs).close()?;
//! ```

pub mod echfs;
pub mod error;
pub mod ext2;
pub mod fat;
pub mod fsz;
pub mod lean;
pub mod minix;

pub use error::{FsError, FsResult};

use crate::artifact::disk::helpers::Guid;
use crate::image::ImageBuffer;

pub const S_IFMT: u32 = 0o170000;
pub const S_IFSOCK: u32 = 0o140000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFBLK: u32 = 0o060000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFIFO: u32 = 0o010000;

/// Disk-level description of the partition a builder fills.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionDescriptor {
    pub type_guid: Guid,
    pub part_guid: Guid,
    pub start_lba: u64,
    /// Inclusive.
    pub end_lba: u64,
    pub name: String,
}

impl PartitionDescriptor {
    pub fn sectors(&self) -> u64 {
        (self.end_lba + 1).saturating_sub(self.start_lba)
    }

    pub fn size_bytes(&self) -> u64 {
        self.sectors() * 512
    }

    /// Descriptor of `sectors` sectors starting at `start_lba`, mostly for tests
    /// and for building standalone partition images.
    pub fn with_sectors(start_lba: u64, sectors: u64, part_guid: Guid) -> Self {
        Self {
            type_guid: Guid::default(),
            part_guid,
            start_lba,
            end_lba: start_lba + sectors.saturating_sub(1),
            name: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    CharDevice,
    BlockDevice,
    Other,
}

impl FileKind {
    pub fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            S_IFREG => Self::Regular,
            S_IFDIR => Self::Directory,
            S_IFLNK => Self::Symlink,
            S_IFCHR => Self::CharDevice,
            S_IFBLK => Self::BlockDevice,
            _ => Self::Other,
        }
    }

    pub fn type_bits(self) -> u32 {
        match self {
            Self::Regular => S_IFREG,
            Self::Directory => S_IFDIR,
            Self::Symlink => S_IFLNK,
            Self::CharDevice => S_IFCHR,
            Self::BlockDevice => S_IFBLK,
            Self::Other => 0,
        }
    }

    pub fn is_device(self) -> bool {
        matches!(self, Self::CharDevice | Self::BlockDevice)
    }
}

/// Stat data of one walked entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub kind: FileKind,
    /// Full `st_mode`, type bits included.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub size: u64,
    pub rdev: u64,
}

impl Metadata {
    pub fn new(kind: FileKind, permissions: u32) -> Self {
        Self {
            kind,
            mode: kind.type_bits() | (permissions & 0o7777),
            uid: 0,
            gid: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            size: 0,
            rdev: 0,
        }
    }

    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }

    pub fn with_times(mut self, seconds: i64) -> Self {
        self.atime = seconds;
        self.mtime = seconds;
        self.ctime = seconds;
        self
    }
}

/// One entry handed to [`FsBuilder::add`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Slash-separated, relative to the tree root.
    pub path: String,
    pub meta: Metadata,
    /// File data or symlink target; empty for directories and devices.
    pub content: Vec<u8>,
}

impl Entry {
    pub fn new(path: impl Into<String>, meta: Metadata, content: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            meta,
            content,
        }
    }

    pub fn file(path: impl Into<String>, content: impl Into<Vec<u8>>, permissions: u32) -> Self {
        let content = content.into();
        let mut meta = Metadata::new(FileKind::Regular, permissions);
        meta.size = content.len() as u64;
        Self::new(path, meta, content)
    }

    pub fn dir(path: impl Into<String>, permissions: u32) -> Self {
        Self::new(path, Metadata::new(FileKind::Directory, permissions), Vec::new())
    }

    pub fn symlink(path: impl Into<String>, target: &str) -> Self {
        let mut meta = Metadata::new(FileKind::Symlink, 0o777);
        meta.size = target.len() as u64;
        Self::new(path, meta, target.as_bytes().to_vec())
    }

    pub fn device(path: impl Into<String>, kind: FileKind, rdev: u64, permissions: u32) -> Self {
        let mut meta = Metadata::new(kind, permissions);
        meta.rdev = rdev;
        Self::new(path, meta, Vec::new())
    }

    pub fn kind(&self) -> FileKind {
        self.meta.kind
    }

    /// Path components with empty segments dropped.
    pub fn components(&self) -> Vec<&str> {
        self.path.split('/').filter(|c| !c.is_empty()).collect()
    }

    /// Last path component.
    pub fn name(&self) -> &str {
        self.path
            .rsplit('/')
            .find(|c| !c.is_empty())
            .unwrap_or("")
    }

    /// Parent components and leaf name.
    pub fn split(&self) -> (Vec<&str>, &str) {
        let mut parts = self.components();
        let leaf = parts.pop().unwrap_or("");
        (parts, leaf)
    }

    /// Entries every builder ignores: synthetic "." / "..", empty names and
    /// kinds the format cannot represent.
    pub fn is_skipped(&self, devices: bool) -> bool {
        let name = self.name();
        if name.is_empty() || name == "." || name == ".." {
            return true;
        }
        match self.kind() {
            FileKind::Regular | FileKind::Directory | FileKind::Symlink => false,
            FileKind::CharDevice | FileKind::BlockDevice => !devices,
            FileKind::Other => true,
        }
    }
}

/// Common open/add/close contract of every image builder.
pub trait FsBuilder {
    /// Size and format an empty image. `None` builds a bare initrd.
    fn open(part: Option<&PartitionDescriptor>) -> FsResult<Self>
    where
        Self: Sized;

    /// Place one entry; ancestors must already have been added.
    fn add(&mut self, entry: &Entry) -> FsResult<()>;

    /// Finalize bookkeeping and release the image.
    fn close(self: Box<Self>) -> FsResult<ImageBuffer>;
}

/// Timestamp stamped on superblocks and synthetic entries. Honors
/// `SOURCE_DATE_EPOCH` so repeated builds produce identical images.
pub fn build_time() -> i64 {
    std::env::var("SOURCE_DATE_EPOCH")
        .ok()
        .and_then(|v| v.trim().parse::<i64>().ok())
        .unwrap_or_else(|| time::OffsetDateTime::now_utc().unix_timestamp())
}

/// Open `B` behind a trait object, the shape the registry stores.
pub fn open_boxed<B: FsBuilder + 'static>(
    part: Option<&PartitionDescriptor>,
) -> FsResult<Box<dyn FsBuilder>> {
    Ok(Box::new(B::open(part)?))
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    pub fn partition(sectors: u64) -> PartitionDescriptor {
        let guid: Guid = "12345678-9ABC-DEF0-1122-334455667788"
            .parse()
            .unwrap();
        PartitionDescriptor::with_sectors(2048, sectors, guid)
    }
}
