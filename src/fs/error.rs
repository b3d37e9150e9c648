//! Error type shared by every image builder.

use thiserror::Error;

/// Failure raised while laying out a filesystem image.
///
/// Builders never abort the process; the caller decides what a failure means.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FsError {
    /// Partition cannot hold the format's fixed overhead.
    #[error("{format}: partition too small")]
    TooSmall { format: &'static str },

    /// No free inode, block, cluster or entry slot left.
    #[error("{format}: no free {what} left")]
    NoSpace {
        format: &'static str,
        what: &'static str,
    },

    /// Indirection or extent limit exceeded.
    #[error("{format}: file too big: {path}")]
    TooBig { format: &'static str, path: String },

    /// Directory record area exhausted.
    #[error("{format}: too many entries in directory: {path}")]
    DirFull { format: &'static str, path: String },

    #[error("{format}: name too long: {path}")]
    NameTooLong { format: &'static str, path: String },

    /// Symlink target does not fit into a single allocation unit.
    #[error("{format}: symlink target too long: {path}")]
    TargetTooLong { format: &'static str, path: String },

    /// An ancestor directory was never added.
    #[error("{format}: parent directory not found for {path}")]
    NotFound { format: &'static str, path: String },

    #[error("{format}: {reason}")]
    Unsupported {
        format: &'static str,
        reason: &'static str,
    },

    #[error("unknown filesystem type '{name}', accepted values: {accepted}")]
    UnknownFormat { name: String, accepted: String },

    /// Access outside the image buffer.
    #[error("access of {len} bytes at offset {offset} outside image of {size} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },
}

pub type FsResult<T> = std::result::Result<T, FsError>;
