//! Source tree walking for image builders.
//!
//! Turns a host directory into the pre-order stream of [`Entry`] values every
//! [`FsBuilder`] consumes: directories before their children, siblings in
//! byte order of their names, symlinks never followed.

use anyhow::{bail, Context, Result};
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use walkdir::WalkDir;

use crate::fs::{Entry, FileKind, FsBuilder, Metadata};

/// Read one host file into an [`Entry`] whose path is relative to `root`.
///
/// Regular files carry their data, symlinks their target; directories and
/// devices carry nothing.
pub fn read_entry(root: &Path, path: &Path) -> Result<Entry> {
    let rel = path
        .strip_prefix(root)
        .with_context(|| format!("{} is not below {}", path.display(), root.display()))?;
    let Some(rel) = rel.to_str() else {
        bail!("Non UTF-8 path in source tree: {}", path.display());
    };
    let rel = rel.replace(std::path::MAIN_SEPARATOR, "/");

    let st = fs::symlink_metadata(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?;
    let kind = FileKind::from_mode(st.mode());
    let meta = Metadata {
        kind,
        mode: st.mode(),
        uid: st.uid(),
        gid: st.gid(),
        atime: st.atime(),
        mtime: st.mtime(),
        ctime: st.ctime(),
        size: st.size(),
        rdev: st.rdev(),
    };
    let content = match kind {
        FileKind::Regular => {
            fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?
        }
        FileKind::Symlink => fs::read_link(path)
            .with_context(|| format!("Failed to read link {}", path.display()))?
            .as_os_str()
            .as_bytes()
            .to_vec(),
        _ => Vec::new(),
    };
    Ok(Entry::new(rel, meta, content))
}

/// All entries below `root`, pre-order.
pub fn walk_tree(root: &Path) -> Result<Vec<Entry>> {
    let mut entries = Vec::new();
    for item in WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let item = item.with_context(|| format!("Failed to walk {}", root.display()))?;
        entries.push(read_entry(root, item.path())?);
    }
    Ok(entries)
}

/// Feed every entry below `root` into `builder`. Returns the number of
/// entries handed over.
///
/// # Example
///
/// ```rust,ignore
/// use bootimg_builder::artifact::filesystem::add_tree;
/// use bootimg_builder::registry;
///
/// let mut fs = (registry::find("cpio")?.open)(None)?;
/// add_tree(fs.as_mut(), Path::new("initrd/"))?;
/// let image = fs.close()?;
/// ```
pub fn add_tree(builder: &mut dyn FsBuilder, root: &Path) -> Result<usize> {
    if !root.is_dir() {
        bail!("Source directory not found: {}", root.display());
    }
    let entries = walk_tree(root)?;
    for entry in &entries {
        log::debug!("adding {}", entry.path);
        builder
            .add(entry)
            .with_context(|| format!("Failed to add {}", entry.path))?;
    }
    Ok(entries.len())
}

/// Atomically move a file by renaming, with fallback to copy+delete.
///
/// Images are written next to their destination and moved into place once
/// complete, so an interrupted build never leaves a truncated image behind.
pub fn atomic_move(src: &Path, dst: &Path) -> Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            // Different filesystem, fall back to copy+delete
            fs::copy(src, dst)
                .with_context(|| format!("Failed to copy {} to {}", src.display(), dst.display()))?;
            fs::remove_file(src)
                .with_context(|| format!("Failed to remove {}", src.display()))?;
            Ok(())
        }
    }
}
