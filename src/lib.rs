//! In-memory image builders for bootable media.
//!
//! Every filesystem and archive format is written from scratch into a byte
//! buffer; nothing is mounted and no host tools are run. On top of the
//! builders sits a pipeline that turns a JSON or TOML config into an initrd,
//! a boot partition or a complete hybrid GPT disk image.
//!
//! # Architecture
//!
//! ```text
//! bootimg-builder (binary)
//!     │
//!     └── pipeline ── config loader, output selection
//!             │
//!             ├── artifact::initramfs ── initrd build/load, kernel probe
//!             ├── artifact::disk ─────── ESP, GPT, ISO9660, image writer
//!             └── registry ───────────── format name → builder
//!                     │
//!                     ├── fs::{ext2, fat, lean, echfs, fsz, minix}
//!                     └── artifact::{cpio, tar, jamesm}
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use bootimg_builder::fs::{Entry, FsBuilder};
//! use bootimg_builder::registry;
//!
//! let driver = registry::find("ext2")?;
//! let mut builder = (driver.open)(Some(&partition))?;
//! builder.add(&Entry::dir("etc", 0o755))?;
//! builder.add(&Entry::file("etc/motd", b"hello\n".to_vec(), 0o644))?;
//! let image = builder.close()?;
//! ```

pub mod artifact;
pub mod fs;
pub mod image;
pub mod kernel;
pub mod pipeline;
pub mod registry;
