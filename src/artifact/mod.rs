//! Image artifacts built on top of the filesystem drivers.
//!
//! - [`cpio`], [`tar`], [`jamesm`] - initrd archive formats
//! - [`filesystem`] - host directory walking and file moves
//! - [`initramfs`] - initrd preparation and kernel detection
//! - [`disk`] - boot partition, partition tables and the final image

pub mod cpio;
pub mod disk;
pub mod filesystem;
pub mod initramfs;
pub mod jamesm;
pub mod tar;
