//! CPIO archive builder for initrds.
//!
//! Writes the portable "odc" ASCII format: a 76-byte header of octal fields
//! per entry, the NUL-terminated name, then the data with no padding. The
//! archive ends with a `TRAILER!!!` record and is padded to 512 bytes.
//!
//! # Example
//!
//! ```rust,ignore
//! use bootimg_builder::artifact::cpio::CpioBuilder;
//! use bootimg_builder::fs::{Entry, FsBuilder};
//!
//! let mut cpio = CpioBuilder::open(None)?;
//! cpio.add(&Entry::file("sys/core", kernel, 0o755))?;
//! let initrd = Box::new(cpio).close()?;
//! ```

use crate::fs::{Entry, FileKind, FsBuilder, FsError, FsResult, PartitionDescriptor};
use crate::image::ImageBuffer;

const FORMAT: &str = "cpio";
const MAGIC: &str = "070707";
const TRAILER: &str = "TRAILER!!!";

pub struct CpioBuilder {
    img: ImageBuffer,
    entries: usize,
}

/// Format one odc header. Device, inode, owner, link count and time fields
/// are zero, the way a reproducible initrd wants them.
fn header(mode: u32, nlink: u32, namesize: usize, filesize: usize) -> String {
    format!(
        "{MAGIC}{:06o}{:06o}{:06o}{:06o}{:06o}{:06o}{:06o}{:011o}{:06o}{:011o}",
        0,
        0,
        mode & 0o777777,
        0,
        0,
        nlink,
        0,
        0,
        namesize,
        filesize
    )
}

impl FsBuilder for CpioBuilder {
    fn open(part: Option<&PartitionDescriptor>) -> FsResult<Self> {
        if part.is_some() {
            return Err(FsError::Unsupported {
                format: FORMAT,
                reason: "cpio can only be used as initrd",
            });
        }
        Ok(Self {
            img: ImageBuffer::new(),
            entries: 0,
        })
    }

    fn add(&mut self, entry: &Entry) -> FsResult<()> {
        if entry.is_skipped(false) {
            return Ok(());
        }
        let path = entry.path.trim_start_matches('/');
        let data: &[u8] = match entry.kind() {
            FileKind::Directory => &[],
            _ => &entry.content,
        };
        let head = header(entry.meta.mode, 0, path.len() + 1, data.len());
        self.img.append(head.as_bytes());
        self.img.append(path.as_bytes());
        self.img.append(&[0]);
        self.img.append(data);
        self.entries += 1;
        log::debug!("cpio: {} ({} bytes)", path, data.len());
        Ok(())
    }

    fn close(mut self: Box<Self>) -> FsResult<ImageBuffer> {
        let head = header(0, 1, TRAILER.len() + 1, 0);
        self.img.append(head.as_bytes());
        self.img.append(TRAILER.as_bytes());
        self.img.append(&[0]);
        self.img.pad_to(512);
        log::info!("cpio: {} entries, {} bytes", self.entries, self.img.len());
        Ok(self.img)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::testutil::partition;

    /// Minimal odc reader: (name, mode, data) per member, trailer excluded.
    fn read_members(raw: &[u8]) -> Vec<(String, u32, Vec<u8>)> {
        let octal = |s: &[u8]| u32::from_str_radix(std::str::from_utf8(s).unwrap(), 8).unwrap();
        let mut out = Vec::new();
        let mut pos = 0;
        loop {
            let hdr = &raw[pos..pos + 76];
            assert_eq!(&hdr[..6], b"070707");
            let mode = octal(&hdr[18..24]);
            let namesize = octal(&hdr[59..65]) as usize;
            let filesize = octal(&hdr[65..76]) as usize;
            let name = &raw[pos + 76..pos + 76 + namesize - 1];
            assert_eq!(raw[pos + 76 + namesize - 1], 0);
            let name = String::from_utf8(name.to_vec()).unwrap();
            let start = pos + 76 + namesize;
            if name == "TRAILER!!!" {
                return out;
            }
            out.push((name, mode, raw[start..start + filesize].to_vec()));
            pos = start + filesize;
        }
    }

    #[test]
    fn test_members_and_trailer() {
        let mut cpio = CpioBuilder::open(None).unwrap();
        cpio.add(&Entry::dir("sys", 0o755)).unwrap();
        cpio.add(&Entry::file("sys/core", b"\x7fELF".to_vec(), 0o755))
            .unwrap();
        cpio.add(&Entry::symlink("core", "sys/core")).unwrap();
        let img = Box::new(cpio).close().unwrap();
        assert_eq!(img.len() % 512, 0);

        let members = read_members(img.as_slice());
        assert_eq!(members.len(), 3);
        assert_eq!(members[0], ("sys".into(), 0o040755, Vec::new()));
        assert_eq!(members[1], ("sys/core".into(), 0o100755, b"\x7fELF".to_vec()));
        assert_eq!(members[2], ("core".into(), 0o120777, b"sys/core".to_vec()));
    }

    #[test]
    fn test_trailer_has_one_link() {
        let img = Box::new(CpioBuilder::open(None).unwrap()).close().unwrap();
        let raw = img.as_slice();
        assert_eq!(&raw[36..42], b"000001");
        assert_eq!(&raw[76..86], b"TRAILER!!!");
        assert_eq!(img.len(), 512);
    }

    #[test]
    fn test_rejects_partition_and_devices() {
        assert!(matches!(
            CpioBuilder::open(Some(&partition(64))),
            Err(FsError::Unsupported { .. })
        ));
        let mut cpio = CpioBuilder::open(None).unwrap();
        cpio.add(&Entry::device("dev/tty", FileKind::CharDevice, 0x500, 0o666))
            .unwrap();
        assert_eq!(cpio.entries, 0);
    }
}
