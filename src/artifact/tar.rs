//! ustar archive builder.
//!
//! Each member is a 512-byte header followed by its data padded to 512.
//! Numeric fields are zero-padded octal; owner and group are "root". The
//! archive may also fill a partition, in which case it only needs room for
//! one header.

use crate::fs::{Entry, FileKind, FsBuilder, FsError, FsResult, PartitionDescriptor};
use crate::image::ImageBuffer;

const FORMAT: &str = "tar";
const BLOCK: usize = 512;
const NAME_MAX: usize = 99;

// Header field offsets
const H_NAME: usize = 0;
const H_MODE: usize = 100;
const H_UID: usize = 108;
const H_GID: usize = 116;
const H_SIZE: usize = 124;
const H_MTIME: usize = 136;
const H_CHKSUM: usize = 148;
const H_TYPEFLAG: usize = 156;
const H_LINKNAME: usize = 157;
const H_MAGIC: usize = 257;
const H_UNAME: usize = 265;
const H_GNAME: usize = 297;

pub struct TarBuilder {
    img: ImageBuffer,
}

/// Additive header checksum with the checksum field counted as spaces.
pub fn header_checksum(header: &[u8; BLOCK]) -> u32 {
    header
        .iter()
        .enumerate()
        .map(|(i, &b)| {
            if (H_CHKSUM..H_CHKSUM + 8).contains(&i) {
                u32::from(b' ')
            } else {
                u32::from(b)
            }
        })
        .sum()
}

fn put_octal(header: &mut [u8; BLOCK], offset: usize, width: usize, value: u64) {
    let field = format!("{:0width$o}", value, width = width);
    header[offset..offset + width].copy_from_slice(field.as_bytes());
}

impl FsBuilder for TarBuilder {
    fn open(part: Option<&PartitionDescriptor>) -> FsResult<Self> {
        if part.is_some_and(|p| p.sectors() < 2) {
            return Err(FsError::TooSmall { format: FORMAT });
        }
        Ok(Self {
            img: ImageBuffer::new(),
        })
    }

    fn add(&mut self, entry: &Entry) -> FsResult<()> {
        if entry.is_skipped(false) {
            return Ok(());
        }
        let path = entry.path.trim_start_matches('/');
        if path.len() > NAME_MAX {
            return Err(FsError::NameTooLong {
                format: FORMAT,
                path: entry.path.clone(),
            });
        }
        let (typeflag, data): (u8, &[u8]) = match entry.kind() {
            FileKind::Directory => (b'5', &[]),
            FileKind::Symlink => (b'2', &[]),
            _ => (b'0', &entry.content),
        };

        let mut header = [0u8; BLOCK];
        header[H_NAME..H_NAME + path.len()].copy_from_slice(path.as_bytes());
        put_octal(&mut header, H_MODE, 7, u64::from(entry.meta.mode & 0o77777));
        put_octal(&mut header, H_UID, 7, 0);
        put_octal(&mut header, H_GID, 7, 0);
        put_octal(&mut header, H_SIZE, 11, data.len() as u64);
        put_octal(&mut header, H_MTIME, 11, 0);
        header[H_TYPEFLAG] = typeflag;
        if typeflag == b'2' {
            if entry.content.len() > NAME_MAX {
                return Err(FsError::TargetTooLong {
                    format: FORMAT,
                    path: entry.path.clone(),
                });
            }
            header[H_LINKNAME..H_LINKNAME + entry.content.len()].copy_from_slice(&entry.content);
        }
        header[H_MAGIC..H_MAGIC + 7].copy_from_slice(b"ustar  ");
        header[H_UNAME..H_UNAME + 4].copy_from_slice(b"root");
        header[H_GNAME..H_GNAME + 4].copy_from_slice(b"root");
        let sum = header_checksum(&header);
        put_octal(&mut header, H_CHKSUM, 6, u64::from(sum));
        header[H_CHKSUM + 6] = 0;
        header[H_CHKSUM + 7] = b' ';

        self.img.append(&header);
        self.img.append(data);
        self.img.pad_to(BLOCK);
        log::debug!("tar: {} ({} bytes)", path, data.len());
        Ok(())
    }

    fn close(self: Box<Self>) -> FsResult<ImageBuffer> {
        log::info!("tar: {} bytes", self.img.len());
        Ok(self.img)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::testutil::partition;
    use std::io::Read;

    #[test]
    fn test_zero_byte_file_is_one_header() {
        let mut tar = TarBuilder::open(None).unwrap();
        tar.add(&Entry::file("empty", Vec::new(), 0o644)).unwrap();
        let img = Box::new(tar).close().unwrap();
        assert_eq!(img.len(), 512);

        let mut header = [0u8; 512];
        header.copy_from_slice(img.as_slice());
        let stored = std::str::from_utf8(&header[148..154]).unwrap();
        assert_eq!(u32::from_str_radix(stored, 8).unwrap(), header_checksum(&header));
        assert_eq!(&header[154..156], b"\0 ");
        assert_eq!(header[156], b'0');
        assert_eq!(&header[257..264], b"ustar  ");
    }

    #[test]
    fn test_readable_by_tar_crate() {
        let mut tar = TarBuilder::open(None).unwrap();
        tar.add(&Entry::dir("etc", 0o755)).unwrap();
        tar.add(&Entry::file("etc/hostname", b"bootimg\n".to_vec(), 0o644))
            .unwrap();
        tar.add(&Entry::file("etc/blob", vec![0xA5u8; 1000], 0o600))
            .unwrap();
        tar.add(&Entry::symlink("hostname", "etc/hostname")).unwrap();
        let img = Box::new(tar).close().unwrap();
        assert_eq!(img.len(), 512 * 2 + 1024 + 512 * 2 + 512);

        // append the end-of-archive marker the reader expects
        let mut raw = img.into_vec();
        raw.extend_from_slice(&[0u8; 1024]);
        let mut archive = tar::Archive::new(raw.as_slice());
        let mut seen = Vec::new();
        for member in archive.entries().unwrap() {
            let mut member = member.unwrap();
            let path = member.path().unwrap().to_string_lossy().into_owned();
            let kind = member.header().entry_type();
            let mut data = Vec::new();
            member.read_to_end(&mut data).unwrap();
            if kind.is_symlink() {
                let target = member.link_name().unwrap().unwrap();
                assert_eq!(target.to_str(), Some("etc/hostname"));
            }
            seen.push((path, kind.is_dir(), data.len()));
        }
        assert_eq!(
            seen,
            vec![
                ("etc".to_string(), true, 0),
                ("etc/hostname".to_string(), false, 8),
                ("etc/blob".to_string(), false, 1000),
                ("hostname".to_string(), false, 0),
            ]
        );
    }

    #[test]
    fn test_limits() {
        assert!(matches!(
            TarBuilder::open(Some(&partition(1))),
            Err(FsError::TooSmall { .. })
        ));
        let mut tar = TarBuilder::open(Some(&partition(2))).unwrap();
        assert!(matches!(
            tar.add(&Entry::file("x".repeat(100), Vec::new(), 0o644)),
            Err(FsError::NameTooLong { .. })
        ));
        assert!(matches!(
            tar.add(&Entry::symlink("l", &"t".repeat(100))),
            Err(FsError::TargetTooLong { .. })
        ));
    }
}
