//! James Molloy's tutorial initrd.
//!
//! A u32 file count, a fixed table of 64 records of 73 bytes (magic 0xBF,
//! 64-byte name, u32 offset, u32 length), then the file data. Offsets are
//! absolute from the start of the initrd. Only non-empty regular files are
//! stored; the format has no directories.

use crate::fs::{Entry, FileKind, FsBuilder, FsError, FsResult, PartitionDescriptor};
use crate::image::ImageBuffer;

const FORMAT: &str = "jamesm";
const MAX_FILES: usize = 64;
const RECORD: usize = 73;
const TABLE: usize = 4;
const NAME_LEN: usize = 64;
const MAGIC: u8 = 0xBF;

pub struct JamesmBuilder {
    img: ImageBuffer,
    files: usize,
}

impl FsBuilder for JamesmBuilder {
    fn open(part: Option<&PartitionDescriptor>) -> FsResult<Self> {
        if part.is_some() {
            return Err(FsError::Unsupported {
                format: FORMAT,
                reason: "jamesm can only be used as initrd",
            });
        }
        Ok(Self {
            img: ImageBuffer::zeroed(TABLE + MAX_FILES * RECORD),
            files: 0,
        })
    }

    fn add(&mut self, entry: &Entry) -> FsResult<()> {
        if entry.kind() != FileKind::Regular || entry.content.is_empty() {
            return Ok(());
        }
        let name = entry.path.trim_start_matches('/');
        if name.len() >= NAME_LEN {
            return Err(FsError::NameTooLong {
                format: FORMAT,
                path: entry.path.clone(),
            });
        }
        if self.files == MAX_FILES {
            log::warn!("jamesm: no record left for {}", entry.path);
            return Err(FsError::NoSpace {
                format: FORMAT,
                what: "file records",
            });
        }
        let offset = self.img.append(&entry.content);
        let record = TABLE + self.files * RECORD;
        self.img.put_u8(record, MAGIC)?;
        self.img.put_bytes(record + 1, name.as_bytes())?;
        self.img.put_u32(record + 1 + NAME_LEN, offset as u32)?;
        self.img
            .put_u32(record + 5 + NAME_LEN, entry.content.len() as u32)?;
        self.files += 1;
        self.img.put_u32(0, self.files as u32)?;
        Ok(())
    }

    fn close(self: Box<Self>) -> FsResult<ImageBuffer> {
        log::info!("jamesm: {} files", self.files);
        Ok(self.img)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_point_at_data() {
        let mut fs = JamesmBuilder::open(None).unwrap();
        fs.add(&Entry::dir("etc", 0o755)).unwrap();
        fs.add(&Entry::file("etc/motd", b"hello".to_vec(), 0o644))
            .unwrap();
        fs.add(&Entry::file("empty", Vec::new(), 0o644)).unwrap();
        fs.add(&Entry::file("test.txt", b"abc".to_vec(), 0o644)).unwrap();
        let img = Box::new(fs).close().unwrap();

        assert_eq!(img.u32_at(0).unwrap(), 2);
        assert_eq!(img.u8_at(4).unwrap(), 0xBF);
        assert_eq!(img.bytes(5, 9).unwrap(), b"etc/motd\0");
        let offset = img.u32_at(4 + 65).unwrap() as usize;
        assert_eq!(offset, 4 + 64 * 73);
        assert_eq!(img.u32_at(4 + 69).unwrap(), 5);
        assert_eq!(img.bytes(offset, 5).unwrap(), b"hello");
        let second = img.u32_at(4 + 73 + 65).unwrap() as usize;
        assert_eq!(img.bytes(second, 3).unwrap(), b"abc");
        assert_eq!(img.len(), 4 + 64 * 73 + 8);
    }

    #[test]
    fn test_capped_at_64_files() {
        let mut fs = JamesmBuilder::open(None).unwrap();
        for i in 0..64 {
            fs.add(&Entry::file(format!("f{i}"), vec![1u8], 0o644)).unwrap();
        }
        assert!(matches!(
            fs.add(&Entry::file("one-too-many", vec![1u8], 0o644)),
            Err(FsError::NoSpace { .. })
        ));
    }

    #[test]
    fn test_initrd_only() {
        let part = crate::fs::testutil::partition(64);
        assert!(matches!(
            JamesmBuilder::open(Some(&part)),
            Err(FsError::Unsupported { .. })
        ));
    }
}
