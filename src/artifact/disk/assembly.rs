//! Disk assembly: splice the GPT, the ESP and every partition into one
//! sparse file.

use anyhow::{bail, Context, Result};
use std::fs::{self, File};
use std::io::{self, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::esp::Esp;
use super::gpt::GptImage;
use super::partitions::{DiskLayout, PartitionSource, PlacedPartition, SECTOR_SIZE};
use crate::artifact::filesystem::{add_tree, atomic_move};
use crate::fs::PartitionDescriptor;
use crate::image::ImageBuffer;
use crate::registry;

/// Fail when a built filesystem overflows its partition.
pub fn check_fits(descriptor: &PartitionDescriptor, image: &ImageBuffer) -> Result<()> {
    if image.len() as u64 > descriptor.size_bytes() {
        bail!(
            "partition too small for constructed filesystem ({} > {} bytes)",
            image.len(),
            descriptor.size_bytes()
        );
    }
    Ok(())
}

/// Build a directory-sourced partition with its registry driver.
pub fn build_partition(descriptor: &PartitionDescriptor, dir: &Path, driver: &str) -> Result<ImageBuffer> {
    let driver = registry::find(driver)?;
    let mut builder = (driver.open)(Some(descriptor))?;
    let count = add_tree(builder.as_mut(), dir)?;
    let image = builder.close()?;
    log::debug!("{}: {} entries from {}", driver.name, count, dir.display());
    check_fits(descriptor, &image)?;
    Ok(image)
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "disk".to_string());
    path.with_file_name(format!(".{}.partial", name))
}

fn write_at(out: &mut File, offset: u64, data: &[u8]) -> Result<()> {
    out.seek(SeekFrom::Start(offset))?;
    out.write_all(data)?;
    Ok(())
}

fn write_partition(out: &mut File, part: &PlacedPartition) -> Result<()> {
    let offset = part.descriptor.start_lba * SECTOR_SIZE;
    match &part.source {
        PartitionSource::Empty => Ok(()),
        PartitionSource::File(path) => {
            println!("  Writing partition #{} ({})...", part.index + 1, path.display());
            let file = File::open(path)
                .with_context(|| format!("Failed to open partition image {}", path.display()))?;
            let len = file.metadata()?.len();
            if len > part.bytes() {
                bail!(
                    "partition #{} image {} does not fit ({} > {} bytes)",
                    part.index + 1,
                    path.display(),
                    len,
                    part.bytes()
                );
            }
            out.seek(SeekFrom::Start(offset))?;
            io::copy(&mut BufReader::with_capacity(1024 * 1024, file), out)
                .with_context(|| format!("Failed to copy {}", path.display()))?;
            Ok(())
        }
        PartitionSource::Directory { path, driver } => {
            println!("  Writing partition #{} ({})...", part.index + 1, driver);
            let image = build_partition(&part.descriptor, path, driver)
                .with_context(|| format!("partition #{}", part.index + 1))?;
            write_at(out, offset, image.as_slice())
        }
    }
}

/// Write the complete disk image to `path`.
///
/// Unused space is skipped with seeks, so the file stays sparse. The image
/// is written next to `path` and moved into place once complete.
pub fn write_image(path: &Path, layout: &DiskLayout, gpt: &GptImage, esp: &Esp) -> Result<()> {
    let tmp = temp_path(path);
    let result = (|| -> Result<()> {
        let mut out = File::create(&tmp)
            .with_context(|| format!("Failed to create {}", tmp.display()))?;
        out.set_len(layout.total_bytes())?;

        write_at(&mut out, 0, gpt.primary.as_slice())?;
        write_at(&mut out, layout.esp_start * SECTOR_SIZE, esp.image.as_slice())?;
        for part in &layout.partitions {
            write_partition(&mut out, part)?;
        }
        write_at(&mut out, layout.backup_start() * SECTOR_SIZE, gpt.backup.as_slice())?;
        out.sync_all()?;
        Ok(())
    })();
    if let Err(err) = result {
        let _ = fs::remove_file(&tmp);
        return Err(err).with_context(|| format!("Failed to write {}", path.display()));
    }
    atomic_move(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::disk::gpt;
    use crate::artifact::disk::partitions::{plan, DiskGeometry, PartitionRequest};
    use crate::fs::testutil::partition;
    use tempfile::TempDir;

    fn esp() -> Esp {
        let mut image = ImageBuffer::zeroed(1024 * 1024);
        image.put_bytes(0x36, b"FAT16   ").unwrap();
        Esp {
            image,
            fat32: false,
            stage2_sector: None,
            payload_sectors: None,
        }
    }

    fn request(name: &str, source: PartitionSource) -> PartitionRequest {
        PartitionRequest {
            type_guid: registry::LINUX_DATA,
            name: name.to_string(),
            size_mib: 1,
            source,
        }
    }

    #[test]
    fn test_check_fits() {
        let descriptor = partition(8);
        assert!(check_fits(&descriptor, &ImageBuffer::zeroed(4096)).is_ok());
        let err = check_fits(&descriptor, &ImageBuffer::zeroed(4097)).unwrap_err();
        assert!(err.to_string().starts_with("partition too small for constructed filesystem"));
    }

    #[test]
    fn test_write_image() {
        let temp = TempDir::new().unwrap();
        let raw = temp.path().join("raw.img");
        fs::write(&raw, vec![0x42u8; 4096]).unwrap();
        let tree = temp.path().join("tree");
        fs::create_dir_all(tree.join("etc")).unwrap();
        fs::write(tree.join("etc/motd"), b"hi\n").unwrap();

        let geometry = DiskGeometry {
            disk_guid: "11111111-2222-3333-4444-555555555555".parse().unwrap(),
            disk_size_mib: 0,
            align_kib: 0,
        };
        let requests = [
            request("raw", PartitionSource::File(raw)),
            request(
                "tar",
                PartitionSource::Directory {
                    path: tree,
                    driver: "tar".to_string(),
                },
            ),
        ];
        let mut esp = esp();
        let layout = plan(&geometry, esp.len() as u64, None, &requests).unwrap();
        let gpt = gpt::build(&layout, &mut esp, false, 0).unwrap();

        let out = temp.path().join("disk.img");
        write_image(&out, &layout, &gpt, &esp).unwrap();
        let disk = fs::read(&out).unwrap();
        assert_eq!(disk.len() as u64, layout.total_bytes());
        assert_eq!(&disk[512..520], b"EFI PART");
        assert_eq!(&disk[128 * 512 + 0x36..128 * 512 + 0x3E], b"FAT16   ");

        let raw_at = (layout.partitions[0].descriptor.start_lba * 512) as usize;
        assert_eq!(disk[raw_at], 0x42);
        let tar_at = (layout.partitions[1].descriptor.start_lba * 512) as usize;
        assert_eq!(&disk[tar_at..tar_at + 3], b"etc");

        let backup = (layout.backup_start() * 512) as usize;
        assert_eq!(&disk[backup + 62 * 512..backup + 62 * 512 + 8], b"EFI PART");
        assert!(!temp.path().join(".disk.img.partial").exists());
    }

    #[test]
    fn test_unknown_driver() {
        let temp = TempDir::new().unwrap();
        let err = build_partition(&partition(2048), temp.path(), "zfs").unwrap_err();
        assert!(err.to_string().contains("unknown filesystem type 'zfs'"));
    }
}
