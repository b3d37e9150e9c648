//! Format-name registry.
//!
//! Maps the names accepted in build configs (`initrd.type`, `partitions[].type`
//! and `partitions[].driver`) to a builder constructor and, for partition
//! formats, the GPT type GUID that goes into the partition table.

use crate::artifact::cpio::CpioBuilder;
use crate::artifact::disk::helpers::Guid;
use crate::artifact::jamesm::JamesmBuilder;
use crate::artifact::tar::TarBuilder;
use crate::fs::echfs::EchfsBuilder;
use crate::fs::ext2::Ext2Builder;
use crate::fs::fat::FatBuilder;
use crate::fs::fsz::FszBuilder;
use crate::fs::lean::LeanBuilder;
use crate::fs::minix::MinixBuilder;
use crate::fs::{open_boxed, FsBuilder, FsError, FsResult, PartitionDescriptor};

pub type OpenFn = fn(Option<&PartitionDescriptor>) -> FsResult<Box<dyn FsBuilder>>;

/// One registered format.
#[derive(Clone, Copy)]
pub struct Driver {
    pub name: &'static str,
    /// Partition type; `None` for formats without one.
    pub type_guid: Option<Guid>,
    pub open: OpenFn,
    /// Whether the format can be built without a partition.
    pub initrd: bool,
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("name", &self.name)
            .field("type_guid", &self.type_guid)
            .field("initrd", &self.initrd)
            .finish()
    }
}

pub const LINUX_DATA: Guid = Guid::new(
    0x0FC6_3DAF,
    0x8483,
    0x4772,
    [0x8E, 0x79, 0x3D, 0x69, 0xD8, 0x47, 0x7D, 0xE4],
);
pub const MS_BASIC_DATA: Guid = Guid::new(
    0xEBD0_A0A2,
    0xB9E5,
    0x4433,
    [0x87, 0xC0, 0x68, 0xB6, 0xB7, 0x26, 0x99, 0xC7],
);
pub const FSZ_TYPE: Guid = Guid::new(
    0x5A2F_534F,
    0x0000,
    0x5346,
    [0x2F, 0x5A, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
);
pub const LEAN_TYPE: Guid = Guid::new(
    0xBB5A_91B0,
    0x977E,
    0x11DB,
    [0xB6, 0x06, 0x08, 0x00, 0x20, 0x0C, 0x9A, 0x66],
);
pub const MINIX_TYPE: Guid = Guid::new(
    0xB7AA_DF00,
    0xDE27,
    0x11CA,
    [0xA5, 0x74, 0x56, 0x72, 0x69, 0x63, 0x6B, 0x69],
);

pub static DRIVERS: &[Driver] = &[
    Driver {
        name: "cpio",
        type_guid: None,
        open: open_boxed::<CpioBuilder>,
        initrd: true,
    },
    Driver {
        name: "tar",
        type_guid: None,
        open: open_boxed::<TarBuilder>,
        initrd: true,
    },
    Driver {
        name: "jamesm",
        type_guid: None,
        open: open_boxed::<JamesmBuilder>,
        initrd: true,
    },
    Driver {
        name: "echfs",
        type_guid: None,
        open: open_boxed::<EchfsBuilder>,
        initrd: true,
    },
    Driver {
        name: "ext2",
        type_guid: Some(LINUX_DATA),
        open: open_boxed::<Ext2Builder>,
        initrd: false,
    },
    Driver {
        name: "fat16",
        type_guid: Some(MS_BASIC_DATA),
        open: open_boxed::<FatBuilder>,
        initrd: false,
    },
    Driver {
        name: "fat32",
        type_guid: Some(MS_BASIC_DATA),
        open: open_boxed::<FatBuilder>,
        initrd: false,
    },
    Driver {
        name: "fsz",
        type_guid: Some(FSZ_TYPE),
        open: open_boxed::<FszBuilder>,
        initrd: true,
    },
    Driver {
        name: "lean",
        type_guid: Some(LEAN_TYPE),
        open: open_boxed::<LeanBuilder>,
        initrd: false,
    },
    Driver {
        name: "minix",
        type_guid: Some(MINIX_TYPE),
        open: open_boxed::<MinixBuilder>,
        initrd: false,
    },
];

fn accepted(filter: impl Fn(&Driver) -> bool) -> String {
    DRIVERS
        .iter()
        .filter(|d| filter(d))
        .map(|d| d.name)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Look up a format by name.
pub fn find(name: &str) -> FsResult<&'static Driver> {
    DRIVERS
        .iter()
        .find(|d| d.name == name)
        .ok_or_else(|| FsError::UnknownFormat {
            name: name.to_string(),
            accepted: accepted(|_| true),
        })
}

/// Look up a format that can produce an initrd without a partition.
pub fn find_initrd(name: &str) -> FsResult<&'static Driver> {
    match DRIVERS.iter().find(|d| d.name == name && d.initrd) {
        Some(driver) => Ok(driver),
        None => Err(FsError::UnknownFormat {
            name: name.to_string(),
            accepted: accepted(|d| d.initrd),
        }),
    }
}

/// Partition type from either a registry name or a literal GUID.
///
/// Formats without a type GUID of their own are stored as Linux data.
pub fn resolve_type(raw: &str) -> FsResult<Guid> {
    if let Ok(driver) = find(raw) {
        return Ok(driver.type_guid.unwrap_or(LINUX_DATA));
    }
    raw.parse::<Guid>().map_err(|_| FsError::UnknownFormat {
        name: raw.to_string(),
        accepted: DRIVERS
            .iter()
            .filter_map(|d| d.type_guid.map(|g| format!("{} ({})", d.name, g)))
            .collect::<Vec<_>>()
            .join(", "),
    })
}

/// Reverse lookup used when a partition is declared by GUID only.
pub fn by_type(guid: &Guid) -> Option<&'static Driver> {
    DRIVERS.iter().find(|d| d.type_guid.as_ref() == Some(guid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::testutil::partition;
    use crate::fs::Entry;

    #[test]
    fn test_find_lists_accepted_names() {
        assert_eq!(find("ext2").unwrap().name, "ext2");
        match find("btrfs") {
            Err(FsError::UnknownFormat { name, accepted }) => {
                assert_eq!(name, "btrfs");
                assert!(accepted.starts_with("cpio, tar, jamesm"));
                assert!(accepted.ends_with("minix"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_initrd_formats() {
        assert!(find_initrd("cpio").is_ok());
        assert!(find_initrd("fsz").is_ok());
        match find_initrd("fat32") {
            Err(FsError::UnknownFormat { accepted, .. }) => {
                assert_eq!(accepted, "cpio, tar, jamesm, echfs, fsz");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_resolve_type() {
        assert_eq!(resolve_type("fat32").unwrap(), MS_BASIC_DATA);
        assert_eq!(
            resolve_type("minix").unwrap().to_string(),
            "B7AADF00-DE27-11CA-A574-567269636B69"
        );
        let raw = "21686148-6449-6E6F-744E-656564454649";
        assert_eq!(resolve_type(raw).unwrap().to_string(), raw);
        assert!(matches!(
            resolve_type("zfs"),
            Err(FsError::UnknownFormat { .. })
        ));
        assert_eq!(by_type(&LEAN_TYPE).map(|d| d.name), Some("lean"));
    }

    #[test]
    fn test_open_through_table() {
        let mut fs = (find("tar").unwrap().open)(None).unwrap();
        fs.add(&Entry::file("hello", b"hi".to_vec(), 0o644)).unwrap();
        assert_eq!(fs.close().unwrap().len(), 1024);

        let part = partition(2048);
        let fs = (find("ext2").unwrap().open)(Some(&part)).unwrap();
        assert_eq!(fs.close().unwrap().len() as u64, part.size_bytes());
    }
}
