//! GUID handling for disk and partition identifiers.

use anyhow::{bail, Context, Result};
use std::fmt;
use std::str::FromStr;

use crate::image::crc::crc32;

/// EFI System Partition.
pub const EFI_SYSTEM_TYPE: Guid = Guid::new(
    0xC12A_7328,
    0xF81F,
    0x11D2,
    [0xBA, 0x4B, 0x00, 0xA0, 0xC9, 0x3E, 0xC9, 0x3B],
);

/// BIOS boot partition, reused for the RISC-V payload.
pub const BIOS_BOOT_TYPE: Guid = Guid::new(
    0x2168_6148,
    0x6449,
    0x6E6F,
    [0x74, 0x4E, 0x65, 0x65, 0x64, 0x45, 0x46, 0x49],
);

/// Mixed-endian GUID as stored in GPT headers.
///
/// The first three fields are little-endian on disk, `data4` is stored
/// verbatim.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Guid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl Guid {
    pub const fn new(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Self {
        Self {
            data1,
            data2,
            data3,
            data4,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    /// On-disk representation.
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..4].copy_from_slice(&self.data1.to_le_bytes());
        out[4..6].copy_from_slice(&self.data2.to_le_bytes());
        out[6..8].copy_from_slice(&self.data3.to_le_bytes());
        out[8..16].copy_from_slice(&self.data4);
        out
    }

    pub fn from_bytes(raw: &[u8; 16]) -> Self {
        let mut data4 = [0u8; 8];
        data4.copy_from_slice(&raw[8..16]);
        Self {
            data1: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            data2: u16::from_le_bytes([raw[4], raw[5]]),
            data3: u16::from_le_bytes([raw[6], raw[7]]),
            data4,
        }
    }

    /// Same GUID with `data1` advanced by `n`; partition GUIDs are minted
    /// from the disk GUID this way.
    pub fn nth(&self, n: u32) -> Self {
        Self {
            data1: self.data1.wrapping_add(n),
            ..*self
        }
    }

    /// Disk GUID derived from the build timestamp.
    ///
    /// Each 32-bit word is a CRC of the previous one so that images built in
    /// the same second still get a well-mixed identifier.
    pub fn from_timestamp(unix_seconds: i64) -> Self {
        let mut words = [0u32; 4];
        words[0] = crc32(&unix_seconds.to_le_bytes()) ^ 0x0804_0201;
        words[1] = crc32(&words[0].to_le_bytes());
        words[2] = crc32(&words[1].to_le_bytes()) ^ (unix_seconds as u32);
        words[3] = crc32(&words[2].to_le_bytes());
        let mut raw = [0u8; 16];
        for (chunk, word) in raw.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        Self::from_bytes(&raw)
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-",
            self.data1, self.data2, self.data3, self.data4[0], self.data4[1]
        )?;
        for byte in &self.data4[2..] {
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

impl FromStr for Guid {
    type Err = anyhow::Error;

    /// Parses `XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX` (case-insensitive).
    fn from_str(raw: &str) -> Result<Self> {
        let hex: String = raw.chars().filter(|c| *c != '-').collect();
        let groups: Vec<&str> = raw.split('-').collect();
        if hex.len() != 32
            || !hex.chars().all(|c| c.is_ascii_hexdigit())
            || groups.iter().map(|g| g.len()).collect::<Vec<_>>() != [8, 4, 4, 4, 12]
        {
            bail!(
                "invalid GUID '{}', expected format XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX",
                raw
            );
        }
        let field = |range: std::ops::Range<usize>| {
            u32::from_str_radix(&hex[range], 16)
                .with_context(|| format!("parsing GUID '{}'", raw))
        };
        let mut data4 = [0u8; 8];
        for (i, byte) in data4.iter_mut().enumerate() {
            *byte = field(16 + i * 2..18 + i * 2)? as u8;
        }
        Ok(Self {
            data1: field(0..8)?,
            data2: field(8..12)? as u16,
            data3: field(12..16)? as u16,
            data4,
        })
    }
}

/// Encode `name` as UTF-16LE into at most `max_units` code units.
pub fn utf16_name(name: &str, max_units: usize) -> Vec<u8> {
    name.encode_utf16()
        .take(max_units)
        .flat_map(|unit| unit.to_le_bytes())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let guid: Guid = "C12A7328-F81F-11D2-BA4B-00A0C93EC93B".parse().unwrap();
        assert_eq!(guid.data1, 0xC12A_7328);
        assert_eq!(guid.data2, 0xF81F);
        assert_eq!(guid.data3, 0x11D2);
        assert_eq!(guid.data4, [0xBA, 0x4B, 0x00, 0xA0, 0xC9, 0x3E, 0xC9, 0x3B]);
        assert_eq!(guid.to_string(), "C12A7328-F81F-11D2-BA4B-00A0C93EC93B");
    }

    #[test]
    fn test_on_disk_layout_is_mixed_endian() {
        let guid: Guid = "01020304-0506-0708-090A-0B0C0D0E0F10".parse().unwrap();
        assert_eq!(
            guid.to_bytes(),
            [4, 3, 2, 1, 6, 5, 8, 7, 9, 10, 11, 12, 13, 14, 15, 16]
        );
        assert_eq!(Guid::from_bytes(&guid.to_bytes()), guid);
    }

    #[test]
    fn test_rejects_malformed() {
        assert!("not-a-guid".parse::<Guid>().is_err());
        assert!("C12A7328F81F11D2BA4B00A0C93EC93B".parse::<Guid>().is_err());
        assert!("G12A7328-F81F-11D2-BA4B-00A0C93EC93B".parse::<Guid>().is_err());
    }

    #[test]
    fn test_nth_only_changes_data1() {
        let disk = Guid::new(0xFFFF_FFFF, 1, 2, [3; 8]);
        let part = disk.nth(2);
        assert_eq!(part.data1, 1);
        assert_eq!(part.data4, [3; 8]);
    }

    #[test]
    fn test_timestamp_guid_is_deterministic() {
        let a = Guid::from_timestamp(1_700_000_000);
        assert_eq!(a, Guid::from_timestamp(1_700_000_000));
        assert_ne!(a, Guid::from_timestamp(1_700_000_001));
        assert!(!a.is_zero());
    }

    #[test]
    fn test_utf16_name_truncates() {
        assert_eq!(utf16_name("EFI", 36), vec![b'E', 0, b'F', 0, b'I', 0]);
        assert_eq!(utf16_name("abcdef", 2).len(), 4);
    }
}
