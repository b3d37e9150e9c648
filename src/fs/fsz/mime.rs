//! File type detection for FS/Z inodes.
//!
//! FS/Z stores a 4-byte main type and a sub type in every inode. Content
//! magic is checked first, then the first matching suffix rule wins, and
//! files with neither fall back to a printable-text scan.

/// Main type plus sub type stored in an inode, and whether the file gets
/// the execute bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MimeType {
    pub filetype: &'static [u8; 4],
    pub subtype: &'static str,
    pub executable: bool,
}

struct Rule {
    suffixes: &'static [&'static str],
    /// `None` keeps the type detected from content.
    filetype: Option<&'static [u8; 4]>,
    subtype: &'static str,
    executable: bool,
}

const fn rule(
    suffixes: &'static [&'static str],
    filetype: &'static [u8; 4],
    subtype: &'static str,
) -> Rule {
    Rule {
        suffixes,
        filetype: Some(filetype),
        subtype,
        executable: false,
    }
}

/// Suffix rules in priority order.
const RULES: &[Rule] = &[
    Rule {
        suffixes: &[".so"],
        filetype: None,
        subtype: "sharedlib",
        executable: false,
    },
    rule(&[".h", ".c", ".md", ".txt", ".conf"], b"text", "plain"),
    Rule {
        suffixes: &[".sh"],
        filetype: Some(b"text"),
        subtype: "shellscript",
        executable: true,
    },
    rule(&[".htm", ".html"], b"text", "html"),
    rule(&[".css"], b"text", "stylesheet"),
    rule(&[".svg"], b"imag", "svg"),
    rule(&[".gif"], b"imag", "gif"),
    rule(&[".png"], b"imag", "png"),
    rule(&[".jpg"], b"imag", "jpeg"),
    rule(&[".bmp"], b"imag", "bitmap"),
    rule(&[".sfn"], b"font", "ssfont"),
    rule(&[".psf"], b"font", "pc-screen-font"),
    rule(&[".ttf"], b"font", "sfnt"),
];

/// x86 boot sector: 55 AA signature up front, a near jump and the "BOOTBOOT"
/// style markers.
fn is_boot_sector(data: &[u8]) -> bool {
    data.len() > 12
        && data[0] == 0x55
        && data[1] == 0xAA
        && data[3] == 0xE9
        && data[8] == b'B'
        && data[12] == b'B'
}

fn is_executable(data: &[u8]) -> bool {
    data.get(1..4) == Some(&b"ELF"[..])
        || data.starts_with(b"OS/Z")
        || data.starts_with(b"CSBC")
        || data.starts_with(b"\0asm")
}

/// Classify a regular file by name and content.
pub fn classify(name: &str, data: &[u8]) -> MimeType {
    let executable = is_executable(data);
    let mut mime = MimeType {
        filetype: if is_boot_sector(data) { b"boot" } else { b"appl" },
        subtype: if executable { "executable" } else { "octet-stream" },
        executable,
    };

    if let Some(rule) = RULES
        .iter()
        .find(|r| r.suffixes.iter().any(|s| name.ends_with(s)))
    {
        if let Some(filetype) = rule.filetype {
            mime.filetype = filetype;
        }
        mime.subtype = rule.subtype;
        mime.executable |= rule.executable;
    } else if name.ends_with(".m3d") {
        mime.filetype = if data.get(1) == Some(&b'd') { b"text" } else { b"mode" };
        mime.subtype = "3d-model";
    } else if data.iter().all(|&b| b >= 9) {
        mime.filetype = b"text";
        mime.subtype = "plain";
    }
    mime
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suffix_rules() {
        let mime = classify("etc/motd.txt", b"\x01binary");
        assert_eq!((mime.filetype, mime.subtype), (b"text", "plain"));
        let mime = classify("bin/init.sh", b"#!/bin/sh");
        assert_eq!(mime.subtype, "shellscript");
        assert!(mime.executable);
        let mime = classify("logo.png", b"\x89PNG");
        assert_eq!((mime.filetype, mime.subtype), (b"imag", "png"));
        let mime = classify("font.psf", &[0x72, 0xb5, 0x4a, 0x86]);
        assert_eq!((mime.filetype, mime.subtype), (b"font", "pc-screen-font"));
    }

    #[test]
    fn test_magic_detection() {
        let mime = classify("sys/core", b"\x7fELF\x02\x01\x01\0");
        assert_eq!((mime.filetype, mime.subtype), (b"appl", "executable"));
        assert!(mime.executable);

        let mime = classify("lib/libc.so", b"\x7fELF\x02\x01\x01\0");
        assert_eq!((mime.filetype, mime.subtype), (b"appl", "sharedlib"));
        assert!(mime.executable);

        let mut boot = vec![0u8; 16];
        boot[0] = 0x55;
        boot[1] = 0xAA;
        boot[3] = 0xE9;
        boot[8] = b'B';
        boot[12] = b'B';
        assert_eq!(classify("loader", &boot).filetype, b"boot");
    }

    #[test]
    fn test_text_fallback() {
        assert_eq!(classify("README", b"hello\n").filetype, b"text");
        assert_eq!(classify("blob", b"\0\0").subtype, "octet-stream");
        assert_eq!(classify("model.m3d", b"3dmodel").filetype, b"text");
        assert_eq!(classify("model.m3d", b"3DMO").filetype, b"mode");
    }
}
