//! Image configuration loader.
//!
//! `.json` files use mkbootimg's key set; anything else is read as TOML with
//! the same keys. Relative paths resolve against the config file's
//! directory.

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::artifact::disk::{Guid, PartitionRequest, PartitionSource};
use crate::artifact::initramfs::{InitrdSource, MAX_INITRDS};
use crate::registry;

/// Largest BOOTBOOT environment config; it has to fit one page with a NUL.
pub const MAX_BOOT_CONFIG: usize = 4095;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ImageToml {
    diskguid: Option<String>,
    disksize: Option<u64>,
    align: Option<u64>,
    #[serde(default)]
    iso9660: bool,
    config: Option<PathBuf>,
    initrd: Option<InitrdToml>,
    #[serde(default)]
    partitions: Vec<PartitionToml>,
    loader: Option<LoaderToml>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(PathBuf),
    Many(Vec<PathBuf>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<PathBuf> {
        match self {
            Self::One(path) => vec![path],
            Self::Many(paths) => paths,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct InitrdToml {
    file: Option<OneOrMany>,
    directory: Option<OneOrMany>,
    #[serde(rename = "type")]
    fs_type: Option<String>,
    gzip: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PartitionToml {
    #[serde(rename = "type")]
    part_type: Option<String>,
    size: Option<u64>,
    name: Option<String>,
    file: Option<PathBuf>,
    directory: Option<PathBuf>,
    driver: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct LoaderToml {
    boot_sector: Option<PathBuf>,
    bios: Option<PathBuf>,
    efi: Option<PathBuf>,
    #[serde(default)]
    rpi: Vec<PathBuf>,
    riscv: Option<PathBuf>,
}

/// Loader payload paths, read when the ESP is built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoaderPaths {
    pub boot_sector: Option<PathBuf>,
    pub bios: Option<PathBuf>,
    pub efi: Option<PathBuf>,
    pub rpi: Vec<PathBuf>,
    pub riscv: Option<PathBuf>,
}

/// A validated image configuration.
#[derive(Debug, Clone)]
pub struct ImageConfig {
    pub path: PathBuf,
    pub disk_guid: Guid,
    pub disk_size_mib: u64,
    pub align_kib: u64,
    pub iso9660: bool,
    /// BOOTBOOT environment, empty when not configured.
    pub boot_config: Vec<u8>,
    pub initrds: Vec<InitrdSource>,
    pub initrd_type: Option<String>,
    pub gzip: bool,
    pub esp_size_mib: u64,
    pub esp_fat32: bool,
    pub partitions: Vec<PartitionRequest>,
    pub loaders: LoaderPaths,
}

fn resolve(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// Load and validate the config at `path`.
///
/// `timestamp` seeds the disk GUID when `diskguid` is absent.
pub fn load_config(path: &Path, timestamp: i64) -> Result<ImageConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading image config '{}'", path.display()))?;
    let parsed: ImageToml = if path.extension().is_some_and(|ext| ext == "json") {
        serde_json::from_str(&raw)
            .with_context(|| format!("parsing image config '{}'", path.display()))?
    } else {
        toml::from_str(&raw).with_context(|| format!("parsing image config '{}'", path.display()))?
    };
    let base = path.parent().unwrap_or(Path::new("")).to_path_buf();
    validate(parsed, path, &base, timestamp)
}

fn validate(parsed: ImageToml, path: &Path, base: &Path, timestamp: i64) -> Result<ImageConfig> {
    let invalid = |msg: String| anyhow!("invalid image config '{}': {}", path.display(), msg);

    let disk_guid = match parsed.diskguid.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => raw.parse::<Guid>().map_err(|e| invalid(e.to_string()))?,
        _ => Guid::from_timestamp(timestamp),
    };

    let boot_config = match parsed.config {
        Some(file) => {
            let file = resolve(base, file);
            let data = fs::read(&file)
                .with_context(|| format!("reading BOOTBOOT config '{}'", file.display()))?;
            if data.len() > MAX_BOOT_CONFIG {
                return Err(invalid(format!(
                    "BOOTBOOT config '{}' is too big ({} bytes, at most {})",
                    file.display(),
                    data.len(),
                    MAX_BOOT_CONFIG
                )));
            }
            data
        }
        None => Vec::new(),
    };

    let Some(initrd) = parsed.initrd else {
        return Err(invalid("no initrd configured".to_string()));
    };
    let mut initrds: Vec<InitrdSource> = Vec::new();
    if let Some(files) = initrd.file {
        initrds.extend(files.into_vec().into_iter().map(|f| InitrdSource::File(resolve(base, f))));
    }
    if let Some(dirs) = initrd.directory {
        if initrd.fs_type.is_none() {
            return Err(invalid("initrd directory requires an initrd type".to_string()));
        }
        initrds.extend(
            dirs.into_vec()
                .into_iter()
                .map(|d| InitrdSource::Directory(resolve(base, d))),
        );
    }
    if initrds.is_empty() {
        return Err(invalid("no initrd file or directory configured".to_string()));
    }
    if initrds.len() > MAX_INITRDS {
        return Err(invalid(format!("at most {} initrds allowed", MAX_INITRDS)));
    }
    if let Some(fs_type) = &initrd.fs_type {
        registry::find_initrd(fs_type).map_err(|e| invalid(e.to_string()))?;
    }

    let mut parts = parsed.partitions.into_iter();
    let Some(boot) = parts.next() else {
        return Err(invalid("partition #1 (boot partition) is missing".to_string()));
    };
    let esp_fat32 = match boot.part_type.as_deref() {
        Some("fat16") => false,
        Some("fat32") => true,
        Some(other) => {
            return Err(invalid(format!(
                "unknown boot partition type '{}', accepted values: fat16, fat32",
                other
            )))
        }
        None => return Err(invalid("partition #1 has no type".to_string())),
    };
    let Some(esp_size_mib) = boot.size else {
        return Err(invalid("partition #1 has no size".to_string()));
    };

    let mut partitions = Vec::new();
    for (i, part) in parts.enumerate() {
        let number = i + 2;
        let Some(raw_type) = part.part_type else {
            return Err(invalid(format!("partition #{} has no type", number)));
        };
        let type_guid = registry::resolve_type(&raw_type).map_err(|e| invalid(e.to_string()))?;
        let Some(name) = part.name.filter(|n| !n.trim().is_empty()) else {
            return Err(invalid(format!("partition #{} has no name", number)));
        };
        let source = match (part.file, part.directory) {
            (Some(_), Some(_)) => {
                return Err(invalid(format!(
                    "partition #{} has both a file and a directory",
                    number
                )))
            }
            (Some(file), None) => PartitionSource::File(resolve(base, file)),
            (None, Some(dir)) => {
                let driver = match part.driver {
                    Some(driver) => registry::find(&driver)
                        .map_err(|e| invalid(e.to_string()))?
                        .name,
                    None => match registry::find(&raw_type) {
                        Ok(driver) => driver.name,
                        Err(_) => registry::by_type(&type_guid)
                            .ok_or_else(|| {
                                invalid(format!(
                                    "partition #{}: no filesystem driver for type {}",
                                    number, raw_type
                                ))
                            })?
                            .name,
                    },
                };
                PartitionSource::Directory {
                    path: resolve(base, dir),
                    driver: driver.to_string(),
                }
            }
            (None, None) => PartitionSource::Empty,
        };
        let size_mib = part.size.unwrap_or(0);
        if size_mib == 0 && !matches!(source, PartitionSource::File(_)) {
            return Err(invalid(format!("partition #{} has no size", number)));
        }
        partitions.push(PartitionRequest {
            type_guid,
            name,
            size_mib,
            source,
        });
    }

    let loader = parsed.loader.unwrap_or_default();
    let loaders = LoaderPaths {
        boot_sector: loader.boot_sector.map(|p| resolve(base, p)),
        bios: loader.bios.map(|p| resolve(base, p)),
        efi: loader.efi.map(|p| resolve(base, p)),
        rpi: loader.rpi.into_iter().map(|p| resolve(base, p)).collect(),
        riscv: loader.riscv.map(|p| resolve(base, p)),
    };

    Ok(ImageConfig {
        path: path.to_path_buf(),
        disk_guid,
        disk_size_mib: parsed.disksize.unwrap_or(0),
        align_kib: parsed.align.unwrap_or(0),
        iso9660: parsed.iso9660,
        boot_config,
        initrds,
        initrd_type: initrd.fs_type,
        gzip: initrd.gzip.unwrap_or(true),
        esp_size_mib,
        esp_fat32,
        partitions,
        loaders,
    })
}

/// Read an optional loader payload.
pub fn read_loader(path: Option<&Path>, what: &str) -> Result<Option<Vec<u8>>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let data = fs::read(path).with_context(|| format!("reading {} '{}'", what, path.display()))?;
    if data.is_empty() {
        bail!("{} '{}' is empty", what, path.display());
    }
    Ok(Some(data))
}
