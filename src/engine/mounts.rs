//! Mounted filesystem table.
//!
//! Read fresh from `/proc/mounts` on every backup invocation so that
//! filesystem-type filtering reflects what is mounted right now.
//! Mountpoints are kept as raw bytes; they need not be UTF-8.

use std::ffi::OsString;
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};

/// Location of the kernel's mount table.
pub const PROC_MOUNTS: &str = "/proc/mounts";

/// One entry of the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountedFilesystem {
    /// Filesystem type, e.g. `ext4` or `tmpfs`.
    pub fstype: String,
    /// Mountpoint with octal escapes resolved.
    pub mountpoint: PathBuf,
}

impl MountedFilesystem {
    /// Build an entry from raw parts.
    pub fn new(fstype: impl Into<String>, mountpoint: impl Into<PathBuf>) -> Self {
        Self {
            fstype: fstype.into(),
            mountpoint: mountpoint.into(),
        }
    }
}

/// Read and parse the mount table at `path`.
pub fn read_mount_table(path: &Path) -> std::io::Result<Vec<MountedFilesystem>> {
    let content = std::fs::read(path)?;
    Ok(parse_mount_table(&content))
}

/// Parse `/proc/mounts` formatted bytes. Malformed lines are skipped.
pub fn parse_mount_table(content: &[u8]) -> Vec<MountedFilesystem> {
    content
        .split(|&b| b == b'\n')
        .filter_map(|line| {
            let mut fields = line.split(|&b| b == b' ');
            let _device = fields.next()?;
            let mountpoint = fields.next()?;
            let fstype = fields.next()?;
            if mountpoint.is_empty() || fstype.is_empty() {
                return None;
            }
            let mountpoint = PathBuf::from(OsString::from_vec(unescape_octal(mountpoint)));
            Some(MountedFilesystem::new(
                String::from_utf8_lossy(fstype),
                mountpoint,
            ))
        })
        .collect()
}

/// Resolve `\NNN` octal escapes as written by the kernel for spaces, tabs,
/// newlines and backslashes in mount paths.
pub fn unescape_octal(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'\\' && i + 3 < raw.len() && is_octal_triplet(&raw[i + 1..i + 4]) {
            let value = (raw[i + 1] - b'0') as u32 * 64
                + (raw[i + 2] - b'0') as u32 * 8
                + (raw[i + 3] - b'0') as u32;
            // Three octal digits can exceed a byte (\777); keep those verbatim.
            if let Ok(byte) = u8::try_from(value) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(raw[i]);
        i += 1;
    }
    out
}

fn is_octal_triplet(digits: &[u8]) -> bool {
    digits.len() == 3 && digits.iter().all(|d| (b'0'..=b'7').contains(d))
}
