// src/volume/mounts.rs

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Whether `mount_path` appears as a mount point in the mount table at `mounts_file`
pub fn is_mounted(mounts_file: &Path, mount_path: &Path) -> io::Result<bool> {
    let table = fs::read_to_string(mounts_file)?;
    let wanted = normalize(mount_path);
    let found = mount_points(&table).any(|point| normalize(&point) == wanted);
    Ok(found)
}

fn mount_points(table: &str) -> impl Iterator<Item = PathBuf> + '_ {
    table.lines().filter_map(|line| {
        let mut fields = line.split_whitespace();
        let _device = fields.next()?;
        let mount_point = fields.next()?;
        Some(PathBuf::from(unescape_mount_field(mount_point)))
    })
}

fn normalize(path: &Path) -> PathBuf {
    path.components().collect()
}

/// Decodes the octal escapes (`\040` for space) used by the kernel mount table
fn unescape_mount_field(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut output = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits.iter().fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    output.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        output.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&output).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn finds_mount_point_in_table() {
        let mut table = tempfile::NamedTempFile::new().unwrap();
        writeln!(table, "proc /proc proc rw,nosuid 0 0").unwrap();
        writeln!(table, "/dev/mapper/img-1 /mnt/crypto/img-1 ext4 rw,relatime 0 0").unwrap();

        assert!(is_mounted(table.path(), Path::new("/mnt/crypto/img-1")).unwrap());
        assert!(is_mounted(table.path(), Path::new("/mnt/crypto/img-1/")).unwrap());
        assert!(!is_mounted(table.path(), Path::new("/mnt/crypto/img-2")).unwrap());
    }

    #[test]
    fn decodes_escaped_spaces() {
        assert_eq!(unescape_mount_field("/mnt/crypto/vm\\040one"), "/mnt/crypto/vm one");
        assert_eq!(unescape_mount_field("/mnt/plain"), "/mnt/plain");
        assert_eq!(unescape_mount_field("/mnt/trailing\\04"), "/mnt/trailing\\04");
    }
}
