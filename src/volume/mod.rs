// src/volume/mod.rs

//! dm-crypt volumes backing decrypted images and adopted instance disks.

pub mod crypt;
pub mod dmcrypt;
pub mod mounts;
pub mod probe;

use std::path::{Path, PathBuf};
use async_trait::async_trait;
use nix::unistd::{chown, fchownat, FchownatFlags, Gid, Uid};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::execution::CommandError;

pub use crypt::CryptError;
pub use dmcrypt::DmCryptVolumeManager;
pub use probe::{DiskProbe, QemuImgProbe};

/// Space reserved for the LUKS2 header and filesystem metadata
const VOLUME_OVERHEAD_BYTES: u64 = 32 * 1024 * 1024;

/// Volumes are sized in whole mebibytes
const VOLUME_ALIGNMENT_BYTES: u64 = 1024 * 1024;

/// Creates, mounts and tears down encrypted volumes
#[async_trait]
pub trait VolumeManager: Send + Sync {
    /// Creates and opens a volume over `backing_file`.
    ///
    /// Succeeds without side effects when `mapper_name` is already active.
    /// An existing formatted backing file is reopened rather than reformatted.
    async fn create_volume(
        &self,
        backing_file: &Path,
        mapper_name: &str,
        key: &[u8],
        size_bytes: u64,
    ) -> Result<(), VolumeError>;

    /// Mounts an opened volume; an existing mount at `mount_path` is success
    async fn mount(&self, mapper_path: &Path, mount_path: &Path) -> Result<(), VolumeError>;

    /// Unmounts `mount_path`; not being mounted is success
    async fn unmount(&self, mount_path: &Path) -> Result<(), VolumeError>;

    /// Closes the mapping; an inactive mapping is success
    async fn delete_volume(&self, mapper_name: &str) -> Result<(), VolumeError>;

    /// Whether a device-mapper entry named `mapper_name` exists
    async fn is_active(&self, mapper_name: &str) -> Result<bool, VolumeError>;

    /// Device node for `mapper_name`
    fn mapper_path(&self, mapper_name: &str) -> PathBuf;

    /// Decrypts an encrypted image payload in memory
    fn decrypt(&self, ciphertext: &[u8], key: &[u8]) -> Result<Zeroizing<Vec<u8>>, VolumeError> {
        Ok(crypt::decrypt_image(ciphertext, key)?)
    }
}

/// Owner applied to everything the hypervisor must read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ownership {
    /// User id
    pub uid: u32,

    /// Group id
    pub gid: u32,
}

impl Ownership {
    /// Identity of the running process
    pub fn current() -> Self {
        Self {
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        }
    }

    /// Changes ownership of `path`, following symlinks
    pub fn apply(&self, path: &Path) -> Result<(), VolumeError> {
        chown(path, Some(Uid::from_raw(self.uid)), Some(Gid::from_raw(self.gid)))
            .map_err(|e| VolumeError::Ownership {
                path: path.display().to_string(),
                error: e.to_string(),
            })
    }

    /// Changes ownership of the symlink itself
    pub fn apply_to_link(&self, link: &Path) -> Result<(), VolumeError> {
        fchownat(
            None,
            link,
            Some(Uid::from_raw(self.uid)),
            Some(Gid::from_raw(self.gid)),
            FchownatFlags::NoFollowSymlink,
        )
        .map_err(|e| VolumeError::Ownership {
            path: link.display().to_string(),
            error: e.to_string(),
        })
    }
}

/// Size of a volume able to hold `payload_bytes` of data
pub fn volume_size_for(payload_bytes: u64) -> u64 {
    let raw = payload_bytes + payload_bytes / 10 + VOLUME_OVERHEAD_BYTES;
    (raw + VOLUME_ALIGNMENT_BYTES - 1) / VOLUME_ALIGNMENT_BYTES * VOLUME_ALIGNMENT_BYTES
}

/// Errors raised by volume operations
#[derive(Error, Debug)]
pub enum VolumeError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("{operation} failed for {target} (exit code {status}): {message}")]
    CommandFailed {
        operation: String,
        target: String,
        status: i32,
        message: String,
    },

    #[error("I/O error on {path}: {error}")]
    Io {
        path: String,
        error: String,
    },

    #[error("Failed to set ownership of {path}: {error}")]
    Ownership {
        path: String,
        error: String,
    },

    #[error("Image decryption failed: {0}")]
    Decryption(#[from] CryptError),

    #[error("Disk probe failed: {0}")]
    Probe(String),
}

impl VolumeError {
    /// Wraps an I/O error with the path it happened on
    pub fn io(path: &Path, error: std::io::Error) -> Self {
        VolumeError::Io {
            path: path.display().to_string(),
            error: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_size_is_aligned_and_padded() {
        let size = volume_size_for(100 * 1024 * 1024);
        assert_eq!(size % VOLUME_ALIGNMENT_BYTES, 0);
        assert!(size >= 110 * 1024 * 1024 + VOLUME_OVERHEAD_BYTES);

        assert_eq!(volume_size_for(0), VOLUME_OVERHEAD_BYTES);
        assert_eq!(volume_size_for(1) % VOLUME_ALIGNMENT_BYTES, 0);
    }

    #[test]
    fn current_owner_can_be_reapplied() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("disk");
        std::fs::write(&file, b"data").unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&file, &link).unwrap();

        let owner = Ownership::current();
        owner.apply(&file).unwrap();
        owner.apply_to_link(&link).unwrap();
    }
}
