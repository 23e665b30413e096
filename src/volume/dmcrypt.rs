// src/volume/dmcrypt.rs

//! `VolumeManager` backed by cryptsetup (LUKS2 over a sparse backing file),
//! mkfs and mount. Shell integration stays here so the orchestrator can be
//! exercised against fakes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::{PathsConfig, VolumeConfig};
use crate::execution::{CommandOutput, CommandRunner, Invocation};
use crate::volume::{mounts, VolumeError, VolumeManager};

/// dm-crypt volume manager
pub struct DmCryptVolumeManager {
    /// Runner for external tools
    runner: Arc<dyn CommandRunner>,

    /// Tool locations and filesystem type
    tools: VolumeConfig,

    /// Device mapper node directory
    mapper_dir: PathBuf,

    /// Mount table file
    mounts_file: PathBuf,
}

impl DmCryptVolumeManager {
    /// Creates a volume manager from configuration
    pub fn new(runner: Arc<dyn CommandRunner>, tools: &VolumeConfig, paths: &PathsConfig) -> Self {
        Self {
            runner,
            tools: tools.clone(),
            mapper_dir: paths.mapper_dir.clone(),
            mounts_file: paths.mounts_file.clone(),
        }
    }

    fn mapper_exists(&self, mapper_name: &str) -> bool {
        self.mapper_dir.is_dir() && self.mapper_dir.join(mapper_name).exists()
    }

    fn cryptsetup(&self) -> Invocation {
        Invocation::new(&self.tools.cryptsetup_path)
    }

    async fn is_luks(&self, backing_file: &Path) -> Result<bool, VolumeError> {
        if !backing_file.exists() {
            return Ok(false);
        }
        let output = self.runner
            .run(&self.cryptsetup().arg("isLuks").path_arg(backing_file), None)
            .await?;
        Ok(output.success())
    }

    async fn format(&self, backing_file: &Path, key: &[u8]) -> Result<(), VolumeError> {
        let invocation = self.cryptsetup()
            .arg("luksFormat")
            .arg("--batch-mode")
            .arg("--type")
            .arg("luks2")
            .arg("--key-file")
            .arg("-")
            .path_arg(backing_file);
        let output = self.runner.run(&invocation, Some(key)).await?;
        ensure_success("luksFormat", backing_file, output)
    }

    async fn open(&self, backing_file: &Path, mapper_name: &str, key: &[u8]) -> Result<(), VolumeError> {
        let invocation = self.cryptsetup()
            .arg("open")
            .arg("--type")
            .arg("luks")
            .arg("--key-file")
            .arg("-")
            .path_arg(backing_file)
            .arg(mapper_name);
        let output = self.runner.run(&invocation, Some(key)).await?;

        // A racing caller may have opened the same mapping first
        if output.success() || self.mapper_exists(mapper_name) {
            return Ok(());
        }
        ensure_success("cryptsetup open", backing_file, output)
    }

    async fn make_filesystem(&self, mapper_name: &str) -> Result<(), VolumeError> {
        let device = self.mapper_path(mapper_name);
        let invocation = Invocation::new(&self.tools.mkfs_path).arg("-q").path_arg(&device);
        let output = self.runner.run(&invocation, None).await?;
        ensure_success("mkfs", &device, output)
    }

    /// Whether the opened mapping carries a filesystem signature
    async fn has_filesystem(&self, mapper_name: &str) -> Result<bool, VolumeError> {
        let device = self.mapper_path(mapper_name);
        let invocation = Invocation::new(&self.tools.blkid_path)
            .arg("-p")
            .arg("-s")
            .arg("TYPE")
            .arg("-o")
            .arg("value")
            .path_arg(&device);
        let output = self.runner.run(&invocation, None).await?;

        match output.status {
            0 => Ok(!output.stdout_text().trim().is_empty()),
            // blkid exits 2 when no signature was found
            2 => Ok(false),
            _ => ensure_success("blkid", &device, output).map(|_| false),
        }
    }

    /// Creates the filesystem when an earlier attempt never got to it.
    ///
    /// Returns whether mkfs ran.
    async fn ensure_filesystem(&self, mapper_name: &str) -> Result<bool, VolumeError> {
        if self.has_filesystem(mapper_name).await? {
            return Ok(false);
        }
        self.make_filesystem(mapper_name).await?;
        Ok(true)
    }

    async fn close(&self, mapper_name: &str) -> Result<(), VolumeError> {
        let output = self.runner
            .run(&self.cryptsetup().arg("close").arg(mapper_name), None)
            .await?;
        if output.success() {
            return Ok(());
        }

        let diagnostic = output.diagnostic().to_ascii_lowercase();
        if diagnostic.contains("does not exist")
            || diagnostic.contains("doesn't exist")
            || diagnostic.contains("not active")
        {
            warn!(mapper = mapper_name, "cryptsetup reported mapping already gone");
            return Ok(());
        }

        ensure_success("cryptsetup close", Path::new(mapper_name), output)
    }

    fn mounted(&self, mount_path: &Path) -> Result<bool, VolumeError> {
        mounts::is_mounted(&self.mounts_file, mount_path)
            .map_err(|e| VolumeError::io(&self.mounts_file, e))
    }
}

#[async_trait]
impl VolumeManager for DmCryptVolumeManager {
    async fn create_volume(
        &self,
        backing_file: &Path,
        mapper_name: &str,
        key: &[u8],
        size_bytes: u64,
    ) -> Result<(), VolumeError> {
        let already_open = self.mapper_exists(mapper_name);
        if already_open {
            debug!(mapper = mapper_name, "Volume already active");
        } else {
            if !self.is_luks(backing_file).await? {
                create_sparse_file(backing_file, size_bytes).await?;
                self.format(backing_file, key).await?;
            }
            self.open(backing_file, mapper_name, key).await?;
        }

        // A create interrupted after open leaves a mapping without a filesystem
        let made_filesystem = match self.ensure_filesystem(mapper_name).await {
            Ok(made) => made,
            Err(e) => {
                if let Err(close_err) = self.close(mapper_name).await {
                    warn!(mapper = mapper_name, "Failed to close half-created volume: {}", close_err);
                }
                return Err(e);
            }
        };

        if !already_open || made_filesystem {
            info!(
                mapper = mapper_name,
                backing_file = %backing_file.display(),
                new_filesystem = made_filesystem,
                "Encrypted volume opened"
            );
        }

        Ok(())
    }

    async fn mount(&self, mapper_path: &Path, mount_path: &Path) -> Result<(), VolumeError> {
        if self.mounted(mount_path)? {
            debug!(mount = %mount_path.display(), "Volume already mounted");
            return Ok(());
        }

        tokio::fs::create_dir_all(mount_path)
            .await
            .map_err(|e| VolumeError::io(mount_path, e))?;

        let invocation = Invocation::new(&self.tools.mount_path)
            .arg("-t")
            .arg(&self.tools.filesystem)
            .path_arg(mapper_path)
            .path_arg(mount_path);
        let output = self.runner.run(&invocation, None).await?;

        if output.success() || self.mounted(mount_path)? {
            return Ok(());
        }
        ensure_success("mount", mount_path, output)
    }

    async fn unmount(&self, mount_path: &Path) -> Result<(), VolumeError> {
        if !self.mounted(mount_path)? {
            debug!(mount = %mount_path.display(), "Nothing mounted");
            return Ok(());
        }

        let invocation = Invocation::new(&self.tools.umount_path).path_arg(mount_path);
        let output = self.runner.run(&invocation, None).await?;
        ensure_success("umount", mount_path, output)
    }

    async fn delete_volume(&self, mapper_name: &str) -> Result<(), VolumeError> {
        if !self.mapper_exists(mapper_name) {
            debug!(mapper = mapper_name, "Volume already closed");
            return Ok(());
        }

        self.close(mapper_name).await
    }

    async fn is_active(&self, mapper_name: &str) -> Result<bool, VolumeError> {
        Ok(self.mapper_exists(mapper_name))
    }

    fn mapper_path(&self, mapper_name: &str) -> PathBuf {
        self.mapper_dir.join(mapper_name)
    }
}

async fn create_sparse_file(path: &Path, size_bytes: u64) -> Result<(), VolumeError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| VolumeError::io(parent, e))?;
    }

    let file = tokio::fs::File::create(path)
        .await
        .map_err(|e| VolumeError::io(path, e))?;
    file.set_len(size_bytes)
        .await
        .map_err(|e| VolumeError::io(path, e))?;

    debug!(path = %path.display(), size_bytes, "Sparse backing file created");
    Ok(())
}

fn ensure_success(operation: &str, target: &Path, output: CommandOutput) -> Result<(), VolumeError> {
    if output.success() {
        return Ok(());
    }

    let diagnostic = output.diagnostic();
    let lower = diagnostic.to_ascii_lowercase();
    let message = if lower.contains("permission denied") || lower.contains("not permitted") {
        format!("{}. This requires root privileges", diagnostic)
    } else {
        diagnostic
    };

    Err(VolumeError::CommandFailed {
        operation: operation.to_string(),
        target: target.display().to_string(),
        status: output.status,
        message,
    })
}
