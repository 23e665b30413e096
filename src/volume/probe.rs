// src/volume/probe.rs

use std::path::{Path, PathBuf};
use std::sync::Arc;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::execution::{CommandRunner, Invocation};
use crate::volume::VolumeError;

/// Discovers the base image an instance disk is layered on
#[async_trait]
pub trait DiskProbe: Send + Sync {
    /// Backing file of `disk`, or `None` for a standalone disk
    async fn backing_file(&self, disk: &Path) -> Result<Option<PathBuf>, VolumeError>;
}

/// Subset of `qemu-img info --output=json`
#[derive(Debug, Deserialize)]
struct ImageInfo {
    #[serde(rename = "full-backing-filename")]
    full_backing_filename: Option<String>,

    #[serde(rename = "backing-filename")]
    backing_filename: Option<String>,
}

/// `DiskProbe` backed by qemu-img
pub struct QemuImgProbe {
    /// Runner for qemu-img
    runner: Arc<dyn CommandRunner>,

    /// qemu-img binary
    qemu_img: PathBuf,
}

impl QemuImgProbe {
    /// Creates a probe using the given qemu-img binary
    pub fn new(runner: Arc<dyn CommandRunner>, qemu_img: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            qemu_img: qemu_img.into(),
        }
    }
}

#[async_trait]
impl DiskProbe for QemuImgProbe {
    async fn backing_file(&self, disk: &Path) -> Result<Option<PathBuf>, VolumeError> {
        // -U: the running hypervisor may hold a write lock on the disk
        let invocation = Invocation::new(&self.qemu_img)
            .arg("info")
            .arg("--output=json")
            .arg("-U")
            .path_arg(disk);
        let output = self.runner.run(&invocation, None).await?;
        if !output.success() {
            return Err(VolumeError::Probe(format!(
                "qemu-img info {} failed: {}",
                disk.display(),
                output.diagnostic()
            )));
        }

        let backing = parse_backing_file(&output.stdout, disk)?;
        debug!(disk = %disk.display(), backing = ?backing, "Probed disk backing file");
        Ok(backing)
    }
}

fn parse_backing_file(json: &[u8], disk: &Path) -> Result<Option<PathBuf>, VolumeError> {
    let info: ImageInfo = serde_json::from_slice(json)
        .map_err(|e| VolumeError::Probe(format!("Unreadable qemu-img output for {}: {}", disk.display(), e)))?;

    let Some(name) = info.full_backing_filename.or(info.backing_filename) else {
        return Ok(None);
    };
    if name.is_empty() {
        return Ok(None);
    }

    let backing = PathBuf::from(name);
    if backing.is_absolute() {
        return Ok(Some(backing));
    }

    // Relative backing names resolve against the overlay's directory
    Ok(Some(match disk.parent() {
        Some(parent) => parent.join(backing),
        None => backing,
    }))
}
