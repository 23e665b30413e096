// src/association/mod.rs

//! Reference count of VM instances per decrypted base image.
//!
//! The whole store is one JSON document rewritten atomically on every change.
//! Load, mutation and save happen under a single lock so concurrent lifecycle
//! calls never lose an update.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// One image and the number of instances currently using it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageVmAssociation {
    /// Image UUID
    pub image_id: String,

    /// Path of the image on the host
    pub image_path: PathBuf,

    /// Number of instances attached; never zero in a stored record
    pub vm_count: u32,
}

/// On-disk document
#[derive(Debug, Default, Serialize, Deserialize)]
struct AssociationDocument {
    #[serde(default)]
    images: Vec<ImageVmAssociation>,
}

impl AssociationDocument {
    fn find_mut(&mut self, image_id: &str) -> Option<&mut ImageVmAssociation> {
        self.images.iter_mut().find(|entry| entry.image_id == image_id)
    }
}

/// Outcome of removing one instance from an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detached {
    /// Whether the count reached zero and the entry was removed
    pub is_last: bool,

    /// Recorded image path
    pub image_path: PathBuf,
}

/// Persistent image to VM association store
pub struct ImageVmAssociations {
    /// Backing JSON file
    path: PathBuf,

    /// Serializes load-mutate-save
    lock: Mutex<()>,
}

impl ImageVmAssociations {
    /// Opens the store at `path`; the file is created on first write
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Adds one instance to `image_id`, creating the entry when absent.
    ///
    /// Returns the new count.
    pub async fn create(&self, image_id: &str, image_path: &Path) -> Result<u32, AssociationError> {
        let _guard = self.lock.lock().await;
        let mut document = self.load().await?;

        let count = match document.find_mut(image_id) {
            Some(entry) => {
                entry.vm_count = entry.vm_count.saturating_add(1);
                entry.image_path = image_path.to_path_buf();
                entry.vm_count
            }
            None => {
                document.images.push(ImageVmAssociation {
                    image_id: image_id.to_string(),
                    image_path: image_path.to_path_buf(),
                    vm_count: 1,
                });
                1
            }
        };

        self.save(document).await?;
        debug!(image = image_id, count, "Association incremented");
        Ok(count)
    }

    /// Removes one instance from `image_id`.
    ///
    /// The entry is dropped in the same write when its count reaches zero.
    pub async fn delete(&self, image_id: &str) -> Result<Detached, AssociationError> {
        let _guard = self.lock.lock().await;
        let mut document = self.load().await?;

        let position = document
            .images
            .iter()
            .position(|entry| entry.image_id == image_id)
            .ok_or_else(|| AssociationError::NotFound(image_id.to_string()))?;

        let entry = &mut document.images[position];
        entry.vm_count = entry.vm_count.saturating_sub(1);
        let image_path = entry.image_path.clone();
        let is_last = entry.vm_count == 0;
        if is_last {
            document.images.remove(position);
        }

        self.save(document).await?;

        if is_last {
            info!(image = image_id, "Last instance detached from image");
        } else {
            debug!(image = image_id, "Association decremented");
        }

        Ok(Detached { is_last, image_path })
    }

    /// Recorded path of `image_id`
    pub async fn image_path(&self, image_id: &str) -> Result<Option<PathBuf>, AssociationError> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?
            .images
            .into_iter()
            .find(|entry| entry.image_id == image_id)
            .map(|entry| entry.image_path))
    }

    /// Current count of `image_id` (0 when absent)
    pub async fn count(&self, image_id: &str) -> Result<u32, AssociationError> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?
            .images
            .iter()
            .find(|entry| entry.image_id == image_id)
            .map_or(0, |entry| entry.vm_count))
    }

    /// Snapshot of all entries
    pub async fn entries(&self) -> Result<Vec<ImageVmAssociation>, AssociationError> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.images)
    }

    async fn load(&self) -> Result<AssociationDocument, AssociationError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || load_document(&path))
            .await
            .map_err(|e| AssociationError::Io {
                path: self.path.display().to_string(),
                error: e.to_string(),
            })?
    }

    async fn save(&self, document: AssociationDocument) -> Result<(), AssociationError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || save_document(&path, &document))
            .await
            .map_err(|e| AssociationError::Io {
                path: self.path.display().to_string(),
                error: e.to_string(),
            })?
    }
}

fn load_document(path: &Path) -> Result<AssociationDocument, AssociationError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(AssociationDocument::default()),
        Err(e) => return Err(AssociationError::io(path, e)),
    };

    if contents.trim().is_empty() {
        return Ok(AssociationDocument::default());
    }

    let document: AssociationDocument = serde_json::from_str(&contents)
        .map_err(|e| AssociationError::Corrupt {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;

    if let Some(entry) = document.images.iter().find(|entry| entry.vm_count == 0) {
        return Err(AssociationError::Corrupt {
            path: path.display().to_string(),
            error: format!("entry {} has a zero count", entry.image_id),
        });
    }

    Ok(document)
}

fn save_document(path: &Path, document: &AssociationDocument) -> Result<(), AssociationError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).map_err(|e| AssociationError::io(&parent, e))?;

    let bytes = serde_json::to_vec_pretty(document)
        .map_err(|e| AssociationError::Serialization(e.to_string()))?;

    let mut temp = tempfile::NamedTempFile::new_in(&parent)
        .map_err(|e| AssociationError::io(&parent, e))?;
    temp.write_all(&bytes).map_err(|e| AssociationError::io(temp.path(), e))?;
    temp.as_file().sync_all().map_err(|e| AssociationError::io(temp.path(), e))?;
    temp.persist(path)
        .map_err(|e| AssociationError::io(path, e.error))?;

    // Make the rename itself durable
    match fs::File::open(&parent).and_then(|dir| dir.sync_all()) {
        Ok(()) => {}
        Err(e) => warn!(dir = %parent.display(), "Failed to sync association directory: {}", e),
    }

    Ok(())
}

/// Association store errors
#[derive(Error, Debug)]
pub enum AssociationError {
    #[error("No association recorded for image {0}")]
    NotFound(String),

    #[error("I/O error on {path}: {error}")]
    Io {
        path: String,
        error: String,
    },

    #[error("Association file {path} is corrupt: {error}")]
    Corrupt {
        path: String,
        error: String,
    },

    #[error("Failed to serialize associations: {0}")]
    Serialization(String),
}

impl AssociationError {
    fn io(path: &Path, error: std::io::Error) -> Self {
        AssociationError::Io {
            path: path.display().to_string(),
            error: error.to_string(),
        }
    }
}
