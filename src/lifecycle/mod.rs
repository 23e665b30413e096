// src/lifecycle/mod.rs

//! Prepare/Start/Stop handling for VMs whose disks are kept encrypted.
//!
//! Layout on the host for an encrypted image `<image>` and instance disk
//! `<disk>`:
//!
//! - `<image>_sparseFile`: LUKS backing file of the image volume. It stays
//!   behind after teardown and is what marks the image as encrypted on Stop.
//! - `<image>.enc`: the original ciphertext while the image is decrypted.
//! - `<image>`: symlink to `<mount_root>/<image uuid>/<image file name>`.
//! - `<disk>_sparseFile`: LUKS backing file of the instance volume.
//! - `<disk>`: symlink to `<mount_root>/<instance uuid>/<disk file name>`.
//!
//! Lock order is image volume lock, then instance volume lock.

pub mod error;
pub mod locks;
pub mod report;

#[cfg(test)]
mod tests;

use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::association::{AssociationError, ImageVmAssociations};
use crate::network::KeyService;
use crate::security::{KeyCache, KeyUnwrapper};
use crate::vm::VmDescriptor;
use crate::volume::{crypt, volume_size_for, DiskProbe, Ownership, VolumeManager};
use crate::watcher::FileWatcher;

pub use error::LifecycleError;
use locks::KeyedMutex;
use report::{sha256_hex, VmTrustReport};

/// Suffix of LUKS backing files
const SPARSE_SUFFIX: &str = "_sparseFile";

/// Suffix of preserved image ciphertext
const CIPHERTEXT_SUFFIX: &str = ".enc";

/// File nova deletes together with the instance
const INSTANCE_MARKER: &str = "disk.info";

/// Hypervisor hook operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleMethod {
    /// Domain is about to be started; disks must be usable afterwards
    Prepare,

    /// Legacy start hook, handled like `Prepare`
    Start,

    /// Domain has stopped
    Stop,
}

impl LifecycleMethod {
    /// Lower-case name used on the wire and in metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleMethod::Prepare => "prepare",
            LifecycleMethod::Start => "start",
            LifecycleMethod::Stop => "stop",
        }
    }
}

impl fmt::Display for LifecycleMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleMethod {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "prepare" => Ok(LifecycleMethod::Prepare),
            "start" => Ok(LifecycleMethod::Start),
            "stop" => Ok(LifecycleMethod::Stop),
            other => Err(LifecycleError::Input(format!("Unknown lifecycle method: {}", other))),
        }
    }
}

/// Result of a successful lifecycle call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing to do; the image is not encrypted
    Passthrough,

    /// Encrypted image and instance volumes are in place
    Attached {
        /// Instances now using the image
        image_count: u32,

        /// Whether this call decrypted the image
        decrypted: bool,
    },

    /// Instance volume torn down
    Detached {
        /// Whether the image volume was torn down too
        last: bool,
    },
}

/// Host specific settings
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Directory volumes are mounted under
    pub mount_root: PathBuf,

    /// Hardware UUID sent with key requests
    pub hardware_uuid: String,

    /// Owner of decrypted files
    pub owner: Ownership,
}

/// Collaborators the orchestrator drives
pub struct Collaborators {
    /// Volume operations
    pub volumes: Arc<dyn VolumeManager>,

    /// Key and report service
    pub key_service: Arc<dyn KeyService>,

    /// TPM key unwrap
    pub unwrapper: Arc<KeyUnwrapper>,

    /// Image to VM reference counts
    pub associations: Arc<ImageVmAssociations>,

    /// Unwrapped keys
    pub keys: Arc<KeyCache>,

    /// Backing file discovery
    pub probe: Arc<dyn DiskProbe>,

    /// Instance removal watches
    pub watcher: Option<Arc<dyn FileWatcher>>,
}

/// Key released for an image
struct ImageKey {
    key: Zeroizing<Vec<u8>>,
    flavor_id: Option<String>,
}

/// Lifecycle orchestrator
pub struct Orchestrator {
    settings: OrchestratorSettings,
    volumes: Arc<dyn VolumeManager>,
    key_service: Arc<dyn KeyService>,
    unwrapper: Arc<KeyUnwrapper>,
    associations: Arc<ImageVmAssociations>,
    keys: Arc<KeyCache>,
    probe: Arc<dyn DiskProbe>,
    watcher: Option<Arc<dyn FileWatcher>>,

    /// Serializes image volume setup and teardown per image
    image_locks: KeyedMutex,

    /// Serializes instance volume setup and teardown
    instance_lock: Mutex<()>,
}

impl Orchestrator {
    /// Creates an orchestrator
    pub fn new(settings: OrchestratorSettings, collaborators: Collaborators) -> Self {
        Self {
            settings,
            volumes: collaborators.volumes,
            key_service: collaborators.key_service,
            unwrapper: collaborators.unwrapper,
            associations: collaborators.associations,
            keys: collaborators.keys,
            probe: collaborators.probe,
            watcher: collaborators.watcher,
            image_locks: KeyedMutex::new(),
            instance_lock: Mutex::new(()),
        }
    }

    /// Host settings
    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Handles the hypervisor prepare hook
    pub async fn prepare(&self, descriptor: &VmDescriptor) -> bool {
        self.run(LifecycleMethod::Prepare, descriptor).await.is_ok()
    }

    /// Handles the legacy start hook; same as prepare
    pub async fn start(&self, descriptor: &VmDescriptor) -> bool {
        self.run(LifecycleMethod::Start, descriptor).await.is_ok()
    }

    /// Handles the hypervisor stop hook
    pub async fn stop(&self, descriptor: &VmDescriptor) -> bool {
        self.run(LifecycleMethod::Stop, descriptor).await.is_ok()
    }

    /// Runs `method`, logging and counting the outcome
    pub async fn run(&self, method: LifecycleMethod, descriptor: &VmDescriptor) -> Result<Outcome, LifecycleError> {
        let result = match method {
            LifecycleMethod::Prepare => self.prepare_checked(descriptor).await,
            LifecycleMethod::Start => self.start_checked(descriptor).await,
            LifecycleMethod::Stop => self.stop_checked(descriptor).await,
        };
        record(method, descriptor, &result);
        result
    }

    /// Prepare with the failure reason
    pub async fn prepare_checked(&self, descriptor: &VmDescriptor) -> Result<Outcome, LifecycleError> {
        self.attach(descriptor).await
    }

    /// Start with the failure reason
    pub async fn start_checked(&self, descriptor: &VmDescriptor) -> Result<Outcome, LifecycleError> {
        self.attach(descriptor).await
    }

    /// Stop with the failure reason
    pub async fn stop_checked(&self, descriptor: &VmDescriptor) -> Result<Outcome, LifecycleError> {
        self.detach_instance(descriptor).await;

        let image_path = match &descriptor.image_path {
            Some(path) => path.clone(),
            None => match self.associations.image_path(&descriptor.image_uuid).await? {
                Some(path) => path,
                None => {
                    debug!(image = %descriptor.image_uuid, "No image recorded; nothing to detach");
                    return Ok(Outcome::Passthrough);
                }
            },
        };

        if !sparse_marker(&image_path).exists() {
            debug!(image = %descriptor.image_uuid, "Image was never decrypted on this host");
            return Ok(Outcome::Passthrough);
        }

        let _image_guard = self.image_locks.lock(&descriptor.image_uuid).await;

        let detached = match self.associations.delete(&descriptor.image_uuid).await {
            Ok(detached) => detached,
            Err(AssociationError::NotFound(_)) => {
                warn!(
                    instance = %descriptor.instance_uuid,
                    image = %descriptor.image_uuid,
                    "Image has no association entry; leaving image volume as is"
                );
                return Ok(Outcome::Detached { last: false });
            }
            Err(e) => {
                error!(
                    instance = %descriptor.instance_uuid,
                    image = %descriptor.image_uuid,
                    "Association update failed; image volume left in place: {}", e
                );
                return Err(e.into());
            }
        };

        if detached.is_last {
            self.teardown_image(&descriptor.image_uuid, &detached.image_path).await;
        }

        Ok(Outcome::Detached { last: detached.is_last })
    }

    async fn attach(&self, descriptor: &VmDescriptor) -> Result<Outcome, LifecycleError> {
        let image_path = self.resolve_image_path(descriptor).await?;

        if !self.is_encrypted(&image_path)? {
            debug!(image = %image_path.display(), "Image is not encrypted");
            return Ok(Outcome::Passthrough);
        }

        let decrypted = self.decrypted_image_path(&descriptor.image_uuid, &image_path)?;

        let image_key = if has_content(&decrypted) {
            match self.keys.get(&descriptor.image_uuid) {
                Some(key) => ImageKey { key, flavor_id: None },
                None => match self.release_key(descriptor).await? {
                    Some(key) => key,
                    None => return Ok(Outcome::Passthrough),
                },
            }
        } else {
            match self.release_key(descriptor).await? {
                Some(key) => key,
                None => return Ok(Outcome::Passthrough),
            }
        };

        let image_guard = self.image_locks.lock(&descriptor.image_uuid).await;

        let digest = self
            .attach_image(descriptor, &image_path, &decrypted, &image_key.key)
            .await?;
        self.attach_instance(descriptor, &image_key.key).await?;
        let image_count = self.associations.create(&descriptor.image_uuid, &image_path).await?;

        drop(image_guard);

        self.watch_instance(descriptor);
        if digest.is_some() {
            self.post_report(descriptor, image_key.flavor_id, digest.clone());
        }

        Ok(Outcome::Attached {
            image_count,
            decrypted: digest.is_some(),
        })
    }

    async fn resolve_image_path(&self, descriptor: &VmDescriptor) -> Result<PathBuf, LifecycleError> {
        if let Some(path) = &descriptor.image_path {
            return Ok(path.clone());
        }

        // A VM restarting from shutoff carries no image path
        if let Some(path) = self.associations.image_path(&descriptor.image_uuid).await? {
            debug!(image = %descriptor.image_uuid, path = %path.display(), "Image path taken from associations");
            return Ok(path);
        }

        if let Some(path) = self.probe.backing_file(&descriptor.instance_path).await? {
            debug!(image = %descriptor.image_uuid, path = %path.display(), "Image path taken from disk backing file");
            return Ok(path);
        }

        Err(LifecycleError::Input(format!(
            "Cannot determine image path for image {}",
            descriptor.image_uuid
        )))
    }

    fn is_encrypted(&self, image_path: &Path) -> Result<bool, LifecycleError> {
        if ciphertext_sidecar(image_path).exists() {
            return Ok(true);
        }

        match crypt::has_encryption_header(image_path) {
            Ok(encrypted) => Ok(encrypted),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(LifecycleError::Input(format!(
                "Image {} does not exist",
                image_path.display()
            ))),
            Err(e) => Err(LifecycleError::io("Failed to read image", image_path, e)),
        }
    }

    fn decrypted_image_path(&self, image_uuid: &str, image_path: &Path) -> Result<PathBuf, LifecycleError> {
        let file_name = image_path
            .file_name()
            .ok_or_else(|| LifecycleError::Input(format!("Image path {} has no file name", image_path.display())))?;
        Ok(self.settings.mount_root.join(image_uuid).join(file_name))
    }

    /// Fetches and unwraps the image key; `None` when the flavor does not
    /// require encryption
    async fn release_key(&self, descriptor: &VmDescriptor) -> Result<Option<ImageKey>, LifecycleError> {
        let flavor = self
            .key_service
            .get_image_flavor_key(&descriptor.image_uuid, &self.settings.hardware_uuid)
            .await?
            .ok_or_else(|| {
                LifecycleError::Entitlement(format!("No flavor for image {} on this host", descriptor.image_uuid))
            })?;

        if !flavor.encryption_required {
            info!(image = %descriptor.image_uuid, flavor = %flavor.flavor_id, "Flavor does not require decryption");
            return Ok(None);
        }

        if flavor.wrapped_key.is_empty() {
            return Err(LifecycleError::Entitlement(format!(
                "Flavor {} requires encryption but no key was released",
                flavor.flavor_id
            )));
        }

        let key = self.unwrapper.unwrap(&flavor.wrapped_key).await?;
        self.keys.store(&descriptor.image_uuid, &key);

        Ok(Some(ImageKey {
            key,
            flavor_id: Some(flavor.flavor_id),
        }))
    }

    /// Makes the decrypted image available; returns its digest when this call
    /// decrypted it
    async fn attach_image(
        &self,
        descriptor: &VmDescriptor,
        image_path: &Path,
        decrypted: &Path,
        key: &[u8],
    ) -> Result<Option<String>, LifecycleError> {
        let sidecar = ciphertext_sidecar(image_path);

        if has_content(decrypted) {
            debug!(image = %descriptor.image_uuid, "Decrypted image already present");
            self.link_decrypted_image(image_path, &sidecar, decrypted)?;
            return Ok(None);
        }

        let ciphertext_path = if is_regular_file(image_path) { image_path } else { sidecar.as_path() };
        let ciphertext = tokio::fs::read(ciphertext_path)
            .await
            .map_err(|e| LifecycleError::io("Failed to read encrypted image", ciphertext_path, e))?;
        let plaintext = self.volumes.decrypt(&ciphertext, key)?;
        drop(ciphertext);

        let mount_dir = self.settings.mount_root.join(&descriptor.image_uuid);
        self.volumes
            .create_volume(&sparse_marker(image_path), &descriptor.image_uuid, key, volume_size_for(plaintext.len() as u64))
            .await?;
        tokio::fs::create_dir_all(&mount_dir)
            .await
            .map_err(|e| LifecycleError::io("Failed to create mount point", &mount_dir, e))?;
        self.volumes
            .mount(&self.volumes.mapper_path(&descriptor.image_uuid), &mount_dir)
            .await?;

        // Volume was reopened with the plaintext from an earlier run
        if has_content(decrypted) {
            self.settings.owner.apply(decrypted)?;
            self.link_decrypted_image(image_path, &sidecar, decrypted)?;
            return Ok(None);
        }

        let partial = append_suffix(decrypted, ".partial");
        tokio::fs::write(&partial, plaintext.as_slice())
            .await
            .map_err(|e| LifecycleError::io("Failed to write decrypted image", &partial, e))?;
        tokio::fs::rename(&partial, decrypted)
            .await
            .map_err(|e| LifecycleError::io("Failed to move decrypted image", decrypted, e))?;

        self.settings.owner.apply(&mount_dir)?;
        self.settings.owner.apply(decrypted)?;
        self.link_decrypted_image(image_path, &sidecar, decrypted)?;

        metrics::increment_counter!("wlagent_image_decryptions_total");
        info!(
            image = %descriptor.image_uuid,
            decrypted = %decrypted.display(),
            bytes = plaintext.len() as u64,
            "Image decrypted"
        );

        Ok(Some(sha256_hex(&plaintext)))
    }

    /// Points `image_path` at the decrypted image, moving ciphertext aside
    fn link_decrypted_image(&self, image_path: &Path, sidecar: &Path, decrypted: &Path) -> Result<(), LifecycleError> {
        match std::fs::symlink_metadata(image_path) {
            Ok(meta) if meta.file_type().is_symlink() => {
                if std::fs::read_link(image_path).ok().as_deref() == Some(decrypted) {
                    return Ok(());
                }
                std::fs::remove_file(image_path)
                    .map_err(|e| LifecycleError::io("Failed to replace image link", image_path, e))?;
            }
            Ok(_) => {
                std::fs::rename(image_path, sidecar)
                    .map_err(|e| LifecycleError::io("Failed to preserve encrypted image", image_path, e))?;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(LifecycleError::io("Failed to inspect image", image_path, e)),
        }

        std::os::unix::fs::symlink(decrypted, image_path)
            .map_err(|e| LifecycleError::io("Failed to link decrypted image", image_path, e))?;
        self.settings.owner.apply_to_link(image_path)?;
        Ok(())
    }

    /// Moves the instance disk into its own encrypted volume
    async fn attach_instance(&self, descriptor: &VmDescriptor, key: &[u8]) -> Result<(), LifecycleError> {
        let _guard = self.instance_lock.lock().await;

        let instance_path = &descriptor.instance_path;
        let file_name = instance_path.file_name().ok_or_else(|| {
            LifecycleError::Input(format!("Instance path {} has no file name", instance_path.display()))
        })?;
        let mount_dir = self.settings.mount_root.join(&descriptor.instance_uuid);
        let adopted = mount_dir.join(file_name);

        let current_len = if is_regular_file(instance_path) {
            std::fs::metadata(instance_path).map(|m| m.len()).unwrap_or(0)
        } else {
            0
        };
        let size = volume_size_for(descriptor.disk_size_bytes.max(current_len));

        self.volumes
            .create_volume(&sparse_marker(instance_path), &descriptor.instance_uuid, key, size)
            .await?;
        tokio::fs::create_dir_all(&mount_dir)
            .await
            .map_err(|e| LifecycleError::io("Failed to create mount point", &mount_dir, e))?;
        self.volumes
            .mount(&self.volumes.mapper_path(&descriptor.instance_uuid), &mount_dir)
            .await?;
        self.settings.owner.apply(&mount_dir)?;

        match std::fs::symlink_metadata(instance_path) {
            Ok(meta) if meta.file_type().is_symlink() => {
                if !has_content(&adopted) {
                    return Err(LifecycleError::Input(format!(
                        "Instance disk {} points to a missing disk",
                        instance_path.display()
                    )));
                }
                debug!(instance = %descriptor.instance_uuid, "Instance disk already adopted");
                return Ok(());
            }
            Ok(_) => {
                let partial = append_suffix(&adopted, ".partial");
                tokio::fs::copy(instance_path, &partial)
                    .await
                    .map_err(|e| LifecycleError::io("Failed to copy instance disk", instance_path, e))?;
                tokio::fs::rename(&partial, &adopted)
                    .await
                    .map_err(|e| LifecycleError::io("Failed to move instance disk", &adopted, e))?;
                tokio::fs::remove_file(instance_path)
                    .await
                    .map_err(|e| LifecycleError::io("Failed to remove plain instance disk", instance_path, e))?;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if !has_content(&adopted) {
                    return Err(LifecycleError::Input(format!(
                        "Instance disk {} does not exist",
                        instance_path.display()
                    )));
                }
            }
            Err(e) => return Err(LifecycleError::io("Failed to inspect instance disk", instance_path, e)),
        }

        std::os::unix::fs::symlink(&adopted, instance_path)
            .map_err(|e| LifecycleError::io("Failed to link instance disk", instance_path, e))?;
        self.settings.owner.apply(&adopted)?;
        self.settings.owner.apply_to_link(instance_path)?;

        info!(
            instance = %descriptor.instance_uuid,
            disk = %adopted.display(),
            "Instance disk moved into encrypted volume"
        );
        Ok(())
    }

    /// Tears down the instance volume; failures are logged
    async fn detach_instance(&self, descriptor: &VmDescriptor) {
        let _guard = self.instance_lock.lock().await;
        let mount_dir = self.settings.mount_root.join(&descriptor.instance_uuid);

        match self.volumes.is_active(&descriptor.instance_uuid).await {
            Ok(true) => {
                if let Err(e) = self.volumes.unmount(&mount_dir).await {
                    warn!(instance = %descriptor.instance_uuid, "Failed to unmount instance volume: {}", e);
                }
                if let Err(e) = self.volumes.delete_volume(&descriptor.instance_uuid).await {
                    warn!(instance = %descriptor.instance_uuid, "Failed to close instance volume: {}", e);
                }
                info!(instance = %descriptor.instance_uuid, "Instance volume closed");
            }
            Ok(false) => debug!(instance = %descriptor.instance_uuid, "No active instance volume"),
            Err(e) => warn!(instance = %descriptor.instance_uuid, "Failed to query instance volume: {}", e),
        }

        remove_mount_dir(&mount_dir);
    }

    /// Closes the image volume and puts the ciphertext back; failures are logged
    async fn teardown_image(&self, image_uuid: &str, image_path: &Path) {
        let mount_dir = self.settings.mount_root.join(image_uuid);

        if let Err(e) = self.volumes.unmount(&mount_dir).await {
            warn!(image = image_uuid, "Failed to unmount image volume: {}", e);
        }
        if let Err(e) = self.volumes.delete_volume(image_uuid).await {
            warn!(image = image_uuid, "Failed to close image volume: {}", e);
        }
        remove_mount_dir(&mount_dir);

        let sidecar = ciphertext_sidecar(image_path);
        if sidecar.exists() {
            if let Ok(meta) = std::fs::symlink_metadata(image_path) {
                if meta.file_type().is_symlink() {
                    if let Err(e) = std::fs::remove_file(image_path) {
                        warn!(image = image_uuid, "Failed to remove image link: {}", e);
                    }
                }
            }
            if let Err(e) = std::fs::rename(&sidecar, image_path) {
                warn!(image = image_uuid, "Failed to restore encrypted image: {}", e);
            }
        }

        info!(image = image_uuid, "Image volume torn down");
    }

    fn watch_instance(&self, descriptor: &VmDescriptor) {
        let Some(watcher) = &self.watcher else {
            return;
        };

        let marker = descriptor.instance_dir().join(INSTANCE_MARKER);
        if !marker.exists() {
            debug!(instance = %descriptor.instance_uuid, "No instance marker; not watching for deletion");
            return;
        }
        let mount_dir = self.settings.mount_root.join(&descriptor.instance_uuid);
        let instance = descriptor.instance_uuid.clone();

        watcher.watch_removal(
            marker,
            Box::new(move |_: &Path| {
                info!(instance = %instance, "Instance deleted; removing its mount point");
                remove_mount_dir(&mount_dir);
            }),
        );
    }

    fn post_report(&self, descriptor: &VmDescriptor, flavor_id: Option<String>, digest: Option<String>) {
        let report = VmTrustReport::new(descriptor, &self.settings.hardware_uuid, flavor_id, digest);
        let body = match report.to_json() {
            Ok(body) => body,
            Err(e) => {
                warn!(instance = %descriptor.instance_uuid, "Failed to serialize trust report: {}", e);
                return;
            }
        };

        let key_service = self.key_service.clone();
        let instance = descriptor.instance_uuid.clone();
        tokio::spawn(async move {
            match key_service.post_vm_report(body).await {
                Ok(()) => debug!(instance = %instance, "Trust report posted"),
                Err(e) => warn!(instance = %instance, "Failed to post trust report: {}", e),
            }
        });
    }
}

fn record(method: LifecycleMethod, descriptor: &VmDescriptor, result: &Result<Outcome, LifecycleError>) {
    let op = method.as_str();
    match result {
        Ok(outcome) => {
            info!(
                op,
                instance = %descriptor.instance_uuid,
                image = %descriptor.image_uuid,
                outcome = ?outcome,
                "Lifecycle call succeeded"
            );
            metrics::increment_counter!("wlagent_lifecycle_calls_total", "op" => op, "outcome" => "success");
        }
        Err(e) => {
            error!(
                op,
                instance = %descriptor.instance_uuid,
                image = %descriptor.image_uuid,
                category = e.category(),
                "Lifecycle call failed: {}", e
            );
            metrics::increment_counter!("wlagent_lifecycle_calls_total", "op" => op, "outcome" => e.category());
        }
    }
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// LUKS backing file kept next to `path`
pub fn sparse_marker(path: &Path) -> PathBuf {
    append_suffix(path, SPARSE_SUFFIX)
}

/// Where the ciphertext of `image_path` is kept while decrypted
pub fn ciphertext_sidecar(image_path: &Path) -> PathBuf {
    append_suffix(image_path, CIPHERTEXT_SUFFIX)
}

fn has_content(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.is_file() && m.len() > 0).unwrap_or(false)
}

fn is_regular_file(path: &Path) -> bool {
    std::fs::symlink_metadata(path).map(|m| m.file_type().is_file()).unwrap_or(false)
}

fn remove_mount_dir(dir: &Path) {
    match std::fs::remove_dir(dir) {
        Ok(()) => debug!(dir = %dir.display(), "Mount point removed"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(dir = %dir.display(), "Failed to remove mount point: {}", e),
    }
}
