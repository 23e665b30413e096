// src/lifecycle/tests.rs

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use secrecy::SecretString;
use zeroize::Zeroizing;

use super::*;
use crate::network::{FlavorKey, MockKeyService};
use crate::security::{CertifiedKey, KeyUsage, TpmError, TpmProvider, TpmSession};
use crate::volume::{DiskProbe, VolumeError};
use crate::watcher::RemovalCallback;

const KEY: [u8; 32] = [0x42; 32];
const IMAGE_ID: &str = "img-1";
const PLAINTEXT: &[u8] = b"base image plaintext";

#[derive(Default)]
struct VolumeState {
    active: HashSet<String>,
    mounted: HashMap<PathBuf, String>,
    creates: HashMap<String, usize>,
    decrypts: usize,
}

/// Volume manager that keeps each volume's files in a directory of its own
/// and moves them in and out of the mount point on mount/unmount.
struct FakeVolumes {
    store_root: PathBuf,
    state: Mutex<VolumeState>,
}

impl FakeVolumes {
    fn new(store_root: PathBuf) -> Self {
        Self {
            store_root,
            state: Mutex::new(VolumeState::default()),
        }
    }

    fn creates(&self, name: &str) -> usize {
        self.state.lock().unwrap().creates.get(name).copied().unwrap_or(0)
    }

    fn total_creates(&self) -> usize {
        self.state.lock().unwrap().creates.values().sum()
    }

    fn decrypts(&self) -> usize {
        self.state.lock().unwrap().decrypts
    }

    fn active(&self, name: &str) -> bool {
        self.state.lock().unwrap().active.contains(name)
    }
}

fn move_entries(from: &Path, to: &Path) {
    std::fs::create_dir_all(to).unwrap();
    for entry in std::fs::read_dir(from).unwrap() {
        let entry = entry.unwrap();
        std::fs::rename(entry.path(), to.join(entry.file_name())).unwrap();
    }
}

#[async_trait]
impl VolumeManager for FakeVolumes {
    async fn create_volume(&self, backing_file: &Path, mapper_name: &str, _key: &[u8], _size: u64) -> Result<(), VolumeError> {
        // Widen the window for concurrent callers
        tokio::time::sleep(Duration::from_millis(5)).await;

        let mut state = self.state.lock().unwrap();
        if state.active.contains(mapper_name) {
            return Ok(());
        }
        if !backing_file.exists() {
            std::fs::write(backing_file, b"LUKS").unwrap();
        }
        state.active.insert(mapper_name.to_string());
        *state.creates.entry(mapper_name.to_string()).or_default() += 1;
        Ok(())
    }

    async fn mount(&self, mapper_path: &Path, mount_path: &Path) -> Result<(), VolumeError> {
        let mut state = self.state.lock().unwrap();
        if state.mounted.contains_key(mount_path) {
            return Ok(());
        }
        let name = mapper_path.file_name().unwrap().to_string_lossy().into_owned();
        let store = self.store_root.join(&name);
        std::fs::create_dir_all(&store).unwrap();
        move_entries(&store, mount_path);
        state.mounted.insert(mount_path.to_path_buf(), name);
        Ok(())
    }

    async fn unmount(&self, mount_path: &Path) -> Result<(), VolumeError> {
        let mut state = self.state.lock().unwrap();
        if let Some(name) = state.mounted.remove(mount_path) {
            move_entries(mount_path, &self.store_root.join(name));
        }
        Ok(())
    }

    async fn delete_volume(&self, mapper_name: &str) -> Result<(), VolumeError> {
        self.state.lock().unwrap().active.remove(mapper_name);
        Ok(())
    }

    async fn is_active(&self, mapper_name: &str) -> Result<bool, VolumeError> {
        Ok(self.active(mapper_name))
    }

    fn mapper_path(&self, mapper_name: &str) -> PathBuf {
        PathBuf::from("/dev/mapper").join(mapper_name)
    }

    fn decrypt(&self, ciphertext: &[u8], key: &[u8]) -> Result<Zeroizing<Vec<u8>>, VolumeError> {
        self.state.lock().unwrap().decrypts += 1;
        Ok(crypt::decrypt_image(ciphertext, key)?)
    }
}

struct FakeTpm {
    opens: AtomicUsize,
    key: Vec<u8>,
}

struct FakeTpmSession {
    key: Vec<u8>,
}

#[async_trait]
impl TpmProvider for FakeTpm {
    async fn open(&self) -> Result<Box<dyn TpmSession>, TpmError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeTpmSession { key: self.key.clone() }))
    }
}

#[async_trait]
impl TpmSession for FakeTpmSession {
    async fn unbind(&mut self, _key: &CertifiedKey, _auth: &SecretString, _wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>, TpmError> {
        Ok(Zeroizing::new(self.key.clone()))
    }

    async fn close(&mut self) -> Result<(), TpmError> {
        Ok(())
    }
}

struct FakeProbe {
    backing: Option<PathBuf>,
}

#[async_trait]
impl DiskProbe for FakeProbe {
    async fn backing_file(&self, _disk: &Path) -> Result<Option<PathBuf>, VolumeError> {
        Ok(self.backing.clone())
    }
}

#[derive(Default)]
struct RecordingWatcher {
    watched: Mutex<Vec<PathBuf>>,
}

impl FileWatcher for RecordingWatcher {
    fn watch_removal(&self, path: PathBuf, _callback: RemovalCallback) {
        self.watched.lock().unwrap().push(path);
    }

    fn unwatch(&self, _path: &Path) -> bool {
        false
    }
}

struct Env {
    _dir: tempfile::TempDir,
    root: PathBuf,
    image_path: PathBuf,
    volumes: Arc<FakeVolumes>,
    tpm: Arc<FakeTpm>,
    keys: Arc<KeyCache>,
    associations: Arc<ImageVmAssociations>,
    watcher: Arc<RecordingWatcher>,
    probe_result: Option<PathBuf>,
}

impl Env {
    fn new(encrypted: bool) -> Self {
        Self::with_tpm_key(encrypted, KEY.to_vec())
    }

    fn with_tpm_key(encrypted: bool, tpm_key: Vec<u8>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();

        let image_dir = root.join("instances/_base");
        std::fs::create_dir_all(&image_dir).unwrap();
        let image_path = image_dir.join(IMAGE_ID);
        let contents = if encrypted {
            crypt::encrypt_image(PLAINTEXT, &KEY).unwrap()
        } else {
            PLAINTEXT.to_vec()
        };
        std::fs::write(&image_path, contents).unwrap();

        Self {
            volumes: Arc::new(FakeVolumes::new(root.join("volumes"))),
            tpm: Arc::new(FakeTpm {
                opens: AtomicUsize::new(0),
                key: tpm_key,
            }),
            keys: Arc::new(KeyCache::new()),
            associations: Arc::new(ImageVmAssociations::new(root.join("state/image_vm_associations.json"))),
            watcher: Arc::new(RecordingWatcher::default()),
            probe_result: None,
            _dir: dir,
            root,
            image_path,
        }
    }

    fn mount_root(&self) -> PathBuf {
        self.root.join("mnt")
    }

    fn instance(&self, id: &str) -> VmDescriptor {
        let dir = self.root.join("instances").join(id);
        std::fs::create_dir_all(&dir).unwrap();
        let disk = dir.join("disk");
        std::fs::write(&disk, format!("disk of {}", id)).unwrap();
        std::fs::write(dir.join("disk.info"), b"{}").unwrap();

        VmDescriptor {
            instance_uuid: id.to_string(),
            instance_path: disk,
            image_uuid: IMAGE_ID.to_string(),
            image_path: Some(self.image_path.clone()),
            disk_size_bytes: 0,
        }
    }

    fn orchestrator(&self, key_service: MockKeyService) -> Orchestrator {
        let binding_key = CertifiedKey {
            public_key: vec![1],
            private_blob: vec![2],
            attestation: Vec::new(),
            signature: Vec::new(),
            digest_name: "SHA256".to_string(),
            tpm_version: "2.0".to_string(),
            usage: KeyUsage::Binding,
        };
        let unwrapper = KeyUnwrapper::new(self.tpm.clone(), binding_key, SecretString::new("auth".to_string())).unwrap();

        Orchestrator::new(
            OrchestratorSettings {
                mount_root: self.mount_root(),
                hardware_uuid: "hw-1".to_string(),
                owner: Ownership::current(),
            },
            Collaborators {
                volumes: self.volumes.clone(),
                key_service: Arc::new(key_service),
                unwrapper: Arc::new(unwrapper),
                associations: self.associations.clone(),
                keys: self.keys.clone(),
                probe: Arc::new(FakeProbe {
                    backing: self.probe_result.clone(),
                }),
                watcher: Some(self.watcher.clone()),
            },
        )
    }

    fn tpm_opens(&self) -> usize {
        self.tpm.opens.load(Ordering::SeqCst)
    }
}

fn flavor(encryption_required: bool, wrapped_key: Vec<u8>) -> FlavorKey {
    FlavorKey {
        flavor_id: "flavor-1".to_string(),
        encryption_required,
        wrapped_key,
    }
}

fn entitled(times: usize) -> MockKeyService {
    let mut key_service = MockKeyService::new();
    key_service
        .expect_get_image_flavor_key()
        .withf(|image, hardware| image.to_string() == IMAGE_ID && hardware.to_string() == "hw-1")
        .times(times)
        .returning(|_, _| Ok(Some(flavor(true, vec![1, 2, 3]))));
    key_service.expect_post_vm_report().returning(|_| Ok(()));
    key_service
}

fn is_symlink(path: &Path) -> bool {
    std::fs::symlink_metadata(path).map(|m| m.file_type().is_symlink()).unwrap_or(false)
}

fn starts_with_magic(path: &Path) -> bool {
    std::fs::read(path).map(|b| b.starts_with(crypt::ENCRYPTION_MAGIC)).unwrap_or(false)
}

#[test_log::test(tokio::test)]
async fn unencrypted_image_takes_fast_path() {
    let env = Env::new(false);
    let mut key_service = MockKeyService::new();
    key_service.expect_get_image_flavor_key().never();
    key_service.expect_post_vm_report().never();
    let orchestrator = env.orchestrator(key_service);
    let vm = env.instance("vm-1");

    assert_eq!(orchestrator.prepare_checked(&vm).await.unwrap(), Outcome::Passthrough);
    assert!(orchestrator.stop(&vm).await);

    assert_eq!(env.volumes.total_creates(), 0);
    assert_eq!(env.tpm_opens(), 0);
    assert_eq!(env.associations.count(IMAGE_ID).await.unwrap(), 0);
    assert!(!is_symlink(&vm.instance_path));
    assert!(env.watcher.watched.lock().unwrap().is_empty());
}

#[test_log::test(tokio::test)]
async fn encrypted_prepare_attaches_image_and_instance() {
    let env = Env::new(true);
    let orchestrator = env.orchestrator(entitled(1));
    let vm = env.instance("vm-1");

    let outcome = orchestrator.prepare_checked(&vm).await.unwrap();
    assert_eq!(outcome, Outcome::Attached { image_count: 1, decrypted: true });

    let decrypted = env.mount_root().join(IMAGE_ID).join(IMAGE_ID);
    assert_eq!(std::fs::read_link(&env.image_path).unwrap(), decrypted);
    assert_eq!(std::fs::read(&env.image_path).unwrap(), PLAINTEXT);
    assert!(starts_with_magic(&ciphertext_sidecar(&env.image_path)));
    assert!(sparse_marker(&env.image_path).exists());

    let adopted = env.mount_root().join("vm-1").join("disk");
    assert_eq!(std::fs::read_link(&vm.instance_path).unwrap(), adopted);
    assert_eq!(std::fs::read_to_string(&vm.instance_path).unwrap(), "disk of vm-1");
    assert!(sparse_marker(&vm.instance_path).exists());

    assert_eq!(env.associations.count(IMAGE_ID).await.unwrap(), 1);
    assert_eq!(env.tpm_opens(), 1);
    assert_eq!(env.keys.get(IMAGE_ID).unwrap().as_slice(), &KEY);
    assert_eq!(
        *env.watcher.watched.lock().unwrap(),
        vec![vm.instance_dir().join("disk.info")]
    );
}

#[tokio::test]
async fn instance_without_marker_is_not_watched() {
    let env = Env::new(true);
    let orchestrator = env.orchestrator(entitled(1));
    let vm = env.instance("vm-1");
    std::fs::remove_file(vm.instance_dir().join("disk.info")).unwrap();

    let outcome = orchestrator.prepare_checked(&vm).await.unwrap();
    assert_eq!(outcome, Outcome::Attached { image_count: 1, decrypted: true });
    assert!(env.watcher.watched.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_prepare_of_shared_image_decrypts_once() {
    let env = Env::new(true);
    let mut key_service = MockKeyService::new();
    key_service
        .expect_get_image_flavor_key()
        .times(1..=2)
        .returning(|_, _| Ok(Some(flavor(true, vec![1, 2, 3]))));
    key_service.expect_post_vm_report().returning(|_| Ok(()));
    let orchestrator = env.orchestrator(key_service);
    let vm1 = env.instance("vm-1");
    let vm2 = env.instance("vm-2");

    let (first, second) = tokio::join!(orchestrator.prepare(&vm1), orchestrator.prepare(&vm2));

    assert!(first && second);
    assert_eq!(env.volumes.decrypts(), 1);
    assert_eq!(env.volumes.creates(IMAGE_ID), 1);
    assert_eq!(env.volumes.creates("vm-1"), 1);
    assert_eq!(env.volumes.creates("vm-2"), 1);
    assert_eq!(env.associations.count(IMAGE_ID).await.unwrap(), 2);
}

#[tokio::test]
async fn second_instance_reuses_decrypted_image_and_cached_key() {
    let env = Env::new(true);
    let orchestrator = env.orchestrator(entitled(1));
    let vm1 = env.instance("vm-1");
    let vm2 = env.instance("vm-2");

    orchestrator.prepare_checked(&vm1).await.unwrap();
    let outcome = orchestrator.prepare_checked(&vm2).await.unwrap();

    assert_eq!(outcome, Outcome::Attached { image_count: 2, decrypted: false });
    assert_eq!(env.tpm_opens(), 1);
    assert_eq!(env.volumes.decrypts(), 1);
}

#[tokio::test]
async fn missing_flavor_is_denied_without_side_effects() {
    let env = Env::new(true);
    let mut key_service = MockKeyService::new();
    key_service.expect_get_image_flavor_key().times(1).returning(|_, _| Ok(None));
    let orchestrator = env.orchestrator(key_service);
    let vm = env.instance("vm-1");

    let err = orchestrator.prepare_checked(&vm).await.unwrap_err();

    assert!(matches!(err, LifecycleError::Entitlement(_)));
    assert_eq!(env.tpm_opens(), 0);
    assert_eq!(env.volumes.total_creates(), 0);
    assert!(starts_with_magic(&env.image_path));
    assert!(!ciphertext_sidecar(&env.image_path).exists());
    assert!(!sparse_marker(&env.image_path).exists());
    assert!(!is_symlink(&vm.instance_path));
    assert_eq!(env.associations.count(IMAGE_ID).await.unwrap(), 0);
}

#[tokio::test]
async fn empty_wrapped_key_is_denied() {
    let env = Env::new(true);
    let mut key_service = MockKeyService::new();
    key_service
        .expect_get_image_flavor_key()
        .returning(|_, _| Ok(Some(flavor(true, Vec::new()))));
    let orchestrator = env.orchestrator(key_service);

    assert!(!orchestrator.prepare(&env.instance("vm-1")).await);
    assert_eq!(env.tpm_opens(), 0);
    assert_eq!(env.volumes.total_creates(), 0);
}

#[tokio::test]
async fn flavor_without_encryption_requirement_passes_through() {
    let env = Env::new(true);
    let mut key_service = MockKeyService::new();
    key_service
        .expect_get_image_flavor_key()
        .returning(|_, _| Ok(Some(flavor(false, Vec::new()))));
    let orchestrator = env.orchestrator(key_service);

    let outcome = orchestrator.prepare_checked(&env.instance("vm-1")).await.unwrap();

    assert_eq!(outcome, Outcome::Passthrough);
    assert_eq!(env.tpm_opens(), 0);
    assert_eq!(env.volumes.total_creates(), 0);
}

#[tokio::test]
async fn wrong_key_fails_before_any_volume_is_created() {
    let env = Env::with_tpm_key(true, vec![0x13; 32]);
    let orchestrator = env.orchestrator(entitled(1));
    let vm = env.instance("vm-1");

    let err = orchestrator.prepare_checked(&vm).await.unwrap_err();

    assert!(matches!(err, LifecycleError::Resource(_)));
    assert_eq!(env.volumes.total_creates(), 0);
    assert!(starts_with_magic(&env.image_path));
    assert_eq!(env.associations.count(IMAGE_ID).await.unwrap(), 0);
}

#[test_log::test(tokio::test)]
async fn stop_keeps_image_until_last_instance() {
    let env = Env::new(true);
    let orchestrator = env.orchestrator(entitled(1));
    let vm1 = env.instance("vm-1");
    let vm2 = env.instance("vm-2");
    assert!(orchestrator.prepare(&vm1).await);
    assert!(orchestrator.prepare(&vm2).await);

    assert_eq!(orchestrator.stop_checked(&vm1).await.unwrap(), Outcome::Detached { last: false });
    assert!(!env.volumes.active("vm-1"));
    assert!(!env.mount_root().join("vm-1").exists());
    assert!(env.volumes.active(IMAGE_ID));
    assert!(is_symlink(&env.image_path));
    assert_eq!(env.associations.count(IMAGE_ID).await.unwrap(), 1);

    assert_eq!(orchestrator.stop_checked(&vm2).await.unwrap(), Outcome::Detached { last: true });
    assert!(!env.volumes.active(IMAGE_ID));
    assert!(!is_symlink(&env.image_path));
    assert!(starts_with_magic(&env.image_path));
    assert!(!ciphertext_sidecar(&env.image_path).exists());
    assert!(sparse_marker(&env.image_path).exists());
    assert!(!env.mount_root().join(IMAGE_ID).exists());
    assert!(env.associations.entries().await.unwrap().is_empty());
}

#[tokio::test]
async fn restart_after_stop_keeps_instance_data() {
    let env = Env::new(true);
    let orchestrator = env.orchestrator(entitled(2));
    let vm = env.instance("vm-1");

    assert!(orchestrator.prepare(&vm).await);
    assert!(orchestrator.stop(&vm).await);
    assert!(is_symlink(&vm.instance_path));

    // Resuming from shutoff: the disk link dangles until the volume is back
    assert!(orchestrator.start(&vm).await);

    assert_eq!(std::fs::read_to_string(&vm.instance_path).unwrap(), "disk of vm-1");
    assert_eq!(std::fs::read(&env.image_path).unwrap(), PLAINTEXT);
    assert_eq!(env.associations.count(IMAGE_ID).await.unwrap(), 1);
    // The image volume was reopened, not decrypted into again
    assert_eq!(env.volumes.creates(IMAGE_ID), 2);
    assert_eq!(env.tpm_opens(), 2);
}

#[tokio::test]
async fn image_path_comes_from_associations_when_descriptor_lacks_it() {
    let env = Env::new(true);
    let orchestrator = env.orchestrator(entitled(1));
    let vm1 = env.instance("vm-1");
    let mut vm2 = env.instance("vm-2");
    vm2.image_path = None;

    assert!(orchestrator.prepare(&vm1).await);
    let outcome = orchestrator.prepare_checked(&vm2).await.unwrap();

    assert_eq!(outcome, Outcome::Attached { image_count: 2, decrypted: false });
}

#[tokio::test]
async fn image_path_falls_back_to_backing_file_probe() {
    let mut env = Env::new(true);
    env.probe_result = Some(env.image_path.clone());
    let orchestrator = env.orchestrator(entitled(1));
    let mut vm = env.instance("vm-1");
    vm.image_path = None;

    assert!(orchestrator.prepare(&vm).await);
    assert_eq!(env.associations.image_path(IMAGE_ID).await.unwrap(), Some(env.image_path.clone()));
}

#[tokio::test]
async fn unresolvable_image_path_is_input_error() {
    let env = Env::new(true);
    let mut key_service = MockKeyService::new();
    key_service.expect_get_image_flavor_key().never();
    let orchestrator = env.orchestrator(key_service);
    let mut vm = env.instance("vm-1");
    vm.image_path = None;

    let err = orchestrator.prepare_checked(&vm).await.unwrap_err();
    assert!(matches!(err, LifecycleError::Input(_)));
    assert_eq!(err.category(), "input");
}

#[tokio::test]
async fn stop_without_association_entry_still_succeeds() {
    let env = Env::new(true);
    let orchestrator = env.orchestrator(entitled(1));
    let vm = env.instance("vm-1");
    assert!(orchestrator.prepare(&vm).await);
    env.associations.delete(IMAGE_ID).await.unwrap();

    assert_eq!(orchestrator.stop_checked(&vm).await.unwrap(), Outcome::Detached { last: false });
    assert!(!env.volumes.active("vm-1"));
    assert!(env.volumes.active(IMAGE_ID));
}

#[tokio::test]
async fn association_failure_leaves_image_volume_in_place() {
    let env = Env::new(true);
    let orchestrator = env.orchestrator(entitled(1));
    let vm = env.instance("vm-1");
    assert!(orchestrator.prepare(&vm).await);
    std::fs::write(env.associations.path(), "{ corrupt").unwrap();

    let err = orchestrator.stop_checked(&vm).await.unwrap_err();

    assert!(matches!(err, LifecycleError::Bookkeeping(_)));
    assert!(!env.volumes.active("vm-1"));
    assert!(env.volumes.active(IMAGE_ID));
    assert!(is_symlink(&env.image_path));
}

#[tokio::test]
async fn missing_image_file_is_input_error() {
    let env = Env::new(true);
    let mut key_service = MockKeyService::new();
    key_service.expect_get_image_flavor_key().never();
    let orchestrator = env.orchestrator(key_service);
    let mut vm = env.instance("vm-1");
    vm.image_path = Some(env.root.join("instances/_base/does-not-exist"));

    assert!(matches!(orchestrator.prepare_checked(&vm).await, Err(LifecycleError::Input(_))));
}

/// Parser handing out a fixed descriptor for any XML containing "<domain"
struct FixedParser(VmDescriptor);

impl crate::vm::DomainParser for FixedParser {
    fn parse(&self, xml: &str) -> Result<VmDescriptor, crate::vm::DescriptorError> {
        if xml.contains("<domain") {
            Ok(self.0.clone())
        } else {
            Err(crate::vm::DescriptorError::Xml("not a domain".to_string()))
        }
    }
}

#[tokio::test]
async fn dispatcher_maps_outcomes_to_replies() {
    use crate::service::{Dispatcher, LifecycleRequest, RequestHandler};

    let env = Env::new(true);
    let mut key_service = MockKeyService::new();
    key_service.expect_get_image_flavor_key().returning(|_, _| Ok(None));
    let orchestrator = Arc::new(env.orchestrator(key_service));
    let dispatcher = Dispatcher::new(Arc::new(FixedParser(env.instance("vm-1"))), orchestrator);

    let garbage = dispatcher
        .handle(LifecycleRequest {
            method: LifecycleMethod::Prepare,
            domain_xml: "garbage".to_string(),
        })
        .await;
    assert!(!garbage.result);
    assert!(garbage.error.unwrap().starts_with("Invalid request"));

    let denied = dispatcher
        .handle(LifecycleRequest {
            method: LifecycleMethod::Prepare,
            domain_xml: "<domain/>".to_string(),
        })
        .await;
    assert_eq!(denied.exit_code(), 1);
    assert!(denied.error.unwrap().starts_with("Entitlement denied"));
    assert_eq!(env.volumes.total_creates(), 0);
}
