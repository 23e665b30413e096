// src/config/mod.rs

pub mod validator;

use std::fs;
use std::path::{Path, PathBuf};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::volume::Ownership;

/// Default location of the hypervisor's hardware UUID
const DMI_PRODUCT_UUID_PATH: &str = "/sys/class/dmi/id/product_uuid";

/// Complete configuration of the workload agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Configuration format version
    pub version: String,

    /// Local RPC listener configuration
    #[serde(default)]
    pub rpc: RpcConfig,

    /// Filesystem layout used for volumes and bookkeeping
    #[serde(default)]
    pub paths: PathsConfig,

    /// External volume tooling
    #[serde(default)]
    pub volume: VolumeConfig,

    /// Virtualization runtime identity that must own decrypted disks
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Workload/key service client configuration
    pub key_service: KeyServiceConfig,

    /// TPM binding key configuration
    pub tpm: TpmConfig,

    /// Instance disk watcher configuration
    #[serde(default)]
    pub watcher: WatcherConfig,

    /// Hardware UUID override (read from DMI when absent)
    #[serde(default)]
    pub hardware_uuid: Option<String>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// RPC listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Unix socket the hypervisor hook connects to
    pub socket_path: PathBuf,

    /// Upper bound for a single lifecycle call in seconds (0 = unlimited)
    pub request_timeout_seconds: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/var/run/workload-agent/wlagent.sock"),
            request_timeout_seconds: 600,
        }
    }
}

/// Filesystem layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory under which image and instance volumes are mounted
    pub mount_root: PathBuf,

    /// Image to VM association file
    pub association_file: PathBuf,

    /// Device mapper node directory
    pub mapper_dir: PathBuf,

    /// Mount table consulted for idempotent mount/unmount
    pub mounts_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            mount_root: PathBuf::from("/mnt/crypto"),
            association_file: PathBuf::from("/var/lib/workload-agent/image_vm_associations.json"),
            mapper_dir: PathBuf::from("/dev/mapper"),
            mounts_file: PathBuf::from("/proc/self/mounts"),
        }
    }
}

/// External binaries used to manage volumes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// cryptsetup binary
    pub cryptsetup_path: PathBuf,

    /// mkfs binary matching `filesystem`
    pub mkfs_path: PathBuf,

    /// blkid binary used to detect an existing filesystem
    pub blkid_path: PathBuf,

    /// mount binary
    pub mount_path: PathBuf,

    /// umount binary
    pub umount_path: PathBuf,

    /// qemu-img binary used to probe backing files
    pub qemu_img_path: PathBuf,

    /// Filesystem created inside new volumes
    pub filesystem: String,

    /// Timeout applied to every external command in seconds
    pub command_timeout_seconds: u64,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            cryptsetup_path: PathBuf::from("/usr/sbin/cryptsetup"),
            mkfs_path: PathBuf::from("/usr/sbin/mkfs.ext4"),
            blkid_path: PathBuf::from("/usr/sbin/blkid"),
            mount_path: PathBuf::from("/usr/bin/mount"),
            umount_path: PathBuf::from("/usr/bin/umount"),
            qemu_img_path: PathBuf::from("/usr/bin/qemu-img"),
            filesystem: "ext4".to_string(),
            command_timeout_seconds: 120,
        }
    }
}

/// Virtualization runtime identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// User the hypervisor runs guests as
    pub user: String,

    /// Group the hypervisor runs guests as
    pub group: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            user: "qemu".to_string(),
            group: "qemu".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Resolves the configured user and group names to numeric ids
    pub fn resolve_owner(&self) -> Result<Ownership, ConfigError> {
        let user = nix::unistd::User::from_name(&self.user)
            .map_err(|e| ConfigError::ValidationError(format!("Failed to look up user {}: {}", self.user, e)))?
            .ok_or_else(|| ConfigError::ValidationError(format!("Unknown runtime user: {}", self.user)))?;

        let group = nix::unistd::Group::from_name(&self.group)
            .map_err(|e| ConfigError::ValidationError(format!("Failed to look up group {}: {}", self.group, e)))?
            .ok_or_else(|| ConfigError::ValidationError(format!("Unknown runtime group: {}", self.group)))?;

        Ok(Ownership {
            uid: user.uid.as_raw(),
            gid: group.gid.as_raw(),
        })
    }
}

/// Workload/key service client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyServiceConfig {
    /// Base URL of the workload service API
    pub base_url: String,

    /// Bearer token used to authenticate against the service
    #[serde(default)]
    pub bearer_token: Option<SecretSource>,

    /// Request timeout in seconds
    #[serde(default = "default_key_service_timeout")]
    pub timeout_seconds: u64,
}

fn default_key_service_timeout() -> u64 {
    30
}

/// TPM binding key configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TpmConfig {
    /// Certified binding key produced at provisioning time
    pub binding_key_path: PathBuf,

    /// Authorization secret for the binding key
    pub binding_key_secret: SecretSource,

    /// Directory holding the tpm2-tools binaries
    #[serde(default = "default_tpm_tools_dir")]
    pub tools_dir: PathBuf,

    /// TCTI string handed to tpm2-tools
    #[serde(default = "default_tcti")]
    pub tcti: String,

    /// Persistent handle of the storage key the binding key was created under
    #[serde(default = "default_parent_handle")]
    pub parent_handle: String,

    /// Directory for short-lived TPM session files (system temp dir when absent)
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,
}

fn default_tpm_tools_dir() -> PathBuf {
    PathBuf::from("/usr/bin")
}

fn default_tcti() -> String {
    "device:/dev/tpmrm0".to_string()
}

fn default_parent_handle() -> String {
    "0x81000000".to_string()
}

/// Instance disk watcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Quiet period before a batch of file events is handled, in milliseconds
    pub debounce_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self { debounce_ms: 500 }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: LogLevel,

    /// Log format
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Plain,
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    /// Error level
    Error,

    /// Warning level
    Warning,

    /// Info level
    Info,

    /// Debug level
    Debug,

    /// Trace level
    Trace,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warning => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Log format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogFormat {
    /// Plain text
    Plain,

    /// JSON format
    Json,
}

/// Secret reference: `env:NAME`, `file:/path`, or a literal value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretSource(pub String);

impl SecretSource {
    /// Resolves the reference to its secret value
    pub fn resolve(&self) -> Result<SecretString, ConfigError> {
        let reference = &self.0;
        let Some((source_type, source_path)) = reference.split_once(':') else {
            // Direct value - use as is
            return Ok(SecretString::new(reference.clone()));
        };

        match source_type {
            "env" => std::env::var(source_path)
                .map(SecretString::new)
                .map_err(|_| ConfigError::SecretResolutionError {
                    reference: reference.clone(),
                    error: format!("Environment variable {} not found", source_path),
                }),
            "file" => fs::read_to_string(source_path)
                .map(|s| SecretString::new(s.trim().to_string()))
                .map_err(|e| ConfigError::SecretResolutionError {
                    reference: reference.clone(),
                    error: format!("Failed to read file {}: {}", source_path, e),
                }),
            _ => Err(ConfigError::InvalidSecretSource(source_type.to_string())),
        }
    }
}

/// Configuration manager
pub struct ConfigManager {
    /// Current active configuration
    config: AgentConfig,

    /// Configuration file path
    config_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Wraps an already-built configuration after validating it
    pub fn from_config(config: AgentConfig) -> Result<Self, ConfigError> {
        let manager = Self {
            config,
            config_path: None,
        };
        manager.validate()?;
        Ok(manager)
    }

    /// Loads configuration from a file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config_str = fs::read_to_string(&path)
            .map_err(|e| ConfigError::FileReadError {
                path: path.as_ref().to_string_lossy().into_owned(),
                error: e.to_string(),
            })?;

        let config: AgentConfig = serde_yaml::from_str(&config_str)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        let manager = Self {
            config,
            config_path: Some(path.as_ref().to_path_buf()),
        };

        manager.validate()?;

        info!("Configuration loaded from {}", path.as_ref().display());

        Ok(manager)
    }

    /// Validates the current configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        validator::ConfigValidator::new().validate(&self.config)?;
        debug!("Configuration validated successfully");
        Ok(())
    }

    /// Gets the current configuration
    pub fn get_config(&self) -> &AgentConfig {
        &self.config
    }

    /// Path the configuration was loaded from, if any
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Hardware UUID of this host, lower-cased
    pub fn hardware_uuid(&self) -> Result<String, ConfigError> {
        if let Some(uuid) = &self.config.hardware_uuid {
            return Ok(uuid.trim().to_ascii_lowercase());
        }

        fs::read_to_string(DMI_PRODUCT_UUID_PATH)
            .map(|s| s.trim().to_ascii_lowercase())
            .map_err(|e| ConfigError::FileReadError {
                path: DMI_PRODUCT_UUID_PATH.to_string(),
                error: e.to_string(),
            })
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path}: {error}")]
    FileReadError {
        path: String,
        error: String,
    },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Invalid secret source: {0}")]
    InvalidSecretSource(String),

    #[error("Failed to resolve secret {reference}: {error}")]
    SecretResolutionError {
        reference: String,
        error: String,
    },
}
