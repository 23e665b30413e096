// src/config/validator.rs

use std::path::Path;
use url::Url;
use uuid::Uuid;

use crate::config::{AgentConfig, ConfigError, KeyServiceConfig, PathsConfig, RpcConfig, TpmConfig, VolumeConfig};

/// Configuration validator
pub struct ConfigValidator {}

impl ConfigValidator {
    /// Creates a new configuration validator
    pub fn new() -> Self {
        Self {}
    }

    /// Validates a configuration
    pub fn validate(&self, config: &AgentConfig) -> Result<(), ConfigError> {
        if !config.version.starts_with("1.") {
            return Err(ConfigError::ValidationError(
                format!("Unsupported configuration version: {}", config.version)
            ));
        }

        self.validate_rpc(&config.rpc)?;
        self.validate_paths(&config.paths)?;
        self.validate_volume(&config.volume)?;
        self.validate_key_service(&config.key_service)?;
        self.validate_tpm(&config.tpm)?;

        if config.runtime.user.is_empty() || config.runtime.group.is_empty() {
            return Err(ConfigError::ValidationError(
                "Runtime user and group cannot be empty".to_string(),
            ));
        }

        if config.watcher.debounce_ms == 0 {
            return Err(ConfigError::ValidationError(
                "Watcher debounce interval must be greater than zero".to_string(),
            ));
        }

        if let Some(hardware_uuid) = &config.hardware_uuid {
            Uuid::parse_str(hardware_uuid.trim()).map_err(|e| ConfigError::ValidationError(
                format!("Invalid hardware UUID {}: {}", hardware_uuid, e)
            ))?;
        }

        Ok(())
    }

    fn validate_rpc(&self, rpc: &RpcConfig) -> Result<(), ConfigError> {
        require_absolute("rpc.socket_path", &rpc.socket_path)
    }

    fn validate_paths(&self, paths: &PathsConfig) -> Result<(), ConfigError> {
        require_absolute("paths.mount_root", &paths.mount_root)?;
        require_absolute("paths.association_file", &paths.association_file)?;
        require_absolute("paths.mapper_dir", &paths.mapper_dir)?;
        require_absolute("paths.mounts_file", &paths.mounts_file)?;

        if paths.association_file.starts_with(&paths.mount_root) {
            return Err(ConfigError::ValidationError(
                "Association file cannot live inside the volume mount root".to_string(),
            ));
        }

        Ok(())
    }

    fn validate_volume(&self, volume: &VolumeConfig) -> Result<(), ConfigError> {
        if volume.filesystem.is_empty() {
            return Err(ConfigError::ValidationError(
                "Volume filesystem cannot be empty".to_string(),
            ));
        }

        if volume.command_timeout_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "Command timeout must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    fn validate_key_service(&self, key_service: &KeyServiceConfig) -> Result<(), ConfigError> {
        let url = Url::parse(&key_service.base_url).map_err(|e| ConfigError::ValidationError(
            format!("Invalid key service URL {}: {}", key_service.base_url, e)
        ))?;

        if url.scheme() != "http" {
            return Err(ConfigError::ValidationError(format!(
                "Unsupported key service scheme {}; terminate TLS in a local proxy",
                url.scheme()
            )));
        }

        if key_service.timeout_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "Key service timeout must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    fn validate_tpm(&self, tpm: &TpmConfig) -> Result<(), ConfigError> {
        require_absolute("tpm.binding_key_path", &tpm.binding_key_path)?;

        let handle = tpm.parent_handle.trim_start_matches("0x");
        u32::from_str_radix(handle, 16).map_err(|_| ConfigError::ValidationError(
            format!("Invalid TPM parent handle: {}", tpm.parent_handle)
        ))?;

        Ok(())
    }
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}

fn require_absolute(name: &str, path: &Path) -> Result<(), ConfigError> {
    if path.is_absolute() {
        Ok(())
    } else {
        Err(ConfigError::ValidationError(format!(
            "{} must be an absolute path, got {}",
            name,
            path.display()
        )))
    }
}
