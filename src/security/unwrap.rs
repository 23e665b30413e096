// src/security/unwrap.rs

use std::sync::Arc;
use secrecy::SecretString;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::config::{ConfigError, TpmConfig};
use crate::security::tpm::{CertifiedKey, KeyUsage, TpmError, TpmProvider};

/// Unwraps content keys with the TPM binding key.
///
/// Only one TPM operation runs at a time in the process. Every call opens
/// its own session and closes it before returning, success or not.
pub struct KeyUnwrapper {
    /// TPM access
    tpm: Arc<dyn TpmProvider>,

    /// Provisioned binding key
    binding_key: CertifiedKey,

    /// Authorization secret of the binding key
    auth: SecretString,

    /// Serializes TPM use
    tpm_lock: Mutex<()>,
}

impl KeyUnwrapper {
    /// Creates an unwrapper for an already loaded binding key
    pub fn new(tpm: Arc<dyn TpmProvider>, binding_key: CertifiedKey, auth: SecretString) -> Result<Self, UnwrapError> {
        if binding_key.usage != KeyUsage::Binding {
            return Err(UnwrapError::WrongKeyUsage(binding_key.usage));
        }

        Ok(Self {
            tpm,
            binding_key,
            auth,
            tpm_lock: Mutex::new(()),
        })
    }

    /// Loads the binding key and its secret from configuration
    pub fn from_config(tpm: Arc<dyn TpmProvider>, config: &TpmConfig) -> Result<Self, UnwrapError> {
        let binding_key = CertifiedKey::load(&config.binding_key_path)?;
        let auth = config.binding_key_secret.resolve()?;
        info!(
            path = %config.binding_key_path.display(),
            tpm_version = %binding_key.tpm_version,
            "Binding key loaded"
        );
        Self::new(tpm, binding_key, auth)
    }

    /// Unwraps `wrapped` into the plain content key
    pub async fn unwrap(&self, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>, UnwrapError> {
        if wrapped.is_empty() {
            return Err(UnwrapError::EmptyWrappedKey);
        }

        let _guard = self.tpm_lock.lock().await;
        debug!(wrapped_len = wrapped.len(), "Unwrapping key with TPM");

        let mut session = self.tpm.open().await?;
        let result = session.unbind(&self.binding_key, &self.auth, wrapped).await;

        if let Err(e) = session.close().await {
            warn!("Failed to close TPM session: {}", e);
        }

        match result {
            Ok(key) => {
                metrics::increment_counter!("wlagent_tpm_unwraps_total", "outcome" => "success");
                Ok(key)
            }
            Err(e) => {
                metrics::increment_counter!("wlagent_tpm_unwraps_total", "outcome" => "failure");
                error!("TPM unbind failed: {}", e);
                Err(e.into())
            }
        }
    }
}

/// Key unwrap errors
#[derive(Error, Debug)]
pub enum UnwrapError {
    #[error("Binding key has usage {0:?}; a binding key is required")]
    WrongKeyUsage(KeyUsage),

    #[error("Wrapped key is empty")]
    EmptyWrappedKey,

    #[error(transparent)]
    Tpm(#[from] TpmError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
