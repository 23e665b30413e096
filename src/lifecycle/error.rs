// src/lifecycle/error.rs

use thiserror::Error;

use crate::association::AssociationError;
use crate::network::KeyServiceError;
use crate::security::UnwrapError;
use crate::volume::VolumeError;

/// Why a lifecycle call failed.
///
/// Every variant collapses to `false` at the RPC boundary; the message is
/// passed back to the hook for its logs.
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// The descriptor or the files it names are unusable
    #[error("Invalid request: {0}")]
    Input(String),

    /// The host is not entitled to the image key
    #[error("Entitlement denied: {0}")]
    Entitlement(String),

    /// The TPM could not unwrap the key
    #[error("Key unwrap failed: {0}")]
    Tpm(String),

    /// A volume, file or external tool failed
    #[error("Volume operation failed: {0}")]
    Resource(String),

    /// The association store could not be read or written
    #[error("Association bookkeeping failed: {0}")]
    Bookkeeping(String),
}

impl LifecycleError {
    /// Short category name for logs and metrics
    pub fn category(&self) -> &'static str {
        match self {
            LifecycleError::Input(_) => "input",
            LifecycleError::Entitlement(_) => "entitlement",
            LifecycleError::Tpm(_) => "tpm",
            LifecycleError::Resource(_) => "resource",
            LifecycleError::Bookkeeping(_) => "bookkeeping",
        }
    }

    pub(crate) fn io(context: &str, path: &std::path::Path, error: std::io::Error) -> Self {
        LifecycleError::Resource(format!("{} {}: {}", context, path.display(), error))
    }
}

impl From<VolumeError> for LifecycleError {
    fn from(error: VolumeError) -> Self {
        LifecycleError::Resource(error.to_string())
    }
}

impl From<UnwrapError> for LifecycleError {
    fn from(error: UnwrapError) -> Self {
        LifecycleError::Tpm(error.to_string())
    }
}

impl From<KeyServiceError> for LifecycleError {
    fn from(error: KeyServiceError) -> Self {
        LifecycleError::Entitlement(error.to_string())
    }
}

impl From<AssociationError> for LifecycleError {
    fn from(error: AssociationError) -> Self {
        LifecycleError::Bookkeeping(error.to_string())
    }
}
