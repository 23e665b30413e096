// src/security/tpm.rs

//! TPM access for unbinding wrapped content keys.
//!
//! The binding key is created and certified at provisioning time and stored as
//! a JSON document. Sessions are short-lived: opened, used for exactly one
//! unbind, then closed.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::config::TpmConfig;
use crate::execution::{CommandError, CommandRunner, Invocation};

/// Environment variable tpm2-tools read the TCTI from
const TCTI_ENV: &str = "TPM2TOOLS_TCTI";

/// What a certified key may be used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyUsage {
    /// Signing key
    Signing,

    /// Binding (decryption) key
    Binding,
}

/// Provisioned TPM key together with its certification
#[derive(Clone, Serialize, Deserialize)]
pub struct CertifiedKey {
    /// TPM2B_PUBLIC area of the key
    #[serde(with = "base64_bytes")]
    pub public_key: Vec<u8>,

    /// TPM2B_PRIVATE blob, wrapped by the parent storage key
    #[serde(with = "base64_bytes")]
    pub private_blob: Vec<u8>,

    /// Certification attestation structure
    #[serde(with = "base64_bytes")]
    pub attestation: Vec<u8>,

    /// Signature over the attestation
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,

    /// Name digest algorithm
    pub digest_name: String,

    /// TPM specification version the key was created with
    pub tpm_version: String,

    /// Key usage
    pub usage: KeyUsage,
}

impl CertifiedKey {
    /// Reads a certified key document
    pub fn load(path: &Path) -> Result<Self, TpmError> {
        let contents = std::fs::read_to_string(path).map_err(|e| TpmError::KeyFile {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;

        serde_json::from_str(&contents).map_err(|e| TpmError::KeyFile {
            path: path.display().to_string(),
            error: e.to_string(),
        })
    }
}

impl fmt::Debug for CertifiedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertifiedKey")
            .field("usage", &self.usage)
            .field("tpm_version", &self.tpm_version)
            .field("digest_name", &self.digest_name)
            .field("public_key_len", &self.public_key.len())
            .finish()
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(serde::de::Error::custom)
    }
}

/// Opens TPM sessions
#[async_trait]
pub trait TpmProvider: Send + Sync {
    /// Opens a fresh session
    async fn open(&self) -> Result<Box<dyn TpmSession>, TpmError>;
}

/// One open TPM session
#[async_trait]
pub trait TpmSession: Send {
    /// Decrypts `wrapped` with the binding key
    async fn unbind(
        &mut self,
        key: &CertifiedKey,
        auth: &SecretString,
        wrapped: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, TpmError>;

    /// Releases the session and any transient objects it loaded
    async fn close(&mut self) -> Result<(), TpmError>;
}

/// `TpmProvider` driving the tpm2-tools command line utilities
pub struct Tpm2ToolsProvider {
    /// Runner for tpm2-tools
    runner: Arc<dyn CommandRunner>,

    /// Directory holding the tpm2-tools binaries
    tools_dir: PathBuf,

    /// TCTI string
    tcti: String,

    /// Parent storage key handle
    parent_handle: String,

    /// Where session scratch directories are created
    scratch_dir: Option<PathBuf>,
}

impl Tpm2ToolsProvider {
    /// Creates a provider from configuration
    pub fn new(runner: Arc<dyn CommandRunner>, config: &TpmConfig) -> Self {
        Self {
            runner,
            tools_dir: config.tools_dir.clone(),
            tcti: config.tcti.clone(),
            parent_handle: config.parent_handle.clone(),
            scratch_dir: config.scratch_dir.clone(),
        }
    }
}

#[async_trait]
impl TpmProvider for Tpm2ToolsProvider {
    async fn open(&self) -> Result<Box<dyn TpmSession>, TpmError> {
        let scratch = match &self.scratch_dir {
            Some(dir) => tempfile::Builder::new().prefix("wlagent-tpm").tempdir_in(dir),
            None => tempfile::Builder::new().prefix("wlagent-tpm").tempdir(),
        }
        .map_err(|e| TpmError::Session(format!("Failed to create scratch directory: {}", e)))?;

        debug!(scratch = %scratch.path().display(), "TPM session opened");

        Ok(Box::new(Tpm2ToolsSession {
            runner: self.runner.clone(),
            tools_dir: self.tools_dir.clone(),
            tcti: self.tcti.clone(),
            parent_handle: self.parent_handle.clone(),
            scratch: Some(scratch),
            loaded: false,
        }))
    }
}

struct Tpm2ToolsSession {
    runner: Arc<dyn CommandRunner>,
    tools_dir: PathBuf,
    tcti: String,
    parent_handle: String,
    scratch: Option<tempfile::TempDir>,
    loaded: bool,
}

impl Tpm2ToolsSession {
    fn tool(&self, name: &str) -> Invocation {
        Invocation::new(self.tools_dir.join(name)).env(TCTI_ENV, self.tcti.clone())
    }

    fn scratch(&self) -> Result<&Path, TpmError> {
        self.scratch
            .as_ref()
            .map(|dir| dir.path())
            .ok_or_else(|| TpmError::Session("Session already closed".to_string()))
    }

    async fn run(&self, invocation: Invocation, stdin: Option<&[u8]>) -> Result<(), TpmError> {
        let output = self.runner.run(&invocation, stdin).await?;
        if output.success() {
            return Ok(());
        }
        Err(TpmError::Command {
            tool: invocation.program_name(),
            message: output.diagnostic(),
        })
    }
}

#[async_trait]
impl TpmSession for Tpm2ToolsSession {
    async fn unbind(
        &mut self,
        key: &CertifiedKey,
        auth: &SecretString,
        wrapped: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, TpmError> {
        let scratch = self.scratch()?.to_path_buf();
        let public = scratch.join("key.pub");
        let private = scratch.join("key.priv");
        let context = scratch.join("key.ctx");
        let input = scratch.join("wrapped.bin");

        for (path, bytes) in [(&public, &key.public_key[..]), (&private, &key.private_blob[..]), (&input, wrapped)] {
            tokio::fs::write(path, bytes)
                .await
                .map_err(|e| TpmError::Session(format!("Failed to write {}: {}", path.display(), e)))?;
        }

        let load = self.tool("tpm2_load")
            .arg("-C")
            .arg(&self.parent_handle)
            .arg("-u")
            .path_arg(&public)
            .arg("-r")
            .path_arg(&private)
            .arg("-c")
            .path_arg(&context);
        self.run(load, None).await?;
        self.loaded = true;

        // Auth is read from stdin so it never shows up in the process table.
        // Without -o the plaintext key is written to stdout and never touches disk.
        let decrypt = self.tool("tpm2_rsadecrypt")
            .arg("-c")
            .path_arg(&context)
            .arg("-p")
            .arg("file:-")
            .arg("-s")
            .arg("oaep")
            .path_arg(&input);
        let auth_bytes = Zeroizing::new(auth.expose_secret().as_bytes().to_vec());
        let mut output = self.runner.run(&decrypt, Some(auth_bytes.as_slice())).await?;
        if !output.success() {
            return Err(TpmError::Command {
                tool: decrypt.program_name(),
                message: output.diagnostic(),
            });
        }

        let unwrapped = std::mem::take(&mut output.stdout);

        if unwrapped.is_empty() {
            return Err(TpmError::Unbind("TPM returned an empty key".to_string()));
        }

        Ok(unwrapped)
    }

    async fn close(&mut self) -> Result<(), TpmError> {
        let mut result = Ok(());

        if self.loaded {
            let flush = self.tool("tpm2_flushcontext").arg("--transient-object");
            if let Err(e) = self.run(flush, None).await {
                warn!("Failed to flush transient TPM objects: {}", e);
                result = Err(e);
            }
            self.loaded = false;
        }

        if let Some(scratch) = self.scratch.take() {
            if let Err(e) = scratch.close() {
                warn!("Failed to remove TPM scratch directory: {}", e);
            }
        }

        result
    }
}

/// TPM errors
#[derive(Error, Debug)]
pub enum TpmError {
    #[error("Failed to read certified key {path}: {error}")]
    KeyFile {
        path: String,
        error: String,
    },

    #[error("TPM session error: {0}")]
    Session(String),

    #[error("{tool} failed: {message}")]
    Command {
        tool: String,
        message: String,
    },

    #[error(transparent)]
    Runner(#[from] CommandError),

    #[error("Unbind failed: {0}")]
    Unbind(String),
}
