// Key protection subsystem

pub mod key_cache;
pub mod tpm;
pub mod unwrap;

// Re-exports
pub use key_cache::KeyCache;
pub use tpm::{CertifiedKey, KeyUsage, Tpm2ToolsProvider, TpmError, TpmProvider, TpmSession};
pub use unwrap::{KeyUnwrapper, UnwrapError};
