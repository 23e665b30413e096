// Network subsystem

pub mod key_service;

// Re-exports
pub use key_service::{FlavorKey, HttpKeyService, KeyService, KeyServiceError};

#[cfg(test)]
pub use key_service::MockKeyService;
