// wlagent - Host-side workload agent for encrypted VM disks
//
// Licensed under the GNU General Public License v3.0

//! wlagent keeps VM base images and instance disks encrypted at rest. It
//! sits behind the hypervisor's lifecycle hook and, on prepare/start/stop,
//! fetches and TPM-unwraps image keys, decrypts images into dm-crypt
//! volumes, and tracks how many running VMs share each decrypted image.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]

/// Configuration subsystem
pub mod config;

/// External command execution
pub mod execution;

/// Encrypted volumes and image containers
pub mod volume;

/// Image to VM reference counts
pub mod association;

/// Key protection subsystem
pub mod security;

/// Key service client
pub mod network;

/// Virtual machine descriptions
pub mod vm;

/// Prepare/start/stop orchestration
pub mod lifecycle;

/// Instance directory watcher
pub mod watcher;

/// RPC front and service wiring
pub mod service;

// Re-export common types
pub use config::{AgentConfig, ConfigManager};
pub use lifecycle::{LifecycleError, LifecycleMethod, Orchestrator};
pub use service::Service;
pub use vm::VmDescriptor;
