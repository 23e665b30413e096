// src/lifecycle/report.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::vm::VmDescriptor;

/// Attestation of what a VM was launched from, sent to the workload service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmTrustReport {
    /// Instance UUID
    pub instance_uuid: String,

    /// Base image UUID
    pub image_uuid: String,

    /// Flavor the key was released under
    pub flavor_id: Option<String>,

    /// Hardware UUID of this host
    pub hardware_uuid: String,

    /// Host name
    pub host_name: String,

    /// SHA-256 of the decrypted image, when it was decrypted by this call
    pub image_digest: Option<String>,

    /// Whether the image was encrypted
    pub encryption_required: bool,

    /// Report creation time
    pub created_at: DateTime<Utc>,
}

impl VmTrustReport {
    /// Builds a report for `descriptor`
    pub fn new(
        descriptor: &VmDescriptor,
        hardware_uuid: &str,
        flavor_id: Option<String>,
        image_digest: Option<String>,
    ) -> Self {
        let host_name = hostname::get()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());

        Self {
            instance_uuid: descriptor.instance_uuid.clone(),
            image_uuid: descriptor.image_uuid.clone(),
            flavor_id,
            hardware_uuid: hardware_uuid.to_string(),
            host_name,
            image_digest,
            encryption_required: true,
            created_at: Utc::now(),
        }
    }

    /// JSON body posted to the workload service
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Lower-case hex SHA-256 of `data`
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}
