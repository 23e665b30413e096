// src/service/protocol.rs

//! Wire format between the hypervisor hook and the daemon: one JSON object
//! per line in each direction.

use serde::{Deserialize, Serialize};

use crate::lifecycle::LifecycleMethod;

/// Hook request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleRequest {
    /// Operation to run
    pub method: LifecycleMethod,

    /// Domain definition as handed to the hook
    pub domain_xml: String,
}

/// Daemon reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleReply {
    /// Whether the operation succeeded
    pub result: bool,

    /// Failure reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LifecycleReply {
    /// Successful reply
    pub fn success() -> Self {
        Self {
            result: true,
            error: None,
        }
    }

    /// Failed reply carrying `error`
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            result: false,
            error: Some(error.into()),
        }
    }

    /// Process exit code for the hook
    pub fn exit_code(&self) -> i32 {
        if self.result {
            0
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_uses_lowercase_method_names() {
        let request: LifecycleRequest =
            serde_json::from_str(r#"{"method":"prepare","domain_xml":"<domain/>"}"#).unwrap();
        assert_eq!(request.method, LifecycleMethod::Prepare);

        assert!(serde_json::from_str::<LifecycleRequest>(r#"{"method":"migrate","domain_xml":""}"#).is_err());
    }

    #[test]
    fn success_reply_omits_error() {
        assert_eq!(serde_json::to_string(&LifecycleReply::success()).unwrap(), r#"{"result":true}"#);

        let failure = LifecycleReply::failure("Entitlement denied");
        assert_eq!(failure.exit_code(), 1);
        let parsed: LifecycleReply = serde_json::from_str(&serde_json::to_string(&failure).unwrap()).unwrap();
        assert_eq!(parsed, failure);
    }
}
