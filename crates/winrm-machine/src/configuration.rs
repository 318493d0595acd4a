//! Serializable manager configuration.
//!
//! The password is never part of the configuration; it is supplied when the
//! identity is built.

use crate::error::{WinRmError, WinRmResult};
use crate::types::{TargetIdentity, TransferPolicy};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Target host, user name and transfer policy for one [`MachineManager`](crate::MachineManager).
///
/// ```json
/// {
///   "host": "10.0.0.15",
///   "username": "Administrator",
///   "autoManageTrustedHosts": true,
///   "chunkSizeBytes": 65536
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagerConfig {
    pub host: String,
    pub username: String,
    #[serde(flatten)]
    pub policy: TransferPolicy,
}

impl ManagerConfig {
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            policy: TransferPolicy::default(),
        }
    }

    pub fn from_json_str(json: &str) -> WinRmResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| WinRmError::configuration(format!("Invalid manager configuration: {}", e)))
    }

    pub async fn from_json_file(path: impl AsRef<Path>) -> WinRmResult<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            WinRmError::configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&content)
    }

    /// Build the target identity, validating host and user name.
    pub fn identity(&self, password: SecretString) -> WinRmResult<TargetIdentity> {
        TargetIdentity::new(self.host.clone(), self.username.clone(), password)
    }
}
