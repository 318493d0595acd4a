//! Error types for remote machine management.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Host tag used for errors raised by commands run on the controlling machine.
pub const LOCALHOST: &str = "localhost";

/// Error kinds for remote machine operations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum WinRmErrorKind {
    /// The target host is not in the local trusted-hosts list.
    TrustedHostMissing,
    /// The remote (or local administrative) invocation reported errors,
    /// or the session could not be established.
    RemoteExecution,
    /// Post-transfer verification found the written file differs from the payload.
    ChecksumMismatch,
    /// Invalid sizing or identity, or an unusable trust store.
    Configuration,
}

/// Remote machine management error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WinRmError {
    pub kind: WinRmErrorKind,
    pub message: String,
    /// Host the failing operation targeted (`localhost` for local commands).
    #[serde(default)]
    pub host: Option<String>,
    /// Script text that was being attempted, if any.
    #[serde(default)]
    pub script: Option<String>,
    /// Individual error descriptions reported by the remote side.
    #[serde(default)]
    pub details: Vec<String>,
}

impl fmt::Display for WinRmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.message)
    }
}

impl std::error::Error for WinRmError {}

impl WinRmError {
    pub fn new(kind: WinRmErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            host: None,
            script: None,
            details: Vec::new(),
        }
    }

    pub fn trusted_host_missing(host: &str) -> Self {
        let mut err = Self::new(
            WinRmErrorKind::TrustedHostMissing,
            format!(
                "Host '{}' is not in the local trusted hosts list; add it or enable automatic trusted host management",
                host
            ),
        );
        err.host = Some(host.to_string());
        err
    }

    /// A script ran but the error stream was non-empty.
    pub fn remote_execution(host: &str, script: &str, details: Vec<String>) -> Self {
        let mut err = Self::new(
            WinRmErrorKind::RemoteExecution,
            format!(
                "Failed to run script ({}) on {} got errors: {}",
                script,
                host,
                details.join("\n")
            ),
        );
        err.host = Some(host.to_string());
        err.script = Some(script.to_string());
        err.details = details;
        err
    }

    /// The session could not be opened, or the transport broke mid-call.
    pub fn connection(host: &str, cause: impl Into<String>) -> Self {
        let cause = cause.into();
        let mut err = Self::new(
            WinRmErrorKind::RemoteExecution,
            format!("Remote session to {} failed: {}", host, cause),
        );
        err.host = Some(host.to_string());
        err.details = vec![cause];
        err
    }

    /// A command on the controlling machine failed before producing a result.
    pub fn local(script: &str, cause: impl Into<String>) -> Self {
        let cause = cause.into();
        let mut err = Self::new(
            WinRmErrorKind::RemoteExecution,
            format!("Failed to run script ({}) on {}: {}", script, LOCALHOST, cause),
        );
        err.host = Some(LOCALHOST.to_string());
        err.script = Some(script.to_string());
        err.details = vec![cause];
        err
    }

    pub fn checksum_mismatch(host: &str, path: &str, expected: &str, details: Vec<String>) -> Self {
        let mut err = Self::new(
            WinRmErrorKind::ChecksumMismatch,
            format!(
                "Checksum verification of '{}' on {} failed (expected sha256 {}): {}",
                path,
                host,
                expected,
                details.join("\n")
            ),
        );
        err.host = Some(host.to_string());
        err.details = details;
        err
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(WinRmErrorKind::Configuration, message)
    }

    /// True for remote execution failures, including checksum mismatches.
    pub fn is_remote_execution(&self) -> bool {
        matches!(
            self.kind,
            WinRmErrorKind::RemoteExecution | WinRmErrorKind::ChecksumMismatch
        )
    }
}

/// Convert a `WinRmError` into a plain `String` for command-style returns.
impl From<WinRmError> for String {
    fn from(e: WinRmError) -> String {
        e.to_string()
    }
}

/// Convenience alias.
pub type WinRmResult<T> = Result<T, WinRmError>;
