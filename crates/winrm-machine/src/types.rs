use crate::error::{WinRmError, WinRmResult};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

// ─── Target Identity ─────────────────────────────────────────────────────────

/// Host and credentials for the one machine a manager administers.
///
/// The password is held as a [`SecretString`]: it is zeroed when the identity
/// is dropped and prints as redacted in `Debug` output.
#[derive(Debug)]
pub struct TargetIdentity {
    host: String,
    username: String,
    password: SecretString,
}

impl TargetIdentity {
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        password: SecretString,
    ) -> WinRmResult<Self> {
        let host = host.into().trim().to_string();
        let username = username.into();
        if host.is_empty() {
            return Err(WinRmError::configuration("Target host must not be empty"));
        }
        if host.contains(',') {
            return Err(WinRmError::configuration(format!(
                "Target host '{}' must not contain a comma",
                host
            )));
        }
        if username.trim().is_empty() {
            return Err(WinRmError::configuration("Username must not be empty"));
        }
        Ok(Self {
            host,
            username,
            password,
        })
    }

    /// Host name or IP address of the target machine.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &SecretString {
        &self.password
    }
}

// ─── Transfer Policy ─────────────────────────────────────────────────────────

/// Trusted-host handling, upload chunking and session timeouts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransferPolicy {
    /// Add the target to the local trusted hosts before each operation and
    /// remove it afterwards.
    #[serde(default)]
    pub auto_manage_trusted_hosts: bool,
    /// Payloads up to this size are sent in a single write.
    #[serde(default = "default_chunk_threshold")]
    pub chunk_threshold_bytes: usize,
    /// Size of each write once a payload exceeds the threshold.
    #[serde(default = "default_chunk_size")]
    pub chunk_size_bytes: usize,
    /// Remote session idle timeout in seconds (default: 1200, i.e. 20 minutes)
    #[serde(default = "default_idle_timeout")]
    pub session_idle_timeout_sec: u64,
    /// Remote operation timeout in seconds (0 = unbounded)
    #[serde(default)]
    pub session_operation_timeout_sec: u64,
}

fn default_chunk_threshold() -> usize {
    150_000
}
fn default_chunk_size() -> usize {
    100_000
}
fn default_idle_timeout() -> u64 {
    20 * 60
}

impl Default for TransferPolicy {
    fn default() -> Self {
        Self {
            auto_manage_trusted_hosts: false,
            chunk_threshold_bytes: default_chunk_threshold(),
            chunk_size_bytes: default_chunk_size(),
            session_idle_timeout_sec: default_idle_timeout(),
            session_operation_timeout_sec: 0,
        }
    }
}

impl TransferPolicy {
    /// Session options negotiated when a session is opened.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            idle_timeout_sec: self.session_idle_timeout_sec,
            operation_timeout_sec: self.session_operation_timeout_sec,
        }
    }
}

/// Options passed to the remoting engine when a session is opened.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionOptions {
    pub idle_timeout_sec: u64,
    /// 0 means the engine applies no operation timeout.
    pub operation_timeout_sec: u64,
}

impl SessionOptions {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_sec)
    }

    pub fn operation_timeout(&self) -> Option<Duration> {
        match self.operation_timeout_sec {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

// ─── Session State ───────────────────────────────────────────────────────────

/// Lifecycle of a [`RemoteSession`](crate::session::RemoteSession).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Closed,
    Opening,
    Open,
    Closing,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::Closed
    }
}

// ─── Values ──────────────────────────────────────────────────────────────────

/// A value passed to or returned from a remote script.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum PsValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<PsValue>),
    Record(BTreeMap<String, PsValue>),
}

impl Default for PsValue {
    fn default() -> Self {
        Self::Null
    }
}

impl PsValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(n) => Some(*n as f64),
            Self::Float(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[PsValue]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Look up a property of a record value.
    pub fn get(&self, key: &str) -> Option<&PsValue> {
        match self {
            Self::Record(map) => map.get(key),
            _ => None,
        }
    }
}

/// Renders values the way PowerShell prints them in a string context.
impl fmt::Display for PsValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Bool(true) => f.write_str("True"),
            Self::Bool(false) => f.write_str("False"),
            Self::Int(n) => write!(f, "{}", n),
            Self::Float(n) => write!(f, "{}", n),
            Self::String(s) => f.write_str(s),
            Self::Bytes(b) => f.write_str(&hex::encode(b)),
            Self::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{}", item)?;
                }
                Ok(())
            }
            Self::Record(map) => {
                f.write_str("@{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str("; ")?;
                    }
                    write!(f, "{}={}", k, v)?;
                }
                f.write_str("}")
            }
        }
    }
}

impl From<&str> for PsValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for PsValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<bool> for PsValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i32> for PsValue {
    fn from(n: i32) -> Self {
        Self::Int(n as i64)
    }
}

impl From<i64> for PsValue {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<f64> for PsValue {
    fn from(n: f64) -> Self {
        Self::Float(n)
    }
}

impl From<Vec<u8>> for PsValue {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(b)
    }
}

impl From<&[u8]> for PsValue {
    fn from(b: &[u8]) -> Self {
        Self::Bytes(b.to_vec())
    }
}

impl<T: Into<PsValue>> From<Option<T>> for PsValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

// ─── Script Results ──────────────────────────────────────────────────────────

/// A structured error record from a PowerShell error stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PsErrorRecord {
    /// Exception type name (e.g. `System.IO.IOException`)
    #[serde(default)]
    pub exception_type: Option<String>,
    /// Exception message text
    #[serde(default)]
    pub message: Option<String>,
    /// `ErrorDetails.Message`, when the cmdlet supplied one
    #[serde(default)]
    pub error_details: Option<String>,
    #[serde(default)]
    pub fully_qualified_error_id: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub target_object: Option<String>,
}

const NO_ERROR_DETAILS: &str = "<no error details>";

impl PsErrorRecord {
    pub fn from_message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Default::default()
        }
    }

    /// Detail message if present, else exception text, else a placeholder.
    pub fn description(&self) -> String {
        [&self.error_details, &self.message]
            .into_iter()
            .flatten()
            .map(|s| s.trim())
            .find(|s| !s.is_empty())
            .unwrap_or(NO_ERROR_DETAILS)
            .to_string()
    }
}

/// Everything one invocation produced: output values and the error stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScriptResult {
    #[serde(default)]
    pub output: Vec<PsValue>,
    #[serde(default)]
    pub errors: Vec<PsErrorRecord>,
}

impl ScriptResult {
    pub fn from_output(output: Vec<PsValue>) -> Self {
        Self {
            output,
            errors: Vec::new(),
        }
    }

    pub fn from_errors(errors: Vec<PsErrorRecord>) -> Self {
        Self {
            output: Vec::new(),
            errors,
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

// ─── Transfer State ──────────────────────────────────────────────────────────

/// Progress of a single upload; lives only for one `send_file` call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransferState {
    pub target_path: String,
    pub total_bytes: u64,
    pub bytes_sent: u64,
    pub append_mode: bool,
    /// Lowercase hex SHA-256 of the payload
    pub expected_checksum: String,
}

impl TransferState {
    pub fn percent_complete(&self) -> f64 {
        if self.total_bytes == 0 {
            100.0
        } else {
            (self.bytes_sent as f64 / self.total_bytes as f64) * 100.0
        }
    }
}
