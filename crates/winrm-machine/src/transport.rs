//! Boundary to the remoting engine.
//!
//! The engine opens authenticated sessions, runs script text with bound
//! arguments, and closes sessions. Everything above this trait only
//! orchestrates; no wire protocol lives in this crate.

use crate::error::WinRmResult;
use crate::types::{PsValue, ScriptResult, SessionOptions, TargetIdentity};
use async_trait::async_trait;
use std::fmt;
use uuid::Uuid;

/// Opaque token for one open engine session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShellHandle {
    id: String,
    host: String,
}

impl ShellHandle {
    pub fn new(host: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            host: host.to_string(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

impl fmt::Display for ShellHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.host)
    }
}

/// A remoting engine capable of hosting sessions to a target machine.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Establish and authenticate a session.
    async fn open(
        &self,
        target: &TargetIdentity,
        options: &SessionOptions,
    ) -> WinRmResult<ShellHandle>;

    /// Run a script block inside the session with `args` bound as its
    /// positional arguments.
    ///
    /// `Ok` carries both output and the remote error stream; `Err` is reserved
    /// for transport failures where no result came back at all.
    async fn invoke(
        &self,
        handle: &ShellHandle,
        script: &str,
        args: &[PsValue],
    ) -> WinRmResult<ScriptResult>;

    /// Terminate the session. Called exactly once per opened handle.
    async fn close(&self, handle: ShellHandle) -> WinRmResult<()>;
}
