//! # winrm-machine – Single-Host Windows Administration
//!
//! Administers one remote Windows machine over PowerShell Remoting from a
//! controlling host. Provides:
//!
//! - **Scripts** – run script blocks with positional arguments bound in the
//!   session, never spliced into the script text; remote errors are raised once
//!   with every reported detail
//! - **Reboot** – `Restart-Computer`, optionally forced
//! - **File upload** – existence guard, chunked writes for large payloads and a
//!   SHA-256 check of the written file
//! - **Trusted hosts** – read and edit the local WinRM client trusted-hosts list,
//!   optionally scoped to a single operation
//!
//! Every operation opens its own session and closes it on every exit path.
//! The remoting engine sits behind [`RemoteShell`]; the default
//! [`PwshRemoteShell`] drives the locally installed PowerShell client.

pub mod checksum;
pub mod configuration;
pub mod copy;
pub mod error;
pub mod execution;
pub mod pwsh;
pub mod serialization;
pub mod service;
pub mod session;
pub mod transport;
pub mod trusted_hosts;
pub mod types;

#[cfg(test)]
mod mock;

pub use configuration::ManagerConfig;
pub use error::{WinRmError, WinRmErrorKind, WinRmResult};
pub use pwsh::{LocalPowerShell, PwshRemoteShell};
pub use service::{MachineManager, MachineManagerState};
pub use transport::{RemoteShell, ShellHandle};
pub use trusted_hosts::{FileTrustStore, TrustStore, TrustedHostList, TrustedHostRegistry, WsManTrustStore};
pub use types::{PsErrorRecord, PsValue, ScriptResult, TargetIdentity, TransferPolicy, TransferState};
