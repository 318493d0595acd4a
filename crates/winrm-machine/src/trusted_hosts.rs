//! Local WinRM client trusted-hosts list.
//!
//! The list lives in a [`TrustStore`], a single comma-joined string. The
//! production store is `WSMan:\localhost\Client\TrustedHosts`; a file-backed
//! store exists for machines without a WSMan provider.

use crate::error::{WinRmError, WinRmResult};
use crate::execution::ScriptInvoker;
use crate::pwsh::LocalPowerShell;
use async_trait::async_trait;
use log::{debug, info};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

// ─── Trusted Host List ───────────────────────────────────────────────────────

/// Ordered set of host identifiers without case-insensitive duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustedHostList {
    hosts: Vec<String>,
}

impl TrustedHostList {
    /// Parse a comma-joined store value. Blank entries are dropped.
    pub fn parse(value: &str) -> Self {
        let mut list = Self::default();
        for entry in value.split(',') {
            list.insert(entry);
        }
        list
    }

    /// Exact membership, ignoring case.
    pub fn contains(&self, host: &str) -> bool {
        let host = host.trim();
        self.hosts.iter().any(|h| h.eq_ignore_ascii_case(host))
    }

    /// Whether WinRM would accept `host`, honouring `*` and `*.suffix` entries.
    pub fn permits(&self, host: &str) -> bool {
        let host = host.trim().to_ascii_lowercase();
        self.hosts.iter().any(|entry| {
            let entry = entry.to_ascii_lowercase();
            if entry == "*" {
                return true;
            }
            match entry.strip_prefix('*') {
                Some(suffix) => host.len() > suffix.len() && host.ends_with(suffix),
                None => entry == host,
            }
        })
    }

    /// Append `host` unless already present or not a single entry. Returns
    /// whether the list changed.
    pub fn insert(&mut self, host: &str) -> bool {
        let host = host.trim();
        if host.is_empty() || host.contains(',') || self.contains(host) {
            return false;
        }
        self.hosts.push(host.to_string());
        true
    }

    /// Remove every case-insensitive match of `host`. Returns whether the list changed.
    pub fn remove(&mut self, host: &str) -> bool {
        let host = host.trim();
        let before = self.hosts.len();
        self.hosts.retain(|h| !h.eq_ignore_ascii_case(host));
        self.hosts.len() != before
    }

    /// Comma-joined value as persisted in the store.
    pub fn to_value(&self) -> String {
        self.hosts.join(",")
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.hosts.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn into_vec(self) -> Vec<String> {
        self.hosts
    }
}

impl fmt::Display for TrustedHostList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_value())
    }
}

// ─── Trust Store ─────────────────────────────────────────────────────────────

/// Persistent location of the trusted-hosts value.
#[async_trait]
pub trait TrustStore: Send + Sync {
    /// Current raw value, or `None` when the store does not exist yet.
    async fn get(&self) -> WinRmResult<Option<String>>;

    /// Overwrite the stored value.
    async fn set(&self, value: &str) -> WinRmResult<()>;

    /// Human-readable location for log lines and errors.
    fn location(&self) -> String;
}

/// Trusted hosts in the local WSMan client configuration.
pub struct WsManTrustStore {
    powershell: LocalPowerShell,
}

const WSMAN_TRUSTED_HOSTS: &str = r"WSMan:\localhost\Client\TrustedHosts";

const WSMAN_GET_SCRIPT: &str = r"$path = 'WSMan:\localhost\Client\TrustedHosts'
if (Test-Path -Path $path) { [string](Get-Item -Path $path).Value }";

const WSMAN_SET_SCRIPT: &str = r"Set-Item -Path 'WSMan:\localhost\Client\TrustedHosts' -Value ([string]$env:WINRM_MACHINE_TRUSTED_HOSTS) -Force";

const TRUSTED_HOSTS_ENV: &str = "WINRM_MACHINE_TRUSTED_HOSTS";

impl Default for WsManTrustStore {
    fn default() -> Self {
        Self::new(LocalPowerShell::default())
    }
}

impl WsManTrustStore {
    pub fn new(powershell: LocalPowerShell) -> Self {
        Self { powershell }
    }
}

#[async_trait]
impl TrustStore for WsManTrustStore {
    async fn get(&self) -> WinRmResult<Option<String>> {
        let output = ScriptInvoker::run_local(&self.powershell, WSMAN_GET_SCRIPT, &[]).await?;
        Ok(output.first().map(|v| v.to_string()))
    }

    async fn set(&self, value: &str) -> WinRmResult<()> {
        ScriptInvoker::run_local(
            &self.powershell,
            WSMAN_SET_SCRIPT,
            &[(TRUSTED_HOSTS_ENV, value)],
        )
        .await?;
        Ok(())
    }

    fn location(&self) -> String {
        WSMAN_TRUSTED_HOSTS.to_string()
    }
}

/// Trusted hosts kept in a plain text file.
#[derive(Debug, Clone)]
pub struct FileTrustStore {
    path: PathBuf,
}

impl FileTrustStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TrustStore for FileTrustStore {
    async fn get(&self) -> WinRmResult<Option<String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(Some(content.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(WinRmError::configuration(format!(
                "Failed to read trusted hosts from {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    async fn set(&self, value: &str) -> WinRmResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    WinRmError::configuration(format!(
                        "Failed to create {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }
        tokio::fs::write(&self.path, value).await.map_err(|e| {
            WinRmError::configuration(format!(
                "Failed to write trusted hosts to {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// Reads and edits the trusted-hosts list of one [`TrustStore`].
#[derive(Clone)]
pub struct TrustedHostRegistry {
    store: Arc<dyn TrustStore>,
}

impl TrustedHostRegistry {
    pub fn new(store: Arc<dyn TrustStore>) -> Self {
        Self { store }
    }

    /// Registry over the local WSMan client configuration.
    pub fn local() -> Self {
        Self::new(Arc::new(WsManTrustStore::default()))
    }

    pub fn location(&self) -> String {
        self.store.location()
    }

    /// Current list; a store that does not exist yet reads as empty.
    pub async fn get_hosts(&self) -> WinRmResult<TrustedHostList> {
        let value = self.store.get().await?;
        Ok(value
            .map(|v| TrustedHostList::parse(&v))
            .unwrap_or_default())
    }

    /// Add `host` if it is not already listed.
    pub async fn add_host(&self, host: &str) -> WinRmResult<()> {
        let host = validate_entry(host)?;
        let mut hosts = self.get_hosts().await?;
        if !hosts.insert(host) {
            debug!("{} already trusted in {}", host, self.store.location());
            return Ok(());
        }
        self.store.set(&hosts.to_value()).await?;
        info!("Added {} to trusted hosts in {}", host, self.store.location());
        Ok(())
    }

    /// Remove `host` if listed. An emptied list is persisted as an empty value.
    pub async fn remove_host(&self, host: &str) -> WinRmResult<()> {
        let host = validate_entry(host)?;
        let mut hosts = self.get_hosts().await?;
        if !hosts.remove(host) {
            debug!("{} not present in {}", host, self.store.location());
            return Ok(());
        }
        self.store.set(&hosts.to_value()).await?;
        info!("Removed {} from trusted hosts in {}", host, self.store.location());
        Ok(())
    }

    /// Whether WinRM would accept a connection to `host` under the current list.
    pub async fn is_trusted(&self, host: &str) -> WinRmResult<bool> {
        Ok(self.get_hosts().await?.permits(host))
    }
}

/// A store entry is one non-blank host without the list separator.
fn validate_entry(host: &str) -> WinRmResult<&str> {
    let host = host.trim();
    if host.is_empty() {
        return Err(WinRmError::configuration("Trusted host must not be empty"));
    }
    if host.contains(',') {
        return Err(WinRmError::configuration(format!(
            "Trusted host '{}' must not contain ','",
            host
        )));
    }
    Ok(host)
}
