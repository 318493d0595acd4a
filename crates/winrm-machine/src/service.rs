//! Remote machine facade.
//!
//! A [`MachineManager`] administers exactly one Windows host. Each public
//! operation runs in its own session; calls on one manager are serialized.

use crate::configuration::ManagerConfig;
use crate::copy::FileTransferEngine;
use crate::error::{WinRmError, WinRmResult};
use crate::execution::{ScriptInvoker, ScriptTemplates};
use crate::pwsh::PwshRemoteShell;
use crate::session::SessionBracket;
use crate::transport::RemoteShell;
use crate::trusted_hosts::TrustedHostRegistry;
use crate::types::{PsValue, TargetIdentity, TransferPolicy, TransferState};
use log::info;
use secrecy::SecretString;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Shared handle for embedding applications.
pub type MachineManagerState = Arc<MachineManager>;

/// Administers one remote Windows machine.
pub struct MachineManager {
    identity: TargetIdentity,
    policy: TransferPolicy,
    shell: Arc<dyn RemoteShell>,
    registry: TrustedHostRegistry,
    op_lock: Mutex<()>,
}

impl MachineManager {
    /// Manager using the local PowerShell remoting client and WSMan trust store.
    pub fn new(identity: TargetIdentity, policy: TransferPolicy) -> Self {
        Self::with_backends(
            identity,
            policy,
            Arc::new(PwshRemoteShell::default()),
            TrustedHostRegistry::local(),
        )
    }

    pub fn from_config(config: &ManagerConfig, password: SecretString) -> WinRmResult<Self> {
        let identity = config.identity(password)?;
        Ok(Self::new(identity, config.policy.clone()))
    }

    pub fn with_backends(
        identity: TargetIdentity,
        policy: TransferPolicy,
        shell: Arc<dyn RemoteShell>,
        registry: TrustedHostRegistry,
    ) -> Self {
        Self {
            identity,
            policy,
            shell,
            registry,
            op_lock: Mutex::new(()),
        }
    }

    pub fn identity(&self) -> &TargetIdentity {
        &self.identity
    }

    pub fn host(&self) -> &str {
        self.identity.host()
    }

    pub fn policy(&self) -> &TransferPolicy {
        &self.policy
    }

    /// Registry the trusted-host gate consults.
    pub fn trusted_hosts(&self) -> &TrustedHostRegistry {
        &self.registry
    }

    fn bracket(&self) -> SessionBracket<'_> {
        SessionBracket::new(&self.shell, &self.registry, &self.identity, &self.policy)
    }

    // ─── Operations ──────────────────────────────────────────────────

    /// Restart the machine, forcibly when `force` is set.
    pub async fn reboot(&self, force: bool) -> WinRmResult<()> {
        let _guard = self.op_lock.lock().await;
        info!("Rebooting {} (force: {})", self.host(), force);
        let script = ScriptTemplates::restart_computer(force);
        self.bracket()
            .run(|ctx| async move {
                ScriptInvoker::run(&ctx, &script, &[]).await?;
                Ok(())
            })
            .await
    }

    /// Upload `payload` to `path` and verify its checksum.
    ///
    /// Without `appended` the call fails if `path` already exists.
    pub async fn send_file(
        &self,
        path: &str,
        payload: &[u8],
        appended: bool,
    ) -> WinRmResult<TransferState> {
        let _guard = self.op_lock.lock().await;
        let engine = FileTransferEngine::new(&self.policy);
        engine.plan(payload.len())?;
        self.bracket()
            .run(|ctx| async move { engine.send(&ctx, path, payload, appended).await })
            .await
    }

    /// Read `local_path` and upload it to `remote_path`.
    pub async fn send_file_from_path(
        &self,
        local_path: impl AsRef<Path>,
        remote_path: &str,
        appended: bool,
    ) -> WinRmResult<TransferState> {
        let local_path = local_path.as_ref();
        let payload = tokio::fs::read(local_path).await.map_err(|e| {
            WinRmError::configuration(format!(
                "Failed to read local file '{}': {}",
                local_path.display(),
                e
            ))
        })?;
        self.send_file(remote_path, &payload, appended).await
    }

    /// Run a script block with positional arguments and return its output.
    pub async fn run_script(&self, script: &str, args: &[PsValue]) -> WinRmResult<Vec<PsValue>> {
        let _guard = self.op_lock.lock().await;
        self.bracket()
            .run(|ctx| async move { ScriptInvoker::run(&ctx, script, args).await })
            .await
    }

    /// Run a script and render each output value on its own line.
    pub async fn run_script_text(&self, script: &str, args: &[PsValue]) -> WinRmResult<String> {
        let output = self.run_script(script, args).await?;
        Ok(output
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n"))
    }

    // ─── Local Trusted Hosts ─────────────────────────────────────────

    pub async fn add_trusted_host(host: &str) -> WinRmResult<()> {
        TrustedHostRegistry::local().add_host(host).await
    }

    pub async fn remove_trusted_host(host: &str) -> WinRmResult<()> {
        TrustedHostRegistry::local().remove_host(host).await
    }

    pub async fn get_trusted_hosts() -> WinRmResult<Vec<String>> {
        Ok(TrustedHostRegistry::local().get_hosts().await?.into_vec())
    }
}
