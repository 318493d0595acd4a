//! Per-operation remote session lifecycle.
//!
//! Every public operation opens one session, does its work and closes it
//! again. Sessions are never pooled. When trusted-host management is on, the
//! target is added to the local trusted hosts for exactly that window.

use crate::error::{WinRmError, WinRmResult};
use crate::transport::{RemoteShell, ShellHandle};
use crate::trusted_hosts::TrustedHostRegistry;
use crate::types::{PsValue, ScriptResult, SessionState, TargetIdentity, TransferPolicy};
use log::{debug, info, warn};
use std::future::Future;
use std::sync::Arc;

// ─── Session Context ─────────────────────────────────────────────────────────

/// Cheap, clonable view of an open session handed to operation bodies.
#[derive(Clone)]
pub struct SessionContext {
    shell: Arc<dyn RemoteShell>,
    handle: ShellHandle,
}

impl SessionContext {
    pub fn host(&self) -> &str {
        self.handle.host()
    }

    pub fn handle(&self) -> &ShellHandle {
        &self.handle
    }

    pub(crate) async fn invoke(&self, script: &str, args: &[PsValue]) -> WinRmResult<ScriptResult> {
        self.shell.invoke(&self.handle, script, args).await
    }

    #[cfg(test)]
    pub(crate) async fn open_for_test(
        shell: Arc<crate::mock::MockRemoteShell>,
        host: &str,
    ) -> Self {
        let target = crate::mock::identity(host);
        let shell: Arc<dyn RemoteShell> = shell;
        let handle = shell
            .open(&target, &TransferPolicy::default().session_options())
            .await
            .unwrap();
        Self { shell, handle }
    }
}

// ─── Remote Session ──────────────────────────────────────────────────────────

/// One open session plus the trusted-host bookkeeping done to open it.
pub struct RemoteSession {
    shell: Arc<dyn RemoteShell>,
    registry: TrustedHostRegistry,
    handle: ShellHandle,
    auto_manage_trusted_hosts: bool,
    state: SessionState,
}

impl RemoteSession {
    /// Pass the trusted-host gate and open a session to `target`.
    pub async fn open(
        shell: Arc<dyn RemoteShell>,
        registry: TrustedHostRegistry,
        target: &TargetIdentity,
        policy: &TransferPolicy,
    ) -> WinRmResult<Self> {
        let host = target.host();
        debug!("Session to {}: {:?} -> {:?}", host, SessionState::Closed, SessionState::Opening);

        if policy.auto_manage_trusted_hosts {
            registry.add_host(host).await?;
        }

        let opened = match registry.is_trusted(host).await {
            Ok(true) => {
                shell
                    .open(target, &policy.session_options())
                    .await
            }
            Ok(false) => Err(WinRmError::trusted_host_missing(host)),
            Err(e) => Err(e),
        };

        let handle = match opened {
            Ok(handle) => handle,
            Err(e) => {
                if policy.auto_manage_trusted_hosts {
                    if let Err(cleanup) = registry.remove_host(host).await {
                        warn!(
                            "Failed to remove {} from trusted hosts after open failure: {}",
                            host, cleanup
                        );
                    }
                }
                warn!("Failed to open session to {}: {}", host, e);
                return Err(e);
            }
        };

        info!("Session {} opened", handle);
        Ok(Self {
            shell,
            registry,
            handle,
            auto_manage_trusted_hosts: policy.auto_manage_trusted_hosts,
            state: SessionState::Open,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn host(&self) -> &str {
        self.handle.host()
    }

    pub fn context(&self) -> SessionContext {
        SessionContext {
            shell: Arc::clone(&self.shell),
            handle: self.handle.clone(),
        }
    }

    /// Close the session, then drop the trusted-host entry if it was managed.
    ///
    /// Both steps are attempted; the first failure is returned.
    pub async fn close(mut self) -> WinRmResult<()> {
        self.state = SessionState::Closing;
        let host = self.handle.host().to_string();
        let label = self.handle.to_string();

        let closed = self.shell.close(self.handle).await;
        match &closed {
            Ok(()) => info!("Session {} closed", label),
            Err(e) => warn!("Failed to close session {}: {}", label, e),
        }

        let untrusted = if self.auto_manage_trusted_hosts {
            self.registry.remove_host(&host).await
        } else {
            Ok(())
        };
        if let Err(e) = &untrusted {
            warn!("Failed to remove {} from trusted hosts: {}", host, e);
        }

        debug!("Session to {}: {:?} -> {:?}", host, SessionState::Closing, SessionState::Closed);
        closed.and(untrusted)
    }
}

// ─── Bracket ─────────────────────────────────────────────────────────────────

/// Open, work, always close.
pub struct SessionBracket<'a> {
    shell: &'a Arc<dyn RemoteShell>,
    registry: &'a TrustedHostRegistry,
    target: &'a TargetIdentity,
    policy: &'a TransferPolicy,
}

impl<'a> SessionBracket<'a> {
    pub fn new(
        shell: &'a Arc<dyn RemoteShell>,
        registry: &'a TrustedHostRegistry,
        target: &'a TargetIdentity,
        policy: &'a TransferPolicy,
    ) -> Self {
        Self {
            shell,
            registry,
            target,
            policy,
        }
    }

    /// Run `work` inside a fresh session. A close failure after a failed
    /// body is logged and the body's error is returned.
    pub async fn run<T, F, Fut>(&self, work: F) -> WinRmResult<T>
    where
        F: FnOnce(SessionContext) -> Fut,
        Fut: Future<Output = WinRmResult<T>>,
    {
        let session = RemoteSession::open(
            Arc::clone(self.shell),
            self.registry.clone(),
            self.target,
            self.policy,
        )
        .await?;

        let result = work(session.context()).await;
        let closed = session.close().await;

        match (result, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(close_err)) => Err(close_err),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(close_err)) => {
                warn!(
                    "Ignoring close failure on {} after earlier error: {}",
                    self.target.host(),
                    close_err
                );
                Err(e)
            }
        }
    }
}
