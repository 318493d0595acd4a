//! Script invocation and error-stream aggregation.
//!
//! Positional arguments are handed to the engine as an ordered list that the
//! engine binds to the session-scoped `$scriptBlockArgs` variable; they are
//! never spliced into the script text.

use crate::error::{WinRmError, WinRmResult, LOCALHOST};
use crate::pwsh::{truncate_str, LocalPowerShell};
use crate::session::SessionContext;
use crate::types::{PsValue, ScriptResult};
use log::{debug, warn};

/// Turn an invocation result into its output, or a `RemoteExecution` error
/// when the error stream is non-empty.
pub fn check_result(host: &str, script: &str, result: ScriptResult) -> WinRmResult<Vec<PsValue>> {
    if result.has_errors() {
        let details: Vec<String> = result.errors.iter().map(|e| e.description()).collect();
        warn!(
            "Script on {} reported {} error(s): {}",
            host,
            details.len(),
            truncate_str(&details.join(" | "), 500)
        );
        return Err(WinRmError::remote_execution(host, script, details));
    }
    Ok(result.output)
}

// ─── Script Invoker ──────────────────────────────────────────────────────────

/// Runs scripts inside an open session, or locally for administrative commands.
pub struct ScriptInvoker;

impl ScriptInvoker {
    /// Run `script` in the session with `args` as its positional arguments.
    pub async fn run(
        session: &SessionContext,
        script: &str,
        args: &[PsValue],
    ) -> WinRmResult<Vec<PsValue>> {
        debug!(
            "Invoking on {} ({} arg(s)): {}",
            session.host(),
            args.len(),
            truncate_str(script, 200)
        );
        let result = session.invoke(script, args).await?;
        let output = check_result(session.host(), script, result)?;
        debug!("Invocation on {} returned {} value(s)", session.host(), output.len());
        Ok(output)
    }

    /// Run an administrative script on the controlling machine. Errors are
    /// tagged with host `localhost`.
    pub async fn run_local(
        powershell: &LocalPowerShell,
        script: &str,
        env: &[(&str, &str)],
    ) -> WinRmResult<Vec<PsValue>> {
        let result = powershell.run(script, env).await?;
        check_result(LOCALHOST, script, result)
    }
}

// ─── Script Templates ────────────────────────────────────────────────────────

/// Pre-built script blocks for machine-level operations.
pub struct ScriptTemplates;

impl ScriptTemplates {
    /// Restart-Computer, with `-Force` when requested.
    pub fn restart_computer(force: bool) -> String {
        let force_add_in = if force { " -Force" } else { "" };
        format!("{{ Restart-Computer{} }}", force_add_in)
    }
}
