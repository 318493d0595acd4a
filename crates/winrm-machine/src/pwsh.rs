//! PowerShell client processes on the controlling machine.
//!
//! [`LocalPowerShell`] runs one-shot administrative commands locally.
//! [`PwshRemoteShell`] implements [`RemoteShell`] by keeping one PowerShell
//! process per session that owns a `New-PSSession` and runs `Invoke-Command`
//! for every request it reads from stdin.

use crate::error::{WinRmError, WinRmResult};
use crate::serialization::{self, WireRequest, WireResponse, PS_WIRE_FUNCTIONS};
use crate::transport::{RemoteShell, ShellHandle};
use crate::types::{PsValue, ScriptResult, SessionOptions, TargetIdentity};
use async_trait::async_trait;
use base64::Engine;
use log::{debug, info, trace, warn};
use secrecy::ExposeSecret;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use zeroize::Zeroizing;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

fn default_powershell_path() -> String {
    if cfg!(windows) {
        "powershell.exe".to_string()
    } else {
        "pwsh".to_string()
    }
}

/// Encode a script for `-EncodedCommand` (base64 of UTF-16LE).
fn encode_command(script: &str) -> String {
    let utf16: Vec<u8> = script
        .encode_utf16()
        .flat_map(|unit| unit.to_le_bytes())
        .collect();
    base64::engine::general_purpose::STANDARD.encode(utf16)
}

fn spawn_powershell(
    path: &str,
    script: &str,
    env: &[(&str, &str)],
    stderr: Stdio,
) -> std::io::Result<Child> {
    let mut cmd = Command::new(path);
    cmd.args([
        "-NoProfile",
        "-NonInteractive",
        "-ExecutionPolicy",
        "Bypass",
        "-EncodedCommand",
        &encode_command(script),
    ]);
    for (key, value) in env {
        cmd.env(key, value);
    }
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(stderr)
        .kill_on_drop(true)
        .spawn()
}

fn parse_response_line(line: &str) -> Result<ScriptResult, String> {
    let body = serialization::reply_body(line)
        .ok_or_else(|| format!("Untagged response from PowerShell: {}", truncate_str(line, 120)))?;
    let response: WireResponse = serde_json::from_str(body.trim())
        .map_err(|e| format!("Malformed response from PowerShell: {}", e))?;
    Ok(ScriptResult {
        output: response
            .output
            .into_iter()
            .map(serialization::from_wire)
            .collect(),
        errors: response.errors,
    })
}

// ─── Local one-shot commands ─────────────────────────────────────────────────

const LOCAL_WRAPPER: &str = r#"
$ErrorActionPreference = 'Stop'
$__out = @()
$__errs = @()
try {
    $__out = @(& {
__BODY__
    } 3>$null 4>$null 5>$null 6>$null)
} catch {
    $__errs += $_
}
Write-WireResponse $__out $__errs
"#;

/// Runs administrative scripts on the controlling machine.
#[derive(Debug, Clone)]
pub struct LocalPowerShell {
    powershell_path: String,
    timeout: Duration,
}

impl Default for LocalPowerShell {
    fn default() -> Self {
        Self {
            powershell_path: default_powershell_path(),
            timeout: Duration::from_secs(60),
        }
    }
}

impl LocalPowerShell {
    pub fn new(powershell_path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            powershell_path: powershell_path.into(),
            timeout,
        }
    }

    /// Run `script` locally. Data the script needs is passed through `env`
    /// rather than spliced into the script text.
    pub async fn run(&self, script: &str, env: &[(&str, &str)]) -> WinRmResult<ScriptResult> {
        let full_script = format!(
            "{}\n{}",
            PS_WIRE_FUNCTIONS,
            LOCAL_WRAPPER.replace("__BODY__", script)
        );
        debug!("Local PS exec: {}", truncate_str(script, 200));

        let mut child = spawn_powershell(&self.powershell_path, &full_script, env, Stdio::piped())
            .map_err(|e| WinRmError::local(script, format!("Failed to spawn PowerShell: {}", e)))?;
        // Nothing is sent on stdin; close it so the child does not wait on it.
        drop(child.stdin.take());

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                WinRmError::local(
                    script,
                    format!("PowerShell timed out after {}s", self.timeout.as_secs()),
                )
            })?
            .map_err(|e| WinRmError::local(script, format!("PowerShell process failed: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        trace!("Local PS stdout ({} bytes): {}", stdout.len(), truncate_str(&stdout, 300));

        match stdout.lines().rev().find(|l| serialization::reply_body(l).is_some()) {
            Some(line) => parse_response_line(line).map_err(|e| WinRmError::local(script, e)),
            None => {
                let cause = if stderr.trim().is_empty() {
                    format!(
                        "PowerShell exited with code {} and no output",
                        output.status.code().unwrap_or(-1)
                    )
                } else {
                    stderr.trim().to_string()
                };
                Err(WinRmError::local(script, cause))
            }
        }
    }
}

// ─── Session bridge ──────────────────────────────────────────────────────────

const BRIDGE_SCRIPT: &str = r#"
$ErrorActionPreference = 'Stop'

function ConvertTo-ScriptBlock([string]$text) {
    $tokens = $null
    $parseErrors = $null
    $ast = [System.Management.Automation.Language.Parser]::ParseInput($text, [ref]$tokens, [ref]$parseErrors)
    if ($parseErrors.Count -gt 0) { throw $parseErrors[0].Message }
    $statements = $ast.EndBlock.Statements
    if ($null -eq $ast.ParamBlock -and $statements.Count -eq 1) {
        $pipeline = $statements[0]
        if ($pipeline -is [System.Management.Automation.Language.PipelineAst] -and $pipeline.PipelineElements.Count -eq 1) {
            $expr = $pipeline.PipelineElements[0].Expression
            if ($expr -is [System.Management.Automation.Language.ScriptBlockExpressionAst]) {
                return $expr.ScriptBlock.GetScriptBlock()
            }
        }
    }
    return [scriptblock]::Create($text)
}

$invokeCommandSession = $null
while ($true) {
    $line = [Console]::In.ReadLine()
    if ($null -eq $line) { break }
    if ($line.Trim().Length -eq 0) { continue }
    $req = $line | ConvertFrom-Json
    $line = $null
    switch ($req.op) {
        'open' {
            try {
                $secure = ConvertTo-SecureString -String $req.password -AsPlainText -Force
                $req.password = $null
                $credential = New-Object System.Management.Automation.PSCredential($req.username, $secure)
                $options = New-PSSessionOption -OperationTimeout $req.operationTimeoutMs -IdleTimeout $req.idleTimeoutMs
                $invokeCommandSession = New-PSSession -ComputerName $req.host -Credential $credential -SessionOption $options 3>$null 4>$null 5>$null 6>$null
                Write-WireResponse @() @()
            } catch {
                Write-WireResponse @() @($_)
            }
        }
        'invoke' {
            $out = @()
            $errs = @()
            try {
                $sc = ConvertTo-ScriptBlock $req.script
                $scriptBlockArgs = @(foreach ($a in @($req.args)) { ,(ConvertFrom-WireValue $a) })
                if ($scriptBlockArgs.Count -gt 0) {
                    $out = @(Invoke-Command -Session $invokeCommandSession -ScriptBlock $sc -ArgumentList $scriptBlockArgs -ErrorVariable +errs -ErrorAction SilentlyContinue 3>$null 4>$null 5>$null 6>$null)
                } else {
                    $out = @(Invoke-Command -Session $invokeCommandSession -ScriptBlock $sc -ErrorVariable +errs -ErrorAction SilentlyContinue 3>$null 4>$null 5>$null 6>$null)
                }
            } catch {
                $errs += $_
            }
            Write-WireResponse $out $errs
        }
        'close' {
            if ($null -ne $invokeCommandSession) {
                Remove-PSSession -Session $invokeCommandSession -ErrorAction SilentlyContinue
                $invokeCommandSession = $null
            }
            Write-WireResponse @() @()
            exit 0
        }
    }
}
if ($null -ne $invokeCommandSession) {
    Remove-PSSession -Session $invokeCommandSession -ErrorAction SilentlyContinue
}
"#;

/// One PowerShell process holding one remote session.
struct Bridge {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl Bridge {
    fn spawn(powershell_path: &str) -> std::io::Result<Self> {
        let script = format!("{}\n{}", PS_WIRE_FUNCTIONS, BRIDGE_SCRIPT);
        // The bridge reports everything through stdout.
        let mut child = spawn_powershell(powershell_path, &script, &[], Stdio::null())?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("PowerShell stdin was not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("PowerShell stdout was not captured"))?;
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        })
    }

    async fn exchange(&mut self, line: &str) -> Result<ScriptResult, String> {
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| format!("Failed to write to PowerShell: {}", e))?;
        self.stdin
            .write_all(b"\n")
            .await
            .map_err(|e| format!("Failed to write to PowerShell: {}", e))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| format!("Failed to flush PowerShell stdin: {}", e))?;

        loop {
            let next = self
                .stdout
                .next_line()
                .await
                .map_err(|e| format!("Failed to read from PowerShell: {}", e))?;
            match next {
                Some(l) if serialization::reply_body(&l).is_some() => {
                    trace!("PS bridge <- {}", truncate_str(&l, 300));
                    return parse_response_line(&l);
                }
                Some(l) => {
                    if !l.trim().is_empty() {
                        trace!("PS bridge skipped untagged line: {}", truncate_str(&l, 300));
                    }
                }
                None => return Err("PowerShell bridge exited unexpectedly".to_string()),
            }
        }
    }

    async fn shutdown(mut self) -> Result<(), String> {
        let request = serde_json::to_string(&WireRequest::Close)
            .map_err(|e| format!("Failed to encode close request: {}", e))?;
        let exchanged = self.exchange(&request).await;

        match tokio::time::timeout(CLOSE_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) if status.success() => {}
            Ok(Ok(status)) => warn!("PowerShell bridge exited with {}", status),
            Ok(Err(e)) => warn!("Failed to wait for PowerShell bridge: {}", e),
            Err(_) => {
                warn!("PowerShell bridge did not exit in time; killing it");
                let _ = self.child.kill().await;
            }
        }

        let result = exchanged?;
        if result.has_errors() {
            let details: Vec<String> = result.errors.iter().map(|e| e.description()).collect();
            return Err(details.join("\n"));
        }
        Ok(())
    }
}

/// [`RemoteShell`] backed by the locally installed PowerShell remoting client.
pub struct PwshRemoteShell {
    powershell_path: String,
    bridges: Mutex<HashMap<String, Bridge>>,
}

impl Default for PwshRemoteShell {
    fn default() -> Self {
        Self::new(default_powershell_path())
    }
}

impl PwshRemoteShell {
    pub fn new(powershell_path: impl Into<String>) -> Self {
        Self {
            powershell_path: powershell_path.into(),
            bridges: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl RemoteShell for PwshRemoteShell {
    async fn open(
        &self,
        target: &TargetIdentity,
        options: &SessionOptions,
    ) -> WinRmResult<ShellHandle> {
        let host = target.host();
        let mut bridge = Bridge::spawn(&self.powershell_path)
            .map_err(|e| WinRmError::connection(host, format!("Failed to spawn PowerShell: {}", e)))?;

        let request = Zeroizing::new(
            serde_json::to_string(&WireRequest::Open {
                host,
                username: target.username(),
                password: target.password().expose_secret(),
                operation_timeout_ms: millis(options.operation_timeout_sec),
                idle_timeout_ms: millis(options.idle_timeout_sec),
            })
            .map_err(|e| WinRmError::connection(host, format!("Failed to encode open request: {}", e)))?,
        );

        let result = match bridge.exchange(&request).await {
            Ok(result) => result,
            Err(e) => {
                let _ = bridge.child.kill().await;
                return Err(WinRmError::connection(host, e));
            }
        };
        if result.has_errors() {
            let _ = bridge.child.kill().await;
            let details: Vec<String> = result.errors.iter().map(|e| e.description()).collect();
            return Err(WinRmError::connection(host, details.join("\n")));
        }

        let handle = ShellHandle::new(host);
        info!("PowerShell bridge session {} opened", handle);
        self.bridges
            .lock()
            .await
            .insert(handle.id().to_string(), bridge);
        Ok(handle)
    }

    async fn invoke(
        &self,
        handle: &ShellHandle,
        script: &str,
        args: &[PsValue],
    ) -> WinRmResult<ScriptResult> {
        let request = serde_json::to_string(&WireRequest::Invoke {
            script,
            args: args.iter().map(serialization::to_wire).collect(),
        })
        .map_err(|e| WinRmError::connection(handle.host(), format!("Failed to encode request: {}", e)))?;

        let mut bridges = self.bridges.lock().await;
        let bridge = bridges.get_mut(handle.id()).ok_or_else(|| {
            WinRmError::connection(handle.host(), format!("Session {} is not open", handle))
        })?;
        bridge
            .exchange(&request)
            .await
            .map_err(|e| WinRmError::connection(handle.host(), e))
    }

    async fn close(&self, handle: ShellHandle) -> WinRmResult<()> {
        let bridge = self.bridges.lock().await.remove(handle.id());
        let bridge = bridge.ok_or_else(|| {
            WinRmError::connection(handle.host(), format!("Session {} is not open", handle))
        })?;
        bridge
            .shutdown()
            .await
            .map_err(|e| WinRmError::connection(handle.host(), e))?;
        info!("PowerShell bridge session {} closed", handle);
        Ok(())
    }
}

fn millis(secs: u64) -> u64 {
    secs.saturating_mul(1000)
}

/// Truncate a string for logging purposes.
pub(crate) fn truncate_str(s: &str, max_len: usize) -> String {
    match s.char_indices().nth(max_len) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_command_is_utf16le_base64() {
        // "ls" -> 6c 00 73 00
        assert_eq!(encode_command("ls"), "bABzAA==");
    }

    #[test]
    fn wrapper_splices_body() {
        let full = LOCAL_WRAPPER.replace("__BODY__", "Get-Date");
        assert!(full.contains("& {\nGet-Date\n"));
        assert!(full.contains("Write-WireResponse"));
    }

    #[test]
    fn response_line_maps_output_and_errors() {
        let result = parse_response_line(
            r#"#winrm-reply# {"output":["a",{"$b64":"AQI="}],"errors":[{"message":"denied"}]}"#,
        )
        .unwrap();
        assert_eq!(result.output[0], PsValue::from("a"));
        assert_eq!(result.output[1], PsValue::Bytes(vec![1, 2]));
        assert_eq!(result.errors[0].description(), "denied");
    }

    #[test]
    fn malformed_response_is_an_error() {
        assert!(parse_response_line("WARNING: something").is_err());
        assert!(parse_response_line("#winrm-reply# {not json").is_err());
    }

    #[test]
    fn untagged_json_is_not_a_reply() {
        let err = parse_response_line(r#"{"output":["stray"],"errors":[]}"#).unwrap_err();
        assert!(err.starts_with("Untagged response"));
    }

    #[test]
    fn bridge_silences_host_streams() {
        for call in ["New-PSSession -ComputerName", "-ScriptBlock $sc -ArgumentList", "-ScriptBlock $sc -ErrorVariable"] {
            let line = BRIDGE_SCRIPT.lines().find(|l| l.contains(call)).unwrap();
            assert!(line.contains("3>$null 4>$null 5>$null 6>$null"), "{}", line);
        }
    }

    #[test]
    fn timeouts_saturate_when_converted_to_millis() {
        assert_eq!(millis(1200), 1_200_000);
        assert_eq!(millis(0), 0);
        assert_eq!(millis(u64::MAX), u64::MAX);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_str("héllo", 2), "hé...");
        assert_eq!(truncate_str("abc", 10), "abc");
    }

    #[tokio::test]
    async fn invoke_on_unknown_handle_fails() {
        let shell = PwshRemoteShell::new("pwsh");
        let handle = ShellHandle::new("10.0.0.1");
        let err = shell.invoke(&handle, "{ 1 }", &[]).await.unwrap_err();
        assert!(err.is_remote_execution());
        assert_eq!(err.host.as_deref(), Some("10.0.0.1"));
    }

    #[cfg(unix)]
    mod bridge_process {
        use super::*;
        use crate::mock::identity;
        use crate::types::TransferPolicy;
        use std::os::unix::fs::PermissionsExt;
        use std::path::{Path, PathBuf};

        // Stands in for PowerShell: ignores its arguments and answers the JSON
        // line protocol, printing host noise before every invoke reply.
        const FAKE_BRIDGE: &str = r#"#!/bin/sh
n=0
while IFS= read -r line; do
  case "$line" in
    *'"host":"deny.example"'*)
      echo 'WARNING: Access is denied'
      echo '@P@{"output":[],"errors":[{"message":"Access is denied"}]}'
      ;;
    *'"host":"vanish.example"'*)
      exit 3
      ;;
    *'"op":"open"'*)
      echo '@P@{"output":[],"errors":[]}'
      ;;
    *'"op":"close"'*)
      echo closed > "$0.closed"
      echo '@P@{"output":[],"errors":[]}'
      exit 0
      ;;
    *'"op":"invoke"'*)
      n=$((n+1))
      echo "WARNING: reply $n is coming"
      echo ''
      echo "VERBOSE: {\"output\":[\"noise-$n\"],\"errors\":[]}"
      echo "@P@{\"output\":[\"reply-$n\"],\"errors\":[]}"
      ;;
  esac
done
"#;

        fn install_fake_bridge(dir: &Path) -> PathBuf {
            let path = dir.join("fake-pwsh");
            std::fs::write(&path, FAKE_BRIDGE.replace("@P@", serialization::REPLY_PREFIX)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn shell_for(path: &Path) -> PwshRemoteShell {
            PwshRemoteShell::new(path.to_string_lossy().to_string())
        }

        #[tokio::test]
        async fn each_invoke_reads_its_own_reply_past_host_noise() {
            let dir = tempfile::tempdir().unwrap();
            let shell = shell_for(&install_fake_bridge(dir.path()));
            let options = TransferPolicy::default().session_options();

            let handle = shell.open(&identity("10.0.0.1"), &options).await.unwrap();
            let first = shell.invoke(&handle, "{ 1 }", &[]).await.unwrap();
            let second = shell
                .invoke(&handle, "{ param($p) $p }", &[PsValue::from("x")])
                .await
                .unwrap();

            assert_eq!(first.output, vec![PsValue::from("reply-1")]);
            assert_eq!(second.output, vec![PsValue::from("reply-2")]);
            shell.close(handle).await.unwrap();
        }

        #[tokio::test]
        async fn close_runs_the_handshake_and_forgets_the_session() {
            let dir = tempfile::tempdir().unwrap();
            let path = install_fake_bridge(dir.path());
            let shell = shell_for(&path);
            let options = TransferPolicy::default().session_options();

            let handle = shell.open(&identity("10.0.0.1"), &options).await.unwrap();
            let kept = handle.clone();
            shell.close(handle).await.unwrap();

            assert!(dir.path().join("fake-pwsh.closed").exists());
            assert!(shell.bridges.lock().await.is_empty());
            let err = shell.invoke(&kept, "{ 1 }", &[]).await.unwrap_err();
            assert!(err.message.contains("is not open"));
            assert!(shell.close(kept).await.is_err());
        }

        #[tokio::test]
        async fn open_error_reply_is_a_connection_failure() {
            let dir = tempfile::tempdir().unwrap();
            let shell = shell_for(&install_fake_bridge(dir.path()));
            let options = TransferPolicy::default().session_options();

            let err = shell.open(&identity("deny.example"), &options).await.unwrap_err();

            assert!(err.is_remote_execution());
            assert_eq!(err.host.as_deref(), Some("deny.example"));
            assert!(err.script.is_none());
            assert!(err.to_string().contains("Access is denied"));
            assert!(shell.bridges.lock().await.is_empty());
        }

        #[tokio::test]
        async fn bridge_exiting_during_open_is_a_connection_failure() {
            let dir = tempfile::tempdir().unwrap();
            let shell = shell_for(&install_fake_bridge(dir.path()));
            let options = TransferPolicy::default().session_options();

            let err = shell.open(&identity("vanish.example"), &options).await.unwrap_err();

            assert!(err.to_string().contains("exited unexpectedly"));
            assert!(shell.bridges.lock().await.is_empty());
        }

        #[tokio::test]
        async fn missing_executable_fails_to_open() {
            let dir = tempfile::tempdir().unwrap();
            let shell = shell_for(&dir.path().join("no-such-pwsh"));
            let options = TransferPolicy::default().session_options();

            let err = shell.open(&identity("10.0.0.1"), &options).await.unwrap_err();
            assert!(err.to_string().contains("Failed to spawn PowerShell"));
        }
    }
}
