//! File upload over an open session.
//!
//! An upload is a guard (unless appending), one or more content writes and a
//! final SHA-256 verification of the remote file. Path and bytes always travel
//! as bound arguments.

use crate::checksum::sha256_hex;
use crate::error::{WinRmError, WinRmResult};
use crate::execution::ScriptInvoker;
use crate::session::SessionContext;
use crate::types::{PsValue, TransferPolicy, TransferState};
use log::{debug, info};
use std::ops::Range;

/// Fails when the destination already exists.
pub const GUARD_SCRIPT: &str = r#"{ param($path)
    if (Test-Path -LiteralPath $path) {
        Write-Error -Message "File '$path' already exists" -Category ResourceExists
    }
}"#;

/// Creates the parent directory and replaces the file contents.
pub const SET_CONTENT_SCRIPT: &str = r#"{ param($path, $data)
    $target = $ExecutionContext.SessionState.Path.GetUnresolvedProviderPathFromPSPath($path)
    $parent = [System.IO.Path]::GetDirectoryName($target)
    if ($parent) { [System.IO.Directory]::CreateDirectory($parent) | Out-Null }
    if ($data.Length -eq 0) {
        [System.IO.File]::WriteAllBytes($target, [byte[]]@())
    } elseif ($PSVersionTable.PSVersion.Major -ge 6) {
        Set-Content -LiteralPath $path -Value ([byte[]]$data) -AsByteStream
    } else {
        Set-Content -LiteralPath $path -Value ([byte[]]$data) -Encoding Byte
    }
}"#;

/// Creates the parent directory and appends to the file.
pub const ADD_CONTENT_SCRIPT: &str = r#"{ param($path, $data)
    $target = $ExecutionContext.SessionState.Path.GetUnresolvedProviderPathFromPSPath($path)
    $parent = [System.IO.Path]::GetDirectoryName($target)
    if ($parent) { [System.IO.Directory]::CreateDirectory($parent) | Out-Null }
    if ($data.Length -eq 0) {
        if (-not [System.IO.File]::Exists($target)) { [System.IO.File]::WriteAllBytes($target, [byte[]]@()) }
    } elseif ($PSVersionTable.PSVersion.Major -ge 6) {
        Add-Content -LiteralPath $path -Value ([byte[]]$data) -AsByteStream
    } else {
        Add-Content -LiteralPath $path -Value ([byte[]]$data) -Encoding Byte
    }
}"#;

/// Recomputes the SHA-256 of the bytes this upload wrote and errors on a
/// mismatch. Appends are checked against the tail of the file; otherwise the
/// whole file must match.
pub const VERIFY_SCRIPT: &str = r#"{ param($path, $expectedChecksum, $byteCount, $appended)
    $bytes = [System.IO.File]::ReadAllBytes((Resolve-Path -LiteralPath $path).ProviderPath)
    if ($bytes.Length -lt $byteCount -or (-not $appended -and $bytes.Length -ne $byteCount)) {
        Write-Error -Message "File '$path' holds $($bytes.Length) bytes, expected $byteCount" -Category InvalidResult
        return
    }
    $sha = [System.Security.Cryptography.SHA256]::Create()
    try {
        $hash = $sha.ComputeHash($bytes, $bytes.Length - $byteCount, $byteCount)
    } finally {
        $sha.Dispose()
    }
    $actual = -join ($hash | ForEach-Object { $_.ToString('x2') })
    if ($actual -ne $expectedChecksum) {
        Write-Error -Message "Checksum of '$path' is $actual, expected $expectedChecksum" -Category InvalidResult
    }
    $actual
}"#;

/// Byte ranges of the writes needed for a payload of `total` bytes.
///
/// Payloads up to the threshold (including empty ones) are a single write.
pub fn plan_writes(total: usize, policy: &TransferPolicy) -> WinRmResult<Vec<Range<usize>>> {
    if total <= policy.chunk_threshold_bytes {
        return Ok(vec![0..total]);
    }
    let chunk = policy.chunk_size_bytes;
    if chunk == 0 {
        return Err(WinRmError::configuration(format!(
            "Chunk size must be greater than zero to send {} bytes (threshold {})",
            total, policy.chunk_threshold_bytes
        )));
    }
    Ok((0..total)
        .step_by(chunk)
        .map(|start| start..(start + chunk).min(total))
        .collect())
}

// ─── File Transfer Engine ────────────────────────────────────────────────────

/// Sends payloads to remote paths according to a [`TransferPolicy`].
pub struct FileTransferEngine<'a> {
    policy: &'a TransferPolicy,
}

impl<'a> FileTransferEngine<'a> {
    pub fn new(policy: &'a TransferPolicy) -> Self {
        Self { policy }
    }

    /// Validate sizing for a payload before any session is opened.
    pub fn plan(&self, total: usize) -> WinRmResult<Vec<Range<usize>>> {
        plan_writes(total, self.policy)
    }

    /// Upload `payload` to `path` and verify it.
    pub async fn send(
        &self,
        session: &SessionContext,
        path: &str,
        payload: &[u8],
        append: bool,
    ) -> WinRmResult<TransferState> {
        let writes = self.plan(payload.len())?;
        let mut state = TransferState {
            target_path: path.to_string(),
            total_bytes: payload.len() as u64,
            bytes_sent: 0,
            append_mode: append,
            expected_checksum: sha256_hex(payload),
        };

        info!(
            "Sending {} bytes to {} on {} in {} write(s) (append: {})",
            state.total_bytes,
            path,
            session.host(),
            writes.len(),
            append
        );

        if !append {
            ScriptInvoker::run(session, GUARD_SCRIPT, &[PsValue::from(path)]).await?;
        }

        for (index, range) in writes.into_iter().enumerate() {
            let append_chunk = append || index > 0;
            let script = if append_chunk {
                ADD_CONTENT_SCRIPT
            } else {
                SET_CONTENT_SCRIPT
            };
            let len = range.len();
            ScriptInvoker::run(
                session,
                script,
                &[PsValue::from(path), PsValue::from(&payload[range])],
            )
            .await?;
            state.bytes_sent += len as u64;
            debug!(
                "Chunk {} ({} bytes) written to {}: {:.1}%",
                index + 1,
                len,
                path,
                state.percent_complete()
            );
        }

        self.verify(session, &state).await?;

        info!(
            "Sent {} bytes to {} on {} (sha256 {})",
            state.bytes_sent,
            path,
            session.host(),
            state.expected_checksum
        );
        Ok(state)
    }

    async fn verify(&self, session: &SessionContext, state: &TransferState) -> WinRmResult<()> {
        let path = state.target_path.as_str();
        let expected = state.expected_checksum.as_str();
        let args = [
            PsValue::from(path),
            PsValue::from(expected),
            PsValue::Int(state.total_bytes as i64),
            PsValue::Bool(state.append_mode),
        ];
        match ScriptInvoker::run(session, VERIFY_SCRIPT, &args).await {
            Ok(_) => Ok(()),
            // Only an error stream from the script itself is a mismatch;
            // transport failures pass through unchanged.
            Err(e) if e.script.is_some() => Err(WinRmError::checksum_mismatch(
                session.host(),
                path,
                expected,
                e.details,
            )),
            Err(e) => Err(e),
        }
    }
}
