//! In-memory test doubles for the remoting engine and the trust store.
//!
//! [`MockRemoteShell`] recognises the upload scripts and applies them to a
//! simulated remote filesystem, so transfers can be checked end to end.

use crate::checksum::sha256_hex;
use crate::copy::{ADD_CONTENT_SCRIPT, GUARD_SCRIPT, SET_CONTENT_SCRIPT, VERIFY_SCRIPT};
use crate::error::{WinRmError, WinRmResult};
use crate::transport::{RemoteShell, ShellHandle};
use crate::trusted_hosts::TrustStore;
use crate::types::{PsErrorRecord, PsValue, ScriptResult, SessionOptions, TargetIdentity};
use async_trait::async_trait;
use secrecy::SecretString;
use std::collections::HashMap;
use std::sync::Mutex;

pub fn identity(host: &str) -> TargetIdentity {
    TargetIdentity::new(host, "Administrator", SecretString::new("P@ssw0rd".into())).unwrap()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub script: String,
    pub args: Vec<PsValue>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub path: String,
    pub len: usize,
    pub append: bool,
}

#[derive(Default)]
struct ShellState {
    opens: Vec<(String, SessionOptions)>,
    closes: usize,
    open_handles: Vec<String>,
    calls: Vec<Invocation>,
    files: HashMap<String, Vec<u8>>,
    writes: Vec<WriteRecord>,
    responses: Vec<(String, Vec<PsValue>)>,
    failures: Vec<(String, Vec<PsErrorRecord>)>,
    truncate_write: Option<usize>,
    fail_open: Option<String>,
    fail_close: Option<String>,
}

/// Scriptable [`RemoteShell`] with a simulated remote filesystem.
#[derive(Default)]
pub struct MockRemoteShell {
    state: Mutex<ShellState>,
}

impl MockRemoteShell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return `output` for scripts containing `pattern`.
    pub fn respond_to(&self, pattern: &str, output: Vec<PsValue>) {
        self.state
            .lock()
            .unwrap()
            .responses
            .push((pattern.to_string(), output));
    }

    /// Report `errors` for scripts containing `pattern`.
    pub fn fail_script(&self, pattern: &str, errors: Vec<PsErrorRecord>) {
        self.state
            .lock()
            .unwrap()
            .failures
            .push((pattern.to_string(), errors));
    }

    /// Drop the last byte of the `index`-th content write.
    pub fn truncate_write(&self, index: usize) {
        self.state.lock().unwrap().truncate_write = Some(index);
    }

    pub fn fail_open(&self, message: &str) {
        self.state.lock().unwrap().fail_open = Some(message.to_string());
    }

    pub fn fail_close(&self, message: &str) {
        self.state.lock().unwrap().fail_close = Some(message.to_string());
    }

    pub fn put_file(&self, path: &str, data: Vec<u8>) {
        self.state.lock().unwrap().files.insert(path.to_string(), data);
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().files.get(path).cloned()
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn opens(&self) -> Vec<(String, SessionOptions)> {
        self.state.lock().unwrap().opens.clone()
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().unwrap().opens.len()
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().unwrap().closes
    }

    /// Handles opened and not yet closed.
    pub fn live_sessions(&self) -> usize {
        self.state.lock().unwrap().open_handles.len()
    }
}

fn string_arg(args: &[PsValue], index: usize) -> String {
    args.get(index)
        .and_then(PsValue::as_str)
        .unwrap_or_default()
        .to_string()
}

fn error(message: String) -> ScriptResult {
    ScriptResult::from_errors(vec![PsErrorRecord::from_message(message)])
}

impl ShellState {
    fn simulate(&mut self, script: &str, args: &[PsValue]) -> ScriptResult {
        if let Some((_, errors)) = self.failures.iter().find(|(p, _)| script.contains(p.as_str())) {
            return ScriptResult::from_errors(errors.clone());
        }

        if script == GUARD_SCRIPT {
            let path = string_arg(args, 0);
            if self.files.contains_key(&path) {
                return error(format!("File '{}' already exists", path));
            }
            return ScriptResult::default();
        }

        if script == SET_CONTENT_SCRIPT || script == ADD_CONTENT_SCRIPT {
            let append = script == ADD_CONTENT_SCRIPT;
            let path = string_arg(args, 0);
            let mut data = args
                .get(1)
                .and_then(PsValue::as_bytes)
                .unwrap_or_default()
                .to_vec();
            if self.truncate_write == Some(self.writes.len()) {
                data.pop();
            }
            self.writes.push(WriteRecord {
                path: path.clone(),
                len: data.len(),
                append,
            });
            let file = self.files.entry(path).or_default();
            if !append {
                file.clear();
            }
            file.extend_from_slice(&data);
            return ScriptResult::default();
        }

        if script == VERIFY_SCRIPT {
            let path = string_arg(args, 0);
            let expected = string_arg(args, 1);
            let byte_count = args.get(2).and_then(PsValue::as_i64).unwrap_or_default() as usize;
            let appended = args.get(3).and_then(PsValue::as_bool).unwrap_or_default();
            let Some(content) = self.files.get(&path) else {
                return error(format!("Cannot find path '{}'", path));
            };
            if content.len() < byte_count || (!appended && content.len() != byte_count) {
                return error(format!(
                    "File '{}' holds {} bytes, expected {}",
                    path,
                    content.len(),
                    byte_count
                ));
            }
            let actual = sha256_hex(&content[content.len() - byte_count..]);
            let mut result = ScriptResult::from_output(vec![PsValue::from(actual.clone())]);
            if actual != expected {
                result.errors.push(PsErrorRecord::from_message(format!(
                    "Checksum of '{}' is {}, expected {}",
                    path, actual, expected
                )));
            }
            return result;
        }

        self.responses
            .iter()
            .find(|(p, _)| script.contains(p.as_str()))
            .map(|(_, output)| ScriptResult::from_output(output.clone()))
            .unwrap_or_default()
    }
}

#[async_trait]
impl RemoteShell for MockRemoteShell {
    async fn open(
        &self,
        target: &TargetIdentity,
        options: &SessionOptions,
    ) -> WinRmResult<ShellHandle> {
        let mut state = self.state.lock().unwrap();
        if let Some(message) = &state.fail_open {
            return Err(WinRmError::connection(target.host(), message.clone()));
        }
        state.opens.push((target.host().to_string(), *options));
        let handle = ShellHandle::new(target.host());
        state.open_handles.push(handle.id().to_string());
        Ok(handle)
    }

    async fn invoke(
        &self,
        handle: &ShellHandle,
        script: &str,
        args: &[PsValue],
    ) -> WinRmResult<ScriptResult> {
        let mut state = self.state.lock().unwrap();
        if !state.open_handles.iter().any(|id| id == handle.id()) {
            return Err(WinRmError::connection(
                handle.host(),
                format!("Session {} is not open", handle),
            ));
        }
        state.calls.push(Invocation {
            script: script.to_string(),
            args: args.to_vec(),
        });
        Ok(state.simulate(script, args))
    }

    async fn close(&self, handle: ShellHandle) -> WinRmResult<()> {
        let mut state = self.state.lock().unwrap();
        state.closes += 1;
        state.open_handles.retain(|id| id != handle.id());
        match &state.fail_close {
            Some(message) => Err(WinRmError::connection(handle.host(), message.clone())),
            None => Ok(()),
        }
    }
}

// ─── Trust Store ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct StoreState {
    value: Option<String>,
    writes: usize,
    fail_writes: bool,
}

/// [`TrustStore`] held in memory.
#[derive(Default)]
pub struct MemoryTrustStore {
    state: Mutex<StoreState>,
}

impl MemoryTrustStore {
    pub fn new(value: Option<&str>) -> Self {
        Self {
            state: Mutex::new(StoreState {
                value: value.map(str::to_string),
                ..StoreState::default()
            }),
        }
    }

    pub fn value(&self) -> Option<String> {
        self.state.lock().unwrap().value.clone()
    }

    pub fn writes(&self) -> usize {
        self.state.lock().unwrap().writes
    }

    pub fn fail_writes(&self) {
        self.state.lock().unwrap().fail_writes = true;
    }
}

#[async_trait]
impl TrustStore for MemoryTrustStore {
    async fn get(&self) -> WinRmResult<Option<String>> {
        Ok(self.value())
    }

    async fn set(&self, value: &str) -> WinRmResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_writes {
            return Err(WinRmError::configuration("trust store is read-only"));
        }
        state.value = Some(value.to_string());
        state.writes += 1;
        Ok(())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}
