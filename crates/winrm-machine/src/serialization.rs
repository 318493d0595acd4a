//! JSON line protocol spoken with the local PowerShell bridge process.
//!
//! Arguments and outputs travel as JSON. Byte arrays are wrapped as
//! `{"$b64": "..."}` so they survive the round trip without being unrolled
//! into arrays of numbers.

use crate::types::{PsErrorRecord, PsValue};
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Property name marking a base64-encoded byte array.
pub const BYTES_TAG: &str = "$b64";

/// Marker opening every response line. Anything else on stdout is host noise.
pub const REPLY_PREFIX: &str = "#winrm-reply# ";

/// Request line written to the bridge's stdin.
#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum WireRequest<'a> {
    #[serde(rename_all = "camelCase")]
    Open {
        host: &'a str,
        username: &'a str,
        password: &'a str,
        operation_timeout_ms: u64,
        idle_timeout_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    Invoke { script: &'a str, args: Vec<Value> },
    Close,
}

/// Response line read from the bridge's stdout.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireResponse {
    #[serde(default)]
    pub output: Vec<Value>,
    #[serde(default)]
    pub errors: Vec<PsErrorRecord>,
}

/// JSON body of a response line, or `None` for untagged output.
pub fn reply_body(line: &str) -> Option<&str> {
    line.trim_start().strip_prefix(REPLY_PREFIX)
}

/// Encode a value for the bridge.
pub fn to_wire(value: &PsValue) -> Value {
    match value {
        PsValue::Null => Value::Null,
        PsValue::Bool(b) => Value::Bool(*b),
        PsValue::Int(n) => Value::from(*n),
        PsValue::Float(n) => serde_json::Number::from_f64(*n)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        PsValue::String(s) => Value::String(s.clone()),
        PsValue::Bytes(b) => {
            let mut map = Map::new();
            map.insert(
                BYTES_TAG.to_string(),
                Value::String(base64::engine::general_purpose::STANDARD.encode(b)),
            );
            Value::Object(map)
        }
        PsValue::Array(items) => Value::Array(items.iter().map(to_wire).collect()),
        PsValue::Record(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), to_wire(v)))
                .collect(),
        ),
    }
}

/// Decode a value produced by the bridge.
pub fn from_wire(value: Value) -> PsValue {
    match value {
        Value::Null => PsValue::Null,
        Value::Bool(b) => PsValue::Bool(b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => PsValue::Int(i),
            None => PsValue::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => PsValue::String(s),
        Value::Array(items) => PsValue::Array(items.into_iter().map(from_wire).collect()),
        Value::Object(map) => {
            if let Some(bytes) = decode_bytes(&map) {
                return PsValue::Bytes(bytes);
            }
            PsValue::Record(
                map.into_iter()
                    .map(|(k, v)| (k, from_wire(v)))
                    .collect::<BTreeMap<_, _>>(),
            )
        }
    }
}

fn decode_bytes(map: &Map<String, Value>) -> Option<Vec<u8>> {
    if map.len() != 1 {
        return None;
    }
    let encoded = map.get(BYTES_TAG)?.as_str()?;
    base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()
}

// ─── PowerShell side ─────────────────────────────────────────────────────────

/// Helper functions shared by the session bridge and one-shot local commands.
pub const PS_WIRE_FUNCTIONS: &str = r#"
function ConvertFrom-WireValue($v) {
    if ($null -eq $v) { return $null }
    if ($v -is [System.Management.Automation.PSCustomObject]) {
        $props = @($v.PSObject.Properties)
        if ($props.Count -eq 1 -and $props[0].Name -eq '$b64') {
            return ,[System.Convert]::FromBase64String([string]$props[0].Value)
        }
        $h = [ordered]@{}
        foreach ($p in $props) { $h[$p.Name] = ConvertFrom-WireValue $p.Value }
        return $h
    }
    if ($v -is [System.Array]) {
        $items = @(foreach ($i in $v) { ,(ConvertFrom-WireValue $i) })
        return ,$items
    }
    return $v
}

function ConvertTo-WireValue($v) {
    if ($null -eq $v) { return $null }
    if ($v -is [byte[]]) { return @{ '$b64' = [System.Convert]::ToBase64String($v) } }
    if ($v.PSObject -and $v.PSObject.BaseObject -is [byte[]]) {
        return @{ '$b64' = [System.Convert]::ToBase64String($v.PSObject.BaseObject) }
    }
    return $v
}

function ConvertTo-WireError($e) {
    $details = $null
    if ($e.ErrorDetails) { $details = $e.ErrorDetails.Message }
    return @{
        exceptionType = if ($e.Exception) { $e.Exception.GetType().FullName } else { $null }
        message = if ($e.Exception) { $e.Exception.Message } else { [string]$e }
        errorDetails = $details
        fullyQualifiedErrorId = $e.FullyQualifiedErrorId
        category = if ($e.CategoryInfo) { $e.CategoryInfo.ToString() } else { $null }
        targetObject = if ($null -ne $e.TargetObject) { [string]$e.TargetObject } else { $null }
    }
}

function Write-WireResponse($out, $errs) {
    $response = @{
        output = @(foreach ($o in @($out)) { ,(ConvertTo-WireValue $o) })
        errors = @(foreach ($e in @($errs)) { if ($null -ne $e) { ConvertTo-WireError $e } })
    }
    [Console]::Out.WriteLine('#winrm-reply# ' + ($response | ConvertTo-Json -Compress -Depth 8))
    [Console]::Out.Flush()
}
"#;
