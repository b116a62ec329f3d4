//! Per-stack runtime state (`stack.runtime.json`).
//!
//! The file is only trustworthy while `ownerPid` is alive. Readers check
//! [`RuntimeState::owner_alive`] before using ports or process ids; a file
//! with a dead owner is logically absent even though it is still on disk.
//!
//! Writes go through a temp file and a rename under an `xx::fslock`, and
//! concurrent writers resolve as last-write-wins.

use crate::Result;
use crate::error::FileError;
use crate::procs::ProcessIntrospector;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeState {
    #[serde(default)]
    pub stack_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    #[serde(default)]
    pub ephemeral: bool,
    #[serde(default)]
    pub owner_pid: Option<u32>,
    #[serde(default)]
    pub ports: BTreeMap<String, u16>,
    #[serde(default)]
    pub processes: BTreeMap<String, u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expo: Option<ExpoState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Fields written by other tools; preserved across updates.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpoState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mobile_port: Option<u16>,
}

impl RuntimeState {
    pub fn owner_alive(&self, procs: &dyn ProcessIntrospector) -> bool {
        self.owner_pid.is_some_and(|pid| procs.is_alive(pid))
    }

    /// Every port the state claims, including UI dev-server ports.
    pub fn all_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.ports.values().copied().collect();
        if let Some(expo) = &self.expo {
            ports.extend(expo.web_port);
            ports.extend(expo.mobile_port);
        }
        ports.retain(|p| *p > 0);
        ports.sort_unstable();
        ports.dedup();
        ports
    }
}

/// Input for [`record_stack_runtime_start`].
#[derive(Debug, Clone)]
pub struct RuntimeStart {
    pub stack_name: String,
    pub script: Option<String>,
    pub ephemeral: bool,
    pub owner_pid: u32,
    pub ports: BTreeMap<String, u16>,
}

/// Partial update merged into the existing file.
#[derive(Debug, Clone, Default)]
pub struct RuntimePatch(Map<String, Value>);

impl RuntimePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn owner_pid(mut self, pid: u32) -> Self {
        self.0.insert("ownerPid".into(), Value::from(pid));
        self
    }

    pub fn process(mut self, name: &str, pid: u32) -> Self {
        self.nested("processes").insert(name.into(), Value::from(pid));
        self
    }

    pub fn port(mut self, name: &str, port: u16) -> Self {
        self.nested("ports").insert(name.into(), Value::from(port));
        self
    }

    pub fn expo_web_port(mut self, port: u16) -> Self {
        self.nested("expo").insert("webPort".into(), Value::from(port));
        self
    }

    pub fn field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    fn nested(&mut self, key: &str) -> &mut Map<String, Value> {
        let entry = self
            .0
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        match entry {
            Value::Object(map) => map,
            _ => unreachable!("entry was just made an object"),
        }
    }
}

/// Tolerant read: a missing or malformed file is `None`.
pub fn read_stack_runtime_state_file(path: &Path) -> Option<RuntimeState> {
    let raw = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(state) => Some(state),
        Err(e) => {
            debug!("ignoring malformed runtime state {}: {e}", path.display());
            None
        }
    }
}

/// Creates or overwrites the runtime state for a stack that is starting.
pub fn record_stack_runtime_start(path: &Path, start: RuntimeStart) -> Result<()> {
    let now = Utc::now();
    let state = RuntimeState {
        stack_name: start.stack_name,
        script: start.script,
        ephemeral: start.ephemeral,
        owner_pid: Some(start.owner_pid),
        ports: start.ports,
        processes: BTreeMap::new(),
        expo: None,
        started_at: Some(now),
        updated_at: Some(now),
        extra: BTreeMap::new(),
    };
    let value = serde_json::to_value(&state).map_err(|e| FileError::WriteError {
        path: path.to_path_buf(),
        details: Some(format!("serialization failed: {e}")),
    })?;
    if let Some(parent) = path.parent() {
        xx::file::mkdirp(parent)?;
    }
    let _lock = xx::fslock::get(path, false)?;
    write_json(path, &value)
}

/// Merges `patch` into the existing file. Top-level keys are replaced, except
/// objects present on both sides, whose entries are merged, so adding one
/// process pid keeps the others.
pub fn record_stack_runtime_update(path: &Path, patch: RuntimePatch) -> Result<()> {
    if let Some(parent) = path.parent() {
        xx::file::mkdirp(parent)?;
    }
    let _lock = xx::fslock::get(path, false)?;
    let mut current = std::fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
        .and_then(|v| match v {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .unwrap_or_default();

    merge_into(&mut current, patch.0);
    current.insert("updatedAt".into(), Value::from(Utc::now().to_rfc3339()));
    write_json(path, &Value::Object(current))
}

fn merge_into(target: &mut Map<String, Value>, patch: Map<String, Value>) {
    for (key, value) in patch {
        match (target.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                for (k, v) in incoming {
                    existing.insert(k, v);
                }
            }
            (_, value) => {
                target.insert(key, value);
            }
        }
    }
}

/// Idempotent delete.
pub fn delete_stack_runtime_state_file(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(FileError::WriteError {
            path: path.to_path_buf(),
            details: Some(format!("could not delete: {e}")),
        }
        .into()),
    }
}

fn write_json(path: &Path, value: &Value) -> Result<()> {
    let raw = serde_json::to_string_pretty(value).map_err(|e| FileError::WriteError {
        path: path.to_path_buf(),
        details: Some(format!("serialization failed: {e}")),
    })?;
    let tmp = path.with_extension(format!("json.tmp-{}", std::process::id()));
    xx::file::write(&tmp, format!("{raw}\n")).map_err(|e| FileError::WriteError {
        path: tmp.clone(),
        details: Some(e.to_string()),
    })?;
    std::fs::rename(&tmp, path).map_err(|e| FileError::WriteError {
        path: path.to_path_buf(),
        details: Some(e.to_string()),
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::procs::fake::{FakeProcess, FakeProcs};
    use tempfile::TempDir;

    fn start(owner_pid: u32) -> RuntimeStart {
        RuntimeStart {
            stack_name: "exp1".to_string(),
            script: Some("dev".to_string()),
            ephemeral: true,
            owner_pid,
            ports: BTreeMap::from([("server".to_string(), 3010), ("backend".to_string(), 3040)]),
        }
    }

    #[test]
    fn test_record_start_then_read() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("exp1").join("stack.runtime.json");
        record_stack_runtime_start(&path, start(100))?;

        let state = read_stack_runtime_state_file(&path).unwrap();
        assert_eq!(state.stack_name, "exp1");
        assert_eq!(state.owner_pid, Some(100));
        assert_eq!(state.ports["server"], 3010);
        assert!(state.ephemeral);
        assert!(state.started_at.is_some());

        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["ownerPid"], 100);
        assert_eq!(raw["ports"]["backend"], 3040);
        Ok(())
    }

    #[test]
    fn test_update_merges_without_clobbering() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stack.runtime.json");
        record_stack_runtime_start(&path, start(100))?;

        record_stack_runtime_update(&path, RuntimePatch::new().process("serverPid", 101))?;
        record_stack_runtime_update(
            &path,
            RuntimePatch::new()
                .process("uiGatewayPid", 102)
                .expo_web_port(8081)
                .field("note", "kept"),
        )?;

        let state = read_stack_runtime_state_file(&path).unwrap();
        assert_eq!(state.owner_pid, Some(100));
        assert_eq!(state.ports.len(), 2);
        assert_eq!(state.processes["serverPid"], 101);
        assert_eq!(state.processes["uiGatewayPid"], 102);
        assert_eq!(state.expo.as_ref().and_then(|e| e.web_port), Some(8081));
        assert_eq!(state.extra["note"], "kept");
        assert!(state.updated_at >= state.started_at);
        assert_eq!(state.all_ports(), vec![3010, 3040, 8081]);
        Ok(())
    }

    #[test]
    fn test_malformed_and_missing_read_as_none() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stack.runtime.json");
        assert!(read_stack_runtime_state_file(&path).is_none());
        std::fs::write(&path, "{not json").unwrap();
        assert!(read_stack_runtime_state_file(&path).is_none());
        std::fs::write(&path, r#"{"ownerPid": "abc"}"#).unwrap();
        assert!(read_stack_runtime_state_file(&path).is_none());
    }

    #[test]
    fn test_delete_is_idempotent() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stack.runtime.json");
        record_stack_runtime_start(&path, start(1))?;
        delete_stack_runtime_state_file(&path)?;
        assert!(!path.exists());
        delete_stack_runtime_state_file(&path)?;
        Ok(())
    }

    #[test]
    fn test_owner_alive_gates_trust() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stack.runtime.json");
        record_stack_runtime_start(&path, start(100))?;
        let state = read_stack_runtime_state_file(&path).unwrap();

        let procs = FakeProcs::new();
        assert!(!state.owner_alive(&procs));
        procs.add(100, FakeProcess::alive());
        assert!(state.owner_alive(&procs));
        procs.exit(100);
        assert!(!state.owner_alive(&procs));
        Ok(())
    }
}
