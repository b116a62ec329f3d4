//! Creating, archiving, and listing stacks.

use crate::Result;
use crate::env::PREFIX;
use crate::env_file;
use crate::error::{FileError, StackError};
use crate::paths::{StackPaths, list_stack_names, validate_stack_name};
use crate::ports::PortKind;
use crate::procs::ProcessIntrospector;
use crate::runtime_state;
use crate::stack_env::{ServerFlavor, initial_env_pairs};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct NewStack {
    pub flavor: ServerFlavor,
    /// Pins the server port; without it the stack is ephemeral.
    pub server_port: Option<u16>,
    /// Extra `KEY=VALUE` pairs, stack keys given by suffix or full name.
    pub vars: Vec<(String, String)>,
}

/// Writes a new stack's env file. Fails if the stack already exists.
pub fn create_stack(storage_dir: &Path, name: &str, opts: &NewStack) -> Result<StackPaths> {
    validate_stack_name(name)?;
    let paths = StackPaths::new(storage_dir, name);
    if paths.exists() {
        return Err(StackError::AlreadyExists {
            name: name.to_string(),
            path: paths.env_file(),
            help: format!("edit {} or pick another name", paths.env_file().display()),
        }
        .into());
    }
    let mut pairs = initial_env_pairs(name, &paths, opts.flavor);
    if let Some(port) = opts.server_port {
        pairs.insert(
            format!("{PREFIX}{}", PortKind::Server.env_suffix()),
            port.to_string(),
        );
    }
    for (key, value) in &opts.vars {
        let key = if key.starts_with(PREFIX) || key.starts_with(crate::env::LEGACY_PREFIX) {
            key.clone()
        } else {
            format!("{PREFIX}{key}")
        };
        pairs.insert(key, value.clone());
    }
    env_file::write(&paths.env_file(), &pairs)?;
    xx::file::mkdirp(paths.logs_dir())?;
    info!("created stack {name} at {}", paths.base_dir.display());
    Ok(paths)
}

/// Moves a stopped stack to `<storage>/.archived/<name>-<timestamp>`.
pub fn archive_stack(
    storage_dir: &Path,
    name: &str,
    procs: &dyn ProcessIntrospector,
) -> Result<PathBuf> {
    validate_stack_name(name)?;
    let paths = StackPaths::new(storage_dir, name);
    if !paths.base_dir.is_dir() {
        return Err(StackError::NotFound {
            name: name.to_string(),
            help: "see existing stacks: happys stack list".to_string(),
        }
        .into());
    }
    if let Some(state) = runtime_state::read_stack_runtime_state_file(&paths.runtime_state_file())
        && state.owner_alive(procs)
    {
        return Err(StackError::Running {
            name: name.to_string(),
            pid: state.owner_pid.unwrap_or_default(),
            help: format!("stop it first: happys stack stop {name}"),
        }
        .into());
    }
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let dest = paths.archive_dir().join(format!("{name}-{stamp}"));
    xx::file::mkdirp(paths.archive_dir())?;
    std::fs::rename(&paths.base_dir, &dest).map_err(|e| FileError::WriteError {
        path: dest.clone(),
        details: Some(e.to_string()),
    })?;
    info!("archived stack {name} to {}", dest.display());
    Ok(dest)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackSummary {
    pub name: String,
    pub running: bool,
    pub owner_pid: Option<u32>,
    pub server_port: Option<u16>,
    pub ephemeral: bool,
}

/// Every stack with a persisted env file. Unreadable files show up as
/// stopped rather than failing the listing.
pub fn list_stacks(
    storage_dir: &Path,
    home: &Path,
    procs: &dyn ProcessIntrospector,
) -> Vec<StackSummary> {
    list_stack_names(storage_dir)
        .into_iter()
        .map(|name| {
            let paths = StackPaths::new(storage_dir, &name);
            let pinned = env_file::read(&paths.env_file(), home)
                .ok()
                .flatten()
                .and_then(|pairs| {
                    let suffix = PortKind::Server.env_suffix();
                    pairs
                        .get(&format!("{PREFIX}{suffix}"))
                        .or_else(|| pairs.get(&format!("{}{suffix}", crate::env::LEGACY_PREFIX)))
                        .and_then(|v| v.trim().parse::<u16>().ok())
                });
            let live = runtime_state::read_stack_runtime_state_file(&paths.runtime_state_file())
                .filter(|s| s.owner_alive(procs));
            StackSummary {
                running: live.is_some(),
                owner_pid: live.as_ref().and_then(|s| s.owner_pid),
                server_port: live
                    .as_ref()
                    .and_then(|s| s.ports.get(PortKind::Server.key()).copied())
                    .or(pinned),
                ephemeral: pinned.is_none(),
                name,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::procs::fake::{FakeProcess, FakeProcs};
    use crate::runtime_state::{RuntimeStart, record_stack_runtime_start};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[test]
    fn test_create_stack() {
        let dir = TempDir::new().unwrap();
        let paths = create_stack(
            dir.path(),
            "exp1",
            &NewStack {
                flavor: ServerFlavor::Full,
                server_port: Some(4101),
                vars: vec![("UI_CMD".into(), "npm run web".into())],
            },
        )
        .unwrap();
        let pairs = env_file::read(&paths.env_file(), dir.path()).unwrap().unwrap();
        assert_eq!(pairs["HAPPY_STACKS_STACK"], "exp1");
        assert_eq!(pairs["HAPPY_STACKS_SERVER_COMPONENT"], "happy-server");
        assert_eq!(pairs["HAPPY_STACKS_SERVER_PORT"], "4101");
        assert_eq!(pairs["HAPPY_STACKS_UI_CMD"], "npm run web");

        let err = create_stack(dir.path(), "exp1", &NewStack::default()).unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert!(create_stack(dir.path(), "../evil", &NewStack::default()).is_err());
        assert!(create_stack(dir.path(), "has space", &NewStack::default()).is_err());
    }

    #[test]
    fn test_archive_refuses_running() {
        let dir = TempDir::new().unwrap();
        let procs = FakeProcs::new();
        let paths = create_stack(dir.path(), "exp1", &NewStack::default()).unwrap();
        record_stack_runtime_start(
            &paths.runtime_state_file(),
            RuntimeStart {
                stack_name: "exp1".into(),
                script: None,
                ephemeral: true,
                owner_pid: 700,
                ports: BTreeMap::new(),
            },
        )
        .unwrap();
        procs.add(700, FakeProcess::alive());
        let err = archive_stack(dir.path(), "exp1", &procs).unwrap_err();
        assert!(err.to_string().contains("is running"));

        procs.exit(700);
        let dest = archive_stack(dir.path(), "exp1", &procs).unwrap();
        assert!(dest.join("env").is_file());
        assert!(!paths.base_dir.exists());
        assert!(list_stack_names(dir.path()).is_empty());
        assert!(archive_stack(dir.path(), "exp1", &procs).is_err());
    }

    #[test]
    fn test_list_stacks() {
        let dir = TempDir::new().unwrap();
        let procs = FakeProcs::new();
        create_stack(
            dir.path(),
            "pinned",
            &NewStack {
                server_port: Some(4200),
                ..Default::default()
            },
        )
        .unwrap();
        let exp = create_stack(dir.path(), "exp1", &NewStack::default()).unwrap();
        record_stack_runtime_start(
            &exp.runtime_state_file(),
            RuntimeStart {
                stack_name: "exp1".into(),
                script: None,
                ephemeral: true,
                owner_pid: 701,
                ports: BTreeMap::from([("server".into(), 4301)]),
            },
        )
        .unwrap();
        procs.add(701, FakeProcess::alive());

        let stacks = list_stacks(dir.path(), dir.path(), &procs);
        assert_eq!(stacks.len(), 2);
        assert_eq!(stacks[0].name, "exp1");
        assert!(stacks[0].running);
        assert_eq!(stacks[0].server_port, Some(4301));
        assert!(stacks[0].ephemeral);
        assert_eq!(stacks[1].name, "pinned");
        assert!(!stacks[1].running);
        assert_eq!(stacks[1].server_port, Some(4200));
        assert!(!stacks[1].ephemeral);
    }
}
