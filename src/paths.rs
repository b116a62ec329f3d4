use crate::error::StackError;
use crate::Result;
use std::path::{Path, PathBuf};

/// Name of the implicit default stack.
pub const MAIN_STACK: &str = "main";

/// Deterministic on-disk locations for one stack.
///
/// ```text
/// <storage>/<name>/
/// ├── env                    persisted KEY=VALUE config
/// ├── stack.runtime.json     runtime state (absent when stopped)
/// ├── logs/                  stack.log, supervisor.log, server.log, ui.log
/// └── cli/                   daemon home (credentials, daemon.state.json)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackPaths {
    pub name: String,
    pub storage_dir: PathBuf,
    pub base_dir: PathBuf,
}

impl StackPaths {
    pub fn new(storage_dir: &Path, name: &str) -> Self {
        Self {
            name: name.to_string(),
            storage_dir: storage_dir.to_path_buf(),
            base_dir: storage_dir.join(name),
        }
    }

    pub fn env_file(&self) -> PathBuf {
        self.base_dir.join("env")
    }

    pub fn runtime_state_file(&self) -> PathBuf {
        self.base_dir.join("stack.runtime.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    pub fn stack_log(&self) -> PathBuf {
        self.logs_dir().join("stack.log")
    }

    pub fn supervisor_log(&self) -> PathBuf {
        self.logs_dir().join("supervisor.log")
    }

    pub fn child_log(&self, child: &str) -> PathBuf {
        self.logs_dir().join(format!("{child}.log"))
    }

    pub fn default_cli_home(&self) -> PathBuf {
        self.base_dir.join("cli")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.storage_dir.join(".archived")
    }

    pub fn exists(&self) -> bool {
        self.env_file().is_file()
    }

    pub fn is_main(&self) -> bool {
        self.name == MAIN_STACK
    }
}

/// Validates a stack name before it is turned into a directory.
pub fn validate_stack_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| {
        Err(StackError::InvalidName {
            name: name.to_string(),
            reason: reason.to_string(),
        }
        .into())
    };
    if name.is_empty() {
        return invalid("name cannot be empty");
    }
    if name == "." || name.contains("..") {
        return invalid("name cannot reference '.' or '..'");
    }
    if name.contains('/') || name.contains('\\') {
        return invalid("name cannot contain path separators");
    }
    if name.starts_with('.') {
        return invalid("name cannot start with '.'");
    }
    if name.chars().any(char::is_whitespace) {
        return invalid("name cannot contain spaces");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return invalid("name must be printable ASCII letters, numbers, '-', '_' or '.'");
    }
    Ok(())
}

/// Lists stack names that have a persisted env file, sorted.
pub fn list_stack_names(storage_dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(storage_dir) else {
        return vec![];
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().join("env").is_file())
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .filter(|n| !n.starts_with('.'))
        .collect();
    names.sort();
    names
}

/// Expands a leading `~/` against `home`.
pub fn expand_home(value: &str, home: &Path) -> String {
    match value.strip_prefix("~/") {
        Some(rest) => home.join(rest).to_string_lossy().to_string(),
        None => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_paths_are_deterministic() {
        let p = StackPaths::new(Path::new("/s"), "exp1");
        assert_eq!(p.env_file(), PathBuf::from("/s/exp1/env"));
        assert_eq!(
            p.runtime_state_file(),
            PathBuf::from("/s/exp1/stack.runtime.json")
        );
        assert_eq!(p.default_cli_home(), PathBuf::from("/s/exp1/cli"));
        assert_eq!(p.child_log("server"), PathBuf::from("/s/exp1/logs/server.log"));
        assert!(!p.is_main());
        assert!(StackPaths::new(Path::new("/s"), MAIN_STACK).is_main());
    }

    #[test]
    fn test_validate_stack_name() {
        assert!(validate_stack_name("exp1").is_ok());
        assert!(validate_stack_name("pr-123_x").is_ok());
        assert!(validate_stack_name("").is_err());
        assert!(validate_stack_name("a/b").is_err());
        assert!(validate_stack_name("..").is_err());
        assert!(validate_stack_name(".hidden").is_err());
        assert!(validate_stack_name("my stack").is_err());
        assert!(validate_stack_name("caf\u{e9}").is_err());
    }

    #[test]
    fn test_list_stack_names_skips_dirs_without_env() {
        let dir = TempDir::new().unwrap();
        for name in ["b", "a", "noenv", ".archived"] {
            std::fs::create_dir_all(dir.path().join(name)).unwrap();
        }
        std::fs::write(dir.path().join("a/env"), "").unwrap();
        std::fs::write(dir.path().join("b/env"), "").unwrap();
        std::fs::write(dir.path().join(".archived/env"), "").unwrap();
        assert_eq!(list_stack_names(dir.path()), vec!["a", "b"]);
    }

    #[test]
    fn test_expand_home() {
        let home = Path::new("/home/dev");
        assert_eq!(expand_home("~/code/x", home), "/home/dev/code/x");
        assert_eq!(expand_home("/abs", home), "/abs");
        assert_eq!(expand_home("~user", home), "~user");
    }
}
