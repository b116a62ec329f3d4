use once_cell::sync::Lazy;
pub use std::env::*;
use std::collections::BTreeMap;
use std::path::PathBuf;

pub const PREFIX: &str = "HAPPY_STACKS_";
pub const LEGACY_PREFIX: &str = "HAPPY_LOCAL_";

pub static HAPPYS_BIN: Lazy<PathBuf> = Lazy::new(|| {
    current_exe()
        .and_then(|p| p.canonicalize())
        .unwrap_or_else(|e| {
            eprintln!("Warning: Could not determine happys binary path: {e}");
            args()
                .next()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("happys"))
        })
});

pub static HOME_DIR: Lazy<PathBuf> = Lazy::new(|| {
    dirs::home_dir().unwrap_or_else(|| {
        eprintln!("Warning: Could not determine home directory");
        PathBuf::from("/tmp")
    })
});

/// Root under which every stack lives (`<storage>/<name>/env`).
pub static HAPPY_STACKS_STORAGE_DIR: Lazy<PathBuf> = Lazy::new(|| {
    var_path_either("STORAGE_DIR").unwrap_or(HOME_DIR.join(".happy").join("stacks"))
});
pub static HAPPY_STACKS_CONFIG_FILE: Lazy<PathBuf> =
    Lazy::new(|| HAPPY_STACKS_STORAGE_DIR.join("config.toml"));
pub static HAPPY_STACKS_LOGS_DIR: Lazy<PathBuf> =
    Lazy::new(|| HAPPY_STACKS_STORAGE_DIR.join("logs"));
pub static HAPPY_STACKS_LOG_FILE: Lazy<PathBuf> =
    Lazy::new(|| HAPPY_STACKS_LOGS_DIR.join("happys.log"));
pub static HAPPY_STACKS_LOG: Lazy<log::LevelFilter> =
    Lazy::new(|| var_log_level_either("LOG").unwrap_or(log::LevelFilter::Info));
pub static HAPPY_STACKS_LOG_FILE_LEVEL: Lazy<log::LevelFilter> =
    Lazy::new(|| var_log_level_either("LOG_FILE_LEVEL").unwrap_or(*HAPPY_STACKS_LOG));

/// Captured copy of the process environment.
///
/// Taken once at CLI entry and handed down explicitly; resolvers and
/// controllers only ever see this snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AmbientEnv {
    vars: BTreeMap<String, String>,
}

impl AmbientEnv {
    pub fn capture() -> Self {
        Self {
            vars: vars().collect(),
        }
    }

    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Looks up a stack-scoped key under either prefix, new prefix first.
    pub fn stack_var(&self, suffix: &str) -> Option<&str> {
        [PREFIX, LEGACY_PREFIX]
            .iter()
            .filter_map(|p| self.get(&format!("{p}{suffix}")))
            .find(|v| !v.trim().is_empty())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.vars.iter()
    }
}

fn var_either(suffix: &str) -> Option<String> {
    [PREFIX, LEGACY_PREFIX]
        .iter()
        .filter_map(|p| var(format!("{p}{suffix}")).ok())
        .find(|v| !v.trim().is_empty())
}

fn var_path_either(suffix: &str) -> Option<PathBuf> {
    var_either(suffix).map(PathBuf::from)
}

fn var_log_level_either(suffix: &str) -> Option<log::LevelFilter> {
    var_either(suffix).and_then(|level| level.parse().ok())
}

pub fn is_truthy(val: &str) -> bool {
    matches!(
        val.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

pub fn is_falsy(val: &str) -> bool {
    matches!(
        val.trim().to_lowercase().as_str(),
        "0" | "false" | "no" | "off"
    )
}
