//! Effective environment of a stack.
//!
//! Resolution layers, lowest to highest precedence:
//! 1. ambient process environment, with every stack-prefixed key stripped
//!    except [`AMBIENT_ALLOW_LIST`]
//! 2. identity keys (`STACK`, `ENV_FILE`, `RUNTIME_STATE_PATH`)
//! 3. the stack's persisted env file
//! 4. live ports from runtime state, only while its owner pid is alive
//! 5. one-shot overrides from the caller
//!
//! Keys are canonicalized to the `HAPPY_STACKS_` prefix while layering. The
//! legacy `HAPPY_LOCAL_` spelling only reappears in [`StackEnv::process_env`],
//! which mirrors every stack key under both prefixes for child processes.

use crate::Result;
use crate::env::{AmbientEnv, LEGACY_PREFIX, PREFIX, is_falsy, is_truthy};
use crate::env_file::{self, EnvPairs};
use crate::error::{FileError, StackError};
use crate::paths::{MAIN_STACK, StackPaths, expand_home};
use crate::ports::PortKind;
use crate::procs::ProcessIntrospector;
use crate::runtime_state;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Stack-prefixed keys that survive the ambient strip.
pub const AMBIENT_ALLOW_LIST: &[&str] = &[
    "SANDBOX_DIR",
    "STACK",
    "VERBOSE",
    "AUTH_FLOW",
    "DAEMON_WAIT_FOR_AUTH",
];

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, strum::Display, strum::EnumString,
)]
pub enum ServerFlavor {
    #[default]
    #[strum(serialize = "happy-server-light")]
    Light,
    #[strum(serialize = "happy-server")]
    Full,
}

impl ServerFlavor {
    /// Ports this flavor needs. The light server embeds its storage.
    pub fn port_kinds(&self) -> &'static [PortKind] {
        match self {
            ServerFlavor::Light => &[PortKind::Server],
            ServerFlavor::Full => &[
                PortKind::Server,
                PortKind::Backend,
                PortKind::Pg,
                PortKind::Redis,
                PortKind::Minio,
                PortKind::MinioConsole,
            ],
        }
    }
}

/// Whether an invocation is stack-scoped and where the stack's files live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackContext {
    /// False in legacy single-instance mode (no explicit stack anywhere).
    pub stack_mode: bool,
    pub stack_name: String,
    pub env_path: PathBuf,
    pub runtime_state_path: PathBuf,
    pub ephemeral: bool,
}

/// Decides which stack an invocation targets. An explicit name wins over the
/// ambient active-stack pointer; with neither, the invocation runs against
/// `main` in legacy mode.
pub fn resolve_stack_context(
    ambient: &AmbientEnv,
    storage_dir: &Path,
    home_dir: &Path,
    explicit: Option<&str>,
) -> StackContext {
    let pointer = ambient.stack_var("STACK").map(str::trim);
    let stack_mode = explicit.is_some() || pointer.is_some();
    let stack_name = explicit
        .or(pointer)
        .unwrap_or(MAIN_STACK)
        .to_string();
    let paths = StackPaths::new(storage_dir, &stack_name);
    let pinned = env_file::read(&paths.env_file(), home_dir)
        .ok()
        .flatten()
        .map(|pairs| canonicalize(pairs.iter()))
        .is_some_and(|pairs| has_value(&pairs, PortKind::Server.env_suffix()));
    StackContext {
        stack_mode,
        ephemeral: stack_mode && !pinned,
        env_path: paths.env_file(),
        runtime_state_path: paths.runtime_state_file(),
        stack_name,
    }
}

/// Inputs to [`StackEnv::resolve`].
pub struct ResolveRequest<'a> {
    pub storage_dir: &'a Path,
    pub home_dir: &'a Path,
    pub ambient: &'a AmbientEnv,
    pub procs: &'a dyn ProcessIntrospector,
    pub overrides: BTreeMap<String, String>,
}

/// Typed view of the resolved stack keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackConfig {
    pub flavor: ServerFlavor,
    pub ports: BTreeMap<PortKind, u16>,
    pub ui_port: Option<u16>,
    pub public_server_url: Option<String>,
    pub server_cmd: Option<String>,
    pub ui_cmd: Option<String>,
    pub cli_bin: Option<PathBuf>,
    pub cli_build_cmd: Option<String>,
    pub cli_home_dir: PathBuf,
    pub cli_auto_rebuild: bool,
    pub start_daemon: bool,
    pub start_ui: bool,
    pub auto_auth_seed: bool,
    pub auth_seed_from: Option<String>,
    pub component_dirs: BTreeMap<String, PathBuf>,
}

#[derive(Debug, Clone)]
pub struct StackEnv {
    pub paths: StackPaths,
    /// Canonical resolved variables (stack keys under `HAPPY_STACKS_` only).
    vars: BTreeMap<String, String>,
    /// Ports pinned by the env file, before any runtime overlay.
    pub pinned_ports: BTreeMap<PortKind, u16>,
    pub config: StackConfig,
    home_dir: PathBuf,
}

impl StackEnv {
    pub fn resolve(name: &str, req: ResolveRequest<'_>) -> Result<Self> {
        let paths = StackPaths::new(req.storage_dir, name);
        let mut vars = BTreeMap::new();

        // 1. ambient, stripped
        for (key, value) in canonicalize(req.ambient.iter()) {
            match key.strip_prefix(PREFIX) {
                Some(suffix) if !AMBIENT_ALLOW_LIST.contains(&suffix) => {
                    trace!("stripping ambient {key}");
                }
                _ => {
                    vars.insert(key, value);
                }
            }
        }

        // 2. identity
        vars.insert(format!("{PREFIX}STACK"), name.to_string());
        vars.insert(
            format!("{PREFIX}ENV_FILE"),
            paths.env_file().to_string_lossy().to_string(),
        );
        vars.insert(
            format!("{PREFIX}RUNTIME_STATE_PATH"),
            paths.runtime_state_file().to_string_lossy().to_string(),
        );

        // 3. persisted config
        let file_pairs = match env_file::read(&paths.env_file(), req.home_dir)? {
            Some(pairs) => canonicalize(pairs.iter()),
            None if paths.is_main() => BTreeMap::new(),
            None => {
                return Err(StackError::NotFound {
                    name: name.to_string(),
                    help: format!("create it first: happys stack new {name}"),
                }
                .into());
            }
        };
        let pinned_ports = parse_ports(&file_pairs, &paths.env_file())?;
        vars.extend(file_pairs);

        // 4. live runtime overlay
        if let Some(state) = runtime_state::read_stack_runtime_state_file(&paths.runtime_state_file())
        {
            if state.owner_alive(req.procs) {
                for (key, port) in &state.ports {
                    if let Some(kind) = PortKind::from_key(key) {
                        vars.insert(format!("{PREFIX}{}", kind.env_suffix()), port.to_string());
                    }
                }
                if let Some(web_port) = state.expo.as_ref().and_then(|e| e.web_port) {
                    vars.insert(format!("{PREFIX}UI_PORT"), web_port.to_string());
                }
            } else {
                debug!("ignoring stale runtime state for stack {name}");
            }
        }

        // 5. overrides
        vars.extend(canonicalize(req.overrides.iter()));

        let config = build_config(&vars, &paths, req.home_dir)?;
        Ok(Self {
            paths,
            vars,
            pinned_ports,
            config,
            home_dir: req.home_dir.to_path_buf(),
        })
    }

    pub fn name(&self) -> &str {
        &self.paths.name
    }

    /// Canonical lookup by suffix (`SERVER_PORT`), empty values are `None`.
    pub fn get(&self, suffix: &str) -> Option<&str> {
        self.vars
            .get(&format!("{PREFIX}{suffix}"))
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    pub fn is_ephemeral(&self) -> bool {
        !self.pinned_ports.contains_key(&PortKind::Server)
    }

    pub fn server_port(&self) -> Option<u16> {
        self.config.ports.get(&PortKind::Server).copied()
    }

    /// URL the orchestrator uses for health checks and the daemon.
    pub fn internal_server_url(&self) -> Option<String> {
        self.server_port().map(|p| format!("http://127.0.0.1:{p}"))
    }

    /// URL shown to users; falls back to the internal URL.
    pub fn public_server_url(&self) -> Option<String> {
        self.config
            .public_server_url
            .clone()
            .or_else(|| self.internal_server_url())
    }

    pub fn ui_url(&self) -> Option<String> {
        self.config
            .ui_port
            .map(|p| format!("http://localhost:{p}"))
    }

    /// Applies more one-shot overrides (e.g. freshly allocated ports) on top
    /// of the resolved environment.
    pub fn apply_overrides<'a, I>(&mut self, overrides: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        self.vars.extend(canonicalize(overrides));
        self.config = build_config(&self.vars, &self.paths, &self.home_dir)?;
        Ok(())
    }

    pub fn apply_ports(&mut self, ports: &BTreeMap<PortKind, u16>) -> Result<()> {
        let overrides: BTreeMap<String, String> = ports
            .iter()
            .map(|(k, p)| (format!("{PREFIX}{}", k.env_suffix()), p.to_string()))
            .collect();
        self.apply_overrides(overrides.iter())
    }

    /// Environment handed to child processes: every stack key under both
    /// prefixes, holding the same value.
    pub fn process_env(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for (key, value) in &self.vars {
            if let Some(suffix) = key.strip_prefix(PREFIX) {
                out.insert(format!("{LEGACY_PREFIX}{suffix}"), value.clone());
            }
            out.insert(key.clone(), value.clone());
        }
        out
    }
}

/// Rewrites legacy keys to the canonical prefix. When both spellings are
/// present, a non-empty canonical value wins, then a non-empty legacy value.
fn canonicalize<'a, I>(pairs: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    let mut out: BTreeMap<String, String> = BTreeMap::new();
    let mut from_canonical: BTreeMap<String, bool> = BTreeMap::new();
    for (key, value) in pairs {
        let (canonical, is_legacy) = match key.strip_prefix(LEGACY_PREFIX) {
            Some(suffix) => (format!("{PREFIX}{suffix}"), true),
            None => (key.clone(), false),
        };
        let current = out.get(&canonical);
        let replace = match current {
            None => true,
            Some(existing) => {
                let existing_canonical = from_canonical.get(&canonical).copied().unwrap_or(false);
                if value.trim().is_empty() {
                    existing.trim().is_empty() && !is_legacy
                } else if existing.trim().is_empty() {
                    true
                } else {
                    // both non-empty: canonical spelling wins
                    !is_legacy || !existing_canonical
                }
            }
        };
        if replace {
            from_canonical.insert(canonical.clone(), !is_legacy);
            out.insert(canonical, value.clone());
        }
    }
    out
}

fn has_value(vars: &BTreeMap<String, String>, suffix: &str) -> bool {
    vars.get(&format!("{PREFIX}{suffix}"))
        .is_some_and(|v| !v.trim().is_empty())
}

fn parse_ports(vars: &BTreeMap<String, String>, source: &Path) -> Result<BTreeMap<PortKind, u16>> {
    let mut ports = BTreeMap::new();
    for kind in <PortKind as strum::IntoEnumIterator>::iter() {
        let key = format!("{PREFIX}{}", kind.env_suffix());
        if let Some(raw) = vars.get(&key).map(|v| v.trim()).filter(|v| !v.is_empty()) {
            let port = parse_port(&key, raw, source)?;
            ports.insert(kind, port);
        }
    }
    Ok(ports)
}

fn parse_port(key: &str, raw: &str, source: &Path) -> Result<u16> {
    match raw.parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(FileError::ParseError {
            path: source.to_path_buf(),
            message: format!("{key} must be a TCP port number, got '{raw}'"),
        }
        .into()),
    }
}

fn build_config(
    vars: &BTreeMap<String, String>,
    paths: &StackPaths,
    home_dir: &Path,
) -> Result<StackConfig> {
    let get = |suffix: &str| {
        vars.get(&format!("{PREFIX}{suffix}"))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    let flag = |suffix: &str, default: bool| match get(suffix) {
        Some(v) if is_truthy(&v) => true,
        Some(v) if is_falsy(&v) => false,
        Some(v) => {
            warn!("ignoring non-boolean {PREFIX}{suffix}={v}");
            default
        }
        None => default,
    };

    let flavor = match get("SERVER_COMPONENT") {
        Some(value) => value
            .parse::<ServerFlavor>()
            .map_err(|_| StackError::InvalidFlavor { value })?,
        None => ServerFlavor::default(),
    };
    let ports = parse_ports(vars, &paths.env_file())?;
    let ui_port = match get("UI_PORT") {
        Some(raw) => Some(parse_port("UI_PORT", &raw, &paths.env_file())?),
        None => None,
    };
    let path = |v: String| PathBuf::from(expand_home(&v, home_dir));
    let component_prefix = format!("{PREFIX}COMPONENT_DIR_");
    let component_dirs = vars
        .iter()
        .filter_map(|(k, v)| {
            let name = k.strip_prefix(&component_prefix)?;
            let v = v.trim();
            (!v.is_empty()).then(|| (name.to_lowercase(), path(v.to_string())))
        })
        .collect();
    let ui_cmd = get("UI_CMD");

    Ok(StackConfig {
        flavor,
        ports,
        ui_port,
        public_server_url: get("SERVER_URL"),
        server_cmd: get("SERVER_CMD"),
        start_ui: flag("START_UI", ui_cmd.is_some()),
        ui_cmd,
        cli_bin: get("CLI_BIN").map(path),
        cli_build_cmd: get("CLI_BUILD_CMD"),
        cli_home_dir: get("CLI_HOME_DIR")
            .map(path)
            .unwrap_or_else(|| paths.default_cli_home()),
        cli_auto_rebuild: flag("CLI_AUTO_REBUILD", true),
        start_daemon: flag("START_DAEMON", true),
        auto_auth_seed: flag("AUTO_AUTH_SEED", false),
        auth_seed_from: get("AUTH_SEED_FROM"),
        component_dirs,
    })
}

/// Pairs to persist for a brand-new stack.
pub fn initial_env_pairs(name: &str, paths: &StackPaths, flavor: ServerFlavor) -> EnvPairs {
    let mut pairs = EnvPairs::new();
    pairs.insert(format!("{PREFIX}STACK"), name.to_string());
    pairs.insert(format!("{PREFIX}SERVER_COMPONENT"), flavor.to_string());
    pairs.insert(
        format!("{PREFIX}CLI_HOME_DIR"),
        paths.default_cli_home().to_string_lossy().to_string(),
    );
    pairs
}
