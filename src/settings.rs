//! Orchestrator-wide settings.
//!
//! Settings are resolved in this order (later wins):
//! 1. Built-in defaults
//! 2. `[settings]` section of `<storage>/config.toml`
//! 3. Environment variables (`HAPPY_STACKS_READY_TIMEOUT=2m`, ...)
//!
//! Example config.toml:
//! ```toml
//! [settings.ports]
//! server_base = 4010
//!
//! [settings.ready]
//! timeout = "2m"
//!
//! [settings.daemon]
//! auth_wait_timeout = "5m"
//! ```
//!
//! Per-stack values (ports, commands, flags) do not live here; they come from
//! each stack's env file.

use crate::Result;
use crate::env::AmbientEnv;
use crate::error::FileError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub ports: PortSettings,
    pub ready: ReadySettings,
    pub kill: KillSettings,
    pub daemon: DaemonSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortSettings {
    pub server_base: u16,
    pub backend_base: u16,
    pub pg_base: u16,
    pub redis_base: u16,
    pub minio_base: u16,
    pub ui_base: u16,
    pub max_tries: u32,
    pub host: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadySettings {
    pub timeout: String,
    pub interval: String,
    pub health_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KillSettings {
    pub grace: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    pub auth_wait_timeout: String,
    pub auth_poll_interval: String,
    pub start_timeout: String,
    pub log_tail_lines: usize,
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            server_base: 3010,
            backend_base: 3040,
            pg_base: 15432,
            redis_base: 16379,
            minio_base: 19000,
            ui_base: 8081,
            max_tries: 200,
            host: "127.0.0.1".to_string(),
        }
    }
}

impl Default for ReadySettings {
    fn default() -> Self {
        Self {
            timeout: "90s".to_string(),
            interval: "500ms".to_string(),
            health_path: "/health".to_string(),
        }
    }
}

impl Default for KillSettings {
    fn default() -> Self {
        Self {
            grace: "3s".to_string(),
        }
    }
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            auth_wait_timeout: "10m".to_string(),
            auth_poll_interval: "1s".to_string(),
            start_timeout: "30s".to_string(),
            log_tail_lines: 60,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    settings: Settings,
}

impl Settings {
    /// Loads settings from `path` (missing file means defaults), then applies
    /// environment overrides from `ambient`.
    pub fn load(path: &Path, ambient: &AmbientEnv) -> Result<Self> {
        let mut settings = if path.exists() {
            let raw = xx::file::read_to_string(path)?;
            toml::from_str::<ConfigFile>(&raw)
                .map_err(|e| FileError::ParseError {
                    path: path.to_path_buf(),
                    message: e.message().to_string(),
                })?
                .settings
        } else {
            Settings::default()
        };
        settings.apply_env(ambient);
        Ok(settings)
    }

    fn apply_env(&mut self, ambient: &AmbientEnv) {
        let overrides: [(&str, &mut String); 4] = [
            ("READY_TIMEOUT", &mut self.ready.timeout),
            ("KILL_GRACE", &mut self.kill.grace),
            ("AUTH_WAIT_TIMEOUT", &mut self.daemon.auth_wait_timeout),
            ("DAEMON_START_TIMEOUT", &mut self.daemon.start_timeout),
        ];
        for (suffix, field) in overrides {
            if let Some(val) = ambient.stack_var(suffix) {
                if Self::parse_duration(val).is_some() {
                    *field = val.trim().to_string();
                } else {
                    warn!("ignoring invalid duration for {suffix}: {val}");
                }
            }
        }
        if let Some(tries) = ambient
            .stack_var("PORT_MAX_TRIES")
            .and_then(|v| v.trim().parse().ok())
        {
            self.ports.max_tries = tries;
        }
    }

    pub fn parse_duration(s: &str) -> Option<Duration> {
        humantime::parse_duration(s.trim()).ok()
    }

    fn duration_or(s: &str, fallback: Duration) -> Duration {
        Self::parse_duration(s).unwrap_or_else(|| {
            warn!("invalid duration '{s}', using {fallback:?}");
            fallback
        })
    }

    pub fn ready_timeout(&self) -> Duration {
        Self::duration_or(&self.ready.timeout, Duration::from_secs(90))
    }

    pub fn ready_interval(&self) -> Duration {
        Self::duration_or(&self.ready.interval, Duration::from_millis(500))
    }

    pub fn kill_grace(&self) -> Duration {
        Self::duration_or(&self.kill.grace, Duration::from_secs(3))
    }

    pub fn auth_wait_timeout(&self) -> Duration {
        Self::duration_or(&self.daemon.auth_wait_timeout, Duration::from_secs(600))
    }

    pub fn auth_poll_interval(&self) -> Duration {
        Self::duration_or(&self.daemon.auth_poll_interval, Duration::from_secs(1))
    }

    pub fn daemon_start_timeout(&self) -> Duration {
        Self::duration_or(&self.daemon.start_timeout, Duration::from_secs(30))
    }
}
