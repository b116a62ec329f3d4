use crate::procs::ProcessIntrospector;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const STATE_FILE: &str = "daemon.state.json";
pub const LOCK_FILE: &str = "daemon.state.json.lock";

/// Where a stack's CLI daemon is in its lifecycle, as seen from its
/// `daemon.state.json` and lock files.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumIs,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DaemonStatus {
    /// Neither file exists.
    Stopped,
    /// Lock held by a live pid, no live or readable state pid yet.
    Starting,
    /// State file pid is alive.
    Running,
    /// Lock file pid is dead.
    StaleLock,
    /// State file pid is dead and nobody holds the lock.
    StaleState,
    /// Lock file does not contain a pid.
    BadLock,
    /// State file is unparseable or has no usable pid, and no live pid
    /// holds the lock.
    BadState,
}

impl DaemonStatus {
    /// Leftovers that may be removed before a fresh start.
    pub fn is_cleanable(&self) -> bool {
        matches!(
            self,
            DaemonStatus::StaleLock
                | DaemonStatus::StaleState
                | DaemonStatus::BadLock
                | DaemonStatus::BadState
        )
    }

    pub fn style(&self) -> String {
        let s = self.to_string();
        match self {
            DaemonStatus::Running => console::style(s).green().to_string(),
            DaemonStatus::Starting => console::style(s).yellow().to_string(),
            DaemonStatus::Stopped => console::style(s).dim().to_string(),
            DaemonStatus::StaleLock
            | DaemonStatus::StaleState
            | DaemonStatus::BadLock
            | DaemonStatus::BadState => console::style(s).red().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaemonState {
    pub status: DaemonStatus,
    pub pid: Option<u32>,
}

impl DaemonState {
    fn new(status: DaemonStatus, pid: Option<u32>) -> Self {
        Self { status, pid }
    }
}

pub fn state_file(cli_home: &Path) -> PathBuf {
    cli_home.join(STATE_FILE)
}

pub fn lock_file(cli_home: &Path) -> PathBuf {
    cli_home.join(LOCK_FILE)
}

enum PidFile {
    Missing,
    Bad,
    Pid(u32),
}

fn read_state_pid(path: &Path) -> PidFile {
    #[derive(Deserialize)]
    struct Raw {
        pid: Option<serde_json::Value>,
    }
    let Ok(raw) = std::fs::read_to_string(path) else {
        return PidFile::Missing;
    };
    match serde_json::from_str::<Raw>(&raw)
        .ok()
        .and_then(|r| r.pid)
        .and_then(|v| v.as_u64())
        .and_then(|p| u32::try_from(p).ok())
    {
        Some(pid) if pid > 0 => PidFile::Pid(pid),
        _ => PidFile::Bad,
    }
}

fn read_lock_pid(path: &Path) -> PidFile {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return PidFile::Missing;
    };
    match raw.trim().parse::<u32>() {
        Ok(pid) if pid > 0 => PidFile::Pid(pid),
        _ => PidFile::Bad,
    }
}

/// Classifies the daemon from its files. Read only. The state file is
/// consulted first; the lock only decides when no live state pid exists.
pub fn check_daemon_state(cli_home: &Path, procs: &dyn ProcessIntrospector) -> DaemonState {
    let lock = read_lock_pid(&lock_file(cli_home));
    match read_state_pid(&state_file(cli_home)) {
        PidFile::Pid(pid) if procs.is_alive(pid) => DaemonState::new(DaemonStatus::Running, Some(pid)),
        PidFile::Pid(pid) => match lock {
            PidFile::Pid(lock_pid) if procs.is_alive(lock_pid) => {
                DaemonState::new(DaemonStatus::Starting, Some(lock_pid))
            }
            _ => DaemonState::new(DaemonStatus::StaleState, Some(pid)),
        },
        // a live lock holder may still be writing the state file
        PidFile::Bad => match lock {
            PidFile::Pid(lock_pid) if procs.is_alive(lock_pid) => {
                DaemonState::new(DaemonStatus::Starting, Some(lock_pid))
            }
            _ => DaemonState::new(DaemonStatus::BadState, None),
        },
        PidFile::Missing => match lock {
            PidFile::Missing => DaemonState::new(DaemonStatus::Stopped, None),
            PidFile::Bad => DaemonState::new(DaemonStatus::BadLock, None),
            PidFile::Pid(pid) if procs.is_alive(pid) => {
                DaemonState::new(DaemonStatus::Starting, Some(pid))
            }
            PidFile::Pid(pid) => DaemonState::new(DaemonStatus::StaleLock, Some(pid)),
        },
    }
}

/// The pid recorded in the lock file, if it parses.
pub fn lock_pid(cli_home: &Path) -> Option<u32> {
    match read_lock_pid(&lock_file(cli_home)) {
        PidFile::Pid(pid) => Some(pid),
        _ => None,
    }
}
