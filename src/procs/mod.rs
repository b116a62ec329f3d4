//! Process introspection.
//!
//! Everything that asks the OS about a PID goes through [`ProcessIntrospector`]
//! so ownership checks and the daemon state machine can run against
//! [`fake::FakeProcs`] in tests. [`SystemProcs`] is the real implementation:
//! `nix` for signals, `sysinfo` for command lines and environments,
//! `listeners` for TCP listen sockets, and `/proc/<pid>/fd` or `lsof` for open
//! files. Every query degrades to "nothing known" instead of failing.

pub mod fake;

use once_cell::sync::Lazy;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, UpdateKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Sig {
    Int,
    Term,
    Kill,
}

/// Where a path reference was found for a PID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathEvidence {
    Referenced { source: &'static str, path: PathBuf },
    /// Introspection worked and none of the paths show up.
    Absent,
    /// No introspection source returned anything for this PID.
    Unknown,
}

pub trait ProcessIntrospector: Send + Sync {
    /// Null-signal probe. Permission errors count as "not alive".
    fn is_alive(&self, pid: u32) -> bool;

    /// PIDs holding a TCP listen socket on `port`. Empty when unknown.
    fn listening_pids(&self, port: u16) -> Vec<u32>;

    fn command_line(&self, pid: u32) -> Option<String>;

    /// `KEY=VALUE` entries of the process environment, `None` if unreadable.
    fn environment(&self, pid: u32) -> Option<Vec<String>>;

    /// Paths of the process's open file descriptors, `None` if unreadable.
    fn open_paths(&self, pid: u32) -> Option<Vec<PathBuf>>;

    fn is_group_leader(&self, pid: u32) -> bool;

    /// Delivers `sig` to `pid`, or to its process group when `group` is set.
    /// Returns whether delivery succeeded.
    fn signal(&self, pid: u32, sig: Sig, group: bool) -> bool;

    /// Looks for any of `paths` in the process's environment, command line,
    /// or open files.
    fn find_path_reference(&self, pid: u32, paths: &[PathBuf]) -> PathEvidence {
        let env = self.environment(pid);
        let cmdline = self.command_line(pid);
        let open = self.open_paths(pid);

        for path in paths {
            let needle = path.to_string_lossy();
            if needle.is_empty() {
                continue;
            }
            if let Some(env) = &env
                && env.iter().any(|kv| contains_path(kv, &needle))
            {
                return PathEvidence::Referenced {
                    source: "environment",
                    path: path.clone(),
                };
            }
            if let Some(cmdline) = &cmdline
                && contains_path(cmdline, &needle)
            {
                return PathEvidence::Referenced {
                    source: "command line",
                    path: path.clone(),
                };
            }
            if let Some(open) = &open
                && open.iter().any(|p| p.starts_with(path))
            {
                return PathEvidence::Referenced {
                    source: "open files",
                    path: path.clone(),
                };
            }
        }

        if env.is_none() && cmdline.is_none() && open.is_none() {
            PathEvidence::Unknown
        } else {
            PathEvidence::Absent
        }
    }

    /// True when `path` (or a file below it) is among the process's open files.
    fn has_open(&self, pid: u32, path: &Path) -> bool {
        self.open_paths(pid)
            .is_some_and(|open| open.iter().any(|p| p.starts_with(path)))
    }
}

/// Substring match that only accepts `needle` when it ends on a path
/// boundary, so `/s/exp1` does not match inside `/s/exp10`.
pub fn contains_path(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    haystack.match_indices(needle).any(|(idx, _)| {
        match haystack[idx + needle.len()..].chars().next() {
            None => true,
            Some(c) => c == '/' || c.is_whitespace() || matches!(c, '"' | '\'' | ':' | ';'),
        }
    })
}

pub struct SystemProcs {
    system: Mutex<sysinfo::System>,
}

pub static PROCS: Lazy<SystemProcs> = Lazy::new(SystemProcs::new);

impl Default for SystemProcs {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProcs {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(sysinfo::System::new()),
        }
    }

    fn lock_system(&self) -> std::sync::MutexGuard<'_, sysinfo::System> {
        self.system.lock().unwrap_or_else(|poisoned| {
            warn!("System mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn with_process<T>(&self, pid: u32, f: impl FnOnce(&sysinfo::Process) -> T) -> Option<T> {
        let mut system = self.lock_system();
        let sys_pid = sysinfo::Pid::from_u32(pid);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[sys_pid]),
            true,
            ProcessRefreshKind::nothing()
                .with_cmd(UpdateKind::Always)
                .with_environ(UpdateKind::Always),
        );
        system.process(sys_pid).map(f)
    }
}

impl ProcessIntrospector for SystemProcs {
    #[cfg(unix)]
    fn is_alive(&self, pid: u32) -> bool {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        match i32::try_from(pid) {
            Ok(raw) if raw > 0 => kill(Pid::from_raw(raw), None).is_ok(),
            _ => false,
        }
    }

    #[cfg(not(unix))]
    fn is_alive(&self, pid: u32) -> bool {
        pid > 0 && self.with_process(pid, |_| ()).is_some()
    }

    fn listening_pids(&self, port: u16) -> Vec<u32> {
        match listeners::get_all() {
            Ok(all) => {
                let mut pids: Vec<u32> = all
                    .into_iter()
                    .filter(|l| l.socket.port() == port && l.protocol == listeners::Protocol::TCP)
                    .map(|l| l.process.pid)
                    .collect();
                pids.sort_unstable();
                pids.dedup();
                pids
            }
            Err(e) => {
                trace!("could not list listeners on port {port}: {e}");
                vec![]
            }
        }
    }

    fn command_line(&self, pid: u32) -> Option<String> {
        self.with_process(pid, |p| {
            p.cmd()
                .iter()
                .map(|a| a.to_string_lossy().to_string())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .filter(|c| !c.is_empty())
    }

    fn environment(&self, pid: u32) -> Option<Vec<String>> {
        self.with_process(pid, |p| {
            p.environ()
                .iter()
                .map(|kv| kv.to_string_lossy().to_string())
                .collect::<Vec<_>>()
        })
        // every real process has some environment; empty means unreadable
        .filter(|env| !env.is_empty())
    }

    fn open_paths(&self, pid: u32) -> Option<Vec<PathBuf>> {
        open_paths_for(pid)
    }

    #[cfg(unix)]
    fn is_group_leader(&self, pid: u32) -> bool {
        use nix::unistd::{Pid, getpgid};
        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        getpgid(Some(Pid::from_raw(raw))).is_ok_and(|pgid| pgid.as_raw() == raw)
    }

    #[cfg(not(unix))]
    fn is_group_leader(&self, _pid: u32) -> bool {
        false
    }

    #[cfg(unix)]
    fn signal(&self, pid: u32, sig: Sig, group: bool) -> bool {
        use nix::sys::signal::{Signal, kill, killpg};
        use nix::unistd::{Pid, getpgrp};
        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        if raw <= 0 || pid == std::process::id() {
            return false;
        }
        let signal = match sig {
            Sig::Int => Signal::SIGINT,
            Sig::Term => Signal::SIGTERM,
            Sig::Kill => Signal::SIGKILL,
        };
        let target = Pid::from_raw(raw);
        // never signal our own group
        if group && target != getpgrp() {
            debug!("sending SIG{sig} to process group {pid}");
            if killpg(target, signal).is_ok() {
                return true;
            }
        }
        debug!("sending SIG{sig} to pid {pid}");
        kill(target, signal).is_ok()
    }

    #[cfg(not(unix))]
    fn signal(&self, pid: u32, _sig: Sig, _group: bool) -> bool {
        self.with_process(pid, |p| p.kill()).unwrap_or(false)
    }
}

#[cfg(target_os = "linux")]
fn open_paths_for(pid: u32) -> Option<Vec<PathBuf>> {
    let entries = std::fs::read_dir(format!("/proc/{pid}/fd")).ok()?;
    Some(
        entries
            .filter_map(|e| e.ok())
            .filter_map(|e| std::fs::read_link(e.path()).ok())
            .filter(|p| p.is_absolute())
            .collect(),
    )
}

#[cfg(not(target_os = "linux"))]
fn open_paths_for(pid: u32) -> Option<Vec<PathBuf>> {
    // lsof exits 1 when some files could not be described; output is still usable
    let out = duct::cmd!("lsof", "-nP", "-p", pid.to_string(), "-Fn")
        .stderr_null()
        .unchecked()
        .read()
        .ok()?;
    let paths: Vec<PathBuf> = parse_lsof_names(&out);
    if paths.is_empty() { None } else { Some(paths) }
}

/// Extracts `n<path>` records from `lsof -F n` output.
#[allow(dead_code)]
pub(crate) fn parse_lsof_names(out: &str) -> Vec<PathBuf> {
    out.lines()
        .filter_map(|l| l.strip_prefix('n'))
        .filter(|p| p.starts_with('/'))
        .map(PathBuf::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lsof_names() {
        let out = "p123\nfcwd\nn/home/dev/stacks/exp1\nf3\nn/home/dev/stacks/exp1/cli/daemon.state.json.lock\nf4\nnlocalhost:3010\n";
        assert_eq!(
            parse_lsof_names(out),
            vec![
                PathBuf::from("/home/dev/stacks/exp1"),
                PathBuf::from("/home/dev/stacks/exp1/cli/daemon.state.json.lock"),
            ]
        );
    }

    #[test]
    fn test_contains_path_boundaries() {
        assert!(contains_path("HAPPY_HOME_DIR=/s/exp1/cli", "/s/exp1/cli"));
        assert!(contains_path("node /s/exp1/cli/bin.mjs daemon", "/s/exp1/cli"));
        assert!(!contains_path("HAPPY_HOME_DIR=/s/exp10/cli", "/s/exp1"));
        assert!(!contains_path("HAPPY_HOME_DIR=/s/exp1/cli2", "/s/exp1/cli"));
        assert!(!contains_path("anything", ""));
    }

    #[cfg(unix)]
    #[test]
    fn test_current_process_is_alive() {
        let procs = SystemProcs::new();
        assert!(procs.is_alive(std::process::id()));
        assert!(!procs.is_alive(0));
        assert!(!procs.is_alive(u32::MAX));
    }

    #[cfg(unix)]
    #[test]
    fn test_never_signals_self() {
        let procs = SystemProcs::new();
        assert!(!procs.signal(std::process::id(), Sig::Term, false));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_open_paths_sees_held_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("held.log");
        let _file = std::fs::File::create(&path).unwrap();
        let procs = SystemProcs::new();
        let canonical = path.canonicalize().unwrap();
        assert!(procs.has_open(std::process::id(), &canonical));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_listening_pids_sees_own_socket() {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let procs = SystemProcs::new();
        assert_eq!(procs.listening_pids(port), vec![std::process::id()]);
        drop(listener);
        assert!(procs.listening_pids(port).is_empty());
    }
}
