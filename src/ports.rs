//! TCP port allocation across stacks.
//!
//! Stacks are started by independent `happys` invocations, so "free right
//! now" is not enough: a port another stack has written down (env file or
//! live runtime state) but not yet bound is reserved too.

use crate::Result;
use crate::env_file;
use crate::error::PortError;
use crate::paths::{StackPaths, list_stack_names};
use crate::procs::ProcessIntrospector;
use crate::runtime_state;
use crate::settings::PortSettings;
use std::collections::BTreeSet;
use std::net::TcpListener;
use std::path::Path;

/// Logical ports a stack can own. `key()` is the runtime state JSON key and
/// `env_suffix()` the env file key after the prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::EnumIter)]
pub enum PortKind {
    Server,
    Backend,
    Pg,
    Redis,
    Minio,
    MinioConsole,
}

impl PortKind {
    pub fn key(&self) -> &'static str {
        match self {
            PortKind::Server => "server",
            PortKind::Backend => "backend",
            PortKind::Pg => "pg",
            PortKind::Redis => "redis",
            PortKind::Minio => "minio",
            PortKind::MinioConsole => "minioConsole",
        }
    }

    pub fn env_suffix(&self) -> &'static str {
        match self {
            PortKind::Server => "SERVER_PORT",
            PortKind::Backend => "BACKEND_PORT",
            PortKind::Pg => "PG_PORT",
            PortKind::Redis => "REDIS_PORT",
            PortKind::Minio => "MINIO_PORT",
            PortKind::MinioConsole => "MINIO_CONSOLE_PORT",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        <Self as strum::IntoEnumIterator>::iter().find(|k| k.key() == key)
    }

    pub fn base(&self, settings: &PortSettings) -> u16 {
        match self {
            PortKind::Server => settings.server_base,
            PortKind::Backend => settings.backend_base,
            PortKind::Pg => settings.pg_base,
            PortKind::Redis => settings.redis_base,
            PortKind::Minio => settings.minio_base,
            // the console sits right after minio; the allocator skips what minio took
            PortKind::MinioConsole => settings.minio_base.saturating_add(1),
        }
    }
}

/// Best-effort list of PIDs listening on `port`. Never fails.
pub fn list_listen_pids(procs: &dyn ProcessIntrospector, port: u16) -> Vec<u32> {
    procs.listening_pids(port)
}

/// True only when nobody listens on `port` and a bind on `host` succeeds.
pub fn is_port_free(procs: &dyn ProcessIntrospector, port: u16, host: &str) -> bool {
    if port == 0 {
        return false;
    }
    let pids = list_listen_pids(procs, port);
    if !pids.is_empty() {
        trace!("port {port} has listeners: {pids:?}");
        return false;
    }
    match TcpListener::bind((host, port)) {
        Ok(listener) => {
            drop(listener);
            true
        }
        Err(e) => {
            trace!("port {port} bind check failed: {e}");
            false
        }
    }
}

/// Linear probe upward from `start`, skipping `reserved` even when free.
pub fn pick_next_free_tcp_port(
    procs: &dyn ProcessIntrospector,
    start: u16,
    reserved: &BTreeSet<u16>,
    host: &str,
    max_tries: u32,
) -> Result<u16> {
    let mut port = start;
    for _ in 0..max_tries {
        if !reserved.contains(&port) && is_port_free(procs, port, host) {
            debug!("picked port {port} (start {start})");
            return Ok(port);
        }
        port = match port.checked_add(1) {
            Some(p) => p,
            None => break,
        };
    }
    Err(PortError::Exhausted {
        start,
        tries: max_tries,
    }
    .into())
}

/// Ports claimed by every stack except `exclude`: port-like values in their
/// env files, plus live ports of stacks whose runtime owner is alive.
pub fn collect_reserved_ports(
    storage_dir: &Path,
    home: &Path,
    exclude: &str,
    procs: &dyn ProcessIntrospector,
) -> BTreeSet<u16> {
    let mut reserved = BTreeSet::new();
    for name in list_stack_names(storage_dir) {
        if name == exclude {
            continue;
        }
        let paths = StackPaths::new(storage_dir, &name);
        match env_file::read(&paths.env_file(), home) {
            Ok(Some(pairs)) => {
                reserved.extend(
                    pairs
                        .iter()
                        .filter(|(k, _)| k.ends_with("_PORT"))
                        .filter_map(|(_, v)| v.trim().parse::<u16>().ok())
                        .filter(|p| *p > 0),
                );
            }
            Ok(None) => {}
            Err(e) => debug!("skipping env file of stack {name}: {e}"),
        }
        if let Some(state) = runtime_state::read_stack_runtime_state_file(&paths.runtime_state_file())
            && state.owner_alive(procs)
        {
            reserved.extend(state.all_ports());
        }
    }
    trace!("reserved ports (excluding {exclude}): {reserved:?}");
    reserved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::procs::fake::{FakeProcess, FakeProcs};
    use crate::runtime_state::{RuntimeStart, record_stack_runtime_start};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn free_base() -> u16 {
        // ask the OS for an ephemeral port, then probe from there
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_port_kind_keys_roundtrip() {
        for kind in <PortKind as strum::IntoEnumIterator>::iter() {
            assert_eq!(PortKind::from_key(kind.key()), Some(kind));
        }
        assert_eq!(PortKind::from_key("ui"), None);
    }

    #[test]
    fn test_is_port_free_detects_bound_socket() {
        let procs = FakeProcs::new();
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!is_port_free(&procs, port, "127.0.0.1"));
        drop(listener);
        assert!(!is_port_free(&procs, 0, "127.0.0.1"));
    }

    #[test]
    fn test_is_port_free_respects_listener_list() {
        let procs = FakeProcs::new();
        let port = free_base();
        assert!(is_port_free(&procs, port, "127.0.0.1"));
        procs.add(77, FakeProcess::alive().listening(port));
        assert!(!is_port_free(&procs, port, "127.0.0.1"));
    }

    #[test]
    fn test_pick_skips_reserved_and_occupied() {
        let procs = FakeProcs::new();
        let start = free_base();
        procs.add(5, FakeProcess::alive().listening(start + 1));
        let reserved: BTreeSet<u16> = [start].into_iter().collect();

        let port = pick_next_free_tcp_port(&procs, start, &reserved, "127.0.0.1", 50).unwrap();
        assert!(port >= start + 2);
        assert!(!reserved.contains(&port));
        assert!(is_port_free(&procs, port, "127.0.0.1"));
    }

    #[test]
    fn test_pick_fails_after_max_tries() {
        let procs = FakeProcs::new();
        let start = free_base();
        let reserved: BTreeSet<u16> = (start..start + 5).collect();
        let err = pick_next_free_tcp_port(&procs, start, &reserved, "127.0.0.1", 5).unwrap_err();
        assert!(err.to_string().contains("after 5 attempts"));
    }

    #[test]
    fn test_collect_reserved_ports() {
        let dir = TempDir::new().unwrap();
        let storage = dir.path();
        let procs = FakeProcs::new();
        procs.add(4242, FakeProcess::alive());

        let pinned = StackPaths::new(storage, "pinned");
        std::fs::create_dir_all(&pinned.base_dir).unwrap();
        std::fs::write(
            pinned.env_file(),
            "HAPPY_STACKS_SERVER_PORT=4101\nHAPPY_LOCAL_PG_PORT=4102\nHAPPY_STACKS_SERVER_URL=http://x\n",
        )
        .unwrap();

        let live = StackPaths::new(storage, "live");
        std::fs::create_dir_all(&live.base_dir).unwrap();
        std::fs::write(live.env_file(), "").unwrap();
        record_stack_runtime_start(
            &live.runtime_state_file(),
            RuntimeStart {
                stack_name: "live".to_string(),
                script: None,
                ephemeral: true,
                owner_pid: 4242,
                ports: BTreeMap::from([("server".to_string(), 4201)]),
            },
        )
        .unwrap();

        let dead = StackPaths::new(storage, "dead");
        std::fs::create_dir_all(&dead.base_dir).unwrap();
        std::fs::write(dead.env_file(), "").unwrap();
        record_stack_runtime_start(
            &dead.runtime_state_file(),
            RuntimeStart {
                stack_name: "dead".to_string(),
                script: None,
                ephemeral: true,
                owner_pid: 999_999,
                ports: BTreeMap::from([("server".to_string(), 4301)]),
            },
        )
        .unwrap();

        let reserved = collect_reserved_ports(storage, storage, "me", &procs);
        assert_eq!(reserved, [4101, 4102, 4201].into_iter().collect());

        let reserved = collect_reserved_ports(storage, storage, "pinned", &procs);
        assert_eq!(reserved, [4201].into_iter().collect());
    }
}
