//! In-memory [`ProcessIntrospector`] for tests.

use super::{ProcessIntrospector, Sig};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Debug, Clone, Default)]
pub struct FakeProcess {
    pub alive: bool,
    pub cmdline: Option<String>,
    pub env: Option<Vec<String>>,
    pub open_paths: Option<Vec<PathBuf>>,
    pub listen_ports: Vec<u16>,
    pub pgid: Option<u32>,
    /// Survives SIGINT/SIGTERM; only SIGKILL takes it down.
    pub ignores_term: bool,
    /// Survives every signal, like a process stuck in uninterruptible sleep.
    pub ignores_kill: bool,
}

impl FakeProcess {
    pub fn alive() -> Self {
        Self {
            alive: true,
            ..Default::default()
        }
    }

    pub fn with_cmdline(mut self, cmdline: &str) -> Self {
        self.cmdline = Some(cmdline.to_string());
        self
    }

    pub fn with_env<I, S>(mut self, env: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.env = Some(env.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_open(mut self, path: impl Into<PathBuf>) -> Self {
        self.open_paths.get_or_insert_with(Vec::new).push(path.into());
        self
    }

    pub fn listening(mut self, port: u16) -> Self {
        self.listen_ports.push(port);
        self
    }

    pub fn in_group(mut self, pgid: u32) -> Self {
        self.pgid = Some(pgid);
        self
    }

    pub fn stubborn(mut self) -> Self {
        self.ignores_term = true;
        self
    }

    pub fn immortal(mut self) -> Self {
        self.ignores_term = true;
        self.ignores_kill = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentSignal {
    pub pid: u32,
    pub sig: Sig,
    pub group: bool,
}

#[derive(Debug, Default)]
pub struct FakeProcs {
    procs: Mutex<BTreeMap<u32, FakeProcess>>,
    signals: Mutex<Vec<SentSignal>>,
}

impl FakeProcs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, pid: u32, process: FakeProcess) -> &Self {
        self.procs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pid, process);
        self
    }

    pub fn exit(&self, pid: u32) {
        if let Some(p) = self
            .procs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&pid)
        {
            p.alive = false;
            p.listen_ports.clear();
        }
    }

    pub fn signals(&self) -> Vec<SentSignal> {
        self.signals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn get(&self, pid: u32) -> Option<FakeProcess> {
        self.procs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&pid)
            .cloned()
    }
}

impl ProcessIntrospector for FakeProcs {
    fn is_alive(&self, pid: u32) -> bool {
        self.get(pid).is_some_and(|p| p.alive)
    }

    fn listening_pids(&self, port: u16) -> Vec<u32> {
        self.procs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, p)| p.alive && p.listen_ports.contains(&port))
            .map(|(pid, _)| *pid)
            .collect()
    }

    fn command_line(&self, pid: u32) -> Option<String> {
        self.get(pid).filter(|p| p.alive).and_then(|p| p.cmdline)
    }

    fn environment(&self, pid: u32) -> Option<Vec<String>> {
        self.get(pid).filter(|p| p.alive).and_then(|p| p.env)
    }

    fn open_paths(&self, pid: u32) -> Option<Vec<PathBuf>> {
        self.get(pid).filter(|p| p.alive).and_then(|p| p.open_paths)
    }

    fn is_group_leader(&self, pid: u32) -> bool {
        self.get(pid).is_some_and(|p| p.pgid == Some(pid))
    }

    fn signal(&self, pid: u32, sig: Sig, group: bool) -> bool {
        let mut procs = self.procs.lock().unwrap_or_else(|e| e.into_inner());
        let targets: Vec<u32> = if group {
            procs
                .iter()
                .filter(|(p, proc_)| **p == pid || proc_.pgid == Some(pid))
                .map(|(p, _)| *p)
                .collect()
        } else {
            vec![pid]
        };
        let mut delivered = false;
        for target in targets {
            if let Some(p) = procs.get_mut(&target)
                && p.alive
            {
                delivered = true;
                if !p.ignores_kill && (sig == Sig::Kill || !p.ignores_term) {
                    p.alive = false;
                    p.listen_ports.clear();
                }
            }
        }
        self.signals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(SentSignal { pid, sig, group });
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::procs::PathEvidence;

    #[test]
    fn test_group_signal_reaches_members() {
        let procs = FakeProcs::new();
        procs
            .add(10, FakeProcess::alive().in_group(10))
            .add(11, FakeProcess::alive().in_group(10).listening(3010))
            .add(12, FakeProcess::alive());
        assert!(procs.signal(10, Sig::Term, true));
        assert!(!procs.is_alive(10));
        assert!(!procs.is_alive(11));
        assert!(procs.is_alive(12));
        assert!(procs.listening_pids(3010).is_empty());
    }

    #[test]
    fn test_stubborn_needs_kill() {
        let procs = FakeProcs::new();
        procs.add(20, FakeProcess::alive().stubborn());
        procs.signal(20, Sig::Term, false);
        assert!(procs.is_alive(20));
        procs.signal(20, Sig::Kill, false);
        assert!(!procs.is_alive(20));
    }

    #[test]
    fn test_find_path_reference_sources() {
        let procs = FakeProcs::new();
        procs
            .add(
                1,
                FakeProcess::alive().with_env(["HAPPY_STACKS_ENV_FILE=/s/exp1/env"]),
            )
            .add(2, FakeProcess::alive().with_open("/s/exp1/logs/supervisor.log"))
            .add(3, FakeProcess::alive().with_cmdline("node server.js"))
            .add(4, FakeProcess::alive());

        let paths = [PathBuf::from("/s/exp1/env"), PathBuf::from("/s/exp1/logs")];
        assert!(matches!(
            procs.find_path_reference(1, &paths),
            PathEvidence::Referenced { source: "environment", .. }
        ));
        assert!(matches!(
            procs.find_path_reference(2, &paths),
            PathEvidence::Referenced { source: "open files", .. }
        ));
        assert_eq!(procs.find_path_reference(3, &paths), PathEvidence::Absent);
        assert_eq!(procs.find_path_reference(4, &paths), PathEvidence::Unknown);
    }
}
