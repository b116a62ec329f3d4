//! Proving that a PID belongs to a stack before touching it.
//!
//! Liveness is never enough: PIDs recycle. A process counts as owned only
//! when one of the stack's own paths (env file, CLI home, logs dir) shows up
//! in its environment, command line, or open files. Supervised children get
//! `HAPPY_STACKS_ENV_FILE` in their environment and the supervisor keeps
//! `logs/supervisor.log` open, so both leave evidence.

use crate::Result;
use crate::error::PortError;
use crate::ports::list_listen_pids;
use crate::procs::{PathEvidence, ProcessIntrospector, Sig};
use crate::stack_env::StackEnv;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Paths that identify one stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipProbe {
    pub stack_name: String,
    pub env_path: PathBuf,
    pub cli_home_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl OwnershipProbe {
    pub fn for_stack(env: &StackEnv) -> Self {
        Self {
            stack_name: env.name().to_string(),
            env_path: env.paths.env_file(),
            cli_home_dir: env.config.cli_home_dir.clone(),
            logs_dir: env.paths.logs_dir(),
        }
    }

    fn evidence_paths(&self) -> Vec<PathBuf> {
        vec![
            self.env_path.clone(),
            self.cli_home_dir.clone(),
            self.logs_dir.clone(),
        ]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KillOutcome {
    pub killed: bool,
}

/// True only with concrete path evidence. Unknown counts as not owned.
pub fn process_owned_by_stack(
    procs: &dyn ProcessIntrospector,
    pid: u32,
    probe: &OwnershipProbe,
) -> bool {
    if !procs.is_alive(pid) {
        return false;
    }
    match procs.find_path_reference(pid, &probe.evidence_paths()) {
        PathEvidence::Referenced { source, path } => {
            debug!(
                "pid {pid} belongs to stack {}: {} found in {source}",
                probe.stack_name,
                path.display()
            );
            true
        }
        PathEvidence::Absent => {
            debug!("pid {pid} has no reference to stack {}", probe.stack_name);
            false
        }
        PathEvidence::Unknown => {
            debug!(
                "pid {pid}: could not introspect, assuming not owned by {}",
                probe.stack_name
            );
            false
        }
    }
}

/// TERM then KILL after `grace`, signalling the whole group when `pid` leads
/// one. Does nothing unless the process is provably owned.
pub async fn kill_process_group_owned_by_stack(
    procs: &dyn ProcessIntrospector,
    pid: u32,
    probe: &OwnershipProbe,
    grace: Duration,
) -> KillOutcome {
    if !process_owned_by_stack(procs, pid, probe) {
        return KillOutcome { killed: false };
    }
    terminate(procs, pid, grace).await
}

/// Unconditional TERM-then-KILL. Callers must have established ownership.
pub(crate) async fn terminate(
    procs: &dyn ProcessIntrospector,
    pid: u32,
    grace: Duration,
) -> KillOutcome {
    let group = procs.is_group_leader(pid);
    let mut killed = procs.signal(pid, Sig::Term, group);
    if wait_for_exit(procs, pid, grace).await {
        return KillOutcome { killed };
    }
    warn!("pid {pid} survived SIGTERM for {grace:?}, sending SIGKILL");
    killed |= procs.signal(pid, Sig::Kill, group);
    wait_for_exit(procs, pid, Duration::from_secs(1)).await;
    KillOutcome { killed }
}

/// Polls until `pid` is gone. Returns whether it exited in time.
pub async fn wait_for_exit(procs: &dyn ProcessIntrospector, pid: u32, timeout: Duration) -> bool {
    let deadline = time::Instant::now() + timeout;
    loop {
        if !procs.is_alive(pid) {
            return true;
        }
        if time::Instant::now() >= deadline {
            return false;
        }
        time::sleep(POLL_INTERVAL).await;
    }
}

/// Legacy single-instance mode only: kills whatever listens on `port`.
/// Refused in stack mode.
pub async fn kill_port_listeners(
    procs: &dyn ProcessIntrospector,
    port: u16,
    stack_mode: bool,
    grace: Duration,
) -> Result<Vec<u32>> {
    if stack_mode {
        return Err(PortError::LegacyKillRefused { port }.into());
    }
    let pids = list_listen_pids(procs, port);
    let mut killed = vec![];
    for pid in pids {
        if pid == std::process::id() {
            continue;
        }
        info!("killing pid {pid} listening on port {port}");
        if terminate(procs, pid, grace).await.killed {
            killed.push(pid);
        }
    }
    Ok(killed)
}

/// Kills the listeners on `port` only if every one is owned by the stack.
/// A single unowned listener refuses the whole operation.
pub async fn kill_owned_port_listeners(
    procs: &dyn ProcessIntrospector,
    port: u16,
    probe: &OwnershipProbe,
    grace: Duration,
) -> Result<Vec<u32>> {
    let pids = list_listen_pids(procs, port);
    if let Some(foreign) = pids
        .iter()
        .find(|pid| !process_owned_by_stack(procs, **pid, probe))
    {
        return Err(PortError::NotOwned {
            stack: probe.stack_name.clone(),
            port,
            help: format!(
                "pid {foreign} holds the port; stop it yourself or pick another port in {}",
                probe.env_path.display()
            ),
        }
        .into());
    }
    let mut killed = vec![];
    for pid in pids {
        if kill_process_group_owned_by_stack(procs, pid, probe, grace)
            .await
            .killed
        {
            killed.push(pid);
        }
    }
    Ok(killed)
}
