//! Foreground supervision of one stack instance.
//!
//! The supervising process records runtime state before anything is
//! spawned, brings up the server and races its exit against the health
//! endpoint, starts the daemon and UI, then stays alive until a signal or
//! the server's exit triggers the shutdown sequence.

use super::{LaunchPlan, Orchestrator, health};
use crate::Result;
use crate::daemon::controller::DaemonTarget;
use crate::error::{StackError, StartError};
use crate::ports::list_listen_pids;
use crate::procs::{ProcessIntrospector, Sig};
use crate::runtime_state::{self, RuntimePatch, RuntimeStart};
use crate::stack_env::StackEnv;
use crate::step::StepResult;
use crate::tail;
use miette::IntoDiagnostic;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, watch};
use tokio::{select, time};

const SERVER: &str = "server";
const UI: &str = "ui";
const DEFAULT_SERVER_CMD: &str = "yarn start";

/// A child spawned by the supervisor. Its exit is reaped by a background
/// task, so liveness is read from the exit channel rather than from pids.
struct ManagedChild {
    name: &'static str,
    pid: u32,
    log: PathBuf,
    exited: watch::Receiver<Option<String>>,
}

impl ManagedChild {
    fn exit_status(&self) -> Option<String> {
        self.exited.borrow().clone()
    }

    async fn wait_exit(&mut self) -> String {
        match self.exited.wait_for(Option::is_some).await {
            Ok(status) => status.clone().unwrap_or_default(),
            Err(_) => "unknown".to_string(),
        }
    }
}

async fn wait_exit_opt(child: Option<&mut ManagedChild>) -> String {
    match child {
        Some(child) => child.wait_exit().await,
        None => std::future::pending().await,
    }
}

pub struct StackRunner<'a> {
    orch: &'a Orchestrator<'a>,
    env: StackEnv,
    plan: LaunchPlan,
    open: bool,
    shutting_down: AtomicBool,
    daemon: Option<DaemonTarget>,
}

impl<'a> StackRunner<'a> {
    pub fn new(orch: &'a Orchestrator<'a>, mut env: StackEnv, plan: LaunchPlan, open: bool) -> Result<Self> {
        env.apply_ports(&plan.ports)?;
        if let Some(ui) = plan.ui_port {
            let ui_port = BTreeMap::from([("HAPPY_STACKS_UI_PORT".to_string(), ui.to_string())]);
            env.apply_overrides(ui_port.iter())?;
        }
        Ok(Self {
            orch,
            env,
            plan,
            open,
            shutting_down: AtomicBool::new(false),
            daemon: None,
        })
    }

    /// Runs until interrupted or until the server exits.
    pub async fn run(mut self) -> Result<()> {
        let paths = self.env.paths.clone();
        xx::file::mkdirp(paths.logs_dir())?;
        // held open for the whole run: proof of ownership for `stop`
        let mut supervisor_log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(paths.supervisor_log())
            .into_diagnostic()?;
        let pid = std::process::id();
        let _ = writeln!(supervisor_log, "{} supervisor pid {pid} starting", now());

        runtime_state::record_stack_runtime_start(
            &paths.runtime_state_file(),
            RuntimeStart {
                stack_name: self.env.name().to_string(),
                script: Some("start".to_string()),
                ephemeral: self.env.is_ephemeral(),
                owner_pid: pid,
                ports: self.plan.state_ports(),
            },
        )?;
        if let Some(ui) = self.plan.ui_port {
            runtime_state::record_stack_runtime_update(
                &paths.runtime_state_file(),
                RuntimePatch::new().expo_web_port(ui),
            )?;
        }

        let mut signals = ShutdownSignals::listen();
        let mut children: Vec<ManagedChild> = vec![];
        let brought_up = self.bring_up(&mut children, &mut signals).await;
        if let Err(e) = brought_up {
            let _ = writeln!(supervisor_log, "{} start failed: {e}", now());
            self.shutdown(children).await;
            return Err(e);
        }
        let _ = writeln!(supervisor_log, "{} stack is up", now());
        self.print_urls();
        if self.open {
            self.open_browser().log("open browser");
        }

        let mut ui_running = children.iter().any(|c| c.name == UI);
        loop {
            let (server, ui) = split_children(&mut children);
            select! {
                sig = signals.recv() => {
                    info!("received {sig}, shutting down stack {}", self.env.name());
                    break;
                }
                status = wait_exit_opt(server) => {
                    error!("server for stack {} exited ({status})", self.env.name());
                    break;
                }
                status = wait_exit_opt(ui.filter(|_| ui_running)) => {
                    warn!("ui for stack {} exited ({status}), the server keeps running", self.env.name());
                    ui_running = false;
                }
            }
        }
        let _ = writeln!(supervisor_log, "{} shutting down", now());
        self.shutdown(children).await;
        let _ = writeln!(supervisor_log, "{} stopped", now());
        Ok(())
    }

    async fn bring_up(
        &mut self,
        children: &mut Vec<ManagedChild>,
        signals: &mut ShutdownSignals,
    ) -> Result<()> {
        let state_file = self.env.paths.runtime_state_file();
        let (cmd, cwd) = self.server_command()?;
        let mut server_env = BTreeMap::new();
        if let Some(port) = self.env.server_port() {
            server_env.insert("PORT".to_string(), port.to_string());
        }
        let server = self.spawn_child(SERVER, &cmd, cwd.as_deref(), server_env)?;
        runtime_state::record_stack_runtime_update(
            &state_file,
            RuntimePatch::new().process("serverPid", server.pid),
        )?;
        children.push(server);
        if let Some(server) = children.last_mut() {
            self.wait_ready(server, signals).await?;
        }

        if self.env.config.start_daemon {
            match DaemonTarget::for_stack(&self.env) {
                Some(target) => {
                    let opts = self.orch.daemon_start_options(&self.env, false);
                    let controller = self.orch.daemon_controller(&self.shutting_down);
                    let daemon = select! {
                        res = controller.start_local_daemon_with_auth(&target, &opts) => res?,
                        sig = signals.recv() => miette::bail!("interrupted by {sig} while starting the daemon"),
                    };
                    info!("daemon for {} is {} (pid {:?})", self.env.name(), daemon.status, daemon.pid);
                    self.daemon = Some(target);
                }
                None => info!("no CLI configured for stack {}, skipping daemon", self.env.name()),
            }
        }

        if let (Some(cmd), Some(port)) = (self.env.config.ui_cmd.clone(), self.plan.ui_port)
            && self.env.config.start_ui
        {
            let mut ui_env = BTreeMap::from([("PORT".to_string(), port.to_string())]);
            if let Some(url) = self.env.public_server_url() {
                ui_env.insert("EXPO_PUBLIC_HAPPY_SERVER_URL".to_string(), url);
            }
            let cwd = self.env.config.component_dirs.get("happy").cloned();
            let ui = self.spawn_child(UI, &cmd, cwd.as_deref(), ui_env)?;
            runtime_state::record_stack_runtime_update(
                &state_file,
                RuntimePatch::new().process("uiGatewayPid", ui.pid),
            )?;
            children.push(ui);
        }
        Ok(())
    }

    /// Explicit command, else `yarn start` in the flavor's component dir.
    fn server_command(&self) -> Result<(String, Option<PathBuf>)> {
        let flavor = self.env.config.flavor.to_string();
        let dir = self.env.config.component_dirs.get(&flavor).cloned();
        match (&self.env.config.server_cmd, dir) {
            (Some(cmd), dir) => Ok((cmd.clone(), dir)),
            (None, Some(dir)) => Ok((DEFAULT_SERVER_CMD.to_string(), Some(dir))),
            (None, None) => Err(StackError::NoServerCommand {
                name: self.env.name().to_string(),
                help: format!(
                    "set HAPPY_STACKS_SERVER_CMD or HAPPY_STACKS_COMPONENT_DIR_{} in {}",
                    flavor.to_uppercase().replace('-', "_"),
                    self.env.paths.env_file().display()
                ),
            }
            .into()),
        }
    }

    fn spawn_child(
        &self,
        name: &'static str,
        cmdline: &str,
        cwd: Option<&Path>,
        extra_env: BTreeMap<String, String>,
    ) -> Result<ManagedChild> {
        let log = self.env.paths.child_log(name);
        info!("starting {name} for stack {}: {cmdline}", self.env.name());
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(format!("exec {cmdline}"))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_clear()
            .envs(self.env.process_env())
            .envs(extra_env);
        #[cfg(unix)]
        cmd.process_group(0);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        let mut child = cmd.spawn().into_diagnostic()?;
        let Some(pid) = child.id() else {
            miette::bail!("{name} exited before its pid could be read");
        };
        debug!("{name} pid {pid}");

        let pump = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => Some(tokio::spawn(pump_output(name, stdout, stderr, log.clone()))),
            _ => None,
        };
        let (exit_tx, exited) = watch::channel(None);
        tokio::spawn(async move {
            let status = match child.wait().await {
                Ok(status) => status.to_string(),
                Err(e) => format!("wait failed: {e}"),
            };
            debug!("{name} pid {pid} exited: {status}");
            // let the last lines reach the log before anyone reads it
            if let Some(pump) = pump {
                let _ = time::timeout(Duration::from_secs(1), pump).await;
            }
            let _ = exit_tx.send(Some(status));
        });
        Ok(ManagedChild {
            name,
            pid,
            log,
            exited,
        })
    }

    /// Whichever comes first: the server exits (failure), its health
    /// endpoint answers (success), or the timeout.
    async fn wait_ready(&self, server: &mut ManagedChild, signals: &mut ShutdownSignals) -> Result<()> {
        let base = self
            .env
            .internal_server_url()
            .ok_or_else(|| miette::miette!("stack {} has no server port", self.env.name()))?;
        let url = health::health_url(&base, &self.orch.settings.ready.health_path);
        let timeout = self.orch.settings.ready_timeout();
        let client = health::client();
        let deadline = time::sleep(timeout);
        tokio::pin!(deadline);
        let mut ticker = time::interval(self.orch.settings.ready_interval());
        let tail_lines = self.orch.settings.daemon.log_tail_lines;

        loop {
            select! {
                status = server.wait_exit() => {
                    return Err(StartError::ChildExited {
                        what: SERVER.to_string(),
                        stack: self.env.name().to_string(),
                        status,
                        log_excerpt: tail::excerpt(&server.log, tail_lines),
                        help: format!("see the full log: happys stack logs {} --component server", self.env.name()),
                    }
                    .into());
                }
                _ = &mut deadline => {
                    return Err(StartError::HealthTimeout {
                        url,
                        seconds: timeout.as_secs(),
                        help: format!(
                            "check {} or raise HAPPY_STACKS_READY_TIMEOUT",
                            server.log.display()
                        ),
                    }
                    .into());
                }
                sig = signals.recv() => {
                    miette::bail!("interrupted by {sig} while waiting for {url}");
                }
                _ = ticker.tick() => {
                    if health::probe(&client, &url).await {
                        break;
                    }
                }
            }
        }

        // the answer must have come from our server, not a squatter on the port
        time::sleep(Duration::from_millis(100)).await;
        if server.exit_status().is_some() {
            return Err(StartError::ImpostorResponder { url, pid: server.pid }.into());
        }
        info!("{url} is healthy");
        Ok(())
    }

    fn print_urls(&self) {
        let name = self.env.name();
        if let Some(url) = self.env.public_server_url() {
            println!("{name}: server {url}");
        }
        if let Some(url) = self.env.ui_url() {
            println!("{name}: ui     {url}");
        }
        println!("{name}: logs   {}", self.env.paths.logs_dir().display());
    }

    fn open_browser(&self) -> StepResult {
        match self.env.ui_url().or_else(|| self.env.public_server_url()) {
            Some(url) => super::open_url(self.orch.runner, &url),
            None => StepResult::skipped("no url to open"),
        }
    }

    /// Stop daemon, SIGINT children, wait out the grace period, SIGKILL the
    /// rest. Runtime state is removed only when every child is gone and no
    /// recorded port is still held.
    async fn shutdown(&self, children: Vec<ManagedChild>) {
        self.shutting_down.store(true, Ordering::Relaxed);
        let procs = self.orch.procs;

        if let Some(target) = &self.daemon {
            self.orch
                .daemon_controller(&self.shutting_down)
                .stop_local_daemon(target)
                .await
                .log("stop daemon");
        }

        for child in children.iter().rev() {
            if child.exit_status().is_none() {
                debug!("sending SIGINT to {} (pid {})", child.name, child.pid);
                procs.signal(child.pid, Sig::Int, true);
            }
        }
        let grace = self.orch.settings.kill_grace();
        let all_exited = |children: &[ManagedChild]| children.iter().all(|c| c.exit_status().is_some());
        let deadline = time::Instant::now() + grace;
        while !all_exited(&children) && time::Instant::now() < deadline {
            time::sleep(Duration::from_millis(50)).await;
        }
        for child in children.iter().filter(|c| c.exit_status().is_none()) {
            warn!("{} (pid {}) survived SIGINT for {grace:?}, sending SIGKILL", child.name, child.pid);
            procs.signal(child.pid, Sig::Kill, true);
        }
        let deadline = time::Instant::now() + Duration::from_secs(1);
        while !all_exited(&children) && time::Instant::now() < deadline {
            time::sleep(Duration::from_millis(50)).await;
        }

        let survivors: Vec<u32> = children
            .iter()
            .filter(|c| c.exit_status().is_none())
            .map(|c| c.pid)
            .collect();
        release_runtime_state(procs, &self.env.paths.runtime_state_file(), &survivors).await;
    }
}

/// Deletes the runtime state unless a child survived or one of the recorded
/// ports is still listened on (an orphaned grandchild, say). Returns whether
/// the file was deleted.
async fn release_runtime_state(
    procs: &dyn ProcessIntrospector,
    state_file: &Path,
    survivors: &[u32],
) -> bool {
    let ports = runtime_state::read_stack_runtime_state_file(state_file)
        .map(|s| s.all_ports())
        .unwrap_or_default();
    let occupied = |ports: &[u16]| -> Vec<u16> {
        ports
            .iter()
            .copied()
            .filter(|p| !list_listen_pids(procs, *p).is_empty())
            .collect()
    };
    // listeners of children that just exited can linger briefly
    let deadline = time::Instant::now() + Duration::from_secs(1);
    let mut occupied_ports = occupied(&ports);
    while !occupied_ports.is_empty() && time::Instant::now() < deadline {
        time::sleep(Duration::from_millis(100)).await;
        occupied_ports = occupied(&ports);
    }

    if survivors.is_empty() && occupied_ports.is_empty() {
        if let Err(e) = runtime_state::delete_stack_runtime_state_file(state_file) {
            warn!("{e}");
            return false;
        }
        return true;
    }
    warn!(
        "keeping {} for cleanup: pids {survivors:?} ports {occupied_ports:?} still in use (run happys stack stop)",
        state_file.display()
    );
    false
}

fn split_children(children: &mut [ManagedChild]) -> (Option<&mut ManagedChild>, Option<&mut ManagedChild>) {
    let mut server = None;
    let mut ui = None;
    for child in children.iter_mut() {
        match child.name {
            SERVER => server = Some(child),
            UI => ui = Some(child),
            _ => {}
        }
    }
    (server, ui)
}

fn now() -> chrono::format::DelayedFormat<chrono::format::StrftimeItems<'static>> {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
}

/// Copies a child's output into its log with a timestamp and name prefix,
/// and echoes it to our stdout.
async fn pump_output(
    name: &'static str,
    stdout: tokio::process::ChildStdout,
    stderr: tokio::process::ChildStderr,
    log: PathBuf,
) {
    let file = match tokio::fs::File::options()
        .append(true)
        .create(true)
        .open(&log)
        .await
    {
        Ok(f) => f,
        Err(e) => {
            error!("failed to open {}: {e}", log.display());
            return;
        }
    };
    let mut out = BufWriter::new(file);
    let mut stdout = tokio::io::BufReader::new(stdout).lines();
    let mut stderr = tokio::io::BufReader::new(stderr).lines();
    let (mut stdout_open, mut stderr_open) = (true, true);
    while stdout_open || stderr_open {
        let line = select! {
            line = stdout.next_line(), if stdout_open => match line {
                Ok(Some(line)) => line,
                _ => { stdout_open = false; continue; }
            },
            line = stderr.next_line(), if stderr_open => match line {
                Ok(Some(line)) => line,
                _ => { stderr_open = false; continue; }
            },
        };
        println!("[{name}] {line}");
        let formatted = format!("{} {name} {line}\n", now());
        if let Err(e) = out.write_all(formatted.as_bytes()).await {
            error!("failed to write {}: {e}", log.display());
        }
        let _ = out.flush().await;
    }
}

/// SIGINT, SIGTERM and SIGHUP funnelled into one stream. A second signal
/// while shutting down exits immediately.
struct ShutdownSignals {
    rx: mpsc::Receiver<&'static str>,
}

impl ShutdownSignals {
    #[cfg(unix)]
    fn listen() -> Self {
        use tokio::signal::unix::{SignalKind, signal};
        static RECEIVED_SIGNAL: AtomicBool = AtomicBool::new(false);
        let (tx, rx) = mpsc::channel(4);
        let kinds = [
            (SignalKind::interrupt(), "SIGINT"),
            (SignalKind::terminate(), "SIGTERM"),
            (SignalKind::hangup(), "SIGHUP"),
        ];
        for (kind, name) in kinds {
            let mut stream = match signal(kind) {
                Ok(s) => s,
                Err(e) => {
                    warn!("failed to register handler for {name}: {e}");
                    continue;
                }
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                loop {
                    stream.recv().await;
                    if RECEIVED_SIGNAL.swap(true, Ordering::SeqCst) {
                        std::process::exit(1);
                    }
                    let _ = tx.send(name).await;
                }
            });
        }
        Self { rx }
    }

    #[cfg(windows)]
    fn listen() -> Self {
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx.send("ctrl-c").await;
            }
        });
        Self { rx }
    }

    async fn recv(&mut self) -> &'static str {
        match self.rx.recv().await {
            Some(sig) => sig,
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::procs::fake::{FakeProcess, FakeProcs};
    use crate::runtime_state::record_stack_runtime_start;
    use tempfile::TempDir;

    fn record(dir: &TempDir, port: u16) -> PathBuf {
        let file = dir.path().join("stack.runtime.json");
        record_stack_runtime_start(
            &file,
            RuntimeStart {
                stack_name: "exp1".into(),
                script: Some("start".into()),
                ephemeral: true,
                owner_pid: std::process::id(),
                ports: BTreeMap::from([("server".to_string(), port)]),
            },
        )
        .unwrap();
        file
    }

    #[tokio::test]
    async fn test_state_kept_while_orphan_holds_port() {
        let dir = TempDir::new().unwrap();
        let file = record(&dir, 4101);
        let procs = FakeProcs::new();
        // setsid'd grandchild of the server, outside its process group
        procs.add(60, FakeProcess::alive().in_group(60).listening(4101));

        assert!(!release_runtime_state(&procs, &file, &[]).await);
        assert!(file.exists());

        procs.exit(60);
        assert!(release_runtime_state(&procs, &file, &[]).await);
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn test_state_kept_while_child_survives() {
        let dir = TempDir::new().unwrap();
        let file = record(&dir, 4102);
        let procs = FakeProcs::new();
        assert!(!release_runtime_state(&procs, &file, &[61]).await);
        assert!(file.exists());
    }

    #[tokio::test]
    async fn test_missing_state_is_fine() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("stack.runtime.json");
        assert!(release_runtime_state(&FakeProcs::new(), &file, &[]).await);
    }
}
