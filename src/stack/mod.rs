//! Stack orchestration: deciding what a start, restart, or stop has to do.
//!
//! Every `happys` invocation is a fresh process. What a previous invocation
//! left running is rediscovered from the runtime state file, and trusted
//! only while its owner pid is alive.

pub mod health;
pub mod manage;
pub mod runner;

use crate::Result;
use crate::daemon::controller::{DaemonController, DaemonTarget, StartOptions};
use crate::daemon::state::{DaemonState, check_daemon_state};
use crate::env::{AmbientEnv, is_falsy, is_truthy};
use crate::error::{FileError, PortError, StartError};
use crate::exec::{CommandRunner, CommandSpec};
use crate::ownership::{
    OwnershipProbe, kill_owned_port_listeners, kill_port_listeners,
    kill_process_group_owned_by_stack,
};
use crate::paths::StackPaths;
use crate::ports::{PortKind, collect_reserved_ports, is_port_free, list_listen_pids, pick_next_free_tcp_port};
use crate::procs::ProcessIntrospector;
use crate::runtime_state::{self, RuntimeState};
use crate::settings::Settings;
use crate::step::StepResult;
use crate::tail;
use crate::stack_env::{ResolveRequest, StackContext, StackEnv, resolve_stack_context};
use miette::IntoDiagnostic;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use tokio::time;

/// Runtime state key for the UI dev-server port in one-shot assignments.
pub const UI_PORT_KEY: &str = "ui";

/// Everything an orchestrator call needs, passed down explicitly.
pub struct Orchestrator<'a> {
    pub storage_dir: &'a Path,
    pub home_dir: &'a Path,
    pub ambient: &'a AmbientEnv,
    pub settings: &'a Settings,
    pub procs: &'a dyn ProcessIntrospector,
    pub runner: &'a dyn CommandRunner,
}

#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    pub restart: bool,
    pub background: bool,
    pub open: bool,
    /// Ports decided by a parent invocation (`--assigned-ports`); keys are
    /// runtime state port keys plus `ui`.
    pub assigned_ports: BTreeMap<String, u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartPlan {
    AlreadyRunning { owner_pid: u32 },
    Launch(LaunchPlan),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchPlan {
    pub ports: BTreeMap<PortKind, u16>,
    pub ui_port: Option<u16>,
    /// Ports carried over from the instance a restart replaced.
    pub reused: bool,
}

impl LaunchPlan {
    /// `--assigned-ports` form: `server=4010,pg=15433,ui=8082`.
    pub fn assigned_ports_arg(&self) -> String {
        self.ports
            .iter()
            .map(|(k, p)| format!("{}={p}", k.key()))
            .chain(self.ui_port.map(|p| format!("{UI_PORT_KEY}={p}")))
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn state_ports(&self) -> BTreeMap<String, u16> {
        self.ports
            .iter()
            .map(|(k, p)| (k.key().to_string(), *p))
            .collect()
    }
}

/// Parses `server=4010,ui=8082`.
pub fn parse_assigned_ports(raw: &str) -> Result<BTreeMap<String, u16>> {
    let mut out = BTreeMap::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, port) = part
            .split_once('=')
            .ok_or_else(|| miette::miette!("expected key=port, got '{part}'"))?;
        let key = key.trim();
        if key != UI_PORT_KEY && PortKind::from_key(key).is_none() {
            miette::bail!("unknown port name '{key}'");
        }
        let port: u16 = port
            .trim()
            .parse()
            .map_err(|_| miette::miette!("invalid port for {key}: '{port}'"))?;
        out.insert(key.to_string(), port);
    }
    Ok(out)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopReport {
    pub was_running: bool,
    pub killed: Vec<u32>,
    /// Tracked pids still alive afterwards.
    pub survivors: Vec<u32>,
    /// Tracked ports still listened on afterwards.
    pub occupied_ports: Vec<u16>,
    pub state_deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessStatus {
    pub name: String,
    pub pid: u32,
    pub alive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackStatus {
    pub name: String,
    pub running: bool,
    pub owner_pid: Option<u32>,
    pub ephemeral: bool,
    pub ports: BTreeMap<String, u16>,
    pub processes: Vec<ProcessStatus>,
    pub daemon: Option<DaemonState>,
    pub server_url: Option<String>,
    pub ui_url: Option<String>,
}

impl<'a> Orchestrator<'a> {
    pub fn context(&self, explicit: Option<&str>) -> StackContext {
        resolve_stack_context(self.ambient, self.storage_dir, self.home_dir, explicit)
    }

    pub fn resolve_env(&self, name: &str, overrides: BTreeMap<String, String>) -> Result<StackEnv> {
        StackEnv::resolve(
            name,
            ResolveRequest {
                storage_dir: self.storage_dir,
                home_dir: self.home_dir,
                ambient: self.ambient,
                procs: self.procs,
                overrides,
            },
        )
    }

    pub fn paths(&self, name: &str) -> StackPaths {
        StackPaths::new(self.storage_dir, name)
    }

    pub fn daemon_controller<'b>(&'b self, shutting_down: &'b AtomicBool) -> DaemonController<'b> {
        DaemonController {
            procs: self.procs,
            runner: self.runner,
            settings: self.settings,
            shutting_down,
        }
    }

    /// Daemon options derived from the stack config and ambient flags.
    pub fn daemon_start_options(&self, env: &StackEnv, force_restart: bool) -> StartOptions {
        let wait_for_auth = match self.ambient.stack_var("DAEMON_WAIT_FOR_AUTH") {
            Some(v) if is_truthy(v) => true,
            Some(v) if is_falsy(v) => false,
            _ => console::user_attended() && console::user_attended_stderr(),
        };
        let auth_seed_from = env
            .config
            .auth_seed_from
            .as_deref()
            .map(|name| self.seed_cli_home(name));
        let legacy_homes = if env.paths.is_main() {
            vec![
                self.home_dir.join(".happy").join("local").join("cli"),
                self.home_dir.join(".happy"),
            ]
        } else {
            vec![
                self.home_dir
                    .join(".happy")
                    .join("local")
                    .join("stacks")
                    .join(env.name())
                    .join("cli"),
            ]
        };
        StartOptions {
            force_restart,
            wait_for_auth,
            auto_rebuild: env.config.cli_auto_rebuild,
            build_cmd: env.config.cli_build_cmd.clone(),
            auto_auth_seed: env.config.auto_auth_seed,
            auth_seed_from,
            legacy_homes,
        }
    }

    /// CLI home of another stack, used as a credential source.
    fn seed_cli_home(&self, name: &str) -> PathBuf {
        match self.resolve_env(name, BTreeMap::new()) {
            Ok(env) => env.config.cli_home_dir,
            Err(e) => {
                debug!("auth seed stack {name}: {e}");
                self.paths(name).default_cli_home()
            }
        }
    }

    fn live_state(&self, env: &StackEnv) -> Option<RuntimeState> {
        runtime_state::read_stack_runtime_state_file(&env.paths.runtime_state_file())
            .filter(|s| s.owner_alive(self.procs))
    }

    /// Time the owner gets for its own shutdown (daemon stop plus children).
    fn owner_grace(&self) -> Duration {
        self.settings.kill_grace() * 2 + Duration::from_secs(5)
    }

    /// Decides whether a start is a no-op, and which ports a launch uses.
    pub async fn plan_start(
        &self,
        env: &StackEnv,
        ctx: &StackContext,
        req: &StartRequest,
    ) -> Result<StartPlan> {
        let live = self.live_state(env);
        let mut previous: BTreeMap<PortKind, u16> = BTreeMap::new();
        let mut previous_ui = None;

        if let Some(state) = &live {
            let owner_pid = state.owner_pid.unwrap_or_default();
            if !req.restart {
                info!("stack {} is already running (pid {owner_pid})", env.name());
                return Ok(StartPlan::AlreadyRunning { owner_pid });
            }
            previous = state
                .ports
                .iter()
                .filter_map(|(k, p)| Some((PortKind::from_key(k)?, *p)))
                .collect();
            previous_ui = state.expo.as_ref().and_then(|e| e.web_port);
            info!("restarting stack {} (pid {owner_pid})", env.name());
            let report = self.stop(env, ctx).await?;
            debug!("restart stop report: {report:?}");
        }

        let probe = OwnershipProbe::for_stack(env);
        let host = self.settings.ports.host.as_str();
        let mut reserved = collect_reserved_ports(self.storage_dir, self.home_dir, env.name(), self.procs);
        let mut ports = BTreeMap::new();
        let mut reused = !previous.is_empty();

        for kind in env.config.flavor.port_kinds() {
            let fixed = req
                .assigned_ports
                .get(kind.key())
                .copied()
                .map(|p| (p, false))
                .or_else(|| env.pinned_ports.get(kind).map(|p| (*p, true)))
                .or_else(|| previous.get(kind).map(|p| (*p, true)))
                .or_else(|| (!ctx.stack_mode).then(|| (kind.base(&self.settings.ports), true)));
            let port = match fixed {
                Some((port, check)) => {
                    if check {
                        self.ensure_port_available(port, kind.key(), &probe, ctx.stack_mode)
                            .await?;
                    }
                    port
                }
                None => {
                    reused = false;
                    pick_next_free_tcp_port(
                        self.procs,
                        kind.base(&self.settings.ports),
                        &reserved,
                        host,
                        self.settings.ports.max_tries,
                    )?
                }
            };
            reserved.insert(port);
            ports.insert(*kind, port);
        }

        let ui_port = if env.config.start_ui {
            let fixed = req
                .assigned_ports
                .get(UI_PORT_KEY)
                .copied()
                .map(|p| (p, false))
                .or_else(|| previous_ui.map(|p| (p, true)))
                .or_else(|| env.config.ui_port.map(|p| (p, true)));
            Some(match fixed {
                Some((port, check)) => {
                    if check {
                        self.ensure_port_available(port, UI_PORT_KEY, &probe, ctx.stack_mode)
                            .await?;
                    }
                    port
                }
                None => pick_next_free_tcp_port(
                    self.procs,
                    self.settings.ports.ui_base,
                    &reserved,
                    host,
                    self.settings.ports.max_tries,
                )?,
            })
        } else {
            None
        };

        debug!("stack {} ports: {ports:?} ui: {ui_port:?}", env.name());
        Ok(StartPlan::Launch(LaunchPlan {
            ports,
            ui_port,
            reused,
        }))
    }

    /// A port that must be reused as-is. One round of ownership-gated cleanup
    /// is attempted before giving up; a different port is never substituted.
    async fn ensure_port_available(
        &self,
        port: u16,
        name: &str,
        probe: &OwnershipProbe,
        stack_mode: bool,
    ) -> Result<()> {
        let host = self.settings.ports.host.as_str();
        if is_port_free(self.procs, port, host) {
            return Ok(());
        }
        if stack_mode {
            match kill_owned_port_listeners(self.procs, port, probe, self.settings.kill_grace()).await {
                Ok(killed) if !killed.is_empty() => {
                    info!("freed port {port} from leftover pid(s) {killed:?}");
                    self.wait_port_free(port).await;
                }
                Ok(_) => {}
                Err(e) => debug!("{e}"),
            }
            if is_port_free(self.procs, port, host) {
                return Ok(());
            }
        }
        Err(PortError::Occupied {
            name: name.to_string(),
            port,
            pids: list_listen_pids(self.procs, port),
            help: format!(
                "see which stack holds it with `happys stack list`, or inspect it: lsof -nP -iTCP:{port} -sTCP:LISTEN"
            ),
        }
        .into())
    }

    async fn wait_port_free(&self, port: u16) {
        let deadline = time::Instant::now() + Duration::from_secs(2);
        while time::Instant::now() < deadline
            && !is_port_free(self.procs, port, &self.settings.ports.host)
        {
            time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Stops whatever the stack provably owns: the supervising owner,
    /// tracked children, the daemon, and leftover listeners on its ports.
    /// The runtime state is deleted only when nothing tracked survives.
    pub async fn stop(&self, env: &StackEnv, ctx: &StackContext) -> Result<StopReport> {
        let probe = OwnershipProbe::for_stack(env);
        let grace = self.settings.kill_grace();
        let state = runtime_state::read_stack_runtime_state_file(&env.paths.runtime_state_file());
        let mut report = StopReport::default();

        let mut tracked: Vec<u32> = vec![];
        let mut ports: BTreeSet<u16> = BTreeSet::new();
        if let Some(state) = &state {
            if let Some(owner) = state.owner_pid {
                if state.owner_alive(self.procs) {
                    report.was_running = true;
                    info!("stopping stack {} (pid {owner})", env.name());
                    if kill_process_group_owned_by_stack(self.procs, owner, &probe, self.owner_grace())
                        .await
                        .killed
                    {
                        report.killed.push(owner);
                    } else {
                        warn!("owner pid {owner} is alive but not provably owned by {}", env.name());
                    }
                }
                tracked.push(owner);
            }
            for (name, pid) in &state.processes {
                tracked.push(*pid);
                if self.procs.is_alive(*pid) {
                    debug!("stopping leftover {name} pid {pid}");
                    if kill_process_group_owned_by_stack(self.procs, *pid, &probe, grace)
                        .await
                        .killed
                    {
                        report.killed.push(*pid);
                    }
                }
            }
            ports.extend(state.all_ports());
        }
        if !ctx.stack_mode {
            ports.extend(env.config.ports.values().copied());
            ports.extend(env.config.ui_port);
        }

        self.stop_daemon_for(env, state.as_ref()).await;

        for port in &ports {
            if list_listen_pids(self.procs, *port).is_empty() {
                continue;
            }
            let killed = if ctx.stack_mode {
                kill_owned_port_listeners(self.procs, *port, &probe, grace).await
            } else {
                kill_port_listeners(self.procs, *port, false, grace).await
            };
            match killed {
                Ok(pids) => report.killed.extend(pids),
                Err(e) => warn!("{e}"),
            }
        }

        report.survivors = tracked
            .into_iter()
            .filter(|pid| self.procs.is_alive(*pid))
            .collect();
        report.occupied_ports = ports
            .into_iter()
            .filter(|p| !list_listen_pids(self.procs, *p).is_empty())
            .collect();
        report.killed.sort_unstable();
        report.killed.dedup();

        if state.is_some() {
            if report.survivors.is_empty() && report.occupied_ports.is_empty() {
                runtime_state::delete_stack_runtime_state_file(&env.paths.runtime_state_file())?;
                report.state_deleted = true;
            } else {
                warn!(
                    "keeping {} for cleanup: pids {:?} ports {:?} still in use",
                    env.paths.runtime_state_file().display(),
                    report.survivors,
                    report.occupied_ports
                );
            }
        }
        Ok(report)
    }

    async fn stop_daemon_for(&self, env: &StackEnv, state: Option<&RuntimeState>) {
        let mut env = env.clone();
        if env.server_port().is_none()
            && let Some(port) = state.and_then(|s| s.ports.get(PortKind::Server.key()))
            && env
                .apply_ports(&BTreeMap::from([(PortKind::Server, *port)]))
                .is_err()
        {
            return;
        }
        let Some(target) = DaemonTarget::for_stack(&env) else {
            return;
        };
        let shutting_down = AtomicBool::new(true);
        self.daemon_controller(&shutting_down)
            .stop_local_daemon(&target)
            .await
            .log("stop daemon");
    }

    /// Read-only snapshot. Never fails on missing or stale files.
    pub fn status(&self, env: &StackEnv) -> StackStatus {
        let state = runtime_state::read_stack_runtime_state_file(&env.paths.runtime_state_file());
        let running = state.as_ref().is_some_and(|s| s.owner_alive(self.procs));
        let (ports, processes) = match (&state, running) {
            (Some(s), true) => {
                let mut ports = s.ports.clone();
                if let Some(web) = s.expo.as_ref().and_then(|e| e.web_port) {
                    ports.insert(UI_PORT_KEY.to_string(), web);
                }
                let processes = s
                    .processes
                    .iter()
                    .map(|(name, pid)| ProcessStatus {
                        name: name.clone(),
                        pid: *pid,
                        alive: self.procs.is_alive(*pid),
                    })
                    .collect();
                (ports, processes)
            }
            _ => (
                env.pinned_ports
                    .iter()
                    .map(|(k, p)| (k.key().to_string(), *p))
                    .collect(),
                vec![],
            ),
        };
        StackStatus {
            name: env.name().to_string(),
            running,
            owner_pid: state.as_ref().filter(|_| running).and_then(|s| s.owner_pid),
            ephemeral: env.is_ephemeral(),
            ports,
            processes,
            daemon: env
                .config
                .cli_bin
                .as_ref()
                .map(|_| check_daemon_state(&env.config.cli_home_dir, self.procs)),
            server_url: running
                .then(|| env.public_server_url())
                .flatten()
                .or_else(|| env.pinned_ports.get(&PortKind::Server).map(|p| format!("http://127.0.0.1:{p}"))),
            ui_url: running.then(|| env.ui_url()).flatten(),
        }
    }
}

impl Orchestrator<'_> {
    /// Re-executes `happys stack start` as a detached supervisor in its own
    /// process group, with output appended to the stack log. Returns once
    /// the server is healthy; fails if the supervisor exits first.
    pub async fn start_background(&self, env: &StackEnv, plan: &LaunchPlan) -> Result<u32> {
        let log = env.paths.stack_log();
        xx::file::mkdirp(env.paths.logs_dir())?;
        let open_log = || {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log)
                .map_err(|e| FileError::WriteError {
                    path: log.clone(),
                    details: Some(e.to_string()),
                })
        };
        let args = vec![
            "stack".to_string(),
            "start".to_string(),
            env.name().to_string(),
            "--assigned-ports".to_string(),
            plan.assigned_ports_arg(),
        ];
        debug!("starting {} {} in background", crate::env::HAPPYS_BIN.display(), args.join(" "));
        let expr = duct::cmd(&*crate::env::HAPPYS_BIN, &args)
            .env(format!("{}STACK", crate::env::PREFIX), env.name())
            .env(format!("{}ENV_FILE", crate::env::PREFIX), env.paths.env_file())
            .stdin_null()
            .stdout_file(open_log()?)
            .stderr_file(open_log()?)
            .unchecked();
        #[cfg(unix)]
        let expr = expr.before_spawn(|cmd| {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
            Ok(())
        });
        let handle = expr.start().into_diagnostic()?;
        let pid = handle.pids().first().copied().unwrap_or_default();
        info!("stack {} supervisor started in background (pid {pid})", env.name());

        let port = plan.ports.get(&PortKind::Server).copied().unwrap_or_default();
        let url = health::health_url(
            &format!("http://127.0.0.1:{port}"),
            &self.settings.ready.health_path,
        );
        let client = health::client();
        let timeout = self.settings.ready_timeout();
        let deadline = time::Instant::now() + timeout;
        loop {
            if let Some(output) = handle.try_wait().into_diagnostic()? {
                return Err(StartError::ChildExited {
                    what: "background supervisor".to_string(),
                    stack: env.name().to_string(),
                    status: output.status.to_string(),
                    log_excerpt: tail::excerpt(&log, self.settings.daemon.log_tail_lines),
                    help: format!("see the full log: happys stack logs {}", env.name()),
                }
                .into());
            }
            if health::probe(&client, &url).await {
                time::sleep(Duration::from_millis(100)).await;
                if handle.try_wait().into_diagnostic()?.is_some() {
                    // reported with its log excerpt at the top of the loop
                    continue;
                }
                self.confirm_background_server(env, pid, &url)?;
                break;
            }
            if time::Instant::now() >= deadline {
                return Err(StartError::HealthTimeout {
                    url,
                    seconds: timeout.as_secs(),
                    help: format!(
                        "the supervisor (pid {pid}) keeps running; inspect {} or stop it: happys stack stop {}",
                        log.display(),
                        env.name()
                    ),
                }
                .into());
            }
            time::sleep(self.settings.ready_interval()).await;
        }
        Ok(pid)
    }

    /// A passing health check only counts when the supervisor we spawned
    /// owns the runtime state and the server it recorded is still alive.
    fn confirm_background_server(&self, env: &StackEnv, supervisor_pid: u32, url: &str) -> Result<()> {
        let server_pid = runtime_state::read_stack_runtime_state_file(&env.paths.runtime_state_file())
            .filter(|s| s.owner_pid == Some(supervisor_pid))
            .and_then(|s| s.processes.get("serverPid").copied());
        match server_pid {
            Some(pid) if self.procs.is_alive(pid) => Ok(()),
            pid => Err(StartError::ImpostorResponder {
                url: url.to_string(),
                pid: pid.unwrap_or(supervisor_pid),
            }
            .into()),
        }
    }
}

/// Opens `url` with the platform opener. Best-effort.
pub fn open_url(runner: &dyn CommandRunner, url: &str) -> StepResult {
    let opener = if cfg!(target_os = "macos") {
        "open"
    } else {
        "xdg-open"
    };
    match runner.capture(&CommandSpec::new(opener).arg(url)) {
        Ok(out) if out.success() => StepResult::ok(format!("opened {url}")),
        Ok(out) => StepResult::failed(format!("{opener} {url}: {}", out.combined().trim())),
        Err(e) => StepResult::failed(format!("{opener} {url}: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::fake::FakeRunner;
    use crate::procs::fake::{FakeProcess, FakeProcs};
    use crate::runtime_state::{RuntimeStart, record_stack_runtime_start};
    use std::net::TcpListener;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        ambient: AmbientEnv,
        settings: Settings,
        procs: FakeProcs,
        runner: FakeRunner,
    }

    impl Fixture {
        fn new() -> Self {
            let mut settings = Settings::default();
            settings.kill.grace = "50ms".into();
            // keep allocations clear of well-known dev ports
            let base = free_port();
            settings.ports.server_base = base;
            settings.ports.ui_base = base;
            Self {
                dir: TempDir::new().unwrap(),
                ambient: AmbientEnv::from_pairs([("HAPPY_STACKS_STACK", "exp1")]),
                settings,
                procs: FakeProcs::new(),
                runner: FakeRunner::new(),
            }
        }

        fn orch(&self) -> Orchestrator<'_> {
            Orchestrator {
                storage_dir: self.dir.path(),
                home_dir: self.dir.path(),
                ambient: &self.ambient,
                settings: &self.settings,
                procs: &self.procs,
                runner: &self.runner,
            }
        }

        fn new_stack(&self, name: &str, raw: &str) -> StackPaths {
            let paths = StackPaths::new(self.dir.path(), name);
            std::fs::create_dir_all(&paths.base_dir).unwrap();
            std::fs::write(paths.env_file(), raw).unwrap();
            paths
        }

        /// A live supervisor for `name` that holds its supervisor.log open.
        fn running(&self, name: &str, owner: u32, ports: BTreeMap<String, u16>) {
            let paths = StackPaths::new(self.dir.path(), name);
            self.procs.add(
                owner,
                FakeProcess::alive()
                    .in_group(owner)
                    .with_open(paths.supervisor_log()),
            );
            record_stack_runtime_start(
                &paths.runtime_state_file(),
                RuntimeStart {
                    stack_name: name.into(),
                    script: Some("start".into()),
                    ephemeral: true,
                    owner_pid: owner,
                    ports,
                },
            )
            .unwrap();
        }

        fn env(&self, name: &str) -> StackEnv {
            self.orch().resolve_env(name, BTreeMap::new()).unwrap()
        }
    }

    fn free_port() -> u16 {
        TcpListener::bind(("127.0.0.1", 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn launch(plan: StartPlan) -> LaunchPlan {
        match plan {
            StartPlan::Launch(l) => l,
            other => panic!("expected launch, got {other:?}"),
        }
    }

    #[test]
    fn test_background_health_needs_our_server() {
        let fx = Fixture::new();
        fx.new_stack("exp1", "");
        fx.running("exp1", 950, BTreeMap::from([("server".into(), free_port())]));
        let env = fx.env("exp1");
        let url = "http://127.0.0.1:1/health";

        // supervisor up, server not recorded yet: someone else answered
        let err = fx.orch().confirm_background_server(&env, 950, url).unwrap_err();
        assert!(err.to_string().contains("answered but the server process"));

        runtime_state::record_stack_runtime_update(
            &env.paths.runtime_state_file(),
            runtime_state::RuntimePatch::new().process("serverPid", 951),
        )
        .unwrap();
        fx.procs.add(951, FakeProcess::alive());
        fx.orch().confirm_background_server(&env, 950, url).unwrap();

        // state written by a different supervisor
        assert!(fx.orch().confirm_background_server(&env, 952, url).is_err());

        fx.procs.exit(951);
        assert!(fx.orch().confirm_background_server(&env, 950, url).is_err());
    }

    #[tokio::test]
    async fn test_running_stack_is_noop() {
        let fx = Fixture::new();
        fx.new_stack("exp1", "");
        fx.running("exp1", 900, BTreeMap::from([("server".into(), free_port())]));
        let env = fx.env("exp1");
        let ctx = fx.orch().context(Some("exp1"));
        let plan = fx
            .orch()
            .plan_start(&env, &ctx, &StartRequest::default())
            .await
            .unwrap();
        assert_eq!(plan, StartPlan::AlreadyRunning { owner_pid: 900 });
        assert!(fx.procs.signals().is_empty());
    }

    #[tokio::test]
    async fn test_restart_reuses_ports() {
        let fx = Fixture::new();
        fx.new_stack("exp1", "");
        let server = free_port();
        fx.running("exp1", 901, BTreeMap::from([("server".into(), server)]));
        let env = fx.env("exp1");
        let ctx = fx.orch().context(Some("exp1"));
        let req = StartRequest {
            restart: true,
            ..Default::default()
        };
        let plan = launch(fx.orch().plan_start(&env, &ctx, &req).await.unwrap());
        assert!(plan.reused);
        assert_eq!(plan.ports[&PortKind::Server], server);
        assert!(!fx.procs.is_alive(901));
        assert!(!env.paths.runtime_state_file().exists());
    }

    #[tokio::test]
    async fn test_restart_refuses_foreign_port() {
        let fx = Fixture::new();
        fx.new_stack("exp1", "");
        let server = free_port();
        fx.running("exp1", 902, BTreeMap::from([("server".into(), server)]));
        fx.procs.add(903, FakeProcess::alive().listening(server));
        let env = fx.env("exp1");
        let ctx = fx.orch().context(Some("exp1"));
        let req = StartRequest {
            restart: true,
            ..Default::default()
        };
        let err = fx.orch().plan_start(&env, &ctx, &req).await.unwrap_err();
        assert!(err.to_string().contains("already in use by pid(s) 903"));
        assert!(fx.procs.is_alive(903));
    }

    #[tokio::test]
    async fn test_restart_cleans_owned_leftover_listener() {
        let fx = Fixture::new();
        let paths = fx.new_stack("exp1", "");
        let server = free_port();
        fx.running("exp1", 904, BTreeMap::from([("server".into(), server)]));
        // orphaned server from a crashed run, not tracked in processes
        fx.procs.add(
            905,
            FakeProcess::alive()
                .listening(server)
                .with_env([format!("HAPPY_STACKS_ENV_FILE={}", paths.env_file().display())]),
        );
        let env = fx.env("exp1");
        let ctx = fx.orch().context(Some("exp1"));
        let req = StartRequest {
            restart: true,
            ..Default::default()
        };
        let plan = launch(fx.orch().plan_start(&env, &ctx, &req).await.unwrap());
        assert_eq!(plan.ports[&PortKind::Server], server);
        assert!(!fx.procs.is_alive(905));
    }

    #[tokio::test]
    async fn test_fresh_allocation_avoids_other_stacks() {
        let fx = Fixture::new();
        let base = fx.settings.ports.server_base;
        fx.new_stack("exp1", "");
        fx.new_stack("exp2", "");
        fx.running("exp2", 906, BTreeMap::from([("server".into(), base)]));
        let env = fx.env("exp1");
        let ctx = fx.orch().context(Some("exp1"));
        let plan = launch(
            fx.orch()
                .plan_start(&env, &ctx, &StartRequest::default())
                .await
                .unwrap(),
        );
        assert!(!plan.reused);
        assert!(plan.ports[&PortKind::Server] > base);
        assert_eq!(plan.ports.len(), 1);
        assert_eq!(plan.ui_port, None);
    }

    #[tokio::test]
    async fn test_full_flavor_gets_distinct_ports() {
        let fx = Fixture::new();
        fx.new_stack(
            "exp1",
            "HAPPY_STACKS_SERVER_COMPONENT=happy-server\nHAPPY_STACKS_UI_CMD=npm run web\n",
        );
        let env = fx.env("exp1");
        let ctx = fx.orch().context(Some("exp1"));
        let plan = launch(
            fx.orch()
                .plan_start(&env, &ctx, &StartRequest::default())
                .await
                .unwrap(),
        );
        assert_eq!(plan.ports.len(), 6);
        let mut all: Vec<u16> = plan.ports.values().copied().collect();
        all.extend(plan.ui_port);
        let unique: BTreeSet<u16> = all.iter().copied().collect();
        assert_eq!(unique.len(), all.len());
        assert_eq!(plan.ui_port.is_some(), true);
    }

    #[tokio::test]
    async fn test_assigned_ports_are_taken_verbatim() {
        let fx = Fixture::new();
        fx.new_stack("exp1", "");
        let env = fx.env("exp1");
        let ctx = fx.orch().context(Some("exp1"));
        let req = StartRequest {
            assigned_ports: parse_assigned_ports("server=4555").unwrap(),
            ..Default::default()
        };
        let plan = launch(fx.orch().plan_start(&env, &ctx, &req).await.unwrap());
        assert_eq!(plan.ports[&PortKind::Server], 4555);
        assert_eq!(plan.assigned_ports_arg(), "server=4555");
    }

    #[test]
    fn test_parse_assigned_ports() {
        let ports = parse_assigned_ports("server=4010, pg=15433,ui=8082").unwrap();
        assert_eq!(ports["server"], 4010);
        assert_eq!(ports["pg"], 15433);
        assert_eq!(ports["ui"], 8082);
        assert!(parse_assigned_ports("nope=1").is_err());
        assert!(parse_assigned_ports("server=abc").is_err());
        assert!(parse_assigned_ports("server").is_err());
    }

    #[tokio::test]
    async fn test_stop_kills_owned_and_deletes_state() {
        let fx = Fixture::new();
        let paths = fx.new_stack("exp1", "");
        let server = free_port();
        fx.running("exp1", 910, BTreeMap::from([("server".into(), server)]));
        fx.procs.add(
            911,
            FakeProcess::alive()
                .in_group(911)
                .listening(server)
                .with_env([format!("HAPPY_LOCAL_ENV_FILE={}", paths.env_file().display())]),
        );
        runtime_state::record_stack_runtime_update(
            &paths.runtime_state_file(),
            runtime_state::RuntimePatch::new().process("serverPid", 911),
        )
        .unwrap();

        let env = fx.env("exp1");
        let ctx = fx.orch().context(Some("exp1"));
        let report = fx.orch().stop(&env, &ctx).await.unwrap();
        assert!(report.was_running);
        assert_eq!(report.killed, vec![910, 911]);
        assert!(report.state_deleted);
        assert!(!paths.runtime_state_file().exists());
    }

    #[tokio::test]
    async fn test_stop_keeps_state_when_foreign_listener_remains() {
        let fx = Fixture::new();
        let paths = fx.new_stack("exp1", "");
        let server = free_port();
        fx.running("exp1", 912, BTreeMap::from([("server".into(), server)]));
        fx.procs.add(913, FakeProcess::alive().listening(server));

        let env = fx.env("exp1");
        let ctx = fx.orch().context(Some("exp1"));
        let report = fx.orch().stop(&env, &ctx).await.unwrap();
        assert_eq!(report.killed, vec![912]);
        assert_eq!(report.occupied_ports, vec![server]);
        assert!(!report.state_deleted);
        assert!(paths.runtime_state_file().exists());
        assert!(fx.procs.is_alive(913));
    }

    #[tokio::test]
    async fn test_stop_refuses_unowned_owner() {
        let fx = Fixture::new();
        let paths = fx.new_stack("exp1", "");
        record_stack_runtime_start(
            &paths.runtime_state_file(),
            RuntimeStart {
                stack_name: "exp1".into(),
                script: None,
                ephemeral: true,
                owner_pid: 914,
                ports: BTreeMap::new(),
            },
        )
        .unwrap();
        // recycled pid: alive but unrelated
        fx.procs.add(914, FakeProcess::alive().with_cmdline("postgres"));
        let env = fx.env("exp1");
        let ctx = fx.orch().context(Some("exp1"));
        let report = fx.orch().stop(&env, &ctx).await.unwrap();
        assert!(report.killed.is_empty());
        assert_eq!(report.survivors, vec![914]);
        assert!(fx.procs.signals().is_empty());
        assert!(paths.runtime_state_file().exists());
    }

    #[tokio::test]
    async fn test_legacy_stop_kills_port_listeners() {
        let fx = Fixture {
            ambient: AmbientEnv::default(),
            ..Fixture::new()
        };
        let port = free_port();
        fx.new_stack("main", &format!("HAPPY_STACKS_SERVER_PORT={port}\n"));
        fx.procs.add(920, FakeProcess::alive().listening(port));
        let env = fx.env("main");
        let ctx = fx.orch().context(None);
        assert!(!ctx.stack_mode);
        let report = fx.orch().stop(&env, &ctx).await.unwrap();
        assert_eq!(report.killed, vec![920]);
    }

    #[test]
    fn test_status_of_stale_stack() {
        let fx = Fixture::new();
        fx.new_stack("exp1", "HAPPY_STACKS_CLI_BIN=/x/happy.mjs\n");
        record_stack_runtime_start(
            &StackPaths::new(fx.dir.path(), "exp1").runtime_state_file(),
            RuntimeStart {
                stack_name: "exp1".into(),
                script: None,
                ephemeral: true,
                owner_pid: 930,
                ports: BTreeMap::from([("server".into(), 4999)]),
            },
        )
        .unwrap();
        let status = fx.orch().status(&fx.env("exp1"));
        assert!(!status.running);
        assert_eq!(status.owner_pid, None);
        assert!(status.ports.is_empty());
        assert!(status.daemon.is_some_and(|d| d.status.is_stopped()));
    }

    #[test]
    fn test_status_of_running_stack() {
        let fx = Fixture::new();
        fx.new_stack("exp1", "");
        fx.running("exp1", 931, BTreeMap::from([("server".into(), 4998)]));
        let status = fx.orch().status(&fx.env("exp1"));
        assert!(status.running);
        assert_eq!(status.owner_pid, Some(931));
        assert_eq!(status.ports["server"], 4998);
        assert_eq!(status.server_url.as_deref(), Some("http://127.0.0.1:4998"));
        assert!(status.daemon.is_none());
    }
}
