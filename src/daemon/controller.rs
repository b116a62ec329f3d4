//! Starting and stopping a stack's CLI daemon.
//!
//! The daemon is an external program (`<cli_bin> daemon start|stop`) that
//! records itself in `daemon.state.json` and `daemon.state.json.lock` inside
//! its home directory. Nothing here kills or replaces a daemon without
//! evidence that it belongs to this stack; when evidence is missing the
//! daemon is left alone and the situation is reported.

use super::auth::{self, LogSignature};
use super::state::{self, DaemonState, DaemonStatus, check_daemon_state};
use crate::Result;
use crate::error::DaemonError;
use crate::exec::{CommandOutput, CommandRunner, CommandSpec};
use crate::ownership::{terminate, wait_for_exit};
use crate::procs::ProcessIntrospector;
use crate::settings::Settings;
use crate::stack_env::StackEnv;
use crate::step::StepResult;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use tokio::time;

/// What a stack's daemon should look like.
#[derive(Debug, Clone)]
pub struct DaemonTarget {
    pub stack_name: String,
    pub is_main: bool,
    pub cli_bin: PathBuf,
    pub cli_home_dir: PathBuf,
    pub internal_server_url: String,
    pub public_server_url: String,
    /// Stack environment the daemon inherits.
    pub base_env: BTreeMap<String, String>,
}

impl DaemonTarget {
    /// `None` when the stack has no CLI configured or no server port yet.
    pub fn for_stack(env: &StackEnv) -> Option<Self> {
        let cli_bin = env.config.cli_bin.clone()?;
        let internal_server_url = env.internal_server_url()?;
        Some(Self {
            stack_name: env.name().to_string(),
            is_main: env.paths.is_main(),
            public_server_url: env
                .public_server_url()
                .unwrap_or_else(|| internal_server_url.clone()),
            internal_server_url,
            cli_bin,
            cli_home_dir: env.config.cli_home_dir.clone(),
            base_env: env.process_env(),
        })
    }

    fn command(&self, subcommand: &str) -> CommandSpec {
        let mut env = self.base_env.clone();
        env.insert(
            "HAPPY_HOME_DIR".into(),
            self.cli_home_dir.to_string_lossy().to_string(),
        );
        env.insert("HAPPY_SERVER_URL".into(), self.internal_server_url.clone());
        env.insert("HAPPY_WEBAPP_URL".into(), self.public_server_url.clone());
        CommandSpec::new(self.cli_bin.to_string_lossy())
            .args(["daemon", subcommand])
            .envs(env)
    }

    fn login_command(&self) -> String {
        auth::login_command(&self.cli_bin, &self.cli_home_dir, &self.internal_server_url)
    }
}

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub force_restart: bool,
    /// Block and wait for credentials instead of failing fast.
    pub wait_for_auth: bool,
    pub auto_rebuild: bool,
    pub build_cmd: Option<String>,
    pub auto_auth_seed: bool,
    /// CLI home of the stack to reseed rejected credentials from.
    pub auth_seed_from: Option<PathBuf>,
    /// Older credential locations to migrate from.
    pub legacy_homes: Vec<PathBuf>,
}

/// Result of comparing a running daemon's environment with the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvMatch {
    Matches,
    Mismatch(String),
    Inconclusive,
}

pub struct DaemonController<'a> {
    pub procs: &'a dyn ProcessIntrospector,
    pub runner: &'a dyn CommandRunner,
    pub settings: &'a Settings,
    pub shutting_down: &'a AtomicBool,
}

impl DaemonController<'_> {
    pub fn status(&self, cli_home: &Path) -> DaemonState {
        check_daemon_state(cli_home, self.procs)
    }

    pub async fn start_local_daemon_with_auth(
        &self,
        target: &DaemonTarget,
        opts: &StartOptions,
    ) -> Result<DaemonState> {
        self.ensure_artifact(target, opts)?;

        auth::migrate_legacy_credentials(&target.cli_home_dir, &opts.legacy_homes)
            .log("credential migration");

        if !opts.force_restart {
            let current = self.status(&target.cli_home_dir);
            if let (DaemonStatus::Running | DaemonStatus::Starting, Some(pid)) =
                (current.status, current.pid)
            {
                match self.env_matches(pid, target) {
                    EnvMatch::Matches => {
                        info!("daemon for {} already running (pid {pid})", target.stack_name);
                        return Ok(current);
                    }
                    EnvMatch::Mismatch(why) => {
                        info!("daemon pid {pid} points elsewhere ({why}), restarting");
                    }
                    EnvMatch::Inconclusive => {
                        warn!(
                            "daemon pid {pid} is running but its environment can't be verified; leaving it alone (use --restart to replace it)"
                        );
                        return Ok(current);
                    }
                }
            }
        }

        // fails only when our own daemon survived SIGKILL
        let stopped = self.stop_local_daemon(target).await.log("stop daemon");
        if !stopped.ok {
            return Err(DaemonError::StopFailed {
                stack: target.stack_name.clone(),
                error: stopped.detail,
            }
            .into());
        }
        self.cleanup_stale_daemon_state(&target.cli_home_dir)
            .log("daemon state cleanup");

        let failure = match self.attempt_start(target).await {
            Ok(state) => return Ok(state),
            Err(text) => text,
        };

        match auth::classify_daemon_log(&failure) {
            LogSignature::MissingCredentials => self.recover_missing_credentials(target, opts).await,
            LogSignature::CredentialsRejected => self.recover_rejected_credentials(target, opts).await,
            LogSignature::Unknown => Err(self.start_failed(target, &failure)),
        }
    }

    async fn recover_missing_credentials(
        &self,
        target: &DaemonTarget,
        opts: &StartOptions,
    ) -> Result<DaemonState> {
        let login = target.login_command();
        if !opts.wait_for_auth {
            return Err(DaemonError::MissingCredentials {
                stack: target.stack_name.clone(),
                help: format!("log in, then start again:\n  {login}"),
            }
            .into());
        }
        let timeout = self.settings.auth_wait_timeout();
        warn!(
            "daemon for {} needs credentials. In another terminal run:\n  {login}\nwaiting up to {}",
            target.stack_name,
            humantime::format_duration(timeout)
        );
        auth::wait_for_credentials(
            &target.cli_home_dir,
            timeout,
            self.settings.auth_poll_interval(),
            self.shutting_down,
        )
        .await?;
        self.retry_once(target).await
    }

    async fn recover_rejected_credentials(
        &self,
        target: &DaemonTarget,
        opts: &StartOptions,
    ) -> Result<DaemonState> {
        let seed = match (&opts.auth_seed_from, opts.auto_auth_seed && !target.is_main) {
            (Some(from), true) => Some(from),
            _ => None,
        };
        let Some(from) = seed else {
            return Err(DaemonError::CredentialsRejected {
                stack: target.stack_name.clone(),
                help: format!(
                    "log in again: {}\nor set HAPPY_STACKS_AUTO_AUTH_SEED=1 and HAPPY_STACKS_AUTH_SEED_FROM=<stack> to copy credentials",
                    target.login_command()
                ),
            }
            .into());
        };
        let step = auth::reseed_credentials(from, &target.cli_home_dir).log("credential reseed");
        if !step.ok {
            return Err(DaemonError::CredentialsRejected {
                stack: target.stack_name.clone(),
                help: format!("{}; log in again: {}", step.detail, target.login_command()),
            }
            .into());
        }
        self.retry_once(target).await
    }

    async fn retry_once(&self, target: &DaemonTarget) -> Result<DaemonState> {
        self.cleanup_stale_daemon_state(&target.cli_home_dir)
            .log("daemon state cleanup");
        self.attempt_start(target)
            .await
            .map_err(|text| self.start_failed(target, &text))
    }

    /// Runs `daemon start` and waits for a live state pid. On failure returns
    /// the command output plus the daemon log tail.
    async fn attempt_start(&self, target: &DaemonTarget) -> std::result::Result<DaemonState, String> {
        xx::file::mkdirp(&target.cli_home_dir).map_err(|e| e.to_string())?;
        info!("starting daemon for {}", target.stack_name);
        let output = match self.runner.capture(&target.command("start")) {
            Ok(out) => out,
            Err(e) => return Err(e.to_string()),
        };
        if !output.success() {
            // a concurrent start may have won the lock
            let state = self.status(&target.cli_home_dir);
            if state.status.is_running() {
                debug!("daemon start exited {:?} but daemon is running", output.code);
                return Ok(state);
            }
            return Err(self.failure_text(target, &output));
        }
        match self.wait_until_running(&target.cli_home_dir).await {
            Some(state) => {
                info!("daemon for {} running (pid {:?})", target.stack_name, state.pid);
                Ok(state)
            }
            None => Err(self.failure_text(target, &output)),
        }
    }

    async fn wait_until_running(&self, cli_home: &Path) -> Option<DaemonState> {
        let deadline = time::Instant::now() + self.settings.daemon_start_timeout();
        loop {
            let state = self.status(cli_home);
            if state.status.is_running() {
                return Some(state);
            }
            if time::Instant::now() >= deadline {
                return None;
            }
            time::sleep(Duration::from_millis(100)).await;
        }
    }

    fn failure_text(&self, target: &DaemonTarget, output: &CommandOutput) -> String {
        let mut text = output.combined();
        if let Some(log) = latest_daemon_log(&target.cli_home_dir) {
            text.push('\n');
            text.push_str(&crate::tail::excerpt(&log, self.settings.daemon.log_tail_lines));
        }
        text
    }

    fn start_failed(&self, target: &DaemonTarget, text: &str) -> miette::Report {
        DaemonError::StartFailed {
            stack: target.stack_name.clone(),
            log_excerpt: text.trim().to_string(),
            help: format!(
                "inspect the daemon logs in {}\nretry: happys stack daemon {} start --restart\nrebuild the CLI if it was updated, or log in: {}",
                target.cli_home_dir.join("logs").display(),
                target.stack_name,
                target.login_command()
            ),
        }
        .into()
    }

    fn ensure_artifact(&self, target: &DaemonTarget, opts: &StartOptions) -> Result<()> {
        if target.cli_bin.exists() {
            return Ok(());
        }
        if opts.auto_rebuild
            && let Some(build) = &opts.build_cmd
        {
            info!("{} is missing, rebuilding: {build}", target.cli_bin.display());
            let mut spec = CommandSpec::from_shell_words(build)?.envs(target.base_env.clone());
            if let Some(dir) = target.cli_bin.parent().and_then(Path::parent) {
                spec = spec.cwd(dir);
            }
            match self.runner.capture(&spec) {
                Ok(out) if out.success() => {}
                Ok(out) => warn!("rebuild failed ({:?}): {}", out.code, out.combined()),
                Err(e) => warn!("rebuild failed: {e}"),
            }
        }
        if target.cli_bin.exists() {
            return Ok(());
        }
        Err(DaemonError::ArtifactMissing {
            path: target.cli_bin.clone(),
            help: match &opts.build_cmd {
                Some(build) => format!("build the CLI first: {build}"),
                None => "build the CLI, or point HAPPY_STACKS_CLI_BIN at an existing binary".to_string(),
            },
        }
        .into())
    }

    /// Compares the daemon's environment with where it should point.
    pub fn env_matches(&self, pid: u32, target: &DaemonTarget) -> EnvMatch {
        let Some(env) = self.procs.environment(pid) else {
            return EnvMatch::Inconclusive;
        };
        let lookup = |key: &str| {
            env.iter()
                .find_map(|kv| kv.strip_prefix(key)?.strip_prefix('='))
                .map(str::to_string)
        };
        let home = target.cli_home_dir.to_string_lossy();
        let expected = [
            ("HAPPY_HOME_DIR", home.as_ref()),
            ("HAPPY_SERVER_URL", target.internal_server_url.as_str()),
            ("HAPPY_WEBAPP_URL", target.public_server_url.as_str()),
        ];
        for (key, want) in expected {
            match lookup(key) {
                Some(got) if got == want => {}
                Some(got) => return EnvMatch::Mismatch(format!("{key}={got}, want {want}")),
                None => return EnvMatch::Mismatch(format!("{key} unset")),
            }
        }
        EnvMatch::Matches
    }

    /// Graceful `daemon stop`, then a lock-pid kill for daemons that never
    /// registered, gated on the pid looking like this stack's daemon. A pid
    /// without that evidence is left alone and reported as stale; only a
    /// daemon of ours surviving SIGKILL fails the step.
    pub async fn stop_local_daemon(&self, target: &DaemonTarget) -> StepResult {
        let home = &target.cli_home_dir;
        let before = self.status(home);
        if before.status == DaemonStatus::Stopped {
            return StepResult::skipped("daemon not running");
        }

        if target.cli_bin.exists() {
            match self.runner.capture(&target.command("stop")) {
                Ok(out) if out.success() => debug!("daemon stop: {}", out.combined()),
                Ok(out) => debug!("daemon stop exited {:?}: {}", out.code, out.combined()),
                Err(e) => debug!("daemon stop failed: {e}"),
            }
        }

        let Some(pid) = self.live_daemon_pid(home) else {
            return StepResult::ok("daemon stopped");
        };
        if !self.looks_like_our_daemon(pid, target) {
            // recycled or foreign pid: never signal it, its files are stale
            return StepResult::skipped(format!(
                "pid {pid} is not provably the daemon for {}, treating its state as stale",
                home.display()
            ));
        }
        if wait_for_exit(self.procs, pid, self.settings.kill_grace()).await {
            return StepResult::ok("daemon stopped");
        }

        info!("force-stopping daemon pid {pid}");
        if terminate(self.procs, pid, self.settings.kill_grace()).await.killed
            && !self.procs.is_alive(pid)
        {
            StepResult::ok(format!("killed daemon pid {pid}"))
        } else {
            StepResult::failed(format!("pid {pid} survived SIGKILL"))
        }
    }

    fn live_daemon_pid(&self, home: &Path) -> Option<u32> {
        let state = self.status(home);
        state
            .pid
            .filter(|_| matches!(state.status, DaemonStatus::Running | DaemonStatus::Starting))
            .or_else(|| state::lock_pid(home).filter(|pid| self.procs.is_alive(*pid)))
    }

    /// Best-effort heuristic: the command line mentions `daemon` plus the CLI
    /// binary name or `happy`, and the process has files open under the
    /// daemon home.
    fn looks_like_our_daemon(&self, pid: u32, target: &DaemonTarget) -> bool {
        let Some(cmdline) = self.procs.command_line(pid) else {
            return false;
        };
        let bin_name = target
            .cli_bin
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let daemonish = cmdline.contains("daemon")
            && ((!bin_name.is_empty() && cmdline.contains(&bin_name)) || cmdline.contains("happy"));
        daemonish && self.procs.has_open(pid, &target.cli_home_dir)
    }

    /// Removes lock and state files unless their pid is alive and has that
    /// exact file open.
    pub fn cleanup_stale_daemon_state(&self, cli_home: &Path) -> StepResult {
        let mut removed = vec![];
        let mut kept = vec![];
        for path in [state::lock_file(cli_home), state::state_file(cli_home)] {
            if !path.exists() {
                continue;
            }
            let pid = read_any_pid(&path);
            if let Some(pid) = pid
                && self.procs.is_alive(pid)
                && self.procs.has_open(pid, &path)
            {
                kept.push(format!("{} (held by pid {pid})", path.display()));
                continue;
            }
            if let Err(e) = std::fs::remove_file(&path) {
                return StepResult::failed(format!("could not remove {}: {e}", path.display()));
            }
            removed.push(path.display().to_string());
        }
        match (removed.is_empty(), kept.is_empty()) {
            (true, true) => StepResult::skipped("nothing to clean"),
            _ => StepResult::ok(format!("removed [{}] kept [{}]", removed.join(", "), kept.join(", "))),
        }
    }
}

fn read_any_pid(path: &Path) -> Option<u32> {
    let raw = std::fs::read_to_string(path).ok()?;
    let raw = raw.trim();
    raw.parse::<u32>().ok().or_else(|| {
        serde_json::from_str::<serde_json::Value>(raw)
            .ok()?
            .get("pid")?
            .as_u64()
            .and_then(|p| u32::try_from(p).ok())
    })
}

/// Newest log file under `<cli_home>/logs`, preferring daemon logs.
pub fn latest_daemon_log(cli_home: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(cli_home.join("logs")).ok()?;
    let mut logs: Vec<(bool, std::time::SystemTime, PathBuf)> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "log"))
        .filter_map(|p| {
            let modified = p.metadata().and_then(|m| m.modified()).ok()?;
            let daemon = p
                .file_name()
                .is_some_and(|n| n.to_string_lossy().contains("daemon"));
            Some((daemon, modified, p))
        })
        .collect();
    logs.sort();
    logs.pop().map(|(_, _, p)| p)
}
