use super::Ctx;
use crate::Result;
use crate::daemon::controller::DaemonTarget;
use crate::stack_env::StackEnv;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;

/// Start, stop, and check a stack's CLI daemon
#[derive(Debug, clap::Args)]
#[clap(
    verbatim_doc_comment,
    long_about = "\
Start, stop, and check a stack's CLI daemon

The daemon talks to the stack's server, so the stack needs a server port:
either pinned in its env file or taken from the running instance.

Examples:
  happys stack daemon exp1 status
  happys stack daemon exp1 start
  happys stack daemon exp1 start --restart
  happys stack daemon exp1 stop"
)]
pub struct Daemon {
    /// Name of the stack
    name: String,
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Debug, clap::Subcommand)]
enum Commands {
    /// Start the daemon, handling first-run authentication
    Start {
        /// Restart even if a matching daemon is running
        #[clap(short, long)]
        restart: bool,
    },
    /// Stop the daemon
    Stop,
    /// Show the daemon's state
    Status,
}

impl Daemon {
    pub async fn run(self, ctx: &Ctx) -> Result<()> {
        let orch = ctx.orch();
        let env = orch.resolve_env(&self.name, BTreeMap::new())?;
        let shutting_down = AtomicBool::new(false);
        let controller = orch.daemon_controller(&shutting_down);

        match self.command {
            Commands::Status => {
                let state = controller.status(&env.config.cli_home_dir);
                match state.pid {
                    Some(pid) => println!("Daemon: {} (pid {pid})", state.status.style()),
                    None => println!("Daemon: {}", state.status.style()),
                }
                println!("Home: {}", env.config.cli_home_dir.display());
                Ok(())
            }
            Commands::Start { restart } => {
                let target = target(&env)?;
                let opts = orch.daemon_start_options(&env, restart);
                let state = controller.start_local_daemon_with_auth(&target, &opts).await?;
                match state.pid {
                    Some(pid) => println!("daemon for {} is {} (pid {pid})", env.name(), state.status.style()),
                    None => println!("daemon for {} is {}", env.name(), state.status.style()),
                }
                Ok(())
            }
            Commands::Stop => {
                let target = target(&env)?;
                let step = controller.stop_local_daemon(&target).await;
                if !step.ok {
                    miette::bail!("{}", step.detail);
                }
                println!("{}", step.detail);
                Ok(())
            }
        }
    }
}

fn target(env: &StackEnv) -> Result<DaemonTarget> {
    if env.config.cli_bin.is_none() {
        miette::bail!(
            help = format!("set HAPPY_STACKS_CLI_BIN in {}", env.paths.env_file().display()),
            "stack {} has no CLI configured",
            env.name()
        );
    }
    DaemonTarget::for_stack(env).ok_or_else(|| {
        miette::miette!(
            help = format!(
                "start the stack first (happys stack start {}) or pin HAPPY_STACKS_SERVER_PORT",
                env.name()
            ),
            "stack {} has no server port",
            env.name()
        )
    })
}
