use crate::Result;
use crate::env::{self, AmbientEnv};
use crate::exec::DuctRunner;
use crate::procs::PROCS;
use crate::settings::Settings;
use crate::stack::Orchestrator;
use clap::Parser;
use std::path::PathBuf;

mod archive;
mod daemon;
mod list;
mod logs;
mod new;
mod restart;
mod stack;
mod start;
mod status;
mod stop;

/// Run many isolated local dev stacks side by side
#[derive(Debug, clap::Parser)]
#[clap(name = "happys", version, about, long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Debug, clap::Subcommand)]
enum Commands {
    Stack(stack::Stack),
    Start(start::Start),
    Stop(stop::Stop),
    Restart(restart::Restart),
    Status(status::Status),
    Logs(logs::Logs),
}

pub async fn run() -> Result<()> {
    let args = Cli::parse();
    let ctx = Ctx::load()?;
    match args.command {
        Commands::Stack(stack) => stack.run(&ctx).await,
        Commands::Start(start) => start.run(&ctx).await,
        Commands::Stop(stop) => stop.run(&ctx).await,
        Commands::Restart(restart) => restart.run(&ctx).await,
        Commands::Status(status) => status.run(&ctx).await,
        Commands::Logs(logs) => logs.run(&ctx).await,
    }
}

/// Process-wide inputs, captured once per invocation.
pub(crate) struct Ctx {
    pub ambient: AmbientEnv,
    pub settings: Settings,
    pub storage_dir: PathBuf,
    pub home_dir: PathBuf,
    runner: DuctRunner,
}

impl Ctx {
    fn load() -> Result<Self> {
        let ambient = AmbientEnv::capture();
        let settings = Settings::load(&env::HAPPY_STACKS_CONFIG_FILE, &ambient)?;
        Ok(Self {
            ambient,
            settings,
            storage_dir: env::HAPPY_STACKS_STORAGE_DIR.clone(),
            home_dir: env::HOME_DIR.clone(),
            runner: DuctRunner,
        })
    }

    pub fn orch(&self) -> Orchestrator<'_> {
        Orchestrator {
            storage_dir: &self.storage_dir,
            home_dir: &self.home_dir,
            ambient: &self.ambient,
            settings: &self.settings,
            procs: &*PROCS,
            runner: &self.runner,
        }
    }
}
