use super::{Ctx, archive, daemon, list, logs, new, restart, start, status, stop};
use crate::Result;

/// Create, run, and inspect named stacks
#[derive(Debug, clap::Args)]
#[clap(
    verbatim_doc_comment,
    long_about = "\
Create, run, and inspect named stacks

Each stack has its own env file, ports, CLI home, and logs under
$HAPPY_STACKS_STORAGE_DIR (default ~/.happy/stacks).

Examples:
  happys stack new exp1              Create an ephemeral-port stack
  happys stack start exp1            Run it in the foreground
  happys stack start exp1 --background
  happys stack list                  Show every stack
  happys stack stop exp1             Stop what exp1 owns"
)]
pub struct Stack {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Debug, clap::Subcommand)]
enum Commands {
    New(new::New),
    Start(start::Start),
    Stop(stop::Stop),
    Restart(restart::Restart),
    Status(status::Status),
    List(list::List),
    Archive(archive::Archive),
    Logs(logs::Logs),
    Daemon(daemon::Daemon),
}

impl Stack {
    pub async fn run(self, ctx: &Ctx) -> Result<()> {
        match self.command {
            Commands::New(new) => new.run(ctx).await,
            Commands::Start(start) => start.run(ctx).await,
            Commands::Stop(stop) => stop.run(ctx).await,
            Commands::Restart(restart) => restart.run(ctx).await,
            Commands::Status(status) => status.run(ctx).await,
            Commands::List(list) => list.run(ctx).await,
            Commands::Archive(archive) => archive.run(ctx).await,
            Commands::Logs(logs) => logs.run(ctx).await,
            Commands::Daemon(daemon) => daemon.run(ctx).await,
        }
    }
}
