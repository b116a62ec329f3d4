use super::Ctx;
use crate::Result;
use crate::daemon::controller::latest_daemon_log;
use crate::tail::tail_lines;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum Component {
    /// Everything a background supervisor printed
    Stack,
    /// Supervisor lifecycle events
    Supervisor,
    Server,
    Ui,
    /// Newest log in the stack's CLI home
    Daemon,
}

/// Displays the tail of a stack's logs
#[derive(Debug, clap::Args)]
#[clap(
    verbatim_doc_comment,
    long_about = "\
Displays the tail of a stack's logs

Examples:
  happys stack logs exp1                     Last 100 lines of stack.log
  happys stack logs exp1 -n 20 -c server     Last 20 lines of server.log
  happys stack logs exp1 -c daemon           Newest daemon log"
)]
pub struct Logs {
    /// Name of the stack
    name: Option<String>,
    /// Number of lines to show
    #[clap(short, default_value = "100")]
    n: usize,
    /// Which log to show
    #[clap(short, long, value_enum, default_value = "stack")]
    component: Component,
}

impl Logs {
    pub async fn run(&self, ctx: &Ctx) -> Result<()> {
        let orch = ctx.orch();
        let sctx = orch.context(self.name.as_deref());
        let env = orch.resolve_env(&sctx.stack_name, BTreeMap::new())?;
        let path = match self.component {
            Component::Stack => env.paths.stack_log(),
            Component::Supervisor => env.paths.supervisor_log(),
            Component::Server => env.paths.child_log("server"),
            Component::Ui => env.paths.child_log("ui"),
            Component::Daemon => match latest_daemon_log(&env.config.cli_home_dir) {
                Some(path) => path,
                None => {
                    warn!("no daemon logs in {}", env.config.cli_home_dir.display());
                    return Ok(());
                }
            },
        };
        let lines = tail_lines(&path, self.n);
        if lines.is_empty() {
            warn!("no output in {}", path.display());
        }
        for line in lines {
            println!("{line}");
        }
        Ok(())
    }
}
