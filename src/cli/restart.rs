use super::Ctx;
use super::start::Start;
use crate::Result;

/// Restarts a stack on the same ports
#[derive(Debug, clap::Args)]
#[clap(
    verbatim_doc_comment,
    long_about = "\
Restarts a stack on the same ports

Same as `start --restart`. Fails rather than moving to new ports when a
previous port is held by a process the stack does not own.

Examples:
  happys stack restart exp1
  happys stack restart exp1 --background"
)]
pub struct Restart {
    /// Name of the stack
    name: Option<String>,
    /// Detach once the server is healthy
    #[clap(short, long)]
    background: bool,
    /// Open the UI in a browser once up
    #[clap(short, long)]
    open: bool,
}

impl Restart {
    pub async fn run(&self, ctx: &Ctx) -> Result<()> {
        Start {
            name: self.name.clone(),
            restart: true,
            background: self.background,
            open: self.open,
            assigned_ports: None,
        }
        .run(ctx)
        .await
    }
}
