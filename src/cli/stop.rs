use super::Ctx;
use crate::Result;
use itertools::Itertools;
use std::collections::BTreeMap;

/// Stops everything a stack owns
#[derive(Debug, clap::Args)]
#[clap(
    visible_alias = "kill",
    verbatim_doc_comment,
    long_about = "\
Stops everything a stack owns

Signals the supervising process, any leftover tracked children, and the
daemon, then frees the stack's ports. Processes are only signalled when
they can be shown to belong to the stack; anything else is reported and
left running.

Examples:
  happys stack stop exp1
  happys stop                 Stop $HAPPY_STACKS_STACK, or main"
)]
pub struct Stop {
    /// Name of the stack
    name: Option<String>,
}

impl Stop {
    pub async fn run(&self, ctx: &Ctx) -> Result<()> {
        let orch = ctx.orch();
        let sctx = orch.context(self.name.as_deref());
        let env = orch.resolve_env(&sctx.stack_name, BTreeMap::new())?;
        let report = orch.stop(&env, &sctx).await?;

        if !report.survivors.is_empty() || !report.occupied_ports.is_empty() {
            miette::bail!(
                help = format!(
                    "inspect with `happys stack status {}`; the runtime state was kept for a later cleanup",
                    env.name()
                ),
                "stack {} is not fully stopped: pid(s) [{}] alive, port(s) [{}] in use",
                env.name(),
                report.survivors.iter().join(", "),
                report.occupied_ports.iter().join(", ")
            );
        }
        if report.was_running || !report.killed.is_empty() {
            println!("stopped stack {}", env.name());
        } else {
            println!("stack {} is not running", env.name());
        }
        Ok(())
    }
}
