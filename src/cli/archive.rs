use super::Ctx;
use crate::Result;
use crate::procs::PROCS;
use crate::stack::manage::archive_stack;

/// Moves a stopped stack out of the way
#[derive(Debug, clap::Args)]
#[clap(
    verbatim_doc_comment,
    long_about = "\
Moves a stopped stack out of the way

The stack directory moves to <storage>/.archived/<name>-<timestamp>.
Running stacks are refused.

Example:
  happys stack archive exp1"
)]
pub struct Archive {
    /// Name of the stack
    name: String,
}

impl Archive {
    pub async fn run(&self, ctx: &Ctx) -> Result<()> {
        let dest = archive_stack(&ctx.storage_dir, &self.name, &*PROCS)?;
        println!("archived stack {} to {}", self.name, dest.display());
        Ok(())
    }
}
