use super::Ctx;
use crate::Result;
use crate::procs::PROCS;
use crate::stack::manage::list_stacks;
use crate::ui::table::{new_table, print_table};
use comfy_table::Cell;

/// List all stacks
#[derive(Debug, clap::Args)]
#[clap(
    visible_alias = "ls",
    verbatim_doc_comment,
    long_about = "\
List all stacks

Example:
  happys stack list
  happys stack ls --hide-header

Output:
  Name   Status   PID    Server  Ports
  exp1   running  41233  3011    ephemeral
  main   stopped         3005    pinned"
)]
pub struct List {
    /// Hide the table header row
    #[clap(long)]
    hide_header: bool,
}

impl List {
    pub async fn run(&self, ctx: &Ctx) -> Result<()> {
        let mut table = new_table(&["Name", "Status", "PID", "Server", "Ports"], self.hide_header);
        for stack in list_stacks(&ctx.storage_dir, &ctx.home_dir, &*PROCS) {
            let status = if stack.running {
                console::style("running").green().to_string()
            } else {
                console::style("stopped").dim().to_string()
            };
            table.add_row(vec![
                Cell::new(&stack.name),
                Cell::new(status),
                Cell::new(stack.owner_pid.map(|p| p.to_string()).unwrap_or_default()),
                Cell::new(stack.server_port.map(|p| p.to_string()).unwrap_or_default()),
                Cell::new(if stack.ephemeral { "ephemeral" } else { "pinned" }),
            ]);
        }
        print_table(table)
    }
}
