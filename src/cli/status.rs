use super::Ctx;
use crate::Result;
use std::collections::BTreeMap;

/// Display the status of a stack
#[derive(Debug, clap::Args)]
#[clap(
    visible_alias = "stat",
    verbatim_doc_comment,
    long_about = "\
Display the status of a stack

Read only: stale runtime state is reported, never cleaned up.

Example:
  happys stack status exp1

Output:
  Name: exp1
  Status: running (pid 41233)
  Ports: server=3011
  Process serverPid: 41240 (alive)
  Daemon: running (pid 41302)
  Server: http://127.0.0.1:3011"
)]
pub struct Status {
    /// Name of the stack
    name: Option<String>,
}

impl Status {
    pub async fn run(&self, ctx: &Ctx) -> Result<()> {
        let orch = ctx.orch();
        let sctx = orch.context(self.name.as_deref());
        let env = orch.resolve_env(&sctx.stack_name, BTreeMap::new())?;
        let status = orch.status(&env);

        println!("Name: {}", status.name);
        match status.owner_pid {
            Some(pid) => println!("Status: {} (pid {pid})", console::style("running").green()),
            None => println!("Status: {}", console::style("stopped").dim()),
        }
        println!(
            "Ports: {}",
            if status.ephemeral { "ephemeral" } else { "pinned" }
        );
        for (name, port) in &status.ports {
            println!("  {name}={port}");
        }
        for p in &status.processes {
            let state = if p.alive { "alive" } else { "dead" };
            println!("Process {}: {} ({state})", p.name, p.pid);
        }
        if let Some(daemon) = status.daemon {
            match daemon.pid {
                Some(pid) => println!("Daemon: {} (pid {pid})", daemon.status.style()),
                None => println!("Daemon: {}", daemon.status.style()),
            }
        }
        if let Some(url) = &status.server_url {
            println!("Server: {url}");
        }
        if let Some(url) = &status.ui_url {
            println!("UI: {url}");
        }
        if !sctx.stack_mode {
            println!("Mode: single-instance");
        }
        Ok(())
    }
}
