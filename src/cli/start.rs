use super::Ctx;
use crate::Result;
use crate::stack::runner::StackRunner;
use crate::stack::{StartPlan, StartRequest, open_url, parse_assigned_ports};
use std::collections::BTreeMap;

/// Starts a stack (server, daemon, and UI)
#[derive(Debug, clap::Args)]
#[clap(
    visible_alias = "s",
    verbatim_doc_comment,
    long_about = "\
Starts a stack (server, daemon, and UI)

Without a name, starts $HAPPY_STACKS_STACK, or `main` in single-instance
mode. A stack that is already running is left alone unless --restart is
given. On restart the previous ports are reused.

Examples:
  happys stack start exp1                Run in the foreground until Ctrl-C
  happys stack start exp1 --background   Detach once the server is healthy
  happys stack start exp1 --restart      Replace a running instance
  happys stack start exp1 --open         Open the UI in a browser"
)]
pub struct Start {
    /// Name of the stack
    pub name: Option<String>,
    /// Stop the running instance first, keeping its ports
    #[clap(short, long)]
    pub restart: bool,
    /// Detach once the server is healthy; output goes to the stack log
    #[clap(short, long)]
    pub background: bool,
    /// Open the UI (or server) URL in a browser once up
    #[clap(short, long)]
    pub open: bool,
    #[clap(long, hide = true)]
    pub assigned_ports: Option<String>,
}

impl Start {
    pub async fn run(&self, ctx: &Ctx) -> Result<()> {
        let orch = ctx.orch();
        let sctx = orch.context(self.name.as_deref());
        let env = orch.resolve_env(&sctx.stack_name, BTreeMap::new())?;
        let req = StartRequest {
            restart: self.restart,
            background: self.background,
            open: self.open,
            assigned_ports: match &self.assigned_ports {
                Some(raw) => parse_assigned_ports(raw)?,
                None => BTreeMap::new(),
            },
        };

        match orch.plan_start(&env, &sctx, &req).await? {
            StartPlan::AlreadyRunning { owner_pid } => {
                println!("stack {} is already running (pid {owner_pid})", env.name());
                if let Some(url) = env.public_server_url() {
                    println!("  server {url}");
                }
                if let Some(url) = env.ui_url() {
                    println!("  ui     {url}");
                }
                if req.open
                    && let Some(url) = env.ui_url().or_else(|| env.public_server_url())
                {
                    open_url(orch.runner, &url).log("open browser");
                }
                Ok(())
            }
            StartPlan::Launch(plan) if req.background => {
                let pid = orch.start_background(&env, &plan).await?;
                let server = plan
                    .ports
                    .get(&crate::ports::PortKind::Server)
                    .map(|p| format!("http://127.0.0.1:{p}"));
                let ui = plan.ui_port.map(|p| format!("http://localhost:{p}"));
                println!("stack {} started in background (pid {pid})", env.name());
                if let Some(url) = &server {
                    println!("  server {url}");
                }
                if let Some(url) = &ui {
                    println!("  ui     {url}");
                }
                println!("  logs   {}", env.paths.stack_log().display());
                if req.open
                    && let Some(url) = ui.or(server)
                {
                    open_url(orch.runner, &url).log("open browser");
                }
                Ok(())
            }
            StartPlan::Launch(plan) => StackRunner::new(&orch, env, plan, req.open)?.run().await,
        }
    }
}
