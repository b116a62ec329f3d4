use super::Ctx;
use crate::Result;
use crate::stack::manage::{NewStack, create_stack};
use crate::stack_env::ServerFlavor;

/// Creates a new stack
#[derive(Debug, clap::Args)]
#[clap(
    verbatim_doc_comment,
    long_about = "\
Creates a new stack

Writes <storage>/<name>/env. Without --port the stack is ephemeral: it gets
free ports each time it starts, and keeps them across restarts.

Examples:
  happys stack new exp1
  happys stack new exp1 --server happy-server
  happys stack new demo --port 3020
  happys stack new exp1 --set SERVER_CMD='yarn dev' --set CLI_BIN=~/src/cli/bin/happy.mjs"
)]
pub struct New {
    /// Name of the stack
    name: String,
    /// Server flavor: happy-server-light or happy-server
    #[clap(long, default_value = "happy-server-light")]
    server: ServerFlavor,
    /// Pin the server port
    #[clap(short, long)]
    port: Option<u16>,
    /// Extra KEY=VALUE for the env file; short keys get the HAPPY_STACKS_ prefix
    #[clap(long = "set", value_parser = parse_key_val)]
    vars: Vec<(String, String)>,
}

impl New {
    pub async fn run(&self, ctx: &Ctx) -> Result<()> {
        let paths = create_stack(
            &ctx.storage_dir,
            &self.name,
            &NewStack {
                flavor: self.server,
                server_port: self.port,
                vars: self.vars.clone(),
            },
        )?;
        println!("created stack {} ({})", self.name, paths.env_file().display());
        println!("start it with: happys stack start {}", self.name);
        Ok(())
    }
}

fn parse_key_val(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}
