//! Diagnostic error types for stack, port, daemon and file failures.
//!
//! Every variant that can reach the top level carries a `help` naming a
//! concrete command the user can run next.

// False positive: fields are used in #[error] format strings and miette derive macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors about stack identity and configuration.
#[derive(Debug, Error, Diagnostic)]
pub enum StackError {
    #[error("stack '{name}' does not exist")]
    #[diagnostic(code(happys::stack::not_found))]
    NotFound {
        name: String,
        #[help]
        help: String,
    },

    #[error("stack '{name}' already exists at {}", path.display())]
    #[diagnostic(code(happys::stack::already_exists))]
    AlreadyExists {
        name: String,
        path: PathBuf,
        #[help]
        help: String,
    },

    #[error("invalid stack name '{name}': {reason}")]
    #[diagnostic(
        code(happys::stack::invalid_name),
        help("use letters, numbers, '-' or '_' (e.g. 'exp1' or 'pr-123')")
    )]
    InvalidName { name: String, reason: String },

    #[error("stack '{name}' is running (owner pid {pid})")]
    #[diagnostic(code(happys::stack::running))]
    Running {
        name: String,
        pid: u32,
        #[help]
        help: String,
    },

    #[error("invalid server flavor '{value}'")]
    #[diagnostic(
        code(happys::stack::invalid_flavor),
        help("set HAPPY_STACKS_SERVER_COMPONENT to 'happy-server-light' or 'happy-server'")
    )]
    InvalidFlavor { value: String },

    #[error("stack '{name}' has no server command")]
    #[diagnostic(code(happys::stack::no_server_cmd))]
    NoServerCommand {
        name: String,
        #[help]
        help: String,
    },
}

/// Errors related to port allocation and port ownership.
#[derive(Debug, Error, Diagnostic)]
pub enum PortError {
    #[error("no free TCP port found after {tries} attempts starting at {start}")]
    #[diagnostic(
        code(happys::port::exhausted),
        help("stop unused stacks (happys stack list) or raise ports.max_tries in config.toml")
    )]
    Exhausted { start: u16, tries: u32 },

    #[error("port {port} ({name}) is already in use by pid(s) {}", format_pids(pids))]
    #[diagnostic(code(happys::port::occupied))]
    Occupied {
        name: String,
        port: u16,
        pids: Vec<u32>,
        #[help]
        help: String,
    },

    #[error("refusing to kill listeners on port {port}: not provably owned by stack '{stack}'")]
    #[diagnostic(code(happys::port::not_owned))]
    NotOwned {
        stack: String,
        port: u16,
        #[help]
        help: String,
    },

    #[error("refusing to kill port listeners on {port} in multi-stack mode")]
    #[diagnostic(
        code(happys::port::legacy_kill_refused),
        help("stop the owning stack explicitly: happys stack stop <name>")
    )]
    LegacyKillRefused { port: u16 },
}

/// Errors related to the CLI daemon subprocess.
#[derive(Debug, Error, Diagnostic)]
pub enum DaemonError {
    #[error("daemon executable not found: {}", path.display())]
    #[diagnostic(code(happys::daemon::artifact_missing))]
    ArtifactMissing {
        path: PathBuf,
        #[help]
        help: String,
    },

    #[error("daemon for stack '{stack}' has no credentials")]
    #[diagnostic(code(happys::daemon::missing_credentials))]
    MissingCredentials {
        stack: String,
        #[help]
        help: String,
    },

    #[error("daemon for stack '{stack}' was rejected by the server (401)")]
    #[diagnostic(code(happys::daemon::credentials_rejected))]
    CredentialsRejected {
        stack: String,
        #[help]
        help: String,
    },

    #[error("timed out after {seconds}s waiting for credentials in {}", path.display())]
    #[diagnostic(code(happys::daemon::auth_timeout))]
    AuthTimeout {
        seconds: u64,
        path: PathBuf,
        #[help]
        help: String,
    },

    #[error("failed to start daemon for stack '{stack}'\n{log_excerpt}")]
    #[diagnostic(code(happys::daemon::start_failed))]
    StartFailed {
        stack: String,
        log_excerpt: String,
        #[help]
        help: String,
    },

    #[error("failed to stop daemon for stack '{stack}': {error}")]
    #[diagnostic(
        code(happys::daemon::stop_failed),
        help("the process may be stuck or require manual intervention. Try: kill -9 <pid>")
    )]
    StopFailed { stack: String, error: String },
}

/// Errors raised while bringing a stack up.
#[derive(Debug, Error, Diagnostic)]
pub enum StartError {
    #[error("{what} for stack '{stack}' exited before becoming ready ({status})\n{log_excerpt}")]
    #[diagnostic(code(happys::start::child_exited))]
    ChildExited {
        what: String,
        stack: String,
        status: String,
        log_excerpt: String,
        #[help]
        help: String,
    },

    #[error("{url} did not become healthy within {seconds}s")]
    #[diagnostic(code(happys::start::health_timeout))]
    HealthTimeout {
        url: String,
        seconds: u64,
        #[help]
        help: String,
    },

    #[error("{url} answered but the server process (pid {pid}) is gone")]
    #[diagnostic(
        code(happys::start::impostor),
        help("another process is answering on this port; inspect it with: lsof -nP -iTCP -sTCP:LISTEN")
    )]
    ImpostorResponder { url: String, pid: u32 },
}

/// Errors related to file operations (env, runtime state and lock files).
#[derive(Debug, Error, Diagnostic)]
pub enum FileError {
    #[error("failed to read file: {}", path.display())]
    #[diagnostic(code(happys::file::read_error))]
    ReadError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write file: {}", path.display())]
    #[diagnostic(code(happys::file::write_error))]
    WriteError {
        path: PathBuf,
        #[help]
        details: Option<String>,
    },

    #[error("failed to parse {}: {message}", path.display())]
    #[diagnostic(code(happys::file::parse_error))]
    ParseError { path: PathBuf, message: String },
}

fn format_pids(pids: &[u32]) -> String {
    if pids.is_empty() {
        return "unknown".to_string();
    }
    pids.iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
