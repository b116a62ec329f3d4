#[macro_use]
extern crate log;

pub mod cli;
pub mod daemon;
pub mod env;
pub mod env_file;
pub mod error;
pub mod exec;
pub mod logger;
pub mod ownership;
pub mod paths;
pub mod ports;
pub mod procs;
pub mod runtime_state;
pub mod settings;
pub mod stack;
pub mod stack_env;
pub mod step;
pub mod tail;
pub mod ui;

pub use miette::Result;
