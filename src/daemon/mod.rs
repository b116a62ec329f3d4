//! The per-stack CLI daemon: on-disk state, credentials, and the start/stop
//! lifecycle.

pub mod auth;
pub mod controller;
pub mod state;
