//! Rallytime server library: configuration and the HTTP surface.
//!
//! The binary in `main.rs` wires these to the command line.

pub mod config;
pub mod server;

pub use config::RallytimeConfig;
pub use server::{router, serve, AppState};
