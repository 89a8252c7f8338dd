//! Electrum protocol server: newline-delimited JSON-RPC 2.0 over TCP,
//! dispatching into the sync engine's read API.

pub mod handlers;
pub mod server;

pub use server::{serve, serve_listener};

pub const PROTOCOL_VERSION: &str = "1.4";
pub const SERVER_NAME: &str = concat!("farod ", env!("CARGO_PKG_VERSION"));
