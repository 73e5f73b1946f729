//! Read-only status API, plus manual stop and refresh.

pub mod api;
mod server;

pub use server::{run_server, AppState};
