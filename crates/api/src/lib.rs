//! HTTP API, triggers and the `fibernet` command line.

pub mod app;
pub mod cli;
pub mod context;
pub mod middleware;
pub mod scheduler;
