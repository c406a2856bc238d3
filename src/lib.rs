// ABOUTME: Library root for fanout - exposes public types for testing.
// ABOUTME: The main binary is in main.rs.

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod multiplex;
pub mod negotiate;
pub mod output;
pub mod prompt;
pub mod shell;
pub mod stream;
pub mod target;
pub mod transport;
pub mod types;
