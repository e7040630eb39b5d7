//! Command-line interface for bench-forge.
//!
//! Provides the workflow `run` command plus dataset `merge`, `validate` and
//! `status` commands.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands};
