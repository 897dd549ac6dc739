//! Command-line interface for resque-pool.
//!
//! Provides the `run` command that hosts the worker pool, plus `enqueue`,
//! `stats` and `failures` for working with the queue store directly.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands, RunArgs};
