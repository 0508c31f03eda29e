//! Command-line front end for the failed-event retry layer.
//!
//! `run` keeps the sweep timer alive until Ctrl-C; the remaining
//! subcommands are one-shot operator actions against the Postgres store.

pub mod cli;
pub mod commands;

pub use cli::{AdminCommand, Cli, Command, ListArgs, RedisArgs};
pub use commands::execute;
