//! CLI subcommands

pub mod bus;
pub mod deploy;
