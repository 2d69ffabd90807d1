//! cake CLI library

#![cfg_attr(not(test), deny(missing_docs))]

pub mod commands;
pub mod error;

pub use error::{Error, Result};

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use cake_common::telemetry::{init_telemetry, TelemetryConfig, DEFAULT_FILTER};

/// cake - bootstrap a Kubernetes management cluster onto vSphere
#[derive(Parser, Debug)]
#[command(name = "cake")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Logging options shared by every subcommand
    #[command(flatten)]
    pub logging: LogArgs,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Commands,
}

/// Subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build a management cluster, remotely through vSphere or with --local
    Deploy(commands::deploy::DeployArgs),
    /// Run a standalone event bus broker
    Bus(commands::bus::BusArgs),
}

/// Console and file logging flags
#[derive(Args, Debug, Clone, Default)]
pub struct LogArgs {
    /// Log filter directive, e.g. `info,cake=debug`
    #[arg(long, global = true, env = "RUST_LOG")]
    pub log_level: Option<String>,

    /// Emit JSON log lines on the console
    #[arg(long, global = true)]
    pub json_logs: bool,
}

impl LogArgs {
    /// Install the global subscriber, also writing to `log_file` when set
    pub fn init(&self, log_file: Option<PathBuf>) -> Result<()> {
        init_telemetry(TelemetryConfig {
            json: self.json_logs,
            log_file,
            truncate_log_file: true,
            default_filter: self
                .log_level
                .clone()
                .unwrap_or_else(|| DEFAULT_FILTER.to_string()),
        })?;
        Ok(())
    }
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Deploy(args) => commands::deploy::run(args, &self.logging).await,
            Commands::Bus(args) => commands::bus::run(args, &self.logging).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cake_common::config::EngineType;

    #[test]
    fn remote_engine_command_line_parses() {
        // The shape the provider launches on the bootstrap VM
        let cli = Cli::try_parse_from([
            "cake",
            "deploy",
            "--local",
            "--deployment-type",
            "rke",
            "--spec-file",
            "/root/.cake.yaml",
            "--progress",
        ])
        .unwrap();

        let Commands::Deploy(args) = cli.command else {
            panic!("expected deploy");
        };
        assert!(args.local);
        assert!(args.progress);
        assert_eq!(args.deployment_type, Some(EngineType::Rke));
        assert_eq!(args.spec_file, Some(PathBuf::from("/root/.cake.yaml")));
    }

    #[test]
    fn unknown_deployment_type_is_rejected() {
        let err = Cli::try_parse_from(["cake", "deploy", "--deployment-type", "kubeadm"])
            .unwrap_err();
        assert!(err.to_string().contains("must be 'capv' or 'rke'"));
    }

    #[test]
    fn logging_flags_are_global() {
        let cli = Cli::try_parse_from(["cake", "bus", "--listen", "127.0.0.1:0", "--json-logs"])
            .unwrap();
        assert!(cli.logging.json_logs);
        let Commands::Bus(args) = cli.command else {
            panic!("expected bus");
        };
        assert_eq!(args.listen, "127.0.0.1:0");
    }

    #[test]
    fn bus_requires_a_listen_address() {
        assert!(Cli::try_parse_from(["cake", "bus"]).is_err());
    }
}
