pub mod config;
pub mod init;
pub mod plan;
pub mod validate;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "volley")]
#[command(about = "Staged virtual-user load testing with live thresholds", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Log filter (error, warn, info, debug, trace). RUST_LOG takes precedence.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the load test described by a configuration file
    Run {
        /// Path to the configuration file (YAML/JSON) with stages, thresholds and plan
        config: PathBuf,
        /// Print the final report as JSON on stdout instead of the summary
        #[arg(long)]
        json: bool,
        /// Export the final report to a JSON file
        #[arg(long)]
        export_json: Option<PathBuf>,
        /// Output configuration (e.g., --out csv=results.csv)
        #[arg(long)]
        out: Option<String>,
        /// Stop the run after this long (overrides the config file)
        #[arg(long)]
        timeout: Option<String>,
        /// Drain grace period at shutdown (overrides the config file)
        #[arg(long)]
        graceful_stop: Option<String>,
        /// Read control commands (status, stop) from stdin
        #[arg(long, short = 'i')]
        interactive: bool,
    },
    /// Write a starter configuration
    Init {
        /// Output file path (default: volley.yaml)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate a configuration without running it
    Validate {
        config: PathBuf,
    },
    /// Print the JSON schema of the configuration file
    Schema {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Generate shell completions
    Completion {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Destination given to `--out`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    Csv(PathBuf),
}

pub fn parse_output(spec: &str) -> anyhow::Result<OutputTarget> {
    match spec.split_once('=') {
        Some(("csv", path)) if !path.is_empty() => Ok(OutputTarget::Csv(PathBuf::from(path))),
        _ => anyhow::bail!("unsupported output '{}'; expected csv=<path>", spec),
    }
}
