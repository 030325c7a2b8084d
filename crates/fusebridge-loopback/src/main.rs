// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

mod workload;

use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use fusebridge_core::BridgeConfig;
use fusebridge_logging::CliLoggingArgs;

use crate::workload::{run_workload, WorkloadOptions};

fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.logging.init("fusebridge-loopback")?;

    match cli.command {
        Command::Run(args) => {
            let config = load_config(args.config.clone())?;
            let report = run_workload(config, args.options())?;
            if let Some(path) = &args.json_output {
                let file = File::create(path)
                    .with_context(|| format!("failed to create {}", path.display()))?;
                serde_json::to_writer_pretty(file, &report)?;
            }
            write_json_to_stdout(&report)?;
        }
        Command::CheckConfig(args) => {
            let config = load_config(Some(args.path))?;
            write_json_to_stdout(&config)?;
        }
    }
    Ok(())
}

/// Read the JSON config (defaults without a path) and apply environment
/// overrides on top.
fn load_config(path: Option<PathBuf>) -> Result<BridgeConfig> {
    let mut config = BridgeConfig::load(path.as_deref()).with_context(|| match &path {
        Some(path) => format!("failed to load config {}", path.display()),
        None => "invalid default config".to_string(),
    })?;
    config
        .apply_env_overrides()
        .context("invalid FUSEBRIDGE_* override")?;
    Ok(config)
}

fn write_json_to_stdout<T: serde::Serialize>(value: &T) -> Result<()> {
    let mut out = io::stdout().lock();
    writeln!(out, "{}", serde_json::to_string_pretty(value)?)?;
    out.flush()?;
    Ok(())
}

#[derive(Parser)]
#[command(author, version, about = "Exercise a fusebridge connection against a loopback daemon")]
struct Cli {
    #[command(flatten)]
    logging: CliLoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Mount, handshake, run a request workload, and unmount
    Run(RunArgs),
    /// Validate a config file and print the effective settings
    CheckConfig(CheckConfigArgs),
}

#[derive(Args, Clone)]
struct RunArgs {
    /// Number of filesystem threads issuing requests
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Requests issued by each thread
    #[arg(long, default_value_t = 1000)]
    requests: usize,

    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Cancel every Kth request while it waits
    #[arg(long)]
    interrupt_every: Option<usize>,

    /// Kill the connection after K completed requests
    #[arg(long)]
    kill_after: Option<usize>,

    /// Optional path for writing the JSON report
    #[arg(long)]
    json_output: Option<PathBuf>,
}

impl RunArgs {
    fn options(&self) -> WorkloadOptions {
        WorkloadOptions {
            threads: self.threads.max(1),
            requests_per_thread: self.requests,
            interrupt_every: self.interrupt_every.filter(|k| *k > 0),
            kill_after: self.kill_after,
        }
    }
}

#[derive(Args)]
struct CheckConfigArgs {
    path: PathBuf,
}
