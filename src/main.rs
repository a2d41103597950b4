mod cgroup;
mod cli;
mod config;
mod container;
mod error;
mod filesystem;
mod namespace;
mod network;
mod output;
mod process;
mod registry;
mod rootfs;

use anyhow::{Context, Result};
use log::{debug, error};

use cli::{CliCommand, parse_args};
use container::ContainerEngine;

fn main() {
    let cli = parse_args();
    let mut logger = env_logger::Builder::new();
    logger
        .format_timestamp_micros()
        .format_module_path(false)
        .filter_level(if cli.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        });
    if let Ok(filters) = std::env::var("RUST_LOG") {
        logger.parse_filters(&filters);
    }
    logger.init();

    if let CliCommand::Child { command } = &cli.command {
        // Only returns when the container could not be entered.
        let Err(e) = container::child_entry(command);
        error!("Container init failed: {e}");
        std::process::exit(1);
    }

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{e:#}");
            std::process::exit(1)
        }
    }
}

fn run(cli: cli::Cli) -> Result<i32> {
    debug!("Configuration: {:?}", cli.config);
    let mut engine = ContainerEngine::new(cli.config);
    match cli.command {
        CliCommand::Run(options) => {
            let outcome = engine
                .create_and_run(options)
                .context("failed to run container")?;
            println!("Container {} exited with code {}", outcome.id, outcome.exit_code);
            Ok(outcome.exit_code)
        }
        CliCommand::Start { id } => {
            let outcome = engine
                .start(&id)
                .with_context(|| format!("failed to start container {id}"))?;
            println!("Container {} exited with code {}", outcome.id, outcome.exit_code);
            Ok(outcome.exit_code)
        }
        CliCommand::Stop { id } => {
            engine
                .stop(&id)
                .with_context(|| format!("failed to stop container {id}"))?;
            println!("Container {id} stopped");
            Ok(0)
        }
        CliCommand::Remove { id } => {
            engine
                .remove(&id)
                .with_context(|| format!("failed to remove container {id}"))?;
            println!("Container {id} removed");
            Ok(0)
        }
        CliCommand::Inspect { id } => {
            let report = engine
                .inspect(&id)
                .with_context(|| format!("failed to inspect container {id}"))?;
            print!("{}", output::format_inspect(&report));
            Ok(0)
        }
        CliCommand::Ps => {
            let containers = engine.list().context("failed to list containers")?;
            print!("{}", output::format_ps(&containers));
            Ok(0)
        }
        CliCommand::Child { .. } => Ok(1),
    }
}
