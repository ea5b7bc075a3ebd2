//! SNAP RPC - command-line client for the SNAP NVMe emulation daemon.
//!
//! Runs one subcommand from the arguments, or a script of subcommands read
//! from a piped stdin, over a single JSON-RPC connection.

use std::io::{self, IsTerminal, Write};
use std::process::ExitCode;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use tokio::io::BufReader;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use snap_rpc::cli::{default_log_directive, execute_script, Cli};
use snap_rpc::rpc::RpcClient;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_log_directive(cli.verbosity)),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(io::stderr),
        )
        .init();

    tracing::debug!("Starting snap_rpc v{}", env!("CARGO_PKG_VERSION"));

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::debug!("Command failed: {:?}", e);
            println!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    // No command and nothing piped in: nothing to do.
    if cli.command.is_none() && io::stdin().is_terminal() {
        Cli::command().print_help()?;
        return Ok(ExitCode::FAILURE);
    }

    let mut client = RpcClient::connect(&cli.server_addr, cli.timeout).await?;

    match cli.command {
        Some(command) => {
            if let Some(output) = command.run(&mut client).await? {
                println!("{}", output);
            }
            Ok(ExitCode::SUCCESS)
        }
        None => {
            let stdin = BufReader::new(tokio::io::stdin());
            let mut stdout = io::stdout();
            let result = execute_script(&mut client, stdin, &mut stdout).await;
            stdout.flush()?;

            match result {
                Ok(count) => {
                    tracing::debug!(commands = count, "Script completed");
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    println!("{}", e);
                    Ok(ExitCode::FAILURE)
                }
            }
        }
    }
}
