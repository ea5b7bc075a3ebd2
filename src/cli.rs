//! Command-line front end for the SNAP daemon.
//!
//! Each subcommand maps to one JSON-RPC method. Commands run either once from
//! the process arguments or, in script mode, line by line from stdin over a
//! single connection.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info};

use crate::rpc::{RpcClient, DEFAULT_SOCKET_PATH, DEFAULT_TIMEOUT_SECS};

/// Program name used when re-parsing script lines.
const BIN_NAME: &str = "snap_rpc";

/// Verbosity choices accepted by `-v`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "UPPER")]
pub enum Verbosity {
    Debug,
    Info,
    Error,
}

impl Verbosity {
    fn level(self) -> &'static str {
        match self {
            Verbosity::Debug => "debug",
            Verbosity::Info => "info",
            Verbosity::Error => "error",
        }
    }
}

/// Log filter used when `RUST_LOG` is not set.
pub fn default_log_directive(verbosity: Option<Verbosity>) -> String {
    format!("snap_rpc={}", verbosity.map_or("warn", Verbosity::level))
}

#[derive(Parser, Debug)]
#[command(name = BIN_NAME)]
#[command(about = "Mellanox SNAP JSON-RPC 2.0 command line interface", long_about = None)]
#[command(version)]
pub struct Cli {
    /// RPC domain socket path
    #[arg(short = 's', value_name = "SERVER_ADDR", env = "SNAP_RPC_SOCKET", default_value = DEFAULT_SOCKET_PATH)]
    pub server_addr: PathBuf,

    /// Timeout as a floating point number expressed in seconds waiting for response
    #[arg(short = 't', value_name = "TIMEOUT", default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub timeout: f64,

    /// Set verbosity level
    #[arg(short = 'v', value_enum, ignore_case = true)]
    pub verbosity: Option<Verbosity>,

    /// Mellanox SNAP JSON-RPC 2.0 Client methods
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Create new NVMe SNAP controller
    #[command(name = "controller_nvme_create")]
    ControllerNvmeCreate {
        /// PCI function to start emulation on
        pci_func: u32,
        /// JSON configuration file to use
        #[arg(short = 'c', long = "conf")]
        conf: Option<String>,
    },

    /// Destroy NVMe SNAP controller
    #[command(name = "controller_nvme_delete")]
    ControllerNvmeDelete {
        /// Controller Name
        name: String,
    },

    /// List all SNAP plugged emulation functions with their characteristics
    #[command(name = "emulation_list")]
    EmulationList,
}

impl Command {
    /// JSON-RPC method this command invokes.
    pub fn method(&self) -> &'static str {
        match self {
            Command::ControllerNvmeCreate { .. } => "controller_nvme_create",
            Command::ControllerNvmeDelete { .. } => "controller_nvme_delete",
            Command::EmulationList => "emulation_list",
        }
    }

    /// Request parameters, `None` for methods that take none.
    pub fn params(&self) -> Option<Value> {
        match self {
            Command::ControllerNvmeCreate { pci_func, conf } => {
                let mut params = json!({ "pci_func": pci_func });
                if let Some(conf) = conf {
                    params["conf_file"] = json!(conf);
                }
                Some(params)
            }
            Command::ControllerNvmeDelete { name } => Some(json!({ "name": name })),
            Command::EmulationList => None,
        }
    }

    /// Render a successful result the way the command prints it.
    pub fn format_result(&self, result: &Value) -> Result<Option<String>> {
        let text = match self {
            Command::ControllerNvmeDelete { .. } => return Ok(None),
            Command::ControllerNvmeCreate { .. } => {
                serde_json::to_string_pretty(result)?.trim_matches('"').to_string()
            }
            Command::EmulationList => serde_json::to_string_pretty(result)?,
        };
        Ok(Some(text))
    }

    /// Issue the command and return its printable output.
    pub async fn run(&self, client: &mut RpcClient) -> Result<Option<String>> {
        let params = self.params();
        let result = client.call(self.method(), params.as_ref()).await?;
        self.format_result(&result)
    }
}

/// Parse one script line into a command.
///
/// The line is split like a shell would split it and parsed with the same
/// grammar as the process arguments. Global options on the line are
/// accepted but have no effect: the connection is already open.
pub fn parse_script_line(line: &str) -> Result<Command> {
    let words = shlex::split(line).with_context(|| format!("Unbalanced quoting in: {}", line))?;
    let cli = Cli::try_parse_from(std::iter::once(BIN_NAME.to_string()).chain(words))?;
    cli.command
        .with_context(|| format!("No command given in: {}", line))
}

/// A script line failed; no further lines were run.
#[derive(Debug, Error)]
#[error("Exception:\n{executed} <<<\n{message}")]
pub struct ScriptError {
    /// Every non-blank line run so far, the failing one last.
    pub executed: String,
    pub message: String,
}

impl ScriptError {
    fn new(executed: &[String], message: String) -> Self {
        Self {
            executed: executed.join("\n").trim().to_string(),
            message,
        }
    }
}

/// Run newline-delimited commands from `input` over one client, writing
/// each command's output to `out`. Blank lines are skipped.
///
/// Stops at the first failing line.
pub async fn execute_script<R, W>(client: &mut RpcClient, input: R, out: &mut W) -> Result<usize, ScriptError>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    let mut lines = input.lines();
    let mut executed: Vec<String> = Vec::new();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                return Err(ScriptError::new(
                    &executed,
                    format!("Failed to read script input: {}", e),
                ))
            }
        };

        let line = line.trim_end();
        if line.trim().is_empty() {
            continue;
        }
        executed.push(line.to_string());
        debug!(line, "Executing script line");

        let outcome = match parse_script_line(line) {
            Ok(command) => command.run(client).await,
            Err(e) => Err(e),
        };
        let printed = outcome.and_then(|output| {
            if let Some(text) = output {
                writeln!(out, "{}", text)?;
            }
            Ok(())
        });

        if let Err(e) = printed {
            return Err(ScriptError::new(&executed, e.to_string()));
        }
    }

    info!(commands = executed.len(), "Script finished");
    Ok(executed.len())
}
