//! SNAP RPC Library
//!
//! Client side of the SNAP daemon's JSON-RPC 2.0 control interface:
//!
//! - `rpc` - socket transport, response framing and error taxonomy
//! - `protocol` - JSON-RPC request/response wire types
//! - `cli` - command-line model, subcommand handlers and script mode
//!
//! ```ignore
//! use snap_rpc::rpc::{RpcClient, DEFAULT_SOCKET_PATH};
//! use serde_json::json;
//!
//! let mut client = RpcClient::connect(DEFAULT_SOCKET_PATH, 60.0).await?;
//! let name = client
//!     .call("controller_nvme_create", Some(&json!({"pci_func": 0})))
//!     .await?;
//! ```

pub mod cli;
pub mod protocol;
pub mod rpc;
