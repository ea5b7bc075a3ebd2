//! RPC transport to the SNAP daemon.
//!
//! The daemon listens on a Unix domain socket and speaks JSON-RPC 2.0 with
//! no framing beyond the JSON values themselves:
//!
//! ```text
//! ┌─────────────────┐         Unix Socket          ┌─────────────────────┐
//! │   snap_rpc      │  ◄──────────────────────────►│    SNAP daemon      │
//! │   (RpcClient)   │    JSON-RPC 2.0, unframed    │                     │
//! └─────────────────┘                              └─────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use snap_rpc::rpc::RpcClient;
//!
//! let mut client = RpcClient::connect("/var/tmp/spdk.sock", 60.0).await?;
//! let emulations = client.call("emulation_list", None).await?;
//! ```

mod client;
mod framing;

pub use client::{
    timeout_from_secs, ConnectionState, RpcClient, RpcError, DEFAULT_SOCKET_PATH,
    DEFAULT_TIMEOUT_SECS, READ_CHUNK_SIZE,
};
pub use framing::{write_message, FrameError, JsonStreamDecoder, MAX_MESSAGE_SIZE};
