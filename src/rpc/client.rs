//! JSON-RPC 2.0 client for the SNAP daemon.
//!
//! This module provides `RpcClient`, which owns one Unix domain socket
//! connection to the daemon, sends requests with increasing ids and decodes
//! responses from the unframed byte stream under a per-call timeout budget.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace, warn};

use crate::protocol::{is_notification, JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use crate::rpc::framing::{write_message, FrameError, JsonStreamDecoder};

/// Socket the SNAP daemon listens on unless told otherwise.
pub const DEFAULT_SOCKET_PATH: &str = "/var/tmp/spdk.sock";

/// Default response timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: f64 = 60.0;

/// Bytes requested from the socket per read.
pub const READ_CHUNK_SIZE: usize = 4096;

/// Upper bound on the timeout so a deadline can always be represented.
const MAX_TIMEOUT_SECS: f64 = u32::MAX as f64;

/// RPC client error types.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Timeout was not a finite, positive number of seconds.
    #[error("Invalid timeout {0}: expected a positive number of seconds")]
    InvalidTimeout(f64),

    /// The socket path is missing or the connect call failed.
    #[error("Error while connecting to {}\nError details: {source}", .path.display())]
    ConnectionFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// No complete response arrived within the timeout budget.
    #[error("Response Timeout after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    /// The daemon closed the stream before a complete response arrived.
    #[error("Connection closed by server")]
    ConnectionClosed,

    /// The daemon answered with an `error` member.
    #[error("{}", render_server_error(.method, .id, .params.as_ref(), .error))]
    ServerError {
        /// Method of the failed request
        method: String,
        /// Id assigned to the failed request
        id: u64,
        /// Parameters as they were sent
        params: Option<Value>,
        /// `error` member as returned by the daemon, whatever its shape
        error: Value,
    },

    /// Undecodable or structurally invalid traffic.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// I/O error during communication.
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),
}

impl RpcError {
    /// The daemon's error as a standard `{code, message, data}` object.
    ///
    /// `None` for other variants and for error payloads of any other shape.
    pub fn rpc_error(&self) -> Option<JsonRpcError> {
        match self {
            RpcError::ServerError { error, .. } => JsonRpcError::from_value(error),
            _ => None,
        }
    }
}

impl From<io::Error> for RpcError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::UnexpectedEof => RpcError::ConnectionClosed,
            _ => RpcError::Io(err),
        }
    }
}

impl From<FrameError> for RpcError {
    fn from(err: FrameError) -> Self {
        RpcError::Protocol(err.to_string())
    }
}

/// Diagnostic text for a JSON-RPC error response: the request echoed with
/// its method and id, followed by the daemon's error payload.
fn render_server_error(method: &str, id: &u64, params: Option<&Value>, error: &Value) -> String {
    let mut request = match params {
        Some(Value::Object(map)) => map.clone(),
        Some(other) => {
            let mut map = serde_json::Map::new();
            map.insert("params".to_string(), other.clone());
            map
        }
        None => serde_json::Map::new(),
    };
    request.insert("method".to_string(), Value::from(method));
    request.insert("req_id".to_string(), Value::from(*id));

    let request = serde_json::to_string_pretty(&request).unwrap_or_default();
    let response = serde_json::to_string_pretty(error).unwrap_or_default();
    [
        "request:",
        &request,
        "Got JSON-RPC error response",
        "response:",
        &response,
    ]
    .join("\n")
}

/// Validate a timeout given in (possibly fractional) seconds.
pub fn timeout_from_secs(secs: f64) -> Result<Duration, RpcError> {
    if !secs.is_finite() || secs <= 0.0 || secs > MAX_TIMEOUT_SECS {
        return Err(RpcError::InvalidTimeout(secs));
    }
    Duration::try_from_secs_f64(secs).map_err(|_| RpcError::InvalidTimeout(secs))
}

/// Lifecycle of the client's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    /// The daemon hung up or the stream became undecodable. Terminal.
    Closed,
}

/// The request currently awaiting its response.
#[derive(Debug)]
struct PendingRequest {
    id: u64,
    method: String,
    params: Option<Value>,
}

/// JSON-RPC client bound to one SNAP daemon socket.
///
/// Exactly one request is in flight at a time: every operation takes
/// `&mut self`, and `call` returns only once its response is decoded, the
/// timeout budget runs out, or the daemon closes the connection. The socket
/// is closed when the client is dropped.
///
/// # Example
///
/// ```ignore
/// use snap_rpc::rpc::RpcClient;
/// use serde_json::json;
///
/// let mut client = RpcClient::connect("/var/tmp/spdk.sock", 60.0).await?;
/// let name = client
///     .call("controller_nvme_create", Some(&json!({"pci_func": 5})))
///     .await?;
/// ```
#[derive(Debug)]
pub struct RpcClient {
    stream: UnixStream,
    socket_path: PathBuf,
    /// Bytes received but not yet consumed as a response.
    decoder: JsonStreamDecoder,
    /// Id of the most recently sent request.
    request_id: u64,
    timeout: Duration,
    pending: Option<PendingRequest>,
    state: ConnectionState,
}

impl RpcClient {
    /// Connect to the daemon socket at `socket_path`.
    ///
    /// # Errors
    ///
    /// - `RpcError::InvalidTimeout` if `timeout_secs` is not positive and finite
    /// - `RpcError::ConnectionFailed` if the socket file does not exist, or
    ///   the connection is refused or denied
    pub async fn connect(socket_path: impl AsRef<Path>, timeout_secs: f64) -> Result<Self, RpcError> {
        let timeout = timeout_from_secs(timeout_secs)?;
        let path = socket_path.as_ref();

        if !path.exists() {
            return Err(RpcError::ConnectionFailed {
                path: path.to_path_buf(),
                source: io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("Unix socket '{}' does not exist", path.display()),
                ),
            });
        }

        let stream = UnixStream::connect(path)
            .await
            .map_err(|source| RpcError::ConnectionFailed {
                path: path.to_path_buf(),
                source,
            })?;

        debug!(path = %path.display(), timeout_secs, "Connected to SNAP daemon");
        Ok(Self::from_stream(stream, path, timeout))
    }

    /// Wrap an already connected stream.
    pub(crate) fn from_stream(stream: UnixStream, socket_path: &Path, timeout: Duration) -> Self {
        Self {
            stream,
            socket_path: socket_path.to_path_buf(),
            decoder: JsonStreamDecoder::new(),
            request_id: 0,
            timeout,
            pending: None,
            state: ConnectionState::Connected,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Send a request and return its result.
    ///
    /// Responses tagged with another request's id, and notifications pushed
    /// by the daemon, are skipped while waiting. A response with a `null`
    /// id is taken as the answer, since servers use it when they could not
    /// read the request.
    ///
    /// # Errors
    ///
    /// - `RpcError::ServerError` if the daemon returns an error object
    /// - `RpcError::Timeout` if no matching response arrives within the timeout
    /// - `RpcError::ConnectionClosed` if the daemon hangs up first
    /// - `RpcError::Protocol` if the stream carries invalid JSON or a
    ///   response with neither `result` nor `error`
    pub async fn call(&mut self, method: &str, params: Option<&Value>) -> Result<Value, RpcError> {
        let id = self.send(method, params).await?;
        self.complete(id).await
    }

    /// Send a request without waiting for its response.
    ///
    /// `params` is copied, so the caller may reuse or mutate it afterwards
    /// without affecting what was sent or what an error report shows.
    pub async fn send(&mut self, method: &str, params: Option<&Value>) -> Result<u64, RpcError> {
        self.ensure_open()?;

        if let Some(previous) = &self.pending {
            warn!(
                id = previous.id,
                method = %previous.method,
                "Sending a new request before the previous one was answered"
            );
        }

        self.request_id += 1;
        let id = self.request_id;
        let request = JsonRpcRequest::new(method, params.cloned(), id);

        let body = serde_json::to_vec(&request)
            .map_err(|e| RpcError::Protocol(format!("Failed to serialize request: {}", e)))?;

        debug!(method, id, bytes = body.len(), "Sending request");
        trace!(request = %String::from_utf8_lossy(&body), "Request payload");

        self.pending = Some(PendingRequest {
            id,
            method: request.method,
            params: request.params,
        });

        if let Err(e) = write_message(&mut self.stream, &body).await {
            return Err(self.fail(e.into()));
        }
        Ok(id)
    }

    /// Receive the next complete JSON value from the daemon.
    ///
    /// The timeout budget covers the whole receive: each read waits only for
    /// what is left of it. Bytes following the value stay buffered for the
    /// next receive.
    pub async fn recv(&mut self) -> Result<Value, RpcError> {
        let deadline = self.deadline();
        let value = self.recv_until(deadline).await?;
        self.pending = None;
        Ok(value)
    }

    /// Wait for the response to request `id` and turn it into a result.
    async fn complete(&mut self, id: u64) -> Result<Value, RpcError> {
        let deadline = self.deadline();
        let response = self.recv_response(id, deadline).await;
        let pending = self.pending.take();
        let response = response?;

        let (method, params) = match pending {
            Some(p) if p.id == id => (p.method, p.params),
            _ => (String::new(), None),
        };
        self.process_response(response, method, id, params)
    }

    async fn recv_response(&mut self, id: u64, deadline: Instant) -> Result<JsonRpcResponse, RpcError> {
        loop {
            let value = self.recv_until(deadline).await?;

            if is_notification(&value) {
                debug!(method = ?value.get("method"), "Skipping server notification");
                continue;
            }

            let response: JsonRpcResponse = serde_json::from_value(value)
                .map_err(|e| RpcError::Protocol(format!("Failed to parse response: {}", e)))?;

            match response.id {
                Some(got) if got != id => {
                    warn!(expected = id, got, "Discarding response to a different request");
                }
                _ => {
                    debug!(id, "Received response");
                    return Ok(response);
                }
            }
        }
    }

    async fn recv_until(&mut self, deadline: Instant) -> Result<Value, RpcError> {
        self.ensure_open()?;
        let mut chunk = [0u8; READ_CHUNK_SIZE];

        loop {
            match self.decoder.next_value() {
                Ok(Some(value)) => {
                    trace!(response = %value, "Decoded value");
                    return Ok(value);
                }
                Ok(None) => {}
                Err(e) => return Err(self.fail(e.into())),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(RpcError::Timeout(self.timeout));
            }
            trace!(
                remaining_ms = (deadline - now).as_millis() as u64,
                buffered = self.decoder.buffered(),
                "Waiting for response data"
            );

            let n = match timeout_at(deadline, self.stream.read(&mut chunk)).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(self.fail(e.into())),
                Err(_) => return Err(RpcError::Timeout(self.timeout)),
            };

            if n == 0 {
                debug!(buffered = self.decoder.buffered(), "Daemon closed the connection");
                return Err(self.fail(RpcError::ConnectionClosed));
            }
            self.decoder.extend(&chunk[..n]);
        }
    }

    /// Process a JSON-RPC response, extracting result or error.
    fn process_response(
        &self,
        response: JsonRpcResponse,
        method: String,
        id: u64,
        params: Option<Value>,
    ) -> Result<Value, RpcError> {
        if let Some(error) = response.error {
            return Err(RpcError::ServerError {
                method,
                id,
                params,
                error,
            });
        }

        response
            .result
            .ok_or_else(|| RpcError::Protocol("Response missing both result and error".to_string()))
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.timeout
    }

    fn ensure_open(&self) -> Result<(), RpcError> {
        match self.state {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Closed => Err(RpcError::ConnectionClosed),
        }
    }

    /// Record a failure that leaves the stream unusable.
    fn fail(&mut self, err: RpcError) -> RpcError {
        if matches!(err, RpcError::ConnectionClosed | RpcError::Protocol(_)) {
            self.state = ConnectionState::Closed;
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::io::AsyncWriteExt;
    use tokio::task::JoinHandle;

    /// Test timeout to prevent hanging tests.
    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    /// Client over one end of a socket pair; the other end plays the daemon.
    fn client_pair(timeout: Duration) -> (RpcClient, UnixStream) {
        let (client, daemon) = UnixStream::pair().expect("Failed to create socket pair");
        (RpcClient::from_stream(client, Path::new("/test.sock"), timeout), daemon)
    }

    /// Read exactly one request from the daemon side.
    async fn read_request(daemon: &mut UnixStream) -> JsonRpcRequest {
        let mut decoder = JsonStreamDecoder::new();
        let mut chunk = [0u8; 256];
        loop {
            if let Some(value) = decoder.next_value().expect("client sent invalid JSON") {
                return serde_json::from_value(value).expect("not a request");
            }
            let n = daemon.read(&mut chunk).await.expect("daemon read failed");
            assert!(n > 0, "client closed before sending a request");
            decoder.extend(&chunk[..n]);
        }
    }

    /// Daemon that answers every request with the given raw chunks.
    fn scripted_daemon(mut daemon: UnixStream, replies: Vec<Vec<&'static str>>) -> JoinHandle<Vec<JsonRpcRequest>> {
        tokio::spawn(async move {
            let mut seen = Vec::new();
            for chunks in replies {
                seen.push(read_request(&mut daemon).await);
                for chunk in chunks {
                    daemon.write_all(chunk.as_bytes()).await.unwrap();
                    daemon.flush().await.unwrap();
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            }
            seen
        })
    }

    #[test]
    fn test_rpc_error_display() {
        let timeout_err = RpcError::Timeout(Duration::from_millis(1500));
        assert_eq!(timeout_err.to_string(), "Response Timeout after 1.5s");

        let closed = RpcError::ConnectionClosed;
        assert_eq!(closed.to_string(), "Connection closed by server");

        let protocol_err = RpcError::Protocol("Invalid JSON".to_string());
        assert_eq!(protocol_err.to_string(), "Protocol error: Invalid JSON");

        let conn_err = RpcError::ConnectionFailed {
            path: PathBuf::from("/var/tmp/spdk.sock"),
            source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        };
        assert_eq!(
            conn_err.to_string(),
            "Error while connecting to /var/tmp/spdk.sock\nError details: refused"
        );
    }

    #[test]
    fn test_rpc_error_from_io() {
        for kind in [
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::UnexpectedEof,
        ] {
            let err: RpcError = io::Error::new(kind, "gone").into();
            assert!(matches!(err, RpcError::ConnectionClosed), "{:?}", kind);
        }

        let other: RpcError = io::Error::new(io::ErrorKind::Other, "other").into();
        assert!(matches!(other, RpcError::Io(_)));
    }

    #[test]
    fn test_server_error_diagnostic() {
        let err = RpcError::ServerError {
            method: "controller_nvme_delete".to_string(),
            id: 3,
            params: Some(json!({"name": "NvmeEmu0"})),
            error: json!({
                "code": -32602,
                "message": "Invalid parameters",
                "data": {"reason": "no such controller"}
            }),
        };
        let text = err.to_string();

        assert!(text.starts_with("request:\n{"), "{}", text);
        assert!(text.contains("\"method\": \"controller_nvme_delete\""));
        assert!(text.contains("\"req_id\": 3"));
        assert!(text.contains("\"name\": \"NvmeEmu0\""));
        assert!(text.contains("Got JSON-RPC error response\nresponse:\n"));
        assert!(text.contains("\"code\": -32602"));
        assert!(text.contains("no such controller"));

        let rpc_error = err.rpc_error().expect("standard error object");
        assert_eq!(rpc_error.code, -32602);
        assert_eq!(rpc_error.message, "Invalid parameters");
        assert!(RpcError::ConnectionClosed.rpc_error().is_none());
    }

    #[test]
    fn test_timeout_from_secs() {
        assert_eq!(timeout_from_secs(0.25).unwrap(), Duration::from_millis(250));
        assert_eq!(timeout_from_secs(60.0).unwrap(), Duration::from_secs(60));

        for bad in [0.0, -1.0, f64::NAN, f64::INFINITY, 1e30] {
            assert!(
                matches!(timeout_from_secs(bad), Err(RpcError::InvalidTimeout(_))),
                "{} should be rejected",
                bad
            );
        }
    }

    #[tokio::test]
    async fn test_call_returns_result() {
        let (mut client, daemon) = client_pair(TEST_TIMEOUT);
        let server = scripted_daemon(daemon, vec![vec![r#"{"id":1,"result":"NvmeEmu0"}"#]]);

        let result = client
            .call("controller_nvme_create", Some(&json!({"pci_func": 5})))
            .await
            .expect("call failed");
        assert_eq!(result, json!("NvmeEmu0"));

        let seen = server.await.unwrap();
        assert_eq!(seen[0].method, "controller_nvme_create");
        assert_eq!(seen[0].id, 1);
        assert_eq!(seen[0].params, Some(json!({"pci_func": 5})));
    }

    #[tokio::test]
    async fn test_call_reassembles_split_response() {
        let (mut client, daemon) = client_pair(TEST_TIMEOUT);
        let server = scripted_daemon(daemon, vec![vec![r#"{"id":1,"resu"#, r#"lt":"ok"}"#]]);

        let result = client.call("emulation_list", None).await.expect("call failed");
        assert_eq!(result, json!("ok"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_call_ids_increase() {
        let (mut client, daemon) = client_pair(TEST_TIMEOUT);
        let server = scripted_daemon(
            daemon,
            vec![
                vec![r#"{"id":1,"result":1}"#],
                vec![r#"{"id":2,"result":2}"#],
                vec![r#"{"id":3,"result":3}"#],
            ],
        );

        for expected in 1..=3 {
            let result = client.call("emulation_list", None).await.unwrap();
            assert_eq!(result, json!(expected));
        }

        let ids: Vec<u64> = server.await.unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_call_skips_mismatched_id_and_notifications() {
        let (mut client, daemon) = client_pair(TEST_TIMEOUT);
        let server = scripted_daemon(
            daemon,
            vec![vec![
                r#"{"id":41,"result":"stale"}"#,
                r#"{"jsonrpc":"2.0","method":"hotplug","params":{}}"#,
                r#"{"id":1,"result":"fresh"}"#,
            ]],
        );

        let result = client.call("emulation_list", None).await.unwrap();
        assert_eq!(result, json!("fresh"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_call_keeps_trailing_response_for_next_call() {
        let (mut client, daemon) = client_pair(TEST_TIMEOUT);
        let server = scripted_daemon(
            daemon,
            vec![
                vec![r#"{"id":1,"result":"first"} {"id":2,"result":"second"}"#],
                vec![],
            ],
        );

        assert_eq!(client.call("emulation_list", None).await.unwrap(), json!("first"));
        assert_eq!(client.call("emulation_list", None).await.unwrap(), json!("second"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_call_null_result() {
        let (mut client, daemon) = client_pair(TEST_TIMEOUT);
        let server = scripted_daemon(daemon, vec![vec![r#"{"id":1,"result":null}"#]]);

        let result = client
            .call("controller_nvme_delete", Some(&json!({"name": "NvmeEmu0"})))
            .await
            .unwrap();
        assert_eq!(result, Value::Null);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_call_server_error() {
        let (mut client, daemon) = client_pair(TEST_TIMEOUT);
        let server = scripted_daemon(
            daemon,
            vec![
                vec![r#"{"id":1,"result":true}"#],
                vec![r#"{"id":2,"error":{"code":-32601,"message":"Method not found"}}"#],
            ],
        );

        client.call("emulation_list", None).await.unwrap();
        let err = client
            .call("controller_nvme_resize", Some(&json!({"name": "NvmeEmu0"})))
            .await
            .unwrap_err();

        let text = err.to_string();
        assert!(text.contains("Method not found"), "{}", text);
        assert!(text.contains("controller_nvme_resize"), "{}", text);
        assert_eq!(err.rpc_error().map(|e| e.code), Some(-32601));
        match err {
            RpcError::ServerError { method, id, error, .. } => {
                assert_eq!(method, "controller_nvme_resize");
                assert_eq!(id, 2);
                assert_eq!(error, json!({"code": -32601, "message": "Method not found"}));
            }
            other => panic!("Expected ServerError, got {:?}", other),
        }

        assert_eq!(client.state(), ConnectionState::Connected);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_nonstandard_error_payloads_are_server_errors() {
        let payloads = [
            (r#"{"id":1,"error":"controller busy"}"#, "controller busy"),
            (r#"{"id":2,"error":{"code":-1}}"#, "\"code\": -1"),
            (r#"{"id":3,"error":{"code":"E42","message":"bad"}}"#, "\"E42\""),
        ];
        let (mut client, daemon) = client_pair(TEST_TIMEOUT);
        let server = scripted_daemon(daemon, payloads.iter().map(|(reply, _)| vec![*reply]).collect());

        for (_, expected) in payloads {
            let err = client
                .call("controller_nvme_delete", Some(&json!({"name": "NvmeEmu0"})))
                .await
                .unwrap_err();
            assert!(matches!(err, RpcError::ServerError { .. }), "{:?}", err);
            assert!(err.rpc_error().is_none());

            let text = err.to_string();
            assert!(text.contains("\"method\": \"controller_nvme_delete\""), "{}", text);
            assert!(text.contains("\"name\": \"NvmeEmu0\""), "{}", text);
            assert!(text.contains(expected), "{}", text);
        }

        assert_eq!(client.state(), ConnectionState::Connected);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_null_id_error_is_accepted() {
        let (mut client, daemon) = client_pair(TEST_TIMEOUT);
        let server = scripted_daemon(
            daemon,
            vec![vec![r#"{"id":null,"error":{"code":-32700,"message":"Parse error"}}"#]],
        );

        let err = client.call("emulation_list", None).await.unwrap_err();
        assert!(matches!(err, RpcError::ServerError { id: 1, .. }), "{:?}", err);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_error_report_uses_params_as_sent() {
        let (mut client, daemon) = client_pair(TEST_TIMEOUT);
        let server = scripted_daemon(
            daemon,
            vec![vec![r#"{"id":1,"error":{"code":-1,"message":"busy"}}"#]],
        );

        let mut params = json!({"pci_func": 5});
        let id = client
            .send("controller_nvme_create", Some(&params))
            .await
            .unwrap();
        params["pci_func"] = json!(9);

        let err = client.complete(id).await.unwrap_err();
        match err {
            RpcError::ServerError { params, .. } => {
                assert_eq!(params, Some(json!({"pci_func": 5})));
            }
            other => panic!("Expected ServerError, got {:?}", other),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_response_without_result_or_error() {
        let (mut client, daemon) = client_pair(TEST_TIMEOUT);
        let server = scripted_daemon(daemon, vec![vec![r#"{"id":1}"#]]);

        let err = client.call("emulation_list", None).await.unwrap_err();
        assert!(
            err.to_string().contains("missing both result and error"),
            "{}",
            err
        );
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_response_closes_client() {
        let (mut client, daemon) = client_pair(TEST_TIMEOUT);
        let server = scripted_daemon(daemon, vec![vec!["{\"id\":1,]"]]);

        let err = client.call("emulation_list", None).await.unwrap_err();
        assert!(matches!(err, RpcError::Protocol(_)), "{:?}", err);
        assert_eq!(client.state(), ConnectionState::Closed);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_close_is_not_a_timeout() {
        let (mut client, daemon) = client_pair(TEST_TIMEOUT);
        let server = tokio::spawn(async move {
            let mut daemon = daemon;
            read_request(&mut daemon).await;
            daemon.write_all(br#"{"id":1,"res"#).await.unwrap();
            // Dropping the stream closes it mid-response.
        });

        let started = std::time::Instant::now();
        let err = client.call("emulation_list", None).await.unwrap_err();
        assert!(matches!(err, RpcError::ConnectionClosed), "{:?}", err);
        assert!(started.elapsed() < TEST_TIMEOUT);
        assert_eq!(client.state(), ConnectionState::Closed);

        let again = client.call("emulation_list", None).await.unwrap_err();
        assert!(matches!(again, RpcError::ConnectionClosed));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_budget_spans_partial_reads() {
        let budget = Duration::from_millis(300);
        let (mut client, daemon) = client_pair(budget);
        let server = tokio::spawn(async move {
            let mut daemon = daemon;
            read_request(&mut daemon).await;
            // Trickle an incomplete response, never finishing it.
            for piece in [r#"{"id""#, ":1,", r#""result""#, ":"] {
                daemon.write_all(piece.as_bytes()).await.unwrap();
                tokio::time::sleep(Duration::from_millis(60)).await;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
            daemon
        });

        let started = std::time::Instant::now();
        let err = client.call("emulation_list", None).await.unwrap_err();
        let elapsed = started.elapsed();

        assert_eq!(client.timeout(), budget);
        assert!(matches!(err, RpcError::Timeout(d) if d == budget), "{:?}", err);
        assert!(elapsed >= budget, "timed out early: {:?}", elapsed);
        assert!(elapsed < budget + Duration::from_millis(500), "timed out late: {:?}", elapsed);
        assert_eq!(client.state(), ConnectionState::Connected);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_recv_returns_first_value() {
        let (mut client, mut daemon) = client_pair(TEST_TIMEOUT);
        daemon
            .write_all(br#"{"id":7,"result":{"emulations":[]}}"#)
            .await
            .unwrap();

        let value = client.recv().await.unwrap();
        assert_eq!(value, json!({"id": 7, "result": {"emulations": []}}));
    }
}
