//! Unix socket server for node programs

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use serde_json::Value;
use tokio::net::UnixListener;
use tokio::sync::watch;

use super::NodeHandler;
use crate::protocol::{
    CodecError, ReservedMethod, RpcError, RpcResponse, codes, decode_request, encode_response,
};
use crate::transport::{Connection, TransportError};

#[derive(Debug)]
struct ServerState {
    started: Instant,
    requests: AtomicU64,
    active: AtomicUsize,
    shutdown: watch::Sender<bool>,
}

/// Control and counters of a running [`NodeServer`]
#[derive(Debug, Clone)]
pub struct ServerHandle {
    state: Arc<ServerState>,
}

impl ServerHandle {
    /// Stop accepting connections; `serve` returns shortly after
    pub fn shutdown(&self) {
        self.state.shutdown.send_replace(true);
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.state.shutdown.borrow()
    }

    /// Connections currently open
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.state.active.load(Ordering::SeqCst)
    }

    /// Requests decoded since start
    #[must_use]
    pub fn requests_processed(&self) -> u64 {
        self.state.requests.load(Ordering::SeqCst)
    }
}

/// Decrements the active connection count when a connection task ends
struct ActiveGuard(Arc<ServerState>);

impl ActiveGuard {
    fn new(state: Arc<ServerState>) -> Self {
        state.active.fetch_add(1, Ordering::SeqCst);
        Self(state)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Serves one [`NodeHandler`] on a Unix domain socket
///
/// Each connection is handled on its own task; requests on a connection
/// are answered in order.
pub struct NodeServer<H> {
    handler: Arc<H>,
    socket_path: PathBuf,
    state: Arc<ServerState>,
}

impl<H: NodeHandler> NodeServer<H> {
    #[must_use]
    pub fn new(socket_path: impl Into<PathBuf>, handler: H) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            handler: Arc::new(handler),
            socket_path: socket_path.into(),
            state: Arc::new(ServerState {
                started: Instant::now(),
                requests: AtomicU64::new(0),
                active: AtomicUsize::new(0),
                shutdown,
            }),
        }
    }

    #[must_use]
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            state: Arc::clone(&self.state),
        }
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the socket and serve until shut down
    ///
    /// A stale socket file left by an earlier run is replaced. The socket
    /// file is removed on return.
    ///
    /// # Errors
    ///
    /// Returns error if the socket can't be bound
    pub async fn serve(self) -> io::Result<()> {
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => tracing::debug!(path = %self.socket_path.display(), "removed stale socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        tracing::info!(path = %self.socket_path.display(), "node listening");

        let stop = stopped(self.state.shutdown.subscribe());
        tokio::pin!(stop);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let conn = Connection::from_stream(stream, self.socket_path.clone());
                        tokio::spawn(serve_connection(
                            Arc::clone(&self.handler),
                            Arc::clone(&self.state),
                            conn,
                        ));
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to accept connection"),
                },
                () = &mut stop => break,
            }
        }

        drop(listener);
        if let Err(e) = std::fs::remove_file(&self.socket_path)
            && e.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!(
                path = %self.socket_path.display(),
                error = %e,
                "failed to remove socket"
            );
        }
        tracing::info!("node server stopped");
        Ok(())
    }
}

async fn stopped(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn serve_connection<H: NodeHandler>(
    handler: Arc<H>,
    state: Arc<ServerState>,
    mut conn: Connection,
) {
    let _active = ActiveGuard::new(Arc::clone(&state));

    loop {
        let frame = match conn.receive().await {
            Ok(frame) => frame,
            Err(TransportError::ConnectionClosed) => break,
            Err(e) => {
                tracing::debug!(error = %e, "connection failed");
                break;
            }
        };

        let (response, stop) = handle_frame(handler.as_ref(), &state, &frame).await;
        if let Err(e) = conn.send(&encode_response(&response)).await {
            tracing::debug!(error = %e, "failed to send response");
            break;
        }
        if stop {
            tracing::info!("shutdown requested");
            state.shutdown.send_replace(true);
            break;
        }
    }
}

/// Answer one request frame; the flag asks the server to stop afterwards
async fn handle_frame<H: NodeHandler>(
    handler: &H,
    state: &ServerState,
    frame: &[u8],
) -> (RpcResponse, bool) {
    let request = match decode_request(frame) {
        Ok(request) => request,
        Err(e) => {
            let code = match &e {
                CodecError::MalformedEnvelope(_) => codes::PARSE_ERROR,
                CodecError::UnsupportedProtocolVersion { .. }
                | CodecError::MissingCorrelationId => codes::INVALID_REQUEST,
            };
            tracing::debug!(error = %e, "rejected request");
            let error = RpcError::new(code, e.to_string());
            return (RpcResponse::failure(salvage_id(frame), error), false);
        }
    };

    state.requests.fetch_add(1, Ordering::SeqCst);
    tracing::debug!(method = %request.method, id = %request.correlation_id, "handling request");

    let mut stop = false;
    let result = match ReservedMethod::from_name(&request.method) {
        Some(ReservedMethod::Info) => serde_json::to_value(handler.info())
            .map_err(|e| RpcError::internal(e.to_string())),
        Some(ReservedMethod::Health) => handler
            .health()
            .await
            .map(|body| with_counters(body, state)),
        Some(ReservedMethod::Execute) => handler.execute(request.params).await,
        Some(ReservedMethod::Validate) => handler.validate(request.params).await,
        Some(ReservedMethod::Shutdown) => {
            stop = handler.accepts_shutdown();
            if !stop {
                tracing::warn!("ignoring shutdown request");
            }
            Ok(serde_json::json!({ "status": "shutting_down" }))
        }
        None => handler.call(&request.method, request.params).await,
    };

    let response = match result {
        Ok(value) => RpcResponse::success(request.correlation_id, value),
        Err(error) => RpcResponse::failure(request.correlation_id, error),
    };
    (response, stop)
}

fn with_counters(body: Value, state: &ServerState) -> Value {
    let Value::Object(mut body) = body else {
        return body;
    };
    body.entry("uptime_secs")
        .or_insert_with(|| state.started.elapsed().as_secs().into());
    body.entry("requests_processed")
        .or_insert_with(|| state.requests.load(Ordering::SeqCst).into());
    body.entry("active_connections")
        .or_insert_with(|| state.active.load(Ordering::SeqCst).into());
    Value::Object(body)
}

/// Best-effort id from a request that failed to decode
fn salvage_id(frame: &[u8]) -> String {
    serde_json::from_slice::<Value>(frame)
        .ok()
        .and_then(|value| value.get("id")?.as_str().map(str::to_string))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::dispatch::{DispatchError, call_socket};
    use crate::protocol::{Outcome, Params, RpcRequest, decode, encode};
    use crate::runtime::NodeInfo;
    use crate::transport;

    struct Echo {
        accept_shutdown: bool,
    }

    #[async_trait]
    impl NodeHandler for Echo {
        fn info(&self) -> NodeInfo {
            NodeInfo {
                node_id: "echo".to_string(),
                name: "Echo".to_string(),
                version: "0.1.0".to_string(),
                description: "echoes params".to_string(),
                methods: vec!["node.execute".to_string()],
            }
        }

        async fn execute(&self, params: Params) -> Result<Value, RpcError> {
            Ok(Value::Object(params))
        }

        fn accepts_shutdown(&self) -> bool {
            self.accept_shutdown
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn start(
        dir: &Path,
        accept_shutdown: bool,
    ) -> (PathBuf, ServerHandle, tokio::task::JoinHandle<io::Result<()>>) {
        let path = dir.join("echo.sock");
        let server = NodeServer::new(path.clone(), Echo { accept_shutdown });
        let handle = server.handle();
        let task = tokio::spawn(server.serve());
        (path, handle, task)
    }

    async fn call(path: &Path, method: &str, params: Value) -> Result<Value, DispatchError> {
        let Value::Object(params) = params else {
            panic!("params must be an object");
        };
        call_socket("echo", path, method, params, TIMEOUT).await
    }

    async fn wait_ready(path: &Path) {
        drop(transport::connect(path, TIMEOUT).await.unwrap());
    }

    #[tokio::test]
    async fn answers_reserved_methods() {
        let dir = tempfile::tempdir().unwrap();
        let (path, handle, _task) = start(dir.path(), true);
        wait_ready(&path).await;

        let echoed = call(&path, "node.execute", json!({"x": 1})).await.unwrap();
        assert_eq!(echoed, json!({"x": 1}));

        let info = call(&path, "node.info", json!({})).await.unwrap();
        assert_eq!(info["node_id"], "echo");

        let valid = call(&path, "node.validate", json!({})).await.unwrap();
        assert_eq!(valid, json!({"valid": true, "errors": []}));

        let health = call(&path, "node.health", json!({})).await.unwrap();
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["requests_processed"], 4);
        // Earlier connections may not have been reaped yet
        assert!(health["active_connections"].as_u64().unwrap() >= 1);
        assert!(health["uptime_secs"].is_u64());

        assert_eq!(handle.requests_processed(), 4);
    }

    #[tokio::test]
    async fn unknown_method_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _handle, _task) = start(dir.path(), true);
        wait_ready(&path).await;

        let err = call(&path, "custom.thing", json!({})).await.unwrap_err();
        assert_eq!(err.code(), Some(codes::METHOD_NOT_FOUND));
    }

    #[tokio::test]
    async fn malformed_frame_gets_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _handle, _task) = start(dir.path(), true);

        let mut conn = transport::connect(&path, TIMEOUT).await.unwrap();
        conn.send(b"{not json").await.unwrap();
        let raw: Value = serde_json::from_slice(&conn.receive().await.unwrap()).unwrap();
        assert_eq!(raw["error"]["code"], codes::PARSE_ERROR);
        assert_eq!(raw["id"], "");

        // Connection stays usable
        let request = RpcRequest::new("node.execute", Params::new());
        conn.send(&encode(&request)).await.unwrap();
        let response = decode(&conn.receive().await.unwrap()).unwrap();
        assert_eq!(response.correlation_id, request.correlation_id);
        assert!(matches!(response.outcome, Outcome::Result(_)));
    }

    #[tokio::test]
    async fn incompatible_version_keeps_id() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _handle, _task) = start(dir.path(), true);

        let mut conn = transport::connect(&path, TIMEOUT).await.unwrap();
        conn.send(br#"{"protocol":"2.0","method":"node.info","id":"v2","params":{}}"#)
            .await
            .unwrap();
        let response = decode(&conn.receive().await.unwrap()).unwrap();
        assert_eq!(response.correlation_id, "v2");
        let Outcome::Error(error) = response.outcome else {
            panic!("expected an error");
        };
        assert_eq!(error.code, codes::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn shutdown_acks_then_stops() {
        let dir = tempfile::tempdir().unwrap();
        let (path, handle, task) = start(dir.path(), true);
        wait_ready(&path).await;

        let ack = call(&path, "node.shutdown", json!({"timeout_seconds": 1}))
            .await
            .unwrap();
        assert_eq!(ack, json!({"status": "shutting_down"}));

        tokio::time::timeout(TIMEOUT, task).await.unwrap().unwrap().unwrap();
        assert!(handle.is_shutting_down());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn refused_shutdown_keeps_serving() {
        let dir = tempfile::tempdir().unwrap();
        let (path, handle, task) = start(dir.path(), false);
        wait_ready(&path).await;

        call(&path, "node.shutdown", json!({})).await.unwrap();
        let echoed = call(&path, "node.execute", json!({"still": "here"})).await.unwrap();
        assert_eq!(echoed["still"], "here");

        handle.shutdown();
        tokio::time::timeout(TIMEOUT, task).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn stale_socket_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("echo.sock");
        std::fs::write(&path, b"stale").unwrap();

        let server = NodeServer::new(path.clone(), Echo { accept_shutdown: true });
        let handle = server.handle();
        let task = tokio::spawn(server.serve());
        wait_ready(&path).await;

        handle.shutdown();
        tokio::time::timeout(TIMEOUT, task).await.unwrap().unwrap().unwrap();
    }
}
