use crate::config::HubConfig;
use crate::connection::{serve_stream, serve_websocket, WritePolicy};
use crate::manager::SessionManager;
use crate::pubsub::PubSubHub;
use crate::session::App;
use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[cfg(unix)]
use std::{fs, os::unix::fs::PermissionsExt, path::Path};
#[cfg(unix)]
use tokio::net::UnixListener;

/// Listener state shared by every transport.
pub struct Hub {
    config: HubConfig,
    manager: Arc<SessionManager>,
    next_conn_id: AtomicU64,
}

impl Hub {
    pub fn new(config: HubConfig, app: Arc<dyn App>) -> Arc<Self> {
        let manager = SessionManager::new(&config, app, PubSubHub::new());
        Arc::new(Self {
            config,
            manager,
            next_conn_id: AtomicU64::new(1),
        })
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    pub fn pubsub(&self) -> &PubSubHub {
        self.manager.pubsub()
    }

    fn next_conn_id(&self) -> String {
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        format!("conn-{id}")
    }

    fn write_policy(&self) -> WritePolicy {
        WritePolicy {
            timeout: self.config.write_timeout,
            retries: self.config.write_retries,
            max_frame_bytes: self.config.max_frame_bytes,
        }
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(|| async { "ok" }))
            .with_state(self.clone())
    }

    pub async fn serve_http(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> io::Result<()> {
        let app = self.router();
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
    }

    /// Accepts raw TCP connections carrying length-prefixed frames.
    pub async fn serve_tcp(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> io::Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                accept = listener.accept() => match accept {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        let conn_id = self.next_conn_id();
                        info!(event = "tcp_accept", conn_id = %conn_id, peer = %peer);
                        tokio::spawn(serve_stream(
                            self.manager.clone(),
                            conn_id,
                            stream,
                            self.write_policy(),
                            self.config.queue_capacity,
                        ));
                    }
                    Err(err) => warn!(event = "tcp_accept_error", error = %err),
                },
            }
        }
        Ok(())
    }

    #[cfg(unix)]
    pub async fn serve_uds(
        self: Arc<Self>,
        path: &Path,
        mut shutdown: watch::Receiver<bool>,
    ) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        if path.exists() {
            let _ = fs::remove_file(path);
        }
        let listener = UnixListener::bind(path)?;
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
        info!(event = "uds_start", socket = %path.display());

        loop {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                accept = listener.accept() => match accept {
                    Ok((stream, _addr)) => {
                        let conn_id = self.next_conn_id();
                        info!(event = "uds_accept", conn_id = %conn_id);
                        tokio::spawn(serve_stream(
                            self.manager.clone(),
                            conn_id,
                            stream,
                            self.write_policy(),
                            self.config.queue_capacity,
                        ));
                    }
                    Err(err) => warn!(event = "uds_accept_error", error = %err),
                },
            }
        }
        let _ = fs::remove_file(path);
        info!(event = "uds_stop", socket = %path.display());
        Ok(())
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(hub): State<Arc<Hub>>,
) -> impl IntoResponse {
    let conn_id = hub.next_conn_id();
    info!(event = "ws_accept", conn_id = %conn_id, peer = %addr);
    let max_frame_bytes = hub.config.max_frame_bytes;
    ws.max_message_size(max_frame_bytes)
        .on_upgrade(move |socket| async move {
            serve_websocket(
                hub.manager.clone(),
                conn_id,
                socket,
                hub.write_policy(),
                hub.config.queue_capacity,
            )
            .await;
        })
}

/// Binds every configured listener and serves until `shutdown` flips.
pub async fn run(
    config: HubConfig,
    app: Arc<dyn App>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr: SocketAddr = config.addr.parse()?;
    if !addr.ip().is_loopback() {
        warn!(event = "non_loopback_addr", addr = %addr);
    }
    let hub = Hub::new(config.clone(), app);
    hub.manager().start();

    let http_listener = TcpListener::bind(addr).await?;
    info!(
        event = "hub_start",
        addr = %config.addr,
        config = %serde_json::to_string(&config).unwrap_or_default()
    );

    let mut tasks = tokio::task::JoinSet::new();
    if let Some(socket_addr) = &config.socket_addr {
        let listener = TcpListener::bind(socket_addr).await?;
        info!(event = "tcp_start", addr = %socket_addr);
        tasks.spawn(hub.clone().serve_tcp(listener, shutdown.clone()));
    }
    #[cfg(unix)]
    {
        if let Some(path) = config.uds_path.clone() {
            let hub = hub.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(async move { hub.serve_uds(&path, shutdown).await });
        }
    }
    #[cfg(not(unix))]
    {
        if config.uds_path.is_some() {
            warn!(event = "uds_unsupported");
        }
    }

    if let Err(err) = hub.clone().serve_http(http_listener, shutdown).await {
        error!(event = "hub_error", error = %err);
    }
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Err(err)) => error!(event = "hub_error", error = %err),
            Err(err) => error!(event = "hub_error", error = %err),
            Ok(Ok(())) => {}
        }
    }
    hub.manager().shutdown().await;
    info!(event = "hub_stop");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::TestApp;
    use ctlsync_core::frame::{encode_frame, LengthPrefixedDecoder};
    use ctlsync_core::mirror::ClientMirror;
    use ctlsync_core::protocol::{
        ClientMessage, ControlEventBody, RegisterClientRequest, ServerMessage,
    };
    use ctlsync_core::Value;
    use futures_util::{SinkExt, StreamExt};
    use indexmap::IndexMap;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

    struct TestClient {
        stream: TcpStream,
        decoder: LengthPrefixedDecoder,
        pending: Vec<Vec<u8>>,
    }

    impl TestClient {
        async fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).await.expect("connect");
            Self {
                stream,
                decoder: LengthPrefixedDecoder::default(),
                pending: Vec::new(),
            }
        }

        async fn send(&mut self, message: ClientMessage) {
            let payload = message.encode().expect("encode");
            let frame = encode_frame(&payload, 1024 * 1024).expect("frame");
            self.stream.write_all(&frame).await.expect("write");
        }

        async fn read_frame_timeout(&mut self, wait: Duration) -> Option<ServerMessage> {
            let deadline = tokio::time::Instant::now() + wait;
            let mut buf = [0u8; 4096];
            while self.pending.is_empty() {
                let read = tokio::time::timeout_at(deadline, self.stream.read(&mut buf))
                    .await
                    .ok()?
                    .expect("read");
                if read == 0 {
                    return None;
                }
                self.pending.extend(self.decoder.push_chunk(&buf[..read]).frames);
            }
            let payload = self.pending.remove(0);
            Some(ServerMessage::decode(&payload).expect("decode"))
        }

        async fn read_frame(&mut self) -> ServerMessage {
            self.read_frame_timeout(Duration::from_secs(3))
                .await
                .expect("frame in time")
        }
    }

    async fn launch_hub() -> (SocketAddr, Arc<Hub>, watch::Sender<bool>, JoinHandle<io::Result<()>>) {
        let hub = Hub::new(HubConfig::default(), TestApp::new());
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(hub.clone().serve_tcp(listener, rx));
        (addr, hub, tx, task)
    }

    async fn launch_http_hub(
        config: HubConfig,
    ) -> (SocketAddr, Arc<Hub>, watch::Sender<bool>, JoinHandle<io::Result<()>>) {
        let hub = Hub::new(config, TestApp::new());
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(hub.clone().serve_http(listener, rx));
        (addr, hub, tx, task)
    }

    async fn ws_connect(addr: SocketAddr) -> WsClient {
        let (ws, _response) = connect_async(format!("ws://{addr}/ws"))
            .await
            .expect("ws connect");
        ws
    }

    async fn ws_send(ws: &mut WsClient, message: ClientMessage) {
        let payload = message.encode().expect("encode");
        ws.send(WsMessage::Binary(payload)).await.expect("ws send");
    }

    /// Next server message, or `None` once the socket is closed or quiet.
    async fn ws_read_timeout(ws: &mut WsClient, wait: Duration) -> Option<ServerMessage> {
        loop {
            match tokio::time::timeout(wait, ws.next()).await.ok()?? {
                Ok(WsMessage::Binary(bytes)) => {
                    return Some(ServerMessage::decode(&bytes).expect("decode"))
                }
                Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => continue,
                _ => return None,
            }
        }
    }

    async fn ws_read(ws: &mut WsClient) -> ServerMessage {
        ws_read_timeout(ws, Duration::from_secs(3))
            .await
            .expect("ws message in time")
    }

    fn register(session_id: Option<String>) -> ClientMessage {
        ClientMessage::RegisterClient(RegisterClientRequest {
            session_id,
            page_name: "main".to_string(),
            page: IndexMap::from([("route".to_string(), Value::from("/home"))]),
        })
    }

    #[tokio::test]
    async fn tcp_client_registers_clicks_and_resumes() {
        let (addr, hub, shutdown, task) = launch_hub().await;
        let app = TestApp::new();
        let mut mirror = ClientMirror::new(app.schemas());

        let mut client = TestClient::connect(addr).await;
        client.send(register(None)).await;
        let session_id = match client.read_frame().await {
            ServerMessage::RegisterClient(resp) => {
                mirror.apply(&resp.page_patch).expect("snapshot");
                resp.session_id
            }
            other => panic!("unexpected {other:?}"),
        };
        let page = hub.manager().get(&session_id).await.expect("session").page().expect("page");
        assert_eq!(page.get("route"), Some(Value::from("/home")));

        // connect handler patch
        match client.read_frame().await {
            ServerMessage::PagePatch(body) => mirror.apply(&body.patch).expect("apply"),
            other => panic!("unexpected {other:?}"),
        }

        let burst = page.children("controls")[3].clone();
        client
            .send(ClientMessage::ControlEvent(ControlEventBody {
                target: burst.id(),
                name: "click".to_string(),
                data: Value::Null,
            }))
            .await;
        match client.read_frame().await {
            ServerMessage::PagePatch(body) => mirror.apply(&body.patch).expect("apply"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(mirror.render(), Some(page.snapshot().to_value()));
        assert!(client.read_frame_timeout(Duration::from_millis(200)).await.is_none());

        drop(client);
        tokio::time::timeout(Duration::from_secs(2), async {
            while hub.manager().state(&session_id).await
                != Some(crate::manager::SessionState::Disconnected)
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("disconnect noticed");

        let mut again = TestClient::connect(addr).await;
        again.send(register(Some(session_id.clone()))).await;
        match again.read_frame().await {
            ServerMessage::RegisterClient(resp) => {
                assert_eq!(resp.session_id, session_id);
                mirror.apply(&resp.page_patch).expect("catch-up");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(mirror.render(), Some(page.snapshot().to_value()));
        assert_eq!(hub.manager().len().await, 1);

        shutdown.send(true).expect("shutdown");
        task.await.expect("join").expect("serve");
    }

    #[tokio::test]
    async fn garbage_before_register_is_ignored() {
        let (addr, hub, shutdown, task) = launch_hub().await;
        let mut client = TestClient::connect(addr).await;

        let junk = encode_frame(b"not cbor at all", 1024).expect("frame");
        client.stream.write_all(&junk).await.expect("write");
        client
            .send(ClientMessage::ControlEvent(ControlEventBody {
                target: 1,
                name: "click".to_string(),
                data: Value::Null,
            }))
            .await;
        assert!(client.read_frame_timeout(Duration::from_millis(200)).await.is_none());
        assert!(hub.manager().is_empty().await);

        client.send(register(None)).await;
        assert!(matches!(client.read_frame().await, ServerMessage::RegisterClient(_)));

        shutdown.send(true).expect("shutdown");
        task.await.expect("join").expect("serve");
    }

    #[tokio::test]
    async fn oversized_frame_drops_the_connection() {
        let (addr, _hub, shutdown, task) = launch_hub().await;
        let mut client = TestClient::connect(addr).await;
        let header = (u32::MAX).to_be_bytes();
        client.stream.write_all(&header).await.expect("write");
        assert!(client.read_frame_timeout(Duration::from_secs(2)).await.is_none());

        shutdown.send(true).expect("shutdown");
        task.await.expect("join").expect("serve");
    }

    #[tokio::test]
    async fn websocket_client_registers_and_receives_patches() {
        let (addr, hub, shutdown, task) = launch_http_hub(HubConfig::default()).await;
        let mut mirror = ClientMirror::new(TestApp::new().schemas());
        let mut ws = ws_connect(addr).await;

        ws_send(&mut ws, register(None)).await;
        let session_id = match ws_read(&mut ws).await {
            ServerMessage::RegisterClient(resp) => {
                assert!(resp.error.is_none());
                mirror.apply(&resp.page_patch).expect("snapshot");
                resp.session_id
            }
            other => panic!("unexpected {other:?}"),
        };
        match ws_read(&mut ws).await {
            ServerMessage::PagePatch(body) => mirror.apply(&body.patch).expect("apply"),
            other => panic!("unexpected {other:?}"),
        }

        let page = hub.manager().get(&session_id).await.expect("session").page().expect("page");
        let burst = page.children("controls")[3].clone();
        ws_send(
            &mut ws,
            ClientMessage::ControlEvent(ControlEventBody {
                target: burst.id(),
                name: "click".to_string(),
                data: Value::Null,
            }),
        )
        .await;
        match ws_read(&mut ws).await {
            ServerMessage::PagePatch(body) => mirror.apply(&body.patch).expect("apply"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(mirror.render(), Some(page.snapshot().to_value()));

        ws.close(None).await.expect("close");
        tokio::time::timeout(Duration::from_secs(2), async {
            while hub.manager().state(&session_id).await
                != Some(crate::manager::SessionState::Disconnected)
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("disconnect noticed");

        shutdown.send(true).expect("shutdown");
        task.await.expect("join").expect("serve");
    }

    #[tokio::test]
    async fn oversized_websocket_message_drops_the_connection() {
        let config = HubConfig {
            max_frame_bytes: 1024,
            ..HubConfig::default()
        };
        let (addr, hub, shutdown, task) = launch_http_hub(config).await;
        let mut ws = ws_connect(addr).await;

        let _ = ws.send(WsMessage::Binary(vec![0u8; 4096])).await;
        assert!(ws_read_timeout(&mut ws, Duration::from_secs(2)).await.is_none());
        assert!(hub.manager().is_empty().await);

        shutdown.send(true).expect("shutdown");
        task.await.expect("join").expect("serve");
    }

    #[tokio::test]
    async fn health_route_answers() {
        let hub = Hub::new(HubConfig::default(), TestApp::new());
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(hub.serve_http(listener, rx));

        let mut stream = TcpStream::connect(addr).await.expect("connect");
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .expect("write");
        let mut response = String::new();
        stream.read_to_string(&mut response).await.expect("read");
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("ok"));

        tx.send(true).expect("shutdown");
        task.await.expect("join").expect("serve");
    }
}
