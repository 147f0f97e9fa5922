use crate::manager::SessionManager;
use crate::session::SessionHandle;
use axum::extract::ws::{Message, WebSocket};
use ctlsync_core::frame::{encode_frame, LengthPrefixedDecoder};
use ctlsync_core::protocol::{peek_action, ClientMessage};
use futures_util::{SinkExt, StreamExt};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const READ_CHUNK_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundError {
    /// The bounded queue is full; the peer is not keeping up.
    Full,
    Closed,
}

impl fmt::Display for OutboundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutboundError::Full => f.write_str("outbound queue full"),
            OutboundError::Closed => f.write_str("connection closed"),
        }
    }
}

impl std::error::Error for OutboundError {}

/// Sending side of one client connection. The session holds a clone and
/// enqueues encoded payloads; a writer task owns the socket.
#[derive(Clone)]
pub struct ConnectionHandle {
    conn_id: Arc<str>,
    sender: mpsc::Sender<Vec<u8>>,
    closed: Arc<watch::Sender<bool>>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("conn_id", &self.conn_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ConnectionHandle {
    pub fn new(conn_id: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let (closed, _) = watch::channel(false);
        let handle = Self {
            conn_id: Arc::from(conn_id.into()),
            sender,
            closed: Arc::new(closed),
        };
        (handle, receiver)
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    pub fn try_send(&self, payload: Vec<u8>) -> Result<(), OutboundError> {
        if self.is_closed() {
            return Err(OutboundError::Closed);
        }
        self.sender.try_send(payload).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => OutboundError::Full,
            mpsc::error::TrySendError::Closed(_) => OutboundError::Closed,
        })
    }

    /// Asks both halves of the connection to stop.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow() || self.sender.is_closed()
    }

    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WritePolicy {
    pub timeout: Duration,
    pub retries: u32,
    pub max_frame_bytes: usize,
}

/// Drives one write to completion, granting it up to `retries` extra
/// timeout windows before giving up. The same future is polled throughout,
/// so a partially written frame is never restarted.
async fn write_with_retries<F, E>(conn_id: &str, policy: &WritePolicy, write: F) -> bool
where
    F: Future<Output = Result<(), E>>,
    E: fmt::Display,
{
    tokio::pin!(write);
    let mut attempt = 0;
    loop {
        match tokio::time::timeout(policy.timeout, &mut write).await {
            Ok(Ok(())) => return true,
            Ok(Err(err)) => {
                warn!(event = "write_failed", conn_id, error = %err);
                return false;
            }
            Err(_) if attempt < policy.retries => {
                attempt += 1;
                debug!(event = "write_retry", conn_id, attempt);
            }
            Err(_) => {
                warn!(event = "write_timeout", conn_id, attempts = attempt + 1);
                return false;
            }
        }
    }
}

pub async fn stream_writer_loop<W>(
    conn: ConnectionHandle,
    mut writer: W,
    mut rx: mpsc::Receiver<Vec<u8>>,
    policy: WritePolicy,
) where
    W: AsyncWrite + Unpin,
{
    let mut closed = conn.closed_signal();
    loop {
        let payload = tokio::select! {
            _ = closed.wait_for(|closed| *closed) => break,
            payload = rx.recv() => match payload {
                Some(payload) => payload,
                None => break,
            },
        };
        let frame = match encode_frame(&payload, policy.max_frame_bytes) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(event = "frame_encode_failed", conn_id = conn.conn_id(), error = %err);
                continue;
            }
        };
        let write = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        if !write_with_retries(conn.conn_id(), &policy, write).await {
            break;
        }
    }
    let _ = writer.shutdown().await;
    conn.close();
}

pub async fn ws_writer_loop<S>(
    conn: ConnectionHandle,
    mut sink: S,
    mut rx: mpsc::Receiver<Vec<u8>>,
    policy: WritePolicy,
) where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    let mut closed = conn.closed_signal();
    loop {
        let payload = tokio::select! {
            _ = closed.wait_for(|closed| *closed) => break,
            payload = rx.recv() => match payload {
                Some(payload) => payload,
                None => break,
            },
        };
        if !write_with_retries(conn.conn_id(), &policy, sink.send(Message::Binary(payload))).await {
            break;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
    conn.close();
}

/// Inbound state of one connection: at most one registered session.
struct Link {
    manager: Arc<SessionManager>,
    conn: ConnectionHandle,
    session: Option<SessionHandle>,
}

impl Link {
    async fn handle_payload(&mut self, payload: &[u8]) {
        let action = match peek_action(payload) {
            Ok(action) => action,
            Err(err) => {
                warn!(event = "protocol_error", conn_id = self.conn.conn_id(), error = %err);
                return;
            }
        };
        let message = match ClientMessage::decode(payload) {
            Ok(message) => message,
            Err(err) => {
                warn!(
                    event = "protocol_error",
                    conn_id = self.conn.conn_id(),
                    action = %action,
                    error = %err
                );
                return;
            }
        };
        match message {
            ClientMessage::RegisterClient(request) => {
                if self.session.is_some() {
                    warn!(event = "duplicate_register", conn_id = self.conn.conn_id());
                    return;
                }
                self.session = self.manager.register(request, self.conn.clone()).await;
            }
            other => match &self.session {
                Some(session) => session.deliver(other),
                None => {
                    warn!(
                        event = "unregistered_message",
                        conn_id = self.conn.conn_id(),
                        action = %action
                    );
                }
            },
        }
    }

    async fn finish(self) {
        if let Some(session) = self.session {
            self.manager
                .connection_lost(session.id(), self.conn.conn_id())
                .await;
        }
    }
}

/// Serves one byte-stream connection (TCP or Unix socket) carrying
/// length-prefixed frames.
pub async fn serve_stream<S>(
    manager: Arc<SessionManager>,
    conn_id: String,
    stream: S,
    policy: WritePolicy,
    queue_capacity: usize,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let (conn, rx) = ConnectionHandle::new(conn_id, queue_capacity);
    info!(event = "client_connected", conn_id = conn.conn_id(), transport = "stream");
    let writer_task = tokio::spawn(stream_writer_loop(conn.clone(), writer, rx, policy));

    let mut link = Link {
        manager,
        conn: conn.clone(),
        session: None,
    };
    let mut closed = conn.closed_signal();
    let mut decoder = LengthPrefixedDecoder::new(policy.max_frame_bytes);
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    loop {
        let read = tokio::select! {
            _ = closed.wait_for(|closed| *closed) => break,
            read = reader.read(&mut buf) => read,
        };
        let n = match read {
            Ok(0) => {
                for err in decoder.finish().errors {
                    warn!(event = "frame_error", conn_id = conn.conn_id(), error = %err);
                }
                break;
            }
            Ok(n) => n,
            Err(err) => {
                warn!(event = "read_failed", conn_id = conn.conn_id(), error = %err);
                break;
            }
        };
        let report = decoder.push_chunk(&buf[..n]);
        for err in &report.errors {
            warn!(event = "frame_error", conn_id = conn.conn_id(), error = %err);
        }
        for frame in report.frames {
            link.handle_payload(&frame).await;
        }
        if decoder.is_poisoned() {
            break;
        }
    }

    conn.close();
    let _ = writer_task.await;
    info!(event = "client_disconnected", conn_id = conn.conn_id());
    link.finish().await;
}

/// Serves one WebSocket connection; each binary message is one payload.
pub async fn serve_websocket(
    manager: Arc<SessionManager>,
    conn_id: String,
    socket: WebSocket,
    policy: WritePolicy,
    queue_capacity: usize,
) {
    let (sink, mut stream) = socket.split();
    let (conn, rx) = ConnectionHandle::new(conn_id, queue_capacity);
    info!(event = "client_connected", conn_id = conn.conn_id(), transport = "websocket");
    let writer_task = tokio::spawn(ws_writer_loop(conn.clone(), sink, rx, policy));

    let mut link = Link {
        manager,
        conn: conn.clone(),
        session: None,
    };
    let mut closed = conn.closed_signal();
    loop {
        let next = tokio::select! {
            _ = closed.wait_for(|closed| *closed) => break,
            next = stream.next() => next,
        };
        let payload = match next {
            Some(Ok(Message::Binary(bytes))) => bytes,
            Some(Ok(Message::Text(text))) => text.into_bytes(),
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Err(err)) => {
                warn!(event = "ws_read_error", conn_id = conn.conn_id(), error = %err);
                break;
            }
        };
        if payload.len() > policy.max_frame_bytes {
            warn!(
                event = "frame_error",
                conn_id = conn.conn_id(),
                size = payload.len(),
                max = policy.max_frame_bytes
            );
            break;
        }
        link.handle_payload(&payload).await;
    }

    conn.close();
    let _ = writer_task.await;
    info!(event = "client_disconnected", conn_id = conn.conn_id());
    link.finish().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctlsync_core::frame::FRAME_HEADER_BYTES;
    use tokio::io::duplex;

    fn policy() -> WritePolicy {
        WritePolicy {
            timeout: Duration::from_millis(50),
            retries: 2,
            max_frame_bytes: 1024,
        }
    }

    #[test]
    fn full_queue_is_reported() {
        let (conn, _rx) = ConnectionHandle::new("conn-1", 1);
        assert_eq!(conn.try_send(vec![1]), Ok(()));
        assert_eq!(conn.try_send(vec![2]), Err(OutboundError::Full));
    }

    #[test]
    fn closed_handle_rejects_sends() {
        let (conn, rx) = ConnectionHandle::new("conn-1", 4);
        conn.close();
        assert!(conn.is_closed());
        assert_eq!(conn.try_send(vec![1]), Err(OutboundError::Closed));
        drop(rx);

        let (other, rx) = ConnectionHandle::new("conn-2", 4);
        drop(rx);
        assert!(other.is_closed());
    }

    #[tokio::test]
    async fn writer_frames_payloads_in_order() {
        let (conn, rx) = ConnectionHandle::new("conn-1", 8);
        let (client, server) = duplex(4096);
        let task = tokio::spawn(stream_writer_loop(conn.clone(), server, rx, policy()));

        conn.try_send(b"one".to_vec()).expect("send");
        conn.try_send(b"three".to_vec()).expect("send");

        let mut client = client;
        let mut bytes = vec![0u8; FRAME_HEADER_BYTES * 2 + 8];
        client.read_exact(&mut bytes).await.expect("read");
        let mut decoder = LengthPrefixedDecoder::new(1024);
        let report = decoder.push_chunk(&bytes);
        assert_eq!(report.frames, vec![b"one".to_vec(), b"three".to_vec()]);

        conn.close();
        task.await.expect("writer task");
    }

    #[tokio::test]
    async fn stalled_peer_times_out_after_retries() {
        let (conn, rx) = ConnectionHandle::new("conn-1", 8);
        // a tiny pipe nobody reads fills up on the first frame
        let (_client, server) = duplex(8);
        let task = tokio::spawn(stream_writer_loop(conn.clone(), server, rx, policy()));
        conn.try_send(vec![7u8; 64]).expect("send");

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("writer gives up")
            .expect("writer task");
        assert!(conn.is_closed());
    }
}
