//! One client session: the page graph, its control index and the supervisor
//! that runs event handlers.
//!
//! Every session is an actor task. Connections, the manager and handler code
//! talk to it through [`SessionHandle`]. Handler futures are polled by the
//! actor itself, so a diff pass never runs while a handler is between two
//! writes: they only interleave at the handler's `.await` points. Each
//! completion triggers exactly one diff, so any number of mutations made by a
//! handler reach the client as a single `PAGE_PATCH`.

use crate::connection::{ConnectionHandle, OutboundError};
use crate::pubsub::{PubSubClient, PubSubHub};
use ctlsync_core::protocol::{
    ClientMessage, ControlEventBody, InvokeMethodRequest, InvokeMethodResponse, PagePatchBody,
    RegisterClientResponse, ServerMessage, SessionCrashedBody, UpdateControlPropsBody,
};
use ctlsync_core::{
    diff, full_patch, ControlEvent, ControlIndex, FieldShape, GraphPatch, Node, NodeId, NodeRef,
    Value,
};
use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const DEFAULT_INVOKE_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_HANDLER_GRACE: Duration = Duration::from_secs(1);

pub const EVENT_CONNECT: &str = "connect";
pub const EVENT_DISCONNECT: &str = "disconnect";
pub const EVENT_CLOSE: &str = "close";

/// Supervised unit of session work.
pub type Job = BoxFuture<'static, anyhow::Result<()>>;

type JobOutcome = Result<anyhow::Result<()>, Box<dyn Any + Send>>;

/// Application hook that builds each session's page.
pub trait App: Send + Sync + 'static {
    fn build_page(&self, session: &SessionHandle) -> anyhow::Result<NodeRef>;

    fn on_session_created(&self, _session: SessionHandle) -> Job {
        Box::pin(async { Ok(()) })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvokeError {
    #[error("method call timed out after {0:?}")]
    Timeout(Duration),
    #[error("session closed")]
    SessionClosed,
    #[error("no client connected")]
    NotConnected,
    #[error("client error: {0}")]
    Remote(String),
    #[error("method call could not be sent")]
    Unsendable,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_frame_bytes: usize,
    /// Messages held while no connection is attached.
    pub backlog_limit: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: ctlsync_core::frame::DEFAULT_MAX_FRAME_BYTES,
            backlog_limit: 256,
        }
    }
}

enum SessionCommand {
    Client(ClientMessage),
    Attach {
        conn: ConnectionHandle,
        page_props: IndexMap<String, Value>,
        ready: oneshot::Sender<()>,
    },
    Detach {
        conn_id: String,
    },
    Flush,
    Run(Job),
    InvokeMethod {
        control_id: NodeId,
        call_id: String,
        name: String,
        args: Value,
        reply: oneshot::Sender<Result<Value, InvokeError>>,
    },
    ForgetCall {
        call_id: String,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

struct Shared {
    id: String,
    commands: mpsc::UnboundedSender<SessionCommand>,
    page: OnceLock<Weak<Node>>,
    pubsub: PubSubHub,
    last_activity: Mutex<Instant>,
    closed: AtomicBool,
}

/// Cloneable reference to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.shared.id)
            .finish()
    }
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// `None` once the session has been disposed.
    pub fn page(&self) -> Option<NodeRef> {
        self.shared.page.get().and_then(Weak::upgrade)
    }

    /// Sends whatever changed since the last patch.
    pub fn update(&self) {
        self.command(SessionCommand::Flush);
    }

    /// Runs `task` under this session's supervisor. A flush follows its
    /// completion; an error is reported to the client as a crash.
    pub fn spawn<F>(&self, task: F) -> bool
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.command(SessionCommand::Run(Box::pin(task)))
    }

    pub async fn invoke_method(
        &self,
        control: &Node,
        name: &str,
        args: impl Into<Value>,
        timeout: Duration,
    ) -> Result<Value, InvokeError> {
        let call_id = Uuid::new_v4().to_string();
        let (reply, rx) = oneshot::channel();
        let sent = self.command(SessionCommand::InvokeMethod {
            control_id: control.id(),
            call_id: call_id.clone(),
            name: name.to_string(),
            args: args.into(),
            reply,
        });
        if !sent {
            return Err(InvokeError::SessionClosed);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(InvokeError::SessionClosed),
            Err(_) => {
                self.command(SessionCommand::ForgetCall { call_id });
                Err(InvokeError::Timeout(timeout))
            }
        }
    }

    pub fn pubsub(&self) -> PubSubClient {
        PubSubClient::new(self.shared.pubsub.clone(), self.clone())
    }

    pub fn last_activity(&self) -> Instant {
        *self.shared.last_activity.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn touch(&self) {
        *self.shared.last_activity.lock() = Instant::now();
    }

    pub(crate) fn deliver(&self, message: ClientMessage) {
        self.touch();
        self.command(SessionCommand::Client(message));
    }

    /// Binds `conn` and waits until the registration response is queued.
    pub(crate) async fn attach(
        &self,
        conn: ConnectionHandle,
        page_props: IndexMap<String, Value>,
    ) -> bool {
        self.touch();
        let (ready, rx) = oneshot::channel();
        if !self.command(SessionCommand::Attach {
            conn,
            page_props,
            ready,
        }) {
            return false;
        }
        rx.await.is_ok()
    }

    pub(crate) fn detach(&self, conn_id: &str) {
        self.touch();
        self.command(SessionCommand::Detach {
            conn_id: conn_id.to_string(),
        });
    }

    /// Runs the page's close handler, fails pending calls and stops the actor.
    pub(crate) async fn close(&self) {
        let (done, rx) = oneshot::channel();
        if self.command(SessionCommand::Close { done }) {
            let _ = rx.await;
        }
    }

    fn command(&self, command: SessionCommand) -> bool {
        !self.is_closed() && self.shared.commands.send(command).is_ok()
    }
}

/// Creates the session, builds its page and starts the actor.
pub fn spawn_session(
    id: String,
    app: Arc<dyn App>,
    pubsub: PubSubHub,
    config: SessionConfig,
) -> anyhow::Result<SessionHandle> {
    let (commands, rx) = mpsc::unbounded_channel();
    let handle = SessionHandle {
        shared: Arc::new(Shared {
            id: id.clone(),
            commands,
            page: OnceLock::new(),
            pubsub,
            last_activity: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
        }),
    };
    let page = app.build_page(&handle)?;
    let _ = handle.shared.page.set(Arc::downgrade(&page));

    let actor = SessionActor {
        id,
        handle: handle.clone(),
        page,
        index: ControlIndex::new(),
        synced: false,
        needs_resync: false,
        conn: None,
        backlog: Vec::new(),
        pending_calls: HashMap::new(),
        tasks: FuturesUnordered::new(),
        config,
    };
    tokio::spawn(actor.run(rx));
    handle.spawn(app.on_session_created(handle.clone()));
    Ok(handle)
}

struct SessionActor {
    id: String,
    handle: SessionHandle,
    page: NodeRef,
    index: ControlIndex,
    /// The client has received the page at least once.
    synced: bool,
    /// What the client holds is unknown; the next attach sends a full snapshot.
    needs_resync: bool,
    conn: Option<ConnectionHandle>,
    backlog: Vec<Vec<u8>>,
    pending_calls: HashMap<String, oneshot::Sender<Result<Value, InvokeError>>>,
    /// Running handlers, polled only from the actor loop.
    tasks: FuturesUnordered<BoxFuture<'static, JobOutcome>>,
    config: SessionConfig,
}

impl SessionActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SessionCommand>) {
        info!(event = "session_started", session_id = %self.id);
        let done = loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::Close { done }) => break Some(done),
                    Some(command) => self.handle_command(command),
                    None => break None,
                },
                Some(outcome) = self.tasks.next(), if !self.tasks.is_empty() => {
                    self.on_task_finished(outcome);
                    self.flush();
                }
            }
        };
        self.shutdown().await;
        drop(self);
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Client(message) => self.handle_client_message(message),
            SessionCommand::Attach {
                conn,
                page_props,
                ready,
            } => {
                self.attach(conn, &page_props);
                let _ = ready.send(());
            }
            SessionCommand::Detach { conn_id } => self.detach(&conn_id),
            SessionCommand::Flush => self.flush(),
            SessionCommand::Run(job) => self.supervise(job),
            SessionCommand::InvokeMethod {
                control_id,
                call_id,
                name,
                args,
                reply,
            } => self.invoke_method(control_id, call_id, name, args, reply),
            SessionCommand::ForgetCall { call_id } => {
                self.pending_calls.remove(&call_id);
            }
            SessionCommand::Close { done } => {
                let _ = done.send(());
            }
        }
    }

    fn handle_client_message(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::ControlEvent(ControlEventBody { target, name, data }) => {
                self.dispatch_event(target, &name, data);
            }
            ClientMessage::UpdateControlProps(UpdateControlPropsBody { id, props }) => {
                self.apply_patch(id, &props);
                self.flush();
            }
            ClientMessage::InvokeMethodResult(response) => {
                self.handle_invoke_method_result(response);
            }
            ClientMessage::RegisterClient(_) => {
                warn!(event = "unexpected_register", session_id = %self.id);
            }
        }
    }

    fn attach(&mut self, conn: ConnectionHandle, page_props: &IndexMap<String, Value>) {
        if let Some(old) = self.conn.take() {
            if old.conn_id() != conn.conn_id() {
                info!(
                    event = "connection_replaced",
                    session_id = %self.id,
                    old_conn = old.conn_id(),
                    new_conn = conn.conn_id()
                );
                old.close();
            }
        }
        self.apply_page_patch(page_props);

        let resync = !self.synced || self.needs_resync;
        let patch = if resync {
            self.get_page_patch()
        } else {
            match diff(Some(&self.page), &self.page, &mut self.index) {
                Ok(patch) => Ok(patch.graph(self.page.id())),
                Err(err) => {
                    warn!(event = "diff_failed", session_id = %self.id, error = %err);
                    self.get_page_patch()
                }
            }
        };
        let response = match patch {
            Ok(page_patch) => {
                self.synced = true;
                self.needs_resync = false;
                RegisterClientResponse {
                    session_id: self.id.clone(),
                    page_patch,
                    error: None,
                }
            }
            Err(message) => {
                self.needs_resync = true;
                RegisterClientResponse {
                    session_id: self.id.clone(),
                    page_patch: GraphPatch::default(),
                    error: Some(message),
                }
            }
        };
        info!(
            event = "session_attached",
            session_id = %self.id,
            conn_id = conn.conn_id(),
            resync
        );

        self.conn = Some(conn);
        if !self.send(ServerMessage::RegisterClient(response)) {
            // the client has nothing to apply diffs to
            self.synced = false;
            self.needs_resync = true;
            self.send(ServerMessage::RegisterClient(RegisterClientResponse {
                session_id: self.id.clone(),
                page_patch: GraphPatch::default(),
                error: Some("page snapshot could not be sent".to_string()),
            }));
            return;
        }
        for payload in std::mem::take(&mut self.backlog) {
            self.send_payload(payload);
        }
        self.dispatch_page_event(EVENT_CONNECT);
    }

    fn detach(&mut self, conn_id: &str) {
        let current = self.conn.as_ref().map(|conn| conn.conn_id() == conn_id);
        if current != Some(true) {
            return;
        }
        self.conn = None;
        info!(event = "session_detached", session_id = %self.id, conn_id);
        self.dispatch_page_event(EVENT_DISCONNECT);
    }

    /// Page properties reported by the client at registration.
    fn apply_page_patch(&mut self, props: &IndexMap<String, Value>) {
        let schema = self.page.schema().clone();
        let mut known = IndexMap::new();
        for (field, value) in props {
            if schema.shape(field) == Some(FieldShape::Value) {
                known.insert(field.clone(), value.clone());
            } else {
                debug!(event = "page_prop_ignored", session_id = %self.id, field = %field);
            }
        }
        if let Err(err) = self.page.apply_client_props(&known) {
            warn!(event = "page_props_rejected", session_id = %self.id, error = %err);
        }
    }

    fn dispatch_event(&mut self, target_id: NodeId, name: &str, data: Value) {
        let Some(target) = self.index.get(target_id) else {
            debug!(event = "event_target_missing", session_id = %self.id, node = target_id, event_name = name);
            return;
        };
        let Some(handler) = target.handler(name) else {
            debug!(event = "event_unhandled", session_id = %self.id, node = target_id, event_name = name);
            return;
        };
        let event = ControlEvent {
            target,
            name: name.to_string(),
            data,
        };
        self.supervise(handler(event));
    }

    fn supervise(&mut self, job: Job) {
        self.tasks.push(AssertUnwindSafe(job).catch_unwind().boxed());
    }

    fn dispatch_page_event(&mut self, name: &str) {
        let Some(handler) = self.page.handler(name) else {
            return;
        };
        debug!(event = "page_event", session_id = %self.id, event_name = name);
        let event = ControlEvent {
            target: self.page.clone(),
            name: name.to_string(),
            data: Value::Null,
        };
        self.supervise(handler(event));
    }

    /// Applies values the client already shows; nothing is echoed back.
    fn apply_patch(&mut self, node_id: NodeId, props: &IndexMap<String, Value>) {
        let Some(node) = self.index.get(node_id) else {
            debug!(event = "update_target_missing", session_id = %self.id, node = node_id);
            return;
        };
        if let Err(err) = node.apply_client_props(props) {
            warn!(event = "update_props_rejected", session_id = %self.id, node = node_id, error = %err);
        }
    }

    /// Full snapshot of the page; resets the index to match.
    fn get_page_patch(&mut self) -> Result<GraphPatch, String> {
        match full_patch(&self.page, &mut self.index) {
            Ok(patch) => Ok(patch.graph(self.page.id())),
            Err(err) => {
                error!(event = "snapshot_failed", session_id = %self.id, error = %err);
                Err(err.to_string())
            }
        }
    }

    fn handle_invoke_method_result(&mut self, response: InvokeMethodResponse) {
        let Some(reply) = self.pending_calls.remove(&response.call_id) else {
            debug!(event = "invoke_result_unmatched", session_id = %self.id, call_id = %response.call_id);
            return;
        };
        let result = match response.error {
            Some(message) => Err(InvokeError::Remote(message)),
            None => Ok(response.result),
        };
        let _ = reply.send(result);
    }

    fn invoke_method(
        &mut self,
        control_id: NodeId,
        call_id: String,
        name: String,
        args: Value,
        reply: oneshot::Sender<Result<Value, InvokeError>>,
    ) {
        if self.conn.is_none() {
            let _ = reply.send(Err(InvokeError::NotConnected));
            return;
        }
        // the control must be on the client before the call lands
        self.flush();
        self.pending_calls.insert(call_id.clone(), reply);
        let sent = self.send(ServerMessage::InvokeMethod(InvokeMethodRequest {
            control_id,
            call_id: call_id.clone(),
            name,
            args,
        }));
        if !sent {
            if let Some(reply) = self.pending_calls.remove(&call_id) {
                let _ = reply.send(Err(InvokeError::Unsendable));
            }
        }
    }

    fn on_task_finished(&mut self, outcome: JobOutcome) {
        let message = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(err)) => format!("{err:#}"),
            Err(_) => "event handler panicked".to_string(),
        };
        error!(event = "handler_failed", session_id = %self.id, error = %message);
        self.send(ServerMessage::SessionCrashed(SessionCrashedBody { message }));
    }

    /// Diffs the page and sends the result, if any.
    fn flush(&mut self) {
        if self.conn.is_none() || !self.synced {
            return;
        }
        let patch = match diff(Some(&self.page), &self.page, &mut self.index) {
            Ok(patch) => patch,
            Err(err) => {
                warn!(event = "diff_failed", session_id = %self.id, error = %err);
                self.resync_connected();
                return;
            }
        };
        if patch.is_empty() {
            return;
        }
        debug!(
            event = "page_patch",
            session_id = %self.id,
            edits = patch.len(),
            visited = patch.visited()
        );
        let graph = patch.graph(self.page.id());
        self.index.prune();
        // shadows already moved past this patch; the client must not miss it
        if !self.send_page_patch(graph) {
            self.resync_connected();
        }
    }

    fn send_page_patch(&mut self, patch: GraphPatch) -> bool {
        self.send(ServerMessage::PagePatch(PagePatchBody {
            id: self.page.id(),
            patch,
        }))
    }

    /// Replaces what the connected client holds with a full snapshot. If even
    /// that cannot go out, the connection is dropped and the next attach
    /// starts from a snapshot.
    fn resync_connected(&mut self) {
        let sent = match self.get_page_patch() {
            Ok(graph) => self.send_page_patch(graph),
            Err(message) => {
                self.send(ServerMessage::SessionCrashed(SessionCrashedBody { message }));
                false
            }
        };
        if !sent {
            warn!(event = "resync_failed", session_id = %self.id);
            self.drop_connection();
        }
    }

    /// Encodes and queues `message`. `false` when it could not be queued at all.
    fn send(&mut self, message: ServerMessage) -> bool {
        let action = message.action();
        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(err) => {
                error!(event = "encode_failed", session_id = %self.id, action = %action, error = %err);
                return false;
            }
        };
        if payload.len() > self.config.max_frame_bytes {
            error!(
                event = "message_too_large",
                session_id = %self.id,
                action = %action,
                size = payload.len(),
                max = self.config.max_frame_bytes
            );
            return false;
        }
        self.send_payload(payload);
        true
    }

    fn send_payload(&mut self, payload: Vec<u8>) {
        let Some(conn) = self.conn.clone() else {
            if self.backlog.len() >= self.config.backlog_limit {
                warn!(event = "backlog_overflow", session_id = %self.id);
                self.backlog.clear();
                self.needs_resync = true;
            }
            self.backlog.push(payload);
            return;
        };
        match conn.try_send(payload) {
            Ok(()) => self.handle.touch(),
            Err(err) => {
                if err == OutboundError::Full {
                    warn!(event = "outbound_overflow", session_id = %self.id, conn_id = conn.conn_id());
                }
                self.drop_connection();
            }
        }
    }

    /// The client missed something; it gets a snapshot on reconnect.
    fn drop_connection(&mut self) {
        self.needs_resync = true;
        let Some(conn) = self.conn.take() else {
            return;
        };
        conn.close();
        info!(event = "connection_dropped", session_id = %self.id, conn_id = conn.conn_id());
        self.fail_pending_calls(InvokeError::NotConnected);
        self.dispatch_page_event(EVENT_DISCONNECT);
    }

    fn fail_pending_calls(&mut self, err: InvokeError) {
        for (_, reply) in self.pending_calls.drain() {
            let _ = reply.send(Err(err.clone()));
        }
    }

    async fn shutdown(&mut self) {
        self.handle.shared.closed.store(true, Ordering::SeqCst);
        if let Some(handler) = self.page.handler(EVENT_CLOSE) {
            let event = ControlEvent {
                target: self.page.clone(),
                name: EVENT_CLOSE.to_string(),
                data: Value::Null,
            };
            match tokio::time::timeout(CLOSE_HANDLER_GRACE, handler(event)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(event = "close_handler_failed", session_id = %self.id, error = %err),
                Err(_) => warn!(event = "close_handler_timeout", session_id = %self.id),
            }
        }
        self.tasks = FuturesUnordered::new();
        self.fail_pending_calls(InvokeError::SessionClosed);
        if let Some(conn) = self.conn.take() {
            conn.close();
        }
        self.index.clear();
        info!(event = "session_closed", session_id = %self.id);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ctlsync_core::mirror::ClientMirror;
    use ctlsync_core::protocol::Action;
    use ctlsync_core::{EventHandler, Schema};
    use futures_util::FutureExt;

    pub(crate) struct TestApp {
        pub page: Arc<Schema>,
        pub text: Arc<Schema>,
        pub button: Arc<Schema>,
    }

    impl TestApp {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self {
                page: Schema::builder("page")
                    .value("route")
                    .value("status")
                    .children("controls")
                    .build(),
                text: Schema::builder("text").value("value").value("color").build(),
                button: Schema::builder("button").value("label").build(),
            })
        }

        pub(crate) fn schemas(&self) -> Vec<Arc<Schema>> {
            vec![self.page.clone(), self.text.clone(), self.button.clone()]
        }
    }

    fn handler<F, Fut>(f: F) -> EventHandler
    where
        F: Fn(ControlEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Arc::new(move |event| f(event).boxed())
    }

    impl App for TestApp {
        fn build_page(&self, session: &SessionHandle) -> anyhow::Result<NodeRef> {
            let page = Node::new(&self.page);
            let texts: Vec<NodeRef> = (0..3)
                .map(|i| -> anyhow::Result<NodeRef> {
                    let text = Node::new(&self.text);
                    text.set("value", format!("t{i}"))?;
                    Ok(text)
                })
                .collect::<anyhow::Result<_>>()?;
            for text in &texts {
                page.push_child("controls", text.clone())?;
            }

            let burst = Node::new(&self.button);
            burst.set("label", "burst")?;
            let targets = texts.clone();
            burst.on(
                "click",
                handler(move |_| {
                    let targets = targets.clone();
                    async move {
                        targets[0].set("value", "a")?;
                        targets[0].set("color", "red")?;
                        targets[1].set("value", "b")?;
                        targets[1].set("color", "blue")?;
                        targets[2].set("value", "c")?;
                        Ok(())
                    }
                }),
            );
            page.push_child("controls", burst)?;

            let failing = Node::new(&self.button);
            failing.set("label", "fail")?;
            failing.on("click", handler(|_| async { anyhow::bail!("handler exploded") }));
            page.push_child("controls", failing)?;

            let focus = Node::new(&self.button);
            focus.set("label", "focus")?;
            let session = session.clone();
            let first = texts[0].clone();
            focus.on(
                "click",
                handler(move |_| {
                    let session = session.clone();
                    let first = first.clone();
                    async move {
                        let result = session
                            .invoke_method(&first, "focus", Value::Null, Duration::from_secs(2))
                            .await?;
                        first.set("value", result)?;
                        Ok(())
                    }
                }),
            );
            page.push_child("controls", focus)?;

            // writes on both sides of a blocking stretch with no await between
            let slow = Node::new(&self.button);
            slow.set("label", "slow")?;
            let pair = [texts[0].clone(), texts[1].clone()];
            slow.on(
                "click",
                handler(move |_| {
                    let pair = pair.clone();
                    async move {
                        pair[0].set("value", "a1")?;
                        std::thread::sleep(Duration::from_millis(300));
                        pair[1].set("value", "b1")?;
                        Ok(())
                    }
                }),
            );
            page.push_child("controls", slow)?;

            page.on(
                EVENT_CONNECT,
                handler(|event| async move {
                    event.target.set("status", "online")?;
                    Ok(())
                }),
            );
            Ok(page)
        }
    }

    pub(crate) async fn next_message(rx: &mut mpsc::Receiver<Vec<u8>>) -> ServerMessage {
        let payload = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("message in time")
            .expect("queue open");
        ServerMessage::decode(&payload).expect("decode")
    }

    pub(crate) async fn maybe_message(
        rx: &mut mpsc::Receiver<Vec<u8>>,
        wait: Duration,
    ) -> Option<ServerMessage> {
        match tokio::time::timeout(wait, rx.recv()).await {
            Ok(Some(payload)) => Some(ServerMessage::decode(&payload).expect("decode")),
            _ => None,
        }
    }

    async fn attached_session() -> (
        SessionHandle,
        ConnectionHandle,
        mpsc::Receiver<Vec<u8>>,
        ClientMirror,
    ) {
        attached_session_with(SessionConfig::default()).await
    }

    async fn attached_session_with(
        config: SessionConfig,
    ) -> (
        SessionHandle,
        ConnectionHandle,
        mpsc::Receiver<Vec<u8>>,
        ClientMirror,
    ) {
        let app = TestApp::new();
        let mut mirror = ClientMirror::new(app.schemas());
        let handle = spawn_session("s-1".to_string(), app, PubSubHub::new(), config)
            .expect("spawn");
        let (conn, mut rx) = ConnectionHandle::new("conn-1", 32);
        assert!(handle.attach(conn.clone(), IndexMap::new()).await);

        match next_message(&mut rx).await {
            ServerMessage::RegisterClient(resp) => {
                assert_eq!(resp.session_id, "s-1");
                assert!(resp.error.is_none());
                mirror.apply(&resp.page_patch).expect("apply snapshot");
            }
            other => panic!("unexpected {other:?}"),
        }
        // connect handler sets the status field
        match next_message(&mut rx).await {
            ServerMessage::PagePatch(body) => mirror.apply(&body.patch).expect("apply"),
            other => panic!("unexpected {other:?}"),
        }
        (handle, conn, rx, mirror)
    }

    fn control(handle: &SessionHandle, index: usize) -> NodeRef {
        let page = handle.page().expect("page");
        page.children("controls")[index].clone()
    }

    fn click(handle: &SessionHandle, node: &NodeRef) {
        handle.deliver(ClientMessage::ControlEvent(ControlEventBody {
            target: node.id(),
            name: "click".to_string(),
            data: Value::Null,
        }));
    }

    #[tokio::test]
    async fn handler_mutations_coalesce_into_one_patch() {
        let (handle, _conn, mut rx, mut mirror) = attached_session().await;
        let page = handle.page().expect("page");
        assert_eq!(page.get("status"), Some(Value::from("online")));

        click(&handle, &control(&handle, 3));
        let body = match next_message(&mut rx).await {
            ServerMessage::PagePatch(body) => body,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(body.id, page.id());
        assert_eq!(body.patch.entries().len(), 3);
        mirror.apply(&body.patch).expect("apply");
        assert_eq!(mirror.render(), Some(page.snapshot().to_value()));

        assert!(maybe_message(&mut rx, Duration::from_millis(200)).await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn diff_never_splits_a_handler_between_awaits() {
        let (handle, _conn, mut rx, _mirror) = attached_session().await;
        let (first, second, third) = (control(&handle, 0), control(&handle, 1), control(&handle, 2));

        click(&handle, &control(&handle, 6));
        let typist = {
            let handle = handle.clone();
            let id = third.id();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(100));
                let mut props = IndexMap::new();
                props.insert("value".to_string(), Value::from("typed"));
                handle.deliver(ClientMessage::UpdateControlProps(UpdateControlPropsBody {
                    id,
                    props,
                }));
            })
        };

        let body = match next_message(&mut rx).await {
            ServerMessage::PagePatch(body) => body,
            other => panic!("unexpected {other:?}"),
        };
        let value = |node: &NodeRef| {
            body.patch
                .get(&node.id().to_string())
                .and_then(|entry| entry.get("value").cloned())
        };
        assert_eq!(body.patch.entries().len(), 2);
        assert_eq!(value(&first), Some(Value::from("a1")));
        assert_eq!(value(&second), Some(Value::from("b1")));

        typist.join().expect("typist");
        assert!(maybe_message(&mut rx, Duration::from_millis(300)).await.is_none());
        assert_eq!(third.get("value"), Some(Value::from("typed")));
    }

    #[tokio::test]
    async fn undeliverable_patch_drops_connection_and_resyncs() {
        let config = SessionConfig {
            max_frame_bytes: 2048,
            ..SessionConfig::default()
        };
        let (handle, conn, mut rx, _mirror) = attached_session_with(config).await;
        let text = control(&handle, 1);
        let far = chrono::TimeDelta::seconds(10_000_000_000_000);
        assert!(text.set("color", far).is_err());

        text.set("value", "x".repeat(4096)).expect("set");
        handle.update();
        tokio::time::timeout(Duration::from_secs(2), async {
            while !conn.is_closed() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("connection dropped");
        assert!(maybe_message(&mut rx, Duration::from_millis(100)).await.is_none());

        text.set("value", "short").expect("set");
        let (conn2, mut rx2) = ConnectionHandle::new("conn-2", 32);
        assert!(handle.attach(conn2, IndexMap::new()).await);
        let mut mirror = ClientMirror::new(TestApp::new().schemas());
        match next_message(&mut rx2).await {
            ServerMessage::RegisterClient(resp) => {
                assert!(resp.error.is_none());
                let root = resp.page_patch.get("").expect("root entry");
                assert!(root.contains_key(ctlsync_core::patch::KIND_KEY));
                mirror.apply(&resp.page_patch).expect("apply snapshot");
            }
            other => panic!("unexpected {other:?}"),
        }
        let page = handle.page().expect("page");
        assert_eq!(mirror.render(), Some(page.snapshot().to_value()));
    }

    #[tokio::test]
    async fn client_props_are_not_echoed() {
        let (handle, _conn, mut rx, _mirror) = attached_session().await;
        let text = control(&handle, 0);
        let mut props = IndexMap::new();
        props.insert("value".to_string(), Value::from("typed"));
        handle.deliver(ClientMessage::UpdateControlProps(UpdateControlPropsBody {
            id: text.id(),
            props,
        }));

        assert!(maybe_message(&mut rx, Duration::from_millis(200)).await.is_none());
        assert_eq!(text.get("value"), Some(Value::from("typed")));
    }

    #[tokio::test]
    async fn handler_error_is_reported_as_crash() {
        let (handle, _conn, mut rx, _mirror) = attached_session().await;
        click(&handle, &control(&handle, 4));
        match next_message(&mut rx).await {
            ServerMessage::SessionCrashed(body) => assert!(body.message.contains("handler exploded")),
            other => panic!("unexpected {other:?}"),
        }
        // the session keeps serving events
        click(&handle, &control(&handle, 3));
        assert_eq!(next_message(&mut rx).await.action(), Action::PagePatch);
    }

    #[tokio::test]
    async fn invoke_method_round_trip() {
        let (handle, _conn, mut rx, _mirror) = attached_session().await;
        let first = control(&handle, 0);
        click(&handle, &control(&handle, 5));

        let request = match next_message(&mut rx).await {
            ServerMessage::InvokeMethod(request) => request,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(request.control_id, first.id());
        assert_eq!(request.name, "focus");

        handle.deliver(ClientMessage::InvokeMethodResult(InvokeMethodResponse {
            control_id: request.control_id,
            call_id: request.call_id,
            result: Value::from("focused"),
            error: None,
        }));
        match next_message(&mut rx).await {
            ServerMessage::PagePatch(body) => {
                let entry = body.patch.get(&first.id().to_string()).expect("entry");
                assert_eq!(entry.get("value"), Some(&Value::from("focused")));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn invoke_method_times_out_without_reply() {
        let (handle, _conn, mut rx, _mirror) = attached_session().await;
        let first = control(&handle, 0);
        let result = handle
            .invoke_method(&first, "focus", Value::Null, Duration::from_millis(100))
            .await;
        assert_eq!(result, Err(InvokeError::Timeout(Duration::from_millis(100))));
        assert_eq!(next_message(&mut rx).await.action(), Action::InvokeMethod);
    }

    #[tokio::test]
    async fn close_fails_pending_calls() {
        let (handle, _conn, _rx, _mirror) = attached_session().await;
        let first = control(&handle, 0);
        let caller = {
            let handle = handle.clone();
            tokio::spawn(async move {
                handle
                    .invoke_method(&first, "focus", Value::Null, Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.close().await;
        assert!(handle.is_closed());
        assert!(handle.page().is_none());
        let result = caller.await.expect("caller");
        assert_eq!(result, Err(InvokeError::SessionClosed));
    }

    #[tokio::test]
    async fn no_diff_runs_while_detached() {
        let (handle, conn, mut rx, mut mirror) = attached_session().await;
        handle.detach(conn.conn_id());
        let text = control(&handle, 1);
        text.set("value", "offline edit").expect("set");
        handle.update();
        assert!(maybe_message(&mut rx, Duration::from_millis(100)).await.is_none());
        assert!(text.is_dirty());

        let (conn2, mut rx2) = ConnectionHandle::new("conn-2", 32);
        assert!(handle.attach(conn2, IndexMap::new()).await);
        match next_message(&mut rx2).await {
            ServerMessage::RegisterClient(resp) => {
                let entry = resp.page_patch.get(&text.id().to_string()).expect("catch-up entry");
                assert_eq!(entry.get("value"), Some(&Value::from("offline edit")));
                mirror.apply(&resp.page_patch).expect("apply");
            }
            other => panic!("unexpected {other:?}"),
        }
        let page = handle.page().expect("page");
        assert_eq!(mirror.render(), Some(page.snapshot().to_value()));
    }

    #[tokio::test]
    async fn overflow_closes_connection_and_forces_snapshot() {
        let app = TestApp::new();
        let handle = spawn_session("s-2".to_string(), app.clone(), PubSubHub::new(), SessionConfig::default())
            .expect("spawn");
        let (conn, _rx) = ConnectionHandle::new("conn-1", 1);
        assert!(handle.attach(conn.clone(), IndexMap::new()).await);
        // the registration response fills the queue; the connect patch overflows it
        tokio::time::timeout(Duration::from_secs(2), async {
            while !conn.is_closed() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("connection closed on overflow");

        let (conn2, mut rx2) = ConnectionHandle::new("conn-2", 32);
        assert!(handle.attach(conn2, IndexMap::new()).await);
        match next_message(&mut rx2).await {
            ServerMessage::RegisterClient(resp) => {
                let root = resp.page_patch.get("").expect("root entry");
                assert!(root.contains_key(ctlsync_core::patch::KIND_KEY));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
