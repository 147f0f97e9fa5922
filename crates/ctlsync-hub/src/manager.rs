use crate::config::HubConfig;
use crate::connection::ConnectionHandle;
use crate::pubsub::PubSubHub;
use crate::session::{spawn_session, App, SessionConfig, SessionHandle};
use ctlsync_core::protocol::{RegisterClientRequest, RegisterClientResponse, ServerMessage};
use ctlsync_core::GraphPatch;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Disconnected,
}

enum SessionStatus {
    Active { conn: ConnectionHandle },
    Disconnected { expires_at: Instant },
}

struct SessionEntry {
    handle: SessionHandle,
    status: SessionStatus,
}

/// Owns every live session and expires the ones whose client went away.
pub struct SessionManager {
    app: Arc<dyn App>,
    pubsub: PubSubHub,
    session_timeout: Duration,
    sweep_interval: Duration,
    session_config: SessionConfig,
    sessions: RwLock<HashMap<String, SessionEntry>>,
    shutdown_tx: watch::Sender<bool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(config: &HubConfig, app: Arc<dyn App>, pubsub: PubSubHub) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            app,
            pubsub,
            session_timeout: config.session_timeout,
            sweep_interval: config.sweep_interval,
            session_config: SessionConfig {
                max_frame_bytes: config.max_frame_bytes,
                backlog_limit: config.queue_capacity,
            },
            sessions: RwLock::new(HashMap::new()),
            shutdown_tx,
            sweeper: Mutex::new(None),
        })
    }

    pub fn pubsub(&self) -> &PubSubHub {
        &self.pubsub
    }

    /// Starts the periodic expiry sweep.
    pub fn start(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }
        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        *sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.sweep_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => manager.sweep_once().await,
                }
            }
        }));
    }

    /// Stops the sweep and disposes every session.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }
        let drained: Vec<SessionHandle> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, entry)| entry.handle).collect()
        };
        for handle in drained {
            self.dispose(&handle, "shutdown").await;
        }
    }

    /// Resumes the session named by the request or creates a new one, then
    /// binds it to `conn`. Failures are answered on `conn` directly.
    pub async fn register(
        &self,
        request: RegisterClientRequest,
        conn: ConnectionHandle,
    ) -> Option<SessionHandle> {
        let existing = match &request.session_id {
            Some(id) => self.resumable(id).await,
            None => None,
        };
        let resumed = existing.is_some();
        let handle = match existing {
            Some(handle) => handle,
            None => match spawn_session(
                Uuid::new_v4().to_string(),
                self.app.clone(),
                self.pubsub.clone(),
                self.session_config.clone(),
            ) {
                Ok(handle) => handle,
                Err(err) => {
                    error!(event = "session_create_failed", conn_id = conn.conn_id(), error = %err);
                    reject(&conn, format!("{err:#}"));
                    return None;
                }
            },
        };

        if !handle.attach(conn.clone(), request.page).await {
            warn!(event = "session_attach_failed", session_id = handle.id(), conn_id = conn.conn_id());
            reject(&conn, "session closed".to_string());
            return None;
        }
        let previous = self.sessions.write().await.insert(
            handle.id().to_string(),
            SessionEntry {
                handle: handle.clone(),
                status: SessionStatus::Active { conn: conn.clone() },
            },
        );
        if let Some(SessionEntry {
            status: SessionStatus::Active { conn: old },
            ..
        }) = previous
        {
            if old.conn_id() != conn.conn_id() {
                old.close();
            }
        }
        let event = if resumed {
            "session_resumed"
        } else {
            "session_created"
        };
        info!(
            event,
            session_id = handle.id(),
            conn_id = conn.conn_id(),
            page = %request.page_name
        );
        Some(handle)
    }

    /// Live session for `id`, disposing it first if it has already expired.
    async fn resumable(&self, id: &str) -> Option<SessionHandle> {
        let expired = {
            let mut sessions = self.sessions.write().await;
            let expired = match sessions.get(id) {
                None => return None,
                Some(entry) => match &entry.status {
                    SessionStatus::Disconnected { expires_at } => *expires_at <= Instant::now(),
                    SessionStatus::Active { .. } => entry.handle.is_closed(),
                },
            };
            if !expired {
                return sessions.get(id).map(|entry| entry.handle.clone());
            }
            sessions.remove(id).map(|entry| entry.handle)
        };
        if let Some(handle) = expired {
            self.dispose(&handle, "expired").await;
        }
        None
    }

    /// Marks the session disconnected if `conn_id` still owns it.
    pub async fn connection_lost(&self, session_id: &str, conn_id: &str) {
        let mut sessions = self.sessions.write().await;
        let Some(entry) = sessions.get_mut(session_id) else {
            return;
        };
        let owned = matches!(&entry.status, SessionStatus::Active { conn } if conn.conn_id() == conn_id);
        if !owned {
            return;
        }
        entry.handle.detach(conn_id);
        entry.status = SessionStatus::Disconnected {
            expires_at: entry.handle.last_activity() + self.session_timeout,
        };
        info!(event = "session_disconnected", session_id, conn_id);
    }

    /// One expiry pass: closed connections become disconnected sessions and
    /// sessions past their deadline are disposed.
    pub async fn sweep_once(&self) {
        let now = Instant::now();
        let expired: Vec<SessionHandle> = {
            let mut sessions = self.sessions.write().await;
            for (id, entry) in sessions.iter_mut() {
                let lost = match &entry.status {
                    SessionStatus::Active { conn } if conn.is_closed() => {
                        Some(conn.conn_id().to_string())
                    }
                    _ => None,
                };
                if let Some(conn_id) = lost {
                    entry.handle.detach(&conn_id);
                    entry.status = SessionStatus::Disconnected {
                        expires_at: entry.handle.last_activity() + self.session_timeout,
                    };
                    info!(event = "session_disconnected", session_id = %id, conn_id = %conn_id);
                }
            }
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, entry)| match entry.status {
                    SessionStatus::Disconnected { expires_at } => expires_at <= now,
                    SessionStatus::Active { .. } => false,
                })
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| sessions.remove(id))
                .map(|entry| entry.handle)
                .collect()
        };
        for handle in expired {
            self.dispose(&handle, "expired").await;
        }
    }

    async fn dispose(&self, handle: &SessionHandle, reason: &str) {
        handle.close().await;
        self.pubsub.unsubscribe_all(handle.id());
        info!(event = "session_disposed", session_id = handle.id(), reason);
    }

    pub async fn get(&self, id: &str) -> Option<SessionHandle> {
        self.sessions
            .read()
            .await
            .get(id)
            .map(|entry| entry.handle.clone())
    }

    pub async fn state(&self, id: &str) -> Option<SessionState> {
        self.sessions.read().await.get(id).map(|entry| match entry.status {
            SessionStatus::Active { .. } => SessionState::Active,
            SessionStatus::Disconnected { .. } => SessionState::Disconnected,
        })
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

fn reject(conn: &ConnectionHandle, message: String) {
    let response = ServerMessage::RegisterClient(RegisterClientResponse {
        session_id: String::new(),
        page_patch: GraphPatch::default(),
        error: Some(message),
    });
    match response.encode() {
        Ok(payload) => {
            if let Err(err) = conn.try_send(payload) {
                warn!(event = "register_reject_dropped", conn_id = conn.conn_id(), error = %err);
            }
        }
        Err(err) => error!(event = "encode_failed", conn_id = conn.conn_id(), error = %err),
    }
}
