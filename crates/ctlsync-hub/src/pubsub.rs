//! In-process publish/subscribe between sessions.
//!
//! Subscriptions are keyed by session id, optionally under a topic. Delivery
//! never runs a handler inside the publisher: each matching handler is
//! scheduled on the subscribing session's supervisor, or on the runtime for
//! subscribers registered without a session.

use crate::session::SessionHandle;
use ctlsync_core::Value;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

pub type PubSubHandler =
    Arc<dyn Fn(PubSubMessage) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct PubSubMessage {
    /// `None` for messages sent with `send_all`/`send_others`.
    pub topic: Option<String>,
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Where a delivered handler runs.
#[derive(Clone)]
pub enum Scheduler {
    Runtime,
    Session(SessionHandle),
}

impl Scheduler {
    fn schedule(&self, job: BoxFuture<'static, anyhow::Result<()>>) -> bool {
        match self {
            Scheduler::Runtime => {
                tokio::spawn(async move {
                    if let Err(err) = job.await {
                        warn!(event = "pubsub_handler_failed", error = %err);
                    }
                });
                true
            }
            Scheduler::Session(session) => session.spawn(job),
        }
    }
}

#[derive(Clone)]
struct Subscription {
    handler: PubSubHandler,
    scheduler: Scheduler,
}

type SubscriptionSet = HashMap<SubscriptionId, Subscription>;

#[derive(Default)]
struct Tables {
    by_session: HashMap<String, SubscriptionSet>,
    by_topic: HashMap<String, HashMap<String, SubscriptionSet>>,
}

struct Inner {
    tables: Mutex<Tables>,
    next_id: AtomicU64,
}

/// Process-wide registry. Cheap to clone.
#[derive(Clone)]
pub struct PubSubHub {
    inner: Arc<Inner>,
}

impl Default for PubSubHub {
    fn default() -> Self {
        Self::new()
    }
}

impl PubSubHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                tables: Mutex::new(Tables::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn subscribe(
        &self,
        session_id: &str,
        handler: PubSubHandler,
        scheduler: Scheduler,
    ) -> SubscriptionId {
        let id = self.next_id();
        self.inner
            .tables
            .lock()
            .by_session
            .entry(session_id.to_string())
            .or_default()
            .insert(id, Subscription { handler, scheduler });
        debug!(event = "pubsub_subscribe", session_id, subscription = %id);
        id
    }

    pub fn subscribe_topic(
        &self,
        session_id: &str,
        topic: &str,
        handler: PubSubHandler,
        scheduler: Scheduler,
    ) -> SubscriptionId {
        let id = self.next_id();
        self.inner
            .tables
            .lock()
            .by_topic
            .entry(topic.to_string())
            .or_default()
            .entry(session_id.to_string())
            .or_default()
            .insert(id, Subscription { handler, scheduler });
        debug!(event = "pubsub_subscribe_topic", session_id, topic, subscription = %id);
        id
    }

    /// Drops the session's topic-less subscriptions.
    pub fn unsubscribe(&self, session_id: &str) {
        self.inner.tables.lock().by_session.remove(session_id);
    }

    pub fn unsubscribe_topic(&self, session_id: &str, topic: &str) {
        let mut tables = self.inner.tables.lock();
        let now_empty = match tables.by_topic.get_mut(topic) {
            Some(sessions) => {
                sessions.remove(session_id);
                sessions.is_empty()
            }
            None => false,
        };
        if now_empty {
            tables.by_topic.remove(topic);
        }
    }

    pub fn unsubscribe_all(&self, session_id: &str) {
        let mut tables = self.inner.tables.lock();
        tables.by_session.remove(session_id);
        tables.by_topic.retain(|_, sessions| {
            sessions.remove(session_id);
            !sessions.is_empty()
        });
    }

    pub fn send_all(&self, payload: Value) -> usize {
        let targets = self.collect(None, None);
        self.deliver(targets, None, payload)
    }

    pub fn send_all_on_topic(&self, topic: &str, payload: Value) -> usize {
        let targets = self.collect(Some(topic), None);
        self.deliver(targets, Some(topic), payload)
    }

    pub fn send_others(&self, except_session: &str, payload: Value) -> usize {
        let targets = self.collect(None, Some(except_session));
        self.deliver(targets, None, payload)
    }

    pub fn send_others_on_topic(&self, except_session: &str, topic: &str, payload: Value) -> usize {
        let targets = self.collect(Some(topic), Some(except_session));
        self.deliver(targets, Some(topic), payload)
    }

    pub fn subscription_count(&self, session_id: &str) -> usize {
        let tables = self.inner.tables.lock();
        let plain = tables.by_session.get(session_id).map_or(0, |set| set.len());
        let topical: usize = tables
            .by_topic
            .values()
            .filter_map(|sessions| sessions.get(session_id))
            .map(|set| set.len())
            .sum();
        plain + topical
    }

    /// Snapshot of matching subscriptions so no lock is held while scheduling.
    fn collect(&self, topic: Option<&str>, except: Option<&str>) -> Vec<Subscription> {
        let tables = self.inner.tables.lock();
        let sessions = match topic {
            None => Some(&tables.by_session),
            Some(topic) => tables.by_topic.get(topic),
        };
        let Some(sessions) = sessions else {
            return Vec::new();
        };
        let mut ids: Vec<(&String, &SubscriptionSet)> = sessions
            .iter()
            .filter(|(session_id, _)| Some(session_id.as_str()) != except)
            .collect();
        ids.sort_by(|a, b| a.0.cmp(b.0));
        ids.into_iter()
            .flat_map(|(_, set)| {
                let mut subs: Vec<_> = set.iter().collect();
                subs.sort_by_key(|(id, _)| **id);
                subs.into_iter().map(|(_, sub)| sub.clone())
            })
            .collect()
    }

    fn deliver(&self, targets: Vec<Subscription>, topic: Option<&str>, payload: Value) -> usize {
        let mut delivered = 0;
        for subscription in targets {
            let message = PubSubMessage {
                topic: topic.map(str::to_string),
                payload: payload.clone(),
            };
            let handler = subscription.handler.clone();
            let job = async move { handler(message).await }.boxed();
            if subscription.scheduler.schedule(job) {
                delivered += 1;
            }
        }
        delivered
    }
}

/// Session-scoped view of the hub.
#[derive(Clone)]
pub struct PubSubClient {
    hub: PubSubHub,
    session: SessionHandle,
}

impl PubSubClient {
    pub(crate) fn new(hub: PubSubHub, session: SessionHandle) -> Self {
        Self { hub, session }
    }

    pub fn subscribe(&self, handler: PubSubHandler) -> SubscriptionId {
        self.hub.subscribe(
            self.session.id(),
            handler,
            Scheduler::Session(self.session.clone()),
        )
    }

    pub fn subscribe_topic(&self, topic: &str, handler: PubSubHandler) -> SubscriptionId {
        self.hub.subscribe_topic(
            self.session.id(),
            topic,
            handler,
            Scheduler::Session(self.session.clone()),
        )
    }

    pub fn unsubscribe(&self) {
        self.hub.unsubscribe(self.session.id());
    }

    pub fn unsubscribe_topic(&self, topic: &str) {
        self.hub.unsubscribe_topic(self.session.id(), topic);
    }

    pub fn unsubscribe_all(&self) {
        self.hub.unsubscribe_all(self.session.id());
    }

    pub fn send_all(&self, payload: impl Into<Value>) -> usize {
        self.hub.send_all(payload.into())
    }

    pub fn send_all_on_topic(&self, topic: &str, payload: impl Into<Value>) -> usize {
        self.hub.send_all_on_topic(topic, payload.into())
    }

    pub fn send_others(&self, payload: impl Into<Value>) -> usize {
        self.hub.send_others(self.session.id(), payload.into())
    }

    pub fn send_others_on_topic(&self, topic: &str, payload: impl Into<Value>) -> usize {
        self.hub
            .send_others_on_topic(self.session.id(), topic, payload.into())
    }
}
