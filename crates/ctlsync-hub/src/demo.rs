//! Counter page served by the binary: a label, two buttons and a shared
//! activity line fed through pub/sub.

use crate::pubsub::PubSubHandler;
use crate::session::{App, SessionHandle, EVENT_CLOSE};
use ctlsync_core::{ControlEvent, EventHandler, Node, NodeRef, Schema, Value};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::future::Future;
use std::sync::Arc;
use tracing::info;

pub const ACTIVITY_TOPIC: &str = "counter-activity";

pub struct CounterApp {
    page: Arc<Schema>,
    text: Arc<Schema>,
    button: Arc<Schema>,
    row: Arc<Schema>,
}

impl Default for CounterApp {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterApp {
    pub fn new() -> Self {
        Self {
            page: Schema::builder("page")
                .value("title")
                .value("route")
                .value("width")
                .value("height")
                .children("controls")
                .link("focused")
                .build(),
            text: Schema::builder("text").value("value").value("updated").build(),
            button: Schema::builder("button").value("text").build(),
            row: Schema::builder("row").children("controls").build(),
        }
    }

    pub fn schemas(&self) -> Vec<Arc<Schema>> {
        vec![
            self.page.clone(),
            self.text.clone(),
            self.button.clone(),
            self.row.clone(),
        ]
    }

    fn button(&self, text: &str, on_click: EventHandler) -> anyhow::Result<NodeRef> {
        let button = Node::new(&self.button);
        button.set("text", text)?;
        button.on("click", on_click);
        Ok(button)
    }
}

fn on<F, Fut>(f: F) -> EventHandler
where
    F: Fn(ControlEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |event| f(event).boxed())
}

fn step_handler(session: &SessionHandle, counter: &NodeRef, delta: i64) -> EventHandler {
    let session = session.clone();
    let counter = counter.clone();
    on(move |_| {
        let session = session.clone();
        let counter = counter.clone();
        async move {
            let current = counter
                .get("value")
                .and_then(|value| value.as_i64())
                .unwrap_or(0);
            counter.set("value", current + delta)?;
            counter.set("updated", chrono::Utc::now())?;
            session
                .pubsub()
                .send_others_on_topic(ACTIVITY_TOPIC, format!("{} moved {delta:+}", session.id()));
            Ok(())
        }
    })
}

impl App for CounterApp {
    fn build_page(&self, session: &SessionHandle) -> anyhow::Result<NodeRef> {
        let page = Node::new(&self.page);
        page.set("title", "Counter")?;

        let counter = Node::new(&self.text);
        counter.set("value", 0)?;
        let activity = Node::new(&self.text);
        activity.set("value", "")?;

        let row = Node::new(&self.row);
        row.push_child("controls", self.button("-", step_handler(session, &counter, -1))?)?;
        row.push_child("controls", self.button("+", step_handler(session, &counter, 1))?)?;

        page.push_child("controls", counter.clone())?;
        page.push_child("controls", row)?;
        page.push_child("controls", activity.clone())?;
        page.set_link("focused", Some(&counter))?;

        let id = session.id().to_string();
        page.on(
            EVENT_CLOSE,
            on(move |_| {
                let id = id.clone();
                async move {
                    info!(event = "counter_page_closed", session_id = %id);
                    Ok(())
                }
            }),
        );
        Ok(page)
    }

    fn on_session_created(&self, session: SessionHandle) -> BoxFuture<'static, anyhow::Result<()>> {
        async move {
            let Some(page) = session.page() else {
                return Ok(());
            };
            let Some(activity) = page.children("controls").last().cloned() else {
                return Ok(());
            };
            let handler: PubSubHandler = Arc::new(move |message| {
                let activity = activity.clone();
                async move {
                    activity.set("value", message.payload)?;
                    Ok(())
                }
                .boxed()
            });
            session.pubsub().subscribe_topic(ACTIVITY_TOPIC, handler);
            Ok(())
        }
        .boxed()
    }
}
