//! Session hub: serves control-graph pages to remote clients over
//! WebSocket, TCP or Unix sockets and keeps each client in sync with
//! incremental patches.

pub mod config;
pub mod connection;
pub mod demo;
pub mod logging;
pub mod manager;
pub mod pubsub;
pub mod server;
pub mod session;

pub use config::{load_config, HubConfig};
pub use manager::{SessionManager, SessionState};
pub use pubsub::{PubSubClient, PubSubHub, PubSubMessage};
pub use server::{run, Hub};
pub use session::{App, InvokeError, SessionHandle};
