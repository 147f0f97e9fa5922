use clap::Parser;
use ctlsync_core::frame::DEFAULT_MAX_FRAME_BYTES;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_ADDR: &str = "127.0.0.1:8550";
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 3600;

#[derive(Clone, Debug, Serialize)]
pub struct HubConfig {
    pub addr: String,
    pub socket_addr: Option<String>,
    pub uds_path: Option<PathBuf>,
    pub session_timeout: Duration,
    pub sweep_interval: Duration,
    pub write_timeout: Duration,
    pub write_retries: u32,
    pub queue_capacity: usize,
    pub max_frame_bytes: usize,
    pub debug: bool,
    pub log_dir: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            socket_addr: None,
            uds_path: None,
            session_timeout: Duration::from_secs(DEFAULT_SESSION_TIMEOUT_SECS),
            sweep_interval: Duration::from_secs(10),
            write_timeout: Duration::from_secs(2),
            write_retries: 3,
            queue_capacity: 256,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            debug: false,
            log_dir: String::new(),
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "ctlsync-hub")]
pub struct Args {
    /// HTTP/WebSocket listen address.
    #[arg(long, default_value = "")]
    addr: String,
    /// Raw TCP listener for length-prefixed frames.
    #[arg(long, default_value = "")]
    socket: String,
    #[arg(long, default_value = "")]
    uds: String,
    /// Seconds a disconnected session is kept for reconnection.
    #[arg(long)]
    session_timeout: Option<u64>,
    #[arg(long, default_value_t = 10)]
    sweep_interval: u64,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value_t = 3)]
    write_retries: u32,
    #[arg(long, default_value_t = 256)]
    queue_capacity: usize,
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_BYTES)]
    max_frame_bytes: usize,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value = "")]
    log_dir: String,
}

pub fn load_config() -> HubConfig {
    from_args(Args::parse())
}

pub fn from_args(args: Args) -> HubConfig {
    let addr = resolve_value(&args.addr, "CTLSYNC_ADDR").unwrap_or_else(|| DEFAULT_ADDR.to_string());
    let socket_addr = resolve_value(&args.socket, "CTLSYNC_SOCKET_ADDR");
    let uds_path = resolve_value(&args.uds, "CTLSYNC_UDS_PATH").map(PathBuf::from);
    let session_timeout = resolve_session_timeout(args.session_timeout);
    HubConfig {
        addr,
        socket_addr,
        uds_path,
        session_timeout: Duration::from_secs(session_timeout),
        sweep_interval: Duration::from_secs(args.sweep_interval.max(1)),
        write_timeout: Duration::from_secs(args.write_timeout.max(1)),
        write_retries: args.write_retries,
        queue_capacity: args.queue_capacity.max(1),
        max_frame_bytes: args.max_frame_bytes,
        debug: args.debug || env_true("CTLSYNC_DEBUG"),
        log_dir: resolve_value(&args.log_dir, "CTLSYNC_LOG_DIR").unwrap_or_default(),
    }
}

pub(crate) fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn resolve_value(flag: &str, env_key: &str) -> Option<String> {
    if !flag.trim().is_empty() {
        return Some(flag.to_string());
    }
    if let Ok(value) = std::env::var(env_key) {
        if !value.trim().is_empty() {
            return Some(value);
        }
    }
    None
}

fn resolve_session_timeout(flag: Option<u64>) -> u64 {
    if let Some(value) = flag {
        return value;
    }
    std::env::var("CTLSYNC_SESSION_TIMEOUT")
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_SESSION_TIMEOUT_SECS)
}
