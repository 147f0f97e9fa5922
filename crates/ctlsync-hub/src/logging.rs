use crate::config::HubConfig;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

pub const LOG_FILE_NAME: &str = "ctlsync-hub.log";

/// Append-only copy of the log on disk.
struct FileSink {
    path: PathBuf,
    file: Mutex<File>,
    failed_writes: AtomicU64,
}

impl FileSink {
    fn record(&self, buf: &[u8]) {
        let result = {
            let mut file = self.file.lock();
            file.write_all(buf).and_then(|()| file.flush())
        };
        if let Err(err) = result {
            // stdout still carries the line; only the first failure is reported
            if self.failed_writes.fetch_add(1, Ordering::Relaxed) == 0 {
                eprintln!("log_file_write_failed path={} error={err}", self.path.display());
            }
        }
    }
}

/// Keeps the optional log file open for the lifetime of the process.
pub struct LogGuard {
    sink: Option<Arc<FileSink>>,
}

impl LogGuard {
    pub fn has_file(&self) -> bool {
        self.sink.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.sink.as_deref().map(|sink| sink.path.as_path())
    }

    /// Lines that reached stdout but not the log file.
    pub fn failed_writes(&self) -> u64 {
        self.sink
            .as_ref()
            .map(|sink| sink.failed_writes.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

/// Hands out one writer per event: stdout, plus the file when configured.
#[derive(Clone)]
struct HubLogWriter {
    sink: Option<Arc<FileSink>>,
}

impl<'a> MakeWriter<'a> for HubLogWriter {
    type Writer = EventWriter;

    fn make_writer(&'a self) -> Self::Writer {
        EventWriter {
            stdout: io::stdout(),
            sink: self.sink.clone(),
        }
    }
}

struct EventWriter {
    stdout: io::Stdout,
    sink: Option<Arc<FileSink>>,
}

impl Write for EventWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(sink) = &self.sink {
            sink.record(buf);
        }
        self.stdout.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stdout.flush()
    }
}

pub fn init_logging(config: &HubConfig) -> Option<LogGuard> {
    let level = if config.debug {
        "debug".to_string()
    } else {
        std::env::var("CTLSYNC_LOG_LEVEL").unwrap_or_else(|_| "info".to_string())
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let guard = open_log_file(&config.log_dir).unwrap_or_else(|err| {
        eprintln!("log_file_error dir={} error={err}", config.log_dir);
        LogGuard { sink: None }
    });
    let writer = HubLogWriter {
        sink: guard.sink.clone(),
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok()?;
    Some(guard)
}

fn open_log_file(log_dir: &str) -> io::Result<LogGuard> {
    let log_dir = log_dir.trim();
    if log_dir.is_empty() {
        return Ok(LogGuard { sink: None });
    }
    std::fs::create_dir_all(log_dir)?;
    let path = Path::new(log_dir).join(LOG_FILE_NAME);
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok(LogGuard {
        sink: Some(Arc::new(FileSink {
            path,
            file: Mutex::new(file),
            failed_writes: AtomicU64::new(0),
        })),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_log_dir_means_stdout_only() {
        let guard = open_log_file("  ").expect("open");
        assert!(!guard.has_file());
        assert_eq!(guard.failed_writes(), 0);
    }

    #[test]
    fn log_file_is_created_and_appended() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("logs");
        let guard = open_log_file(nested.to_str().expect("utf8 path")).expect("open");
        assert_eq!(guard.path(), Some(nested.join(LOG_FILE_NAME).as_path()));

        let writer = HubLogWriter {
            sink: guard.sink.clone(),
        };
        let mut event = writer.make_writer();
        event.write_all(b"hub_start\n").expect("write");
        event.flush().expect("flush");
        let text = std::fs::read_to_string(nested.join(LOG_FILE_NAME)).expect("read");
        assert!(text.contains("hub_start"));
        assert_eq!(guard.failed_writes(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn failed_file_writes_are_counted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let guard = LogGuard {
            sink: Some(Arc::new(FileSink {
                path: dir.path().join(LOG_FILE_NAME),
                // writes to a read-only handle fail
                file: Mutex::new(File::open("/dev/null").expect("open")),
                failed_writes: AtomicU64::new(0),
            })),
        };
        let writer = HubLogWriter {
            sink: guard.sink.clone(),
        };
        let mut event = writer.make_writer();
        event.write_all(b"one\n").expect("stdout still written");
        event.write_all(b"two\n").expect("stdout still written");
        assert_eq!(guard.failed_writes(), 2);
    }
}
