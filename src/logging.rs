use std::{
    io,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use bytes::Bytes;
use tokio::sync::RwLock;
use tracing::{debug, info, metadata::LevelFilter, trace, Level};
use tracing_appender::{
    non_blocking::{NonBlocking, WorkerGuard},
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{fmt::MakeWriter, prelude::*};

use crate::hub::HubHandle;

/// Writes formatted log lines to the hub, one publish per event.
#[derive(Debug, Clone)]
pub struct HubWriter(HubHandle);

impl HubWriter {
    /// Publish log output on this hub.
    pub fn new(hub: HubHandle) -> Self {
        Self(hub)
    }
}

impl io::Write for HubWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let line = buf.strip_suffix(b"\n").unwrap_or(buf);

        if !line.is_empty() {
            self.0.publish(Bytes::copy_from_slice(line));
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for HubWriter {
    type Writer = HubWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Keeps the file writer's worker alive until [`shutdown`].
static FILE_GUARD: Mutex<Option<WorkerGuard>> = Mutex::new(None);

/// The file name prefix of the daily log files.
pub const LOG_FILE_NAME: &str = "proxy.log";

/// A daily rotated log file written off the calling thread.
/// Lines still buffered are written out when the guard is dropped.
fn file_writer(output_dir: &Path) -> (NonBlocking, WorkerGuard) {
    let file_appender = RollingFileAppender::new(Rotation::DAILY, output_dir, LOG_FILE_NAME);

    tracing_appender::non_blocking(file_appender)
}

fn do_init(stdout_level: Level, file_level: Option<(Level, PathBuf)>, hub: Option<HubHandle>) {
    let mut message = String::from("Logging with:");

    // stdout
    message += " stdout";

    let stdout_layer =
        tracing_subscriber::fmt::layer().with_filter(LevelFilter::from(stdout_level));

    let registry = tracing_subscriber::registry().with(stdout_layer);

    let maybe_file_layer = if let Some((level, output_dir)) = file_level {
        message += &format!(", file (in dir {output_dir:?})");

        let (writer, guard) = file_writer(&output_dir);
        FILE_GUARD
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(guard);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_filter(LevelFilter::from(level));
        Some(file_layer)
    } else {
        None
    };

    let maybe_hub_layer = hub.map(|hub| {
        message += ", log stream";

        tracing_subscriber::fmt::layer()
            .with_writer(HubWriter::new(hub))
            .with_ansi(false)
            .with_filter(LevelFilter::from(stdout_level))
    });

    registry.with(maybe_file_layer).with(maybe_hub_layer).init();

    debug!(message);
}

/// Initialize tracing.
///
/// Will only initialize once, so tests may call this.
pub async fn init(
    stdout_level: Level,
    file_logging: Option<(Level, PathBuf)>,
    hub: Option<HubHandle>,
) {
    static TRACING_IS_INITIALIZED: RwLock<bool> = RwLock::const_new(false);

    let initialized = { *TRACING_IS_INITIALIZED.read().await };

    if !initialized {
        let mut initialized = TRACING_IS_INITIALIZED.write().await;

        // To avoid race condition between the `.read()` and the
        // `.write()`.
        if *initialized {
            return;
        }

        do_init(stdout_level, file_logging, hub);

        *initialized = true;
    }

    info!("Logging initialized");
}

/// Parse a level such as "info" or "DEBUG".
pub fn parse_level(level: &str) -> Option<Level> {
    level.parse().ok()
}

/// Write out log lines still buffered for the log file.
/// Logging to the file stops here, call this right before exiting.
pub fn shutdown() {
    trace!("Shutting down");

    let guard = FILE_GUARD
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();

    // Dropping the guard blocks until the file writer is done.
    drop(guard);
}

#[cfg(test)]
mod tests {
    use std::{io::Write, time::Duration};

    use pretty_assertions::assert_eq;
    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn writer_publishes_without_trailing_newline() {
        let hub = HubHandle::spawn(8);
        let mut subscription = hub.subscribe();
        let mut writer = HubWriter::new(hub.clone()).make_writer();

        writer.write_all(b"2024-01-01 INFO hello\n").unwrap();
        writer.write_all(b"\n").unwrap();
        writer.write_all(b"second").unwrap();

        let first = timeout(Duration::from_secs(1), subscription.recv())
            .await
            .unwrap()
            .unwrap();
        let second = timeout(Duration::from_secs(1), subscription.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(first, Bytes::from("2024-01-01 INFO hello"));
        assert_eq!(second, Bytes::from("second"));
    }

    #[test]
    fn shutdown_flushes_the_log_file() {
        let dir = std::env::temp_dir().join(format!("sv241-logs-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();

        let (mut writer, guard) = file_writer(&dir);
        FILE_GUARD.lock().unwrap().replace(guard);

        writer.write_all(b"last words\n").unwrap();
        shutdown();

        let contents = std::fs::read_dir(&dir)
            .unwrap()
            .map(|entry| std::fs::read_to_string(entry.unwrap().path()).unwrap())
            .collect::<String>();

        assert!(contents.contains("last words"), "{contents:?}");
        assert!(FILE_GUARD.lock().unwrap().is_none());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn levels() {
        assert_eq!(parse_level("info"), Some(Level::INFO));
        assert_eq!(parse_level("DEBUG"), Some(Level::DEBUG));
        assert_eq!(parse_level("loud"), None);
    }
}
