//! Global `tracing` subscriber setup.
//!
//! With a non-zero `logQueSize`, formatted lines are handed to a bounded queue
//! and written to stdout by a background thread. A full queue drops the line
//! instead of stalling the poll thread; the number of dropped lines is
//! reported when the [`LogGuard`] is dropped.

use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};

use tracing::{Level, warn};
use tracing_subscriber::FmtSubscriber;
use tracing_subscriber::fmt::MakeWriter;

use crate::config::Config;

enum Msg {
    Line(Vec<u8>),
    Shutdown,
}

/// Maps the numeric `logLevel` setting onto a [`Level`].
pub fn level(log_level: u8) -> Level {
    match log_level {
        0 => Level::DEBUG,
        1 => Level::INFO,
        2 => Level::WARN,
        _ => Level::ERROR,
    }
}

/// Installs the global subscriber. Returns `None` when logging is disabled
/// or synchronous; otherwise the guard must live until shutdown.
pub fn init(config: &Config) -> anyhow::Result<Option<LogGuard>> {
    if !config.open_log {
        return Ok(None);
    }

    let builder = FmtSubscriber::builder()
        .with_max_level(level(config.log_level))
        .with_target(false)
        .with_level(true)
        .with_thread_names(true);

    if config.log_que_size == 0 {
        builder
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to install log subscriber: {e}"))?;
        return Ok(None);
    }

    let (writer, guard) = queue(config.log_que_size)?;
    builder
        .with_writer(writer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install log subscriber: {e}"))?;
    Ok(Some(guard))
}

/// Creates a queue of `capacity` lines and starts its writer thread.
pub fn queue(capacity: usize) -> io::Result<(QueuedWriter, LogGuard)> {
    let (tx, rx) = mpsc::sync_channel(capacity);
    let dropped = Arc::new(AtomicUsize::new(0));
    let handle = thread::Builder::new()
        .name("log-writer".into())
        .spawn(move || drain(rx, io::stdout()))?;

    let writer = QueuedWriter {
        tx: tx.clone(),
        dropped: Arc::clone(&dropped),
    };
    let guard = LogGuard {
        tx,
        dropped,
        handle: Some(handle),
    };
    Ok((writer, guard))
}

fn drain<W: Write>(rx: Receiver<Msg>, mut out: W) {
    while let Ok(Msg::Line(line)) = rx.recv() {
        // nowhere left to report a failed log write
        let _ = out.write_all(&line);
    }
    let _ = out.flush();
}

/// A [`MakeWriter`] that enqueues each formatted event.
#[derive(Clone)]
pub struct QueuedWriter {
    tx: SyncSender<Msg>,
    dropped: Arc<AtomicUsize>,
}

impl QueuedWriter {
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Write for QueuedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.tx.try_send(Msg::Line(buf.to_vec())) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Disconnected(_)) => io::stderr().write_all(buf)?,
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for QueuedWriter {
    type Writer = QueuedWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Flushes the queue and joins the writer thread on drop.
pub struct LogGuard {
    tx: SyncSender<Msg>,
    dropped: Arc<AtomicUsize>,
    handle: Option<JoinHandle<()>>,
}

impl LogGuard {
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        let dropped = self.dropped();
        if dropped > 0 {
            warn!(dropped, "log queue overflowed");
        }
        // a blocking send, so every queued line is written first
        let _ = self.tx.send(Msg::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for LogGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogGuard").field("dropped", &self.dropped()).finish()
    }
}
