//! Log output: stderr by default, or a file that survives rotation.

use crate::lifecycle::Shutdown;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
#[cfg(unix)]
use tokio::signal::unix::{Signal, SignalKind, signal};
#[cfg(unix)]
use tokio::task::JoinHandle;
use tracing::{Level, error, info};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Append-only log file. Clones share the handle, so `reopen` is seen by
/// every writer after logrotate moved the old file away.
#[derive(Debug, Clone)]
pub struct LogFile {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl LogFile {
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = open_append(&path)?;
        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn reopen(&self) -> io::Result<()> {
        let file = open_append(&self.path)?;
        *lock(&self.file) = file;
        Ok(())
    }
}

// A panic while logging must not silence the log for good.
fn lock(file: &Mutex<File>) -> MutexGuard<'_, File> {
    file.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct LogFileWriter {
    file: Arc<Mutex<File>>,
}

impl Write for LogFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        lock(&self.file).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        lock(&self.file).flush()
    }
}

impl<'a> MakeWriter<'a> for LogFile {
    type Writer = LogFileWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogFileWriter {
            file: self.file.clone(),
        }
    }
}

/// Installs the global subscriber. Sentry only sees events when its client
/// was initialised beforehand.
pub fn init(log_file: Option<LogFile>, with_sentry: bool) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let ansi = log_file.is_none();
    let writer = match log_file {
        Some(file) => BoxMakeWriter::new(file),
        None => BoxMakeWriter::new(io::stderr),
    };
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_ansi(ansi)
        .with_writer(writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(with_sentry.then(sentry::integrations::tracing::layer))
        .init();
}

/// Takes over SIGHUP until shutdown: each one reopens `log_file`. Without a
/// log file the signal is only logged, so it never terminates the process.
#[cfg(unix)]
pub fn watch_hangup(log_file: Option<LogFile>, shutdown: Shutdown) -> io::Result<JoinHandle<()>> {
    let hangup = signal(SignalKind::hangup())?;
    Ok(tokio::spawn(reopen_on_hangup(hangup, log_file, shutdown)))
}

#[cfg(unix)]
async fn reopen_on_hangup(mut hangup: Signal, log_file: Option<LogFile>, mut shutdown: Shutdown) {
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            received = hangup.recv() => {
                if received.is_none() {
                    break;
                }
                let Some(log_file) = &log_file else {
                    info!("SIGHUP received, logging to stderr");
                    continue;
                };
                match log_file.reopen() {
                    Ok(()) => info!(path = %log_file.path().display(), "Log file reopened"),
                    Err(e) => error!(path = %log_file.path().display(), "Can't reopen log file: {}", e),
                }
            }
        }
    }
}
