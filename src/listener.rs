//! Inbound submission listener.
//!
//! A submission is a short line protocol:
//!
//! ```text
//! app1
//! 600111222=7 600333444
//! report
//! delete
//!
//! Message body,
//! possibly several lines.
//! .
//! ```
//!
//! The server answers with a single line: `OK` or the reason for refusing.

use crate::error::StoreError;
use crate::lifecycle::{Shutdown, Waker};
use crate::models::{NewRecipient, Submission};
use crate::store::Store;
use crate::utils::{check_number, read_line, LineError};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Longest body accepted, in bytes.
pub const MAX_BODY: usize = 64 * 1024;
/// Longest phone number the recipients table holds.
const MAX_NUMBER_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("Unknown source")]
    UnknownSource,
    #[error("Bad phone number")]
    BadNumber,
    #[error("Bad DstId")]
    BadDstId,
    #[error("No recipients")]
    NoRecipients,
    #[error("Unknown option")]
    UnknownOption,
    #[error("Line too long")]
    LineTooLong,
    #[error("Message too long")]
    BodyTooLong,
    #[error("Incomplete message")]
    Incomplete,
    #[error("DB error (can't insert message)")]
    Database,
}

impl From<LineError> for Rejection {
    fn from(err: LineError) -> Self {
        match err {
            LineError::TooLong => Rejection::LineTooLong,
            LineError::Eof => Rejection::Incomplete,
            LineError::Io(e) => {
                debug!("Can't read submission: {}", e);
                Rejection::Incomplete
            }
        }
    }
}

/// Everything a connection handler needs.
pub struct ListenerContext {
    pub store: Arc<dyn Store>,
    pub waker: Waker,
    pub sources: Vec<String>,
    pub unknown_source_delay: Duration,
    /// Store errors that should take the daemon down.
    pub fatal: mpsc::UnboundedSender<StoreError>,
}

/// Parses `number[=dstId] number[=dstId] ...`.
pub fn parse_recipients(line: &str) -> Result<Vec<NewRecipient>, Rejection> {
    let recipients = line
        .split_whitespace()
        .map(|item| {
            let (number, dst_id) = match item.split_once('=') {
                Some((number, dst_id)) => (number, Some(dst_id)),
                None => (item, None),
            };
            if number.len() > MAX_NUMBER_LEN || !check_number(number) {
                return Err(Rejection::BadNumber);
            }
            let destination_id = match dst_id {
                Some(id) => id.parse::<u32>().map_err(|_| Rejection::BadDstId)?,
                None => 0,
            };
            Ok(NewRecipient {
                number: number.to_string(),
                destination_id: i64::from(destination_id),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    if recipients.is_empty() {
        return Err(Rejection::NoRecipients);
    }
    Ok(recipients)
}

/// Reads one submission. Stops at the first problem.
pub async fn read_submission<R>(reader: &mut R, sources: &[String]) -> Result<Submission, Rejection>
where
    R: AsyncBufRead + Unpin,
{
    let source = read_line(reader).await?.trim().to_string();
    if !sources.iter().any(|s| *s == source) {
        return Err(Rejection::UnknownSource);
    }

    let recipients = parse_recipients(&read_line(reader).await?)?;

    let mut report = false;
    let mut delete_when_done = false;
    loop {
        let line = read_line(reader).await?;
        match line.trim() {
            "" => break,
            "report" => report = true,
            "delete" => delete_when_done = true,
            other => {
                debug!(option = %other, "Unknown option");
                return Err(Rejection::UnknownOption);
            }
        }
    }

    let mut body = String::new();
    loop {
        let line = read_line(reader).await?;
        if line == "." {
            break;
        }
        if !body.is_empty() {
            body.push('\n');
        }
        body.push_str(&line);
        if body.len() > MAX_BODY {
            return Err(Rejection::BodyTooLong);
        }
    }

    Ok(Submission {
        source,
        recipients,
        report,
        delete_when_done,
        body,
    })
}

/// Serves one client connection: read, store, reply, wake the scheduler.
pub async fn handle_connection<S>(stream: S, ctx: Arc<ListenerContext>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (rd, mut wr) = tokio::io::split(stream);
    let mut reader = BufReader::new(rd);

    let reply = match read_submission(&mut reader, &ctx.sources).await {
        Ok(submission) => match ctx.store.insert_submission(&submission).await {
            Ok(id) => {
                info!(
                    message_id = id,
                    source = %submission.source,
                    recipients = submission.recipients.len(),
                    "Message queued."
                );
                ctx.waker.wake();
                "OK".to_string()
            }
            Err(e) => {
                error!(source = %submission.source, "Can't insert message into outbox: {}", e);
                if !e.is_transient() {
                    let _ = ctx.fatal.send(e);
                }
                Rejection::Database.to_string()
            }
        },
        Err(Rejection::UnknownSource) => {
            warn!("Submission from unknown source");
            tokio::time::sleep(ctx.unknown_source_delay).await;
            Rejection::UnknownSource.to_string()
        }
        Err(rejection) => {
            warn!(%rejection, "Submission refused");
            rejection.to_string()
        }
    };

    if let Err(e) = wr.write_all(format!("{reply}\n").as_bytes()).await {
        debug!("Can't send reply: {}", e);
        return;
    }
    let _ = wr.shutdown().await;
}

/// A bound listening socket: TCP for `host:port`, otherwise a unix socket path.
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener, std::path::PathBuf),
}

impl Listener {
    pub async fn bind(addr: &str) -> io::Result<Self> {
        if addr.contains(':') {
            return Ok(Listener::Tcp(TcpListener::bind(addr).await?));
        }
        Self::bind_unix(addr)
    }

    #[cfg(unix)]
    fn bind_unix(addr: &str) -> io::Result<Self> {
        let path = std::path::PathBuf::from(addr);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(Listener::Unix(UnixListener::bind(&path)?, path))
    }

    #[cfg(not(unix))]
    fn bind_unix(_addr: &str) -> io::Result<Self> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "unix sockets are not supported on this platform",
        ))
    }

    pub fn describe(&self) -> String {
        match self {
            Listener::Tcp(l) => match l.local_addr() {
                Ok(addr) => format!("tcp:{addr}"),
                Err(_) => "tcp:?".to_string(),
            },
            #[cfg(unix)]
            Listener::Unix(_, path) => format!("unix:{}", path.display()),
        }
    }

    async fn accept_one(&self, ctx: &Arc<ListenerContext>) -> io::Result<()> {
        match self {
            Listener::Tcp(l) => {
                let (stream, peer) = l.accept().await?;
                debug!(%peer, "Connection accepted");
                tokio::spawn(handle_connection(stream, ctx.clone()));
            }
            #[cfg(unix)]
            Listener::Unix(l, _) => {
                let (stream, _) = l.accept().await?;
                debug!("Connection accepted");
                tokio::spawn(handle_connection(stream, ctx.clone()));
            }
        }
        Ok(())
    }

    /// Accepts connections until shutdown, then closes the socket.
    pub async fn run(self, ctx: Arc<ListenerContext>, mut shutdown: Shutdown) {
        let name = self.describe();
        info!(listen = %name, "Listening for submissions");
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                accepted = self.accept_one(&ctx) => {
                    if let Err(e) = accepted {
                        warn!(listen = %name, "Can't accept connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
        #[cfg(unix)]
        let socket_path = match &self {
            Listener::Unix(_, path) => Some(path.clone()),
            Listener::Tcp(_) => None,
        };
        drop(self);
        #[cfg(unix)]
        if let Some(path) = socket_path {
            let _ = std::fs::remove_file(path);
        }
        info!(listen = %name, "Listener stopped");
    }
}
